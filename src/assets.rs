//! Web表示用のサンプル画像の同期
//!
//! クラスフォルダごとに先頭の画像を1枚だけ `<dest>/<名前><拡張子>` にコピーします。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::dataset::list_class_images;

/// フォルダ名から表示用の名前を作る（`0_alif` → `alif`）
pub fn clean_asset_name(class_name: &str) -> String {
    class_name
        .split('_')
        .nth(1)
        .unwrap_or(class_name)
        .to_lowercase()
}

/// 同期結果
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// コピーした画像のパス
    pub copied: Vec<PathBuf>,
    /// 画像が無かったクラス
    pub missing: Vec<String>,
}

/// データセットの各クラスから代表画像をコピー
pub fn sync_assets(dataset_dir: &Path, dest_dir: &Path) -> Result<SyncReport> {
    if !dest_dir.exists() {
        std::fs::create_dir_all(dest_dir)
            .with_context(|| format!("Failed to create directory: {:?}", dest_dir))?;
        tracing::info!("ディレクトリを作成しました: {}", dest_dir.display());
    }

    let mut classes: Vec<(String, PathBuf)> = std::fs::read_dir(dataset_dir)
        .with_context(|| format!("Failed to read dataset directory: {:?}", dataset_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some((name, path))
        })
        .collect();
    classes.sort();

    tracing::info!("{} クラスを検出しました。サンプルをコピーします", classes.len());

    let mut report = SyncReport::default();
    for (class_name, class_dir) in classes {
        let images = list_class_images(&class_dir)
            .with_context(|| format!("Failed to list images: {:?}", class_dir))?;

        let Some(source) = images.first() else {
            tracing::warn!("  [!] {} に画像がありません", class_name);
            report.missing.push(class_name);
            continue;
        };

        let extension = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let file_name = format!("{}{}", clean_asset_name(&class_name), extension);
        let dest = dest_dir.join(&file_name);

        std::fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy {:?} to {:?}", source, dest))?;
        tracing::info!("  [OK] {} -> {}", class_name, file_name);
        report.copied.push(dest);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::write_class_images;

    #[test]
    fn test_clean_asset_name() {
        assert_eq!(clean_asset_name("0_alif"), "alif");
        assert_eq!(clean_asset_name("26_Ha"), "ha");
        assert_eq!(clean_asset_name("Extra"), "extra");
    }

    #[test]
    fn test_sync_copies_first_image_per_class() {
        let dataset = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_class_images(dataset.path(), "0_alif", 3, 8);
        write_class_images(dataset.path(), "1_ba", 1, 8);
        std::fs::create_dir_all(dataset.path().join("2_ta")).unwrap();
        std::fs::write(dataset.path().join("2_ta").join("notes.txt"), "x").unwrap();

        let gestures = dest.path().join("gestures");
        let report = sync_assets(dataset.path(), &gestures).unwrap();

        assert_eq!(report.copied.len(), 2);
        assert_eq!(report.missing, vec!["2_ta".to_string()]);
        assert!(gestures.join("alif.png").exists());
        assert!(gestures.join("ba.png").exists());

        let expected = std::fs::read(dataset.path().join("0_alif").join("img_000.png")).unwrap();
        assert_eq!(std::fs::read(gestures.join("alif.png")).unwrap(), expected);
    }
}
