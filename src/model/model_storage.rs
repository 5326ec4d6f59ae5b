//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズ、正規化など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// `.tar.gz` で終わらないパスに拡張子を付ける
pub fn package_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 既存のファイルは上書きする。保存先のパスを返す。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = package_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzipストリームまで閉じる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

/// Tar.gz 内の1エントリを読む
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Vec<u8>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?;
    let json_str = String::from_utf8(bytes).context("metadata.json is not UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entry(tar_gz_path, MODEL_ENTRY)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    // 両方のファイルを読み込む
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに出す
pub fn print_metadata_info(metadata: &ModelMetadata) {
    tracing::info!("=== モデルメタデータ ===");
    tracing::info!("クラス数: {}", metadata.num_classes());
    tracing::info!("クラス: {}", metadata.class_names.join(", "));
    tracing::info!(
        "入力サイズ: {}x{}, 正規化: {:?}",
        metadata.image_size,
        metadata.image_size,
        metadata.normalization
    );
    tracing::info!(
        "バックボーン: MobileNetV2 (幅倍率 {}, ステージ {})",
        metadata.width_multiplier,
        metadata.num_stages
    );
    tracing::info!(
        "パラメータ数: {} (学習対象 {})",
        metadata.total_params,
        metadata.trainable_params
    );
    match &metadata.augmentation {
        Some(aug) => tracing::info!("データ拡張: {:?}", aug),
        None => tracing::info!("データ拡張: なし（推論用グラフ）"),
    }
    tracing::info!("学習エポック数: {}", metadata.num_epochs);
    if let Some(acc) = metadata.test_accuracy {
        tracing::info!("テスト精度: {:.4}", acc);
    }
    tracing::info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::NormalizationStrategy;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            vec!["0_alif".to_string(), "1_ba".to_string()],
            224,
            NormalizationStrategy::Symmetric,
            1.0,
            7,
            0.2,
            100,
            80,
            3,
        )
    }

    #[test]
    fn test_package_path_extension() {
        assert_eq!(
            package_path(Path::new("out/sign_classifier")),
            PathBuf::from("out/sign_classifier.tar.gz")
        );
        assert_eq!(
            package_path(Path::new("out/sign_classifier.tar.gz")),
            PathBuf::from("out/sign_classifier.tar.gz")
        );
    }

    #[test]
    fn test_save_and_load_package() {
        let dir = tempfile::tempdir().unwrap();
        let binary = vec![1u8, 2, 3, 4, 5];
        let original = metadata();
        let path =
            save_model_with_metadata(&dir.path().join("nested/model"), &original, &binary).unwrap();
        assert!(path.ends_with("nested/model.tar.gz"));

        assert_eq!(load_metadata(&path).unwrap(), original);
        assert_eq!(load_model_binary(&path).unwrap(), binary);

        let (meta, bin) = load_model_with_metadata(&path).unwrap();
        assert_eq!(meta, original);
        assert_eq!(bin, binary);
    }

    #[test]
    fn test_overwrite_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("model.tar.gz");
        save_model_with_metadata(&target, &metadata(), &[1, 1]).unwrap();
        save_model_with_metadata(&target, &metadata(), &[9, 9, 9]).unwrap();
        assert_eq!(load_model_binary(&target).unwrap(), vec![9, 9, 9]);
    }

    #[test]
    fn test_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tar.gz");
        let file = File::create(&path).unwrap();
        let builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder.into_inner().unwrap().finish().unwrap();

        let err = load_model_binary(&path).unwrap_err();
        assert!(err.to_string().contains("model.bin"));
        assert!(load_metadata(&path).is_err());
    }
}
