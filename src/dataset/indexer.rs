//! データセットディレクトリの走査
//!
//! ルート直下のサブフォルダをクラスとみなし、各フォルダ内の画像ファイルを列挙します。
//! 読み取りのみで、ファイルシステムには何も書き込みません。

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::types::{ClassCatalog, Sample};

/// 受け付ける拡張子（大文字小文字は区別しない）
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 拡張子が許可リストに含まれるか
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// クラスフォルダ内の画像をファイル名順で列挙
pub fn list_class_images(class_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(class_dir)? {
        let path = entry?.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// 走査結果（クラス表とクラスごとの画像パス）
#[derive(Debug, Clone)]
pub struct DatasetIndex {
    catalog: ClassCatalog,
    /// クラスID順の画像パス
    files: Vec<Vec<PathBuf>>,
}

impl DatasetIndex {
    /// ルートディレクトリを走査する
    ///
    /// `expected_classes` が空でなければ、そのすべてがフォルダとして存在する必要がある。
    pub fn scan(root: &Path, expected_classes: &[String]) -> Result<Self> {
        if !root.is_dir() {
            return Err(PipelineError::EmptyDataset(format!(
                "ディレクトリが存在しません: {}",
                root.display()
            )));
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!("不正なフォルダ名をスキップします: {}", path.display());
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            class_names.push(name.to_string());
        }

        if class_names.is_empty() {
            return Err(PipelineError::EmptyDataset(format!(
                "クラスフォルダが見つかりません: {}",
                root.display()
            )));
        }

        let missing: Vec<&str> = expected_classes
            .iter()
            .filter(|name| !class_names.contains(name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::EmptyDataset(format!(
                "クラスフォルダがありません: {}",
                missing.join(", ")
            )));
        }

        let catalog = ClassCatalog::from_names(class_names);
        let mut files = Vec::with_capacity(catalog.len());
        for name in catalog.names() {
            files.push(list_class_images(&root.join(name))?);
        }

        let index = Self { catalog, files };

        if index.total() == 0 {
            return Err(PipelineError::EmptyDataset(format!(
                "画像が1枚も見つかりません: {}",
                root.display()
            )));
        }
        if let Some(label) = index.files.iter().position(Vec::is_empty) {
            return Err(PipelineError::EmptyClass {
                class_name: index.catalog.names()[label].clone(),
            });
        }

        tracing::info!(
            "{} クラス, 合計 {} 枚を検出しました: {}",
            index.catalog.len(),
            index.total(),
            root.display()
        );
        for (name, count) in index.catalog.names().iter().zip(index.counts()) {
            tracing::debug!("  クラス '{}': {} 枚", name, count);
        }

        Ok(index)
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    /// クラスID順の画像パス
    pub fn files(&self) -> &[Vec<PathBuf>] {
        &self.files
    }

    pub fn counts(&self) -> Vec<usize> {
        self.files.iter().map(Vec::len).collect()
    }

    pub fn total(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// 元のサンプル列（クラスID順、各クラス内はファイル名順）
    pub fn samples(&self) -> Vec<Sample> {
        self.files
            .iter()
            .enumerate()
            .flat_map(|(label, paths)| {
                paths.iter().map(move |path| Sample::new(path.clone(), label))
            })
            .collect()
    }
}
