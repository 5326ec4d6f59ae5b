//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use crate::dataset::NormalizationStrategy;
use crate::model::model_metadata::ModelMetadata;
use crate::types::ClassCatalog;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスID順のクラス名
    pub catalog: ClassCatalog,

    /// モデル入力解像度
    pub image_size: u32,

    /// グラフ内の入力正規化
    pub normalization: NormalizationStrategy,

    pub width_multiplier: f64,
    pub num_stages: usize,
    pub dropout: f64,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            catalog: ClassCatalog::from_names(metadata.class_names.clone()),
            image_size: metadata.image_size,
            normalization: metadata.normalization,
            width_multiplier: metadata.width_multiplier,
            num_stages: metadata.num_stages,
            dropout: metadata.dropout,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.catalog.len()
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.catalog.name(index)
    }

    /// 設定情報をログに出す
    pub fn print_info(&self) {
        tracing::info!("=== 推論設定 ===");
        tracing::info!("クラス数: {}", self.num_classes());
        tracing::info!("クラス: {}", self.catalog.names().join(", "));
        tracing::info!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        tracing::info!("正規化: {:?}", self.normalization);
        tracing::info!(
            "バックボーン: 幅倍率 {}, ステージ {}, ドロップアウト {}",
            self.width_multiplier,
            self.num_stages,
            self.dropout
        );
    }
}
