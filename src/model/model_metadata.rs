//! モデルメタデータの定義
//!
//! tar.gz パッケージ内の `metadata.json` として重みと一緒に保存します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dataset::NormalizationStrategy;
use crate::model::config::AugmentationSettings;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスID順のクラス名
    /// 例: ["0_alif", "1_ba", ..., "27_ya"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形、ピクセル）
    pub image_size: u32,

    /// 入力正規化（グラフ内で適用、入力は [0,1]）
    pub normalization: NormalizationStrategy,

    /// バックボーンのチャネル幅倍率
    pub width_multiplier: f64,

    /// 使用したMobileNetV2ステージ数
    pub num_stages: usize,

    /// ドロップアウト率
    pub dropout: f64,

    /// 学習時のデータ拡張（学習グラフのパッケージのみ）
    #[serde(default)]
    pub augmentation: Option<AugmentationSettings>,

    /// 総パラメータ数
    pub total_params: usize,

    /// ファインチューニング時の学習対象パラメータ数
    pub trainable_params: usize,

    /// 実際に回した学習エポック数（両フェーズ合計）
    pub num_epochs: u32,

    /// テスト精度
    #[serde(default)]
    pub test_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class_names: Vec<String>,
        image_size: u32,
        normalization: NormalizationStrategy,
        width_multiplier: f64,
        num_stages: usize,
        dropout: f64,
        total_params: usize,
        trainable_params: usize,
        num_epochs: u32,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            image_size,
            normalization,
            width_multiplier,
            num_stages,
            dropout,
            augmentation: None,
            total_params,
            trainable_params,
            num_epochs,
            test_accuracy: None,
            trained_at,
        }
    }

    pub fn with_augmentation(mut self, augmentation: AugmentationSettings) -> Self {
        self.augmentation = Some(augmentation);
        self
    }

    pub fn with_test_accuracy(mut self, accuracy: f64) -> Self {
        self.test_accuracy = Some(accuracy);
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
