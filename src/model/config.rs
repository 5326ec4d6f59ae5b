//! アプリケーション設定管理モジュール
//!
//! データセット・前処理・モデル・学習・エクスポートの設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{NormalizationStrategy, SplitOrder, HIJAIYAH_CLASSES};
use crate::error::PipelineError;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// クラスフォルダを並べたルートディレクトリ
    pub root: String,
    /// 存在しなければならないクラスフォルダ（空なら検査しない）
    #[serde(default)]
    pub expected_classes: Vec<String>,
    /// ランダムシード（バランス調整・分割・シャッフル・拡張で共有）
    pub seed: u64,
    /// 学習データの割合
    pub train_fraction: f64,
    /// 検証データの割合
    pub val_fraction: f64,
    /// テストデータの割合
    pub test_fraction: f64,
    /// オーバーサンプリングと分割の順序
    #[serde(default)]
    pub split_order: SplitOrder,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            root: "dataset".to_string(),
            expected_classes: HIJAIYAH_CLASSES.iter().map(|s| s.to_string()).collect(),
            seed: 42,
            train_fraction: 0.70,
            val_fraction: 0.15,
            test_fraction: 0.15,
            split_order: SplitOrder::default(),
        }
    }
}

/// 前処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSettings {
    /// 入力画像サイズ（正方形、ピクセル）
    pub image_size: u32,
    /// 正規化方式（モデル内の拡張の直後に適用）
    pub normalization: NormalizationStrategy,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            image_size: 224,
            // torchvision の ImageNet 重みに合わせる
            normalization: NormalizationStrategy::ImageNet,
        }
    }
}

/// データ拡張設定（学習時のみ有効）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationSettings {
    /// 回転角の最大値（度、±）
    pub rotation_degrees: f64,
    /// 左右反転を行うか
    pub horizontal_flip: bool,
    /// ズーム率の範囲（±）
    pub zoom_factor: f64,
    /// 明るさの変動幅（±、[0,1]スケール）
    pub brightness: f64,
    /// コントラストの変動幅（±）
    pub contrast: f64,
    /// 平行移動の最大値（画像サイズに対する割合、±）
    pub translation: f64,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            horizontal_flip: true,
            zoom_factor: 0.2,
            brightness: 0.2,
            contrast: 0.2,
            translation: 0.1,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// ドロップアウト率
    pub dropout: f64,
    /// バックボーンのチャネル幅倍率
    pub width_multiplier: f64,
    /// 使用するMobileNetV2ステージ数（最大7）
    pub num_stages: usize,
    /// 事前学習済みバックボーン重みのパス
    ///
    /// `.safetensors` は torchvision の MobileNetV2 state_dict、それ以外は burn レコード。
    #[serde(default)]
    pub backbone_weights: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dropout: 0.2,
            width_multiplier: 1.0,
            num_stages: 7,
            backbone_weights: Some("weights/mobilenet_v2_imagenet.safetensors".to_string()),
        }
    }
}

/// MobileNetV2 の各ステージのブロック数
const STAGE_REPEATS: [usize; 7] = [1, 2, 3, 4, 3, 3, 1];

impl ModelSettings {
    /// 凍結単位となるバックボーンのレイヤー数（stem + ブロック + 最終1x1）
    pub fn backbone_layers(&self) -> usize {
        2 + STAGE_REPEATS.iter().take(self.num_stages).sum::<usize>()
    }
}

/// 1フェーズ分の学習設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// エポック数
    pub epochs: usize,
    /// 学習率
    pub learning_rate: f64,
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// 先読みするバッチ数
    pub prefetch_depth: usize,
    /// ウォームアップ（バックボーン凍結）
    pub warmup: PhaseSettings,
    /// ファインチューニング
    pub fine_tune: PhaseSettings,
    /// ファインチューニング時に凍結したままにする先頭レイヤー数
    pub fine_tune_at: usize,
    /// 早期終了の忍耐エポック数（Noneで無効）
    #[serde(default)]
    pub early_stopping_patience: Option<usize>,
    /// 検証損失が改善しないとき学習率を下げるまでのエポック数
    pub plateau_patience: usize,
    /// 学習率の減衰率
    pub plateau_factor: f64,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// ベストモデルのチェックポイントを保存するか
    pub checkpoint: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            prefetch_depth: 2,
            warmup: PhaseSettings {
                epochs: 10,
                learning_rate: 1e-3,
            },
            fine_tune: PhaseSettings {
                epochs: 40,
                learning_rate: 1e-5,
            },
            fine_tune_at: 12,
            early_stopping_patience: Some(10),
            plateau_patience: 5,
            plateau_factor: 0.2,
            min_learning_rate: 1e-6,
            checkpoint: true,
        }
    }
}

/// 外部変換ツールの設定
///
/// `args` 中の `{input}` と `{output}` はそれぞれ推論モデルのパスと出力ディレクトリに置換される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ConverterSettings {
    fn default() -> Self {
        Self {
            program: "tar".to_string(),
            args: vec![
                "-xzf".to_string(),
                "{input}".to_string(),
                "-C".to_string(),
                "{output}".to_string(),
            ],
        }
    }
}

/// エクスポート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// 成果物の出力ディレクトリ
    pub output_dir: String,
    /// Web形式への変換
    #[serde(default)]
    pub converter: ConverterSettings,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: "output_model".to_string(),
            converter: ConverterSettings::default(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub preprocessing: PreprocessSettings,
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しないか壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> Result<(), PipelineError> {
        let d = &self.dataset;
        let fractions = [d.train_fraction, d.val_fraction, d.test_fraction];
        if fractions.iter().any(|f| *f <= 0.0 || *f >= 1.0) {
            return Err(PipelineError::Config(
                "分割比率はそれぞれ 0 より大きく 1 未満である必要があります".to_string(),
            ));
        }
        if (fractions.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(PipelineError::Config(format!(
                "分割比率の合計が1ではありません: {:.3}",
                fractions.iter().sum::<f64>()
            )));
        }

        let t = &self.training;
        if t.batch_size == 0 {
            return Err(PipelineError::Config("バッチサイズは1以上".to_string()));
        }
        if t.fine_tune.learning_rate * 10.0 > t.warmup.learning_rate {
            return Err(PipelineError::Config(format!(
                "ファインチューニングの学習率 {} はウォームアップ {} の1/10以下にしてください",
                t.fine_tune.learning_rate, t.warmup.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(PipelineError::Config(format!(
                "ドロップアウト率が不正です: {}",
                self.model.dropout
            )));
        }
        if self.model.num_stages == 0 || self.model.num_stages > 7 {
            return Err(PipelineError::Config(format!(
                "ステージ数は1〜7: {}",
                self.model.num_stages
            )));
        }
        if t.fine_tune_at > self.model.backbone_layers() {
            return Err(PipelineError::Config(format!(
                "fine_tune_at {} がバックボーンのレイヤー数 {} を超えています",
                t.fine_tune_at,
                self.model.backbone_layers()
            )));
        }
        if self.preprocessing.image_size < 32 {
            return Err(PipelineError::Config(format!(
                "入力サイズが小さすぎます: {} (最小32x32)",
                self.preprocessing.image_size
            )));
        }

        Ok(())
    }

    /// 設定情報をログに出す
    pub fn display(&self) {
        tracing::info!("=== アプリケーション設定 ===");
        tracing::info!("計算デバイス: {}", self.device_type);
        tracing::info!("データセット: {}", self.dataset.root);
        tracing::info!(
            "分割: {:.2}/{:.2}/{:.2} ({:?}), シード: {}",
            self.dataset.train_fraction,
            self.dataset.val_fraction,
            self.dataset.test_fraction,
            self.dataset.split_order,
            self.dataset.seed
        );
        tracing::info!(
            "入力サイズ: {}x{}, 正規化: {:?}",
            self.preprocessing.image_size,
            self.preprocessing.image_size,
            self.preprocessing.normalization
        );
        tracing::info!(
            "ウォームアップ: {} エポック (lr={}), ファインチューニング: {} エポック (lr={}), 凍結レイヤー: {}",
            self.training.warmup.epochs,
            self.training.warmup.learning_rate,
            self.training.fine_tune.epochs,
            self.training.fine_tune.learning_rate,
            self.training.fine_tune_at
        );
        tracing::info!("バッチサイズ: {}", self.training.batch_size);
        tracing::info!("出力先: {}", self.export.output_dir);
    }
}
