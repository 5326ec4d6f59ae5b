//! 手話文字分類モデルの定義
//!
//! 転移学習用の MobileNetV2 バックボーンに分類ヘッドを載せたモデルと、
//! 推論専用グラフへの変換を提供します。

use std::path::Path;

use burn::{
    config::Config,
    module::{AutodiffModule, Ignored, Module},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use rand::Rng;

use crate::dataset::NormalizationStrategy;
use crate::ml::augmentation::Augmentation;
use crate::ml::backbone::{BackboneHandle, FeatureExtractor};
use crate::ml::pretrained::load_backbone_weights;
use crate::model::config::AugmentationSettings;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力正規化
    pub normalization: NormalizationStrategy,
    /// 学習時のデータ拡張
    pub augmentation: AugmentationSettings,
    /// ドロップアウト率
    #[config(default = 0.2)]
    pub dropout: f64,
    /// バックボーンのチャネル幅倍率
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// 使用するステージ数
    #[config(default = 7)]
    pub num_stages: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> SignClassifier<B> {
        let backbone = FeatureExtractor::new(self.width_multiplier, self.num_stages, device);
        let head = LinearConfig::new(backbone.feature_width(), self.num_classes).init(device);

        SignClassifier {
            augmentation: Ignored(Augmentation::new(self.augmentation.clone())),
            normalization: Ignored(self.normalization),
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            head,
        }
    }

    /// 事前学習済みバックボーンを読み込んで初期化
    ///
    /// `.safetensors` は torchvision 形式、それ以外は burn レコードとして読む。
    /// `weights` が無い、または読み込めない場合はランダム初期化のまま続行する。
    pub fn init_pretrained<B: Backend>(
        &self,
        weights: Option<&Path>,
        device: &B::Device,
    ) -> SignClassifier<B> {
        let mut model = self.init(device);
        match weights {
            Some(path) if path.exists() => {
                let backbone = model.backbone.clone();
                match load_backbone_weights(backbone, path, device) {
                    Ok(loaded) => {
                        tracing::info!("事前学習済み重みを読み込みました: {}", path.display());
                        model.backbone = loaded;
                    }
                    Err(e) => {
                        tracing::warn!("{}。ランダム初期化で続行します", e);
                    }
                }
            }
            Some(path) => {
                tracing::warn!(
                    "事前学習済み重みが見つかりません: {}。ランダム初期化で続行します",
                    path.display()
                );
            }
            None => {
                tracing::warn!("事前学習済み重みが未指定です。ランダム初期化で続行します");
            }
        }
        model
    }

    /// 推論専用グラフを初期化（重みは後から読み込む）
    pub fn init_inference<B: Backend>(&self, device: &B::Device) -> InferenceClassifier<B> {
        self.init(device).into_inference()
    }
}

/// ロジットを返す分類器の共通インターフェース
pub trait Classifier<B: Backend> {
    /// [N, 3, H, W] ([0,1]) -> [N, num_classes]
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// クラス確率
    fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.logits(images), 1)
    }
}

/// 入力を正規化
pub fn normalize<B: Backend>(images: Tensor<B, 4>, strategy: NormalizationStrategy) -> Tensor<B, 4> {
    if strategy == NormalizationStrategy::UnitRange {
        return images;
    }
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(strategy.mean(), &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(strategy.std(), &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}

/// 特徴マップ → GAP → Dropout → 全結合
fn classify<B: Backend>(
    features: Tensor<B, 4>,
    pool: &AdaptiveAvgPool2d,
    dropout: &Dropout,
    head: &Linear<B>,
) -> Tensor<B, 2> {
    let x = pool.forward(features);
    let [batch_size, channels, _, _] = x.dims();
    let x = x.reshape([batch_size, channels]);
    let x = dropout.forward(x);
    head.forward(x)
}

/// 手話文字分類モデル（学習グラフ）
///
/// # アーキテクチャ
/// - データ拡張（学習時のみ）
/// - 正規化
/// - MobileNetV2 特徴抽出器
/// - Global Average Pooling
/// - Dropout
/// - 全結合: feature_width -> num_classes
#[derive(Module, Debug)]
pub struct SignClassifier<B: Backend> {
    augmentation: Ignored<Augmentation>,
    normalization: Ignored<NormalizationStrategy>,
    backbone: FeatureExtractor<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> SignClassifier<B> {
    /// 推論時の順伝播（データ拡張なし）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = normalize(images, self.normalization.0);
        let x = self.backbone.forward(x);
        classify(x, &self.pool, &self.dropout, &self.head)
    }

    pub fn backbone(&self) -> BackboneHandle {
        self.backbone.handle()
    }

    pub fn augmentation(&self) -> &AugmentationSettings {
        self.augmentation.0.settings()
    }

    pub fn normalization(&self) -> NormalizationStrategy {
        self.normalization.0
    }

    /// パラメータ数の内訳
    pub fn summary(&self, frozen_layers: usize) -> ModelSummary {
        let backbone = self.backbone.handle();
        let total_params = self.num_params();
        let trainable_params = total_params - backbone.total_params()
            + backbone.trainable_params(frozen_layers);
        ModelSummary {
            total_params,
            trainable_params,
            backbone,
        }
    }

    /// データ拡張を取り除いた推論専用グラフに変換（重みはそのまま）
    pub fn into_inference(self) -> InferenceClassifier<B> {
        InferenceClassifier {
            normalization: self.normalization,
            backbone: self.backbone,
            pool: self.pool,
            dropout: self.dropout,
            head: self.head,
        }
    }
}

impl<B: AutodiffBackend> SignClassifier<B> {
    /// 先頭 `frozen_layers` 個のレイヤーを内部バックエンドに切り出す
    ///
    /// 凍結レイヤーはフェーズ中に更新されないので、フェーズ開始時に1回呼べばよい。
    pub fn freeze_prefix(&self, frozen_layers: usize) -> FrozenPrefix<B::InnerBackend> {
        FrozenPrefix {
            layers: frozen_layers.min(self.backbone.num_layers()),
            backbone: self.backbone.valid(),
        }
    }

    /// 学習時の順伝播
    ///
    /// データ拡張と凍結レイヤーは内部バックエンド上で実行する
    /// （勾配なし、BatchNormは推論モード）。
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        images: Tensor<B::InnerBackend, 4>,
        frozen: &FrozenPrefix<B::InnerBackend>,
        rng: &mut R,
    ) -> Tensor<B, 2> {
        let x = self.augmentation.0.apply(images, rng);
        let x = normalize(x, self.normalization.0);
        let x = Tensor::<B, 4>::from_inner(frozen.forward(x));
        let x = self
            .backbone
            .forward_layers(x, frozen.layers..self.backbone.num_layers());

        classify(x, &self.pool, &self.dropout, &self.head)
    }
}

/// 凍結されたバックボーン先頭部（勾配なし）
#[derive(Debug, Clone)]
pub struct FrozenPrefix<B: Backend> {
    backbone: FeatureExtractor<B>,
    layers: usize,
}

impl<B: Backend> FrozenPrefix<B> {
    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.backbone.forward_layers(x, 0..self.layers)
    }
}

impl<B: Backend> Classifier<B> for SignClassifier<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

/// 推論専用グラフ（正規化 → 特徴抽出 → GAP → Dropout → 全結合）
#[derive(Module, Debug)]
pub struct InferenceClassifier<B: Backend> {
    normalization: Ignored<NormalizationStrategy>,
    backbone: FeatureExtractor<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> InferenceClassifier<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = normalize(images, self.normalization.0);
        let x = self.backbone.forward(x);
        classify(x, &self.pool, &self.dropout, &self.head)
    }
}

impl<B: Backend> Classifier<B> for InferenceClassifier<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

/// パラメータ数のまとめ
#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub total_params: usize,
    pub trainable_params: usize,
    pub backbone: BackboneHandle,
}

impl ModelSummary {
    pub fn log(&self) {
        tracing::info!(
            "[Model] 総パラメータ数: {} ({:.2}M), 学習対象: {} ({:.2}M)",
            self.total_params,
            self.total_params as f64 / 1_000_000.0,
            self.trainable_params,
            self.trainable_params as f64 / 1_000_000.0
        );
        tracing::info!(
            "[Model] バックボーン: {} レイヤー, 特徴次元 {}",
            self.backbone.num_layers,
            self.backbone.feature_width
        );
    }
}
