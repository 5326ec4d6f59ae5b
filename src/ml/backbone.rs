//! MobileNetV2 特徴抽出器
//!
//! 分類ヘッドを除いた MobileNetV2 のレイヤー構成を burn で組み立てます。
//!
//! # レイヤー構成
//! - stem: Conv 3x3 stride 2 + BN + ReLU6
//! - 反転残差ブロック x 17（(t, c, n, s) の表に従う）
//! - 最終 Conv 1x1 → 1280ch + BN + ReLU6
//!
//! 凍結は上記の「レイヤー」（stem, 各ブロック, 最終Conv）単位で行います。

use std::ops::Range;
use std::path::Path;

use burn::{
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor, TensorData},
};

use crate::error::{PipelineError, Result};

/// 反転残差ブロックの設定 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
pub const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// torchvision の `features` 番号での最終Conv（stem=0, ブロック=1..=17）
pub const LAST_FEATURE_INDEX: usize = 18;

/// 幅倍率を掛けたチャネル数（最小8）
pub fn round_channels(channels: usize, width_multiplier: f64) -> usize {
    ((channels as f64 * width_multiplier).round() as usize).max(8)
}

/// Conv+BN 単位の中のテンソル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvBnTensor {
    ConvWeight,
    BnGamma,
    BnBeta,
    BnRunningMean,
    BnRunningVar,
}

fn same_shape<const D: usize>(dims: [usize; D], shape: &[usize]) -> bool {
    dims.as_slice() == shape
}

/// Conv + BatchNorm
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    /// Conv + BN + ReLU6
    pub fn forward_relu6(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(x).clamp(0.0, 6.0)
    }

    /// 形状が一致すればテンソルを置き換える
    fn assign(&mut self, tensor: ConvBnTensor, data: TensorData, device: &B::Device) -> bool {
        let shape = data.shape.clone();
        match tensor {
            ConvBnTensor::ConvWeight => {
                if !same_shape(self.conv.weight.val().dims(), &shape) {
                    return false;
                }
                self.conv.weight = Param::from_tensor(Tensor::from_data(data, device));
            }
            ConvBnTensor::BnGamma => {
                if !same_shape(self.bn.gamma.val().dims(), &shape) {
                    return false;
                }
                self.bn.gamma = Param::from_tensor(Tensor::from_data(data, device));
            }
            ConvBnTensor::BnBeta => {
                if !same_shape(self.bn.beta.val().dims(), &shape) {
                    return false;
                }
                self.bn.beta = Param::from_tensor(Tensor::from_data(data, device));
            }
            ConvBnTensor::BnRunningMean => {
                if !same_shape(self.bn.running_mean.value().dims(), &shape) {
                    return false;
                }
                self.bn.running_mean = RunningState::new(Tensor::from_data(data, device));
            }
            ConvBnTensor::BnRunningVar => {
                if !same_shape(self.bn.running_var.value().dims(), &shape) {
                    return false;
                }
                self.bn.running_var = RunningState::new(Tensor::from_data(data, device));
            }
        }
        true
    }
}

/// 反転残差ブロック（expand 1x1 → depthwise 3x3 → project 1x1）
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    project: ConvBn<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1).then(|| ConvBn::new([in_channels, hidden], 1, 1, 1, device));

        Self {
            expand,
            depthwise: ConvBn::new([hidden, hidden], 3, stride, hidden, device),
            project: ConvBn::new([hidden, out_channels], 1, 1, 1, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward_relu6(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward_relu6(x);
        // projectは線形（活性化なし）
        let x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }

    /// ブロック内の Conv+BN 単位（expand があれば expand, depthwise, project の順）
    fn unit_mut(&mut self, unit: usize) -> Option<&mut ConvBn<B>> {
        let index = if self.expand.is_some() { unit } else { unit + 1 };
        match index {
            0 => self.expand.as_mut(),
            1 => Some(&mut self.depthwise),
            2 => Some(&mut self.project),
            _ => None,
        }
    }
}

/// バックボーンの構造情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneHandle {
    /// 凍結単位のレイヤー数
    pub num_layers: usize,
    /// 出力特徴のチャネル数
    pub feature_width: usize,
    /// レイヤーごとのパラメータ数
    pub layer_params: Vec<usize>,
}

impl BackboneHandle {
    /// 先頭 `frozen_layers` 個を除いたパラメータ数
    pub fn trainable_params(&self, frozen_layers: usize) -> usize {
        self.layer_params.iter().skip(frozen_layers).sum()
    }

    pub fn total_params(&self) -> usize {
        self.layer_params.iter().sum()
    }
}

/// MobileNetV2 特徴抽出器（分類ヘッドなし）
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<InvertedResidual<B>>,
    last: ConvBn<B>,
    feature_width: usize,
}

impl<B: Backend> FeatureExtractor<B> {
    /// 幅倍率と使用ステージ数を指定して初期化
    pub fn new(width_multiplier: f64, num_stages: usize, device: &B::Device) -> Self {
        let stem_channels = round_channels(STEM_CHANNELS, width_multiplier);
        let stem = ConvBn::new([3, stem_channels], 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for &(t, c, n, s) in INVERTED_RESIDUAL_SETTINGS.iter().take(num_stages) {
            let out_channels = round_channels(c, width_multiplier);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(InvertedResidual::new(in_channels, out_channels, stride, t, device));
                in_channels = out_channels;
            }
        }

        // 幅倍率が1未満でも最終Convは縮めない
        let feature_width = if width_multiplier > 1.0 {
            round_channels(LAST_CHANNELS, width_multiplier)
        } else {
            LAST_CHANNELS
        };
        let last = ConvBn::new([in_channels, feature_width], 1, 1, 1, device);

        tracing::debug!(
            "MobileNetV2: 幅倍率 {}, ステージ {}, ブロック {}, 特徴次元 {}",
            width_multiplier,
            num_stages,
            blocks.len(),
            feature_width
        );

        Self {
            stem,
            blocks,
            last,
            feature_width,
        }
    }

    /// 凍結単位のレイヤー数（stem + ブロック + 最終Conv）
    pub fn num_layers(&self) -> usize {
        self.blocks.len() + 2
    }

    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    fn layer_num_params(&self, layer: usize) -> usize {
        if layer == 0 {
            self.stem.num_params()
        } else if layer <= self.blocks.len() {
            self.blocks[layer - 1].num_params()
        } else {
            self.last.num_params()
        }
    }

    pub fn handle(&self) -> BackboneHandle {
        BackboneHandle {
            num_layers: self.num_layers(),
            feature_width: self.feature_width,
            layer_params: (0..self.num_layers())
                .map(|layer| self.layer_num_params(layer))
                .collect(),
        }
    }

    /// 指定範囲のレイヤーだけを順に適用
    pub fn forward_layers(&self, x: Tensor<B, 4>, layers: Range<usize>) -> Tensor<B, 4> {
        let last_index = self.blocks.len() + 1;
        let mut x = x;
        for layer in layers {
            x = if layer == 0 {
                self.stem.forward_relu6(x)
            } else if layer < last_index {
                self.blocks[layer - 1].forward(x)
            } else if layer == last_index {
                self.last.forward_relu6(x)
            } else {
                break;
            };
        }
        x
    }

    /// 全レイヤーを適用 [N, 3, H, W] -> [N, feature_width, H', W']
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_layers(x, 0..self.num_layers())
    }

    /// torchvision の `features.N` の Conv+BN 単位にテンソルを書き込む
    ///
    /// 対応する単位が無い、または形状が合わない場合は false。
    pub fn assign_feature_tensor(
        &mut self,
        feature: usize,
        unit: usize,
        tensor: ConvBnTensor,
        data: TensorData,
        device: &B::Device,
    ) -> bool {
        let target = if feature == 0 {
            (unit == 0).then_some(&mut self.stem)
        } else if feature == LAST_FEATURE_INDEX {
            (unit == 0).then_some(&mut self.last)
        } else {
            self.blocks
                .get_mut(feature - 1)
                .and_then(|block| block.unit_mut(unit))
        };
        match target {
            Some(conv_bn) => conv_bn.assign(tensor, data, device),
            None => false,
        }
    }

    /// このクレートで保存した burn レコードから重みを読み込む
    pub fn load_record(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path, &recorder, device)
            .map_err(|e| PipelineError::Recorder(format!("{}: {:?}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_full_layout_has_19_layers() {
        let device = Default::default();
        let backbone = FeatureExtractor::<TestBackend>::new(0.35, 7, &device);
        let handle = backbone.handle();
        assert_eq!(handle.num_layers, 19);
        assert_eq!(handle.feature_width, 1280);
        assert_eq!(handle.total_params(), backbone.num_params());
    }

    #[test]
    fn test_reduced_layout_output_shape() {
        let device = Default::default();
        let backbone = FeatureExtractor::<TestBackend>::new(0.25, 2, &device);
        assert_eq!(backbone.num_layers(), 5);

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let y = backbone.forward(x);
        // stem /2, stage2 /2
        assert_eq!(y.dims(), [2, 1280, 8, 8]);
    }

    #[test]
    fn test_forward_layers_composes() {
        let device = Default::default();
        let backbone = FeatureExtractor::<TestBackend>::new(0.25, 2, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let full = backbone.forward(x.clone());
        let prefix = backbone.forward_layers(x, 0..3);
        let split = backbone.forward_layers(prefix, 3..backbone.num_layers());

        let a: Vec<f32> = full.into_data().iter::<f32>().collect();
        let b: Vec<f32> = split.into_data().iter::<f32>().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trainable_params_excludes_frozen_prefix() {
        let device = Default::default();
        let handle = FeatureExtractor::<TestBackend>::new(0.25, 3, &device).handle();
        assert_eq!(handle.trainable_params(0), handle.total_params());
        assert_eq!(handle.trainable_params(handle.num_layers), 0);
        assert!(handle.trainable_params(2) < handle.total_params());
    }

    #[test]
    fn test_assign_checks_unit_and_shape() {
        let device = Default::default();
        let mut backbone = FeatureExtractor::<TestBackend>::new(0.25, 1, &device);

        // stem conv [8, 3, 3, 3]
        let stem = TensorData::new(vec![0.5f32; 8 * 3 * 3 * 3], [8, 3, 3, 3]);
        assert!(backbone.assign_feature_tensor(0, 0, ConvBnTensor::ConvWeight, stem, &device));
        let wrong = TensorData::new(vec![0.5f32; 16 * 3 * 3 * 3], [16, 3, 3, 3]);
        assert!(!backbone.assign_feature_tensor(0, 0, ConvBnTensor::ConvWeight, wrong, &device));

        // 1ブロック目は expand なし（depthwise, project の2単位）
        let gamma = TensorData::new(vec![1.0f32; 8], [8]);
        assert!(backbone.assign_feature_tensor(1, 1, ConvBnTensor::BnGamma, gamma.clone(), &device));
        assert!(!backbone.assign_feature_tensor(1, 2, ConvBnTensor::BnGamma, gamma.clone(), &device));
        // 使っていないステージ
        assert!(!backbone.assign_feature_tensor(5, 0, ConvBnTensor::BnGamma, gamma, &device));
    }

    #[test]
    fn test_round_channels_minimum() {
        assert_eq!(round_channels(16, 0.25), 8);
        assert_eq!(round_channels(32, 1.0), 32);
        assert_eq!(round_channels(96, 0.5), 48);
    }
}
