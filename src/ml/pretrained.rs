//! 事前学習済みバックボーン重みの読み込み
//!
//! 拡張子で形式を判定します。
//! - `.safetensors`: MobileNetV2 の ImageNet 重み。torchvision（`features.N.*`）と
//!   timm `mobilenetv2_100`（`conv_stem`, `blocks.i.j.*`, `conv_head`）の命名に対応
//! - それ以外: `FeatureExtractor` を保存した burn レコード
//!
//! safetensors のキーは torchvision の `features.N` 番号（stem=0, ブロック=1..=17,
//! 最終Conv=18）と、その中の Conv+BN 単位に対応付け、形状が一致するテンソルだけを
//! コピーします。幅倍率 1.0・7ステージで全テンソルが対応します。

use std::path::Path;

use burn::tensor::{backend::Backend, TensorData};
use half::{bf16, f16};
use safetensors::{
    tensor::{Dtype, TensorView},
    SafeTensors,
};

use crate::error::{PipelineError, Result};
use crate::ml::backbone::{
    ConvBnTensor, FeatureExtractor, INVERTED_RESIDUAL_SETTINGS, LAST_FEATURE_INDEX,
};

/// state_dict のキーが指す書き込み先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSlot {
    /// `features.N` の N
    pub feature: usize,
    /// `features.N` 内の Conv+BN 単位の番号
    pub unit: usize,
    pub tensor: ConvBnTensor,
}

fn conv_bn_tensor(is_conv: bool, param: &str) -> Option<ConvBnTensor> {
    match (is_conv, param) {
        (true, "weight") => Some(ConvBnTensor::ConvWeight),
        (false, "weight") => Some(ConvBnTensor::BnGamma),
        (false, "bias") => Some(ConvBnTensor::BnBeta),
        (false, "running_mean") => Some(ConvBnTensor::BnRunningMean),
        (false, "running_var") => Some(ConvBnTensor::BnRunningVar),
        // num_batches_tracked など
        _ => None,
    }
}

/// Conv2dNormActivation 内の番号（0: Conv, 1: BN）
fn is_conv_position(position: &str) -> Option<bool> {
    match position {
        "0" => Some(true),
        "1" => Some(false),
        _ => None,
    }
}

/// torchvision の state_dict キーを書き込み先に変換
///
/// `rank` はテンソルの次元数。ブロック末尾の `conv.I.weight` は
/// 4次元なら project の Conv、1次元なら直前の Conv に続く BN。
pub fn map_torchvision_key(key: &str, rank: usize) -> Option<TensorSlot> {
    let rest = key.strip_prefix("features.")?;
    let parts: Vec<&str> = rest.split('.').collect();

    let (feature, unit, is_conv, param) = match parts.as_slice() {
        // 反転残差ブロック内の Conv2dNormActivation
        [feature, "conv", unit, position, param] => {
            (feature, unit.parse().ok()?, is_conv_position(position)?, *param)
        }
        // 反転残差ブロック末尾の project Conv と BN
        [feature, "conv", index, param] => {
            let index: usize = index.parse().ok()?;
            if rank == 4 {
                (feature, index, true, *param)
            } else {
                (feature, index.checked_sub(1)?, false, *param)
            }
        }
        // stem / 最終Conv
        [feature, position, param] => (feature, 0, is_conv_position(position)?, *param),
        _ => return None,
    };

    Some(TensorSlot {
        feature: feature.parse().ok()?,
        unit,
        tensor: conv_bn_tensor(is_conv, param)?,
    })
}

/// timm の `mobilenetv2_100` のキーを書き込み先に変換
pub fn map_timm_key(key: &str) -> Option<TensorSlot> {
    let parts: Vec<&str> = key.split('.').collect();

    let (feature, unit, is_conv, param) = match parts.as_slice() {
        ["conv_stem", param] => (0, 0, true, *param),
        ["bn1", param] => (0, 0, false, *param),
        ["conv_head", param] => (LAST_FEATURE_INDEX, 0, true, *param),
        ["bn2", param] => (LAST_FEATURE_INDEX, 0, false, *param),
        ["blocks", stage, index, layer, param] => {
            let stage: usize = stage.parse().ok()?;
            let index: usize = index.parse().ok()?;
            let &(expand_ratio, _, repeats, _) = INVERTED_RESIDUAL_SETTINGS.get(stage)?;
            if index >= repeats {
                return None;
            }
            let preceding: usize = INVERTED_RESIDUAL_SETTINGS[..stage]
                .iter()
                .map(|&(_, _, n, _)| n)
                .sum();

            // 拡張率1のステージは depthwise → pointwise の2単位
            let (unit, is_conv) = match (expand_ratio == 1, *layer) {
                (true, "conv_dw") => (0, true),
                (true, "bn1") => (0, false),
                (true, "conv_pw") => (1, true),
                (true, "bn2") => (1, false),
                (false, "conv_pw") => (0, true),
                (false, "bn1") => (0, false),
                (false, "conv_dw") => (1, true),
                (false, "bn2") => (1, false),
                (false, "conv_pwl") => (2, true),
                (false, "bn3") => (2, false),
                _ => return None,
            };
            (1 + preceding + index, unit, is_conv, *param)
        }
        _ => return None,
    };

    Some(TensorSlot {
        feature,
        unit,
        tensor: conv_bn_tensor(is_conv, param)?,
    })
}

/// torchvision / timm どちらかの命名として解釈
pub fn map_checkpoint_key(key: &str, rank: usize) -> Option<TensorSlot> {
    map_torchvision_key(key, rank).or_else(|| map_timm_key(key))
}

/// 浮動小数点テンソルを f32 の TensorData に変換
fn view_to_data(view: &TensorView<'_>) -> Option<TensorData> {
    let bytes = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        _ => return None,
    };
    Some(TensorData::new(values, view.shape().to_vec()))
}

/// safetensors ファイルの浮動小数点テンソルを読み込む
pub fn read_safetensors(path: &Path) -> Result<Vec<(String, TensorData)>> {
    let bytes = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| PipelineError::Recorder(format!("{}: {}", path.display(), e)))?;

    let mut out = Vec::new();
    for (name, view) in tensors.tensors() {
        match view_to_data(&view) {
            Some(data) => out.push((name, data)),
            None => tracing::debug!("dtype {:?} のテンソルを読み飛ばします: {}", view.dtype(), name),
        }
    }
    Ok(out)
}

/// safetensors の MobileNetV2 重みをコピーする
///
/// コピーしたテンソル数も返す。1つもコピーできなければエラー。
pub fn load_safetensors<B: Backend>(
    mut backbone: FeatureExtractor<B>,
    path: &Path,
    device: &B::Device,
) -> Result<(FeatureExtractor<B>, usize)> {
    let mut copied = 0usize;
    let mut skipped = 0usize;

    for (key, data) in read_safetensors(path)? {
        let Some(slot) = map_checkpoint_key(&key, data.shape.len()) else {
            continue;
        };
        if backbone.assign_feature_tensor(slot.feature, slot.unit, slot.tensor, data, device) {
            copied += 1;
        } else {
            tracing::debug!("対応するレイヤーが無いか形状が異なります: {}", key);
            skipped += 1;
        }
    }

    if copied == 0 {
        return Err(PipelineError::Recorder(format!(
            "{}: バックボーンに対応するテンソルがありません",
            path.display()
        )));
    }
    tracing::info!(
        "事前学習済み重み: {} テンソルをコピー, {} テンソルをスキップ",
        copied,
        skipped
    );
    Ok((backbone, copied))
}

/// 拡張子に応じてバックボーン重みを読み込む
pub fn load_backbone_weights<B: Backend>(
    backbone: FeatureExtractor<B>,
    path: &Path,
    device: &B::Device,
) -> Result<FeatureExtractor<B>> {
    if path.extension().is_some_and(|ext| ext == "safetensors") {
        load_safetensors(backbone, path, device).map(|(backbone, _)| backbone)
    } else {
        backbone.load_record(path, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::round_channels;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    const BN_PARAMS: [&str; 4] = ["weight", "bias", "running_mean", "running_var"];

    #[derive(Clone, Copy, PartialEq)]
    enum Naming {
        Torchvision,
        Timm,
    }

    struct Entry {
        name: String,
        dtype: Dtype,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    }

    fn f32_entry(name: String, shape: Vec<usize>, seed: usize) -> Entry {
        let len: usize = shape.iter().product();
        let positive = name.ends_with("running_var");
        let bytes = (0..len)
            .map(|i| {
                let v = ((i * 31 + seed * 7) % 17) as f32 / 17.0 - 0.5;
                if positive {
                    1.0 + v.abs()
                } else {
                    v * 0.2
                }
            })
            .flat_map(|v| v.to_le_bytes())
            .collect();
        Entry {
            name,
            dtype: Dtype::F32,
            shape,
            bytes,
        }
    }

    /// Conv 重みと BN の4テンソル（値は feature / unit だけで決まる）
    fn conv_bn(
        names: (String, String),
        feature: usize,
        unit: usize,
        shape: [usize; 4],
        entries: &mut Vec<Entry>,
    ) {
        let (conv, bn) = names;
        let seed = (feature * 4 + unit) * 5;
        entries.push(f32_entry(conv, shape.to_vec(), seed));
        for (k, param) in BN_PARAMS.iter().enumerate() {
            entries.push(f32_entry(format!("{bn}.{param}"), vec![shape[0]], seed + k + 1));
        }
    }

    fn block_names(
        naming: Naming,
        feature: usize,
        stage: usize,
        index: usize,
        expands: bool,
        unit: usize,
    ) -> (String, String) {
        match naming {
            Naming::Torchvision => {
                let p = format!("features.{feature}.conv");
                match (expands, unit) {
                    (true, 2) => (format!("{p}.2.weight"), format!("{p}.3")),
                    (false, 1) => (format!("{p}.1.weight"), format!("{p}.2")),
                    _ => (format!("{p}.{unit}.0.weight"), format!("{p}.{unit}.1")),
                }
            }
            Naming::Timm => {
                let p = format!("blocks.{stage}.{index}");
                let layers: &[(&str, &str)] = if expands {
                    &[("conv_pw", "bn1"), ("conv_dw", "bn2"), ("conv_pwl", "bn3")]
                } else {
                    &[("conv_dw", "bn1"), ("conv_pw", "bn2")]
                };
                let (conv, bn) = layers[unit];
                (format!("{p}.{conv}.weight"), format!("{p}.{bn}"))
            }
        }
    }

    /// MobileNetV2 の state_dict を torchvision / timm の命名で作る
    fn state_dict(naming: Naming, width_multiplier: f64, num_stages: usize) -> Vec<Entry> {
        let mut entries = Vec::new();
        let stem = round_channels(32, width_multiplier);
        let stem_names = match naming {
            Naming::Torchvision => ("features.0.0.weight".to_string(), "features.0.1".to_string()),
            Naming::Timm => ("conv_stem.weight".to_string(), "bn1".to_string()),
        };
        conv_bn(stem_names, 0, 0, [stem, 3, 3, 3], &mut entries);

        let mut feature = 1;
        let mut in_channels = stem;
        for (stage, &(t, c, n, _)) in INVERTED_RESIDUAL_SETTINGS.iter().take(num_stages).enumerate() {
            let out_channels = round_channels(c, width_multiplier);
            for index in 0..n {
                let hidden = in_channels * t;
                let expands = t != 1;
                let mut shapes = Vec::new();
                if expands {
                    shapes.push([hidden, in_channels, 1, 1]);
                }
                shapes.push([hidden, 1, 3, 3]);
                shapes.push([out_channels, hidden, 1, 1]);

                for (unit, shape) in shapes.into_iter().enumerate() {
                    let names = block_names(naming, feature, stage, index, expands, unit);
                    conv_bn(names, feature, unit, shape, &mut entries);
                }
                in_channels = out_channels;
                feature += 1;
            }
        }

        let last_names = match naming {
            Naming::Torchvision => (
                format!("features.{LAST_FEATURE_INDEX}.0.weight"),
                format!("features.{LAST_FEATURE_INDEX}.1"),
            ),
            Naming::Timm => ("conv_head.weight".to_string(), "bn2".to_string()),
        };
        conv_bn(last_names, LAST_FEATURE_INDEX, 0, [1280, in_channels, 1, 1], &mut entries);
        entries
    }

    fn write_safetensors(path: &Path, entries: &[Entry]) {
        let views: Vec<(&str, TensorView<'_>)> = entries
            .iter()
            .map(|e| {
                let view = TensorView::new(e.dtype, e.shape.clone(), &e.bytes).unwrap();
                (e.name.as_str(), view)
            })
            .collect();
        std::fs::write(path, safetensors::serialize(views, None).unwrap()).unwrap();
    }

    fn features(backbone: &FeatureExtractor<TestBackend>) -> Vec<f32> {
        let values: Vec<f32> = (0..3 * 32 * 32).map(|i| (i % 251) as f32 / 251.0).collect();
        let x = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &Default::default())
            .reshape([1, 3, 32, 32]);
        backbone.forward(x).into_data().iter::<f32>().collect()
    }

    #[test]
    fn test_map_torchvision_keys() {
        let slot = |feature, unit, tensor| Some(TensorSlot { feature, unit, tensor });

        assert_eq!(map_torchvision_key("features.0.0.weight", 4), slot(0, 0, ConvBnTensor::ConvWeight));
        assert_eq!(
            map_torchvision_key("features.0.1.running_var", 1),
            slot(0, 0, ConvBnTensor::BnRunningVar)
        );
        assert_eq!(
            map_torchvision_key("features.1.conv.0.0.weight", 4),
            slot(1, 0, ConvBnTensor::ConvWeight)
        );
        assert_eq!(map_torchvision_key("features.1.conv.1.weight", 4), slot(1, 1, ConvBnTensor::ConvWeight));
        assert_eq!(map_torchvision_key("features.1.conv.2.weight", 1), slot(1, 1, ConvBnTensor::BnGamma));
        assert_eq!(map_torchvision_key("features.4.conv.1.1.bias", 1), slot(4, 1, ConvBnTensor::BnBeta));
        assert_eq!(map_torchvision_key("features.4.conv.3.bias", 1), slot(4, 2, ConvBnTensor::BnBeta));
        assert_eq!(
            map_torchvision_key("features.18.1.running_mean", 1),
            slot(18, 0, ConvBnTensor::BnRunningMean)
        );

        assert_eq!(map_torchvision_key("features.0.1.num_batches_tracked", 0), None);
        assert_eq!(map_torchvision_key("classifier.1.weight", 2), None);
    }

    #[test]
    fn test_map_timm_keys() {
        let slot = |feature, unit, tensor| Some(TensorSlot { feature, unit, tensor });

        assert_eq!(map_timm_key("conv_stem.weight"), slot(0, 0, ConvBnTensor::ConvWeight));
        assert_eq!(map_timm_key("bn1.bias"), slot(0, 0, ConvBnTensor::BnBeta));
        assert_eq!(map_timm_key("blocks.0.0.conv_dw.weight"), slot(1, 0, ConvBnTensor::ConvWeight));
        assert_eq!(map_timm_key("blocks.0.0.bn2.weight"), slot(1, 1, ConvBnTensor::BnGamma));
        // blocks.2.1 は 1 + 1 + 2 + 1 = 5 番目
        assert_eq!(map_timm_key("blocks.2.1.conv_pw.weight"), slot(5, 0, ConvBnTensor::ConvWeight));
        assert_eq!(
            map_timm_key("blocks.2.1.bn3.running_var"),
            slot(5, 2, ConvBnTensor::BnRunningVar)
        );
        assert_eq!(map_timm_key("blocks.6.0.conv_pwl.weight"), slot(17, 2, ConvBnTensor::ConvWeight));
        assert_eq!(map_timm_key("conv_head.weight"), slot(18, 0, ConvBnTensor::ConvWeight));
        assert_eq!(map_timm_key("bn2.running_mean"), slot(18, 0, ConvBnTensor::BnRunningMean));

        assert_eq!(map_timm_key("blocks.1.2.conv_pw.weight"), None);
        assert_eq!(map_timm_key("blocks.0.0.conv_pwl.weight"), None);
        assert_eq!(map_timm_key("classifier.weight"), None);
    }

    #[test]
    fn test_torchvision_checkpoint_is_remapped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mobilenet_v2.safetensors");
        let mut entries = state_dict(Naming::Torchvision, 0.25, 2);
        let expected_copied = entries.len();
        entries.push(f32_entry("classifier.1.weight".to_string(), vec![3, 1280], 0));
        entries.push(Entry {
            name: "features.0.1.num_batches_tracked".to_string(),
            dtype: Dtype::I64,
            shape: vec![],
            bytes: 0i64.to_le_bytes().to_vec(),
        });
        write_safetensors(&path, &entries);

        let device = Default::default();
        let a = FeatureExtractor::<TestBackend>::new(0.25, 2, &device);
        let b = FeatureExtractor::<TestBackend>::new(0.25, 2, &device);
        let random = features(&a);

        let (a, copied) = load_safetensors(a, &path, &device).unwrap();
        assert_eq!(copied, expected_copied);
        let b = load_backbone_weights(b, &path, &device).unwrap();

        // 別々に初期化しても全テンソルが上書きされる
        assert_eq!(features(&a), features(&b));
        assert_ne!(features(&a), random);
    }

    #[test]
    fn test_timm_and_torchvision_names_load_the_same_weights() {
        let dir = tempfile::tempdir().unwrap();
        let torchvision = dir.path().join("torchvision.safetensors");
        let timm = dir.path().join("timm.safetensors");
        write_safetensors(&torchvision, &state_dict(Naming::Torchvision, 0.25, 2));
        write_safetensors(&timm, &state_dict(Naming::Timm, 0.25, 2));

        let device = Default::default();
        let a = load_backbone_weights(FeatureExtractor::<TestBackend>::new(0.25, 2, &device), &torchvision, &device)
            .unwrap();
        let (b, copied) =
            load_safetensors(FeatureExtractor::<TestBackend>::new(0.25, 2, &device), &timm, &device).unwrap();
        assert_eq!(copied, state_dict(Naming::Timm, 0.25, 2).len());
        assert_eq!(features(&a), features(&b));
    }

    #[test]
    fn test_reduced_stages_skip_unused_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mobilenet_v2.safetensors");
        write_safetensors(&path, &state_dict(Naming::Torchvision, 0.5, 3));

        // 2ステージのモデルには 3ステージ目と最終Conv（入力チャネルが違う）が入らない
        let device = Default::default();
        let backbone = FeatureExtractor::<TestBackend>::new(0.5, 2, &device);
        let (_, copied) = load_safetensors(backbone, &path, &device).unwrap();
        let stem = 5;
        let blocks = 10 + 15 * 2;
        assert_eq!(copied, stem + blocks);
    }

    #[test]
    fn test_checkpoint_without_backbone_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head_only.safetensors");
        write_safetensors(&path, &[f32_entry("classifier.1.weight".to_string(), vec![3, 1280], 0)]);

        let device = Default::default();
        let backbone = FeatureExtractor::<TestBackend>::new(0.25, 1, &device);
        let err = load_backbone_weights(backbone, &path, &device).unwrap_err();
        assert!(matches!(err, PipelineError::Recorder(_)));
    }

    #[test]
    fn test_half_precision_is_widened() {
        let bytes: Vec<u8> = [1.5f32, -0.25]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![2], &bytes).unwrap();
        let data = view_to_data(&view).unwrap();
        assert_eq!(data.shape, vec![2]);
        assert_eq!(data.iter::<f32>().collect::<Vec<_>>(), vec![1.5, -0.25]);
    }
}
