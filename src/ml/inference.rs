//! モデル推論機能

use anyhow::Result;
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};

use crate::dataset::Preprocessor;
use crate::ml::ml_model::{Classifier, InferenceClassifier, ModelConfig};
use crate::model::config::AugmentationSettings;
use crate::model::{load_model_with_metadata, InferenceConfig};

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: InferenceClassifier<B>,
    config: InferenceConfig,
    preprocessor: Preprocessor,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let config = InferenceConfig::from_metadata(&metadata);

        // 推論グラフにデータ拡張は含まれないので設定値は使われない
        let model_config = ModelConfig::new(
            config.num_classes(),
            config.normalization,
            AugmentationSettings::default(),
        )
        .with_dropout(config.dropout)
        .with_width_multiplier(config.width_multiplier)
        .with_num_stages(config.num_stages)
        .with_image_size(config.image_size as usize);

        let model = model_config.init_inference::<B>(device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, device)
            .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
        let model = model.load_record(record);

        let preprocessor = Preprocessor::new(config.image_size);

        Ok(Self {
            model,
            config,
            preprocessor,
            device: device.clone(),
        })
    }

    /// 単一画像を分類（クラス名, 確率）
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<(String, f32)> {
        let mut results = self.classify_batch(&[image_path])?;
        results
            .pop()
            .ok_or_else(|| anyhow::anyhow!("推論結果が空です"))
    }

    /// 複数画像をまとめて分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<(String, f32)>> {
        self.probabilities(image_paths)?
            .into_iter()
            .map(|row| {
                // 同率なら小さいクラスID
                let (class_idx, probability) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
                let class_name = self
                    .config
                    .class_index_to_label(class_idx)
                    .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_idx))?;
                Ok((class_name.to_string(), probability))
            })
            .collect()
    }

    /// 画像ごとのクラス確率（クラスID順）
    pub fn probabilities(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Vec<f32>>> {
        let num_classes = self.config.num_classes();
        if image_paths.is_empty() || num_classes == 0 {
            return Ok(Vec::new());
        }

        let mut pixels = Vec::with_capacity(image_paths.len() * self.preprocessor.sample_len());
        for path in image_paths {
            pixels.extend(self.preprocessor.load(path.as_ref())?);
        }

        let size = self.config.image_size as usize;
        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([image_paths.len(), 3, size, size]);

        let values: Vec<f32> = self.model.probabilities(tensor).into_data().iter::<f32>().collect();
        Ok(values.chunks(num_classes).map(<[f32]>::to_vec).collect())
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
