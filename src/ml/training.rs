//! 2フェーズ学習（ウォームアップ → ファインチューニング）
//!
//! フェーズは `Warmup → FineTune → Done` の一方向のみ遷移します。
//! 各フェーズで新しい Adam オプティマイザを作り直します。

use std::path::PathBuf;

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor, TensorData,
    },
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::{BatchLoader, DecodedBatch};
use crate::error::{PipelineError, Result};
use crate::ml::backbone::BackboneHandle;
use crate::ml::evaluation::predict_samples;
use crate::ml::ml_model::SignClassifier;
use crate::model::config::{PhaseSettings, TrainingSettings};
use crate::types::Sample;

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    Warmup,
    FineTune,
    Done,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingPhase::Warmup => write!(f, "warmup"),
            TrainingPhase::FineTune => write!(f, "fine_tune"),
            TrainingPhase::Done => write!(f, "done"),
        }
    }
}

/// どのレイヤーを学習するかの記述子
///
/// 遷移は `fine_tune` / `finish` で新しい値を返す。
#[derive(Debug, Clone, PartialEq)]
pub struct TrainableConfig {
    pub phase: TrainingPhase,
    /// 凍結する先頭レイヤー数
    pub frozen_layers: usize,
    /// バックボーンの全レイヤー数
    pub total_layers: usize,
    pub learning_rate: f64,
    pub epochs: usize,
}

impl TrainableConfig {
    /// ウォームアップ: バックボーン全体を凍結
    pub fn warmup(backbone: &BackboneHandle, settings: &PhaseSettings) -> Self {
        Self {
            phase: TrainingPhase::Warmup,
            frozen_layers: backbone.num_layers,
            total_layers: backbone.num_layers,
            learning_rate: settings.learning_rate,
            epochs: settings.epochs,
        }
    }

    /// ファインチューニングへ遷移
    ///
    /// バックボーンを解凍し、先頭 `fine_tune_at` 個を再凍結する。
    /// 学習率はウォームアップの1/10以下でなければならない。
    pub fn fine_tune(self, fine_tune_at: usize, settings: &PhaseSettings) -> Result<Self> {
        if self.phase != TrainingPhase::Warmup {
            return Err(PipelineError::Config(format!(
                "{} フェーズからファインチューニングには遷移できません",
                self.phase
            )));
        }
        if fine_tune_at > self.total_layers {
            return Err(PipelineError::Config(format!(
                "fine_tune_at {} がレイヤー数 {} を超えています",
                fine_tune_at, self.total_layers
            )));
        }
        if settings.learning_rate * 10.0 > self.learning_rate {
            return Err(PipelineError::Config(format!(
                "ファインチューニングの学習率 {} はウォームアップ {} の1/10以下にしてください",
                settings.learning_rate, self.learning_rate
            )));
        }

        Ok(Self {
            phase: TrainingPhase::FineTune,
            frozen_layers: fine_tune_at,
            total_layers: self.total_layers,
            learning_rate: settings.learning_rate,
            epochs: settings.epochs,
        })
    }

    /// 学習終了
    pub fn finish(self) -> Result<Self> {
        if self.phase != TrainingPhase::FineTune {
            return Err(PipelineError::Config(format!(
                "{} フェーズから終了状態には遷移できません",
                self.phase
            )));
        }
        Ok(Self {
            phase: TrainingPhase::Done,
            epochs: 0,
            ..self
        })
    }

    pub fn trainable_layers(&self) -> usize {
        self.total_layers - self.frozen_layers
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: TrainingPhase,
    /// 通し番号（フェーズをまたいで連番、1始まり）
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 逆頻度クラス重み `n / (num_classes * count_c)`
///
/// 学習データに現れないクラスの重みは0。
pub fn class_weights(labels: &[usize], num_classes: usize) -> Vec<f32> {
    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        counts[label] += 1;
    }
    let n = labels.len() as f64;
    counts
        .iter()
        .map(|&count| {
            if count == 0 {
                0.0
            } else {
                (n / (num_classes as f64 * count as f64)) as f32
            }
        })
        .collect()
}

/// サンプル重み付きのスパース交差エントロピー（バッチ平均）
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    let picked = log_probs.gather(1, targets.reshape([n, 1])).reshape([n]);
    (picked * weights).mean().neg()
}

/// デコード済みバッチをテンソルに変換
#[derive(Clone, Debug)]
pub struct SignBatcher<B: Backend> {
    device: B::Device,
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct SignBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
}

impl<B: Backend> SignBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn batch(&self, decoded: DecodedBatch) -> SignBatch<B> {
        let n = decoded.len();
        let size = decoded.image_size;

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(decoded.pixels.as_slice(), &self.device)
            .reshape([n, 3, size, size]);
        let targets_vec: Vec<i64> = decoded.labels.iter().map(|&l| l as i64).collect();
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_vec, [n]), &self.device);

        SignBatch {
            images,
            targets,
            labels: decoded.labels,
        }
    }
}

/// 検証損失が停滞したら学習率を下げる
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    min_learning_rate: f64,
    best_loss: f64,
    wait: usize,
}

impl PlateauScheduler {
    const MIN_DELTA: f64 = 1e-4;

    pub fn new(learning_rate: f64, factor: f64, patience: usize, min_learning_rate: f64) -> Self {
        Self {
            learning_rate,
            factor,
            patience,
            min_learning_rate,
            best_loss: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// エポック終了時の検証損失を渡し、次エポックの学習率を返す
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best_loss - Self::MIN_DELTA {
            self.best_loss = val_loss;
            self.wait = 0;
            return self.learning_rate;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.learning_rate > self.min_learning_rate {
            let reduced = (self.learning_rate * self.factor).max(self.min_learning_rate);
            tracing::info!("学習率を下げます: {:.2e} -> {:.2e}", self.learning_rate, reduced);
            self.learning_rate = reduced;
            self.wait = 0;
        }
        self.learning_rate
    }
}

/// 検証精度による早期終了
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: Option<usize>,
    best_accuracy: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            best_accuracy: f64::NEG_INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    /// 改善したら `true`
    pub fn observe(&mut self, epoch: usize, val_accuracy: f64) -> bool {
        if val_accuracy > self.best_accuracy {
            self.best_accuracy = val_accuracy;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            true
        } else {
            self.wait += 1;
            false
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience.is_some_and(|p| self.wait >= p)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// 学習結果
pub struct TrainOutcome<B: AutodiffBackend> {
    pub model: SignClassifier<B>,
    pub history: Vec<EpochRecord>,
    pub trainable: TrainableConfig,
    pub best_val_accuracy: f64,
}

/// 2フェーズ学習器
pub struct TwoPhaseTrainer<B: AutodiffBackend> {
    settings: TrainingSettings,
    loader: BatchLoader,
    device: B::Device,
    class_weights: Vec<f32>,
    checkpoint_path: Option<PathBuf>,
    best_val_accuracy: f64,
    epochs_run: usize,
}

impl<B: AutodiffBackend> TwoPhaseTrainer<B> {
    pub fn new(
        settings: TrainingSettings,
        loader: BatchLoader,
        device: B::Device,
        class_weights: Vec<f32>,
    ) -> Self {
        Self {
            settings,
            loader,
            device,
            class_weights,
            checkpoint_path: None,
            best_val_accuracy: f64::NEG_INFINITY,
            epochs_run: 0,
        }
    }

    /// ベストモデルの保存先（拡張子 `.mpk` は自動で付く）
    pub fn with_checkpoint(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    /// 2フェーズ学習を実行
    pub fn fit<R, F>(
        &mut self,
        model: SignClassifier<B>,
        train: &[Sample],
        val: &[Sample],
        rng: &mut R,
        mut on_epoch: F,
    ) -> Result<TrainOutcome<B>>
    where
        R: Rng + ?Sized,
        F: FnMut(&EpochRecord),
    {
        if train.is_empty() || val.is_empty() {
            return Err(PipelineError::EmptyDataset(
                "学習データまたは検証データが空です".to_string(),
            ));
        }

        let mut history = Vec::new();

        let warmup = TrainableConfig::warmup(&model.backbone(), &self.settings.warmup);
        model.summary(warmup.frozen_layers).log();
        let model = self.run_phase(model, &warmup, train, val, rng, &mut history, &mut on_epoch)?;

        let fine_tune_settings = self.settings.fine_tune.clone();
        let fine_tune = warmup.fine_tune(self.settings.fine_tune_at, &fine_tune_settings)?;
        tracing::info!(
            "ファインチューニング: 先頭 {} レイヤーを凍結, {} レイヤーを学習",
            fine_tune.frozen_layers,
            fine_tune.trainable_layers()
        );
        model.summary(fine_tune.frozen_layers).log();
        let model =
            self.run_phase(model, &fine_tune, train, val, rng, &mut history, &mut on_epoch)?;

        Ok(TrainOutcome {
            model,
            history,
            trainable: fine_tune.finish()?,
            best_val_accuracy: self.best_val_accuracy,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase<R, F>(
        &mut self,
        model: SignClassifier<B>,
        trainable: &TrainableConfig,
        train: &[Sample],
        val: &[Sample],
        rng: &mut R,
        history: &mut Vec<EpochRecord>,
        on_epoch: &mut F,
    ) -> Result<SignClassifier<B>>
    where
        R: Rng + ?Sized,
        F: FnMut(&EpochRecord),
    {
        tracing::info!(
            "=== {} フェーズ開始: {} エポック, 学習率 {:.2e} ===",
            trainable.phase,
            trainable.epochs,
            trainable.learning_rate
        );

        let mut model = model;
        let mut optim = AdamConfig::new().init::<B, SignClassifier<B>>();
        let mut scheduler = PlateauScheduler::new(
            trainable.learning_rate,
            self.settings.plateau_factor,
            self.settings.plateau_patience,
            self.settings.min_learning_rate,
        );
        let mut stopper = EarlyStopping::new(self.settings.early_stopping_patience);
        let mut best_model: Option<SignClassifier<B>> = None;
        let batcher = SignBatcher::<B::InnerBackend>::new(self.device.clone());
        let frozen = model.freeze_prefix(trainable.frozen_layers);

        for _ in 0..trainable.epochs {
            self.epochs_run += 1;
            let epoch = self.epochs_run;
            let learning_rate = scheduler.learning_rate();

            // 毎エポック全体をシャッフル
            let mut order = train.to_vec();
            order.shuffle(rng);

            let mut loss_sum = 0.0;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for decoded in self.loader.stream(order) {
                let batch = batcher.batch(decoded);
                let n = batch.labels.len();

                let weights: Vec<f32> = batch
                    .labels
                    .iter()
                    .map(|&label| self.class_weights[label])
                    .collect();
                let weights = Tensor::<B, 1>::from_floats(weights.as_slice(), &self.device);
                let targets = Tensor::<B, 1, Int>::from_inner(batch.targets);

                let logits = model.forward_train(batch.images, &frozen, rng);
                let loss = weighted_cross_entropy(logits.clone(), targets, weights);

                let loss_value = loss.clone().into_scalar().elem::<f64>();
                ensure_finite_loss(trainable.phase, epoch, loss_value)?;

                correct += count_correct(logits.inner(), &batch.labels);
                loss_sum += loss_value * n as f64;
                seen += n;

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optim.step(learning_rate, model, grads);
            }

            let validation = predict_samples(&model.valid(), val, &self.loader, &self.device)?;
            ensure_finite_loss(trainable.phase, epoch, validation.mean_loss)?;

            let record = EpochRecord {
                phase: trainable.phase,
                epoch,
                train_loss: loss_sum / seen.max(1) as f64,
                train_accuracy: correct as f64 / seen.max(1) as f64,
                val_loss: validation.mean_loss,
                val_accuracy: validation.accuracy(),
                learning_rate,
            };
            tracing::info!(
                "[{}] epoch {}: loss {:.4}, acc {:.4}, val_loss {:.4}, val_acc {:.4}, lr {:.2e}",
                record.phase,
                record.epoch,
                record.train_loss,
                record.train_accuracy,
                record.val_loss,
                record.val_accuracy,
                record.learning_rate
            );
            on_epoch(&record);
            history.push(record.clone());

            if record.val_accuracy > self.best_val_accuracy {
                self.best_val_accuracy = record.val_accuracy;
                self.save_checkpoint(&model)?;
            }

            if stopper.observe(epoch, record.val_accuracy) {
                best_model = Some(model.clone());
            }
            if stopper.should_stop() {
                tracing::info!(
                    "検証精度が改善しないため早期終了します (best epoch {:?})",
                    stopper.best_epoch()
                );
                break;
            }

            scheduler.step(record.val_loss);
        }

        match best_model {
            Some(best) => {
                tracing::info!("ベストエポック {:?} の重みに戻します", stopper.best_epoch());
                Ok(best)
            }
            None => Ok(model),
        }
    }

    fn save_checkpoint(&self, model: &SignClassifier<B>) -> Result<()> {
        let Some(path) = &self.checkpoint_path else {
            return Ok(());
        };
        model
            .clone()
            .save_file(path.clone(), &DefaultFileRecorder::<FullPrecisionSettings>::new())
            .map_err(|e| PipelineError::Recorder(format!("{:?}", e)))?;
        tracing::debug!("チェックポイントを保存しました: {}", path.display());
        Ok(())
    }
}

/// 損失が非有限値なら発散として打ち切る
pub fn ensure_finite_loss(phase: TrainingPhase, epoch: usize, loss: f64) -> Result<()> {
    if loss.is_finite() {
        return Ok(());
    }
    Err(PipelineError::TrainingDivergence {
        phase: phase.to_string(),
        epoch,
        loss,
    })
}

/// 正解数を数える
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> usize {
    let [n, _] = logits.dims();
    logits
        .argmax(1)
        .reshape([n])
        .into_data()
        .iter::<i64>()
        .zip(labels)
        .filter(|(predicted, &label)| *predicted == label as i64)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::write_class_images;
    use crate::dataset::{DatasetIndex, NormalizationStrategy, Preprocessor};
    use crate::ml::ml_model::ModelConfig;
    use crate::model::config::AugmentationSettings;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn handle(layers: usize) -> BackboneHandle {
        BackboneHandle {
            num_layers: layers,
            feature_width: 1280,
            layer_params: vec![10; layers],
        }
    }

    fn phase(epochs: usize, learning_rate: f64) -> PhaseSettings {
        PhaseSettings {
            epochs,
            learning_rate,
        }
    }

    #[test]
    fn test_phase_transitions() {
        let warmup = TrainableConfig::warmup(&handle(19), &phase(10, 1e-3));
        assert_eq!(warmup.phase, TrainingPhase::Warmup);
        assert_eq!(warmup.frozen_layers, 19);
        assert_eq!(warmup.trainable_layers(), 0);

        let fine = warmup.fine_tune(12, &phase(40, 1e-5)).unwrap();
        assert_eq!(fine.phase, TrainingPhase::FineTune);
        assert_eq!(fine.frozen_layers, 12);
        assert_eq!(fine.trainable_layers(), 7);
        assert_eq!(fine.learning_rate, 1e-5);

        let done = fine.finish().unwrap();
        assert_eq!(done.phase, TrainingPhase::Done);
    }

    #[test]
    fn test_fine_tune_requires_smaller_learning_rate() {
        let warmup = TrainableConfig::warmup(&handle(19), &phase(10, 1e-3));
        assert!(warmup.clone().fine_tune(12, &phase(40, 5e-4)).is_err());
        assert!(warmup.clone().fine_tune(12, &phase(40, 1e-4)).is_ok());
        assert!(warmup.fine_tune(20, &phase(40, 1e-5)).is_err());
    }

    #[test]
    fn test_transitions_are_one_way() {
        let warmup = TrainableConfig::warmup(&handle(5), &phase(1, 1e-3));
        assert!(warmup.clone().finish().is_err());

        let fine = warmup.fine_tune(2, &phase(1, 1e-5)).unwrap();
        assert!(fine.clone().fine_tune(2, &phase(1, 1e-7)).is_err());
        let done = fine.finish().unwrap();
        assert!(done.finish().is_err());
    }

    #[test]
    fn test_class_weights_inverse_frequency() {
        let labels = vec![0, 0, 0, 1, 2, 2];
        let weights = class_weights(&labels, 3);
        assert!((weights[0] - 6.0 / 9.0).abs() < 1e-6);
        assert!((weights[1] - 2.0).abs() < 1e-6);
        assert!((weights[2] - 1.0).abs() < 1e-6);

        assert_eq!(class_weights(&[0, 0], 2)[1], 0.0);
    }

    #[test]
    fn test_weighted_cross_entropy_matches_unweighted_with_unit_weights() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 1.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(vec![0i64, 1], [2]), &device);
        let ones = Tensor::<TestBackend, 1>::ones([2], &device);

        let loss = weighted_cross_entropy(logits.clone(), targets.clone(), ones)
            .into_scalar()
            .elem::<f64>();
        let expected = burn::nn::loss::CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits.clone(), targets.clone())
            .into_scalar()
            .elem::<f64>();
        assert!((loss - expected).abs() < 1e-5);

        let doubled = weighted_cross_entropy(logits, targets, Tensor::ones([2], &device) * 2.0)
            .into_scalar()
            .elem::<f64>();
        assert!((doubled - 2.0 * expected).abs() < 1e-5);
    }

    #[test]
    fn test_plateau_scheduler_reduces_and_floors() {
        let mut scheduler = PlateauScheduler::new(1e-3, 0.2, 2, 1e-4);
        assert_eq!(scheduler.step(1.0), 1e-3);
        assert_eq!(scheduler.step(1.0), 1e-3);
        let lr = scheduler.step(1.0);
        assert!((lr - 2e-4).abs() < 1e-12);
        scheduler.step(1.0);
        let lr = scheduler.step(1.0);
        assert!((lr - 1e-4).abs() < 1e-12);
        scheduler.step(1.0);
        assert!((scheduler.step(1.0) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut stopper = EarlyStopping::new(Some(2));
        assert!(stopper.observe(1, 0.5));
        assert!(!stopper.observe(2, 0.5));
        assert!(!stopper.should_stop());
        assert!(!stopper.observe(3, 0.4));
        assert!(stopper.should_stop());
        assert_eq!(stopper.best_epoch(), Some(1));

        let mut never = EarlyStopping::new(None);
        for epoch in 0..50 {
            never.observe(epoch, 0.0);
        }
        assert!(!never.should_stop());
    }

    #[test]
    fn test_non_finite_loss_is_divergence() {
        assert!(ensure_finite_loss(TrainingPhase::Warmup, 1, 0.7).is_ok());

        let err = ensure_finite_loss(TrainingPhase::FineTune, 4, f64::NAN).unwrap_err();
        match err {
            PipelineError::TrainingDivergence { phase, epoch, loss } => {
                assert_eq!(phase, "fine_tune");
                assert_eq!(epoch, 4);
                assert!(loss.is_nan());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ensure_finite_loss(TrainingPhase::Warmup, 2, f64::INFINITY).is_err());
    }

    #[test]
    fn test_count_correct() {
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.9, 0.1], [0.2, 0.8], [0.6, 0.4]],
            &Default::default(),
        );
        assert_eq!(count_correct(logits, &[0, 1, 1]), 2);
    }

    #[test]
    fn test_tiny_two_phase_run() {
        let dir = tempfile::tempdir().unwrap();
        write_class_images(dir.path(), "0_alif", 4, 32);
        write_class_images(dir.path(), "1_ba", 4, 32);
        let index = DatasetIndex::scan(dir.path(), &[]).unwrap();
        let samples = index.samples();

        let device = Default::default();
        let config = ModelConfig::new(2, NormalizationStrategy::Symmetric, AugmentationSettings::default())
            .with_width_multiplier(0.25)
            .with_num_stages(1)
            .with_image_size(32);
        let model = config.init::<TestAutodiffBackend>(&device);

        let settings = TrainingSettings {
            batch_size: 4,
            warmup: phase(1, 1e-3),
            fine_tune: phase(1, 1e-5),
            fine_tune_at: 2,
            checkpoint: true,
            ..TrainingSettings::default()
        };
        let loader = BatchLoader::new(Preprocessor::new(32), 4, 1);
        let labels: Vec<usize> = samples.iter().map(|s| s.label).collect();
        let checkpoint = dir.path().join("best_model");

        let mut trainer = TwoPhaseTrainer::<TestAutodiffBackend>::new(
            settings,
            loader,
            device,
            class_weights(&labels, 2),
        )
        .with_checkpoint(checkpoint.clone());

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut seen = Vec::new();
        let outcome = trainer
            .fit(model, &samples, &samples, &mut rng, |r| seen.push(r.epoch))
            .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history[0].phase, TrainingPhase::Warmup);
        assert_eq!(outcome.history[1].phase, TrainingPhase::FineTune);
        assert_eq!(outcome.trainable.phase, TrainingPhase::Done);
        assert!(outcome.history.iter().all(|r| r.train_loss.is_finite()));
        assert!(checkpoint.with_extension("mpk").exists());
    }
}
