//! 学習パイプライン
//!
//! 走査 → バランス調整/分割 → 2フェーズ学習 → 評価 → レポート → エクスポート
//! を1回の実行として順に行います。

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::charts::{self, HistoryPoint};
use crate::dataset::{
    oversample, oversample_samples, stratified_split, BalanceReport, BatchLoader, DatasetIndex,
    Preprocessor, SplitFractions, SplitIndices, SplitOrder,
};
use crate::error::Result;
use crate::ml::evaluation::evaluate;
use crate::ml::export::{ExportArtifacts, Exporter};
use crate::ml::ml_model::ModelConfig;
use crate::ml::training::{class_weights, EpochRecord, TrainingPhase, TwoPhaseTrainer};
use crate::model::config::{AppConfig, DatasetSettings};
use crate::model::ModelMetadata;
use crate::types::{ClassCatalog, Sample};

/// 出力ディレクトリの構成
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn report_csv(&self) -> PathBuf {
        self.root.join("classification_report.csv")
    }

    pub fn confusion_csv(&self) -> PathBuf {
        self.root.join("confusion_matrix.csv")
    }

    pub fn confusion_svg(&self) -> PathBuf {
        self.root.join("plots").join("confusion_matrix.svg")
    }

    pub fn history_svg(&self) -> PathBuf {
        self.root.join("plots").join("training_history.svg")
    }

    /// チェックポイント（`.mpk` は保存時に付く）
    pub fn checkpoint(&self) -> PathBuf {
        self.root.join("best_model")
    }

    /// 実行ごとのログディレクトリ `logs/run_<YYYYmmdd_HHMMSS>`
    pub fn run_dir(&self, timestamp: &chrono::DateTime<chrono::Local>) -> PathBuf {
        self.root
            .join("logs")
            .join(format!("run_{}", timestamp.format("%Y%m%d_%H%M%S")))
    }
}

/// 分割済みのデータ
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub catalog: ClassCatalog,
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
    pub test: Vec<Sample>,
    pub balance: BalanceReport,
}

fn select(samples: &[Sample], indices: &[usize]) -> Vec<Sample> {
    indices.iter().map(|&i| samples[i].clone()).collect()
}

fn log_split(split: &SplitIndices, labels: &[usize], catalog: &ClassCatalog) {
    tracing::info!(
        "分割: train {} / val {} / test {}",
        split.train.len(),
        split.val.len(),
        split.test.len()
    );
    for (label, (train, val, test)) in split.class_counts(labels, catalog.len()).iter().enumerate() {
        tracing::debug!(
            "  {}: train {}, val {}, test {}",
            catalog.name(label).unwrap_or("?"),
            train,
            val,
            test
        );
    }
}

/// データセットを走査し、バランス調整と層化分割を行う
pub fn prepare_data<R: Rng + ?Sized>(settings: &DatasetSettings, rng: &mut R) -> Result<PreparedData> {
    let index = DatasetIndex::scan(Path::new(&settings.root), &settings.expected_classes)?;
    let catalog = index.catalog().clone();
    tracing::info!(
        "データセット: {} クラス, {} 枚 ({})",
        catalog.len(),
        index.total(),
        settings.root
    );

    let fractions = SplitFractions {
        train: settings.train_fraction,
        val: settings.val_fraction,
        test: settings.test_fraction,
    };

    let prepared = match settings.split_order {
        SplitOrder::BalanceThenSplit => {
            let balanced = oversample(index.files(), &catalog, rng)?;
            let labels = balanced.labels();
            let split = stratified_split(&labels, &catalog, fractions, rng)?;
            log_split(&split, &labels, &catalog);
            PreparedData {
                train: select(&balanced.samples, &split.train),
                val: select(&balanced.samples, &split.val),
                test: select(&balanced.samples, &split.test),
                balance: balanced.report,
                catalog,
            }
        }
        SplitOrder::SplitThenBalance => {
            let samples = index.samples();
            let labels: Vec<usize> = samples.iter().map(|s| s.label).collect();
            let split = stratified_split(&labels, &catalog, fractions, rng)?;
            log_split(&split, &labels, &catalog);
            let balanced = oversample_samples(&select(&samples, &split.train), &catalog, rng)?;
            PreparedData {
                train: balanced.samples,
                val: select(&samples, &split.val),
                test: select(&samples, &split.test),
                balance: balanced.report,
                catalog,
            }
        }
    };

    tracing::info!(
        "オーバーサンプリング: 各クラス {} 枚に揃えました (追加 {} 枚)",
        prepared.balance.max_count,
        prepared.balance.added.iter().sum::<usize>()
    );
    Ok(prepared)
}

/// 学習履歴のグラフ用の点と、ファインチューニング開始エポック
fn history_points(history: &[EpochRecord]) -> (Vec<HistoryPoint>, Option<usize>) {
    let points = history
        .iter()
        .map(|r| HistoryPoint {
            epoch: r.epoch,
            train_accuracy: r.train_accuracy,
            val_accuracy: r.val_accuracy,
            train_loss: r.train_loss,
            val_loss: r.val_loss,
        })
        .collect();
    let boundary = history
        .iter()
        .find(|r| r.phase == TrainingPhase::FineTune)
        .map(|r| r.epoch);
    (points, boundary)
}

/// 1回の実行結果
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub test_accuracy: f64,
    pub best_val_accuracy: f64,
    pub epochs_trained: usize,
    pub run_dir: PathBuf,
    pub artifacts: ExportArtifacts,
}

/// パイプライン全体を実行
pub fn run_pipeline<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
) -> anyhow::Result<PipelineSummary> {
    config.validate()?;
    config.display();

    let mut rng = ChaCha8Rng::seed_from_u64(config.dataset.seed);
    let data = prepare_data(&config.dataset, &mut rng)?;
    let num_classes = data.catalog.len();

    let layout = OutputLayout::new(&config.export.output_dir);
    let run_dir = layout.run_dir(&chrono::Local::now());
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("ログディレクトリを作成できません: {:?}", run_dir))?;
    config
        .save(run_dir.join("config.json"))
        .context("実行時の設定を保存できません")?;

    let mut history_writer = csv::Writer::from_path(run_dir.join("history.csv"))
        .context("history.csv を作成できません")?;

    let train_labels: Vec<usize> = data.train.iter().map(|s| s.label).collect();
    let weights = class_weights(&train_labels, num_classes);
    tracing::debug!("クラス重み: {:?}", weights);

    let model_config = ModelConfig::new(
        num_classes,
        config.preprocessing.normalization,
        config.augmentation.clone(),
    )
    .with_dropout(config.model.dropout)
    .with_width_multiplier(config.model.width_multiplier)
    .with_num_stages(config.model.num_stages)
    .with_image_size(config.preprocessing.image_size as usize);
    let model = model_config.init_pretrained::<B>(
        config.model.backbone_weights.as_deref().map(Path::new),
        device,
    );

    let loader = BatchLoader::new(
        Preprocessor::new(config.preprocessing.image_size),
        config.training.batch_size,
        config.training.prefetch_depth,
    );

    let mut trainer =
        TwoPhaseTrainer::<B>::new(config.training.clone(), loader, device.clone(), weights);
    if config.training.checkpoint {
        trainer = trainer.with_checkpoint(layout.checkpoint());
    }

    let outcome = trainer.fit(model, &data.train, &data.val, &mut rng, |record| {
        if let Err(e) = history_writer.serialize(record) {
            tracing::warn!("学習履歴の書き込みに失敗しました: {}", e);
        }
        if let Err(e) = history_writer.flush() {
            tracing::warn!("学習履歴の書き込みに失敗しました: {}", e);
        }
    })?;
    drop(history_writer);

    // 評価は推論グラフで行う
    let trained = outcome.model.valid();
    let summary = trained.summary(outcome.trainable.frozen_layers);
    let inference = trained.clone().into_inference();
    let evaluation = evaluate(&inference, &data.test, &data.catalog, &loader, device)?;
    evaluation.report.log();

    evaluation.report.write_csv(&layout.report_csv())?;
    evaluation
        .confusion
        .write_csv(&layout.confusion_csv(), &data.catalog)?;

    let (points, boundary) = history_points(&outcome.history);
    charts::save_svg(
        &charts::render_training_history(&points, boundary),
        &layout.history_svg(),
    )
    .context("学習履歴グラフを保存できません")?;
    charts::save_svg(
        &charts::render_confusion_matrix(evaluation.confusion.counts(), data.catalog.names()),
        &layout.confusion_svg(),
    )
    .context("混同行列を保存できません")?;

    let metadata = ModelMetadata::new(
        data.catalog.names().to_vec(),
        config.preprocessing.image_size,
        config.preprocessing.normalization,
        config.model.width_multiplier,
        config.model.num_stages,
        config.model.dropout,
        summary.total_params,
        summary.trainable_params,
        outcome.history.len() as u32,
    )
    .with_test_accuracy(evaluation.report.accuracy);

    let artifacts = Exporter::new(&config.export).export(trained, &metadata)?;

    tracing::info!(
        "完了: テスト精度 {:.4}, 検証精度(最良) {:.4}, {} エポック",
        evaluation.report.accuracy,
        outcome.best_val_accuracy,
        outcome.history.len()
    );

    Ok(PipelineSummary {
        test_accuracy: evaluation.report.accuracy,
        best_val_accuracy: outcome.best_val_accuracy,
        epochs_trained: outcome.history.len(),
        run_dir,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::write_class_images;
    use crate::model::config::{ConverterSettings, PhaseSettings};
    use crate::model::load_metadata;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn dataset(root: &Path) -> DatasetSettings {
        write_class_images(root, "0_alif", 10, 36);
        write_class_images(root, "1_ba", 4, 36);
        write_class_images(root, "2_ta", 7, 36);
        DatasetSettings {
            root: root.to_string_lossy().to_string(),
            expected_classes: vec![],
            ..DatasetSettings::default()
        }
    }

    #[test]
    fn test_balance_then_split_uses_balanced_counts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dataset(dir.path());
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let data = prepare_data(&settings, &mut rng).unwrap();
        assert_eq!(data.train.len() + data.val.len() + data.test.len(), 30);
        assert_eq!(data.train.len(), 21);
        assert_eq!(data.balance.added, vec![0, 6, 3]);
    }

    #[test]
    fn test_split_then_balance_keeps_eval_splits_original() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DatasetSettings {
            split_order: SplitOrder::SplitThenBalance,
            ..dataset(dir.path())
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let data = prepare_data(&settings, &mut rng).unwrap();
        // 検証・テストには複製が含まれない
        let mut eval: Vec<&Sample> = data.val.iter().chain(&data.test).collect();
        let before = eval.len();
        eval.sort_by(|a, b| a.path.cmp(&b.path));
        eval.dedup();
        assert_eq!(eval.len(), before);
        assert_eq!(data.train.len() + data.val.len() + data.test.len() - data.balance.added.iter().sum::<usize>(), 21);

        // 学習データはクラスごとに同数
        let mut counts = vec![0; 3];
        for s in &data.train {
            counts[s.label] += 1;
        }
        assert!(counts.iter().all(|&c| c == counts[0]));
    }

    #[test]
    fn test_prepare_data_rejects_empty_class() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dataset(dir.path());
        std::fs::create_dir_all(dir.path().join("3_tsa")).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let err = prepare_data(&settings, &mut rng).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::EmptyClass { .. }));
    }

    #[test]
    fn test_output_layout_run_dir() {
        let layout = OutputLayout::new("output_model");
        let timestamp = chrono::TimeZone::with_ymd_and_hms(&chrono::Local, 2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            layout.run_dir(&timestamp),
            PathBuf::from("output_model/logs/run_20240305_070809")
        );
        assert_eq!(layout.checkpoint(), PathBuf::from("output_model/best_model"));
    }

    #[test]
    fn test_run_pipeline_end_to_end() {
        let data_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();

        let mut config = AppConfig::default();
        config.device_type = crate::model::DeviceType::Cpu;
        config.dataset = dataset(data_dir.path());
        config.preprocessing.image_size = 32;
        config.model.width_multiplier = 0.25;
        config.model.num_stages = 1;
        config.model.backbone_weights = None;
        config.training.batch_size = 8;
        config.training.warmup = PhaseSettings {
            epochs: 1,
            learning_rate: 1e-3,
        };
        config.training.fine_tune = PhaseSettings {
            epochs: 1,
            learning_rate: 5e-5,
        };
        config.training.fine_tune_at = 1;
        config.export.output_dir = out_dir.path().to_string_lossy().to_string();
        config.export.converter = ConverterSettings {
            program: "hijaiyah-converter-that-does-not-exist".to_string(),
            args: vec![],
        };

        let summary = run_pipeline::<TestBackend>(&config, &Default::default()).unwrap();
        assert_eq!(summary.epochs_trained, 2);
        assert!((0.0..=1.0).contains(&summary.test_accuracy));

        let layout = OutputLayout::new(out_dir.path());
        assert!(layout.report_csv().exists());
        assert!(layout.confusion_csv().exists());
        assert!(layout.history_svg().exists());
        assert!(layout.confusion_svg().exists());
        assert!(out_dir.path().join("best_model.mpk").exists());
        assert!(summary.run_dir.join("config.json").exists());

        // 混同行列の行和 = テスト分割のクラス別件数
        let data = prepare_data(
            &config.dataset,
            &mut ChaCha8Rng::seed_from_u64(config.dataset.seed),
        )
        .unwrap();
        let mut expected = vec![0usize; 3];
        for s in &data.test {
            expected[s.label] += 1;
        }
        let mut reader = csv::Reader::from_path(layout.confusion_csv()).unwrap();
        let row_sums: Vec<usize> = reader
            .records()
            .map(|r| r.unwrap().iter().skip(1).map(|c| c.parse::<usize>().unwrap()).sum())
            .collect();
        assert_eq!(row_sums, expected);
        assert_eq!(data.test.len(), 5);

        let history = std::fs::read_to_string(summary.run_dir.join("history.csv")).unwrap();
        assert_eq!(history.lines().count(), 3);
        assert!(history.contains("warmup"));
        assert!(history.contains("fine_tune"));

        let metadata = load_metadata(&summary.artifacts.inference_package).unwrap();
        assert_eq!(metadata.class_names, vec!["0_alif", "1_ba", "2_ta"]);
        assert_eq!(metadata.num_epochs, 2);
        assert_eq!(metadata.test_accuracy, Some(summary.test_accuracy));
        assert!(summary.artifacts.web_model_dir.is_none());
    }
}
