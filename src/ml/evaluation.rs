//! テストデータでの評価とレポート出力
//!
//! 精度・クラス別の precision / recall / F1 / support・混同行列（行=正解, 列=予測）を計算し、
//! CSVに書き出します。

use std::path::Path;

use anyhow::Context;
use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{backend::Backend, ElementConversion},
};
use serde::Serialize;

use crate::dataset::BatchLoader;
use crate::error::{PipelineError, Result};
use crate::ml::ml_model::Classifier;
use crate::ml::training::SignBatcher;
use crate::types::{ClassCatalog, Sample};

/// 予測結果
#[derive(Debug, Clone)]
pub struct Predictions {
    pub actual: Vec<usize>,
    pub predicted: Vec<usize>,
    /// 重みなし交差エントロピーのサンプル平均
    pub mean_loss: f64,
}

impl Predictions {
    pub fn accuracy(&self) -> f64 {
        if self.actual.is_empty() {
            return 0.0;
        }
        let correct = self
            .actual
            .iter()
            .zip(&self.predicted)
            .filter(|(a, p)| a == p)
            .count();
        correct as f64 / self.actual.len() as f64
    }
}

/// サンプル列を順番どおりに推論する（データ拡張なし）
pub fn predict_samples<B: Backend, M: Classifier<B>>(
    model: &M,
    samples: &[Sample],
    loader: &BatchLoader,
    device: &B::Device,
) -> Result<Predictions> {
    if samples.is_empty() {
        return Err(PipelineError::EmptyDataset("評価データが空です".to_string()));
    }

    let batcher = SignBatcher::<B>::new(device.clone());
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let mut actual = Vec::with_capacity(samples.len());
    let mut predicted = Vec::with_capacity(samples.len());
    let mut loss_sum = 0.0;

    for decoded in loader.stream(samples.to_vec()) {
        let batch = batcher.batch(decoded);
        let n = batch.labels.len();

        let logits = model.logits(batch.images);
        let loss = loss_fn
            .forward(logits.clone(), batch.targets)
            .into_scalar()
            .elem::<f64>();
        loss_sum += loss * n as f64;

        predicted.extend(
            logits
                .argmax(1)
                .reshape([n])
                .into_data()
                .iter::<i64>()
                .map(|i| i as usize),
        );
        actual.extend(batch.labels);
    }

    let mean_loss = loss_sum / actual.len().max(1) as f64;
    Ok(Predictions {
        actual,
        predicted,
        mean_loss,
    })
}

/// 混同行列（行=正解, 列=予測）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(actual: &[usize], predicted: &[usize], num_classes: usize) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&a, &p) in actual.iter().zip(predicted) {
            matrix.counts[a][p] += 1;
        }
        matrix
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn counts(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    /// クラスごとの正解数（support）
    pub fn row_sums(&self) -> Vec<usize> {
        self.counts.iter().map(|row| row.iter().sum()).collect()
    }

    /// クラスごとの予測数
    pub fn column_sums(&self) -> Vec<usize> {
        (0..self.num_classes())
            .map(|c| self.counts.iter().map(|row| row[c]).sum())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.row_sums().iter().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let diagonal: usize = (0..self.num_classes()).map(|c| self.counts[c][c]).sum();
        diagonal as f64 / total as f64
    }

    /// CSV出力（先頭行・先頭列がクラス名）
    pub fn write_csv(&self, path: &Path, catalog: &ClassCatalog) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("CSVを作成できません: {}", path.display()))?;

        let mut header = vec!["actual\\predicted".to_string()];
        header.extend(catalog.names().iter().cloned());
        writer.write_record(&header)?;

        for (name, row) in catalog.names().iter().zip(&self.counts) {
            let mut record = vec![name.clone()];
            record.extend(row.iter().map(|c| c.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// クラス別の指標
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub class_name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// 分類レポート
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    pub fn from_confusion(matrix: &ConfusionMatrix, catalog: &ClassCatalog) -> Self {
        let supports = matrix.row_sums();
        let predicted = matrix.column_sums();
        let total = matrix.total();

        let classes: Vec<ClassMetrics> = (0..matrix.num_classes())
            .map(|c| {
                let tp = matrix.get(c, c);
                let precision = ratio(tp, predicted[c]);
                let recall = ratio(tp, supports[c]);
                let f1_score = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    class_name: catalog.name(c).unwrap_or("?").to_string(),
                    precision,
                    recall,
                    f1_score,
                    support: supports[c],
                }
            })
            .collect();

        let k = classes.len().max(1) as f64;
        let macro_avg = ClassMetrics {
            class_name: "macro avg".to_string(),
            precision: classes.iter().map(|m| m.precision).sum::<f64>() / k,
            recall: classes.iter().map(|m| m.recall).sum::<f64>() / k,
            f1_score: classes.iter().map(|m| m.f1_score).sum::<f64>() / k,
            support: total,
        };

        let weighted = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            classes.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
        };
        let weighted_avg = ClassMetrics {
            class_name: "weighted avg".to_string(),
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1_score: weighted(|m| m.f1_score),
            support: total,
        };

        Self {
            accuracy: matrix.accuracy(),
            classes,
            macro_avg,
            weighted_avg,
        }
    }

    /// CSV出力（クラス行の後に accuracy / macro avg / weighted avg）
    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("CSVを作成できません: {}", path.display()))?;

        for metrics in &self.classes {
            writer.serialize(metrics)?;
        }
        writer.serialize(ClassMetrics {
            class_name: "accuracy".to_string(),
            precision: self.accuracy,
            recall: self.accuracy,
            f1_score: self.accuracy,
            support: self.macro_avg.support,
        })?;
        writer.serialize(&self.macro_avg)?;
        writer.serialize(&self.weighted_avg)?;
        writer.flush()?;
        Ok(())
    }

    pub fn log(&self) {
        tracing::info!("=== 分類レポート ===");
        tracing::info!(
            "{:<12} {:>9} {:>9} {:>9} {:>8}",
            "class",
            "precision",
            "recall",
            "f1",
            "support"
        );
        for m in self.classes.iter().chain([&self.macro_avg, &self.weighted_avg]) {
            tracing::info!(
                "{:<12} {:>9.4} {:>9.4} {:>9.4} {:>8}",
                m.class_name,
                m.precision,
                m.recall,
                m.f1_score,
                m.support
            );
        }
        tracing::info!("テスト精度: {:.4}", self.accuracy);
    }
}

/// 評価結果
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub report: ClassificationReport,
    pub confusion: ConfusionMatrix,
    pub mean_loss: f64,
}

/// テストデータで評価する
pub fn evaluate<B: Backend, M: Classifier<B>>(
    model: &M,
    test: &[Sample],
    catalog: &ClassCatalog,
    loader: &BatchLoader,
    device: &B::Device,
) -> Result<Evaluation> {
    let predictions = predict_samples(model, test, loader, device)?;
    let confusion =
        ConfusionMatrix::from_predictions(&predictions.actual, &predictions.predicted, catalog.len());
    let report = ClassificationReport::from_confusion(&confusion, catalog);

    Ok(Evaluation {
        report,
        confusion,
        mean_loss: predictions.mean_loss,
    })
}
