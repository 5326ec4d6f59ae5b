//! クラス不均衡の補正（オーバーサンプリング）
//!
//! 最多クラスの枚数 `max_count` に揃うまで、各クラス自身の画像から復元抽出で水増しします。

use std::path::PathBuf;

use rand::Rng;

use crate::error::{PipelineError, Result};
use crate::types::{ClassCatalog, Sample};

/// クラスごとの水増し結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceReport {
    /// 最多クラスの枚数
    pub max_count: usize,
    /// クラスID順の元の枚数
    pub original: Vec<usize>,
    /// クラスID順の追加枚数
    pub added: Vec<usize>,
}

/// 全クラスが `max_count` 枚になったサンプル列
#[derive(Debug, Clone)]
pub struct BalancedDataset {
    pub samples: Vec<Sample>,
    pub report: BalanceReport,
}

impl BalancedDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

/// クラスID順の画像パスをオーバーサンプリングする
///
/// 元の画像はすべて残し、不足分だけ同じクラスから一様に復元抽出して後ろに連結する。
pub fn oversample<R: Rng + ?Sized>(
    per_class: &[Vec<PathBuf>],
    catalog: &ClassCatalog,
    rng: &mut R,
) -> Result<BalancedDataset> {
    if let Some(label) = per_class.iter().position(Vec::is_empty) {
        return Err(PipelineError::EmptyClass {
            class_name: catalog
                .name(label)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", label)),
        });
    }

    let max_count = per_class.iter().map(Vec::len).max().unwrap_or(0);
    let mut samples = Vec::with_capacity(per_class.len() * max_count);
    let mut added = Vec::with_capacity(per_class.len());

    for (label, files) in per_class.iter().enumerate() {
        samples.extend(files.iter().map(|path| Sample::new(path.clone(), label)));

        let shortage = max_count - files.len();
        for _ in 0..shortage {
            let pick = rng.gen_range(0..files.len());
            samples.push(Sample::new(files[pick].clone(), label));
        }
        added.push(shortage);

        if shortage > 0 {
            tracing::debug!(
                "クラス '{}': {} 枚 + 複製 {} 枚",
                catalog.name(label).unwrap_or("?"),
                files.len(),
                shortage
            );
        }
    }

    tracing::info!(
        "バランス調整: 各クラス {} 枚, 合計 {} 枚 (複製 {} 枚)",
        max_count,
        samples.len(),
        added.iter().sum::<usize>()
    );

    Ok(BalancedDataset {
        samples,
        report: BalanceReport {
            max_count,
            original: per_class.iter().map(Vec::len).collect(),
            added,
        },
    })
}

/// サンプル列をクラスごとにまとめてからオーバーサンプリングする
pub fn oversample_samples<R: Rng + ?Sized>(
    samples: &[Sample],
    catalog: &ClassCatalog,
    rng: &mut R,
) -> Result<BalancedDataset> {
    let mut per_class = vec![Vec::new(); catalog.len()];
    for sample in samples {
        per_class[sample.label].push(sample.path.clone());
    }
    oversample(&per_class, catalog, rng)
}
