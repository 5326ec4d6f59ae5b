//! 層化ランダム分割（train / val / test）
//!
//! まず train と temp に分け、次に temp を val と test に半分ずつ分ける。
//! 各段階でクラスの比率を保つ。
//!
//! 割り当て規則:
//! - ホールドアウト側の総数は `ceil(fraction * n)`、残りが保持側
//! - クラスごとの数は比率の端数を最大剰余法で配分（同点は乱数で決める）
//! - クラス内ではシャッフルしてから先頭をホールドアウトにする

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::NUM_SPLITS;
use crate::error::{PipelineError, Result};
use crate::types::ClassCatalog;

/// オーバーサンプリングと分割の順序
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOrder {
    /// バランス調整後のリストを分割（複製が検証・テストにも入り得る）
    #[default]
    BalanceThenSplit,
    /// 元画像を分割してから学習データのみオーバーサンプリング
    SplitThenBalance,
}

/// 分割比率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitFractions {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl Default for SplitFractions {
    fn default() -> Self {
        Self {
            train: 0.70,
            val: 0.15,
            test: 0.15,
        }
    }
}

/// 入力リストに対する位置インデックスの3分割
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl SplitIndices {
    /// 分割ごとのクラス別枚数 (train, val, test)
    pub fn class_counts(&self, labels: &[usize], num_classes: usize) -> Vec<(usize, usize, usize)> {
        let mut counts = vec![(0, 0, 0); num_classes];
        for &i in &self.train {
            counts[labels[i]].0 += 1;
        }
        for &i in &self.val {
            counts[labels[i]].1 += 1;
        }
        for &i in &self.test {
            counts[labels[i]].2 += 1;
        }
        counts
    }
}

/// ラベル列を層化分割する
pub fn stratified_split<R: Rng + ?Sized>(
    labels: &[usize],
    catalog: &ClassCatalog,
    fractions: SplitFractions,
    rng: &mut R,
) -> Result<SplitIndices> {
    let mut counts = vec![0usize; catalog.len()];
    for &label in labels {
        counts[label] += 1;
    }
    for (label, &count) in counts.iter().enumerate() {
        if count < NUM_SPLITS {
            return Err(PipelineError::InsufficientSamples {
                class_name: catalog.name(label).unwrap_or("?").to_string(),
                count,
                required: NUM_SPLITS,
            });
        }
    }

    let all: Vec<usize> = (0..labels.len()).collect();
    let temp_fraction = fractions.val + fractions.test;
    let (train, temp) = stratified_holdout(&all, labels, catalog.len(), temp_fraction, rng);

    let test_fraction = fractions.test / temp_fraction;
    let (val, test) = stratified_holdout(&temp, labels, catalog.len(), test_fraction, rng);

    tracing::info!(
        "層化分割: train {} / val {} / test {}",
        train.len(),
        val.len(),
        test.len()
    );

    Ok(SplitIndices { train, val, test })
}

/// `indices` を保持側とホールドアウト側に分ける
fn stratified_holdout<R: Rng + ?Sized>(
    indices: &[usize],
    labels: &[usize],
    num_classes: usize,
    holdout_fraction: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let n = indices.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for &i in indices {
        members[labels[i]].push(i);
    }

    let holdout_total = ((holdout_fraction * n as f64) - 1e-9).ceil().max(0.0) as usize;
    let holdout_total = holdout_total.min(n);
    let quotas = allocate(&members, holdout_total, n, rng);

    let mut keep = Vec::with_capacity(n - holdout_total);
    let mut holdout = Vec::with_capacity(holdout_total);
    for (class_members, quota) in members.iter_mut().zip(quotas) {
        class_members.shuffle(rng);
        holdout.extend_from_slice(&class_members[..quota]);
        keep.extend_from_slice(&class_members[quota..]);
    }
    keep.sort_unstable();
    holdout.sort_unstable();
    (keep, holdout)
}

/// 最大剰余法でクラスごとのホールドアウト数を決める
fn allocate<R: Rng + ?Sized>(
    members: &[Vec<usize>],
    total: usize,
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    let exact: Vec<f64> = members
        .iter()
        .map(|m| total as f64 * m.len() as f64 / n as f64)
        .collect();
    let mut quotas: Vec<usize> = exact.iter().map(|x| x.floor() as usize).collect();
    let mut remaining = total - quotas.iter().sum::<usize>();

    let mut order: Vec<usize> = (0..members.len()).collect();
    order.shuffle(rng);
    order.sort_by(|&a, &b| {
        let ra = exact[a] - exact[a].floor();
        let rb = exact[b] - exact[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });

    for &class in order.iter().cycle().take(order.len() * 2) {
        if remaining == 0 {
            break;
        }
        if quotas[class] < members[class].len() {
            quotas[class] += 1;
            remaining -= 1;
        }
    }
    quotas
}
