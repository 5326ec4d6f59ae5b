//! バッチの先読み
//!
//! バックグラウンドスレッドで次のバッチをデコードし、容量制限付きチャネルに積みます。
//! 1バッチ内の画像は rayon で並列にデコードします。

use std::sync::mpsc::{sync_channel, Receiver};
use std::thread::JoinHandle;

use rayon::prelude::*;

use crate::dataset::Preprocessor;
use crate::types::Sample;

/// デコード済みの1バッチ（CPUメモリ上）
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    /// (N, C, H, W) 順に平坦化した [0,1] 画素
    pub pixels: Vec<f32>,
    pub labels: Vec<usize>,
    pub image_size: usize,
}

impl DecodedBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// 先読みバッチのイテレータ
///
/// ドロップ時は受信側を閉じてからワーカーの終了を待つ。
pub struct BatchStream {
    receiver: Option<Receiver<DecodedBatch>>,
    worker: Option<JoinHandle<()>>,
    num_batches: usize,
}

impl BatchStream {
    /// `samples` を並び順のまま `batch_size` ごとに先読みする
    ///
    /// `depth` はチャネルに積めるバッチ数（最小1）
    pub fn spawn(
        samples: Vec<Sample>,
        batch_size: usize,
        preprocessor: Preprocessor,
        depth: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let num_batches = samples.len().div_ceil(batch_size);
        let (sender, receiver) = sync_channel(depth.max(1));

        let worker = std::thread::spawn(move || {
            for chunk in samples.chunks(batch_size) {
                let decoded: Vec<Vec<f32>> = chunk
                    .par_iter()
                    .map(|sample| preprocessor.load_or_blank(&sample.path))
                    .collect();

                let batch = DecodedBatch {
                    pixels: decoded.concat(),
                    labels: chunk.iter().map(|s| s.label).collect(),
                    image_size: preprocessor.image_size() as usize,
                };

                // 受信側が先に閉じられたら終了
                if sender.send(batch).is_err() {
                    tracing::debug!("先読みを中断しました");
                    break;
                }
            }
        });

        Self {
            receiver: Some(receiver),
            worker: Some(worker),
            num_batches,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

/// バッチ化と先読みの設定
#[derive(Debug, Clone, Copy)]
pub struct BatchLoader {
    pub preprocessor: Preprocessor,
    pub batch_size: usize,
    pub prefetch_depth: usize,
}

impl BatchLoader {
    pub fn new(preprocessor: Preprocessor, batch_size: usize, prefetch_depth: usize) -> Self {
        Self {
            preprocessor,
            batch_size,
            prefetch_depth,
        }
    }

    /// `samples` の並び順で先読みを開始
    pub fn stream(&self, samples: Vec<Sample>) -> BatchStream {
        BatchStream::spawn(samples, self.batch_size, self.preprocessor, self.prefetch_depth)
    }
}

impl Iterator for BatchStream {
    type Item = DecodedBatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        drop(self.receiver.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("先読みスレッドが異常終了しました");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_util::write_class_images;
    use crate::dataset::DatasetIndex;

    #[test]
    fn test_batches_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_class_images(dir.path(), "0_alif", 5, 8);
        write_class_images(dir.path(), "1_ba", 2, 8);
        let samples = DatasetIndex::scan(dir.path(), &[]).unwrap().samples();

        let stream = BatchStream::spawn(samples.clone(), 3, Preprocessor::new(4), 2);
        assert_eq!(stream.num_batches(), 3);

        let batches: Vec<DecodedBatch> = stream.collect();
        assert_eq!(batches.iter().map(DecodedBatch::len).collect::<Vec<_>>(), vec![3, 3, 1]);

        let labels: Vec<usize> = batches.iter().flat_map(|b| b.labels.clone()).collect();
        let expected: Vec<usize> = samples.iter().map(|s| s.label).collect();
        assert_eq!(labels, expected);

        for batch in &batches {
            assert_eq!(batch.pixels.len(), batch.len() * 3 * 4 * 4);
        }
    }

    #[test]
    fn test_corrupt_file_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"xx").unwrap();

        let samples = vec![Sample::new(broken, 1)];
        let batch = BatchStream::spawn(samples, 4, Preprocessor::new(4), 1)
            .next()
            .unwrap();
        assert_eq!(batch.labels, vec![1]);
        assert!(batch.pixels.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        write_class_images(dir.path(), "0_alif", 12, 8);
        let samples = DatasetIndex::scan(dir.path(), &[]).unwrap().samples();

        let loader = BatchLoader::new(Preprocessor::new(4), 1, 1);
        let mut stream = loader.stream(samples);
        assert_eq!(stream.num_batches(), 12);
        assert!(stream.next().is_some());
        drop(stream);
    }
}
