//! 画像のデコードと前処理
//!
//! デコード → リサイズ（バイリニア） → [0,1] スケーリングまでをCPU上で行います。
//! 正規化はモデル内（データ拡張の直後）で行うため、ここでは扱いません。

use std::path::Path;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// ImageNetの平均（RGB）
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差（RGB）
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// [0,1] 入力に対する正規化方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationStrategy {
    /// そのまま [0,1]
    UnitRange,
    /// [-1,1]（MobileNetV2の前処理）
    #[default]
    Symmetric,
    /// ImageNetの平均・標準偏差で標準化
    #[serde(rename = "imagenet")]
    ImageNet,
}

impl NormalizationStrategy {
    /// チャネルごとの平均
    pub fn mean(&self) -> [f32; 3] {
        match self {
            Self::UnitRange => [0.0; 3],
            Self::Symmetric => [0.5; 3],
            Self::ImageNet => IMAGENET_MEAN,
        }
    }

    /// チャネルごとの標準偏差
    pub fn std(&self) -> [f32; 3] {
        match self {
            Self::UnitRange => [1.0; 3],
            Self::Symmetric => [0.5; 3],
            Self::ImageNet => IMAGENET_STD,
        }
    }

    /// 1画素値を正規化
    pub fn apply(&self, channel: usize, value: f32) -> f32 {
        (value - self.mean()[channel]) / self.std()[channel]
    }
}

/// 画像ファイルを (C, H, W) 順の `f32` 列にする
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    image_size: u32,
}

impl Preprocessor {
    pub fn new(image_size: u32) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// 1画像あたりの要素数 (3 * size * size)
    pub fn sample_len(&self) -> usize {
        3 * (self.image_size as usize) * (self.image_size as usize)
    }

    /// 画像を読み込み、リサイズして [0,1] にスケーリング
    ///
    /// 戻り値は (C, H, W) の順で平坦化した RGB 画素
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).map_err(|e| PipelineError::Image {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let img = img
            .resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8();

        let size = self.image_size;
        let mut data = Vec::with_capacity(self.sample_len());
        for channel in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    let pixel = img.get_pixel(x, y);
                    data.push(pixel[channel] as f32 / 255.0);
                }
            }
        }

        Ok(data)
    }

    /// 読み込みに失敗した場合は警告を出してゼロ画像を返す
    pub fn load_or_blank(&self, path: &Path) -> Vec<f32> {
        match self.load(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("{}。ゼロ画像で代用します", e);
                vec![0.0f32; self.sample_len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_load_resizes_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(64, 40, Rgb([255, 0, 51])).save(&path).unwrap();

        let pre = Preprocessor::new(16);
        let data = pre.load(&path).unwrap();
        assert_eq!(data.len(), 3 * 16 * 16);

        let plane = 16 * 16;
        assert!(data[..plane].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[plane..2 * plane].iter().all(|v| v.abs() < 1e-6));
        assert!(data[2 * plane..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_uppercase_extension_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CAPTURE.PNG");
        RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])).save_with_format(&path, image::ImageFormat::Png).unwrap();
        assert!(Preprocessor::new(8).load(&path).is_ok());
    }

    #[test]
    fn test_corrupt_image_becomes_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let pre = Preprocessor::new(8);
        assert!(matches!(pre.load(&path), Err(PipelineError::Image { .. })));

        let data = pre.load_or_blank(&path);
        assert_eq!(data.len(), pre.sample_len());
        assert!(data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_normalization_ranges() {
        let s = NormalizationStrategy::Symmetric;
        assert_eq!(s.apply(0, 0.0), -1.0);
        assert_eq!(s.apply(1, 1.0), 1.0);

        let u = NormalizationStrategy::UnitRange;
        assert_eq!(u.apply(2, 0.25), 0.25);

        let i = NormalizationStrategy::ImageNet;
        assert!((i.apply(0, 0.485)).abs() < 1e-6);

        let json = serde_json::to_string(&NormalizationStrategy::ImageNet).unwrap();
        assert_eq!(json, "\"imagenet\"");
    }
}
