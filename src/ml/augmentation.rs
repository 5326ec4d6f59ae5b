//! 学習時のみのデータ拡張
//!
//! 回転・反転・ズーム・平行移動を1つのアフィン写像にまとめ、
//! 最近傍サンプリング + 反射パディングで適用します。
//! その後、画像ごとに明るさとコントラストを揺らします。

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::Rng;

use crate::model::config::AugmentationSettings;

/// 1画像分の幾何変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricParams {
    /// 回転角（ラジアン）
    pub angle: f64,
    pub flip: bool,
    /// 拡大率（>1で拡大）
    pub zoom: f64,
    /// 平行移動（ピクセル）
    pub shift_x: f64,
    pub shift_y: f64,
}

impl GeometricParams {
    pub const IDENTITY: Self = Self {
        angle: 0.0,
        flip: false,
        zoom: 1.0,
        shift_x: 0.0,
        shift_y: 0.0,
    };

    /// 出力座標 (x, y) に対応する入力座標（反射パディング済み）
    pub fn source_pixel(&self, x: usize, y: usize, width: usize, height: usize) -> (usize, usize) {
        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;

        // 平行移動とズームを戻す
        let u = (x as f64 - cx - self.shift_x) / self.zoom;
        let v = (y as f64 - cy - self.shift_y) / self.zoom;

        // 回転を戻す
        let (sin, cos) = self.angle.sin_cos();
        let ru = cos * u + sin * v;
        let rv = -sin * u + cos * v;

        let ru = if self.flip { -ru } else { ru };

        let sx = reflect((ru + cx).round() as i64, width);
        let sy = reflect((rv + cy).round() as i64, height);
        (sx, sy)
    }
}

/// 反射パディング (d c b a | a b c d | d c b a)
fn reflect(index: i64, len: usize) -> usize {
    let len = len as i64;
    let period = 2 * len;
    let m = index.rem_euclid(period);
    if m >= len {
        (period - 1 - m) as usize
    } else {
        m as usize
    }
}

/// データ拡張ステージ
#[derive(Debug, Clone, PartialEq)]
pub struct Augmentation {
    settings: AugmentationSettings,
}

impl Augmentation {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AugmentationSettings {
        &self.settings
    }

    fn has_geometric(&self) -> bool {
        let s = &self.settings;
        s.rotation_degrees > 0.0 || s.horizontal_flip || s.zoom_factor > 0.0 || s.translation > 0.0
    }

    /// 幾何変換パラメータを1画像分サンプリング
    pub fn sample_geometric<R: Rng + ?Sized>(&self, size: usize, rng: &mut R) -> GeometricParams {
        let s = &self.settings;
        let mut params = GeometricParams::IDENTITY;

        if s.rotation_degrees > 0.0 {
            params.angle = rng.gen_range(-s.rotation_degrees..=s.rotation_degrees).to_radians();
        }
        if s.horizontal_flip {
            params.flip = rng.gen_bool(0.5);
        }
        if s.zoom_factor > 0.0 {
            params.zoom = 1.0 + rng.gen_range(-s.zoom_factor..=s.zoom_factor);
        }
        if s.translation > 0.0 {
            let max_shift = s.translation * size as f64;
            params.shift_x = rng.gen_range(-max_shift..=max_shift);
            params.shift_y = rng.gen_range(-max_shift..=max_shift);
        }
        params
    }

    /// バッチ [N, C, H, W] ([0,1]) にデータ拡張を適用
    pub fn apply<B: Backend, R: Rng + ?Sized>(&self, images: Tensor<B, 4>, rng: &mut R) -> Tensor<B, 4> {
        let images = if self.has_geometric() {
            let [n, _, h, _] = images.dims();
            let params: Vec<GeometricParams> =
                (0..n).map(|_| self.sample_geometric(h, rng)).collect();
            warp(images, &params)
        } else {
            images
        };

        self.jitter_photometric(images, rng)
    }

    /// 画像ごとに明るさ・コントラストを変える
    fn jitter_photometric<B: Backend, R: Rng + ?Sized>(
        &self,
        images: Tensor<B, 4>,
        rng: &mut R,
    ) -> Tensor<B, 4> {
        let s = &self.settings;
        if s.brightness <= 0.0 && s.contrast <= 0.0 {
            return images;
        }

        let [n, _, _, _] = images.dims();
        let device = images.device();

        let mut images = images;
        if s.contrast > 0.0 {
            let factors: Vec<f32> = (0..n)
                .map(|_| 1.0 + rng.gen_range(-s.contrast..=s.contrast) as f32)
                .collect();
            let factors = Tensor::<B, 1>::from_floats(factors.as_slice(), &device).reshape([n, 1, 1, 1]);
            // チャネルごとの平均を保ったまま広げる
            let mean = images.clone().mean_dim(2).mean_dim(3);
            images = (images - mean.clone()) * factors + mean;
        }
        if s.brightness > 0.0 {
            let deltas: Vec<f32> = (0..n)
                .map(|_| rng.gen_range(-s.brightness..=s.brightness) as f32)
                .collect();
            let deltas = Tensor::<B, 1>::from_floats(deltas.as_slice(), &device).reshape([n, 1, 1, 1]);
            images = images + deltas;
        }

        images.clamp(0.0, 1.0)
    }
}

/// 画像ごとのアフィン写像で画素を並べ替える
pub fn warp<B: Backend>(images: Tensor<B, 4>, params: &[GeometricParams]) -> Tensor<B, 4> {
    let [n, c, h, w] = images.dims();
    let device = images.device();

    let mut indices = Vec::with_capacity(n * c * h * w);
    for (b, p) in params.iter().enumerate().take(n) {
        let sources: Vec<(usize, usize)> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| p.source_pixel(x, y, w, h))
            .collect();
        for channel in 0..c {
            let base = (b * c + channel) * h * w;
            indices.extend(sources.iter().map(|&(sx, sy)| (base + sy * w + sx) as i64));
        }
    }

    let len = indices.len();
    let indices = Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [len]), &device);

    images
        .reshape([n * c * h * w])
        .select(0, indices)
        .reshape([n, c, h, w])
}
