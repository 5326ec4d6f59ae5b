//! データセットの走査・バランス調整・分割・前処理

pub mod balancer;
pub mod indexer;
pub mod prefetch;
pub mod preprocess;
pub mod splitter;

pub use balancer::{oversample, oversample_samples, BalanceReport, BalancedDataset};
pub use indexer::{is_image_file, list_class_images, DatasetIndex, IMAGE_EXTENSIONS};
pub use prefetch::{BatchLoader, BatchStream, DecodedBatch};
pub use preprocess::{NormalizationStrategy, Preprocessor};
pub use splitter::{stratified_split, SplitFractions, SplitIndices, SplitOrder};

/// キャプチャツールが作成する既定のクラスフォルダ（ヒジャイヤ28文字）
pub const HIJAIYAH_CLASSES: [&str; 28] = [
    "0_alif", "1_ba", "2_ta", "3_tsa", "4_jim", "5_ha", "6_kho", "7_dal", "8_dzal", "9_ro",
    "10_zai", "11_sin", "12_syin", "13_sho", "14_dho", "15_tho", "16_zho", "17_ain",
    "18_ghain", "19_fa", "20_qof", "21_kaf", "22_lam", "23_mim", "24_nun", "25_wau", "26_Ha",
    "27_ya",
];

/// 分割数（train / val / test）
pub const NUM_SPLITS: usize = 3;
