pub mod types;
pub mod error;
pub mod logging;

// データセットとモデル保存
pub mod dataset;
pub mod model;
pub mod charts;
pub mod assets;

// 学習・推論（Burn）
#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod pipeline;

pub use error::{PipelineError, Result};
pub use types::{ClassCatalog, Sample};
