//! パイプライン全体で使うエラー型
//!
//! データセット段階のエラーは致命的、変換エラーのみエクスポート側で警告に格下げされます。

use std::path::PathBuf;

use thiserror::Error;

/// 学習パイプラインのエラー
#[derive(Error, Debug)]
pub enum PipelineError {
    /// クラスフォルダが無い、または画像が1枚も無い
    #[error("データセットが空です: {0}")]
    EmptyDataset(String),

    /// クラスフォルダはあるが画像が0枚（オーバーサンプリング不可）
    #[error("クラス '{class_name}' に画像が1枚もありません")]
    EmptyClass { class_name: String },

    /// 層化分割に必要なサンプル数が足りない
    #[error("クラス '{class_name}' のサンプル数 {count} は層化分割に必要な {required} 未満です")]
    InsufficientSamples {
        class_name: String,
        count: usize,
        required: usize,
    },

    /// 損失が非有限値になった
    #[error("{phase} フェーズ epoch {epoch} で損失が発散しました (loss = {loss})")]
    TrainingDivergence {
        phase: String,
        epoch: usize,
        loss: f64,
    },

    /// 外部変換ツールの失敗
    #[error("Web形式への変換に失敗しました: {0}")]
    Conversion(String),

    /// 設定値の不整合
    #[error("設定エラー: {0}")]
    Config(String),

    /// 画像の読み込み失敗
    #[error("画像読み込み失敗 {path}: {message}")]
    Image { path: PathBuf, message: String },

    /// モデル重みの保存・読み込み失敗
    #[error("モデル重みの保存・読み込みエラー: {0}")]
    Recorder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_class() {
        let err = PipelineError::EmptyClass {
            class_name: "3_tsa".to_string(),
        };
        assert!(err.to_string().contains("3_tsa"));

        let err = PipelineError::InsufficientSamples {
            class_name: "1_ba".to_string(),
            count: 2,
            required: 3,
        };
        let message = err.to_string();
        assert!(message.contains("1_ba"));
        assert!(message.contains('2'));
    }
}
