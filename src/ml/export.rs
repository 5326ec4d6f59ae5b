//! 学習済みモデルのエクスポート
//!
//! 学習グラフと推論専用グラフを tar.gz パッケージとして保存し、
//! 外部変換ツールでWeb向けのアセットを作ります。

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};

use crate::error::PipelineError;
use crate::ml::ml_model::SignClassifier;
use crate::model::config::{ConverterSettings, ExportSettings};
use crate::model::{save_model_with_metadata, ModelMetadata};

/// 学習グラフのパッケージ名
pub const FULL_PACKAGE_NAME: &str = "sign_classifier_full.tar.gz";
/// 推論専用グラフのパッケージ名
pub const INFERENCE_PACKAGE_NAME: &str = "sign_classifier.tar.gz";
/// 変換結果の出力先
pub const WEB_MODEL_DIR: &str = "web_model";

/// モジュールの重みをバイト列にする
pub fn record_bytes<B: Backend, M: Module<B>>(module: M) -> crate::error::Result<Vec<u8>> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(module.into_record(), ())
        .map_err(|e| PipelineError::Recorder(format!("{:?}", e)))
}

/// 外部変換プロセス
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    settings: ConverterSettings,
}

impl ExternalConverter {
    pub fn new(settings: ConverterSettings) -> Self {
        Self { settings }
    }

    /// `{input}` / `{output}` を置換した引数
    pub fn command_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.settings
            .args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }

    /// 変換を実行（出力ディレクトリは作成する）
    pub fn convert(&self, input: &Path, output: &Path) -> crate::error::Result<()> {
        std::fs::create_dir_all(output)?;
        let args = self.command_args(input, output);
        tracing::debug!("変換コマンド: {} {}", self.settings.program, args.join(" "));

        let result = Command::new(&self.settings.program)
            .args(&args)
            .output()
            .map_err(|e| {
                PipelineError::Conversion(format!(
                    "'{}' を起動できません: {}",
                    self.settings.program, e
                ))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(PipelineError::Conversion(format!(
                "'{}' が失敗しました ({}): {}",
                self.settings.program,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// エクスポートで作られたファイル
#[derive(Debug, Clone)]
pub struct ExportArtifacts {
    pub full_package: PathBuf,
    pub inference_package: PathBuf,
    /// 変換に失敗した場合は None
    pub web_model_dir: Option<PathBuf>,
}

/// モデルのエクスポート
pub struct Exporter {
    output_dir: PathBuf,
    converter: ExternalConverter,
}

impl Exporter {
    pub fn new(settings: &ExportSettings) -> Self {
        Self {
            output_dir: PathBuf::from(&settings.output_dir),
            converter: ExternalConverter::new(settings.converter.clone()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 学習済みモデルを保存して変換する
    ///
    /// `metadata` は推論パッケージ用（データ拡張なし）。
    /// 同じ出力先に再実行すると上書きされる。
    pub fn export<B: Backend>(
        &self,
        model: SignClassifier<B>,
        metadata: &ModelMetadata,
    ) -> anyhow::Result<ExportArtifacts> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("出力ディレクトリを作成できません: {:?}", self.output_dir))?;

        // 学習グラフ（データ拡張設定つき）
        let full_metadata = metadata
            .clone()
            .with_augmentation(model.augmentation().clone());
        let full_binary = record_bytes::<B, _>(model.clone())?;
        let full_package = save_model_with_metadata(
            &self.output_dir.join(FULL_PACKAGE_NAME),
            &full_metadata,
            &full_binary,
        )?;
        tracing::info!("学習グラフを保存しました: {}", full_package.display());

        // 推論専用グラフ
        let inference = model.into_inference();
        let mut inference_metadata = metadata.clone();
        inference_metadata.augmentation = None;
        let inference_binary = record_bytes::<B, _>(inference)?;
        let inference_package = save_model_with_metadata(
            &self.output_dir.join(INFERENCE_PACKAGE_NAME),
            &inference_metadata,
            &inference_binary,
        )?;
        tracing::info!("推論モデルを保存しました: {}", inference_package.display());

        let web_dir = self.output_dir.join(WEB_MODEL_DIR);
        let web_model_dir = match self.converter.convert(&inference_package, &web_dir) {
            Ok(()) => {
                tracing::info!("Web形式に変換しました: {}", web_dir.display());
                Some(web_dir)
            }
            Err(e) => {
                tracing::warn!("{}。推論パッケージはそのまま利用できます", e);
                None
            }
        };

        Ok(ExportArtifacts {
            full_package,
            inference_package,
            web_model_dir,
        })
    }
}
