//! ヒジャイヤ手話文字分類モデルの学習CLI
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::Result;
use burn::backend::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use clap::{Parser, Subcommand, ValueEnum};

use hijaiyah_trainer_lib::logging::{init_logging, LogConfig};
use hijaiyah_trainer_lib::ml::InferenceEngine;
use hijaiyah_trainer_lib::model::{
    load_metadata, print_metadata_info, AppConfig, DeviceType, InferenceConfig,
};
use hijaiyah_trainer_lib::pipeline::run_pipeline;

#[derive(Parser)]
#[command(name = "hijaiyah_trainer", version, about = "ヒジャイヤ手話文字分類モデルの学習とエクスポート")]
struct Cli {
    /// 設定ファイル
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// デバッグログを表示
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Wgpu,
    Cpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Wgpu => DeviceType::Wgpu,
            DeviceArg::Cpu => DeviceType::Cpu,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// データセットから学習し、評価・エクスポートまで行う
    Train {
        /// クラスフォルダを並べたディレクトリ
        #[arg(long)]
        data_dir: Option<String>,
        /// 成果物の出力先
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// エクスポート済みモデルで画像を分類
    Predict {
        /// モデルパッケージ（.tar.gz）
        model: PathBuf,
        /// 分類する画像
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, value_enum)]
        device: Option<DeviceArg>,
    },
    /// モデルパッケージのメタデータを表示
    Inspect {
        model: PathBuf,
    },
    /// デフォルト設定ファイルを書き出す
    InitConfig {
        /// 出力先（省略時は --config または config.json）
        path: Option<PathBuf>,
    },
}

fn predict(model: PathBuf, images: Vec<PathBuf>, device: DeviceType) -> Result<()> {
    match device {
        DeviceType::Wgpu => predict_with::<Wgpu>(&model, &images, &WgpuDevice::default()),
        DeviceType::Cpu => predict_with::<NdArray>(&model, &images, &NdArrayDevice::Cpu),
    }
}

fn predict_with<B: burn::tensor::backend::Backend>(
    model: &Path,
    images: &[PathBuf],
    device: &B::Device,
) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model, device)?;
    for (path, (class_name, probability)) in images.iter().zip(engine.classify_batch(images)?) {
        println!("{}\t{}\t{:.4}", path.display(), class_name, probability);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::Train {
            data_dir,
            output_dir,
            device,
            seed,
        } => {
            let mut config = AppConfig::load_or_default(&config_path);
            if let Some(data_dir) = data_dir {
                config.dataset.root = data_dir;
            }
            if let Some(output_dir) = output_dir {
                config.export.output_dir = output_dir;
            }
            if let Some(device) = device {
                config.device_type = device.into();
            }
            if let Some(seed) = seed {
                config.dataset.seed = seed;
            }

            let summary = match config.device_type {
                DeviceType::Wgpu => {
                    run_pipeline::<Autodiff<Wgpu>>(&config, &WgpuDevice::default())?
                }
                DeviceType::Cpu => run_pipeline::<Autodiff<NdArray>>(&config, &NdArrayDevice::Cpu)?,
            };

            tracing::info!("推論モデル: {}", summary.artifacts.inference_package.display());
            if let Some(web_dir) = &summary.artifacts.web_model_dir {
                tracing::info!("Webモデル: {}", web_dir.display());
            }
        }
        Commands::Predict {
            model,
            images,
            device,
        } => {
            let device = device
                .map(DeviceType::from)
                .unwrap_or_else(|| AppConfig::load_or_default(&config_path).device_type);
            predict(model, images, device)?;
        }
        Commands::Inspect { model } => {
            let metadata = load_metadata(&model)?;
            print_metadata_info(&metadata);
            InferenceConfig::from_metadata(&metadata).print_info();
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or(config_path);
            AppConfig::default().save(&path)?;
            tracing::info!("デフォルト設定を書き出しました: {}", path.display());
        }
    }

    Ok(())
}
