//! クラスごとの代表画像をWebアプリの公開ディレクトリにコピーする

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use hijaiyah_trainer_lib::assets::sync_assets;
use hijaiyah_trainer_lib::logging::{init_logging, LogConfig};

#[derive(Parser)]
#[command(name = "sync_assets", about = "各クラスの先頭画像を1枚ずつコピー")]
struct Args {
    /// データセットのルート
    #[arg(long, default_value = "dataset")]
    dataset_dir: PathBuf,

    /// コピー先
    #[arg(long, default_value = "../web-app/public/gestures")]
    dest_dir: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig::default())?;

    let report = sync_assets(&args.dataset_dir, &args.dest_dir)?;
    tracing::info!(
        "同期完了: {} 枚コピー, 画像なし {} クラス -> {}",
        report.copied.len(),
        report.missing.len(),
        args.dest_dir.display()
    );
    Ok(())
}
