use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gpuqd", about = "GPU task scheduler daemon", version)]
pub struct Gpuqd {
    /// Path to the daemon config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset, e.g. "info" or "gpuq=debug".
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
