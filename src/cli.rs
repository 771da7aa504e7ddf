use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::util::DigestKind;

#[derive(Parser, Debug)]
#[command(
    name = "filingest",
    version,
    about = "Pipeline state and incremental sync tooling for scanned filing extraction"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Scan(ScanArgs),
    Delta(DeltaArgs),
    Plan(PlanArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    #[arg(long, default_value = ".cache/filingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub pages_root: PathBuf,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    pub stage: u32,

    #[arg(long, default_value = "[ILLEGIBLE]")]
    pub missing_marker: String,

    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    #[arg(long, default_value_t = false)]
    pub fresh: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeltaArgs {
    #[arg(long, default_value = ".cache/filingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub previous: PathBuf,

    #[arg(long)]
    pub current: Option<PathBuf>,

    #[arg(long)]
    pub snapshots_root: Option<PathBuf>,

    #[arg(long)]
    pub output: PathBuf,

    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    #[arg(long = "key-field")]
    pub key_fields: Vec<String>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[arg(long, default_value = ".cache/filingest")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub source_root: PathBuf,

    #[arg(long)]
    pub output_root: PathBuf,

    #[arg(long, default_value = "md")]
    pub output_ext: String,

    #[arg(long)]
    pub source_ext: Option<String>,

    #[arg(long)]
    pub hash_store: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = DigestKind::Blake3)]
    pub digest: DigestKind,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/filingest")]
    pub data_root: PathBuf,
}
