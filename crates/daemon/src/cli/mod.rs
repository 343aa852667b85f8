use std::path::PathBuf;

use clap::Parser;

pub mod op;
pub mod ops;

crate::command_enum! {
    (Mount, ops::Mount),
    (Config, ops::CheckConfig),
    (Version, ops::Version),
}

#[derive(Parser, Debug)]
#[command(name = "matrixfs", version, about = "Mount a Matrix room's state as a filesystem")]
pub struct Cli {
    /// Config file (default: $CONFIG_DIR/matrixfs/config.toml)
    #[arg(long, short, global = true, env = "MATRIXFS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}
