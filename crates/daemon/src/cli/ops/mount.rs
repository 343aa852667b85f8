use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;
use url::Url;

use common::prelude::MemoryRoomState;
use matrixfs_daemon::config::{Config, ConfigError};
use matrixfs_daemon::{logging, DaemonError, MatrixClient, MatrixError, RunSummary};

#[derive(Args, Debug, Clone)]
pub struct Mount {
    /// Directory to mount on; without one the room is only kept in sync
    pub mount_point: Option<PathBuf>,

    #[arg(long)]
    pub homeserver: Option<Url>,

    /// Room id, e.g. `!abc:example.org`
    #[arg(long)]
    pub room: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    /// Read the password from this file
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Read an access token from this file
    #[arg(long)]
    pub access_token_file: Option<PathBuf>,

    /// Serve an empty in-memory room instead of a homeserver
    #[arg(long)]
    pub memory: bool,

    /// Do not follow live room changes
    #[arg(long)]
    pub no_listen: bool,

    /// Seconds before idle file content is evicted; negative disables
    #[arg(long, allow_negative_numbers = true)]
    pub retention: Option<i64>,

    #[arg(long)]
    pub allow_other: bool,

    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Repeat for more detail (up to -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Mount {
    /// Command line settings win over the file
    fn apply(&self, config: &mut Config) {
        if let Some(homeserver) = &self.homeserver {
            config.homeserver = Some(homeserver.clone());
        }
        if let Some(room) = &self.room {
            config.room = Some(room.clone());
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        if let Some(path) = &self.password_file {
            config.password = None;
            config.password_file = Some(path.clone());
        }
        if let Some(path) = &self.access_token_file {
            config.access_token = None;
            config.access_token_file = Some(path.clone());
        }
        if let Some(mount_point) = &self.mount_point {
            config.mount_point = Some(mount_point.clone());
        }
        if let Some(retention) = self.retention {
            config.retention_secs = retention;
        }
        if let Some(log_dir) = &self.log_dir {
            config.log_dir = Some(log_dir.clone());
        }
        if self.no_listen {
            config.listen = false;
        }
        if self.allow_other {
            config.allow_other = true;
        }
        config.verbosity = config.verbosity.max(self.verbose);
    }
}

#[derive(Debug)]
pub struct MountOutput {
    pub room: String,
    pub summary: RunSummary,
}

impl fmt::Display for MountOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} paths, {} rejected at start)",
            "unmounted".green(),
            self.room.bold(),
            self.summary.paths,
            self.summary.catch_up.rejected
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot reach homeserver: {0}")]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Mount {
    type Error = MountError;
    type Output = MountOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = Config::load(ctx.config_path.as_deref())?;
        self.apply(&mut config);
        config.validate(self.memory)?;

        let _log = logging::init(config.verbosity, config.log_dir.as_deref());
        let options = config.mount_options();
        let mount_point = config.mount_point.as_deref();

        if self.memory {
            let user = config
                .user
                .clone()
                .unwrap_or_else(|| "@local:localhost".to_string());
            tracing::info!("serving an in-memory room as {}", user);
            let summary = matrixfs_daemon::run(
                MemoryRoomState::writable(user),
                options,
                mount_point,
                config.allow_other,
            )
            .await?;
            return Ok(MountOutput {
                room: "in-memory room".to_string(),
                summary,
            });
        }

        let homeserver = config
            .homeserver
            .clone()
            .ok_or(ConfigError::Missing("homeserver"))?;
        let room = config.room.clone().ok_or(ConfigError::Missing("room"))?;
        let credentials = config.credentials()?;

        let client = MatrixClient::connect(&homeserver, &room, &credentials).await?;
        let summary = matrixfs_daemon::run(client, options, mount_point, config.allow_other).await?;
        Ok(MountOutput { room, summary })
    }
}
