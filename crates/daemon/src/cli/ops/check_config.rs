use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use matrixfs_daemon::config::{Config, ConfigError, Credentials};

#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    /// Check only the local settings, as for `mount --memory`
    #[arg(long)]
    pub memory: bool,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub source: Option<PathBuf>,
    pub config: Config,
    /// Which credential is used, never the secret itself
    pub auth: Option<&'static str>,
}

impl fmt::Display for ConfigReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unset = || "unset".dimmed().to_string();
        let config = &self.config;

        writeln!(f, "{}:", "Config".bold())?;
        match &self.source {
            Some(path) => writeln!(f, "  {} {}", "file:".dimmed(), path.display())?,
            None => writeln!(f, "  {} {}", "file:".dimmed(), "built-in defaults".yellow())?,
        }
        writeln!(
            f,
            "  {} {}",
            "homeserver:".dimmed(),
            config
                .homeserver
                .as_ref()
                .map(|url| url.to_string())
                .unwrap_or_else(unset)
        )?;
        writeln!(
            f,
            "  {} {}",
            "room:".dimmed(),
            config.room.clone().unwrap_or_else(unset)
        )?;
        writeln!(
            f,
            "  {} {}",
            "auth:".dimmed(),
            self.auth.map(str::to_string).unwrap_or_else(unset)
        )?;
        writeln!(
            f,
            "  {} {}",
            "mount_point:".dimmed(),
            config
                .mount_point
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(unset)
        )?;
        writeln!(f, "  {} {}", "listen:".dimmed(), config.listen)?;
        if config.retention_secs < 0 {
            writeln!(f, "  {} {}", "retention:".dimmed(), "disabled".yellow())?;
        } else {
            writeln!(f, "  {} {}s", "retention:".dimmed(), config.retention_secs)?;
        }
        write!(f, "  {} {}", "status:".dimmed(), "OK".green())
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for CheckConfig {
    type Error = ConfigError;
    type Output = ConfigReport;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = Config::load(ctx.config_path.as_deref())?;
        config.validate(self.memory)?;

        let auth = if self.memory {
            None
        } else {
            Some(match config.credentials()? {
                Credentials::Password { .. } => "password",
                Credentials::AccessToken(_) => "access token",
            })
        };

        let source = ctx
            .config_path
            .clone()
            .or_else(|| Config::default_path().filter(|path| path.exists()));
        Ok(ConfigReport {
            source,
            config,
            auth,
        })
    }
}
