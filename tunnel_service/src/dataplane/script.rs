//! Dataplane driven by external commands such as `wg-quick`.
//!
//! Each command runs under `/bin/sh -c` with the tunnel configuration file
//! path appended as its last argument. `TUNNEL_NAME` and `TUNNEL_CONFIG` are
//! also exported to the command's environment.

use super::{Dataplane, DataplaneError, DataplaneResult};
use crate::tunnel_config::{ConfigParser, IniConfigParser, TunnelConfig};
use async_trait::async_trait;
use shared_utils::config::DataplaneConfig;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ScriptDataplane {
    up_command: String,
    down_command: String,
    discover_command: Option<String>,
    config_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ScriptDataplane {
    pub fn new(
        up_command: impl Into<String>,
        down_command: impl Into<String>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            up_command: up_command.into(),
            down_command: down_command.into(),
            discover_command: None,
            config_dir: config_dir.into(),
            timeout: None,
        }
    }

    pub fn with_discover_command(mut self, command: impl Into<String>) -> Self {
        self.discover_command = Some(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn from_config(config: &DataplaneConfig) -> DataplaneResult<Self> {
        let up = config.up_command.as_deref().ok_or_else(|| {
            DataplaneError::Other("script dataplane requires up_command".to_string())
        })?;
        let down = config.down_command.as_deref().ok_or_else(|| {
            DataplaneError::Other("script dataplane requires down_command".to_string())
        })?;

        let mut dataplane = Self::new(up, down, &config.config_dir);
        if let Some(discover) = &config.discover_command {
            dataplane = dataplane.with_discover_command(discover);
        }
        if let Some(timeout) = config.timeout() {
            dataplane = dataplane.with_timeout(timeout);
        }
        Ok(dataplane)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.conf"))
    }

    async fn write_config(&self, name: &str, config: &TunnelConfig) -> DataplaneResult<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir).await?;

        // Configurations carry private keys: restrict before any content lands
        let path = self.config_path(name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        // A file left over from an earlier run keeps its old mode otherwise
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
        file.write_all(config.as_str().as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }

    async fn run(
        &self,
        command: &str,
        name: Option<&str>,
        config: Option<&Path>,
    ) -> DataplaneResult<Output> {
        let script = match config {
            Some(_) => format!("{command} \"$TUNNEL_CONFIG\""),
            None => command.to_string(),
        };

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(name) = name {
            cmd.env("TUNNEL_NAME", name);
        }
        if let Some(path) = config {
            cmd.env("TUNNEL_CONFIG", path);
        }

        info!(command = %script, tunnel = name.unwrap_or("-"), "Running dataplane command");

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| DataplaneError::Timeout {
                    command: command.to_string(),
                    timeout,
                })??,
            None => cmd.output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code().unwrap_or(-1);
            error!(command, code, %stderr, "Dataplane command failed");
            return Err(DataplaneError::CommandFailed {
                command: command.to_string(),
                code,
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(command, output = %stdout.trim(), "Dataplane command output");
        }
        Ok(output)
    }
}

#[async_trait]
impl Dataplane for ScriptDataplane {
    async fn bring_up(&self, name: &str, config: &TunnelConfig) -> DataplaneResult<()> {
        let path = self.write_config(name, config).await?;
        self.run(&self.up_command, Some(name), Some(&path)).await?;
        Ok(())
    }

    async fn tear_down(&self, name: &str) -> DataplaneResult<()> {
        let path = self.config_path(name);
        self.run(&self.down_command, Some(name), Some(&path)).await?;
        Ok(())
    }

    async fn discover(&self) -> DataplaneResult<Vec<(String, TunnelConfig)>> {
        let Some(command) = &self.discover_command else {
            return Ok(Vec::new());
        };

        let output = self.run(command, None, None).await?;
        let mut found = Vec::new();
        for name in String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
        {
            let config = match tokio::fs::read_to_string(self.config_path(&name)).await {
                Ok(text) => IniConfigParser.parse(&text).unwrap_or_else(|e| {
                    warn!(tunnel = %name, error = %e, "Stored configuration is invalid");
                    TunnelConfig::unknown()
                }),
                Err(_) => TunnelConfig::unknown(),
            };
            found.push((name, config));
        }
        Ok(found)
    }

    async fn release(&self, name: &str) -> DataplaneResult<()> {
        match tokio::fs::remove_file(self.config_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
