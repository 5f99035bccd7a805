use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};
use tracksync_core::{Error, Result};

/// Address the plugin must listen on, passed through the environment.
pub const ADDR_ENV: &str = "TRACKSYNC_PLUGIN_ADDR";

/// A plugin executable started by the engine. Killed when dropped.
pub struct PluginProcess {
    name: String,
    child: Child,
}

impl PluginProcess {
    /// Spawn `command` (program plus arguments) for tracker `name`.
    ///
    /// The plugin's stderr is forwarded to the log line by line.
    pub fn spawn(name: &str, command: &[String], address: &str) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::InvalidConfig(format!("tracker '{name}' has an empty command")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(ADDR_ENV, address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        info!(tracker = name, program = %program, pid = ?child.id(), "plugin started");

        if let Some(stderr) = child.stderr.take() {
            let tracker = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(tracker = %tracker, "{line}");
                }
            });
        }

        Ok(Self {
            name: name.to_string(),
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the plugin and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(tracker = %self.name, error = %e, "plugin kill failed");
        }
    }
}
