use super::command::{ClientKind, ClientPaths};
use super::registry::ProcessRegistry;
use crate::config::LaunchMode;
use crate::utils::error::{Result, SpeedtestError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A running client process.
#[derive(Debug)]
pub struct ClientHandle {
    kind: ClientKind,
    registration: Option<u64>,
    child: Option<Child>,
}

impl ClientHandle {
    /// Handle that is not backed by a process.
    pub fn untracked(kind: ClientKind) -> Self {
        Self {
            kind,
            registration: None,
            child: None,
        }
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

/// Starts, validates and stops local proxy clients.
#[async_trait]
pub trait ClientLauncher: Send + Sync {
    /// Ask the client whether it accepts `config`. Clients without a test
    /// mode accept everything.
    async fn validate(&self, kind: ClientKind, config: &str) -> bool;

    async fn launch(&self, kind: ClientKind, config: &str) -> Result<ClientHandle>;

    /// Force-stop a client. Safe on processes that already exited.
    async fn terminate(&self, handle: ClientHandle);

    /// Synchronously kill every client this launcher started.
    fn terminate_all(&self);
}

/// Process-backed launcher.
pub struct ClientSupervisor {
    paths: ClientPaths,
    mode: LaunchMode,
    validate_timeout: Duration,
    registry: Arc<ProcessRegistry>,
}

impl ClientSupervisor {
    pub fn new(
        paths: ClientPaths,
        mode: LaunchMode,
        validate_timeout: Duration,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            paths,
            mode,
            validate_timeout,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    fn binary(&self, kind: ClientKind) -> Result<PathBuf> {
        let path = self.paths.binary(kind);
        std::fs::canonicalize(&path)
            .map_err(|_| SpeedtestError::ClientMissing(path.display().to_string()))
    }

    fn command(&self, kind: ClientKind, args: Vec<String>, stdin: bool) -> Result<Command> {
        let mut cmd = Command::new(self.binary(kind)?);
        cmd.args(args)
            .current_dir(self.paths.dir())
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }

    async fn write_config_file(&self, config: &str) -> Result<()> {
        tokio::fs::write(self.paths.config_path(), config).await?;
        Ok(())
    }

    fn spawn(&self, kind: ClientKind, mut cmd: Command) -> Result<Child> {
        cmd.spawn().map_err(|e| SpeedtestError::ClientSpawn {
            client: kind.to_string(),
            reason: e.to_string(),
        })
    }
}

async fn feed_stdin(child: &mut Child, config: &str) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpeedtestError::ClientStdin("stdin not captured".to_string()))?;
    stdin
        .write_all(config.as_bytes())
        .await
        .map_err(|e| SpeedtestError::ClientStdin(e.to_string()))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| SpeedtestError::ClientStdin(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl ClientLauncher for ClientSupervisor {
    async fn validate(&self, kind: ClientKind, config: &str) -> bool {
        let mode = kind.effective_mode(self.mode);
        let Some(args) = kind.test_args(mode) else {
            return true;
        };

        let outcome: Result<bool> = async {
            if mode == LaunchMode::File {
                self.write_config_file(config).await?;
            }
            let cmd = self.command(kind, args, mode == LaunchMode::Stdin)?;
            let mut child = self.spawn(kind, cmd)?;
            if mode == LaunchMode::Stdin {
                if let Err(e) = feed_stdin(&mut child, config).await {
                    let _ = child.start_kill();
                    return Err(e);
                }
            }
            match tokio::time::timeout(self.validate_timeout, child.wait()).await {
                Ok(status) => Ok(status?.success()),
                Err(_) => {
                    let _ = child.start_kill();
                    Err(SpeedtestError::timeout("client config validation"))
                }
            }
        }
        .await;

        match outcome {
            Ok(valid) => {
                debug!(client = %kind, valid, "Client config validated");
                valid
            }
            Err(e) => {
                warn!(client = %kind, error = %e, "Client config validation failed");
                false
            }
        }
    }

    async fn launch(&self, kind: ClientKind, config: &str) -> Result<ClientHandle> {
        let mode = kind.effective_mode(self.mode);
        if mode == LaunchMode::File {
            self.write_config_file(config).await?;
        }

        let cmd = self.command(kind, kind.run_args(mode), mode == LaunchMode::Stdin)?;
        let mut child = self.spawn(kind, cmd)?;
        let pid = child.id().unwrap_or_default();
        let registration = self.registry.register(pid, kind.binary_name());

        if mode == LaunchMode::Stdin {
            if let Err(e) = feed_stdin(&mut child, config).await {
                self.registry.terminate(registration);
                let _ = child.start_kill();
                return Err(e);
            }
        }

        info!(client = %kind, pid, ?mode, "Client launched");
        Ok(ClientHandle {
            kind,
            registration: Some(registration),
            child: Some(child),
        })
    }

    async fn terminate(&self, handle: ClientHandle) {
        if let Some(id) = handle.registration {
            self.registry.terminate(id);
        }
        if let Some(mut child) = handle.child {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_err()
            {
                warn!(client = %handle.kind, "Client did not exit after kill");
            }
        }
        debug!(client = %handle.kind, "Client terminated");
    }

    fn terminate_all(&self) {
        self.registry.terminate_all();
    }
}
