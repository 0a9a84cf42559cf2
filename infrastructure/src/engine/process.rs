//! Engine child process.
//!
//! Spawns the rendering engine with piped stdio so a [`MessageChannel`] can
//! run over its stdout/stdin. The child is killed on drop; on Linux the
//! kernel also delivers SIGTERM if the relay itself dies.

use crate::channel::MessageChannel;
use relay_application::ports::message_sink::ChannelError;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn engine `{executable}`: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("No engine executable configured")]
    NotConfigured,
}

/// How to launch the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub executable: PathBuf,
    pub project_path: Option<PathBuf>,
    /// Run without a window (`-batchmode`).
    pub batch_mode: bool,
    /// Static method the engine calls to start its side of the protocol.
    pub entry_method: String,
    pub extra_args: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            project_path: None,
            batch_mode: true,
            entry_method: "IPCBridge.StartIPC".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    pub fn with_entry_method(mut self, method: impl Into<String>) -> Self {
        self.entry_method = method.into();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Command line passed to the executable.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.batch_mode {
            args.push("-batchmode".to_string());
        }
        if let Some(project) = &self.project_path {
            args.push("-projectPath".to_string());
            args.push(project.display().to_string());
        }
        if !self.entry_method.is_empty() {
            args.push("-executeMethod".to_string());
            args.push(self.entry_method.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// A running engine (killed on Drop to prevent orphans).
pub struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    pub fn spawn(settings: &EngineSettings) -> Result<Self, EngineError> {
        if settings.executable.as_os_str().is_empty() {
            return Err(EngineError::NotConfigured);
        }
        let args = settings.command_args();
        debug!(
            "Spawning engine: {} {}",
            settings.executable.display(),
            args.join(" ")
        );

        let mut cmd = Command::new(&settings.executable);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Linux: SIGTERM the engine if the relay dies without running Drop.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| EngineError::Spawn {
            executable: settings.executable.display().to_string(),
            source,
        })?;
        info!(pid = child.id(), "Engine started");
        Ok(Self { child })
    }

    /// Hand the engine's stdio to `channel`: stdout/stdin carry records,
    /// stderr becomes diagnostic events. Can only be done once.
    pub async fn connect(&mut self, channel: &MessageChannel) -> Result<(), EngineError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(EngineError::MissingPipe("stdout"))?;
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or(EngineError::MissingPipe("stdin"))?;
        channel.start(stdout, stdin).await?;
        if let Some(stderr) = self.child.stderr.take() {
            channel.attach_diagnostics(stderr);
        }
        Ok(())
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit. `None` when terminated by a signal.
    pub async fn wait(&mut self) -> Result<Option<i32>, EngineError> {
        let status = self.child.wait().await?;
        info!(%status, "Engine exited");
        Ok(status.code())
    }

    pub async fn kill(&mut self) -> Result<(), EngineError> {
        self.child.kill().await?;
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        debug!("EngineProcess dropping, killing engine child process");
        let _ = self.child.start_kill();
    }
}
