//! Collaborators
//!
//! Everything the controller does to the outside world goes through one of
//! three traits: the service supervisor, the file store and the command
//! runner. Each has a production implementation and an in-memory one.

mod kube;
mod local;
pub mod memory;

use std::fmt;
use std::path::Path;

pub use kube::KubectlRunner;
pub use local::{LocalFiles, LocalRunner, SystemdSupervisor};
pub use memory::{MemoryFiles, MemoryRunner, MemorySupervisor};

use crate::error::{Error, Result};

/// Start / stop / query the database service
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    /// Whether the workload runtime can be talked to at all
    async fn can_connect(&self) -> bool;

    async fn is_running(&self) -> Result<bool>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }
}

/// Ownership and mode of a pushed file or created directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    /// `None` leaves ownership alone
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
    /// Create missing parent directories
    pub make_dirs: bool,
}

impl FileSpec {
    pub fn new(mode: u32) -> Self {
        Self {
            owner: None,
            group: None,
            mode,
            make_dirs: false,
        }
    }

    /// Owned by `user`, group of the same name
    pub fn owned_by(user: &str, mode: u32) -> Self {
        Self {
            owner: Some(user.to_string()),
            group: Some(user.to_string()),
            mode,
            make_dirs: false,
        }
    }

    pub fn make_dirs(mut self) -> Self {
        self.make_dirs = true;
        self
    }
}

/// Scoped access to the node's filesystem
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Read a file, `None` when it does not exist
    async fn pull(&self, path: &Path) -> Result<Option<String>>;

    async fn push(&self, path: &Path, contents: &str, spec: &FileSpec) -> Result<()>;

    /// Remove a file or directory; missing paths are not an error
    async fn remove(&self, path: &Path, recursive: bool) -> Result<()>;

    async fn make_dir(&self, path: &Path, spec: &FileSpec) -> Result<()>;

    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// Push `contents` unless the file already holds exactly that.
/// Returns whether anything was written.
pub async fn push_if_changed(
    files: &dyn FileStore,
    path: &Path,
    contents: &str,
    spec: &FileSpec,
) -> Result<bool> {
    if files.pull(path).await?.as_deref() == Some(contents) {
        return Ok(false);
    }
    files.push(path, contents, spec).await?;
    tracing::info!("Updated {}", path.display());
    Ok(true)
}

/// A command to run on the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Run as this system user instead of the controller's
    pub user: Option<String>,
    /// Fed to the command's standard input
    pub stdin: Option<String>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.argv.push(arg.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Only the command line is shown. Secrets travel in the environment or on
/// standard input, never in argv, so they stay out of logs and `ps`.
impl fmt::Display for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`Error::CommandFailed`]
    pub fn check(self, request: &ExecRequest) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: request.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run commands on the node
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput>;
}
