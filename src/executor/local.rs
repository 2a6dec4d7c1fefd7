//! Local collaborators: processes, systemd and the filesystem of this host

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{Group, User};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandRunner, ExecOutput, ExecRequest, FileSpec, FileStore, Supervisor};
use crate::error::{Error, Result};

/// Runs commands as child processes of the controller
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    timeout: Option<Duration>,
}

impl LocalRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    async fn execute(cmd: &mut Command, input: Option<&str>) -> std::io::Result<Output> {
        let Some(input) = input else {
            return cmd.output().await;
        };

        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
        }
        child.wait_with_output().await
    }
}

fn lookup_user(name: &str) -> Result<User> {
    User::from_name(name)
        .map_err(std::io::Error::from)?
        .ok_or_else(|| Error::Config(format!("unknown system user {}", name)))
}

fn lookup_group(name: &str) -> Result<Group> {
    Group::from_name(name)
        .map_err(std::io::Error::from)?
        .ok_or_else(|| Error::Config(format!("unknown system group {}", name)))
}

#[async_trait::async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| Error::Internal("empty command line".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        if let Some(name) = &request.user {
            let user = lookup_user(name)?;
            if user.uid != nix::unistd::getuid() {
                cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
            }
            cmd.env("HOME", &user.dir).env("USER", &user.name);
        }

        tracing::debug!("Running: {}", request);

        let run = Self::execute(&mut cmd, request.stdin.as_deref());
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| {
                    Error::CollaboratorUnreachable(format!("`{}` timed out after {:?}", request, limit))
                })??,
            None => run.await?,
        };

        Ok(ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Controls the database through systemd, via any command runner
pub struct SystemdSupervisor {
    runner: Arc<dyn CommandRunner>,
    service: String,
}

impl SystemdSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, service: impl Into<String>) -> Self {
        Self {
            runner,
            service: service.into(),
        }
    }

    async fn systemctl(&self, verb: &str) -> Result<ExecOutput> {
        let request = ExecRequest::new(["systemctl", verb, self.service.as_str()]);
        self.runner.run(&request).await?.check(&request)
    }
}

#[async_trait::async_trait]
impl Supervisor for SystemdSupervisor {
    async fn can_connect(&self) -> bool {
        let request = ExecRequest::new(["systemctl", "show", "--property=LoadState", self.service.as_str()]);
        match self.runner.run(&request).await {
            Ok(out) => out.success() && out.stdout.trim() == "LoadState=loaded",
            Err(e) => {
                tracing::debug!("systemd not reachable: {}", e);
                false
            }
        }
    }

    async fn is_running(&self) -> Result<bool> {
        let request = ExecRequest::new(["systemctl", "is-active", "--quiet", self.service.as_str()]);
        Ok(self.runner.run(&request).await?.success())
    }

    async fn start(&self) -> Result<()> {
        self.systemctl("start").await?;
        tracing::info!("Started {}", self.service);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await?;
        tracing::info!("Stopped {}", self.service);
        Ok(())
    }
}

/// The local filesystem, optionally re-rooted under a directory
#[derive(Debug, Clone, Default)]
pub struct LocalFiles {
    root: Option<PathBuf>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every absolute path under `root`
    pub fn scoped(root: impl Into<PathBuf>) -> Self {
        Self { root: Some(root.into()) }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }

    fn apply_spec(path: &Path, spec: &FileSpec) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(spec.mode))?;

        let uid = spec.owner.as_deref().map(lookup_user).transpose()?.map(|u| u.uid);
        let gid = spec.group.as_deref().map(lookup_group).transpose()?.map(|g| g.gid);
        if uid.is_some() || gid.is_some() {
            nix::unistd::chown(path, uid, gid).map_err(std::io::Error::from)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileStore for LocalFiles {
    async fn pull(&self, path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.resolve(path)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, path: &Path, contents: &str, spec: &FileSpec) -> Result<()> {
        let target = self.resolve(path);
        if spec.make_dirs {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&target, contents).await?;
        Self::apply_spec(&target, spec)
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let target = self.resolve(path);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_dir(&target).await?;
            }
        } else {
            tokio::fs::remove_file(&target).await?;
        }
        Ok(())
    }

    async fn make_dir(&self, path: &Path, spec: &FileSpec) -> Result<()> {
        let target = self.resolve(path);
        tokio::fs::create_dir_all(&target).await?;
        Self::apply_spec(&target, spec)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::symlink_metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
