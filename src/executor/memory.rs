//! In-memory collaborators
//!
//! Record every interaction so a reconciliation pass can be checked
//! without a database, a service manager or root privileges.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{CommandRunner, ExecOutput, ExecRequest, FileSpec, FileStore, Supervisor};
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Service supervisor double
#[derive(Debug)]
pub struct MemorySupervisor {
    reachable: AtomicBool,
    running: AtomicBool,
    actions: Mutex<Vec<String>>,
}

impl Default for MemorySupervisor {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            running: AtomicBool::new(false),
            actions: Mutex::new(Vec::new()),
        }
    }
}

impl MemorySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// `start` / `stop` calls so far, in order
    pub fn actions(&self) -> Vec<String> {
        lock(&self.actions).clone()
    }

    pub fn clear_actions(&self) {
        lock(&self.actions).clear();
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CollaboratorUnreachable("memory supervisor offline".into()))
        }
    }
}

#[async_trait::async_trait]
impl Supervisor for MemorySupervisor {
    async fn can_connect(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn is_running(&self) -> Result<bool> {
        self.ensure_reachable()?;
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn start(&self) -> Result<()> {
        self.ensure_reachable()?;
        self.running.store(true, Ordering::SeqCst);
        lock(&self.actions).push("start".to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.ensure_reachable()?;
        self.running.store(false, Ordering::SeqCst);
        lock(&self.actions).push("stop".to_string());
        Ok(())
    }
}

/// File store double
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: Mutex<BTreeMap<PathBuf, (String, FileSpec)>>,
    dirs: Mutex<BTreeMap<PathBuf, FileSpec>>,
    writes: Mutex<Vec<PathBuf>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without recording a write
    pub fn insert(&self, path: impl Into<PathBuf>, contents: &str) {
        lock(&self.files).insert(path.into(), (contents.to_string(), FileSpec::new(0o644)));
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        lock(&self.files).get(path).map(|(text, _)| text.clone())
    }

    pub fn spec(&self, path: &Path) -> Option<FileSpec> {
        lock(&self.files)
            .get(path)
            .map(|(_, spec)| spec.clone())
            .or_else(|| lock(&self.dirs).get(path).cloned())
    }

    /// Paths pushed so far, in order
    pub fn writes(&self) -> Vec<PathBuf> {
        lock(&self.writes).clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.writes).clear();
    }
}

#[async_trait::async_trait]
impl FileStore for MemoryFiles {
    async fn pull(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.contents(path))
    }

    async fn push(&self, path: &Path, contents: &str, spec: &FileSpec) -> Result<()> {
        lock(&self.files).insert(path.to_path_buf(), (contents.to_string(), spec.clone()));
        lock(&self.writes).push(path.to_path_buf());
        Ok(())
    }

    async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut files = lock(&self.files);
        let mut dirs = lock(&self.dirs);
        if recursive {
            files.retain(|p, _| !p.starts_with(path));
            dirs.retain(|p, _| !p.starts_with(path));
        } else {
            files.remove(path);
            dirs.remove(path);
        }
        Ok(())
    }

    async fn make_dir(&self, path: &Path, spec: &FileSpec) -> Result<()> {
        lock(&self.dirs).insert(path.to_path_buf(), spec.clone());
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let in_files = lock(&self.files).keys().any(|p| p.starts_with(path));
        Ok(in_files || lock(&self.dirs).contains_key(path))
    }
}

/// Command runner double.
///
/// Answers with scripted outputs per program name, in order, and with a
/// successful empty output once the script runs out.
#[derive(Debug, Default)]
pub struct MemoryRunner {
    scripted: Mutex<HashMap<String, VecDeque<ExecOutput>>>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl MemoryRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next answer for `program`
    pub fn respond(&self, program: &str, output: ExecOutput) {
        lock(&self.scripted)
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        lock(&self.requests).clone()
    }

    /// Requests made for `program`
    pub fn requests_for(&self, program: &str) -> Vec<ExecRequest> {
        lock(&self.requests)
            .iter()
            .filter(|r| r.program() == program)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for MemoryRunner {
    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput> {
        lock(&self.requests).push(request.clone());
        let scripted = lock(&self.scripted)
            .get_mut(request.program())
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| ExecOutput::ok("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_files_recursive_remove() {
        let files = MemoryFiles::new();
        files.insert("/data/PG_VERSION", "14");
        files.insert("/data/base/1", "x");
        files.insert("/etc/pg_hba.conf", "local all all peer");

        files.remove(Path::new("/data"), true).await.unwrap();
        assert!(!files.exists(Path::new("/data")).await.unwrap());
        assert!(files.exists(Path::new("/etc/pg_hba.conf")).await.unwrap());
        assert!(files.writes().is_empty());
    }

    #[tokio::test]
    async fn test_memory_runner_script_then_default() {
        let runner = MemoryRunner::new();
        runner.respond("psql", ExecOutput::failed(2, "connection refused"));

        let req = ExecRequest::new(["psql", "-c", "select 1"]);
        assert_eq!(runner.run(&req).await.unwrap().code, Some(2));
        assert!(runner.run(&req).await.unwrap().success());
        assert_eq!(runner.requests_for("psql").len(), 2);
    }

    #[tokio::test]
    async fn test_memory_supervisor_offline() {
        let supervisor = MemorySupervisor::new();
        supervisor.set_reachable(false);
        assert!(!supervisor.can_connect().await);
        assert!(supervisor.start().await.unwrap_err().should_defer());
    }
}
