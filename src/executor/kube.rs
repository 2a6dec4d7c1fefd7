//! Command runner for a workload in a Kubernetes pod

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use super::local::LocalRunner;
use super::{CommandRunner, ExecOutput, ExecRequest};
use crate::config::WolfPgConfig;
use crate::error::{Error, Result};

/// Runs commands inside the database pod through `kubectl exec`, with the
/// operator supplied kubeconfig.
pub struct KubectlRunner {
    kubectl: String,
    kubeconfig: PathBuf,
    namespace: Option<String>,
    pod: String,
    inner: LocalRunner,
}

impl KubectlRunner {
    /// Write the kubeconfig (mode 0600) into the state directory and build
    /// the runner
    pub fn new(config: &WolfPgConfig) -> Result<Self> {
        let pod = config
            .exec
            .pod
            .clone()
            .ok_or_else(|| Error::Config("exec.pod is required in kubectl mode".into()))?;

        std::fs::create_dir_all(config.state_dir())?;
        let kubeconfig = config.state_dir().join("kubeconfig");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&kubeconfig)?;
        file.write_all(config.options.kubeconfig.as_bytes())?;

        Ok(Self {
            kubectl: config.exec.kubectl.clone(),
            kubeconfig,
            namespace: config.exec.namespace.clone(),
            pod,
            inner: LocalRunner::new(config.exec_timeout()),
        })
    }

    /// The `kubectl exec` invocation wrapping `request`.
    ///
    /// Environment values never go on the kubectl command line: when there
    /// are any, a small `sh` script exporting them is sent on stdin, with the
    /// request's own input as a here-document.
    fn wrap(&self, request: &ExecRequest) -> ExecRequest {
        let mut argv = vec![
            self.kubectl.clone(),
            "--kubeconfig".to_string(),
            self.kubeconfig.display().to_string(),
            "exec".to_string(),
        ];
        if request.stdin.is_some() || !request.env.is_empty() {
            argv.push("-i".to_string());
        }
        if let Some(ns) = &self.namespace {
            argv.push("-n".to_string());
            argv.push(ns.clone());
        }
        argv.push(self.pod.clone());
        argv.push("--".to_string());

        let mut command = Vec::new();
        if let Some(user) = &request.user {
            command.extend(["runuser".to_string(), "-u".to_string(), user.clone(), "--".to_string()]);
        }
        command.extend(request.argv.iter().cloned());

        if request.env.is_empty() {
            argv.extend(command);
            return ExecRequest {
                argv,
                stdin: request.stdin.clone(),
                ..Default::default()
            };
        }

        let mut script = String::new();
        for (key, value) in &request.env {
            script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
        let quoted: Vec<String> = command.iter().map(|arg| shell_quote(arg)).collect();
        script.push_str("exec ");
        script.push_str(&quoted.join(" "));
        match &request.stdin {
            Some(input) => {
                script.push_str(&format!(" <<'{}'\n", HEREDOC_MARK));
                script.push_str(input);
                if !input.ends_with('\n') {
                    script.push('\n');
                }
                script.push_str(HEREDOC_MARK);
                script.push('\n');
            }
            None => script.push_str(" </dev/null\n"),
        }

        argv.extend(["sh".to_string(), "-s".to_string()]);
        ExecRequest {
            argv,
            stdin: Some(script),
            ..Default::default()
        }
    }
}

const HEREDOC_MARK: &str = "WOLFPG_STDIN";

/// Single-quote a word for `sh`
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

#[async_trait::async_trait]
impl CommandRunner for KubectlRunner {
    async fn run(&self, request: &ExecRequest) -> Result<ExecOutput> {
        tracing::debug!(pod = %self.pod, "kubectl exec: {}", request);
        let output = self.inner.run(&self.wrap(request)).await?;

        // kubectl itself failing to reach the API server is not the
        // command's fault; retry on the next pass.
        if output.code == Some(1) && output.stderr.contains("Unable to connect to the server") {
            return Err(Error::CollaboratorUnreachable(output.stderr.trim().to_string()));
        }
        Ok(output)
    }
}
