use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::{SandboxError, SandboxResult};

/// Runs batches of shell commands on behalf of a session.
///
/// Returns one output chunk per command, in order, with stderr merged into stdout.
/// Backends may keep state (files, installed packages) per session id, but a batch
/// must not rely on the shell state left behind by a previous batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Directory new sessions start in
    fn workdir(&self) -> String;

    async fn exec(&self, session: &str, commands: &[String]) -> SandboxResult<Vec<String>>;

    /// Release whatever the backend holds for `session`
    async fn stop(&self, session: &str) -> SandboxResult<()>;
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Program and leading arguments of the container CLI, e.g. `["podman"]`
    pub command: Vec<String>,
    pub image: String,
    /// Network mode passed to `docker run --network`
    pub network: Option<String>,
    /// Working directory inside the container
    pub workdir: String,
    /// Bind mount as (host path, container path)
    pub mount: Option<(String, String)>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            command: vec!["docker".to_string()],
            image: "nielsrolf/minichain:latest".to_string(),
            network: None,
            workdir: "/workspace".to_string(),
            mount: None,
        }
    }
}

/// One long-lived container per session, driven through the docker CLI
pub struct DockerBackend {
    config: DockerConfig,
    /// Containers by name, initialized once `docker run` succeeded
    started: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn program(&self) -> &str {
        self.config
            .command
            .first()
            .map(String::as_str)
            .unwrap_or("docker")
    }

    fn docker(&self) -> Command {
        let mut command = Command::new(self.program());
        command.args(self.config.command.iter().skip(1));
        command
    }

    fn container_name(session: &str) -> String {
        let session: String = session
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        format!("minichain-{}", session)
    }

    fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            self.config.workdir.clone(),
        ];
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some((host, container)) = &self.config.mount {
            args.push("-v".to_string());
            args.push(format!("{}:{}:rw", host, container));
        }
        // keep the container alive between batches
        args.push(self.config.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }

    /// Start the session's container unless it runs already.
    ///
    /// Only the map lookup holds the lock, so a slow start (e.g. an image pull) does not
    /// hold up other sessions. A failed start is retried by the next call.
    async fn ensure_started(&self, session: &str) -> SandboxResult<String> {
        let name = Self::container_name(session);
        let cell = self
            .started
            .lock()
            .await
            .entry(name.clone())
            .or_default()
            .clone();
        cell.get_or_try_init(|| self.start_container(&name)).await?;
        Ok(name)
    }

    async fn start_container(&self, name: &str) -> SandboxResult<()> {
        info!(container = %name, image = %self.config.image, "starting sandbox container");
        let output = self
            .docker()
            .args(self.run_args(name))
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                program: self.program().to_string(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ContainerStart(stderr.trim().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn workdir(&self) -> String {
        self.config.workdir.clone()
    }

    async fn exec(&self, session: &str, commands: &[String]) -> SandboxResult<Vec<String>> {
        let name = self.ensure_started(session).await?;
        let mut command = self.docker();
        command.args(["exec", "-i", name.as_str(), "bash", "-s"]);
        run_batch(command, commands).await
    }

    async fn stop(&self, session: &str) -> SandboxResult<()> {
        let name = Self::container_name(session);
        let started = self.started.lock().await.remove(&name);
        if !started.is_some_and(|cell| cell.initialized()) {
            return Ok(());
        }

        info!(container = %name, "removing sandbox container");
        let output = self
            .docker()
            .args(["rm", "-f", name.as_str()])
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                program: self.program().to_string(),
                source,
            })?;
        if !output.status.success() {
            warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "failed to remove sandbox container"
            );
        }
        Ok(())
    }
}

/// Runs batches with the host's bash, without any isolation.
///
/// Every batch starts a new shell in `root`, so nothing but the filesystem carries over.
pub struct HostShellBackend {
    root: PathBuf,
}

impl HostShellBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContainerBackend for HostShellBackend {
    fn workdir(&self) -> String {
        self.root.display().to_string()
    }

    async fn exec(&self, _session: &str, commands: &[String]) -> SandboxResult<Vec<String>> {
        let mut command = Command::new("bash");
        command.arg("-s").current_dir(&self.root);
        run_batch(command, commands).await
    }

    async fn stop(&self, _session: &str) -> SandboxResult<()> {
        Ok(())
    }
}

/// Feed the framed batch to a shell reading its script from stdin and split the output
async fn run_batch(mut command: Command, commands: &[String]) -> SandboxResult<Vec<String>> {
    let marker = format!("__minichain_{}__", uuid::Uuid::new_v4().simple());
    let script = batch_script(commands, &marker);
    debug!(commands = commands.len(), "running command batch");

    let program = command.as_std().get_program().to_string_lossy().to_string();
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SandboxError::Spawn { program, source })?;

    // output is drained while the script is written, a full stdout pipe would
    // otherwise stall the shell before it reads the rest of the script
    let stdin = child.stdin.take();
    let feed = async move {
        match stdin {
            // dropping stdin closes it, which ends the script
            Some(mut stdin) => stdin.write_all(script.as_bytes()).await,
            None => Ok(()),
        }
    };
    let (written, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    match written {
        // the shell exited early, reported below as missing output
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
        written => written?,
    }

    let stdout = String::from_utf8(output.stdout)?;
    let chunks = split_output(&stdout, &marker);
    if chunks.len() < commands.len() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(SandboxError::Exec(stderr.trim().to_string()));
        }
        return Err(SandboxError::MissingOutput {
            expected: commands.len(),
            actual: chunks.len(),
        });
    }
    Ok(chunks)
}

/// Wrap each command so it runs in the current shell without stdin, with stderr merged,
/// and print the marker on its own line once it is done
fn batch_script(commands: &[String], marker: &str) -> String {
    let mut script = String::new();
    for command in commands {
        script.push_str("{\n");
        script.push_str(command);
        script.push_str("\n} < /dev/null 2>&1\n");
        script.push_str(&format!("printf '%s\\n' '{}'\n", marker));
    }
    script
}

fn split_output(stdout: &str, marker: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in stdout.split_inclusive('\n') {
        let trimmed = line.strip_suffix('\n').unwrap_or(line);
        match trimmed.strip_suffix(marker) {
            // output without a trailing newline runs into the marker
            Some(rest) => {
                current.push_str(rest);
                chunks.push(std::mem::take(&mut current));
            }
            None => current.push_str(line),
        }
    }
    chunks
}

/// Single-quote `value` for the shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
