//! Remote shell access to the appliance host for the translation upload.
use crate::config::{SshConfig, DEFAULT_TRANSLATION_UTIL};
use crate::util::{file_name_of, truncate_string};
use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

const ERROR_INDICATORS: [&str; 5] = ["error", "failed", "cannot", "unable", "permission denied"];
const OUTPUT_LOG_BYTES: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// What the upload needs from a remote host.
pub trait RemoteShell {
    fn copy_file(&self, local: &Path, remote: &str) -> Result<()>;
    /// Run `command` on the host, feeding `stdin` to it. Non-zero exit is an error.
    fn run(&self, command: &str, stdin: &str) -> Result<CommandOutput>;
}

/// `ssh`/`scp` binaries found on PATH, optionally wrapped in `sshpass`.
pub struct SshShell {
    ssh: PathBuf,
    scp: PathBuf,
    sshpass: Option<PathBuf>,
    config: SshConfig,
}

impl SshShell {
    pub fn new(config: &SshConfig) -> Result<Self> {
        let ssh = which::which("ssh").context("locate ssh on PATH")?;
        let scp = which::which("scp").context("locate scp on PATH")?;
        let has_password = config
            .password
            .as_deref()
            .is_some_and(|password| !password.is_empty());
        let sshpass = if has_password && config.key_path.is_none() {
            match which::which("sshpass") {
                Ok(path) => Some(path),
                Err(_) => {
                    tracing::warn!("sshpass not found; ssh will rely on keys or an agent");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            ssh,
            scp,
            sshpass,
            config: config.clone(),
        })
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.username.trim(), self.config.ip_address.trim())
    }

    fn common_options(&self, port_flag: &str) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(port) = self.config.port {
            options.push(port_flag.to_string());
            options.push(port.to_string());
        }
        if let Some(key) = &self.config.key_path {
            options.push("-i".to_string());
            options.push(key.display().to_string());
        }
        options
    }

    fn command(&self, program: &Path, args: Vec<String>) -> Command {
        match (&self.sshpass, self.config.password.as_deref()) {
            (Some(sshpass), Some(password)) => {
                let mut command = Command::new(sshpass);
                command.env("SSHPASS", password).arg("-e").arg(program).args(args);
                command
            }
            _ => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        }
    }
}

fn execute(mut command: Command, what: &str, stdin: &str) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {what}"))?;

    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes())
            .with_context(|| format!("write stdin of {what}"))?;
    }

    let output = child
        .wait_with_output()
        .with_context(|| format!("wait for {what}"))?;
    tracing::info!(
        elapsed_ms = start.elapsed().as_millis(),
        stdout_bytes = output.stdout.len(),
        "{what} complete"
    );

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if !output.status.success() {
        return Err(anyhow!(
            "{what} failed with status {}: {}",
            output.status,
            truncate_string(result.stderr.trim(), OUTPUT_LOG_BYTES)
        ));
    }
    Ok(result)
}

impl RemoteShell for SshShell {
    fn copy_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut args = self.common_options("-P");
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.target()));
        execute(self.command(&self.scp, args), "scp", "")?;
        Ok(())
    }

    fn run(&self, command: &str, stdin: &str) -> Result<CommandOutput> {
        let mut args = self.common_options("-p");
        args.push(self.target());
        args.push(command.to_string());
        execute(self.command(&self.ssh, args), "ssh", stdin)
    }
}

pub fn has_error_indicator(output: &str) -> bool {
    let lower = output.to_lowercase();
    ERROR_INDICATORS
        .iter()
        .any(|indicator| lower.contains(indicator))
}

/// Remote command that runs the translation utility from its own directory as root.
pub fn translation_command(util_path: &str) -> Result<String> {
    let util_path = util_path.trim();
    let (dir, script) = match util_path.rsplit_once('/') {
        Some(("", script)) => ("/", script),
        Some((dir, script)) => (dir, script),
        None => (".", util_path),
    };
    if script.is_empty() {
        bail!("translation utility path {util_path:?} names no script");
    }
    let inner = format!(
        "cd {} && ./{} upload",
        shell_words::quote(dir),
        shell_words::quote(script)
    );
    Ok(format!("sudo -S -p '' sh -c {}", shell_words::quote(&inner)))
}

/// Copy the translation file to `/tmp` and feed it to the translation utility.
/// Returns the remote path on success.
pub fn upload_translation(
    shell: &dyn RemoteShell,
    config: &SshConfig,
    local: &Path,
) -> Result<String> {
    if !local.is_file() {
        bail!("translation file not found: {}", local.display());
    }
    let remote_path = format!("/tmp/{}", file_name_of(local));
    shell
        .copy_file(local, &remote_path)
        .with_context(|| format!("copy {} to {remote_path}", local.display()))?;
    tracing::info!(remote = %remote_path, "translation file copied");

    let util = config
        .translation_util_path
        .as_deref()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or(DEFAULT_TRANSLATION_UTIL);
    let command = translation_command(util)?;
    let password = config.password.as_deref().unwrap_or_default();
    let stdin = format!("{password}\n{remote_path}\n");
    let output = shell
        .run(&command, &stdin)
        .context("run translation utility")?;
    let combined = output.combined();
    if has_error_indicator(&combined) {
        bail!(
            "translation utility reported an error: {}",
            truncate_string(combined.trim(), OUTPUT_LOG_BYTES)
        );
    }
    tracing::info!(remote = %remote_path, "translation file uploaded");
    Ok(remote_path)
}
