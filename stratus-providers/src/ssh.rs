use crate::RemoteCommand;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use stratus_common::CpiError;
use tokio::process::Command;

const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "ConnectTimeout=10",
];

/// `RemoteCommand` over the system `ssh`/`scp` binaries, authenticated by
/// password through `sshpass -e` (the password travels in `SSHPASS`, never argv).
pub struct SshRemote {
    program: &'static str,
    command_timeout: Duration,
}

impl SshRemote {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            program: "sshpass",
            command_timeout,
        }
    }

    fn ssh_args(user: &str, host: &str, command: &str) -> Vec<String> {
        let mut args = vec!["-e".to_string(), "ssh".to_string()];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(format!("{}@{}", user, host));
        args.push(command.to_string());
        args
    }

    fn scp_args(user: &str, host: &str, local_file: &Path, remote_path: &str) -> Vec<String> {
        let mut args = vec!["-e".to_string(), "scp".to_string()];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(local_file.display().to_string());
        args.push(format!("{}@{}:{}", user, host, remote_path));
        args
    }

    async fn run(&self, password: &str, args: Vec<String>, label: &str) -> Result<String> {
        let failed = |message: String| CpiError::RemoteExecution {
            command: label.to_string(),
            message,
        };
        let child = Command::new(self.program)
            .args(&args)
            .env("SSHPASS", password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("spawning {}: {}", self.program, e)))?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(out) => out.map_err(|e| failed(format!("waiting for {}: {}", self.program, e)))?,
            Err(_) => return Err(failed(format!("timed out after {:?}", self.command_timeout)).into()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "exit={} stderr={}",
                output.status,
                tail_str(&stderr, 2000)
            ))
            .into());
        }
        Ok(stdout)
    }
}

#[async_trait]
impl RemoteCommand for SshRemote {
    async fn exec(&self, user: &str, password: &str, host: &str, command: &str) -> Result<String> {
        tracing::debug!(host, command, "ssh exec");
        self.run(password, Self::ssh_args(user, host, command), command)
            .await
    }

    async fn upload(
        &self,
        user: &str,
        password: &str,
        host: &str,
        local_file: &Path,
        remote_path: &str,
    ) -> Result<()> {
        tracing::debug!(host, remote_path, "scp upload");
        let label = format!("scp {}", remote_path);
        self.run(password, Self::scp_args(user, host, local_file, remote_path), &label)
            .await
            .map(|_| ())
    }
}

fn tail_str(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::{error_kind, ErrorKind};

    #[test]
    fn ssh_args_keep_password_out_of_argv() {
        let args = SshRemote::ssh_args("root", "10.1.2.3", "dmsetup ls");
        assert_eq!(args[0], "-e");
        assert_eq!(args[1], "ssh");
        assert_eq!(args[args.len() - 2], "root@10.1.2.3");
        assert_eq!(args[args.len() - 1], "dmsetup ls");
        assert!(args.iter().all(|a| !a.contains("secret")));
    }

    #[test]
    fn scp_args_target_remote_path() {
        let args = SshRemote::scp_args(
            "root",
            "10.1.2.3",
            Path::new("/tmp/iscsid_conf_x"),
            "/etc/iscsi/iscsid.conf",
        );
        assert_eq!(args[1], "scp");
        assert_eq!(args[args.len() - 2], "/tmp/iscsid_conf_x");
        assert_eq!(args[args.len() - 1], "root@10.1.2.3:/etc/iscsi/iscsid.conf");
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_str("abcdef", 3), "def");
        assert_eq!(tail_str("ab", 3), "ab");
        assert_eq!(tail_str("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn missing_client_binary_is_a_remote_failure() {
        let remote = SshRemote {
            program: "stratus-no-such-sshpass",
            command_timeout: Duration::from_secs(5),
        };
        let err = remote
            .exec("root", "secret", "10.1.2.3", "dmsetup ls")
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::RemoteExecution));
        assert!(err.to_string().contains("dmsetup ls"));
        assert!(err.to_string().contains("spawning stratus-no-such-sshpass"));
    }
}
