use super::{CommandOutput, Host, apply_mask, msr_path};
use crate::util::error::HostError;
use crate::util::process::{run_with_timeout, shell_quote};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How to reach a remote host.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub hostname: String,
    pub username: Option<String>,
    pub private_key: Option<PathBuf>,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: None,
            private_key: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// A remote machine reached through one persistent SSH master connection.
///
/// The master is opened by [`RemoteHost::connect`] and torn down when the value is dropped,
/// every operation in between reuses it.
#[derive(Debug)]
pub struct RemoteHost {
    config: RemoteConfig,
    control_path: PathBuf,
    master: Option<Child>,
}

impl RemoteHost {
    pub fn connect(config: RemoteConfig) -> Result<Self, HostError> {
        let control_path = std::env::temp_dir().join(format!(
            "pwrcfg-{}-{}.sock",
            std::process::id(),
            config.hostname.replace(['/', ':'], "_")
        ));

        let mut host = Self {
            config,
            control_path,
            master: None,
        };

        let mut master = Command::new("ssh");
        master.args(host.common_args()).args(["-M", "-N", "-o", "ControlPersist=no"]);
        master.arg(&host.config.hostname);
        master
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("Opening SSH master connection to {}", host.config.hostname);
        host.master = Some(master.spawn()?);
        host.wait_for_master()?;
        Ok(host)
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.timeout.as_secs().max(1)),
            "-S".to_string(),
            self.control_path.display().to_string(),
        ];
        if let Some(user) = &self.config.username {
            args.extend(["-l".to_string(), user.clone()]);
        }
        if let Some(key) = &self.config.private_key {
            args.extend(["-i".to_string(), key.display().to_string()]);
        }
        args
    }

    fn wait_for_master(&mut self) -> Result<(), HostError> {
        let deadline = Instant::now() + self.config.timeout;

        loop {
            if let Some(master) = self.master.as_mut() {
                if let Some(status) = master.try_wait()? {
                    let mut reason = format!("ssh exited with {status}");
                    if let Some(mut stderr) = master.stderr.take() {
                        let mut msg = String::new();
                        let _ = std::io::Read::read_to_string(&mut stderr, &mut msg);
                        if !msg.trim().is_empty() {
                            reason = msg.trim().to_string();
                        }
                    }
                    self.master = None;
                    return Err(self.connection_error(reason));
                }
            }

            let mut check = Command::new("ssh");
            check
                .args(self.common_args())
                .args(["-O", "check"])
                .arg(&self.config.hostname);
            if run_with_timeout(check, None, self.config.timeout)?.exit_code == 0 {
                debug!("SSH master connection to {} is up", self.config.hostname);
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(self.connection_error(format!(
                    "no connection after {}s",
                    self.config.timeout.as_secs()
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn connection_error(&self, reason: String) -> HostError {
        HostError::Connection {
            host: self.config.hostname.clone(),
            reason,
        }
    }

    /// Run a shell command line on the remote side.
    fn exec(&self, command_line: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, HostError> {
        let mut command = Command::new("ssh");
        command
            .args(self.common_args())
            .arg(&self.config.hostname)
            .arg("--")
            .arg(command_line);
        // Reads of large files can take a while on slow links, the connect timeout only
        // bounds the handshake.
        run_with_timeout(command, stdin, self.config.timeout * 6)
    }

    /// Run a file operation and translate the remote shell's complaints into host errors.
    fn exec_file_op(
        &self,
        command_line: &str,
        stdin: Option<&[u8]>,
        path: &Path,
        writing: bool,
    ) -> Result<CommandOutput, HostError> {
        let output = self.exec(command_line, stdin)?;
        if output.exit_code == 0 {
            return Ok(output);
        }

        let stderr = output.stderr_str();
        let error_msg = format!("{}: Path: {:?}, Error: {}", self.name(), path.display(), stderr);
        Err(if stderr.contains("No such file") || stderr.contains("No such device") {
            HostError::PathMissing(format!("Path '{}' does not exist on {}", path.display(), self.name()))
        } else if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
            HostError::PermissionDenied(error_msg)
        } else if output.exit_code == 255 {
            self.connection_error(stderr)
        } else if writing {
            HostError::WriteError(error_msg)
        } else {
            HostError::ReadError(error_msg)
        })
    }
}

impl Host for RemoteHost {
    fn name(&self) -> &str {
        &self.config.hostname
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, HostError> {
        let cmd = format!("cat -- {}", shell_quote(&path.display().to_string()));
        Ok(self.exec_file_op(&cmd, None, path, false)?.stdout)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), HostError> {
        let quoted = shell_quote(&path.display().to_string());
        // `test -e` keeps the redirection from creating files that do not exist.
        let cmd = format!("test -e {quoted} || {{ echo 'No such file' >&2; exit 1; }}; cat > {quoted}");
        self.exec_file_op(&cmd, Some(data), path, true).map(|_| ())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>, HostError> {
        let cmd = format!("ls -1 -- {}", shell_quote(&path.display().to_string()));
        let output = self.exec_file_op(&cmd, None, path, false)?;
        let mut names: Vec<String> = output
            .stdout_str()
            .lines()
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_register(&self, cpu: u32, address: u32) -> Result<u64, HostError> {
        let path = msr_path(cpu);
        let cmd = format!(
            "dd if={} bs=8 count=1 skip={address} iflag=skip_bytes status=none",
            path.display()
        );
        let output = self.exec_file_op(&cmd, None, &path, false)?;
        let bytes: [u8; 8] = output.stdout.as_slice().try_into().map_err(|_| {
            HostError::ReadError(format!(
                "{}: MSR {address:#x} on CPU {cpu}: got {} bytes instead of 8",
                self.name(),
                output.stdout.len()
            ))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_register(&self, cpu: u32, address: u32, value: u64, mask: u64) -> Result<(), HostError> {
        let new = apply_mask(self.read_register(cpu, address)?, value, mask);
        let path = msr_path(cpu);
        let cmd = format!(
            "dd of={} bs=8 count=1 seek={address} oflag=seek_bytes conv=notrunc status=none",
            path.display()
        );
        self.exec_file_op(&cmd, Some(&new.to_le_bytes()), &path, true)
            .map(|_| ())
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, HostError> {
        if argv.is_empty() {
            return Err(HostError::NotSupported("empty command line".to_string()));
        }
        let line: Vec<String> = argv.iter().map(|arg| shell_quote(arg)).collect();
        self.exec(&line.join(" "), None)
    }
}

impl Drop for RemoteHost {
    fn drop(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };

        debug!("Closing SSH master connection to {}", self.config.hostname);
        let mut exit = Command::new("ssh");
        exit.args(self.common_args())
            .args(["-O", "exit"])
            .arg(&self.config.hostname);
        if let Err(e) = run_with_timeout(exit, None, self.config.timeout) {
            warn!("Failed to close SSH connection to {}: {e}", self.config.hostname);
        }

        let _ = master.kill();
        let _ = master.wait();
    }
}
