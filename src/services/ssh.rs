use async_trait::async_trait;
use ssh2::{Channel, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::TaskOutcome;
use crate::db::models::Server;

const SSH_PORT: u16 = 22;
/// Marker the remote scripts print when a launch check fails.
const FAILURE_MARKER: &str = "FAILED:";
/// Exit status reported for a command that ended on a signal.
pub const SIGNALLED_EXIT_STATUS: i32 = -1;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum SshError {
    #[error("server {0} has no OS IP configured")]
    MissingOsIp(String),
    #[error("cannot reach {host}: {source}")]
    Connect {
        host: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Protocol(#[from] ssh2::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("SSH worker failed: {0}")]
    Worker(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub server_id: String,
    pub host: String,
    pub user: String,
    pub password: String,
}

impl SshTarget {
    pub fn for_server(server: &Server) -> Result<Self, SshError> {
        let host = server
            .os_address()
            .ok_or_else(|| SshError::MissingOsIp(server.server_id.clone()))?;
        Ok(Self {
            server_id: server.server_id.clone(),
            host: host.to_string(),
            user: server.ssh_user.clone(),
            password: server.ssh_password.clone(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Builds the output of a closed channel. A command killed by a signal
    /// reports no exit status, so the signal is turned into a failure here.
    pub fn finished(
        exit_status: i32,
        exit_signal: Option<String>,
        stdout: String,
        mut stderr: String,
    ) -> Self {
        let exit_status = match exit_signal {
            Some(signal) => {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("remote command terminated by signal {signal}"));
                SIGNALLED_EXIT_STATUS
            }
            None => exit_status,
        };
        Self {
            exit_status,
            stdout,
            stderr,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub remote_path: String,
    pub contents: Vec<u8>,
}

impl RemoteFile {
    pub fn new(remote_path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            remote_path: remote_path.into(),
            contents: contents.into(),
        }
    }
}

/// Command execution and file transfer on a managed machine.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, SshError>;
    async fn upload(&self, target: &SshTarget, files: Vec<RemoteFile>) -> Result<(), SshError>;
    async fn download(&self, target: &SshTarget, remote_path: &str) -> Result<Vec<u8>, SshError>;
}

/// Runs a remote script and folds the result into a task outcome.
pub async fn run_script(shell: &dyn RemoteShell, target: &SshTarget, command: &str) -> TaskOutcome {
    let preview: String = command.trim().chars().take(100).collect();
    debug!(server_id = %target.server_id, host = %target.host, "Running remote command: {}...", preview);

    match shell.exec(target, command).await {
        Ok(output) => {
            let stdout = output.stdout.trim();
            let stderr = output.stderr.trim();
            debug!(server_id = %target.server_id, exit_status = output.exit_status, "Remote command finished.");
            if !stderr.is_empty() {
                debug!(server_id = %target.server_id, "STDERR: {}", stderr);
            }
            let message = if !stdout.is_empty() {
                stdout.to_string()
            } else if !stderr.is_empty() {
                stderr.to_string()
            } else {
                "Command executed (no output)".to_string()
            };
            let success = output.exit_status == 0 && !stdout.contains(FAILURE_MARKER);
            TaskOutcome { success, message }
        }
        Err(e) => {
            warn!(server_id = %target.server_id, error = %e, "SSH command failed.");
            TaskOutcome::failed(format!("SSH connection error: {e}"))
        }
    }
}

/// `RemoteShell` over libssh2 with password authentication.
#[derive(Debug, Clone)]
pub struct Ssh2Shell {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Ssh2Shell {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    fn connect(target: &SshTarget, timeout: Duration) -> Result<Session, SshError> {
        let connect_err = |source| SshError::Connect {
            host: target.host.clone(),
            source,
        };
        let addr = (target.host.as_str(), SSH_PORT)
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(connect_err)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(timeout));
        session.handshake()?;
        session.userauth_password(&target.user, &target.password)?;
        info!(server_id = %target.server_id, host = %target.host, user = %target.user, "SSH session established.");
        Ok(session)
    }

    async fn blocking<T, F>(&self, target: &SshTarget, job: F) -> Result<T, SshError>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> Result<T, SshError> + Send + 'static,
    {
        let target = target.clone();
        let connect_timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;
        tokio::task::spawn_blocking(move || {
            let session = Self::connect(&target, connect_timeout)?;
            session.set_timeout(millis(command_timeout));
            job(session)
        })
        .await
        .map_err(|e| SshError::Worker(e.to_string()))?
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Reads one chunk from a non-blocking stream. `Ok(0)` also means "nothing yet".
fn read_some(stream: &mut impl Read, buf: &mut [u8], sink: &mut Vec<u8>) -> Result<usize, SshError> {
    match stream.read(buf) {
        Ok(n) => {
            sink.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Drains stdout and stderr together so neither stream can stall the other.
fn drain(
    session: &Session,
    channel: &mut Channel,
    deadline: Instant,
    timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>), SshError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];

    session.set_blocking(false);
    let drained = loop {
        let read = read_some(&mut *channel, &mut buf, &mut stdout)
            .and_then(|n| Ok(n + read_some(&mut channel.stderr(), &mut buf, &mut stderr)?));
        match read {
            Ok(0) if channel.eof() => break Ok(()),
            Ok(0) if Instant::now() >= deadline => break Err(SshError::Timeout(timeout)),
            Ok(0) => std::thread::sleep(POLL_INTERVAL),
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };
    session.set_blocking(true);
    drained.map(|()| (stdout, stderr))
}

#[async_trait]
impl RemoteShell for Ssh2Shell {
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<CommandOutput, SshError> {
        let command = command.to_string();
        let timeout = self.command_timeout;
        self.blocking(target, move |session| {
            let deadline = Instant::now() + timeout;
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;

            let (stdout, stderr) = drain(&session, &mut channel, deadline, timeout)?;

            channel.wait_close()?;
            let exit_status = channel.exit_status()?;
            let exit_signal = channel.exit_signal()?.exit_signal;
            Ok(CommandOutput::finished(
                exit_status,
                exit_signal,
                String::from_utf8_lossy(&stdout).into_owned(),
                String::from_utf8_lossy(&stderr).into_owned(),
            ))
        })
        .await
    }

    async fn upload(&self, target: &SshTarget, files: Vec<RemoteFile>) -> Result<(), SshError> {
        self.blocking(target, move |session| {
            let sftp = session.sftp()?;
            for file in files {
                let mut remote = sftp.create(Path::new(&file.remote_path))?;
                remote.write_all(&file.contents)?;
                debug!(path = %file.remote_path, bytes = file.contents.len(), "Uploaded file.");
            }
            Ok(())
        })
        .await
    }

    async fn download(&self, target: &SshTarget, remote_path: &str) -> Result<Vec<u8>, SshError> {
        let remote_path = remote_path.to_string();
        self.blocking(target, move |session| {
            let sftp = session.sftp()?;
            let mut remote = sftp.open(Path::new(&remote_path))?;
            let mut contents = Vec::new();
            remote.read_to_end(&mut contents)?;
            Ok(contents)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeShell;
    use super::*;

    fn target() -> SshTarget {
        let mut server = Server::new("node-01", "10.0.0.1");
        server.os_ip = Some("10.0.1.1".to_string());
        SshTarget::for_server(&server).unwrap()
    }

    #[test]
    fn target_requires_os_ip() {
        let server = Server::new("node-01", "10.0.0.1");
        assert!(matches!(
            SshTarget::for_server(&server),
            Err(SshError::MissingOsIp(id)) if id == "node-01"
        ));

        let t = target();
        assert_eq!(t.host, "10.0.1.1");
        assert_eq!(t.user, "root");
    }

    #[tokio::test]
    async fn run_script_prefers_stdout_then_stderr() {
        let shell = FakeShell::default();
        shell.reply_stdout("SUCCESS: Monitor Started (PID: 42)\n");
        shell.reply(CommandOutput {
            exit_status: 0,
            stdout: String::new(),
            stderr: "warning only".to_string(),
        });
        shell.reply(CommandOutput::default());

        let first = run_script(&shell, &target(), "echo").await;
        assert!(first.success);
        assert_eq!(first.message, "SUCCESS: Monitor Started (PID: 42)");

        let second = run_script(&shell, &target(), "echo").await;
        assert_eq!(second.message, "warning only");

        let third = run_script(&shell, &target(), "true").await;
        assert_eq!(third.message, "Command executed (no output)");
    }

    #[tokio::test]
    async fn run_script_flags_failures() {
        let shell = FakeShell::default();
        shell.reply_stdout("FAILED: Monitor failed to start");
        shell.reply(CommandOutput {
            exit_status: 1,
            stdout: String::new(),
            stderr: "cd: /root/Reboot: No such file or directory".to_string(),
        });
        shell.reply_unreachable();

        assert!(!run_script(&shell, &target(), "start").await.success);
        assert!(!run_script(&shell, &target(), "start").await.success);

        let unreachable = run_script(&shell, &target(), "start").await;
        assert!(!unreachable.success);
        assert!(unreachable.message.starts_with("SSH connection error:"));
    }

    #[tokio::test]
    async fn killed_command_is_a_failure() {
        // libssh2 reports exit status 0 when the channel closes on a signal.
        let output = CommandOutput::finished(0, Some("KILL".to_string()), String::new(), String::new());
        assert_eq!(output.exit_status, SIGNALLED_EXIT_STATUS);
        assert_eq!(output.stderr, "remote command terminated by signal KILL");

        let shell = FakeShell::default();
        shell.reply(output);
        let outcome = run_script(&shell, &target(), "stop").await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "remote command terminated by signal KILL");
    }

    #[test]
    fn clean_exit_keeps_status() {
        let output = CommandOutput::finished(3, None, "out".to_string(), "err\n".to_string());
        assert_eq!(
            output,
            CommandOutput {
                exit_status: 3,
                stdout: "out".to_string(),
                stderr: "err\n".to_string(),
            }
        );

        let appended =
            CommandOutput::finished(0, Some("TERM".to_string()), String::new(), "partial".to_string());
        assert_eq!(appended.stderr, "partial\nremote command terminated by signal TERM");
    }
}
