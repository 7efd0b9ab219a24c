use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use self::scripts::{ScriptError, ScriptLibrary};
use self::ssh::{CommandOutput, RemoteShell, SshError, SshTarget};
use crate::db::models::Server;

pub mod acreboot;
pub mod encryption_service;
pub mod meminfo;
pub mod memtest;
pub mod ping;
pub mod reboot;
pub mod scripts;
pub mod ssh;

/// Result of a remote task, reported to the dashboard as-is.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub success: bool,
    pub message: String,
}

impl TaskOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Failure inside a multi-step task; rendered into a failed `TaskOutcome`.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("SSH error: {0}")]
    Ssh(#[from] SshError),
    #[error("{0}")]
    Remote(String),
}

impl From<TaskError> for TaskOutcome {
    fn from(err: TaskError) -> Self {
        TaskOutcome::failed(err.to_string())
    }
}

/// Everything a task needs besides the server itself.
#[derive(Clone)]
pub struct TaskContext {
    pub shell: Arc<dyn RemoteShell>,
    pub scripts: ScriptLibrary,
    pub download_dir: PathBuf,
}

impl TaskContext {
    /// Resolves the SSH target, turning a missing OS IP into a failed outcome.
    pub(crate) fn target(&self, server: &Server) -> Result<SshTarget, TaskOutcome> {
        SshTarget::for_server(server).map_err(|e| TaskOutcome::failed(e.to_string()))
    }

    /// Runs a step that must exit 0; `what` prefixes the stderr on failure.
    pub(crate) async fn exec_checked(
        &self,
        target: &SshTarget,
        command: &str,
        what: &str,
    ) -> Result<CommandOutput, TaskError> {
        let output = self.shell.exec(target, command).await?;
        if output.exit_status != 0 {
            return Err(TaskError::Remote(format!("{what}: {}", output.stderr.trim())));
        }
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::services::ssh::testing::FakeShell;

    pub const TEST_WEBHOOK_URL: &str = "http://10.0.0.100:8000/report/webhook";

    /// A context over `shell` whose script dir holds `files`.
    pub fn context_with_scripts(
        shell: Arc<FakeShell>,
        files: &[(&str, &str)],
    ) -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let script_dir = dir.path().join("scripts");
        std::fs::create_dir_all(&script_dir).unwrap();
        for (name, contents) in files {
            std::fs::write(script_dir.join(name), contents).unwrap();
        }
        let ctx = TaskContext {
            shell,
            scripts: ScriptLibrary::new(script_dir, TEST_WEBHOOK_URL),
            download_dir: dir.path().join("downloads"),
        };
        (dir, ctx)
    }

    /// Scripts that kill by command line must not run concurrently.
    #[cfg(unix)]
    static HOST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// A fake machine root for running generated scripts under local `bash`,
    /// with `/root/...` and `/etc/rc...` mapped into a temp dir.
    #[cfg(unix)]
    pub struct ScratchHost {
        dir: tempfile::TempDir,
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    #[cfg(unix)]
    impl ScratchHost {
        /// A host with an empty `/root` and a modified rc.local.
        pub fn new() -> Self {
            let guard = HOST_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let host = Self {
                dir: tempfile::tempdir().unwrap(),
                _guard: guard,
            };
            host.write("/root/.keep", "");
            host.write("/etc/rc.d/rc.local", "#!/bin/bash\nbash /root/Reboot/monitor_daemon.sh &\n");
            host.write("/etc/rc.local", "");
            host
        }

        pub fn path(&self, remote: &str) -> std::path::PathBuf {
            self.dir.path().join(remote.trim_start_matches('/'))
        }

        pub fn write(&self, remote: &str, contents: &str) {
            let path = self.path(remote);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }

        pub fn read(&self, remote: &str) -> String {
            std::fs::read_to_string(self.path(remote)).unwrap()
        }

        pub fn exists(&self, remote: &str) -> bool {
            self.path(remote).exists()
        }

        /// Names of the entries in a remote directory.
        pub fn list(&self, remote: &str) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.path(remote))
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        /// Runs `script` with its absolute paths rebased; returns (exit code, stdout).
        pub fn run(&self, script: &str) -> (Option<i32>, String) {
            let root = self.dir.path().to_string_lossy().into_owned();
            let rebased = regex::Regex::new(r"/root\b|/etc/rc")
                .unwrap()
                .replace_all(script, |caps: &regex::Captures| format!("{root}{}", &caps[0]));
            let output = std::process::Command::new("bash")
                .arg("-c")
                .arg(rebased.as_ref())
                .current_dir(self.dir.path())
                .output()
                .unwrap();
            (output.status.code(), String::from_utf8_lossy(&output.stdout).into_owned())
        }
    }
}
