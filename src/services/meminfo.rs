//! One-shot memory inventory: run a collector script and fetch its report.
use std::path::PathBuf;
use tracing::{error, info};

use super::scripts::file_name;
use super::ssh::{run_script, RemoteFile, SshTarget};
use super::{TaskContext, TaskError, TaskOutcome};
use crate::db::models::Server;

pub const REMOTE_MEM_DIR: &str = "/root/MemInfo";
pub const SCRIPT_MEM_INFO_NAME: &str = "get_memory_info.sh";

/// A report pulled from a managed machine and kept under the download dir.
#[derive(Debug, Clone)]
pub struct MemInfoReport {
    pub file_name: String,
    pub local_path: PathBuf,
    pub contents: Vec<u8>,
}

async fn try_deploy(ctx: &TaskContext, target: &SshTarget) -> Result<(), TaskError> {
    let script = ctx.scripts.read_bytes(SCRIPT_MEM_INFO_NAME).await?;
    ctx.exec_checked(
        target,
        &format!("rm -rf {REMOTE_MEM_DIR}; mkdir -p {REMOTE_MEM_DIR}"),
        "Preparing remote directory failed",
    )
    .await?;
    ctx.shell
        .upload(
            target,
            vec![RemoteFile::new(format!("{REMOTE_MEM_DIR}/{SCRIPT_MEM_INFO_NAME}"), script)],
        )
        .await?;
    ctx.shell
        .exec(target, &format!("chmod +x {REMOTE_MEM_DIR}/{SCRIPT_MEM_INFO_NAME}"))
        .await?;
    Ok(())
}

pub async fn deploy(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    match try_deploy(ctx, &target).await {
        Ok(()) => TaskOutcome::ok("MemInfo deployed"),
        Err(e) => {
            error!(server_id = %server.server_id, error = %e, "MemInfo deploy failed.");
            e.into()
        }
    }
}

pub async fn run(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Collecting memory info.");
    // Strip CR first: scripts edited on Windows fail with "command not found".
    let command = format!(
        "cd {REMOTE_MEM_DIR} && sed -i 's/\\r$//' {SCRIPT_MEM_INFO_NAME} && bash {SCRIPT_MEM_INFO_NAME} 2>&1"
    );
    run_script(ctx.shell.as_ref(), &target, &command).await
}

/// Flattens a server id into a single path component. Records loaded from an
/// old inventory file may predate the id check on insert.
fn local_prefix(server_id: &str) -> String {
    server_id.replace("..", "_").replace(['/', '\\'], "_")
}

async fn try_download(
    ctx: &TaskContext,
    server: &Server,
    target: &SshTarget,
) -> Result<MemInfoReport, TaskError> {
    let found = ctx
        .shell
        .exec(target, &format!("find {REMOTE_MEM_DIR} -name '*.txt' | head -1"))
        .await?;
    let remote_path = found.stdout.trim();
    if remote_path.is_empty() {
        return Err(TaskError::Remote("No result file found".to_string()));
    }

    let contents = ctx.shell.download(target, remote_path).await?;
    let file_name = format!("{}_{}", local_prefix(&server.server_id), file_name(remote_path));

    tokio::fs::create_dir_all(&ctx.download_dir)
        .await
        .map_err(|e| TaskError::Remote(format!("Cannot create download dir: {e}")))?;
    let local_path = ctx.download_dir.join(&file_name);
    tokio::fs::write(&local_path, &contents)
        .await
        .map_err(|e| TaskError::Remote(format!("Cannot save {file_name}: {e}")))?;

    info!(server_id = %server.server_id, path = ?local_path, "MemInfo report downloaded.");
    Ok(MemInfoReport {
        file_name,
        local_path,
        contents,
    })
}

pub async fn download(ctx: &TaskContext, server: &Server) -> Result<MemInfoReport, TaskOutcome> {
    let target = ctx.target(server)?;
    try_download(ctx, server, &target).await.map_err(|e| {
        error!(server_id = %server.server_id, error = %e, "MemInfo download failed.");
        e.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::testing::FakeShell;
    use crate::services::testing::context_with_scripts;
    use std::sync::Arc;

    fn server() -> Server {
        let mut server = Server::new("node-01", "10.0.0.1");
        server.os_ip = Some("10.0.1.1".to_string());
        server
    }

    #[tokio::test]
    async fn deploy_uploads_collector() {
        let shell = Arc::new(FakeShell::default());
        let (_dir, ctx) = context_with_scripts(shell.clone(), &[(SCRIPT_MEM_INFO_NAME, "dmidecode -t 17")]);

        let outcome = deploy(&ctx, &server()).await;
        assert!(outcome.success);
        assert_eq!(
            shell.uploaded("/root/MemInfo/get_memory_info.sh").unwrap(),
            "dmidecode -t 17"
        );
    }

    #[tokio::test]
    async fn download_saves_prefixed_copy() {
        let shell = Arc::new(FakeShell::default());
        shell.reply_stdout("/root/MemInfo/dimm_report.txt\n");
        *shell.download_contents.lock().unwrap() = Some(b"DIMM_A1 32GB".to_vec());
        let (dir, ctx) = context_with_scripts(shell.clone(), &[]);

        let report = download(&ctx, &server()).await.unwrap();
        assert_eq!(report.file_name, "node-01_dimm_report.txt");
        assert_eq!(report.contents, b"DIMM_A1 32GB");
        assert_eq!(report.local_path, dir.path().join("downloads").join("node-01_dimm_report.txt"));
        assert_eq!(std::fs::read(&report.local_path).unwrap(), b"DIMM_A1 32GB");
    }

    #[tokio::test]
    async fn download_stays_inside_download_dir() {
        let shell = Arc::new(FakeShell::default());
        shell.reply_stdout("/root/MemInfo/r.txt\n");
        *shell.download_contents.lock().unwrap() = Some(b"report".to_vec());
        let (dir, ctx) = context_with_scripts(shell.clone(), &[]);
        let mut server = server();
        server.server_id = "../escaped".to_string();

        let report = download(&ctx, &server).await.unwrap();
        assert_eq!(report.file_name, "__escaped_r.txt");
        assert_eq!(report.local_path.parent().unwrap(), dir.path().join("downloads"));
        assert!(!dir.path().join("escaped_r.txt").exists());
    }

    #[tokio::test]
    async fn download_without_report_fails() {
        let shell = Arc::new(FakeShell::default());
        shell.reply_stdout("");
        let (_dir, ctx) = context_with_scripts(shell.clone(), &[]);

        let outcome = download(&ctx, &server()).await.unwrap_err();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "No result file found");
    }
}
