//! Memory stress testing with memtester, reported back by a small daemon.
use tracing::{error, info};

use super::scripts::SAFE_KILL_FN;
use super::ssh::{run_script, RemoteFile, SshTarget};
use super::{TaskContext, TaskError, TaskOutcome};
use crate::db::models::Server;

pub const REMOTE_MEMTEST_DIR: &str = "/root/Memtest";
pub const SCRIPT_MEMTEST_NAME: &str = "memtester.sh";
pub const FILE_MEMTEST_TAR: &str = "memtester-4.6.0.tar.gz";
pub const DEFAULT_RUNTIME_SECS: &str = "3600";
const DAEMON_NAME: &str = "memtest_daemon.sh";
const LOG_DIR: &str = "/root/Test_Logs/Memtest";
/// Seconds between daemon reports.
const REPORT_INTERVAL_SECS: u32 = 30;

/// Runtime values end up in a `sed` expression on the target, so only plain
/// second counts are accepted.
pub fn validate_runtime(runtime: &str) -> Result<&str, String> {
    let runtime = runtime.trim();
    if !runtime.is_empty() && runtime.chars().all(|c| c.is_ascii_digit()) {
        Ok(runtime)
    } else {
        Err(format!("Invalid runtime {runtime:?}: expected a number of seconds"))
    }
}

fn setup_command() -> String {
    format!(
        r#"
rm -rf {REMOTE_MEMTEST_DIR}
mkdir -p {REMOTE_MEMTEST_DIR}
mkdir -p {LOG_DIR}
if ! command -v bc >/dev/null 2>&1; then yum install -y bc; fi
if ! command -v dos2unix >/dev/null 2>&1; then yum install -y dos2unix; fi
dmesg -c >/dev/null
"#
    )
}

fn install_command() -> String {
    format!(
        r#"
cd {REMOTE_MEMTEST_DIR} || exit 1
if command -v dos2unix >/dev/null 2>&1; then dos2unix -q *.sh; fi
tar -zxf {FILE_MEMTEST_TAR}
DIR_NAME=$(tar -tf {FILE_MEMTEST_TAR} | head -1 | cut -f1 -d"/")
if [ -d "$DIR_NAME" ]; then
    cd "$DIR_NAME"
    if [ ! -f "memtester" ]; then make && make install; fi
    cd ..
fi
chmod +x {SCRIPT_MEMTEST_NAME}
"#
    )
}

fn kill_command() -> String {
    format!(
        r#"
{SAFE_KILL_FN}
safe_kill "{DAEMON_NAME}"
safe_kill "{SCRIPT_MEMTEST_NAME}"
killall -9 memtester 2>/dev/null || true
safe_kill "bash -c .*memtester"
echo "SUCCESS: Memtest processes stopped"
"#
    )
}

/// Daemon that reports memtester progress to the webhook until it exits.
pub fn daemon_script(server_id: &str, webhook_url: &str) -> String {
    format!(
        r#"#!/bin/bash
SERVER_ID="{server_id}"
URL="{webhook_url}"

LOG_DIR="{LOG_DIR}"
mkdir -p "$LOG_DIR"
LOCAL_LOG="$LOG_DIR/memtest_detail.log"

rotate_log() {{
    local max_size=$((5 * 1024 * 1024))
    if [ -f "$LOCAL_LOG" ]; then
        local size=$(stat -c%s "$LOCAL_LOG")
        if [ $size -ge $max_size ]; then
            mv "$LOCAL_LOG" "$LOCAL_LOG.$(date +%Y%m%d_%H%M%S).bak"
            ls -t "$LOG_DIR"/*.bak | tail -n +4 | xargs -r rm
        fi
    fi
}}

log_to_local() {{
    echo "[$(date "+%Y-%m-%d %H:%M:%S")] $1" >> "$LOCAL_LOG"
    rotate_log
}}

report_backend() {{
    JSON_DATA="{{\"server_id\": \"$SERVER_ID\", \"task_type\": \"memtest\", \"phase\": \"$2\", \"status\": \"$1\"}}"
    curl --noproxy "*" -s -X POST "$URL" -H "Content-Type: application/json" -d "$JSON_DATA" >/dev/null 2>&1
}}

log_to_local "Daemon Started. Waiting 15s..."
sleep 15

while true; do
    RAW_PIDS=$(pgrep -f "memtester")
    VALID_PIDS=$(echo "$RAW_PIDS" | xargs -r ps -fp 2>/dev/null | grep -v "grep" | grep -v "{DAEMON_NAME}" | grep -v "bash -c" | grep -v "PID" | awk '{{print $2}}')
    COUNT=$(echo "$VALID_PIDS" | wc -w)

    if [ -n "$VALID_PIDS" ]; then
        MSG="Stress running ($COUNT workers)"
        log_to_local "$MSG"
        report_backend "Running" "$MSG"
    else
        MSG="Stress test finished"
        log_to_local "$MSG. Stopping Daemon."
        report_backend "Finished" "$MSG"
        exit 0
    fi
    sleep {REPORT_INTERVAL_SECS}
done
"#
    )
}

fn launch_command(runtime: &str) -> String {
    format!(
        r#"
cd {REMOTE_MEMTEST_DIR} || exit 1

if command -v dos2unix >/dev/null 2>&1; then dos2unix -q *.sh; fi
chmod +x {DAEMON_NAME}

sed -i 's/^runtime=[0-9]*/runtime={runtime}/' {SCRIPT_MEMTEST_NAME}

export DISPLAY=:0
nohup gnome-terminal --title="System Monitor" -- gnome-system-monitor >/dev/null 2>&1 < /dev/null &
sleep 2

# The script reads from its terminal, so it runs in a window that stays open.
nohup gnome-terminal --working-directory="{REMOTE_MEMTEST_DIR}" --title="Memtest Execution" --geometry=100x30 -- bash -c "./{SCRIPT_MEMTEST_NAME}; echo '===================='; echo 'Script Process Ended.'; exec bash" >/dev/null 2>&1 &

nohup ./{DAEMON_NAME} >/dev/null 2>&1 < /dev/null &

echo "SUCCESS: Memtest Launched in Terminal"
"#
    )
}

fn archive_command() -> String {
    format!(
        r#"
cd {REMOTE_MEMTEST_DIR} || exit 1
dmesg > dmesg.log

TIME_TAG=$(date +%Y%m%d_%H%M%S)
TAR_NAME="memtest_result_$TIME_TAG.tar.gz"

FILES_TO_TAR="dmesg.log"
if [ -d "mem_result" ]; then
    FILES_TO_TAR="$FILES_TO_TAR mem_result"
fi

tar -czf $TAR_NAME $FILES_TO_TAR
echo "SUCCESS: Archived Result to $TAR_NAME"
"#
    )
}

async fn try_deploy(ctx: &TaskContext, target: &SshTarget) -> Result<(), TaskError> {
    ctx.scripts
        .ensure_present(&[SCRIPT_MEMTEST_NAME, FILE_MEMTEST_TAR])?;
    let script = ctx.scripts.read_bytes(SCRIPT_MEMTEST_NAME).await?;
    let tarball = ctx.scripts.read_bytes(FILE_MEMTEST_TAR).await?;

    ctx.exec_checked(target, &setup_command(), "Environment setup failed")
        .await?;
    ctx.shell
        .upload(
            target,
            vec![
                RemoteFile::new(format!("{REMOTE_MEMTEST_DIR}/{SCRIPT_MEMTEST_NAME}"), script),
                RemoteFile::new(format!("{REMOTE_MEMTEST_DIR}/{FILE_MEMTEST_TAR}"), tarball),
            ],
        )
        .await?;
    ctx.exec_checked(target, &install_command(), "Build failed")
        .await?;
    Ok(())
}

pub async fn deploy(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Deploying memtest environment.");

    match try_deploy(ctx, &target).await {
        Ok(()) => TaskOutcome::ok("Memtest environment deployed"),
        Err(e) => {
            error!(server_id = %server.server_id, error = %e, "Memtest deploy failed.");
            e.into()
        }
    }
}

pub async fn start(ctx: &TaskContext, server: &Server, runtime: &str) -> TaskOutcome {
    let runtime = match validate_runtime(runtime) {
        Ok(runtime) => runtime,
        Err(msg) => return TaskOutcome::failed(msg),
    };
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, runtime, "Starting memtest.");

    // Old runs are killed best effort; the launch below reports the real result.
    let _ = run_script(ctx.shell.as_ref(), &target, &kill_command()).await;

    let daemon = daemon_script(&server.server_id, ctx.scripts.webhook_url());
    if let Err(e) = ctx
        .shell
        .upload(
            &target,
            vec![RemoteFile::new(format!("{REMOTE_MEMTEST_DIR}/{DAEMON_NAME}"), daemon)],
        )
        .await
    {
        return TaskError::from(e).into();
    }

    run_script(ctx.shell.as_ref(), &target, &launch_command(runtime)).await
}

/// Stops every memtest process, then archives dmesg and results.
pub async fn archive(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Stopping memtest and archiving results.");

    let _ = run_script(ctx.shell.as_ref(), &target, &kill_command()).await;
    run_script(ctx.shell.as_ref(), &target, &archive_command()).await
}
