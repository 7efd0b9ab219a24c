//! OS reboot cycling: push the cycle/chain/monitor scripts, start the monitor
//! daemon (which drives the chain) and tear everything down again.
use tracing::{error, info};

use super::scripts::{CLEAN_RC_LOCAL, SAFE_KILL_FN};
use super::ssh::{run_script, RemoteFile, SshTarget};
use super::{TaskContext, TaskError, TaskOutcome};
use crate::db::models::Server;

pub const REMOTE_WORK_DIR: &str = "/root/Reboot";
pub const SCRIPT_CYCLE_NAME: &str = "Cycle_OSReboot_V2.2.3.sh";
pub const SCRIPT_CHAIN_NAME: &str = "auto_cold_warm_stress_chain.sh";
pub const SCRIPT_MONITOR_NAME: &str = "monitor_daemon.sh";
const LOG_DIR: &str = "/root/Test_Logs/Reboot";

const SCRIPTS: [&str; 3] = [SCRIPT_CHAIN_NAME, SCRIPT_CYCLE_NAME, SCRIPT_MONITOR_NAME];

fn cleanup_command() -> String {
    format!(
        r#"
mkdir -p {REMOTE_WORK_DIR}
mkdir -p {LOG_DIR}

{SAFE_KILL_FN}
safe_kill "{SCRIPT_MONITOR_NAME}"
safe_kill "{SCRIPT_CHAIN_NAME}"
safe_kill "{SCRIPT_CYCLE_NAME}"
rm -f {REMOTE_WORK_DIR}/.is_reboot_running

cd {REMOTE_WORK_DIR} || exit 1
mkdir -p Trash
find . -maxdepth 1 -mindepth 1 -name 'Trash' -prune -o -name 'Test_Logs' -prune -o -exec mv -f {{}} Trash/ \;

cat > /etc/rc.d/rc.local <<'EOF'
{CLEAN_RC_LOCAL}EOF
chmod +x /etc/rc.d/rc.local || exit 1
chmod +x /etc/rc.local 2>/dev/null

echo "SUCCESS: Environment cleaned"
"#
    )
}

fn start_command() -> String {
    format!(
        r#"
cd {REMOTE_WORK_DIR} || exit 1

if command -v dos2unix >/dev/null 2>&1; then
    dos2unix -q *.sh
fi
chmod +x *.sh

touch .is_reboot_running

setsid nohup bash {SCRIPT_MONITOR_NAME} > monitor.out 2>&1 < /dev/null &
PID=$!

sleep 1
if kill -0 "$PID" 2>/dev/null; then
    echo "SUCCESS: Monitor Started (PID: $PID)"
else
    rm -f .is_reboot_running
    echo "FAILED: Monitor failed to start"
fi
"#
    )
}

fn stop_command() -> String {
    format!(
        r#"
cd {REMOTE_WORK_DIR} || exit 0

rm -f .is_reboot_running

if [ -f "{SCRIPT_CYCLE_NAME}" ]; then
    bash {SCRIPT_CYCLE_NAME} -q || true
fi

{SAFE_KILL_FN}
safe_kill "{SCRIPT_CHAIN_NAME}"
safe_kill "{SCRIPT_MONITOR_NAME}"
safe_kill "{SCRIPT_CYCLE_NAME}"
safe_kill "stressapptest"

cat > /etc/rc.d/rc.local <<'EOF'
{CLEAN_RC_LOCAL}EOF
chmod +x /etc/rc.d/rc.local

if [ -d "{LOG_DIR}" ]; then
    TIME_TAG=$(date +%Y%m%d_%H%M%S)
    TAR_NAME="reboot_logs_$TIME_TAG.tar.gz"
    tar -czf $TAR_NAME -C /root/Test_Logs Reboot
    echo "SUCCESS: Logs archived to $TAR_NAME"
else
    echo "SUCCESS: Stopped (No logs found)"
fi
"#
    )
}

fn reset_command() -> String {
    format!(
        r#"
cd {REMOTE_WORK_DIR} || exit 0

rm -f .is_reboot_running
if [ -f "{SCRIPT_CYCLE_NAME}" ]; then bash {SCRIPT_CYCLE_NAME} -q || true; fi

{SAFE_KILL_FN}
safe_kill "{SCRIPT_MONITOR_NAME}"
safe_kill "{SCRIPT_CHAIN_NAME}"

cat > /etc/rc.d/rc.local <<'EOF'
{CLEAN_RC_LOCAL}EOF
chmod +x /etc/rc.d/rc.local

rm -rf {LOG_DIR}

mkdir -p Trash
find . -maxdepth 1 -type f -not -name "*.sh" -exec mv {{}} Trash/ \;

echo "SUCCESS: Reset Done"
"#
    )
}

async fn try_deploy(ctx: &TaskContext, server: &Server, target: &SshTarget) -> Result<(), TaskError> {
    ctx.scripts.ensure_present(&SCRIPTS)?;

    let mut files = Vec::with_capacity(SCRIPTS.len());
    for name in SCRIPTS {
        let rendered = ctx.scripts.render(name, &server.server_id).await?;
        files.push(RemoteFile::new(format!("{REMOTE_WORK_DIR}/{name}"), rendered));
    }

    ctx.exec_checked(target, &cleanup_command(), "Environment cleanup failed")
        .await?;
    ctx.shell.upload(target, files).await?;
    ctx.shell
        .exec(target, &format!("chmod +x {REMOTE_WORK_DIR}/*.sh"))
        .await?;
    Ok(())
}

pub async fn deploy(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Deploying reboot scripts.");

    match try_deploy(ctx, server, &target).await {
        Ok(()) => TaskOutcome::ok("Deployed (old files moved to Trash, rc.local reset)"),
        Err(e) => {
            error!(server_id = %server.server_id, error = %e, "Reboot deploy failed.");
            e.into()
        }
    }
}

pub async fn start(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Starting reboot test.");
    run_script(ctx.shell.as_ref(), &target, &start_command()).await
}

pub async fn stop(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Stopping reboot test and archiving logs.");
    run_script(ctx.shell.as_ref(), &target, &stop_command()).await
}

pub async fn reset(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Resetting reboot environment.");
    run_script(ctx.shell.as_ref(), &target, &reset_command()).await
}
