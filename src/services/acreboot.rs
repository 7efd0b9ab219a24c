//! AC power cycling through a networked relay box ("AC box").
//!
//! The cycle script on the OS toggles a socket on the box; the shared monitor
//! daemon reports progress through the same webhook as OS reboot runs.
use tracing::{error, info};

use super::reboot::{SCRIPT_CYCLE_NAME, SCRIPT_MONITOR_NAME};
use super::scripts::{inject_ac_parameters, to_unix_line_endings, CLEAN_RC_LOCAL, SAFE_KILL_FN};
use super::ssh::{run_script, RemoteFile, SshTarget};
use super::{TaskContext, TaskError, TaskOutcome};
use crate::db::models::Server;

pub const REMOTE_AC_DIR: &str = "/root/ACReboot";
pub const SCRIPT_AC_NAME: &str = "Cycle_ACReboot.sh";
const LOG_DIR: &str = "/root/Test_Logs/ACReboot";
const CYCLE_LOOPS: u32 = 201;

fn connectivity_command(server: &Server) -> String {
    let mut command = String::new();
    if !server.ac_temp_ip.trim().is_empty() {
        // Best effort: the box often lives on a subnet the OS is not on yet.
        command.push_str(&format!(
            r#"NIC=$(ip -o -4 route show to default | awk '{{print $5}}' | head -1)
[ -z "$NIC" ] && NIC=$(ls /sys/class/net/ | grep -v lo | head -1)
ip addr add {}/24 dev $NIC >/dev/null 2>&1 || true
"#,
            server.ac_temp_ip.trim()
        ));
    }
    command.push_str(&format!("ping -c 3 -W 1 {}\n", server.ac_ip.trim()));
    command
}

fn cleanup_command() -> String {
    format!(
        r#"
mkdir -p {REMOTE_AC_DIR}
mkdir -p {LOG_DIR}

{SAFE_KILL_FN}
safe_kill "{SCRIPT_MONITOR_NAME}"
safe_kill "{SCRIPT_AC_NAME}"
safe_kill "{SCRIPT_CYCLE_NAME}"

rm -f {REMOTE_AC_DIR}/.is_reboot_running
mkdir -p {REMOTE_AC_DIR}/Trash
cd {REMOTE_AC_DIR} && mv *.sh *.log *.out Trash/ >/dev/null 2>&1
echo "SUCCESS: Environment cleaned"
exit 0
"#
    )
}

fn start_command() -> String {
    format!(
        r#"
cd {REMOTE_AC_DIR} || exit 1

export http_proxy=""
export https_proxy=""

if command -v dos2unix >/dev/null 2>&1; then dos2unix -q *.sh; fi
chmod +x *.sh

touch .is_reboot_running

setsid nohup bash {SCRIPT_MONITOR_NAME} > monitor.out 2>&1 < /dev/null &
PID_MON=$!
sleep 2

# Unlike OS reboot runs, the cycle script is launched here, not by the monitor.
setsid nohup bash {SCRIPT_AC_NAME} -ma -i {CYCLE_LOOPS} > chain.log 2>&1 < /dev/null &
PID_CYC=$!

sleep 1
kill -0 "$PID_MON" 2>/dev/null || PID_MON=""
kill -0 "$PID_CYC" 2>/dev/null || PID_CYC=""

if [ -n "$PID_MON" ] && [ -n "$PID_CYC" ]; then
    echo "SUCCESS: ACReboot Started (Monitor:$PID_MON, Cycle:$PID_CYC)"
else
    rm -f .is_reboot_running
    echo "FAILED: Start failed. Monitor:$PID_MON, Cycle:$PID_CYC"
fi
"#
    )
}

fn restore_rc_local() -> String {
    format!(
        r#"cat > /etc/rc.d/rc.local <<'EOF'
{CLEAN_RC_LOCAL}EOF
chmod +x /etc/rc.d/rc.local"#
    )
}

fn stop_command() -> String {
    let restore = restore_rc_local();
    format!(
        r#"
cd {REMOTE_AC_DIR} || exit 0

rm -f .is_reboot_running

if [ -f "{SCRIPT_AC_NAME}" ]; then
    bash {SCRIPT_AC_NAME} -q || true
fi

{SAFE_KILL_FN}
safe_kill "{SCRIPT_MONITOR_NAME}"
safe_kill "{SCRIPT_AC_NAME}"

{restore}

if [ -d "/root/Test_Logs" ]; then
    TIME_TAG=$(date +%Y%m%d_%H%M%S)
    TAR_NAME="acreboot_logs_$TIME_TAG.tar.gz"
    tar -czf $TAR_NAME -C /root/Test_Logs . >/dev/null 2>&1
    echo "SUCCESS: Archived to $TAR_NAME"
else
    echo "SUCCESS: Stopped (No logs)"
fi
"#
    )
}

fn reset_command() -> String {
    let restore = restore_rc_local();
    format!(
        r#"
cd {REMOTE_AC_DIR} || exit 0

rm -f .is_reboot_running

{SAFE_KILL_FN}
safe_kill "{SCRIPT_AC_NAME}"
safe_kill "{SCRIPT_MONITOR_NAME}"

{restore}

rm -rf {LOG_DIR}

mkdir -p Trash
find . -maxdepth 1 -type f -not -name "*.sh" -exec mv {{}} Trash/ \;

echo "SUCCESS: Reset Done"
"#
    )
}

/// Checks that the OS can reach the AC box, configuring the temporary IP first.
pub async fn check_connectivity(ctx: &TaskContext, server: &Server, target: &SshTarget) -> TaskOutcome {
    if server.ac_ip.trim().is_empty() {
        return TaskOutcome::failed("AC box IP is not configured");
    }
    info!(server_id = %server.server_id, ac_ip = %server.ac_ip, "Checking OS -> AC box connectivity.");

    match ctx.shell.exec(target, &connectivity_command(server)).await {
        Ok(output) if output.exit_status == 0 => TaskOutcome::ok("Connectivity check passed"),
        Ok(_) => TaskOutcome::failed(format!("OS cannot ping the AC box ({})", server.ac_ip.trim())),
        Err(e) => TaskError::from(e).into(),
    }
}

async fn try_deploy(ctx: &TaskContext, server: &Server, target: &SshTarget) -> Result<(), TaskError> {
    ctx.scripts.ensure_present(&[SCRIPT_MONITOR_NAME, SCRIPT_AC_NAME])?;

    let monitor = ctx.scripts.render(SCRIPT_MONITOR_NAME, &server.server_id).await?;
    let cycle = ctx.scripts.read_text(SCRIPT_AC_NAME).await?;
    let cycle = to_unix_line_endings(&inject_ac_parameters(
        &cycle,
        server.ac_ip.trim(),
        &server.ac_socket,
    ));

    ctx.exec_checked(target, &cleanup_command(), "Environment cleanup failed")
        .await?;

    ctx.shell
        .upload(
            target,
            vec![
                RemoteFile::new(format!("{REMOTE_AC_DIR}/{SCRIPT_AC_NAME}"), cycle),
                RemoteFile::new(format!("{REMOTE_AC_DIR}/{SCRIPT_MONITOR_NAME}"), monitor),
                RemoteFile::new("/etc/rc.d/rc.local", CLEAN_RC_LOCAL),
            ],
        )
        .await?;
    ctx.shell
        .exec(
            target,
            &format!("chmod +x {REMOTE_AC_DIR}/*.sh; chmod +x /etc/rc.d/rc.local"),
        )
        .await?;
    Ok(())
}

pub async fn deploy(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    if server.ac_ip.trim().is_empty() {
        return TaskOutcome::failed("AC box IP is not configured");
    }
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };

    let connectivity = check_connectivity(ctx, server, &target).await;
    if !connectivity.success {
        return connectivity;
    }

    info!(server_id = %server.server_id, "Deploying AC reboot scripts.");
    match try_deploy(ctx, server, &target).await {
        Ok(()) => TaskOutcome::ok("Deployed (SFTP)"),
        Err(e) => {
            error!(server_id = %server.server_id, error = %e, "AC reboot deploy failed.");
            e.into()
        }
    }
}

pub async fn start(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Starting AC reboot test.");
    run_script(ctx.shell.as_ref(), &target, &start_command()).await
}

pub async fn stop(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Stopping AC reboot test.");
    run_script(ctx.shell.as_ref(), &target, &stop_command()).await
}

pub async fn reset(ctx: &TaskContext, server: &Server) -> TaskOutcome {
    let target = match ctx.target(server) {
        Ok(target) => target,
        Err(outcome) => return outcome,
    };
    info!(server_id = %server.server_id, "Resetting AC reboot environment.");
    run_script(ctx.shell.as_ref(), &target, &reset_command()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ssh::testing::FakeShell;
    use crate::services::ssh::CommandOutput;
    use crate::services::testing::context_with_scripts;
    use std::sync::Arc;

    fn server() -> Server {
        let mut server = Server::new("node-01", "10.0.0.1");
        server.os_ip = Some("10.0.1.1".to_string());
        server.ac_ip = "192.168.100.20".to_string();
        server.ac_socket = "2".to_string();
        server
    }

    const FILES: [(&str, &str); 2] = [
        (SCRIPT_MONITOR_NAME, "ID={{SERVER_ID}}\r\n"),
        (SCRIPT_AC_NAME, "box_ip=\"0.0.0.0\"\r\nbox_socket=\"0000\"\r\n"),
    ];

    #[tokio::test]
    async fn deploy_without_ac_ip_skips_ssh() {
        let shell = Arc::new(FakeShell::default());
        let (_dir, ctx) = context_with_scripts(shell.clone(), &FILES);
        let mut server = server();
        server.ac_ip.clear();

        let outcome = deploy(&ctx, &server).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "AC box IP is not configured");
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn deploy_stops_when_box_unreachable() {
        let shell = Arc::new(FakeShell::default());
        shell.reply(CommandOutput {
            exit_status: 1,
            ..Default::default()
        });
        let (_dir, ctx) = context_with_scripts(shell.clone(), &FILES);

        let outcome = deploy(&ctx, &server()).await;
        assert_eq!(outcome.message, "OS cannot ping the AC box (192.168.100.20)");
        assert!(shell.uploaded_paths().is_empty());
    }

    #[tokio::test]
    async fn deploy_injects_box_parameters() {
        let shell = Arc::new(FakeShell::default());
        let (_dir, ctx) = context_with_scripts(shell.clone(), &FILES);
        let mut server = server();
        server.ac_temp_ip = "192.168.100.99".to_string();

        let outcome = deploy(&ctx, &server).await;
        assert!(outcome.success, "{}", outcome.message);

        let commands = shell.commands();
        assert!(commands[0].contains("ip addr add 192.168.100.99/24 dev $NIC"));
        assert!(commands[0].contains("ping -c 3 -W 1 192.168.100.20"));
        assert_eq!(
            shell.uploaded("/root/ACReboot/Cycle_ACReboot.sh").unwrap(),
            "box_ip=\"192.168.100.20\"\nbox_socket=\"0100\"\n"
        );
        assert_eq!(shell.uploaded("/root/ACReboot/monitor_daemon.sh").unwrap(), "ID=node-01\n");
        assert_eq!(shell.uploaded("/etc/rc.d/rc.local").unwrap(), CLEAN_RC_LOCAL);
    }

    #[test]
    fn connectivity_skips_temp_ip_when_unset() {
        let command = connectivity_command(&server());
        assert_eq!(command, "ping -c 3 -W 1 192.168.100.20\n");
    }

    #[tokio::test]
    async fn start_reports_missing_pid_as_failure() {
        let shell = Arc::new(FakeShell::default());
        shell.reply_stdout("FAILED: Start failed. Monitor:123, Cycle:");
        let (_dir, ctx) = context_with_scripts(shell.clone(), &FILES);

        let outcome = start(&ctx, &server()).await;
        assert!(!outcome.success);
        assert!(shell.commands()[0].contains("-ma -i 201"));
    }

    #[tokio::test]
    async fn deploy_stops_when_cleanup_is_killed() {
        let shell = Arc::new(FakeShell::default());
        shell.reply_stdout("");
        let killed = CommandOutput::finished(0, Some("KILL".to_string()), String::new(), String::new());
        shell.reply(killed);
        let (_dir, ctx) = context_with_scripts(shell.clone(), &FILES);

        let outcome = deploy(&ctx, &server()).await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.message,
            "Environment cleanup failed: remote command terminated by signal KILL"
        );
        assert!(shell.uploaded_paths().is_empty());
    }

    #[cfg(unix)]
    mod on_bash {
        use super::*;
        use crate::services::testing::ScratchHost;

        #[test]
        fn cleanup_prepares_a_fresh_host() {
            let host = ScratchHost::new();

            let (status, stdout) = host.run(&cleanup_command());
            assert_eq!(status, Some(0), "{stdout}");
            assert_eq!(stdout.trim(), "SUCCESS: Environment cleaned");
            assert!(host.exists("/root/ACReboot/Trash"));
            assert!(host.exists("/root/Test_Logs/ACReboot"));
        }

        #[test]
        fn cleanup_moves_previous_run_to_trash() {
            let host = ScratchHost::new();
            host.write("/root/ACReboot/Cycle_ACReboot.sh", "old");
            host.write("/root/ACReboot/chain.log", "old");
            host.write("/root/ACReboot/.is_reboot_running", "");

            let (status, stdout) = host.run(&cleanup_command());
            assert_eq!(status, Some(0), "{stdout}");
            assert_eq!(host.list("/root/ACReboot/Trash"), vec!["Cycle_ACReboot.sh", "chain.log"]);
            assert!(!host.exists("/root/ACReboot/.is_reboot_running"));
        }

        #[test]
        fn stop_restores_rc_local_and_archives_logs() {
            let host = ScratchHost::new();
            host.write("/root/ACReboot/.is_reboot_running", "");
            host.write("/root/Test_Logs/ACReboot/ac.log", "cycle 7 ok");

            let (status, stdout) = host.run(&stop_command());
            assert_eq!(status, Some(0), "{stdout}");
            assert!(stdout.contains("SUCCESS: Archived to acreboot_logs_"), "{stdout}");
            assert_eq!(host.read("/etc/rc.d/rc.local"), CLEAN_RC_LOCAL);
            assert!(!host.exists("/root/ACReboot/.is_reboot_running"));
        }

        #[test]
        fn reset_wipes_logs_and_keeps_scripts() {
            let host = ScratchHost::new();
            host.write("/root/ACReboot/Cycle_ACReboot.sh", "exit 0");
            host.write("/root/ACReboot/chain.log", "old");
            host.write("/root/Test_Logs/ACReboot/ac.log", "cycle 7 ok");

            let (status, stdout) = host.run(&reset_command());
            assert_eq!(status, Some(0), "{stdout}");
            assert_eq!(stdout.trim(), "SUCCESS: Reset Done");
            assert!(host.exists("/root/ACReboot/Cycle_ACReboot.sh"));
            assert_eq!(host.list("/root/ACReboot/Trash"), vec!["chain.log"]);
            assert!(!host.exists("/root/Test_Logs/ACReboot"));
            assert_eq!(host.read("/etc/rc.d/rc.local"), CLEAN_RC_LOCAL);
        }

        #[test]
        fn start_without_scripts_reports_failure() {
            let host = ScratchHost::new();
            host.write("/root/ACReboot/.keep", "");

            let (status, stdout) = host.run(&start_command());
            assert_eq!(status, Some(0), "{stdout}");
            assert_eq!(stdout.trim(), "FAILED: Start failed. Monitor:, Cycle:");
            assert!(!host.exists("/root/ACReboot/.is_reboot_running"));
        }
    }
}
