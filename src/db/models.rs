use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task status strings shared by the reboot, memtest and AC reboot flows.
pub mod task_status {
    pub const IDLE: &str = "Idle";
    pub const DEPLOYED: &str = "Deployed";
    pub const RUNNING: &str = "Running";
    pub const STOPPED: &str = "Stopped";
    pub const FINISHED: &str = "Finished";
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_password() -> String {
    "1".to_string()
}

fn default_idle() -> String {
    task_status::IDLE.to_string()
}

fn default_phase() -> String {
    "Not deployed".to_string()
}

fn default_dash() -> String {
    "-".to_string()
}

fn default_memtest_runtime() -> String {
    "3600".to_string()
}

fn default_ac_socket() -> String {
    "1".to_string()
}

/// One inventory record per managed machine.
///
/// Everything except `os_ip` is always serialized. On input only `server_id`
/// and `bmc_ip` are required, the rest fall back to the values a freshly
/// registered machine starts with.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Server {
    pub server_id: String,
    pub bmc_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_ip: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_password")]
    pub ssh_password: String,

    #[serde(default = "default_idle")]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bmc_online: bool,
    #[serde(default)]
    pub os_online: bool,

    #[serde(default = "default_idle")]
    pub reboot_status: String,
    #[serde(default = "default_phase")]
    pub reboot_phase: String,
    #[serde(default = "default_dash")]
    pub reboot_loop: String,

    #[serde(default = "default_idle")]
    pub memtest_status: String,
    #[serde(default = "default_phase")]
    pub memtest_phase: String,
    #[serde(default = "default_memtest_runtime")]
    pub memtest_runtime_configured: String,

    #[serde(default)]
    pub ac_ip: String,
    #[serde(default = "default_ac_socket")]
    pub ac_socket: String,
    #[serde(default)]
    pub ac_temp_ip: String,

    #[serde(default = "default_dash")]
    pub last_report_time: String,
}

impl Server {
    pub fn new(server_id: impl Into<String>, bmc_ip: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            bmc_ip: bmc_ip.into(),
            os_ip: None,
            ssh_user: default_ssh_user(),
            ssh_password: default_ssh_password(),
            status: default_idle(),
            description: String::new(),
            bmc_online: false,
            os_online: false,
            reboot_status: default_idle(),
            reboot_phase: default_phase(),
            reboot_loop: default_dash(),
            memtest_status: default_idle(),
            memtest_phase: default_phase(),
            memtest_runtime_configured: default_memtest_runtime(),
            ac_ip: String::new(),
            ac_socket: default_ac_socket(),
            ac_temp_ip: String::new(),
            last_report_time: default_dash(),
        }
    }

    /// The OS address, if one is configured and non-blank.
    pub fn os_address(&self) -> Option<&str> {
        self.os_ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())
    }

    /// Checks that `server_id` is usable as a file name prefix and inside a
    /// double-quoted shell string on the managed machine.
    pub fn validate_server_id(server_id: &str) -> Result<(), String> {
        if server_id.is_empty() {
            return Err("server_id must not be empty".to_string());
        }
        let unsafe_char = |c: char| matches!(c, '/' | '\\' | '"' | '\'' | '$' | '`') || c.is_control();
        if server_id.contains("..") || server_id.contains(unsafe_char) {
            return Err(format!("server_id {server_id:?} contains characters that are not allowed"));
        }
        Ok(())
    }

    pub fn has_running_task(&self) -> bool {
        self.reboot_status == task_status::RUNNING || self.memtest_status == task_status::RUNNING
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Reboot,
    Memtest,
}

/// Progress report pushed by the daemons running on the managed machines.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WebhookData {
    pub server_id: String,
    #[serde(default)]
    pub task_type: TaskType,
    pub status: String,
    pub phase: String,
    #[serde(rename = "loop", default = "default_dash")]
    pub loop_count: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerItemStatus {
    Online,
    Offline,
    Maintenance,
}

/// Storage envelope around a `Server`, carrying bookkeeping timestamps.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerRecord {
    #[serde(flatten)]
    pub server: Server,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(server: Server) -> Self {
        let now = Utc::now();
        Self {
            server,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Compact inventory view used by the newer dashboard pages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerItem {
    pub id: String,
    pub name: String,
    pub status: ServerItemStatus,
    pub ip_address: String,
    pub bmc_address: String,
    pub ssh_username: String,
    pub ssh_password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerItem {
    pub fn from_record(record: &ServerRecord) -> Self {
        let server = &record.server;
        let status = if server.has_running_task() {
            ServerItemStatus::Maintenance
        } else if server.bmc_online || server.os_online {
            ServerItemStatus::Online
        } else {
            ServerItemStatus::Offline
        };

        Self {
            id: server.server_id.clone(),
            name: server.server_id.clone(),
            status,
            ip_address: server.os_ip.clone().unwrap_or_default(),
            bmc_address: server.bmc_ip.clone(),
            ssh_username: server.ssh_user.clone(),
            ssh_password: server.ssh_password.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}
