use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BACKEND_URL_PLACEHOLDER: &str = "{{BACKEND_URL}}";
const SERVER_ID_PLACEHOLDER: &str = "{{SERVER_ID}}";

/// rc.local restored after a reboot or AC cycle run.
pub const CLEAN_RC_LOCAL: &str = "#!/bin/bash
# THIS FILE IS ADDED FOR COMPATIBILITY PURPOSES
touch /var/lock/subsys/local
exit 0
";

/// Shell function killing every process whose command line matches `$1`.
/// The calling shell and its subshells carry the pattern in their own command
/// line, so they are skipped.
pub const SAFE_KILL_FN: &str = r#"safe_kill() {
    for pid in $(pgrep -f "$1"); do
        [ "$pid" = "$$" ] && continue
        [ "$(ps -o ppid= -p "$pid" 2>/dev/null | tr -d ' ')" = "$$" ] && continue
        kill -9 "$pid" 2>/dev/null
    done
    return 0
}"#;

static BOX_IP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"box_ip=".*?""#).expect("valid regex"));
static BOX_SOCKET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"box_socket=".*?""#).expect("valid regex"));

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Local file missing: {0}")]
    Missing(String),
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0} is not valid UTF-8")]
    Encoding(String),
}

/// Local directory holding the scripts pushed to managed machines.
#[derive(Debug, Clone)]
pub struct ScriptLibrary {
    dir: PathBuf,
    webhook_url: String,
}

impl ScriptLibrary {
    pub fn new(dir: impl Into<PathBuf>, webhook_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            webhook_url: webhook_url.into(),
        }
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn ensure_present(&self, names: &[&str]) -> Result<(), ScriptError> {
        match names.iter().find(|name| !self.path_of(name).is_file()) {
            Some(missing) => Err(ScriptError::Missing((*missing).to_string())),
            None => Ok(()),
        }
    }

    pub async fn read_bytes(&self, name: &str) -> Result<Vec<u8>, ScriptError> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(ScriptError::Missing(name.to_string()));
        }
        tokio::fs::read(&path)
            .await
            .map_err(|source| ScriptError::Read { path, source })
    }

    pub async fn read_text(&self, name: &str) -> Result<String, ScriptError> {
        let bytes = self.read_bytes(name).await?;
        String::from_utf8(bytes).map_err(|_| ScriptError::Encoding(name.to_string()))
    }

    /// Reads a script and fills in the callback URL and server id.
    pub async fn render(&self, name: &str, server_id: &str) -> Result<String, ScriptError> {
        let content = self.read_text(name).await?;
        Ok(to_unix_line_endings(&render_placeholders(
            &content,
            &self.webhook_url,
            server_id,
        )))
    }
}

pub fn render_placeholders(content: &str, webhook_url: &str, server_id: &str) -> String {
    content
        .replace(BACKEND_URL_PLACEHOLDER, webhook_url)
        .replace(SERVER_ID_PLACEHOLDER, server_id)
}

pub fn to_unix_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}

/// Maps a socket number on the AC box to its relay bit mask.
pub fn socket_code(socket: &str) -> String {
    let socket = socket.trim();
    if socket.len() == 4 && socket.chars().all(|c| c == '0' || c == '1') {
        return socket.to_string();
    }
    match socket {
        "1" => "1000",
        "2" => "0100",
        "3" => "0010",
        "4" => "0001",
        _ => "0000",
    }
    .to_string()
}

/// Points the AC cycle script at one box and socket.
pub fn inject_ac_parameters(content: &str, ac_ip: &str, socket: &str) -> String {
    let code = socket_code(socket);
    let with_ip = BOX_IP_RE.replace_all(content, |_: &regex::Captures| format!("box_ip=\"{ac_ip}\""));
    BOX_SOCKET_RE
        .replace_all(&with_ip, |_: &regex::Captures| format!("box_socket=\"{code}\""))
        .into_owned()
}

pub fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_and_line_endings() {
        let script = "URL=\"{{BACKEND_URL}}\"\r\nID=\"{{SERVER_ID}}\"\r\necho {{SERVER_ID}}\n";
        let rendered = to_unix_line_endings(&render_placeholders(
            script,
            "http://10.1.1.1:8000/report/webhook",
            "node-07",
        ));
        assert_eq!(
            rendered,
            "URL=\"http://10.1.1.1:8000/report/webhook\"\nID=\"node-07\"\necho node-07\n"
        );
    }

    #[test]
    fn socket_codes() {
        assert_eq!(socket_code("1"), "1000");
        assert_eq!(socket_code("2"), "0100");
        assert_eq!(socket_code("3"), "0010");
        assert_eq!(socket_code("4"), "0001");
        assert_eq!(socket_code("0110"), "0110");
        assert_eq!(socket_code("5"), "0000");
        assert_eq!(socket_code("01a0"), "0000");
        assert_eq!(socket_code(""), "0000");
    }

    #[test]
    fn ac_parameters_are_rewritten() {
        let script = "#!/bin/bash\nbox_ip=\"192.168.1.50\"\nbox_socket=\"0000\"\nloops=10\n";
        let injected = inject_ac_parameters(script, "10.9.8.7", "3");
        assert_eq!(
            injected,
            "#!/bin/bash\nbox_ip=\"10.9.8.7\"\nbox_socket=\"0010\"\nloops=10\n"
        );
    }

    #[test]
    fn ac_ip_with_dollar_is_taken_literally() {
        let injected = inject_ac_parameters("box_ip=\"x\"", "$1", "1");
        assert_eq!(injected, "box_ip=\"$1\"");
    }

    #[tokio::test]
    async fn library_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("monitor_daemon.sh"), "curl {{BACKEND_URL}} -d {{SERVER_ID}}\r\n").unwrap();
        let library = ScriptLibrary::new(dir.path(), "http://b/report/webhook");

        assert!(library.ensure_present(&["monitor_daemon.sh"]).is_ok());
        let err = library.ensure_present(&["monitor_daemon.sh", "chain.sh"]).unwrap_err();
        assert_eq!(err.to_string(), "Local file missing: chain.sh");

        let rendered = library.render("monitor_daemon.sh", "n1").await.unwrap();
        assert_eq!(rendered, "curl http://b/report/webhook -d n1\n");
    }

    #[test]
    fn file_name_of_remote_paths() {
        assert_eq!(file_name("/root/MemInfo/mem_report.txt"), "mem_report.txt");
        assert_eq!(file_name("plain.txt"), "plain.txt");
    }
}
