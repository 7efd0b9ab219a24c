//! Development reverse proxy that puts the dashboard and the backend on one
//! origin.
use clap::ValueEnum;
use reqwest::Url;
use thiserror::Error;

pub mod forward;

const LOCAL_BACKEND: &str = "http://127.0.0.1:8000";
const SHARED_BACKEND: &str = "http://172.17.58.32";
const WS_PORT: u16 = 8000;
const API_PREFIXES: [&str; 3] = ["/monitor", "/servers", "/report"];

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid proxy target {0:?}")]
    InvalidTarget(String),
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Upstream WebSocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Local,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    pub prefix: String,
    /// Origin only: scheme, host and optional port.
    pub target: String,
    /// Rewrite `Host` and `Origin` to the target.
    pub change_origin: bool,
    /// Accept WebSocket upgrades on this prefix.
    pub ws: bool,
}

impl ProxyRule {
    pub fn http(prefix: &str, target: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            target: target.to_string(),
            change_origin: true,
            ws: false,
        }
    }

    pub fn websocket(prefix: &str, target: &str) -> Self {
        Self {
            ws: true,
            ..Self::http(prefix, target)
        }
    }

    /// Absolute upstream URL for a request path (with query).
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.target.trim_end_matches('/'), path_and_query)
    }
}

/// Ordered rules; the first prefix match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTable {
    pub rules: Vec<ProxyRule>,
}

impl ProxyTable {
    pub fn local() -> Self {
        Self {
            rules: API_PREFIXES
                .iter()
                .map(|prefix| ProxyRule::http(prefix, LOCAL_BACKEND))
                .collect(),
        }
    }

    pub fn shared() -> Self {
        let mut rules: Vec<ProxyRule> = API_PREFIXES
            .iter()
            .map(|prefix| ProxyRule::http(prefix, SHARED_BACKEND))
            .collect();
        rules.push(ProxyRule::websocket("/ws", &format!("{SHARED_BACKEND}:{WS_PORT}")));
        Self { rules }
    }

    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Local => Self::local(),
            Preset::Shared => Self::shared(),
        }
    }

    /// Points every rule at `origin`. WebSocket rules keep the backend port.
    pub fn with_target(mut self, origin: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(origin).map_err(|_| ProxyError::InvalidTarget(origin.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ProxyError::InvalidTarget(origin.to_string()));
        }
        let http_target = url.origin().ascii_serialization();

        let mut ws_url = url.clone();
        ws_url
            .set_port(Some(WS_PORT))
            .map_err(|_| ProxyError::InvalidTarget(origin.to_string()))?;
        let ws_target = ws_url.origin().ascii_serialization();

        for rule in &mut self.rules {
            rule.target = if rule.ws { ws_target.clone() } else { http_target.clone() };
        }
        Ok(self)
    }

    pub fn match_path(&self, path: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| path.starts_with(&rule.prefix))
    }
}
