use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::config::Settings;

/// One fleet client as reported by the backend. Read-only on our side; a
/// fresh list arrives with every poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub game: String,
    #[serde(default)]
    pub server: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub dia: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_report: String,
}

/// Target handed to the send-ini endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTarget {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStatus {
    #[serde(default)]
    pub main_server: bool,
    #[serde(default)]
    pub main_server_port: u32,
    #[serde(default)]
    pub web_server: bool,
    #[serde(default)]
    pub web_server_port: u32,
    #[serde(default)]
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServerResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendIniResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub success_clients: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Backends have been seen reporting counts as strings or null. Treat
/// anything non-numeric as zero rather than failing the whole poll.
fn lenient_count<'de, D>(de: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = JsonValue::deserialize(de)?;
    Ok(match v {
        JsonValue::Number(n) => n.as_i64().unwrap_or(0),
        JsonValue::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    })
}

/// Thin client for the fleet backend HTTP API. All calls are one-shot
/// round-trips; retries are user-initiated (the next poll tick).
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.backend_timeout_secs))
            .build()
            .context("build backend http client")?;
        Ok(Self {
            http,
            base_url: settings.backend_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn fetch_clients(&self) -> Result<Vec<ClientRecord>> {
        let res = self
            .http
            .get(self.url("/api/clients"))
            .send()
            .await
            .context("GET /api/clients")?
            .error_for_status()
            .context("GET /api/clients status")?;
        res.json::<Vec<ClientRecord>>()
            .await
            .context("decode /api/clients")
    }

    /// Raw day-keyed history map. `days == 0` or `999` asks for everything
    /// the backend has.
    pub async fn fetch_dia_history(&self, days: u64) -> Result<JsonValue> {
        let res = self
            .http
            .get(self.url("/api/dia-history"))
            .query(&[("days", days)])
            .send()
            .await
            .context("GET /api/dia-history")?
            .error_for_status()
            .context("GET /api/dia-history status")?;
        res.json::<JsonValue>()
            .await
            .context("decode /api/dia-history")
    }

    pub async fn server_status(&self) -> Result<BackendStatus> {
        let res = self
            .http
            .get(self.url("/api/server-status"))
            .send()
            .await
            .context("GET /api/server-status")?
            .error_for_status()
            .context("GET /api/server-status status")?;
        res.json::<BackendStatus>()
            .await
            .context("decode /api/server-status")
    }

    pub async fn start_server(&self, kind: &str) -> Result<StartServerResponse> {
        let res = self
            .http
            .post(self.url("/api/start-server"))
            .json(&serde_json::json!({ "type": kind }))
            .send()
            .await
            .context("POST /api/start-server")?
            .error_for_status()
            .context("POST /api/start-server status")?;
        res.json::<StartServerResponse>()
            .await
            .context("decode /api/start-server")
    }

    pub async fn send_ini(&self, clients: &[ClientTarget], ini_content: &str) -> Result<SendIniResponse> {
        let res = self
            .http
            .post(self.url("/api/send-ini"))
            .json(&serde_json::json!({
                "clients": clients,
                "ini_content": ini_content,
            }))
            .send()
            .await
            .context("POST /api/send-ini")?
            .error_for_status()
            .context("POST /api/send-ini status")?;
        res.json::<SendIniResponse>()
            .await
            .context("decode /api/send-ini")
    }
}
