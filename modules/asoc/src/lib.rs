//! Typed client for the ASoC REST API.
//!
//! Each operation wraps one endpoint, validates the response against an
//! explicit schema, and translates expected negative lookups (HTTP 4xx on
//! the lookup/rotate endpoints) into `None` sentinels instead of errors.
//! Callers cannot distinguish a malformed id from a missing one.

mod report;

pub use report::{ReportStatus, DEFAULT_REPORT_RETRIES, REPORT_POLL_INTERVAL};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use iastkit_core::{IastError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use transport::{RequestClient, RetryPolicy};

pub const DEFAULT_API_HOST: &str = "https://cloud.appscan.com/api/v2";
pub const DEFAULT_IAST_HOST: &str = "https://cloud.appscan.com/IAST";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Credential exchange is retried a few times before the run is abandoned.
const LOGIN_RETRIES: u32 = 3;

/// The service has shipped two lookup dialects; a run targets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStyle {
    /// `$filter=Name eq 'x'` with `$select` projections.
    OData,
    /// Plain `Name=x` equality parameters (older API generation).
    Equality,
}

impl QueryStyle {
    fn filter_eq(&self, field: &'static str, value: &str) -> Vec<(&'static str, String)> {
        match self {
            QueryStyle::OData => vec![("$filter", format!("{field} eq '{value}'"))],
            QueryStyle::Equality => vec![(field, value.to_string())],
        }
    }
}

/// Identifiers a scan lookup resolves to.
#[derive(Debug, Clone)]
pub struct ScanInfo {
    pub scan_id: String,
    pub scan_name: String,
    pub app_name: String,
    pub app_id: String,
}

/// Result of creating a scan: the scan id and its first agent key.
#[derive(Debug, Clone)]
pub struct ScanKey {
    pub agent_key: String,
    pub scan_id: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "Token")]
    token: String,
}

#[derive(Deserialize)]
struct IdOnly {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct AppResponse {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct ScanResponse {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "AppName")]
    app_name: String,
    #[serde(rename = "AppId")]
    app_id: String,
}

#[derive(Deserialize)]
struct ScanListEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "AppName")]
    app_name: String,
    #[serde(rename = "AppId")]
    app_id: String,
}

#[derive(Deserialize)]
struct CreateScanResponse {
    #[serde(rename = "Agentkey")]
    agent_key: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    #[serde(rename = "Key")]
    key: String,
}

#[derive(Serialize)]
struct AppModel {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "AssetGroupId")]
    asset_group_id: String,
}

#[derive(Serialize)]
struct ScanModel {
    /// Minutes before the scan is stopped after the agent connection is lost.
    #[serde(rename = "ConnLostStopTimer")]
    conn_lost_stop_timer: String,
    #[serde(rename = "ScanName")]
    scan_name: String,
    #[serde(rename = "EnableMailNotification")]
    enable_mail_notification: bool,
    #[serde(rename = "Locale")]
    locale: String,
    #[serde(rename = "AppId")]
    app_id: String,
    #[serde(rename = "Personal")]
    personal: bool,
}

fn decode<T: DeserializeOwned>(endpoint: &'static str, body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| IastError::schema(endpoint, format!("{e}; response: {body}")))
}

fn to_body<T: Serialize>(endpoint: &'static str, model: &T) -> Result<serde_json::Value> {
    serde_json::to_value(model).map_err(|e| IastError::schema(endpoint, e.to_string()))
}

fn bearer_json(token: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Accept", "application/json".to_string()),
        ("Authorization", format!("Bearer {token}")),
    ]
}

fn bearer_plain(token: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Accept", "text/plain".to_string()),
        ("Authorization", format!("Bearer {token}")),
    ]
}

pub struct AsocClient {
    transport: RequestClient,
    api_base: String,
    iast_base: String,
    query_style: QueryStyle,
    timeout: Duration,
    write_retry: RetryPolicy,
}

impl AsocClient {
    pub fn new(
        api_host: impl Into<String>,
        iast_host: impl Into<String>,
        query_style: QueryStyle,
    ) -> Result<Self> {
        Ok(AsocClient {
            transport: RequestClient::new()?,
            api_base: api_host.into().trim_end_matches('/').to_string(),
            iast_base: iast_host.into().trim_end_matches('/').to_string(),
            query_style,
            timeout: DEFAULT_TIMEOUT,
            write_retry: RetryPolicy::NONE,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry policy applied to create/delete/download calls.
    pub fn with_write_retry(mut self, retry: RetryPolicy) -> Self {
        self.write_retry = retry;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }

    fn iast_url(&self, path: &str) -> String {
        format!("{}/{path}", self.iast_base)
    }

    /// Creation and deletion are slower server-side than lookups.
    fn long_timeout(&self) -> Duration {
        self.timeout.saturating_mul(2)
    }
}

/// Operations the provisioning orchestrator drives.
#[async_trait]
pub trait AsocApi {
    async fn api_key_login(&self, key_id: &str, key_secret: &str) -> Result<String>;
    async fn default_asset_group(&self, token: &str) -> Result<String>;
    /// Resolves an app id to its name. 4xx means "not found".
    async fn app_by_id(&self, token: &str, app_id: &str) -> Result<Option<String>>;
    /// Resolves an app name to its id. An empty result set means "not found".
    async fn app_id_by_name(&self, token: &str, name: &str) -> Result<Option<String>>;
    async fn create_app(&self, token: &str, name: &str, asset_group: &str) -> Result<String>;
    async fn delete_app(&self, token: &str, app_id: &str) -> Result<()>;
    async fn scan_info_by_id(&self, token: &str, scan_id: &str) -> Result<Option<ScanInfo>>;
    async fn scan_info_by_name(&self, token: &str, name: &str) -> Result<Option<ScanInfo>>;
    async fn create_scan(&self, token: &str, app_id: &str, scan_name: &str) -> Result<ScanKey>;
    /// Issues a fresh agent key, invalidating the previous one. 4xx means
    /// the scan is gone or invalid and is reported as "no key".
    async fn new_agent_key(&self, token: &str, scan_id: &str) -> Result<Option<String>>;
    async fn delete_scan(&self, token: &str, scan_id: &str) -> Result<()>;
    /// Streams the agent bundle zip to `dest`. Auth is the agent key.
    async fn download_agent(&self, agent_key: &str, dest: &Path) -> Result<()>;
}

#[async_trait]
impl AsocApi for AsocClient {
    async fn api_key_login(&self, key_id: &str, key_secret: &str) -> Result<String> {
        let body = serde_json::json!({ "KeyId": key_id, "KeySecret": key_secret });
        let text = self
            .transport
            .post(
                &self.api_url("Account/ApiKeyLogin"),
                &[],
                &[("Accept", "application/json".to_string())],
                Some(&body),
                self.timeout,
                RetryPolicy::times(LOGIN_RETRIES),
            )
            .await?;
        let resp: LoginResponse = decode("api_key_login", &text)?;
        debug!("token: {}", resp.token);
        Ok(resp.token)
    }

    async fn default_asset_group(&self, token: &str) -> Result<String> {
        let params = match self.query_style {
            QueryStyle::OData => vec![
                ("$filter", "IsDefault eq true".to_string()),
                ("$select", "Id".to_string()),
            ],
            QueryStyle::Equality => vec![("IsDefault", "true".to_string())],
        };
        let text = self
            .transport
            .get(
                &self.api_url("AssetGroups"),
                &params,
                &bearer_json(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await?;
        let groups: Vec<IdOnly> = decode("default_asset_group", &text)?;
        groups
            .first()
            .map(|g| g.id.clone())
            .ok_or_else(|| IastError::other("no default asset group found"))
    }

    async fn app_by_id(&self, token: &str, app_id: &str) -> Result<Option<String>> {
        let params = vec![("id", app_id.to_string())];
        match self
            .transport
            .get(
                &self.api_url("Apps"),
                &params,
                &bearer_json(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await
        {
            Ok(text) => {
                let app: AppResponse = decode("app_by_id", &text)?;
                Ok(Some(app.name))
            }
            Err(err) if err.is_client_error() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn app_id_by_name(&self, token: &str, name: &str) -> Result<Option<String>> {
        let mut params = self.query_style.filter_eq("Name", name);
        if self.query_style == QueryStyle::OData {
            params.push(("$select", "Id".to_string()));
        }
        let text = self
            .transport
            .get(
                &self.api_url("Apps"),
                &params,
                &bearer_json(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await?;
        let apps: Vec<IdOnly> = decode("app_id_by_name", &text)?;
        Ok(apps.first().map(|a| a.id.clone()))
    }

    async fn create_app(&self, token: &str, name: &str, asset_group: &str) -> Result<String> {
        let model = AppModel {
            name: name.to_string(),
            asset_group_id: asset_group.to_string(),
        };
        let body = to_body("create_app", &model)?;
        let text = self
            .transport
            .post(
                &self.api_url("Apps"),
                &[],
                &bearer_json(token),
                Some(&body),
                self.timeout,
                self.write_retry,
            )
            .await?;
        let app: IdOnly = decode("create_app", &text)?;
        Ok(app.id)
    }

    async fn delete_app(&self, token: &str, app_id: &str) -> Result<()> {
        self.transport
            .delete(
                &self.api_url(&format!("Apps/{app_id}")),
                &[],
                &bearer_plain(token),
                self.long_timeout(),
                self.write_retry,
            )
            .await
    }

    async fn scan_info_by_id(&self, token: &str, scan_id: &str) -> Result<Option<ScanInfo>> {
        let params = vec![("scanId", scan_id.to_string())];
        match self
            .transport
            .get(
                &self.api_url("Scans"),
                &params,
                &bearer_json(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await
        {
            Ok(text) => {
                let scan: ScanResponse = decode("scan_info_by_id", &text)?;
                Ok(Some(ScanInfo {
                    scan_id: scan_id.to_string(),
                    scan_name: scan.name,
                    app_name: scan.app_name,
                    app_id: scan.app_id,
                }))
            }
            Err(err) if err.is_client_error() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn scan_info_by_name(&self, token: &str, name: &str) -> Result<Option<ScanInfo>> {
        let params = self.query_style.filter_eq("Name", name);
        let text = self
            .transport
            .get(
                &self.api_url("Scans"),
                &params,
                &bearer_json(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await?;
        let scans: Vec<ScanListEntry> = decode("scan_info_by_name", &text)?;
        Ok(scans.first().map(|s| ScanInfo {
            scan_id: s.id.clone(),
            scan_name: name.to_string(),
            app_name: s.app_name.clone(),
            app_id: s.app_id.clone(),
        }))
    }

    async fn create_scan(&self, token: &str, app_id: &str, scan_name: &str) -> Result<ScanKey> {
        let model = ScanModel {
            conn_lost_stop_timer: String::new(),
            scan_name: scan_name.to_string(),
            enable_mail_notification: true,
            locale: "en-US".to_string(),
            app_id: app_id.to_string(),
            personal: false,
        };
        let body = to_body("create_scan", &model)?;
        let text = self
            .transport
            .post(
                &self.api_url("Scans/IASTAnalyzer"),
                &[],
                &bearer_json(token),
                Some(&body),
                self.long_timeout(),
                self.write_retry,
            )
            .await?;
        let resp: CreateScanResponse = decode("create_scan", &text)?;
        debug!("agent key: {}", resp.agent_key);
        info!("scan id: {}", resp.id);
        Ok(ScanKey {
            agent_key: resp.agent_key,
            scan_id: resp.id,
        })
    }

    async fn new_agent_key(&self, token: &str, scan_id: &str) -> Result<Option<String>> {
        match self
            .transport
            .post(
                &self.api_url(&format!("Scans/NewIASTKey/{scan_id}")),
                &[],
                &bearer_json(token),
                None,
                self.timeout,
                RetryPolicy::NONE,
            )
            .await
        {
            Ok(text) => {
                let resp: KeyResponse = decode("new_agent_key", &text)?;
                Ok(Some(resp.key))
            }
            Err(err) if err.is_client_error() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn delete_scan(&self, token: &str, scan_id: &str) -> Result<()> {
        let params = vec![("deleteIssues", "true".to_string())];
        self.transport
            .delete(
                &self.api_url(&format!("Scans/{scan_id}")),
                &params,
                &bearer_plain(token),
                self.long_timeout(),
                self.write_retry,
            )
            .await
    }

    async fn download_agent(&self, agent_key: &str, dest: &Path) -> Result<()> {
        let headers = vec![("Authorization", format!("Bearer {agent_key}"))];
        self.transport
            .download(
                &self.iast_url("api/DownloadVersion"),
                &[],
                &headers,
                self.timeout,
                self.write_retry,
                dest,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http_response(status: u16, body: &str) -> String {
        let reason = match status {
            200 => "OK",
            400 => "Bad Request",
            500 => "Internal Server Error",
            _ => "Unknown",
        };
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    async fn serve_script(responses: Vec<String>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for resp in responses {
                let (mut sock, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        addr
    }

    fn client_for(addr: SocketAddr) -> AsocClient {
        AsocClient::new(
            format!("http://{addr}"),
            format!("http://{addr}"),
            QueryStyle::OData,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn login_parses_token() {
        let addr = serve_script(vec![http_response(200, r#"{"Token":"tok-1"}"#)]).await;
        let token = client_for(addr).api_key_login("k", "s").await.unwrap();
        assert_eq!(token, "tok-1");
    }

    #[tokio::test]
    async fn login_missing_token_is_schema_error() {
        let addr = serve_script(vec![http_response(200, r#"{"Unexpected":true}"#)]).await;
        let err = client_for(addr).api_key_login("k", "s").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("api_key_login"), "got: {msg}");
        assert!(msg.contains("Unexpected"), "raw body retained: {msg}");
    }

    #[tokio::test]
    async fn app_lookup_downgrades_400_to_not_found() {
        let addr = serve_script(vec![http_response(400, r#"{"Message":"bad id"}"#)]).await;
        let found = client_for(addr).app_by_id("tok", "nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn app_id_by_name_is_stable_across_lookups() {
        let body = r#"[{"Id":"a1"}]"#;
        let addr = serve_script(vec![http_response(200, body), http_response(200, body)]).await;
        let client = client_for(addr);
        let first = client.app_id_by_name("tok", "my-app").await.unwrap();
        let second = client.app_id_by_name("tok", "my-app").await.unwrap();
        assert_eq!(first.as_deref(), Some("a1"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn app_id_by_name_empty_set_is_none() {
        let addr = serve_script(vec![http_response(200, "[]")]).await;
        let found = client_for(addr).app_id_by_name("tok", "ghost").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn scan_lookup_by_name_resolves_owning_app() {
        let body = r#"[{"Id":"s9","AppName":"shop","AppId":"a7"}]"#;
        let addr = serve_script(vec![http_response(200, body)]).await;
        let info = client_for(addr)
            .scan_info_by_name("tok", "nightly")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.scan_id, "s9");
        assert_eq!(info.scan_name, "nightly");
        assert_eq!(info.app_id, "a7");
        assert_eq!(info.app_name, "shop");
    }

    #[tokio::test]
    async fn create_scan_returns_key_and_id() {
        let addr = serve_script(vec![http_response(
            200,
            r#"{"Agentkey":"key-abc","Id":"scan-1"}"#,
        )])
        .await;
        let created = client_for(addr)
            .create_scan("tok", "app-1", "nightly")
            .await
            .unwrap();
        assert_eq!(created.agent_key, "key-abc");
        assert_eq!(created.scan_id, "scan-1");
    }

    #[tokio::test]
    async fn key_rotation_downgrades_400_to_no_key() {
        let addr = serve_script(vec![http_response(400, r#"{"Message":"gone"}"#)]).await;
        let key = client_for(addr).new_agent_key("tok", "dead").await.unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn query_styles_build_distinct_params() {
        let odata = QueryStyle::OData.filter_eq("Name", "my-app");
        assert_eq!(odata, vec![("$filter", "Name eq 'my-app'".to_string())]);
        let eq = QueryStyle::Equality.filter_eq("Name", "my-app");
        assert_eq!(eq, vec![("Name", "my-app".to_string())]);
    }
}
