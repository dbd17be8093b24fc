//! Report generation endpoints and the direct IAST execution sub-API.

use std::fmt;
use std::time::Duration;

use iastkit_core::{IastError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use transport::RetryPolicy;

use crate::{bearer_json, bearer_plain, decode, to_body, AsocClient};

/// Interval between report status polls.
pub const REPORT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default number of polls before giving up on a report.
pub const DEFAULT_REPORT_RETRIES: u32 = 100;

/// Report preparation state as reported by the service. Transitions from
/// pending-ish states to a terminal `Ready` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    Pending,
    Starting,
    Running,
    Ready,
    Failed,
    Other(String),
}

impl ReportStatus {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" => ReportStatus::Pending,
            "starting" => ReportStatus::Starting,
            "running" => ReportStatus::Running,
            "ready" => ReportStatus::Ready,
            "failed" => ReportStatus::Failed,
            _ => ReportStatus::Other(s.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportStatus::Ready | ReportStatus::Failed)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportStatus::Pending => write!(f, "Pending"),
            ReportStatus::Starting => write!(f, "Starting"),
            ReportStatus::Running => write!(f, "Running"),
            ReportStatus::Ready => write!(f, "Ready"),
            ReportStatus::Failed => write!(f, "Failed"),
            ReportStatus::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Serialize)]
struct ReportConfiguration {
    #[serde(rename = "Summary")]
    summary: bool,
    #[serde(rename = "Details")]
    details: bool,
    #[serde(rename = "Discussion")]
    discussion: bool,
    #[serde(rename = "Overview")]
    overview: bool,
    #[serde(rename = "TableOfContent")]
    table_of_content: bool,
    #[serde(rename = "Advisories")]
    advisories: bool,
    #[serde(rename = "FixRecommendation")]
    fix_recommendation: bool,
    #[serde(rename = "History")]
    history: bool,
    #[serde(rename = "IsTrialReport")]
    is_trial_report: bool,
    #[serde(rename = "ReportFileType")]
    report_file_type: String,
}

impl ReportConfiguration {
    /// Xml generates quickly; Html is slower and Pdf far slower.
    fn security_xml() -> Self {
        ReportConfiguration {
            summary: true,
            details: true,
            discussion: false,
            overview: false,
            table_of_content: true,
            advisories: false,
            fix_recommendation: false,
            history: true,
            is_trial_report: true,
            report_file_type: "Xml".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ReportRef {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ReportJob {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize)]
struct ExecutionRef {
    #[serde(rename = "ExecutionId")]
    execution_id: String,
}

impl AsocClient {
    /// Kicks off a security-report build scoped to one scan.
    pub async fn create_report(&self, token: &str, scan_id: &str) -> Result<String> {
        let config = to_body("create_report", &ReportConfiguration::security_xml())?;
        let body = serde_json::json!({ "Configuration": config });
        let text = self
            .transport
            .post(
                &self.api_url(&format!("Reports/Security/Scan/{scan_id}")),
                &[],
                &bearer_json(token),
                Some(&body),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await?;
        let resp: ReportRef = decode("create_report", &text)?;
        info!("report id: {}", resp.id);
        Ok(resp.id)
    }

    pub async fn report_status(&self, token: &str, report_id: &str) -> Result<ReportStatus> {
        let text = self
            .transport
            .get(
                &self.api_url(&format!("Reports/{report_id}")),
                &[],
                &bearer_json(token),
                self.long_timeout(),
                RetryPolicy::NONE,
            )
            .await?;
        let job: ReportJob = decode("report_status", &text)?;
        let status = ReportStatus::parse(&job.status);
        info!("report status: {status}");
        Ok(status)
    }

    /// Polls until the report reaches a terminal state. Distinguishes a
    /// failed build from simply running out of polls.
    pub async fn wait_for_report_ready(
        &self,
        token: &str,
        report_id: &str,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Result<()> {
        for _ in 0..max_retries {
            match self.report_status(token, report_id).await? {
                ReportStatus::Ready => return Ok(()),
                ReportStatus::Failed => {
                    return Err(IastError::other("asoc report generation failed"))
                }
                _ => tokio::time::sleep(poll_interval).await,
            }
        }
        Err(IastError::other("timed out waiting for report ready"))
    }

    /// Fetches the finished report body as text.
    pub async fn download_report(&self, token: &str, report_id: &str) -> Result<String> {
        self.transport
            .get(
                &self.api_url(&format!("Reports/Download/{report_id}")),
                &[],
                &bearer_plain(token),
                self.timeout,
                RetryPolicy::NONE,
            )
            .await
    }

    /// Starts a new execution directly on the IAST sub-API.
    pub async fn start_execution(&self, agent_key: &str) -> Result<String> {
        let headers = vec![("Authorization", format!("Bearer {agent_key}"))];
        let text = self
            .transport
            .post(
                &self.iast_url("api/StartNewExecution"),
                &[],
                &headers,
                None,
                self.timeout,
                self.write_retry,
            )
            .await?;
        let resp: ExecutionRef = decode("start_execution", &text)?;
        info!("started new execution with id: {}", resp.execution_id);
        Ok(resp.execution_id)
    }

    pub async fn stop_execution(&self, agent_key: &str) -> Result<()> {
        let headers = vec![("Authorization", format!("Bearer {agent_key}"))];
        self.transport
            .post(
                &self.iast_url("api/StopExecution"),
                &[],
                &headers,
                None,
                self.timeout,
                self.write_retry,
            )
            .await
            .map(|_| ())
    }
}
