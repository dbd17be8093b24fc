//! HTTP request layer: uniform retry, failure classification, streamed download.
//!
//! Every call is logged (method, URL, params, and body for write calls)
//! before it is sent. Failures are classified into human-readable messages
//! and retried per the caller's [`RetryPolicy`]; exhausting the policy
//! surfaces a single transport error carrying the classified message.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use iastkit_core::{IastError, Result};
use rand::{thread_rng, Rng};
use reqwest::{Client, Method};
use tracing::{debug, info, warn};

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Retry immediately.
    None,
    Fixed(Duration),
    /// Doubles per attempt from the given base, capped, with jitter.
    Exponential(Duration),
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Backoff::None => None,
            Backoff::Fixed(d) => Some(*d),
            Backoff::Exponential(base) => {
                let base = base.as_millis() as u64;
                let exp = base.saturating_mul(1u64 << attempt.min(6)); // cap growth
                let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
                Some(Duration::from_millis(exp + jitter))
            }
        }
    }
}

/// How many times a failed call is re-sent, and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        attempts: 0,
        backoff: Backoff::None,
    };

    /// Retry `attempts` times with no delay in between.
    pub fn times(attempts: u32) -> Self {
        RetryPolicy {
            attempts,
            backoff: Backoff::None,
        }
    }

    pub fn with_backoff(attempts: u32, backoff: Backoff) -> Self {
        RetryPolicy { attempts, backoff }
    }
}

pub struct RequestClient {
    http: Client,
}

impl RequestClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| IastError::transport(format!("failed to build http client: {e}")))?;
        Ok(RequestClient { http })
    }

    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<String> {
        self.send(Method::GET, url, params, headers, None, timeout, retry)
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        body: Option<&serde_json::Value>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<String> {
        self.send(Method::POST, url, params, headers, body, timeout, retry)
            .await
    }

    pub async fn put(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        body: Option<&serde_json::Value>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<String> {
        self.send(Method::PUT, url, params, headers, body, timeout, retry)
            .await
    }

    pub async fn delete(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<()> {
        self.send(Method::DELETE, url, params, headers, None, timeout, retry)
            .await
            .map(|_| ())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        body: Option<&serde_json::Value>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<String> {
        let mut remaining = retry.attempts;
        loop {
            log_request(&method, url, params, body);
            match self
                .send_once(method.clone(), url, params, headers, body, timeout)
                .await
            {
                Ok(text) => return Ok(text),
                Err(err) if remaining > 0 => {
                    warn!("{err}. Retrying request.");
                    let attempt = retry.attempts - remaining;
                    if let Some(delay) = retry.backoff.delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                    remaining -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<String> {
        let mut req = self.http.request(method, url).timeout(timeout);
        if !params.is_empty() {
            req = req.query(params);
        }
        for (name, value) in headers {
            req = req.header(*name, value.as_str());
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| classify(url, &e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify(url, &e))?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(IastError::status(
                status.as_u16(),
                format!("{status} error for url {url}: {text}"),
            ))
        }
    }

    /// GET whose payload is streamed straight to `dest` instead of being
    /// buffered. A non-2xx status is an error and nothing is written.
    pub async fn download(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
        retry: RetryPolicy,
        dest: &Path,
    ) -> Result<()> {
        let mut remaining = retry.attempts;
        loop {
            log_request(&Method::GET, url, params, None);
            match self
                .download_once(url, params, headers, timeout, dest)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if remaining > 0 => {
                    warn!("{err}. Retrying request.");
                    let attempt = retry.attempts - remaining;
                    if let Some(delay) = retry.backoff.delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                    remaining -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn download_once(
        &self,
        url: &str,
        params: &[(&str, String)],
        headers: &[(&str, String)],
        timeout: Duration,
        dest: &Path,
    ) -> Result<()> {
        let mut req = self.http.get(url).timeout(timeout);
        if !params.is_empty() {
            req = req.query(params);
        }
        for (name, value) in headers {
            req = req.header(*name, value.as_str());
        }
        let mut resp = req.send().await.map_err(|e| classify(url, &e))?;
        let status = resp.status();
        debug!("response status: {status}");
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(IastError::status(
                status.as_u16(),
                format!("{status} error for url {url}: {text}"),
            ));
        }
        let mut file = std::fs::File::create(dest)?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| classify(url, &e))? {
            file.write_all(&chunk)?;
        }
        Ok(())
    }
}

fn classify(url: &str, err: &reqwest::Error) -> IastError {
    if err.is_timeout() {
        IastError::transport(format!("request to {url} timed out."))
    } else if err.is_redirect() {
        IastError::transport("Too many redirects!")
    } else if err.is_connect() {
        IastError::transport(format!("request to {url} failed with connection error: {err}"))
    } else {
        IastError::transport(format!("request to {url} failed: {err}"))
    }
}

fn log_request(method: &Method, url: &str, params: &[(&str, String)], body: Option<&serde_json::Value>) {
    let mut line = format!("{method} {url}");
    if !params.is_empty() {
        let rendered = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        line.push_str(&format!(", params: {rendered}"));
    }
    if let Some(body) = body {
        line.push_str(&format!(", body: {body}"));
    }
    info!("{line}");
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
            404 => "Not Found",
            500 => "Internal Server Error",
            _ => "Unknown",
        };
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Serves the given raw responses in order, one connection each.
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

    #[tokio::test]
    async fn succeeds_without_retries() {
        let addr = serve_script(vec![http_response(200, "ok")]).await;
        let client = RequestClient::new().unwrap();
        let body = client
            .get(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::NONE,
            )
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn retries_until_success() {
        // fails twice, succeeds on the third attempt; two retries suffice
        let addr = serve_script(vec![
            http_response(500, "boom"),
            http_response(500, "boom"),
            http_response(200, "recovered"),
        ])
        .await;
        let client = RequestClient::new().unwrap();
        let body = client
            .get(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::with_backoff(2, Backoff::Fixed(Duration::from_millis(1))),
            )
            .await
            .unwrap();
        assert_eq!(body, "recovered");
    }

    #[tokio::test]
    async fn put_sends_body() {
        let addr = serve_script(vec![http_response(200, "updated")]).await;
        let client = RequestClient::new().unwrap();
        let body = serde_json::json!({ "Name": "renamed" });
        let text = client
            .put(
                &format!("http://{addr}/"),
                &[],
                &[],
                Some(&body),
                Duration::from_secs(5),
                RetryPolicy::NONE,
            )
            .await
            .unwrap();
        assert_eq!(text, "updated");
    }

    #[tokio::test]
    async fn surfaces_error_after_exhausting_retries() {
        let addr = serve_script(vec![
            http_response(500, "boom"),
            http_response(500, "boom"),
        ])
        .await;
        let client = RequestClient::new().unwrap();
        let err = client
            .get(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::times(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn client_errors_carry_status() {
        let addr = serve_script(vec![http_response(400, "bad id")]).await;
        let client = RequestClient::new().unwrap();
        let err = client
            .get(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::NONE,
            )
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("bad id"));
    }

    #[tokio::test]
    async fn download_writes_payload_to_dest() {
        let addr = serve_script(vec![http_response(200, "zip-bytes")]).await;
        let client = RequestClient::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload.zip");
        client
            .download(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::NONE,
                &dest,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "zip-bytes");
    }

    #[tokio::test]
    async fn download_rejects_error_status() {
        let addr = serve_script(vec![http_response(404, "no such version")]).await;
        let client = RequestClient::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload.zip");
        let err = client
            .download(
                &format!("http://{addr}/"),
                &[],
                &[],
                Duration::from_secs(5),
                RetryPolicy::NONE,
                &dest,
            )
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(!dest.exists());
    }

    #[test]
    fn backoff_delays() {
        assert!(Backoff::None.delay(0).is_none());
        assert_eq!(
            Backoff::Fixed(Duration::from_millis(50)).delay(3),
            Some(Duration::from_millis(50))
        );
        let exp = Backoff::Exponential(Duration::from_millis(10));
        let d0 = exp.delay(0).unwrap();
        assert!(d0 >= Duration::from_millis(10));
        let d6 = exp.delay(6).unwrap();
        let d9 = exp.delay(9).unwrap();
        // growth caps at attempt 6
        assert!(d6 <= Duration::from_millis(640 + 161));
        assert!(d9 <= Duration::from_millis(640 + 161));
    }
}
