//! HTTP source adapters
//!
//! `http_no_auth` pulls pages from a JSON endpoint; `http_with_auth`
//! additionally holds a bearer token obtained from an external auth
//! client and refreshes it proactively before expiry (refresh window is
//! a fraction of the TTL, never below 10%).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{Connector, ConnectorStats, FetchResult, SharedStats};
use crate::domain::{ConnectionConfig, DataSource, SourceParams};
use crate::error::SyncError;
use crate::pipeline::resolve_path;

/// A bearer token and its advertised lifetime
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub ttl: Duration,
}

/// Bridge to the external auth client (script host)
///
/// The engine never runs preflight scripts itself; it only consumes the
/// token the host produces.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<AuthToken, SyncError>;
}

/// Fixed-token provider for tests and long-lived API keys
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl AuthTokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<AuthToken, SyncError> {
        Ok(AuthToken {
            token: self.token.clone(),
            ttl: Duration::from_secs(365 * 24 * 3600),
        })
    }
}

struct AuthState {
    provider: Arc<dyn AuthTokenProvider>,
    refresh_window: f64,
    token: Option<String>,
    ttl: Duration,
    expires_at: Option<Instant>,
}

impl AuthState {
    fn new(provider: Arc<dyn AuthTokenProvider>, refresh_window: f64) -> Self {
        Self {
            provider,
            refresh_window: refresh_window.max(0.1),
            token: None,
            ttl: Duration::ZERO,
            expires_at: None,
        }
    }

    /// Refresh proactively once the remaining lifetime drops inside the
    /// refresh window
    fn needs_refresh(&self, now: Instant) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => {
                let window = self.ttl.mul_f64(self.refresh_window);
                expires_at.saturating_duration_since(now) <= window
            }
        }
    }

    async fn ensure(&mut self) -> Result<String, SyncError> {
        if self.needs_refresh(Instant::now()) {
            self.refresh().await?;
        }
        Ok(self.token.clone().expect("token set after refresh"))
    }

    async fn refresh(&mut self) -> Result<(), SyncError> {
        let fresh = self.provider.fetch_token().await?;
        self.ttl = fresh.ttl;
        self.expires_at = Some(Instant::now() + fresh.ttl);
        self.token = Some(fresh.token);
        Ok(())
    }
}

pub struct HttpConnector {
    base_url: String,
    page_param: Option<String>,
    page_size_param: Option<String>,
    data_path: Option<String>,
    headers: HashMap<String, String>,
    params: SourceParams,
    auth: Option<AuthState>,
    client: Option<reqwest::Client>,
    stats: SharedStats,
}

impl HttpConnector {
    pub fn plain(source: &DataSource) -> Result<Self, SyncError> {
        let ConnectionConfig::HttpNoAuth {
            base_url,
            page_param,
            page_size_param,
            data_path,
            headers,
        } = &source.connection
        else {
            return Err(SyncError::Config("source is not http_no_auth".into()));
        };
        Ok(Self::build(
            base_url.clone(),
            page_param.clone(),
            page_size_param.clone(),
            data_path.clone(),
            headers.clone(),
            source.params.clone(),
            None,
        ))
    }

    pub fn with_auth(source: &DataSource, provider: Arc<dyn AuthTokenProvider>) -> Result<Self, SyncError> {
        let ConnectionConfig::HttpWithAuth {
            base_url,
            page_param,
            page_size_param,
            data_path,
            headers,
            auth,
        } = &source.connection
        else {
            return Err(SyncError::Config("source is not http_with_auth".into()));
        };
        Ok(Self::build(
            base_url.clone(),
            page_param.clone(),
            page_size_param.clone(),
            data_path.clone(),
            headers.clone(),
            source.params.clone(),
            Some(AuthState::new(provider, auth.refresh_window)),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        base_url: String,
        page_param: Option<String>,
        page_size_param: Option<String>,
        data_path: Option<String>,
        headers: HashMap<String, String>,
        params: SourceParams,
        auth: Option<AuthState>,
    ) -> Self {
        Self {
            base_url,
            page_param,
            page_size_param,
            data_path,
            headers,
            params,
            auth,
            client: None,
            stats: SharedStats::default(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client, SyncError> {
        self.client
            .as_ref()
            .ok_or_else(|| SyncError::Fatal("http connector used before open()".into()))
    }

    async fn get_json(&mut self, query: &[(String, String)]) -> Result<Value, SyncError> {
        let token = match self.auth.as_mut() {
            Some(auth) => Some(auth.ensure().await?),
            None => None,
        };
        let client = self.client()?;
        let mut request = client.get(&self.base_url).query(query);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if let Some(err) = classify_status(status) {
            self.stats.error();
            return Err(err);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| SyncError::Schema(format!("response body is not JSON: {e}")))
    }
}

/// Map a transport-level reqwest failure onto the taxonomy
fn classify_transport(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout(Duration::from_secs(30))
    } else {
        SyncError::Unavailable(e.to_string())
    }
}

/// Map a non-success HTTP status onto the taxonomy
fn classify_status(status: StatusCode) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        401 | 403 => SyncError::Auth(format!("endpoint returned {status}")),
        408 | 429 => SyncError::Unavailable(format!("endpoint returned {status}")),
        s if s >= 500 => SyncError::Unavailable(format!("endpoint returned {status}")),
        _ => SyncError::Fatal(format!("endpoint returned {status}")),
    })
}

/// Extract the row array from a response body
fn extract_records(body: Value, data_path: Option<&str>) -> Result<Vec<Value>, SyncError> {
    let located = match data_path {
        Some(path) => resolve_path(&body, path)
            .cloned()
            .ok_or_else(|| SyncError::Schema(format!("data path '{path}' not found in response")))?,
        None => body,
    };
    match located {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&mut self) -> Result<(), SyncError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.params.connection_timeout_secs))
            .timeout(Duration::from_secs(self.params.read_timeout_secs))
            .build()
            .map_err(|e| SyncError::Fatal(format!("http client build failed: {e}")))?;
        self.client = Some(client);
        if let Some(auth) = self.auth.as_mut() {
            auth.refresh().await?;
        }
        Ok(())
    }

    async fn fetch_batch(&mut self, cursor: Option<&str>, max: usize) -> Result<FetchResult, SyncError> {
        // Unpaged endpoints are exhausted after one fetch
        if self.page_param.is_none() && cursor.is_some() {
            return Ok(FetchResult::eof());
        }

        let page: u64 = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| SyncError::Fatal(format!("malformed http cursor '{raw}'")))?,
            None => 0,
        };

        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(param) = &self.page_param {
            query.push((param.clone(), page.to_string()));
        }
        if let Some(param) = &self.page_size_param {
            query.push((param.clone(), max.to_string()));
        }

        let body = self.get_json(&query).await?;
        let mut records = extract_records(body, self.data_path.as_deref())?;
        records.truncate(max);

        self.stats.batch();
        self.stats.record(records.len() as u64);

        let eof = self.page_param.is_none() || records.len() < max;
        let next_cursor = if eof { None } else { Some((page + 1).to_string()) };
        Ok(FetchResult {
            records,
            next_cursor,
            eof,
        })
    }

    async fn health(&self) -> Result<(), SyncError> {
        let client = self.client()?;
        let response = client.get(&self.base_url).send().await.map_err(classify_transport)?;
        match classify_status(response.status()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot()
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.client = None;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    async fn refresh_auth(&mut self) -> Result<(), SyncError> {
        if let Some(auth) = self.auth.as_mut() {
            auth.refresh().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED).unwrap().kind(),
            crate::error::ErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().kind(),
            crate::error::ErrorKind::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY).unwrap().kind(),
            crate::error::ErrorKind::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND).unwrap().kind(),
            crate::error::ErrorKind::Fatal
        );
    }

    #[test]
    fn test_extract_records_with_path() {
        let body = json!({"data": {"items": [{"a": 1}, {"a": 2}]}});
        let records = extract_records(body, Some("data.items")).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_extract_records_top_level_array() {
        let records = extract_records(json!([1, 2, 3]), None).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_extract_records_missing_path() {
        let err = extract_records(json!({"data": {}}), Some("data.items")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Schema);
    }

    #[test]
    fn test_refresh_window_timing() {
        let provider = Arc::new(StaticTokenProvider::new("tok"));
        let mut state = AuthState::new(provider, 0.1);
        // Never fetched yet
        assert!(state.needs_refresh(Instant::now()));

        state.ttl = Duration::from_secs(1000);
        let now = Instant::now();
        state.expires_at = Some(now + Duration::from_secs(500));
        state.token = Some("tok".to_string());
        // 500s left of a 1000s TTL with a 100s window: still fresh
        assert!(!state.needs_refresh(now));
        // 50s left: inside the window
        state.expires_at = Some(now + Duration::from_secs(50));
        assert!(state.needs_refresh(now));
    }

    #[test]
    fn test_refresh_window_floor() {
        let provider = Arc::new(StaticTokenProvider::new("tok"));
        // Configured below the 10% floor gets clamped up
        let state = AuthState::new(provider, 0.01);
        assert!((state.refresh_window - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticTokenProvider::new("secret");
        let token = provider.fetch_token().await.unwrap();
        assert_eq!(token.token, "secret");
    }
}
