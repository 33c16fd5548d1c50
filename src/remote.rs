use crate::auth::TokenSource;
use crate::model::ResourceKind;
use crate::share::ShareAccess;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderValue, ACCEPT, IF_MATCH};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no auth token available")]
    MissingToken,
    #[error("{0} has no backend endpoint")]
    NoEndpoint(ResourceKind),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected a conflicting edit ({status})")]
    Conflict { status: u16 },
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404, .. })
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

/// Backend the sync layer talks to. Records cross this boundary as JSON so
/// the trait stays object safe; typed decoding happens in the collection.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<Value>, RemoteError>;

    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<Value, RemoteError>;

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        body: &Value,
        version: Option<DateTime<Utc>>,
    ) -> Result<Value, RemoteError>;

    async fn delete(
        &self,
        kind: ResourceKind,
        id: &str,
        version: Option<DateTime<Utc>>,
    ) -> Result<(), RemoteError>;

    async fn access_share(&self, token: &str) -> Result<ShareAccess, RemoteError>;
}

/// REST client for `/api/{resource}[/:id]`.
#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
    read_timeout: Duration,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenSource>,
        read_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|err| RemoteError::InvalidUrl(format!("{base}: {err}")))?;
        let http = Client::builder()
            .user_agent(concat!("vivaha-sync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .map_err(RemoteError::from_reqwest)?;
        Ok(Self {
            http,
            base_url,
            tokens,
            read_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|err| RemoteError::InvalidUrl(format!("{path}: {err}")))
    }

    pub fn collection_url(&self, kind: ResourceKind, id: Option<&str>) -> Result<Url, RemoteError> {
        let endpoint = kind.endpoint().ok_or(RemoteError::NoEndpoint(kind))?;
        match id {
            Some(id) => self.url(&format!("{endpoint}/{id}")),
            None => self.url(endpoint),
        }
    }

    /// Build an authenticated request. The token is read from the source now,
    /// so a token replaced between two calls is picked up by the second one.
    pub async fn build_request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Request, RemoteError> {
        let token = self.tokens.bearer().await.ok_or(RemoteError::MissingToken)?;
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().map_err(RemoteError::from_reqwest)
    }

    pub(crate) fn public_request(&self, method: Method, url: Url) -> Result<reqwest::Request, RemoteError> {
        self.http
            .request(method, url)
            .header(ACCEPT, "application/json")
            .timeout(self.read_timeout)
            .build()
            .map_err(RemoteError::from_reqwest)
    }

    /// Send a request and return the unwrapped JSON payload (`Null` for an empty body).
    pub(crate) async fn execute(&self, request: reqwest::Request) -> Result<Value, RemoteError> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, path = url.path(), "sending request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(RemoteError::from_reqwest)?;
        let status = res.status();

        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            warn!(%method, path = url.path(), %status, "server reported conflicting version");
            return Err(RemoteError::Conflict {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%method, path = url.path(), %status, "request failed");
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = res.text().await.map_err(RemoteError::from_reqwest)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let payload: Value =
            serde_json::from_str(&text).map_err(|err| RemoteError::Decode(err.to_string()))?;
        Ok(unwrap_envelope(payload))
    }
}

fn set_if_match(
    request: &mut reqwest::Request,
    version: Option<DateTime<Utc>>,
) -> Result<(), RemoteError> {
    if let Some(version) = version {
        let tag = format!("\"{}\"", version.to_rfc3339_opts(SecondsFormat::Millis, true));
        let value =
            HeaderValue::from_str(&tag).map_err(|err| RemoteError::Decode(err.to_string()))?;
        request.headers_mut().insert(IF_MATCH, value);
    }
    Ok(())
}

/// The backend answers `{ "success": true, "data": ... }`; some routes return
/// the payload bare. Strip the envelope when present.
pub fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.contains_key("success") => match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        },
        other => other,
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch_all(&self, kind: ResourceKind) -> Result<Vec<Value>, RemoteError> {
        let url = self.collection_url(kind, None)?;
        let request = self
            .build_request(Method::GET, url, None, Some(self.read_timeout))
            .await?;
        match self.execute(request).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::Decode(format!(
                "expected a list of {kind}, got {}",
                json_type(&other)
            ))),
        }
    }

    async fn create(&self, kind: ResourceKind, body: &Value) -> Result<Value, RemoteError> {
        let url = self.collection_url(kind, None)?;
        let request = self.build_request(Method::POST, url, Some(body), None).await?;
        self.execute(request).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: &str,
        body: &Value,
        version: Option<DateTime<Utc>>,
    ) -> Result<Value, RemoteError> {
        let url = self.collection_url(kind, Some(id))?;
        let mut request = self.build_request(Method::PUT, url, Some(body), None).await?;
        set_if_match(&mut request, version)?;
        self.execute(request).await
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        id: &str,
        version: Option<DateTime<Utc>>,
    ) -> Result<(), RemoteError> {
        let url = self.collection_url(kind, Some(id))?;
        let mut request = self.build_request(Method::DELETE, url, None, None).await?;
        set_if_match(&mut request, version)?;
        self.execute(request).await.map(|_| ())
    }

    async fn access_share(&self, token: &str) -> Result<ShareAccess, RemoteError> {
        let url = self.url(&format!("api/sharing/access/{token}"))?;
        let request = self.public_request(Method::GET, url)?;
        let payload = self.execute(request).await?;
        serde_json::from_value(payload).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
