//! Share links: let family view or help edit the dashboard without an account.

use crate::offline::OfflineSwitch;
use crate::remote::{HttpRemote, RemoteError, RemoteStore};
use crate::store::LocalStore;
use crate::sync::Access;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// A whole token, or the last path segment of a `/shared/<token>` link.
static SHARE_TOKEN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"(?:^|/)([0-9a-f]{64})$"));

/// Last access the backend granted, kept in the shared namespace.
pub const ACCESS_KEY: &str = "shareAccess";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    View,
    Edit,
}

impl AccessLevel {
    pub fn can_edit(&self) -> bool {
        matches!(self, AccessLevel::Edit)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::View => f.write_str("view"),
            AccessLevel::Edit => f.write_str("edit"),
        }
    }
}

impl FromStr for AccessLevel {
    type Err = ShareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "view" => Ok(AccessLevel::View),
            "edit" => Ok(AccessLevel::Edit),
            other => Err(ShareError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("not a share token or link: {0}")]
    InvalidToken(String),
    #[error("share token pattern failed to compile: {0}")]
    Pattern(#[source] regex::Error),
    #[error("unknown access level: {0}")]
    UnknownLevel(String),
    #[error("share link is invalid or has been revoked")]
    Revoked,
    #[error("share link has expired")]
    Expired,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// What the backend grants to a share token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareAccess {
    pub access_level: AccessLevel,
    #[serde(default)]
    pub couple_name: Option<String>,
    #[serde(default)]
    pub user_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareLink {
    #[serde(alias = "shareToken")]
    pub token: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_link: Option<String>,
}

/// Pull the 64-hex share token out of a raw token or a full `/shared/<token>` link.
pub fn parse_token(input: &str) -> Result<String, ShareError> {
    let re = SHARE_TOKEN
        .as_ref()
        .map_err(|err| ShareError::Pattern(err.clone()))?;
    let lowered = input.trim().to_ascii_lowercase();
    let path = lowered.split(['?', '#']).next().unwrap_or_default();
    re.captures(path.trim_end_matches('/'))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ShareError::InvalidToken(input.to_string()))
}

/// Local store namespace for a shared session. Never collides with a user name.
pub fn shared_namespace(token: &str) -> String {
    let prefix: String = token.chars().take(12).collect();
    format!("shared:{prefix}")
}

#[derive(Debug, Clone)]
pub struct SharedSession {
    pub token: String,
    pub access: ShareAccess,
}

impl SharedSession {
    pub fn namespace(&self) -> String {
        shared_namespace(&self.token)
    }

    pub fn sync_access(&self) -> Access {
        Access::Shared {
            token: self.token.clone(),
            level: self.access.access_level,
        }
    }

    pub fn couple_name(&self) -> &str {
        self.access.couple_name.as_deref().unwrap_or("Wedding")
    }
}

/// Resolve a share token or link. Online, the backend decides the access
/// level and the answer is cached in the shared namespace of `store`.
/// Offline, the cached answer is reused, or view access if there is none.
#[instrument(skip_all)]
pub async fn open_shared(
    remote: &dyn RemoteStore,
    store: &LocalStore,
    offline: &OfflineSwitch,
    link: &str,
) -> Result<SharedSession, ShareError> {
    let token = parse_token(link)?;
    let shared = store.scoped(shared_namespace(&token));
    if offline.is_offline() {
        let access = shared
            .get_data::<ShareAccess>(ACCESS_KEY)
            .await
            .unwrap_or_else(|| ShareAccess {
                access_level: AccessLevel::View,
                couple_name: None,
                user_data: None,
            });
        debug!(level = %access.access_level, "offline; using cached share access");
        return Ok(SharedSession { token, access });
    }

    let access = remote.access_share(&token).await.map_err(|err| match err {
        RemoteError::Status { status: 404, .. } => ShareError::Revoked,
        RemoteError::Status { status: 403, .. } => ShareError::Expired,
        other => ShareError::Remote(other),
    })?;
    shared.set_data(ACCESS_KEY, &access).await;
    info!(level = %access.access_level, "opened shared dashboard");
    Ok(SharedSession { token, access })
}

impl HttpRemote {
    #[instrument(skip(self))]
    pub async fn generate_share_link(&self, level: AccessLevel) -> Result<ShareLink, ShareError> {
        let url = self.url("api/sharing/generate")?;
        let body = json!({ "accessLevel": level });
        let request = self.build_request(Method::POST, url, Some(&body), None).await?;
        let payload = self.execute(request).await?;
        let link: ShareLink = serde_json::from_value(payload)
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        info!(level = %link.access_level, "share link created");
        Ok(link)
    }

    pub async fn list_share_links(&self) -> Result<Vec<ShareLink>, ShareError> {
        let url = self.url("api/sharing/links")?;
        let request = self
            .build_request(Method::GET, url, None, Some(self.read_timeout()))
            .await?;
        let links = match self.execute(request).await? {
            Value::Object(mut map) => map.remove("links").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        serde_json::from_value(links)
            .map_err(|err| ShareError::Remote(RemoteError::Decode(err.to_string())))
    }

    pub async fn revoke_share_link(&self, token: &str) -> Result<(), ShareError> {
        let token = parse_token(token)?;
        let url = self.url(&format!("api/sharing/{token}"))?;
        let request = self.build_request(Method::DELETE, url, None, None).await?;
        self.execute(request).await?;
        info!("share link revoked");
        Ok(())
    }
}
