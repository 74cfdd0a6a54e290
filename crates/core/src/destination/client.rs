//! HTTP client for the destination tenant's administrative API.
//!
//! Authenticates with vendor client credentials, caches the bearer token
//! until shortly before it expires, and wraps every call in the configured
//! [`RetryPolicy`].

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::retry::RetryPolicy;
use super::{CreatedUser, DestinationApi};
use crate::config::{DestinationConfig, EndpointPaths, RetryConfig};
use crate::errors::ClientError;
use crate::models::UserProfileRecord;

/// Header that scopes a user to a sub-tenant of the destination account.
const TENANT_HEADER: &str = "frontegg-tenant-id";

/// Tokens are refreshed this long before the server says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Server-reported token lifetimes are capped at one day.
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Error bodies longer than this are cut before they reach logs and results.
const MAX_ERROR_BODY: usize = 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VendorAuthRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VendorAuthResponse {
    access_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_picture_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authenticator_app_mfa_secret: Option<&'a str>,
}

impl<'a> From<&'a UserProfileRecord> for CreateUserRequest<'a> {
    fn from(profile: &'a UserProfileRecord) -> Self {
        Self {
            email: &profile.email,
            name: profile.name.as_deref(),
            tenant_id: profile.tenant_id.as_deref(),
            phone_number: profile.phone_number.as_deref(),
            profile_picture_url: profile.profile_picture_url.as_deref(),
            metadata: profile.metadata.as_ref(),
            verified: profile.verified,
            provider: profile.provider.as_deref(),
            authenticator_app_mfa_secret: profile.authenticator_app_mfa_secret.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetPasswordRequest<'a> {
    password_hash: &'a str,
    password_hash_type: &'a str,
}

struct AccessToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous destination API client.
pub struct HttpDestinationClient {
    http: reqwest::Client,
    base_url: String,
    paths: EndpointPaths,
    client_id: String,
    secret: String,
    retry: RetryPolicy,
    token: Mutex<Option<AccessToken>>,
}

impl fmt::Debug for HttpDestinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDestinationClient")
            .field("base_url", &self.base_url)
            .field("paths", &self.paths)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HttpDestinationClient {
    /// Build a client with default endpoint paths and retry policy.
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        secret: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("idmigrate/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        info!(base_url = %base_url, "created destination client");
        Ok(Self {
            http,
            base_url,
            paths: EndpointPaths::default(),
            client_id: client_id.into(),
            secret: secret.into(),
            retry: RetryPolicy::default(),
            token: Mutex::new(None),
        })
    }

    /// Build a client from resolved configuration.
    pub fn from_config(
        destination: &DestinationConfig,
        retry: &RetryConfig,
    ) -> Result<Self, ClientError> {
        let client_id = destination.client_id.as_deref().ok_or_else(|| {
            ClientError::Authentication(format!(
                "client ID not resolved from ${}",
                destination.client_id_env
            ))
        })?;
        let secret = destination.secret.as_deref().ok_or_else(|| {
            ClientError::Authentication(format!(
                "secret not resolved from ${}",
                destination.secret_env
            ))
        })?;
        Ok(Self::new(
            &destination.base_url,
            client_id,
            secret,
            destination.timeout(),
        )?
        .with_paths(destination.paths.clone())
        .with_retry(RetryPolicy::from_config(retry)))
    }

    pub fn with_paths(mut self, paths: EndpointPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // -- Authentication -------------------------------------------------------

    /// Exchange vendor credentials for a fresh bearer token and cache it.
    #[instrument(skip(self))]
    pub async fn authenticate(&self) -> Result<(), ClientError> {
        let mut slot = self.token.lock().await;
        let token = self
            .retry
            .run("authenticate", || self.request_token())
            .await?;
        *slot = Some(token);
        Ok(())
    }

    async fn request_token(&self) -> Result<AccessToken, ClientError> {
        let body = VendorAuthRequest {
            client_id: &self.client_id,
            secret: &self.secret,
        };
        let resp = self
            .http
            .post(self.url(&self.paths.auth))
            .json(&body)
            .send()
            .await?;
        let resp = match check_response(resp).await {
            Err(ClientError::Remote { status, body }) if (400..500).contains(&status) => {
                return Err(ClientError::Authentication(format!("HTTP {}: {}", status, body)));
            }
            other => other?,
        };
        let parsed: VendorAuthResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        let value = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Authentication("no access token in response".into()))?;
        debug!(expires_in = parsed.expires_in, "obtained access token");
        Ok(AccessToken {
            value,
            refresh_at: refresh_deadline(Utc::now(), parsed.expires_in)?,
        })
    }

    /// Current bearer token, re-authenticating when it is missing or due.
    async fn bearer(&self) -> Result<String, ClientError> {
        let mut slot = self.token.lock().await;
        if let Some(ref token) = *slot {
            if Utc::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
            debug!("access token due for refresh");
        }
        let token = self.request_token().await?;
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    // -- Single attempts ------------------------------------------------------

    /// One `POST` to the user-creation endpoint. HTTP 409 becomes
    /// [`ClientError::Conflict`].
    async fn post_user(&self, profile: &UserProfileRecord) -> Result<String, ClientError> {
        let token = self.bearer().await?;
        let mut req = self
            .http
            .post(self.url(&self.paths.create_user))
            .bearer_auth(&token)
            .json(&CreateUserRequest::from(profile));
        if let Some(ref tenant) = profile.tenant_id {
            req = req.header(TENANT_HEADER, tenant);
        }
        let resp = req.send().await?;
        if resp.status().as_u16() == 409 {
            return Err(ClientError::Conflict {
                email: profile.email.clone(),
            });
        }
        let user: UserResponse = check_response(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(user.id)
    }

    /// One lookup of an existing destination user by email.
    async fn find_user_by_email(&self, email: &str) -> Result<String, ClientError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(self.url(&self.paths.user_by_email))
            .bearer_auth(&token)
            .query(&[("email", email)])
            .send()
            .await?;
        let user: UserResponse = check_response(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(user.id)
    }

    /// One password assignment.
    async fn put_password(
        &self,
        user_id: &str,
        password_hash: &str,
        hash_algorithm_tag: &str,
    ) -> Result<(), ClientError> {
        let token = self.bearer().await?;
        let path = self.paths.set_password.replace("{userId}", user_id);
        let resp = self
            .http
            .post(self.url(&path))
            .bearer_auth(&token)
            .json(&SetPasswordRequest {
                password_hash,
                password_hash_type: hash_algorithm_tag,
            })
            .send()
            .await?;
        check_response(resp).await?;
        Ok(())
    }
}

impl DestinationApi for HttpDestinationClient {
    async fn check_access(&self) -> Result<(), ClientError> {
        self.authenticate().await
    }

    #[instrument(skip(self, profile), fields(key = %profile.key))]
    async fn create_user(&self, profile: &UserProfileRecord) -> Result<CreatedUser, ClientError> {
        match self.retry.run("create_user", || self.post_user(profile)).await {
            Ok(id) => {
                debug!(user_id = %id, "created destination user");
                Ok(CreatedUser {
                    id,
                    already_existed: false,
                })
            }
            Err(ClientError::Conflict { email }) => {
                info!(email = %email, "user already exists, reusing destination ID");
                let id = self
                    .retry
                    .run("find_user_by_email", || self.find_user_by_email(&email))
                    .await?;
                Ok(CreatedUser {
                    id,
                    already_existed: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, password_hash))]
    async fn set_password(
        &self,
        user_id: &str,
        password_hash: &str,
        hash_algorithm_tag: &str,
    ) -> Result<(), ClientError> {
        self.retry
            .run("set_password", || {
                self.put_password(user_id, password_hash, hash_algorithm_tag)
            })
            .await?;
        debug!(user_id, "password assigned");
        Ok(())
    }
}

/// When a token issued at `now` with `expires_in` seconds to live should be
/// replaced. Lifetimes are clamped to `0..=MAX_TOKEN_LIFETIME_SECS`.
fn refresh_deadline(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, ClientError> {
    let lifetime = expires_in
        .saturating_sub(TOKEN_REFRESH_MARGIN_SECS)
        .clamp(0, MAX_TOKEN_LIFETIME_SECS);
    TimeDelta::try_seconds(lifetime)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| ClientError::Parse(format!("unusable token lifetime: {}s", expires_in)))
}

/// Map a non-2xx response into the matching [`ClientError`].
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after_secs = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = truncate_body(resp.text().await.unwrap_or_default());

    match status.as_u16() {
        401 | 403 => Err(ClientError::Authentication(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body
        ))),
        429 => Err(ClientError::RateLimited {
            retry_after_secs,
            body,
        }),
        code => Err(ClientError::Remote { status: code, body }),
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile() -> UserProfileRecord {
        UserProfileRecord {
            key: "a@x.com".into(),
            row: 1,
            email: "A@x.com".into(),
            source_id: Some("src-1".into()),
            name: Some("A".into()),
            tenant_id: Some("t-1".into()),
            phone_number: None,
            profile_picture_url: None,
            metadata: Some(serde_json::json!({"plan": "pro"})),
            verified: Some(true),
            provider: Some("local".into()),
            authenticator_app_mfa_secret: Some("JBSWY3DP".into()),
        }
    }

    #[test]
    fn test_create_user_request_shape() {
        let p = profile();
        let body = serde_json::to_value(CreateUserRequest::from(&p)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "email": "A@x.com",
                "name": "A",
                "tenantId": "t-1",
                "metadata": {"plan": "pro"},
                "verified": true,
                "provider": "local",
                "authenticatorAppMfaSecret": "JBSWY3DP"
            })
        );
    }

    #[test]
    fn test_set_password_request_shape() {
        let body = serde_json::to_value(SetPasswordRequest {
            password_hash: "$2b$10$abc",
            password_hash_type: "bcrypt",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"passwordHash": "$2b$10$abc", "passwordHashType": "bcrypt"})
        );
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = HttpDestinationClient::new(
            "https://api.example.com/",
            "id",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url("/auth/vendor"),
            "https://api.example.com/auth/vendor"
        );
    }

    #[test]
    fn test_debug_hides_credentials() {
        let client = HttpDestinationClient::new(
            "https://api.example.com",
            "client-abc",
            "top-secret",
            Duration::from_secs(5),
        )
        .unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("top-secret"));
        assert!(!debug.contains("client-abc"));
    }

    #[test]
    fn test_from_config_requires_resolved_credentials() {
        let destination: DestinationConfig = toml::from_str(
            r#"
base_url = "https://api.example.com"
client_id_env = "NOPE_ID"
secret_env = "NOPE_SECRET"
"#,
        )
        .unwrap();
        let result = HttpDestinationClient::from_config(&destination, &RetryConfig::default());
        assert!(matches!(result, Err(ClientError::Authentication(_))));
    }

    #[test]
    fn test_refresh_deadline_applies_margin() {
        let now = Utc::now();
        assert_eq!(
            refresh_deadline(now, 3600).unwrap(),
            now + TimeDelta::seconds(3540)
        );
        assert_eq!(refresh_deadline(now, 30).unwrap(), now);
    }

    #[test]
    fn test_refresh_deadline_clamps_extreme_lifetimes() {
        let now = Utc::now();
        assert_eq!(
            refresh_deadline(now, i64::MAX).unwrap(),
            now + TimeDelta::seconds(MAX_TOKEN_LIFETIME_SECS)
        );
        assert_eq!(refresh_deadline(now, i64::MIN).unwrap(), now);
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let short = truncate_body("oops".into());
        assert_eq!(short, "oops");

        let long = "é".repeat(MAX_ERROR_BODY);
        let cut = truncate_body(long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= MAX_ERROR_BODY + 3);
    }
}
