//! Credential and TLS capabilities attached to a client.
//!
//! Credentials are a closed set, so they are an enum rather than a trait
//! object. Token-bearing variants keep their mutable state behind a lock and
//! refresh against the server's `/auth/token` grant endpoint.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

/// TLS settings for a host. `verify = false` accepts self-signed server
/// certificates, which is common on closed mission networks.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub verify: bool,
    pub ca_path: Option<String>,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(verify: bool, ca_path: Option<String>) -> Self {
        Self {
            enabled: true,
            verify,
            ca_path,
        }
    }

    /// Scheme prefix for REST traffic.
    pub fn http_scheme(&self) -> &'static str {
        if self.enabled {
            "https"
        } else {
            "http"
        }
    }

    /// Scheme prefix for the WebSocket link.
    pub fn ws_scheme(&self) -> &'static str {
        if self.enabled {
            "wss"
        } else {
            "ws"
        }
    }
}

#[derive(Debug, Default)]
pub struct BearerState {
    pub username: String,
    pub password: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl BearerState {
    fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => Utc::now() > expiry,
            None => false,
        }
    }
}

/// Authentication capability of one host.
pub enum Credentials {
    None,
    Basic {
        username: String,
        password: String,
    },
    /// Username/password or refresh-token grant, exchanged for a bearer
    /// token that is refreshed when it expires.
    Bearer(Mutex<BearerState>),
    /// Client-credentials grant with `become` impersonation.
    ServiceAccount {
        client_id: String,
        client_secret: String,
        become_user: String,
        state: Mutex<BearerState>,
    },
    ApiKey {
        key: String,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl Credentials {
    pub fn bearer(username: &str, password: &str) -> Self {
        Credentials::Bearer(Mutex::new(BearerState {
            username: username.to_string(),
            password: password.to_string(),
            ..BearerState::default()
        }))
    }

    pub fn from_refresh_token(refresh_token: &str) -> Self {
        Credentials::Bearer(Mutex::new(BearerState {
            refresh_token: refresh_token.to_string(),
            ..BearerState::default()
        }))
    }

    pub fn is_expired(&self) -> bool {
        match self {
            Credentials::Bearer(state) => state.lock().is_expired(),
            Credentials::ServiceAccount { state, .. } => state.lock().is_expired(),
            _ => false,
        }
    }

    /// Acquire an initial token where the variant needs one.
    pub async fn login(&self, http: &reqwest::Client, auth_base: &str) -> Result<()> {
        match self {
            Credentials::Bearer(state) => {
                let current_token_valid = {
                    let state = state.lock();
                    !state.access_token.is_empty() && !state.is_expired()
                };
                if current_token_valid {
                    return Ok(());
                }
                self.refresh(http, auth_base).await
            }
            Credentials::ServiceAccount { .. } => self.refresh(http, auth_base).await,
            _ => Ok(()),
        }
    }

    /// Re-acquire the bearer token for the token-bearing variants.
    pub async fn refresh(&self, http: &reqwest::Client, auth_base: &str) -> Result<()> {
        match self {
            Credentials::Bearer(state) => {
                let form = {
                    let state = state.lock();
                    if !state.refresh_token.is_empty() {
                        HashMap::from([
                            ("grant_type".to_string(), "refresh_token".to_string()),
                            ("refresh_token".to_string(), state.refresh_token.clone()),
                        ])
                    } else if !state.username.is_empty() && !state.password.is_empty() {
                        HashMap::from([
                            ("grant_type".to_string(), "password".to_string()),
                            ("username".to_string(), state.username.clone()),
                            ("password".to_string(), state.password.clone()),
                        ])
                    } else {
                        bail!("no credentials available for refresh");
                    }
                };
                let token = request_token(http, auth_base, &form, None).await?;
                let mut state = state.lock();
                state.access_token = token.access_token;
                if !token.refresh_token.is_empty() {
                    state.refresh_token = token.refresh_token;
                }
                state.expiry = token.expires_in.map(|s| Utc::now() + Duration::seconds(s));
                debug!("bearer token refreshed");
                Ok(())
            }
            Credentials::ServiceAccount {
                client_id,
                client_secret,
                become_user,
                state,
            } => {
                let form = HashMap::from([
                    ("grant_type".to_string(), "client_credentials".to_string()),
                    ("become".to_string(), become_user.clone()),
                ]);
                let basic = base64::engine::general_purpose::STANDARD
                    .encode(format!("{client_id}:{client_secret}"));
                let token =
                    request_token(http, auth_base, &form, Some(format!("Basic {basic}"))).await?;
                let mut state = state.lock();
                state.access_token = token.access_token;
                state.expiry = token.expires_in.map(|s| Utc::now() + Duration::seconds(s));
                debug!(account = %client_id, "service account token refreshed");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Attach the authentication headers of this capability to a request.
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::Bearer(state) => {
                let token = state.lock().access_token.clone();
                if token.is_empty() {
                    request
                } else {
                    request.bearer_auth(token)
                }
            }
            Credentials::ServiceAccount { state, .. } => {
                let token = state.lock().access_token.clone();
                if token.is_empty() {
                    request
                } else {
                    request.bearer_auth(token)
                }
            }
            Credentials::ApiKey { key } => request.header("x-api-key", key),
        }
    }
}

async fn request_token(
    http: &reqwest::Client,
    auth_base: &str,
    form: &HashMap<String, String>,
    authorization: Option<String>,
) -> Result<TokenResponse> {
    let mut request = http.post(format!("{auth_base}/token")).form(form);
    if let Some(value) = authorization {
        request = request.header("Authorization", value);
    }
    let response = request
        .send()
        .await
        .context("token request failed")?
        .error_for_status()
        .context("token grant rejected")?;
    response.json().await.context("malformed token response")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_headers(credentials: &Credentials) -> reqwest::header::HeaderMap {
        let client = reqwest::Client::new();
        let request = credentials
            .authorize(client.get("http://localhost/api"))
            .build()
            .expect("build");
        request.headers().clone()
    }

    #[test]
    fn no_credentials_add_no_headers() {
        let headers = built_headers(&Credentials::None);
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn basic_auth_sets_authorization_header() {
        let headers = built_headers(&Credentials::Basic {
            username: "ops".to_string(),
            password: "secret".to_string(),
        });
        let value = headers.get("authorization").expect("header");
        let expected =
            base64::engine::general_purpose::STANDARD.encode("ops:secret");
        assert_eq!(value.to_str().expect("ascii"), format!("Basic {expected}"));
    }

    #[test]
    fn api_key_sets_custom_header() {
        let headers = built_headers(&Credentials::ApiKey {
            key: "k-123".to_string(),
        });
        assert_eq!(headers.get("x-api-key").expect("header"), "k-123");
    }

    #[test]
    fn bearer_without_token_adds_nothing_until_refreshed() {
        let credentials = Credentials::bearer("ops", "secret");
        assert!(built_headers(&credentials).get("authorization").is_none());
        if let Credentials::Bearer(state) = &credentials {
            state.lock().access_token = "tok".to_string();
        }
        let headers = built_headers(&credentials);
        assert_eq!(headers.get("authorization").expect("header"), "Bearer tok");
    }

    #[test]
    fn expiry_is_respected() {
        let credentials = Credentials::bearer("ops", "secret");
        assert!(!credentials.is_expired());
        if let Credentials::Bearer(state) = &credentials {
            state.lock().expiry = Some(Utc::now() - Duration::seconds(5));
        }
        assert!(credentials.is_expired());
    }

    #[test]
    fn tls_schemes() {
        assert_eq!(TlsConfig::disabled().http_scheme(), "http");
        assert_eq!(TlsConfig::disabled().ws_scheme(), "ws");
        let tls = TlsConfig::enabled(true, None);
        assert_eq!(tls.http_scheme(), "https");
        assert_eq!(tls.ws_scheme(), "wss");
    }
}
