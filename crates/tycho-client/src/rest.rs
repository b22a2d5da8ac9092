//! REST access to the mission-control HTTP API.
//!
//! The manager keeps a shared query map the way the archive endpoints
//! expect it: time range, sample count and value filters are set once and
//! apply to the requests that follow, until cleared.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::{Credentials, TlsConfig};

struct Inner {
    api_base: String,
    auth_base: String,
    http: reqwest::Client,
    credentials: Arc<Credentials>,
    query: Mutex<HashMap<String, String>>,
}

#[derive(Clone)]
pub struct RestManager {
    inner: Arc<Inner>,
}

impl RestManager {
    pub fn new(address: &str, tls: &TlsConfig, credentials: Arc<Credentials>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if tls.enabled {
            builder = builder.use_rustls_tls();
            if !tls.verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(path) = &tls.ca_path {
                let pem = std::fs::read(path)
                    .with_context(|| format!("failed to read CA certificate {path}"))?;
                let certificate = reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("invalid CA certificate {path}"))?;
                builder = builder.add_root_certificate(certificate);
            }
        }
        let http = builder.build().context("failed to build HTTP client")?;
        let scheme = tls.http_scheme();
        Ok(Self {
            inner: Arc::new(Inner {
                api_base: format!("{scheme}://{address}/api"),
                auth_base: format!("{scheme}://{address}/auth"),
                http,
                credentials,
                query: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.inner.credentials
    }

    /// Acquire the initial token where the credential variant needs one.
    pub async fn login(&self) -> Result<()> {
        self.inner
            .credentials
            .login(&self.inner.http, &self.inner.auth_base)
            .await
    }

    /// Apply a time range to subsequent archive requests.
    pub fn set_time_range(&self, start: DateTime<Utc>, stop: DateTime<Utc>) {
        let mut query = self.inner.query.lock();
        query.insert(
            "start".to_string(),
            start.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        query.insert(
            "stop".to_string(),
            stop.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }

    /// Bucket count requested from the sample endpoint; `None` leaves the
    /// server default in place.
    pub fn set_sample_count(&self, count: Option<u32>) {
        let mut query = self.inner.query.lock();
        match count {
            Some(count) => query.insert("count".to_string(), count.to_string()),
            None => query.remove("count"),
        };
    }

    /// Restrict archive values to rows where another parameter equals the
    /// given value.
    pub fn set_filter(&self, parameter: &str, value: &str) {
        if parameter.is_empty() || value.is_empty() {
            return;
        }
        let mut query = self.inner.query.lock();
        query.insert("filter.parameter".to_string(), parameter.to_string());
        query.insert("filter.operator".to_string(), "EQUALS".to_string());
        query.insert("filter.values".to_string(), value.to_string());
    }

    pub fn clear_filter(&self) {
        let mut query = self.inner.query.lock();
        query.remove("filter.parameter");
        query.remove("filter.operator");
        query.remove("filter.values");
    }

    /// GET an API path and decode its JSON body. `extra` wins over the
    /// shared query map on key collisions.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &HashMap<String, String>,
    ) -> Result<T> {
        let mut query: HashMap<String, String> = self.inner.query.lock().clone();
        for (key, value) in extra {
            query.insert(key.clone(), value.clone());
        }

        if self.inner.credentials.is_expired() {
            self.inner
                .credentials
                .refresh(&self.inner.http, &self.inner.auth_base)
                .await
                .context("credential refresh failed")?;
        }

        let url = format!("{}{path}", self.inner.api_base);
        debug!(%url, "rest request");
        let request = self.inner.http.get(&url).query(&query);
        let response = self
            .inner
            .credentials
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?
            .error_for_status()
            .with_context(|| format!("server rejected {path}"))?;
        response
            .json()
            .await
            .with_context(|| format!("malformed response from {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manager() -> RestManager {
        RestManager::new(
            "localhost:8090",
            &TlsConfig::disabled(),
            Arc::new(Credentials::None),
        )
        .expect("manager")
    }

    #[test]
    fn query_setters_shape_the_shared_map() {
        let rest = manager();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let stop = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        rest.set_time_range(start, stop);
        rest.set_sample_count(Some(500));
        rest.set_filter("/YSS/SIMULATOR/vcid", "1");

        let query = rest.inner.query.lock().clone();
        assert_eq!(query["start"], "2024-05-01T00:00:00.000Z");
        assert_eq!(query["stop"], "2024-05-02T00:00:00.000Z");
        assert_eq!(query["count"], "500");
        assert_eq!(query["filter.operator"], "EQUALS");

        rest.clear_filter();
        rest.set_sample_count(None);
        let query = rest.inner.query.lock().clone();
        assert!(!query.contains_key("filter.parameter"));
        assert!(!query.contains_key("count"));
    }

    #[test]
    fn empty_filter_is_ignored() {
        let rest = manager();
        rest.set_filter("", "1");
        rest.set_filter("/p", "");
        assert!(rest.inner.query.lock().is_empty());
    }
}
