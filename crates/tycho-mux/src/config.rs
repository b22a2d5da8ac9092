//! Declarative host and endpoint configuration.
//!
//! # Purpose
//! The multiplexer is driven by a configuration document naming the reachable
//! hosts and the endpoints (scopes) layered on top of them. Validation is
//! collect-all: a broken document reports every problem at once instead of
//! failing on the first.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

/// One reachable server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default)]
    pub name: String,
    /// `host:port` of the server.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// Skip certificate verification. Only meaningful with `tls`.
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default)]
    pub ca_path: Option<String>,
    /// Authenticate with basic credentials. The password lives in the
    /// secure store, keyed by host id.
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub username: String,
    /// Negotiate the binary wire encoding instead of JSON.
    #[serde(default)]
    pub binary: bool,
}

/// One named scope on a host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Key into [`MuxConfig::hosts`].
    pub host: String,
    pub instance: String,
    #[serde(default = "default_processor")]
    pub processor: String,
}

fn default_processor() -> String {
    "realtime".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxConfig {
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
}

/// Secrets kept out of the plain configuration document. Host passwords are
/// stored under the key `{host id}-password`.
#[derive(Debug, Clone, Default)]
pub struct SecureStore {
    entries: HashMap<String, String>,
}

impl SecureStore {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn set_password(&mut self, host_id: &str, password: &str) {
        self.entries
            .insert(format!("{host_id}-password"), password.to_string());
    }

    pub fn password_for(&self, host_id: &str) -> Option<&str> {
        self.entries
            .get(&format!("{host_id}-password"))
            .map(String::as_str)
    }
}

/// Every validation problem found in one pass.
#[derive(Debug)]
pub struct ConfigErrors(pub Vec<String>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0.join("; "))
    }
}

impl std::error::Error for ConfigErrors {}

impl MuxConfig {
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }

    /// Check the whole document, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut problems = Vec::new();

        if self.hosts.is_empty() {
            problems.push("no hosts configured".to_string());
        }
        if self.endpoints.is_empty() {
            problems.push("no endpoints configured".to_string());
        }

        for (id, host) in &self.hosts {
            if !is_host_port(&host.address) {
                problems.push(format!(
                    "host {id}: address {:?} is not host:port",
                    host.address
                ));
            }
            if host.auth && host.username.is_empty() {
                problems.push(format!("host {id}: auth enabled but no username"));
            }
        }

        for (id, endpoint) in &self.endpoints {
            if !self.hosts.contains_key(&endpoint.host) {
                problems.push(format!(
                    "endpoint {id}: references unknown host {:?}",
                    endpoint.host
                ));
            }
            if endpoint.instance.is_empty() {
                problems.push(format!("endpoint {id}: no instance"));
            }
            if endpoint.processor.is_empty() {
                problems.push(format!("endpoint {id}: no processor"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors(problems))
        }
    }
}

fn is_host_port(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    !host.is_empty() && port.parse::<u16>().is_ok()
}
