//! Configuration health probe.
//!
//! Builds a throwaway client pool from the configuration, dials every host
//! once, and reports per-host and per-endpoint status without touching any
//! long-lived state.

use std::collections::HashMap;

use crate::config::{EndpointConfig, MuxConfig, SecureStore};
use crate::manager::ConnectionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed(String),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub hosts: HashMap<String, Status>,
    pub endpoints: HashMap<String, Status>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.hosts.values().all(Status::is_ok) && self.endpoints.values().all(Status::is_ok)
    }
}

/// Probe every configured host and endpoint once.
pub async fn check(config: &MuxConfig, secure: &SecureStore) -> HealthReport {
    let mut report = HealthReport::default();

    let manager = match ConnectionManager::new(config.clone(), secure.clone()) {
        Ok(manager) => manager,
        Err(err) => {
            // A document that fails validation marks everything down.
            let status = Status::Failed(err.to_string());
            for id in config.hosts.keys() {
                report.hosts.insert(id.clone(), status.clone());
            }
            for id in config.endpoints.keys() {
                report.endpoints.insert(id.clone(), status.clone());
            }
            return report;
        }
    };

    for id in config.hosts.keys() {
        let status = match manager.get_client(id).await {
            Ok(_) => Status::Ok,
            Err(err) => Status::Failed(err.to_string()),
        };
        report.hosts.insert(id.clone(), status);
    }

    for (id, endpoint) in &config.endpoints {
        let status = match report.hosts.get(&endpoint.host) {
            Some(Status::Ok) => probe_endpoint(&manager, endpoint).await,
            Some(Status::Failed(reason)) => {
                Status::Failed(format!("host {} unavailable: {reason}", endpoint.host))
            }
            None => Status::Failed(format!("host {} not configured", endpoint.host)),
        };
        report.endpoints.insert(id.clone(), status);
    }

    manager.dispose().await;
    report
}

// Resolve the endpoint's scope against the server: a short-lived time
// subscription fails with the server's exception when the instance or
// processor does not exist, and is torn down again on success.
async fn probe_endpoint(manager: &ConnectionManager, endpoint: &EndpointConfig) -> Status {
    let client = match manager.get_client(&endpoint.host).await {
        Ok(client) => client,
        Err(err) => return Status::Failed(err.to_string()),
    };
    match client
        .create_time_subscription(&endpoint.instance, &endpoint.processor)
        .await
    {
        Ok(subscription) => {
            subscription.halt().await;
            Status::Ok
        }
        Err(err) => Status::Failed(err.to_string()),
    }
}
