//! Endpoint registry on top of the client pool.
//!
//! # Design notes
//! `get_endpoint` is serialized by one async lock so concurrent consumers
//! never build two endpoints for the same id. Endpoints whose client lost
//! its link are rebuilt in place, which transparently reconnects the host.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{MuxConfig, SecureStore};
use crate::endpoint::{Endpoint, EndpointMap};
use crate::manager::ConnectionManager;

pub struct Multiplexer {
    manager: ConnectionManager,
    setup: tokio::sync::Mutex<()>,
    endpoints: EndpointMap,
}

impl Multiplexer {
    pub fn new(config: MuxConfig, secure: SecureStore) -> Result<Self> {
        Ok(Self {
            manager: ConnectionManager::new(config, secure)?,
            setup: tokio::sync::Mutex::new(()),
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &MuxConfig {
        self.manager.config()
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.manager.config().endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Endpoint for `id`, building it and its host link on first use.
    pub async fn get_endpoint(&self, id: &str) -> Result<Arc<Endpoint>> {
        let _setup = self.setup.lock().await;

        if let Some(endpoint) = self.endpoints.lock().get(id).cloned() {
            if endpoint.is_link_open() {
                return Ok(endpoint);
            }
            debug!(endpoint = id, "endpoint lost its link, rebuilding");
            self.endpoints.lock().remove(id);
        }

        let Some(config) = self.manager.config().endpoints.get(id).cloned() else {
            bail!("unknown endpoint {id:?}");
        };
        let client = self.manager.get_client(&config.host).await?;
        let endpoint = Endpoint::new(id, &config, client, Arc::clone(&self.endpoints));
        self.endpoints
            .lock()
            .insert(id.to_string(), Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Drop every endpoint and close every host link.
    pub async fn dispose(&self) {
        let _setup = self.setup.lock().await;
        self.endpoints.lock().clear();
        self.manager.dispose().await;
    }
}
