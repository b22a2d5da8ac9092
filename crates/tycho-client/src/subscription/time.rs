//! Mission-time subscription.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};
use tycho_transport::Connection;
use tycho_wire::{topics, ClientEnvelope, ServerEnvelope};

use super::{cancel_call, Registry};
use crate::types::TimeData;

pub type TimeListener = Box<dyn Fn(DateTime<Utc>) + Send + Sync>;

pub struct TimeSubscription {
    call: u64,
    pub instance: String,
    pub processor: String,
    connection: Arc<Connection>,
    registry: Registry<TimeSubscription>,
    listener: Mutex<Option<TimeListener>>,
}

impl TimeSubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<TimeSubscription>,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<Self>> {
        let envelope = ClientEnvelope::request(
            topics::TIME,
            json!({"instance": instance, "processor": processor}),
        );
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("time subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            processor: processor.to_string(),
            connection,
            registry: Arc::clone(&registry),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, processor, "time subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(DateTime<Utc>) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(registry: &Registry<TimeSubscription>, envelope: &ServerEnvelope) {
        if envelope.topic != topics::TIME {
            return;
        }
        let data: TimeData = match serde_json::from_value(envelope.data.clone()) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "undecodable time payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "time frame without subscription, dropped");
            return;
        };
        let listener = subscription.listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener(data.value);
        } else {
            debug!(call = envelope.call, "time frame without listener, dropped");
        }
    }
}
