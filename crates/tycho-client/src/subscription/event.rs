//! Event subscription, scoped to one instance.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};
use tycho_transport::Connection;
use tycho_wire::{topics, ClientEnvelope, ServerEnvelope};

use super::{cancel_call, Registry};
use crate::types::Event;

pub type EventListener = Box<dyn Fn(&Event) + Send + Sync>;

pub struct EventSubscription {
    call: u64,
    pub instance: String,
    connection: Arc<Connection>,
    registry: Registry<EventSubscription>,
    listener: Mutex<Option<EventListener>>,
}

impl EventSubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<EventSubscription>,
        instance: &str,
    ) -> Result<Arc<Self>> {
        let envelope =
            ClientEnvelope::request(topics::EVENTS, json!({"instance": instance}));
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("event subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            connection,
            registry: Arc::clone(&registry),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, "event subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(registry: &Registry<EventSubscription>, envelope: &ServerEnvelope) {
        if envelope.topic != topics::EVENTS {
            return;
        }
        let event: Event = match serde_json::from_value(envelope.data.clone()) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "undecodable event payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "event frame without subscription, dropped");
            return;
        };
        let listener = subscription.listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener(&event);
        } else {
            debug!(call = envelope.call, "event frame without listener, dropped");
        }
    }
}
