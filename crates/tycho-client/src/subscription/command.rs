//! Command-history subscription.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};
use tycho_transport::Connection;
use tycho_wire::{topics, ClientEnvelope, ServerEnvelope};

use super::{cancel_call, Registry};
use crate::types::CommandHistoryEntry;

pub type CommandHistoryListener = Box<dyn Fn(&CommandHistoryEntry) + Send + Sync>;

pub struct CommandHistorySubscription {
    call: u64,
    pub instance: String,
    pub processor: String,
    connection: Arc<Connection>,
    registry: Registry<CommandHistorySubscription>,
    listener: Mutex<Option<CommandHistoryListener>>,
}

impl CommandHistorySubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<CommandHistorySubscription>,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<Self>> {
        let envelope = ClientEnvelope::request(
            topics::COMMANDS,
            json!({"instance": instance, "processor": processor}),
        );
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("command history subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            processor: processor.to_string(),
            connection,
            registry: Arc::clone(&registry),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, "command history subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&CommandHistoryEntry) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(
        registry: &Registry<CommandHistorySubscription>,
        envelope: &ServerEnvelope,
    ) {
        if envelope.topic != topics::COMMANDS {
            return;
        }
        let entry: CommandHistoryEntry = match serde_json::from_value(envelope.data.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "undecodable command history payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "command frame without subscription, dropped");
            return;
        };
        let listener = subscription.listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener(&entry);
        } else {
            debug!(call = envelope.call, "command frame without listener, dropped");
        }
    }
}
