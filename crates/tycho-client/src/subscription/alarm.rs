//! Alarm and global-alarm-status subscriptions.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};
use tycho_transport::Connection;
use tycho_wire::{topics, ClientEnvelope, ServerEnvelope};

use super::{cancel_call, Registry};
use crate::types::{AlarmData, GlobalAlarmStatus};

pub type AlarmListener = Box<dyn Fn(&AlarmData) + Send + Sync>;
pub type GlobalStatusListener = Box<dyn Fn(&GlobalAlarmStatus) + Send + Sync>;

pub struct AlarmSubscription {
    call: u64,
    pub instance: String,
    pub processor: String,
    connection: Arc<Connection>,
    registry: Registry<AlarmSubscription>,
    listener: Mutex<Option<AlarmListener>>,
}

impl AlarmSubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<AlarmSubscription>,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<Self>> {
        let envelope = ClientEnvelope::request(
            topics::ALARMS,
            json!({"instance": instance, "processor": processor}),
        );
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("alarm subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            processor: processor.to_string(),
            connection,
            registry: Arc::clone(&registry),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, "alarm subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&AlarmData) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(registry: &Registry<AlarmSubscription>, envelope: &ServerEnvelope) {
        if envelope.topic != topics::ALARMS {
            return;
        }
        let alarm: AlarmData = match serde_json::from_value(envelope.data.clone()) {
            Ok(alarm) => alarm,
            Err(err) => {
                warn!(error = %err, "undecodable alarm payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "alarm frame without subscription, dropped");
            return;
        };
        let listener = subscription.listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener(&alarm);
        } else {
            debug!(call = envelope.call, "alarm frame without listener, dropped");
        }
    }
}

pub struct GlobalAlarmStatusSubscription {
    call: u64,
    pub instance: String,
    pub processor: String,
    connection: Arc<Connection>,
    registry: Registry<GlobalAlarmStatusSubscription>,
    listener: Mutex<Option<GlobalStatusListener>>,
}

impl GlobalAlarmStatusSubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<GlobalAlarmStatusSubscription>,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<Self>> {
        let envelope = ClientEnvelope::request(
            topics::GLOBAL_ALARM_STATUS,
            json!({"instance": instance, "processor": processor}),
        );
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("global alarm status subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            processor: processor.to_string(),
            connection,
            registry: Arc::clone(&registry),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, "global alarm status subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&GlobalAlarmStatus) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(
        registry: &Registry<GlobalAlarmStatusSubscription>,
        envelope: &ServerEnvelope,
    ) {
        if envelope.topic != topics::GLOBAL_ALARM_STATUS {
            return;
        }
        let status: GlobalAlarmStatus = match serde_json::from_value(envelope.data.clone()) {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "undecodable global alarm status payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "status frame without subscription, dropped");
            return;
        };
        let listener = subscription.listener.lock();
        if let Some(listener) = listener.as_ref() {
            listener(&status);
        } else {
            debug!(call = envelope.call, "status frame without listener, dropped");
        }
    }
}
