//! Parameter subscription with settable membership.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};
use tycho_transport::Connection;
use tycho_wire::{topics, ClientEnvelope, ServerEnvelope};

use super::{cancel_call, Registry};
use crate::types::{ParameterData, ParameterValue};

pub type ParameterListener = Box<dyn Fn(&str, &ParameterValue) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum MembershipAction {
    Add,
    Remove,
    Replace,
}

impl MembershipAction {
    fn wire_name(&self) -> &'static str {
        match self {
            MembershipAction::Add => "ADD",
            MembershipAction::Remove => "REMOVE",
            MembershipAction::Replace => "REPLACE",
        }
    }
}

/// Live subscription to a set of parameters on one (instance, processor).
///
/// Membership updates are fire-and-forget: the local active set changes
/// optimistically when the update envelope is written, and the server's
/// mapping updates reconcile the numeric ids afterwards.
pub struct ParameterSubscription {
    call: u64,
    pub instance: String,
    pub processor: String,
    connection: Arc<Connection>,
    registry: Registry<ParameterSubscription>,
    active: Mutex<HashSet<String>>,
    id_to_name: Mutex<HashMap<u32, String>>,
    listener: Mutex<Option<ParameterListener>>,
}

impl ParameterSubscription {
    pub(crate) async fn create(
        connection: Arc<Connection>,
        registry: Registry<ParameterSubscription>,
        instance: &str,
        processor: &str,
        initial: &[String],
    ) -> Result<Arc<Self>> {
        let options = json!({
            "instance": instance,
            "processor": processor,
            "id": initial.iter().map(|name| json!({"name": name})).collect::<Vec<_>>(),
        });
        let envelope = ClientEnvelope::request(topics::PARAMETERS, options);
        let reply = connection
            .send_sync(&envelope)
            .await
            .context("parameter subscribe failed")?;

        let subscription = Arc::new(Self {
            call: reply.call,
            instance: instance.to_string(),
            processor: processor.to_string(),
            connection,
            registry: Arc::clone(&registry),
            active: Mutex::new(initial.iter().cloned().collect()),
            id_to_name: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        });
        registry.lock().insert(reply.call, Arc::clone(&subscription));
        debug!(call = reply.call, instance, processor, "parameter subscription created");
        Ok(subscription)
    }

    pub fn call(&self) -> u64 {
        self.call
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &ParameterValue) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Box::new(listener));
    }

    pub fn has(&self, parameter: &str) -> bool {
        self.active.lock().contains(parameter)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Subscribe to additional parameters by qualified name.
    pub async fn add(&self, parameters: &[String]) -> Result<()> {
        self.update_membership(MembershipAction::Add, parameters)
            .await?;
        let mut active = self.active.lock();
        for parameter in parameters {
            active.insert(parameter.clone());
        }
        Ok(())
    }

    /// Unsubscribe from parameters by qualified name.
    pub async fn remove(&self, parameters: &[String]) -> Result<()> {
        self.update_membership(MembershipAction::Remove, parameters)
            .await?;
        let mut active = self.active.lock();
        for parameter in parameters {
            active.remove(parameter);
        }
        Ok(())
    }

    /// Replace the whole membership with a new set.
    pub async fn replace(&self, parameters: &[String]) -> Result<()> {
        self.update_membership(MembershipAction::Replace, parameters)
            .await?;
        *self.active.lock() = parameters.iter().cloned().collect();
        Ok(())
    }

    async fn update_membership(
        &self,
        action: MembershipAction,
        parameters: &[String],
    ) -> Result<()> {
        let options = json!({
            "instance": self.instance,
            "processor": self.processor,
            "action": action.wire_name(),
            "id": parameters.iter().map(|name| json!({"name": name})).collect::<Vec<_>>(),
        });
        let envelope = ClientEnvelope::update(topics::PARAMETERS, self.call, options);
        self.connection
            .send_async(&envelope)
            .await
            .context("membership update failed")
    }

    /// Remove this subscription and cancel the server call.
    pub async fn halt(&self) {
        self.registry.lock().remove(&self.call);
        cancel_call(&self.connection, self.call).await;
    }

    pub(crate) fn handle(registry: &Registry<ParameterSubscription>, envelope: &ServerEnvelope) {
        if envelope.topic != topics::PARAMETERS {
            return;
        }
        let data: ParameterData = match serde_json::from_value(envelope.data.clone()) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "undecodable parameter payload, dropped");
                return;
            }
        };
        let Some(subscription) = registry.lock().get(&envelope.call).cloned() else {
            debug!(call = envelope.call, "parameter frame without subscription, dropped");
            return;
        };

        if !data.mapping.is_empty() {
            let mut id_to_name = subscription.id_to_name.lock();
            for (id, named) in &data.mapping {
                match id.parse::<u32>() {
                    Ok(id) => {
                        id_to_name.insert(id, named.name.clone());
                    }
                    Err(_) => warn!(id, "non-numeric mapping key ignored"),
                }
            }
        }
        for invalid in &data.invalid {
            warn!(id = invalid, "server flagged subscription id as invalid");
        }

        let listener = subscription.listener.lock();
        let Some(listener) = listener.as_ref() else {
            debug!(call = envelope.call, "parameter frame without listener, dropped");
            return;
        };
        for value in &data.values {
            let name = subscription.id_to_name.lock().get(&value.numeric_id).cloned();
            match name {
                Some(name) => listener(&name, value),
                None => warn!(id = value.numeric_id, "value for unmapped id, dropped"),
            }
        }
    }
}
