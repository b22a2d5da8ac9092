//! Per-host client for a mission-control server.
//!
//! # Purpose
//! A `Client` owns the duplex WebSocket link and the REST side of one host:
//! typed push subscriptions routed by server call id, credential and TLS
//! capabilities, and paginated access to the archive endpoints.
//!
//! # Design notes
//! Subscription registries are per kind and keyed by call id. They exist per
//! connection in spirit: a fresh link starts with all registries cleared, and
//! the transport's disconnect hook clears them again on teardown, so no
//! subscription object outlives the link that created it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use tycho_transport::{ConnectOptions, Connection};
use tycho_wire::Encoding;

pub mod auth;
pub mod pagination;
pub mod rest;
pub mod subscription;
pub mod types;

pub use auth::{Credentials, TlsConfig};
pub use pagination::PageIterator;
pub use rest::RestManager;
pub use subscription::{
    AlarmSubscription, CommandHistorySubscription, EventSubscription,
    GlobalAlarmStatusSubscription, ParameterSubscription, TimeSubscription,
};

use subscription::{new_registry, Registry};
use types::{AlarmData, CommandHistoryEntry, Event, ParameterInfo, Sample};

struct Registries {
    parameters: Registry<ParameterSubscription>,
    events: Registry<EventSubscription>,
    alarms: Registry<AlarmSubscription>,
    global_alarm_status: Registry<GlobalAlarmStatusSubscription>,
    commands: Registry<CommandHistorySubscription>,
    time: Registry<TimeSubscription>,
}

impl Registries {
    fn new() -> Self {
        Self {
            parameters: new_registry(),
            events: new_registry(),
            alarms: new_registry(),
            global_alarm_status: new_registry(),
            commands: new_registry(),
            time: new_registry(),
        }
    }

    fn clear_all(&self) {
        self.parameters.lock().clear();
        self.events.lock().clear();
        self.alarms.lock().clear();
        self.global_alarm_status.lock().clear();
        self.commands.lock().clear();
        self.time.lock().clear();
    }
}

pub struct Client {
    address: String,
    connection: Arc<Connection>,
    rest: RestManager,
    registries: Arc<Registries>,
}

impl Client {
    /// Build a client for `address` (`host:port`). The link is not opened
    /// until [`Client::establish_link`].
    pub fn new(
        address: &str,
        tls: &TlsConfig,
        credentials: Arc<Credentials>,
        encoding: Encoding,
        options: ConnectOptions,
    ) -> Result<Self> {
        let rest = RestManager::new(address, tls, credentials)
            .with_context(|| format!("failed to build REST manager for {address}"))?;
        let url = format!("{}://{address}/api/websocket", tls.ws_scheme());
        let connection = Arc::new(Connection::new(url, encoding, options));
        let registries = Arc::new(Registries::new());

        // One transport listener per kind, exactly mirroring the topics.
        let r = Arc::clone(&registries);
        connection.add_listener(move |envelope| {
            ParameterSubscription::handle(&r.parameters, envelope)
        });
        let r = Arc::clone(&registries);
        connection.add_listener(move |envelope| EventSubscription::handle(&r.events, envelope));
        let r = Arc::clone(&registries);
        connection.add_listener(move |envelope| AlarmSubscription::handle(&r.alarms, envelope));
        let r = Arc::clone(&registries);
        connection.add_listener(move |envelope| {
            GlobalAlarmStatusSubscription::handle(&r.global_alarm_status, envelope)
        });
        let r = Arc::clone(&registries);
        connection
            .add_listener(move |envelope| CommandHistorySubscription::handle(&r.commands, envelope));
        let r = Arc::clone(&registries);
        connection.add_listener(move |envelope| TimeSubscription::handle(&r.time, envelope));

        let r = Arc::clone(&registries);
        connection.set_disconnect_handler(move || {
            debug!("link lost, clearing subscription registries");
            r.clear_all();
        });

        Ok(Self {
            address: address.to_string(),
            connection,
            rest,
            registries,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn rest(&self) -> &RestManager {
        &self.rest
    }

    /// Acquire an initial token where the credential variant needs one.
    pub async fn login(&self) -> Result<()> {
        self.rest.login().await
    }

    /// Open the WebSocket link. A no-op while it is already open; a fresh
    /// link always starts with empty registries.
    pub async fn establish_link(&self) -> Result<()> {
        if self.is_link_open() {
            return Ok(());
        }
        self.registries.clear_all();
        self.connection
            .connect()
            .await
            .with_context(|| format!("failed to open link to {}", self.address))
    }

    pub async fn close_link(&self) -> Result<()> {
        self.connection.disconnect().await?;
        Ok(())
    }

    pub fn is_link_open(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn create_parameter_subscription(
        &self,
        instance: &str,
        processor: &str,
        initial: &[String],
    ) -> Result<Arc<ParameterSubscription>> {
        ParameterSubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.parameters),
            instance,
            processor,
            initial,
        )
        .await
    }

    pub async fn create_event_subscription(
        &self,
        instance: &str,
    ) -> Result<Arc<EventSubscription>> {
        EventSubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.events),
            instance,
        )
        .await
    }

    pub async fn create_alarm_subscription(
        &self,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<AlarmSubscription>> {
        AlarmSubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.alarms),
            instance,
            processor,
        )
        .await
    }

    pub async fn create_global_alarm_status_subscription(
        &self,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<GlobalAlarmStatusSubscription>> {
        GlobalAlarmStatusSubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.global_alarm_status),
            instance,
            processor,
        )
        .await
    }

    pub async fn create_command_history_subscription(
        &self,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<CommandHistorySubscription>> {
        CommandHistorySubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.commands),
            instance,
            processor,
        )
        .await
    }

    pub async fn create_time_subscription(
        &self,
        instance: &str,
        processor: &str,
    ) -> Result<Arc<TimeSubscription>> {
        TimeSubscription::create(
            Arc::clone(&self.connection),
            Arc::clone(&self.registries.time),
            instance,
            processor,
        )
        .await
    }

    /// Existing parameter subscription for a scope, if one is live.
    pub fn find_parameter_subscription(
        &self,
        instance: &str,
        processor: &str,
    ) -> Option<Arc<ParameterSubscription>> {
        self.registries
            .parameters
            .lock()
            .values()
            .find(|sub| sub.instance == instance && sub.processor == processor)
            .cloned()
    }

    pub fn find_event_subscription(&self, instance: &str) -> Option<Arc<EventSubscription>> {
        self.registries
            .events
            .lock()
            .values()
            .find(|sub| sub.instance == instance)
            .cloned()
    }

    pub fn find_command_history_subscription(
        &self,
        instance: &str,
    ) -> Option<Arc<CommandHistorySubscription>> {
        self.registries
            .commands
            .lock()
            .values()
            .find(|sub| sub.instance == instance)
            .cloned()
    }

    pub fn has_time_subscription_for(&self, instance: &str, processor: &str) -> bool {
        self.registries
            .time
            .lock()
            .values()
            .any(|sub| sub.instance == instance && sub.processor == processor)
    }

    /// Downsampled archive values for one parameter over a time range.
    pub async fn get_parameter_samples(
        &self,
        instance: &str,
        parameter: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<Sample>> {
        self.rest.set_time_range(start, stop);
        let response: TimeSeries = self
            .rest
            .get_json(
                &format!(
                    "/archive/{instance}/parameters{}/samples",
                    qualified(parameter)
                ),
                &HashMap::new(),
            )
            .await?;
        Ok(response.sample)
    }

    /// Mission-database description of a parameter (units, thresholds).
    pub async fn get_parameter_info(
        &self,
        instance: &str,
        parameter: &str,
    ) -> Result<ParameterInfo> {
        self.rest
            .get_json(
                &format!("/mdb/{instance}/parameters{}", qualified(parameter)),
                &HashMap::new(),
            )
            .await
    }

    /// Paginated archive events of an instance.
    pub fn list_events(&self, instance: &str) -> PageIterator<Vec<Event>> {
        let rest = self.rest.clone();
        let path = format!("/archive/{instance}/events");
        PageIterator::new(Box::new(move |query| {
            let rest = rest.clone();
            let path = path.clone();
            Box::pin(async move {
                let response: ListEventsResponse = rest.get_json(&path, &query).await?;
                Ok((response.events, response.continuation_token))
            })
        }))
    }

    /// Archive events restricted to a time range.
    pub fn list_events_within(
        &self,
        instance: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> PageIterator<Vec<Event>> {
        let mut iterator = self.list_events(instance);
        iterator.set_query(HashMap::from([
            ("start".to_string(), start.to_rfc3339()),
            ("stop".to_string(), stop.to_rfc3339()),
        ]));
        iterator
    }

    /// Paginated alarm history of one alarm name.
    pub fn list_alarms(&self, instance: &str, name: &str) -> PageIterator<Vec<AlarmData>> {
        let rest = self.rest.clone();
        let path = format!("/archive/{instance}/alarms{}", qualified(name));
        PageIterator::new(Box::new(move |query| {
            let rest = rest.clone();
            let path = path.clone();
            Box::pin(async move {
                let response: ListAlarmsResponse = rest.get_json(&path, &query).await?;
                Ok((response.alarms, response.continuation_token))
            })
        }))
    }

    /// Paginated issued-command history of an instance.
    pub fn list_command_history(
        &self,
        instance: &str,
    ) -> PageIterator<Vec<CommandHistoryEntry>> {
        let rest = self.rest.clone();
        let path = format!("/archive/{instance}/commands");
        PageIterator::new(Box::new(move |query| {
            let rest = rest.clone();
            let path = path.clone();
            Box::pin(async move {
                let response: ListCommandsResponse = rest.get_json(&path, &query).await?;
                Ok((response.entry, response.continuation_token))
            })
        }))
    }
}

// Qualified names already carry a leading slash; bare names get one.
fn qualified(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeries {
    #[serde(default)]
    sample: Vec<Sample>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEventsResponse {
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    continuation_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAlarmsResponse {
    #[serde(default)]
    alarms: Vec<AlarmData>,
    #[serde(default)]
    continuation_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListCommandsResponse {
    #[serde(default)]
    entry: Vec<CommandHistoryEntry>,
    #[serde(default)]
    continuation_token: String,
}
