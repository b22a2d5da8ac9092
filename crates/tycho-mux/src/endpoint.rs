//! One scope on a host, with per-consumer stream buffers.
//!
//! # Purpose
//! An endpoint multiplexes many consumers onto one parameter subscription per
//! (instance, processor). Each consumer stream owns a buffer; delivered
//! values fan into every buffer of the demanded parameter, and a demand is
//! withdrawn from the server only when its last stream leaves.
//!
//! # Design notes
//! Subscription listeners fan through the shared endpoint map rather than
//! capturing one endpoint, so endpoints created later on the same scope
//! receive deliveries without re-subscribing. Lock order is always the
//! endpoint map first, then a single endpoint's tables.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use tycho_client::types::{CommandHistoryEntry, Event, ParameterInfo, ParameterValue};
use tycho_client::{Client, ParameterSubscription};

use crate::config::EndpointConfig;

pub(crate) type EndpointMap = Arc<Mutex<HashMap<String, Arc<Endpoint>>>>;

/// Alarm range lifted from the mission database.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub level: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn thresholds_from_info(info: &ParameterInfo) -> Vec<Threshold> {
    info.r#type
        .as_ref()
        .and_then(|parameter_type| parameter_type.default_alarm.as_ref())
        .map(|alarm| {
            alarm
                .static_alarm_ranges
                .iter()
                .map(|range| Threshold {
                    level: range.level.clone().unwrap_or_default(),
                    min: range.min_inclusive,
                    max: range.max_inclusive,
                })
                .collect()
        })
        .unwrap_or_default()
}

struct ParameterDemand {
    unit: Option<String>,
    thresholds: Vec<Threshold>,
    last_received: Option<DateTime<Utc>>,
    /// Consumer stream id to its pending values.
    streams: HashMap<String, Vec<ParameterValue>>,
}

/// Snapshot of one demanded parameter, for overviews.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandSummary {
    pub parameter: String,
    pub unit: Option<String>,
    pub last_received: Option<DateTime<Utc>>,
    pub streams: usize,
}

pub struct Endpoint {
    pub id: String,
    pub host: String,
    pub instance: String,
    pub processor: String,
    pub description: String,
    client: Arc<Client>,
    peers: EndpointMap,
    parameters: Mutex<HashMap<String, ParameterDemand>>,
    events: Mutex<HashMap<String, Vec<Event>>>,
    commands: Mutex<HashMap<String, Vec<CommandHistoryEntry>>>,
}

impl Endpoint {
    pub(crate) fn new(
        id: &str,
        config: &EndpointConfig,
        client: Arc<Client>,
        peers: EndpointMap,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            host: config.host.clone(),
            instance: config.instance.clone(),
            processor: config.processor.clone(),
            description: config.description.clone(),
            client,
            peers,
            parameters: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            commands: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn is_link_open(&self) -> bool {
        self.client.is_link_open()
    }

    fn instance_matches(&self, other: &Endpoint) -> bool {
        self.host == other.host && self.instance == other.instance
    }

    /// Demand `parameter` for consumer `stream`. The first demand of a
    /// parameter does a one-time mission-database lookup for unit and
    /// thresholds; a lookup failure downgrades to metadata-less streaming.
    pub async fn request_parameter_stream(&self, parameter: &str, stream: &str) -> Result<()> {
        let known = self.parameters.lock().contains_key(parameter);
        if !known {
            let (unit, thresholds) = match self
                .client
                .get_parameter_info(&self.instance, parameter)
                .await
            {
                Ok(info) => (info.unit().map(str::to_string), thresholds_from_info(&info)),
                Err(err) => {
                    warn!(parameter, error = %err, "metadata lookup failed, streaming without it");
                    (None, Vec::new())
                }
            };
            self.parameters
                .lock()
                .entry(parameter.to_string())
                .or_insert_with(|| ParameterDemand {
                    unit,
                    thresholds,
                    last_received: None,
                    streams: HashMap::new(),
                });
        }
        let stream_is_new = {
            let mut parameters = self.parameters.lock();
            match parameters.get_mut(parameter) {
                Some(demand) => {
                    let vacant = !demand.streams.contains_key(stream);
                    demand.streams.entry(stream.to_string()).or_default();
                    vacant
                }
                None => false,
            }
        };

        let subscription = match self.ensure_parameter_subscription().await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.rollback_parameter_stream(parameter, stream, stream_is_new);
                return Err(err);
            }
        };
        if !subscription.has(parameter) {
            if let Err(err) = subscription.add(&[parameter.to_string()]).await {
                self.rollback_parameter_stream(parameter, stream, stream_is_new);
                return Err(err);
            }
        }
        Ok(())
    }

    // A failed request leaves no trace: only memberships the server accepted
    // or already had stay in the demand tables.
    fn rollback_parameter_stream(&self, parameter: &str, stream: &str, stream_was_new: bool) {
        let mut parameters = self.parameters.lock();
        if let Some(demand) = parameters.get_mut(parameter) {
            if stream_was_new {
                demand.streams.remove(stream);
            }
            if demand.streams.is_empty() {
                parameters.remove(parameter);
            }
        }
    }

    /// Drop consumer `stream` from `parameter`. The server-side membership
    /// shrinks only when the last stream leaves and the link is still open.
    pub async fn withdraw_parameter_stream(&self, parameter: &str, stream: &str) -> Result<()> {
        let last_stream_gone = {
            let mut parameters = self.parameters.lock();
            let Some(demand) = parameters.get_mut(parameter) else {
                return Ok(());
            };
            demand.streams.remove(stream);
            if demand.streams.is_empty() {
                parameters.remove(parameter);
                true
            } else {
                false
            }
        };
        if last_stream_gone && self.client.is_link_open() {
            if let Some(subscription) = self
                .client
                .find_parameter_subscription(&self.instance, &self.processor)
            {
                subscription.remove(&[parameter.to_string()]).await?;
            }
        }
        Ok(())
    }

    /// Pending values for one stream, demanding the parameter first when
    /// this consumer has not requested it yet.
    pub async fn stream_values(
        &self,
        parameter: &str,
        stream: &str,
    ) -> Result<Vec<ParameterValue>> {
        let requested = self
            .parameters
            .lock()
            .get(parameter)
            .map(|demand| demand.streams.contains_key(stream))
            .unwrap_or(false);
        if !requested {
            self.request_parameter_stream(parameter, stream).await?;
        }
        Ok(self.drain_parameter_stream(parameter, stream))
    }

    /// Take and clear the pending values of one stream.
    pub fn drain_parameter_stream(&self, parameter: &str, stream: &str) -> Vec<ParameterValue> {
        self.parameters
            .lock()
            .get_mut(parameter)
            .and_then(|demand| demand.streams.get_mut(stream))
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn parameter_unit(&self, parameter: &str) -> Option<String> {
        self.parameters
            .lock()
            .get(parameter)
            .and_then(|demand| demand.unit.clone())
    }

    pub fn parameter_thresholds(&self, parameter: &str) -> Vec<Threshold> {
        self.parameters
            .lock()
            .get(parameter)
            .map(|demand| demand.thresholds.clone())
            .unwrap_or_default()
    }

    pub fn last_received(&self, parameter: &str) -> Option<DateTime<Utc>> {
        self.parameters
            .lock()
            .get(parameter)
            .and_then(|demand| demand.last_received)
    }

    pub fn demand_summaries(&self) -> Vec<DemandSummary> {
        self.parameters
            .lock()
            .iter()
            .map(|(parameter, demand)| DemandSummary {
                parameter: parameter.clone(),
                unit: demand.unit.clone(),
                last_received: demand.last_received,
                streams: demand.streams.len(),
            })
            .collect()
    }

    async fn ensure_parameter_subscription(&self) -> Result<Arc<ParameterSubscription>> {
        if let Some(subscription) = self
            .client
            .find_parameter_subscription(&self.instance, &self.processor)
        {
            return Ok(subscription);
        }
        let subscription = self
            .client
            .create_parameter_subscription(&self.instance, &self.processor, &[])
            .await?;
        let peers = Arc::clone(&self.peers);
        let host = self.host.clone();
        let instance = self.instance.clone();
        let processor = self.processor.clone();
        subscription.set_listener(move |name, value| {
            let targets: Vec<Arc<Endpoint>> = peers
                .lock()
                .values()
                .filter(|endpoint| {
                    endpoint.host == host
                        && endpoint.instance == instance
                        && endpoint.processor == processor
                })
                .cloned()
                .collect();
            for endpoint in targets {
                endpoint.ingest_parameter(name, value);
            }
        });
        Ok(subscription)
    }

    /// Record a delivered value: stamp the demand and buffer it for every
    /// stream, keeping only sound acquisitions.
    fn ingest_parameter(&self, parameter: &str, value: &ParameterValue) {
        let mut parameters = self.parameters.lock();
        let Some(demand) = parameters.get_mut(parameter) else {
            debug!(endpoint = %self.id, parameter, "value without demand, dropped");
            return;
        };
        demand.last_received = value.generation_time.or_else(|| Some(Utc::now()));
        if !value.is_acquired() {
            return;
        }
        for buffer in demand.streams.values_mut() {
            buffer.push(value.clone());
        }
    }

    pub async fn request_event_stream(&self, stream: &str) -> Result<()> {
        let stream_is_new = {
            let mut events = self.events.lock();
            let vacant = !events.contains_key(stream);
            events.entry(stream.to_string()).or_default();
            vacant
        };
        if self.client.find_event_subscription(&self.instance).is_none() {
            let subscription = match self.client.create_event_subscription(&self.instance).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    if stream_is_new {
                        self.events.lock().remove(stream);
                    }
                    return Err(err);
                }
            };
            let peers = Arc::clone(&self.peers);
            let host = self.host.clone();
            let instance = self.instance.clone();
            subscription.set_listener(move |event| {
                let targets: Vec<Arc<Endpoint>> = peers
                    .lock()
                    .values()
                    .filter(|endpoint| endpoint.host == host && endpoint.instance == instance)
                    .cloned()
                    .collect();
                for endpoint in targets {
                    endpoint.ingest_event(event);
                }
            });
        }
        Ok(())
    }

    fn ingest_event(&self, event: &Event) {
        for buffer in self.events.lock().values_mut() {
            buffer.push(event.clone());
        }
    }

    pub fn drain_event_stream(&self, stream: &str) -> Vec<Event> {
        self.events
            .lock()
            .get_mut(stream)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn has_event_streams(&self) -> bool {
        !self.events.lock().is_empty()
    }

    /// Drop an event stream; the shared subscription halts once no endpoint
    /// on the instance holds one.
    pub async fn withdraw_event_stream(&self, stream: &str) {
        self.events.lock().remove(stream);
        if self.has_event_streams() || !self.client.is_link_open() {
            return;
        }
        let still_needed = self
            .peers
            .lock()
            .values()
            .any(|endpoint| self.instance_matches(endpoint) && endpoint.has_event_streams());
        if !still_needed {
            if let Some(subscription) = self.client.find_event_subscription(&self.instance) {
                subscription.halt().await;
            }
        }
    }

    pub async fn request_command_stream(&self, stream: &str) -> Result<()> {
        let stream_is_new = {
            let mut commands = self.commands.lock();
            let vacant = !commands.contains_key(stream);
            commands.entry(stream.to_string()).or_default();
            vacant
        };
        if self
            .client
            .find_command_history_subscription(&self.instance)
            .is_none()
        {
            let subscription = match self
                .client
                .create_command_history_subscription(&self.instance, &self.processor)
                .await
            {
                Ok(subscription) => subscription,
                Err(err) => {
                    if stream_is_new {
                        self.commands.lock().remove(stream);
                    }
                    return Err(err);
                }
            };
            let peers = Arc::clone(&self.peers);
            let host = self.host.clone();
            let instance = self.instance.clone();
            subscription.set_listener(move |entry| {
                let targets: Vec<Arc<Endpoint>> = peers
                    .lock()
                    .values()
                    .filter(|endpoint| endpoint.host == host && endpoint.instance == instance)
                    .cloned()
                    .collect();
                for endpoint in targets {
                    endpoint.ingest_command(entry);
                }
            });
        }
        Ok(())
    }

    fn ingest_command(&self, entry: &CommandHistoryEntry) {
        for buffer in self.commands.lock().values_mut() {
            buffer.push(entry.clone());
        }
    }

    pub fn drain_command_stream(&self, stream: &str) -> Vec<CommandHistoryEntry> {
        self.commands
            .lock()
            .get_mut(stream)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn has_command_streams(&self) -> bool {
        !self.commands.lock().is_empty()
    }

    pub async fn withdraw_command_stream(&self, stream: &str) {
        self.commands.lock().remove(stream);
        if self.has_command_streams() || !self.client.is_link_open() {
            return;
        }
        let still_needed = self
            .peers
            .lock()
            .values()
            .any(|endpoint| self.instance_matches(endpoint) && endpoint.has_command_streams());
        if !still_needed {
            if let Some(subscription) = self
                .client
                .find_command_history_subscription(&self.instance)
            {
                subscription.halt().await;
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tycho_client::{Credentials, TlsConfig};
    use tycho_transport::ConnectOptions;
    use tycho_wire::{topics, ClientEnvelope, Encoding, ServerEnvelope};

    // Loopback server that acks every request with incrementing call ids,
    // records what the client sent, and injects pushed frames on demand.
    async fn spawn_scripted_server() -> (
        String,
        mpsc::UnboundedReceiver<ClientEnvelope>,
        mpsc::UnboundedSender<ServerEnvelope>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<ServerEnvelope>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            // Refuse follow-up connections (the REST side of the client) so
            // metadata lookups fail fast instead of hanging.
            tokio::spawn(async move {
                loop {
                    let Ok((extra, _)) = listener.accept().await else { break };
                    drop(extra);
                }
            });
            let mut ws = crate::test_ws::accept(stream).await;
            let mut next_call = 0u64;
            loop {
                tokio::select! {
                    message = ws.next() => {
                        let Some(Ok(message)) = message else { break };
                        match message {
                            Message::Text(_) | Message::Binary(_) => {
                                let envelope = Encoding::Json
                                    .decode_client(message.into_data())
                                    .expect("decode");
                                let call = if envelope.topic == topics::CANCEL {
                                    0
                                } else if envelope.call != 0 {
                                    envelope.call
                                } else {
                                    next_call += 1;
                                    next_call
                                };
                                let ack = ServerEnvelope {
                                    topic: topics::REPLY.to_string(),
                                    call,
                                    seq: 0,
                                    data: json!({"replyTo": envelope.id}),
                                };
                                let bytes = Encoding::Json.encode_server(&ack).expect("encode");
                                let text = String::from_utf8(bytes.to_vec()).expect("utf8");
                                ws.send(Message::text(text)).await.expect("send");
                                let _ = seen_tx.send(envelope);
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                    pushed = push_rx.recv() => {
                        let Some(envelope) = pushed else { break };
                        let bytes = Encoding::Json.encode_server(&envelope).expect("encode");
                        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
                        ws.send(Message::text(text)).await.expect("send");
                    }
                }
            }
        });
        (addr, seen_rx, push_tx)
    }

    async fn connected_client(address: &str) -> Arc<Client> {
        let client = Client::new(
            address,
            &TlsConfig::disabled(),
            Arc::new(Credentials::None),
            Encoding::Json,
            ConnectOptions {
                sync_timeout: Duration::from_secs(2),
                ..ConnectOptions::default()
            },
        )
        .expect("client");
        client.establish_link().await.expect("link");
        Arc::new(client)
    }

    fn endpoint_on(
        id: &str,
        client: &Arc<Client>,
        peers: &EndpointMap,
    ) -> Arc<Endpoint> {
        let config = EndpointConfig {
            name: id.to_string(),
            host: "ops".to_string(),
            instance: "simulator".to_string(),
            processor: "realtime".to_string(),
            ..EndpointConfig::default()
        };
        let endpoint = Endpoint::new(id, &config, Arc::clone(client), Arc::clone(peers));
        peers.lock().insert(id.to_string(), Arc::clone(&endpoint));
        endpoint
    }

    async fn next_request(seen: &mut mpsc::UnboundedReceiver<ClientEnvelope>) -> ClientEnvelope {
        tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .expect("request")
            .expect("open")
    }

    async fn assert_quiet(seen: &mut mpsc::UnboundedReceiver<ClientEnvelope>) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(seen.try_recv().is_err(), "no further traffic expected");
    }

    const PARAMETER: &str = "/YSS/SIMULATOR/BatteryVoltage1";

    #[tokio::test]
    async fn streams_share_one_subscription_and_membership_follows_the_last() {
        let (address, mut seen, _push) = spawn_scripted_server().await;
        let client = connected_client(&address).await;
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = endpoint_on("sim-rt", &client, &peers);

        endpoint
            .request_parameter_stream(PARAMETER, "panel-a")
            .await
            .expect("request");
        let subscribe = next_request(&mut seen).await;
        assert_eq!(subscribe.topic, topics::PARAMETERS);
        let add = next_request(&mut seen).await;
        assert_eq!(add.options["action"], "ADD");
        assert_eq!(add.options["id"][0]["name"], PARAMETER);

        // A second consumer of the same parameter stays local.
        endpoint
            .request_parameter_stream(PARAMETER, "panel-b")
            .await
            .expect("request");
        assert_quiet(&mut seen).await;
        assert_eq!(endpoint.demand_summaries()[0].streams, 2);

        endpoint
            .withdraw_parameter_stream(PARAMETER, "panel-a")
            .await
            .expect("withdraw");
        assert_quiet(&mut seen).await;

        endpoint
            .withdraw_parameter_stream(PARAMETER, "panel-b")
            .await
            .expect("withdraw");
        let remove = next_request(&mut seen).await;
        assert_eq!(remove.options["action"], "REMOVE");
        assert_eq!(remove.options["id"][0]["name"], PARAMETER);
        assert!(endpoint.demand_summaries().is_empty());
    }

    #[tokio::test]
    async fn failed_requests_leave_no_demand_behind() {
        // Nothing listens on this address; every request must fail.
        let client = Arc::new(
            Client::new(
                "127.0.0.1:1",
                &TlsConfig::disabled(),
                Arc::new(Credentials::None),
                Encoding::Json,
                ConnectOptions::default(),
            )
            .expect("client"),
        );
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = endpoint_on("sim-rt", &client, &peers);

        endpoint
            .request_parameter_stream(PARAMETER, "panel-a")
            .await
            .expect_err("dead link must fail");
        assert!(endpoint.demand_summaries().is_empty());

        endpoint
            .request_event_stream("log-a")
            .await
            .expect_err("dead link must fail");
        assert!(endpoint.events.lock().is_empty());

        endpoint
            .request_command_stream("cmd-a")
            .await
            .expect_err("dead link must fail");
        assert!(endpoint.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_expansion_keeps_prior_demand() {
        let (address, mut seen, _push) = spawn_scripted_server().await;
        let client = connected_client(&address).await;
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = endpoint_on("sim-rt", &client, &peers);

        endpoint
            .request_parameter_stream(PARAMETER, "panel-a")
            .await
            .expect("request");
        let _subscribe = next_request(&mut seen).await;
        let _add = next_request(&mut seen).await;

        client.close_link().await.expect("close");
        endpoint
            .request_parameter_stream("/YSS/SIMULATOR/Altitude", "panel-b")
            .await
            .expect_err("closed link must fail");

        // The accepted demand survives, the failed one leaves nothing.
        let summaries = endpoint.demand_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].parameter, PARAMETER);
        assert_eq!(summaries[0].streams, 1);
    }

    #[tokio::test]
    async fn only_sound_acquisitions_reach_the_buffers() {
        let (address, mut seen, push) = spawn_scripted_server().await;
        let client = connected_client(&address).await;
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = endpoint_on("sim-rt", &client, &peers);

        endpoint
            .request_parameter_stream(PARAMETER, "panel-a")
            .await
            .expect("request");
        let _subscribe = next_request(&mut seen).await;
        let _add = next_request(&mut seen).await;

        // The scripted server assigned call 1 to the subscribe.
        push.send(ServerEnvelope {
            topic: topics::PARAMETERS.to_string(),
            call: 1,
            seq: 1,
            data: json!({
                "mapping": {"1": {"name": PARAMETER}},
                "values": [
                    {"numericId": 1, "engValue": {"type": "FLOAT", "value": 12.5},
                     "acquisitionStatus": "ACQUIRED",
                     "generationTime": "2024-05-01T10:00:00Z"},
                    {"numericId": 1, "engValue": {"type": "FLOAT", "value": 0.0},
                     "acquisitionStatus": "EXPIRED",
                     "generationTime": "2024-05-01T10:00:05Z"}
                ]
            }),
        })
        .expect("push");

        tokio::time::timeout(Duration::from_secs(2), async {
            while endpoint.last_received(PARAMETER).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delivery");
        // The expired value stamps the demand but is not buffered.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let buffered = endpoint
            .stream_values(PARAMETER, "panel-a")
            .await
            .expect("values");
        assert_eq!(buffered.len(), 1);
        assert!(buffered[0].is_acquired());
        let stamped = endpoint.last_received(PARAMETER).expect("stamp");
        assert_eq!(stamped.to_rfc3339(), "2024-05-01T10:00:05+00:00");
        // Draining clears the buffer.
        assert!(endpoint.drain_parameter_stream(PARAMETER, "panel-a").is_empty());
    }

    #[tokio::test]
    async fn events_fan_to_every_endpoint_on_the_instance() {
        let (address, mut seen, push) = spawn_scripted_server().await;
        let client = connected_client(&address).await;
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let first = endpoint_on("sim-rt", &client, &peers);
        let second = endpoint_on("sim-rt-2", &client, &peers);

        first.request_event_stream("log-a").await.expect("request");
        let subscribe = next_request(&mut seen).await;
        assert_eq!(subscribe.topic, topics::EVENTS);
        // The second endpoint reuses the instance subscription.
        second.request_event_stream("log-b").await.expect("request");
        assert_quiet(&mut seen).await;

        push.send(ServerEnvelope {
            topic: topics::EVENTS.to_string(),
            call: 1,
            seq: 1,
            data: json!({"message": "TM link recovered", "severity": "INFO"}),
        })
        .expect("push");

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !first.events.lock().get("log-a").map(Vec::is_empty).unwrap_or(true) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("delivery");

        assert_eq!(first.drain_event_stream("log-a").len(), 1);
        assert_eq!(second.drain_event_stream("log-b").len(), 1);
    }

    #[tokio::test]
    async fn withdrawing_the_last_event_stream_halts_the_subscription() {
        let (address, mut seen, _push) = spawn_scripted_server().await;
        let client = connected_client(&address).await;
        let peers: EndpointMap = Arc::new(Mutex::new(HashMap::new()));
        let endpoint = endpoint_on("sim-rt", &client, &peers);

        endpoint.request_event_stream("log-a").await.expect("request");
        let _subscribe = next_request(&mut seen).await;

        endpoint.withdraw_event_stream("log-a").await;
        let cancel = next_request(&mut seen).await;
        assert_eq!(cancel.topic, topics::CANCEL);
        assert!(client.find_event_subscription("simulator").is_none());
    }

    #[tokio::test]
    async fn threshold_conversion_reads_static_ranges() {
        let info: ParameterInfo = serde_json::from_value(json!({
            "qualifiedName": PARAMETER,
            "type": {
                "unitSet": [{"unit": "V"}],
                "defaultAlarm": {
                    "staticAlarmRanges": [
                        {"level": "WARNING", "minInclusive": 11.0},
                        {"level": "CRITICAL", "minInclusive": 10.0, "maxInclusive": 15.0}
                    ]
                }
            }
        }))
        .expect("decode");

        let thresholds = thresholds_from_info(&info);
        assert_eq!(thresholds.len(), 2);
        assert_eq!(thresholds[0].level, "WARNING");
        assert_eq!(thresholds[0].min, Some(11.0));
        assert_eq!(thresholds[0].max, None);
        assert_eq!(thresholds[1].max, Some(15.0));
    }
}
