//! Typed push subscriptions over the duplex link.
//!
//! Every kind follows the same life cycle: a synchronous subscribe envelope
//! yields the server call id, the subscription is stored in its registry
//! under that id, inbound frames on the topic are routed by call id, and
//! `halt` removes the registry entry before sending the cancel so a frame
//! racing the teardown is dropped instead of dispatched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tycho_transport::Connection;
use tycho_wire::ClientEnvelope;

pub mod alarm;
pub mod command;
pub mod event;
pub mod parameter;
pub mod time;

pub use alarm::{AlarmSubscription, GlobalAlarmStatusSubscription};
pub use command::CommandHistorySubscription;
pub use event::EventSubscription;
pub use parameter::ParameterSubscription;
pub use time::TimeSubscription;

/// Call-id keyed registry of live subscriptions of one kind.
pub type Registry<T> = Arc<Mutex<HashMap<u64, Arc<T>>>>;

pub(crate) fn new_registry<T>() -> Registry<T> {
    Arc::new(Mutex::new(HashMap::new()))
}

// Shared halt tail: the cancel is best-effort, the registry removal that
// already happened is what guarantees no further dispatch.
pub(crate) async fn cancel_call(connection: &Connection, call: u64) {
    let envelope = match ClientEnvelope::cancel(call) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(call, error = %err, "cancel envelope failed to encode");
            return;
        }
    };
    if let Err(err) = connection.send_sync(&envelope).await {
        debug!(call, error = %err, "cancel was not acknowledged");
    }
}
