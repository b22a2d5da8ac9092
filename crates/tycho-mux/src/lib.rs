//! Connection multiplexing for mission-control consumers.
//!
//! # Purpose
//! Many consumers (dashboards, panels, scripted queries) want telemetry from
//! the same handful of hosts. This crate pools one client per host, layers
//! named endpoints (instance + processor scopes) on top, and shares one
//! server-side subscription per scope while each consumer keeps a private
//! stream buffer. Buffers that grow past a threshold can be collapsed into
//! aggregated points.
//!
//! # Design notes
//! Everything is driven by a declarative [`config::MuxConfig`] document with
//! collect-all validation; passwords live in a separate [`config::SecureStore`].
//! [`health::check`] probes a configuration with a throwaway pool.

pub mod aggregate;
pub mod config;
pub mod endpoint;
pub mod health;
pub mod manager;
pub mod multiplexer;


pub use aggregate::{
    discrete_summary, hash_to_rgb, numeric_summary, should_aggregate, AggregatedPoint,
    DiscretePoint, STREAM_AVERAGE_THRESHOLD,
};
pub use config::{ConfigErrors, EndpointConfig, HostConfig, MuxConfig, SecureStore};
pub use endpoint::{DemandSummary, Endpoint, Threshold};
pub use health::{check as health_check, HealthReport, Status};
pub use manager::ConnectionManager;
pub use multiplexer::Multiplexer;
