//! Cross-cutting services the host lends to plugin instances
//!
//! Each collaborator is a local trait plus two adapters: a `*Server` that exposes a local
//! implementation through the broker and a `*Client` that implements the trait over any
//! [`Invoke`](crate::broker::Invoke).

pub mod capregistry;
pub mod errorlog;
pub mod keyvalue;
pub mod pipeline;
pub mod telemetry;

pub use capregistry::{CapabilitiesRegistry, CapabilitiesRegistryClient, CapabilitiesRegistryServer};
pub use errorlog::{ErrorLog, ErrorLogClient, ErrorLogServer};
pub use keyvalue::{KeyValueStore, KeyValueStoreClient, KeyValueStoreServer};
pub use pipeline::{PipelineRunner, PipelineRunnerClient, PipelineRunnerServer};
pub use telemetry::{Telemetry, TelemetryClient, TelemetryServer};
