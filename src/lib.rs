pub mod broker;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod plugin;
pub mod protocol;
pub mod relayerset;
pub mod reporting;
pub mod resource;
pub mod services;
pub mod supervisor;
pub mod transport;
