//! Plugin-process side of a managed connection
//!
//! A plugin process exposes exactly one named capability. The host asks for it with the
//! `dispense` control call and receives the broker id the capability is served under.
//!
//! # Modules
//!
//! - `server`: the dispensing control extension and the `serve`/`serve_stdio` entry points

pub mod server;

pub use server::{serve, serve_stdio, PluginServer};
