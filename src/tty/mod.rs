//! SSH terminal bridge.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Credentials and serializable response types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and transient-failure classification
//! - `handler`: russh client handler and host key policy
//! - `auth`: Authentication strategies
//! - `client`: SSH connector, connection handles and live-connection tracking
//! - `shell`: PTY allocation and terminal sessions
//! - `filter`: Line reading, escape stripping and command markers
//! - `envelope`: Transport-agnostic client sessions
//! - `bridge`: Terminal ↔ client relay
//! - `credentials`: Host id → credentials store
//! - `monitor`: Periodic host statistics push
//! - `server`: HTTP routes and WebSocket adapters

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod handler;
pub mod monitor;
pub mod server;
pub mod shell;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::{Bridge, BridgeHandle, BridgeOptions, BridgeReport, BridgeState};
pub use client::{ConnectionHandle, ConnectorConfig, SshConnector};
pub use envelope::{Session, SessionHub};
pub use shell::{TerminalSession, open_shell};
