//! Backhaul Agent - on-premise side of the file tunnel
//!
//! The agent dials out to the coordinator (so it works behind NAT and
//! firewalls), registers under its client id, and then waits. When a
//! `download_request` arrives it streams the named file back over the same
//! tunnel as base64 chunks.
//!
//! # Example Usage
//!
//! ```no_run
//! use backhaul_agent::{Agent, AgentConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         client_id: "site-1".to_string(),
//!         server_url: "wss://coordinator.example.com:8080".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let agent = Agent::new(config)?;
//!     agent.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! 1. **Connect**: WebSocket to the coordinator, optionally TLS with a client certificate
//! 2. **Register**: Send `register` and wait for `registered`
//! 3. **Serve**: Answer each `download_request` with metadata and paced chunks
//! 4. **Reconnect**: On tunnel loss, back off exponentially; give up after the attempt ceiling

mod agent;
mod allowlist;
mod emitter;
mod reconnect;

// Re-export public API
pub use agent::{Agent, AgentConfig, AgentError};
pub use allowlist::PathAllowlist;
pub use emitter::{EmitError, EmitterConfig, FileEmitter, DEFAULT_CHUNK_PACING};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
