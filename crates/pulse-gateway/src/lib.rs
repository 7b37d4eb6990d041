//! # pulse-gateway
//!
//! Per-user connection lifecycle management and event delivery.
//!
//! - **[`lifecycle`]**: connection state machine with atomic guarded
//!   transitions and the double-close guard
//! - **[`transport`]**: the write-side seam over a live socket
//! - **[`connection`]**: one connection, single-writer send/close discipline
//! - **[`registry`]**: per-user connection sets with hard quotas
//! - **[`cleanup`]**: tiered emergency reclamation when a user is at quota
//! - **[`emitter`]**: per-user critical-event delivery with retry/backoff
//!   and bounded failure bookkeeping
//! - **[`heartbeat`]**: ping/pong liveness monitoring
//! - **[`gateway`]**: the facade other subsystems call
//!
//! All contention is scoped to one user's registry entry; no lock is held
//! across users.

#![deny(unsafe_code)]

pub mod cleanup;
pub mod connection;
pub mod emitter;
pub mod errors;
pub mod gateway;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
pub mod transport;

pub use cleanup::{CleanupLevel, EmergencyCleanupCoordinator};
pub use connection::Connection;
pub use emitter::EventEmitter;
pub use errors::GatewayError;
pub use gateway::{Gateway, GatewayStats};
pub use lifecycle::ConnectionState;
pub use registry::ConnectionRegistry;
pub use transport::{ChannelTransport, Transport, TransportError};
