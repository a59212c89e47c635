//! OT Collab - real-time collaborative text editing with operational
//! transformation.
//!
//! - [`ot`]: text operations, composition and transformation
//! - [`sync`]: revision logs, the collaboration server, the client state
//!   machine and the wire protocol
//! - [`storage`]: Sled persistence for channel snapshots
//! - [`web`]: axum HTTP and WebSocket endpoints
//! - [`config`]: environment-driven configuration

pub mod config;
pub mod ot;
pub mod storage;
pub mod sync;
pub mod web;
