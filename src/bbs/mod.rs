//! # BBS Core Module
//!
//! A multi-user group bulletin board served over TCP. Clients connect, identify
//! themselves with a handshake frame, then issue text commands to join groups, post
//! messages and read them back. Connected members are pushed notices when something
//! changes in a group they belong to.
//!
//! ## Components
//!
//! - [`server`] - listener, per-connection tasks and graceful shutdown
//! - [`session`] - handshake and the per-connection command loop
//! - [`commands`] - command table, parsing and execution
//! - [`state`] - group registry, board store and the connected-sessions table
//! - [`errors`] - per-command errors rendered as reply frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  BbsServer      │ ← accept loop, shutdown, snapshots
//! └─────────────────┘
//!          │ one task per connection
//! ┌─────────────────┐
//! │  Session        │ ← frame reader + outbox writer task
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Command        │ ← parse, validate arity, execute
//! │  Processing     │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  SharedState    │ ← one RwLock over registry, boards, sessions
//! └─────────────────┘
//! ```

pub mod commands;
pub mod errors;
pub mod server;
pub mod session;
pub mod state;

pub use errors::BbsError;
pub use server::BbsServer;
pub use state::SharedState;
