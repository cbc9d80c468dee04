//! # groupbbs - Group Bulletin Board Server
//!
//! A TCP bulletin board where users gather in named groups. Each group has a message
//! board; members post, list members and read posts by ID, and connected members are
//! notified as others join, leave and post.
//!
//! ## Features
//!
//! - **Length-prefixed framing**: every frame is a varint length followed by UTF-8 text.
//! - **Groups on demand**: joining a group that does not exist creates it with its board.
//! - **Push notices**: membership changes and new posts reach connected members in the
//!   order they happened.
//! - **Snapshots**: groups and boards are saved as JSON at shutdown and reloaded at start.
//! - **Async Design**: built on Tokio, one task per connection plus a writer task each.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groupbbs::bbs::BbsServer;
//! use groupbbs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BbsServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bbs`] - server, sessions, commands and shared state
//! - [`net`] - frame codec and async frame reader/writer
//! - [`storage`] - snapshot persistence
//! - [`config`] - configuration loading
//! - [`validation`] - user and group name rules
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - safe log previews of client input

pub mod bbs;
pub mod config;
pub mod logutil;
pub mod metrics;
pub mod net;
pub mod storage;
pub mod validation;
