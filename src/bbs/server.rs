//! TCP listener, session supervision and the shutdown sequence.
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};

use super::session::{handle_connection, SessionSettings};
use super::state::SharedState;
use crate::config::Config;
use crate::logutil::escape_log;
use crate::metrics;
use crate::storage::Storage;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion) cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// # Group BBS Server
///
/// Owns the listening socket, the shared board state and the snapshot storage.
///
/// ## Lifecycle
///
/// 1. [`BbsServer::new`] loads the snapshots (missing or corrupt files start empty)
/// 2. [`BbsServer::bind`] opens the listener with the configured backlog
/// 3. [`BbsServer::run`] accepts clients until Ctrl-C, one task per connection
/// 4. Shutdown stops accepting, signals every session, waits up to
///    `drain_timeout_secs` and writes the snapshots
///
/// ```rust,no_run
/// use groupbbs::bbs::BbsServer;
/// use groupbbs::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::load("config.toml").await?;
///     let mut server = BbsServer::new(config).await?;
///     server.run().await
/// }
/// ```
pub struct BbsServer {
    config: Config,
    storage: Storage,
    state: SharedState,
    listener: Option<TcpListener>,
}

impl BbsServer {
    pub async fn new(config: Config) -> Result<Self> {
        let storage = Storage::new(&config.storage).await?;
        let snapshot = storage.load_state().await;
        info!(
            "Loaded {} groups from {}",
            snapshot.groups.len(),
            storage.base_dir().display()
        );
        Ok(Self {
            state: SharedState::from_snapshot(snapshot),
            config,
            storage,
            listener: None,
        })
    }

    /// Open the listening socket. Called by `run` if not done beforehand; calling it
    /// first lets callers learn the port when configured with port 0.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let address = self.config.server.bind_address();
        let backlog = self.config.server.backlog;
        let candidates = lookup_host(address.as_str())
            .await
            .with_context(|| format!("Failed to resolve {}", address))?;

        let mut last_err = None;
        for addr in candidates {
            match bind_listener(addr, backlog) {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    info!("Listening on {} (backlog {})", local, backlog);
                    self.listener = Some(listener);
                    return Ok(local);
                }
                Err(e) => {
                    debug!("Bind to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => anyhow!("Failed to bind {}: {}", address, e),
            None => anyhow!("{} resolved to no addresses", address),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C ({}); running until killed", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown_signal` completes, then drain sessions and persist.
    ///
    /// Returns an error when binding fails or the final snapshot cannot be written.
    pub async fn run_until<F>(&mut self, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener not bound"))?;
        let settings = SessionSettings::from(&self.config.server);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let mut autosave = self.config.server.autosave_interval().map(autosave_timer);
        tokio::pin!(shutdown_signal);

        info!("Group BBS '{}' started", self.config.server.name);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Received shutdown signal");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        sessions.spawn(handle_connection(
                            stream,
                            peer,
                            self.state.clone(),
                            settings,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session task failed: {}", e);
                    }
                }
                _ = async {
                    match autosave.as_mut() {
                        Some(timer) => { timer.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = self.save().await {
                        warn!("Autosave failed: {:#}", e);
                    }
                }
            }
        }

        drop(listener);
        let connected = self.state.connected_sessions().await;
        if !connected.is_empty() {
            info!("Closing {} sessions", connected.len());
            for (id, name) in &connected {
                debug!("Closing session {} ({})", id, escape_log(name));
            }
        }
        let _ = shutdown_tx.send(true);
        let drained = timeout(self.config.server.drain_timeout(), async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    warn!("Session task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} sessions still open after {:?}; aborting them",
                sessions.len(),
                self.config.server.drain_timeout()
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        let saved = self.save().await;
        let m = metrics::snapshot();
        info!(
            "Shutdown complete: sessions={} still_open={} commands={} posts={} notices={} dropped={}",
            m.sessions_opened,
            m.sessions_active(),
            m.commands_handled,
            m.messages_posted,
            m.notices_delivered,
            m.notices_dropped
        );
        match saved {
            Ok(()) => {
                info!("State saved to {}", self.storage.base_dir().display());
                Ok(())
            }
            Err(e) => {
                error!("Failed to save state: {:#}", e);
                Err(e)
            }
        }
    }

    /// Write the current registry and boards to disk.
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.state.snapshot().await;
        self.storage.save_state(&snapshot).await
    }

    /// Print configuration and stored-state summary.
    pub async fn show_status(&self) -> Result<()> {
        let snapshot = self.state.snapshot().await;
        println!("=== Group BBS Status ===");
        println!("Name: {}", self.config.server.name);
        println!("Listen Address: {}", self.config.server.bind_address());
        println!("Data Directory: {}", self.storage.base_dir().display());
        if !self.storage.snapshot_exists().await {
            println!("Snapshots: none yet");
        }
        let groups: Vec<&str> = snapshot.groups.group_names().collect();
        println!("Groups: {}", groups.len());
        let mut total = 0;
        for group in groups {
            let members = snapshot.groups.members(group).map_or(0, |m| m.len());
            let posts = snapshot.boards.message_count(group);
            total += posts;
            println!("  {:<20} {:>4} members {:>6} messages", group, members, posts);
        }
        println!("Total Messages: {}", total);
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

fn autosave_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
