use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::commands::{Caller, CommandProcessor, Outcome};
use super::errors::BbsError;
use super::state::{SharedState, DEFAULT_GROUP};
use crate::config::ServerConfig;
use crate::logutil::escape_log;
use crate::metrics;
use crate::net::{FrameReader, FrameWriter};
use crate::validation::{validate_group_name, validate_user_name};

/// # Client Session
///
/// One accepted TCP connection after a successful handshake. The session owns the read
/// half of the socket; the write half belongs to a writer task that drains the session's
/// outbox, so command replies and notices pushed by other sessions share one ordered
/// queue.
///
/// ## Lifecycle
///
/// 1. **Handshake** - first frame `"<name> [group]"`, answered with `"id <n>"`
/// 2. **Command loop** - one reply frame per request frame
/// 3. **Closed** - `exit`, peer disconnect, read failure or server shutdown
///
/// Only a lost connection is announced to the other clients; `exit` and shutdown close
/// quietly.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub name: String,
    /// Group requested in the handshake.
    pub group: String,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id: u64, handshake: Handshake, peer: SocketAddr) -> Self {
        let now = Utc::now();
        Session {
            id,
            name: handshake.name,
            group: handshake.group,
            peer,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn session_duration(&self) -> chrono::Duration {
        self.last_activity - self.connected_at
    }

    pub fn caller(&self) -> Caller {
        Caller {
            session_id: self.id,
            name: self.name.clone(),
        }
    }
}

/// Parsed first frame of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub name: String,
    pub group: String,
}

impl Handshake {
    /// Parse `"<name> [group]"`; a missing group means `"default"`.
    pub fn parse(line: &str) -> Result<Handshake, BbsError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [name] => Ok(Handshake {
                name: validate_user_name(name)?,
                group: DEFAULT_GROUP.to_string(),
            }),
            [name, group] => Ok(Handshake {
                name: validate_user_name(name)?,
                group: validate_group_name(group)?,
            }),
            [] => Err(BbsError::protocol("Handshake must be \"<name> [group]\".")),
            _ => Err(BbsError::protocol(
                "Handshake must be \"<name> [group]\"; names cannot contain spaces.",
            )),
        }
    }
}

/// Per-connection limits taken from `[server]`.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub max_frame_bytes: usize,
    pub outbox_capacity: usize,
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            max_frame_bytes: cfg.max_frame_bytes,
            outbox_capacity: cfg.outbox_capacity.max(1),
            write_timeout: cfg.write_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Exit,
    Shutdown,
    ConnectionLost,
}

/// Drive one connection from handshake to close.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: SharedState,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{}: set_nodelay failed: {}", peer, e);
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, settings.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half, settings.max_frame_bytes);

    if *shutdown.borrow() {
        return;
    }
    let first = tokio::select! {
        _ = shutdown.changed() => return,
        frame = reader.read_frame() => frame,
    };
    let line = match first {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!("{}: closed before handshake", peer);
            return;
        }
        Err(e) => {
            warn!("{}: handshake read failed: {}", peer, e);
            return;
        }
    };
    let handshake = match Handshake::parse(&line) {
        Ok(h) => h,
        Err(e) => {
            info!("{}: rejected handshake {}: {}", peer, escape_log(&line), e);
            if let Ok(Err(e)) =
                timeout(settings.write_timeout, writer.write_frame(&e.to_string())).await
            {
                debug!("{}: could not send handshake error: {}", peer, e);
            }
            let _ = writer.shutdown().await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(settings.outbox_capacity);
    let writer_task = tokio::spawn(write_loop(writer, rx, settings.write_timeout, peer));

    let id = state
        .register_session(&handshake.name, &handshake.group, tx.clone())
        .await;
    let mut session = Session::new(id, handshake, peer);
    metrics::inc_sessions_opened();
    info!(
        "Session {} opened for {} (group {}) from {}",
        id,
        escape_log(&session.name),
        session.group,
        peer
    );

    let processor = CommandProcessor::new(state.clone());
    let caller = session.caller();
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break CloseReason::Shutdown,
            _ = tx.closed() => {
                debug!("Session {}: writer stopped", id);
                break CloseReason::ConnectionLost;
            }
            frame = reader.read_frame() => match frame {
                Ok(Some(line)) => {
                    session.update_activity();
                    metrics::inc_commands_handled();
                    // Waits only while the outbox is full; a stalled peer ends the
                    // writer after `write_timeout`, which closes the channel.
                    let Ok(reply) = tx.reserve().await else {
                        break CloseReason::ConnectionLost;
                    };
                    let outcome = processor.process(&caller, &line, reply).await;
                    if matches!(outcome, Outcome::Exit(_)) {
                        break CloseReason::Exit;
                    }
                }
                Ok(None) => break CloseReason::ConnectionLost,
                Err(e) => {
                    warn!("Session {}: read failed: {}", id, e);
                    break CloseReason::ConnectionLost;
                }
            },
        }
    };

    state
        .unregister_session(id, reason == CloseReason::ConnectionLost)
        .await;
    metrics::inc_sessions_closed();
    drop(tx);
    if let Err(e) = writer_task.await {
        warn!("Session {}: writer task failed: {}", id, e);
    }
    info!(
        "Session {} closed ({:?}) for {} after {}s",
        id,
        reason,
        escape_log(&session.name),
        session.session_duration().num_seconds()
    );
}

/// Drain the outbox onto the socket until every sender is gone or a write fails.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<String>,
    write_timeout: Duration,
    peer: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        match timeout(write_timeout, writer.write_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("{}: write failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("{}: write timed out after {:?}", peer, write_timeout);
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
