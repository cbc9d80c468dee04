//! Group registry, board store and the connected-sessions table.
//!
//! All three live inside one [`BoardState`] behind the single `RwLock` of
//! [`SharedState`]. Mutations (handshake, join, post, leave, disconnect) hold the write
//! lock while they enqueue their notices, and the command layer queues the caller's
//! reply before releasing the guard, so every session observes frames in the same order
//! as the mutations that caused them. Enqueueing a notice is a non-blocking `try_send`
//! on each session's bounded outbox: a stalled peer loses notices instead of stalling
//! the lock holder.
//!
//! Queries return owned values; no reference into the maps ever escapes the lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::errors::BbsError;
use crate::logutil::escape_log;
use crate::metrics;

/// The group every client belongs to after the handshake.
pub const DEFAULT_GROUP: &str = "default";

/// Sending half of a session's outgoing frame queue.
pub type Outbox = mpsc::Sender<String>;

/// A single board post. Never modified after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// `"<sender> on <date> (<subject>): <body>"`
    pub fn render(&self) -> String {
        format!(
            "{} on {} ({}): {}",
            self.sender,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.subject,
            self.body
        )
    }
}

/// Group name → ordered member list without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupRegistry {
    groups: BTreeMap<String, Vec<String>>,
}

impl GroupRegistry {
    /// Registry holding only the empty `"default"` group.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.ensure_group(DEFAULT_GROUP);
        registry
    }

    /// Create `group` if absent. Returns true when it was created.
    pub fn ensure_group(&mut self, group: &str) -> bool {
        if self.groups.contains_key(group) {
            return false;
        }
        self.groups.insert(group.to_string(), Vec::new());
        true
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn is_member(&self, group: &str, name: &str) -> bool {
        self.groups
            .get(group)
            .map(|members| members.iter().any(|m| m == name))
            .unwrap_or(false)
    }

    /// Add `name` to `group`, creating the group if needed. Returns false if already present.
    pub fn add_member(&mut self, group: &str, name: &str) -> bool {
        let members = self.groups.entry(group.to_string()).or_default();
        if members.iter().any(|m| m == name) {
            return false;
        }
        members.push(name.to_string());
        true
    }

    /// Returns false if `name` was not a member.
    pub fn remove_member(&mut self, group: &str, name: &str) -> bool {
        if let Some(members) = self.groups.get_mut(group) {
            if let Some(pos) = members.iter().position(|m| m == name) {
                members.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn members(&self, group: &str) -> Option<&[String]> {
        self.groups.get(group).map(|m| m.as_slice())
    }

    /// Group names in sorted order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Drop duplicate members (first occurrence wins). Returns how many were removed.
    fn dedupe(&mut self) -> usize {
        let mut removed = 0;
        for members in self.groups.values_mut() {
            let before = members.len();
            let mut seen = Vec::with_capacity(before);
            members.retain(|m| {
                if seen.contains(m) {
                    false
                } else {
                    seen.push(m.clone());
                    true
                }
            });
            removed += before - members.len();
        }
        removed
    }
}

/// Group name → append-only message list; a message's id is its index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardStore {
    boards: BTreeMap<String, Vec<Message>>,
}

impl BoardStore {
    /// Store holding only the empty `"default"` board.
    pub fn new() -> Self {
        let mut store = Self::default();
        store.ensure_board(DEFAULT_GROUP);
        store
    }

    /// Create the board for `group` if absent. Returns true when it was created.
    pub fn ensure_board(&mut self, group: &str) -> bool {
        if self.boards.contains_key(group) {
            return false;
        }
        self.boards.insert(group.to_string(), Vec::new());
        true
    }

    pub fn contains_board(&self, group: &str) -> bool {
        self.boards.contains_key(group)
    }

    /// Append a message and return its id, or `None` when `group` has no board.
    pub fn append(&mut self, group: &str, sender: &str, subject: &str, body: &str) -> Option<u64> {
        let board = self.boards.get_mut(group)?;
        let id = board.len() as u64;
        board.push(Message {
            id,
            sender: sender.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
        });
        Some(id)
    }

    pub fn get(&self, group: &str, id: u64) -> Option<&Message> {
        let index = usize::try_from(id).ok()?;
        self.boards.get(group)?.get(index)
    }

    pub fn message_count(&self, group: &str) -> usize {
        self.boards.get(group).map(|b| b.len()).unwrap_or(0)
    }

    pub fn board_names(&self) -> impl Iterator<Item = &str> {
        self.boards.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Rewrite ids that do not match their index. Returns how many changed.
    fn renumber(&mut self) -> usize {
        let mut changed = 0;
        for board in self.boards.values_mut() {
            for (index, message) in board.iter_mut().enumerate() {
                if message.id != index as u64 {
                    message.id = index as u64;
                    changed += 1;
                }
            }
        }
        changed
    }
}

/// Persistable part of the server state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub groups: GroupRegistry,
    pub boards: BoardStore,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            groups: GroupRegistry::new(),
            boards: BoardStore::new(),
        }
    }
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

/// Notice texts pushed to other sessions.
pub mod notice {
    pub fn joined_server(name: &str, id: u64) -> String {
        format!("{} has joined the server (client ID #{}).", name, id)
    }

    pub fn left_server(name: &str, id: u64) -> String {
        format!("{} has left the server (client ID #{}).", name, id)
    }

    pub fn joined_group(name: &str, group: &str) -> String {
        format!("{} has joined group {}.", name, group)
    }

    pub fn left_group(name: &str, group: &str) -> String {
        format!("{} has left group {}.", name, group)
    }

    pub fn new_post(group: &str, name: &str, id: u64) -> String {
        format!("New message posted in {} by {} with ID#{}.", group, name, id)
    }
}

#[derive(Debug)]
struct ConnectedClient {
    name: String,
    group: String,
    outbox: Outbox,
}

/// Best-effort, non-blocking delivery of one frame to one session.
fn deliver(id: u64, client: &ConnectedClient, text: &str) -> bool {
    match client.outbox.try_send(text.to_string()) {
        Ok(()) => {
            metrics::inc_notices_delivered();
            true
        }
        Err(TrySendError::Full(_)) => {
            metrics::inc_notices_dropped();
            warn!(
                "Outbox full for session {} ({}); dropped: {}",
                id,
                escape_log(&client.name),
                escape_log(text)
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            metrics::inc_notices_dropped();
            debug!("Session {} outbox closed; dropped notice", id);
            false
        }
    }
}

/// Registry, boards and connected sessions. Use through [`SharedState`].
#[derive(Debug)]
pub struct BoardState {
    registry: GroupRegistry,
    boards: BoardStore,
    clients: BTreeMap<u64, ConnectedClient>,
    next_session_id: u64,
}

impl Default for BoardState {
    fn default() -> Self {
        Self::from_snapshot(StateSnapshot::default())
    }
}

impl BoardState {
    /// Build state from loaded snapshots, repairing anything that breaks an invariant.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        let StateSnapshot {
            groups: mut registry,
            mut boards,
        } = snapshot;

        registry.ensure_group(DEFAULT_GROUP);
        let group_names: Vec<String> = registry.group_names().map(str::to_string).collect();
        for group in &group_names {
            if boards.ensure_board(group) {
                debug!("Created missing board for group {}", group);
            }
        }
        let orphans: Vec<String> = boards
            .board_names()
            .filter(|b| !registry.contains_group(b))
            .map(str::to_string)
            .collect();
        for board in orphans {
            warn!("Board {} has no group; recreating empty group", board);
            registry.ensure_group(&board);
        }
        let duplicates = registry.dedupe();
        if duplicates > 0 {
            warn!("Removed {} duplicate group members from snapshot", duplicates);
        }
        let renumbered = boards.renumber();
        if renumbered > 0 {
            warn!("Renumbered {} messages with non-contiguous ids", renumbered);
        }

        Self {
            registry,
            boards,
            clients: BTreeMap::new(),
            next_session_id: 0,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            groups: self.registry.clone(),
            boards: self.boards.clone(),
        }
    }

    fn ensure_group_and_board(&mut self, group: &str) {
        if self.registry.ensure_group(group) {
            info!("Created group {}", group);
        }
        self.boards.ensure_board(group);
    }

    fn require_member(&self, group: &str, name: &str) -> Result<(), BbsError> {
        if !self.registry.contains_group(group) {
            return Err(BbsError::GroupNotFound {
                group: group.to_string(),
            });
        }
        if !self.registry.is_member(group, name) {
            return Err(BbsError::NotMember {
                group: group.to_string(),
            });
        }
        Ok(())
    }

    /// Push `text` to every connected session whose user is a member of `group`.
    fn notify_members(&self, group: &str, exclude: Option<u64>, text: &str) -> usize {
        let Some(members) = self.registry.members(group) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, client) in &self.clients {
            if Some(*id) == exclude || !members.contains(&client.name) {
                continue;
            }
            if deliver(*id, client, text) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Allocate the next session id and register the connection.
    ///
    /// The caller is added to `"default"` and to `group` (created with its board when
    /// absent). The `"id <n>"` handshake reply is queued on `outbox` before any notice can
    /// reach it, then every other connected session is told about the arrival.
    pub fn register_session(&mut self, name: &str, group: &str, outbox: Outbox) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;

        self.ensure_group_and_board(DEFAULT_GROUP);
        self.registry.add_member(DEFAULT_GROUP, name);
        self.ensure_group_and_board(group);
        self.registry.add_member(group, name);

        let client = ConnectedClient {
            name: name.to_string(),
            group: group.to_string(),
            outbox,
        };
        // The outbox is fresh, so the handshake reply always fits.
        if let Err(e) = client.outbox.try_send(format!("id {}", id)) {
            debug!("Session {}: handshake reply not queued: {}", id, e);
        }

        let arrival = notice::joined_server(name, id);
        for (other_id, other) in &self.clients {
            deliver(*other_id, other, &arrival);
        }
        self.clients.insert(id, client);
        id
    }

    /// Remove a session from the connected table, optionally announcing the departure to
    /// everyone still connected. Returns false if the id was not registered.
    pub fn unregister_session(&mut self, id: u64, announce: bool) -> bool {
        let Some(client) = self.clients.remove(&id) else {
            return false;
        };
        debug!(
            "Session {} ({}, joined via {}) removed",
            id,
            escape_log(&client.name),
            client.group
        );
        if announce {
            let departure = notice::left_server(&client.name, id);
            for (other_id, other) in &self.clients {
                deliver(*other_id, other, &departure);
            }
        }
        true
    }

    pub fn join(&mut self, session_id: u64, name: &str, group: &str) -> JoinOutcome {
        self.ensure_group_and_board(group);
        if !self.registry.add_member(group, name) {
            return JoinOutcome::AlreadyMember;
        }
        self.notify_members(group, Some(session_id), &notice::joined_group(name, group));
        JoinOutcome::Joined
    }

    /// Append a post and notify the group's other connected members. Returns the new id.
    pub fn post(
        &mut self,
        session_id: u64,
        name: &str,
        group: &str,
        subject: &str,
        body: &str,
    ) -> Result<u64, BbsError> {
        self.require_member(group, name)?;
        self.boards.ensure_board(group);
        let id = self
            .boards
            .append(group, name, subject, body)
            .ok_or_else(|| BbsError::GroupNotFound {
                group: group.to_string(),
            })?;
        metrics::inc_messages_posted();
        self.notify_members(group, Some(session_id), &notice::new_post(group, name, id));
        Ok(id)
    }

    pub fn leave(&mut self, session_id: u64, name: &str, group: &str) -> Result<(), BbsError> {
        self.require_member(group, name)?;
        self.registry.remove_member(group, name);
        self.notify_members(group, Some(session_id), &notice::left_group(name, group));
        Ok(())
    }

    pub fn users(&self, name: &str, group: &str, require_membership: bool) -> Result<Vec<String>, BbsError> {
        if require_membership {
            self.require_member(group, name)?;
        }
        self.registry
            .members(group)
            .map(|m| m.to_vec())
            .ok_or_else(|| BbsError::GroupNotFound {
                group: group.to_string(),
            })
    }

    pub fn message(&self, name: &str, group: &str, id: u64) -> Result<Message, BbsError> {
        self.require_member(group, name)?;
        self.boards
            .get(group, id)
            .cloned()
            .ok_or_else(|| BbsError::MessageNotFound {
                group: group.to_string(),
                id,
            })
    }

    pub fn group_names(&self) -> Vec<String> {
        self.registry.group_names().map(str::to_string).collect()
    }

    /// `(id, name)` of every connected session, by ascending id.
    pub fn connected_sessions(&self) -> Vec<(u64, String)> {
        self.clients
            .iter()
            .map(|(id, c)| (*id, c.name.clone()))
            .collect()
    }
}

/// Cloneable handle to the single lock guarding [`BoardState`].
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<BoardState>>,
}

impl SharedState {
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoardState::from_snapshot(snapshot))),
        }
    }

    pub async fn register_session(&self, name: &str, group: &str, outbox: Outbox) -> u64 {
        self.inner.write().await.register_session(name, group, outbox)
    }

    pub async fn unregister_session(&self, id: u64, announce: bool) -> bool {
        self.inner.write().await.unregister_session(id, announce)
    }

    /// Shared access for queries.
    pub async fn read(&self) -> RwLockReadGuard<'_, BoardState> {
        self.inner.read().await
    }

    /// Exclusive access for mutations. Frames queued while the guard is held are
    /// ordered consistently across every session.
    pub async fn write(&self) -> RwLockWriteGuard<'_, BoardState> {
        self.inner.write().await
    }

    pub async fn connected_sessions(&self) -> Vec<(u64, String)> {
        self.inner.read().await.connected_sessions()
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.inner.read().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox(capacity: usize) -> (Outbox, mpsc::Receiver<String>) {
        mpsc::channel(capacity)
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn handshake_creates_group_board_and_membership() {
        let mut state = BoardState::default();
        let (tx, mut rx) = outbox(8);
        let id = state.register_session("alice", "eng", tx);
        assert_eq!(id, 0);
        assert_eq!(drain(&mut rx), vec!["id 0"]);

        let snap = state.snapshot();
        assert_eq!(snap.groups.members("eng").unwrap().to_vec(), vec!["alice"]);
        assert!(snap.groups.is_member(DEFAULT_GROUP, "alice"));
        assert!(snap.boards.contains_board("eng"));
        assert_eq!(snap.boards.message_count("eng"), 0);
        assert_eq!(state.join(id, "alice", "eng"), JoinOutcome::AlreadyMember);
    }

    #[test]
    fn session_ids_are_sequential_and_not_reused() {
        let mut state = BoardState::default();
        let (a, _ra) = outbox(8);
        let (b, _rb) = outbox(8);
        let (c, _rc) = outbox(8);
        assert_eq!(state.register_session("a", DEFAULT_GROUP, a), 0);
        assert!(state.unregister_session(0, false));
        assert_eq!(state.register_session("b", "default", b), 1);
        assert_eq!(state.register_session("c", "default", c), 2);
        assert!(!state.unregister_session(0, false));
    }

    #[test]
    fn arrival_and_departure_reach_other_sessions_only() {
        let mut state = BoardState::default();
        let (a, mut ra) = outbox(8);
        let (b, mut rb) = outbox(8);
        state.register_session("alice", DEFAULT_GROUP, a);
        state.register_session("bob", DEFAULT_GROUP, b);
        assert_eq!(
            drain(&mut ra),
            vec!["id 0", "bob has joined the server (client ID #1)."]
        );
        assert_eq!(drain(&mut rb), vec!["id 1"]);

        state.unregister_session(1, true);
        assert_eq!(
            drain(&mut ra),
            vec!["bob has left the server (client ID #1)."]
        );
        assert!(drain(&mut rb).is_empty());
    }

    #[test]
    fn post_ids_are_contiguous_and_notify_members() {
        let mut state = BoardState::default();
        let (a, mut ra) = outbox(16);
        let (b, mut rb) = outbox(16);
        let (c, mut rc) = outbox(16);
        state.register_session("alice", "eng", a);
        state.register_session("bob", "eng", b);
        state.register_session("carol", DEFAULT_GROUP, c);
        drain(&mut ra);
        drain(&mut rb);
        drain(&mut rc);

        assert_eq!(state.post(0, "alice", "eng", "hi", "there").unwrap(), 0);
        assert_eq!(state.post(1, "bob", "eng", "re", "hello back").unwrap(), 1);
        assert_eq!(
            drain(&mut rb),
            vec!["New message posted in eng by alice with ID#0."]
        );
        assert_eq!(
            drain(&mut ra),
            vec!["New message posted in eng by bob with ID#1."]
        );
        assert!(drain(&mut rc).is_empty());

        let msg = state.message("bob", "eng", 0).unwrap();
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.subject, "hi");
        assert_eq!(msg.body, "there");
        assert!(msg.render().starts_with("alice on "));
        assert!(msg.render().ends_with(" (hi): there"));
    }

    #[test]
    fn non_members_are_rejected_without_state_change() {
        let mut state = BoardState::default();
        let (a, _ra) = outbox(8);
        let (b, _rb) = outbox(8);
        state.register_session("alice", "eng", a);
        state.register_session("bob", DEFAULT_GROUP, b);
        let before = state.snapshot();

        let not_member = BbsError::NotMember { group: "eng".into() };
        assert_eq!(state.post(1, "bob", "eng", "s", "b"), Err(not_member.clone()));
        assert_eq!(state.users("bob", "eng", true), Err(not_member.clone()));
        assert_eq!(state.leave(1, "bob", "eng"), Err(not_member.clone()));
        assert_eq!(state.message("bob", "eng", 0), Err(not_member));
        assert_eq!(state.snapshot(), before);

        assert_eq!(
            state.post(1, "bob", "nope", "s", "b"),
            Err(BbsError::GroupNotFound { group: "nope".into() })
        );
    }

    #[test]
    fn double_leave_only_removes_and_announces_once() {
        let mut state = BoardState::default();
        let (a, mut ra) = outbox(8);
        let (b, mut rb) = outbox(8);
        state.register_session("alice", "eng", a);
        state.register_session("bob", "eng", b);
        drain(&mut ra);
        drain(&mut rb);

        assert!(state.leave(0, "alice", "eng").is_ok());
        assert_eq!(drain(&mut rb), vec!["alice has left group eng."]);
        assert_eq!(
            state.leave(0, "alice", "eng"),
            Err(BbsError::NotMember { group: "eng".into() })
        );
        assert!(drain(&mut rb).is_empty());
        assert_eq!(state.users("bob", "eng", true).unwrap(), vec!["bob"]);
    }

    #[test]
    fn full_outbox_drops_notice_instead_of_blocking() {
        let mut state = BoardState::default();
        let (a, mut ra) = outbox(1);
        let (b, _rb) = outbox(8);
        state.register_session("alice", DEFAULT_GROUP, a);
        // alice's single slot already holds "id 0"
        state.register_session("bob", DEFAULT_GROUP, b);
        assert_eq!(drain(&mut ra), vec!["id 0"]);
        assert_eq!(state.post(1, "bob", DEFAULT_GROUP, "s", "b").unwrap(), 0);
        assert_eq!(
            drain(&mut ra),
            vec!["New message posted in default by bob with ID#0."]
        );
    }

    #[test]
    fn missing_message_and_unchecked_users() {
        let mut state = BoardState::default();
        let (a, _ra) = outbox(8);
        state.register_session("alice", "eng", a);
        assert_eq!(
            state.message("alice", "eng", 3),
            Err(BbsError::MessageNotFound { group: "eng".into(), id: 3 })
        );
        assert_eq!(state.users("mallory", DEFAULT_GROUP, false).unwrap(), vec!["alice"]);
        assert_eq!(state.group_names(), vec!["default", "eng"]);
    }

    #[test]
    fn snapshot_repair_restores_invariants() {
        let mut groups = GroupRegistry::default();
        groups.add_member("eng", "alice");
        let mut boards = BoardStore::default();
        boards.ensure_board("ops");
        boards.append("ops", "bob", "s", "b");

        let state = BoardState::from_snapshot(StateSnapshot { groups, boards });
        let snap = state.snapshot();
        assert!(snap.groups.contains_group(DEFAULT_GROUP));
        assert!(snap.groups.contains_group("ops"));
        assert!(snap.boards.contains_board("eng"));
        assert!(snap.boards.contains_board(DEFAULT_GROUP));
        assert_eq!(snap.boards.message_count("ops"), 1);
    }
}
