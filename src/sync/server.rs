//! SyncServer implementation for managing concurrent collaboration channels.
//!
//! This module implements the authoritative side of the OT protocol using:
//! - DashMap for concurrent access to the channel and peer registries
//! - One mutex-guarded [`RevisionLog`] per channel as its serialization point
//! - Per-peer unbounded queues for outbound messages
//!
//! Every step that touches a channel's log (join snapshot, rebase, commit,
//! acknowledgement, broadcast) runs while holding that channel's lock.
//! Outbound sends are non-blocking queue pushes, so the lock is never held
//! across network I/O, and every member observes commits in revision order.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::protocol::ServerMessage;
use super::revision_log::{Committed, RevisionLog, Snapshot};
use super::{ChannelId, PeerId, SyncError, SyncResult};
use crate::ot::TextOperation;
use crate::storage::ChannelStore;

/// Configuration for the SyncServer
#[derive(Debug, Clone, PartialEq)]
pub struct SyncServerConfig {
    /// Maximum number of live channels
    pub max_channels: usize,
    /// Maximum members per channel
    pub max_peers_per_channel: usize,
    /// Maximum document length in chars
    pub max_document_chars: usize,
    /// History entries always kept per channel, even when compactable
    pub history_min_retained: usize,
    /// Snapshot save interval
    pub save_interval: Duration,
    /// Cleanup interval for stale peers, history and idle channels
    pub cleanup_interval: Duration,
    /// Peers silent for longer than this are dropped
    pub session_timeout: Duration,
    /// Empty channels idle for longer than this are evicted from memory
    pub idle_channel_ttl: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            max_channels: 1000,
            max_peers_per_channel: 50,
            max_document_chars: 1_000_000,
            history_min_retained: 256,
            save_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
            idle_channel_ttl: Duration::from_secs(300),
        }
    }
}

/// A single peer connection
pub struct PeerConnection {
    /// Unique peer identifier
    pub peer_id: PeerId,
    /// Display name
    pub name: String,
    /// Channel to send messages to this peer
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Last activity timestamp
    last_active: Instant,
    /// The one channel this peer is a member of
    channel: Option<ChannelId>,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            tx,
            last_active: Instant::now(),
            channel: None,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Check if the connection is stale
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    /// Channel this peer is currently in
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
}

/// Per-member state within a channel
struct ChannelMember {
    /// Outbound queue of the member's connection
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Lowest revision this member can still submit against
    floor_revision: u64,
}

impl ChannelMember {
    fn send(&self, msg: ServerMessage) {
        // A closed queue means the connection is going away; its cleanup
        // removes the member.
        let _ = self.tx.send(msg);
    }
}

/// A collaboration channel: one revision log and its members
struct ChannelRoom {
    /// Channel identifier
    channel_id: ChannelId,
    /// The serialization point for everything that reads or writes the log
    log: Mutex<RevisionLog>,
    /// Connected members
    members: DashMap<PeerId, ChannelMember>,
    /// Set once the room has been evicted; joins must find a fresh room
    closed: AtomicBool,
    /// Creation timestamp
    created_at: Instant,
    /// Last activity timestamp
    last_active: RwLock<Instant>,
    /// Whether the document changed since the last snapshot
    dirty: RwLock<bool>,
}

impl ChannelRoom {
    fn new(channel_id: impl Into<String>, log: RevisionLog) -> Self {
        Self {
            channel_id: channel_id.into(),
            log: Mutex::new(log),
            members: DashMap::new(),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            last_active: RwLock::new(Instant::now()),
            dirty: RwLock::new(false),
        }
    }

    fn member_count(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }

    fn mark_dirty(&self) {
        *self.dirty.write() = true;
        self.touch();
    }

    /// Check and clear dirty flag
    fn take_dirty(&self) -> bool {
        let mut dirty = self.dirty.write();
        let was_dirty = *dirty;
        *dirty = false;
        was_dirty
    }

    fn member_ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|m| m.key().clone()).collect()
    }

    /// Send to every member except `exclude`. Callers hold the log lock.
    fn broadcast_locked(&self, exclude: &str, msg: &ServerMessage) {
        for member in self.members.iter() {
            if member.key() != exclude {
                member.send(msg.clone());
            }
        }
    }

    /// Lowest floor across members, or the current revision if there are none
    fn floor_revision(&self, log: &RevisionLog) -> u64 {
        self.members
            .iter()
            .map(|m| m.floor_revision)
            .min()
            .unwrap_or_else(|| log.revision())
    }
}

/// Live view of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub revision: u64,
    pub document_chars: usize,
    pub history_len: usize,
    pub peers: Vec<PeerId>,
    pub age_seconds: u64,
}

/// The main synchronization server
pub struct SyncServer {
    /// Server configuration
    config: SyncServerConfig,
    /// Live channels
    rooms: DashMap<ChannelId, Arc<ChannelRoom>>,
    /// Connected peers
    peers: DashMap<PeerId, Arc<RwLock<PeerConnection>>>,
    /// Snapshot storage
    storage: Arc<ChannelStore>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(storage: ChannelStore, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            peers: DashMap::new(),
            storage: Arc::new(storage),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_storage(storage: ChannelStore) -> Self {
        Self::new(storage, SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Register a new peer connection
    pub fn register_peer(
        &self,
        peer_id: &str,
        name: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<()> {
        let connection = PeerConnection::new(peer_id, name, tx);
        self.peers
            .insert(peer_id.to_string(), Arc::new(RwLock::new(connection)));

        info!("Peer registered: {} ({})", name, peer_id);
        Ok(())
    }

    /// Unregister a peer connection, leaving its channel
    pub fn unregister_peer(&self, peer_id: &str) {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            let (name, channel) = {
                let peer = peer.read();
                (peer.name.clone(), peer.channel.clone())
            };

            if let Some(channel_id) = channel {
                self.remove_member(peer_id, &channel_id);
            }

            info!("Peer unregistered: {} ({})", name, peer_id);
        }
    }

    /// Tell a peer its session is over, then unregister it. The connection
    /// closes once its writer reaches the `Goodbye`.
    pub fn evict_peer(&self, peer_id: &str, reason: &str) {
        if let Some(peer) = self.get_peer(peer_id) {
            let _ = peer.read().tx.send(ServerMessage::Goodbye {
                reason: Some(reason.to_string()),
            });
        }
        self.unregister_peer(peer_id);
    }

    /// Get a peer connection
    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<RwLock<PeerConnection>>> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Update a peer's display name
    pub fn rename_peer(&self, peer_id: &str, name: &str) -> SyncResult<()> {
        let peer = self
            .get_peer(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
        peer.write().name = name.to_string();
        Ok(())
    }

    /// Record activity for a peer
    pub fn touch_peer(&self, peer_id: &str) {
        if let Some(peer) = self.get_peer(peer_id) {
            peer.write().touch();
        }
    }

    /// Join a channel, leaving any other channel first.
    ///
    /// The `Init` message is queued to the peer while the channel is locked,
    /// so it always precedes the first broadcast the peer receives.
    pub fn join_channel(&self, peer_id: &str, channel_id: &str) -> SyncResult<Snapshot> {
        let peer = self
            .get_peer(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;

        let (tx, previous) = {
            let peer = peer.read();
            (peer.tx.clone(), peer.channel.clone())
        };

        if let Some(previous) = previous.filter(|c| c != channel_id) {
            self.leave_channel(peer_id, &previous)?;
        }

        let snapshot = loop {
            let room = self.get_or_create_room(channel_id)?;
            let log = room.log.lock();

            // Evicted between lookup and lock
            if room.is_closed() {
                continue;
            }

            if !room.members.contains_key(peer_id)
                && room.member_count() >= self.config.max_peers_per_channel
            {
                return Err(SyncError::ChannelFull(channel_id.to_string()));
            }

            let snapshot = log.snapshot();
            let member = ChannelMember {
                tx: tx.clone(),
                floor_revision: snapshot.revision,
            };
            member.send(ServerMessage::Init {
                channel_id: channel_id.to_string(),
                document: snapshot.document.clone(),
                revision: snapshot.revision,
            });
            room.members.insert(peer_id.to_string(), member);
            room.touch();
            break snapshot;
        };

        peer.write().channel = Some(channel_id.to_string());

        info!(
            "Peer {} joined channel {} at revision {}",
            peer_id, channel_id, snapshot.revision
        );
        Ok(snapshot)
    }

    /// Leave a channel. Unacknowledged operations of the peer are simply
    /// never seen by the server; the shared document is not touched.
    pub fn leave_channel(&self, peer_id: &str, channel_id: &str) -> SyncResult<()> {
        if let Some(peer) = self.get_peer(peer_id) {
            let mut peer = peer.write();
            if peer.channel.as_deref() != Some(channel_id) {
                return Err(SyncError::NotJoined(channel_id.to_string()));
            }
            peer.channel = None;
        }

        self.remove_member(peer_id, channel_id);
        Ok(())
    }

    fn remove_member(&self, peer_id: &str, channel_id: &str) {
        if let Some(room) = self.room(channel_id) {
            if room.members.remove(peer_id).is_some() {
                room.touch();
                info!("Peer {} left channel {}", peer_id, channel_id);
            }
        }
    }

    /// Rebase, apply and append a peer's operation, then acknowledge it to
    /// the sender and broadcast it to every other member.
    ///
    /// If the operation is rejected (it cannot be rebased, or would grow the
    /// document past the limit) the sender is sent a `Resync` carrying the
    /// current snapshot and the log is left untouched.
    pub fn submit_operation(
        &self,
        peer_id: &str,
        channel_id: &str,
        base_revision: u64,
        operation: TextOperation,
    ) -> SyncResult<Committed> {
        let room = self
            .room(channel_id)
            .ok_or_else(|| SyncError::NotJoined(channel_id.to_string()))?;

        let mut log = room.log.lock();

        let result = self.commit_locked(&room, &mut log, peer_id, base_revision, operation);

        let Some(member) = room.members.get(peer_id) else {
            return result;
        };

        match &result {
            Ok(committed) => {
                member.send(ServerMessage::Ack {
                    channel_id: channel_id.to_string(),
                    revision: committed.revision,
                });
                drop(member);

                room.broadcast_locked(
                    peer_id,
                    &ServerMessage::RemoteOperation {
                        channel_id: channel_id.to_string(),
                        revision: committed.revision,
                        operation: committed.operation.clone(),
                    },
                );
                room.mark_dirty();

                debug!(
                    "Committed revision {} in channel {} from peer {}",
                    committed.revision, channel_id, peer_id
                );
            }
            Err(err) => {
                warn!(
                    "Rejected operation from peer {} in channel {}: {}",
                    peer_id, channel_id, err
                );
                member.send(ServerMessage::Resync {
                    channel_id: channel_id.to_string(),
                    reason: err.to_string(),
                    document: log.text().to_string(),
                    revision: log.revision(),
                });
                drop(member);
                if let Some(mut member) = room.members.get_mut(peer_id) {
                    member.floor_revision = log.revision();
                }
            }
        }

        result
    }

    fn commit_locked(
        &self,
        room: &ChannelRoom,
        log: &mut RevisionLog,
        peer_id: &str,
        base_revision: u64,
        operation: TextOperation,
    ) -> SyncResult<Committed> {
        if !room.members.contains_key(peer_id) {
            return Err(SyncError::NotJoined(room.channel_id.clone()));
        }

        let rebased = log.rebase(operation, base_revision)?;
        if rebased.target_len() > self.config.max_document_chars {
            return Err(SyncError::DocumentTooLarge {
                chars: rebased.target_len(),
                max: self.config.max_document_chars,
            });
        }

        let committed = log.commit(rebased)?;

        if let Some(mut member) = room.members.get_mut(peer_id) {
            member.floor_revision = member.floor_revision.max(base_revision);
        }

        Ok(committed)
    }

    /// Send the peer a fresh `Init` for its channel and reset its floor
    pub fn resync_peer(&self, peer_id: &str, channel_id: &str) -> SyncResult<Snapshot> {
        let room = self
            .room(channel_id)
            .ok_or_else(|| SyncError::NotJoined(channel_id.to_string()))?;

        let log = room.log.lock();
        let mut member = room
            .members
            .get_mut(peer_id)
            .ok_or_else(|| SyncError::NotJoined(channel_id.to_string()))?;

        let snapshot = log.snapshot();
        member.floor_revision = snapshot.revision;
        member.send(ServerMessage::Init {
            channel_id: channel_id.to_string(),
            document: snapshot.document.clone(),
            revision: snapshot.revision,
        });

        debug!(
            "Resynchronized peer {} in channel {} at revision {}",
            peer_id, channel_id, snapshot.revision
        );
        Ok(snapshot)
    }

    /// Consistent snapshot of a live channel
    pub fn channel_snapshot(&self, channel_id: &str) -> Option<Snapshot> {
        self.room(channel_id).map(|room| room.log.lock().snapshot())
    }

    /// Live details of a channel
    pub fn channel_info(&self, channel_id: &str) -> Option<ChannelInfo> {
        self.room(channel_id).map(|room| Self::describe(&room))
    }

    /// Live details of every channel
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.live_rooms().iter().map(|room| Self::describe(room)).collect()
    }

    fn describe(room: &ChannelRoom) -> ChannelInfo {
        let log = room.log.lock();
        ChannelInfo {
            channel_id: room.channel_id.clone(),
            revision: log.revision(),
            document_chars: log.text_chars(),
            history_len: log.history_len(),
            peers: room.member_ids(),
            age_seconds: room.created_at.elapsed().as_secs(),
        }
    }

    fn room(&self, channel_id: &str) -> Option<Arc<ChannelRoom>> {
        self.rooms.get(channel_id).map(|r| r.clone())
    }

    fn live_rooms(&self) -> Vec<Arc<ChannelRoom>> {
        self.rooms.iter().map(|r| r.value().clone()).collect()
    }

    /// Get or create a channel room, restoring its snapshot if one was saved
    fn get_or_create_room(&self, channel_id: &str) -> SyncResult<Arc<ChannelRoom>> {
        if let Some(room) = self.room(channel_id) {
            return Ok(room);
        }

        if self.rooms.len() >= self.config.max_channels {
            return Err(SyncError::TooManyChannels);
        }

        let log = match self.storage.load_snapshot(channel_id)? {
            Some(snapshot) => {
                info!(
                    "Restoring channel {} at revision {}",
                    channel_id, snapshot.revision
                );
                RevisionLog::restore(snapshot)
            }
            None => {
                info!("Creating new channel: {}", channel_id);
                RevisionLog::new()
            }
        };

        let room = self
            .rooms
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(ChannelRoom::new(channel_id, log)))
            .clone();

        Ok(room)
    }

    /// Save dirty channels to storage
    pub fn save_dirty_channels(&self) -> usize {
        let mut saved = 0;

        for room in self.live_rooms() {
            if room.take_dirty() {
                let snapshot = room.log.lock().snapshot();

                if let Err(e) = self.storage.save_snapshot(&room.channel_id, &snapshot) {
                    error!("Failed to save channel {}: {}", room.channel_id, e);
                    room.mark_dirty();
                } else {
                    debug!(
                        "Saved channel {} at revision {}",
                        room.channel_id, snapshot.revision
                    );
                    saved += 1;
                }
            }
        }

        saved
    }

    /// Drop history no member can still submit against. Returns the number
    /// of operations released.
    pub fn compact_history(&self) -> usize {
        let mut released = 0;

        for room in self.live_rooms() {
            let mut log = room.log.lock();
            let floor = room.floor_revision(&log);
            let dropped = log.compact(floor, self.config.history_min_retained);
            if dropped > 0 {
                debug!(
                    "Compacted {} operations from channel {} (history starts at {})",
                    dropped,
                    room.channel_id,
                    log.history_start()
                );
            }
            released += dropped;
        }

        released
    }

    /// Evict an empty, idle room after saving it. Returns whether it was removed.
    fn try_evict(&self, room: &Arc<ChannelRoom>) -> bool {
        {
            let log = room.log.lock();
            if !room.is_empty() || room.idle_for() < self.config.idle_channel_ttl {
                return false;
            }

            if room.take_dirty() {
                if let Err(e) = self.storage.save_snapshot(&room.channel_id, &log.snapshot()) {
                    error!("Failed to save channel {} before eviction: {}", room.channel_id, e);
                    room.mark_dirty();
                    return false;
                }
            }

            room.closed.store(true, Ordering::Release);
        }

        self.rooms
            .remove_if(&room.channel_id, |_, r| Arc::ptr_eq(r, room))
            .is_some()
    }

    /// Clean up stale peers, compact history and evict idle channels
    pub fn cleanup(&self) {
        let stale_peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.read().is_stale(self.config.session_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for peer_id in stale_peers {
            warn!("Removing stale peer: {}", peer_id);
            self.evict_peer(&peer_id, "session timeout");
        }

        self.compact_history();

        for room in self.live_rooms() {
            if self.try_evict(&room) {
                info!("Removed idle channel: {}", room.channel_id);
            }
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_channels: self.rooms.len(),
            active_peers: self.peers.len(),
            total_peers_in_channels: self.rooms.iter().map(|r| r.member_count()).sum(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get storage
    pub fn storage(&self) -> &Arc<ChannelStore> {
        &self.storage
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let save_interval = server.config.save_interval;

        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.save_dirty_channels();
                        if saved > 0 {
                            debug!("Auto-saved {} channels", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        // Final save
                        server.save_dirty_channels();
                        break;
                    }
                }
            }
        });

        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup();
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_channels: usize,
    pub active_peers: usize,
    pub total_peers_in_channels: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
    }
}
