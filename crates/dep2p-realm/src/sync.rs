//! Roster gossip on the realm-sync system protocol.
//!
//! Members exchange peer lists and announce their own join/leave so that
//! every member converges on the same roster. A periodic tick pulls
//! `MemberList` from a fan-out of known peers (merged by newest
//! `joined_at`); join and leave are pushed to all known peers as they
//! happen. Malformed inbound messages are dropped silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Buf;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use dep2p_core::{Connection, DynConnection, DynStream, Network, NodeId, PeerAddr, RealmId};

use crate::error::RealmError;

/// System protocol identifier of the roster sync exchange.
pub const REALM_SYNC_PROTOCOL: &str = "/dep2p/sys/realm/sync/1.0.0";

/// Maximum sync message payload (1 MiB).
pub const MAX_SYNC_PAYLOAD: usize = 1024 * 1024;

/// Default pull interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default pull fan-out.
pub const DEFAULT_SYNC_FANOUT: usize = 3;

/// Sanity cap on the realm string field.
const MAX_REALM_STR: usize = 256;

/// Sync message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMsgType {
    /// Full roster exchange (request and response share the type).
    MemberList = 0,
    /// A node announcing its own join.
    MemberJoin = 1,
    /// A node announcing its own leave.
    MemberLeave = 2,
    /// Realm metadata update.
    Metadata = 3,
    /// Keep-alive.
    Heartbeat = 4,
}

impl TryFrom<u8> for SyncMsgType {
    type Error = RealmError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::MemberList),
            1 => Ok(Self::MemberJoin),
            2 => Ok(Self::MemberLeave),
            3 => Ok(Self::Metadata),
            4 => Ok(Self::Heartbeat),
            other => Err(RealmError::Malformed(format!(
                "unknown sync message type {other}"
            ))),
        }
    }
}

/// One roster sync message.
///
/// Wire layout: `type(1) | realmLen(u16 BE) | realm | from(32) | ts(i64
/// BE) | payloadLen(u32 BE) | payload`, where `realm` is the realm ID's
/// opaque string form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncMessage {
    /// Message kind.
    pub msg_type: SyncMsgType,
    /// The realm the message concerns.
    pub realm: RealmId,
    /// The originating node.
    pub from: NodeId,
    /// Creation time, Unix seconds.
    pub timestamp: i64,
    /// Type-specific payload.
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Build a message stamped with the current time.
    pub fn new(msg_type: SyncMsgType, realm: RealmId, from: NodeId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            realm,
            from,
            timestamp: Utc::now().timestamp(),
            payload,
        }
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let realm_str = self.realm.to_hex();
        let mut out =
            Vec::with_capacity(1 + 2 + realm_str.len() + 32 + 8 + 4 + self.payload.len());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&(realm_str.len() as u16).to_be_bytes());
        out.extend_from_slice(realm_str.as_bytes());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, RealmError> {
        let truncated = || RealmError::Malformed("truncated sync message".to_string());
        let mut buf = bytes;

        if buf.remaining() < 3 {
            return Err(truncated());
        }
        let msg_type = SyncMsgType::try_from(buf.get_u8())?;
        let realm_len = buf.get_u16() as usize;
        if realm_len > MAX_REALM_STR || buf.remaining() < realm_len {
            return Err(truncated());
        }
        let realm_raw = buf.copy_to_bytes(realm_len);
        let realm_str = std::str::from_utf8(&realm_raw)
            .map_err(|_| RealmError::Malformed("realm field is not utf-8".to_string()))?;
        let realm = RealmId::from_hex(realm_str)
            .map_err(|_| RealmError::Malformed("realm field is not a realm id".to_string()))?;

        if buf.remaining() < 32 + 8 + 4 {
            return Err(truncated());
        }
        let mut from_bytes = [0u8; 32];
        buf.copy_to_slice(&mut from_bytes);
        let from = NodeId::new(from_bytes);
        let timestamp = buf.get_i64();

        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_SYNC_PAYLOAD {
            return Err(RealmError::MessageTooLarge {
                len: payload_len,
                max: MAX_SYNC_PAYLOAD,
            });
        }
        if buf.remaining() != payload_len {
            return Err(truncated());
        }
        let payload = buf.copy_to_bytes(payload_len).to_vec();

        Ok(Self {
            msg_type,
            realm,
            from,
            timestamp,
            payload,
        })
    }

    /// Write the message to a stream.
    pub async fn write_to(&self, stream: &mut DynStream) -> Result<(), RealmError> {
        if self.payload.len() > MAX_SYNC_PAYLOAD {
            return Err(RealmError::MessageTooLarge {
                len: self.payload.len(),
                max: MAX_SYNC_PAYLOAD,
            });
        }
        stream.write_all(&self.encode()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one message from a stream.
    pub async fn read_from(stream: &mut DynStream) -> Result<Self, RealmError> {
        let msg_type = SyncMsgType::try_from(stream.read_u8().await?)?;

        let realm_len = stream.read_u16().await? as usize;
        if realm_len > MAX_REALM_STR {
            return Err(RealmError::Malformed("oversized realm field".to_string()));
        }
        let mut realm_raw = vec![0u8; realm_len];
        stream.read_exact(&mut realm_raw).await?;
        let realm_str = std::str::from_utf8(&realm_raw)
            .map_err(|_| RealmError::Malformed("realm field is not utf-8".to_string()))?;
        let realm = RealmId::from_hex(realm_str)
            .map_err(|_| RealmError::Malformed("realm field is not a realm id".to_string()))?;

        let mut from_bytes = [0u8; 32];
        stream.read_exact(&mut from_bytes).await?;
        let from = NodeId::new(from_bytes);
        let timestamp = stream.read_i64().await?;

        let payload_len = stream.read_u32().await? as usize;
        if payload_len > MAX_SYNC_PAYLOAD {
            return Err(RealmError::MessageTooLarge {
                len: payload_len,
                max: MAX_SYNC_PAYLOAD,
            });
        }
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await?;

        Ok(Self {
            msg_type,
            realm,
            from,
            timestamp,
            payload,
        })
    }
}

// ============================================================
// Member entries
// ============================================================

/// One roster entry as carried in member-list and join payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberEntry {
    /// The member.
    pub node: NodeId,
    /// When the member joined, Unix seconds.
    pub joined_at: i64,
    /// Known dialing addresses.
    pub addrs: Vec<PeerAddr>,
}

impl MemberEntry {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.node.as_bytes());
        out.extend_from_slice(&self.joined_at.to_be_bytes());
        out.extend_from_slice(&(self.addrs.len() as u16).to_be_bytes());
        for addr in &self.addrs {
            let s = addr.to_string();
            out.extend_from_slice(&(s.len() as u16).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, RealmError> {
        let truncated = || RealmError::Malformed("truncated member entry".to_string());

        if buf.remaining() < 32 + 8 + 2 {
            return Err(truncated());
        }
        let mut node_bytes = [0u8; 32];
        buf.copy_to_slice(&mut node_bytes);
        let node = NodeId::new(node_bytes);
        let joined_at = buf.get_i64();

        let addr_count = buf.get_u16() as usize;
        let mut addrs = Vec::with_capacity(addr_count.min(16));
        for _ in 0..addr_count {
            if buf.remaining() < 2 {
                return Err(truncated());
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(truncated());
            }
            let raw = buf.copy_to_bytes(len);
            let s = std::str::from_utf8(&raw)
                .map_err(|_| RealmError::Malformed("address is not utf-8".to_string()))?;
            let addr = PeerAddr::parse(s)
                .map_err(|e| RealmError::Malformed(format!("bad address: {e}")))?;
            addrs.push(addr);
        }

        Ok(Self {
            node,
            joined_at,
            addrs,
        })
    }

    /// Encode a list of entries as a member-list payload.
    pub fn encode_list(entries: &[MemberEntry]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for entry in entries {
            entry.encode_into(&mut out);
        }
        out
    }

    /// Decode a member-list payload.
    pub fn decode_list(bytes: &[u8]) -> Result<Vec<MemberEntry>, RealmError> {
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err(RealmError::Malformed("truncated member list".to_string()));
        }
        let count = buf.get_u16() as usize;
        let mut entries = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            entries.push(Self::decode_from(&mut buf)?);
        }
        if buf.has_remaining() {
            return Err(RealmError::Malformed(
                "trailing bytes in member list".to_string(),
            ));
        }
        Ok(entries)
    }

    /// Encode a single entry (join payload).
    pub fn encode_one(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decode a single entry (join payload).
    pub fn decode_one(bytes: &[u8]) -> Result<Self, RealmError> {
        let mut buf = bytes;
        let entry = Self::decode_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(RealmError::Malformed(
                "trailing bytes in member entry".to_string(),
            ));
        }
        Ok(entry)
    }
}

// ============================================================
// Service
// ============================================================

/// The roster surface the sync protocol needs from the manager.
///
/// Held weakly so the service never keeps the manager alive. Per-origin
/// message ordering is preserved because each inbound stream is handled
/// sequentially.
pub trait RosterView: Send + Sync {
    /// The currently joined realm, if any.
    fn current_realm_id(&self) -> Option<RealmId>;

    /// The local roster as wire entries (excluding callers who want it so).
    fn member_entries(&self, realm: &RealmId) -> Vec<MemberEntry>;

    /// Merge a learned entry, keeping the newest `joined_at` per node.
    fn apply_member_join(&self, realm: &RealmId, entry: MemberEntry);

    /// Remove a departed member.
    fn apply_member_leave(&self, realm: &RealmId, node: &NodeId);

    /// Apply a metadata update from a member.
    fn apply_metadata(&self, realm: &RealmId, from: &NodeId, payload: &[u8]);

    /// Refresh a member's last-seen stamp.
    fn touch_peer(&self, realm: &RealmId, node: &NodeId);
}

/// Configuration of the sync service.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Pull tick period.
    pub interval: Duration,
    /// How many peers each tick pulls from.
    pub fanout: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            fanout: DEFAULT_SYNC_FANOUT,
        }
    }
}

/// Peer-list exchange and join/leave gossip.
pub struct SyncService {
    local: NodeId,
    network: Arc<dyn Network>,
    roster: Mutex<Option<Weak<dyn RosterView>>>,
    config: SyncConfig,
    loop_running: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl SyncService {
    /// Create the service.
    pub fn new(local: NodeId, network: Arc<dyn Network>, config: SyncConfig) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            local,
            network,
            roster: Mutex::new(None),
            config,
            loop_running: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Attach the roster view (held weakly).
    pub fn set_roster(&self, roster: Weak<dyn RosterView>) {
        *self.roster.lock().expect("roster lock poisoned") = Some(roster);
    }

    fn roster(&self) -> Option<Arc<dyn RosterView>> {
        self.roster
            .lock()
            .expect("roster lock poisoned")
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    /// Start the periodic pull loop. Idempotent.
    pub fn spawn_loop(self: &Arc<Self>) {
        if self.loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Sync loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        service.sync_tick().await;
                    }
                }
            }
        });
    }

    /// Stop the pull loop.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
        self.loop_running.store(false, Ordering::SeqCst);
    }

    /// One pull round: ask a fan-out of known peers for their member list.
    pub async fn sync_tick(&self) {
        let Some(roster) = self.roster() else { return };
        let Some(realm) = roster.current_realm_id() else {
            return;
        };

        let peers: Vec<NodeId> = roster
            .member_entries(&realm)
            .into_iter()
            .map(|e| e.node)
            .filter(|n| *n != self.local)
            .take(self.config.fanout)
            .collect();

        for peer in peers {
            if let Err(err) = self.pull_from(peer).await {
                debug!(peer = %peer.short_id(), %err, "Member list pull failed");
            }
        }
    }

    /// Pull the member list from one peer, pushing ours in the same
    /// exchange.
    pub async fn pull_from(&self, peer: NodeId) -> Result<(), RealmError> {
        let roster = self.roster().ok_or(RealmError::NotMember)?;
        let realm = roster.current_realm_id().ok_or(RealmError::NotMember)?;

        let ours = roster.member_entries(&realm);
        let request = SyncMessage::new(
            SyncMsgType::MemberList,
            realm,
            self.local,
            MemberEntry::encode_list(&ours),
        );

        let mut stream = self.network.open_stream(peer, REALM_SYNC_PROTOCOL).await?;
        request.write_to(&mut stream).await?;

        let response = SyncMessage::read_from(&mut stream).await?;
        if response.msg_type != SyncMsgType::MemberList || response.realm != realm {
            return Err(RealmError::Malformed(
                "unexpected member list response".to_string(),
            ));
        }
        let entries = MemberEntry::decode_list(&response.payload)?;
        let count = entries.len();
        for entry in entries {
            if entry.node != self.local {
                roster.apply_member_join(&realm, entry);
            }
        }
        trace!(peer = %peer.short_id(), count, "Merged member list");
        Ok(())
    }

    /// Announce the local node's join to all known realm peers.
    pub async fn broadcast_join(&self, entry: MemberEntry) {
        let Some(roster) = self.roster() else { return };
        let Some(realm) = roster.current_realm_id() else {
            return;
        };
        let peers: Vec<NodeId> = roster
            .member_entries(&realm)
            .into_iter()
            .map(|e| e.node)
            .filter(|n| *n != self.local)
            .collect();
        self.broadcast_to(realm, peers, SyncMsgType::MemberJoin, entry.encode_one())
            .await;
    }

    /// Announce the local node's leave to the given peers.
    ///
    /// The realm and peer list are passed in because the caller has
    /// already torn the realm state down by the time this runs.
    pub async fn broadcast_leave(&self, realm: RealmId, peers: Vec<NodeId>) {
        self.broadcast_to(
            realm,
            peers,
            SyncMsgType::MemberLeave,
            self.local.as_bytes().to_vec(),
        )
        .await;
    }

    async fn broadcast_to(
        &self,
        realm: RealmId,
        peers: Vec<NodeId>,
        msg_type: SyncMsgType,
        payload: Vec<u8>,
    ) {
        for peer in peers {
            let message = SyncMessage::new(msg_type, realm, self.local, payload.clone());
            match self.network.open_stream(peer, REALM_SYNC_PROTOCOL).await {
                Ok(mut stream) => {
                    if let Err(err) = message.write_to(&mut stream).await {
                        debug!(peer = %peer.short_id(), %err, "Sync broadcast failed");
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.short_id(), %err, "Sync broadcast dial failed");
                }
            }
        }
    }

    /// Handle one inbound sync stream.
    ///
    /// Malformed or cross-realm messages are dropped silently (logged at
    /// debug), per the protocol contract.
    pub async fn handle_inbound(&self, conn: DynConnection, mut stream: DynStream) {
        let message = match SyncMessage::read_from(&mut stream).await {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %conn.remote_peer().short_id(), %err, "Dropping malformed sync message");
                return;
            }
        };

        let Some(roster) = self.roster() else { return };
        let Some(realm) = roster.current_realm_id() else {
            return;
        };
        if message.realm != realm {
            debug!(
                peer = %conn.remote_peer().short_id(),
                "Dropping sync message for foreign realm"
            );
            return;
        }

        match message.msg_type {
            SyncMsgType::MemberList => {
                if let Ok(entries) = MemberEntry::decode_list(&message.payload) {
                    for entry in entries {
                        if entry.node != self.local {
                            roster.apply_member_join(&realm, entry);
                        }
                    }
                } else {
                    debug!("Dropping malformed member list");
                    return;
                }

                // Answer with our roster so the exchange is symmetric.
                let ours = roster.member_entries(&realm);
                let response = SyncMessage::new(
                    SyncMsgType::MemberList,
                    realm,
                    self.local,
                    MemberEntry::encode_list(&ours),
                );
                if let Err(err) = response.write_to(&mut stream).await {
                    debug!(%err, "Member list response failed");
                }
            }
            SyncMsgType::MemberJoin => match MemberEntry::decode_one(&message.payload) {
                Ok(entry) if entry.node != self.local => {
                    roster.apply_member_join(&realm, entry);
                }
                Ok(_) => {}
                Err(err) => debug!(%err, "Dropping malformed member join"),
            },
            SyncMsgType::MemberLeave => match NodeId::from_bytes(&message.payload) {
                Ok(node) => roster.apply_member_leave(&realm, &node),
                Err(err) => debug!(%err, "Dropping malformed member leave"),
            },
            SyncMsgType::Metadata => {
                roster.apply_metadata(&realm, &message.from, &message.payload);
            }
            SyncMsgType::Heartbeat => {
                roster.touch_peer(&realm, &message.from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm(byte: u8) -> RealmId {
        RealmId::new([byte; 32])
    }

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 32])
    }

    fn entry(byte: u8) -> MemberEntry {
        MemberEntry {
            node: node(byte),
            joined_at: 1_700_000_000 + byte as i64,
            addrs: vec![PeerAddr::parse(&format!("/memory/{byte}")).unwrap()],
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let message = SyncMessage {
            msg_type: SyncMsgType::MemberJoin,
            realm: realm(1),
            from: node(2),
            timestamp: 1_700_000_123,
            payload: entry(3).encode_one(),
        };
        let bytes = message.encode();
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_message_rejects_truncation() {
        let message = SyncMessage::new(SyncMsgType::Heartbeat, realm(1), node(2), Vec::new());
        let bytes = message.encode();
        for len in [0, 1, 5, bytes.len() - 1] {
            assert!(SyncMessage::decode(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn test_message_rejects_unknown_type() {
        let mut bytes = SyncMessage::new(SyncMsgType::Heartbeat, realm(1), node(2), Vec::new())
            .encode();
        bytes[0] = 99;
        assert!(SyncMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_member_list_roundtrip() {
        let entries = vec![entry(1), entry(2), entry(3)];
        let payload = MemberEntry::encode_list(&entries);
        assert_eq!(MemberEntry::decode_list(&payload).unwrap(), entries);
    }

    #[test]
    fn test_empty_member_list() {
        let payload = MemberEntry::encode_list(&[]);
        assert!(MemberEntry::decode_list(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_member_entry_roundtrip() {
        let e = entry(7);
        assert_eq!(MemberEntry::decode_one(&e.encode_one()).unwrap(), e);
    }

    #[test]
    fn test_member_entry_no_addrs() {
        let e = MemberEntry {
            node: node(1),
            joined_at: 42,
            addrs: Vec::new(),
        };
        assert_eq!(MemberEntry::decode_one(&e.encode_one()).unwrap(), e);
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        use dep2p_core::mock::{MemoryHub, MemoryTransport};
        use dep2p_core::traits::{Listener, Transport};

        let hub = MemoryHub::new();
        let t_a: Arc<MemoryTransport> = hub.transport(node(1));
        let t_b = hub.transport(node(2));

        let listen_addr = hub.next_addr();
        let listener = t_b.listen(&listen_addr).await.unwrap();
        let conn_a = t_a.dial(&listen_addr, node(2)).await.unwrap();
        let conn_b = listener.accept().await.unwrap();

        let message = SyncMessage::new(
            SyncMsgType::MemberList,
            realm(1),
            node(1),
            MemberEntry::encode_list(&[entry(5)]),
        );

        let mut out = conn_a.open_stream(REALM_SYNC_PROTOCOL).await.unwrap();
        message.write_to(&mut out).await.unwrap();

        let mut inbound = conn_b.accept_stream().await.unwrap();
        let read = SyncMessage::read_from(&mut inbound).await.unwrap();
        assert_eq!(read, message);
    }
}
