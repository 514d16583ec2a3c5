//! Chat client: the seam between the mesh node and the chat store.
//!
//! Outbound messages become DATA payloads addressed to a concrete peer;
//! inbound deliveries are decoded and dispatched by payload type. The node
//! mode gates local behavior only: a relay or monitor decodes just enough
//! to emit observational events and never originates, stores or syncs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use qmesh_codec::{
    chat::{encode_chat_payload, is_dm_channel},
    ChatPayload, NodeId,
};
use qmesh_events::{Event, EventBus, ShutdownSignal};
use qmesh_mesh::{Delivered, MeshNode};
use qmesh_store::{ChatStore, InsertOutcome, StoredMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ChatResult};
use crate::insert_with_retry;
use crate::sync::{decode_envelope, SyncEngine};

/// How often the retention worker wakes up.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Local role of this node. Never alters on-the-wire behavior for traffic
/// in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Originate, store, sync: full participation
    Full,
    /// Forward only; no chat origination, storage or sync
    Relay,
    /// Forward like relay, with extra receive diagnostics
    Monitor,
}

/// Retention policy for stored history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Whether pruning runs at all
    pub enabled: bool,
    /// Rows older than this many days are pruned
    pub days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            enabled: false,
            days: 30,
        }
    }
}

/// Chat layer settings.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Nickname stamped on outbound messages
    pub nick: String,
    /// Local role
    pub mode: NodeMode,
    /// Known peers: nickname to node id
    pub peers: HashMap<String, NodeId>,
    /// Peer that receives channel (non-DM) traffic
    pub default_peer: Option<String>,
    /// Retention policy
    pub retention: RetentionConfig,
}

/// Chat client bound to one mesh node and one store.
pub struct ChatClient {
    node_id: NodeId,
    nick: String,
    mode: NodeMode,
    peers: HashMap<String, NodeId>,
    default_peer: Option<NodeId>,
    retention: RetentionConfig,
    mesh: Arc<MeshNode>,
    store: Arc<ChatStore>,
    sync: Arc<SyncEngine>,
    events: EventBus,
    shutdown: ShutdownSignal,
}

impl ChatClient {
    /// Build the client.
    pub fn new(
        config: ChatConfig,
        mesh: Arc<MeshNode>,
        store: Arc<ChatStore>,
        sync: Arc<SyncEngine>,
        events: EventBus,
    ) -> ChatResult<Arc<ChatClient>> {
        let default_peer = match &config.default_peer {
            Some(nick) => Some(
                config
                    .peers
                    .get(nick)
                    .copied()
                    .ok_or_else(|| ChatError::UnknownPeer(nick.clone()))?,
            ),
            None => None,
        };
        Ok(Arc::new(ChatClient {
            node_id: mesh.node_id(),
            nick: config.nick,
            mode: config.mode,
            peers: config.peers,
            default_peer,
            retention: config.retention,
            mesh,
            store,
            sync,
            events,
            shutdown: ShutdownSignal::new(),
        }))
    }

    /// Spawn the inbound dispatch worker and, in full mode, retention.
    pub fn start(self: &Arc<Self>, delivery_rx: mpsc::Receiver<Delivered>) {
        tokio::spawn(Arc::clone(self).run_inbound(delivery_rx));
        if self.mode == NodeMode::Full && self.retention.enabled {
            tokio::spawn(Arc::clone(self).run_retention());
        }
        info!(mode = ?self.mode, nick = %self.nick, "chat client started");
    }

    /// Stop the workers. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// This node's mode.
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Send a chat message on a channel or DM key. Full mode only.
    ///
    /// Returns the seqno the mesh assigned. The message is stored locally
    /// before this returns; store failures surface to the caller.
    pub fn send_chat(&self, channel: &str, text: &str) -> ChatResult<u32> {
        if self.mode != NodeMode::Full {
            return Err(ChatError::WrongMode(self.mode));
        }
        let dest = self.resolve_dest(channel)?;
        let created_ts = now_ts();

        let payload = ChatPayload::Chat {
            channel: channel.to_string(),
            nick: self.nick.clone(),
            text: text.to_string(),
            created_ts,
        };
        let bytes = encode_chat_payload(&payload)?;
        let seqno = self.mesh.send_application_data(dest, &bytes)?;

        let row = StoredMessage {
            origin: self.node_id,
            seqno,
            channel: channel.to_string(),
            nick: self.nick.clone(),
            text: text.to_string(),
            created_ts,
            local_insert_ts: created_ts,
        };
        insert_with_retry(&self.store, &row)?;

        self.events.publish(Event::MessageSent {
            channel: channel.to_string(),
            dest,
            seqno,
        });
        Ok(seqno)
    }

    /// Recent display-ordered history for a channel.
    pub fn history(&self, channel: &str, limit: usize) -> ChatResult<Vec<StoredMessage>> {
        Ok(self.store.get_recent(channel, limit)?)
    }

    /// Channels and DM keys with stored history, most recent first.
    pub fn channels(&self) -> ChatResult<Vec<String>> {
        Ok(self.store.list_channels()?)
    }

    /// Where a message on this channel goes.
    ///
    /// A `@NICK` DM resolves through the peer directory first, then by
    /// deriving the node id from the callsign itself, so any station can be
    /// messaged directly. Channel traffic goes to the configured default
    /// peer and reaches the rest of the mesh through sync.
    fn resolve_dest(&self, channel: &str) -> ChatResult<NodeId> {
        if is_dm_channel(channel) {
            let nick = &channel[1..];
            if let Some(node_id) = self.peers.get(nick) {
                return Ok(*node_id);
            }
            return NodeId::from_callsign(nick)
                .map_err(|_| ChatError::UnknownPeer(nick.to_string()));
        }
        self.default_peer.ok_or(ChatError::NoDefaultPeer)
    }

    async fn run_inbound(self: Arc<Self>, mut delivery_rx: mpsc::Receiver<Delivered>) {
        info!("chat inbound worker starting");
        loop {
            tokio::select! {
                maybe = delivery_rx.recv() => match maybe {
                    Some(delivered) => self.handle_delivered(delivered),
                    None => break,
                },
                _ = self.shutdown.wait() => break,
            }
        }
        info!("chat inbound worker finished");
    }

    fn handle_delivered(&self, delivered: Delivered) {
        let Some(payload) = decode_envelope(&delivered.payload) else {
            return;
        };

        if self.mode == NodeMode::Monitor {
            debug!(
                origin = %delivered.origin,
                seqno = delivered.data_seqno,
                channel = payload.channel(),
                "monitor: observed chat traffic"
            );
        }

        match payload {
            ChatPayload::Chat {
                channel,
                nick,
                text,
                created_ts,
            } => {
                self.events.publish(Event::MessageReceived {
                    channel: channel.clone(),
                    origin: delivered.origin,
                    seqno: delivered.data_seqno,
                    nick: nick.clone(),
                });
                if self.mode != NodeMode::Full {
                    return;
                }

                let row = StoredMessage {
                    origin: delivered.origin,
                    seqno: delivered.data_seqno,
                    channel: channel.clone(),
                    nick,
                    text,
                    created_ts,
                    local_insert_ts: now_ts(),
                };
                match insert_with_retry(&self.store, &row) {
                    Ok(InsertOutcome::Inserted) => {
                        self.events.publish(Event::MessageStored {
                            channel: channel.clone(),
                            origin: delivered.origin,
                            seqno: delivered.data_seqno,
                        });
                        self.sync
                            .note_message(&channel, delivered.origin, delivered.data_seqno);
                    }
                    Ok(InsertOutcome::Duplicate) => {
                        debug!(
                            origin = %delivered.origin,
                            seqno = delivered.data_seqno,
                            "duplicate chat row ignored"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "chat row insert failed, frame dropped");
                    }
                }
            }
            ChatPayload::SyncRequest {
                channel,
                mode,
                origin_id_hex,
                start,
                end,
                ..
            } => {
                if self.mode != NodeMode::Full {
                    return;
                }
                self.sync.handle_request(
                    delivered.origin,
                    &channel,
                    mode,
                    &origin_id_hex,
                    start,
                    end,
                );
            }
            ChatPayload::SyncResponse { channel, rows, .. } => {
                if self.mode != NodeMode::Full {
                    return;
                }
                self.sync.apply_response(&channel, rows);
            }
        }
    }

    async fn run_retention(self: Arc<Self>) {
        info!(days = self.retention.days, "retention worker starting");
        let mut tick = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cutoff = now_ts().saturating_sub(self.retention.days as u64 * 86_400);
                    match self.store.prune_older_than(cutoff) {
                        Ok(deleted) => {
                            self.events.publish(Event::PruneExecuted {
                                deleted_rows: deleted,
                            });
                        }
                        Err(e) => warn!(error = %e, "retention prune failed"),
                    }
                }
                _ = self.shutdown.wait() => break,
            }
        }
        info!("retention worker finished");
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
