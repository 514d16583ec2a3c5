//! Targeted history sync.
//!
//! The requester side turns confirmed gaps into range requests, coalescing
//! overlaps and retrying with bounded exponential backoff; inventory
//! requests discover what a peer holds when no bounds are known. The
//! responder side reads matching rows from the store, chunks them under the
//! frame size limit and rate-limits per requester to protect RF airtime.
//! Applied rows go through the same idempotent insert path as live
//! messages.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use qmesh_codec::{
    chat::{decode_chat_payload, encode_chat_payload},
    ChatPayload, NodeId, SyncMode, SyncRow,
};
use qmesh_events::{Event, EventBus, ShutdownSignal};
use qmesh_mesh::MeshNode;
use qmesh_store::{ChatStore, InsertOutcome, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::gap::{ConfirmedGap, GapDetector};
use crate::insert_with_retry;

/// Retry delays stop growing past this point.
const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Budget for the JSON body of one sync response, leaving headroom for the
/// mesh header and DATA framing under the 65535-byte frame bound.
const RESPONSE_BYTE_BUDGET: usize = 60_000;

/// How aggressively a channel repairs itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicyMode {
    /// Repair as soon as a gap confirms
    Eager,
    /// Queue repairs; emit only when no eager channel has outstanding work
    Deferred,
    /// Never initiate sync for this channel
    Off,
}

/// Per-channel sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSyncPolicy {
    /// Initiation mode
    pub mode: SyncPolicyMode,
    /// Most rows requested or returned in one exchange for this channel
    pub max_burst: usize,
}

impl Default for ChannelSyncPolicy {
    fn default() -> Self {
        ChannelSyncPolicy {
            mode: SyncPolicyMode::Eager,
            max_burst: 50,
        }
    }
}

/// Sync engine knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rows asked for by an inventory request
    pub inventory_last_n: usize,
    /// Base timeout before a request is retried, seconds
    pub request_timeout_s: u64,
    /// Attempts per range before giving up
    pub max_retries: u32,
    /// Forward progress beyond a hole that confirms it
    pub confirm_margin: u32,
    /// Seconds after which a stalled hole confirms anyway
    pub confirm_timeout_s: u64,
    /// Minimum seconds between responses to one requester
    pub responder_min_interval_s: u64,
    /// Row cap per response frame
    pub max_rows_per_response: usize,
    /// Seconds between engine ticks
    pub tick_interval_s: f64,
    /// Policy for channels without an explicit entry
    pub default_policy: ChannelSyncPolicy,
    /// Per-channel policy overrides
    pub per_channel: HashMap<String, ChannelSyncPolicy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            inventory_last_n: 200,
            request_timeout_s: 30,
            max_retries: 4,
            confirm_margin: 3,
            confirm_timeout_s: 120,
            responder_min_interval_s: 30,
            max_rows_per_response: 50,
            tick_interval_s: 1.0,
            default_policy: ChannelSyncPolicy::default(),
            per_channel: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct PendingRange {
    channel: String,
    origin: NodeId,
    start: u32,
    end: u32,
    remaining: BTreeSet<u32>,
    target: NodeId,
    attempts: u32,
    next_attempt: Instant,
    eager: bool,
}

impl PendingRange {
    fn overlaps(&self, channel: &str, origin: &NodeId, start: u32, end: u32) -> bool {
        self.channel == channel && self.origin == *origin && self.start <= end && start <= self.end
    }
}

#[derive(Debug, Default)]
struct SyncState {
    pending: Vec<PendingRange>,
    deferred: VecDeque<PendingRange>,
    last_heard: HashMap<String, NodeId>,
    responder_last: HashMap<NodeId, Instant>,
}

/// Requester, responder and applier for history sync.
pub struct SyncEngine {
    config: SyncConfig,
    nick: String,
    store: Arc<ChatStore>,
    mesh: Arc<MeshNode>,
    events: EventBus,
    gaps: Mutex<GapDetector>,
    state: Mutex<SyncState>,
    shutdown: ShutdownSignal,
}

impl SyncEngine {
    /// Build the engine. Gap baselines are seeded from persisted history so
    /// a restart does not re-detect everything before the last shutdown.
    pub fn new(
        config: SyncConfig,
        nick: String,
        store: Arc<ChatStore>,
        mesh: Arc<MeshNode>,
        events: EventBus,
    ) -> Arc<SyncEngine> {
        let mut gaps = GapDetector::new(
            config.confirm_margin,
            Duration::from_secs(config.confirm_timeout_s),
        );
        match store.max_seqnos() {
            Ok(seeds) => {
                for (channel, origin, highest) in seeds {
                    gaps.seed(&channel, origin, highest);
                }
            }
            Err(e) => warn!(error = %e, "could not seed gap baselines from store"),
        }

        Arc::new(SyncEngine {
            config,
            nick,
            store,
            mesh,
            events,
            gaps: Mutex::new(gaps),
            state: Mutex::new(SyncState::default()),
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Spawn the tick worker driving retries, deferred promotion and
    /// timeout-confirmed gaps.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("sync worker starting");
            let period = Duration::from_secs_f64(engine.config.tick_interval_s.max(0.01));
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => engine.tick(Instant::now()),
                    _ = engine.shutdown.wait() => break,
                }
            }
            info!("sync worker finished");
        });
    }

    /// Stop the tick worker. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Policy for a channel.
    pub fn policy(&self, channel: &str) -> ChannelSyncPolicy {
        self.config
            .per_channel
            .get(channel)
            .copied()
            .unwrap_or(self.config.default_policy)
    }

    /// Record a live message observation: remembers who we heard from and
    /// feeds the gap detector. Confirmed gaps are announced and scheduled.
    pub fn note_message(&self, channel: &str, origin: NodeId, seqno: u32) {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap()
            .last_heard
            .insert(channel.to_string(), origin);

        let confirmed = self
            .gaps
            .lock()
            .unwrap()
            .observe(channel, origin, seqno, now);
        for gap in confirmed {
            self.announce_and_schedule(gap, now);
        }
    }

    /// Send one inventory request for a channel to a concrete peer.
    pub fn request_inventory(&self, channel: &str, target: NodeId) {
        if self.policy(channel).mode == SyncPolicyMode::Off {
            return;
        }
        let payload = ChatPayload::SyncRequest {
            channel: channel.to_string(),
            nick: self.nick.clone(),
            mode: SyncMode::Inventory,
            origin_id_hex: target.to_hex(),
            start: None,
            end: None,
        };
        self.send_payload(target, &payload, "inventory request");
    }

    /// Issue startup inventory requests for explicitly configured eager
    /// channels toward a known peer.
    pub fn kick_startup_inventory(&self, default_target: Option<NodeId>) {
        let Some(target) = default_target else {
            debug!("no default peer; skipping startup inventory");
            return;
        };
        for (channel, policy) in self.config.per_channel.clone() {
            if policy.mode == SyncPolicyMode::Eager {
                self.request_inventory(&channel, target);
            }
        }
    }

    /// Responder half: answer a sync request addressed to this node.
    pub fn handle_request(
        &self,
        requester: NodeId,
        channel: &str,
        mode: SyncMode,
        origin_id_hex: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.responder_last.get(&requester) {
                let min_interval = Duration::from_secs(self.config.responder_min_interval_s);
                if now.duration_since(*last) < min_interval {
                    debug!(requester = %requester, "rate-limiting sync responder");
                    return;
                }
            }
            state.responder_last.insert(requester, now);
        }

        let rows = match mode {
            SyncMode::Range => {
                let Ok(origin) = NodeId::from_hex(origin_id_hex) else {
                    debug!(origin_id_hex, "sync request with bad origin id");
                    return;
                };
                let (Some(start), Some(end)) = (start, end) else {
                    debug!("range sync request without bounds");
                    return;
                };
                if start > end {
                    return;
                }
                self.store.get_range(channel, &origin, start, end)
            }
            SyncMode::Inventory => self.store.get_recent(channel, self.config.inventory_last_n),
        };
        let mut rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "store lookup for sync request failed");
                return;
            }
        };

        let burst = self.policy(channel).max_burst.max(1);
        rows.truncate(burst);
        if rows.is_empty() {
            debug!(channel, requester = %requester, "nothing stored for sync request");
            return;
        }

        let sync_rows: Vec<SyncRow> = rows.iter().map(row_to_sync).collect();
        for chunk in chunk_rows(sync_rows, self.config.max_rows_per_response.max(1)) {
            let count = chunk.len();
            let payload = ChatPayload::SyncResponse {
                channel: channel.to_string(),
                nick: self.nick.clone(),
                rows: chunk,
            };
            self.send_payload(requester, &payload, "sync response");
            debug!(channel, requester = %requester, count, "sync response chunk sent");
        }
    }

    /// Applier half: run received rows through the idempotent insert path.
    /// Emits the applied count, zero included.
    pub fn apply_response(&self, channel: &str, rows: Vec<SyncRow>) {
        let now = Instant::now();
        let mut applied = 0usize;

        for row in rows {
            let Ok(origin) = NodeId::from_hex(&row.origin_id_hex) else {
                debug!(origin_id_hex = %row.origin_id_hex, "sync row with bad origin id");
                continue;
            };
            let message = StoredMessage {
                origin,
                seqno: row.seqno,
                channel: channel.to_string(),
                nick: row.nick,
                text: row.text,
                created_ts: row.created_ts,
                local_insert_ts: now_ts(),
            };
            match insert_with_retry(&self.store, &message) {
                Ok(InsertOutcome::Inserted) => {
                    applied += 1;
                    // Suppress a live copy of the same frame at the mesh
                    // layer and let the filled seqno shrink tracked holes.
                    self.mesh.note_seen(origin, row.seqno);
                    let confirmed =
                        self.gaps
                            .lock()
                            .unwrap()
                            .observe(channel, origin, row.seqno, now);
                    for gap in confirmed {
                        self.announce_and_schedule(gap, now);
                    }
                }
                Ok(InsertOutcome::Duplicate) => {}
                Err(e) => {
                    warn!(error = %e, "sync row insert failed");
                    continue;
                }
            }
            self.settle_seqno(channel, &origin, row.seqno);
        }

        self.events.publish(Event::SyncApplied {
            channel: channel.to_string(),
            applied_count: applied,
        });
    }

    /// One engine tick: timeout-confirm gaps, promote deferred work when
    /// eager channels are quiet, retry due requests, shed finished and
    /// exhausted ones.
    fn tick(&self, now: Instant) {
        let timed_out = self.gaps.lock().unwrap().scan(now);
        for gap in timed_out {
            self.announce_and_schedule(gap, now);
        }

        let mut to_send: Vec<(NodeId, ChatPayload)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();

            state.pending.retain(|p| {
                if p.remaining.is_empty() {
                    debug!(channel = %p.channel, start = p.start, end = p.end, "range repaired");
                    return false;
                }
                if p.attempts >= self.config.max_retries && p.next_attempt <= now {
                    warn!(
                        channel = %p.channel,
                        origin = %p.origin,
                        start = p.start,
                        end = p.end,
                        attempts = p.attempts,
                        "giving up on range sync"
                    );
                    return false;
                }
                true
            });

            if !state.pending.iter().any(|p| p.eager) {
                if let Some(promoted) = state.deferred.pop_front() {
                    debug!(channel = %promoted.channel, "promoting deferred repair");
                    state.pending.push(promoted);
                }
            }

            let timeout = Duration::from_secs(self.config.request_timeout_s.max(1));
            for p in state.pending.iter_mut() {
                if p.next_attempt > now || p.attempts >= self.config.max_retries {
                    continue;
                }
                p.attempts += 1;
                let backoff = timeout
                    .checked_mul(1u32 << (p.attempts - 1).min(16))
                    .unwrap_or(BACKOFF_CAP)
                    .min(BACKOFF_CAP);
                p.next_attempt = now + backoff;

                let payload = ChatPayload::SyncRequest {
                    channel: p.channel.clone(),
                    nick: self.nick.clone(),
                    mode: SyncMode::Range,
                    origin_id_hex: p.origin.to_hex(),
                    start: Some(p.start),
                    end: Some(p.end),
                };
                to_send.push((p.target, payload));
            }
        }

        for (target, payload) in to_send {
            self.send_payload(target, &payload, "range request");
        }
    }

    fn announce_and_schedule(&self, gap: ConfirmedGap, now: Instant) {
        self.events.publish(Event::GapDetected {
            channel: gap.channel.clone(),
            origin: gap.origin,
            start: gap.start,
            end: gap.end,
        });

        let policy = self.policy(&gap.channel);
        if policy.mode == SyncPolicyMode::Off {
            return;
        }

        // Honor the channel's burst bound; the tail of an oversized hole
        // will confirm again once the first slice is repaired.
        let end = gap
            .end
            .min(gap.start.saturating_add(policy.max_burst.max(1) as u32 - 1));

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let merged = state
            .pending
            .iter_mut()
            .chain(state.deferred.iter_mut())
            .find(|p| p.overlaps(&gap.channel, &gap.origin, gap.start, end));
        if let Some(existing) = merged {
            // Never reissue an overlapping range; widen the one in flight.
            existing.start = existing.start.min(gap.start);
            existing.end = existing.end.max(end);
            existing.remaining.extend(gap.start..=end);
            return;
        }

        let target = state
            .last_heard
            .get(&gap.channel)
            .copied()
            .unwrap_or(gap.origin);
        let eager = policy.mode == SyncPolicyMode::Eager;
        let range = PendingRange {
            channel: gap.channel.clone(),
            origin: gap.origin,
            start: gap.start,
            end,
            remaining: (gap.start..=end).collect(),
            target,
            attempts: 0,
            next_attempt: now,
            eager,
        };
        info!(
            channel = %gap.channel,
            origin = %gap.origin,
            start = gap.start,
            end,
            deferred = !eager,
            "scheduling range repair"
        );
        if eager {
            state.pending.push(range);
        } else {
            state.deferred.push_back(range);
        }
    }

    fn settle_seqno(&self, channel: &str, origin: &NodeId, seqno: u32) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for p in state
            .pending
            .iter_mut()
            .chain(state.deferred.iter_mut())
        {
            if p.channel == channel && p.origin == *origin {
                p.remaining.remove(&seqno);
            }
        }
    }

    fn send_payload(&self, target: NodeId, payload: &ChatPayload, what: &str) {
        let bytes = match encode_chat_payload(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "could not encode {}", what);
                return;
            }
        };
        if let Err(e) = self.mesh.send_application_data(target, &bytes) {
            warn!(target = %target, error = %e, "could not send {}", what);
        }
    }

    /// Number of ranges currently awaiting repair, for diagnostics.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pending.len() + state.deferred.len()
    }
}

/// Split rows into chunks bounded by both a row cap and the response byte
/// budget.
fn chunk_rows(rows: Vec<SyncRow>, max_rows: usize) -> Vec<Vec<SyncRow>> {
    let mut chunks = Vec::new();
    let mut current: Vec<SyncRow> = Vec::new();
    let mut current_bytes = 0usize;

    for row in rows {
        let row_bytes = serde_json::to_string(&row).map(|s| s.len() + 1).unwrap_or(256);
        let over_rows = current.len() >= max_rows;
        let over_bytes = !current.is_empty() && current_bytes + row_bytes > RESPONSE_BYTE_BUDGET;
        if over_rows || over_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += row_bytes;
        current.push(row);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn row_to_sync(row: &StoredMessage) -> SyncRow {
    SyncRow {
        origin_id_hex: row.origin.to_hex(),
        seqno: row.seqno,
        nick: row.nick.clone(),
        text: row.text.clone(),
        created_ts: row.created_ts,
    }
}

/// Decode an inbound DATA payload as a chat envelope, if it is one.
pub(crate) fn decode_envelope(payload: &[u8]) -> Option<ChatPayload> {
    match decode_chat_payload(payload) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(error = %e, "undecodable chat payload");
            None
        }
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(seqno: u32, text_len: usize) -> SyncRow {
        SyncRow {
            origin_id_hex: "4e4f43414c4c2d31".to_string(),
            seqno,
            nick: "NOCALL-1".to_string(),
            text: "x".repeat(text_len),
            created_ts: 1_700_000_000,
        }
    }

    #[test]
    fn test_chunk_rows_by_count() {
        let rows: Vec<_> = (1..=10).map(|s| sample_row(s, 10)).collect();
        let chunks = chunk_rows(rows, 4);
        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_chunk_rows_by_bytes() {
        // Each row is ~20 KiB of text; three must not share a chunk.
        let rows: Vec<_> = (1..=3).map(|s| sample_row(s, 20_000)).collect();
        let chunks = chunk_rows(rows, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| {
            let payload = ChatPayload::SyncResponse {
                channel: "#general".to_string(),
                nick: "NOCALL-1".to_string(),
                rows: chunk.clone(),
            };
            encode_chat_payload(&payload).unwrap().len() < 65_000
        }));
    }

    #[test]
    fn test_chunk_rows_single_oversize_row_still_emitted() {
        let rows = vec![sample_row(1, 70_000)];
        let chunks = chunk_rows(rows, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn test_pending_overlap() {
        let origin = NodeId::from_callsign("KD9YQK-1").unwrap();
        let p = PendingRange {
            channel: "#general".to_string(),
            origin,
            start: 142,
            end: 147,
            remaining: (142..=147).collect(),
            target: origin,
            attempts: 0,
            next_attempt: Instant::now(),
            eager: true,
        };
        assert!(p.overlaps("#general", &origin, 145, 150));
        assert!(p.overlaps("#general", &origin, 140, 142));
        assert!(!p.overlaps("#general", &origin, 148, 150));
        assert!(!p.overlaps("#other", &origin, 145, 150));
    }
}
