//! Per-channel sequence tracking and confirmed-gap classification.
//!
//! Seqnos from a given origin on a given channel should arrive as an
//! unbroken run. A hole is first only *suspected*: reordering across paths
//! is normal and the missing rows may still be in flight. A hole becomes
//! **confirmed**, and therefore worth repairing, once the origin has
//! demonstrably moved on: either its highest observed seqno sits at least
//! `confirm_margin` beyond the hole's end, or `confirm_timeout` has passed
//! since the hole was first seen. Each hole is reported at most once.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use qmesh_codec::NodeId;

/// Holes tracked per `(channel, origin)` before the oldest are shed.
const MAX_TRACKED_HOLES: usize = 64;

/// A hole that met the confirmation criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedGap {
    /// Channel the rows belong to
    pub channel: String,
    /// Origin whose rows are missing
    pub origin: NodeId,
    /// First missing seqno
    pub start: u32,
    /// Last missing seqno
    pub end: u32,
}

#[derive(Debug, Clone)]
struct Hole {
    start: u32,
    end: u32,
    first_seen: Instant,
    reported: bool,
}

#[derive(Debug, Default)]
struct OriginState {
    highest_seen: u32,
    holes: Vec<Hole>,
}

/// Sequence tracker over every `(channel, origin)` pair.
#[derive(Debug)]
pub struct GapDetector {
    confirm_margin: u32,
    confirm_timeout: Duration,
    state: HashMap<(String, NodeId), OriginState>,
}

impl GapDetector {
    /// Build a detector with the given confirmation policy.
    pub fn new(confirm_margin: u32, confirm_timeout: Duration) -> Self {
        GapDetector {
            confirm_margin: confirm_margin.max(1),
            confirm_timeout,
            state: HashMap::new(),
        }
    }

    /// Install a baseline from persisted history. Seqnos at or below the
    /// baseline are treated as accounted for; only forward progress from
    /// here can open holes.
    pub fn seed(&mut self, channel: &str, origin: NodeId, highest: u32) {
        self.state
            .entry((channel.to_string(), origin))
            .or_insert_with(|| OriginState {
                highest_seen: highest,
                holes: Vec::new(),
            });
    }

    /// Record an observed seqno. Returns any holes this observation
    /// confirmed via the forward-progress margin.
    pub fn observe(
        &mut self,
        channel: &str,
        origin: NodeId,
        seqno: u32,
        now: Instant,
    ) -> Vec<ConfirmedGap> {
        let key = (channel.to_string(), origin);
        let state = match self.state.entry(key) {
            Entry::Vacant(vacant) => {
                // First contact with this origin on this channel. History
                // before this point is discovery territory for inventory
                // sync, not a hole.
                vacant.insert(OriginState {
                    highest_seen: seqno,
                    holes: Vec::new(),
                });
                return Vec::new();
            }
            Entry::Occupied(occupied) => occupied.into_mut(),
        };

        if seqno > state.highest_seen {
            if seqno > state.highest_seen + 1 {
                state.holes.push(Hole {
                    start: state.highest_seen + 1,
                    end: seqno - 1,
                    first_seen: now,
                    reported: false,
                });
                if state.holes.len() > MAX_TRACKED_HOLES {
                    state.holes.remove(0);
                }
            }
            state.highest_seen = seqno;
        } else {
            fill(state, seqno);
        }

        confirm(state, channel, origin, self.confirm_margin, None, now)
    }

    /// Confirm holes whose timeout elapsed without forward progress.
    pub fn scan(&mut self, now: Instant) -> Vec<ConfirmedGap> {
        let timeout = self.confirm_timeout;
        let margin = self.confirm_margin;
        let mut confirmed = Vec::new();
        for ((channel, origin), state) in self.state.iter_mut() {
            confirmed.extend(confirm(state, channel, *origin, margin, Some(timeout), now));
        }
        confirmed
    }

    /// Highest seqno observed for a pair, if any.
    pub fn highest_seen(&self, channel: &str, origin: &NodeId) -> Option<u32> {
        self.state
            .get(&(channel.to_string(), *origin))
            .map(|s| s.highest_seen)
    }
}

/// A late arrival lands inside a tracked hole: shrink or split it.
fn fill(state: &mut OriginState, seqno: u32) {
    let Some(idx) = state
        .holes
        .iter()
        .position(|h| h.start <= seqno && seqno <= h.end)
    else {
        return;
    };
    let hole = state.holes[idx].clone();
    state.holes.remove(idx);

    if hole.start < seqno {
        state.holes.insert(
            idx,
            Hole {
                start: hole.start,
                end: seqno - 1,
                ..hole
            },
        );
    }
    if seqno < hole.end {
        state.holes.push(Hole {
            start: seqno + 1,
            end: hole.end,
            ..hole
        });
    }
}

fn confirm(
    state: &mut OriginState,
    channel: &str,
    origin: NodeId,
    margin: u32,
    timeout: Option<Duration>,
    now: Instant,
) -> Vec<ConfirmedGap> {
    let highest = state.highest_seen;
    let mut confirmed = Vec::new();
    for hole in state.holes.iter_mut().filter(|h| !h.reported) {
        let by_margin = highest >= hole.end.saturating_add(margin);
        let by_timeout = timeout
            .map(|t| now.duration_since(hole.first_seen) >= t)
            .unwrap_or(false);
        if by_margin || by_timeout {
            hole.reported = true;
            confirmed.push(ConfirmedGap {
                channel: channel.to_string(),
                origin,
                start: hole.start,
                end: hole.end,
            });
        }
    }
    // Reported holes stay resident so refills do not re-open them; they
    // leave when fills consume them or the tracker sheds the oldest.
    confirmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(callsign: &str) -> NodeId {
        NodeId::from_callsign(callsign).unwrap()
    }

    fn detector() -> GapDetector {
        GapDetector::new(3, Duration::from_secs(120))
    }

    #[test]
    fn test_contiguous_sequence_raises_nothing() {
        let mut d = detector();
        let now = Instant::now();
        for seqno in 1..=10 {
            assert!(d.observe("#general", id("KD9YQK-1"), seqno, now).is_empty());
        }
        assert_eq!(d.highest_seen("#general", &id("KD9YQK-1")), Some(10));
    }

    #[test]
    fn test_first_contact_is_baseline_not_gap() {
        let mut d = detector();
        let gaps = d.observe("#general", id("KD9YQK-1"), 141, Instant::now());
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_hole_confirmed_by_forward_margin() {
        let mut d = detector();
        let now = Instant::now();
        d.seed("#general", id("KD9YQK-1"), 141);

        // 142..147 go missing when 148 arrives.
        assert!(d.observe("#general", id("KD9YQK-1"), 148, now).is_empty());
        assert!(d.observe("#general", id("KD9YQK-1"), 149, now).is_empty());

        // Margin is 3 past the hole end: 150 tips it.
        let gaps = d.observe("#general", id("KD9YQK-1"), 150, now);
        assert_eq!(
            gaps,
            vec![ConfirmedGap {
                channel: "#general".to_string(),
                origin: id("KD9YQK-1"),
                start: 142,
                end: 147,
            }]
        );

        // Once reported, never again.
        assert!(d.observe("#general", id("KD9YQK-1"), 151, now).is_empty());
    }

    #[test]
    fn test_hole_confirmed_by_timeout() {
        let mut d = detector();
        let t0 = Instant::now();
        d.seed("#general", id("KD9YQK-1"), 10);
        d.observe("#general", id("KD9YQK-1"), 12, t0);

        assert!(d.scan(t0 + Duration::from_secs(60)).is_empty());
        let gaps = d.scan(t0 + Duration::from_secs(120));
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].start, gaps[0].end), (11, 11));
        assert!(d.scan(t0 + Duration::from_secs(240)).is_empty());
    }

    #[test]
    fn test_late_arrival_shrinks_hole() {
        let mut d = detector();
        let now = Instant::now();
        d.seed("#general", id("KD9YQK-1"), 100);
        d.observe("#general", id("KD9YQK-1"), 106, now);

        // 103 straggles in, splitting 101..105 into 101..102 and 104..105.
        d.observe("#general", id("KD9YQK-1"), 103, now);

        let gaps = d.observe("#general", id("KD9YQK-1"), 109, now);
        let mut ranges: Vec<_> = gaps.iter().map(|g| (g.start, g.end)).collect();
        ranges.sort();
        assert_eq!(ranges, vec![(101, 102), (104, 105)]);
    }

    #[test]
    fn test_fully_filled_hole_never_confirms() {
        let mut d = detector();
        let t0 = Instant::now();
        d.seed("#general", id("KD9YQK-1"), 10);
        d.observe("#general", id("KD9YQK-1"), 12, t0);
        d.observe("#general", id("KD9YQK-1"), 11, t0);

        assert!(d.observe("#general", id("KD9YQK-1"), 20, t0).is_empty());
        assert!(d.scan(t0 + Duration::from_secs(600)).is_empty());
    }

    #[test]
    fn test_channels_and_origins_tracked_independently() {
        let mut d = detector();
        let now = Instant::now();
        d.seed("#general", id("KD9YQK-1"), 5);
        d.seed("#other", id("KD9YQK-1"), 5);

        d.observe("#general", id("KD9YQK-1"), 7, now);
        let gaps = d.observe("#general", id("KD9YQK-1"), 10, now);
        assert_eq!(gaps.len(), 1);

        // Same origin, other channel: unaffected.
        assert!(d.observe("#other", id("KD9YQK-1"), 6, now).is_empty());
        // Same channel, other origin: independent baseline.
        assert!(d.observe("#general", id("NOCALL-1"), 50, now).is_empty());
    }

    #[test]
    fn test_hole_ledger_stays_bounded() {
        let mut d = detector();
        let now = Instant::now();
        d.seed("#flood", id("FLOOD-1"), 0);
        // Every other seqno missing: thousands of single-seqno holes.
        for seqno in (2..5000u32).step_by(2) {
            d.observe("#flood", id("FLOOD-1"), seqno, now);
        }
        let state = d.state.get(&("#flood".to_string(), id("FLOOD-1"))).unwrap();
        assert!(state.holes.len() <= MAX_TRACKED_HOLES);
    }
}
