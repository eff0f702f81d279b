//! Reliable-delivery state machine.
//!
//! Tracks every unacknowledged reliable send per destination. A periodic
//! tick scans for expired deadlines and either schedules a retransmit or,
//! once the retry budget is gone, dead-letters the entry. The tracker never
//! touches the network itself: [`PendingTracker::tick`] returns the staged
//! [`TrackerEvent`]s and the engine forwards them, keeping the dependency
//! one-way.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

/// Capacity of the in-memory dead-letter ring.
const DEAD_LETTER_CAP: usize = 128;

/// The only exhaustion reason emitted today.
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";

/// One unacknowledged reliable send, keyed by `(message_id, receiver_id)`.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Wire-ready bytes, re-sent verbatim on every retry.
    pub packet: Vec<u8>,
    pub to: SocketAddr,
    pub message_id: i64,
    pub receiver_id: String,
    pub retries_left: u32,
    pub attempt: u32,
    pub base_timeout_ms: u64,
    pub deadline_ms: i64,
    pub exponential_backoff: bool,
}

/// A send that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: i64,
    pub receiver_id: String,
    pub packet: Vec<u8>,
    pub failed_at_ms: i64,
}

/// What a tick decided; the engine forwards these.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Resend {
        to: SocketAddr,
        packet: Vec<u8>,
        message_id: i64,
        receiver_id: String,
        attempt: u32,
    },
    Failed {
        message_id: i64,
        receiver_id: String,
    },
    DeadLettered {
        message_id: i64,
        receiver_id: String,
        attempts: u32,
        reason: &'static str,
    },
}

#[derive(Debug)]
pub struct PendingTracker {
    pending: HashMap<(i64, String), PendingEntry>,
    dead_letters: VecDeque<DeadLetter>,
    deadletter_path: Option<PathBuf>,
    ack_count: u64,
}

impl PendingTracker {
    /// `deadletter_path` names the append-only NDJSON stream; `None`
    /// disables the persistent record (the in-memory ring stays on).
    pub fn new(deadletter_path: Option<PathBuf>) -> PendingTracker {
        PendingTracker {
            pending: HashMap::new(),
            dead_letters: VecDeque::new(),
            deadletter_path,
            ack_count: 0,
        }
    }

    /// Register a send for tracking. At most one entry per key; re-tracking
    /// the same `(message_id, receiver)` replaces the earlier entry.
    pub fn track(&mut self, entry: PendingEntry) {
        self.pending
            .insert((entry.message_id, entry.receiver_id.clone()), entry);
    }

    /// Match an acknowledgement. Returns true when an entry was retired;
    /// unmatched and late acks are no-ops.
    pub fn ack_received(&mut self, message_id: i64, receiver_id: &str) -> bool {
        let removed = self
            .pending
            .remove(&(message_id, receiver_id.to_owned()))
            .is_some();
        if removed {
            self.ack_count += 1;
        }
        removed
    }

    /// Scan for expired deadlines.
    ///
    /// Mutations are staged during the scan and applied afterwards so the
    /// traversal is never invalidated. With backoff enabled the next timeout
    /// is `base * 2^min(attempt, 10)`.
    pub fn tick(&mut self, now_ms: i64) -> Vec<TrackerEvent> {
        let mut to_resend: Vec<(i64, String)> = Vec::new();
        let mut exhausted: Vec<(i64, String)> = Vec::new();

        for (key, entry) in &self.pending {
            if now_ms < entry.deadline_ms {
                continue;
            }
            if entry.retries_left > 0 {
                to_resend.push(key.clone());
            } else {
                exhausted.push(key.clone());
            }
        }

        let mut events = Vec::new();

        for key in to_resend {
            if let Some(entry) = self.pending.get_mut(&key) {
                entry.attempt += 1;
                entry.retries_left -= 1;
                let next = if entry.exponential_backoff {
                    entry
                        .base_timeout_ms
                        .saturating_mul(1u64 << entry.attempt.min(10))
                } else {
                    entry.base_timeout_ms
                };
                entry.deadline_ms = now_ms + next as i64;
                events.push(TrackerEvent::Resend {
                    to: entry.to,
                    packet: entry.packet.clone(),
                    message_id: entry.message_id,
                    receiver_id: entry.receiver_id.clone(),
                    attempt: entry.attempt,
                });
            }
        }

        for key in exhausted {
            if let Some(entry) = self.pending.remove(&key) {
                if self.dead_letters.len() >= DEAD_LETTER_CAP {
                    self.dead_letters.pop_front();
                }
                self.append_dead_letter(entry.message_id, &entry.receiver_id, entry.attempt, now_ms);
                self.dead_letters.push_back(DeadLetter {
                    message_id: entry.message_id,
                    receiver_id: entry.receiver_id.clone(),
                    packet: entry.packet,
                    failed_at_ms: now_ms,
                });
                events.push(TrackerEvent::Failed {
                    message_id: entry.message_id,
                    receiver_id: entry.receiver_id.clone(),
                });
                events.push(TrackerEvent::DeadLettered {
                    message_id: entry.message_id,
                    receiver_id: entry.receiver_id,
                    attempts: entry.attempt,
                    reason: REASON_MAX_RETRIES,
                });
            }
        }

        events
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dead_letters(&self) -> &VecDeque<DeadLetter> {
        &self.dead_letters
    }

    pub fn ack_count(&self) -> u64 {
        self.ack_count
    }

    /// One NDJSON line per exhausted send; append-only, best effort.
    fn append_dead_letter(&self, message_id: i64, receiver_id: &str, attempts: u32, now_ms: i64) {
        let Some(path) = &self.deadletter_path else {
            return;
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let line = serde_json::json!({
            "ts": now_ms,
            "message_id": message_id,
            "receiver": receiver_id,
            "attempts": attempts,
            "reason": REASON_MAX_RETRIES,
        });
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(mut f) => {
                use std::io::Write;
                if let Err(e) = writeln!(f, "{}", line) {
                    warn!(error = %e, path = %path.display(), "dead-letter append failed");
                }
            }
            Err(e) => warn!(error = %e, path = %path.display(), "dead-letter file open failed"),
        }
    }
}
