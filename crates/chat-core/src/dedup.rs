use std::collections::HashSet;

use crate::types::{ChatMap, PollBatch};

/// Result of folding one poll response against the previous cycle's IDs.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    /// Messages per user whose ID was not seen in the previous cycle.
    pub batch: PollBatch,
    /// Every message ID in this response, new or not.
    pub seen_ids: HashSet<String>,
    /// Highest message timestamp, never below the watermark the cycle started from.
    pub max_timestamp: f64,
}

impl CycleOutcome {
    /// Number of new messages across all users.
    pub fn new_message_count(&self) -> usize {
        self.batch.values().map(Vec::len).sum()
    }
}

/// Split a poll response into notify-worthy messages and the next known-ID set.
///
/// `previous_ids` must be the set from the previous cycle; the caller replaces
/// it with `seen_ids` afterwards. Users with an empty message list are left
/// out of the batch, users whose messages were all seen map to an empty list.
pub fn fold_cycle(previous_ids: &HashSet<String>, chats: ChatMap, watermark: f64) -> CycleOutcome {
    let mut batch = PollBatch::with_capacity(chats.len());
    let mut seen_ids = HashSet::new();
    let mut max_timestamp = watermark;

    for (user, messages) in chats {
        if messages.is_empty() {
            continue;
        }

        let mut fresh = Vec::new();
        for message in messages {
            seen_ids.insert(message.id.clone());
            max_timestamp = max_timestamp.max(message.timestamp);
            if !previous_ids.contains(&message.id) {
                fresh.push(message);
            }
        }
        batch.insert(user, fresh);
    }

    CycleOutcome {
        batch,
        seen_ids,
        max_timestamp,
    }
}

/// Next watermark after a cycle whose newest message is `max_timestamp`.
///
/// A watermark lagging `now` by more than `drift_limit_secs` jumps to `now`,
/// so a quiet channel does not keep requesting an ever-growing window.
pub fn advance_watermark(max_timestamp: f64, now: f64, drift_limit_secs: f64) -> f64 {
    if max_timestamp + drift_limit_secs < now {
        now
    } else {
        max_timestamp
    }
}
