//! FIFO group sequencer.
//!
//! For a fifo queue, at most one message per group key may be leased at a
//! time, and messages within a group are delivered in enqueue (id) order.
//! The sequencer tracks, per group, the ordered pending list and the id of
//! the currently leased message. Different groups never gate each other.
//!
//! The sequencer is advisory: the store's conditional claim remains the
//! authority on whether a grant actually happens. Pending lists are kept
//! sorted by id — registration happens after the enqueue commits, so two
//! producers racing into the same group may announce out of order — and
//! every mutation is id-checked so a stale caller cannot corrupt state.

use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct GroupQueue {
    pending: VecDeque<i64>,
    leased: Option<i64>,
}

#[derive(Debug, Default)]
pub struct GroupSequencer {
    groups: HashMap<String, GroupQueue>,
}

impl GroupSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the sequencer from a store scan. At most one row per group
    /// can be leased, per the single-outstanding-lease invariant.
    pub fn restore(rows: impl IntoIterator<Item = (i64, String, bool)>) -> Self {
        let mut sequencer = Self::new();

        for (id, group, leased) in rows {
            sequencer.register(&group, id);
            if leased {
                sequencer
                    .groups
                    .get_mut(&group)
                    .expect("group registered above")
                    .leased = Some(id);
            }
        }

        sequencer
    }

    /// Adds a message to its group, keeping the pending list in id order.
    pub fn register(&mut self, group: &str, id: i64) {
        let entry = self.groups.entry(group.to_owned()).or_default();
        let position = entry.pending.partition_point(|pending| *pending < id);
        entry.pending.insert(position, id);
    }

    /// Head message ids of groups with no outstanding lease, oldest first,
    /// at most `max` of them. Never offers a second message of a group
    /// while one is out.
    pub fn next_eligible(&self, max: usize) -> Vec<(String, i64)> {
        let mut heads: Vec<(String, i64)> = self
            .groups
            .iter()
            .filter(|(_, group)| group.leased.is_none())
            .filter_map(|(key, group)| group.pending.front().map(|id| (key.clone(), *id)))
            .collect();

        heads.sort_by_key(|(_, id)| *id);
        heads.truncate(max);
        heads
    }

    /// Records a granted lease. Refused while another message of the group
    /// is already out, or when the id is unknown.
    pub fn mark_leased(&mut self, group: &str, id: i64) -> bool {
        match self.groups.get_mut(group) {
            Some(entry) if entry.leased.is_none() && entry.pending.contains(&id) => {
                entry.leased = Some(id);
                true
            }
            _ => false,
        }
    }

    /// Re-opens the group after a lease expiry or explicit release. The
    /// same message becomes eligible again, preserving order.
    pub fn release_head(&mut self, group: &str, id: i64) -> bool {
        match self.groups.get_mut(group) {
            Some(entry) if entry.leased == Some(id) => {
                entry.leased = None;
                true
            }
            _ => false,
        }
    }

    /// Settles the leased message on delete or redrive, making the next
    /// message of the group (if any) eligible. Returns whether a successor
    /// exists.
    pub fn complete_head(&mut self, group: &str, id: i64) -> bool {
        let Some(entry) = self.groups.get_mut(group) else {
            return false;
        };

        if entry.leased != Some(id) {
            return false;
        }

        entry.leased = None;
        entry.pending.retain(|pending| *pending != id);

        if entry.pending.is_empty() {
            self.groups.remove(group);
            false
        } else {
            true
        }
    }

    /// Drops a message anywhere in its group, for retention expiry and
    /// stale-candidate cleanup.
    pub fn remove(&mut self, group: &str, id: i64) {
        let Some(entry) = self.groups.get_mut(group) else {
            return;
        };

        if entry.leased == Some(id) {
            entry.leased = None;
        }
        entry.pending.retain(|pending| *pending != id);

        if entry.pending.is_empty() {
            self.groups.remove(group);
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
