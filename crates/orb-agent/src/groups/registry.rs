use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use orb_agent_core::protocol::rpc::GroupDescriptor;

use crate::lock;

/// Local projection of one subscribed group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub channel_id: String,
}

/// Proof that a subscription for a group is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone)]
struct Reservation {
    ticket: Ticket,
    channel_id: String,
}

/// A group whose subscription never succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionFailure {
    pub group_id: String,
    pub group_name: String,
    pub topic: String,
    pub attempts: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Projection {
    groups: HashMap<String, GroupInfo>,
    pending: HashMap<String, Reservation>,
}

/// Group registry:
/// - `group_id -> GroupInfo` for confirmed subscriptions
/// - `group_id -> Reservation` for subscriptions still in flight
///
/// Entries are only committed against a live reservation. A full reset or a
/// group removal cancels reservations, so a late worker cannot resurrect a
/// group the agent no longer belongs to.
#[derive(Default)]
pub struct GroupRegistry {
    inner: Mutex<Projection>,
    failures: Mutex<BTreeMap<String, SubscriptionFailure>>,
    next_ticket: AtomicU64,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a subscription slot, unless the group is known or already in flight.
    pub fn reserve(&self, group: &GroupDescriptor) -> Option<Ticket> {
        let mut p = lock(&self.inner);
        if p.groups.contains_key(&group.group_id) || p.pending.contains_key(&group.group_id) {
            return None;
        }
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        p.pending.insert(
            group.group_id.clone(),
            Reservation {
                ticket,
                channel_id: group.channel_id.clone(),
            },
        );
        Some(ticket)
    }

    /// Turn a reservation into a projection entry. False if it was cancelled meanwhile.
    pub fn commit(&self, ticket: Ticket, group: &GroupDescriptor) -> bool {
        let mut p = lock(&self.inner);
        match p.pending.get(&group.group_id) {
            Some(r) if r.ticket == ticket => {}
            _ => return false,
        }
        p.pending.remove(&group.group_id);
        lock(&self.failures).remove(&group.group_id);
        p.groups.insert(
            group.group_id.clone(),
            GroupInfo {
                name: group.name.clone(),
                channel_id: group.channel_id.clone(),
            },
        );
        true
    }

    /// Drop a reservation after its worker gave up.
    pub fn release(&self, ticket: Ticket, group_id: &str) {
        let mut p = lock(&self.inner);
        if p.pending.get(group_id).is_some_and(|r| r.ticket == ticket) {
            p.pending.remove(group_id);
        }
    }

    /// Clear the projection and cancel every reservation, in one step.
    /// Returns the groups that were subscribed.
    pub fn reset(&self) -> Vec<(String, GroupInfo)> {
        let mut p = lock(&self.inner);
        p.pending.clear();
        let mut drained: Vec<(String, GroupInfo)> = p.groups.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Remove every group (confirmed or in flight) bound to `channel_id`.
    pub fn remove_channel(&self, channel_id: &str) -> Vec<(String, GroupInfo)> {
        let mut p = lock(&self.inner);
        p.pending.retain(|_, r| r.channel_id != channel_id);
        let ids: Vec<String> = p
            .groups
            .iter()
            .filter(|(_, g)| g.channel_id == channel_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| p.groups.remove(&id).map(|g| (id, g)))
            .collect()
    }

    /// True if a confirmed or in-flight group uses `channel_id`.
    pub fn channel_in_use(&self, channel_id: &str) -> bool {
        let p = lock(&self.inner);
        p.groups.values().any(|g| g.channel_id == channel_id)
            || p.pending.values().any(|r| r.channel_id == channel_id)
    }

    pub fn contains(&self, group_id: &str) -> bool {
        lock(&self.inner).groups.contains_key(group_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Consistent copy of the confirmed projection.
    pub fn snapshot(&self) -> BTreeMap<String, GroupInfo> {
        lock(&self.inner)
            .groups
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keep the latest failure per group. Cleared once the group subscribes.
    pub fn record_failure(&self, failure: SubscriptionFailure) {
        lock(&self.failures).insert(failure.group_id.clone(), failure);
    }

    pub fn failures(&self) -> Vec<SubscriptionFailure> {
        lock(&self.failures).values().cloned().collect()
    }
}
