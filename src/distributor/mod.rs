//! The data distributor: arbitrates which consumer receives each update.
//!
//! A [`Distributor`] owns any number of consumer groups and rotates updates
//! between them; within a group, updates are either handed round robin to one
//! member at a time ([`DispatchMode::OnePerGroup`]) or broadcast to every
//! member ([`DispatchMode::AllInGroup`]), in both cases for a configurable
//! quota of logical updates before the turn moves on.
//!
//! The distributor is invoked once per consumer for every upstream update,
//! potentially from as many threads as there are consumers, but must make a
//! single coherent scheduling decision per *logical* update. All mutable
//! state therefore lives under one mutex per distributor, and the last
//! dispatched distinguishing value is remembered distributor-wide so that a
//! second call carrying the same logical update cannot advance any counters.

mod filter;
mod group;

pub use filter::{ConsumerFilter, FilterError};
pub use group::DispatchMode;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::{debug, warn};

use group::{ConsumerGroup, advance, remove_at};

/// Arbitrates the updates of one upstream record between consumer groups.
///
/// Obtained from a [`DistributorRegistry`]; all methods take `&self` and
/// serialize internally, so a distributor can be shared freely between
/// consumer call paths.
pub struct Distributor {
    id: String,
    state: Mutex<DistributorState>,
    /// Mirror of the group count, readable without taking `state`
    group_count: AtomicUsize,
}

#[derive(Default)]
struct DistributorState {
    groups: HashMap<String, ConsumerGroup>,
    /// Insertion order; group turns walk this front to back
    group_order: Vec<String>,
    active_group: Option<usize>,
    /// Last distinguishing value granted by any group of this distributor
    last_value: Option<String>,
}

impl DistributorState {
    /// Id of the group currently entitled to updates. A sentinel cursor
    /// resets to the front of the rotation order.
    fn active_group_id(&mut self) -> Option<String> {
        if self.group_order.is_empty() {
            return None;
        }
        let i = match self.active_group {
            Some(i) if i < self.group_order.len() => i,
            _ => {
                self.active_group = Some(0);
                0
            }
        };
        Some(self.group_order[i].clone())
    }
}

impl Distributor {
    fn new(id: &str) -> Self {
        Distributor {
            id: id.to_owned(),
            state: Mutex::new(DistributorState::default()),
            group_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn is_unused(&self) -> bool {
        self.group_count.load(Ordering::Acquire) == 0
    }

    /// Register a consumer with a group, creating the group on first use.
    ///
    /// Later joiners cannot change group-wide policy: the distinguishing
    /// field, quota and mode of an existing group stay as its first member
    /// established them. The field actually in effect is returned.
    pub fn add_consumer(
        &self,
        consumer: u64,
        group_id: &str,
        distinguishing_field: &str,
        quota: u32,
        mode: DispatchMode,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.groups.get_mut(group_id) {
            group.add_member(consumer);
            debug!(
                "distributor {}: consumer {consumer} joined group {group_id}",
                self.id
            );
            return group.distinguishing_field().to_owned();
        }
        let mut group = ConsumerGroup::new(group_id, distinguishing_field, quota, mode);
        group.add_member(consumer);
        state.groups.insert(group_id.to_owned(), group);
        state.group_order.push(group_id.to_owned());
        self.group_count.store(state.groups.len(), Ordering::Release);
        debug!(
            "distributor {}: consumer {consumer} created group {group_id} ({mode:?}, quota {quota})",
            self.id
        );
        distinguishing_field.to_owned()
    }

    /// Deregister a consumer.
    ///
    /// Removing the member the rotation cursor points at hands the turn to
    /// the member that followed it. A group left empty leaves the rotation
    /// entirely; if it was the active group, the group cursor moves on so
    /// the surviving groups keep making progress.
    pub fn remove_consumer(&self, consumer: u64, group_id: &str) {
        let mut state = self.state.lock().unwrap();
        let st = &mut *state;
        let Some(group) = st.groups.get_mut(group_id) else {
            warn!(
                "distributor {}: remove for unknown group {group_id}",
                self.id
            );
            return;
        };
        if !group.remove_member(consumer) {
            warn!(
                "distributor {}: consumer {consumer} is not a member of group {group_id}",
                self.id
            );
            return;
        }
        debug!(
            "distributor {}: consumer {consumer} left group {group_id}",
            self.id
        );
        if group.is_empty() {
            st.groups.remove(group_id);
            if let Some(pos) = st.group_order.iter().position(|g| g == group_id) {
                remove_at(&mut st.group_order, &mut st.active_group, pos);
            }
            self.group_count.store(st.groups.len(), Ordering::Release);
            debug!("distributor {}: group {group_id} is empty, removed", self.id);
        }
    }

    /// Decide whether `consumer` receives the update identified by `value`.
    ///
    /// Only members of the active group are entitled; within it, the dispatch
    /// mode decides. A value equal to the last one granted is a duplicate
    /// invocation of an already-resolved logical update and never advances
    /// any counters. Unknown ids are logged and treated as not entitled.
    pub fn update_consumer(&self, consumer: u64, group_id: &str, value: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(active) = state.active_group_id() else {
            warn!("distributor {}: update with no groups registered", self.id);
            return false;
        };
        if active != group_id {
            return false;
        }
        if state.last_value.as_deref() == Some(value) {
            return false;
        }
        let DistributorState {
            groups,
            group_order,
            active_group,
            last_value,
        } = &mut *state;
        let Some(group) = groups.get_mut(group_id) else {
            warn!(
                "distributor {}: update for unknown group {group_id}",
                self.id
            );
            return false;
        };
        match group.mode() {
            DispatchMode::OnePerGroup => {
                if group.current_member() != Some(consumer) {
                    return false;
                }
                *last_value = Some(value.to_owned());
                if group.dispatch_single(value) {
                    advance(active_group, group_order.len());
                }
                true
            }
            DispatchMode::AllInGroup => {
                if group.dispatch_all(value) {
                    *last_value = Some(value.to_owned());
                    advance(active_group, group_order.len());
                }
                true
            }
        }
    }
}

/// Process-wide set of named distributors.
///
/// An explicit value rather than a hidden global: clone the handle into
/// whatever owns the record/monitor integration. Clones share one set.
/// Distributors are created lazily by the first consumer naming them and
/// dropped again once their last group disappears.
#[derive(Clone, Default)]
pub struct DistributorRegistry {
    distributors: Arc<Mutex<HashMap<String, Arc<Distributor>>>>,
}

impl DistributorRegistry {
    pub fn new() -> Self {
        DistributorRegistry::default()
    }

    /// Look up a distributor, creating it on first use.
    pub fn get_or_create(&self, id: &str) -> Arc<Distributor> {
        let mut distributors = self.distributors.lock().unwrap();
        distributors
            .entry(id.to_owned())
            .or_insert_with(|| {
                debug!("creating distributor {id}");
                Arc::new(Distributor::new(id))
            })
            .clone()
    }

    /// Drop a distributor that no longer has any groups.
    ///
    /// The check reads the distributor's atomic group count; no
    /// per-distributor lock is ever taken under the registry lock. The entry
    /// is only removed while it still refers to the caller's instance, so a
    /// distributor re-created under the same id is never evicted by a stale
    /// handle.
    pub fn release_if_unused(&self, distributor: &Arc<Distributor>) {
        let mut distributors = self.distributors.lock().unwrap();
        if distributor.is_unused()
            && distributors
                .get(distributor.id())
                .is_some_and(|d| Arc::ptr_eq(d, distributor))
        {
            debug!("dropping unused distributor {}", distributor.id());
            distributors.remove(distributor.id());
        }
    }

    pub fn len(&self) -> usize {
        self.distributors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distributor() -> Distributor {
        Distributor::new("test")
    }

    #[test]
    fn round_robin_is_fair() {
        let d = distributor();
        for c in 1..=3u64 {
            d.add_consumer(c, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        }
        // Every consumer calls in for every update; exactly one is granted,
        // in join order, wrapping around after the last member.
        for (update, expected) in [("t1", 1u64), ("t2", 2), ("t3", 3), ("t4", 1)] {
            for c in 1..=3u64 {
                assert_eq!(
                    d.update_consumer(c, "g", update),
                    c == expected,
                    "update {update} consumer {c}"
                );
            }
        }
    }

    #[test]
    fn quota_gives_consecutive_updates() {
        let d = distributor();
        d.add_consumer(1, "g", "timeStamp", 2, DispatchMode::OnePerGroup);
        d.add_consumer(2, "g", "timeStamp", 2, DispatchMode::OnePerGroup);
        assert!(d.update_consumer(1, "g", "t1"));
        assert!(!d.update_consumer(2, "g", "t1"));
        assert!(d.update_consumer(1, "g", "t2"));
        // consumer 1 has consumed its quota; consumer 2 takes over
        assert!(!d.update_consumer(1, "g", "t3"));
        assert!(d.update_consumer(2, "g", "t3"));
        assert!(d.update_consumer(2, "g", "t4"));
        assert!(d.update_consumer(1, "g", "t5"));
    }

    #[test]
    fn duplicate_updates_are_suppressed() {
        let d = distributor();
        d.add_consumer(1, "g", "timeStamp", 2, DispatchMode::OnePerGroup);
        d.add_consumer(2, "g", "timeStamp", 2, DispatchMode::OnePerGroup);
        assert!(d.update_consumer(1, "g", "t1"));
        assert!(!d.update_consumer(1, "g", "t1"));
        // the duplicate did not count against the quota
        assert!(d.update_consumer(1, "g", "t2"));
        assert!(!d.update_consumer(1, "g", "t3"));
        assert!(d.update_consumer(2, "g", "t3"));
    }

    #[test]
    fn broadcast_serves_every_member() {
        let d = distributor();
        d.add_consumer(1, "g", "timeStamp", 1, DispatchMode::AllInGroup);
        d.add_consumer(2, "g", "timeStamp", 1, DispatchMode::AllInGroup);
        for update in ["t1", "t2", "t3"] {
            assert!(d.update_consumer(1, "g", update), "update {update}");
            assert!(d.update_consumer(2, "g", update), "update {update}");
        }
    }

    #[test]
    fn groups_rotate_after_quota() {
        let d = distributor();
        d.add_consumer(1, "a", "timeStamp", 1, DispatchMode::OnePerGroup);
        d.add_consumer(2, "b", "timeStamp", 1, DispatchMode::AllInGroup);
        d.add_consumer(3, "b", "timeStamp", 1, DispatchMode::AllInGroup);
        // group a's turn; the same logical update cannot also serve group b
        assert!(d.update_consumer(1, "a", "t1"));
        assert!(!d.update_consumer(2, "b", "t1"));
        assert!(!d.update_consumer(3, "b", "t1"));
        // then group b's, broadcast to both members
        assert!(!d.update_consumer(1, "a", "t2"));
        assert!(d.update_consumer(2, "b", "t2"));
        assert!(d.update_consumer(3, "b", "t2"));
        // and back to a
        assert!(d.update_consumer(1, "a", "t3"));
    }

    #[test]
    fn removing_pending_consumer_keeps_rotation_alive() {
        let d = distributor();
        for c in 1..=3u64 {
            d.add_consumer(c, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        }
        assert!(d.update_consumer(1, "g", "t1"));
        // consumer 2 is next; losing it must hand the turn to consumer 3
        d.remove_consumer(2, "g");
        assert!(!d.update_consumer(1, "g", "t2"));
        assert!(d.update_consumer(3, "g", "t2"));
        assert!(d.update_consumer(1, "g", "t3"));
    }

    #[test]
    fn removing_active_group_advances_rotation() {
        let d = distributor();
        d.add_consumer(1, "a", "timeStamp", 1, DispatchMode::OnePerGroup);
        d.add_consumer(2, "b", "timeStamp", 1, DispatchMode::OnePerGroup);
        d.add_consumer(3, "c", "timeStamp", 1, DispatchMode::OnePerGroup);
        assert!(d.update_consumer(1, "a", "t1"));
        // group b is next; emptying it must hand the turn to group c
        d.remove_consumer(2, "b");
        assert!(!d.update_consumer(1, "a", "t2"));
        assert!(d.update_consumer(3, "c", "t2"));
        assert!(d.update_consumer(1, "a", "t3"));
    }

    #[test]
    fn group_policy_is_fixed_by_first_joiner() {
        let d = distributor();
        assert_eq!(
            d.add_consumer(1, "g", "timeStamp", 1, DispatchMode::OnePerGroup),
            "timeStamp"
        );
        // the second joiner's request cannot re-shape the group
        assert_eq!(
            d.add_consumer(2, "g", "userTag", 5, DispatchMode::AllInGroup),
            "timeStamp"
        );
        assert!(d.update_consumer(1, "g", "t1"));
        assert!(!d.update_consumer(2, "g", "t1"));
        assert!(d.update_consumer(2, "g", "t2"));
    }

    #[test]
    fn distributors_are_isolated() {
        let registry = DistributorRegistry::new();
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        a.add_consumer(1, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        b.add_consumer(2, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        for update in ["t1", "t2"] {
            assert!(a.update_consumer(1, "g", update));
            assert!(b.update_consumer(2, "g", update));
        }
    }

    #[test]
    fn registry_reuses_and_releases() {
        let registry = DistributorRegistry::new();
        let d = registry.get_or_create("d");
        assert!(Arc::ptr_eq(&d, &registry.get_or_create("d")));
        d.add_consumer(1, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        registry.release_if_unused(&d);
        assert_eq!(registry.len(), 1);
        d.remove_consumer(1, "g");
        registry.release_if_unused(&d);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_ids_are_no_ops() {
        let d = distributor();
        d.add_consumer(1, "g", "timeStamp", 1, DispatchMode::OnePerGroup);
        d.remove_consumer(7, "g");
        d.remove_consumer(1, "nowhere");
        assert!(!d.update_consumer(1, "nowhere", "t1"));
        assert!(d.update_consumer(1, "g", "t1"));
    }
}
