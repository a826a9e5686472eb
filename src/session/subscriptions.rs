//! Subscription table.

use heapless::Vec;

use crate::QoS;
use crate::message::{Topic, copy_str};
use crate::topic;

/// Maximum number of granted subscriptions tracked locally.
pub const MAX_SUBSCRIPTIONS: usize = 16;

/// Filters the broker has granted, with their granted QoS.
///
/// The table owns its filter strings (copies them on insert), so it outlives the
/// packets that carried them.
#[derive(Debug, Default)]
pub struct SubscriptionTable<const N: usize = MAX_SUBSCRIPTIONS> {
    entries: Vec<(Topic, QoS), N>,
}

impl<const N: usize> SubscriptionTable<N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Records a granted subscription, replacing the QoS of an existing filter.
    ///
    /// Returns `false` if the table is full or the filter is too long.
    pub fn insert(&mut self, filter: &str, qos: QoS) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(f, _)| f.as_str() == filter) {
            entry.1 = qos;
            return true;
        }
        let Some(owned) = copy_str(filter) else {
            return false;
        };
        self.entries.push((owned, qos)).is_ok()
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        match self.entries.iter().position(|(f, _)| f.as_str() == filter) {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn granted(&self, filter: &str) -> Option<QoS> {
        self.entries
            .iter()
            .find(|(f, _)| f.as_str() == filter)
            .map(|(_, qos)| *qos)
    }

    /// Whether any granted filter matches `topic_name`.
    pub fn matches(&self, topic_name: &str) -> bool {
        self.entries
            .iter()
            .any(|(filter, _)| topic::matches(filter, topic_name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, QoS)> {
        self.entries.iter().map(|(f, qos)| (f.as_str(), *qos))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_existing_grant() {
        let mut table = SubscriptionTable::<4>::new();
        assert!(table.insert("sensors/+/temp", QoS::AtMostOnce));
        assert!(table.insert("sensors/+/temp", QoS::AtLeastOnce));
        assert_eq!(table.len(), 1);
        assert_eq!(table.granted("sensors/+/temp"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn matches_against_wildcards() {
        let mut table = SubscriptionTable::<4>::new();
        table.insert("sensors/+/temp", QoS::AtLeastOnce);
        assert!(table.matches("sensors/room1/temp"));
        assert!(!table.matches("sensors/room1/humidity"));
        assert!(table.remove("sensors/+/temp"));
        assert!(!table.matches("sensors/room1/temp"));
        assert!(!table.remove("sensors/+/temp"));
    }

    #[test]
    fn full_table_refuses_new_filters() {
        let mut table = SubscriptionTable::<1>::new();
        assert!(table.insert("a", QoS::AtMostOnce));
        assert!(!table.insert("b", QoS::AtMostOnce));
        assert!(table.insert("a", QoS::ExactlyOnce));
    }
}
