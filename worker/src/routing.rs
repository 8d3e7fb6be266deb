//! Routing table for VARASTO
//!
//! Maps each inbound topic to exactly one destination collection. The table
//! is built once at startup and never mutated; consumers and the
//! introspection service share it behind an `Arc`.

use crate::error::{Result, WorkerError};
use std::collections::HashMap;

/// A single topic to collection association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Topic (exchange) the messages arrive on
    pub source_topic: String,
    /// Collection the decoded documents are written to
    pub destination_collection: String,
}

impl RouteEntry {
    pub fn new(source_topic: impl Into<String>, destination_collection: impl Into<String>) -> Self {
        Self {
            source_topic: source_topic.into(),
            destination_collection: destination_collection.into(),
        }
    }
}

/// Immutable topic <-> collection lookup
///
/// Both directions are keyed for O(1) lookup. Entries keep their
/// configuration order so consumers are started, and collections reported,
/// deterministically.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
    by_topic: HashMap<String, usize>,
    by_collection: HashMap<String, usize>,
}

impl RoutingTable {
    /// Build a table, rejecting duplicate topics and shared collections
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Result<Self> {
        let mut table = Self {
            entries: Vec::new(),
            by_topic: HashMap::new(),
            by_collection: HashMap::new(),
        };

        for entry in entries {
            if entry.source_topic.is_empty() || entry.destination_collection.is_empty() {
                return Err(WorkerError::EmptyRouteName);
            }
            if table.by_topic.contains_key(&entry.source_topic) {
                return Err(WorkerError::DuplicateTopic {
                    topic: entry.source_topic,
                });
            }
            if let Some(&idx) = table.by_collection.get(&entry.destination_collection) {
                return Err(WorkerError::SharedCollection {
                    collection: entry.destination_collection,
                    first: table.entries[idx].source_topic.clone(),
                    second: entry.source_topic,
                });
            }

            let idx = table.entries.len();
            table.by_topic.insert(entry.source_topic.clone(), idx);
            table
                .by_collection
                .insert(entry.destination_collection.clone(), idx);
            table.entries.push(entry);
        }

        Ok(table)
    }

    /// Build a table from `(topic, collection)` pairs
    pub fn from_pairs<T, C>(pairs: impl IntoIterator<Item = (T, C)>) -> Result<Self>
    where
        T: Into<String>,
        C: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(t, c)| RouteEntry::new(t, c)))
    }

    /// Destination collection for a topic
    pub fn resolve(&self, topic: &str) -> Result<&str> {
        self.by_topic
            .get(topic)
            .map(|&idx| self.entries[idx].destination_collection.as_str())
            .ok_or_else(|| WorkerError::UnknownTopic {
                topic: topic.to_string(),
            })
    }

    /// Topic that feeds a collection
    pub fn reverse_lookup(&self, collection: &str) -> Result<&str> {
        self.by_collection
            .get(collection)
            .map(|&idx| self.entries[idx].source_topic.as_str())
            .ok_or_else(|| WorkerError::UnknownCollection {
                collection: collection.to_string(),
            })
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    /// Routes in configuration order
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::from_pairs([
            ("orders", "orders_collection"),
            ("events", "events_collection"),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_configured_topics() {
        let table = table();
        assert_eq!(table.resolve("orders").unwrap(), "orders_collection");
        assert_eq!(table.resolve("events").unwrap(), "events_collection");
    }

    #[test]
    fn test_resolve_unknown_topic() {
        let err = table().resolve("payments").unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTopic { topic } if topic == "payments"));
    }

    #[test]
    fn test_reverse_lookup() {
        let table = table();
        assert_eq!(table.reverse_lookup("events_collection").unwrap(), "events");
        assert!(matches!(
            table.reverse_lookup("nope"),
            Err(WorkerError::UnknownCollection { .. })
        ));
    }

    #[test]
    fn test_duplicate_topic_rejected() {
        let err = RoutingTable::from_pairs([("orders", "a"), ("orders", "b")]).unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateTopic { .. }));
    }

    #[test]
    fn test_shared_collection_rejected() {
        let err = RoutingTable::from_pairs([("orders", "c"), ("refunds", "c")]).unwrap_err();
        match err {
            WorkerError::SharedCollection { first, second, .. } => {
                assert_eq!(first, "orders");
                assert_eq!(second, "refunds");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_names_rejected() {
        assert!(matches!(
            RoutingTable::from_pairs([("", "c")]),
            Err(WorkerError::EmptyRouteName)
        ));
        assert!(matches!(
            RoutingTable::from_pairs([("t", "")]),
            Err(WorkerError::EmptyRouteName)
        ));
    }

    #[test]
    fn test_entries_keep_configuration_order() {
        let table = RoutingTable::from_pairs([("c", "3"), ("a", "1"), ("b", "2")]).unwrap();
        let topics: Vec<_> = table.entries().map(|e| e.source_topic.as_str()).collect();
        assert_eq!(topics, vec!["c", "a", "b"]);
        assert_eq!(table.len(), 3);
        assert!(table.contains_topic("a"));
        assert!(!table.contains_topic("d"));
    }
}
