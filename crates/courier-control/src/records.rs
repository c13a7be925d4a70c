//! Command-record store
//!
//! Records are keyed by command id and also kept in dispatch order so that
//! retention expiry only has to look at the oldest entries. Removal leaves
//! the order entry behind; expiry and iteration skip entries whose record is
//! gone or was re-inserted later.

use chrono::{DateTime, Utc};
use courier_proto::CommandRecord;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct CommandStore {
    records: HashMap<String, CommandRecord>,
    /// (id, issued_at) in insertion order, possibly with stale entries
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; returns false (and keeps the existing one) if the id is taken
    pub fn insert(&mut self, record: CommandRecord) -> bool {
        if self.records.contains_key(&record.id) {
            return false;
        }
        self.order.push_back((record.id.clone(), record.issued_at));
        self.records.insert(record.id.clone(), record);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CommandRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CommandRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<CommandRecord> {
        self.records.remove(id)
    }

    /// The live record an order entry refers to, if it is still that record
    fn resolve(&self, id: &str, issued_at: DateTime<Utc>) -> Option<&CommandRecord> {
        self.records
            .get(id)
            .filter(|record| record.issued_at == issued_at)
    }

    /// Remove every record issued before `cutoff`, answered or not
    pub fn expire_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut expired = 0;

        while let Some((id, issued_at)) = self.order.front() {
            let is_recent = self
                .resolve(id, *issued_at)
                .map(|record| record.issued_at >= cutoff);
            match is_recent {
                Some(true) => break,
                Some(false) => {
                    self.records.remove(id);
                    expired += 1;
                }
                // Stale entry
                None => {}
            }
            self.order.pop_front();
        }

        expired
    }

    /// Records in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &CommandRecord> {
        self.order
            .iter()
            .filter_map(|(id, issued_at)| self.resolve(id, *issued_at))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str, issued_at: DateTime<Utc>) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            origin: "c1".to_string(),
            target: "a1".to_string(),
            issued_at,
            responded_at: None,
            kind: "shell".to_string(),
            payload: json!("whoami"),
            response: None,
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut store = CommandStore::new();
        let now = Utc::now();

        assert!(store.insert(record("k1", now)));
        let mut second = record("k1", now);
        second.target = "a2".to_string();
        assert!(!store.insert(second));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k1").unwrap().target, "a1");
    }

    #[test]
    fn test_expire_older_than_keeps_recent() {
        let mut store = CommandStore::new();
        let now = Utc::now();

        store.insert(record("old", now - Duration::hours(25)));
        store.insert(record("mid", now - Duration::hours(2)));
        store.insert(record("new", now));

        let expired = store.expire_older_than(now - Duration::hours(24));
        assert_eq!(expired, 1);
        assert!(!store.contains("old"));
        assert!(store.contains("mid"));
        assert!(store.contains("new"));
    }

    #[test]
    fn test_expiry_removes_answered_records_too() {
        let mut store = CommandStore::new();
        let now = Utc::now();

        let mut answered = record("k1", now - Duration::days(2));
        answered.responded_at = Some(now - Duration::days(2));
        answered.response = Some(json!("root"));
        store.insert(answered);

        assert_eq!(store.expire_older_than(now - Duration::days(1)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expiry_is_idempotent() {
        let mut store = CommandStore::new();
        let now = Utc::now();
        store.insert(record("k1", now - Duration::days(3)));
        store.insert(record("k2", now));

        let cutoff = now - Duration::days(1);
        assert_eq!(store.expire_older_than(cutoff), 1);
        assert_eq!(store.expire_older_than(cutoff), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_and_iteration_order() {
        let mut store = CommandStore::new();
        let now = Utc::now();
        store.insert(record("k1", now));
        store.insert(record("k2", now));
        store.insert(record("k3", now));

        assert!(store.remove("k2").is_some());
        assert!(store.remove("k2").is_none());

        let ids: Vec<&str> = store.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "k3"]);
    }

    #[test]
    fn test_removed_then_reinserted_id_is_not_duplicated() {
        let mut store = CommandStore::new();
        let now = Utc::now();
        store.insert(record("k1", now - Duration::days(3)));
        store.insert(record("k2", now - Duration::days(2)));
        store.remove("k1");
        store.insert(record("k1", now));

        let ids: Vec<&str> = store.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["k2", "k1"]);

        // The stale k1 entry must not expire the fresh k1 record
        assert_eq!(store.expire_older_than(now - Duration::days(1)), 1);
        assert!(store.contains("k1"));
        assert!(!store.contains("k2"));
    }
}
