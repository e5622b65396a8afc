//! Merged record store.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::{BodySide, ProtocolRecord, RecordId};

#[derive(Debug, Default)]
pub struct RecordStore {
    records: Vec<ProtocolRecord>,
    positions: HashMap<RecordId, usize>,
    selected: Option<RecordId>,
    paused: bool,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Rejected while paused; the first record of an empty store is selected.
    pub fn push(&mut self, record: ProtocolRecord) -> bool {
        if self.paused {
            return false;
        }
        if self.records.is_empty() && self.selected.is_none() {
            self.selected = Some(record.id);
        }
        self.positions.insert(record.id, self.records.len());
        self.records.push(record);
        true
    }

    pub fn get(&self, id: RecordId) -> Option<&ProtocolRecord> {
        self.positions.get(&id).map(|&pos| &self.records[pos])
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut ProtocolRecord> {
        let pos = *self.positions.get(&id)?;
        self.records.get_mut(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtocolRecord> {
        self.records.iter()
    }

    /// The `window` most recently appended records, oldest first.
    pub fn recent_mut(&mut self, window: usize) -> impl Iterator<Item = &mut ProtocolRecord> {
        let start = self.records.len().saturating_sub(window);
        self.records[start..].iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at a 1-based display position.
    pub fn nth(&self, position: usize) -> Option<&ProtocolRecord> {
        position.checked_sub(1).and_then(|idx| self.records.get(idx))
    }

    pub fn select(&mut self, id: Option<RecordId>) -> bool {
        match id {
            Some(id) if !self.positions.contains_key(&id) => false,
            other => {
                self.selected = other;
                true
            }
        }
    }

    pub fn selected(&self) -> Option<RecordId> {
        self.selected
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Attach a decryption result. A record that has since been cleared is a no-op.
    pub fn attach_decrypted(&mut self, id: RecordId, side: BodySide, value: Value) -> bool {
        self.get_mut(id)
            .map(|record| record.attach_decrypted(side, value))
            .unwrap_or(false)
    }

    pub fn export(&self) -> Vec<ProtocolRecord> {
        self.records.clone()
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records)
    }

    /// Drop every record and the selection. The paused flag is toolbar state and survives.
    pub fn clear(&mut self) {
        self.records.clear();
        self.positions.clear();
        self.selected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paused_store_rejects_intake_but_keeps_records() {
        let mut store = RecordStore::new();
        assert!(store.push(ProtocolRecord::new("GET", "http://h/a")));
        store.set_paused(true);
        assert!(!store.push(ProtocolRecord::new("GET", "http://h/b")));
        assert_eq!(store.len(), 1);
        store.set_paused(false);
        assert!(store.push(ProtocolRecord::new("GET", "http://h/c")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn first_record_is_selected() {
        let mut store = RecordStore::new();
        let first = ProtocolRecord::new("GET", "http://h/a");
        let id = first.id;
        store.push(first);
        store.push(ProtocolRecord::new("GET", "http://h/b"));
        assert_eq!(store.selected(), Some(id));
        assert!(!store.select(Some(RecordId::new())));
        assert_eq!(store.selected(), Some(id));
    }

    #[test]
    fn decrypted_attach_after_clear_is_noop() {
        let mut store = RecordStore::new();
        let record = ProtocolRecord::new("POST", "http://h/echo");
        let id = record.id;
        store.push(record);
        store.clear();
        assert!(!store.attach_decrypted(id, BodySide::Response, json!({"ok": true})));
        assert!(store.is_empty());
        assert_eq!(store.selected(), None);
    }

    #[test]
    fn recent_window_covers_tail() {
        let mut store = RecordStore::new();
        for n in 0..5 {
            store.push(ProtocolRecord::new("GET", format!("http://h/{n}")));
        }
        let urls: Vec<String> = store
            .recent_mut(2)
            .map(|r| r.request.url.clone())
            .collect();
        assert_eq!(urls, vec!["http://h/3", "http://h/4"]);
        assert_eq!(store.recent_mut(50).count(), 5);
        assert_eq!(store.nth(1).map(|r| r.request.url.as_str()), Some("http://h/0"));
        assert!(store.nth(0).is_none());
    }

    #[test]
    fn export_is_pretty_json_array() {
        let mut store = RecordStore::new();
        store.push(ProtocolRecord::new("GET", "http://h/a"));
        let text = store.export_json().expect("export");
        assert!(text.starts_with("[\n"));
        let parsed: Vec<ProtocolRecord> = serde_json::from_str(&text).expect("parse export");
        assert_eq!(parsed.len(), 1);
    }
}
