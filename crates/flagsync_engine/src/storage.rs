//! Local snapshot storage.
//!
//! The engine only needs a narrow view of persistence: the flag snapshot,
//! per-key segment membership and a small general-info table holding the
//! change numbers. [`MemoryStorage`] is the in-process implementation.

use crate::error::SyncResult;
use crate::transport::FlagDefinition;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// General-info entry holding the flags change number.
pub const CHANGE_NUMBER_INFO: &str = "changeNumber";
/// Prefix of the general-info entries holding per-key segment change numbers.
pub const SEGMENTS_CHANGE_NUMBER_INFO: &str = "segmentsChangeNumber";
/// Change number of a store that was never synchronized.
pub const NO_CHANGE_NUMBER: i64 = -1;

/// A general-info value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralInfo {
    /// Text value.
    Text(String),
    /// Numeric value.
    Number(i64),
}

fn segments_info_name(key: &str) -> String {
    format!("{SEGMENTS_CHANGE_NUMBER_INFO}:{key}")
}

fn change_number_of(info: Option<GeneralInfo>) -> i64 {
    match info {
        Some(GeneralInfo::Number(n)) => n,
        _ => NO_CHANGE_NUMBER,
    }
}

/// Storage for the synchronized snapshot.
///
/// Implementations must make each call atomic with respect to readers.
pub trait SyncStorage: Send + Sync {
    /// Returns a flag definition.
    fn flag(&self, name: &str) -> SyncResult<Option<FlagDefinition>>;

    /// Returns the names of all stored flags.
    fn flag_names(&self) -> SyncResult<Vec<String>>;

    /// Upserts and removes definitions and records the new change number.
    fn update_flags(
        &self,
        upserts: Vec<FlagDefinition>,
        removals: Vec<String>,
        change_number: i64,
    ) -> SyncResult<()>;

    /// Returns the segments `key` belongs to.
    fn segments_for(&self, key: &str) -> SyncResult<Vec<String>>;

    /// Replaces the segments `key` belongs to.
    fn set_segments_for(&self, key: &str, segments: Vec<String>) -> SyncResult<()>;

    /// Reads a general-info entry.
    fn general_info(&self, name: &str) -> SyncResult<Option<GeneralInfo>>;

    /// Writes a general-info entry.
    fn set_general_info(&self, name: &str, value: GeneralInfo) -> SyncResult<()>;

    /// Change number of the flag snapshot.
    fn flags_change_number(&self) -> SyncResult<i64> {
        Ok(change_number_of(self.general_info(CHANGE_NUMBER_INFO)?))
    }

    /// Change number of the segment membership of `key`.
    fn segments_change_number(&self, key: &str) -> SyncResult<i64> {
        Ok(change_number_of(self.general_info(&segments_info_name(key))?))
    }

    /// Records the change number of the segment membership of `key`.
    fn set_segments_change_number(&self, key: &str, change_number: i64) -> SyncResult<()> {
        self.set_general_info(&segments_info_name(key), GeneralInfo::Number(change_number))
    }

    /// Marks a flag killed if the kill is newer than the stored definition.
    ///
    /// The flags change number is left untouched so that a later fetch
    /// still brings the full definition. Returns true if the flag changed.
    fn kill_flag(
        &self,
        name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> SyncResult<bool> {
        let Some(mut flag) = self.flag(name)? else {
            return Ok(false);
        };
        if flag.change_number >= change_number {
            return Ok(false);
        }
        flag.killed = true;
        flag.default_treatment = default_treatment.to_string();
        flag.change_number = change_number;

        let current = self.flags_change_number()?;
        self.update_flags(vec![flag], Vec::new(), current)?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    flags: BTreeMap<String, FlagDefinition>,
    segments: HashMap<String, Vec<String>>,
    info: HashMap<String, GeneralInfo>,
}

/// An in-memory storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage pre-populated with a flag snapshot.
    pub fn with_flags(flags: Vec<FlagDefinition>, change_number: i64) -> Self {
        let storage = Self::new();
        {
            let mut state = storage.state.write();
            for flag in flags {
                state.flags.insert(flag.name.clone(), flag);
            }
            state
                .info
                .insert(CHANGE_NUMBER_INFO.to_string(), GeneralInfo::Number(change_number));
        }
        storage
    }

    /// Returns all stored flags in name order.
    pub fn flags(&self) -> Vec<FlagDefinition> {
        self.state.read().flags.values().cloned().collect()
    }
}

impl SyncStorage for MemoryStorage {
    fn flag(&self, name: &str) -> SyncResult<Option<FlagDefinition>> {
        Ok(self.state.read().flags.get(name).cloned())
    }

    fn flag_names(&self) -> SyncResult<Vec<String>> {
        Ok(self.state.read().flags.keys().cloned().collect())
    }

    fn update_flags(
        &self,
        upserts: Vec<FlagDefinition>,
        removals: Vec<String>,
        change_number: i64,
    ) -> SyncResult<()> {
        let mut state = self.state.write();
        for flag in upserts {
            state.flags.insert(flag.name.clone(), flag);
        }
        for name in removals {
            state.flags.remove(&name);
        }
        state
            .info
            .insert(CHANGE_NUMBER_INFO.to_string(), GeneralInfo::Number(change_number));
        Ok(())
    }

    fn segments_for(&self, key: &str) -> SyncResult<Vec<String>> {
        Ok(self.state.read().segments.get(key).cloned().unwrap_or_default())
    }

    fn set_segments_for(&self, key: &str, segments: Vec<String>) -> SyncResult<()> {
        self.state.write().segments.insert(key.to_string(), segments);
        Ok(())
    }

    fn general_info(&self, name: &str) -> SyncResult<Option<GeneralInfo>> {
        Ok(self.state.read().info.get(name).cloned())
    }

    fn set_general_info(&self, name: &str, value: GeneralInfo) -> SyncResult<()> {
        self.state.write().info.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_storage_has_no_change_number() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.flags_change_number().unwrap(), NO_CHANGE_NUMBER);
        assert_eq!(storage.segments_change_number("k").unwrap(), NO_CHANGE_NUMBER);
        assert!(storage.segments_for("k").unwrap().is_empty());
    }

    #[test]
    fn update_flags_records_change_number() {
        let storage = MemoryStorage::with_flags(vec![FlagDefinition::new("old", 1)], 1);
        storage
            .update_flags(vec![FlagDefinition::new("new", 5)], vec!["old".into()], 5)
            .unwrap();

        assert_eq!(storage.flags_change_number().unwrap(), 5);
        assert_eq!(storage.flag_names().unwrap(), vec!["new".to_string()]);
    }

    #[test]
    fn segment_change_numbers_are_per_key() {
        let storage = MemoryStorage::new();
        storage.set_segments_change_number("a", 10).unwrap();
        assert_eq!(storage.segments_change_number("a").unwrap(), 10);
        assert_eq!(storage.segments_change_number("b").unwrap(), NO_CHANGE_NUMBER);
    }

    #[test]
    fn kill_flag_only_applies_newer_kills() {
        let storage = MemoryStorage::with_flags(vec![FlagDefinition::new("checkout", 10)], 10);

        assert!(!storage.kill_flag("checkout", "off", 9).unwrap());
        assert!(!storage.kill_flag("missing", "off", 99).unwrap());
        assert!(storage.kill_flag("checkout", "off", 11).unwrap());

        let flag = storage.flag("checkout").unwrap().unwrap();
        assert!(flag.killed);
        assert_eq!(flag.default_treatment, "off");
        assert_eq!(flag.change_number, 11);
        assert_eq!(storage.flags_change_number().unwrap(), 10);
    }

    #[test]
    fn general_info_round_trip() {
        let storage = MemoryStorage::new();
        storage
            .set_general_info("lastSyncKey", GeneralInfo::Text("k".into()))
            .unwrap();
        assert_eq!(
            storage.general_info("lastSyncKey").unwrap(),
            Some(GeneralInfo::Text("k".into()))
        );
        assert_eq!(storage.general_info("other").unwrap(), None);
    }
}
