//! Persistent tables: per-user daily usage, VIP membership and allowed
//! chat groups. Each table is a JSON object written as a whole.

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const TEMP_FILE_SUFFIX: &str = ".tmp";

pub type Mapping = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("table {table} is not a valid json object: {source}")]
    Json {
        table: Table,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Usage,
    Vip,
    Groups,
}

impl Table {
    pub fn file_name(self) -> &'static str {
        match self {
            Table::Usage => "usage.json",
            Table::Vip => "vip.json",
            Table::Groups => "groups.json",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Table::Usage => "usage",
            Table::Vip => "vip",
            Table::Groups => "groups",
        };
        f.write_str(name)
    }
}

/// Storage backend for the three tables.
///
/// `get` on a table that has never been written returns an empty mapping
/// (and may materialize it). Implementations never cache across calls.
pub trait StateStore: Send + Sync {
    fn get(&self, table: Table) -> Result<Mapping, StoreError>;
    fn put(&self, table: Table, value: &Mapping) -> Result<(), StoreError>;
}

/// A requester's granted targets for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub date: NaiveDate,
    #[serde(rename = "uids", default)]
    pub target_ids: Vec<String>,
}

impl UsageRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            target_ids: Vec::new(),
        }
    }

    /// The record as seen on `today`: a stale date means nothing is used yet.
    pub fn rolled_over(&self, today: NaiveDate) -> UsageRecord {
        if self.date == today {
            self.clone()
        } else {
            UsageRecord::new(today)
        }
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.target_ids.iter().any(|t| t == target_id)
    }

    pub fn insert(&mut self, target_id: &str) -> bool {
        if self.contains(target_id) {
            return false;
        }
        self.target_ids.push(target_id.to_string());
        true
    }
}

pub type UsageTable = BTreeMap<String, UsageRecord>;
pub type IdSet = BTreeSet<String>;

pub fn decode_usage(map: &Mapping) -> UsageTable {
    decode_entries(Table::Usage, map)
}

pub fn encode_usage(table: &UsageTable) -> Mapping {
    table
        .iter()
        .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
        .collect()
}

pub fn decode_set(map: &Mapping) -> IdSet {
    map.iter()
        .filter(|(_, v)| v.as_bool().unwrap_or(false))
        .map(|(k, _)| k.clone())
        .collect()
}

pub fn encode_set(set: &IdSet) -> Mapping {
    set.iter().map(|k| (k.clone(), Value::Bool(true))).collect()
}

fn decode_entries<T: DeserializeOwned>(table: Table, map: &Mapping) -> BTreeMap<String, T> {
    let mut out = BTreeMap::new();
    for (k, v) in map {
        match serde_json::from_value::<T>(v.clone()) {
            Ok(t) => {
                out.insert(k.clone(), t);
            }
            Err(e) => {
                warn!("skipping malformed {} entry '{}': {}", table, k, e);
            }
        }
    }
    out
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = PathBuf::from(format!("{}{}", path.display(), TEMP_FILE_SUFFIX));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// One pretty-printed JSON file per table under `data_dir`.
pub struct JsonFileStore {
    data_dir: PathBuf,
    strict_reads: bool,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            strict_reads: false,
        }
    }

    /// Refuse to treat unreadable tables as empty.
    pub fn with_strict_reads(mut self, strict: bool) -> Self {
        self.strict_reads = strict;
        self
    }

    pub fn table_path(&self, table: Table) -> PathBuf {
        self.data_dir.join(table.file_name())
    }

    fn read_table(&self, table: Table) -> Result<Option<Mapping>, StoreError> {
        let path = self.table_path(table);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        let map: Mapping =
            serde_json::from_str(&text).map_err(|e| StoreError::Json { table, source: e })?;
        Ok(Some(map))
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, table: Table) -> Result<Mapping, StoreError> {
        match self.read_table(table) {
            Ok(Some(map)) => Ok(map),
            Ok(None) => {
                let empty = Mapping::new();
                if let Err(e) = self.put(table, &empty) {
                    warn!("could not initialize {} table: {}", table, e);
                } else {
                    debug!("initialized empty {} table", table);
                }
                Ok(empty)
            }
            Err(e) if self.strict_reads => Err(e),
            Err(e) => {
                warn!("{}; treating {} table as empty", e, table);
                Ok(Mapping::new())
            }
        }
    }

    fn put(&self, table: Table, value: &Mapping) -> Result<(), StoreError> {
        let path = self.table_path(table);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Json { table, source: e })?;
        write_atomic(&path, &bytes).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<Table, Mapping>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, table: Table) -> Result<Mapping, StoreError> {
        Ok(self.tables.entry(table).or_default().clone())
    }

    fn put(&self, table: Table, value: &Mapping) -> Result<(), StoreError> {
        self.tables.insert(table, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    #[test]
    fn first_access_creates_empty_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());

        let map = store.get(Table::Vip).unwrap();
        assert!(map.is_empty());

        let on_disk = std::fs::read_to_string(dir.path().join("vip.json")).unwrap();
        assert_eq!(on_disk.trim(), "{}");
    }

    #[test]
    fn put_overwrites_whole_table_without_leftover_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));

        let mut groups = IdSet::new();
        groups.insert("-100123".to_string());
        store.put(Table::Groups, &encode_set(&groups)).unwrap();

        groups.clear();
        groups.insert("-100456".to_string());
        store.put(Table::Groups, &encode_set(&groups)).unwrap();

        let back = decode_set(&store.get(Table::Groups).unwrap());
        assert_eq!(back.into_iter().collect::<Vec<_>>(), vec!["-100456".to_string()]);
        assert!(!dir.path().join("nested/groups.json.tmp").exists());
    }

    #[test]
    fn corrupt_table_is_empty_when_lenient_and_an_error_when_strict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("usage.json"), b"{ not json").unwrap();

        let lenient = JsonFileStore::new(dir.path());
        assert!(lenient.get(Table::Usage).unwrap().is_empty());

        let strict = JsonFileStore::new(dir.path()).with_strict_reads(true);
        let err = strict.get(Table::Usage).unwrap_err();
        assert!(matches!(err, StoreError::Json { table: Table::Usage, .. }));
    }

    #[test]
    fn usage_uses_date_and_uids_keys_and_skips_bad_entries() {
        let raw = json!({
            "u1": { "date": "2024-05-03", "uids": ["a", "b"] },
            "u2": { "date": "not-a-date", "uids": [] },
        });
        let map = raw.as_object().unwrap().clone();
        let table = decode_usage(&map);

        assert_eq!(table.len(), 1);
        assert_eq!(table["u1"].date, d(3));
        assert_eq!(table["u1"].target_ids, vec!["a", "b"]);

        let encoded = encode_usage(&table);
        assert_eq!(encoded["u1"], json!({ "date": "2024-05-03", "uids": ["a", "b"] }));
    }

    #[test]
    fn set_membership_requires_true() {
        let raw = json!({ "a": true, "b": false, "c": "yes" });
        let set = decode_set(raw.as_object().unwrap());
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
    }

    #[test]
    fn rollover_clears_stale_dates_only() {
        let mut rec = UsageRecord::new(d(1));
        assert!(rec.insert("a"));
        assert!(!rec.insert("a"));

        assert_eq!(rec.rolled_over(d(1)).target_ids, vec!["a"]);
        let next = rec.rolled_over(d(2));
        assert_eq!(next.date, d(2));
        assert!(next.target_ids.is_empty());
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.get(Table::Usage).unwrap().is_empty());
        let mut m = Mapping::new();
        m.insert("x".into(), Value::Bool(true));
        store.put(Table::Vip, &m).unwrap();
        assert_eq!(store.get(Table::Vip).unwrap(), m);
        assert!(store.get(Table::Groups).unwrap().is_empty());
    }
}
