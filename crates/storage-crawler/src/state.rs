//! Versioned on-disk crawler/lease-checker state (spec.md §3.5, §4.H,
//! component I), plus a one-shot migration path off the legacy
//! Python-pickle state format.
//!
//! Both the state file and the history file are published with
//! write-temp-then-rename so a reader never observes a half-written file
//! (spec.md §4.G: "atomically write state to disk").

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{CrawlerError, Result};

/// Current on-disk format version. Bumped if the schema ever changes in an
/// incompatible way; readers reject anything newer than they understand.
pub const STATE_VERSION: u32 = 1;

/// History is capped at this many most-recent cycles (spec.md §4.G).
pub const HISTORY_CAP: usize = 10;

/// Resumable crawler progress (spec.md §3.5). `cycle_to_date` is an opaque
/// accumulator owned by whatever crawler subclass is running (the
/// lease-expirer's tallies, in this codebase) — the generic crawler only
/// round-trips it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerState {
    pub version: u32,
    #[serde(rename = "current-cycle")]
    pub current_cycle: u64,
    #[serde(rename = "last-complete-prefix")]
    pub last_complete_prefix: Option<String>,
    #[serde(rename = "last-complete-bucket")]
    pub last_complete_bucket: Option<String>,
    #[serde(rename = "current-cycle-start-time")]
    pub current_cycle_start_time: u32,
    #[serde(rename = "last-cycle-finished")]
    pub last_cycle_finished: Option<u32>,
    #[serde(rename = "cycle-to-date")]
    pub cycle_to_date: Value,
}

impl CrawlerState {
    /// A brand-new crawler that has never run.
    pub fn fresh(now: u32) -> Self {
        Self {
            version: STATE_VERSION,
            current_cycle: 0,
            last_complete_prefix: None,
            last_complete_bucket: None,
            current_cycle_start_time: now,
            last_cycle_finished: None,
            cycle_to_date: json!({}),
        }
    }

    pub fn load_or_fresh(path: &Path, now: u32) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::fresh(now));
        }
        let bytes = std::fs::read(path)?;
        if pickle::is_legacy_pickle(&bytes) {
            return Err(CrawlerError::InvalidPickle(
                "state file is a legacy pickle blob; run the migration CLI before starting the server".into(),
            ));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, &serde_json::to_value(self)?)
    }
}

/// Per-cycle summaries, keyed by decimal cycle number, capped at
/// [`HISTORY_CAP`] most-recent entries.
#[derive(Debug, Clone, Default)]
pub struct CrawlerHistory(pub BTreeMap<u64, Value>);

impl CrawlerHistory {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        if pickle::is_legacy_pickle(&bytes) {
            return Err(CrawlerError::InvalidPickle(
                "history file is a legacy pickle blob; run the migration CLI before starting the server".into(),
            ));
        }
        let map: BTreeMap<u64, Value> = serde_json::from_slice(&bytes)?;
        Ok(Self(map))
    }

    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, &serde_json::to_value(&self.0)?)
    }

    pub fn record(&mut self, cycle: u64, summary: Value) {
        self.0.insert(cycle, summary);
        while self.0.len() > HISTORY_CAP {
            if let Some(&oldest) = self.0.keys().next() {
                self.0.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| CrawlerError::Io(e.error))?;
    Ok(())
}

/// Migrates a legacy pickle-encoded state or history file to JSON, in
/// place: the migrated file keeps its original name but now holds JSON
/// bytes (spec.md §4.H). Idempotent — re-running against an
/// already-migrated (JSON) file is a no-op.
///
/// This is invoked only by the out-of-band CLI migration tool; the running
/// server refuses to start against a pickle-format state file
/// ([`CrawlerState::load_or_fresh`]).
pub fn migrate_legacy_pickle_file(path: &Path) -> Result<bool> {
    let bytes = std::fs::read(path)?;
    if !pickle::is_legacy_pickle(&bytes) {
        return Ok(false);
    }
    let value = pickle::decode(&bytes)?;
    write_json_atomic(path, &value)?;
    Ok(true)
}

/// A minimal Python-pickle decoder covering exactly the opcode subset
/// Tahoe-LAFS emits for its crawler/lease-checker state dict: nested
/// dicts/tuples/lists of strings, ints, floats and `None`
/// (`SPEC_FULL.md` §4.J). Anything outside that subset is a fatal error —
/// the migration aborts and leaves the original pickle file untouched.
mod pickle {
    use super::*;

    pub fn is_legacy_pickle(bytes: &[u8]) -> bool {
        bytes.starts_with(b"\x80\x02")
    }

    enum StackItem {
        Mark,
        Value(Value),
    }

    pub fn decode(bytes: &[u8]) -> Result<Value> {
        let mut pos = 0usize;
        let mut stack: Vec<StackItem> = Vec::new();

        loop {
            let op = *bytes
                .get(pos)
                .ok_or_else(|| CrawlerError::InvalidPickle("unexpected end of pickle stream".into()))?;
            pos += 1;
            match op {
                0x80 => {
                    // PROTO: one version byte, must precede everything else.
                    read_u8(bytes, &mut pos)?;
                }
                0x28 => stack.push(StackItem::Mark), // MARK
                0x7d => stack.push(StackItem::Value(json!({}))), // EMPTY_DICT
                0x5d => stack.push(StackItem::Value(Value::Array(Vec::new()))), // EMPTY_LIST
                0x4e => stack.push(StackItem::Value(Value::Null)), // NONE
                0x4a => {
                    // BININT: 4-byte little-endian signed int
                    let v = i32::from_le_bytes(read_bytes::<4>(bytes, &mut pos)?);
                    stack.push(StackItem::Value(json!(v)));
                }
                0x4b => {
                    // BININT1: 1-byte unsigned int
                    let v = read_u8(bytes, &mut pos)?;
                    stack.push(StackItem::Value(json!(v)));
                }
                0x4d => {
                    // BININT2: 2-byte little-endian unsigned int
                    let v = u16::from_le_bytes(read_bytes::<2>(bytes, &mut pos)?);
                    stack.push(StackItem::Value(json!(v)));
                }
                0x47 => {
                    // BINFLOAT: 8-byte big-endian double
                    let v = f64::from_be_bytes(read_bytes::<8>(bytes, &mut pos)?);
                    stack.push(StackItem::Value(json!(v)));
                }
                0x55 => {
                    // SHORT_BINSTRING: 1-byte length prefix
                    let len = read_u8(bytes, &mut pos)? as usize;
                    let s = read_string(bytes, &mut pos, len)?;
                    stack.push(StackItem::Value(Value::String(s)));
                }
                0x58 => {
                    // BINUNICODE: 4-byte little-endian length prefix
                    let len = u32::from_le_bytes(read_bytes::<4>(bytes, &mut pos)?) as usize;
                    let s = read_string(bytes, &mut pos, len)?;
                    stack.push(StackItem::Value(Value::String(s)));
                }
                0x74 => {
                    // TUPLE: everything back to the mark
                    let items = pop_to_mark(&mut stack)?;
                    stack.push(StackItem::Value(Value::Array(items)));
                }
                0x85 => {
                    let v = pop_value(&mut stack)?;
                    stack.push(StackItem::Value(Value::Array(vec![v])));
                }
                0x86 => {
                    let b = pop_value(&mut stack)?;
                    let a = pop_value(&mut stack)?;
                    stack.push(StackItem::Value(Value::Array(vec![a, b])));
                }
                0x87 => {
                    let c = pop_value(&mut stack)?;
                    let b = pop_value(&mut stack)?;
                    let a = pop_value(&mut stack)?;
                    stack.push(StackItem::Value(Value::Array(vec![a, b, c])));
                }
                0x64 => {
                    // DICT: key/value pairs back to the mark, no prior dict object
                    let items = pop_to_mark(&mut stack)?;
                    stack.push(StackItem::Value(Value::Object(pairs_to_object(items)?)));
                }
                0x75 => {
                    // SETITEMS: key/value pairs back to the mark, merged into
                    // the dict object sitting just below the mark.
                    let items = pop_to_mark(&mut stack)?;
                    let mut obj = pop_object(&mut stack)?;
                    merge_pairs(&mut obj, items)?;
                    stack.push(StackItem::Value(Value::Object(obj)));
                }
                0x73 => {
                    // SETITEM: single key/value pair onto the dict below it.
                    let value = pop_value(&mut stack)?;
                    let key = pop_value(&mut stack)?;
                    let mut obj = pop_object(&mut stack)?;
                    obj.insert(value_to_key(key)?, value);
                    stack.push(StackItem::Value(Value::Object(obj)));
                }
                0x61 => {
                    // APPEND: single value onto the list below it.
                    let value = pop_value(&mut stack)?;
                    let mut list = pop_array(&mut stack)?;
                    list.push(value);
                    stack.push(StackItem::Value(Value::Array(list)));
                }
                0x65 => {
                    // APPENDS: values back to the mark, onto the list below.
                    let items = pop_to_mark(&mut stack)?;
                    let mut list = pop_array(&mut stack)?;
                    list.extend(items);
                    stack.push(StackItem::Value(Value::Array(list)));
                }
                0x2e => {
                    // STOP
                    return pop_value(&mut stack);
                }
                other => {
                    return Err(CrawlerError::InvalidPickle(format!(
                        "unsupported pickle opcode 0x{other:02x} outside the crawler-state subset"
                    )));
                }
            }
        }
    }

    fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
        let v = *bytes
            .get(*pos)
            .ok_or_else(|| CrawlerError::InvalidPickle("unexpected end of pickle stream".into()))?;
        *pos += 1;
        Ok(v)
    }

    fn read_bytes<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
        let end = *pos + N;
        let slice = bytes
            .get(*pos..end)
            .ok_or_else(|| CrawlerError::InvalidPickle("unexpected end of pickle stream".into()))?;
        let arr: [u8; N] = slice.try_into().expect("slice length matches N");
        *pos = end;
        Ok(arr)
    }

    fn read_string(bytes: &[u8], pos: &mut usize, len: usize) -> Result<String> {
        let end = *pos + len;
        let slice = bytes
            .get(*pos..end)
            .ok_or_else(|| CrawlerError::InvalidPickle("unexpected end of pickle stream".into()))?;
        *pos = end;
        Ok(String::from_utf8_lossy(slice).into_owned())
    }

    fn pop_value(stack: &mut Vec<StackItem>) -> Result<Value> {
        match stack.pop() {
            Some(StackItem::Value(v)) => Ok(v),
            _ => Err(CrawlerError::InvalidPickle("expected a value on the pickle stack".into())),
        }
    }

    fn pop_object(stack: &mut Vec<StackItem>) -> Result<serde_json::Map<String, Value>> {
        match pop_value(stack)? {
            Value::Object(m) => Ok(m),
            _ => Err(CrawlerError::InvalidPickle("expected a dict on the pickle stack".into())),
        }
    }

    fn pop_array(stack: &mut Vec<StackItem>) -> Result<Vec<Value>> {
        match pop_value(stack)? {
            Value::Array(v) => Ok(v),
            _ => Err(CrawlerError::InvalidPickle("expected a list on the pickle stack".into())),
        }
    }

    fn pop_to_mark(stack: &mut Vec<StackItem>) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            match stack.pop() {
                Some(StackItem::Mark) => {
                    items.reverse();
                    return Ok(items);
                }
                Some(StackItem::Value(v)) => items.push(v),
                None => return Err(CrawlerError::InvalidPickle("mark not found on pickle stack".into())),
            }
        }
    }

    fn value_to_key(v: Value) -> Result<String> {
        match v {
            Value::String(s) => Ok(s),
            other => Err(CrawlerError::InvalidPickle(format!(
                "crawler state dict keys must be strings, found {other}"
            ))),
        }
    }

    fn pairs_to_object(items: Vec<Value>) -> Result<serde_json::Map<String, Value>> {
        if items.len() % 2 != 0 {
            return Err(CrawlerError::InvalidPickle("dict opcode saw an odd number of stack items".into()));
        }
        let mut obj = serde_json::Map::new();
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            obj.insert(value_to_key(key)?, value);
        }
        Ok(obj)
    }

    fn merge_pairs(obj: &mut serde_json::Map<String, Value>, items: Vec<Value>) -> Result<()> {
        let merged = pairs_to_object(items)?;
        obj.extend(merged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_serialize_deserialize_is_a_fixed_point() {
        let state = CrawlerState::fresh(1_000_000);
        let dir = tempdir().unwrap();
        let path = dir.path().join("lease_checker.state");
        state.save_atomic(&path).unwrap();
        let reloaded = CrawlerState::load_or_fresh(&path, 0).unwrap();
        let path2 = dir.path().join("lease_checker.state.2");
        reloaded.save_atomic(&path2).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), std::fs::read_to_string(&path2).unwrap());
    }

    #[test]
    fn history_is_capped_at_ten_entries() {
        let mut history = CrawlerHistory::default();
        for cycle in 0..15 {
            history.record(cycle, json!({ "cycle": cycle }));
        }
        assert_eq!(history.0.len(), HISTORY_CAP);
        assert!(!history.0.contains_key(&0));
        assert!(history.0.contains_key(&14));
    }

    #[test]
    fn legacy_pickle_is_detected() {
        assert!(pickle::is_legacy_pickle(b"\x80\x02}q\x00."));
        assert!(!pickle::is_legacy_pickle(b"{\"version\":1}"));
    }

    #[test]
    fn migrates_a_minimal_pickled_dict() {
        // {'version': 1, 'current-cycle': None}
        let mut bytes = vec![0x80, 0x02]; // PROTO 2
        bytes.push(0x7d); // EMPTY_DICT
        bytes.push(0x28); // MARK
        bytes.extend(encode_short_string("version"));
        bytes.push(0x4b); // BININT1
        bytes.push(1);
        bytes.extend(encode_short_string("current-cycle"));
        bytes.push(0x4e); // NONE
        bytes.push(0x75); // SETITEMS
        bytes.push(0x2e); // STOP

        let dir = tempdir().unwrap();
        let path = dir.path().join("lease_checker.state");
        std::fs::write(&path, &bytes).unwrap();

        let migrated = migrate_legacy_pickle_file(&path).unwrap();
        assert!(migrated);
        let contents = std::fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["version"], json!(1));
        assert_eq!(value["current-cycle"], Value::Null);

        // Idempotent: re-running against the now-JSON file is a no-op.
        assert!(!migrate_legacy_pickle_file(&path).unwrap());
    }

    fn encode_short_string(s: &str) -> Vec<u8> {
        let mut out = vec![0x55, s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }
}
