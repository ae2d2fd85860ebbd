//! Fix-History Ledger: duplicate-fix suppression.
//!
//! A fix attempt can print the same completion keywords that triggered the
//! verification in the first place, which would loop verify → inject →
//! verify forever. Each accepted issue records its body fingerprint; the same
//! fingerprint is suppressed until the cooldown has passed.
//!
//! File format: a JSON object mapping fingerprint → last-fix epoch millis.
//!
//! ```json
//! { "-1827362211": 1767225600000 }
//! ```

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};

/// Deterministic 32-bit rolling hash (`h = h * 31 + unit`) over the UTF-16
/// code units of `body`, rendered as a signed decimal string.
///
/// Not cryptographic. Two bodies of equal length that differ in one character
/// always hash differently.
pub fn fingerprint(body: &str) -> String {
    let mut hash: i32 = 0;
    for unit in body.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    hash.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixDecision {
    Accept { fingerprint: String },
    Suppress { fingerprint: String, last_fixed_at: i64 },
}

impl FixDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FixDecision::Accept { .. })
    }
}

#[derive(Debug)]
pub struct FixLedger {
    path: PathBuf,
    cooldown_ms: i64,
    entries: BTreeMap<String, i64>,
}

impl FixLedger {
    /// Load the ledger at `path`. A missing or corrupt file starts empty.
    pub fn load(path: PathBuf, cooldown: Duration) -> Self {
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to load fix history; starting empty");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "Fix history loaded");
        Self {
            path,
            cooldown_ms: cooldown.as_millis().min(i64::MAX as u128) as i64,
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_fixed_at(&self, fingerprint: &str) -> Option<i64> {
        self.entries.get(fingerprint).copied()
    }

    /// Decide whether `body` may be remediated at `now_ms`.
    ///
    /// On acceptance the fingerprint is recorded, stale entries are pruned and
    /// the ledger is persisted. A persistence failure is logged but does not
    /// turn the acceptance into a suppression.
    pub fn check(&mut self, body: &str, now_ms: i64) -> FixDecision {
        let fingerprint = fingerprint(body);

        if let Some(last_fixed_at) = self.entries.get(&fingerprint).copied() {
            if now_ms.saturating_sub(last_fixed_at) < self.cooldown_ms {
                info!(
                    fingerprint = %fingerprint,
                    last_fixed_at,
                    "Skipping duplicate issue (already remediated within cooldown)"
                );
                return FixDecision::Suppress {
                    fingerprint,
                    last_fixed_at,
                };
            }
        }

        self.entries.insert(fingerprint.clone(), now_ms);
        self.prune(now_ms);
        if let Err(err) = self.save() {
            warn!(error = %err, path = %self.path.display(), "Failed to persist fix history");
        }
        FixDecision::Accept { fingerprint }
    }

    /// Drop entries older than twice the cooldown.
    pub fn prune(&mut self, now_ms: i64) {
        let horizon = self.cooldown_ms.saturating_mul(2);
        self.entries
            .retain(|_, fixed_at| now_ms.saturating_sub(*fixed_at) <= horizon);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| SupervisorError::io("Failed to create fix history dir", err))?;
        }

        let payload = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| SupervisorError::json("Failed to serialize fix history", err))?;
        let tmp_path = self.path.with_extension("tmp");
        fs_err::write(&tmp_path, payload)
            .map_err(|err| SupervisorError::io("Failed to write fix history", err))?;
        fs_err::rename(&tmp_path, &self.path)
            .map_err(|err| SupervisorError::io("Failed to commit fix history", err))?;
        Ok(())
    }

    /// Prune and persist; used on rebinding and shutdown.
    pub fn flush(&mut self, now_ms: i64) -> Result<()> {
        self.prune(now_ms);
        self.save()
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, i64>> {
    let data = match fs_err::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(SupervisorError::io("Failed to read fix history", err)),
    };

    let value: Value = serde_json::from_slice(&data)
        .map_err(|err| SupervisorError::json("Failed to parse fix history", err))?;
    let object = match value {
        Value::Object(object) => object,
        _ => return Ok(BTreeMap::new()),
    };

    // Older writers stored floats; anything non-numeric is skipped.
    Ok(object
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_i64()
                .or_else(|| value.as_f64().map(|v| v as i64))
                .map(|timestamp| (key, timestamp))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(300);
    const T0: i64 = 1_767_225_600_000;

    #[test]
    fn fingerprint_is_stable() {
        let body = "SyntaxError: missing ) on line 3";
        assert_eq!(fingerprint(body), fingerprint(body));
        assert_eq!(fingerprint(""), "0");
        // "ab" = 97 * 31 + 98
        assert_eq!(fingerprint("ab"), "3105");
    }

    #[test]
    fn fingerprint_changes_with_one_character() {
        assert_ne!(
            fingerprint("SyntaxError: missing ) on line 3"),
            fingerprint("SyntaxError: missing ) on line 4")
        );
        assert_ne!(fingerprint("lint failed"), fingerprint("lint failed."));
    }

    #[test]
    fn fingerprint_wraps_on_long_input() {
        let body = "x".repeat(10_000);
        let value: i64 = fingerprint(&body).parse().expect("decimal");
        assert!(value >= i32::MIN as i64 && value <= i32::MAX as i64);
    }

    #[test]
    fn duplicate_within_cooldown_is_suppressed() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut ledger = FixLedger::load(temp_dir.path().join("s.history.json"), COOLDOWN);

        assert!(ledger.check("boom", T0).is_accept());
        let second = ledger.check("boom", T0 + 60_000);
        assert!(matches!(second, FixDecision::Suppress { last_fixed_at, .. } if last_fixed_at == T0));
        assert!(ledger.check("different", T0 + 60_000).is_accept());
    }

    #[test]
    fn duplicate_after_cooldown_is_accepted() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut ledger = FixLedger::load(temp_dir.path().join("s.history.json"), COOLDOWN);

        assert!(ledger.check("boom", T0).is_accept());
        assert!(ledger.check("boom", T0 + 300_000).is_accept());
        assert_eq!(ledger.last_fixed_at(&fingerprint("boom")), Some(T0 + 300_000));
    }

    #[test]
    fn acceptance_prunes_entries_older_than_twice_cooldown() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut ledger = FixLedger::load(temp_dir.path().join("s.history.json"), COOLDOWN);

        ledger.check("old", T0);
        ledger.check("new", T0 + 600_001);
        assert_eq!(ledger.last_fixed_at(&fingerprint("old")), None);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn ledger_survives_restart() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("s.history.json");

        let mut ledger = FixLedger::load(path.clone(), COOLDOWN);
        ledger.check("boom", T0);
        drop(ledger);

        let mut reloaded = FixLedger::load(path.clone(), COOLDOWN);
        assert!(!reloaded.check("boom", T0 + 1_000).is_accept());

        let raw: serde_json::Value =
            serde_json::from_slice(&fs_err::read(&path).expect("read")).expect("json");
        assert_eq!(raw[fingerprint("boom")], serde_json::json!(T0));
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("s.history.json");
        fs_err::write(&path, "not json").expect("write");

        let ledger = FixLedger::load(path, COOLDOWN);
        assert!(ledger.is_empty());
    }
}
