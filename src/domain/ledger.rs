//! Presence ledger: last-seen timestamps per device id.
//!
//! The ledger is the only input to staleness decisions. Every known id has
//! a last-seen entry; `forget` removes both together.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::debug;

/// Persisted form: device id → RFC 3339 last-seen timestamp.
pub type LedgerDocument = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleDevice {
    pub id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PresenceLedger {
    last_seen: HashMap<String, DateTime<Utc>>,
    known: HashSet<String>,
    /// Ids present in the previous poll. Not persisted.
    present: HashSet<String>,
}

impl PresenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted document, discarding entries older than
    /// twice the staleness threshold and entries that fail to parse.
    pub fn restore(doc: &LedgerDocument, now: DateTime<Utc>, stale_days: u32) -> Self {
        let cutoff = now - Duration::days(i64::from(stale_days) * 2);
        let mut ledger = Self::new();
        let mut discarded = 0usize;

        for (id, raw) in doc {
            match parse_timestamp(raw) {
                Some(ts) if ts >= cutoff => {
                    ledger.last_seen.insert(id.clone(), ts);
                    ledger.known.insert(id.clone());
                }
                _ => discarded += 1,
            }
        }

        debug!(
            loaded = ledger.known.len(),
            discarded, "restored device-seen timestamps"
        );
        ledger
    }

    /// Record one poll's device ids. Returns the ids that were present in
    /// the previous poll and are missing from this one.
    pub fn observe(&mut self, current: &HashSet<String>, now: DateTime<Utc>) -> BTreeSet<String> {
        let newly_absent = self.present.difference(current).cloned().collect();
        for id in current {
            self.last_seen.insert(id.clone(), now);
            self.known.insert(id.clone());
        }
        self.present = current.clone();
        newly_absent
    }

    /// Known ids absent from `current` whose last sighting is at least
    /// `threshold` old. Ids without a timestamp are never reported.
    pub fn stale(
        &self,
        current: &HashSet<String>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Vec<StaleDevice> {
        let mut stale: Vec<StaleDevice> = self
            .known
            .difference(current)
            .filter_map(|id| {
                let last_seen = *self.last_seen.get(id)?;
                (now - last_seen >= threshold).then(|| StaleDevice {
                    id: id.clone(),
                    last_seen,
                })
            })
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        stale
    }

    pub fn forget(&mut self, id: &str) {
        self.known.remove(id);
        self.last_seen.remove(id);
        self.present.remove(id);
    }

    pub fn last_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(id).copied()
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn to_document(&self) -> LedgerDocument {
        self.last_seen
            .iter()
            .map(|(id, ts)| (id.clone(), ts.to_rfc3339()))
            .collect()
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
