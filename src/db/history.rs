//! Best-effort ping history on top of the key/value store.
//!
//! Backend failures are logged and swallowed here so a broken store never
//! fails the probe that produced the result.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::models::*;
use super::store::{DbError, Store};

/// Records and lists probe outcomes keyed by target URL.
#[derive(Clone)]
pub struct PingHistory {
    store: Arc<Store>,
}

impl PingHistory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Upsert the record for `target`.
    pub fn save(&self, target: &str, record: PingRecord) {
        let key = url_key(target);
        match self.store.put(&key, &record) {
            Ok(()) => tracing::debug!(key = %key, "Saved ping record"),
            Err(e) => tracing::error!(key = %key, error = %e, "Failed to save ping record"),
        }
    }

    /// Look up the record for `target`.
    pub fn get(&self, target: &str) -> Option<PingRecord> {
        match self.store.get(&url_key(target)) {
            Ok(record) => Some(record),
            Err(DbError::NotFound) => None,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "Failed to read ping record");
                None
            }
        }
    }

    /// Every recorded target mapped to its summary line.
    ///
    /// Scans the whole namespace, so cost grows with the number of distinct
    /// targets ever probed.
    pub fn list_all(&self) -> BTreeMap<String, String> {
        match self.store.scan_prefix(URL_KEY_PREFIX) {
            Ok(records) => records
                .into_iter()
                .map(|(key, record)| {
                    let target = key
                        .strip_prefix(URL_KEY_PREFIX)
                        .unwrap_or(&key)
                        .to_string();
                    (target, record.summary())
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list ping history");
                BTreeMap::new()
            }
        }
    }
}
