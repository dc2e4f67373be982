//! Tracker store
//!
//! Durable per-symbol record of the trading gate (`status`), the side of the
//! last closed position and the ids of armed stop-loss orders. Two backends
//! share one contract:
//!
//! - [`JsonTrackerStore`]: one small JSON file per symbol
//! - [`SqliteTrackerStore`]: one row per symbol in an embedded SQLite file
//!
//! Both create the default record on first read and refuse to "repair" a record
//! they cannot parse: silently resetting the gate could re-arm entries that a
//! stop-loss had just disabled.

mod json;
mod lock;
mod sqlite;

pub use json::JsonTrackerStore;
pub use lock::TrackerLock;
pub use sqlite::SqliteTrackerStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::{Side, Symbol};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("corrupt tracker state at {location}: {reason}")]
    CorruptState { location: String, reason: String },

    #[error("tracker is locked by another cycle: {}", path.display())]
    Locked { path: PathBuf },

    #[error("tracker I/O error at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracker database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("unknown tracker backend '{0}' (expected 'json' or 'sqlite')")]
    UnknownBackend(String),
}

impl TrackerError {
    pub(crate) fn io(location: impl AsRef<Path>, source: std::io::Error) -> Self {
        TrackerError::Io {
            location: location.as_ref().display().to_string(),
            source,
        }
    }
}

/// Trading gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    #[default]
    OkToTrade,
    StopLossTriggered,
}

impl TrackerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerStatus::OkToTrade => "ok_to_trade",
            TrackerStatus::StopLossTriggered => "stop_loss_triggered",
        }
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok_to_trade" => Ok(TrackerStatus::OkToTrade),
            "stop_loss_triggered" => Ok(TrackerStatus::StopLossTriggered),
            other => Err(format!("unknown tracker status '{}'", other)),
        }
    }
}

/// Persisted per-symbol state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackerState {
    pub status: TrackerStatus,
    pub last_side: Option<Side>,
    /// Older records written without this key read as "nothing armed"
    #[serde(default)]
    pub stop_loss_ids: BTreeSet<String>,
}

impl TrackerState {
    pub fn is_ok_to_trade(&self) -> bool {
        self.status == TrackerStatus::OkToTrade
    }

    /// State after a protective order was seen filled
    pub fn stop_loss_triggered(side: Side) -> Self {
        TrackerState {
            status: TrackerStatus::StopLossTriggered,
            last_side: Some(side),
            stop_loss_ids: BTreeSet::new(),
        }
    }

    /// Re-open the gate, keeping the side that closed the last position
    pub fn resumed(&self) -> Self {
        TrackerState {
            status: TrackerStatus::OkToTrade,
            last_side: self.last_side,
            stop_loss_ids: BTreeSet::new(),
        }
    }
}

/// Full-record read/overwrite of one symbol's tracker
pub trait TrackerStore: Send + Sync {
    /// Read the record, creating and persisting the default one on first use
    fn read(&self) -> Result<TrackerState, TrackerError>;

    /// Overwrite the whole record
    fn write(&self, state: &TrackerState) -> Result<(), TrackerError>;

    /// Human-readable location for logs
    fn location(&self) -> String;

    /// Advisory lock file guarding this symbol's read-decide-write sequence
    fn lock_path(&self) -> PathBuf;

    /// Take the advisory lock; fails fast if another cycle holds it
    fn lock(&self) -> Result<TrackerLock, TrackerError> {
        TrackerLock::acquire(self.lock_path())
    }
}

/// File name of a symbol's JSON record: `tracker_BTC-USDT.json`
pub fn tracker_file_name(symbol: &Symbol) -> String {
    format!("tracker_{}.json", symbol.file_key())
}

/// Open the tracker store for `symbol` under `state_dir` with the named backend
pub fn create_tracker_store<P: AsRef<Path>>(
    state_dir: P,
    backend: &str,
    symbol: &Symbol,
) -> Result<Box<dyn TrackerStore>, TrackerError> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir).map_err(|e| TrackerError::io(state_dir, e))?;

    match backend {
        "json" => Ok(Box::new(JsonTrackerStore::new(
            state_dir.join(tracker_file_name(symbol)),
        ))),
        "sqlite" => Ok(Box::new(SqliteTrackerStore::open(
            state_dir.join("trackers.db"),
            symbol.clone(),
        )?)),
        other => Err(TrackerError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    /// Fresh, unique directory under the system temp dir
    pub fn temp_state_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("envelope-bot-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_layout() {
        let state = TrackerState::default();
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(
            json,
            r#"{"status":"ok_to_trade","last_side":null,"stop_loss_ids":[]}"#
        );
    }

    #[test]
    fn test_missing_stop_loss_ids_reads_as_empty() {
        let state: TrackerState =
            serde_json::from_str(r#"{"status":"ok_to_trade","last_side":"buy"}"#).unwrap();
        assert_eq!(state.last_side, Some(Side::Buy));
        assert!(state.stop_loss_ids.is_empty());
    }

    #[test]
    fn test_tracker_file_name() {
        assert_eq!(
            tracker_file_name(&Symbol::new("BTC/USDT")),
            "tracker_BTC-USDT.json"
        );
    }

    #[test]
    fn test_unknown_backend() {
        let dir = test_support::temp_state_dir();
        let result = create_tracker_store(&dir, "redis", &Symbol::new("BTC/USDT"));
        assert!(matches!(result, Err(TrackerError::UnknownBackend(_))));
    }

    #[test]
    fn test_factory_backends_share_contract() {
        let dir = test_support::temp_state_dir();
        let symbol = Symbol::new("ETH/USDT");
        for backend in ["json", "sqlite"] {
            let store = create_tracker_store(&dir, backend, &symbol).unwrap();
            assert_eq!(store.read().unwrap(), TrackerState::default());

            let state = TrackerState::stop_loss_triggered(Side::Sell);
            store.write(&state).unwrap();
            assert_eq!(store.read().unwrap(), state);
        }
    }
}
