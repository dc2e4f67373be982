use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::{TrackerError, TrackerState, TrackerStatus, TrackerStore};
use crate::{Side, Symbol};

/// Tracker rows in an embedded SQLite database, one row per symbol.
/// Several symbols may share one database file.
pub struct SqliteTrackerStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    symbol: Symbol,
}

impl SqliteTrackerStore {
    pub fn open<P: AsRef<Path>>(db_path: P, symbol: Symbol) -> Result<Self, TrackerError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrackerError::io(parent, e))?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trackers (
                symbol TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_side TEXT,
                stop_loss_ids TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        debug!("SQLite tracker store opened: {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            symbol,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> TrackerError {
        TrackerError::CorruptState {
            location: self.location(),
            reason: reason.into(),
        }
    }

    fn parse_row(
        &self,
        status: String,
        last_side: Option<String>,
        ids: String,
    ) -> Result<TrackerState, TrackerError> {
        let status = status
            .parse::<TrackerStatus>()
            .map_err(|e| self.corrupt(e))?;
        let last_side = last_side
            .map(|s| s.parse::<Side>())
            .transpose()
            .map_err(|e| self.corrupt(e))?;
        let stop_loss_ids: BTreeSet<String> =
            serde_json::from_str(&ids).map_err(|e| self.corrupt(e.to_string()))?;

        Ok(TrackerState {
            status,
            last_side,
            stop_loss_ids,
        })
    }
}

impl TrackerStore for SqliteTrackerStore {
    fn read(&self) -> Result<TrackerState, TrackerError> {
        let row = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT status, last_side, stop_loss_ids FROM trackers WHERE symbol = ?1",
                params![self.symbol.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };

        match row {
            Some((status, last_side, ids)) => self.parse_row(status, last_side, ids),
            None => {
                let state = TrackerState::default();
                self.write(&state)?;
                info!("Created tracker row for {} in {}", self.symbol, self.db_path.display());
                Ok(state)
            }
        }
    }

    fn write(&self, state: &TrackerState) -> Result<(), TrackerError> {
        let ids = serde_json::to_string(&state.stop_loss_ids)
            .map_err(|e| self.corrupt(e.to_string()))?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        conn.execute(
            "INSERT OR REPLACE INTO trackers (symbol, status, last_side, stop_loss_ids, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)",
            params![
                self.symbol.as_str(),
                state.status.as_str(),
                state.last_side.map(Side::as_str),
                ids,
            ],
        )?;

        debug!(
            "Tracker saved: {} [{}] last_side={:?} stop_loss_ids={:?}",
            self.symbol, state.status, state.last_side, state.stop_loss_ids
        );
        Ok(())
    }

    fn location(&self) -> String {
        format!("{}#{}", self.db_path.display(), self.symbol)
    }

    fn lock_path(&self) -> PathBuf {
        self.db_path
            .with_file_name(format!("tracker_{}.lock", self.symbol.file_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::test_support::temp_state_dir;

    #[test]
    fn test_round_trip_and_symbol_isolation() {
        let dir = temp_state_dir();
        let db = dir.join("trackers.db");
        let btc = SqliteTrackerStore::open(&db, Symbol::new("BTC/USDT")).unwrap();
        let eth = SqliteTrackerStore::open(&db, Symbol::new("ETH/USDT")).unwrap();

        let mut state = TrackerState {
            last_side: Some(Side::Buy),
            ..Default::default()
        };
        state.stop_loss_ids.insert("sl-1".to_string());
        btc.write(&state).unwrap();

        assert_eq!(btc.read().unwrap(), state);
        assert_eq!(eth.read().unwrap(), TrackerState::default());
    }

    #[test]
    fn test_bad_row_is_corrupt() {
        let dir = temp_state_dir();
        let db = dir.join("trackers.db");
        let store = SqliteTrackerStore::open(&db, Symbol::new("BTC/USDT")).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO trackers (symbol, status, last_side, stop_loss_ids)
                 VALUES ('BTC/USDT', 'ok_to_trade', 'long', '[]')",
                [],
            )
            .unwrap();
        }

        assert!(matches!(
            store.read(),
            Err(TrackerError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_lock_path_is_per_symbol() {
        let dir = temp_state_dir();
        let store =
            SqliteTrackerStore::open(dir.join("trackers.db"), Symbol::new("BTC/USDT")).unwrap();
        assert_eq!(store.lock_path(), dir.join("tracker_BTC-USDT.lock"));
    }
}
