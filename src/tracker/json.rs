use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{TrackerError, TrackerState, TrackerStore};

/// One JSON file per symbol:
/// `{"status": "...", "last_side": "buy"|"sell"|null, "stop_loss_ids": [...]}`
#[derive(Debug, Clone)]
pub struct JsonTrackerStore {
    path: PathBuf,
}

impl JsonTrackerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrackerStore for JsonTrackerStore {
    fn read(&self) -> Result<TrackerState, TrackerError> {
        if !self.path.exists() {
            let state = TrackerState::default();
            self.write(&state)?;
            info!("Created tracker file {}", self.path.display());
            return Ok(state);
        }

        let contents =
            fs::read_to_string(&self.path).map_err(|e| TrackerError::io(&self.path, e))?;
        serde_json::from_str(&contents).map_err(|e| TrackerError::CorruptState {
            location: self.location(),
            reason: e.to_string(),
        })
    }

    fn write(&self, state: &TrackerState) -> Result<(), TrackerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TrackerError::io(parent, e))?;
        }

        let body = serde_json::to_string(state).map_err(|e| TrackerError::CorruptState {
            location: self.location(),
            reason: e.to_string(),
        })?;

        // readers never see a half-written record
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| TrackerError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| TrackerError::io(&self.path, e))?;

        debug!(
            "Tracker saved: {} status={} last_side={:?} stop_loss_ids={:?}",
            self.path.display(),
            state.status,
            state.last_side,
            state.stop_loss_ids
        );
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::test_support::temp_state_dir;
    use crate::tracker::TrackerStatus;
    use crate::Side;

    #[test]
    fn test_first_read_creates_default_file() {
        let dir = temp_state_dir();
        let store = JsonTrackerStore::new(dir.join("tracker_BTC-USDT.json"));

        let state = store.read().unwrap();
        assert_eq!(state, TrackerState::default());
        assert!(store.path().exists());
    }

    #[test]
    fn test_round_trip() {
        let dir = temp_state_dir();
        let store = JsonTrackerStore::new(dir.join("tracker_BTC-USDT.json"));

        let mut state = TrackerState {
            status: TrackerStatus::OkToTrade,
            last_side: Some(Side::Buy),
            ..Default::default()
        };
        state.stop_loss_ids.insert("1234".to_string());
        state.stop_loss_ids.insert("5678".to_string());

        store.write(&state).unwrap();
        assert_eq!(store.read().unwrap(), state);

        let empty = TrackerState::stop_loss_triggered(Side::Buy);
        store.write(&empty).unwrap();
        assert_eq!(store.read().unwrap(), empty);
    }

    #[test]
    fn test_corrupt_file_is_surfaced_not_reset() {
        let dir = temp_state_dir();
        let path = dir.join("tracker_BTC-USDT.json");
        fs::write(&path, "{\"status\": \"maybe\"").unwrap();
        let store = JsonTrackerStore::new(&path);

        assert!(matches!(
            store.read(),
            Err(TrackerError::CorruptState { .. })
        ));
        // the bad record is left in place for the operator
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"status\": \"maybe\"");
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let dir = temp_state_dir();
        let path = dir.join("tracker_BTC-USDT.json");
        fs::write(&path, r#"{"status":"paused","last_side":null,"stop_loss_ids":[]}"#).unwrap();

        assert!(matches!(
            JsonTrackerStore::new(&path).read(),
            Err(TrackerError::CorruptState { .. })
        ));
    }
}
