//! Persistence of battery history across restarts
//!
//! History records are kept in one JSON file keyed by base path.

use crate::energy::HistoryRecord;
use crate::error::Result;
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Persistent state structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    /// Time of the last save, RFC 3339
    pub saved_at: Option<String>,

    /// History per battery base path
    pub history: BTreeMap<String, HistoryRecord>,
}

/// Persistence manager
pub struct PersistenceManager {
    file_path: String,
    state: PersistentState,
    logger: crate::logging::StructuredLogger,
}

impl PersistenceManager {
    /// Create a new persistence manager
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            state: PersistentState::default(),
            logger: get_logger("persistence"),
        }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Load state from disk
    pub fn load(&mut self) -> Result<()> {
        let path = Path::new(&self.file_path);

        if !path.exists() {
            self.logger
                .info("No persistent state file found, starting with empty history");
            return Ok(());
        }

        let contents = std::fs::read_to_string(path)?;
        self.state = serde_json::from_str(&contents)?;
        for record in self.state.history.values_mut() {
            record.sanitize();
        }
        self.logger.info(&format!(
            "Loaded history for {} batteries from {}",
            self.state.history.len(),
            self.file_path
        ));

        Ok(())
    }

    /// Save state to disk
    pub fn save(&mut self) -> Result<()> {
        self.state.saved_at = Some(chrono::Utc::now().to_rfc3339());
        let contents = serde_json::to_string_pretty(&self.state)?;
        if let Some(parent) = Path::new(&self.file_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = format!("{}.tmp", self.file_path);
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.file_path)?;
        self.logger.debug("Saved persistent state to disk");

        Ok(())
    }

    pub fn history(&self) -> &BTreeMap<String, HistoryRecord> {
        &self.state.history
    }

    /// Replace the stored history
    pub fn set_history(&mut self, history: BTreeMap<String, HistoryRecord>) {
        self.state.history = history;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut pm = PersistenceManager::new(path.to_str().unwrap());
        pm.load().unwrap();
        assert!(pm.history().is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let path = path.to_str().unwrap();

        let mut history = BTreeMap::new();
        history.insert(
            "electrical.batteries.house".to_string(),
            HistoryRecord {
                minimum_voltage: Some(11.9),
                maximum_voltage: Some(14.4),
                charged_energy_kwh: 2.5,
                discharged_energy_kwh: 1.25,
                total_ah_drawn: 104.0,
            },
        );
        let mut pm = PersistenceManager::new(path);
        pm.set_history(history.clone());
        pm.save().unwrap();

        let mut loaded = PersistenceManager::new(path);
        loaded.load().unwrap();
        assert_eq!(loaded.history(), &history);
    }

    #[test]
    fn negative_and_nan_fields_are_sanitized_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(
            &path,
            r#"{"history":{"electrical.batteries.house":{"chargedEnergyKWh":-3.5,"dischargedEnergyKWh":1.0,"totalAhDrawn":-0.1,"minimumVoltage":12.1}}}"#,
        )
        .unwrap();
        let mut pm = PersistenceManager::new(path.to_str().unwrap());
        pm.load().unwrap();
        let record = &pm.history()["electrical.batteries.house"];
        assert_eq!(record.charged_energy_kwh, 0.0);
        assert_eq!(record.total_ah_drawn, 0.0);
        assert_eq!(record.discharged_energy_kwh, 1.0);
        assert_eq!(record.minimum_voltage, Some(12.1));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").unwrap();
        let mut pm = PersistenceManager::new(path.to_str().unwrap());
        assert!(pm.load().is_err());
    }
}
