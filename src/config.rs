use crate::db;
use log::warn;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SETTINGS_KEY: &str = "reportcards.engine";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Overall average at or above which a student counts as passing.
    pub pass_mark: f64,
    /// Shown where a teacher or homeroom teacher is missing.
    pub not_assigned_label: String,
    /// Extra period name -> sequences entries, checked before the built-in table.
    pub period_sequences: BTreeMap<String, [u8; 2]>,
    pub busy_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pass_mark: 10.0,
            not_assigned_label: "Not assigned".to_string(),
            period_sequences: BTreeMap::new(),
            busy_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=20.0).contains(&self.pass_mark) {
            return Err("passMark must be between 0 and 20".to_string());
        }
        if self.not_assigned_label.trim().is_empty() {
            return Err("notAssignedLabel must not be empty".to_string());
        }
        if self.not_assigned_label.chars().count() > 80 {
            return Err("notAssignedLabel must be at most 80 characters".to_string());
        }
        for (name, seqs) in &self.period_sequences {
            if name.trim().is_empty() {
                return Err("periodSequences keys must not be empty".to_string());
            }
            if seqs.iter().any(|s| !(1..=6).contains(s)) {
                return Err(format!("periodSequences.{}: sequences must be 1..6", name));
            }
            if seqs[0] == seqs[1] {
                return Err(format!(
                    "periodSequences.{}: sequences must be distinct",
                    name
                ));
            }
        }
        if self.busy_timeout_ms > 60_000 {
            return Err("busyTimeoutMs must be at most 60000".to_string());
        }
        Ok(())
    }

    /// Merge a partial JSON object over this config. Unknown keys are rejected.
    pub fn with_patch(&self, patch: &serde_json::Map<String, Value>) -> Result<Self, String> {
        let mut current = serde_json::to_value(self).map_err(|e| e.to_string())?;
        let Some(obj) = current.as_object_mut() else {
            return Err("config is not an object".to_string());
        };
        for (k, v) in patch {
            if !obj.contains_key(k) {
                return Err(format!("unknown config field: {}", k));
            }
            obj.insert(k.clone(), v.clone());
        }
        let next: EngineConfig =
            serde_json::from_value(current).map_err(|e| format!("invalid config: {}", e))?;
        next.validate()?;
        Ok(next)
    }
}

pub fn load(conn: &Connection) -> anyhow::Result<EngineConfig> {
    let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? else {
        return Ok(EngineConfig::default());
    };
    // A malformed historical value must not keep the workspace from opening.
    match serde_json::from_value::<EngineConfig>(saved) {
        Ok(cfg) => match cfg.validate() {
            Ok(()) => Ok(cfg),
            Err(msg) => {
                warn!("ignoring invalid {} settings: {}", SETTINGS_KEY, msg);
                Ok(EngineConfig::default())
            }
        },
        Err(e) => {
            warn!("ignoring malformed {} settings: {}", SETTINGS_KEY, e);
            Ok(EngineConfig::default())
        }
    }
}

pub fn save(conn: &Connection, cfg: &EngineConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(cfg)?)
}
