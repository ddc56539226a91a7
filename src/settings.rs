use anyhow::Result;
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
#[cfg(test)]
use {anyhow::anyhow, std::sync::Mutex};
use tracing::{info, warn};

use crate::domain::{RiskSettings, RiskSettingsUpdate};
use crate::error::{TradeError, TradeResult};

pub const SETTINGS_KEY: &str = "trading_settings";

const FIELD_LEVERAGE: &str = "leverageMultiplier";
const FIELD_TAKE_PROFIT: &str = "takeProfitPercentage";
const FIELD_STOP_LOSS: &str = "stopLossPercentage";

/// Hash-style key-value store: named records of string fields.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
}

/// JSON document on disk holding `{ "<key>": { "<field>": "<value>" } }`.
pub struct FileKvStore {
    path: PathBuf,
}

type Document = BTreeMap<String, BTreeMap<String, String>>;

impl FileKvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    fn load(&self) -> Result<Document> {
        if !self.path.exists() {
            return Ok(Document::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Document::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, doc: &Document) -> Result<()> {
        let raw = serde_json::to_string_pretty(doc)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let doc = self.load()?;
        Ok(doc
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut doc = self.load()?;
        let hash = doc.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        self.save(&doc)
    }
}

/// In-process store. `unreachable` makes every call fail like a dropped connection.
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryKvStore {
    data: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    unreachable: bool,
}

#[cfg(test)]
impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self { unreachable: true, ..Self::default() }
    }
}

#[cfg(test)]
#[async_trait]
impl KvStore for MemoryKvStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        if self.unreachable {
            return Err(anyhow!("connection refused"));
        }
        let data = self.data.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(data.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if self.unreachable {
            return Err(anyhow!("connection refused"));
        }
        let mut data = self.data.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let hash = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SettingsProvider {
    store: Arc<dyn KvStore>,
}

fn field_or(hash: &HashMap<String, String>, field: &str, default: f64) -> f64 {
    hash.get(field)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

impl SettingsProvider {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Never fails: a missing or unparsable field takes its default, and an
    /// unreachable store yields the full defaults.
    pub async fn fetch(&self) -> RiskSettings {
        let defaults = RiskSettings::default();
        let hash = match self.store.hgetall(SETTINGS_KEY).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "settings.fetch.store_unreachable");
                return defaults;
            }
        };

        let settings = RiskSettings {
            leverage_multiplier: field_or(&hash, FIELD_LEVERAGE, defaults.leverage_multiplier),
            take_profit_percentage: field_or(&hash, FIELD_TAKE_PROFIT, defaults.take_profit_percentage),
            stop_loss_percentage: field_or(&hash, FIELD_STOP_LOSS, defaults.stop_loss_percentage),
        };
        info!(?settings, "settings.fetch");
        settings
    }

    /// Writes the given fields as-is (no range checks) and returns the re-read settings.
    pub async fn update(&self, update: RiskSettingsUpdate) -> TradeResult<RiskSettings> {
        let fields: Vec<(String, String)> = [
            (FIELD_LEVERAGE, update.leverage_multiplier),
            (FIELD_TAKE_PROFIT, update.take_profit_percentage),
            (FIELD_STOP_LOSS, update.stop_loss_percentage),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v.to_string())))
        .collect();

        if !fields.is_empty() {
            self.store.hset(SETTINGS_KEY, &fields).await.map_err(|e| {
                warn!(error = %e, "settings.update.failed");
                TradeError::SettingsStore(e.to_string())
            })?;
        }
        Ok(self.fetch().await)
    }
}
