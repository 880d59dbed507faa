use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;

use super::{tail_outcomes, BotRecord, Persistence};
use crate::risk::RiskState;
use crate::strategy::LikelihoodRecord;
use crate::types::{BotId, Trade};

const BOT_FILE: &str = "bot.json";
const RISK_FILE: &str = "risk_state.json";
const LIKELIHOOD_FILE: &str = "likelihoods.json";
const TRADES_FILE: &str = "trades.csv";

/// JSON state files plus a CSV trade log per bot
pub struct FilePersistence {
    data_dir: PathBuf,
    /// Serializes read-modify-write cycles and log appends
    write_lock: AsyncMutex<()>,
}

impl FilePersistence {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(data_dir.join("bots")).context("Failed to create data directory")?;
        tracing::info!(data_dir = %data_dir.display(), "File persistence ready");
        Ok(Self {
            data_dir,
            write_lock: AsyncMutex::new(()),
        })
    }

    fn bot_dir(&self, bot_id: BotId) -> PathBuf {
        self.data_dir.join("bots").join(bot_id.to_string())
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        let file_has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

        Ok(WriterBuilder::new().has_headers(!file_has_data).from_writer(file))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("Failed to read {}", path.display())),
        };
        let value = serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write through a temp file so a crash never leaves half a state file
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let body = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn read_trades(path: &Path) -> Result<Vec<Trade>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path).context("Failed to open trade log")?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut trades = Vec::new();
        for result in reader.deserialize() {
            let trade: Trade = result.context("Failed to deserialize trade record")?;
            trades.push(trade);
        }
        Ok(trades)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn upsert_likelihood(&self, record: &LikelihoodRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.bot_dir(record.bot_id).join(LIKELIHOOD_FILE);
        let mut records: Vec<LikelihoodRecord> = Self::read_json(&path).await?.unwrap_or_default();

        match records.iter_mut().find(|r| r.key() == record.key()) {
            Some(existing) => *existing = record.clone(),
            None => {
                records.push(record.clone());
                records.sort_by_key(|r| r.key());
            }
        }
        Self::write_json(&path, &records).await
    }

    async fn load_likelihoods(&self, bot_id: BotId) -> Result<Vec<LikelihoodRecord>> {
        let path = self.bot_dir(bot_id).join(LIKELIHOOD_FILE);
        Ok(Self::read_json(&path).await?.unwrap_or_default())
    }

    async fn append_trade(&self, trade: &Trade) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.bot_dir(trade.bot_id);
        fs::create_dir_all(&dir).context("Failed to create bot directory")?;

        let mut writer = Self::create_writer(&dir.join(TRADES_FILE))?;
        writer.serialize(trade).context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade writer")?;
        Ok(())
    }

    async fn recent_outcomes(&self, bot_id: BotId, limit: usize) -> Result<Vec<bool>> {
        let trades = Self::read_trades(&self.bot_dir(bot_id).join(TRADES_FILE))?;
        Ok(tail_outcomes(trades.iter(), limit))
    }

    async fn load_risk_state(&self, bot_id: BotId) -> Result<Option<RiskState>> {
        Self::read_json(&self.bot_dir(bot_id).join(RISK_FILE)).await
    }

    async fn save_risk_state(&self, state: &RiskState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.bot_dir(state.bot_id).join(RISK_FILE), state).await
    }

    async fn load_bot_record(&self, bot_id: BotId) -> Result<Option<BotRecord>> {
        Self::read_json(&self.bot_dir(bot_id).join(BOT_FILE)).await
    }

    async fn save_bot_record(&self, record: &BotRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::write_json(&self.bot_dir(record.bot_id).join(BOT_FILE), record).await
    }

    async fn list_bot_records(&self) -> Result<Vec<BotRecord>> {
        let bots_dir = self.data_dir.join("bots");
        let mut ids: Vec<BotId> = Vec::new();
        for entry in fs::read_dir(&bots_dir).context("Failed to list bot directories")? {
            let entry = entry?;
            match entry.file_name().to_str().and_then(|n| n.parse::<BotId>().ok()) {
                Some(id) => ids.push(id),
                None => tracing::warn!(path = %entry.path().display(), "Skipping unexpected entry in bots directory"),
            }
        }
        ids.sort_unstable();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load_bot_record(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BotConfig, ConfigProfile};
    use crate::persistence::test_support::trade;
    use crate::strategy::EvidenceCategory;
    use crate::types::{BotStatus, TradingMode};
    use chrono::{TimeZone, Utc};

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "polyswarm_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn test_trade_log_writes_header_once() {
        let data_dir = temp_data_dir("trade_log");
        let store = FilePersistence::new(&data_dir).unwrap();

        store.append_trade(&trade(3, 0, 1.2)).await.unwrap();
        store.append_trade(&trade(3, 1, -3.0)).await.unwrap();
        store.append_trade(&trade(3, 2, 0.4)).await.unwrap();

        let content = fs::read_to_string(data_dir.join("bots/3/trades.csv")).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap_or_default();
        assert!(header.starts_with("id,bot_id,condition_id"), "unexpected header line: {}", header);
        assert_eq!(lines.count(), 3);

        assert_eq!(store.recent_outcomes(3, 2).await.unwrap(), vec![false, true]);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_trade_log_round_trips_through_csv() {
        let data_dir = temp_data_dir("trade_round_trip");
        let store = FilePersistence::new(&data_dir).unwrap();
        let original = trade(4, 0, -0.75);
        store.append_trade(&original).await.unwrap();

        let loaded = FilePersistence::read_trades(&data_dir.join("bots/4/trades.csv")).unwrap();
        assert_eq!(loaded, vec![original]);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_likelihood_upsert_replaces_same_key() {
        let data_dir = temp_data_dir("likelihoods");
        let store = FilePersistence::new(&data_dir).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();

        let mut record = LikelihoodRecord::new(5, EvidenceCategory::BullishStrong, EvidenceCategory::Neutral, now);
        store.upsert_likelihood(&record).await.unwrap();
        record.wins = 2;
        record.losses = 1;
        record.total = 3;
        record.win_rate = 2.0 / 3.0;
        store.upsert_likelihood(&record).await.unwrap();
        let other = LikelihoodRecord::new(5, EvidenceCategory::BearishWeak, EvidenceCategory::Neutral, now);
        store.upsert_likelihood(&other).await.unwrap();

        let loaded = store.load_likelihoods(5).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&record));

        // Reopening sees the same state
        let reopened = FilePersistence::new(&data_dir).unwrap();
        assert_eq!(reopened.load_likelihoods(5).await.unwrap(), loaded);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_bot_records_and_risk_state_persist() {
        let data_dir = temp_data_dir("bot_records");
        let store = FilePersistence::new(&data_dir).unwrap();

        let mut profile = BotConfig::default();
        profile.mode = TradingMode::Live;
        let mut record = BotRecord::new(11, "eleven", ConfigProfile::new(profile));
        record.status = BotStatus::Error;
        record.last_error = Some("halting after 5 consecutive execution errors".to_string());
        store.save_bot_record(&record).await.unwrap();
        store
            .save_bot_record(&BotRecord::new(2, "two", ConfigProfile::default()))
            .await
            .unwrap();

        let listed = store.list_bot_records().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].bot_id, 2);
        assert_eq!(listed[1], record);
        assert!(!listed[1].should_resume());

        let now = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
        assert!(store.load_risk_state(11).await.unwrap().is_none());
        let mut state = RiskState::new(11, now);
        state.daily_pnl = -4.5;
        store.save_risk_state(&state).await.unwrap();
        assert_eq!(store.load_risk_state(11).await.unwrap(), Some(state));

        let _ = fs::remove_dir_all(&data_dir);
    }
}
