use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{tail_outcomes, BotRecord, Persistence};
use crate::risk::RiskState;
use crate::strategy::{EvidenceCategory, LikelihoodRecord};
use crate::types::{BotId, Trade};

/// In-process store; nothing survives a restart
#[derive(Default)]
pub struct MemoryPersistence {
    likelihoods: RwLock<HashMap<(BotId, EvidenceCategory, EvidenceCategory), LikelihoodRecord>>,
    trades: RwLock<HashMap<BotId, Vec<Trade>>>,
    risk: RwLock<HashMap<BotId, RiskState>>,
    bots: RwLock<BTreeMap<BotId, BotRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived trades of one bot, oldest first
    pub async fn trades(&self, bot_id: BotId) -> Vec<Trade> {
        self.trades.read().await.get(&bot_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn upsert_likelihood(&self, record: &LikelihoodRecord) -> Result<()> {
        self.likelihoods.write().await.insert(
            (record.bot_id, record.l1_evidence, record.l2_evidence),
            record.clone(),
        );
        Ok(())
    }

    async fn load_likelihoods(&self, bot_id: BotId) -> Result<Vec<LikelihoodRecord>> {
        let mut records: Vec<LikelihoodRecord> = self
            .likelihoods
            .read()
            .await
            .values()
            .filter(|r| r.bot_id == bot_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.key());
        Ok(records)
    }

    async fn append_trade(&self, trade: &Trade) -> Result<()> {
        self.trades
            .write()
            .await
            .entry(trade.bot_id)
            .or_default()
            .push(trade.clone());
        Ok(())
    }

    async fn recent_outcomes(&self, bot_id: BotId, limit: usize) -> Result<Vec<bool>> {
        let trades = self.trades.read().await;
        Ok(trades
            .get(&bot_id)
            .map(|t| tail_outcomes(t.iter(), limit))
            .unwrap_or_default())
    }

    async fn load_risk_state(&self, bot_id: BotId) -> Result<Option<RiskState>> {
        Ok(self.risk.read().await.get(&bot_id).cloned())
    }

    async fn save_risk_state(&self, state: &RiskState) -> Result<()> {
        self.risk.write().await.insert(state.bot_id, state.clone());
        Ok(())
    }

    async fn load_bot_record(&self, bot_id: BotId) -> Result<Option<BotRecord>> {
        Ok(self.bots.read().await.get(&bot_id).cloned())
    }

    async fn save_bot_record(&self, record: &BotRecord) -> Result<()> {
        self.bots.write().await.insert(record.bot_id, record.clone());
        Ok(())
    }

    async fn list_bot_records(&self) -> Result<Vec<BotRecord>> {
        Ok(self.bots.read().await.values().cloned().collect())
    }
}
