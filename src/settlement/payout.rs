use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::SettlementClient;
use crate::error::{AppResult, SettlementError};
use crate::ledger::models::{PayoutRecord, WorkerKey, WorkerLedgerEntry};
use crate::ledger::store::LedgerStore;

/// What happened to one eligible worker in a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid(PayoutRecord),
    /// Nothing left the pool; the worker is reconsidered next cycle.
    Failed { key: WorkerKey, amount: i64, reason: String },
    /// Value may have left the pool but the ledger does not show it.
    Quarantined {
        key: WorkerKey,
        amount: i64,
        tx_hash: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub scanned: usize,
    pub eligible: usize,
    /// Eligible by balance but held back by quarantine
    pub held: usize,
    pub outcomes: Vec<PayoutOutcome>,
}

impl CycleReport {
    pub fn paid_total(&self) -> i64 {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                PayoutOutcome::Paid(record) => Some(record.amount),
                _ => None,
            })
            .sum()
    }

    pub fn paid_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, PayoutOutcome::Paid(_)))
            .count()
    }
}

/// Payout engine - disburses pending fees once they reach the threshold
///
/// SECURITY CRITICAL:
/// - Sends exactly the pending balance seen in the snapshot, then decrements by
///   exactly that amount, so credits landing mid-send stay pending
/// - A worker whose transfer may have gone out without a matching ledger update
///   is quarantined and never paid automatically again in this process
pub struct PayoutEngine {
    store: Arc<dyn LedgerStore>,
    client: Arc<dyn SettlementClient>,
    threshold: i64,
    quarantined: Mutex<HashSet<WorkerKey>>,
}

impl PayoutEngine {
    pub fn new(store: Arc<dyn LedgerStore>, client: Arc<dyn SettlementClient>, threshold: i64) -> Self {
        Self {
            store,
            client,
            threshold,
            quarantined: Mutex::new(HashSet::new()),
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn quarantined(&self) -> Vec<WorkerKey> {
        self.quarantined.lock().iter().cloned().collect()
    }

    fn is_eligible(&self, entry: &WorkerLedgerEntry) -> bool {
        entry.pending_fees > 0 && entry.pending_fees >= self.threshold
    }

    /// One payout pass over the ledger. Workers are paid one at a time so the
    /// sender account's nonces stay in order.
    #[instrument(skip(self), fields(threshold = self.threshold))]
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let workers = self.store.list_all().await?;
        let mut report = CycleReport {
            scanned: workers.len(),
            ..Default::default()
        };

        for entry in workers.iter().filter(|e| self.is_eligible(e)) {
            report.eligible += 1;
            let key = entry.key();

            if self.quarantined.lock().contains(&key) {
                debug!("Worker {} is quarantined, skipping", key);
                report.held += 1;
                continue;
            }

            let outcome = self.pay(key, entry.pending_fees).await;
            report.outcomes.push(outcome);
        }

        if report.eligible > 0 {
            info!(
                "Payout cycle: {} eligible, {} paid ({} wei), {} held",
                report.eligible,
                report.paid_count(),
                report.paid_total(),
                report.held
            );
        }

        Ok(report)
    }

    async fn pay(&self, key: WorkerKey, amount: i64) -> PayoutOutcome {
        let tx_hash = match self.client.send(amount, &key.eth_address).await {
            Ok(tx_hash) => tx_hash,
            Err(e) if e.outcome_unknown() => {
                let tx_hash = match &e {
                    SettlementError::SubmissionUnknown { tx_hash } => Some(tx_hash.clone()),
                    _ => None,
                };
                return self.quarantine(key, amount, tx_hash, e.to_string());
            }
            Err(e) => {
                warn!("Payout of {} wei to {} failed: {}", amount, key, e);
                return PayoutOutcome::Failed {
                    key,
                    amount,
                    reason: e.to_string(),
                };
            }
        };

        match self
            .store
            .transfer_pending_to_paid(&key, amount, &tx_hash)
            .await
        {
            Ok(record) => {
                info!("✓ Paid {} wei to {} in {}", amount, key, tx_hash);
                PayoutOutcome::Paid(record)
            }
            Err(e) => self.quarantine(key, amount, Some(tx_hash), e.to_string()),
        }
    }

    fn quarantine(
        &self,
        key: WorkerKey,
        amount: i64,
        tx_hash: Option<String>,
        reason: String,
    ) -> PayoutOutcome {
        error!(
            "❌ Payout of {} wei to {} (tx {:?}) is not reflected in the ledger: {}. Worker quarantined, reconcile manually",
            amount, key, tx_hash, reason
        );
        self.quarantined.lock().insert(key.clone());
        PayoutOutcome::Quarantined {
            key,
            amount,
            tx_hash,
            reason,
        }
    }
}
