use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connector::DataSourceConnector;
use super::DataSource;
use crate::error::AppResult;
use crate::ledger::store::LedgerStore;
use crate::reconciliation::{BatchSummary, ReconciliationEngine};

/// Source poller - pulls new events from every data source on a fixed cadence
///
/// One task per source per tick. A source whose previous run has not finished
/// is skipped for the tick, so poll windows of one source never overlap.
pub struct SourcePoller {
    connector: Arc<dyn DataSourceConnector>,
    engine: Arc<ReconciliationEngine>,
    store: Arc<dyn LedgerStore>,
    fetch_interval: Duration,
    in_flight: HashMap<String, Arc<Mutex<()>>>,
}

impl SourcePoller {
    pub fn new(
        connector: Arc<dyn DataSourceConnector>,
        engine: Arc<ReconciliationEngine>,
        store: Arc<dyn LedgerStore>,
        fetch_interval: Duration,
    ) -> Self {
        let in_flight = connector
            .sources()
            .iter()
            .map(|source| (source.source_id.clone(), Arc::new(Mutex::new(()))))
            .collect();

        Self {
            connector,
            engine,
            store,
            fetch_interval,
            in_flight,
        }
    }

    /// Start polling in the background until `shutdown` flips to true.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Source poller started ({} sources, every {:?})",
                self.connector.sources().len(),
                self.fetch_interval
            );

            let mut ticker = interval(self.fetch_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut tasks = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                // Reap finished runs from earlier ticks.
                while tasks.try_join_next().is_some() {}

                for source in self.connector.sources() {
                    self.spawn_poll(&mut tasks, source);
                }
            }

            info!("Source poller stopping, waiting for {} in-flight polls", tasks.len());
            while tasks.join_next().await.is_some() {}
            info!("Source poller stopped");
        })
    }

    fn spawn_poll(&self, tasks: &mut JoinSet<()>, source: &DataSource) {
        let Some(lock) = self.in_flight.get(&source.source_id) else {
            return;
        };
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Previous poll of {} still running, skipping tick", source.endpoint);
                return;
            }
        };

        let connector = self.connector.clone();
        let engine = self.engine.clone();
        let store = self.store.clone();
        let source = source.clone();

        tasks.spawn(async move {
            let _guard = guard;
            match poll_source(connector.as_ref(), &engine, store.as_ref(), &source).await {
                Ok(summary) if summary.received > 0 => debug!(
                    "Polled {}: {} received, {} duplicates",
                    source.endpoint, summary.received, summary.duplicates
                ),
                Ok(_) => {}
                Err(e) => warn!("Poll of {} failed, retrying next tick: {}", source.endpoint, e),
            }
        });
    }
}

/// One poll of one source: high-water mark, fetch, reconcile.
pub async fn poll_source(
    connector: &dyn DataSourceConnector,
    engine: &ReconciliationEngine,
    store: &dyn LedgerStore,
    source: &DataSource,
) -> AppResult<BatchSummary> {
    let since = store
        .high_water_mark(&source.source_id)
        .await?
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let events = connector.fetch(source, since).await?;
    if events.is_empty() {
        return Ok(BatchSummary::default());
    }

    engine.apply(&events, &source.source_id).await.map_err(|e| {
        error!("Reconciliation of {} failed: {}", source.endpoint, e);
        e
    })
}
