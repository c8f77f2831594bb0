use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::{AppState, PoolInfo},
    config::{PoolConfig, StorageBackend},
    error::AppResult,
    ledger::{InMemoryLedgerStore, LedgerRepository, LedgerStore},
    reconciliation::ReconciliationEngine,
    settlement::{EvmSettlementClient, PayoutEngine, SettlementClient},
    sources::{DataSourceConnector, HttpConnector},
};

/// Long-lived components shared by the poller, payout loop and API
pub struct Components {
    pub ledger: Arc<dyn LedgerStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub connector: Arc<dyn DataSourceConnector>,
    pub payout: Option<Arc<PayoutEngine>>,
    pub state: AppState,
}

pub async fn initialize_components(config: &PoolConfig) -> AppResult<Components> {
    info!("Initializing pool components ...");

    let ledger = initialize_ledger(&config.storage).await?;

    let mut engine = ReconciliationEngine::new(ledger.clone(), &config.region, config.commission);
    for source in &config.data_sources {
        engine.register_source(&source.source_id, &source.node_type);
        info!(
            "📡 Data source {} ({}) -> {}",
            source.endpoint,
            source.node_type,
            &source.source_id[..12]
        );
    }
    if config.data_sources.is_empty() {
        warn!("⚠️  No data sources configured - nothing will be reconciled");
    }
    info!(
        "✓ Reconciliation engine ready: region {}, commission {}%",
        config.region,
        engine.commission().percent()
    );

    let connector: Arc<dyn DataSourceConnector> = Arc::new(HttpConnector::new(
        config.data_sources.clone(),
        config.request_timeout,
    )?);

    let payout = match &config.payout {
        Some(payout) => {
            let client: Arc<dyn SettlementClient> =
                Arc::new(EvmSettlementClient::from_keystore(&payout.settlement)?);
            info!("✅ Payouts enabled, threshold {} wei", payout.threshold);
            Some(Arc::new(PayoutEngine::new(
                ledger.clone(),
                client,
                payout.threshold,
            )))
        }
        None => {
            warn!("⚠️  Payouts disabled");
            None
        }
    };

    let state = AppState {
        ledger: ledger.clone(),
        pool: Arc::new(PoolInfo {
            commission: config.commission.percent(),
            version: config.version.clone(),
            region: config.region.clone(),
            node_types: config.node_types(),
        }),
    };

    Ok(Components {
        ledger,
        engine: Arc::new(engine),
        connector,
        payout,
        state,
    })
}

/// Ledger backend selected by configuration
pub async fn initialize_ledger(backend: &StorageBackend) -> AppResult<Arc<dyn LedgerStore>> {
    match backend {
        StorageBackend::Postgres {
            database_url,
            max_connections,
        } => {
            let pool = initialize_database(database_url, *max_connections).await?;
            Ok(Arc::new(LedgerRepository::new(pool)))
        }
        StorageBackend::Memory => {
            warn!("⚠️  In-memory ledger: state is lost on restart");
            Ok(Arc::new(InMemoryLedgerStore::new()))
        }
    }
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
