// Lumen-PG - role-authenticated PostgreSQL data access
// Core library

pub mod auth;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod metadata;
pub mod metrics;
pub mod observability;
pub mod pager;
pub mod service;
pub mod session;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use lumen_core::{CancellationToken, Clock, SystemClock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use auth::AuthService;
use config::Config;
use crypto::Crypto;
use engine::{ConnectionBroker, Connector, PgConnector};
use metadata::{CatalogSource, MetadataCache, PgCatalogSource};
use pager::Pager;
use service::DataService;
use session::SessionStore;
use transaction::TransactionEngine;

pub use lumen_core::{LumenError, LumenResult};

/// The three stores plus the services built over them.
pub struct AppState {
    pub clock: Arc<dyn Clock>,
    pub broker: Arc<ConnectionBroker>,
    pub cache: Arc<MetadataCache>,
    pub sessions: Arc<SessionStore>,
    pub transactions: Arc<TransactionEngine>,
    pub auth: AuthService,
    pub data: DataService,
}

impl AppState {
    /// Production wiring: sqlx connections, wall clock.
    pub fn new(config: &Config) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(PgConnector::new(config.connect_timeout));
        let catalog: Arc<dyn CatalogSource> = Arc::new(PgCatalogSource::new(
            Arc::clone(&connector),
            config.superadmin.clone(),
        ));
        Self::with_parts(config, connector, catalog, Arc::new(SystemClock))
    }

    /// Wires the stores around any driver, catalog and clock.
    pub fn with_parts(
        config: &Config,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn CatalogSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let crypto = Arc::new(Crypto::new(*config.encryption_key.expose()));
        let broker = Arc::new(
            ConnectionBroker::new(connector, config.superadmin.clone())
                .with_probe_timeout(config.probe_timeout),
        );
        let cache = Arc::new(MetadataCache::new(catalog));
        let sessions = Arc::new(
            SessionStore::new(crypto, Arc::clone(&clock)).with_ttl(config.session_ttl_secs),
        );
        let transactions = Arc::new(
            TransactionEngine::new(Arc::clone(&cache), Arc::clone(&broker), Arc::clone(&clock))
                .with_ttl(config.transaction_ttl_secs),
        );
        let pager = Pager::new(config.page_size, config.hard_cap);

        let auth = AuthService::new(
            Arc::clone(&broker),
            Arc::clone(&cache),
            Arc::clone(&sessions),
        );
        let data = DataService::new(Arc::clone(&broker), Arc::clone(&cache), pager);

        Self {
            clock,
            broker,
            cache,
            sessions,
            transactions,
            auth,
            data,
        }
    }

    /// Marks stale transactions expired and drops expired sessions every
    /// `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let transactions = Arc::clone(&self.transactions);
        let sessions = Arc::clone(&self.sessions);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = transactions.sweep();
                        let purged = sessions.purge_expired();
                        if expired > 0 || purged > 0 {
                            debug!(expired, purged, "sweep");
                        }
                    }
                }
            }
        })
    }
}
