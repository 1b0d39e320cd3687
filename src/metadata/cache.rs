//! Metadata Cache
//!
//! Readers clone an `Arc<Snapshot>` under a short shared lock and answer
//! from memory. Refreshes build the next snapshot without holding that lock
//! and swap it in at the end; a separate async mutex keeps two refreshes from
//! interleaving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lumen_core::{CancellationToken, LumenResult, TableRef};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::catalog::CatalogSource;
use super::erd::ErdData;
use super::model::{ClusterMetadata, ForeignKeyEdge, Permissions, RoleView, TableMeta};

#[derive(Debug, Default)]
struct Snapshot {
    cluster: Arc<ClusterMetadata>,
    views: HashMap<String, Arc<RoleView>>,
    loaded: bool,
}

/// How long a name that is not a login role skips the catalog on refresh.
const UNKNOWN_ROLE_COOLDOWN: Duration = Duration::from_secs(30);
const MAX_UNKNOWN_ROLES: usize = 1024;

pub struct MetadataCache {
    source: Arc<dyn CatalogSource>,
    snapshot: RwLock<Arc<Snapshot>>,
    refresh: Mutex<()>,
    unknown_roles: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl MetadataCache {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh: Mutex::new(()),
            unknown_roles: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    fn recently_unknown(&self, role: &str) -> bool {
        self.unknown_roles
            .lock()
            .get(role)
            .is_some_and(|seen| seen.elapsed() < UNKNOWN_ROLE_COOLDOWN)
    }

    fn remember_unknown(&self, role: &str) {
        let mut unknown = self.unknown_roles.lock();
        if unknown.len() >= MAX_UNKNOWN_ROLES {
            unknown.retain(|_, seen| seen.elapsed() < UNKNOWN_ROLE_COOLDOWN);
            if unknown.len() >= MAX_UNKNOWN_ROLES {
                unknown.clear();
            }
        }
        unknown.insert(role.to_string(), Instant::now());
    }

    /// Loads the whole cluster and every role's view, replacing any prior
    /// snapshot.
    #[instrument(skip(self, cancel))]
    pub async fn load_all(&self, cancel: &CancellationToken) -> LumenResult<()> {
        let _guard = self.refresh.lock().await;
        let loaded = self.source.load(cancel).await?;

        let views: HashMap<String, Arc<RoleView>> = loaded
            .grants
            .iter()
            .map(|g| (g.role.clone(), Arc::new(RoleView::build(&loaded.cluster, g))))
            .collect();
        info!(
            databases = loaded.cluster.databases.len(),
            roles = views.len(),
            "metadata snapshot replaced"
        );

        let next = Snapshot {
            cluster: Arc::new(loaded.cluster),
            views,
            loaded: true,
        };
        *self.snapshot.write() = Arc::new(next);
        self.unknown_roles.lock().clear();
        Ok(())
    }

    pub async fn refresh_all(&self, cancel: &CancellationToken) -> LumenResult<()> {
        self.load_all(cancel).await
    }

    /// Re-reads one role's grants against the current layout. Returns false
    /// when `role` is not a login role; such names are not cached and skip
    /// the catalog for a cooldown.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_role(&self, role: &str, cancel: &CancellationToken) -> LumenResult<bool> {
        if self.recently_unknown(role) {
            debug!("role recently not found, skipping catalog");
            return Ok(false);
        }
        let _guard = self.refresh.lock().await;
        let base = self.current();
        let grants = self.source.load_grants(&base.cluster, role, cancel).await?;

        let mut views = base.views.clone();
        let known = match grants {
            Some(grants) => {
                views.insert(role.to_string(), Arc::new(RoleView::build(&base.cluster, &grants)));
                true
            }
            None => {
                self.remember_unknown(role);
                if views.remove(role).is_none() {
                    return Ok(false);
                }
                false
            }
        };
        let next = Snapshot {
            cluster: base.cluster.clone(),
            views,
            loaded: base.loaded,
        };
        *self.snapshot.write() = Arc::new(next);
        Ok(known)
    }

    pub fn is_loaded(&self) -> bool {
        self.current().loaded
    }

    pub fn get_cluster(&self) -> Arc<ClusterMetadata> {
        self.current().cluster.clone()
    }

    /// Unknown roles get an empty view.
    pub fn get_role_view(&self, role: &str) -> Arc<RoleView> {
        self.current()
            .views
            .get(role)
            .cloned()
            .unwrap_or_else(|| Arc::new(RoleView::empty(role)))
    }

    pub fn can_access_table(&self, role: &str, table: &TableRef) -> bool {
        !self.get_role_view(role).permissions(table).is_empty()
    }

    pub fn has_permission(&self, role: &str, table: &TableRef, perm: Permissions) -> bool {
        self.get_role_view(role).permissions(table).contains(perm)
    }

    pub fn can_connect(&self, role: &str, database: &str) -> bool {
        self.get_role_view(role).can_connect(database)
    }

    /// True when the role holds INSERT, UPDATE or DELETE on some table of
    /// `database`.
    pub fn can_write_in_database(&self, role: &str, database: &str) -> bool {
        self.get_role_view(role)
            .permissions
            .iter()
            .any(|(table, perms)| table.database == database && perms.intersects(Permissions::writes()))
    }

    /// Reachable tables of a schema with their permissions, in cluster order.
    pub fn accessible_tables(
        &self,
        role: &str,
        database: &str,
        schema: &str,
    ) -> Vec<(String, Permissions)> {
        let view = self.get_role_view(role);
        view.tables_of(database, schema)
            .iter()
            .map(|name| {
                let perms = view.permissions(&TableRef::new(database, schema, name));
                (name.clone(), perms)
            })
            .collect()
    }

    pub fn accessible_databases(&self, role: &str) -> Vec<String> {
        self.get_role_view(role).databases.clone()
    }

    pub fn table(&self, table: &TableRef) -> Option<TableMeta> {
        self.current().cluster.table(table).cloned()
    }

    pub fn foreign_keys_from(&self, table: &TableRef) -> Vec<ForeignKeyEdge> {
        self.current()
            .cluster
            .foreign_keys_from(table)
            .cloned()
            .collect()
    }

    pub fn foreign_keys_to(&self, table: &TableRef, column: &str) -> Vec<ForeignKeyEdge> {
        self.current()
            .cluster
            .foreign_keys_to(table, column)
            .cloned()
            .collect()
    }

    pub fn erd(&self, role: &str, database: &str, schema: &str) -> ErdData {
        let snapshot = self.current();
        let view = self.get_role_view(role);
        ErdData::build(&snapshot.cluster, &view, database, schema)
    }
}
