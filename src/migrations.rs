//! Versioned schema migrations. Each database carries a `migration_info`
//! collection whose highest recorded version decides which steps still apply.
//! Steps are idempotent: re-running a partially applied migration converges.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::{IndexOptions, ReplaceOneModel, WriteModel};
use mongodb::{Client, Collection, Database, IndexModel, Namespace};
use semver::Version;

use crate::error::Error;
use crate::models::device::{
    ATTR_NAME_CREATED, ATTR_NAME_GROUP, ATTR_NAME_UPDATED, Device, SCOPE_INVENTORY, SCOPE_SYSTEM,
    attr_key,
};
use crate::query_builder::{
    FIELD_CREATED, FIELD_ID, FIELD_REVISION, FIELD_TENANT, FIELD_TEXT, FIELD_UPDATED,
    attr_value_field,
};
use crate::store::{self, COLLECTION_DEVICES};
use crate::tenant;

pub const COLLECTION_MIGRATION_INFO: &str = "migration_info";

/// Documents move between databases in slices of this size.
const CONSOLIDATION_BATCH: usize = 100;

/// The version that consolidated per-tenant databases into one; also the
/// newest schema version overall.
pub fn consolidation_version() -> Version {
    Version::new(2, 0, 0)
}

/// Highest version recorded in a database's `migration_info`, or `None` on a
/// fresh database.
pub async fn db_version(db: &Database) -> Result<Option<Version>, Error> {
    let coll: Collection<Document> = db.collection(COLLECTION_MIGRATION_INFO);
    let mut cursor = coll.find(doc! {}).await?;
    let mut newest: Option<Version> = None;
    while let Some(info) = cursor.try_next().await? {
        if let Ok(raw) = info.get_str("version")
            && let Ok(version) = Version::parse(raw)
        {
            newest = newest.max(Some(version));
        }
    }
    Ok(newest)
}

async fn record_version(db: &Database, version: &Version) -> Result<(), Error> {
    let coll: Collection<Document> = db.collection(COLLECTION_MIGRATION_INFO);
    coll.insert_one(doc! {
        "version": version.to_string(),
        "timestamp": mongodb::bson::DateTime::now(),
    })
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    pub tenant_id: Option<String>,
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> Version;

    async fn up(&self, db: &Database, ctx: &MigrationContext) -> Result<(), Error>;

    fn supports_maintenance(&self) -> bool {
        false
    }

    /// Online variant: convert data by copy so the service keeps serving
    /// while operators drain writes. Only some migrations have one.
    async fn maintenance(&self, _db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        Err(Error::validation(format!(
            "migration {} has no maintenance mode",
            self.version()
        )))
    }
}

/// The per-database ladder, ascending. The 2.0.0 consolidation is
/// cluster-level and handled by [`Migrator::migrate_all`] directly.
fn tenant_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(MigrateAttributeScopes),
        Box::new(MigrateSystemAttributes),
        Box::new(MigrateCompoundIndexes),
        Box::new(MigrateRevisionDefault),
        Box::new(MigrateTextField),
    ]
}

/// Migrations with a version newer than `current`, in apply order.
fn pending(migrations: &[Box<dyn Migration>], current: &Version) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..migrations.len())
        .filter(|&i| migrations[i].version() > *current)
        .collect();
    idx.sort_by_key(|&i| migrations[i].version());
    idx
}

pub struct Migrator {
    client: Client,
    base_db: String,
    automigrate: bool,
}

impl Migrator {
    pub fn new(client: Client, base_db: impl Into<String>, automigrate: bool) -> Self {
        Migrator {
            client,
            base_db: base_db.into(),
            automigrate,
        }
    }

    /// Names of all databases holding inventory data: the base database plus
    /// every `<base>-<tenant>` match.
    async fn inventory_db_names(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self
            .client
            .list_database_names()
            .await?
            .into_iter()
            .filter(|n| tenant::tenant_from_db_name(&self.base_db, n).is_some())
            .collect();
        names.sort();
        names.insert(0, self.base_db.clone());
        Ok(names)
    }

    /// Run the full ladder over every tenant database, then the cluster-level
    /// consolidation. Startup path.
    pub async fn migrate_all(&self) -> Result<(), Error> {
        for name in self.inventory_db_names().await? {
            let ctx = MigrationContext {
                tenant_id: tenant::tenant_from_db_name(&self.base_db, &name).map(str::to_owned),
            };
            self.run_ladder(&self.client.database(&name), &ctx).await?;
        }
        self.consolidate().await?;
        Ok(())
    }

    /// Bring a single tenant up to date. After consolidation there is
    /// nothing per-tenant left to do: the shared database carries the data.
    pub async fn migrate_tenant(&self, tenant_id: &str) -> Result<(), Error> {
        let base = self.client.database(&self.base_db);
        if db_version(&base).await?.is_some_and(|v| v >= consolidation_version()) {
            return Ok(());
        }
        let name = tenant::tenant_db_name(&self.base_db, tenant_id);
        let ctx = MigrationContext {
            tenant_id: Some(tenant_id.to_string()),
        };
        self.run_ladder(&self.client.database(&name), &ctx).await
    }

    async fn run_ladder(&self, db: &Database, ctx: &MigrationContext) -> Result<(), Error> {
        let migrations = tenant_migrations();
        let current = db_version(db).await?.unwrap_or_else(|| Version::new(0, 0, 0));
        let todo = pending(&migrations, &current);
        if todo.is_empty() {
            return Ok(());
        }
        if !self.automigrate {
            return Err(Error::Internal(anyhow::anyhow!(
                "database {} is at version {current}, {} migration(s) pending; \
                 rerun with automigrate or use the migration tool",
                db.name(),
                todo.len(),
            )));
        }
        for i in todo {
            let migration = &migrations[i];
            tracing::info!("applying migration {} to {}", migration.version(), db.name());
            migration.up(db, ctx).await?;
            record_version(db, &migration.version()).await?;
        }
        Ok(())
    }

    /// Run the maintenance variant of the migration at `version` for the
    /// selected tenants (all of them when none are given).
    pub async fn maintenance(&self, tenant_ids: &[String], version: &Version) -> Result<(), Error> {
        let migrations = tenant_migrations();
        let Some(migration) = migrations.iter().find(|m| m.version() == *version) else {
            return Err(Error::validation(format!("unknown migration version {version}")));
        };
        if !migration.supports_maintenance() {
            return Err(Error::validation(format!(
                "migration {version} has no maintenance mode"
            )));
        }

        let names: Vec<String> = if tenant_ids.is_empty() {
            self.inventory_db_names().await?
        } else {
            tenant_ids
                .iter()
                .map(|t| tenant::tenant_db_name(&self.base_db, t))
                .collect()
        };

        for name in names {
            let db = self.client.database(&name);
            let current = db_version(&db).await?.unwrap_or_else(|| Version::new(0, 0, 0));
            tracing::info!(
                "maintenance migration {version} on {name} (currently at {current})"
            );
            let ctx = MigrationContext {
                tenant_id: tenant::tenant_from_db_name(&self.base_db, &name).map(str::to_owned),
            };
            migration.maintenance(&db, &ctx).await?;
        }
        Ok(())
    }

    /// 2.0.0: move every `<base>-<tenant>` database into the base database,
    /// stamping `tenant_id` on each document. Runs only from the non-tenant
    /// context; batches are sorted by id so re-runs converge.
    async fn consolidate(&self) -> Result<(), Error> {
        let base = self.client.database(&self.base_db);
        let current = db_version(&base).await?.unwrap_or_else(|| Version::new(0, 0, 0));
        if current >= consolidation_version() {
            return Ok(());
        }
        if !self.automigrate {
            return Err(Error::Internal(anyhow::anyhow!(
                "database {} is at version {current}, consolidation pending; \
                 rerun with automigrate or use the migration tool",
                self.base_db,
            )));
        }

        for name in self.inventory_db_names().await? {
            let Some(tenant_id) = tenant::tenant_from_db_name(&self.base_db, &name) else {
                continue;
            };
            tracing::info!("consolidating {name} into {}", self.base_db);
            self.consolidate_tenant(&name, tenant_id).await?;
        }

        let ns = |keys: Document, name: &str| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().name(name.to_string()).build())
                .build()
        };
        let coll: Collection<Document> = base.collection(COLLECTION_DEVICES);
        coll.create_indexes(vec![
            ns(doc! { FIELD_TENANT: 1, FIELD_ID: 1 }, "tenant_id_id"),
            ns(doc! { FIELD_TENANT: 1, FIELD_UPDATED: 1 }, "tenant_id_updated_ts"),
        ])
        .await?;

        record_version(&base, &consolidation_version()).await
    }

    async fn consolidate_tenant(&self, db_name: &str, tenant_id: &str) -> Result<(), Error> {
        let source: Collection<Document> = self
            .client
            .database(db_name)
            .collection(COLLECTION_DEVICES);
        let target_ns = Namespace {
            db: self.base_db.clone(),
            coll: COLLECTION_DEVICES.to_string(),
        };

        let mut cursor = source.find(doc! {}).sort(doc! { FIELD_ID: 1 }).await?;
        let mut batch: Vec<WriteModel> = Vec::with_capacity(CONSOLIDATION_BATCH);
        while let Some(mut device) = cursor.try_next().await? {
            let id = device.get(FIELD_ID).cloned().unwrap_or(Bson::Null);
            device.insert(FIELD_TENANT, tenant_id);
            batch.push(WriteModel::ReplaceOne(
                ReplaceOneModel::builder()
                    .namespace(target_ns.clone())
                    .filter(doc! { FIELD_ID: id, FIELD_TENANT: tenant_id })
                    .replacement(device)
                    .upsert(true)
                    .build(),
            ));
            if batch.len() == CONSOLIDATION_BATCH {
                self.client.bulk_write(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            self.client.bulk_write(batch).await?;
        }
        Ok(())
    }
}

/// 0.2.0 — attributes gain a scope: `attributes.<name>` becomes
/// `attributes.inventory-<name>` with an embedded `scope` field, and each
/// discovered attribute gets a single-field index (best effort).
struct MigrateAttributeScopes;

#[async_trait]
impl Migration for MigrateAttributeScopes {
    fn version(&self) -> Version {
        Version::new(0, 2, 0)
    }

    async fn up(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        let coll: Collection<Document> = db.collection(COLLECTION_DEVICES);
        let mut discovered: Vec<String> = Vec::new();

        let mut cursor = coll.find(doc! {}).await?;
        while let Some(device) = cursor.try_next().await? {
            let Ok(attrs) = device.get_document("attributes") else {
                continue;
            };
            let mut scoped = Document::new();
            let mut changed = false;
            for (key, value) in attrs {
                match value.as_document() {
                    // already scoped (re-run or post-0.2.0 write)
                    Some(attr) if attr.contains_key("scope") => {
                        scoped.insert(key, value.clone());
                    }
                    Some(attr) => {
                        let mut attr = attr.clone();
                        attr.insert("scope", SCOPE_INVENTORY);
                        attr.insert("name", key.as_str());
                        scoped.insert(attr_key(SCOPE_INVENTORY, key), attr);
                        discovered.push(key.clone());
                        changed = true;
                    }
                    None => {
                        scoped.insert(key, value.clone());
                    }
                }
            }
            if changed {
                let id = device.get(FIELD_ID).cloned().unwrap_or(Bson::Null);
                coll.update_one(
                    doc! { FIELD_ID: id },
                    doc! { "$set": { "attributes": scoped } },
                )
                .await?;
            }
        }

        discovered.sort();
        discovered.dedup();
        for name in discovered {
            let index = IndexModel::builder()
                .keys(doc! { attr_value_field(SCOPE_INVENTORY, &name): 1 })
                .build();
            if let Err(e) = coll.create_index(index).await {
                if store::is_index_overflow(&e) {
                    tracing::warn!("index limit reached on {}, skipping {name}: {e}", db.name());
                    break;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// 1.0.0 — legacy root fields become system-scope attributes. The
/// maintenance variant copies without removing the root `group` field so the
/// service can stay online; the regular pass removes it.
struct MigrateSystemAttributes;

impl MigrateSystemAttributes {
    async fn move_root_fields(db: &Database, remove_root: bool) -> Result<(), Error> {
        let coll: Collection<Document> = db.collection(COLLECTION_DEVICES);
        let mut cursor = coll.find(doc! {}).await?;
        while let Some(device) = cursor.try_next().await? {
            let mut set = Document::new();
            let mut unset = Document::new();

            for (root, attr_name) in [
                (FIELD_CREATED, ATTR_NAME_CREATED),
                (FIELD_UPDATED, ATTR_NAME_UPDATED),
            ] {
                if let Some(Bson::DateTime(ts)) = device.get(root) {
                    let prefix = format!("attributes.{}", attr_key(SCOPE_SYSTEM, attr_name));
                    set.insert(format!("{prefix}.name"), attr_name);
                    set.insert(format!("{prefix}.scope"), SCOPE_SYSTEM);
                    set.insert(
                        format!("{prefix}.value"),
                        ts.try_to_rfc3339_string()
                            .map_err(|e| Error::Internal(anyhow::anyhow!(e)))?,
                    );
                }
            }
            if let Ok(group) = device.get_str("group") {
                let prefix = format!("attributes.{}", attr_key(SCOPE_SYSTEM, ATTR_NAME_GROUP));
                set.insert(format!("{prefix}.name"), ATTR_NAME_GROUP);
                set.insert(format!("{prefix}.scope"), SCOPE_SYSTEM);
                set.insert(format!("{prefix}.value"), group);
            }
            if remove_root && device.contains_key("group") {
                unset.insert("group", "");
            }

            if set.is_empty() && unset.is_empty() {
                continue;
            }
            let mut update = Document::new();
            if !set.is_empty() {
                update.insert("$set", set);
            }
            if !unset.is_empty() {
                update.insert("$unset", unset);
            }
            let id = device.get(FIELD_ID).cloned().unwrap_or(Bson::Null);
            coll.update_one(doc! { FIELD_ID: id }, update).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for MigrateSystemAttributes {
    fn version(&self) -> Version {
        Version::new(1, 0, 0)
    }

    async fn up(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        Self::move_root_fields(db, true).await
    }

    fn supports_maintenance(&self) -> bool {
        true
    }

    async fn maintenance(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        Self::move_root_fields(db, false).await
    }
}

/// 1.0.1 — compound indexes on identity-status combined with the common
/// rollout-targeting attributes.
struct MigrateCompoundIndexes;

#[async_trait]
impl Migration for MigrateCompoundIndexes {
    fn version(&self) -> Version {
        Version::new(1, 0, 1)
    }

    async fn up(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        let coll: Collection<Document> = db.collection(COLLECTION_DEVICES);
        for index in store::compound_status_indexes() {
            if let Err(e) = coll.create_index(index).await {
                if store::is_index_overflow(&e) {
                    tracing::warn!("index limit reached on {}: {e}", db.name());
                    break;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// 1.0.2 — backfill `revision = 0` on documents predating the counter.
struct MigrateRevisionDefault;

#[async_trait]
impl Migration for MigrateRevisionDefault {
    fn version(&self) -> Version {
        Version::new(1, 0, 2)
    }

    async fn up(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        let coll: Collection<Document> = db.collection(COLLECTION_DEVICES);
        coll.update_many(
            doc! { FIELD_REVISION: { "$exists": false } },
            doc! { "$set": { FIELD_REVISION: 0_i64 } },
        )
        .await?;
        Ok(())
    }
}

/// 1.1.0 — create the text index and backfill the synthesized text field.
struct MigrateTextField;

#[async_trait]
impl Migration for MigrateTextField {
    fn version(&self) -> Version {
        Version::new(1, 1, 0)
    }

    async fn up(&self, db: &Database, _ctx: &MigrationContext) -> Result<(), Error> {
        let coll: Collection<Document> = db.collection(COLLECTION_DEVICES);
        if let Err(e) = coll.create_index(store::text_index()).await {
            if store::is_index_overflow(&e) {
                tracing::warn!("index limit reached on {}: {e}", db.name());
            } else {
                return Err(e.into());
            }
        }

        let typed: Collection<crate::store::DeviceDoc> = db.collection(COLLECTION_DEVICES);
        let mut cursor = typed.find(doc! {}).await?;
        while let Some(doc) = cursor.try_next().await? {
            let device = Device::from(doc);
            let text = device.synthesize_text();
            if device.text.as_deref() == Some(text.as_str()) {
                continue;
            }
            coll.update_one(
                doc! { FIELD_ID: &device.id },
                doc! { "$set": { FIELD_TEXT: text } },
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_ascending_and_complete() {
        let migrations = tenant_migrations();
        let versions: Vec<Version> = migrations.iter().map(|m| m.version()).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        assert_eq!(versions, sorted);
        assert_eq!(
            versions,
            vec![
                Version::new(0, 2, 0),
                Version::new(1, 0, 0),
                Version::new(1, 0, 1),
                Version::new(1, 0, 2),
                Version::new(1, 1, 0),
            ]
        );
    }

    #[test]
    fn pending_selects_strictly_newer() {
        let migrations = tenant_migrations();
        assert_eq!(pending(&migrations, &Version::new(0, 0, 0)).len(), 5);
        assert_eq!(pending(&migrations, &Version::new(0, 2, 0)).len(), 4);
        assert_eq!(pending(&migrations, &Version::new(1, 0, 1)).len(), 2);
        assert!(pending(&migrations, &Version::new(1, 1, 0)).is_empty());
        assert!(pending(&migrations, &Version::new(2, 0, 0)).is_empty());
    }

    #[test]
    fn only_the_system_attribute_migration_supports_maintenance() {
        for m in tenant_migrations() {
            assert_eq!(m.supports_maintenance(), m.version() == Version::new(1, 0, 0));
        }
    }
}
