use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{IndexOptions, UpdateOneModel, WriteModel};
use mongodb::{Client, Collection, IndexModel, Namespace};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::migrations;
use crate::models::device::{
    ATTR_NAME_GROUP, Device, DeviceAttribute, DeviceUpdate, SCOPE_SYSTEM, SCOPE_TAGS, attr_key,
};
use crate::models::search::{Filter, FilterAttribute, SearchParams, UpdateResult};
use crate::query_builder::{
    self, FIELD_ID, FIELD_TAGS_ETAG, FIELD_TENANT, FIELD_TEXT, attr_value_field, group_value_field,
};
use crate::tenant;

pub const COLLECTION_DEVICES: &str = "devices";

/// Membership updates run against the database in slices of this size.
pub const GROUP_BATCH_SIZE: usize = 100;

/// Resolved tenant partition: which database to talk to and which filter to
/// merge into every operation. Pre-2.0.0 layouts isolate tenants by database
/// name; from 2.0.0 on a single database carries `tenant_id` per document.
#[derive(Debug, Clone)]
pub struct TenantScope {
    pub db_name: String,
    filter: Document,
}

impl TenantScope {
    pub fn filter(&self) -> Document {
        self.filter.clone()
    }

    pub fn with_id(&self, device_id: &str) -> Document {
        self.merge(doc! { FIELD_ID: device_id })
    }

    pub fn merge(&self, extra: Document) -> Document {
        let mut out = self.filter.clone();
        out.extend(extra);
        out
    }
}

/// On-disk device document (`attributes` in flat `<scope>-<name>` form).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeviceDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, DeviceAttribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<mongodb::bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_ts: Option<mongodb::bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags_etag: Option<String>,
}

impl From<DeviceDoc> for Device {
    fn from(doc: DeviceDoc) -> Self {
        Device {
            id: doc.id,
            attributes: doc.attributes.into_iter().collect(),
            revision: doc.revision,
            created_ts: doc.created_ts.map(|d| d.to_chrono()),
            updated_ts: doc.updated_ts.map(|d| d.to_chrono()),
            text: doc.text,
            tags_etag: doc.tags_etag,
        }
    }
}

#[derive(Deserialize)]
struct FacetPage {
    results: Vec<DeviceDoc>,
    #[serde(rename = "totalCount")]
    total_count: Vec<CountDoc>,
}

#[derive(Deserialize)]
struct CountDoc {
    count: i64,
}

pub struct MongoStore {
    client: Client,
    base_db: String,
    /// True once the 2.0.0 consolidation has been applied to the base
    /// database; decided by `migration_info`, never by code version.
    shared_layout: RwLock<bool>,
}

impl MongoStore {
    pub fn new(client: Client, base_db: impl Into<String>) -> Self {
        MongoStore {
            client,
            base_db: base_db.into(),
            shared_layout: RwLock::new(false),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_db(&self) -> &str {
        &self.base_db
    }

    /// Re-read the base database's migration record and cache the layout
    /// decision. Called at startup and after every migration run.
    pub async fn refresh_layout(&self) -> Result<(), Error> {
        let version = migrations::db_version(&self.client.database(&self.base_db)).await?;
        let shared = version
            .map(|v| v >= migrations::consolidation_version())
            .unwrap_or(false);
        *self.shared_layout.write().unwrap() = shared;
        Ok(())
    }

    pub fn scope(&self, tenant_id: Option<&str>) -> TenantScope {
        let shared = *self.shared_layout.read().unwrap();
        match tenant_id {
            Some(t) if shared => TenantScope {
                db_name: self.base_db.clone(),
                filter: doc! { FIELD_TENANT: t },
            },
            Some(t) => TenantScope {
                db_name: tenant::tenant_db_name(&self.base_db, t),
                filter: Document::new(),
            },
            None => TenantScope {
                db_name: self.base_db.clone(),
                filter: Document::new(),
            },
        }
    }

    fn devices(&self, scope: &TenantScope) -> Collection<DeviceDoc> {
        self.client
            .database(&scope.db_name)
            .collection(COLLECTION_DEVICES)
    }

    fn devices_raw(&self, scope: &TenantScope) -> Collection<Document> {
        self.client
            .database(&scope.db_name)
            .collection(COLLECTION_DEVICES)
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.client
            .database(&self.base_db)
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    pub async fn get_device(
        &self,
        scope: &TenantScope,
        device_id: &str,
    ) -> Result<Option<Device>, Error> {
        let doc = self.devices(scope).find_one(scope.with_id(device_id)).await?;
        Ok(doc.map(Device::from))
    }

    pub async fn get_device_group(
        &self,
        scope: &TenantScope,
        device_id: &str,
    ) -> Result<Option<Option<String>>, Error> {
        // project the whole attribute subdocument so it still decodes
        let group_attr = format!("attributes.{}", attr_key(SCOPE_SYSTEM, ATTR_NAME_GROUP));
        let doc = self
            .devices(scope)
            .find_one(scope.with_id(device_id))
            .projection(doc! { group_attr: 1 })
            .await?;
        Ok(doc.map(|d| Device::from(d).group().map(str::to_owned)))
    }

    /// Differential upsert of the provided attributes; creates the device on
    /// first contact and bumps its revision. `text` rides along in the same
    /// write when the caller has it precomputed.
    pub async fn upsert_attributes(
        &self,
        scope: &TenantScope,
        device_id: &str,
        attrs: &[DeviceAttribute],
        text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        let mut update = query_builder::upsert_update_doc(attrs, now, None)?;
        if let (Some(text), Ok(set)) = (text, update.get_document_mut("$set")) {
            set.insert(FIELD_TEXT, text);
        }
        let res = self
            .devices_raw(scope)
            .update_one(scope.with_id(device_id), update)
            .upsert(true)
            .await
            .map_err(map_mongo_error)?;
        Ok(UpdateResult {
            matched: res.matched_count,
            updated: res.modified_count,
            created: res.upserted_id.is_some() as u64,
            ..Default::default()
        })
    }

    /// Upsert that also maintains the per-scope ETag. A non-empty `etag`
    /// turns the write into a guarded update: no match means the stored ETag
    /// moved (or the device is gone) and nothing is written.
    pub async fn upsert_attributes_with_updated(
        &self,
        scope: &TenantScope,
        device_id: &str,
        attrs: &[DeviceAttribute],
        attr_scope: &str,
        etag: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        let new_etag = (attr_scope == SCOPE_TAGS).then(|| uuid::Uuid::new_v4().to_string());
        let update = query_builder::upsert_update_doc(attrs, now, new_etag.as_deref())?;

        let guarded = etag.is_some_and(|e| !e.is_empty());
        let mut filter = scope.with_id(device_id);
        if attr_scope == SCOPE_TAGS
            && let Some(e) = etag.filter(|e| !e.is_empty())
        {
            filter.insert(FIELD_TAGS_ETAG, e);
        }

        let res = self
            .devices_raw(scope)
            .update_one(filter, update)
            .upsert(!guarded)
            .await
            .map_err(map_mongo_error)?;
        Ok(UpdateResult {
            matched: res.matched_count,
            updated: res.modified_count,
            created: res.upserted_id.is_some() as u64,
            ..Default::default()
        })
    }

    /// Revision-guarded batch upsert, compiled into a single bulk write.
    /// A device whose stored revision is newer fails its guard with a
    /// duplicate-key on the upsert insert; those rows count as matched but
    /// not updated.
    pub async fn upsert_devices_attributes_with_revision(
        &self,
        scope: &TenantScope,
        updates: &[DeviceUpdate],
        attrs: &[DeviceAttribute],
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        if updates.is_empty() {
            return Ok(UpdateResult::default());
        }
        let ns = Namespace {
            db: scope.db_name.clone(),
            coll: COLLECTION_DEVICES.to_string(),
        };
        let mut models = Vec::with_capacity(updates.len());
        for update in updates {
            let filter = scope.merge(query_builder::revision_guard_filter(
                &update.id,
                update.revision,
            ));
            let update_doc =
                query_builder::upsert_with_revision_update_doc(attrs, update.revision, now)?;
            models.push(WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(ns.clone())
                    .filter(filter)
                    .update(update_doc)
                    .upsert(true)
                    .build(),
            ));
        }

        match self.client.bulk_write(models).ordered(false).await {
            Ok(res) => Ok(UpdateResult {
                matched: res.matched_count as u64,
                updated: res.modified_count as u64,
                created: res.upserted_count as u64,
                ..Default::default()
            }),
            Err(e) => match *e.kind {
                // stale revisions: the guard made the filter miss and the
                // upsert collided with the existing _id
                ErrorKind::BulkWrite(ref failure)
                    if !failure.write_errors.is_empty()
                        && failure.write_errors.values().all(|we| we.code == 11000) =>
                {
                    let stale = failure.write_errors.len() as u64;
                    let mut result = UpdateResult {
                        matched: stale,
                        ..Default::default()
                    };
                    if let Some(mongodb::error::PartialBulkWriteResult::Summary(summary)) =
                        &failure.partial_result
                    {
                        result.matched += summary.matched_count as u64;
                        result.updated = summary.modified_count as u64;
                        result.created = summary.upserted_count as u64;
                    }
                    Ok(result)
                }
                _ => Err(map_mongo_error(e)),
            },
        }
    }

    /// Upsert `attrs` and atomically remove `remove_keys` (attribute-map
    /// keys) from the same document. Same ETag semantics as
    /// [`Self::upsert_attributes_with_updated`].
    pub async fn replace_attributes(
        &self,
        scope: &TenantScope,
        device_id: &str,
        attrs: &[DeviceAttribute],
        remove_keys: &[String],
        attr_scope: &str,
        etag: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        let new_etag = (attr_scope == SCOPE_TAGS).then(|| uuid::Uuid::new_v4().to_string());
        let update = query_builder::replace_attributes_update_doc(
            attrs,
            remove_keys,
            now,
            new_etag.as_deref(),
        )?;

        let guarded = etag.is_some_and(|e| !e.is_empty());
        let mut filter = scope.with_id(device_id);
        if attr_scope == SCOPE_TAGS
            && let Some(e) = etag.filter(|e| !e.is_empty())
        {
            filter.insert(FIELD_TAGS_ETAG, e);
        }

        let res = self
            .devices_raw(scope)
            .update_one(filter, update)
            .upsert(!guarded)
            .await
            .map_err(map_mongo_error)?;
        Ok(UpdateResult {
            matched: res.matched_count,
            updated: res.modified_count,
            created: res.upserted_id.is_some() as u64,
            ..Default::default()
        })
    }

    pub async fn update_devices_group(
        &self,
        scope: &TenantScope,
        device_ids: &[String],
        group: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        let filter = scope.merge(doc! { FIELD_ID: { "$in": device_ids } });
        let res = self
            .devices_raw(scope)
            .update_many(filter, query_builder::set_group_update_doc(group, now))
            .await?;
        Ok(UpdateResult {
            matched: res.matched_count,
            updated: res.modified_count,
            ..Default::default()
        })
    }

    /// Clear the group attribute of the listed devices, but only where the
    /// current group matches.
    pub async fn unset_devices_group(
        &self,
        scope: &TenantScope,
        device_ids: &[String],
        group: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateResult, Error> {
        let filter = scope.merge(doc! {
            FIELD_ID: { "$in": device_ids },
            group_value_field(): group,
        });
        let res = self
            .devices_raw(scope)
            .update_many(filter, query_builder::unset_group_update_doc(now))
            .await?;
        Ok(UpdateResult {
            matched: res.matched_count,
            updated: res.modified_count,
            ..Default::default()
        })
    }

    /// Remove every member of `group`, in sorted batches of
    /// [`GROUP_BATCH_SIZE`]. Returns the affected device ids for reindexing.
    pub async fn delete_group(
        &self,
        scope: &TenantScope,
        group: &str,
        now: DateTime<Utc>,
    ) -> Result<(UpdateResult, Vec<String>), Error> {
        let filter = scope.merge(doc! { group_value_field(): group });
        let mut cursor = self
            .devices_raw(scope)
            .find(filter)
            .projection(doc! { FIELD_ID: 1 })
            .sort(doc! { FIELD_ID: 1 })
            .await?;

        let mut ids = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            ids.push(doc.get_str(FIELD_ID).unwrap_or_default().to_string());
        }

        let mut result = UpdateResult::default();
        for chunk in ids.chunks(GROUP_BATCH_SIZE) {
            let filter = scope.merge(doc! {
                FIELD_ID: { "$in": chunk },
                group_value_field(): group,
            });
            let res = self
                .devices_raw(scope)
                .update_many(filter, query_builder::unset_group_update_doc(now))
                .await?;
            result.matched += res.matched_count;
            result.updated += res.modified_count;
        }
        Ok((result, ids))
    }

    pub async fn delete_devices(
        &self,
        scope: &TenantScope,
        device_ids: &[String],
    ) -> Result<UpdateResult, Error> {
        let filter = scope.merge(doc! { FIELD_ID: { "$in": device_ids } });
        let res = self.devices_raw(scope).delete_many(filter).await?;
        Ok(UpdateResult {
            deleted: res.deleted_count,
            ..Default::default()
        })
    }

    pub async fn list_groups(
        &self,
        scope: &TenantScope,
        filters: &[Filter],
    ) -> Result<Vec<String>, Error> {
        let params = SearchParams {
            filters: filters.to_vec(),
            ..Default::default()
        };
        let filter = query_builder::build_match(&params, &scope.filter())?;
        let values = self
            .devices_raw(scope)
            .distinct(group_value_field(), filter)
            .await?;
        let mut groups: Vec<String> = values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        groups.sort();
        Ok(groups)
    }

    /// One round trip: filter, sort, paginate and count via `$facet`.
    pub async fn search_devices(
        &self,
        scope: &TenantScope,
        params: &SearchParams,
    ) -> Result<(Vec<Device>, u64), Error> {
        let pipeline = query_builder::build_pipeline(params, &scope.filter())?;
        let mut cursor = self
            .devices(scope)
            .aggregate(pipeline)
            .with_type::<FacetPage>()
            .await?;
        let Some(page) = cursor.try_next().await? else {
            return Ok((Vec::new(), 0));
        };
        let total = page.total_count.first().map(|c| c.count).unwrap_or(0);
        let devices = page.results.into_iter().map(Device::from).collect();
        Ok((devices, total.max(0) as u64))
    }

    /// Frequency-ranked `(scope, name, count)` over the distinct attribute
    /// key set. Monitor-scope attributes and the synthesized text field are
    /// internal and excluded.
    pub async fn get_filters_attributes(
        &self,
        scope: &TenantScope,
    ) -> Result<Vec<FilterAttribute>, Error> {
        let mut cursor = self
            .devices(scope)
            .aggregate(filter_attributes_pipeline(&scope.filter()))
            .with_type::<FilterAttribute>()
            .await?;
        let mut out = Vec::new();
        while let Some(attr) = cursor.try_next().await? {
            out.push(attr);
        }
        Ok(out)
    }

    /// Persist a freshly synthesized text field.
    pub async fn update_text(
        &self,
        scope: &TenantScope,
        device_id: &str,
        text: &str,
    ) -> Result<(), Error> {
        self.devices_raw(scope)
            .update_one(
                scope.with_id(device_id),
                doc! { "$set": { FIELD_TEXT: text } },
            )
            .await?;
        Ok(())
    }

    /// Create the standing index set on a database. "Too many indexes" is
    /// logged and tolerated.
    pub async fn ensure_indexes(&self, db_name: &str) -> Result<(), Error> {
        let coll: Collection<Document> = self
            .client
            .database(db_name)
            .collection(COLLECTION_DEVICES);
        for index in standing_indexes() {
            if let Err(e) = coll.create_index(index).await {
                if is_index_overflow(&e) {
                    tracing::warn!("index limit reached on {db_name}, skipping: {e}");
                    continue;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// The index set kept on every inventory database: text search plus the
/// status-combined compound indexes the fleet dashboards page on.
pub fn standing_indexes() -> Vec<IndexModel> {
    let mut indexes = vec![text_index()];
    indexes.extend(compound_status_indexes());
    indexes
}

pub fn text_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { FIELD_TEXT: "text" })
        .options(IndexOptions::builder().name("inventory_text".to_string()).build())
        .build()
}

pub fn compound_status_indexes() -> Vec<IndexModel> {
    let status = attr_value_field("identity", "status");
    let compound = |second: String, name: &str| {
        IndexModel::builder()
            .keys(doc! { &status: 1, second: 1 })
            .options(IndexOptions::builder().name(name.to_string()).build())
            .build()
    };
    vec![
        compound(attr_value_field("identity", "mac"), "status_mac"),
        compound(
            attr_value_field("inventory", "device_type"),
            "status_device_type",
        ),
        compound(group_value_field(), "status_group"),
        compound(
            attr_value_field("system", "updated_ts"),
            "status_updated_ts",
        ),
    ]
}

pub(crate) fn filter_attributes_pipeline(scope_filter: &Document) -> Vec<Document> {
    let mut pipeline = Vec::new();
    if !scope_filter.is_empty() {
        pipeline.push(doc! { "$match": scope_filter.clone() });
    }
    pipeline.extend([
        doc! { "$project": { "attrs": { "$objectToArray": "$attributes" } } },
        doc! { "$unwind": "$attrs" },
        doc! { "$match": {
            "attrs.v.scope": { "$ne": crate::models::device::SCOPE_MONITOR },
            "attrs.v.name": { "$ne": FIELD_TEXT },
        } },
        doc! { "$group": {
            "_id": { "name": "$attrs.v.name", "scope": "$attrs.v.scope" },
            "count": { "$sum": 1 },
        } },
        doc! { "$sort": { "count": -1, "_id.name": 1, "_id.scope": 1 } },
        doc! { "$project": { "_id": 0, "name": "$_id.name", "scope": "$_id.scope", "count": 1 } },
    ]);
    pipeline
}

/// Duplicate `_id` anywhere in the store surfaces as `DuplicatedDeviceId`.
pub(crate) fn map_mongo_error(e: mongodb::error::Error) -> Error {
    if is_duplicate_key(&e) {
        Error::DuplicatedDeviceId
    } else {
        e.into()
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match &*e.kind {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(we)) => we.code == 11000,
        ErrorKind::BulkWrite(bwe) => bwe.write_errors.values().any(|we| we.code == 11000),
        ErrorKind::InsertMany(ime) => ime
            .write_errors
            .as_ref()
            .is_some_and(|errs| errs.iter().any(|we| we.code == 11000)),
        _ => false,
    }
}

pub(crate) fn is_index_overflow(e: &mongodb::error::Error) -> bool {
    e.to_string().contains("too many indexes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_scope_merges_filters() {
        let scope = TenantScope {
            db_name: "inventory".into(),
            filter: doc! { "tenant_id": "t1" },
        };
        assert_eq!(
            scope.with_id("d1"),
            doc! { "tenant_id": "t1", "_id": "d1" }
        );

        let bare = TenantScope {
            db_name: "inventory-t1".into(),
            filter: Document::new(),
        };
        assert_eq!(bare.with_id("d1"), doc! { "_id": "d1" });
    }

    #[test]
    fn standing_indexes_cover_rollout_fields() {
        let indexes = standing_indexes();
        assert_eq!(indexes.len(), 5);
        let keys: Vec<&Document> = indexes.iter().map(|i| &i.keys).collect();
        assert_eq!(keys[0], &doc! { "text": "text" });
        assert_eq!(
            keys[1],
            &doc! { "attributes.identity-status.value": 1, "attributes.identity-mac.value": 1 }
        );
        assert_eq!(
            keys[3],
            &doc! { "attributes.identity-status.value": 1, "attributes.system-group.value": 1 }
        );
    }

    #[test]
    fn filter_attributes_pipeline_excludes_monitor_and_text() {
        let pipeline = filter_attributes_pipeline(&doc! { "tenant_id": "t1" });
        assert_eq!(
            pipeline[0],
            doc! { "$match": { "tenant_id": "t1" } }
        );
        let exclude = pipeline[3].get_document("$match").unwrap();
        assert_eq!(
            exclude.get_document("attrs.v.scope").unwrap(),
            &doc! { "$ne": "monitor" }
        );
        assert_eq!(
            exclude.get_document("attrs.v.name").unwrap(),
            &doc! { "$ne": "text" }
        );

        // without a tenant filter the $match prefix is dropped
        let pipeline = filter_attributes_pipeline(&Document::new());
        assert!(pipeline[0].contains_key("$project"));
    }
}
