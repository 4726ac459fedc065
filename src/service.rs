//! Inventory policy layer on top of the store: scope limits, ETag checks,
//! text-field maintenance, group cascade and the best-effort reindex fan-out
//! to the reporting service.

use chrono::Utc;

use crate::context::ReqCtx;
use crate::error::Error;
use crate::migrations::Migrator;
use crate::models::device::{
    Device, DeviceAttribute, DeviceUpdate, SCOPE_INVENTORY, SCOPE_TAGS, validate_device_id,
    validate_group_name,
};
use crate::models::search::{Filter, FilterAttribute, SearchParams, UpdateResult};
use crate::monitoring::MonitoringClient;
use crate::reporting::ReportingClient;
use crate::store::{GROUP_BATCH_SIZE, MongoStore, TenantScope};

/// Per-scope attribute count limits. Zero disables the bound.
#[derive(Debug, Clone, Copy)]
pub struct ScopeLimits {
    pub attributes: usize,
    pub tags: usize,
}

impl Default for ScopeLimits {
    fn default() -> Self {
        ScopeLimits {
            attributes: 100,
            tags: 20,
        }
    }
}

impl ScopeLimits {
    fn for_scope(&self, scope: &str) -> usize {
        match scope {
            SCOPE_TAGS => self.tags,
            SCOPE_INVENTORY => self.attributes,
            _ => 0,
        }
    }
}

pub struct InventoryService {
    store: MongoStore,
    reporting: Option<ReportingClient>,
    monitoring: Option<MonitoringClient>,
    limits: ScopeLimits,
}

impl InventoryService {
    pub fn new(store: MongoStore, limits: ScopeLimits) -> Self {
        InventoryService {
            store,
            reporting: None,
            monitoring: None,
            limits,
        }
    }

    pub fn with_reporting(mut self, client: ReportingClient) -> Self {
        self.reporting = Some(client);
        self
    }

    pub fn with_monitoring(mut self, client: MonitoringClient) -> Self {
        self.monitoring = Some(client);
        self
    }

    pub fn store(&self) -> &MongoStore {
        &self.store
    }

    fn scope(&self, ctx: &ReqCtx) -> TenantScope {
        self.store.scope(ctx.tenant_id())
    }

    pub async fn add_device(&self, ctx: &ReqCtx, device: &Device) -> Result<(), Error> {
        validate_device_id(&device.id)?;
        let attrs: Vec<DeviceAttribute> = device.attributes.values().cloned().collect();
        let text = device.synthesize_text();
        let scope = self.scope(ctx);
        self.store
            .upsert_attributes(&scope, &device.id, &attrs, Some(&text), Utc::now())
            .await?;
        self.reindex(ctx, std::slice::from_ref(&device.id)).await;
        Ok(())
    }

    pub async fn upsert_attributes(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
        attrs: &[DeviceAttribute],
    ) -> Result<(), Error> {
        validate_device_id(device_id)?;
        let scope = self.scope(ctx);
        let res = self
            .store
            .upsert_attributes(&scope, device_id, attrs, None, Utc::now())
            .await?;
        if res.matched > 0 || res.created > 0 {
            self.maintain_text(ctx, device_id).await;
        }
        self.reindex(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    pub async fn upsert_attributes_with_updated(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
        attrs: &[DeviceAttribute],
        attr_scope: &str,
        etag: Option<&str>,
    ) -> Result<(), Error> {
        validate_device_id(device_id)?;
        let scope = self.scope(ctx);
        self.check_scope_limit(&scope, device_id, attr_scope, attrs)
            .await?;
        let res = self
            .store
            .upsert_attributes_with_updated(&scope, device_id, attrs, attr_scope, etag, Utc::now())
            .await?;
        if attr_scope == SCOPE_TAGS
            && etag.is_some_and(|e| !e.is_empty())
            && res.matched == 0
            && res.created == 0
        {
            return Err(Error::ETagDoesNotMatch);
        }
        if res.matched > 0 || res.created > 0 {
            self.maintain_text(ctx, device_id).await;
        }
        self.reindex(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    /// Upsert `attrs` and remove every other attribute of the scope, in one
    /// atomic document update.
    pub async fn replace_attributes(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
        attrs: &[DeviceAttribute],
        attr_scope: &str,
        etag: Option<&str>,
    ) -> Result<(), Error> {
        validate_device_id(device_id)?;
        let limit = self.limits.for_scope(attr_scope);
        if limit > 0 && attrs.len() > limit {
            return Err(Error::TooManyAttributes);
        }

        let scope = self.scope(ctx);
        let current = self.store.get_device(&scope, device_id).await?;
        let remove_keys: Vec<String> = current
            .as_ref()
            .map(|dev| {
                let keep: Vec<String> = attrs.iter().map(|a| a.key()).collect();
                dev.attributes
                    .values()
                    .filter(|a| a.scope == attr_scope && !keep.contains(&a.key()))
                    .map(|a| a.key())
                    .collect()
            })
            .unwrap_or_default();

        let res = self
            .store
            .replace_attributes(
                &scope,
                device_id,
                attrs,
                &remove_keys,
                attr_scope,
                etag,
                Utc::now(),
            )
            .await?;
        if attr_scope == SCOPE_TAGS
            && etag.is_some_and(|e| !e.is_empty())
            && res.matched == 0
            && res.created == 0
        {
            return Err(Error::ETagDoesNotMatch);
        }
        if res.matched > 0 || res.created > 0 {
            self.maintain_text(ctx, device_id).await;
        }
        self.reindex(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    /// Revision-guarded batch upsert from agent reports; stale revisions are
    /// skipped and show up as matched-but-not-updated.
    pub async fn upsert_devices_statuses(
        &self,
        ctx: &ReqCtx,
        updates: &[DeviceUpdate],
        attrs: &[DeviceAttribute],
    ) -> Result<UpdateResult, Error> {
        for update in updates {
            validate_device_id(&update.id)?;
        }
        let scope = self.scope(ctx);
        let res = self
            .store
            .upsert_devices_attributes_with_revision(&scope, updates, attrs, Utc::now())
            .await?;
        let ids: Vec<String> = updates.iter().map(|u| u.id.clone()).collect();
        self.reindex(ctx, &ids).await;
        Ok(res)
    }

    pub async fn get_device(&self, ctx: &ReqCtx, device_id: &str) -> Result<Option<Device>, Error> {
        let scope = self.scope(ctx);
        self.store.get_device(&scope, device_id).await
    }

    pub async fn delete_device(&self, ctx: &ReqCtx, device_id: &str) -> Result<(), Error> {
        let scope = self.scope(ctx);
        let res = self
            .store
            .delete_devices(&scope, std::slice::from_ref(&device_id.to_string()))
            .await?;
        if res.deleted == 0 {
            return Err(Error::DevNotFound);
        }
        self.reindex_deleted(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    pub async fn delete_devices(
        &self,
        ctx: &ReqCtx,
        device_ids: &[String],
    ) -> Result<UpdateResult, Error> {
        let scope = self.scope(ctx);
        let res = self.store.delete_devices(&scope, device_ids).await?;
        self.reindex_deleted(ctx, device_ids).await;
        Ok(res)
    }

    pub async fn update_device_group(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
        group: &str,
    ) -> Result<(), Error> {
        validate_group_name(group)?;
        let scope = self.scope(ctx);
        let res = self
            .store
            .update_devices_group(&scope, std::slice::from_ref(&device_id.to_string()), group, Utc::now())
            .await?;
        if res.matched == 0 {
            return Err(Error::DevNotFound);
        }
        self.maintain_text(ctx, device_id).await;
        self.reindex(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    pub async fn update_devices_group(
        &self,
        ctx: &ReqCtx,
        device_ids: &[String],
        group: &str,
    ) -> Result<UpdateResult, Error> {
        validate_group_name(group)?;
        let scope = self.scope(ctx);
        let res = self
            .store
            .update_devices_group(&scope, device_ids, group, Utc::now())
            .await?;
        self.reindex(ctx, device_ids).await;
        Ok(res)
    }

    /// Remove the device from `group`; a device in another group (or none)
    /// does not match.
    pub async fn unset_device_group(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
        group: &str,
    ) -> Result<(), Error> {
        validate_group_name(group)?;
        let scope = self.scope(ctx);
        let res = self
            .store
            .unset_devices_group(&scope, std::slice::from_ref(&device_id.to_string()), group, Utc::now())
            .await?;
        if res.matched == 0 {
            return Err(Error::DevNotFound);
        }
        self.maintain_text(ctx, device_id).await;
        self.reindex(ctx, &[device_id.to_string()]).await;
        Ok(())
    }

    pub async fn unset_devices_group(
        &self,
        ctx: &ReqCtx,
        device_ids: &[String],
        group: &str,
    ) -> Result<UpdateResult, Error> {
        validate_group_name(group)?;
        let scope = self.scope(ctx);
        let res = self
            .store
            .unset_devices_group(&scope, device_ids, group, Utc::now())
            .await?;
        self.reindex(ctx, device_ids).await;
        Ok(res)
    }

    /// Clear the group from every member, reindexing in batches as the store
    /// works through them.
    pub async fn delete_group(&self, ctx: &ReqCtx, group: &str) -> Result<UpdateResult, Error> {
        validate_group_name(group)?;
        let scope = self.scope(ctx);
        let (res, ids) = self.store.delete_group(&scope, group, Utc::now()).await?;
        if res.matched == 0 {
            return Err(Error::GroupNotFound);
        }
        for chunk in ids.chunks(GROUP_BATCH_SIZE) {
            self.reindex(ctx, chunk).await;
        }
        Ok(res)
    }

    pub async fn list_groups(
        &self,
        ctx: &ReqCtx,
        filters: &[Filter],
    ) -> Result<Vec<String>, Error> {
        let scope = self.scope(ctx);
        self.store.list_groups(&scope, filters).await
    }

    pub async fn get_device_group(
        &self,
        ctx: &ReqCtx,
        device_id: &str,
    ) -> Result<Option<String>, Error> {
        let scope = self.scope(ctx);
        match self.store.get_device_group(&scope, device_id).await? {
            None => Err(Error::DevNotFound),
            Some(group) => Ok(group),
        }
    }

    pub async fn list_devices_by_group(
        &self,
        ctx: &ReqCtx,
        group: &str,
        page: i64,
        per_page: i64,
    ) -> Result<(Vec<Device>, u64), Error> {
        validate_group_name(group)?;
        let params = SearchParams {
            page,
            per_page,
            group: Some(group.to_string()),
            ..Default::default()
        };
        params.validate()?;
        let scope = self.scope(ctx);
        let (devices, total) = self.store.search_devices(&scope, &params).await?;
        if total == 0 {
            return Err(Error::GroupNotFound);
        }
        Ok((devices, total))
    }

    pub async fn search_devices(
        &self,
        ctx: &ReqCtx,
        params: &SearchParams,
    ) -> Result<(Vec<Device>, u64), Error> {
        params.validate()?;
        let scope = self.scope(ctx);
        self.store.search_devices(&scope, params).await
    }

    pub async fn get_filters_attributes(
        &self,
        ctx: &ReqCtx,
    ) -> Result<Vec<FilterAttribute>, Error> {
        let scope = self.scope(ctx);
        self.store.get_filters_attributes(&scope).await
    }

    pub async fn check_alerts(&self, ctx: &ReqCtx, device_id: &str) -> Result<usize, Error> {
        let Some(monitoring) = &self.monitoring else {
            return Err(Error::Internal(anyhow::anyhow!(
                "device monitoring is not configured"
            )));
        };
        monitoring.check_alerts(ctx, device_id).await
    }

    /// Bring a (new) tenant to the current schema version.
    pub async fn create_tenant(&self, tenant_id: &str) -> Result<(), Error> {
        if tenant_id.is_empty() {
            return Err(Error::validation("tenant_id cannot be empty"));
        }
        let migrator = Migrator::new(self.store.client().clone(), self.store.base_db(), true);
        migrator.migrate_tenant(tenant_id).await?;
        self.store.refresh_layout().await?;
        let scope = self.store.scope(Some(tenant_id));
        self.store.ensure_indexes(&scope.db_name).await
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.store.ping().await?;
        if let Some(reporting) = &self.reporting {
            reporting.check_health().await?;
        }
        Ok(())
    }

    /// Pre-flight count check: existing attributes in the scope plus the
    /// genuinely new ones must stay within the limit.
    async fn check_scope_limit(
        &self,
        scope: &TenantScope,
        device_id: &str,
        attr_scope: &str,
        attrs: &[DeviceAttribute],
    ) -> Result<(), Error> {
        let limit = self.limits.for_scope(attr_scope);
        if limit == 0 {
            return Ok(());
        }
        let device = self.store.get_device(scope, device_id).await?;
        if exceeds_limit(device.as_ref(), attr_scope, attrs, limit) {
            return Err(Error::TooManyAttributes);
        }
        Ok(())
    }

    /// Recompute the text field and persist it when changed. Best effort:
    /// failures are logged, never surfaced.
    async fn maintain_text(&self, ctx: &ReqCtx, device_id: &str) {
        let scope = self.scope(ctx);
        let result = async {
            let Some(device) = self.store.get_device(&scope, device_id).await? else {
                return Ok(());
            };
            let text = device.synthesize_text();
            if device.text.as_deref() != Some(text.as_str()) {
                self.store.update_text(&scope, device_id, &text).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("text maintenance for {device_id} failed: {e}");
        }
    }

    /// Submit the affected ids to reporting, if enabled. Failures are logged;
    /// inventory state stays authoritative.
    async fn reindex(&self, ctx: &ReqCtx, device_ids: &[String]) {
        let Some(reporting) = &self.reporting else {
            return;
        };
        if let Err(e) = reporting.start_reindex(ctx, device_ids).await {
            tracing::warn!("reindex of {} device(s) failed: {e}", device_ids.len());
        }
    }

    /// The reporting service expects deletions one device per request.
    async fn reindex_deleted(&self, ctx: &ReqCtx, device_ids: &[String]) {
        if self.reporting.is_none() {
            return;
        }
        for id in device_ids {
            self.reindex(ctx, std::slice::from_ref(id)).await;
        }
    }
}

/// Would writing `attrs` into `attr_scope` push the device over `limit`?
/// Attributes already present do not count twice.
fn exceeds_limit(
    device: Option<&Device>,
    attr_scope: &str,
    attrs: &[DeviceAttribute],
    limit: usize,
) -> bool {
    let existing = device.map(|d| d.scope_len(attr_scope)).unwrap_or(0);
    let new = attrs
        .iter()
        .filter(|a| a.scope == attr_scope)
        .filter(|a| {
            device
                .map(|d| !d.attributes.contains_key(&a.key()))
                .unwrap_or(true)
        })
        .count();
    existing + new > limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::AttributeValue;

    fn tag(name: &str) -> DeviceAttribute {
        DeviceAttribute::new(SCOPE_TAGS, name, AttributeValue::Str("v".into()))
    }

    fn device_with_tags(names: &[&str]) -> Device {
        Device::with_attributes("d1", names.iter().map(|n| tag(n)).collect()).unwrap()
    }

    #[test]
    fn limit_counts_only_new_attributes() {
        let dev = device_with_tags(&["a", "b"]);
        // overwriting existing tags stays within any limit
        assert!(!exceeds_limit(Some(&dev), SCOPE_TAGS, &[tag("a"), tag("b")], 2));
        // one genuinely new tag breaks a limit of 2
        assert!(exceeds_limit(Some(&dev), SCOPE_TAGS, &[tag("c")], 2));
        assert!(!exceeds_limit(Some(&dev), SCOPE_TAGS, &[tag("c")], 3));
    }

    #[test]
    fn limit_applies_to_fresh_devices() {
        assert!(exceeds_limit(None, SCOPE_TAGS, &[tag("a"), tag("b"), tag("c")], 2));
        assert!(!exceeds_limit(None, SCOPE_TAGS, &[tag("a"), tag("b")], 2));
    }

    #[test]
    fn other_scopes_do_not_count_against_the_limit() {
        let mut dev = device_with_tags(&["a"]);
        dev.insert_attribute(DeviceAttribute::new(
            SCOPE_INVENTORY,
            "mac",
            AttributeValue::Str("aa".into()),
        ))
        .unwrap();
        assert!(!exceeds_limit(Some(&dev), SCOPE_TAGS, &[tag("b")], 2));
    }

    #[test]
    fn scope_limits_lookup() {
        let limits = ScopeLimits::default();
        assert_eq!(limits.for_scope(SCOPE_TAGS), 20);
        assert_eq!(limits.for_scope(SCOPE_INVENTORY), 100);
        assert_eq!(limits.for_scope("identity"), 0);
    }
}
