use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document, doc};

use crate::error::Error;
use crate::models::device::{
    ATTR_NAME_CREATED, ATTR_NAME_GROUP, ATTR_NAME_UPDATED, DeviceAttribute, SCOPE_SYSTEM, attr_key,
};
use crate::models::search::{Filter, FilterOp, SearchParams, SortOrder};

pub const FIELD_ID: &str = "_id";
pub const FIELD_TENANT: &str = "tenant_id";
pub const FIELD_TEXT: &str = "text";
pub const FIELD_REVISION: &str = "revision";
pub const FIELD_CREATED: &str = "created_ts";
pub const FIELD_UPDATED: &str = "updated_ts";
pub const FIELD_TAGS_ETAG: &str = "tags_etag";

/// The document field holding an attribute's value, e.g.
/// `attributes.inventory-sn.value`.
pub fn attr_value_field(scope: &str, name: &str) -> String {
    format!("attributes.{}.value", attr_key(scope, name))
}

pub fn group_value_field() -> String {
    attr_value_field(SCOPE_SYSTEM, ATTR_NAME_GROUP)
}

fn scalar_bson(v: &serde_json::Value) -> Result<Bson, Error> {
    match v {
        serde_json::Value::String(s) => Ok(Bson::String(s.clone())),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Bson::Double)
            .ok_or_else(|| Error::validation("filter value is not a representable number")),
        _ => Err(Error::validation("filter value must be a string or number")),
    }
}

/// Translate one filter predicate into a match condition. Attribute values
/// are stored exactly as reported, so a numeric-looking string filter value
/// matches both its string and parsed-float form.
fn filter_condition(filter: &Filter) -> Result<Document, Error> {
    let field = attr_value_field(&filter.scope, &filter.attribute);
    let op = filter.operator.as_mongo();
    let cond = match filter.operator {
        FilterOp::Exists => {
            let val = filter
                .value
                .as_bool()
                .ok_or_else(|| Error::validation("filter $exists requires a boolean value"))?;
            doc! { field: { op: val } }
        }
        FilterOp::Regex => {
            let pattern = filter
                .value
                .as_str()
                .ok_or_else(|| Error::validation("filter $regex requires a string value"))?;
            doc! { field: { op: pattern } }
        }
        FilterOp::In | FilterOp::Nin => {
            let items = filter
                .value
                .as_array()
                .ok_or_else(|| Error::validation("filter requires an array value"))?;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(scalar_bson(item)?);
                if let Some(n) = item.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    values.push(Bson::Double(n));
                }
            }
            doc! { field: { op: values } }
        }
        _ => {
            let value = scalar_bson(&filter.value)?;
            match filter.value.as_str().and_then(|s| s.parse::<f64>().ok()) {
                Some(n) => doc! { "$or": [
                    { &field: { op: value } },
                    { &field: { op: Bson::Double(n) } },
                ] },
                None => doc! { field: { op: value } },
            }
        }
    };
    Ok(cond)
}

/// Build the `$match` stage for a search. `scope_filter` carries the tenant
/// constraint (empty for per-tenant databases).
pub fn build_match(params: &SearchParams, scope_filter: &Document) -> Result<Document, Error> {
    let mut conditions: Vec<Document> = Vec::new();
    if !scope_filter.is_empty() {
        conditions.push(scope_filter.clone());
    }
    if let Some(text) = params.text.as_deref().map(str::trim)
        && !text.is_empty()
    {
        conditions.push(doc! { "$text": { "$search": text } });
    }
    for filter in &params.filters {
        conditions.push(filter_condition(filter)?);
    }
    if let Some(group) = &params.group {
        conditions.push(doc! { group_value_field(): group });
    }
    if let Some(has_group) = params.has_group {
        conditions.push(doc! { group_value_field(): { "$exists": has_group } });
    }
    if !params.device_ids.is_empty() {
        conditions.push(doc! { FIELD_ID: { "$in": &params.device_ids[..] } });
    }
    Ok(match conditions.len() {
        0 => Document::new(),
        1 => conditions.into_iter().next().unwrap(),
        _ => doc! { "$and": conditions },
    })
}

fn sort_stage(params: &SearchParams) -> Document {
    let mut sort = Document::new();
    for s in &params.sort {
        let dir = match s.order {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        };
        sort.insert(attr_value_field(&s.scope, &s.attribute), dir);
    }
    // _id ascending: stable pagination and tie-breaking
    sort.insert(FIELD_ID, 1);
    sort
}

/// Compile a search into one aggregation: `$match` then a `$facet` with the
/// result page on one branch and the pre-pagination count on the other.
pub fn build_pipeline(
    params: &SearchParams,
    scope_filter: &Document,
) -> Result<Vec<Document>, Error> {
    let match_doc = build_match(params, scope_filter)?;

    let mut results: Vec<Document> = vec![doc! { "$sort": sort_stage(params) }];
    let skip = (params.page - 1).max(0) * params.per_page.max(0);
    if skip > 0 {
        results.push(doc! { "$skip": skip });
    }
    if params.per_page > 0 {
        results.push(doc! { "$limit": params.per_page });
    }
    if !params.attributes.is_empty() {
        let mut project = doc! { FIELD_ID: 1 };
        for sel in &params.attributes {
            project.insert(format!("attributes.{}", attr_key(&sel.scope, &sel.attribute)), 1);
        }
        results.push(doc! { "$project": project });
    }

    Ok(vec![
        doc! { "$match": match_doc },
        doc! { "$facet": {
            "results": results,
            "totalCount": [ { "$count": "count" } ],
        } },
    ])
}

fn now_strings(now: DateTime<Utc>) -> (Bson, String) {
    (
        Bson::DateTime(mongodb::bson::DateTime::from_chrono(now)),
        now.to_rfc3339(),
    )
}

fn set_attribute_fields(set: &mut Document, attr: &DeviceAttribute) -> Result<(), Error> {
    let prefix = format!("attributes.{}", attr.key());
    set.insert(format!("{prefix}.name"), &attr.name);
    set.insert(format!("{prefix}.scope"), &attr.scope);
    set.insert(
        format!("{prefix}.value"),
        mongodb::bson::serialize_to_bson(&attr.value).map_err(|e| Error::Internal(e.into()))?,
    );
    if let Some(desc) = &attr.description {
        set.insert(format!("{prefix}.description"), desc);
    }
    Ok(())
}

fn set_timestamp_attr(target: &mut Document, name: &str, rfc3339: &str) {
    let prefix = format!("attributes.{}", attr_key(SCOPE_SYSTEM, name));
    target.insert(format!("{prefix}.name"), name);
    target.insert(format!("{prefix}.scope"), SCOPE_SYSTEM);
    target.insert(format!("{prefix}.value"), rfc3339);
}

fn base_upsert_parts(
    attrs: &[DeviceAttribute],
    now: DateTime<Utc>,
    new_etag: Option<&str>,
) -> Result<(Document, Document), Error> {
    let (now_bson, now_rfc) = now_strings(now);

    let mut set = Document::new();
    for attr in attrs {
        attr.validate()?;
        set_attribute_fields(&mut set, attr)?;
    }
    set.insert(FIELD_UPDATED, now_bson.clone());
    set_timestamp_attr(&mut set, ATTR_NAME_UPDATED, &now_rfc);
    if let Some(etag) = new_etag {
        set.insert(FIELD_TAGS_ETAG, etag);
    }

    let mut set_on_insert = doc! { FIELD_CREATED: now_bson };
    set_timestamp_attr(&mut set_on_insert, ATTR_NAME_CREATED, &now_rfc);

    Ok((set, set_on_insert))
}

/// Differential upsert: `$set` only the provided attributes, stamp the
/// update timestamps, create-once timestamps on insert, bump the revision.
pub fn upsert_update_doc(
    attrs: &[DeviceAttribute],
    now: DateTime<Utc>,
    new_etag: Option<&str>,
) -> Result<Document, Error> {
    let (set, set_on_insert) = base_upsert_parts(attrs, now, new_etag)?;
    Ok(doc! {
        "$set": set,
        "$setOnInsert": set_on_insert,
        "$inc": { FIELD_REVISION: 1 },
    })
}

/// Variant for revision-carrying agent reports: the revision is written
/// verbatim instead of incremented (the filter guards monotonicity).
pub fn upsert_with_revision_update_doc(
    attrs: &[DeviceAttribute],
    revision: u64,
    now: DateTime<Utc>,
) -> Result<Document, Error> {
    let (mut set, set_on_insert) = base_upsert_parts(attrs, now, None)?;
    set.insert(FIELD_REVISION, revision as i64);
    Ok(doc! {
        "$set": set,
        "$setOnInsert": set_on_insert,
    })
}

/// Filter for a revision-guarded write: apply only when the stored revision
/// does not exceed the incoming one (or no revision is stored yet).
pub fn revision_guard_filter(device_id: &str, revision: u64) -> Document {
    doc! {
        FIELD_ID: device_id,
        "$or": [
            { FIELD_REVISION: { "$lte": revision as i64 } },
            { FIELD_REVISION: { "$exists": false } },
        ],
    }
}

/// Upsert the provided attributes and delete every other attribute of the
/// same scope, in one document update.
pub fn replace_attributes_update_doc(
    attrs: &[DeviceAttribute],
    remove_keys: &[String],
    now: DateTime<Utc>,
    new_etag: Option<&str>,
) -> Result<Document, Error> {
    let (set, set_on_insert) = base_upsert_parts(attrs, now, new_etag)?;
    let mut update = doc! {
        "$set": set,
        "$setOnInsert": set_on_insert,
        "$inc": { FIELD_REVISION: 1 },
    };
    if !remove_keys.is_empty() {
        let mut unset = Document::new();
        for key in remove_keys {
            unset.insert(format!("attributes.{key}"), "");
        }
        update.insert("$unset", unset);
    }
    Ok(update)
}

pub fn set_group_update_doc(group: &str, now: DateTime<Utc>) -> Document {
    let (now_bson, now_rfc) = now_strings(now);
    let mut set = Document::new();
    set_timestamp_attr(&mut set, ATTR_NAME_UPDATED, &now_rfc);
    set.insert(FIELD_UPDATED, now_bson);
    let prefix = format!("attributes.{}", attr_key(SCOPE_SYSTEM, ATTR_NAME_GROUP));
    set.insert(format!("{prefix}.name"), ATTR_NAME_GROUP);
    set.insert(format!("{prefix}.scope"), SCOPE_SYSTEM);
    set.insert(format!("{prefix}.value"), group);
    doc! { "$set": set, "$inc": { FIELD_REVISION: 1 } }
}

pub fn unset_group_update_doc(now: DateTime<Utc>) -> Document {
    let (now_bson, now_rfc) = now_strings(now);
    let mut set = Document::new();
    set_timestamp_attr(&mut set, ATTR_NAME_UPDATED, &now_rfc);
    set.insert(FIELD_UPDATED, now_bson);
    doc! {
        "$set": set,
        "$unset": { format!("attributes.{}", attr_key(SCOPE_SYSTEM, ATTR_NAME_GROUP)): "" },
        "$inc": { FIELD_REVISION: 1 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::{AttributeValue, SCOPE_INVENTORY};
    use crate::models::search::{SelectAttribute, Sort};
    use serde_json::json;

    fn eq_filter(value: serde_json::Value) -> Filter {
        Filter {
            scope: "inventory".into(),
            attribute: "sn".into(),
            operator: FilterOp::Eq,
            value,
        }
    }

    #[test]
    fn plain_string_filter_compiles_to_single_condition() {
        let cond = filter_condition(&eq_filter(json!("aa:bb"))).unwrap();
        assert_eq!(
            cond,
            doc! { "attributes.inventory-sn.value": { "$eq": "aa:bb" } }
        );
    }

    #[test]
    fn numeric_looking_string_matches_both_forms() {
        let cond = filter_condition(&eq_filter(json!("42"))).unwrap();
        assert_eq!(
            cond,
            doc! { "$or": [
                { "attributes.inventory-sn.value": { "$eq": "42" } },
                { "attributes.inventory-sn.value": { "$eq": 42.0 } },
            ] }
        );
    }

    #[test]
    fn in_filter_extends_numeric_strings() {
        let f = Filter {
            scope: "inventory".into(),
            attribute: "sn".into(),
            operator: FilterOp::In,
            value: json!(["abc", "7"]),
        };
        let cond = filter_condition(&f).unwrap();
        assert_eq!(
            cond,
            doc! { "attributes.inventory-sn.value": { "$in": ["abc", "7", Bson::Double(7.0)] } }
        );
    }

    #[test]
    fn exists_and_regex_filters() {
        let f = Filter {
            scope: "system".into(),
            attribute: "group".into(),
            operator: FilterOp::Exists,
            value: json!(false),
        };
        assert_eq!(
            filter_condition(&f).unwrap(),
            doc! { "attributes.system-group.value": { "$exists": false } }
        );

        let f = Filter {
            scope: "identity".into(),
            attribute: "mac".into(),
            operator: FilterOp::Regex,
            value: json!("^aa:"),
        };
        assert_eq!(
            filter_condition(&f).unwrap(),
            doc! { "attributes.identity-mac.value": { "$regex": "^aa:" } }
        );
    }

    #[test]
    fn match_combines_with_and() {
        let params = SearchParams {
            filters: vec![eq_filter(json!("x"))],
            group: Some("g1".into()),
            device_ids: vec!["d1".into(), "d2".into()],
            text: Some("router".into()),
            ..Default::default()
        };
        let m = build_match(&params, &doc! { "tenant_id": "t1" }).unwrap();
        let and = m.get_array("$and").unwrap();
        assert_eq!(and.len(), 5);
        assert_eq!(
            and[1].as_document().unwrap(),
            &doc! { "$text": { "$search": "router" } }
        );
    }

    #[test]
    fn empty_search_matches_everything() {
        let m = build_match(&SearchParams::default(), &Document::new()).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn pipeline_shape_and_pagination_math() {
        let params = SearchParams {
            page: 2,
            per_page: 5,
            ..Default::default()
        };
        let pipeline = build_pipeline(&params, &Document::new()).unwrap();
        assert_eq!(pipeline.len(), 2);
        let facet = pipeline[1].get_document("$facet").unwrap();
        let results = facet.get_array("results").unwrap();
        assert_eq!(
            results[0].as_document().unwrap(),
            &doc! { "$sort": { "_id": 1 } }
        );
        assert_eq!(results[1].as_document().unwrap(), &doc! { "$skip": 5_i64 });
        assert_eq!(results[2].as_document().unwrap(), &doc! { "$limit": 5_i64 });
        let count = facet.get_array("totalCount").unwrap();
        assert_eq!(count[0].as_document().unwrap(), &doc! { "$count": "count" });
    }

    #[test]
    fn limit_zero_omits_limit_stage() {
        let params = SearchParams {
            page: 1,
            per_page: 0,
            ..Default::default()
        };
        let pipeline = build_pipeline(&params, &Document::new()).unwrap();
        let results = pipeline[1]
            .get_document("$facet")
            .unwrap()
            .get_array("results")
            .unwrap();
        assert_eq!(results.len(), 1); // sort only
    }

    #[test]
    fn sort_ties_break_on_id() {
        let params = SearchParams {
            sort: vec![Sort {
                scope: "inventory".into(),
                attribute: "sn".into(),
                order: SortOrder::Desc,
            }],
            ..Default::default()
        };
        let pipeline = build_pipeline(&params, &Document::new()).unwrap();
        let results = pipeline[1]
            .get_document("$facet")
            .unwrap()
            .get_array("results")
            .unwrap();
        assert_eq!(
            results[0].as_document().unwrap(),
            &doc! { "$sort": { "attributes.inventory-sn.value": -1, "_id": 1 } }
        );
    }

    #[test]
    fn projection_includes_selected_attributes_and_id() {
        let params = SearchParams {
            attributes: vec![SelectAttribute {
                scope: "identity".into(),
                attribute: "mac".into(),
            }],
            ..Default::default()
        };
        let pipeline = build_pipeline(&params, &Document::new()).unwrap();
        let results = pipeline[1]
            .get_document("$facet")
            .unwrap()
            .get_array("results")
            .unwrap();
        let project = results.last().unwrap().as_document().unwrap();
        assert_eq!(
            project,
            &doc! { "$project": { "_id": 1, "attributes.identity-mac": 1 } }
        );
    }

    fn some_attr() -> DeviceAttribute {
        DeviceAttribute::new(SCOPE_INVENTORY, "sn", AttributeValue::Str("1234".into()))
    }

    #[test]
    fn upsert_doc_is_differential() {
        let now = Utc::now();
        let update = upsert_update_doc(&[some_attr()], now, None).unwrap();
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("attributes.inventory-sn.name").unwrap(), "sn");
        assert_eq!(set.get_str("attributes.inventory-sn.scope").unwrap(), "inventory");
        assert_eq!(set.get_str("attributes.inventory-sn.value").unwrap(), "1234");
        assert!(set.contains_key("updated_ts"));
        assert!(set.contains_key("attributes.system-updated_ts.value"));
        let on_insert = update.get_document("$setOnInsert").unwrap();
        assert!(on_insert.contains_key("created_ts"));
        assert!(on_insert.contains_key("attributes.system-created_ts.value"));
        assert_eq!(update.get_document("$inc").unwrap(), &doc! { "revision": 1 });
    }

    #[test]
    fn upsert_doc_rejects_invalid_attribute() {
        let bad = DeviceAttribute::new(SCOPE_INVENTORY, "$where", AttributeValue::Num(1.0));
        assert!(upsert_update_doc(&[bad], Utc::now(), None).is_err());
    }

    #[test]
    fn revision_carrying_update_sets_revision_verbatim() {
        let update = upsert_with_revision_update_doc(&[some_attr()], 7, Utc::now()).unwrap();
        assert_eq!(
            update.get_document("$set").unwrap().get_i64("revision").unwrap(),
            7
        );
        assert!(!update.contains_key("$inc"));

        let filter = revision_guard_filter("d1", 7);
        assert_eq!(filter.get_str("_id").unwrap(), "d1");
        let or = filter.get_array("$or").unwrap();
        assert_eq!(
            or[0].as_document().unwrap(),
            &doc! { "revision": { "$lte": 7_i64 } }
        );
    }

    #[test]
    fn replace_doc_unsets_removed_keys() {
        let update = replace_attributes_update_doc(
            &[some_attr()],
            &["inventory-old".to_string()],
            Utc::now(),
            Some("etag-1"),
        )
        .unwrap();
        assert_eq!(
            update.get_document("$unset").unwrap(),
            &doc! { "attributes.inventory-old": "" }
        );
        assert_eq!(
            update.get_document("$set").unwrap().get_str("tags_etag").unwrap(),
            "etag-1"
        );
    }

    #[test]
    fn group_update_docs() {
        let now = Utc::now();
        let set = set_group_update_doc("g1", now);
        assert_eq!(
            set.get_document("$set")
                .unwrap()
                .get_str("attributes.system-group.value")
                .unwrap(),
            "g1"
        );
        let unset = unset_group_update_doc(now);
        assert!(
            unset
                .get_document("$unset")
                .unwrap()
                .contains_key("attributes.system-group")
        );
    }
}
