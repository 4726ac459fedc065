use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::device::{Device, validate_attr_name};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 500;

/// A filter predicate against one scoped attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub scope: String,
    pub attribute: String,
    #[serde(rename = "type")]
    pub operator: FilterOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$ne")]
    Ne,
    #[serde(rename = "$in")]
    In,
    #[serde(rename = "$nin")]
    Nin,
    #[serde(rename = "$exists")]
    Exists,
    #[serde(rename = "$regex")]
    Regex,
}

impl FilterOp {
    pub fn as_mongo(self) -> &'static str {
        match self {
            FilterOp::Eq => "$eq",
            FilterOp::Gt => "$gt",
            FilterOp::Gte => "$gte",
            FilterOp::Lt => "$lt",
            FilterOp::Lte => "$lte",
            FilterOp::Ne => "$ne",
            FilterOp::In => "$in",
            FilterOp::Nin => "$nin",
            FilterOp::Exists => "$exists",
            FilterOp::Regex => "$regex",
        }
    }

    /// Operator name as it appears in `GET /devices` query values, e.g.
    /// `inventory/sn=eq:1234`.
    pub fn from_query_op(op: &str) -> Option<FilterOp> {
        Some(match op {
            "eq" => FilterOp::Eq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "ne" => FilterOp::Ne,
            "exists" => FilterOp::Exists,
            "regex" => FilterOp::Regex,
            _ => return None,
        })
    }
}

impl Filter {
    pub fn validate(&self) -> Result<(), Error> {
        validate_attr_name(&self.attribute)?;
        if self.scope.is_empty() {
            return Err(Error::validation("filter scope cannot be empty"));
        }
        use serde_json::Value;
        let scalar = |v: &Value| matches!(v, Value::String(_) | Value::Number(_));
        match self.operator {
            FilterOp::Eq | FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte
            | FilterOp::Ne => {
                if !scalar(&self.value) {
                    return Err(Error::validation(format!(
                        "filter {} requires a string or number value",
                        self.operator.as_mongo()
                    )));
                }
            }
            FilterOp::In | FilterOp::Nin => match &self.value {
                Value::Array(items) if items.iter().all(scalar) => {}
                _ => {
                    return Err(Error::validation(format!(
                        "filter {} requires an array of strings or numbers",
                        self.operator.as_mongo()
                    )));
                }
            },
            FilterOp::Exists => {
                if !self.value.is_boolean() {
                    return Err(Error::validation("filter $exists requires a boolean value"));
                }
            }
            FilterOp::Regex => {
                let Value::String(pattern) = &self.value else {
                    return Err(Error::validation("filter $regex requires a string value"));
                };
                regex::Regex::new(pattern)
                    .map_err(|e| Error::validation(format!("invalid $regex pattern: {e}")))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[serde(rename = "asc")]
    Asc,
    #[serde(rename = "desc")]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sort {
    pub scope: String,
    pub attribute: String,
    pub order: SortOrder,
}

/// Projection entry: include only this scoped attribute in results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectAttribute {
    pub scope: String,
    pub attribute: String,
}

/// Parameters of a device search: filter, sort, paginate, project — compiled
/// by the store into a single round trip.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default)]
    pub attributes: Vec<SelectAttribute>,
    #[serde(default)]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(skip)]
    pub group: Option<String>,
    #[serde(skip)]
    pub has_group: Option<bool>,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_per_page() -> i64 {
    DEFAULT_PER_PAGE
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PER_PAGE,
            filters: Vec::new(),
            sort: Vec::new(),
            attributes: Vec::new(),
            device_ids: Vec::new(),
            text: None,
            group: None,
            has_group: None,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.page < 1 {
            return Err(Error::validation("page must be at least 1"));
        }
        if self.per_page < 1 || self.per_page > MAX_PER_PAGE {
            return Err(Error::validation(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}"
            )));
        }
        for f in &self.filters {
            f.validate()?;
        }
        for s in &self.sort {
            validate_attr_name(&s.attribute)?;
        }
        Ok(())
    }
}

/// One discovered filterable attribute with its usage count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterAttribute {
    pub name: String,
    pub scope: String,
    pub count: i64,
}

/// Counts reported by a bulk mutation, plus the device snapshots a follow-up
/// reindex needs. Snapshots never serialize to callers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub updated: u64,
    pub created: u64,
    pub deleted: u64,
    #[serde(skip)]
    pub devices: Vec<Device>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(op: FilterOp, value: serde_json::Value) -> Filter {
        Filter {
            scope: "inventory".into(),
            attribute: "sn".into(),
            operator: op,
            value,
        }
    }

    #[test]
    fn filter_ops_deserialize_with_dollar_names() {
        let f: Filter = serde_json::from_value(json!({
            "scope": "inventory",
            "attribute": "sn",
            "type": "$in",
            "value": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(f.operator, FilterOp::In);
        assert!(f.validate().is_ok());
    }

    #[test]
    fn filter_value_types_are_checked() {
        assert!(filter(FilterOp::Eq, json!("val")).validate().is_ok());
        assert!(filter(FilterOp::Gt, json!(5)).validate().is_ok());
        assert!(filter(FilterOp::Eq, json!(["val"])).validate().is_err());
        assert!(filter(FilterOp::In, json!("val")).validate().is_err());
        assert!(filter(FilterOp::In, json!([true])).validate().is_err());
        assert!(filter(FilterOp::Exists, json!(true)).validate().is_ok());
        assert!(filter(FilterOp::Exists, json!("true")).validate().is_err());
        assert!(filter(FilterOp::Regex, json!("^ac-[0-9]+$")).validate().is_ok());
        assert!(filter(FilterOp::Regex, json!("([")).validate().is_err());
    }

    #[test]
    fn search_params_defaults_and_bounds() {
        let p: SearchParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(p.page, 1);
        assert_eq!(p.per_page, 20);
        assert!(p.validate().is_ok());

        let p: SearchParams = serde_json::from_value(json!({"page": 0})).unwrap();
        assert!(p.validate().is_err());
        let p: SearchParams = serde_json::from_value(json!({"per_page": 501})).unwrap();
        assert!(p.validate().is_err());
    }

    #[test]
    fn update_result_serializes_counts_only() {
        let res = UpdateResult {
            matched: 2,
            updated: 2,
            ..Default::default()
        };
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v["matched"], 2);
        assert_eq!(v["updated"], 2);
        assert!(v.get("devices").is_none());
    }
}
