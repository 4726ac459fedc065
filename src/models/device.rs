use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Error;

pub const SCOPE_INVENTORY: &str = "inventory";
pub const SCOPE_IDENTITY: &str = "identity";
pub const SCOPE_SYSTEM: &str = "system";
pub const SCOPE_TAGS: &str = "tags";
pub const SCOPE_MONITOR: &str = "monitor";

pub const ATTR_NAME_GROUP: &str = "group";
pub const ATTR_NAME_CREATED: &str = "created_ts";
pub const ATTR_NAME_UPDATED: &str = "updated_ts";
pub const ATTR_NAME_STATUS: &str = "status";

/// Upper bound for device ids, attribute names and group names.
pub const MAX_NAME_LENGTH: usize = 1024;

/// Attribute map key: `<scope>-<name>`. This is also the on-disk key under
/// `attributes`, which is what makes per-attribute indexes possible.
pub fn attr_key(scope: &str, name: &str) -> String {
    format!("{scope}-{name}")
}

/// An attribute value: a string, a 64-bit float, or a homogeneous array of
/// either. Mixed-type arrays are rejected at the serde boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Str(String),
    Num(f64),
    StrList(Vec<String>),
    NumList(Vec<f64>),
}

impl AttributeValue {
    /// Append every textual form of this value to `out`, space separated.
    pub fn append_text(&self, out: &mut String) {
        let mut push = |piece: &str| {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(piece);
        };
        match self {
            AttributeValue::Str(s) => push(s),
            AttributeValue::Num(n) => push(&n.to_string()),
            AttributeValue::StrList(items) => {
                for s in items {
                    push(s);
                }
            }
            AttributeValue::NumList(items) => {
                for n in items {
                    push(&n.to_string());
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Num(f64),
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = AttributeValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, a number, or a homogeneous array of strings or numbers")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(AttributeValue::Str(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(AttributeValue::Str(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(AttributeValue::Num(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(AttributeValue::Num(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(AttributeValue::Num(v as f64))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut strings: Vec<String> = Vec::new();
                let mut numbers: Vec<f64> = Vec::new();
                while let Some(item) = seq.next_element::<Scalar>()? {
                    match item {
                        Scalar::Str(s) if numbers.is_empty() => strings.push(s),
                        Scalar::Num(n) if strings.is_empty() => numbers.push(n),
                        _ => {
                            return Err(de::Error::custom(
                                "array values must be all strings or all numbers",
                            ));
                        }
                    }
                }
                if numbers.is_empty() {
                    // covers the empty array as well
                    Ok(AttributeValue::StrList(strings))
                } else {
                    Ok(AttributeValue::NumList(numbers))
                }
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A single scoped attribute. `(scope, name)` is the key within a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttribute {
    pub name: String,
    pub scope: String,
    pub value: AttributeValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DeviceAttribute {
    pub fn new(scope: impl Into<String>, name: impl Into<String>, value: AttributeValue) -> Self {
        DeviceAttribute {
            name: name.into(),
            scope: scope.into(),
            value,
            description: None,
        }
    }

    pub fn key(&self) -> String {
        attr_key(&self.scope, &self.name)
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_attr_name(&self.name)?;
        if self.scope.is_empty() || self.scope.len() > MAX_NAME_LENGTH {
            return Err(Error::validation("attribute scope must be 1..1024 characters"));
        }
        Ok(())
    }
}

pub fn validate_attr_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::NoAttrName);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::validation("attribute name must be 1..1024 characters"));
    }
    if name.starts_with('$') || name.contains('.') {
        return Err(Error::validation(
            "attribute name cannot start with '$' or contain '.'",
        ));
    }
    Ok(())
}

pub fn validate_device_id(id: &str) -> Result<(), Error> {
    if id.is_empty() || id.len() > MAX_NAME_LENGTH {
        return Err(Error::validation("device id must be 1..1024 characters"));
    }
    Ok(())
}

pub fn validate_group_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(Error::validation("group name must be 1..1024 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(
            "group name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// A device document as seen by callers. The JSON form carries attributes as
/// an array; internally they are keyed by `<scope>-<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DeviceJson", into = "DeviceJson")]
pub struct Device {
    pub id: String,
    pub attributes: BTreeMap<String, DeviceAttribute>,
    pub revision: u64,
    pub created_ts: Option<DateTime<Utc>>,
    pub updated_ts: Option<DateTime<Utc>>,
    /// Synthesized search text; not part of the JSON representation.
    pub text: Option<String>,
    /// ETag stamped on the last write to the `tags` scope.
    pub tags_etag: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Device {
            id: id.into(),
            attributes: BTreeMap::new(),
            revision: 0,
            created_ts: None,
            updated_ts: None,
            text: None,
            tags_etag: None,
        }
    }

    pub fn with_attributes(id: impl Into<String>, attrs: Vec<DeviceAttribute>) -> Result<Self, Error> {
        let mut dev = Device::new(id);
        for attr in attrs {
            dev.insert_attribute(attr)?;
        }
        Ok(dev)
    }

    pub fn insert_attribute(&mut self, attr: DeviceAttribute) -> Result<(), Error> {
        attr.validate()?;
        let key = attr.key();
        if self.attributes.insert(key.clone(), attr).is_some() {
            return Err(Error::validation(format!("duplicate attribute {key}")));
        }
        Ok(())
    }

    pub fn group(&self) -> Option<&str> {
        match self.attributes.get(&attr_key(SCOPE_SYSTEM, ATTR_NAME_GROUP)) {
            Some(DeviceAttribute {
                value: AttributeValue::Str(g),
                ..
            }) => Some(g.as_str()),
            _ => None,
        }
    }

    /// Count attributes in the given scope.
    pub fn scope_len(&self, scope: &str) -> usize {
        self.attributes.values().filter(|a| a.scope == scope).count()
    }

    /// The whitespace-joined projection of all attribute values, used for
    /// substring/text search. Attributes walk in key order so the result is
    /// deterministic; `monitor` values are volatile and excluded.
    pub fn synthesize_text(&self) -> String {
        let mut out = String::new();
        for attr in self.attributes.values() {
            if attr.scope == SCOPE_MONITOR {
                continue;
            }
            attr.value.append_text(&mut out);
        }
        out
    }
}

#[derive(Serialize, Deserialize)]
struct DeviceJson {
    id: String,
    #[serde(default)]
    attributes: Vec<DeviceAttribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_ts: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceJson> for Device {
    type Error = Error;

    fn try_from(json: DeviceJson) -> Result<Self, Error> {
        validate_device_id(&json.id)?;
        let mut dev = Device::with_attributes(json.id, json.attributes)?;
        dev.created_ts = json.created_ts;
        dev.updated_ts = json.updated_ts;
        Ok(dev)
    }
}

impl From<Device> for DeviceJson {
    fn from(dev: Device) -> Self {
        DeviceJson {
            id: dev.id,
            attributes: dev.attributes.into_values().collect(),
            created_ts: dev.created_ts,
            updated_ts: dev.updated_ts,
        }
    }
}

/// One entry of a revision-guarded batch update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub id: String,
    #[serde(default)]
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(json: &str) -> Result<AttributeValue, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn attribute_value_accepts_scalars() {
        assert_eq!(value(r#""aa:bb""#).unwrap(), AttributeValue::Str("aa:bb".into()));
        assert_eq!(value("4.5").unwrap(), AttributeValue::Num(4.5));
        assert_eq!(value("7").unwrap(), AttributeValue::Num(7.0));
    }

    #[test]
    fn attribute_value_accepts_homogeneous_arrays() {
        assert_eq!(
            value(r#"["a","b"]"#).unwrap(),
            AttributeValue::StrList(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            value("[1, 2.5]").unwrap(),
            AttributeValue::NumList(vec![1.0, 2.5])
        );
        assert_eq!(value("[]").unwrap(), AttributeValue::StrList(vec![]));
    }

    #[test]
    fn attribute_value_rejects_mixed_and_foreign_types() {
        assert!(value(r#"["a", 1]"#).is_err());
        assert!(value(r#"[1, "a"]"#).is_err());
        assert!(value("true").is_err());
        assert!(value("null").is_err());
        assert!(value(r#"{"x": 1}"#).is_err());
    }

    #[test]
    fn attr_name_rules() {
        assert!(validate_attr_name("mac").is_ok());
        assert!(matches!(validate_attr_name(""), Err(Error::NoAttrName)));
        assert!(validate_attr_name("$where").is_err());
        assert!(validate_attr_name("a.b").is_err());
        assert!(validate_attr_name(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn group_name_rules() {
        assert!(validate_group_name("prod_eu-1").is_ok());
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name("no spaces").is_err());
        assert!(validate_group_name("dot.dot").is_err());
    }

    #[test]
    fn device_json_roundtrip() {
        let json = r#"{
            "id": "d1",
            "attributes": [
                {"name": "mac", "scope": "inventory", "value": "aa:bb"},
                {"name": "group", "scope": "system", "value": "g1"}
            ]
        }"#;
        let dev: Device = serde_json::from_str(json).unwrap();
        assert_eq!(dev.id, "d1");
        assert_eq!(dev.attributes.len(), 2);
        assert_eq!(dev.group(), Some("g1"));

        let back = serde_json::to_value(&dev).unwrap();
        let attrs = back["attributes"].as_array().unwrap();
        assert_eq!(attrs.len(), 2);
        assert!(back.get("text").is_none());
    }

    #[test]
    fn device_rejects_duplicate_scoped_attribute() {
        let json = r#"{
            "id": "d1",
            "attributes": [
                {"name": "mac", "scope": "inventory", "value": "aa"},
                {"name": "mac", "scope": "inventory", "value": "bb"}
            ]
        }"#;
        assert!(serde_json::from_str::<Device>(json).is_err());
    }

    #[test]
    fn same_name_different_scope_is_distinct() {
        let dev = Device::with_attributes(
            "d1",
            vec![
                DeviceAttribute::new(SCOPE_INVENTORY, "status", AttributeValue::Str("ok".into())),
                DeviceAttribute::new(SCOPE_IDENTITY, "status", AttributeValue::Str("accepted".into())),
            ],
        )
        .unwrap();
        assert_eq!(dev.attributes.len(), 2);
        assert_eq!(dev.scope_len(SCOPE_IDENTITY), 1);
    }

    #[test]
    fn text_synthesis_is_pinned() {
        let dev = Device::with_attributes(
            "d1",
            vec![
                DeviceAttribute::new(SCOPE_INVENTORY, "mac", AttributeValue::Str("aa:bb".into())),
                DeviceAttribute::new(SCOPE_INVENTORY, "cpus", AttributeValue::Num(8.0)),
                DeviceAttribute::new(
                    SCOPE_INVENTORY,
                    "ips",
                    AttributeValue::StrList(vec!["10.0.0.1".into(), "10.0.0.2".into()]),
                ),
                DeviceAttribute::new(SCOPE_MONITOR, "alerts", AttributeValue::Num(3.0)),
            ],
        )
        .unwrap();
        // key order: inventory-cpus, inventory-ips, inventory-mac; monitor excluded
        assert_eq!(dev.synthesize_text(), "8 10.0.0.1 10.0.0.2 aa:bb");
    }
}
