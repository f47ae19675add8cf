use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::BaseType;

/// Free-form JSON object used for `baseData`, `data` and tag maps.
pub type Object = Map<String, Value>;

/// Severity of a trace message, as understood by the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeverityLevel {
    /// Verbose diagnostics.
    Verbose = 0,
    /// Informational messages.
    Information = 1,
    /// Undesirable but recoverable conditions.
    Warning = 2,
    /// Failures of an operation.
    Error = 3,
    /// Failures of the application.
    Critical = 4,
}

/// A telemetry item produced by callers.
///
/// The item is mutable while it travels through the plugin chain. Plugins may amend the
/// context in [`ext`](Self::ext) and [`tags`](Self::tags), or stop processing altogether.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryItem {
    /// Name of the item, used as a fallback for a missing `baseData.name`.
    pub name: String,

    /// Time the item was created. Defaults to the time it is tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// The routing key. Defaults to the configured instrumentation key.
    #[serde(rename = "iKey", skip_serializing_if = "Option::is_none")]
    pub ikey: Option<String>,

    /// Ordered list of tag maps. Later maps override earlier ones.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Object>,

    /// Structured context.
    pub ext: Extensions,

    /// The name of the `baseData` contract, for example `EventData`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,

    /// The payload checked against the contract of [`base_type`](Self::base_type).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_data: Option<Object>,

    /// Custom properties merged into `baseData.properties` and `baseData.measurements`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Object>,
}

impl TelemetryItem {
    /// Creates an item with the given base type and data.
    pub fn new(base_type: BaseType, base_data: Object) -> Self {
        Self {
            base_type: Some(base_type.to_string()),
            base_data: Some(base_data),
            ..Self::default()
        }
    }

    /// Creates a custom event.
    pub fn event(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut base_data = Object::new();
        base_data.insert("name".to_owned(), Value::String(name.clone()));

        Self {
            name,
            ..Self::new(BaseType::Event, base_data)
        }
    }

    /// Creates a trace message.
    pub fn trace(message: impl Into<String>, severity: SeverityLevel) -> Self {
        let mut base_data = Object::new();
        base_data.insert("message".to_owned(), Value::String(message.into()));
        base_data.insert("severityLevel".to_owned(), Value::from(severity as u8));
        Self::new(BaseType::Message, base_data)
    }

    /// Creates a metric with a single measurement.
    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        let mut point = Object::new();
        point.insert("name".to_owned(), Value::String(name.into()));
        point.insert("value".to_owned(), Value::from(value));
        point.insert("count".to_owned(), Value::from(1));

        let mut base_data = Object::new();
        base_data.insert("metrics".to_owned(), Value::Array(vec![Value::Object(point)]));
        Self::new(BaseType::Metric, base_data)
    }

    /// Returns `true` if the item carries nothing that could be sent.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.base_type.is_none()
            && self.base_data.as_ref().is_none_or(Map::is_empty)
            && self.data.as_ref().is_none_or(Map::is_empty)
    }

    /// Returns the parsed base type, if it is known.
    pub fn known_base_type(&self) -> Option<BaseType> {
        self.base_type.as_deref()?.parse().ok()
    }

    /// Returns `true` if this is a metric item.
    pub fn is_metric(&self) -> bool {
        self.known_base_type() == Some(BaseType::Metric)
    }

    /// Looks up a tag value, later tag maps taking precedence.
    pub fn tag(&self, key: &str) -> Option<&Value> {
        self.tags.iter().rev().find_map(|tags| tags.get(key))
    }

    /// Appends a single tag in a new tag map.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let mut tags = Object::new();
        tags.insert(key.into(), value.into());
        self.tags.push(tags);
    }
}

/// Structured context of a [`TelemetryItem`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extensions {
    /// The user the item belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserExt>,
    /// The device the item was recorded on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceExt>,
    /// Application session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppExt>,
    /// The distributed trace, also known as operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceExt>,
    /// The cloud role of the producing process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudExt>,
    /// The SDK that produced the item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkExt>,
    /// Additional extensions not known to the pipeline, kept as they are.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// User context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct UserExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Device context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct DeviceExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Application context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppExt {
    /// The session identifier.
    #[serde(rename = "sesId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Trace context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceExt {
    /// The trace or operation identifier.
    #[serde(rename = "traceID", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// The identifier of the parent operation.
    #[serde(rename = "parentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The operation name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Cloud context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct CloudExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_instance: Option<String>,
}

/// SDK context.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkExt {
    /// The SDK version string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_deserialize_item() {
        let item: TelemetryItem = serde_json::from_value(json!({
            "name": "checkout",
            "iKey": "key",
            "tags": [{"a": "1"}, {"a": "2"}],
            "ext": {
                "user": {"id": "u1", "authId": "auth"},
                "trace": {"traceID": "t1"},
                "custom": {"x": 1}
            },
            "baseType": "EventData",
            "baseData": {"name": "checkout"}
        }))
        .unwrap();

        assert_eq!(item.ikey.as_deref(), Some("key"));
        assert_eq!(item.tag("a"), Some(&json!("2")));
        assert_eq!(item.ext.user.as_ref().unwrap().auth_id.as_deref(), Some("auth"));
        assert_eq!(item.ext.trace.as_ref().unwrap().trace_id.as_deref(), Some("t1"));
        assert_eq!(item.ext.other.get("custom"), Some(&json!({"x": 1})));
        assert_eq!(item.known_base_type(), Some(BaseType::Event));
    }

    #[test]
    fn test_is_empty() {
        assert!(TelemetryItem::default().is_empty());
        assert!(!TelemetryItem::event("x").is_empty());

        let item = TelemetryItem {
            data: Some(Object::new()),
            ..Default::default()
        };
        assert!(item.is_empty());
    }

    #[test]
    fn test_metric_constructor() {
        let item = TelemetryItem::metric("queue_length", 4.0);
        assert!(item.is_metric());
        assert_eq!(
            item.base_data.unwrap()["metrics"][0],
            json!({"name": "queue_length", "value": 4.0, "count": 1})
        );
    }
}
