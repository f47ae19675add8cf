use courier_common::time::format_timespan_ms;
use serde_json::{Map, Number, Value};

use crate::item::Object;
use crate::sanitize::{Limit, sanitize_key, truncate};

/// Maximum nesting depth of free-form values.
///
/// Deeper values are replaced by [`DEPTH_EXCEEDED_MARKER`].
pub const MAX_DEPTH: usize = 32;

/// Replacement for values nested deeper than [`MAX_DEPTH`].
pub const DEPTH_EXCEEDED_MARKER: &str = "[depth limit exceeded]";

/// Default version of `baseData` payloads.
pub const BASE_DATA_VERSION: u64 = 2;

/// The known `baseData` contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// A named custom event.
    Event,
    /// A trace message.
    Message,
    /// Pre-aggregated metrics.
    Metric,
    /// An outgoing call to a dependency.
    RemoteDependency,
    /// An exception with its stack.
    Exception,
    /// A page view.
    PageView,
    /// Page load performance timings.
    PageViewPerformance,
}

/// Error returned when parsing an unknown [`BaseType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseBaseTypeError;

courier_common::derive_fromstr_and_display!(BaseType, ParseBaseTypeError, {
    BaseType::Event => "EventData",
    BaseType::Message => "MessageData",
    BaseType::Metric => "MetricData",
    BaseType::RemoteDependency => "RemoteDependencyData",
    BaseType::Exception => "ExceptionData",
    BaseType::PageView => "PageviewData",
    BaseType::PageViewPerformance => "PageviewPerformanceData",
});

impl BaseType {
    /// All known base types.
    pub const ALL: [BaseType; 7] = [
        BaseType::Event,
        BaseType::Message,
        BaseType::Metric,
        BaseType::RemoteDependency,
        BaseType::Exception,
        BaseType::PageView,
        BaseType::PageViewPerformance,
    ];

    /// Returns the type name used in envelope names.
    pub fn telemetry_type(self) -> &'static str {
        match self {
            BaseType::Event => "Event",
            BaseType::Message => "Message",
            BaseType::Metric => "Metric",
            BaseType::RemoteDependency => "RemoteDependency",
            BaseType::Exception => "Exception",
            BaseType::PageView => "Pageview",
            BaseType::PageViewPerformance => "PageviewPerformance",
        }
    }

    /// Returns the contract of this base type.
    pub fn contract(self) -> &'static Contract {
        match self {
            BaseType::Event => &EVENT_DATA,
            BaseType::Message => &MESSAGE_DATA,
            BaseType::Metric => &METRIC_DATA,
            BaseType::RemoteDependency => &REMOTE_DEPENDENCY_DATA,
            BaseType::Exception => &EXCEPTION_DATA,
            BaseType::PageView => &PAGEVIEW_DATA,
            BaseType::PageViewPerformance => &PAGEVIEW_PERFORMANCE_DATA,
        }
    }
}

/// The value kind of a contract field.
#[derive(Debug)]
pub enum FieldKind {
    /// A string truncated to the given limit. Primitives are converted to strings.
    String(Limit),
    /// A number. Numeric strings are parsed.
    Number,
    /// A boolean.
    Boolean,
    /// A duration, either a preformatted time span or a number of milliseconds.
    TimeSpan,
    /// A map with string values.
    StringMap,
    /// A map with numeric values.
    NumberMap,
    /// A nested object checked against a contract.
    Object(&'static Contract),
    /// An array of objects, each checked against a contract.
    Array(&'static Contract),
}

/// A field declared by a [`Contract`].
#[derive(Debug)]
pub struct Field {
    /// The JSON key.
    pub name: &'static str,
    /// The value kind.
    pub kind: FieldKind,
    /// Missing required fields are reported as violations.
    pub required: bool,
    /// Hidden fields are never emitted.
    pub hidden: bool,
}

impl Field {
    /// Declares an optional field.
    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            hidden: false,
        }
    }

    /// Declares a required field.
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            hidden: false,
        }
    }

    /// Marks the field as hidden.
    pub const fn hidden(self) -> Self {
        Self {
            hidden: true,
            ..self
        }
    }
}

/// The static shape of a `baseData` object or one of its nested objects.
#[derive(Debug)]
pub struct Contract {
    /// Name of the contract, used in diagnostics.
    pub name: &'static str,
    /// Declared fields in output order.
    pub fields: &'static [Field],
}

impl Contract {
    /// Returns the declared field with the given name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Event contract, also used for unknown base types.
pub static EVENT_DATA: Contract = Contract {
    name: "EventData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::required("name", FieldKind::String(Limit::Name)),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// Trace message contract.
pub static MESSAGE_DATA: Contract = Contract {
    name: "MessageData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::required("message", FieldKind::String(Limit::Message)),
        Field::optional("severityLevel", FieldKind::Number),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// A single metric data point.
pub static DATA_POINT: Contract = Contract {
    name: "DataPoint",
    fields: &[
        Field::optional("ns", FieldKind::String(Limit::Name)),
        Field::required("name", FieldKind::String(Limit::Name)),
        Field::optional("kind", FieldKind::Number),
        Field::required("value", FieldKind::Number),
        Field::optional("count", FieldKind::Number),
        Field::optional("min", FieldKind::Number),
        Field::optional("max", FieldKind::Number),
        Field::optional("stdDev", FieldKind::Number),
    ],
};

/// Metric contract.
pub static METRIC_DATA: Contract = Contract {
    name: "MetricData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::required("metrics", FieldKind::Array(&DATA_POINT)),
        Field::optional("properties", FieldKind::StringMap),
    ],
};

/// Dependency call contract.
pub static REMOTE_DEPENDENCY_DATA: Contract = Contract {
    name: "RemoteDependencyData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::required("name", FieldKind::String(Limit::Name)),
        Field::required("id", FieldKind::String(Limit::Id)),
        Field::optional("resultCode", FieldKind::String(Limit::Name)),
        Field::required("duration", FieldKind::TimeSpan),
        Field::optional("success", FieldKind::Boolean),
        Field::optional("data", FieldKind::String(Limit::Url)),
        Field::optional("target", FieldKind::String(Limit::String)),
        Field::optional("type", FieldKind::String(Limit::Name)),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// A single frame of a parsed stack.
pub static STACK_FRAME: Contract = Contract {
    name: "StackFrame",
    fields: &[
        Field::required("level", FieldKind::Number),
        Field::required("method", FieldKind::String(Limit::String)),
        Field::optional("assembly", FieldKind::String(Limit::String)),
        Field::optional("fileName", FieldKind::String(Limit::String)),
        Field::optional("line", FieldKind::Number),
    ],
};

/// Details of a single exception in a chain.
pub static EXCEPTION_DETAILS: Contract = Contract {
    name: "ExceptionDetails",
    fields: &[
        Field::optional("id", FieldKind::Number),
        Field::optional("outerId", FieldKind::Number),
        Field::required("typeName", FieldKind::String(Limit::String)),
        Field::required("message", FieldKind::String(Limit::Exception)),
        Field::optional("hasFullStack", FieldKind::Boolean),
        Field::optional("stack", FieldKind::String(Limit::Exception)),
        Field::optional("parsedStack", FieldKind::Array(&STACK_FRAME)),
    ],
};

/// Exception contract.
pub static EXCEPTION_DATA: Contract = Contract {
    name: "ExceptionData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::required("exceptions", FieldKind::Array(&EXCEPTION_DETAILS)),
        Field::optional("severityLevel", FieldKind::Number),
        Field::optional("problemId", FieldKind::String(Limit::String)),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// Page view contract.
pub static PAGEVIEW_DATA: Contract = Contract {
    name: "PageviewData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::optional("name", FieldKind::String(Limit::Name)),
        Field::optional("url", FieldKind::String(Limit::Url)),
        Field::optional("duration", FieldKind::TimeSpan),
        Field::optional("id", FieldKind::String(Limit::Id)),
        Field::optional("refUri", FieldKind::String(Limit::Url)),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// Page load performance contract.
pub static PAGEVIEW_PERFORMANCE_DATA: Contract = Contract {
    name: "PageviewPerformanceData",
    fields: &[
        Field::required("ver", FieldKind::Number),
        Field::optional("name", FieldKind::String(Limit::Name)),
        Field::optional("url", FieldKind::String(Limit::Url)),
        Field::optional("duration", FieldKind::TimeSpan),
        Field::optional("perfTotal", FieldKind::TimeSpan),
        Field::optional("networkConnect", FieldKind::TimeSpan),
        Field::optional("sentRequest", FieldKind::TimeSpan),
        Field::optional("receivedResponse", FieldKind::TimeSpan),
        Field::optional("domProcessing", FieldKind::TimeSpan),
        Field::optional("properties", FieldKind::StringMap),
        Field::optional("measurements", FieldKind::NumberMap),
    ],
};

/// A recoverable deviation from a contract.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// A required field is missing and omitted from the output.
    #[error("missing required field {field}")]
    MissingRequired {
        /// Path of the field.
        field: String,
    },
    /// A field has a value of the wrong kind and is omitted from the output.
    #[error("field {field} must be {expected}")]
    InvalidType {
        /// Path of the field.
        field: String,
        /// Description of the expected kind.
        expected: &'static str,
    },
    /// A string exceeded its limit and was truncated.
    #[error("field {field} was truncated from {original} to {max} characters")]
    Truncated {
        /// Path of the field.
        field: String,
        /// Limit class of the field.
        limit: Limit,
        /// Maximum number of characters.
        max: usize,
        /// Original number of characters.
        original: usize,
    },
    /// A property key exceeded the name limit and was truncated.
    #[error("property key {key:?} was truncated")]
    KeyTruncated {
        /// The sanitized key.
        key: String,
    },
    /// A value was nested too deeply and replaced.
    #[error("field {field} exceeds the maximum nesting depth")]
    DepthExceeded {
        /// Path of the field.
        field: String,
    },
    /// The base type is not known, the event contract is used instead.
    #[error("unknown base type {0:?}, using the event contract")]
    UnknownBaseType(String),
}

/// Checks JSON values against [contracts](Contract) and collects violations.
///
/// Checking never fails. Invalid or missing fields are omitted from the output and recorded as
/// [`ContractViolation`]s, oversized strings are truncated.
#[derive(Debug, Default)]
pub struct ContractChecker {
    violations: Vec<ContractViolation>,
}

impl ContractChecker {
    /// Creates a checker without violations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a violation detected outside of the checker.
    pub fn push(&mut self, violation: ContractViolation) {
        self.violations.push(violation);
    }

    /// Returns the violations recorded so far.
    pub fn violations(&self) -> &[ContractViolation] {
        &self.violations
    }

    /// Consumes the checker and returns all recorded violations.
    pub fn into_violations(self) -> Vec<ContractViolation> {
        self.violations
    }

    /// Checks `input` against `contract` and returns the sanitized object.
    pub fn check_object(&mut self, contract: &Contract, input: &Object, path: &str) -> Object {
        self.check_object_at(contract, input, path, 0)
    }

    fn check_object_at(
        &mut self,
        contract: &Contract,
        input: &Object,
        path: &str,
        depth: usize,
    ) -> Object {
        let mut output = Map::new();

        if depth >= MAX_DEPTH {
            self.push(ContractViolation::DepthExceeded {
                field: path.to_owned(),
            });
            return output;
        }

        for field in contract.fields {
            let field_path = format!("{path}.{}", field.name);

            let value = match input.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        self.push(ContractViolation::MissingRequired { field: field_path });
                    }
                    continue;
                }
                Some(value) => value,
            };

            if field.hidden {
                continue;
            }

            if let Some(value) = self.check_field(&field.kind, value, &field_path, depth) {
                output.insert(field.name.to_owned(), value);
            }
        }

        output
    }

    fn check_field(
        &mut self,
        kind: &FieldKind,
        value: &Value,
        path: &str,
        depth: usize,
    ) -> Option<Value> {
        match *kind {
            FieldKind::String(limit) => {
                let string = self.stringify(value, path, depth);
                Some(Value::String(self.truncate(&string, limit, path)))
            }
            FieldKind::Number => match coerce_number(value) {
                Some(number) => Some(Value::Number(number)),
                None => self.invalid(path, "a number"),
            },
            FieldKind::Boolean => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
                _ => self.invalid(path, "a boolean"),
            },
            FieldKind::TimeSpan => match value {
                Value::Number(n) => Some(Value::String(format_timespan_ms(
                    n.as_f64().unwrap_or_default(),
                ))),
                Value::String(s) => Some(Value::String(self.truncate(s, Limit::String, path))),
                _ => self.invalid(path, "a time span"),
            },
            FieldKind::StringMap => match value {
                Value::Object(map) => Some(Value::Object(self.string_map(map, path, depth))),
                _ => self.invalid(path, "an object"),
            },
            FieldKind::NumberMap => match value {
                Value::Object(map) => Some(Value::Object(self.number_map(map))),
                _ => self.invalid(path, "an object"),
            },
            FieldKind::Object(contract) => match value {
                Value::Object(map) => Some(Value::Object(
                    self.check_object_at(contract, map, path, depth + 1),
                )),
                _ => self.invalid(path, "an object"),
            },
            FieldKind::Array(contract) => match value {
                Value::Array(items) => {
                    let mut output = Vec::with_capacity(items.len());
                    for (index, item) in items.iter().enumerate() {
                        let item_path = format!("{path}[{index}]");
                        match item {
                            Value::Object(map) => output.push(Value::Object(
                                self.check_object_at(contract, map, &item_path, depth + 1),
                            )),
                            _ => {
                                self.invalid(&item_path, "an object");
                            }
                        }
                    }
                    Some(Value::Array(output))
                }
                _ => self.invalid(path, "an array"),
            },
        }
    }

    /// Converts a map to string values with sanitized, unique keys.
    pub fn string_map(&mut self, map: &Object, path: &str, depth: usize) -> Object {
        let mut output = Map::new();

        for (key, value) in map {
            let (key, truncated) = sanitize_key(key, |k| output.contains_key(k));
            if truncated {
                self.push(ContractViolation::KeyTruncated { key: key.clone() });
            }

            let value_path = format!("{path}.{key}");
            let string = self.stringify(value, &value_path, depth + 1);
            let string = self.truncate(&string, Limit::PropertyValue, &value_path);
            output.insert(key, Value::String(string));
        }

        output
    }

    /// Converts a map to numeric values with sanitized, unique keys.
    ///
    /// Values that cannot be interpreted as numbers become the token `"NaN"`.
    pub fn number_map(&mut self, map: &Object) -> Object {
        let mut output = Map::new();

        for (key, value) in map {
            let (key, truncated) = sanitize_key(key, |k| output.contains_key(k));
            if truncated {
                self.push(ContractViolation::KeyTruncated { key: key.clone() });
            }

            let value = match coerce_number(value) {
                Some(number) => Value::Number(number),
                None => Value::String("NaN".to_owned()),
            };
            output.insert(key, value);
        }

        output
    }

    /// Converts any value to a string.
    ///
    /// `null` becomes the token `"null"`, objects and arrays their JSON text.
    pub fn stringify(&mut self, value: &Value, path: &str, depth: usize) -> String {
        match value {
            Value::Null => "null".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                let bounded = self.bounded(value, path, depth);
                serde_json::to_string(&bounded).unwrap_or_default()
            }
        }
    }

    /// Clones a free-form value, replacing anything nested deeper than [`MAX_DEPTH`].
    pub fn bounded(&mut self, value: &Value, path: &str, depth: usize) -> Value {
        match value {
            Value::Array(_) | Value::Object(_) if depth >= MAX_DEPTH => {
                self.push(ContractViolation::DepthExceeded {
                    field: path.to_owned(),
                });
                Value::String(DEPTH_EXCEEDED_MARKER.to_owned())
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.bounded(item, &format!("{path}[{i}]"), depth + 1))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.bounded(v, &format!("{path}.{k}"), depth + 1)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn truncate(&mut self, value: &str, limit: Limit, path: &str) -> String {
        let truncated = truncate(value, limit);
        if truncated.len() != value.len() {
            self.push(ContractViolation::Truncated {
                field: path.to_owned(),
                limit,
                max: limit.max_chars(),
                original: value.chars().count(),
            });
        }
        truncated.into_owned()
    }

    fn invalid(&mut self, path: &str, expected: &'static str) -> Option<Value> {
        self.push(ContractViolation::InvalidType {
            field: path.to_owned(),
            expected,
        });
        None
    }
}

/// Interprets a value as a finite number.
fn coerce_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => {
            let parsed = s.trim().parse::<f64>().ok()?;
            if parsed.fract() == 0.0 && parsed.abs() < i64::MAX as f64 {
                Some(Number::from(parsed as i64))
            } else {
                Number::from_f64(parsed)
            }
        }
        _ => None,
    }
}
