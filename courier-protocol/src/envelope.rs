use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use courier_common::time::format_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{BASE_DATA_VERSION, BaseType, ContractChecker, ContractViolation};
use crate::item::{Object, TelemetryItem};
use crate::tags::extension_tags;

/// Version of the envelope format.
pub const ENVELOPE_VERSION: u32 = 1;

/// Prefix of envelope names.
const ENVELOPE_NAME_PREFIX: &str = "Telemetry";

/// The sampling percentage an envelope was kept with.
///
/// Valid rates are in `(0, 100]`. A rate of 100 means the item was not sampled and is omitted
/// from the wire.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleRate(f64);

impl SampleRate {
    /// Keep everything.
    pub const FULL: SampleRate = SampleRate(100.0);

    /// Creates a sample rate, returning `None` if the percentage is outside `(0, 100]`.
    pub fn new(percentage: f64) -> Option<Self> {
        (percentage > 0.0 && percentage <= 100.0).then_some(Self(percentage))
    }

    /// Returns the percentage.
    pub fn percentage(self) -> f64 {
        self.0
    }

    /// Returns `true` if nothing is sampled out at this rate.
    pub fn is_full(&self) -> bool {
        self.0 >= 100.0
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::FULL
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The typed payload of an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    /// Name of the contract `base_data` was checked against.
    pub base_type: String,
    /// The contract-checked payload.
    pub base_data: Object,
}

/// The contract-checked wire form of a telemetry item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version.
    pub ver: u32,
    /// `Telemetry.<iKey without dashes>.<TypeName>`.
    pub name: String,
    /// RFC 3339 timestamp with milliseconds.
    pub time: String,
    /// The routing key.
    #[serde(rename = "iKey")]
    pub ikey: String,
    /// The sampling percentage, hidden on the wire when nothing was sampled out.
    #[serde(
        rename = "sampleRate",
        default,
        skip_serializing_if = "SampleRate::is_full"
    )]
    pub sample_rate: SampleRate,
    /// Flat context tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// The typed payload.
    pub data: EnvelopeData,
}

/// Inputs for building an [`Envelope`] that do not come from the item.
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeContext<'a> {
    /// Routing key used if the item does not carry one.
    pub default_ikey: &'a str,
    /// The sampling percentage the item was kept with.
    pub sample_rate: SampleRate,
}

/// Contract violations detected while building an [`Envelope`].
///
/// The error owns the envelope built despite the violations, so the caller can decide to
/// proceed with it.
#[derive(Debug, thiserror::Error)]
#[error("envelope has {count} contract violations", count = .violations.len())]
pub struct ContractViolations {
    envelope: Box<Envelope>,
    violations: Vec<ContractViolation>,
}

impl ContractViolations {
    /// Returns the recorded violations.
    pub fn violations(&self) -> &[ContractViolation] {
        &self.violations
    }

    /// Returns the partially built envelope.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Consumes the error and returns the partially built envelope.
    pub fn into_envelope(self) -> Envelope {
        *self.envelope
    }

    /// Consumes the error and returns the envelope with its violations.
    pub fn into_parts(self) -> (Envelope, Vec<ContractViolation>) {
        (*self.envelope, self.violations)
    }
}

impl Envelope {
    /// Builds an envelope from a telemetry item.
    ///
    /// The item's `baseData` is checked against the contract of its base type, custom `data` is
    /// merged into properties and measurements, and the item context is mapped onto tags. Tags
    /// from `item.tags` are applied after the context, in list order.
    ///
    /// Returns [`ContractViolations`] if the item deviates from its contract. The envelope is
    /// still built in that case, with invalid fields omitted and oversized values truncated.
    pub fn from_item(
        item: &TelemetryItem,
        context: &EnvelopeContext<'_>,
    ) -> Result<Envelope, ContractViolations> {
        let mut checker = ContractChecker::new();

        let base_type = match item.base_type.as_deref() {
            None => BaseType::Event,
            Some(name) => name.parse().unwrap_or_else(|_| {
                checker.push(ContractViolation::UnknownBaseType(name.to_owned()));
                BaseType::Event
            }),
        };
        let contract = base_type.contract();

        let mut base_data = item.base_data.clone().unwrap_or_default();
        base_data
            .entry("ver")
            .or_insert_with(|| Value::from(BASE_DATA_VERSION));

        if contract.field("name").is_some() && !item.name.is_empty() {
            base_data
                .entry("name")
                .or_insert_with(|| Value::String(item.name.clone()));
        }

        if let Some(ref data) = item.data {
            merge_custom_data(&mut checker, &mut base_data, data);
        }

        let base_data = checker.check_object(contract, &base_data, "baseData");

        let mut tags = BTreeMap::new();
        extension_tags(&item.ext, &mut tags);
        for (index, map) in item.tags.iter().enumerate() {
            for (key, value) in map {
                let string = checker.stringify(value, &format!("tags[{index}].{key}"), 0);
                tags.insert(key.clone(), string);
            }
        }

        let ikey = item
            .ikey
            .as_deref()
            .filter(|key| !key.is_empty())
            .unwrap_or(context.default_ikey);

        let envelope = Envelope {
            ver: ENVELOPE_VERSION,
            name: envelope_name(ikey, base_type),
            time: format_timestamp(item.time.unwrap_or_else(Utc::now)),
            ikey: ikey.to_owned(),
            sample_rate: context.sample_rate,
            tags,
            data: EnvelopeData {
                base_type: base_type.to_string(),
                base_data,
            },
        };

        let violations = checker.into_violations();
        if violations.is_empty() {
            Ok(envelope)
        } else {
            Err(ContractViolations {
                envelope: Box::new(envelope),
                violations,
            })
        }
    }

    /// Serializes the envelope into its wire string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn envelope_name(ikey: &str, base_type: BaseType) -> String {
    let key = ikey.replace('-', "");
    let type_name = base_type.telemetry_type();

    if key.is_empty() {
        format!("{ENVELOPE_NAME_PREFIX}.{type_name}")
    } else {
        format!("{ENVELOPE_NAME_PREFIX}.{key}.{type_name}")
    }
}

/// Merges custom properties into `baseData`.
///
/// Numbers become measurements, strings properties, everything else its JSON text. Custom
/// values overwrite existing keys.
fn merge_custom_data(checker: &mut ContractChecker, base_data: &mut Object, data: &Object) {
    let mut properties = match base_data.remove("properties") {
        Some(Value::Object(map)) => map,
        _ => Object::new(),
    };
    let mut measurements = match base_data.remove("measurements") {
        Some(Value::Object(map)) => map,
        _ => Object::new(),
    };

    for (key, value) in data {
        match value {
            Value::Number(_) => {
                measurements.insert(key.clone(), value.clone());
            }
            Value::String(_) => {
                properties.insert(key.clone(), value.clone());
            }
            _ => {
                let text = checker.stringify(value, &format!("data.{key}"), 0);
                properties.insert(key.clone(), Value::String(text));
            }
        }
    }

    if !properties.is_empty() {
        base_data.insert("properties".to_owned(), Value::Object(properties));
    }
    if !measurements.is_empty() {
        base_data.insert("measurements".to_owned(), Value::Object(measurements));
    }
}
