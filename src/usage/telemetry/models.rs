//! Data models for OpenTelemetry log exports
//!
//! `ExportLogsServiceRequest` and friends mirror the OTLP/JSON encoding;
//! the `proto` module mirrors the OTLP protobuf encoding. Both flatten
//! into `ParsedEvent`.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A field that fails to decode is treated as absent
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Keep the entries of a list that decode, drop the rest
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        ),
        _ => None,
    })
}

/// OTLP ExportLogsServiceRequest (JSON format)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportLogsServiceRequest {
    pub resource_logs: Option<Vec<ResourceLogs>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    #[serde(default, deserialize_with = "lenient")]
    pub resource: Option<Resource>,
    pub scope_logs: Option<Vec<ScopeLogs>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default, deserialize_with = "lenient_list")]
    pub attributes: Option<Vec<KeyValue>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationScope {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    #[serde(default, deserialize_with = "lenient")]
    pub scope: Option<InstrumentationScope>,
    pub log_records: Option<Vec<LogRecord>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    // int64 fields arrive as strings, but some exporters send numbers
    pub time_unix_nano: Option<Value>,
    pub observed_time_unix_nano: Option<Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub severity_text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub body: Option<AnyValue>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub attributes: Option<Vec<KeyValue>>,
    #[serde(default, deserialize_with = "lenient")]
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    #[serde(default, deserialize_with = "lenient")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub value: Option<AnyValue>,
}

/// Scalars are kept raw: proto3 JSON allows `"0.5"`, `"NaN"` and numbers alike
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    pub string_value: Option<Value>,
    pub bool_value: Option<Value>,
    pub int_value: Option<Value>,
    pub double_value: Option<Value>,
}

/// One log record flattened for ingestion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEvent {
    /// `eventName` field, else the `event.name` attribute
    pub name: Option<String>,
    pub body: Option<String>,
    /// Record time, else observed time, 0 when neither is set
    pub timestamp_ns: i64,
    /// Resource attributes overlaid with record attributes
    pub attributes: HashMap<String, String>,
}

/// Render a JSON scalar as text, the way OTLP/JSON encodes int64
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_nanos(value: Option<&Value>) -> Option<i64> {
    value
        .and_then(scalar_to_string)
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|ns| *ns > 0)
}

impl AnyValue {
    pub fn as_text(&self) -> Option<String> {
        [
            &self.string_value,
            &self.int_value,
            &self.double_value,
            &self.bool_value,
        ]
        .into_iter()
        .find_map(|field| field.as_ref().and_then(scalar_to_string))
    }
}

impl KeyValue {
    /// Extract string value from KeyValue
    pub fn get_string_value(&self) -> Option<String> {
        self.value.as_ref().and_then(AnyValue::as_text)
    }
}

fn collect_attributes(attrs: Option<&Vec<KeyValue>>, into: &mut HashMap<String, String>) {
    for kv in attrs.into_iter().flatten() {
        if let (Some(key), Some(value)) = (&kv.key, kv.get_string_value()) {
            into.insert(key.clone(), value);
        }
    }
}

impl ExportLogsServiceRequest {
    /// Flatten every log record in the export
    pub fn into_events(self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();

        for rl in self.resource_logs.unwrap_or_default() {
            let mut resource_attrs = HashMap::new();
            collect_attributes(
                rl.resource.as_ref().and_then(|r| r.attributes.as_ref()),
                &mut resource_attrs,
            );

            for sl in rl.scope_logs.unwrap_or_default() {
                for record in sl.log_records.unwrap_or_default() {
                    let mut attributes = resource_attrs.clone();
                    collect_attributes(record.attributes.as_ref(), &mut attributes);

                    let name = record
                        .event_name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .or_else(|| attributes.get("event.name").cloned());

                    events.push(ParsedEvent {
                        name,
                        body: record.body.as_ref().and_then(AnyValue::as_text),
                        timestamp_ns: parse_nanos(record.time_unix_nano.as_ref())
                            .or_else(|| parse_nanos(record.observed_time_unix_nano.as_ref()))
                            .unwrap_or(0),
                        attributes,
                    });
                }
            }
        }

        events
    }
}

/// OTLP protobuf messages, restricted to the fields the collector reads
pub mod proto {
    use std::collections::HashMap;

    use super::ParsedEvent;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ExportLogsServiceRequest {
        #[prost(message, repeated, tag = "1")]
        pub resource_logs: Vec<ResourceLogs>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ExportLogsServiceResponse {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ResourceLogs {
        #[prost(message, optional, tag = "1")]
        pub resource: Option<Resource>,
        #[prost(message, repeated, tag = "2")]
        pub scope_logs: Vec<ScopeLogs>,
        #[prost(string, tag = "3")]
        pub schema_url: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Resource {
        #[prost(message, repeated, tag = "1")]
        pub attributes: Vec<KeyValue>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ScopeLogs {
        #[prost(message, repeated, tag = "2")]
        pub log_records: Vec<LogRecord>,
        #[prost(string, tag = "3")]
        pub schema_url: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LogRecord {
        #[prost(fixed64, tag = "1")]
        pub time_unix_nano: u64,
        #[prost(int32, tag = "2")]
        pub severity_number: i32,
        #[prost(string, tag = "3")]
        pub severity_text: String,
        #[prost(message, optional, tag = "5")]
        pub body: Option<AnyValue>,
        #[prost(message, repeated, tag = "6")]
        pub attributes: Vec<KeyValue>,
        #[prost(fixed64, tag = "11")]
        pub observed_time_unix_nano: u64,
        #[prost(string, tag = "12")]
        pub event_name: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct KeyValue {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(message, optional, tag = "2")]
        pub value: Option<AnyValue>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AnyValue {
        #[prost(oneof = "any_value::Value", tags = "1, 2, 3, 4")]
        pub value: Option<any_value::Value>,
    }

    pub mod any_value {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(string, tag = "1")]
            StringValue(String),
            #[prost(bool, tag = "2")]
            BoolValue(bool),
            #[prost(int64, tag = "3")]
            IntValue(i64),
            #[prost(double, tag = "4")]
            DoubleValue(f64),
        }
    }

    impl AnyValue {
        pub fn as_text(&self) -> Option<String> {
            match self.value.as_ref()? {
                any_value::Value::StringValue(s) => Some(s.clone()),
                any_value::Value::BoolValue(b) => Some(b.to_string()),
                any_value::Value::IntValue(i) => Some(i.to_string()),
                any_value::Value::DoubleValue(d) => Some(d.to_string()),
            }
        }
    }

    fn collect_attributes(attrs: &[KeyValue], into: &mut HashMap<String, String>) {
        for kv in attrs {
            if let Some(value) = kv.value.as_ref().and_then(AnyValue::as_text) {
                into.insert(kv.key.clone(), value);
            }
        }
    }

    fn nanos(value: u64) -> Option<i64> {
        i64::try_from(value).ok().filter(|ns| *ns > 0)
    }

    impl ExportLogsServiceRequest {
        /// Flatten every log record in the export
        pub fn into_events(self) -> Vec<ParsedEvent> {
            let mut events = Vec::new();

            for rl in self.resource_logs {
                let mut resource_attrs = HashMap::new();
                if let Some(resource) = &rl.resource {
                    collect_attributes(&resource.attributes, &mut resource_attrs);
                }

                for sl in rl.scope_logs {
                    for record in sl.log_records {
                        let mut attributes = resource_attrs.clone();
                        collect_attributes(&record.attributes, &mut attributes);

                        let name = Some(record.event_name.clone())
                            .filter(|n| !n.is_empty())
                            .or_else(|| attributes.get("event.name").cloned());

                        events.push(ParsedEvent {
                            name,
                            body: record.body.as_ref().and_then(AnyValue::as_text),
                            timestamp_ns: nanos(record.time_unix_nano)
                                .or_else(|| nanos(record.observed_time_unix_nano))
                                .unwrap_or(0),
                            attributes,
                        });
                    }
                }
            }

            events
        }
    }
}
