//! Audit record and GraphQL response models

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use super::claims::Claims;

/// Header generated by the gateway when a request carries no correlation ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Inbound headers propagated to the audit backend
pub const CORRELATION_HEADER_NAMES: [&str; 5] = [
    REQUEST_ID_HEADER,
    "x-correlation-id",
    "x-correlationid",
    "x-forrequest-id",
    "x-vcap-request-id",
];

/// Correlation identifiers captured from an inbound request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationHeaders(BTreeMap<String, String>);

impl CorrelationHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let captured = CORRELATION_HEADER_NAMES
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?.trim();
                (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
            })
            .collect();
        Self(captured)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Position of one shard within a sharded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardTag {
    pub transaction_id: Uuid,
    pub index: usize,
    pub count: usize,
}

impl ShardTag {
    /// Prefix `shard` with the transaction ID: `"<txid>: <shard>"`
    pub fn label(&self, shard: &str) -> String {
        format!("{}: {}", self.transaction_id, shard)
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }
}

/// Unit of post-log work handed to the audit worker, one per response shard
#[derive(Debug, Clone)]
pub struct AuditlogMessage {
    pub correlation_headers: CorrelationHeaders,
    /// Full request body text, used for classification
    pub request: Arc<str>,
    /// `request` attribute of post-log records: the request text when it fit
    /// in one shard, otherwise the transaction ID of its pre-log records
    pub logged_request: Arc<str>,
    /// Response shard, prefixed with the transaction ID
    pub response: String,
    /// Full buffered response, parsed for classification
    pub raw_response: Bytes,
    pub tag: ShardTag,
    pub claims: Arc<Claims>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub id: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub object_type: String,
}

impl Object {
    /// Identify the audited entity by name and the caller's claims
    pub fn for_claims(name: &str, claims: &Claims) -> Self {
        let id = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("externalTenant".to_string(), claims.tenant.clone()),
            ("consumerTenant".to_string(), claims.consumer_tenant.clone()),
            ("consumerType".to_string(), claims.consumer_type.clone()),
            ("consumerID".to_string(), claims.consumer_id.clone()),
            ("onBehalfOf".to_string(), claims.on_behalf_of.clone()),
        ]);
        Self {
            id,
            object_type: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub old: String,
    pub new: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            old: String::new(),
            new: new.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditlogMetadata {
    pub time: String,
    pub tenant: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub user: String,
    pub object: Object,
    pub attributes: Vec<Attribute>,
    #[serde(flatten)]
    pub metadata: AuditlogMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub user: String,
    /// JSON document `{"id": {...}, "reason": [...]}`
    pub data: String,
    #[serde(flatten)]
    pub metadata: AuditlogMetadata,
}

/// Payload encoded into [`SecurityEvent::data`]
#[derive(Debug, Serialize)]
pub struct SecurityEventData<'a> {
    pub id: &'a BTreeMap<String, String>,
    pub reason: &'a JsonValue,
}

/// The subset of a GraphQL response the classifier looks at
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<GraphqlError>,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlError {
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub path: ErrorPath,
    /// Remaining members such as `locations` and `extensions`
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Response path of a GraphQL error
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ErrorPath(pub Vec<PathSegment>);

impl ErrorPath {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(i64),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
