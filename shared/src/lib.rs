//! Shared types for redoubt
//!
//! Wire structures exchanged between the provisioning server and the
//! machines harvesting from it, plus the typed task codec both sides use.

pub mod task;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version spoken by this build, in both directions.
pub const PROTOCOL_VERSION: i64 = 0;

/// Path the harvest endpoint is mounted on.
pub const HARVEST_PATH: &str = "/v1/harvest";

/// Identity a machine asserts about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub fqdn: String,

    // host + domain == fqdn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    // cluster + node_type + id usually make up host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Free-form geographical hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One harvest round, client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub client_version: i64,

    /// Opaque value echoed back from the previous response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cookie: Option<String>,

    pub machine: MachineInfo,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_responses: Vec<WireTaskResponse>,
}

/// One harvest round, server to client
///
/// `tasks` and `products` are never both populated; a non-empty `errors`
/// means the client must not act on anything else in the response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub server_version: i64,
    pub server_cookie: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<WireTask>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
}

impl Response {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Structured request-time failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Task envelope: work the server delegates to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub name: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: serde_json::Value,
}

/// Task response envelope: the client's answer to a [`WireTask`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTaskResponse {
    pub name: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: serde_json::Value,
}

/// A deliverable file
///
/// `name` joined with '/' is the path relative to the client's product root;
/// `mask` is applied verbatim as the file's permission bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: Vec<String>,
    pub mask: u32,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Product {
    /// Relative path of the product, segments joined with '/'
    pub fn path(&self) -> String {
        self.name.join("/")
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
