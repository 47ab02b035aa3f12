use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Supported protocol codes. The wire value is case-insensitive but is
/// normalized to lowercase before anything downstream sees it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Rps,
    Pms,
    Css,
    Dss,
}

impl ProtocolType {
    pub const ALL: [ProtocolType; 4] = [
        ProtocolType::Rps,
        ProtocolType::Pms,
        ProtocolType::Css,
        ProtocolType::Dss,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Rps => "rps",
            ProtocolType::Pms => "pms",
            ProtocolType::Css => "css",
            ProtocolType::Dss => "dss",
        }
    }
}

impl FromStr for ProtocolType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rps" => Ok(ProtocolType::Rps),
            "pms" => Ok(ProtocolType::Pms),
            "css" => Ok(ProtocolType::Css),
            "dss" => Ok(ProtocolType::Dss),
            other => Err(format!(
                "protocol_type '{}' must be one of: rps, pms, css, dss",
                other
            )),
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated device/protocol registration record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Item {
    pub serial_number: String,
    pub location: Option<String>,
    pub protocol_type: ProtocolType,
    pub token: String,
    pub token_created_at: DateTime<Utc>,
}

/// The envelope as it arrives off the wire, before any constraint checking.
/// Items stay raw so one bad item cannot fail the whole deserialization.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    pub schema_version: Option<u32>,
    pub sent_at: Option<String>,
    pub client_request_id: Option<String>,
    pub items: Option<Vec<serde_json::Value>>,
}

/// Per-item rejection descriptor, reported back to the caller (capped).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorDetail {
    pub index: usize,
    pub code: String,
    pub detail: String,
}

/// Output of a successful envelope validation pass.
///
/// `sent_at` and `schema_version` are `None` only for a test-mode ping;
/// ingest-mode validation guarantees both are present.
#[derive(Debug, Clone)]
pub struct ValidatedEnvelope {
    pub schema_version: Option<u32>,
    pub sent_at: Option<DateTime<Utc>>,
    pub client_request_id: Option<String>,
    pub received: usize,
    pub items: Vec<Item>,
    pub errors: Vec<ErrorDetail>,
}

impl ValidatedEnvelope {
    pub fn accepted(&self) -> usize {
        self.items.len()
    }

    pub fn rejected(&self) -> usize {
        self.received - self.items.len()
    }
}

/// The unit appended to the broker: one record per accepted HTTP call.
///
/// Wire form is a flat string field map (a stream entry); items travel as a
/// serialized JSON array under `items_json`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMessage {
    pub request_id: String,
    /// Empty string is the sentinel for "absent".
    pub client_request_id: String,
    pub mb_ip: String,
    pub sent_at: DateTime<Utc>,
    pub items: Vec<Item>,
}

impl BatchMessage {
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let items_json = serde_json::to_string(&self.items)?;
        Ok(vec![
            ("request_id".to_string(), self.request_id.clone()),
            ("client_request_id".to_string(), self.client_request_id.clone()),
            ("mb_ip".to_string(), self.mb_ip.clone()),
            ("sent_at".to_string(), self.sent_at.to_rfc3339()),
            ("items_json".to_string(), items_json),
        ])
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| IngestError::Envelope(format!("record missing field '{}'", key)))
        };
        let sent_at_raw = get("sent_at")?;
        let sent_at = DateTime::parse_from_rfc3339(sent_at_raw)
            .map_err(|e| IngestError::Envelope(format!("record sent_at invalid: {}", e)))?
            .with_timezone(&Utc);
        let items: Vec<Item> = serde_json::from_str(get("items_json")?)?;
        Ok(Self {
            request_id: get("request_id")?.clone(),
            client_request_id: get("client_request_id")?.clone(),
            mb_ip: get("mb_ip")?.clone(),
            sent_at,
            items,
        })
    }
}
