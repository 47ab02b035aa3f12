use crate::constants::{
    CLIENT_REQUEST_ID_MAX_LEN, MAX_ITEMS, MAX_REPORTED_ERRORS, MIN_ITEMS, SCHEMA_VERSION,
    SERIAL_MAX_LEN, SERIAL_MIN_LEN,
};
use crate::envelope::{ErrorDetail, Item, ProtocolType, RawEnvelope, ValidatedEnvelope};
use crate::error::{IngestError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static CLIENT_REQUEST_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

/// Which validation policy applies to the call.
///
/// `Ingest` requires schema_version, sent_at and 1..=100 items; `Test`
/// relaxes all three so a bare connectivity ping is a valid call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Ingest,
    Test,
}

/// Parse a timestamp that must carry an explicit UTC offset.
///
/// A trailing `Z` counts as a zero offset; anything without an offset is
/// ambiguous and rejected.
pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timezone-aware ISO-8601 timestamp '{}': {}", raw, e))
}

/// Validate a decoded request document against the envelope contract.
///
/// Envelope-level failures abort the whole call; item failures are collected
/// independently so siblings still get through. Pure: no I/O, no clock.
pub fn validate_envelope(raw: &serde_json::Value, kind: RequestKind) -> Result<ValidatedEnvelope> {
    let envelope: RawEnvelope = serde_json::from_value(raw.clone())
        .map_err(|e| IngestError::Envelope(format!("malformed envelope: {}", e)))?;

    let raw_items: &[serde_json::Value] = envelope.items.as_deref().unwrap_or(&[]);
    let received = raw_items.len();

    let schema_version = match (kind, envelope.schema_version) {
        (_, Some(v)) if v != SCHEMA_VERSION => {
            return Err(IngestError::Envelope(format!(
                "schema_version {} unsupported; expected {}",
                v, SCHEMA_VERSION
            )));
        }
        (_, Some(v)) => Some(v),
        (RequestKind::Ingest, None) => {
            return Err(IngestError::Envelope("schema_version is required".to_string()));
        }
        (RequestKind::Test, None) => {
            if received > 0 {
                return Err(IngestError::Envelope(
                    "schema_version is required when items are supplied".to_string(),
                ));
            }
            None
        }
    };

    let sent_at = match (kind, envelope.sent_at.as_deref()) {
        (_, Some(raw)) => Some(parse_timestamp(raw).map_err(IngestError::Envelope)?),
        (RequestKind::Ingest, None) => {
            return Err(IngestError::Envelope("sent_at is required".to_string()));
        }
        (RequestKind::Test, None) => {
            if received > 0 {
                return Err(IngestError::Envelope(
                    "sent_at is required when items are supplied".to_string(),
                ));
            }
            None
        }
    };

    if let Some(id) = envelope.client_request_id.as_deref() {
        if id.len() > CLIENT_REQUEST_ID_MAX_LEN {
            return Err(IngestError::Envelope(format!(
                "client_request_id exceeds {} characters",
                CLIENT_REQUEST_ID_MAX_LEN
            )));
        }
        if !id.is_empty() && !CLIENT_REQUEST_ID_RE.is_match(id) {
            return Err(IngestError::Envelope(
                "client_request_id has invalid charset: only [A-Za-z0-9._-]".to_string(),
            ));
        }
    }

    match kind {
        RequestKind::Ingest => {
            if received < MIN_ITEMS || received > MAX_ITEMS {
                return Err(IngestError::Envelope(format!(
                    "items must have length {}..{}, got {}",
                    MIN_ITEMS, MAX_ITEMS, received
                )));
            }
        }
        RequestKind::Test => {
            if received > MAX_ITEMS {
                return Err(IngestError::Envelope(format!(
                    "items must have length <={}, got {}",
                    MAX_ITEMS, received
                )));
            }
        }
    }

    let mut items = Vec::new();
    let mut errors = Vec::new();
    for (index, raw_item) in raw_items.iter().enumerate() {
        match validate_item(index, raw_item) {
            Ok(item) => items.push(item),
            // Every failure counts as rejected; only the first few are described.
            Err(detail) => {
                if errors.len() < MAX_REPORTED_ERRORS {
                    errors.push(detail);
                }
            }
        }
    }

    Ok(ValidatedEnvelope {
        schema_version,
        sent_at,
        client_request_id: envelope.client_request_id,
        received,
        items,
        errors,
    })
}

/// Validate one raw item into its typed form, or a structured rejection.
/// Single pass: nothing downstream re-parses the item.
fn validate_item(
    index: usize,
    raw: &serde_json::Value,
) -> std::result::Result<Item, ErrorDetail> {
    let reject = |code: &str, detail: String| ErrorDetail {
        index,
        code: code.to_string(),
        detail,
    };

    let obj = raw
        .as_object()
        .ok_or_else(|| reject("invalid_item", "item must be an object".to_string()))?;

    let serial_number = obj
        .get("serial_number")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            reject(
                "invalid_serial_number",
                "serial_number must be a string".to_string(),
            )
        })?;
    let serial_len = serial_number.chars().count();
    if serial_len < SERIAL_MIN_LEN || serial_len > SERIAL_MAX_LEN {
        return Err(reject(
            "invalid_serial_number",
            format!(
                "serial_number must be {}..{} characters, got {}",
                SERIAL_MIN_LEN, SERIAL_MAX_LEN, serial_len
            ),
        ));
    }

    let location = match obj.get("location") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(reject(
                "invalid_location",
                "location must be a string when present".to_string(),
            ));
        }
    };

    let protocol_raw = obj
        .get("protocol_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            reject(
                "invalid_protocol_type",
                "protocol_type must be a string".to_string(),
            )
        })?;
    let protocol_type: ProtocolType = protocol_raw
        .parse()
        .map_err(|e: String| reject("invalid_protocol_type", e))?;

    let token = obj
        .get("token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| reject("invalid_token", "token must be a string".to_string()))?;
    if token.is_empty() {
        return Err(reject("invalid_token", "token must be non-empty".to_string()));
    }

    let token_created_raw = obj
        .get("token_created_at")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            reject(
                "invalid_timestamp",
                "token_created_at must be a string".to_string(),
            )
        })?;
    let token_created_at =
        parse_timestamp(token_created_raw).map_err(|e| reject("invalid_timestamp", e))?;

    Ok(Item {
        serial_number: serial_number.to_string(),
        location,
        protocol_type,
        token: token.to_string(),
        token_created_at,
    })
}
