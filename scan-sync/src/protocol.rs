//! Worker message protocol
//!
//! Requests are `{type, id, payload}`; responses are
//! `{type: "<type>_result", id, success, error?, ...}` and always echo the
//! request id. Binary payloads travel as base64 strings.

use crate::batch::BatchOutcome;
use crate::engine::TransferQuery;
use crate::error::{Error, ErrorKind, Result};
use base64::Engine as _;
use scan_core::WorkerBatchMarker;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response type of messages that could not be parsed
pub const ERROR_RESPONSE_TYPE: &str = "error";

/// `init` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    /// Hex encoded seed
    pub seed_hex: String,
    /// Wallet password
    #[serde(default)]
    pub password: String,
    /// Engine version to load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

/// `process` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayload {
    /// Base64 sparse transaction data
    pub sparse_data: String,
    /// First height covered by the data
    pub start_height: u64,
    /// Caller's batch id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Hex SHA-256 of the decoded data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
}

impl ProcessPayload {
    /// Build a payload from raw bytes
    pub fn new(
        sparse_data: &[u8],
        start_height: u64,
        batch_id: Option<String>,
        expected_hash: Option<String>,
    ) -> Self {
        Self {
            sparse_data: base64::engine::general_purpose::STANDARD.encode(sparse_data),
            start_height,
            batch_id,
            expected_hash,
        }
    }

    /// Decode the sparse data
    pub fn decode_data(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(self.sparse_data.as_bytes())
            .map_err(|e| Error::Protocol(format!("sparse_data is not base64: {}", e)))
    }
}

/// `init` result fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    /// Primary address of the restored account
    pub address: String,
}

/// `get_checkpoint` result fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Last successful batch
    pub checkpoint: WorkerBatchMarker,
}

/// `get_balance` result fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceData {
    /// Engine balance
    pub balance: i64,
}

/// `get_stake_heights` result fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeHeightsData {
    /// Stake heights
    pub stake_heights: Vec<u64>,
}

/// Worker request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Load and restore the engine
    Init(InitPayload),
    /// Verify and ingest one batch
    Process(ProcessPayload),
    /// Last successful batch marker
    GetCheckpoint,
    /// Engine balance
    GetBalance,
    /// Engine stake heights
    GetStakeHeights,
    /// Engine transfers
    GetTransfers(TransferQuery),
}

/// Request as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl Request {
    /// Wire type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Process(_) => "process",
            Self::GetCheckpoint => "get_checkpoint",
            Self::GetBalance => "get_balance",
            Self::GetStakeHeights => "get_stake_heights",
            Self::GetTransfers(_) => "get_transfers",
        }
    }

    /// Serialize with `id`
    pub fn to_json(&self, id: u64) -> Result<String> {
        let payload = match self {
            Self::Init(p) => to_value(p)?,
            Self::Process(p) => to_value(p)?,
            Self::GetTransfers(q) => to_value(q)?,
            Self::GetCheckpoint | Self::GetBalance | Self::GetStakeHeights => Value::Null,
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            id,
            payload,
        };
        serde_json::to_string(&envelope).map_err(|e| Error::Protocol(e.to_string()))
    }

    fn from_envelope(envelope: Envelope) -> Result<Self> {
        let Envelope { kind, payload, .. } = envelope;
        match kind.as_str() {
            "init" => Ok(Self::Init(from_value(payload)?)),
            "process" => Ok(Self::Process(from_value(payload)?)),
            "get_checkpoint" => Ok(Self::GetCheckpoint),
            "get_balance" => Ok(Self::GetBalance),
            "get_stake_heights" => Ok(Self::GetStakeHeights),
            "get_transfers" => {
                if payload.is_null() {
                    Ok(Self::GetTransfers(TransferQuery::default()))
                } else {
                    Ok(Self::GetTransfers(from_value(payload)?))
                }
            }
            other => Err(Error::Protocol(format!("unknown request type: {}", other))),
        }
    }
}

/// Parse a raw request
///
/// On failure returns the `error` response to send back, tagged with the
/// request id when one can be recovered from the text.
pub fn parse_request(text: &str) -> std::result::Result<(u64, Request), Response> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Err(Response::parse_error(0, format!("invalid JSON: {}", e))),
    };

    let id = value.get("id").and_then(Value::as_u64).unwrap_or(0);

    let envelope: Envelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => return Err(Response::parse_error(id, format!("malformed request: {}", e))),
    };

    match Request::from_envelope(envelope) {
        Ok(request) => Ok((id, request)),
        Err(e) => Err(Response::parse_error(id, e.to_string())),
    }
}

/// Worker response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// `<request type>_result`, or `error` for unparseable requests
    #[serde(rename = "type")]
    pub kind: String,
    /// Echoed request id
    pub id: u64,
    /// Whether the request succeeded
    pub success: bool,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Request-specific fields
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Response {
    /// Successful response carrying the fields of `data`
    pub fn ok<T: Serialize>(request_kind: &str, id: u64, data: &T) -> Self {
        let data = match serde_json::to_value(data) {
            Ok(Value::Object(map)) => map,
            Ok(Value::Null) => Map::new(),
            Ok(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
            Err(e) => return Self::failure(request_kind, id, &Error::Protocol(e.to_string())),
        };

        Self {
            kind: result_type(request_kind),
            id,
            success: true,
            error: None,
            error_kind: None,
            data,
        }
    }

    /// Failed response
    pub fn failure(request_kind: &str, id: u64, error: &Error) -> Self {
        Self {
            kind: result_type(request_kind),
            id,
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            data: Map::new(),
        }
    }

    /// Response to a message that could not be parsed
    pub fn parse_error(id: u64, message: String) -> Self {
        Self {
            kind: ERROR_RESPONSE_TYPE.to_string(),
            id,
            success: false,
            error: Some(message),
            error_kind: Some(ErrorKind::Protocol),
            data: Map::new(),
        }
    }

    /// Response for a `process` request; success mirrors the outcome
    pub fn from_outcome(id: u64, outcome: &BatchOutcome) -> Self {
        let mut response = Self::ok("process", id, outcome);
        response.success = outcome.success;
        response.error = outcome.error.clone();
        response.error_kind = outcome.error_kind;
        response.data.remove("success");
        response.data.remove("error");
        response.data.remove("error_kind");
        response
    }

    /// Rebuild the batch outcome of a `process` response
    pub fn into_outcome(self) -> Result<BatchOutcome> {
        let mut data = self.data;
        data.insert("success".to_string(), Value::Bool(self.success));
        if let Some(error) = self.error {
            data.insert("error".to_string(), Value::String(error));
        }
        if let Some(kind) = self.error_kind {
            data.insert("error_kind".to_string(), to_value(&kind)?);
        }
        from_value(Value::Object(data))
    }

    /// Decode the request-specific fields, failing if the request failed
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        if !self.success {
            return Err(Error::from_worker(
                self.error_kind,
                self.error.unwrap_or_else(|| "unknown worker error".to_string()),
            ));
        }
        from_value(Value::Object(self.data))
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// `<kind>_result`
pub fn result_type(request_kind: &str) -> String {
    format!("{}_result", request_kind)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let request = Request::Process(ProcessPayload::new(b"abc", 1000, Some("b1".into()), None));
        let json: Value = serde_json::from_str(&request.to_json(7).unwrap()).unwrap();

        assert_eq!(json["type"], "process");
        assert_eq!(json["id"], 7);
        assert_eq!(json["payload"]["sparse_data"], "YWJj");
        assert_eq!(json["payload"]["start_height"], 1000);
    }

    #[test]
    fn test_parse_roundtrip() {
        let request = Request::GetTransfers(TransferQuery {
            min_height: 5,
            ..Default::default()
        });
        let (id, parsed) = parse_request(&request.to_json(42).unwrap()).unwrap();
        assert_eq!(id, 42);
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_parameterless_request_without_payload() {
        let (id, parsed) = parse_request(r#"{"type":"get_balance","id":3}"#).unwrap();
        assert_eq!(id, 3);
        assert_eq!(parsed, Request::GetBalance);
    }

    #[test]
    fn test_invalid_json_gets_id_zero() {
        let response = parse_request("{not json").unwrap_err();
        assert_eq!(response.kind, ERROR_RESPONSE_TYPE);
        assert_eq!(response.id, 0);
        assert!(!response.success);
    }

    #[test]
    fn test_unknown_type_keeps_id() {
        let response = parse_request(r#"{"type":"explode","id":9}"#).unwrap_err();
        assert_eq!(response.kind, ERROR_RESPONSE_TYPE);
        assert_eq!(response.id, 9);
        assert!(response.error.unwrap().contains("explode"));
    }

    #[test]
    fn test_bad_payload_keeps_id() {
        let response =
            parse_request(r#"{"type":"process","id":11,"payload":{"start_height":"x"}}"#)
                .unwrap_err();
        assert_eq!(response.id, 11);
    }

    #[test]
    fn test_outcome_survives_response() {
        let outcome = BatchOutcome {
            success: false,
            error: Some("Integrity error: sparse data hash mismatch".into()),
            error_kind: Some(ErrorKind::Integrity),
            last_successful_batch: WorkerBatchMarker {
                id: Some("b0".into()),
                height: 0,
                timestamp: 12,
            },
            ..Default::default()
        };

        let response = Response::from_outcome(5, &outcome);
        assert_eq!(response.kind, "process_result");
        assert!(!response.success);

        let text = response.to_json().unwrap();
        let parsed: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.into_outcome().unwrap(), outcome);
    }

    #[test]
    fn test_checkpoint_marker_does_not_clash_with_id() {
        let marker = WorkerBatchMarker {
            id: Some("b9".into()),
            height: 9000,
            timestamp: 1,
        };
        let response = Response::ok("get_checkpoint", 77, &CheckpointData { checkpoint: marker.clone() });
        let parsed: Response = serde_json::from_str(&response.to_json().unwrap()).unwrap();

        assert_eq!(parsed.id, 77);
        assert_eq!(parsed.into_data::<CheckpointData>().unwrap().checkpoint, marker);
    }

    #[test]
    fn test_failed_response_into_data_is_error() {
        let response = Response::failure("get_balance", 1, &Error::EngineNotInitialized);
        let err = response.into_data::<BalanceData>().unwrap_err();
        assert!(matches!(err, Error::EngineNotInitialized));
    }
}
