//! Wire types and codecs for Raccoon.
//!
//! Clients send an [`EventRequest`] (a batch of opaque event payloads) and get
//! back an [`EventResponse`] envelope for every request, accepted or not.
//! Both types have two encodings:
//!
//! - **Proto**: protobuf binary form, selected by `Content-Type: application/proto`
//!   on REST or by a binary frame on WebSocket.
//! - **JSON**: selected by `Content-Type: application/json` (and as the REST
//!   fallback) or by a text frame on WebSocket.
//!
//! # Example
//!
//! ```json
//! {
//!   "reqGuid": "1234-abcd",
//!   "sentTime": "2025-12-11T10:00:00Z",
//!   "events": [
//!     { "eventBytes": "eyJ1c2VyIjoxfQ==", "type": "click" }
//!   ]
//! }
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use prost::Message;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use thiserror::Error;

/// Content type for the JSON encoding.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type for the protobuf encoding.
pub const CONTENT_TYPE_PROTO: &str = "application/proto";

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid proto: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    #[error("proto encode failed: {0}")]
    ProtoEncode(#[from] prost::EncodeError),
}

/// Protobuf well-known timestamp, rendered as RFC 3339 in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp(),
            nanos: now.timestamp_subsec_nanos() as i32,
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match Utc.timestamp_opt(self.seconds, self.nanos.max(0) as u32).single() {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => Err(serde::ser::Error::custom("timestamp out of range")),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let dt = chrono::DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
        Ok(Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() as i32,
        })
    }
}

/// A single client event. The gateway never looks inside `event_bytes`.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "base64_bytes", default)]
    pub event_bytes: Vec<u8>,

    #[prost(string, tag = "2")]
    #[serde(default)]
    pub r#type: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, event_bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            event_bytes: event_bytes.into(),
            r#type: event_type.into(),
        }
    }
}

/// A batch of events submitted by one client in one message.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    /// Client-generated request id, echoed back as `req_guid`
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub req_guid: String,

    #[prost(message, optional, tag = "2")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<Timestamp>,

    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Outcome class of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Unspecified = 0,
    Success = 1,
    Error = 2,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unspecified => "UNSPECIFIED",
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "UNSPECIFIED" => Some(Status::Unspecified),
            "SUCCESS" => Some(Status::Success),
            "ERROR" => Some(Status::Error),
            _ => None,
        }
    }
}

/// Detailed response code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Code {
    Unspecified = 0,
    Ok = 1,
    BadRequest = 2,
    InternalError = 3,
    MaxConnectionLimitReached = 4,
    MaxUserLimitReached = 5,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Unspecified => "UNSPECIFIED",
            Code::Ok => "OK",
            Code::BadRequest => "BAD_REQUEST",
            Code::InternalError => "INTERNAL_ERROR",
            Code::MaxConnectionLimitReached => "MAX_CONNECTION_LIMIT_REACHED",
            Code::MaxUserLimitReached => "MAX_USER_LIMIT_REACHED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "UNSPECIFIED" => Some(Code::Unspecified),
            "OK" => Some(Code::Ok),
            "BAD_REQUEST" => Some(Code::BadRequest),
            "INTERNAL_ERROR" => Some(Code::InternalError),
            "MAX_CONNECTION_LIMIT_REACHED" => Some(Code::MaxConnectionLimitReached),
            "MAX_USER_LIMIT_REACHED" => Some(Code::MaxUserLimitReached),
            _ => None,
        }
    }
}

/// Response envelope sent for every request or message.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    #[prost(enumeration = "Status", tag = "1")]
    #[serde(with = "status_name")]
    pub status: i32,

    #[prost(enumeration = "Code", tag = "2")]
    #[serde(with = "code_name")]
    pub code: i32,

    /// Unix seconds at which the response was produced
    #[prost(int64, tag = "3")]
    pub sent_time: i64,

    #[prost(string, tag = "4")]
    #[serde(default)]
    pub reason: String,

    #[prost(map = "string, string", tag = "5")]
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl EventResponse {
    /// Acknowledge an accepted batch, echoing its request id.
    pub fn success(req_guid: &str) -> Self {
        let mut data = HashMap::new();
        data.insert("req_guid".to_string(), req_guid.to_string());
        Self {
            status: Status::Success as i32,
            code: Code::Ok as i32,
            sent_time: Utc::now().timestamp(),
            reason: String::new(),
            data,
        }
    }

    /// Reject a request or connection.
    pub fn error(code: Code, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Error as i32,
            code: code as i32,
            sent_time: Utc::now().timestamp(),
            reason: reason.into(),
            data: HashMap::new(),
        }
    }
}

/// Encoding negotiated for one request or frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    Proto,
}

impl Codec {
    /// Pick a codec from a `Content-Type` header. Unknown or missing types use JSON.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let media_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());

        match media_type.as_deref() {
            Some(CONTENT_TYPE_PROTO) => Codec::Proto,
            _ => Codec::Json,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => CONTENT_TYPE_JSON,
            Codec::Proto => CONTENT_TYPE_PROTO,
        }
    }

    pub fn decode_request(&self, bytes: &[u8]) -> Result<EventRequest, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Proto => Ok(EventRequest::decode(bytes)?),
        }
    }

    pub fn encode_request(&self, request: &EventRequest) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(request)?),
            Codec::Proto => encode_proto(request),
        }
    }

    pub fn decode_response(&self, bytes: &[u8]) -> Result<EventResponse, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::Proto => Ok(EventResponse::decode(bytes)?),
        }
    }

    pub fn encode_response(&self, response: &EventResponse) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(response)?),
            Codec::Proto => encode_proto(response),
        }
    }
}

fn encode_proto<M: Message>(message: &M) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message.encode(&mut buf)?;
    Ok(buf)
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod status_name {
    use super::*;

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        let status = Status::try_from(*value).unwrap_or(Status::Unspecified);
        serializer.serialize_str(status.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Status::from_name(&raw)
            .map(|s| s as i32)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status '{}'", raw)))
    }
}

mod code_name {
    use super::*;

    pub fn serialize<S: Serializer>(value: &i32, serializer: S) -> Result<S::Ok, S::Error> {
        let code = Code::try_from(*value).unwrap_or(Code::Unspecified);
        serializer.serialize_str(code.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Code::from_name(&raw)
            .map(|c| c as i32)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown code '{}'", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_content_type() {
        assert_eq!(Codec::from_content_type(Some("application/proto")), Codec::Proto);
        assert_eq!(Codec::from_content_type(Some("application/json")), Codec::Json);
        assert_eq!(
            Codec::from_content_type(Some("application/json; charset=utf-8")),
            Codec::Json
        );
        assert_eq!(Codec::from_content_type(Some("text/plain")), Codec::Json);
        assert_eq!(Codec::from_content_type(None), Codec::Json);
    }

    #[test]
    fn test_json_request_decode() {
        let json_str = r#"{
            "reqGuid": "req-1",
            "sentTime": "2025-12-11T10:00:00Z",
            "events": [
                {"eventBytes": "aGVsbG8=", "type": "click"},
                {"eventBytes": "d29ybGQ=", "type": "view"}
            ]
        }"#;

        let req = Codec::Json.decode_request(json_str.as_bytes()).unwrap();
        assert_eq!(req.req_guid, "req-1");
        assert_eq!(req.events.len(), 2);
        assert_eq!(req.events[0].event_bytes, b"hello");
        assert_eq!(req.events[1].r#type, "view");
        assert_eq!(req.sent_time.unwrap().seconds, 1_765_447_200);
    }

    #[test]
    fn test_json_request_rejects_garbage() {
        assert!(Codec::Json.decode_request(b"{not json").is_err());
        assert!(Codec::Json
            .decode_request(br#"{"events":[{"eventBytes":"***"}]}"#)
            .is_err());
    }

    #[test]
    fn test_proto_request_decode() {
        let req = EventRequest {
            req_guid: "req-2".to_string(),
            sent_time: Some(Timestamp { seconds: 10, nanos: 0 }),
            events: vec![Event::new("click", b"abc".to_vec())],
        };
        let bytes = Codec::Proto.encode_request(&req).unwrap();

        let decoded = Codec::Proto.decode_request(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_proto_rejects_truncated_input() {
        let req = EventRequest {
            req_guid: "req-3".to_string(),
            sent_time: None,
            events: vec![Event::new("click", vec![1u8; 64])],
        };
        let bytes = Codec::Proto.encode_request(&req).unwrap();
        assert!(Codec::Proto.decode_request(&bytes[..bytes.len() - 5]).is_err());
    }

    #[test]
    fn test_success_response_json_shape() {
        let resp = EventResponse::success("req-4");
        let body: serde_json::Value =
            serde_json::from_slice(&Codec::Json.encode_response(&resp).unwrap()).unwrap();

        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(body["code"], "OK");
        assert_eq!(body["reason"], "");
        assert_eq!(body["data"]["req_guid"], "req-4");
        assert!(body["sentTime"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_error_response_accessors() {
        let resp = EventResponse::error(Code::MaxUserLimitReached, "duplicate connection");
        assert_eq!(resp.status(), Status::Error);
        assert_eq!(resp.code(), Code::MaxUserLimitReached);
        assert!(resp.data.is_empty());

        let bytes = Codec::Proto.encode_response(&resp).unwrap();
        let decoded = Codec::Proto.decode_response(&bytes).unwrap();
        assert_eq!(decoded.code(), Code::MaxUserLimitReached);
        assert_eq!(decoded.reason, "duplicate connection");
    }
}
