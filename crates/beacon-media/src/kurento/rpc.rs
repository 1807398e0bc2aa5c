//! Kurento JSON-RPC 2.0 frames.
//!
//! Requests are `create`, `invoke`, `subscribe` and `release`. The server
//! answers each with a `result` (carrying `value` and `sessionId`) or an
//! `error`, and pushes `onEvent` notifications for subscribed events.

use crate::{MediaError, MediaResult};
use beacon_common::IceCandidate;
use serde::Deserialize;
use serde_json::{Value, json};

pub const MEDIA_PIPELINE: &str = "MediaPipeline";
pub const WEBRTC_ENDPOINT: &str = "WebRtcEndpoint";
pub const ICE_CANDIDATE_FOUND: &str = "IceCandidateFound";

/// Encode a request frame.
pub fn request(id: u64, method: &str, params: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Attach the server-issued session id, once known.
pub fn with_session(mut params: Value, session_id: Option<&str>) -> Value {
    if let (Some(sid), Some(obj)) = (session_id, params.as_object_mut()) {
        obj.insert("sessionId".into(), Value::String(sid.to_owned()));
    }
    params
}

pub fn create(kind: &str, constructor_params: Value) -> Value {
    json!({
        "type": kind,
        "constructorParams": constructor_params,
        "properties": {},
    })
}

pub fn invoke(object: &str, operation: &str, operation_params: Value) -> Value {
    json!({
        "object": object,
        "operation": operation,
        "operationParams": operation_params,
    })
}

pub fn subscribe(object: &str, event: &str) -> Value {
    json!({ "type": event, "object": object })
}

pub fn release(object: &str) -> Value {
    json!({ "object": object })
}

/// A candidate in Kurento's `IceCandidate` complex-type encoding.
pub fn complex_candidate(candidate: &IceCandidate) -> Value {
    json!({
        "__module__": "kurento",
        "__type__": "IceCandidate",
        "candidate": candidate.candidate,
        "sdpMid": candidate.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": candidate.sdp_m_line_index.unwrap_or_default(),
    })
}

/// The `value` string carried by `create` and most `invoke` results.
pub fn result_value(result: &Value) -> MediaResult<String> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| MediaError::Protocol(format!("result without string value: {result}")))
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, MediaError>,
    },
    Candidate {
        object: String,
        candidate: IceCandidate,
    },
    /// Events and notifications Beacon does not consume.
    Ignored,
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct EventParams {
    value: EventValue,
}

#[derive(Deserialize)]
struct EventValue {
    #[serde(rename = "type")]
    kind: String,
    object: String,
    data: Value,
}

pub fn parse(text: &str) -> MediaResult<Incoming> {
    let frame: RawFrame = serde_json::from_str(text)?;

    if let Some(id) = frame.id {
        if let Some(err) = frame.error {
            return Ok(Incoming::Response {
                id,
                outcome: Err(MediaError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
            });
        }
        if frame.method.is_none() {
            return Ok(Incoming::Response {
                id,
                outcome: Ok(frame.result.unwrap_or(Value::Null)),
            });
        }
    }

    if frame.method.as_deref() != Some("onEvent") {
        return Ok(Incoming::Ignored);
    }
    let Some(params) = frame.params else {
        return Err(MediaError::Protocol("onEvent without params".into()));
    };
    let event: EventParams = serde_json::from_value(params)?;
    if event.value.kind != ICE_CANDIDATE_FOUND {
        return Ok(Incoming::Ignored);
    }
    let raw = event
        .value
        .data
        .get("candidate")
        .cloned()
        .ok_or_else(|| MediaError::Protocol("IceCandidateFound without candidate".into()))?;
    let candidate: IceCandidate = serde_json::from_value(raw)?;

    Ok(Incoming::Candidate {
        object: event.value.object,
        candidate,
    })
}
