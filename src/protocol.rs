// Copyright 2020 Joyent, Inc.

//! Wire messages exchanged over a request-tracking connection.
//!
//! Every application message is a single JSON object carried in one
//! WebSocket frame.  Inbound objects are decoded into a [`RequestMessage`],
//! which makes the "new work" versus "fetch" distinction explicit.  Outbound
//! objects are either a [`Response`] for a single request or the one-time
//! [`PendingSnapshot`] sent right after a connection is attached.

use std::fmt;
use std::str;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::Completion;

/// Error text returned when a fetch names an identifier the store has never
/// seen.
pub const NOT_FOUND_ERROR: &str = "Request ID not found";

/*
 * Values accepted in the optional "type" field.  Older clients always send
 * it; newer ones omit it and let the presence of "id" decide.
 */
const TYPE_NEW: &str = "new";
const TYPE_FETCH: &str = "fetch";

/// Server-generated identifier naming one work request.
///
/// Identifiers are opaque to clients; knowing one is sufficient to fetch the
/// request's result from any connection.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Allocate a fresh identifier.  Backed by a v4 UUID, so identifiers are
    /// never reused across the lifetime of a store.
    pub fn generate() -> RequestId {
        RequestId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> RequestId {
        RequestId(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> RequestId {
        RequestId(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid UTF-8: {0}")]
    Utf8(#[from] str::Utf8Error),
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("unsupported request type: {0}")]
    UnknownType(String),
    #[error("fetch request is missing an id")]
    MissingId,
    #[error("new request is missing data")]
    MissingData,
}

/// A decoded inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestMessage {
    /// Submit new work.  The server allocates the identifier.
    Submit { payload: Value },
    /// Look up the state of an existing request.
    Fetch { id: RequestId },
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(alias = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl RawRequest {
    fn classify(self) -> Result<RequestMessage, ProtocolError> {
        let id = self.id.filter(|id| !id.is_empty());

        match self.kind.as_deref() {
            Some(TYPE_NEW) => submit(self.data),
            Some(TYPE_FETCH) => match id {
                Some(id) => Ok(RequestMessage::Fetch { id: id.into() }),
                None => Err(ProtocolError::MissingId),
            },
            Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
            None => match id {
                Some(id) => Ok(RequestMessage::Fetch { id: id.into() }),
                None => submit(self.data),
            },
        }
    }
}

fn submit(data: Option<Value>) -> Result<RequestMessage, ProtocolError> {
    data.map(|payload| RequestMessage::Submit { payload })
        .ok_or(ProtocolError::MissingData)
}

/// Decode one inbound frame payload.
pub fn decode(buf: &[u8]) -> Result<RequestMessage, ProtocolError> {
    let text = str::from_utf8(buf)?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    let raw: RawRequest = serde_json::from_value(value)?;
    raw.classify()
}

/// Reply describing the current state of one request.
///
/// `result` and `error` are both absent while the request is pending (and in
/// the acknowledgement sent for new work).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn pending(id: RequestId) -> Response {
        Response {
            id,
            result: None,
            error: None,
        }
    }

    pub fn not_found(id: RequestId) -> Response {
        Response {
            id,
            result: None,
            error: Some(NOT_FOUND_ERROR.to_string()),
        }
    }

    pub fn completed(id: RequestId, completion: &Completion) -> Response {
        match completion {
            Completion::Processed(result) => Response {
                id,
                result: Some(result.clone()),
                error: None,
            },
            Completion::Failed(reason) => Response {
                id,
                result: None,
                error: Some(reason.clone()),
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }
}

/// Identifiers still pending at the moment a connection was attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub pending: Vec<RequestId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Snapshot(PendingSnapshot),
    Response(Response),
}

impl From<Response> for ServerMessage {
    fn from(r: Response) -> ServerMessage {
        ServerMessage::Response(r)
    }
}

impl From<PendingSnapshot> for ServerMessage {
    fn from(s: PendingSnapshot) -> ServerMessage {
        ServerMessage::Snapshot(s)
    }
}

pub fn encode(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Decode a server message.  Used by clients.
pub fn decode_server(buf: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let text = str::from_utf8(buf)?;
    Ok(serde_json::from_str(text)?)
}
