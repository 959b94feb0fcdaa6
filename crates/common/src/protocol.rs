// Wire message types for the syncwire session protocol.
//
// Every message is a JSON object tagged by its `msg` field. Unknown inbound
// tags fail to decode; the session core logs and discards them rather than
// tearing down the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{DocId, Document, MethodError, MethodId, SubId};

/// Protocol revisions this implementation can speak, preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1", "pre2", "pre1"];

#[must_use]
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Error produced while encoding or decoding a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode wire message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode wire message: {0}")]
    Encode(serde_json::Error),
}

/// Client -> Server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Session handshake. Sent on every transport reset, including the first.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        version: String,
        support: Vec<String>,
    },

    /// Invoke a named remote method.
    Method {
        method: String,
        params: Vec<Value>,
        id: MethodId,
        #[serde(
            default,
            rename = "randomSeed",
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },

    /// Subscribe to a named record set.
    Sub { id: SubId, name: String, params: Vec<Value> },

    /// Cancel a subscription.
    Unsub { id: SubId },

    /// Heartbeat probe.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Heartbeat response.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientMessage {
    pub fn to_wire(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }
}

/// Server -> Client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake accepted; `session` identifies the server-side session.
    Connected { session: String },

    /// Handshake rejected; `version` is the server's counter-proposal.
    Failed { version: String },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// A document entered one of the client's record sets.
    Added {
        collection: String,
        id: DocId,
        #[serde(default)]
        fields: Document,
    },

    /// Top-level fields of a tracked document changed.
    Changed {
        collection: String,
        id: DocId,
        #[serde(default)]
        fields: Document,
        #[serde(default)]
        cleared: Vec<String>,
    },

    /// A document left all of the client's record sets.
    Removed { collection: String, id: DocId },

    /// The named subscriptions have delivered their initial data.
    Ready { subs: Vec<SubId> },

    /// The named methods' writes have all been delivered ("data done").
    Updated { methods: Vec<MethodId> },

    /// A subscription terminated, possibly with an error.
    Nosub {
        id: SubId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },

    /// Outcome of a method invocation.
    Result {
        id: MethodId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },

    /// Server-side protocol complaint about something the client sent.
    Error {
        reason: String,
        #[serde(
            default,
            rename = "offendingMessage",
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
}

impl ServerMessage {
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Data messages are the subset subject to quiescence buffering.
    #[must_use]
    pub fn is_data_message(&self) -> bool {
        matches!(
            self,
            Self::Added { .. }
                | Self::Changed { .. }
                | Self::Removed { .. }
                | Self::Ready { .. }
                | Self::Updated { .. }
        )
    }
}
