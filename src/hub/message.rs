//! Push-channel wire messages.
//!
//! JSON objects with camelCase keys. Client frames are tagged by `action`,
//! server frames by `type`.

use serde::{Deserialize, Serialize};

use crate::watch::ChangeType;

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        connection_id: String,
        #[serde(default)]
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        connection_id: String,
        #[serde(default)]
        path: String,
    },
    Ping,
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Subscribed { connection_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { connection_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    DirectoryChanged {
        connection_id: String,
        path: String,
        change: ChangeType,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        sequence: u64,
    },
    #[serde(rename_all = "camelCase")]
    MonitoringLost {
        connection_id: String,
        path: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// An error not tied to any directory.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            connection_id: None,
            path: None,
            message: message.into(),
        }
    }
}
