//! Outbound response envelopes

use crate::ModifiedClaimSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exit code reported for failures that did not come from the archive tool
pub const PROTOCOL_ERROR_CODE: i32 = 1;

/// A response tied to the channel of the request that caused it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub ch: Value,

    #[serde(flatten)]
    pub status: Status,
}

/// Response status and its status-specific fields
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Status {
    Authenticated,
    Unauthenticated,
    Unknown,
    BlobModified(ModifiedClaimSet),
    Get {
        body: String,
    },
    Put {
        #[serde(rename = "ref")]
        reference: String,
    },
    Error {
        #[serde(rename = "errorCode")]
        error_code: i32,
    },
}

impl Response {
    pub fn new(ch: Value, status: Status) -> Self {
        Self { ch, status }
    }

    /// Serialize into the text of one WebSocket frame
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
