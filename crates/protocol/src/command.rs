//! Inbound command envelopes
//!
//! Decoding happens in two steps. `Request::parse` turns a frame into a JSON
//! object and extracts the channel and the `cmd` discriminator; failure here
//! is a malformed message. `Request::decode` then validates the fields of a
//! known command into a typed `Command`.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    MalformedJson(String),

    #[error("Unknown command")]
    UnknownCommand,

    #[error("Invalid {cmd} command: {source}")]
    InvalidCommand {
        cmd: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Names of the commands the gateway understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Auth,
    Watch,
    GetVerify,
    SignPut,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::Auth),
            "watch" => Some(Self::Watch),
            "get-verify" => Some(Self::GetVerify),
            "sign-put" => Some(Self::SignPut),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Watch => "watch",
            Self::GetVerify => "get-verify",
            Self::SignPut => "sign-put",
        }
    }

    /// Whether the command may only be issued by an authenticated session
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Auth)
    }
}

/// A parsed but not yet validated inbound message
#[derive(Debug, Clone)]
pub struct Request {
    ch: Value,
    kind: Option<CommandKind>,
    body: Value,
}

impl Request {
    /// Parse one frame's text into a request envelope.
    ///
    /// Anything that is not a JSON object fails with `DecodeError::MalformedJson`.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
        if !value.is_object() {
            return Err(DecodeError::MalformedJson(
                "message is not a JSON object".to_string(),
            ));
        }

        let ch = value.get("ch").cloned().unwrap_or(Value::Null);
        let kind = value
            .get("cmd")
            .and_then(Value::as_str)
            .and_then(CommandKind::from_name);

        Ok(Self {
            ch,
            kind,
            body: value,
        })
    }

    /// The client-chosen channel, echoed verbatim in every response
    pub fn ch(&self) -> &Value {
        &self.ch
    }

    /// The command discriminator, `None` when missing or not understood
    pub fn kind(&self) -> Option<CommandKind> {
        self.kind
    }

    /// Validate the fields of a known command
    pub fn decode(&self) -> Result<Command, DecodeError> {
        let kind = self.kind.ok_or(DecodeError::UnknownCommand)?;
        let body = &self.body;
        let command = match kind {
            CommandKind::Auth => AuthRequest::deserialize(body).map(Command::Auth),
            CommandKind::Watch => WatchRequest::deserialize(body).map(Command::Watch),
            CommandKind::GetVerify => GetVerifyRequest::deserialize(body).map(Command::GetVerify),
            CommandKind::SignPut => SignPutRequest::deserialize(body).map(Command::SignPut),
        };
        command.map_err(|source| DecodeError::InvalidCommand {
            cmd: kind.as_str(),
            source,
        })
    }
}

/// A validated inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Auth(AuthRequest),
    Watch(WatchRequest),
    GetVerify(GetVerifyRequest),
    SignPut(SignPutRequest),
}

/// `auth` command. All fields are optional so that any incomplete
/// attempt is treated as failed credentials.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AuthRequest {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl AuthRequest {
    /// Username and password of a `basic` authentication, if this is one
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        if self.kind.as_deref() != Some("basic") {
            return None;
        }
        Some((self.user.as_deref()?, self.password.as_deref()?))
    }
}

/// `watch` command
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WatchRequest {
    #[serde(rename = "lastModifiedAfter", default)]
    pub last_modified_after: Option<u64>,

    #[serde(default)]
    pub flags: Option<u32>,

    #[serde(default)]
    pub filter: Option<FilterSpec>,
}

impl WatchRequest {
    /// Start of the watch window, 0 meaning from the beginning
    pub fn last_modified_after(&self) -> u64 {
        self.last_modified_after.unwrap_or(0)
    }

    /// Flags to forward to the archive tool; 0 means none
    pub fn flags(&self) -> Option<u32> {
        self.flags.filter(|flags| *flags != 0)
    }
}

/// Filter descriptor attached to a `watch` command.
///
/// Deserialization is lenient; the descriptor is validated when the
/// filter is built.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub ns: Option<String>,
}

/// `get-verify` command
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetVerifyRequest {
    #[serde(rename = "ref")]
    pub reference: String,
}

/// `sign-put` command
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignPutRequest {
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_extracts_channel_and_kind() {
        let req = Request::parse(r#"{"cmd":"get-verify","ch":7,"ref":"sha3-224-00"}"#).unwrap();

        assert_eq!(req.ch(), &json!(7));
        assert_eq!(req.kind(), Some(CommandKind::GetVerify));

        match req.decode() {
            Ok(Command::GetVerify(get)) => assert_eq!(get.reference, "sha3-224-00"),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_channel_is_opaque() {
        let req = Request::parse(r#"{"cmd":"nope","ch":{"a":[1,"b"]}}"#).unwrap();
        assert_eq!(req.ch(), &json!({"a": [1, "b"]}));
        assert_eq!(req.kind(), None);
        assert!(matches!(req.decode(), Err(DecodeError::UnknownCommand)));
    }

    #[test]
    fn test_missing_channel_is_null() {
        let req = Request::parse(r#"{"cmd":"auth"}"#).unwrap();
        assert_eq!(req.ch(), &Value::Null);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Request::parse("{not json"),
            Err(DecodeError::MalformedJson(_))
        ));
        assert!(matches!(
            Request::parse("[1,2]"),
            Err(DecodeError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_non_string_cmd_is_unknown() {
        let req = Request::parse(r#"{"cmd":5,"ch":"x"}"#).unwrap();
        assert_eq!(req.kind(), None);
    }

    #[test]
    fn test_missing_required_field() {
        let req = Request::parse(r#"{"cmd":"sign-put","ch":"x"}"#).unwrap();
        match req.decode() {
            Err(DecodeError::InvalidCommand { cmd, .. }) => assert_eq!(cmd, "sign-put"),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_watch_defaults() {
        let req = Request::parse(r#"{"cmd":"watch","ch":1,"lastModifiedAfter":null}"#).unwrap();
        let Ok(Command::Watch(watch)) = req.decode() else {
            panic!("expected watch");
        };
        assert_eq!(watch.last_modified_after(), 0);
        assert_eq!(watch.flags(), None);
        assert_eq!(watch.filter, None);
    }

    #[test]
    fn test_watch_with_filter() {
        let req = Request::parse(
            r#"{"cmd":"watch","ch":1,"lastModifiedAfter":99,"flags":0,
                "filter":{"type":"namespace","ns":"https://example.org/ns"}}"#,
        )
        .unwrap();
        let Ok(Command::Watch(watch)) = req.decode() else {
            panic!("expected watch");
        };
        assert_eq!(watch.last_modified_after(), 99);
        // zero flags are not forwarded
        assert_eq!(watch.flags(), None);
        let filter = watch.filter.unwrap();
        assert_eq!(filter.kind.as_deref(), Some("namespace"));
        assert_eq!(filter.ns.as_deref(), Some("https://example.org/ns"));
    }

    #[test]
    fn test_basic_credentials() {
        let auth = AuthRequest {
            kind: Some("basic".to_string()),
            user: Some("alice".to_string()),
            password: Some("pw".to_string()),
        };
        assert_eq!(auth.basic_credentials(), Some(("alice", "pw")));

        let other = AuthRequest {
            kind: Some("token".to_string()),
            ..auth.clone()
        };
        assert_eq!(other.basic_credentials(), None);

        let no_password = AuthRequest {
            password: None,
            ..auth
        };
        assert_eq!(no_password.basic_credentials(), None);
    }
}
