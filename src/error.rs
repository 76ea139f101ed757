//! Error types and their translation into socket notifications.

use crate::stanza::Element;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Login payload could not be turned into credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    #[error("Missing jid and/or password")]
    MissingFields,
    #[error("Missing host for unqualified jid")]
    MissingHost,
    /// Anonymous login without an identity; dropped without notification.
    #[error("Missing jid")]
    MissingJid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    #[error("Malformed XML: {0}")]
    Malformed(String),
    #[error("Incomplete XML element")]
    Incomplete,
}

/// Why a tracked stanza will never see its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("No reply within the tracking timeout")]
    Timeout,
    #[error("Not connected")]
    NotSent,
    #[error("Connection closed before the reply arrived")]
    Disconnected,
    #[error("Superseded by a request with the same id")]
    Replaced,
}

impl ReplyError {
    /// Socket view, shaped like a stanza error.
    pub fn notification(&self) -> ErrorNotification {
        let (kind, condition) = match self {
            Self::Timeout => ("wait", "remote-server-timeout"),
            Self::NotSent | Self::Disconnected => ("cancel", "service-unavailable"),
            Self::Replaced => ("cancel", "conflict"),
        };
        ErrorNotification::new(kind, condition, self.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures reported by the protocol client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("Failed to connect to XMPP server: {0}")]
    Connect(String),
    #[error("TLS: {0}")]
    Tls(String),
    #[error("Authentication failed: {condition}")]
    Auth {
        condition: String,
        text: Option<String>,
    },
    /// In-band registration rejected by the server.
    #[error("Registration error")]
    Registration { condition: String },
    #[error("Resource binding failed: {0}")]
    Bind(String),
    #[error("Stream error: {condition}")]
    Stream {
        condition: String,
        text: Option<String>,
    },
    #[error("Unexpected <{}> during {stage}", .stanza.name())]
    Unexpected { stage: &'static str, stanza: Element },
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl ClientError {
    /// Static label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Tls(_) => "tls",
            Self::Auth { .. } => "auth",
            Self::Registration { .. } => "registration",
            Self::Bind(_) => "bind",
            Self::Stream { .. } => "stream",
            Self::Unexpected { .. } => "unexpected",
            Self::Closed(_) => "closed",
            Self::Io(_) => "io",
        }
    }

    pub fn is_registration_cancelled(&self) -> bool {
        matches!(self, Self::Registration { .. })
    }

    /// Serializable view of the error. An attached stanza is reduced to its
    /// `id` so the report never embeds the element tree it came from.
    pub fn report(&self) -> ErrorReport {
        let (condition, text, stanza) = match self {
            Self::Auth { condition, text } | Self::Stream { condition, text } => {
                (Some(condition.clone()), text.clone(), None)
            }
            Self::Registration { condition } => (Some(condition.clone()), None, None),
            Self::Unexpected { stanza, .. } => (None, None, stanza.id().map(str::to_string)),
            _ => (None, None, None),
        };
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            condition,
            text,
            stanza,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stanza: Option<String>,
}

/// Payload of an `xmpp.error` socket notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub condition: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl ErrorNotification {
    pub fn new(kind: &str, condition: &str, description: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            condition: condition.to_string(),
            description: description.into(),
            request: None,
        }
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request = Some(request);
        self
    }

    /// Rejected login payload.
    pub fn client_error(err: &CredentialsError, request: Value) -> Self {
        Self::new("auth", "client-error", err.to_string()).with_request(request)
    }

    pub fn from_client_error(err: &ClientError) -> Self {
        if err.is_registration_cancelled() {
            return Self::new("auth", "cancel", err.to_string());
        }
        let description =
            serde_json::to_string(&err.report()).unwrap_or_else(|_| err.to_string());
        Self::new("cancel", "unknown", description)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
