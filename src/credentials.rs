//! Login payload normalization for password and anonymous logins.
//!
//! Both modes hand the protocol client a fully qualified identity
//! (`local@domain[/resource]`, or `@domain[/resource]` for anonymous logins).

use crate::error::CredentialsError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Raw `xmpp.login` / `xmpp.login.anonymous` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default, alias = "identity")]
    pub jid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    /// Create the account with in-band registration before authenticating.
    #[serde(default)]
    pub register: bool,
}

impl LoginRequest {
    /// Lenient decode: anything that is not a matching object is an empty request.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    Anonymous,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Anonymous => "ANONYMOUS",
        }
    }
}

/// Credentials in the form the protocol client expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Fully qualified identity, resource included when known.
    pub jid: String,
    pub password: Option<String>,
    pub resource: Option<String>,
    /// Explicit server to connect to instead of resolving the domain.
    pub host: Option<String>,
    /// Only set for anonymous logins.
    pub preferred_mechanism: Option<SaslMechanism>,
    pub register: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub credentials: Credentials,
    pub domain: String,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn split_resource(jid: &str) -> (&str, Option<&str>) {
    match jid.split_once('/') {
        Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
        Some((bare, _)) => (bare, None),
        None => (jid, None),
    }
}

/// Normalize a password login.
///
/// An identity without a domain gets the request host (or `default_host`)
/// appended. A resource in the identity wins over the `resource` field.
pub fn normalize_password_login(
    request: &LoginRequest,
    default_host: Option<&str>,
) -> Result<Normalized, CredentialsError> {
    info!(jid = ?request.jid, "Attempting to connect");

    let (Some(jid), Some(password)) = (non_empty(&request.jid), non_empty(&request.password))
    else {
        return Err(CredentialsError::MissingFields);
    };

    let (bare, jid_resource) = split_resource(jid);
    let bare = if bare.contains('@') {
        bare.to_string()
    } else {
        let host = non_empty(&request.host)
            .or(default_host.filter(|h| !h.is_empty()))
            .ok_or(CredentialsError::MissingHost)?;
        format!("{}@{}", bare, host)
    };
    let domain = match bare.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain.to_string(),
        _ => return Err(CredentialsError::MissingHost),
    };

    let resource = jid_resource
        .or(non_empty(&request.resource))
        .map(str::to_string);
    let jid = match &resource {
        Some(resource) => format!("{}/{}", bare, resource),
        None => bare,
    };

    Ok(Normalized {
        credentials: Credentials {
            jid,
            password: Some(password.to_string()),
            resource,
            host: non_empty(&request.host).map(str::to_string),
            preferred_mechanism: None,
            register: request.register,
        },
        domain,
    })
}

/// Normalize an anonymous login. Anonymous identities are domain-only, so a
/// local part is discarded.
pub fn normalize_anonymous_login(request: &LoginRequest) -> Result<Normalized, CredentialsError> {
    let jid = non_empty(&request.jid).ok_or(CredentialsError::MissingJid)?;
    info!(jid, "Attempting anonymous connection");

    let after_local = jid.split_once('@').map_or(jid, |(_, rest)| rest);
    let (domain, jid_resource) = split_resource(after_local);
    if domain.is_empty() {
        return Err(CredentialsError::MissingJid);
    }

    let resource = jid_resource
        .or(non_empty(&request.resource))
        .map(str::to_string);
    let mut qualified = format!("@{}", domain);
    if let Some(resource) = &resource {
        qualified.push('/');
        qualified.push_str(resource);
    }

    Ok(Normalized {
        credentials: Credentials {
            jid: qualified,
            password: None,
            resource,
            host: non_empty(&request.host).map(str::to_string),
            preferred_mechanism: Some(SaslMechanism::Anonymous),
            register: false,
        },
        domain: domain.to_string(),
    })
}
