//! XMPP addresses: `local@domain/resource` and its bare/domain projections.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("Invalid JID format: {0}")]
    InvalidFormat(String),
    #[error("Unknown JID projection: {0}")]
    UnknownKind(String),
}

/// Which form of an address to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    /// `user@domain/resource`
    Full,
    /// `user@domain`
    Bare,
    /// `domain`
    Domain,
}

impl FromStr for JidKind {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(JidKind::Full),
            "bare" => Ok(JidKind::Bare),
            "domain" => Ok(JidKind::Domain),
            other => Err(JidError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            local: local.filter(|l| !l.is_empty()).map(str::to_string),
            domain: domain.to_string(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Render the requested projection of this address.
    pub fn project(&self, kind: JidKind) -> String {
        match kind {
            JidKind::Full => self.to_string(),
            JidKind::Bare => self.to_bare().to_string(),
            JidKind::Domain => self.domain.clone(),
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };
        if domain.is_empty() || domain.contains('@') {
            return Err(JidError::InvalidFormat(s.to_string()));
        }
        Ok(Jid::new(local, domain, resource))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
