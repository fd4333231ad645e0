//! JID parsing and classification
//!
//! A JID is `[node@]domain[/resource]`. The bare form (no resource) names an
//! account or a room; the full form names a connected resource or a room
//! occupant.

use crate::error::XmppError;
use std::fmt;

/// A parsed Jabber identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse a JID from its text form.
    ///
    /// Empty node, domain, or resource parts are rejected, as is a bare `@`
    /// or trailing `/`.
    pub fn parse(s: &str) -> Result<Self, XmppError> {
        let (account, resource) = match s.split_once('/') {
            Some((a, r)) => (a, Some(r)),
            None => (s, None),
        };
        let (node, domain) = match account.split_once('@') {
            Some((n, d)) => (Some(n), d),
            None => (None, account),
        };
        if domain.is_empty()
            || node.is_some_and(|n| n.is_empty())
            || resource.is_some_and(|r| r.is_empty())
        {
            return Err(XmppError::InvalidJid(s.to_string()));
        }
        Ok(Self {
            node: node.map(str::to_string),
            domain: domain.to_string(),
            resource: resource.map(str::to_string),
        })
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The bare JID (resource stripped).
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// This JID with the given resource attached.
    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Jid {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}
