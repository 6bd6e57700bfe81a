//! Stable identifiers.
//!
//! `NodeId` wraps a ULID so identifiers are both opaque and monotonically
//! sortable by creation order, per spec §3 — grounded on the teacher's use
//! of `ulid` for entity identifiers (`core/src/entity.rs`'s `ID` newtype).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Ulid);

impl NodeId {
    pub fn new() -> Self { Self(Ulid::new()) }
}

impl Default for NodeId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl FromStr for NodeId {
    type Err = ulid::DecodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Ok(Self(Ulid::from_str(s)?)) }
}

/// The closed set of system-identifier prefixes allowed by spec §3.
/// Parsed once at the storage boundary; internal APIs carry the variant
/// plus remainder rather than re-checking string prefixes everywhere
/// (spec §9, "Runtime string system_id prefix checks").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemId {
    Field(String),
    Supertag(String),
    Item(String),
}

impl SystemId {
    pub fn as_str_owned(&self) -> String {
        match self {
            SystemId::Field(rest) => format!("field:{rest}"),
            SystemId::Supertag(rest) => format!("supertag:{rest}"),
            SystemId::Item(rest) => format!("item:{rest}"),
        }
    }

    pub fn remainder(&self) -> &str {
        match self {
            SystemId::Field(rest) | SystemId::Supertag(rest) | SystemId::Item(rest) => rest,
        }
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.as_str_owned()) }
}

impl TryFrom<&str> for SystemId {
    type Error = crate::error::ValidationError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if let Some(rest) = s.strip_prefix("field:") {
            Ok(SystemId::Field(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("supertag:") {
            Ok(SystemId::Supertag(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("item:") {
            Ok(SystemId::Item(rest.to_string()))
        } else {
            Err(crate::error::ValidationError::InvalidSystemId(s.to_string()))
        }
    }
}

/// Well-known field system ids, seeded at bootstrap (spec §6).
pub mod well_known {
    pub const FIELD_SUPERTAG: &str = "field:supertag";
    pub const FIELD_EXTENDS: &str = "field:extends";
    pub const FIELD_TYPE: &str = "field:field_type";
    pub const FIELD_DEFINITION: &str = "field:definition";

    pub const SUPERTAG_SUPERTAG: &str = "supertag:supertag";
    pub const SUPERTAG_FIELD: &str = "supertag:field";
    pub const SUPERTAG_SYSTEM: &str = "supertag:system";
    pub const SUPERTAG_AUTOMATION: &str = "supertag:automation";
    pub const SUPERTAG_COMPUTED_FIELD: &str = "supertag:computed_field";
}
