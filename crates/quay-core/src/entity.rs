//! The entity catalogue: kinds, collections, and field rules.
//!
//! Every stored record belongs to exactly one [`EntityKind`]. The kind fixes
//! the relational table and document collection it lives in, whether edge
//! devices may push it through the sync protocol, and which fields CRUD
//! writes must carry.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::record::{json_type, Fields};

/// A kind of entity tracked by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// A company owning vessels and employing users.
    Company,
    /// A vessel.
    Vessel,
    /// A vessel's stay in a port area.
    Docking,
    /// An access portal (gate, gangway reader).
    Portal,
    /// A supervisor responsible for a company's personnel.
    Supervisor,
    /// A person who may board vessels.
    User,
    /// An entry or exit observed at a portal.
    Event,
    /// Permission for a user to board a vessel during a window.
    Authorization,
    /// A credential or certificate held by a user.
    Document,
    /// A beacon or sensor placed in an area.
    Beacon,
    /// A port area.
    Area,
}

impl EntityKind {
    /// All entity kinds, in catalogue order.
    pub const ALL: [Self; 11] = [
        Self::Company,
        Self::Vessel,
        Self::Docking,
        Self::Portal,
        Self::Supervisor,
        Self::User,
        Self::Event,
        Self::Authorization,
        Self::Document,
        Self::Beacon,
        Self::Area,
    ];

    /// Kinds accepted by the batched sync protocol.
    pub const SYNCABLE: [Self; 7] = [
        Self::Event,
        Self::Company,
        Self::Vessel,
        Self::Docking,
        Self::Portal,
        Self::Supervisor,
        Self::User,
    ];

    /// Returns the canonical entity name (`"Event"`, `"Vessel"`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Company => "Company",
            Self::Vessel => "Vessel",
            Self::Docking => "Docking",
            Self::Portal => "Portal",
            Self::Supervisor => "Supervisor",
            Self::User => "User",
            Self::Event => "Event",
            Self::Authorization => "Authorization",
            Self::Document => "Document",
            Self::Beacon => "Beacon",
            Self::Area => "Area",
        }
    }

    /// Returns the collection name used for tables, documents and URLs.
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Company => "companies",
            Self::Vessel => "vessels",
            Self::Docking => "dockings",
            Self::Portal => "portals",
            Self::Supervisor => "supervisors",
            Self::User => "users",
            Self::Event => "events",
            Self::Authorization => "authorizations",
            Self::Document => "documents",
            Self::Beacon => "beacons",
            Self::Area => "areas",
        }
    }

    /// Returns true if edge devices may push this kind through sync.
    #[must_use]
    pub fn is_syncable(self) -> bool {
        Self::SYNCABLE.contains(&self)
    }

    /// Looks up a kind by entity name, ignoring ASCII case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    /// Looks up a kind by its collection name.
    #[must_use]
    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection() == collection)
    }

    /// Returns the field rules applied to CRUD writes of this kind.
    #[must_use]
    pub const fn rules(self) -> &'static [FieldRule] {
        match self {
            Self::Company | Self::Area => NAMED_RULES,
            Self::Vessel | Self::Supervisor => COMPANY_MEMBER_RULES,
            Self::User => USER_RULES,
            Self::Docking => DOCKING_RULES,
            Self::Portal => PORTAL_RULES,
            Self::Event => EVENT_RULES,
            Self::Authorization => AUTHORIZATION_RULES,
            Self::Document => DOCUMENT_RULES,
            Self::Beacon => BEACON_RULES,
        }
    }

    /// Validates and normalises a full body for a create.
    ///
    /// Required fields must be present; timestamps are rewritten to UTC with
    /// millisecond precision. Unknown fields pass through untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the first offending field.
    pub fn validate_create(self, body: &mut Fields) -> Result<()> {
        for rule in self.rules() {
            match body.get_mut(rule.name) {
                Some(value) => rule.check(value)?,
                None if rule.required => {
                    return Err(Error::invalid_field(rule.name, "is required"));
                }
                None => {}
            }
        }
        self.check_invariants(body)
    }

    /// Validates and normalises the fields present in a partial update.
    ///
    /// Cross-field rules are checked separately on the merged body with
    /// [`EntityKind::check_invariants`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the first offending field.
    pub fn validate_patch(self, patch: &mut Fields) -> Result<()> {
        for rule in self.rules() {
            if let Some(value) = patch.get_mut(rule.name) {
                if value.is_null() && rule.required {
                    return Err(Error::invalid_field(rule.name, "cannot be removed"));
                }
                rule.check(value)?;
            }
        }
        Ok(())
    }

    /// Checks rules spanning several fields of a complete body.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a rule is violated.
    pub fn check_invariants(self, body: &Fields) -> Result<()> {
        if self == Self::Authorization {
            let from = body.get("validFrom").and_then(Value::as_str).and_then(parse_timestamp);
            let until = body.get("validUntil").and_then(Value::as_str).and_then(parse_timestamp);
            if let (Some(from), Some(until)) = (from, until) {
                if from >= until {
                    return Err(Error::invalid_field(
                        "validUntil",
                        "must be after validFrom",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::UnknownEntity {
            name: s.to_string(),
        })
    }
}

const NAMED_RULES: &[FieldRule] = &[FieldRule::required("name", FieldType::Text)];

const COMPANY_MEMBER_RULES: &[FieldRule] = &[
    FieldRule::required("name", FieldType::Text),
    FieldRule::required("companyId", FieldType::Reference),
];

const USER_RULES: &[FieldRule] = &[
    FieldRule::required("name", FieldType::Text),
    FieldRule::required("companyId", FieldType::Reference),
    FieldRule::optional("role", FieldType::Text),
];

const DOCKING_RULES: &[FieldRule] = &[
    FieldRule::required("vesselId", FieldType::Reference),
    FieldRule::required("areaId", FieldType::Reference),
    FieldRule::required("arrivedAt", FieldType::Timestamp),
    FieldRule::optional("departedAt", FieldType::Timestamp),
];

const PORTAL_RULES: &[FieldRule] = &[
    FieldRule::required("name", FieldType::Text),
    FieldRule::required("areaId", FieldType::Reference),
];

const EVENT_RULES: &[FieldRule] = &[
    FieldRule::required("userId", FieldType::Reference),
    FieldRule::required("portalId", FieldType::Reference),
    FieldRule::required("kind", FieldType::OneOf(&["entry", "exit"])),
    FieldRule::required("occurredAt", FieldType::Timestamp),
    FieldRule::optional("vesselId", FieldType::Reference),
    FieldRule::optional("beaconId", FieldType::Reference),
];

const AUTHORIZATION_RULES: &[FieldRule] = &[
    FieldRule::required("userId", FieldType::Reference),
    FieldRule::required("vesselId", FieldType::Reference),
    FieldRule::required("validFrom", FieldType::Timestamp),
    FieldRule::required("validUntil", FieldType::Timestamp),
    FieldRule::optional("revoked", FieldType::Bool),
];

const DOCUMENT_RULES: &[FieldRule] = &[
    FieldRule::required("ownerId", FieldType::Reference),
    FieldRule::required("title", FieldType::Text),
    FieldRule::optional("expiresAt", FieldType::Timestamp),
];

const BEACON_RULES: &[FieldRule] = &[
    FieldRule::required("label", FieldType::Text),
    FieldRule::required("areaId", FieldType::Reference),
];

/// The shape a field must have on CRUD writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A non-empty string.
    Text,
    /// A non-empty string naming another record.
    Reference,
    /// An RFC 3339 timestamp.
    Timestamp,
    /// A boolean.
    Bool,
    /// One of a fixed set of strings.
    OneOf(&'static [&'static str]),
}

/// A named field and its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    /// Field name in the JSON body.
    pub name: &'static str,
    /// Expected type.
    pub ty: FieldType,
    /// Whether creates must supply the field.
    pub required: bool,
}

impl FieldRule {
    const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }

    fn check(&self, value: &mut Value) -> Result<()> {
        if value.is_null() && !self.required {
            return Ok(());
        }
        match self.ty {
            FieldType::Text | FieldType::Reference => match value.as_str() {
                Some(s) if !s.trim().is_empty() => Ok(()),
                _ => Err(Error::invalid_field(self.name, "must be a non-empty string")),
            },
            FieldType::Bool => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    Err(Error::invalid_field(
                        self.name,
                        format!("must be a boolean, got {}", json_type(value)),
                    ))
                }
            }
            FieldType::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.contains(&s) => Ok(()),
                _ => Err(Error::invalid_field(
                    self.name,
                    format!("must be one of {}", allowed.join(", ")),
                )),
            },
            FieldType::Timestamp => {
                let parsed = value.as_str().and_then(parse_timestamp).ok_or_else(|| {
                    Error::invalid_field(self.name, "must be an RFC 3339 timestamp")
                })?;
                *value = Value::String(format_timestamp(parsed));
                Ok(())
            }
        }
    }
}

/// Parses an RFC 3339 timestamp into UTC.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Formats a timestamp the way stored records carry it.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
