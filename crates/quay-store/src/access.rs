//! Boarding decisions.
//!
//! A user may board a vessel at an instant when some authorization for that
//! user and vessel is not revoked and its window contains the instant
//! (`validFrom <= at < validUntil`).

use chrono::{DateTime, Utc};
use quay_core::{parse_timestamp, EntityKind, RecordId};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::relational::{list_all, ListQuery, RelationalStore, StoredRecord};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    /// A valid authorization exists.
    Authorized,
    /// The user does not exist.
    UnknownUser,
    /// No authorization covers the instant.
    NoValidAuthorization,
}

/// The result of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    /// Whether boarding is allowed.
    pub allowed: bool,
    /// Why.
    pub reason: AccessReason,
    /// The authorization that allowed it.
    pub authorization_id: Option<String>,
}

impl AccessDecision {
    const fn denied(reason: AccessReason) -> Self {
        Self {
            allowed: false,
            reason,
            authorization_id: None,
        }
    }
}

fn covers(authorization: &StoredRecord, at: DateTime<Utc>) -> bool {
    if authorization.body.get("revoked").and_then(Value::as_bool) == Some(true) {
        return false;
    }
    let bound = |field: &str| {
        authorization
            .body
            .get(field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    };
    match (bound("validFrom"), bound("validUntil")) {
        (Some(from), Some(until)) => from <= at && at < until,
        _ => false,
    }
}

/// Decides whether `user` may board `vessel` at `at`.
///
/// # Errors
///
/// Returns a store error if the lookups fail.
pub async fn check_access(
    store: &dyn RelationalStore,
    user: &RecordId,
    vessel: &RecordId,
    at: DateTime<Utc>,
) -> Result<AccessDecision> {
    if store.get(EntityKind::User, user).await?.is_none() {
        return Ok(AccessDecision::denied(AccessReason::UnknownUser));
    }

    let authorizations = list_all(
        store,
        EntityKind::Authorization,
        ListQuery::new()
            .with_filter("userId", user.as_str())
            .with_filter("vesselId", vessel.as_str()),
    )
    .await?;

    let decision = authorizations
        .iter()
        .find(|a| covers(a, at))
        .map_or_else(
            || AccessDecision::denied(AccessReason::NoValidAuthorization),
            |a| AccessDecision {
                allowed: true,
                reason: AccessReason::Authorized,
                authorization_id: Some(a.id.clone()),
            },
        );

    tracing::debug!(
        user = %user,
        vessel = %vessel,
        at = %at,
        allowed = decision.allowed,
        "access checked"
    );
    Ok(decision)
}
