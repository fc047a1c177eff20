//! Agency (tenant) entity and the registry that provisions tenant storage.
//!
//! An agency is the unit of isolation: every other collection in this
//! crate is scoped to exactly one agency's logical database. The registry
//! itself lives in a single global database shared across tenants.

mod registry;

pub use registry::TenantRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Lifecycle status of an agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgencyStatus {
    Active,
    Inactive,
    Paused,
    Archived,
}

impl Default for AgencyStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A tenant record in the global registry database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    #[serde(rename = "_key")]
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub status: AgencyStatus,
    pub database: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`TenantRegistry::create_agency`].
#[derive(Debug, Clone)]
pub struct NewAgency {
    pub id: Option<String>,
    pub display_name: String,
    pub category: String,
    pub status: Option<AgencyStatus>,
}

/// Partial update accepted by [`TenantRegistry::update_agency`].
#[derive(Debug, Clone, Default)]
pub struct AgencyPatch {
    pub display_name: Option<String>,
    pub category: Option<String>,
    pub status: Option<AgencyStatus>,
}

/// Filters accepted by [`TenantRegistry::list_agencies`].
#[derive(Debug, Clone, Default)]
pub struct AgencyFilter {
    pub status: Option<AgencyStatus>,
    pub category: Option<String>,
}

/// Generate a fresh `agency_` + 32 hex char id.
pub fn generate_agency_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("agency_{hex}")
}

/// Validate a tenant id against the `agency_<32-hex>` format, accepting a
/// 36-character hyphenated UUID for legacy records.
pub fn validate_agency_id(id: &str) -> Result<()> {
    if let Some(hex) = id.strip_prefix("agency_") {
        if hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(());
        }
        return Err(StorageError::invalid_argument(format!(
            "agency id '{id}' has agency_ prefix but is not followed by 32 hex chars"
        )));
    }
    if Uuid::parse_str(id).is_ok() && id.len() == 36 {
        return Ok(());
    }
    Err(StorageError::invalid_argument(format!(
        "agency id '{id}' is neither agency_<32-hex> nor a legacy UUID"
    )))
}

const VALID_CATEGORIES: &[&str] = &["default", "water_distribution", "logistics", "custom"];

pub fn validate_category(category: &str) -> Result<()> {
    if VALID_CATEGORIES.contains(&category) {
        Ok(())
    } else {
        Err(StorageError::invalid_argument(format!(
            "unknown agency category '{category}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_valid() {
        let id = generate_agency_id();
        assert!(validate_agency_id(&id).is_ok());
        assert!(id.starts_with("agency_"));
        assert_eq!(id.len(), "agency_".len() + 32);
    }

    #[test]
    fn legacy_uuid_is_accepted() {
        assert!(validate_agency_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn malformed_id_is_rejected() {
        assert!(validate_agency_id("agency_tooshort").is_err());
        assert!(validate_agency_id("not-an-id-at-all").is_err());
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert!(validate_category("not_a_category").is_err());
        assert!(validate_category("default").is_ok());
    }
}
