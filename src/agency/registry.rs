//! Tenant registry: agency CRUD plus per-tenant storage provisioning.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::storage::StorageAdapter;

use super::{generate_agency_id, validate_agency_id, validate_category, Agency, AgencyFilter, AgencyPatch, AgencyStatus, NewAgency};

/// Maps an agency id to its logical database and ensures all per-tenant
/// collections exist before any service accepts writes against it.
///
/// Tenant handles (here, just the resolved database name) are cached by
/// agency id with a lifetime bound to the agency's existence, per the
/// source's note that re-resolving on every call is correct but wasteful;
/// the cache is evicted on delete.
pub struct TenantRegistry {
    storage: Arc<dyn StorageAdapter>,
    agencies: DashMap<String, Agency>,
    handle_cache: DashMap<String, String>,
}

impl TenantRegistry {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            agencies: DashMap::new(),
            handle_cache: DashMap::new(),
        }
    }

    /// Validates the new agency, persists the registry record, and
    /// provisions the tenant database and its collections. Provisioning
    /// runs to completion before this returns.
    pub async fn create_agency(&self, new: NewAgency, cancel: &CancellationToken) -> Result<Agency> {
        let id = match new.id {
            Some(id) => {
                validate_agency_id(&id)?;
                id
            }
            None => generate_agency_id(),
        };
        validate_category(&new.category)?;
        if self.agencies.contains_key(&id) {
            return Err(StorageError::DuplicateKey(id));
        }

        let now = Utc::now();
        let agency = Agency {
            database: id.clone(),
            id: id.clone(),
            display_name: new.display_name,
            category: new.category,
            status: new.status.unwrap_or(AgencyStatus::Active),
            created_at: now,
            updated_at: now,
        };

        self.storage.provision_tenant(&agency.database, cancel).await?;
        self.agencies.insert(id.clone(), agency.clone());
        self.handle_cache.insert(id, agency.database.clone());
        Ok(agency)
    }

    pub fn get_agency(&self, id: &str) -> Result<Agency> {
        self.agencies
            .get(id)
            .map(|a| a.clone())
            .ok_or_else(|| StorageError::not_found(format!("agency {id}")))
    }

    pub fn list_agencies(&self, filter: &AgencyFilter) -> Vec<Agency> {
        self.agencies
            .iter()
            .filter(|entry| {
                let agency = entry.value();
                filter.status.map(|s| s == agency.status).unwrap_or(true)
                    && filter
                        .category
                        .as_deref()
                        .map(|c| c == agency.category)
                        .unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn update_agency(&self, id: &str, patch: AgencyPatch) -> Result<Agency> {
        let mut entry = self
            .agencies
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(format!("agency {id}")))?;
        if let Some(display_name) = patch.display_name {
            entry.display_name = display_name;
        }
        if let Some(category) = patch.category {
            validate_category(&category)?;
            entry.category = category;
        }
        if let Some(status) = patch.status {
            entry.status = status;
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    /// Refuses to delete an active agency with [`StorageError::Conflict`],
    /// mirroring the corpus's last-owner-guard pattern for destructive
    /// operations on entities other state depends on.
    pub async fn delete_agency(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let agency = self.get_agency(id)?;
        if agency.status == AgencyStatus::Active {
            return Err(StorageError::conflict(format!(
                "agency {id} is active and cannot be deleted"
            )));
        }
        self.storage.deprovision_tenant(&agency.database, cancel).await?;
        self.agencies.remove(id);
        self.handle_cache.remove(id);
        Ok(())
    }

    /// Returns the tenant-scoped database handle used by the storage
    /// adapter, populating the cache on first resolution.
    pub fn resolve_database(&self, id: &str) -> Result<String> {
        if let Some(cached) = self.handle_cache.get(id) {
            return Ok(cached.clone());
        }
        let agency = self.get_agency(id)?;
        self.handle_cache.insert(id.to_string(), agency.database.clone());
        Ok(agency.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStorage;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(Arc::new(InMemoryStorage::new()))
    }

    fn new_agency(category: &str) -> NewAgency {
        NewAgency {
            id: None,
            display_name: "Water Authority".to_string(),
            category: category.to_string(),
            status: None,
        }
    }

    #[tokio::test]
    async fn create_agency_provisions_before_returning() {
        let reg = registry();
        let cancel = CancellationToken::new();
        let agency = reg.create_agency(new_agency("water_distribution"), &cancel).await.unwrap();
        assert_eq!(agency.status, AgencyStatus::Active);
        assert_eq!(reg.resolve_database(&agency.id).unwrap(), agency.database);
    }

    #[tokio::test]
    async fn deleting_active_agency_is_refused() {
        let reg = registry();
        let cancel = CancellationToken::new();
        let agency = reg.create_agency(new_agency("default"), &cancel).await.unwrap();
        let err = reg.delete_agency(&agency.id, &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleting_inactive_agency_succeeds() {
        let reg = registry();
        let cancel = CancellationToken::new();
        let agency = reg.create_agency(new_agency("default"), &cancel).await.unwrap();
        reg.update_agency(
            &agency.id,
            AgencyPatch {
                status: Some(AgencyStatus::Archived),
                ..Default::default()
            },
        )
        .unwrap();
        reg.delete_agency(&agency.id, &cancel).await.unwrap();
        assert!(reg.get_agency(&agency.id).is_err());
    }

    #[tokio::test]
    async fn unknown_category_rejected_before_provisioning() {
        let reg = registry();
        let cancel = CancellationToken::new();
        assert!(reg.create_agency(new_agency("not_real"), &cancel).await.is_err());
    }
}
