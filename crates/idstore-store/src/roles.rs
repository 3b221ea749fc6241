//! Role records.

use serde_json::json;
use uuid::Uuid;

use crate::accessor::FieldProjectionAccessor;
use crate::collection::DocumentCollection;
use crate::error::Result;
use crate::filter::Filter;
use crate::models::{Claim, RoleRecord};

/// Record access for the roles collection.
pub struct RoleStore<'c> {
    roles: FieldProjectionAccessor<'c, RoleRecord>,
}

impl<'c> RoleStore<'c> {
    pub fn new(roles: &'c dyn DocumentCollection) -> Self {
        Self {
            roles: FieldProjectionAccessor::new(roles),
        }
    }

    // ------------------------------------------------------------------
    // Whole-document operations
    // ------------------------------------------------------------------

    pub fn create(&self, role: &RoleRecord) -> Result<()> {
        self.roles.whole_document().insert(role)?;
        Ok(())
    }

    /// Save every field of `role`, overwriting concurrent changes.
    pub fn update(&self, role: &mut RoleRecord) -> Result<bool> {
        role.concurrency_stamp = Some(Uuid::new_v4().to_string());
        self.roles.whole_document().replace(role)
    }

    pub fn delete(&self, role: &RoleRecord) -> Result<bool> {
        self.roles.whole_document().delete(&role.id)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn find_by_id(&self, id: &str) -> Result<Option<RoleRecord>> {
        self.roles.find_by_id(id)
    }

    pub fn find_by_name(&self, normalized_name: &str) -> Result<Option<RoleRecord>> {
        self.roles.find_one(&Filter::Eq(
            RoleRecord::NORMALIZED_NAME.path()?,
            json!(normalized_name),
        ))
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    pub fn name(&self, role: &RoleRecord) -> Result<Option<String>> {
        self.roles.read_optional(&role.id, RoleRecord::NAME, &role.name)
    }

    pub fn set_name(&self, role: &mut RoleRecord, name: Option<&str>) -> Result<()> {
        role.name = name.map(str::to_string);
        self.roles.set_optional(&role.id, RoleRecord::NAME, role.name.as_ref())?;
        Ok(())
    }

    pub fn normalized_name(&self, role: &RoleRecord) -> Result<Option<String>> {
        self.roles
            .read_optional(&role.id, RoleRecord::NORMALIZED_NAME, &role.normalized_name)
    }

    pub fn set_normalized_name(
        &self,
        role: &mut RoleRecord,
        normalized_name: Option<&str>,
    ) -> Result<()> {
        role.normalized_name = normalized_name.map(str::to_string);
        self.roles
            .set_optional(&role.id, RoleRecord::NORMALIZED_NAME, role.normalized_name.as_ref())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    pub fn claims(&self, role: &RoleRecord) -> Result<Vec<Claim>> {
        self.roles.read_or(&role.id, RoleRecord::CLAIMS, role.claims.clone())
    }

    pub fn add_claim(&self, role: &mut RoleRecord, claim: &Claim) -> Result<()> {
        if !role.claims.contains(claim) {
            role.claims.push(claim.clone());
        }
        self.roles.add_to_set(&role.id, RoleRecord::CLAIMS, claim)?;
        Ok(())
    }

    pub fn remove_claim(&self, role: &mut RoleRecord, claim: &Claim) -> Result<()> {
        role.claims.retain(|c| c != claim);
        self.roles.remove_from_set(&role.id, RoleRecord::CLAIMS, claim)?;
        Ok(())
    }
}
