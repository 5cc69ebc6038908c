//! Resource queries narrowed to the requester's permitted organizations.
//!
//! Anything outside the permitted set is reported exactly like a missing
//! record, so callers cannot discover other tenants.

use crate::engine::{AccessRequest, Engine};
use crate::error::{Error, Result};
use crate::model::{Membership, Organization, User};
use crate::store::{MembershipFilter, Store};
use crate::types::{MembershipId, OrganizationId, UserId};
use std::collections::BTreeSet;

impl<S> Engine<S>
where
    S: Store,
{
    /// Non-archived organizations in the permitted set.
    pub async fn scoped_organizations(&self, request: &AccessRequest) -> Result<Vec<Organization>> {
        let permitted = self.permitted_organizations(request).await?;
        if permitted.is_empty() {
            return Ok(Vec::new());
        }
        let organizations = self
            .store()
            .organizations(false)
            .await
            .map_err(Error::from)?;
        Ok(organizations
            .into_iter()
            .filter(|org| permitted.contains(&org.id))
            .collect())
    }

    /// Users holding at least one membership in a permitted organization.
    pub async fn scoped_users(&self, request: &AccessRequest) -> Result<Vec<User>> {
        let memberships = self.scoped_memberships(request).await?;
        if memberships.is_empty() {
            return Ok(Vec::new());
        }
        let ids: BTreeSet<UserId> = memberships
            .into_iter()
            .map(|membership| membership.user_id)
            .collect();
        self.store().users(&ids).await.map_err(Error::from)
    }

    /// Memberships in permitted organizations.
    pub async fn scoped_memberships(&self, request: &AccessRequest) -> Result<Vec<Membership>> {
        let permitted = self.permitted_organizations(request).await?;
        if permitted.is_empty() {
            return Ok(Vec::new());
        }
        self.store()
            .memberships(&MembershipFilter::new().organizations(permitted.into_ids()))
            .await
            .map_err(Error::from)
    }

    /// Looks up one organization inside the scoped set.
    pub async fn find_organization(
        &self,
        request: &AccessRequest,
        id: &OrganizationId,
    ) -> Result<Organization> {
        let permitted = self.permitted_organizations(request).await?;
        if !permitted.contains(id) {
            return Err(Error::NotFound);
        }
        match self.store().organization(id).await.map_err(Error::from)? {
            Some(org) if !org.archived => Ok(org),
            _ => Err(Error::NotFound),
        }
    }

    /// Looks up one user sharing a permitted organization with the request.
    pub async fn find_user(&self, request: &AccessRequest, id: &UserId) -> Result<User> {
        let permitted = self.permitted_organizations(request).await?;
        if permitted.is_empty() {
            return Err(Error::NotFound);
        }
        let visible = self
            .store()
            .count_memberships(
                &MembershipFilter::new()
                    .user(id.clone())
                    .organizations(permitted.into_ids()),
            )
            .await
            .map_err(Error::from)?;
        if visible == 0 {
            return Err(Error::NotFound);
        }
        self.store()
            .user(id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::NotFound)
    }

    /// Looks up one membership inside a permitted organization.
    pub async fn find_membership(
        &self,
        request: &AccessRequest,
        id: &MembershipId,
    ) -> Result<Membership> {
        let permitted = self.permitted_organizations(request).await?;
        match self.store().membership(id).await.map_err(Error::from)? {
            Some(membership) if permitted.contains(&membership.organization_id) => Ok(membership),
            _ => Err(Error::NotFound),
        }
    }
}
