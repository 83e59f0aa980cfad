use async_trait::async_trait;
use ulid::Ulid;

use crate::store::{PersistentStore, StoreError};

#[async_trait]
pub trait AutoAssigner: Send + Sync {
    /// Pick a handler for `request_id` and record the assignment in `store`.
    /// `Ok(None)` when nobody qualifies.
    async fn assign(
        &self,
        store: &dyn PersistentStore,
        tenant: &str,
        request_id: Ulid,
    ) -> Result<Option<String>, StoreError>;
}

/// Assigns to the available team member serving the request's service with
/// the fewest open assignments. Ties go to the lowest member id.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadAssigner;

#[async_trait]
impl AutoAssigner for WorkloadAssigner {
    async fn assign(
        &self,
        store: &dyn PersistentStore,
        tenant: &str,
        request_id: Ulid,
    ) -> Result<Option<String>, StoreError> {
        let request = store
            .get_request(tenant, request_id)
            .await?
            .ok_or(StoreError::NotFound(request_id))?;
        if request.assigned_to.is_some() {
            return Ok(None);
        }

        let mut best: Option<(usize, String)> = None;
        for member in store.team_members_for_service(tenant, &request.service_id).await? {
            if !member.available {
                continue;
            }
            let load = store.open_assignments(tenant, &member.id).await?;
            let better = match best {
                Some((best_load, ref best_id)) => (load, &member.id) < (best_load, best_id),
                None => true,
            };
            if better {
                best = Some((load, member.id));
            }
        }

        let Some((load, member_id)) = best else {
            return Ok(None);
        };
        store.assign(tenant, request_id, &member_id).await?;
        tracing::debug!(tenant, %request_id, member_id = %member_id, load, "auto-assigned");
        Ok(Some(member_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::MemoryStore;

    fn member(id: &str, available: bool) -> TeamMember {
        TeamMember {
            id: id.into(),
            name: id.to_uppercase(),
            service_ids: vec!["s1".into()],
            available,
        }
    }

    fn plain(assigned_to: Option<&str>) -> NewServiceRequest {
        NewServiceRequest {
            client_id: "c1".into(),
            service_id: "s1".into(),
            title: "Fix".into(),
            description: None,
            priority: Priority::Medium,
            budget: None,
            assigned_to: assigned_to.map(str::to_string),
            created_by: "u1".into(),
            booking: None,
        }
    }

    #[tokio::test]
    async fn picks_least_loaded_available_member() {
        let store = MemoryStore::new();
        store.register_team_member("acme", member("tm1", true));
        store.register_team_member("acme", member("tm2", true));
        store.register_team_member("acme", member("tm0", false));
        store.create_request("acme", plain(Some("tm1"))).await.unwrap();

        let fresh = store.create_request("acme", plain(None)).await.unwrap();
        let chosen = WorkloadAssigner.assign(&store, "acme", fresh.id).await.unwrap();
        assert_eq!(chosen.as_deref(), Some("tm2"));
        let row = store.get_request("acme", fresh.id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Assigned);
    }

    #[tokio::test]
    async fn ties_break_on_member_id() {
        let store = MemoryStore::new();
        store.register_team_member("acme", member("tm2", true));
        store.register_team_member("acme", member("tm1", true));
        let fresh = store.create_request("acme", plain(None)).await.unwrap();
        let chosen = WorkloadAssigner.assign(&store, "acme", fresh.id).await.unwrap();
        assert_eq!(chosen.as_deref(), Some("tm1"));
    }

    #[tokio::test]
    async fn nobody_to_assign() {
        let store = MemoryStore::new();
        let fresh = store.create_request("acme", plain(None)).await.unwrap();
        assert_eq!(WorkloadAssigner.assign(&store, "acme", fresh.id).await.unwrap(), None);

        store.register_team_member("acme", member("tm1", true));
        let preassigned = store.create_request("acme", plain(Some("tm9"))).await.unwrap();
        assert_eq!(WorkloadAssigner.assign(&store, "acme", preassigned.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_request_is_an_error() {
        let store = MemoryStore::new();
        let err = WorkloadAssigner.assign(&store, "acme", Ulid::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
