//! Seed data for the entities a request refers to.
//!
//! ```json
//! { "tenants": { "acme": {
//!     "clients": [{ "id": "c1", "name": "Ada" }],
//!     "services": [{ "id": "s1", "name": "Plumbing" }],
//!     "teamMembers": [{ "id": "tm1", "name": "Grace", "serviceIds": ["s1"] }]
//! } } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::model::{Client, Service, TeamMember};
use crate::store::{MemoryStore, PersistentStore, StoreError, WalStore};

#[derive(Debug)]
pub enum DirectoryError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Io(e) => write!(f, "cannot read directory file: {e}"),
            DirectoryError::Parse(e) => write!(f, "invalid directory file: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDirectory {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub team_members: Vec<TeamMember>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantDirectory>,
}

impl Directory {
    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        serde_json::from_str(raw).map_err(DirectoryError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path).map_err(DirectoryError::Io)?;
        Self::from_json(&raw)
    }

    /// Register every entry with the primary store. Team members also go to
    /// the fallback so auto-assignment keeps working in degraded mode.
    /// Registration is idempotent, so seeding on every start is safe.
    pub async fn seed(&self, primary: &WalStore, fallback: &MemoryStore) -> Result<usize, StoreError> {
        let mut registered = 0;
        for (tenant, dir) in &self.tenants {
            for member in &dir.team_members {
                fallback.register_team_member(tenant, member.clone());
            }
            if !primary.is_available() {
                continue;
            }
            for client in &dir.clients {
                primary.register_client(tenant, client.clone()).await?;
                registered += 1;
            }
            for service in &dir.services {
                primary.register_service(tenant, service.clone()).await?;
                registered += 1;
            }
            for member in &dir.team_members {
                primary.register_team_member(tenant, member.clone()).await?;
                registered += 1;
            }
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"{
        "tenants": {
            "acme": {
                "clients": [{ "id": "c1", "name": "Ada" }],
                "services": [{ "id": "s1", "name": "Plumbing" }, { "id": "s2", "name": "Old", "active": false }],
                "teamMembers": [{ "id": "tm1", "name": "Grace", "serviceIds": ["s1"] }]
            },
            "globex": {}
        }
    }"#;

    #[test]
    fn parses_with_defaults() {
        let dir = Directory::from_json(SEED).unwrap();
        let acme = &dir.tenants["acme"];
        assert!(acme.services[0].active);
        assert!(!acme.services[1].active);
        assert!(acme.team_members[0].available);
        assert!(dir.tenants["globex"].clients.is_empty());
    }

    #[test]
    fn rejects_bad_json() {
        assert!(matches!(Directory::from_json("{"), Err(DirectoryError::Parse(_))));
        assert!(matches!(
            Directory::load(Path::new("/nonexistent/bookline.json")),
            Err(DirectoryError::Io(_))
        ));
    }

    #[tokio::test]
    async fn seeds_both_stores() {
        let data = std::env::temp_dir().join("bookline_test_directory");
        let _ = std::fs::remove_dir_all(&data);
        std::fs::create_dir_all(&data).unwrap();

        let primary = WalStore::new(data);
        let fallback = MemoryStore::new();
        let dir = Directory::from_json(SEED).unwrap();
        assert_eq!(dir.seed(&primary, &fallback).await.unwrap(), 4);

        assert_eq!(primary.client_exists("acme", "c1").await.unwrap(), Some(true));
        assert_eq!(primary.service_exists("acme", "s2").await.unwrap(), Some(false));
        assert_eq!(fallback.team_members_for_service("acme", "s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_primary_only_seeds_fallback() {
        let fallback = MemoryStore::new();
        let dir = Directory::from_json(SEED).unwrap();
        assert_eq!(dir.seed(&WalStore::unconfigured(), &fallback).await.unwrap(), 0);
        assert_eq!(fallback.team_members_for_service("acme", "s1").await.unwrap().len(), 1);
    }
}
