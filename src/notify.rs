use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Update {
    #[serde(rename_all = "camelCase")]
    EntityUpdate { id: Ulid, payload: Value },
    #[serde(rename_all = "camelCase")]
    AvailabilityUpdate { resource_id: String, date: NaiveDate },
}

impl Update {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Update::EntityUpdate { .. } => "entityUpdate",
            Update::AvailabilityUpdate { .. } => "availabilityUpdate",
        }
    }
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broadcast failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Real-time fan-out of changes, scoped per tenant.
pub trait RealtimeBroadcaster: Send + Sync {
    fn emit_entity_update(&self, tenant: &str, id: Ulid, payload: Value) -> Result<(), NotifyError>;

    fn emit_availability_update(
        &self,
        tenant: &str,
        resource_id: &str,
        date: NaiveDate,
    ) -> Result<(), NotifyError>;
}

/// Broadcast hub with one channel per tenant.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Update>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a tenant's updates. Creates the channel if needed.
    pub fn subscribe(&self, tenant: &str) -> broadcast::Receiver<Update> {
        let sender = self
            .channels
            .entry(tenant.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an update. No-op if nobody is listening.
    fn send(&self, tenant: &str, update: Update) {
        if let Some(sender) = self.channels.get(tenant) {
            let _ = sender.send(update);
        }
    }
}

impl RealtimeBroadcaster for NotifyHub {
    fn emit_entity_update(&self, tenant: &str, id: Ulid, payload: Value) -> Result<(), NotifyError> {
        self.send(tenant, Update::EntityUpdate { id, payload });
        Ok(())
    }

    fn emit_availability_update(
        &self,
        tenant: &str,
        resource_id: &str,
        date: NaiveDate,
    ) -> Result<(), NotifyError> {
        self.send(
            tenant,
            Update::AvailabilityUpdate {
                resource_id: resource_id.to_string(),
                date,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("acme");
        let id = Ulid::new();

        hub.emit_entity_update("acme", id, serde_json::json!({"status": "SUBMITTED"}))
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received,
            Update::EntityUpdate {
                id,
                payload: serde_json::json!({"status": "SUBMITTED"})
            }
        );
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let hub = NotifyHub::new();
        let mut acme = hub.subscribe("acme");
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        hub.emit_availability_update("globex", "s1", date).unwrap();
        hub.emit_availability_update("acme", "s1", date).unwrap();
        match acme.recv().await.unwrap() {
            Update::AvailabilityUpdate { resource_id, date: d } => {
                assert_eq!(resource_id, "s1");
                assert_eq!(d, date);
            }
            other => panic!("unexpected update {other:?}"),
        }
        assert!(acme.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, should not panic
        hub.emit_entity_update("acme", Ulid::new(), Value::Null).unwrap();
    }

    #[test]
    fn update_json_shape() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let json = serde_json::to_value(Update::AvailabilityUpdate {
            resource_id: "s1".into(),
            date,
        })
        .unwrap();
        assert_eq!(json["type"], "availabilityUpdate");
        assert_eq!(json["resourceId"], "s1");
        assert_eq!(json["date"], "2025-03-10");
    }
}
