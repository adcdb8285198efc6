use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BounceStats, CampaignManagerAdapter, CmError, NewDeliveryServer, ServerStatus};

#[derive(Debug, Clone)]
struct MockServer {
    status: ServerStatus,
    hourly_quota: i32,
    bounce_stats: BounceStats,
}

/// In-memory stand-in for the campaign manager's store, for unit and
/// provisioner tests.
#[derive(Default)]
pub struct InMemoryCampaignManagerAdapter {
    next_id: AtomicU32,
    servers: Mutex<HashMap<String, MockServer>>,
    options: Mutex<HashMap<String, String>>,
    customer_assignments: Mutex<HashMap<String, Vec<String>>>,
    pub fail_create: Mutex<bool>,
    pub unreachable: Mutex<bool>,
}

impl InMemoryCampaignManagerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bounce_stats(&self, server_ref: &str, stats: BounceStats) {
        if let Some(server) = self.servers.lock().unwrap().get_mut(server_ref) {
            server.bounce_stats = stats;
        }
    }

    pub fn status_of(&self, server_ref: &str) -> Option<ServerStatus> {
        self.servers
            .lock()
            .unwrap()
            .get(server_ref)
            .map(|s| s.status)
    }

    fn check_reachable(&self) -> Result<(), CmError> {
        if *self.unreachable.lock().unwrap() {
            Err(CmError::Unreachable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CampaignManagerAdapter for InMemoryCampaignManagerAdapter {
    async fn create_delivery_server(&self, new: NewDeliveryServer) -> Result<String, CmError> {
        self.check_reachable()?;
        if *self.fail_create.lock().unwrap() {
            return Err(CmError::Unreachable);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.servers.lock().unwrap().insert(
            id.clone(),
            MockServer {
                status: ServerStatus::Active,
                hourly_quota: new.hourly_quota,
                bounce_stats: BounceStats::default(),
            },
        );
        Ok(id)
    }

    async fn delete_delivery_server(&self, server_ref: &str) -> Result<(), CmError> {
        self.check_reachable()?;
        self.servers.lock().unwrap().remove(server_ref);
        Ok(())
    }

    async fn set_server_status(&self, server_ref: &str, status: ServerStatus) -> Result<(), CmError> {
        self.check_reachable()?;
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_ref)
            .ok_or_else(|| CmError::ServerNotFound(server_ref.to_string()))?;
        server.status = status;
        Ok(())
    }

    async fn set_server_quota(&self, server_ref: &str, hourly_quota: i32) -> Result<(), CmError> {
        self.check_reachable()?;
        let mut servers = self.servers.lock().unwrap();
        let server = servers
            .get_mut(server_ref)
            .ok_or_else(|| CmError::ServerNotFound(server_ref.to_string()))?;
        server.hourly_quota = hourly_quota;
        Ok(())
    }

    async fn reset_daily_usage(&self, _server_ref: &str) -> Result<(), CmError> {
        self.check_reachable()
    }

    async fn reset_all_daily_usage(&self) -> Result<(), CmError> {
        self.check_reachable()
    }

    async fn get_bounce_stats(&self, server_ref: &str, _days: i32) -> Result<BounceStats, CmError> {
        self.check_reachable()?;
        self.servers
            .lock()
            .unwrap()
            .get(server_ref)
            .map(|s| s.bounce_stats.clone())
            .ok_or_else(|| CmError::ServerNotFound(server_ref.to_string()))
    }

    async fn get_option(&self, key: &str) -> Result<Option<String>, CmError> {
        self.check_reachable()?;
        Ok(self.options.lock().unwrap().get(key).cloned())
    }

    async fn set_option(&self, key: &str, value: &str) -> Result<(), CmError> {
        self.check_reachable()?;
        self.options
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_customers_with_servers(&self) -> Result<Vec<(String, Vec<String>)>, CmError> {
        self.check_reachable()?;
        Ok(self
            .customer_assignments
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn assign_servers_to_customer(
        &self,
        customer_ref: &str,
        server_refs: &[String],
    ) -> Result<(), CmError> {
        self.check_reachable()?;
        self.customer_assignments
            .lock()
            .unwrap()
            .insert(customer_ref.to_string(), server_refs.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn create_then_status_roundtrip() {
        let adapter = InMemoryCampaignManagerAdapter::new();
        let server_ref = adapter
            .create_delivery_server(NewDeliveryServer {
                name: "acme".to_string(),
                hostname: "mail.acme.com".to_string(),
                port: 587,
                from_email: "acme@mail.acme.com".to_string(),
                from_name: "Acme".to_string(),
                hourly_quota: 1,
                max_connection_messages: 100,
                customer_ref: None,
            })
            .await
            .unwrap();

        adapter
            .set_server_status(&server_ref, ServerStatus::Inactive)
            .await
            .unwrap();
        assert_eq!(adapter.status_of(&server_ref), Some(ServerStatus::Inactive));
    }

    #[tokio::test]
    async fn degrades_to_unreachable() {
        let adapter = InMemoryCampaignManagerAdapter::new();
        *adapter.unreachable.lock().unwrap() = true;

        let err = adapter
            .create_delivery_server(NewDeliveryServer {
                name: "acme".to_string(),
                hostname: "mail.acme.com".to_string(),
                port: 587,
                from_email: "acme@mail.acme.com".to_string(),
                from_name: "Acme".to_string(),
                hourly_quota: 1,
                max_connection_messages: 100,
                customer_ref: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CmError::Unreachable));
    }
}
