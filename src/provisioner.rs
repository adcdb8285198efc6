use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::campaign_manager::{CampaignManagerAdapter, NewDeliveryServer};
use crate::error::Error;
use crate::models::{Ip, IpPurpose, IpRepository, NewIp, TenantId};
use crate::registry::NodeRegistry;

const STRIP_LABELS: &[&str] = &["mail", "smtp", "send", "out"];

#[derive(Debug, Clone)]
pub struct CreateIpParams {
    pub tenant_id: TenantId,
    pub address: IpNet,
    pub hostname: String,
    pub purpose: IpPurpose,
    pub weight: i16,
    pub vmta_name: Option<String>,
    pub pool_name: Option<String>,
    pub sender_email: Option<String>,
    pub node_id: Option<String>,
    pub dkim_key_path: Option<String>,
    pub from_name: Option<String>,
}

/// Atomic two-phase create/delete combining the node client (C1) and the
/// campaign-manager adapter (C2) with correlated identifiers. Never persists
/// an IP row whose `vmta_name` exists on the node without a matching
/// delivery-server, or vice versa.
pub struct Provisioner {
    pool: PgPool,
    node_registry: Arc<NodeRegistry>,
    campaign_manager: Arc<dyn CampaignManagerAdapter>,
}

impl Provisioner {
    pub fn new(
        pool: PgPool,
        node_registry: Arc<NodeRegistry>,
        campaign_manager: Arc<dyn CampaignManagerAdapter>,
    ) -> Self {
        Self {
            pool,
            node_registry,
            campaign_manager,
        }
    }

    fn ips(&self) -> IpRepository {
        IpRepository::new(self.pool.clone())
    }

    pub async fn create(&self, params: CreateIpParams) -> Result<Ip, Error> {
        let ips = self.ips();

        if ips.exists_with_address(&params.address).await? {
            return Err(Error::Conflict(format!(
                "ip {} already provisioned",
                params.address
            )));
        }

        let vmta_name = params
            .vmta_name
            .clone()
            .unwrap_or_else(|| derive_vmta_name(&params.hostname));

        let (node_id, mailwizz_server_ref) = if let Some(sender_email) = &params.sender_email {
            let node_config = match &params.node_id {
                Some(explicit) => self.node_registry.config_for(explicit).ok_or_else(|| {
                    Error::NotFound("node")
                })?,
                None => self
                    .node_registry
                    .resolve_by_hostname(&params.hostname)
                    .ok_or_else(|| Error::ServiceUnavailable("no node available".to_string()))?,
            };
            let node_id = node_config.node_id.clone();
            let client = self
                .node_registry
                .client_for(&node_id)
                .ok_or_else(|| Error::ServiceUnavailable(format!("node {node_id} has no client")))?;

            let ip_addr: IpAddr = params.address.addr();
            let dkim_key_path = params
                .dkim_key_path
                .clone()
                .unwrap_or_else(|| format!("/etc/pmta/dkim/{vmta_name}.pem"));

            client
                .append_vmta_block(&vmta_name, ip_addr, &params.hostname, sender_email, &dkim_key_path)
                .await
                .map_err(|e| Error::ServiceUnavailable(format!("append_vmta_block failed: {e}")))?;

            let server_ref = match self
                .campaign_manager
                .create_delivery_server(NewDeliveryServer {
                    name: vmta_name.clone(),
                    hostname: node_config.host.clone(),
                    port: node_config.smtp_port,
                    from_email: sender_email.clone(),
                    from_name: params.from_name.clone().unwrap_or_else(|| vmta_name.clone()),
                    hourly_quota: 1,
                    max_connection_messages: 20,
                    customer_ref: None,
                })
                .await
            {
                Ok(server_ref) => server_ref,
                Err(e) => {
                    warn!(vmta_name = %vmta_name, "create_delivery_server failed, rolling back node config: {e}");
                    if let Err(rollback_err) = client.remove_vmta_block(&vmta_name, sender_email).await {
                        warn!(vmta_name = %vmta_name, "rollback of append_vmta_block also failed: {rollback_err}");
                    }
                    return Err(Error::ServiceUnavailable(format!(
                        "create_delivery_server failed: {e}"
                    )));
                }
            };

            (Some(node_id), Some(server_ref))
        } else {
            (params.node_id.clone(), None)
        };

        let created = ips
            .create(NewIp {
                tenant_id: params.tenant_id,
                address: params.address,
                hostname: params.hostname,
                purpose: params.purpose,
                weight: params.weight,
                vmta_name: Some(vmta_name.clone()),
                pool_name: params.pool_name,
                sender_email: params.sender_email,
                node_id,
                mailwizz_server_ref,
            })
            .await?;

        info!(ip_id = %created.id, vmta_name = %vmta_name, "ip provisioned");
        Ok(created)
    }

    pub async fn delete(&self, ip_id: crate::models::IpId, deprovision: bool) -> Result<(), Error> {
        let ips = self.ips();
        let ip = ips.get_by_id_any_tenant(ip_id).await?;

        if deprovision {
            if let Some(server_ref) = &ip.mailwizz_server_ref {
                if let Err(e) = self.campaign_manager.delete_delivery_server(server_ref).await {
                    warn!(ip_id = %ip_id, server_ref = %server_ref, "delete_delivery_server failed, continuing: {e}");
                }
            }

            if let Some(vmta_name) = &ip.vmta_name {
                if let Some(node_id) = &ip.node_id {
                    if let Some(client) = self.node_registry.client_for(node_id) {
                        let sender_email = match &ip.sender_email {
                            Some(email) => Some(email.clone()),
                            None => client.get_sender_for_vmta(vmta_name).await.unwrap_or(None),
                        };

                        let remove_result = match &sender_email {
                            Some(email) => client.remove_vmta_block(vmta_name, email).await,
                            None => client.remove_vmta_block(vmta_name, "").await,
                        };

                        if let Err(e) = remove_result {
                            warn!(ip_id = %ip_id, vmta_name = %vmta_name, "remove_vmta_block failed: {e}");
                        }
                    }
                }
            }
        }

        ips.delete(ip_id).await?;
        info!(ip_id = %ip_id, "ip deprovisioned");
        Ok(())
    }
}

/// `mail|smtp|send|out` leading label stripped, remainder slugified, then
/// prefixed `vmta-`.
fn derive_vmta_name(hostname: &str) -> String {
    let stripped = match hostname.split_once('.') {
        Some((first, rest)) if STRIP_LABELS.contains(&first) => rest,
        _ => hostname,
    };
    let slug: String = stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("vmta-{slug}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_vmta_name_strips_leading_label_and_slugifies() {
        assert_eq!(derive_vmta_name("mail.hub-travelers.com"), "vmta-hub-travelers-com");
        assert_eq!(derive_vmta_name("smtp.acme.example.com"), "vmta-acme-example-com");
        assert_eq!(derive_vmta_name("plainhost.com"), "vmta-plainhost-com");
    }

    mod integration {
        use super::*;
        use crate::campaign_manager::InMemoryCampaignManagerAdapter;
        use crate::node::{InMemoryNodeClient, NodeClient, NodeConfig};
        use sqlx::PgPool;

        fn node_registry(fail_pattern_list: bool) -> Arc<NodeRegistry> {
            let client = Arc::new(InMemoryNodeClient::new());
            *client.fail_pattern_list_insert.lock().unwrap() = fail_pattern_list;
            Arc::new(NodeRegistry::new(vec![(
                NodeConfig {
                    node_id: "vps1".to_string(),
                    host: "vps1.internal".to_string(),
                    ssh_user: "deploy".to_string(),
                    ssh_key_path: "/dev/null".to_string(),
                    config_path: "/etc/pmta/config".to_string(),
                    domains: vec!["hub-travelers.com".to_string()],
                    smtp_port: 587,
                },
                client as Arc<dyn NodeClient>,
            )]))
        }

        #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
        async fn create_rolls_back_node_config_on_campaign_manager_failure(db: PgPool) {
            let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
            let registry = node_registry(false);
            let cm = Arc::new(InMemoryCampaignManagerAdapter::new());
            *cm.fail_create.lock().unwrap() = true;

            let provisioner = Provisioner::new(db.clone(), registry.clone(), cm.clone());

            let result = provisioner
                .create(CreateIpParams {
                    tenant_id,
                    address: "203.0.113.10/32".parse().unwrap(),
                    hostname: "mail.hub-travelers.com".to_string(),
                    purpose: IpPurpose::Cold,
                    weight: 100,
                    vmta_name: None,
                    pool_name: None,
                    sender_email: Some("contact@mail.hub-travelers.com".to_string()),
                    node_id: None,
                    dkim_key_path: None,
                    from_name: None,
                })
                .await;

            assert!(matches!(result, Err(Error::ServiceUnavailable(_))));

            let client = registry.client_for("vps1").unwrap();
            let vmtas = client.list_vmtas().await.unwrap();
            assert!(!vmtas.contains(&"vmta-hub-travelers-com".to_string()));

            let ips = IpRepository::new(db);
            assert!(!ips.exists_with_address(&"203.0.113.10/32".parse().unwrap()).await.unwrap());
        }

        #[sqlx::test(fixtures(path = "../fixtures", scripts("tenants")))]
        async fn create_then_delete_round_trips(db: PgPool) {
            let tenant_id: TenantId = "11111111-1111-1111-1111-111111111111".parse().unwrap();
            let registry = node_registry(false);
            let cm = Arc::new(InMemoryCampaignManagerAdapter::new());

            let provisioner = Provisioner::new(db.clone(), registry.clone(), cm.clone());

            let created = provisioner
                .create(CreateIpParams {
                    tenant_id,
                    address: "203.0.113.20/32".parse().unwrap(),
                    hostname: "mail.acme.example.com".to_string(),
                    purpose: IpPurpose::Cold,
                    weight: 100,
                    vmta_name: None,
                    pool_name: None,
                    sender_email: Some("alerts@mail.acme.example.com".to_string()),
                    node_id: None,
                    dkim_key_path: None,
                    from_name: None,
                })
                .await
                .unwrap();

            assert!(created.mailwizz_server_ref.is_some());
            assert_eq!(created.vmta_name.as_deref(), Some("vmta-acme-example-com"));

            provisioner.delete(created.id, true).await.unwrap();

            let ips = IpRepository::new(db);
            assert!(ips.get_by_id_any_tenant(created.id).await.is_err());

            let client = registry.client_for("vps1").unwrap();
            let vmtas = client.list_vmtas().await.unwrap();
            assert!(!vmtas.contains(&"vmta-acme-example-com".to_string()));
        }
    }
}
