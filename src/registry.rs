use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::node::{NodeClient, NodeConfig};

#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub node_id: String,
    pub reachable: bool,
    pub running: bool,
    pub queue_depth: i64,
}

struct RegisteredNode {
    config: NodeConfig,
    client: Arc<dyn NodeClient>,
}

/// Resolves a domain or hostname to the node responsible for it, enumerates
/// nodes, and fans health checks out across all of them.
pub struct NodeRegistry {
    nodes: Vec<RegisteredNode>,
}

const HOSTNAME_STRIP_LABELS: &[&str] = &["mail", "smtp", "send", "out"];

impl NodeRegistry {
    pub fn new(nodes: Vec<(NodeConfig, Arc<dyn NodeClient>)>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|(config, client)| RegisteredNode { config, client })
                .collect(),
        }
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.config.node_id.clone()).collect()
    }

    pub fn client_for(&self, node_id: &str) -> Option<Arc<dyn NodeClient>> {
        self.nodes
            .iter()
            .find(|n| n.config.node_id == node_id)
            .map(|n| n.client.clone())
    }

    pub fn config_for(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.config.node_id == node_id).map(|n| &n.config)
    }

    /// Returns the node whose `domains` list contains `domain` directly;
    /// else strips one DNS label at a time from the left and retries; else
    /// falls back to the first configured node.
    pub fn resolve_by_domain(&self, domain: &str) -> Option<&NodeConfig> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut candidate = domain.to_string();
        loop {
            if let Some(node) = self
                .nodes
                .iter()
                .find(|n| n.config.domains.iter().any(|d| d == &candidate))
            {
                return Some(&node.config);
            }

            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest.to_string(),
                _ => break,
            }
        }

        self.nodes.first().map(|n| &n.config)
    }

    /// Strips a leading `mail|smtp|send|out.` label if present, then defers
    /// to [`Self::resolve_by_domain`].
    pub fn resolve_by_hostname(&self, hostname: &str) -> Option<&NodeConfig> {
        let domain = match hostname.split_once('.') {
            Some((first, rest)) if HOSTNAME_STRIP_LABELS.contains(&first) => rest,
            _ => hostname,
        };
        self.resolve_by_domain(domain)
    }

    pub async fn health_check_all(&self) -> Vec<NodeHealth> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let reachable = node.client.reachable().await;
            let running = if reachable {
                node.client.running().await.unwrap_or_else(|e| {
                    warn!(node_id = %node.config.node_id, "running check failed: {e}");
                    false
                })
            } else {
                false
            };
            let queue_depth = if reachable {
                node.client.queue_depth().await.unwrap_or(-1)
            } else {
                -1
            };
            out.push(NodeHealth {
                node_id: node.config.node_id.clone(),
                reachable,
                running,
                queue_depth,
            });
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::InMemoryNodeClient;

    fn config(node_id: &str, domains: &[&str]) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            host: format!("{node_id}.internal"),
            ssh_user: "deploy".to_string(),
            ssh_key_path: "/dev/null".to_string(),
            config_path: "/etc/pmta/config".to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            smtp_port: 587,
        }
    }

    fn registry() -> NodeRegistry {
        NodeRegistry::new(vec![
            (
                config("vps1", &["acme.example.com"]),
                Arc::new(InMemoryNodeClient::new()) as Arc<dyn NodeClient>,
            ),
            (
                config("vps2", &["other.example.com"]),
                Arc::new(InMemoryNodeClient::new()) as Arc<dyn NodeClient>,
            ),
        ])
    }

    #[test]
    fn resolve_by_domain_exact_match() {
        let reg = registry();
        assert_eq!(
            reg.resolve_by_domain("acme.example.com").unwrap().node_id,
            "vps1"
        );
    }

    #[test]
    fn resolve_by_domain_strips_labels() {
        let reg = registry();
        assert_eq!(
            reg.resolve_by_domain("campaign.acme.example.com").unwrap().node_id,
            "vps1"
        );
    }

    #[test]
    fn resolve_by_domain_falls_back_to_first_node() {
        let reg = registry();
        assert_eq!(
            reg.resolve_by_domain("nowhere.tld").unwrap().node_id,
            "vps1"
        );
    }

    #[test]
    fn resolve_by_hostname_strips_leading_label() {
        let reg = registry();
        assert_eq!(
            reg.resolve_by_hostname("mail.acme.example.com").unwrap().node_id,
            "vps1"
        );
        assert_eq!(
            reg.resolve_by_hostname("smtp.other.example.com").unwrap().node_id,
            "vps2"
        );
    }

    #[tokio::test]
    async fn health_check_all_covers_every_node() {
        let reg = registry();
        let health = reg.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|h| h.reachable));
    }
}
