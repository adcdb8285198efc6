use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    append_vmta_block_text, extract_sender_for_vmta, insert_pattern_list_entry, list_vmta_names,
    remove_vmta_block_text, render_pattern_list_entry, render_vmta_block, set_vmta_rate_text,
    NodeClient, NodeError, VmtaRates,
};

/// In-memory stand-in for a node's config file, for unit and provisioner
/// tests. Mirrors the teacher's `kubernetes::mock_k8s_api` approach of
/// giving a collaborator trait a fake backed by process memory instead of
/// a real remote resource.
pub struct InMemoryNodeClient {
    config: Mutex<String>,
    pub reachable_override: Mutex<bool>,
    pub fail_pattern_list_insert: Mutex<bool>,
    pub reload_count: Mutex<u32>,
}

impl Default for InMemoryNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNodeClient {
    pub fn new() -> Self {
        Self {
            config: Mutex::new("<pattern-list>\n</pattern-list>\n".to_string()),
            reachable_override: Mutex::new(true),
            fail_pattern_list_insert: Mutex::new(false),
            reload_count: Mutex::new(0),
        }
    }

    pub fn config_snapshot(&self) -> String {
        self.config.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for InMemoryNodeClient {
    async fn reachable(&self) -> bool {
        *self.reachable_override.lock().unwrap()
    }

    async fn running(&self) -> Result<bool, NodeError> {
        Ok(true)
    }

    async fn queue_depth(&self) -> Result<i64, NodeError> {
        Ok(0)
    }

    async fn append_vmta_block(
        &self,
        name: &str,
        ip: IpAddr,
        hostname: &str,
        sender_email: &str,
        dkim_key_path: &str,
    ) -> Result<(), NodeError> {
        let mut config = self.config.lock().unwrap();
        let block = render_vmta_block(name, ip, hostname, dkim_key_path, VmtaRates::default());
        let with_block = append_vmta_block_text(&config, &block);

        if *self.fail_pattern_list_insert.lock().unwrap() {
            return Err(NodeError::PatternListMarkerMissing);
        }

        let entry = render_pattern_list_entry(sender_email, name);
        let final_config = insert_pattern_list_entry(&with_block, &entry)?;
        *config = final_config;
        *self.reload_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn remove_vmta_block(&self, name: &str, _sender_email: &str) -> Result<(), NodeError> {
        let mut config = self.config.lock().unwrap();
        *config = remove_vmta_block_text(&config, name);
        *self.reload_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn set_vmta_rate(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError> {
        let mut config = self.config.lock().unwrap();
        *config = set_vmta_rate_text(&config, name, msgs_per_hour)?;
        Ok(())
    }

    async fn pause_vmta(&self, name: &str) -> Result<(), NodeError> {
        self.set_vmta_rate(name, 0).await
    }

    async fn resume_vmta(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError> {
        self.set_vmta_rate(name, msgs_per_hour).await
    }

    async fn list_vmtas(&self) -> Result<Vec<String>, NodeError> {
        Ok(list_vmta_names(&self.config.lock().unwrap()))
    }

    async fn get_sender_for_vmta(&self, name: &str) -> Result<Option<String>, NodeError> {
        Ok(extract_sender_for_vmta(&self.config.lock().unwrap(), name))
    }

    async fn graceful_reload(&self) -> Result<(), NodeError> {
        *self.reload_count.lock().unwrap() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn append_then_remove_round_trips() {
        let client = InMemoryNodeClient::new();
        client
            .append_vmta_block(
                "vmta-acme",
                "10.0.0.5".parse().unwrap(),
                "mail.acme.com",
                "acme@mail.acme.com",
                "/etc/pmta/dkim/acme.pem",
            )
            .await
            .unwrap();

        assert_eq!(
            client.list_vmtas().await.unwrap(),
            vec!["vmta-acme".to_string()]
        );
        assert_eq!(
            client.get_sender_for_vmta("vmta-acme").await.unwrap(),
            Some("acme@mail.acme.com".to_string())
        );

        client
            .remove_vmta_block("vmta-acme", "acme@mail.acme.com")
            .await
            .unwrap();
        assert!(client.list_vmtas().await.unwrap().is_empty());
        assert_eq!(client.get_sender_for_vmta("vmta-acme").await.unwrap(), None);
    }

    #[tokio::test]
    async fn append_rolls_back_when_pattern_list_insert_fails() {
        let client = InMemoryNodeClient::new();
        *client.fail_pattern_list_insert.lock().unwrap() = true;

        let err = client
            .append_vmta_block(
                "vmta-acme",
                "10.0.0.5".parse().unwrap(),
                "mail.acme.com",
                "acme@mail.acme.com",
                "/etc/pmta/dkim/acme.pem",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::PatternListMarkerMissing));
        assert!(client.list_vmtas().await.unwrap().is_empty());
    }
}
