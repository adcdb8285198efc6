mod mock;
mod ssh;

pub use mock::InMemoryNodeClient;
pub use ssh::SshNodeClient;

use std::net::IpAddr;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("remote command failed (exit {status}): {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("vmta block {0:?} not found in config")]
    VmtaNotFound(String),
    #[error("pattern-list marker not found in config")]
    PatternListMarkerMissing,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static configuration for one outbound MTA node (not persisted — held in
/// the node registry's in-memory table, rebuilt from env/config at startup).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub host: String,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub config_path: String,
    pub domains: Vec<String>,
    pub smtp_port: u16,
}

/// One rate tier (max concurrent connections / hourly cap) for a single
/// destination-domain class within a virtual-MTA block.
#[derive(Debug, Clone, Copy)]
pub struct DomainRate {
    pub max_msgs_per_connection: u32,
    pub max_msgs_per_hour: u32,
}

impl Default for DomainRate {
    fn default() -> Self {
        Self {
            max_msgs_per_connection: 20,
            max_msgs_per_hour: 100,
        }
    }
}

/// The three-tier rate block spec.md §4.1 requires: generic / gmail /
/// outlook-family destinations each get their own throttle.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmtaRates {
    pub generic: DomainRate,
    pub gmail: DomainRate,
    pub outlook: DomainRate,
}

pub const GMAIL_DOMAINS: &[&str] = &["gmail.com", "googlemail.com"];
pub const OUTLOOK_DOMAINS: &[&str] = &[
    "outlook.com",
    "hotmail.com",
    "live.com",
    "msn.com",
    "office365.com",
];

/// Renders one complete `<virtual-mta NAME>...</virtual-mta>` block.
/// Generalizes `powermta_config.py`'s block-template rendering to the
/// three-tier rate shape spec.md requires.
pub fn render_vmta_block(
    name: &str,
    ip: IpAddr,
    hostname: &str,
    dkim_key_path: &str,
    rates: VmtaRates,
) -> String {
    let mut buf = String::new();
    buf.push_str(&format!("<virtual-mta {name}>\n"));
    buf.push_str(&format!("    smtp-source-host {ip} {hostname}\n"));
    buf.push_str(&format!("    dkim-sign yes\n"));
    buf.push_str(&format!("    dkim-key-file {dkim_key_path}\n"));
    buf.push_str(&render_domain_rate("*", rates.generic));
    for domain in GMAIL_DOMAINS {
        buf.push_str(&render_domain_rate(domain, rates.gmail));
    }
    for domain in OUTLOOK_DOMAINS {
        buf.push_str(&render_domain_rate(domain, rates.outlook));
    }
    buf.push_str("</virtual-mta>\n");
    buf
}

fn render_domain_rate(domain: &str, rate: DomainRate) -> String {
    format!(
        "    <source-ip {domain}>\n        max-smtp-out {mc}\n        max-msg-per-connection {mc}\n        max-msg-rate {mh}/h\n    </source-ip>\n",
        domain = domain,
        mc = rate.max_msgs_per_connection,
        mh = rate.max_msgs_per_hour,
    )
}

/// `"{sender_email}   {vmta_name}"` — two-plus spaces, per the pattern-list
/// entry shape spec.md §6 documents.
pub fn render_pattern_list_entry(sender_email: &str, vmta_name: &str) -> String {
    format!("{sender_email}   {vmta_name}\n")
}

fn pattern_list_marker_re() -> Regex {
    Regex::new(r"</pattern-list>").expect("static regex")
}

/// Inserts `entry` immediately before the `</pattern-list>` marker.
pub fn insert_pattern_list_entry(config: &str, entry: &str) -> Result<String, NodeError> {
    let re = pattern_list_marker_re();
    let Some(m) = re.find(config) else {
        return Err(NodeError::PatternListMarkerMissing);
    };
    let mut out = String::with_capacity(config.len() + entry.len());
    out.push_str(&config[..m.start()]);
    out.push_str(entry);
    out.push_str(&config[m.start()..]);
    Ok(out)
}

fn is_pattern_list_entry_for(line: &str, name: &str) -> bool {
    let tokens: Vec<&str> = line.trim().split_whitespace().collect();
    tokens.len() == 2 && tokens[1] == name
}

/// Removes a single pattern-list line whose vmta-name column equals `name`.
pub fn remove_pattern_list_entry(config: &str, name: &str) -> String {
    config
        .lines()
        .filter(|line| !is_pattern_list_entry_for(line, name))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn vmta_block_re(name: &str) -> Regex {
    Regex::new(&format!(
        r"(?s)<virtual-mta {}>.*?</virtual-mta>\n?",
        regex::escape(name)
    ))
    .expect("valid regex")
}

/// Byte span of the named `<virtual-mta>` block, if present.
pub fn find_vmta_block(config: &str, name: &str) -> Option<(usize, usize)> {
    vmta_block_re(name).find(config).map(|m| (m.start(), m.end()))
}

pub fn append_vmta_block_text(config: &str, block: &str) -> String {
    let mut out = config.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(block);
    out
}

/// Deletes the named vmta block and its pattern-list entry. Used both by
/// `remove_vmta_block` and by the append-failure rollback path, so a
/// half-appended block never survives a failed create.
pub fn remove_vmta_block_text(config: &str, name: &str) -> String {
    let without_block = match find_vmta_block(config, name) {
        Some((start, end)) => format!("{}{}", &config[..start], &config[end..]),
        None => config.to_string(),
    };
    remove_pattern_list_entry(&without_block, name)
}

/// Rewrites the rate lines of an existing block. A crude but sufficient
/// approach for the three fixed tiers: replaces every `max-msg-rate` value
/// inside the block with the new rate.
pub fn set_vmta_rate_text(config: &str, name: &str, msgs_per_hour: u32) -> Result<String, NodeError> {
    let (start, end) = find_vmta_block(config, name).ok_or_else(|| NodeError::VmtaNotFound(name.to_string()))?;
    let block = &config[start..end];
    let rate_re = Regex::new(r"max-msg-rate \d+/h").expect("static regex");
    let rewritten = rate_re.replace_all(block, format!("max-msg-rate {msgs_per_hour}/h"));
    Ok(format!("{}{}{}", &config[..start], rewritten, &config[end..]))
}

pub fn extract_sender_for_vmta(config: &str, name: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let trimmed = line.trim();
        let mut parts = trimmed.split_whitespace();
        let sender = parts.next()?;
        let vmta = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        (vmta == name).then(|| sender.to_string())
    })
}

pub fn list_vmta_names(config: &str) -> Vec<String> {
    let re = Regex::new(r"<virtual-mta (\S+)>").expect("static regex");
    re.captures_iter(config)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Executes ordered shell operations on a remote outbound node over a secure
/// channel. Every mutation that accepts externally sourced strings MUST
/// route them through a temp file on the remote side rather than interpolate
/// them into a shell command line.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn reachable(&self) -> bool;
    async fn running(&self) -> Result<bool, NodeError>;
    /// -1 if indeterminate.
    async fn queue_depth(&self) -> Result<i64, NodeError>;

    async fn append_vmta_block(
        &self,
        name: &str,
        ip: IpAddr,
        hostname: &str,
        sender_email: &str,
        dkim_key_path: &str,
    ) -> Result<(), NodeError>;

    async fn remove_vmta_block(&self, name: &str, sender_email: &str) -> Result<(), NodeError>;

    async fn set_vmta_rate(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError>;
    async fn pause_vmta(&self, name: &str) -> Result<(), NodeError>;
    async fn resume_vmta(&self, name: &str, msgs_per_hour: u32) -> Result<(), NodeError>;

    async fn list_vmtas(&self) -> Result<Vec<String>, NodeError>;
    async fn get_sender_for_vmta(&self, name: &str) -> Result<Option<String>, NodeError>;

    /// Deferred by the caller when `queue_depth()` exceeds a threshold.
    async fn graceful_reload(&self) -> Result<(), NodeError>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_config() -> String {
        "<virtual-mta vmta-foo>\n    smtp-source-host 10.0.0.1 mail.foo.com\n    <source-ip *>\n        max-msg-rate 100/h\n    </source-ip>\n</virtual-mta>\nalice@foo.com   vmta-foo\n<pattern-list>\nalice@foo.com   vmta-foo\n</pattern-list>\n".to_string()
    }

    #[test]
    fn insert_pattern_list_entry_lands_before_marker() {
        let config = "<pattern-list>\n</pattern-list>\n";
        let out = insert_pattern_list_entry(config, "a@b.com   vmta-a\n").unwrap();
        assert!(out.contains("a@b.com   vmta-a\n</pattern-list>"));
    }

    #[test]
    fn insert_pattern_list_entry_missing_marker_errors() {
        let err = insert_pattern_list_entry("no marker here", "x").unwrap_err();
        assert!(matches!(err, NodeError::PatternListMarkerMissing));
    }

    #[test]
    fn find_and_remove_vmta_block_round_trips() {
        let config = sample_config();
        assert!(find_vmta_block(&config, "vmta-foo").is_some());
        let removed = remove_vmta_block_text(&config, "vmta-foo");
        assert!(!removed.contains("<virtual-mta vmta-foo>"));
        assert!(!removed.contains("alice@foo.com   vmta-foo"));
    }

    #[test]
    fn extract_sender_for_vmta_reads_pattern_list() {
        let config = sample_config();
        assert_eq!(
            extract_sender_for_vmta(&config, "vmta-foo"),
            Some("alice@foo.com".to_string())
        );
        assert_eq!(extract_sender_for_vmta(&config, "vmta-bar"), None);
    }

    #[test]
    fn list_vmta_names_finds_all_blocks() {
        let config = sample_config();
        assert_eq!(list_vmta_names(&config), vec!["vmta-foo".to_string()]);
    }

    #[test]
    fn set_vmta_rate_rewrites_rate_line() {
        let config = sample_config();
        let out = set_vmta_rate_text(&config, "vmta-foo", 250).unwrap();
        assert!(out.contains("max-msg-rate 250/h"));
        assert!(!out.contains("max-msg-rate 100/h"));
    }

    #[test]
    fn render_vmta_block_includes_all_three_tiers() {
        let block = render_vmta_block(
            "vmta-acme",
            "10.0.0.5".parse().unwrap(),
            "mail.acme.com",
            "/etc/pmta/dkim/acme.pem",
            VmtaRates::default(),
        );
        assert!(block.contains("<source-ip *>"));
        assert!(block.contains("<source-ip gmail.com>"));
        assert!(block.contains("<source-ip outlook.com>"));
    }
}
