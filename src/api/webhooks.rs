use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::consolidator::{Consolidator, CounterKind};
use crate::error::{ApiError, Error};
use crate::models::{IpEventRepository, IpRepository, IpStatus, NewIpEvent};

/// `POST /webhooks/bounce` — `{ email, bounce_type, reason, source_ip, vmta }`.
#[derive(Debug, Deserialize)]
pub struct BounceEvent {
    pub email: String,
    pub bounce_type: BounceType,
    pub reason: Option<String>,
    pub source_ip: Option<String>,
    pub vmta: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Hard,
    Soft,
    Complaint,
}

/// `POST /webhooks/delivery` — `{ domain, count }`.
#[derive(Debug, Deserialize)]
pub struct DeliveryEvent {
    pub domain: String,
    pub count: i32,
}

/// `POST /webhooks/mailwizz` and `/webhooks/powermta` — a recipient address
/// plus an event label, correlated to an IP via `vmta` or `server_ref`.
#[derive(Debug, Deserialize)]
pub struct CampaignEvent {
    pub recipient: String,
    pub event: CampaignEventKind,
    pub vmta: Option<String>,
    pub server_ref: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Deferred,
}

pub async fn bounce(
    State(pool): State<sqlx::PgPool>,
    State(consolidator): State<std::sync::Arc<Consolidator>>,
    body: crate::webhooks::VerifiedBody,
) -> Result<Json<Value>, ApiError> {
    let event: BounceEvent = serde_json::from_slice(&body.0)
        .map_err(|e| Error::Validation(format!("malformed bounce payload: {e}")))?;

    let ips = IpRepository::new(pool.clone());
    let ip = match &event.vmta {
        Some(vmta) => ips.find_by_vmta_name(vmta).await?,
        None => None,
    };

    record_and_count(
        &pool,
        &consolidator,
        ip.as_ref(),
        "bounce",
        Some(event.email.clone()),
        None,
        serde_json::json!({
            "email": event.email,
            "bounce_type": event.bounce_type,
            "reason": event.reason,
            "source_ip": event.source_ip,
            "vmta": event.vmta,
        }),
        match event.bounce_type {
            BounceType::Complaint => CounterKind::Complaint,
            BounceType::Hard | BounceType::Soft => CounterKind::Bounced,
        },
        1,
    )
    .await?;

    Ok(Json(serde_json::json!({ "recorded": true })))
}

pub async fn delivery(
    State(pool): State<sqlx::PgPool>,
    State(consolidator): State<std::sync::Arc<Consolidator>>,
    body: crate::webhooks::VerifiedBody,
) -> Result<Json<Value>, ApiError> {
    let event: DeliveryEvent = serde_json::from_slice(&body.0)
        .map_err(|e| Error::Validation(format!("malformed delivery payload: {e}")))?;

    let ips = IpRepository::new(pool.clone());
    let ip = ips.find_by_hostname_domain(&event.domain).await?;

    record_and_count(
        &pool,
        &consolidator,
        ip.as_ref(),
        "delivery",
        None,
        Some(event.domain.clone()),
        serde_json::json!({ "domain": event.domain, "count": event.count }),
        CounterKind::Delivered,
        event.count,
    )
    .await?;

    Ok(Json(serde_json::json!({ "recorded": true })))
}

pub async fn campaign_event(
    State(pool): State<sqlx::PgPool>,
    State(consolidator): State<std::sync::Arc<Consolidator>>,
    body: crate::webhooks::VerifiedBody,
) -> Result<Json<Value>, ApiError> {
    let event: CampaignEvent = serde_json::from_slice(&body.0)
        .map_err(|e| Error::Validation(format!("malformed campaign event payload: {e}")))?;

    let ips = IpRepository::new(pool.clone());
    let ip = match (&event.vmta, &event.server_ref) {
        (Some(vmta), _) => ips.find_by_vmta_name(vmta).await?,
        (None, Some(server_ref)) => ips.find_by_server_ref(server_ref).await?,
        (None, None) => None,
    };

    let counter = match event.event {
        CampaignEventKind::Delivered => Some(CounterKind::Delivered),
        CampaignEventKind::Opened => Some(CounterKind::Open),
        CampaignEventKind::Clicked => Some(CounterKind::Click),
        CampaignEventKind::Bounced => Some(CounterKind::Bounced),
        CampaignEventKind::Complained => Some(CounterKind::Complaint),
        // §9: "BOUNCED"/"COMPLAINED"-style labels with no first-class IP
        // state are recorded as event facts only; unsubscribed/deferred
        // carry no warmup-quota-relevant counter.
        CampaignEventKind::Unsubscribed | CampaignEventKind::Deferred => None,
    };

    if let Some(counter) = counter {
        record_and_count(
            &pool,
            &consolidator,
            ip.as_ref(),
            "campaign_event",
            Some(event.recipient.clone()),
            None,
            serde_json::json!({ "recipient": event.recipient, "event": event.event, "vmta": event.vmta, "server_ref": event.server_ref }),
            counter,
            1,
        )
        .await?;
    } else {
        record_event_only(
            &pool,
            ip.as_ref(),
            "campaign_event",
            Some(event.recipient.clone()),
            serde_json::json!({ "recipient": event.recipient, "event": event.event, "vmta": event.vmta, "server_ref": event.server_ref }),
        )
        .await?;
    }

    Ok(Json(serde_json::json!({ "recorded": true })))
}

/// Shared tail for every handler above: persist the audit-trail row, and if
/// the correlated IP is currently WARMING, bump its in-memory counter.
/// Silently skips persistence when no IP (and therefore no tenant) could be
/// correlated — the payload is still useful as a log line, not as a durable
/// row with no tenant to scope it to.
#[allow(clippy::too_many_arguments)]
async fn record_and_count(
    pool: &sqlx::PgPool,
    consolidator: &Consolidator,
    ip: Option<&crate::models::Ip>,
    kind: &str,
    recipient: Option<String>,
    domain: Option<String>,
    payload: Value,
    counter: CounterKind,
    n: i32,
) -> Result<(), Error> {
    let Some(ip) = ip else {
        tracing::warn!(kind, "inbound webhook event could not be correlated to any ip, dropping audit row");
        return Ok(());
    };

    IpEventRepository::new(pool.clone())
        .record(NewIpEvent {
            tenant_id: ip.tenant_id,
            ip_id: Some(ip.id),
            kind: kind.to_string(),
            recipient,
            domain,
            payload,
        })
        .await?;

    if ip.status == IpStatus::Warming {
        consolidator.increment_by(ip.id, counter, n);
    }

    Ok(())
}

async fn record_event_only(
    pool: &sqlx::PgPool,
    ip: Option<&crate::models::Ip>,
    kind: &str,
    recipient: Option<String>,
    payload: Value,
) -> Result<(), Error> {
    let Some(ip) = ip else {
        tracing::warn!(kind, "inbound webhook event could not be correlated to any ip, dropping audit row");
        return Ok(());
    };

    IpEventRepository::new(pool.clone())
        .record(NewIpEvent {
            tenant_id: ip.tenant_id,
            ip_id: Some(ip.id),
            kind: kind.to_string(),
            recipient,
            domain: None,
            payload,
        })
        .await?;

    Ok(())
}
