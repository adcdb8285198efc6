use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{Ip, IpId, IpPurpose, IpStatus, TenantId};
use crate::provisioner::{CreateIpParams, Provisioner};

#[derive(Debug, Deserialize)]
pub struct CreateIpRequest {
    pub tenant_id: TenantId,
    pub address: IpNet,
    pub hostname: String,
    pub purpose: IpPurpose,
    #[serde(default = "default_weight")]
    pub weight: i16,
    pub vmta_name: Option<String>,
    pub pool_name: Option<String>,
    pub sender_email: Option<String>,
    pub node_id: Option<String>,
    pub dkim_key_path: Option<String>,
    pub from_name: Option<String>,
}

fn default_weight() -> i16 {
    100
}

#[derive(Debug, Serialize)]
pub struct IpResponse {
    pub id: IpId,
    pub tenant_id: TenantId,
    pub address: IpNet,
    pub hostname: String,
    pub purpose: IpPurpose,
    pub status: IpStatus,
    pub weight: i16,
    pub vmta_name: Option<String>,
    pub pool_name: Option<String>,
    pub mailwizz_server_ref: Option<String>,
    pub node_id: Option<String>,
}

impl From<Ip> for IpResponse {
    fn from(ip: Ip) -> Self {
        Self {
            id: ip.id,
            tenant_id: ip.tenant_id,
            address: ip.address,
            hostname: ip.hostname,
            purpose: ip.purpose,
            status: ip.status,
            weight: ip.weight,
            vmta_name: ip.vmta_name,
            pool_name: ip.pool_name,
            mailwizz_server_ref: ip.mailwizz_server_ref,
            node_id: ip.node_id,
        }
    }
}

/// `POST /ips` — provisions an IP on both the outbound node and the
/// campaign manager, or rolls back and fails if either leg can't complete
/// (§4.1's atomic two-phase create).
pub async fn create_ip(
    State(provisioner): State<Arc<Provisioner>>,
    Json(req): Json<CreateIpRequest>,
) -> Result<Json<IpResponse>, ApiError> {
    let ip = provisioner
        .create(CreateIpParams {
            tenant_id: req.tenant_id,
            address: req.address,
            hostname: req.hostname,
            purpose: req.purpose,
            weight: req.weight,
            vmta_name: req.vmta_name,
            pool_name: req.pool_name,
            sender_email: req.sender_email,
            node_id: req.node_id,
            dkim_key_path: req.dkim_key_path,
            from_name: req.from_name,
        })
        .await?;

    Ok(Json(ip.into()))
}

#[derive(Debug, Deserialize)]
pub struct DeleteIpQuery {
    #[serde(default)]
    pub deprovision: bool,
}

/// `DELETE /ips/{id}?deprovision=true` — removes the IP's database row, and
/// when `deprovision` is set, also tears down its node vMTA and campaign
/// manager delivery server.
pub async fn delete_ip(
    State(provisioner): State<Arc<Provisioner>>,
    Path(id): Path<IpId>,
    Query(query): Query<DeleteIpQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    provisioner.delete(id, query.deprovision).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
