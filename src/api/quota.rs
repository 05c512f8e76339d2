use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::RegistryError, names::validate_repository, quota::ProjectUsage, state::RegistryState,
};

#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    project: String,
}

#[derive(Debug, Deserialize)]
pub struct QuotaUpdate {
    /// Absent or null lifts the limit.
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ProjectQuota {
    project: String,
    #[serde(flatten)]
    usage: ProjectUsage,
}

pub(crate) async fn get(
    Path(ProjectRequest { project }): Path<ProjectRequest>,
    State(registry): State<Arc<RegistryState>>,
) -> Result<Json<ProjectQuota>, RegistryError> {
    validate_repository(&project)?;
    let usage = registry.quota.usage(&project).await?;

    Ok(Json(ProjectQuota { project, usage }))
}

pub(crate) async fn put(
    Path(ProjectRequest { project }): Path<ProjectRequest>,
    State(registry): State<Arc<RegistryState>>,
    Json(QuotaUpdate { limit }): Json<QuotaUpdate>,
) -> Result<Json<ProjectQuota>, RegistryError> {
    validate_repository(&project)?;
    let usage = registry.quota.set_limit(&project, limit).await?;

    info!(project, ?limit, used = usage.used, "Updated project quota");

    Ok(Json(ProjectQuota { project, usage }))
}
