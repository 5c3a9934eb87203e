//! Persisting the `Available` condition
//!
//! The writer computes the new status from the last observed object, skips the
//! write when nothing changed semantically, and otherwise issues exactly one
//! status update guarded by the object's `resourceVersion`.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition,
};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::apiservice::{available_condition, ConditionStatus};
use crate::metrics::record_unavailable_transition;
use crate::Error;

/// Status persistence for APIServices
///
/// Implementations must surface optimistic-concurrency rejections as
/// [`Error::Conflict`] and vanished objects as [`Error::NotFound`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiServiceStatusClient: Send + Sync {
    /// Replace the status subresource with the status of `api_service`
    async fn update_status(&self, api_service: &APIService) -> Result<(), Error>;
}

/// Production status client backed by the Kubernetes API
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Create a status client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApiServiceStatusClient for KubeStatusClient {
    async fn update_status(&self, api_service: &APIService) -> Result<(), Error> {
        let name = api_service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("APIService has no name"))?;
        let api: Api<APIService> = Api::all(self.client.clone());

        // resourceVersion travels with the body, so a stale write gets a 409
        let body = serde_json::to_vec(api_service)
            .map_err(|e| Error::serialization(format!("APIService {}: {}", name, e)))?;

        api.replace_status(name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::from_status_write(name, e))?;
        Ok(())
    }
}

/// Result of a status update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Status already matched; nothing was written
    Unchanged,
    /// A new status was written
    Updated,
}

/// Set a condition in place, keeping conditions of other types
///
/// The transition time is carried over when the status did not change and
/// stamped with `now` otherwise.
pub fn set_condition(
    conditions: &mut Vec<APIServiceCondition>,
    mut condition: APIServiceCondition,
    now: Time,
) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone().or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

/// Write `condition` onto `original` if it changes the status
pub async fn update_status(
    client: &dyn ApiServiceStatusClient,
    original: &APIService,
    condition: APIServiceCondition,
    now: Time,
) -> Result<StatusUpdate, Error> {
    let previous = available_condition(original).map(|c| ConditionStatus::parse(&c.status));
    let next = ConditionStatus::parse(&condition.status);
    let reason = condition.reason.clone().unwrap_or_default();

    let mut updated = original.clone();
    let status = updated.status.get_or_insert_with(Default::default);
    set_condition(status.conditions.get_or_insert_with(Vec::new), condition, now);

    if updated.status == original.status {
        return Ok(StatusUpdate::Unchanged);
    }

    client.update_status(&updated).await?;

    let name = original.metadata.name.as_deref().unwrap_or_default();
    if next == ConditionStatus::False && previous != Some(ConditionStatus::False) {
        record_unavailable_transition(name, &reason);
    }
    debug!(
        apiservice = %name,
        status = %next,
        reason = %reason,
        "status updated"
    );
    Ok(StatusUpdate::Updated)
}
