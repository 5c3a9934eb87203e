//! Availability evaluation for a single APIService
//!
//! Evaluation is an ordered pipeline. Each stage either yields what the next
//! stage needs or short-circuits with the final [`Verdict`]; the cache checks
//! come first so a missing Service or Endpoints never costs a network call.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition,
};
use tracing::debug;

use crate::apiservice::{backend_ref, BackendRef, ConditionStatus, AVAILABLE_CONDITION};
use crate::cache::ObservedState;
use crate::probe::{DiscoveryProbe, ServiceResolver, EXTERNAL_NAME_TYPE};
use crate::Error;

/// Longest condition message written to the API server, in bytes
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Reason attached to the `Available` condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// Served in-process by the aggregator
    Local,
    /// Backing Service is not in the cache
    ServiceNotFound,
    /// Backing Service does not expose the declared port
    ServicePortError,
    /// Endpoints of the backing Service are not in the cache
    EndpointsNotFound,
    /// No ready address carries the expected port name
    MissingEndpoints,
    /// Discovery probe failed
    FailedDiscoveryCheck,
    /// Every check passed
    Passed,
}

impl Reason {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::ServiceNotFound => "ServiceNotFound",
            Self::ServicePortError => "ServicePortError",
            Self::EndpointsNotFound => "EndpointsNotFound",
            Self::MissingEndpoints => "MissingEndpoints",
            Self::FailedDiscoveryCheck => "FailedDiscoveryCheck",
            Self::Passed => "Passed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one evaluation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    /// Condition status
    pub status: ConditionStatus,
    /// Condition reason
    pub reason: Reason,
    /// Human-readable detail
    pub message: String,
    /// Whether the pass should be retried with backoff
    pub retryable: bool,
}

impl Verdict {
    fn available(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::True,
            reason,
            message: message.into(),
            retryable: false,
        }
    }

    fn unavailable(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            status: ConditionStatus::False,
            reason,
            message: truncate_message(message.into(), MAX_MESSAGE_LEN),
            retryable: false,
        }
    }

    fn local() -> Self {
        Self::available(Reason::Local, "Local APIs are always available")
    }

    fn passed() -> Self {
        Self::available(Reason::Passed, "all checks passed")
    }

    /// Whether the APIService is considered available
    pub fn is_available(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// `Available` condition carrying this verdict, without a transition time
    pub fn to_condition(&self) -> APIServiceCondition {
        APIServiceCondition {
            type_: AVAILABLE_CONDITION.to_string(),
            status: self.status.as_str().to_string(),
            reason: Some(self.reason.as_str().to_string()),
            message: Some(self.message.clone()),
            last_transition_time: None,
        }
    }
}

/// Evaluate the availability of `api_service` against the observed state
///
/// Always yields exactly one verdict. The resolver and probe are only
/// consulted once every cache check has passed.
pub async fn evaluate(
    api_service: &APIService,
    state: &ObservedState,
    resolver: &dyn ServiceResolver,
    probe: &dyn DiscoveryProbe,
) -> Verdict {
    match run_checks(api_service, state, resolver, probe).await {
        Ok(verdict) | Err(verdict) => verdict,
    }
}

async fn run_checks(
    api_service: &APIService,
    state: &ObservedState,
    resolver: &dyn ServiceResolver,
    probe: &dyn DiscoveryProbe,
) -> Result<Verdict, Verdict> {
    let Some(backend) = backend_ref(api_service) else {
        return Ok(Verdict::local());
    };

    let service = lookup_service(state, &backend)?;
    if is_external_name(&service) {
        debug!(service = %backend.service, "ExternalName service, skipping port and endpoint checks");
    } else {
        let port_name = matched_port_name(&service, &backend)?;
        let endpoints = lookup_endpoints(state, &backend)?;
        require_ready_address(&endpoints, &backend, &port_name)?;
    }

    discovery_check(resolver, probe, &backend).await?;
    Ok(Verdict::passed())
}

fn describe(backend: &BackendRef) -> String {
    format!(
        "service/{} in {:?}",
        backend.service.name, backend.service.namespace
    )
}

fn lookup_service(state: &ObservedState, backend: &BackendRef) -> Result<Arc<Service>, Verdict> {
    state.service(&backend.service).ok_or_else(|| {
        Verdict::unavailable(
            Reason::ServiceNotFound,
            format!("{} is not present", describe(backend)),
        )
    })
}

fn is_external_name(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(EXTERNAL_NAME_TYPE)
}

/// Name of the Service port matching the declared number; empty when unnamed
fn matched_port_name(service: &Service, backend: &BackendRef) -> Result<String, Verdict> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == backend.port))
        .map(|p| p.name.clone().unwrap_or_default())
        .ok_or_else(|| {
            Verdict::unavailable(
                Reason::ServicePortError,
                format!(
                    "{} is not listening on port {}",
                    describe(backend),
                    backend.port
                ),
            )
        })
}

fn lookup_endpoints(
    state: &ObservedState,
    backend: &BackendRef,
) -> Result<Arc<Endpoints>, Verdict> {
    state.endpoints(&backend.service).ok_or_else(|| {
        Verdict::unavailable(
            Reason::EndpointsNotFound,
            format!("cannot find endpoints for {}", describe(backend)),
        )
    })
}

fn require_ready_address(
    endpoints: &Endpoints,
    backend: &BackendRef,
    port_name: &str,
) -> Result<(), Verdict> {
    let found = endpoints.subsets.iter().flatten().any(|subset| {
        let has_address = subset.addresses.as_ref().is_some_and(|a| !a.is_empty());
        has_address
            && subset
                .ports
                .iter()
                .flatten()
                .any(|p| p.name.as_deref().unwrap_or_default() == port_name)
    });

    if found {
        Ok(())
    } else {
        Err(Verdict::unavailable(
            Reason::MissingEndpoints,
            format!(
                "endpoints for {} have no addresses with port name {:?}",
                describe(backend),
                port_name
            ),
        ))
    }
}

async fn discovery_check(
    resolver: &dyn ServiceResolver,
    probe: &dyn DiscoveryProbe,
    backend: &BackendRef,
) -> Result<(), Verdict> {
    let failed = |target: &str, err: Error| {
        let mut verdict = Verdict::unavailable(
            Reason::FailedDiscoveryCheck,
            format!("failing or missing response from {}: {}", target, detail(&err)),
        );
        verdict.retryable = true;
        verdict
    };

    let target = resolver
        .resolve(
            &backend.service.namespace,
            &backend.service.name,
            backend.port,
        )
        .map_err(|e| failed(&describe(backend), e))?;

    probe
        .probe(&target)
        .await
        .map_err(|e| failed(target.as_str(), e))
}

fn detail(err: &Error) -> String {
    match err {
        Error::Probe(msg) | Error::Resolution(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Cut `message` to at most `max` bytes on a character boundary
pub fn truncate_message(mut message: String, max: usize) -> String {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    message
}
