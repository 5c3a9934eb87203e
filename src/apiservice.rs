//! Helpers over the `apiregistration.k8s.io/v1` APIService type
//!
//! An APIService is either local (served in-process by the aggregator) or
//! remote (backed by a Service reference). Everything the controller needs to
//! know about that distinction goes through [`backend_ref`].

use std::fmt;

use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition,
};

/// Condition type published by this controller
pub const AVAILABLE_CONDITION: &str = "Available";

/// Port assumed when a service reference omits one
pub const DEFAULT_SERVICE_PORT: i32 = 443;

/// Status value of a condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition could not be determined
    Unknown,
}

impl ConditionStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse the wire representation; anything unrecognised is Unknown
    pub fn parse(value: &str) -> Self {
        match value {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a backing Service: (namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    /// Service namespace
    pub namespace: String,
    /// Service name
    pub name: String,
}

impl ServiceKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object's metadata, if both fields are set
    pub fn from_meta(
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Option<Self> {
        match (meta.namespace.as_deref(), meta.name.as_deref()) {
            (Some(namespace), Some(name)) => Some(Self::new(namespace, name)),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The Service and port a remote APIService is served from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendRef {
    /// Service identity
    pub service: ServiceKey,
    /// Service port number
    pub port: i32,
}

/// Backend of an APIService, or `None` when it is local
pub fn backend_ref(api_service: &APIService) -> Option<BackendRef> {
    let service = api_service.spec.as_ref()?.service.as_ref()?;
    Some(BackendRef {
        service: ServiceKey::new(
            service.namespace.clone().unwrap_or_default(),
            service.name.clone().unwrap_or_default(),
        ),
        port: service.port.unwrap_or(DEFAULT_SERVICE_PORT),
    })
}

/// Conditions currently recorded in the APIService status
pub fn conditions(api_service: &APIService) -> &[APIServiceCondition] {
    api_service
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// The `Available` condition, if one has been published
pub fn available_condition(api_service: &APIService) -> Option<&APIServiceCondition> {
    conditions(api_service)
        .iter()
        .find(|c| c.type_ == AVAILABLE_CONDITION)
}

/// Whether the published `Available` condition is `True`
pub fn is_available(api_service: &APIService) -> bool {
    available_condition(api_service)
        .map(|c| ConditionStatus::parse(&c.status) == ConditionStatus::True)
        .unwrap_or(false)
}
