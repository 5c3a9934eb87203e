//! Observed-state caches
//!
//! Read-only views over the kube-rs reflector stores for APIServices,
//! Services and Endpoints. The stores are fed by the watch streams in
//! [`crate::watch`]; workers only ever read from them.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::runtime::reflector::{ObjectRef, Store};

use crate::apiservice::ServiceKey;
use crate::Error;

/// The three caches a reconcile pass reads from
#[derive(Clone)]
pub struct ObservedState {
    api_services: Store<APIService>,
    services: Store<Service>,
    endpoints: Store<Endpoints>,
}

impl ObservedState {
    /// Wrap existing reflector stores
    pub fn new(
        api_services: Store<APIService>,
        services: Store<Service>,
        endpoints: Store<Endpoints>,
    ) -> Self {
        Self {
            api_services,
            services,
            endpoints,
        }
    }

    /// Latest known APIService with the given name
    pub fn api_service(&self, name: &str) -> Option<Arc<APIService>> {
        self.api_services.get(&ObjectRef::new(name))
    }

    /// Latest known Service
    pub fn service(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.services
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    /// Latest known Endpoints of a Service
    pub fn endpoints(&self, key: &ServiceKey) -> Option<Arc<Endpoints>> {
        self.endpoints
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }

    /// Names of every APIService in the cache
    pub fn api_service_names(&self) -> Vec<String> {
        self.api_services
            .state()
            .iter()
            .filter_map(|api| api.metadata.name.clone())
            .collect()
    }

    /// Service store, for resolvers that read addresses from the cache
    pub fn service_store(&self) -> Store<Service> {
        self.services.clone()
    }

    /// Wait until every store has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        self.api_services
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal(format!("apiservice cache: {}", e)))?;
        self.services
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal(format!("service cache: {}", e)))?;
        self.endpoints
            .wait_until_ready()
            .await
            .map_err(|e| Error::internal(format!("endpoints cache: {}", e)))?;
        Ok(())
    }
}
