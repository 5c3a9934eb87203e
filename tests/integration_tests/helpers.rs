//! Shared fixtures: objects, stores, a local discovery backend and a
//! recording status client

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition, APIServiceSpec, ServiceReference,
};
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use parking_lot::Mutex;
use reqwest::Url;

use apiservice_availability::apiservice::available_condition;
use apiservice_availability::cache::ObservedState;
use apiservice_availability::config::ControllerConfig;
use apiservice_availability::controller::{ApiServiceStatusClient, Context};
use apiservice_availability::metrics::UnavailabilityGauge;
use apiservice_availability::probe::{HttpDiscoveryProbe, ServiceResolver};
use apiservice_availability::Error;

pub const NAMESPACE: &str = "foo";
pub const SERVICE: &str = "bar";
pub const PORT: i32 = 443;
pub const PORT_NAME: &str = "https";

// =============================================================================
// Objects
// =============================================================================

pub fn local_api_service(name: &str) -> APIService {
    APIService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(APIServiceSpec::default()),
        status: None,
    }
}

pub fn remote_api_service(name: &str, service: &str) -> APIService {
    APIService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(APIServiceSpec {
            service: Some(ServiceReference {
                namespace: Some(NAMESPACE.to_string()),
                name: Some(service.to_string()),
                port: Some(PORT),
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(NAMESPACE.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub fn service(name: &str) -> Service {
    Service {
        metadata: meta(name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("10.96.0.10".to_string()),
            ports: Some(vec![ServicePort {
                port: PORT,
                name: Some(PORT_NAME.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn endpoints(name: &str) -> Endpoints {
    Endpoints {
        metadata: meta(name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.244.0.5".to_string(),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                name: Some(PORT_NAME.to_string()),
                port: 8443,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

pub fn condition_of(api: &APIService) -> APIServiceCondition {
    available_condition(api)
        .cloned()
        .expect("written object carries an Available condition")
}

// =============================================================================
// Stores
// =============================================================================

/// Hand-fed reflector stores
#[derive(Default)]
pub struct Stores {
    pub api_services: Writer<APIService>,
    pub services: Writer<Service>,
    pub endpoints: Writer<Endpoints>,
}

impl Stores {
    /// Stores holding one healthy backing Service with endpoints
    pub fn with_backend() -> Self {
        let mut stores = Self::default();
        stores.services.apply_watcher_event(&Event::Apply(service(SERVICE)));
        stores
            .endpoints
            .apply_watcher_event(&Event::Apply(endpoints(SERVICE)));
        stores
    }

    pub fn state(&self) -> ObservedState {
        ObservedState::new(
            self.api_services.as_reader(),
            self.services.as_reader(),
            self.endpoints.as_reader(),
        )
    }

    pub fn put_api_service(&mut self, api: APIService) {
        self.api_services.apply_watcher_event(&Event::Apply(api));
    }

    /// Complete an initial list on every store so `wait_until_ready` returns
    pub fn mark_ready(&mut self) {
        self.api_services.apply_watcher_event(&Event::Init);
        self.api_services.apply_watcher_event(&Event::InitDone);
        self.services.apply_watcher_event(&Event::Init);
        self.services.apply_watcher_event(&Event::InitApply(service(SERVICE)));
        self.services.apply_watcher_event(&Event::InitDone);
        self.endpoints.apply_watcher_event(&Event::Init);
        self.endpoints
            .apply_watcher_event(&Event::InitApply(endpoints(SERVICE)));
        self.endpoints.apply_watcher_event(&Event::InitDone);
    }
}

// =============================================================================
// Discovery backend
// =============================================================================

/// Serve `app` on an ephemeral local port
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("discovery backend");
    });
    addr
}

/// Resolves every Service to the same local backend
pub struct FixedResolver(pub Url);

impl FixedResolver {
    pub fn at(addr: SocketAddr) -> Self {
        Self(Url::parse(&format!("http://{}", addr)).expect("valid backend URL"))
    }
}

impl ServiceResolver for FixedResolver {
    fn resolve(&self, _namespace: &str, _name: &str, _port: i32) -> Result<Url, Error> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Status client
// =============================================================================

/// Records every status write instead of sending it
#[derive(Default)]
pub struct RecordingStatusClient {
    writes: Mutex<Vec<APIService>>,
}

impl RecordingStatusClient {
    pub fn writes(&self) -> Vec<APIService> {
        self.writes.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn last(&self) -> Option<APIService> {
        self.writes.lock().last().cloned()
    }

    /// Latest write for the named APIService
    pub fn last_for(&self, name: &str) -> Option<APIService> {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|api| api.metadata.name.as_deref() == Some(name))
            .cloned()
    }
}

#[async_trait]
impl ApiServiceStatusClient for RecordingStatusClient {
    async fn update_status(&self, api_service: &APIService) -> Result<(), Error> {
        self.writes.lock().push(api_service.clone());
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        probe_timeout: Duration::from_millis(500),
        probe_attempts: 2,
        ..Default::default()
    }
}

/// Context probing `backend` over real HTTP with recorded status writes
pub fn context(
    state: ObservedState,
    backend: SocketAddr,
    status: Arc<RecordingStatusClient>,
    config: ControllerConfig,
) -> Context {
    let probe = HttpDiscoveryProbe::from_config(&config).expect("probe client");
    Context::builder(state)
        .status_client(status)
        .resolver(Arc::new(FixedResolver::at(backend)))
        .probe(Arc::new(probe))
        .gauge(Arc::new(UnavailabilityGauge::new()))
        .config(config)
        .build()
        .expect("context")
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
