//! Watch streams for APIServices, Services and Endpoints
//!
//! Each stream feeds a reflector store (read by workers through
//! [`ObservedState`]) and then the [`EventRouter`]. The store is updated
//! before the router sees the event, so a worker woken by the router always
//! reads state at least as new as the event that woke it. During a re-list
//! the store only swaps in the new objects on `InitDone`; the router queues
//! every re-listed name again at that point.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::runtime::reflector::{reflector, store::Writer};
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::ObservedState;
use crate::router::EventRouter;

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so the API server closes idle watches first.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// A boxed watch loop
pub type WatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Reflector writers for the three watched kinds
///
/// Readers are handed out through [`Reflectors::state`] before the watches
/// start, so the controller can be built first and the watches wired to its
/// router afterwards.
pub struct Reflectors {
    api_services: Writer<APIService>,
    services: Writer<Service>,
    endpoints: Writer<Endpoints>,
}

impl Default for Reflectors {
    fn default() -> Self {
        Self::new()
    }
}

impl Reflectors {
    /// Create empty stores
    pub fn new() -> Self {
        Self {
            api_services: Writer::default(),
            services: Writer::default(),
            endpoints: Writer::default(),
        }
    }

    /// Read side of the stores
    pub fn state(&self) -> ObservedState {
        ObservedState::new(
            self.api_services.as_reader(),
            self.services.as_reader(),
            self.endpoints.as_reader(),
        )
    }

    /// Build the watch loops; they run until `cancel` fires
    pub fn into_watches(
        self,
        client: Client,
        router: Arc<EventRouter>,
        cancel: CancellationToken,
    ) -> Vec<WatchFuture> {
        info!("- APIService, Service and Endpoints watches");

        let api_router = Arc::clone(&router);
        let service_router = Arc::clone(&router);
        let endpoints_router = router;

        vec![
            watch_loop(
                "apiservice",
                Api::<APIService>::all(client.clone()),
                self.api_services,
                cancel.clone(),
                move |event| api_router.on_api_service_event(event),
            ),
            watch_loop(
                "service",
                Api::<Service>::all(client.clone()),
                self.services,
                cancel.clone(),
                move |event| service_router.on_service_event(event),
            ),
            watch_loop(
                "endpoints",
                Api::<Endpoints>::all(client),
                self.endpoints,
                cancel,
                move |event| endpoints_router.on_endpoints_event(event),
            ),
        ]
    }
}

fn watch_loop<K, F>(
    kind: &'static str,
    api: Api<K>,
    writer: Writer<K>,
    cancel: CancellationToken,
    on_event: F,
) -> WatchFuture
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    F: Fn(&watcher::Event<K>) + Send + 'static,
{
    let stream = reflector(
        writer,
        watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)).default_backoff(),
    );

    Box::pin(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => on_event(&event),
                    Some(Err(e)) => warn!(kind, error = %e, "watch error"),
                    None => break,
                },
            }
        }
        info!(kind, "watch stopped");
    })
}
