//! Event router: watch events -> index updates and queue adds
//!
//! APIService events update the dependency index and enqueue the APIService
//! itself. Service and Endpoints events are fanned out through the index to
//! the APIServices that depend on them, so their cost scales with the number
//! of dependents rather than the number of registered APIServices.

use std::collections::HashSet;
use std::sync::Arc;

use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::runtime::watcher::Event;
use kube::Resource;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::apiservice::{backend_ref, ServiceKey};
use crate::index::DependencyIndex;
use crate::metrics::UnavailabilityGauge;
use crate::queue::WorkQueue;

/// Routes watch events into the dependency index and work queue
#[derive(Debug)]
pub struct EventRouter {
    index: Arc<DependencyIndex>,
    queue: Arc<WorkQueue>,
    gauge: Arc<UnavailabilityGauge>,
    /// Names seen since the last APIService `Init`, while a re-list is running
    relist: Mutex<Option<HashSet<String>>>,
}

impl EventRouter {
    /// Create a router over shared index, queue and gauge
    pub fn new(
        index: Arc<DependencyIndex>,
        queue: Arc<WorkQueue>,
        gauge: Arc<UnavailabilityGauge>,
    ) -> Self {
        Self {
            index,
            queue,
            gauge,
            relist: Mutex::new(None),
        }
    }

    /// Handle an APIService watch event
    pub fn on_api_service_event(&self, event: &Event<APIService>) {
        match event {
            Event::Apply(api) => self.api_service_changed(api),
            Event::InitApply(api) => {
                if let (Some(seen), Some(name)) =
                    (self.relist.lock().as_mut(), api.metadata.name.as_ref())
                {
                    seen.insert(name.clone());
                }
                self.api_service_changed(api);
            }
            Event::Delete(api) => self.api_service_deleted(api),
            Event::Init => {
                *self.relist.lock() = Some(HashSet::new());
            }
            // The store only swaps in the re-listed objects at InitDone, so
            // passes started during the re-list may have read the old state
            Event::InitDone => {
                if let Some(seen) = self.relist.lock().take() {
                    self.finish_relist(&seen);
                    for name in seen {
                        self.queue.add(name);
                    }
                }
            }
        }
    }

    /// Handle a Service watch event
    pub fn on_service_event<K>(&self, event: &Event<K>)
    where
        K: Resource,
    {
        self.on_backend_event(event, "service");
    }

    /// Handle an Endpoints watch event
    pub fn on_endpoints_event<K>(&self, event: &Event<K>)
    where
        K: Resource,
    {
        self.on_backend_event(event, "endpoints");
    }

    /// APIService added or updated
    pub fn api_service_changed(&self, api: &APIService) {
        let Some(name) = api.metadata.name.as_deref() else {
            return;
        };
        let backend = backend_ref(api).map(|b| b.service);
        let old = self.index.on_api_service_changed(name, backend.clone());
        if old != backend {
            debug!(
                apiservice = %name,
                old = ?old.as_ref().map(ToString::to_string),
                new = ?backend.as_ref().map(ToString::to_string),
                "APIService backend changed"
            );
        }
        self.queue.add(name);
    }

    /// APIService deleted: nothing left to reconcile
    pub fn api_service_deleted(&self, api: &APIService) {
        let Some(name) = api.metadata.name.as_deref() else {
            return;
        };
        self.index.remove(name);
        self.gauge.forget(name);
        self.queue.forget(name);
        debug!(apiservice = %name, "APIService deleted");
    }

    /// Enqueue every APIService backed by `service`; returns how many
    pub fn enqueue_dependents(&self, service: &ServiceKey) -> usize {
        let dependents = self.index.dependents(service);
        for name in &dependents {
            self.queue.add(name.as_str());
        }
        dependents.len()
    }

    fn on_backend_event<K>(&self, event: &Event<K>, kind: &'static str)
    where
        K: Resource,
    {
        match event {
            Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => {
                let Some(key) = ServiceKey::from_meta(obj.meta()) else {
                    return;
                };
                let count = self.enqueue_dependents(&key);
                if count > 0 {
                    trace!(kind, service = %key, dependents = count, "fan-out");
                }
            }
            // Changes missed while the watch was down surface here
            Event::InitDone => {
                for name in self.index.all_dependents() {
                    self.queue.add(name);
                }
            }
            Event::Init => {}
        }
    }

    fn finish_relist(&self, seen: &HashSet<String>) {
        let dropped = self.index.retain(|name| seen.contains(name));
        for name in &dropped {
            self.queue.forget(name);
        }
        self.gauge.retain(|name| seen.contains(name));
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped APIServices missing from re-list");
        }
    }
}
