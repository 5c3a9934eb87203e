//! APIService availability controller
//!
//! The [`Context`] owns everything a reconcile pass needs: the observed
//! caches, the work queue, the dependency index, the status client and the
//! probe. Workers pull names from the queue, evaluate availability and write
//! the `Available` condition back.

pub mod availability;
pub mod status;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Client;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::apiservice::is_available;
use crate::cache::ObservedState;
use crate::config::ControllerConfig;
use crate::index::DependencyIndex;
use crate::metrics::{ReconcileTimer, UnavailabilityGauge, UNAVAILABLE_APISERVICES};
use crate::probe::{ClusterIpResolver, DiscoveryProbe, HttpDiscoveryProbe, ServiceResolver};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::router::EventRouter;
use crate::Error;

pub use availability::{evaluate, Reason, Verdict};
pub use status::{
    set_condition, update_status, ApiServiceStatusClient, KubeStatusClient, StatusUpdate,
};

/// What a successful reconcile pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The APIService is gone; nothing was evaluated or written
    Skipped,
    /// Status already matched the verdict
    Unchanged {
        /// Verdict of the pass
        available: bool,
    },
    /// A new status was written
    Updated {
        /// Verdict of the pass
        available: bool,
    },
}

/// Shared context for availability reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(state)
///     .kube_client(client)
///     .config(config)
///     .build()?;
/// ```
pub struct Context {
    /// Observed APIServices, Services and Endpoints
    pub state: ObservedState,
    /// Service -> APIService reverse index
    pub index: Arc<DependencyIndex>,
    /// Pending reconciliations
    pub queue: Arc<WorkQueue>,
    /// Status persistence (trait object for testability)
    pub status_client: Arc<dyn ApiServiceStatusClient>,
    /// Resolves backing Services to URLs
    pub resolver: Arc<dyn ServiceResolver>,
    /// Discovery health check
    pub probe: Arc<dyn DiscoveryProbe>,
    /// Per-APIService unavailability gauge
    pub gauge: Arc<UnavailabilityGauge>,
    /// Timing and concurrency settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder over the given caches
    pub fn builder(state: ObservedState) -> ContextBuilder {
        ContextBuilder::new(state)
    }

    /// Event router feeding this context's index and queue
    pub fn router(&self) -> EventRouter {
        EventRouter::new(self.index.clone(), self.queue.clone(), self.gauge.clone())
    }

    /// Run one reconcile pass for the named APIService
    ///
    /// Probe failures are written as a False condition first and then
    /// returned as [`Error::Probe`] so the caller retries with backoff.
    #[instrument(skip(self, name), fields(apiservice = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome, Error> {
        let Some(api_service) = self.state.api_service(name) else {
            debug!("APIService not in cache, skipping");
            return Ok(ReconcileOutcome::Skipped);
        };

        let verdict = availability::evaluate(
            &api_service,
            &self.state,
            self.resolver.as_ref(),
            self.probe.as_ref(),
        )
        .await;
        let available = verdict.is_available();
        self.gauge.set_unavailable(name, !available);

        // Deleted while the probe ran: the router has already dropped the series
        if self.state.api_service(name).is_none() {
            debug!("APIService deleted during evaluation");
            self.gauge.forget(name);
            return Ok(ReconcileOutcome::Skipped);
        }

        let now = Time(Utc::now());
        let update = match status::update_status(
            self.status_client.as_ref(),
            &api_service,
            verdict.to_condition(),
            now,
        )
        .await
        {
            Ok(update) => update,
            Err(Error::NotFound(_)) => {
                debug!("APIService deleted before status write");
                self.gauge.forget(name);
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if update == StatusUpdate::Updated {
            info!(
                was_available = is_available(&api_service),
                status = %verdict.status,
                reason = %verdict.reason,
                message = %verdict.message,
                "availability changed"
            );
        }

        if verdict.retryable {
            return Err(Error::probe(verdict.message));
        }

        Ok(match update {
            StatusUpdate::Unchanged => ReconcileOutcome::Unchanged { available },
            StatusUpdate::Updated => ReconcileOutcome::Updated { available },
        })
    }

    /// Enqueue every APIService in the cache; returns how many
    pub fn resync_once(&self) -> usize {
        let names = self.state.api_service_names();
        let count = names.len();
        for name in names {
            self.queue.add(name);
        }
        count
    }

    /// Process queue items until the queue shuts down or `cancel` fires
    ///
    /// An in-flight pass is dropped on cancellation, which also cancels its
    /// probe; no status is written for it.
    pub async fn run_worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        debug!(worker = id, "worker started");
        while let Some(name) = self.queue.get().await {
            let timer = ReconcileTimer::start();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.done(&name);
                    break;
                }
                result = self.reconcile(&name) => result,
            };

            match result {
                Ok(outcome) => {
                    timer.success();
                    self.queue.forget(&name);
                    trace!(worker = id, apiservice = %name, ?outcome, "reconciled");
                }
                Err(e) if self.queue.is_shutting_down() => {
                    timer.error();
                    debug!(worker = id, apiservice = %name, error = %e, "reconcile failed during shutdown");
                }
                Err(e) => {
                    timer.error();
                    warn!(
                        worker = id,
                        apiservice = %name,
                        error = %e,
                        kind = e.kind(),
                        retries = self.queue.retries(&name),
                        "reconcile failed, requeueing"
                    );
                    self.queue.requeue(&name);
                }
            }
            self.queue.done(&name);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Re-enqueue every known APIService on the resync interval
    pub async fn run_resync(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; initial adds come from the watches
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.resync_once();
                    trace!(count, "periodic resync");
                }
            }
        }
    }

    /// Wait for the caches, then run workers and the resync loop until `cancel`
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            ready = self.state.wait_until_ready() => ready?,
        }
        info!(
            workers = self.config.workers,
            apiservices = self.state.api_service_names().len(),
            "caches synced, starting workers"
        );

        let mut tasks = JoinSet::new();
        for id in 0..self.config.workers {
            tasks.spawn(Arc::clone(&self).run_worker(id, cancel.clone()));
        }
        tasks.spawn(Arc::clone(&self).run_resync(cancel.clone()));

        cancel.cancelled().await;
        self.queue.shutdown();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}

/// Builder for constructing [`Context`] instances
///
/// A status client is required: either [`kube_client`](Self::kube_client)
/// for production or [`status_client`](Self::status_client) for tests.
pub struct ContextBuilder {
    state: ObservedState,
    status_client: Option<Arc<dyn ApiServiceStatusClient>>,
    resolver: Option<Arc<dyn ServiceResolver>>,
    probe: Option<Arc<dyn DiscoveryProbe>>,
    gauge: Option<Arc<UnavailabilityGauge>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(state: ObservedState) -> Self {
        Self {
            state,
            status_client: None,
            resolver: None,
            probe: None,
            gauge: None,
            config: ControllerConfig::default(),
        }
    }

    /// Write status through the Kubernetes API
    pub fn kube_client(mut self, client: Client) -> Self {
        self.status_client = Some(Arc::new(KubeStatusClient::new(client)));
        self
    }

    /// Override the status client (primarily for testing)
    pub fn status_client(mut self, client: Arc<dyn ApiServiceStatusClient>) -> Self {
        self.status_client = Some(client);
        self
    }

    /// Override the Service resolver
    pub fn resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the discovery probe
    pub fn probe(mut self, probe: Arc<dyn DiscoveryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use a dedicated gauge instead of the process-wide one
    pub fn gauge(mut self, gauge: Arc<UnavailabilityGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Set timing and concurrency settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        self.config.validate()?;
        let status_client = self
            .status_client
            .ok_or_else(|| Error::config("a status client is required"))?;
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(ClusterIpResolver::new(self.state.service_store())),
        };
        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpDiscoveryProbe::from_config(&self.config)?),
        };
        let backoff = ExponentialBackoff::new(self.config.backoff_base, self.config.backoff_max);

        Ok(Context {
            state: self.state,
            index: Arc::new(DependencyIndex::new()),
            queue: Arc::new(WorkQueue::new(backoff)),
            status_client,
            resolver,
            probe,
            gauge: self
                .gauge
                .unwrap_or_else(|| Arc::clone(&UNAVAILABLE_APISERVICES)),
            config: self.config,
        })
    }
}
