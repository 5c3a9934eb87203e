//! Service resolution and the discovery health probe
//!
//! The probe is the only network call in a reconcile pass. It resolves the
//! backing Service to a URL, then issues several concurrent GETs against the
//! discovery path; any 2xx answer marks the backend reachable. Every request
//! is bounded by the configured timeout, and redirects are not followed.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::select_ok;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::{ObjectRef, Store};
use reqwest::Url;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::config::ControllerConfig;
use crate::Error;

/// Service type that has neither cluster IP nor endpoints
pub const EXTERNAL_NAME_TYPE: &str = "ExternalName";

/// Resolves a Service port to a URL the controller can reach
#[cfg_attr(test, automock)]
pub trait ServiceResolver: Send + Sync {
    /// Resolve `namespace/name:port` to a base URL
    fn resolve(&self, namespace: &str, name: &str, port: i32) -> Result<Url, Error>;
}

/// Issues the health request against a resolved backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    /// Probe the discovery endpoint below `target`
    ///
    /// Returns `Ok(())` on a 2xx answer, `Error::Probe` otherwise.
    async fn probe(&self, target: &Url) -> Result<(), Error>;
}

/// Resolves Services to `https://<clusterIP>:<port>` from the Service cache
///
/// ExternalName services resolve to their external host name.
#[derive(Clone)]
pub struct ClusterIpResolver {
    services: Store<Service>,
}

impl ClusterIpResolver {
    /// Create a resolver reading from the given Service store
    pub fn new(services: Store<Service>) -> Self {
        Self { services }
    }
}

impl ServiceResolver for ClusterIpResolver {
    fn resolve(&self, namespace: &str, name: &str, port: i32) -> Result<Url, Error> {
        let service = self
            .services
            .get(&ObjectRef::new(name).within(namespace))
            .ok_or_else(|| {
                Error::resolution(format!("service/{} in {:?} is not present", name, namespace))
            })?;
        let spec = service.spec.as_ref().ok_or_else(|| {
            Error::resolution(format!("service/{} in {:?} has no spec", name, namespace))
        })?;

        if spec.type_.as_deref() == Some(EXTERNAL_NAME_TYPE) {
            let host = spec.external_name.as_deref().unwrap_or_default();
            if host.is_empty() {
                return Err(Error::resolution(format!(
                    "service/{} in {:?} has no external name",
                    name, namespace
                )));
            }
            return parse_url(host, port);
        }

        let cluster_ip = spec.cluster_ip.as_deref().unwrap_or_default();
        if cluster_ip.is_empty() || cluster_ip == "None" {
            return Err(Error::resolution(format!(
                "service/{} in {:?} has no cluster IP",
                name, namespace
            )));
        }

        let has_port = spec
            .ports
            .as_ref()
            .map(|ports| ports.iter().any(|p| p.port == port))
            .unwrap_or(false);
        if !has_port {
            return Err(Error::resolution(format!(
                "no service port {} found for service/{} in {:?}",
                port, name, namespace
            )));
        }

        parse_url(cluster_ip, port)
    }
}

fn parse_url(host: &str, port: i32) -> Result<Url, Error> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    Url::parse(&format!("https://{}:{}", host, port))
        .map_err(|e| Error::resolution(format!("invalid address {}:{}: {}", host, port, e)))
}

/// HTTP implementation of [`DiscoveryProbe`]
#[derive(Clone, Debug)]
pub struct HttpDiscoveryProbe {
    client: reqwest::Client,
    discovery_path: String,
    timeout: Duration,
    attempts: usize,
}

impl HttpDiscoveryProbe {
    /// Create a probe around an existing client
    pub fn new(
        client: reqwest::Client,
        discovery_path: impl Into<String>,
        timeout: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            client,
            discovery_path: discovery_path.into(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Build the probe and its HTTP client from controller configuration
    pub fn from_config(config: &ControllerConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.probe_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify)
            .build()
            .map_err(|e| Error::internal(format!("failed to build discovery client: {}", e)))?;

        Ok(Self::new(
            client,
            config.discovery_path.clone(),
            config.probe_timeout,
            config.probe_attempts,
        ))
    }

    /// Full URL probed for a resolved backend
    pub fn discovery_url(&self, target: &Url) -> Result<Url, Error> {
        target
            .join(&self.discovery_path)
            .map_err(|e| Error::probe(format!("invalid discovery URL for {}: {}", target, e)))
    }

    async fn attempt(&self, url: Url) -> Result<(), Error> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| Error::probe(format!("timed out after {:?} waiting for {}", self.timeout, url)))?
            .map_err(|e| Error::probe(format!("{}: {}", url, e)))?;

        let status = response.status();
        trace!(url = %url, status = status.as_u16(), "discovery response");
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::probe(format!(
                "bad status from {}: {}",
                url,
                status.as_u16()
            )))
        }
    }
}

#[async_trait]
impl DiscoveryProbe for HttpDiscoveryProbe {
    async fn probe(&self, target: &Url) -> Result<(), Error> {
        let url = self.discovery_url(target)?;
        let attempts = (0..self.attempts).map(|_| Box::pin(self.attempt(url.clone())));
        select_ok(attempts).await.map(|_| ())
    }
}
