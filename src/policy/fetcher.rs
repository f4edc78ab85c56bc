//! Policy resolution with a TTL cache.
//!
//! Resolves a caller token to a [`Policy`] via the external policy service,
//! caching successful results. Every failure path falls back to the
//! configured default policy with a warning; executions never fail because
//! the policy service is down. Failed lookups are not cached, so a
//! transient outage does not pin a bad result.
//!
//! Concurrent misses for the same token coalesce into a single upstream
//! request (per-key lock; followers re-check the cache after acquiring it).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};

use crate::config::DefaultPolicyMode;
use crate::error::{Error, Result};
use crate::policy::model::{Policy, PolicySource, PolicyWire};

/// Client for the external policy service.
#[async_trait]
pub trait PolicyService: Send + Sync {
    /// Fetch the wire-format policy for a bearer token.
    async fn fetch(&self, token: &SecretString) -> Result<PolicyWire>;
}

/// Real policy service client: `GET {base_url}/policies` with the caller's
/// bearer token. Any non-200 status is a fetch failure.
pub struct HttpPolicyService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPolicyService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PolicyService for HttpPolicyService {
    async fn fetch(&self, token: &SecretString) -> Result<PolicyWire> {
        let url = format!("{}/policies", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| Error::PolicyFetchFailed {
                reason: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::PolicyFetchFailed {
                reason: format!("policy service returned {}", status),
            });
        }

        response
            .json::<PolicyWire>()
            .await
            .map_err(|e| Error::PolicyFetchFailed {
                reason: format!("invalid policy body: {}", e),
            })
    }
}

/// Outcome of policy resolution. Failures carry the fallback policy plus an
/// error description; they are never surfaced as execution failures.
#[derive(Debug, Clone)]
pub struct PolicyResolution {
    pub policy: Arc<Policy>,
    pub source: PolicySource,
    pub error: Option<String>,
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    policy: Arc<Policy>,
    fetched_at: Instant,
}

/// Token -> policy resolver with TTL cache and single-flight misses.
pub struct PolicyFetcher {
    service: Arc<dyn PolicyService>,
    ttl: Duration,
    fetch_deadline: Duration,
    enabled: bool,
    default_mode: DefaultPolicyMode,
    cache: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PolicyFetcher {
    pub fn new(
        service: Arc<dyn PolicyService>,
        ttl: Duration,
        enabled: bool,
        default_mode: DefaultPolicyMode,
    ) -> Self {
        Self {
            service,
            ttl,
            fetch_deadline: Duration::from_secs(10),
            enabled,
            default_mode,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A fetcher that never consults a service and always resolves the
    /// default policy. Used when `ENABLE_POLICY` is off.
    pub fn disabled(default_mode: DefaultPolicyMode) -> Self {
        struct NoService;

        #[async_trait]
        impl PolicyService for NoService {
            async fn fetch(&self, _token: &SecretString) -> Result<PolicyWire> {
                Err(Error::PolicyFetchFailed {
                    reason: "policy resolution disabled".to_string(),
                })
            }
        }

        Self::new(Arc::new(NoService), Duration::ZERO, false, default_mode)
    }

    /// Resolve the policy for a caller token.
    pub async fn fetch_policy(&self, token: Option<&SecretString>) -> PolicyResolution {
        if !self.enabled {
            return self.default_resolution(None);
        }

        let token = match token {
            Some(t) if !t.expose_secret().is_empty() => t,
            _ => return self.default_resolution(Some("no token".to_string())),
        };

        let key = token.expose_secret().to_string();

        if let Some(policy) = self.cached(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return PolicyResolution {
                policy,
                source: PolicySource::Caller,
                error: None,
            };
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Single-flight: one upstream request per missing token.
        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        // A concurrent caller may have filled the cache while we waited.
        if let Some(policy) = self.cached(&key).await {
            return PolicyResolution {
                policy,
                source: PolicySource::Caller,
                error: None,
            };
        }

        let outcome = tokio::time::timeout(self.fetch_deadline, self.service.fetch(token)).await;

        let resolution = match outcome {
            Ok(Ok(wire)) => {
                let policy = Arc::new(Policy::from_wire(wire));
                self.cache.write().await.insert(
                    key.clone(),
                    CacheEntry {
                        policy: policy.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                PolicyResolution {
                    policy,
                    source: PolicySource::Caller,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "policy fetch failed, falling back to default policy");
                self.default_resolution(Some(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    deadline = ?self.fetch_deadline,
                    "policy fetch timed out, falling back to default policy"
                );
                self.default_resolution(Some("policy fetch timed out".to_string()))
            }
        };

        self.inflight.lock().await.remove(&key);
        resolution
    }

    /// Remove one entry, or the whole cache when no token is given.
    pub async fn invalidate(&self, token: Option<&str>) {
        let mut cache = self.cache.write().await;
        match token {
            Some(t) => {
                cache.remove(t);
            }
            None => cache.clear(),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    async fn cached(&self, key: &str) -> Option<Arc<Policy>> {
        let cache = self.cache.read().await;
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.policy.clone())
        } else {
            None
        }
    }

    fn default_resolution(&self, error: Option<String>) -> PolicyResolution {
        let policy = match self.default_mode {
            DefaultPolicyMode::DenyAll => Policy::deny_all(),
            DefaultPolicyMode::Permissive => {
                tracing::warn!("permissive default policy selected");
                Policy::permissive()
            }
        };

        PolicyResolution {
            policy: Arc::new(policy),
            source: PolicySource::Default,
            error,
        }
    }
}
