//! Multi-provider router.
//!
//! Holds a prioritized pool of gateways implementing the same capability,
//! picks one per request, falls back across the pool on failure, and
//! fans batches out across providers under a global concurrency cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use vdoc_models::CapabilityOutput;

use crate::error::{ProviderError, ProviderResult};
use crate::gateway::CapabilityGateway;

/// How the router picks a provider for each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Always prefer the highest-priority available provider.
    Priority,
    /// Rotate through available providers.
    RoundRobin,
    /// Score by observed failure rate and latency, ties broken by priority.
    LoadBalanced,
}

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub policy: SelectionPolicy,
    /// Global cap on in-flight items during `process_parallel`.
    pub parallel_concurrency: usize,
    /// Jobs longer than this (seconds) get the boosted cap.
    pub long_job_threshold_secs: f64,
    /// Cap multiplier applied to long jobs.
    pub long_job_boost: usize,
    /// Cooldown applied to a provider that exhausted its retries.
    pub failure_cooldown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::Priority,
            parallel_concurrency: 8,
            long_job_threshold_secs: 1800.0,
            long_job_boost: 2,
            failure_cooldown: Duration::from_secs(60),
        }
    }
}

/// Aggregate outcome of one `process_parallel` call.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub succeeded: u32,
    pub failed: u32,
    /// Successful calls per provider name.
    pub provider_usage: HashMap<String, u32>,
    pub elapsed_ms: u64,
}

/// Per-item results plus aggregate stats. Results are index-aligned with
/// the submitted items; failed items carry an explicit empty output.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<CapabilityOutput>,
    pub stats: BatchStats,
}

/// Router over a prioritized pool of interchangeable gateways.
pub struct ProviderRouter {
    providers: Vec<Arc<CapabilityGateway>>,
    config: RouterConfig,
    cursor: AtomicUsize,
}

impl ProviderRouter {
    /// Build a router. `providers` are in priority order, highest first.
    pub fn new(providers: Vec<Arc<CapabilityGateway>>, config: RouterConfig) -> Self {
        Self {
            providers,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// The concurrency cap for a batch belonging to a job of the given
    /// duration. Long jobs get a boosted cap so wall-clock time stays
    /// bounded.
    pub fn parallel_cap(&self, video_duration_secs: f64) -> usize {
        let base = self.config.parallel_concurrency.max(1);
        if video_duration_secs > self.config.long_job_threshold_secs {
            base * self.config.long_job_boost.max(1)
        } else {
            base
        }
    }

    /// Index of the provider the policy would start with.
    fn selection_start(&self) -> usize {
        if self.providers.is_empty() {
            return 0;
        }
        match self.config.policy {
            SelectionPolicy::Priority => 0,
            SelectionPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.providers.len()
            }
            SelectionPolicy::LoadBalanced => {
                let mut best = 0;
                let mut best_score = f64::INFINITY;
                for (i, gateway) in self.providers.iter().enumerate() {
                    if !gateway.is_available() {
                        continue;
                    }
                    let stats = gateway.stats();
                    let score = stats.failure_rate() * 1000.0 + stats.avg_latency_ms;
                    // Strict comparison keeps priority order on ties.
                    if score < best_score {
                        best_score = score;
                        best = i;
                    }
                }
                best
            }
        }
    }

    /// Pick one currently-available provider, or `None` when every
    /// provider is cooling down or the pool is empty.
    pub fn select_provider(&self) -> Option<Arc<CapabilityGateway>> {
        if self.providers.is_empty() {
            return None;
        }
        let start = self.selection_start();
        (0..self.providers.len())
            .map(|offset| &self.providers[(start + offset) % self.providers.len()])
            .find(|g| g.is_available())
            .cloned()
    }

    /// Process one item, trying providers in selection order until one
    /// succeeds or all fail. All failures are aggregated into the error.
    pub async fn process_with_fallback(&self, input: &[u8]) -> ProviderResult<CapabilityOutput> {
        fallback_over(
            &self.providers,
            self.selection_start(),
            input,
            self.config.failure_cooldown,
        )
        .await
    }

    /// Distribute a batch across the pool under the global cap.
    ///
    /// Each item falls back across providers independently. If zero
    /// providers exist or every call fails, the item resolves to an
    /// explicit empty output so batch completion never blocks on
    /// provider availability.
    pub async fn process_parallel(
        &self,
        items: Vec<Vec<u8>>,
        video_duration_secs: f64,
    ) -> BatchOutcome {
        let started = Instant::now();
        let mut results = vec![CapabilityOutput::empty("none"); items.len()];
        let mut stats = BatchStats::default();

        if self.providers.is_empty() {
            warn!("No providers configured, resolving batch to empty results");
            stats.failed = items.len() as u32;
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            return BatchOutcome { results, stats };
        }

        let cap = self.parallel_cap(video_duration_secs);
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut tasks: JoinSet<(usize, ProviderResult<CapabilityOutput>)> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let providers = self.providers.clone();
            let start = self.selection_start();
            let cooldown = self.config.failure_cooldown;
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(ProviderError::NoProviders)),
                };
                let result = fallback_over(&providers, start, &item, cooldown).await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(output))) => {
                    stats.succeeded += 1;
                    *stats
                        .provider_usage
                        .entry(output.provider.clone())
                        .or_insert(0) += 1;
                    results[index] = output;
                }
                Ok((index, Err(e))) => {
                    debug!("Item {} failed on every provider: {}", index, e);
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!("Batch task panicked: {}", e);
                    stats.failed += 1;
                }
            }
        }

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        BatchOutcome { results, stats }
    }

    /// Stats snapshot per provider, in priority order.
    pub fn provider_stats(&self) -> Vec<(String, crate::gateway::GatewayStats)> {
        self.providers
            .iter()
            .map(|g| (g.name().to_string(), g.stats()))
            .collect()
    }
}

/// Try providers starting at `start`, wrapping around the pool.
async fn fallback_over(
    providers: &[Arc<CapabilityGateway>],
    start: usize,
    input: &[u8],
    cooldown: Duration,
) -> ProviderResult<CapabilityOutput> {
    if providers.is_empty() {
        return Err(ProviderError::NoProviders);
    }

    let mut errors = Vec::new();
    for offset in 0..providers.len() {
        let gateway = &providers[(start + offset) % providers.len()];
        if !gateway.is_available() {
            errors.push(format!("{}: cooling down", gateway.name()));
            continue;
        }
        match gateway.execute(input).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                // The gateway already exhausted its own retries; cool it
                // down so subsequent items prefer the healthy providers.
                if e.is_retryable() {
                    gateway.mark_unavailable(cooldown);
                }
                errors.push(format!("{}: {}", gateway.name(), e));
            }
        }
    }

    Err(ProviderError::AllProvidersFailed(errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::gateway::GatewayConfig;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use vdoc_models::CapabilityKind;

    struct FixedOcr {
        name: String,
        fail: bool,
        calls: AtomicU32,
    }

    impl FixedOcr {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Capability for FixedOcr {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Ocr
        }

        async fn call(&self, _input: &[u8]) -> ProviderResult<CapabilityOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::Overloaded("503".into()))
            } else {
                Ok(CapabilityOutput {
                    text: format!("text from {}", self.name),
                    confidence: 0.9,
                    provider: String::new(),
                    latency_ms: 0,
                    segments: Vec::new(),
                })
            }
        }
    }

    fn gateway(inner: Arc<FixedOcr>) -> Arc<CapabilityGateway> {
        Arc::new(CapabilityGateway::new(
            inner,
            GatewayConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                requests_per_window: 10_000,
                window: Duration::from_secs(1),
                ..GatewayConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_fallback_uses_next_provider() {
        let a = FixedOcr::new("a", true);
        let b = FixedOcr::new("b", false);
        let ga = gateway(a.clone());
        let gb = gateway(b.clone());
        let router = ProviderRouter::new(vec![ga.clone(), gb], RouterConfig::default());

        let out = router.process_with_fallback(b"img").await.unwrap();
        assert_eq!(out.provider, "b");
        assert!(ga.stats().failures > 0);
    }

    #[tokio::test]
    async fn test_all_providers_failing_aggregates_errors() {
        let router = ProviderRouter::new(
            vec![
                gateway(FixedOcr::new("a", true)),
                gateway(FixedOcr::new("b", true)),
            ],
            RouterConfig::default(),
        );

        let err = router.process_with_fallback(b"img").await.unwrap_err();
        match err {
            ProviderError::AllProvidersFailed(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_resolves_to_empty_results() {
        let router = ProviderRouter::new(Vec::new(), RouterConfig::default());
        let outcome = router
            .process_parallel(vec![b"a".to_vec(), b"b".to_vec()], 60.0)
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.is_empty()));
        assert_eq!(outcome.stats.failed, 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_with_per_item_fallback() {
        let a = FixedOcr::new("a", true);
        let b = FixedOcr::new("b", false);
        let router = ProviderRouter::new(
            vec![gateway(a), gateway(b)],
            RouterConfig::default(),
        );

        let items: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8]).collect();
        let outcome = router.process_parallel(items, 60.0).await;

        assert_eq!(outcome.stats.succeeded, 10);
        assert_eq!(outcome.stats.failed, 0);
        assert_eq!(outcome.stats.provider_usage.get("b"), Some(&10));
        assert!(outcome.results.iter().all(|r| r.provider == "b"));
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let a = FixedOcr::new("a", false);
        let b = FixedOcr::new("b", false);
        let router = ProviderRouter::new(
            vec![gateway(a.clone()), gateway(b.clone())],
            RouterConfig {
                policy: SelectionPolicy::RoundRobin,
                ..RouterConfig::default()
            },
        );

        for _ in 0..4 {
            router.process_with_fallback(b"x").await.unwrap();
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_long_job_boosts_parallel_cap() {
        let router = ProviderRouter::new(
            Vec::new(),
            RouterConfig {
                parallel_concurrency: 8,
                long_job_threshold_secs: 1800.0,
                long_job_boost: 2,
                ..RouterConfig::default()
            },
        );
        assert_eq!(router.parallel_cap(600.0), 8);
        assert_eq!(router.parallel_cap(3600.0), 16);
    }

    #[tokio::test]
    async fn test_select_skips_cooling_provider() {
        let a = FixedOcr::new("a", false);
        let b = FixedOcr::new("b", false);
        let ga = gateway(a);
        let gb = gateway(b);
        let router = ProviderRouter::new(vec![ga.clone(), gb], RouterConfig::default());

        ga.mark_unavailable(Duration::from_secs(60));
        let selected = router.select_provider().unwrap();
        assert_eq!(selected.name(), "b");
    }
}
