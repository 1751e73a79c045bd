//! Rate-limited capability gateway.
//!
//! Wraps one [`Capability`] with a concurrency cap, a sliding-window rate
//! limit, retry with exponential backoff for transient failures, and an
//! availability cooldown a caller can trip after repeated failure.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use vdoc_models::{CapabilityKind, CapabilityOutput};

use crate::capability::Capability;
use crate::error::{ProviderError, ProviderResult};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Weight of the newest latency sample in the moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum calls in flight at once.
    pub max_concurrency: usize,
    /// Requests allowed per rolling window.
    pub requests_per_window: u32,
    /// Length of the rolling window.
    pub window: Duration,
    /// Total attempts per item (initial call plus retries).
    pub max_attempts: u32,
    /// Base backoff delay, doubled per retry.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Hard timeout per call.
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            requests_per_window: 60,
            window: Duration::from_secs(60),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl GatewayConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Running statistics for one gateway.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Exponential moving average of successful-call latency.
    pub avg_latency_ms: f64,
}

impl GatewayStats {
    /// Fraction of attempts that failed, in `[0, 1]`.
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }
}

/// A [`Capability`] behind concurrency and rate limits.
pub struct CapabilityGateway {
    inner: Arc<dyn Capability>,
    config: GatewayConfig,
    semaphore: Arc<Semaphore>,
    limiter: DirectLimiter,
    stats: Mutex<GatewayStats>,
    unavailable_until: RwLock<Option<Instant>>,
}

impl CapabilityGateway {
    pub fn new(inner: Arc<dyn Capability>, config: GatewayConfig) -> Self {
        let burst = NonZeroU32::new(config.requests_per_window).unwrap_or(NonZeroU32::MIN);
        let period = config.window / config.requests_per_window.max(1);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            limiter: RateLimiter::direct(quota),
            stats: Mutex::new(GatewayStats::default()),
            unavailable_until: RwLock::new(None),
            inner,
            config,
        }
    }

    /// Provider name of the wrapped capability.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> CapabilityKind {
        self.inner.kind()
    }

    /// Whether the gateway is currently accepting calls.
    pub fn is_available(&self) -> bool {
        match *self.unavailable_until.read().unwrap() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Self-exclude for `cooldown`. The gateway recovers automatically
    /// once the cooldown elapses.
    pub fn mark_unavailable(&self, cooldown: Duration) {
        warn!(
            provider = self.name(),
            "Marking provider unavailable for {:?}", cooldown
        );
        *self.unavailable_until.write().unwrap() = Some(Instant::now() + cooldown);
    }

    /// Snapshot of the running statistics.
    pub fn stats(&self) -> GatewayStats {
        self.stats.lock().unwrap().clone()
    }

    fn record_attempt(&self) {
        self.stats.lock().unwrap().attempts += 1;
    }

    fn record_success(&self, latency_ms: u64) {
        let mut stats = self.stats.lock().unwrap();
        stats.successes += 1;
        if stats.avg_latency_ms == 0.0 {
            stats.avg_latency_ms = latency_ms as f64;
        } else {
            stats.avg_latency_ms = stats.avg_latency_ms * (1.0 - LATENCY_EWMA_ALPHA)
                + latency_ms as f64 * LATENCY_EWMA_ALPHA;
        }
    }

    fn record_failure(&self) {
        self.stats.lock().unwrap().failures += 1;
    }

    /// Execute one call through the limits.
    ///
    /// Retryable failures (timeout, 429/503, network) are retried with
    /// exponential backoff up to the configured attempt count; fatal
    /// failures (bad credentials, invalid input) propagate immediately.
    pub async fn execute(&self, input: &[u8]) -> ProviderResult<CapabilityOutput> {
        if !self.is_available() {
            return Err(ProviderError::Unavailable(self.name().to_string()));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable(self.name().to_string()))?;

        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;
            self.record_attempt();

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.config.call_timeout,
                self.inner.call(input),
            )
            .await
            {
                Ok(Ok(mut output)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    output.latency_ms = latency_ms;
                    output.provider = self.name().to_string();
                    self.record_success(latency_ms);
                    return Ok(output);
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(self.config.call_timeout.as_millis() as u64),
            };

            self.record_failure();

            if outcome.is_fatal() {
                return Err(outcome);
            }
            attempt += 1;
            if attempt >= self.config.max_attempts {
                return Err(outcome);
            }

            let delay = self.config.delay_for_attempt(attempt - 1);
            debug!(
                provider = self.name(),
                attempt, "Call failed, retrying in {:?}: {}", delay, outcome
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyOcr {
        calls: AtomicU32,
        fail_first: u32,
        fatal: bool,
    }

    #[async_trait]
    impl Capability for FlakyOcr {
        fn name(&self) -> &str {
            "flaky"
        }

        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Ocr
        }

        async fn call(&self, _input: &[u8]) -> ProviderResult<CapabilityOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                if self.fatal {
                    Err(ProviderError::Auth("bad key".into()))
                } else {
                    Err(ProviderError::Overloaded("503".into()))
                }
            } else {
                Ok(CapabilityOutput {
                    text: "hello".into(),
                    confidence: 0.95,
                    provider: String::new(),
                    latency_ms: 0,
                    segments: Vec::new(),
                })
            }
        }
    }

    struct SlowOcr {
        in_flight: Arc<AtomicU32>,
        max_seen: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Capability for SlowOcr {
        fn name(&self) -> &str {
            "slow"
        }

        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Ocr
        }

        async fn call(&self, _input: &[u8]) -> ProviderResult<CapabilityOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityOutput {
                text: "x".into(),
                confidence: 1.0,
                provider: String::new(),
                latency_ms: 0,
                segments: Vec::new(),
            })
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            requests_per_window: 10_000,
            window: Duration::from_secs(1),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let inner = Arc::new(FlakyOcr {
            calls: AtomicU32::new(0),
            fail_first: 2,
            fatal: false,
        });
        let gateway = CapabilityGateway::new(inner.clone(), fast_config());

        let out = gateway.execute(b"img").await.unwrap();
        assert_eq!(out.text, "hello");
        assert_eq!(out.provider, "flaky");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        let stats = gateway.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 2);
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_immediately() {
        let inner = Arc::new(FlakyOcr {
            calls: AtomicU32::new(0),
            fail_first: 10,
            fatal: true,
        });
        let gateway = CapabilityGateway::new(inner.clone(), fast_config());

        let err = gateway.execute(b"img").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_attempts() {
        let inner = Arc::new(FlakyOcr {
            calls: AtomicU32::new(0),
            fail_first: 10,
            fatal: false,
        });
        let gateway = CapabilityGateway::new(inner.clone(), fast_config());

        let err = gateway.execute(b"img").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_cap() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let inner = Arc::new(SlowOcr {
            in_flight: in_flight.clone(),
            max_seen: max_seen.clone(),
        });
        let gateway = Arc::new(CapabilityGateway::new(
            inner,
            GatewayConfig {
                max_concurrency: 5,
                ..fast_config()
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move { gateway.execute(b"x").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_then_recovers() {
        let inner = Arc::new(FlakyOcr {
            calls: AtomicU32::new(0),
            fail_first: 0,
            fatal: false,
        });
        let gateway = CapabilityGateway::new(inner, fast_config());

        gateway.mark_unavailable(Duration::from_millis(30));
        assert!(!gateway.is_available());
        let err = gateway.execute(b"x").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(gateway.is_available());
        assert!(gateway.execute(b"x").await.is_ok());
    }
}
