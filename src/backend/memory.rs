use crate::backend::{
    Backend, Clock, Decision, RateLimitInput, RateLimitOutput, RequestKey, SystemClock,
};
use crate::policy::WindowPolicy;
use crate::ValidationError;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A Sliding Log rate limiter [Backend] that uses [Dashmap](dashmap::DashMap) to store request
/// timestamps in memory.
///
/// Each key keeps the timestamps of its admitted requests. A request is admitted while fewer
/// than `max_requests` of them lie within `(now - window_ms, now]`. The prune and append for a
/// key happen under that key's map entry lock, so decisions for one key are linearizable while
/// different keys proceed independently.
///
/// Time is expected to be non-decreasing across the backend. A check is never evaluated earlier
/// than the latest time any previous check was evaluated at, so a clock that goes backwards can
/// neither admit early nor produce a negative retry.
#[derive(Clone)]
pub struct InMemoryBackend {
    policy: WindowPolicy,
    clock: Arc<dyn Clock>,
    map: Arc<DashMap<RequestKey, RequestLog>>,
    high_water: Arc<AtomicU64>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

#[derive(Default)]
struct RequestLog {
    timestamps: VecDeque<u64>,
}

impl RequestLog {
    fn prune(&mut self, now: u64, window_ms: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if oldest.saturating_add(window_ms) > now {
                break;
            }
            self.timestamps.pop_front();
        }
    }

    fn is_expired(&self, now: u64, window_ms: u64) -> bool {
        self.timestamps
            .back()
            .map_or(true, |&newest| newest.saturating_add(window_ms) <= now)
    }
}

/// Identifies a single admitted request so that it can be rolled back.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdmissionToken {
    key: RequestKey,
    timestamp: u64,
}

impl InMemoryBackend {
    pub fn builder(policy: WindowPolicy) -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            policy,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    /// Decide whether a request may proceed at the current clock time, recording it if so.
    pub fn check(
        &self,
        identity: &str,
        resource: &str,
    ) -> Result<RateLimitOutput, ValidationError> {
        self.check_at(identity, resource, self.clock.now_ms())
    }

    /// Decide whether a request arriving at `now_ms` may proceed, recording it if so.
    ///
    /// A denied request is not recorded and leaves the stored state untouched.
    ///
    /// If `now_ms` is earlier than the time of a previous check (the clock went backwards) it is
    /// treated as that latest time instead.
    ///
    /// # Errors
    ///
    /// Only an empty `identity` is rejected; a key without history has zero prior requests.
    pub fn check_at(
        &self,
        identity: &str,
        resource: &str,
        now_ms: u64,
    ) -> Result<RateLimitOutput, ValidationError> {
        let key = RequestKey::new(identity, resource)?;
        Ok(self.check_key_at(key, now_ms).0)
    }

    fn check_key_at(&self, key: RequestKey, now_ms: u64) -> (RateLimitOutput, u64) {
        let window_ms = self.policy.window_ms();
        let max_requests = self.policy.max_requests();

        let mut entry = self.map.entry(key).or_default();
        // Raised while holding the entry, so a concurrent sweep cannot remove the key between
        // the clamp and the decision
        let now = now_ms.max(self.high_water.fetch_max(now_ms, Ordering::SeqCst));
        let log = entry.value_mut();
        log.prune(now, window_ms);

        let count = log.timestamps.len() as u64;
        if count < max_requests {
            log.timestamps.push_back(now);
            // The log is non-empty after the push
            let oldest = log.timestamps.front().copied().unwrap_or(now);
            let output = RateLimitOutput::allowed(
                max_requests,
                max_requests - (count + 1),
                oldest.saturating_add(window_ms) - now,
            );
            (output, now)
        } else {
            // The ceiling is non-zero so a full log always has an oldest entry
            let oldest = log.timestamps.front().copied().unwrap_or(now);
            let retry_after_ms = oldest.saturating_add(window_ms).saturating_sub(now);
            log::debug!(
                "Rate limit exceeded for {}, retry in {}ms",
                entry.key(),
                retry_after_ms
            );
            (RateLimitOutput::denied(max_requests, retry_after_ms), now)
        }
    }

    /// Drops every key whose timestamps have all left the window, at the current clock time.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now_ms())
    }

    /// Drops every key whose timestamps have all left the window at `now_ms`.
    ///
    /// Expiry is judged no later than the latest time a check was evaluated at, which is the
    /// earliest time any future check can be evaluated at. A removed key therefore reads as
    /// empty to every later check, just as its expired log would, and a sweep never changes the
    /// outcome of a check. Keys with any live timestamp are left exactly as they are.
    ///
    /// This also applies to the garbage collector: it reads the builder's clock, but when
    /// checks are made with explicit times through [InMemoryBackend::check_at] it removes
    /// nothing past the latest of those times.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_at(&self, now_ms: u64) -> usize {
        sweep_expired(&self.map, &self.high_water, now_ms, self.policy.window_ms())
    }

    /// Removes the log for a given identity and resource.
    pub fn remove_key(&self, identity: &str, resource: &str) -> Result<(), ValidationError> {
        let key = RequestKey::new(identity, resource)?;
        self.map.remove(&key);
        Ok(())
    }

    /// The number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn garbage_collector(
        map: Arc<DashMap<RequestKey, RequestLog>>,
        high_water: Arc<AtomicU64>,
        clock: Arc<dyn Clock>,
        window_ms: u64,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                sweep_expired(&map, &high_water, clock.now_ms(), window_ms);
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

fn sweep_expired(
    map: &DashMap<RequestKey, RequestLog>,
    high_water: &AtomicU64,
    now_ms: u64,
    window_ms: u64,
) -> usize {
    let cutoff = now_ms.min(high_water.load(Ordering::SeqCst));
    let before = map.len();
    map.retain(|_k, log| !log.is_expired(cutoff, window_ms));
    let removed = before.saturating_sub(map.len());
    if removed > 0 {
        log::debug!("Rate limiter swept {} expired keys", removed);
    }
    removed
}

impl Backend<RateLimitInput> for InMemoryBackend {
    type Output = RateLimitOutput;
    type RollbackToken = AdmissionToken;
    type Error = ValidationError;

    async fn request(
        &self,
        input: RateLimitInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let key = RequestKey::new(input.identity, input.resource)?;
        let (output, timestamp) = self.check_key_at(key.clone(), self.clock.now_ms());
        Ok((output.decision, output, AdmissionToken { key, timestamp }))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        if let Some(mut log) = self.map.get_mut(&token.key) {
            if let Some(pos) = log.timestamps.iter().rposition(|&t| t == token.timestamp) {
                log.timestamps.remove(pos);
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = &self.gc_handle {
            // Only the last clone stops the collector
            if Arc::strong_count(handle) == 1 {
                handle.abort();
            }
        }
    }
}

pub struct InMemoryBackendBuilder {
    policy: WindowPolicy,
    gc_interval: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the internal map, removing keys whose
    /// timestamps have all expired. It runs on the actix runtime, so building a backend with
    /// garbage collection enabled must happen within one.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Override the clock used when no explicit time is given. Defaults to [SystemClock].
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<RequestKey, RequestLog>::new());
        let high_water = Arc::new(AtomicU64::new(0));
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(InMemoryBackend::garbage_collector(
                map.clone(),
                high_water.clone(),
                self.clock.clone(),
                self.policy.window_ms(),
                gc_interval,
            ))
        });
        InMemoryBackend {
            policy: self.policy,
            clock: self.clock,
            map,
            high_water,
            gc_handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ManualClock;
    use std::collections::HashSet;
    use std::sync::Barrier;

    const MINUTE: Duration = Duration::from_secs(60);

    fn make_backend(max_requests: u64, window_ms: u64) -> InMemoryBackend {
        let policy = WindowPolicy::new(max_requests, window_ms).unwrap();
        InMemoryBackend::builder(policy)
            .with_gc_interval(None)
            .build()
    }

    #[test]
    fn test_window_boundary() {
        let backend = make_backend(3, 1000);
        for (i, t) in [0, 100, 200].into_iter().enumerate() {
            let output = backend.check_at("u1", "p1", t).unwrap();
            assert!(output.is_allowed());
            assert_eq!(output.remaining, 2 - i as u64);
            assert_eq!(output.retry_after_ms, 0);
        }
        // Fourth is denied until the t=0 entry expires at t=1000
        let output = backend.check_at("u1", "p1", 300).unwrap();
        assert!(output.decision.is_denied());
        assert_eq!(output.remaining, 0);
        assert_eq!(output.retry_after_ms, 700);
    }

    #[test]
    fn test_expiry_admits_again() {
        let backend = make_backend(3, 1000);
        for t in [0, 100, 200] {
            assert!(backend.check_at("u1", "p1", t).unwrap().is_allowed());
        }
        assert!(!backend.check_at("u1", "p1", 300).unwrap().is_allowed());
        let output = backend.check_at("u1", "p1", 1001).unwrap();
        assert!(output.is_allowed());
        assert_eq!(output.remaining, 0);
    }

    #[test]
    fn test_window_start_is_exclusive() {
        let backend = make_backend(1, 1000);
        assert!(backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        let output = backend.check_at("u1", "p1", 999).unwrap();
        assert!(!output.is_allowed());
        assert_eq!(output.retry_after_ms, 1);
        // A timestamp exactly at now - window_ms no longer counts
        assert!(backend.check_at("u1", "p1", 1000).unwrap().is_allowed());
    }

    #[test]
    fn test_independent_keys() {
        let backend = make_backend(1, 1000);
        assert!(backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        assert!(backend.check_at("u2", "p1", 0).unwrap().is_allowed());
        assert!(backend.check_at("u1", "p2", 0).unwrap().is_allowed());
        assert!(backend.check_at("u1", "", 0).unwrap().is_allowed());
        assert!(!backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        assert_eq!(backend.len(), 4);
    }

    #[test]
    fn test_remaining_non_increasing() {
        let backend = make_backend(5, 1000);
        let mut previous = u64::MAX;
        for t in (0..5).map(|i| i * 10) {
            let output = backend.check_at("u1", "p1", t).unwrap();
            assert!(output.is_allowed());
            assert!(output.remaining < previous);
            previous = output.remaining;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_rejection_has_no_side_effect() {
        let backend = make_backend(2, 1000);
        backend.check_at("u1", "p1", 0).unwrap();
        backend.check_at("u1", "p1", 400).unwrap();
        let first = backend.check_at("u1", "p1", 500).unwrap();
        assert!(!first.is_allowed());
        for _ in 0..10 {
            assert_eq!(backend.check_at("u1", "p1", 500).unwrap(), first);
        }
        let key = RequestKey::new("u1", "p1").unwrap();
        assert_eq!(
            backend.map.get(&key).unwrap().timestamps,
            VecDeque::from([0, 400])
        );
    }

    #[test]
    fn test_clock_going_backwards_is_clamped() {
        let backend = make_backend(1, 1000);
        assert!(backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        assert!(backend.check_at("u1", "p1", 1500).unwrap().is_allowed());
        // 900 is behind the latest check, so it is evaluated as 1500
        let output = backend.check_at("u1", "p1", 900).unwrap();
        assert!(!output.is_allowed());
        assert_eq!(output.retry_after_ms, 1000);
        assert_eq!(output, backend.check_at("u1", "p1", 1500).unwrap());
    }

    #[test]
    fn test_clock_going_backwards_after_expiry() {
        let backend = make_backend(1, 1000);
        assert!(backend.check_at("u1", "p1", 5000).unwrap().is_allowed());
        // Far enough back that the log would otherwise look expired from the future
        let output = backend.check_at("u1", "p1", 10).unwrap();
        assert!(!output.is_allowed());
        assert_eq!(output.retry_after_ms, 1000);
    }

    #[test]
    fn test_empty_identity() {
        let backend = make_backend(1, 1000);
        assert_eq!(
            backend.check_at("", "p1", 0),
            Err(ValidationError::EmptyIdentity)
        );
        assert!(backend.is_empty());
    }

    #[test]
    fn test_concurrent_admission() {
        const THREADS: u64 = 16;
        let backend = make_backend(THREADS, 1000);
        let barrier = Barrier::new(THREADS as usize);
        let remaining: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let output = backend.check_at("u1", "p1", 42).unwrap();
                        assert!(output.is_allowed());
                        output.remaining
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // Each admission observed the previous one
        let distinct: HashSet<u64> = remaining.into_iter().collect();
        assert_eq!(distinct, (0..THREADS).collect());
        assert!(!backend.check_at("u1", "p1", 42).unwrap().is_allowed());
    }

    #[test]
    fn test_concurrent_admission_over_limit() {
        const THREADS: usize = 32;
        let backend = make_backend(10, 1000);
        let barrier = Barrier::new(THREADS);
        let allowed = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        backend.check_at("u1", "p1", 7).unwrap().is_allowed()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_sweep() {
        let backend = make_backend(2, 1000);
        backend.check_at("u1", "p1", 0).unwrap();
        backend.check_at("u2", "p1", 0).unwrap();
        backend.check_at("u2", "p1", 600).unwrap();
        backend.check_at("u3", "p1", 1000).unwrap();
        assert_eq!(backend.sweep_at(1000), 1);
        assert_eq!(backend.len(), 2);
        // The live key keeps both timestamps, including the one that has expired
        let key = RequestKey::new("u2", "p1").unwrap();
        assert_eq!(backend.map.get(&key).unwrap().timestamps.len(), 2);
        // Nothing has been checked after t=1000, so u2 may still be live for the next check
        assert_eq!(backend.sweep_at(5000), 0);
        backend.check_at("u3", "p1", 1600).unwrap();
        assert_eq!(backend.sweep_at(5000), 1);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_clock_clamp() {
        let swept = make_backend(1, 1000);
        let unswept = make_backend(1, 1000);
        for backend in [&swept, &unswept] {
            assert!(backend.check_at("u1", "p1", 5000).unwrap().is_allowed());
        }
        assert_eq!(swept.sweep_at(6000), 0);
        // A check from behind the latest check must see the same state either way
        let output = swept.check_at("u1", "p1", 10).unwrap();
        assert!(!output.is_allowed());
        assert_eq!(output.retry_after_ms, 1000);
        assert_eq!(output, unswept.check_at("u1", "p1", 10).unwrap());
    }

    #[test]
    fn test_sweep_then_clock_going_backwards() {
        let swept = make_backend(1, 1000);
        let unswept = make_backend(1, 1000);
        for backend in [&swept, &unswept] {
            assert!(backend.check_at("u1", "p1", 5000).unwrap().is_allowed());
            assert!(backend.check_at("u2", "p1", 7000).unwrap().is_allowed());
        }
        // u1 is expired as of the latest check, so it can go
        assert_eq!(swept.sweep_at(9000), 1);
        for t in [10, 5500, 7000] {
            assert_eq!(
                swept.check_at("u1", "p1", t).unwrap(),
                unswept.check_at("u1", "p1", t).unwrap()
            );
        }
    }

    #[test]
    fn test_huge_window() {
        let backend = make_backend(2, u64::MAX - 10);
        let output = backend.check_at("u1", "p1", 1000).unwrap();
        assert!(output.is_allowed());
        assert_eq!(output.reset_after_ms, u64::MAX - 1000);
        assert!(backend.check_at("u1", "p1", 2000).unwrap().is_allowed());
        let output = backend.check_at("u1", "p1", 3000).unwrap();
        assert!(!output.is_allowed());
        assert_eq!(output.retry_after_ms, u64::MAX - 3000);
        assert_eq!(backend.sweep_at(u64::MAX), 0);
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let clock = ManualClock::new(0);
        let backend = InMemoryBackend::builder(WindowPolicy::new(1, 1000).unwrap())
            .with_gc_interval(Some(MINUTE))
            .with_clock(clock.clone())
            .build();
        backend
            .request(RateLimitInput::new("KEY1", ""))
            .await
            .unwrap();
        clock.set(600);
        backend
            .request(RateLimitInput::new("KEY2", ""))
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);
        clock.set(1100);
        backend
            .request(RateLimitInput::new("KEY3", ""))
            .await
            .unwrap();
        // Advance time such that the garbage collector runs,
        // expired KEY1 should be cleaned, but KEY2 should remain.
        tokio::time::advance(MINUTE).await;
        assert!(!backend.map.contains_key(&RequestKey::new("KEY1", "").unwrap()));
        assert!(backend.map.contains_key(&RequestKey::new("KEY2", "").unwrap()));
    }

    #[actix_web::test]
    async fn test_request_uses_clock() {
        let clock = ManualClock::new(10_000);
        let backend = InMemoryBackend::builder(WindowPolicy::new(1, 1000).unwrap())
            .with_gc_interval(None)
            .with_clock(clock.clone())
            .build();
        let input = RateLimitInput::new("u1", "p1");
        let (decision, output, _) = backend.request(input.clone()).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(output.reset_after_ms, 1000);
        clock.advance(250);
        let (decision, output, _) = backend.request(input.clone()).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(output.retry_after_ms, 750);
        clock.advance(750);
        let (decision, _, _) = backend.request(input).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[actix_web::test]
    async fn test_request_rejects_empty_identity() {
        let backend = make_backend(1, 1000);
        let result = backend.request(RateLimitInput::new("", "p1")).await;
        assert_eq!(result.unwrap_err(), ValidationError::EmptyIdentity);
    }

    #[actix_web::test]
    async fn test_rollback() {
        let backend = make_backend(5, 60_000);
        let input = RateLimitInput::new("u1", "p1");
        let (_, output, rollback) = backend.request(input.clone()).await.unwrap();
        assert_eq!(output.remaining, 4);
        backend.rollback(rollback).await.unwrap();
        // Remaining requests should still be the same, since the previous call was excluded
        let (_, output, _) = backend.request(input).await.unwrap();
        assert_eq!(output.remaining, 4);
    }

    #[test]
    fn test_remove_key() {
        let backend = make_backend(1, 60_000);
        assert!(backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        assert!(!backend.check_at("u1", "p1", 1).unwrap().is_allowed());
        backend.remove_key("u1", "p1").unwrap();
        // Log should have been reset
        assert!(backend.check_at("u1", "p1", 2).unwrap().is_allowed());
    }

    #[test]
    fn test_clones_share_state() {
        let backend = make_backend(1, 1000);
        let other = backend.clone();
        assert!(backend.check_at("u1", "p1", 0).unwrap().is_allowed());
        assert!(!other.check_at("u1", "p1", 0).unwrap().is_allowed());
    }
}
