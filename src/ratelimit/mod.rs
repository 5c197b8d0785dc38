//! Adaptive rate-limit tracking.
//!
//! Learns per-engine optimal wait times from observed outcomes: successful
//! waits pull the estimate toward their 75th percentile, all-failure windows
//! push it up, and an occasional exploration probe checks whether the
//! upstream limits have relaxed. Estimates persist across restarts with a
//! soft time decay on the confidence.

pub mod store;

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::SettingsProvider;
use store::RateLimitStore;

/// Absolute ceiling on any learned wait, base or max.
pub const ABSOLUTE_WAIT_CAP: f64 = 10.0;

/// Attempts required before the estimator updates at all.
const MIN_ATTEMPTS_FOR_ESTIMATE: usize = 3;

/// Learned wait-time estimate for one engine. One persisted row per engine.
/// Invariants: `min_wait <= base_wait <= max_wait`, both `base_wait` and
/// `max_wait` capped at [`ABSOLUTE_WAIT_CAP`].
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitEstimate {
    pub engine: String,
    pub base_wait: f64,
    pub min_wait: f64,
    pub max_wait: f64,
    pub confidence: f64,
    /// Unix seconds of the last estimator update.
    pub last_updated: f64,
    pub total_attempts: usize,
    pub success_rate: f64,
}

/// Search-quality snapshot derived from the recent-attempt ring.
#[derive(Debug, Clone, Serialize)]
pub struct QualityStats {
    pub engine: String,
    pub recent_avg_results: f64,
    pub min_recent_results: usize,
    pub max_recent_results: usize,
    pub sample_size: usize,
    pub total_attempts: usize,
    pub status: &'static str,
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    wait_time: f64,
    success: bool,
    result_count: Option<usize>,
}

#[derive(Default)]
struct EngineState {
    recent: VecDeque<AttemptRecord>,
    estimate: Option<RateLimitEstimate>,
}

/// Process-wide adaptive tracker. Reads (`wait_time`) take the read lock;
/// `record_outcome` takes the write lock and re-runs the estimator. All
/// database traffic is best-effort: a failed store never disturbs the
/// in-memory path, and the tracker itself never returns an error.
pub struct AdaptiveRateLimitTracker {
    enabled: bool,
    memory_window: usize,
    exploration_rate: f64,
    learning_rate: f64,
    decay_per_day: f64,
    store: Option<RateLimitStore>,
    engines: RwLock<HashMap<String, EngineState>>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl AdaptiveRateLimitTracker {
    pub fn from_settings(settings: &dyn SettingsProvider) -> Self {
        let enabled = settings.get_bool("rate_limiting.enabled", true);
        let memory_window = settings.get_usize("rate_limiting.memory_window", 100);
        let mut exploration_rate = settings.get_f64("rate_limiting.exploration_rate", 0.1);
        let mut learning_rate = settings.get_f64("rate_limiting.learning_rate", 0.3);
        let decay_per_day = settings.get_f64("rate_limiting.decay_per_day", 0.95);
        let profile = settings.get_string("rate_limiting.profile", "balanced");

        match profile.as_str() {
            "conservative" => {
                exploration_rate = (exploration_rate * 0.5).min(0.05);
                learning_rate = (learning_rate * 0.7).min(0.2);
            }
            "aggressive" => {
                exploration_rate = (exploration_rate * 1.5).min(0.2);
                learning_rate = (learning_rate * 1.3).min(0.5);
            }
            _ => {}
        }

        let store = if settings.get_bool("rate_limiting.persist", true) {
            let path = settings
                .get_string_opt("rate_limiting.db_path")
                .map(std::path::PathBuf::from)
                .or_else(|| dirs::home_dir().map(|h| h.join(".delver").join("rate_limits.db")));
            path.and_then(|p| match RateLimitStore::open(&p) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!("could not open rate limit store at {}: {e}", p.display());
                    None
                }
            })
        } else {
            None
        };

        let tracker = Self {
            enabled,
            memory_window: memory_window.max(1),
            exploration_rate,
            learning_rate,
            decay_per_day,
            store,
            engines: RwLock::new(HashMap::new()),
        };
        tracker.load_persisted();
        info!(
            "rate limit tracker initialized: enabled={enabled}, profile={profile}, \
             exploration={exploration_rate:.2}, learning={learning_rate:.2}"
        );
        tracker
    }

    /// Unpersisted tracker with default tuning — used by tests and callers
    /// that want a throwaway instance.
    pub fn ephemeral() -> Self {
        Self {
            enabled: true,
            memory_window: 100,
            exploration_rate: 0.1,
            learning_rate: 0.3,
            decay_per_day: 0.95,
            store: None,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn load_persisted(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let estimates = match store.load_estimates() {
            Ok(estimates) => estimates,
            Err(e) => {
                warn!("could not load rate limit estimates: {e}");
                return;
            }
        };
        let now = now_secs();
        let mut engines = self.engines.write().expect("tracker lock poisoned");
        for mut est in estimates {
            // Soft forget on restart: confidence decays with estimate age.
            let age_hours = ((now - est.last_updated) / 3600.0).max(0.0);
            est.confidence = self.decay_per_day.powf(age_hours / 24.0);
            debug!(
                "loaded rate estimate for {}: base={:.2}s confidence={:.2}",
                est.engine, est.base_wait, est.confidence
            );
            engines.entry(est.engine.clone()).or_default().estimate = Some(est);
        }
    }

    /// Adaptive wait before the next call to `engine`, in seconds.
    ///
    /// Unknown engines start optimistic; known engines get the learned base
    /// with jitter, or occasionally an exploration probe below it. Always
    /// within `[min_wait, max_wait]` and never above [`ABSOLUTE_WAIT_CAP`].
    pub fn wait_time(&self, engine: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }

        let engines = self.engines.read().expect("tracker lock poisoned");
        let Some(est) = engines.get(engine).and_then(|s| s.estimate.as_ref()) else {
            // First contact: optimistic defaults for engines we know are
            // cheap, a modest default for the rest.
            return match engine {
                "local" | "retriever" => 0.0,
                "meta" | "searx" => 0.1,
                _ => 0.5,
            };
        };

        let mut rng = rand::rng();
        let wait = if rng.random::<f64>() < self.exploration_rate {
            // Explore: probe a faster rate in case upstream limits relaxed.
            let w = est.base_wait * rng.random_range(0.5..0.9);
            debug!("exploring faster rate for {engine}: {w:.2}s");
            w
        } else {
            est.base_wait * rng.random_range(0.9..1.1)
        };

        wait.max(est.min_wait).min(est.max_wait)
    }

    /// Record the outcome of one attempt and re-run the estimator.
    pub fn record_outcome(
        &self,
        engine: &str,
        wait_time: f64,
        success: bool,
        retry_count: usize,
        error_kind: Option<&str>,
        result_count: Option<usize>,
    ) {
        if !self.enabled {
            return;
        }
        let timestamp = now_secs();

        if let Some(store) = &self.store {
            if let Err(e) =
                store.insert_attempt(engine, timestamp, wait_time, retry_count, success, error_kind)
            {
                warn!("failed to record rate limit attempt: {e}");
            }
        }

        let mut engines = self.engines.write().expect("tracker lock poisoned");
        let state = engines.entry(engine.to_string()).or_default();
        state.recent.push_back(AttemptRecord {
            wait_time,
            success,
            result_count,
        });
        while state.recent.len() > self.memory_window {
            state.recent.pop_front();
        }

        self.update_estimate(engine, state, timestamp);
    }

    fn update_estimate(&self, engine: &str, state: &mut EngineState, timestamp: f64) {
        if state.recent.len() < MIN_ATTEMPTS_FOR_ESTIMATE {
            return;
        }

        let successful: Vec<f64> = state
            .recent
            .iter()
            .filter(|a| a.success)
            .map(|a| a.wait_time)
            .collect();
        let failed: Vec<f64> = state
            .recent
            .iter()
            .filter(|a| !a.success)
            .map(|a| a.wait_time)
            .collect();

        let mut new_base = if successful.is_empty() {
            // Whole window failed: back off from the worst observed wait.
            let worst = failed.iter().cloned().fold(0.0_f64, f64::max);
            (worst * 1.5).min(ABSOLUTE_WAIT_CAP)
        } else {
            // 75th percentile of the waits that worked.
            let mut sorted = successful.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((sorted.len() as f64) * 0.75) as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        if let Some(prev) = &state.estimate {
            new_base = (1.0 - self.learning_rate) * prev.base_wait + self.learning_rate * new_base;
        }
        new_base = new_base.min(ABSOLUTE_WAIT_CAP);

        let min_wait = (new_base * 0.5).max(0.5);
        // Keep min <= max even when the learned base is tiny.
        let max_wait = (new_base * 3.0).min(ABSOLUTE_WAIT_CAP).max(min_wait);
        let success_rate = successful.len() as f64 / state.recent.len() as f64;

        let estimate = RateLimitEstimate {
            engine: engine.to_string(),
            base_wait: new_base,
            min_wait,
            max_wait,
            confidence: (state.recent.len() as f64 / 20.0).min(1.0),
            last_updated: timestamp,
            total_attempts: state.recent.len(),
            success_rate,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_estimate(&estimate) {
                warn!("failed to persist rate limit estimate: {e}");
            }
        }

        info!(
            "updated rate limit for {engine}: {new_base:.2}s (success rate: {:.0}%)",
            success_rate * 100.0
        );
        state.estimate = Some(estimate);
    }

    /// Snapshot of the current estimate for one engine, if any.
    pub fn estimate(&self, engine: &str) -> Option<RateLimitEstimate> {
        self.engines
            .read()
            .expect("tracker lock poisoned")
            .get(engine)
            .and_then(|s| s.estimate.clone())
    }

    /// All current estimates, sorted by engine name. Prefers persisted rows
    /// (so the CLI sees other processes' learning) and falls back to memory.
    pub fn stats(&self, engine: Option<&str>) -> Vec<RateLimitEstimate> {
        if let Some(store) = &self.store {
            match store.load_estimates() {
                Ok(rows) => {
                    return rows
                        .into_iter()
                        .filter(|r| engine.is_none_or(|e| r.engine == e))
                        .collect();
                }
                Err(e) => warn!("failed to read rate limit stats: {e}"),
            }
        }
        let engines = self.engines.read().expect("tracker lock poisoned");
        let mut out: Vec<RateLimitEstimate> = engines
            .values()
            .filter_map(|s| s.estimate.clone())
            .filter(|r| engine.is_none_or(|e| r.engine == e))
            .collect();
        out.sort_by(|a, b| a.engine.cmp(&b.engine));
        out
    }

    /// Forget everything learned about one engine, in memory and on disk.
    pub fn reset_engine(&self, engine: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_engine(engine) {
                warn!("failed to reset persisted rate limit data for {engine}: {e}");
            }
        }
        self.engines
            .write()
            .expect("tracker lock poisoned")
            .remove(engine);
        info!("reset rate limit data for {engine}");
    }

    /// Drop persisted attempt rows older than `days`. Returns rows removed.
    pub fn cleanup_old_data(&self, days: u64) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let cutoff = now_secs() - (days as f64) * 24.0 * 3600.0;
        match store.cleanup_attempts(cutoff) {
            Ok(n) => {
                if n > 0 {
                    info!("cleaned up {n} old rate limit attempts");
                }
                n
            }
            Err(e) => {
                warn!("failed to clean up rate limit attempts: {e}");
                0
            }
        }
    }

    /// Result-count quality monitor over the recent-attempt rings.
    pub fn quality_stats(&self, engine: Option<&str>) -> Vec<QualityStats> {
        let engines = self.engines.read().expect("tracker lock poisoned");
        let mut out = Vec::new();
        for (name, state) in engines.iter() {
            if engine.is_some_and(|e| e != name.as_str()) {
                continue;
            }
            let counts: Vec<usize> = state
                .recent
                .iter()
                .filter_map(|a| a.result_count)
                .collect();
            if counts.is_empty() {
                continue;
            }
            let avg = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
            out.push(QualityStats {
                engine: name.clone(),
                recent_avg_results: avg,
                min_recent_results: *counts.iter().min().unwrap_or(&0),
                max_recent_results: *counts.iter().max().unwrap_or(&0),
                sample_size: counts.len(),
                total_attempts: state.recent.len(),
                status: quality_status(avg),
            });
        }
        out.sort_by(|a, b| a.engine.cmp(&b.engine));
        out
    }
}

fn quality_status(recent_avg: f64) -> &'static str {
    if recent_avg < 1.0 {
        "CRITICAL"
    } else if recent_avg < 3.0 {
        "WARNING"
    } else if recent_avg < 5.0 {
        "CAUTION"
    } else if recent_avg >= 10.0 {
        "EXCELLENT"
    } else {
        "GOOD"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_n(tracker: &AdaptiveRateLimitTracker, engine: &str, wait: f64, success: bool, n: usize) {
        for i in 0..n {
            tracker.record_outcome(
                engine,
                wait,
                success,
                i + 1,
                (!success).then_some("rate_limit"),
                success.then_some(5),
            );
        }
    }

    #[test]
    fn no_estimate_before_three_attempts() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 1.0, true, 2);
        assert!(tracker.estimate("x").is_none());
        record_n(&tracker, "x", 1.0, true, 1);
        assert!(tracker.estimate("x").is_some());
    }

    #[test]
    fn all_failures_back_off_from_worst_wait() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 2.0, false, 3);
        let est = tracker.estimate("x").unwrap();
        // First estimate: no EMA blending yet.
        assert!((est.base_wait - 3.0).abs() < 1e-9);
        assert!(est.min_wait <= est.base_wait && est.base_wait <= est.max_wait);
    }

    #[test]
    fn zero_wait_failures_keep_bounds_ordered() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 0.0, false, 3);
        let est = tracker.estimate("x").unwrap();
        assert!(est.min_wait <= est.max_wait);
        let w = tracker.wait_time("x");
        assert!(w.is_finite() && w >= 0.0);
    }

    #[test]
    fn estimates_never_exceed_absolute_cap() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 9.5, false, 10);
        let est = tracker.estimate("x").unwrap();
        assert!(est.base_wait <= ABSOLUTE_WAIT_CAP);
        assert!(est.max_wait <= ABSOLUTE_WAIT_CAP);
    }

    #[test]
    fn successes_pull_base_down() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 4.0, false, 3);
        let before = tracker.estimate("x").unwrap().base_wait;
        record_n(&tracker, "x", 1.0, true, 5);
        let after = tracker.estimate("x").unwrap().base_wait;
        assert!(after <= before, "base should not grow after successes at a lower wait");
    }

    #[test]
    fn consecutive_failures_push_base_up() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 1.0, true, 3);
        let before = tracker.estimate("x").unwrap().base_wait;
        record_n(&tracker, "x", before, false, 5);
        let after = tracker.estimate("x").unwrap().base_wait;
        assert!(after >= before, "base should not shrink after repeated rate limits");
    }

    #[test]
    fn wait_time_respects_bounds() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 2.0, true, 10);
        let est = tracker.estimate("x").unwrap();
        for _ in 0..200 {
            let w = tracker.wait_time("x");
            assert!(w >= est.min_wait - 1e-9 && w <= est.max_wait + 1e-9);
            assert!(w <= ABSOLUTE_WAIT_CAP);
        }
    }

    #[test]
    fn unknown_engine_is_optimistic() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        assert_eq!(tracker.wait_time("local"), 0.0);
        assert!((tracker.wait_time("meta") - 0.1).abs() < 1e-9);
        let w = tracker.wait_time("never-seen");
        assert!((0.0..=0.5).contains(&w));
    }

    #[test]
    fn reset_forgets_engine() {
        let tracker = AdaptiveRateLimitTracker::ephemeral();
        record_n(&tracker, "x", 1.0, true, 5);
        assert!(tracker.estimate("x").is_some());
        tracker.reset_engine("x");
        assert!(tracker.estimate("x").is_none());
    }
}
