//! Cache analytics: performance reports, warmup, TTL tuning.
//!
//! A background task wakes every 60 seconds, emits a performance report on
//! the report interval and warms caches on the warmup interval. Neither
//! ever blocks a request path; all failures are advisory.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::coordinator::CacheCoordinator;
use super::unified::CacheMetrics;

/// A warmup function returns a batch of key-to-value pairs to seed one cache.
pub type WarmupFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = crate::Result<HashMap<String, Value>>> + Send>>
        + Send
        + Sync,
>;

/// TTL tuning hint for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlRecommendation {
    /// Hit rate above 90%: entries are reused, keep them longer.
    Raise,
    /// Hit rate below 50%: entries go stale unused, expire them sooner.
    Lower,
    Keep,
}

impl TtlRecommendation {
    pub fn for_hit_rate(hit_rate: f64) -> Self {
        if hit_rate > 0.9 {
            TtlRecommendation::Raise
        } else if hit_rate < 0.5 {
            TtlRecommendation::Lower
        } else {
            TtlRecommendation::Keep
        }
    }
}

/// Analytics intervals and output location.
#[derive(Debug, Clone)]
pub struct CacheAnalyticsConfig {
    pub report_interval: Duration,
    pub warmup_interval: Duration,
    /// Directory for append-only metrics history files.
    pub metrics_dir: PathBuf,
}

impl Default for CacheAnalyticsConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(3600),
            warmup_interval: Duration::from_secs(86_400),
            metrics_dir: PathBuf::from("logs/cache_metrics"),
        }
    }
}

/// One report line appended to the metrics history file.
#[derive(Debug, Serialize, Deserialize)]
struct MetricsSnapshotLine {
    timestamp: String,
    caches: HashMap<String, CacheMetrics>,
    recommendations: HashMap<String, TtlRecommendation>,
}

/// Background cache monitoring.
pub struct CacheAnalytics {
    coordinator: Arc<CacheCoordinator>,
    config: CacheAnalyticsConfig,
    warmup_fns: Mutex<HashMap<String, WarmupFn>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheAnalytics {
    pub fn new(coordinator: Arc<CacheCoordinator>, config: CacheAnalyticsConfig) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            config,
            warmup_fns: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    /// Register a warmup function for a named cache.
    pub async fn register_warmup(&self, cache_name: &str, func: WarmupFn) {
        self.warmup_fns
            .lock()
            .await
            .insert(cache_name.to_string(), func);
        debug!(cache = cache_name, "registered cache warmup function");
    }

    /// Start the monitoring loop. A second start is a no-op while the loop
    /// is alive.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!("cache monitoring is already running");
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            this.monitoring_loop().await;
        }));
        info!("started cache performance monitoring");
    }

    /// Stop the loop and wait for it to finish. Safe to call repeatedly.
    pub async fn stop(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("stopped cache performance monitoring");
        }
    }

    async fn monitoring_loop(self: Arc<Self>) {
        let mut since_report = Duration::ZERO;
        let mut since_warmup = Duration::ZERO;
        let tick = Duration::from_secs(60);

        loop {
            tokio::time::sleep(tick).await;
            since_report += tick;
            since_warmup += tick;

            if since_report >= self.config.report_interval {
                if let Err(err) = self.generate_performance_report().await {
                    warn!(error = %err, "cache performance report failed");
                }
                since_report = Duration::ZERO;
            }

            if since_warmup >= self.config.warmup_interval {
                self.warmup_all_caches().await;
                since_warmup = Duration::ZERO;
            }
        }
    }

    /// Collect metrics from every registered cache, compute TTL
    /// recommendations, and append a snapshot line to today's history
    /// file.
    pub async fn generate_performance_report(
        &self,
    ) -> crate::Result<HashMap<String, TtlRecommendation>> {
        let metrics = self.coordinator.metrics().await;
        let recommendations: HashMap<String, TtlRecommendation> = metrics
            .iter()
            .map(|(name, m)| (name.clone(), TtlRecommendation::for_hit_rate(m.hit_rate())))
            .collect();

        let line = MetricsSnapshotLine {
            timestamp: Utc::now().to_rfc3339(),
            caches: metrics,
            recommendations: recommendations.clone(),
        };

        self.append_history_line(&line)?;
        Ok(recommendations)
    }

    fn append_history_line(&self, line: &MetricsSnapshotLine) -> crate::Result<()> {
        use std::io::Write;

        std::fs::create_dir_all(&self.config.metrics_dir)?;
        let path = self.config.metrics_dir.join(format!(
            "cache_metrics_{}.jsonl",
            Utc::now().format("%Y%m%d")
        ));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", serde_json::to_string(line)?)?;
        Ok(())
    }

    /// Run every registered warmup function and seed its cache. Failures
    /// are logged and skipped.
    pub async fn warmup_all_caches(&self) -> usize {
        let funcs: Vec<(String, WarmupFn)> = self
            .warmup_fns
            .lock()
            .await
            .iter()
            .map(|(name, f)| (name.clone(), Arc::clone(f)))
            .collect();

        let mut warmed = 0;
        for (name, func) in funcs {
            match func().await {
                Ok(batch) => {
                    let cache = self.coordinator.get_or_create(&name).await;
                    for (key, value) in batch {
                        cache.set(&key, value).await;
                        warmed += 1;
                    }
                    debug!(cache = %name, "cache warmed");
                }
                Err(err) => {
                    warn!(cache = %name, error = %err, "cache warmup failed");
                }
            }
        }
        warmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analytics_in(dir: &std::path::Path) -> (Arc<CacheCoordinator>, Arc<CacheAnalytics>) {
        let coordinator = Arc::new(CacheCoordinator::new());
        let analytics = CacheAnalytics::new(
            Arc::clone(&coordinator),
            CacheAnalyticsConfig {
                metrics_dir: dir.to_path_buf(),
                ..Default::default()
            },
        );
        (coordinator, analytics)
    }

    #[test]
    fn ttl_recommendation_thresholds() {
        assert_eq!(TtlRecommendation::for_hit_rate(0.95), TtlRecommendation::Raise);
        assert_eq!(TtlRecommendation::for_hit_rate(0.91), TtlRecommendation::Raise);
        assert_eq!(TtlRecommendation::for_hit_rate(0.9), TtlRecommendation::Keep);
        assert_eq!(TtlRecommendation::for_hit_rate(0.5), TtlRecommendation::Keep);
        assert_eq!(TtlRecommendation::for_hit_rate(0.49), TtlRecommendation::Lower);
        assert_eq!(TtlRecommendation::for_hit_rate(0.0), TtlRecommendation::Lower);
    }

    #[tokio::test]
    async fn report_appends_jsonl_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, analytics) = analytics_in(dir.path());

        let cache = coordinator.get_or_create("search_results").await;
        cache.set("k", json!(1)).await;
        let _ = cache.get("k").await;

        let recommendations = analytics.generate_performance_report().await.unwrap();
        assert_eq!(
            recommendations["search_results"],
            TtlRecommendation::Raise
        );

        let path = dir.path().join(format!(
            "cache_metrics_{}.jsonl",
            Utc::now().format("%Y%m%d")
        ));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(parsed["caches"]["search_results"]["hits"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn warmup_seeds_registered_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, analytics) = analytics_in(dir.path());

        analytics
            .register_warmup(
                "vector_store",
                Arc::new(|| {
                    Box::pin(async {
                        let mut batch = HashMap::new();
                        batch.insert("repo:1:file:a.py".to_string(), json!([0.1, 0.2]));
                        batch.insert("repo:1:file:b.py".to_string(), json!([0.3, 0.4]));
                        Ok(batch)
                    })
                }),
            )
            .await;

        let warmed = analytics.warmup_all_caches().await;
        assert_eq!(warmed, 2);

        let cache = coordinator.get_or_create("vector_store").await;
        assert!(cache.get("repo:1:file:a.py").await.is_some());
    }

    #[tokio::test]
    async fn failing_warmup_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_coordinator, analytics) = analytics_in(dir.path());

        analytics
            .register_warmup(
                "broken",
                Arc::new(|| {
                    Box::pin(async { Err(crate::Error::cache("warmup source offline")) })
                }),
            )
            .await;

        assert_eq!(analytics.warmup_all_caches().await, 0);
    }

    #[tokio::test]
    async fn start_twice_keeps_one_loop_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_coordinator, analytics) = analytics_in(dir.path());

        analytics.start().await;
        analytics.start().await;
        assert!(analytics.task.lock().await.is_some());

        analytics.stop().await;
        assert!(analytics.task.lock().await.is_none());
        analytics.stop().await;
    }
}
