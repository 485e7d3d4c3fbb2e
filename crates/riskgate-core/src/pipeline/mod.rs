//! Pipeline orchestration.
//!
//! Events are dispatched to a worker pool sharded by user, so each
//! worker owns its users' profiles and velocity windows outright and
//! processes them sequentially. Results for a given user therefore
//! come back in submission order. IP-keyed velocity state is shared
//! across workers behind a sharded mutex table.
//!
//! Per-event failures never halt the stream: every error is converted
//! at this boundary into a degraded assessment carrying the configured
//! fallback decision, and the event is audited like any other.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::behavioral::{BehaviorProfiler, DeviationVector};
use crate::config::ConfigHandle;
use crate::error::{Result, ScoreError};
use crate::event::{self, BehaviorEvent};
use crate::model::ModelStore;
use crate::risk::{RiskAssessment, RiskEngine};
use crate::velocity::{VelocityChecker, WindowCounts};

/// Shards for the shared IP velocity table.
const IP_SHARDS: usize = 16;
/// Per-worker queue depth before submission backpressures.
const QUEUE_DEPTH: usize = 256;
/// Worker-local velocity state is pruned every this many events.
const PRUNE_EVERY: u64 = 4096;

/// Destination for assessments at or above the alert tier.
pub trait AlertSink: Send + Sync {
    fn alert(&self, assessment: &RiskAssessment) -> Result<()>;
}

struct Job {
    event: BehaviorEvent,
    reply: oneshot::Sender<RiskAssessment>,
}

#[derive(Clone)]
struct WorkerContext {
    config: ConfigHandle,
    store: Arc<ModelStore>,
    ip_velocity: Arc<Vec<Mutex<VelocityChecker>>>,
    audit: Option<Arc<dyn AuditSink>>,
    alert: Option<Arc<dyn AlertSink>>,
}

/// The running scoring pipeline.
pub struct Pipeline {
    workers: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    ctx: WorkerContext,
}

impl Pipeline {
    /// Spawn the worker pool. Worker count and velocity windows are
    /// fixed from the configuration at spawn time; thresholds, policy,
    /// timeout, and alert tier follow hot swaps.
    pub fn spawn(
        config: ConfigHandle,
        store: Arc<ModelStore>,
        audit: Option<Arc<dyn AuditSink>>,
        alert: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        let cfg = config.snapshot();
        let worker_count = cfg.workers;

        let ip_velocity = Arc::new(
            (0..IP_SHARDS)
                .map(|_| Mutex::new(VelocityChecker::new(&cfg.velocity)))
                .collect::<Vec<_>>(),
        );

        let ctx = WorkerContext {
            config,
            store,
            ip_velocity,
            audit,
            alert,
        };

        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                ctx.clone(),
                worker_count,
            )));
            workers.push(tx);
        }

        Pipeline {
            workers,
            handles,
            ctx,
        }
    }

    /// Score one raw event through the pipeline.
    ///
    /// Always resolves to an assessment for events the pipeline could
    /// parse or degrade; `Err` only when the pipeline itself has shut
    /// down. Malformed events mutate no state.
    pub async fn submit(&self, raw: &serde_json::Value) -> Result<RiskAssessment> {
        let event = match event::normalize(raw) {
            Ok(event) => event,
            Err(err) => {
                let cfg = self.ctx.config.snapshot();
                let user_id = raw
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                warn!(%user_id, error = %err, "event failed validation");
                let assessment = RiskAssessment::degraded(
                    Uuid::new_v4(),
                    user_id,
                    Utc::now(),
                    cfg.fallback_decision,
                    &err,
                );
                fan_out(&self.ctx, &assessment, None);
                return Ok(assessment);
            }
        };

        let shard = user_shard(&event.user_id, self.workers.len());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.workers[shard]
            .send(Job {
                event,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ScoreError::PipelineClosed)?;
        reply_rx.await.map_err(|_| ScoreError::PipelineClosed)
    }

    /// Close the intake and wait for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.workers);
        for handle in self.handles {
            let _ = handle.await;
        }
        debug!("pipeline shut down");
    }
}

fn user_shard(user_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn ip_shard(ip: &IpAddr) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() % IP_SHARDS as u64) as usize
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<Job>,
    ctx: WorkerContext,
    worker_count: usize,
) {
    let cfg = ctx.config.snapshot();
    let mut user_velocity = VelocityChecker::new(&cfg.velocity);
    let mut profiler = BehaviorProfiler::new();
    let engine = RiskEngine::new(Arc::clone(&ctx.store));

    let mut processed: u64 = 0;
    while let Some(job) = rx.recv().await {
        let assessment = process_event(
            &job.event,
            &mut user_velocity,
            &mut profiler,
            &engine,
            &ctx,
            worker_count,
        )
        .await;
        fan_out(&ctx, &assessment, Some(&job.event));
        // The submitter may have gone away; scoring already happened.
        let _ = job.reply.send(assessment);

        processed += 1;
        if processed % PRUNE_EVERY == 0 {
            user_velocity.prune_idle(Utc::now());
        }
    }
    debug!(worker_id, processed, "pipeline worker drained");
}

async fn process_event(
    event: &BehaviorEvent,
    user_velocity: &mut VelocityChecker,
    profiler: &mut BehaviorProfiler,
    engine: &RiskEngine,
    ctx: &WorkerContext,
    worker_count: usize,
) -> RiskAssessment {
    let cfg = ctx.config.snapshot();
    let now = Utc::now();

    // Profile tuning follows each config snapshot; only the per-worker
    // share of the profile cap is derived here.
    let mut profile_cfg = cfg.profile.clone();
    profile_cfg.max_profiles = (profile_cfg.max_profiles / worker_count.max(1)).max(1);

    let ip = event.ip_address.to_string();
    let user_counts =
        user_velocity.record_and_count(&event.user_id, event.event_type, &ip, event.timestamp, now);
    let ip_counts = {
        let shard = &ctx.ip_velocity[ip_shard(&event.ip_address)];
        let mut checker = shard.lock().unwrap_or_else(|e| e.into_inner());
        checker.record_and_count(&ip, event.event_type, &event.user_id, event.timestamp, now)
    };

    let result = match profiler.deviation(event, &profile_cfg) {
        Ok(dv) => score_event(event, &user_counts, &ip_counts, &dv, engine, &cfg).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(assessment) => {
            // The event is folded into the profile only after a
            // successful score: it never vouches for itself, and a
            // scoring failure leaves the profile untouched.
            profiler.update(event, &profile_cfg);
            assessment
        }
        Err(err) => {
            if matches!(err, ScoreError::StateCorruption { .. }) {
                user_velocity.reset(&event.user_id);
            }
            warn!(user_id = %event.user_id, event_id = %event.event_id, error = %err,
                "scoring degraded to fallback decision");
            RiskAssessment::degraded(
                event.event_id,
                event.user_id.clone(),
                event.timestamp,
                cfg.fallback_decision,
                &err,
            )
        }
    }
}

async fn score_event(
    event: &BehaviorEvent,
    user_counts: &WindowCounts,
    ip_counts: &WindowCounts,
    deviation: &DeviationVector,
    engine: &RiskEngine,
    cfg: &crate::config::EngineConfig,
) -> Result<RiskAssessment> {
    let job = engine.prepare(event, user_counts, ip_counts, deviation)?;

    let budget = Duration::from_millis(cfg.scoring_timeout_ms);
    let scored = match tokio::time::timeout(budget, tokio::task::spawn_blocking(move || job.run()))
        .await
    {
        Err(_) => return Err(ScoreError::ScoringTimeout(budget)),
        Ok(Err(join_err)) => {
            return Err(ScoreError::StateCorruption {
                user_id: event.user_id.clone(),
                detail: format!("scoring task failed: {join_err}"),
            })
        }
        Ok(Ok(result)) => result?,
    };

    Ok(engine.finalize(
        event,
        scored,
        &cfg.thresholds,
        &cfg.policy,
        deviation.cold_start,
        user_counts.clamped || ip_counts.clamped,
    ))
}

fn fan_out(ctx: &WorkerContext, assessment: &RiskAssessment, event: Option<&BehaviorEvent>) {
    let cfg = ctx.config.snapshot();
    if let Some(audit) = &ctx.audit {
        let record = AuditRecord::from_assessment(assessment, event);
        if let Err(e) = audit.log(&record) {
            warn!(error = %e, "audit sink rejected record");
        }
    }
    if assessment.risk_tier >= cfg.alert_min_tier {
        if let Some(alert) = &ctx.alert {
            if let Err(e) = alert.alert(assessment) {
                warn!(error = %e, "alert sink rejected assessment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::Result;
    use crate::event::EventType;
    use crate::model::{feature_names, AnomalyModel};
    use crate::risk::{Decision, RiskTier};
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingAudit {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for CollectingAudit {
        fn log(&self, record: &AuditRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingAlert {
        assessments: Mutex<Vec<RiskAssessment>>,
    }

    impl AlertSink for CollectingAlert {
        fn alert(&self, assessment: &RiskAssessment) -> Result<()> {
            self.assessments.lock().unwrap().push(assessment.clone());
            Ok(())
        }
    }

    /// A model whose scoring blocks long enough to blow any budget.
    struct SlowModel {
        names: Vec<String>,
        importance: Vec<f64>,
    }

    impl AnomalyModel for SlowModel {
        fn model_id(&self) -> &str {
            "slow"
        }

        fn feature_names(&self) -> &[String] {
            &self.names
        }

        fn importance(&self) -> &[f64] {
            &self.importance
        }

        fn score(&self, _features: &[f64]) -> Result<f64> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(0.0)
        }
    }

    fn test_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.workers = 2;
        cfg.profile.min_samples = 2;
        cfg
    }

    /// Artifact splitting on feature 0 (the shortest user window): a
    /// calm count walks into a dense leaf (Low), a burst is isolated
    /// immediately (Critical).
    fn artifact_over(contract: &[String]) -> String {
        serde_json::json!({
            "model_id": "pipeline-test",
            "feature_names": contract,
            "importance": contract.iter().enumerate()
                .map(|(i, _)| if i == 0 { 1.0 } else { 0.1 })
                .collect::<Vec<_>>(),
            "n_samples": 256,
            "trees": [{"nodes": [
                {"feature": 0, "threshold": 20.0, "left": 1, "right": 2},
                {"size": 200},
                {"size": 1}
            ]}]
        })
        .to_string()
    }

    fn store_with_model(cfg: &EngineConfig) -> Arc<ModelStore> {
        let contract = feature_names(&cfg.velocity.windows_secs);
        let artifact = artifact_over(&contract);
        let store = Arc::new(ModelStore::new(contract));
        store.load(&artifact).unwrap();
        store
    }

    fn raw_event(user: &str, secs: i64) -> serde_json::Value {
        json!({
            "user_id": user,
            "timestamp": secs,
            "event_type": "login",
            "ip_address": "203.0.113.10",
        })
    }

    fn behavior_event(user: &str, secs: i64) -> BehaviorEvent {
        BehaviorEvent {
            event_id: Uuid::new_v4(),
            user_id: user.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            event_type: EventType::Login,
            ip_address: "203.0.113.10".parse().unwrap(),
            device_fingerprint: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_valid_event_scored_and_audited() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let audit = Arc::new(CollectingAudit::default());
        let pipeline = Pipeline::spawn(config, store, Some(audit.clone()), None);

        let assessment = pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap();
        assert_eq!(assessment.risk_tier, RiskTier::Low);
        assert_eq!(assessment.decision, Decision::Allow);
        assert!(assessment.degraded.is_none());
        assert!(assessment.cold_start);

        pipeline.shutdown().await;
        let records = audit.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type.as_deref(), Some("login"));
    }

    #[tokio::test]
    async fn test_invalid_event_degrades_without_halting() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let audit = Arc::new(CollectingAudit::default());
        let pipeline = Pipeline::spawn(config, store, Some(audit.clone()), None);

        let bad = json!({"user_id": "u1", "timestamp": "garbage", "event_type": "login", "ip_address": "1.2.3.4"});
        let assessment = pipeline.submit(&bad).await.unwrap();
        assert_eq!(assessment.decision, Decision::Flag);
        assert!(assessment.degraded.as_deref().unwrap().contains("timestamp"));

        // The stream keeps going.
        let ok = pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap();
        assert!(ok.degraded.is_none());

        pipeline.shutdown().await;
        let records = audit.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].event_type.is_none());
    }

    #[tokio::test]
    async fn test_missing_model_degrades_to_fallback() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let contract = feature_names(&config.snapshot().velocity.windows_secs);
        let store = Arc::new(ModelStore::new(contract));
        let pipeline = Pipeline::spawn(config, store, None, None);

        let assessment = pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap();
        assert_eq!(assessment.decision, Decision::Flag);
        assert!(assessment
            .degraded
            .as_deref()
            .unwrap()
            .contains("no active anomaly model"));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_scoring_timeout_degrades_to_fallback() {
        let mut cfg = test_config();
        cfg.scoring_timeout_ms = 20;
        let config = ConfigHandle::new(cfg).unwrap();
        let contract = feature_names(&config.snapshot().velocity.windows_secs);
        let store = Arc::new(ModelStore::new(contract.clone()));
        store
            .install(Arc::new(SlowModel {
                importance: contract.iter().map(|_| 1.0).collect(),
                names: contract,
            }))
            .unwrap();
        let pipeline = Pipeline::spawn(config, store, None, None);

        let assessment = pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap();
        assert_eq!(assessment.decision, Decision::Flag);
        assert!(assessment.degraded.as_deref().unwrap().contains("timed out"));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_burst_triggers_alert_calm_does_not() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let alert = Arc::new(CollectingAlert::default());
        let pipeline = Pipeline::spawn(config, store, None, Some(alert.clone()));

        // 25 events inside one bucket pushes user_events_60s past the
        // split threshold.
        let mut last = None;
        for _ in 0..25 {
            last = Some(pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.risk_tier, RiskTier::Critical);
        assert_eq!(last.decision, Decision::Block);

        pipeline.shutdown().await;
        let alerts = alert.assessments.lock().unwrap();
        assert!(!alerts.is_empty());
        assert!(alerts.iter().all(|a| a.risk_tier >= RiskTier::High));
        assert!(alerts.len() < 25, "calm events must not alert");
    }

    #[tokio::test]
    async fn test_per_user_counts_are_sequential() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let audit = Arc::new(CollectingAudit::default());
        let pipeline = Pipeline::spawn(config, store, Some(audit.clone()), None);

        // Interleave two users; each user's events land on one worker
        // and are processed in submission order.
        for i in 0..10 {
            pipeline.submit(&raw_event("alice", 1_700_000_000 + i)).await.unwrap();
            pipeline.submit(&raw_event("bob", 1_700_000_000 + i)).await.unwrap();
        }
        pipeline.shutdown().await;

        let records = audit.records.lock().unwrap();
        for user in ["alice", "bob"] {
            let times: Vec<i64> = records
                .iter()
                .filter(|r| r.user_id == user)
                .map(|r| r.timestamp.timestamp())
                .collect();
            assert_eq!(times.len(), 10);
            assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[tokio::test]
    async fn test_model_swap_mid_stream_is_clean() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let pipeline = Pipeline::spawn(config.clone(), Arc::clone(&store), None, None);

        let before = pipeline.submit(&raw_event("u1", 1_700_000_000)).await.unwrap();
        assert!(before.degraded.is_none());

        // Swap in an all-leaf model; scoring continues seamlessly.
        let contract = feature_names(&config.snapshot().velocity.windows_secs);
        let replacement = serde_json::json!({
            "model_id": "swapped",
            "feature_names": contract,
            "importance": contract.iter().map(|_| 1.0).collect::<Vec<_>>(),
            "n_samples": 256,
            "trees": [{"nodes": [{"size": 200}]}]
        })
        .to_string();
        store.load(&replacement).unwrap();

        let after = pipeline.submit(&raw_event("u1", 1_700_000_001)).await.unwrap();
        assert!(after.degraded.is_none());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_unscored_events_leave_profile_untouched() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let contract = feature_names(&config.snapshot().velocity.windows_secs);
        let store = Arc::new(ModelStore::new(contract.clone()));
        let pipeline = Pipeline::spawn(config, Arc::clone(&store), None, None);

        // With no model these degrade, and must not feed the profile.
        for i in 0..3 {
            let a = pipeline.submit(&raw_event("u1", 1_700_000_000 + i)).await.unwrap();
            assert!(a.degraded.is_some());
        }

        store.load(&artifact_over(&contract)).unwrap();
        let first_scored = pipeline.submit(&raw_event("u1", 1_700_000_010)).await.unwrap();
        assert!(first_scored.degraded.is_none());
        assert!(
            first_scored.cold_start,
            "unscored events were folded into the profile"
        );
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_profile_settings_follow_config_swap() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let pipeline = Pipeline::spawn(config.clone(), store, None, None);

        for i in 0..5 {
            pipeline.submit(&raw_event("u1", 1_700_000_000 + i * 60)).await.unwrap();
        }
        let warm = pipeline.submit(&raw_event("u1", 1_700_000_400)).await.unwrap();
        assert!(!warm.cold_start);

        let mut strict = (*config.snapshot()).clone();
        strict.profile.min_samples = 1_000;
        config.replace(strict).unwrap();

        let after = pipeline.submit(&raw_event("u1", 1_700_000_460)).await.unwrap();
        assert!(after.cold_start, "profile settings frozen at spawn");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_corruption_resets_profile_and_window() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let cfg = config.snapshot();
        let store = store_with_model(&cfg);
        let ctx = WorkerContext {
            config: config.clone(),
            store,
            ip_velocity: Arc::new(
                (0..IP_SHARDS)
                    .map(|_| Mutex::new(VelocityChecker::new(&cfg.velocity)))
                    .collect(),
            ),
            audit: None,
            alert: None,
        };
        let mut user_velocity = VelocityChecker::new(&cfg.velocity);
        let mut profiler = BehaviorProfiler::new();
        let engine = RiskEngine::new(Arc::clone(&ctx.store));

        let mut last = None;
        for _ in 0..25 {
            last = Some(
                process_event(
                    &behavior_event("u1", 1_700_000_000),
                    &mut user_velocity,
                    &mut profiler,
                    &engine,
                    &ctx,
                    1,
                )
                .await,
            );
        }
        assert_eq!(last.unwrap().risk_tier, RiskTier::Critical);

        profiler.profile_mut("u1").unwrap().sample_count = f64::NAN;
        let degraded = process_event(
            &behavior_event("u1", 1_700_000_001),
            &mut user_velocity,
            &mut profiler,
            &engine,
            &ctx,
            1,
        )
        .await;
        assert!(degraded.degraded.as_deref().unwrap().contains("corruption"));

        // Both the profile and the velocity window start over.
        let fresh = process_event(
            &behavior_event("u1", 1_700_000_002),
            &mut user_velocity,
            &mut profiler,
            &engine,
            &ctx,
            1,
        )
        .await;
        assert!(fresh.cold_start);
        assert_eq!(fresh.risk_tier, RiskTier::Low);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_work() {
        let config = ConfigHandle::new(test_config()).unwrap();
        let store = store_with_model(&config.snapshot());
        let audit = Arc::new(CollectingAudit::default());
        let pipeline = Pipeline::spawn(config, store, Some(audit.clone()), None);

        for i in 0..50 {
            pipeline.submit(&raw_event(&format!("u{}", i % 5), 1_700_000_000 + i)).await.unwrap();
        }
        pipeline.shutdown().await;
        assert_eq!(audit.records.lock().unwrap().len(), 50);
    }
}
