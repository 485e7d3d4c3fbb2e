//! Daemon wiring: pipeline construction, event replay, and the
//! tracing-backed alert sink.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use riskgate_core::audit::FileAuditSink;
use riskgate_core::config::{ConfigHandle, EngineConfig};
use riskgate_core::model::{feature_names, ModelStore};
use riskgate_core::pipeline::{AlertSink, Pipeline};
use riskgate_core::risk::RiskAssessment;

/// Alert sink that emits high-risk assessments into the tracing
/// stream. Stands in for an external notification channel.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, assessment: &RiskAssessment) -> riskgate_core::Result<()> {
        warn!(
            user_id = %assessment.user_id,
            event_id = %assessment.event_id,
            tier = ?assessment.risk_tier,
            decision = ?assessment.decision,
            score = assessment.raw_score,
            "high-risk activity"
        );
        Ok(())
    }
}

/// Replay totals from one scoring run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub scored: u64,
    pub skipped: u64,
    pub degraded: u64,
}

/// A running riskgate instance: pipeline, audit log, alert sink.
pub struct Daemon {
    pipeline: Pipeline,
    audit: Arc<FileAuditSink>,
}

impl Daemon {
    /// Wire up the pipeline from configuration. `model_artifact` is
    /// the JSON artifact text; without one the pipeline degrades every
    /// event to the fallback decision until a model is loaded.
    pub fn new(
        config: EngineConfig,
        audit_log_path: PathBuf,
        model_artifact: Option<&str>,
    ) -> Result<Self> {
        let contract = feature_names(&config.velocity.windows_secs);
        let store = Arc::new(ModelStore::new(contract));
        if let Some(artifact) = model_artifact {
            store.load(artifact).context("loading model artifact")?;
        } else {
            warn!("no model artifact supplied; every event will degrade to the fallback decision");
        }

        let audit = Arc::new(
            FileAuditSink::new(audit_log_path.clone(), config.audit.clone())
                .with_context(|| format!("opening audit log {}", audit_log_path.display()))?,
        );

        let handle = ConfigHandle::new(config).context("validating configuration")?;
        let pipeline = Pipeline::spawn(
            handle,
            store,
            Some(audit.clone()),
            Some(Arc::new(TracingAlertSink)),
        );

        Ok(Self { pipeline, audit })
    }

    /// Score JSON-lines events from `reader`, writing one assessment
    /// per line to `writer`. Unparseable lines are skipped with a
    /// warning; degraded assessments are counted but still written.
    pub async fn score_stream<R, W>(&self, reader: R, writer: &mut W) -> Result<ReplaySummary>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut summary = ReplaySummary::default();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable input line");
                    summary.skipped += 1;
                    continue;
                }
            };

            let assessment = self.pipeline.submit(&raw).await?;
            summary.scored += 1;
            if assessment.degraded.is_some() {
                summary.degraded += 1;
            }

            let mut out = serde_json::to_vec(&assessment)?;
            out.push(b'\n');
            writer.write_all(&out).await?;
        }
        writer.flush().await?;

        info!(
            scored = summary.scored,
            skipped = summary.skipped,
            degraded = summary.degraded,
            "replay finished"
        );
        Ok(summary)
    }

    /// Drain the pipeline and flush the audit log.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
        self.audit.shutdown();
    }
}
