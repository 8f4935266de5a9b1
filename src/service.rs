//! Linkage service
//!
//! Wires the pipeline together and exposes the ingestion and query API:
//!
//! ```text
//! submit_signal -> normalize -> queue --process_pending--> reorder -> pair
//!                                                          -> score -> decide -> ledger
//! ```
//!
//! Per-signal and per-pair failures are logged and skipped; they never stop
//! the stream. Candidates are grouped by pair and each group runs as its own
//! task, so different pairs are scored and decided concurrently while one
//! pair's observations are applied in release order.

use crate::config::RelinkConfig;
use crate::error::{RelinkError, Result};
use crate::ingest::{Candidate, IngestQueue, Pairer, ReorderBuffer};
use crate::ledger::{EvidenceLedger, JsonlStore, LedgerPayload, VerificationReport};
use crate::linkage::{DecisionEngine, DecisionPolicy};
use crate::normalizer::{FeatureNormalizer, RawSignal};
use crate::reporter::{summarize, ReportFilter, ReportStatistics};
use crate::scoring::SimilarityScorer;
use crate::types::{LinkageDecision, PairId, ResetEventId, Signal, SignalId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What one processing pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    /// Signals taken off the ingestion queue
    pub dequeued: usize,
    /// Signals released from the reorder buffer into pairing
    pub released: usize,
    pub candidates: usize,
    pub scored: usize,
    pub insufficient: usize,
    /// Observations refused because their decision was already final
    pub rejected: usize,
    pub failed: usize,
}

impl ProcessSummary {
    fn absorb(&mut self, other: PairOutcome) {
        self.scored += other.scored;
        self.insufficient += other.insufficient;
        self.rejected += other.rejected;
        self.failed += other.failed;
    }
}

#[derive(Debug, Default)]
struct PairOutcome {
    scored: usize,
    insufficient: usize,
    rejected: usize,
    failed: usize,
}

impl PairOutcome {
    fn merge(&mut self, other: PairOutcome) {
        self.scored += other.scored;
        self.insufficient += other.insufficient;
        self.rejected += other.rejected;
        self.failed += other.failed;
    }
}

/// Ordering-sensitive stages, guarded together
struct Pipeline {
    reorder: ReorderBuffer,
    pairer: Pairer,
}

pub struct LinkageService {
    config: RelinkConfig,
    normalizer: FeatureNormalizer,
    scorer: Arc<SimilarityScorer>,
    queue: IngestQueue<Signal>,
    pipeline: Mutex<Pipeline>,
    engine: Arc<DecisionEngine>,
    ledger: Arc<EvidenceLedger>,
}

impl LinkageService {
    /// Validate `config` and open the ledger it names (in memory when unset)
    pub async fn new(config: RelinkConfig) -> Result<Self> {
        config.validate()?;
        let ledger = match &config.ledger_path {
            Some(path) => EvidenceLedger::open(Box::new(JsonlStore::open(path).await?)).await?,
            None => EvidenceLedger::in_memory(),
        };
        Self::with_ledger(config, Arc::new(ledger))
    }

    /// Build over an already opened ledger
    pub fn with_ledger(config: RelinkConfig, ledger: Arc<EvidenceLedger>) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(DecisionEngine::new(
            DecisionPolicy::from_config(&config),
            Arc::clone(&ledger),
        ));
        let pipeline = Pipeline {
            reorder: ReorderBuffer::new(config.lateness_span()),
            pairer: Pairer::from_config(&config),
        };

        info!(
            "Linkage service ready: {} features, thresholds {}/{}, horizon {}s",
            config.features.len(),
            config.low_threshold,
            config.high_threshold,
            config.decay_horizon.as_secs()
        );

        Ok(Self {
            normalizer: FeatureNormalizer::new(config.features.clone()),
            scorer: Arc::new(SimilarityScorer::from_config(&config)),
            queue: IngestQueue::new(config.queue_capacity, config.backpressure_policy),
            pipeline: Mutex::new(pipeline),
            engine,
            ledger,
            config,
        })
    }

    pub fn config(&self) -> &RelinkConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<EvidenceLedger> {
        &self.ledger
    }

    /// Normalize a raw payload and queue it for processing
    pub async fn submit_signal(&self, raw: &RawSignal) -> Result<SignalId> {
        let normalized = self.normalizer.normalize(raw)?;
        let id = normalized.signal.id();
        self.queue.push(normalized.signal).await?;
        Ok(id)
    }

    /// Parse a JSON payload and submit it
    pub async fn submit_signal_json(&self, json: &str) -> Result<SignalId> {
        let raw = RawSignal::from_json(json)?;
        self.submit_signal(&raw).await
    }

    /// Open the next epoch
    ///
    /// The reset is recorded in the ledger, then any signals already held on
    /// either side of it are paired and evaluated.
    pub async fn submit_reset_event(
        &self,
        old_epoch: u64,
        new_epoch: u64,
        occurred_at: DateTime<Utc>,
    ) -> Result<ResetEventId> {
        let mut pipeline = self.pipeline.lock().await;

        let reset = pipeline
            .pairer
            .resets()
            .validate(old_epoch, new_epoch, occurred_at)?;
        self.ledger
            .append(LedgerPayload::ResetRecorded { reset })
            .await?;
        let (reset, candidates) = pipeline
            .pairer
            .add_reset(old_epoch, new_epoch, occurred_at)?;

        if !candidates.is_empty() {
            let outcome = self.evaluate(candidates).await;
            debug!("{} opened with {:?}", reset.id, outcome);
        }
        Ok(reset.id)
    }

    /// Drain the queue and evaluate every signal the reorder buffer releases
    pub async fn process_pending(&self) -> Result<ProcessSummary> {
        let mut pipeline = self.pipeline.lock().await;
        let mut summary = self.take_queued(&mut pipeline).await;
        let released = pipeline.reorder.release();
        self.advance(&mut pipeline, released, &mut summary).await?;
        Ok(summary)
    }

    /// Like [`process_pending`](Self::process_pending), but release everything
    /// buffered regardless of lateness
    pub async fn flush(&self) -> Result<ProcessSummary> {
        let mut pipeline = self.pipeline.lock().await;
        let mut summary = self.take_queued(&mut pipeline).await;
        let released = pipeline.reorder.flush();
        self.advance(&mut pipeline, released, &mut summary).await?;
        Ok(summary)
    }

    /// Move the queue into the reorder buffer
    ///
    /// Callers hold the pipeline lock, so batches reach the buffer in the
    /// order they left the queue.
    async fn take_queued(&self, pipeline: &mut Pipeline) -> ProcessSummary {
        let batch = self.queue.drain().await;
        let summary = ProcessSummary {
            dequeued: batch.len(),
            ..Default::default()
        };
        for signal in batch {
            pipeline.reorder.insert(signal);
        }
        summary
    }

    async fn advance(
        &self,
        pipeline: &mut Pipeline,
        released: Vec<Signal>,
        summary: &mut ProcessSummary,
    ) -> Result<()> {
        summary.released = released.len();

        let mut candidates = Vec::new();
        for signal in released {
            if pipeline.pairer.has_seen(&signal.id()) {
                continue;
            }
            self.ledger
                .append(LedgerPayload::SignalAccepted {
                    signal: signal.id(),
                    source: signal.source().to_string(),
                    epoch: signal.source_epoch(),
                    collected_at: signal.collected_at(),
                })
                .await?;
            candidates.extend(pipeline.pairer.admit(signal));
        }

        summary.candidates = candidates.len();
        summary.absorb(self.evaluate(candidates).await);
        Ok(())
    }

    /// Score and decide candidates, one task per pair
    async fn evaluate(&self, candidates: Vec<Candidate>) -> PairOutcome {
        let mut groups: BTreeMap<PairId, Vec<Candidate>> = BTreeMap::new();
        for candidate in candidates {
            groups
                .entry(candidate.pair.pair_id.clone())
                .or_default()
                .push(candidate);
        }

        let mut tasks = JoinSet::new();
        for (_, group) in groups {
            let scorer = Arc::clone(&self.scorer);
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move { evaluate_pair(&scorer, &engine, group).await });
        }

        let mut total = PairOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => total.merge(outcome),
                Err(e) => {
                    warn!("Pair evaluation task failed: {}", e);
                    total.failed += 1;
                }
            }
        }
        total
    }

    /// Finalize every decision whose observation window has closed
    ///
    /// A window closes once `reset + decay_horizon` is at or before the
    /// watermark minus the lateness window. Re-running is harmless.
    pub async fn finalize_expired(&self) -> Result<Vec<LinkageDecision>> {
        let mut pipeline = self.pipeline.lock().await;
        let Some(cutoff) = pipeline.reorder.cutoff() else {
            return Ok(Vec::new());
        };

        let closed: HashSet<ResetEventId> = pipeline
            .pairer
            .resets()
            .iter()
            .filter(|r| pipeline.pairer.rules().window_closed(r, cutoff))
            .map(|r| r.id)
            .collect();
        if closed.is_empty() {
            return Ok(Vec::new());
        }

        let finalized = self
            .engine
            .finalize_where(|id| closed.contains(&id.reset))
            .await;
        pipeline.pairer.prune(cutoff);

        if !finalized.is_empty() {
            info!("Finalize sweep closed {} decisions", finalized.len());
        }
        Ok(finalized)
    }

    /// Freeze one decision; a second call returns the frozen state
    pub async fn finalize(&self, pair_id: &PairId) -> Result<LinkageDecision> {
        self.engine.finalize(pair_id).await
    }

    /// Freeze every open decision
    pub async fn finalize_all(&self) -> Result<Vec<LinkageDecision>> {
        Ok(self.engine.finalize_where(|_| true).await)
    }

    pub async fn get_decision(&self, pair_id: &PairId) -> Option<LinkageDecision> {
        self.engine.get(pair_id).await
    }

    pub async fn decisions(&self) -> Vec<LinkageDecision> {
        self.engine.all().await
    }

    pub async fn get_report(&self, filter: &ReportFilter) -> ReportStatistics {
        let snapshot = self.ledger.snapshot().await;
        summarize(&snapshot, filter)
    }

    pub async fn verify_ledger(&self) -> Result<VerificationReport> {
        self.ledger.verify().await
    }

    /// Signals waiting in the ingestion queue
    pub async fn queued(&self) -> usize {
        self.queue.len().await
    }

    /// Signals held back by the reorder buffer
    pub async fn buffered(&self) -> usize {
        self.pipeline.lock().await.reorder.len()
    }

    pub async fn watermark(&self) -> Option<DateTime<Utc>> {
        self.pipeline.lock().await.reorder.watermark()
    }

    /// Signals that reached the reorder buffer after a later one was released
    pub async fn late_arrivals(&self) -> u64 {
        self.pipeline.lock().await.reorder.late_count()
    }
}

async fn evaluate_pair(
    scorer: &SimilarityScorer,
    engine: &DecisionEngine,
    group: Vec<Candidate>,
) -> PairOutcome {
    let mut outcome = PairOutcome::default();

    for candidate in group {
        let pair_id = &candidate.pair.pair_id;
        let result = match scorer.score(&candidate.pre, &candidate.post, &candidate.reset) {
            Ok(score) => engine.apply_score(&score).await.map(|_| {
                outcome.scored += 1;
            }),
            Err(RelinkError::InsufficientSignal {
                comparable,
                required,
            }) => engine
                .record_insufficient(
                    pair_id,
                    candidate.pair.pre_signal,
                    candidate.pair.post_signal,
                    comparable,
                    required,
                )
                .await
                .map(|_| {
                    outcome.insufficient += 1;
                }),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(RelinkError::DecisionFinalized(_)) => {
                warn!("{} is final; skipping late observation", pair_id);
                outcome.rejected += 1;
            }
            Err(e) => {
                warn!("Failed to evaluate {}: {}", pair_id, e);
                outcome.failed += 1;
            }
        }
    }
    outcome
}
