//! Per-pair linkage state machine
//!
//! ```text
//! Pending --evidence--> Linked | Unlinked | Pending
//!    \                        |
//!     `------ finalize -------+--> frozen (Pending becomes Ambiguous)
//! ```
//!
//! Each decision lives behind its own async mutex, so updates to one pair are
//! applied one at a time while different pairs proceed in parallel. Every
//! transition is appended to the evidence ledger before it takes effect; a
//! failed append leaves the decision unchanged.

use crate::error::{RelinkError, Result};
use crate::ledger::{DecisionTransition, EvidenceLedger, LedgerPayload, TransitionCause};
use crate::linkage::accumulator::DecisionPolicy;
use crate::types::{LinkageDecision, PairId, SignalId, SimilarityScore, Verdict};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct DecisionCell {
    decision: LinkageDecision,
    log_odds: f64,
    opened: bool,
}

/// Owns every linkage decision and mirrors its transitions into the ledger
pub struct DecisionEngine {
    policy: DecisionPolicy,
    ledger: Arc<EvidenceLedger>,
    cells: RwLock<HashMap<PairId, Arc<Mutex<DecisionCell>>>>,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy, ledger: Arc<EvidenceLedger>) -> Self {
        Self {
            policy,
            ledger,
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    async fn cell(&self, pair_id: &PairId) -> Arc<Mutex<DecisionCell>> {
        if let Some(cell) = self.cells.read().await.get(pair_id) {
            return Arc::clone(cell);
        }

        let mut cells = self.cells.write().await;
        let cell = cells.entry(pair_id.clone()).or_insert_with(|| {
            let log_odds = self.policy.prior();
            Arc::new(Mutex::new(DecisionCell {
                decision: LinkageDecision {
                    pair_id: pair_id.clone(),
                    verdict: Verdict::Pending,
                    confidence: self.policy.confidence(log_odds),
                    evidence_count: 0,
                    insufficient_count: 0,
                    finalized: false,
                    decided_at: Utc::now(),
                },
                log_odds,
                opened: false,
            }))
        });
        Arc::clone(cell)
    }

    async fn existing(&self, pair_id: &PairId) -> Result<Arc<Mutex<DecisionCell>>> {
        self.cells
            .read()
            .await
            .get(pair_id)
            .cloned()
            .ok_or_else(|| RelinkError::PairNotFound(pair_id.to_string()))
    }

    /// Append a transition for `next`, then commit it into `cell`
    async fn commit(
        &self,
        cell: &mut DecisionCell,
        next: DecisionCell,
        cause: TransitionCause,
    ) -> Result<()> {
        let transition = DecisionTransition {
            pair_id: next.decision.pair_id.clone(),
            cause,
            from: cell.decision.verdict,
            to: next.decision.verdict,
            confidence: next.decision.confidence,
            evidence_count: next.decision.evidence_count,
            finalized: next.decision.finalized,
        };
        self.ledger
            .append(LedgerPayload::Transition(transition))
            .await?;
        *cell = next;
        Ok(())
    }

    async fn ensure_opened(&self, cell: &mut DecisionCell) -> Result<()> {
        if cell.opened {
            return Ok(());
        }
        let mut next = cell.clone();
        next.opened = true;
        self.commit(cell, next, TransitionCause::Opened).await?;
        debug!("Opened decision {}", cell.decision.pair_id);
        Ok(())
    }

    /// Fold a similarity score into its pair's decision
    pub async fn apply_score(&self, score: &SimilarityScore) -> Result<LinkageDecision> {
        let cell = self.cell(&score.pair_id).await;
        let mut cell = cell.lock().await;
        if cell.decision.finalized {
            return Err(RelinkError::DecisionFinalized(score.pair_id.to_string()));
        }
        self.ensure_opened(&mut cell).await?;

        let mut next = cell.clone();
        next.log_odds = self.policy.accumulate(cell.log_odds, score.raw, score.decay);
        next.decision.confidence = self.policy.confidence(next.log_odds);
        next.decision.verdict = self.policy.verdict(next.decision.confidence);
        next.decision.evidence_count += 1;
        next.decision.decided_at = Utc::now();

        let cause = TransitionCause::Evidence {
            pre_signal: score.pre_signal,
            post_signal: score.post_signal,
            score: score.value,
            raw: score.raw,
            decay: score.decay,
        };
        let from = cell.decision.verdict;
        self.commit(&mut cell, next, cause).await?;

        if from != cell.decision.verdict {
            info!(
                "{}: {} -> {} (confidence {:.3}, {} observations)",
                cell.decision.pair_id,
                from,
                cell.decision.verdict,
                cell.decision.confidence,
                cell.decision.evidence_count
            );
        }
        Ok(cell.decision.clone())
    }

    /// Record an observation that could not be scored
    ///
    /// Creates the decision if needed; confidence and evidence count are left
    /// untouched.
    pub async fn record_insufficient(
        &self,
        pair_id: &PairId,
        pre_signal: SignalId,
        post_signal: SignalId,
        comparable: usize,
        required: usize,
    ) -> Result<LinkageDecision> {
        let cell = self.cell(pair_id).await;
        let mut cell = cell.lock().await;
        if cell.decision.finalized {
            return Err(RelinkError::DecisionFinalized(pair_id.to_string()));
        }
        self.ensure_opened(&mut cell).await?;

        let mut next = cell.clone();
        next.decision.insufficient_count += 1;
        next.decision.decided_at = Utc::now();

        let cause = TransitionCause::Insufficient {
            pre_signal,
            post_signal,
            comparable,
            required,
        };
        self.commit(&mut cell, next, cause).await?;
        debug!(
            "{}: insufficient signal ({} of {} features comparable)",
            pair_id, comparable, required
        );
        Ok(cell.decision.clone())
    }

    /// Freeze a decision; finalizing twice returns the frozen state unchanged
    pub async fn finalize(&self, pair_id: &PairId) -> Result<LinkageDecision> {
        let cell = self.existing(pair_id).await?;
        let mut cell = cell.lock().await;
        if cell.decision.finalized {
            return Ok(cell.decision.clone());
        }
        self.ensure_opened(&mut cell).await?;

        let mut next = cell.clone();
        next.decision.verdict = self.policy.final_verdict(cell.decision.verdict);
        next.decision.finalized = true;
        next.decision.decided_at = Utc::now();
        self.commit(&mut cell, next, TransitionCause::Finalized)
            .await?;

        info!(
            "Finalized {} as {} (confidence {:.3}, {} observations)",
            pair_id,
            cell.decision.verdict,
            cell.decision.confidence,
            cell.decision.evidence_count
        );
        Ok(cell.decision.clone())
    }

    /// Finalize every open decision whose pair matches `predicate`
    ///
    /// Safe to re-run: already frozen decisions are skipped, and a pair that
    /// fails to finalize is logged and left open for the next sweep.
    pub async fn finalize_where<F>(&self, predicate: F) -> Vec<LinkageDecision>
    where
        F: Fn(&PairId) -> bool,
    {
        let mut targets: Vec<(PairId, Arc<Mutex<DecisionCell>>)> = self
            .cells
            .read()
            .await
            .iter()
            .filter(|(id, _)| predicate(*id))
            .map(|(id, cell)| (id.clone(), Arc::clone(cell)))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));

        let mut finalized = Vec::new();
        for (pair_id, cell) in targets {
            if cell.lock().await.decision.finalized {
                continue;
            }
            match self.finalize(&pair_id).await {
                Ok(decision) => finalized.push(decision),
                Err(e) => warn!("Failed to finalize {}: {}", pair_id, e),
            }
        }
        finalized
    }

    pub async fn get(&self, pair_id: &PairId) -> Option<LinkageDecision> {
        let cell = self.cells.read().await.get(pair_id).cloned()?;
        let cell = cell.lock().await;
        Some(cell.decision.clone())
    }

    /// Every decision, ordered by pair
    pub async fn all(&self) -> Vec<LinkageDecision> {
        let cells: Vec<Arc<Mutex<DecisionCell>>> =
            self.cells.read().await.values().cloned().collect();

        let mut decisions = Vec::with_capacity(cells.len());
        for cell in cells {
            decisions.push(cell.lock().await.decision.clone());
        }
        decisions.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        decisions
    }

    pub async fn len(&self) -> usize {
        self.cells.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cells.read().await.is_empty()
    }
}
