//! Reset registry and epoch-crossing candidate generation
//!
//! Epoch boundaries exist only as registered [`ResetEvent`]s; the latest epoch
//! is derived from the registry rather than held as separate state.
//!
//! A candidate pair joins a signal tagged `reset.old_epoch` with a signal
//! tagged `reset.new_epoch` when
//! - the pre-reset signal lies within `pre_reset_window` before the reset,
//! - the post-reset signal lies in `[reset, reset + decay_horizon)`, and
//! - their observers may see each other.
//!
//! Pairs are generated whenever either side is admitted or the reset itself
//! is registered, so neither arrival order decides whether a pair exists.

use crate::config::RelinkConfig;
use crate::error::{RelinkError, Result};
use crate::types::{CandidatePair, Epoch, PairId, ResetEvent, ResetEventId, Signal, SignalId};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Accepted reset events keyed by the epoch they opened
#[derive(Debug, Clone)]
pub struct ResetRegistry {
    initial_epoch: Epoch,
    resets: BTreeMap<Epoch, ResetEvent>,
}

impl ResetRegistry {
    pub fn new(initial_epoch: Epoch) -> Self {
        Self {
            initial_epoch,
            resets: BTreeMap::new(),
        }
    }

    /// Epoch opened by the most recent reset
    pub fn latest_epoch(&self) -> Epoch {
        self.resets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.initial_epoch)
    }

    /// Check that a reset could be registered next, without registering it
    ///
    /// `old_epoch` must be the latest epoch, `new_epoch` its successor, and the
    /// reset may not predate the previous one.
    pub fn validate(
        &self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        occurred_at: DateTime<Utc>,
    ) -> Result<ResetEvent> {
        let reset = ResetEvent::new(old_epoch, new_epoch, occurred_at)?;

        if self.resets.contains_key(&new_epoch) {
            return Err(RelinkError::InvalidResetEvent(format!(
                "epoch {} was already opened",
                new_epoch
            )));
        }

        let latest = self.latest_epoch();
        if old_epoch != latest {
            return Err(RelinkError::InvalidResetEvent(format!(
                "reset from epoch {} but the latest epoch is {}",
                old_epoch, latest
            )));
        }

        if let Some(previous) = self.resets.values().next_back() {
            if occurred_at < previous.occurred_at {
                return Err(RelinkError::InvalidResetEvent(format!(
                    "reset at {} predates {} at {}",
                    occurred_at, previous.id, previous.occurred_at
                )));
            }
        }

        Ok(reset)
    }

    /// Accept the next reset event
    pub fn register(
        &mut self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        occurred_at: DateTime<Utc>,
    ) -> Result<ResetEvent> {
        let reset = self.validate(old_epoch, new_epoch, occurred_at)?;
        self.resets.insert(new_epoch, reset);
        Ok(reset)
    }

    pub fn get(&self, id: ResetEventId) -> Option<&ResetEvent> {
        self.resets.get(&id.0)
    }

    /// Reset that moved out of `epoch`
    pub fn leaving(&self, epoch: Epoch) -> Option<&ResetEvent> {
        epoch.checked_add(1).and_then(|next| self.resets.get(&next))
    }

    /// Reset that moved into `epoch`
    pub fn entering(&self, epoch: Epoch) -> Option<&ResetEvent> {
        self.resets.get(&epoch)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResetEvent> {
        self.resets.values()
    }

    pub fn len(&self) -> usize {
        self.resets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resets.is_empty()
    }
}

/// A candidate pair with everything needed to score it
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pair: CandidatePair,
    pub pre: Arc<Signal>,
    pub post: Arc<Signal>,
    pub reset: ResetEvent,
}

/// Pairing windows and observer scoping
#[derive(Debug, Clone)]
pub struct PairingRules {
    pub pre_reset_window: Duration,
    pub decay_horizon: Duration,
    pub collusion_groups: Vec<Vec<String>>,
}

impl PairingRules {
    pub fn from_config(config: &RelinkConfig) -> Self {
        Self {
            pre_reset_window: config.pre_reset_window_span(),
            decay_horizon: config.decay_horizon_span(),
            collusion_groups: config.collusion_groups.clone(),
        }
    }

    pub fn pre_in_window(&self, signal: &Signal, reset: &ResetEvent) -> bool {
        let lead = reset.occurred_at - signal.collected_at();
        lead >= Duration::zero() && lead <= self.pre_reset_window
    }

    /// Post-reset signals at or past the horizon are pruned
    pub fn post_in_window(&self, signal: &Signal, reset: &ResetEvent) -> bool {
        let gap = signal.collected_at() - reset.occurred_at;
        gap >= Duration::zero() && gap < self.decay_horizon
    }

    pub fn observers_collude(&self, a: Option<&str>, b: Option<&str>) -> bool {
        match (a, b) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) if a == b => true,
            (Some(a), Some(b)) => self
                .collusion_groups
                .iter()
                .any(|group| group.iter().any(|o| o == a) && group.iter().any(|o| o == b)),
        }
    }

    /// Reset's observation window has closed by `cutoff`
    pub fn window_closed(&self, reset: &ResetEvent, cutoff: DateTime<Utc>) -> bool {
        reset.occurred_at + self.decay_horizon <= cutoff
    }
}

/// Released signals indexed by epoch, plus the reset registry
pub struct Pairer {
    rules: PairingRules,
    resets: ResetRegistry,
    by_epoch: HashMap<Epoch, Vec<Arc<Signal>>>,
    seen: HashSet<SignalId>,
}

impl Pairer {
    pub fn new(rules: PairingRules, initial_epoch: Epoch) -> Self {
        Self {
            rules,
            resets: ResetRegistry::new(initial_epoch),
            by_epoch: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    pub fn from_config(config: &RelinkConfig) -> Self {
        Self::new(PairingRules::from_config(config), config.initial_epoch)
    }

    pub fn rules(&self) -> &PairingRules {
        &self.rules
    }

    pub fn resets(&self) -> &ResetRegistry {
        &self.resets
    }

    /// Register a reset and pair the signals already held on either side
    pub fn add_reset(
        &mut self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        occurred_at: DateTime<Utc>,
    ) -> Result<(ResetEvent, Vec<Candidate>)> {
        let reset = self.resets.register(old_epoch, new_epoch, occurred_at)?;
        info!(
            "Registered {} (epoch {} -> {}) at {}",
            reset.id, old_epoch, new_epoch, occurred_at
        );

        let pres = self.held(old_epoch);
        let posts = self.held(new_epoch);

        let mut candidates = Vec::new();
        for post in posts {
            if !self.rules.post_in_window(post, &reset) {
                continue;
            }
            for pre in pres {
                if let Some(c) = self.candidate(pre, post, &reset) {
                    candidates.push(c);
                }
            }
        }
        Ok((reset, candidates))
    }

    /// Admit a released signal and pair it against the other side of each
    /// adjacent reset
    pub fn admit(&mut self, signal: Signal) -> Vec<Candidate> {
        if !self.seen.insert(signal.id()) {
            debug!("{} already paired, skipping", signal.id());
            return Vec::new();
        }

        let signal = Arc::new(signal);
        let epoch = signal.source_epoch();
        let mut candidates = Vec::new();

        if let Some(reset) = self.resets.leaving(epoch).copied() {
            if self.rules.pre_in_window(&signal, &reset) {
                for post in self.held(reset.new_epoch) {
                    if self.rules.post_in_window(post, &reset) {
                        candidates.extend(self.candidate(&signal, post, &reset));
                    }
                }
            }
        }

        if let Some(reset) = self.resets.entering(epoch).copied() {
            if self.rules.post_in_window(&signal, &reset) {
                for pre in self.held(reset.old_epoch) {
                    candidates.extend(self.candidate(pre, &signal, &reset));
                }
            } else {
                debug!(
                    "{} lies outside the horizon of {}, not paired",
                    signal.id(),
                    reset.id
                );
            }
        }

        self.by_epoch.entry(epoch).or_default().push(signal);
        candidates
    }

    pub fn has_seen(&self, id: &SignalId) -> bool {
        self.seen.contains(id)
    }

    fn held(&self, epoch: Epoch) -> &[Arc<Signal>] {
        self.by_epoch.get(&epoch).map(Vec::as_slice).unwrap_or(&[])
    }

    fn candidate(
        &self,
        pre: &Arc<Signal>,
        post: &Arc<Signal>,
        reset: &ResetEvent,
    ) -> Option<Candidate> {
        if !self.rules.pre_in_window(pre, reset) {
            return None;
        }
        if !self.rules.observers_collude(pre.observer(), post.observer()) {
            return None;
        }

        let gap = post.collected_at() - reset.occurred_at;
        Some(Candidate {
            pair: CandidatePair {
                pair_id: PairId::new(reset.id, pre.source(), post.source()),
                pre_signal: pre.id(),
                post_signal: post.id(),
                gap_ms: gap.num_milliseconds(),
            },
            pre: Arc::clone(pre),
            post: Arc::clone(post),
            reset: *reset,
        })
    }

    /// Drop held signals that no open reset window can use any more
    ///
    /// A signal is dead once the reset into its epoch (if any) and the reset
    /// out of it have both closed by `cutoff`. Dropped signals are forgotten
    /// by the duplicate check too. Returns how many were dropped.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dead_epochs = Vec::new();
        for &epoch in self.by_epoch.keys() {
            let entering_closed = self
                .resets
                .entering(epoch)
                .map_or(true, |r| self.rules.window_closed(r, cutoff));
            let leaving_closed = self
                .resets
                .leaving(epoch)
                .is_some_and(|r| self.rules.window_closed(r, cutoff));
            if entering_closed && leaving_closed {
                dead_epochs.push(epoch);
            }
        }

        let mut dropped = 0;
        for epoch in dead_epochs {
            if let Some(signals) = self.by_epoch.remove(&epoch) {
                dropped += signals.len();
                for signal in &signals {
                    self.seen.remove(&signal.id());
                }
            }
        }
        if dropped > 0 {
            debug!("Pruned {} signals from closed epochs", dropped);
        }
        dropped
    }

    /// Signals currently held for pairing
    pub fn held_count(&self) -> usize {
        self.by_epoch.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn signal(source: &str, observer: Option<&str>, epoch: Epoch, secs: i64) -> Signal {
        Signal::new(
            source,
            observer.map(str::to_string),
            epoch,
            at(secs),
            Default::default(),
        )
        .unwrap()
    }

    fn rules() -> PairingRules {
        PairingRules {
            pre_reset_window: Duration::seconds(100),
            decay_horizon: Duration::seconds(100),
            collusion_groups: vec![vec!["ads.a".to_string(), "ads.b".to_string()]],
        }
    }

    fn pair_ids(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.pair.pair_id.to_string()).collect()
    }

    #[test]
    fn test_registry_enforces_monotonic_epochs() {
        let mut registry = ResetRegistry::new(0);
        registry.register(0, 1, at(0)).unwrap();
        assert_eq!(registry.latest_epoch(), 1);

        // Already opened
        assert!(matches!(
            registry.register(0, 1, at(5)),
            Err(RelinkError::InvalidResetEvent(_))
        ));
        // Skips an epoch
        assert!(registry.register(1, 3, at(5)).is_err());
        // Not from the latest epoch
        assert!(registry.register(2, 3, at(5)).is_err());
        // Goes back in time
        assert!(registry.register(1, 2, at(-5)).is_err());

        registry.register(1, 2, at(5)).unwrap();
        let opened: Vec<Epoch> = registry.iter().map(|r| r.new_epoch).collect();
        assert_eq!(opened, vec![1, 2]);
    }

    #[test]
    fn test_registry_honours_initial_epoch() {
        let mut registry = ResetRegistry::new(41);
        assert!(registry.register(0, 1, at(0)).is_err());
        let reset = registry.register(41, 42, at(0)).unwrap();
        assert_eq!(reset.id, ResetEventId(42));
    }

    #[test]
    fn test_pairs_form_regardless_of_arrival_order() {
        let mut signals_first = Pairer::new(rules(), 0);
        assert!(signals_first.admit(signal("pre", None, 0, -10)).is_empty());
        assert!(signals_first.admit(signal("post", None, 1, 10)).is_empty());
        let (_, from_reset) = signals_first.add_reset(0, 1, at(0)).unwrap();

        let mut reset_first = Pairer::new(rules(), 0);
        reset_first.add_reset(0, 1, at(0)).unwrap();
        assert!(reset_first.admit(signal("post", None, 1, 10)).is_empty());
        let from_pre = reset_first.admit(signal("pre", None, 0, -10));

        assert_eq!(pair_ids(&from_reset), vec!["reset-1:pre->post"]);
        assert_eq!(pair_ids(&from_pre), pair_ids(&from_reset));
        assert_eq!(from_pre[0].pair.gap_ms, 10_000);
    }

    #[test]
    fn test_horizon_prunes_post_signal() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("pre", None, 0, -10));

        assert_eq!(pairer.admit(signal("edge", None, 1, 100)).len(), 0);
        assert_eq!(pairer.admit(signal("inside", None, 1, 99)).len(), 1);
        assert_eq!(pairer.admit(signal("before", None, 1, -1)).len(), 0);
    }

    #[test]
    fn test_pre_reset_window() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("post", None, 1, 5));

        assert_eq!(pairer.admit(signal("stale", None, 0, -101)).len(), 0);
        assert_eq!(pairer.admit(signal("fresh", None, 0, -100)).len(), 1);
    }

    #[test]
    fn test_observer_scoping() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("pre-a", Some("ads.a"), 0, -1));
        pairer.admit(signal("pre-c", Some("ads.c"), 0, -1));
        pairer.admit(signal("pre-ambient", None, 0, -1));

        let mut ids = pair_ids(&pairer.admit(signal("post-b", Some("ads.b"), 1, 1)));
        ids.sort();
        assert_eq!(
            ids,
            vec!["reset-1:pre-a->post-b", "reset-1:pre-ambient->post-b"]
        );
    }

    #[test]
    fn test_duplicate_signal_not_paired_twice() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("pre", None, 0, -1));

        let post = signal("post", None, 1, 1);
        assert_eq!(pairer.admit(post.clone()).len(), 1);
        assert!(pairer.admit(post).is_empty());
    }

    #[test]
    fn test_same_epoch_signals_never_pair() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("a", None, 1, 1));
        assert!(pairer.admit(signal("b", None, 1, 2)).is_empty());
    }

    #[test]
    fn test_prune_closed_epochs() {
        let mut pairer = Pairer::new(rules(), 0);
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(signal("pre", None, 0, -10));
        pairer.admit(signal("post", None, 1, 10));

        assert_eq!(pairer.prune(at(50)), 0);
        // Epoch 0 is done; epoch 1 still waits for a reset out of it
        assert_eq!(pairer.prune(at(100)), 1);
        assert_eq!(pairer.held_count(), 1);
    }

    #[test]
    fn test_prune_forgets_dropped_signal_ids() {
        let mut pairer = Pairer::new(rules(), 0);
        let kept = signal("post", None, 1, 10);
        let mut dropped = Vec::new();
        for i in 0..1000 {
            let s = signal(&format!("pre-{}", i), None, 0, -50);
            dropped.push(s.id());
            pairer.admit(s);
        }
        pairer.add_reset(0, 1, at(0)).unwrap();
        pairer.admit(kept.clone());
        pairer.add_reset(1, 2, at(20)).unwrap();

        assert_eq!(pairer.prune(at(1_000)), 1001);
        assert_eq!(pairer.held_count(), 0);
        assert!(pairer.seen.is_empty());
        assert!(!pairer.has_seen(&kept.id()));
        assert!(dropped.iter().all(|id| !pairer.has_seen(id)));
    }
}
