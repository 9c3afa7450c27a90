//! Weighted Byzantine agreement with reputation
//!
//! Leaderless: every participant broadcasts its value. A value is decided
//! once its summed effective weight exceeds 2/3 of the total. Reputation is
//! updated once per round when the instance is closed.

use crate::algorithm::{ConsensusAlgorithm, ConsensusInstance, InstanceContext, InstanceExt};
use crate::message::{ConsensusMessage, MessageType};
use concordia_core::{AlgorithmKind, ChainId, ConcordiaError, ConcordiaResult, Hash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub const REPUTATION_MIN: f64 = 0.5;
pub const REPUTATION_MAX: f64 = 2.0;
const AGREED_FACTOR: f64 = 1.05;
const DISAGREED_FACTOR: f64 = 0.98;
const ABSTAINED_FACTOR: f64 = 0.95;

/// Strict two-thirds rule on accumulated weight
pub fn has_weighted_quorum(support: f64, total: f64) -> bool {
    total > 0.0 && support * 3.0 > total * 2.0
}

/// How a participant behaved in a finished round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundBehavior {
    Agreed,
    Disagreed,
    Abstained,
}

#[derive(Debug, Clone, Copy)]
struct Standing {
    base: f64,
    reputation: f64,
}

impl Default for Standing {
    fn default() -> Self {
        Self { base: 1.0, reputation: 1.0 }
    }
}

/// Base weights and reputation multipliers of the participants
#[derive(Debug, Default)]
pub struct ReputationTracker {
    standings: RwLock<HashMap<ChainId, Standing>>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }
    
    pub fn set_base_weight(&self, chain: ChainId, weight: f64) -> ConcordiaResult<()> {
        if !(weight.is_finite() && weight > 0.0) {
            return Err(ConcordiaError::Validation(format!(
                "base weight of {} must be positive, got {}",
                chain, weight
            )));
        }
        self.standings.write().entry(chain).or_default().base = weight;
        Ok(())
    }
    
    pub fn base_weight(&self, chain: &ChainId) -> f64 {
        self.standings.read().get(chain).copied().unwrap_or_default().base
    }
    
    pub fn reputation(&self, chain: &ChainId) -> f64 {
        self.standings.read().get(chain).copied().unwrap_or_default().reputation
    }
    
    /// base × reputation
    pub fn effective_weight(&self, chain: &ChainId) -> f64 {
        let s = self.standings.read().get(chain).copied().unwrap_or_default();
        s.base * s.reputation
    }
    
    pub fn record(&self, chain: &ChainId, behavior: RoundBehavior) -> f64 {
        let factor = match behavior {
            RoundBehavior::Agreed => AGREED_FACTOR,
            RoundBehavior::Disagreed => DISAGREED_FACTOR,
            RoundBehavior::Abstained => ABSTAINED_FACTOR,
        };
        let mut standings = self.standings.write();
        let s = standings.entry(chain.clone()).or_default();
        s.reputation = (s.reputation * factor).clamp(REPUTATION_MIN, REPUTATION_MAX);
        s.reputation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeightedVote {
    value: Vec<u8>,
}

/// Weighted round data: effective weights frozen when the round starts
#[derive(Debug, Clone, Default)]
pub struct WeightedRound {
    weights: HashMap<ChainId, f64>,
    settled: bool,
}

impl WeightedRound {
    fn total(&self) -> f64 {
        self.weights.values().sum()
    }
    
    fn support(&self, votes: &HashMap<ChainId, Hash>) -> HashMap<Hash, f64> {
        let mut tally: HashMap<Hash, f64> = HashMap::new();
        for (voter, h) in votes {
            *tally.entry(*h).or_default() += self.weights.get(voter).copied().unwrap_or(0.0);
        }
        tally
    }
}

/// Weighted Byzantine algorithm
#[derive(Debug, Default)]
pub struct WeightedByzantine {
    reputation: ReputationTracker,
}

impl WeightedByzantine {
    pub fn new() -> Self {
        Self::default()
    }
    
    pub fn reputation(&self) -> &ReputationTracker {
        &self.reputation
    }
    
    fn check_quorum(instance: &mut ConsensusInstance) -> ConcordiaResult<()> {
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        if state.is_decided() {
            return Ok(());
        }
        
        let total = round.total();
        let winner = round
            .support(&state.prepare_votes)
            .into_iter()
            .find(|(_, support)| has_weighted_quorum(*support, total));
        if let Some((h, support)) = winner {
            if let Some(value) = state.value_for(&h).cloned() {
                state.decide(value);
                info!(
                    "Instance {} decided on {} with weight {:.3}/{:.3}",
                    ctx.instance_id, ctx.local_id, support, total
                );
            }
        }
        Ok(())
    }
}

fn round_of(ext: &mut InstanceExt) -> ConcordiaResult<&mut WeightedRound> {
    match ext {
        InstanceExt::Weighted(round) => Ok(round),
        _ => Err(ConcordiaError::Internal("instance is not driven by weighted byzantine".into())),
    }
}

impl ConsensusAlgorithm for WeightedByzantine {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::WeightedByzantine
    }
    
    fn new_round(&self, ctx: &InstanceContext) -> InstanceExt {
        let weights = ctx
            .participants
            .iter()
            .map(|p| (p.clone(), self.reputation.effective_weight(p)))
            .collect();
        InstanceExt::Weighted(WeightedRound { weights, settled: false })
    }
    
    fn start(&self, instance: &mut ConsensusInstance, value: Vec<u8>) -> ConcordiaResult<Vec<ConsensusMessage>> {
        instance.ctx.input = Some(value.clone());
        let h = instance.state.prepare(value.clone());
        instance.state.record_prepare(instance.ctx.local_id.clone(), h);
        let msg = instance.ctx.message(
            MessageType::Prepare,
            instance.state.view,
            instance.state.sequence,
            &WeightedVote { value },
        )?;
        Self::check_quorum(instance)?;
        Ok(vec![msg])
    }
    
    fn handle(
        &self,
        instance: &mut ConsensusInstance,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if message.sequence != instance.state.sequence || message.msg_type != MessageType::Prepare {
            debug!("Dropping {} from {} in weighted round", message.msg_type, message.sender);
            return Ok(Vec::new());
        }
        let vote: WeightedVote = message.decode_content()?;
        let h = instance.state.learn_value(&vote.value);
        // Votes after the decision still count for reputation
        if instance.state.record_prepare(message.sender.clone(), h) {
            Self::check_quorum(instance)?;
        }
        Ok(Vec::new())
    }
    
    fn expire(&self, instance: &mut ConsensusInstance) {
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let Ok(round) = round_of(ext) else {
            return;
        };
        if round.settled {
            return;
        }
        round.settled = true;
        
        let reference = match state.decided_value() {
            Some(value) => Some(concordia_crypto::hashing::value_hash(value)),
            None => round
                .support(&state.prepare_votes)
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(h, _)| h),
        };
        
        for participant in &ctx.participants {
            let behavior = match (state.prepare_votes.get(participant), reference.as_ref()) {
                (None, _) => RoundBehavior::Abstained,
                (Some(v), Some(r)) if v == r => RoundBehavior::Agreed,
                (Some(_), _) => RoundBehavior::Disagreed,
            };
            let rep = self.reputation.record(participant, behavior);
            debug!("Reputation of {} after {:?}: {:.4}", participant, behavior, rep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::harness::{deliver, instances};
    
    #[test]
    fn test_quorum_is_strict() {
        assert!(has_weighted_quorum(3.0, 4.0));
        assert!(!has_weighted_quorum(2.0, 3.0));
        assert!(!has_weighted_quorum(3.5, 6.5));
        assert!(!has_weighted_quorum(0.0, 0.0));
    }
    
    #[test]
    fn test_reputation_stays_bounded() {
        let tracker = ReputationTracker::new();
        let good = ChainId::from("good");
        let bad = ChainId::from("bad");
        for _ in 0..500 {
            tracker.record(&good, RoundBehavior::Agreed);
            tracker.record(&bad, RoundBehavior::Abstained);
        }
        assert_eq!(tracker.reputation(&good), REPUTATION_MAX);
        assert_eq!(tracker.reputation(&bad), REPUTATION_MIN);
        
        tracker.set_base_weight(good.clone(), 3.0).unwrap();
        assert_eq!(tracker.effective_weight(&good), 6.0);
        assert!(tracker.set_base_weight(good, 0.0).is_err());
    }
    
    #[test]
    fn test_honest_majority_decides() {
        let algo = WeightedByzantine::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let mut initial = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            let value = if i == 3 { b"REJECTED".to_vec() } else { b"VERIFIED".to_vec() };
            initial.extend(algo.start(node, value).unwrap());
        }
        deliver(&algo, &mut nodes, initial, &[]);
        
        for node in &nodes {
            assert_eq!(node.state.decided_value(), Some(&b"VERIFIED"[..]));
        }
    }
    
    #[test]
    fn test_split_weight_does_not_decide() {
        let algo = WeightedByzantine::new();
        for (chain, w) in [("a", 2.0), ("b", 1.5), ("c", 1.0), ("d", 1.0)] {
            algo.reputation().set_base_weight(ChainId::from(chain), w).unwrap();
        }
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let mut initial = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            let value = if i < 2 { b"X".to_vec() } else { b"Y".to_vec() };
            initial.extend(algo.start(node, value).unwrap());
        }
        deliver(&algo, &mut nodes, initial, &[]);
        
        assert!(nodes.iter().all(|n| !n.is_decided()));
    }
    
    #[test]
    fn test_expiry_updates_reputation_once() {
        let algo = WeightedByzantine::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let mut initial = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate().take(3) {
            let value = if i == 2 { b"N".to_vec() } else { b"Y".to_vec() };
            initial.extend(algo.start(node, value).unwrap());
        }
        deliver(&algo, &mut nodes, initial, &["d"]);
        
        algo.expire(&mut nodes[0]);
        algo.expire(&mut nodes[0]);
        
        let rep = |c: &str| algo.reputation().reputation(&ChainId::from(c));
        assert!((rep("a") - 1.05).abs() < 1e-9);
        assert!((rep("b") - 1.05).abs() < 1e-9);
        assert!((rep("c") - 0.98).abs() < 1e-9);
        assert!((rep("d") - 0.95).abs() < 1e-9);
    }
}
