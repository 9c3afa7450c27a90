//! Per-instance replica state

use concordia_core::{ChainId, Hash};
use concordia_crypto::hashing::value_hash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Replica phase within one view
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsensusPhase {
    /// Waiting for a proposal
    Idle,
    Prepare,
    Commit,
    Decided,
}

/// Replica state of one consensus instance.
///
/// Mutated only by the owning replica; terminal once decided.
#[derive(Debug, Clone)]
pub struct ConsensusState {
    pub view: u64,
    pub sequence: u64,
    pub phase: ConsensusPhase,
    pub prepared_value: Option<Vec<u8>>,
    /// Prepare votes by sender (the prepared-proof set)
    pub prepare_votes: HashMap<ChainId, Hash>,
    /// Commit votes by sender (the commit-proof set)
    pub commit_votes: HashMap<ChainId, Hash>,
    known_values: HashMap<Hash, Vec<u8>>,
    decided: bool,
    decided_value: Option<Vec<u8>>,
}

impl ConsensusState {
    pub fn new(sequence: u64) -> Self {
        Self {
            view: 0,
            sequence,
            phase: ConsensusPhase::Idle,
            prepared_value: None,
            prepare_votes: HashMap::new(),
            commit_votes: HashMap::new(),
            known_values: HashMap::new(),
            decided: false,
            decided_value: None,
        }
    }
    
    pub fn is_decided(&self) -> bool {
        self.decided
    }
    
    pub fn decided_value(&self) -> Option<&[u8]> {
        self.decided_value.as_deref()
    }
    
    /// Record the decision. Returns false if already decided; the decided
    /// value never changes afterwards.
    pub fn decide(&mut self, value: Vec<u8>) -> bool {
        if self.decided {
            return false;
        }
        self.decided = true;
        self.decided_value = Some(value);
        self.phase = ConsensusPhase::Decided;
        true
    }
    
    /// Remember a value so later votes on its hash can be resolved
    pub fn learn_value(&mut self, value: &[u8]) -> Hash {
        let h = value_hash(value);
        self.known_values.entry(h).or_insert_with(|| value.to_vec());
        h
    }
    
    pub fn value_for(&self, h: &Hash) -> Option<&Vec<u8>> {
        self.known_values.get(h)
    }
    
    pub fn prepared_hash(&self) -> Option<Hash> {
        self.prepared_value.as_deref().map(value_hash)
    }
    
    /// Set the value this replica prepared in the current view
    pub fn prepare(&mut self, value: Vec<u8>) -> Hash {
        let h = self.learn_value(&value);
        self.prepared_value = Some(value);
        self.enter_phase(ConsensusPhase::Prepare);
        h
    }
    
    /// Move forward to `phase`; never moves backwards within a view
    pub fn enter_phase(&mut self, phase: ConsensusPhase) {
        if phase > self.phase && !self.decided {
            self.phase = phase;
        }
    }
    
    /// Returns false for a duplicate vote from the same sender
    pub fn record_prepare(&mut self, sender: ChainId, h: Hash) -> bool {
        if self.prepare_votes.contains_key(&sender) {
            return false;
        }
        self.prepare_votes.insert(sender, h);
        true
    }
    
    /// Returns false for a duplicate vote from the same sender
    pub fn record_commit(&mut self, sender: ChainId, h: Hash) -> bool {
        if self.commit_votes.contains_key(&sender) {
            return false;
        }
        self.commit_votes.insert(sender, h);
        true
    }
    
    pub fn count_prepares(&self, h: &Hash) -> usize {
        self.prepare_votes.values().filter(|v| *v == h).count()
    }
    
    pub fn count_commits(&self, h: &Hash) -> usize {
        self.commit_votes.values().filter(|v| *v == h).count()
    }
    
    /// Voters whose prepare vote matches `h`, sorted
    pub fn prepare_signers(&self, h: &Hash) -> Vec<ChainId> {
        signers(&self.prepare_votes, h)
    }
    
    /// Voters whose commit vote matches `h`, sorted
    pub fn commit_signers(&self, h: &Hash) -> Vec<ChainId> {
        signers(&self.commit_votes, h)
    }
    
    /// Move to a later view, clearing the per-view vote sets
    pub fn advance_view(&mut self, view: u64) {
        if self.decided || view <= self.view {
            return;
        }
        self.view = view;
        self.phase = ConsensusPhase::Idle;
        self.prepared_value = None;
        self.prepare_votes.clear();
        self.commit_votes.clear();
    }
}

fn signers(votes: &HashMap<ChainId, Hash>, h: &Hash) -> Vec<ChainId> {
    let mut out: Vec<ChainId> = votes
        .iter()
        .filter(|(_, v)| *v == h)
        .map(|(k, _)| k.clone())
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_decision_is_terminal() {
        let mut state = ConsensusState::new(1);
        assert!(state.decide(b"A".to_vec()));
        assert!(!state.decide(b"B".to_vec()));
        assert_eq!(state.decided_value(), Some(&b"A"[..]));
        
        state.advance_view(5);
        assert_eq!(state.view, 0);
        assert_eq!(state.phase, ConsensusPhase::Decided);
    }
    
    #[test]
    fn test_vote_deduplication() {
        let mut state = ConsensusState::new(1);
        let h = state.learn_value(b"value");
        let voter = ChainId::from("a");
        
        assert!(state.record_prepare(voter.clone(), h));
        assert!(!state.record_prepare(voter, h));
        assert_eq!(state.count_prepares(&h), 1);
    }
    
    #[test]
    fn test_phase_only_moves_forward() {
        let mut state = ConsensusState::new(1);
        state.enter_phase(ConsensusPhase::Commit);
        state.enter_phase(ConsensusPhase::Prepare);
        assert_eq!(state.phase, ConsensusPhase::Commit);
        
        state.advance_view(1);
        assert_eq!(state.phase, ConsensusPhase::Idle);
        assert!(state.commit_votes.is_empty());
    }
}
