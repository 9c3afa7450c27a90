//! Bridge-level votes

use concordia_core::{ChainId, ConcordiaError, ConcordiaResult, Timestamp, VoteData};
use serde::{Deserialize, Serialize};

/// One participant's vote in a bridge process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub voter: ChainId,
    pub value: String,
    /// Voter's confidence in `value`, in [0, 1]
    pub confidence: f64,
    /// Multiplier on the voter's chain weight, in [0, 1]
    pub weight: f64,
    pub timestamp: Timestamp,
}

impl ConsensusVote {
    pub fn new(voter: ChainId, value: impl Into<String>, confidence: f64, weight: f64) -> Self {
        Self {
            voter,
            value: value.into(),
            confidence,
            weight,
            timestamp: Timestamp::now(),
        }
    }
    
    /// Reject malformed votes before they touch any process
    pub fn validate(&self) -> ConcordiaResult<()> {
        if self.value.is_empty() {
            return Err(ConcordiaError::Validation(format!("empty vote value from {}", self.voter)));
        }
        if !unit_interval(self.confidence) {
            return Err(ConcordiaError::Validation(format!(
                "confidence {} from {} outside [0, 1]",
                self.confidence, self.voter
            )));
        }
        if !unit_interval(self.weight) {
            return Err(ConcordiaError::Validation(format!(
                "weight {} from {} outside [0, 1]",
                self.weight, self.voter
            )));
        }
        Ok(())
    }
}

fn unit_interval(x: f64) -> bool {
    x.is_finite() && (0.0..=1.0).contains(&x)
}

impl From<VoteData> for ConsensusVote {
    fn from(data: VoteData) -> Self {
        Self {
            voter: data.chain,
            value: data.value,
            confidence: data.confidence,
            weight: data.weight,
            timestamp: data.timestamp,
        }
    }
}

impl From<&ConsensusVote> for VoteData {
    fn from(vote: &ConsensusVote) -> Self {
        Self {
            chain: vote.voter.clone(),
            value: vote.value.clone(),
            confidence: vote.confidence,
            weight: vote.weight,
            timestamp: vote.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_vote_validation() {
        let voter = ChainId::from("ethereum");
        assert!(ConsensusVote::new(voter.clone(), "VERIFIED", 0.9, 1.0).validate().is_ok());
        assert!(ConsensusVote::new(voter.clone(), "VERIFIED", 1.2, 1.0).validate().is_err());
        assert!(ConsensusVote::new(voter.clone(), "VERIFIED", 0.5, -0.1).validate().is_err());
        assert!(ConsensusVote::new(voter.clone(), "VERIFIED", f64::NAN, 1.0).validate().is_err());
        assert!(ConsensusVote::new(voter, "", 0.5, 0.5).validate().is_err());
    }
}
