//! PBFT-style agreement: PREPARE → COMMIT → DECIDE
//!
//! The leader of view `v` proposes; replicas prepare the proposal, commit
//! once 2f+1 matching prepares are seen and decide once 2f+1 matching
//! commits are seen. Leader failure is handled by VIEW_CHANGE/NEW_VIEW and
//! lagging replicas catch up from f+1 matching DECISION messages.

use crate::algorithm::{ConsensusAlgorithm, ConsensusInstance, InstanceContext, InstanceExt};
use crate::message::{ConsensusMessage, MessageType};
use crate::state::{ConsensusPhase, ConsensusState};
use concordia_core::{AlgorithmKind, ChainId, ConcordiaError, ConcordiaResult, Hash};
use concordia_crypto::hashing::value_hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Value carried by PROPOSE, PREPARE, COMMIT and DECISION
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ValuePayload {
    pub value: Vec<u8>,
}

/// A value that reached a prepare quorum, with its view
type PreparedCert = (u64, Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ViewChangePayload {
    prepared: Option<PreparedCert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NewViewPayload {
    value: Vec<u8>,
    /// The VIEW_CHANGE messages that justify the new view
    proofs: Vec<ConsensusMessage>,
}

/// PBFT round data of one replica
#[derive(Debug, Clone, Default)]
pub struct PbftRound {
    prepared_cert: Option<PreparedCert>,
    view_changes: HashMap<u64, BTreeMap<ChainId, (Option<PreparedCert>, ConsensusMessage)>>,
    requested_view: u64,
    new_view_sent: HashSet<u64>,
    decisions: HashMap<ChainId, Hash>,
}

/// PBFT-style algorithm
#[derive(Debug, Default)]
pub struct PbftConsensus;

impl PbftConsensus {
    pub fn new() -> Self {
        Self
    }
    
    /// A replica with its own input only supports proposals equal to it
    fn acceptable(ctx: &InstanceContext, value: &[u8]) -> bool {
        ctx.input.as_deref().map_or(true, |input| input == value)
    }
    
    fn enter_prepare(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        leader: ChainId,
        value: Vec<u8>,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let h = state.prepare(value.clone());
        // The proposal counts as the leader's prepare
        state.record_prepare(leader.clone(), h);
        
        let mut out = Vec::new();
        if leader != ctx.local_id {
            state.record_prepare(ctx.local_id.clone(), h);
            out.push(ctx.message(MessageType::Prepare, state.view, state.sequence, &ValuePayload { value })?);
        }
        out.extend(Self::check_prepared(ctx, state, round)?);
        Ok(out)
    }
    
    fn check_prepared(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if state.phase != ConsensusPhase::Prepare {
            return Ok(Vec::new());
        }
        let Some(value) = state.prepared_value.clone() else {
            return Ok(Vec::new());
        };
        let h = value_hash(&value);
        let votes = state.count_prepares(&h);
        if votes < ctx.quorum() {
            return Ok(Vec::new());
        }
        
        state.enter_phase(ConsensusPhase::Commit);
        round.prepared_cert = Some((state.view, value.clone()));
        state.record_commit(ctx.local_id.clone(), h);
        info!(
            "Instance {} prepared at view {} with {} votes on {}",
            ctx.instance_id, state.view, votes, ctx.local_id
        );
        
        let mut out = vec![ctx.message(MessageType::Commit, state.view, state.sequence, &ValuePayload { value })?];
        out.extend(Self::check_committed(ctx, state, round)?);
        Ok(out)
    }
    
    fn check_committed(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if state.phase != ConsensusPhase::Commit {
            return Ok(Vec::new());
        }
        let Some(value) = state.prepared_value.clone() else {
            return Ok(Vec::new());
        };
        let h = value_hash(&value);
        if state.count_commits(&h) < ctx.quorum() || !state.decide(value.clone()) {
            return Ok(Vec::new());
        }
        
        round.decisions.insert(ctx.local_id.clone(), h);
        info!("Instance {} decided at view {} on {}", ctx.instance_id, state.view, ctx.local_id);
        Ok(vec![ctx.message(MessageType::Decision, state.view, state.sequence, &ValuePayload { value })?])
    }
    
    fn on_vote(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let payload: ValuePayload = message.decode_content()?;
        let h = state.learn_value(&payload.value);
        
        if message.msg_type == MessageType::Prepare {
            if !state.record_prepare(message.sender.clone(), h) {
                return Ok(Vec::new());
            }
            Self::check_prepared(ctx, state, round)
        } else {
            if !state.record_commit(message.sender.clone(), h) {
                return Ok(Vec::new());
            }
            Self::check_committed(ctx, state, round)
        }
    }
    
    fn on_propose(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if &message.sender != ctx.leader_for(state.view) {
            debug!(
                "Ignoring proposal from non-leader {} in view {} of {}",
                message.sender, state.view, ctx.instance_id
            );
            return Ok(Vec::new());
        }
        if state.prepared_value.is_some() {
            return Ok(Vec::new());
        }
        
        let payload: ValuePayload = message.decode_content()?;
        if !Self::acceptable(ctx, &payload.value) {
            warn!(
                "Replica {} rejects proposal of {} in {}: value differs from local input",
                ctx.local_id, message.sender, ctx.instance_id
            );
            return Ok(Vec::new());
        }
        Self::enter_prepare(ctx, state, round, message.sender.clone(), payload.value)
    }
    
    fn on_decision(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let payload: ValuePayload = message.decode_content()?;
        let h = state.learn_value(&payload.value);
        round.decisions.entry(message.sender.clone()).or_insert(h);
        if state.is_decided() {
            return Ok(Vec::new());
        }
        
        let matching = round.decisions.values().filter(|d| **d == h).count();
        if matching <= ctx.max_faulty() || !state.decide(payload.value.clone()) {
            return Ok(Vec::new());
        }
        
        round.decisions.insert(ctx.local_id.clone(), h);
        info!(
            "Instance {} decided on {} from {} matching decisions",
            ctx.instance_id, ctx.local_id, matching
        );
        Ok(vec![ctx.message(
            MessageType::Decision,
            state.view,
            state.sequence,
            &ValuePayload { value: payload.value },
        )?])
    }
    
    fn request_view(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        target: u64,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        round.requested_view = target;
        let prepared = round.prepared_cert.clone();
        let msg = ctx.message(
            MessageType::ViewChange,
            target,
            state.sequence,
            &ViewChangePayload { prepared: prepared.clone() },
        )?;
        round
            .view_changes
            .entry(target)
            .or_default()
            .insert(ctx.local_id.clone(), (prepared, msg.clone()));
        info!("Replica {} requests view {} for {}", ctx.local_id, target, ctx.instance_id);
        
        let mut out = vec![msg];
        out.extend(Self::try_new_view(ctx, state, round, target)?);
        Ok(out)
    }
    
    fn on_view_change(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let target = message.view;
        if target <= state.view {
            debug!("Dropping stale view change to {} from {}", target, message.sender);
            return Ok(Vec::new());
        }
        let payload: ViewChangePayload = message.decode_content()?;
        let votes = round.view_changes.entry(target).or_default();
        votes
            .entry(message.sender.clone())
            .or_insert_with(|| (payload.prepared, message.clone()));
        
        // f+1 requests mean at least one correct replica timed out
        if votes.len() > ctx.max_faulty() && round.requested_view < target {
            return Self::request_view(ctx, state, round, target);
        }
        Self::try_new_view(ctx, state, round, target)
    }
    
    /// Value a new view must re-propose: the prepared value of the highest view
    fn carried_value<'a>(certs: impl Iterator<Item = &'a Option<PreparedCert>>) -> Option<Vec<u8>> {
        certs
            .flatten()
            .max_by_key(|cert| cert.0)
            .map(|cert| cert.1.clone())
    }
    
    fn try_new_view(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        target: u64,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if !ctx.is_leader(target) || round.new_view_sent.contains(&target) {
            return Ok(Vec::new());
        }
        let (carried, proofs) = match round.view_changes.get(&target) {
            Some(votes) if votes.len() >= ctx.quorum() => (
                Self::carried_value(votes.values().map(|(cert, _)| cert)),
                votes.values().map(|(_, msg)| msg.clone()).collect::<Vec<_>>(),
            ),
            _ => return Ok(Vec::new()),
        };
        let Some(value) = carried.or_else(|| ctx.input.clone()) else {
            warn!("Leader {} has no value to propose in view {}", ctx.local_id, target);
            return Ok(Vec::new());
        };
        
        round.new_view_sent.insert(target);
        state.advance_view(target);
        info!("Leader {} starts view {} of {}", ctx.local_id, target, ctx.instance_id);
        
        let mut out = vec![ctx.message(
            MessageType::NewView,
            target,
            state.sequence,
            &NewViewPayload { value: value.clone(), proofs },
        )?];
        out.extend(Self::enter_prepare(ctx, state, round, ctx.local_id.clone(), value)?);
        Ok(out)
    }
    
    /// Check that a NEW_VIEW is backed by a quorum of view changes and
    /// re-proposes the value they carry
    fn valid_new_view(ctx: &InstanceContext, state: &ConsensusState, target: u64, payload: &NewViewPayload) -> bool {
        let mut senders = HashSet::new();
        let mut certs = Vec::new();
        for proof in &payload.proofs {
            if proof.msg_type != MessageType::ViewChange
                || proof.view != target
                || proof.sequence != state.sequence
                || !ctx.is_participant(&proof.sender)
                || !senders.insert(proof.sender.clone())
                || !ctx.authentic(&proof.sender, &proof.get_signing_message(), &proof.signature)
            {
                return false;
            }
            match proof.decode_content::<ViewChangePayload>() {
                Ok(vc) => certs.push(vc.prepared),
                Err(_) => return false,
            }
        }
        if senders.len() < ctx.quorum() {
            return false;
        }
        Self::carried_value(certs.iter()).map_or(true, |carried| carried == payload.value)
    }
    
    fn on_new_view(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut PbftRound,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let target = message.view;
        if target <= state.view {
            debug!("Dropping stale new view {} from {}", target, message.sender);
            return Ok(Vec::new());
        }
        if &message.sender != ctx.leader_for(target) {
            debug!("Ignoring new view {} from non-leader {}", target, message.sender);
            return Ok(Vec::new());
        }
        
        let payload: NewViewPayload = message.decode_content()?;
        if !Self::valid_new_view(ctx, state, target, &payload) {
            warn!("Rejecting unjustified new view {} from {}", target, message.sender);
            return Ok(Vec::new());
        }
        
        state.advance_view(target);
        round.requested_view = round.requested_view.max(target);
        info!("Replica {} entered view {} of {}", ctx.local_id, target, ctx.instance_id);
        
        if !Self::acceptable(ctx, &payload.value) {
            warn!(
                "Replica {} rejects new-view proposal in {}: value differs from local input",
                ctx.local_id, ctx.instance_id
            );
            return Ok(Vec::new());
        }
        Self::enter_prepare(ctx, state, round, message.sender.clone(), payload.value)
    }
}

fn round_of(ext: &mut InstanceExt) -> ConcordiaResult<&mut PbftRound> {
    match ext {
        InstanceExt::Pbft(round) => Ok(round),
        _ => Err(ConcordiaError::Internal("instance is not driven by pbft".into())),
    }
}

impl ConsensusAlgorithm for PbftConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Pbft
    }
    
    fn new_round(&self, _ctx: &InstanceContext) -> InstanceExt {
        InstanceExt::Pbft(PbftRound::default())
    }
    
    fn start(&self, instance: &mut ConsensusInstance, value: Vec<u8>) -> ConcordiaResult<Vec<ConsensusMessage>> {
        instance.ctx.input = Some(value.clone());
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        state.learn_value(&value);
        
        if !ctx.is_leader(state.view) {
            debug!("Replica {} waits for proposal in {}", ctx.local_id, ctx.instance_id);
            return Ok(Vec::new());
        }
        
        let mut out = vec![ctx.message(
            MessageType::Propose,
            state.view,
            state.sequence,
            &ValuePayload { value: value.clone() },
        )?];
        out.extend(Self::enter_prepare(ctx, state, round, ctx.local_id.clone(), value)?);
        Ok(out)
    }
    
    fn handle(
        &self,
        instance: &mut ConsensusInstance,
        message: &ConsensusMessage,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        
        if message.sequence != state.sequence {
            debug!("Dropping {} with foreign sequence {}", message.msg_type, message.sequence);
            return Ok(Vec::new());
        }
        if message.msg_type == MessageType::Decision {
            return Self::on_decision(ctx, state, round, message);
        }
        if state.is_decided() {
            return Ok(Vec::new());
        }
        
        match message.msg_type {
            MessageType::ViewChange => Self::on_view_change(ctx, state, round, message),
            MessageType::NewView => Self::on_new_view(ctx, state, round, message),
            _ if message.view != state.view => {
                debug!(
                    "Dropping {} from {} for view {} (current {})",
                    message.msg_type, message.sender, message.view, state.view
                );
                Ok(Vec::new())
            }
            MessageType::Propose => Self::on_propose(ctx, state, round, message),
            _ => Self::on_vote(ctx, state, round, message),
        }
    }
    
    fn view_change(&self, instance: &mut ConsensusInstance) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        if state.is_decided() {
            return Ok(Vec::new());
        }
        let target = state.view.max(round.requested_view) + 1;
        Self::request_view(ctx, state, round, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::harness::{deliver, instances, signed_instances};
    
    fn start_all(algo: &PbftConsensus, nodes: &mut [ConsensusInstance], input: &[u8]) -> Vec<ConsensusMessage> {
        let mut out = Vec::new();
        for node in nodes.iter_mut() {
            out.extend(algo.start(node, input.to_vec()).unwrap());
        }
        out
    }
    
    #[test]
    fn test_honest_replicas_agree() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let initial = start_all(&algo, &mut nodes, b"VERIFIED");
        deliver(&algo, &mut nodes, initial, &[]);
        
        for node in &nodes {
            assert_eq!(node.state.decided_value(), Some(&b"VERIFIED"[..]));
        }
    }
    
    #[test]
    fn test_proposal_from_non_leader_ignored() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let seq = nodes[1].state.sequence;
        let forged = ConsensusMessage::unsigned(
            MessageType::Propose,
            0,
            seq,
            ChainId::from("c"),
            bincode::serialize(&ValuePayload { value: b"X".to_vec() }).unwrap(),
        );
        
        let out = algo.handle(&mut nodes[1], &forged).unwrap();
        assert!(out.is_empty());
        assert!(nodes[1].state.prepared_value.is_none());
    }
    
    #[test]
    fn test_stale_view_dropped() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        nodes[1].state.advance_view(2);
        let seq = nodes[1].state.sequence;
        let old = ConsensusMessage::unsigned(
            MessageType::Prepare,
            1,
            seq,
            ChainId::from("c"),
            bincode::serialize(&ValuePayload { value: b"X".to_vec() }).unwrap(),
        );
        
        assert!(algo.handle(&mut nodes[1], &old).unwrap().is_empty());
        assert!(nodes[1].state.prepare_votes.is_empty());
    }
    
    #[test]
    fn test_view_change_replaces_silent_leader() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        // Leader "a" of view 0 never starts
        let mut initial = Vec::new();
        for node in nodes.iter_mut().skip(1) {
            initial.extend(algo.start(node, b"VERIFIED".to_vec()).unwrap());
        }
        assert!(initial.is_empty());
        
        for node in nodes.iter_mut().skip(1) {
            initial.extend(algo.view_change(node).unwrap());
        }
        deliver(&algo, &mut nodes, initial, &["a"]);
        
        for node in nodes.iter().skip(1) {
            assert_eq!(node.state.view, 1);
            assert_eq!(node.state.decided_value(), Some(&b"VERIFIED"[..]));
        }
    }
    
    #[test]
    fn test_decision_catch_up() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let seq = nodes[3].state.sequence;
        let decision = |sender: &str| {
            ConsensusMessage::unsigned(
                MessageType::Decision,
                0,
                seq,
                ChainId::from(sender),
                bincode::serialize(&ValuePayload { value: b"Y".to_vec() }).unwrap(),
            )
        };
        
        assert!(algo.handle(&mut nodes[3], &decision("a")).unwrap().is_empty());
        assert!(!nodes[3].is_decided());
        let out = algo.handle(&mut nodes[3], &decision("b")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(nodes[3].state.decided_value(), Some(&b"Y"[..]));
    }
    
    #[test]
    fn test_new_view_without_quorum_rejected() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let seq = nodes[2].state.sequence;
        let bogus = ConsensusMessage::unsigned(
            MessageType::NewView,
            1,
            seq,
            ChainId::from("b"),
            bincode::serialize(&NewViewPayload { value: b"Z".to_vec(), proofs: Vec::new() }).unwrap(),
        );
        
        assert!(algo.handle(&mut nodes[2], &bogus).unwrap().is_empty());
        assert_eq!(nodes[2].state.view, 0);
    }
    
    #[test]
    fn test_equivocating_leader_cannot_split_replicas() {
        let algo = PbftConsensus::new();
        let mut nodes = instances(&algo, &["a", "b", "c", "d"]);
        let seq = nodes[0].state.sequence;
        let propose = |value: &[u8]| {
            ConsensusMessage::unsigned(
                MessageType::Propose,
                0,
                seq,
                ChainId::from("a"),
                bincode::serialize(&ValuePayload { value: value.to_vec() }).unwrap(),
            )
        };
        
        // Leader "a" sends X to b and Y to c and d
        let mut pending = algo.handle(&mut nodes[1], &propose(b"X")).unwrap();
        pending.extend(algo.handle(&mut nodes[2], &propose(b"Y")).unwrap());
        pending.extend(algo.handle(&mut nodes[3], &propose(b"Y")).unwrap());
        deliver(&algo, &mut nodes, pending, &["a"]);
        assert!(nodes.iter().skip(1).all(|n| !n.is_decided()));
        
        let mut changes = Vec::new();
        for node in nodes.iter_mut().skip(1) {
            changes.extend(algo.view_change(node).unwrap());
        }
        deliver(&algo, &mut nodes, changes, &["a"]);
        
        // The new leader must re-propose the value c and d prepared
        for node in nodes.iter().skip(1) {
            assert_eq!(node.state.decided_value(), Some(&b"Y"[..]));
        }
    }
    
    #[test]
    fn test_new_view_proofs_must_be_signed() {
        let algo = PbftConsensus::new();
        let (mut nodes, _) = signed_instances(&algo, &["a", "b", "c", "d"]);
        let seq = nodes[0].state.sequence;
        let mut proofs = Vec::new();
        for node in nodes.iter_mut().skip(1) {
            let out = algo.view_change(node).unwrap();
            proofs.extend(out.into_iter().filter(|m| m.msg_type == MessageType::ViewChange));
        }
        assert_eq!(proofs.len(), 3);
        let new_view = |proofs: Vec<ConsensusMessage>| {
            ConsensusMessage::unsigned(
                MessageType::NewView,
                1,
                seq,
                ChainId::from("b"),
                bincode::serialize(&NewViewPayload { value: b"Z".to_vec(), proofs }).unwrap(),
            )
        };
        
        // "b" cannot stand in for "d"
        let mut forged = proofs.clone();
        forged[2].signature = forged[0].signature;
        algo.handle(&mut nodes[0], &new_view(forged)).unwrap();
        assert_eq!(nodes[0].state.view, 0);
        
        algo.handle(&mut nodes[0], &new_view(proofs)).unwrap();
        assert_eq!(nodes[0].state.view, 1);
    }
}
