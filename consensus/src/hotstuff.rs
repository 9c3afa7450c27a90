//! HotStuff-style linear agreement with quorum certificates
//!
//! Replicas send their votes to the leader only. The leader turns 2f+1
//! matching PREPARE votes into a prepare QC and broadcasts it as COMMIT;
//! replicas lock on that QC and vote COMMIT. 2f+1 commit votes form the
//! commit QC, which finalizes the decision and becomes the locked QC the
//! algorithm attaches to later proposals.
//!
//! Every vote carries the voter's signature over its vote statement and a
//! QC keeps those signatures, so a replica holding the key registry can
//! check a QC without trusting whoever forwards it. A DECISION is taken
//! from the leader of the QC's view, or once f+1 replicas relay the same
//! decided value.

use crate::algorithm::{ConsensusAlgorithm, ConsensusInstance, InstanceContext, InstanceExt};
use crate::message::{ConsensusMessage, MessageType};
use crate::state::{ConsensusPhase, ConsensusState};
use concordia_core::{AlgorithmKind, ChainId, ConcordiaError, ConcordiaResult, Hash, Signature};
use concordia_crypto::hashing::value_hash;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Proof that a quorum voted identically in one phase of one view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Instance the votes belong to
    pub instance: String,
    pub view: u64,
    /// `Prepare` or `Commit`
    pub phase: MessageType,
    pub vote_count: usize,
    pub value_hash: Hash,
    pub signers: Vec<ChainId>,
    /// Vote signature of each signer, in signer order; empty signatures
    /// when replicas run without keys
    pub signatures: Vec<Signature>,
}

impl QuorumCertificate {
    fn is_valid(&self, ctx: &InstanceContext, phase: MessageType, value_hash: &Hash) -> bool {
        let distinct: HashSet<&ChainId> = self.signers.iter().collect();
        self.instance == ctx.instance_id
            && self.phase == phase
            && &self.value_hash == value_hash
            && self.vote_count >= ctx.quorum()
            && distinct.len() >= ctx.quorum()
            && self.signers.iter().all(|s| ctx.is_participant(s))
            && self.is_authentic(ctx)
    }
    
    fn is_authentic(&self, ctx: &InstanceContext) -> bool {
        let statement = vote_statement(&self.instance, self.view, self.phase, &self.value_hash);
        self.signers.iter().enumerate().all(|(i, signer)| {
            let signature = self.signatures.get(i).copied().unwrap_or(Signature::EMPTY);
            ctx.authentic(signer, &statement, &signature)
        })
    }
}

/// Bytes a replica signs when voting for `value_hash` in one phase of a view
fn vote_statement(instance: &str, view: u64, phase: MessageType, value_hash: &Hash) -> Vec<u8> {
    let mut statement = Vec::new();
    statement.extend_from_slice(b"CONCORDIA_QC_VOTE:");
    statement.extend_from_slice(&(instance.len() as u32).to_le_bytes());
    statement.extend_from_slice(instance.as_bytes());
    statement.extend_from_slice(&view.to_le_bytes());
    statement.push(phase.tag());
    statement.extend_from_slice(value_hash.as_bytes());
    statement
}

/// A prepare QC together with the value it certifies
type CertifiedValue = (QuorumCertificate, Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HotStuffPayload {
    /// Leader proposal with the latest QC it knows
    Proposal {
        value: Vec<u8>,
        justify: Option<QuorumCertificate>,
    },
    /// Replica vote, addressed to the leader
    Vote { value_hash: Hash, signature: Signature },
    /// Leader broadcast of a prepare QC (COMMIT) or commit QC (DECISION)
    Certificate { value: Vec<u8>, qc: QuorumCertificate },
    /// Replica moving to a new view, with its highest prepare QC
    NewView { high: Option<CertifiedValue> },
}

/// HotStuff round data of one replica
#[derive(Debug, Clone, Default)]
pub struct HotStuffRound {
    /// Prepare QC this replica voted COMMIT on
    locked: Option<QuorumCertificate>,
    high_qc: Option<CertifiedValue>,
    new_views: HashMap<u64, BTreeMap<ChainId, Option<CertifiedValue>>>,
    requested_view: u64,
    proposed_views: HashSet<u64>,
    /// Vote signatures collected by the leader, per view and phase
    vote_signatures: HashMap<(u64, MessageType, ChainId), Signature>,
    /// Decided value hash relayed by each replica
    decisions: HashMap<ChainId, Hash>,
}

/// HotStuff-style algorithm
#[derive(Debug, Default)]
pub struct HotStuffConsensus {
    locked_qc: RwLock<Option<QuorumCertificate>>,
}

impl HotStuffConsensus {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Latest commit QC, attached to proposals of later instances
    pub fn locked_qc(&self) -> Option<QuorumCertificate> {
        self.locked_qc.read().clone()
    }
    
    fn acceptable(ctx: &InstanceContext, value: &[u8]) -> bool {
        ctx.input.as_deref().map_or(true, |input| input == value)
    }
    
    /// Safe-node rule: the proposal extends the lock, or its justify QC
    /// is newer than the lock
    fn safe_node(ctx: &InstanceContext, round: &HotStuffRound, value_hash: &Hash, justify: Option<&QuorumCertificate>) -> bool {
        let Some(lock) = &round.locked else {
            return true;
        };
        if &lock.value_hash == value_hash {
            return true;
        }
        justify.map_or(false, |qc| {
            qc.view > lock.view && qc.is_valid(ctx, MessageType::Prepare, value_hash)
        })
    }
    
    fn observe_qc(round: &mut HotStuffRound, qc: &QuorumCertificate, value: &[u8]) {
        let newer = round.high_qc.as_ref().map_or(true, |(high, _)| qc.view > high.view);
        if newer {
            round.high_qc = Some((qc.clone(), value.to_vec()));
        }
    }
    
    fn propose(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        value: Vec<u8>,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let justify = round
            .high_qc
            .as_ref()
            .map(|(qc, _)| qc.clone())
            .or_else(|| self.locked_qc());
        round.proposed_views.insert(state.view);
        let h = state.prepare(value.clone());
        state.record_prepare(ctx.local_id.clone(), h);
        Self::sign_own_vote(ctx, state, round, MessageType::Prepare, h);
        info!("Leader {} proposes in view {} of {}", ctx.local_id, state.view, ctx.instance_id);
        
        let mut out = vec![ctx.message(
            MessageType::Propose,
            state.view,
            state.sequence,
            &HotStuffPayload::Proposal { value, justify },
        )?];
        out.extend(self.check_prepare_qc(ctx, state, round)?);
        Ok(out)
    }
    
    fn check_prepare_qc(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if !ctx.is_leader(state.view) || state.phase != ConsensusPhase::Prepare {
            return Ok(Vec::new());
        }
        let Some(value) = state.prepared_value.clone() else {
            return Ok(Vec::new());
        };
        let h = value_hash(&value);
        let signers = state.prepare_signers(&h);
        if signers.len() < ctx.quorum() {
            return Ok(Vec::new());
        }
        
        let qc = QuorumCertificate {
            instance: ctx.instance_id.clone(),
            view: state.view,
            phase: MessageType::Prepare,
            vote_count: signers.len(),
            value_hash: h,
            signatures: Self::collected_signatures(round, state.view, MessageType::Prepare, &signers),
            signers,
        };
        info!(
            "Leader {} formed prepare QC with {} votes in view {}",
            ctx.local_id, qc.vote_count, state.view
        );
        state.enter_phase(ConsensusPhase::Commit);
        state.record_commit(ctx.local_id.clone(), h);
        Self::sign_own_vote(ctx, state, round, MessageType::Commit, h);
        round.locked = Some(qc.clone());
        Self::observe_qc(round, &qc, &value);
        
        let mut out = vec![ctx.message(
            MessageType::Commit,
            state.view,
            state.sequence,
            &HotStuffPayload::Certificate { value, qc },
        )?];
        out.extend(self.check_commit_qc(ctx, state, round)?);
        Ok(out)
    }
    
    fn check_commit_qc(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if !ctx.is_leader(state.view) || state.phase != ConsensusPhase::Commit {
            return Ok(Vec::new());
        }
        let Some(value) = state.prepared_value.clone() else {
            return Ok(Vec::new());
        };
        let h = value_hash(&value);
        let signers = state.commit_signers(&h);
        if signers.len() < ctx.quorum() || !state.decide(value.clone()) {
            return Ok(Vec::new());
        }
        
        let qc = QuorumCertificate {
            instance: ctx.instance_id.clone(),
            view: state.view,
            phase: MessageType::Commit,
            vote_count: signers.len(),
            value_hash: h,
            signatures: Self::collected_signatures(round, state.view, MessageType::Commit, &signers),
            signers,
        };
        round.decisions.insert(ctx.local_id.clone(), h);
        *self.locked_qc.write() = Some(qc.clone());
        info!("Instance {} decided by leader {} in view {}", ctx.instance_id, ctx.local_id, state.view);
        
        Ok(vec![ctx.message(
            MessageType::Decision,
            state.view,
            state.sequence,
            &HotStuffPayload::Certificate { value, qc },
        )?])
    }
    
    fn vote(ctx: &InstanceContext, state: &ConsensusState, phase: MessageType, value_hash: Hash) -> ConcordiaResult<ConsensusMessage> {
        let signature = ctx.sign(&vote_statement(&ctx.instance_id, state.view, phase, &value_hash));
        ctx.message(phase, state.view, state.sequence, &HotStuffPayload::Vote { value_hash, signature })
    }
    
    /// The leader's own vote goes into its QCs like any other
    fn sign_own_vote(ctx: &InstanceContext, state: &ConsensusState, round: &mut HotStuffRound, phase: MessageType, value_hash: Hash) {
        let signature = ctx.sign(&vote_statement(&ctx.instance_id, state.view, phase, &value_hash));
        round
            .vote_signatures
            .insert((state.view, phase, ctx.local_id.clone()), signature);
    }
    
    fn collected_signatures(round: &HotStuffRound, view: u64, phase: MessageType, signers: &[ChainId]) -> Vec<Signature> {
        signers
            .iter()
            .map(|s| {
                round
                    .vote_signatures
                    .get(&(view, phase, s.clone()))
                    .copied()
                    .unwrap_or(Signature::EMPTY)
            })
            .collect()
    }
    
    /// Leader side: collect a PREPARE or COMMIT vote
    fn on_vote(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        message: &ConsensusMessage,
        value_hash: Hash,
        signature: Signature,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let (sender, phase) = (&message.sender, message.msg_type);
        if !ctx.is_leader(state.view) {
            return Ok(Vec::new());
        }
        let statement = vote_statement(&ctx.instance_id, state.view, phase, &value_hash);
        if !ctx.authentic(sender, &statement, &signature) {
            warn!("Leader {} drops {} vote from {} with bad signature", ctx.local_id, phase, sender);
            return Ok(Vec::new());
        }
        let fresh = match phase {
            MessageType::Prepare => state.record_prepare(sender.clone(), value_hash),
            _ => state.record_commit(sender.clone(), value_hash),
        };
        if !fresh {
            return Ok(Vec::new());
        }
        round
            .vote_signatures
            .insert((state.view, phase, sender.clone()), signature);
        match phase {
            MessageType::Prepare => self.check_prepare_qc(ctx, state, round),
            _ => self.check_commit_qc(ctx, state, round),
        }
    }
    
    fn on_proposal(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        sender: &ChainId,
        value: Vec<u8>,
        justify: Option<QuorumCertificate>,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if sender != ctx.leader_for(state.view) {
            debug!("Ignoring proposal from non-leader {} in view {}", sender, state.view);
            return Ok(Vec::new());
        }
        if state.prepared_value.is_some() {
            return Ok(Vec::new());
        }
        if !Self::acceptable(ctx, &value) {
            warn!(
                "Replica {} rejects proposal in {}: value differs from local input",
                ctx.local_id, ctx.instance_id
            );
            return Ok(Vec::new());
        }
        
        let h = value_hash(&value);
        // A justify QC from an earlier instance carries no weight here
        let justify = justify.filter(|qc| qc.instance == ctx.instance_id);
        if !Self::safe_node(ctx, round, &h, justify.as_ref()) {
            warn!("Replica {} rejects unsafe proposal from {} in view {}", ctx.local_id, sender, state.view);
            return Ok(Vec::new());
        }
        if let Some(qc) = justify.as_ref() {
            if qc.is_valid(ctx, MessageType::Prepare, &h) {
                Self::observe_qc(round, qc, &value);
            }
        }
        
        state.prepare(value);
        Ok(vec![Self::vote(ctx, state, MessageType::Prepare, h)?])
    }
    
    fn on_prepare_certificate(
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        sender: &ChainId,
        value: Vec<u8>,
        qc: QuorumCertificate,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let h = value_hash(&value);
        if sender != ctx.leader_for(state.view) || qc.view != state.view || !qc.is_valid(ctx, MessageType::Prepare, &h) {
            warn!("Replica {} drops invalid prepare QC from {}", ctx.local_id, sender);
            return Ok(Vec::new());
        }
        if state.phase >= ConsensusPhase::Commit || !Self::acceptable(ctx, &value) {
            return Ok(Vec::new());
        }
        if state.prepared_value.as_deref() != Some(value.as_slice()) {
            if state.prepared_value.is_some() {
                return Ok(Vec::new());
            }
            state.prepare(value.clone());
        }
        
        debug!("Replica {} locked on prepare QC of view {}", ctx.local_id, qc.view);
        round.locked = Some(qc.clone());
        Self::observe_qc(round, &qc, &value);
        state.enter_phase(ConsensusPhase::Commit);
        Ok(vec![Self::vote(ctx, state, MessageType::Commit, h)?])
    }
    
    fn on_decision(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        sender: &ChainId,
        value: Vec<u8>,
        qc: QuorumCertificate,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let h = value_hash(&value);
        if !qc.is_valid(ctx, MessageType::Commit, &h) {
            warn!("Replica {} drops decision from {} with invalid commit QC", ctx.local_id, sender);
            return Ok(Vec::new());
        }
        round.decisions.insert(sender.clone(), h);
        if state.is_decided() {
            return Ok(Vec::new());
        }
        
        let from_leader = sender == ctx.leader_for(qc.view) && Self::acceptable(ctx, &value);
        let relayed = round.decisions.values().filter(|d| **d == h).count();
        if !from_leader && relayed <= ctx.max_faulty() {
            debug!(
                "Replica {} holds decision from {}: {} of {} relays",
                ctx.local_id,
                sender,
                relayed,
                ctx.max_faulty() + 1
            );
            return Ok(Vec::new());
        }
        
        state.learn_value(&value);
        if !state.decide(value.clone()) {
            return Ok(Vec::new());
        }
        round.decisions.insert(ctx.local_id.clone(), h);
        info!("Instance {} decided on {} from commit QC of view {}", ctx.instance_id, ctx.local_id, qc.view);
        *self.locked_qc.write() = Some(qc.clone());
        Ok(vec![ctx.message(
            MessageType::Decision,
            state.view,
            state.sequence,
            &HotStuffPayload::Certificate { value, qc },
        )?])
    }
    
    fn request_view(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        target: u64,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        round.requested_view = target;
        state.advance_view(target);
        let high = round.high_qc.clone();
        round
            .new_views
            .entry(target)
            .or_default()
            .insert(ctx.local_id.clone(), high.clone());
        info!("Replica {} moves to view {} of {}", ctx.local_id, target, ctx.instance_id);
        
        let mut out = vec![ctx.message(
            MessageType::NewView,
            target,
            state.sequence,
            &HotStuffPayload::NewView { high },
        )?];
        out.extend(self.try_propose(ctx, state, round, target)?);
        Ok(out)
    }
    
    fn on_new_view(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        sender: &ChainId,
        target: u64,
        high: Option<CertifiedValue>,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if target < state.view {
            debug!("Dropping stale new view {} from {}", target, sender);
            return Ok(Vec::new());
        }
        let high = high.filter(|(qc, value)| qc.is_valid(ctx, MessageType::Prepare, &value_hash(value)));
        let entries = round.new_views.entry(target).or_default();
        entries.entry(sender.clone()).or_insert(high);
        
        if entries.len() > ctx.max_faulty() && round.requested_view < target {
            return self.request_view(ctx, state, round, target);
        }
        self.try_propose(ctx, state, round, target)
    }
    
    fn try_propose(
        &self,
        ctx: &InstanceContext,
        state: &mut ConsensusState,
        round: &mut HotStuffRound,
        target: u64,
    ) -> ConcordiaResult<Vec<ConsensusMessage>> {
        if !ctx.is_leader(target) || state.view != target || round.proposed_views.contains(&target) {
            return Ok(Vec::new());
        }
        let best = match round.new_views.get(&target) {
            Some(entries) if entries.len() >= ctx.quorum() => entries
                .values()
                .flatten()
                .max_by_key(|(qc, _)| qc.view)
                .cloned(),
            _ => return Ok(Vec::new()),
        };
        if let Some((qc, value)) = &best {
            Self::observe_qc(round, qc, value);
        }
        
        let Some(value) = best.map(|(_, value)| value).or_else(|| ctx.input.clone()) else {
            warn!("Leader {} has no value to propose in view {}", ctx.local_id, target);
            return Ok(Vec::new());
        };
        self.propose(ctx, state, round, value)
    }
}

fn round_of(ext: &mut InstanceExt) -> ConcordiaResult<&mut HotStuffRound> {
    match ext {
        InstanceExt::HotStuff(round) => Ok(round),
        _ => Err(ConcordiaError::Internal("instance is not driven by hotstuff".into())),
    }
}

impl ConsensusAlgorithm for HotStuffConsensus {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::HotStuff
    }
    
    fn new_round(&self, _ctx: &InstanceContext) -> InstanceExt {
        InstanceExt::HotStuff(HotStuffRound::default())
    }
    
    fn start(&self, instance: &mut ConsensusInstance, value: Vec<u8>) -> ConcordiaResult<Vec<ConsensusMessage>> {
        instance.ctx.input = Some(value.clone());
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        state.learn_value(&value);
        
        if !ctx.is_leader(state.view) {
            return Ok(Vec::new());
        }
        self.propose(ctx, state, round, value)
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
        let payload: HotStuffPayload = message.decode_content()?;
        
        if let (MessageType::Decision, HotStuffPayload::Certificate { value, qc }) = (message.msg_type, &payload) {
            return self.on_decision(ctx, state, round, &message.sender, value.clone(), qc.clone());
        }
        if state.is_decided() {
            return Ok(Vec::new());
        }
        if let (MessageType::NewView, HotStuffPayload::NewView { high }) = (message.msg_type, &payload) {
            return self.on_new_view(ctx, state, round, &message.sender, message.view, high.clone());
        }
        if message.view != state.view {
            debug!(
                "Dropping {} from {} for view {} (current {})",
                message.msg_type, message.sender, message.view, state.view
            );
            return Ok(Vec::new());
        }
        
        match (message.msg_type, payload) {
            (MessageType::Propose, HotStuffPayload::Proposal { value, justify }) => {
                Self::on_proposal(ctx, state, round, &message.sender, value, justify)
            }
            (MessageType::Commit, HotStuffPayload::Certificate { value, qc }) => {
                Self::on_prepare_certificate(ctx, state, round, &message.sender, value, qc)
            }
            (MessageType::Prepare | MessageType::Commit, HotStuffPayload::Vote { value_hash, signature }) => {
                self.on_vote(ctx, state, round, message, value_hash, signature)
            }
            (msg_type, _) => Err(ConcordiaError::Validation(format!(
                "malformed {} payload from {}",
                msg_type, message.sender
            ))),
        }
    }
    
    fn view_change(&self, instance: &mut ConsensusInstance) -> ConcordiaResult<Vec<ConsensusMessage>> {
        let ConsensusInstance { ctx, state, ext, .. } = instance;
        let round = round_of(ext)?;
        if state.is_decided() {
            return Ok(Vec::new());
        }
        let target = state.view.max(round.requested_view) + 1;
        self.request_view(ctx, state, round, target)
    }
}
