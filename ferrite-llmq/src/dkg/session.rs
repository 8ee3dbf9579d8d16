//! A single DKG session: contribute, complain, justify, commit.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use threshold_crypto::poly::Commitment;
use threshold_crypto::{Ciphertext, Fr, SignatureShare};

use ferrite_crypto::batch_verifier::aggregate_signatures;
use ferrite_crypto::bls::{
    aggregate_secret_shares, aggregate_verification_vectors, decrypt_share, encrypt_share,
    fr_to_bytes, public_key_share, quorum_public_key, recover_signature, secret_key_share_from_fr,
    verification_vectors_hash, verify_contribution_share, SecretContribution,
};
use ferrite_shared_types::masternode::MasternodeEntry;
use ferrite_shared_types::messages::{
    DkgComplaint, DkgContribution, DkgJustification, DkgPrematureCommitment, FinalCommitment,
};
use ferrite_shared_types::params::LlmqParams;
use ferrite_shared_types::Hash;

use crate::chain::{BlockInfo, LocalIdentity};
use crate::error::{MessageOutcome, MISBEHAVE_SUSPECT, MISBEHAVE_VIOLATION};

/// Per-member session state. The session owns its members for its
/// whole lifetime.
pub struct DkgMember {
    pub entry: MasternodeEntry,
    pub idx: usize,
    pub contributions: BTreeSet<Hash>,
    pub complaints: BTreeSet<Hash>,
    pub justifications: BTreeSet<Hash>,
    pub premature_commitments: BTreeSet<Hash>,
    pub bad: bool,
    pub we_complain: bool,
    pub someone_complain: bool,
}

impl DkgMember {
    fn new(entry: MasternodeEntry, idx: usize) -> Self {
        DkgMember {
            entry,
            idx,
            contributions: BTreeSet::new(),
            complaints: BTreeSet::new(),
            justifications: BTreeSet::new(),
            premature_commitments: BTreeSet::new(),
            bad: false,
            we_complain: false,
            someone_complain: false,
        }
    }
}

/// A deferred pairing check of one received secret share.
pub struct ShareCheck {
    pub contributor: usize,
    pub recipient: usize,
    pub vvec: Commitment,
    pub share: Fr,
}

pub struct DkgSession {
    params: LlmqParams,
    quorum_hash: Hash,
    height: u64,
    quorum_index: i16,
    members: Vec<DkgMember>,
    members_by_protx: BTreeMap<Hash, usize>,
    my_idx: Option<usize>,
    identity: Option<LocalIdentity>,

    my_contribution: Option<SecretContribution>,
    received_vvecs: Vec<Option<Commitment>>,
    received_shares: Vec<Option<Fr>>,
    share_ok: Vec<Option<bool>>,
    pending_share_checks: Vec<usize>,

    complaints_against_me: BTreeSet<usize>,
    /// `(accused, complainant)` pairs not yet settled by a valid
    /// justification.
    unresolved_complaints: BTreeSet<(usize, usize)>,

    // all received messages keyed by message hash; conflicting
    // non-first messages are kept so they can still be relayed,
    // otherwise an attacker could split the quorum by sending
    // valid+invalid pairs to different halves
    contributions: BTreeMap<Hash, DkgContribution>,
    complaints: BTreeMap<Hash, DkgComplaint>,
    justifications: BTreeMap<Hash, DkgJustification>,
    premature_commitments: BTreeMap<Hash, DkgPrematureCommitment>,
    commitment_sender: BTreeMap<Hash, usize>,
    seen_messages: BTreeSet<Hash>,

    quorum_vvec: Option<Commitment>,
    own_quorum_share: Option<Fr>,
    failed: bool,
}

impl DkgSession {
    pub fn new(
        params: LlmqParams,
        anchor: &BlockInfo,
        quorum_index: i16,
        members: Vec<MasternodeEntry>,
        identity: Option<LocalIdentity>,
    ) -> Self {
        let n = members.len();
        let members_by_protx: BTreeMap<Hash, usize> = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.pro_tx_hash, i))
            .collect();
        let my_idx = identity
            .as_ref()
            .and_then(|id| members_by_protx.get(&id.pro_tx_hash).copied());
        DkgSession {
            params,
            quorum_hash: anchor.hash,
            height: anchor.height,
            quorum_index,
            members: members
                .into_iter()
                .enumerate()
                .map(|(i, m)| DkgMember::new(m, i))
                .collect(),
            members_by_protx,
            my_idx,
            identity,
            my_contribution: None,
            received_vvecs: (0..n).map(|_| None).collect(),
            received_shares: (0..n).map(|_| None).collect(),
            share_ok: vec![None; n],
            pending_share_checks: Vec::new(),
            complaints_against_me: BTreeSet::new(),
            unresolved_complaints: BTreeSet::new(),
            contributions: BTreeMap::new(),
            complaints: BTreeMap::new(),
            justifications: BTreeMap::new(),
            premature_commitments: BTreeMap::new(),
            commitment_sender: BTreeMap::new(),
            seen_messages: BTreeSet::new(),
            quorum_vvec: None,
            own_quorum_share: None,
            failed: false,
        }
    }

    pub fn params(&self) -> &LlmqParams {
        &self.params
    }

    pub fn quorum_hash(&self) -> &Hash {
        &self.quorum_hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn are_we_member(&self) -> bool {
        self.my_idx.is_some()
    }

    pub fn my_index(&self) -> Option<usize> {
        self.my_idx
    }

    pub fn identity(&self) -> Option<&LocalIdentity> {
        self.identity.as_ref()
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn member(&self, idx: usize) -> &DkgMember {
        &self.members[idx]
    }

    pub fn members(&self) -> &[DkgMember] {
        &self.members
    }

    /// The aggregated verification vector, available after commit.
    pub fn quorum_vvec(&self) -> Option<&Commitment> {
        self.quorum_vvec.as_ref()
    }

    /// Our share of the quorum secret, available after commit.
    pub fn own_share_bytes(&self) -> Option<[u8; 32]> {
        self.own_quorum_share.as_ref().map(fr_to_bytes)
    }

    /// The share a contributor sent us, once decrypted.
    pub fn decrypted_share_from(&self, contributor: usize) -> Option<[u8; 32]> {
        self.received_shares[contributor].as_ref().map(fr_to_bytes)
    }

    fn mark_bad(&mut self, idx: usize) {
        if !self.members[idx].bad {
            warn!(
                "marking member {} ({}) bad in quorum {}",
                idx,
                hex::encode(self.members[idx].entry.pro_tx_hash),
                hex::encode(self.quorum_hash)
            );
            self.members[idx].bad = true;
        }
    }

    fn member_index(&self, pro_tx_hash: &Hash) -> Option<usize> {
        self.members_by_protx.get(pro_tx_hash).copied()
    }

    fn seen(&mut self, msg_hash: Hash) -> bool {
        !self.seen_messages.insert(msg_hash)
    }

    // Phase 1: contribute

    /// Build our contribution: a fresh polynomial, one encrypted
    /// share per member, all signed with the operator key.
    pub fn contribute(&mut self) -> Option<DkgContribution> {
        let identity = self.identity.clone()?;
        self.my_idx?;
        let contribution = SecretContribution::random(self.params.threshold);
        let vvec = contribution.verification_vector();
        let shares: Vec<Ciphertext> = self
            .members
            .iter()
            .map(|m| encrypt_share(&m.entry.operator_pubkey, &contribution.share_for(m.idx)))
            .collect();
        self.my_contribution = Some(contribution);

        let mut msg = DkgContribution {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: identity.pro_tx_hash,
            vvec,
            shares,
            sig: identity.operator_key.sign(b""),
        };
        msg.sig = identity.operator_key.sign(msg.sign_hash());
        info!(
            "contributing to quorum {} as member {}",
            hex::encode(self.quorum_hash),
            self.my_idx.unwrap()
        );
        Some(msg)
    }

    pub fn receive_contribution(&mut self, contribution: DkgContribution) -> MessageOutcome {
        if self.failed {
            return MessageOutcome::Ignored;
        }
        if contribution.llmq_type != self.params.llmq_type
            || contribution.quorum_hash != self.quorum_hash
        {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let idx = match self.member_index(&contribution.pro_tx_hash) {
            Some(idx) => idx,
            None => return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION },
        };
        if contribution.vvec.degree() + 1 != self.params.threshold {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if contribution.shares.len() != self.members.len() {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let sign_hash = contribution.sign_hash();
        if !self.members[idx].entry.operator_pubkey.verify(&contribution.sig, sign_hash) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }

        let msg_hash = contribution.msg_hash();
        if self.seen(msg_hash) {
            return MessageOutcome::Ignored;
        }
        self.members[idx].contributions.insert(msg_hash);
        if self.members[idx].contributions.len() > 1 {
            // only the first contribution counts, but conflicting
            // ones are still relayed
            warn!(
                "conflicting contribution from member {} in quorum {}",
                idx,
                hex::encode(self.quorum_hash)
            );
            self.mark_bad(idx);
            self.contributions.insert(msg_hash, contribution);
            return MessageOutcome::Accepted;
        }

        if let (Some(my_idx), Some(identity)) = (self.my_idx, self.identity.as_ref()) {
            match decrypt_share(&identity.operator_key, &contribution.shares[my_idx]) {
                Ok(share) => {
                    self.received_shares[idx] = Some(share);
                    self.pending_share_checks.push(idx);
                }
                Err(e) => {
                    debug!("failed to decrypt share from member {}: {}", idx, e);
                }
            }
        }
        self.received_vvecs[idx] = Some(contribution.vvec.clone());
        self.contributions.insert(msg_hash, contribution);
        MessageOutcome::Accepted
    }

    /// Deferred share checks, for handing to the BLS worker pool.
    pub fn take_pending_share_checks(&mut self) -> Vec<ShareCheck> {
        let my_idx = match self.my_idx {
            Some(idx) => idx,
            None => return Vec::new(),
        };
        let pending = std::mem::take(&mut self.pending_share_checks);
        pending
            .into_iter()
            .filter_map(|contributor| {
                let vvec = self.received_vvecs[contributor].clone()?;
                let share = self.received_shares[contributor]?;
                Some(ShareCheck { contributor, recipient: my_idx, vvec, share })
            })
            .collect()
    }

    pub fn apply_share_check_results(&mut self, results: Vec<(usize, bool)>) {
        for (contributor, ok) in results {
            self.share_ok[contributor] = Some(ok);
            if !ok {
                debug!("share from member {} failed verification", contributor);
            }
        }
    }

    /// Verify every outstanding share inline (the worker-pool path is
    /// in the session manager).
    pub fn verify_pending_contributions(&mut self) {
        let checks = self.take_pending_share_checks();
        let results = checks
            .into_iter()
            .map(|c| (c.contributor, verify_contribution_share(&c.vvec, c.recipient, &c.share)))
            .collect();
        self.apply_share_check_results(results);
    }

    // Phase 2: complain

    /// Complain about every member that stayed silent or sent us a
    /// share that does not verify.
    pub fn verify_and_complain(&mut self) -> Option<DkgComplaint> {
        self.verify_pending_contributions();
        let my_idx = self.my_idx?;
        let identity = self.identity.clone()?;

        let mut bits = vec![false; self.members.len()];
        for idx in 0..self.members.len() {
            if idx == my_idx {
                continue;
            }
            if self.received_vvecs[idx].is_none() {
                // silent member
                bits[idx] = true;
                continue;
            }
            let share_good = self.received_shares[idx].is_some()
                && self.share_ok[idx] == Some(true);
            if !share_good {
                bits[idx] = true;
                self.members[idx].we_complain = true;
            }
        }
        if !bits.iter().any(|b| *b) {
            return None;
        }

        let mut msg = DkgComplaint {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: identity.pro_tx_hash,
            complain_for_members: bits,
            sig: identity.operator_key.sign(b""),
        };
        msg.sig = identity.operator_key.sign(msg.sign_hash());
        Some(msg)
    }

    pub fn receive_complaint(&mut self, complaint: DkgComplaint) -> MessageOutcome {
        if self.failed {
            return MessageOutcome::Ignored;
        }
        if complaint.llmq_type != self.params.llmq_type
            || complaint.quorum_hash != self.quorum_hash
            || complaint.complain_for_members.len() != self.members.len()
        {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let complainant = match self.member_index(&complaint.pro_tx_hash) {
            Some(idx) => idx,
            None => return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION },
        };
        let sign_hash = complaint.sign_hash();
        if !self.members[complainant].entry.operator_pubkey.verify(&complaint.sig, sign_hash) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }

        let msg_hash = complaint.msg_hash();
        if self.seen(msg_hash) {
            return MessageOutcome::Ignored;
        }
        self.members[complainant].complaints.insert(msg_hash);
        if self.members[complainant].complaints.len() > 1 {
            self.mark_bad(complainant);
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }

        for (accused, bit) in complaint.complain_for_members.iter().enumerate() {
            if !bit {
                continue;
            }
            self.members[accused].someone_complain = true;
            self.unresolved_complaints.insert((accused, complainant));
            if Some(accused) == self.my_idx {
                self.complaints_against_me.insert(complainant);
            }
        }
        self.complaints.insert(msg_hash, complaint);
        MessageOutcome::Accepted
    }

    // Phase 3: justify

    /// Reveal the plaintext shares for everyone who complained about
    /// us; the revealed shares are checked against our published
    /// verification vector by everybody.
    pub fn verify_and_justify(&mut self) -> Option<DkgJustification> {
        let identity = self.identity.clone()?;
        self.my_idx?;
        if self.complaints_against_me.is_empty() {
            return None;
        }
        let contribution = self.my_contribution.as_ref()?;
        let reveals: Vec<(u32, [u8; 32])> = self
            .complaints_against_me
            .iter()
            .map(|&complainant| {
                (complainant as u32, fr_to_bytes(&contribution.share_for(complainant)))
            })
            .collect();

        let mut msg = DkgJustification {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: identity.pro_tx_hash,
            contributions: reveals,
            sig: identity.operator_key.sign(b""),
        };
        msg.sig = identity.operator_key.sign(msg.sign_hash());
        Some(msg)
    }

    pub fn receive_justification(&mut self, justification: DkgJustification) -> MessageOutcome {
        if self.failed {
            return MessageOutcome::Ignored;
        }
        if justification.llmq_type != self.params.llmq_type
            || justification.quorum_hash != self.quorum_hash
            || justification.contributions.is_empty()
        {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let accused = match self.member_index(&justification.pro_tx_hash) {
            Some(idx) => idx,
            None => return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION },
        };
        let mut recipients = BTreeSet::new();
        for (recipient, _) in &justification.contributions {
            if *recipient as usize >= self.members.len() || !recipients.insert(*recipient) {
                return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
            }
        }
        let sign_hash = justification.sign_hash();
        if !self.members[accused].entry.operator_pubkey.verify(&justification.sig, sign_hash) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }

        let msg_hash = justification.msg_hash();
        if self.seen(msg_hash) {
            return MessageOutcome::Ignored;
        }
        self.members[accused].justifications.insert(msg_hash);
        if self.members[accused].justifications.len() > 1 {
            self.mark_bad(accused);
            return MessageOutcome::Rejected { ban: MISBEHAVE_SUSPECT };
        }

        let vvec = match self.received_vvecs[accused].clone() {
            Some(vvec) => vvec,
            None => {
                // justifying without having contributed
                self.mark_bad(accused);
                return MessageOutcome::Rejected { ban: MISBEHAVE_SUSPECT };
            }
        };
        for (recipient, share_bytes) in &justification.contributions {
            let recipient = *recipient as usize;
            let share = match ferrite_crypto::bls::fr_from_bytes(share_bytes) {
                Ok(share) => share,
                Err(_) => {
                    self.mark_bad(accused);
                    continue;
                }
            };
            if !verify_contribution_share(&vvec, recipient, &share) {
                // an invalid justification condemns the accused
                self.mark_bad(accused);
                continue;
            }
            self.unresolved_complaints.remove(&(accused, recipient));
            if Some(recipient) == self.my_idx && self.share_ok[accused] != Some(true) {
                self.received_shares[accused] = Some(share);
                self.share_ok[accused] = Some(true);
            }
        }
        self.justifications.insert(msg_hash, justification);
        MessageOutcome::Accepted
    }

    // Phase 4: commit

    fn settle_complaints(&mut self) {
        let unresolved: BTreeSet<usize> =
            self.unresolved_complaints.iter().map(|(accused, _)| *accused).collect();
        for accused in unresolved {
            self.mark_bad(accused);
        }
    }

    fn compute_valid_members(&self) -> Vec<bool> {
        self.members
            .iter()
            .map(|m| !m.bad && self.received_vvecs[m.idx].is_some())
            .collect()
    }

    fn aggregate_vvec_for(&self, valid_members: &[bool]) -> Option<Commitment> {
        let vvecs: Option<Vec<&Commitment>> = valid_members
            .iter()
            .enumerate()
            .filter(|(_, valid)| **valid)
            .map(|(idx, _)| self.received_vvecs[idx].as_ref())
            .collect();
        aggregate_verification_vectors(vvecs?)
    }

    /// Compute the quorum key from the surviving members and publish
    /// our premature commitment with a threshold signature share.
    pub fn verify_and_commit(&mut self) -> Option<DkgPrematureCommitment> {
        self.verify_pending_contributions();
        self.settle_complaints();
        let valid_members = self.compute_valid_members();
        let valid_count = valid_members.iter().filter(|b| **b).count();
        if valid_count < self.params.threshold {
            warn!(
                "quorum {} failed: only {} of {} members valid (threshold {})",
                hex::encode(self.quorum_hash),
                valid_count,
                self.members.len(),
                self.params.threshold
            );
            self.failed = true;
            return None;
        }

        let my_idx = self.my_idx?;
        let identity = self.identity.clone()?;
        if !valid_members[my_idx] {
            return None;
        }
        // every valid contributor must have handed us a good share
        for (idx, valid) in valid_members.iter().enumerate() {
            if *valid && self.share_ok[idx] != Some(true) {
                warn!(
                    "missing verified share from valid member {} in quorum {}",
                    idx,
                    hex::encode(self.quorum_hash)
                );
                return None;
            }
        }

        let agg_vvec = self.aggregate_vvec_for(&valid_members)?;
        let valid_vvecs = valid_members
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .filter_map(|(idx, _)| self.received_vvecs[idx].as_ref());
        let vvec_hash = verification_vectors_hash(valid_vvecs);
        let pubkey = quorum_public_key(&agg_vvec);

        let shares = valid_members
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .filter_map(|(idx, _)| self.received_shares[idx].as_ref());
        let own_share = aggregate_secret_shares(shares)?;

        self.quorum_vvec = Some(agg_vvec);
        self.own_quorum_share = Some(own_share);

        let quorum_index = if self.params.rotation { self.quorum_index } else { 0 };
        let mut msg = DkgPrematureCommitment {
            llmq_type: self.params.llmq_type,
            quorum_hash: self.quorum_hash,
            pro_tx_hash: identity.pro_tx_hash,
            quorum_index,
            valid_members,
            quorum_public_key: pubkey,
            quorum_vvec_hash: vvec_hash,
            quorum_sig_share: secret_key_share_from_fr(&own_share).sign(b""),
            sig: identity.operator_key.sign(b""),
        };
        let commitment_hash = msg.commitment_hash(self.params.rotation);
        msg.quorum_sig_share = secret_key_share_from_fr(&own_share).sign(commitment_hash);
        msg.sig = identity.operator_key.sign(commitment_hash);
        info!(
            "premature commitment for quorum {}: {} valid members",
            hex::encode(self.quorum_hash),
            valid_count
        );
        Some(msg)
    }

    pub fn receive_premature_commitment(&mut self, pc: DkgPrematureCommitment) -> MessageOutcome {
        if self.failed {
            return MessageOutcome::Ignored;
        }
        if pc.llmq_type != self.params.llmq_type
            || pc.quorum_hash != self.quorum_hash
            || pc.valid_members.len() != self.members.len()
        {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        if pc.count_valid_members() < self.params.threshold {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }
        let sender = match self.member_index(&pc.pro_tx_hash) {
            Some(idx) => idx,
            None => return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION },
        };
        let commitment_hash = pc.commitment_hash(self.params.rotation);
        if !self.members[sender].entry.operator_pubkey.verify(&pc.sig, commitment_hash) {
            return MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION };
        }

        let msg_hash = pc.msg_hash();
        if self.seen(msg_hash) {
            return MessageOutcome::Ignored;
        }
        self.members[sender].premature_commitments.insert(msg_hash);
        if self.members[sender].premature_commitments.len() > 1 {
            self.mark_bad(sender);
            return MessageOutcome::Rejected { ban: MISBEHAVE_SUSPECT };
        }

        // check the threshold share whenever we hold the vvecs to
        // derive the sender's public key share
        if let Some(agg_vvec) = self.aggregate_vvec_for(&pc.valid_members) {
            let pk_share = public_key_share(&agg_vvec, sender);
            if !pk_share.verify(&pc.quorum_sig_share, commitment_hash) {
                self.mark_bad(sender);
                return MessageOutcome::Rejected { ban: MISBEHAVE_SUSPECT };
            }
        }

        self.commitment_sender.insert(msg_hash, sender);
        self.premature_commitments.insert(msg_hash, pc);
        MessageOutcome::Accepted
    }

    // Phase 5: aggregate

    /// Aggregate matching premature commitments into final
    /// commitments. The first group reaching the threshold wins.
    pub fn finalize_commitments(&mut self) -> Vec<FinalCommitment> {
        type GroupKey = (Vec<bool>, Vec<u8>, Hash);
        let mut groups: BTreeMap<GroupKey, Vec<Hash>> = BTreeMap::new();
        for (msg_hash, pc) in &self.premature_commitments {
            let key = (
                pc.valid_members.clone(),
                pc.quorum_public_key.to_bytes().to_vec(),
                pc.quorum_vvec_hash,
            );
            groups.entry(key).or_default().push(*msg_hash);
        }

        for ((valid_members, _, _), msg_hashes) in groups {
            if msg_hashes.len() < self.params.threshold {
                continue;
            }
            let agg_vvec = match self.aggregate_vvec_for(&valid_members) {
                Some(vvec) => vvec,
                None => continue,
            };
            let first = &self.premature_commitments[&msg_hashes[0]];
            let commitment_hash = first.commitment_hash(self.params.rotation);
            let quorum_public_key = first.quorum_public_key.clone();
            let quorum_vvec_hash = first.quorum_vvec_hash;
            let quorum_index = first.quorum_index;

            let mut shares: BTreeMap<usize, SignatureShare> = BTreeMap::new();
            let mut single_sigs = Vec::new();
            let mut signers = vec![false; self.members.len()];
            for msg_hash in &msg_hashes {
                let pc = &self.premature_commitments[msg_hash];
                let sender = self.commitment_sender[msg_hash];
                if !public_key_share(&agg_vvec, sender).verify(&pc.quorum_sig_share, commitment_hash)
                {
                    continue;
                }
                shares.insert(sender, pc.quorum_sig_share.clone());
                single_sigs.push(pc.sig.clone());
                signers[sender] = true;
            }
            if shares.len() < self.params.threshold {
                continue;
            }

            let quorum_sig = match recover_signature(&agg_vvec, self.params.threshold, &shares) {
                Ok(sig) => sig,
                Err(e) => {
                    warn!("failed to recover quorum signature: {}", e);
                    continue;
                }
            };
            if !quorum_public_key.verify(&quorum_sig, commitment_hash) {
                warn!(
                    "recovered quorum signature does not verify for {}",
                    hex::encode(self.quorum_hash)
                );
                continue;
            }
            let members_sig = match aggregate_signatures(single_sigs.iter()) {
                Some(sig) => sig,
                None => continue,
            };

            info!(
                "final commitment for quorum {}: {} signers, {} valid members",
                hex::encode(self.quorum_hash),
                shares.len(),
                valid_members.iter().filter(|b| **b).count()
            );
            return vec![FinalCommitment {
                version: FinalCommitment::CURRENT_VERSION,
                llmq_type: self.params.llmq_type,
                quorum_hash: self.quorum_hash,
                quorum_index,
                signers,
                valid_members,
                quorum_public_key,
                quorum_vvec_hash,
                quorum_sig,
                members_sig,
            }];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::params::{llmq_params, LlmqType};
    use threshold_crypto::SecretKey;

    fn build_sessions(n: usize) -> Vec<DkgSession> {
        let params = llmq_params(LlmqType::LlmqTest).clone();
        assert_eq!(n, params.size);
        let keys: Vec<SecretKey> = (0..n).map(|_| SecretKey::random()).collect();
        let members: Vec<MasternodeEntry> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| MasternodeEntry {
                pro_tx_hash: [i as u8 + 1; 32],
                operator_pubkey: key.public_key(),
                address: format!("10.1.1.{}:9999", i + 1).parse().unwrap(),
                valid: true,
            })
            .collect();
        let anchor = BlockInfo { hash: [0xab; 32], prev_hash: [0xaa; 32], height: 48 };
        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                DkgSession::new(
                    params.clone(),
                    &anchor,
                    0,
                    members.clone(),
                    Some(LocalIdentity::new([i as u8 + 1; 32], key.clone())),
                )
            })
            .collect()
    }

    fn broadcast<T: Clone>(
        sessions: &mut [DkgSession],
        msgs: &[T],
        mut deliver: impl FnMut(&mut DkgSession, T) -> MessageOutcome,
    ) {
        for msg in msgs {
            for session in sessions.iter_mut() {
                deliver(session, msg.clone());
            }
        }
    }

    fn run_contribution_phase(sessions: &mut [DkgSession]) {
        let contributions: Vec<DkgContribution> =
            sessions.iter_mut().map(|s| s.contribute().unwrap()).collect();
        broadcast(sessions, &contributions, |s, c| s.receive_contribution(c));
    }

    #[test]
    fn happy_path_produces_final_commitment() {
        let mut sessions = build_sessions(10);
        run_contribution_phase(&mut sessions);

        // nobody has anything to complain about
        for session in sessions.iter_mut() {
            assert!(session.verify_and_complain().is_none());
        }

        let commitments: Vec<DkgPrematureCommitment> =
            sessions.iter_mut().map(|s| s.verify_and_commit().unwrap()).collect();
        for pc in &commitments {
            assert_eq!(pc.count_valid_members(), 10);
        }
        broadcast(&mut sessions, &commitments, |s, c| s.receive_premature_commitment(c));

        let finals = sessions[0].finalize_commitments();
        assert_eq!(finals.len(), 1);
        let fc = &finals[0];
        assert_eq!(fc.count_valid_members(), 10);
        assert!(fc.count_signers() >= 6);
        assert!(fc
            .quorum_public_key
            .verify(&fc.quorum_sig, fc.commitment_hash(false)));
    }

    #[test]
    fn conflicting_contribution_marks_sender_bad() {
        let mut sessions = build_sessions(10);
        let first = sessions[0].contribute().unwrap();
        let second = sessions[0].contribute().unwrap();
        assert_ne!(first.msg_hash(), second.msg_hash());

        let receiver = &mut sessions[1];
        assert_eq!(receiver.receive_contribution(first), MessageOutcome::Accepted);
        // the conflicting message is accepted for relay but damns the sender
        assert_eq!(receiver.receive_contribution(second), MessageOutcome::Accepted);
        assert!(receiver.member(0).bad);
    }

    #[test]
    fn duplicate_contribution_is_ignored() {
        let mut sessions = build_sessions(10);
        let msg = sessions[0].contribute().unwrap();
        let receiver = &mut sessions[1];
        assert_eq!(receiver.receive_contribution(msg.clone()), MessageOutcome::Accepted);
        assert_eq!(receiver.receive_contribution(msg), MessageOutcome::Ignored);
        assert!(!receiver.member(0).bad);
    }

    #[test]
    fn wrong_anchor_is_a_violation() {
        let mut sessions = build_sessions(10);
        let mut msg = sessions[0].contribute().unwrap();
        msg.quorum_hash = [0xcd; 32];
        assert_eq!(
            sessions[1].receive_contribution(msg),
            MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION }
        );
    }

    #[test]
    fn non_member_contribution_is_a_violation() {
        let mut sessions = build_sessions(10);
        let mut msg = sessions[0].contribute().unwrap();
        msg.pro_tx_hash = [0x77; 32];
        assert_eq!(
            sessions[1].receive_contribution(msg),
            MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION }
        );
    }

    #[test]
    fn silent_member_draws_complaints_and_is_excluded() {
        let mut sessions = build_sessions(10);
        // member 3 never contributes
        let contributions: Vec<DkgContribution> = sessions
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| *i != 3)
            .map(|(_, s)| s.contribute().unwrap())
            .collect();
        broadcast(&mut sessions, &contributions, |s, c| s.receive_contribution(c));

        let complaints: Vec<DkgComplaint> = sessions
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| *i != 3)
            .filter_map(|(_, s)| s.verify_and_complain())
            .collect();
        assert_eq!(complaints.len(), 9);
        assert!(complaints.iter().all(|c| c.complain_for_members[3]));
        broadcast(&mut sessions, &complaints, |s, c| s.receive_complaint(c));

        // member 3 cannot justify (nothing was contributed)
        let pc = sessions[0].verify_and_commit().unwrap();
        assert!(!pc.valid_members[3]);
        assert_eq!(pc.count_valid_members(), 9);
    }

    #[test]
    fn second_complaint_is_an_offense() {
        let mut sessions = build_sessions(10);
        run_contribution_phase(&mut sessions);

        let identity = sessions[0].identity.clone().unwrap();
        let make_complaint = |bits: Vec<bool>| {
            let mut msg = DkgComplaint {
                llmq_type: LlmqType::LlmqTest,
                quorum_hash: [0xab; 32],
                pro_tx_hash: identity.pro_tx_hash,
                complain_for_members: bits,
                sig: identity.operator_key.sign(b""),
            };
            msg.sig = identity.operator_key.sign(msg.sign_hash());
            msg
        };
        let mut bits = vec![false; 10];
        bits[5] = true;
        let first = make_complaint(bits);
        let mut bits = vec![false; 10];
        bits[6] = true;
        let second = make_complaint(bits);

        let receiver = &mut sessions[1];
        assert_eq!(receiver.receive_complaint(first), MessageOutcome::Accepted);
        assert_eq!(
            receiver.receive_complaint(second),
            MessageOutcome::Rejected { ban: MISBEHAVE_VIOLATION }
        );
        assert!(receiver.member(0).bad);
    }

    #[test]
    fn justification_rehabilitates_accused() {
        let mut sessions = build_sessions(10);
        run_contribution_phase(&mut sessions);

        // member 7 falsely accuses member 3
        let accuser = sessions[7].identity.clone().unwrap();
        let mut bits = vec![false; 10];
        bits[3] = true;
        let mut complaint = DkgComplaint {
            llmq_type: LlmqType::LlmqTest,
            quorum_hash: [0xab; 32],
            pro_tx_hash: accuser.pro_tx_hash,
            complain_for_members: bits,
            sig: accuser.operator_key.sign(b""),
        };
        complaint.sig = accuser.operator_key.sign(complaint.sign_hash());
        broadcast(&mut sessions, &[complaint], |s, c| s.receive_complaint(c));

        // member 3 reveals the real share for member 7
        let justification = sessions[3].verify_and_justify().unwrap();
        assert_eq!(justification.contributions.len(), 1);
        assert_eq!(justification.contributions[0].0, 7);
        broadcast(&mut sessions, &[justification], |s, j| s.receive_justification(j));

        let pc = sessions[0].verify_and_commit().unwrap();
        assert!(pc.valid_members[3]);
        assert_eq!(pc.count_valid_members(), 10);
    }

    #[test]
    fn session_fails_below_threshold() {
        let mut sessions = build_sessions(10);
        // only five members contribute, threshold is six
        let contributions: Vec<DkgContribution> = sessions
            .iter_mut()
            .take(5)
            .map(|s| s.contribute().unwrap())
            .collect();
        broadcast(&mut sessions, &contributions, |s, c| s.receive_contribution(c));

        assert!(sessions[0].verify_and_commit().is_none());
        assert!(sessions[0].failed());
    }
}
