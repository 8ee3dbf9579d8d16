//! Wire types of the LLMQ subsystem: DKG messages, signature shares,
//! recovered signatures and InstantSend locks.
//!
//! Every message carries an operator signature over the double-SHA-256
//! of its encoding with the trailing signature omitted; `sign_hash`
//! returns that digest.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use threshold_crypto::{Ciphertext, PublicKey, Signature, SignatureShare};
use threshold_crypto::poly::Commitment;

use crate::encode::{
    self, decode_opaque, encode_opaque, hash_encodable, read_dyn_bitset, Decodable, DynBitSet,
    Encodable, EncodeError, HashWriter,
};
use crate::params::LlmqType;
use crate::{Hash, OutPoint};

/// Domain tag for per-input lock request ids.
pub const INPUTLOCK_REQUEST_ID_PREFIX: &str = "inlock";
/// Domain tag for InstantSend lock request ids.
pub const ISLOCK_REQUEST_ID_PREFIX: &str = "islock";

/// `signHash = H(llmqType || quorumHash || id || msgHash)`.
pub fn build_sign_hash(llmq_type: LlmqType, quorum_hash: &Hash, id: &Hash, msg_hash: &Hash) -> Hash {
    let mut hw = HashWriter::new();
    llmq_type.consensus_encode(&mut hw).expect("hash writer");
    quorum_hash.consensus_encode(&mut hw).expect("hash writer");
    id.consensus_encode(&mut hw).expect("hash writer");
    msg_hash.consensus_encode(&mut hw).expect("hash writer");
    hw.finalize()
}

/// The request id binding an input lock to one outpoint.
pub fn input_lock_request_id(outpoint: &OutPoint) -> Hash {
    let mut hw = HashWriter::new();
    INPUTLOCK_REQUEST_ID_PREFIX.consensus_encode(&mut hw).expect("hash writer");
    outpoint.consensus_encode(&mut hw).expect("hash writer");
    hw.finalize()
}

/// The request id of an islock over `inputs`, in transaction order.
pub fn islock_request_id(inputs: &[OutPoint]) -> Hash {
    let mut hw = HashWriter::new();
    ISLOCK_REQUEST_ID_PREFIX.consensus_encode(&mut hw).expect("hash writer");
    inputs.to_vec().consensus_encode(&mut hw).expect("hash writer");
    hw.finalize()
}

/// `commitmentHash = H(llmqType || quorumHash || validMembers ||
/// quorumPublicKey || vvecHash [|| quorumIndex])`; the index is only
/// hashed for rotated (indexed) quorum types.
pub fn build_commitment_hash(
    llmq_type: LlmqType,
    quorum_hash: &Hash,
    valid_members: &[bool],
    quorum_public_key: &PublicKey,
    quorum_vvec_hash: &Hash,
    quorum_index: Option<i16>,
) -> Hash {
    let mut hw = HashWriter::new();
    llmq_type.consensus_encode(&mut hw).expect("hash writer");
    quorum_hash.consensus_encode(&mut hw).expect("hash writer");
    DynBitSet(valid_members).consensus_encode(&mut hw).expect("hash writer");
    quorum_public_key.consensus_encode(&mut hw).expect("hash writer");
    quorum_vvec_hash.consensus_encode(&mut hw).expect("hash writer");
    if let Some(idx) = quorum_index {
        idx.consensus_encode(&mut hw).expect("hash writer");
    }
    hw.finalize()
}

/// Phase 1: one member's verification vector plus the IES-encrypted
/// secret contribution for every member, recipient-ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkgContribution {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub pro_tx_hash: Hash,
    pub vvec: Commitment,
    pub shares: Vec<Ciphertext>,
    pub sig: Signature,
}

impl DkgContribution {
    fn encode_without_sig<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.pro_tx_hash.consensus_encode(w)?;
        len += encode_opaque(w, &self.vvec)?;
        len += encode::write_compact_size(w, self.shares.len() as u64)?;
        for share in &self.shares {
            len += encode_opaque(w, share)?;
        }
        Ok(len)
    }

    pub fn sign_hash(&self) -> Hash {
        let mut hw = HashWriter::new();
        self.encode_without_sig(&mut hw).expect("hash writer");
        hw.finalize()
    }

    /// Identifies this exact message for relay and dedup.
    pub fn msg_hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for DkgContribution {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.encode_without_sig(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DkgContribution {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let llmq_type = LlmqType::consensus_decode(r)?;
        let quorum_hash = Hash::consensus_decode(r)?;
        let pro_tx_hash = Hash::consensus_decode(r)?;
        let vvec: Commitment = decode_opaque(r)?;
        let n = encode::read_compact_size(r)?;
        if n > u16::MAX as u64 {
            return Err(EncodeError::OversizedCollection(n));
        }
        let mut shares = Vec::with_capacity(n as usize);
        for _ in 0..n {
            shares.push(decode_opaque(r)?);
        }
        let sig = Signature::consensus_decode(r)?;
        Ok(DkgContribution { llmq_type, quorum_hash, pro_tx_hash, vvec, shares, sig })
    }
}

/// Phase 2: a bitset of members the sender complains about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkgComplaint {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub pro_tx_hash: Hash,
    pub complain_for_members: Vec<bool>,
    pub sig: Signature,
}

impl DkgComplaint {
    fn encode_without_sig<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.pro_tx_hash.consensus_encode(w)?;
        len += DynBitSet(&self.complain_for_members).consensus_encode(w)?;
        Ok(len)
    }

    pub fn sign_hash(&self) -> Hash {
        let mut hw = HashWriter::new();
        self.encode_without_sig(&mut hw).expect("hash writer");
        hw.finalize()
    }

    pub fn msg_hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for DkgComplaint {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.encode_without_sig(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DkgComplaint {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(DkgComplaint {
            llmq_type: LlmqType::consensus_decode(r)?,
            quorum_hash: Hash::consensus_decode(r)?,
            pro_tx_hash: Hash::consensus_decode(r)?,
            complain_for_members: read_dyn_bitset(r)?,
            sig: Signature::consensus_decode(r)?,
        })
    }
}

/// Phase 3: plaintext secret shares revealed to refute complaints,
/// one per complaining recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkgJustification {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub pro_tx_hash: Hash,
    /// `(recipient index, 32-byte big-endian field element)` pairs.
    pub contributions: Vec<(u32, [u8; 32])>,
    pub sig: Signature,
}

impl DkgJustification {
    fn encode_without_sig<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.pro_tx_hash.consensus_encode(w)?;
        len += encode::write_compact_size(w, self.contributions.len() as u64)?;
        for (idx, share) in &self.contributions {
            len += idx.consensus_encode(w)?;
            len += share.consensus_encode(w)?;
        }
        Ok(len)
    }

    pub fn sign_hash(&self) -> Hash {
        let mut hw = HashWriter::new();
        self.encode_without_sig(&mut hw).expect("hash writer");
        hw.finalize()
    }

    pub fn msg_hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for DkgJustification {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.encode_without_sig(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DkgJustification {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let llmq_type = LlmqType::consensus_decode(r)?;
        let quorum_hash = Hash::consensus_decode(r)?;
        let pro_tx_hash = Hash::consensus_decode(r)?;
        let n = encode::read_compact_size(r)?;
        if n > u16::MAX as u64 {
            return Err(EncodeError::OversizedCollection(n));
        }
        let mut contributions = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let idx = u32::consensus_decode(r)?;
            let share = <[u8; 32]>::consensus_decode(r)?;
            contributions.push((idx, share));
        }
        let sig = Signature::consensus_decode(r)?;
        Ok(DkgJustification { llmq_type, quorum_hash, pro_tx_hash, contributions, sig })
    }
}

/// Phase 4: one member's signed assertion of the quorum key and the
/// valid-members set, with a threshold signature share over the
/// commitment hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkgPrematureCommitment {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub pro_tx_hash: Hash,
    pub quorum_index: i16,
    pub valid_members: Vec<bool>,
    pub quorum_public_key: PublicKey,
    pub quorum_vvec_hash: Hash,
    pub quorum_sig_share: SignatureShare,
    pub sig: Signature,
}

impl DkgPrematureCommitment {
    pub fn count_valid_members(&self) -> usize {
        self.valid_members.iter().filter(|b| **b).count()
    }

    pub fn commitment_hash(&self, indexed: bool) -> Hash {
        build_commitment_hash(
            self.llmq_type,
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
            indexed.then_some(self.quorum_index),
        )
    }

    pub fn msg_hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for DkgPrematureCommitment {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.pro_tx_hash.consensus_encode(w)?;
        len += self.quorum_index.consensus_encode(w)?;
        len += DynBitSet(&self.valid_members).consensus_encode(w)?;
        len += self.quorum_public_key.consensus_encode(w)?;
        len += self.quorum_vvec_hash.consensus_encode(w)?;
        len += self.quorum_sig_share.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for DkgPrematureCommitment {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(DkgPrematureCommitment {
            llmq_type: LlmqType::consensus_decode(r)?,
            quorum_hash: Hash::consensus_decode(r)?,
            pro_tx_hash: Hash::consensus_decode(r)?,
            quorum_index: i16::consensus_decode(r)?,
            valid_members: read_dyn_bitset(r)?,
            quorum_public_key: PublicKey::consensus_decode(r)?,
            quorum_vvec_hash: Hash::consensus_decode(r)?,
            quorum_sig_share: SignatureShare::consensus_decode(r)?,
            sig: Signature::consensus_decode(r)?,
        })
    }
}

/// The aggregate of at least `threshold` matching premature
/// commitments; this is what gets mined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalCommitment {
    pub version: u16,
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub quorum_index: i16,
    /// Which members' premature commitments were aggregated.
    pub signers: Vec<bool>,
    pub valid_members: Vec<bool>,
    pub quorum_public_key: PublicKey,
    pub quorum_vvec_hash: Hash,
    /// Recovered threshold signature over the commitment hash.
    pub quorum_sig: Signature,
    /// Aggregate of the signers' operator signatures.
    pub members_sig: Signature,
}

impl FinalCommitment {
    pub const CURRENT_VERSION: u16 = 1;

    pub fn count_signers(&self) -> usize {
        self.signers.iter().filter(|b| **b).count()
    }

    pub fn count_valid_members(&self) -> usize {
        self.valid_members.iter().filter(|b| **b).count()
    }

    pub fn commitment_hash(&self, indexed: bool) -> Hash {
        build_commitment_hash(
            self.llmq_type,
            &self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            &self.quorum_vvec_hash,
            indexed.then_some(self.quorum_index),
        )
    }
}

impl Encodable for FinalCommitment {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.quorum_index.consensus_encode(w)?;
        len += DynBitSet(&self.signers).consensus_encode(w)?;
        len += DynBitSet(&self.valid_members).consensus_encode(w)?;
        len += self.quorum_public_key.consensus_encode(w)?;
        len += self.quorum_vvec_hash.consensus_encode(w)?;
        len += self.quorum_sig.consensus_encode(w)?;
        len += self.members_sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for FinalCommitment {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(FinalCommitment {
            version: u16::consensus_decode(r)?,
            llmq_type: LlmqType::consensus_decode(r)?,
            quorum_hash: Hash::consensus_decode(r)?,
            quorum_index: i16::consensus_decode(r)?,
            signers: read_dyn_bitset(r)?,
            valid_members: read_dyn_bitset(r)?,
            quorum_public_key: PublicKey::consensus_decode(r)?,
            quorum_vvec_hash: Hash::consensus_decode(r)?,
            quorum_sig: Signature::consensus_decode(r)?,
            members_sig: Signature::consensus_decode(r)?,
        })
    }
}

/// One member's BLS signature share for a signing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigShareMessage {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub signer_index: u16,
    pub id: Hash,
    pub msg_hash: Hash,
    pub share: SignatureShare,
}

impl SigShareMessage {
    pub fn sign_hash(&self) -> Hash {
        build_sign_hash(self.llmq_type, &self.quorum_hash, &self.id, &self.msg_hash)
    }

    pub fn msg_hash_key(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for SigShareMessage {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.signer_index.consensus_encode(w)?;
        len += self.id.consensus_encode(w)?;
        len += self.msg_hash.consensus_encode(w)?;
        len += self.share.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for SigShareMessage {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(SigShareMessage {
            llmq_type: LlmqType::consensus_decode(r)?,
            quorum_hash: Hash::consensus_decode(r)?,
            signer_index: u16::consensus_decode(r)?,
            id: Hash::consensus_decode(r)?,
            msg_hash: Hash::consensus_decode(r)?,
            share: SignatureShare::consensus_decode(r)?,
        })
    }
}

/// A fully recovered threshold signature for `(id, msgHash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredSig {
    pub llmq_type: LlmqType,
    pub quorum_hash: Hash,
    pub id: Hash,
    pub msg_hash: Hash,
    pub sig: Signature,
}

impl RecoveredSig {
    pub fn sign_hash(&self) -> Hash {
        build_sign_hash(self.llmq_type, &self.quorum_hash, &self.id, &self.msg_hash)
    }

    pub fn hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for RecoveredSig {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.llmq_type.consensus_encode(w)?;
        len += self.quorum_hash.consensus_encode(w)?;
        len += self.id.consensus_encode(w)?;
        len += self.msg_hash.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for RecoveredSig {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(RecoveredSig {
            llmq_type: LlmqType::consensus_decode(r)?,
            quorum_hash: Hash::consensus_decode(r)?,
            id: Hash::consensus_decode(r)?,
            msg_hash: Hash::consensus_decode(r)?,
            sig: Signature::consensus_decode(r)?,
        })
    }
}

/// An InstantSend lock: a recovered signature asserting that no input
/// of `txid` will be spent elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantSendLock {
    pub txid: Hash,
    pub inputs: Vec<OutPoint>,
    pub sig: Signature,
}

impl InstantSendLock {
    /// `H("islock" || inputs)`, the id the lock's signature binds.
    pub fn request_id(&self) -> Hash {
        islock_request_id(&self.inputs)
    }

    pub fn hash(&self) -> Hash {
        hash_encodable(self)
    }
}

impl Encodable for InstantSendLock {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.txid.consensus_encode(w)?;
        len += self.inputs.consensus_encode(w)?;
        len += self.sig.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for InstantSendLock {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(InstantSendLock {
            txid: Hash::consensus_decode(r)?,
            inputs: Vec::<OutPoint>::consensus_decode(r)?,
            sig: Signature::consensus_decode(r)?,
        })
    }
}

/// Everything the subsystem gossips, for the transport boundary.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Contribution(DkgContribution),
    Complaint(DkgComplaint),
    Justification(DkgJustification),
    PrematureCommitment(DkgPrematureCommitment),
    SigShare(SigShareMessage),
    RecoveredSig(RecoveredSig),
    IsLock(InstantSendLock),
}
