//! Materialized quorums: validation of mined commitments, caching,
//! scanning and reorg handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use threshold_crypto::poly::Commitment;
use threshold_crypto::{PublicKey, PublicKeyShare, SecretKeyShare};

use ferrite_crypto::batch_verifier::aggregate_public_keys;
use ferrite_crypto::bls::{fr_from_bytes, public_key_share, secret_key_share_from_fr};
use ferrite_shared_types::masternode::MasternodeEntry;
use ferrite_shared_types::messages::FinalCommitment;
use ferrite_shared_types::params::{llmq_params, LlmqParams, LlmqType};
use ferrite_shared_types::Hash;

use crate::cache::LruCache;
use crate::chain::{BlockInfo, ChainView, LocalIdentity, MasternodeListSource, NetworkBridge};
use crate::config::LlmqConfig;
use crate::db::{LlmqDb, MinedCommitment};
use crate::error::{LlmqError, Result};
use crate::snapshots::SnapshotManager;
use crate::utils;

/// A committed quorum, immutable once materialized.
pub struct Quorum {
    pub params: LlmqParams,
    pub quorum_hash: Hash,
    pub quorum_index: i16,
    pub height: u64,
    pub members: Vec<MasternodeEntry>,
    pub valid_members: Vec<bool>,
    pub quorum_public_key: PublicKey,
    /// The aggregated verification vector; absent until synced for
    /// quorums we did not take part in.
    pub verification_vector: Option<Commitment>,
    /// Our share of the quorum secret, present for valid members.
    pub own_secret_share: Option<SecretKeyShare>,
}

impl Quorum {
    pub fn member_index(&self, pro_tx_hash: &Hash) -> Option<usize> {
        self.members.iter().position(|m| m.pro_tx_hash == *pro_tx_hash)
    }

    pub fn is_valid_member(&self, pro_tx_hash: &Hash) -> bool {
        self.member_index(pro_tx_hash)
            .map(|idx| self.valid_members[idx])
            .unwrap_or(false)
    }

    /// Public key share of one member under the quorum key.
    pub fn public_key_share(&self, member_index: usize) -> Option<PublicKeyShare> {
        let vvec = self.verification_vector.as_ref()?;
        Some(public_key_share(vvec, member_index))
    }
}

/// Validates mined final commitments and serves materialized quorums.
pub struct QuorumManager {
    config: LlmqConfig,
    chain: Arc<dyn ChainView>,
    mn_source: Arc<dyn MasternodeListSource>,
    network: Arc<dyn NetworkBridge>,
    db: Arc<LlmqDb>,
    snapshots: Arc<SnapshotManager>,
    identity: Option<LocalIdentity>,
    caches: Mutex<HashMap<LlmqType, LruCache<Hash, Arc<Quorum>>>>,
}

impl QuorumManager {
    pub fn new(
        config: LlmqConfig,
        chain: Arc<dyn ChainView>,
        mn_source: Arc<dyn MasternodeListSource>,
        network: Arc<dyn NetworkBridge>,
        db: Arc<LlmqDb>,
        snapshots: Arc<SnapshotManager>,
        identity: Option<LocalIdentity>,
    ) -> Self {
        QuorumManager {
            config,
            chain,
            mn_source,
            network,
            db,
            snapshots,
            identity,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a commitment mined into `block` and materialize the
    /// quorum it commits to.
    pub fn process_mined_commitment(&self, fc: FinalCommitment, block: BlockInfo) -> Result<()> {
        if !self.config.is_type_enabled(fc.llmq_type) {
            return Err(LlmqError::InvalidCommitment("type not enabled".into()));
        }
        let params = llmq_params(fc.llmq_type);
        self.verify_commitment_shape(params, &fc)?;

        let anchor = self
            .chain
            .block_by_hash(&fc.quorum_hash)
            .ok_or_else(|| LlmqError::UnknownBlock(hex::encode(fc.quorum_hash)))?;
        let members = self.members_at(params, &anchor)?;
        if members.len() != params.size {
            return Err(LlmqError::InvalidCommitment(format!(
                "member set has {} entries, expected {}",
                members.len(),
                params.size
            )));
        }
        self.verify_commitment_sigs(params, &fc, &members)?;

        let quorum = Arc::new(self.materialize(params, fc.clone(), &anchor, members)?);
        self.db.write_mined_commitment(&MinedCommitment {
            commitment: fc,
            block_hash: block.hash,
            height: block.height,
        })?;
        {
            let mut caches = self.caches.lock().unwrap();
            self.cache_for(&mut caches, params).insert(anchor.hash, Arc::clone(&quorum));
        }
        info!(
            "materialized {} quorum {} at height {}",
            params.name,
            hex::encode(anchor.hash),
            anchor.height
        );

        if self.config.data_recovery {
            // a member without its secret share cannot sign even when
            // the verification vector is already synced
            let missing_own_share = self
                .identity
                .as_ref()
                .map(|id| quorum.is_valid_member(&id.pro_tx_hash) && quorum.own_secret_share.is_none())
                .unwrap_or(false);
            if quorum.verification_vector.is_none() || missing_own_share {
                let is_type_member = self.identity.is_some();
                if self.config.wants_qvvec_sync(params.llmq_type, is_type_member) {
                    self.network.request_quorum_data(params.llmq_type, &anchor.hash);
                }
            }
        }
        Ok(())
    }

    fn verify_commitment_shape(&self, params: &LlmqParams, fc: &FinalCommitment) -> Result<()> {
        if fc.version != FinalCommitment::CURRENT_VERSION {
            return Err(LlmqError::InvalidCommitment(format!("version {}", fc.version)));
        }
        if fc.valid_members.len() != params.size || fc.signers.len() != params.size {
            return Err(LlmqError::InvalidCommitment("bitset size mismatch".into()));
        }
        if fc.count_valid_members() < params.threshold {
            return Err(LlmqError::InvalidCommitment(format!(
                "{} valid members below threshold {}",
                fc.count_valid_members(),
                params.threshold
            )));
        }
        if fc.count_signers() < params.threshold {
            return Err(LlmqError::InvalidCommitment(format!(
                "{} signers below threshold {}",
                fc.count_signers(),
                params.threshold
            )));
        }
        Ok(())
    }

    fn verify_commitment_sigs(
        &self,
        params: &LlmqParams,
        fc: &FinalCommitment,
        members: &[MasternodeEntry],
    ) -> Result<()> {
        let commitment_hash = fc.commitment_hash(params.rotation);
        if !fc.quorum_public_key.verify(&fc.quorum_sig, commitment_hash) {
            return Err(LlmqError::InvalidCommitment("bad quorum signature".into()));
        }
        let signer_keys = members
            .iter()
            .zip(&fc.signers)
            .filter(|(_, signed)| **signed)
            .map(|(m, _)| &m.operator_pubkey);
        let agg = aggregate_public_keys(signer_keys)
            .ok_or_else(|| LlmqError::InvalidCommitment("no signers".into()))?;
        if !agg.verify(&fc.members_sig, commitment_hash) {
            return Err(LlmqError::InvalidCommitment("bad members signature".into()));
        }
        Ok(())
    }

    fn members_at(&self, params: &LlmqParams, anchor: &BlockInfo) -> Result<Vec<MasternodeEntry>> {
        if params.rotation {
            utils::rotated_quorum_members(
                params,
                self.chain.as_ref(),
                self.mn_source.as_ref(),
                &self.snapshots,
                anchor,
            )
        } else {
            Ok(utils::quorum_members(
                params,
                self.chain.as_ref(),
                self.mn_source.as_ref(),
                anchor,
            ))
        }
    }

    fn materialize(
        &self,
        params: &LlmqParams,
        fc: FinalCommitment,
        anchor: &BlockInfo,
        members: Vec<MasternodeEntry>,
    ) -> Result<Quorum> {
        let dkg_result = self.db.dkg_result(params.llmq_type, &anchor.hash)?;
        let (verification_vector, own_share_bytes) = match dkg_result {
            Some(result) => (Some(result.vvec), result.own_share),
            None => (None, None),
        };
        let own_secret_share = match (&self.identity, own_share_bytes) {
            (Some(identity), Some(bytes)) => {
                let is_valid = members
                    .iter()
                    .position(|m| m.pro_tx_hash == identity.pro_tx_hash)
                    .map(|idx| fc.valid_members[idx])
                    .unwrap_or(false);
                if is_valid {
                    let fr = fr_from_bytes(&bytes)
                        .map_err(|e| LlmqError::Crypto(e.to_string()))?;
                    Some(secret_key_share_from_fr(&fr))
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(Quorum {
            params: params.clone(),
            quorum_hash: anchor.hash,
            quorum_index: fc.quorum_index,
            height: anchor.height,
            members,
            valid_members: fc.valid_members,
            quorum_public_key: fc.quorum_public_key,
            verification_vector,
            own_secret_share,
        })
    }

    fn cache_for<'a>(
        &self,
        caches: &'a mut HashMap<LlmqType, LruCache<Hash, Arc<Quorum>>>,
        params: &LlmqParams,
    ) -> &'a mut LruCache<Hash, Arc<Quorum>> {
        caches
            .entry(params.llmq_type)
            .or_insert_with(|| LruCache::new(params.signing_active_quorum_count + 1))
    }

    /// The quorum committed at `quorum_hash`, read through the cache.
    pub fn get_quorum(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> Option<Arc<Quorum>> {
        let params = llmq_params(llmq_type);
        {
            let mut caches = self.caches.lock().unwrap();
            if let Some(quorum) = self.cache_for(&mut caches, params).get(quorum_hash) {
                return Some(Arc::clone(quorum));
            }
        }
        // rebuild from the persisted mined commitment
        let mined = self
            .db
            .mined_commitments(llmq_type)
            .ok()?
            .into_iter()
            .find(|m| m.commitment.quorum_hash == *quorum_hash)?;
        let anchor = self.chain.block_by_hash(quorum_hash)?;
        let members = self.members_at(params, &anchor).ok()?;
        if members.len() != params.size {
            return None;
        }
        let quorum = Arc::new(self.materialize(params, mined.commitment, &anchor, members).ok()?);
        let mut caches = self.caches.lock().unwrap();
        self.cache_for(&mut caches, params).insert(*quorum_hash, Arc::clone(&quorum));
        Some(quorum)
    }

    /// The `count` most recent quorums of a type, newest first.
    pub fn scan_quorums(&self, llmq_type: LlmqType, count: usize) -> Vec<Arc<Quorum>> {
        let mined = match self.db.mined_commitments(llmq_type) {
            Ok(mined) => mined,
            Err(e) => {
                warn!("failed to scan mined commitments: {}", e);
                return Vec::new();
            }
        };
        mined
            .iter()
            .rev()
            .take(count)
            .filter_map(|m| self.get_quorum(llmq_type, &m.commitment.quorum_hash))
            .collect()
    }

    /// Shares and recovered sigs are only accepted from recent
    /// quorums; one extra is allowed to smooth the hand-over to a new
    /// quorum.
    pub fn is_quorum_active(&self, llmq_type: LlmqType, quorum_hash: &Hash) -> bool {
        let params = llmq_params(llmq_type);
        self.scan_quorums(llmq_type, params.signing_active_quorum_count + 1)
            .iter()
            .any(|q| q.quorum_hash == *quorum_hash)
    }

    /// Drop quorums whose anchors were reorged away. Returns their
    /// hashes so bound signing state can be failed.
    pub fn handle_reorg(&self, new_tip: &BlockInfo) -> Vec<(LlmqType, Hash)> {
        let mut evicted = Vec::new();
        for llmq_type in self.config.enabled_types.clone() {
            match self.db.remove_mined_commitments_above(llmq_type, new_tip.height) {
                Ok(hashes) => {
                    let mut caches = self.caches.lock().unwrap();
                    let params = llmq_params(llmq_type);
                    let cache = self.cache_for(&mut caches, params);
                    for hash in hashes {
                        cache.remove(&hash);
                        debug!("evicted reorged quorum {}", hex::encode(hash));
                        evicted.push((llmq_type, hash));
                    }
                }
                Err(e) => warn!("reorg cleanup failed for {:?}: {}", llmq_type, e),
            }
        }
        evicted
    }
}
