//! Batched BLS signature verification.
//!
//! Messages sharing a sign hash are verified in aggregate: the public
//! keys are summed in G1 and the signatures in G2, and one pairing
//! check covers the whole bucket. A failing bucket falls back to
//! per-message verification so the offending sources can be scored.
//! Point sums go through `bls12_381` compressed-point round-trips,
//! since `threshold_crypto` does not expose group arithmetic.

use std::collections::{BTreeMap, BTreeSet};

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective};
use threshold_crypto::{PublicKey, Signature};

use ferrite_shared_types::Hash;

/// Upper bound on messages verified with a single aggregate check, to
/// bound the cost of the fallback when a bucket fails.
const BATCH_BUCKET_CAP: usize = 8;

struct BatchMessage<S, K> {
    source: S,
    key: K,
    sign_hash: Hash,
    sig: Signature,
    pubkey: PublicKey,
}

/// Accumulates `(source, message)` pairs and verifies them in bulk.
///
/// After `verify`, `bad_sources` holds every source that contributed
/// at least one invalid signature and `bad_messages` the keys of the
/// invalid messages themselves.
pub struct BatchVerifier<S: Clone + Ord, K: Clone + Ord> {
    messages: Vec<BatchMessage<S, K>>,
    pub bad_sources: BTreeSet<S>,
    pub bad_messages: BTreeSet<K>,
}

impl<S: Clone + Ord, K: Clone + Ord> BatchVerifier<S, K> {
    pub fn new() -> Self {
        BatchVerifier {
            messages: Vec::new(),
            bad_sources: BTreeSet::new(),
            bad_messages: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn push_message(&mut self, source: S, key: K, sign_hash: Hash, sig: Signature, pubkey: PublicKey) {
        self.messages.push(BatchMessage { source, key, sign_hash, sig, pubkey });
    }

    pub fn verify(&mut self) {
        let mut buckets: BTreeMap<Hash, Vec<usize>> = BTreeMap::new();
        for (i, msg) in self.messages.iter().enumerate() {
            buckets.entry(msg.sign_hash).or_default().push(i);
        }

        for (sign_hash, indexes) in buckets {
            for chunk in indexes.chunks(BATCH_BUCKET_CAP) {
                if chunk.len() > 1 && self.verify_aggregate(&sign_hash, chunk) {
                    continue;
                }
                for &i in chunk {
                    let msg = &self.messages[i];
                    if !msg.pubkey.verify(&msg.sig, sign_hash) {
                        self.bad_sources.insert(msg.source.clone());
                        self.bad_messages.insert(msg.key.clone());
                    }
                }
            }
        }
    }

    fn verify_aggregate(&self, sign_hash: &Hash, indexes: &[usize]) -> bool {
        let agg_pk = match aggregate_public_keys(indexes.iter().map(|&i| &self.messages[i].pubkey)) {
            Some(pk) => pk,
            None => return false,
        };
        let agg_sig = match aggregate_signatures(indexes.iter().map(|&i| &self.messages[i].sig)) {
            Some(sig) => sig,
            None => return false,
        };
        agg_pk.verify(&agg_sig, sign_hash)
    }
}

impl<S: Clone + Ord, K: Clone + Ord> Default for BatchVerifier<S, K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum public keys in G1. Sound for verification only when every
/// summed key signed the same message.
pub fn aggregate_public_keys<'a>(
    keys: impl IntoIterator<Item = &'a PublicKey>,
) -> Option<PublicKey> {
    let mut sum = G1Projective::identity();
    let mut any = false;
    for key in keys {
        let point: Option<G1Affine> = G1Affine::from_compressed(&key.to_bytes()).into();
        sum += G1Projective::from(point?);
        any = true;
    }
    if !any {
        return None;
    }
    PublicKey::from_bytes(G1Affine::from(sum).to_compressed()).ok()
}

/// Sum signatures in G2.
pub fn aggregate_signatures<'a>(
    sigs: impl IntoIterator<Item = &'a Signature>,
) -> Option<Signature> {
    let mut sum = G2Projective::identity();
    let mut any = false;
    for sig in sigs {
        let point: Option<G2Affine> = G2Affine::from_compressed(&sig.to_bytes()).into();
        sum += G2Projective::from(point?);
        any = true;
    }
    if !any {
        return None;
    }
    Signature::from_bytes(G2Affine::from(sum).to_compressed()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_shared_types::encode::double_sha256;
    use threshold_crypto::SecretKey;

    fn keyed_sig(sk: &SecretKey, msg: &Hash) -> (PublicKey, Signature) {
        (sk.public_key(), sk.sign(msg))
    }

    #[test]
    fn all_valid_batch_passes() {
        let sign_hash = double_sha256(b"batch msg");
        let mut verifier: BatchVerifier<u64, u32> = BatchVerifier::new();
        for peer in 0..5u64 {
            let sk = SecretKey::random();
            let (pk, sig) = keyed_sig(&sk, &sign_hash);
            verifier.push_message(peer, peer as u32, sign_hash, sig, pk);
        }
        verifier.verify();
        assert!(verifier.bad_sources.is_empty());
        assert!(verifier.bad_messages.is_empty());
    }

    #[test]
    fn single_bad_signature_is_isolated() {
        let sign_hash = double_sha256(b"batch msg");
        let other_hash = double_sha256(b"other msg");
        let mut verifier: BatchVerifier<u64, u32> = BatchVerifier::new();
        for peer in 0..4u64 {
            let sk = SecretKey::random();
            let (pk, sig) = keyed_sig(&sk, &sign_hash);
            verifier.push_message(peer, peer as u32, sign_hash, sig, pk);
        }
        // peer 4 signs the wrong message
        let sk = SecretKey::random();
        let (pk, sig) = keyed_sig(&sk, &other_hash);
        verifier.push_message(4, 4, sign_hash, sig, pk);

        verifier.verify();
        assert_eq!(verifier.bad_sources.into_iter().collect::<Vec<_>>(), vec![4]);
        assert_eq!(verifier.bad_messages.into_iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn distinct_sign_hashes_form_distinct_buckets() {
        let mut verifier: BatchVerifier<u64, u32> = BatchVerifier::new();
        for peer in 0..3u64 {
            let sign_hash = double_sha256(format!("msg {}", peer).as_bytes());
            let sk = SecretKey::random();
            let (pk, sig) = keyed_sig(&sk, &sign_hash);
            verifier.push_message(peer, peer as u32, sign_hash, sig, pk);
        }
        verifier.verify();
        assert!(verifier.bad_messages.is_empty());
    }

    #[test]
    fn oversized_bucket_is_chunked() {
        let sign_hash = double_sha256(b"big bucket");
        let mut verifier: BatchVerifier<u64, u32> = BatchVerifier::new();
        for peer in 0..20u64 {
            let sk = SecretKey::random();
            let (pk, sig) = keyed_sig(&sk, &sign_hash);
            verifier.push_message(peer, peer as u32, sign_hash, sig, pk);
        }
        verifier.verify();
        assert!(verifier.bad_messages.is_empty());
    }

    #[test]
    fn aggregate_of_same_message_sigs_verifies() {
        let msg = double_sha256(b"aggregate me");
        let keys: Vec<SecretKey> = (0..3).map(|_| SecretKey::random()).collect();
        let pks: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();
        let sigs: Vec<Signature> = keys.iter().map(|k| k.sign(msg)).collect();

        let agg_pk = aggregate_public_keys(pks.iter()).unwrap();
        let agg_sig = aggregate_signatures(sigs.iter()).unwrap();
        assert!(agg_pk.verify(&agg_sig, msg));
    }
}
