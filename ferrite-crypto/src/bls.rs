//! BLS threshold operations on top of `threshold_crypto`.
//!
//! Members are identified by their index in the quorum's ordered
//! member list; all polynomial evaluation goes through
//! `threshold_crypto`'s convention of evaluating at `index + 1`, so
//! the index doubles as the BLS id everywhere (share derivation,
//! share verification and signature recovery all agree).

use std::collections::BTreeMap;
use thiserror::Error;
use threshold_crypto::ff::{Field, PrimeField, PrimeFieldRepr};
use threshold_crypto::poly::{Commitment, Poly};
use threshold_crypto::{
    Ciphertext, Fr, PublicKey, PublicKeySet, PublicKeyShare, SecretKey, SecretKeyShare, Signature,
    SignatureShare,
};

use ferrite_shared_types::encode::double_sha256;
use ferrite_shared_types::Hash;

#[derive(Error, Debug)]
pub enum BlsError {
    #[error("not enough signature shares: {got} < {need}")]
    NotEnoughShares { got: usize, need: usize },
    #[error("signature share combination failed: {0}")]
    Combine(String),
    #[error("invalid field element encoding")]
    InvalidFieldElement,
    #[error("invalid point encoding")]
    InvalidPoint,
}

/// A member's random polynomial for one DKG session.
///
/// The polynomial has degree `threshold - 1`, so its commitment (the
/// verification vector) carries `threshold` coefficients.
pub struct SecretContribution {
    poly: Poly,
}

impl SecretContribution {
    pub fn random(threshold: usize) -> Self {
        assert!(threshold >= 1, "threshold must be at least 1");
        SecretContribution {
            poly: Poly::random(threshold - 1, &mut rand::thread_rng()),
        }
    }

    /// The public commitment to the polynomial.
    pub fn verification_vector(&self) -> Commitment {
        self.poly.commitment()
    }

    /// The secret share destined for the member at `member_index`.
    pub fn share_for(&self, member_index: usize) -> Fr {
        self.poly.evaluate(member_index as u64 + 1)
    }
}

/// Serialize a field element as 32 big-endian bytes.
pub fn fr_to_bytes(fr: &Fr) -> [u8; 32] {
    let mut out = [0u8; 32];
    fr.into_repr()
        .write_be(&mut out[..])
        .expect("Fr fits in 32 bytes");
    out
}

/// Parse a field element from 32 big-endian bytes.
pub fn fr_from_bytes(bytes: &[u8; 32]) -> Result<Fr, BlsError> {
    let mut repr = <Fr as PrimeField>::Repr::default();
    repr.read_be(&bytes[..])
        .map_err(|_| BlsError::InvalidFieldElement)?;
    Fr::from_repr(repr).map_err(|_| BlsError::InvalidFieldElement)
}

/// Wrap an aggregated field element as a usable secret key share.
pub fn secret_key_share_from_fr(fr: &Fr) -> SecretKeyShare {
    let mut fr = *fr;
    SecretKeyShare::from_mut(&mut fr)
}

/// Check one received share against the sender's verification vector:
/// the share's public image must equal the vector evaluated at the
/// recipient's id.
pub fn verify_contribution_share(vvec: &Commitment, member_index: usize, share: &Fr) -> bool {
    let expected = PublicKeySet::from(vvec.clone()).public_key_share(member_index);
    expected == secret_key_share_from_fr(share).public_key_share()
}

/// Sum the verification vectors of all valid contributors.
pub fn aggregate_verification_vectors<'a>(
    vvecs: impl IntoIterator<Item = &'a Commitment>,
) -> Option<Commitment> {
    let mut iter = vvecs.into_iter();
    let first = iter.next()?.clone();
    Some(iter.fold(first, |acc, c| acc + c))
}

/// Sum the secret shares received from all valid contributors into
/// the member's final share of the quorum key.
pub fn aggregate_secret_shares<'a>(shares: impl IntoIterator<Item = &'a Fr>) -> Option<Fr> {
    let mut iter = shares.into_iter();
    let mut acc = *iter.next()?;
    for share in iter {
        acc.add_assign(share);
    }
    Some(acc)
}

/// The quorum public key: the aggregated vector evaluated at zero.
pub fn quorum_public_key(vvec: &Commitment) -> PublicKey {
    PublicKeySet::from(vvec.clone()).public_key()
}

/// The public key share of the member at `member_index` under the
/// aggregated verification vector.
pub fn public_key_share(vvec: &Commitment, member_index: usize) -> PublicKeyShare {
    PublicKeySet::from(vvec.clone()).public_key_share(member_index)
}

/// Hash of the valid members' verification vectors, in member order.
pub fn verification_vectors_hash<'a>(vvecs: impl IntoIterator<Item = &'a Commitment>) -> Hash {
    let collected: Vec<&Commitment> = vvecs.into_iter().collect();
    let bytes = bincode::serialize(&collected).expect("commitment serialization cannot fail");
    double_sha256(&bytes)
}

/// Recover the threshold signature from at least `threshold` shares,
/// keyed by member index.
pub fn recover_signature(
    vvec: &Commitment,
    threshold: usize,
    shares: &BTreeMap<usize, SignatureShare>,
) -> Result<Signature, BlsError> {
    if shares.len() < threshold {
        return Err(BlsError::NotEnoughShares { got: shares.len(), need: threshold });
    }
    PublicKeySet::from(vvec.clone())
        .combine_signatures(shares.iter().map(|(i, s)| (*i, s)))
        .map_err(|e| BlsError::Combine(e.to_string()))
}

/// IES-encrypt a secret share to a recipient's operator key.
pub fn encrypt_share(recipient: &PublicKey, share: &Fr) -> Ciphertext {
    recipient.encrypt(fr_to_bytes(share))
}

/// Decrypt and parse a secret share addressed to us. Returns an error
/// for broken ciphertexts and for plaintexts that are not a valid
/// field element; both are complaint-worthy.
pub fn decrypt_share(operator_key: &SecretKey, ct: &Ciphertext) -> Result<Fr, BlsError> {
    let plain = operator_key.decrypt(ct).ok_or(BlsError::InvalidPoint)?;
    let bytes: [u8; 32] = plain
        .as_slice()
        .try_into()
        .map_err(|_| BlsError::InvalidFieldElement)?;
    fr_from_bytes(&bytes)
}

/// Convert a signature share to a plain signature for batch paths.
pub fn share_as_signature(share: &SignatureShare) -> Result<Signature, BlsError> {
    Signature::from_bytes(share.to_bytes()).map_err(|_| BlsError::InvalidPoint)
}

/// Convert a public key share to a plain public key for batch paths.
pub fn pk_share_as_public_key(share: &PublicKeyShare) -> Result<PublicKey, BlsError> {
    PublicKey::from_bytes(share.to_bytes()).map_err(|_| BlsError::InvalidPoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a full DKG among `n` members and return the aggregated
    /// verification vector and every member's final secret share.
    fn run_dkg(n: usize, threshold: usize) -> (Commitment, Vec<SecretKeyShare>) {
        let contributions: Vec<SecretContribution> =
            (0..n).map(|_| SecretContribution::random(threshold)).collect();

        let vvecs: Vec<Commitment> =
            contributions.iter().map(|c| c.verification_vector()).collect();
        let agg_vvec = aggregate_verification_vectors(vvecs.iter()).unwrap();

        let mut member_shares = Vec::new();
        for j in 0..n {
            let received: Vec<Fr> = contributions.iter().map(|c| c.share_for(j)).collect();
            for (i, share) in received.iter().enumerate() {
                assert!(verify_contribution_share(&vvecs[i], j, share));
            }
            let total = aggregate_secret_shares(received.iter()).unwrap();
            member_shares.push(secret_key_share_from_fr(&total));
        }
        (agg_vvec, member_shares)
    }

    #[test]
    fn dkg_produces_working_threshold_key() {
        let (vvec, shares) = run_dkg(4, 3);
        let quorum_pk = quorum_public_key(&vvec);
        let msg = b"ferrite quorum message";

        let mut sig_shares = BTreeMap::new();
        for idx in [0usize, 2, 3] {
            let share = shares[idx].sign(msg);
            assert!(public_key_share(&vvec, idx).verify(&share, msg));
            sig_shares.insert(idx, share);
        }

        let sig = recover_signature(&vvec, 3, &sig_shares).unwrap();
        assert!(quorum_pk.verify(&sig, msg));
    }

    #[test]
    fn recovery_is_signer_set_independent() {
        let (vvec, shares) = run_dkg(5, 3);
        let msg = b"same message";

        let set_a: BTreeMap<usize, SignatureShare> =
            [0usize, 1, 2].iter().map(|&i| (i, shares[i].sign(msg))).collect();
        let set_b: BTreeMap<usize, SignatureShare> =
            [1usize, 3, 4].iter().map(|&i| (i, shares[i].sign(msg))).collect();

        let sig_a = recover_signature(&vvec, 3, &set_a).unwrap();
        let sig_b = recover_signature(&vvec, 3, &set_b).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn recovery_needs_threshold_shares() {
        let (vvec, shares) = run_dkg(4, 3);
        let msg = b"short";
        let few: BTreeMap<usize, SignatureShare> =
            [0usize, 1].iter().map(|&i| (i, shares[i].sign(msg))).collect();
        assert!(matches!(
            recover_signature(&vvec, 3, &few),
            Err(BlsError::NotEnoughShares { got: 2, need: 3 })
        ));
    }

    #[test]
    fn bad_share_fails_vvec_check() {
        let c = SecretContribution::random(3);
        let vvec = c.verification_vector();
        let good = c.share_for(1);
        assert!(verify_contribution_share(&vvec, 1, &good));
        // right share, wrong recipient index
        assert!(!verify_contribution_share(&vvec, 2, &good));
        let mut tampered = good;
        tampered.add_assign(&Fr::one());
        assert!(!verify_contribution_share(&vvec, 1, &tampered));
    }

    #[test]
    fn share_encryption_roundtrip() {
        let operator = SecretKey::random();
        let c = SecretContribution::random(2);
        let share = c.share_for(0);

        let ct = encrypt_share(&operator.public_key(), &share);
        assert!(ct.verify());
        let decrypted = decrypt_share(&operator, &ct).unwrap();
        assert_eq!(fr_to_bytes(&share), fr_to_bytes(&decrypted));

        let wrong_key = SecretKey::random();
        assert!(decrypt_share(&wrong_key, &ct).is_err());
    }

    #[test]
    fn fr_bytes_roundtrip() {
        let c = SecretContribution::random(2);
        let fr = c.share_for(7);
        let parsed = fr_from_bytes(&fr_to_bytes(&fr)).unwrap();
        assert_eq!(fr_to_bytes(&fr), fr_to_bytes(&parsed));
        // the field modulus is not a valid encoding's worth of all-ones
        assert!(fr_from_bytes(&[0xff; 32]).is_err());
    }

    #[test]
    fn vvec_hash_is_order_sensitive() {
        let a = SecretContribution::random(2).verification_vector();
        let b = SecretContribution::random(2).verification_vector();
        assert_ne!(
            verification_vectors_hash([&a, &b]),
            verification_vectors_hash([&b, &a])
        );
    }
}
