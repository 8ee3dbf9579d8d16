//! BLS threshold cryptography for the Ferrite Coin quorum subsystem.

pub mod batch_verifier;
pub mod bls;

pub use batch_verifier::BatchVerifier;
