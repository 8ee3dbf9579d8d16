//! Shared consensus types for the Ferrite Coin masternode quorum subsystem.

use serde::{Deserialize, Serialize};

pub mod encode;
pub mod masternode;
pub mod messages;
pub mod params;
pub mod snapshot;

use encode::{Decodable, Encodable, EncodeError};
use std::io::{Read, Write};

/// 32-byte hash, the node's standard double-SHA-256 output.
pub type Hash = [u8; 32];

/// The all-zero hash, used as a sentinel for "no block" / "no tx".
pub const NULL_HASH: Hash = [0u8; 32];

/// Represents a reference to a specific transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction ID (hash) of the transaction containing the output.
    pub txid: Hash,
    /// The index of the output within that transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.txid.consensus_encode(w)?;
        len += self.vout.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(OutPoint {
            txid: Hash::consensus_decode(r)?,
            vout: u32::consensus_decode(r)?,
        })
    }
}

/// A transaction input as the quorum subsystem sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output as the quorum subsystem sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// The subset of a transaction the lock engine operates on.
///
/// Block validation and script execution live outside this subsystem;
/// only the identity and the spent outpoints matter here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// The transaction id: double-SHA-256 of the consensus encoding.
    pub fn txid(&self) -> Hash {
        encode::hash_encodable(self)
    }
}

impl Encodable for TxInput {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.prevout.consensus_encode(w)?;
        len += self.script_sig.consensus_encode(w)?;
        len += self.sequence.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for TxInput {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(TxInput {
            prevout: OutPoint::consensus_decode(r)?,
            script_sig: Vec::<u8>::consensus_decode(r)?,
            sequence: u32::consensus_decode(r)?,
        })
    }
}

impl Encodable for TxOutput {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.value.consensus_encode(w)?;
        len += self.script_pubkey.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for TxOutput {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(TxOutput {
            value: u64::consensus_decode(r)?,
            script_pubkey: Vec::<u8>::consensus_decode(r)?,
        })
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = self.version.consensus_encode(w)?;
        len += self.inputs.consensus_encode(w)?;
        len += self.outputs.consensus_encode(w)?;
        len += self.lock_time.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        Ok(Transaction {
            version: u32::consensus_decode(r)?,
            inputs: Vec::<TxInput>::consensus_decode(r)?,
            outputs: Vec::<TxOutput>::consensus_decode(r)?,
            lock_time: u32::consensus_decode(r)?,
        })
    }
}
