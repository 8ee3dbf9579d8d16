//! Consensus wire encoding: little-endian integers, compact-size
//! lengths, and the dynamic bitset.
//!
//! This is the encoding that sign hashes, request ids and commitment
//! hashes are computed over, so it is written out explicitly instead
//! of going through serde. Storage values use bincode separately.

use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use thiserror::Error;

use crate::Hash;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("non-canonical compact size")]
    NonCanonicalCompactSize,
    #[error("oversized collection: {0} entries")]
    OversizedCollection(u64),
    #[error("invalid BLS point encoding")]
    InvalidBlsPoint,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Collections larger than this are rejected outright while decoding.
const MAX_COLLECTION_LEN: u64 = 1_000_000;

pub trait Encodable {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error>;
}

pub trait Decodable: Sized {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError>;
}

/// Encode a value into a fresh byte vector.
pub fn serialize<T: Encodable>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value
        .consensus_encode(&mut buf)
        .expect("writing to a Vec cannot fail");
    buf
}

/// Decode a value from a byte slice, requiring full consumption.
pub fn deserialize<T: Decodable>(mut bytes: &[u8]) -> Result<T, EncodeError> {
    let value = T::consensus_decode(&mut bytes)?;
    if !bytes.is_empty() {
        return Err(EncodeError::InvalidPayload(format!(
            "{} trailing bytes",
            bytes.len()
        )));
    }
    Ok(value)
}

/// Double-SHA-256, the node's standard hash.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Double-SHA-256 over the consensus encoding of a value.
pub fn hash_encodable<T: Encodable>(value: &T) -> Hash {
    let mut hw = HashWriter::new();
    value
        .consensus_encode(&mut hw)
        .expect("hash writer cannot fail");
    hw.finalize()
}

/// An `io::Write` sink feeding SHA-256, finalized as a double hash.
pub struct HashWriter {
    hasher: Sha256,
}

impl HashWriter {
    pub fn new() -> Self {
        HashWriter { hasher: Sha256::new() }
    }

    pub fn finalize(self) -> Hash {
        let first = self.hasher.finalize();
        Sha256::digest(first).into()
    }
}

impl Default for HashWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn write_compact_size<W: Write>(w: &mut W, n: u64) -> Result<usize, std::io::Error> {
    if n < 0xfd {
        w.write_all(&[n as u8])?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_all(&[0xfd])?;
        w.write_all(&(n as u16).to_le_bytes())?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_all(&[0xfe])?;
        w.write_all(&(n as u32).to_le_bytes())?;
        Ok(5)
    } else {
        w.write_all(&[0xff])?;
        w.write_all(&n.to_le_bytes())?;
        Ok(9)
    }
}

pub fn read_compact_size<R: Read>(r: &mut R) -> Result<u64, EncodeError> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    let value = match tag[0] {
        0xfd => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b)?;
            let v = u16::from_le_bytes(b) as u64;
            if v < 0xfd {
                return Err(EncodeError::NonCanonicalCompactSize);
            }
            v
        }
        0xfe => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            let v = u32::from_le_bytes(b) as u64;
            if v <= 0xffff {
                return Err(EncodeError::NonCanonicalCompactSize);
            }
            v
        }
        0xff => {
            let mut b = [0u8; 8];
            r.read_exact(&mut b)?;
            let v = u64::from_le_bytes(b);
            if v <= 0xffff_ffff {
                return Err(EncodeError::NonCanonicalCompactSize);
            }
            v
        }
        n => n as u64,
    };
    Ok(value)
}

macro_rules! impl_int_encodable {
    ($ty:ty) => {
        impl Encodable for $ty {
            fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
                let bytes = self.to_le_bytes();
                w.write_all(&bytes)?;
                Ok(bytes.len())
            }
        }

        impl Decodable for $ty {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                r.read_exact(&mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }
    };
}

impl_int_encodable!(u8);
impl_int_encodable!(u16);
impl_int_encodable!(u32);
impl_int_encodable!(u64);
impl_int_encodable!(i16);
impl_int_encodable!(i32);

macro_rules! impl_array_encodable {
    ($size:expr) => {
        impl Encodable for [u8; $size] {
            fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
                w.write_all(self)?;
                Ok($size)
            }
        }

        impl Decodable for [u8; $size] {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
                let mut bytes = [0u8; $size];
                r.read_exact(&mut bytes)?;
                Ok(bytes)
            }
        }
    };
}

impl_array_encodable!(32);
impl_array_encodable!(48);
impl_array_encodable!(96);

impl Encodable for Vec<u8> {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = write_compact_size(w, self.len() as u64)?;
        w.write_all(self)?;
        len += self.len();
        Ok(len)
    }
}

impl Decodable for Vec<u8> {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let n = read_compact_size(r)?;
        if n > MAX_COLLECTION_LEN {
            return Err(EncodeError::OversizedCollection(n));
        }
        let mut buf = vec![0u8; n as usize];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl Encodable for String {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = write_compact_size(w, self.len() as u64)?;
        w.write_all(self.as_bytes())?;
        len += self.len();
        Ok(len)
    }
}

impl Encodable for &str {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let mut len = write_compact_size(w, self.len() as u64)?;
        w.write_all(self.as_bytes())?;
        len += self.len();
        Ok(len)
    }
}

macro_rules! impl_vec_encodable {
    ($ty:ty) => {
        impl Encodable for Vec<$ty> {
            fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
                let mut len = write_compact_size(w, self.len() as u64)?;
                for item in self {
                    len += item.consensus_encode(w)?;
                }
                Ok(len)
            }
        }

        impl Decodable for Vec<$ty> {
            fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
                let n = read_compact_size(r)?;
                if n > MAX_COLLECTION_LEN {
                    return Err(EncodeError::OversizedCollection(n));
                }
                let mut items = Vec::with_capacity(n.min(1024) as usize);
                for _ in 0..n {
                    items.push(<$ty>::consensus_decode(r)?);
                }
                Ok(items)
            }
        }
    };
}

impl_vec_encodable!(Hash);
impl_vec_encodable!(u32);
impl_vec_encodable!(crate::OutPoint);
impl_vec_encodable!(crate::TxInput);
impl_vec_encodable!(crate::TxOutput);
impl_vec_encodable!(Vec<u8>);

/// The dynamic bitset: compact-size bit count, then `ceil(n / 8)`
/// bytes little-endian with unused trailing bits zero.
pub struct DynBitSet<'a>(pub &'a [bool]);

impl Encodable for DynBitSet<'_> {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        let bits = self.0;
        let mut len = write_compact_size(w, bits.len() as u64)?;
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        w.write_all(&bytes)?;
        len += bytes.len();
        Ok(len)
    }
}

pub fn read_dyn_bitset<R: Read>(r: &mut R) -> Result<Vec<bool>, EncodeError> {
    let n = read_compact_size(r)?;
    if n > MAX_COLLECTION_LEN {
        return Err(EncodeError::OversizedCollection(n));
    }
    let n = n as usize;
    let mut bytes = vec![0u8; (n + 7) / 8];
    r.read_exact(&mut bytes)?;
    let mut bits = Vec::with_capacity(n);
    for i in 0..n {
        bits.push(bytes[i / 8] & (1 << (i % 8)) != 0);
    }
    // unused trailing bits must be zero
    for i in n..bytes.len() * 8 {
        if bytes[i / 8] & (1 << (i % 8)) != 0 {
            return Err(EncodeError::InvalidPayload("dirty bitset padding".into()));
        }
    }
    Ok(bits)
}

/// BLS public keys travel as 48-byte compressed G1 points.
impl Encodable for threshold_crypto::PublicKey {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        w.write_all(&self.to_bytes())?;
        Ok(48)
    }
}

impl Decodable for threshold_crypto::PublicKey {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let bytes = <[u8; 48]>::consensus_decode(r)?;
        threshold_crypto::PublicKey::from_bytes(bytes).map_err(|_| EncodeError::InvalidBlsPoint)
    }
}

/// BLS signatures travel as 96-byte compressed G2 points.
impl Encodable for threshold_crypto::Signature {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        w.write_all(&self.to_bytes())?;
        Ok(96)
    }
}

impl Decodable for threshold_crypto::Signature {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let bytes = <[u8; 96]>::consensus_decode(r)?;
        threshold_crypto::Signature::from_bytes(bytes).map_err(|_| EncodeError::InvalidBlsPoint)
    }
}

impl Encodable for threshold_crypto::SignatureShare {
    fn consensus_encode<W: Write>(&self, w: &mut W) -> Result<usize, std::io::Error> {
        w.write_all(&self.to_bytes())?;
        Ok(96)
    }
}

impl Decodable for threshold_crypto::SignatureShare {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, EncodeError> {
        let bytes = <[u8; 96]>::consensus_decode(r)?;
        threshold_crypto::SignatureShare::from_bytes(bytes).map_err(|_| EncodeError::InvalidBlsPoint)
    }
}

/// Verification vectors and IES ciphertexts are carried as
/// length-prefixed opaque bincode payloads; `threshold_crypto` keeps
/// the underlying point vectors private and its serde output is
/// deterministic, which is all the vvec hash derivation needs.
pub fn encode_opaque<W: Write, T: serde::Serialize>(
    w: &mut W,
    value: &T,
) -> Result<usize, std::io::Error> {
    let bytes = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    bytes.consensus_encode(w)
}

pub fn decode_opaque<R: Read, T: serde::de::DeserializeOwned>(r: &mut R) -> Result<T, EncodeError> {
    let bytes = Vec::<u8>::consensus_decode(r)?;
    bincode::deserialize(&bytes).map_err(|e| EncodeError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn double_sha256_vectors() {
        assert_eq!(
            double_sha256(b""),
            hex!("5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456")
        );
        assert_eq!(
            double_sha256(b"hello"),
            hex!("9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50")
        );
    }

    #[test]
    fn hash_writer_matches_direct() {
        let mut hw = HashWriter::new();
        hw.write_all(b"hel").unwrap();
        hw.write_all(b"lo").unwrap();
        assert_eq!(hw.finalize(), double_sha256(b"hello"));
    }

    #[test]
    fn compact_size_roundtrip() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_compact_size(&mut buf, n).unwrap();
            assert_eq!(read_compact_size(&mut buf.as_slice()).unwrap(), n);
        }
    }

    #[test]
    fn compact_size_rejects_non_canonical() {
        // 0xfc encoded with the 0xfd tag
        let buf = [0xfdu8, 0xfc, 0x00];
        assert!(matches!(
            read_compact_size(&mut buf.as_ref()),
            Err(EncodeError::NonCanonicalCompactSize)
        ));
    }

    #[test]
    fn dyn_bitset_roundtrip() {
        let bits = vec![true, false, true, true, false, false, false, false, true, true];
        let mut buf = Vec::new();
        DynBitSet(&bits).consensus_encode(&mut buf).unwrap();
        // compact size 10, then 2 bytes
        assert_eq!(buf.len(), 3);
        assert_eq!(read_dyn_bitset(&mut buf.as_slice()).unwrap(), bits);
    }

    #[test]
    fn dyn_bitset_rejects_dirty_padding() {
        // 3 bits declared but a fourth bit set in the byte
        let buf = [0x03u8, 0b0000_1000];
        assert!(read_dyn_bitset(&mut buf.as_ref()).is_err());
    }

    #[test]
    fn ints_are_little_endian() {
        assert_eq!(serialize(&0x0102_0304u32), vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(serialize(&0x0102u16), vec![0x02, 0x01]);
    }
}
