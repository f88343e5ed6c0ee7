//! Shared generators for property tests.

use crate::{secret::Secret, timestamp::Timestamp};
use bitcoin::{hashes::Hash, Amount, PubkeyHash, Txid};
use quickcheck::{Arbitrary, Gen};

pub fn bytes_32(g: &mut Gen) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for byte in &mut bytes {
        *byte = u8::arbitrary(g);
    }
    bytes
}

pub fn secret(g: &mut Gen) -> Secret {
    Secret::from(bytes_32(g))
}

pub fn timestamp(g: &mut Gen) -> Timestamp {
    Timestamp::from(u32::arbitrary(g))
}

pub fn txid(g: &mut Gen) -> Txid {
    Txid::from_slice(&bytes_32(g)).unwrap()
}

pub fn pubkey_hash(g: &mut Gen) -> PubkeyHash {
    let mut bytes = [0u8; 20];
    for byte in &mut bytes {
        *byte = u8::arbitrary(g);
    }
    PubkeyHash::from_slice(&bytes).unwrap()
}

pub fn amount(g: &mut Gen) -> Amount {
    Amount::from_sat(u64::arbitrary(g))
}
