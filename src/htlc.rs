//! The hash time locked contract on the foreign chain.
//!
//! Redeem script template, both legacy P2SH spend paths and the preimage
//! extractor that recovers a revealed secret from a claim transaction.
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <secret_hash> OP_EQUALVERIFY OP_DUP OP_HASH160 <redeem_pkh>
//! OP_ELSE
//!     <expiry> OP_CHECKLOCKTIMEVERIFY OP_DROP OP_DUP OP_HASH160 <refund_pkh>
//! OP_ENDIF
//! OP_EQUALVERIFY OP_CHECKSIG
//! ```

use crate::{
    chain::{Network, RawTransaction},
    secret::{Secret, SecretHash},
    trade::{HtlcParams, TradeKey},
};
use anyhow::Result;
use bitcoin::{
    blockdata::{
        opcodes,
        script::{Builder, Instruction},
    },
    hashes::{hash160, Hash},
    secp256k1::{Message, Secp256k1},
    Address, Amount, OutPoint, PubkeyHash, Script, SigHashType, Transaction, TxIn, TxOut,
};

/// Sequence number that keeps the absolute lock time enforceable.
const NON_FINAL_SEQUENCE: u32 = 0xFFFF_FFFE;

pub fn redeem_script(params: &HtlcParams, secret_hash: &SecretHash) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_IF)
        .push_opcode(opcodes::all::OP_SHA256)
        .push_slice(&secret_hash.into_inner())
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&params.redeem_pubkey_hash[..])
        .push_opcode(opcodes::all::OP_ELSE)
        .push_int(i64::from(params.expiry.as_secs()))
        .push_opcode(opcodes::all::OP_CLTV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&params.refund_pubkey_hash[..])
        .push_opcode(opcodes::all::OP_ENDIF)
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .into_script()
}

pub fn address(params: &HtlcParams, secret_hash: &SecretHash, network: Network) -> Address {
    Address::p2sh(&redeem_script(params, secret_hash), network.as_bitcoin())
}

pub fn pubkey_hash(key: &TradeKey) -> PubkeyHash {
    let hash = hash160::Hash::hash(&key.public_key().to_bytes());
    PubkeyHash::from_slice(&hash.into_inner()).expect("hash160 digest is pubkey hash sized")
}

/// Claims the counterparty contract, revealing the secret in the script_sig.
///
/// `key` must be the contract's redeem identity.
#[allow(clippy::too_many_arguments)]
pub fn build_claim(
    key: &TradeKey,
    params: &HtlcParams,
    secret_hash: &SecretHash,
    secret: Secret,
    outpoint: OutPoint,
    value: Amount,
    destination: &Address,
    fee: Amount,
) -> Result<Transaction> {
    build_spend(
        key,
        params,
        secret_hash,
        SpendPath::Claim { secret },
        outpoint,
        value,
        destination,
        fee,
    )
}

/// Sends the own contract back to us once its expiry has passed on chain.
///
/// `key` must be the contract's refund identity.
pub fn build_refund(
    key: &TradeKey,
    params: &HtlcParams,
    secret_hash: &SecretHash,
    outpoint: OutPoint,
    value: Amount,
    destination: &Address,
    fee: Amount,
) -> Result<Transaction> {
    build_spend(
        key,
        params,
        secret_hash,
        SpendPath::Refund,
        outpoint,
        value,
        destination,
        fee,
    )
}

enum SpendPath {
    Claim { secret: Secret },
    Refund,
}

#[allow(clippy::too_many_arguments)]
fn build_spend(
    key: &TradeKey,
    params: &HtlcParams,
    secret_hash: &SecretHash,
    path: SpendPath,
    outpoint: OutPoint,
    value: Amount,
    destination: &Address,
    fee: Amount,
) -> Result<Transaction> {
    let expected_identity = match path {
        SpendPath::Claim { .. } => params.redeem_pubkey_hash,
        SpendPath::Refund => params.refund_pubkey_hash,
    };
    anyhow::ensure!(
        pubkey_hash(key) == expected_identity,
        "trade key does not match the contract identity for this spend path"
    );
    anyhow::ensure!(
        value > fee,
        "contract value {} does not cover the fee {}",
        value,
        fee
    );

    let (lock_time, sequence) = match path {
        SpendPath::Claim { .. } => (0, 0xFFFF_FFFF),
        SpendPath::Refund => (params.expiry.as_secs(), NON_FINAL_SEQUENCE),
    };

    let script = redeem_script(params, secret_hash);
    let mut transaction = Transaction {
        version: 2,
        lock_time,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: Script::new(),
            sequence,
            witness: Vec::new(),
        }],
        output: vec![TxOut {
            value: (value - fee).as_sat(),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let sighash = transaction.signature_hash(0, &script, SigHashType::All.as_u32());
    let secp = Secp256k1::signing_only();
    let signature = secp.sign(&Message::from_slice(&sighash[..])?, &key.secret_key());
    let mut signature_bytes = signature.serialize_der().to_vec();
    #[allow(clippy::cast_possible_truncation)]
    signature_bytes.push(SigHashType::All.as_u32() as u8);

    let unlocking = Builder::new()
        .push_slice(&signature_bytes)
        .push_slice(&key.public_key().to_bytes());
    let unlocking = match path {
        SpendPath::Claim { secret } => unlocking.push_slice(secret.as_raw()).push_int(1),
        SpendPath::Refund => unlocking.push_int(0),
    };
    transaction.input[0].script_sig = unlocking.push_slice(script.as_bytes()).into_script();

    Ok(transaction)
}

/// Scans raw transactions for a spend of the given P2SH contract address
/// and returns the first preimage that actually hashes to `secret_hash`.
///
/// Pure over its inputs. Undecodable transactions and unparseable scripts
/// are skipped. Refund spends carry no 32-byte push that validates and fall
/// through to `None`.
pub fn extract_secret(
    address: &Address,
    transactions: &[RawTransaction],
    secret_hash: &SecretHash,
) -> Option<Secret> {
    transactions
        .iter()
        .filter_map(|raw| raw.parse().ok())
        .find_map(|transaction| extract_from_transaction(address, &transaction, secret_hash))
}

fn extract_from_transaction(
    address: &Address,
    transaction: &Transaction,
    secret_hash: &SecretHash,
) -> Option<Secret> {
    transaction.input.iter().find_map(|input| {
        let pushes = script_pushes(&input.script_sig)?;

        // A P2SH spend pushes the serialized contract last.
        let contract = Script::from(pushes.last()?.clone());
        if Address::p2sh(&contract, address.network) != *address {
            return None;
        }

        pushes
            .iter()
            .map(Vec::as_slice)
            .chain(input.witness.iter().map(Vec::as_slice))
            .find_map(|candidate| validate_candidate(candidate, secret_hash))
    })
}

fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => pushes.push(bytes.to_vec()),
            Ok(Instruction::Op(_)) => {}
            Err(_) => return None,
        }
    }
    Some(pushes)
}

fn validate_candidate(candidate: &[u8], secret_hash: &SecretHash) -> Option<Secret> {
    let secret = Secret::from_vec(candidate).ok()?;
    if SecretHash::new(secret) == *secret_hash {
        Some(secret)
    } else {
        None
    }
}
