//! Wallet key material: ed25519 keypairs, Cardano-style enterprise addresses
//! and the COSE_Sign1 signatures the coordinator verifies for terms acceptance
//! and consolidation.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use crate::error::MinerError;

/// Mainnet enterprise address header: payment key hash, no stake part.
const ADDRESS_HEADER: u8 = 0x61;
const KEY_HASH_LEN: usize = 28;

/// Freshly generated key material, hex-encoded for persistence.
#[derive(Debug, Clone)]
pub struct GeneratedKeys {
    pub address: String,
    pub pubkey: String,
    pub signing_key: String,
}

pub fn generate() -> Result<GeneratedKeys, MinerError> {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();

    let address = encode_address(verifying_key.as_bytes())?;
    Ok(GeneratedKeys {
        address,
        pubkey: hex::encode(verifying_key.as_bytes()),
        signing_key: hex::encode(signing_key.to_bytes()),
    })
}

fn encode_address(pubkey: &[u8]) -> Result<String, MinerError> {
    let mut hasher =
        Blake2bVar::new(KEY_HASH_LEN).map_err(|e| MinerError::Signing(e.to_string()))?;
    hasher.update(pubkey);
    let mut key_hash = [0u8; KEY_HASH_LEN];
    hasher
        .finalize_variable(&mut key_hash)
        .map_err(|e| MinerError::Signing(e.to_string()))?;

    let mut payload = Vec::with_capacity(1 + KEY_HASH_LEN);
    payload.push(ADDRESS_HEADER);
    payload.extend_from_slice(&key_hash);

    let hrp = bech32::Hrp::parse("addr").map_err(|e| MinerError::Signing(e.to_string()))?;
    bech32::encode::<bech32::Bech32>(hrp, &payload).map_err(|e| MinerError::Signing(e.to_string()))
}

fn decode_address(address: &str) -> Result<Vec<u8>, MinerError> {
    let (_, payload) =
        bech32::decode(address).map_err(|e| MinerError::Signing(format!("bad address: {}", e)))?;
    Ok(payload)
}

fn signing_key_from_hex(signing_key_hex: &str) -> Result<SigningKey, MinerError> {
    let bytes = hex::decode(signing_key_hex)
        .map_err(|e| MinerError::Signing(format!("bad signing key: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MinerError::Signing("signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Produce the hex-encoded COSE_Sign1 structure over `message`, bound to the
/// wallet address in the protected header. The coordinator checks this both
/// for terms acceptance at registration and for consolidation requests.
pub fn cose_sign1(
    signing_key_hex: &str,
    address: &str,
    message: &str,
) -> Result<String, MinerError> {
    let signing_key = signing_key_from_hex(signing_key_hex)?;
    let address_bytes = decode_address(address)?;
    let payload = message.as_bytes();

    let protected = encode_protected(&address_bytes);
    let sig_structure = encode_sig_structure(&protected, payload);
    let signature = signing_key.sign(&sig_structure);

    Ok(hex::encode(encode_cose_sign1(
        &protected,
        payload,
        &signature.to_bytes(),
    )))
}

// CBOR: {1: -8, "address": <bytes>}
fn encode_protected(address_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = minicbor::Encoder::new(&mut buf);
    enc.map(2)
        .and_then(|e| e.u8(1))
        .and_then(|e| e.i8(-8))
        .and_then(|e| e.str("address"))
        .and_then(|e| e.bytes(address_bytes))
        .expect("CBOR encoding into a Vec cannot fail");
    buf
}

// CBOR: ["Signature1", <protected>, b"", <payload>]
fn encode_sig_structure(protected: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = minicbor::Encoder::new(&mut buf);
    enc.array(4)
        .and_then(|e| e.str("Signature1"))
        .and_then(|e| e.bytes(protected))
        .and_then(|e| e.bytes(&[]))
        .and_then(|e| e.bytes(payload))
        .expect("CBOR encoding into a Vec cannot fail");
    buf
}

// CBOR: [<protected>, {"hashed": false}, <payload>, <signature>]
fn encode_cose_sign1(protected: &[u8], payload: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = minicbor::Encoder::new(&mut buf);
    enc.array(4)
        .and_then(|e| e.bytes(protected))
        .and_then(|e| e.map(1))
        .and_then(|e| e.str("hashed"))
        .and_then(|e| e.bool(false))
        .and_then(|e| e.bytes(payload))
        .and_then(|e| e.bytes(signature))
        .expect("CBOR encoding into a Vec cannot fail");
    buf
}
