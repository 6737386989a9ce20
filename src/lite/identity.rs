//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The identity capability: ed25519 keypairs used to claim usernames
//! and sign service publications.
//!
//! This is deliberately independent of the `peerId`/`secret` credential
//! issued by `/register`; the two schemes are orthogonal and an
//! application may use either or both.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::{common::Result, error::ClientError};

/// An ed25519 keypair with both halves base64-encoded.
/// The private key never leaves the local side.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub public_key: String,
    pub private_key: String,
}

/// The crypto operations the library needs. A host can substitute its
/// own implementation (a hardware key, a polyfill); [`Ed25519Identity`]
/// is the default.
pub trait Identity: Send + Sync {
    fn generate_keypair(&self) -> Result<Keypair>;
    fn sign(&self, private_key: &str, message: &str) -> Result<String>;
    fn verify(&self, public_key: &str, message: &str, signature: &str) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Identity;

impl Identity for Ed25519Identity {
    fn generate_keypair(&self) -> Result<Keypair> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Ok(Keypair {
            public_key: BASE64.encode(signing_key.verifying_key().to_bytes()),
            private_key: BASE64.encode(signing_key.to_bytes()),
        })
    }

    fn sign(&self, private_key: &str, message: &str) -> Result<String> {
        let signing_key = decode_signing_key(private_key)?;
        let signature = signing_key.sign(message.as_bytes());
        Ok(BASE64.encode(signature.to_bytes()))
    }

    fn verify(&self, public_key: &str, message: &str, signature: &str) -> Result<bool> {
        let verifying_key = decode_verifying_key(public_key)?;
        let signature_bytes = decode_base64(signature, "signature")?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| ClientError::Validation("bad signature length".to_string()))?;
        Ok(verifying_key.verify(message.as_bytes(), &signature).is_ok())
    }
}

fn decode_base64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| ClientError::Validation(format!("bad base64 in {}", what)).into())
}

/// Key material may arrive base64- or hex-encoded; accept either.
fn decode_key_material(value: &str, what: &str) -> Result<Vec<u8>> {
    if let Ok(bytes) = BASE64.decode(value) {
        return Ok(bytes);
    }
    hex::decode(value)
        .map_err(|_| ClientError::Validation(format!("bad base64/hex in {}", what)).into())
}

fn decode_signing_key(private_key: &str) -> Result<SigningKey> {
    let bytes = decode_key_material(private_key, "private key")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ClientError::Validation("bad private key length".to_string()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn decode_verifying_key(public_key: &str) -> Result<VerifyingKey> {
    let bytes = decode_key_material(public_key, "public key")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ClientError::Validation("bad public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| ClientError::Validation("bad public key".to_string()).into())
}

/// Canonical message signed to claim a username.
/// The server recomputes it and enforces timestamp drift.
pub fn claim_message(username: &str, unix_millis: u64) -> String {
    format!("claim:{}:{}", username, unix_millis)
}

/// Canonical message signed to publish a service under a username.
pub fn publish_message(username: &str, service_fqn: &str, unix_millis: u64) -> String {
    format!("publish:{}:{}:{}", username, service_fqn, unix_millis)
}
