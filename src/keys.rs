//! Secret key handling.

use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::error::{Error, Result};

/// Parse a hex secret key into a signing keypair.
pub fn keypair(secret_hex: &str) -> Result<Keypair> {
    let bytes = hex::decode(secret_hex.trim())
        .map_err(|e| Error::InvalidSecretKey(format!("not hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidSecretKey(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let secp = Secp256k1::signing_only();
    Keypair::from_seckey_slice(&secp, &bytes).map_err(|e| Error::InvalidSecretKey(e.to_string()))
}

/// Hex x-only public key for a hex secret key.
pub fn public_key(secret_hex: &str) -> Result<String> {
    let (xonly, _parity) = keypair(secret_hex)?.x_only_public_key();
    Ok(hex::encode(xonly.serialize()))
}

/// Fresh random secret key as hex.
pub fn generate() -> String {
    let secret = SecretKey::new(&mut rand::thread_rng());
    hex::encode(secret.secret_bytes())
}
