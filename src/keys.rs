//! Host-key and user-key blob handling.
//!
//! Key and signature blobs use the standard SSH framing: an algorithm
//! name string followed by algorithm-specific data.

// Refs:
// * https://tools.ietf.org/html/rfc8709

use crate::{compat, error::Error, wire};
use ring::signature::{self, KeyPair as _};

pub const SSH_ED25519: &str = "ssh-ed25519";

/// Splits a public-key blob into its algorithm name and key data.
pub fn parse_public_blob(blob: &[u8]) -> Result<(String, Vec<u8>), Error> {
    let mut raw = blob;
    let key_type = wire::get_string(&mut raw)?;
    let key_type = String::from_utf8(key_type)
        .map_err(|_| Error::protocol("non-utf8 key algorithm name"))?;
    let key_data = wire::get_string(&mut raw)?;
    Ok((key_type, key_data))
}

/// Builds an `ssh-ed25519` public-key blob from the raw 32-byte key.
pub fn make_public_blob(public_key: &[u8]) -> Vec<u8> {
    let mut blob = vec![];
    wire::put_cstring(&mut blob, SSH_ED25519);
    wire::put_string(&mut blob, public_key);
    blob
}

/// Builds an `ssh-ed25519` signature blob from a raw signature.
pub fn make_signature_blob(sig: &[u8]) -> Vec<u8> {
    let mut blob = vec![];
    wire::put_cstring(&mut blob, SSH_ED25519);
    wire::put_string(&mut blob, sig);
    blob
}

/// Extracts the raw signature bytes from a signature blob.
///
/// Peers with `SSH_BUG_SIGBLOB` send the bare signature without the
/// algorithm-name framing.
pub fn parse_signature_blob(sig: &[u8], datafellows: u32) -> Result<Vec<u8>, Error> {
    if datafellows & compat::SSH_BUG_SIGBLOB != 0 {
        return Ok(sig.to_vec());
    }
    let mut raw = sig;
    let sig_type = wire::get_string(&mut raw)?;
    if sig_type != SSH_ED25519.as_bytes() {
        return Err(Error::negotiation("unexpected signature algorithm"));
    }
    wire::get_string(&mut raw)
}

/// Verifies `sig_blob` over `data` with the public key from `key_blob`.
pub fn verify(key_blob: &[u8], sig_blob: &[u8], data: &[u8], datafellows: u32) -> Result<(), Error> {
    let (key_type, key_data) = parse_public_blob(key_blob)?;
    if key_type != SSH_ED25519 {
        return Err(Error::Negotiation(format!(
            "unsupported host key type {:?}",
            key_type
        )));
    }
    let sig = parse_signature_blob(sig_blob, datafellows)?;
    let key = signature::UnparsedPublicKey::new(&signature::ED25519, key_data);
    key.verify(data, &sig)
        .map_err(|_| Error::negotiation("signature verification failed"))
}

/// A local Ed25519 private key, used to sign authentication requests.
pub struct LocalKey {
    pair: signature::Ed25519KeyPair,
}

impl LocalKey {
    pub fn from_pkcs8(document: &[u8]) -> Result<Self, Error> {
        let pair = signature::Ed25519KeyPair::from_pkcs8(document)
            .map_err(|_| Error::local("cannot decode private key"))?;
        Ok(Self { pair })
    }

    /// Generates a fresh key; mainly useful for tests and demos.
    pub fn generate(rng: &ring::rand::SystemRandom) -> Result<Self, Error> {
        let doc = signature::Ed25519KeyPair::generate_pkcs8(rng)
            .map_err(|_| Error::local("cannot generate private key"))?;
        Self::from_pkcs8(doc.as_ref())
    }

    pub fn public_blob(&self) -> Vec<u8> {
        make_public_blob(self.pair.public_key().as_ref())
    }

    /// Signs `data` and returns the framed signature blob.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        make_signature_blob(self.pair.sign(data).as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let rng = ring::rand::SystemRandom::new();
        let key = LocalKey::generate(&rng).unwrap();
        let blob = key.public_blob();
        let sig = key.sign(b"exchange hash");
        verify(&blob, &sig, b"exchange hash", 0).unwrap();
        assert!(verify(&blob, &sig, b"different data", 0).is_err());
    }

    #[test]
    fn sigblob_bug_skips_framing() {
        let rng = ring::rand::SystemRandom::new();
        let key = LocalKey::generate(&rng).unwrap();
        let framed = key.sign(b"data");
        let mut raw = &framed[..];
        let _ = wire::get_string(&mut raw).unwrap();
        let bare = wire::get_string(&mut raw).unwrap();
        verify(&key.public_blob(), &bare, b"data", compat::SSH_BUG_SIGBLOB).unwrap();
    }
}
