//! Precomputed authenticated-encryption box around the shared secret `K`.
//!
//! Uses the NaCl-compatible `crypto_box` construction (X25519 key agreement,
//! XSalsa20-Poly1305 AEAD). Unlike the raw NaCl C API, this crate's `Aead`
//! interface takes a plaintext slice directly and returns a tag-appended
//! ciphertext with no leading zero-padding bytes, so the wire format is
//! already bit-exact with the zero-prefix-stripped wire format used here —
//! no manual stripping/re-adding is needed.

use crypto_box::aead::{Aead, Error as AeadError};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::keys::KeyBytes;
use crate::nonce::Nonce;

/// Authentication/decryption failed. This safe AEAD interface only ever
/// reports a single opaque failure mode (by design, to avoid leaking a
/// decryption oracle) — there is no distinguishable "catastrophic" code
/// path at this layer, unlike a raw NaCl binding. See SPEC_FULL §9.
#[derive(Debug)]
pub struct AuthFailed;

/// The precomputed shared secret `K`, wrapping a `crypto_box::SalsaBox`.
pub struct SharedSecretBox {
    inner: SalsaBox,
}

impl SharedSecretBox {
    /// Precompute `K` from our secret key and the peer's public key.
    pub fn precompute(our_secret: &KeyBytes, peer_public: &KeyBytes) -> Self {
        let secret = SecretKey::from(our_secret.0);
        let public = PublicKey::from(peer_public.0);
        SharedSecretBox {
            inner: SalsaBox::new(&public, &secret),
        }
    }

    /// Encrypt `plaintext` under `K` and `nonce`. Returns ciphertext with
    /// the 16-byte Poly1305 tag appended.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
        let n = crypto_box::Nonce::from_slice(nonce.as_bytes());
        self.inner
            .encrypt(n, plaintext)
            .expect("crypto_box encryption does not fail for bounded plaintexts")
    }

    /// Decrypt `ciphertext` under `K` and `nonce`. A tag mismatch or any
    /// other failure is reported uniformly as `AuthFailed`, a silent-drop
    /// condition at the caller.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, AuthFailed> {
        self.inner
            .decrypt(crypto_box::Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_: AeadError| AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::PREFIX_LEN;

    fn keypair() -> (KeyBytes, KeyBytes) {
        let secret = SecretKey::from([0x11u8; 32]);
        let public = secret.public_key();
        (KeyBytes(secret.to_bytes()), KeyBytes(public.to_bytes()))
    }

    #[test]
    fn round_trip_recovers_plaintext() {
        let (our_secret, our_public) = keypair();
        let (peer_secret, peer_public) = keypair();

        let sender_box = SharedSecretBox::precompute(&our_secret, &peer_public);
        let receiver_box = SharedSecretBox::precompute(&peer_secret, &our_public);

        let nonce = Nonce::from_prefix([0, 0, 0, 1]);
        let plaintext = b"hello across the tunnel, this is an ethernet frame padded to length";
        let ciphertext = sender_box.encrypt(&nonce, plaintext);
        let decrypted = receiver_box.decrypt(&nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let (our_secret, our_public) = keypair();
        let (peer_secret, peer_public) = keypair();
        let sender_box = SharedSecretBox::precompute(&our_secret, &peer_public);
        let receiver_box = SharedSecretBox::precompute(&peer_secret, &our_public);

        let nonce = Nonce::from_prefix([0, 0, 0, 1]);
        let mut ciphertext = sender_box.encrypt(&nonce, b"data");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;

        assert!(receiver_box.decrypt(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn wrong_nonce_fails_auth() {
        let (our_secret, our_public) = keypair();
        let (peer_secret, peer_public) = keypair();
        let sender_box = SharedSecretBox::precompute(&our_secret, &peer_public);
        let receiver_box = SharedSecretBox::precompute(&peer_secret, &our_public);

        let nonce = Nonce::from_prefix([0, 0, 0, 1]);
        let ciphertext = sender_box.encrypt(&nonce, b"data");

        let mut wrong_prefix = [0u8; PREFIX_LEN];
        wrong_prefix.copy_from_slice(&[0, 0, 0, 2]);
        let wrong_nonce = Nonce::from_prefix(wrong_prefix);
        assert!(receiver_box.decrypt(&wrong_nonce, &ciphertext).is_err());
    }
}
