//! Sealed envelopes to a long-term X25519 key: anonymous sender, one-shot,
//! only the recipient can open. Every share, group key and partial
//! decryption crosses a component boundary in this form.

use chacha20poly1305::{
	aead::{Aead, KeyInit},
	ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::CryptoError;

pub const PUBLIC_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const ENVELOPE_KEY_INFO: &[u8] = b"vault sealed envelope";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealingPublicKey(PublicKey);

impl SealingPublicKey {
	pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
		self.0.as_bytes()
	}

	pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
		SealingPublicKey(PublicKey::from(bytes))
	}
}

/// A component's long-term envelope keypair. The private half never leaves
/// the process that generated it.
pub struct SealingKeypair {
	secret: StaticSecret,
	public: SealingPublicKey,
}

impl SealingKeypair {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		let public = SealingPublicKey(PublicKey::from(&secret));
		SealingKeypair { secret, public }
	}

	pub fn public_key(&self) -> &SealingPublicKey {
		&self.public
	}

	pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if envelope.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
			return Err(CryptoError::DecryptionFailed);
		}
		let (ephemeral_public, rest) = envelope.split_at(PUBLIC_KEY_SIZE);
		let (nonce, sealed) = rest.split_at(NONCE_SIZE);

		let ephemeral_public = PublicKey::from(
			<[u8; PUBLIC_KEY_SIZE]>::try_from(ephemeral_public)
				.expect("split at PUBLIC_KEY_SIZE"),
		);
		let shared = self.secret.diffie_hellman(&ephemeral_public);

		let key = derive_envelope_key(shared.as_bytes(), &ephemeral_public, &self.public.0);
		ChaCha20Poly1305::new(Key::from_slice(&key))
			.decrypt(Nonce::from_slice(nonce), sealed)
			.map_err(|_| CryptoError::DecryptionFailed)
	}
}

/// Seal `plaintext` to `recipient` under a fresh ephemeral key. Layout:
/// `ephemeral_pub(32) || nonce(12) || aead ciphertext`.
pub fn seal(plaintext: &[u8], recipient: &SealingPublicKey) -> Result<Vec<u8>, CryptoError> {
	let ephemeral = EphemeralSecret::random_from_rng(OsRng);
	let ephemeral_public = PublicKey::from(&ephemeral);
	let shared = ephemeral.diffie_hellman(&recipient.0);

	let key = derive_envelope_key(shared.as_bytes(), &ephemeral_public, &recipient.0);
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);

	let mut sealed = ChaCha20Poly1305::new(Key::from_slice(&key))
		.encrypt(Nonce::from_slice(&nonce), plaintext)
		.map_err(|_| CryptoError::EncryptionFailed)?;

	let mut envelope =
		Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + sealed.len());
	envelope.extend_from_slice(ephemeral_public.as_bytes());
	envelope.extend_from_slice(&nonce);
	envelope.append(&mut sealed);
	Ok(envelope)
}

// Binds the derived key to both sides of the exchange so an envelope
// cannot be re-targeted at another recipient.
fn derive_envelope_key(
	shared: &[u8],
	ephemeral_public: &PublicKey,
	recipient: &PublicKey,
) -> [u8; 32] {
	let hkdf = Hkdf::<Sha256>::new(None, shared);
	let mut info = Vec::with_capacity(ENVELOPE_KEY_INFO.len() + 2 * PUBLIC_KEY_SIZE);
	info.extend_from_slice(ENVELOPE_KEY_INFO);
	info.extend_from_slice(ephemeral_public.as_bytes());
	info.extend_from_slice(recipient.as_bytes());

	let mut key = [0u8; 32];
	hkdf.expand(&info, &mut key)
		.expect("32 bytes is a valid HKDF-SHA256 output length");
	key
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seal_open_round_trip() {
		let keypair = SealingKeypair::generate();
		let envelope = seal(b"share material", keypair.public_key()).unwrap();

		assert_eq!(keypair.open(&envelope).unwrap(), b"share material");
	}

	#[test]
	fn open_with_wrong_key_fails() {
		let keypair = SealingKeypair::generate();
		let other = SealingKeypair::generate();
		let envelope = seal(b"share material", keypair.public_key()).unwrap();

		assert!(matches!(other.open(&envelope), Err(CryptoError::DecryptionFailed)));
	}

	#[test]
	fn tampered_envelope_fails() {
		let keypair = SealingKeypair::generate();
		let mut envelope = seal(b"share material", keypair.public_key()).unwrap();
		let last = envelope.len() - 1;
		envelope[last] ^= 0x01;

		assert!(matches!(keypair.open(&envelope), Err(CryptoError::DecryptionFailed)));
	}

	#[test]
	fn truncated_envelope_fails() {
		let keypair = SealingKeypair::generate();
		assert!(matches!(
			keypair.open(&[0u8; PUBLIC_KEY_SIZE]),
			Err(CryptoError::DecryptionFailed)
		));
	}

	#[test]
	fn every_seal_is_unique() {
		let keypair = SealingKeypair::generate();
		let first = seal(b"same message", keypair.public_key()).unwrap();
		let second = seal(b"same message", keypair.public_key()).unwrap();

		// Fresh ephemeral key and nonce per envelope
		assert_ne!(first, second);
	}
}
