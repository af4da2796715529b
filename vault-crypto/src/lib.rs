//! Cryptographic primitives for the distributed secret vault: the threshold
//! EC-ElGamal pipeline over P-256 and the X25519 sealed envelope. Pure and
//! synchronous; all I/O lives in `vault-engine`.

mod curve;
pub mod sealing;
pub mod threshold;

pub use curve::{Point, Rng, Scalar, COMPRESSED_POINT_SIZE, SCALAR_SIZE};
pub use sealing::{seal, SealingKeypair, SealingPublicKey, PUBLIC_KEY_SIZE};
pub use threshold::{
	combine, encrypt, generate_key_and_shares, partial_decrypt, Ciphertext, KeyShare,
	PartialDecryption, ThresholdParams,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
	#[error("invalid threshold parameters: t={threshold}, n={share_count}")]
	InvalidParams { threshold: u32, share_count: u32 },
	#[error("not enough partial decryptions: {provided} provided, {needed} needed")]
	NotEnoughPartials { provided: u32, needed: u32 },
	#[error("duplicate share index {0}")]
	DuplicateIndex(u32),
	#[error("share index {index} outside [1, {share_count}]")]
	IndexOutOfRange { index: u32, share_count: u32 },
	#[error("reconstructed key does not match the ciphertext commitment")]
	CommitmentMismatch,
	#[error("encryption failed")]
	EncryptionFailed,
	#[error("decryption failed")]
	DecryptionFailed,
	#[error("invalid point encoding")]
	InvalidPoint,
	#[error("invalid scalar encoding")]
	InvalidScalar,
}
