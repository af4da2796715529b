//! Threshold EC-ElGamal pipeline: centralized key/share generation, hybrid
//! encryption under the group key, per-share partial decryption and
//! Lagrange combination.

use std::collections::BTreeSet;

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
	curve::{Point, Rng, Scalar},
	CryptoError,
};

const NONCE_SIZE: usize = 12;
const SYMMETRIC_KEY_SIZE: usize = 32;
const HYBRID_KEY_INFO: &[u8] = b"vault hybrid encryption";

/// `(t, n)` with `1 <= t <= n`, immutable per encryption batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdParams {
	pub threshold: u32,
	pub share_count: u32,
}

impl ThresholdParams {
	pub fn new(threshold: u32, share_count: u32) -> Result<Self, CryptoError> {
		if threshold < 1 || threshold > share_count {
			return Err(CryptoError::InvalidParams { threshold, share_count });
		}
		Ok(ThresholdParams { threshold, share_count })
	}
}

/// Evaluation of the sharing polynomial at the share's index.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, PartialEq, Eq)]
pub struct KeyShare {
	pub index: u32,
	pub scalar: Scalar,
}

/// Hybrid ciphertext: `c1 = k*P`, `c2` a commitment to the shared point
/// `S = k*Q`, and the AEAD output (nonce-prefixed) under a key derived
/// from `S`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
	pub c1: Point,
	pub c2: Point,
	pub ciphertext: Vec<u8>,
}

/// One share-holder's contribution `y_i * c1` to a threshold decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDecryption {
	pub index: u32,
	pub point: Point,
}

/// Horner evaluation at `index` of the polynomial whose coefficients are
/// given constant-term first. The constant term is the dealt secret.
fn evaluate_polynomial<'a, I>(coefficients: I, index: u32) -> Scalar
where
	I: DoubleEndedIterator<Item = &'a Scalar>,
{
	let x = Scalar::from(index);
	coefficients
		.rev()
		.fold(Scalar::zero(), |acc, coefficient| acc * x.clone() + coefficient.clone())
}

/// Weight for share `index` such that summing the weighted partials over
/// `all_indices` interpolates the sharing polynomial at zero.
fn lagrange_coeff_at_zero(index: u32, all_indices: &BTreeSet<u32>) -> Scalar {
	let mut numerator = Scalar::one();
	let mut denominator = Scalar::one();

	for other in all_indices.iter().filter(|other| **other != index) {
		numerator = numerator * Scalar::from(*other);
		denominator = denominator * (Scalar::from(*other) - Scalar::from(index));
	}

	numerator
		* denominator
			.invert()
			.expect("denominator is a product of non-zero differences of distinct indices")
}

/// Generate the group public key `Q = d*P` and `n` evaluations of a random
/// degree `t-1` polynomial with `f(0) = d`. The secret `d` never leaves
/// this function.
pub fn generate_key_and_shares(
	params: &ThresholdParams,
	rng: &mut Rng,
) -> (Point, Vec<KeyShare>) {
	let secret = Scalar::random(rng);

	let coefficients: Vec<_> =
		(1..params.threshold).map(|_| Scalar::random(rng)).collect();

	let shares = (1..=params.share_count)
		.map(|index| KeyShare {
			index,
			scalar: evaluate_polynomial(
				[secret.clone()].iter().chain(coefficients.iter()),
				index,
			),
		})
		.collect();

	let public_key = Point::from_scalar(&secret);

	// Dropping `secret` and the coefficients here wipes them
	(public_key, shares)
}

pub fn encrypt(
	message: &[u8],
	public_key: &Point,
	rng: &mut Rng,
) -> Result<Ciphertext, CryptoError> {
	let k = Scalar::random(rng);
	let c1 = Point::from_scalar(&k);
	let shared = *public_key * &k;

	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derive_symmetric_key(&shared)));
	let mut nonce = [0u8; NONCE_SIZE];
	rng.fill_bytes(&mut nonce);
	let mut sealed = cipher
		.encrypt(Nonce::from_slice(&nonce), message)
		.map_err(|_| CryptoError::EncryptionFailed)?;

	let mut ciphertext = nonce.to_vec();
	ciphertext.append(&mut sealed);

	Ok(Ciphertext { c1, c2: commitment_point(&shared), ciphertext })
}

/// A single scalar multiplication on the curve; neither `c2` nor the
/// symmetric payload is inspected.
pub fn partial_decrypt(ciphertext: &Ciphertext, share: &KeyShare) -> PartialDecryption {
	PartialDecryption { index: share.index, point: ciphertext.c1 * &share.scalar }
}

/// Interpolate at least `t` partial decryptions at zero in the exponent to
/// recover the shared point, check it against the ciphertext's commitment
/// and open the symmetric payload.
pub fn combine(
	partials: &[PartialDecryption],
	ciphertext: &Ciphertext,
	params: &ThresholdParams,
) -> Result<Vec<u8>, CryptoError> {
	if (partials.len() as u32) < params.threshold {
		return Err(CryptoError::NotEnoughPartials {
			provided: partials.len() as u32,
			needed: params.threshold,
		});
	}

	let mut indices = BTreeSet::new();
	for partial in partials {
		if partial.index < 1 || partial.index > params.share_count {
			return Err(CryptoError::IndexOutOfRange {
				index: partial.index,
				share_count: params.share_count,
			});
		}
		if !indices.insert(partial.index) {
			return Err(CryptoError::DuplicateIndex(partial.index));
		}
	}

	let shared: Point = partials
		.iter()
		.map(|partial| partial.point * lagrange_coeff_at_zero(partial.index, &indices))
		.sum();

	if commitment_point(&shared) != ciphertext.c2 {
		return Err(CryptoError::CommitmentMismatch);
	}

	if ciphertext.ciphertext.len() < NONCE_SIZE {
		return Err(CryptoError::DecryptionFailed);
	}
	let (nonce, sealed) = ciphertext.ciphertext.split_at(NONCE_SIZE);

	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derive_symmetric_key(&shared)));
	cipher
		.decrypt(Nonce::from_slice(nonce), sealed)
		.map_err(|_| CryptoError::DecryptionFailed)
}

fn derive_symmetric_key(shared: &Point) -> [u8; SYMMETRIC_KEY_SIZE] {
	let hkdf = Hkdf::<Sha256>::new(None, &shared.as_bytes());
	let mut key = [0u8; SYMMETRIC_KEY_SIZE];
	hkdf.expand(HYBRID_KEY_INFO, &mut key)
		.expect("32 bytes is a valid HKDF-SHA256 output length");
	key
}

// The commitment binds the ciphertext to the shared point without
// revealing the symmetric key: `combine` can verify its reconstruction,
// while the stored `c2` is only `h(S)*P`.
fn commitment_point(shared: &Point) -> Point {
	let digest: [u8; 32] = Sha256::digest(shared.as_bytes()).into();
	Point::from_scalar(&Scalar::from_bytes_mod_order(&digest))
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;

	#[test]
	fn polynomial_evaluation_matches_hand_computation() {
		// f(x) = 9 + 3x + x^2
		let coefficients = [Scalar::from(9), Scalar::from(3), Scalar::from(1)];

		// f(5) = 9 + 15 + 25 = 49
		assert_eq!(evaluate_polynomial(coefficients.iter(), 5), Scalar::from(49));
		// Evaluating at zero exposes the constant term
		assert_eq!(evaluate_polynomial(coefficients.iter(), 0), Scalar::from(9));
	}

	#[test]
	fn lagrange_weights_interpolate_at_zero() {
		// Weighted evaluations of f(x) = 9 + 3x + x^2 over any three
		// distinct points must recover f(0)
		let coefficients = [Scalar::from(9), Scalar::from(3), Scalar::from(1)];
		let indices: BTreeSet<u32> = [2, 5, 7].into_iter().collect();

		let recovered: Scalar = indices
			.iter()
			.map(|index| {
				lagrange_coeff_at_zero(*index, &indices)
					* evaluate_polynomial(coefficients.iter(), *index)
			})
			.sum();
		assert_eq!(recovered, Scalar::from(9));

		// A singleton quorum carries the full weight
		assert_eq!(
			lagrange_coeff_at_zero(4, &BTreeSet::from([4])),
			Scalar::from(1)
		);
	}

	#[test]
	fn rejects_invalid_params() {
		assert!(ThresholdParams::new(0, 3).is_err());
		assert!(ThresholdParams::new(4, 3).is_err());
		assert!(ThresholdParams::new(1, 1).is_ok());
	}

	#[test]
	fn full_quorum_round_trip() {
		let params = ThresholdParams::new(4, 4).unwrap();
		let mut rng = Rng::from_seed([0; 32]);

		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"my super secret", &public_key, &mut rng).unwrap();

		let partials: Vec<_> =
			shares.iter().map(|share| partial_decrypt(&ciphertext, share)).collect();

		assert_eq!(combine(&partials, &ciphertext, &params).unwrap(), b"my super secret");
	}

	#[test]
	fn any_large_enough_subset_decrypts() {
		let mut rng = Rng::from_seed([3; 32]);

		for share_count in 1..=4u32 {
			for threshold in 1..=share_count {
				let params = ThresholdParams::new(threshold, share_count).unwrap();
				let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
				let ciphertext = encrypt(b"quorum", &public_key, &mut rng).unwrap();

				// Leading and trailing windows of every admissible size
				for size in threshold..=share_count {
					for subset in
						[&shares[..size as usize], &shares[(share_count - size) as usize..]]
					{
						let partials: Vec<_> = subset
							.iter()
							.map(|share| partial_decrypt(&ciphertext, share))
							.collect();
						assert_eq!(
							combine(&partials, &ciphertext, &params).unwrap(),
							b"quorum"
						);
					}
				}
			}
		}
	}

	#[test]
	fn threshold_boundary() {
		let params = ThresholdParams::new(3, 4).unwrap();
		let mut rng = Rng::from_seed([4; 32]);

		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"boundary", &public_key, &mut rng).unwrap();

		let partials: Vec<_> =
			shares.iter().map(|share| partial_decrypt(&ciphertext, share)).collect();

		// Exactly t - 1 partials must fail, exactly t must succeed
		assert!(matches!(
			combine(&partials[..2], &ciphertext, &params),
			Err(CryptoError::NotEnoughPartials { provided: 2, needed: 3 })
		));
		assert_eq!(combine(&partials[..3], &ciphertext, &params).unwrap(), b"boundary");
	}

	#[test]
	fn rejects_duplicate_and_out_of_range_indices() {
		let params = ThresholdParams::new(2, 3).unwrap();
		let mut rng = Rng::from_seed([5; 32]);

		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"indices", &public_key, &mut rng).unwrap();

		let partials: Vec<_> =
			shares.iter().map(|share| partial_decrypt(&ciphertext, share)).collect();

		let duplicated = vec![partials[0].clone(), partials[0].clone()];
		assert!(matches!(
			combine(&duplicated, &ciphertext, &params),
			Err(CryptoError::DuplicateIndex(1))
		));

		let mut out_of_range = partials.clone();
		out_of_range[2].index = 7;
		assert!(matches!(
			combine(&out_of_range, &ciphertext, &params),
			Err(CryptoError::IndexOutOfRange { index: 7, share_count: 3 })
		));
	}

	#[test]
	fn tampered_partial_fails_commitment_check() {
		let params = ThresholdParams::new(2, 2).unwrap();
		let mut rng = Rng::from_seed([6; 32]);

		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"tamper", &public_key, &mut rng).unwrap();

		let mut partials: Vec<_> =
			shares.iter().map(|share| partial_decrypt(&ciphertext, share)).collect();
		partials[0].point = Point::from_scalar(&Scalar::random(&mut rng));

		assert!(matches!(
			combine(&partials, &ciphertext, &params),
			Err(CryptoError::CommitmentMismatch)
		));
	}

	#[test]
	fn share_serialization_round_trip() {
		let params = ThresholdParams::new(2, 3).unwrap();
		let mut rng = Rng::from_seed([8; 32]);

		let (_, shares) = generate_key_and_shares(&params, &mut rng);

		let bytes = bincode::serialize(&shares[0]).unwrap();
		let recovered: KeyShare = bincode::deserialize(&bytes).unwrap();
		assert_eq!(recovered, shares[0]);
	}

	#[test]
	fn partial_decryption_is_deterministic() {
		let params = ThresholdParams::new(2, 3).unwrap();
		let mut rng = Rng::from_seed([7; 32]);

		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"deterministic", &public_key, &mut rng).unwrap();

		assert_eq!(
			partial_decrypt(&ciphertext, &shares[1]),
			partial_decrypt(&ciphertext, &shares[1])
		);
	}
}
