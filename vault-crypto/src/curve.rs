//! Wrappers around the P-256 backend exposing exactly the arithmetic the
//! threshold pipeline needs.

use num_bigint::BigUint;
use p256::{
	elliptic_curve::{
		ops::Reduce,
		sec1::{FromEncodedPoint, ToEncodedPoint},
		Field, PrimeField,
	},
	AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint,
};
use serde::{Deserialize, Serialize};

use crate::CryptoError;

pub type Rng = rand::rngs::StdRng;

pub const COMPRESSED_POINT_SIZE: usize = 33;
pub const SCALAR_SIZE: usize = 32;

/// A group element. The identity is a valid value internally (it is the
/// neutral element for `Sum`), but never a valid public key, `C1` or
/// partial decryption on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point(ProjectivePoint);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scalar(p256::Scalar);

const IDENTITY_COMPRESSED: [u8; COMPRESSED_POINT_SIZE] = [0; COMPRESSED_POINT_SIZE];

impl Point {
	pub fn generator() -> Self {
		Point(ProjectivePoint::GENERATOR)
	}

	pub fn identity() -> Self {
		Point(ProjectivePoint::IDENTITY)
	}

	pub fn from_scalar(scalar: &Scalar) -> Self {
		Point(ProjectivePoint::GENERATOR * scalar.0)
	}

	pub fn as_bytes(&self) -> [u8; COMPRESSED_POINT_SIZE] {
		if self.0 == ProjectivePoint::IDENTITY {
			return IDENTITY_COMPRESSED;
		}
		let encoded = self.0.to_affine().to_encoded_point(true);
		encoded
			.as_bytes()
			.try_into()
			.expect("compressed SEC1 encoding of a non-identity point is 33 bytes")
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
		if bytes == &IDENTITY_COMPRESSED[..] {
			return Ok(Point::identity());
		}
		let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)?;
		Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
			.map(|affine| Point(ProjectivePoint::from(affine)))
			.ok_or(CryptoError::InvalidPoint)
	}

	/// Affine coordinates as big integers, `None` for the identity.
	pub fn coordinates(&self) -> Option<(BigUint, BigUint)> {
		let encoded = self.0.to_affine().to_encoded_point(false);
		match (encoded.x(), encoded.y()) {
			(Some(x), Some(y)) =>
				Some((BigUint::from_bytes_be(x), BigUint::from_bytes_be(y))),
			_ => None,
		}
	}

	pub fn from_coordinates(x: &BigUint, y: &BigUint) -> Result<Self, CryptoError> {
		let x = field_bytes(x).ok_or(CryptoError::InvalidPoint)?;
		let y = field_bytes(y).ok_or(CryptoError::InvalidPoint)?;
		let encoded = EncodedPoint::from_affine_coordinates(&x, &y, false);
		Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
			.map(|affine| Point(ProjectivePoint::from(affine)))
			.ok_or(CryptoError::InvalidPoint)
	}
}

impl Scalar {
	pub fn random(rng: &mut impl rand::RngCore) -> Self {
		Scalar(p256::Scalar::random(rng))
	}

	pub fn zero() -> Self {
		Scalar(p256::Scalar::ZERO)
	}

	pub fn one() -> Self {
		Scalar(p256::Scalar::ONE)
	}

	/// Reduce 32 uniformly random bytes into the scalar field.
	pub fn from_bytes_mod_order(bytes: &[u8; SCALAR_SIZE]) -> Self {
		Scalar(<p256::Scalar as Reduce<p256::elliptic_curve::bigint::U256>>::reduce_bytes(
			FieldBytes::from_slice(bytes),
		))
	}

	pub fn as_bytes(&self) -> [u8; SCALAR_SIZE] {
		self.0.to_repr().into()
	}

	pub fn from_bytes(bytes: &[u8; SCALAR_SIZE]) -> Result<Self, CryptoError> {
		Option::from(p256::Scalar::from_repr(*FieldBytes::from_slice(bytes)))
			.map(Scalar)
			.ok_or(CryptoError::InvalidScalar)
	}

	pub fn to_biguint(&self) -> BigUint {
		BigUint::from_bytes_be(&self.as_bytes())
	}

	pub fn from_biguint(value: &BigUint) -> Result<Self, CryptoError> {
		let bytes = field_bytes(value).ok_or(CryptoError::InvalidScalar)?;
		Option::from(p256::Scalar::from_repr(bytes))
			.map(Scalar)
			.ok_or(CryptoError::InvalidScalar)
	}

	// Runs only on interpolation denominators, which are public.
	pub fn invert(&self) -> Option<Self> {
		Option::<p256::Scalar>::from(self.0.invert()).map(Scalar)
	}
}

fn field_bytes(value: &BigUint) -> Option<FieldBytes> {
	let be = value.to_bytes_be();
	if be.len() > SCALAR_SIZE {
		return None;
	}
	let mut padded = [0u8; SCALAR_SIZE];
	padded[SCALAR_SIZE - be.len()..].copy_from_slice(&be);
	Some(*FieldBytes::from_slice(&padded))
}

impl From<u32> for Scalar {
	fn from(x: u32) -> Self {
		Scalar(p256::Scalar::from(u64::from(x)))
	}
}

impl Default for Scalar {
	fn default() -> Self {
		Scalar::zero()
	}
}

impl Drop for Scalar {
	fn drop(&mut self) {
		use zeroize::Zeroize;
		self.zeroize();
	}
}

impl zeroize::ZeroizeOnDrop for Scalar {}

impl zeroize::Zeroize for Scalar {
	fn zeroize(&mut self) {
		use core::sync::atomic;
		self.0 = p256::Scalar::ZERO;
		atomic::compiler_fence(atomic::Ordering::SeqCst);
	}
}

impl std::ops::Add for &Scalar {
	type Output = Scalar;

	fn add(self, rhs: Self) -> Self::Output {
		Scalar(self.0 + rhs.0)
	}
}

impl std::ops::Add for Scalar {
	type Output = Scalar;

	fn add(self, rhs: Self) -> Self::Output {
		&self + &rhs
	}
}

impl std::ops::Sub for &Scalar {
	type Output = Scalar;

	fn sub(self, rhs: Self) -> Self::Output {
		Scalar(self.0 - rhs.0)
	}
}

impl std::ops::Sub for Scalar {
	type Output = Scalar;

	fn sub(self, rhs: Self) -> Self::Output {
		&self - &rhs
	}
}

impl std::ops::Mul for &Scalar {
	type Output = Scalar;

	fn mul(self, rhs: Self) -> Self::Output {
		Scalar(self.0 * rhs.0)
	}
}

impl std::ops::Mul for Scalar {
	type Output = Scalar;

	fn mul(self, rhs: Self) -> Self::Output {
		&self * &rhs
	}
}

impl std::iter::Sum for Scalar {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Scalar::zero(), |a, b| a + b)
	}
}

impl std::ops::Add for Point {
	type Output = Point;

	fn add(self, rhs: Self) -> Self::Output {
		Point(self.0 + rhs.0)
	}
}

impl std::ops::Mul<&Scalar> for Point {
	type Output = Point;

	fn mul(self, scalar: &Scalar) -> Self::Output {
		Point(self.0 * scalar.0)
	}
}

impl std::ops::Mul<Scalar> for Point {
	type Output = Point;

	fn mul(self, scalar: Scalar) -> Self::Output {
		self * &scalar
	}
}

impl std::iter::Sum for Point {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Point::identity(), |a, b| a + b)
	}
}

impl Serialize for Point {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		let bytes = self.as_bytes();

		use serde::ser::SerializeTuple;
		let mut tup = serializer.serialize_tuple(COMPRESSED_POINT_SIZE)?;
		for byte in &bytes {
			tup.serialize_element(byte)?;
		}
		tup.end()
	}
}

impl<'de> Deserialize<'de> for Point {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		struct PointVisitor;

		impl<'de> serde::de::Visitor<'de> for PointVisitor {
			type Value = [u8; COMPRESSED_POINT_SIZE];

			fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
				write!(formatter, "a compressed curve point ({COMPRESSED_POINT_SIZE} bytes)")
			}

			fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
			where
				A: serde::de::SeqAccess<'de>,
			{
				let mut bytes = [0u8; COMPRESSED_POINT_SIZE];
				for (i, byte) in bytes.iter_mut().enumerate() {
					*byte = seq
						.next_element()?
						.ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
				}
				Ok(bytes)
			}
		}

		let bytes = deserializer.deserialize_tuple(COMPRESSED_POINT_SIZE, PointVisitor)?;
		Point::from_bytes(&bytes).map_err(serde::de::Error::custom)
	}
}

impl Serialize for Scalar {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		let bytes = self.as_bytes();

		use serde::ser::SerializeTuple;
		let mut tup = serializer.serialize_tuple(SCALAR_SIZE)?;
		for byte in &bytes {
			tup.serialize_element(byte)?;
		}
		tup.end()
	}
}

impl<'de> Deserialize<'de> for Scalar {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let mut bytes: [u8; SCALAR_SIZE] = [0; SCALAR_SIZE];
		<[u8; SCALAR_SIZE]>::deserialize_in_place(deserializer, &mut bytes)?;
		Scalar::from_bytes(&bytes).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;

	#[test]
	fn point_serialization_round_trip() {
		let mut rng = Rng::from_seed([1; 32]);
		let point = Point::from_scalar(&Scalar::random(&mut rng));

		let recovered = Point::from_bytes(&point.as_bytes()).unwrap();
		assert_eq!(point, recovered);

		let (x, y) = point.coordinates().unwrap();
		assert_eq!(Point::from_coordinates(&x, &y).unwrap(), point);
	}

	#[test]
	fn scalar_decimal_round_trip() {
		let mut rng = Rng::from_seed([2; 32]);
		let scalar = Scalar::random(&mut rng);

		assert_eq!(Scalar::from_biguint(&scalar.to_biguint()).unwrap(), scalar);
	}

	#[test]
	fn rejects_coordinates_off_the_curve() {
		let x = BigUint::from(7u32);
		let y = BigUint::from(11u32);
		assert!(Point::from_coordinates(&x, &y).is_err());
	}

	#[test]
	fn identity_encodes_as_zeroes() {
		let identity = Point::identity();
		assert_eq!(identity.as_bytes(), IDENTITY_COMPRESSED);
		assert_eq!(Point::from_bytes(&IDENTITY_COMPRESSED).unwrap(), identity);
		assert!(identity.coordinates().is_none());
	}
}
