//! Conversions between the crypto domain types and their wire
//! representation. Curve points travel as decimal coordinate strings;
//! malformed input surfaces as `InvalidArgument` at the RPC boundary.

use num_bigint::BigUint;
use vault_crypto::{Ciphertext, Point};
use vault_proto::vault as pb;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
	#[error("missing field `{0}`")]
	MissingField(&'static str),
	#[error("malformed decimal coordinate")]
	InvalidNumber,
	#[error("invalid curve point")]
	InvalidPoint,
}

impl From<WireError> for tonic::Status {
	fn from(error: WireError) -> Self {
		tonic::Status::invalid_argument(error.to_string())
	}
}

pub fn point_to_wire(point: &Point) -> Result<pb::CurvePoint, WireError> {
	let (x, y) = point.coordinates().ok_or(WireError::InvalidPoint)?;
	Ok(pb::CurvePoint { x: x.to_string(), y: y.to_string() })
}

pub fn point_from_wire(message: &pb::CurvePoint) -> Result<Point, WireError> {
	let x: BigUint = message.x.parse().map_err(|_| WireError::InvalidNumber)?;
	let y: BigUint = message.y.parse().map_err(|_| WireError::InvalidNumber)?;
	Point::from_coordinates(&x, &y).map_err(|_| WireError::InvalidPoint)
}

pub fn ciphertext_to_wire(ciphertext: &Ciphertext) -> Result<pb::Ciphertext, WireError> {
	Ok(pb::Ciphertext {
		c1: Some(point_to_wire(&ciphertext.c1)?),
		c2: Some(point_to_wire(&ciphertext.c2)?),
		ciphertext: ciphertext.ciphertext.clone(),
	})
}

pub fn ciphertext_from_wire(message: &pb::Ciphertext) -> Result<Ciphertext, WireError> {
	Ok(Ciphertext {
		c1: point_from_wire(message.c1.as_ref().ok_or(WireError::MissingField("c1"))?)?,
		c2: point_from_wire(message.c2.as_ref().ok_or(WireError::MissingField("c2"))?)?,
		ciphertext: message.ciphertext.clone(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use vault_crypto::{encrypt, generate_key_and_shares, Rng, Scalar, ThresholdParams};

	#[test]
	fn point_wire_round_trip() {
		let mut rng = Rng::from_seed([10; 32]);
		let point = Point::from_scalar(&Scalar::random(&mut rng));

		let wire = point_to_wire(&point).unwrap();
		assert_eq!(point_from_wire(&wire).unwrap(), point);
	}

	#[test]
	fn ciphertext_wire_round_trip() {
		let mut rng = Rng::from_seed([11; 32]);
		let params = ThresholdParams::new(2, 2).unwrap();
		let (public_key, _) = generate_key_and_shares(&params, &mut rng);
		let ciphertext = encrypt(b"payload", &public_key, &mut rng).unwrap();

		let wire = ciphertext_to_wire(&ciphertext).unwrap();
		assert_eq!(ciphertext_from_wire(&wire).unwrap(), ciphertext);
	}

	#[test]
	fn rejects_malformed_input() {
		assert_eq!(
			point_from_wire(&pb::CurvePoint { x: "not a number".into(), y: "2".into() }),
			Err(WireError::InvalidNumber)
		);
		// Well-formed numbers that are not a point on the curve
		assert_eq!(
			point_from_wire(&pb::CurvePoint { x: "7".into(), y: "11".into() }),
			Err(WireError::InvalidPoint)
		);
		assert_eq!(
			ciphertext_from_wire(&pb::Ciphertext { c1: None, c2: None, ciphertext: vec![] }),
			Err(WireError::MissingField("c1"))
		);
	}

	#[test]
	fn identity_is_not_encodable() {
		assert_eq!(point_to_wire(&Point::identity()), Err(WireError::InvalidPoint));
	}
}
