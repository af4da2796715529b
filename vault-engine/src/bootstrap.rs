//! The transient dealer: one `GenerateShares` call generates the group
//! keypair and its shares, seals every share to its intended recipient
//! and exits with the caller's termination request. It holds no state and
//! the group secret never leaves the call.

use std::sync::Arc;

use rand::SeedableRng;
use tonic::{Request, Response, Status};
use tracing::info;

use vault_crypto::{
	generate_key_and_shares, seal, Rng, SealingKeypair, SealingPublicKey, ThresholdParams,
	PUBLIC_KEY_SIZE,
};
use vault_proto::{
	setup::setup_unit_server::SetupUnitServer,
	vault::{bootstrap_server, GenerateSharesRequest, GenerateSharesResponse},
};

use crate::{
	settings,
	setup::{self, ServiceType},
};

#[derive(Clone)]
pub struct Bootstrap {
	keypair: Arc<SealingKeypair>,
}

impl Default for Bootstrap {
	fn default() -> Self {
		Self::new()
	}
}

impl Bootstrap {
	pub fn new() -> Self {
		Bootstrap { keypair: Arc::new(SealingKeypair::generate()) }
	}

	pub fn public_key_bytes(&self) -> Vec<u8> {
		self.keypair.public_key().as_bytes().to_vec()
	}
}

#[tonic::async_trait]
impl bootstrap_server::Bootstrap for Bootstrap {
	async fn generate_shares(
		&self,
		request: Request<GenerateSharesRequest>,
	) -> Result<Response<GenerateSharesResponse>, Status> {
		let request = request.into_inner();

		if request.public_keys.len() != request.num_of_shares as usize {
			return Err(Status::invalid_argument(
				"number of public keys must match number of shares requested",
			));
		}
		let params = ThresholdParams::new(request.threshold, request.num_of_shares)
			.map_err(|error| Status::invalid_argument(error.to_string()))?;

		// Validate every recipient before any key material exists
		let recipients = request
			.public_keys
			.iter()
			.map(|bytes| {
				<[u8; PUBLIC_KEY_SIZE]>::try_from(bytes.as_slice())
					.map(SealingPublicKey::from_bytes)
					.map_err(|_| Status::invalid_argument("malformed recipient public key"))
			})
			.collect::<Result<Vec<_>, _>>()?;

		let mut rng = Rng::from_entropy();
		let (public_key, shares) = generate_key_and_shares(&params, &mut rng);

		let encrypted_shares = shares
			.iter()
			.zip(&recipients)
			.map(|(share, recipient)| {
				let serialized = bincode::serialize(share)
					.map_err(|error| Status::internal(error.to_string()))?;
				seal(&serialized, recipient)
					.map_err(|error| Status::internal(error.to_string()))
			})
			.collect::<Result<Vec<_>, Status>>()?;

		// The last public key is always the registering user's; the group
		// key goes back sealed to them alone.
		let user_key = recipients.last().expect("at least one share, validated above");
		let serialized_key = bincode::serialize(&public_key)
			.map_err(|error| Status::internal(error.to_string()))?;
		let encrypted_key = seal(&serialized_key, user_key)
			.map_err(|error| Status::internal(error.to_string()))?;

		info!(
			threshold = request.threshold,
			num_of_shares = request.num_of_shares,
			"generated and sealed shares"
		);
		Ok(Response::new(GenerateSharesResponse { encrypted_shares, encrypted_key }))
	}
}

/// Worker entry point. The bootstrap serves until the manager calls
/// `Terminate`, which it does right after collecting the response.
pub async fn run(worker: settings::Worker, tls: Option<settings::Tls>) -> anyhow::Result<()> {
	let bootstrap = Bootstrap::new();
	let public_key = bootstrap.public_key_bytes();
	info!("starting bootstrap");

	setup::run_worker(
		&worker,
		tls.as_ref(),
		ServiceType::Bootstrap,
		public_key,
		|builder, unit| {
			builder
				.add_service(bootstrap_server::BootstrapServer::new(bootstrap.clone()))
				.add_service(SetupUnitServer::new(unit))
		},
	)
	.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use bootstrap_server::Bootstrap as BootstrapApi;
	use vault_crypto::{combine, encrypt, partial_decrypt, KeyShare, PartialDecryption, Point};

	fn recipients(count: usize) -> (Vec<SealingKeypair>, Vec<Vec<u8>>) {
		let keypairs: Vec<_> = (0..count).map(|_| SealingKeypair::generate()).collect();
		let keys = keypairs
			.iter()
			.map(|keypair| keypair.public_key().as_bytes().to_vec())
			.collect();
		(keypairs, keys)
	}

	#[tokio::test]
	async fn key_count_mismatch_is_rejected_without_material() {
		let bootstrap = Bootstrap::new();
		let (_, public_keys) = recipients(2);

		let status = bootstrap
			.generate_shares(Request::new(GenerateSharesRequest {
				threshold: 3,
				num_of_shares: 3,
				public_keys,
			}))
			.await
			.unwrap_err();
		assert_eq!(status.code(), tonic::Code::InvalidArgument);
	}

	#[tokio::test]
	async fn invalid_threshold_is_rejected() {
		let bootstrap = Bootstrap::new();
		let (_, public_keys) = recipients(2);

		let status = bootstrap
			.generate_shares(Request::new(GenerateSharesRequest {
				threshold: 3,
				num_of_shares: 2,
				public_keys,
			}))
			.await
			.unwrap_err();
		assert_eq!(status.code(), tonic::Code::InvalidArgument);
	}

	#[tokio::test]
	async fn each_share_opens_only_for_its_recipient() {
		let bootstrap = Bootstrap::new();
		let (keypairs, public_keys) = recipients(3);

		let response = bootstrap
			.generate_shares(Request::new(GenerateSharesRequest {
				threshold: 3,
				num_of_shares: 3,
				public_keys,
			}))
			.await
			.unwrap()
			.into_inner();
		assert_eq!(response.encrypted_shares.len(), 3);

		// Share i is sealed to recipient i, in order
		for (index, (sealed, keypair)) in
			response.encrypted_shares.iter().zip(&keypairs).enumerate()
		{
			let share: KeyShare = bincode::deserialize(&keypair.open(sealed).unwrap()).unwrap();
			assert_eq!(share.index, index as u32 + 1);

			let wrong = &keypairs[(index + 1) % keypairs.len()];
			assert!(wrong.open(sealed).is_err());
		}

		// The group key opens for the last recipient only
		let user = keypairs.last().unwrap();
		let group_key: Point =
			bincode::deserialize(&user.open(&response.encrypted_key).unwrap()).unwrap();

		// And the dealt shares actually decrypt under that key
		let params = ThresholdParams::new(3, 3).unwrap();
		let mut rng = Rng::from_seed([22; 32]);
		let ciphertext = encrypt(b"dealt", &group_key, &mut rng).unwrap();
		let partials: Vec<PartialDecryption> = response
			.encrypted_shares
			.iter()
			.zip(&keypairs)
			.map(|(sealed, keypair)| {
				let share: KeyShare =
					bincode::deserialize(&keypair.open(sealed).unwrap()).unwrap();
				partial_decrypt(&ciphertext, &share)
			})
			.collect();
		assert_eq!(combine(&partials, &ciphertext, &params).unwrap(), b"dealt");
	}
}
