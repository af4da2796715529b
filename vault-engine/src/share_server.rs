//! Long-lived share holder. Keeps one sealed share per registered user,
//! unseals it transiently for a single partial decryption and returns the
//! partial sealed to the requesting user's key.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use vault_crypto::{
	partial_decrypt, seal, KeyShare, SealingKeypair, SealingPublicKey, PUBLIC_KEY_SIZE,
};
use vault_proto::{
	setup::setup_unit_server::SetupUnitServer,
	vault::{
		share_server_server, DecryptRequest, DecryptResponse, DeleteShareRequest,
		DeleteShareResponse, StoreShareRequest, StoreShareResponse,
	},
};

use crate::{
	convert, settings,
	setup::{self, ServiceType},
};

#[derive(Clone)]
pub struct ShareServer {
	keypair: Arc<SealingKeypair>,
	shares: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Default for ShareServer {
	fn default() -> Self {
		Self::new()
	}
}

impl ShareServer {
	/// A share server generates a fresh long-term keypair on startup; the
	/// public half is published through registration.
	pub fn new() -> Self {
		ShareServer {
			keypair: Arc::new(SealingKeypair::generate()),
			shares: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	pub fn public_key_bytes(&self) -> Vec<u8> {
		self.keypair.public_key().as_bytes().to_vec()
	}
}

#[tonic::async_trait]
impl share_server_server::ShareServer for ShareServer {
	async fn store_share(
		&self,
		request: Request<StoreShareRequest>,
	) -> Result<Response<StoreShareResponse>, Status> {
		let request = request.into_inner();
		debug!(user_id = %request.user_id, "storing share");

		let mut shares = self.shares.lock().expect("share map lock poisoned");
		if shares.contains_key(&request.user_id) {
			return Err(Status::already_exists("share for this user already exists"));
		}
		shares.insert(request.user_id, request.encrypted_share);
		Ok(Response::new(StoreShareResponse { success: true }))
	}

	async fn delete_share(
		&self,
		request: Request<DeleteShareRequest>,
	) -> Result<Response<DeleteShareResponse>, Status> {
		let request = request.into_inner();
		debug!(user_id = %request.user_id, "deleting share");

		let mut shares = self.shares.lock().expect("share map lock poisoned");
		if shares.remove(&request.user_id).is_none() {
			return Err(Status::not_found("share does not exist for this user"));
		}
		Ok(Response::new(DeleteShareResponse { success: true }))
	}

	async fn decrypt(
		&self,
		request: Request<DecryptRequest>,
	) -> Result<Response<DecryptResponse>, Status> {
		let request = request.into_inner();
		debug!(user_id = %request.user_id, "partial decryption requested");

		let sealed_share = self
			.shares
			.lock()
			.expect("share map lock poisoned")
			.get(&request.user_id)
			.cloned()
			.ok_or_else(|| Status::not_found("no share found for this user"))?;

		let secret =
			request.secret.as_ref().ok_or_else(|| Status::invalid_argument("missing secret"))?;
		let ciphertext = convert::ciphertext_from_wire(secret)?;

		let user_public_key = SealingPublicKey::from_bytes(
			<[u8; PUBLIC_KEY_SIZE]>::try_from(request.user_public_key.as_slice())
				.map_err(|_| Status::invalid_argument("malformed user public key"))?,
		);

		// The share is in the clear only inside this activation; it is
		// never written back anywhere.
		let share: KeyShare = bincode::deserialize(
			&self
				.keypair
				.open(&sealed_share)
				.map_err(|_| Status::internal("could not open stored share"))?,
		)
		.map_err(|_| Status::internal("stored share is malformed"))?;

		let partial = partial_decrypt(&ciphertext, &share);
		let encrypted_partial_decryption = seal(
			&bincode::serialize(&partial).map_err(|error| Status::internal(error.to_string()))?,
			&user_public_key,
		)
		.map_err(|error| Status::internal(error.to_string()))?;

		Ok(Response::new(DecryptResponse { encrypted_partial_decryption }))
	}
}

/// Worker entry point: serve the share-server API next to the setup unit
/// and stay registered for the lifetime of the process.
pub async fn run(worker: settings::Worker, tls: Option<settings::Tls>) -> anyhow::Result<()> {
	let server = ShareServer::new();
	let public_key = server.public_key_bytes();
	info!("starting share server");

	setup::run_worker(
		&worker,
		tls.as_ref(),
		ServiceType::ShareServer,
		public_key,
		|builder, unit| {
			builder
				.add_service(share_server_server::ShareServerServer::new(server.clone()))
				.add_service(SetupUnitServer::new(unit))
		},
	)
	.await
}
