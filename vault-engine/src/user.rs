//! The user client: owns the long-term envelope keypair and the password,
//! drives register / store / retrieve against the manager and performs the
//! final combination locally. The group key is held in the clear after
//! registration; the user's own share stays sealed until a retrieval
//! needs it.

use std::collections::HashSet;

use anyhow::{anyhow, bail, Context};
use rand::{rngs::OsRng, RngCore, SeedableRng};
use sha2::Sha256;
use srp::{client::SrpClient, groups::G_2048};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tracing::info;

use vault_crypto::{
	combine, encrypt, partial_decrypt, KeyShare, PartialDecryption, Point, Rng,
	SealingKeypair, ThresholdParams,
};
use vault_proto::vault::{
	app_request, app_response, manager_client::ManagerClient, secure_request,
	secure_response, AppRequest, AuthStep1, AuthStep3, RegisterRequest, RetrieveSecretRequest,
	SecureRequest, SecureResponse, StoreSecretRequest,
};

use crate::{convert, grpc, settings};

const SALT_SIZE: usize = 16;
const EPHEMERAL_SIZE: usize = 64;

pub struct User {
	user_id: String,
	manager_address: String,
	tls: Option<settings::Tls>,
	params: ThresholdParams,
	keypair: SealingKeypair,
	encrypted_share: Option<Vec<u8>>,
	encryption_key: Option<Point>,
	secret_ids: HashSet<String>,
}

impl User {
	pub fn new(
		user_id: &str,
		manager_address: &str,
		threshold: u32,
		total_shares: u32,
		tls: Option<settings::Tls>,
	) -> anyhow::Result<Self> {
		Ok(User {
			user_id: user_id.to_string(),
			manager_address: manager_address.to_string(),
			tls,
			params: ThresholdParams::new(threshold, total_shares)?,
			keypair: SealingKeypair::generate(),
			encrypted_share: None,
			encryption_key: None,
			secret_ids: HashSet::new(),
		})
	}

	/// Derive the SRP verifier and salt from the password, register with
	/// the manager and open the returned sealed group key.
	pub async fn register(&mut self, password: &str) -> anyhow::Result<()> {
		let client = SrpClient::<Sha256>::new(&G_2048);
		let mut salt = [0u8; SALT_SIZE];
		OsRng.fill_bytes(&mut salt);
		let verifier =
			client.compute_verifier(self.user_id.as_bytes(), password.as_bytes(), &salt);

		let channel = grpc::connect(&self.manager_address, self.tls.as_ref()).await?;
		let response = ManagerClient::new(channel)
			.register(RegisterRequest {
				user_id: self.user_id.clone(),
				verifier: hex::encode(verifier),
				salt: hex::encode(salt),
				user_public_key: self.keypair.public_key().as_bytes().to_vec(),
			})
			.await
			.context("registration failed")?
			.into_inner();

		let key_bytes = self
			.keypair
			.open(&response.encrypted_key)
			.context("could not open the sealed group key")?;
		self.encryption_key =
			Some(bincode::deserialize(&key_bytes).context("sealed group key is malformed")?);
		self.encrypted_share = Some(response.encrypted_share);
		info!(user_id = %self.user_id, "registered");
		Ok(())
	}

	pub async fn store_secret(
		&mut self,
		password: &str,
		plaintext: &[u8],
		secret_id: &str,
	) -> anyhow::Result<()> {
		let encryption_key = self.encryption_key.as_ref().context("not registered")?;
		let ciphertext = encrypt(plaintext, encryption_key, &mut Rng::from_entropy())?;

		let request = app_request::Body::Store(StoreSecretRequest {
			user_id: self.user_id.clone(),
			secret_id: secret_id.to_string(),
			secret: Some(convert::ciphertext_to_wire(&ciphertext)?),
		});
		match self.secure_call(password, request).await? {
			app_response::Body::Store(response) => {
				anyhow::ensure!(response.success, "manager rejected the secret");
			},
			app_response::Body::Retrieve(_) => bail!("unexpected application response"),
		}

		self.secret_ids.insert(secret_id.to_string());
		info!(user_id = %self.user_id, secret_id, "secret stored");
		Ok(())
	}

	/// Retrieve the ciphertext and the sealed partials, open them all,
	/// contribute our own partial and combine.
	pub async fn retrieve_secret(
		&self,
		password: &str,
		secret_id: &str,
	) -> anyhow::Result<Vec<u8>> {
		if !self.secret_ids.contains(secret_id) {
			bail!("unknown secret id {secret_id}");
		}
		let encrypted_share = self.encrypted_share.as_ref().context("not registered")?;

		let request = app_request::Body::Retrieve(RetrieveSecretRequest {
			user_id: self.user_id.clone(),
			secret_id: secret_id.to_string(),
		});
		let response = match self.secure_call(password, request).await? {
			app_response::Body::Retrieve(response) => response,
			app_response::Body::Store(_) => bail!("unexpected application response"),
		};

		let ciphertext = convert::ciphertext_from_wire(
			response.secret.as_ref().context("missing secret in response")?,
		)?;

		let mut partials =
			Vec::with_capacity(response.encrypted_partial_decryptions.len() + 1);
		for sealed in &response.encrypted_partial_decryptions {
			let partial: PartialDecryption = bincode::deserialize(
				&self.keypair.open(sealed).context("could not open a partial decryption")?,
			)
			.context("partial decryption is malformed")?;
			partials.push(partial);
		}

		// The user's own contribution completes the quorum
		let share: KeyShare = bincode::deserialize(
			&self.keypair.open(encrypted_share).context("could not open own share")?,
		)
		.context("own share is malformed")?;
		partials.push(partial_decrypt(&ciphertext, &share));

		combine(&partials, &ciphertext, &self.params)
			.context("could not combine partial decryptions")
	}

	/// Walk the SRP handshake over a fresh `SecureCall` stream, then issue
	/// one application request.
	async fn secure_call(
		&self,
		password: &str,
		request: app_request::Body,
	) -> anyhow::Result<app_response::Body> {
		let channel = grpc::connect(&self.manager_address, self.tls.as_ref()).await?;
		let mut manager = ManagerClient::new(channel);

		let (outbound, outbound_stream) = mpsc::channel(4);
		let mut inbound = manager
			.secure_call(ReceiverStream::new(outbound_stream))
			.await
			.context("secure call failed")?
			.into_inner();

		send(&outbound, secure_request::Msg::AuthStep1(AuthStep1 {
			username: self.user_id.clone(),
		}))
		.await?;

		let step2 = match next_message(&mut inbound).await? {
			secure_response::Msg::AuthStep2(step2) => step2,
			other => bail!("expected auth_step_2, got {other:?}"),
		};
		let salt = hex::decode(&step2.salt).context("malformed salt")?;
		let server_public =
			hex::decode(&step2.server_public_key).context("malformed server public key")?;

		let client = SrpClient::<Sha256>::new(&G_2048);
		let mut a = [0u8; EPHEMERAL_SIZE];
		OsRng.fill_bytes(&mut a);
		let client_public = client.compute_public_ephemeral(&a);
		let session = client
			.process_reply(
				&a,
				self.user_id.as_bytes(),
				password.as_bytes(),
				&salt,
				&server_public,
			)
			.map_err(|e| anyhow::anyhow!("could not process the server's SRP reply: {e}"))?;

		send(&outbound, secure_request::Msg::AuthStep3(AuthStep3 {
			client_public_key: hex::encode(client_public),
			client_session_key_proof: hex::encode(session.proof()),
		}))
		.await?;

		let ack = match next_message(&mut inbound).await? {
			secure_response::Msg::AuthStep3Ack(ack) => ack,
			other => bail!("expected auth_step_3_ack, got {other:?}"),
		};
		anyhow::ensure!(ack.ok, "server rejected the key proof");

		send(&outbound, secure_request::Msg::AppReq(AppRequest { body: Some(request) }))
			.await?;

		let response = match next_message(&mut inbound).await? {
			secure_response::Msg::AppResp(response) => response,
			other => bail!("expected app_resp, got {other:?}"),
		};
		response.body.context("missing application response body")
	}
}

async fn next_message(
	inbound: &mut Streaming<SecureResponse>,
) -> anyhow::Result<secure_response::Msg> {
	inbound
		.message()
		.await
		.context("secure call stream failed")?
		.context("secure call stream ended early")?
		.msg
		.context("missing message body")
}

async fn send(
	outbound: &mpsc::Sender<SecureRequest>,
	msg: secure_request::Msg,
) -> anyhow::Result<()> {
	outbound
		.send(SecureRequest { msg: Some(msg) })
		.await
		.map_err(|_| anyhow!("secure call stream closed"))
}
