//! Server side of the password-authenticated session. One task per
//! `SecureCall` stream walks the state machine
//! `AwaitStep1 -> AwaitStep3 -> AwaitApp -> Done`; any protocol violation
//! closes the stream with `InvalidArgument`, any crypto failure with
//! `Unauthenticated`.

use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use srp::{groups::G_2048, server::SrpServer};
use tokio::sync::mpsc::Sender;
use tonic::{Status, Streaming};
use tracing::debug;

use vault_proto::vault::{
	app_request, app_response, secure_request, secure_response, AppResponse, AuthStep2,
	AuthStep3Ack, SecureRequest, SecureResponse,
};

use super::Manager;

pub(super) async fn run(
	manager: &Manager,
	inbound: &mut Streaming<SecureRequest>,
	outbound: &Sender<Result<SecureResponse, Status>>,
) -> Result<(), Status> {
	let step1 = match next_message(inbound).await? {
		secure_request::Msg::AuthStep1(step1) => step1,
		_ => return Err(Status::invalid_argument("expected auth_step_1")),
	};
	debug!(username = %step1.username, "secure call started");

	// An unknown user fails exactly like a wrong password would
	let (verifier, salt) = manager
		.db
		.get_auth_client(&step1.username)
		.map_err(|_| Status::unauthenticated("authentication failed"))?;
	let verifier_bytes =
		hex::decode(&verifier).map_err(|_| Status::internal("stored verifier is malformed"))?;

	let server = SrpServer::<Sha256>::new(&G_2048);
	let mut b = [0u8; 64];
	OsRng.fill_bytes(&mut b);
	let server_public = server.compute_public_ephemeral(&b, &verifier_bytes);

	send(
		outbound,
		secure_response::Msg::AuthStep2(AuthStep2 {
			server_public_key: hex::encode(server_public),
			salt,
		}),
	)
	.await?;

	let step3 = match next_message(inbound).await? {
		secure_request::Msg::AuthStep3(step3) => step3,
		_ => return Err(Status::invalid_argument("expected auth_step_3")),
	};
	let client_public = hex::decode(&step3.client_public_key)
		.map_err(|_| Status::invalid_argument("malformed client public key"))?;
	let proof = hex::decode(&step3.client_session_key_proof)
		.map_err(|_| Status::invalid_argument("malformed key proof"))?;

	let session = server
		.process_reply(&b, &verifier_bytes, &client_public)
		.map_err(|_| Status::unauthenticated("authentication failed"))?;
	session
		.verify_client(&proof)
		.map_err(|_| Status::unauthenticated("authentication failed"))?;
	// Both sides hold the derived session key at this point; application
	// payloads ride the mutually authenticated transport, so it is
	// dropped unused.
	debug!(username = %step1.username, "client authenticated");

	send(outbound, secure_response::Msg::AuthStep3Ack(AuthStep3Ack { ok: true })).await?;

	let app_request = match next_message(inbound).await? {
		secure_request::Msg::AppReq(request) => request,
		_ => return Err(Status::invalid_argument("expected app_req")),
	};
	let body = match app_request
		.body
		.ok_or_else(|| Status::invalid_argument("missing application request body"))?
	{
		app_request::Body::Store(store) =>
			app_response::Body::Store(manager.handle_store_secret(store).await?),
		app_request::Body::Retrieve(retrieve) =>
			app_response::Body::Retrieve(manager.handle_retrieve_secret(retrieve).await?),
	};
	send(outbound, secure_response::Msg::AppResp(AppResponse { body: Some(body) })).await?;

	Ok(())
}

async fn next_message(
	inbound: &mut Streaming<SecureRequest>,
) -> Result<secure_request::Msg, Status> {
	inbound
		.message()
		.await?
		.ok_or_else(|| Status::invalid_argument("unexpected end of stream"))?
		.msg
		.ok_or_else(|| Status::invalid_argument("missing message body"))
}

async fn send(
	outbound: &Sender<Result<SecureResponse, Status>>,
	msg: secure_response::Msg,
) -> Result<(), Status> {
	outbound
		.send(Ok(SecureResponse { msg: Some(msg) }))
		.await
		.map_err(|_| Status::cancelled("client closed the stream"))
}
