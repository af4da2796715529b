//! Central orchestrator: terminates user sessions, persists ciphertexts
//! and user records, spawns and reaps workers through the lifecycle
//! controller, fans shares out and collects sealed partial decryptions.

mod session;

use std::{
	net::SocketAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
};

use anyhow::Context;
use prost::Message;
use tokio::{
	net::TcpListener,
	sync::{mpsc, Notify},
	task::JoinHandle,
};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{transport::Server, Request, Response, Status, Streaming};
use tracing::{info, warn};

use vault_proto::{
	setup::setup_master_server::SetupMasterServer,
	vault::{
		bootstrap_client::BootstrapClient, manager_server, share_server_client::ShareServerClient,
		Ciphertext, DecryptRequest, DeleteShareRequest, GenerateSharesRequest,
		GenerateSharesResponse, RegisterRequest, RegisterResponse, RetrieveSecretRequest,
		RetrieveSecretResponse, SecureRequest, SecureResponse, StoreSecretRequest,
		StoreSecretResponse, StoreShareRequest,
	},
};

use crate::{
	constants::SHUTDOWN_GRACE_PERIOD,
	convert,
	db::{Database, DbError},
	grpc, settings,
	setup::{ServiceData, ServiceType, SetupMaster},
	spawner::ContainerSpawner,
};

type ServeHandle = JoinHandle<Result<(), tonic::transport::Error>>;

#[derive(Clone)]
pub struct Manager {
	db: Arc<Database>,
	setup: SetupMaster,
	tls: Option<settings::Tls>,
	num_share_servers: u32,
	ready: Arc<AtomicBool>,
	share_servers: Arc<Mutex<Vec<ServiceData>>>,
	user_address: SocketAddr,
	setup_address: SocketAddr,
	user_shutdown: Arc<Notify>,
	setup_shutdown: Arc<Notify>,
	user_handle: Arc<Mutex<Option<ServeHandle>>>,
	setup_handle: Arc<Mutex<Option<ServeHandle>>>,
}

impl Manager {
	/// Bring the whole system up: persistence, the SetupMaster listener,
	/// the share-server fleet (blocking on each registration) and finally
	/// the user-facing listener.
	pub async fn start(
		settings: &settings::Settings,
		spawner: Arc<dyn ContainerSpawner>,
	) -> anyhow::Result<Manager> {
		let db = Arc::new(
			Database::open(&settings.persistence.path).context("could not open the database")?,
		);

		// The rendezvous listener must be reachable before any worker is
		// spawned.
		let setup_listener = TcpListener::bind(&settings.manager.setup_bind_address)
			.await
			.with_context(|| {
				format!("could not bind {}", settings.manager.setup_bind_address)
			})?;
		let setup_address = setup_listener.local_addr()?;
		let advertised_setup_address = settings
			.manager
			.advertised_setup_address
			.clone()
			.unwrap_or_else(|| setup_address.to_string());

		let setup = SetupMaster::new(
			db.clone(),
			spawner,
			settings.manager.clone(),
			settings.tls.clone(),
			advertised_setup_address,
		);

		let setup_shutdown = Arc::new(Notify::new());
		let setup_handle = {
			let mut builder = Server::builder();
			if let Some(tls) = &settings.tls {
				builder = builder.tls_config(grpc::server_tls_config(tls).await?)?;
			}
			let router = builder.add_service(SetupMasterServer::new(setup.clone()));
			let shutdown = setup_shutdown.clone();
			tokio::spawn(router.serve_with_incoming_shutdown(
				TcpListenerStream::new(setup_listener),
				async move { shutdown.notified().await },
			))
		};
		info!(%setup_address, "setup master listening");

		let mut share_servers = Vec::new();
		for _ in 0..settings.manager.num_share_servers {
			let server = setup
				.spawn_share_server()
				.await
				.context("could not bring up the share-server fleet")?;
			info!(
				container_id = %server.container_id,
				address = %server.address,
				"share server up"
			);
			share_servers.push(server);
		}

		let user_listener = TcpListener::bind(&settings.manager.bind_address)
			.await
			.with_context(|| format!("could not bind {}", settings.manager.bind_address))?;
		let user_address = user_listener.local_addr()?;

		let manager = Manager {
			db,
			setup,
			tls: settings.tls.clone(),
			num_share_servers: settings.manager.num_share_servers,
			ready: Arc::new(AtomicBool::new(false)),
			share_servers: Arc::new(Mutex::new(share_servers)),
			user_address,
			setup_address,
			user_shutdown: Arc::new(Notify::new()),
			setup_shutdown,
			user_handle: Arc::new(Mutex::new(None)),
			setup_handle: Arc::new(Mutex::new(Some(setup_handle))),
		};

		let user_handle = {
			let mut builder = Server::builder();
			if let Some(tls) = &settings.tls {
				builder = builder.tls_config(grpc::server_tls_config(tls).await?)?;
			}
			let router = builder.add_service(manager_server::ManagerServer::new(manager.clone()));
			let shutdown = manager.user_shutdown.clone();
			tokio::spawn(router.serve_with_incoming_shutdown(
				TcpListenerStream::new(user_listener),
				async move { shutdown.notified().await },
			))
		};
		*manager.user_handle.lock().expect("handle lock poisoned") = Some(user_handle);

		manager.ready.store(true, Ordering::SeqCst);
		info!(%user_address, "manager ready");
		Ok(manager)
	}

	/// Graceful shutdown: stop taking user calls, terminate the fleet
	/// through the rendezvous, then stop the rendezvous itself.
	pub async fn stop(&self) {
		info!("shutting down manager");
		self.ready.store(false, Ordering::SeqCst);

		let user_handle = self.user_handle.lock().expect("handle lock poisoned").take();
		stop_listener(&self.user_shutdown, user_handle).await;

		let share_servers: Vec<_> = {
			let mut servers = self.share_servers.lock().expect("server list lock poisoned");
			servers.drain(..).collect()
		};
		for server in share_servers {
			if let Err(error) = self.setup.terminate_service(&server).await {
				warn!(
					container_id = %server.container_id,
					"failed to terminate share server: {error}"
				);
			}
		}

		let setup_handle = self.setup_handle.lock().expect("handle lock poisoned").take();
		stop_listener(&self.setup_shutdown, setup_handle).await;
		info!("manager stopped");
	}

	/// The user-facing listener's actual address.
	pub fn user_address(&self) -> SocketAddr {
		self.user_address
	}

	pub fn setup_address(&self) -> SocketAddr {
		self.setup_address
	}

	fn ensure_ready(&self) -> Result<(), Status> {
		if !self.ready.load(Ordering::SeqCst) {
			return Err(Status::unavailable("manager is not ready"));
		}
		Ok(())
	}

	fn ensure_user_exists(&self, user_id: &str) -> Result<(), Status> {
		match self.db.user_exists(user_id) {
			Ok(true) => Ok(()),
			Ok(false) => Err(Status::not_found("user does not exist")),
			Err(error) => Err(internal(error)),
		}
	}

	async fn generate_shares(
		&self,
		bootstrap: &ServiceData,
		share_count: u32,
		public_keys: Vec<Vec<u8>>,
	) -> Result<GenerateSharesResponse, Status> {
		let channel = grpc::connect(&bootstrap.address, self.tls.as_ref())
			.await
			.map_err(|error| {
				Status::unavailable(format!("could not reach bootstrap: {error:#}"))
			})?;
		Ok(BootstrapClient::new(channel)
			.generate_shares(GenerateSharesRequest {
				// All holders must cooperate to decrypt
				threshold: share_count,
				num_of_shares: share_count,
				public_keys,
			})
			.await?
			.into_inner())
	}

	async fn store_share_on(
		&self,
		server: &ServiceData,
		user_id: &str,
		encrypted_share: &[u8],
	) -> Result<(), Status> {
		let channel =
			grpc::connect(&server.address, self.tls.as_ref()).await.map_err(|error| {
				Status::unavailable(format!("could not reach share server: {error:#}"))
			})?;
		let response = ShareServerClient::new(channel)
			.store_share(StoreShareRequest {
				user_id: user_id.to_string(),
				encrypted_share: encrypted_share.to_vec(),
			})
			.await?
			.into_inner();
		if !response.success {
			return Err(Status::internal(format!(
				"share server {} rejected the share",
				server.address
			)));
		}
		Ok(())
	}

	/// Best-effort removal of shares already placed by a registration
	/// that failed partway.
	async fn rollback_shares(&self, user_id: &str, servers: &[ServiceData]) {
		for server in servers {
			let result = match grpc::connect(&server.address, self.tls.as_ref()).await {
				Ok(channel) => ShareServerClient::new(channel)
					.delete_share(DeleteShareRequest { user_id: user_id.to_string() })
					.await
					.map(|_| ())
					.map_err(anyhow::Error::from),
				Err(error) => Err(error),
			};
			if let Err(error) = result {
				warn!(address = %server.address, "share rollback failed: {error:#}");
			}
		}
	}

	pub(crate) async fn handle_store_secret(
		&self,
		request: StoreSecretRequest,
	) -> Result<StoreSecretResponse, Status> {
		info!(user_id = %request.user_id, secret_id = %request.secret_id, "storing secret");
		self.ensure_ready()?;
		self.ensure_user_exists(&request.user_id)?;

		let secret = request
			.secret
			.as_ref()
			.ok_or_else(|| Status::invalid_argument("missing secret"))?;
		// Reject malformed ciphertexts before they reach storage
		convert::ciphertext_from_wire(secret)?;

		match self.db.add_secret(&request.user_id, &request.secret_id, &secret.encode_to_vec())
		{
			Ok(()) => Ok(StoreSecretResponse { success: true }),
			Err(DbError::AlreadyExists) =>
				Err(Status::already_exists("secret id already in use")),
			Err(error) => Err(internal(error)),
		}
	}

	pub(crate) async fn handle_retrieve_secret(
		&self,
		request: RetrieveSecretRequest,
	) -> Result<RetrieveSecretResponse, Status> {
		info!(user_id = %request.user_id, secret_id = %request.secret_id, "retrieving secret");
		self.ensure_ready()?;
		self.ensure_user_exists(&request.user_id)?;

		let secret_bytes = match self.db.get_secret(&request.user_id, &request.secret_id) {
			Ok(bytes) => bytes,
			Err(DbError::NotFound) => return Err(Status::not_found("secret not found")),
			Err(error) => return Err(internal(error)),
		};
		let secret = Ciphertext::decode(secret_bytes.as_slice())
			.map_err(|_| Status::internal("stored secret is malformed"))?;

		let user_public_key = self.db.get_user_public_key(&request.user_id).map_err(internal)?;

		// Fan out in registration order; each sealed partial carries its
		// share index internally, so collection order is irrelevant to
		// the final combination.
		let servers = self.db.get_servers(ServiceType::ShareServer).map_err(internal)?;
		let mut encrypted_partial_decryptions = Vec::with_capacity(servers.len());
		for server in &servers {
			let channel =
				grpc::connect(&server.address, self.tls.as_ref()).await.map_err(|error| {
					Status::unavailable(format!("could not reach share server: {error:#}"))
				})?;
			let response = ShareServerClient::new(channel)
				.decrypt(DecryptRequest {
					user_id: request.user_id.clone(),
					secret: Some(secret.clone()),
					user_public_key: user_public_key.clone(),
				})
				.await?
				.into_inner();
			encrypted_partial_decryptions.push(response.encrypted_partial_decryption);
		}

		Ok(RetrieveSecretResponse { secret: Some(secret), encrypted_partial_decryptions })
	}
}

#[tonic::async_trait]
impl manager_server::Manager for Manager {
	async fn register(
		&self,
		request: Request<RegisterRequest>,
	) -> Result<Response<RegisterResponse>, Status> {
		let request = request.into_inner();
		info!(user_id = %request.user_id, "received registration request");
		self.ensure_ready()?;

		// Auth and user records are create-only; a duplicate registration
		// fails on whichever row lands first.
		match self.db.add_auth_client(&request.user_id, &request.verifier, &request.salt) {
			Ok(()) => {},
			Err(DbError::AlreadyExists) =>
				return Err(Status::already_exists("user already exists")),
			Err(error) => return Err(internal(error)),
		}
		match self.db.add_user(&request.user_id, &request.user_public_key) {
			Ok(()) => {},
			Err(DbError::AlreadyExists) =>
				return Err(Status::already_exists("user already exists")),
			Err(error) => return Err(internal(error)),
		}

		let servers = self.db.get_servers(ServiceType::ShareServer).map_err(internal)?;
		if servers.len() != self.num_share_servers as usize {
			return Err(Status::failed_precondition(format!(
				"share server count mismatch: {} registered, {} required",
				servers.len(),
				self.num_share_servers
			)));
		}

		// One recipient per share, in share-index order; the user's key
		// goes last and also receives the group key.
		let mut public_keys: Vec<Vec<u8>> =
			servers.iter().map(|server| server.public_key.clone()).collect();
		public_keys.push(request.user_public_key.clone());
		let share_count = public_keys.len() as u32;

		let bootstrap = self.setup.spawn_bootstrap().await.map_err(Status::from)?;
		let result = self.generate_shares(&bootstrap, share_count, public_keys).await;
		// The dealer vanishes as soon as the response is in, success or
		// not; it held the only copy of the group secret.
		if let Err(error) = self.setup.terminate_service(&bootstrap).await {
			warn!(
				container_id = %bootstrap.container_id,
				"failed to terminate bootstrap: {error}"
			);
		}
		let response = result?;

		let mut encrypted_shares = response.encrypted_shares;
		if encrypted_shares.len() != share_count as usize {
			return Err(Status::internal("bootstrap returned the wrong number of shares"));
		}
		let user_share = encrypted_shares.pop().expect("share_count >= 1");

		// Ordered fan-out: share i is sealed to share server i's key and
		// only that server can open it.
		for (position, (encrypted_share, server)) in
			encrypted_shares.iter().zip(&servers).enumerate()
		{
			if let Err(error) =
				self.store_share_on(server, &request.user_id, encrypted_share).await
			{
				warn!(address = %server.address, "storing share failed: {error}");
				self.rollback_shares(&request.user_id, &servers[..position]).await;
				return Err(error);
			}
		}

		info!(user_id = %request.user_id, "registration complete");
		Ok(Response::new(RegisterResponse {
			encrypted_share: user_share,
			encrypted_key: response.encrypted_key,
		}))
	}

	type SecureCallStream = ReceiverStream<Result<SecureResponse, Status>>;

	async fn secure_call(
		&self,
		request: Request<Streaming<SecureRequest>>,
	) -> Result<Response<Self::SecureCallStream>, Status> {
		let mut inbound = request.into_inner();
		let (outbound, stream) = mpsc::channel(4);

		let manager = self.clone();
		tokio::spawn(async move {
			if let Err(status) = session::run(&manager, &mut inbound, &outbound).await {
				// Surfacing the status closes the stream; per-stream SRP
				// state dies with this task.
				let _ = outbound.send(Err(status)).await;
			}
		});

		Ok(Response::new(ReceiverStream::new(stream)))
	}
}

async fn stop_listener(shutdown: &Notify, handle: Option<ServeHandle>) {
	shutdown.notify_one();
	if let Some(handle) = handle {
		let abort = handle.abort_handle();
		if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, handle).await.is_err() {
			warn!("listener did not drain within the grace period, aborting");
			abort.abort();
		}
	}
}

fn internal(error: impl ToString) -> Status {
	Status::internal(error.to_string())
}
