use std::{
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use tokio::sync::Notify;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use vault_proto::setup::{
	setup_master_server, setup_unit_client::SetupUnitClient, SetupRegisterRequest,
	SetupRegisterResponse, SetupUnregisterRequest, SetupUnregisterResponse, TerminateRequest,
};

use crate::{
	constants::{CONTAINER_STOP_TIMEOUT, REGISTRATION_TIMEOUT},
	db::{Database, DbError},
	grpc, settings,
	spawner::ContainerSpawner,
};

use super::{ServiceData, ServiceType, SetupError};

/// The manager-side rendezvous: serves `SetupRegister`/`SetupUnregister`,
/// spawns workers through the container capability and blocks callers on
/// registry changes. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct SetupMaster {
	db: Arc<Database>,
	spawner: Arc<dyn ContainerSpawner>,
	launch: Arc<settings::Manager>,
	tls: Option<settings::Tls>,
	/// The address spawned workers are told to dial back to.
	advertised_address: String,
	registry_changed: Arc<Notify>,
	share_server_counter: Arc<AtomicU32>,
	bootstrap_counter: Arc<AtomicU32>,
}

impl SetupMaster {
	pub fn new(
		db: Arc<Database>,
		spawner: Arc<dyn ContainerSpawner>,
		launch: settings::Manager,
		tls: Option<settings::Tls>,
		advertised_address: String,
	) -> Self {
		SetupMaster {
			db,
			spawner,
			launch: Arc::new(launch),
			tls,
			advertised_address,
			registry_changed: Arc::new(Notify::new()),
			share_server_counter: Arc::new(AtomicU32::new(0)),
			bootstrap_counter: Arc::new(AtomicU32::new(0)),
		}
	}

	pub async fn spawn_share_server(&self) -> Result<ServiceData, SetupError> {
		let index = self.share_server_counter.fetch_add(1, Ordering::Relaxed);
		let command = self.launch.share_server_command.clone();
		self.spawn_worker(format!("vault-share-{index}"), &command).await
	}

	pub async fn spawn_bootstrap(&self) -> Result<ServiceData, SetupError> {
		let index = self.bootstrap_counter.fetch_add(1, Ordering::Relaxed);
		let command = self.launch.bootstrap_command.clone();
		self.spawn_worker(format!("vault-bootstrap-{index}"), &command).await
	}

	/// Spawn a container and return only once its registration row has
	/// landed, so the caller gets a dialable address and published key in
	/// one step.
	async fn spawn_worker(&self, name: String, command: &str) -> Result<ServiceData, SetupError> {
		debug!(name, "spawning worker container");
		let env = [(
			"VAULT__WORKER__SETUP_MASTER_ADDRESS".to_string(),
			self.advertised_address.clone(),
		)];
		let container_id = self
			.spawner
			.spawn(&self.launch.image, &name, command, &self.launch.network, &env)
			.await
			.map_err(SetupError::Spawner)?;
		self.wait_for_registration(&container_id, REGISTRATION_TIMEOUT).await
	}

	/// Ask the worker to terminate itself, wait until it has unregistered
	/// and its container stopped, then reclaim the container.
	pub async fn terminate_service(&self, service: &ServiceData) -> Result<(), SetupError> {
		info!(container_id = %service.container_id, "terminating worker");
		let channel = grpc::connect(&service.address, self.tls.as_ref())
			.await
			.map_err(SetupError::WorkerUnreachable)?;
		SetupUnitClient::new(channel).terminate(TerminateRequest {}).await?;

		self.wait_for_unregistration(&service.container_id, REGISTRATION_TIMEOUT).await?;

		if let Err(error) =
			self.spawner.wait_for_stop(&service.container_id, CONTAINER_STOP_TIMEOUT).await
		{
			warn!(
				container_id = %service.container_id,
				"worker container did not stop cleanly: {error:#}"
			);
		}
		self.spawner.remove(&service.container_id).await.map_err(SetupError::Spawner)?;
		Ok(())
	}

	pub async fn wait_for_registration(
		&self,
		container_id: &str,
		timeout: Duration,
	) -> Result<ServiceData, SetupError> {
		let deadline = Instant::now() + timeout;
		loop {
			// Arm the waiter before checking the predicate so a
			// notification landing between check and wait is not lost.
			let notified = self.registry_changed.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if let Some(data) = self.db.get_server(container_id)? {
				return Ok(data);
			}

			let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
				return Err(SetupError::RegistrationTimeout(container_id.to_string()));
			};
			// A wakeup may be spurious or for another container; the loop
			// rechecks. An expired wait gets one final check above.
			let _ = tokio::time::timeout(remaining, notified).await;
		}
	}

	pub async fn wait_for_unregistration(
		&self,
		container_id: &str,
		timeout: Duration,
	) -> Result<(), SetupError> {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.registry_changed.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if self.db.get_server(container_id)?.is_none() {
				return Ok(());
			}

			let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
				return Err(SetupError::UnregistrationTimeout(container_id.to_string()));
			};
			let _ = tokio::time::timeout(remaining, notified).await;
		}
	}
}

#[tonic::async_trait]
impl setup_master_server::SetupMaster for SetupMaster {
	async fn setup_register(
		&self,
		request: Request<SetupRegisterRequest>,
	) -> Result<Response<SetupRegisterResponse>, Status> {
		let request = request.into_inner();
		let service_type = ServiceType::from_proto(request.service_type)
			.ok_or_else(|| Status::invalid_argument("unknown service type"))?;
		let data = ServiceData {
			service_type,
			container_id: request.container_id,
			address: request.address,
			public_key: request.public_key,
		};

		let is_registered = match self.db.add_server(&data) {
			Ok(()) => {
				info!(
					container_id = %data.container_id,
					address = %data.address,
					"registered worker"
				);
				true
			},
			Err(DbError::AlreadyExists) => {
				warn!(container_id = %data.container_id, "duplicate registration rejected");
				false
			},
			Err(error) => return Err(Status::internal(error.to_string())),
		};
		self.registry_changed.notify_waiters();

		Ok(Response::new(SetupRegisterResponse { is_registered }))
	}

	async fn setup_unregister(
		&self,
		request: Request<SetupUnregisterRequest>,
	) -> Result<Response<SetupUnregisterResponse>, Status> {
		let request = request.into_inner();

		let is_unregistered = match self.db.remove_server(&request.container_id) {
			Ok(()) => {
				info!(container_id = %request.container_id, "unregistered worker");
				true
			},
			// Unknown ids are reported, not raised
			Err(DbError::NotFound) => false,
			Err(error) => return Err(Status::internal(error.to_string())),
		};
		self.registry_changed.notify_waiters();

		Ok(Response::new(SetupUnregisterResponse { is_unregistered }))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::spawner::MockContainerSpawner;
	use vault_proto::setup::setup_master_server::SetupMaster as SetupMasterApi;

	fn setup_master(db: Arc<Database>) -> SetupMaster {
		SetupMaster::new(
			db,
			Arc::new(MockContainerSpawner::new()),
			settings::Manager::default(),
			None,
			"127.0.0.1:50050".to_string(),
		)
	}

	fn register_request(container_id: &str) -> Request<SetupRegisterRequest> {
		Request::new(SetupRegisterRequest {
			service_type: ServiceType::ShareServer.to_proto(),
			container_id: container_id.to_string(),
			address: "127.0.0.1:7000".to_string(),
			public_key: vec![2; 32],
		})
	}

	#[tokio::test]
	async fn register_is_rejected_per_duplicate_container_id() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));

		let first = master.setup_register(register_request("w-0")).await.unwrap();
		assert!(first.into_inner().is_registered);

		let second = master.setup_register(register_request("w-0")).await.unwrap();
		assert!(!second.into_inner().is_registered);
	}

	#[tokio::test]
	async fn unregister_of_unknown_container_is_not_an_error() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));

		let response = master
			.setup_unregister(Request::new(SetupUnregisterRequest {
				container_id: "missing".to_string(),
			}))
			.await
			.unwrap();
		assert!(!response.into_inner().is_unregistered);
	}

	#[tokio::test]
	async fn wait_returns_for_an_already_registered_container() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));
		master.setup_register(register_request("w-0")).await.unwrap();

		let data =
			master.wait_for_registration("w-0", Duration::from_millis(100)).await.unwrap();
		assert_eq!(data.container_id, "w-0");
	}

	#[tokio::test]
	async fn wait_wakes_up_on_a_late_registration() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));

		let waiter = {
			let master = master.clone();
			tokio::spawn(async move {
				master.wait_for_registration("w-0", Duration::from_secs(5)).await
			})
		};

		tokio::time::sleep(Duration::from_millis(50)).await;
		master.setup_register(register_request("w-0")).await.unwrap();

		let data = waiter.await.unwrap().unwrap();
		assert_eq!(data.address, "127.0.0.1:7000");
	}

	#[tokio::test]
	async fn wait_times_out_when_nothing_registers() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));

		assert!(matches!(
			master.wait_for_registration("w-0", Duration::from_millis(50)).await,
			Err(SetupError::RegistrationTimeout(_))
		));
	}

	#[tokio::test]
	async fn unregistration_wait_follows_removal() {
		let master = setup_master(Arc::new(Database::open_in_memory().unwrap()));
		master.setup_register(register_request("w-0")).await.unwrap();

		let waiter = {
			let master = master.clone();
			tokio::spawn(async move {
				master.wait_for_unregistration("w-0", Duration::from_secs(5)).await
			})
		};

		tokio::time::sleep(Duration::from_millis(50)).await;
		master
			.setup_unregister(Request::new(SetupUnregisterRequest {
				container_id: "w-0".to_string(),
			}))
			.await
			.unwrap();

		waiter.await.unwrap().unwrap();
	}
}
