use std::sync::Arc;

use anyhow::Context;
use tokio::{net::TcpListener, sync::Notify};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
	transport::{server::Router, Server},
	Request, Response, Status,
};
use tracing::info;

use vault_proto::setup::{
	setup_master_client::SetupMasterClient, setup_unit_server, SetupRegisterRequest,
	SetupUnregisterRequest, TerminateRequest, TerminateResponse,
};

use crate::{grpc, settings};

use super::{ServiceData, ServiceType};

/// Runs inside every spawned worker next to its application service.
/// `Terminate` releases the worker's shutdown waiter; the permit is
/// stored, so a request arriving before the waiter is armed still lands.
#[derive(Clone)]
pub struct SetupUnit {
	shutdown: Arc<Notify>,
}

impl SetupUnit {
	pub fn new(shutdown: Arc<Notify>) -> Self {
		SetupUnit { shutdown }
	}
}

#[tonic::async_trait]
impl setup_unit_server::SetupUnit for SetupUnit {
	async fn terminate(
		&self,
		_request: Request<TerminateRequest>,
	) -> Result<Response<TerminateResponse>, Status> {
		info!("received termination request");
		self.shutdown.notify_one();
		Ok(Response::new(TerminateResponse {}))
	}
}

/// The full worker lifecycle: bind the listener, serve the application
/// service next to a `SetupUnit`, register once the listener is up, run
/// until terminated and unregister on the way out.
pub async fn run_worker(
	worker: &settings::Worker,
	tls: Option<&settings::Tls>,
	service_type: ServiceType,
	public_key: Vec<u8>,
	make_router: impl FnOnce(&mut Server, SetupUnit) -> Router,
) -> anyhow::Result<()> {
	let container_id =
		worker.container_id.clone().context("worker container id is not configured")?;

	let shutdown = Arc::new(Notify::new());
	let listener = TcpListener::bind(&worker.bind_address)
		.await
		.with_context(|| format!("could not bind {}", worker.bind_address))?;
	let advertised_address = match &worker.advertised_address {
		Some(address) => address.clone(),
		None => listener.local_addr()?.to_string(),
	};

	let mut builder = Server::builder();
	if let Some(tls) = tls {
		builder = builder.tls_config(grpc::server_tls_config(tls).await?)?;
	}
	let router = make_router(&mut builder, SetupUnit::new(shutdown.clone()));

	let serve = tokio::spawn(router.serve_with_incoming_shutdown(
		TcpListenerStream::new(listener),
		{
			let shutdown = shutdown.clone();
			async move { shutdown.notified().await }
		},
	));

	info!(%container_id, address = %advertised_address, ?service_type, "worker listening");
	let registration = register_worker(
		&worker.setup_master_address,
		tls,
		&ServiceData {
			service_type,
			container_id: container_id.clone(),
			address: advertised_address,
			public_key,
		},
	)
	.await;
	if let Err(error) = registration {
		shutdown.notify_one();
		let _ = serve.await;
		return Err(error);
	}

	serve
		.await
		.context("worker server task panicked")?
		.context("worker server failed")?;

	unregister_worker(&worker.setup_master_address, tls, &container_id).await?;
	info!(%container_id, "worker stopped");
	Ok(())
}

/// Publish this worker's address and public key to the SetupMaster.
pub async fn register_worker(
	master_address: &str,
	tls: Option<&settings::Tls>,
	data: &ServiceData,
) -> anyhow::Result<()> {
	let channel = grpc::connect(master_address, tls).await?;
	let response = SetupMasterClient::new(channel)
		.setup_register(SetupRegisterRequest {
			service_type: data.service_type.to_proto(),
			container_id: data.container_id.clone(),
			address: data.address.clone(),
			public_key: data.public_key.clone(),
		})
		.await?
		.into_inner();
	anyhow::ensure!(
		response.is_registered,
		"could not register container {} of type {:?}",
		data.container_id,
		data.service_type,
	);
	Ok(())
}

pub async fn unregister_worker(
	master_address: &str,
	tls: Option<&settings::Tls>,
	container_id: &str,
) -> anyhow::Result<()> {
	let channel = grpc::connect(master_address, tls).await?;
	let response = SetupMasterClient::new(channel)
		.setup_unregister(SetupUnregisterRequest { container_id: container_id.to_string() })
		.await?
		.into_inner();
	anyhow::ensure!(response.is_unregistered, "could not unregister container {container_id}");
	Ok(())
}
