//! Service-lifecycle controller: the registration rendezvous between the
//! manager and its spawned workers. Workers register on start and
//! unregister on shutdown; the manager blocks on those events through a
//! persistent registry guarded by a single notification primitive.

mod master;
mod unit;

pub use master::SetupMaster;
pub use unit::{register_worker, run_worker, unregister_worker, SetupUnit};

use crate::db::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
	ShareServer,
	Bootstrap,
}

impl ServiceType {
	pub(crate) fn as_i64(self) -> i64 {
		match self {
			ServiceType::ShareServer => 0,
			ServiceType::Bootstrap => 1,
		}
	}

	pub(crate) fn from_i64(value: i64) -> Option<Self> {
		match value {
			0 => Some(ServiceType::ShareServer),
			1 => Some(ServiceType::Bootstrap),
			_ => None,
		}
	}

	pub fn from_proto(value: i32) -> Option<Self> {
		Self::from_i64(i64::from(value))
	}

	pub fn to_proto(self) -> i32 {
		self.as_i64() as i32
	}
}

/// A fully constructed worker as published through `SetupRegister`:
/// dialable address plus the worker's long-term envelope public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
	pub service_type: ServiceType,
	pub container_id: String,
	pub address: String,
	pub public_key: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
	#[error("timed out waiting for registration of container {0}")]
	RegistrationTimeout(String),
	#[error("timed out waiting for unregistration of container {0}")]
	UnregistrationTimeout(String),
	#[error("spawner failure: {0:#}")]
	Spawner(anyhow::Error),
	#[error("could not reach worker: {0:#}")]
	WorkerUnreachable(anyhow::Error),
	#[error("worker rpc failed: {0}")]
	Rpc(#[from] tonic::Status),
	#[error(transparent)]
	Db(#[from] DbError),
}

impl From<SetupError> for tonic::Status {
	fn from(error: SetupError) -> Self {
		match &error {
			SetupError::RegistrationTimeout(_) | SetupError::UnregistrationTimeout(_) =>
				tonic::Status::deadline_exceeded(error.to_string()),
			_ => tonic::Status::internal(error.to_string()),
		}
	}
}
