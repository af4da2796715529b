//! Test doubles for the container runtime: "containers" are tokio tasks
//! running the real worker entry points on loopback listeners, so the
//! rendezvous, fan-out and retrieval paths are exercised end to end.

use std::{
	collections::HashMap,
	path::Path,
	sync::{
		atomic::{AtomicU32, Ordering},
		Mutex,
	},
	time::Duration,
};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::{bootstrap, settings, share_server, spawner::ContainerSpawner};

#[derive(Default)]
pub struct TaskSpawner {
	workers: Mutex<HashMap<String, JoinHandle<anyhow::Result<()>>>>,
	history: Mutex<Vec<String>>,
	counter: AtomicU32,
}

impl TaskSpawner {
	pub fn new() -> Self {
		Self::default()
	}

	/// Container ids of workers still tracked (spawned, not yet reaped).
	pub fn container_ids(&self) -> Vec<String> {
		let mut ids: Vec<_> =
			self.workers.lock().expect("worker map lock poisoned").keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Every container id ever handed out, in spawn order, including
	/// workers that have since been reaped.
	pub fn spawn_history(&self) -> Vec<String> {
		self.history.lock().expect("history lock poisoned").clone()
	}
}

#[async_trait]
impl ContainerSpawner for TaskSpawner {
	async fn spawn(
		&self,
		_image: &str,
		name: &str,
		command: &str,
		_network: &str,
		env: &[(String, String)],
	) -> anyhow::Result<String> {
		let setup_master_address = env
			.iter()
			.find(|(key, _)| key == "VAULT__WORKER__SETUP_MASTER_ADDRESS")
			.map(|(_, value)| value.clone())
			.context("spawn env is missing the setup master address")?;

		let index = self.counter.fetch_add(1, Ordering::Relaxed);
		let container_id = format!("task-{index}-{name}");

		let worker = settings::Worker {
			bind_address: "127.0.0.1:0".to_string(),
			advertised_address: None,
			setup_master_address,
			container_id: Some(container_id.clone()),
		};

		let handle = match command {
			"vault-share-server" => tokio::spawn(share_server::run(worker, None)),
			"vault-bootstrap" => tokio::spawn(bootstrap::run(worker, None)),
			other => bail!("unknown worker command `{other}`"),
		};
		self.workers
			.lock()
			.expect("worker map lock poisoned")
			.insert(container_id.clone(), handle);
		self.history.lock().expect("history lock poisoned").push(container_id.clone());
		Ok(container_id)
	}

	async fn wait_for_stop(
		&self,
		container_id: &str,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let handle = self
			.workers
			.lock()
			.expect("worker map lock poisoned")
			.remove(container_id)
			.with_context(|| format!("unknown container {container_id}"))?;

		let abort = handle.abort_handle();
		match tokio::time::timeout(timeout, handle).await {
			Ok(join_result) => join_result.context("worker task panicked")?,
			Err(_) => {
				abort.abort();
				Err(anyhow!("container {container_id} did not stop in time"))
			},
		}
	}

	async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
		// Already reaped in wait_for_stop; abort a straggler
		if let Some(handle) =
			self.workers.lock().expect("worker map lock poisoned").remove(container_id)
		{
			handle.abort();
		}
		Ok(())
	}
}

/// Settings for a fully loopback vault with ephemeral ports and a scratch
/// database.
pub fn loopback_settings(db_path: &Path, num_share_servers: u32) -> settings::Settings {
	settings::Settings {
		manager: settings::Manager {
			bind_address: "127.0.0.1:0".to_string(),
			setup_bind_address: "127.0.0.1:0".to_string(),
			num_share_servers,
			..Default::default()
		},
		worker: Default::default(),
		persistence: settings::Persistence { path: db_path.to_path_buf() },
		tls: None,
	}
}
