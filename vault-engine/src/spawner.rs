//! The process-spawning capability consumed by the lifecycle controller.
//! The controller never inspects image internals; production deployments
//! implement this against their container runtime. `ProcessSpawner` runs
//! workers as local child processes for single-host deployments.

use std::{
	collections::HashMap,
	sync::Mutex,
	time::Duration,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::debug;

#[cfg_attr(any(test, feature = "test"), mockall::automock)]
#[async_trait]
pub trait ContainerSpawner: Send + Sync {
	/// Start a container and return its id. The worker inside is expected
	/// to register with the SetupMaster on its own.
	async fn spawn(
		&self,
		image: &str,
		name: &str,
		command: &str,
		network: &str,
		env: &[(String, String)],
	) -> anyhow::Result<String>;

	async fn wait_for_stop(&self, container_id: &str, timeout: Duration)
		-> anyhow::Result<()>;

	async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}

/// Runs each worker as a local child process. The worker learns its
/// identity from `VAULT_CONTAINER_ID` and the rendezvous address from the
/// environment the controller passes along.
#[derive(Default)]
pub struct ProcessSpawner {
	children: Mutex<HashMap<String, tokio::process::Child>>,
}

impl ProcessSpawner {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl ContainerSpawner for ProcessSpawner {
	async fn spawn(
		&self,
		_image: &str,
		name: &str,
		command: &str,
		_network: &str,
		env: &[(String, String)],
	) -> anyhow::Result<String> {
		let mut parts = command.split_whitespace();
		let program = parts.next().context("empty worker command")?;

		let mut child_command = tokio::process::Command::new(program);
		child_command.args(parts).env("VAULT_CONTAINER_ID", name);
		for (key, value) in env {
			child_command.env(key, value);
		}

		debug!(name, command, "spawning worker process");
		let child = child_command
			.spawn()
			.with_context(|| format!("could not spawn worker process `{command}`"))?;
		self.children.lock().expect("child map lock poisoned").insert(name.to_string(), child);
		Ok(name.to_string())
	}

	async fn wait_for_stop(
		&self,
		container_id: &str,
		timeout: Duration,
	) -> anyhow::Result<()> {
		let mut child = self
			.children
			.lock()
			.expect("child map lock poisoned")
			.remove(container_id)
			.with_context(|| format!("unknown worker process {container_id}"))?;

		match tokio::time::timeout(timeout, child.wait()).await {
			Ok(status) => {
				status.context("could not reap worker process")?;
				Ok(())
			},
			Err(_) => {
				let _ = child.start_kill();
				bail!("worker process {container_id} did not stop in time");
			},
		}
	}

	async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
		// Normally already reaped by wait_for_stop; kill a straggler
		if let Some(mut child) =
			self.children.lock().expect("child map lock poisoned").remove(container_id)
		{
			let _ = child.start_kill();
		}
		Ok(())
	}
}
