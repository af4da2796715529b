use std::path::PathBuf;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Mutual-TLS material. When absent, listeners and clients fall back to
/// plaintext loopback transport (tests only).
#[derive(Debug, Deserialize, Clone)]
pub struct Tls {
	pub ca_cert: PathBuf,
	pub cert: PathBuf,
	pub key: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Persistence {
	pub path: PathBuf,
}

impl Default for Persistence {
	fn default() -> Self {
		Persistence { path: PathBuf::from("vault.sqlite3") }
	}
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Manager {
	/// User-facing listener.
	pub bind_address: String,
	/// SetupMaster listener the spawned workers dial back to.
	pub setup_bind_address: String,
	/// Address workers are told to dial; defaults to the bound address.
	pub advertised_setup_address: Option<String>,
	pub num_share_servers: u32,
	/// Container image and network the workers are spawned into.
	pub image: String,
	pub network: String,
	pub share_server_command: String,
	pub bootstrap_command: String,
}

impl Default for Manager {
	fn default() -> Self {
		Manager {
			bind_address: "0.0.0.0:50051".to_string(),
			setup_bind_address: "0.0.0.0:50050".to_string(),
			advertised_setup_address: None,
			num_share_servers: 3,
			image: "vault".to_string(),
			network: "vault-net".to_string(),
			share_server_command: "vault-share-server".to_string(),
			bootstrap_command: "vault-bootstrap".to_string(),
		}
	}
}

/// Settings shared by the share-server and bootstrap worker binaries.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Worker {
	pub bind_address: String,
	/// Address other components can dial; defaults to the bound address.
	pub advertised_address: Option<String>,
	pub setup_master_address: String,
	/// Identity under which this worker registers. Injected by the
	/// container runtime.
	pub container_id: Option<String>,
}

impl Default for Worker {
	fn default() -> Self {
		Worker {
			bind_address: "0.0.0.0:0".to_string(),
			advertised_address: None,
			setup_master_address: "127.0.0.1:50050".to_string(),
			container_id: None,
		}
	}
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
	pub manager: Manager,
	pub worker: Worker,
	pub persistence: Persistence,
	pub tls: Option<Tls>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	#[clap(long = "config", help = "Path to the settings file")]
	pub config_file: Option<String>,

	#[clap(long, help = "Override the listener bind address")]
	pub bind_address: Option<String>,

	#[clap(long, help = "Override the number of share servers")]
	pub num_share_servers: Option<u32>,

	#[clap(
		long,
		env = "VAULT_CONTAINER_ID",
		help = "Container id this worker registers under"
	)]
	pub container_id: Option<String>,

	#[clap(long, help = "Override the SetupMaster address workers dial")]
	pub setup_master_address: Option<String>,
}

impl Settings {
	/// Layered configuration: optional TOML file, then `VAULT__`-prefixed
	/// environment variables (e.g. `VAULT__MANAGER__BIND_ADDRESS`).
	pub fn new(config_file: Option<&str>) -> Result<Self, ConfigError> {
		let mut builder = Config::builder();
		if let Some(path) = config_file {
			builder = builder.add_source(File::with_name(path));
		}
		builder
			.add_source(
				Environment::with_prefix("VAULT")
					.prefix_separator("__")
					.separator("__")
					.try_parsing(true),
			)
			.build()?
			.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_without_a_config_file() {
		let settings = Settings::new(None).unwrap();
		assert_eq!(settings.manager.num_share_servers, 3);
		assert_eq!(settings.worker.bind_address, "0.0.0.0:0");
		assert!(settings.tls.is_none());
	}
}
