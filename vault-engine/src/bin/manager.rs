use std::sync::Arc;

use clap::Parser;

use vault_engine::{
	logging,
	manager::Manager,
	settings::{CommandLineOptions, Settings},
	spawner::ProcessSpawner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let options = CommandLineOptions::parse();
	logging::init_json_logging();

	let mut settings = Settings::new(options.config_file.as_deref())?;
	if let Some(bind_address) = options.bind_address {
		settings.manager.bind_address = bind_address;
	}
	if let Some(num_share_servers) = options.num_share_servers {
		settings.manager.num_share_servers = num_share_servers;
	}

	let manager = Manager::start(&settings, Arc::new(ProcessSpawner::new())).await?;

	tokio::signal::ctrl_c().await?;
	manager.stop().await;
	Ok(())
}
