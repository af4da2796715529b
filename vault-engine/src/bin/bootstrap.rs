use clap::Parser;

use vault_engine::{
	bootstrap,
	logging,
	settings::{CommandLineOptions, Settings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let options = CommandLineOptions::parse();
	logging::init_json_logging();

	let mut settings = Settings::new(options.config_file.as_deref())?;
	if let Some(bind_address) = options.bind_address {
		settings.worker.bind_address = bind_address;
	}
	if let Some(setup_master_address) = options.setup_master_address {
		settings.worker.setup_master_address = setup_master_address;
	}
	if options.container_id.is_some() {
		settings.worker.container_id = options.container_id;
	}

	bootstrap::run(settings.worker, settings.tls).await
}
