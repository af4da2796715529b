fn main() -> Result<(), Box<dyn std::error::Error>> {
	let file_descriptors =
		protox::compile(["proto/vault.proto", "proto/setup.proto"], ["proto"])?;

	let service_generator = tonic_build::configure()
		.build_client(true)
		.build_server(true)
		.service_generator();

	let mut config = prost_build::Config::new();
	config.service_generator(service_generator);
	config.compile_fds(file_descriptors)?;

	println!("cargo:rerun-if-changed=proto/vault.proto");
	println!("cargo:rerun-if-changed=proto/setup.proto");
	Ok(())
}
