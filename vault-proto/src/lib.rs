//! Generated gRPC bindings for the vault wire protocol.

pub mod vault {
	tonic::include_proto!("vault");
}

pub mod setup {
	tonic::include_proto!("setup");
}
