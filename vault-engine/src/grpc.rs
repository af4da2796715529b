//! Channel and TLS plumbing shared by every component. All inter-component
//! traffic is gRPC over mutual TLS rooted in a single CA; plaintext is
//! only used on loopback in tests.

use anyhow::Context;
use tonic::transport::{
	Certificate, Channel, ClientTlsConfig, Endpoint, Identity, ServerTlsConfig,
};

use crate::settings;

pub async fn server_tls_config(tls: &settings::Tls) -> anyhow::Result<ServerTlsConfig> {
	let cert = tokio::fs::read(&tls.cert)
		.await
		.with_context(|| format!("could not read certificate {}", tls.cert.display()))?;
	let key = tokio::fs::read(&tls.key)
		.await
		.with_context(|| format!("could not read private key {}", tls.key.display()))?;
	let ca = tokio::fs::read(&tls.ca_cert)
		.await
		.with_context(|| format!("could not read CA certificate {}", tls.ca_cert.display()))?;

	Ok(ServerTlsConfig::new()
		.identity(Identity::from_pem(cert, key))
		.client_ca_root(Certificate::from_pem(ca)))
}

pub async fn client_tls_config(tls: &settings::Tls) -> anyhow::Result<ClientTlsConfig> {
	let cert = tokio::fs::read(&tls.cert)
		.await
		.with_context(|| format!("could not read certificate {}", tls.cert.display()))?;
	let key = tokio::fs::read(&tls.key)
		.await
		.with_context(|| format!("could not read private key {}", tls.key.display()))?;
	let ca = tokio::fs::read(&tls.ca_cert)
		.await
		.with_context(|| format!("could not read CA certificate {}", tls.ca_cert.display()))?;

	Ok(ClientTlsConfig::new()
		.identity(Identity::from_pem(cert, key))
		.ca_certificate(Certificate::from_pem(ca)))
}

/// Dial `address`, with mutual TLS when material is configured.
pub async fn connect(address: &str, tls: Option<&settings::Tls>) -> anyhow::Result<Channel> {
	let endpoint = match tls {
		Some(tls) => Endpoint::from_shared(format!("https://{address}"))?
			.tls_config(client_tls_config(tls).await?)?,
		None => Endpoint::from_shared(format!("http://{address}"))?,
	};
	endpoint
		.connect()
		.await
		.with_context(|| format!("could not connect to {address}"))
}
