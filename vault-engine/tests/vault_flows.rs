//! End-to-end flows over real loopback gRPC: the manager spawns its fleet
//! through the in-process task spawner, users register and store/retrieve
//! through the authenticated session, and every share or partial crosses
//! the wire sealed.

use std::sync::Arc;

use tempfile::TempDir;

use vault_crypto::CryptoError;
use vault_engine::{
	manager::Manager,
	testing::{loopback_settings, TaskSpawner},
	user::User,
};
use tokio_stream::wrappers::ReceiverStream;
use vault_proto::{
	setup::{setup_master_client::SetupMasterClient, SetupUnregisterRequest},
	vault::{manager_client::ManagerClient, secure_request, AppRequest, SecureRequest},
};

const NUM_SHARE_SERVERS: u32 = 3;
// All holders must cooperate: three share servers plus the user
const QUORUM: u32 = NUM_SHARE_SERVERS + 1;

struct Vault {
	manager: Manager,
	spawner: Arc<TaskSpawner>,
	_dir: TempDir,
}

async fn start_vault() -> Vault {
	let dir = tempfile::tempdir().unwrap();
	let settings = loopback_settings(&dir.path().join("vault.sqlite3"), NUM_SHARE_SERVERS);
	let spawner = Arc::new(TaskSpawner::new());
	let manager = Manager::start(&settings, spawner.clone()).await.unwrap();
	Vault { manager, spawner, _dir: dir }
}

fn new_user(vault: &Vault, user_id: &str) -> User {
	User::new(user_id, &vault.manager.user_address().to_string(), QUORUM, QUORUM, None)
		.unwrap()
}

fn status_code(error: &anyhow::Error) -> Option<tonic::Code> {
	error.root_cause().downcast_ref::<tonic::Status>().map(|status| status.code())
}

#[tokio::test]
async fn register_store_retrieve_happy_path() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"my super secret", "id1").await.unwrap();

	assert_eq!(
		alice.retrieve_secret("mypass", "id1").await.unwrap(),
		b"my super secret"
	);

	vault.manager.stop().await;
}

#[tokio::test]
async fn wrong_password_fails_without_locking_out() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"my super secret", "id1").await.unwrap();

	let error = alice.retrieve_secret("wrongpass", "id1").await.unwrap_err();
	assert_eq!(status_code(&error), Some(tonic::Code::Unauthenticated));

	// No lock-out state: the right password still works afterwards
	assert_eq!(
		alice.retrieve_secret("mypass", "id1").await.unwrap(),
		b"my super secret"
	);

	vault.manager.stop().await;
}

#[tokio::test]
async fn secrets_are_independent() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"A", "id1").await.unwrap();
	alice.store_secret("mypass", b"B", "id2").await.unwrap();

	// Retrievable in any order
	assert_eq!(alice.retrieve_secret("mypass", "id2").await.unwrap(), b"B");
	assert_eq!(alice.retrieve_secret("mypass", "id1").await.unwrap(), b"A");

	vault.manager.stop().await;
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"kept", "id1").await.unwrap();

	let mut impostor = new_user(&vault, "alice");
	let error = impostor.register("otherpass").await.unwrap_err();
	assert_eq!(status_code(&error), Some(tonic::Code::AlreadyExists));

	// The first registration's secrets stay retrievable
	assert_eq!(alice.retrieve_secret("mypass", "id1").await.unwrap(), b"kept");

	vault.manager.stop().await;
}

#[tokio::test]
async fn storing_the_same_secret_id_twice_is_rejected() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"first", "id1").await.unwrap();

	let error = alice.store_secret("mypass", b"second", "id1").await.unwrap_err();
	assert_eq!(status_code(&error), Some(tonic::Code::AlreadyExists));
	assert_eq!(alice.retrieve_secret("mypass", "id1").await.unwrap(), b"first");

	vault.manager.stop().await;
}

#[tokio::test]
async fn registration_requires_the_full_fleet() {
	let vault = start_vault().await;

	// Knock one share server out of the registry; the worker keeps
	// running, but the precondition counts registry rows.
	let share_server_id = vault
		.spawner
		.container_ids()
		.into_iter()
		.find(|id| id.contains("vault-share"))
		.unwrap();
	let mut setup = SetupMasterClient::connect(format!(
		"http://{}",
		vault.manager.setup_address()
	))
	.await
	.unwrap();
	assert!(setup
		.setup_unregister(SetupUnregisterRequest { container_id: share_server_id })
		.await
		.unwrap()
		.into_inner()
		.is_unregistered);

	let mut alice = new_user(&vault, "alice");
	let error = alice.register("mypass").await.unwrap_err();
	assert_eq!(status_code(&error), Some(tonic::Code::FailedPrecondition));

	// No bootstrap was ever spawned for the failed registration
	assert!(vault
		.spawner
		.spawn_history()
		.iter()
		.all(|id| !id.contains("vault-bootstrap")));

	drop(setup);
	vault.manager.stop().await;
}

#[tokio::test]
async fn withheld_partial_breaks_the_full_quorum() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("mypass").await.unwrap();
	alice.store_secret("mypass", b"my super secret", "id1").await.unwrap();

	// Dropping one share server from the registry makes retrieval skip
	// it, so one partial is withheld.
	let share_server_id = vault
		.spawner
		.container_ids()
		.into_iter()
		.find(|id| id.contains("vault-share"))
		.unwrap();
	let mut setup = SetupMasterClient::connect(format!(
		"http://{}",
		vault.manager.setup_address()
	))
	.await
	.unwrap();
	setup
		.setup_unregister(SetupUnregisterRequest { container_id: share_server_id })
		.await
		.unwrap();

	// With t = n, a single missing partial must break the combination
	let error = alice.retrieve_secret("mypass", "id1").await.unwrap_err();
	assert!(matches!(
		error.root_cause().downcast_ref::<CryptoError>(),
		Some(CryptoError::NotEnoughPartials { provided: 3, needed: 4 })
	));

	drop(setup);
	vault.manager.stop().await;
}

#[tokio::test]
async fn out_of_order_secure_call_is_a_protocol_error() {
	let vault = start_vault().await;

	let mut manager =
		ManagerClient::connect(format!("http://{}", vault.manager.user_address()))
			.await
			.unwrap();

	// Jumping straight to the application phase violates the handshake
	let (outbound, stream) = tokio::sync::mpsc::channel(1);
	let mut inbound =
		manager.secure_call(ReceiverStream::new(stream)).await.unwrap().into_inner();
	outbound
		.send(SecureRequest {
			msg: Some(secure_request::Msg::AppReq(AppRequest { body: None })),
		})
		.await
		.unwrap();

	let status = inbound.message().await.unwrap_err();
	assert_eq!(status.code(), tonic::Code::InvalidArgument);

	drop(inbound);
	drop(manager);
	vault.manager.stop().await;
}

#[tokio::test]
async fn users_are_isolated_from_each_other() {
	let vault = start_vault().await;

	let mut alice = new_user(&vault, "alice");
	alice.register("alicepass").await.unwrap();
	alice.store_secret("alicepass", b"alice's secret", "id1").await.unwrap();

	let mut bob = new_user(&vault, "bob");
	bob.register("bobpass").await.unwrap();
	bob.store_secret("bobpass", b"bob's secret", "id1").await.unwrap();

	// Same secret id, different vault rows and different quorums
	assert_eq!(
		alice.retrieve_secret("alicepass", "id1").await.unwrap(),
		b"alice's secret"
	);
	assert_eq!(bob.retrieve_secret("bobpass", "id1").await.unwrap(), b"bob's secret");

	vault.manager.stop().await;
}
