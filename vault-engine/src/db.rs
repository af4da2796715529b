//! Relational persistence owned by the manager: user records, stored
//! ciphertexts, the service registry and SRP auth records. SQLite behind a
//! single connection; every call is a short transaction.

use std::{
	path::Path,
	sync::Mutex,
};

use rusqlite::{params, Connection, OptionalExtension};

use crate::setup::{ServiceData, ServiceType};

#[derive(thiserror::Error, Debug)]
pub enum DbError {
	#[error("row already exists")]
	AlreadyExists,
	#[error("row not found")]
	NotFound,
	#[error(transparent)]
	Sqlite(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
	CREATE TABLE IF NOT EXISTS users (
		user_id TEXT PRIMARY KEY,
		public_key BLOB NOT NULL
	);
	CREATE TABLE IF NOT EXISTS vault (
		user_id TEXT NOT NULL,
		secret_id TEXT NOT NULL,
		secret BLOB NOT NULL,
		PRIMARY KEY (user_id, secret_id)
	);
	CREATE TABLE IF NOT EXISTS servers (
		container_id TEXT PRIMARY KEY,
		type INTEGER NOT NULL,
		address TEXT NOT NULL,
		public_key BLOB NOT NULL
	);
	CREATE TABLE IF NOT EXISTS auth_clients (
		username TEXT PRIMARY KEY,
		verifier TEXT NOT NULL,
		salt TEXT NOT NULL
	);
";

pub struct Database {
	conn: Mutex<Connection>,
}

impl Database {
	pub fn open(path: &Path) -> Result<Self, DbError> {
		Self::init(Connection::open(path)?)
	}

	pub fn open_in_memory() -> Result<Self, DbError> {
		Self::init(Connection::open_in_memory()?)
	}

	fn init(conn: Connection) -> Result<Self, DbError> {
		conn.execute_batch(SCHEMA)?;
		Ok(Database { conn: Mutex::new(conn) })
	}

	fn with_conn<T>(
		&self,
		f: impl FnOnce(&Connection) -> Result<T, DbError>,
	) -> Result<T, DbError> {
		let conn = self.conn.lock().expect("database lock poisoned");
		f(&conn)
	}

	pub fn add_user(&self, user_id: &str, public_key: &[u8]) -> Result<(), DbError> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO users (user_id, public_key) VALUES (?1, ?2)",
				params![user_id, public_key],
			)
			.map_err(constraint_as_already_exists)?;
			Ok(())
		})
	}

	pub fn user_exists(&self, user_id: &str) -> Result<bool, DbError> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					"SELECT 1 FROM users WHERE user_id = ?1",
					params![user_id],
					|_| Ok(()),
				)
				.optional()?
				.is_some())
		})
	}

	pub fn get_user_public_key(&self, user_id: &str) -> Result<Vec<u8>, DbError> {
		self.with_conn(|conn| {
			conn.query_row(
				"SELECT public_key FROM users WHERE user_id = ?1",
				params![user_id],
				|row| row.get(0),
			)
			.optional()?
			.ok_or(DbError::NotFound)
		})
	}

	pub fn add_secret(
		&self,
		user_id: &str,
		secret_id: &str,
		secret: &[u8],
	) -> Result<(), DbError> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO vault (user_id, secret_id, secret) VALUES (?1, ?2, ?3)",
				params![user_id, secret_id, secret],
			)
			.map_err(constraint_as_already_exists)?;
			Ok(())
		})
	}

	pub fn get_secret(&self, user_id: &str, secret_id: &str) -> Result<Vec<u8>, DbError> {
		self.with_conn(|conn| {
			conn.query_row(
				"SELECT secret FROM vault WHERE user_id = ?1 AND secret_id = ?2",
				params![user_id, secret_id],
				|row| row.get(0),
			)
			.optional()?
			.ok_or(DbError::NotFound)
		})
	}

	pub fn add_server(&self, server: &ServiceData) -> Result<(), DbError> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO servers (container_id, type, address, public_key)
					VALUES (?1, ?2, ?3, ?4)",
				params![
					server.container_id,
					server.service_type.as_i64(),
					server.address,
					server.public_key,
				],
			)
			.map_err(constraint_as_already_exists)?;
			Ok(())
		})
	}

	pub fn remove_server(&self, container_id: &str) -> Result<(), DbError> {
		self.with_conn(|conn| {
			let removed = conn.execute(
				"DELETE FROM servers WHERE container_id = ?1",
				params![container_id],
			)?;
			if removed == 0 {
				return Err(DbError::NotFound);
			}
			Ok(())
		})
	}

	pub fn get_server(&self, container_id: &str) -> Result<Option<ServiceData>, DbError> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					"SELECT container_id, type, address, public_key
						FROM servers WHERE container_id = ?1",
					params![container_id],
					service_data_from_row,
				)
				.optional()?)
		})
	}

	/// All registered servers of one type, in registration order. The
	/// share-to-server pairing relies on this ordering being stable.
	pub fn get_servers(&self, service_type: ServiceType) -> Result<Vec<ServiceData>, DbError> {
		self.with_conn(|conn| {
			let mut statement = conn.prepare(
				"SELECT container_id, type, address, public_key
					FROM servers WHERE type = ?1 ORDER BY rowid",
			)?;
			let servers = statement
				.query_map(params![service_type.as_i64()], service_data_from_row)?
				.collect::<Result<Vec<_>, _>>()?;
			Ok(servers)
		})
	}

	pub fn add_auth_client(
		&self,
		username: &str,
		verifier: &str,
		salt: &str,
	) -> Result<(), DbError> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO auth_clients (username, verifier, salt) VALUES (?1, ?2, ?3)",
				params![username, verifier, salt],
			)
			.map_err(constraint_as_already_exists)?;
			Ok(())
		})
	}

	/// The `(verifier, salt)` pair for a username.
	pub fn get_auth_client(&self, username: &str) -> Result<(String, String), DbError> {
		self.with_conn(|conn| {
			conn.query_row(
				"SELECT verifier, salt FROM auth_clients WHERE username = ?1",
				params![username],
				|row| Ok((row.get(0)?, row.get(1)?)),
			)
			.optional()?
			.ok_or(DbError::NotFound)
		})
	}

	pub fn remove_auth_client(&self, username: &str) -> Result<(), DbError> {
		self.with_conn(|conn| {
			let removed = conn
				.execute("DELETE FROM auth_clients WHERE username = ?1", params![username])?;
			if removed == 0 {
				return Err(DbError::NotFound);
			}
			Ok(())
		})
	}
}

fn service_data_from_row(row: &rusqlite::Row) -> Result<ServiceData, rusqlite::Error> {
	let service_type: i64 = row.get(1)?;
	Ok(ServiceData {
		container_id: row.get(0)?,
		service_type: ServiceType::from_i64(service_type).ok_or_else(|| {
			rusqlite::Error::IntegralValueOutOfRange(1, service_type)
		})?,
		address: row.get(2)?,
		public_key: row.get(3)?,
	})
}

fn constraint_as_already_exists(error: rusqlite::Error) -> DbError {
	match &error {
		rusqlite::Error::SqliteFailure(inner, _)
			if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
			DbError::AlreadyExists,
		_ => DbError::Sqlite(error),
	}
}
