use crate::{
	common::{ChannelStatus, Coin, PublicKeySet},
	errors::{Error, Result},
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::info;

/// Bump on any change to the persistent format, with a migration arm in
/// `migrate_to_latest`.
const LATEST_SCHEMA_VERSION: u32 = 1;

const SCHEMA_VERSION_KEY: &str = "db_schema_version";

/// All persistent state. The database is the single source of truth; the
/// in-memory caches elsewhere are strict mirrors of it.
///
/// The connection is shared behind a mutex; statements are short and no
/// lock is ever held across an await point.
#[derive(Clone)]
pub struct Database {
	conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentChannel {
	pub channel_id: String,
	pub username: String,
	pub coin: Coin,
	pub deposit_address: String,
	pub amount_crypto: f64,
	pub amount_usd: f64,
	pub memo: Option<String>,
	pub status: ChannelStatus,
	pub confirmations: u64,
	pub tx_hash: Option<String>,
	pub created_at: i64,
	pub confirmed_at: Option<i64>,
	pub account_created_at: Option<i64>,
	pub expires_at: i64,
	pub public_keys: PublicKeySet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfirmation {
	pub channel_id: String,
	pub coin: Coin,
	pub tx_hash: String,
	pub block_height: u64,
	pub confirmations: u64,
	pub amount_received: f64,
	pub detected_at: i64,
	pub processed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CryptoAddress {
	pub id: i64,
	pub channel_id: Option<String>,
	pub coin: Coin,
	pub derivation_index: u32,
	pub address: String,
	pub public_key: String,
	pub encrypted_private_key: String,
	pub derivation_path: String,
	pub address_type: String,
	pub reusable_after: Option<i64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CreationMethod {
	Act,
	Delegation,
}

impl CreationMethod {
	pub fn as_str(&self) -> &'static str {
		match self {
			CreationMethod::Act => "ACT",
			CreationMethod::Delegation => "DELEGATION",
		}
	}
}

impl FromStr for CreationMethod {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"ACT" => Ok(CreationMethod::Act),
			"DELEGATION" => Ok(CreationMethod::Delegation),
			other => Err(format!("unknown creation method: {}", other)),
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
	Attempting,
	Success,
	Failed,
}

impl AttemptStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			AttemptStatus::Attempting => "attempting",
			AttemptStatus::Success => "success",
			AttemptStatus::Failed => "failed",
		}
	}
}

impl FromStr for AttemptStatus {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"attempting" => Ok(AttemptStatus::Attempting),
			"success" => Ok(AttemptStatus::Success),
			"failed" => Ok(AttemptStatus::Failed),
			other => Err(format!("unknown attempt status: {}", other)),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct HiveCreationAttempt {
	pub id: i64,
	pub channel_id: String,
	pub method: CreationMethod,
	pub act_used: bool,
	pub creation_fee: f64,
	pub tx_id: Option<String>,
	pub attempt_count: u32,
	pub status: AttemptStatus,
	pub error_message: Option<String>,
	pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActBalance {
	pub creator: String,
	pub act_balance: u32,
	pub resource_credits: i64,
	pub last_claim_time: Option<i64>,
	pub last_rc_check: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RcCost {
	pub operation_type: String,
	pub api_timestamp: i64,
	pub rc_needed: i64,
	pub hp_needed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationRecord {
	pub tx_id: String,
	pub coin: Coin,
	pub destination: String,
	pub total_amount: f64,
	pub fee: f64,
	pub source_count: u32,
	pub additional_tx_hashes: Vec<String>,
	pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
	pub id: i64,
	pub username: String,
	pub notification_type: String,
	pub title: String,
	pub message: String,
	pub data: Option<String>,
	pub priority: String,
	pub created_at: i64,
	pub expires_at: Option<i64>,
}

fn channel_from_row(row: &Row) -> rusqlite::Result<PaymentChannel> {
	Ok(PaymentChannel {
		channel_id: row.get("channel_id")?,
		username: row.get("username")?,
		coin: Coin::from_str(&row.get::<_, String>("crypto")?)
			.map_err(|e| rusqlite::Error::InvalidColumnName(e))?,
		deposit_address: row.get("deposit_address")?,
		amount_crypto: row.get("amount_crypto")?,
		amount_usd: row.get("amount_usd")?,
		memo: row.get("memo")?,
		status: ChannelStatus::from_str(&row.get::<_, String>("status")?)
			.map_err(|e| rusqlite::Error::InvalidColumnName(e))?,
		confirmations: row.get::<_, i64>("confirmations")? as u64,
		tx_hash: row.get("tx_hash")?,
		created_at: row.get("created_at")?,
		confirmed_at: row.get("confirmed_at")?,
		account_created_at: row.get("account_created_at")?,
		expires_at: row.get("expires_at")?,
		public_keys: PublicKeySet {
			owner: row.get("pub_owner")?,
			active: row.get("pub_active")?,
			posting: row.get("pub_posting")?,
			memo: row.get("pub_memo")?,
		},
	})
}

fn address_from_row(row: &Row) -> rusqlite::Result<CryptoAddress> {
	Ok(CryptoAddress {
		id: row.get("id")?,
		channel_id: row.get("channel_id")?,
		coin: Coin::from_str(&row.get::<_, String>("crypto")?)
			.map_err(|e| rusqlite::Error::InvalidColumnName(e))?,
		derivation_index: row.get::<_, i64>("derivation_index")? as u32,
		address: row.get("address")?,
		public_key: row.get("public_key")?,
		encrypted_private_key: row.get("encrypted_private_key")?,
		derivation_path: row.get("derivation_path")?,
		address_type: row.get("address_type")?,
		reusable_after: row.get("reusable_after")?,
	})
}

const CHANNEL_COLUMNS: &str = "channel_id, username, crypto, deposit_address, amount_crypto, \
	 amount_usd, memo, status, confirmations, tx_hash, created_at, confirmed_at, \
	 account_created_at, expires_at, pub_owner, pub_active, pub_posting, pub_memo";

impl Database {
	pub fn open(path: &Path) -> Result<Self> {
		let conn = Connection::open(path).map_err(Error::from)?;
		Self::from_connection(conn)
	}

	pub fn open_in_memory() -> Result<Self> {
		Self::from_connection(Connection::open_in_memory().map_err(Error::from)?)
	}

	fn from_connection(conn: Connection) -> Result<Self> {
		conn.pragma_update(None, "foreign_keys", true).map_err(Error::from)?;
		conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(Error::from)?;
		let db = Database { conn: Arc::new(Mutex::new(conn)) };
		db.migrate_to_latest()?;
		Ok(db)
	}

	fn migrate_to_latest(&self) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
		)?;
		let version: u32 = conn
			.query_row(
				"SELECT value FROM metadata WHERE key = ?1",
				params![SCHEMA_VERSION_KEY],
				|row| row.get::<_, String>(0),
			)
			.optional()?
			.and_then(|v| v.parse().ok())
			.unwrap_or(0);

		if version > LATEST_SCHEMA_VERSION {
			return Err(Error::Integrity(format!(
				"database schema version {} is newer than this binary supports ({})",
				version, LATEST_SCHEMA_VERSION
			)));
		}

		if version < 1 {
			info!("Creating database schema v1");
			conn.execute_batch(SCHEMA_V1)?;
		}

		conn.execute(
			"INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
			params![SCHEMA_VERSION_KEY, LATEST_SCHEMA_VERSION.to_string()],
		)?;
		Ok(())
	}

	/// Cheap liveness probe for the health endpoint.
	pub fn ping(&self) -> Result<()> {
		self.conn.lock().query_row("SELECT 1", [], |_| Ok(())).map_err(Error::from)
	}

	// ==== Channels ====

	/// Insert a channel and bind its deposit address in one transaction.
	/// `address_id` must already exist; the binding also clears any
	/// previous reuse quarantine.
	pub fn create_channel(&self, channel: &PaymentChannel, address_id: i64) -> Result<()> {
		let mut conn = self.conn.lock();
		let tx = conn.transaction().map_err(Error::from)?;
		tx.execute(
			&format!(
				"INSERT INTO payment_channels ({}) VALUES \
				 (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
				CHANNEL_COLUMNS
			),
			params![
				channel.channel_id,
				channel.username,
				channel.coin.to_string(),
				channel.deposit_address,
				channel.amount_crypto,
				channel.amount_usd,
				channel.memo,
				channel.status.as_str(),
				channel.confirmations as i64,
				channel.tx_hash,
				channel.created_at,
				channel.confirmed_at,
				channel.account_created_at,
				channel.expires_at,
				channel.public_keys.owner,
				channel.public_keys.active,
				channel.public_keys.posting,
				channel.public_keys.memo,
			],
		)?;
		tx.execute(
			"UPDATE crypto_addresses SET channel_id = ?1, reusable_after = NULL WHERE id = ?2",
			params![channel.channel_id, address_id],
		)?;
		tx.commit().map_err(Error::from)
	}

	pub fn get_channel(&self, channel_id: &str) -> Result<Option<PaymentChannel>> {
		let conn = self.conn.lock();
		conn.query_row(
			&format!("SELECT {} FROM payment_channels WHERE channel_id = ?1", CHANNEL_COLUMNS),
			params![channel_id],
			channel_from_row,
		)
		.optional()
		.map_err(Error::from)
	}

	pub fn open_channel_for_username(&self, username: &str) -> Result<Option<PaymentChannel>> {
		let conn = self.conn.lock();
		conn.query_row(
			&format!(
				"SELECT {} FROM payment_channels WHERE username = ?1 \
				 AND status IN ('pending','confirming','confirmed')",
				CHANNEL_COLUMNS
			),
			params![username],
			channel_from_row,
		)
		.optional()
		.map_err(Error::from)
	}

	pub fn channels_with_status(&self, status: ChannelStatus) -> Result<Vec<PaymentChannel>> {
		self.select_channels(
			&format!(
				"SELECT {} FROM payment_channels WHERE status = ?1 ORDER BY created_at",
				CHANNEL_COLUMNS
			),
			params![status.as_str()],
		)
	}

	/// Channels the deposit monitor cares about, optionally restricted to
	/// one network.
	pub fn watched_channels(&self, coin: Option<Coin>) -> Result<Vec<PaymentChannel>> {
		match coin {
			Some(coin) => self.select_channels(
				&format!(
					"SELECT {} FROM payment_channels \
					 WHERE status IN ('pending','confirming') AND crypto = ?1 \
					 ORDER BY created_at",
					CHANNEL_COLUMNS
				),
				params![coin.to_string()],
			),
			None => self.select_channels(
				&format!(
					"SELECT {} FROM payment_channels \
					 WHERE status IN ('pending','confirming') ORDER BY created_at",
					CHANNEL_COLUMNS
				),
				params![],
			),
		}
	}

	pub fn non_completed_channels(&self) -> Result<Vec<PaymentChannel>> {
		self.select_channels(
			&format!(
				"SELECT {} FROM payment_channels \
				 WHERE status IN ('pending','confirming','confirmed') ORDER BY created_at",
				CHANNEL_COLUMNS
			),
			params![],
		)
	}

	pub fn all_channels(&self, limit: u32) -> Result<Vec<PaymentChannel>> {
		self.select_channels(
			&format!(
				"SELECT {} FROM payment_channels ORDER BY created_at DESC LIMIT ?1",
				CHANNEL_COLUMNS
			),
			params![limit],
		)
	}

	fn select_channels(
		&self,
		sql: &str,
		params: impl rusqlite::Params,
	) -> Result<Vec<PaymentChannel>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(sql)?;
		let rows = stmt.query_map(params, channel_from_row)?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}

	/// Conditional status transition. Returns `false` when the channel was
	/// not in an allowed prior state (someone else advanced it first), so
	/// out-of-order writes are harmless.
	pub fn advance_channel_status(
		&self,
		channel_id: &str,
		new_status: ChannelStatus,
		now: i64,
	) -> Result<bool> {
		let prior = new_status.allowed_prior_states();
		if prior.is_empty() {
			return Err(Error::Integrity(format!("cannot transition into {}", new_status)));
		}
		// The prior-state list comes from the static transition table, so
		// inlining it keeps the statement simple.
		let prior_list = prior
			.iter()
			.map(|state| format!("'{}'", state.as_str()))
			.collect::<Vec<_>>()
			.join(",");
		let sql = format!(
			"UPDATE payment_channels SET status = ?1, \
			 confirmed_at = CASE WHEN ?1 = 'confirmed' AND confirmed_at IS NULL THEN ?2 \
				 ELSE confirmed_at END, \
			 account_created_at = CASE WHEN ?1 = 'completed' AND account_created_at IS NULL \
				 THEN ?2 ELSE account_created_at END \
			 WHERE channel_id = ?3 AND status IN ({})",
			prior_list
		);
		let conn = self.conn.lock();
		let changed = conn.execute(&sql, params![new_status.as_str(), now, channel_id])?;
		Ok(changed > 0)
	}

	/// Attach the matched payment to the channel row.
	pub fn record_channel_payment(
		&self,
		channel_id: &str,
		tx_hash: &str,
		confirmations: u64,
	) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"UPDATE payment_channels SET tx_hash = ?1, confirmations = ?2 WHERE channel_id = ?3",
			params![tx_hash, confirmations as i64, channel_id],
		)?;
		Ok(())
	}

	/// Delete expired `pending` channels, detaching their deposit
	/// addresses into the reuse quarantine first. Returns the ids removed.
	pub fn expire_pending_channels(&self, now: i64, reusable_after: i64) -> Result<Vec<String>> {
		let mut conn = self.conn.lock();
		let tx = conn.transaction().map_err(Error::from)?;
		let expired: Vec<String> = {
			let mut stmt = tx.prepare(
				"SELECT channel_id FROM payment_channels \
				 WHERE status = 'pending' AND expires_at <= ?1",
			)?;
			let rows = stmt.query_map(params![now], |row| row.get(0))?;
			rows.collect::<rusqlite::Result<Vec<_>>>()?
		};
		for channel_id in &expired {
			tx.execute(
				"UPDATE crypto_addresses SET channel_id = NULL, reusable_after = ?1 \
				 WHERE channel_id = ?2",
				params![reusable_after, channel_id],
			)?;
			tx.execute(
				"DELETE FROM payment_channels WHERE channel_id = ?1 AND status = 'pending'",
				params![channel_id],
			)?;
		}
		tx.commit().map_err(Error::from)?;
		Ok(expired)
	}

	/// Admin cancellation: cascade removes confirmations, creation
	/// attempts and the address row.
	pub fn delete_channel(&self, channel_id: &str) -> Result<bool> {
		let conn = self.conn.lock();
		let changed = conn
			.execute("DELETE FROM payment_channels WHERE channel_id = ?1", params![channel_id])?;
		Ok(changed > 0)
	}

	/// Quarantine the channel's address for reuse after a terminal state.
	pub fn quarantine_channel_address(&self, channel_id: &str, reusable_after: i64) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"UPDATE crypto_addresses SET reusable_after = ?1 WHERE channel_id = ?2",
			params![reusable_after, channel_id],
		)?;
		Ok(())
	}

	// ==== Confirmations ====

	/// Which channel, if any, already holds the `(crypto, tx_hash)` credit.
	pub fn credited_channel(&self, coin: Coin, tx_hash: &str) -> Result<Option<String>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT channel_id FROM payment_confirmations WHERE crypto = ?1 AND tx_hash = ?2",
			params![coin.to_string(), tx_hash],
			|row| row.get(0),
		)
		.optional()
		.map_err(Error::from)
	}

	/// Idempotent per-sighting upsert. Fails with `Conflict` when the tx
	/// hash is already credited to a different channel.
	pub fn upsert_confirmation(&self, confirmation: &PaymentConfirmation) -> Result<()> {
		let conn = self.conn.lock();
		let existing: Option<String> = conn
			.query_row(
				"SELECT channel_id FROM payment_confirmations \
				 WHERE crypto = ?1 AND tx_hash = ?2",
				params![confirmation.coin.to_string(), confirmation.tx_hash],
				|row| row.get(0),
			)
			.optional()?;
		if let Some(channel_id) = existing {
			if channel_id != confirmation.channel_id {
				return Err(Error::Conflict(format!(
					"transaction {} already credited to another channel",
					confirmation.tx_hash
				)));
			}
		}
		// The guard keeps a racing insert for another channel from ever
		// rewriting an existing credit.
		conn.execute(
			"INSERT INTO payment_confirmations \
			 (channel_id, crypto, tx_hash, block_height, confirmations, amount_received, \
			  detected_at, processed_at) \
			 VALUES (?1,?2,?3,?4,?5,?6,?7,?8) \
			 ON CONFLICT(crypto, tx_hash) DO UPDATE SET \
			 confirmations = excluded.confirmations, \
			 block_height = excluded.block_height, \
			 processed_at = excluded.processed_at \
			 WHERE payment_confirmations.channel_id = excluded.channel_id",
			params![
				confirmation.channel_id,
				confirmation.coin.to_string(),
				confirmation.tx_hash,
				confirmation.block_height as i64,
				confirmation.confirmations as i64,
				confirmation.amount_received,
				confirmation.detected_at,
				confirmation.processed_at,
			],
		)?;
		Ok(())
	}

	pub fn confirmations_for_channel(&self, channel_id: &str) -> Result<Vec<PaymentConfirmation>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT channel_id, crypto, tx_hash, block_height, confirmations, amount_received, \
			 detected_at, processed_at FROM payment_confirmations WHERE channel_id = ?1",
		)?;
		let rows = stmt.query_map(params![channel_id], |row| {
			Ok(PaymentConfirmation {
				channel_id: row.get(0)?,
				coin: Coin::from_str(&row.get::<_, String>(1)?)
					.map_err(rusqlite::Error::InvalidColumnName)?,
				tx_hash: row.get(2)?,
				block_height: row.get::<_, i64>(3)? as u64,
				confirmations: row.get::<_, i64>(4)? as u64,
				amount_received: row.get(5)?,
				detected_at: row.get(6)?,
				processed_at: row.get(7)?,
			})
		})?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}

	// ==== Addresses ====

	pub fn insert_address(&self, address: &CryptoAddress) -> Result<i64> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO crypto_addresses \
			 (channel_id, crypto, derivation_index, address, public_key, \
			  encrypted_private_key, derivation_path, address_type, reusable_after) \
			 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
			params![
				address.channel_id,
				address.coin.to_string(),
				address.derivation_index as i64,
				address.address,
				address.public_key,
				address.encrypted_private_key,
				address.derivation_path,
				address.address_type,
				address.reusable_after,
			],
		)?;
		Ok(conn.last_insert_rowid())
	}

	pub fn next_derivation_index(&self, coin: Coin) -> Result<u32> {
		let conn = self.conn.lock();
		let max: Option<i64> = conn.query_row(
			"SELECT MAX(derivation_index) FROM crypto_addresses WHERE crypto = ?1",
			params![coin.to_string()],
			|row| row.get(0),
		)?;
		Ok(max.map(|m| m as u32 + 1).unwrap_or(0))
	}

	/// Oldest address out of quarantine, if any.
	pub fn reusable_address(&self, coin: Coin, now: i64) -> Result<Option<CryptoAddress>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT id, channel_id, crypto, derivation_index, address, public_key, \
			 encrypted_private_key, derivation_path, address_type, reusable_after \
			 FROM crypto_addresses \
			 WHERE crypto = ?1 AND channel_id IS NULL AND reusable_after IS NOT NULL \
			 AND reusable_after < ?2 ORDER BY reusable_after LIMIT 1",
			params![coin.to_string(), now],
			address_from_row,
		)
		.optional()
		.map_err(Error::from)
	}

	pub fn address_for_channel(&self, channel_id: &str) -> Result<Option<CryptoAddress>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT id, channel_id, crypto, derivation_index, address, public_key, \
			 encrypted_private_key, derivation_path, address_type, reusable_after \
			 FROM crypto_addresses WHERE channel_id = ?1",
			params![channel_id],
			address_from_row,
		)
		.optional()
		.map_err(Error::from)
	}

	/// Addresses whose channels completed; the consolidation source set.
	pub fn addresses_for_consolidation(&self, coin: Coin) -> Result<Vec<(CryptoAddress, String)>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT a.id, a.channel_id, a.crypto, a.derivation_index, a.address, a.public_key, \
			 a.encrypted_private_key, a.derivation_path, a.address_type, a.reusable_after \
			 FROM crypto_addresses a \
			 JOIN payment_channels c ON c.channel_id = a.channel_id \
			 WHERE a.crypto = ?1 AND c.status = 'completed'",
		)?;
		let rows = stmt.query_map(params![coin.to_string()], |row| {
			let address = address_from_row(row)?;
			let channel_id = address.channel_id.clone().unwrap_or_default();
			Ok((address, channel_id))
		})?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}

	// ==== Hive creation attempts ====

	pub fn create_attempt(
		&self,
		channel_id: &str,
		method: CreationMethod,
		creation_fee: f64,
		now: i64,
	) -> Result<i64> {
		let conn = self.conn.lock();
		let attempt_count: i64 = conn.query_row(
			"SELECT COUNT(*) FROM hive_account_creations WHERE channel_id = ?1",
			params![channel_id],
			|row| row.get(0),
		)?;
		conn.execute(
			"INSERT INTO hive_account_creations \
			 (channel_id, method, act_used, creation_fee, tx_id, attempt_count, status, \
			  error_message, created_at) \
			 VALUES (?1,?2,?3,?4,NULL,?5,'attempting',NULL,?6)",
			params![
				channel_id,
				method.as_str(),
				method == CreationMethod::Act,
				creation_fee,
				attempt_count + 1,
				now,
			],
		)?;
		Ok(conn.last_insert_rowid())
	}

	pub fn finish_attempt(
		&self,
		attempt_id: i64,
		status: AttemptStatus,
		tx_id: Option<&str>,
		error_message: Option<&str>,
	) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"UPDATE hive_account_creations SET status = ?1, tx_id = ?2, error_message = ?3 \
			 WHERE id = ?4",
			params![status.as_str(), tx_id, error_message, attempt_id],
		)?;
		Ok(())
	}

	pub fn attempts_for_channel(&self, channel_id: &str) -> Result<Vec<HiveCreationAttempt>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT id, channel_id, method, act_used, creation_fee, tx_id, attempt_count, \
			 status, error_message, created_at FROM hive_account_creations \
			 WHERE channel_id = ?1 ORDER BY id",
		)?;
		let rows = stmt.query_map(params![channel_id], |row| {
			Ok(HiveCreationAttempt {
				id: row.get(0)?,
				channel_id: row.get(1)?,
				method: CreationMethod::from_str(&row.get::<_, String>(2)?)
					.map_err(rusqlite::Error::InvalidColumnName)?,
				act_used: row.get(3)?,
				creation_fee: row.get(4)?,
				tx_id: row.get(5)?,
				attempt_count: row.get::<_, i64>(6)? as u32,
				status: AttemptStatus::from_str(&row.get::<_, String>(7)?)
					.map_err(rusqlite::Error::InvalidColumnName)?,
				error_message: row.get(8)?,
				created_at: row.get(9)?,
			})
		})?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}

	// ==== ACT balance ====

	pub fn upsert_act_balance(&self, balance: &ActBalance) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO act_balances \
			 (creator, act_balance, resource_credits, last_claim_time, last_rc_check) \
			 VALUES (?1,?2,?3,?4,?5) \
			 ON CONFLICT(creator) DO UPDATE SET \
			 act_balance = excluded.act_balance, \
			 resource_credits = excluded.resource_credits, \
			 last_claim_time = excluded.last_claim_time, \
			 last_rc_check = excluded.last_rc_check",
			params![
				balance.creator,
				balance.act_balance as i64,
				balance.resource_credits,
				balance.last_claim_time,
				balance.last_rc_check,
			],
		)?;
		Ok(())
	}

	pub fn get_act_balance(&self, creator: &str) -> Result<Option<ActBalance>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT creator, act_balance, resource_credits, last_claim_time, last_rc_check \
			 FROM act_balances WHERE creator = ?1",
			params![creator],
			|row| {
				Ok(ActBalance {
					creator: row.get(0)?,
					act_balance: row.get::<_, i64>(1)? as u32,
					resource_credits: row.get(2)?,
					last_claim_time: row.get(3)?,
					last_rc_check: row.get(4)?,
				})
			},
		)
		.optional()
		.map_err(Error::from)
	}

	// ==== RC costs ====

	pub fn insert_rc_cost(&self, cost: &RcCost) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO rc_costs (operation_type, api_timestamp, rc_needed, hp_needed) \
			 VALUES (?1,?2,?3,?4) \
			 ON CONFLICT(operation_type, api_timestamp) DO NOTHING",
			params![cost.operation_type, cost.api_timestamp, cost.rc_needed, cost.hp_needed],
		)?;
		Ok(())
	}

	pub fn latest_rc_cost(&self, operation_type: &str) -> Result<Option<RcCost>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT operation_type, api_timestamp, rc_needed, hp_needed FROM rc_costs \
			 WHERE operation_type = ?1 ORDER BY api_timestamp DESC LIMIT 1",
			params![operation_type],
			|row| {
				Ok(RcCost {
					operation_type: row.get(0)?,
					api_timestamp: row.get(1)?,
					rc_needed: row.get(2)?,
					hp_needed: row.get(3)?,
				})
			},
		)
		.optional()
		.map_err(Error::from)
	}

	pub fn latest_rc_costs(&self) -> Result<Vec<RcCost>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT operation_type, api_timestamp, rc_needed, hp_needed FROM rc_costs r \
			 WHERE api_timestamp = (SELECT MAX(api_timestamp) FROM rc_costs \
				 WHERE operation_type = r.operation_type) \
			 ORDER BY operation_type",
		)?;
		let rows = stmt.query_map([], |row| {
			Ok(RcCost {
				operation_type: row.get(0)?,
				api_timestamp: row.get(1)?,
				rc_needed: row.get(2)?,
				hp_needed: row.get(3)?,
			})
		})?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}

	pub fn purge_rc_costs(&self, before: i64) -> Result<usize> {
		let conn = self.conn.lock();
		conn.execute("DELETE FROM rc_costs WHERE api_timestamp < ?1", params![before])
			.map_err(Error::from)
	}

	// ==== Pricing snapshots ====

	pub fn insert_pricing_snapshot(&self, created_at: i64, payload: &str) -> Result<()> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO pricing_snapshots (created_at, payload) VALUES (?1, ?2)",
			params![created_at, payload],
		)?;
		Ok(())
	}

	pub fn latest_pricing_snapshot(&self) -> Result<Option<(i64, String)>> {
		let conn = self.conn.lock();
		conn.query_row(
			"SELECT created_at, payload FROM pricing_snapshots ORDER BY created_at DESC LIMIT 1",
			[],
			|row| Ok((row.get(0)?, row.get(1)?)),
		)
		.optional()
		.map_err(Error::from)
	}

	pub fn purge_pricing_snapshots(&self, before: i64) -> Result<usize> {
		let conn = self.conn.lock();
		conn.execute("DELETE FROM pricing_snapshots WHERE created_at < ?1", params![before])
			.map_err(Error::from)
	}

	// ==== Consolidations ====

	/// Persist the sweep record and flip every source channel to
	/// `consolidated` in the same transaction.
	pub fn record_consolidation(
		&self,
		record: &ConsolidationRecord,
		source_channels: &[String],
	) -> Result<()> {
		let mut conn = self.conn.lock();
		let tx = conn.transaction().map_err(Error::from)?;
		tx.execute(
			"INSERT INTO consolidation_transactions \
			 (tx_id, crypto, destination, total_amount, fee, source_count, \
			  additional_tx_hashes, created_at) \
			 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
			params![
				record.tx_id,
				record.coin.to_string(),
				record.destination,
				record.total_amount,
				record.fee,
				record.source_count as i64,
				serde_json::to_string(&record.additional_tx_hashes)
					.map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
				record.created_at,
			],
		)?;
		for channel_id in source_channels {
			tx.execute(
				"UPDATE payment_channels SET status = 'consolidated' \
				 WHERE channel_id = ?1 AND status = 'completed'",
				params![channel_id],
			)?;
		}
		tx.commit().map_err(Error::from)
	}

	// ==== Notifications ====

	pub fn insert_notification(&self, record: &NotificationRecord) -> Result<i64> {
		let conn = self.conn.lock();
		conn.execute(
			"INSERT INTO notifications \
			 (username, notification_type, title, message, data, priority, created_at, \
			  expires_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
			params![
				record.username,
				record.notification_type,
				record.title,
				record.message,
				record.data,
				record.priority,
				record.created_at,
				record.expires_at,
			],
		)?;
		Ok(conn.last_insert_rowid())
	}

	pub fn notifications_for_user(
		&self,
		username: &str,
		limit: u32,
	) -> Result<Vec<NotificationRecord>> {
		let conn = self.conn.lock();
		let mut stmt = conn.prepare(
			"SELECT id, username, notification_type, title, message, data, priority, \
			 created_at, expires_at FROM notifications WHERE username = ?1 \
			 ORDER BY created_at DESC LIMIT ?2",
		)?;
		let rows = stmt.query_map(params![username, limit], |row| {
			Ok(NotificationRecord {
				id: row.get(0)?,
				username: row.get(1)?,
				notification_type: row.get(2)?,
				title: row.get(3)?,
				message: row.get(4)?,
				data: row.get(5)?,
				priority: row.get(6)?,
				created_at: row.get(7)?,
				expires_at: row.get(8)?,
			})
		})?;
		rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
	}
}

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS payment_channels (
	channel_id          TEXT PRIMARY KEY,
	username            TEXT NOT NULL,
	crypto              TEXT NOT NULL,
	deposit_address     TEXT NOT NULL,
	amount_crypto       REAL NOT NULL,
	amount_usd          REAL NOT NULL,
	memo                TEXT,
	status              TEXT NOT NULL DEFAULT 'pending',
	confirmations       INTEGER NOT NULL DEFAULT 0,
	tx_hash             TEXT,
	created_at          INTEGER NOT NULL,
	confirmed_at        INTEGER,
	account_created_at  INTEGER,
	expires_at          INTEGER NOT NULL,
	pub_owner           TEXT NOT NULL,
	pub_active          TEXT NOT NULL,
	pub_posting         TEXT NOT NULL,
	pub_memo            TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_channels_open_username
	ON payment_channels (username)
	WHERE status IN ('pending','confirming','confirmed');

CREATE UNIQUE INDEX IF NOT EXISTS ux_channels_deposit_address
	ON payment_channels (crypto, deposit_address)
	WHERE status IN ('pending','confirming','confirmed');

CREATE TABLE IF NOT EXISTS payment_confirmations (
	id              INTEGER PRIMARY KEY,
	channel_id      TEXT NOT NULL REFERENCES payment_channels(channel_id) ON DELETE CASCADE,
	crypto          TEXT NOT NULL,
	tx_hash         TEXT NOT NULL,
	block_height    INTEGER NOT NULL DEFAULT 0,
	confirmations   INTEGER NOT NULL DEFAULT 0,
	amount_received REAL NOT NULL DEFAULT 0,
	detected_at     INTEGER NOT NULL,
	processed_at    INTEGER,
	UNIQUE (crypto, tx_hash)
);

CREATE TABLE IF NOT EXISTS crypto_addresses (
	id                    INTEGER PRIMARY KEY,
	channel_id            TEXT REFERENCES payment_channels(channel_id) ON DELETE CASCADE,
	crypto                TEXT NOT NULL,
	derivation_index      INTEGER NOT NULL,
	address               TEXT NOT NULL,
	public_key            TEXT NOT NULL,
	encrypted_private_key TEXT NOT NULL,
	derivation_path       TEXT NOT NULL,
	address_type          TEXT NOT NULL,
	reusable_after        INTEGER,
	UNIQUE (crypto, derivation_index)
);

CREATE TABLE IF NOT EXISTS hive_account_creations (
	id            INTEGER PRIMARY KEY,
	channel_id    TEXT NOT NULL REFERENCES payment_channels(channel_id) ON DELETE CASCADE,
	method        TEXT NOT NULL,
	act_used      INTEGER NOT NULL DEFAULT 0,
	creation_fee  REAL NOT NULL DEFAULT 0,
	tx_id         TEXT,
	attempt_count INTEGER NOT NULL DEFAULT 1,
	status        TEXT NOT NULL DEFAULT 'attempting',
	error_message TEXT,
	created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS act_balances (
	creator          TEXT PRIMARY KEY,
	act_balance      INTEGER NOT NULL DEFAULT 0,
	resource_credits INTEGER NOT NULL DEFAULT 0,
	last_claim_time  INTEGER,
	last_rc_check    INTEGER
);

CREATE TABLE IF NOT EXISTS rc_costs (
	id             INTEGER PRIMARY KEY,
	operation_type TEXT NOT NULL,
	api_timestamp  INTEGER NOT NULL,
	rc_needed      INTEGER NOT NULL,
	hp_needed      REAL NOT NULL,
	UNIQUE (operation_type, api_timestamp)
);

CREATE TABLE IF NOT EXISTS pricing_snapshots (
	id         INTEGER PRIMARY KEY,
	created_at INTEGER NOT NULL,
	payload    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consolidation_transactions (
	tx_id                TEXT PRIMARY KEY,
	crypto               TEXT NOT NULL,
	destination          TEXT NOT NULL,
	total_amount         REAL NOT NULL,
	fee                  REAL NOT NULL,
	source_count         INTEGER NOT NULL,
	additional_tx_hashes TEXT NOT NULL DEFAULT '[]',
	created_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
	id                INTEGER PRIMARY KEY,
	username          TEXT NOT NULL,
	notification_type TEXT NOT NULL,
	title             TEXT NOT NULL,
	message           TEXT NOT NULL,
	data              TEXT,
	priority          TEXT NOT NULL DEFAULT 'normal',
	created_at        INTEGER NOT NULL,
	expires_at        INTEGER
);
";
