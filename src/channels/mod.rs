//! The payment-channel engine: quote, create, inspect, cancel, expire.

use crate::{
	common::{
		is_valid_username, new_channel_id, now_unix, ChannelStatus, Coin, PublicKeySet,
	},
	constants::{ADDRESS_REUSE_COOLDOWN, CHANNEL_TTL},
	errors::{Error, Result},
	notifications::Notifier,
	pricing::PricingOracle,
	store::{Database, PaymentChannel},
	vault::AddressVault,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// What `GET /payment/status` returns.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
	pub channel_id: String,
	pub username: String,
	pub crypto: String,
	pub deposit_address: String,
	pub amount_crypto: f64,
	pub amount_usd: f64,
	pub memo: Option<String>,
	pub status: ChannelStatus,
	pub status_message: String,
	pub progress_percent: u8,
	pub confirmations: u64,
	pub required_confirmations: u64,
	pub tx_hash: Option<String>,
	pub created_at: i64,
	pub expires_at: i64,
}

/// What `POST /payment/initiate` returns.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedChannel {
	pub channel_id: String,
	pub username: String,
	pub crypto: String,
	pub address: String,
	pub amount_crypto: f64,
	pub amount_usd: f64,
	pub expires_at: i64,
	pub address_reused: bool,
}

pub struct ChannelEngine {
	db: Database,
	vault: AddressVault,
	pricing: Arc<PricingOracle>,
	notifier: Notifier,
}

impl ChannelEngine {
	pub fn new(
		db: Database,
		vault: AddressVault,
		pricing: Arc<PricingOracle>,
		notifier: Notifier,
	) -> Self {
		ChannelEngine { db, vault, pricing, notifier }
	}

	/// Open a channel: validate, quote, derive an address, persist - all
	/// or nothing.
	pub fn create_channel(
		&self,
		username: &str,
		coin: Coin,
		public_keys: PublicKeySet,
	) -> Result<CreatedChannel> {
		let username = username.trim().to_lowercase();
		if !is_valid_username(&username) {
			return Err(Error::validation(format!("invalid Hive username: {}", username)));
		}
		public_keys.validate().map_err(Error::InputValidation)?;
		if !coin.get_info().monitoring_enabled {
			return Err(Error::validation(format!("{} payments are not supported", coin)));
		}
		if let Some(open) = self.db.open_channel_for_username(&username)? {
			return Err(Error::Conflict(format!(
				"username {} already has an open channel ({})",
				username, open.channel_id
			)));
		}

		// Degraded pricing still quotes; creation never blocks on it.
		let snapshot = self.pricing.latest_or_fallback();
		let rate = snapshot
			.crypto_rates
			.get(coin.get_info().symbol)
			.ok_or_else(|| Error::Internal(format!("no rate for {}", coin)))?;

		let allocated = self.vault.allocate(coin)?;
		let now = now_unix();
		let channel = PaymentChannel {
			channel_id: new_channel_id(),
			username: username.clone(),
			coin,
			deposit_address: allocated.address.clone(),
			// The quoted amount is immutable for the channel's lifetime.
			amount_crypto: rate.total_amount,
			amount_usd: rate.final_cost_usd,
			memo: None,
			status: ChannelStatus::Pending,
			confirmations: 0,
			tx_hash: None,
			created_at: now,
			confirmed_at: None,
			account_created_at: None,
			expires_at: now + CHANNEL_TTL.as_secs() as i64,
			public_keys,
		};
		self.db.create_channel(&channel, allocated.address_id)?;
		info!(
			"Channel {} opened: @{} pays {} {} to {}",
			channel.channel_id, username, channel.amount_crypto, coin, channel.deposit_address
		);
		Ok(CreatedChannel {
			channel_id: channel.channel_id,
			username,
			crypto: coin.to_string(),
			address: allocated.address,
			amount_crypto: channel.amount_crypto,
			amount_usd: channel.amount_usd,
			expires_at: channel.expires_at,
			address_reused: allocated.reused,
		})
	}

	/// Lifecycle view. A pending channel past its deadline reads as
	/// expired without touching storage; the sweep deletes it later.
	pub fn status(&self, channel_id: &str) -> Result<ChannelView> {
		let channel = self
			.db
			.get_channel(channel_id)?
			.ok_or_else(|| Error::NotFound(format!("channel {}", channel_id)))?;
		let status = if channel.status == ChannelStatus::Pending &&
			now_unix() >= channel.expires_at
		{
			ChannelStatus::Expired
		} else {
			channel.status
		};
		Ok(ChannelView {
			channel_id: channel.channel_id,
			username: channel.username,
			crypto: channel.coin.to_string(),
			deposit_address: channel.deposit_address,
			amount_crypto: channel.amount_crypto,
			amount_usd: channel.amount_usd,
			memo: channel.memo,
			status,
			status_message: status.status_message().to_string(),
			progress_percent: status.progress_percent(),
			confirmations: channel.confirmations,
			required_confirmations: channel.coin.get_info().required_confirmations,
			tx_hash: channel.tx_hash,
			created_at: channel.created_at,
			expires_at: channel.expires_at,
		})
	}

	/// Admin cancellation; cascades to confirmations, attempts and the
	/// address row.
	pub fn cancel(&self, channel_id: &str) -> Result<()> {
		if !self.db.delete_channel(channel_id)? {
			return Err(Error::NotFound(format!("channel {}", channel_id)));
		}
		info!("Channel {} cancelled by admin", channel_id);
		Ok(())
	}

	/// Periodic sweep deleting pending channels past their deadline.
	pub fn expire_due_channels(&self) -> Result<Vec<String>> {
		let now = now_unix();
		let expired = self
			.db
			.expire_pending_channels(now, now + ADDRESS_REUSE_COOLDOWN.as_secs() as i64)?;
		for channel_id in &expired {
			info!("Channel {} expired unpaid", channel_id);
			self.notifier.publish_status(channel_id, ChannelStatus::Expired, None);
		}
		Ok(expired)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{hive::rpc::HiveRpc, settings::CoinPricing};

	fn test_pricing_settings() -> crate::settings::PricingSettings {
		let coin = |price, fee| CoinPricing { fallback_price_usd: price, avg_transfer_fee: fee };
		crate::settings::PricingSettings {
			coingecko_url: String::new(),
			btc: coin(50_000.0, 0.0001),
			eth: coin(3_000.0, 0.002),
			bnb: coin(500.0, 0.0005),
			matic: coin(0.8, 0.01),
			sol: coin(150.0, 0.000005),
			xmr: coin(150.0, 0.0001),
			dash: coin(30.0, 0.0001),
		}
	}

	fn engine() -> (Database, ChannelEngine) {
		let db = Database::open_in_memory().unwrap();
		let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
		let pricing = PricingOracle::new(
			db.clone(),
			test_pricing_settings(),
			crate::settings::EthSettings {
				api_url: String::new(),
				api_key: String::new(),
				gas_price_url_primary: String::new(),
				gas_price_url_secondary: String::new(),
				fallback_gas_price_gwei: 30.0,
			},
			Arc::new(HiveRpc::new(vec![]).unwrap()),
		)
		.unwrap();
		let engine =
			ChannelEngine::new(db.clone(), vault, pricing, Notifier::new(db.clone()));
		(db, engine)
	}

	fn keys() -> PublicKeySet {
		PublicKeySet {
			owner: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
			active: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
			posting: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
			memo: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		}
	}

	#[tokio::test]
	async fn creates_a_channel_with_a_quote() {
		let (db, engine) = engine();
		let created = engine.create_channel("Alice", Coin::Btc, keys()).unwrap();
		// usernames are normalised to lowercase
		assert_eq!(created.username, "alice");
		assert!(created.address.starts_with("bc1q"));
		assert!(created.amount_crypto > 0.0);
		assert!(!created.address_reused);

		let stored = db.get_channel(&created.channel_id).unwrap().unwrap();
		assert_eq!(stored.status, ChannelStatus::Pending);
		assert_eq!(stored.expires_at, stored.created_at + 86_400);
	}

	#[tokio::test]
	async fn rejects_bad_input() {
		let (_, engine) = engine();
		assert!(matches!(
			engine.create_channel("ab", Coin::Btc, keys()),
			Err(Error::InputValidation(_))
		));
		let mut bad_keys = keys();
		bad_keys.owner = "garbage".to_string();
		assert!(matches!(
			engine.create_channel("alice", Coin::Btc, bad_keys),
			Err(Error::InputValidation(_))
		));
	}

	#[tokio::test]
	async fn rejects_pricing_only_coins() {
		let (_, engine) = engine();
		assert!(matches!(
			engine.create_channel("alice", Coin::Xmr, keys()),
			Err(Error::InputValidation(_))
		));
		assert!(matches!(
			engine.create_channel("alice", Coin::Dash, keys()),
			Err(Error::InputValidation(_))
		));
	}

	#[tokio::test]
	async fn one_open_channel_per_username() {
		let (_, engine) = engine();
		engine.create_channel("alice", Coin::Btc, keys()).unwrap();
		assert!(matches!(
			engine.create_channel("alice", Coin::Eth, keys()),
			Err(Error::Conflict(_))
		));
		// A different user is fine.
		engine.create_channel("bob", Coin::Eth, keys()).unwrap();
	}

	#[tokio::test]
	async fn status_view_surfaces_virtual_expiry() {
		let (db, engine) = engine();
		let created = engine.create_channel("alice", Coin::Btc, keys()).unwrap();

		let view = engine.status(&created.channel_id).unwrap();
		assert_eq!(view.status, ChannelStatus::Pending);
		assert_eq!(view.required_confirmations, 2);
		assert_eq!(view.progress_percent, 10);

		// Channel whose deadline already passed: reads as expired while
		// the row itself still says pending.
		let mut old = db.get_channel(&created.channel_id).unwrap().unwrap();
		old.channel_id = crate::common::new_channel_id();
		old.username = "bob".to_string();
		old.deposit_address = "bc1qother".to_string();
		old.created_at = now_unix() - 2 * 86_400;
		old.expires_at = now_unix() - 86_400;
		let address_id = db
			.insert_address(&crate::store::CryptoAddress {
				id: 0,
				channel_id: None,
				coin: Coin::Btc,
				derivation_index: db.next_derivation_index(Coin::Btc).unwrap(),
				address: "bc1qother".to_string(),
				public_key: "02".to_string(),
				encrypted_private_key: "00".to_string(),
				derivation_path: "m".to_string(),
				address_type: "p2wpkh".to_string(),
				reusable_after: None,
			})
			.unwrap();
		db.create_channel(&old, address_id).unwrap();

		let view = engine.status(&old.channel_id).unwrap();
		assert_eq!(view.status, ChannelStatus::Expired);
		assert_eq!(
			db.get_channel(&old.channel_id).unwrap().unwrap().status,
			ChannelStatus::Pending,
			"the read path must not mutate storage"
		);

		// The sweep deletes it and spares the live channel.
		let expired = engine.expire_due_channels().unwrap();
		assert_eq!(expired, vec![old.channel_id.clone()]);
		assert!(db.get_channel(&created.channel_id).unwrap().is_some());
	}

	#[tokio::test]
	async fn cancel_removes_the_channel() {
		let (db, engine) = engine();
		let created = engine.create_channel("alice", Coin::Btc, keys()).unwrap();
		engine.cancel(&created.channel_id).unwrap();
		assert!(db.get_channel(&created.channel_id).unwrap().is_none());
		assert!(matches!(engine.cancel(&created.channel_id), Err(Error::NotFound(_))));
	}
}
