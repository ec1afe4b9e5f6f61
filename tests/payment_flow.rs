//! End-to-end flow over mocked chains and a mocked Hive node: quote,
//! channel creation, deposit detection, confirmation, account creation.

use async_trait::async_trait;
use hive_onramp::{
	chains::{ChainClient, ChainClients, SweepInputs},
	channels::ChannelEngine,
	common::{ChannelStatus, Coin, NormalisedTx, PublicKeySet, TxOutput},
	hive::{creator::AccountCreator, rpc::HiveRpc, CreatorChainState, HiveApi},
	notifications::Notifier,
	pricing::{rc::RcOracle, PricingOracle},
	settings::{CoinPricing, EthSettings, PricingSettings},
	store::{AttemptStatus, CreationMethod, Database, RcCost},
	vault::AddressVault,
	witness::DepositMonitor,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Notify;

#[derive(Default)]
struct ScriptedChain {
	transactions: Mutex<HashMap<String, NormalisedTx>>,
}

#[async_trait]
impl ChainClient for ScriptedChain {
	async fn get_transaction(&self, tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>> {
		Ok(self.transactions.lock().get(tx_hash).cloned())
	}

	async fn get_address_transactions(
		&self,
		address: &str,
		since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>> {
		Ok(self
			.transactions
			.lock()
			.values()
			.filter(|tx| {
				tx.all_outputs
					.as_ref()
					.map(|outputs| outputs.iter().any(|o| o.address == address))
					.unwrap_or(tx.to == address)
			})
			.filter(|tx| tx.timestamp > since)
			.cloned()
			.collect())
	}

	async fn get_balance(&self, _address: &str) -> anyhow::Result<f64> {
		Ok(0.0)
	}

	async fn sweep_inputs(&self, _address: &str) -> anyhow::Result<SweepInputs> {
		anyhow::bail!("no sweeps in this test")
	}

	async fn broadcast_raw(&self, _raw: &str) -> anyhow::Result<String> {
		anyhow::bail!("no sweeps in this test")
	}
}

struct ScriptedHive {
	act_balance: Mutex<u32>,
	created: Mutex<Vec<String>>,
}

#[async_trait]
impl HiveApi for ScriptedHive {
	async fn account_exists(&self, name: &str) -> anyhow::Result<bool> {
		Ok(self.created.lock().iter().any(|n| n == name))
	}

	async fn account_created_at(&self, _name: &str) -> anyhow::Result<Option<i64>> {
		Ok(Some(1_700_000_000))
	}

	async fn creator_state(&self) -> anyhow::Result<CreatorChainState> {
		Ok(CreatorChainState {
			pending_claimed_accounts: *self.act_balance.lock(),
			rc_current_mana: 30_000_000_000_000,
		})
	}

	async fn broadcast_claim_account(&self) -> anyhow::Result<String> {
		*self.act_balance.lock() += 1;
		Ok("claimtx".to_string())
	}

	async fn broadcast_create_claimed_account(
		&self,
		username: &str,
		_keys: &PublicKeySet,
	) -> anyhow::Result<String> {
		*self.act_balance.lock() -= 1;
		self.created.lock().push(username.to_string());
		Ok("hivetx1234".to_string())
	}

	async fn broadcast_account_create(
		&self,
		username: &str,
		_keys: &PublicKeySet,
	) -> anyhow::Result<String> {
		self.created.lock().push(username.to_string());
		Ok("hivetx5678".to_string())
	}
}

struct Harness {
	db: Database,
	engine: ChannelEngine,
	monitor: DepositMonitor,
	creator: AccountCreator,
	chain: Arc<ScriptedChain>,
	hive: Arc<ScriptedHive>,
	wake: Arc<Notify>,
}

fn pricing_settings() -> PricingSettings {
	let coin = |price, fee| CoinPricing { fallback_price_usd: price, avg_transfer_fee: fee };
	PricingSettings {
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

fn harness(act_balance: u32) -> Harness {
	let db = Database::open_in_memory().unwrap();
	let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
	let notifier = Notifier::new(db.clone());
	let pricing = PricingOracle::new(
		db.clone(),
		pricing_settings(),
		EthSettings {
			api_url: String::new(),
			api_key: String::new(),
			gas_price_url_primary: String::new(),
			gas_price_url_secondary: String::new(),
			fallback_gas_price_gwei: 30.0,
		},
		Arc::new(HiveRpc::new(vec![]).unwrap()),
	)
	.unwrap();

	db.insert_rc_cost(&RcCost {
		operation_type: "claim_account_operation".to_string(),
		api_timestamp: 1,
		rc_needed: 10_000_000_000_000,
		hp_needed: 6500.0,
	})
	.unwrap();
	let rc_oracle = Arc::new(RcOracle::new(db.clone(), String::new()).unwrap());

	let chain = Arc::new(ScriptedChain::default());
	let mut clients: ChainClients = HashMap::new();
	clients.insert(Coin::Btc, chain.clone() as Arc<dyn ChainClient>);

	let hive = Arc::new(ScriptedHive {
		act_balance: Mutex::new(act_balance),
		created: Mutex::new(vec![]),
	});
	let wake = Arc::new(Notify::new());

	Harness {
		engine: ChannelEngine::new(db.clone(), vault, pricing, notifier.clone()),
		monitor: DepositMonitor::new(db.clone(), clients, notifier.clone(), wake.clone()),
		creator: AccountCreator::new(
			db.clone(),
			hive.clone(),
			rc_oracle,
			notifier,
			"onramp.creator".to_string(),
		),
		db,
		chain,
		hive,
		wake,
	}
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
async fn full_btc_purchase_flow() {
	let harness = harness(3);

	// 1. Quote and channel.
	let created = harness.engine.create_channel("alice", Coin::Btc, keys()).unwrap();
	assert!(created.amount_crypto > 0.0);

	// 2. The user pays 0.5 BTC to the deposit address; the chain sees it
	// with the required two confirmations.
	harness.chain.transactions.lock().insert(
		"aa".repeat(32),
		NormalisedTx {
			hash: "aa".repeat(32),
			amount: 0.5,
			to: created.address.clone(),
			confirmations: 2,
			block_height: 800_000,
			timestamp: hive_onramp::common::now_unix(),
			memo: None,
			all_outputs: Some(vec![TxOutput {
				address: created.address.clone(),
				amount: 0.5,
				script_type: "v0_p2wpkh".to_string(),
			}]),
		},
	);

	// 3. The poller picks it up and confirms.
	harness.monitor.poll_network(Coin::Btc).await;
	let channel = harness.db.get_channel(&created.channel_id).unwrap().unwrap();
	assert_eq!(channel.status, ChannelStatus::Confirmed);

	// The confirm raised the creator wake.
	tokio::time::timeout(std::time::Duration::from_millis(50), harness.wake.notified())
		.await
		.expect("wake should fire");

	// 4. The creator consumes an ACT and completes the channel.
	harness.creator.process_confirmed_channels().await;
	let channel = harness.db.get_channel(&created.channel_id).unwrap().unwrap();
	assert_eq!(channel.status, ChannelStatus::Completed);
	assert_eq!(*harness.hive.act_balance.lock(), 2);
	assert_eq!(harness.hive.created.lock().as_slice(), ["alice".to_string()]);

	let attempts = harness.db.attempts_for_channel(&created.channel_id).unwrap();
	assert_eq!(attempts.len(), 1);
	assert_eq!(attempts[0].method, CreationMethod::Act);
	assert_eq!(attempts[0].status, AttemptStatus::Success);

	// 5. The user got the high-priority notification.
	let notifications = harness.db.notifications_for_user("alice", 10).unwrap();
	assert!(notifications
		.iter()
		.any(|n| n.notification_type == "account_created" && n.priority == "high"));
}

#[tokio::test]
async fn underpayment_never_advances_the_channel() {
	let harness = harness(1);
	let created = harness.engine.create_channel("bob", Coin::Btc, keys()).unwrap();

	harness.chain.transactions.lock().insert(
		"bb".repeat(32),
		NormalisedTx {
			hash: "bb".repeat(32),
			amount: created.amount_crypto * 0.5,
			to: created.address.clone(),
			confirmations: 6,
			block_height: 800_000,
			timestamp: hive_onramp::common::now_unix(),
			memo: None,
			all_outputs: Some(vec![TxOutput {
				address: created.address.clone(),
				amount: created.amount_crypto * 0.5,
				script_type: "v0_p2wpkh".to_string(),
			}]),
		},
	);

	harness.monitor.poll_network(Coin::Btc).await;
	let channel = harness.db.get_channel(&created.channel_id).unwrap().unwrap();
	assert_eq!(channel.status, ChannelStatus::Pending);
	assert!(harness.hive.created.lock().is_empty());
}
