use super::*;
use crate::{
	chains::ChainClient,
	common::{new_channel_id, PublicKeySet, TxOutput},
	store::CryptoAddress,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct MockChain {
	transactions: Mutex<HashMap<String, NormalisedTx>>,
	by_address: Mutex<HashMap<String, Vec<String>>>,
}

impl MockChain {
	fn insert(&self, tx: NormalisedTx) {
		self.by_address
			.lock()
			.entry(tx.to.clone())
			.or_default()
			.push(tx.hash.clone());
		if let Some(outputs) = &tx.all_outputs {
			for output in outputs {
				let mut by_address = self.by_address.lock();
				let entry = by_address.entry(output.address.clone()).or_default();
				if !entry.contains(&tx.hash) {
					entry.push(tx.hash.clone());
				}
			}
		}
		self.transactions.lock().insert(tx.hash.clone(), tx);
	}
}

#[async_trait]
impl ChainClient for MockChain {
	async fn get_transaction(&self, tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>> {
		Ok(self.transactions.lock().get(tx_hash).cloned())
	}

	async fn get_address_transactions(
		&self,
		address: &str,
		since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>> {
		let hashes = self.by_address.lock().get(address).cloned().unwrap_or_default();
		let transactions = self.transactions.lock();
		Ok(hashes
			.iter()
			.filter_map(|hash| transactions.get(hash).cloned())
			.filter(|tx| tx.timestamp == 0 || tx.timestamp > since)
			.collect())
	}

	async fn get_balance(&self, _address: &str) -> anyhow::Result<f64> {
		Ok(0.0)
	}

	async fn sweep_inputs(&self, _address: &str) -> anyhow::Result<crate::chains::SweepInputs> {
		anyhow::bail!("not used by the monitor")
	}

	async fn broadcast_raw(&self, _raw: &str) -> anyhow::Result<String> {
		anyhow::bail!("not used by the monitor")
	}
}

struct Fixture {
	db: Database,
	monitor: DepositMonitor,
	chain: Arc<MockChain>,
	wake: Arc<Notify>,
}

fn fixture(coin: Coin) -> Fixture {
	let db = Database::open_in_memory().unwrap();
	let chain = Arc::new(MockChain::default());
	let mut clients: ChainClients = HashMap::new();
	clients.insert(coin, chain.clone() as Arc<dyn ChainClient>);
	let wake = Arc::new(Notify::new());
	let monitor =
		DepositMonitor::new(db.clone(), clients, Notifier::new(db.clone()), wake.clone());
	Fixture { db, monitor, chain, wake }
}

fn test_keys() -> PublicKeySet {
	PublicKeySet {
		owner: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		active: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		posting: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		memo: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
	}
}

fn make_channel(
	fixture: &Fixture,
	username: &str,
	coin: Coin,
	address: &str,
	amount: f64,
	memo: Option<&str>,
) -> PaymentChannel {
	let address_id = fixture
		.db
		.insert_address(&CryptoAddress {
			id: 0,
			channel_id: None,
			coin,
			derivation_index: fixture.db.next_derivation_index(coin).unwrap(),
			address: address.to_string(),
			public_key: "02".to_string(),
			encrypted_private_key: "00".to_string(),
			derivation_path: "m".to_string(),
			address_type: "p2wpkh".to_string(),
			reusable_after: None,
		})
		.unwrap();
	let channel = PaymentChannel {
		channel_id: new_channel_id(),
		username: username.to_string(),
		coin,
		deposit_address: address.to_string(),
		amount_crypto: amount,
		amount_usd: 2.35,
		memo: memo.map(String::from),
		status: ChannelStatus::Pending,
		confirmations: 0,
		tx_hash: None,
		created_at: 1_700_000_000,
		confirmed_at: None,
		account_created_at: None,
		expires_at: 1_700_000_000 + 86_400,
		public_keys: test_keys(),
	};
	fixture.db.create_channel(&channel, address_id).unwrap();
	channel
}

fn btc_payment(hash: &str, to: &str, amount: f64, confirmations: u64) -> NormalisedTx {
	NormalisedTx {
		hash: hash.to_string(),
		amount,
		to: to.to_string(),
		confirmations,
		block_height: 800_000,
		timestamp: 1_700_000_050,
		memo: None,
		all_outputs: Some(vec![
			TxOutput { address: to.to_string(), amount, script_type: "v0_p2wpkh".to_string() },
			TxOutput {
				address: "bc1qchange".to_string(),
				amount: 0.01,
				script_type: "v0_p2wpkh".to_string(),
			},
		]),
	}
}

// Quote -> pay -> confirm, the BTC end-to-end path: a 0.5 BTC payment at
// two confirmations against a 0.0000570 BTC quote.
#[tokio::test]
async fn btc_overpayment_confirms_at_threshold() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0000570, None);

	let tx = btc_payment(&"aa".repeat(32), "bc1qdeposit", 0.5, 2);
	fixture.chain.insert(tx);

	assert!(fixture.monitor.poll_channel(&channel).await.unwrap());

	let updated = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	assert_eq!(updated.status, ChannelStatus::Confirmed);
	assert_eq!(updated.confirmations, 2);
	assert_eq!(updated.tx_hash.as_deref(), Some("aa".repeat(32).as_str()));
	assert!(updated.confirmed_at.is_some());

	let confirmations = fixture.db.confirmations_for_channel(&channel.channel_id).unwrap();
	assert_eq!(confirmations.len(), 1);
	assert!((confirmations[0].amount_received - 0.5).abs() < 1e-12);
	assert_eq!(confirmations[0].block_height, 800_000);
}

#[tokio::test]
async fn below_threshold_only_confirming() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, None);

	// BTC requires 2 confirmations; 1 is only "confirming".
	let tx = btc_payment(&"ab".repeat(32), "bc1qdeposit", 0.0001, 1);
	fixture.monitor.process_payment_found(&channel, &tx).unwrap();

	let updated = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	assert_eq!(updated.status, ChannelStatus::Confirming);
	assert!(updated.confirmed_at.is_none());

	// The second confirmation crosses the threshold.
	let tx = btc_payment(&"ab".repeat(32), "bc1qdeposit", 0.0001, 2);
	fixture.monitor.process_payment_found(&channel, &tx).unwrap();
	let updated = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	assert_eq!(updated.status, ChannelStatus::Confirmed);
}

#[test]
fn amount_tolerance_boundaries() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.01, None);
	let now = 1_700_000_100;

	let exactly_95 = btc_payment("t1", "bc1qdeposit", channel.amount_crypto * 0.95, 2);
	assert!(verify_transaction_match(&channel, &exactly_95, now).is_ok());

	let just_below = btc_payment("t2", "bc1qdeposit", channel.amount_crypto * 0.9499, 2);
	assert_eq!(
		verify_transaction_match(&channel, &just_below, now),
		Err(MatchRejection::AmountTooLow)
	);
}

#[test]
fn dust_is_rejected() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.000004, None);
	let dust = btc_payment("t3", "bc1qdeposit", 0.000004, 2);
	assert_eq!(
		verify_transaction_match(&channel, &dust, 1_700_000_100),
		Err(MatchRejection::Dust)
	);
}

#[test]
fn temporal_boundary() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.01, None);

	let mut at_creation = btc_payment("t4", "bc1qdeposit", 0.01, 2);
	at_creation.timestamp = channel.created_at;
	assert!(verify_transaction_match(&channel, &at_creation, 0).is_ok());

	let mut before = btc_payment("t5", "bc1qdeposit", 0.01, 2);
	before.timestamp = channel.created_at - 1;
	assert_eq!(
		verify_transaction_match(&channel, &before, 0),
		Err(MatchRejection::TooEarly)
	);
}

#[test]
fn wrong_recipient_is_rejected() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.01, None);
	let tx = btc_payment("t6", "bc1qother", 0.01, 2);
	assert_eq!(
		verify_transaction_match(&channel, &tx, 1_700_000_100),
		Err(MatchRejection::WrongRecipient)
	);
}

#[tokio::test]
async fn no_double_credit_across_channels() {
	let fixture = fixture(Coin::Btc);
	let channel_a = make_channel(&fixture, "alice", Coin::Btc, "bc1qa", 0.0001, None);
	let channel_b = make_channel(&fixture, "bob", Coin::Btc, "bc1qb", 0.0001, None);

	// One transaction pays both deposit addresses.
	let tx = NormalisedTx {
		hash: "cc".repeat(32),
		amount: 0.0002,
		to: "bc1qa".to_string(),
		confirmations: 2,
		block_height: 800_000,
		timestamp: 1_700_000_050,
		memo: None,
		all_outputs: Some(vec![
			TxOutput { address: "bc1qa".into(), amount: 0.0001, script_type: "v0_p2wpkh".into() },
			TxOutput { address: "bc1qb".into(), amount: 0.0001, script_type: "v0_p2wpkh".into() },
		]),
	};

	assert!(fixture.monitor.process_payment_found(&channel_a, &tx).unwrap());
	// The replay against B matches structurally but the credit registry
	// refuses it; B does not move.
	assert!(!fixture.monitor.process_payment_found(&channel_b, &tx).unwrap());

	let b = fixture.db.get_channel(&channel_b.channel_id).unwrap().unwrap();
	assert_eq!(b.status, ChannelStatus::Pending);
	assert!(fixture.db.confirmations_for_channel(&channel_b.channel_id).unwrap().is_empty());
}

#[tokio::test]
async fn credit_pipeline_is_idempotent() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, None);
	let tx = btc_payment(&"dd".repeat(32), "bc1qdeposit", 0.0001, 2);

	fixture.monitor.process_payment_found(&channel, &tx).unwrap();
	let first = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();

	// Replaying the identical observation converges on the same state.
	let reloaded = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	fixture.monitor.process_payment_found(&reloaded, &tx).unwrap();
	let second = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();

	assert_eq!(first.status, second.status);
	assert_eq!(first.confirmed_at, second.confirmed_at);
	assert_eq!(
		fixture.db.confirmations_for_channel(&channel.channel_id).unwrap().len(),
		1
	);
}

#[tokio::test]
async fn sol_memo_must_match_exactly() {
	let fixture = fixture(Coin::Sol);
	let channel =
		make_channel(&fixture, "alice", Coin::Sol, "DepositSol111", 1.0, Some("xyz"));

	let sol_tx = |memo: &str| NormalisedTx {
		hash: "5VERv8NMvzbJMEkV8xnrLkEaWRtSz9CosKDYjCJjBRnbJLgp8uirBgmQpjKhoR4tjF3ZpRzrFmBV6UjKdiSZkQUW".to_string(),
		amount: 1.0,
		to: "DepositSol111".to_string(),
		confirmations: 1,
		block_height: 250_000_000,
		timestamp: 1_700_000_050,
		memo: Some(memo.to_string()),
		all_outputs: None,
	};

	assert!(verify_transaction_match(&channel, &sol_tx("xyz"), 0).is_ok());
	// Trimmed equality still matches.
	assert!(verify_transaction_match(&channel, &sol_tx(" xyz "), 0).is_ok());
	assert_eq!(
		verify_transaction_match(&channel, &sol_tx("xy"), 0),
		Err(MatchRejection::MemoMismatch)
	);

	// SOL needs a single confirmation, so the match completes the credit.
	assert!(fixture.monitor.process_payment_found(&channel, &sol_tx("xyz")).unwrap());
	let updated = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	assert_eq!(updated.status, ChannelStatus::Confirmed);
}

#[tokio::test]
async fn missing_chain_memo_passes_when_channel_has_one() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, Some("m"));
	let tx = btc_payment("t7", "bc1qdeposit", 0.0001, 2);
	assert!(verify_transaction_match(&channel, &tx, 1_700_000_100).is_ok());
}

#[tokio::test]
async fn confirmed_channel_wakes_the_creator() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, None);
	let tx = btc_payment(&"ee".repeat(32), "bc1qdeposit", 0.0001, 2);

	fixture.monitor.process_payment_found(&channel, &tx).unwrap();

	// The wake was signalled; a waiter returns immediately.
	tokio::time::timeout(std::time::Duration::from_millis(50), fixture.wake.notified())
		.await
		.expect("creator wake was not signalled");
}

#[tokio::test]
async fn manual_verify_refetches_from_chain() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, None);

	// Hash the chain does not know: NotFound, no state change.
	let missing = fixture
		.monitor
		.verify_transaction(&channel.channel_id, &"ff".repeat(32))
		.await;
	assert!(matches!(missing, Err(Error::NotFound(_))));

	fixture.chain.insert(btc_payment(&"ff".repeat(32), "bc1qdeposit", 0.0001, 2));
	assert!(fixture
		.monitor
		.verify_transaction(&channel.channel_id, &"ff".repeat(32))
		.await
		.unwrap());

	assert!(matches!(
		fixture.monitor.verify_transaction(&channel.channel_id, "zzz").await,
		Err(Error::InputValidation(_))
	));
	assert!(matches!(
		fixture.monitor.verify_transaction(&"0".repeat(32), &"ff".repeat(32)).await,
		Err(Error::NotFound(_))
	));
}

#[tokio::test]
async fn attached_hash_is_rescanned_for_confirmations() {
	let fixture = fixture(Coin::Btc);
	let channel = make_channel(&fixture, "alice", Coin::Btc, "bc1qdeposit", 0.0001, None);

	fixture.chain.insert(btc_payment(&"ab".repeat(32), "bc1qdeposit", 0.0001, 1));
	fixture.monitor.poll_channel(&channel).await.unwrap();
	assert_eq!(
		fixture.db.get_channel(&channel.channel_id).unwrap().unwrap().status,
		ChannelStatus::Confirming
	);

	// The chain advances; the poller re-scans the attached hash.
	fixture.chain.insert(btc_payment(&"ab".repeat(32), "bc1qdeposit", 0.0001, 2));
	let reloaded = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	fixture.monitor.poll_channel(&reloaded).await.unwrap();
	let updated = fixture.db.get_channel(&channel.channel_id).unwrap().unwrap();
	assert_eq!(updated.status, ChannelStatus::Confirmed);
	assert_eq!(updated.confirmations, 2);
}
