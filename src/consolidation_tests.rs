use super::*;
use crate::{
	chains::{ChainClient, ChainClients},
	common::{new_channel_id, ChannelStatus, NormalisedTx, PublicKeySet},
	store::PaymentChannel,
	vault::AddressVault,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

struct MockSweepChain {
	balances: Mutex<HashMap<String, f64>>,
	inputs: SweepInputs,
	broadcasts: Mutex<Vec<String>>,
}

impl MockSweepChain {
	fn new(inputs: SweepInputs) -> Arc<Self> {
		Arc::new(MockSweepChain {
			balances: Mutex::new(HashMap::new()),
			inputs,
			broadcasts: Mutex::new(Vec::new()),
		})
	}
}

#[async_trait]
impl ChainClient for MockSweepChain {
	async fn get_transaction(&self, _tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>> {
		Ok(None)
	}

	async fn get_address_transactions(
		&self,
		_address: &str,
		_since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>> {
		Ok(vec![])
	}

	async fn get_balance(&self, address: &str) -> anyhow::Result<f64> {
		Ok(self.balances.lock().get(address).copied().unwrap_or(0.0))
	}

	async fn sweep_inputs(&self, _address: &str) -> anyhow::Result<SweepInputs> {
		Ok(self.inputs.clone())
	}

	async fn broadcast_raw(&self, raw: &str) -> anyhow::Result<String> {
		let mut broadcasts = self.broadcasts.lock();
		broadcasts.push(raw.to_string());
		Ok(format!("0xhash{}", broadcasts.len()))
	}
}

fn test_keys() -> PublicKeySet {
	PublicKeySet {
		owner: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		active: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		posting: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
		memo: "STM8GC13uCZyhxsibCcdKmm3jmDRDAaIMJab72ZoooN8nVyBsgzvm".to_string(),
	}
}

fn settings() -> ConsolidationSettings {
	ConsolidationSettings { btc_base_fee: 0.0001, evm_base_fee: 0.0005, sol_base_fee: 0.000005 }
}

/// Create `count` completed channels on `coin` with vault-derived
/// addresses; returns their deposit addresses.
fn completed_channels(db: &Database, vault: &AddressVault, coin: Coin, count: usize) -> Vec<String> {
	let mut addresses = Vec::new();
	for index in 0..count {
		let allocated = vault.allocate(coin).unwrap();
		let channel = PaymentChannel {
			channel_id: new_channel_id(),
			username: format!("user{}", index),
			coin,
			deposit_address: allocated.address.clone(),
			amount_crypto: 0.01,
			amount_usd: 2.0,
			memo: None,
			status: ChannelStatus::Pending,
			confirmations: 2,
			tx_hash: Some(format!("{:064x}", index + 1)),
			created_at: 100,
			confirmed_at: None,
			account_created_at: None,
			expires_at: 100 + 86_400,
			public_keys: test_keys(),
		};
		db.create_channel(&channel, allocated.address_id).unwrap();
		for status in
			[ChannelStatus::Confirming, ChannelStatus::Confirmed, ChannelStatus::Completed]
		{
			db.advance_channel_status(&channel.channel_id, status, 200).unwrap();
		}
		addresses.push(allocated.address);
	}
	addresses
}

fn executor(
	db: &Database,
	vault: &AddressVault,
	coin: Coin,
	chain: Arc<MockSweepChain>,
) -> ConsolidationExecutor {
	let mut clients: ChainClients = HashMap::new();
	clients.insert(coin, chain as Arc<dyn ChainClient>);
	ConsolidationExecutor::new(db.clone(), vault.clone(), clients, settings())
}

#[test]
fn fee_scales_with_inputs_and_priority() {
	let db = Database::open_in_memory().unwrap();
	let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
	let chain = MockSweepChain::new(SweepInputs::Solana { recent_blockhash: String::new() });
	let executor = executor(&db, &vault, Coin::Eth, chain);

	let medium = executor.estimate_fee(Coin::Eth, 5, SweepPriority::Medium);
	assert!((medium - 0.0005 * 0.5).abs() < 1e-12);
	let high = executor.estimate_fee(Coin::Eth, 20, SweepPriority::High);
	assert!((high - 0.0005 * 2.0 * 2.0).abs() < 1e-12);
	let low = executor.estimate_fee(Coin::Btc, 10, SweepPriority::Low);
	assert!((low - 0.0001 * 0.5).abs() < 1e-12);
}

// Five funded ETH sources: five raw transactions, first hash canonical,
// the other four recorded as additional.
#[tokio::test]
async fn eth_consolidation_is_one_tx_per_source() {
	let db = Database::open_in_memory().unwrap();
	let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
	let chain = MockSweepChain::new(SweepInputs::Account {
		nonce: 0,
		gas_price_wei: 20_000_000_000, // 20 gwei
		chain_id: 1,
	});
	let addresses = completed_channels(&db, &vault, Coin::Eth, 5);
	for (index, address) in addresses.iter().enumerate() {
		chain.balances.lock().insert(address.clone(), 0.01 * (index + 1) as f64);
	}
	let executor = executor(&db, &vault, Coin::Eth, chain.clone());

	let destination = "0x52908400098527886E0F7030069857D2E4169EE7";
	let outcome =
		executor.execute(Coin::Eth, destination, SweepPriority::Medium).await.unwrap();

	assert_eq!(outcome.source_count, 5);
	assert_eq!(outcome.tx_id, "0xhash1");
	assert_eq!(outcome.additional_tx_hashes.len(), 4);
	assert!((outcome.total_amount - 0.15).abs() < 1e-9);

	// Every broadcast is a signed EIP-155 payload.
	let broadcasts = chain.broadcasts.lock();
	assert_eq!(broadcasts.len(), 5);
	for raw in broadcasts.iter() {
		assert!(raw.starts_with("0x"));
		let decoded = rlp::Rlp::new(&hex::decode(raw.trim_start_matches("0x")).unwrap()).item_count().unwrap();
		assert_eq!(decoded, 9);
	}
	drop(broadcasts);

	// Source channels flipped to consolidated.
	for channel in db.all_channels(10).unwrap() {
		assert_eq!(channel.status, ChannelStatus::Consolidated);
	}
}

#[tokio::test]
async fn prepare_refuses_non_positive_net() {
	let db = Database::open_in_memory().unwrap();
	let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
	let chain = MockSweepChain::new(SweepInputs::Account {
		nonce: 0,
		gas_price_wei: 20_000_000_000,
		chain_id: 1,
	});
	let addresses = completed_channels(&db, &vault, Coin::Eth, 1);
	// Balance below even the scaled-down fee.
	chain.balances.lock().insert(addresses[0].clone(), 0.00000001);
	let executor = executor(&db, &vault, Coin::Eth, chain);

	let result = executor
		.prepare(Coin::Eth, "0x52908400098527886E0F7030069857D2E4169EE7", SweepPriority::Medium)
		.await;
	assert!(matches!(result, Err(Error::Insufficient(_))));
}

#[tokio::test]
async fn prepare_requires_funded_sources() {
	let db = Database::open_in_memory().unwrap();
	let vault = AddressVault::new(db.clone(), &"11".repeat(32), &"22".repeat(32)).unwrap();
	let chain = MockSweepChain::new(SweepInputs::Solana { recent_blockhash: String::new() });
	let executor = executor(&db, &vault, Coin::Sol, chain);
	let result = executor
		.prepare(Coin::Sol, "7S3P4HxJpyyigGzodYwHtCxZyUQe9JiBMHyRWXArAaKv", SweepPriority::Low)
		.await;
	assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn evm_transfer_is_valid_eip155_rlp() {
	let secret = [0x33u8; 32];
	let raw = build_evm_transfer(
		&secret,
		7,
		20_000_000_000,
		1,
		"0x52908400098527886E0F7030069857D2E4169EE7",
		1_000_000_000_000_000,
	)
	.unwrap();
	let bytes = hex::decode(raw.trim_start_matches("0x")).unwrap();
	let rlp = rlp::Rlp::new(&bytes);
	assert_eq!(rlp.item_count().unwrap(), 9);
	assert_eq!(rlp.val_at::<u64>(0).unwrap(), 7);
	assert_eq!(rlp.val_at::<u64>(2).unwrap(), 21_000);
	let v = rlp.val_at::<u64>(5 + 1).unwrap();
	assert!(v == 37 || v == 38, "EIP-155 v for chain 1, got {}", v);
	let to: Vec<u8> = rlp.val_at(3).unwrap();
	assert_eq!(to.len(), 20);
}

#[test]
fn btc_sweep_spends_every_input_to_one_output() {
	let inputs = vec![
		(
			Utxo { txid: "11".repeat(32), vout: 0, value_sats: 50_000 },
			[0x41u8; 32],
		),
		(
			Utxo { txid: "22".repeat(32), vout: 1, value_sats: 70_000 },
			[0x42u8; 32],
		),
	];
	let raw = build_btc_sweep(&inputs, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 10_000)
		.unwrap();
	let tx: bitcoin::Transaction =
		bitcoin::consensus::encode::deserialize(&hex::decode(raw).unwrap()).unwrap();
	assert_eq!(tx.input.len(), 2);
	assert_eq!(tx.output.len(), 1);
	assert_eq!(tx.output[0].value, 110_000);
	for input in &tx.input {
		// signature + pubkey witness for p2wpkh
		assert_eq!(input.witness.len(), 2);
	}
}

#[test]
fn btc_sweep_refuses_fee_above_total() {
	let inputs =
		vec![(Utxo { txid: "11".repeat(32), vout: 0, value_sats: 5_000 }, [0x41u8; 32])];
	assert!(matches!(
		build_btc_sweep(&inputs, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 10_000),
		Err(Error::Insufficient(_))
	));
}

#[test]
fn sol_sweep_is_signed_by_every_source() {
	use ed25519_dalek::Verifier;

	let sources = vec![([0x51u8; 32], 2_000_000_000u64), ([0x52u8; 32], 1_000_000_000u64)];
	let blockhash = bs58::encode([9u8; 32]).into_string();
	let destination = bs58::encode([7u8; 32]).into_string();
	let raw = build_sol_sweep(&sources, &destination, &blockhash).unwrap();

	let bytes = base64::decode(raw).unwrap();
	// compact-u16 signature count, then 64-byte signatures, then message
	assert_eq!(bytes[0], 2);
	let message = &bytes[1 + 2 * 64..];
	assert_eq!(message[0], 2); // required signatures
	assert_eq!(message[2], 1); // read-only unsigned (system program)

	for (index, (secret, _)) in sources.iter().enumerate() {
		let keypair = ed25519_dalek::SigningKey::from_bytes(secret);
		let signature = ed25519_dalek::Signature::from_bytes(
			bytes[1 + index * 64..1 + (index + 1) * 64].try_into().unwrap(),
		);
		keypair.verifying_key().verify(message, &signature).expect("signature must verify");
	}
}

#[test]
fn sol_sweep_fee_payer_must_cover_fees() {
	let sources = vec![([0x51u8; 32], 1_000u64)]; // below the 5000 lamport fee
	let blockhash = bs58::encode([9u8; 32]).into_string();
	let destination = bs58::encode([7u8; 32]).into_string();
	assert!(matches!(
		build_sol_sweep(&sources, &destination, &blockhash),
		Err(Error::Insufficient(_))
	));
}
