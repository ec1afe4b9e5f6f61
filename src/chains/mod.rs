//! Per-network blockchain connections. Each client answers the same two
//! questions - "what is this transaction" and "what arrived at this
//! address" - in the chain-agnostic [`NormalisedTx`] shape.

pub mod btc;
pub mod evm;
pub mod sol;

use crate::{common::Coin, common::NormalisedTx, settings::Settings};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};

/// A spendable output on a UTXO chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
	pub txid: String,
	pub vout: u32,
	pub value_sats: u64,
}

/// Chain-specific facts a sweep transaction needs before it can be built.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepInputs {
	Utxo { utxos: Vec<Utxo> },
	Account { nonce: u64, gas_price_wei: u128, chain_id: u64 },
	Solana { recent_blockhash: String },
}

#[async_trait]
pub trait ChainClient: Send + Sync {
	/// Fetch one transaction by hash. `Ok(None)` means the chain does not
	/// know it (yet); errors are transport problems worth retrying.
	async fn get_transaction(&self, tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>>;

	/// Inbound transfers to `address` strictly after `since` (unix secs).
	async fn get_address_transactions(
		&self,
		address: &str,
		since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>>;

	/// Spendable balance of an address, in whole coins.
	async fn get_balance(&self, address: &str) -> anyhow::Result<f64>;

	/// What the consolidation executor needs to build a sweep spending
	/// from `address`.
	async fn sweep_inputs(&self, address: &str) -> anyhow::Result<SweepInputs>;

	/// Submit a signed transaction (hex for BTC/EVM, base64 for Solana);
	/// returns the transaction hash.
	async fn broadcast_raw(&self, raw: &str) -> anyhow::Result<String>;
}

pub type ChainClients = HashMap<Coin, Arc<dyn ChainClient>>;

/// One client per monitored network, all sharing the 10 s request timeout.
pub fn build_clients(settings: &Settings) -> anyhow::Result<ChainClients> {
	let http = reqwest::Client::builder().timeout(crate::constants::HTTP_TIMEOUT).build()?;

	let mut clients: ChainClients = HashMap::new();
	clients.insert(
		Coin::Btc,
		Arc::new(btc::BtcClient::new(http.clone(), settings.chains.btc.clone())),
	);
	for coin in [Coin::Eth, Coin::Bnb, Coin::Matic] {
		let scan = settings
			.scan_api(coin)
			.expect("EVM coins always carry scanner settings");
		clients.insert(coin, Arc::new(evm::EvmScanClient::new(http.clone(), coin, scan)));
	}
	clients.insert(
		Coin::Sol,
		Arc::new(sol::SolClient::new(http, settings.chains.sol.rpc_url.clone())),
	);
	Ok(clients)
}
