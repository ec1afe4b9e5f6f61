use crate::{
	common::{Coin, NormalisedTx},
	settings::ScanApiSettings,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};

const WEI_PER_ETH: f64 = 1e18;

/// Etherscan-family scanner client, shared by ETH, BNB and MATIC - the
/// three expose byte-identical APIs on different hosts.
pub struct EvmScanClient {
	client: reqwest::Client,
	coin: Coin,
	settings: ScanApiSettings,
}

#[derive(Debug, Deserialize)]
struct ProxyResponse<T> {
	result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ScanListResponse<T> {
	status: String,
	#[serde(default)]
	message: String,
	result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProxyTx {
	hash: String,
	to: Option<String>,
	value: String,
	#[serde(rename = "blockNumber")]
	block_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProxyBlock {
	timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ScanListedTx {
	hash: String,
	to: String,
	value: String,
	#[serde(rename = "timeStamp")]
	time_stamp: String,
	confirmations: String,
	#[serde(rename = "blockNumber")]
	block_number: String,
	#[serde(rename = "isError", default)]
	is_error: String,
}

impl EvmScanClient {
	pub fn new(client: reqwest::Client, coin: Coin, settings: ScanApiSettings) -> Self {
		EvmScanClient { client, coin, settings }
	}

	async fn proxy_call<T: DeserializeOwned>(
		&self,
		action: &str,
		extra: &[(&str, &str)],
	) -> anyhow::Result<Option<T>> {
		let mut query: Vec<(&str, &str)> = vec![
			("module", "proxy"),
			("action", action),
			("apikey", &self.settings.api_key),
		];
		query.extend_from_slice(extra);
		let response: ProxyResponse<T> = self
			.client
			.get(&self.settings.api_url)
			.query(&query)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.with_context(|| format!("{} proxy {} returned malformed JSON", self.coin, action))?;
		Ok(response.result)
	}

	async fn tip_block_number(&self) -> anyhow::Result<u64> {
		let tip: String = self
			.proxy_call("eth_blockNumber", &[])
			.await?
			.ok_or_else(|| anyhow!("{} scanner returned no tip block number", self.coin))?;
		parse_hex_u64(&tip)
	}

	async fn block_timestamp(&self, block_number: u64) -> anyhow::Result<i64> {
		let tag = format!("0x{:x}", block_number);
		let block: ProxyBlock = self
			.proxy_call("eth_getBlockByNumber", &[("tag", &tag), ("boolean", "false")])
			.await?
			.ok_or_else(|| anyhow!("{} scanner has no block {}", self.coin, block_number))?;
		Ok(parse_hex_u64(&block.timestamp)? as i64)
	}
}

#[async_trait]
impl super::ChainClient for EvmScanClient {
	async fn get_transaction(&self, tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>> {
		let tx: Option<ProxyTx> =
			self.proxy_call("eth_getTransactionByHash", &[("txhash", tx_hash)]).await?;
		let Some(tx) = tx else { return Ok(None) };

		let (confirmations, block_height, timestamp) = match &tx.block_number {
			Some(number) => {
				let height = parse_hex_u64(number)?;
				let tip = self.tip_block_number().await?;
				let confirmations = tip.saturating_sub(height) + 1;
				(confirmations, height, self.block_timestamp(height).await?)
			},
			// Still in the mempool.
			None => (0, 0, 0),
		};

		Ok(Some(NormalisedTx {
			hash: tx.hash.clone(),
			amount: parse_wei(&tx.value)?,
			to: tx.to.unwrap_or_default().to_lowercase(),
			confirmations,
			block_height,
			timestamp,
			memo: None,
			all_outputs: None,
		}))
	}

	async fn get_address_transactions(
		&self,
		address: &str,
		since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>> {
		let response: ScanListResponse<Vec<ScanListedTx>> = self
			.client
			.get(&self.settings.api_url)
			.query(&[
				("module", "account"),
				("action", "txlist"),
				("address", address),
				("startblock", "0"),
				("endblock", "999999999"),
				("sort", "desc"),
				("apikey", &self.settings.api_key),
			])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;

		// "No transactions found" comes back as status 0; that is not an
		// error for a fresh deposit address.
		let listed = match response.result {
			Some(txs) => txs,
			None if response.status == "0" => vec![],
			None => return Err(anyhow!("{} txlist failed: {}", self.coin, response.message)),
		};

		let address_lower = address.to_lowercase();
		listed
			.into_iter()
			.filter(|tx| tx.to.to_lowercase() == address_lower)
			.filter(|tx| tx.is_error != "1")
			.map(|tx| {
				let timestamp: i64 = tx.time_stamp.parse().context("timeStamp")?;
				Ok(NormalisedTx {
					amount: parse_wei_decimal(&tx.value)?,
					to: tx.to.to_lowercase(),
					confirmations: tx.confirmations.parse().unwrap_or(0),
					block_height: tx.block_number.parse().unwrap_or(0),
					timestamp,
					hash: tx.hash,
					memo: None,
					all_outputs: None,
				})
			})
			.filter(|tx: &anyhow::Result<NormalisedTx>| {
				tx.as_ref().map(|t| t.timestamp > since).unwrap_or(true)
			})
			.collect()
	}

	async fn get_balance(&self, address: &str) -> anyhow::Result<f64> {
		let balance: String = self
			.proxy_call("eth_getBalance", &[("address", address), ("tag", "latest")])
			.await?
			.ok_or_else(|| anyhow!("{} scanner returned no balance", self.coin))?;
		parse_wei(&balance)
	}

	async fn sweep_inputs(&self, address: &str) -> anyhow::Result<super::SweepInputs> {
		let nonce: String = self
			.proxy_call("eth_getTransactionCount", &[("address", address), ("tag", "latest")])
			.await?
			.ok_or_else(|| anyhow!("{} scanner returned no nonce", self.coin))?;
		let gas_price: String = self
			.proxy_call("eth_gasPrice", &[])
			.await?
			.ok_or_else(|| anyhow!("{} scanner returned no gas price", self.coin))?;
		Ok(super::SweepInputs::Account {
			nonce: parse_hex_u64(&nonce)?,
			gas_price_wei: u128::from_str_radix(gas_price.trim_start_matches("0x"), 16)
				.with_context(|| format!("bad gas price: {}", gas_price))?,
			chain_id: evm_chain_id(self.coin),
		})
	}

	async fn broadcast_raw(&self, raw: &str) -> anyhow::Result<String> {
		let hash: String = self
			.proxy_call("eth_sendRawTransaction", &[("hex", raw)])
			.await?
			.ok_or_else(|| anyhow!("{} broadcast returned no hash", self.coin))?;
		Ok(hash)
	}
}

/// EIP-155 chain ids of the supported EVM networks.
pub fn evm_chain_id(coin: Coin) -> u64 {
	match coin {
		Coin::Eth => 1,
		Coin::Bnb => 56,
		Coin::Matic => 137,
		_ => 0,
	}
}

fn parse_hex_u64(value: &str) -> anyhow::Result<u64> {
	u64::from_str_radix(value.trim_start_matches("0x"), 16)
		.with_context(|| format!("bad hex quantity: {}", value))
}

/// `0x...` hex wei to whole coins.
fn parse_wei(value: &str) -> anyhow::Result<f64> {
	let wei = u128::from_str_radix(value.trim_start_matches("0x"), 16)
		.with_context(|| format!("bad wei value: {}", value))?;
	Ok(wei as f64 / WEI_PER_ETH)
}

/// Decimal-string wei (the txlist form) to whole coins.
fn parse_wei_decimal(value: &str) -> anyhow::Result<f64> {
	let wei: u128 = value.parse().with_context(|| format!("bad wei value: {}", value))?;
	Ok(wei as f64 / WEI_PER_ETH)
}
