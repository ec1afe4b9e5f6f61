//! Hive node JSON-RPC. Every call walks the configured node list in order
//! until one answers.

use super::{
	keys, tx,
	tx::{Asset, Authority, Operation, Transaction},
	CreatorChainState, HiveApi,
};
use crate::{common::PublicKeySet, constants::HTTP_TIMEOUT, settings::HiveSettings};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use zeroize::Zeroizing;

/// Signed transactions stay valid this long.
const TX_EXPIRATION_SECS: i64 = 60;

pub struct HiveRpc {
	client: reqwest::Client,
	nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
	result: Option<Value>,
	error: Option<Value>,
}

impl HiveRpc {
	pub fn new(nodes: Vec<String>) -> crate::errors::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(HTTP_TIMEOUT)
			.build()
			.map_err(crate::errors::Error::from)?;
		Ok(HiveRpc { client, nodes })
	}

	pub async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
		let mut last_error = anyhow!("no Hive nodes configured");
		for node in &self.nodes {
			let request =
				json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
			match self.call_node(node, &request).await {
				Ok(result) => return Ok(result),
				Err(err) => {
					warn!("Hive node {} failed for {}: {:#}", node, method, err);
					last_error = err;
				},
			}
		}
		Err(last_error)
	}

	async fn call_node(&self, node: &str, request: &Value) -> anyhow::Result<Value> {
		let envelope: RpcEnvelope = self
			.client
			.post(node)
			.json(request)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.context("malformed JSON-RPC envelope")?;
		if let Some(error) = envelope.error {
			return Err(anyhow!("node error: {}", error));
		}
		Ok(envelope.result.unwrap_or(Value::Null))
	}

	/// Raw account object, or `None` when the name is unregistered.
	pub async fn get_account(&self, name: &str) -> anyhow::Result<Option<Value>> {
		let result =
			self.call("condenser_api.get_accounts", json!([[name]])).await?;
		Ok(result.as_array().and_then(|accounts| accounts.first().cloned()))
	}

	/// Reference block fields for a fresh transaction.
	pub async fn ref_block_info(&self) -> anyhow::Result<(u16, u32, i64)> {
		let props =
			self.call("condenser_api.get_dynamic_global_properties", json!([])).await?;
		let head_block_number = props["head_block_number"]
			.as_u64()
			.ok_or_else(|| anyhow!("missing head_block_number"))?;
		let head_block_id = props["head_block_id"]
			.as_str()
			.ok_or_else(|| anyhow!("missing head_block_id"))?;
		let id_bytes = hex::decode(head_block_id).context("head_block_id is not hex")?;
		if id_bytes.len() < 8 {
			return Err(anyhow!("head_block_id too short"));
		}
		let ref_block_num = (head_block_number & 0xffff) as u16;
		let ref_block_prefix =
			u32::from_le_bytes(id_bytes[4..8].try_into().expect("checked length"));
		let head_time = props["time"]
			.as_str()
			.and_then(parse_chain_time)
			.ok_or_else(|| anyhow!("missing chain time"))?;
		Ok((ref_block_num, ref_block_prefix, head_time))
	}

	/// Current RC mana of an account, via the RC API.
	pub async fn rc_current_mana(&self, account: &str) -> anyhow::Result<i64> {
		let result =
			self.call("rc_api.find_rc_accounts", json!({ "accounts": [account] })).await?;
		let mana = &result["rc_accounts"][0]["rc_manabar"]["current_mana"];
		// Comes back as either a JSON number or a string.
		mana.as_i64()
			.or_else(|| mana.as_str().and_then(|s| s.parse().ok()))
			.ok_or_else(|| anyhow!("missing rc_manabar for {}", account))
	}

	/// HIVE/USD from the feed's median history price (HBD treated as USD).
	pub async fn median_history_price(&self) -> anyhow::Result<f64> {
		let result =
			self.call("condenser_api.get_current_median_history_price", json!([])).await?;
		let base = parse_asset_amount(result["base"].as_str().unwrap_or_default())
			.ok_or_else(|| anyhow!("bad base asset"))?;
		let quote = parse_asset_amount(result["quote"].as_str().unwrap_or_default())
			.ok_or_else(|| anyhow!("bad quote asset"))?;
		if quote <= 0.0 {
			return Err(anyhow!("zero quote in median price"));
		}
		Ok(base / quote)
	}

	pub async fn broadcast_transaction(&self, legacy_tx: &Value) -> anyhow::Result<()> {
		self.call("condenser_api.broadcast_transaction", json!([legacy_tx])).await?;
		Ok(())
	}
}

fn parse_chain_time(value: &str) -> Option<i64> {
	chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
		.ok()
		.map(|t| t.and_utc().timestamp())
}

/// `"0.286 HBD"` -> 0.286
fn parse_asset_amount(value: &str) -> Option<f64> {
	value.split_whitespace().next().and_then(|amount| amount.parse().ok())
}

/// The production [`HiveApi`]: builds, signs and broadcasts real
/// operations with the creator's active key.
pub struct HiveBroadcaster {
	rpc: HiveRpc,
	creator_account: String,
	active_key: Zeroizing<[u8; 32]>,
	chain_id: [u8; 32],
	address_prefix: String,
}

impl HiveBroadcaster {
	pub fn new(settings: &HiveSettings) -> crate::errors::Result<Self> {
		let chain_id: [u8; 32] = hex::decode(&settings.chain_id)
			.ok()
			.and_then(|bytes| bytes.try_into().ok())
			.ok_or_else(|| crate::errors::Error::validation("hive.chain_id must be 64 hex"))?;
		Ok(HiveBroadcaster {
			rpc: HiveRpc::new(settings.node_list())?,
			creator_account: settings.creator_account.clone(),
			active_key: Zeroizing::new(keys::decode_wif(&settings.creator_active_key)?),
			chain_id,
			address_prefix: settings.address_prefix.clone(),
		})
	}

	pub fn rpc(&self) -> &HiveRpc {
		&self.rpc
	}

	pub fn address_prefix(&self) -> &str {
		&self.address_prefix
	}

	/// Sign and broadcast one operation; returns the transaction id that
	/// was persisted alongside the creation attempt.
	async fn broadcast_operation(&self, operation: Operation) -> anyhow::Result<String> {
		let (ref_block_num, ref_block_prefix, head_time) = self.rpc.ref_block_info().await?;
		let mut transaction = Transaction {
			ref_block_num,
			ref_block_prefix,
			expiration: head_time + TX_EXPIRATION_SECS,
			operations: vec![operation],
			signatures: vec![],
		};
		let signature = tx::sign_transaction(&transaction, &self.chain_id, &self.active_key)?;
		transaction.signatures.push(signature);
		let tx_id = tx::transaction_id(&transaction)?;
		self.rpc.broadcast_transaction(&tx::to_legacy_json(&transaction)).await?;
		Ok(tx_id)
	}

	fn authorities(keys: &PublicKeySet) -> (Authority, Authority, Authority, String) {
		(
			Authority::single_key(&keys.owner),
			Authority::single_key(&keys.active),
			Authority::single_key(&keys.posting),
			keys.memo.clone(),
		)
	}
}

#[async_trait]
impl HiveApi for HiveBroadcaster {
	async fn account_exists(&self, name: &str) -> anyhow::Result<bool> {
		Ok(self.rpc.get_account(name).await?.is_some())
	}

	async fn account_created_at(&self, name: &str) -> anyhow::Result<Option<i64>> {
		Ok(self
			.rpc
			.get_account(name)
			.await?
			.and_then(|account| account["created"].as_str().and_then(parse_chain_time)))
	}

	async fn creator_state(&self) -> anyhow::Result<CreatorChainState> {
		let account = self
			.rpc
			.get_account(&self.creator_account)
			.await?
			.ok_or_else(|| anyhow!("creator account {} not found", self.creator_account))?;
		let pending_claimed_accounts =
			account["pending_claimed_accounts"].as_u64().unwrap_or(0) as u32;
		let rc_current_mana = self.rpc.rc_current_mana(&self.creator_account).await?;
		Ok(CreatorChainState { pending_claimed_accounts, rc_current_mana })
	}

	async fn broadcast_claim_account(&self) -> anyhow::Result<String> {
		self.broadcast_operation(Operation::ClaimAccount {
			creator: self.creator_account.clone(),
			fee: Asset::hive(0.0),
		})
		.await
	}

	async fn broadcast_create_claimed_account(
		&self,
		username: &str,
		keys: &PublicKeySet,
	) -> anyhow::Result<String> {
		let (owner, active, posting, memo_key) = Self::authorities(keys);
		self.broadcast_operation(Operation::CreateClaimedAccount {
			creator: self.creator_account.clone(),
			new_account_name: username.to_string(),
			owner,
			active,
			posting,
			memo_key,
			json_metadata: String::new(),
		})
		.await
	}

	async fn broadcast_account_create(
		&self,
		username: &str,
		keys: &PublicKeySet,
	) -> anyhow::Result<String> {
		let (owner, active, posting, memo_key) = Self::authorities(keys);
		self.broadcast_operation(Operation::AccountCreate {
			fee: Asset::hive(crate::constants::HIVE_CREATION_FEE),
			creator: self.creator_account.clone(),
			new_account_name: username.to_string(),
			owner,
			active,
			posting,
			memo_key,
			json_metadata: String::new(),
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_chain_times() {
		assert_eq!(parse_chain_time("2023-11-14T22:13:20"), Some(1_700_000_000));
		assert_eq!(parse_chain_time("not a time"), None);
	}

	#[test]
	fn parses_asset_amounts() {
		assert_eq!(parse_asset_amount("0.286 HBD"), Some(0.286));
		assert_eq!(parse_asset_amount("1.000 HIVE"), Some(1.0));
		assert_eq!(parse_asset_amount(""), None);
	}

	#[test]
	fn ref_block_prefix_uses_bytes_four_to_eight() {
		// Mirrors the head_block_id slicing in ref_block_info.
		let id_bytes = hex::decode("0123456789abcdef0011223344556677").unwrap();
		let prefix = u32::from_le_bytes(id_bytes[4..8].try_into().unwrap());
		assert_eq!(prefix, u32::from_le_bytes([0x89, 0xab, 0xcd, 0xef]));
	}
}
