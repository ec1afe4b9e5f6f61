use crate::common::NormalisedTx;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Confirmation count reported for finalized transactions, where the node
/// stops counting.
const FINALIZED_CONFIRMATIONS: u64 = 32;

const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";

/// Solana JSON-RPC client.
pub struct SolClient {
	client: reqwest::Client,
	rpc_url: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
	result: Option<Value>,
	error: Option<Value>,
}

impl SolClient {
	pub fn new(client: reqwest::Client, rpc_url: String) -> Self {
		SolClient { client, rpc_url }
	}

	async fn call_rpc(&self, method: &str, params: Value) -> anyhow::Result<Value> {
		let envelope: RpcEnvelope = self
			.client
			.post(&self.rpc_url)
			.json(&json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
			.send()
			.await?
			.error_for_status()?
			.json()
			.await
			.with_context(|| format!("solana {} returned malformed JSON", method))?;
		if let Some(error) = envelope.error {
			return Err(anyhow!("solana {} failed: {}", method, error));
		}
		Ok(envelope.result.unwrap_or(Value::Null))
	}

	async fn signature_confirmations(&self, signature: &str) -> anyhow::Result<u64> {
		let result = self
			.call_rpc(
				"getSignatureStatuses",
				json!([[signature], { "searchTransactionHistory": true }]),
			)
			.await?;
		let status = &result["value"][0];
		if status.is_null() {
			return Ok(0);
		}
		// `confirmations` goes null once the transaction is finalized.
		Ok(status["confirmations"].as_u64().unwrap_or(FINALIZED_CONFIRMATIONS))
	}
}

#[async_trait]
impl super::ChainClient for SolClient {
	async fn get_transaction(&self, tx_hash: &str) -> anyhow::Result<Option<NormalisedTx>> {
		let result = self
			.call_rpc(
				"getTransaction",
				json!([tx_hash, {
					"encoding": "jsonParsed",
					"commitment": "confirmed",
					"maxSupportedTransactionVersion": 0
				}]),
			)
			.await?;
		if result.is_null() {
			return Ok(None);
		}
		let mut tx = parse_transaction(tx_hash, &result)
			.ok_or_else(|| anyhow!("unparseable solana transaction {}", tx_hash))?;
		tx.confirmations = self.signature_confirmations(tx_hash).await?;
		Ok(Some(tx))
	}

	async fn get_address_transactions(
		&self,
		address: &str,
		since: i64,
	) -> anyhow::Result<Vec<NormalisedTx>> {
		let result = self
			.call_rpc("getSignaturesForAddress", json!([address, { "limit": 25 }]))
			.await?;
		let signatures: Vec<(String, i64)> = result
			.as_array()
			.map(|entries| {
				entries
					.iter()
					.filter(|entry| entry["err"].is_null())
					.filter_map(|entry| {
						Some((
							entry["signature"].as_str()?.to_string(),
							entry["blockTime"].as_i64().unwrap_or(0),
						))
					})
					.filter(|(_, block_time)| *block_time > since)
					.collect()
			})
			.unwrap_or_default();

		let mut transactions = Vec::new();
		for (signature, _) in signatures {
			if let Some(tx) = self.get_transaction(&signature).await? {
				if tx.to == address {
					transactions.push(tx);
				}
			}
		}
		Ok(transactions)
	}

	async fn get_balance(&self, address: &str) -> anyhow::Result<f64> {
		let result = self.call_rpc("getBalance", json!([address])).await?;
		let lamports = result["value"]
			.as_u64()
			.ok_or_else(|| anyhow!("getBalance returned no value"))?;
		Ok(lamports as f64 / LAMPORTS_PER_SOL)
	}

	async fn sweep_inputs(&self, _address: &str) -> anyhow::Result<super::SweepInputs> {
		let result = self
			.call_rpc("getLatestBlockhash", json!([{ "commitment": "finalized" }]))
			.await?;
		let recent_blockhash = result["value"]["blockhash"]
			.as_str()
			.ok_or_else(|| anyhow!("getLatestBlockhash returned no blockhash"))?
			.to_string();
		Ok(super::SweepInputs::Solana { recent_blockhash })
	}

	async fn broadcast_raw(&self, raw: &str) -> anyhow::Result<String> {
		let result = self
			.call_rpc("sendTransaction", json!([raw, { "encoding": "base64" }]))
			.await?;
		result
			.as_str()
			.map(String::from)
			.ok_or_else(|| anyhow!("sendTransaction returned no signature"))
	}
}

/// Pull the first system transfer and any memo out of a jsonParsed
/// transaction.
fn parse_transaction(signature: &str, result: &Value) -> Option<NormalisedTx> {
	let instructions = result["transaction"]["message"]["instructions"].as_array()?;

	let mut destination = String::new();
	let mut lamports: u64 = 0;
	let mut memo: Option<String> = None;

	for instruction in instructions {
		let program = instruction["program"].as_str().unwrap_or_default();
		let program_id = instruction["programId"].as_str().unwrap_or_default();
		if program == "system" {
			let parsed = &instruction["parsed"];
			if parsed["type"].as_str() == Some("transfer") && destination.is_empty() {
				destination = parsed["info"]["destination"].as_str().unwrap_or_default().to_string();
				lamports = parsed["info"]["lamports"].as_u64().unwrap_or(0);
			}
		} else if program == "spl-memo" || program_id == MEMO_PROGRAM_ID {
			memo = decode_memo(instruction);
		}
	}

	if destination.is_empty() {
		return None;
	}

	Some(NormalisedTx {
		hash: signature.to_string(),
		amount: lamports as f64 / LAMPORTS_PER_SOL,
		to: destination,
		confirmations: 0,
		block_height: result["slot"].as_u64().unwrap_or(0),
		timestamp: result["blockTime"].as_i64().unwrap_or(0),
		memo,
		all_outputs: None,
	})
}

/// Memo-program payloads arrive pre-parsed as a string under jsonParsed
/// encoding, or as base64 instruction data otherwise.
fn decode_memo(instruction: &Value) -> Option<String> {
	if let Some(text) = instruction["parsed"].as_str() {
		return Some(text.to_string());
	}
	let data = instruction["data"].as_str()?;
	let bytes = base64::decode(data).ok()?;
	String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn transfer_tx(memo_instruction: Value) -> Value {
		json!({
			"slot": 250000000,
			"blockTime": 1700000100,
			"meta": { "err": null },
			"transaction": { "message": { "instructions": [
				{
					"program": "system",
					"programId": "11111111111111111111111111111111",
					"parsed": {
						"type": "transfer",
						"info": {
							"source": "SourceAddr1111111111111111111111",
							"destination": "DepositAddr111111111111111111111",
							"lamports": 1500000000u64
						}
					}
				},
				memo_instruction
			] } }
		})
	}

	#[test]
	fn parses_transfer_with_parsed_memo() {
		let result = transfer_tx(json!({
			"program": "spl-memo",
			"programId": MEMO_PROGRAM_ID,
			"parsed": "xyz"
		}));
		let tx = parse_transaction("sig111", &result).unwrap();
		assert_eq!(tx.to, "DepositAddr111111111111111111111");
		assert!((tx.amount - 1.5).abs() < 1e-12);
		assert_eq!(tx.memo.as_deref(), Some("xyz"));
		assert_eq!(tx.timestamp, 1_700_000_100);
	}

	#[test]
	fn parses_base64_memo_data() {
		let result = transfer_tx(json!({
			"programId": MEMO_PROGRAM_ID,
			"data": base64::encode("xyz")
		}));
		let tx = parse_transaction("sig222", &result).unwrap();
		assert_eq!(tx.memo.as_deref(), Some("xyz"));
	}

	#[test]
	fn non_transfer_transactions_are_ignored() {
		let result = json!({
			"slot": 1,
			"blockTime": 2,
			"transaction": { "message": { "instructions": [
				{ "program": "vote", "programId": "Vote111111111111111111111111111111111111111" }
			] } }
		});
		assert!(parse_transaction("sig333", &result).is_none());
	}
}
