//! The admin-triggered consolidation executor: sweeps balances from
//! per-channel deposit addresses to one destination. UTXO chains take one
//! many-input transaction; account chains take one transaction per source;
//! Solana takes one multi-instruction transaction signed by every source.

use crate::{
	chains::{ChainClients, SweepInputs, Utxo},
	common::{now_unix, ChainFamily, Coin},
	errors::{Error, Result},
	settings::ConsolidationSettings,
	store::{ConsolidationRecord, CryptoAddress, Database},
	vault::AddressVault,
};
use bitcoin::{
	absolute::LockTime,
	sighash::{EcdsaSighashType, SighashCache},
	OutPoint, ScriptBuf, Sequence, Transaction as BtcTransaction, TxIn, TxOut, Witness,
};
use rlp::RlpStream;
use secp256k1::{Message, Secp256k1, SecretKey};
use serde::Serialize;
use sha3::{Digest, Keccak256};
use std::str::FromStr;
use tracing::{info, warn};

const EVM_TRANSFER_GAS: u128 = 21_000;
const SOL_LAMPORTS_PER_SIGNATURE: u64 = 5_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPriority {
	Low,
	Medium,
	High,
}

impl SweepPriority {
	pub fn multiplier(&self) -> f64 {
		match self {
			SweepPriority::Low => 0.5,
			SweepPriority::Medium => 1.0,
			SweepPriority::High => 2.0,
		}
	}
}

impl FromStr for SweepPriority {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"low" => Ok(SweepPriority::Low),
			"medium" => Ok(SweepPriority::Medium),
			"high" => Ok(SweepPriority::High),
			other => Err(Error::validation(format!("unknown priority: {}", other))),
		}
	}
}

/// One funded source address.
#[derive(Debug, Clone, Serialize)]
pub struct SourceBalance {
	pub address: String,
	pub channel_id: String,
	pub balance: f64,
	#[serde(skip)]
	pub row: CryptoAddress,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationPlan {
	pub crypto: String,
	pub destination: String,
	pub priority: SweepPriority,
	pub sources: Vec<SourceBalance>,
	pub total_amount: f64,
	pub estimated_fee: f64,
	pub net_amount: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOutcome {
	pub tx_id: String,
	pub additional_tx_hashes: Vec<String>,
	pub total_amount: f64,
	pub fee: f64,
	pub source_count: u32,
}

pub struct ConsolidationExecutor {
	db: Database,
	vault: AddressVault,
	clients: ChainClients,
	settings: ConsolidationSettings,
}

impl ConsolidationExecutor {
	pub fn new(
		db: Database,
		vault: AddressVault,
		clients: ChainClients,
		settings: ConsolidationSettings,
	) -> Self {
		ConsolidationExecutor { db, vault, clients, settings }
	}

	fn base_fee(&self, coin: Coin) -> f64 {
		match coin.get_info().family {
			ChainFamily::Utxo => self.settings.btc_base_fee,
			ChainFamily::Account => self.settings.evm_base_fee,
			ChainFamily::Solana => self.settings.sol_base_fee,
		}
	}

	/// `base_fee x inputs/10 x priority`, floored at one tenth of the
	/// base fee so tiny sweeps still estimate a cost.
	pub fn estimate_fee(&self, coin: Coin, input_count: usize, priority: SweepPriority) -> f64 {
		let scale = (input_count as f64 / 10.0).max(0.1);
		self.base_fee(coin) * scale * priority.multiplier()
	}

	/// Funded addresses of completed channels on one network.
	pub async fn funded_sources(&self, coin: Coin) -> Result<Vec<SourceBalance>> {
		let client = self
			.clients
			.get(&coin)
			.ok_or_else(|| Error::validation(format!("{} is not monitoring-enabled", coin)))?;
		let mut sources = Vec::new();
		for (row, channel_id) in self.db.addresses_for_consolidation(coin)? {
			match client.get_balance(&row.address).await {
				Ok(balance) if balance > 0.0 => sources.push(SourceBalance {
					address: row.address.clone(),
					channel_id,
					balance,
					row,
				}),
				Ok(_) => {},
				Err(err) => warn!("Balance check for {} failed: {:#}", row.address, err),
			}
		}
		Ok(sources)
	}

	pub async fn prepare(
		&self,
		coin: Coin,
		destination: &str,
		priority: SweepPriority,
	) -> Result<ConsolidationPlan> {
		if destination.trim().is_empty() {
			return Err(Error::validation("destination address is required"));
		}
		let sources = self.funded_sources(coin).await?;
		if sources.is_empty() {
			return Err(Error::NotFound("funded source addresses".to_string()));
		}
		let total_amount: f64 = sources.iter().map(|s| s.balance).sum();
		let estimated_fee = self.estimate_fee(coin, sources.len(), priority);
		let net_amount = total_amount - estimated_fee;
		if net_amount <= 0.0 {
			return Err(Error::Insufficient(format!(
				"net amount after the {:.8} fee",
				estimated_fee
			)));
		}
		Ok(ConsolidationPlan {
			crypto: coin.to_string(),
			destination: destination.to_string(),
			priority,
			sources,
			total_amount,
			estimated_fee,
			net_amount,
		})
	}

	/// Build, sign, broadcast and record the sweep.
	pub async fn execute(
		&self,
		coin: Coin,
		destination: &str,
		priority: SweepPriority,
	) -> Result<ConsolidationOutcome> {
		let plan = self.prepare(coin, destination, priority).await?;
		let client = self
			.clients
			.get(&coin)
			.ok_or_else(|| Error::validation(format!("{} is not monitoring-enabled", coin)))?;

		let mut hashes: Vec<String> = Vec::new();
		match coin.get_info().family {
			ChainFamily::Utxo => {
				let mut all_utxos: Vec<(Utxo, &SourceBalance)> = Vec::new();
				for source in &plan.sources {
					match client.sweep_inputs(&source.address).await.map_err(Error::from)? {
						SweepInputs::Utxo { utxos } =>
							all_utxos.extend(utxos.into_iter().map(|u| (u, source))),
						other =>
							return Err(Error::Integrity(format!(
								"expected UTXO sweep inputs, got {:?}",
								other
							))),
					}
				}
				let keyed: Vec<(Utxo, [u8; 32])> = all_utxos
					.into_iter()
					.map(|(utxo, source)| {
						Ok((utxo, *self.vault.unlock(&source.row)?))
					})
					.collect::<Result<_>>()?;
				let fee_sats = (plan.estimated_fee * 1e8).round() as u64;
				let raw = build_btc_sweep(&keyed, &plan.destination, fee_sats)?;
				hashes.push(client.broadcast_raw(&raw).await.map_err(Error::from)?);
			},
			ChainFamily::Account => {
				// One transaction per source; these accounts cannot be
				// multiplexed.
				for source in &plan.sources {
					let (nonce, gas_price_wei, chain_id) =
						match client.sweep_inputs(&source.address).await.map_err(Error::from)? {
							SweepInputs::Account { nonce, gas_price_wei, chain_id } =>
								(nonce, gas_price_wei, chain_id),
							other =>
								return Err(Error::Integrity(format!(
									"expected account sweep inputs, got {:?}",
									other
								))),
						};
					let balance_wei = (source.balance * 1e18) as u128;
					let gas_cost = gas_price_wei * EVM_TRANSFER_GAS;
					if balance_wei <= gas_cost {
						warn!("{} cannot cover its own gas, skipping", source.address);
						continue;
					}
					let secret = self.vault.unlock(&source.row)?;
					let raw = build_evm_transfer(
						&secret,
						nonce,
						gas_price_wei,
						chain_id,
						&plan.destination,
						balance_wei - gas_cost,
					)?;
					hashes.push(client.broadcast_raw(&raw).await.map_err(Error::from)?);
				}
			},
			ChainFamily::Solana => {
				let recent_blockhash =
					match client.sweep_inputs(&plan.sources[0].address).await.map_err(Error::from)? {
						SweepInputs::Solana { recent_blockhash } => recent_blockhash,
						other =>
							return Err(Error::Integrity(format!(
								"expected Solana sweep inputs, got {:?}",
								other
							))),
					};
				let signers: Vec<([u8; 32], u64)> = plan
					.sources
					.iter()
					.map(|source| {
						Ok((*self.vault.unlock(&source.row)?, (source.balance * 1e9) as u64))
					})
					.collect::<Result<_>>()?;
				let raw = build_sol_sweep(&signers, &plan.destination, &recent_blockhash)?;
				hashes.push(client.broadcast_raw(&raw).await.map_err(Error::from)?);
			},
		}

		if hashes.is_empty() {
			return Err(Error::Insufficient("spendable balance across sources".to_string()));
		}
		let tx_id = hashes[0].clone();
		let additional_tx_hashes = hashes[1..].to_vec();
		let source_channels: Vec<String> =
			plan.sources.iter().map(|s| s.channel_id.clone()).collect();

		self.db.record_consolidation(
			&ConsolidationRecord {
				tx_id: tx_id.clone(),
				coin,
				destination: plan.destination.clone(),
				total_amount: plan.total_amount,
				fee: plan.estimated_fee,
				source_count: plan.sources.len() as u32,
				additional_tx_hashes: additional_tx_hashes.clone(),
				created_at: now_unix(),
			},
			&source_channels,
		)?;
		info!(
			"Consolidated {} {} from {} addresses into {} ({})",
			plan.total_amount,
			coin,
			plan.sources.len(),
			plan.destination,
			tx_id
		);
		Ok(ConsolidationOutcome {
			tx_id,
			additional_tx_hashes,
			total_amount: plan.total_amount,
			fee: plan.estimated_fee,
			source_count: plan.sources.len() as u32,
		})
	}
}

/// One transaction, many inputs signed from distinct keys, one output.
fn build_btc_sweep(
	inputs: &[(Utxo, [u8; 32])],
	destination: &str,
	fee_sats: u64,
) -> Result<String> {
	let destination = bitcoin::Address::from_str(destination)
		.map_err(|_| Error::validation("bad destination address"))?
		.require_network(bitcoin::Network::Bitcoin)
		.map_err(|_| Error::validation("destination is not a mainnet address"))?;

	let total_sats: u64 = inputs.iter().map(|(utxo, _)| utxo.value_sats).sum();
	if total_sats <= fee_sats {
		return Err(Error::Insufficient("inputs do not cover the fee".to_string()));
	}

	let mut tx = BtcTransaction {
		version: 2,
		lock_time: LockTime::ZERO,
		input: inputs
			.iter()
			.map(|(utxo, _)| {
				Ok(TxIn {
					previous_output: OutPoint {
						txid: utxo.txid.parse().map_err(|_| {
							Error::validation(format!("bad utxo txid: {}", utxo.txid))
						})?,
						vout: utxo.vout,
					},
					script_sig: ScriptBuf::new(),
					sequence: Sequence::MAX,
					witness: Witness::new(),
				})
			})
			.collect::<Result<Vec<_>>>()?,
		output: vec![TxOut {
			value: total_sats - fee_sats,
			script_pubkey: destination.script_pubkey(),
		}],
	};

	let secp = Secp256k1::new();
	let mut witnesses = Vec::with_capacity(inputs.len());
	{
		let mut cache = SighashCache::new(&tx);
		for (index, (utxo, secret)) in inputs.iter().enumerate() {
			let secret_key = SecretKey::from_slice(secret)
				.map_err(|_| Error::Integrity("stored key out of range".to_string()))?;
			let public_key = bitcoin::PublicKey::new(bitcoin::secp256k1::PublicKey::from_slice(
				&secp256k1::PublicKey::from_secret_key(&secp, &secret_key).serialize(),
			)
			.expect("valid key round trip"));
			// BIP143 script code for p2wpkh is the legacy p2pkh script.
			let script_code = ScriptBuf::new_p2pkh(&public_key.pubkey_hash());
			let sighash = cache
				.segwit_signature_hash(index, &script_code, utxo.value_sats, EcdsaSighashType::All)
				.map_err(|e| Error::Internal(format!("sighash: {}", e)))?;
			let message = Message::from_slice(sighash.as_ref())
				.map_err(|_| Error::Internal("sighash length".to_string()))?;
			let mut signature = secp.sign_ecdsa(&message, &secret_key).serialize_der().to_vec();
			signature.push(EcdsaSighashType::All as u8);

			let mut witness = Witness::new();
			witness.push(signature);
			witness.push(public_key.to_bytes());
			witnesses.push(witness);
		}
	}
	for (input, witness) in tx.input.iter_mut().zip(witnesses) {
		input.witness = witness;
	}
	Ok(hex::encode(bitcoin::consensus::encode::serialize(&tx)))
}

/// Append an integer to an RLP stream in minimal big-endian form.
fn rlp_append_u128(stream: &mut RlpStream, value: u128) {
	let bytes = value.to_be_bytes();
	let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
	stream.append(&bytes[first..].to_vec());
}

/// A signed EIP-155 legacy transfer, hex-encoded with the `0x` prefix.
fn build_evm_transfer(
	secret: &[u8; 32],
	nonce: u64,
	gas_price_wei: u128,
	chain_id: u64,
	destination: &str,
	value_wei: u128,
) -> Result<String> {
	let to = hex::decode(destination.trim_start_matches("0x"))
		.map_err(|_| Error::validation("bad destination address"))?;
	if to.len() != 20 {
		return Err(Error::validation("destination must be 20 bytes"));
	}

	let body = |v: u64, r: &[u8], s: &[u8]| {
		let mut stream = RlpStream::new_list(9);
		stream.append(&nonce);
		rlp_append_u128(&mut stream, gas_price_wei);
		rlp_append_u128(&mut stream, EVM_TRANSFER_GAS);
		stream.append(&to);
		rlp_append_u128(&mut stream, value_wei);
		stream.append_empty_data();
		stream.append(&v);
		stream.append(&r.to_vec());
		stream.append(&s.to_vec());
		stream.out().to_vec()
	};

	// EIP-155 pre-image: (nonce, gas price, gas, to, value, data,
	// chain id, 0, 0).
	let preimage = body(chain_id, &[], &[]);
	let digest = Keccak256::digest(&preimage);

	let secp = Secp256k1::new();
	let secret_key = SecretKey::from_slice(secret)
		.map_err(|_| Error::Integrity("stored key out of range".to_string()))?;
	let message = Message::from_slice(&digest)
		.map_err(|_| Error::Internal("digest length".to_string()))?;
	let signature = secp.sign_ecdsa_recoverable(&message, &secret_key);
	let (recovery_id, compact) = signature.serialize_compact();

	let strip = |half: &[u8]| {
		let first = half.iter().position(|b| *b != 0).unwrap_or(half.len());
		half[first..].to_vec()
	};
	let v = chain_id * 2 + 35 + recovery_id.to_i32() as u64;
	let raw = body(v, &strip(&compact[..32]), &strip(&compact[32..]));
	Ok(format!("0x{}", hex::encode(raw)))
}

/// Compact-u16 length prefix from the Solana wire format.
fn sol_append_compact_u16(out: &mut Vec<u8>, mut value: u16) {
	loop {
		let mut byte = (value & 0x7f) as u8;
		value >>= 7;
		if value != 0 {
			byte |= 0x80;
		}
		out.push(byte);
		if value == 0 {
			break;
		}
	}
}

/// One multi-instruction transfer transaction signed by every source
/// keypair; the first source pays the signature fees. Returns base64.
fn build_sol_sweep(
	sources: &[([u8; 32], u64)],
	destination: &str,
	recent_blockhash: &str,
) -> Result<String> {
	use ed25519_dalek::Signer;

	if sources.is_empty() {
		return Err(Error::validation("no sources to sweep"));
	}
	let destination_key: [u8; 32] = bs58::decode(destination)
		.into_vec()
		.ok()
		.and_then(|bytes| bytes.try_into().ok())
		.ok_or_else(|| Error::validation("bad destination address"))?;
	let blockhash: [u8; 32] = bs58::decode(recent_blockhash)
		.into_vec()
		.ok()
		.and_then(|bytes| bytes.try_into().ok())
		.ok_or_else(|| Error::Internal("bad recent blockhash".to_string()))?;

	let keypairs: Vec<ed25519_dalek::SigningKey> =
		sources.iter().map(|(secret, _)| ed25519_dalek::SigningKey::from_bytes(secret)).collect();

	// Accounts: signers first, then the destination, then the system
	// program (read-only).
	let system_program = [0u8; 32];
	let mut account_keys: Vec<[u8; 32]> =
		keypairs.iter().map(|kp| kp.verifying_key().to_bytes()).collect();
	let destination_index = account_keys.len() as u8;
	account_keys.push(destination_key);
	let program_index = account_keys.len() as u8;
	account_keys.push(system_program);

	let fee_lamports = SOL_LAMPORTS_PER_SIGNATURE * sources.len() as u64;

	let mut message = Vec::with_capacity(256);
	message.push(sources.len() as u8); // required signatures
	message.push(0); // read-only signed
	message.push(1); // read-only unsigned (system program)
	sol_append_compact_u16(&mut message, account_keys.len() as u16);
	for key in &account_keys {
		message.extend_from_slice(key);
	}
	message.extend_from_slice(&blockhash);
	sol_append_compact_u16(&mut message, sources.len() as u16);
	for (index, (_, lamports)) in sources.iter().enumerate() {
		// The fee payer covers every signature out of its own transfer.
		let send = if index == 0 {
			lamports.checked_sub(fee_lamports).ok_or_else(|| {
				Error::Insufficient("fee payer balance below the signature fees".to_string())
			})?
		} else {
			*lamports
		};
		message.push(program_index);
		sol_append_compact_u16(&mut message, 2);
		message.push(index as u8);
		message.push(destination_index);
		let mut data = Vec::with_capacity(12);
		data.extend_from_slice(&2u32.to_le_bytes()); // SystemInstruction::Transfer
		data.extend_from_slice(&send.to_le_bytes());
		sol_append_compact_u16(&mut message, data.len() as u16);
		message.extend_from_slice(&data);
	}

	let mut transaction = Vec::with_capacity(message.len() + 64 * keypairs.len() + 4);
	sol_append_compact_u16(&mut transaction, keypairs.len() as u16);
	for keypair in &keypairs {
		transaction.extend_from_slice(&keypair.sign(&message).to_bytes());
	}
	transaction.extend_from_slice(&message);
	Ok(base64::encode(transaction))
}

#[cfg(test)]
#[path = "consolidation_tests.rs"]
mod tests;
