//! Hive transaction building: binary serialisation for signing, legacy
//! JSON for broadcast, and the canonical-signature discipline Hive nodes
//! enforce.

use crate::errors::{Error, Result};
use secp256k1::{ecdsa::RecoveryId, Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

// Operation ids from the Hive protocol.
const OP_ACCOUNT_CREATE: u8 = 9;
const OP_CLAIM_ACCOUNT: u8 = 22;
const OP_CREATE_CLAIMED_ACCOUNT: u8 = 23;

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
	/// Atomic units (millis for HIVE's precision of 3).
	pub amount: i64,
	pub precision: u8,
	pub symbol: String,
}

impl Asset {
	pub fn hive(amount: f64) -> Self {
		Asset { amount: (amount * 1000.0).round() as i64, precision: 3, symbol: "HIVE".to_string() }
	}

	/// Legacy string form, e.g. `3.000 HIVE`.
	pub fn to_legacy_string(&self) -> String {
		let scale = 10i64.pow(self.precision as u32);
		format!(
			"{}.{:0width$} {}",
			self.amount / scale,
			self.amount % scale,
			self.symbol,
			width = self.precision as usize
		)
	}
}

/// A single-key authority with threshold 1, which is all account creation
/// needs here.
#[derive(Debug, Clone, PartialEq)]
pub struct Authority {
	pub weight_threshold: u32,
	pub key_auths: Vec<(String, u16)>,
}

impl Authority {
	pub fn single_key(key: &str) -> Self {
		Authority { weight_threshold: 1, key_auths: vec![(key.to_string(), 1)] }
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	ClaimAccount {
		creator: String,
		fee: Asset,
	},
	CreateClaimedAccount {
		creator: String,
		new_account_name: String,
		owner: Authority,
		active: Authority,
		posting: Authority,
		memo_key: String,
		json_metadata: String,
	},
	AccountCreate {
		fee: Asset,
		creator: String,
		new_account_name: String,
		owner: Authority,
		active: Authority,
		posting: Authority,
		memo_key: String,
		json_metadata: String,
	},
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
	pub ref_block_num: u16,
	pub ref_block_prefix: u32,
	/// Unix seconds.
	pub expiration: i64,
	pub operations: Vec<Operation>,
	pub signatures: Vec<String>,
}

// ==== Binary serialisation ====

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
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

fn write_string(out: &mut Vec<u8>, value: &str) {
	write_varint(out, value.len() as u64);
	out.extend_from_slice(value.as_bytes());
}

fn write_asset(out: &mut Vec<u8>, asset: &Asset) {
	out.extend_from_slice(&asset.amount.to_le_bytes());
	out.push(asset.precision);
	let mut symbol = [0u8; 7];
	symbol[..asset.symbol.len()].copy_from_slice(asset.symbol.as_bytes());
	out.extend_from_slice(&symbol);
}

fn write_public_key(out: &mut Vec<u8>, key: &str) -> Result<()> {
	let bytes = super::keys::decode_public_key(key)?;
	out.extend_from_slice(&bytes);
	Ok(())
}

fn write_authority(out: &mut Vec<u8>, authority: &Authority) -> Result<()> {
	out.extend_from_slice(&authority.weight_threshold.to_le_bytes());
	// No account auths in generated authorities.
	write_varint(out, 0);
	write_varint(out, authority.key_auths.len() as u64);
	for (key, weight) in &authority.key_auths {
		write_public_key(out, key)?;
		out.extend_from_slice(&weight.to_le_bytes());
	}
	Ok(())
}

fn write_operation(out: &mut Vec<u8>, operation: &Operation) -> Result<()> {
	match operation {
		Operation::ClaimAccount { creator, fee } => {
			write_varint(out, OP_CLAIM_ACCOUNT as u64);
			write_string(out, creator);
			write_asset(out, fee);
			// extensions
			write_varint(out, 0);
		},
		Operation::CreateClaimedAccount {
			creator,
			new_account_name,
			owner,
			active,
			posting,
			memo_key,
			json_metadata,
		} => {
			write_varint(out, OP_CREATE_CLAIMED_ACCOUNT as u64);
			write_string(out, creator);
			write_string(out, new_account_name);
			write_authority(out, owner)?;
			write_authority(out, active)?;
			write_authority(out, posting)?;
			write_public_key(out, memo_key)?;
			write_string(out, json_metadata);
			write_varint(out, 0);
		},
		Operation::AccountCreate {
			fee,
			creator,
			new_account_name,
			owner,
			active,
			posting,
			memo_key,
			json_metadata,
		} => {
			write_varint(out, OP_ACCOUNT_CREATE as u64);
			write_asset(out, fee);
			write_string(out, creator);
			write_string(out, new_account_name);
			write_authority(out, owner)?;
			write_authority(out, active)?;
			write_authority(out, posting)?;
			write_public_key(out, memo_key)?;
			write_string(out, json_metadata);
		},
	}
	Ok(())
}

/// The signable body: everything but the signatures.
pub fn serialize_transaction(tx: &Transaction) -> Result<Vec<u8>> {
	let mut out = Vec::with_capacity(256);
	out.extend_from_slice(&tx.ref_block_num.to_le_bytes());
	out.extend_from_slice(&tx.ref_block_prefix.to_le_bytes());
	out.extend_from_slice(&(tx.expiration as u32).to_le_bytes());
	write_varint(&mut out, tx.operations.len() as u64);
	for operation in &tx.operations {
		write_operation(&mut out, operation)?;
	}
	// extensions
	write_varint(&mut out, 0);
	Ok(out)
}

/// Transaction id: the first 20 bytes of the body digest.
pub fn transaction_id(tx: &Transaction) -> Result<String> {
	let body = serialize_transaction(tx)?;
	Ok(hex::encode(&Sha256::digest(&body)[..20]))
}

/// Hive only accepts canonical signatures: neither component may have its
/// high bit set or a leading zero byte followed by a clear high bit.
fn is_canonical(signature: &[u8; 64]) -> bool {
	!(signature[0] & 0x80 != 0 ||
		(signature[0] == 0 && signature[1] & 0x80 == 0) ||
		signature[32] & 0x80 != 0 ||
		(signature[32] == 0 && signature[33] & 0x80 == 0))
}

/// Sign a 32-byte digest, re-rolling the nonce until the signature is
/// canonical. Returns the 65-byte compact signature, hex-encoded.
pub fn sign_digest(digest: &[u8; 32], secret: &[u8; 32]) -> Result<String> {
	let secp = Secp256k1::new();
	let secret_key = SecretKey::from_slice(secret)
		.map_err(|_| Error::Integrity("signing key out of range".to_string()))?;
	let message = Message::from_slice(digest)
		.map_err(|_| Error::Internal("digest has wrong length".to_string()))?;

	for nonce in 0u32.. {
		let mut extra = [0u8; 32];
		extra[..4].copy_from_slice(&nonce.to_le_bytes());
		let signature =
			secp.sign_ecdsa_recoverable_with_noncedata(&message, &secret_key, &extra);
		let (recovery_id, compact) = signature.serialize_compact();
		if is_canonical(&compact) {
			let mut out = [0u8; 65];
			out[0] = 31 + recovery_id.to_i32() as u8;
			out[1..].copy_from_slice(&compact);
			return Ok(hex::encode(out));
		}
	}
	unreachable!("the nonce space is not exhaustible")
}

/// Sign the transaction body under the given chain id.
pub fn sign_transaction(tx: &Transaction, chain_id: &[u8; 32], secret: &[u8; 32]) -> Result<String> {
	let body = serialize_transaction(tx)?;
	let mut hasher = Sha256::new();
	hasher.update(chain_id);
	hasher.update(&body);
	let digest: [u8; 32] = hasher.finalize().into();
	sign_digest(&digest, secret)
}

/// Recover the signing key from a 65-byte Hive signature; used by the
/// admin challenge check.
pub fn recover_public_key(digest: &[u8; 32], signature_hex: &str) -> Result<[u8; 33]> {
	let bytes = hex::decode(signature_hex)
		.map_err(|_| Error::validation("signature is not hex"))?;
	let bytes: [u8; 65] =
		bytes.try_into().map_err(|_| Error::validation("signature must be 65 bytes"))?;
	let recovery_id = RecoveryId::from_i32((bytes[0] as i32) - 31)
		.map_err(|_| Error::validation("bad recovery id"))?;
	let signature = secp256k1::ecdsa::RecoverableSignature::from_compact(&bytes[1..], recovery_id)
		.map_err(|_| Error::validation("malformed signature"))?;
	let message = Message::from_slice(digest)
		.map_err(|_| Error::Internal("digest has wrong length".to_string()))?;
	let secp = Secp256k1::new();
	let public = secp
		.recover_ecdsa(&message, &signature)
		.map_err(|_| Error::Unauthorized("signature does not recover".to_string()))?;
	Ok(public.serialize())
}

// ==== Legacy JSON (broadcast form) ====

fn authority_json(authority: &Authority) -> serde_json::Value {
	serde_json::json!({
		"weight_threshold": authority.weight_threshold,
		"account_auths": [],
		"key_auths": authority.key_auths.iter()
			.map(|(key, weight)| serde_json::json!([key, weight]))
			.collect::<Vec<_>>(),
	})
}

fn operation_json(operation: &Operation) -> serde_json::Value {
	match operation {
		Operation::ClaimAccount { creator, fee } => serde_json::json!([
			"claim_account",
			{
				"creator": creator,
				"fee": fee.to_legacy_string(),
				"extensions": [],
			}
		]),
		Operation::CreateClaimedAccount {
			creator,
			new_account_name,
			owner,
			active,
			posting,
			memo_key,
			json_metadata,
		} => serde_json::json!([
			"create_claimed_account",
			{
				"creator": creator,
				"new_account_name": new_account_name,
				"owner": authority_json(owner),
				"active": authority_json(active),
				"posting": authority_json(posting),
				"memo_key": memo_key,
				"json_metadata": json_metadata,
				"extensions": [],
			}
		]),
		Operation::AccountCreate {
			fee,
			creator,
			new_account_name,
			owner,
			active,
			posting,
			memo_key,
			json_metadata,
		} => serde_json::json!([
			"account_create",
			{
				"fee": fee.to_legacy_string(),
				"creator": creator,
				"new_account_name": new_account_name,
				"owner": authority_json(owner),
				"active": authority_json(active),
				"posting": authority_json(posting),
				"memo_key": memo_key,
				"json_metadata": json_metadata,
			}
		]),
	}
}

pub fn to_legacy_json(tx: &Transaction) -> serde_json::Value {
	let expiration = chrono::DateTime::from_timestamp(tx.expiration, 0)
		.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
		.unwrap_or_default();
	serde_json::json!({
		"ref_block_num": tx.ref_block_num,
		"ref_block_prefix": tx.ref_block_prefix,
		"expiration": expiration,
		"operations": tx.operations.iter().map(operation_json).collect::<Vec<_>>(),
		"extensions": [],
		"signatures": tx.signatures,
	})
}
