//! Admin authentication: a Hive-signed challenge carried in four headers.
//! The signature must recover to the supplied key, the key must belong to
//! the account on chain, the account must be a configured admin, and the
//! challenge must be fresh.

use crate::{
	constants::CHALLENGE_MAX_AGE,
	errors::{Error, Result},
	hive::{keys, rpc::HiveRpc, tx},
};
use sha2::{Digest, Sha256};
use tracing::debug;

/// How far in the future a challenge timestamp may sit before it is
/// treated as clock abuse.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct AdminChallenge {
	pub account: String,
	pub challenge: String,
	pub pubkey: String,
	pub signature: String,
}

/// Offline part of the check: freshness and signature recovery.
pub fn verify_challenge_signature(challenge: &AdminChallenge, now: i64) -> Result<()> {
	let timestamp = challenge_timestamp(&challenge.challenge)?;
	let age = now - timestamp;
	if age > CHALLENGE_MAX_AGE.as_secs() as i64 {
		return Err(Error::Unauthorized("challenge has expired".to_string()));
	}
	if age < -MAX_CLOCK_SKEW_SECS {
		return Err(Error::Unauthorized("challenge is from the future".to_string()));
	}

	let digest: [u8; 32] = Sha256::digest(challenge.challenge.as_bytes()).into();
	let recovered = tx::recover_public_key(&digest, &challenge.signature)?;
	let claimed = keys::decode_public_key(&challenge.pubkey)?;
	if recovered != claimed {
		return Err(Error::Unauthorized("signature does not match the supplied key".to_string()));
	}
	Ok(())
}

/// Full check including the on-chain key lookup.
pub async fn verify_admin(
	rpc: &HiveRpc,
	admin_accounts: &[String],
	challenge: &AdminChallenge,
	now: i64,
) -> Result<()> {
	if !admin_accounts.iter().any(|account| account == &challenge.account) {
		return Err(Error::Forbidden(format!("{} is not an admin account", challenge.account)));
	}
	verify_challenge_signature(challenge, now)?;

	let account = rpc
		.get_account(&challenge.account)
		.await
		.map_err(Error::from)?
		.ok_or_else(|| Error::Unauthorized(format!("account {} not found", challenge.account)))?;
	if !account_holds_key(&account, &challenge.pubkey) {
		return Err(Error::Unauthorized(format!(
			"key does not belong to {}",
			challenge.account
		)));
	}
	debug!("Admin challenge accepted for {}", challenge.account);
	Ok(())
}

/// The challenge's trailing `:`-separated field is its unix timestamp.
fn challenge_timestamp(challenge: &str) -> Result<i64> {
	challenge
		.rsplit(':')
		.next()
		.and_then(|field| field.trim().parse().ok())
		.ok_or_else(|| Error::Unauthorized("challenge carries no timestamp".to_string()))
}

/// Active or posting authority must list the key.
fn account_holds_key(account: &serde_json::Value, pubkey: &str) -> bool {
	["active", "posting", "owner"].iter().any(|role| {
		account[role]["key_auths"]
			.as_array()
			.map(|auths| {
				auths.iter().any(|auth| auth[0].as_str() == Some(pubkey))
			})
			.unwrap_or(false)
	})
}
