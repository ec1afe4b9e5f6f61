//! Everything that talks to the Hive blockchain: key codecs, operation
//! serialisation and signing, node RPC, and the account-creation
//! orchestrator.

pub mod creator;
pub mod keys;
pub mod rpc;
pub mod tx;

use crate::common::PublicKeySet;
use async_trait::async_trait;

/// Creator-account state as read from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatorChainState {
	pub pending_claimed_accounts: u32,
	pub rc_current_mana: i64,
}

/// The orchestrator's view of the chain. One production implementation
/// ([`rpc::HiveBroadcaster`]); tests swap in a mock.
#[async_trait]
pub trait HiveApi: Send + Sync {
	async fn account_exists(&self, name: &str) -> anyhow::Result<bool>;

	/// On-chain creation time (unix secs) of an account, if it exists.
	async fn account_created_at(&self, name: &str) -> anyhow::Result<Option<i64>>;

	async fn creator_state(&self) -> anyhow::Result<CreatorChainState>;

	/// Claim one Account Creation Token. Returns the transaction id.
	async fn broadcast_claim_account(&self) -> anyhow::Result<String>;

	/// Create `username` spending a previously claimed token.
	async fn broadcast_create_claimed_account(
		&self,
		username: &str,
		keys: &PublicKeySet,
	) -> anyhow::Result<String>;

	/// Create `username` the expensive way, paying the 3 HIVE fee.
	async fn broadcast_account_create(
		&self,
		username: &str,
		keys: &PublicKeySet,
	) -> anyhow::Result<String>;
}
