use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// The currencies a channel can be paid in, plus the pricing-only entries.
///
/// `Xmr` and `Dash` exist so pricing snapshots stay shape-compatible with
/// the configuration; they are never monitoring-enabled and the channel
/// engine refuses them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coin {
	Btc,
	Eth,
	Bnb,
	Matic,
	Sol,
	Xmr,
	Dash,
}

/// Which transaction model the network follows; decides how deposits are
/// matched and how consolidation transactions are built.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChainFamily {
	Utxo,
	Account,
	Solana,
}

/// Static per-coin properties.
pub struct CoinInfo {
	pub symbol: &'static str,
	pub coingecko_id: &'static str,
	pub decimals: u32,
	/// Average block time in seconds; doubles as the poll cadence.
	pub block_time_secs: u64,
	/// Confirmations before a deposit counts as final.
	pub required_confirmations: u64,
	/// Deposits below this (in whole coins) are treated as dust.
	pub dust_minimum: f64,
	pub family: ChainFamily,
	/// BIP44 coin type (SLIP-0010 account for Solana).
	pub bip44_coin_type: u32,
	/// Whether deposits on this network are watched at all.
	pub monitoring_enabled: bool,
}

impl Coin {
	pub const MONITORED: [Coin; 5] = [Coin::Btc, Coin::Eth, Coin::Bnb, Coin::Matic, Coin::Sol];
	pub const ALL: [Coin; 7] =
		[Coin::Btc, Coin::Eth, Coin::Bnb, Coin::Matic, Coin::Sol, Coin::Xmr, Coin::Dash];

	pub fn get_info(&self) -> CoinInfo {
		match self {
			Coin::Btc => CoinInfo {
				symbol: "BTC",
				coingecko_id: "bitcoin",
				decimals: 8,
				block_time_secs: 600,
				required_confirmations: 2,
				dust_minimum: 0.00000546,
				family: ChainFamily::Utxo,
				bip44_coin_type: 0,
				monitoring_enabled: true,
			},
			Coin::Eth => CoinInfo {
				symbol: "ETH",
				coingecko_id: "ethereum",
				decimals: 18,
				block_time_secs: 12,
				required_confirmations: 2,
				dust_minimum: 0.000001,
				family: ChainFamily::Account,
				bip44_coin_type: 60,
				monitoring_enabled: true,
			},
			Coin::Bnb => CoinInfo {
				symbol: "BNB",
				coingecko_id: "binancecoin",
				decimals: 18,
				block_time_secs: 3,
				required_confirmations: 3,
				dust_minimum: 0.000001,
				family: ChainFamily::Account,
				bip44_coin_type: 60,
				monitoring_enabled: true,
			},
			Coin::Matic => CoinInfo {
				symbol: "MATIC",
				coingecko_id: "matic-network",
				decimals: 18,
				block_time_secs: 2,
				required_confirmations: 10,
				dust_minimum: 0.000001,
				family: ChainFamily::Account,
				bip44_coin_type: 60,
				monitoring_enabled: true,
			},
			Coin::Sol => CoinInfo {
				symbol: "SOL",
				coingecko_id: "solana",
				decimals: 9,
				block_time_secs: 1,
				required_confirmations: 1,
				dust_minimum: 0.000001,
				family: ChainFamily::Solana,
				bip44_coin_type: 501,
				monitoring_enabled: true,
			},
			Coin::Xmr => CoinInfo {
				symbol: "XMR",
				coingecko_id: "monero",
				decimals: 12,
				block_time_secs: 120,
				required_confirmations: 10,
				dust_minimum: 0.0001,
				family: ChainFamily::Account,
				bip44_coin_type: 128,
				monitoring_enabled: false,
			},
			Coin::Dash => CoinInfo {
				symbol: "DASH",
				coingecko_id: "dash",
				decimals: 8,
				block_time_secs: 150,
				required_confirmations: 6,
				dust_minimum: 0.00000546,
				family: ChainFamily::Utxo,
				bip44_coin_type: 5,
				monitoring_enabled: false,
			},
		}
	}
}

impl Display for Coin {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.get_info().symbol)
	}
}

impl FromStr for Coin {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_uppercase().as_str() {
			"BTC" => Ok(Coin::Btc),
			"ETH" => Ok(Coin::Eth),
			"BNB" | "BSC" => Ok(Coin::Bnb),
			"MATIC" | "POLYGON" => Ok(Coin::Matic),
			"SOL" | "SOLANA" => Ok(Coin::Sol),
			"XMR" | "MONERO" => Ok(Coin::Xmr),
			"DASH" => Ok(Coin::Dash),
			other => Err(format!("unknown coin: {}", other)),
		}
	}
}

/// Lifecycle of a payment channel.
///
/// `Pending -> Confirming -> Confirmed -> Completed`, with `Failed`,
/// `Expired` and `Consolidated` terminal. Transitions are enforced with a
/// conditional UPDATE, so out-of-order writes lose.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
	Pending,
	Confirming,
	Confirmed,
	Completed,
	Failed,
	Expired,
	Consolidated,
}

impl ChannelStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ChannelStatus::Pending => "pending",
			ChannelStatus::Confirming => "confirming",
			ChannelStatus::Confirmed => "confirmed",
			ChannelStatus::Completed => "completed",
			ChannelStatus::Failed => "failed",
			ChannelStatus::Expired => "expired",
			ChannelStatus::Consolidated => "consolidated",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			ChannelStatus::Completed |
				ChannelStatus::Failed |
				ChannelStatus::Expired |
				ChannelStatus::Consolidated
		)
	}

	/// States a channel may be in immediately before entering `self`.
	pub fn allowed_prior_states(&self) -> &'static [ChannelStatus] {
		match self {
			ChannelStatus::Pending => &[],
			ChannelStatus::Confirming => &[ChannelStatus::Pending, ChannelStatus::Confirming],
			ChannelStatus::Confirmed =>
				&[ChannelStatus::Pending, ChannelStatus::Confirming, ChannelStatus::Confirmed],
			// Forward jumps happen when an account shows up on chain
			// through external reconciliation.
			ChannelStatus::Completed =>
				&[ChannelStatus::Pending, ChannelStatus::Confirming, ChannelStatus::Confirmed],
			ChannelStatus::Failed =>
				&[ChannelStatus::Pending, ChannelStatus::Confirming, ChannelStatus::Confirmed],
			// Expiry may pre-empt any non-terminal state.
			ChannelStatus::Expired =>
				&[ChannelStatus::Pending, ChannelStatus::Confirming, ChannelStatus::Confirmed],
			ChannelStatus::Consolidated => &[ChannelStatus::Completed],
		}
	}

	pub fn progress_percent(&self) -> u8 {
		match self {
			ChannelStatus::Pending => 10,
			ChannelStatus::Confirming => 50,
			ChannelStatus::Confirmed => 75,
			ChannelStatus::Completed => 100,
			ChannelStatus::Failed | ChannelStatus::Expired | ChannelStatus::Consolidated => 0,
		}
	}

	pub fn status_message(&self) -> &'static str {
		match self {
			ChannelStatus::Pending => "Waiting for payment",
			ChannelStatus::Confirming => "Payment detected, waiting for confirmations",
			ChannelStatus::Confirmed => "Payment confirmed, creating Hive account",
			ChannelStatus::Completed => "Hive account created",
			ChannelStatus::Failed => "Payment failed",
			ChannelStatus::Expired => "Channel expired without payment",
			ChannelStatus::Consolidated => "Funds consolidated",
		}
	}
}

impl Display for ChannelStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl FromStr for ChannelStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(ChannelStatus::Pending),
			"confirming" => Ok(ChannelStatus::Confirming),
			"confirmed" => Ok(ChannelStatus::Confirmed),
			"completed" => Ok(ChannelStatus::Completed),
			"failed" => Ok(ChannelStatus::Failed),
			"expired" => Ok(ChannelStatus::Expired),
			"consolidated" => Ok(ChannelStatus::Consolidated),
			other => Err(format!("unknown channel status: {}", other)),
		}
	}
}

/// The four public keys a new Hive account is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeySet {
	pub owner: String,
	pub active: String,
	pub posting: String,
	pub memo: String,
}

impl PublicKeySet {
	pub fn validate(&self) -> Result<(), String> {
		for (role, key) in [
			("owner", &self.owner),
			("active", &self.active),
			("posting", &self.posting),
			("memo", &self.memo),
		] {
			if !is_valid_public_key(key) {
				return Err(format!("invalid {} key", role));
			}
		}
		Ok(())
	}
}

/// A single output of a UTXO transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
	pub address: String,
	/// Whole coins.
	pub amount: f64,
	pub script_type: String,
}

/// Chain-agnostic view of a transaction, as produced by every network
/// client. UTXO chains fill `all_outputs`; account chains report the single
/// recipient in `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalisedTx {
	pub hash: String,
	/// Whole coins received by the queried address (or total, for UTXO).
	pub amount: f64,
	pub to: String,
	pub confirmations: u64,
	pub block_height: u64,
	/// Unix seconds. Zero while still in the mempool.
	pub timestamp: i64,
	pub memo: Option<String>,
	pub all_outputs: Option<Vec<TxOutput>>,
}

lazy_static! {
	static ref USERNAME_RE: Regex = Regex::new(
		r"^(?:[a-z][a-z0-9-]{1,}[a-z0-9])(?:\.[a-z][a-z0-9-]{1,}[a-z0-9])*$"
	)
	.unwrap();
	static ref PUBLIC_KEY_RE: Regex = Regex::new(r"^(STM|TST)[A-Za-z0-9]{50,60}$").unwrap();
	static ref CHANNEL_ID_RE: Regex = Regex::new(r"^[0-9a-f]{32}$").unwrap();
	static ref TX_HASH_RE: Regex = Regex::new(r"^(0x)?[0-9a-fA-F]{32,128}$").unwrap();
	static ref SOL_SIGNATURE_RE: Regex = Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{64,96}$").unwrap();
}

/// Hive account name rules: 3-16 chars, lowercase segments separated by
/// dots, each starting with a letter and not ending with a dash.
pub fn is_valid_username(name: &str) -> bool {
	name.len() >= 3 && name.len() <= 16 && USERNAME_RE.is_match(name)
}

pub fn is_valid_public_key(key: &str) -> bool {
	PUBLIC_KEY_RE.is_match(key)
}

pub fn is_valid_channel_id(id: &str) -> bool {
	CHANNEL_ID_RE.is_match(id)
}

/// Hex hashes for BTC/EVM, base58 signatures for Solana.
pub fn is_valid_tx_hash(coin: Coin, hash: &str) -> bool {
	match coin.get_info().family {
		ChainFamily::Solana => SOL_SIGNATURE_RE.is_match(hash),
		_ => TX_HASH_RE.is_match(hash),
	}
}

/// New 128-bit channel identifier, 32 hex chars.
pub fn new_channel_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

pub fn now_unix() -> i64 {
	chrono::Utc::now().timestamp()
}
