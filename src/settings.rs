use crate::common::Coin;
use clap::Parser;
use config::{
	Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value, ValueKind,
};
use serde::Deserialize;
use std::{collections::HashMap, env};

#[derive(Debug, Clone, Deserialize)]
pub struct Api {
	pub bind: String,
	pub port: u16,
	/// Comma-separated list of allowed CORS origins.
	pub cors_origins: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
	pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HiveSettings {
	/// Comma-separated list of Hive API nodes, tried in order.
	pub nodes: String,
	pub creator_account: String,
	/// WIF-encoded active key of the creator account.
	pub creator_active_key: String,
	/// 64 hex chars.
	pub chain_id: String,
	pub address_prefix: String,
}

impl HiveSettings {
	pub fn node_list(&self) -> Vec<String> {
		self.nodes.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultSettings {
	/// 64 hex chars; never persisted to the database.
	pub master_seed: String,
	/// 64 hex chars (an AES-256 key).
	pub encryption_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BtcSettings {
	pub esplora_url: String,
	pub blockcypher_url: String,
	pub blockcypher_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanApiSettings {
	pub api_url: String,
	pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthSettings {
	pub api_url: String,
	pub api_key: String,
	/// Queried in order for a gas price; the static fallback applies when
	/// both fail.
	pub gas_price_url_primary: String,
	pub gas_price_url_secondary: String,
	pub fallback_gas_price_gwei: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolSettings {
	pub rpc_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
	pub btc: BtcSettings,
	pub eth: EthSettings,
	pub bnb: ScanApiSettings,
	pub matic: ScanApiSettings,
	pub sol: SolSettings,
}

/// Static pricing inputs per coin, used when every external source is down
/// and for the flat transfer-fee estimate on non-ETH chains.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinPricing {
	pub fallback_price_usd: f64,
	pub avg_transfer_fee: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingSettings {
	pub coingecko_url: String,
	pub btc: CoinPricing,
	pub eth: CoinPricing,
	pub bnb: CoinPricing,
	pub matic: CoinPricing,
	pub sol: CoinPricing,
	pub xmr: CoinPricing,
	pub dash: CoinPricing,
}

impl PricingSettings {
	pub fn for_coin(&self, coin: Coin) -> &CoinPricing {
		match coin {
			Coin::Btc => &self.btc,
			Coin::Eth => &self.eth,
			Coin::Bnb => &self.bnb,
			Coin::Matic => &self.matic,
			Coin::Sol => &self.sol,
			Coin::Xmr => &self.xmr,
			Coin::Dash => &self.dash,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RcSettings {
	pub beacon_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSettings {
	/// Comma-separated Hive accounts allowed on the admin endpoints.
	pub accounts: String,
}

impl AdminSettings {
	pub fn account_list(&self) -> Vec<String> {
		self.accounts
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidationSettings {
	/// Base network fee per sweep, in whole coins, scaled by input count
	/// and priority.
	pub btc_base_fee: f64,
	pub evm_base_fee: f64,
	pub sol_base_fee: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub api: Api,
	pub database: DatabaseSettings,
	pub hive: HiveSettings,
	pub vault: VaultSettings,
	pub chains: ChainSettings,
	pub pricing: PricingSettings,
	pub rc: RcSettings,
	pub admin: AdminSettings,
	pub consolidation: ConsolidationSettings,
}

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Hive account onramp daemon")]
pub struct CommandLineOptions {
	/// Path to a TOML settings file merged over the defaults.
	#[clap(long = "config")]
	pub config_file: Option<String>,
	#[clap(long = "api.port")]
	pub api_port: Option<u16>,
	#[clap(long = "database.file")]
	pub database_file: Option<String>,
	#[clap(long = "hive.nodes")]
	pub hive_nodes: Option<String>,
	#[clap(long = "hive.creator_account")]
	pub creator_account: Option<String>,
	#[clap(long = "chains.sol.rpc_url")]
	pub sol_rpc_url: Option<String>,
}

pub fn insert_command_line_option<T>(map: &mut Map<String, Value>, key: &str, option: &Option<T>)
where
	T: ToString,
{
	if let Some(value) = option {
		map.insert(key.to_string(), Value::new(None, ValueKind::String(value.to_string())));
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> std::result::Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "api.port", &self.api_port);
		insert_command_line_option(&mut map, "database.file", &self.database_file);
		insert_command_line_option(&mut map, "hive.nodes", &self.hive_nodes);
		insert_command_line_option(&mut map, "hive.creator_account", &self.creator_account);
		insert_command_line_option(&mut map, "chains.sol.rpc_url", &self.sol_rpc_url);

		Ok(map)
	}
}

/// Values that mean "nobody configured this"; startup refuses to run the
/// monitors with them in place.
const PLACEHOLDER_KEYS: [&str; 4] = ["", "YourApiKeyToken", "changeme", "dummy"];

impl Settings {
	pub fn load(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Self::set_defaults(Config::builder())?;

		if let Some(file) = &opts.config_file {
			builder = builder.add_source(File::with_name(file));
		}

		let mut settings: Settings = builder
			.add_source(Environment::default().separator("__"))
			.add_source(opts)
			.build()?
			.try_deserialize()?;

		settings.apply_well_known_env();
		settings.validate().map_err(|e| ConfigError::Message(e))?;

		Ok(settings)
	}

	fn set_defaults(
		builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		builder
			.set_default("api.bind", "127.0.0.1")?
			.set_default("api.port", 3030)?
			.set_default("api.cors_origins", "http://localhost:8080")?
			.set_default("database.file", "onramp.db")?
			.set_default("hive.nodes", "https://api.hive.blog,https://api.deathwing.me")?
			.set_default("hive.creator_account", "")?
			.set_default("hive.creator_active_key", "")?
			.set_default(
				"hive.chain_id",
				"beeab0de00000000000000000000000000000000000000000000000000000000",
			)?
			.set_default("hive.address_prefix", "STM")?
			.set_default("vault.master_seed", "")?
			.set_default("vault.encryption_key", "")?
			.set_default("chains.btc.esplora_url", "https://blockstream.info/api")?
			.set_default("chains.btc.blockcypher_url", "https://api.blockcypher.com/v1/btc/main")?
			.set_default("chains.btc.blockcypher_token", "")?
			.set_default("chains.eth.api_url", "https://api.etherscan.io/api")?
			.set_default("chains.eth.api_key", "")?
			.set_default(
				"chains.eth.gas_price_url_primary",
				"https://api.etherscan.io/api?module=gastracker&action=gasoracle",
			)?
			.set_default(
				"chains.eth.gas_price_url_secondary",
				"https://ethgasstation.info/api/ethgasAPI.json",
			)?
			.set_default("chains.eth.fallback_gas_price_gwei", 30.0)?
			.set_default("chains.bnb.api_url", "https://api.bscscan.com/api")?
			.set_default("chains.bnb.api_key", "")?
			.set_default("chains.matic.api_url", "https://api.polygonscan.com/api")?
			.set_default("chains.matic.api_key", "")?
			.set_default("chains.sol.rpc_url", "https://api.mainnet-beta.solana.com")?
			.set_default("pricing.coingecko_url", "https://api.coingecko.com/api/v3/simple/price")?
			.set_default("pricing.btc.fallback_price_usd", 50000.0)?
			.set_default("pricing.btc.avg_transfer_fee", 0.0001)?
			.set_default("pricing.eth.fallback_price_usd", 3000.0)?
			.set_default("pricing.eth.avg_transfer_fee", 0.002)?
			.set_default("pricing.bnb.fallback_price_usd", 500.0)?
			.set_default("pricing.bnb.avg_transfer_fee", 0.0005)?
			.set_default("pricing.matic.fallback_price_usd", 0.8)?
			.set_default("pricing.matic.avg_transfer_fee", 0.01)?
			.set_default("pricing.sol.fallback_price_usd", 150.0)?
			.set_default("pricing.sol.avg_transfer_fee", 0.000005)?
			.set_default("pricing.xmr.fallback_price_usd", 150.0)?
			.set_default("pricing.xmr.avg_transfer_fee", 0.0001)?
			.set_default("pricing.dash.fallback_price_usd", 30.0)?
			.set_default("pricing.dash.avg_transfer_fee", 0.0001)?
			.set_default("rc.beacon_url", "https://beacon.peakd.com/api/rc/costs")?
			.set_default("admin.accounts", "")?
			.set_default("consolidation.btc_base_fee", 0.0001)?
			.set_default("consolidation.evm_base_fee", 0.0005)?
			.set_default("consolidation.sol_base_fee", 0.000005)
	}

	/// The deployment contract names a handful of flat environment
	/// variables; map them onto their settings slots when present.
	fn apply_well_known_env(&mut self) {
		if let Ok(v) = env::var("CRYPTO_MASTER_SEED") {
			self.vault.master_seed = v;
		}
		if let Ok(v) = env::var("CRYPTO_ENCRYPTION_KEY") {
			self.vault.encryption_key = v;
		}
		if let Ok(v) = env::var("HIVE_CREATOR_ACCOUNT") {
			self.hive.creator_account = v;
		}
		if let Ok(v) = env::var("HIVE_CREATOR_ACTIVE_KEY") {
			self.hive.creator_active_key = v;
		}
		if let Ok(v) = env::var("ETHERSCAN_API_KEY") {
			self.chains.eth.api_key = v;
		}
		if let Ok(v) = env::var("BSCSCAN_API_KEY") {
			self.chains.bnb.api_key = v;
		}
		if let Ok(v) = env::var("POLYGONSCAN_API_KEY") {
			self.chains.matic.api_key = v;
		}
		if let Ok(v) = env::var("BLOCKCYPHER_TOKEN") {
			self.chains.btc.blockcypher_token = v;
		}
	}

	fn validate(&self) -> Result<(), String> {
		fn is_64_hex(s: &str) -> bool {
			s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
		}

		if !is_64_hex(&self.vault.master_seed) {
			return Err("vault.master_seed / CRYPTO_MASTER_SEED must be 64 hex chars".to_string());
		}
		if !is_64_hex(&self.vault.encryption_key) {
			return Err(
				"vault.encryption_key / CRYPTO_ENCRYPTION_KEY must be 64 hex chars".to_string()
			);
		}
		if !is_64_hex(&self.hive.chain_id) {
			return Err("hive.chain_id must be 64 hex chars".to_string());
		}
		if self.hive.creator_account.is_empty() {
			return Err("hive.creator_account is required".to_string());
		}
		if self.hive.creator_active_key.is_empty() {
			return Err("hive.creator_active_key is required".to_string());
		}
		if self.hive.node_list().is_empty() {
			return Err("hive.nodes must name at least one node".to_string());
		}
		for (name, key) in [
			("chains.eth.api_key", &self.chains.eth.api_key),
			("chains.bnb.api_key", &self.chains.bnb.api_key),
			("chains.matic.api_key", &self.chains.matic.api_key),
		] {
			if PLACEHOLDER_KEYS.contains(&key.as_str()) {
				return Err(format!("{} is unset or a placeholder", name));
			}
		}
		Ok(())
	}

	/// Per-coin scanner settings for the EVM family.
	pub fn scan_api(&self, coin: Coin) -> Option<ScanApiSettings> {
		match coin {
			Coin::Eth => Some(ScanApiSettings {
				api_url: self.chains.eth.api_url.clone(),
				api_key: self.chains.eth.api_key.clone(),
			}),
			Coin::Bnb => Some(self.chains.bnb.clone()),
			Coin::Matic => Some(self.chains.matic.clone()),
			_ => None,
		}
	}
}
