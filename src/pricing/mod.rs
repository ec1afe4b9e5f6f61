//! The pricing oracle. Refreshes hourly, degrades gracefully: CoinGecko
//! first, a Hive node's median history price for HIVE next, static
//! configuration last. Channel creation never blocks on pricing.

pub mod rc;

use crate::{
	common::{now_unix, Coin},
	constants::{
		BASE_COST_MULTIPLIER, NETWORK_FEE_SURCHARGE, PRICING_RETENTION, PRICING_STALE_AFTER,
	},
	errors::Result,
	hive::rpc::HiveRpc,
	settings::{EthSettings, PricingSettings},
	store::Database,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
	collections::BTreeMap,
	sync::{Arc, Weak},
};
use tracing::{info, warn};

const ETH_TRANSFER_GAS: f64 = 21_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryptoRate {
	pub price_usd: f64,
	pub amount_needed: f64,
	pub transfer_fee: f64,
	pub total_amount: f64,
	pub network_fee_surcharge_usd: f64,
	pub final_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
	pub hive_price_usd: f64,
	/// 3 HIVE at spot, the chain's delegation fee.
	pub base_cost_usd: f64,
	/// What an account costs before per-network surcharges.
	pub final_cost_usd: f64,
	pub crypto_rates: BTreeMap<String, CryptoRate>,
	pub transfer_costs: BTreeMap<String, f64>,
	/// True when any component came from a fallback source.
	pub fallback: bool,
	pub generated_at: i64,
}

pub struct PricingOracle {
	db: Database,
	client: reqwest::Client,
	settings: PricingSettings,
	eth: EthSettings,
	hive_rpc: Arc<HiveRpc>,
	cache: RwLock<Option<Snapshot>>,
	refreshing: std::sync::atomic::AtomicBool,
	/// Handle to ourselves for spawning background refreshes off the
	/// read path.
	weak_self: Weak<PricingOracle>,
}

#[derive(Debug, Default)]
struct FetchedInputs {
	/// Spot prices by coin; missing entries degrade to configured values.
	prices: BTreeMap<String, f64>,
	hive_price: Option<f64>,
	eth_fee: Option<f64>,
	degraded: bool,
}

impl PricingOracle {
	pub fn new(
		db: Database,
		settings: PricingSettings,
		eth: EthSettings,
		hive_rpc: Arc<HiveRpc>,
	) -> Result<Arc<Self>> {
		let client = reqwest::Client::builder().timeout(crate::constants::HTTP_TIMEOUT).build()
			.map_err(crate::errors::Error::from)?;
		let oracle = Arc::new_cyclic(|weak_self| PricingOracle {
			db,
			client,
			settings,
			eth,
			hive_rpc,
			cache: RwLock::new(None),
			refreshing: std::sync::atomic::AtomicBool::new(false),
			weak_self: weak_self.clone(),
		});
		// Warm the cache from the last persisted snapshot so a restart
		// does not block quoting on external APIs.
		if let Ok(Some((_, payload))) = oracle.db.latest_pricing_snapshot() {
			if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&payload) {
				*oracle.cache.write() = Some(snapshot);
			}
		}
		Ok(oracle)
	}

	/// The current snapshot. Stale data is returned as-is; a background
	/// refresh is kicked off when it has grown older than two hours.
	pub fn latest(&self) -> Option<Snapshot> {
		let snapshot = self.cache.read().clone();
		if let Some(snapshot) = &snapshot {
			let age = now_unix() - snapshot.generated_at;
			if age > PRICING_STALE_AFTER.as_secs() as i64 {
				if let Some(oracle) = self.weak_self.upgrade() {
					tokio::spawn(async move {
						oracle.refresh().await;
					});
				}
			}
		}
		snapshot
	}

	/// A snapshot under all circumstances: cache, then a synthetic one
	/// built purely from configured fallbacks.
	pub fn latest_or_fallback(&self) -> Snapshot {
		self.latest().unwrap_or_else(|| {
			build_snapshot(&self.settings, &FetchedInputs { degraded: true, ..Default::default() })
		})
	}

	/// Fetch fresh inputs and publish a new snapshot. Never fails; every
	/// external error degrades to the previous or configured value.
	pub async fn refresh(&self) {
		use std::sync::atomic::Ordering;
		if self.refreshing.swap(true, Ordering::SeqCst) {
			return;
		}
		let inputs = self.fetch_inputs().await;
		let snapshot = build_snapshot(&self.settings, &inputs);
		if snapshot.fallback {
			warn!("Pricing snapshot degraded (one or more sources failed)");
		} else {
			info!(
				"Pricing refreshed: HIVE ${:.4}, account ${:.4}",
				snapshot.hive_price_usd, snapshot.final_cost_usd
			);
		}
		if let Ok(payload) = serde_json::to_string(&snapshot) {
			let _ = self.db.insert_pricing_snapshot(snapshot.generated_at, &payload);
			let _ = self
				.db
				.purge_pricing_snapshots(now_unix() - PRICING_RETENTION.as_secs() as i64);
		}
		*self.cache.write() = Some(snapshot);
		self.refreshing.store(false, Ordering::SeqCst);
	}

	async fn fetch_inputs(&self) -> FetchedInputs {
		let mut inputs = FetchedInputs::default();

		match self.coingecko_prices().await {
			Ok(prices) => {
				inputs.hive_price = prices.get("hive").copied();
				for coin in Coin::ALL {
					if let Some(price) = prices.get(coin.get_info().coingecko_id) {
						inputs.prices.insert(coin.get_info().symbol.to_string(), *price);
					} else {
						inputs.degraded = true;
					}
				}
			},
			Err(err) => {
				warn!("CoinGecko unavailable: {:#}", err);
				inputs.degraded = true;
			},
		}

		if inputs.hive_price.is_none() {
			match self.hive_rpc.median_history_price().await {
				Ok(price) => inputs.hive_price = Some(price),
				Err(err) => {
					warn!("Hive median price unavailable: {:#}", err);
					inputs.degraded = true;
				},
			}
		}

		match self.eth_transfer_fee().await {
			Ok(fee) => inputs.eth_fee = Some(fee),
			Err(err) => {
				warn!("Gas price endpoints unavailable: {:#}", err);
				inputs.degraded = true;
			},
		}

		inputs
	}

	async fn coingecko_prices(&self) -> anyhow::Result<BTreeMap<String, f64>> {
		let ids = Coin::ALL
			.iter()
			.map(|c| c.get_info().coingecko_id)
			.chain(std::iter::once("hive"))
			.collect::<Vec<_>>()
			.join(",");
		let response: BTreeMap<String, BTreeMap<String, f64>> = self
			.client
			.get(&self.settings.coingecko_url)
			.query(&[("ids", ids.as_str()), ("vs_currencies", "usd")])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(response
			.into_iter()
			.filter_map(|(id, prices)| prices.get("usd").map(|price| (id, *price)))
			.collect())
	}

	/// Two gas endpoints in order, then the configured constant. Returns
	/// the fee in ETH for a plain transfer.
	async fn eth_transfer_fee(&self) -> anyhow::Result<f64> {
		let gwei = match self.gas_price_etherscan().await {
			Ok(gwei) => gwei,
			Err(primary_err) => match self.gas_price_station().await {
				Ok(gwei) => gwei,
				Err(secondary_err) => {
					warn!(
						"Both gas oracles failed ({:#}; {:#}), using configured {} gwei",
						primary_err, secondary_err, self.eth.fallback_gas_price_gwei
					);
					self.eth.fallback_gas_price_gwei
				},
			},
		};
		Ok(gwei * 1e-9 * ETH_TRANSFER_GAS)
	}

	async fn gas_price_etherscan(&self) -> anyhow::Result<f64> {
		#[derive(Deserialize)]
		struct GasOracle {
			#[serde(rename = "ProposeGasPrice")]
			propose_gas_price: String,
		}
		#[derive(Deserialize)]
		struct GasResponse {
			result: GasOracle,
		}
		let response: GasResponse = self
			.client
			.get(&self.eth.gas_price_url_primary)
			.query(&[("apikey", self.eth.api_key.as_str())])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(response.result.propose_gas_price.parse()?)
	}

	async fn gas_price_station(&self) -> anyhow::Result<f64> {
		#[derive(Deserialize)]
		struct StationResponse {
			// Deci-gwei, per the historical API.
			average: f64,
		}
		let response: StationResponse = self
			.client
			.get(&self.eth.gas_price_url_secondary)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(response.average / 10.0)
	}
}

/// Pure quote computation over whatever inputs survived fetching.
fn build_snapshot(settings: &PricingSettings, inputs: &FetchedInputs) -> Snapshot {
	let mut fallback = inputs.degraded;

	let hive_price = inputs.hive_price.unwrap_or_else(|| {
		fallback = true;
		0.3
	});
	let base_cost_usd = hive_price * 3.0;
	let final_cost_usd = base_cost_usd * BASE_COST_MULTIPLIER;

	let mut crypto_rates = BTreeMap::new();
	let mut transfer_costs = BTreeMap::new();

	for coin in Coin::ALL {
		let info = coin.get_info();
		let configured = settings.for_coin(coin);
		let price = match inputs.prices.get(info.symbol) {
			Some(price) => *price,
			None => {
				fallback = true;
				configured.fallback_price_usd
			},
		};
		let transfer_fee = match coin {
			Coin::Eth => inputs.eth_fee.unwrap_or(configured.avg_transfer_fee),
			_ => configured.avg_transfer_fee,
		};

		let network_fee_usd = transfer_fee * price;
		let surcharge = NETWORK_FEE_SURCHARGE * network_fee_usd;
		let coin_cost_usd = final_cost_usd + surcharge;
		let amount_needed = round_amount(coin_cost_usd / price, info.decimals);
		let total_amount = round_amount(amount_needed + transfer_fee, info.decimals);

		transfer_costs.insert(info.symbol.to_string(), transfer_fee);
		crypto_rates.insert(
			info.symbol.to_string(),
			CryptoRate {
				price_usd: price,
				amount_needed,
				transfer_fee,
				total_amount,
				network_fee_surcharge_usd: surcharge,
				final_cost_usd: coin_cost_usd,
			},
		);
	}

	Snapshot {
		hive_price_usd: hive_price,
		base_cost_usd,
		final_cost_usd,
		crypto_rates,
		transfer_costs,
		fallback,
		generated_at: now_unix(),
	}
}

/// Quotes carry at most eight fractional digits; enough for every network
/// minimum and stable across float formatting.
fn round_amount(amount: f64, decimals: u32) -> f64 {
	let places = decimals.min(8);
	let factor = 10f64.powi(places as i32);
	(amount * factor).round() / factor
}
