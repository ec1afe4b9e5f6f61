//! The RC-cost oracle: a single external beacon publishing the resource
//! credits each Hive operation currently costs.

use crate::{
	common::now_unix,
	constants::RC_RETENTION,
	store::{Database, RcCost},
};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const CLAIM_ACCOUNT_OPERATION: &str = "claim_account_operation";

#[derive(Debug, Deserialize)]
struct BeaconCost {
	operation: String,
	rc_needed: serde_json::Number,
	#[serde(default)]
	hp_needed: f64,
}

#[derive(Debug, Deserialize)]
struct BeaconResponse {
	timestamp: i64,
	costs: Vec<BeaconCost>,
}

pub struct RcOracle {
	db: Database,
	client: reqwest::Client,
	beacon_url: String,
	cache: RwLock<BTreeMap<String, RcCost>>,
}

impl RcOracle {
	pub fn new(db: Database, beacon_url: String) -> crate::errors::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(crate::constants::HTTP_TIMEOUT)
			.build()
			.map_err(crate::errors::Error::from)?;
		let oracle = RcOracle { db, client, beacon_url, cache: RwLock::new(BTreeMap::new()) };
		oracle.reload_cache();
		Ok(oracle)
	}

	fn reload_cache(&self) {
		if let Ok(rows) = self.db.latest_rc_costs() {
			let mut cache = self.cache.write();
			for row in rows {
				cache.insert(row.operation_type.clone(), row);
			}
		}
	}

	/// Latest known cost per operation. Survives beacon outages from the
	/// cache; empty only before the very first successful refresh.
	pub fn latest_costs(&self) -> BTreeMap<String, RcCost> {
		self.cache.read().clone()
	}

	pub fn cost_of(&self, operation: &str) -> Option<RcCost> {
		self.cache.read().get(operation).cloned()
	}

	/// Poll the beacon and persist what it says. Outages are logged and
	/// the previous cache stands.
	pub async fn refresh(&self) {
		let response = match self.fetch_beacon().await {
			Ok(response) => response,
			Err(err) => {
				warn!("RC beacon unavailable, keeping cached costs: {:#}", err);
				return;
			},
		};

		let mut stored = 0;
		for cost in &response.costs {
			let rc_needed = cost.rc_needed.as_i64().unwrap_or_else(|| {
				// Some beacons serialise RC as a float.
				cost.rc_needed.as_f64().map(|f| f as i64).unwrap_or(0)
			});
			if rc_needed <= 0 {
				continue;
			}
			let row = RcCost {
				operation_type: cost.operation.clone(),
				api_timestamp: response.timestamp,
				rc_needed,
				hp_needed: cost.hp_needed,
			};
			if self.db.insert_rc_cost(&row).is_ok() {
				stored += 1;
			}
			self.cache.write().insert(cost.operation.clone(), row);
		}
		let _ = self.db.purge_rc_costs(now_unix() - RC_RETENTION.as_secs() as i64);
		info!("RC costs refreshed: {} operations at beacon ts {}", stored, response.timestamp);
	}

	async fn fetch_beacon(&self) -> anyhow::Result<BeaconResponse> {
		Ok(self
			.client
			.get(&self.beacon_url)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?)
	}
}
