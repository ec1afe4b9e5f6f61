//! The account-creation orchestrator: keeps the ACT inventory stocked
//! against the live RC budget, creates accounts for confirmed channels,
//! and reconciles usernames that were minted externally.

use super::HiveApi;
use crate::{
	common::{now_unix, ChannelStatus},
	constants::{
		ACT_TARGET_BALANCE, ADDRESS_REUSE_COOLDOWN, CLAIM_RC_FLOOR, CLAIM_RC_MULTIPLIER,
		CLAIM_RC_RESERVE, CLAIM_SPACING, HEALTH_ATTENTION_DAYS, HEALTH_HEALTHY_DAYS,
		HIVE_CREATION_FEE, MAX_CLAIMS_PER_RUN,
	},
	errors::Result,
	notifications::{Notifier, Priority},
	pricing::rc::{RcOracle, CLAIM_ACCOUNT_OPERATION},
	store::{ActBalance, AttemptStatus, CreationMethod, Database, PaymentChannel},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryState {
	Healthy,
	NeedsAttention,
	Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
	pub act_balance: u32,
	pub resource_credits: i64,
	pub claim_cost: i64,
	pub claims_remaining: u64,
	pub days_sustainable: f64,
	pub state: InventoryState,
}

pub struct AccountCreator {
	db: Database,
	hive: Arc<dyn HiveApi>,
	rc_oracle: Arc<RcOracle>,
	notifier: Notifier,
	creator_account: String,
}

impl AccountCreator {
	pub fn new(
		db: Database,
		hive: Arc<dyn HiveApi>,
		rc_oracle: Arc<RcOracle>,
		notifier: Notifier,
		creator_account: String,
	) -> Self {
		AccountCreator { db, hive, rc_oracle, notifier, creator_account }
	}

	/// Current RC price of one claim; the hard-coded floor applies only
	/// when the oracle has never produced a value.
	fn claim_cost(&self) -> i64 {
		self.rc_oracle
			.cost_of(CLAIM_ACCOUNT_OPERATION)
			.map(|cost| cost.rc_needed)
			.unwrap_or(CLAIM_RC_FLOOR as i64)
	}

	/// Pull the creator's chain state and mirror it into the store. The
	/// chain is authoritative; the row is a cache for fast decisions.
	pub async fn sync_inventory(&self) -> anyhow::Result<ActBalance> {
		let state = self.hive.creator_state().await?;
		let previous = self.db.get_act_balance(&self.creator_account)?;
		let balance = ActBalance {
			creator: self.creator_account.clone(),
			act_balance: state.pending_claimed_accounts,
			resource_credits: state.rc_current_mana,
			last_claim_time: previous.and_then(|p| p.last_claim_time),
			last_rc_check: Some(now_unix()),
		};
		self.db.upsert_act_balance(&balance)?;
		Ok(balance)
	}

	/// Proactive claim run. Claims until the target balance is met, RC
	/// runs low, or the per-run cap is hit; RC is re-read between claims.
	pub async fn claim_acts(&self, aggressive: bool) -> anyhow::Result<u32> {
		let claim_cost = self.claim_cost();
		let mut inventory = self.sync_inventory().await?;

		if inventory.act_balance >= ACT_TARGET_BALANCE {
			return Ok(0);
		}
		let trigger = claim_cost * CLAIM_RC_MULTIPLIER as i64;
		if !aggressive && inventory.resource_credits < trigger {
			info!(
				"RC {} below claim trigger {}, skipping proactive claims",
				inventory.resource_credits, trigger
			);
			return Ok(0);
		}

		let reserve = claim_cost * CLAIM_RC_RESERVE as i64;
		let affordable = ((inventory.resource_credits - reserve) / claim_cost).max(0) as u32;
		let wanted = ACT_TARGET_BALANCE - inventory.act_balance;
		let max_claims = affordable.min(wanted).min(MAX_CLAIMS_PER_RUN);

		let mut claimed = 0;
		for _ in 0..max_claims {
			if inventory.resource_credits - reserve < claim_cost {
				warn!("RC exhausted mid-run after {} claims", claimed);
				break;
			}
			match self.hive.broadcast_claim_account().await {
				Ok(tx_id) => {
					claimed += 1;
					info!("Claimed ACT ({}), {} this run", tx_id, claimed);
					self.db.upsert_act_balance(&ActBalance {
						last_claim_time: Some(now_unix()),
						act_balance: inventory.act_balance + 1,
						..inventory.clone()
					})?;
				},
				Err(err) => {
					warn!("ACT claim rejected: {:#}", err);
					break;
				},
			}
			tokio::time::sleep(CLAIM_SPACING).await;
			inventory = self.sync_inventory().await?;
		}
		Ok(claimed)
	}

	/// Backstop pass over every confirmed channel. The wake-on-confirm
	/// path calls `create_for_channel` directly; this catches lost wakes.
	pub async fn process_confirmed_channels(&self) {
		let channels = match self.db.channels_with_status(ChannelStatus::Confirmed) {
			Ok(channels) => channels,
			Err(err) => {
				error!("Could not list confirmed channels: {}", err);
				return;
			},
		};
		for channel in channels {
			if let Err(err) = self.create_for_channel(&channel).await {
				warn!(
					"Account creation for channel {} failed: {}; will retry",
					channel.channel_id, err
				);
			}
		}
	}

	/// Create the Hive account for one confirmed channel, preferring an
	/// ACT over the 3 HIVE fee. Exactly one attempt row per attempt.
	pub async fn create_for_channel(&self, channel: &PaymentChannel) -> Result<()> {
		if self
			.hive
			.account_exists(&channel.username)
			.await
			.map_err(crate::errors::Error::from)?
		{
			return self.complete_externally_created(channel).await;
		}

		let inventory =
			self.sync_inventory().await.map_err(crate::errors::Error::from)?;
		let method = self.choose_method(&inventory).await;

		let fee = match method {
			CreationMethod::Act => 0.0,
			CreationMethod::Delegation => HIVE_CREATION_FEE,
		};
		let attempt_id =
			self.db.create_attempt(&channel.channel_id, method, fee, now_unix())?;

		let broadcast = match method {
			CreationMethod::Act =>
				self.hive
					.broadcast_create_claimed_account(&channel.username, &channel.public_keys)
					.await,
			CreationMethod::Delegation =>
				self.hive
					.broadcast_account_create(&channel.username, &channel.public_keys)
					.await,
		};

		match broadcast {
			Ok(tx_id) => {
				self.db.finish_attempt(attempt_id, AttemptStatus::Success, Some(&tx_id), None)?;
				self.finish_channel(channel, now_unix())?;
				info!(
					"Created @{} for channel {} via {} ({})",
					channel.username,
					channel.channel_id,
					method.as_str(),
					tx_id
				);
				let _ = self.notifier.notify(
					&channel.username,
					"account_created",
					"Hive account created",
					&format!("Your Hive account @{} is ready to use", channel.username),
					Some(serde_json::json!({
						"channel_id": channel.channel_id,
						"tx_id": tx_id,
						"method": method.as_str(),
					})),
					Priority::High,
					None,
				);
				Ok(())
			},
			Err(err) => {
				let message = format!("{:#}", err);
				self.db.finish_attempt(
					attempt_id,
					AttemptStatus::Failed,
					None,
					Some(&message),
				)?;
				// The channel stays confirmed; the backstop loop retries.
				Err(crate::errors::Error::ExternalUnavailable(message))
			},
		}
	}

	/// ACT when stocked; otherwise one opportunistic claim when RC covers
	/// it; the delegation fee as the last resort.
	async fn choose_method(&self, inventory: &ActBalance) -> CreationMethod {
		if inventory.act_balance > 0 {
			return CreationMethod::Act;
		}
		if inventory.resource_credits >= self.claim_cost() {
			match self.hive.broadcast_claim_account().await {
				Ok(_) => match self.sync_inventory().await {
					Ok(refreshed) if refreshed.act_balance > 0 => return CreationMethod::Act,
					Ok(_) => {},
					Err(err) => warn!("Inventory re-sync after claim failed: {:#}", err),
				},
				Err(err) => warn!("Opportunistic claim failed: {:#}", err),
			}
		}
		CreationMethod::Delegation
	}

	fn finish_channel(&self, channel: &PaymentChannel, completed_at: i64) -> Result<()> {
		self.db.advance_channel_status(&channel.channel_id, ChannelStatus::Completed, completed_at)?;
		self.db.quarantine_channel_address(
			&channel.channel_id,
			now_unix() + ADDRESS_REUSE_COOLDOWN.as_secs() as i64,
		)?;
		self.notifier.publish_status(
			&channel.channel_id,
			ChannelStatus::Completed,
			channel.tx_hash.as_deref(),
		);
		Ok(())
	}

	async fn complete_externally_created(&self, channel: &PaymentChannel) -> Result<()> {
		let created_at = self
			.hive
			.account_created_at(&channel.username)
			.await
			.map_err(crate::errors::Error::from)?
			.unwrap_or_else(now_unix);
		if self.db.advance_channel_status(
			&channel.channel_id,
			ChannelStatus::Completed,
			created_at,
		)? {
			info!(
				"Channel {} reconciled: @{} already exists on chain",
				channel.channel_id, channel.username
			);
			self.db.quarantine_channel_address(
				&channel.channel_id,
				now_unix() + ADDRESS_REUSE_COOLDOWN.as_secs() as i64,
			)?;
			self.notifier.publish_status(
				&channel.channel_id,
				ChannelStatus::Completed,
				channel.tx_hash.as_deref(),
			);
		}
		Ok(())
	}

	/// Every 30 s: any watched username that now exists on chain closes
	/// its channel, whatever step it was at.
	pub async fn reconcile_external(&self) {
		let channels = match self.db.non_completed_channels() {
			Ok(channels) => channels,
			Err(err) => {
				error!("Could not list channels for reconciliation: {}", err);
				return;
			},
		};
		for channel in channels {
			match self.hive.account_exists(&channel.username).await {
				Ok(true) => {
					if let Err(err) = self.complete_externally_created(&channel).await {
						warn!("Reconciliation of {} failed: {}", channel.channel_id, err);
					}
				},
				Ok(false) => {},
				Err(err) => {
					warn!("Existence check for @{} failed: {:#}", channel.username, err);
					// Stop the pass; the node is likely down for all names.
					break;
				},
			}
		}
	}

	/// Daily inventory health report; a worrying one triggers an
	/// aggressive claim run.
	pub async fn health_check(&self) -> anyhow::Result<HealthReport> {
		let inventory = self.sync_inventory().await?;
		let claim_cost = self.claim_cost();
		let claims_remaining = (inventory.resource_credits / claim_cost).max(0) as u64;
		let days_sustainable = claims_remaining as f64 / 5.0;
		let state = if days_sustainable >= HEALTH_HEALTHY_DAYS {
			InventoryState::Healthy
		} else if days_sustainable >= HEALTH_ATTENTION_DAYS {
			InventoryState::NeedsAttention
		} else {
			InventoryState::Critical
		};

		let report = HealthReport {
			act_balance: inventory.act_balance,
			resource_credits: inventory.resource_credits,
			claim_cost,
			claims_remaining,
			days_sustainable,
			state,
		};
		info!(
			"ACT inventory health: {:?} ({} claims / {:.1} days left)",
			report.state, report.claims_remaining, report.days_sustainable
		);

		if state == InventoryState::NeedsAttention {
			if let Err(err) = self.claim_acts(true).await {
				warn!("Aggressive claim run failed: {:#}", err);
			}
		}
		Ok(report)
	}
}
