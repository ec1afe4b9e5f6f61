//! The multi-chain deposit monitor. Per-network pollers watch open
//! channels at each chain's block cadence; a 30-second global sweep
//! catches stragglers and re-scans transaction hashes attached
//! out-of-band. Every path into state - pollers, the manual verify
//! endpoint, the payment webhook - funnels through the same match and
//! credit pipeline.

use crate::{
	chains::ChainClients,
	common::{now_unix, ChainFamily, ChannelStatus, Coin, NormalisedTx},
	constants::AMOUNT_TOLERANCE,
	errors::{Error, Result},
	notifications::{Notifier, Priority},
	store::{Database, PaymentChannel, PaymentConfirmation},
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Why a transaction did not match a channel. Surfaced to the manual
/// verify endpoint; pollers just log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRejection {
	WrongRecipient,
	AmountTooLow,
	Dust,
	MemoMismatch,
	TooEarly,
	AlreadyCredited,
}

impl std::fmt::Display for MatchRejection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let reason = match self {
			MatchRejection::WrongRecipient => "transaction does not pay the deposit address",
			MatchRejection::AmountTooLow => "amount is below the quoted price",
			MatchRejection::Dust => "amount is below the network dust minimum",
			MatchRejection::MemoMismatch => "memo does not match the channel",
			MatchRejection::TooEarly => "transaction predates the channel",
			MatchRejection::AlreadyCredited => "transaction already credited to another channel",
		};
		write!(f, "{}", reason)
	}
}

pub struct DepositMonitor {
	db: Database,
	clients: ChainClients,
	notifier: Notifier,
	creator_wake: Arc<Notify>,
}

/// Stateless part of the match pipeline: everything except the
/// double-credit registry. Returns the credited amount.
pub fn verify_transaction_match(
	channel: &PaymentChannel,
	tx: &NormalisedTx,
	now: i64,
) -> std::result::Result<f64, MatchRejection> {
	let info = channel.coin.get_info();

	let amount = match (info.family, &tx.all_outputs) {
		// On UTXO chains any output to the deposit address satisfies the
		// recipient check; the credited amount is the sum of those outputs.
		(ChainFamily::Utxo, Some(outputs)) => {
			let to_channel: f64 = outputs
				.iter()
				.filter(|output| output.address == channel.deposit_address)
				.map(|output| output.amount)
				.sum();
			if to_channel <= 0.0 {
				return Err(MatchRejection::WrongRecipient);
			}
			to_channel
		},
		_ => {
			if !tx.to.eq_ignore_ascii_case(&channel.deposit_address) {
				return Err(MatchRejection::WrongRecipient);
			}
			tx.amount
		},
	};

	if amount < info.dust_minimum {
		return Err(MatchRejection::Dust);
	}
	// 5% underpayment tolerance; overpayment is always welcome.
	if amount < channel.amount_crypto * AMOUNT_TOLERANCE {
		return Err(MatchRejection::AmountTooLow);
	}

	// Memo equality applies only when both sides carry one.
	if let (Some(expected), Some(actual)) = (&channel.memo, &tx.memo) {
		if expected.trim() != actual.trim() {
			return Err(MatchRejection::MemoMismatch);
		}
	}

	// Mempool transactions have no timestamp yet; they count as "now".
	let effective_timestamp = if tx.timestamp == 0 { now } else { tx.timestamp };
	if effective_timestamp < channel.created_at {
		return Err(MatchRejection::TooEarly);
	}

	Ok(amount)
}

impl DepositMonitor {
	pub fn new(
		db: Database,
		clients: ChainClients,
		notifier: Notifier,
		creator_wake: Arc<Notify>,
	) -> Self {
		DepositMonitor { db, clients, notifier, creator_wake }
	}

	fn client(&self, coin: Coin) -> Result<&Arc<dyn crate::chains::ChainClient>> {
		self.clients
			.get(&coin)
			.ok_or_else(|| Error::validation(format!("{} is not monitoring-enabled", coin)))
	}

	/// The credit pipeline. Idempotent: replaying the same `(channel, tx)`
	/// observation converges on the same state.
	pub fn process_payment_found(&self, channel: &PaymentChannel, tx: &NormalisedTx) -> Result<bool> {
		if channel.status.is_terminal() {
			return Ok(false);
		}

		let now = now_unix();
		let amount = match verify_transaction_match(channel, tx, now) {
			Ok(amount) => amount,
			Err(rejection) => {
				debug!(
					"Transaction {} does not match channel {}: {}",
					tx.hash, channel.channel_id, rejection
				);
				return Ok(false);
			},
		};

		// No double credit: one tx hash pays at most one channel.
		if let Some(holder) = self.db.credited_channel(channel.coin, &tx.hash)? {
			if holder != channel.channel_id {
				debug!(
					"Transaction {} already credited to channel {}, ignoring for {}",
					tx.hash, holder, channel.channel_id
				);
				return Ok(false);
			}
		}

		self.db.upsert_confirmation(&PaymentConfirmation {
			channel_id: channel.channel_id.clone(),
			coin: channel.coin,
			tx_hash: tx.hash.clone(),
			block_height: tx.block_height,
			confirmations: tx.confirmations,
			amount_received: amount,
			detected_at: now,
			processed_at: Some(now),
		})?;
		self.db.record_channel_payment(&channel.channel_id, &tx.hash, tx.confirmations)?;

		let required = channel.coin.get_info().required_confirmations;
		let target = if tx.confirmations >= required {
			ChannelStatus::Confirmed
		} else {
			ChannelStatus::Confirming
		};
		let advanced = self.db.advance_channel_status(&channel.channel_id, target, now)?;

		if advanced {
			info!(
				"Channel {} -> {} ({} of {} confirmations, tx {})",
				channel.channel_id, target, tx.confirmations, required, tx.hash
			);
			let _ = self.notifier.notify(
				&channel.username,
				"payment_update",
				"Payment update",
				target.status_message(),
				Some(serde_json::json!({
					"channel_id": channel.channel_id,
					"tx_hash": tx.hash,
					"confirmations": tx.confirmations,
				})),
				Priority::Normal,
				None,
			);
			self.notifier.publish_status(&channel.channel_id, target, Some(&tx.hash));
		}

		if target == ChannelStatus::Confirmed {
			// The 30 s creator loop is only the backstop.
			self.creator_wake.notify_one();
		}
		Ok(true)
	}

	/// One poll pass over one channel: re-scan an attached tx hash, or
	/// scan the deposit address for new transfers.
	pub async fn poll_channel(&self, channel: &PaymentChannel) -> Result<bool> {
		let client = self.client(channel.coin)?;

		if let Some(tx_hash) = &channel.tx_hash {
			if let Some(tx) =
				client.get_transaction(tx_hash).await.map_err(Error::from)?
			{
				return self.process_payment_found(channel, &tx);
			}
			return Ok(false);
		}

		// "Strictly after" the since timestamp, while a payment in the
		// channel's creation second must match: scan from one before.
		let transactions = client
			.get_address_transactions(&channel.deposit_address, channel.created_at - 1)
			.await
			.map_err(Error::from)?;
		for tx in transactions {
			if self.process_payment_found(channel, &tx)? {
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Manual verify and webhook entry: the hash is re-fetched from the
	/// chain, never trusted from the caller.
	pub async fn verify_transaction(&self, channel_id: &str, tx_hash: &str) -> Result<bool> {
		let channel = self
			.db
			.get_channel(channel_id)?
			.ok_or_else(|| Error::NotFound(format!("channel {}", channel_id)))?;
		if !crate::common::is_valid_tx_hash(channel.coin, tx_hash) {
			return Err(Error::validation("malformed transaction hash"));
		}
		let client = self.client(channel.coin)?;
		let tx = client
			.get_transaction(tx_hash)
			.await
			.map_err(Error::from)?
			.ok_or_else(|| Error::NotFound(format!("transaction {}", tx_hash)))?;
		self.process_payment_found(&channel, &tx)
	}

	/// One tick of the per-network poller.
	pub async fn poll_network(&self, coin: Coin) {
		let channels = match self.db.watched_channels(Some(coin)) {
			Ok(channels) => channels,
			Err(err) => {
				warn!("Could not list {} channels: {}", coin, err);
				return;
			},
		};
		for channel in channels {
			if let Err(err) = self.poll_channel(&channel).await {
				// Transient chain-API failures never advance state and are
				// retried next tick.
				warn!("Polling channel {} failed: {}", channel.channel_id, err);
			}
		}
	}

	/// One tick of the global 30 s sweep across every network.
	pub async fn sweep_all(&self) {
		let channels = match self.db.watched_channels(None) {
			Ok(channels) => channels,
			Err(err) => {
				warn!("Could not list channels for sweep: {}", err);
				return;
			},
		};
		for channel in channels {
			if let Err(err) = self.poll_channel(&channel).await {
				warn!("Sweeping channel {} failed: {}", channel.channel_id, err);
			}
		}
	}
}

#[cfg(test)]
mod tests;
