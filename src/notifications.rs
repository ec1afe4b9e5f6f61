//! The notification bus. Rows in the store are authoritative; the
//! broadcast channel feeding WebSocket subscribers is best-effort and
//! drops events past slow receivers.

use crate::{
	common::{now_unix, ChannelStatus},
	constants::EVENT_BUFFER_SIZE,
	errors::Result,
	store::{Database, NotificationRecord},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Priority {
	Low,
	Normal,
	High,
}

impl Priority {
	pub fn as_str(&self) -> &'static str {
		match self {
			Priority::Low => "low",
			Priority::Normal => "normal",
			Priority::High => "high",
		}
	}
}

/// What goes out over the WebSocket on every channel transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
	pub channel_id: String,
	pub status: ChannelStatus,
	pub tx_hash: Option<String>,
}

#[derive(Clone)]
pub struct Notifier {
	db: Database,
	sender: broadcast::Sender<StatusChange>,
}

impl Notifier {
	pub fn new(db: Database) -> Self {
		let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
		Notifier { db, sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
		self.sender.subscribe()
	}

	/// Persist a user-facing notification row.
	pub fn notify(
		&self,
		username: &str,
		notification_type: &str,
		title: &str,
		message: &str,
		data: Option<serde_json::Value>,
		priority: Priority,
		ttl: Option<Duration>,
	) -> Result<i64> {
		let now = now_unix();
		self.db.insert_notification(&NotificationRecord {
			id: 0,
			username: username.to_string(),
			notification_type: notification_type.to_string(),
			title: title.to_string(),
			message: message.to_string(),
			data: data.map(|d| d.to_string()),
			priority: priority.as_str().to_string(),
			created_at: now,
			expires_at: ttl.map(|ttl| now + ttl.as_secs() as i64),
		})
	}

	/// Fan a status transition out to WebSocket subscribers. No receivers
	/// is fine; persistence already happened.
	pub fn publish_status(&self, channel_id: &str, status: ChannelStatus, tx_hash: Option<&str>) {
		let event = StatusChange {
			channel_id: channel_id.to_string(),
			status,
			tx_hash: tx_hash.map(String::from),
		};
		match self.sender.send(event) {
			Ok(receivers) => debug!("Status change delivered to {} subscribers", receivers),
			Err(_) => debug!("No status-change subscribers connected"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_see_status_changes() {
		let notifier = Notifier::new(Database::open_in_memory().unwrap());
		let mut receiver = notifier.subscribe();
		notifier.publish_status("abc123", ChannelStatus::Confirmed, Some("deadbeef"));
		let event = receiver.recv().await.unwrap();
		assert_eq!(event.channel_id, "abc123");
		assert_eq!(event.status, ChannelStatus::Confirmed);
		assert_eq!(event.tx_hash.as_deref(), Some("deadbeef"));
	}

	#[test]
	fn notifications_persist() {
		let db = Database::open_in_memory().unwrap();
		let notifier = Notifier::new(db.clone());
		notifier
			.notify(
				"alice",
				"account_created",
				"Account created",
				"Your Hive account is ready",
				Some(serde_json::json!({ "channel_id": "abc" })),
				Priority::High,
				Some(Duration::from_secs(3600)),
			)
			.unwrap();
		let rows = db.notifications_for_user("alice", 10).unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].priority, "high");
		assert_eq!(rows[0].notification_type, "account_created");
		assert!(rows[0].expires_at.unwrap() > rows[0].created_at);
	}

	#[test]
	fn publishing_without_subscribers_is_harmless() {
		let notifier = Notifier::new(Database::open_in_memory().unwrap());
		notifier.publish_status("abc123", ChannelStatus::Confirming, None);
	}
}
