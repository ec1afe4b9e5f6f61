//! Public endpoints: pricing, channel lifecycle, manual verification, the
//! payment webhook, health, and the status WebSocket.

use super::{reject, reply_success, with_ctx, Ctx};
use crate::{
	common::{is_valid_channel_id, Coin, PublicKeySet},
	errors::Error,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest {
	username: String,
	crypto_type: String,
	public_keys: PublicKeySet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
	channel_id: String,
	tx_hash: String,
}

/// External processor callbacks carry the same fields but are only a
/// hint; verification still goes to the chain.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest {
	channel_id: Option<String>,
	tx_hash: Option<String>,
}

pub fn endpoints(
	ctx: Ctx,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let pricing = warp::path!("pricing")
		.and(warp::get())
		.and(with_ctx(ctx.clone()))
		.and_then(get_pricing);

	let initiate = warp::path!("payment" / "initiate")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_ctx(ctx.clone()))
		.and_then(initiate_payment);

	let status = warp::path!("payment" / "status" / String)
		.and(warp::get())
		.and(with_ctx(ctx.clone()))
		.and_then(channel_status);

	// Same view under the channel-centric path.
	let channel_status_alias = warp::path!("channel" / String / "status")
		.and(warp::get())
		.and(with_ctx(ctx.clone()))
		.and_then(channel_status);

	let verify = warp::path!("payment" / "verify-transaction")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_ctx(ctx.clone()))
		.and_then(verify_transaction);

	let webhook = warp::path!("webhook" / "payment")
		.and(warp::post())
		.and(warp::body::json())
		.and(with_ctx(ctx.clone()))
		.and_then(payment_webhook);

	let health = warp::path!("health")
		.and(warp::get())
		.and(with_ctx(ctx.clone()))
		.and_then(health);

	let ws = warp::path!("ws" / "status")
		.and(warp::ws())
		.and(with_ctx(ctx))
		.map(|ws: warp::ws::Ws, ctx: Ctx| {
			ws.on_upgrade(move |socket| status_feed(socket, ctx))
		});

	pricing
		.or(initiate)
		.or(status)
		.or(channel_status_alias)
		.or(verify)
		.or(webhook)
		.or(health)
		.or(ws)
}

async fn get_pricing(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let snapshot = ctx.pricing.latest_or_fallback();
	let monitored: Vec<&str> =
		Coin::MONITORED.iter().map(|coin| coin.get_info().symbol).collect();

	// The pricing-only entries (monero, dash) stay internal.
	let crypto_rates: serde_json::Map<String, serde_json::Value> = snapshot
		.crypto_rates
		.iter()
		.filter(|(symbol, _)| monitored.contains(&symbol.as_str()))
		.map(|(symbol, rate)| {
			(symbol.clone(), serde_json::to_value(rate).unwrap_or(serde_json::Value::Null))
		})
		.collect();
	let transfer_costs: serde_json::Map<String, serde_json::Value> = snapshot
		.transfer_costs
		.iter()
		.filter(|(symbol, _)| monitored.contains(&symbol.as_str()))
		.map(|(symbol, fee)| (symbol.clone(), serde_json::json!(fee)))
		.collect();

	Ok(reply_success(&serde_json::json!({
		"hive_price_usd": snapshot.hive_price_usd,
		"base_cost_usd": snapshot.base_cost_usd,
		"final_cost_usd": snapshot.final_cost_usd,
		"crypto_rates": crypto_rates,
		"transfer_costs": transfer_costs,
		"supported_currencies": monitored,
		"fallback": snapshot.fallback,
		"generated_at": snapshot.generated_at,
	})))
}

async fn initiate_payment(request: InitiateRequest, ctx: Ctx) -> Result<impl Reply, Rejection> {
	let coin = Coin::from_str(&request.crypto_type)
		.map_err(|e| reject(Error::InputValidation(e)))?;
	let created = ctx
		.engine
		.create_channel(&request.username, coin, request.public_keys)
		.map_err(reject)?;
	Ok(reply_success(&serde_json::json!({
		"channelId": created.channel_id,
		"username": created.username,
		"cryptoType": created.crypto,
		"address": created.address,
		"amountCrypto": created.amount_crypto,
		"amountUsd": created.amount_usd,
		"expiresAt": created.expires_at,
		"addressReused": created.address_reused,
	})))
}

async fn channel_status(channel_id: String, ctx: Ctx) -> Result<impl Reply, Rejection> {
	if !is_valid_channel_id(&channel_id) {
		return Err(reject(Error::validation("malformed channel id")));
	}
	let view = ctx.engine.status(&channel_id).map_err(reject)?;
	Ok(reply_success(&view))
}

async fn verify_transaction(request: VerifyRequest, ctx: Ctx) -> Result<impl Reply, Rejection> {
	if !is_valid_channel_id(&request.channel_id) {
		return Err(reject(Error::validation("malformed channel id")));
	}
	let matched = ctx
		.monitor
		.verify_transaction(&request.channel_id, &request.tx_hash)
		.await
		.map_err(reject)?;
	Ok(reply_success(&serde_json::json!({ "matched": matched })))
}

/// Webhooks are hints: missing fields are fine, nothing is trusted, and
/// the chain is always re-queried.
async fn payment_webhook(request: WebhookRequest, ctx: Ctx) -> Result<impl Reply, Rejection> {
	let (Some(channel_id), Some(tx_hash)) = (request.channel_id, request.tx_hash) else {
		return Ok(reply_success(&serde_json::json!({ "processed": false })));
	};
	if !is_valid_channel_id(&channel_id) {
		return Ok(reply_success(&serde_json::json!({ "processed": false })));
	}
	let processed = match ctx.monitor.verify_transaction(&channel_id, &tx_hash).await {
		Ok(matched) => matched,
		Err(err) => {
			debug!("Webhook hint for {} did not verify: {}", channel_id, err);
			false
		},
	};
	Ok(reply_success(&serde_json::json!({ "processed": processed })))
}

async fn health(ctx: Ctx) -> Result<impl Reply, Rejection> {
	ctx.db.ping().map_err(reject)?;
	Ok(reply_success(&serde_json::json!({ "status": "ok" })))
}

/// Push every channel status transition to the socket until either side
/// goes away.
async fn status_feed(socket: warp::ws::WebSocket, ctx: Ctx) {
	let (mut sink, mut stream) = socket.split();
	let mut events = ctx.notifier.subscribe();
	loop {
		tokio::select! {
			event = events.recv() => match event {
				Ok(change) => {
					let Ok(text) = serde_json::to_string(&change) else { continue };
					if sink.send(warp::ws::Message::text(text)).await.is_err() {
						break;
					}
				},
				// Lagged receivers drop missed events and continue.
				Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
					debug!("Status feed dropped {} events for a slow socket", missed);
				},
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			},
			message = stream.next() => match message {
				Some(Ok(message)) if message.is_close() => break,
				Some(Ok(_)) => {},
				_ => break,
			},
		}
	}
}
