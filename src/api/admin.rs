//! Admin endpoints. Every route demands a valid Hive-signed challenge in
//! the `account`/`challenge`/`pubkey`/`signature` headers.

use super::{auth, auth::AdminChallenge, reject, reply_success, with_ctx, Ctx};
use crate::{
	common::{is_valid_channel_id, now_unix, Coin},
	consolidation::SweepPriority,
	errors::Error,
};
use serde::Deserialize;
use std::str::FromStr;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsolidationRequest {
	crypto: String,
	destination_address: String,
	#[serde(default = "default_priority")]
	priority: String,
}

fn default_priority() -> String {
	"medium".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManualCreateRequest {
	channel_id: String,
}

/// Extract and fully verify the challenge headers.
fn admin_auth(ctx: Ctx) -> impl Filter<Extract = (), Error = Rejection> + Clone {
	warp::header::<String>("account")
		.and(warp::header::<String>("challenge"))
		.and(warp::header::<String>("pubkey"))
		.and(warp::header::<String>("signature"))
		.and(with_ctx(ctx))
		.and_then(
			|account, challenge, pubkey, signature, ctx: Ctx| async move {
				let challenge =
					AdminChallenge { account, challenge, pubkey, signature };
				auth::verify_admin(&ctx.hive_rpc, &ctx.admin_accounts, &challenge, now_unix())
					.await
					.map_err(reject)?;
				Ok::<(), Rejection>(())
			},
		)
		.untuple_one()
}

pub fn endpoints(
	ctx: Ctx,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let act_status = warp::path!("admin" / "act-status")
		.and(warp::get())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(act_status);

	let claim_act = warp::path!("admin" / "claim-act")
		.and(warp::post())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(claim_act);

	let process_pending = warp::path!("admin" / "process-pending")
		.and(warp::post())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(process_pending);

	let health_check = warp::path!("admin" / "health-check")
		.and(warp::post())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(health_check);

	let rc_costs = warp::path!("admin" / "rc-costs")
		.and(warp::get())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(rc_costs);

	let list_channels = warp::path!("admin" / "channels")
		.and(warp::get())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(list_channels);

	let delete_channel = warp::path!("admin" / "channels" / String)
		.and(warp::delete())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(delete_channel);

	let consolidation_info = warp::path!("admin" / "consolidation-info" / String)
		.and(warp::get())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(consolidation_info);

	let prepare_consolidation = warp::path!("admin" / "prepare-consolidation")
		.and(warp::post())
		.and(warp::body::json())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(prepare_consolidation);

	let execute_consolidation = warp::path!("admin" / "execute-consolidation")
		.and(warp::post())
		.and(warp::body::json())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx.clone()))
		.and_then(execute_consolidation);

	let manual_create = warp::path!("admin" / "manual-create-account")
		.and(warp::post())
		.and(warp::body::json())
		.and(admin_auth(ctx.clone()))
		.and(with_ctx(ctx))
		.and_then(manual_create_account);

	act_status
		.or(claim_act)
		.or(process_pending)
		.or(health_check)
		.or(rc_costs)
		.or(list_channels)
		.or(delete_channel)
		.or(consolidation_info)
		.or(prepare_consolidation)
		.or(execute_consolidation)
		.or(manual_create)
}

async fn act_status(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let inventory = ctx.creator.sync_inventory().await.map_err(Error::from).map_err(reject)?;
	Ok(reply_success(&serde_json::json!({
		"creator": inventory.creator,
		"actBalance": inventory.act_balance,
		"resourceCredits": inventory.resource_credits,
		"lastClaimTime": inventory.last_claim_time,
		"lastRcCheck": inventory.last_rc_check,
	})))
}

async fn claim_act(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let claimed = ctx.creator.claim_acts(true).await.map_err(Error::from).map_err(reject)?;
	Ok(reply_success(&serde_json::json!({ "claimed": claimed })))
}

async fn process_pending(ctx: Ctx) -> Result<impl Reply, Rejection> {
	ctx.creator.process_confirmed_channels().await;
	Ok(reply_success(&serde_json::json!({ "processed": true })))
}

async fn health_check(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let report = ctx.creator.health_check().await.map_err(Error::from).map_err(reject)?;
	Ok(reply_success(&report))
}

async fn rc_costs(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let costs: serde_json::Map<String, serde_json::Value> = ctx
		.rc_oracle
		.latest_costs()
		.into_iter()
		.map(|(operation, cost)| {
			(
				operation,
				serde_json::json!({
					"rcNeeded": cost.rc_needed,
					"hpNeeded": cost.hp_needed,
					"apiTimestamp": cost.api_timestamp,
				}),
			)
		})
		.collect();
	Ok(reply_success(&serde_json::json!({ "costs": costs })))
}

async fn list_channels(ctx: Ctx) -> Result<impl Reply, Rejection> {
	let channels = ctx.db.all_channels(200).map_err(reject)?;
	let views: Vec<serde_json::Value> = channels
		.into_iter()
		.map(|channel| {
			serde_json::json!({
				"channelId": channel.channel_id,
				"username": channel.username,
				"cryptoType": channel.coin.to_string(),
				"depositAddress": channel.deposit_address,
				"amountCrypto": channel.amount_crypto,
				"amountUsd": channel.amount_usd,
				"status": channel.status,
				"confirmations": channel.confirmations,
				"txHash": channel.tx_hash,
				"createdAt": channel.created_at,
				"expiresAt": channel.expires_at,
			})
		})
		.collect();
	Ok(reply_success(&serde_json::json!({ "channels": views })))
}

async fn delete_channel(channel_id: String, ctx: Ctx) -> Result<impl Reply, Rejection> {
	if !is_valid_channel_id(&channel_id) {
		return Err(reject(Error::validation("malformed channel id")));
	}
	ctx.engine.cancel(&channel_id).map_err(reject)?;
	Ok(reply_success(&serde_json::json!({ "deleted": channel_id })))
}

async fn consolidation_info(crypto: String, ctx: Ctx) -> Result<impl Reply, Rejection> {
	let coin = parse_monitored_coin(&crypto)?;
	let sources = ctx.consolidation.funded_sources(coin).await.map_err(reject)?;
	let total: f64 = sources.iter().map(|s| s.balance).sum();
	let count = sources.len();
	Ok(reply_success(&serde_json::json!({
		"crypto": coin.to_string(),
		"sources": sources,
		"sourceCount": count,
		"totalBalance": total,
	})))
}

async fn prepare_consolidation(
	request: ConsolidationRequest,
	ctx: Ctx,
) -> Result<impl Reply, Rejection> {
	let (coin, priority) = parse_consolidation_request(&request)?;
	let plan = ctx
		.consolidation
		.prepare(coin, &request.destination_address, priority)
		.await
		.map_err(reject)?;
	Ok(reply_success(&plan))
}

async fn execute_consolidation(
	request: ConsolidationRequest,
	ctx: Ctx,
) -> Result<impl Reply, Rejection> {
	let (coin, priority) = parse_consolidation_request(&request)?;
	let outcome = ctx
		.consolidation
		.execute(coin, &request.destination_address, priority)
		.await
		.map_err(reject)?;
	Ok(reply_success(&outcome))
}

async fn manual_create_account(
	request: ManualCreateRequest,
	ctx: Ctx,
) -> Result<impl Reply, Rejection> {
	if !is_valid_channel_id(&request.channel_id) {
		return Err(reject(Error::validation("malformed channel id")));
	}
	let channel = ctx
		.db
		.get_channel(&request.channel_id)
		.map_err(reject)?
		.ok_or_else(|| reject(Error::NotFound(format!("channel {}", request.channel_id))))?;
	ctx.creator.create_for_channel(&channel).await.map_err(reject)?;
	Ok(reply_success(&serde_json::json!({ "channelId": channel.channel_id })))
}

fn parse_monitored_coin(value: &str) -> Result<Coin, Rejection> {
	let coin = Coin::from_str(value).map_err(|e| reject(Error::InputValidation(e)))?;
	if !coin.get_info().monitoring_enabled {
		return Err(reject(Error::validation(format!("{} is not monitoring-enabled", coin))));
	}
	Ok(coin)
}

fn parse_consolidation_request(
	request: &ConsolidationRequest,
) -> Result<(Coin, SweepPriority), Rejection> {
	let coin = parse_monitored_coin(&request.crypto)?;
	let priority = SweepPriority::from_str(&request.priority).map_err(reject)?;
	Ok((coin, priority))
}
