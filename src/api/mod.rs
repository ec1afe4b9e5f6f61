//! The warp HTTP surface: public payment endpoints, the admin set behind
//! Hive-challenge auth, the status WebSocket, and structured rejections.

pub mod admin;
pub mod auth;
pub mod v1;

use crate::{
	channels::ChannelEngine,
	consolidation::ConsolidationExecutor,
	errors::Error,
	hive::{creator::AccountCreator, rpc::HiveRpc},
	notifications::Notifier,
	pricing::{rc::RcOracle, PricingOracle},
	store::Database,
	witness::DepositMonitor,
};
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::sync::oneshot;
use tracing::info;
use warp::{Filter, Rejection, Reply};

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppContext {
	pub db: Database,
	pub engine: ChannelEngine,
	pub monitor: DepositMonitor,
	pub creator: AccountCreator,
	pub pricing: Arc<PricingOracle>,
	pub rc_oracle: Arc<RcOracle>,
	pub consolidation: ConsolidationExecutor,
	pub notifier: Notifier,
	pub hive_rpc: Arc<HiveRpc>,
	pub admin_accounts: Vec<String>,
}

pub type Ctx = Arc<AppContext>;

pub fn with_ctx(ctx: Ctx) -> impl Filter<Extract = (Ctx,), Error = Infallible> + Clone {
	warp::any().map(move || ctx.clone())
}

/// Wrap a payload in the `{success: true, ...}` envelope.
pub fn reply_success<T: Serialize>(payload: &T) -> warp::reply::Json {
	let mut value = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
	if let Some(object) = value.as_object_mut() {
		object.insert("success".to_string(), serde_json::Value::Bool(true));
		warp::reply::json(&value)
	} else {
		warp::reply::json(&serde_json::json!({ "success": true, "data": value }))
	}
}

pub fn reject(err: Error) -> Rejection {
	warp::reject::custom(err)
}

/// Structured `{success: false, error, details?}` bodies for every
/// failure path.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
	let (status, error) = if let Some(err) = rejection.find::<Error>() {
		(err.status_code(), err.to_string())
	} else if rejection.is_not_found() {
		(404, "route not found".to_string())
	} else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
		(400, format!("invalid request body: {}", err))
	} else if rejection.find::<warp::reject::MissingHeader>().is_some() {
		(401, "missing authentication headers".to_string())
	} else {
		(500, "internal error".to_string())
	};

	let body = warp::reply::json(&serde_json::json!({
		"success": false,
		"error": error,
	}));
	Ok(warp::reply::with_status(
		body,
		warp::http::StatusCode::from_u16(status).unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
	))
}

/// Serve the API until the shutdown signal fires.
pub async fn serve(
	ctx: Ctx,
	bind: SocketAddr,
	cors_origins: Vec<String>,
	shutdown: oneshot::Receiver<()>,
) {
	let cors = warp::cors()
		.allow_origins(cors_origins.iter().map(String::as_str))
		.allow_headers(["content-type", "account", "challenge", "pubkey", "signature"])
		.allow_methods(["GET", "POST", "DELETE", "OPTIONS"]);

	let routes = v1::endpoints(ctx.clone())
		.or(admin::endpoints(ctx))
		.recover(handle_rejection)
		.with(cors);

	info!("API listening on {}", bind);
	let (_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(bind, async {
		shutdown.await.ok();
	});
	server.await;
}
