//! Entry point for the onramp daemon. Wiring only; the logic lives in the
//! library so integration tests can drive it directly.

use clap::Parser;
use hive_onramp::{
	api::{self, AppContext},
	chains::build_clients,
	channels::ChannelEngine,
	common::Coin,
	consolidation::ConsolidationExecutor,
	constants::{
		CHANNEL_SWEEP_INTERVAL, CLAIM_LOOP_INTERVAL, CREATOR_INTERVAL, HEALTH_CHECK_INTERVAL,
		PRICING_REFRESH_INTERVAL, RC_REFRESH_INTERVAL, RECONCILE_INTERVAL,
	},
	hive::{
		creator::AccountCreator,
		rpc::{HiveBroadcaster, HiveRpc},
		HiveApi,
	},
	logging,
	notifications::Notifier,
	pricing::{rc::RcOracle, PricingOracle},
	settings::{CommandLineOptions, Settings},
	store::Database,
	vault::AddressVault,
	witness::DepositMonitor,
};
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::{sync::Notify, time};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	logging::init();

	let settings = match Settings::load(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {}", error);
			std::process::exit(1);
		},
	};

	info!("Starting the Hive onramp daemon");

	let db = Database::open(Path::new(&settings.database.file))?;
	let vault = AddressVault::new(
		db.clone(),
		&settings.vault.master_seed,
		&settings.vault.encryption_key,
	)?;
	let hive_rpc = Arc::new(HiveRpc::new(settings.hive.node_list())?);
	let broadcaster: Arc<dyn HiveApi> = Arc::new(HiveBroadcaster::new(&settings.hive)?);
	let notifier = Notifier::new(db.clone());
	let pricing = PricingOracle::new(
		db.clone(),
		settings.pricing.clone(),
		settings.chains.eth.clone(),
		hive_rpc.clone(),
	)?;
	let rc_oracle = Arc::new(RcOracle::new(db.clone(), settings.rc.beacon_url.clone())?);
	let clients = build_clients(&settings)?;
	let creator_wake = Arc::new(Notify::new());

	let ctx = Arc::new(AppContext {
		db: db.clone(),
		engine: ChannelEngine::new(db.clone(), vault.clone(), pricing.clone(), notifier.clone()),
		monitor: DepositMonitor::new(
			db.clone(),
			clients.clone(),
			notifier.clone(),
			creator_wake.clone(),
		),
		creator: AccountCreator::new(
			db.clone(),
			broadcaster,
			rc_oracle.clone(),
			notifier.clone(),
			settings.hive.creator_account.clone(),
		),
		pricing: pricing.clone(),
		rc_oracle: rc_oracle.clone(),
		consolidation: ConsolidationExecutor::new(
			db,
			vault,
			clients,
			settings.consolidation.clone(),
		),
		notifier,
		hive_rpc,
		admin_accounts: settings.admin.account_list(),
	});

	spawn_workers(ctx.clone(), creator_wake);

	let bind: SocketAddr = format!("{}:{}", settings.api.bind, settings.api.port)
		.parse()
		.map_err(|e| anyhow::anyhow!("bad api bind address: {}", e))?;
	let cors_origins: Vec<String> = settings
		.api
		.cors_origins
		.split(',')
		.map(|origin| origin.trim().to_string())
		.filter(|origin| !origin.is_empty())
		.collect();

	let (shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("Shutdown signal received");
			let _ = shutdown_sender.send(());
		}
	});

	api::serve(ctx, bind, cors_origins, shutdown_receiver).await;
	info!("Bye");
	Ok(())
}

/// Every long-running worker. Each loop wraps its own iteration; a failure
/// in one network or oracle never stops the others.
fn spawn_workers(ctx: Arc<AppContext>, creator_wake: Arc<Notify>) {
	// Oracles refresh immediately, then on their cadence.
	spawn_interval("pricing-oracle", PRICING_REFRESH_INTERVAL, true, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move { ctx.pricing.refresh().await }
		}
	});
	spawn_interval("rc-oracle", RC_REFRESH_INTERVAL, true, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move { ctx.rc_oracle.refresh().await }
		}
	});

	// One poller per monitored network at its block-time cadence.
	for coin in Coin::MONITORED {
		let period = Duration::from_secs(coin.get_info().block_time_secs);
		spawn_interval(coin.get_info().symbol, period, false, {
			let ctx = ctx.clone();
			move || {
				let ctx = ctx.clone();
				async move { ctx.monitor.poll_network(coin).await }
			}
		});
	}

	// Global catch-all sweep plus channel expiry.
	spawn_interval("channel-sweep", CHANNEL_SWEEP_INTERVAL, false, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move {
				ctx.monitor.sweep_all().await;
				if let Err(err) = ctx.engine.expire_due_channels() {
					error!("Expiry sweep failed: {}", err);
				}
			}
		}
	});

	// Account creator: woken on confirm, 30 s backstop either way.
	tokio::spawn({
		let ctx = ctx.clone();
		async move {
			let mut interval = time::interval(CREATOR_INTERVAL);
			interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = interval.tick() => {},
					_ = creator_wake.notified() => {},
				}
				ctx.creator.process_confirmed_channels().await;
			}
		}
	});

	spawn_interval("reconcile", RECONCILE_INTERVAL, false, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move { ctx.creator.reconcile_external().await }
		}
	});

	spawn_interval("act-claims", CLAIM_LOOP_INTERVAL, false, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move {
				if let Err(err) = ctx.creator.claim_acts(false).await {
					error!("Proactive claim run failed: {:#}", err);
				}
			}
		}
	});

	spawn_interval("inventory-health", HEALTH_CHECK_INTERVAL, false, {
		let ctx = ctx.clone();
		move || {
			let ctx = ctx.clone();
			async move {
				if let Err(err) = ctx.creator.health_check().await {
					error!("Inventory health check failed: {:#}", err);
				}
			}
		}
	});
}

/// Spawn a worker that runs `work` every `period`, optionally once at
/// startup, skipping missed ticks instead of bunching them.
fn spawn_interval<F, Fut>(name: &'static str, period: Duration, immediate: bool, work: F)
where
	F: Fn() -> Fut + Send + 'static,
	Fut: std::future::Future<Output = ()> + Send,
{
	tokio::spawn(async move {
		if immediate {
			work().await;
		}
		let mut interval = time::interval(period);
		interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
		// The first tick fires immediately; consume it so the cadence
		// starts one period out.
		interval.tick().await;
		loop {
			interval.tick().await;
			work().await;
			tracing::trace!("{} tick complete", name);
		}
	});
}
