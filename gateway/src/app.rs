//! Process wiring: config load, telemetry bootstrap, drain/signal/readiness plumbing via `gwcore`,
//! admin server, and the data-plane accept loop. Grounded in the teacher's `app.rs`, which owns the
//! same shape (one function assembling every long-lived component and blocking on `Shutdown::wait`).

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus_client::registry::Registry;
use tracing::info;

use crate::config::ConfigSource;
use crate::gateway::Gateway;
use crate::management::admin::{self, AdminState};
use crate::registry::StaticRegistry;
use crate::reload::Reloader;
use crate::telemetry::metrics::GatewayMetrics;

pub struct AppConfig {
	pub config_source: ConfigSource,
	pub admin_addr: SocketAddr,
}

/// Runs the gateway to completion: builds the initial `StateSnapshot`, starts the data-plane and
/// admin listeners, and blocks until a shutdown signal is received and every in-flight connection
/// has drained.
pub async fn run(cfg: AppConfig) -> anyhow::Result<()> {
	let ready = gwcore::readiness::Ready::new();
	let startup = ready.register_task("bootstrap");

	let registry_impl: Arc<dyn crate::registry::ServiceRegistry> = Arc::new(StaticRegistry::new(vec![]));
	let reloader = Arc::new(Reloader::bootstrap(&cfg.config_source, registry_impl).await?);
	let listener_addrs = reloader.current().listeners.clone();
	drop(startup);

	let mut prom_registry = Registry::default();
	let _metrics = GatewayMetrics::new(&mut prom_registry);

	let admin_state = Arc::new(AdminState::new(
		reloader.clone(),
		cfg.config_source.clone(),
		ready.clone(),
		prom_registry,
	));
	let admin_router = admin::router(admin_state);
	let admin_listener = tokio::net::TcpListener::bind(cfg.admin_addr).await?;
	info!(addr = %cfg.admin_addr, "admin listening");

	let (drain_trigger, drain_watcher) = gwcore::drain::new();
	let admin_drain = drain_watcher.clone();
	let admin_task = tokio::spawn(async move {
		let serve = axum::serve(admin_listener, admin_router.into_make_service());
		tokio::select! {
			res = serve => { if let Err(e) = res { tracing::warn!(err = %e, "admin server exited"); } }
			_ = admin_drain.wait_for_drain() => {}
		}
	});

	let gateway = Gateway::new(reloader.clone(), drain_watcher);
	let data_plane = tokio::spawn(gateway.run(listener_addrs));

	gwcore::signal::Shutdown::new().wait().await;
	info!("shutdown signal received, draining");
	drain_trigger.start_drain_and_wait(gwcore::drain::DrainMode::Graceful).await;
	let _ = admin_task.await;
	let _ = data_plane.await;
	Ok(())
}
