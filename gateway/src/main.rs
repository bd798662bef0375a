use std::net::SocketAddr;
use std::path::PathBuf;

use gateway::app::{self, AppConfig};
use gateway::config::ConfigSource;

fn main() -> anyhow::Result<()> {
	let _log_guard = gwcore::telemetry::setup_logging();

	let config_path = std::env::args().nth(1).unwrap_or_else(|| "gateway.yaml".to_string());
	let admin_addr: SocketAddr = std::env::var("GATEWAY_ADMIN_ADDR")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or_else(|| "0.0.0.0:9901".parse().unwrap());

	let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
	rt.block_on(app::run(AppConfig {
		config_source: ConfigSource::File(PathBuf::from(config_path)),
		admin_addr,
	}))
}
