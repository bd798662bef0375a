// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed); trimmed down to
// a plain tracing-subscriber pipeline (env-filter + optional JSON output + a reload handle for the
// admin surface) instead of hand-rolling a batching writer and a custom event formatter.

use std::env;
use std::str::FromStr;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

pub static APPLICATION_START_TIME: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

type FilteredLayer = EnvFilter;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

fn default_filter() -> EnvFilter {
	EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global tracing subscriber. Returns a guard that must be held for the lifetime of
/// the process (dropping it flushes and stops the background writer thread).
pub fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
	Lazy::force(&APPLICATION_START_TIME);
	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
	let use_json = env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

	let (filter, reload_handle) = reload::Layer::new(default_filter());
	let _ = LOG_HANDLE.set(reload_handle);

	let fmt = tracing_subscriber::fmt::layer().with_writer(non_blocking);
	if use_json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt.json())
			.init();
	} else {
		tracing_subscriber::registry().with(filter).with(fmt).init();
	}
	guard
}

/// Dynamically update the logging filter. If `reset` is true the new directive replaces the
/// current one entirely; otherwise it's appended (comma-joined), matching `EnvFilter` semantics.
pub fn set_level(reset: bool, directive: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	let new_directive = if reset {
		directive.to_string()
	} else {
		let current = handle
			.with_current(|f| f.to_string())
			.unwrap_or_else(|_| default_filter().to_string());
		format!("{current},{directive}")
	};
	let new_filter = EnvFilter::from_str(&new_directive)?;
	handle.reload(new_filter)?;
	Ok(())
}

pub fn get_current_loglevel() -> Result<String, Error> {
	LOG_HANDLE
		.get()
		.ok_or(Error::Uninitialized)?
		.with_current(|f| f.to_string())
		.map_err(Error::Reload)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_filter_falls_back_to_info() {
		// SAFETY: test-only, single-threaded access to process env.
		unsafe { std::env::remove_var("RUST_LOG") };
		assert_eq!(default_filter().to_string(), "info");
	}
}
