use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub git_revision: String,
	pub rust_version: String,
	pub build_profile: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			git_revision: option_env!("GATEWAY_BUILD_GIT_REVISION")
				.unwrap_or("unknown")
				.to_string(),
			rust_version: option_env!("GATEWAY_BUILD_RUSTC_VERSION")
				.unwrap_or("unknown")
				.to_string(),
			build_profile: if cfg!(debug_assertions) {
				"debug".to_string()
			} else {
				"release".to_string()
			},
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", RustVersion:\"{}\", BuildProfile:\"{}\"}}",
			self.version, self.git_revision, self.rust_version, self.build_profile
		)
	}
}
