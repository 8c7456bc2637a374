//! Build manager configuration.
//!
//! Loaded from TOML; every section and field is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! system_dir = "/var/cache/kiln"
//!
//! [automake]
//! quiet_period_ms = 5000
//!
//! [toolchain]
//! classpath = ["/opt/jps/jps-builders.jar", "/opt/jps/util.jar"]
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},
	/// The file is not valid TOML or does not match the schema.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
	/// Root for build process state. Defaults to `<cache dir>/kiln`.
	pub system_dir: Option<PathBuf>,
	/// Background make-on-save.
	pub automake: AutoMakeConfig,
	/// Build process resources and options.
	pub process: ProcessConfig,
	/// Interpreter and classpath of the build process.
	pub toolchain: ToolchainConfig,
	/// Loopback listener settings.
	pub transport: TransportConfig,
	/// Worker pool sizing.
	pub runtime: RuntimeConfig,
}

impl KilnConfig {
	/// Reads and parses `path`.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&text)
	}

	/// Parses configuration from TOML text.
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	/// Effective system directory.
	pub fn system_dir(&self) -> PathBuf {
		self.system_dir
			.clone()
			.or_else(|| dirs::cache_dir().map(|dir| dir.join("kiln")))
			.unwrap_or_else(|| std::env::temp_dir().join("kiln"))
	}

	/// Working directory of build processes.
	pub fn compile_server_dir(&self) -> PathBuf {
		self.system_dir().join("compile-server")
	}
}

/// Shortest quiet period or re-arm interval honoured; smaller values are
/// raised to it.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(50);

/// Auto-make scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoMakeConfig {
	/// Whether file notifications arm the auto-make timer.
	pub enabled: bool,
	/// Quiet period after the last notification before a cycle starts.
	pub quiet_period_ms: u64,
	/// Delay before retrying when a cycle is still running.
	pub rearm_interval_ms: u64,
	/// Upper bound on waiting for each cancelled build when a target closes.
	pub cancel_wait_ms: u64,
}

impl Default for AutoMakeConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			quiet_period_ms: 5000,
			rearm_interval_ms: 5000,
			cancel_wait_ms: 500,
		}
	}
}

impl AutoMakeConfig {
	/// Quiet period as a [`Duration`], at least [`MIN_TIMER_INTERVAL`].
	pub fn quiet_period(&self) -> Duration {
		Duration::from_millis(self.quiet_period_ms).max(MIN_TIMER_INTERVAL)
	}

	/// Re-arm interval as a [`Duration`], at least [`MIN_TIMER_INTERVAL`].
	pub fn rearm_interval(&self) -> Duration {
		Duration::from_millis(self.rearm_interval_ms).max(MIN_TIMER_INTERVAL)
	}

	/// Per-future cancel wait as a [`Duration`].
	pub fn cancel_wait(&self) -> Duration {
		Duration::from_millis(self.cancel_wait_ms)
	}
}

/// Build process options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessConfig {
	/// Bytes of stderr kept for failure reports.
	pub stderr_capture_limit: usize,
	/// Maximum heap of the build process in MiB.
	pub heap_size_mb: u32,
	/// Extra VM options, whitespace separated.
	pub vm_options: String,
	/// Port for a suspended debugging agent.
	pub debug_port: Option<u16>,
	/// Keep compiler temporary files in memory.
	pub use_memory_temp_cache: bool,
	/// Run the compiler out of process.
	pub use_external_compiler: bool,
	/// Locale such as `en_US.UTF-8`. Falls back to `LANG`.
	pub locale: Option<String>,
}

impl Default for ProcessConfig {
	fn default() -> Self {
		Self {
			stderr_capture_limit: 1024,
			heap_size_mb: 512,
			vm_options: String::new(),
			debug_port: None,
			use_memory_temp_cache: true,
			use_external_compiler: false,
			locale: None,
		}
	}
}

/// Build process toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
	/// Interpreter executable. Resolved from `JAVA_HOME` or `PATH` when unset.
	pub interpreter: Option<PathBuf>,
	/// Classpath entries of the build process.
	pub classpath: Vec<PathBuf>,
	/// Entry point class.
	pub main_class: String,
}

impl Default for ToolchainConfig {
	fn default() -> Self {
		Self {
			interpreter: None,
			classpath: Vec::new(),
			main_class: "org.jetbrains.jps.cmdline.BuildMain".to_string(),
		}
	}
}

/// Loopback transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
	/// Address the listener binds. Port 0 picks an ephemeral port.
	pub bind_address: SocketAddr,
	/// Largest accepted frame payload.
	pub max_frame_len: usize,
}

impl Default for TransportConfig {
	fn default() -> Self {
		Self {
			bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
			max_frame_len: kiln_proto::codec::DEFAULT_MAX_FRAME_LEN,
		}
	}
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
	/// Threads in the worker pool.
	pub worker_threads: usize,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			worker_threads: kiln_worker::DEFAULT_POOL_SIZE,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		let config = KilnConfig::from_toml_str("").unwrap();
		assert_eq!(config, KilnConfig::default());
		assert_eq!(config.automake.quiet_period(), Duration::from_secs(5));
		assert_eq!(config.automake.rearm_interval(), Duration::from_secs(5));
		assert_eq!(config.automake.cancel_wait(), Duration::from_millis(500));
		assert_eq!(config.process.stderr_capture_limit, 1024);
		assert_eq!(config.runtime.worker_threads, 4);
		assert_eq!(config.transport.bind_address.port(), 0);
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = KilnConfig::from_toml_str(
			r#"
system_dir = "/tmp/kiln-test"

[automake]
quiet_period_ms = 250

[toolchain]
classpath = ["/a.jar", "/b.jar"]
"#,
		)
		.unwrap();
		assert_eq!(config.automake.quiet_period_ms, 250);
		assert_eq!(config.automake.rearm_interval_ms, 5000);
		assert!(config.automake.enabled);
		assert_eq!(config.toolchain.classpath.len(), 2);
		assert_eq!(config.toolchain.main_class, "org.jetbrains.jps.cmdline.BuildMain");
		assert_eq!(config.compile_server_dir(), PathBuf::from("/tmp/kiln-test/compile-server"));
	}

	#[test]
	fn zero_intervals_are_raised_to_minimum() {
		let config = KilnConfig::from_toml_str("[automake]\nquiet_period_ms = 0\nrearm_interval_ms = 0\n").unwrap();
		assert_eq!(config.automake.quiet_period(), MIN_TIMER_INTERVAL);
		assert_eq!(config.automake.rearm_interval(), MIN_TIMER_INTERVAL);

		let config = KilnConfig::from_toml_str("[automake]\nrearm_interval_ms = 120\n").unwrap();
		assert_eq!(config.automake.rearm_interval(), Duration::from_millis(120));
	}

	#[test]
	fn unknown_keys_are_rejected() {
		let err = KilnConfig::from_toml_str("[automake]\nquiet = 1\n").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}

	#[test]
	fn load_reports_missing_file_path() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("absent.toml");
		match KilnConfig::load(&path) {
			Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
			other => panic!("expected io error, got {other:?}"),
		}
	}
}
