use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kiln_build::{BuildKind, BuildScope};
use kiln_proto::KeyValuePair;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Run out-of-process incremental builds")]
#[command(version)]
/// Command-line arguments.
pub struct Cli {
	/// Configuration file (TOML)
	#[arg(long, short = 'c', value_name = "PATH", global = true)]
	pub config: Option<PathBuf>,

	/// Verbose logging
	#[arg(long, short = 'v', global = true)]
	pub verbose: bool,

	/// Subcommand to execute.
	#[command(subcommand)]
	pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
	/// Build a project
	Build(BuildArgs),
	/// Print the effective configuration
	Config,
}

/// Arguments of `kiln build`.
#[derive(Args, Debug)]
pub struct BuildArgs {
	/// Project directory
	#[arg(value_name = "PATH", default_value = ".")]
	pub project: PathBuf,

	/// Discard incremental state and build everything
	#[arg(long, conflicts_with = "force")]
	pub rebuild: bool,

	/// Compile these files regardless of their status
	#[arg(long, value_name = "FILE", num_args = 1..)]
	pub force: Vec<String>,

	/// Restrict the build to a module
	#[arg(long = "module", short = 'm', value_name = "NAME")]
	pub modules: Vec<String>,

	/// Restrict the build to an artifact
	#[arg(long = "artifact", value_name = "NAME")]
	pub artifacts: Vec<String>,

	/// Extra builder parameter
	#[arg(long = "param", short = 'D', value_name = "KEY=VALUE", value_parser = parse_param)]
	pub params: Vec<KeyValuePair>,
}

impl BuildArgs {
	/// Build kind selected by the flags.
	pub fn kind(&self) -> BuildKind {
		if self.rebuild {
			BuildKind::Rebuild
		} else if !self.force.is_empty() {
			BuildKind::ForceCompile
		} else {
			BuildKind::Make
		}
	}

	/// Scope selected by the flags.
	pub fn scope(&self) -> BuildScope {
		BuildScope {
			modules: self.modules.clone(),
			artifacts: self.artifacts.clone(),
			paths: self.force.clone(),
		}
	}
}

fn parse_param(raw: &str) -> Result<KeyValuePair, String> {
	match raw.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok(KeyValuePair::new(key, value)),
		_ => Err(format!("expected KEY=VALUE, got `{raw}`")),
	}
}

#[cfg(test)]
mod tests;
