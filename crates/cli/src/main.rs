//! Kiln command-line driver.
//!
//! Runs one build of a project directory through a [`BuildManager`] and
//! reports its diagnostics on the terminal.

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{BuildArgs, Cli, Command};
use kiln_build::{
	BuildEvent, BuildManager, BuildTarget, KilnConfig, MessageHandler, ProcessLauncher, StaticProject,
};
use kiln_proto::{BuildEventKind, BuilderMessage, CompileMessage, CompileMessageKind, CompletionStatus};
use tracing::info;

fn main() -> anyhow::Result<ExitCode> {
	let cli = Cli::parse();
	setup_tracing(cli.verbose);

	let config = match &cli.config {
		Some(path) => KilnConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
		None => KilnConfig::default(),
	};

	match cli.command {
		Command::Config => {
			print!("{}", toml::to_string(&config)?);
			Ok(ExitCode::SUCCESS)
		}
		Command::Build(args) => {
			kiln_worker::set_pool_size(config.runtime.worker_threads);
			let runtime = tokio::runtime::Builder::new_multi_thread()
				.worker_threads(config.runtime.worker_threads.max(1))
				.enable_all()
				.build()?;
			runtime.block_on(run_build(config, args))
		}
	}
}

async fn run_build(config: KilnConfig, args: BuildArgs) -> anyhow::Result<ExitCode> {
	let target = BuildTarget::new(&args.project);
	let launcher = Arc::new(ProcessLauncher::new(&config));
	let manager = BuildManager::new(config, Arc::new(StaticProject::default()), launcher);

	info!(%target, kind = ?args.kind(), "starting build");
	let (handler, mut events) = MessageHandler::channel();
	let future = manager
		.schedule_build(target, args.kind(), args.scope(), args.params.clone(), handler)
		.await?;

	let mut report = Report::default();
	loop {
		tokio::select! {
			event = events.recv() => match event {
				Some(BuildEvent::Terminated) | None => break,
				Some(event) => report.record(event),
			},
			_ = tokio::signal::ctrl_c(), if !future.is_cancelled() => {
				eprintln!("cancelling build...");
				future.cancel(true)?;
			}
		}
	}
	future.wait_for(None).await;
	manager.stop_listening().await;

	match future.outcome() {
		Some(Ok(())) if report.errors == 0 => {
			eprintln!("build finished: {} warning(s)", report.warnings);
			Ok(ExitCode::SUCCESS)
		}
		Some(Ok(())) => {
			eprintln!("build finished: {} error(s), {} warning(s)", report.errors, report.warnings);
			Ok(ExitCode::FAILURE)
		}
		Some(Err(err)) if err.is_cancelled() => {
			eprintln!("build cancelled");
			Ok(ExitCode::from(130))
		}
		Some(Err(err)) => {
			eprintln!("build failed: {err}");
			Ok(ExitCode::FAILURE)
		}
		None => Ok(ExitCode::FAILURE),
	}
}

#[derive(Debug, Default)]
struct Report {
	errors: usize,
	warnings: usize,
}

impl Report {
	fn record(&mut self, event: BuildEvent) {
		match event {
			BuildEvent::Message(BuilderMessage::CompileMessage(msg)) => self.compile_message(&msg),
			BuildEvent::Message(BuilderMessage::BuildEvent(ev)) if ev.kind == BuildEventKind::BuildCompleted => {
				if ev.status == Some(CompletionStatus::Errors) && self.errors == 0 {
					self.errors = 1;
				}
				info!(status = ?ev.status, "build completed");
			}
			BuildEvent::Message(BuilderMessage::BuildEvent(ev)) => {
				for file in &ev.generated_files {
					tracing::debug!(root = %file.output_root, path = %file.relative_path, "generated");
				}
			}
			BuildEvent::Message(_) | BuildEvent::Terminated => {}
			BuildEvent::Failure(failure) => {
				eprintln!("error: {failure}");
				if let Some(trace) = &failure.stacktrace {
					eprintln!("{trace}");
				}
			}
		}
	}

	fn compile_message(&mut self, msg: &CompileMessage) {
		let location = match (&msg.source_path, msg.line, msg.column) {
			(Some(path), Some(line), Some(col)) => format!("{path}:{line}:{col}: "),
			(Some(path), Some(line), None) => format!("{path}:{line}: "),
			(Some(path), None, _) => format!("{path}: "),
			(None, ..) => String::new(),
		};
		match msg.kind {
			CompileMessageKind::Error => {
				self.errors += 1;
				eprintln!("{location}error: {}", msg.text);
			}
			CompileMessageKind::Warning => {
				self.warnings += 1;
				eprintln!("{location}warning: {}", msg.text);
			}
			CompileMessageKind::Info => eprintln!("{location}{}", msg.text),
			CompileMessageKind::Progress => tracing::debug!(done = ?msg.done, "{}", msg.text),
		}
	}
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("kiln=debug,kiln_build=debug,builder_process=debug,info")
		} else {
			EnvFilter::new("kiln=info,kiln_build=info,warn")
		}
	});
	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
