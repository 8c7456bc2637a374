use super::*;

fn build_args(args: &[&str]) -> BuildArgs {
	let cli = Cli::try_parse_from(["kiln", "build"].iter().chain(args)).unwrap();
	match cli.command {
		Command::Build(args) => args,
		other => panic!("unexpected command {other:?}"),
	}
}

#[test]
fn plain_build_is_make_of_current_dir() {
	let args = build_args(&[]);
	assert_eq!(args.project, PathBuf::from("."));
	assert_eq!(args.kind(), BuildKind::Make);
	assert_eq!(args.scope(), BuildScope::default());
}

#[test]
fn force_selects_forced_compilation() {
	let args = build_args(&["proj", "--force", "a.src", "b.src", "-m", "core"]);
	assert_eq!(args.kind(), BuildKind::ForceCompile);
	let scope = args.scope();
	assert_eq!(scope.paths, vec!["a.src".to_string(), "b.src".to_string()]);
	assert_eq!(scope.modules, vec!["core".to_string()]);
}

#[test]
fn rebuild_conflicts_with_force() {
	assert!(Cli::try_parse_from(["kiln", "build", "--rebuild", "--force", "a.src"]).is_err());
	assert_eq!(build_args(&["--rebuild"]).kind(), BuildKind::Rebuild);
}

#[test]
fn params_split_on_first_equals() {
	let args = build_args(&["-D", "opt=a=b", "--param", "empty="]);
	assert_eq!(
		args.params,
		vec![KeyValuePair::new("opt", "a=b"), KeyValuePair::new("empty", "")]
	);
	assert!(Cli::try_parse_from(["kiln", "build", "-D", "=x"]).is_err());
	assert!(Cli::try_parse_from(["kiln", "build", "-D", "novalue"]).is_err());
}

#[test]
fn global_flags_after_subcommand() {
	let cli = Cli::try_parse_from(["kiln", "config", "-v", "--config", "kiln.toml"]).unwrap();
	assert!(cli.verbose);
	assert_eq!(cli.config, Some(PathBuf::from("kiln.toml")));
	assert!(matches!(cli.command, Command::Config));
}
