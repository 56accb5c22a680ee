//! `cahs` command-line front end

use anyhow::{bail, Context};
use cahs_core::{
    Orchestrator, OrchestratorConfig, PipelineRun, Principal, SessionId, TerminalStatus,
};
use cahs_intake::{encode_payload, Validator};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Orchestrator configuration (TOML)");
    let json_arg = Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output as JSON");

    Command::new("cahs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Upload, run and retrieve genomic analyses")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("check")
                .about("Classify and validate local input files")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf))
                        .help("Files to check"),
                )
                .arg(json_arg.clone()),
        )
        .subcommand(
            Command::new("analyze")
                .about("Upload inputs, run an engine profile and fetch its artifact")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("profile")
                        .long("profile")
                        .short('p')
                        .required(true)
                        .help("Engine profile name"),
                )
                .arg(
                    Arg::new("input")
                        .long("input")
                        .short('i')
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(PathBuf))
                        .help("Input file (repeatable)"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .short('o')
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory to write the artifact into"),
                )
                .arg(json_arg),
        )
        .subcommand(
            Command::new("profiles")
                .about("List configured engine profiles")
                .arg(config_arg),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let result = match matches.subcommand() {
        Some(("check", args)) => check(args).await,
        Some(("analyze", args)) => analyze(args).await,
        Some(("profiles", args)) => profiles(args),
        _ => Ok(ExitCode::FAILURE),
    };

    result.unwrap_or_else(|e| {
        eprintln!("error: {e:#}");
        ExitCode::FAILURE
    })
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

async fn check(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let json = args.get_flag("json");
    let validator = Validator::default();
    let mut all_valid = true;
    let mut report = Vec::new();

    for path in args.get_many::<PathBuf>("files").into_iter().flatten() {
        let name = file_name(path)?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        match validator.validate(&name, &encode_payload("", &bytes)) {
            Ok(upload) => {
                if json {
                    report.push(json!({
                        "file": path,
                        "kind": upload.kind,
                        "bytes": upload.bytes.len(),
                        "records": upload.record_count,
                    }));
                } else {
                    let records = upload
                        .record_count
                        .map_or_else(|| "-".to_string(), |n| n.to_string());
                    println!(
                        "{}: {} ({} bytes, {} records)",
                        path.display(),
                        upload.kind,
                        upload.bytes.len(),
                        records
                    );
                }
            }
            Err(e) => {
                all_valid = false;
                if json {
                    report.push(json!({ "file": path, "error": e.code(), "message": e.to_string() }));
                } else {
                    println!("{}: {}: {e}", path.display(), e.code());
                }
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(if all_valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_config(args: &ArgMatches) -> anyhow::Result<OrchestratorConfig> {
    let Some(path) = args.get_one::<PathBuf>("config") else {
        bail!("--config is required");
    };
    Ok(OrchestratorConfig::load(path)?)
}

async fn analyze(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let config = load_config(args)?;
    let Some(profile) = args.get_one::<String>("profile") else {
        bail!("--profile is required");
    };
    let Some(out_dir) = args.get_one::<PathBuf>("out") else {
        bail!("--out is required");
    };
    let inputs: Vec<&PathBuf> = args.get_many::<PathBuf>("input").into_iter().flatten().collect();
    let json = args.get_flag("json");

    let orchestrator = Orchestrator::new(config)?;
    let me = Principal::new("cli");
    let session = orchestrator.create_session(&me).await?;

    let outcome = run_session(&orchestrator, &me, &session, profile, &inputs, out_dir).await;
    orchestrator.teardown(&me, &session).await?;
    let (run, delivered) = outcome?;

    let terminal = run
        .terminal
        .as_ref()
        .map_or_else(|| "unknown".to_string(), ToString::to_string);
    if json {
        let report = json!({ "run": run, "artifact": delivered });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("run {}: {terminal}", run.id);
        if let Some(path) = &delivered {
            println!("artifact written to {}", path.display());
        }
    }

    let completed = run.terminal.as_ref().is_some_and(TerminalStatus::is_completed);
    Ok(if completed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run_session(
    orchestrator: &Orchestrator,
    me: &Principal,
    session: &SessionId,
    profile: &str,
    inputs: &[&PathBuf],
    out_dir: &Path,
) -> anyhow::Result<(PipelineRun, Option<PathBuf>)> {
    for path in inputs {
        let name = file_name(path)?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let stored = orchestrator
            .ingest(me, session, &name, &encode_payload("", &bytes))
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        tracing::info!(file = %path.display(), kind = %stored.kind, "input accepted");
    }

    let run_id = orchestrator.submit_run(me, session, profile).await?;
    let run = tokio::select! {
        run = orchestrator.wait_for_run(me, run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, cancelling run");
            orchestrator.cancel_run(me, run_id)?;
            orchestrator.wait_for_run(me, run_id).await?
        }
    };

    if !run.terminal.as_ref().is_some_and(TerminalStatus::is_completed) {
        return Ok((run, None));
    }

    let mut delivery = orchestrator.download(me, run_id).await?;
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let target = out_dir.join(&delivery.filename);
    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("creating {}", target.display()))?;
    let copied = tokio::io::copy(&mut delivery.reader, &mut file).await?;
    tracing::info!(path = %target.display(), bytes = copied, "artifact delivered");

    Ok((run, Some(target)))
}

fn profiles(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let config = load_config(args)?;
    if config.profiles.is_empty() {
        println!("no engine profiles configured");
    }
    for (name, profile) in &config.profiles {
        let inputs: Vec<String> = profile
            .required_inputs()
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "{name}: {} -> {} (inputs: {})",
            profile.program,
            profile.expects,
            if inputs.is_empty() { "none".to_string() } else { inputs.join(", ") }
        );
    }
    Ok(ExitCode::SUCCESS)
}
