use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use repatch_bundle::{patches, BundleSource, PatchOptions, PatchSelection};
use repatch_core::{EventSink, ProgressEvent};
use repatch_runtime::{logging, Patcher, RepatchConfig, RuntimeMode};
use repatch_split::{prepare_if_needed, relocate};
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new("repatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Apply patch bundles to application packages")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (defaults to $REPATCH_CONFIG)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count)
                .help("Raise log verbosity"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log as JSON"),
        )
        .subcommand(
            Command::new("patch")
                .about("Patch a package")
                .arg(Arg::new("input").required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .value_parser(value_parser!(PathBuf))
                        .help("Output path (defaults to <input>-patched.apk)"),
                )
                .arg(package_arg())
                .arg(bundle_arg())
                .arg(
                    Arg::new("select")
                        .short('s')
                        .long("select")
                        .action(ArgAction::Append)
                        .help("Patch to apply, as [BUNDLE:]NAME (defaults to each bundle's default patches)"),
                )
                .arg(
                    Arg::new("option")
                        .short('o')
                        .long("option")
                        .action(ArgAction::Append)
                        .help("Option value, as BUNDLE:PATCH:KEY=VALUE (VALUE is JSON or a plain string)"),
                )
                .arg(
                    Arg::new("in-process")
                        .long("in-process")
                        .action(ArgAction::SetTrue)
                        .help("Patch inside this process instead of a worker"),
                )
                .arg(
                    Arg::new("memory-limit")
                        .long("memory-limit")
                        .value_parser(value_parser!(u64))
                        .help("Worker memory budget in MB"),
                )
                .arg(strip_arg())
                .arg(skip_splits_arg())
                .arg(
                    Arg::new("events")
                        .long("events")
                        .action(ArgAction::SetTrue)
                        .help("Print progress events as JSON lines on stdout"),
                ),
        )
        .subcommand(
            Command::new("merge")
                .about("Merge a split package into a single package")
                .arg(Arg::new("input").required(true).value_parser(value_parser!(PathBuf)))
                .arg(
                    Arg::new("output")
                        .value_parser(value_parser!(PathBuf))
                        .help("Output path (defaults to <input>-merged.apk)"),
                )
                .arg(strip_arg())
                .arg(skip_splits_arg()),
        )
        .subcommand(
            Command::new("list")
                .about("List patches compatible with a package")
                .arg(package_arg())
                .arg(bundle_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("memory")
                .about("Show the worker memory budget")
                .arg(
                    Arg::new("requested")
                        .long("requested")
                        .value_parser(value_parser!(u64))
                        .help("Requested budget in MB (defaults to the configured limit)"),
                ),
        );

    let matches = cli.get_matches();
    logging::init(matches.get_count("verbose"), matches.get_flag("log-json"));
    let config = RepatchConfig::resolve(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;

    match matches.subcommand() {
        Some(("patch", args)) => patch(config, args).await,
        Some(("merge", args)) => merge(config, args).await,
        Some(("list", args)) => list(args),
        Some(("memory", args)) => {
            memory(&config, args);
            Ok(())
        }
        Some((other, _)) => bail!("unknown command {other}"),
        None => bail!("no command given"),
    }
}

fn package_arg() -> Arg {
    Arg::new("package")
        .short('p')
        .long("package")
        .required(true)
        .help("Target package name")
}

fn bundle_arg() -> Arg {
    Arg::new("bundle")
        .short('b')
        .long("bundle")
        .required(true)
        .action(ArgAction::Append)
        .help("Patch bundle, as [ID=]PATH (ID defaults to the file stem)")
}

fn strip_arg() -> Arg {
    Arg::new("strip-native-libs")
        .long("strip-native-libs")
        .action(ArgAction::SetTrue)
        .help("Drop native libraries for unsupported architectures")
}

fn skip_splits_arg() -> Arg {
    Arg::new("skip-unneeded-splits")
        .long("skip-unneeded-splits")
        .action(ArgAction::SetTrue)
        .help("Leave out locale and density splits the device does not use")
}

async fn patch(mut config: RepatchConfig, args: &ArgMatches) -> Result<()> {
    if args.get_flag("in-process") {
        config = config.with_mode(RuntimeMode::InProcess);
    }
    if let Some(limit) = args.get_one::<u64>("memory-limit") {
        config = config.with_memory_limit(*limit);
    }
    if args.get_flag("strip-native-libs") {
        config = config.with_strip_native_libs(true);
    }
    if args.get_flag("skip-unneeded-splits") {
        config = config.with_skip_unneeded_splits(true);
    }

    let input = required_path(args, "input")?;
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| sibling(&input, "patched"));
    let package = required_str(args, "package")?;
    let bundles = bundle_sources(args)?;
    let selection = selection(args, &bundles, package)?;
    let options = option_values(args)?;

    let patcher = Patcher::from_config(config)?;
    let mut parameters = patcher.parameters(package, &input, &output);
    for bundle in bundles {
        parameters = parameters.with_bundle(bundle);
    }
    let parameters = parameters.with_selection(selection).with_options(options);

    let sink = if args.get_flag("events") {
        EventSink::new(print_event)
    } else {
        EventSink::new(log_event)
    };

    let patching = patcher.patch(parameters, sink);
    tokio::pin!(patching);
    tokio::select! {
        outcome = &mut patching => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling");
            patcher.cancel();
            patching.await?;
        }
    }
    println!("{}", output.display());
    Ok(())
}

async fn merge(mut config: RepatchConfig, args: &ArgMatches) -> Result<()> {
    if args.get_flag("strip-native-libs") {
        config = config.with_strip_native_libs(true);
    }
    if args.get_flag("skip-unneeded-splits") {
        config = config.with_skip_unneeded_splits(true);
    }
    let input = required_path(args, "input")?;
    let output = args
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| sibling(&input, "merged"));

    let patcher = Patcher::from_config(config)?;
    let options = patcher
        .parameters("", &input, &output)
        .with_downloads_marker(None)
        .prepare_options();
    let cache_dir = patcher.config().cache_dir();

    let prepared = prepare_if_needed(&input, &cache_dir, &options, &EventSink::new(log_event)).await?;
    if !prepared.merged {
        bail!("{} is not a split package", input.display());
    }
    relocate(&prepared.file, &output)
        .await
        .with_context(|| format!("cannot move merged package to {}", output.display()))?;
    prepared.cleanup();
    println!("{}", output.display());
    Ok(())
}

fn list(args: &ArgMatches) -> Result<()> {
    let package = required_str(args, "package")?;
    let loaded = patches(&bundle_sources(args)?, package)?;

    if args.get_flag("json") {
        let listing: Vec<_> = loaded
            .iter()
            .flat_map(|(bundle, patches)| {
                patches.iter().map(move |patch| {
                    serde_json::json!({
                        "bundle": bundle,
                        "name": patch.name(),
                        "description": patch.description(),
                        "use_by_default": patch.use_by_default(),
                        "options": patch.options().map(|option| &option.key).collect::<Vec<_>>(),
                    })
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    for (bundle, patches) in &loaded {
        println!("{bundle}:");
        for patch in patches {
            let marker = if patch.use_by_default() { "*" } else { " " };
            match patch.description() {
                Some(description) => println!("  {marker} {} - {}", patch.name(), description),
                None => println!("  {marker} {}", patch.name()),
            }
        }
    }
    Ok(())
}

fn memory(config: &RepatchConfig, args: &ArgMatches) {
    let policy = config.memory_policy();
    let requested = args
        .get_one::<u64>("requested")
        .copied()
        .unwrap_or(config.runtime.memory_limit_mb);

    println!("Device budget:   {}MB", policy.max_budget());
    println!("Recommended:     {}MB", policy.recommended());
    println!("Auto-scaled:     {}MB (requested {}MB)", policy.auto_scale(requested), requested);
    println!(
        "Worker limit:    {}MB",
        policy.effective(requested, config.runtime.aggressive_memory)
    );
}

fn required_path(args: &ArgMatches, name: &str) -> Result<PathBuf> {
    args.get_one::<PathBuf>(name)
        .cloned()
        .with_context(|| format!("missing <{name}>"))
}

fn required_str<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing --{name}"))
}

fn sibling(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().map_or_else(|| "package".into(), |stem| stem.to_string_lossy());
    input.with_file_name(format!("{stem}-{suffix}.apk"))
}

fn bundle_sources(args: &ArgMatches) -> Result<Vec<BundleSource>> {
    let mut sources = Vec::new();
    for value in args.get_many::<String>("bundle").into_iter().flatten() {
        let source = match value.split_once('=') {
            Some((id, path)) => BundleSource::new(id, path),
            None => {
                let path = PathBuf::from(value);
                let id = path
                    .file_stem()
                    .with_context(|| format!("cannot derive a bundle id from {value}"))?
                    .to_string_lossy()
                    .into_owned();
                BundleSource::new(id, path)
            }
        };
        if sources.iter().any(|known: &BundleSource| known.id == source.id) {
            bail!("bundle id {} given twice", source.id);
        }
        sources.push(source);
    }
    Ok(sources)
}

fn selection(args: &ArgMatches, bundles: &[BundleSource], package: &str) -> Result<PatchSelection> {
    let mut selection = PatchSelection::new();
    let requested: Vec<&String> = args.get_many::<String>("select").into_iter().flatten().collect();

    if requested.is_empty() {
        for (bundle, patches) in patches(bundles, package)? {
            for patch in patches.iter().filter(|patch| patch.use_by_default()) {
                selection.select(bundle.as_str(), patch.name());
            }
        }
        return Ok(selection);
    }

    for value in requested {
        match value.split_once(':') {
            Some((bundle, name)) => selection.select(bundle, name),
            None => match bundles {
                [only] => selection.select(only.id.as_str(), value.as_str()),
                _ => bail!("--select {value} must name its bundle when more than one is given"),
            },
        }
    }
    Ok(selection)
}

fn option_values(args: &ArgMatches) -> Result<PatchOptions> {
    let mut options = PatchOptions::new();
    for value in args.get_many::<String>("option").into_iter().flatten() {
        let (target, raw) = value
            .split_once('=')
            .with_context(|| format!("--option {value} is missing '='"))?;
        let mut parts = target.splitn(3, ':');
        let (Some(bundle), Some(patch), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            bail!("--option {value} must be BUNDLE:PATCH:KEY=VALUE");
        };
        let parsed = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        options.set(bundle, patch, key, parsed);
    }
    Ok(options)
}

fn print_event(event: ProgressEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!("Cannot encode event: {}", err),
    }
}

fn log_event(event: ProgressEvent) {
    match event {
        ProgressEvent::Started { step } => tracing::info!("Started: {}", step),
        ProgressEvent::Progress {
            step,
            message: Some(message),
            ..
        } => tracing::info!("{}: {}", step, message),
        ProgressEvent::Progress { step, sub_steps: Some(titles), .. } => {
            tracing::debug!("{}: {} sub-steps", step, titles.len());
        }
        ProgressEvent::Progress { .. } => {}
        ProgressEvent::Completed { step } => tracing::info!("Completed: {}", step),
        ProgressEvent::Failed { step: Some(step), error } => tracing::error!("Failed: {}: {}", step, error),
        ProgressEvent::Failed { step: None, error } => tracing::debug!("Session failed: {}", error.stack_trace),
    }
}
