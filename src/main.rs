//! CLI entry point for hydrofetch.

use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hydrofetch_core::{
    BatchObserver, BatchRunner, BatchStats, BuildOutcome, Catalog, Config, FetchTask,
    MetadataResolver, PROVIDER_NAMES, ProviderRegistry, TaskOutcome, build_default_registry,
    write_snapshot,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::from_env(PROVIDER_NAMES).context("invalid environment configuration")?;
    if let Some(dir) = &args.cache_dir {
        config.cache_dir.clone_from(dir);
    }
    if let Some(dir) = &args.snapshot_dir {
        config.snapshot_dir = Some(dir.clone());
    }
    if let Command::Fetch {
        concurrency: Some(c),
        ..
    } = &args.command
    {
        config.concurrency = usize::from(*c);
    }
    config.validate()?;

    let registry = build_default_registry(&config);

    match args.command {
        Command::Providers => list_providers(&registry),
        Command::Variables { provider } => list_variables(&registry, &provider)?,
        Command::Metadata { provider, save } => {
            show_metadata(&registry, &config, &provider, save.as_deref()).await?;
        }
        Command::Fetch {
            provider,
            variable,
            gauges,
            start,
            end,
            output_dir,
            ..
        } => {
            let request = FetchRequest {
                provider: &provider,
                variable: &variable,
                gauges,
                start,
                end,
            };
            fetch(&registry, &config, request, &output_dir, args.quiet).await?;
        }
        Command::BuildCache { provider } => build_cache(&registry, &provider).await?,
    }

    Ok(())
}

fn list_providers(registry: &ProviderRegistry) {
    for name in PROVIDER_NAMES {
        match registry.get(name) {
            Ok(provider) => println!("{name}\t{} variables", provider.available_variables().len()),
            Err(_) => println!("{name}\tdisabled (credentials not configured)"),
        }
    }
}

fn list_variables(registry: &ProviderRegistry, name: &str) -> Result<()> {
    let provider = registry.get(name)?;
    for variable in provider.available_variables() {
        println!("{}\t{}", variable.id(), variable.unit());
    }
    Ok(())
}

async fn show_metadata(
    registry: &ProviderRegistry,
    config: &Config,
    name: &str,
    save: Option<&Path>,
) -> Result<()> {
    let provider = registry.get(name)?;
    let resolver = MetadataResolver::new(provider, config.snapshot_path(name));
    let catalog = resolver.metadata().await?;

    if let Catalog::Unsupported = catalog {
        bail!("{name} publishes no station catalog and no snapshot is configured");
    }
    info!(origin = catalog.origin(), stations = catalog.stations().len(), "catalog resolved");

    println!("gauge_id,name,river,latitude,longitude,altitude,area");
    for station in catalog.stations() {
        println!(
            "{},{},{},{},{},{},{}",
            station.gauge_id,
            csv_text(station.name.as_deref()),
            csv_text(station.river.as_deref()),
            csv_number(station.latitude),
            csv_number(station.longitude),
            csv_number(station.altitude),
            csv_number(station.area),
        );
    }

    if let Some(path) = save {
        write_snapshot(path, catalog.stations()).await?;
        info!(path = %path.display(), "snapshot written");
    }
    Ok(())
}

fn csv_text(value: Option<&str>) -> String {
    match value {
        Some(v) if v.contains([',', '"', '\n']) => format!("\"{}\"", v.replace('"', "\"\"")),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

fn csv_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

struct FetchRequest<'a> {
    provider: &'a str,
    variable: &'a str,
    gauges: Vec<String>,
    start: Option<String>,
    end: Option<String>,
}

/// Advances a progress bar as gauges finish.
struct ProgressObserver {
    bar: ProgressBar,
}

impl BatchObserver for ProgressObserver {
    fn on_finished(&self, outcome: &TaskOutcome, stats: &BatchStats) {
        self.bar.inc(1);
        self.bar.set_message(format!(
            "{} ok, {} empty, {} failed",
            stats.completed(),
            stats.empty(),
            stats.failed()
        ));
        if let TaskOutcome::Failed { task, reason } = outcome {
            self.bar
                .println(format!("failed: {} ({reason})", task.gauge_id));
        }
    }
}

async fn fetch(
    registry: &ProviderRegistry,
    config: &Config,
    request: FetchRequest<'_>,
    output_dir: &Path,
    quiet: bool,
) -> Result<()> {
    let provider = registry.get(request.provider)?;
    let runner = BatchRunner::new(config.concurrency)?;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    let tasks: Vec<_> = request
        .gauges
        .iter()
        .map(|gauge| {
            FetchTask::new(Arc::clone(&provider), gauge, request.variable)
                .with_range(request.start.clone(), request.end.clone())
        })
        .collect();

    let bar = if quiet || !io::stderr().is_terminal() {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(tasks.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    };
    let observer = Arc::new(ProgressObserver { bar: bar.clone() });

    let report = runner.run(tasks, observer).await?;
    bar.finish_and_clear();

    for outcome in &report.outcomes {
        let TaskOutcome::Completed { task, series } = outcome else {
            continue;
        };
        let file = output_dir.join(format!(
            "{}_{}_{}.csv",
            request.provider,
            file_safe(&task.gauge_id),
            request.variable
        ));
        tokio::fs::write(&file, series.to_csv())
            .await
            .with_context(|| format!("cannot write {}", file.display()))?;
        debug!(path = %file.display(), rows = series.len(), "series written");
    }

    let stats = &report.stats;
    info!(
        completed = stats.completed(),
        empty = stats.empty(),
        failed = stats.failed(),
        total = stats.total(),
        "Fetch complete"
    );
    if !quiet {
        eprintln!(
            "{} completed, {} empty, {} failed",
            stats.completed(),
            stats.empty(),
            stats.failed()
        );
    }
    if stats.failed() == stats.total() && stats.total() > 0 {
        bail!("every request failed");
    }
    Ok(())
}

/// Replaces characters that do not belong in a file name.
fn file_safe(gauge_id: &str) -> String {
    gauge_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn build_cache(registry: &ProviderRegistry, name: &str) -> Result<()> {
    let provider = registry.get(name)?;
    match provider.build_cache().await? {
        None => {
            warn!(provider = name, "provider has no bulk archive");
            bail!("{name} has no bulk archive to cache");
        }
        Some(BuildOutcome::AlreadyBuilt) => println!("{name}: cache already built"),
        Some(BuildOutcome::Built { rows }) => println!("{name}: cache built with {rows} rows"),
    }
    Ok(())
}
