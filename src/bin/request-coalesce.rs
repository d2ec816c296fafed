use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use request_coalesce::{CoalesceMetrics, Coalescer, CoalescerBuilder, KeyEncoder, SerialGate};
use request_coalesce_runtime::{
    CoalesceLayer, CoalesceSettings, ResolvedSettings, SettingsLayer, SettingsResolver,
    TelemetryLayer, init_tracing,
};
use serde_json::Value;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about = "Request coalescing inspector")]
struct Cli {
    /// Optional settings file (TOML, or JSON by extension).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter directive; overrides config and environment.
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the registry key derived for a JSON argument list.
    Key {
        /// Maximum argument nesting depth.
        #[arg(long)]
        max_depth: Option<usize>,

        /// One JSON value per argument.
        #[arg(value_name = "JSON")]
        args: Vec<String>,
    },
    /// Simulate a fan-out of account lookups through a coalescer.
    Demo {
        /// Number of concurrent callers.
        #[arg(long, default_value_t = 8)]
        callers: usize,

        /// Number of distinct accounts the callers ask for.
        #[arg(long, default_value_t = 3)]
        keys: usize,

        /// Simulated RPC latency per lookup.
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,

        /// Issue the lookups inside a serial operation.
        #[arg(long)]
        serial: bool,
    },
    /// Show resolved settings or explain provenance.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the resolved settings for this invocation.
    Show {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the source of every resolved setting.
    Explain {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Debug)]
struct AccountInfo {
    address: String,
    lamports: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let resolved = resolve_settings(&cli)?;
    init_tracing(&resolved.settings.telemetry)?;

    match cli.command {
        Command::Key { args, .. } => print_key(&args, &resolved.settings.coalesce),
        Command::Demo {
            callers,
            keys,
            latency_ms,
            serial,
        } => {
            run_demo(
                &resolved.settings.coalesce,
                callers,
                keys,
                Duration::from_millis(latency_ms),
                serial,
            )
            .await
        }
        Command::Config { command } => handle_config_command(command, &resolved),
    }
}

fn resolve_settings(cli: &Cli) -> Result<ResolvedSettings> {
    let mut overrides = SettingsLayer::default();
    if let Some(filter) = &cli.log {
        overrides.telemetry = Some(TelemetryLayer {
            filter: Some(filter.clone()),
            ..Default::default()
        });
    }
    if let Command::Key {
        max_depth: Some(depth),
        ..
    } = &cli.command
    {
        overrides.coalesce = Some(CoalesceLayer {
            max_key_depth: Some(*depth),
            ..Default::default()
        });
    }

    let mut resolver = SettingsResolver::new().with_cli_overrides(overrides);
    if let Some(path) = &cli.config {
        resolver = resolver.with_config_file(path);
    }
    resolver.load().context("resolve request-coalesce settings")
}

fn print_key(args: &[String], settings: &CoalesceSettings) -> Result<()> {
    let values = args
        .iter()
        .map(|raw| {
            serde_json::from_str::<Value>(raw)
                .with_context(|| format!("argument {raw:?} is not valid json"))
        })
        .collect::<Result<Vec<_>>>()?;
    let key = KeyEncoder::with_max_depth(settings.max_key_depth).finish(&values)?;
    println!("{key}");
    Ok(())
}

fn build_coalescer<V, E>(settings: &CoalesceSettings, gate: SerialGate) -> Result<Coalescer<V, E>>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    CoalescerBuilder::new()
        .with_serial_gate(gate)
        .with_metrics(CoalesceMetrics::new())
        .with_max_key_depth(settings.max_key_depth)
        .build()
        .context("build coalescer")
}

async fn run_demo(
    settings: &CoalesceSettings,
    callers: usize,
    keys: usize,
    latency: Duration,
    serial: bool,
) -> Result<()> {
    if keys == 0 {
        return Err(anyhow!("--keys must be greater than zero"));
    }

    let gate = SerialGate::with_capacity(settings.drain_capacity)?;
    let mut drains = gate.subscribe();
    let coalescer: Coalescer<AccountInfo, String> = build_coalescer(settings, gate.clone())?;

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let get_account_info =
        coalescer.wrap_named("get_account_info", move |(seed, index): (String, u64)| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(latency).await;
                Ok::<_, String>(AccountInfo {
                    address: format!("{seed}-{index}"),
                    lamports: 1_000_000 * (index + 1),
                })
            }
        });

    let guard = serial.then(|| gate.enter());
    let lookups: Vec<_> = (0..callers)
        .map(|caller| get_account_info.call(("deal".to_string(), (caller % keys) as u64)))
        .collect();
    let registry = coalescer.active_registry();
    let in_flight = coalescer.in_flight();
    let results = join_all(lookups).await;
    drop(guard);

    for (caller, result) in results.iter().enumerate() {
        match result {
            Ok(account) => println!(
                "caller {caller}: {} ({} lamports)",
                account.address, account.lamports
            ),
            Err(err) => println!("caller {caller}: error {err}"),
        }
    }

    println!("callers: {callers}");
    println!("registry: {}", registry.as_str());
    println!("in flight before await: {in_flight}");
    println!("invocations: {}", invocations.load(Ordering::SeqCst));
    println!("joined: {}", coalescer.metrics().joined());
    println!("drains: {}", gate.drains());
    if serial {
        let drain = drains.next().await.context("serial gate closed")?;
        println!("drained: sequence {} at {}", drain.sequence, drain.at);
    }
    Ok(())
}

fn handle_config_command(cmd: ConfigCommand, resolved: &ResolvedSettings) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&resolved.settings)
                        .context("serialize settings to json")?
                );
            } else {
                println!("{:#?}", resolved.settings);
            }
        }
        ConfigCommand::Explain { json } => {
            let report = resolved.explain();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report.json)
                        .context("serialize explain report to json")?
                );
            } else {
                print!("{}", report.text);
            }
        }
    }
    Ok(())
}
