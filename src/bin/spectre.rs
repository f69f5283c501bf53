use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::Color;
use tokio_util::sync::CancellationToken;

use spectre::config::Config;
use spectre::model::{normalize_timestamp, Event, TimeRange, UnixNanos};
use spectre::storage::{EventQuery, EventStore, FileReader, QueryExecutor, QueryFilters};
use spectre::{Runtime, SpectreError};

#[derive(Parser)]
#[command(name = "spectre", version, about = "Kubernetes observability service")]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(long, env = "SPECTRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured storage directory.
    #[arg(long, env = "SPECTRE_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service: capture, storage, graph pipeline, REST API.
    Serve {
        /// Bind host override.
        #[arg(long)]
        host: Option<String>,
        /// Bind port override.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Bulk-import a JSON event stream through the normal write path.
    Import {
        /// File containing a JSON array of events.
        file: PathBuf,
    },
    /// Export events for a window to stdout.
    Export {
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },
    /// Print an hour file's header, block table, and index summary.
    Inspect { file: PathBuf },
    /// Generate shell completions.
    Completions { shell: Shell },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Csv,
}

fn load_config(cli: &Cli) -> Result<Config, SpectreError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.storage.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn now_nanos() -> UnixNanos {
    time::OffsetDateTime::now_utc().unix_timestamp_nanos() as UnixNanos
}

fn main() {
    let cli = Cli::parse();
    spectre::logging::init("info");
    if let Err(err) = run(cli) {
        eprintln!("{} {err}", Color::Red.paint("error:"));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), SpectreError> {
    match &cli.command {
        Command::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "spectre",
                &mut std::io::stdout(),
            );
            Ok(())
        }
        Command::Inspect { file } => inspect(file),
        Command::Import { file } => import(&cli, file.clone()),
        Command::Export {
            start,
            end,
            namespace,
            kind,
            format,
        } => export(
            &cli,
            *start,
            *end,
            namespace.clone(),
            kind.clone(),
            *format,
        ),
        Command::Serve { host, port } => serve(&cli, host.clone(), *port),
    }
}

fn serve(cli: &Cli, host: Option<String>, port: Option<u16>) -> Result<(), SpectreError> {
    let mut config = load_config(cli)?;
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }

    let tokio_runtime = tokio::runtime::Runtime::new()?;
    tokio_runtime.block_on(async {
        let service = Runtime::start(config).await?;
        let retention = service.spawn_retention(now_nanos);
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_token.cancel();
            }
        });

        let api_config = service.config.api.clone();
        let result = spectre::api::serve(Arc::clone(&service.state), &api_config, shutdown).await;
        retention.abort();
        service.shutdown().await?;
        result
    })
}

fn import(cli: &Cli, file: PathBuf) -> Result<(), SpectreError> {
    let config = load_config(cli)?;
    let raw = std::fs::read(&file)?;
    let mut events: Vec<Event> = serde_json::from_slice(&raw)?;
    events.sort_by_key(|e| e.timestamp);

    let store = EventStore::open(config.storage)?;
    let bar = ProgressBar::new(events.len() as u64);
    bar.set_style(ProgressStyle::default_bar());
    let total = events.len();
    for event in events {
        store.write_event(event)?;
        bar.inc(1);
    }
    store.finalize_open()?;
    bar.finish_and_clear();
    println!(
        "{} imported {total} events into {}",
        Color::Green.paint("ok:"),
        store.data_dir().display()
    );
    Ok(())
}

fn export(
    cli: &Cli,
    start: i64,
    end: i64,
    namespace: Option<String>,
    kind: Option<String>,
    format: ExportFormat,
) -> Result<(), SpectreError> {
    let config = load_config(cli)?;
    let store = Arc::new(EventStore::open(config.storage)?);
    let executor = QueryExecutor::new(store);
    let cancel = CancellationToken::new();
    let outcome = executor.query(
        &cancel,
        &EventQuery {
            range: TimeRange::new(normalize_timestamp(start), normalize_timestamp(end))?,
            filters: QueryFilters {
                namespace,
                kind,
                group: None,
                name: None,
            },
            limit: None,
            descending: false,
        },
    )?;
    for warning in &outcome.stats.warnings {
        eprintln!("{} {warning}", Color::Yellow.paint("warning:"));
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut out, &outcome.events)?;
            writeln!(out)?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            writer
                .write_record([
                    "id", "timestamp", "event", "group", "version", "kind", "namespace", "name",
                    "uid",
                ])
                .map_err(|err| SpectreError::Serialization(err.to_string()))?;
            for event in &outcome.events {
                writer
                    .write_record([
                        event.id.as_str(),
                        &event.timestamp.to_string(),
                        event.kind.as_str(),
                        event.resource.group.as_str(),
                        event.resource.version.as_str(),
                        event.resource.kind.as_str(),
                        event.resource.namespace.as_str(),
                        event.resource.name.as_str(),
                        event.resource.uid.as_str(),
                    ])
                    .map_err(|err| SpectreError::Serialization(err.to_string()))?;
            }
            writer
                .flush()
                .map_err(|err| SpectreError::Serialization(err.to_string()))?;
        }
    }
    Ok(())
}

fn inspect(file: &PathBuf) -> Result<(), SpectreError> {
    let reader = FileReader::open(file)?;
    println!("{}", Color::Cyan.bold().paint(format!("{}", file.display())));
    println!(
        "  format v{}  compression gzip  hour epoch {}",
        reader.header.version, reader.header.hour_epoch
    );
    if reader.index_less {
        println!(
            "  {} footer unreadable, index rebuilt by scan ({} blocks skipped)",
            Color::Yellow.paint("degraded:"),
            reader.skipped_blocks
        );
    }
    println!(
        "  blocks: {}  final states: {}",
        reader.index.blocks.len(),
        reader.index.final_states.len()
    );
    println!(
        "  kinds: {}  namespaces: {}  groups: {}",
        reader.index.kind_to_blocks.len(),
        reader.index.namespace_to_blocks.len(),
        reader.index.group_to_blocks.len()
    );
    for block in &reader.index.blocks {
        println!(
            "  block {:>4}  events {:>6}  {:>9} -> {:>9} bytes  ts [{} .. {}]",
            block.id,
            block.event_count,
            block.uncompressed_len,
            block.compressed_len,
            block.ts_min,
            block.ts_max
        );
    }
    Ok(())
}
