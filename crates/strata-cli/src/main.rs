use clap::{ArgAction, Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use strata_pipeline::{
    ExecutionMode, Graph, NodeEvent, PipelineConfig, PipelineRunner, RunConfig, RunEvent,
    RunSummary, RuntimeEvent, RuntimeEventKind, RuntimeEventSink, Selection, SitesPipeline,
    SitesSettings, runtime_event_channel,
};
use strata_store::{
    FsMaterializationStore, MaterializationStore, RunRecord, RunStatus,
    SharedMaterializationStore,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Materializes the sites lakehouse pipeline")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the whole graph or a selection of it.
    Materialize(MaterializeArgs),
    /// Show the recorded status of a run.
    Status(StatusArgs),
    /// List nodes in execution order.
    Nodes,
}

#[derive(clap::Args, Debug)]
struct MaterializeArgs {
    /// Node to run; repeat for several. Runs everything when omitted.
    #[arg(long = "select")]
    select: Vec<String>,
    /// Also run everything downstream of the selected nodes.
    #[arg(long, action = ArgAction::SetTrue, requires = "select")]
    downstream: bool,
    /// Also run everything the selected nodes depend on.
    #[arg(
        long,
        action = ArgAction::SetTrue,
        requires = "select",
        conflicts_with = "downstream"
    )]
    with_upstream: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    concurrent: bool,
    #[arg(long)]
    max_concurrency: Option<usize>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct StatusArgs {
    /// Defaults to the most recent run.
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match cli.command {
        Commands::Materialize(args) => materialize_command(args).await,
        Commands::Status(args) => status_command(args).await,
        Commands::Nodes => nodes_command(),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn load_config() -> Result<PipelineConfig, String> {
    PipelineConfig::from_env().map_err(|error| error.to_string())
}

fn build_graph(config: &PipelineConfig) -> Result<Graph, String> {
    SitesPipeline::registry(&SitesSettings::from(config))
        .and_then(|registry| registry.build())
        .map_err(|error| error.to_string())
}

fn open_store(config: &PipelineConfig) -> Result<SharedMaterializationStore, String> {
    let store = FsMaterializationStore::new(&config.state_dir).map_err(|error| error.to_string())?;
    Ok(Arc::new(store))
}

async fn materialize_command(args: MaterializeArgs) -> Result<ExitCode, String> {
    let config = load_config()?;
    let graph = build_graph(&config)?;
    let store = open_store(&config)?;

    let selection = if args.select.is_empty() {
        Selection::All
    } else if args.downstream {
        Selection::Downstream(args.select)
    } else if args.with_upstream {
        Selection::Upstream(args.select)
    } else {
        Selection::Only(args.select)
    };
    let mode = if args.concurrent {
        ExecutionMode::Concurrent {
            max_concurrency: args.max_concurrency.unwrap_or(config.max_concurrency).max(1),
        }
    } else {
        ExecutionMode::Sequential
    };

    let cancellation = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancellation.cancel();
            }
        }
    });

    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);
    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                run_id: args.run_id,
                selection,
                mode,
                capabilities: config.provision_capabilities(),
                store,
                events: event_sink,
                cancellation,
            },
        )
        .await;
    interrupt.abort();
    let summary = result.map_err(|error| error.to_string())?;

    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    print_run_summary(&summary);
    Ok(exit_code_for_status(summary.status))
}

async fn status_command(args: StatusArgs) -> Result<ExitCode, String> {
    let config = load_config()?;
    let store = open_store(&config)?;

    let record = match args.run_id.as_deref() {
        Some(run_id) => store.get_run(run_id).await,
        None => store.latest_run().await,
    }
    .map_err(|error| error.to_string())?;

    let Some(record) = record else {
        match args.run_id {
            Some(run_id) => return Err(format!("no run recorded with id '{run_id}'")),
            None => {
                println!("no runs recorded");
                return Ok(ExitCode::SUCCESS);
            }
        }
    };

    if args.json {
        let json = serde_json::to_string_pretty(&record).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        print_run_record(&record);
    }
    Ok(ExitCode::SUCCESS)
}

fn nodes_command() -> Result<ExitCode, String> {
    let config = load_config()?;
    let graph = build_graph(&config)?;
    for node in graph.nodes() {
        let dependencies: Vec<&str> = node
            .dependencies()
            .iter()
            .map(|dependency| dependency.name.as_str())
            .collect();
        if dependencies.is_empty() {
            println!("{}", node.name());
        } else {
            println!("{} <- {}", node.name(), dependencies.join(", "));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RuntimeEventSink::default(), None);
    }

    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_description(&event.kind)
    );
}

fn event_description(kind: &RuntimeEventKind) -> String {
    match kind {
        RuntimeEventKind::Run(RunEvent::Started { node_count, .. }) => {
            format!("run started ({node_count} nodes)")
        }
        RuntimeEventKind::Run(RunEvent::Finished { status, .. }) => {
            format!("run finished: {status}")
        }
        RuntimeEventKind::Node(NodeEvent::Started { node, .. }) => format!("{node} started"),
        RuntimeEventKind::Node(NodeEvent::Succeeded { node, .. }) => format!("{node} succeeded"),
        RuntimeEventKind::Node(NodeEvent::Failed { node, reason, .. }) => {
            format!("{node} failed: {reason}")
        }
        RuntimeEventKind::Node(NodeEvent::Skipped { node, reason, .. }) => {
            format!("{node} skipped: {reason}")
        }
        RuntimeEventKind::Node(NodeEvent::Materialized { node, status, .. }) => {
            format!("{node} materialized ({status})")
        }
        RuntimeEventKind::Node(NodeEvent::Reused { node, .. }) => {
            format!("{node} reused from an earlier attempt")
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("status: {}", summary.status);
    println!("nodes: {}", summary.order.len());
    let failed = summary.failed_nodes();
    if !failed.is_empty() {
        println!("failed: {}", failed.join(", "));
    }
    let skipped = summary.skipped_nodes();
    if !skipped.is_empty() {
        println!("skipped: {}", skipped.join(", "));
    }
    for node in failed {
        if let Some(reason) = summary.outcome(node).and_then(|outcome| outcome.reason()) {
            println!("failure_reason[{node}]: {reason}");
        }
    }
}

fn print_run_record(record: &RunRecord) {
    println!("run_id: {}", record.run_id);
    println!("status: {}", record.status);
    println!("started_at: {}", record.started_at);
    println!(
        "finished_at: {}",
        record.finished_at.as_deref().unwrap_or("<in_progress>")
    );
    for (node, state) in &record.nodes {
        match state.reason.as_deref() {
            Some(reason) => println!("  {node}: {} ({reason})", state.status),
            None => println!("  {node}: {}", state.status),
        }
    }
}

fn exit_code_for_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Failed | RunStatus::Cancelled => ExitCode::from(2),
        RunStatus::Running => ExitCode::from(1),
    }
}
