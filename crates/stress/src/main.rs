use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stress_core::{Plan, Report, StepConfig, StressError, Task, TaskConfig, TransactionResult};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "stress")]
#[command(about = "HTTP load generator with per-phase latency breakdown")]
#[command(
    after_help = "Transactions: stress [options] --enable-tran \
    'http://host/login,m:post,b:user=demo' 'http://host/home,thinkTime:2'"
)]
struct Args {
    /// Target URL; several URLs with --enable-tran form one transaction
    urls: Vec<String>,

    /// Load task and steps from a TOML plan; flags override its [task] table
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Total number of iterations to run
    #[arg(short = 'n', long)]
    number: Option<u64>,

    /// Number of parallel workers
    #[arg(short = 'c', long)]
    concurrency: Option<u64>,

    /// Run for this many seconds instead of a fixed number of iterations
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Per-request timeout in seconds, 0 for none
    #[arg(short = 't', long, default_value = "20")]
    timeout: u64,

    /// HTTP method
    #[arg(short = 'm', long, default_value = "GET")]
    method: String,

    /// Header sent with every request, e.g. -H "Accept: text/html" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short = 'b', long)]
    body: Option<String>,

    /// Request body read from a file
    #[arg(short = 'B', long)]
    body_file: Option<PathBuf>,

    /// HTTP proxy as host:port
    #[arg(short = 'x', long)]
    proxy: Option<String>,

    /// Directory for report.txt and per-URL CSV files
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Host header override
    #[arg(long)]
    host: Option<String>,

    /// Negotiate HTTP/2 over TLS
    #[arg(long)]
    h2: bool,

    /// Pause after each request, in seconds
    #[arg(long)]
    think_time: Option<u64>,

    #[arg(long)]
    disable_compression: bool,

    /// Open a new connection for every request
    #[arg(long)]
    disable_keepalive: bool,

    #[arg(long)]
    disable_redirects: bool,

    /// Treat every URL argument as one step of a transaction
    #[arg(long)]
    enable_tran: bool,

    /// Print the latency percentile table
    #[arg(long)]
    latency: bool,

    /// Print the report as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (config, steps) = build_run(&args)?;
    let percentiles = config.percentiles;

    info!(
        "Running {} step(s) against {}",
        steps.len(),
        steps.first().map(|s| s.url.as_str()).unwrap_or_default()
    );

    let mut task = Task::new(config);
    if args.json {
        task = task.with_report_handler(
            move |results: &[TransactionResult], elapsed: Duration| {
                let report = Report::build(results, elapsed, percentiles);
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!("Failed to encode report: {}", e),
                }
            },
        );
    }

    match task.run_transaction_async(steps).await {
        Ok(outcome) => {
            info!("Completed {} iterations", outcome.results.len());
            Ok(())
        }
        Err(StressError::Interrupted { completed }) => {
            warn!("Interrupted after {} iterations", completed);
            std::process::exit(1);
        }
        Err(e) => Err(e).context("Load test failed"),
    }
}

fn build_run(args: &Args) -> Result<(TaskConfig, Vec<StepConfig>)> {
    let mut plan = match &args.plan {
        Some(path) => Plan::from_file(path)
            .with_context(|| format!("Failed to load plan from {:?}", path))?,
        None => Plan::default(),
    };
    apply_task_flags(&mut plan.task, args)?;

    if !args.urls.is_empty() {
        if args.urls.len() > 1 && !args.enable_tran {
            anyhow::bail!("Several URLs form a transaction, pass --enable-tran");
        }
        let mut steps = Vec::with_capacity(args.urls.len());
        for input in &args.urls {
            let step = if args.enable_tran {
                parse_compact_step(input, &args.method)?
            } else {
                let mut step = StepConfig::new(input.clone()).method(args.method.clone());
                step.body = args.body.clone();
                step.body_file = args.body_file.clone();
                step
            };
            steps.push(step);
        }
        plan.steps = steps;
    }
    if plan.steps.is_empty() {
        anyhow::bail!("No target URL given, pass a URL or --plan");
    }

    plan.load_bodies(|path: &Path| std::fs::read(path))?;
    Ok((plan.task, plan.steps))
}

fn apply_task_flags(task: &mut TaskConfig, args: &Args) -> Result<()> {
    if let Some(number) = args.number {
        task.number = number;
        task.duration_ms = 0;
    }
    if let Some(seconds) = args.duration {
        task.duration_ms = seconds * 1000;
        task.number = 0;
    }
    if let Some(concurrency) = args.concurrency {
        task.concurrency = concurrency;
    }
    if args.plan.is_none() || args.timeout != 20 {
        task.timeout_ms = args.timeout * 1000;
    }
    if let Some(seconds) = args.think_time {
        task.think_time_ms = seconds * 1000;
    }
    for header in &args.headers {
        let (name, value) = parse_header_flag(header)?;
        task.headers.insert(name, value);
    }
    if args.proxy.is_some() {
        task.proxy.clone_from(&args.proxy);
    }
    if args.host.is_some() {
        task.host.clone_from(&args.host);
    }
    if args.output.is_some() {
        task.output.clone_from(&args.output);
    }
    task.h2 |= args.h2;
    task.disable_compression |= args.disable_compression;
    task.disable_keepalive |= args.disable_keepalive;
    task.disable_redirects |= args.disable_redirects;
    task.percentiles |= args.latency;
    Ok(())
}

/// Splits `Name: value`.
fn parse_header_flag(input: &str) -> Result<(String, String)> {
    let (name, value) = input
        .split_once(':')
        .with_context(|| format!("Header must look like 'Name: value', got {:?}", input))?;
    let name = name.trim();
    let value = value.trim();
    if name.is_empty() || value.is_empty() {
        anyhow::bail!("Header must look like 'Name: value', got {:?}", input);
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parses `url,m:post,b:body,B:file,x:proxy,thinkTime:2`.
fn parse_compact_step(input: &str, default_method: &str) -> Result<StepConfig> {
    let mut parts = input.split(',');
    let url = parts.next().unwrap_or_default().trim();
    if url.is_empty() {
        anyhow::bail!("Missing URL in {:?}", input);
    }

    let mut step = StepConfig::new(url).method(default_method);
    for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once(':')
            .with_context(|| format!("Expected key:value, got {:?} in {:?}", part, input))?;
        match key {
            "m" => step.method = value.to_string(),
            "b" => step.body = Some(value.to_string()),
            "B" => step.body_file = Some(PathBuf::from(value)),
            "x" => step.proxy = Some(value.to_string()),
            "thinkTime" => {
                let seconds: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid thinkTime {:?} in {:?}", value, input))?;
                step.think_time_ms = Some(seconds * 1000);
            }
            other => anyhow::bail!("Unknown option {:?} in {:?}", other, input),
        }
    }
    Ok(step)
}
