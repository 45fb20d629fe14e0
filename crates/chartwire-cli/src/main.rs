//! chartwire: stream chart bars from the command line
//!
//! Connects, resolves one symbol, creates a series and prints its bars as
//! JSON lines. With `--follow` it keeps printing every batch until Ctrl+C.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chartwire::{metrics, Bar, Chart, Series, Session, SessionConfig, Study, StudySpec};

#[derive(Parser, Debug)]
#[command(name = "chartwire")]
#[command(about = "Stream chart bars for one symbol")]
struct Args {
    /// Ticker, e.g. BTCUSDT
    #[arg(short, long)]
    symbol: String,

    /// Exchange, e.g. BINANCE
    #[arg(short, long)]
    exchange: String,

    /// Bar timeframe: 1, 5, 60, 1D, 1W, ...
    #[arg(short, long, default_value = "1D")]
    timeframe: String,

    /// Number of historical bars to request
    #[arg(short, long, default_value_t = 300)]
    bars: u32,

    /// Optional YAML session configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Auth token; anonymous when absent
    #[arg(long, env = "TV_TOKEN")]
    token: Option<String>,

    /// Bound every wait on the remote
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Built-in study to attach, e.g. Volume@tv-basicstudies-144
    #[arg(long)]
    study: Option<String>,

    /// Keep printing batches until Ctrl+C
    #[arg(short, long)]
    follow: bool,

    /// Dump Prometheus metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    }
    .apply_env()?;
    if let Some(token) = &args.token {
        config = config.with_token(token.clone());
    }
    if let Some(secs) = args.timeout_secs {
        config.request_timeout_secs = Some(secs);
        config.handshake_timeout_secs = Some(secs);
    }
    config.validate()?;

    let session = Session::connect(config).await?;
    let result = run(&session, &args).await;

    session.close();
    let reason = session.closed().await;
    info!(reason = %reason, "Done");

    if args.metrics {
        eprintln!("{}", metrics::encode_metrics()?);
    }
    result
}

async fn run(session: &Session, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let chart = Chart::create(session)?;
    let symbol = chart.resolve(&args.symbol, &args.exchange).await?;
    info!(
        pro_name = %symbol.info.pro_name,
        instrument_type = %symbol.info.instrument_type,
        "Resolved symbol"
    );

    let series = Series::create(&chart, &symbol, &args.timeframe, args.bars)?;
    let study = match &args.study {
        Some(id) => Some(Study::create(&series, StudySpec::builtin(id.as_str()))?),
        None => None,
    };

    series.ready().await?;
    print_bars("series", &series.history());
    if let Some(study) = &study {
        study.ready().await?;
        print_bars("study", &study.history());
    }

    if !args.follow {
        return Ok(());
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });

    let _series_out = series.on_batch(|batch| print_bars("series", batch));
    let _study_out = study
        .as_ref()
        .map(|study| study.on_batch(|batch| print_bars("study", batch)));

    tokio::select! {
        _ = shutdown_rx.changed() => {}
        reason = session.closed() => warn!(reason = %reason, "Session ended while following"),
    }
    Ok(())
}

fn print_bars(source: &str, bars: &[Bar]) {
    for bar in bars {
        let line = serde_json::json!({
            "source": source,
            "index": bar.index,
            "time": bar.time().map(|t| t.to_rfc3339()),
            "values": bar.values,
        });
        println!("{line}");
    }
}
