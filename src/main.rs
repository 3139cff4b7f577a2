use anyhow::Result;
use clap::Parser;
use driver_telemetry::{
    AgentConfig, AgentDeps, AgentHandle, DriverAgent, HttpBackend, LogNotifier, LogRenderer,
    SimulatedLocationService, WsTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug)]
#[command(name = "driver_agent")]
#[command(about = "Bus driver telemetry agent - location reporting, trip control and server push", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    /// Vehicle identifier (overrides config)
    #[arg(long)]
    bus_id: Option<String>,

    /// Session cookie header, including csrftoken
    #[arg(long)]
    cookie: Option<String>,

    /// Start a trip on launch
    #[arg(long)]
    start_trip: bool,

    /// Start tracking on launch without a trip
    #[arg(long)]
    track: bool,

    /// Simulated route start latitude
    #[arg(long, default_value = "12.9716")]
    start_lat: f64,

    /// Simulated route start longitude
    #[arg(long, default_value = "77.5946")]
    start_lng: f64,

    /// Simulated fix interval in milliseconds
    #[arg(long, default_value = "1000")]
    fix_interval_ms: u64,

    /// Read driver commands from stdin (start, end, emergency, track, stop,
    /// sample, issue <text>, status)
    #[arg(long)]
    console: bool,
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(bus_id) = &args.bus_id {
        config.bus_id = bus_id.clone();
    }
    if let Some(cookie) = &args.cookie {
        config.cookie = cookie.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn console(agent: AgentHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "start" => agent.start_trip()?,
            "end" => agent.end_trip()?,
            "emergency" => agent.emergency_stop()?,
            "track" => agent.start_tracking()?,
            "stop" => agent.stop_tracking()?,
            "issue" => agent.report_issue(rest)?,
            "sample" => match agent.sample_once().await {
                Ok(sample) => log::info!("sample: {}", serde_json::to_string(&sample)?),
                Err(e) => log::warn!("sample failed: {}", e),
            },
            "status" => {
                let snapshot = agent.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            "" => {}
            other => log::warn!("unknown command: {}", other),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    log::info!("Driver agent starting");
    log::info!("  Bus: {}", config.bus_id);
    log::info!("  Backend: {}", config.base_url);
    log::info!("  Duration: {} seconds (0=until Ctrl-C)", args.duration);

    let deps = AgentDeps {
        backend: Arc::new(HttpBackend::new(&config)?),
        location: Arc::new(SimulatedLocationService::new(
            args.start_lat,
            args.start_lng,
            Duration::from_millis(args.fix_interval_ms),
        )),
        transport: Arc::new(WsTransport),
        notifier: Arc::new(LogNotifier),
        renderer: Arc::new(LogRenderer),
    };
    let (agent, task) = DriverAgent::spawn(&config, deps)?;

    if args.start_trip {
        agent.start_trip()?;
    } else if args.track {
        agent.start_tracking()?;
    }
    if args.console {
        let handle = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = console(handle).await {
                log::error!("console stopped: {}", e);
            }
        });
    }

    if args.duration > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("Interrupted, stopping..."),
            _ = sleep(Duration::from_secs(args.duration)) => log::info!("Duration reached, stopping..."),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        log::info!("Interrupted, stopping...");
    }

    let snapshot = agent.snapshot().await?;
    log::info!("Final state:\n{}", serde_json::to_string_pretty(&snapshot)?);
    agent.shutdown().await?;
    task.await?;
    Ok(())
}
