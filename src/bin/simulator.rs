use clap::{App, Arg};
use healthbus::config::BusConfig;
use healthbus::sim::Simulation;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, warn};

const TELEMETRY_BROADCAST_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("healthbus-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs a simulated health bus and prints decoded telemetry to stdout")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Bus configuration file (TOML)"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print each decoded message as a JSON object instead of its wire line"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("Seed for peripheral timing jitter"),
        )
        .arg(
            Arg::with_name("cycles")
                .short("n")
                .long("cycles")
                .takes_value(true)
                .help("Stop after this many cycles (default: run until Ctrl+C)"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::default(),
    };
    let json = matches.is_present("json");
    let seed: u64 = match matches.value_of("seed") {
        Some(s) => s.parse()?,
        None => 0,
    };
    let cycles: Option<u64> = match matches.value_of("cycles") {
        Some(n) => Some(n.parse()?),
        None => None,
    };

    println!("Equipment Health Bus Simulator");
    println!("==============================");
    for peripheral in &config.peripherals {
        println!(
            "  {} at address {} ({} devices)",
            peripheral.label(),
            peripheral.address,
            peripheral.devices.len()
        );
    }

    let pace = config.timing().cycle_interval;
    let mut sim = Simulation::builder(config).seed(seed).build()?;

    let (telemetry_tx, telemetry_rx) = broadcast::channel::<String>(TELEMETRY_BROADCAST_BUFFER_SIZE);
    let printer = tokio::spawn(async move {
        if let Err(e) = print_telemetry(telemetry_rx).await {
            error!("telemetry output error: {}", e);
        }
    });

    // Cycles run in virtual time; the interval only paces them for viewers.
    let mut interval = time::interval(pace.max(Duration::from_millis(1)));
    let mut completed = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        let report = sim.run_cycle();
        for message in report.decoded() {
            info!("TELEMETRY: {}", message);
            let line = if json {
                serde_json::to_string(message)?
            } else {
                message.to_string()
            };
            // Fails only once the printer has stopped; the log above still has it.
            let _ = telemetry_tx.send(line);
        }
        for address in report.unresponsive() {
            warn!("peripheral {} did not answer in cycle {}", address, report.cycle);
        }
        for (address, e) in report.malformed() {
            warn!("peripheral {} sent a bad reply: {}", address, e);
        }

        let overlaps = sim.overlaps();
        if !overlaps.is_empty() {
            error!("{} overlapping transmit window(s) on the bus", overlaps.len());
        }

        completed += 1;
        if cycles.map_or(false, |limit| completed >= limit) {
            break;
        }
    }

    // Closing the channel lets the printer finish what is queued.
    drop(telemetry_tx);
    printer.await?;

    let stats = sim.scheduler().get_stats();
    println!(
        "Simulator stopped after {} cycles: {} polls, {} replies, {} timeouts, {} malformed",
        stats.cycles, stats.total_polls, stats.total_replies, stats.total_timeouts, stats.total_malformed
    );
    Ok(())
}

async fn print_telemetry(mut telemetry_rx: broadcast::Receiver<String>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    loop {
        match telemetry_rx.recv().await {
            Ok(line) => {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("telemetry output fell behind, skipped {} lines", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
