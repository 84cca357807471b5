use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use healthbus::config::BusConfig;
use healthbus::protocol::{Reading, TelemetryMessage};
use healthbus::scheduler::{CycleReport, PollOutcome};
use healthbus::sim::Simulation;
use healthbus::telemetry::TelemetryHistory;

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> CliResult {
    let matches = App::new("healthbus")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Equipment Health Monitoring Team")
        .about("Equipment health bus tools: telemetry decoding, configuration, simulated polling")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Bus configuration file (TOML); defaults to the built-in two-facility bus")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log bus activity to stderr")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode one telemetry line")
                .arg(
                    Arg::with_name("line")
                        .help("Line as received, e.g. \"1A78.45 B83.82 K0.13,-0.39,-9.81 U14.41\"")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("Inspect bus configuration")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("check").about("Validate the configuration"))
                .subcommand(SubCommand::with_name("show").about("Print the effective configuration"))
                .subcommand(SubCommand::with_name("default").about("Print the built-in configuration")),
        )
        .subcommand(
            SubCommand::with_name("poll")
                .about("Run poll cycles against a simulated bus")
                .arg(
                    Arg::with_name("cycles")
                        .short("n")
                        .long("cycles")
                        .value_name("N")
                        .takes_value(true)
                        .default_value("5")
                        .validator(|v| match v.parse::<u64>() {
                            Ok(n) if n > 0 => Ok(()),
                            _ => Err("cycles must be a positive number".into()),
                        }),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("SEED")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("silent")
                        .long("silent")
                        .value_name("ADDRESS")
                        .help("Leave a configured peripheral off the bus")
                        .takes_value(true)
                        .multiple(true),
                ),
        )
        .get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .init();
    }

    let format = matches.value_of("format").unwrap_or("table");
    match matches.subcommand() {
        ("decode", Some(sub)) => handle_decode(sub, &matches, format),
        ("config", Some(sub)) => handle_config(sub, &matches),
        ("poll", Some(sub)) => handle_poll(sub, &matches, format),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            Ok(())
        }
    }
}

fn load_config(matches: &ArgMatches<'_>) -> Result<BusConfig, Box<dyn std::error::Error>> {
    Ok(match matches.value_of("config") {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::default(),
    })
}

fn handle_decode(sub: &ArgMatches<'_>, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let config = load_config(matches)?;
    let decoder = healthbus::TelemetryDecoder::new(config.addresses());
    let line = sub.value_of("line").unwrap_or_default();

    match decoder.decode(line) {
        Ok(message) => {
            match format {
                "json" => println!("{}", serde_json::to_string_pretty(&message)?),
                "compact" => println!("{}", message),
                _ => print_message(&message),
            }
            Ok(())
        }
        Err(e) => {
            match format {
                "json" => println!("{}", serde_json::to_string_pretty(&e)?),
                _ => println!("{} {}", "rejected:".bright_red(), e),
            }
            Err(e.into())
        }
    }
}

fn handle_config(sub: &ArgMatches<'_>, matches: &ArgMatches<'_>) -> CliResult {
    match sub.subcommand() {
        ("check", _) => {
            let config = load_config(matches)?;
            let order = config.poll_order()?;
            println!("{} configuration is valid", "OK".bright_green());
            println!(
                "  {} peripheral(s), poll order {:?}, drain policy {:?}",
                config.peripherals.len(),
                order.as_slice().iter().map(|a| a.value()).collect::<Vec<_>>(),
                config.bus.drain_policy
            );
            for peripheral in &config.peripherals {
                if !order.contains(peripheral.address) {
                    println!(
                        "  {} {} is configured but never polled",
                        "note:".yellow(),
                        peripheral.label()
                    );
                }
            }
        }
        ("show", _) => print!("{}", load_config(matches)?.to_toml()?),
        ("default", _) => print!("{}", BusConfig::default().to_toml()?),
        _ => println!("{}", "Config subcommand required. Use 'healthbus config --help'.".yellow()),
    }
    Ok(())
}

fn handle_poll(sub: &ArgMatches<'_>, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let config = load_config(matches)?;
    let cycles: u64 = sub.value_of("cycles").unwrap_or("5").parse()?;
    let seed: u64 = sub.value_of("seed").unwrap_or("0").parse()?;

    let mut builder = Simulation::builder(config).seed(seed);
    for value in sub.values_of("silent").into_iter().flatten() {
        let address = value
            .parse::<u8>()
            .ok()
            .and_then(healthbus::PeripheralAddress::new)
            .ok_or_else(|| format!("invalid peripheral address `{}`", value))?;
        builder = builder.silent(address);
    }
    let mut sim = builder.build()?;

    for _ in 0..cycles {
        let report = sim.run_cycle();
        match format {
            "json" => println!("{}", serde_json::to_string(&report)?),
            "compact" => print_compact(&report),
            _ => print_report(&report),
        }
    }

    if format == "table" {
        print_summary(&sim);
    }
    Ok(())
}

fn print_message(message: &TelemetryMessage) {
    println!(
        "{} {}",
        "Peripheral".bright_blue().bold(),
        message.address().to_string().bright_white()
    );
    if message.is_empty() {
        println!("  {}", "(no devices reported)".dimmed());
    }
    for field in message.fields() {
        println!(
            "  {} {:<13} {}",
            field.tag.to_string().bright_cyan(),
            field.tag.class().to_string(),
            format_reading(&field.reading)
        );
    }
}

fn format_reading(reading: &Reading) -> ColoredString {
    match reading {
        Reading::Unavailable => "unavailable".bright_red(),
        available => available.to_string().bright_green(),
    }
}

fn print_compact(report: &CycleReport) {
    for result in &report.results {
        match &result.outcome {
            PollOutcome::Decoded(message) => println!("{}", message),
            PollOutcome::Unresponsive => println!("{} -", result.address),
            PollOutcome::Malformed(e) => println!("{} ! {}", result.address, e),
        }
    }
}

fn print_report(report: &CycleReport) {
    println!(
        "{} {} {}",
        "Cycle".bright_blue().bold(),
        report.cycle.to_string().bright_white(),
        format!("(t={} ms, {} ms)", report.started_at_ms, report.elapsed_ms).dimmed()
    );
    for result in &report.results {
        match &result.outcome {
            PollOutcome::Decoded(message) => {
                println!("  {} {} {}", result.address, "OK".bright_green(), message);
            }
            PollOutcome::Unresponsive => {
                println!("  {} {}", result.address, "NO REPLY".bright_red());
            }
            PollOutcome::Malformed(e) => {
                println!("  {} {} {}", result.address, "BAD".yellow(), e);
            }
        }
    }
}

fn print_summary(sim: &Simulation) {
    let stats = sim.scheduler().get_stats();
    println!();
    println!("{}", "Summary".bright_blue().bold());
    println!(
        "  polls {}  replies {}  timeouts {}  malformed {}",
        stats.total_polls,
        stats.total_replies.to_string().bright_green(),
        stats.total_timeouts.to_string().bright_red(),
        stats.total_malformed.to_string().yellow()
    );

    let overlaps = sim.overlaps();
    if overlaps.is_empty() {
        println!("  bus contention: {}", "none".bright_green());
    } else {
        println!("  bus contention: {}", format!("{} overlap(s)", overlaps.len()).bright_red());
    }

    print_history(sim.history(), sim.config());
}

fn print_history(history: &TelemetryHistory, config: &BusConfig) {
    for peripheral in &config.peripherals {
        let tags: Vec<_> = history.tags(peripheral.address).collect();
        if tags.is_empty() {
            continue;
        }
        println!("  {}", peripheral.label().bright_white());
        for tag in tags {
            let samples: Vec<_> = history.series(peripheral.address, tag).collect();
            let available = samples.iter().filter(|s| s.reading.is_available()).count();
            if let Some(latest) = samples.last() {
                println!(
                    "    {} latest {} ({} of {} samples available)",
                    tag.to_string().bright_cyan(),
                    format_reading(&latest.reading),
                    available,
                    samples.len()
                );
            }
        }
    }
}
