//! Application definition.

extern crate simplelog;

use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;

use fmubridge_core::{AddressEntry, AddressResolver, BridgeConfig, ValueKind};
use fmubridge_net::{BridgeProtocol, CancelToken, ModelInstance};

use crate::mock::{MockConfig, MockWorker};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let app = App::new("fmubridge")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Inspect address documents and drive co-simulation workers.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))

        // resolve subcommand
        .subcommand(SubCommand::with_name("resolve")
            .display_order(10)
            .about("Resolve variable names against address documents")
            .arg(Arg::with_name("path")
                .required(true)
                .value_name("path")
                .help("Address document or directory holding them"))
            .arg(Arg::with_name("names")
                .multiple(true)
                .value_name("name")
                .help("Names to resolve, lists all entries if omitted"))
            .arg(Arg::with_name("multiple")
                .long("multiple")
                .short("m")
                .help("Prefix keys with the document name"))
            .arg(Arg::with_name("format")
                .long("format")
                .short("f")
                .takes_value(true)
                .possible_values(&["plain", "toml"])
                .default_value("plain")
                .help("Output format")))

        // step subcommand
        .subcommand(SubCommand::with_name("step")
            .display_order(20)
            .about("Connect to a worker and advance it")
            .arg(Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .value_name("path")
                .help("Path to the bridge configuration file"))
            .arg(Arg::with_name("model")
                .long("model")
                .takes_value(true)
                .value_name("path")
                .help("Model root, steps a full instance with value exchange"))
            .arg(Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .help("Override the worker host"))
            .arg(Arg::with_name("port")
                .long("port")
                .short("p")
                .takes_value(true)
                .help("Override the step channel port"))
            .arg(Arg::with_name("count")
                .long("count")
                .short("n")
                .takes_value(true)
                .default_value("10")
                .help("Number of steps to take"))
            .arg(Arg::with_name("size")
                .long("size")
                .short("s")
                .takes_value(true)
                .default_value("0.01")
                .help("Step size in seconds")))

        // mock-worker subcommand
        .subcommand(SubCommand::with_name("mock-worker")
            .display_order(30)
            .about("Run a stand-in worker acknowledging steps")
            .arg(Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .default_value(fmubridge_core::LOCAL_HOST))
            .arg(Arg::with_name("port")
                .long("port")
                .short("p")
                .takes_value(true)
                .default_value(fmubridge_core::DEFAULT_TICK_PORT))
            .arg(Arg::with_name("data-port")
                .long("data-port")
                .takes_value(true)
                .help("Also serve the data channel on this port"))
            .arg(Arg::with_name("reset-every")
                .long("reset-every")
                .short("r")
                .takes_value(true)
                .value_name("steps")
                .help("Request a reset every n steps")));

    app
}

pub fn init() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("resolve", Some(m)) => start_resolve(m),
        ("step", Some(m)) => start_step(m),
        ("mock-worker", Some(m)) => start_mock_worker(m),
        _ => Ok(()),
    }
}

#[derive(Serialize)]
struct Listing<'a> {
    entry: Vec<&'a AddressEntry>,
}

fn start_resolve(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let path = PathBuf::from(matches.value_of("path").unwrap_or("."));
    let mut resolver = AddressResolver::new();
    resolver.set_multiple(matches.is_present("multiple"));
    if path.is_dir() {
        resolver.load_dir(&path)?;
    } else {
        resolver.load(&path)?;
    }

    let names: Vec<&str> = matches
        .values_of("names")
        .map(|v| v.collect())
        .unwrap_or_default();
    let toml_output = matches.value_of("format") == Some("toml");

    if names.is_empty() {
        let mut entries = resolver.entries().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        return print_entries(&entries, toml_output);
    }

    let mut resolved = Vec::new();
    let mut missing = 0;
    for name in &names {
        match resolver.resolve(name) {
            Some(entry) => resolved.push(entry),
            None => {
                missing += 1;
                match resolver.suggest(name) {
                    Some(hint) => println!(
                        "{} `{}` not found, did you mean `{}`?",
                        "warning:".yellow(),
                        name,
                        hint
                    ),
                    None => println!("{} `{}` not found", "warning:".yellow(), name),
                }
            }
        }
    }
    print_entries(&resolved.iter().map(|e| e.as_ref()).collect::<Vec<_>>(), toml_output)?;
    if missing > 0 {
        return Err(Error::msg(format!("{} of {} names didn't resolve", missing, names.len())));
    }
    Ok(())
}

fn print_entries(entries: &[&AddressEntry], toml_output: bool) -> Result<()> {
    if toml_output {
        let listing = Listing {
            entry: entries.to_vec(),
        };
        print!("{}", toml::to_string(&listing)?);
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<40} {:#012x} offset {:<6} size {:<6}{}",
            entry.name.bold(),
            entry.address,
            entry.offset,
            entry.size,
            if entry.is_array {
                format!(" [{} x {}]", entry.element_count, entry.element_size)
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn start_step(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let mut config = match matches.value_of("config") {
        Some(path) => BridgeConfig::from_path(Path::new(path))
            .with_context(|| format!("failed reading config at {}", path))?,
        None => BridgeConfig::default(),
    };
    if let Some(host) = matches.value_of("host") {
        config.bridge.host = host.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.bridge.port = port.to_string();
    }
    let count = matches.value_of("count").unwrap_or("10").parse::<u64>()?;
    let size = matches.value_of("size").unwrap_or("0.01").parse::<f64>()?;

    match matches.value_of("model") {
        Some(root) => step_instance(Path::new(root), config, count, size),
        None => step_bridge(config, count, size),
    }
}

fn cancel_on_interrupt(cancel: &CancelToken) -> Result<()> {
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        token.cancel();
    })
    .context("failed setting Ctrl-C handler")?;
    Ok(())
}

fn step_bridge(config: BridgeConfig, count: u64, size: f64) -> Result<()> {
    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel)?;

    let mut bridge = BridgeProtocol::from_config(&config.bridge, cancel.clone());
    bridge.initialize(&config.bridge.host, &config.bridge.port)?;
    let micros = (size * 1e6).round() as u64;
    for n in 0..count {
        if cancel.is_cancelled() {
            println!("Interrupted after {} steps", n);
            break;
        }
        let ack = bridge.step(micros)?;
        info!("step {}: {:?}", n + 1, ack);
    }
    bridge.close();
    Ok(())
}

fn step_instance(root: &Path, config: BridgeConfig, count: u64, size: f64) -> Result<()> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    let instance = ModelInstance::instantiate(&name, root, config)?;
    let cancel = instance.cancel_token();
    cancel_on_interrupt(&cancel)?;

    instance.enter_initialization_mode()?;
    instance.exit_initialization_mode()?;
    let mut time = 0.;
    for n in 0..count {
        if cancel.is_cancelled() {
            println!("Interrupted after {} steps", n);
            break;
        }
        instance.do_step(time, size)?;
        time += size;
    }

    for var in &instance.description().variables {
        let slot = match instance.slot(var.kind, var.reference, 0) {
            Ok(slot) => slot,
            Err(_) => continue,
        };
        if slot.kind() == ValueKind::Binary {
            continue;
        }
        println!("{:<40} {:?}", var.name.bold(), slot.value);
    }
    println!("t = {}", instance.current_time()?);
    instance.terminate()?;
    Ok(())
}

fn start_mock_worker(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let config = MockConfig {
        host: matches
            .value_of("host")
            .unwrap_or(fmubridge_core::LOCAL_HOST)
            .to_string(),
        port: matches
            .value_of("port")
            .unwrap_or(fmubridge_core::DEFAULT_TICK_PORT)
            .parse()?,
        reset_every: match matches.value_of("reset-every") {
            Some(n) => Some(n.parse()?),
            None => None,
        },
        data_port: match matches.value_of("data-port") {
            Some(p) => Some(p.parse()?),
            None => None,
        },
    };
    let worker = MockWorker::bind(config)?;
    println!("Now listening on {}", worker.local_addr()?);
    if let Some(addr) = worker.data_addr() {
        println!("Serving data channel on {}", addr);
    }

    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel)?;
    let steps = worker.run(&cancel)?;
    println!("Initiating graceful shutdown... ({} steps served)", steps);
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed).is_err() {
        eprintln!("logger already initialized");
    }
}
