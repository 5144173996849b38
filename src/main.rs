//! tinyredis server entry point.
//!
//! Sets up logging and the registry, installs the shutdown signals, spawns
//! one reactor per hardware thread, and saves every database once the
//! reactors drain.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use tinyredis::scheduler;
use tinyredis::storage::Registry;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
struct Config {
    /// Host to bind to
    host: Ipv4Addr,
    /// Port to listen on
    port: u16,
    /// Reactor thread count
    workers: usize,
    /// Snapshot directory
    data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST,
            port: tinyredis::DEFAULT_PORT,
            workers: num_cpus::get().max(1),
            data_dir: tinyredis::DEFAULT_DATA_DIR.to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = take_value(&args, i, "--host").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid host address");
                        std::process::exit(1);
                    });
                }
                "--port" | "-p" => {
                    config.port = take_value(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                }
                "--workers" | "-w" => {
                    config.workers = take_value(&args, i, "--workers")
                        .parse()
                        .ok()
                        .filter(|&workers| workers >= 1)
                        .unwrap_or_else(|| {
                            eprintln!("Error: invalid worker count");
                            std::process::exit(1);
                        });
                }
                "--data-dir" | "-d" => {
                    config.data_dir = take_value(&args, i, "--data-dir").to_string();
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("tinyredis version {}", tinyredis::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 2;
        }

        config
    }
}

/// Returns the value following a flag, exiting with a message if absent.
fn take_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
tinyredis - A Multi-Database In-Memory Key-Value Store

USAGE:
    tinyredis-server [OPTIONS]

OPTIONS:
    -h, --host <HOST>        Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>        Port to listen on (default: {port})
    -w, --workers <COUNT>    Reactor threads (default: one per hardware thread)
    -d, --data-dir <DIR>     Snapshot directory (default: data)
    -v, --version            Print version information
        --help               Print this help message

EXAMPLES:
    tinyredis-server                      # Start on 127.0.0.1:{port}
    tinyredis-server --port 7000          # Start on port 7000
    tinyredis-server --workers 2          # Two reactor threads

CONNECTING:
    Use the bundled client:
    $ tinyredis-cli
    tinyRedis 127.0.0.1:{port}> SET name "sol"
    "OK"
    tinyRedis 127.0.0.1:{port}> GET name
    "sol"
"#,
        port = tinyredis::DEFAULT_PORT
    );
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    // SIGINT/SIGTERM clear the run flag; every reactor notices at the top of
    // its loop and enters orderly shutdown.
    scheduler::install_signal_handlers()?;

    // Load every database snapshot (corrupt files are fatal here).
    let registry = Arc::new(Registry::open(&config.data_dir)?);

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        "starting reactors"
    );

    let mut workers = Vec::with_capacity(config.workers);
    for slot in 0..config.workers {
        let registry = Arc::clone(&registry);
        let (host, port) = (config.host, config.port);
        let handle = thread::Builder::new()
            .name(format!("reactor-{}", slot))
            .spawn(move || scheduler::run_worker(registry, host, port))?;
        workers.push(handle);
    }

    let mut failed = false;
    for handle in workers {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "reactor failed");
                failed = true;
            }
            Err(_) => {
                error!("reactor panicked");
                failed = true;
            }
        }
    }

    // Persist every namespace now that no reactor can mutate them.
    registry.save_all()?;
    info!("server shutdown complete");

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
