// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};

use reqtrack::compute::SimulatedCompute;
use reqtrack::store::{JournalStore, MemoryStore, RequestStore};
use reqtrack::{Config, Server};

static APP: &'static str = "reqserve";
static DEFAULT_LISTEN: &'static str = "127.0.0.1:8080";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Serve resumable requests over WebSocket")
        .version(crate_version!())
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on (Default: 127.0.0.1:8080)")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("journal")
                .help("Journal file for durable request records")
                .long("journal")
                .short("j")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("delay")
                .help("Simulated processing time in milliseconds")
                .long("delay")
                .short("d")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("jitter")
                .help("Random extra processing time in milliseconds")
                .long("jitter")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("burst")
                .help("Messages a connection may send back to back")
                .long("burst")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("refill")
                .help("Milliseconds per admitted message after the burst")
                .long("refill")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("workers")
                .help("Requests processed at the same time")
                .long("workers")
                .short("w")
                .takes_value(true),
        )
        .get_matches()
}

fn config_from(matches: &ArgMatches) -> Config {
    let defaults = Config::default();
    Config {
        bucket_capacity: value_t!(matches, "burst", u32)
            .unwrap_or(defaults.bucket_capacity),
        refill_interval: value_t!(matches, "refill", u64)
            .map(Duration::from_millis)
            .unwrap_or(defaults.refill_interval),
        max_concurrent_work: value_t!(matches, "workers", usize)
            .unwrap_or(defaults.max_concurrent_work),
        ..defaults
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = matches
        .value_of("listen")
        .unwrap_or(DEFAULT_LISTEN)
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!("Failed to parse listen address: {}", e);
            process::exit(1)
        });

    let store: Arc<dyn RequestStore> = match matches.value_of("journal") {
        Some(path) => match JournalStore::open(path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(root_log, "failed to open journal"; "err" => %e);
                process::exit(1)
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let delay = value_t!(matches, "delay", u64).unwrap_or(8000);
    let jitter = value_t!(matches, "jitter", u64).unwrap_or(0);
    let compute = SimulatedCompute::new(Duration::from_millis(delay))
        .with_jitter(Duration::from_millis(jitter));

    let server = Server::new(
        store,
        Arc::new(compute),
        config_from(&matches),
        Some(&root_log),
    );

    let serving = server.clone();
    let listener = tokio::spawn(async move { serving.listen(addr).await });

    tokio::select! {
        res = listener => {
            if let Ok(Err(e)) = res {
                error!(root_log, "server failed"; "err" => %e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(root_log, "interrupted, draining in-flight requests");
            server.shutdown().await;
        }
    }
}
