// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;

use reqtrack::client::{self, ClientError};
use reqtrack::protocol::{RequestId, ServerMessage};

static APP: &'static str = "reqcall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 8080;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for submitting and fetching requests")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 8080)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("data")
                .help("JSON-encoded payload for new work")
                .long("data")
                .takes_value(true)
                .conflicts_with("id")
                .required_unless("id"),
        )
        .arg(
            Arg::with_name("id")
                .help("Identifier of an existing request to fetch")
                .long("id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("wait")
                .help("After submitting, wait for the result to be pushed")
                .long("wait")
                .short("w")
                .takes_value(false),
        )
        .get_matches()
}

fn print(msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to encode message: {}", e),
    }
}

async fn run(matches: &ArgMatches<'_>, addr: SocketAddr) -> Result<(), ClientError> {
    let mut ws = client::connect(addr).await?;

    match matches.value_of("id") {
        Some(id) => client::fetch(&mut ws, &RequestId::from(id)).await?,
        None => {
            let data = value_t!(matches, "data", Value).unwrap_or_else(|e| e.exit());
            client::submit(&mut ws, data).await?
        }
    }

    // The first response answers our message; with --wait, keep reading
    // until the submitted request's result is pushed.
    let wait = matches.is_present("wait") && !matches.is_present("id");
    loop {
        let msg = client::receive(&mut ws).await?;
        print(&msg);
        match msg {
            ServerMessage::Response(r) if !wait || !r.is_pending() => break,
            _ => continue,
        }
    }

    ws.close(None).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });

    if let Err(e) = run(&matches, addr).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
