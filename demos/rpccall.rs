// Copyright 2020 Joyent, Inc.

use std::cell::RefCell;
use std::process;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::task::LocalSet;

use sio_rpc::config::{ClientConfig, UpstreamConfig};
use sio_rpc::reactor::TokioSio;
use sio_rpc::{CallError, Rpc};

static APP: &'static str = "rpccall";
static DEFAULT_UPSTREAM: &'static str = "127.0.0.1:2030";
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RETRIES: u32 = 2;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making an sio-rpc call")
        .version(crate_version!())
        .arg(
            Arg::with_name("upstream")
                .help("IP:PORT of an upstream server, may be repeated (Default: 127.0.0.1:2030)")
                .long("upstream")
                .short("u")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("config")
                .help("JSON client configuration file")
                .long("config")
                .short("c")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("type")
                .help("Message type of the call")
                .long("type")
                .short("t")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("body")
                .help("Request body")
                .long("body")
                .short("b")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Per-attempt timeout in milliseconds (Default: 1000)")
                .long("timeout")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retries")
                .help("Number of retries after the first attempt (Default: 2)")
                .long("retries")
                .short("r")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log connection activity")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn parse_upstream(s: &str) -> UpstreamConfig {
    let mut parts = s.rsplitn(2, ':');
    let port = parts.next().and_then(|p| p.parse::<u16>().ok());
    let host = parts.next();
    match (host, port) {
        (Some(host), Some(port)) => UpstreamConfig {
            host: String::from(host),
            port,
        },
        _ => {
            eprintln!("Failed to parse upstream as IP:PORT: {}", s);
            process::exit(1)
        }
    }
}

fn main() {
    let matches = parse_opts(APP.to_string());

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let mut config = match matches.value_of("config") {
        Some(path) => ClientConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1)
        }),
        None => ClientConfig::default(),
    };
    if let Some(upstreams) = matches.values_of("upstream") {
        config.upstreams.extend(upstreams.map(parse_upstream));
    }
    if config.upstreams.is_empty() {
        config.upstreams.push(parse_upstream(DEFAULT_UPSTREAM));
    }

    let msg_type = value_t!(matches, "type", u32).unwrap_or_else(|e| e.exit());
    let body = String::from(matches.value_of("body").unwrap_or_else(|| {
        eprintln!("Failed to parse body argument as String");
        process::exit(1)
    }));
    let timeout =
        value_t!(matches, "timeout", u64).unwrap_or(DEFAULT_TIMEOUT_MS);
    let retries = value_t!(matches, "retries", u32).unwrap_or(DEFAULT_RETRIES);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to start runtime: {}", e);
            process::exit(1)
        });
    let local = LocalSet::new();

    let result: Result<Vec<u8>, CallError> = local.block_on(&runtime, async {
        let (sio, mut driver) = TokioSio::new(Some(&log));
        let rpc = Rpc::new(sio, Some(&log));
        let mut client = rpc.client_with_config(config);

        let outcome = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        if let Err(e) = client.call(
            msg_type,
            Duration::from_millis(timeout),
            retries,
            body.as_bytes(),
            move |_client, result| {
                *slot.borrow_mut() = Some(result.map(|b| b.to_vec()));
            },
        ) {
            return Err(e);
        }

        while outcome.borrow().is_none() {
            if !driver.turn(&mut client).await {
                break;
            }
        }
        let result = outcome.borrow_mut().take();
        result.unwrap_or(Err(CallError::Shutdown))
    });

    match result {
        Ok(body) => println!("{}", String::from_utf8_lossy(&body)),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1)
        }
    }
}
