// Copyright 2020 Joyent, Inc.

use std::env;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use sio_rpc::protocol::Frame;
use sio_rpc::server;

const ECHO: u32 = 1;
const DATE: u32 = 2;
const DELAY: u32 = 3;

fn other_error(msg: &str) -> Error {
    Error::new(ErrorKind::Other, String::from(msg))
}

fn echo_handler(
    msg: &Frame,
    mut response: Vec<Frame>,
    log: &Logger,
) -> Result<Vec<Frame>, Error> {
    debug!(log, "handling echo request");
    response.push(Frame::response(msg, msg.body.clone()));
    Ok(response)
}

/// Replies with the current time in milliseconds since the epoch, as an
/// 8-byte big-endian integer.
fn date_handler(
    msg: &Frame,
    mut response: Vec<Frame>,
    log: &Logger,
) -> Result<Vec<Frame>, Error> {
    debug!(log, "handling date request");
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| other_error("System clock is before the epoch"))?;
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, now.as_millis() as u64);
    response.push(Frame::response(msg, Bytes::copy_from_slice(&buf)));
    Ok(response)
}

/// Sleeps for the number of milliseconds given as an 8-byte big-endian body,
/// then echoes it. Useful for exercising client timeouts.
fn delay_handler(
    msg: &Frame,
    mut response: Vec<Frame>,
    log: &Logger,
) -> Result<Vec<Frame>, Error> {
    debug!(log, "handling delay request");
    if msg.body.len() != 8 {
        return Err(other_error("Expected an 8-byte delay in milliseconds"));
    }
    let delay = BigEndian::read_u64(&msg.body);
    thread::sleep(Duration::from_millis(delay));
    response.push(Frame::response(msg, msg.body.clone()));
    Ok(response)
}

fn msg_handler(msg: &Frame, log: &Logger) -> Result<Vec<Frame>, Error> {
    let response: Vec<Frame> = vec![];

    match msg.msg_type {
        ECHO => echo_handler(msg, response, &log),
        DATE => date_handler(msg, response, &log),
        DELAY => delay_handler(msg, response, &log),
        _ => Err(Error::new(
            ErrorKind::Other,
            format!("Unsupported message type: {}", msg.msg_type),
        )),
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args().nth(1).unwrap_or("127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap_or_else(|e| {
        eprintln!("Failed to parse listen address: {}", e);
        std::process::exit(1)
    });

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(root_log, "listening for rpc requests"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let process_log = root_log.new(o!("peer" => peer));
                tokio::spawn(async move {
                    server::make_task(socket, msg_handler, Some(&process_log))
                        .await;
                });
            }
            Err(e) => {
                error!(root_log, "failed to accept socket"; "err" => %e);
            }
        }
    }
}
