// Copyright 2020 Joyent, Inc.

//! This module provides the interface for creating sio-rpc servers.
//!
//! `make_task` takes a connected socket and a handler. The handler receives
//! each request frame and returns the frames to write back, usually a single
//! `Frame::response`. A handler error leaves the request unanswered so the
//! caller's own timeout takes over.

use std::io::Error;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, trace, Drain, Logger};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::{Frame, RpcCodec};

/// Serve requests arriving on `socket` until the peer disconnects or sends
/// something that cannot be decoded.
pub async fn make_task<F>(
    socket: TcpStream,
    response_handler: F,
    log: Option<&Logger>,
) where
    F: Fn(&Frame, &Logger) -> Result<Vec<Frame>, Error>,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    let (mut tx, mut rx) = Framed::new(socket, RpcCodec::default()).split();

    while let Some(item) = rx.next().await {
        let request = match item {
            Ok(request) => request,
            Err(e) => {
                error!(log, "failed to decode request"; "err" => %e);
                break;
            }
        };

        trace!(log, "handling request"; "call_id" => request.id,
            "type" => request.msg_type);

        match response_handler(&request, &log) {
            Ok(responses) => {
                for response in responses {
                    if let Err(e) = tx.send(response).await {
                        error!(log, "failed to write response"; "err" => %e);
                        return;
                    }
                }
            }
            Err(e) => {
                error!(log, "request handler failed";
                    "call_id" => request.id, "err" => %e);
            }
        }
    }

    debug!(log, "connection closed");
}
