// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::fmt;

use slog::{debug, o, Logger};

use crate::request::RequestId;
use crate::sio::{Sio, StreamId, TimerId};

/// The address of a remote RPC endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Endpoint {
        Endpoint {
            host: String::from(host),
            port,
        }
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct UpstreamId(pub u64);

/// One remote endpoint and the state of its current connection.
pub(crate) struct Upstream {
    pub id: UpstreamId,
    pub endpoint: Endpoint,
    /// Present exactly while connected
    pub stream: Option<StreamId>,
    next_call_id: u64,
    /// Calls sent on the current connection and awaiting a response
    pub pending: HashMap<u64, RequestId>,
    pub timer: Option<TimerId>,
    pub log: Logger,
}

impl Upstream {
    pub fn new(id: UpstreamId, endpoint: Endpoint, log: &Logger) -> Upstream {
        let log = log.new(o!("upstream" => endpoint.to_string()));
        Upstream {
            id,
            endpoint,
            stream: None,
            next_call_id: 0,
            pending: HashMap::new(),
            timer: None,
            log,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Attempt a new connection. Every connection starts numbering calls
    /// from zero.
    pub fn connect<S: Sio>(&mut self, sio: &mut S) -> bool {
        match sio.connect(&self.endpoint.host, self.endpoint.port) {
            Ok(stream) => {
                debug!(self.log, "connecting"; "stream" => %stream);
                self.stream = Some(stream);
                self.next_call_id = 0;
                true
            }
            Err(e) => {
                debug!(self.log, "connect failed"; "err" => %e);
                false
            }
        }
    }

    pub fn next_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    /// Close the connection and forget every call sent on it. The orphaned
    /// requests are returned so the caller can clear their ownership.
    pub fn detach<S: Sio>(&mut self, sio: &mut S) -> Vec<RequestId> {
        if let Some(stream) = self.stream.take() {
            debug!(self.log, "closing connection"; "stream" => %stream,
                "pending" => self.pending.len());
            sio.close(stream);
        }
        self.next_call_id = 0;
        self.pending.drain().map(|(_, req)| req).collect()
    }
}
