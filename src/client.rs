// Copyright 2020 Joyent, Inc.

//! The RPC client: an upstream pool, call dispatch and the retry state
//! machine.
//!
//! Every outstanding call is tracked by the client until it completes, and is
//! additionally registered in the pending map of the upstream it was last
//! sent on, keyed by the call id of that connection. Connection failures,
//! protocol errors and mismatched responses never fail a call directly: they
//! only drop the call back to the unassigned state. The call's own timer is
//! the one place that decides between another attempt and final failure.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use slog::{debug, o, trace, warn, Drain, Logger};

use crate::config::ClientConfig;
use crate::protocol::{FrameHeader, FrameParseError, RP_HEADER_SZ};
use crate::request::{CallError, Request, RequestId};
use crate::sio::{Sio, StreamId, TimerId};
use crate::upstream::{Endpoint, Upstream, UpstreamId};

enum TimerTarget {
    Reconnect(UpstreamId),
    Call(RequestId),
}

/// The root object binding clients to an event loop.
pub struct Rpc<S> {
    sio: S,
    log: Logger,
}

impl<S: Sio + Clone> Rpc<S> {
    pub fn new(sio: S, log: Option<&Logger>) -> Rpc<S> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Rpc { sio, log }
    }

    pub fn client(&self) -> Client<S> {
        Client::new(self.sio.clone(), ClientConfig::default(), &self.log)
    }

    /// Create a client and add the upstreams listed in `config`.
    pub fn client_with_config(&self, config: ClientConfig) -> Client<S> {
        let upstreams = config.upstreams.clone();
        let mut client = Client::new(self.sio.clone(), config, &self.log);
        for upstream in upstreams.iter() {
            client.add_upstream(&upstream.host, upstream.port);
        }
        client
    }
}

pub struct Client<S: Sio> {
    sio: S,
    log: Logger,
    config: ClientConfig,
    upstreams: Vec<Upstream>,
    rr_cursor: usize,
    requests: HashMap<RequestId, Request<S>>,
    timers: HashMap<TimerId, TimerTarget>,
    next_upstream_id: u64,
    next_request_id: u64,
    shutting_down: bool,
}

impl<S: Sio> Client<S> {
    fn new(sio: S, config: ClientConfig, log: &Logger) -> Client<S> {
        Client {
            sio,
            log: log.new(o!("component" => "rpc-client")),
            config,
            upstreams: Vec::new(),
            rr_cursor: 0,
            requests: HashMap::new(),
            timers: HashMap::new(),
            next_upstream_id: 0,
            next_request_id: 0,
            shutting_down: false,
        }
    }

    /// Add an upstream and start connecting to it. Adding an address that is
    /// already present does nothing.
    pub fn add_upstream(&mut self, host: &str, port: u16) {
        if self.shutting_down || self.find_endpoint(host, port).is_some() {
            return;
        }

        let id = UpstreamId(self.next_upstream_id);
        self.next_upstream_id += 1;

        let mut upstream = Upstream::new(id, Endpoint::new(host, port), &self.log);
        debug!(upstream.log, "adding upstream");
        upstream.connect(&mut self.sio);

        let interval = self.config.reconnect_interval();
        upstream.timer = Some(self.arm(interval, TimerTarget::Reconnect(id)));
        self.upstreams.push(upstream);
    }

    /// Remove an upstream. Calls in flight on it go back to waiting for
    /// their timers.
    pub fn remove_upstream(&mut self, host: &str, port: u16) {
        let idx = match self.find_endpoint(host, port) {
            Some(idx) => idx,
            None => return,
        };

        if let Some(timer) = self.upstreams[idx].timer.take() {
            self.disarm(timer);
        }
        self.reset_upstream(idx);

        let upstream = self.upstreams.remove(idx);
        debug!(upstream.log, "removed upstream");
    }

    /// Start a call. The body is copied. `callback` runs exactly once: with
    /// the response body, once `retry_times + 1` attempts of `timeout` each
    /// went unanswered, or when the client shuts down.
    pub fn call<F>(
        &mut self,
        msg_type: u32,
        timeout: Duration,
        retry_times: u32,
        body: &[u8],
        callback: F,
    ) -> Result<RequestId, CallError>
    where
        F: FnOnce(&mut Client<S>, Result<&[u8], CallError>) + 'static,
    {
        if self.shutting_down {
            return Err(CallError::Shutdown);
        }

        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        let mut req =
            Request::new(msg_type, body, timeout, retry_times, Box::new(callback));
        req.timer = Some(self.arm(timeout, TimerTarget::Call(id)));
        self.requests.insert(id, req);

        trace!(self.log, "new call"; "request" => %id, "type" => msg_type,
            "len" => body.len());
        self.dispatch(id);
        Ok(id)
    }

    /// Fail every outstanding call and drop every upstream. Calls attempted
    /// from here on are refused.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        for idx in 0..self.upstreams.len() {
            if let Some(timer) = self.upstreams[idx].timer.take() {
                self.disarm(timer);
            }
            self.reset_upstream(idx);
        }
        self.upstreams.clear();

        let mut ids: Vec<RequestId> = self.requests.keys().copied().collect();
        ids.sort();
        debug!(self.log, "shutting down"; "outstanding" => ids.len());
        for id in ids {
            if let Some(req) = self.requests.remove(&id) {
                if let Some(timer) = req.timer {
                    self.disarm(timer);
                }
                (req.callback)(self, Err(CallError::Shutdown));
            }
        }
    }

    /// Parse every complete response in `buf` and drop the consumed bytes.
    /// A trailing partial frame stays in `buf`.
    pub fn on_data(&mut self, stream: StreamId, buf: &mut BytesMut) {
        match self.parse_responses(stream, &buf[..]) {
            Ok(used) => buf.advance(used),
            Err(e) => {
                buf.clear();
                if let Some(idx) = self.find_stream(stream) {
                    warn!(self.upstreams[idx].log,
                        "protocol error, resetting connection"; "err" => %e);
                    self.reset_upstream(idx);
                }
            }
        }
    }

    pub fn on_error(&mut self, stream: StreamId) {
        self.connection_lost(stream, "error");
    }

    pub fn on_close(&mut self, stream: StreamId) {
        self.connection_lost(stream, "closed");
    }

    pub fn on_timer(&mut self, timer: TimerId) {
        match self.timers.remove(&timer) {
            Some(TimerTarget::Reconnect(id)) => self.reconnect_tick(id),
            Some(TimerTarget::Call(id)) => self.call_timeout(id),
            None => trace!(self.log, "ignoring stale timer"; "timer" => %timer),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_connected(&self, host: &str, port: u16) -> bool {
        self.find_endpoint(host, port)
            .map_or(false, |idx| self.upstreams[idx].is_connected())
    }

    /// The number of calls in flight on an upstream
    pub fn pending_count(&self, host: &str, port: u16) -> Option<usize> {
        self.find_endpoint(host, port)
            .map(|idx| self.upstreams[idx].pending.len())
    }

    pub fn pending_requests(
        &self,
        host: &str,
        port: u16,
    ) -> Option<Vec<RequestId>> {
        self.find_endpoint(host, port).map(|idx| {
            let mut ids: Vec<RequestId> =
                self.upstreams[idx].pending.values().copied().collect();
            ids.sort();
            ids
        })
    }

    /// `None` if the call is not outstanding, otherwise the upstream it is
    /// currently in flight on, if any.
    pub fn request_upstream(&self, id: RequestId) -> Option<Option<Endpoint>> {
        self.requests.get(&id).map(|req| {
            req.upstream.and_then(|owner| {
                self.upstreams
                    .iter()
                    .find(|u| u.id == owner)
                    .map(|u| u.endpoint.clone())
            })
        })
    }

    fn find_endpoint(&self, host: &str, port: u16) -> Option<usize> {
        self.upstreams
            .iter()
            .position(|u| u.endpoint.matches(host, port))
    }

    fn find_upstream(&self, id: UpstreamId) -> Option<usize> {
        self.upstreams.iter().position(|u| u.id == id)
    }

    fn find_stream(&self, stream: StreamId) -> Option<usize> {
        self.upstreams.iter().position(|u| u.stream == Some(stream))
    }

    fn arm(&mut self, after: Duration, target: TimerTarget) -> TimerId {
        let timer = self.sio.start_timer(after);
        self.timers.insert(timer, target);
        timer
    }

    fn disarm(&mut self, timer: TimerId) {
        if self.timers.remove(&timer).is_some() {
            self.sio.stop_timer(timer);
        }
    }

    /// Prefer the connected upstream with the fewest calls in flight. When
    /// nothing is connected, take the next upstream in round-robin order and
    /// try to connect it on the spot.
    fn choose_upstream(&mut self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, upstream) in self.upstreams.iter().enumerate() {
            if !upstream.is_connected() {
                continue;
            }
            let pending = upstream.pending.len();
            if best.map_or(true, |(_, min)| pending < min) {
                best = Some((idx, pending));
            }
        }
        if let Some((idx, _)) = best {
            return Some(idx);
        }

        if self.upstreams.is_empty() {
            return None;
        }
        let idx = self.rr_cursor % self.upstreams.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        if self.upstreams[idx].connect(&mut self.sio) {
            Some(idx)
        } else {
            None
        }
    }

    fn dispatch(&mut self, id: RequestId) {
        match self.choose_upstream() {
            Some(idx) => {
                self.send(idx, id);
            }
            None => {
                trace!(self.log, "no upstream available"; "request" => %id)
            }
        }
    }

    /// Write a request to an upstream's connection. On success the request
    /// is in flight on that upstream. On failure the connection is reset and
    /// the request stays unassigned.
    fn send(&mut self, idx: usize, id: RequestId) -> bool {
        let upstream = &mut self.upstreams[idx];
        let stream = match upstream.stream {
            Some(stream) => stream,
            None => return false,
        };
        let req = match self.requests.get_mut(&id) {
            Some(req) => req,
            None => return false,
        };

        let call_id = upstream.next_call_id();
        let mut head = BytesMut::with_capacity(RP_HEADER_SZ);
        FrameHeader::new(call_id, req.msg_type, req.body.len() as u64)
            .encode(&mut head);

        let written = match self.sio.write(stream, &head) {
            Ok(()) => self.sio.write(stream, &req.body),
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                upstream.pending.insert(call_id, id);
                req.upstream = Some(upstream.id);
                req.call_id = call_id;
                trace!(upstream.log, "sent request"; "request" => %id,
                    "call_id" => call_id, "attempt" => req.retry_count);
                true
            }
            Err(e) => {
                warn!(upstream.log, "write failed, resetting connection";
                    "request" => %id, "err" => %e);
                self.reset_upstream(idx);
                false
            }
        }
    }

    /// Close an upstream's connection. Its in-flight calls become unassigned
    /// and are left to their timers.
    fn reset_upstream(&mut self, idx: usize) {
        let orphans = self.upstreams[idx].detach(&mut self.sio);
        for id in orphans {
            if let Some(req) = self.requests.get_mut(&id) {
                req.upstream = None;
            }
        }
    }

    fn connection_lost(&mut self, stream: StreamId, reason: &str) {
        if let Some(idx) = self.find_stream(stream) {
            debug!(self.upstreams[idx].log, "connection lost";
                "reason" => reason);
            self.reset_upstream(idx);
        }
    }

    fn reconnect_tick(&mut self, id: UpstreamId) {
        let idx = match self.find_upstream(id) {
            Some(idx) => idx,
            None => return,
        };

        let upstream = &mut self.upstreams[idx];
        upstream.timer = None;
        if !upstream.is_connected() {
            upstream.connect(&mut self.sio);
        }

        let interval = self.config.reconnect_interval();
        let timer = self.arm(interval, TimerTarget::Reconnect(id));
        self.upstreams[idx].timer = Some(timer);
    }

    fn call_timeout(&mut self, id: RequestId) {
        let req = match self.requests.get_mut(&id) {
            Some(req) => req,
            None => return,
        };
        req.timer = None;

        if let Some(owner) = req.upstream.take() {
            let call_id = req.call_id;
            if let Some(upstream) =
                self.upstreams.iter_mut().find(|u| u.id == owner)
            {
                upstream.pending.remove(&call_id);
                debug!(upstream.log, "call timed out"; "request" => %id,
                    "call_id" => call_id);
            }
        }

        if !req.retries_left() {
            if let Some(req) = self.requests.remove(&id) {
                debug!(self.log, "call failed"; "request" => %id,
                    "attempts" => req.retry_count + 1);
                (req.callback)(self, Err(CallError::RetriesExhausted));
            }
            return;
        }

        req.retry_count += 1;
        let timeout = req.timeout;
        let timer = self.arm(timeout, TimerTarget::Call(id));
        if let Some(req) = self.requests.get_mut(&id) {
            req.timer = Some(timer);
        }
        self.dispatch(id);
    }

    fn parse_responses(
        &mut self,
        stream: StreamId,
        data: &[u8],
    ) -> Result<usize, FrameParseError> {
        let max_body_len = self.config.max_body_len;
        let mut used = 0;

        while used < data.len() {
            // A callback may have reset or removed this upstream.
            let idx = match self.find_stream(stream) {
                Some(idx) => idx,
                None => return Ok(data.len()),
            };

            let rest = &data[used..];
            let header = match FrameHeader::parse(rest, max_body_len) {
                Ok(header) => header,
                Err(FrameParseError::NotEnoughBytes(_)) => break,
                Err(e) => return Err(e),
            };
            let frame_len = header.frame_len();
            if rest.len() < frame_len {
                break;
            }

            used += frame_len;
            self.complete(idx, &header, &rest[RP_HEADER_SZ..frame_len]);
        }

        Ok(used)
    }

    fn complete(&mut self, idx: usize, header: &FrameHeader, body: &[u8]) {
        let upstream = &mut self.upstreams[idx];
        let id = match upstream.pending.remove(&header.id) {
            Some(id) => id,
            None => {
                trace!(upstream.log, "discarding response to unknown call";
                    "call_id" => header.id);
                return;
            }
        };
        let req = match self.requests.get_mut(&id) {
            Some(req) => req,
            None => return,
        };
        req.upstream = None;

        if req.msg_type != header.msg_type {
            warn!(upstream.log, "response type mismatch"; "request" => %id,
                "expected" => req.msg_type, "received" => header.msg_type);
            return;
        }

        if let Some(req) = self.requests.remove(&id) {
            if let Some(timer) = req.timer {
                self.disarm(timer);
            }
            (req.callback)(self, Ok(body));
        }
    }
}

impl<S: Sio> Drop for Client<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
