// Copyright 2020 Joyent, Inc.

//! An in-memory event loop with a virtual clock, for driving a client
//! deterministically.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use sio_rpc::protocol::{
    Frame, FrameHeader, RP_DEFAULT_MAX_BODY_LEN, RP_HEADER_SZ,
};
use sio_rpc::sio::{Sio, StreamId, TimerId};
use sio_rpc::Client;

pub struct MockStream {
    pub host: String,
    pub port: u16,
    pub open: bool,
    pub written: BytesMut,
    pub fail_writes: bool,
}

#[derive(Default)]
pub struct State {
    next_id: u64,
    now: Duration,
    down: HashSet<(String, u16)>,
    connects: HashMap<(String, u16), usize>,
    streams: HashMap<StreamId, MockStream>,
    timers: HashMap<TimerId, Duration>,
}

#[derive(Clone, Default)]
pub struct MockSio(Rc<RefCell<State>>);

impl MockSio {
    pub fn new() -> MockSio {
        MockSio::default()
    }

    pub fn now(&self) -> Duration {
        self.0.borrow().now
    }

    /// Make connection attempts to an endpoint fail (or succeed again).
    pub fn set_down(&self, host: &str, port: u16, down: bool) {
        let key = (String::from(host), port);
        let mut state = self.0.borrow_mut();
        if down {
            state.down.insert(key);
        } else {
            state.down.remove(&key);
        }
    }

    pub fn connects(&self, host: &str, port: u16) -> usize {
        let key = (String::from(host), port);
        *self.0.borrow().connects.get(&key).unwrap_or(&0)
    }

    /// The open stream to an endpoint, if any.
    pub fn stream_to(&self, host: &str, port: u16) -> Option<StreamId> {
        self.0
            .borrow()
            .streams
            .iter()
            .find(|(_, s)| s.open && s.host == host && s.port == port)
            .map(|(id, _)| *id)
    }

    pub fn is_open(&self, stream: StreamId) -> bool {
        self.0.borrow().streams.get(&stream).map_or(false, |s| s.open)
    }

    pub fn fail_writes(&self, stream: StreamId) {
        if let Some(s) = self.0.borrow_mut().streams.get_mut(&stream) {
            s.fail_writes = true;
        }
    }

    /// Take and decode every request frame written to a stream so far.
    pub fn take_requests(&self, stream: StreamId) -> Vec<Frame> {
        let mut state = self.0.borrow_mut();
        let written = match state.streams.get_mut(&stream) {
            Some(s) => s.written.split(),
            None => return vec![],
        };
        decode_all(&written)
    }

    pub fn armed_timers(&self) -> usize {
        self.0.borrow().timers.len()
    }

    /// Advance the clock to the earliest armed timer and fire it.
    pub fn fire_next_timer(&self, client: &mut Client<MockSio>) -> Option<TimerId> {
        let timer = {
            let mut state = self.0.borrow_mut();
            let (timer, deadline) = state
                .timers
                .iter()
                .map(|(id, deadline)| (*id, *deadline))
                .min_by_key(|(id, deadline)| (*deadline, *id))?;
            state.timers.remove(&timer);
            state.now = deadline;
            timer
        };
        client.on_timer(timer);
        Some(timer)
    }

    /// Fire timers until the clock reaches `until`.
    pub fn run_until(&self, client: &mut Client<MockSio>, until: Duration) {
        loop {
            let next = self.0.borrow().timers.values().min().copied();
            match next {
                Some(deadline) if deadline <= until => {
                    self.fire_next_timer(client);
                }
                _ => break,
            }
        }
        self.0.borrow_mut().now = until;
    }
}

impl Sio for MockSio {
    fn connect(&mut self, host: &str, port: u16) -> Result<StreamId, Error> {
        let mut state = self.0.borrow_mut();
        let key = (String::from(host), port);
        *state.connects.entry(key.clone()).or_insert(0) += 1;
        if state.down.contains(&key) {
            return Err(Error::new(ErrorKind::ConnectionRefused, "down"));
        }
        let id = StreamId(state.next_id);
        state.next_id += 1;
        state.streams.insert(
            id,
            MockStream {
                host: key.0,
                port,
                open: true,
                written: BytesMut::new(),
                fail_writes: false,
            },
        );
        Ok(id)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        match state.streams.get_mut(&stream) {
            Some(s) if s.open && !s.fail_writes => {
                s.written.extend_from_slice(data);
                Ok(())
            }
            _ => Err(Error::new(ErrorKind::BrokenPipe, "write failed")),
        }
    }

    fn close(&mut self, stream: StreamId) {
        if let Some(s) = self.0.borrow_mut().streams.get_mut(&stream) {
            s.open = false;
        }
    }

    fn start_timer(&mut self, after: Duration) -> TimerId {
        let mut state = self.0.borrow_mut();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let deadline = state.now + after;
        state.timers.insert(id, deadline);
        id
    }

    fn stop_timer(&mut self, timer: TimerId) {
        self.0.borrow_mut().timers.remove(&timer);
    }
}

pub fn decode_all(mut buf: &[u8]) -> Vec<Frame> {
    let mut frames = vec![];
    while let Ok(header) = FrameHeader::parse(buf, RP_DEFAULT_MAX_BODY_LEN) {
        let len = header.frame_len();
        assert!(buf.len() >= len, "truncated frame in write buffer");
        frames.push(Frame::new(
            header.id,
            header.msg_type,
            Bytes::copy_from_slice(&buf[RP_HEADER_SZ..len]),
        ));
        buf = &buf[len..];
    }
    assert!(buf.is_empty(), "partial header in write buffer");
    frames
}

pub fn encode(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    buf
}

pub fn reply(request: &Frame, body: &'static [u8]) -> BytesMut {
    encode(&Frame::response(request, Bytes::from_static(body)))
}

/// What a completion callback saw
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Ok(Vec<u8>),
    Err(sio_rpc::CallError),
}

pub type Outcomes = Rc<RefCell<Vec<(u32, Outcome)>>>;

/// A callback that appends `(tag, outcome)` to `outcomes`.
pub fn record(
    outcomes: &Outcomes,
    tag: u32,
) -> impl FnOnce(&mut Client<MockSio>, Result<&[u8], sio_rpc::CallError>) + 'static
{
    let outcomes = Rc::clone(outcomes);
    move |_client, result| {
        let outcome = match result {
            Ok(body) => Outcome::Ok(body.to_vec()),
            Err(e) => Outcome::Err(e),
        };
        outcomes.borrow_mut().push((tag, outcome));
    }
}
