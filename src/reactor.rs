// Copyright 2020 Joyent, Inc.

//! A `Sio` implementation on top of a single-threaded tokio runtime.
//!
//! Connections and timers run as local tasks and report back over a channel.
//! The `Driver` owns the receiving end of that channel and feeds each event
//! into a `Client`. Everything here must run inside a
//! `tokio::task::LocalSet`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use slog::{debug, o, trace, Drain, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::client::Client;
use crate::sio::{Sio, StreamId, TimerId};

const READ_BUF_SZ: usize = 8 * 1024;

/// An event produced by a connection or timer task.
#[derive(Debug)]
pub enum Event {
    Data(StreamId, Bytes),
    Error(StreamId),
    Close(StreamId),
    Timer(TimerId),
}

struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

struct Inner {
    next_id: u64,
    streams: HashMap<StreamId, Connection>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    closed: Vec<StreamId>,
    events: mpsc::UnboundedSender<Event>,
    log: Logger,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Clone)]
pub struct TokioSio(Rc<RefCell<Inner>>);

impl TokioSio {
    pub fn new(log: Option<&Logger>) -> (TokioSio, Driver) {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (events, rx) = mpsc::unbounded_channel();
        let sio = TokioSio(Rc::new(RefCell::new(Inner {
            next_id: 0,
            streams: HashMap::new(),
            timers: HashMap::new(),
            closed: Vec::new(),
            events,
            log,
        })));
        let driver = Driver {
            sio: sio.clone(),
            events: rx,
            buffers: HashMap::new(),
        };
        (sio, driver)
    }

    fn timer_fired(&self, timer: TimerId) {
        self.0.borrow_mut().timers.remove(&timer);
    }

    fn is_open(&self, stream: StreamId) -> bool {
        self.0.borrow().streams.contains_key(&stream)
    }

    fn take_closed(&self) -> Vec<StreamId> {
        let mut inner = self.0.borrow_mut();
        std::mem::take(&mut inner.closed)
    }
}

impl Sio for TokioSio {
    /// Only IP addresses are accepted for `host`, so that nothing here ever
    /// waits on name resolution.
    fn connect(&mut self, host: &str, port: u16) -> Result<StreamId, Error> {
        let ip = host.parse::<IpAddr>().map_err(|e| {
            let msg = format!("Invalid address {}: {}", host, e);
            Error::new(ErrorKind::InvalidInput, msg)
        })?;
        let addr = SocketAddr::new(ip, port);

        let mut inner = self.0.borrow_mut();
        let stream = StreamId(inner.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let events = inner.events.clone();
        let log = inner.log.new(o!("stream" => stream.0, "address" => addr));
        let task = task::spawn_local(run_connection(stream, addr, rx, events, log));
        inner.streams.insert(stream, Connection { tx, task });
        Ok(stream)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<(), Error> {
        let inner = self.0.borrow();
        match inner.streams.get(&stream) {
            Some(conn) => conn
                .tx
                .send(Bytes::copy_from_slice(data))
                .map_err(|_| Error::new(ErrorKind::BrokenPipe, "connection closed")),
            None => Err(Error::new(ErrorKind::NotConnected, "unknown stream")),
        }
    }

    fn close(&mut self, stream: StreamId) {
        let mut inner = self.0.borrow_mut();
        if let Some(conn) = inner.streams.remove(&stream) {
            conn.task.abort();
            inner.closed.push(stream);
        }
    }

    fn start_timer(&mut self, after: Duration) -> TimerId {
        let mut inner = self.0.borrow_mut();
        let timer = TimerId(inner.next_id());
        let events = inner.events.clone();
        let task = task::spawn_local(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::Timer(timer));
        });
        inner.timers.insert(timer, task);
        timer
    }

    fn stop_timer(&mut self, timer: TimerId) {
        if let Some(task) = self.0.borrow_mut().timers.remove(&timer) {
            task.abort();
        }
    }
}

async fn run_connection(
    stream: StreamId,
    addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<Event>,
    log: Logger,
) {
    let socket = match TcpStream::connect(addr).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(log, "connect failed"; "err" => %e);
            let _ = events.send(Event::Error(stream));
            return;
        }
    };
    let _ = socket.set_nodelay(true);
    debug!(log, "connected");

    let (reader, writer) = socket.into_split();
    let event = tokio::select! {
        event = read_loop(stream, reader, &events, &log) => Some(event),
        res = write_loop(writer, rx) => match res {
            Ok(()) => None,
            Err(e) => {
                debug!(log, "write failed"; "err" => %e);
                Some(Event::Error(stream))
            }
        },
    };

    if let Some(event) = event {
        let _ = events.send(event);
    }
}

/// Forward everything read as `Data` events. Returns the event that ended
/// the connection.
async fn read_loop(
    stream: StreamId,
    mut reader: OwnedReadHalf,
    events: &mpsc::UnboundedSender<Event>,
    log: &Logger,
) -> Event {
    let mut buf = BytesMut::with_capacity(READ_BUF_SZ);
    loop {
        buf.reserve(READ_BUF_SZ);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(log, "connection closed by peer");
                return Event::Close(stream);
            }
            Ok(n) => {
                trace!(log, "read"; "bytes" => n);
                let _ = events.send(Event::Data(stream, buf.split().freeze()));
            }
            Err(e) => {
                debug!(log, "read failed"; "err" => %e);
                return Event::Error(stream);
            }
        }
    }
}

/// Drain the write queue until the client drops the sending side.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), Error> {
    while let Some(data) = rx.recv().await {
        writer.write_all(&data).await?;
    }
    Ok(())
}

/// Feeds events from a `TokioSio` into a client.
pub struct Driver {
    sio: TokioSio,
    events: mpsc::UnboundedReceiver<Event>,
    buffers: HashMap<StreamId, BytesMut>,
}

impl Driver {
    /// Wait for the next event and hand it to `client`. Returns `false` once
    /// no more events can arrive.
    pub async fn turn(&mut self, client: &mut Client<TokioSio>) -> bool {
        match self.events.recv().await {
            Some(event) => {
                self.dispatch(client, event);
                true
            }
            None => false,
        }
    }

    pub fn dispatch(&mut self, client: &mut Client<TokioSio>, event: Event) {
        match event {
            Event::Data(stream, data) => {
                // Data already queued when the stream was closed.
                if !self.sio.is_open(stream) {
                    return;
                }
                let buf = self.buffers.entry(stream).or_insert_with(BytesMut::new);
                buf.extend_from_slice(&data);
                client.on_data(stream, buf);
            }
            Event::Error(stream) => {
                self.buffers.remove(&stream);
                client.on_error(stream);
            }
            Event::Close(stream) => {
                self.buffers.remove(&stream);
                client.on_close(stream);
            }
            Event::Timer(timer) => {
                self.sio.timer_fired(timer);
                client.on_timer(timer);
            }
        }

        for stream in self.sio.take_closed() {
            self.buffers.remove(&stream);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::client::Rpc;

    #[test]
    fn data_for_a_closed_stream_is_dropped() {
        let log = Logger::root(slog::Discard, o!());
        let (sio, mut driver) = TokioSio::new(Some(&log));
        let mut client = Rpc::new(sio, Some(&log)).client();

        let stale = StreamId(7);
        driver.dispatch(
            &mut client,
            Event::Data(stale, Bytes::from_static(b"late bytes")),
        );
        assert!(driver.buffers.is_empty());
    }
}
