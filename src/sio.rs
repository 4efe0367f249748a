// Copyright 2020 Joyent, Inc.

//! The event loop interface consumed by the RPC client.
//!
//! A `Sio` implementation owns the actual sockets and timers. The client only
//! ever refers to them through the opaque `StreamId` and `TimerId` handles it
//! gets back. Events travel in the opposite direction: whoever drives the
//! event loop hands them to the client through `Client::on_data`,
//! `Client::on_error`, `Client::on_close` and `Client::on_timer`.

use std::fmt;
use std::io::Error;
use std::time::Duration;

/// Handle to a byte stream opened through `Sio::connect`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Handle to a one-shot timer armed through `Sio::start_timer`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub trait Sio {
    /// Begin connecting to `host:port`. An `Err` means the attempt could not
    /// even be started; failures detected later arrive as an error event for
    /// the returned stream.
    fn connect(&mut self, host: &str, port: u16) -> Result<StreamId, Error>;

    /// Queue `data` for writing. This must not block.
    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<(), Error>;

    /// Close the stream. No further events are delivered for it.
    fn close(&mut self, stream: StreamId);

    /// Arm a one-shot timer that fires once `after` has elapsed.
    fn start_timer(&mut self, after: Duration) -> TimerId;

    /// Disarm a timer. Stopping a timer that already fired is a no-op.
    fn stop_timer(&mut self, timer: TimerId);
}
