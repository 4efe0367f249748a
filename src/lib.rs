// Copyright 2020 Joyent, Inc.

//! sio-rpc: a multiplexing RPC client over a pool of upstream servers
//!
//! A `Client` spreads calls over a set of upstreams, each reached through at
//! most one connection at a time. Calls are correlated with responses by a
//! call id that is unique within one connection. Retries, timeouts and
//! reconnects are all driven by timers of a single-threaded event loop, which
//! the client reaches through the `sio::Sio` trait. `reactor` provides an
//! implementation on tokio.
//!
//! Protocol definition
//!
//! Every request and response is a frame with the following structure, all
//! integers big-endian:
//!
//! * CALLID0...CALLID7   8-byte unsigned integer, the call id. Allocated
//!                      sequentially from zero on every new connection. A
//!                      response carries the id of its request.
//!
//! * TYPE0...TYPE3       4-byte unsigned integer, the message type. Its
//!                      meaning is up to the application. A response carries
//!                      the type of its request.
//!
//! * RSVD0...RSVD3       4-byte reserved field, always zero.
//!
//! * BLEN0...BLEN7       8-byte unsigned integer, the number of body bytes
//!                      that follow.
//!
//! * BODY0...BODYN       The opaque body.
//!
//! A call completes exactly once: with the body of a response of the right
//! type, with `CallError::RetriesExhausted` once every attempt timed out, or
//! with `CallError::Shutdown` when the client is torn down.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod protocol;
pub mod reactor;
pub mod request;
pub mod server;
pub mod sio;
pub mod upstream;

pub use client::{Client, Rpc};
pub use request::{CallError, RequestId};
