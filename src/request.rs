// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::client::Client;
use crate::sio::{Sio, TimerId};
use crate::upstream::UpstreamId;

/// Identifies an outstanding call for as long as it is outstanding. Ids are
/// never reused by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a call completed without a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallError {
    /// Every attempt timed out, or no upstream could be reached in time.
    RetriesExhausted,
    /// The client was torn down while the call was outstanding.
    Shutdown,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::RetriesExhausted => write!(f, "rpc retries exhausted"),
            CallError::Shutdown => write!(f, "rpc client shut down"),
        }
    }
}

impl std::error::Error for CallError {}

/// Completion callback for a call. It runs exactly once, with the response
/// body on success. The client is handed back so the callback can issue
/// further calls.
pub type Callback<S> =
    Box<dyn FnOnce(&mut Client<S>, Result<&[u8], CallError>)>;

pub(crate) struct Request<S: Sio> {
    pub msg_type: u32,
    pub body: Bytes,
    pub timeout: Duration,
    pub retry_times: u32,
    pub retry_count: u32,
    pub timer: Option<TimerId>,
    /// The upstream this request is in flight on, if any
    pub upstream: Option<UpstreamId>,
    /// Only meaningful while `upstream` is set
    pub call_id: u64,
    pub callback: Callback<S>,
}

impl<S: Sio> Request<S> {
    pub fn new(
        msg_type: u32,
        body: &[u8],
        timeout: Duration,
        retry_times: u32,
        callback: Callback<S>,
    ) -> Request<S> {
        Request {
            msg_type,
            body: Bytes::copy_from_slice(body),
            timeout,
            retry_times,
            retry_count: 0,
            timer: None,
            upstream: None,
            call_id: 0,
            callback,
        }
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.retry_times
    }
}
