//! Connection state machine for client sockets.
//!
//! ```text
//! Accepted -> AwaitingRequest -> Processing -> AwaitingWrite -> AwaitingRequest
//!                  |                                  |
//!                  +----------> Closed <--------------+
//! ```
//!
//! The state owns the bytes read but not yet dispatched and the response
//! waiting to be written. It knows nothing about sockets so it can be
//! driven directly in tests.

use crate::protocol::FRAME_DELIMITER;
use bytes::{Bytes, BytesMut};
use std::io;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    /// Accepted but not yet registered for reads.
    Accepted,
    /// Waiting for a complete request frame.
    AwaitingRequest,
    /// Frames are being dispatched to the store.
    Processing,
    /// A response is buffered and waiting for write readiness.
    AwaitingWrite,
    /// Peer closed or the connection failed.
    Closed,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct ConnectionState {
    phase: ConnPhase,
    /// Bytes received but not yet dispatched.
    read_buf: BytesMut,
    /// Encoded response waiting to be flushed.
    pending: Option<Bytes>,
    /// Bytes of `pending` already written.
    sent: usize,
    /// The peer shut down its write half.
    peer_closed: bool,
    max_frame_size: usize,
}

impl ConnectionState {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            phase: ConnPhase::Accepted,
            read_buf: BytesMut::new(),
            pending: None,
            sent: 0,
            peer_closed: false,
            max_frame_size,
        }
    }

    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    /// Registered for reads; ready for the first request.
    pub fn begin_reading(&mut self) {
        self.phase = ConnPhase::AwaitingRequest;
    }

    /// Append bytes received from the socket.
    ///
    /// Fails if the unterminated tail grows beyond the maximum frame size.
    pub fn receive(&mut self, data: &[u8]) -> io::Result<()> {
        self.read_buf.extend_from_slice(data);

        let tail = match self.read_buf.iter().rposition(|&b| b == FRAME_DELIMITER) {
            Some(pos) => self.read_buf.len() - pos - 1,
            None => self.read_buf.len(),
        };
        if tail > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {} bytes", self.max_frame_size),
            ));
        }
        Ok(())
    }

    /// The peer will send nothing more. An unterminated tail becomes the last frame.
    pub fn mark_peer_closed(&mut self) {
        self.peer_closed = true;
    }

    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Peer closed and every request has been answered.
    pub fn is_drained(&self) -> bool {
        self.peer_closed && self.phase == ConnPhase::AwaitingRequest && self.read_buf.is_empty()
    }

    /// Split off every complete frame (delimiter included) and enter `Processing`.
    ///
    /// Returns nothing unless the connection is awaiting a request.
    pub fn take_frames(&mut self) -> Vec<Bytes> {
        if self.phase != ConnPhase::AwaitingRequest {
            return Vec::new();
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.read_buf.iter().position(|&b| b == FRAME_DELIMITER) {
            frames.push(self.read_buf.split_to(pos + 1).freeze());
        }
        if self.peer_closed && !self.read_buf.is_empty() {
            frames.push(self.read_buf.split().freeze());
        }

        if !frames.is_empty() {
            self.phase = ConnPhase::Processing;
        }
        frames
    }

    /// Buffer an encoded response and wait for write readiness.
    pub fn queue_response(&mut self, response: Bytes) {
        self.pending = Some(response);
        self.sent = 0;
        self.phase = ConnPhase::AwaitingWrite;
    }

    /// The part of the pending response not yet written.
    pub fn unsent(&self) -> &[u8] {
        match &self.pending {
            Some(pending) if self.phase == ConnPhase::AwaitingWrite => &pending[self.sent..],
            _ => &[],
        }
    }

    /// Record `n` bytes written. Returns `true` once the response is flushed.
    pub fn advance(&mut self, n: usize) -> bool {
        if let Some(pending) = &self.pending {
            self.sent = (self.sent + n).min(pending.len());
        }
        self.is_sent()
    }

    pub fn is_sent(&self) -> bool {
        match &self.pending {
            Some(pending) => self.sent >= pending.len(),
            None => true,
        }
    }

    /// Drop the flushed response and wait for the next request.
    pub fn finish_write(&mut self) {
        self.pending = None;
        self.sent = 0;
        self.phase = ConnPhase::AwaitingRequest;
    }

    pub fn close(&mut self) {
        self.phase = ConnPhase::Closed;
        self.pending = None;
        self.read_buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }
}
