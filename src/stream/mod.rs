//! The Stream object (C5, §4.5): one instance per application-visible stream, combining the
//! send and receive halves (bidirectional streams have both; unidirectional streams have only
//! the half matching who opened them), plus connection-wide stream-ID gating.

pub mod flow_control;
pub mod gap;
pub mod recv;
pub mod send;

use std::collections::HashMap;

use recv::{RecvBuffer, RecvError};
use send::{SendBuffer, SendError};

/// Low two bits of a stream ID (RFC 9000 §2.1): who initiated it and whether it's bidirectional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    ClientBidi(u64),
    ServerBidi(u64),
    ClientUni(u64),
    ServerUni(u64),
}

impl StreamId {
    pub fn decode(raw: u64) -> Self {
        let index = raw >> 2;
        match raw & 0b11 {
            0b00 => StreamId::ClientBidi(index),
            0b01 => StreamId::ServerBidi(index),
            0b10 => StreamId::ClientUni(index),
            _ => StreamId::ServerUni(index),
        }
    }

    pub fn encode(self) -> u64 {
        let (index, tag) = match self {
            StreamId::ClientBidi(i) => (i, 0b00),
            StreamId::ServerBidi(i) => (i, 0b01),
            StreamId::ClientUni(i) => (i, 0b10),
            StreamId::ServerUni(i) => (i, 0b11),
        };
        (index << 2) | tag
    }

    pub fn is_bidi(self) -> bool {
        matches!(self, StreamId::ClientBidi(_) | StreamId::ServerBidi(_))
    }

    pub fn is_client_initiated(self) -> bool {
        matches!(self, StreamId::ClientBidi(_) | StreamId::ClientUni(_))
    }
}

pub struct Stream {
    pub send: Option<SendBuffer>,
    pub recv: Option<RecvBuffer>,
}

impl Stream {
    fn bidi(send_window: u64, recv_window: u64) -> Self {
        Self { send: Some(SendBuffer::new(send_window)), recv: Some(RecvBuffer::new(recv_window)) }
    }

    fn send_only(send_window: u64) -> Self {
        Self { send: Some(SendBuffer::new(send_window)), recv: None }
    }

    fn recv_only(recv_window: u64) -> Self {
        Self { send: None, recv: Some(RecvBuffer::new(recv_window)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamsError {
    IdBlocked { stream_id: u64, limit: u64 },
    NoSuchStream { stream_id: u64 },
    Recv(RecvError),
    Send(SendError),
}

/// Owns every stream on a connection plus the four independent stream-ID limits the peers
/// negotiate (§4.5): local/remote, each split bidi/uni, since a connection can open bidi streams
/// up to one limit while being gated on a completely separate limit for uni streams.
pub struct Streams {
    is_client: bool,
    streams: HashMap<u64, Stream>,
    next_local_bidi: u64,
    next_local_uni: u64,
    max_local_bidi: u64,
    max_local_uni: u64,
    max_remote_bidi: u64,
    max_remote_uni: u64,
    default_send_window: u64,
    default_recv_window: u64,
    /// Connection-wide counterparts of each stream's send/receive window (§4.5): every
    /// stream's bytes draw against these in addition to its own per-stream limit.
    conn_send: flow_control::SendWindow,
    conn_recv: flow_control::ReceiveWindow,
}

impl Streams {
    pub fn new(
        is_client: bool,
        max_remote_bidi: u64,
        max_remote_uni: u64,
        default_send_window: u64,
        default_recv_window: u64,
        conn_send_limit: u64,
        conn_recv_limit: u64,
    ) -> Self {
        Self {
            is_client,
            streams: HashMap::new(),
            next_local_bidi: 0,
            next_local_uni: 0,
            max_local_bidi: 0,
            max_local_uni: 0,
            max_remote_bidi,
            max_remote_uni,
            default_send_window,
            default_recv_window,
            conn_send: flow_control::SendWindow::new(conn_send_limit),
            conn_recv: flow_control::ReceiveWindow::new(conn_recv_limit),
        }
    }

    pub fn set_max_local_bidi(&mut self, limit: u64) {
        self.max_local_bidi = self.max_local_bidi.max(limit);
    }

    pub fn set_max_local_uni(&mut self, limit: u64) {
        self.max_local_uni = self.max_local_uni.max(limit);
    }

    /// Raises the connection-wide send credit in response to a peer `MAX_DATA` frame.
    pub fn raise_conn_send_limit(&mut self, new_limit: u64) {
        self.conn_send.raise_limit(new_limit);
    }

    /// Raises one stream's send credit in response to a peer `MAX_STREAM_DATA` frame.
    pub fn raise_stream_send_limit(&mut self, raw_id: u64, new_limit: u64) -> Result<(), StreamsError> {
        let stream = self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let send = stream.send.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        send.window_mut().raise_limit(new_limit);
        Ok(())
    }

    /// If the connection-wide receive window is more than half consumed, returns the new limit
    /// to advertise via a fresh `MAX_DATA` frame.
    pub fn conn_recv_extend(&mut self) -> Option<u64> {
        self.conn_recv.extend()
    }

    pub fn conn_send_blocked(&self) -> bool {
        self.conn_send.available() == 0
    }

    fn local_id(&self, index: u64, bidi: bool) -> StreamId {
        match (self.is_client, bidi) {
            (true, true) => StreamId::ClientBidi(index),
            (true, false) => StreamId::ClientUni(index),
            (false, true) => StreamId::ServerBidi(index),
            (false, false) => StreamId::ServerUni(index),
        }
    }

    /// Opens the next locally-initiated bidirectional stream, gated on the peer's advertised
    /// `max_local_stream_id_bidi` (stored here as `max_local_bidi`).
    pub fn open_bidi(&mut self) -> Result<u64, StreamsError> {
        if self.next_local_bidi >= self.max_local_bidi {
            return Err(StreamsError::IdBlocked {
                stream_id: self.local_id(self.next_local_bidi, true).encode(),
                limit: self.max_local_bidi,
            });
        }
        let id = self.local_id(self.next_local_bidi, true).encode();
        self.next_local_bidi += 1;
        self.streams.insert(id, Stream::bidi(self.default_send_window, self.default_recv_window));
        Ok(id)
    }

    /// Opens a locally-initiated bidirectional stream at a caller-chosen counter `index` rather
    /// than the next sequential one, so a layer above `Streams` (the multiplex dispatcher) can
    /// fold extra bits into the index while this type still enforces the ordinary stream-id
    /// limit and initiator/directionality encoding. `index` must not collide with one already
    /// issued by this or a prior call.
    pub fn open_bidi_at(&mut self, index: u64) -> Result<u64, StreamsError> {
        if index >= self.max_local_bidi {
            return Err(StreamsError::IdBlocked { stream_id: self.local_id(index, true).encode(), limit: self.max_local_bidi });
        }
        let id = self.local_id(index, true).encode();
        self.next_local_bidi = self.next_local_bidi.max(index + 1);
        self.streams.insert(id, Stream::bidi(self.default_send_window, self.default_recv_window));
        Ok(id)
    }

    pub fn open_uni(&mut self) -> Result<u64, StreamsError> {
        if self.next_local_uni >= self.max_local_uni {
            return Err(StreamsError::IdBlocked {
                stream_id: self.local_id(self.next_local_uni, false).encode(),
                limit: self.max_local_uni,
            });
        }
        let id = self.local_id(self.next_local_uni, false).encode();
        self.next_local_uni += 1;
        self.streams.insert(id, Stream::send_only(self.default_send_window));
        Ok(id)
    }

    /// Looks a stream up, implicitly creating it (and any lower-numbered streams from the same
    /// peer the spec requires to be considered "opened" per RFC 9000 §2.1) if the peer is
    /// opening it for the first time and it's within the advertised limit.
    fn get_or_open_remote(&mut self, raw_id: u64) -> Result<&mut Stream, StreamsError> {
        let decoded = StreamId::decode(raw_id);
        if decoded.is_client_initiated() == self.is_client {
            // locally-initiated stream id referenced by its own endpoint: must already exist.
            return self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id });
        }
        if !self.streams.contains_key(&raw_id) {
            let index = raw_id >> 2;
            let limit = if decoded.is_bidi() { self.max_remote_bidi } else { self.max_remote_uni };
            if index >= limit {
                return Err(StreamsError::IdBlocked { stream_id: raw_id, limit });
            }
            let stream = if decoded.is_bidi() {
                Stream::bidi(self.default_send_window, self.default_recv_window)
            } else {
                Stream::recv_only(self.default_recv_window)
            };
            self.streams.insert(raw_id, stream);
        }
        Ok(self.streams.get_mut(&raw_id).expect("just inserted"))
    }

    pub fn on_stream_frame(&mut self, raw_id: u64, offset: u64, data: &[u8], fin: bool) -> Result<(), StreamsError> {
        let (before, after) = {
            let stream = self.get_or_open_remote(raw_id)?;
            let recv = stream.recv.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
            let before = recv.window().consumed();
            recv.insert(offset, data, fin).map_err(StreamsError::Recv)?;
            (before, recv.window().consumed())
        };
        if after > before {
            let new_total = self.conn_recv.consumed() + (after - before);
            if self.conn_recv.violates(new_total) {
                return Err(StreamsError::Recv(RecvError::FlowControl { received: new_total, credit: self.conn_recv.granted() }));
            }
            self.conn_recv.record(new_total);
        }
        Ok(())
    }

    pub fn on_rst_stream(&mut self, raw_id: u64, final_offset: u64) -> Result<(), StreamsError> {
        let stream = self.get_or_open_remote(raw_id)?;
        let recv = stream.recv.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        recv.reset(final_offset).map_err(StreamsError::Recv)
    }

    /// `STOP_SENDING` arrived for a stream this endpoint is sending on: stop queuing new data
    /// and queue an `RST_STREAM` in response (the caller is responsible for emitting the frame).
    pub fn on_stop_sending(&mut self, raw_id: u64) -> Result<(), StreamsError> {
        let stream = self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let send = stream.send.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        send.reset();
        Ok(())
    }

    /// The send half's write cursor, for a caller building the `RST_STREAM` this endpoint is
    /// about to emit (either `STOP_SENDING`-triggered or application-triggered via
    /// [`Streams::reset_stream`]) — it needs the final offset before the reset clears anything.
    pub fn send_write_offset(&self, raw_id: u64) -> Option<u64> {
        self.streams.get(&raw_id)?.send.as_ref().map(|send| send.write_offset())
    }

    /// Application-triggered abrupt stream abort (§4.5 "shutdown_write"): stops accepting
    /// further writes on this stream and returns the final offset the caller's `RST_STREAM`
    /// should carry.
    pub fn reset_stream(&mut self, raw_id: u64) -> Result<u64, StreamsError> {
        let stream = self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let send = stream.send.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let final_offset = send.write_offset();
        send.reset();
        Ok(final_offset)
    }

    pub fn write(&mut self, raw_id: u64, data: &[u8]) -> Result<usize, StreamsError> {
        if self.conn_send.available() < data.len() as u64 {
            return Err(StreamsError::Send(SendError::Blocked));
        }
        let stream = self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let send = stream.send.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let n = send.write(data).map_err(StreamsError::Send)?;
        self.conn_send.reserve(n as u64);
        Ok(n)
    }

    pub fn read(&mut self, raw_id: u64) -> Result<Option<Vec<u8>>, StreamsError> {
        let stream = self.streams.get_mut(&raw_id).ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        let recv = stream.recv.as_mut().ok_or(StreamsError::NoSuchStream { stream_id: raw_id })?;
        Ok(recv.read())
    }

    pub fn get(&self, raw_id: u64) -> Option<&Stream> {
        self.streams.get(&raw_id)
    }

    pub fn get_mut(&mut self, raw_id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&raw_id)
    }

    /// Every stream id currently known, for sweeping per-stream flow control and pending writes.
    pub fn stream_ids(&self) -> Vec<u64> {
        self.streams.keys().copied().collect()
    }

    /// If a stream's receive window is more than half consumed, returns the new limit to
    /// advertise via a fresh `MAX_STREAM_DATA` frame.
    pub fn stream_recv_extend(&mut self, raw_id: u64) -> Option<u64> {
        self.streams.get_mut(&raw_id)?.recv.as_mut()?.window_mut().extend()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_id_tag_round_trips() {
        for raw in [0u64, 1, 2, 3, 400, 401, 402, 403] {
            assert_eq!(StreamId::decode(raw).encode(), raw);
        }
        assert!(matches!(StreamId::decode(0), StreamId::ClientBidi(0)));
        assert!(matches!(StreamId::decode(3), StreamId::ServerUni(0)));
    }

    #[test]
    fn opening_beyond_the_peer_granted_limit_is_blocked() {
        let mut streams = Streams::new(true, 0, 0, 4096, 4096, 1 << 20, 1 << 20);
        let err = streams.open_bidi().unwrap_err();
        assert!(matches!(err, StreamsError::IdBlocked { limit: 0, .. }));
        streams.set_max_local_bidi(1);
        assert!(streams.open_bidi().is_ok());
    }

    #[test]
    fn remote_stream_is_implicitly_created_within_limit() {
        let mut streams = Streams::new(true, 1, 0, 4096, 4096, 1 << 20, 1 << 20);
        // server-initiated bidi stream id 1
        streams.on_stream_frame(1, 0, b"hi", false).unwrap();
        assert_eq!(streams.read(1).unwrap(), Some(b"hi".to_vec()));
    }

    #[test]
    fn remote_stream_beyond_limit_is_rejected() {
        let mut streams = Streams::new(true, 0, 0, 4096, 4096, 1 << 20, 1 << 20);
        let err = streams.on_stream_frame(1, 0, b"hi", false).unwrap_err();
        assert!(matches!(err, StreamsError::IdBlocked { .. }));
    }

    #[test]
    fn stop_sending_resets_the_send_half() {
        let mut streams = Streams::new(true, 0, 0, 4096, 4096, 1 << 20, 1 << 20);
        streams.set_max_local_bidi(1);
        let id = streams.open_bidi().unwrap();
        streams.write(id, b"data").unwrap();
        streams.on_stop_sending(id).unwrap();
        assert_eq!(streams.write(id, b"more"), Err(StreamsError::Send(SendError::Closed)));
    }
}
