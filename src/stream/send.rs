//! Send-side stream buffer (§4.5, §9): a queue of unacknowledged chunks rather than one flat
//! byte vector, so acknowledged prefixes can be dropped in O(1) instead of shifting a `Vec`.
//! Mirrors the "ring of chunks" shape `quinn-proto::send_stream::Send` uses for the same reason.

use std::collections::VecDeque;

use crate::stream::flow_control::SendWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    /// `shutdown()` was called (or a FIN was queued): no more data will be appended, but
    /// unacknowledged bytes already queued still need to be sent and acked.
    DataSent,
    /// Every byte up to and including the final offset has been acknowledged.
    DataRecvd,
    /// `STOP_SENDING` arrived from the peer (or the application reset locally): further writes
    /// are rejected and a `RST_STREAM` has been or will be queued.
    ResetSent,
    ResetRecvd,
}

struct Chunk {
    offset: u64,
    data: Vec<u8>,
}

pub struct SendBuffer {
    chunks: VecDeque<Chunk>,
    /// Offset of the first byte not yet queued into `chunks` (i.e. the write cursor).
    write_offset: u64,
    /// Offset of the first byte not yet acknowledged — everything before this has been freed.
    ack_offset: u64,
    final_offset: Option<u64>,
    state: SendState,
    window: SendWindow,
}

impl SendBuffer {
    pub fn new(initial_window: u64) -> Self {
        Self {
            chunks: VecDeque::new(),
            write_offset: 0,
            ack_offset: 0,
            final_offset: None,
            state: SendState::Ready,
            window: SendWindow::new(initial_window),
        }
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn window_mut(&mut self) -> &mut SendWindow {
        &mut self.window
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    /// Queues `data` for transmission. Fails if the stream isn't accepting more data (already
    /// shut down or reset) or if it would exceed the flow-control window currently granted.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        if self.state != SendState::Ready {
            return Err(SendError::Closed);
        }
        if !self.window.reserve(data.len() as u64) {
            return Err(SendError::Blocked);
        }
        let offset = self.write_offset;
        self.write_offset += data.len() as u64;
        self.chunks.push_back(Chunk { offset, data: data.to_vec() });
        Ok(data.len())
    }

    /// Marks the stream as having no more data to send, fixing its final offset.
    pub fn finish(&mut self) {
        if self.state == SendState::Ready {
            self.final_offset = Some(self.write_offset);
            self.state = SendState::DataSent;
        }
    }

    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// The write cursor: how much of this stream the application has queued so far, regardless
    /// of how much has actually gone out on the wire. A `RST_STREAM` this endpoint sends carries
    /// this as its final offset (§4.5).
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Returns up to `max_len` bytes of unacknowledged data starting at `from_offset`, for
    /// retransmission of a range the loss detector flagged. Returns `None` if none of the
    /// requested range is still buffered (already acknowledged).
    pub fn range(&self, from_offset: u64, max_len: usize) -> Option<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut start = None;
        for chunk in &self.chunks {
            let chunk_end = chunk.offset + chunk.data.len() as u64;
            if chunk_end <= from_offset {
                continue;
            }
            let skip = from_offset.saturating_sub(chunk.offset) as usize;
            if start.is_none() {
                start = Some(chunk.offset.max(from_offset));
            }
            out.extend_from_slice(&chunk.data[skip..]);
            if out.len() >= max_len {
                out.truncate(max_len);
                break;
            }
        }
        start.map(|s| (s, out))
    }

    /// Drops every chunk fully covered by `[0, new_ack_offset)` and, if every queued byte
    /// (including the FIN) has now been acknowledged, transitions to `DataRecvd`.
    pub fn ack(&mut self, new_ack_offset: u64) {
        if new_ack_offset <= self.ack_offset {
            return;
        }
        self.ack_offset = new_ack_offset;
        while let Some(front) = self.chunks.front() {
            let front_end = front.offset + front.data.len() as u64;
            if front_end <= self.ack_offset {
                self.chunks.pop_front();
            } else {
                break;
            }
        }
        if self.state == SendState::DataSent && self.final_offset == Some(self.ack_offset) {
            self.state = SendState::DataRecvd;
        }
    }

    /// A `STOP_SENDING` arrived, or the application reset the stream locally: stop accepting
    /// writes and discard whatever was queued, since the peer has said it won't read any of it.
    pub fn reset(&mut self) {
        if matches!(self.state, SendState::ResetSent | SendState::ResetRecvd) {
            return;
        }
        self.chunks.clear();
        self.state = SendState::ResetSent;
    }

    pub fn reset_acknowledged(&mut self) {
        if self.state == SendState::ResetSent {
            self.state = SendState::ResetRecvd;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Closed,
    Blocked,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acking_drops_fully_covered_chunks_and_tracks_completion() {
        let mut send = SendBuffer::new(1024);
        send.write(b"hello").unwrap();
        send.write(b"world").unwrap();
        send.finish();
        assert_eq!(send.state(), SendState::DataSent);
        send.ack(5);
        assert_eq!(send.range(0, 100), Some((5, b"world".to_vec())));
        send.ack(10);
        assert_eq!(send.state(), SendState::DataRecvd);
    }

    #[test]
    fn write_is_rejected_once_window_is_exhausted() {
        let mut send = SendBuffer::new(4);
        assert!(send.write(b"abcd").is_ok());
        assert_eq!(send.write(b"e"), Err(SendError::Blocked));
        send.window_mut().raise_limit(5);
        assert!(send.write(b"e").is_ok());
    }

    #[test]
    fn reset_discards_unacked_data_and_rejects_further_writes() {
        let mut send = SendBuffer::new(1024);
        send.write(b"abc").unwrap();
        send.reset();
        assert_eq!(send.range(0, 10), None);
        assert_eq!(send.write(b"x"), Err(SendError::Closed));
    }
}
