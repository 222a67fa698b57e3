//! Receive-side stream buffer (§4.5): reassembles out-of-order STREAM frames via `GapBuffer`,
//! buffers bytes the application hasn't read yet, and tracks the reset interactions the spec
//! calls out (`RST_STREAM` arriving, `STOP_SENDING` triggered locally).

use std::collections::BTreeMap;

use crate::stream::flow_control::ReceiveWindow;
use crate::stream::gap::GapBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    /// Every byte up to the final offset has arrived; the application may still be draining
    /// buffered bytes that haven't been read yet.
    SizeKnown,
    DataRecvd,
    DataRead,
    /// `RST_STREAM` arrived: no more data is coming and whatever was buffered is discarded.
    ResetRecvd,
    ResetRead,
}

pub struct RecvBuffer {
    gaps: GapBuffer,
    /// Offset-keyed fragments not yet delivered to the application, including ones that arrived
    /// past a gap and can't be handed out until the gap closes.
    fragments: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    final_offset: Option<u64>,
    state: RecvState,
    window: ReceiveWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    FlowControl { received: u64, credit: u64 },
    /// A `STREAM` or `RST_STREAM` claimed a final size inconsistent with one already known or
    /// with data already received past the newly claimed size.
    FinalSize { prior: u64, new: u64 },
}

impl RecvBuffer {
    pub fn new(initial_window: u64) -> Self {
        Self {
            gaps: GapBuffer::new(),
            fragments: BTreeMap::new(),
            read_offset: 0,
            final_offset: None,
            state: RecvState::Recv,
            window: ReceiveWindow::new(initial_window),
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn window_mut(&mut self) -> &mut ReceiveWindow {
        &mut self.window
    }

    pub fn window(&self) -> &ReceiveWindow {
        &self.window
    }

    /// Feeds in a `STREAM` frame's payload. `fin` marks `offset + data.len()` as the stream's
    /// final size.
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<(), RecvError> {
        if matches!(self.state, RecvState::ResetRecvd | RecvState::ResetRead) {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(RecvError::FinalSize { prior: final_offset, new: end });
            }
        }
        if self.window.violates(end) {
            return Err(RecvError::FlowControl { received: end, credit: self.window.granted() });
        }
        self.window.record(end);

        if !data.is_empty() {
            self.fragments.insert(offset, data.to_vec());
            self.gaps.insert(offset, data.len() as u64);
        }
        if fin {
            self.final_offset = Some(end);
        }
        self.advance_state();
        Ok(())
    }

    /// A `RST_STREAM` arrived: the peer is abandoning the stream at `final_offset`, which must
    /// be consistent with whatever has already been received.
    pub fn reset(&mut self, final_offset: u64) -> Result<(), RecvError> {
        if let Some(prior) = self.final_offset {
            if prior != final_offset {
                return Err(RecvError::FinalSize { prior, new: final_offset });
            }
        }
        self.fragments.clear();
        self.final_offset = Some(final_offset);
        self.state = RecvState::ResetRecvd;
        Ok(())
    }

    fn advance_state(&mut self) {
        if self.state != RecvState::Recv {
            return;
        }
        if let Some(final_offset) = self.final_offset {
            if self.gaps.covers(final_offset) {
                self.state = RecvState::DataRecvd;
            }
        }
    }

    /// Removes and returns the next contiguous run of bytes available to the application,
    /// starting at `read_offset`. Empty once every buffered fragment has been drained.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        let prefix = self.gaps.contiguous_prefix();
        if prefix <= self.read_offset {
            return None;
        }
        let mut out = Vec::new();
        while let Some((&offset, _)) = self.fragments.range(self.read_offset..).next() {
            if offset != self.read_offset {
                break;
            }
            let chunk = self.fragments.remove(&offset).unwrap();
            self.read_offset += chunk.len() as u64;
            out.extend(chunk);
            if self.read_offset >= prefix {
                break;
            }
        }
        if out.is_empty() {
            return None;
        }
        if self.state == RecvState::DataRecvd && Some(self.read_offset) == self.final_offset {
            self.state = RecvState::DataRead;
        }
        Some(out)
    }

    pub fn mark_reset_read(&mut self) {
        if self.state == RecvState::ResetRecvd {
            self.state = RecvState::ResetRead;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reassembles_out_of_order_fragments_and_delivers_in_order() {
        let mut recv = RecvBuffer::new(1024);
        recv.insert(5, b"world", true).unwrap();
        assert_eq!(recv.read(), None);
        recv.insert(0, b"hello", false).unwrap();
        assert_eq!(recv.read(), Some(b"helloworld".to_vec()));
        assert_eq!(recv.state(), RecvState::DataRead);
    }

    #[test]
    fn rejects_bytes_beyond_granted_credit() {
        let mut recv = RecvBuffer::new(4);
        let err = recv.insert(0, b"hello", false).unwrap_err();
        assert_eq!(err, RecvError::FlowControl { received: 5, credit: 4 });
    }

    #[test]
    fn inconsistent_final_size_is_rejected() {
        let mut recv = RecvBuffer::new(1024);
        recv.insert(0, b"hello", true).unwrap();
        let err = recv.insert(0, b"hellothere", true).unwrap_err();
        assert_eq!(err, RecvError::FinalSize { prior: 5, new: 10 });
    }

    #[test]
    fn reset_discards_buffered_fragments() {
        let mut recv = RecvBuffer::new(1024);
        recv.insert(0, b"hello", false).unwrap();
        recv.reset(5).unwrap();
        assert_eq!(recv.state(), RecvState::ResetRecvd);
        assert_eq!(recv.read(), None);
    }
}
