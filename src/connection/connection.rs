//! The connection state machine (§4.6): owns one peer's crypto context, loss-detection state,
//! and stream set, and drives the handshake through a `tls::QuicToTls` collaborator. Does no
//! socket I/O itself — `poll_transmit`/`recv_datagram` move datagrams in and out, and the caller
//! (`endpoint::Endpoint`) owns the actual UDP socket and wakeup loop.
//!
//! Exactly one QUIC packet is packed per datagram here: the packet-protection engine
//! (`packet::packet::unprotect`) decrypts everything after the header as a single AEAD block, so
//! it has no way to locate a second coalesced packet's boundary within one buffer. Real QUIC
//! coalesces Initial/Handshake/1-RTT packets into one UDP datagram during the handshake; this
//! connection instead sends (and expects) one packet per datagram throughout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ring::rand::{SecureRandom, SystemRandom};

use crate::config::TransportConfig;
use crate::connection::ack::AckTracker;
use crate::connection::types::{CloseReason, ConnectionState};
use crate::crypto::{CryptoContext, Endpoint as CryptoRole, Secrets};
use crate::error::TransportError;
use crate::multiplex::{Dispatcher, Mode, Tag};
use crate::packet::frame::Frame;
use crate::packet::header::{Header, LongHeader, PnSpace, ShortHeader};
use crate::packet::packet;
use crate::packet::transport_params::{Direction, TransportParameters};
use crate::packet::types::ConnectionId;
use crate::recovery::Recovery;
use crate::result::{QuicheError, QuicheResult};
use crate::stream::recv::RecvError;
use crate::stream::{Streams, StreamsError};
use crate::tls::{MockHandshake, QuicToTls, Role as TlsRole, SecretDirection, TlsToQuic};
use tracing::{debug, trace, warn};

/// Target size for a packet's frame payload before protection overhead; not real MTU discovery,
/// just a ceiling on how much a single `poll_transmit` call will try to pack in.
const MAX_DATAGRAM_SIZE: usize = 1350;

pub struct Connection {
    is_client: bool,
    state: ConnectionState,
    config: TransportConfig,
    crypto: CryptoContext,
    tls: Option<MockHandshake>,
    recovery: Recovery,
    streams: Streams,
    dispatcher: Dispatcher,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    version: u32,
    next_pn: [u64; 3],
    acks: [AckTracker; 3],
    peer_params: Option<TransportParameters>,
    close_reason: Option<CloseReason>,
    closing_deadline: Option<Instant>,
    last_activity: Instant,
    pending_close_frame: Option<Frame>,
    /// Outgoing CRYPTO frames, keyed by space, queued as the TLS collaborator's outbox drains.
    pending_crypto: [Vec<Frame>; 3],
    crypto_offset: [u64; 3],
    /// Frames a loss-detection sweep rebuilt from a declared-lost packet; drained ahead of
    /// everything else the next time this space gets a chance to send (§4.4).
    retransmit_queue: [Vec<Frame>; 3],
    /// Miscellaneous Application-space control frames (MAX_DATA, MAX_STREAM_DATA, the RST_STREAM
    /// sent in response to STOP_SENDING, PATH_RESPONSE) not tied to a stream's send buffer the
    /// way STREAM frames are.
    pending_control: Vec<Frame>,
    /// Per-stream cursor into how much of that stream's buffered data has been sent at least
    /// once; `stream::send::SendBuffer::range` returns everything still unacked from an offset,
    /// so this is what keeps fresh sends from re-walking bytes already queued into a packet.
    stream_unsent_from: HashMap<u64, u64>,
    /// Streams whose FIN has already gone out in some `STREAM` frame, so a `finish()` landing
    /// after all of a stream's data was already transmitted doesn't get silently dropped: once
    /// `collect_stream_frames` finds no more buffered bytes, this is what tells it a bare FIN is
    /// still owed versus already sent.
    stream_fin_sent: std::collections::HashSet<u64>,
    /// This endpoint's own stateless reset token, handed to the peer via transport parameters
    /// (server only, per RFC 9000 §10.3 — a client-sent one is a malformed-param error).
    local_reset_token: [u8; 16],
    /// The peer's stateless reset token, learned from its transport parameters once the
    /// handshake completes. Only ever `Some` on the client, since only servers send one (§4.6).
    peer_reset_token: Option<[u8; 16]>,
}

impl Connection {
    /// `dst_cid` is the first connection id this endpoint will address packets to (the peer's);
    /// `src_cid` is this endpoint's own, already minted by the caller's
    /// `cid::ConnectionIdGenerator` before `Connection` ever sees it.
    pub fn new(
        is_client: bool,
        config: TransportConfig,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    ) -> QuicheResult<Self> {
        let role = if is_client { CryptoRole::Client } else { CryptoRole::Server };
        let mut crypto = CryptoContext::new(role);
        crypto.install_initial(dst_cid.as_bytes())?;

        let mut local_reset_token = [0u8; 16];
        SystemRandom::new()
            .fill(&mut local_reset_token)
            .map_err(|_| QuicheError::Msg("failed to generate stateless reset token".into()))?;

        let local_params = TransportParameters {
            initial_max_stream_data: config.initial_max_stream_data,
            initial_max_data: config.initial_max_data,
            idle_timeout_ms: config.max_idle_timeout.as_millis() as u64,
            max_stream_id: config.max_concurrent_bidi_streams,
            ack_delay_exponent: config.ack_delay_exponent as u64,
            max_ack_delay_ms: config.max_ack_delay.as_millis() as u64,
            preferred_address: None,
            stateless_reset_token: if is_client { None } else { Some(local_reset_token) },
        };
        let tls_role = if is_client { TlsRole::Client } else { TlsRole::Server };
        let tls = MockHandshake::new(tls_role, dst_cid.as_bytes().to_vec(), local_params);

        let streams = Streams::new(
            is_client,
            config.max_concurrent_bidi_streams,
            0,
            config.initial_max_stream_data,
            config.initial_max_stream_data,
            config.send_window,
            config.initial_max_data,
        );
        let recovery = Recovery::new(config.initial_rtt, config.packet_threshold, config.time_threshold);

        Ok(Self {
            is_client,
            state: ConnectionState::Initial,
            config,
            crypto,
            tls: Some(tls),
            recovery,
            streams,
            dispatcher: Dispatcher::default(),
            dst_cid,
            src_cid,
            version,
            next_pn: [0; 3],
            acks: [AckTracker::new(true), AckTracker::new(true), AckTracker::new(false)],
            peer_params: None,
            close_reason: None,
            closing_deadline: None,
            last_activity: Instant::now(),
            pending_close_frame: None,
            pending_crypto: [Vec::new(), Vec::new(), Vec::new()],
            crypto_offset: [0, 0, 0],
            retransmit_queue: [Vec::new(), Vec::new(), Vec::new()],
            pending_control: Vec::new(),
            stream_unsent_from: HashMap::new(),
            stream_fin_sent: std::collections::HashSet::new(),
            local_reset_token,
            peer_reset_token: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Emits the client's first flight (a mock "ClientHello" carrying its transport parameters)
    /// into the Initial CRYPTO stream. A no-op on server-side connections, which wait for the
    /// client's first datagram instead.
    pub fn start(&mut self) -> QuicheResult<()> {
        if !self.is_client {
            return Ok(());
        }
        let mut tls = self.tls.take().ok_or_else(|| QuicheError::Msg("handshake collaborator missing".into()))?;
        {
            let mut sink = HandshakeSink::new(&mut self.crypto);
            tls.start(&mut sink);
        }
        self.drain_handshake_outbox(&mut tls);
        self.tls = Some(tls);
        self.state = ConnectionState::Handshake;
        debug!(dst_cid = ?self.dst_cid, "client handshake started");
        Ok(())
    }

    /// Produces the next outgoing datagram, or `None` if there is nothing to send right now.
    /// Tries each packet-number space in order and returns as soon as one has frames to carry.
    pub fn poll_transmit(&mut self, now: Instant) -> QuicheResult<Option<Vec<u8>>> {
        let highest = self.highest_available_space();
        for &space in PnSpace::ALL.iter() {
            if !self.crypto.has_space(space) {
                continue;
            }
            let frames = self.collect_outgoing_frames(space, highest, now);
            if frames.is_empty() {
                continue;
            }
            let pn = self.next_pn[space.index()];
            self.next_pn[space.index()] += 1;
            let header = self.make_header(space);
            let keys = &self.crypto.keys(space)?.local;
            let largest_acked = self.recovery.largest_acked(space);
            let wire = packet::protect(&header, pn, largest_acked, &frames, keys)?;
            self.recovery.on_packet_sent(space, pn, frames, wire.len() as u64, now);
            return Ok(Some(wire));
        }
        Ok(None)
    }

    fn highest_available_space(&self) -> PnSpace {
        if self.crypto.has_space(PnSpace::Application) {
            PnSpace::Application
        } else if self.crypto.has_space(PnSpace::Handshake) {
            PnSpace::Handshake
        } else {
            PnSpace::Initial
        }
    }

    fn collect_outgoing_frames(&mut self, space: PnSpace, highest: PnSpace, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        frames.append(&mut self.retransmit_queue[space.index()]);
        if let Some(ack) = self.ack_if_due(space, now) {
            frames.push(ack);
        }
        frames.append(&mut self.pending_crypto[space.index()]);
        if space == PnSpace::Application {
            frames.append(&mut self.pending_control);
            frames.extend(self.collect_stream_frames(MAX_DATAGRAM_SIZE.saturating_sub(64)));
        }
        if space == highest {
            if let Some(close) = self.pending_close_frame.take() {
                frames.push(close);
            }
        }
        frames
    }

    fn ack_if_due(&mut self, space: PnSpace, now: Instant) -> Option<Frame> {
        let max_ack_delay = self.config.max_ack_delay;
        let tracker = &mut self.acks[space.index()];
        if tracker.ack_due(now, max_ack_delay) {
            tracker.generate(Duration::ZERO)
        } else {
            None
        }
    }

    /// Walks every stream with data queued and not yet sent, packing up to `budget` bytes of
    /// fresh `STREAM` frames. Lost data is handled separately, through `retransmit_queue`.
    fn collect_stream_frames(&mut self, mut budget: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        for raw_id in self.streams.stream_ids() {
            if budget == 0 {
                break;
            }
            if self.stream_fin_sent.contains(&raw_id) {
                continue;
            }
            let Some(stream) = self.streams.get(raw_id) else { continue };
            let Some(send) = &stream.send else { continue };
            let cursor = *self.stream_unsent_from.get(&raw_id).unwrap_or(&0);
            match send.range(cursor, budget) {
                Some((offset, data)) if !data.is_empty() => {
                    let new_cursor = offset + data.len() as u64;
                    let fin = send.final_offset() == Some(new_cursor);
                    self.stream_unsent_from.insert(raw_id, new_cursor);
                    budget = budget.saturating_sub(data.len());
                    if fin {
                        self.stream_fin_sent.insert(raw_id);
                    }
                    frames.push(Frame::Stream { stream_id: raw_id, offset, fin, data: Bytes::from(data) });
                }
                // `range` has nothing left buffered from `cursor` on — if `finish()` landed after
                // the last chunk was already sent, the FIN itself still hasn't gone out.
                _ if send.final_offset() == Some(cursor) => {
                    self.stream_fin_sent.insert(raw_id);
                    frames.push(Frame::Stream { stream_id: raw_id, offset: cursor, fin: true, data: Bytes::new() });
                }
                _ => {}
            }
        }
        frames
    }

    fn make_header(&self, space: PnSpace) -> Header {
        match space {
            PnSpace::Initial => Header::Long(LongHeader::initial(self.version, self.dst_cid.clone(), self.src_cid.clone(), Vec::new())),
            PnSpace::Handshake => Header::Long(LongHeader::handshake(self.version, self.dst_cid.clone(), self.src_cid.clone())),
            PnSpace::Application => Header::Short(ShortHeader::new(self.dst_cid.clone(), false)),
        }
    }

    fn build_close_frame(&self) -> Option<Frame> {
        match self.close_reason.as_ref()? {
            CloseReason::Transport { code, reason } => {
                Some(Frame::ConnectionClose { error_code: *code, frame_type: 0, reason: Bytes::from_static(reason.as_bytes()) })
            }
            CloseReason::Application { code } => Some(Frame::ApplicationClose { error_code: *code, reason: Bytes::new() }),
            CloseReason::PeerInitiated { .. } | CloseReason::IdleTimeout | CloseReason::StatelessReset => None,
        }
    }

    /// Processes one received, still-protected datagram: unprotects it against whichever
    /// space's keys apply, records it for the ACK policy, and dispatches its frames.
    pub fn recv_datagram(&mut self, datagram: &[u8], now: Instant) -> QuicheResult<()> {
        self.last_activity = now;
        let Some(space) = packet::peek_space(datagram)? else {
            // Version negotiation / Retry packets carry no packet number; neither is modeled
            // beyond being recognized and ignored here (single fixed version, per Non-goals).
            return Ok(());
        };
        if !self.crypto.has_space(space) {
            return Ok(());
        }
        let dst_cid_len = self.src_cid.cid_len as usize;
        let largest_seen = self.acks[space.index()].largest_received();
        let remote_keys = &self.crypto.keys(space)?.remote;
        let pkt = match packet::unprotect(datagram, dst_cid_len, largest_seen, remote_keys) {
            Ok(pkt) => pkt,
            // AEAD or header-protection failure: before discarding, check whether the tail of
            // the datagram is actually the peer's stateless reset token (§4.6) — a peer that has
            // lost all state for this connection sends one instead of a real packet, and it is
            // indistinguishable from noise until this comparison fails to match.
            Err(err) => {
                if self.looks_like_stateless_reset(datagram) {
                    debug!("received stateless reset, entering draining");
                    self.enter_draining(CloseReason::StatelessReset, now);
                    return Ok(());
                }
                trace!(?space, %err, "discarding packet that failed to unprotect");
                return Ok(());
            }
        };

        if self.state.is_terminal() {
            if self.state == ConnectionState::Closing {
                self.pending_close_frame = self.build_close_frame();
            }
            return Ok(());
        }

        let ack_eliciting = pkt.frames.iter().any(Frame::is_ack_eliciting);
        self.acks[space.index()].on_packet_received(pkt.packet_number, ack_eliciting, now);

        for frame in pkt.frames {
            self.handle_frame(space, frame, now)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, space: PnSpace, frame: Frame, now: Instant) -> QuicheResult<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack { ack_delay, ranges, .. } => {
                // Capture an RTT sample from the newest-acked packet before `on_ack_received`
                // evicts its sent-packet record.
                if let Some(newest_pn) = ranges.iter().map(|r| r.largest).max() {
                    if let Some(sent_at) = self.recovery.sent_at(space, newest_pn) {
                        self.recovery.sample_rtt(sent_at, now, Duration::from_micros(ack_delay));
                    }
                }
                let acked = self.recovery.on_ack_received(space, &ranges);
                self.apply_stream_acks(&acked);
            }
            Frame::RstStream { stream_id, final_offset, .. } => {
                self.streams.on_rst_stream(stream_id, final_offset).map_err(Self::streams_err_to_quiche)?;
            }
            Frame::StopSending { stream_id, .. } => {
                let final_offset = self.streams.send_write_offset(stream_id).unwrap_or(0);
                self.streams.on_stop_sending(stream_id).map_err(Self::streams_err_to_quiche)?;
                self.stream_fin_sent.insert(stream_id);
                self.pending_control.push(Frame::RstStream { stream_id, app_error_code: 0, final_offset });
            }
            Frame::Crypto { data, .. } => self.feed_handshake(space, data.to_vec(), now)?,
            Frame::MaxData { max_data } => self.streams.raise_conn_send_limit(max_data),
            Frame::MaxStreamData { stream_id, max_stream_data } => {
                self.streams.raise_stream_send_limit(stream_id, max_stream_data).map_err(Self::streams_err_to_quiche)?;
            }
            Frame::MaxStreamId { max_stream_id } => self.streams.set_max_local_bidi(max_stream_id),
            Frame::Blocked { .. } | Frame::StreamBlocked { .. } | Frame::StreamIdBlocked { .. } => {
                // This connection extends flow-control windows proactively (§4.5) rather than
                // waiting to be asked, so these are informational only.
            }
            Frame::NewConnectionId { .. } => {
                // Path migration and CID rotation are out of scope (Non-goals); accepted and
                // otherwise ignored.
            }
            Frame::PathChallenge { data } => self.pending_control.push(Frame::PathResponse { data }),
            Frame::PathResponse { .. } => {}
            Frame::ConnectionClose { error_code, .. } => {
                self.enter_draining(CloseReason::PeerInitiated { code: error_code }, now);
            }
            Frame::ApplicationClose { error_code, .. } => {
                self.enter_draining(CloseReason::PeerInitiated { code: error_code }, now);
            }
            Frame::Stream { stream_id, offset, fin, data } => {
                self.streams.on_stream_frame(stream_id, offset, &data, fin).map_err(Self::streams_err_to_quiche)?;
                if let Some(new_limit) = self.streams.stream_recv_extend(stream_id) {
                    self.pending_control.push(Frame::MaxStreamData { stream_id, max_stream_data: new_limit });
                }
                if let Some(new_limit) = self.streams.conn_recv_extend() {
                    self.pending_control.push(Frame::MaxData { max_data: new_limit });
                }
            }
        }
        Ok(())
    }

    fn apply_stream_acks(&mut self, frames: &[Frame]) {
        for frame in frames {
            match frame {
                Frame::Stream { stream_id, offset, data, .. } => {
                    if let Some(stream) = self.streams.get_mut(*stream_id) {
                        if let Some(send) = &mut stream.send {
                            send.ack(offset + data.len() as u64);
                        }
                    }
                }
                Frame::RstStream { stream_id, .. } => {
                    if let Some(stream) = self.streams.get_mut(*stream_id) {
                        if let Some(send) = &mut stream.send {
                            send.reset_acknowledged();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn streams_err_to_quiche(err: StreamsError) -> QuicheError {
        match err {
            StreamsError::IdBlocked { stream_id, limit } => TransportError::StreamIdBlocked { stream_id, limit }.into(),
            StreamsError::NoSuchStream { stream_id } => TransportError::StreamState { stream_id }.into(),
            StreamsError::Recv(RecvError::FlowControl { received, credit }) => TransportError::FlowControl { received, credit }.into(),
            StreamsError::Recv(RecvError::FinalSize { prior, new }) => TransportError::FinalSize { prior, new }.into(),
            StreamsError::Send(_) => TransportError::ProtocolViolation("send error on stream").into(),
        }
    }

    /// Feeds a CRYPTO frame's payload to the handshake collaborator and drives it forward.
    /// `offset` isn't tracked here: `MockHandshake` only ever emits one complete flight per
    /// space rather than streaming bytes incrementally, so out-of-order CRYPTO reassembly
    /// (unlike STREAM data) never comes up against it.
    fn feed_handshake(&mut self, space: PnSpace, data: Vec<u8>, now: Instant) -> QuicheResult<()> {
        let mut tls = self.tls.take().ok_or_else(|| QuicheError::Msg("handshake collaborator missing".into()))?;
        tls.write_handshake(space, &data);
        let done_before = tls.is_handshake_complete();
        {
            let mut sink = HandshakeSink::new(&mut self.crypto);
            tls.drive(&mut sink);
        }
        self.drain_handshake_outbox(&mut tls);
        let done_after = tls.is_handshake_complete();
        self.tls = Some(tls);

        if self.state == ConnectionState::Initial {
            self.state = ConnectionState::Handshake;
        }
        if !done_before && done_after {
            self.on_handshake_complete(now)?;
        }
        Ok(())
    }

    fn drain_handshake_outbox(&mut self, tls: &mut MockHandshake) {
        while let Some((space, data)) = tls.read_handshake() {
            let idx = space.index();
            let offset = self.crypto_offset[idx];
            self.crypto_offset[idx] += data.len() as u64;
            self.pending_crypto[idx].push(Frame::Crypto { offset, data: Bytes::from(data) });
        }
    }

    fn on_handshake_complete(&mut self, _now: Instant) -> QuicheResult<()> {
        self.state = ConnectionState::PostHandshake;
        debug!(is_client = self.is_client, "handshake complete");
        if let Some(tls) = &self.tls {
            if let Some(peer_blob) = tls.peer_transport_params() {
                let direction = if self.is_client { Direction::ServerToClient } else { Direction::ClientToServer };
                let params = TransportParameters::decode(peer_blob, direction)?;
                self.streams.set_max_local_bidi(params.max_stream_id);
                self.streams.raise_conn_send_limit(params.initial_max_data);
                self.peer_reset_token = params.stateless_reset_token;
                self.peer_params = Some(params);
            }
        }
        Ok(())
    }

    /// Runs periodic work: loss detection, the closing/draining deadline, and the idle timer
    /// (§4.6, §4.8). Callers drive this from whatever timer `next_timeout` asks for.
    pub fn on_timeout(&mut self, now: Instant) -> QuicheResult<()> {
        if self.state.is_terminal() {
            if let Some(deadline) = self.closing_deadline {
                if now >= deadline {
                    self.state = ConnectionState::Closed;
                }
            }
            return Ok(());
        }
        if now.saturating_duration_since(self.last_activity) >= self.config.max_idle_timeout {
            warn!("idle timeout expired, closing connection");
            self.close_reason = Some(CloseReason::IdleTimeout);
            self.state = ConnectionState::Closed;
            return Ok(());
        }
        for &space in PnSpace::ALL.iter() {
            if !self.crypto.has_space(space) {
                continue;
            }
            let lost = self.recovery.detect_lost(space, now);
            if !lost.is_empty() {
                trace!(?space, count = lost.len(), "declaring packets lost");
                self.retransmit_queue[space.index()].extend(lost);
            }
        }
        Ok(())
    }

    /// The next instant `on_timeout` needs calling at, for a caller's timer wheel (§4.8).
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut candidates = Vec::new();
        if let Some(deadline) = self.closing_deadline {
            candidates.push(deadline);
        }
        for &space in PnSpace::ALL.iter() {
            if let Some(deadline) = self.acks[space.index()].next_deadline(self.config.max_ack_delay) {
                candidates.push(deadline);
            }
        }
        candidates.push(self.last_activity + self.config.max_idle_timeout);
        candidates.into_iter().min()
    }

    pub fn close_application(&mut self, code: u64, now: Instant) {
        self.begin_closing(CloseReason::Application { code }, now);
    }

    pub fn close_transport(&mut self, code: u64, reason: &'static str, now: Instant) {
        self.begin_closing(CloseReason::Transport { code, reason }, now);
    }

    /// Enters `Closing`, queuing a close frame to be repeated for 3*PTO (§4.6; idempotent — a
    /// caller retrying an already-closing connection is a no-op).
    fn begin_closing(&mut self, reason: CloseReason, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        debug!(?reason, "closing connection");
        self.close_reason = Some(reason);
        self.state = ConnectionState::Closing;
        self.pending_close_frame = self.build_close_frame();
        self.closing_deadline = Some(now + self.recovery.rtt().pto() * 3);
    }

    /// Enters `Draining` in response to the peer's own close frame: no further packets are
    /// sent, but the connection lingers for 3*PTO to absorb reordered/duplicate packets (§4.6).
    fn enter_draining(&mut self, reason: CloseReason, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        debug!(?reason, "entering draining state");
        self.close_reason = Some(reason);
        self.state = ConnectionState::Draining;
        self.closing_deadline = Some(now + self.recovery.rtt().pto() * 3);
    }

    /// Whether the last 16 bytes of an otherwise-undecryptable datagram match the peer's
    /// stateless reset token. Only ever true on a client that has one (§4.6: only servers send
    /// one, and only after the handshake that carried it has completed).
    fn looks_like_stateless_reset(&self, datagram: &[u8]) -> bool {
        let Some(token) = self.peer_reset_token else { return false };
        datagram.len() >= 16 && datagram[datagram.len() - 16..] == token
    }

    pub fn set_multiplex_mode(&mut self, mode: Mode) {
        self.dispatcher = Dispatcher::new(mode);
    }

    pub fn open_tagged_stream(&mut self, tag: Tag) -> QuicheResult<u64> {
        self.dispatcher.open(&mut self.streams, tag)
    }

    pub fn recover_stream_tag(raw_stream_id: u64) -> Option<Tag> {
        Dispatcher::recover_tag(raw_stream_id)
    }

    /// Every stream id this connection currently knows about, for a caller (`endpoint::Endpoint`)
    /// that wants to poll each one for newly readable data after a datagram comes in.
    pub fn stream_ids(&self) -> Vec<u64> {
        self.streams.stream_ids()
    }

    pub fn stream_write(&mut self, raw_id: u64, data: &[u8]) -> QuicheResult<usize> {
        self.streams.write(raw_id, data).map_err(Self::streams_err_to_quiche)
    }

    pub fn stream_read(&mut self, raw_id: u64) -> QuicheResult<Option<Vec<u8>>> {
        self.streams.read(raw_id).map_err(Self::streams_err_to_quiche)
    }

    pub fn stream_finish(&mut self, raw_id: u64) -> QuicheResult<()> {
        let stream = self.streams.get_mut(raw_id).ok_or_else(|| QuicheError::Msg("no such stream".into()))?;
        let send = stream.send.as_mut().ok_or_else(|| QuicheError::Msg("stream has no send half".into()))?;
        send.finish();
        Ok(())
    }

    /// Abrupt stream abort (§4.5's `shutdown_write`): discards whatever was still queued and
    /// queues an `RST_STREAM` carrying the current write offset as final offset, rather than
    /// waiting for the remaining bytes to drain the way `stream_finish` does.
    pub fn stream_reset(&mut self, raw_id: u64, app_error_code: u64) -> QuicheResult<()> {
        let final_offset = self.streams.reset_stream(raw_id).map_err(Self::streams_err_to_quiche)?;
        self.stream_fin_sent.insert(raw_id);
        self.pending_control.push(Frame::RstStream { stream_id: raw_id, app_error_code, final_offset });
        Ok(())
    }
}

/// Bridges the owned-vs-borrowed conflict between `Connection` holding its TLS collaborator and
/// needing to be that collaborator's sink at the same time: `tls` is temporarily taken out of
/// `Connection` for the duration of a `start`/`drive` call, leaving this short-lived borrow of
/// just the crypto context to stand in as the sink instead of the whole connection.
struct HandshakeSink<'a> {
    crypto: &'a mut CryptoContext,
    /// `MockHandshake::install_secret` always calls `Client` then `Server` back-to-back for the
    /// same space, so this only ever holds the first half of a pair awaiting its second.
    pending_client: Option<(PnSpace, Vec<u8>)>,
}

impl<'a> HandshakeSink<'a> {
    fn new(crypto: &'a mut CryptoContext) -> Self {
        Self { crypto, pending_client: None }
    }
}

impl<'a> TlsToQuic for HandshakeSink<'a> {
    fn on_new_secret(&mut self, direction: SecretDirection, space: PnSpace, secret: Vec<u8>) {
        // Initial-space keys always come from `CryptoContext::install_initial` (derived from the
        // destination connection id, §4.2) rather than the TLS collaborator — real QUIC never
        // sources them from TLS either, and `MockHandshake` derives its own (different, but
        // still symmetric) Initial secret, which would otherwise overwrite `install_initial`'s.
        if space == PnSpace::Initial {
            return;
        }
        match direction {
            SecretDirection::Client => self.pending_client = Some((space, secret)),
            SecretDirection::Server => {
                if let Some((pending_space, client_secret)) = self.pending_client.take() {
                    if pending_space == space {
                        let _ = self.crypto.install(space, &Secrets { client: client_secret, server: secret });
                    }
                }
            }
        }
    }

    fn on_handshake_done(&mut self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cid::{ConnectionIdGenerator, Role as CidRole};

    fn make_pair() -> (Connection, Connection) {
        let client_gen = ConnectionIdGenerator::new(CidRole::Client).unwrap();
        let server_gen = ConnectionIdGenerator::new(CidRole::Server).unwrap();
        let client_cid = client_gen.generate().unwrap();
        let server_cid = server_gen.generate().unwrap();

        let mut client =
            Connection::new(true, TransportConfig::default(), crate::MINI_QUICHE_VERSION, server_cid.clone(), client_cid.clone()).unwrap();
        let server = Connection::new(false, TransportConfig::default(), crate::MINI_QUICHE_VERSION, client_cid, server_cid).unwrap();
        client.start().unwrap();
        (client, server)
    }

    fn pump(a: &mut Connection, b: &mut Connection, now: Instant) {
        for _ in 0..16 {
            let mut progressed = false;
            while let Some(dgram) = a.poll_transmit(now).unwrap() {
                b.recv_datagram(&dgram, now).unwrap();
                progressed = true;
            }
            while let Some(dgram) = b.poll_transmit(now).unwrap() {
                a.recv_datagram(&dgram, now).unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    #[test]
    fn handshake_completes_on_both_sides() {
        let (mut client, mut server) = make_pair();
        let now = Instant::now();
        pump(&mut client, &mut server, now);
        assert!(client.state().is_established());
        assert!(server.state().is_established());
    }

    #[test]
    fn stream_data_round_trips_after_handshake() {
        let (mut client, mut server) = make_pair();
        let now = Instant::now();
        pump(&mut client, &mut server, now);

        let stream_id = client.streams.open_bidi().unwrap();
        client.stream_write(stream_id, b"hello from client").unwrap();
        client.stream_finish(stream_id).unwrap();

        pump(&mut client, &mut server, now);

        let mut received = Vec::new();
        while let Some(chunk) = server.stream_read(stream_id).unwrap() {
            received.extend(chunk);
        }
        assert_eq!(received, b"hello from client");
    }

    #[test]
    fn closing_twice_is_idempotent() {
        let (mut client, _server) = make_pair();
        let now = Instant::now();
        client.close_application(42, now);
        assert!(matches!(client.state(), ConnectionState::Closing));
        let deadline_first = client.closing_deadline;

        client.close_application(99, now + Duration::from_millis(5));
        assert_eq!(client.closing_deadline, deadline_first);
        match client.close_reason() {
            Some(CloseReason::Application { code }) => assert_eq!(*code, 42),
            other => panic!("expected the first close reason to stick, got {other:?}"),
        }
    }

    #[test]
    fn rst_stream_with_mismatched_final_offset_is_rejected() {
        let (mut client, mut server) = make_pair();
        let now = Instant::now();
        pump(&mut client, &mut server, now);

        let stream_id = client.streams.open_bidi().unwrap();
        client.stream_write(stream_id, &vec![9u8; 955]).unwrap();
        client.stream_finish(stream_id).unwrap();
        pump(&mut client, &mut server, now);

        // The server has already seen a FIN fixing this stream's final offset at 955; a
        // RST_STREAM claiming a different one is a protocol violation, not a legal correction.
        let err = server.handle_frame(PnSpace::Application, Frame::RstStream { stream_id, app_error_code: 0, final_offset: 956 }, now);
        match err {
            Err(QuicheError::Transport(TransportError::FinalSize { prior, new })) => {
                assert_eq!(prior, 955);
                assert_eq!(new, 956);
            }
            other => panic!("expected a FinalSize transport error, got {other:?}"),
        }
    }

    #[test]
    fn undecryptable_datagram_matching_the_peer_reset_token_triggers_stateless_reset() {
        let (mut client, mut server) = make_pair();
        let now = Instant::now();
        pump(&mut client, &mut server, now);
        assert!(client.state().is_established());
        assert_eq!(client.peer_reset_token, Some(server.local_reset_token));

        let mut bogus = vec![0x40u8; 40];
        let token_start = bogus.len() - 16;
        bogus[token_start..].copy_from_slice(&server.local_reset_token);

        client.recv_datagram(&bogus, now).unwrap();
        assert_eq!(client.state(), ConnectionState::Draining);
        assert!(matches!(client.close_reason(), Some(CloseReason::StatelessReset)));
    }
}
