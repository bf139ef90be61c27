//! User-space TCP state machine

use super::seq::{after, before, in_window};
use super::{CloseReason, SocketConfig, StateChange, TcpState};
use crate::error::{Error, Result};
use crate::frame::{TcpFlags, TcpFrame};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Receives everything a socket produces
///
/// Called without the socket lock held.
pub trait SocketObserver: Send + Sync {
    /// An outbound segment is ready for the wire
    fn on_segment(&self, segment: TcpFrame);

    /// The socket changed state
    fn on_state_change(&self, change: StateChange);
}

/// Per-socket counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Application bytes sent (first transmissions only)
    pub bytes_sent: u64,
    /// Application bytes delivered in order
    pub bytes_received: u64,
    /// Segments produced, retransmissions included
    pub segments_sent: u64,
    /// Segments handed to the socket
    pub segments_received: u64,
    /// Segments sent again after a timeout
    pub retransmissions: u64,
}

/// A sequence-consuming segment waiting for its ACK
struct Unacked {
    seq: u32,
    flags: TcpFlags,
    data: Bytes,
    sent_at: Instant,
    retries: u32,
}

impl Unacked {
    fn end(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            len += 1;
        }
        self.seq.wrapping_add(len)
    }
}

#[derive(Default)]
struct Outcome {
    segments: Vec<TcpFrame>,
    changes: Vec<StateChange>,
}

struct Inner {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    config: SocketConfig,
    state: TcpState,
    close_reason: Option<CloseReason>,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    // Peer's window and the segment that last set it
    snd_wnd: u32,
    snd_wl1: u32,
    snd_wl2: u32,
    send_mss: usize,
    send_queue: BytesMut,
    close_requested: bool,
    fin_seq: Option<u32>,
    unacked: VecDeque<Unacked>,

    irs: u32,
    rcv_nxt: u32,
    recv_buf: BytesMut,
    // Keyed by offset from the initial receive sequence so ordering survives wrap-around
    out_of_order: BTreeMap<u32, Bytes>,
    pending_fin: Option<u32>,
    fin_received: bool,

    connect_deadline: Option<Instant>,
    time_wait_deadline: Option<Instant>,
    persist_deadline: Option<Instant>,
    persist_backoff: u32,
    stats: SocketStats,
}

impl Inner {
    fn new(local: SocketAddrV4, remote: SocketAddrV4, config: SocketConfig) -> Self {
        let send_mss = usize::from(config.mss).max(1);
        Self {
            local,
            remote,
            config,
            state: TcpState::Closed,
            close_reason: None,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            send_mss,
            send_queue: BytesMut::new(),
            close_requested: false,
            fin_seq: None,
            unacked: VecDeque::new(),
            irs: 0,
            rcv_nxt: 0,
            recv_buf: BytesMut::new(),
            out_of_order: BTreeMap::new(),
            pending_fin: None,
            fin_received: false,
            connect_deadline: None,
            time_wait_deadline: None,
            persist_deadline: None,
            persist_backoff: 0,
            stats: SocketStats::default(),
        }
    }

    fn transition(&mut self, new: TcpState, reason: Option<CloseReason>, out: &mut Outcome) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;

        let mut change_reason = None;
        match new {
            TcpState::TimeWait => {
                self.time_wait_deadline = Some(Instant::now() + self.config.time_wait);
            }
            TcpState::Closed => {
                let reason = reason.unwrap_or(CloseReason::Normal);
                self.close_reason = Some(reason);
                change_reason = Some(reason);
                self.unacked.clear();
                self.connect_deadline = None;
                self.time_wait_deadline = None;
                self.persist_deadline = None;
                if reason.is_abnormal() {
                    self.send_queue.clear();
                    self.recv_buf.clear();
                    self.out_of_order.clear();
                    self.pending_fin = None;
                }
            }
            _ => {}
        }

        debug!(
            local = %self.local,
            remote = %self.remote,
            "TCP {} -> {}{}",
            old,
            new,
            change_reason.map(|r| format!(" ({r:?})")).unwrap_or_default()
        );
        out.changes.push(StateChange {
            old,
            new,
            reason: change_reason,
        });
    }

    fn segment(&self, flags: TcpFlags, seq: u32, data: Bytes) -> TcpFrame {
        let mut tcp = TcpFrame::new(self.local.port(), self.remote.port());
        tcp.seq = seq;
        tcp.flags = flags;
        if flags.contains(TcpFlags::ACK) {
            tcp.ack = self.rcv_nxt;
        }
        tcp.window = u16::try_from(self.rcv_wnd()).unwrap_or(u16::MAX);
        if flags.contains(TcpFlags::SYN) {
            tcp = tcp.with_mss_option(self.config.mss);
        }
        tcp.set_payload(data);
        tcp
    }

    /// Send a segment that occupies sequence space and track it for retransmission
    fn emit(&mut self, flags: TcpFlags, data: Bytes, out: &mut Outcome) {
        let seq = self.snd_nxt;
        let segment = self.segment(flags, seq, data.clone());
        self.snd_nxt = seq.wrapping_add(segment.segment_len());
        self.stats.segments_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        self.unacked.push_back(Unacked {
            seq,
            flags,
            data,
            sent_at: Instant::now(),
            retries: 0,
        });
        out.segments.push(segment);
    }

    fn send_ack(&mut self, out: &mut Outcome) {
        let segment = self.segment(TcpFlags::ACK, self.snd_nxt, Bytes::new());
        self.stats.segments_sent += 1;
        out.segments.push(segment);
    }

    fn send_rst(&mut self, out: &mut Outcome) {
        let segment = self.segment(TcpFlags::RST | TcpFlags::ACK, self.snd_nxt, Bytes::new());
        self.stats.segments_sent += 1;
        out.segments.push(segment);
    }

    /// RST answering a segment whose ACK makes no sense to us
    fn reset_for(&mut self, seg: &TcpFrame, out: &mut Outcome) {
        let segment = self.segment(TcpFlags::RST, seg.ack, Bytes::new());
        self.stats.segments_sent += 1;
        out.segments.push(segment);
    }

    /// Free receive buffer space; bytes held for the application count against it
    fn rcv_wnd(&self) -> u32 {
        let held = u32::try_from(self.recv_buf.len()).unwrap_or(u32::MAX);
        u32::from(self.config.window).saturating_sub(held)
    }

    /// Bytes the peer's window still admits beyond `snd_nxt`
    fn usable_window(&self) -> usize {
        let edge = self.snd_una.wrapping_add(self.snd_wnd);
        if after(edge, self.snd_nxt) {
            edge.wrapping_sub(self.snd_nxt) as usize
        } else {
            0
        }
    }

    /// Worth telling the peer that the window reopened
    fn window_reopened(&self, before: u32) -> bool {
        let threshold = (u32::from(self.config.window) / 2)
            .min(u32::from(self.config.mss))
            .max(1);
        self.state.is_synchronized()
            && !self.fin_received
            && before < threshold
            && self.rcv_wnd() >= threshold
    }

    /// Whether `send` may still queue bytes
    fn accepts_data(&self) -> bool {
        !self.close_requested
            && matches!(
                self.state,
                TcpState::Listen
                    | TcpState::SynSent
                    | TcpState::SynReceived
                    | TcpState::Established
                    | TcpState::CloseWait
            )
    }

    fn closed_error(&self) -> Error {
        match self.close_reason {
            Some(CloseReason::Reset) => Error::ConnectionReset,
            Some(CloseReason::ConnectTimeout) => {
                Error::connect_failed(self.remote, "handshake timed out")
            }
            Some(CloseReason::Timeout) => Error::Timeout {
                operation: "deliver a segment",
                after: self.config.retransmit_timeout * self.config.max_retransmissions,
            },
            Some(CloseReason::Aborted) => Error::StreamClosed,
            Some(CloseReason::Normal) | None => Error::InvalidState {
                operation: "use",
                state: self.state,
            },
        }
    }

    fn is_abnormally_closed(&self) -> bool {
        self.state == TcpState::Closed && self.close_reason.is_some_and(CloseReason::is_abnormal)
    }

    // ====== Local calls ======

    fn listen(&mut self, out: &mut Outcome) -> Result<()> {
        if self.state != TcpState::Closed {
            return Err(Error::InvalidState {
                operation: "listen on",
                state: self.state,
            });
        }
        self.transition(TcpState::Listen, None, out);
        Ok(())
    }

    fn connect(&mut self, out: &mut Outcome) -> Result<()> {
        if self.state != TcpState::Closed {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        self.iss = rand::random();
        self.snd_una = self.iss;
        self.snd_nxt = self.iss;
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        self.emit(TcpFlags::SYN, Bytes::new(), out);
        self.transition(TcpState::SynSent, None, out);
        Ok(())
    }

    fn send(&mut self, data: &[u8], out: &mut Outcome) -> Result<usize> {
        match self.state {
            TcpState::Listen | TcpState::SynSent | TcpState::SynReceived => {
                if self.close_requested {
                    return Err(Error::StreamClosed);
                }
                // Flushed once the handshake completes
                self.send_queue.extend_from_slice(data);
                Ok(data.len())
            }
            TcpState::Established | TcpState::CloseWait => {
                if self.close_requested {
                    return Err(Error::StreamClosed);
                }
                self.send_queue.extend_from_slice(data);
                self.transmit(out);
                Ok(data.len())
            }
            TcpState::Closed if self.is_abnormally_closed() => Err(self.closed_error()),
            TcpState::Closed => Err(Error::InvalidState {
                operation: "send on",
                state: self.state,
            }),
            _ => Err(Error::StreamClosed),
        }
    }

    fn close(&mut self, out: &mut Outcome) {
        match self.state {
            TcpState::Listen => self.transition(TcpState::Closed, Some(CloseReason::Normal), out),
            TcpState::SynSent | TcpState::SynReceived => self.close_requested = true,
            TcpState::Established | TcpState::CloseWait => {
                self.close_requested = true;
                self.transmit(out);
            }
            _ => {}
        }
    }

    fn abort(&mut self, out: &mut Outcome) {
        if self.state == TcpState::Closed {
            return;
        }
        if self.state.is_synchronized() || self.state == TcpState::SynReceived {
            self.send_rst(out);
        }
        self.transition(TcpState::Closed, Some(CloseReason::Aborted), out);
    }

    /// Segment queued bytes the peer's window admits and send the deferred FIN when due
    fn transmit(&mut self, out: &mut Outcome) {
        while !self.send_queue.is_empty() {
            let usable = self.usable_window();
            if usable == 0 {
                break;
            }
            let n = self.send_mss.min(self.send_queue.len()).min(usable);
            let chunk = self.send_queue.split_to(n).freeze();
            self.emit(TcpFlags::ACK | TcpFlags::PSH, chunk, out);
        }

        // Nothing in flight will bring an ACK; poll the closed window
        if !self.send_queue.is_empty() && self.unacked.is_empty() {
            if self.persist_deadline.is_none() {
                self.persist_backoff = 0;
                self.persist_deadline = Some(Instant::now() + self.config.retransmit_timeout);
            }
        } else {
            self.persist_deadline = None;
        }

        if self.close_requested && self.fin_seq.is_none() && self.send_queue.is_empty() {
            self.fin_seq = Some(self.snd_nxt);
            self.emit(TcpFlags::FIN | TcpFlags::ACK, Bytes::new(), out);
            match self.state {
                TcpState::Established => self.transition(TcpState::FinWait1, None, out),
                TcpState::CloseWait => self.transition(TcpState::LastAck, None, out),
                _ => {}
            }
        }
    }

    fn establish(&mut self, out: &mut Outcome) {
        self.connect_deadline = None;
        self.transition(TcpState::Established, None, out);
        self.transmit(out);
    }

    // ====== Segment arrival ======

    fn segment_arrives(&mut self, seg: &TcpFrame, out: &mut Outcome) {
        self.stats.segments_received += 1;
        trace!(
            local = %self.local,
            state = %self.state,
            flags = %seg.flags,
            seq = seg.seq,
            ack = seg.ack,
            len = seg.payload_len(),
            "Segment arrives"
        );
        match self.state {
            TcpState::Closed => {}
            TcpState::Listen => self.on_listen(seg, out),
            TcpState::SynSent => self.on_syn_sent(seg, out),
            _ => self.on_synchronized(seg, out),
        }
    }

    fn accept_syn(&mut self, seg: &TcpFrame) {
        self.irs = seg.seq;
        self.rcv_nxt = seg.seq.wrapping_add(1);
        self.snd_wnd = u32::from(seg.window);
        self.snd_wl1 = seg.seq;
        self.snd_wl2 = seg.ack;
        if let Some(mss) = seg.mss_option() {
            self.send_mss = usize::from(mss.min(self.config.mss)).max(1);
        }
    }

    fn on_listen(&mut self, seg: &TcpFrame, out: &mut Outcome) {
        if !seg.flags.is_pure_syn() || seg.flags.contains(TcpFlags::RST) {
            return;
        }
        self.accept_syn(seg);
        self.iss = rand::random();
        self.snd_una = self.iss;
        self.snd_nxt = self.iss;
        self.emit(TcpFlags::SYN | TcpFlags::ACK, Bytes::new(), out);
        self.transition(TcpState::SynReceived, None, out);
    }

    fn on_syn_sent(&mut self, seg: &TcpFrame, out: &mut Outcome) {
        let flags = seg.flags;
        let has_ack = flags.contains(TcpFlags::ACK);
        let ack_ok = has_ack && seg.ack == self.snd_nxt;

        if has_ack && !ack_ok {
            if !flags.contains(TcpFlags::RST) {
                self.reset_for(seg, out);
            }
            return;
        }
        if flags.contains(TcpFlags::RST) {
            if ack_ok {
                self.transition(TcpState::Closed, Some(CloseReason::Reset), out);
            }
            return;
        }
        if !flags.contains(TcpFlags::SYN) {
            return;
        }

        self.accept_syn(seg);
        if ack_ok {
            self.acknowledge(seg.ack);
            self.send_ack(out);
            self.establish(out);
        } else {
            // Simultaneous open: answer with a SYN-ACK that reuses our ISS
            let synack = self.segment(TcpFlags::SYN | TcpFlags::ACK, self.iss, Bytes::new());
            self.stats.segments_sent += 1;
            out.segments.push(synack);
            self.transition(TcpState::SynReceived, None, out);
        }
    }

    // A segment starting at rcv_nxt stays acceptable with a closed window so
    // its ACK is processed; its data is trimmed in `receive_text`
    fn acceptable(&self, seq: u32, len: u32) -> bool {
        let hi = self.rcv_nxt.wrapping_add(self.rcv_wnd().max(1));
        if len == 0 {
            seq == self.rcv_nxt || in_window(seq, self.rcv_nxt, hi)
        } else {
            in_window(seq, self.rcv_nxt, hi)
                || in_window(seq.wrapping_add(len - 1), self.rcv_nxt, hi)
        }
    }

    /// Take the peer's window from segments newer than the one that last set it
    fn update_window(&mut self, seg: &TcpFrame) {
        let newer = before(self.snd_wl1, seg.seq)
            || (self.snd_wl1 == seg.seq && !before(seg.ack, self.snd_wl2));
        if newer {
            if u32::from(seg.window) != self.snd_wnd {
                trace!(remote = %self.remote, window = seg.window, "Peer window updated");
            }
            self.snd_wnd = u32::from(seg.window);
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
        }
    }

    /// Advance `snd_una` and drop fully acknowledged segments
    fn acknowledge(&mut self, ack: u32) {
        if !after(ack, self.snd_una) || after(ack, self.snd_nxt) {
            return;
        }
        self.snd_una = ack;
        while let Some(front) = self.unacked.front() {
            if after(front.end(), ack) {
                break;
            }
            self.unacked.pop_front();
        }
    }

    fn on_synchronized(&mut self, seg: &TcpFrame, out: &mut Outcome) {
        let flags = seg.flags;

        // Peer did not see our SYN-ACK
        if self.state == TcpState::SynReceived
            && flags.contains(TcpFlags::SYN)
            && seg.seq == self.irs
        {
            if !flags.contains(TcpFlags::ACK) {
                let synack = self.segment(TcpFlags::SYN | TcpFlags::ACK, self.iss, Bytes::new());
                self.stats.segments_sent += 1;
                out.segments.push(synack);
                return;
            }
            if seg.ack == self.snd_nxt {
                self.acknowledge(seg.ack);
                self.send_ack(out);
                self.establish(out);
            }
            return;
        }

        if !self.acceptable(seg.seq, seg.segment_len()) {
            if !flags.contains(TcpFlags::RST) {
                self.send_ack(out);
            }
            return;
        }

        if flags.contains(TcpFlags::RST) {
            self.transition(TcpState::Closed, Some(CloseReason::Reset), out);
            return;
        }
        if flags.contains(TcpFlags::SYN) {
            self.send_ack(out);
            return;
        }
        if !flags.contains(TcpFlags::ACK) {
            return;
        }

        if self.state == TcpState::SynReceived {
            if in_window(
                seg.ack,
                self.snd_una.wrapping_add(1),
                self.snd_nxt.wrapping_add(1),
            ) {
                self.acknowledge(seg.ack);
                self.establish(out);
            } else {
                self.reset_for(seg, out);
                return;
            }
        }

        if after(seg.ack, self.snd_nxt) {
            self.send_ack(out);
            return;
        }
        if !before(seg.ack, self.snd_una) {
            self.update_window(seg);
        }
        self.acknowledge(seg.ack);
        if matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            self.transmit(out);
        }

        if self.fin_seq.is_some() && self.snd_una == self.snd_nxt {
            match self.state {
                TcpState::FinWait1 => self.transition(TcpState::FinWait2, None, out),
                TcpState::Closing => self.transition(TcpState::TimeWait, None, out),
                TcpState::LastAck => {
                    self.transition(TcpState::Closed, Some(CloseReason::Normal), out);
                    return;
                }
                _ => {}
            }
        }

        let data = seg.payload_bytes();
        let fin = flags.contains(TcpFlags::FIN);
        if data.is_empty() && !fin {
            return;
        }
        match self.state {
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                self.receive_text(seg.seq, data, fin, out);
                self.send_ack(out);
            }
            TcpState::TimeWait => {
                self.time_wait_deadline = Some(Instant::now() + self.config.time_wait);
                self.send_ack(out);
            }
            _ => self.send_ack(out),
        }
    }

    fn receive_text(&mut self, seq: u32, data: Bytes, fin: bool, out: &mut Outcome) {
        let (seq, mut data) = if before(seq, self.rcv_nxt) {
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            (self.rcv_nxt, if skip >= data.len() { Bytes::new() } else { data.slice(skip..) })
        } else {
            (seq, data)
        };

        // Bytes past the right edge of the window are dropped, and a FIN behind them with them
        let edge = self.rcv_nxt.wrapping_add(self.rcv_wnd());
        let room = if after(seq, edge) { 0 } else { edge.wrapping_sub(seq) as usize };
        let fin = if data.len() > room {
            trace!(local = %self.local, dropped = data.len() - room, "Segment trimmed to window");
            data.truncate(room);
            false
        } else {
            fin
        };
        if fin && !self.fin_received {
            self.pending_fin = Some(seq.wrapping_add(data.len() as u32));
        }

        if !data.is_empty() {
            if seq == self.rcv_nxt {
                self.deliver(&data);
                self.drain_out_of_order();
            } else {
                let key = seq.wrapping_sub(self.irs);
                let keep = self
                    .out_of_order
                    .get(&key)
                    .map_or(true, |held| held.len() < data.len());
                if keep {
                    self.out_of_order.insert(key, data);
                }
            }
        }

        if self.pending_fin == Some(self.rcv_nxt) {
            self.pending_fin = None;
            self.fin_received = true;
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.out_of_order.clear();
            match self.state {
                TcpState::Established => self.transition(TcpState::CloseWait, None, out),
                TcpState::FinWait1 => self.transition(TcpState::Closing, None, out),
                TcpState::FinWait2 => self.transition(TcpState::TimeWait, None, out),
                _ => {}
            }
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
        self.stats.bytes_received += data.len() as u64;
        self.recv_buf.extend_from_slice(data);
    }

    fn drain_out_of_order(&mut self) {
        loop {
            let next = self.rcv_nxt.wrapping_sub(self.irs);
            let Some((&key, _)) = self.out_of_order.first_key_value() else {
                break;
            };
            if key > next {
                break;
            }
            let Some(data) = self.out_of_order.remove(&key) else {
                break;
            };
            let skip = (next - key) as usize;
            if skip < data.len() {
                self.deliver(&data[skip..]);
            }
        }
    }

    // ====== Timers ======

    fn tick(&mut self, now: Instant, out: &mut Outcome) {
        match self.state {
            TcpState::SynSent if self.connect_deadline.is_some_and(|d| now >= d) => {
                warn!(remote = %self.remote, "Connect timed out");
                self.transition(TcpState::Closed, Some(CloseReason::ConnectTimeout), out);
                return;
            }
            TcpState::TimeWait if self.time_wait_deadline.is_some_and(|d| now >= d) => {
                self.transition(TcpState::Closed, Some(CloseReason::Normal), out);
                return;
            }
            TcpState::Closed => return,
            _ => {}
        }

        if self.persist_deadline.is_some_and(|d| now >= d) {
            // An old sequence number makes the peer answer with its current window
            let poll = self.segment(TcpFlags::ACK, self.snd_nxt.wrapping_sub(1), Bytes::new());
            self.stats.segments_sent += 1;
            out.segments.push(poll);
            self.persist_backoff = (self.persist_backoff + 1).min(6);
            let backoff = self.config.retransmit_timeout * (1u32 << self.persist_backoff);
            self.persist_deadline = Some(now + backoff);
            trace!(remote = %self.remote, backoff = self.persist_backoff, "Zero window polled");
        }

        let rto = self.config.retransmit_timeout;
        let max = self.config.max_retransmissions;
        let mut resend = Vec::new();
        let mut exhausted = false;
        for pending in &mut self.unacked {
            let backoff = rto * (1u32 << pending.retries.min(16));
            if now.saturating_duration_since(pending.sent_at) < backoff {
                continue;
            }
            if pending.retries >= max {
                exhausted = true;
                break;
            }
            pending.retries += 1;
            pending.sent_at = now;
            resend.push((pending.seq, pending.flags, pending.data.clone()));
        }

        if exhausted {
            warn!(remote = %self.remote, state = %self.state, "Retransmission budget exhausted");
            if self.state != TcpState::SynSent {
                self.send_rst(out);
            }
            self.transition(TcpState::Closed, Some(CloseReason::Timeout), out);
            return;
        }

        for (seq, flags, data) in resend {
            trace!(remote = %self.remote, seq, "Retransmitting");
            let segment = self.segment(flags, seq, data);
            self.stats.segments_sent += 1;
            self.stats.retransmissions += 1;
            out.segments.push(segment);
        }
    }
}

/// A synthetic TCP endpoint bound to one local/remote pair
///
/// Every method may be called from any thread. State lives behind one
/// mutex; outbound segments and state changes collected while it is held
/// are handed to the [`SocketObserver`] after it is released.
pub struct TcpSocket {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    inner: Mutex<Inner>,
    changed: Condvar,
    observer: Arc<dyn SocketObserver>,
}

impl TcpSocket {
    /// Create a closed socket
    pub fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        config: SocketConfig,
        observer: Arc<dyn SocketObserver>,
    ) -> Self {
        Self {
            local,
            remote,
            inner: Mutex::new(Inner::new(local, remote, config)),
            changed: Condvar::new(),
            observer,
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Inner, &mut Outcome) -> R) -> R {
        let mut out = Outcome::default();
        let mut guard = self.inner.lock();
        let result = f(&mut *guard, &mut out);
        drop(guard);
        self.changed.notify_all();
        for segment in out.segments {
            self.observer.on_segment(segment);
        }
        for change in out.changes {
            self.observer.on_state_change(change);
        }
        result
    }

    /// Local endpoint
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Remote endpoint
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    /// Current state
    pub fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    /// Why the socket closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    /// Counters snapshot
    pub fn stats(&self) -> SocketStats {
        self.inner.lock().stats
    }

    /// Closed -> Listen
    pub fn listen(&self) -> Result<()> {
        self.update(Inner::listen)
    }

    /// Closed -> SynSent, sending a SYN; completion is observed via state changes
    pub fn connect(&self) -> Result<()> {
        self.update(Inner::connect)
    }

    /// Block until the handshake finished or failed
    pub fn wait_established(&self, timeout: Duration) -> Result<()> {
        let state = self.wait_for(
            |s| !matches!(s, TcpState::Listen | TcpState::SynSent | TcpState::SynReceived),
            timeout,
        )?;
        if state == TcpState::Closed {
            let reason = self.close_reason().unwrap_or(CloseReason::Normal);
            return Err(Error::connect_failed(self.remote, format!("{reason:?}")));
        }
        Ok(())
    }

    /// Queue `data` for transmission
    ///
    /// Bytes written before the handshake completes are held and flushed
    /// once the connection is established. Blocks while a window's worth of
    /// bytes is already queued and not yet admitted by the peer.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        {
            let mut inner = self.inner.lock();
            let limit = usize::from(inner.config.window);
            while inner.send_queue.len() >= limit && inner.accepts_data() {
                self.changed.wait(&mut inner);
            }
        }
        self.update(|inner, out| inner.send(data, out))
    }

    /// Block until in-order bytes are available
    ///
    /// Returns `Ok(0)` once the peer's FIN has been consumed. A reset or a
    /// local abort wakes the reader with an error.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        loop {
            if !inner.recv_buf.is_empty() {
                let n = buf.len().min(inner.recv_buf.len());
                buf[..n].copy_from_slice(&inner.recv_buf[..n]);
                let before = inner.rcv_wnd();
                inner.recv_buf.advance(n);

                let mut out = Outcome::default();
                if inner.window_reopened(before) {
                    inner.send_ack(&mut out);
                }
                drop(inner);
                for segment in out.segments {
                    self.observer.on_segment(segment);
                }
                return Ok(n);
            }
            if inner.fin_received {
                return Ok(0);
            }
            if inner.state == TcpState::Closed {
                if inner.is_abnormally_closed() {
                    return Err(inner.closed_error());
                }
                return Ok(0);
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Start an orderly close (FIN) without waiting
    ///
    /// During the handshake the FIN is deferred until queued bytes went out.
    pub fn close_async(&self) {
        self.update(Inner::close);
    }

    /// Close and wait until Closed or TimeWait
    pub fn close(&self) -> Result<()> {
        self.close_async();
        let timeout = self.inner.lock().config.close_timeout;
        self.wait_for(TcpState::is_closed, timeout).map(|_| ())
    }

    /// Send RST (when synchronized) and drop everything
    pub fn abort(&self) {
        self.update(Inner::abort);
    }

    /// Feed one inbound segment
    pub fn segment_arrives(&self, segment: &TcpFrame) {
        self.update(|inner, out| inner.segment_arrives(segment, out));
    }

    /// Drive retransmission, zero-window polls, connect timeout and TIME-WAIT expiry
    pub fn tick(&self, now: Instant) {
        self.update(|inner, out| inner.tick(now, out));
    }

    /// Block until `pred` holds for the state, or fail after `timeout`
    pub fn wait_for(&self, pred: impl Fn(TcpState) -> bool, timeout: Duration) -> Result<TcpState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !pred(inner.state) {
            if self.changed.wait_until(&mut inner, deadline).timed_out() && !pred(inner.state) {
                return Err(Error::Timeout {
                    operation: "reach the requested socket state",
                    after: timeout,
                });
            }
        }
        Ok(inner.state)
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
