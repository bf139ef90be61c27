//! Reassembly, replacement and HTTP re-framing through the public API

use bytes::Bytes;
use parking_lot::Mutex;
use proptest::prelude::*;
use splice_core::frame::{TcpFlags, TcpFrame};
use splice_core::modifier::{ModifierEvent, ReplaceTransform, Side};
use splice_core::stream::{pipe, MessageReader, NetworkStream};
use splice_core::tcp::{SocketConfig, SocketObserver, StateChange};
use splice_core::{
    HttpStreamOperator, NetworkStreamModifier, StreamReplacementOperator, TcpSocket, TcpState,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Segments(Mutex<Vec<TcpFrame>>);

impl SocketObserver for Segments {
    fn on_segment(&self, segment: TcpFrame) {
        self.0.lock().push(segment);
    }

    fn on_state_change(&self, _change: StateChange) {}
}

impl Segments {
    fn take(&self) -> Vec<TcpFrame> {
        std::mem::take(&mut *self.0.lock())
    }
}

fn segment(flags: TcpFlags, seq: u32, ack: u32, data: &[u8]) -> TcpFrame {
    let mut tcp = TcpFrame::new(40000, 80);
    tcp.flags = flags;
    tcp.seq = seq;
    tcp.ack = ack;
    tcp.set_payload(Bytes::copy_from_slice(data));
    tcp
}

/// Server socket after a passive open with the client ISN at `isn`
fn established(isn: u32) -> (TcpSocket, u32) {
    let segments = Arc::new(Segments::default());
    let socket = TcpSocket::new(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 80),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 40000),
        SocketConfig::default(),
        segments.clone(),
    );
    socket.listen().unwrap();
    socket.segment_arrives(&segment(TcpFlags::SYN, isn, 0, b""));
    let synack = segments.take().pop().unwrap();
    let ours = synack.seq.wrapping_add(1);
    socket.segment_arrives(&segment(TcpFlags::ACK, isn.wrapping_add(1), ours, b""));
    assert_eq!(socket.state(), TcpState::Established);
    (socket, ours)
}

fn receive_exactly(socket: &TcpSocket, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 256];
    while out.len() < len {
        let n = socket.receive(&mut buf).unwrap();
        assert!(n > 0, "stream ended early");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn test_reordered_pair_yields_ab() {
    let (socket, ours) = established(5000);
    socket.segment_arrives(&segment(TcpFlags::ACK, 5002, ours, b"B"));
    socket.segment_arrives(&segment(TcpFlags::ACK, 5001, ours, b"A"));
    assert_eq!(receive_exactly(&socket, 2), b"AB");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any delivery order of in-window segments reassembles to the sent bytes
    #[test]
    fn prop_reassembly_is_order_independent(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..12),
        isn in any::<u32>(),
        order_seed in any::<u64>(),
    ) {
        let (socket, ours) = established(isn);

        let mut seq = isn.wrapping_add(1);
        let mut segments = Vec::new();
        for chunk in &chunks {
            segments.push(segment(TcpFlags::ACK | TcpFlags::PSH, seq, ours, chunk));
            seq = seq.wrapping_add(chunk.len() as u32);
        }

        // Deterministic shuffle from the seed
        let mut state = order_seed | 1;
        for i in (1..segments.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state % (i as u64 + 1)) as usize;
            segments.swap(i, j);
        }
        for s in &segments {
            socket.segment_arrives(s);
        }

        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(receive_exactly(&socket, expected.len()), expected);
    }

    /// Replacement output does not depend on how the input was split
    #[test]
    fn prop_replacement_ignores_read_boundaries(
        input in "[fox]{0,64}",
        cuts in prop::collection::vec(0usize..64, 0..8),
    ) {
        let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(input.len())).collect();
        cuts.push(0);
        cuts.push(input.len());
        cuts.sort_unstable();

        let rule = (Bytes::from_static(b"foo"), Bytes::from_static(b"bar"));
        let mut transform = ReplaceTransform::new(vec![rule]);
        let mut out = Vec::new();
        for window in cuts.windows(2) {
            out.extend_from_slice(&transform.process(&input.as_bytes()[window[0]..window[1]]));
        }
        out.extend_from_slice(&transform.flush());

        prop_assert_eq!(String::from_utf8(out).unwrap(), input.replace("foo", "bar"));
    }

    /// Several rules of different lengths, however the input is split
    #[test]
    fn prop_multi_rule_replacement_ignores_read_boundaries(
        input in "[abo]{0,64}",
        cuts in prop::collection::vec(0usize..64, 0..8),
    ) {
        let rules: [(&[u8], &[u8]); 4] =
            [(b"boba", b"1"), (b"ob", b"2"), (b"aab", b"3"), (b"b", b"4")];
        let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(input.len())).collect();
        cuts.push(0);
        cuts.push(input.len());
        cuts.sort_unstable();

        let mut transform = ReplaceTransform::new(
            rules.iter().map(|&(f, r)| (Bytes::from_static(f), Bytes::from_static(r))).collect(),
        );
        let mut out = Vec::new();
        for window in cuts.windows(2) {
            out.extend_from_slice(&transform.process(&input.as_bytes()[window[0]..window[1]]));
        }
        out.extend_from_slice(&transform.flush());

        prop_assert_eq!(out, replace_all(input.as_bytes(), &rules));
    }
}

/// Leftmost match first, shortest pattern at a position, earlier rule on ties
fn replace_all(input: &[u8], rules: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < input.len() {
        let hit = rules
            .iter()
            .filter(|(find, _)| input[at..].starts_with(find))
            .min_by_key(|(find, _)| find.len());
        match hit {
            Some((find, replace)) => {
                out.extend_from_slice(replace);
                at += find.len();
            }
            None => {
                out.push(input[at]);
                at += 1;
            }
        }
    }
    out
}

type Ends = (Arc<dyn NetworkStream>, Arc<dyn NetworkStream>);

/// Unstarted modifier between two pipe pairs, plus the client and server ends
fn relay<F>(modifier_of: F) -> (Ends, NetworkStreamModifier)
where
    F: FnOnce(Arc<dyn NetworkStream>, Arc<dyn NetworkStream>) -> NetworkStreamModifier,
{
    let (client, alice) = pipe();
    let (bob, server) = pipe();
    let modifier = modifier_of(Arc::new(alice), Arc::new(bob));
    ((Arc::new(client), Arc::new(server)), modifier)
}

#[test]
fn test_replacement_split_across_writes() {
    let operator = StreamReplacementOperator::single("foo", "bar").unwrap();
    let ((client, server), modifier) = relay(|a, b| operator.into_modifier("replace", a, b));
    modifier.start().unwrap();

    client.write_all(b"xxfo").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    client.write_all(b"oyy").unwrap();
    client.shutdown_write().unwrap();

    let relayed = MessageReader::new(server.clone()).read_to_end().unwrap();
    assert_eq!(relayed.as_ref(), b"xxbaryy");

    server.shutdown_write().unwrap();
    modifier.join();
}

#[test]
fn test_chunked_response_reemitted_with_length() {
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let ((client, server), modifier) =
        relay(|a, b| HttpStreamOperator::default().into_modifier("http", a, b));
    modifier.subscribe(move |event| {
        let _ = events_tx.send(event.clone());
    });
    modifier.start().unwrap();

    client.write_all(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n").unwrap();
    let mut upstream = MessageReader::new(server.clone());
    let line = upstream.read_line(1024).unwrap();
    assert_eq!(line.as_ref(), b"GET / HTTP/1.1\r\n");

    server
        .write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: y\r\n\r\n",
        )
        .unwrap();
    server.shutdown_write().unwrap();
    client.shutdown_write().unwrap();

    let response = MessageReader::new(client.clone()).read_to_end().unwrap();
    let text = String::from_utf8(response.to_vec()).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    assert_eq!(body, "hello world");
    assert!(head.contains("Content-Length: 11"));
    assert!(!head.to_ascii_lowercase().contains("transfer-encoding"));

    modifier.join();
    let closed: Vec<Side> = events_rx
        .try_iter()
        .filter_map(|e| match e {
            ModifierEvent::LoopClosed(side) => Some(side),
            _ => None,
        })
        .collect();
    assert_eq!(closed.len(), 2);
}

#[test]
fn test_websocket_upgrade_relays_frames_both_ways() {
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let ((client, server), modifier) =
        relay(|a, b| HttpStreamOperator::default().into_modifier("http", a, b));
    modifier.subscribe(move |event| {
        let _ = events_tx.send(event.clone());
    });
    modifier.start().unwrap();

    client
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: example\r\n\
              Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();
    let mut upstream = MessageReader::new(server.clone());
    assert_eq!(upstream.read_line(1024).unwrap().as_ref(), b"GET /chat HTTP/1.1\r\n");
    while upstream.read_line(1024).unwrap().as_ref() != b"\r\n" {}

    let head: &[u8] =
        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    server.write_all(head).unwrap();
    server.write_all(b"\x81\x05hello").unwrap();

    let mut downstream = MessageReader::new(client.clone());
    let relayed = downstream.read_exact(head.len() + 7).unwrap();
    assert_eq!(&relayed[..head.len()], head);
    assert_eq!(&relayed[head.len()..], b"\x81\x05hello");

    // Client frames are no longer parsed as requests
    client.write_all(b"\x81\x02hi").unwrap();
    assert_eq!(upstream.read_exact(4).unwrap().as_ref(), b"\x81\x02hi");

    client.shutdown_write().unwrap();
    server.shutdown_write().unwrap();
    modifier.join();
    let errors = events_rx
        .try_iter()
        .filter(|e| matches!(e, ModifierEvent::LoopError { .. }))
        .count();
    assert_eq!(errors, 0);
}
