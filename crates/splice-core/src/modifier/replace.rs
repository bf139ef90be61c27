//! Byte pattern replacement

use super::{NetworkStreamModifier, ParseError, Side, StreamTransform};
use crate::error::{Error, Result};
use crate::stream::{MessageReader, NetworkStream};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Which direction a rule rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to server (the Alice loop)
    Upstream,
    /// Server to client (the Bob loop)
    Downstream,
    /// Both directions
    #[default]
    Both,
}

impl Direction {
    /// Whether a rule with this direction applies to the loop on `side`
    pub fn applies_to(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Direction::Both, _)
                | (Direction::Upstream, Side::Alice)
                | (Direction::Downstream, Side::Bob)
        )
    }
}

/// Replace every occurrence of `find` with `replace`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRule {
    /// Pattern to look for; never empty
    pub find: Bytes,
    /// Substitution
    pub replace: Bytes,
    /// Where the rule applies
    pub direction: Direction,
}

impl ReplacementRule {
    /// Create a rule applying in both directions
    pub fn new(find: impl Into<Bytes>, replace: impl Into<Bytes>) -> Result<Self> {
        let find = find.into();
        if find.is_empty() {
            return Err(Error::config_value("replace.find", "pattern must not be empty"));
        }
        Ok(Self {
            find,
            replace: replace.into(),
            direction: Direction::Both,
        })
    }

    /// Restrict the rule to one direction
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Stream modifier that rewrites byte patterns in the relayed data
///
/// Input is consumed in whatever chunks the stream delivers but matched
/// byte by byte against a sliding window, so a pattern split across reads
/// is still found. Bytes that may begin a match are held back until the
/// match completes or fails. Matches are taken leftmost first; at one
/// position the shortest pattern wins, ties going to the earlier rule.
#[derive(Debug, Clone, Default)]
pub struct StreamReplacementOperator {
    rules: Vec<ReplacementRule>,
}

impl StreamReplacementOperator {
    /// Operator with the given rules
    pub fn new(rules: Vec<ReplacementRule>) -> Self {
        Self { rules }
    }

    /// Operator with one rule in both directions
    pub fn single(find: impl Into<Bytes>, replace: impl Into<Bytes>) -> Result<Self> {
        Ok(Self::new(vec![ReplacementRule::new(find, replace)?]))
    }

    /// Configured rules
    pub fn rules(&self) -> &[ReplacementRule] {
        &self.rules
    }

    /// Transform for the loop on `side`
    pub fn transform_for(&self, side: Side) -> ReplaceTransform {
        ReplaceTransform::new(
            self.rules
                .iter()
                .filter(|r| r.direction.applies_to(side))
                .map(|r| (r.find.clone(), r.replace.clone()))
                .collect(),
        )
    }

    /// Build the modifier relaying between `alice` and `bob`
    pub fn into_modifier(
        self,
        name: impl Into<String>,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
    ) -> NetworkStreamModifier {
        let upstream = self.transform_for(Side::Alice);
        let downstream = self.transform_for(Side::Bob);
        NetworkStreamModifier::new(name, alice, bob, upstream, downstream)
    }
}

/// One direction of a [`StreamReplacementOperator`]
#[derive(Debug, Clone)]
pub struct ReplaceTransform {
    rules: Vec<(Bytes, Bytes)>,
    held: Vec<u8>,
    replacements: u64,
}

impl ReplaceTransform {
    /// Transform with `(find, replace)` pairs
    pub fn new(rules: Vec<(Bytes, Bytes)>) -> Self {
        Self {
            rules,
            held: Vec::new(),
            replacements: 0,
        }
    }

    /// Number of replacements made so far
    pub fn replacements(&self) -> u64 {
        self.replacements
    }

    /// Run a chunk through the window; returns the bytes that are final
    pub fn process(&mut self, chunk: &[u8]) -> Bytes {
        if self.rules.is_empty() {
            return Bytes::copy_from_slice(chunk);
        }
        let mut out = BytesMut::with_capacity(chunk.len());
        for &byte in chunk {
            self.push(byte, &mut out);
        }
        out.freeze()
    }

    /// Resolve what is held at stream end; a pending partial match can only fail
    pub fn flush(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.held.len());
        while !self.held.is_empty() {
            out.put_u8(self.held.remove(0));
            self.settle(&mut out);
        }
        out.freeze()
    }

    fn push(&mut self, byte: u8, out: &mut BytesMut) {
        self.held.push(byte);
        self.settle(out);
    }

    /// Release bytes until `held` is a proper prefix of some pattern
    fn settle(&mut self, out: &mut BytesMut) {
        while !self.held.is_empty() {
            // The shortest pattern at the front completes before any longer one
            let complete = self
                .rules
                .iter()
                .filter(|(find, _)| self.held.starts_with(find))
                .min_by_key(|(find, _)| find.len())
                .map(|(find, replace)| (find.len(), replace.clone()));
            if let Some((len, replace)) = complete {
                out.put_slice(&replace);
                self.held.drain(..len);
                self.replacements += 1;
                trace!(count = self.replacements, "Pattern replaced");
                continue;
            }
            if self.rules.iter().any(|(find, _)| find.starts_with(&self.held)) {
                return;
            }
            // No rule can start here; the oldest byte is final
            out.put_u8(self.held.remove(0));
        }
    }
}

impl StreamTransform for ReplaceTransform {
    type Message = Bytes;

    fn read_message(&mut self, reader: &mut MessageReader) -> Result<Bytes> {
        reader
            .take_available()?
            .ok_or_else(|| ParseError::StreamEnded.into())
    }

    fn transform(&mut self, chunk: Bytes) -> Result<Option<Bytes>> {
        let out = self.process(&chunk);
        Ok((!out.is_empty()).then_some(out))
    }

    fn finish(&mut self) -> Result<Option<Bytes>> {
        let rest = self.flush();
        Ok((!rest.is_empty()).then_some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(rules: &[(&'static str, &'static str)]) -> ReplaceTransform {
        ReplaceTransform::new(
            rules
                .iter()
                .map(|(f, r)| (Bytes::from_static(f.as_bytes()), Bytes::from_static(r.as_bytes())))
                .collect(),
        )
    }

    #[test]
    fn test_simple_replacement() {
        let mut t = transform(&[("foo", "bar")]);
        let mut out = t.process(b"xxfooyy").to_vec();
        out.extend_from_slice(&t.flush());
        assert_eq!(out, b"xxbaryy");
        assert_eq!(t.replacements(), 1);
    }

    #[test]
    fn test_match_across_reads() {
        let mut t = transform(&[("foo", "bar")]);
        let first = t.process(b"xxfo");
        assert_eq!(first.as_ref(), b"xx");
        let second = t.process(b"oyy");
        assert_eq!(second.as_ref(), b"baryy");
    }

    #[test]
    fn test_partial_match_flushed_at_end() {
        let mut t = transform(&[("foo", "bar")]);
        assert_eq!(t.process(b"abcfo").as_ref(), b"abc");
        assert_eq!(t.flush().as_ref(), b"fo");
    }

    #[test]
    fn test_overlapping_prefix() {
        let mut t = transform(&[("aab", "X")]);
        let mut out = t.process(b"aaab").to_vec();
        out.extend_from_slice(&t.flush());
        assert_eq!(out, b"aX");
    }

    #[test]
    fn test_multiple_rules_first_complete_wins() {
        let mut t = transform(&[("cat", "dog"), ("ca", "CA"), ("x", "")]);
        let mut out = t.process(b"cat cab xx").to_vec();
        out.extend_from_slice(&t.flush());
        assert_eq!(out, b"CAt CAb ");
    }

    #[test]
    fn test_shorter_match_inside_failed_prefix() {
        let mut t = transform(&[("foobar", "X"), ("oob", "Y")]);
        let mut out = t.process(b"foobaz").to_vec();
        out.extend_from_slice(&t.flush());
        assert_eq!(out, b"fYaz");
    }

    #[test]
    fn test_flush_resolves_inner_match() {
        let mut t = transform(&[("abcd", "1"), ("bc", "2")]);
        assert!(t.process(b"abc").is_empty());
        assert_eq!(t.flush().as_ref(), b"a2");
        assert_eq!(t.replacements(), 1);
    }

    #[test]
    fn test_direction_filter() {
        let op = StreamReplacementOperator::new(vec![
            ReplacementRule::new("up", "UP").unwrap().with_direction(Direction::Upstream),
            ReplacementRule::new("down", "DOWN").unwrap().with_direction(Direction::Downstream),
        ]);
        let mut alice = op.transform_for(Side::Alice);
        let mut bob = op.transform_for(Side::Bob);
        assert_eq!(alice.process(b"up down").as_ref(), b"UP down");
        assert_eq!(bob.process(b"up down").as_ref(), b"up DOWN");
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(ReplacementRule::new("", "x").is_err());
    }
}
