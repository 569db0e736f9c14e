#![forbid(unsafe_code)]

//! Chunk/slice aggregation engine for memory-access history recording.
//!
//! Accesses arrive in trace order (non-decreasing transition) and are
//! grouped per operation kind into address-contiguous [`Chunk`]s collected
//! inside transition-bounded [`Slice`]s. The [`SliceBuilder`] owns the
//! aggregation rules and the capacity limits that decide when a slice is
//! full and must be persisted.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported access: {0}")]
    Unsupported(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Memory operation kind. The byte values are the on-disk encoding; only
/// `Write` and `Read` accesses are ever recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Execute,
    Write,
    Read,
}

impl Operation {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Execute => 0b001,
            Self::Write => 0b010,
            Self::Read => 0b100,
        }
    }

    #[must_use]
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0b001 => Some(Self::Execute),
            0b010 => Some(Self::Write),
            0b100 => Some(Self::Read),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::Read => "read",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "execute" => Some(Self::Execute),
            "write" => Some(Self::Write),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

/// One memory event as emitted by the trace provider.
///
/// `virtual_address` is meaningful only when `has_virtual_address` is set;
/// the store records NULL otherwise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryAccess {
    pub transition: u64,
    pub physical_address: u64,
    pub virtual_address: u64,
    pub size: u32,
    pub has_virtual_address: bool,
    pub operation: Operation,
}

/// A recorded access node. Nodes live in the builder's arena and are
/// chained per chunk through `next`, so concatenating two chunks is a
/// single link rewrite.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAccess {
    pub transition: u64,
    pub address: u64,
    pub size: u32,
    next: Option<usize>,
}

/// Opaque handle to an access node.
///
/// Valid against the [`SliceBuilder`] that returned it and against the
/// [`Slice`] that builder turns into; stale handles dereference to `None`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct AccessRef(usize);

/// A contiguous physical address range aggregating accesses of one
/// operation kind. Chunks do not know their transition bounds; the owning
/// slice does.
#[derive(Debug)]
pub struct Chunk {
    address_first: u64,
    address_last: u64,
    head: usize,
    tail: usize,
    count: u64,
}

impl Chunk {
    /// Spawn a chunk from a single access, allocating its node in `nodes`.
    ///
    /// # Errors
    /// `InvalidArgument` if `size` is zero or `address + size - 1` does not
    /// fit in a u64.
    pub fn from_access(
        nodes: &mut Vec<ChunkAccess>,
        transition: u64,
        address: u64,
        size: u32,
    ) -> Result<(Self, AccessRef), HistoryError> {
        if size == 0 {
            return Err(HistoryError::InvalidArgument(
                "access size must be non-zero".to_string(),
            ));
        }
        let address_last = address.checked_add(u64::from(size) - 1).ok_or_else(|| {
            HistoryError::InvalidArgument("address + size wraps around u64".to_string())
        })?;
        let index = nodes.len();
        nodes.push(ChunkAccess {
            transition,
            address,
            size,
            next: None,
        });
        Ok((
            Self {
                address_first: address,
                address_last,
                head: index,
                tail: index,
                count: 1,
            },
            AccessRef(index),
        ))
    }

    #[must_use]
    pub fn address_first(&self) -> u64 {
        self.address_first
    }

    #[must_use]
    pub fn address_last(&self) -> u64 {
        self.address_last
    }

    /// Number of accesses recorded in this chunk.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.count
    }

    /// True iff the two address ranges share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Chunk) -> bool {
        self.address_first <= other.address_last && other.address_first <= self.address_last
    }

    /// True iff one range starts exactly one past the other's end.
    /// Touching ranges never overlap; a range ending at `u64::MAX` touches
    /// nothing on its high side.
    #[must_use]
    pub fn is_contiguous(&self, other: &Chunk) -> bool {
        self.address_last.checked_add(1) == Some(other.address_first)
            || other.address_last.checked_add(1) == Some(self.address_first)
    }

    /// Merge `other` in: the bounds become the union, the counts add, and
    /// `other`'s access list is linked after this chunk's tail in O(1).
    /// Node handles remain valid.
    ///
    /// # Errors
    /// `Invariant` if either tail link is not terminal.
    pub fn merge_in(&mut self, nodes: &mut [ChunkAccess], other: Chunk) -> Result<(), HistoryError> {
        match nodes.get(other.tail) {
            Some(node) if node.next.is_none() => {}
            _ => {
                return Err(HistoryError::Invariant(
                    "donor tail link is not terminal".to_string(),
                ))
            }
        }
        let tail_node = nodes.get_mut(self.tail).ok_or_else(|| {
            HistoryError::Invariant("receiver tail is out of bounds".to_string())
        })?;
        if tail_node.next.is_some() {
            return Err(HistoryError::Invariant(
                "receiver tail link is not terminal".to_string(),
            ));
        }
        tail_node.next = Some(other.head);
        self.address_first = self.address_first.min(other.address_first);
        self.address_last = self.address_last.max(other.address_last);
        self.tail = other.tail;
        self.count += other.count;
        Ok(())
    }

    /// Iterate this chunk's accesses in insertion order. The head link is
    /// stable, so a fresh traversal reproduces the same sequence.
    #[must_use]
    pub fn accesses<'a>(&self, nodes: &'a [ChunkAccess]) -> ChunkAccesses<'a> {
        ChunkAccesses {
            nodes,
            cursor: Some(self.head),
        }
    }
}

/// Insertion-ordered iterator over one chunk's accesses.
pub struct ChunkAccesses<'a> {
    nodes: &'a [ChunkAccess],
    cursor: Option<usize>,
}

impl<'a> Iterator for ChunkAccesses<'a> {
    type Item = (AccessRef, &'a ChunkAccess);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.nodes.get(index)?;
        self.cursor = node.next;
        Some((AccessRef(index), node))
    }
}

/// The frozen output of a [`SliceBuilder`]: pairwise non-overlapping chunks
/// in address order, plus the transition range that bounds every access
/// inside.
#[derive(Debug, Default)]
pub struct Slice {
    chunks: BTreeMap<u64, Chunk>,
    nodes: Vec<ChunkAccess>,
    transition_first: u64,
    transition_last: u64,
}

impl Slice {
    #[must_use]
    pub fn transition_first(&self) -> u64 {
        self.transition_first
    }

    #[must_use]
    pub fn transition_last(&self) -> u64 {
        self.transition_last
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Count the stored accesses. Walks every chunk.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.chunks.values().map(Chunk::access_count).sum()
    }

    /// Chunks in ascending `address_first` order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// The accesses of `chunk` in insertion order.
    #[must_use]
    pub fn accesses_of(&self, chunk: &Chunk) -> ChunkAccesses<'_> {
        chunk.accesses(&self.nodes)
    }

    /// Dereference a handle returned by [`SliceBuilder::insert`].
    #[must_use]
    pub fn access(&self, handle: AccessRef) -> Option<&ChunkAccess> {
        self.nodes.get(handle.0)
    }
}

/// Incrementally aggregates accesses of one operation kind into a
/// [`Slice`], merging chunks as overlaps appear and refusing accesses once
/// a capacity limit is reached.
///
/// A refusal (`Ok(None)` from [`insert`](Self::insert)) is a control
/// signal, not an error: the caller is expected to build and persist the
/// slice, then retry against a fresh builder.
#[derive(Debug, Default)]
pub struct SliceBuilder {
    slice: Slice,
    chunk_size_overlap_limit: Option<u64>,
    chunk_size_touch_limit: Option<u64>,
    transition_limit: Option<u64>,
    access_count_limit: Option<u64>,
    stop_at_next_transition: bool,
    access_count: u64,
}

impl SliceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft cap on the total access count involved in an overlap merge.
    /// Ignored while the incoming transition is already part of the slice;
    /// the next transition is refused instead.
    #[must_use]
    pub fn chunk_size_overlap_limit(mut self, limit: u64) -> Self {
        self.chunk_size_overlap_limit = Some(limit);
        self
    }

    /// Cap on the combined access count of two touching chunks fused by the
    /// post-build merge pass. Does not affect `insert`.
    #[must_use]
    pub fn chunk_size_touch_limit(mut self, limit: u64) -> Self {
        self.chunk_size_touch_limit = Some(limit);
        self
    }

    /// Hard cap on the transition span a slice may represent.
    #[must_use]
    pub fn transition_limit(mut self, limit: u64) -> Self {
        self.transition_limit = Some(limit);
        self
    }

    /// Soft cap on the number of accesses a slice may hold.
    #[must_use]
    pub fn access_count_limit(mut self, limit: u64) -> Self {
        self.access_count_limit = Some(limit);
        self
    }

    /// Accesses accepted so far.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Chunks currently held (before the post-build merge pass).
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.slice.chunks.len()
    }

    /// Insert one access.
    ///
    /// Returns `Ok(None)` when a capacity limit refuses the access; the
    /// node handle otherwise. Handles stay valid for the slice produced by
    /// [`build`](Self::build).
    ///
    /// # Errors
    /// `InvalidArgument` on a zero size, on `address + size` wrapping u64,
    /// or on a transition older than the newest accepted one.
    pub fn insert(
        &mut self,
        transition: u64,
        address: u64,
        size: u32,
    ) -> Result<Option<AccessRef>, HistoryError> {
        if size == 0 {
            return Err(HistoryError::InvalidArgument(
                "access size must be non-zero".to_string(),
            ));
        }

        if self.stop_at_next_transition && transition > self.slice.transition_last {
            return Ok(None);
        }

        if let Some(limit) = self.access_count_limit {
            if self.access_count >= limit {
                if transition > self.slice.transition_last {
                    return Ok(None);
                }
                // The transition is already part of the slice; keep it whole.
                self.stop_at_next_transition = true;
            }
        }

        let address_last = address.checked_add(u64::from(size) - 1).ok_or_else(|| {
            HistoryError::InvalidArgument("address + size wraps around u64".to_string())
        })?;

        if !self.slice.chunks.is_empty() && transition < self.slice.transition_last {
            return Err(HistoryError::InvalidArgument(format!(
                "transition going backward: {transition} < {}",
                self.slice.transition_last
            )));
        }

        if let Some(limit) = self.transition_limit {
            if !self.slice.chunks.is_empty()
                && transition - self.slice.transition_first + 1 > limit
            {
                return Ok(None);
            }
        }

        // Existing chunks the new access overlaps: the predecessor of the
        // insertion point, then successors until the first gap. The
        // non-overlap invariant makes everything past that gap disjoint too.
        let mut overlap_keys: Vec<u64> = Vec::new();
        let mut merged_count: u64 = 1;
        if let Some((&key, previous)) = self.slice.chunks.range(..=address).next_back() {
            if previous.address_last >= address {
                overlap_keys.push(key);
                merged_count += previous.access_count();
            }
        }
        for (&key, next) in self
            .slice
            .chunks
            .range((Bound::Excluded(address), Bound::Unbounded))
        {
            if next.address_first > address_last {
                break;
            }
            overlap_keys.push(key);
            merged_count += next.access_count();
        }

        if let Some(limit) = self.chunk_size_overlap_limit {
            if merged_count > limit {
                if transition > self.slice.transition_last {
                    return Ok(None);
                }
                // The transition is already part of the slice; keep it whole.
                self.stop_at_next_transition = true;
            }
        }

        if self.slice.chunks.is_empty() {
            self.slice.transition_first = transition;
        }

        let (mut merged, handle) =
            Chunk::from_access(&mut self.slice.nodes, transition, address, size)?;
        for key in overlap_keys {
            let donor = self.slice.chunks.remove(&key).ok_or_else(|| {
                HistoryError::Invariant("overlap scan produced a stale chunk key".to_string())
            })?;
            merged.merge_in(&mut self.slice.nodes, donor)?;
        }

        self.slice.transition_last = transition;
        self.slice.chunks.insert(merged.address_first(), merged);
        self.access_count += 1;
        Ok(Some(handle))
    }

    /// Finish the slice: fuse touching chunks under the touch limit, then
    /// yield it. Consumes the builder.
    ///
    /// # Errors
    /// `Invariant` if the chunk map is internally inconsistent.
    pub fn build(mut self) -> Result<Slice, HistoryError> {
        self.merge_touching()?;
        Ok(self.slice)
    }

    /// Insertion only merges when forced to by an overlap. This pass fuses
    /// chunks sitting side by side, which drastically reduces the chunk
    /// count, under the separate `chunk_size_touch_limit`.
    fn merge_touching(&mut self) -> Result<(), HistoryError> {
        let mut keys = self.slice.chunks.keys().copied().collect::<Vec<u64>>().into_iter();
        let Some(mut current_key) = keys.next() else {
            return Ok(());
        };
        for key in keys {
            let fuse = {
                let (Some(current), Some(next)) = (
                    self.slice.chunks.get(&current_key),
                    self.slice.chunks.get(&key),
                ) else {
                    return Err(HistoryError::Invariant(
                        "touch-merge walk lost a chunk key".to_string(),
                    ));
                };
                current.is_contiguous(next)
                    && self
                        .chunk_size_touch_limit
                        .map_or(true, |limit| {
                            current.access_count() + next.access_count() <= limit
                        })
            };
            if fuse {
                let Some(donor) = self.slice.chunks.remove(&key) else {
                    return Err(HistoryError::Invariant(
                        "touch-merge walk lost a chunk key".to_string(),
                    ));
                };
                let Some(receiver) = self.slice.chunks.get_mut(&current_key) else {
                    return Err(HistoryError::Invariant(
                        "touch-merge walk lost a chunk key".to_string(),
                    ));
                };
                receiver.merge_in(&mut self.slice.nodes, donor)?;
            } else {
                current_key = key;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use proptest::prelude::*;

    use super::*;

    fn must<T>(result: Result<T, HistoryError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_insert(builder: &mut SliceBuilder, transition: u64, address: u64, size: u32) -> AccessRef {
        match builder.insert(transition, address, size) {
            Ok(Some(handle)) => handle,
            Ok(None) => panic!("insertion was refused at transition {transition}"),
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn refused_insert(builder: &mut SliceBuilder, transition: u64, address: u64, size: u32) {
        match builder.insert(transition, address, size) {
            Ok(None) => {}
            Ok(Some(_)) => panic!("insertion at transition {transition} should have been refused"),
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn invalid_insert(builder: &mut SliceBuilder, transition: u64, address: u64, size: u32) {
        match builder.insert(transition, address, size) {
            Err(HistoryError::InvalidArgument(_)) => {}
            Err(err) => panic!("expected InvalidArgument, got: {err}"),
            Ok(_) => panic!("insertion at transition {transition} should have errored"),
        }
    }

    fn fixture_chunk(nodes: &mut Vec<ChunkAccess>, transition: u64, address: u64, size: u32) -> Chunk {
        match Chunk::from_access(nodes, transition, address, size) {
            Ok((chunk, _)) => chunk,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn handle_set(nodes: &[ChunkAccess], chunk: &Chunk) -> HashSet<AccessRef> {
        chunk.accesses(nodes).map(|(handle, _)| handle).collect()
    }

    fn assert_merge(nodes: &mut Vec<ChunkAccess>, mut a: Chunk, b: Chunk) {
        let count = a.access_count() + b.access_count();
        let first = a.address_first().min(b.address_first());
        let last = a.address_last().max(b.address_last());
        let mut expected = handle_set(nodes, &a);
        expected.extend(handle_set(nodes, &b));

        must(a.merge_in(nodes, b));

        assert_eq!(a.access_count(), count);
        assert_eq!(a.address_first(), first);
        assert_eq!(a.address_last(), last);
        let merged: Vec<AccessRef> = a.accesses(nodes).map(|(handle, _)| handle).collect();
        assert_eq!(merged.len() as u64, count);
        let merged_set: HashSet<AccessRef> = merged.iter().copied().collect();
        assert_eq!(merged_set.len(), merged.len());
        assert_eq!(merged_set, expected);
    }

    #[test]
    fn chunk_creation_holds_one_access() {
        let mut nodes = Vec::new();
        let (chunk, handle) = must(Chunk::from_access(&mut nodes, 0x42, 10, 100));
        assert_eq!(chunk.access_count(), 1);
        assert_eq!(chunk.address_first(), 10);
        assert_eq!(chunk.address_last(), 109);

        let listed: Vec<_> = chunk.accesses(&nodes).collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, handle);
        assert_eq!(listed[0].1.transition, 0x42);
        assert_eq!(listed[0].1.address, 10);
        assert_eq!(listed[0].1.size, 100);
    }

    #[test]
    fn chunk_creation_rejects_malformed_accesses() {
        let mut nodes = Vec::new();
        assert!(matches!(
            Chunk::from_access(&mut nodes, 0, 1, 0),
            Err(HistoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            Chunk::from_access(&mut nodes, 0, u64::MAX - 2, 4),
            Err(HistoryError::InvalidArgument(_))
        ));
        assert!(nodes.is_empty());
    }

    #[test]
    fn overlapping_chunks_merge() {
        let cases = [
            (10u64, 10u32, 10u64, 10u32), // cover
            (10, 10, 4, 20),              // over
            (10, 10, 15, 2),              // inside
            (10, 10, 12, 10),             // up
            (10, 10, 8, 10),              // down
        ];
        for (a_address, a_size, b_address, b_size) in cases {
            let mut nodes = Vec::new();
            let a = fixture_chunk(&mut nodes, 0, a_address, a_size);
            let b = fixture_chunk(&mut nodes, 2, b_address, b_size);
            assert!(a.overlaps(&b));
            assert!(b.overlaps(&a));
            assert!(!a.is_contiguous(&b));
            assert_merge(&mut nodes, a, b);
        }
    }

    #[test]
    fn touching_chunks_merge() {
        for (b_address, b_size) in [(20u64, 10u32), (0, 10)] {
            let mut nodes = Vec::new();
            let a = fixture_chunk(&mut nodes, 0, 10, 10);
            let b = fixture_chunk(&mut nodes, 0, b_address, b_size);
            assert!(a.is_contiguous(&b));
            assert!(b.is_contiguous(&a));
            assert!(!a.overlaps(&b));
            assert_merge(&mut nodes, a, b);
        }
    }

    #[test]
    fn contiguity_is_total_at_the_address_ceiling() {
        let mut nodes = Vec::new();
        let top = fixture_chunk(&mut nodes, 0, u64::MAX, 1);
        let bottom = fixture_chunk(&mut nodes, 0, 0, 1);
        assert!(!top.is_contiguous(&bottom));
        assert!(!top.overlaps(&bottom));
    }

    #[test]
    fn builder_aggregates_nominal_stream() {
        let mut b = SliceBuilder::new();
        must_insert(&mut b, 1, 10, 10);
        must_insert(&mut b, 2, 8, 10); // merged
        must_insert(&mut b, 3, 12, 10); // merged
        must_insert(&mut b, 3, 30, 10); // new chunk, but...
        must_insert(&mut b, 3, 18, 15); // merged now

        must_insert(&mut b, 4, 100, 10);
        must_insert(&mut b, 5, 100, 10); // merged
        must_insert(&mut b, 6, 98, 10); // merged
        must_insert(&mut b, 7, 108, 10); // merged
        must_insert(&mut b, 8, 80, 10); // new chunk, but...
        must_insert(&mut b, 9, 85, 20); // merged now
        must_insert(&mut b, 10, 120, 10); // new chunk, but...
        must_insert(&mut b, 11, 90, 40); // merged now

        must_insert(&mut b, 12, 200, 10);
        must_insert(&mut b, 13, 210, 10); // touches
        must_insert(&mut b, 14, 190, 10); // touches

        must_insert(&mut b, 100, 0xffff_fff0, 1); // last one

        let builder_count = b.access_count();
        let slice = must(b.build());

        assert_eq!(slice.access_count(), builder_count);
        assert_eq!(slice.access_count(), 17);
        assert_eq!(slice.chunk_count(), 4);
        assert_eq!(slice.transition_first(), 1);
        assert_eq!(slice.transition_last(), 100);
    }

    #[test]
    fn builder_accepts_accesses_ending_at_the_ceiling() {
        let mut b = SliceBuilder::new();
        must_insert(&mut b, 0, u64::MAX, 1);
        must_insert(&mut b, 0, u64::MAX - 2, 3);
        invalid_insert(&mut b, 0, u64::MAX - 2, 4);
    }

    #[test]
    fn builder_rejects_backward_transitions() {
        let mut b = SliceBuilder::new();
        must_insert(&mut b, 0, 1, 1);
        must_insert(&mut b, 1, 1, 1);
        invalid_insert(&mut b, 0, 1, 1);
    }

    #[test]
    fn builder_rejects_zero_sizes() {
        let mut b = SliceBuilder::new();
        invalid_insert(&mut b, 0, 1, 0);
        invalid_insert(&mut b, 0, 0, 0);
    }

    #[test]
    fn overlap_limit_refuses_new_transitions() {
        let mut b = SliceBuilder::new().chunk_size_overlap_limit(2);
        must_insert(&mut b, 1, 10, 10);
        must_insert(&mut b, 2, 18, 10);
        refused_insert(&mut b, 3, 25, 10);
    }

    #[test]
    fn overlap_limit_is_ignored_inside_a_transition() {
        let mut b = SliceBuilder::new().chunk_size_overlap_limit(2);
        must_insert(&mut b, 1, 10, 10);
        must_insert(&mut b, 2, 15, 10);
        // Transition 2 is already part of the slice, so the cap is ignored
        // until the next transition shows up.
        must_insert(&mut b, 2, 20, 10);
        must_insert(&mut b, 2, 25, 10);
        must_insert(&mut b, 2, 50, 10); // even away from the big chunk
        refused_insert(&mut b, 3, 250, 10); // sticky refusal, anywhere
    }

    #[test]
    fn transition_limit_caps_the_span() {
        let mut b = SliceBuilder::new().transition_limit(2);
        must_insert(&mut b, 0, 10, 10);
        must_insert(&mut b, 1, 10, 10);
        refused_insert(&mut b, 2, 10, 10);
    }

    #[test]
    fn touch_limit_only_applies_to_the_build_pass() {
        let mut b = SliceBuilder::new().chunk_size_touch_limit(2);
        must_insert(&mut b, 0, 0, 10);
        must_insert(&mut b, 1, 10, 10); // will be merged
        must_insert(&mut b, 2, 20, 10); // will be blocked by the cap
        assert_eq!(b.chunk_count(), 3);

        let slice = must(b.build());
        assert_eq!(slice.chunk_count(), 2);

        let chunks: Vec<&Chunk> = slice.chunks().collect();
        assert_eq!(chunks[0].address_first(), 0);
        assert_eq!(chunks[0].address_last(), 19);
        assert_eq!(chunks[0].access_count(), 2);
        assert_eq!(chunks[1].address_first(), 20);
        assert_eq!(chunks[1].access_count(), 1);
    }

    #[test]
    fn access_count_limit_refuses_new_transitions() {
        let mut b = SliceBuilder::new().access_count_limit(2);
        must_insert(&mut b, 0, 0, 10);
        must_insert(&mut b, 1, 50, 10);
        refused_insert(&mut b, 2, 200, 10);
        assert_eq!(b.access_count(), 2);
    }

    #[test]
    fn access_count_limit_is_soft_inside_a_transition() {
        let mut b = SliceBuilder::new().access_count_limit(2);
        must_insert(&mut b, 0, 0, 10);
        must_insert(&mut b, 1, 50, 10);
        must_insert(&mut b, 1, 100, 10); // kept: transition 1 is in the slice
        refused_insert(&mut b, 2, 200, 10);
        assert_eq!(b.access_count(), 3);
    }

    #[test]
    fn empty_builder_yields_an_empty_slice() {
        let slice = must(SliceBuilder::new().build());
        assert!(slice.is_empty());
        assert_eq!(slice.chunk_count(), 0);
        assert_eq!(slice.access_count(), 0);
    }

    #[test]
    fn handles_stay_valid_through_build() {
        let mut b = SliceBuilder::new();
        let h1 = must_insert(&mut b, 1, 10, 10);
        let h2 = must_insert(&mut b, 2, 15, 10); // merged into the first chunk
        let h3 = must_insert(&mut b, 3, 100, 4);
        let slice = must(b.build());

        let n1 = slice.access(h1);
        let n2 = slice.access(h2);
        let n3 = slice.access(h3);
        match (n1, n2, n3) {
            (Some(n1), Some(n2), Some(n3)) => {
                assert_eq!((n1.transition, n1.address, n1.size), (1, 10, 10));
                assert_eq!((n2.transition, n2.address, n2.size), (2, 15, 10));
                assert_eq!((n3.transition, n3.address, n3.size), (3, 100, 4));
            }
            _ => panic!("handles must dereference after build"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_built_slices_uphold_invariants(
            steps in prop::collection::vec((0u64..4, 0u64..500, 1u32..16), 1..120),
        ) {
            let mut builder = SliceBuilder::new();
            let mut transition = 0u64;
            let mut accepted = 0u64;
            for (advance, address, size) in steps {
                transition += advance;
                match builder.insert(transition, address, size) {
                    Ok(Some(_)) => accepted += 1,
                    Ok(None) => {}
                    Err(err) => panic!("unexpected rejection: {err}"),
                }
            }

            let slice = must(builder.build());
            prop_assert_eq!(slice.access_count(), accepted);

            let mut previous_end: Option<u64> = None;
            for chunk in slice.chunks() {
                if let Some(end) = previous_end {
                    // Strictly increasing, pairwise disjoint address ranges.
                    prop_assert!(end < chunk.address_first());
                }
                prop_assert!(chunk.address_first() <= chunk.address_last());

                let mut walked = 0u64;
                for (_, node) in slice.accesses_of(chunk) {
                    prop_assert!(slice.transition_first() <= node.transition);
                    prop_assert!(node.transition <= slice.transition_last());
                    prop_assert!(chunk.address_first() <= node.address);
                    prop_assert!(node.address + u64::from(node.size) - 1 <= chunk.address_last());
                    walked += 1;
                }
                prop_assert_eq!(walked, chunk.access_count());
                previous_end = Some(chunk.address_last());
            }
        }

        #[test]
        fn prop_soft_caps_never_split_a_transition(
            steps in prop::collection::vec((0u64..3, 0u64..200, 1u32..8), 1..80),
            limit in 1u64..10,
        ) {
            let mut builder = SliceBuilder::new().access_count_limit(limit);
            let mut transition = 0u64;
            let mut outcomes: BTreeMap<u64, Vec<bool>> = BTreeMap::new();
            for (advance, address, size) in steps {
                transition += advance;
                let accepted = match builder.insert(transition, address, size) {
                    Ok(outcome) => outcome.is_some(),
                    Err(err) => panic!("unexpected rejection: {err}"),
                };
                outcomes.entry(transition).or_default().push(accepted);
            }

            // A transition lands entirely inside the slice or entirely
            // outside it.
            for (_, results) in outcomes {
                let first = results[0];
                prop_assert!(results.iter().all(|&result| result == first));
            }
        }
    }
}
