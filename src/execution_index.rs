//! Call-stack-relative identities for byte requests.
//!
//! An [`ExecutionIndex`] names the n-th byte requested at a particular point
//! of the program: it is the flattened call stack — a sequence of
//! `(call site, occurrence)` pairs — followed by the byte counter of the
//! leaf frame. Two runs that follow the same path up to a request produce
//! the same index for it, which is what lets a mapped input replay bytes at
//! the places they were consumed rather than at raw stream offsets.

use ahash::AHashMap;

/// Identity of one byte request along a program path.
///
/// Stored flattened: `site0, occ0, site1, occ1, …, byte_offset`. The pair
/// region is everything but the last element; the last element is the byte
/// counter within the leaf frame. The derived `Ord` is lexicographic, so all
/// indices sharing a pair prefix are contiguous in a sorted map.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ExecutionIndex(Vec<u32>);

impl ExecutionIndex {
    pub(crate) fn from_parts(pairs: &[u32], byte_offset: u32) -> Self {
        debug_assert!(pairs.len() % 2 == 0);
        let mut path = Vec::with_capacity(pairs.len() + 1);
        path.extend_from_slice(pairs);
        path.push(byte_offset);
        Self(path)
    }

    #[cfg(test)]
    pub(crate) fn from_raw(path: Vec<u32>) -> Self {
        debug_assert!(path.len() % 2 == 1);
        Self(path)
    }

    /// The `(site, occurrence)` region, without the trailing byte offset.
    fn pairs(&self) -> &[u32] {
        &self.0[..self.0.len() - 1]
    }

    /// Number of trailing pairs shared with `other`.
    pub(crate) fn common_suffix_pairs(&self, other: &ExecutionIndex) -> usize {
        let a = self.pairs();
        let b = other.pairs();
        let mut shared = 0;
        while shared + 2 <= a.len().min(b.len())
            && a[a.len() - shared - 2..a.len() - shared] == b[b.len() - shared - 2..b.len() - shared]
        {
            shared += 2;
        }
        shared / 2
    }

    /// The pair region minus its `suffix_pairs` trailing pairs.
    pub(crate) fn prefix(&self, suffix_pairs: usize) -> &[u32] {
        let pairs = self.pairs();
        &pairs[..pairs.len() - suffix_pairs * 2]
    }

    pub(crate) fn has_prefix(&self, prefix: &[u32]) -> bool {
        self.pairs().len() >= prefix.len() && &self.pairs()[..prefix.len()] == prefix
    }

    /// Re-keys this index from `old_prefix` onto `new_prefix`, keeping the
    /// suffix pairs and the byte offset.
    pub(crate) fn rebase(&self, old_prefix: &[u32], new_prefix: &[u32]) -> ExecutionIndex {
        debug_assert!(self.has_prefix(old_prefix));
        let mut path = Vec::with_capacity(new_prefix.len() + self.0.len() - old_prefix.len());
        path.extend_from_slice(new_prefix);
        path.extend_from_slice(&self.0[old_prefix.len()..]);
        ExecutionIndex(path)
    }

    pub(crate) fn context(&self) -> ExecutionContext {
        ExecutionContext(self.pairs().iter().step_by(2).copied().collect())
    }
}

/// Equivalence class over execution indices used to find splice-compatible
/// locations: the chain of call sites, without occurrence counts or the byte
/// offset. Two indices in the same context were requested under the same
/// static call chain.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ExecutionContext(Vec<u32>);

#[derive(Default)]
struct Frame {
    call_counts: AHashMap<i32, u32>,
    bytes_requested: u32,
}

/// The indexer: a stack of `(call site, occurrence)` frames fed by call and
/// return events, plus the per-frame byte counter. The identities of the
/// frames live in the flattened pair list; each frame itself only counts
/// what happens inside it.
///
/// The bottom frame stands for the top level of the run and is never popped.
pub struct IndexingState {
    stack: Vec<Frame>,
    flat_pairs: Vec<u32>,
}

impl IndexingState {
    pub fn new() -> Self {
        Self {
            stack: vec![Frame::default()],
            flat_pairs: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.stack.push(Frame::default());
        self.flat_pairs.clear();
    }

    /// A call event pushes `(site, occurrences of site in the current frame)`.
    pub fn push_call(&mut self, iid: i32) {
        let top = self.stack.last_mut().unwrap();
        let count = top.call_counts.entry(iid).or_insert(0);
        let occurrence = *count;
        *count += 1;
        self.stack.push(Frame::default());
        self.flat_pairs.push(iid as u32);
        self.flat_pairs.push(occurrence);
    }

    /// A return event pops the top frame. Unbalanced returns at the top
    /// level are ignored.
    pub fn pop_return(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
            self.flat_pairs.truncate(self.flat_pairs.len() - 2);
        }
    }

    /// Produces the identity of the next byte request and advances the leaf
    /// frame's byte counter.
    pub fn next_byte_index(&mut self) -> ExecutionIndex {
        let top = self.stack.last_mut().unwrap();
        let index = ExecutionIndex::from_parts(&self.flat_pairs, top.bytes_requested);
        top.bytes_requested += 1;
        index
    }
}

impl Default for IndexingState {
    fn default() -> Self {
        Self::new()
    }
}
