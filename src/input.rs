//! The two input representations and their mutation operators.
//!
//! An input is a sequence of bytes produced on demand while the target runs.
//! [`LinearInput`] hands bytes out by stream offset; [`MappedInput`] keys
//! every byte by the [`ExecutionIndex`] of the request, so a mutated child
//! replays each byte at the place the program consumed it even when earlier
//! mutations shifted the control flow.

use crate::config::Config;
use crate::execution_index::{ExecutionContext, ExecutionIndex};
use ahash::AHashMap;
use fastrand::Rng;
use std::collections::BTreeMap;

/// Mean number of havoc rounds per fuzzed child.
pub const MEAN_MUTATION_COUNT: f64 = 8.0;
/// Mean number of bytes clobbered per havoc round.
pub const MEAN_MUTATION_SIZE: f64 = 4.0;
/// Largest contiguous span copied by a byte-for-byte splice.
pub const MAX_SPLICE_SIZE: usize = 64;
/// Candidate locations examined per splice target attempt.
const MAX_CANDIDATE_ATTEMPTS: usize = 10;

/// Samples a geometric distribution with the given mean.
pub(crate) fn sample_geometric(rng: &Rng, mean: f64) -> usize {
    let p = 1.0 / mean;
    let uniform = rng.f64();
    (f64::ln(1.0 - uniform) / f64::ln(1.0 - p)).ceil() as usize
}

/// A place inside a saved input where a splice can draw bytes from:
/// the input's stable position in the saved list and an offset into its
/// ordered key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceLocation {
    pub input: usize,
    pub offset: usize,
}

/// Splice-compatible locations, grouped by execution context.
pub type SpliceMap = AHashMap<ExecutionContext, Vec<SpliceLocation>>;

/// Access to the mapped form of saved inputs, for drawing splice bytes.
pub trait SpliceSources {
    fn mapped_source(&self, idx: usize) -> Option<&MappedInput>;
}

impl SpliceSources for () {
    fn mapped_source(&self, _idx: usize) -> Option<&MappedInput> {
        None
    }
}

/// An input as an ordered byte vector with a strict sequential cursor.
#[derive(Debug, Clone, Default)]
pub struct LinearInput {
    values: Vec<u8>,
    requested: usize,
}

impl LinearInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// A seed input: the generator drains `bytes` before falling back to
    /// random ones.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            values: bytes,
            requested: 0,
        }
    }

    /// The `i`-th consecutive read. `i` must equal the number of bytes
    /// already requested; anything else means the byte stream and the input
    /// went out of sync, which is unrecoverable.
    ///
    /// Returns `None` for EOF: past the size cap, or past the stored bytes
    /// when the configuration forbids generating fresh ones.
    pub fn get_or_generate_fresh(&mut self, i: usize, rng: &Rng, config: &Config) -> Option<u8> {
        assert!(
            i == self.requested,
            "out-of-order read of a linear input: offset {} but {} bytes requested so far",
            i,
            self.requested
        );
        if i >= config.max_input_size {
            return None;
        }
        if i < self.values.len() {
            self.requested += 1;
            return Some(self.values[i]);
        }
        if config.generate_eof_when_out {
            return None;
        }
        let byte = rng.u8(..);
        self.values.push(byte);
        self.requested += 1;
        Some(byte)
    }

    /// Drops the bytes that the last run never asked for.
    pub fn gc(&mut self) {
        self.values.truncate(self.requested);
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// The bytes the last run actually consumed.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values[..self.requested.min(self.values.len())].to_vec()
    }

    /// A mutated child: a batch of havoc rounds over a copy of the bytes.
    pub fn fuzz(&self, rng: &Rng) -> LinearInput {
        let mut values = self.values.clone();
        havoc_rounds(rng, values.len(), |offset, span, write| {
            let end = (offset + span).min(values.len());
            for slot in values[offset..end].iter_mut() {
                *slot = write(rng);
            }
        });
        LinearInput { values, requested: 0 }
    }
}

/// Runs the shared havoc scheme: a geometric number of rounds, each
/// clobbering a geometric-length window at a uniform offset, writing either
/// zeros (one call in ten) or fresh bytes.
fn havoc_rounds(rng: &Rng, len: usize, mut clobber: impl FnMut(usize, usize, fn(&Rng) -> u8)) {
    if len == 0 {
        return;
    }
    let rounds = sample_geometric(rng, MEAN_MUTATION_COUNT);
    let zero_mode = rng.f64() < 0.1;
    let write: fn(&Rng) -> u8 = if zero_mode { |_| 0 } else { |rng| rng.u8(..) };
    for _ in 0..rounds {
        let offset = rng.usize(0..len);
        let span = sample_geometric(rng, MEAN_MUTATION_SIZE);
        clobber(offset, span, write);
    }
}

/// An input keyed by execution index.
///
/// `map` holds the byte for every index ever assigned; `ordered_keys` lists
/// the indices in the order the last run first requested them (with
/// duplicates when the program re-read an index). After [`gc`](Self::gc)
/// the input is frozen: the map's key set equals the set of requested keys,
/// and further reads are an invariant violation.
#[derive(Debug, Clone, Default)]
pub struct MappedInput {
    map: BTreeMap<ExecutionIndex, u8>,
    ordered_keys: Vec<ExecutionIndex>,
    executed: bool,
}

impl MappedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// The byte for `key`, generating a fresh one if the index was never
    /// assigned. `None` is EOF: the size cap was reached, or the index is
    /// unassigned and the configuration forbids generating bytes.
    pub fn get_or_generate_fresh(&mut self, key: ExecutionIndex, rng: &Rng, config: &Config) -> Option<u8> {
        assert!(!self.executed, "mapped input read after execution");
        if self.ordered_keys.len() >= config.max_input_size {
            return None;
        }
        if let Some(&byte) = self.map.get(&key) {
            self.ordered_keys.push(key);
            return Some(byte);
        }
        if config.generate_eof_when_out {
            return None;
        }
        let byte = rng.u8(..);
        self.map.insert(key.clone(), byte);
        self.ordered_keys.push(key);
        Some(byte)
    }

    /// Drops map entries the last run never requested and freezes the input.
    pub fn gc(&mut self) {
        let mut kept = BTreeMap::new();
        for key in &self.ordered_keys {
            if let Some(&byte) = self.map.get(key) {
                kept.insert(key.clone(), byte);
            }
        }
        self.map = kept;
        self.executed = true;
    }

    pub fn size(&self) -> usize {
        self.ordered_keys.len()
    }

    /// Number of distinct indices with an assigned byte; after gc this
    /// equals the number of distinct requested keys.
    pub fn unique_keys(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn ordered_keys(&self) -> &[ExecutionIndex] {
        &self.ordered_keys
    }

    pub(crate) fn value_at(&self, key: &ExecutionIndex) -> Option<u8> {
        self.map.get(key).copied()
    }

    /// The bytes in the order the last run consumed them.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.ordered_keys
            .iter()
            .filter_map(|k| self.map.get(k).copied())
            .collect()
    }

    /// A mutated child. With even odds when splice locations exist, grafts
    /// bytes from another saved input at a matching execution context; havoc
    /// runs when no splice landed, and half the time on top of one.
    ///
    /// The child starts with this input's full map and an empty key list:
    /// its own run rebuilds the list, and its own gc drops whatever the new
    /// control flow no longer reaches.
    pub fn fuzz(
        &self,
        self_idx: usize,
        rng: &Rng,
        config: &Config,
        splice_map: &SpliceMap,
        sources: &dyn SpliceSources,
    ) -> MappedInput {
        let mut child = MappedInput {
            map: self.map.clone(),
            ordered_keys: Vec::new(),
            executed: false,
        };
        let mut spliced = false;
        if !splice_map.is_empty() && !self.ordered_keys.is_empty() && rng.bool() {
            spliced = self.splice(&mut child, self_idx, rng, config, splice_map, sources);
        }
        if !spliced || rng.bool() {
            Self::havoc(&mut child, rng);
        }
        child
    }

    /// Tries to graft bytes from a saved input whose execution context
    /// matches a random spot of this one. Returns whether a graft landed.
    pub(crate) fn splice(
        &self,
        child: &mut MappedInput,
        self_idx: usize,
        rng: &Rng,
        config: &Config,
        splice_map: &SpliceMap,
        sources: &dyn SpliceSources,
    ) -> bool {
        let mut budget = rng.usize(3..=6);
        let mut attempt = 0;
        while attempt < budget {
            attempt += 1;
            let t = rng.usize(0..self.ordered_keys.len());
            let target_key = &self.ordered_keys[t];
            let locations = match splice_map.get(&target_key.context()) {
                Some(locations) if !locations.is_empty() => locations,
                _ => {
                    // no location for this context: one extra attempt
                    if budget < 6 {
                        budget += 1;
                    }
                    continue;
                }
            };
            for _ in 0..MAX_CANDIDATE_ATTEMPTS {
                let location = locations[rng.usize(0..locations.len())];
                if location.input == self_idx {
                    continue;
                }
                let source = match sources.mapped_source(location.input) {
                    Some(source) => source,
                    None => continue,
                };
                let source_key = match source.ordered_keys.get(location.offset) {
                    Some(key) => key,
                    None => continue,
                };
                let (source_byte, target_byte) = match (source.value_at(source_key), self.value_at(target_key)) {
                    (Some(s), Some(t)) => (s, t),
                    _ => continue,
                };
                if source_byte == target_byte {
                    continue;
                }
                if config.splice_subtree && config.execution_indexing {
                    let shared = target_key.common_suffix_pairs(source_key);
                    if shared == 0 {
                        continue;
                    }
                    let source_prefix = source_key.prefix(shared).to_vec();
                    let target_prefix = target_key.prefix(shared).to_vec();
                    for (key, &value) in source.map.iter().filter(|(k, _)| k.has_prefix(&source_prefix)) {
                        child.map.insert(key.rebase(&source_prefix, &target_prefix), value);
                    }
                } else {
                    let span = 1 + rng.usize(0..MAX_SPLICE_SIZE);
                    for j in 0..span {
                        let (target_key, source_key) =
                            match (self.ordered_keys.get(t + j), source.ordered_keys.get(location.offset + j)) {
                                (Some(t), Some(s)) => (t, s),
                                _ => break,
                            };
                        if let Some(byte) = source.value_at(source_key) {
                            child.map.insert(target_key.clone(), byte);
                        }
                    }
                }
                return true;
            }
        }
        false
    }

    /// The shared havoc scheme over the map's iteration order.
    pub(crate) fn havoc(child: &mut MappedInput, rng: &Rng) {
        let len = child.map.len();
        let mut window = Vec::new();
        havoc_rounds(rng, len, |offset, span, write| {
            window.clear();
            window.extend(child.map.keys().skip(offset).take(span).cloned());
            for key in window.drain(..) {
                let value = write(rng);
                child.map.insert(key, value);
            }
        });
    }
}

/// An input under fuzzing: either representation, one operation set.
#[derive(Debug, Clone)]
pub enum Input {
    Linear(LinearInput),
    Mapped(MappedInput),
}

impl Input {
    /// The empty input the guidance synthesizes when it has nothing better.
    pub fn fresh(config: &Config) -> Self {
        if config.execution_indexing {
            Input::Mapped(MappedInput::new())
        } else {
            Input::Linear(LinearInput::new())
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Input::Linear(input) => input.size(),
            Input::Mapped(input) => input.size(),
        }
    }

    pub fn gc(&mut self) {
        match self {
            Input::Linear(input) => input.gc(),
            Input::Mapped(input) => input.gc(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Input::Linear(input) => input.to_bytes(),
            Input::Mapped(input) => input.to_bytes(),
        }
    }

    pub fn fuzz(
        &self,
        self_idx: usize,
        rng: &Rng,
        config: &Config,
        splice_map: &SpliceMap,
        sources: &dyn SpliceSources,
    ) -> Input {
        match self {
            Input::Linear(input) => Input::Linear(input.fuzz(rng)),
            Input::Mapped(input) => Input::Mapped(input.fuzz(self_idx, rng, config, splice_map, sources)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(path: &[u32]) -> ExecutionIndex {
        ExecutionIndex::from_raw(path.to_vec())
    }

    #[test]
    fn linear_reads_are_reproducible_after_gc() {
        let config = Config::default();
        let rng = Rng::with_seed(99);
        let mut input = LinearInput::new();
        let first: Vec<u8> = (0..16)
            .map(|i| input.get_or_generate_fresh(i, &rng, &config).unwrap())
            .collect();
        input.gc();
        assert_eq!(input.size(), 16);

        let mut replay = LinearInput::from_bytes(input.to_bytes());
        let second: Vec<u8> = (0..16)
            .map(|i| replay.get_or_generate_fresh(i, &rng, &config).unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn linear_seed_drains_its_bytes_before_generating() {
        let config = Config::default();
        let rng = Rng::with_seed(1);
        let mut input = LinearInput::from_bytes(vec![10, 20, 30]);
        assert_eq!(input.get_or_generate_fresh(0, &rng, &config), Some(10));
        assert_eq!(input.get_or_generate_fresh(1, &rng, &config), Some(20));
        assert_eq!(input.get_or_generate_fresh(2, &rng, &config), Some(30));
        // past the seed: freshly generated, and remembered
        let fresh = input.get_or_generate_fresh(3, &rng, &config).unwrap();
        assert_eq!(input.to_bytes(), vec![10, 20, 30, fresh]);
    }

    #[test]
    fn linear_answers_eof_when_configured_out() {
        let config = Config {
            generate_eof_when_out: true,
            ..Config::default()
        };
        let rng = Rng::with_seed(1);
        let mut input = LinearInput::from_bytes(vec![5]);
        assert_eq!(input.get_or_generate_fresh(0, &rng, &config), Some(5));
        assert_eq!(input.get_or_generate_fresh(1, &rng, &config), None);
    }

    #[test]
    fn linear_respects_the_size_cap() {
        let config = Config {
            max_input_size: 2,
            ..Config::default()
        };
        let rng = Rng::with_seed(1);
        let mut input = LinearInput::new();
        assert!(input.get_or_generate_fresh(0, &rng, &config).is_some());
        assert!(input.get_or_generate_fresh(1, &rng, &config).is_some());
        assert_eq!(input.get_or_generate_fresh(2, &rng, &config), None);
    }

    #[test]
    #[should_panic(expected = "out-of-order read")]
    fn linear_rejects_out_of_order_reads() {
        let config = Config::default();
        let rng = Rng::with_seed(1);
        let mut input = LinearInput::new();
        let _ = input.get_or_generate_fresh(3, &rng, &config);
    }

    #[test]
    fn linear_gc_truncates_to_what_was_requested() {
        let config = Config::default();
        let rng = Rng::with_seed(1);
        let mut input = LinearInput::from_bytes(vec![1, 2, 3, 4, 5]);
        input.get_or_generate_fresh(0, &rng, &config);
        input.get_or_generate_fresh(1, &rng, &config);
        input.gc();
        assert_eq!(input.size(), 2);
        assert_eq!(input.to_bytes(), vec![1, 2]);
    }

    #[test]
    fn linear_fuzz_keeps_the_length() {
        let rng = Rng::with_seed(7);
        let mut parent = LinearInput::from_bytes(vec![0xAA; 32]);
        parent.requested = 32;
        for _ in 0..20 {
            let child = parent.fuzz(&rng);
            assert_eq!(child.size(), 32);
        }
    }

    #[test]
    fn mapped_gc_keeps_exactly_the_requested_keys() {
        let config = Config::default();
        let rng = Rng::with_seed(3);
        let mut input = MappedInput::new();
        input.get_or_generate_fresh(raw(&[0]), &rng, &config);
        input.get_or_generate_fresh(raw(&[1]), &rng, &config);
        // a re-read of the same index duplicates the key list entry only
        input.get_or_generate_fresh(raw(&[0]), &rng, &config);
        input.gc();
        assert_eq!(input.size(), 3);
        assert_eq!(input.unique_keys(), 2);
    }

    #[test]
    fn mapped_replays_assigned_bytes_by_index() {
        let config = Config::default();
        let rng = Rng::with_seed(3);
        let mut input = MappedInput::new();
        let byte = input.get_or_generate_fresh(raw(&[7, 0, 0]), &rng, &config).unwrap();
        assert_eq!(input.get_or_generate_fresh(raw(&[7, 0, 0]), &rng, &config), Some(byte));
    }

    #[test]
    #[should_panic(expected = "after execution")]
    fn mapped_cannot_be_read_after_gc() {
        let config = Config::default();
        let rng = Rng::with_seed(3);
        let mut input = MappedInput::new();
        input.get_or_generate_fresh(raw(&[0]), &rng, &config);
        input.gc();
        input.get_or_generate_fresh(raw(&[1]), &rng, &config);
    }

    struct OneSource(MappedInput);
    impl SpliceSources for OneSource {
        fn mapped_source(&self, idx: usize) -> Option<&MappedInput> {
            (idx == 0).then(|| &self.0)
        }
    }

    fn executed_mapped(entries: &[(&[u32], u8)]) -> MappedInput {
        let config = Config::default();
        let rng = Rng::with_seed(0);
        let mut input = MappedInput::new();
        for (path, byte) in entries {
            input.map.insert(raw(path), *byte);
            input.get_or_generate_fresh(raw(path), &rng, &config);
        }
        input.gc();
        input
    }

    #[test]
    fn span_splice_copies_source_bytes_under_target_keys() {
        let config = Config::default();
        let rng = Rng::with_seed(11);
        let source = executed_mapped(&[(&[3, 0, 0], 0x11), (&[3, 0, 1], 0x22), (&[3, 0, 2], 0x33)]);
        let target = executed_mapped(&[(&[3, 1, 0], 0x44), (&[3, 1, 1], 0x55), (&[3, 1, 2], 0x66)]);

        let mut splice_map = SpliceMap::default();
        let context = raw(&[3, 0, 0]).context();
        splice_map.insert(context, vec![SpliceLocation { input: 0, offset: 0 }]);

        let mut child = MappedInput {
            map: target.map.clone(),
            ordered_keys: Vec::new(),
            executed: false,
        };
        let spliced = target.splice(&mut child, 1, &rng, &config, &splice_map, &OneSource(source));
        assert!(spliced);
        // the grafted span starts at a target key and carries source bytes
        let grafted: Vec<u8> = target
            .ordered_keys()
            .iter()
            .map(|k| child.map[k])
            .collect();
        assert!(grafted.windows(1).any(|w| [0x11, 0x22, 0x33].contains(&w[0])));
    }

    #[test]
    fn splice_rejects_itself_as_a_source() {
        let config = Config::default();
        let rng = Rng::with_seed(5);
        let target = executed_mapped(&[(&[3, 0, 0], 0x44)]);
        let mut splice_map = SpliceMap::default();
        splice_map.insert(raw(&[3, 0, 0]).context(), vec![SpliceLocation { input: 1, offset: 0 }]);
        let mut child = target.clone();
        child.executed = false;
        let spliced = target.splice(&mut child, 1, &rng, &config, &splice_map, &());
        assert!(!spliced);
    }

    #[test]
    fn subtree_splice_rekeys_the_source_subtree() {
        let config = Config {
            execution_indexing: true,
            splice_subtree: true,
            ..Config::default()
        };
        let rng = Rng::with_seed(17);
        // source subtree: first call to site 1, inner call to site 5
        let source = executed_mapped(&[(&[1, 0, 5, 0, 0], 0x11), (&[1, 0, 5, 0, 1], 0x22)]);
        // target subtree: second call to site 1, same inner call
        let target = executed_mapped(&[(&[1, 1, 5, 0, 0], 0x44), (&[1, 1, 5, 0, 1], 0x55)]);

        let mut splice_map = SpliceMap::default();
        splice_map.insert(
            raw(&[1, 0, 5, 0, 0]).context(),
            vec![SpliceLocation { input: 0, offset: 0 }],
        );
        // same context: the call chains match even though occurrences differ
        assert_eq!(raw(&[1, 0, 5, 0, 0]).context(), raw(&[1, 1, 5, 0, 0]).context());

        let mut child = MappedInput {
            map: target.map.clone(),
            ordered_keys: Vec::new(),
            executed: false,
        };
        let spliced = target.splice(&mut child, 1, &rng, &config, &splice_map, &OneSource(source));
        assert!(spliced);
        // the source entries were re-keyed under the target's prefix
        assert_eq!(child.map.get(&raw(&[1, 1, 5, 0, 0])), Some(&0x11));
        assert_eq!(child.map.get(&raw(&[1, 1, 5, 0, 1])), Some(&0x22));
    }

    #[test]
    fn fuzzed_mapped_child_starts_with_an_empty_key_list() {
        let config = Config::default();
        let rng = Rng::with_seed(23);
        let parent = executed_mapped(&[(&[0], 1), (&[1], 2), (&[2], 3)]);
        let child = parent.fuzz(0, &rng, &config, &SpliceMap::default(), &());
        assert_eq!(child.ordered_keys.len(), 0);
        assert!(!child.executed);
        assert_eq!(child.unique_keys(), 3);
    }

    #[test]
    fn geometric_samples_center_on_the_mean() {
        let rng = Rng::with_seed(31);
        let n = 20_000;
        let total: usize = (0..n).map(|_| sample_geometric(&rng, 8.0)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 8.0).abs() < 0.5, "observed mean {}", mean);
    }
}
