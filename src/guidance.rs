//! The fuzzing loop: picks the next input, exposes it as a byte stream,
//! classifies the outcome of the run, and decides what is worth keeping.
//!
//! The corpus is a list of saved inputs that is only ever appended to. Each
//! covered edge has exactly one *responsible* saved input; inputs with a
//! non-empty responsibility set are favored and receive a much larger child
//! budget. One pass through all saved inputs as parents is a cycle; at every
//! cycle boundary the responsibility sets must partition the cumulative
//! coverage, and the splice locations are rebuilt from favored inputs only.

use crate::config::Config;
use crate::coverage::Coverage;
use crate::input::{Input, LinearInput, MappedInput, SpliceLocation, SpliceMap, SpliceSources};
use crate::trace::{InputStream, RunState, TraceHandle};
use crate::world::{FuzzerEvent, GuidanceStats, World};
use ahash::{AHashMap, AHashSet};
use fastrand::Rng;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread::ThreadId;

/// Child budget for a parent of average coverage.
pub const NUM_CHILDREN_BASELINE: usize = 50;
/// Budget multiplier for parents that own at least one edge.
pub const NUM_CHILDREN_MULTIPLIER_FAVORED: usize = 20;
/// Trials allowed before a campaign that never observed coverage gives up.
const NO_COVERAGE_TRIAL_LIMIT: usize = 100_000;

/// An error from one of the guidance's subsystems. Target misbehavior is
/// never an error; see [`TestOutcome`].
#[derive(Debug)]
pub enum GuidanceError {
    OutputDirectory(std::io::Error),
    SeedFile(PathBuf, std::io::Error),
    CorpusWrite(std::io::Error),
    StatsWrite(std::io::Error),
    /// The target ran 100 000 times without a single coverage observation,
    /// which means the instrumentation is not wired up.
    NoCoverage,
}

impl fmt::Display for GuidanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuidanceError::OutputDirectory(e) => write!(f, "could not prepare the output directory: {}", e),
            GuidanceError::SeedFile(path, e) => write!(f, "could not read seed file {:?}: {}", path, e),
            GuidanceError::CorpusWrite(e) => write!(f, "could not write an input to disk: {}", e),
            GuidanceError::StatsWrite(e) => write!(f, "could not write stats: {}", e),
            GuidanceError::NoCoverage => {
                write!(f, "no coverage observed after {} trials", NO_COVERAGE_TRIAL_LIMIT)
            }
        }
    }
}

impl std::error::Error for GuidanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuidanceError::OutputDirectory(e)
            | GuidanceError::SeedFile(_, e)
            | GuidanceError::CorpusWrite(e)
            | GuidanceError::StatsWrite(e) => Some(e),
            GuidanceError::NoCoverage => None,
        }
    }
}

/// How a single run of the target ended. Data, not an error: every variant
/// is ordinary control flow for the guidance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// The generator produced a valid input and the test passed.
    Success,
    /// The generator rejected the byte stream before the test body ran.
    AssumptionViolated,
    Failure(TestFailure),
    Timeout,
}

/// A test failure, identified by the stack trace of its root cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    pub display: String,
    /// The identity of the failure: deduplication compares these lists.
    pub trace: Vec<String>,
}

impl TestFailure {
    pub fn new(display: impl Into<String>, trace: Vec<String>) -> Self {
        Self {
            display: display.into(),
            trace,
        }
    }

    /// Builds the failure signature from an error chain: the deepest cause
    /// identifies the failure, listed first.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = vec![error.to_string()];
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        chain.reverse();
        Self {
            display: chain[0].clone(),
            trace: chain,
        }
    }

    fn timeout() -> Self {
        Self {
            display: "single run exceeded its time budget".to_string(),
            trace: vec!["run timeout".to_string()],
        }
    }
}

/// A corpus entry. Never removed; its responsibility set shrinks when later
/// inputs take its edges over.
pub struct SavedInput {
    pub id: usize,
    /// Where the input lives on disk, unless the configuration skipped the
    /// write.
    pub file: Option<PathBuf>,
    pub input: Input,
    /// Run coverage snapshot taken when the input was saved.
    pub coverage: Coverage,
    pub non_zero_coverage: usize,
    pub offspring: usize,
    pub valid: bool,
    pub responsibilities: AHashSet<u32>,
}

impl SavedInput {
    pub fn is_favored(&self) -> bool {
        !self.responsibilities.is_empty()
    }
}

struct SavedSources<'a>(&'a [SavedInput]);

impl SpliceSources for SavedSources<'_> {
    fn mapped_source(&self, idx: usize) -> Option<&MappedInput> {
        match &self.0.get(idx)?.input {
            Input::Mapped(mapped) => Some(mapped),
            Input::Linear(_) => None,
        }
    }
}

#[derive(Clone, Copy)]
enum InputSource {
    Seed,
    Fresh,
    Child { parent: usize },
}

pub struct Guidance {
    config: Config,
    world: World,
    state: Rc<RefCell<RunState>>,
    seed_queue: VecDeque<Input>,
    saved: Vec<SavedInput>,
    total_coverage: Coverage,
    valid_coverage: Coverage,
    /// The responsible input for every covered edge; the mirror of the
    /// per-input responsibility sets.
    responsible: AHashMap<u32, usize>,
    splice_map: SpliceMap,
    unique_failures: AHashSet<Vec<String>>,
    stats: GuidanceStats,
    current_parent_idx: usize,
    children_generated: usize,
    /// Largest non-zero coverage any saved input achieved; scales the child
    /// budget of every parent.
    max_coverage: usize,
    current_source: InputSource,
}

impl Guidance {
    pub fn new(config: Config) -> Result<Self, GuidanceError> {
        let mut world = World::new(&config)?;
        let rng_seed = config.rng_seed.unwrap_or_else(|| fastrand::u64(..));
        world.log_line(&format!("rng seed: {}", rng_seed));
        let rng = Rng::with_seed(rng_seed);

        let seed_queue = Self::read_seeds(&config)?;
        if !seed_queue.is_empty() {
            world.report_event(FuzzerEvent::DidReadSeeds(seed_queue.len()), None);
        }

        let state = Rc::new(RefCell::new(RunState::new(config.clone(), rng)));
        Ok(Self {
            config,
            world,
            state,
            seed_queue,
            saved: Vec::new(),
            total_coverage: Coverage::new(),
            valid_coverage: Coverage::new(),
            responsible: AHashMap::new(),
            splice_map: SpliceMap::default(),
            unique_failures: AHashSet::new(),
            stats: GuidanceStats::default(),
            current_parent_idx: 0,
            children_generated: 0,
            max_coverage: 0,
            current_source: InputSource::Fresh,
        })
    }

    fn read_seeds(config: &Config) -> Result<VecDeque<Input>, GuidanceError> {
        let mut queue = VecDeque::new();
        let mut push_file = |path: &PathBuf, queue: &mut VecDeque<Input>| -> Result<(), GuidanceError> {
            let bytes = fs::read(path).map_err(|e| GuidanceError::SeedFile(path.clone(), e))?;
            queue.push_back(Input::Linear(LinearInput::from_bytes(bytes)));
            Ok(())
        };
        for path in &config.seed_paths {
            if path.is_dir() {
                let mut entries: Vec<PathBuf> = fs::read_dir(path)
                    .map_err(|e| GuidanceError::SeedFile(path.clone(), e))?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file())
                    .collect();
                entries.sort();
                for file in &entries {
                    push_file(file, &mut queue)?;
                }
            } else {
                push_file(path, &mut queue)?;
            }
        }
        Ok(queue)
    }

    /// Registers the trace-event callback for the target thread. The
    /// guidance drives a single target thread for its whole lifetime; a
    /// second distinct thread is an unrecoverable error.
    pub fn generate_callback(&self, thread: ThreadId) -> TraceHandle {
        self.state.borrow_mut().register_thread(thread);
        TraceHandle::new(self.state.clone())
    }

    /// The edge-log and trace-event surface for the instrumentation agent.
    pub fn trace_handle(&self) -> TraceHandle {
        TraceHandle::new(self.state.clone())
    }

    pub fn stats(&self) -> GuidanceStats {
        self.stats
    }

    pub fn saved_inputs(&self) -> &[SavedInput] {
        &self.saved
    }

    pub fn cumulative_coverage(&self) -> &Coverage {
        &self.total_coverage
    }

    pub fn cumulative_valid_coverage(&self) -> &Coverage {
        &self.valid_coverage
    }

    /// Whether the campaign's wall-clock budget still allows another run.
    pub fn has_input(&self) -> bool {
        self.world.elapsed_millis_since_start() < self.config.max_duration_ms
    }

    /// Child budget of a parent, scaled by its share of the best coverage
    /// and multiplied when the parent owns edges.
    fn target_children(&self, parent_idx: usize) -> usize {
        let parent = &self.saved[parent_idx];
        let mut target = NUM_CHILDREN_BASELINE;
        if self.max_coverage > 0 {
            target = (NUM_CHILDREN_BASELINE * parent.non_zero_coverage) / self.max_coverage;
        }
        if parent.is_favored() {
            target *= NUM_CHILDREN_MULTIPLIER_FAVORED;
        }
        target
    }

    /// Selects the next input and arms the run state for it.
    pub fn get_input(&mut self) -> Result<InputStream, GuidanceError> {
        let input = if let Some(seed) = self.seed_queue.pop_front() {
            self.current_source = InputSource::Seed;
            seed
        } else if self.saved.is_empty() || self.config.totally_random {
            if !self.config.totally_random && self.stats.num_trials > NO_COVERAGE_TRIAL_LIMIT {
                return Err(GuidanceError::NoCoverage);
            }
            self.current_source = InputSource::Fresh;
            Input::fresh(&self.config)
        } else {
            if self.children_generated >= self.target_children(self.current_parent_idx) {
                self.current_parent_idx = (self.current_parent_idx + 1) % self.saved.len();
                self.children_generated = 0;
                if self.current_parent_idx == 0 {
                    self.complete_cycle();
                }
            }
            let parent_idx = self.current_parent_idx;
            let child = {
                let state = self.state.borrow();
                let sources = SavedSources(&self.saved);
                self.saved[parent_idx]
                    .input
                    .fuzz(parent_idx, &state.rng, &self.config, &self.splice_map, &sources)
            };
            self.children_generated += 1;
            self.current_source = InputSource::Child { parent: parent_idx };
            child
        };
        self.state.borrow_mut().begin_run(input);
        Ok(InputStream::new(self.state.clone()))
    }

    fn complete_cycle(&mut self) {
        self.stats.cycles_completed += 1;
        let owned: usize = self.saved.iter().map(|input| input.responsibilities.len()).sum();
        let covered = self.total_coverage.non_zero_count();
        assert!(
            owned == covered,
            "responsibility bookkeeping out of sync: {} owned edges for {} covered edges",
            owned,
            covered
        );
        // from here on, splices draw from favored parents only
        self.splice_map.clear();
        for (idx, saved) in self.saved.iter().enumerate() {
            if !saved.is_favored() {
                continue;
            }
            if let Input::Mapped(mapped) = &saved.input {
                for (offset, key) in mapped.ordered_keys().iter().enumerate() {
                    self.splice_map
                        .entry(key.context())
                        .or_default()
                        .push(SpliceLocation { input: idx, offset });
                }
            }
        }
        self.world.report_event(FuzzerEvent::CycleComplete, Some(&self.stats));
    }

    /// Classifies the outcome of the run started by the last
    /// [`get_input`](Self::get_input) call.
    pub fn handle_result(&mut self, outcome: TestOutcome) -> Result<(), GuidanceError> {
        self.stats.num_trials += 1;
        let trial_bytes = self.state.borrow().input.to_bytes();
        self.world.write_cur_input(&trial_bytes)?;

        match outcome {
            TestOutcome::Success | TestOutcome::AssumptionViolated => {
                let valid = outcome == TestOutcome::Success;
                if valid {
                    self.stats.num_valid += 1;
                }
                self.process_coverage_run(valid)?;
            }
            TestOutcome::Failure(failure) => self.record_failure(failure)?,
            TestOutcome::Timeout => self.record_failure(TestFailure::timeout())?,
        }

        self.stats.num_saved = self.saved.len();
        self.stats.unique_failures = self.unique_failures.len();
        self.stats.current_parent_idx = self.current_parent_idx;
        self.update_exec_rate();
        if self.world.should_refresh_stats() {
            self.world.append_stats(&self.stats)?;
            self.world.report_event(FuzzerEvent::Pulse, Some(&self.stats));
        }
        Ok(())
    }

    fn process_coverage_run(&mut self, valid: bool) -> Result<(), GuidanceError> {
        let state_rc = self.state.clone();
        let mut state = state_rc.borrow_mut();
        let state = &mut *state;
        state.input.gc();

        let run_coverage = &state.run_coverage;
        let input_size = state.input.size();
        let run_non_zero = run_coverage.non_zero_count();

        let new_total = run_coverage.compute_new_coverage(&self.total_coverage);
        let new_valid = if valid {
            run_coverage.compute_new_coverage(&self.valid_coverage)
        } else {
            Vec::new()
        };

        let mut responsibilities: AHashSet<u32> = new_total.iter().copied().collect();
        responsibilities.extend(new_valid.iter().copied());

        if self.config.steal_responsibility {
            // rob the responsibilities of every saved input that this run
            // fully covers with strictly better coverage or size
            for candidate in &self.saved {
                let weaker = candidate.non_zero_coverage < run_non_zero
                    || (candidate.non_zero_coverage == run_non_zero && candidate.input.size() > input_size);
                if weaker
                    && !candidate.responsibilities.is_empty()
                    && candidate.responsibilities.iter().all(|&edge| run_coverage.get(edge) > 0)
                {
                    responsibilities.extend(candidate.responsibilities.iter().copied());
                }
            }
        }

        let bits_changed = self.total_coverage.update_bits(run_coverage);
        if valid {
            self.valid_coverage.update_bits(run_coverage);
        }

        let save = !new_total.is_empty()
            || !new_valid.is_empty()
            || (self.config.save_new_counts && bits_changed);
        if !save || self.config.totally_random {
            return Ok(());
        }

        let id = self.saved.len();
        let input = std::mem::replace(&mut state.input, Input::Linear(LinearInput::new()));
        let file = if self.config.save_only_valid && !valid {
            None
        } else {
            Some(self.world.save_corpus_input(id, &input.to_bytes())?)
        };
        let coverage = state.run_coverage.clone();

        if let InputSource::Child { parent } = self.current_source {
            self.saved[parent].offspring += 1;
        }

        // both sides of the ownership relation move together
        for &edge in &responsibilities {
            if let Some(previous) = self.responsible.insert(edge, id) {
                self.saved[previous].responsibilities.remove(&edge);
            }
        }

        if let Input::Mapped(mapped) = &input {
            for (offset, key) in mapped.ordered_keys().iter().enumerate() {
                self.splice_map
                    .entry(key.context())
                    .or_default()
                    .push(SpliceLocation { input: id, offset });
            }
        }

        self.max_coverage = self.max_coverage.max(run_non_zero);
        self.saved.push(SavedInput {
            id,
            file,
            input,
            coverage,
            non_zero_coverage: run_non_zero,
            offspring: 0,
            valid: !new_valid.is_empty(),
            responsibilities,
        });
        self.stats.num_saved = self.saved.len();
        self.world.report_event(FuzzerEvent::New(id), Some(&self.stats));
        Ok(())
    }

    fn record_failure(&mut self, failure: TestFailure) -> Result<(), GuidanceError> {
        if self.unique_failures.contains(&failure.trace) {
            return Ok(());
        }
        let index = self.unique_failures.len();
        self.unique_failures.insert(failure.trace);
        let bytes = self.state.borrow().input.to_bytes();
        self.world.save_failure_input(index, &bytes)?;
        self.world.report_event(FuzzerEvent::UniqueFailure, Some(&self.stats));
        Ok(())
    }

    fn update_exec_rate(&mut self) {
        let micros = self.world.elapsed_micros_since_checkpoint().max(1) as usize;
        let runs = self.stats.num_trials - self.stats.trials_at_checkpoint;
        self.stats.execs_per_sec = runs * 1_000_000 / micros;
        if micros > 1_000_000 {
            self.world.set_checkpoint_instant();
            self.stats.trials_at_checkpoint = self.stats.num_trials;
        }
    }

    /// Runs the whole campaign: one call of `run_one` per trial until the
    /// wall-clock budget runs out. The closure must drain the stream into
    /// the target and report how the run ended.
    pub fn run_loop<F>(&mut self, mut run_one: F) -> Result<(), GuidanceError>
    where
        F: FnMut(&mut InputStream, &TraceHandle) -> TestOutcome,
    {
        self.world.set_start_instant();
        self.world.set_checkpoint_instant();
        self.world.report_event(FuzzerEvent::Start, Some(&self.stats));
        while self.has_input() {
            let mut stream = self.get_input()?;
            let handle = self.trace_handle();
            let outcome = run_one(&mut stream, &handle);
            self.handle_result(outcome)?;
        }
        self.shutdown()
    }

    /// Final stats line, final event, flushed writers.
    pub fn shutdown(&mut self) -> Result<(), GuidanceError> {
        self.update_exec_rate();
        self.world.append_stats(&self.stats)?;
        self.world.report_event(FuzzerEvent::Stop, Some(&self.stats));
        self.world.flush();
        Ok(())
    }

    /// Lets an interruption signal flush the stats writers before the
    /// process dies.
    ///
    /// # Safety
    /// The guidance must stay at its current address until the process
    /// exits; the handler keeps a raw pointer to it.
    pub unsafe fn install_signal_handlers(&mut self) {
        let ptr = self as *mut Self;
        crate::signals_handler::set_signal_handlers(move |signal| (*ptr).receive_signal(signal));
    }

    fn receive_signal(&mut self, signal: i32) -> ! {
        self.world.report_event(FuzzerEvent::CaughtSignal(signal), Some(&self.stats));
        let _ = self.world.append_stats(&self.stats);
        self.world.flush();
        let code = if signal == libc::SIGINT || signal == libc::SIGTERM {
            0
        } else {
            1
        };
        std::process::exit(code);
    }
}
