//! The boundary between the guidance and the instrumented target.
//!
//! The instrumentation agent registers once per guidance instance and then
//! reports ordered trace events from the target thread through a
//! [`TraceHandle`]; the target itself drains bytes from the [`InputStream`]
//! the guidance hands out for each run. Both are views onto the same
//! per-run state, which the guidance resets between runs.

use crate::config::Config;
use crate::coverage::Coverage;
use crate::execution_index::IndexingState;
use crate::input::{Input, LinearInput};
use fastrand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Trace events are polled against the run budget once per this many events.
const TIMEOUT_POLL_INTERVAL: u64 = 10_000;

/// One ordered event from the instrumented target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Branch { iid: i32, arm: i32 },
    Call { iid: i32 },
    Return { iid: i32 },
}

/// The single run exceeded its time budget.
///
/// Returned from the trace callbacks; the harness must stop the run and
/// report [`TestOutcome::Timeout`](crate::TestOutcome::Timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimeout;

impl fmt::Display for RunTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "single run exceeded its time budget")
    }
}

impl std::error::Error for RunTimeout {}

pub(crate) struct RunState {
    pub(crate) config: Config,
    pub(crate) rng: Rng,
    pub(crate) input: Input,
    pub(crate) run_coverage: Coverage,
    pub(crate) indexing: Option<IndexingState>,
    cursor: usize,
    events_seen: u64,
    run_start: Instant,
    run_timeout: Option<Duration>,
    timed_out: bool,
    target_thread: Option<ThreadId>,
}

impl RunState {
    pub(crate) fn new(config: Config, rng: Rng) -> Self {
        let indexing = config.execution_indexing.then(IndexingState::new);
        let run_timeout = (config.run_timeout_ms > 0).then(|| Duration::from_millis(config.run_timeout_ms));
        Self {
            config,
            rng,
            input: Input::Linear(LinearInput::new()),
            run_coverage: Coverage::new(),
            indexing,
            cursor: 0,
            events_seen: 0,
            run_start: Instant::now(),
            run_timeout,
            timed_out: false,
            target_thread: None,
        }
    }

    pub(crate) fn begin_run(&mut self, input: Input) {
        self.input = input;
        self.run_coverage.clear();
        if let Some(indexing) = &mut self.indexing {
            indexing.reset();
        }
        self.cursor = 0;
        self.events_seen = 0;
        self.run_start = Instant::now();
        self.timed_out = false;
    }

    pub(crate) fn register_thread(&mut self, thread: ThreadId) {
        match self.target_thread {
            None => self.target_thread = Some(thread),
            Some(expected) => assert!(
                expected == thread,
                "a second target thread registered a callback: expected {:?}, got {:?}",
                expected,
                thread
            ),
        }
    }

    pub(crate) fn note_target_thread(&mut self) {
        let current = std::thread::current().id();
        self.register_thread(current);
    }

    fn count_event(&mut self) -> Result<(), RunTimeout> {
        if self.timed_out {
            return Err(RunTimeout);
        }
        self.events_seen += 1;
        if self.events_seen % TIMEOUT_POLL_INTERVAL == 0 {
            if let Some(timeout) = self.run_timeout {
                if self.run_start.elapsed() > timeout {
                    self.timed_out = true;
                    return Err(RunTimeout);
                }
            }
        }
        Ok(())
    }
}

/// The edge-log and trace-event callback surface handed to the
/// instrumentation agent.
///
/// A callback returning [`RunTimeout`] means the run budget is exhausted:
/// the agent must unwind the target and let the harness classify the run as
/// a timeout.
#[derive(Clone)]
pub struct TraceHandle {
    state: Rc<RefCell<RunState>>,
}

impl TraceHandle {
    pub(crate) fn new(state: Rc<RefCell<RunState>>) -> Self {
        Self { state }
    }

    pub fn on_trace_event(&self, event: TraceEvent) -> Result<(), RunTimeout> {
        match event {
            TraceEvent::Branch { iid, arm } => self.on_branch_event(iid, arm),
            TraceEvent::Call { iid } => self.on_call_event(iid),
            TraceEvent::Return { iid } => self.on_return_event(iid),
        }
    }

    pub fn on_branch_event(&self, iid: i32, arm: i32) -> Result<(), RunTimeout> {
        let mut state = self.state.borrow_mut();
        state.note_target_thread();
        state.run_coverage.handle_branch(iid, arm);
        state.count_event()
    }

    pub fn on_call_event(&self, iid: i32) -> Result<(), RunTimeout> {
        let mut state = self.state.borrow_mut();
        state.note_target_thread();
        state.run_coverage.handle_call(iid);
        if let Some(indexing) = &mut state.indexing {
            indexing.push_call(iid);
        }
        state.count_event()
    }

    pub fn on_return_event(&self, _iid: i32) -> Result<(), RunTimeout> {
        let mut state = self.state.borrow_mut();
        state.note_target_thread();
        if let Some(indexing) = &mut state.indexing {
            indexing.pop_return();
        }
        state.count_event()
    }

    /// Direct edge log, for probes that cannot sit at the precise branch
    /// target. Uses the collision-tolerant additive key.
    pub fn log_coverage(&self, iid: i32, arm: i32) {
        let mut state = self.state.borrow_mut();
        state.note_target_thread();
        state.run_coverage.log_coverage(iid, arm);
    }
}

/// The byte stream of the current run. The target must drain it: every byte
/// of the input is delivered through here, keyed either by stream offset or
/// by the execution index of the request.
pub struct InputStream {
    state: Rc<RefCell<RunState>>,
}

impl InputStream {
    pub(crate) fn new(state: Rc<RefCell<RunState>>) -> Self {
        Self { state }
    }

    /// The next byte of the input, or `None` at end of input.
    pub fn read_byte(&mut self) -> Option<u8> {
        let state = &mut *self.state.borrow_mut();
        let RunState {
            config,
            rng,
            input,
            indexing,
            cursor,
            ..
        } = state;
        match input {
            Input::Linear(linear) => {
                let byte = linear.get_or_generate_fresh(*cursor, rng, config);
                if byte.is_some() {
                    *cursor += 1;
                }
                byte
            }
            Input::Mapped(mapped) => {
                let key = indexing
                    .as_mut()
                    .expect("mapped inputs require execution indexing")
                    .next_byte_index();
                mapped.get_or_generate_fresh(key, rng, config)
            }
        }
    }

    /// Drains the stream into a vector, for targets that want the whole
    /// input at once.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(byte) = self.read_byte() {
            bytes.push(byte);
        }
        bytes
    }
}
