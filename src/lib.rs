//! Fuzzguide is the core of a coverage-guided, generator-based fuzzing
//! engine: it drives a deterministic test procedure over and over, watches
//! which control-flow edges each run exercises, and keeps a corpus of
//! interesting inputs from which it breeds new ones by mutation and
//! splicing.
//!
//! The crate deliberately stops at the guidance boundary. The bytecode
//! instrumentation that emits trace events, the harness that turns a byte
//! stream into a typed input and classifies the outcome, and the
//! command-line front-end are all collaborators on the other side of the
//! interfaces in [`Guidance`], [`TraceHandle`] and [`InputStream`].
//!
//! A campaign looks like this:
//!
//! ```no_run
//! use fuzzguide::{Config, Guidance, TestOutcome};
//!
//! let mut guidance = Guidance::new(Config::default())?;
//! guidance.run_loop(|stream, _trace| {
//!     // hand `stream` to the target; the instrumentation reports events
//!     // through `_trace`; classify how the run ended:
//!     let _input = stream.read_all();
//!     TestOutcome::Success
//! })?;
//! # Ok::<(), fuzzguide::GuidanceError>(())
//! ```

mod counter;
mod coverage;
mod execution_index;
mod input;

mod config;
mod guidance;
mod signals_handler;
mod trace;
mod world;

pub use config::{options_parser, Config, DEFAULT_MAX_INPUT_SIZE};
pub use counter::Counter;
pub use coverage::{bucket, Coverage};
pub use execution_index::{ExecutionContext, ExecutionIndex, IndexingState};
pub use guidance::{
    Guidance, GuidanceError, SavedInput, TestFailure, TestOutcome, NUM_CHILDREN_BASELINE,
    NUM_CHILDREN_MULTIPLIER_FAVORED,
};
pub use input::{
    Input, LinearInput, MappedInput, SpliceLocation, SpliceMap, SpliceSources, MAX_SPLICE_SIZE,
    MEAN_MUTATION_COUNT, MEAN_MUTATION_SIZE,
};
pub use trace::{InputStream, RunTimeout, TraceEvent, TraceHandle};
pub use world::{CSVField, FuzzerEvent, GuidanceStats, World};
