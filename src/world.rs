//! The world handles effects: the output directory, the stats files, and
//! console reporting. Nothing else in the crate touches the disk or the
//! terminal.
//!
//! Layout of the output directory:
//!
//! ```text
//! out/
//!   corpus/        saved inputs, named id_NNNNNN
//!   failures/      failing inputs, same naming scheme
//!   plot_data      one CSV line per stats refresh
//!   fuzz.log       event log
//!   .cur_input     the input of the current trial, overwritten every run
//! ```

use crate::config::Config;
use crate::guidance::GuidanceError;
use nu_ansi_term::Color;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

/// Minimum interval between two stats refreshes.
const STATS_REFRESH_PERIOD: Duration = Duration::from_millis(300);

/// Counters the guidance exposes to the harness and the stats writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidanceStats {
    pub num_trials: usize,
    pub num_valid: usize,
    pub num_saved: usize,
    pub unique_failures: usize,
    pub cycles_completed: usize,
    pub current_parent_idx: usize,
    pub execs_per_sec: usize,
    pub(crate) trials_at_checkpoint: usize,
}

impl GuidanceStats {
    pub fn num_invalid(&self) -> usize {
        self.num_trials - self.num_valid
    }
}

pub enum FuzzerEvent {
    Start,
    DidReadSeeds(usize),
    New(usize),
    UniqueFailure,
    Pulse,
    CycleComplete,
    CaughtSignal(i32),
    Stop,
}

pub enum CSVField {
    Integer(isize),
    String(String),
}

impl CSVField {
    pub fn to_bytes(fields: &[CSVField]) -> Vec<u8> {
        let mut bytes = vec![];
        for field in fields {
            match field {
                CSVField::Integer(n) => {
                    bytes.extend(format!("{}", n).as_bytes());
                }
                CSVField::String(s) => {
                    bytes.extend(format!("{:?}", s).as_bytes());
                }
            }
            bytes.extend(b",");
        }
        if !bytes.is_empty() {
            bytes.pop();
        }
        bytes.extend(b"\n");
        bytes
    }
}

pub struct World {
    corpus_dir: PathBuf,
    failures_dir: PathBuf,
    cur_input_path: PathBuf,
    plot: BufWriter<File>,
    log: BufWriter<File>,
    initial_instant: Instant,
    checkpoint_instant: Instant,
    last_refresh_instant: Option<Instant>,
}

impl World {
    /// Sets up the output directory. Prior contents of `corpus/` and
    /// `failures/` are purged; the stats files start fresh.
    pub fn new(config: &Config) -> Result<Self, GuidanceError> {
        let out = &config.output_dir;
        let prepare = || -> std::io::Result<(BufWriter<File>, BufWriter<File>)> {
            fs::create_dir_all(out)?;
            for sub in ["corpus", "failures"] {
                let dir = out.join(sub);
                if dir.is_dir() {
                    fs::remove_dir_all(&dir)?;
                }
                fs::create_dir_all(&dir)?;
            }
            let plot = BufWriter::new(File::create(out.join("plot_data"))?);
            let log = BufWriter::new(File::create(out.join("fuzz.log"))?);
            Ok((plot, log))
        };
        let (mut plot, log) = prepare().map_err(GuidanceError::OutputDirectory)?;
        plot.write_all(&CSVField::to_bytes(&Self::stats_headers()))
            .map_err(GuidanceError::StatsWrite)?;
        Ok(Self {
            corpus_dir: out.join("corpus"),
            failures_dir: out.join("failures"),
            cur_input_path: out.join(".cur_input"),
            plot,
            log,
            initial_instant: Instant::now(),
            checkpoint_instant: Instant::now(),
            last_refresh_instant: None,
        })
    }

    fn stats_headers() -> Vec<CSVField> {
        [
            "unix_seconds",
            "cycles_done",
            "cur_parent_idx",
            "queue_size",
            "pending_total",
            "pending_favs",
            "unique_failures",
            "map_density",
            "paths_imported",
            "execs_per_sec",
            "valid",
            "invalid",
        ]
        .iter()
        .map(|name| CSVField::String(name.to_string()))
        .collect()
    }

    fn input_file_name(id: usize) -> String {
        format!("id_{:06}", id)
    }

    pub fn save_corpus_input(&mut self, id: usize, content: &[u8]) -> Result<PathBuf, GuidanceError> {
        let path = self.corpus_dir.join(Self::input_file_name(id));
        fs::write(&path, content).map_err(GuidanceError::CorpusWrite)?;
        Ok(path)
    }

    pub fn save_failure_input(&mut self, index: usize, content: &[u8]) -> Result<PathBuf, GuidanceError> {
        let path = self.failures_dir.join(Self::input_file_name(index));
        fs::write(&path, content).map_err(GuidanceError::CorpusWrite)?;
        Ok(path)
    }

    pub fn write_cur_input(&mut self, content: &[u8]) -> Result<(), GuidanceError> {
        fs::write(&self.cur_input_path, content).map_err(GuidanceError::CorpusWrite)
    }

    /// Whether enough time has passed since the last stats refresh.
    pub fn should_refresh_stats(&self) -> bool {
        match self.last_refresh_instant {
            None => true,
            Some(at) => at.elapsed() >= STATS_REFRESH_PERIOD,
        }
    }

    /// Appends one line to `plot_data`.
    pub fn append_stats(&mut self, stats: &GuidanceStats) -> Result<(), GuidanceError> {
        self.last_refresh_instant = Some(Instant::now());
        let unix_seconds = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let fields = [
            CSVField::Integer(unix_seconds as isize),
            CSVField::Integer(stats.cycles_completed as isize),
            CSVField::Integer(stats.current_parent_idx as isize),
            CSVField::Integer(stats.num_saved as isize),
            CSVField::Integer(0),
            CSVField::Integer(0),
            CSVField::Integer(stats.unique_failures as isize),
            CSVField::Integer(0),
            CSVField::Integer(0),
            CSVField::Integer(stats.execs_per_sec as isize),
            CSVField::Integer(stats.num_valid as isize),
            CSVField::Integer(stats.num_invalid() as isize),
        ];
        self.plot
            .write_all(&CSVField::to_bytes(&fields))
            .map_err(GuidanceError::StatsWrite)
    }

    pub fn report_event(&mut self, event: FuzzerEvent, stats: Option<&GuidanceStats>) {
        let label = match &event {
            FuzzerEvent::Start => "START".to_string(),
            FuzzerEvent::DidReadSeeds(count) => format!("READ {} SEEDS", count),
            FuzzerEvent::New(id) => format!("NEW\t{}", Self::input_file_name(*id)),
            FuzzerEvent::UniqueFailure => "FAILURE".to_string(),
            FuzzerEvent::Pulse => "PULSE".to_string(),
            FuzzerEvent::CycleComplete => "CYCLE".to_string(),
            FuzzerEvent::CaughtSignal(signal) => format!("SIGNAL {}", signal),
            FuzzerEvent::Stop => "STOP".to_string(),
        };
        let tail = stats.map(|stats| {
            format!(
                "trials: {}\tvalid: {}\tcorpus: {}\tfailures: {}\tcycles: {}\texec/s: {}",
                stats.num_trials,
                stats.num_valid,
                stats.num_saved,
                stats.unique_failures,
                stats.cycles_completed,
                stats.execs_per_sec
            )
        });
        match &event {
            FuzzerEvent::UniqueFailure | FuzzerEvent::CaughtSignal(_) => {
                println!("{}\t{}", Color::Red.paint(&label), tail.as_deref().unwrap_or(""))
            }
            _ => println!("{}\t{}", label, tail.as_deref().unwrap_or("")),
        }
        let _ = writeln!(self.log, "{}\t{}", label, tail.as_deref().unwrap_or(""));
    }

    /// A free-form line, on the console and in the log.
    pub fn log_line(&mut self, line: &str) {
        println!("{}", line);
        let _ = writeln!(self.log, "{}", line);
    }

    pub fn set_start_instant(&mut self) {
        self.initial_instant = Instant::now();
    }

    pub fn set_checkpoint_instant(&mut self) {
        self.checkpoint_instant = Instant::now();
    }

    pub fn elapsed_millis_since_start(&self) -> u64 {
        self.initial_instant.elapsed().as_millis() as u64
    }

    pub fn elapsed_micros_since_checkpoint(&self) -> u64 {
        self.checkpoint_instant.elapsed().as_micros() as u64
    }

    /// Flushes both buffered writers. Called from the shutdown path and the
    /// signal handler.
    pub fn flush(&mut self) {
        let _ = self.plot.flush();
        let _ = self.log.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(tag: &str) -> Config {
        Config {
            output_dir: std::env::temp_dir().join(format!("fuzzguide-world-{}-{}", tag, std::process::id())),
            ..Config::default()
        }
    }

    #[test]
    fn output_directory_is_prepared_and_purged() {
        let config = temp_config("purge");
        {
            let mut world = World::new(&config).unwrap();
            world.save_corpus_input(0, b"stale").unwrap();
        }
        let world = World::new(&config).unwrap();
        assert!(config.output_dir.join("corpus").is_dir());
        assert!(fs::read_dir(config.output_dir.join("corpus")).unwrap().next().is_none());
        drop(world);
        fs::remove_dir_all(&config.output_dir).unwrap();
    }

    #[test]
    fn corpus_and_failure_files_use_the_numbered_scheme() {
        let config = temp_config("names");
        let mut world = World::new(&config).unwrap();
        let corpus = world.save_corpus_input(3, b"abc").unwrap();
        let failure = world.save_failure_input(0, b"xyz").unwrap();
        assert!(corpus.ends_with("corpus/id_000003"));
        assert!(failure.ends_with("failures/id_000000"));
        assert_eq!(fs::read(&corpus).unwrap(), b"abc");
        assert_eq!(fs::read(&failure).unwrap(), b"xyz");
        fs::remove_dir_all(&config.output_dir).unwrap();
    }

    #[test]
    fn stats_lines_have_the_fixed_schema() {
        let config = temp_config("stats");
        let mut world = World::new(&config).unwrap();
        let stats = GuidanceStats {
            num_trials: 10,
            num_valid: 7,
            num_saved: 2,
            unique_failures: 1,
            cycles_completed: 1,
            current_parent_idx: 1,
            execs_per_sec: 1000,
            trials_at_checkpoint: 0,
        };
        world.append_stats(&stats).unwrap();
        world.flush();
        let content = fs::read_to_string(config.output_dir.join("plot_data")).unwrap();
        let line = content.lines().nth(1).unwrap();
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[1], "1"); // cycles
        assert_eq!(fields[2], "1"); // parent index
        assert_eq!(fields[3], "2"); // queue size
        assert_eq!(fields[6], "1"); // unique failures
        assert_eq!(fields[9], "1000"); // execs per second
        assert_eq!(fields[10], "7"); // valid
        assert_eq!(fields[11], "3"); // invalid
        fs::remove_dir_all(&config.output_dir).unwrap();
    }

    #[test]
    fn cur_input_is_overwritten() {
        let config = temp_config("cur");
        let mut world = World::new(&config).unwrap();
        world.write_cur_input(b"one").unwrap();
        world.write_cur_input(b"two").unwrap();
        assert_eq!(fs::read(config.output_dir.join(".cur_input")).unwrap(), b"two");
        fs::remove_dir_all(&config.output_dir).unwrap();
    }
}
