//! Guidance configuration, read once at startup.

use getopts::Options;
use std::path::PathBuf;

pub const EXECUTION_INDEXING_FLAG: &str = "execution-indexing";
pub const SAVE_ONLY_VALID_FLAG: &str = "save-only-valid";
pub const MAX_INPUT_SIZE_FLAG: &str = "max-input-size";
pub const GENERATE_EOF_FLAG: &str = "generate-eof-when-out";
pub const SPLICE_SUBTREE_FLAG: &str = "splice-subtree";
pub const STEAL_RESPONSIBILITY_FLAG: &str = "steal-responsibility";
pub const TOTALLY_RANDOM_FLAG: &str = "totally-random";
pub const RUN_TIMEOUT_FLAG: &str = "run-timeout";
pub const MAX_DURATION_FLAG: &str = "max-duration";
pub const OUT_DIR_FLAG: &str = "out";
pub const SEEDS_FLAG: &str = "seeds";
pub const RNG_SEED_FLAG: &str = "rng-seed";

pub const DEFAULT_MAX_INPUT_SIZE: usize = 10240;

/// All recognized options. Flags toggle features off by default; the
/// tunables of the mutation and scheduling machinery are constants, not
/// options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Use execution-index-keyed inputs instead of linear byte vectors.
    pub execution_indexing: bool,
    /// Skip the disk write for saved inputs that are not valid.
    pub save_only_valid: bool,
    /// Byte cap per input.
    pub max_input_size: usize,
    /// On input exhaustion, answer EOF instead of drawing a random byte.
    pub generate_eof_when_out: bool,
    /// Splice whole execution subtrees instead of byte spans.
    pub splice_subtree: bool,
    /// Let stronger inputs take over the responsibilities of weaker ones.
    pub steal_responsibility: bool,
    /// Never save inputs; every trial generates a fresh one.
    pub totally_random: bool,
    /// Also save inputs whose only contribution is a grown count bucket.
    pub save_new_counts: bool,
    /// Per-run timeout in milliseconds; 0 disables the check.
    pub run_timeout_ms: u64,
    /// Wall-clock budget for the whole campaign, in milliseconds.
    pub max_duration_ms: u64,
    pub output_dir: PathBuf,
    /// Seed files, or directories of seed files.
    pub seed_paths: Vec<PathBuf>,
    /// Fixed RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution_indexing: false,
            save_only_valid: false,
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            generate_eof_when_out: false,
            splice_subtree: false,
            steal_responsibility: false,
            totally_random: false,
            save_new_counts: true,
            run_timeout_ms: 0,
            max_duration_ms: u64::MAX,
            output_dir: PathBuf::from("fuzz-results"),
            seed_paths: vec![],
            rng_seed: None,
        }
    }
}

#[must_use]
pub fn options_parser() -> Options {
    let mut options = Options::new();
    options.long_only(true);
    options.optflag(
        "",
        EXECUTION_INDEXING_FLAG,
        "key input bytes by execution index instead of stream offset",
    );
    options.optflag("", SAVE_ONLY_VALID_FLAG, "only write valid inputs to the corpus folder");
    options.optopt(
        "",
        MAX_INPUT_SIZE_FLAG,
        format!("maximum number of bytes per input (default: {})", DEFAULT_MAX_INPUT_SIZE).as_str(),
        "N",
    );
    options.optflag(
        "",
        GENERATE_EOF_FLAG,
        "answer EOF when an input runs out of bytes instead of generating fresh ones",
    );
    options.optflag(
        "",
        SPLICE_SUBTREE_FLAG,
        format!("splice whole execution subtrees, requires --{}", EXECUTION_INDEXING_FLAG).as_str(),
    );
    options.optflag(
        "",
        STEAL_RESPONSIBILITY_FLAG,
        "transfer edge responsibilities from weaker saved inputs to stronger new ones",
    );
    options.optflag("", TOTALLY_RANDOM_FLAG, "never save inputs, always generate fresh ones");
    options.optopt(
        "",
        RUN_TIMEOUT_FLAG,
        "maximum allowed time in milliseconds for a single run, or 0 for no limit (default: 0)",
        "MS",
    );
    options.optopt(
        "",
        MAX_DURATION_FLAG,
        "wall-clock budget for the whole campaign in milliseconds",
        "MS",
    );
    options.optopt("", OUT_DIR_FLAG, "output folder (default: fuzz-results)", "PATH");
    options.optmulti("", SEEDS_FLAG, "seed file or folder of seed files, repeatable", "PATH");
    options.optopt("", RNG_SEED_FLAG, "fixed seed for the random number generator", "N");
    options.optflag("", "help", "print this help menu");
    options
}

impl Config {
    pub fn from_parser(options: &Options, args: &[String]) -> Result<Self, String> {
        let matches = options.parse(args).map_err(|e| e.to_string())?;
        if matches.opt_present("help") {
            return Err("".to_owned());
        }

        let mut config = Config {
            execution_indexing: matches.opt_present(EXECUTION_INDEXING_FLAG),
            save_only_valid: matches.opt_present(SAVE_ONLY_VALID_FLAG),
            generate_eof_when_out: matches.opt_present(GENERATE_EOF_FLAG),
            splice_subtree: matches.opt_present(SPLICE_SUBTREE_FLAG),
            steal_responsibility: matches.opt_present(STEAL_RESPONSIBILITY_FLAG),
            totally_random: matches.opt_present(TOTALLY_RANDOM_FLAG),
            ..Config::default()
        };
        if let Some(n) = matches.opt_str(MAX_INPUT_SIZE_FLAG) {
            config.max_input_size = n
                .parse()
                .map_err(|e| format!("invalid --{}: {}", MAX_INPUT_SIZE_FLAG, e))?;
        }
        if let Some(ms) = matches.opt_str(RUN_TIMEOUT_FLAG) {
            config.run_timeout_ms = ms
                .parse()
                .map_err(|e| format!("invalid --{}: {}", RUN_TIMEOUT_FLAG, e))?;
        }
        if let Some(ms) = matches.opt_str(MAX_DURATION_FLAG) {
            config.max_duration_ms = ms
                .parse()
                .map_err(|e| format!("invalid --{}: {}", MAX_DURATION_FLAG, e))?;
        }
        if let Some(path) = matches.opt_str(OUT_DIR_FLAG) {
            config.output_dir = PathBuf::from(path);
        }
        config.seed_paths = matches.opt_strs(SEEDS_FLAG).into_iter().map(PathBuf::from).collect();
        if let Some(n) = matches.opt_str(RNG_SEED_FLAG) {
            config.rng_seed = Some(
                n.parse()
                    .map_err(|e| format!("invalid --{}: {}", RNG_SEED_FLAG, e))?,
            );
        }
        if config.splice_subtree && !config.execution_indexing {
            return Err(format!(
                "--{} requires --{}",
                SPLICE_SUBTREE_FLAG, EXECUTION_INDEXING_FLAG
            ));
        }
        Ok(config)
    }
}
