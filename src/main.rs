//! CLI for the miner.
//!
//! Hand-rolled flag parser (no clap dependency): both `--flag=value` and
//! `--flag value` forms are accepted.
//!
//! ```text
//! miner-rs --input <file> --min-util <u64> [--output <file>] [--threads <n>]
//!          [--algorithm efim] [--sched numa|single]
//!          [--alpha1 <bytes>] [--beta1 <bytes>] [--beta2 <bytes>]
//!          [--alpha3 <bytes>] [--beta3 <bytes>]
//!          [--stop-scatter-depth <d>] [--stop-migration-depth <d>]
//!          [--pmem <path>] [--pmem-bytes <n>] [--report text|json]
//! ```
//!
//! Exit codes: 0 success, 1 mining error, 2 bad invocation.

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use miner_rs::error::FirstError;
use miner_rs::{
    Efim, MinerError, Region, ResultLog, RunReport, Scheduler, SpecThresholds, Topology,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SchedKind {
    /// NUMA-aware: one partition per node, node-targeted posting.
    Numa,
    /// Single-node view: one partition, plain work-stealing.
    Single,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReportFormat {
    Text,
    Json,
}

struct Cli {
    input: PathBuf,
    output: Option<PathBuf>,
    min_util: u64,
    threads: usize,
    sched: SchedKind,
    report: ReportFormat,
    thresholds: SpecThresholds,
    pmem: Option<PathBuf>,
    pmem_bytes: usize,
}

fn main() -> ExitCode {
    let cli = parse_args();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> miner_rs::Result<()> {
    let topo = Arc::new(match cli.sched {
        SchedKind::Numa => Topology::detect(),
        SchedKind::Single => Topology::single_node(),
    });
    let errors = Arc::new(FirstError::new());
    let sched = Scheduler::new(cli.threads, topo, errors);
    sched.start();

    let region = Arc::new(match &cli.pmem {
        Some(path) => Region::with_pmem(path, cli.pmem_bytes)?,
        None => Region::heap_only(),
    });
    let log = Arc::new(ResultLog::new(sched.worker_count()));

    let miner = Efim::new(
        Arc::clone(&sched),
        region,
        Arc::clone(&log),
        cli.min_util,
        cli.thresholds,
        cli.pmem.is_some(),
    );
    let mined = miner.run(&cli.input);
    sched.stop();
    mined?;
    sched.errors().check()?;

    match &cli.output {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                MinerError::Input(format!("create {}: {e}", path.display()))
            })?;
            log.flush_output(&mut BufWriter::new(file))?;
        }
        None => {
            let stdout = std::io::stdout();
            log.flush_output(&mut stdout.lock())?;
        }
    }

    let report = RunReport::build(&log, sched.stats(), cli.min_util, sched.worker_count());
    match cli.report {
        ReportFormat::Text => eprint!("{}", report.render_text()),
        ReportFormat::Json => {
            let mut err = std::io::stderr();
            let _ = writeln!(err, "{}", report.render_json());
        }
    }
    Ok(())
}

// ============================================================================
// Flag parsing
// ============================================================================

fn parse_args() -> Cli {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut min_util: Option<u64> = None;
    let mut threads: Option<usize> = None;
    let mut sched = SchedKind::Numa;
    let mut report = ReportFormat::Text;
    let mut thresholds = SpecThresholds::default();
    let mut pmem: Option<PathBuf> = None;
    let mut pmem_bytes: usize = 256 << 20;

    let mut args = env::args().skip(1).peekable();
    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((f, v)) => (f.to_string(), Some(v.to_string())),
            None => (arg, None),
        };
        let mut value = |name: &str| -> String {
            inline_value
                .clone()
                .or_else(|| args.next())
                .unwrap_or_else(|| bad_usage(&format!("{name} requires a value")))
        };
        match flag.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--algorithm" | "-a" => {
                let v = value("--algorithm");
                if v != "efim" {
                    bad_usage(&format!("unknown algorithm '{v}' (supported: efim)"));
                }
            }
            "--input" | "-i" => input = Some(PathBuf::from(value("--input"))),
            "--output" | "-o" => output = Some(PathBuf::from(value("--output"))),
            "--min-util" | "-m" => min_util = Some(parse_num(&value("--min-util"), "--min-util")),
            "--threads" | "-t" => threads = Some(parse_num(&value("--threads"), "--threads")),
            "--sched" | "-s" => {
                sched = match value("--sched").as_str() {
                    "numa" => SchedKind::Numa,
                    "single" => SchedKind::Single,
                    v => bad_usage(&format!("unknown scheduler '{v}' (numa|single)")),
                }
            }
            "--report" => {
                report = match value("--report").as_str() {
                    "text" => ReportFormat::Text,
                    "json" => ReportFormat::Json,
                    v => bad_usage(&format!("unknown report format '{v}' (text|json)")),
                }
            }
            "--alpha1" => thresholds.alpha1 = parse_num(&value("--alpha1"), "--alpha1"),
            "--beta1" => thresholds.beta1 = parse_num(&value("--beta1"), "--beta1"),
            "--beta2" => thresholds.beta2 = parse_num(&value("--beta2"), "--beta2"),
            "--alpha3" => thresholds.alpha3 = parse_num(&value("--alpha3"), "--alpha3"),
            "--beta3" => thresholds.beta3 = parse_num(&value("--beta3"), "--beta3"),
            "--stop-scatter-depth" => {
                thresholds.stop_scatter_depth =
                    parse_num(&value("--stop-scatter-depth"), "--stop-scatter-depth")
            }
            "--stop-migration-depth" => {
                thresholds.stop_migration_depth =
                    parse_num(&value("--stop-migration-depth"), "--stop-migration-depth")
            }
            "--pmem" => pmem = Some(PathBuf::from(value("--pmem"))),
            "--pmem-bytes" => pmem_bytes = parse_num(&value("--pmem-bytes"), "--pmem-bytes"),
            other => bad_usage(&format!("unknown flag '{other}'")),
        }
    }

    let input = input.unwrap_or_else(|| bad_usage("--input is required"));
    let min_util = min_util.unwrap_or_else(|| bad_usage("--min-util is required"));
    let threads = threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    if threads == 0 {
        bad_usage("--threads must be >= 1");
    }

    Cli {
        input,
        output,
        min_util,
        threads,
        sched,
        report,
        thresholds,
        pmem,
        pmem_bytes,
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, flag: &str) -> T {
    raw.parse()
        .unwrap_or_else(|_| bad_usage(&format!("bad value '{raw}' for {flag}")))
}

fn bad_usage(msg: &str) -> ! {
    eprintln!("error: {msg}");
    eprintln!();
    print_usage();
    std::process::exit(2);
}

fn print_usage() {
    eprintln!(
        "usage: miner-rs --input <file> --min-util <u64> [options]\n\
         \n\
         options:\n\
         \x20 -o, --output <file>           write itemsets here (default: stdout)\n\
         \x20 -t, --threads <n>             worker threads (default: all CPUs)\n\
         \x20 -a, --algorithm <name>        mining algorithm (efim)\n\
         \x20 -s, --sched <numa|single>     scheduler topology view (default: numa)\n\
         \x20     --report <text|json>      run report format on stderr (default: text)\n\
         \x20     --alpha1 <bytes>          parse chunk size\n\
         \x20     --beta1 <bytes>           build-phase migration threshold\n\
         \x20     --beta2 <bytes>           first-SU migration threshold\n\
         \x20     --alpha3 <bytes>          scatter-allocation threshold\n\
         \x20     --beta3 <bytes>           search migration threshold\n\
         \x20     --stop-scatter-depth <d>  disable scatter below this depth\n\
         \x20     --stop-migration-depth <d> disable migration below this depth\n\
         \x20     --pmem <path>             back transaction buffers with this region file\n\
         \x20     --pmem-bytes <n>          region capacity (default: 256 MiB)"
    );
}
