//! treeopt CLI.
//!
//! Reads program trees, runs the optimizing pipeline over each input
//! in parallel, and prints the rewritten trees. The exit code is the
//! worst outcome across inputs: 0 success, 2 malformed input, 3 the
//! iteration budget was exceeded, 4 a rewrite was discarded by the
//! post-check or an equivalence check failed.

use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process;
use std::str::FromStr;

use rayon::prelude::*;
use tracing_subscriber::EnvFilter;

use treeopt::{
    optimize, parse_program, run_program, Config, EvalError, Node, OptimizeError, PassKind,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fuel for each `--check` evaluation, bounding non-terminating input.
const CHECK_FUEL: u64 = 1_000_000;

fn print_usage() {
    eprintln!("treeopt v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    treeopt [OPTIONS] <INPUT>...");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help              Print this help message");
    eprintln!("    -v, --version           Print version information");
    eprintln!("    -o, --output <FILE>     Write the optimized tree to FILE (single input only)");
    eprintln!("    --config <FILE>         Load configuration from a TOML file");
    eprintln!("    --max-iterations <N>    Pipeline iteration bound (default 10)");
    eprintln!("    --unroll-factor <N>     Loop unrolling factor (default 4)");
    eprintln!("    --inline-budget <N>     Largest callee size inlining copies (default 24)");
    eprintln!("    --disable-pass <NAME>   Disable one pass by name (repeatable)");
    eprintln!("    --dump-log              Print every rewrite record to stderr");
    eprintln!("    --check                 Evaluate both trees and compare outcomes");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    <INPUT>...              Input tree files (use '-' for stdin)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    treeopt input.tree");
    eprintln!("    treeopt --dump-log --check input.tree");
    eprintln!("    treeopt --disable-pass loop-unrolling input.tree");
    eprintln!("    cat input.tree | treeopt -");
}

fn print_version() {
    println!("treeopt {}", VERSION);
}

struct Options {
    inputs: Vec<String>,
    output: Option<String>,
    config: Config,
    dump_log: bool,
    check: bool,
}

fn number_arg<T: FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, String> {
    *i += 1;
    if *i >= args.len() {
        return Err(format!("missing value after {}", flag));
    }
    args[*i]
        .parse()
        .map_err(|_| format!("invalid value for {}: {}", flag, args[*i]))
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut inputs = Vec::new();
    let mut output = None;
    let mut config_path: Option<String> = None;
    let mut max_iterations = None;
    let mut unroll_factor = None;
    let mut inline_budget = None;
    let mut disabled = Vec::new();
    let mut dump_log = false;
    let mut check = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                process::exit(0);
            }
            "-o" | "--output" => {
                i += 1;
                if i >= args.len() {
                    return Err("missing output file after -o".to_string());
                }
                output = Some(args[i].clone());
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("missing config file after --config".to_string());
                }
                config_path = Some(args[i].clone());
            }
            "--max-iterations" => {
                max_iterations = Some(number_arg::<u32>(&args, &mut i, "--max-iterations")?);
            }
            "--unroll-factor" => {
                unroll_factor = Some(number_arg::<usize>(&args, &mut i, "--unroll-factor")?);
            }
            "--inline-budget" => {
                inline_budget = Some(number_arg::<usize>(&args, &mut i, "--inline-budget")?);
            }
            "--disable-pass" => {
                i += 1;
                if i >= args.len() {
                    return Err("missing pass name after --disable-pass".to_string());
                }
                let pass = PassKind::from_str(&args[i])
                    .map_err(|_| format!("unknown pass name: {}", args[i]))?;
                disabled.push(pass);
            }
            "--dump-log" => {
                dump_log = true;
            }
            "--check" => {
                check = true;
            }
            arg if arg.starts_with('-') && arg != "-" => {
                return Err(format!("unknown option: {}", arg));
            }
            arg => {
                inputs.push(arg.to_string());
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => Config::load(Path::new(path)).map_err(|e| e.to_string())?,
        None => Config::default(),
    };
    if let Some(n) = max_iterations {
        config.max_iterations = n;
    }
    if let Some(n) = unroll_factor {
        config.unroll_factor = n;
    }
    if let Some(n) = inline_budget {
        config.inline_size_budget = n;
    }
    for pass in disabled {
        config.disable_pass(pass);
    }
    config.validate().map_err(|e| e.to_string())?;

    if inputs.is_empty() {
        return Err("missing input file".to_string());
    }
    if output.is_some() && inputs.len() > 1 {
        return Err("-o requires a single input".to_string());
    }

    Ok(Options {
        inputs,
        output,
        config,
        dump_log,
        check,
    })
}

fn read_input(input: &str) -> Result<String, String> {
    if input == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("failed to read from stdin: {}", e))?;
        Ok(buffer)
    } else {
        fs::read_to_string(Path::new(input))
            .map_err(|e| format!("failed to read '{}': {}", input, e))
    }
}

fn write_output(output: Option<&str>, content: &str) -> Result<(), String> {
    match output {
        Some(path) => {
            let mut file = fs::File::create(path)
                .map_err(|e| format!("failed to create '{}': {}", path, e))?;
            file.write_all(content.as_bytes())
                .map_err(|e| format!("failed to write '{}': {}", path, e))?;
            Ok(())
        }
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}

/// Evaluate both trees and compare value, error, printed output, and
/// side-effect count. Step and lookup counts may differ; shrinking
/// them is the point of the rewrites.
fn check_equivalence(original: &Node, optimized: &Node) -> Result<(), String> {
    let before = run_program(original, CHECK_FUEL);
    if matches!(before, Err(EvalError::FuelExhausted)) {
        // Nothing observable to compare within the fuel bound.
        return Ok(());
    }
    let after = run_program(optimized, CHECK_FUEL);
    match (before, after) {
        (Ok(b), Ok(a)) => {
            if b.value != a.value {
                return Err(format!("value diverged: {} vs {}", b.value, a.value));
            }
            if b.output != a.output {
                return Err("printed output diverged".to_string());
            }
            if b.stats.side_effects != a.stats.side_effects {
                return Err(format!(
                    "side effect count diverged: {} vs {}",
                    b.stats.side_effects, a.stats.side_effects
                ));
            }
            Ok(())
        }
        (Err(b), Err(a)) if b == a => Ok(()),
        (Err(b), Err(a)) => Err(format!("error diverged: {} vs {}", b, a)),
        (Ok(_), Err(a)) => Err(format!("optimized tree raised: {}", a)),
        (Err(b), Ok(_)) => Err(format!("optimized tree no longer raises: {}", b)),
    }
}

struct UnitOutcome {
    path: String,
    /// Rendered output tree; empty when the unit produced none.
    rendered: String,
    log: Vec<String>,
    notes: Vec<String>,
    code: i32,
}

fn process_unit(path: &str, options: &Options) -> UnitOutcome {
    let mut outcome = UnitOutcome {
        path: path.to_string(),
        rendered: String::new(),
        log: Vec::new(),
        notes: Vec::new(),
        code: 0,
    };

    let source = match read_input(path) {
        Ok(source) => source,
        Err(e) => {
            outcome.notes.push(e);
            outcome.code = 1;
            return outcome;
        }
    };
    let tree = match parse_program(&source) {
        Ok(tree) => tree,
        Err(e) => {
            outcome.notes.push(format!("{}: {}", path, e));
            outcome.code = 2;
            return outcome;
        }
    };

    let original = tree.clone();
    match optimize(tree, &options.config) {
        Ok(result) => {
            if options.dump_log {
                outcome.log = result.log.records().iter().map(|r| r.to_string()).collect();
            }
            if result.budget_exceeded {
                outcome.notes.push(format!(
                    "{}: stopped after {} iterations before reaching a fixed point",
                    path, result.stats.iterations
                ));
                outcome.code = 3;
            }
            if options.check {
                if let Err(msg) = check_equivalence(&original, &result.tree) {
                    outcome.notes.push(format!("{}: {}", path, msg));
                    outcome.code = 4;
                }
            }
            outcome.rendered = result.tree.pretty();
        }
        Err(OptimizeError::MalformedTree(err)) => {
            outcome.notes.push(format!("{}: {}", path, err));
            outcome.code = 2;
        }
        Err(OptimizeError::InvariantViolation { violation, tree }) => {
            // The carried tree is the last good one; emit it so the
            // output is never silently wrong.
            outcome.notes.push(format!("{}: {}", path, violation));
            outcome.rendered = tree.pretty();
            outcome.code = 4;
        }
    }
    outcome
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TREEOPT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let outcomes: Vec<UnitOutcome> = options
        .inputs
        .par_iter()
        .map(|path| process_unit(path, &options))
        .collect();

    let mut worst = 0;
    for outcome in &outcomes {
        for line in &outcome.log {
            eprintln!("{}: {}", outcome.path, line);
        }
        for note in &outcome.notes {
            eprintln!("{}", note);
        }
        worst = worst.max(outcome.code);
    }

    // Trees print in input order whatever order the workers finished.
    for outcome in &outcomes {
        if outcome.rendered.is_empty() {
            continue;
        }
        if let Err(e) = write_output(options.output.as_deref(), &outcome.rendered) {
            eprintln!("error: {}", e);
            worst = worst.max(1);
        }
    }

    if worst != 0 {
        process::exit(worst);
    }
}
