use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use rpstack::process::Target;
use rpstack::stack::{print_thread_json, print_thread_text};
use rpstack::Options;

fn usage() -> ! {
    eprintln!(
        "usage: rpstack [-ajsv] [-n max-frames] [-e executable] [-g debug-dir] \
         [-R from=to] <pid | core> ..."
    );
    std::process::exit(2);
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let mut options = Options::default();
    let mut json = false;
    let mut exe: Option<PathBuf> = None;
    let mut operands = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-a" => options.doargs = true,
            "-s" => options.nosrc = true,
            "-v" => options.verbose = true,
            "-j" => json = true,
            "-n" => match args.next().and_then(|v| v.parse().ok()) {
                Some(n) => options.max_frames = n,
                None => usage(),
            },
            "-e" => match args.next() {
                Some(path) => exe = Some(PathBuf::from(path)),
                None => usage(),
            },
            "-g" => match args.next() {
                Some(dir) => options.debug_dirs.push(PathBuf::from(dir)),
                None => usage(),
            },
            "-R" => match args.next() {
                Some(spec) => match spec.split_once('=') {
                    Some((from, to)) => options
                        .path_replacements
                        .push((from.to_string(), to.to_string())),
                    None => usage(),
                },
                None => usage(),
            },
            "-h" | "--help" => usage(),
            other if other.starts_with('-') => usage(),
            other => operands.push(other.to_string()),
        }
    }
    if operands.is_empty() {
        usage();
    }

    let mut frames_emitted = 0usize;
    for operand in &operands {
        match run_target(operand, exe.as_deref(), &options, json) {
            Ok(count) => frames_emitted += count,
            Err(err) => warn!("{operand}: {err:#}"),
        }
    }
    if frames_emitted > 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Print every thread of one target; returns the number of frames shown.
fn run_target(
    operand: &str,
    exe: Option<&std::path::Path>,
    options: &Options,
    json: bool,
) -> Result<usize> {
    let target = if let Ok(pid) = operand.parse::<i32>() {
        Target::attach(pid, options)?
    } else {
        let path = PathBuf::from(operand);
        if !path.exists() {
            bail!("no such process or file");
        }
        Target::from_core(&path, exe, options)?
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut frames = 0;
    for thread in &target.threads {
        let stack = target.unwind_thread(thread);
        frames += stack.frames.len();
        if json {
            print_thread_json(&mut out, &target, &stack, options)?;
        } else {
            print_thread_text(&mut out, &target, &stack, options)?;
        }
    }
    out.flush()?;
    Ok(frames)
}
