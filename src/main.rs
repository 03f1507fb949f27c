//! `qpu`: run programs on the VideoCore IV QPUs and query the firmware.
//!
//! ```bash
//! # One task with global uniforms and a 4 KiB output, replicated across 12 QPUs
//! qpu execute u unif.bin i prog.bin w 4096 x 12 > out.bin
//!
//! # Firmware diagnostics
//! qpu -v firmware version board clocks temp
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use qpu_rs::gpu::DevMem;
use qpu_rs::mbox::info::{Clock, PowerDomain, Voltage};
use qpu_rs::{DispatchOptions, Executor, Mailbox, VcioDevice};
use std::error::Error;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qpu")]
#[command(about = "Run programs on the VideoCore IV QPUs")]
#[command(version)]
struct Args {
    /// Dump GPU memory after execution
    #[arg(short = 'a')]
    dump_after: bool,

    /// Dump GPU memory before execution
    #[arg(short = 'b')]
    dump_before: bool,

    /// GPU timeout in seconds
    #[arg(short = 'g', value_name = "SEC", value_parser = parse_timeout)]
    timeout: Option<u32>,

    /// Dry run: stage and link, but do not execute
    #[arg(short = 'n')]
    dry_run: bool,

    /// Measure execution time
    #[arg(short = 't')]
    time: bool,

    /// Verbose output
    #[arg(short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query or control the firmware
    Firmware {
        #[arg(required = true, value_enum)]
        queries: Vec<FirmwareQuery>,
    },
    /// Declare tasks and run them
    ///
    /// i <file>: add instructions (starts a new task);
    /// u <file>: add uniforms;
    /// r <file>: add read buffer;
    /// w <size>: add write buffer;
    /// x <mult>: replicate preceding tasks.
    /// u, r and w apply to the latest task, or to every task when given before the first i.
    Execute {
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FirmwareQuery {
    /// Enable the GPU
    Enable,
    /// Disable the GPU
    Disable,
    /// Print board version
    Board,
    /// Print clock states and rates
    Clocks,
    /// Print ARM/GPU memory split
    Memory,
    /// Print power states
    Power,
    /// Print current temperature
    Temp,
    /// Print firmware version
    Version,
    /// Print current voltages
    Voltage,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum UsageError {
    #[error("Missing filename")]
    MissingFilename,
    #[error("Missing buffer size")]
    MissingSize,
    #[error("Missing multiplier")]
    MissingMultiplier,
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
    #[error("Invalid write buffer size '{0}'")]
    InvalidSize(String),
    #[error("Invalid multiplier '{0}'")]
    InvalidMultiplier(String),
    #[error("Unsupported argument '{0}'")]
    Unsupported(String),
}

/// One `execute` argument group.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Declaration {
    Instructions(PathBuf),
    Uniforms(PathBuf),
    ReadBuffer(PathBuf),
    WriteBuffer(u32),
    Replicate(u32),
}

/// Parses an integer the way `strtoll(.., 0)` does: `0x` hex, leading-`0` octal, else
/// decimal, with an optional sign. The whole string must be consumed.
fn parse_number(s: &str) -> Option<i64> {
    let (negative, digits) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    let value = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}

fn parse_timeout(s: &str) -> Result<u32, String> {
    let secs = parse_number(s).ok_or_else(|| format!("Invalid number '{s}'"))?;
    u32::try_from(secs)
        .ok()
        .filter(|&secs| secs > 0)
        .ok_or_else(|| format!("Invalid timeout '{s}'"))
}

fn positive(arg: &str, invalid: fn(String) -> UsageError) -> Result<u32, UsageError> {
    let n = parse_number(arg).ok_or_else(|| UsageError::InvalidNumber(arg.to_owned()))?;
    u32::try_from(n)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| invalid(arg.to_owned()))
}

fn parse_declarations(args: &[String]) -> Result<Vec<Declaration>, UsageError> {
    let mut decls = Vec::new();
    let mut iter = args.iter();

    while let Some(cmd) = iter.next() {
        let arg = iter.next();
        let path = || arg.map(PathBuf::from).ok_or(UsageError::MissingFilename);

        let decl = match cmd.as_str() {
            "i" => Declaration::Instructions(path()?),
            "u" => Declaration::Uniforms(path()?),
            "r" => Declaration::ReadBuffer(path()?),
            "w" => {
                let size = arg.ok_or(UsageError::MissingSize)?;
                Declaration::WriteBuffer(positive(size, UsageError::InvalidSize)?)
            }
            "x" => {
                let mult = arg.ok_or(UsageError::MissingMultiplier)?;
                let mult = positive(mult, UsageError::InvalidMultiplier)?;
                if mult <= 1 {
                    return Err(UsageError::InvalidMultiplier(mult.to_string()));
                }
                Declaration::Replicate(mult)
            }
            other => return Err(UsageError::Unsupported(other.to_owned())),
        };
        decls.push(decl);
    }

    Ok(decls)
}

fn declare<M: Mailbox>(exec: &mut Executor<M, DevMem>, decl: Declaration) -> qpu_rs::QpuResult<()> {
    match decl {
        Declaration::Instructions(path) => {
            exec.begin_next_task()?;
            exec.declare_task_instructions(path)
        }
        Declaration::Uniforms(path) if exec.has_any_task() => exec.declare_task_uniforms(path),
        Declaration::Uniforms(path) => exec.declare_global_uniforms(path),
        Declaration::ReadBuffer(path) if exec.has_any_task() => exec.declare_task_read_buffer(path),
        Declaration::ReadBuffer(path) => exec.declare_global_read_buffer(path),
        Declaration::WriteBuffer(size) if exec.has_any_task() => exec.declare_task_write_buffer(size),
        Declaration::WriteBuffer(size) => exec.declare_global_write_buffer(size),
        Declaration::Replicate(mult) => exec.replicate(mult),
    }
}

fn mhz(hz: u32) -> f64 {
    f64::from(hz) / 1_000_000.0
}

fn volts(uv: u32) -> f64 {
    f64::from(uv) / 1_000_000.0
}

const fn on_off(on: bool) -> &'static str {
    if on { "On" } else { "Off" }
}

const fn presence(present: bool) -> &'static str {
    if present { "Present" } else { "Absent" }
}

fn firmware(device: &VcioDevice, query: FirmwareQuery, verbose: bool) -> Result<(), Box<dyn Error>> {
    let divider = |title: &str| {
        if verbose {
            println!("------------ {title} ------------");
        }
    };

    match query {
        FirmwareQuery::Enable => device.set_qpu_enabled(true)?,
        FirmwareQuery::Disable => device.set_qpu_enabled(false)?,
        FirmwareQuery::Board => {
            let board = device.board()?;
            let mac = board.mac.map(|b| format!("{b:02x}")).join(":");
            divider("Board");
            println!("Model: {:#x}", board.model);
            println!("Revision: {:#x}", board.revision);
            println!("Serial: {:#x}", board.serial);
            println!("MAC: {mac}");
        }
        FirmwareQuery::Clocks => {
            divider("Clocks");
            for &clock in Clock::ALL {
                let c = device.clock(clock)?;
                println!(
                    "{}: {}, {}, Rate {:.2} MHz, Max {:.2} MHz, Min {:.2} MHz, Turbo {}",
                    clock.label(),
                    on_off(c.on),
                    presence(c.present),
                    mhz(c.rate),
                    mhz(c.max),
                    mhz(c.min),
                    on_off(c.turbo),
                );
            }
        }
        FirmwareQuery::Memory => {
            let split = device.memory_split()?;
            divider("Memory");
            println!("ARM: {} MiB, Base Address: {:#x}", split.arm_size >> 20, split.arm_base);
            println!("GPU: {} MiB, Base Address: {:#x}", split.gpu_size >> 20, split.gpu_base);
        }
        FirmwareQuery::Power => {
            divider("Power");
            for &domain in PowerDomain::ALL {
                let p = device.power(domain)?;
                println!("{}: {}, {}", domain.label(), on_off(p.on), presence(p.present));
            }
        }
        FirmwareQuery::Temp => {
            let t = device.temperature()?;
            divider("Temperature");
            println!(
                "{:.1} C (Max {:.1} C)",
                f64::from(t.current) / 1000.0,
                f64::from(t.max) / 1000.0
            );
        }
        FirmwareQuery::Version => {
            let v = device.firmware_version()?;
            divider("Version");
            println!("Revision: {:#x}", v.revision);
            println!("Variant: {:#x}", v.variant);
        }
        FirmwareQuery::Voltage => {
            divider("Voltage");
            for &rail in Voltage::ALL {
                let v = device.voltage(rail)?;
                println!(
                    "{}: {:.2} V (Min {:.2} V, Max {:.2} V)",
                    rail.label(),
                    volts(v.current),
                    volts(v.min),
                    volts(v.max)
                );
            }
        }
    }
    Ok(())
}

fn execute(args: &Args, device: VcioDevice, tokens: &[String]) -> Result<(), Box<dyn Error>> {
    let decls = parse_declarations(tokens)?;

    let mut exec = Executor::new(device, DevMem)?;
    if let Some(secs) = args.timeout {
        exec.set_timeout(secs);
    }
    for decl in decls {
        declare(&mut exec, decl)?;
    }

    // Binary dumps only go to a pipe or file.
    let dump = !io::stdout().is_terminal();
    let mut opts = DispatchOptions::new();
    if args.dry_run {
        opts = opts.dry_run();
    }
    if args.time {
        opts = opts.measure_time();
    }
    if args.verbose {
        opts = opts.verbose();
    }
    if dump && args.dump_before {
        opts = opts.dump_before();
    }
    if dump && args.dump_after {
        opts = opts.dump_after();
    }
    if dump {
        opts = opts.dump_outputs();
    }

    let report = exec.dispatch(&opts, &mut io::stdout().lock());
    let closed = exec.teardown();
    let report = report?;
    closed?;

    if let Some(elapsed) = report.elapsed {
        eprintln!("Execution time (sec): {:.6}", elapsed.as_secs_f64());
    }
    Ok(())
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let device = VcioDevice::open()?;

    match &args.command {
        Command::Firmware { queries } => {
            for &query in queries {
                firmware(&device, query, args.verbose)?;
            }
            Ok(())
        }
        Command::Execute { args: tokens } => execute(args, device, tokens),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn numbers_follow_c_prefixes() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number("0X10"), Some(16));
        assert_eq!(parse_number("010"), Some(8));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("-7"), Some(-7));
        assert_eq!(parse_number("+7"), Some(7));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("12ab"), None);
        assert_eq!(parse_number("09"), None);
        assert_eq!(parse_number("--1"), None);
    }

    #[test]
    fn timeout_must_be_positive() {
        assert_eq!(parse_timeout("5"), Ok(5));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("-3").is_err());
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn declarations_parse_in_order() {
        let decls =
            parse_declarations(&strings(&["u", "g.bin", "i", "p.bin", "w", "0x100", "x", "3"]))
                .expect("parse");
        assert_eq!(
            decls,
            vec![
                Declaration::Uniforms(PathBuf::from("g.bin")),
                Declaration::Instructions(PathBuf::from("p.bin")),
                Declaration::WriteBuffer(256),
                Declaration::Replicate(3),
            ]
        );
    }

    #[test]
    fn declaration_errors() {
        assert_eq!(
            parse_declarations(&strings(&["i"])),
            Err(UsageError::MissingFilename)
        );
        assert_eq!(
            parse_declarations(&strings(&["w", "0"])),
            Err(UsageError::InvalidSize("0".into()))
        );
        assert_eq!(
            parse_declarations(&strings(&["w", "lots"])),
            Err(UsageError::InvalidNumber("lots".into()))
        );
        assert_eq!(
            parse_declarations(&strings(&["x", "1"])),
            Err(UsageError::InvalidMultiplier("1".into()))
        );
        assert_eq!(
            parse_declarations(&strings(&["q", "file"])),
            Err(UsageError::Unsupported("q".into()))
        );
    }

    #[test]
    fn cli_accepts_flags_and_firmware_queries() {
        let args = Args::try_parse_from(["qpu", "-n", "-g", "0x10", "firmware", "temp", "clocks"])
            .expect("parse");
        assert!(args.dry_run);
        assert_eq!(args.timeout, Some(16));
        match args.command {
            Command::Firmware { queries } => {
                assert_eq!(queries, vec![FirmwareQuery::Temp, FirmwareQuery::Clocks]);
            }
            Command::Execute { .. } => panic!("expected firmware"),
        }
    }
}
