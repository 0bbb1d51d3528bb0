// SPDX-License-Identifier: AGPL-3.0-only

//! `ane`: build, run and inspect Apple Neural Engine programs.
//!
//! ```text
//! USAGE:
//!   ane compile <network.json> -o <program.hwx>   Assemble (or run an external compiler)
//!   ane run <program.hwx> <inputs..> -o <dir>     Execute on the software service
//!   ane diff <a.hwx> <b.hwx>                      Field-level record diff
//!   ane dump <program.hwx>                        Print header, relocations and records
//!   ane regs [--section NE]                       List the register table
//! ```
//!
//! Exit codes are per error category; the table is printed by
//! `ane --help`.

use ane_chip::{ChipError, RegisterTable, Section};
use ane_driver::{
    AneError, CapabilityMode, CompilerOptions, ExternalCompiler, Session, SessionConfig, SharedSurface,
    SoftwareService,
};
use ane_hwx::{diff, Assembler, HwxContainer, HwxError, LayoutPolicy, Network};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code table shown after the long help.
const EXIT_CODES: &str = "\
Exit codes:
  0  success
  1  diff found differences
  2  usage error
  3  structural error: FieldOverflow, InvalidStride, UnsupportedDType, UnknownActivation,
     MissingLut, UnknownField, ChannelOutOfRange, InvalidTable, InvalidRecord,
     FusionShapeMismatch, ShapeMismatch, ChannelOverflow, ResidencyViolation,
     InvalidOperand, invalid network description
  4  malformed container: TruncatedContainer, CyclicChain, InvalidContainer
  5  session or device error: DeviceUnavailable, ModeMismatch, InvalidState, SessionBusy,
     Timeout, DeviceError, Cancelled, InvalidSurface, RequestTooLarge
  6  I/O error, or any error not listed above
  7  compiler failed: CompilerFailed";

#[derive(Parser)]
#[command(name = "ane", about = "Apple Neural Engine program tools", version, after_long_help = EXIT_CODES)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Build an HWX program from a JSON network description.
    Compile {
        /// Network description.
        description: PathBuf,
        /// Output program.
        #[arg(short, long)]
        output: PathBuf,
        /// Run this compiler binary instead of the built-in assembler.
        #[arg(long)]
        compiler: Option<PathBuf>,
        /// Target architecture passed to the external compiler.
        #[arg(long, default_value = "h13")]
        target: String,
        /// Emit one record per operation.
        #[arg(long)]
        no_fusion: bool,
        /// Device base address for surfaces (hex accepted with 0x).
        #[arg(long, value_parser = parse_u32)]
        base_address: Option<u32>,
    },
    /// Execute a program on the software service.
    Run {
        /// Program to load.
        program: PathBuf,
        /// Raw input surfaces, one file per program input.
        inputs: Vec<PathBuf>,
        /// Directory receiving output0.bin, output1.bin, ...
        #[arg(short, long)]
        output: PathBuf,
        /// Completion timeout in milliseconds.
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Compare two programs field by field.
    Diff {
        /// First program.
        a: PathBuf,
        /// Second program.
        b: PathBuf,
    },
    /// Print a program's header, relocations and non-zero record fields.
    Dump {
        /// Program to print.
        program: PathBuf,
    },
    /// List register table fields.
    Regs {
        /// Only this section (Header, KernelDMASrc, Common, TileDMASrc, L2, NE, TileDMADst).
        #[arg(long)]
        section: Option<String>,
        /// Validate and list a table from a JSON file instead of the built-in one.
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(command: Cmd) -> Result<u8> {
    match command {
        Cmd::Compile {
            description,
            output,
            compiler,
            target,
            no_fusion,
            base_address,
        } => {
            let mut policy = if no_fusion {
                LayoutPolicy::without_fusion()
            } else {
                LayoutPolicy::default()
            };
            if let Some(base) = base_address {
                policy.base_address = base;
            }
            cmd_compile(&description, &output, compiler.as_deref(), &target, policy)?;
        }
        Cmd::Run {
            program,
            inputs,
            output,
            timeout_ms,
        } => cmd_run(&program, &inputs, &output, Duration::from_millis(timeout_ms))?,
        Cmd::Diff { a, b } => return cmd_diff(&a, &b),
        Cmd::Dump { program } => cmd_dump(&program)?,
        Cmd::Regs { section, table } => cmd_regs(section.as_deref(), table.as_deref())?,
    }
    Ok(0)
}

/// Stable exit code for an error, by its root cause.
fn exit_code(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(e) = cause.downcast_ref::<AneError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<HwxError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<ChipError>().is_some() {
            return 3;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return 6;
        }
    }
    6
}

fn cmd_compile(
    description: &Path,
    output: &Path,
    compiler: Option<&Path>,
    target: &str,
    policy: LayoutPolicy,
) -> Result<()> {
    let program = match compiler {
        Some(compiler) => {
            let options = CompilerOptions {
                target: target.to_string(),
                ..CompilerOptions::default()
            };
            ExternalCompiler::new(compiler)
                .with_options(options)
                .compile(description, output)?
        }
        None => {
            let network = Network::from_file(description)
                .with_context(|| format!("reading {}", description.display()))?;
            let program = Assembler::new(policy).assemble(&network)?;
            program
                .write_file(output)
                .with_context(|| format!("writing {}", output.display()))?;
            program
        }
    };

    println!(
        "{} → {}: {} record(s), {} relocation(s), {} data bytes",
        description.display(),
        output.display(),
        program.len(),
        program.relocations().len(),
        program.data().len()
    );
    Ok(())
}

fn cmd_run(program: &Path, inputs: &[PathBuf], output: &Path, timeout: Duration) -> Result<()> {
    let service = Arc::new(SoftwareService::new());
    let config = SessionConfig::default().with_timeout(timeout);
    let mut session = Session::open(service, CapabilityMode::ProgramExecution, config)?;
    session.load_file(program)?;

    let surfaces = inputs
        .iter()
        .map(|path| {
            std::fs::read(path)
                .map(SharedSurface::from_bytes)
                .with_context(|| format!("reading {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!("Running {} with {} input surface(s)", program.display(), surfaces.len());
    let handle = session.submit(surfaces)?;
    let result = session.wait_default(handle)?;
    session.close();

    std::fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
    for (n, surface) in result.outputs.iter().enumerate() {
        let path = output.join(format!("output{n}.bin"));
        std::fs::write(&path, surface.as_slice()).with_context(|| format!("writing {}", path.display()))?;
        println!("{} ({} bytes)", path.display(), surface.len());
    }
    Ok(())
}

fn cmd_diff(a: &Path, b: &Path) -> Result<u8> {
    let ca = HwxContainer::from_file(a).with_context(|| format!("reading {}", a.display()))?;
    let cb = HwxContainer::from_file(b).with_context(|| format!("reading {}", b.display()))?;

    let differences = diff(&ca, &cb);
    for d in &differences {
        println!("{d}");
    }
    if differences.is_empty() {
        println!("{} and {} are identical ({} records)", a.display(), b.display(), ca.len());
        Ok(0)
    } else {
        println!("{} difference(s)", differences.len());
        Ok(1)
    }
}

fn cmd_dump(path: &Path) -> Result<()> {
    let program = HwxContainer::from_file(path).with_context(|| format!("reading {}", path.display()))?;

    println!("{}", path.display());
    println!("  records      : {}", program.len());
    println!("  flags        : {:#x}", program.flags());
    println!("  data bytes   : {}", program.data().len());
    println!("  relocations  : {}", program.relocations().len());
    for r in program.relocations() {
        println!(
            "    {:<8} {:<12} record={:<10} offset={:#x} size={}",
            format!("{:?}", r.kind),
            r.name,
            r.record,
            r.offset,
            r.size
        );
    }

    for (i, record) in program.records().iter().enumerate() {
        let next = record.next.map_or_else(|| "end".to_string(), |n| format!("TD[{n}]"));
        println!();
        println!("TD[{i}] @ {:#x} → {next}", record.offset);
        for (field, value) in record.td.fields() {
            let shown = if field.signed {
                record.td.get_signed(&field.qualified_name())?.to_string()
            } else if value > 0xFFFF {
                format!("{value:#x}")
            } else {
                value.to_string()
            };
            println!("  {:<36} {shown}", field.qualified_name());
        }
        if let Some(lut) = record.td.lut() {
            println!("  LUT: {} entries", lut.len());
        }
    }

    match program.validate() {
        Ok(()) => println!("\nvalid"),
        Err(e) => println!("\ninvalid: {e}"),
    }
    Ok(())
}

fn cmd_regs(section: Option<&str>, table: Option<&Path>) -> Result<()> {
    let loaded;
    let table = match table {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            loaded = RegisterTable::from_json(&json)?;
            &loaded
        }
        None => RegisterTable::builtin(),
    };

    let sections: Vec<Section> = match section {
        Some(name) => vec![Section::from_name(name).ok_or_else(|| {
            ChipError::unknown_field(format!("{name} is not a section"))
        })?],
        None => Section::ALL.to_vec(),
    };

    for section in sections {
        let range = section.range();
        println!("{section} [{:#x}, {:#x})", range.start, range.end);
        for f in table.fields_in(section) {
            println!(
                "  {:<32} {:#05x}.{}  width {:>2}{}{}",
                f.name,
                f.byte_offset,
                f.bit_offset,
                f.width,
                if f.signed { "  signed" } else { "" },
                if f.alias { "  alias" } else { "" }
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const ADD: &str = r#"{
        "inputs": [
            {"shape": [1, 1, 1, 1, 64], "dtype": "float16"},
            {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
        ],
        "ops": [{
            "kind": {"type": "element_wise", "op": "add"},
            "inputs": [{"input": 0}, {"input": 1}],
            "output": {"shape": [1, 1, 1, 1, 64], "dtype": "float16"}
        }]
    }"#;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn hex_addresses_parse() {
        assert_eq!(parse_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_u32("64"), Ok(64));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn compile_diff_run_dump() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("add.json");
        std::fs::write(&json, ADD).unwrap();
        let a = dir.path().join("a.hwx");
        let b = dir.path().join("b.hwx");

        cmd_compile(&json, &a, None, "h13", LayoutPolicy::default()).unwrap();
        cmd_compile(&json, &b, None, "h13", LayoutPolicy::default()).unwrap();
        assert_eq!(cmd_diff(&a, &b).unwrap(), 0);

        let moved = LayoutPolicy {
            base_address: 0x10_0000,
            ..LayoutPolicy::default()
        };
        cmd_compile(&json, &b, None, "h13", moved).unwrap();
        assert_eq!(cmd_diff(&a, &b).unwrap(), 1);

        let input = dir.path().join("in.bin");
        std::fs::write(&input, [0u8; 128]).unwrap();
        let out = dir.path().join("out");
        cmd_run(&a, &[input.clone(), input], &out, Duration::from_secs(5)).unwrap();
        assert_eq!(std::fs::read(out.join("output0.bin")).unwrap().len(), 128);

        cmd_dump(&a).unwrap();
    }

    #[test]
    fn errors_map_to_stable_codes() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.hwx");
        std::fs::write(&bogus, [0u8; 64]).unwrap();
        let e = cmd_dump(&bogus).unwrap_err();
        assert_eq!(exit_code(&e), 4);

        let missing = dir.path().join("missing.hwx");
        let e = cmd_dump(&missing).unwrap_err();
        assert_eq!(exit_code(&e), 6);

        let e = cmd_regs(Some("Bogus"), None).unwrap_err();
        assert_eq!(exit_code(&e), 3);
    }

    #[test]
    fn long_help_lists_exit_codes() {
        let help = Cli::command().render_long_help().to_string();
        for line in ["0  success", "3  structural error", "4  malformed container", "7  compiler failed"] {
            assert!(help.contains(line), "missing {line:?}");
        }
        for kind in ["FusionShapeMismatch", "CyclicChain", "SessionBusy", "Timeout"] {
            assert!(EXIT_CODES.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn regs_lists_every_section() {
        cmd_regs(None, None).unwrap();
        cmd_regs(Some("NE"), None).unwrap();
    }
}
