//! Command-line entry point.

use std::str::FromStr;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use graft::backend::OutputFormat;
use graft::decode::Syntax;
use graft::rewrite::{OptLevel, Options, Rewriter};
use graft::{Error, Result};

fn cli() -> Command {
    Command::new("graft")
        .about("Rule-driven frontend for a static x86-64 ELF binary rewriter")
        .arg(
            Arg::new("match")
                .short('M')
                .long("match")
                .value_name("MATCH")
                .action(ArgAction::Append)
                .help("Match instructions against MATCH"),
        )
        .arg(
            Arg::new("action")
                .short('A')
                .long("action")
                .value_name("ACTION")
                .action(ArgAction::Append)
                .help("Rewrite instructions matching the preceding --match options with ACTION"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_name("PROG")
                .default_value("./e9patch")
                .help("Use PROG as the patch backend"),
        )
        .arg(
            Arg::new("compression")
                .short('c')
                .long("compression")
                .value_name("N")
                .default_value("9")
                .help("Set the compression level (0..9)"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable debug output"),
        )
        .arg(
            Arg::new("end")
                .long("end")
                .value_name("END")
                .help("Only patch the .text section up to address or symbol END"),
        )
        .arg(
            Arg::new("executable")
                .long("executable")
                .action(ArgAction::SetTrue)
                .help("Treat the input file as an executable"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .value_name("FORMAT")
                .default_value("binary")
                .help("Set the output format (binary, json, patch, patch.gz, patch.bz2, patch.xz)"),
        )
        .arg(
            Arg::new("no-warnings")
                .long("no-warnings")
                .action(ArgAction::SetTrue)
                .help("Do not print warning messages"),
        )
        .arg(
            Arg::new("option")
                .long("option")
                .value_name("OPTION")
                .action(ArgAction::Append)
                .help("Pass OPTION through to the backend"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .default_value("a.out")
                .help("Path to the output file"),
        )
        .arg(
            Arg::new("optimization")
                .short('O')
                .value_name("LEVEL")
                .default_value("1")
                .help("Set the optimization level (-O0, -O1, -O2, -O3, -Os)"),
        )
        .arg(
            Arg::new("shared")
                .long("shared")
                .action(ArgAction::SetTrue)
                .help("Treat the input file as a shared library"),
        )
        .arg(
            Arg::new("start")
                .long("start")
                .value_name("START")
                .help("Only patch the .text section from address or symbol START"),
        )
        .arg(
            Arg::new("static-loader")
                .short('s')
                .long("static-loader")
                .action(ArgAction::SetTrue)
                .help("Replace patched pages statically"),
        )
        .arg(
            Arg::new("sync")
                .long("sync")
                .value_name("N")
                .help("Skip N instructions after the disassembler desyncs (0..1000)"),
        )
        .arg(
            Arg::new("syntax")
                .long("syntax")
                .value_name("SYNTAX")
                .default_value("ATT")
                .help("Assembly syntax (ATT or intel)"),
        )
        .arg(
            Arg::new("trap")
                .long("trap")
                .value_name("ADDR")
                .action(ArgAction::Append)
                .help("Insert a trap at the trampoline entry for ADDR"),
        )
        .arg(
            Arg::new("trap-all")
                .long("trap-all")
                .action(ArgAction::SetTrue)
                .help("Insert a trap at every trampoline entry"),
        )
        .arg(Arg::new("input").value_name("INPUT").required(true))
}

/// Pair accumulated `-M` strings with their closing `-A`, in command-line
/// order.  Leftover matches are fatal.
fn pair_rules(matches: &ArgMatches) -> Result<Vec<(Vec<String>, String)>> {
    let mut events: Vec<(usize, bool, String)> = Vec::new();
    if let (Some(indices), Some(values)) = (
        matches.indices_of("match"),
        matches.get_many::<String>("match"),
    ) {
        for (index, value) in indices.zip(values) {
            events.push((index, false, value.clone()));
        }
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("action"),
        matches.get_many::<String>("action"),
    ) {
        for (index, value) in indices.zip(values) {
            events.push((index, true, value.clone()));
        }
    }
    events.sort_by_key(|(index, _, _)| *index);

    let mut pairs = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for (_, is_action, value) in events {
        if is_action {
            pairs.push((std::mem::take(&mut pending), value));
        } else {
            pending.push(value);
        }
    }
    if !pending.is_empty() {
        return Err(Error::Usage(
            "detected extraneous matching option(s) (`--match' or `-M') that are not paired \
             with a corresponding action (`--action' or `-A')"
                .to_string(),
        ));
    }
    Ok(pairs)
}

fn parse_address(text: &str) -> Result<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u64>().ok()
    };
    parsed.ok_or_else(|| {
        Error::Usage(format!(
            "bad value \"{text}\" for `--trap' option; expected an address"
        ))
    })
}

fn options_from(matches: &ArgMatches) -> Result<Options> {
    let mut opts = Options::default();
    opts.input = matches.get_one::<String>("input").unwrap().into();
    opts.backend = matches.get_one::<String>("backend").unwrap().clone();
    opts.output = matches.get_one::<String>("output").unwrap().clone();
    opts.format = OutputFormat::from_str(matches.get_one::<String>("format").unwrap())
        .map_err(Error::Usage)?;

    let compression = matches.get_one::<String>("compression").unwrap();
    opts.compression = compression
        .parse::<u8>()
        .ok()
        .filter(|n| *n <= 9)
        .ok_or_else(|| {
            Error::Usage(format!(
                "bad value \"{compression}\" for `--compression' option; expected a number 0..9"
            ))
        })?;

    opts.optimization = OptLevel::from_str(matches.get_one::<String>("optimization").unwrap())
        .map_err(Error::Usage)?;
    opts.start = matches.get_one::<String>("start").cloned();
    opts.end = matches.get_one::<String>("end").cloned();
    opts.executable = matches.get_flag("executable");
    opts.shared = matches.get_flag("shared");
    opts.static_loader = matches.get_flag("static-loader");
    opts.trap_all = matches.get_flag("trap-all");

    if let Some(sync) = matches.get_one::<String>("sync") {
        opts.sync = Some(
            sync.parse::<u32>()
                .ok()
                .filter(|n| *n <= 1000)
                .ok_or_else(|| {
                    Error::Usage(format!(
                        "bad value \"{sync}\" for `--sync' option; expected an integer 0..1000"
                    ))
                })?,
        );
    }
    opts.syntax =
        Syntax::from_str(matches.get_one::<String>("syntax").unwrap()).map_err(Error::Usage)?;
    if let Some(traps) = matches.get_many::<String>("trap") {
        for trap in traps {
            opts.traps.insert(parse_address(trap)?);
        }
    }
    if let Some(options) = matches.get_many::<String>("option") {
        opts.backend_options = options.cloned().collect();
    }
    Ok(opts)
}

fn run() -> Result<()> {
    let matches = cli().get_matches();

    let level = if matches.get_flag("debug") {
        LevelFilter::Debug
    } else if matches.get_flag("no-warnings") {
        LevelFilter::Error
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let opts = options_from(&matches)?;
    let pairs = pair_rules(&matches)?;
    Rewriter::new(opts, pairs)?.run()
}

fn main() {
    if let Err(error) = run() {
        eprintln!("graft: {error}");
        std::process::exit(1);
    }
}
