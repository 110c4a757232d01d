//! The rewriting pipeline: rule parsing, trampoline declaration, the
//! disassembly loop, and reverse-order patch emission.
//!
//! All mutable pipeline state (options, rule set, plugin registry, location
//! vector, RNG) lives in the `Rewriter`; plugins observe it read-only
//! through the handles passed to their callbacks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use goblin::elf::section_header::SHT_PROGBITS;
use log::warn;

use crate::backend::{Backend, MessageStream, OutputFormat};
use crate::csv::CsvStore;
use crate::decode::{Decoder, Syntax};
use crate::elf::{self, ElfImage};
use crate::lang::{parser, ActionKind, MatchExpr, Rule};
use crate::matcher::Matcher;
use crate::metadata::build_metadata;
use crate::plugin::PluginRegistry;
use crate::{Address, Error, Instruction, Result, MAX_RULES};

const PAGE_SIZE: Address = 4096;

/// Base address at which call-target ELF files are stacked.
const FILE_BASE: Address = 0x7000_0000;

/// Reachability window around a patch site: short-jump displacement budget,
/// plus the short-jump size, plus the maximum x86 instruction size.
pub const REACH_WINDOW: i64 = i8::MAX as i64 + 2 + 15;

const OFFSET_BITS: u32 = 48;
const SIZE_BITS: u32 = 4;
const ACTION_BITS: u32 = 10;

/// Compact per-instruction record, packed into 64 bits:
/// offset:48 | size:4 | emitted:1 | patch:1 | action:10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location(u64);

impl Location {
    pub fn new(offset: u64, size: u8, action: Option<u16>) -> Location {
        debug_assert!(offset < 1u64 << OFFSET_BITS);
        debug_assert!(u32::from(size) < 1 << SIZE_BITS);
        debug_assert!(u32::from(action.unwrap_or(0)) < 1 << ACTION_BITS);
        let mut bits = offset & ((1 << OFFSET_BITS) - 1);
        bits |= u64::from(size & 0xf) << OFFSET_BITS;
        if let Some(action) = action {
            bits |= 1 << (OFFSET_BITS + SIZE_BITS + 1); // patch
            bits |= u64::from(action) << (OFFSET_BITS + SIZE_BITS + 2);
        }
        Location(bits)
    }

    pub fn offset(self) -> u64 {
        self.0 & ((1 << OFFSET_BITS) - 1)
    }

    pub fn size(self) -> u8 {
        ((self.0 >> OFFSET_BITS) & 0xf) as u8
    }

    pub fn emitted(self) -> bool {
        self.0 & (1 << (OFFSET_BITS + SIZE_BITS)) != 0
    }

    pub fn set_emitted(&mut self) {
        self.0 |= 1 << (OFFSET_BITS + SIZE_BITS);
    }

    pub fn patch(self) -> bool {
        self.0 & (1 << (OFFSET_BITS + SIZE_BITS + 1)) != 0
    }

    pub fn action(self) -> u16 {
        ((self.0 >> (OFFSET_BITS + SIZE_BITS + 2)) & ((1 << ACTION_BITS) - 1)) as u16
    }
}

/// Backend optimization preset (`-O0..-O3`, `-Os`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    O0,
    #[default]
    O1,
    O2,
    O3,
    Os,
}

impl FromStr for OptLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            "s" => Ok(OptLevel::Os),
            _ => Err(format!(
                "bad value \"{s}\" for `-O' option; expected one of -O0,-O1,-O2,-O3,-Os"
            )),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptLevel::O0 => write!(f, "-O0"),
            OptLevel::O1 => write!(f, "-O1"),
            OptLevel::O2 => write!(f, "-O2"),
            OptLevel::O3 => write!(f, "-O3"),
            OptLevel::Os => write!(f, "-Os"),
        }
    }
}

impl OptLevel {
    /// Backend option expansion of this preset.
    pub fn backend_options(self) -> Vec<String> {
        let options: &[&str] = match self {
            OptLevel::O0 => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Ojump-peephole=false",
                "-Oorder-trampolines=false",
                "-Oscratch-stack=false",
                "--mem-granularity=64",
            ],
            OptLevel::O1 => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Oorder-trampolines=false",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=128",
            ],
            OptLevel::O2 => &[
                "-Ojump-elim=32",
                "-Ojump-elim-size=64",
                "-Oorder-trampolines=true",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=128",
            ],
            OptLevel::O3 => &[
                "-Ojump-elim=64",
                "-Ojump-elim-size=512",
                "-Oorder-trampolines=true",
                "-Ojump-peephole=true",
                "-Oscratch-stack=true",
                "--mem-granularity=4096",
            ],
            OptLevel::Os => &[
                "-Ojump-elim=0",
                "-Ojump-elim-size=0",
                "-Ojump-peephole=true",
                "-Oorder-trampolines=true",
                "-Oscratch-stack=true",
                "--mem-granularity=4096",
            ],
        };
        options.iter().map(|s| s.to_string()).collect()
    }
}

/// Backend memory-mapping sizes indexed by compression level 0..8.
const MAPPING_SIZES: [&str; 9] = [
    "2097152", "1048576", "524288", "262144", "131072", "65536", "32768", "16384", "8192",
];

/// Pipeline options, aggregated from the command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub input: PathBuf,
    pub backend: String,
    pub output: String,
    pub format: OutputFormat,
    pub compression: u8,
    pub optimization: OptLevel,
    pub start: Option<String>,
    pub end: Option<String>,
    pub executable: bool,
    pub shared: bool,
    pub static_loader: bool,
    pub trap_all: bool,
    pub traps: BTreeSet<Address>,
    pub sync: Option<u32>,
    pub syntax: Syntax,
    pub backend_options: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            input: PathBuf::new(),
            backend: "./e9patch".to_string(),
            output: "a.out".to_string(),
            format: OutputFormat::Binary,
            compression: 9,
            optimization: OptLevel::O1,
            start: None,
            end: None,
            executable: false,
            shared: false,
            static_loader: false,
            trap_all: false,
            traps: BTreeSet::new(),
            sync: None,
            syntax: Syntax::Att,
            backend_options: Vec::new(),
        }
    }
}

/// Binary-vs-shared classification for the `binary` message.
fn binary_mode(executable: bool, shared: bool, is_dyn: bool, is_lib_name: bool) -> &'static str {
    if executable {
        "exe"
    } else if shared || (is_dyn && is_lib_name) {
        "dso"
    } else {
        "exe"
    }
}

/// Normalize the output path and format for the final `emit` message.
fn normalize_output(output: &str, format: OutputFormat) -> (String, OutputFormat) {
    match format {
        // The json pseudo-format has already redirected the stream; the
        // emit message reverts to the defaults.
        OutputFormat::Json => ("a.out".to_string(), OutputFormat::Binary),
        _ => match format.suffix() {
            Some(suffix) if !output.ends_with(suffix) => {
                (format!("{output}{suffix}"), format)
            }
            _ => (output.to_string(), format),
        },
    }
}

/// The orchestrator.
pub struct Rewriter {
    opts: Options,
    elf: ElfImage,
    rules: Vec<Rule>,
    plugins: PluginRegistry,
    detail: bool,
}

impl Rewriter {
    /// Parse the rule set against the input ELF.  `pairs` are the
    /// accumulated `-M` strings with their closing `-A` string, in command
    /// line order.
    pub fn new(opts: Options, pairs: Vec<(Vec<String>, String)>) -> Result<Rewriter> {
        if opts.shared && opts.executable {
            return Err(Error::Usage(
                "both the `--shared' and `--executable' options cannot be used at the same time"
                    .to_string(),
            ));
        }
        if pairs.len() > MAX_RULES {
            return Err(Error::Usage(format!(
                "the total number of actions ({}) exceeds the maximum ({MAX_RULES})",
                pairs.len()
            )));
        }

        let elf = ElfImage::open(&opts.input, 0)?;
        let mut plugins = PluginRegistry::new();
        let mut csv = CsvStore::new();
        let mut ctx = parser::ParseCtx::new(&elf, &mut plugins, &mut csv);

        let mut rules = Vec::with_capacity(pairs.len());
        for (matches, action) in &pairs {
            if matches.is_empty() {
                return Err(Error::Usage(
                    "the `--action' or `-A' option must be preceded by one or more `--match' or \
                     `-M' options"
                        .to_string(),
                ));
            }
            let mut expr: Option<MatchExpr> = None;
            for text in matches {
                let parsed = parser::parse_match(&mut ctx, text)?;
                expr = Some(match expr {
                    None => parsed,
                    Some(prev) => MatchExpr::And(Box::new(prev), Box::new(parsed)),
                });
            }
            let action = parser::parse_action(&mut ctx, action)?;
            rules.push(Rule {
                matching: expr.expect("at least one match string"),
                action,
            });
        }
        let detail = ctx.detail;
        drop(ctx);
        // The CSV store's rows stay alive through the Rc references held by
        // the rule payloads.
        drop(csv);

        Ok(Rewriter {
            opts,
            elf,
            rules,
            plugins,
            detail,
        })
    }

    /// Run the full pipeline.
    pub fn run(mut self) -> Result<()> {
        let mut backend = self.open_backend()?;
        let out = &mut backend.stream;

        let mode = binary_mode(
            self.opts.executable,
            self.opts.shared,
            self.elf.is_dyn(),
            elf::is_library_filename(&self.opts.input.display().to_string()),
        );
        out.binary(mode, &self.elf.filename())?;

        self.send_options(out)?;
        self.plugins.init_all(out, &self.elf);
        self.send_trampolines(out)?;

        // Resolve the patched range of the text section.
        let text = self
            .elf
            .section(".text")
            .ok_or_else(|| {
                Error::Usage(
                    "failed to disassemble \".text\" section; section not found".to_string(),
                )
            })?;
        if text.sh_type != SHT_PROGBITS {
            return Err(Error::Usage(
                "failed to disassemble \".text\" section; section type is not PROGBITS"
                    .to_string(),
            ));
        }
        let mut text_addr = text.addr;
        let mut text_offset = text.offset;
        let mut text_size = text.size;
        if let Some(start) = self.opts.start.clone() {
            let start_addr = elf::parse_position(&self.elf, "--start", &start)?;
            let delta = start_addr.wrapping_sub(text_addr);
            if delta > text_size {
                return Err(Error::Usage(format!(
                    "bad value for `--start' option; address {start_addr:#x} is outside the \
                     .text section"
                )));
            }
            text_addr += delta;
            text_offset += delta;
            text_size -= delta;
        }
        if let Some(end) = self.opts.end.clone() {
            let end_addr = elf::parse_position(&self.elf, "--end", &end)?;
            let delta = (text_addr + text_size).wrapping_sub(end_addr);
            if delta > text_size {
                return Err(Error::Usage(format!(
                    "bad value for `--end' option; address {end_addr:#x} is outside the .text \
                     section"
                )));
            }
            text_size -= delta;
        }

        let decoder = Decoder::new(self.opts.syntax, self.detail)?;
        let matcher = Matcher::new();
        let notify = self.plugins.notify_mode();

        // First disassembly pass.
        let plugins = &mut self.plugins;
        let rules = &self.rules;
        let elf = &self.elf;
        let mut locs = scan_range(
            &decoder,
            elf.data(),
            &self.opts.input,
            text_addr,
            text_offset,
            text_size,
            self.opts.sync,
            |insn, offset| {
                if notify {
                    plugins.notify_all(out, elf, insn, offset as i64);
                    Ok(None)
                } else {
                    plugins.match_all(out, elf, insn, offset as i64);
                    let idx = matcher.dispatch(plugins, rules, insn, offset as i64)?;
                    Ok(idx.map(|i| i as u16))
                }
            },
        )?;

        // Second pass: the first pass was used for plugin notifications.
        if notify {
            for i in 0..locs.len() {
                let loc = locs[i];
                let addr = text_addr + loc.offset();
                let file_off = (text_offset + loc.offset()) as usize;
                let insn = decoder
                    .decode(self.elf.data(), file_off, addr)
                    .ok_or(Error::Decode { addr })?;
                self.plugins
                    .match_all(out, &self.elf, &insn, loc.offset() as i64);
                let idx =
                    matcher.dispatch(&self.plugins, &self.rules, &insn, loc.offset() as i64)?;
                if let Some(idx) = idx {
                    locs[i] = Location::new(loc.offset(), insn.size, Some(idx as u16));
                }
            }
        }

        // Send instructions and patches.  This MUST be done in reverse.
        let mut id: i64 = -1;
        for i in (0..locs.len()).rev() {
            if !locs[i].patch() {
                continue;
            }
            let loc = locs[i];
            let addr = text_addr + loc.offset();
            let file_offset = text_offset + loc.offset();
            let insn = decoder
                .decode(self.elf.data(), file_offset as usize, addr)
                .ok_or(Error::Decode { addr })?;

            for j in (0..=i).rev() {
                if !send_instruction(out, &mut locs[j], addr, text_addr, text_offset)? {
                    break;
                }
            }
            for j in i + 1..locs.len() {
                if !send_instruction(out, &mut locs[j], addr, text_addr, text_offset)? {
                    break;
                }
            }

            id += 1;
            let rule = &self.rules[loc.action() as usize];
            match rule.action.kind {
                ActionKind::Plugin(plugin) => {
                    self.plugins
                        .patch(plugin, out, &self.elf, &insn, file_offset as i64);
                }
                _ => {
                    let metadata = build_metadata(
                        &matcher,
                        &self.plugins,
                        &self.elf,
                        rule,
                        &insn,
                        file_offset as i64,
                        id,
                    )?;
                    out.patch(&rule.action.name, file_offset, &metadata)?;
                }
            }
        }

        self.plugins.fini_all(out, &self.elf);

        let (output, format) = normalize_output(&self.opts.output, self.opts.format);
        out.emit(&output, &format.to_string())?;
        backend.wait()
    }

    fn open_backend(&self) -> Result<Backend> {
        if self.opts.format == OutputFormat::Json {
            if self.opts.output == "-" {
                return Ok(Backend::stdout());
            }
            let mut filename = self.opts.output.clone();
            if !filename.ends_with(".json") {
                filename.push_str(".json");
            }
            return Backend::file(Path::new(&filename));
        }
        Backend::spawn(&self.opts.backend)
    }

    fn send_options(&self, out: &mut MessageStream) -> Result<()> {
        let mut options: Vec<String> = Vec::new();
        if self.opts.compression != 9 {
            options.push("--mem-mapping-size".to_string());
            options.push(MAPPING_SIZES[self.opts.compression as usize].to_string());
        }
        if self.opts.static_loader {
            options.push("--static-loader".to_string());
        }
        if self.opts.trap_all {
            options.push("--trap-all".to_string());
        }
        options.extend(self.opts.optimization.backend_options());
        options.extend(self.opts.backend_options.iter().cloned());
        if !options.is_empty() {
            out.options(&options)?;
        }
        for addr in &self.opts.traps {
            out.options(&["--trap".to_string(), addr.to_string()])?;
        }
        Ok(())
    }

    /// Emit trampoline definitions for every distinct exit status, call
    /// target, and for print/passthru/trap when used; load each distinct
    /// call-target ELF file once.
    fn send_trampolines(&mut self, out: &mut MessageStream) -> Result<()> {
        let mut have_print = false;
        let mut have_passthru = false;
        let mut have_trap = false;
        let mut have_exit: BTreeSet<u8> = BTreeSet::new();
        let mut have_call: BTreeSet<String> = BTreeSet::new();
        let mut files: HashMap<String, ElfImage> = HashMap::new();
        let mut file_addr = FILE_BASE;

        for rule in &self.rules {
            match &rule.action.kind {
                ActionKind::Print => have_print = true,
                ActionKind::Passthru => have_passthru = true,
                ActionKind::Trap => have_trap = true,
                ActionKind::Plugin(_) => {}
                ActionKind::Exit(status) => {
                    if have_exit.insert(*status) {
                        out.exit_trampoline(*status)?;
                    }
                }
                ActionKind::Call {
                    filename,
                    args,
                    clean,
                    site,
                    ..
                } => {
                    if !files.contains_key(filename) {
                        let target = ElfImage::open(filename, file_addr)?;
                        out.elf_file(&target)?;
                        file_addr = target.end() + 2 * PAGE_SIZE;
                        file_addr -= file_addr % PAGE_SIZE;
                        files.insert(filename.clone(), target);
                    }
                    if have_call.insert(rule.action.name.clone()) {
                        out.call_trampoline(&rule.action.name, args, *clean, *site)?;
                    }
                }
            }
        }
        if have_passthru {
            out.passthru_trampoline()?;
        }
        if have_print {
            out.print_trampoline()?;
        }
        if have_trap {
            out.trap_trampoline()?;
        }
        Ok(())
    }
}

/// Walk the patched range once: decode each instruction, hand it to
/// `visit` (which returns the matched action index, if any), and collect
/// the location vector.
///
/// Desync bookkeeping: an undecodable byte warns, sets the failed flag,
/// and opens a skip window of `--sync N` items; the window consumes the
/// following N items silently, decoded or not, before matching resumes.
/// Within one contiguous undecodable run the failure bookkeeping fires
/// only once.  A failed walk is fatal unless `--sync` was given.
#[allow(clippy::too_many_arguments)]
fn scan_range(
    decoder: &Decoder,
    data: &[u8],
    input: &Path,
    text_addr: Address,
    text_offset: u64,
    text_size: u64,
    sync_option: Option<u32>,
    mut visit: impl FnMut(&Instruction, u64) -> Result<Option<u16>>,
) -> Result<Vec<Location>> {
    let mut locs: Vec<Location> = Vec::new();
    let mut offset: u64 = 0;
    let mut sync: u32 = 0;
    let mut desync = false;
    let mut failed = false;
    while offset < text_size {
        let addr = text_addr + offset;
        let file_off = (text_offset + offset) as usize;
        let insn = decoder.decode(data, file_off, addr);
        let step = insn.as_ref().map_or(1, |insn| insn.size as u64);
        if sync > 0 {
            sync -= 1;
            if insn.is_some() {
                desync = false;
            }
            offset += step;
            continue;
        }
        match insn {
            None => {
                if !desync {
                    warn!("failed to disassemble instruction at address {addr:#x}");
                    failed = true;
                    sync = sync_option.unwrap_or(0);
                    desync = true;
                }
                offset += 1;
            }
            Some(insn) => {
                desync = false;
                let action = visit(&insn, offset)?;
                locs.push(Location::new(offset, insn.size, action));
                offset += step;
            }
        }
    }
    if failed {
        if sync_option.is_none() {
            return Err(Error::Usage(format!(
                "failed to disassemble the .text section of \"{}\"; this may be caused by \
                 (1) data in the .text section, or (2) a bug in the third party disassembler",
                input.display()
            )));
        }
        warn!(
            "failed to disassemble the .text section of \"{}\"; the rewritten binary may be \
             corrupt",
            input.display()
        );
    }
    Ok(locs)
}

/// Emit an `instruction` message for `loc` if it lies within the short-jump
/// reachability window of the patch site at `patch_addr`.  Returns false
/// once the window is exceeded, ending the caller's outward walk.  The
/// sticky emitted flag keeps every location serialized at most once.
fn send_instruction(
    out: &mut MessageStream,
    loc: &mut Location,
    patch_addr: Address,
    text_addr: Address,
    text_offset: u64,
) -> Result<bool> {
    let addr = text_addr + loc.offset();
    if (addr as i64 - patch_addr as i64).abs() > REACH_WINDOW {
        return Ok(false);
    }
    if loc.emitted() {
        return Ok(true);
    }
    loc.set_emitted();
    out.instruction(addr, loc.size(), text_offset + loc.offset())?;
    Ok(true)
}
