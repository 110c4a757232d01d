//! Patch-backend process management and the message encoder.
//!
//! The frontend drives an external backend over a line-oriented JSON stream
//! written to the backend's stdin.  With `--format json` the stream is
//! redirected into a file instead and no process is spawned.  Message
//! encoding is deterministic: identical inputs produce byte-identical
//! streams.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::elf::ElfImage;
use crate::lang::{Argument, CallSite};
use crate::{Address, Error, Result};

/// Output format of the rewriting run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// A rewritten ELF binary
    #[default]
    Binary,
    /// The raw backend message stream, written to a file
    Json,
    /// An xxd-style binary diff
    Patch,
    PatchGz,
    PatchBz2,
    PatchXz,
}

impl OutputFormat {
    /// Output filename suffix enforced for patch formats.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            OutputFormat::Patch => Some(".patch"),
            OutputFormat::PatchGz => Some(".patch.gz"),
            OutputFormat::PatchBz2 => Some(".patch.bz2"),
            OutputFormat::PatchXz => Some(".patch.xz"),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Binary => "binary",
            OutputFormat::Json => "json",
            OutputFormat::Patch => "patch",
            OutputFormat::PatchGz => "patch.gz",
            OutputFormat::PatchBz2 => "patch.bz2",
            OutputFormat::PatchXz => "patch.xz",
        };
        write!(f, "{name}")
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "binary" => Ok(OutputFormat::Binary),
            "json" => Ok(OutputFormat::Json),
            "patch" => Ok(OutputFormat::Patch),
            "patch.gz" => Ok(OutputFormat::PatchGz),
            "patch.bz2" => Ok(OutputFormat::PatchBz2),
            "patch.xz" => Ok(OutputFormat::PatchXz),
            _ => Err(format!(
                "bad value \"{s}\" for `--format' option; expected one of \"binary\", \"json\", \
                 \"patch\", \"patch.gz\", \"patch.bz2\", or \"patch.xz\""
            )),
        }
    }
}

/// A clonable in-memory sink, used by the json smoke tests.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The encoder for all backend messages.
pub struct MessageStream {
    sink: Box<dyn Write>,
    id: u64,
}

impl MessageStream {
    pub fn new(sink: Box<dyn Write>) -> Self {
        MessageStream { sink, id: 0 }
    }

    /// A stream that discards everything.
    pub fn sink() -> Self {
        MessageStream::new(Box::new(io::sink()))
    }

    /// A stream writing into a shared in-memory buffer.
    pub fn buffered() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (MessageStream::new(Box::new(buffer.clone())), buffer)
    }

    fn send(&mut self, method: &str, params: Value) -> Result<()> {
        self.id += 1;
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.id,
        });
        writeln!(self.sink, "{message}")?;
        Ok(())
    }

    /// `Binary(mode, filename)`
    pub fn binary(&mut self, mode: &str, filename: &str) -> Result<()> {
        self.send("binary", json!({ "filename": filename, "mode": mode }))
    }

    /// `Option(args[])`
    pub fn options(&mut self, args: &[String]) -> Result<()> {
        self.send("option", json!({ "argv": args }))
    }

    /// `ELFFile(descriptor)` for a call-target file
    pub fn elf_file(&mut self, elf: &ElfImage) -> Result<()> {
        self.send(
            "elf",
            json!({
                "filename": elf.filename(),
                "address": elf.base(),
                "size": elf.data().len(),
            }),
        )
    }

    /// `Trampoline(exit(status))`
    pub fn exit_trampoline(&mut self, status: u8) -> Result<()> {
        self.send(
            "trampoline",
            json!({ "name": format!("exit_{status}"), "kind": "exit", "status": status }),
        )
    }

    /// `Trampoline(passthru)`
    pub fn passthru_trampoline(&mut self) -> Result<()> {
        self.send("trampoline", json!({ "name": "passthru", "kind": "passthru" }))
    }

    /// `Trampoline(print)`
    pub fn print_trampoline(&mut self) -> Result<()> {
        self.send("trampoline", json!({ "name": "print", "kind": "print" }))
    }

    /// `Trampoline(trap)`
    pub fn trap_trampoline(&mut self) -> Result<()> {
        self.send("trampoline", json!({ "name": "trap", "kind": "trap" }))
    }

    /// `Trampoline(call(name, args, clean, call-kind))`
    pub fn call_trampoline(
        &mut self,
        name: &str,
        args: &[Argument],
        clean: bool,
        site: CallSite,
    ) -> Result<()> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.send(
            "trampoline",
            json!({
                "name": name,
                "kind": "call",
                "args": args,
                "clean": clean,
                "call": site.to_string(),
            }),
        )
    }

    /// `Instruction(addr, size, offset)`
    pub fn instruction(&mut self, addr: Address, size: u8, offset: u64) -> Result<()> {
        self.send(
            "instruction",
            json!({ "address": addr, "length": size, "offset": offset }),
        )
    }

    /// `Patch(name, offset, metadata)`
    pub fn patch(&mut self, name: &str, offset: u64, metadata: &Value) -> Result<()> {
        self.send(
            "patch",
            json!({ "trampoline": name, "offset": offset, "metadata": metadata }),
        )
    }

    /// `Emit(output, format)`
    pub fn emit(&mut self, output: &str, format: &str) -> Result<()> {
        self.send("emit", json!({ "filename": output, "format": format }))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }
}

/// The backend: a spawned process fed over a pipe, or a plain file sink for
/// `--format json`.
pub struct Backend {
    pub stream: MessageStream,
    child: Option<Child>,
}

impl Backend {
    /// Spawn the backend program with its stdin piped.
    pub fn spawn(program: &str) -> Result<Backend> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Usage(format!("failed to spawn backend \"{program}\": {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Usage(format!("failed to open pipe to backend \"{program}\"")))?;
        Ok(Backend {
            stream: MessageStream::new(Box::new(stdin)),
            child: Some(child),
        })
    }

    /// Pseudo-backend writing the message stream to a file.
    pub fn file(path: &Path) -> Result<Backend> {
        let file = std::fs::File::create(path)?;
        Ok(Backend {
            stream: MessageStream::new(Box::new(file)),
            child: None,
        })
    }

    /// Pseudo-backend writing the message stream to stdout.
    pub fn stdout() -> Backend {
        Backend {
            stream: MessageStream::new(Box::new(io::stdout())),
            child: None,
        }
    }

    /// Close the stream and wait for the backend to finish.
    pub fn wait(self) -> Result<()> {
        let Backend { mut stream, child } = self;
        stream.flush()?;
        drop(stream);
        if let Some(mut child) = child {
            let status = child.wait()?;
            if !status.success() {
                return Err(Error::Usage(format!(
                    "backend exited with status {status}"
                )));
            }
        }
        Ok(())
    }
}
