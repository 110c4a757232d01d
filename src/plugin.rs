//! Dynamically-loaded plugin registry.
//!
//! A plugin is a shared object exporting any subset of five entry points:
//!
//! ```text
//! graft_plugin_init (out, elf)                      -> context
//! graft_plugin_instr(out, elf, instr, offset, ctx)
//! graft_plugin_match(out, elf, instr, offset, ctx)  -> i64
//! graft_plugin_patch(out, elf, instr, offset, ctx)
//! graft_plugin_fini (out, elf, ctx)
//! ```
//!
//! Plugins are deduplicated by canonical path and iterated in canonical-path
//! order.  If any loaded plugin exports `graft_plugin_instr`, the pipeline
//! switches to two-pass (notify) mode.  Callbacks may write auxiliary
//! messages to the backend stream.

use std::collections::BTreeMap;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::backend::MessageStream;
use crate::elf::ElfImage;
use crate::{Error, Instruction, Result};

pub type PluginInitFn =
    unsafe extern "C" fn(*mut MessageStream, *const ElfImage) -> *mut c_void;
pub type PluginInstrFn =
    unsafe extern "C" fn(*mut MessageStream, *const ElfImage, *const Instruction, i64, *mut c_void);
pub type PluginMatchFn = unsafe extern "C" fn(
    *mut MessageStream,
    *const ElfImage,
    *const Instruction,
    i64,
    *mut c_void,
) -> i64;
pub type PluginPatchFn =
    unsafe extern "C" fn(*mut MessageStream, *const ElfImage, *const Instruction, i64, *mut c_void);
pub type PluginFiniFn = unsafe extern "C" fn(*mut MessageStream, *const ElfImage, *mut c_void);

/// The optional entry points of a plugin.
#[derive(Default, Clone, Copy)]
pub struct PluginSlots {
    pub init: Option<PluginInitFn>,
    pub instr: Option<PluginInstrFn>,
    pub matching: Option<PluginMatchFn>,
    pub patch: Option<PluginPatchFn>,
    pub fini: Option<PluginFiniFn>,
}

impl PluginSlots {
    fn is_empty(&self) -> bool {
        self.init.is_none()
            && self.instr.is_none()
            && self.matching.is_none()
            && self.patch.is_none()
            && self.fini.is_none()
    }
}

/// A loaded plugin: capability record plus opaque per-plugin state.
pub struct Plugin {
    /// Canonical path (dedup key)
    pub path: PathBuf,
    slots: PluginSlots,
    /// Keeps the shared object mapped for the lifetime of the record
    _lib: Option<Library>,
    /// Opaque context returned by `init`
    context: *mut c_void,
    /// Most recent `match` return value
    result: i64,
}

impl Plugin {
    pub fn has_match(&self) -> bool {
        self.slots.matching.is_some()
    }

    pub fn has_patch(&self) -> bool {
        self.slots.patch.is_some()
    }

    pub fn result(&self) -> i64 {
        self.result
    }
}

/// Index of a plugin within the registry.
pub type PluginId = usize;

/// All loaded plugins, keyed by canonical path.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Plugin>,
    by_path: BTreeMap<PathBuf, PluginId>,
    notify: bool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Open a plugin by basename, appending `.so` when absent.  Opening the
    /// same canonical path twice returns the original record.
    pub fn open(&mut self, basename: &str) -> Result<PluginId> {
        let mut filename = basename.to_string();
        if !filename.ends_with(".so") {
            filename.push_str(".so");
        }
        let path = std::fs::canonicalize(Path::new(&filename)).map_err(|e| {
            Error::Plugin(format!("failed to create path for plugin \"{basename}\"; {e}"))
        })?;
        if let Some(&id) = self.by_path.get(&path) {
            return Ok(id);
        }

        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            Error::Plugin(format!("failed to load plugin \"{}\": {e}", path.display()))
        })?;
        let slots = unsafe {
            PluginSlots {
                init: lib.get(b"graft_plugin_init\0").map(|s| *s).ok(),
                instr: lib.get(b"graft_plugin_instr\0").map(|s| *s).ok(),
                matching: lib.get(b"graft_plugin_match\0").map(|s| *s).ok(),
                patch: lib.get(b"graft_plugin_patch\0").map(|s| *s).ok(),
                fini: lib.get(b"graft_plugin_fini\0").map(|s| *s).ok(),
            }
        };
        if slots.is_empty() {
            return Err(Error::Plugin(format!(
                "failed to load plugin \"{}\"; the shared object does not export any plugin API \
                 functions",
                path.display()
            )));
        }
        Ok(self.insert(path, slots, Some(lib)))
    }

    /// Register an in-process capability record (used by embedded plugins
    /// and tests; no shared object involved).
    pub fn register(&mut self, name: impl Into<PathBuf>, slots: PluginSlots) -> PluginId {
        self.insert(name.into(), slots, None)
    }

    fn insert(&mut self, path: PathBuf, slots: PluginSlots, lib: Option<Library>) -> PluginId {
        let id = self.plugins.len();
        self.notify = self.notify || slots.instr.is_some();
        self.plugins.push(Plugin {
            path: path.clone(),
            slots,
            _lib: lib,
            context: std::ptr::null_mut(),
            result: 0,
        });
        self.by_path.insert(path, id);
        id
    }

    pub fn get(&self, id: PluginId) -> &Plugin {
        &self.plugins[id]
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// True when any plugin wants per-instruction notifications.
    pub fn notify_mode(&self) -> bool {
        self.notify
    }

    fn ordered(&self) -> impl Iterator<Item = PluginId> + '_ {
        self.by_path.values().copied()
    }

    /// Call `init` on every plugin and store the returned contexts.
    pub fn init_all(&mut self, out: &mut MessageStream, elf: &ElfImage) {
        for id in self.by_path.values().copied().collect::<Vec<_>>() {
            let plugin = &mut self.plugins[id];
            if let Some(init) = plugin.slots.init {
                plugin.context = unsafe { init(out, elf) };
            }
        }
    }

    /// Notify every plugin of a disassembled instruction (pass one of
    /// notify mode).
    pub fn notify_all(
        &mut self,
        out: &mut MessageStream,
        elf: &ElfImage,
        insn: &Instruction,
        offset: i64,
    ) {
        for id in self.by_path.values().copied().collect::<Vec<_>>() {
            let plugin = &mut self.plugins[id];
            if let Some(instr) = plugin.slots.instr {
                unsafe { instr(out, elf, insn, offset, plugin.context) };
            }
        }
    }

    /// Refresh every plugin's memoized `match` value for this instruction.
    pub fn match_all(
        &mut self,
        out: &mut MessageStream,
        elf: &ElfImage,
        insn: &Instruction,
        offset: i64,
    ) {
        for id in self.by_path.values().copied().collect::<Vec<_>>() {
            let plugin = &mut self.plugins[id];
            if let Some(matching) = plugin.slots.matching {
                plugin.result = unsafe { matching(out, elf, insn, offset, plugin.context) };
            }
        }
    }

    /// Invoke a plugin's `patch` entry for a patch site.
    pub fn patch(
        &mut self,
        id: PluginId,
        out: &mut MessageStream,
        elf: &ElfImage,
        insn: &Instruction,
        offset: i64,
    ) {
        let plugin = &mut self.plugins[id];
        if let Some(patch) = plugin.slots.patch {
            unsafe { patch(out, elf, insn, offset, plugin.context) };
        }
    }

    /// Call `fini` on every plugin, in registry order.
    pub fn fini_all(&mut self, out: &mut MessageStream, elf: &ElfImage) {
        for id in self.ordered().collect::<Vec<_>>() {
            let plugin = &mut self.plugins[id];
            if let Some(fini) = plugin.slots.fini {
                unsafe { fini(out, elf, plugin.context) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    static MATCH_CALLS: AtomicI64 = AtomicI64::new(0);

    unsafe extern "C" fn fake_match(
        _out: *mut MessageStream,
        _elf: *const ElfImage,
        _insn: *const Instruction,
        offset: i64,
        _ctx: *mut c_void,
    ) -> i64 {
        MATCH_CALLS.fetch_add(1, Ordering::SeqCst);
        offset * 2
    }

    unsafe extern "C" fn fake_instr(
        _out: *mut MessageStream,
        _elf: *const ElfImage,
        _insn: *const Instruction,
        _offset: i64,
        _ctx: *mut c_void,
    ) {
    }

    #[test]
    fn test_register_and_notify_mode() {
        let mut registry = PluginRegistry::new();
        assert!(!registry.notify_mode());
        let id = registry.register(
            "counter.so",
            PluginSlots {
                matching: Some(fake_match),
                ..PluginSlots::default()
            },
        );
        assert!(!registry.notify_mode());
        assert!(registry.get(id).has_match());
        assert!(!registry.get(id).has_patch());

        registry.register(
            "notifier.so",
            PluginSlots {
                instr: Some(fake_instr),
                ..PluginSlots::default()
            },
        );
        assert!(registry.notify_mode());
    }

    #[test]
    fn test_match_result_is_memoized() {
        let mut registry = PluginRegistry::new();
        let id = registry.register(
            "memo.so",
            PluginSlots {
                matching: Some(fake_match),
                ..PluginSlots::default()
            },
        );
        let mut out = MessageStream::sink();
        let elf = std::ptr::null::<ElfImage>();
        let insn = Instruction::default();
        // Safety shim for the test: match_all only passes pointers through.
        let plugin = &mut registry.plugins[id];
        plugin.result = unsafe {
            (plugin.slots.matching.unwrap())(&mut out, elf, &insn, 21, std::ptr::null_mut())
        };
        assert_eq!(registry.get(id).result(), 42);
    }

    #[test]
    fn test_open_missing_plugin_fails() {
        let mut registry = PluginRegistry::new();
        assert!(registry.open("no_such_plugin_xyz").is_err());
    }
}
