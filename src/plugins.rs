// Thu Jan 15 2026 - Alex

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use libloading::Library;

use crate::error::{FrontendError, Result};
use crate::insn::Instruction;

/// C-compatible view of a decoded instruction handed to plugin entry
/// points.  Pointers are valid only for the duration of the call.
#[repr(C)]
pub struct RawInstruction {
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub bytes: *const u8,
    pub mnemonic: *const c_char,
    pub op_str: *const c_char,
}

pub type PluginInitFn =
    unsafe extern "C" fn(out: c_int, binary: *const c_char) -> *mut c_void;
pub type PluginInstrFn =
    unsafe extern "C" fn(out: c_int, insn: *const RawInstruction, ctx: *mut c_void);
pub type PluginMatchFn = unsafe extern "C" fn(
    out: c_int,
    insn: *const RawInstruction,
    ctx: *mut c_void,
) -> isize;
pub type PluginPatchFn =
    unsafe extern "C" fn(out: c_int, insn: *const RawInstruction, ctx: *mut c_void);
pub type PluginFiniFn = unsafe extern "C" fn(out: c_int, ctx: *mut c_void);

const SYM_INIT: &[u8] = b"repatch_plugin_init_v1";
const SYM_INSTR: &[u8] = b"repatch_plugin_instr_v1";
const SYM_MATCH: &[u8] = b"repatch_plugin_match_v1";
const SYM_PATCH: &[u8] = b"repatch_plugin_patch_v1";
const SYM_FINI: &[u8] = b"repatch_plugin_fini_v1";

/// A loaded plugin.  Entry points are optional capabilities; the context
/// pointer is owned by the plugin from init until fini.
pub struct Plugin {
    pub path: PathBuf,
    context: *mut c_void,
    /// Most recent value returned by the match entry point.
    pub result: i64,
    init: Option<PluginInitFn>,
    instr: Option<PluginInstrFn>,
    match_fn: Option<PluginMatchFn>,
    patch: Option<PluginPatchFn>,
    fini: Option<PluginFiniFn>,
    _lib: Library,
}

pub type PluginHandle = Rc<RefCell<Plugin>>;

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("path", &self.path)
            .field("result", &self.result)
            .finish()
    }
}

impl Plugin {
    pub fn has_instr(&self) -> bool {
        self.instr.is_some()
    }

    pub fn has_match(&self) -> bool {
        self.match_fn.is_some()
    }

    pub fn has_patch(&self) -> bool {
        self.patch.is_some()
    }

    pub fn init(&mut self, out: c_int, binary: &Path) -> Result<()> {
        if let Some(init) = self.init {
            let path = CString::new(binary.to_string_lossy().as_bytes())
                .map_err(|_| {
                    FrontendError::Plugin(
                        "binary path contains a NUL byte".to_string(),
                    )
                })?;
            self.context = unsafe { init(out, path.as_ptr()) };
        }
        Ok(())
    }

    pub fn notify_instr(&mut self, out: c_int, insn: &Instruction, offset: u64) {
        if let Some(instr) = self.instr {
            with_raw_instruction(insn, offset, |raw| unsafe {
                instr(out, raw, self.context)
            });
        }
    }

    pub fn match_instr(&mut self, out: c_int, insn: &Instruction, offset: u64) {
        if let Some(match_fn) = self.match_fn {
            self.result = with_raw_instruction(insn, offset, |raw| unsafe {
                match_fn(out, raw, self.context) as i64
            });
        }
    }

    pub fn patch_instr(&mut self, out: c_int, insn: &Instruction, offset: u64) {
        if let Some(patch) = self.patch {
            with_raw_instruction(insn, offset, |raw| unsafe {
                patch(out, raw, self.context)
            });
        }
    }

    pub fn fini(&mut self, out: c_int) {
        if let Some(fini) = self.fini {
            unsafe { fini(out, self.context) };
        }
        self.context = std::ptr::null_mut();
    }
}

fn with_raw_instruction<T>(
    insn: &Instruction,
    offset: u64,
    f: impl FnOnce(*const RawInstruction) -> T,
) -> T {
    let mnemonic =
        CString::new(insn.mnemonic.as_str()).unwrap_or_default();
    let op_str = CString::new(insn.op_str.as_str()).unwrap_or_default();
    let raw = RawInstruction {
        address: insn.address,
        offset,
        size: insn.size as u64,
        bytes: insn.bytes.as_ptr(),
        mnemonic: mnemonic.as_ptr(),
        op_str: op_str.as_ptr(),
    };
    f(&raw)
}

/// Process-wide plugin registry, keyed by canonical path.  Plugins are
/// invoked in deterministic insertion order.
pub struct PluginRegistry {
    plugins: Vec<PluginHandle>,
    by_path: HashMap<PathBuf, usize>,
    notify: bool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            by_path: HashMap::new(),
            notify: false,
        }
    }

    /// Whether any loaded plugin subscribed to per-instruction
    /// notifications (forcing a second disassembly pass).
    pub fn wants_notify(&self) -> bool {
        self.notify
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Load a plugin, coalescing duplicates by canonical path.
    pub fn open(&mut self, basename: &str) -> Result<PluginHandle> {
        let mut filename = basename.to_string();
        if !filename.ends_with(".so") {
            filename.push_str(".so");
        }
        let pathname = std::fs::canonicalize(&filename).map_err(|e| {
            FrontendError::Plugin(format!(
                "failed to create path for plugin \"{}\": {}",
                basename, e
            ))
        })?;
        if let Some(&idx) = self.by_path.get(&pathname) {
            return Ok(self.plugins[idx].clone());
        }

        let lib = unsafe { Library::new(&pathname) }.map_err(|e| {
            FrontendError::Plugin(format!(
                "failed to load plugin \"{}\": {}",
                pathname.display(),
                e
            ))
        })?;
        let init = lookup::<PluginInitFn>(&lib, SYM_INIT);
        let instr = lookup::<PluginInstrFn>(&lib, SYM_INSTR);
        let match_fn = lookup::<PluginMatchFn>(&lib, SYM_MATCH);
        let patch = lookup::<PluginPatchFn>(&lib, SYM_PATCH);
        let fini = lookup::<PluginFiniFn>(&lib, SYM_FINI);
        if init.is_none()
            && instr.is_none()
            && match_fn.is_none()
            && patch.is_none()
            && fini.is_none()
        {
            return Err(FrontendError::Plugin(format!(
                "failed to load plugin \"{}\"; the shared object does not \
                 export any plugin API functions",
                pathname.display()
            )));
        }

        self.notify = self.notify || instr.is_some();
        let plugin = Rc::new(RefCell::new(Plugin {
            path: pathname.clone(),
            context: std::ptr::null_mut(),
            result: 0,
            init,
            instr,
            match_fn,
            patch,
            fini,
            _lib: lib,
        }));
        self.by_path.insert(pathname, self.plugins.len());
        self.plugins.push(plugin.clone());
        Ok(plugin)
    }

    pub fn init_all(&self, out: c_int, binary: &Path) -> Result<()> {
        for plugin in &self.plugins {
            plugin.borrow_mut().init(out, binary)?;
        }
        Ok(())
    }

    pub fn notify_all(&self, out: c_int, insn: &Instruction, offset: u64) {
        for plugin in &self.plugins {
            plugin.borrow_mut().notify_instr(out, insn, offset);
        }
    }

    /// Freshen every plugin's match result for this instruction.
    pub fn match_all(&self, out: c_int, insn: &Instruction, offset: u64) {
        for plugin in &self.plugins {
            plugin.borrow_mut().match_instr(out, insn, offset);
        }
    }

    pub fn fini_all(&self, out: c_int) {
        for plugin in &self.plugins {
            plugin.borrow_mut().fini(out);
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<T: Copy>(lib: &Library, name: &[u8]) -> Option<T> {
    unsafe { lib.get::<T>(name).ok().map(|sym| *sym) }
}
