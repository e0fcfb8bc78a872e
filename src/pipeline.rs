// Thu Jan 15 2026 - Alex

use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use log::warn;

use crate::backend::Backend;
use crate::config::{BinaryMode, Config, OutputFormat};
use crate::elf::{is_library_filename, position_to_addr, ElfImage, Lookup};
use crate::error::{FrontendError, Result};
use crate::insn::{Decoder, Instruction};
use crate::matcher::Evaluator;
use crate::metadata::build_metadata;
use crate::plugins::PluginRegistry;
use crate::rules::ast::{Action, ActionKind};

/// The range reachable by an 8-bit signed jump displacement, plus two
/// bytes of jump encoding and the maximum instruction length.
pub const SHORT_JUMP_WINDOW: i64 = i8::MAX as i64 + 2 + 15;

/// Whether two virtual addresses are within short-jump reach of each
/// other.
pub fn within_short_jump_window(a: u64, b: u64) -> bool {
    (a as i64 - b as i64).abs() <= SHORT_JUMP_WINDOW
}

/// Base address for stacking call-target ELF files.
const FILE_BASE_ADDR: u64 = 0x70000000;

/// Packed per-instruction state: the only per-instruction data kept in
/// memory across passes.
///
/// Layout: offset in bits 0..48, size 48..52, emitted 52, patch 53,
/// action index 54..64.
#[derive(Debug, Clone, Copy)]
pub struct Location(u64);

impl Location {
    pub fn new(offset: u64, size: u8, patch: bool, action: u16) -> Self {
        let mut bits = offset & 0x0000_ffff_ffff_ffff;
        bits |= ((size & 0xf) as u64) << 48;
        bits |= (patch as u64) << 53;
        bits |= ((action & 0x3ff) as u64) << 54;
        Location(bits)
    }

    pub fn offset(&self) -> u64 {
        self.0 & 0x0000_ffff_ffff_ffff
    }

    pub fn size(&self) -> u8 {
        ((self.0 >> 48) & 0xf) as u8
    }

    pub fn emitted(&self) -> bool {
        (self.0 >> 52) & 1 != 0
    }

    pub fn set_emitted(&mut self) {
        self.0 |= 1 << 52;
    }

    pub fn patch(&self) -> bool {
        (self.0 >> 53) & 1 != 0
    }

    pub fn action(&self) -> u16 {
        ((self.0 >> 54) & 0x3ff) as u16
    }
}

/// The rewrite pipeline: preflight, disassembly passes, reverse
/// emission, finalize.
pub struct Pipeline {
    config: Config,
    elf: ElfImage,
    actions: Vec<Action>,
    registry: PluginRegistry,
    evaluator: Evaluator,
    decoder: Decoder,
    backend: Backend,
    call_targets: HashMap<String, Rc<ElfImage>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        elf: ElfImage,
        actions: Vec<Action>,
        registry: PluginRegistry,
        detail: bool,
    ) -> Result<Self> {
        let backend = if config.format == OutputFormat::Json {
            Backend::json_sink(&config.output)?
        } else {
            Backend::spawn(&config.backend)?
        };
        Self::with_backend(config, elf, actions, registry, detail, backend)
    }

    pub fn with_backend(
        config: Config,
        elf: ElfImage,
        actions: Vec<Action>,
        registry: PluginRegistry,
        detail: bool,
        backend: Backend,
    ) -> Result<Self> {
        let decoder = Decoder::new(config.syntax, detail)?;
        Ok(Self {
            config,
            elf,
            actions,
            registry,
            evaluator: Evaluator::new(),
            decoder,
            backend,
            call_targets: HashMap::new(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        self.preflight()?;
        let (text_addr, text_offset, text_size) = self.text_window()?;
        let mut locs = self.first_pass(text_addr, text_offset, text_size)?;
        if self.registry.wants_notify() {
            self.second_pass(text_addr, text_offset, &mut locs)?;
        }
        self.reverse_emit(text_addr, text_offset, &mut locs)?;
        self.finalize()
    }

    fn mode(&self) -> BinaryMode {
        if self.config.executable {
            BinaryMode::Exe
        } else if self.config.shared {
            BinaryMode::Dso
        } else if self.elf.is_dso() && is_library_filename(&self.config.input) {
            warn!(
                "treating \"{}\" as a shared library (matched the \
                 lib*.so[.VERSION] filename form)",
                self.config.input.display()
            );
            BinaryMode::Dso
        } else {
            BinaryMode::Exe
        }
    }

    fn preflight(&mut self) -> Result<()> {
        let mode = self.mode();
        self.backend.send_binary(mode, &self.config.input)?;

        let options = self.config.collected_backend_options();
        if !options.is_empty() {
            self.backend.send_options(&options)?;
        }
        for trap in &self.config.traps {
            let argv = vec!["--trap".to_string(), trap.to_string()];
            self.backend.send_options(&argv)?;
        }

        self.registry
            .init_all(self.backend.raw_fd(), &self.config.input)?;

        self.send_trampolines()
    }

    /// One trampoline definition per action flavor present, plus one
    /// ELF-file registration per distinct call-target binary.
    fn send_trampolines(&mut self) -> Result<()> {
        let mut have_print = false;
        let mut have_passthru = false;
        let mut have_trap = false;
        let mut have_exit: BTreeSet<i32> = BTreeSet::new();
        let mut have_call: HashSet<String> = HashSet::new();
        let mut file_addr = FILE_BASE_ADDR;

        for i in 0..self.actions.len() {
            let action = self.actions[i].clone();
            match action.kind {
                ActionKind::Print => have_print = true,
                ActionKind::Passthru => have_passthru = true,
                ActionKind::Trap => have_trap = true,
                ActionKind::Exit => {
                    if have_exit.insert(action.status) {
                        self.backend.send_exit_trampoline(action.status)?;
                    }
                }
                ActionKind::Call => {
                    let filename =
                        action.filename.clone().unwrap_or_default();
                    let target = match self.call_targets.get(&filename) {
                        Some(target) => target.clone(),
                        None => {
                            let target =
                                Rc::new(ElfImage::load(&filename, file_addr)?);
                            self.backend.send_elf_file(&target)?;
                            file_addr = target.next_base();
                            self.call_targets
                                .insert(filename.clone(), target.clone());
                            target
                        }
                    };
                    if have_call.insert(action.name.clone()) {
                        let symbol =
                            action.symbol.clone().unwrap_or_default();
                        let entry = match target.lookup(&symbol) {
                            Lookup::Addr(addr) => addr,
                            _ => {
                                return Err(FrontendError::Semantic(format!(
                                    "failed to find symbol \"{}\" in \
                                     \"{}\"",
                                    symbol, filename
                                )))
                            }
                        };
                        self.backend.send_call_trampoline(&action, entry)?;
                    }
                }
                ActionKind::Plugin => {}
            }
        }
        if have_passthru {
            self.backend.send_passthru_trampoline()?;
        }
        if have_print {
            self.backend.send_print_trampoline()?;
        }
        if have_trap {
            self.backend.send_trap_trampoline()?;
        }
        Ok(())
    }

    /// The disassembly window: the `.text` section, possibly narrowed by
    /// `--start`/`--end`.
    fn text_window(&self) -> Result<(u64, u64, u64)> {
        let text = self.elf.text_section()?;
        let mut addr = text.addr as i64;
        let mut offset = text.offset as i64;
        let mut size = text.size as i64;

        if let Some(start) = &self.config.start {
            let start_addr =
                position_to_addr(&self.elf, "--start", start)? as i64;
            let delta = start_addr - addr;
            offset += delta;
            addr += delta;
            size -= delta;
        }
        if let Some(end) = &self.config.end {
            let end_addr = position_to_addr(&self.elf, "--end", end)? as i64;
            let delta = (addr + size) - end_addr;
            size -= delta;
        }
        if addr < 0 || offset < 0 || size < 0 {
            return Err(FrontendError::Semantic(
                "the `--start'/`--end' window lies outside the \".text\" \
                 section"
                    .to_string(),
            ));
        }
        let end = (offset + size) as usize;
        if end > self.elf.data().len() {
            return Err(FrontendError::Elf(
                "\".text\" section extends past the end of the file"
                    .to_string(),
            ));
        }
        Ok((addr as u64, offset as u64, size as u64))
    }

    fn decode_at(
        &self,
        text_offset: u64,
        text_addr: u64,
        offset: u64,
        size: u8,
    ) -> Result<Instruction> {
        let start = (text_offset + offset) as usize;
        let end = start + size as usize;
        let code = &self.elf.data()[start..end];
        let insn = self
            .decoder
            .decode_one(code, text_addr + offset)?
            .filter(|insn| !insn.data)
            .ok_or_else(|| {
                FrontendError::Decoder(format!(
                    "failed to disassemble instruction at address 0x{:x}",
                    text_addr + offset
                ))
            })?;
        Ok(insn)
    }

    /// Linear decode across the text window, selecting at most one
    /// action per instruction.
    fn first_pass(
        &mut self,
        text_addr: u64,
        text_offset: u64,
        text_size: u64,
    ) -> Result<Vec<Location>> {
        let start = text_offset as usize;
        let end = start + text_size as usize;
        let data = self.elf.data();
        let code = &data[start..end];

        let mut locs = Vec::new();
        let mut sync_skip = 0usize;
        let mut failed = false;
        let mut stream = crate::insn::InsnStream::new(&self.decoder, code, text_addr);
        while let Some(insn) = stream.next() {
            let insn = insn?;
            if sync_skip > 0 {
                sync_skip -= 1;
                continue;
            }
            if insn.data {
                warn!(
                    "failed to disassemble ({}) at address 0x{:x}",
                    insn.assembly(),
                    insn.address
                );
                failed = true;
                sync_skip = self.config.sync.unwrap_or(0);
                continue;
            }

            let offset = insn.address - text_addr;
            let mut idx = None;
            if self.registry.wants_notify() {
                self.registry
                    .notify_all(self.backend.raw_fd(), &insn, offset);
            } else {
                self.registry
                    .match_all(self.backend.raw_fd(), &insn, offset);
                idx = self.evaluator.select(
                    &self.actions,
                    &insn,
                    offset as i64,
                )?;
            }
            locs.push(Location::new(
                offset,
                insn.size,
                idx.is_some(),
                idx.unwrap_or(0) as u16,
            ));
        }
        let consumed = stream.consumed();
        if consumed != code.len() {
            return Err(FrontendError::Decoder(format!(
                "failed to disassemble the \".text\" section \
                 0x{:x}..0x{:x}; could only disassemble the range \
                 0x{:x}..0x{:x}",
                text_addr,
                text_addr + text_size,
                text_addr,
                text_addr + consumed as u64
            )));
        }
        if failed {
            if self.config.sync.is_none() {
                return Err(FrontendError::Decoder(format!(
                    "failed to disassemble the .text section of \"{}\"; \
                     this may be caused by (1) data in the .text section, \
                     or (2) a decoder failure",
                    self.config.input.display()
                )));
            }
            warn!(
                "failed to disassemble the .text section of \"{}\"; the \
                 rewritten binary may be corrupt",
                self.config.input.display()
            );
        }
        Ok(locs)
    }

    /// Re-decode each recorded location and re-evaluate the rules; used
    /// when the first pass was consumed by plugin notifications.
    fn second_pass(
        &mut self,
        text_addr: u64,
        text_offset: u64,
        locs: &mut [Location],
    ) -> Result<()> {
        for i in 0..locs.len() {
            let loc = locs[i];
            let insn = self.decode_at(
                text_offset,
                text_addr,
                loc.offset(),
                loc.size(),
            )?;
            self.registry.match_all(
                self.backend.raw_fd(),
                &insn,
                loc.offset(),
            );
            let idx = self.evaluator.select(
                &self.actions,
                &insn,
                loc.offset() as i64,
            )?;
            if let Some(idx) = idx {
                locs[i] =
                    Location::new(loc.offset(), loc.size(), true, idx as u16);
            }
        }
        Ok(())
    }

    /// Define the instruction to the backend when it lies within the
    /// short-jump window of `addr`.  Idempotent via the emitted bit.
    fn send_instruction_if_near(
        &mut self,
        loc: &mut Location,
        addr: u64,
        text_addr: u64,
        text_offset: u64,
    ) -> Result<bool> {
        let loc_va = text_addr + loc.offset();
        if !within_short_jump_window(loc_va, addr) {
            return Ok(false);
        }
        if loc.emitted() {
            return Ok(true);
        }
        loc.set_emitted();
        self.backend.send_instruction(
            loc_va,
            loc.size() as u64,
            text_offset + loc.offset(),
        )?;
        Ok(true)
    }

    /// Emit instruction definitions and patches in reverse order.  The
    /// backend assigns identifiers monotonically and patches reference
    /// earlier instruction identifiers.
    fn reverse_emit(
        &mut self,
        text_addr: u64,
        text_offset: u64,
        locs: &mut Vec<Location>,
    ) -> Result<()> {
        let count = locs.len();
        let mut id: i64 = -1;
        for i in (0..count).rev() {
            let loc = locs[i];
            if !loc.patch() {
                continue;
            }
            let addr = text_addr + loc.offset();
            let insn = self.decode_at(
                text_offset,
                text_addr,
                loc.offset(),
                loc.size(),
            )?;

            for j in (0..=i).rev() {
                let mut neighbor = locs[j];
                let near = self.send_instruction_if_near(
                    &mut neighbor,
                    addr,
                    text_addr,
                    text_offset,
                )?;
                locs[j] = neighbor;
                if !near {
                    break;
                }
            }
            for j in i + 1..count {
                let mut neighbor = locs[j];
                let near = self.send_instruction_if_near(
                    &mut neighbor,
                    addr,
                    text_addr,
                    text_offset,
                )?;
                locs[j] = neighbor;
                if !near {
                    break;
                }
            }

            id += 1;
            let action = self.actions[loc.action() as usize].clone();
            if action.kind == ActionKind::Plugin {
                if let Some(plugin) = &action.plugin {
                    plugin.borrow_mut().patch_instr(
                        self.backend.raw_fd(),
                        &insn,
                        text_offset + loc.offset(),
                    );
                }
            } else {
                let target = action
                    .filename
                    .as_deref()
                    .and_then(|f| self.call_targets.get(f))
                    .cloned();
                let metadata = build_metadata(
                    &action,
                    &insn,
                    loc.offset() as i64,
                    id,
                    &self.elf,
                    target.as_deref(),
                    &mut self.evaluator,
                )?;
                self.backend.send_patch(
                    &action.name,
                    text_offset + loc.offset(),
                    metadata,
                )?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.registry.fini_all(self.backend.raw_fd());
        let (output, format) = self.config.emit_target();
        self.backend.send_emit(&output, format)?;
        self.backend.wait()
    }
}
