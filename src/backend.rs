// Thu Jan 15 2026 - Alex

use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use serde_json::{json, Value};

use crate::config::{BinaryMode, OutputFormat};
use crate::elf::ElfImage;
use crate::error::{FrontendError, Result};
use crate::rules::ast::{Action, ArgumentKind, CallPosition};

/// Connection to the patching backend: either a spawned child process
/// fed over a pipe, or a JSON file sink capturing the raw message
/// stream.  All messages are line-delimited on a single writer.
pub struct Backend {
    out: BufWriter<Box<dyn Write>>,
    child: Option<Child>,
    fd: i32,
}

impl Backend {
    pub fn spawn(path: &Path) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                FrontendError::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to spawn backend \"{}\": {}",
                        path.display(),
                        e
                    ),
                ))
            })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            FrontendError::Io(std::io::Error::other(
                "failed to open pipe to backend",
            ))
        })?;
        let fd = stdin.as_raw_fd();
        Ok(Self {
            out: BufWriter::new(Box::new(stdin)),
            child: Some(child),
            fd,
        })
    }

    /// `--format json`: capture the message stream to a file, or stdout
    /// when the output is `-'.
    pub fn json_sink(output: &str) -> Result<Self> {
        if output == "-" {
            let stdout = std::io::stdout();
            let fd = stdout.as_raw_fd();
            return Ok(Self {
                out: BufWriter::new(Box::new(stdout)),
                child: None,
                fd,
            });
        }
        let mut filename = output.to_string();
        if !filename.ends_with(".json") {
            filename.push_str(".json");
        }
        let file = File::create(&filename).map_err(|e| {
            FrontendError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open output file \"{}\": {}", filename, e),
            ))
        })?;
        let fd = file.as_raw_fd();
        Ok(Self {
            out: BufWriter::new(Box::new(file)),
            child: None,
            fd,
        })
    }

    /// An in-memory sink, for tests.
    pub fn from_writer(writer: Box<dyn Write>) -> Self {
        Self {
            out: BufWriter::new(writer),
            child: None,
            fd: -1,
        }
    }

    /// Raw descriptor handed to plugin callbacks.
    pub fn raw_fd(&self) -> i32 {
        self.fd
    }

    fn send(&mut self, method: &str, params: Value) -> Result<()> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        serde_json::to_writer(&mut self.out, &message)
            .map_err(|e| FrontendError::Io(e.into()))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn send_binary(&mut self, mode: BinaryMode, path: &Path) -> Result<()> {
        self.send(
            "binary",
            json!({
                "filename": path.to_string_lossy(),
                "mode": mode.as_str(),
            }),
        )
    }

    pub fn send_options(&mut self, argv: &[String]) -> Result<()> {
        self.send("options", json!({ "argv": argv }))
    }

    /// Register a call-target ELF file at its assigned load address.
    pub fn send_elf_file(&mut self, elf: &ElfImage) -> Result<()> {
        self.send(
            "reserve",
            json!({
                "address": elf.base(),
                "length": elf.end() - elf.base(),
                "filename": elf.path().to_string_lossy(),
                "protection": "r-x",
                "absolute": true,
            }),
        )
    }

    pub fn send_passthru_trampoline(&mut self) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": "passthru",
                "template": ["$instr", "$break"],
            }),
        )
    }

    pub fn send_print_trampoline(&mut self) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": "print",
                "template": ["$print", "$instr", "$break"],
            }),
        )
    }

    pub fn send_trap_trampoline(&mut self) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": "trap",
                // int3
                "template": [204],
            }),
        )
    }

    pub fn send_exit_trampoline(&mut self, status: i32) -> Result<()> {
        self.send(
            "trampoline",
            json!({
                "name": format!("exit_{}", status),
                "template": ["$exit", status],
            }),
        )
    }

    pub fn send_call_trampoline(&mut self, action: &Action, entry: u64) -> Result<()> {
        let position = match action.call {
            CallPosition::Before => "before",
            CallPosition::After => "after",
            CallPosition::Replace => "replace",
            CallPosition::Conditional => "conditional",
            CallPosition::ConditionalJump => "conditional.jump",
        };
        let args: Vec<Value> = action
            .args
            .iter()
            .map(|arg| {
                json!({
                    "kind": argument_kind_name(arg.kind),
                    "ptr": arg.ptr,
                    "duplicate": arg.duplicate,
                })
            })
            .collect();
        self.send(
            "trampoline",
            json!({
                "name": action.name,
                "clean": action.clean,
                "position": position,
                "entry": entry,
                "args": args,
            }),
        )
    }

    pub fn send_instruction(
        &mut self,
        addr: u64,
        size: u64,
        offset: u64,
    ) -> Result<()> {
        self.send(
            "instruction",
            json!({
                "address": addr,
                "length": size,
                "offset": offset,
            }),
        )
    }

    pub fn send_patch(
        &mut self,
        trampoline: &str,
        offset: u64,
        metadata: Value,
    ) -> Result<()> {
        self.send(
            "patch",
            json!({
                "trampoline": trampoline,
                "offset": offset,
                "metadata": metadata,
            }),
        )
    }

    pub fn send_emit(&mut self, output: &str, format: OutputFormat) -> Result<()> {
        self.send(
            "emit",
            json!({
                "filename": output,
                "format": format.as_str(),
            }),
        )
    }

    /// Flush and reap the backend child, if any.
    pub fn wait(&mut self) -> Result<()> {
        self.out.flush()?;
        if let Some(mut child) = self.child.take() {
            drop(std::mem::replace(
                &mut self.out,
                BufWriter::new(Box::new(std::io::sink())),
            ));
            let status = child.wait()?;
            if !status.success() {
                return Err(FrontendError::Io(std::io::Error::other(
                    format!("backend exited with status {}", status),
                )));
            }
        }
        Ok(())
    }
}

pub fn argument_kind_name(kind: ArgumentKind) -> &'static str {
    match kind {
        ArgumentKind::Asm => "asm",
        ArgumentKind::AsmLen => "asm.len",
        ArgumentKind::AsmSize => "asm.size",
        ArgumentKind::Addr => "addr",
        ArgumentKind::Base => "base",
        ArgumentKind::Dst => "dst",
        ArgumentKind::Id => "id",
        ArgumentKind::Imm => "imm",
        ArgumentKind::Instr => "instr",
        ArgumentKind::InstrSize => "size",
        ArgumentKind::Mem => "mem",
        ArgumentKind::MemOp => "memop",
        ArgumentKind::Next => "next",
        ArgumentKind::Offset => "offset",
        ArgumentKind::Op => "op",
        ArgumentKind::Random => "random",
        ArgumentKind::Reg => "reg",
        ArgumentKind::Src => "src",
        ArgumentKind::State => "state",
        ArgumentKind::StaticAddr => "staticAddr",
        ArgumentKind::Target => "target",
        ArgumentKind::Trampoline => "trampoline",
        ArgumentKind::Register => "register",
        ArgumentKind::Integer => "integer",
        ArgumentKind::Symbol => "symbol",
        ArgumentKind::User => "user",
    }
}
