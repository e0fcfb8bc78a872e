// Thu Jan 15 2026 - Alex

use serde_json::{json, Value};

use crate::backend::argument_kind_name;
use crate::csv::Cell;
use crate::elf::{ElfImage, Lookup};
use crate::error::{FrontendError, Result};
use crate::insn::{
    Instruction, MemRef, OperandKind, Register, ACCESS_READ, ACCESS_WRITE,
};
use crate::matcher::{get_operand, kind_filter, Evaluator};
use crate::rules::ast::{
    Action, Argument, ArgumentKind, MatchField, MatchKind, MatchValue,
    MemOp,
};

fn match_value_to_json(value: MatchValue) -> Value {
    match value {
        MatchValue::Undefined => Value::Null,
        MatchValue::Nil => Value::Null,
        MatchValue::Integer(i) => json!(i),
        MatchValue::Operand(op) => json!(format!("{:?}", op).to_lowercase()),
        MatchValue::Access(a) => json!(match a {
            a if a == ACCESS_READ | ACCESS_WRITE => "rw",
            a if a == ACCESS_READ => "r",
            a if a == ACCESS_WRITE => "w",
            _ => "none",
        }),
        MatchValue::Register(reg) => json!(reg.name()),
        MatchValue::Memory => json!("mem"),
        MatchValue::String(s) => json!(s),
    }
}

fn mem_ref_to_json(mem: &MemRef) -> Value {
    json!({
        "segment": if mem.segment == Register::None {
            Value::Null
        } else {
            json!(mem.segment.name())
        },
        "base": if mem.base == Register::None {
            Value::Null
        } else {
            json!(mem.base.name())
        },
        "index": if mem.index == Register::None {
            Value::Null
        } else {
            json!(mem.index.name())
        },
        "scale": mem.scale,
        "disp": mem.disp,
    })
}

fn mem_op_to_json(memop: &MemOp) -> Value {
    json!({
        "size": memop.size,
        "segment": if memop.segment == Register::None {
            Value::Null
        } else {
            json!(memop.segment.name())
        },
        "base": if memop.base == Register::None {
            Value::Null
        } else {
            json!(memop.base.name())
        },
        "index": if memop.index == Register::None {
            Value::Null
        } else {
            json!(memop.index.name())
        },
        "scale": memop.scale,
        "disp": memop.disp,
    })
}

fn field_name(field: MatchField) -> &'static str {
    match field {
        MatchField::None => "none",
        MatchField::Type => "type",
        MatchField::Access => "access",
        MatchField::Size => "size",
        MatchField::Seg => "segment",
        MatchField::Displ => "displacement",
        MatchField::Base => "base",
        MatchField::Index => "index",
        MatchField::Scale => "scale",
    }
}

/// The static branch/call target, when the instruction encodes one.
fn static_target(insn: &Instruction) -> Option<i64> {
    if !insn.is_call && !insn.is_jump {
        return None;
    }
    insn.operands.iter().find_map(|op| match op.kind {
        OperandKind::Imm(imm) => Some(imm),
        _ => None,
    })
}

fn operand_projection(
    arg: &Argument,
    kind: MatchKind,
    insn: &Instruction,
    offset: i64,
    evaluator: &mut Evaluator,
) -> Value {
    // Pointer-pass: the backend receives a reference to the operand
    // field rather than its current value.
    if arg.ptr {
        return json!({
            "ptr": true,
            "index": arg.value,
            "field": field_name(arg.field),
        });
    }
    if arg.field == MatchField::None {
        let (filter, access) = kind_filter(kind);
        if let Some(op) = get_operand(insn, arg.value, filter, access) {
            if let OperandKind::Mem(mem) = op.kind {
                return mem_ref_to_json(&mem);
            }
        }
    }
    let value = evaluator.extract(
        kind,
        arg.value as i8,
        arg.field,
        insn,
        offset,
        0,
    );
    match_value_to_json(value)
}

fn user_csv_value(
    arg: &Argument,
    action: &Action,
    insn: &Instruction,
    offset: i64,
    evaluator: &mut Evaluator,
) -> Result<Value> {
    let basename = arg.name.as_deref().unwrap_or("");
    let mut record = None;
    evaluator.eval(
        &action.matching,
        insn,
        offset,
        Some(basename),
        &mut record,
    )?;
    let record = match record {
        Some(record) => record,
        None => return Ok(Value::Null),
    };
    let column = arg.value;
    if column < 0 || column as usize >= record.len() {
        return Ok(Value::Null);
    }
    Ok(match &record[column as usize] {
        Cell::Integer(i) => json!(i),
        Cell::Bool(b) => json!(*b as i64),
        Cell::Str(s) => json!(s),
    })
}

/// Assemble the per-site argument metadata for a call action.  The
/// argument count is bounded at parse time (`MAX_ARGNO`).
pub fn build_metadata(
    action: &Action,
    insn: &Instruction,
    offset: i64,
    id: i64,
    input_elf: &ElfImage,
    target_elf: Option<&ElfImage>,
    evaluator: &mut Evaluator,
) -> Result<Value> {
    let mut entries: Vec<Value> = Vec::with_capacity(action.args.len());
    for arg in &action.args {
        let mut entry = json!({
            "kind": argument_kind_name(arg.kind),
            "duplicate": arg.duplicate,
        });
        let value = match arg.kind {
            ArgumentKind::Asm => json!(insn.assembly()),
            ArgumentKind::AsmLen => json!(insn.assembly().len()),
            ArgumentKind::AsmSize => json!(insn.assembly().len() + 1),
            ArgumentKind::Addr => json!(insn.address),
            ArgumentKind::Base => json!(input_elf.base()),
            ArgumentKind::Id => json!(id),
            ArgumentKind::Instr => json!(insn.bytes),
            ArgumentKind::InstrSize => json!(insn.size),
            ArgumentKind::Next => json!(insn.end_address()),
            ArgumentKind::Offset => json!(offset),
            ArgumentKind::Random => json!(evaluator.next_random()),
            ArgumentKind::StaticAddr => json!(insn.address),
            ArgumentKind::State => Value::Null,
            ArgumentKind::Trampoline => Value::Null,
            ArgumentKind::Target => match static_target(insn) {
                Some(target) => json!(target),
                None => Value::Null,
            },
            ArgumentKind::Register => {
                entry["ptr"] = json!(arg.ptr);
                json!(arg.reg.name())
            }
            ArgumentKind::Integer => json!(arg.value),
            ArgumentKind::MemOp => mem_op_to_json(&arg.memop),
            ArgumentKind::Symbol => {
                let name = arg.name.as_deref().unwrap_or("");
                let elf = target_elf.ok_or_else(|| {
                    FrontendError::Semantic(format!(
                        "symbol argument \"{}\" requires a call target file",
                        name
                    ))
                })?;
                match elf.lookup(name) {
                    Lookup::Addr(addr) => {
                        entry["ptr"] = json!(true);
                        json!(addr)
                    }
                    _ => {
                        return Err(FrontendError::Semantic(format!(
                            "undefined symbol \"{}\" referenced by call \
                             argument",
                            name
                        )))
                    }
                }
            }
            ArgumentKind::User => {
                entry["ptr"] = json!(arg.ptr);
                user_csv_value(arg, action, insn, offset, evaluator)?
            }
            ArgumentKind::Op => {
                operand_projection(arg, MatchKind::Op, insn, offset, evaluator)
            }
            ArgumentKind::Src => {
                operand_projection(arg, MatchKind::Src, insn, offset, evaluator)
            }
            ArgumentKind::Dst => {
                operand_projection(arg, MatchKind::Dst, insn, offset, evaluator)
            }
            ArgumentKind::Imm => {
                operand_projection(arg, MatchKind::Imm, insn, offset, evaluator)
            }
            ArgumentKind::Reg => {
                operand_projection(arg, MatchKind::Reg, insn, offset, evaluator)
            }
            ArgumentKind::Mem => {
                operand_projection(arg, MatchKind::Mem, insn, offset, evaluator)
            }
        };
        entry["value"] = value;
        entries.push(entry);
    }
    Ok(Value::Array(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{Operand, ACCESS_READ};
    use crate::rules::ast::{
        ActionKind, CallPosition, MatchCmp, MatchExpr, MatchTest,
        TestPayload,
    };
    use std::collections::BTreeSet;

    fn insn_with_mem() -> Instruction {
        Instruction {
            address: 0x401000,
            size: 4,
            bytes: vec![0x48, 0x8b, 0x43, 0x08],
            mnemonic: "mov".to_string(),
            op_str: "0x8(%rbx), %rax".to_string(),
            operands: vec![
                Operand {
                    kind: OperandKind::Mem(MemRef {
                        segment: Register::None,
                        base: Register::Rbx,
                        index: Register::None,
                        scale: 1,
                        disp: 8,
                    }),
                    size: 8,
                    access: ACCESS_READ,
                },
                Operand {
                    kind: OperandKind::Reg(Register::Rax),
                    size: 8,
                    access: ACCESS_WRITE,
                },
            ],
            is_call: false,
            is_jump: false,
            is_ret: false,
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            lea_or_nop: false,
            data: false,
        }
    }

    fn call_action(args: Vec<Argument>) -> Action {
        Action {
            text: "call hook(...)@libhook.so".to_string(),
            matching: MatchExpr::Test(MatchTest::new(
                MatchKind::True,
                -1,
                MatchField::None,
                MatchCmp::NeqZero,
            )),
            kind: ActionKind::Call,
            name: "call_clean_before_hook_libhook.so".to_string(),
            filename: Some("libhook.so".to_string()),
            symbol: Some("hook".to_string()),
            plugin: None,
            args,
            clean: true,
            call: CallPosition::Before,
            status: 0,
        }
    }

    #[test]
    fn test_addr_and_pointer_to_base() {
        let insn = insn_with_mem();
        let mut evaluator = Evaluator::new();
        let elf_stub = input_elf_stub();

        let mut base_arg = Argument::new(ArgumentKind::Op);
        base_arg.value = 0;
        base_arg.field = MatchField::Base;
        base_arg.ptr = true;
        let args = vec![Argument::new(ArgumentKind::Addr), base_arg];
        let action = call_action(args);

        let metadata = build_metadata(
            &action,
            &insn,
            0x1000,
            0,
            &elf_stub,
            None,
            &mut evaluator,
        )
        .unwrap();
        let entries = metadata.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["kind"], "addr");
        assert_eq!(entries[0]["value"], 0x401000);
        assert_eq!(entries[1]["value"]["ptr"], true);
        assert_eq!(entries[1]["value"]["field"], "base");
        assert_eq!(entries[1]["value"]["index"], 0);
    }

    #[test]
    fn test_mem_operand_value() {
        let insn = insn_with_mem();
        let mut evaluator = Evaluator::new();
        let elf_stub = input_elf_stub();

        let mut mem_arg = Argument::new(ArgumentKind::Mem);
        mem_arg.value = 0;
        let action = call_action(vec![mem_arg]);
        let metadata = build_metadata(
            &action,
            &insn,
            0,
            0,
            &elf_stub,
            None,
            &mut evaluator,
        )
        .unwrap();
        let value = &metadata.as_array().unwrap()[0]["value"];
        assert_eq!(value["base"], "rbx");
        assert_eq!(value["disp"], 8);
        assert_eq!(value["index"], Value::Null);
    }

    #[test]
    fn test_duplicate_flag_carried() {
        let insn = insn_with_mem();
        let mut evaluator = Evaluator::new();
        let elf_stub = input_elf_stub();

        let first = Argument::new(ArgumentKind::Addr);
        let mut second = Argument::new(ArgumentKind::Addr);
        second.duplicate = true;
        let action = call_action(vec![first, second]);
        let metadata = build_metadata(
            &action,
            &insn,
            0,
            0,
            &elf_stub,
            None,
            &mut evaluator,
        )
        .unwrap();
        let entries = metadata.as_array().unwrap();
        assert_eq!(entries[0]["duplicate"], false);
        assert_eq!(entries[1]["duplicate"], true);
    }

    // A minimal ELF image for tests that never touch the file contents.
    fn input_elf_stub() -> ElfImage {
        // 64-bit little-endian ET_EXEC x86-64 header with no sections.
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        data[4] = 2; // ELFCLASS64
        data[5] = 1; // ELFDATA2LSB
        data[6] = 1; // EV_CURRENT
        data[16] = 2; // ET_EXEC
        data[18] = 62; // EM_X86_64
        data[20] = 1; // e_version
        data[52] = 64; // e_ehsize
        let dir = std::env::temp_dir().join("repatch-meta-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stub.elf");
        std::fs::write(&path, &data).unwrap();
        ElfImage::load(&path, 0).unwrap()
    }
}
