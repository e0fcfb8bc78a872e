// Wed Jan 14 2026 - Alex

use std::rc::Rc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::csv::Record;
use crate::error::{FrontendError, Result};
use crate::insn::{
    Access, Instruction, Operand, OperandKind, ACCESS_NONE, ACCESS_READ,
    ACCESS_WRITE,
};
use crate::rules::ast::{
    Action, MatchCmp, MatchExpr, MatchField, MatchKind, MatchTest, MatchValue,
    OpType, TestPayload,
};

/// Fixed seed so the emitted message stream is reproducible.
pub const RNG_SEED: u64 = 0xe9e9e9e9;

/// Select the operand class inspected by a test kind.
pub fn kind_filter(kind: MatchKind) -> (Option<OpType>, Access) {
    match kind {
        MatchKind::Src => (None, ACCESS_READ),
        MatchKind::Dst => (None, ACCESS_WRITE),
        MatchKind::Imm => (Some(OpType::Imm), ACCESS_READ | ACCESS_WRITE),
        MatchKind::Reg => (Some(OpType::Reg), ACCESS_READ | ACCESS_WRITE),
        MatchKind::Mem => (Some(OpType::Mem), ACCESS_READ | ACCESS_WRITE),
        _ => (None, ACCESS_READ | ACCESS_WRITE),
    }
}

fn op_type(op: &Operand) -> OpType {
    match op.kind {
        OperandKind::Imm(_) => OpType::Imm,
        OperandKind::Reg(_) => OpType::Reg,
        OperandKind::Mem(_) => OpType::Mem,
    }
}

/// Pick the `idx`-th operand of the selected class.  Immediates count as
/// readable regardless of their reported access.
pub fn get_operand(
    insn: &Instruction,
    idx: i64,
    filter: Option<OpType>,
    access: Access,
) -> Option<&Operand> {
    let mut remaining = idx;
    for op in &insn.operands {
        let type_ok = filter.map_or(true, |t| op_type(op) == t);
        let access_ok = (op.access & access) != 0
            || (op_type(op) == OpType::Imm && (access & ACCESS_READ) != 0);
        if type_ok && access_ok {
            if remaining == 0 {
                return Some(op);
            }
            remaining -= 1;
        }
    }
    None
}

pub fn count_operands(
    insn: &Instruction,
    filter: Option<OpType>,
    access: Access,
) -> i64 {
    insn.operands
        .iter()
        .filter(|op| {
            let type_ok = filter.map_or(true, |t| op_type(op) == t);
            let access_ok = (op.access & access) != 0
                || (op_type(op) == OpType::Imm && (access & ACCESS_READ) != 0);
            type_ok && access_ok
        })
        .count() as i64
}

/// Evaluates compiled match trees against extracted instruction facts.
/// Owns the process-wide RNG so `random' facts are reproducible.
pub struct Evaluator {
    rng: StdRng,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(RNG_SEED),
        }
    }

    pub fn next_random(&mut self) -> i64 {
        self.rng.gen_range(0..=i32::MAX as i64)
    }

    /// Build the typed fact for a `(kind, index, field)` projection.  Any
    /// ill-typed combination yields `Undefined`.
    pub fn extract(
        &mut self,
        kind: MatchKind,
        idx: i8,
        field: MatchField,
        insn: &Instruction,
        offset: i64,
        plugin_val: i64,
    ) -> MatchValue {
        let (filter, access) = kind_filter(kind);
        match kind {
            MatchKind::True => MatchValue::Integer(1),
            MatchKind::False => MatchValue::Integer(0),
            MatchKind::Address => MatchValue::Integer(insn.address as i64),
            MatchKind::Call => MatchValue::Integer(insn.is_call as i64),
            MatchKind::Jump => MatchValue::Integer(insn.is_jump as i64),
            MatchKind::Return => MatchValue::Integer(insn.is_ret as i64),
            MatchKind::Offset => MatchValue::Integer(offset),
            MatchKind::Plugin => MatchValue::Integer(plugin_val),
            MatchKind::Random => MatchValue::Integer(self.next_random()),
            MatchKind::Size => MatchValue::Integer(insn.size as i64),
            MatchKind::Op
            | MatchKind::Src
            | MatchKind::Dst
            | MatchKind::Imm
            | MatchKind::Reg
            | MatchKind::Mem => {
                if idx < 0 {
                    return match field {
                        MatchField::Size => MatchValue::Integer(
                            count_operands(insn, filter, access),
                        ),
                        _ => MatchValue::Undefined,
                    };
                }
                let op = match get_operand(insn, idx as i64, filter, access) {
                    Some(op) => op,
                    None => return MatchValue::Undefined,
                };
                match field {
                    MatchField::None => match op.kind {
                        OperandKind::Imm(imm) => MatchValue::Integer(imm),
                        OperandKind::Reg(reg) => MatchValue::Register(reg),
                        OperandKind::Mem(_) => MatchValue::Memory,
                    },
                    MatchField::Size => MatchValue::Integer(op.size as i64),
                    MatchField::Type => MatchValue::Operand(op_type(op)),
                    MatchField::Access => {
                        if let OperandKind::Imm(_) = op.kind {
                            return MatchValue::Access(ACCESS_READ);
                        }
                        let mut access = op.access;
                        if matches!(op.kind, OperandKind::Mem(_))
                            && insn.lea_or_nop
                        {
                            access = ACCESS_NONE;
                        }
                        MatchValue::Access(access)
                    }
                    MatchField::Seg => match op.kind {
                        OperandKind::Mem(mem) => {
                            if mem.segment == crate::insn::Register::None {
                                MatchValue::Nil
                            } else {
                                MatchValue::Register(mem.segment)
                            }
                        }
                        _ => MatchValue::Undefined,
                    },
                    MatchField::Displ => match op.kind {
                        OperandKind::Mem(mem) => MatchValue::Integer(mem.disp),
                        _ => MatchValue::Undefined,
                    },
                    MatchField::Base => match op.kind {
                        OperandKind::Mem(mem) => {
                            if mem.base == crate::insn::Register::None {
                                MatchValue::Nil
                            } else {
                                MatchValue::Register(mem.base)
                            }
                        }
                        _ => MatchValue::Undefined,
                    },
                    MatchField::Index => match op.kind {
                        OperandKind::Mem(mem) => {
                            if mem.index == crate::insn::Register::None {
                                MatchValue::Nil
                            } else {
                                MatchValue::Register(mem.index)
                            }
                        }
                        _ => MatchValue::Undefined,
                    },
                    MatchField::Scale => match op.kind {
                        OperandKind::Mem(mem) => {
                            MatchValue::Integer(mem.scale as i64)
                        }
                        _ => MatchValue::Undefined,
                    },
                }
            }
            _ => MatchValue::Undefined,
        }
    }

    /// Evaluate a match tree.  When `basename` is set, a successful `eq`
    /// against that CSV table surfaces the winning record; two distinct
    /// records for the same basename are a hard error.
    pub fn eval(
        &mut self,
        expr: &MatchExpr,
        insn: &Instruction,
        offset: i64,
        basename: Option<&str>,
        record: &mut Option<Rc<Record>>,
    ) -> Result<bool> {
        let test = match expr {
            MatchExpr::Not(child) => {
                let mut ignored = None;
                let pass = self.eval(child, insn, offset, None, &mut ignored)?;
                return Ok(!pass);
            }
            MatchExpr::And(lhs, rhs) => {
                if !self.eval(lhs, insn, offset, basename, record)? {
                    return Ok(false);
                }
                return self.eval(rhs, insn, offset, basename, record);
            }
            MatchExpr::Or(lhs, rhs) => {
                if self.eval(lhs, insn, offset, basename, record)? {
                    return Ok(true);
                }
                return self.eval(rhs, insn, offset, basename, record);
            }
            MatchExpr::Test(test) => test,
        };
        self.eval_test(test, insn, offset, basename, record)
    }

    fn eval_test(
        &mut self,
        test: &MatchTest,
        insn: &Instruction,
        offset: i64,
        basename: Option<&str>,
        record: &mut Option<Rc<Record>>,
    ) -> Result<bool> {
        match test.kind {
            MatchKind::Assembly | MatchKind::Mnemonic => {
                if test.cmp == MatchCmp::Defined {
                    return Ok(true);
                }
                let text = if test.kind == MatchKind::Assembly {
                    insn.assembly()
                } else {
                    insn.mnemonic.clone()
                };
                let pass = match &test.payload {
                    TestPayload::Regex(regex) => regex.is_match(&text),
                    _ => false,
                };
                Ok(if test.cmp == MatchCmp::Neq { !pass } else { pass })
            }
            MatchKind::Regs | MatchKind::Reads | MatchKind::Writes => {
                if test.cmp == MatchCmp::Defined {
                    return Ok(true);
                }
                let set = match &test.payload {
                    TestPayload::Registers(set) => set,
                    _ => return Ok(false),
                };
                let mut pass = false;
                if test.kind != MatchKind::Writes {
                    pass = insn.reads.iter().any(|reg| set.contains(reg));
                }
                if !pass && test.kind != MatchKind::Reads {
                    pass = insn.writes.iter().any(|reg| set.contains(reg));
                }
                Ok(pass)
            }
            _ => {
                let values = match &test.payload {
                    TestPayload::Values(values) => Some(values),
                    _ => None,
                };
                // Comparisons other than `defined' fail silently against
                // an empty value set.
                if !matches!(
                    test.cmp,
                    MatchCmp::EqZero | MatchCmp::NeqZero | MatchCmp::Defined
                ) && values.map_or(true, |v| v.is_empty())
                {
                    return Ok(false);
                }
                let plugin_val = test
                    .plugin
                    .as_ref()
                    .map(|p| p.borrow().result)
                    .unwrap_or(0);
                let x = self.extract(
                    test.kind, test.idx, test.field, insn, offset, plugin_val,
                );
                let mut pass = match test.cmp {
                    MatchCmp::Defined => true,
                    MatchCmp::EqZero => x == MatchValue::Integer(0),
                    MatchCmp::NeqZero => {
                        matches!(x, MatchValue::Integer(i) if i != 0)
                    }
                    MatchCmp::Eq => {
                        values.map_or(false, |v| v.contains_key(&x))
                    }
                    MatchCmp::Neq => values.map_or(false, |v| {
                        // Documented quirk: `neq' against a multi-element
                        // set is always true.
                        if v.len() == 1 {
                            !v.contains_key(&x)
                        } else {
                            true
                        }
                    }),
                    MatchCmp::Lt => values
                        .and_then(|v| v.keys().next_back())
                        .map_or(false, |max| x < *max),
                    MatchCmp::Leq => values
                        .and_then(|v| v.keys().next_back())
                        .map_or(false, |max| x <= *max),
                    MatchCmp::Gt => values
                        .and_then(|v| v.keys().next())
                        .map_or(false, |min| x > *min),
                    MatchCmp::Geq => values
                        .and_then(|v| v.keys().next())
                        .map_or(false, |min| x >= *min),
                    MatchCmp::In => false,
                };
                if x.is_undefined() {
                    pass = false;
                }

                if pass
                    && test.cmp == MatchCmp::Eq
                    && basename.is_some()
                    && test.basename.as_deref() == basename
                {
                    if let Some(values) = values {
                        if let Some(entry) = values.get(&x) {
                            if let Some(prev) = record.as_ref() {
                                let same = entry
                                    .as_ref()
                                    .map_or(false, |e| Rc::ptr_eq(prev, e));
                                if !same {
                                    return Err(FrontendError::Semantic(
                                        format!(
                                            "failed to lookup value from \
                                             file \"{}.csv\"; matching is \
                                             ambiguous",
                                            basename.unwrap_or("")
                                        ),
                                    ));
                                }
                            }
                            *record = entry.clone();
                        }
                    }
                }
                Ok(pass)
            }
        }
    }

    /// Evaluate without CSV record surfacing.
    pub fn matches(
        &mut self,
        expr: &MatchExpr,
        insn: &Instruction,
        offset: i64,
    ) -> Result<bool> {
        let mut record = None;
        self.eval(expr, insn, offset, None, &mut record)
    }

    /// First matching action in declaration order, if any.
    pub fn select(
        &mut self,
        actions: &[Action],
        insn: &Instruction,
        offset: i64,
    ) -> Result<Option<usize>> {
        for (idx, action) in actions.iter().enumerate() {
            if self.matches(&action.matching, insn, offset)? {
                debug!(
                    "0x{:x} [{}]: action {}",
                    insn.address,
                    insn.assembly(),
                    action.text
                );
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::registers::Register;
    use crate::insn::MemRef;
    use crate::rules::ast::{ActionKind, CallPosition, ValueIndex};
    use regex::Regex;
    use std::collections::BTreeSet;

    fn bare_insn(mnemonic: &str, op_str: &str) -> Instruction {
        Instruction {
            address: 0x401000,
            size: 3,
            bytes: vec![0x90, 0x90, 0x90],
            mnemonic: mnemonic.to_string(),
            op_str: op_str.to_string(),
            operands: Vec::new(),
            is_call: false,
            is_jump: false,
            is_ret: false,
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            lea_or_nop: false,
            data: false,
        }
    }

    fn reg_op(reg: Register, access: Access) -> Operand {
        Operand {
            kind: OperandKind::Reg(reg),
            size: 8,
            access,
        }
    }

    fn imm_op(value: i64) -> Operand {
        Operand {
            kind: OperandKind::Imm(value),
            size: 8,
            access: ACCESS_READ,
        }
    }

    fn mem_op(base: Register, disp: i64) -> Operand {
        Operand {
            kind: OperandKind::Mem(MemRef {
                segment: Register::None,
                base,
                index: Register::None,
                scale: 1,
                disp,
            }),
            size: 8,
            access: ACCESS_READ,
        }
    }

    fn mov_reg_reg() -> Instruction {
        // mov rbx -> rax
        let mut insn = bare_insn("mov", "rbx, rax");
        insn.operands = vec![
            reg_op(Register::Rbx, ACCESS_READ),
            reg_op(Register::Rax, ACCESS_WRITE),
        ];
        insn.reads.insert(Register::Rbx);
        insn.writes.insert(Register::Rax);
        insn
    }

    fn values_of(values: &[MatchValue]) -> TestPayload {
        let mut index = ValueIndex::new();
        for value in values {
            index.insert(value.clone(), None);
        }
        TestPayload::Values(index)
    }

    fn test_leaf(
        kind: MatchKind,
        idx: i8,
        field: MatchField,
        cmp: MatchCmp,
        payload: TestPayload,
    ) -> MatchExpr {
        let mut test = MatchTest::new(kind, idx, field, cmp);
        test.payload = payload;
        MatchExpr::Test(test)
    }

    #[test]
    fn test_true_false_kinds() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        let t = test_leaf(
            MatchKind::True,
            -1,
            MatchField::None,
            MatchCmp::NeqZero,
            TestPayload::None,
        );
        assert!(eval.matches(&t, &insn, 0).unwrap());
        let f = test_leaf(
            MatchKind::False,
            -1,
            MatchField::None,
            MatchCmp::NeqZero,
            TestPayload::None,
        );
        assert!(!eval.matches(&f, &insn, 0).unwrap());
    }

    #[test]
    fn test_address_comparisons() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        let eq = test_leaf(
            MatchKind::Address,
            -1,
            MatchField::None,
            MatchCmp::Eq,
            values_of(&[MatchValue::Integer(0x401000)]),
        );
        assert!(eval.matches(&eq, &insn, 0).unwrap());
        let lt = test_leaf(
            MatchKind::Address,
            -1,
            MatchField::None,
            MatchCmp::Lt,
            values_of(&[MatchValue::Integer(0x402000)]),
        );
        assert!(eval.matches(&lt, &insn, 0).unwrap());
        let gt = test_leaf(
            MatchKind::Address,
            -1,
            MatchField::None,
            MatchCmp::Gt,
            values_of(&[MatchValue::Integer(0x401000)]),
        );
        assert!(!eval.matches(&gt, &insn, 0).unwrap());
    }

    #[test]
    fn test_mnemonic_regex_is_anchored() {
        let mut eval = Evaluator::new();
        let insn = mov_reg_reg();
        let mut test = MatchTest::new(
            MatchKind::Mnemonic,
            -1,
            MatchField::None,
            MatchCmp::Eq,
        );
        test.payload =
            TestPayload::Regex(Regex::new("^(?:mov)$").unwrap());
        assert!(eval
            .matches(&MatchExpr::Test(test.clone()), &insn, 0)
            .unwrap());

        // Full-string semantics: "mo" must not match "mov".
        test.payload = TestPayload::Regex(Regex::new("^(?:mo)$").unwrap());
        assert!(!eval.matches(&MatchExpr::Test(test), &insn, 0).unwrap());
    }

    #[test]
    fn test_src_dst_operand_selection() {
        let mut eval = Evaluator::new();
        let insn = mov_reg_reg();
        // dst[0] is rax, src[0] is rbx.
        let dst = eval.extract(
            MatchKind::Dst,
            0,
            MatchField::None,
            &insn,
            0,
            0,
        );
        assert_eq!(dst, MatchValue::Register(Register::Rax));
        let src = eval.extract(
            MatchKind::Src,
            0,
            MatchField::None,
            &insn,
            0,
            0,
        );
        assert_eq!(src, MatchValue::Register(Register::Rbx));
    }

    #[test]
    fn test_imm_is_never_a_destination() {
        let mut eval = Evaluator::new();
        let mut insn = bare_insn("mov", "$1, rax");
        insn.operands =
            vec![imm_op(1), reg_op(Register::Rax, ACCESS_WRITE)];
        let dst = eval.extract(
            MatchKind::Dst,
            0,
            MatchField::None,
            &insn,
            0,
            0,
        );
        assert_eq!(dst, MatchValue::Register(Register::Rax));
        // op[0].type = imm still sees the immediate.
        let ty = eval.extract(MatchKind::Op, 0, MatchField::Type, &insn, 0, 0);
        assert_eq!(ty, MatchValue::Operand(OpType::Imm));
    }

    #[test]
    fn test_operand_count_without_index() {
        let mut eval = Evaluator::new();
        let mut insn = bare_insn("add", "");
        insn.operands = vec![
            reg_op(Register::Rax, ACCESS_READ | ACCESS_WRITE),
            mem_op(Register::Rbx, 16),
        ];
        let count =
            eval.extract(MatchKind::Mem, -1, MatchField::Size, &insn, 0, 0);
        assert_eq!(count, MatchValue::Integer(1));
        let all =
            eval.extract(MatchKind::Op, -1, MatchField::Size, &insn, 0, 0);
        assert_eq!(all, MatchValue::Integer(2));
    }

    #[test]
    fn test_mem_fields() {
        let mut eval = Evaluator::new();
        let mut insn = bare_insn("mov", "");
        insn.operands = vec![mem_op(Register::Rbx, -32)];
        assert_eq!(
            eval.extract(MatchKind::Mem, 0, MatchField::Base, &insn, 0, 0),
            MatchValue::Register(Register::Rbx)
        );
        assert_eq!(
            eval.extract(MatchKind::Mem, 0, MatchField::Index, &insn, 0, 0),
            MatchValue::Nil
        );
        assert_eq!(
            eval.extract(MatchKind::Mem, 0, MatchField::Displ, &insn, 0, 0),
            MatchValue::Integer(-32)
        );
        assert_eq!(
            eval.extract(MatchKind::Mem, 0, MatchField::Scale, &insn, 0, 0),
            MatchValue::Integer(1)
        );
    }

    #[test]
    fn test_lea_access_is_zeroed() {
        let mut eval = Evaluator::new();
        let mut insn = bare_insn("lea", "");
        insn.lea_or_nop = true;
        insn.operands = vec![
            mem_op(Register::Rbx, 8),
            reg_op(Register::Rax, ACCESS_WRITE),
        ];
        assert_eq!(
            eval.extract(MatchKind::Mem, 0, MatchField::Access, &insn, 0, 0),
            MatchValue::Access(ACCESS_NONE)
        );
    }

    #[test]
    fn test_out_of_range_index_is_undefined() {
        let mut eval = Evaluator::new();
        let insn = mov_reg_reg();
        let value =
            eval.extract(MatchKind::Op, 7, MatchField::None, &insn, 0, 0);
        assert!(value.is_undefined());
        // `defined(...)' is exactly the complement.
        let defined = test_leaf(
            MatchKind::Op,
            7,
            MatchField::None,
            MatchCmp::Defined,
            TestPayload::None,
        );
        assert!(!eval.matches(&defined, &insn, 0).unwrap());
        let defined0 = test_leaf(
            MatchKind::Op,
            0,
            MatchField::None,
            MatchCmp::Defined,
            TestPayload::None,
        );
        assert!(eval.matches(&defined0, &insn, 0).unwrap());
    }

    #[test]
    fn test_neq_multi_element_quirk() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        // Singleton behaves as non-membership.
        let single = test_leaf(
            MatchKind::Size,
            -1,
            MatchField::None,
            MatchCmp::Neq,
            values_of(&[MatchValue::Integer(3)]),
        );
        assert!(!eval.matches(&single, &insn, 0).unwrap());
        // Multi-element sets are always true, even on a member.
        let multi = test_leaf(
            MatchKind::Size,
            -1,
            MatchField::None,
            MatchCmp::Neq,
            values_of(&[MatchValue::Integer(3), MatchValue::Integer(4)]),
        );
        assert!(eval.matches(&multi, &insn, 0).unwrap());
    }

    #[test]
    fn test_empty_set_fails_silently() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        for cmp in [MatchCmp::Eq, MatchCmp::Lt, MatchCmp::Geq] {
            let leaf = test_leaf(
                MatchKind::Size,
                -1,
                MatchField::None,
                cmp,
                TestPayload::Values(ValueIndex::new()),
            );
            assert!(!eval.matches(&leaf, &insn, 0).unwrap());
        }
    }

    #[test]
    fn test_reg_set_membership() {
        let mut eval = Evaluator::new();
        let insn = mov_reg_reg();
        let mut set = BTreeSet::new();
        set.insert(Register::Rdi);
        set.insert(Register::Rbx);
        let reads = test_leaf(
            MatchKind::Reads,
            -1,
            MatchField::None,
            MatchCmp::In,
            TestPayload::Registers(set.clone()),
        );
        assert!(eval.matches(&reads, &insn, 0).unwrap());
        let writes = test_leaf(
            MatchKind::Writes,
            -1,
            MatchField::None,
            MatchCmp::In,
            TestPayload::Registers(set),
        );
        // rbx is only read, never written.
        assert!(!eval.matches(&writes, &insn, 0).unwrap());
    }

    #[test]
    fn test_boolean_operators() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        let t = || {
            Box::new(test_leaf(
                MatchKind::True,
                -1,
                MatchField::None,
                MatchCmp::NeqZero,
                TestPayload::None,
            ))
        };
        let f = || {
            Box::new(test_leaf(
                MatchKind::False,
                -1,
                MatchField::None,
                MatchCmp::NeqZero,
                TestPayload::None,
            ))
        };
        assert!(!eval
            .matches(&MatchExpr::And(t(), f()), &insn, 0)
            .unwrap());
        assert!(eval.matches(&MatchExpr::Or(f(), t()), &insn, 0).unwrap());
        assert!(eval.matches(&MatchExpr::Not(f()), &insn, 0).unwrap());
    }

    fn action_with(matching: MatchExpr, text: &str) -> Action {
        Action {
            text: text.to_string(),
            matching,
            kind: ActionKind::Trap,
            name: "trap".to_string(),
            filename: None,
            symbol: None,
            plugin: None,
            args: Vec::new(),
            clean: true,
            call: CallPosition::Before,
            status: 0,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");
        let t1 = test_leaf(
            MatchKind::True,
            -1,
            MatchField::None,
            MatchCmp::NeqZero,
            TestPayload::None,
        );
        let t2 = t1.clone();
        let actions =
            vec![action_with(t1, "rule-1"), action_with(t2, "rule-2")];
        assert_eq!(eval.select(&actions, &insn, 0).unwrap(), Some(0));
    }

    #[test]
    fn test_csv_record_surfacing_and_ambiguity() {
        let mut eval = Evaluator::new();
        let insn = bare_insn("nop", "");

        let row_a: Rc<Record> =
            Rc::new(vec![crate::csv::Cell::Integer(3)]);
        let row_b: Rc<Record> =
            Rc::new(vec![crate::csv::Cell::Integer(3)]);

        let leaf = |record: &Rc<Record>| {
            let mut index = ValueIndex::new();
            index.insert(MatchValue::Integer(3), Some(record.clone()));
            let mut test = MatchTest::new(
                MatchKind::Size,
                -1,
                MatchField::None,
                MatchCmp::Eq,
            );
            test.basename = Some("table".to_string());
            test.payload = TestPayload::Values(index);
            MatchExpr::Test(test)
        };

        // A single leaf surfaces its record.
        let mut record = None;
        let pass = eval
            .eval(&leaf(&row_a), &insn, 0, Some("table"), &mut record)
            .unwrap();
        assert!(pass);
        assert!(Rc::ptr_eq(record.as_ref().unwrap(), &row_a));

        // Two leaves over the same basename agreeing on the record: fine.
        let both = MatchExpr::And(
            Box::new(leaf(&row_a)),
            Box::new(leaf(&row_a)),
        );
        let mut record = None;
        assert!(eval
            .eval(&both, &insn, 0, Some("table"), &mut record)
            .unwrap());

        // Distinct records: ambiguous, hard error.
        let conflict = MatchExpr::And(
            Box::new(leaf(&row_a)),
            Box::new(leaf(&row_b)),
        );
        let mut record = None;
        assert!(eval
            .eval(&conflict, &insn, 0, Some("table"), &mut record)
            .is_err());
    }

    #[test]
    fn test_random_is_reproducible() {
        let mut a = Evaluator::new();
        let mut b = Evaluator::new();
        let xs: Vec<i64> = (0..8).map(|_| a.next_random()).collect();
        let ys: Vec<i64> = (0..8).map(|_| b.next_random()).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|&x| x >= 0));
    }
}
