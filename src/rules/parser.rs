// Wed Jan 14 2026 - Alex

use std::collections::BTreeSet;

use log::warn;
use regex::Regex;

use crate::csv::CsvLoader;
use crate::elf::{ElfImage, Lookup};
use crate::error::{FrontendError, Result};
use crate::insn::registers::Register;
use crate::plugins::PluginRegistry;
use crate::rules::ast::*;
use crate::rules::lexer::{Lexer, Token};

/// Compiles rule text into `MatchExpr`/`Action` values.  Tracks whether
/// any compiled rule requires decoder detail mode.
pub struct RuleCompiler<'a> {
    elf: &'a ElfImage,
    plugins: &'a mut PluginRegistry,
    csv: &'a mut CsvLoader,
    pub detail: bool,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(
        elf: &'a ElfImage,
        plugins: &'a mut PluginRegistry,
        csv: &'a mut CsvLoader,
    ) -> Self {
        Self {
            elf,
            plugins,
            csv,
            detail: false,
        }
    }

    pub fn compile_match(&mut self, text: &str) -> Result<MatchExpr> {
        let mut parser = Parser {
            lexer: Lexer::new(text, "matching"),
            compiler: self,
        };
        let expr = parser.parse_or_expr()?;
        parser.expect(Token::End)?;
        Ok(expr)
    }

    pub fn compile_action(&mut self, text: &str, matching: MatchExpr) -> Result<Action> {
        let mut parser = Parser {
            lexer: Lexer::new(text, "action"),
            compiler: self,
        };
        parser.parse_action(text, matching)
    }
}

struct Parser<'a, 'c> {
    lexer: Lexer<'a>,
    compiler: &'a mut RuleCompiler<'c>,
}

impl<'a, 'c> Parser<'a, 'c> {
    fn err(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::parse(self.lexer.mode(), message)
    }

    fn unexpected(&self, token: &Token, expected: &str) -> FrontendError {
        self.err(format!("expected {}, found `{}'", expected, token))
    }

    fn next(&mut self) -> Result<Token> {
        self.lexer.next_token()
    }

    fn peek(&mut self) -> Result<Token> {
        self.lexer.peek_token()
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token != expected {
            return Err(self.unexpected(&token, &format!("`{}'", expected)));
        }
        Ok(())
    }

    fn expect_integer(&mut self) -> Result<i64> {
        let token = self.next()?;
        match token {
            Token::Integer(i) => Ok(i),
            other => Err(self.unexpected(&other, "an integer")),
        }
    }

    /// Symbol and file names may be quoted strings or bare identifiers.
    fn expect_name(&mut self) -> Result<String> {
        let token = self.next()?;
        match token {
            Token::Str(s) | Token::Ident(s) => Ok(s),
            other => Err(self.unexpected(&other, "a name")),
        }
    }

    /// `[ INT ]` with an inclusive range check.
    fn parse_index(&mut self, lb: i64, ub: i64) -> Result<i64> {
        self.expect(Token::LBracket)?;
        let idx = self.expect_integer()?;
        self.expect(Token::RBracket)?;
        if idx < lb || idx > ub {
            return Err(self.err(format!(
                "expected index within the range {}..{}, found {}",
                lb, ub, idx
            )));
        }
        Ok(idx)
    }

    /// Resolve `&name`; undefined symbols warn and bind to zero.
    fn parse_symbol(&mut self, symbol: &str) -> Result<i64> {
        match self.compiler.elf.lookup(symbol) {
            Lookup::Addr(addr) => Ok(addr as i64),
            Lookup::Undefined => {
                warn!(
                    "symbol \"{}\" is undefined and therefore has value 0x0",
                    symbol
                );
                Ok(0)
            }
            Lookup::Missing => Err(self.err(format!(
                "\"{}\" does not correspond to any section or symbol name",
                symbol
            ))),
        }
    }

    // ---------------------------------------------------------------
    // Match expressions
    // ---------------------------------------------------------------

    /// `or-expr := and-expr ('||' and-expr)*`
    fn parse_or_expr(&mut self) -> Result<MatchExpr> {
        let mut expr = self.parse_and_expr()?;
        while self.peek()? == Token::Or {
            self.next()?;
            let rhs = self.parse_and_expr()?;
            expr = MatchExpr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    /// `and-expr := test-expr ('&&' test-expr)*`
    fn parse_and_expr(&mut self) -> Result<MatchExpr> {
        let mut expr = self.parse_test_expr()?;
        while self.peek()? == Token::And {
            self.next()?;
            let rhs = self.parse_test_expr()?;
            expr = MatchExpr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    /// `test-expr := '(' or-expr ')' | ('!'|NOT) or-expr | test`
    fn parse_test_expr(&mut self) -> Result<MatchExpr> {
        match self.peek()? {
            Token::LParen => {
                self.next()?;
                let expr = self.parse_or_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Not => {
                self.next()?;
                let expr = self.parse_or_expr()?;
                Ok(MatchExpr::Not(Box::new(expr)))
            }
            _ => Ok(MatchExpr::Test(self.parse_test()?)),
        }
    }

    fn parse_test(&mut self) -> Result<MatchTest> {
        let mut token = self.next()?;
        let mut cmp: Option<MatchCmp> = None;
        let mut regs: BTreeSet<Register> = BTreeSet::new();
        if token == Token::Defined {
            self.expect(Token::LParen)?;
            cmp = Some(MatchCmp::Defined);
            token = self.next()?;
        }

        let mut type_mask: TypeMask = TYPE_INTEGER;
        let kind = match token {
            Token::Asm => {
                type_mask = TYPE_STRING;
                MatchKind::Assembly
            }
            Token::Mnemonic => {
                type_mask = TYPE_STRING;
                MatchKind::Mnemonic
            }
            Token::Addr => MatchKind::Address,
            Token::Call => MatchKind::Call,
            Token::Dst => MatchKind::Dst,
            Token::False => MatchKind::False,
            Token::Imm => MatchKind::Imm,
            Token::Jump => MatchKind::Jump,
            Token::Mem => MatchKind::Mem,
            Token::Offset => MatchKind::Offset,
            Token::Op => MatchKind::Op,
            Token::Plugin => MatchKind::Plugin,
            Token::Random => MatchKind::Random,
            Token::RegKw => MatchKind::Reg,
            Token::Return => MatchKind::Return,
            Token::Size | Token::Length => MatchKind::Size,
            Token::Src => MatchKind::Src,
            Token::True => MatchKind::True,
            Token::Reg(first) => {
                // Reg-set test: `R1, R2, ... in {regs|reads|writes}'.
                cmp = Some(MatchCmp::In);
                regs.insert(first);
                while self.peek()? == Token::Comma {
                    self.next()?;
                    match self.next()? {
                        Token::Reg(reg) => {
                            regs.insert(reg);
                        }
                        other => {
                            return Err(self.unexpected(&other, "a register"))
                        }
                    }
                }
                self.expect(Token::In)?;
                match self.next()? {
                    Token::Regs => MatchKind::Regs,
                    Token::Reads => MatchKind::Reads,
                    Token::Writes => MatchKind::Writes,
                    other => {
                        return Err(self.unexpected(
                            &other,
                            "one of `regs', `reads', `writes'",
                        ))
                    }
                }
            }
            Token::Regs | Token::Reads | Token::Writes => {
                // Only reachable via `defined(...)'.
                if cmp.is_none() {
                    return Err(self.unexpected(&token, "a match attribute"));
                }
                match token {
                    Token::Regs => MatchKind::Regs,
                    Token::Reads => MatchKind::Reads,
                    _ => MatchKind::Writes,
                }
            }
            other => return Err(self.unexpected(&other, "a match attribute")),
        };

        let mut plugin = None;
        let mut idx: i8 = -1;
        let mut field = MatchField::None;
        match kind {
            MatchKind::Plugin => {
                self.expect(Token::LParen)?;
                let filename = self.expect_name()?;
                self.expect(Token::RParen)?;
                self.expect(Token::Dot)?;
                self.expect(Token::MatchKw)?;
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                let handle = self.compiler.plugins.open(&filename)?;
                if !handle.borrow().has_match() {
                    return Err(FrontendError::Plugin(format!(
                        "plugin \"{}\" does not export the match entry point",
                        filename
                    )));
                }
                plugin = Some(handle);
            }
            MatchKind::Op
            | MatchKind::Src
            | MatchKind::Dst
            | MatchKind::Imm
            | MatchKind::Reg
            | MatchKind::Mem => {
                match self.peek()? {
                    Token::Dot => {}
                    Token::LBracket => {
                        idx = self.parse_index(0, 7)? as i8;
                    }
                    other => {
                        return Err(self.unexpected(
                            &other,
                            "an operand index or field",
                        ))
                    }
                }
                if self.peek()? == Token::Dot {
                    self.next()?;
                    let mut need_idx = true;
                    let ftok = self.next()?;
                    field = match ftok {
                        Token::Type => {
                            type_mask = TYPE_OPERAND;
                            MatchField::Type
                        }
                        Token::AccessKw => {
                            type_mask = TYPE_ACCESS;
                            MatchField::Access
                        }
                        Token::Size | Token::Length => {
                            need_idx = false;
                            MatchField::Size
                        }
                        Token::Segment => {
                            type_mask = TYPE_REGISTER | TYPE_NIL;
                            MatchField::Seg
                        }
                        Token::Displacement => MatchField::Displ,
                        Token::Base => {
                            type_mask = TYPE_REGISTER | TYPE_NIL;
                            MatchField::Base
                        }
                        Token::Index => {
                            type_mask = TYPE_REGISTER | TYPE_NIL;
                            MatchField::Index
                        }
                        Token::Scale => MatchField::Scale,
                        other => {
                            return Err(
                                self.unexpected(&other, "an operand field")
                            )
                        }
                    };
                    if need_idx && idx < 0 {
                        return Err(self.err(format!(
                            "field `{}' requires an operand index",
                            ftok
                        )));
                    }
                } else if idx >= 0 {
                    type_mask = TYPE_INTEGER | TYPE_REGISTER;
                }
            }
            _ => {}
        }

        // Comparison operator; absence means `!= 0'.
        let cmp = match cmp {
            Some(cmp) => {
                if cmp == MatchCmp::Defined {
                    self.expect(Token::RParen)?;
                }
                cmp
            }
            None => {
                let cmp = match self.peek()? {
                    Token::Eq => MatchCmp::Eq,
                    Token::Neq => MatchCmp::Neq,
                    Token::Lt => MatchCmp::Lt,
                    Token::Leq => MatchCmp::Leq,
                    Token::Gt => MatchCmp::Gt,
                    Token::Geq => MatchCmp::Geq,
                    _ => MatchCmp::NeqZero,
                };
                if cmp != MatchCmp::NeqZero {
                    self.next()?;
                }
                cmp
            }
        };

        if matches!(kind, MatchKind::Assembly | MatchKind::Mnemonic)
            && !matches!(cmp, MatchCmp::Eq | MatchCmp::Neq | MatchCmp::Defined)
        {
            return Err(self.err(
                "invalid match comparison operator for a string attribute",
            ));
        }

        match kind {
            MatchKind::Call
            | MatchKind::Jump
            | MatchKind::Return
            | MatchKind::Plugin
            | MatchKind::Op
            | MatchKind::Src
            | MatchKind::Dst
            | MatchKind::Imm
            | MatchKind::Reg
            | MatchKind::Mem
            | MatchKind::Reads
            | MatchKind::Writes
            | MatchKind::Regs => self.compiler.detail = true,
            _ => {}
        }

        let mut test = MatchTest::new(kind, idx, field, cmp);
        test.plugin = plugin;
        if cmp == MatchCmp::Defined {
            return Ok(test);
        }
        if cmp == MatchCmp::In {
            test.payload = TestPayload::Registers(regs);
            return Ok(test);
        }
        if type_mask == TYPE_STRING {
            let pattern = match self.lexer.next_regex()? {
                Token::Regex(s) | Token::Str(s) => s,
                other => return Err(self.unexpected(&other, "a pattern")),
            };
            // Full-string match semantics.
            let regex =
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    self.err(format!("bad pattern \"{}\": {}", pattern, e))
                })?;
            test.payload = TestPayload::Regex(regex);
            return Ok(test);
        }
        if cmp == MatchCmp::EqZero || cmp == MatchCmp::NeqZero {
            return Ok(test);
        }

        match self.peek()? {
            Token::Str(_) | Token::Ident(_) => {
                // CSV-backed value set: `attr = "basename" [ column ]'.
                if type_mask & TYPE_INTEGER == 0 {
                    let token = self.next()?;
                    return Err(self.unexpected(&token, "a value"));
                }
                let basename = self.expect_name()?;
                let column = self.parse_index(i64::MIN, i64::MAX)?;
                let values = self.compiler.csv.index(&basename, column)?;
                test.basename = Some(basename);
                test.payload = TestPayload::Values(values);
            }
            _ => {
                let values = self.parse_values(type_mask, cmp)?;
                test.payload = TestPayload::Values(values);
            }
        }
        Ok(test)
    }

    fn parse_values(&mut self, type_mask: TypeMask, cmp: MatchCmp) -> Result<ValueIndex> {
        let mut index = ValueIndex::new();
        loop {
            let token = self.next()?;
            let value = match token {
                Token::Amp => {
                    let symbol = self.expect_name()?;
                    MatchValue::Integer(self.parse_symbol(&symbol)?)
                }
                Token::Nil => MatchValue::Nil,
                Token::Integer(i) => MatchValue::Integer(i),
                Token::Reg(reg) => MatchValue::Register(reg),
                Token::Imm => MatchValue::Operand(OpType::Imm),
                Token::RegKw => MatchValue::Operand(OpType::Reg),
                Token::Mem => MatchValue::Operand(OpType::Mem),
                Token::AccessVal(access) => MatchValue::Access(access),
                other => return Err(self.unexpected(&other, "a value")),
            };
            if type_mask & value.mask() == 0 {
                return Err(self.err(format!(
                    "value `{}' has the wrong type for this attribute",
                    token_for_value(&value)
                )));
            }
            index.insert(value, None);
            if cmp != MatchCmp::Eq || self.peek()? != Token::Comma {
                break;
            }
            self.next()?;
        }
        Ok(index)
    }

    // ---------------------------------------------------------------
    // Memory operands
    // ---------------------------------------------------------------

    fn parse_mem_op(&mut self, token: &Token) -> Result<MemOp> {
        let size = match token {
            Token::Mem8 => 1,
            Token::Mem16 => 2,
            Token::Mem32 => 4,
            Token::Mem64 => 8,
            other => {
                return Err(self.unexpected(other, "a memory operand width"))
            }
        };
        let mut memop = MemOp {
            size,
            ..MemOp::default()
        };
        let mut disp64: i64 = 0;
        let mut scale64: i64 = 1;

        // Errors below report the dedicated sub-mode.
        let mode = "memory operand";

        self.expect(Token::Lt)?;
        if let Token::Reg(reg) = self.peek()? {
            self.next()?;
            memop.segment = reg;
            self.expect(Token::Colon)?;
        }
        if let Token::Integer(i) = self.peek()? {
            self.next()?;
            disp64 = i;
        }

        if self.peek()? == Token::LParen {
            self.next()?;
            let mut done = false;
            // Base register.
            match self.next()? {
                Token::Comma => {}
                Token::Nil => match self.next()? {
                    Token::RParen => done = true,
                    Token::Comma => {}
                    other => {
                        return Err(self.unexpected(&other, "`,' or `)'"))
                    }
                },
                Token::Reg(reg) => {
                    memop.base = reg;
                    match self.next()? {
                        Token::RParen => done = true,
                        Token::Comma => {}
                        other => {
                            return Err(self.unexpected(&other, "`,' or `)'"))
                        }
                    }
                }
                Token::RParen => done = true,
                other => {
                    return Err(self.unexpected(&other, "a base register"))
                }
            }
            // Index register.
            if !done {
                match self.next()? {
                    Token::Comma => {}
                    Token::Nil => match self.next()? {
                        Token::RParen => done = true,
                        Token::Comma => {}
                        other => {
                            return Err(self.unexpected(&other, "`,' or `)'"))
                        }
                    },
                    Token::Reg(reg) => {
                        memop.index = reg;
                        match self.next()? {
                            Token::RParen => done = true,
                            Token::Comma => {}
                            other => {
                                return Err(
                                    self.unexpected(&other, "`,' or `)'")
                                )
                            }
                        }
                    }
                    Token::RParen => done = true,
                    other => {
                        return Err(self.unexpected(&other, "an index register"))
                    }
                }
            }
            // Scale.
            if !done {
                scale64 = self.expect_integer()?;
                self.expect(Token::RParen)?;
            }
        }
        self.expect(Token::Gt)?;

        if disp64 < i32::MIN as i64 || disp64 > i32::MAX as i64 {
            return Err(FrontendError::parse(
                mode,
                format!(
                    "expected displacement within the range {}..{}, found {}",
                    i32::MIN,
                    i32::MAX,
                    disp64
                ),
            ));
        }
        if memop.segment != Register::None && !memop.segment.is_segment() {
            return Err(FrontendError::parse(
                mode,
                format!("invalid segment register {}", memop.segment),
            ));
        }
        if !memop.base.is_mem_base() {
            return Err(FrontendError::parse(
                mode,
                format!("invalid base register {}", memop.base),
            ));
        }
        if !memop.index.is_mem_index() {
            return Err(FrontendError::parse(
                mode,
                format!("invalid index register {}", memop.index),
            ));
        }
        if !matches!(scale64, 1 | 2 | 4 | 8) {
            return Err(FrontendError::parse(
                mode,
                format!("expected scale with value {{1,2,4,8}}, found {}", scale64),
            ));
        }
        if memop.base == Register::Rip
            && (memop.index != Register::None || scale64 != 1)
        {
            return Err(FrontendError::parse(
                mode,
                "invalid memory operand with rip base register and non-empty \
                 index/scale"
                    .to_string(),
            ));
        }
        memop.disp = disp64 as i32;
        memop.scale = scale64 as u8;
        Ok(memop)
    }

    // ---------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------

    fn parse_action(&mut self, text: &str, matching: MatchExpr) -> Result<Action> {
        let kind = match self.next()? {
            Token::Call => ActionKind::Call,
            Token::Exit => ActionKind::Exit,
            Token::Passthru => ActionKind::Passthru,
            Token::Print => ActionKind::Print,
            Token::Plugin => ActionKind::Plugin,
            Token::Trap => ActionKind::Trap,
            other => return Err(self.unexpected(&other, "an action kind")),
        };

        let mut call = CallPosition::Before;
        let mut clean = false;
        let mut naked = false;
        let mut before = false;
        let mut after = false;
        let mut replace = false;
        let mut conditional = false;
        let mut jump = false;
        let mut symbol: Option<String> = None;
        let mut filename: Option<String> = None;
        let mut plugin = None;
        let mut args: Vec<Argument> = Vec::new();
        let mut status: i32 = 0;

        match kind {
            ActionKind::Exit => {
                self.expect(Token::LParen)?;
                let value = self.expect_integer()?;
                if !(0..=255).contains(&value) {
                    return Err(self.err(
                        "exit status must be an integer within the range 0..255",
                    ));
                }
                status = value as i32;
                self.expect(Token::RParen)?;
            }
            ActionKind::Plugin => {
                self.expect(Token::LParen)?;
                let name = self.expect_name()?;
                self.expect(Token::RParen)?;
                self.expect(Token::Dot)?;
                self.expect(Token::Patch)?;
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                plugin = Some(self.compiler.plugins.open(&name)?);
                filename = Some(name);
                self.compiler.detail = true;
            }
            ActionKind::Call => {
                if self.peek()? == Token::LBracket {
                    self.next()?;
                    loop {
                        match self.next()? {
                            Token::After => after = true,
                            Token::Before => before = true,
                            Token::Clean => clean = true,
                            Token::Naked => naked = true,
                            Token::Replace => replace = true,
                            Token::Conditional => {
                                if self.peek()? == Token::Dot {
                                    self.next()?;
                                    self.expect(Token::Jump)?;
                                    jump = true;
                                } else {
                                    conditional = true;
                                }
                            }
                            other => {
                                return Err(self
                                    .unexpected(&other, "a call attribute"))
                            }
                        }
                        match self.next()? {
                            Token::RBracket => break,
                            Token::Comma => {}
                            other => {
                                return Err(self.unexpected(&other, "`,' or `]'"))
                            }
                        }
                    }
                }
                symbol = Some(self.expect_name()?);
                if self.peek()? == Token::LParen {
                    self.next()?;
                    if self.peek()? == Token::RParen {
                        self.next()?;
                    } else {
                        loop {
                            let arg = self.parse_call_argument()?;
                            if args.len() >= MAX_ARGNO {
                                return Err(FrontendError::Limit(format!(
                                    "too many call arguments (maximum is {})",
                                    MAX_ARGNO
                                )));
                            }
                            let duplicate =
                                args.iter().any(|prev| prev.kind == arg.kind);
                            let mut arg = arg;
                            arg.duplicate = duplicate;
                            args.push(arg);
                            match self.next()? {
                                Token::RParen => break,
                                Token::Comma => {}
                                other => {
                                    return Err(
                                        self.unexpected(&other, "`,' or `)'")
                                    )
                                }
                            }
                        }
                    }
                }
                self.expect(Token::At)?;
                filename = Some(self.lexer.rest_as_path()?);
                if clean && naked {
                    return Err(self.err(
                        "`clean' and `naked' attributes cannot be used together",
                    ));
                }
                if [before, after, replace, conditional, jump]
                    .iter()
                    .filter(|&&b| b)
                    .count()
                    > 1
                {
                    return Err(self.err(
                        "only one of the `before', `after', `replace', \
                         `conditional' and `conditional.jump' attributes can \
                         be used together",
                    ));
                }
                clean = if clean { true } else { !naked };
                call = if after {
                    CallPosition::After
                } else if replace {
                    CallPosition::Replace
                } else if conditional {
                    CallPosition::Conditional
                } else if jump {
                    CallPosition::ConditionalJump
                } else {
                    CallPosition::Before
                };
            }
            _ => {}
        }
        self.expect(Token::End)?;

        let name = match kind {
            ActionKind::Print => "print".to_string(),
            ActionKind::Passthru => "passthru".to_string(),
            ActionKind::Trap => "trap".to_string(),
            ActionKind::Exit => format!("exit_{}", status),
            ActionKind::Plugin => {
                format!("plugin_{}", filename.as_deref().unwrap_or(""))
            }
            ActionKind::Call => format!(
                "call_{}_{}_{}_{}",
                if clean { "clean" } else { "naked" },
                call.name_part(),
                symbol.as_deref().unwrap_or(""),
                filename.as_deref().unwrap_or("")
            ),
        };

        Ok(Action {
            text: text.to_string(),
            matching,
            kind,
            name,
            filename,
            symbol,
            plugin,
            args,
            clean,
            call,
            status,
        })
    }

    fn parse_call_argument(&mut self) -> Result<Argument> {
        let mut token = self.next()?;
        let mut ptr = false;
        if token == Token::Amp {
            ptr = true;
            token = self.next()?;
        }

        let mut arg = match token {
            Token::Asm => {
                let mut arg = Argument::new(ArgumentKind::Asm);
                if self.peek()? == Token::Dot {
                    self.next()?;
                    arg.kind = match self.next()? {
                        Token::Length => ArgumentKind::AsmLen,
                        Token::Size => ArgumentKind::AsmSize,
                        other => {
                            return Err(self
                                .unexpected(&other, "`length' or `size'"))
                        }
                    };
                }
                arg
            }
            Token::Addr => Argument::new(ArgumentKind::Addr),
            Token::Base => Argument::new(ArgumentKind::Base),
            Token::Dst => Argument::new(ArgumentKind::Dst),
            Token::Id => Argument::new(ArgumentKind::Id),
            Token::Imm => Argument::new(ArgumentKind::Imm),
            Token::Instr => Argument::new(ArgumentKind::Instr),
            Token::Mem => Argument::new(ArgumentKind::Mem),
            Token::Mem8 | Token::Mem16 | Token::Mem32 | Token::Mem64 => {
                let mut arg = Argument::new(ArgumentKind::MemOp);
                arg.memop = self.parse_mem_op(&token)?;
                arg
            }
            Token::Next => {
                self.compiler.detail = true;
                Argument::new(ArgumentKind::Next)
            }
            Token::Offset => Argument::new(ArgumentKind::Offset),
            Token::Op => Argument::new(ArgumentKind::Op),
            Token::Random => Argument::new(ArgumentKind::Random),
            Token::RegKw => Argument::new(ArgumentKind::Reg),
            Token::Size | Token::Length => Argument::new(ArgumentKind::InstrSize),
            Token::State => Argument::new(ArgumentKind::State),
            Token::StaticAddr => Argument::new(ArgumentKind::StaticAddr),
            Token::Src => Argument::new(ArgumentKind::Src),
            Token::Target => {
                self.compiler.detail = true;
                Argument::new(ArgumentKind::Target)
            }
            Token::Trampoline => Argument::new(ArgumentKind::Trampoline),
            Token::Reg(reg) => {
                let mut arg = Argument::new(ArgumentKind::Register);
                arg.reg = reg;
                arg
            }
            Token::Integer(value) => {
                let mut arg = Argument::new(ArgumentKind::Integer);
                arg.value = value;
                arg
            }
            Token::Str(name) | Token::Ident(name) => {
                let kind = if self.peek()? == Token::LBracket {
                    ArgumentKind::User
                } else {
                    ArgumentKind::Symbol
                };
                let mut arg = Argument::new(kind);
                arg.name = Some(name);
                arg
            }
            other => return Err(self.unexpected(&other, "a call argument")),
        };
        arg.ptr = ptr;

        match arg.kind {
            ArgumentKind::Op
            | ArgumentKind::Src
            | ArgumentKind::Dst
            | ArgumentKind::Imm
            | ArgumentKind::Reg
            | ArgumentKind::Mem => {
                self.compiler.detail = true;
                arg.value = self.parse_index(0, 7)?;
                if self.peek()? == Token::Dot {
                    self.next()?;
                    let ftok = self.next()?;
                    arg.field = match ftok {
                        Token::Base => MatchField::Base,
                        Token::Index => MatchField::Index,
                        Token::Displacement => MatchField::Displ,
                        Token::Scale => MatchField::Scale,
                        Token::Size | Token::Length => MatchField::Size,
                        Token::Type => MatchField::Type,
                        Token::AccessKw => MatchField::Access,
                        other => {
                            return Err(
                                self.unexpected(&other, "an operand field")
                            )
                        }
                    };
                    if ptr
                        && !matches!(
                            arg.field,
                            MatchField::Base | MatchField::Index
                        )
                    {
                        return Err(self.err(format!(
                            "cannot pass field `{}' by pointer",
                            ftok
                        )));
                    }
                } else if ptr {
                    return Err(self
                        .err("cannot pass a whole operand by pointer"));
                }
            }
            ArgumentKind::MemOp => {}
            ArgumentKind::Symbol => {
                if !ptr {
                    return Err(self.err(format!(
                        "symbol argument `{}' must be passed-by-pointer",
                        arg.name.as_deref().unwrap_or("")
                    )));
                }
            }
            ArgumentKind::User => {
                arg.value = self.parse_index(i64::MIN, i64::MAX)?;
            }
            _ => {
                if ptr {
                    return Err(self.err(
                        "this argument kind cannot be passed-by-pointer",
                    ));
                }
            }
        }
        Ok(arg)
    }
}

fn token_for_value(value: &MatchValue) -> String {
    match value {
        MatchValue::Undefined => "<undefined>".to_string(),
        MatchValue::Nil => "nil".to_string(),
        MatchValue::Integer(i) => i.to_string(),
        MatchValue::Operand(OpType::Imm) => "imm".to_string(),
        MatchValue::Operand(OpType::Reg) => "reg".to_string(),
        MatchValue::Operand(OpType::Mem) => "mem".to_string(),
        MatchValue::Access(_) => "<access>".to_string(),
        MatchValue::Register(reg) => reg.to_string(),
        MatchValue::Memory => "mem".to_string(),
        MatchValue::String(s) => format!("\"{}\"", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ast::{
        ActionKind, ArgumentKind, CallPosition, MatchCmp, MatchExpr,
        MatchField, MatchKind, TestPayload,
    };
    use std::path::PathBuf;

    // Minimal ELF64 with a .text section and a symbol table containing
    // `main' (defined at 0x401000) and `weak_ref' (undefined).
    fn fixture_elf() -> PathBuf {
        let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0";
        let strtab = b"\0main\0weak_ref\0";
        let text = [0x90u8, 0xc3];

        const SHSTRTAB_OFF: usize = 384;
        const STRTAB_OFF: usize = 420;
        const SYMTAB_OFF: usize = 440;
        const TEXT_OFF: usize = 0x200;
        let mut data = vec![0u8; TEXT_OFF + text.len()];

        data[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        data[4] = 2;
        data[5] = 1;
        data[6] = 1;
        data[16..18].copy_from_slice(&2u16.to_le_bytes());
        data[18..20].copy_from_slice(&62u16.to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[24..32].copy_from_slice(&0x401000u64.to_le_bytes());
        data[40..48].copy_from_slice(&64u64.to_le_bytes());
        data[52..54].copy_from_slice(&64u16.to_le_bytes());
        data[58..60].copy_from_slice(&64u16.to_le_bytes());
        data[60..62].copy_from_slice(&5u16.to_le_bytes());
        data[62..64].copy_from_slice(&4u16.to_le_bytes());

        #[allow(clippy::too_many_arguments)]
        fn shdr(
            data: &mut [u8],
            index: usize,
            name: u32,
            sh_type: u32,
            addr: u64,
            offset: u64,
            size: u64,
            link: u32,
            entsize: u64,
        ) {
            let base = 64 + index * 64;
            data[base..base + 4].copy_from_slice(&name.to_le_bytes());
            data[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
            data[base + 16..base + 24].copy_from_slice(&addr.to_le_bytes());
            data[base + 24..base + 32]
                .copy_from_slice(&offset.to_le_bytes());
            data[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
            data[base + 40..base + 44].copy_from_slice(&link.to_le_bytes());
            data[base + 56..base + 64]
                .copy_from_slice(&entsize.to_le_bytes());
        }
        shdr(&mut data, 1, 1, 1, 0x401000, TEXT_OFF as u64, 2, 0, 0);
        shdr(&mut data, 2, 7, 2, 0, SYMTAB_OFF as u64, 72, 3, 24);
        shdr(
            &mut data,
            3,
            15,
            3,
            0,
            STRTAB_OFF as u64,
            strtab.len() as u64,
            0,
            0,
        );
        shdr(
            &mut data,
            4,
            23,
            3,
            0,
            SHSTRTAB_OFF as u64,
            shstrtab.len() as u64,
            0,
            0,
        );

        data[SHSTRTAB_OFF..SHSTRTAB_OFF + shstrtab.len()]
            .copy_from_slice(shstrtab);
        data[STRTAB_OFF..STRTAB_OFF + strtab.len()].copy_from_slice(strtab);

        // Symbols: null, main (defined), weak_ref (undefined).
        let mut sym = |index: usize, name: u32, shndx: u16, value: u64| {
            let base = SYMTAB_OFF + index * 24;
            data[base..base + 4].copy_from_slice(&name.to_le_bytes());
            data[base + 6..base + 8].copy_from_slice(&shndx.to_le_bytes());
            data[base + 8..base + 16].copy_from_slice(&value.to_le_bytes());
        };
        sym(1, 1, 1, 0x401000);
        sym(2, 6, 0, 0);

        data[TEXT_OFF..].copy_from_slice(&text);

        let dir = std::env::temp_dir().join("repatch-parser-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fixture.elf");
        std::fs::write(&path, &data).unwrap();
        path
    }

    fn compile_match(text: &str) -> crate::error::Result<(MatchExpr, bool)> {
        let elf = ElfImage::load(fixture_elf(), 0).unwrap();
        let mut plugins = PluginRegistry::new();
        let mut csv = CsvLoader::new();
        let mut compiler = RuleCompiler::new(&elf, &mut plugins, &mut csv);
        let expr = compiler.compile_match(text)?;
        Ok((expr, compiler.detail))
    }

    fn compile_action(text: &str) -> crate::error::Result<crate::rules::ast::Action> {
        let elf = ElfImage::load(fixture_elf(), 0).unwrap();
        let mut plugins = PluginRegistry::new();
        let mut csv = CsvLoader::new();
        let mut compiler = RuleCompiler::new(&elf, &mut plugins, &mut csv);
        let matching = compiler.compile_match("true")?;
        compiler.compile_action(text, matching)
    }

    fn leaf(expr: &MatchExpr) -> &MatchTest {
        match expr {
            MatchExpr::Test(test) => test,
            other => panic!("expected a leaf test, got {:?}", other),
        }
    }

    #[test]
    fn test_mnemonic_regex_leaf() {
        let (expr, detail) = compile_match("mnemonic=mov").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.kind, MatchKind::Mnemonic);
        assert_eq!(test.cmp, MatchCmp::Eq);
        assert!(matches!(&test.payload, TestPayload::Regex(r)
            if r.is_match("mov") && !r.is_match("movq")));
        assert!(!detail);
    }

    #[test]
    fn test_operand_projection_leaf() {
        let (expr, detail) = compile_match("op[0].type = reg").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.kind, MatchKind::Op);
        assert_eq!(test.idx, 0);
        assert_eq!(test.field, MatchField::Type);
        assert!(detail);
        match &test.payload {
            TestPayload::Values(values) => {
                assert!(values
                    .contains_key(&MatchValue::Operand(OpType::Reg)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_size_without_index_is_count() {
        let (expr, _) = compile_match("mem.size > 0").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.kind, MatchKind::Mem);
        assert_eq!(test.idx, -1);
        assert_eq!(test.field, MatchField::Size);
        assert_eq!(test.cmp, MatchCmp::Gt);
    }

    #[test]
    fn test_absent_operator_means_nonzero() {
        let (expr, _) = compile_match("call").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.kind, MatchKind::Call);
        assert_eq!(test.cmp, MatchCmp::NeqZero);
    }

    #[test]
    fn test_precedence_and_over_or() {
        let (expr, _) = compile_match("true && false || size=1").unwrap();
        match expr {
            MatchExpr::Or(lhs, _) => {
                assert!(matches!(*lhs, MatchExpr::And(_, _)));
            }
            other => panic!("expected Or at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_not_consumes_or_expr() {
        let (expr, _) = compile_match("!true && false").unwrap();
        match expr {
            MatchExpr::Not(child) => {
                assert!(matches!(*child, MatchExpr::And(_, _)));
            }
            other => panic!("expected Not at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_parenthesized_grouping() {
        let (expr, _) = compile_match("(true || false) && size=1").unwrap();
        match expr {
            MatchExpr::And(lhs, _) => {
                assert!(matches!(*lhs, MatchExpr::Or(_, _)));
            }
            other => panic!("expected And at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_value_list() {
        let (expr, _) = compile_match("size=1,3,5").unwrap();
        let test = leaf(&expr);
        match &test.payload {
            TestPayload::Values(values) => {
                assert_eq!(values.len(), 3);
                assert!(values.contains_key(&MatchValue::Integer(3)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_defined() {
        let (expr, _) = compile_match("defined(op[3])").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.cmp, MatchCmp::Defined);
        assert_eq!(test.idx, 3);
    }

    #[test]
    fn test_reg_set_test() {
        let (expr, detail) = compile_match("rdi, rsi in reads").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.kind, MatchKind::Reads);
        assert_eq!(test.cmp, MatchCmp::In);
        assert!(detail);
        match &test.payload {
            TestPayload::Registers(set) => {
                assert!(set.contains(&Register::Rdi));
                assert!(set.contains(&Register::Rsi));
                assert_eq!(set.len(), 2);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_symbolic_address() {
        let (expr, _) = compile_match("addr = &main").unwrap();
        let test = leaf(&expr);
        match &test.payload {
            TestPayload::Values(values) => {
                assert!(values.contains_key(&MatchValue::Integer(0x401000)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        // Undefined symbols warn and bind to zero.
        let (expr, _) = compile_match("addr = &weak_ref").unwrap();
        let test = leaf(&expr);
        match &test.payload {
            TestPayload::Values(values) => {
                assert!(values.contains_key(&MatchValue::Integer(0)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        // Unknown names are fatal.
        assert!(compile_match("addr = &no_such_symbol").is_err());
    }

    #[test]
    fn test_type_errors_at_parse_time() {
        // A register field cannot be compared against an integer.
        assert!(compile_match("op[0].base = 1").is_err());
        // A plain attribute cannot be compared against a register.
        assert!(compile_match("size = rax").is_err());
        // String attributes only accept =, != and defined.
        assert!(compile_match("mnemonic > mov").is_err());
    }

    #[test]
    fn test_operand_index_bounds() {
        assert!(compile_match("op[8].type = reg").is_err());
        assert!(compile_match("op[-1].type = reg").is_err());
        let (expr, _) = compile_match("op[7].type = reg").unwrap();
        assert_eq!(leaf(&expr).idx, 7);
    }

    #[test]
    fn test_trailing_input_rejected() {
        assert!(compile_match("true true").is_err());
        assert!(compile_match("size=1 2").is_err());
    }

    #[test]
    fn test_csv_backed_set() {
        let dir = std::env::temp_dir().join("repatch-parser-csv");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sites.csv"), "0x401000,one\n0x401005,two\n")
            .unwrap();

        let elf = ElfImage::load(fixture_elf(), 0).unwrap();
        let mut plugins = PluginRegistry::new();
        let mut csv = CsvLoader::with_root(&dir);
        let mut compiler = RuleCompiler::new(&elf, &mut plugins, &mut csv);
        let expr = compiler.compile_match("addr = \"sites\"[0]").unwrap();
        let test = leaf(&expr);
        assert_eq!(test.basename.as_deref(), Some("sites"));
        match &test.payload {
            TestPayload::Values(values) => {
                assert_eq!(values.len(), 2);
                let record = values
                    .get(&MatchValue::Integer(0x401000))
                    .unwrap()
                    .as_ref()
                    .unwrap();
                assert_eq!(
                    record[1],
                    crate::csv::Cell::Str("one".to_string())
                );
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_simple_actions() {
        let action = compile_action("trap").unwrap();
        assert_eq!(action.kind, ActionKind::Trap);
        assert_eq!(action.name, "trap");

        let action = compile_action("passthru").unwrap();
        assert_eq!(action.kind, ActionKind::Passthru);

        let action = compile_action("exit(42)").unwrap();
        assert_eq!(action.kind, ActionKind::Exit);
        assert_eq!(action.status, 42);
        assert_eq!(action.name, "exit_42");

        assert!(compile_action("exit(300)").is_err());
        assert!(compile_action("exit(-1)").is_err());
    }

    #[test]
    fn test_call_action() {
        let action = compile_action(
            "call [after] hook(addr, &op[0].base)@libhook.so",
        )
        .unwrap();
        assert_eq!(action.kind, ActionKind::Call);
        assert_eq!(action.call, CallPosition::After);
        assert!(action.clean);
        assert_eq!(action.symbol.as_deref(), Some("hook"));
        assert_eq!(action.filename.as_deref(), Some("libhook.so"));
        assert_eq!(action.name, "call_clean_after_hook_libhook.so");
        assert_eq!(action.args.len(), 2);
        assert_eq!(action.args[0].kind, ArgumentKind::Addr);
        assert!(!action.args[0].ptr);
        assert_eq!(action.args[1].kind, ArgumentKind::Op);
        assert!(action.args[1].ptr);
        assert_eq!(action.args[1].field, MatchField::Base);
        assert_eq!(action.args[1].value, 0);
    }

    #[test]
    fn test_call_attribute_exclusivity() {
        assert!(compile_action("call [clean,naked] f()@x").is_err());
        assert!(compile_action("call [before,after] f()@x").is_err());
        let action = compile_action("call [naked] f()@x").unwrap();
        assert!(!action.clean);
        let action = compile_action("call f()@x").unwrap();
        assert!(action.clean);
        assert_eq!(action.call, CallPosition::Before);
        let action =
            compile_action("call [conditional.jump] f()@x").unwrap();
        assert_eq!(action.call, CallPosition::ConditionalJump);
        assert_eq!(action.name, "call_clean_jump_f_x");
    }

    #[test]
    fn test_pass_by_pointer_rules() {
        // Symbols must be passed by pointer.
        assert!(compile_action("call f(errno)@x").is_err());
        assert!(compile_action("call f(&errno)@x").is_ok());
        // Plain facts cannot be.
        assert!(compile_action("call f(&addr)@x").is_err());
        // Operand fields other than base/index cannot be.
        assert!(compile_action("call f(&op[0].displacement)@x").is_err());
        assert!(compile_action("call f(&op[0].index)@x").is_ok());
    }

    #[test]
    fn test_duplicate_argument_marking() {
        let action = compile_action("call f(addr, size, addr)@x").unwrap();
        assert!(!action.args[0].duplicate);
        assert!(!action.args[1].duplicate);
        assert!(action.args[2].duplicate);
    }

    #[test]
    fn test_too_many_arguments() {
        assert!(compile_action(
            "call f(addr, size, offset, random, id, instr, next, asm, \
             target)@x"
        )
        .is_err());
    }

    #[test]
    fn test_memory_operand_literal() {
        let action = compile_action(
            "call f(mem64<fs:0x30(rax,rbx,8)>)@x",
        )
        .unwrap();
        let memop = &action.args[0].memop;
        assert_eq!(action.args[0].kind, ArgumentKind::MemOp);
        assert_eq!(memop.size, 8);
        assert_eq!(memop.segment, Register::Fs);
        assert_eq!(memop.disp, 0x30);
        assert_eq!(memop.base, Register::Rax);
        assert_eq!(memop.index, Register::Rbx);
        assert_eq!(memop.scale, 8);

        // True widths per keyword.
        let action = compile_action("call f(mem16<8(rcx)>)@x").unwrap();
        assert_eq!(action.args[0].memop.size, 2);
        assert_eq!(action.args[0].memop.base, Register::Rcx);
        assert_eq!(action.args[0].memop.disp, 8);
        assert_eq!(action.args[0].memop.scale, 1);
    }

    #[test]
    fn test_memory_operand_constraints() {
        assert!(compile_action("call f(mem64<(rax,rbx,3)>)@x").is_err());
        assert!(compile_action("call f(mem64<(rax,rsp,2)>)@x").is_err());
        assert!(compile_action("call f(mem64<(rip,rbx,1)>)@x").is_err());
        assert!(compile_action("call f(mem64<(ax)>)@x").is_err());
        assert!(compile_action("call f(mem64<(rip)>)@x").is_ok());
        assert!(
            compile_action("call f(mem32<0x7fffffff(rax)>)@x").is_ok()
        );
    }

    #[test]
    fn test_user_csv_argument() {
        let action = compile_action("call f(stats[2])@x").unwrap();
        assert_eq!(action.args[0].kind, ArgumentKind::User);
        assert_eq!(action.args[0].name.as_deref(), Some("stats"));
        assert_eq!(action.args[0].value, 2);
        // Pass-by-pointer is allowed for user-csv columns.
        assert!(compile_action("call f(&stats[2])@x").is_ok());
    }
}
