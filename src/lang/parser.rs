//! Recursive-descent parser for match expressions and actions.
//!
//! The grammar is LL(1) with one-token lookahead; regex literals and
//! filenames are lexed in dedicated raw modes.  Parsing has two side
//! effects: plugins named by `plugin(...)` tests/actions are opened through
//! the registry, and CSV value lists are loaded and indexed.

use std::collections::BTreeSet;

use log::warn;
use regex::Regex;

use crate::csv::{self, CsvStore};
use crate::elf::{ElfImage, Lookup};
use crate::lang::lexer::{Lexer, Token};
use crate::lang::{
    ty, Action, ActionKind, Argument, ArgumentKind, CallSite, MatchCmp, MatchExpr, MatchField,
    MatchKind, MatchTest, MatchValue, MemOpLiteral, TestPayload, ValueIndex,
};
use crate::plugin::PluginRegistry;
use crate::regs::Register;
use crate::{OpKind, Result};

/// Shared parser context.  `detail` accumulates across all parsed rules and
/// tells the orchestrator whether the decoder needs operand/group detail.
pub struct ParseCtx<'a> {
    pub elf: &'a ElfImage,
    pub plugins: &'a mut PluginRegistry,
    pub csv: &'a mut CsvStore,
    pub detail: bool,
}

impl<'a> ParseCtx<'a> {
    pub fn new(elf: &'a ElfImage, plugins: &'a mut PluginRegistry, csv: &'a mut CsvStore) -> Self {
        ParseCtx {
            elf,
            plugins,
            csv,
            detail: false,
        }
    }
}

/// Parse one `--match` string.
pub fn parse_match(ctx: &mut ParseCtx, input: &str) -> Result<MatchExpr> {
    let mut lexer = Lexer::new(input, "matching");
    let expr = parse_or_expr(ctx, &mut lexer)?;
    lexer.expect(Token::End)?;
    Ok(expr)
}

fn parse_or_expr(ctx: &mut ParseCtx, lexer: &mut Lexer) -> Result<MatchExpr> {
    let mut expr = parse_and_expr(ctx, lexer)?;
    while lexer.peek()? == Token::Or {
        lexer.next_token()?;
        let rhs = parse_and_expr(ctx, lexer)?;
        expr = MatchExpr::Or(Box::new(expr), Box::new(rhs));
    }
    Ok(expr)
}

fn parse_and_expr(ctx: &mut ParseCtx, lexer: &mut Lexer) -> Result<MatchExpr> {
    let mut expr = parse_test_expr(ctx, lexer)?;
    while lexer.peek()? == Token::And {
        lexer.next_token()?;
        let rhs = parse_test_expr(ctx, lexer)?;
        expr = MatchExpr::And(Box::new(expr), Box::new(rhs));
    }
    Ok(expr)
}

fn parse_test_expr(ctx: &mut ParseCtx, lexer: &mut Lexer) -> Result<MatchExpr> {
    match lexer.peek()? {
        Token::LParen => {
            lexer.next_token()?;
            let expr = parse_or_expr(ctx, lexer)?;
            lexer.expect(Token::RParen)?;
            Ok(expr)
        }
        Token::Bang | Token::Not => {
            lexer.next_token()?;
            let expr = parse_or_expr(ctx, lexer)?;
            Ok(MatchExpr::Not(Box::new(expr)))
        }
        _ => Ok(MatchExpr::Test(parse_test(ctx, lexer)?)),
    }
}

/// Parse a single test predicate.
fn parse_test(ctx: &mut ParseCtx, lexer: &mut Lexer) -> Result<MatchTest> {
    let mut cmp: Option<MatchCmp> = None;
    let mut type_mask = ty::INTEGER;
    let mut regs = BTreeSet::new();

    let mut t = lexer.next_token()?;
    if t == Token::Defined {
        lexer.expect(Token::LParen)?;
        cmp = Some(MatchCmp::Defined);
        t = lexer.next_token()?;
    }

    let kind = match t {
        Token::Asm => {
            type_mask = ty::STRING;
            MatchKind::Assembly
        }
        Token::Mnemonic => {
            type_mask = ty::STRING;
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
        Token::RegAttr => MatchKind::Reg,
        Token::Return => MatchKind::Return,
        Token::Size | Token::Length => MatchKind::Size,
        Token::Src => MatchKind::Src,
        Token::True => MatchKind::True,
        Token::Reg(reg) => {
            // Register set: `rax,rbx in reads`
            cmp = Some(MatchCmp::In);
            regs.insert(reg);
            while lexer.peek()? == Token::Comma {
                lexer.next_token()?;
                match lexer.next_token()? {
                    Token::Reg(reg) => {
                        regs.insert(reg);
                    }
                    token => return Err(lexer.unexpected(&token)),
                }
            }
            lexer.expect(Token::In)?;
            match lexer.next_token()? {
                Token::Regs => MatchKind::Regs,
                Token::Reads => MatchKind::Reads,
                Token::Writes => MatchKind::Writes,
                token => return Err(lexer.unexpected(&token)),
            }
        }
        token => return Err(lexer.unexpected(&token)),
    };

    let mut plugin = None;
    let mut idx: Option<u8> = None;
    let mut field = MatchField::None;
    match kind {
        MatchKind::Plugin => {
            lexer.expect(Token::LParen)?;
            let filename = lexer.expect_string()?;
            lexer.expect(Token::RParen)?;
            lexer.expect(Token::Dot)?;
            lexer.expect(Token::Match)?;
            lexer.expect(Token::LParen)?;
            lexer.expect(Token::RParen)?;
            let id = ctx.plugins.open(&filename)?;
            if !ctx.plugins.get(id).has_match() {
                return Err(lexer.error(format!(
                    "plugin \"{}\" does not export the \"graft_plugin_match\" function",
                    ctx.plugins.get(id).path.display()
                )));
            }
            plugin = Some(id);
        }
        MatchKind::Op
        | MatchKind::Src
        | MatchKind::Dst
        | MatchKind::Imm
        | MatchKind::Reg
        | MatchKind::Mem => {
            match lexer.peek()? {
                Token::Dot => {}
                Token::LBracket => idx = Some(parse_index(lexer, 0, 7)? as u8),
                token => return Err(lexer.unexpected(&token)),
            }
            if lexer.peek()? == Token::Dot {
                lexer.next_token()?;
                let mut need_idx = true;
                field = match lexer.next_token()? {
                    Token::Type => {
                        type_mask = ty::OPERAND;
                        MatchField::Type
                    }
                    Token::Access => {
                        type_mask = ty::ACCESS;
                        MatchField::Access
                    }
                    Token::Size | Token::Length => {
                        need_idx = false;
                        MatchField::Size
                    }
                    Token::Segment => {
                        type_mask = ty::REGISTER | ty::NIL;
                        MatchField::Segment
                    }
                    Token::Displ => MatchField::Displ,
                    Token::Base => {
                        type_mask = ty::REGISTER | ty::NIL;
                        MatchField::Base
                    }
                    Token::Index => {
                        type_mask = ty::REGISTER | ty::NIL;
                        MatchField::Index
                    }
                    Token::Scale => MatchField::Scale,
                    token => return Err(lexer.unexpected(&token)),
                };
                if need_idx && idx.is_none() {
                    return Err(lexer.error(format!(
                        "attribute field `{field}' requires an operand index"
                    )));
                }
            } else if idx.is_some() {
                type_mask = ty::INTEGER | ty::REGISTER;
            }
        }
        _ => {}
    }

    let cmp = match cmp {
        Some(MatchCmp::Defined) => {
            lexer.expect(Token::RParen)?;
            MatchCmp::Defined
        }
        Some(cmp) => cmp,
        None => {
            let op = match lexer.peek()? {
                Token::Eq => Some(MatchCmp::Eq),
                Token::Neq => Some(MatchCmp::Neq),
                Token::Lt => Some(MatchCmp::Lt),
                Token::Leq => Some(MatchCmp::Leq),
                Token::Gt => Some(MatchCmp::Gt),
                Token::Geq => Some(MatchCmp::Geq),
                _ => None,
            };
            match op {
                Some(op) => {
                    lexer.next_token()?;
                    op
                }
                // A bare attribute is an implicit != 0.
                None => MatchCmp::NeqZero,
            }
        }
    };

    if matches!(kind, MatchKind::Assembly | MatchKind::Mnemonic)
        && !matches!(cmp, MatchCmp::Eq | MatchCmp::Neq | MatchCmp::Defined)
    {
        return Err(
            lexer.error("invalid match comparison operator for a string attribute".to_string())
        );
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
        | MatchKind::Regs => ctx.detail = true,
        _ => {}
    }

    let payload = match cmp {
        MatchCmp::Defined => TestPayload::None,
        MatchCmp::In => TestPayload::Registers(regs),
        MatchCmp::EqZero | MatchCmp::NeqZero => TestPayload::None,
        _ if type_mask == ty::STRING => {
            let text = match lexer.next_regex()? {
                Token::Regex(text) | Token::Str(text) => text,
                token => return Err(lexer.unexpected(&token)),
            };
            // Whole-string semantics, like the classic regex_match.
            TestPayload::Regex(Regex::new(&format!("\\A(?:{text})\\z"))?)
        }
        _ => {
            let mut index = ValueIndex::new();
            let mut basename = None;
            if matches!(lexer.peek()?, Token::Str(_)) {
                let Token::Str(name) = lexer.next_token()? else {
                    unreachable!()
                };
                if type_mask & ty::INTEGER == 0 {
                    return Err(lexer.error(format!(
                        "a \"{name}\" file lookup cannot provide values for this attribute"
                    )));
                }
                let column = parse_index(lexer, i64::MIN, i64::MAX)?;
                let table = ctx.csv.load(&name)?;
                csv::build_int_index(table, column, &mut index)?;
                basename = Some(name);
            } else {
                parse_values(ctx, lexer, type_mask, cmp, &mut index)?;
            }
            TestPayload::Values { basename, index }
        }
    };

    Ok(MatchTest {
        kind,
        idx,
        field,
        cmp,
        plugin,
        payload,
    })
}

/// Parse a comma list of value atoms (comma lists only for `=`).
fn parse_values(
    ctx: &mut ParseCtx,
    lexer: &mut Lexer,
    type_mask: u8,
    cmp: MatchCmp,
    index: &mut ValueIndex,
) -> Result<()> {
    loop {
        let value = match lexer.next_token()? {
            Token::Amp => {
                let symbol = lexer.expect_string()?;
                MatchValue::Integer(parse_symbol(ctx.elf, lexer, &symbol)?)
            }
            Token::Nil => MatchValue::Nil,
            Token::Integer(i) => MatchValue::Integer(i),
            Token::Reg(reg) => MatchValue::Register(reg),
            Token::Imm => MatchValue::Operand(OpKind::Imm),
            Token::RegAttr => MatchValue::Operand(OpKind::Reg),
            Token::Mem => MatchValue::Operand(OpKind::Mem),
            Token::NoneKw => MatchValue::Access(crate::Access::NONE),
            Token::Read => MatchValue::Access(crate::Access::READ),
            Token::Write => MatchValue::Access(crate::Access::WRITE),
            Token::Rw => MatchValue::Access(crate::Access::RW),
            token => return Err(lexer.unexpected(&token)),
        };
        if type_mask & value.type_bit() == 0 {
            return Err(lexer.error(format!(
                "value `{value}' has the wrong type for this attribute"
            )));
        }
        index.entry(value).or_insert(None);
        if cmp != MatchCmp::Eq || lexer.peek()? != Token::Comma {
            return Ok(());
        }
        lexer.next_token()?;
    }
}

/// Resolve a `&symbol` value.  Undefined symbols warn and default to 0.
fn parse_symbol(elf: &ElfImage, lexer: &Lexer, symbol: &str) -> Result<i64> {
    match elf.lookup(symbol) {
        Lookup::Addr(addr) => Ok(addr as i64),
        Lookup::Undefined => {
            warn!("symbol \"{symbol}\" is undefined and therefore has value 0x0");
            Ok(0)
        }
        Lookup::Unknown => Err(lexer.error(format!(
            "\"{symbol}\" does not correspond to any section or symbol name"
        ))),
    }
}

/// Parse `[ INT ]` with an inclusive range check.
fn parse_index(lexer: &mut Lexer, lb: i64, ub: i64) -> Result<i64> {
    lexer.expect(Token::LBracket)?;
    let idx = lexer.expect_integer()?;
    lexer.expect(Token::RBracket)?;
    if idx < lb || idx > ub {
        return Err(lexer.error(format!(
            "expected index within the range {lb}..{ub}, found {idx}"
        )));
    }
    Ok(idx)
}

/// Parse a `mem8..mem64<seg:disp(base,index,scale)>` literal.
fn parse_mem_op(lexer: &mut Lexer, size_token: &Token) -> Result<MemOpLiteral> {
    let size: u8 = match size_token {
        Token::Mem8 => 1,
        Token::Mem16 => 2,
        Token::Mem32 => 4,
        Token::Mem64 => 8,
        token => return Err(lexer.unexpected(token)),
    };

    let mut lit = MemOpLiteral {
        size,
        segment: None,
        disp: 0,
        base: None,
        index: None,
        scale: 1,
    };
    let mut disp64: i64 = 0;
    let mut scale64: i64 = 1;

    lexer.expect(Token::Lt)?;
    if let Token::Reg(reg) = lexer.peek()? {
        lexer.next_token()?;
        lit.segment = Some(reg);
        lexer.expect(Token::Colon)?;
    }
    if matches!(lexer.peek()?, Token::Integer(_)) {
        disp64 = lexer.expect_integer()?;
    }
    if lexer.peek()? == Token::LParen {
        lexer.next_token()?;
        'memop: {
            // Base slot: empty, nil, or a register.
            match lexer.next_token()? {
                Token::Comma => {}
                Token::RParen => break 'memop,
                token @ (Token::Nil | Token::Reg(_)) => {
                    if let Token::Reg(reg) = token {
                        lit.base = Some(reg);
                    }
                    match lexer.next_token()? {
                        Token::RParen => break 'memop,
                        Token::Comma => {}
                        token => return Err(lexer.unexpected(&token)),
                    }
                }
                token => return Err(lexer.unexpected(&token)),
            }
            // Index slot.
            match lexer.next_token()? {
                Token::Comma => {}
                Token::RParen => break 'memop,
                token @ (Token::Nil | Token::Reg(_)) => {
                    if let Token::Reg(reg) = token {
                        lit.index = Some(reg);
                    }
                    match lexer.next_token()? {
                        Token::RParen => break 'memop,
                        Token::Comma => {}
                        token => return Err(lexer.unexpected(&token)),
                    }
                }
                token => return Err(lexer.unexpected(&token)),
            }
            // Scale.
            scale64 = lexer.expect_integer()?;
            lexer.expect(Token::RParen)?;
        }
    }
    lexer.expect(Token::Gt)?;

    if disp64 < i32::MIN as i64 || disp64 > i32::MAX as i64 {
        return Err(lexer.error(format!(
            "expected displacement within the range {}..{}, found {disp64}",
            i32::MIN,
            i32::MAX
        )));
    }
    if let Some(seg) = lit.segment {
        if !seg.is_segment() {
            return Err(lexer.error(format!("invalid memory operand segment register {seg}")));
        }
    }
    if let Some(base) = lit.base {
        if !base.is_base() {
            return Err(lexer.error(format!("invalid memory operand base register {base}")));
        }
    }
    if let Some(index) = lit.index {
        if !index.is_index() {
            return Err(lexer.error(format!("invalid memory operand index register {index}")));
        }
    }
    if !matches!(scale64, 1 | 2 | 4 | 8) {
        return Err(lexer.error(format!(
            "expected scale with value {{1,2,4,8}}, found {scale64}"
        )));
    }
    if lit.base == Some(Register::Rip) && (lit.index.is_some() || scale64 != 1) {
        return Err(lexer.error(
            "invalid memory operand with %rip base register and non-empty index/scale".to_string(),
        ));
    }
    lit.disp = disp64 as i32;
    lit.scale = scale64 as u8;
    Ok(lit)
}

/// Parse one `--action` string.
pub fn parse_action(ctx: &mut ParseCtx, input: &str) -> Result<Action> {
    let mut lexer = Lexer::new(input, "action");
    let (kind, name) = match lexer.next_token()? {
        Token::Trap => (ActionKind::Trap, "trap".to_string()),
        Token::Print => (ActionKind::Print, "print".to_string()),
        Token::Passthru => (ActionKind::Passthru, "passthru".to_string()),
        Token::Exit => {
            lexer.expect(Token::LParen)?;
            let status = lexer.expect_integer()?;
            if !(0..=255).contains(&status) {
                return Err(
                    lexer.error("exit status must be an integer within the range 0..255")
                );
            }
            lexer.expect(Token::RParen)?;
            (ActionKind::Exit(status as u8), format!("exit_{status}"))
        }
        Token::Plugin => {
            lexer.expect(Token::LParen)?;
            let filename = lexer.expect_string()?;
            lexer.expect(Token::RParen)?;
            lexer.expect(Token::Dot)?;
            lexer.expect(Token::Patch)?;
            lexer.expect(Token::LParen)?;
            lexer.expect(Token::RParen)?;
            let id = ctx.plugins.open(&filename)?;
            if !ctx.plugins.get(id).has_patch() {
                return Err(lexer.error(format!(
                    "plugin \"{}\" does not export the \"graft_plugin_patch\" function",
                    ctx.plugins.get(id).path.display()
                )));
            }
            ctx.detail = true;
            (ActionKind::Plugin(id), format!("plugin_{filename}"))
        }
        Token::Call => parse_call(ctx, &mut lexer)?,
        token => return Err(lexer.unexpected(&token)),
    };
    lexer.expect(Token::End)?;
    Ok(Action {
        kind,
        name,
        source: input.to_string(),
    })
}

fn parse_call(ctx: &mut ParseCtx, lexer: &mut Lexer) -> Result<(ActionKind, String)> {
    let mut clean = false;
    let mut naked = false;
    let mut before = false;
    let mut after = false;
    let mut replace = false;
    let mut conditional = false;
    let mut cond_jump = false;

    if lexer.peek()? == Token::LBracket {
        lexer.next_token()?;
        loop {
            match lexer.next_token()? {
                Token::After => after = true,
                Token::Before => before = true,
                Token::Clean => clean = true,
                Token::Naked => naked = true,
                Token::Replace => replace = true,
                Token::Conditional => {
                    if lexer.peek()? == Token::Dot {
                        lexer.next_token()?;
                        lexer.expect(Token::Jump)?;
                        cond_jump = true;
                    } else {
                        conditional = true;
                    }
                }
                token => return Err(lexer.unexpected(&token)),
            }
            match lexer.next_token()? {
                Token::RBracket => break,
                Token::Comma => {}
                token => return Err(lexer.unexpected(&token)),
            }
        }
    }

    let symbol = lexer.expect_string()?;

    let mut args: Vec<Argument> = Vec::new();
    if lexer.peek()? == Token::LParen {
        lexer.next_token()?;
        if lexer.peek()? == Token::RParen {
            lexer.next_token()?;
        } else {
            loop {
                let arg = parse_argument(ctx, lexer, &args)?;
                args.push(arg);
                match lexer.next_token()? {
                    Token::RParen => break,
                    Token::Comma => {}
                    token => return Err(lexer.unexpected(&token)),
                }
            }
        }
    }

    lexer.expect(Token::At)?;
    let filename = lexer.rest()?;

    if clean && naked {
        return Err(
            lexer.error("`clean' and `naked' attributes cannot be used together")
        );
    }
    if [before, after, replace, conditional, cond_jump]
        .iter()
        .filter(|&&b| b)
        .count()
        > 1
    {
        return Err(lexer.error(
            "only one of the `before', `after', `replace', `conditional' and `conditional.jump' \
             attributes can be used together",
        ));
    }
    let clean = if clean { true } else { !naked };
    let site = if after {
        CallSite::After
    } else if replace {
        CallSite::Replace
    } else if conditional {
        CallSite::Conditional
    } else if cond_jump {
        CallSite::ConditionalJump
    } else {
        CallSite::Before
    };

    let name = format!(
        "call_{}_{}_{}_{}",
        if clean { "clean" } else { "naked" },
        site,
        symbol,
        filename
    );
    Ok((
        ActionKind::Call {
            symbol,
            filename,
            args,
            clean,
            site,
        },
        name,
    ))
}

fn parse_argument(ctx: &mut ParseCtx, lexer: &mut Lexer, prev: &[Argument]) -> Result<Argument> {
    let mut t = lexer.next_token()?;
    let mut ptr = false;
    if t == Token::Amp {
        ptr = true;
        t = lexer.next_token()?;
    }

    let mut field = MatchField::None;
    let mut value: i64 = 0;
    let mut memop = None;
    let mut name = None;
    let mut register = None;

    let kind = match &t {
        Token::Asm => {
            if lexer.peek()? == Token::Dot {
                lexer.next_token()?;
                match lexer.next_token()? {
                    Token::Length => ArgumentKind::AsmLen,
                    Token::Size => ArgumentKind::AsmSize,
                    token => return Err(lexer.unexpected(&token)),
                }
            } else {
                ArgumentKind::Asm
            }
        }
        Token::Addr => ArgumentKind::Addr,
        Token::Base => ArgumentKind::Base,
        Token::Dst => ArgumentKind::Dst,
        Token::Id => ArgumentKind::Id,
        Token::Imm => ArgumentKind::Imm,
        Token::Instr => ArgumentKind::Bytes,
        Token::Mem => ArgumentKind::Mem,
        Token::Mem8 | Token::Mem16 | Token::Mem32 | Token::Mem64 => {
            memop = Some(parse_mem_op(lexer, &t)?);
            ArgumentKind::MemOp
        }
        Token::Next => {
            ctx.detail = true;
            ArgumentKind::Next
        }
        Token::Offset => ArgumentKind::Offset,
        Token::Op => ArgumentKind::Op,
        Token::Random => ArgumentKind::Random,
        Token::RegAttr => ArgumentKind::Reg,
        Token::Size | Token::Length => ArgumentKind::BytesSize,
        Token::State => ArgumentKind::State,
        Token::StaticAddr => ArgumentKind::StaticAddr,
        Token::Src => ArgumentKind::Src,
        Token::Target => {
            ctx.detail = true;
            ArgumentKind::Target
        }
        Token::Trampoline => ArgumentKind::Trampoline,
        Token::Reg(reg) => {
            register = Some(*reg);
            ArgumentKind::Register
        }
        Token::Integer(i) => {
            value = *i;
            ArgumentKind::Integer
        }
        Token::Str(s) => {
            name = Some(s.clone());
            if lexer.peek()? == Token::LBracket {
                ArgumentKind::User
            } else {
                ArgumentKind::Symbol
            }
        }
        token => return Err(lexer.unexpected(token)),
    };

    match kind {
        ArgumentKind::Op
        | ArgumentKind::Src
        | ArgumentKind::Dst
        | ArgumentKind::Imm
        | ArgumentKind::Reg
        | ArgumentKind::Mem => {
            ctx.detail = true;
            value = parse_index(lexer, 0, 7)?;
            if lexer.peek()? == Token::Dot {
                lexer.next_token()?;
                field = match lexer.next_token()? {
                    Token::Base => MatchField::Base,
                    Token::Index => MatchField::Index,
                    Token::Displ => MatchField::Displ,
                    Token::Scale => MatchField::Scale,
                    Token::Size | Token::Length => MatchField::Size,
                    Token::Type => MatchField::Type,
                    Token::Access => MatchField::Access,
                    token => return Err(lexer.unexpected(&token)),
                };
            }
        }
        ArgumentKind::User => {
            value = parse_index(lexer, i64::MIN, i64::MAX)?;
        }
        ArgumentKind::Symbol => {
            if !ptr {
                return Err(lexer.error(format!(
                    "symbol argument `{}' must be passed-by-pointer",
                    name.as_deref().unwrap_or("")
                )));
            }
        }
        _ => {}
    }

    // By-pointer is only for symbols and operand base/index sub-fields.
    let operand_ptr_field = matches!(
        kind,
        ArgumentKind::Op
            | ArgumentKind::Src
            | ArgumentKind::Dst
            | ArgumentKind::Imm
            | ArgumentKind::Reg
            | ArgumentKind::Mem
    ) && matches!(field, MatchField::Base | MatchField::Index);
    if ptr && kind != ArgumentKind::Symbol && !operand_ptr_field {
        return Err(lexer.error(format!("cannot pass argument `{t}' by pointer")));
    }

    let duplicate = prev.iter().any(|arg| arg.kind == kind);
    Ok(Argument {
        kind,
        field,
        ptr,
        duplicate,
        value,
        memop,
        name,
        register,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::ElfImage;
    use std::io::Write as _;

    fn test_elf() -> ElfImage {
        ElfImage::open("/bin/ls", 0).expect("test binary")
    }

    fn parse_match_str(input: &str) -> Result<MatchExpr> {
        let elf = test_elf();
        let mut plugins = PluginRegistry::new();
        let mut store = CsvStore::new();
        let mut ctx = ParseCtx::new(&elf, &mut plugins, &mut store);
        parse_match(&mut ctx, input)
    }

    fn parse_action_str(input: &str) -> Result<Action> {
        let elf = test_elf();
        let mut plugins = PluginRegistry::new();
        let mut store = CsvStore::new();
        let mut ctx = ParseCtx::new(&elf, &mut plugins, &mut store);
        parse_action(&mut ctx, input)
    }

    fn as_test(expr: &MatchExpr) -> &MatchTest {
        match expr {
            MatchExpr::Test(test) => test,
            other => panic!("expected a test, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_equality() {
        let expr = parse_match_str("addr = 0x401000").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.kind, MatchKind::Address);
        assert_eq!(test.cmp, MatchCmp::Eq);
        match &test.payload {
            TestPayload::Values { basename, index } => {
                assert!(basename.is_none());
                assert!(index.contains_key(&MatchValue::Integer(0x401000)));
            }
            other => panic!("bad payload {other:?}"),
        }
    }

    #[test]
    fn test_implicit_neq_zero() {
        let expr = parse_match_str("call").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.kind, MatchKind::Call);
        assert_eq!(test.cmp, MatchCmp::NeqZero);
    }

    #[test]
    fn test_and_or_precedence() {
        // or has lowest precedence: (a and b) or c
        let expr = parse_match_str("call and size = 5 or jump").unwrap();
        match expr {
            MatchExpr::Or(lhs, rhs) => {
                assert!(matches!(*lhs, MatchExpr::And(_, _)));
                assert!(matches!(*rhs, MatchExpr::Test(_)));
            }
            other => panic!("bad tree {other:?}"),
        }
    }

    #[test]
    fn test_not_consumes_rest() {
        // `not` negates the whole following expression.
        let expr = parse_match_str("not call and jump").unwrap();
        match expr {
            MatchExpr::Not(inner) => assert!(matches!(*inner, MatchExpr::And(_, _))),
            other => panic!("bad tree {other:?}"),
        }
    }

    #[test]
    fn test_parenthesized() {
        let expr = parse_match_str("(call or jump) and size = 1").unwrap();
        assert!(matches!(expr, MatchExpr::And(_, _)));
    }

    #[test]
    fn test_defined() {
        let expr = parse_match_str("defined(op[0].base)").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.cmp, MatchCmp::Defined);
        assert_eq!(test.field, MatchField::Base);
        assert_eq!(test.idx, Some(0));
    }

    #[test]
    fn test_operand_field_types() {
        let expr = parse_match_str("op[1].type = mem").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.field, MatchField::Type);
        match &test.payload {
            TestPayload::Values { index, .. } => {
                assert!(index.contains_key(&MatchValue::Operand(OpKind::Mem)));
            }
            other => panic!("bad payload {other:?}"),
        }
        // operand-kind literals are rejected where integers are expected
        assert!(parse_match_str("addr = mem").is_err());
    }

    #[test]
    fn test_op_size_without_index_is_operand_count() {
        let expr = parse_match_str("op.size = 2").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.field, MatchField::Size);
        assert_eq!(test.idx, None);
    }

    #[test]
    fn test_field_requires_index() {
        assert!(parse_match_str("op.base = rax").is_err());
        assert!(parse_match_str("op[0].base = rax").is_ok());
    }

    #[test]
    fn test_register_set_in() {
        let expr = parse_match_str("rax,rbx in reads").unwrap();
        let test = as_test(&expr);
        assert_eq!(test.kind, MatchKind::Reads);
        assert_eq!(test.cmp, MatchCmp::In);
        match &test.payload {
            TestPayload::Registers(regs) => {
                assert!(regs.contains(&Register::Rax));
                assert!(regs.contains(&Register::Rbx));
            }
            other => panic!("bad payload {other:?}"),
        }
    }

    #[test]
    fn test_mnemonic_regex() {
        let expr = parse_match_str("mnemonic = j.*").unwrap();
        let test = as_test(&expr);
        match &test.payload {
            TestPayload::Regex(regex) => {
                assert!(regex.is_match("jmp"));
                assert!(regex.is_match("jne"));
                // Whole-string match: no substring hits.
                assert!(!regex.is_match("adjmp"));
            }
            other => panic!("bad payload {other:?}"),
        }
    }

    #[test]
    fn test_string_attribute_rejects_relational() {
        assert!(parse_match_str("mnemonic < x").is_err());
    }

    #[test]
    fn test_operand_index_out_of_range() {
        assert!(parse_match_str("op[8] = 1").is_err());
    }

    #[test]
    fn test_comma_list_only_for_eq() {
        assert!(parse_match_str("size = 1,2,3").is_ok());
        assert!(parse_match_str("size < 1,2").is_err());
    }

    #[test]
    fn test_csv_value_list() {
        let dir = std::env::temp_dir();
        let base = dir.join(format!("graft_parse_csv_{}", std::process::id()));
        let path = base.with_extension("csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"0x1000,one\n0x2000,two\n").unwrap();

        let input = format!("addr = \"{}\"[0]", base.display());
        let expr = parse_match_str(&input).unwrap();
        let test = as_test(&expr);
        match &test.payload {
            TestPayload::Values { basename, index } => {
                assert_eq!(basename.as_deref(), Some(&*base.to_string_lossy()));
                assert!(index.contains_key(&MatchValue::Integer(0x1000)));
                assert!(index[&MatchValue::Integer(0x2000)].is_some());
            }
            other => panic!("bad payload {other:?}"),
        }
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_simple_actions() {
        assert!(matches!(
            parse_action_str("trap").unwrap().kind,
            ActionKind::Trap
        ));
        assert!(matches!(
            parse_action_str("print").unwrap().kind,
            ActionKind::Print
        ));
        let exit = parse_action_str("exit(7)").unwrap();
        assert!(matches!(exit.kind, ActionKind::Exit(7)));
        assert_eq!(exit.name, "exit_7");
    }

    #[test]
    fn test_exit_range() {
        assert!(parse_action_str("exit(256)").is_err());
        assert!(parse_action_str("exit(-1)").is_err());
    }

    #[test]
    fn test_call_action() {
        let action =
            parse_action_str("call[clean,after] hook(addr,&malloc,op[0])@libhook.so").unwrap();
        assert_eq!(action.name, "call_clean_after_hook_libhook.so");
        match &action.kind {
            ActionKind::Call {
                symbol,
                filename,
                args,
                clean,
                site,
            } => {
                assert_eq!(symbol, "hook");
                assert_eq!(filename, "libhook.so");
                assert!(*clean);
                assert_eq!(*site, CallSite::After);
                assert_eq!(args.len(), 3);
                assert_eq!(args[0].kind, ArgumentKind::Addr);
                assert_eq!(args[1].kind, ArgumentKind::Symbol);
                assert!(args[1].ptr);
                assert_eq!(args[2].kind, ArgumentKind::Op);
                assert_eq!(args[2].value, 0);
            }
            other => panic!("bad action {other:?}"),
        }
    }

    #[test]
    fn test_call_defaults() {
        let action = parse_action_str("call hook@libhook.so").unwrap();
        match &action.kind {
            ActionKind::Call { clean, site, args, .. } => {
                assert!(*clean, "default is clean");
                assert_eq!(*site, CallSite::Before);
                assert!(args.is_empty());
            }
            other => panic!("bad action {other:?}"),
        }
    }

    #[test]
    fn test_call_naked_name() {
        let action = parse_action_str("call[naked] f@a.so").unwrap();
        assert_eq!(action.name, "call_naked_before_f_a.so");
    }

    #[test]
    fn test_call_mod_conflicts() {
        assert!(parse_action_str("call[clean,naked] f@a.so").is_err());
        assert!(parse_action_str("call[before,after] f@a.so").is_err());
        assert!(parse_action_str("call[conditional.jump,replace] f@a.so").is_err());
    }

    #[test]
    fn test_symbol_argument_requires_pointer() {
        assert!(parse_action_str("call f(sym)@a.so").is_err());
        assert!(parse_action_str("call f(&sym)@a.so").is_ok());
    }

    #[test]
    fn test_pointer_only_for_base_index() {
        assert!(parse_action_str("call f(&op[0].base)@a.so").is_ok());
        assert!(parse_action_str("call f(&op[0].index)@a.so").is_ok());
        assert!(parse_action_str("call f(&op[0].scale)@a.so").is_err());
        assert!(parse_action_str("call f(&addr)@a.so").is_err());
    }

    #[test]
    fn test_user_csv_argument() {
        let action = parse_action_str("call f(stats[2])@a.so").unwrap();
        match &action.kind {
            ActionKind::Call { args, .. } => {
                assert_eq!(args[0].kind, ArgumentKind::User);
                assert_eq!(args[0].name.as_deref(), Some("stats"));
                assert_eq!(args[0].value, 2);
            }
            other => panic!("bad action {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_argument_flag() {
        let action = parse_action_str("call f(addr,addr)@a.so").unwrap();
        match &action.kind {
            ActionKind::Call { args, .. } => {
                assert!(!args[0].duplicate);
                assert!(args[1].duplicate);
            }
            other => panic!("bad action {other:?}"),
        }
    }

    #[test]
    fn test_memop_argument() {
        let action = parse_action_str("call f(mem64<fs:16(rax,rbx,4)>)@a.so").unwrap();
        match &action.kind {
            ActionKind::Call { args, .. } => {
                let memop = args[0].memop.unwrap();
                assert_eq!(memop.size, 8);
                assert_eq!(memop.segment, Some(Register::Fs));
                assert_eq!(memop.disp, 16);
                assert_eq!(memop.base, Some(Register::Rax));
                assert_eq!(memop.index, Some(Register::Rbx));
                assert_eq!(memop.scale, 4);
            }
            other => panic!("bad action {other:?}"),
        }
    }

    #[test]
    fn test_memop_sizes() {
        for (text, bytes) in [("mem8", 1u8), ("mem16", 2), ("mem32", 4), ("mem64", 8)] {
            let action = parse_action_str(&format!("call f({text}<(rax)>)@a.so")).unwrap();
            match &action.kind {
                ActionKind::Call { args, .. } => {
                    assert_eq!(args[0].memop.unwrap().size, bytes);
                }
                other => panic!("bad action {other:?}"),
            }
        }
    }

    #[test]
    fn test_memop_validation() {
        // rax is not a segment register
        assert!(parse_action_str("call f(mem8<rax:0(rbx)>)@a.so").is_err());
        // ah cannot be a base register
        assert!(parse_action_str("call f(mem8<(ah)>)@a.so").is_err());
        // rsp cannot be an index register
        assert!(parse_action_str("call f(mem8<(rax,rsp,1)>)@a.so").is_err());
        // scale must be 1,2,4,8
        assert!(parse_action_str("call f(mem8<(rax,rbx,3)>)@a.so").is_err());
        // rip with an index register
        assert!(parse_action_str("call f(mem8<(rip,rbx,1)>)@a.so").is_err());
        assert!(parse_action_str("call f(mem8<8(rip)>)@a.so").is_ok());
    }

    #[test]
    fn test_trailing_garbage_is_fatal() {
        assert!(parse_match_str("addr = 1 )").is_err());
        assert!(parse_action_str("trap trap").is_err());
    }
}
