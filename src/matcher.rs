//! Match evaluation: attribute extraction, expression evaluation, and rule
//! dispatch.
//!
//! Evaluation is short-circuiting and side-effect free apart from the
//! deterministic RNG behind the `random` attribute and the CSV record
//! binding threaded through `Binding`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::csv::CsvRecord;
use crate::lang::{
    MatchCmp, MatchExpr, MatchField, MatchKind, MatchTest, MatchValue, Rule, TestPayload,
};
use crate::plugin::PluginRegistry;
use crate::{Access, Error, Instruction, OpKind, Result};

/// Fixed RNG seed: the `random` attribute draws a deterministic stream.
pub const RANDOM_SEED: u64 = 0xE9E9_E9E9;

/// CSV record binding accumulated during one evaluation.
///
/// Only equality tests whose value set came from `basename` may bind; two
/// distinct records binding in one evaluation is a fatal ambiguity.
#[derive(Default)]
pub struct Binding<'a> {
    pub basename: Option<&'a str>,
    pub record: Option<Rc<CsvRecord>>,
}

/// The match engine.
pub struct Matcher {
    rng: RefCell<StdRng>,
}

impl Default for Matcher {
    fn default() -> Self {
        Matcher::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Matcher {
            rng: RefCell::new(StdRng::seed_from_u64(RANDOM_SEED)),
        }
    }

    /// Next value of the deterministic random stream (non-negative).
    pub fn random(&self) -> i64 {
        (self.rng.borrow_mut().next_u32() >> 1) as i64
    }

    /// Extract the typed value of a test's attribute for `insn`.
    pub fn value(
        &self,
        plugins: &PluginRegistry,
        test: &MatchTest,
        insn: &Instruction,
        offset: i64,
    ) -> MatchValue {
        match test.kind {
            MatchKind::Plugin => {
                let result = test.plugin.map(|id| plugins.get(id).result()).unwrap_or(0);
                MatchValue::Integer(result)
            }
            MatchKind::Random => MatchValue::Integer(self.random()),
            kind => attribute_value(kind, test.idx, test.field, insn, offset),
        }
    }

    /// Evaluate a match expression.
    pub fn eval(
        &self,
        plugins: &PluginRegistry,
        expr: &MatchExpr,
        insn: &Instruction,
        offset: i64,
        binding: &mut Binding,
    ) -> Result<bool> {
        match expr {
            MatchExpr::Not(inner) => {
                // Bindings do not propagate through negation.
                let mut scratch = Binding::default();
                Ok(!self.eval(plugins, inner, insn, offset, &mut scratch)?)
            }
            MatchExpr::And(lhs, rhs) => {
                if !self.eval(plugins, lhs, insn, offset, binding)? {
                    return Ok(false);
                }
                self.eval(plugins, rhs, insn, offset, binding)
            }
            MatchExpr::Or(lhs, rhs) => {
                if self.eval(plugins, lhs, insn, offset, binding)? {
                    return Ok(true);
                }
                self.eval(plugins, rhs, insn, offset, binding)
            }
            MatchExpr::Test(test) => self.eval_test(plugins, test, insn, offset, binding),
        }
    }

    fn eval_test(
        &self,
        plugins: &PluginRegistry,
        test: &MatchTest,
        insn: &Instruction,
        offset: i64,
        binding: &mut Binding,
    ) -> Result<bool> {
        match test.kind {
            MatchKind::Assembly | MatchKind::Mnemonic => {
                if test.cmp == MatchCmp::Defined {
                    return Ok(true);
                }
                let text = match test.kind {
                    MatchKind::Assembly => insn.assembly(),
                    _ => insn.mnemonic.clone(),
                };
                let TestPayload::Regex(regex) = &test.payload else {
                    return Ok(false);
                };
                let pass = regex.is_match(&text);
                Ok(if test.cmp == MatchCmp::Neq { !pass } else { pass })
            }
            MatchKind::Reads | MatchKind::Writes | MatchKind::Regs => {
                if test.cmp == MatchCmp::Defined {
                    return Ok(true);
                }
                let TestPayload::Registers(regs) = &test.payload else {
                    return Ok(false);
                };
                let mut pass = false;
                if test.kind != MatchKind::Writes {
                    pass = insn.regs_read.iter().any(|r| regs.contains(r));
                }
                if !pass && test.kind != MatchKind::Reads {
                    pass = insn.regs_write.iter().any(|r| regs.contains(r));
                }
                Ok(pass)
            }
            _ => self.eval_value_test(plugins, test, insn, offset, binding),
        }
    }

    fn eval_value_test(
        &self,
        plugins: &PluginRegistry,
        test: &MatchTest,
        insn: &Instruction,
        offset: i64,
        binding: &mut Binding,
    ) -> Result<bool> {
        let (values, test_basename) = match &test.payload {
            TestPayload::Values { basename, index } => (Some(index), basename.as_deref()),
            _ => (None, None),
        };
        if !matches!(
            test.cmp,
            MatchCmp::EqZero | MatchCmp::NeqZero | MatchCmp::Defined
        ) && values.is_none_or(|v| v.is_empty())
        {
            return Ok(false);
        }

        let x = self.value(plugins, test, insn, offset);
        let mut pass = match test.cmp {
            MatchCmp::Defined => true,
            MatchCmp::EqZero => matches!(x, MatchValue::Integer(0)),
            MatchCmp::NeqZero => matches!(x, MatchValue::Integer(i) if i != 0),
            MatchCmp::Eq => values.unwrap().contains_key(&x),
            MatchCmp::Neq => {
                let values = values.unwrap();
                if values.len() == 1 {
                    !values.contains_key(&x)
                } else {
                    // Inequality against a larger set is a tautology.
                    true
                }
            }
            MatchCmp::Lt | MatchCmp::Leq => {
                let max = *values.unwrap().keys().next_back().unwrap();
                match (test.cmp, x.compare(max)) {
                    (MatchCmp::Lt, Some(Ordering::Less)) => true,
                    (MatchCmp::Leq, Some(Ordering::Less | Ordering::Equal)) => true,
                    _ => false,
                }
            }
            MatchCmp::Gt | MatchCmp::Geq => {
                let min = *values.unwrap().keys().next().unwrap();
                match (test.cmp, x.compare(min)) {
                    (MatchCmp::Gt, Some(Ordering::Greater)) => true,
                    (MatchCmp::Geq, Some(Ordering::Greater | Ordering::Equal)) => true,
                    _ => false,
                }
            }
            MatchCmp::In => false,
        };
        if x.is_undefined() {
            pass = false;
        }

        // Bind the CSV record behind a successful equality hit.
        if pass && test.cmp == MatchCmp::Eq {
            if let (Some(eval_basename), Some(test_basename)) = (binding.basename, test_basename) {
                if eval_basename == test_basename {
                    if let Some(Some(record)) = values.unwrap().get(&x) {
                        match &binding.record {
                            Some(prev) if !Rc::ptr_eq(prev, record) => {
                                return Err(Error::AmbiguousRecord {
                                    basename: test_basename.to_string(),
                                });
                            }
                            Some(_) => {}
                            None => binding.record = Some(Rc::clone(record)),
                        }
                    }
                }
            }
        }
        Ok(pass)
    }

    /// Return the index of the first rule whose match expression passes.
    pub fn dispatch(
        &self,
        plugins: &PluginRegistry,
        rules: &[Rule],
        insn: &Instruction,
        offset: i64,
    ) -> Result<Option<usize>> {
        for (idx, rule) in rules.iter().enumerate() {
            let mut binding = Binding::default();
            if self.eval(plugins, &rule.matching, insn, offset, &mut binding)? {
                debug!(
                    "{:#x} [{}]: action {}",
                    insn.address,
                    insn.assembly(),
                    rule.action.source
                );
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

/// Extract a plain attribute value (everything except `plugin` and
/// `random`, which need engine state).
pub fn attribute_value(
    kind: MatchKind,
    idx: Option<u8>,
    field: MatchField,
    insn: &Instruction,
    offset: i64,
) -> MatchValue {
    let (kind_filter, access_filter) = operand_filters(kind);
    match kind {
        MatchKind::True => MatchValue::Integer(1),
        MatchKind::False => MatchValue::Integer(0),
        MatchKind::Address => MatchValue::Integer(insn.address as i64),
        MatchKind::Call => MatchValue::Integer(insn.call as i64),
        MatchKind::Jump => MatchValue::Integer(insn.jump as i64),
        MatchKind::Return => MatchValue::Integer(insn.ret as i64),
        MatchKind::Offset => MatchValue::Integer(offset),
        MatchKind::Size => MatchValue::Integer(insn.size as i64),
        MatchKind::Op
        | MatchKind::Src
        | MatchKind::Dst
        | MatchKind::Imm
        | MatchKind::Reg
        | MatchKind::Mem => {
            let Some(idx) = idx else {
                // `op.size` is the (filtered) operand count.
                return match field {
                    MatchField::Size => MatchValue::Integer(count_operands(
                        insn,
                        kind_filter,
                        access_filter,
                    )),
                    _ => MatchValue::Undefined,
                };
            };
            let Some(op) = select_operand(insn, idx, kind_filter, access_filter) else {
                return MatchValue::Undefined;
            };
            operand_field(op, field, insn)
        }
        _ => MatchValue::Undefined,
    }
}

fn operand_filters(kind: MatchKind) -> (Option<OpKind>, Access) {
    match kind {
        MatchKind::Src => (None, Access::READ),
        MatchKind::Dst => (None, Access::WRITE),
        MatchKind::Imm => (Some(OpKind::Imm), Access::RW),
        MatchKind::Reg => (Some(OpKind::Reg), Access::RW),
        MatchKind::Mem => (Some(OpKind::Mem), Access::RW),
        _ => (None, Access::RW),
    }
}

/// Pick the `idx`-th operand passing the kind/access filters.  Immediate
/// operands always count as readable.
fn select_operand(
    insn: &Instruction,
    idx: u8,
    kind: Option<OpKind>,
    access: Access,
) -> Option<&crate::Operand> {
    let mut remaining = idx as usize;
    for op in &insn.operands {
        if kind.is_none_or(|k| op.kind() == k)
            && (op.access.intersects(access) || (op.kind() == OpKind::Imm && access.is_read()))
        {
            if remaining == 0 {
                return Some(op);
            }
            remaining -= 1;
        }
    }
    None
}

fn count_operands(insn: &Instruction, kind: Option<OpKind>, access: Access) -> i64 {
    insn.operands
        .iter()
        .filter(|op| {
            kind.is_none_or(|k| op.kind() == k)
                && (op.access.intersects(access)
                    || (op.kind() == OpKind::Imm && access.is_read()))
        })
        .count() as i64
}

fn operand_field(op: &crate::Operand, field: MatchField, insn: &Instruction) -> MatchValue {
    match field {
        MatchField::None => match op.value {
            crate::OperandValue::Imm(imm) => MatchValue::Integer(imm),
            crate::OperandValue::Reg(reg) => MatchValue::Register(reg),
            crate::OperandValue::Mem(_) => MatchValue::Memory,
        },
        MatchField::Size => MatchValue::Integer(op.size as i64),
        MatchField::Type => MatchValue::Operand(op.kind()),
        MatchField::Access => {
            if op.kind() == OpKind::Imm {
                return MatchValue::Access(Access::READ);
            }
            let mut access = op.access;
            // Disassembler workaround: lea/nop memory operands perform no
            // actual access.
            if op.kind() == OpKind::Mem && (starts_like(insn, "lea") || starts_like(insn, "nop")) {
                access = Access::NONE;
            }
            MatchValue::Access(access)
        }
        MatchField::Segment => mem_register(op, |m| m.segment),
        MatchField::Base => mem_register(op, |m| m.base),
        MatchField::Index => mem_register(op, |m| m.index),
        MatchField::Displ => match op.mem() {
            Some(mem) => MatchValue::Integer(mem.disp as i64),
            None => MatchValue::Undefined,
        },
        MatchField::Scale => match op.mem() {
            Some(mem) => MatchValue::Integer(mem.scale as i64),
            None => MatchValue::Undefined,
        },
    }
}

fn mem_register(
    op: &crate::Operand,
    select: impl Fn(&crate::MemRef) -> Option<crate::regs::Register>,
) -> MatchValue {
    match op.mem() {
        Some(mem) => match select(mem) {
            Some(reg) => MatchValue::Register(reg),
            None => MatchValue::Nil,
        },
        None => MatchValue::Undefined,
    }
}

fn starts_like(insn: &Instruction, prefix: &str) -> bool {
    insn.mnemonic.to_lowercase().starts_with(prefix)
}
