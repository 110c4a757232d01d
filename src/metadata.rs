//! Call-trampoline metadata: one opaque descriptor per call argument,
//! attached to the `patch` message for the site.

use log::warn;
use serde_json::{json, Value};

use crate::csv;
use crate::elf::{ElfImage, Lookup};
use crate::lang::{ActionKind, Argument, ArgumentKind, MatchKind, MatchValue, Rule};
use crate::matcher::{attribute_value, Binding, Matcher};
use crate::plugin::PluginRegistry;
use crate::{Instruction, OperandValue, Result};

/// Build the metadata array for a call action at a patch site.  Non-call
/// actions carry no metadata.
pub fn build_metadata(
    matcher: &Matcher,
    plugins: &PluginRegistry,
    elf: &ElfImage,
    rule: &Rule,
    insn: &Instruction,
    offset: i64,
    id: i64,
) -> Result<Value> {
    let ActionKind::Call { args, .. } = &rule.action.kind else {
        return Ok(Value::Array(Vec::new()));
    };
    let mut descriptors = Vec::with_capacity(args.len());
    for arg in args {
        let value = argument_value(matcher, plugins, elf, rule, arg, insn, offset, id)?;
        descriptors.push(json!({
            "arg": arg.to_string(),
            "ptr": arg.ptr,
            "duplicate": arg.duplicate,
            "value": value,
        }));
    }
    Ok(Value::Array(descriptors))
}

fn argument_value(
    matcher: &Matcher,
    plugins: &PluginRegistry,
    elf: &ElfImage,
    rule: &Rule,
    arg: &Argument,
    insn: &Instruction,
    offset: i64,
    id: i64,
) -> Result<Value> {
    let value = match arg.kind {
        ArgumentKind::Asm => json!(insn.assembly()),
        ArgumentKind::AsmLen => json!(insn.assembly().len()),
        // String size includes the terminator.
        ArgumentKind::AsmSize => json!(insn.assembly().len() + 1),
        ArgumentKind::Addr | ArgumentKind::StaticAddr => json!(insn.address),
        ArgumentKind::Base => json!(elf.base()),
        ArgumentKind::Bytes => json!(hex_bytes(insn)),
        ArgumentKind::BytesSize => json!(insn.size),
        ArgumentKind::Id => json!(id),
        ArgumentKind::Integer => json!(arg.value),
        ArgumentKind::MemOp => json!(arg.memop.expect("memop literal").to_string()),
        ArgumentKind::Next => json!(insn.next_address()),
        ArgumentKind::Offset => json!(offset),
        ArgumentKind::Random => json!(matcher.random()),
        ArgumentKind::Register => json!(arg.register.expect("register argument").name()),
        ArgumentKind::State => json!("state"),
        ArgumentKind::Trampoline => json!("trampoline"),
        ArgumentKind::Target => branch_target(insn),
        ArgumentKind::Symbol => {
            let name = arg.name.as_deref().unwrap_or("");
            match elf.lookup(name) {
                Lookup::Addr(addr) => json!(addr),
                _ => {
                    warn!("symbol \"{name}\" is undefined and therefore has value 0x0");
                    json!(0)
                }
            }
        }
        ArgumentKind::Op
        | ArgumentKind::Src
        | ArgumentKind::Dst
        | ArgumentKind::Imm
        | ArgumentKind::Reg
        | ArgumentKind::Mem => {
            let kind = match arg.kind {
                ArgumentKind::Op => MatchKind::Op,
                ArgumentKind::Src => MatchKind::Src,
                ArgumentKind::Dst => MatchKind::Dst,
                ArgumentKind::Imm => MatchKind::Imm,
                ArgumentKind::Reg => MatchKind::Reg,
                _ => MatchKind::Mem,
            };
            let value = attribute_value(kind, Some(arg.value as u8), arg.field, insn, offset);
            match_value_json(value)
        }
        ArgumentKind::User => user_value(matcher, plugins, rule, arg, insn, offset)?,
    };
    Ok(value)
}

/// Resolve a user CSV column: re-evaluate the rule's match expression with
/// record binding enabled for the argument's basename.
fn user_value(
    matcher: &Matcher,
    plugins: &PluginRegistry,
    rule: &Rule,
    arg: &Argument,
    insn: &Instruction,
    offset: i64,
) -> Result<Value> {
    let basename = arg.name.as_deref().unwrap_or("");
    let mut binding = Binding {
        basename: Some(basename),
        record: None,
    };
    matcher.eval(plugins, &rule.matching, insn, offset, &mut binding)?;
    let Some(record) = binding.record else {
        warn!(
            "no record of \"{basename}.csv\" is bound at {:#x}; user value defaults to nil",
            insn.address
        );
        return Ok(Value::Null);
    };
    let Ok(column) = usize::try_from(arg.value) else {
        return Ok(Value::Null);
    };
    match record.get(column) {
        Some(cell) => Ok(match csv::parse_int(cell) {
            Some(i) => json!(i),
            None => json!(cell),
        }),
        None => Ok(Value::Null),
    }
}

fn match_value_json(value: MatchValue) -> Value {
    match value {
        MatchValue::Undefined | MatchValue::Nil => Value::Null,
        MatchValue::Integer(i) => json!(i),
        MatchValue::Operand(kind) => json!(kind.to_string()),
        MatchValue::Access(access) => json!(access.to_string()),
        MatchValue::Register(reg) => json!(reg.name()),
        MatchValue::Memory => json!("mem"),
    }
}

fn hex_bytes(insn: &Instruction) -> String {
    insn.bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Immediate branch/call target, when the instruction has one.
fn branch_target(insn: &Instruction) -> Value {
    if !(insn.call || insn.jump) {
        return Value::Null;
    }
    insn.operands
        .iter()
        .find_map(|op| match op.value {
            OperandValue::Imm(target) => Some(json!(target)),
            _ => None,
        })
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{
        Action, MatchCmp, MatchExpr, MatchField, MatchTest, TestPayload, ValueIndex,
    };
    use crate::lang::CallSite;
    use crate::regs::Register;
    use crate::{Access, Operand};
    use std::rc::Rc;

    fn call_rule(args: Vec<Argument>, matching: MatchExpr) -> Rule {
        Rule {
            matching,
            action: Action {
                kind: ActionKind::Call {
                    symbol: "hook".to_string(),
                    filename: "libhook.so".to_string(),
                    args,
                    clean: true,
                    site: CallSite::Before,
                },
                name: "call_clean_before_hook_libhook.so".to_string(),
                source: "call hook@libhook.so".to_string(),
            },
        }
    }

    fn arg(kind: ArgumentKind) -> Argument {
        Argument {
            kind,
            field: MatchField::None,
            ptr: false,
            duplicate: false,
            value: 0,
            memop: None,
            name: None,
            register: None,
        }
    }

    fn true_expr() -> MatchExpr {
        MatchExpr::Test(MatchTest {
            kind: crate::lang::MatchKind::True,
            idx: None,
            field: MatchField::None,
            cmp: MatchCmp::NeqZero,
            plugin: None,
            payload: TestPayload::None,
        })
    }

    fn test_insn() -> Instruction {
        Instruction {
            address: 0x401000,
            size: 2,
            mnemonic: "xor".to_string(),
            op_str: "eax, eax".to_string(),
            bytes: [0x31, 0xc0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            operands: vec![Operand {
                value: crate::OperandValue::Reg(Register::Eax),
                access: Access::RW,
                size: 4,
            }],
            ..Instruction::default()
        }
    }

    fn build(args: Vec<Argument>, matching: MatchExpr, insn: &Instruction) -> Value {
        let matcher = Matcher::new();
        let plugins = PluginRegistry::new();
        let elf = ElfImage::open("/bin/ls", 0).expect("test binary");
        let rule = call_rule(args, matching);
        build_metadata(&matcher, &plugins, &elf, &rule, insn, 0x1000, 3).unwrap()
    }

    #[test]
    fn test_basic_descriptors() {
        let insn = test_insn();
        let metadata = build(
            vec![
                arg(ArgumentKind::Addr),
                arg(ArgumentKind::BytesSize),
                arg(ArgumentKind::Offset),
                arg(ArgumentKind::Next),
                arg(ArgumentKind::Id),
                arg(ArgumentKind::Asm),
            ],
            true_expr(),
            &insn,
        );
        let list = metadata.as_array().unwrap();
        assert_eq!(list[0]["value"], 0x401000);
        assert_eq!(list[1]["value"], 2);
        assert_eq!(list[2]["value"], 0x1000);
        assert_eq!(list[3]["value"], 0x401002);
        assert_eq!(list[4]["value"], 3);
        assert_eq!(list[5]["value"], "xor eax, eax");
    }

    #[test]
    fn test_operand_descriptor() {
        let insn = test_insn();
        let metadata = build(vec![arg(ArgumentKind::Op)], true_expr(), &insn);
        assert_eq!(metadata[0]["value"], "eax");
        assert_eq!(metadata[0]["arg"], "op[0]");
    }

    #[test]
    fn test_bytes_descriptor() {
        let insn = test_insn();
        let metadata = build(vec![arg(ArgumentKind::Bytes)], true_expr(), &insn);
        assert_eq!(metadata[0]["value"], "31 c0");
    }

    #[test]
    fn test_missing_operand_is_null() {
        let insn = test_insn();
        let mut a = arg(ArgumentKind::Op);
        a.value = 5;
        let metadata = build(vec![a], true_expr(), &insn);
        assert_eq!(metadata[0]["value"], Value::Null);
    }

    #[test]
    fn test_user_argument_binds_record() {
        let insn = test_insn();
        let record = Rc::new(vec!["0x401000".to_string(), "labeled".to_string()]);
        let mut index = ValueIndex::new();
        index.insert(MatchValue::Integer(0x401000), Some(record));
        let matching = MatchExpr::Test(MatchTest {
            kind: crate::lang::MatchKind::Address,
            idx: None,
            field: MatchField::None,
            cmp: MatchCmp::Eq,
            plugin: None,
            payload: TestPayload::Values {
                basename: Some("sites".to_string()),
                index,
            },
        });
        let mut user = arg(ArgumentKind::User);
        user.name = Some("sites".to_string());
        user.value = 1;
        let metadata = build(vec![user], matching, &insn);
        assert_eq!(metadata[0]["value"], "labeled");
    }

    #[test]
    fn test_target_of_non_branch_is_null() {
        let insn = test_insn();
        let metadata = build(vec![arg(ArgumentKind::Target)], true_expr(), &insn);
        assert_eq!(metadata[0]["value"], Value::Null);
    }
}
