//! Operand-stack reconstruction.
//!
//! The engine walks a segment's instructions once, keeping an explicit stack
//! of partially built nodes tagged with the indentation level they were
//! produced at. Nodes that are never consumed by a later instruction end up
//! as the statements of the segment, in order.
//!
//! Control flow is recovered from jump targets alone: loops and branches
//! open a level immediately and register a pending dedent at the offset where
//! they end.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::DedisError;
use crate::ast::{ImportedName, Node};
use crate::instruction::Instruction;
use crate::opcode::Opcode;

/// Temporary holding a comprehension's result container.
pub const ACCUMULATOR: &str = "__temp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    /// List/set/dict comprehension body: results go through the accumulator.
    pub comprehension: bool,
    /// Generator expression body.
    pub generator_expression: bool,
    /// Emit jumps as `goto` statements instead of recovering control flow.
    pub raw_jumps: bool,
}

impl Flags {
    /// Mode implied by a segment's name: `genexpr_*` bodies are generator
    /// expressions, `listcomp_*`, `setcomp_*` and `dictcomp_*` bodies are
    /// comprehensions.
    pub fn for_segment(name: &str) -> Flags {
        let name = name.trim_start_matches(['<', '_']);
        Flags {
            comprehension: ["listcomp", "setcomp", "dictcomp"]
                .iter()
                .any(|marker| name.starts_with(marker)),
            generator_expression: name.starts_with("genexpr"),
            raw_jumps: false,
        }
    }

    pub fn union(self, other: Flags) -> Flags {
        Flags {
            comprehension: self.comprehension || other.comprehension,
            generator_expression: self.generator_expression || other.generator_expression,
            raw_jumps: self.raw_jumps || other.raw_jumps,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub indent: usize,
    pub node: Node,
    /// Offset of the instruction that produced the node.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub statements: Vec<Statement>,
    /// Names loaded before ever being stored, in order of first use.
    pub arg_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndentChange {
    target: usize,
    delta: isize,
}

/// Rebuilds the statement list of one segment.
pub fn reconstruct(instructions: &[Instruction], flags: Flags) -> Result<Reconstruction, DedisError> {
    let mut engine = Engine::new(instructions, flags);
    engine.run()?;
    Ok(Reconstruction {
        statements: engine.stack,
        arg_names: engine.arg_names,
    })
}

/// Joins statements into source text, one per line.
pub fn render_statements(statements: &[Statement], indent_unit: &str, show_offsets: bool) -> String {
    let mut out = String::new();
    for (i, s) in statements.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&indent_unit.repeat(s.indent));
        out.push_str(&s.node.render());
        if show_offsets {
            out.push_str(&format!("  # {}", s.offset));
        }
    }
    out
}

struct Engine<'a> {
    instructions: &'a [Instruction],
    flags: Flags,
    cursor: usize,
    /// Offset of the instruction that started the current step.
    origin: usize,
    indent: isize,
    stack: Vec<Statement>,
    pending: Vec<IndentChange>,
    arg_names: Vec<String>,
    seen: HashSet<String>,
}

impl<'a> Engine<'a> {
    fn new(instructions: &'a [Instruction], flags: Flags) -> Self {
        Self {
            instructions,
            flags,
            cursor: 0,
            origin: 0,
            indent: 0,
            stack: Vec::new(),
            pending: Vec::new(),
            arg_names: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn run(&mut self) -> Result<(), DedisError> {
        while self.cursor < self.instructions.len() {
            self.apply_indent_changes();
            let first = self.cursor == 0;
            let depth = self.stack.len();
            self.step()?;
            if first && self.flags.comprehension && self.stack.len() > depth {
                let initial = self.pop()?;
                self.push(Node::assign(Node::value(ACCUMULATOR), initial));
            }
            self.cursor += 1;
        }
        Ok(())
    }

    fn apply_indent_changes(&mut self) {
        let offset = self.current().offset;
        let mut delta = 0;
        self.pending.retain(|change| {
            if change.target == offset {
                delta += change.delta;
                false
            } else {
                true
            }
        });
        self.indent += delta;
    }

    fn step(&mut self) -> Result<(), DedisError> {
        let ins = self.current();
        self.origin = ins.offset;

        let Some(opcode) = ins.opcode() else {
            self.push_invalid();
            return Ok(());
        };

        match opcode {
            Opcode::LoadAttr => {
                let Some(name) = ins.argval.clone() else {
                    self.push_invalid();
                    return Ok(());
                };
                let object = self.pop()?;
                self.push(Node::attribute(object, name));
            }
            Opcode::Load { global } => self.load(global),
            Opcode::Store => {
                let name = self.name_of(ins)?;
                let value = self.pop()?;
                self.seen.insert(name.clone());
                self.push(Node::assign(Node::Value(name), value));
            }
            Opcode::YieldValue => {
                let value = self.pop()?;
                self.push(Node::Yield(Box::new(value)));
            }
            Opcode::ReturnValue => {
                let value = if self.flags.comprehension {
                    Node::value(ACCUMULATOR)
                } else {
                    self.pop()?
                };
                self.push(Node::Return(Box::new(value)));
            }
            Opcode::Build(kind) => {
                let count = self.arg()? as usize;
                let items = self.pop_n(count)?;
                self.push(Node::Build { kind, items });
            }
            Opcode::BuildMap => {
                let count = self.arg()? as usize;
                let args = self.pop_n(2 * count)?;
                self.push(Node::BuildMap(args));
            }
            Opcode::BuildSlice => {
                let step = if self.arg()? == 3 { Some(self.pop()?) } else { None };
                let stop = self.pop()?;
                let start = self.pop()?;
                self.push(Node::slice(start, stop, step));
            }
            Opcode::GetIter => {
                let value = self.pop()?;
                self.push(Node::Iter(Box::new(value)));
            }
            Opcode::ForIter => self.for_loop()?,
            Opcode::PopJumpIf { on_true } => self.conditional_jump(on_true)?,
            Opcode::JumpAbsolute => self.absolute_jump()?,
            Opcode::JumpForward => {
                let target = self.jump_target()?;
                if self.flags.raw_jumps {
                    self.push(Node::Jump {
                        target,
                        condition: None,
                    });
                    return Ok(());
                }
                self.indent -= 1;
                self.push(Node::Else);
                self.indent += 2;
                self.defer(target, -1);
            }
            Opcode::ImportName => self.import()?,
            Opcode::RaiseVarargs => {
                let node = match self.arg()? {
                    0 => Node::Raise {
                        exception: None,
                        cause: None,
                    },
                    1 => Node::Raise {
                        exception: Some(Box::new(self.pop()?)),
                        cause: None,
                    },
                    2 => {
                        let cause = self.pop()?;
                        let exception = self.pop()?;
                        Node::Raise {
                            exception: Some(Box::new(exception)),
                            cause: Some(Box::new(cause)),
                        }
                    }
                    _ => {
                        self.push_invalid();
                        return Ok(());
                    }
                };
                self.push(node);
            }
            Opcode::CallFunction => {
                let argc = self.arg()? as usize;
                let args = self.pop_n(argc)?;
                let func = self.pop()?;
                self.push(Node::call(func, args));
            }
            Opcode::CallFunctionKw => self.call_with_keywords()?,
            Opcode::CallFunctionEx => {
                let node = if self.arg()? & 1 != 0 {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let func = self.pop()?;
                    Node::call(
                        func,
                        vec![Node::UnpackSeq(Box::new(args)), Node::UnpackDict(Box::new(kwargs))],
                    )
                } else {
                    let args = self.pop()?;
                    let func = self.pop()?;
                    Node::call(func, vec![Node::UnpackSeq(Box::new(args))])
                };
                self.push(node);
            }
            Opcode::MakeFunction => self.make_function()?,
            Opcode::ListAppend | Opcode::SetAdd => {
                if !self.flags.comprehension {
                    self.push_invalid();
                    return Ok(());
                }
                let method = if opcode == Opcode::ListAppend { "append" } else { "add" };
                let value = self.pop()?;
                let func = Node::attribute(Node::value(ACCUMULATOR), method);
                self.push(Node::call(func, vec![value]));
            }
            Opcode::MapAdd => {
                if !self.flags.comprehension {
                    self.push_invalid();
                    return Ok(());
                }
                let value = self.pop()?;
                let key = self.pop()?;
                self.push(Node::SubscriptAssign {
                    container: Box::new(Node::value(ACCUMULATOR)),
                    subscript: Box::new(key),
                    value: Box::new(value),
                });
            }
            Opcode::UnpackSequence => self.unpack_sequence()?,
            Opcode::UnpackEx => self.unpack_extended()?,
            Opcode::CompareOp => {
                let Some(op) = ins.argval.clone() else {
                    self.push_invalid();
                    return Ok(());
                };
                self.compare(op)?;
            }
            Opcode::IsOp => {
                let op = if self.arg()? == 0 { "is" } else { "is not" };
                self.compare(op.to_string())?;
            }
            Opcode::ContainsOp => {
                let op = if self.arg()? == 0 { "in" } else { "not in" };
                self.compare(op.to_string())?;
            }
            Opcode::BinarySubscr => {
                let index = self.pop()?;
                let value = Box::new(self.pop()?);
                let node = match index {
                    Node::Slice { start, stop, step } => Node::SubscriptSlice {
                        value,
                        start,
                        stop,
                        step,
                    },
                    index => Node::Subscript {
                        value,
                        index: Box::new(index),
                    },
                };
                self.push(node);
            }
            Opcode::StoreSubscr => {
                let subscript = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.push(Node::SubscriptAssign {
                    container: Box::new(container),
                    subscript: Box::new(subscript),
                    value: Box::new(value),
                });
            }
            Opcode::Unary(op) => {
                let operand = self.pop()?;
                self.push(Node::UnaryOp {
                    op,
                    operand: Box::new(operand),
                });
            }
            Opcode::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Node::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
            Opcode::Inplace(op) => {
                let store = self.instructions.get(self.cursor + 1).filter(|i| i.is_store());
                let Some(target) = store.and_then(|i| i.argval.clone()) else {
                    self.push_invalid();
                    return Ok(());
                };
                let value = self.pop()?;
                self.pop()?;
                self.cursor += 1;
                self.seen.insert(target.clone());
                self.push(Node::InplaceOp {
                    op,
                    target,
                    value: Box::new(value),
                });
            }
            // IMPORT_FROM and IMPORT_STAR are consumed by the IMPORT_NAME
            // that precedes them; on their own they have no meaning.
            Opcode::ImportFrom | Opcode::ImportStar => self.push_invalid(),
            Opcode::Nop | Opcode::PopTop => {}
        }
        Ok(())
    }

    fn load(&mut self, global: bool) {
        let Some(raw) = self.current().argval.as_deref() else {
            self.push_invalid();
            return;
        };
        let name = if raw.starts_with('.') && (self.flags.comprehension || self.flags.generator_expression) {
            format!("__{}", &raw[1..])
        } else {
            raw.to_string()
        };
        if is_identifier(&name) {
            if !global && !self.seen.contains(&name) {
                self.arg_names.push(name.clone());
            }
            self.seen.insert(name.clone());
        }
        self.push(Node::Value(name));
    }

    fn for_loop(&mut self) -> Result<(), DedisError> {
        let loop_end = self.jump_target()?;
        self.lookahead(1)?;

        let Some((target, names, consumed)) = self.unpack_target(self.cursor + 1) else {
            self.push_invalid();
            return Ok(());
        };

        let iterator = match self.pop()? {
            Node::Iter(inner) => *inner,
            other => other,
        };
        self.seen.extend(names);
        self.cursor += consumed;

        self.push(Node::ForLoop {
            target: Box::new(target),
            iterator: Box::new(iterator),
        });
        self.indent += 1;
        self.defer(loop_end, -1);
        Ok(())
    }

    fn conditional_jump(&mut self, on_true: bool) -> Result<(), DedisError> {
        let test = self.pop()?;
        let target = self.jump_target()?;

        if self.flags.raw_jumps {
            let condition = if on_true { test } else { Node::not(test) };
            self.push(Node::Jump {
                target,
                condition: Some(Box::new(condition)),
            });
            return Ok(());
        }

        let condition = Box::new(if on_true { Node::not(test) } else { test });

        if target > self.origin {
            self.defer(target, -1);
            if self.is_while_loop(target) {
                trace!(offset = self.origin, target, "conditional jump closes a while loop");
                self.push(Node::WhileLoop(condition));
            } else if let Some(else_end) = self.else_owning(target) {
                trace!(offset = self.origin, target, "collapsing else/if into elif");
                self.cancel(else_end, -1);
                self.indent -= 1;
                if let Some(marker) = self.stack.last_mut() {
                    marker.node = Node::Elif(condition);
                    marker.offset = self.origin;
                }
            } else {
                self.push(Node::If(condition));
            }
        } else {
            // An if at the tail of a loop body jumps straight back to the loop
            // head, so the loop's own closing jump must be dedented as well.
            self.dedent_after_jump_to(target);
            self.push(Node::If(condition));
        }
        self.indent += 1;
        Ok(())
    }

    /// A forward conditional opens a while loop when the instruction right
    /// before its target jumps back to a point at or before the condition,
    /// with no other branch or loop header in between.
    fn is_while_loop(&self, target: usize) -> bool {
        let Some(back) = self.preceding(target) else {
            return false;
        };
        if back.opcode() != Some(Opcode::JumpAbsolute) {
            return false;
        }
        let Some(loop_start) = back.jump_target() else {
            return false;
        };
        if loop_start >= self.origin {
            return false;
        }
        !self
            .instructions
            .iter()
            .filter(|i| i.offset >= loop_start && i.offset < self.origin)
            .any(|i| matches!(i.opcode(), Some(Opcode::PopJumpIf { .. } | Opcode::ForIter)))
    }

    /// Returns the end offset of the `else:` on top of the stack when the
    /// branch starting here is the whole body of that else.
    fn else_owning(&self, target: usize) -> Option<usize> {
        let top = self.stack.last()?;
        if top.node != Node::Else || top.indent as isize != self.indent - 1 {
            return None;
        }
        let else_end = self.at_offset(top.offset)?.jump_target()?;
        let owned = target == else_end
            || self.preceding(target).is_some_and(|p| {
                p.opcode() == Some(Opcode::JumpForward) && p.jump_target() == Some(else_end)
            });
        owned.then_some(else_end)
    }

    fn dedent_after_jump_to(&mut self, target: usize) {
        let origin = self.origin;
        let closing = self.instructions.iter().position(|i| {
            i.offset > origin && i.opcode() == Some(Opcode::JumpAbsolute) && i.jump_target() == Some(target)
        });
        if let Some(next) = closing.and_then(|idx| self.instructions.get(idx + 1)) {
            self.defer(next.offset, -1);
        }
    }

    fn absolute_jump(&mut self) -> Result<(), DedisError> {
        let target = self.jump_target()?;
        if self.flags.raw_jumps {
            self.push(Node::Jump {
                target,
                condition: None,
            });
            return Ok(());
        }
        let Some(destination) = self.at_offset(target) else {
            return Ok(());
        };
        let after_break = matches!(self.peek(), Some(Node::Break));

        if destination.opcode() == Some(Opcode::ForIter) {
            let closing = destination
                .jump_target()
                .and_then(|end| self.preceding(end))
                .map(|i| i.offset);
            if closing != Some(self.origin) && !after_break {
                trace!(offset = self.origin, target, "jump to for header is a continue");
                self.push(Node::Continue);
            }
        } else if target > self.origin {
            if self.is_loop_exit(target) {
                trace!(offset = self.origin, target, "jump to loop exit is a break");
                self.push(Node::Break);
            }
        } else if self.is_while_continue(target) && !after_break {
            trace!(offset = self.origin, target, "jump to while header is a continue");
            self.push(Node::Continue);
        }
        Ok(())
    }

    fn is_loop_exit(&self, target: usize) -> bool {
        self.instructions.iter().any(|i| match i.opcode() {
            Some(Opcode::ForIter | Opcode::PopJumpIf { .. }) => i.jump_target() == Some(target),
            _ => false,
        })
    }

    /// A backward jump to a while header that is not the loop's own closing
    /// jump.
    fn is_while_continue(&self, target: usize) -> bool {
        self.instructions.iter().any(|i| {
            i.offset > self.origin && i.opcode() == Some(Opcode::JumpAbsolute) && i.jump_target() == Some(target)
        })
    }

    fn import(&mut self) -> Result<(), DedisError> {
        let module = self.name_of(self.current())?;
        let _fromlist = self.pop()?;
        let level = match self.pop()? {
            Node::Value(v) => v.parse::<i64>().ok(),
            _ => None,
        };
        if level != Some(0) {
            debug!(offset = self.origin, module = %module, "relative import left as placeholder");
            self.push_invalid();
            return Ok(());
        }

        let next = self.lookahead(1)?;
        match next.opcode() {
            Some(Opcode::Store) => {
                let stored = self.name_of(next)?;
                let top_level = module.split('.').next().unwrap_or(&module);
                let alias = (stored != module && stored != top_level).then(|| stored.clone());
                self.seen.insert(stored);
                self.cursor += 1;
                self.push(Node::Import { module, alias });
            }
            Some(Opcode::ImportFrom) => {
                if let Some((alias, span)) = self.submodule_alias(&module) {
                    self.seen.insert(alias.clone());
                    self.cursor += span;
                    self.push(Node::Import {
                        module,
                        alias: Some(alias),
                    });
                    return Ok(());
                }

                let instructions = self.instructions;
                let mut names = Vec::new();
                let mut k = 1;
                while let Some(from) = instructions
                    .get(self.cursor + k)
                    .filter(|i| i.opcode() == Some(Opcode::ImportFrom))
                {
                    let store = self.lookahead(k + 1)?;
                    if !store.is_store() {
                        break;
                    }
                    let name = self.name_of(from)?;
                    let bound = self.name_of(store)?;
                    self.seen.insert(bound.clone());
                    let alias = (bound != name).then_some(bound);
                    names.push(ImportedName { name, alias });
                    k += 2;
                }
                if names.is_empty() {
                    self.push_invalid();
                    return Ok(());
                }
                self.cursor += k - 1;
                self.push(Node::FromImport { module, names });
            }
            Some(Opcode::ImportStar) => {
                self.cursor += 1;
                self.push(Node::FromImport {
                    module,
                    names: vec![ImportedName {
                        name: "*".to_string(),
                        alias: None,
                    }],
                });
            }
            _ => self.push_invalid(),
        }
        Ok(())
    }

    /// `import a.b.c as d` walks the dotted path with one
    /// `IMPORT_FROM`/`ROT_TWO`/`POP_TOP` triple per component before the
    /// store. Returns the bound name and the instructions consumed.
    fn submodule_alias(&self, module: &str) -> Option<(String, usize)> {
        let components: Vec<&str> = module.split('.').skip(1).collect();
        if components.is_empty() {
            return None;
        }
        for (n, component) in components.iter().enumerate() {
            let at = self.cursor + 1 + 3 * n;
            let from = self.instructions.get(at)?;
            if from.opcode() != Some(Opcode::ImportFrom) || from.argval.as_deref() != Some(*component) {
                return None;
            }
            let rot = self.instructions.get(at + 1)?;
            let pop = self.instructions.get(at + 2)?;
            if rot.opname != "ROT_TWO" || pop.opname != "POP_TOP" {
                return None;
            }
        }
        let span = 3 * components.len() + 1;
        let store = self.instructions.get(self.cursor + span).filter(|i| i.is_store())?;
        Some((store.argval.clone()?, span))
    }

    fn call_with_keywords(&mut self) -> Result<(), DedisError> {
        let argc = self.arg()? as usize;
        let names = match self.peek() {
            Some(Node::Value(v)) => parse_name_tuple(v),
            _ => None,
        };
        let Some(names) = names else {
            self.push_invalid();
            return Ok(());
        };
        self.pop()?;
        let values = self.pop_n(names.len())?;
        let args = self.pop_n(argc.saturating_sub(names.len()))?;
        let func = self.pop()?;
        self.push(Node::FunctionCall {
            func: Box::new(func),
            args,
            kwargs: names.into_iter().zip(values).collect(),
        });
        Ok(())
    }

    fn make_function(&mut self) -> Result<(), DedisError> {
        let flags = self.arg()?;
        let _qualname = self.pop()?;
        let code = self.pop()?;
        let captured = if flags & 0x08 != 0 { Some(self.pop()?) } else { None };
        // annotations, keyword defaults, positional defaults
        for bit in [0x04, 0x02, 0x01] {
            if flags & bit != 0 {
                self.pop()?;
            }
        }

        let name = match &code {
            Node::Value(descriptor) => crate::segment::code_object_name(descriptor),
            _ => None,
        };
        let Some(target) = name else {
            self.push_invalid();
            return Ok(());
        };
        let node = match captured {
            Some(Node::Build { items, .. }) => Node::Closure {
                target,
                captured: items.iter().map(Node::render).collect(),
            },
            Some(other) => Node::Closure {
                target,
                captured: vec![other.render()],
            },
            None => Node::Value(target),
        };
        self.push(node);
        Ok(())
    }

    fn unpack_sequence(&mut self) -> Result<(), DedisError> {
        let value = self.pop()?;
        match self.unpack_target(self.cursor) {
            Some((target, names, consumed)) => {
                self.seen.extend(names);
                self.cursor += consumed - 1;
                self.push(Node::assign(target, value));
            }
            None => self.push(Node::UnpackSeq(Box::new(value))),
        }
        Ok(())
    }

    /// Reads an assignment target starting at instruction `at`: a single
    /// store, or `UNPACK_SEQUENCE n` followed by n targets, nested freely.
    /// Returns the target, the names it binds and how many instructions it
    /// spans.
    fn unpack_target(&self, at: usize) -> Option<(Node, Vec<String>, usize)> {
        let ins = self.instructions.get(at)?;
        if ins.is_store() {
            let name = ins.argval.clone()?;
            return Some((Node::value(name.clone()), vec![name], 1));
        }
        if ins.opcode() != Some(Opcode::UnpackSequence) {
            return None;
        }
        let count = ins.arg? as usize;
        if count == 0 {
            return None;
        }
        let mut items = Vec::with_capacity(count);
        let mut names = Vec::new();
        let mut span = 1;
        for _ in 0..count {
            let (item, bound, len) = self.unpack_target(at + span)?;
            items.push(item);
            names.extend(bound);
            span += len;
        }
        Some((Node::tuple(items), names, span))
    }

    fn unpack_extended(&mut self) -> Result<(), DedisError> {
        let arg = self.arg()? as usize;
        let before = arg & 0xff;
        let after = (arg >> 8) & 0xff;
        let total = before + 1 + after;

        let names = self.store_run(1, total)?;
        let value = self.pop()?;
        self.seen.extend(names.iter().cloned());
        self.cursor += total;

        let targets = names
            .into_iter()
            .enumerate()
            .map(|(k, name)| Node::Value(if k == before { format!("*{name}") } else { name }))
            .collect();
        self.push(Node::assign(Node::tuple(targets), value));
        Ok(())
    }

    fn compare(&mut self, op: String) -> Result<(), DedisError> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(Node::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
        Ok(())
    }

    /// Names bound by `count` consecutive stores starting `from` instructions
    /// after the cursor.
    fn store_run(&self, from: usize, count: usize) -> Result<Vec<String>, DedisError> {
        (0..count)
            .map(|k| {
                self.instructions
                    .get(self.cursor + from + k)
                    .filter(|i| i.is_store())
                    .and_then(|i| i.argval.clone())
                    .ok_or(DedisError::MalformedUnpack {
                        offset: self.origin,
                        expected: count,
                    })
            })
            .collect()
    }

    fn current(&self) -> &'a Instruction {
        &self.instructions[self.cursor]
    }

    fn lookahead(&self, n: usize) -> Result<&'a Instruction, DedisError> {
        self.instructions
            .get(self.cursor + n)
            .ok_or_else(|| DedisError::UnexpectedEnd {
                offset: self.origin,
                opname: self.current().opname.clone(),
            })
    }

    fn at_offset(&self, offset: usize) -> Option<&'a Instruction> {
        let instructions = self.instructions;
        let idx = instructions.partition_point(|i| i.offset < offset);
        instructions.get(idx).filter(|i| i.offset == offset)
    }

    /// The instruction laid out immediately before `offset`.
    fn preceding(&self, offset: usize) -> Option<&'a Instruction> {
        let instructions = self.instructions;
        let idx = instructions.partition_point(|i| i.offset < offset);
        idx.checked_sub(1).map(|i| &instructions[i])
    }

    fn arg(&self) -> Result<u32, DedisError> {
        self.current().arg.ok_or_else(|| self.missing_argument())
    }

    fn jump_target(&self) -> Result<usize, DedisError> {
        let ins = self.current();
        ins.jump_target().ok_or_else(|| DedisError::InvalidJumpTarget {
            offset: ins.offset,
            opname: ins.opname.clone(),
        })
    }

    fn name_of(&self, ins: &Instruction) -> Result<String, DedisError> {
        ins.argval.clone().ok_or_else(|| DedisError::MissingArgument {
            offset: ins.offset,
            opname: ins.opname.clone(),
        })
    }

    fn missing_argument(&self) -> DedisError {
        let ins = self.current();
        DedisError::MissingArgument {
            offset: ins.offset,
            opname: ins.opname.clone(),
        }
    }

    fn defer(&mut self, target: usize, delta: isize) {
        self.pending.push(IndentChange { target, delta });
    }

    fn cancel(&mut self, target: usize, delta: isize) {
        let change = IndentChange { target, delta };
        if let Some(pos) = self.pending.iter().rposition(|c| *c == change) {
            self.pending.remove(pos);
        }
    }

    fn push(&mut self, node: Node) {
        self.stack.push(Statement {
            indent: self.indent.max(0) as usize,
            node,
            offset: self.origin,
        });
    }

    fn push_invalid(&mut self) {
        let ins = self.current();
        debug!(offset = ins.offset, opname = %ins.opname, "unrecognized instruction, emitting placeholder");
        self.push(Node::Invalid {
            opname: ins.opname.clone(),
            arg: ins.arg,
            argval: ins.argval.clone(),
        });
    }

    fn pop(&mut self) -> Result<Node, DedisError> {
        match self.stack.pop() {
            Some(s) => Ok(s.node),
            None => Err(self.underflow()),
        }
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Node>, DedisError> {
        if n > self.stack.len() {
            return Err(self.underflow());
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at).into_iter().map(|s| s.node).collect())
    }

    fn peek(&self) -> Option<&Node> {
        self.stack.last().map(|s| &s.node)
    }

    fn underflow(&self) -> DedisError {
        DedisError::StackUnderflow {
            offset: self.origin,
            opname: self.current().opname.clone(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !matches!(name, "True" | "False" | "None")
}

/// Parses the keyword-name tuple constant of `CALL_FUNCTION_KW`, e.g.
/// `('sep', 'end')`.
fn parse_name_tuple(literal: &str) -> Option<Vec<String>> {
    let inner = literal.trim().strip_prefix('(')?.strip_suffix(')')?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let unquoted = item
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| item.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
            Some(unquoted.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::parse_instructions;
    use test_case::test_case;

    fn run(disasm: &str, flags: Flags) -> (String, Vec<String>) {
        let r = reconstruct(&parse_instructions(disasm), flags).unwrap();
        (render_statements(&r.statements, "\t", flags.raw_jumps), r.arg_names)
    }

    fn pseudo(disasm: &str) -> String {
        run(disasm, Flags::default()).0
    }

    #[test]
    fn straight_line_code_maps_one_statement_per_store_and_return() {
        let (out, args) = run(
            "0 LOAD_FAST 0 (a)
             2 LOAD_FAST 1 (b)
             4 BINARY_ADD
             6 STORE_FAST 2 (c)
             8 LOAD_FAST 2 (c)
            10 RETURN_VALUE",
            Flags::default(),
        );
        assert_eq!(out, "c=a+b\nreturn c");
        assert_eq!(args, ["a", "b"]);
    }

    #[test]
    fn arguments_are_names_loaded_before_any_store() {
        let (_, args) = run(
            "0 LOAD_FAST 0 (x)
             2 LOAD_FAST 1 (y)
             4 BINARY_MULTIPLY
             6 STORE_FAST 0 (x)
             8 LOAD_FAST 0 (x)
            10 LOAD_GLOBAL 0 (len)
            12 LOAD_CONST 1 (None)
            14 BUILD_TUPLE 3
            16 RETURN_VALUE",
            Flags::default(),
        );
        assert_eq!(args, ["x", "y"]);
    }

    #[test]
    fn backward_jump_before_target_makes_a_while_loop() {
        let out = pseudo(
            " 0 LOAD_CONST 1 (0)
              2 STORE_FAST 0 (i)
              4 LOAD_FAST 0 (i)
              6 LOAD_CONST 2 (10)
              8 COMPARE_OP 0 (<)
             10 POP_JUMP_IF_FALSE 22
             12 LOAD_FAST 0 (i)
             14 LOAD_CONST 3 (1)
             16 INPLACE_ADD
             18 STORE_FAST 0 (i)
             20 JUMP_ABSOLUTE 4
             22 LOAD_CONST 0 (None)
             24 RETURN_VALUE",
        );
        assert_eq!(out, "i=0\nwhile i<10:\n\ti+=1\nreturn None");
    }

    #[test]
    fn forward_jump_without_loop_back_is_an_if() {
        let (out, args) = run(
            "0 LOAD_FAST 0 (x)
             2 POP_JUMP_IF_FALSE 8
             4 LOAD_CONST 1 (1)
             6 RETURN_VALUE
             8 LOAD_CONST 2 (2)
            10 RETURN_VALUE",
            Flags::default(),
        );
        assert_eq!(out, "if x:\n\treturn 1\nreturn 2");
        assert_eq!(args, ["x"]);
    }

    #[test]
    fn jump_if_true_negates_the_condition() {
        let out = pseudo(
            "0 LOAD_FAST 0 (x)
             2 POP_JUMP_IF_TRUE 8
             4 LOAD_CONST 1 (1)
             6 RETURN_VALUE
             8 LOAD_CONST 2 (2)
            10 RETURN_VALUE",
        );
        assert_eq!(out, "if not x:\n\treturn 1\nreturn 2");
    }

    #[test]
    fn else_followed_by_if_collapses_into_elif() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (x)
              2 LOAD_CONST 1 (1)
              4 COMPARE_OP 2 (==)
              6 POP_JUMP_IF_FALSE 14
              8 LOAD_CONST 2 ('a')
             10 STORE_FAST 1 (y)
             12 JUMP_FORWARD 18 (to 32)
             14 LOAD_FAST 0 (x)
             16 LOAD_CONST 3 (2)
             18 COMPARE_OP 2 (==)
             20 POP_JUMP_IF_FALSE 28
             22 LOAD_CONST 4 ('b')
             24 STORE_FAST 1 (y)
             26 JUMP_FORWARD 4 (to 32)
             28 LOAD_CONST 5 ('c')
             30 STORE_FAST 1 (y)
             32 LOAD_FAST 1 (y)
             34 RETURN_VALUE",
        );
        assert_eq!(
            out,
            "if x==1:\n\ty='a'\nelif x==2:\n\ty='b'\nelse:\n\ty='c'\nreturn y"
        );
    }

    #[test]
    fn plain_if_else() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (x)
              2 POP_JUMP_IF_FALSE 10
              4 LOAD_CONST 1 (1)
              6 STORE_FAST 1 (y)
              8 JUMP_FORWARD 4 (to 14)
             10 LOAD_CONST 2 (2)
             12 STORE_FAST 1 (y)
             14 LOAD_FAST 1 (y)
             16 RETURN_VALUE",
        );
        assert_eq!(out, "if x:\n\ty=1\nelse:\n\ty=2\nreturn y");
    }

    #[test]
    fn jumps_inside_for_loops_become_continue_and_break() {
        let (out, args) = run(
            " 0 LOAD_FAST 0 (xs)
              2 GET_ITER
              4 FOR_ITER 18 (to 24)
              6 STORE_FAST 1 (x)
              8 LOAD_FAST 1 (x)
             10 POP_JUMP_IF_FALSE 14
             12 JUMP_ABSOLUTE 4
             14 LOAD_FAST 1 (x)
             16 POP_JUMP_IF_FALSE 4
             18 POP_TOP
             20 JUMP_ABSOLUTE 24
             22 JUMP_ABSOLUTE 4
             24 LOAD_CONST 0 (None)
             26 RETURN_VALUE",
            Flags::default(),
        );
        assert_eq!(
            out,
            "for x in xs:\n\tif x:\n\t\tcontinue\n\tif x:\n\t\tbreak\nreturn None"
        );
        assert_eq!(args, ["xs"]);
    }

    #[test]
    fn for_loop_unpacks_tuple_targets() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (pairs)
              2 GET_ITER
              4 FOR_ITER 12 (to 18)
              6 UNPACK_SEQUENCE 2
              8 STORE_FAST 1 (k)
             10 STORE_FAST 2 (v)
             12 LOAD_FAST 2 (v)
             14 STORE_FAST 3 (last)
             16 JUMP_ABSOLUTE 4
             18 LOAD_FAST 3 (last)
             20 RETURN_VALUE",
        );
        assert_eq!(out, "for (k,v) in pairs:\n\tlast=v\nreturn last");
    }

    #[test]
    fn for_loop_unpacks_nested_tuple_targets() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (rows)
              2 GET_ITER
              4 FOR_ITER 16 (to 22)
              6 UNPACK_SEQUENCE 2
              8 STORE_FAST 1 (a)
             10 UNPACK_SEQUENCE 2
             12 STORE_FAST 2 (b)
             14 STORE_FAST 3 (c)
             16 LOAD_FAST 3 (c)
             18 STORE_FAST 4 (last)
             20 JUMP_ABSOLUTE 4
             22 LOAD_FAST 4 (last)
             24 RETURN_VALUE",
        );
        assert_eq!(out, "for (a,(b,c)) in rows:\n\tlast=c\nreturn last");
    }

    #[test]
    fn for_loop_over_attribute_target_is_a_placeholder() {
        let r = reconstruct(
            &parse_instructions(
                " 0 LOAD_FAST 1 (xs)
                  2 GET_ITER
                  4 FOR_ITER 8 (to 14)
                  6 LOAD_FAST 0 (self)
                  8 STORE_ATTR 0 (x)
                 10 NOP
                 12 JUMP_ABSOLUTE 4
                 14 LOAD_CONST 0 (None)
                 16 RETURN_VALUE",
            ),
            Flags::default(),
        )
        .unwrap();
        let out = render_statements(&r.statements, "\t", false);
        assert!(out.contains("<FOR_ITER("), "{out}");
        assert!(out.ends_with("return None"), "{out}");
    }

    #[test]
    fn break_suppresses_following_jump_to_for_header() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (xs)
              2 GET_ITER
              4 FOR_ITER 14 (to 20)
              6 STORE_FAST 1 (x)
              8 LOAD_FAST 1 (x)
             10 POP_JUMP_IF_FALSE 4
             12 POP_TOP
             14 JUMP_ABSOLUTE 20
             16 JUMP_ABSOLUTE 4
             18 JUMP_ABSOLUTE 4
             20 LOAD_CONST 0 (None)
             22 RETURN_VALUE",
        );
        assert_eq!(out, "for x in xs:\n\tif x:\n\t\tbreak\nreturn None");
    }

    #[test]
    fn break_suppresses_following_jump_to_while_header() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (n)
              2 POP_JUMP_IF_FALSE 16
              4 LOAD_FAST 1 (done)
              6 POP_JUMP_IF_FALSE 14
              8 JUMP_ABSOLUTE 16
             10 JUMP_ABSOLUTE 0
             12 NOP
             14 JUMP_ABSOLUTE 0
             16 LOAD_CONST 0 (None)
             18 RETURN_VALUE",
        );
        assert_eq!(out, "while n:\n\tif done:\n\t\tbreak\nreturn None");
    }

    #[test]
    fn unknown_opcodes_become_placeholders() {
        let out = pseudo(
            "0 FROBNICATE 3 (foo)
             2 SETUP_WITH",
        );
        assert_eq!(out, "<FROBNICATE(3,foo)>\n<SETUP_WITH(None,None)>");
    }

    #[test]
    fn list_comprehension_accumulates_into_temp() {
        let flags = Flags {
            comprehension: true,
            ..Flags::default()
        };
        let (out, args) = run(
            " 0 BUILD_LIST 0
              2 LOAD_FAST 0 (.0)
              4 FOR_ITER 8 (to 14)
              6 STORE_FAST 1 (x)
              8 LOAD_FAST 1 (x)
             10 LIST_APPEND 2
             12 JUMP_ABSOLUTE 4
             14 RETURN_VALUE",
            flags,
        );
        assert_eq!(out, "__temp=[]\nfor x in __0:\n\t__temp.append(x)\nreturn __temp");
        assert_eq!(args, ["__0"]);
    }

    #[test]
    fn dict_comprehension_assigns_into_temp() {
        let flags = Flags {
            comprehension: true,
            ..Flags::default()
        };
        let out = run(
            " 0 BUILD_MAP 0
              2 LOAD_FAST 0 (.0)
              4 FOR_ITER 12 (to 18)
              6 STORE_FAST 1 (x)
              8 LOAD_FAST 1 (x)
             10 LOAD_FAST 1 (x)
             12 LOAD_CONST 0 (2)
             14 BINARY_MULTIPLY
             16 MAP_ADD 2
             18 RETURN_VALUE",
            flags,
        )
        .0;
        assert_eq!(out, "__temp={}\nfor x in __0:\n\t__temp[x]=x*2\nreturn __temp");
    }

    #[test]
    fn accumulation_outside_comprehension_is_a_placeholder() {
        let out = pseudo(
            "0 LOAD_FAST 0 (x)
             2 LIST_APPEND 1",
        );
        assert_eq!(out, "x\n<LIST_APPEND(1,None)>");
    }

    #[test]
    fn generator_expression_yields_and_renames_iterator() {
        let flags = Flags {
            generator_expression: true,
            ..Flags::default()
        };
        let (out, args) = run(
            " 0 LOAD_FAST 0 (.0)
              2 FOR_ITER 10 (to 14)
              4 STORE_FAST 1 (x)
              6 LOAD_FAST 1 (x)
              8 YIELD_VALUE
             10 POP_TOP
             12 JUMP_ABSOLUTE 2
             14 LOAD_CONST 0 (None)
             16 RETURN_VALUE",
            flags,
        );
        assert_eq!(out, "for x in __0:\n\tyield x\nreturn None");
        assert_eq!(args, ["__0"]);
    }

    #[test]
    fn imports_in_all_supported_forms() {
        let out = pseudo(
            " 0 LOAD_CONST 0 (0)
              2 LOAD_CONST 1 (None)
              4 IMPORT_NAME 0 (os.path)
              6 STORE_NAME 0 (os)
              8 LOAD_CONST 0 (0)
             10 LOAD_CONST 2 (('join', 'sep'))
             12 IMPORT_NAME 1 (posixpath)
             14 IMPORT_FROM 2 (join)
             16 STORE_NAME 2 (join)
             18 IMPORT_FROM 3 (sep)
             20 STORE_NAME 4 (s)
             22 POP_TOP
             24 LOAD_CONST 0 (0)
             26 LOAD_CONST 1 (None)
             28 IMPORT_NAME 5 (numpy)
             30 STORE_NAME 6 (np)
             32 LOAD_CONST 0 (0)
             34 LOAD_CONST 3 (('*',))
             36 IMPORT_NAME 7 (math)
             38 IMPORT_STAR",
        );
        assert_eq!(
            out,
            "import os.path\nfrom posixpath import join,sep as s\nimport numpy as np\nfrom math import *"
        );
    }

    #[test]
    fn aliased_submodule_import_binds_the_alias() {
        let out = pseudo(
            " 0 LOAD_CONST 0 (0)
              2 LOAD_CONST 1 (None)
              4 IMPORT_NAME 0 (os.path)
              6 IMPORT_FROM 1 (path)
              8 ROT_TWO
             10 POP_TOP
             12 STORE_NAME 2 (p)
             14 LOAD_NAME 2 (p)
             16 RETURN_VALUE",
        );
        assert_eq!(out, "import os.path as p\nreturn p");
    }

    #[test]
    fn import_from_without_store_is_a_placeholder() {
        let out = pseudo(
            " 0 LOAD_CONST 0 (0)
              2 LOAD_CONST 1 (('a',))
              4 IMPORT_NAME 0 (pkg)
              6 IMPORT_FROM 1 (a)
              8 POP_TOP
             10 POP_TOP",
        );
        assert!(!out.contains("from pkg import"), "{out}");
        assert!(out.contains("<IMPORT_NAME("), "{out}");
    }

    #[test]
    fn relative_import_is_a_placeholder() {
        let out = pseudo(
            "0 LOAD_CONST 0 (1)
             2 LOAD_CONST 1 (None)
             4 IMPORT_NAME 0 (sibling)
             6 STORE_NAME 0 (sibling)",
        );
        assert_eq!(out, "sibling=<IMPORT_NAME(0,sibling)>");
    }

    #[test]
    fn keyword_call_splits_positional_and_keyword_arguments() {
        let out = pseudo(
            " 0 LOAD_GLOBAL 0 (print)
              2 LOAD_FAST 0 (a)
              4 LOAD_FAST 1 (b)
              6 LOAD_CONST 1 (('sep',))
              8 CALL_FUNCTION_KW 2
             10 POP_TOP
             12 LOAD_CONST 0 (None)
             14 RETURN_VALUE",
        );
        assert_eq!(out, "print(a,sep=b)\nreturn None");
    }

    #[test]
    fn method_calls_and_splat_calls() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (xs)
              2 LOAD_METHOD 0 (append)
              4 LOAD_CONST 1 (1)
              6 CALL_METHOD 1
              8 POP_TOP
             10 LOAD_GLOBAL 1 (f)
             12 LOAD_FAST 1 (args)
             14 LOAD_FAST 2 (kwargs)
             16 CALL_FUNCTION_EX 1
             18 RETURN_VALUE",
        );
        assert_eq!(out, "xs.append(1)\nreturn f(*args,**kwargs)");
    }

    #[test]
    fn closure_renders_forwarding_lambda() {
        let out = pseudo(
            " 0 LOAD_CONST 1 (5)
              2 STORE_DEREF 0 (n)
              4 LOAD_CLOSURE 0 (n)
              6 BUILD_TUPLE 1
              8 LOAD_CONST 2 (<code object inner at 0x7f00, file \"<dis>\", line 3>)
             10 LOAD_CONST 3 ('outer.<locals>.inner')
             12 MAKE_FUNCTION 8 (closure)
             14 STORE_FAST 0 (inner)
             16 LOAD_FAST 0 (inner)
             18 RETURN_VALUE",
        );
        assert_eq!(
            out,
            "n=5\ninner=(lambda *args,**kwargs:inner_0x7f00(n,*args,**kwargs))\nreturn inner"
        );
    }

    #[test]
    fn function_with_defaults_is_a_plain_reference() {
        let out = pseudo(
            "0 LOAD_CONST 1 ((1,))
             2 LOAD_CONST 2 (<code object <lambda> at 0xbeef, file \"<dis>\", line 1>)
             4 LOAD_CONST 3 ('<lambda>')
             6 MAKE_FUNCTION 1 (defaults)
             8 STORE_NAME 0 (f)",
        );
        assert_eq!(out, "f=lambda_0xbeef");
    }

    #[test]
    fn sequence_and_extended_unpacking() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (t)
              2 UNPACK_SEQUENCE 2
              4 STORE_FAST 1 (a)
              6 STORE_FAST 2 (b)
              8 LOAD_FAST 0 (t)
             10 UNPACK_EX 257
             12 STORE_FAST 1 (a)
             14 STORE_FAST 3 (rest)
             16 STORE_FAST 2 (b)",
        );
        assert_eq!(out, "(a,b)=t\n(a,*rest,b)=t");
    }

    #[test]
    fn extended_unpack_without_stores_is_an_error() {
        let err = reconstruct(
            &parse_instructions(
                "0 LOAD_FAST 0 (t)
                 2 UNPACK_EX 1
                 4 STORE_FAST 1 (a)
                 6 LOAD_CONST 0 (None)",
            ),
            Flags::default(),
        )
        .unwrap_err();
        assert!(matches!(err, DedisError::MalformedUnpack { offset: 2, expected: 2 }));
    }

    #[test]
    fn subscripts_slices_and_raise() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (v)
              2 LOAD_FAST 1 (d)
              4 LOAD_FAST 2 (k)
              6 STORE_SUBSCR
              8 LOAD_FAST 1 (d)
             10 LOAD_CONST 1 (1)
             12 LOAD_CONST 0 (None)
             14 BUILD_SLICE 2
             16 BINARY_SUBSCR
             18 STORE_FAST 3 (tail)
             20 LOAD_GLOBAL 0 (ValueError)
             22 LOAD_FAST 4 (e)
             24 RAISE_VARARGS 2",
        );
        assert_eq!(out, "d[k]=v\ntail=d[1:]\nraise ValueError from e");
    }

    #[test]
    fn membership_and_identity_tests_are_spaced() {
        let out = pseudo(
            " 0 LOAD_FAST 0 (x)
              2 LOAD_FAST 1 (xs)
              4 CONTAINS_OP 1
              6 LOAD_FAST 0 (x)
              8 LOAD_CONST 0 (None)
             10 IS_OP 0
             12 BUILD_TUPLE 2
             14 RETURN_VALUE",
        );
        assert_eq!(out, "return (x not in xs,x is None)");
    }

    #[test]
    fn raw_jumps_render_gotos_with_offsets() {
        let flags = Flags {
            raw_jumps: true,
            ..Flags::default()
        };
        let (out, _) = run(
            "0 LOAD_FAST 0 (x)
             2 POP_JUMP_IF_FALSE 8
             4 LOAD_CONST 1 (1)
             6 RETURN_VALUE
             8 LOAD_CONST 2 (2)
            10 RETURN_VALUE",
            flags,
        );
        assert_eq!(out, "if not x: goto 8  # 2\nreturn 1  # 6\nreturn 2  # 10");
    }

    #[test]
    fn stack_underflow_is_reported_with_offset() {
        let err = reconstruct(&parse_instructions("0 LOAD_FAST 0 (a)\n2 BINARY_ADD"), Flags::default()).unwrap_err();
        assert!(matches!(err, DedisError::StackUnderflow { offset: 2, .. }));
    }

    #[test]
    fn segment_names_select_modes() {
        assert!(Flags::for_segment("listcomp_0x10").comprehension);
        assert!(Flags::for_segment("dictcomp_0x10").comprehension);
        assert!(Flags::for_segment("genexpr_0x10").generator_expression);
        assert_eq!(Flags::for_segment("compute"), Flags::default());
    }

    #[test_case("x1", true)]
    #[test_case("_a", true)]
    #[test_case("1x", false)]
    #[test_case("None", false)]
    #[test_case("\u{e9}t\u{e9}", false)]
    #[test_case(".0", false)]
    fn identifiers_are_ascii_only(name: &str, expected: bool) {
        assert_eq!(is_identifier(name), expected);
    }
}
