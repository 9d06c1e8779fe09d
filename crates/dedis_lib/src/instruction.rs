use std::fmt;

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;

/// One line of `dis` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub line_num: Option<u32>,
    pub offset: usize,
    pub opname: String,
    pub arg: Option<u32>,
    pub argval: Option<String>,
}

impl Instruction {
    pub fn new(offset: usize, opname: &str, arg: Option<u32>, argval: Option<&str>) -> Self {
        Self {
            line_num: None,
            offset,
            opname: opname.to_string(),
            arg,
            argval: argval.map(str::to_string),
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_name(&self.opname)
    }

    pub fn is_store(&self) -> bool {
        self.opcode() == Some(Opcode::Store)
    }

    /// Absolute jump target. Relative jumps are printed as `to N` by `dis`,
    /// absolute ones only carry the raw argument.
    pub fn jump_target(&self) -> Option<usize> {
        if let Some(rest) = self.argval.as_deref().and_then(|v| v.strip_prefix("to ")) {
            return rest.trim().parse().ok();
        }
        self.arg.map(|a| a as usize)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line_num {
            Some(n) => write!(f, "{n:>5} ")?,
            None => write!(f, "      ")?,
        }
        write!(f, "{:05} {:<20}", self.offset, self.opname)?;
        if let Some(arg) = self.arg {
            write!(f, " {arg}")?;
        }
        if let Some(argval) = &self.argval {
            write!(f, " ({argval})")?;
        }
        Ok(())
    }
}

struct RawLine<'a> {
    line_num: Option<u32>,
    offset: usize,
    opname: &'a str,
    arg: Option<u32>,
    argval: Option<&'a str>,
}

/// Converts the text printed by `dis.dis` into instruction records.
///
/// Lines that do not look like an instruction (headers, blank lines,
/// exception tables) are skipped. `EXTENDED_ARG` is folded into the high
/// byte of the following instruction's argument.
pub fn parse_instructions(disasm: &str) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut line_num = None;
    let mut extended_arg: Option<u32> = None;

    for line in disasm.lines() {
        let Some(raw) = parse_line(line) else {
            continue;
        };
        if raw.line_num.is_some() {
            line_num = raw.line_num;
        }
        if raw.opname == "EXTENDED_ARG" {
            extended_arg = raw.arg;
            continue;
        }
        let arg = match (raw.arg, extended_arg.take()) {
            (Some(arg), Some(high)) => Some(arg | (high << 8)),
            (arg, _) => arg,
        };
        instructions.push(Instruction {
            line_num,
            ..Instruction::new(raw.offset, raw.opname, arg, raw.argval)
        });
    }

    instructions
}

fn parse_line(line: &str) -> Option<RawLine<'_>> {
    let tokens = tokenize(line);
    let k = (0..tokens.len().saturating_sub(1))
        .find(|&k| is_number(tokens[k].1) && is_opname(tokens[k + 1].1))?;

    let line_num = if k > 0 && is_number(tokens[0].1) {
        tokens[0].1.parse().ok()
    } else {
        None
    };
    let offset = tokens[k].1.parse().ok()?;
    let opname = tokens[k + 1].1;

    let (arg, argval) = match tokens.get(k + 2) {
        Some(&(pos, tok)) if is_number(tok) => {
            let rest = line[pos + tok.len()..].trim();
            let argval = rest
                .strip_prefix('(')
                .and_then(|r| r.rfind(')').map(|end| &r[..end]))
                .filter(|s| !s.is_empty());
            (tok.parse().ok(), argval)
        }
        _ => (None, None),
    };

    Some(RawLine {
        line_num,
        offset,
        opname,
        arg,
        argval,
    })
}

fn tokenize(line: &str) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, ch) in line.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push((s, &line[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push((s, &line[s..]));
    }
    tokens
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_opname(s: &str) -> bool {
    s.as_bytes().first().is_some_and(u8::is_ascii_uppercase)
        && s.bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
}
