pub mod ast;
pub mod engine;
pub mod instruction;
pub mod opcode;
pub mod segment;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use ast::Node;
pub use engine::{Flags, Reconstruction, Statement, reconstruct, render_statements};
pub use instruction::{Instruction, parse_instructions};
pub use segment::{Segment, split_segments, strip_comments};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Instructions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    /// One level of indentation in the output.
    pub indent: String,
    pub comprehension: bool,
    pub generator_expression: bool,
    pub raw_jumps: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Pseudo,
            indent: "\t".into(),
            comprehension: false,
            generator_expression: false,
            raw_jumps: false,
        }
    }
}

impl DecompileOptions {
    fn flags(&self) -> Flags {
        Flags {
            comprehension: self.comprehension,
            generator_expression: self.generator_expression,
            raw_jumps: self.raw_jumps,
        }
    }
}

#[derive(Debug, Error)]
pub enum DedisError {
    #[error("stack underflow at offset {offset} ({opname})")]
    StackUnderflow { offset: usize, opname: String },

    #[error("unexpected end of instructions after offset {offset} ({opname})")]
    UnexpectedEnd { offset: usize, opname: String },

    #[error("missing argument at offset {offset} ({opname})")]
    MissingArgument { offset: usize, opname: String },

    #[error("invalid jump target at offset {offset} ({opname})")]
    InvalidJumpTarget { offset: usize, opname: String },

    #[error("malformed unpack at offset {offset} (expected {expected} stores)")]
    MalformedUnpack { offset: usize, expected: usize },
}

/// Renders one segment as a function definition.
pub fn decompile_segment(segment: &Segment<'_>, options: &DecompileOptions) -> Result<String, DedisError> {
    let instructions = parse_instructions(segment.body);
    let flags = Flags::for_segment(&segment.name).union(options.flags());
    debug!(
        segment = %segment.name,
        instructions = instructions.len(),
        comprehension = flags.comprehension,
        generator_expression = flags.generator_expression,
        "decompiling segment"
    );

    let mut out = String::new();
    match options.mode {
        DecompileMode::Pseudo => {
            let Reconstruction { statements, arg_names } = reconstruct(&instructions, flags)?;
            out.push_str(&format!("def {}({}):\n", segment.name, arg_names.join(",")));
            if statements.is_empty() {
                out.push_str(&options.indent);
                out.push_str("pass\n");
            } else {
                let body = render_statements(&statements, &options.indent, flags.raw_jumps);
                for line in body.lines() {
                    out.push_str(&options.indent);
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        DecompileMode::Instructions => {
            out.push_str(&format!("segment {} (instructions={})\n", segment.name, instructions.len()));
            for ins in &instructions {
                out.push_str(&format!("{ins}\n"));
            }
        }
    }
    Ok(out)
}

pub fn decompile_with_options(dump: &str, options: &DecompileOptions) -> Result<String, DedisError> {
    let dump = strip_comments(dump);
    let mut out = String::new();
    for segment in split_segments(&dump) {
        let s = decompile_segment(&segment, options)?;
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&s);
    }
    Ok(out)
}

pub fn decompile_with_mode(dump: &str, mode: DecompileMode) -> Result<String, DedisError> {
    decompile_with_options(
        dump,
        &DecompileOptions {
            mode,
            ..DecompileOptions::default()
        },
    )
}

pub fn decompile(dump: &str) -> Result<String, DedisError> {
    decompile_with_options(dump, &DecompileOptions::default())
}
