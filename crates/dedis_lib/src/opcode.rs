//! Opcode families and operator symbol tables.
//!
//! Mnemonics are grouped into a closed set of families so that the
//! reconstruction engine can match on them exhaustively. Anything that does
//! not parse into a family is an unrecognized opcode and is rendered as a
//! placeholder.

use strum::EnumString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ContainerKind {
    List,
    Tuple,
    Set,
}

impl ContainerKind {
    pub fn brackets(self) -> (&'static str, &'static str) {
        match self {
            ContainerKind::List => ("[", "]"),
            ContainerKind::Tuple => ("(", ")"),
            ContainerKind::Set => ("{", "}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum UnaryOperator {
    Positive,
    Negative,
    Not,
    Invert,
}

impl UnaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::Positive => "+",
            UnaryOperator::Negative => "-",
            UnaryOperator::Not => "not ",
            UnaryOperator::Invert => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BinaryOperator {
    Power,
    Multiply,
    MatrixMultiply,
    FloorDivide,
    TrueDivide,
    Modulo,
    Add,
    Subtract,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Power => "**",
            BinaryOperator::Multiply => "*",
            BinaryOperator::MatrixMultiply => "@",
            BinaryOperator::FloorDivide => "//",
            BinaryOperator::TrueDivide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Lshift => "<<",
            BinaryOperator::Rshift => ">>",
            BinaryOperator::And => "&",
            BinaryOperator::Xor => "^",
            BinaryOperator::Or => "|",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `LOAD_METHOD` / `LOAD_ATTR`
    LoadAttr,
    Load { global: bool },
    Store,
    ReturnValue,
    YieldValue,
    Build(ContainerKind),
    BuildMap,
    BuildSlice,
    GetIter,
    ForIter,
    PopJumpIf { on_true: bool },
    JumpAbsolute,
    JumpForward,
    ImportName,
    ImportFrom,
    ImportStar,
    RaiseVarargs,
    /// `CALL_FUNCTION` / `CALL_METHOD`
    CallFunction,
    CallFunctionKw,
    CallFunctionEx,
    MakeFunction,
    ListAppend,
    SetAdd,
    MapAdd,
    UnpackSequence,
    UnpackEx,
    CompareOp,
    IsOp,
    ContainsOp,
    BinarySubscr,
    StoreSubscr,
    Unary(UnaryOperator),
    Binary(BinaryOperator),
    Inplace(BinaryOperator),
    Nop,
    PopTop,
}

impl Opcode {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "LOAD_METHOD" | "LOAD_ATTR" => Opcode::LoadAttr,
            "LOAD_GLOBAL" => Opcode::Load { global: true },
            "LOAD_FAST" | "LOAD_NAME" | "LOAD_CONST" | "LOAD_DEREF" | "LOAD_CLOSURE"
            | "LOAD_CLASSDEREF" => Opcode::Load { global: false },
            "STORE_FAST" | "STORE_NAME" | "STORE_GLOBAL" | "STORE_DEREF" => Opcode::Store,
            "RETURN_VALUE" => Opcode::ReturnValue,
            "YIELD_VALUE" => Opcode::YieldValue,
            "BUILD_MAP" => Opcode::BuildMap,
            "BUILD_SLICE" => Opcode::BuildSlice,
            "GET_ITER" => Opcode::GetIter,
            "FOR_ITER" => Opcode::ForIter,
            "POP_JUMP_IF_FALSE" => Opcode::PopJumpIf { on_true: false },
            "POP_JUMP_IF_TRUE" => Opcode::PopJumpIf { on_true: true },
            "JUMP_ABSOLUTE" => Opcode::JumpAbsolute,
            "JUMP_FORWARD" => Opcode::JumpForward,
            "IMPORT_NAME" => Opcode::ImportName,
            "IMPORT_FROM" => Opcode::ImportFrom,
            "IMPORT_STAR" => Opcode::ImportStar,
            "RAISE_VARARGS" => Opcode::RaiseVarargs,
            "CALL_FUNCTION" | "CALL_METHOD" => Opcode::CallFunction,
            "CALL_FUNCTION_KW" => Opcode::CallFunctionKw,
            "CALL_FUNCTION_EX" => Opcode::CallFunctionEx,
            "MAKE_FUNCTION" => Opcode::MakeFunction,
            "LIST_APPEND" => Opcode::ListAppend,
            "SET_ADD" => Opcode::SetAdd,
            "MAP_ADD" => Opcode::MapAdd,
            "UNPACK_SEQUENCE" => Opcode::UnpackSequence,
            "UNPACK_EX" => Opcode::UnpackEx,
            "COMPARE_OP" => Opcode::CompareOp,
            "IS_OP" => Opcode::IsOp,
            "CONTAINS_OP" => Opcode::ContainsOp,
            "BINARY_SUBSCR" => Opcode::BinarySubscr,
            "STORE_SUBSCR" => Opcode::StoreSubscr,
            "NOP" => Opcode::Nop,
            "POP_TOP" => Opcode::PopTop,
            _ => return Self::from_family(name),
        };
        Some(op)
    }

    fn from_family(name: &str) -> Option<Self> {
        if let Some(kind) = name.strip_prefix("BUILD_") {
            return kind.parse().ok().map(Opcode::Build);
        }
        if let Some(op) = name.strip_prefix("UNARY_") {
            return op.parse().ok().map(Opcode::Unary);
        }
        if let Some(op) = name.strip_prefix("BINARY_") {
            return op.parse().ok().map(Opcode::Binary);
        }
        if let Some(op) = name.strip_prefix("INPLACE_") {
            return op.parse().ok().map(Opcode::Inplace);
        }
        None
    }
}
