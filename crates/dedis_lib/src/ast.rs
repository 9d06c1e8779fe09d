//! Statement and expression nodes recovered from bytecode.
//!
//! Every node renders itself through `Display`. Rendering depends only on
//! the node's own fields, so the same tree always prints the same text.

use std::fmt;

use crate::opcode::{BinaryOperator, ContainerKind, UnaryOperator};

/// A name bound by `from module import name [as alias]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

impl fmt::Display for ImportedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} as {alias}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(String),
    Attribute {
        object: Box<Node>,
        name: String,
    },
    Assign {
        target: Box<Node>,
        value: Box<Node>,
    },
    SubscriptAssign {
        container: Box<Node>,
        subscript: Box<Node>,
        value: Box<Node>,
    },
    Return(Box<Node>),
    Yield(Box<Node>),
    ForLoop {
        target: Box<Node>,
        iterator: Box<Node>,
    },
    WhileLoop(Box<Node>),
    If(Box<Node>),
    Elif(Box<Node>),
    Else,
    Break,
    Continue,
    Import {
        module: String,
        alias: Option<String>,
    },
    FromImport {
        module: String,
        names: Vec<ImportedName>,
    },
    Raise {
        exception: Option<Box<Node>>,
        cause: Option<Box<Node>>,
    },
    /// Explicit jump, only produced when control flow is not reconstructed.
    Jump {
        target: usize,
        condition: Option<Box<Node>>,
    },
    Build {
        kind: ContainerKind,
        items: Vec<Node>,
    },
    /// Flat `[value, key, value, key, ...]` list in push order.
    BuildMap(Vec<Node>),
    FunctionCall {
        func: Box<Node>,
        args: Vec<Node>,
        kwargs: Vec<(String, Node)>,
    },
    /// Forwarding wrapper standing in for a nested function that captures
    /// variables from the enclosing scope.
    Closure {
        target: String,
        captured: Vec<String>,
    },
    Iter(Box<Node>),
    UnpackSeq(Box<Node>),
    UnpackDict(Box<Node>),
    Slice {
        start: Option<Box<Node>>,
        stop: Option<Box<Node>>,
        step: Option<Box<Node>>,
    },
    SubscriptSlice {
        value: Box<Node>,
        start: Option<Box<Node>>,
        stop: Option<Box<Node>>,
        step: Option<Box<Node>>,
    },
    Subscript {
        value: Box<Node>,
        index: Box<Node>,
    },
    Comparison {
        op: String,
        left: Box<Node>,
        right: Box<Node>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Node>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<Node>,
        right: Box<Node>,
    },
    InplaceOp {
        op: BinaryOperator,
        target: String,
        value: Box<Node>,
    },
    /// Placeholder for anything the engine could not classify.
    Invalid {
        opname: String,
        arg: Option<u32>,
        argval: Option<String>,
    },
}

impl Node {
    pub fn value(name: impl Into<String>) -> Self {
        Node::Value(name.into())
    }

    pub fn assign(target: Node, value: Node) -> Self {
        Node::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn call(func: Node, args: Vec<Node>) -> Self {
        Node::FunctionCall {
            func: Box::new(func),
            args,
            kwargs: Vec::new(),
        }
    }

    pub fn attribute(object: Node, name: impl Into<String>) -> Self {
        Node::Attribute {
            object: Box::new(object),
            name: name.into(),
        }
    }

    pub fn not(operand: Node) -> Self {
        Node::UnaryOp {
            op: UnaryOperator::Not,
            operand: Box::new(operand),
        }
    }

    pub fn tuple(items: Vec<Node>) -> Self {
        Node::Build {
            kind: ContainerKind::Tuple,
            items,
        }
    }

    pub fn slice(start: Node, stop: Node, step: Option<Node>) -> Self {
        Node::Slice {
            start: bound(start),
            stop: bound(stop),
            step: step.and_then(bound),
        }
    }

    /// Leaf-like nodes never need parentheses when used as an operand.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Node::Value(_)
                | Node::Attribute { .. }
                | Node::Subscript { .. }
                | Node::SubscriptSlice { .. }
                | Node::FunctionCall { .. }
        )
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

/// A `None` constant in a slice means the bound was left out.
fn bound(node: Node) -> Option<Box<Node>> {
    match node {
        Node::Value(ref v) if v == "None" => None,
        other => Some(Box::new(other)),
    }
}

struct Operand<'a>(&'a Node);

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_leaf() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "({})", self.0)
        }
    }
}

struct Bound<'a>(&'a Option<Box<Node>>, &'static str);

impl fmt::Display for Bound<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(node) => write!(f, "{node}"),
            None => f.write_str(self.1),
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: impl IntoIterator<Item = T>) -> fmt::Result {
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn is_word_operator(op: &str) -> bool {
    op.starts_with(|c: char| c.is_ascii_alphabetic())
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Value(v) => f.write_str(v),
            Node::Attribute { object, name } => write!(f, "{object}.{name}"),
            Node::Assign { target, value } => write!(f, "{target}={value}"),
            Node::SubscriptAssign {
                container,
                subscript,
                value,
            } => write!(f, "{container}[{subscript}]={value}"),
            Node::Return(v) => write!(f, "return {v}"),
            Node::Yield(v) => write!(f, "yield {v}"),
            Node::ForLoop { target, iterator } => write!(f, "for {target} in {iterator}:"),
            Node::WhileLoop(cond) => write!(f, "while {cond}:"),
            Node::If(cond) => write!(f, "if {cond}:"),
            Node::Elif(cond) => write!(f, "elif {cond}:"),
            Node::Else => f.write_str("else:"),
            Node::Break => f.write_str("break"),
            Node::Continue => f.write_str("continue"),
            Node::Import { module, alias } => match alias {
                Some(alias) => write!(f, "import {module} as {alias}"),
                None => write!(f, "import {module}"),
            },
            Node::FromImport { module, names } => {
                write!(f, "from {module} import ")?;
                write_joined(f, names)
            }
            Node::Raise { exception, cause } => match (exception, cause) {
                (Some(exc), Some(cause)) => write!(f, "raise {exc} from {cause}"),
                (Some(exc), None) => write!(f, "raise {exc}"),
                _ => f.write_str("raise"),
            },
            Node::Jump { target, condition } => match condition {
                Some(cond) => write!(f, "if {cond}: goto {target}"),
                None => write!(f, "goto {target}"),
            },
            Node::Build { kind, items } => {
                if *kind == ContainerKind::Set && items.is_empty() {
                    return f.write_str("set()");
                }
                let (open, close) = kind.brackets();
                f.write_str(open)?;
                write_joined(f, items)?;
                if *kind == ContainerKind::Tuple && items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(close)
            }
            Node::BuildMap(args) => {
                f.write_str("{")?;
                let pairs = args.chunks(2).filter(|pair| pair.len() == 2);
                write_joined(f, pairs.map(|pair| format!("{}:{}", pair[1], pair[0])))?;
                f.write_str("}")
            }
            Node::FunctionCall { func, args, kwargs } => {
                write!(f, "{func}(")?;
                let positional = args.iter().map(ToString::to_string);
                let keyword = kwargs.iter().map(|(k, v)| format!("{k}={v}"));
                write_joined(f, positional.chain(keyword))?;
                f.write_str(")")
            }
            Node::Closure { target, captured } => {
                write!(f, "(lambda *args,**kwargs:{target}(")?;
                for name in captured {
                    write!(f, "{name},")?;
                }
                f.write_str("*args,**kwargs))")
            }
            Node::Iter(v) => write!(f, "iter({v})"),
            Node::UnpackSeq(v) => write!(f, "*{v}"),
            Node::UnpackDict(v) => write!(f, "**{v}"),
            Node::Slice { start, stop, step } => {
                write!(f, "slice({},{}", Bound(start, "None"), Bound(stop, "None"))?;
                if let Some(step) = step {
                    write!(f, ",{step}")?;
                }
                f.write_str(")")
            }
            Node::SubscriptSlice {
                value,
                start,
                stop,
                step,
            } => {
                write!(f, "{value}[{}:{}", Bound(start, ""), Bound(stop, ""))?;
                if let Some(step) = step {
                    write!(f, ":{step}")?;
                }
                f.write_str("]")
            }
            Node::Subscript { value, index } => write!(f, "{value}[{index}]"),
            Node::Comparison { op, left, right } => {
                if is_word_operator(op) {
                    write!(f, "{} {op} {}", Operand(left), Operand(right))
                } else {
                    write!(f, "{}{op}{}", Operand(left), Operand(right))
                }
            }
            Node::UnaryOp { op, operand } => write!(f, "{}{}", op.symbol(), Operand(operand)),
            Node::BinaryOp { op, left, right } => {
                write!(f, "{}{}{}", Operand(left), op.symbol(), Operand(right))
            }
            Node::InplaceOp { op, target, value } => write!(f, "{target}{}={value}", op.symbol()),
            Node::Invalid { opname, arg, argval } => {
                let arg = arg.map_or_else(|| "None".to_string(), |a| a.to_string());
                write!(f, "<{opname}({arg},{})>", argval.as_deref().unwrap_or("None"))
            }
        }
    }
}
