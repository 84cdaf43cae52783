/// A function signature: name, parameter names, and operator metadata for
/// user-defined operators. Operator functions are stored under a mangled
/// name whose last character is the operator itself ("unary!", "binary%").
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub(crate) name: String,
    pub(crate) args: Vec<String>,
    pub(crate) is_operator: bool,
    pub(crate) precedence: i32,
}

impl Prototype {
    pub(crate) fn new(name: String, args: Vec<String>) -> Prototype {
        Prototype {
            name,
            args,
            is_operator: false,
            precedence: 0,
        }
    }

    pub(crate) fn unary_op(op: char, args: Vec<String>) -> Prototype {
        Prototype {
            name: format!("unary{}", op),
            args,
            is_operator: true,
            precedence: 30,
        }
    }

    pub(crate) fn binary_op(op: char, args: Vec<String>, precedence: i32) -> Prototype {
        Prototype {
            name: format!("binary{}", op),
            args,
            is_operator: true,
            precedence,
        }
    }

    pub(crate) fn is_unary_op(&self) -> bool {
        self.is_operator && self.args.len() == 1
    }

    pub(crate) fn is_binary_op(&self) -> bool {
        self.is_operator && self.args.len() == 2
    }

    pub(crate) fn operator_char(&self) -> Option<char> {
        if self.is_operator {
            self.name.chars().last()
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Unary(char, Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// for <var> = <start>, <end> [, <step>] in <body>; step defaults to 1.0
    For(String, Box<Expr>, Box<Expr>, Box<Option<Expr>>, Box<Expr>),
}

#[derive(Debug, PartialEq)]
pub(crate) struct Function(pub(crate) Box<Prototype>, pub(crate) Box<Expr>);
