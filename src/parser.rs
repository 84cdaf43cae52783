use super::ast::{Expr, Function, Prototype};
use super::context::OpPrecedence;
use super::token::Token;
use combine::error::{ParseError, StreamError};
use combine::parser::Parser;
use combine::stream::{Stream, StreamErrorFor};
use combine::{attempt, between, choice, many, optional, parser, satisfy_map, sep_by, token};
use std::iter::Peekable;
use std::vec;

/// Top-level expressions lower into a zero-argument function of this name.
pub(crate) const ANON_FN_NAME: &str = "__anon_expr__";

fn ident<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Ident(id) => Some(id),
        _ => None,
    })
}

fn number<Input>() -> impl Parser<Input, Output = f64>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Number(n) => Some(n),
        _ => None,
    })
}

fn op_char<Input>() -> impl Parser<Input, Output = char>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Kwd(c) => Some(c),
        _ => None,
    })
}

/// An operator character in unary position. '(' and ',' are the two
/// characters that can legitimately follow an operand slot without being
/// operators, so they never start a unary expression.
fn unary_op<Input>() -> impl Parser<Input, Output = char>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(|t| match t {
        Token::Kwd(c) if c != '(' && c != ',' => Some(c),
        _ => None,
    })
}

/// An operator character with a declared binary precedence. Undeclared
/// characters stop the binary chain, leaving them for the caller.
fn binary_op<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = char>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    satisfy_map(move |t| match t {
        Token::Kwd(c) if ops.get(c).is_some() => Some(c),
        _ => None,
    })
}

fn args<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Vec<Expr>>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    sep_by(expr(ops), token(Token::Kwd(',')))
}

fn call<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        ident(),
        between(token(Token::Kwd('(')), token(Token::Kwd(')')), args(ops)),
    )
        .map(|(id, aa)| Expr::Call(id, aa))
}

fn primary_<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;
    let number = satisfy_map(|c| match c {
        Number(n) => Some(Expr::Number(n)),
        _ => None,
    });

    let paren = between(token(Kwd('(')), token(Kwd(')')), expr(ops.clone()));

    let variable = ident().map(Expr::Variable);

    choice((
        attempt(number),
        attempt(paren),
        attempt(call(ops.clone())),
        attempt(variable),
        attempt(parse_if(ops.clone())),
        attempt(parse_for(ops)),
    ))
}

parser! {
    fn primary[Input](ops: OpPrecedence)(Input) -> Expr
        where [Input: Stream<Token=Token>]
    {
        primary_(ops.clone())
    }
}

fn parse_if<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;

    (
        token(If),
        expr(ops.clone()),
        token(Then),
        expr(ops.clone()),
        token(Else),
        expr(ops),
    )
        .map(|(_, c, _, t, _, e)| Expr::If(Box::new(c), Box::new(t), Box::new(e)))
}

fn parse_for<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    use super::token::Token::*;

    (
        token(For),
        ident(),
        token(Kwd('=')),
        expr(ops.clone()),
        token(Kwd(',')),
        expr(ops.clone()),
        optional((token(Kwd(',')), expr(ops.clone())).map(|(_, e)| e)),
        token(In),
        expr(ops),
    )
        .map(|(_, id, _, start, _, end, step, _, body)| {
            Expr::For(
                id,
                Box::new(start),
                Box::new(end),
                Box::new(step),
                Box::new(body),
            )
        })
}

fn unary_<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((
        attempt(
            (unary_op(), unary(ops.clone()))
                .map(|(op, operand)| Expr::Unary(op, Box::new(operand))),
        ),
        primary(ops),
    ))
}

parser! {
    fn unary[Input](ops: OpPrecedence)(Input) -> Expr
        where [Input: Stream<Token=Token>]
    {
        unary_(ops.clone())
    }
}

/// Precedence climbing over an already-collected run of `unary (op unary)*`.
/// Equal precedences associate left; an operator that binds tighter than
/// the one to its left is absorbed into that operator's right operand.
fn fold_binops(ops: &OpPrecedence, first: Expr, rest: Vec<(char, Expr)>) -> Expr {
    let mut pending = rest.into_iter().peekable();
    climb(ops, first, &mut pending, 1)
}

fn climb(
    ops: &OpPrecedence,
    mut lhs: Expr,
    pending: &mut Peekable<vec::IntoIter<(char, Expr)>>,
    min_prec: i32,
) -> Expr {
    loop {
        let prec = match pending.peek() {
            Some((op, _)) => match ops.get(*op) {
                Some(prec) if prec >= min_prec => prec,
                _ => return lhs,
            },
            None => return lhs,
        };

        let (op, mut rhs) = match pending.next() {
            Some(next) => next,
            None => return lhs,
        };

        if let Some((next_op, _)) = pending.peek() {
            if ops.get(*next_op).map_or(false, |next_prec| next_prec > prec) {
                rhs = climb(ops, rhs, pending, prec + 1);
            }
        }

        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
}

fn expr_<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Expr>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let table = ops.clone();
    (
        unary(ops.clone()),
        many(attempt((binary_op(ops.clone()), unary(ops)))),
    )
        .map(move |(first, rest): (Expr, Vec<(char, Expr)>)| fold_binops(&table, first, rest))
}

parser! {
    pub(crate) fn expr[Input](ops: OpPrecedence)(Input) -> Expr
        where [Input: Stream<Token=Token>]
    {
        expr_(ops.clone())
    }
}

fn params<Input>() -> impl Parser<Input, Output = Vec<String>>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    between(token(Token::Kwd('(')), token(Token::Kwd(')')), many(ident()))
}

fn plain_proto<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (ident(), params()).map(|(id, aa)| Prototype::new(id, aa))
}

fn unary_proto<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Unary), op_char(), params()).and_then(|(_, op, aa)| {
        if aa.len() != 1 {
            return Err(StreamErrorFor::<Input>::message_static_message(
                "invalid number of operands for unary operator",
            ));
        }
        Ok(Prototype::unary_op(op, aa))
    })
}

fn binary_proto<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Binary), op_char(), optional(number()), params()).and_then(
        |(_, op, prec, aa)| {
            let precedence = prec.map_or(30, |p| p as i32);
            if precedence < 1 || precedence > 100 {
                return Err(StreamErrorFor::<Input>::message_static_message(
                    "invalid precedence: must be 1..100",
                ));
            }
            if aa.len() != 2 {
                return Err(StreamErrorFor::<Input>::message_static_message(
                    "invalid number of operands for binary operator",
                ));
            }
            Ok(Prototype::binary_op(op, aa, precedence))
        },
    )
}

fn prototype<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token> + Clone,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    choice((unary_proto(), binary_proto(), plain_proto()))
}

pub(crate) fn definition<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Function>
where
    Input: Stream<Token = Token> + Clone,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Def), prototype(), expr(ops))
        .map(|(_, p, e)| Function(Box::new(p), Box::new(e)))
}

pub(crate) fn toplevel<Input>(ops: OpPrecedence) -> impl Parser<Input, Output = Function>
where
    Input: Stream<Token = Token> + Clone,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    expr(ops).map(|e| {
        Function(
            Box::new(Prototype::new(ANON_FN_NAME.to_owned(), vec![])),
            Box::new(e),
        )
    })
}

pub(crate) fn extern_parser<Input>() -> impl Parser<Input, Output = Prototype>
where
    Input: Stream<Token = Token> + Clone,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (token(Token::Extern), prototype()).map(|(_, p)| p)
}
