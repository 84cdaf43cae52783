use super::token::Token;
use combine::error::ParseError;
use combine::parser::char::{alpha_num, digit, newline, space};
use combine::parser::choice::or;
use combine::parser::repeat::take_until;
use combine::parser::Parser;
use combine::stream::Stream;
use combine::{any, choice, eof, many1, parser, skip_many, skip_many1, token};

/// Longest-prefix conversion in the manner of strtod: "1.2.3" becomes 1.2
/// and a bare "." becomes 0.0 instead of failing the lex.
fn to_double(ns: &str) -> f64 {
    let mut val = 0.0;
    for end in 1..=ns.len() {
        if let Ok(v) = ns[..end].parse::<f64>() {
            val = v;
        }
    }
    val
}

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.')))).map(|ns: String| Token::Number(to_double(&ns)))
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(alpha_num()).map(|s: String| match s.as_ref() {
        "def" => Token::Def,
        "extern" => Token::Extern,
        "if" => Token::If,
        "then" => Token::Then,
        "else" => Token::Else,
        "for" => Token::For,
        "in" => Token::In,
        "binary" => Token::Binary,
        "unary" => Token::Unary,
        id => Token::Ident(id.to_string()),
    })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many1((
        token('#'),
        take_until::<Vec<_>, _, _>(or(newline().map(|_| ()), eof())),
    ))
}

fn operator<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    any().map(Token::Kwd)
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    skip_many(or(space(), newline())).with(choice((
        number().map(Some),
        ident().map(Some),
        comment().with(lex()),
        eof().map(|_| None),
        operator().map(Some),
    )))
}

parser! {
    pub(crate) fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}
