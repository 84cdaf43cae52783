/// One lexical token. Any character the lexer does not recognize comes out
/// as `Kwd(c)`, doubling as an operator symbol. End of input is represented
/// by the lexer returning `None` rather than a token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Binary,
    Unary,
    Ident(String),
    Number(f64),
    Kwd(char),
}
