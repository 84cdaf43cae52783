use failure::{Backtrace, Context, Fail};
use std::fmt;

/// Failure past the parser: lowering, verification and JIT plumbing.
/// Parse failures stay inside combine's error types.
#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "unknown variable name: {}", _0)]
    UnknownVariable(String),
    #[fail(display = "unknown function referenced: {}", _0)]
    UnknownFunction(String),
    #[fail(display = "incorrect number of arguments passed to {}", _0)]
    ArityMismatch(String),
    #[fail(display = "redefinition of {} with a different number of parameters", _0)]
    Redefinition(String),
    #[fail(display = "unknown unary operator: {}", _0)]
    UnknownUnaryOperator(char),
    #[fail(display = "unknown binary operator: {}", _0)]
    UnknownBinaryOperator(char),
    #[fail(display = "function verification failed: {}", _0)]
    Verify(String),
    #[fail(display = "jit: {}", _0)]
    Jit(String),
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
