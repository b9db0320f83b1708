pub mod scanner;

pub use scanner::{Scanner, Token, TokenKind};
