//! Session filter expressions
//!
//! ```text
//! expr   := term ( "or" term )*
//! term   := factor ( "and" factor )*
//! factor := "all" | "(" expr ")" | ATTR ( "EQ" | "NE" ) 'value'
//! ATTR   := "$Principal" | "$SessionId"
//! ```
//!
//! Keywords are case-insensitive, attribute names are not. Values are single
//! quoted; a quote inside a value is written as `\'`.

use std::fmt;

use crate::transport::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Principal,
    SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Clause {
        attribute: Attribute,
        comparison: Comparison,
        value: String,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

/// What a filter can see of a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionAttributes<'a> {
    pub principal: &'a str,
    pub session_id: &'a SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(word) => f.write_str(word),
            Token::Quoted(value) => write!(f, "'{value}'"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err("unterminated escape".to_string()),
                        },
                        Some('\'') => break,
                        Some(other) => value.push(other),
                        None => return Err("unterminated quoted value".to_string()),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '\'') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn expr(&mut self) -> Result<Filter, String> {
        let mut left = self.term()?;
        while self.keyword("or") {
            self.next();
            let right = self.term()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Filter, String> {
        let mut left = self.factor()?;
        while self.keyword("and") {
            self.next();
            let right = self.factor()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Filter, String> {
        match self.next() {
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("all") => Ok(Filter::All),
            Some(Token::Word(word)) => {
                let attribute = match word.as_str() {
                    "$Principal" => Attribute::Principal,
                    "$SessionId" => Attribute::SessionId,
                    other => return Err(format!("unknown attribute '{other}'")),
                };
                let comparison = match self.next() {
                    Some(Token::Word(op)) if op.eq_ignore_ascii_case("eq") => Comparison::Eq,
                    Some(Token::Word(op)) if op.eq_ignore_ascii_case("ne") => Comparison::Ne,
                    Some(other) => return Err(format!("expected EQ or NE, found '{other}'")),
                    None => return Err("expected EQ or NE".to_string()),
                };
                match self.next() {
                    Some(Token::Quoted(value)) => Ok(Filter::Clause {
                        attribute,
                        comparison,
                        value,
                    }),
                    Some(other) => Err(format!("expected a quoted value, found '{other}'")),
                    None => Err("expected a quoted value".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected '{other}'")),
            None => Err("unexpected end of filter".to_string()),
        }
    }
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err("filter is empty".to_string());
        }
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let filter = parser.expr()?;
        match parser.peek() {
            None => Ok(filter),
            Some(token) => Err(format!("unexpected '{token}'")),
        }
    }

    pub fn matches(&self, session: &SessionAttributes<'_>) -> bool {
        match self {
            Filter::All => true,
            Filter::Clause {
                attribute,
                comparison,
                value,
            } => {
                let actual = match attribute {
                    Attribute::Principal => session.principal,
                    Attribute::SessionId => session.session_id.as_str(),
                };
                match comparison {
                    Comparison::Eq => actual == value,
                    Comparison::Ne => actual != value,
                }
            }
            Filter::And(left, right) => left.matches(session) && right.matches(session),
            Filter::Or(left, right) => left.matches(session) || right.matches(session),
        }
    }
}
