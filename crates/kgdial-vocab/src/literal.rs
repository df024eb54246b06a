//! Parser for the Python-literal subset used by the knowledge resource file.
//!
//! Grammar:
//!
//! ```text
//! value := dict | list | tuple | string | number | True | False | None
//! dict  := '{' (value ':' value (',' value ':' value)* ','?)? '}'
//! list  := '[' (value (',' value)* ','?)? ']'
//! tuple := '(' (value (',' value)* ','?)? ')'
//! ```
//!
//! Strings may be single or double quoted and support the usual backslash
//! escapes. `#` starts a comment that runs to the end of the line. Dict entries
//! keep their file order.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char as pchar, digit0, digit1, one_of},
    combinator::{all_consuming, cut, map, opt, recognize},
    error::{Error, ErrorKind},
    multi::separated_list0,
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

impl Literal {
    pub fn kind(&self) -> &'static str {
        match self {
            Literal::None => "None",
            Literal::Bool(_) => "bool",
            Literal::Int(_) => "int",
            Literal::Float(_) => "float",
            Literal::Str(_) => "str",
            Literal::List(_) => "list",
            Literal::Tuple(_) => "tuple",
            Literal::Dict(_) => "dict",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_seq(&self) -> Option<&[Literal]> {
        match self {
            Literal::List(items) | Literal::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Literal, Literal)]> {
        match self {
            Literal::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Literal> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct LiteralError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Parse a complete literal document.
pub fn parse_literal(text: &str) -> Result<Literal, LiteralError> {
    match all_consuming(terminated(value, ws))(text) {
        Ok((_, literal)) => Ok(literal),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(locate(text, e.input, describe(e.code)))
        }
        Err(nom::Err::Incomplete(_)) => Err(locate(text, "", "unexpected end of input")),
    }
}

fn describe(code: ErrorKind) -> &'static str {
    match code {
        ErrorKind::Eof => "trailing characters after value",
        ErrorKind::Digit => "invalid number",
        ErrorKind::Escaped => "invalid escape sequence",
        ErrorKind::Char => "unexpected character",
        ErrorKind::TooLarge => "containers nested too deeply",
        _ => "expected a literal value",
    }
}

fn locate(text: &str, rest: &str, message: &str) -> LiteralError {
    let offset = text.len() - rest.len();
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let column = offset - before.rfind('\n').map_or(0, |i| i + 1) + 1;
    LiteralError {
        line,
        column,
        message: message.to_string(),
    }
}

// ============================================================================
// Grammar
// ============================================================================

type PResult<'a, T> = IResult<&'a str, T>;

fn fail<T>(input: &str, code: ErrorKind) -> PResult<'_, T> {
    Err(nom::Err::Failure(Error::new(input, code)))
}

/// Whitespace and `#` comments.
fn ws(input: &str) -> PResult<'_, ()> {
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        match trimmed.strip_prefix('#') {
            Some(comment) => rest = comment.find('\n').map_or("", |i| &comment[i..]),
            None => return Ok((trimmed, ())),
        }
    }
}

/// Deepest container nesting accepted.
pub const MAX_DEPTH: usize = 128;

fn value(input: &str) -> PResult<'_, Literal> {
    nested(input, 0)
}

/// A value enclosed by `depth` containers.
fn nested<'a>(input: &'a str, depth: usize) -> PResult<'a, Literal> {
    if depth > MAX_DEPTH {
        return fail(input, ErrorKind::TooLarge);
    }
    let item = move |i: &'a str| nested(i, depth + 1);
    let entry = move |i: &'a str| separated_pair(item, preceded(ws, pchar(':')), item)(i);
    preceded(
        ws,
        alt((
            map(quoted, Literal::Str),
            number,
            map(tag("True"), |_| Literal::Bool(true)),
            map(tag("False"), |_| Literal::Bool(false)),
            map(tag("None"), |_| Literal::None),
            map(seq('[', ']', item), Literal::List),
            map(seq('(', ')', item), Literal::Tuple),
            map(seq('{', '}', entry), Literal::Dict),
        )),
    )(input)
}

/// Comma separated items between `open` and `close`, trailing comma allowed.
///
/// Once the opening delimiter matched, errors are fatal so they point at the
/// offending character instead of backtracking to the outermost value.
fn seq<'a, T, F>(open: char, close: char, item: F) -> impl FnMut(&'a str) -> PResult<'a, Vec<T>>
where
    F: FnMut(&'a str) -> PResult<'a, T>,
{
    let comma = || preceded(ws, pchar(','));
    delimited(
        pchar(open),
        cut(terminated(separated_list0(comma(), item), opt(comma()))),
        cut(preceded(ws, pchar(close))),
    )
}

fn number(input: &str) -> PResult<'_, Literal> {
    let (rest, text) = recognize(tuple((
        opt(one_of("+-")),
        digit1,
        opt(pair(pchar('.'), digit0)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;

    if text.contains(|c| matches!(c, '.' | 'e' | 'E')) {
        match text.parse::<f64>() {
            Ok(f) => Ok((rest, Literal::Float(f))),
            Err(_) => fail(input, ErrorKind::Digit),
        }
    } else {
        match text.parse::<i64>() {
            Ok(i) => Ok((rest, Literal::Int(i))),
            Err(_) => fail(input, ErrorKind::Digit),
        }
    }
}

fn quoted(input: &str) -> PResult<'_, String> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('\'' | '"'))) => q,
        _ => return Err(nom::Err::Error(Error::new(input, ErrorKind::Char))),
    };

    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((&input[i + 1..], out)),
            '\n' => break,
            '\\' => {
                let Some((at, esc)) = chars.next() else {
                    break;
                };
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' | '\'' | '"' => out.push(esc),
                    '\n' => {}
                    'x' | 'u' | 'U' => {
                        let width = match esc {
                            'x' => 2,
                            'u' => 4,
                            _ => 8,
                        };
                        let digits: String = chars.by_ref().take(width).map(|(_, d)| d).collect();
                        let decoded = (digits.len() == width)
                            .then(|| u32::from_str_radix(&digits, 16).ok())
                            .flatten()
                            .and_then(char::from_u32);
                        match decoded {
                            Some(ch) => out.push(ch),
                            None => return fail(&input[at - 1..], ErrorKind::Escaped),
                        }
                    }
                    // unknown escapes are kept verbatim
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            }
            c => out.push(c),
        }
    }
    fail(input, ErrorKind::Char)
}
