//! INI-style parameter parsing.
//!
//! Converts a CLI string like `name=val,count=+7,list=[1,2,{k=v}]` into a
//! map [`Value`]. The grammar:
//!
//! - identifiers: `[A-Za-z_][A-Za-z0-9_.:-]*`
//! - integers in bases 2/8/16 with C-style prefixes (`0b`, `0`, `0x`) or
//!   plain decimal; a leading `+` forces the unsigned arm, a leading `-`
//!   negates and forces the signed arm
//! - reals: decimal with fraction and/or exponent
//! - double-quoted strings with the usual escapes
//! - the closed keyword sets `null`/`NULL`/`nul`, `true`/`TRUE`/`yes`/`YES`
//!   and `false`/`FALSE`/`no`/`NO`; any other bare identifier is a string
//! - arrays `[...]` and maps `{k=v, ...}` nest arbitrarily and accept a
//!   trailing comma
//!
//! The top level is a comma-separated list of `key=value` pairs producing
//! a map. Parse errors carry a one-line source excerpt with a caret
//! pointing at the offending position.

use crate::values::Value;

/// A parameter-string parse error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParamError {
    pub message: String,
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Any single punctuation character: `, = [ ] { } + -` and anything
    /// the lexer does not otherwise recognize.
    Char(char),
    Int(u64),
    Float(f64),
    Str(String),
    Ident(String),
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    /// Byte position of the next unread character.
    pos: usize,
    /// Byte position where the current token started.
    token_start: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            token_start: 0,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error_expecting(&self, expecting: &str) -> ParamError {
        error_at(self.src, self.token_start, expecting)
    }

    fn next_token(&mut self) -> Result<Token, ParamError> {
        while matches!(self.peek_char(), Some(' ' | '\t' | '\n')) {
            self.bump();
        }
        self.token_start = self.pos;

        let Some(c) = self.peek_char() else {
            return Ok(Token::Eof);
        };

        if c == '_' || c.is_ascii_alphabetic() {
            return Ok(self.lex_ident());
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == '"' {
            return self.lex_string();
        }
        self.bump();
        Ok(Token::Char(c))
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '_' || c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-') {
                self.bump();
            } else {
                break;
            }
        }
        Token::Ident(self.src[start..self.pos].to_string())
    }

    fn lex_number(&mut self) -> Result<Token, ParamError> {
        let start = self.pos;
        let rest = &self.src[self.pos..];

        if rest.starts_with("0x") || rest.starts_with("0X") {
            self.pos += 2;
            return self.lex_radix_digits(16, "hexadecimal digit");
        }
        if rest.starts_with("0b") || rest.starts_with("0B") {
            self.pos += 2;
            return self.lex_radix_digits(2, "binary digit");
        }
        if rest.starts_with('0')
            && rest[1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_digit(8))
        {
            self.pos += 1;
            return self.lex_radix_digits(8, "octal digit");
        }

        // Decimal integer or real.
        while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek_char() == Some('.') {
            is_float = true;
            self.bump();
            while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.bump();
            }
            while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }

        let text = &self.src[start..self.pos];
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error_expecting("a real number"))?;
            Ok(Token::Float(value))
        } else {
            self.accumulate(text, 10)
        }
    }

    fn lex_radix_digits(&mut self, radix: u32, expecting: &str) -> Result<Token, ParamError> {
        let start = self.pos;
        while self.peek_char().is_some_and(|c| c.is_digit(radix)) {
            self.bump();
        }
        let digits = &self.src[start..self.pos];
        if digits.is_empty() {
            return Err(self.error_expecting(expecting));
        }
        self.accumulate(digits, radix)
    }

    fn accumulate(&self, digits: &str, radix: u32) -> Result<Token, ParamError> {
        let mut acc: u64 = 0;
        for c in digits.chars() {
            let digit = c.to_digit(radix).unwrap() as u64;
            acc = acc
                .checked_mul(radix as u64)
                .and_then(|a| a.checked_add(digit))
                .ok_or_else(|| ParamError {
                    message: format!(
                        "Integer value {digits} is outside the range of a 64-bit unsigned integer"
                    ),
                })?;
        }
        Ok(Token::Int(acc))
    }

    fn lex_string(&mut self) -> Result<Token, ParamError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error_expecting("closing `\"`")),
                Some('"') => return Ok(Token::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c @ ('"' | '\\')) => out.push(c),
                    _ => return Err(self.error_expecting("a valid escape sequence")),
                },
                Some(c) => out.push(c),
            }
        }
    }
}

fn error_at(src: &str, pos: usize, expecting: &str) -> ParamError {
    let mut message = format!("Expecting {expecting}:");
    // Only point at the source when it is a single non-empty line.
    if !src.is_empty() && !src.contains('\n') {
        message.push_str(&format!("\n\n    {src}\n"));
        let column = src[..pos.min(src.len())].chars().count();
        message.push_str(&" ".repeat(4 + column));
        message.push('^');
    }
    ParamError { message }
}

// === Parser ===

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    fn error_expecting(&self, expecting: &str) -> ParamError {
        self.lexer.error_expecting(expecting)
    }

    /// Signed-arm integer conversion shared by the bare and negated cases.
    fn signed(&self, magnitude: u64, negative: bool) -> Result<Value, ParamError> {
        if negative {
            if magnitude > (i64::MAX as u64) + 1 {
                return Err(ParamError {
                    message: format!(
                        "Integer value -{magnitude} is outside the range of a 64-bit signed integer"
                    ),
                });
            }
            if magnitude == (i64::MAX as u64) + 1 {
                Ok(Value::int(i64::MIN))
            } else {
                Ok(Value::int(-(magnitude as i64)))
            }
        } else {
            if magnitude > i64::MAX as u64 {
                return Err(ParamError {
                    message: format!(
                        "Integer value {magnitude} is outside the range of a 64-bit signed integer"
                    ),
                });
            }
            Ok(Value::int(magnitude as i64))
        }
    }

    /// Parses the value starting at `token`.
    fn parse_value(&mut self, token: Token) -> Result<Value, ParamError> {
        match token {
            Token::Char('-') => {
                // Negative number.
                match self.lexer.next_token()? {
                    Token::Int(magnitude) => self.signed(magnitude, true),
                    Token::Float(real) => Ok(Value::real(-real)),
                    _ => Err(self.error_expecting("value")),
                }
            }
            Token::Char('+') => {
                // Unsigned integer.
                match self.lexer.next_token()? {
                    Token::Int(magnitude) => Ok(Value::uint(magnitude)),
                    _ => Err(self.error_expecting("integer value")),
                }
            }
            Token::Char('[') => self.parse_array(),
            Token::Char('{') => self.parse_map(),
            Token::Int(magnitude) => self.signed(magnitude, false),
            Token::Float(real) => Ok(Value::real(real)),
            Token::Str(s) => Ok(Value::string(s)),
            Token::Ident(id) => Ok(match id.as_str() {
                "null" | "NULL" | "nul" => Value::null(),
                "true" | "TRUE" | "yes" | "YES" => Value::bool(true),
                "false" | "FALSE" | "no" | "NO" => Value::bool(false),
                _ => Value::string(id),
            }),
            _ => Err(self.error_expecting("value")),
        }
    }

    /// Parses the remainder of an array; the opening `[` was consumed.
    /// A trailing comma before the closing `]` is accepted.
    fn parse_array(&mut self) -> Result<Value, ParamError> {
        let array = Value::new_array();
        let mut token = self.lexer.next_token()?;
        while token != Token::Char(']') {
            let item = self.parse_value(token)?;
            array.array_push(item).expect("array under construction");

            token = self.lexer.next_token()?;
            if token == Token::Char(',') {
                token = self.lexer.next_token()?;
            } else if token != Token::Char(']') {
                return Err(self.error_expecting("`,` or `]`"));
            }
        }
        Ok(array)
    }

    /// Parses the remainder of a map; the opening `{` was consumed.
    fn parse_map(&mut self) -> Result<Value, ParamError> {
        let map = Value::new_map();
        let mut token = self.lexer.next_token()?;
        while token != Token::Char('}') {
            let Token::Ident(key) = token else {
                return Err(self.error_expecting("unquoted map key"));
            };
            if self.lexer.next_token()? != Token::Char('=') {
                return Err(self.error_expecting("'='"));
            }
            let value_token = self.lexer.next_token()?;
            let value = self.parse_value(value_token)?;
            map.map_insert(key, value).expect("map under construction");

            token = self.lexer.next_token()?;
            if token == Token::Char(',') {
                token = self.lexer.next_token()?;
            } else if token != Token::Char('}') {
                return Err(self.error_expecting("`,` or `}`"));
            }
        }
        Ok(map)
    }
}

/// What the top-level FSM expects next.
enum Expecting {
    MapKey,
    Equal,
    Value,
    Comma,
}

/// Converts an INI-style argument to a map value.
pub fn parse(arg: &str) -> Result<Value, ParamError> {
    let mut parser = Parser {
        lexer: Lexer::new(arg),
    };
    let params = Value::new_map();
    let mut expecting = Expecting::MapKey;
    let mut last_key = String::new();

    loop {
        let token = parser.lexer.next_token()?;
        if token == Token::Eof {
            return match expecting {
                // An empty string and a complete trailing pair are both
                // valid endings.
                Expecting::MapKey if params.map_len() == Some(0) => Ok(params),
                Expecting::Comma => Ok(params),
                Expecting::MapKey => Err(parser.error_expecting("unquoted map key")),
                Expecting::Equal => Err(parser.error_expecting("`=`")),
                Expecting::Value => Err(parser.error_expecting("value")),
            };
        }

        match expecting {
            Expecting::MapKey => {
                let Token::Ident(key) = token else {
                    return Err(parser.error_expecting("unquoted map key"));
                };
                last_key = key;
                expecting = Expecting::Equal;
            }
            Expecting::Equal => {
                if token != Token::Char('=') {
                    return Err(parser.error_expecting("'='"));
                }
                expecting = Expecting::Value;
            }
            Expecting::Value => {
                let value = parser.parse_value(token)?;
                params
                    .map_insert(last_key.clone(), value)
                    .expect("params map under construction");
                expecting = Expecting::Comma;
            }
            Expecting::Comma => {
                if token != Token::Char(',') {
                    return Err(parser.error_expecting("','"));
                }
                expecting = Expecting::MapKey;
            }
        }
    }
}

// === Formatting ===

fn format_into(value: &Value, out: &mut String) {
    use crate::values::ValueKind;

    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Bool => out.push_str(if value.as_bool().unwrap() { "true" } else { "false" }),
        ValueKind::Int => out.push_str(&value.as_int().unwrap().to_string()),
        ValueKind::UInt => {
            out.push('+');
            out.push_str(&value.as_uint().unwrap().to_string());
        }
        ValueKind::Real => out.push_str(&format!("{:?}", value.as_real().unwrap())),
        ValueKind::String => {
            out.push('"');
            for c in value.as_string().unwrap().chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    '\0' => out.push_str("\\0"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        ValueKind::Array => {
            out.push('[');
            let len = value.array_len().unwrap();
            for i in 0..len {
                if i > 0 {
                    out.push(',');
                }
                format_into(&value.array_get(i).unwrap(), out);
            }
            out.push(']');
        }
        ValueKind::Map => {
            out.push('{');
            for (i, (key, entry)) in value.map_entries().unwrap().iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push('=');
                format_into(entry, out);
            }
            out.push('}');
        }
    }
}

/// Formats a map value back into the INI grammar, such that
/// `parse(format(v)) == v` for any real-free value tree `v`.
///
/// The top-level map formats without braces, as `k=v,k2=v2`.
pub fn format(params: &Value) -> String {
    let mut out = String::new();
    if let Some(entries) = params.map_entries() {
        for (i, (key, entry)) in entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(key);
            out.push('=');
            format_into(entry, &mut out);
        }
    } else {
        format_into(params, &mut out);
    }
    out
}
