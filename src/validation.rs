//! Validation System - Document Grammar Backstop
//!
//! The host loads its config as a JavaScript object literal. Every render
//! is parsed back against that grammar before it is accepted: balanced
//! nesting, no stray or doubled separators, every element a literal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

const MAX_DEPTH: usize = 128;
const DECLARATION_KEYWORDS: [&str; 3] = ["let", "const", "var"];

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("line {line}, column {column}: {message}")]
pub struct DocumentViolation {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// A well-formed config document.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    /// Variable the root literal is bound to (`config` in `let config = {...}`)
    pub binding: Option<String>,
    pub root: Value,
}

/// Parse a whole config document.
pub fn parse_document(text: &str) -> Result<ParsedDocument, DocumentViolation> {
    let mut cursor = Cursor::new(text);
    cursor.skip_trivia()?;
    let binding = cursor.declaration()?;
    cursor.skip_trivia()?;
    let root = cursor.value(0)?;
    cursor.skip_trivia()?;
    if cursor.peek() == Some(';') {
        cursor.bump();
    }

    if binding.is_some() {
        cursor.skip_trivia()?;
        if cursor.peek() == Some(',') {
            return Err(cursor.violation("stray separator after document root"));
        }
        cursor.balanced_trailer()?;
    } else {
        cursor.skip_trivia()?;
        if cursor.peek().is_some() {
            return Err(cursor.violation("unexpected content after document root"));
        }
    }

    Ok(ParsedDocument { binding, root })
}

/// A fragment that parsed as exactly one element literal.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedElement {
    pub value: Value,
    /// The text ends inside a `//` comment, so nothing may follow it on the same line.
    pub open_line_comment: bool,
}

/// Parse a fragment that must be exactly one element literal.
pub fn parse_fragment(text: &str) -> Result<ParsedElement, DocumentViolation> {
    let mut cursor = Cursor::new(text);
    cursor.skip_trivia()?;
    if cursor.peek().is_none() {
        return Err(cursor.violation("empty fragment"));
    }
    let value = cursor.value(0)?;
    cursor.skip_trivia()?;
    match cursor.peek() {
        None => Ok(ParsedElement {
            value,
            open_line_comment: cursor.open_line_comment,
        }),
        Some(',') => Err(cursor.violation("fragment carries a trailing separator")),
        Some(c) => Err(cursor.violation(format!("unexpected `{}` after element", c))),
    }
}

pub fn parse_element(text: &str) -> Result<Value, DocumentViolation> {
    parse_fragment(text).map(|element| element.value)
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    /// Last `//` comment ran to the end of the text without a newline
    open_line_comment: bool,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            open_line_comment: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn violation(&self, message: impl Into<String>) -> DocumentViolation {
        DocumentViolation {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), DocumentViolation> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.violation(format!("expected `{}`, found `{}`", expected, c))),
            None => Err(self.violation(format!("expected `{}`, found end of document", expected))),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), DocumentViolation> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    self.open_line_comment = true;
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            self.open_line_comment = false;
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let start = self.violation("unterminated comment");
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => return Err(start),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn identifier(&mut self) -> Option<String> {
        let first = self.peek()?;
        if !(first.is_ascii_alphabetic() || first == '_' || first == '$') {
            return None;
        }
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Some(ident)
    }

    /// `let NAME =`, `module.exports =`, or nothing for a bare literal.
    fn declaration(&mut self) -> Result<Option<String>, DocumentViolation> {
        let saved = (self.pos, self.line, self.column);
        let Some(keyword) = self.identifier() else {
            return Ok(None);
        };

        let binding = if DECLARATION_KEYWORDS.contains(&keyword.as_str()) {
            self.skip_trivia()?;
            self.identifier()
                .ok_or_else(|| self.violation(format!("expected a name after `{}`", keyword)))?
        } else if keyword == "module" && self.peek() == Some('.') {
            self.bump();
            match self.identifier() {
                Some(member) if member == "exports" => "module.exports".to_string(),
                _ => return Err(self.violation("expected `module.exports`")),
            }
        } else {
            (self.pos, self.line, self.column) = saved;
            return Ok(None);
        };

        self.skip_trivia()?;
        self.expect('=')?;
        Ok(Some(binding))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DocumentViolation> {
        if depth > MAX_DEPTH {
            return Err(self.violation("nesting too deep"));
        }
        match self.peek() {
            Some('{') => self.object(depth),
            Some('[') => self.array(depth),
            Some(q @ ('"' | '\'')) => self.string(q).map(Value::String),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(_) => {
                let at = self.violation("");
                match self.identifier() {
                    Some(ident) => match ident.as_str() {
                        "true" => Ok(Value::Bool(true)),
                        "false" => Ok(Value::Bool(false)),
                        "null" => Ok(Value::Null),
                        _ => Err(DocumentViolation {
                            message: format!("unexpected identifier `{}`", ident),
                            ..at
                        }),
                    },
                    None => Err(self.unexpected("a value")),
                }
            }
            None => Err(self.violation("expected a value, found end of document")),
        }
    }

    fn unexpected(&self, wanted: &str) -> DocumentViolation {
        match self.peek() {
            Some(',') => self.violation("unexpected separator"),
            Some(c) => self.violation(format!("expected {}, found `{}`", wanted, c)),
            None => self.violation(format!("expected {}, found end of document", wanted)),
        }
    }

    fn object(&mut self, depth: usize) -> Result<Value, DocumentViolation> {
        self.expect('{')?;
        let mut map = Map::new();
        self.skip_trivia()?;
        if self.peek() == Some('}') {
            self.bump();
            return Ok(Value::Object(map));
        }

        loop {
            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => self.string(q)?,
                _ => self
                    .identifier()
                    .ok_or_else(|| self.unexpected("a property name"))?,
            };
            self.skip_trivia()?;
            self.expect(':')?;
            self.skip_trivia()?;
            let value = self.value(depth + 1)?;
            map.insert(key, value);
            self.skip_trivia()?;

            match self.peek() {
                Some(',') => {
                    self.bump();
                    self.skip_trivia()?;
                    if self.peek() == Some('}') {
                        return Err(self.violation("trailing separator before `}`"));
                    }
                }
                Some('}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                _ => return Err(self.unexpected("`,` or `}`")),
            }
        }
    }

    fn array(&mut self, depth: usize) -> Result<Value, DocumentViolation> {
        self.expect('[')?;
        let mut items = vec![];
        self.skip_trivia()?;
        if self.peek() == Some(']') {
            self.bump();
            return Ok(Value::Array(items));
        }

        loop {
            if self.peek() == Some(',') {
                return Err(self.violation("empty element between separators"));
            }
            items.push(self.value(depth + 1)?);
            self.skip_trivia()?;

            match self.peek() {
                Some(',') => {
                    self.bump();
                    self.skip_trivia()?;
                    if self.peek() == Some(']') {
                        return Err(self.violation("trailing separator before `]`"));
                    }
                }
                Some(']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                _ => return Err(self.unexpected("`,` or `]`")),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, DocumentViolation> {
        let start = self.violation("unterminated string");
        self.bump();
        let mut out = String::new();

        loop {
            match self.bump() {
                None | Some('\n') | Some('\r') => return Err(start),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    None => return Err(start),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('v') => out.push('\u{b}'),
                    Some('0') => out.push('\0'),
                    Some('x') => {
                        let code = self.hex_digits(2)?;
                        out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                    }
                    Some('u') => out.push(self.unicode_escape()?),
                    // line continuation
                    Some('\n') => {}
                    Some(other) => out.push(other),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, DocumentViolation> {
        let mut code = 0;
        for _ in 0..count {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.violation("invalid escape sequence"))?;
            self.bump();
            code = code * 16 + digit;
        }
        Ok(code)
    }

    fn unicode_escape(&mut self) -> Result<char, DocumentViolation> {
        let high = self.hex_digits(4)?;
        if (0xD800..0xDC00).contains(&high) && self.peek() == Some('\\') && self.peek_at(1) == Some('u') {
            self.bump();
            self.bump();
            let low = self.hex_digits(4)?;
            if (0xDC00..0xE000).contains(&low) {
                let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return Ok(char::from_u32(combined).unwrap_or('\u{fffd}'));
            }
            return Ok('\u{fffd}');
        }
        Ok(char::from_u32(high).unwrap_or('\u{fffd}'))
    }

    fn number(&mut self) -> Result<Value, DocumentViolation> {
        let at = self.violation("");
        let invalid = |message: &str| DocumentViolation {
            message: message.to_string(),
            ..at.clone()
        };

        let mut literal = String::new();
        match self.peek() {
            Some('-') => {
                literal.push('-');
                self.bump();
            }
            Some('+') => {
                self.bump();
            }
            _ => {}
        }

        let mut integral = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            integral.push(c);
            self.bump();
        }
        if integral.len() > 1 && integral.starts_with('0') {
            return Err(invalid("leading zero in number"));
        }

        let mut is_float = false;
        let mut fraction = String::new();
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                fraction.push(c);
                self.bump();
            }
        }
        if integral.is_empty() && fraction.is_empty() {
            return Err(invalid("invalid number"));
        }
        literal.push_str(if integral.is_empty() { "0" } else { &integral });
        if !fraction.is_empty() {
            literal.push('.');
            literal.push_str(&fraction);
        }

        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            literal.push('e');
            self.bump();
            if let Some(sign @ ('+' | '-')) = self.peek() {
                literal.push(sign);
                self.bump();
            }
            let mut digits = 0;
            while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
                literal.push(c);
                self.bump();
                digits += 1;
            }
            if digits == 0 {
                return Err(invalid("invalid exponent"));
            }
        }

        if self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            return Err(invalid("invalid number"));
        }

        if !is_float {
            if let Ok(n) = literal.parse::<i64>() {
                return Ok(Value::Number(n.into()));
            }
            if let Ok(n) = literal.parse::<u64>() {
                return Ok(Value::Number(n.into()));
            }
        }
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("number out of range"))
    }

    /// Code after the root literal (the `module.exports` stanza): only
    /// bracket balance is checked.
    fn balanced_trailer(&mut self) -> Result<(), DocumentViolation> {
        let mut open: Vec<(char, DocumentViolation)> = vec![];
        loop {
            self.skip_trivia()?;
            let Some(c) = self.peek() else { break };
            match c {
                '"' | '\'' | '`' => {
                    self.string(c)?;
                }
                '(' | '[' | '{' => {
                    open.push((c, self.violation(format!("unclosed `{}`", c))));
                    self.bump();
                }
                ')' | ']' | '}' => {
                    match open.pop() {
                        Some((opener, _)) if matches!((opener, c), ('(', ')') | ('[', ']') | ('{', '}')) => {}
                        _ => return Err(self.violation(format!("unbalanced `{}`", c))),
                    }
                    self.bump();
                }
                _ => {
                    self.bump();
                }
            }
        }
        match open.pop() {
            Some((_, unclosed)) => Err(unclosed),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_literal_parses() {
        let doc = parse_document(
            r#"// header
let config = {
  address: "localhost",
  port: 8080,
  'quoted': [1, -2.5, +3, .5, 1e3],
  flags: { on: true, off: false, none: null }, /* inline */
  modules: []
};

if (typeof module !== "undefined") {
  module.exports = config;
}
"#,
        )
        .unwrap();

        assert_eq!(doc.binding.as_deref(), Some("config"));
        assert_eq!(doc.root["address"], json!("localhost"));
        assert_eq!(doc.root["port"], json!(8080));
        assert_eq!(doc.root["quoted"], json!([1, -2.5, 3, 0.5, 1000.0]));
        assert_eq!(doc.root["flags"]["none"], Value::Null);
        assert_eq!(doc.root["modules"], json!([]));
    }

    #[test]
    fn test_bare_literal_parses() {
        let doc = parse_document(r#"{ "a": [ { b: 'x\'y' } ] }"#).unwrap();
        assert!(doc.binding.is_none());
        assert_eq!(doc.root["a"][0]["b"], json!("x'y"));
    }

    #[test]
    fn test_escapes_decode() {
        let value = parse_element(r#""O'Brien's \"Calendar\" \\ é 😀""#).unwrap();
        assert_eq!(value, json!("O'Brien's \"Calendar\" \\ é 😀"));
    }

    #[test]
    fn test_separator_faults_rejected() {
        for text in [
            "{ modules: [ {}, ] }",
            "{ modules: [ {},, {} ] }",
            "{ modules: [ , {} ] }",
            "{ a: 1, }",
            "{ a: 1 b: 2 }",
            "{ modules: [ {} {} ] }",
        ] {
            assert!(parse_document(text).is_err(), "accepted: {text}");
        }
    }

    #[test]
    fn test_stray_separator_after_root_rejected() {
        for text in [
            "let config = { a: 1 },",
            "let config = { a: 1 };,",
            "let config = { a: 1 }\n  , x",
        ] {
            let err = parse_document(text).unwrap_err();
            assert!(err.message.contains("stray separator"), "{text}: {err}");
        }
        assert!(parse_document("let config = { a: 1 };\nf(a, b);").is_ok());
    }

    #[test]
    fn test_fragment_reports_open_line_comment() {
        assert!(parse_fragment("{ module: \"a\" } // note").unwrap().open_line_comment);
        assert!(!parse_fragment("{ module: \"a\" } // note\n").unwrap().open_line_comment);
        assert!(!parse_fragment("{ module: \"a // b\" }").unwrap().open_line_comment);
        let led = parse_fragment("// lead\n{ module: \"a\" } /* tail */").unwrap();
        assert!(!led.open_line_comment);
    }

    #[test]
    fn test_nesting_faults_rejected() {
        for text in ["{ a: [ 1 }", "{ a: { b: 1 }", "let config = { a: 1 }; if (x) {", "{ a: 1 } }"] {
            assert!(parse_document(text).is_err(), "accepted: {text}");
        }
    }

    #[test]
    fn test_unquoted_leak_rejected() {
        let err = parse_document("{\n  apikey: abc123\n}").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 11);
        assert!(err.message.contains("abc123"));
    }

    #[test]
    fn test_unterminated_string_reports_opening_quote() {
        let err = parse_document("{ name: \"Home }").unwrap_err();
        assert_eq!((err.line, err.column), (1, 9));
    }

    #[test]
    fn test_element_rejects_trailing_separator() {
        assert!(parse_element("{ module: \"clock\" }").is_ok());
        let err = parse_element("{ module: \"clock\" },").unwrap_err();
        assert!(err.message.contains("trailing separator"));
        assert!(parse_element("   ").is_err());
        assert!(parse_element("{} {}").is_err());
    }

    #[test]
    fn test_bad_numbers_rejected() {
        for text in ["[ 01 ]", "[ 1e ]", "[ - ]", "[ 12px ]"] {
            assert!(parse_document(text).is_err(), "accepted: {text}");
        }
    }
}
