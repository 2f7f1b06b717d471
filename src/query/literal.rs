//! Restricted Literal Parser
//!
//! Reads the JavaScript-flavoured object/array literals that models emit
//! for pipelines and filters (unquoted keys, single quotes, trailing
//! commas, `/regex/i`, `new Date(...)`, `ObjectId(...)`) into a plain
//! [`Literal`] tree. Nothing is ever evaluated: any identifier outside the
//! small constructor whitelist is a parse error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Regex { pattern: String, flags: String },
    /// RFC 3339 timestamp, UTC, millisecond precision.
    Date(String),
    Array(Vec<Literal>),
    /// Keys keep their source order; stage documents and sort keys rely on it.
    Object(Vec<(String, Literal)>),
}

impl Literal {
    pub fn as_object(&self) -> Option<&[(String, Literal)]> {
        match self {
            Literal::Object(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Literal]> {
        match self {
            Literal::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Literal> {
        self.as_object()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Truthiness as used by projection and sort specs (`1`, `true`).
    pub fn is_truthy(&self) -> bool {
        match self {
            Literal::Null => false,
            Literal::Bool(b) => *b,
            Literal::Number(n) => *n != 0.0,
            _ => true,
        }
    }

    /// Plain JSON value. Regex literals have no JSON form.
    pub fn to_json(&self) -> Option<Value> {
        Some(match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => number_value(*n),
            Literal::String(s) | Literal::Date(s) => Value::String(s.clone()),
            Literal::Regex { .. } => return None,
            Literal::Array(items) => {
                Value::Array(items.iter().map(Literal::to_json).collect::<Option<_>>()?)
            }
            Literal::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    map.insert(k.clone(), v.to_json()?);
                }
                Value::Object(map)
            }
        })
    }

    /// Visit every object key in the tree, depth first.
    pub fn walk_keys<'a>(&'a self, visit: &mut dyn FnMut(&'a str)) {
        match self {
            Literal::Object(entries) => {
                for (k, v) in entries {
                    visit(k);
                    v.walk_keys(visit);
                }
            }
            Literal::Array(items) => items.iter().for_each(|item| item.walk_keys(visit)),
            _ => {}
        }
    }
}

/// Integral floats become JSON integers so `5` does not print as `5.0`.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for LiteralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for LiteralError {}

pub type ParseResult<T> = std::result::Result<T, LiteralError>;

/// Deepest bracket or argument nesting a literal may have.
pub const MAX_DEPTH: usize = 64;

/// Bracket nesting depth of `text`, ignoring quoted strings.
pub fn nesting_depth(text: &str) -> usize {
    let (mut depth, mut deepest) = (0usize, 0usize);
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '{' | '[' | '(' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Parse `text` as exactly one literal (a trailing `;` is tolerated).
pub fn parse_literal(text: &str) -> ParseResult<Literal> {
    let mut cursor = Cursor::new(text);
    let value = cursor.parse_value()?;
    cursor.finish()?;
    Ok(value)
}

/// Character cursor shared by the literal parser and the call parser.
pub struct Cursor {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Cursor {
    pub fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            position: self.pos,
            message: message.into(),
        }
    }

    pub fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    /// Skip whitespace and `//` / `/* */` comments.
    pub fn skip_ws(&mut self) {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => self.pos += 1,
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    while self.peek().is_some() && !(self.peek() == Some('*') && self.peek_at(1) == Some('/')) {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(self.chars.len());
                }
                _ => break,
            }
        }
    }

    /// Consume `expected` after optional whitespace.
    pub fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, expected: char) -> ParseResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{}', found {}",
                expected,
                self.peek().map(|c| format!("'{}'", c)).unwrap_or_else(|| "end of input".to_string())
            )))
        }
    }

    pub fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.peek().is_none()
    }

    /// Require end of input, allowing trailing semicolons.
    pub fn finish(&mut self) -> ParseResult<()> {
        while self.eat(';') {}
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    pub fn parse_identifier(&mut self) -> ParseResult<String> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// Parse a comma-separated argument list up to the closing `)`.
    /// The opening `(` must already be consumed.
    pub fn parse_arguments(&mut self) -> ParseResult<Vec<Literal>> {
        self.nested(Self::parse_argument_list)
    }

    fn parse_argument_list(&mut self) -> ParseResult<Vec<Literal>> {
        let mut args = Vec::new();
        loop {
            if self.eat(')') {
                return Ok(args);
            }
            args.push(self.parse_value()?);
            if !self.eat(',') {
                self.expect(')')?;
                return Ok(args);
            }
        }
    }

    pub fn parse_value(&mut self) -> ParseResult<Literal> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('{') => self.nested(Self::parse_object),
            Some('[') => self.nested(Self::parse_array),
            Some('\'') | Some('"') => self.parse_string().map(Literal::String),
            Some('/') => self.parse_regex(),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => self.parse_keyword(),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
        }
    }

    fn nested<T>(&mut self, parse: fn(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_DEPTH)));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_object(&mut self) -> ParseResult<Literal> {
        self.expect('{')?;
        let mut entries = Vec::new();
        loop {
            if self.eat('}') {
                return Ok(Literal::Object(entries));
            }
            self.skip_ws();
            let key = match self.peek() {
                Some('\'') | Some('"') => self.parse_string()?,
                _ => self.parse_key()?,
            };
            self.expect(':')?;
            let value = self.parse_value()?;
            entries.push((key, value));
            if !self.eat(',') {
                self.expect('}')?;
                return Ok(Literal::Object(entries));
            }
        }
    }

    /// Unquoted keys may be dotted paths (`category.name`).
    fn parse_key(&mut self) -> ParseResult<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected object key"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_array(&mut self) -> ParseResult<Literal> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            if self.eat(']') {
                return Ok(Literal::Array(items));
            }
            items.push(self.parse_value()?);
            if !self.eat(',') {
                self.expect(']')?;
                return Ok(Literal::Array(items));
            }
        }
    }

    fn parse_string(&mut self) -> ParseResult<String> {
        let quote = self.bump().ok_or_else(|| self.error("expected string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('u') => {
                        let hex: String = (0..4).filter_map(|_| self.bump()).collect();
                        let ch = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| self.error("invalid unicode escape"))?;
                        out.push(ch);
                    }
                    Some(other) => out.push(other),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_regex(&mut self) -> ParseResult<Literal> {
        self.expect('/')?;
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated regex literal")),
                Some('/') => break,
                Some('\\') => match self.bump() {
                    Some('/') => pattern.push('/'),
                    Some(other) => {
                        pattern.push('\\');
                        pattern.push(other);
                    }
                    None => return Err(self.error("unterminated regex literal")),
                },
                Some(c) => pattern.push(c),
            }
        }
        let mut flags = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() {
                flags.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(Literal::Regex { pattern, flags })
    }

    fn parse_number(&mut self) -> ParseResult<Literal> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '-' || c == '+')
                && matches!(self.chars.get(self.pos.wrapping_sub(1)), Some('e') | Some('E'));
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Literal::Number)
            .map_err(|_| LiteralError {
                position: start,
                message: format!("invalid number '{}'", text),
            })
    }

    fn parse_keyword(&mut self) -> ParseResult<Literal> {
        let start = self.pos;
        let word = self.parse_identifier()?;
        match word.as_str() {
            "true" => Ok(Literal::Bool(true)),
            "false" => Ok(Literal::Bool(false)),
            "null" | "undefined" => Ok(Literal::Null),
            "new" => {
                let constructor = self.parse_identifier()?;
                self.parse_constructor(&constructor, start)
            }
            other => self.parse_constructor(other, start),
        }
    }

    /// The only callable names a literal may contain.
    fn parse_constructor(&mut self, name: &str, start: usize) -> ParseResult<Literal> {
        let known = matches!(
            name,
            "Date" | "ISODate" | "ObjectId" | "NumberInt" | "NumberLong" | "NumberDecimal"
        );
        if !known {
            return Err(LiteralError {
                position: start,
                message: format!("unsupported identifier '{}'", name),
            });
        }
        self.expect('(')?;
        let args = self.parse_arguments()?;
        let arg = args.first();
        match name {
            "Date" | "ISODate" => {
                let date = match arg {
                    None => Some(Utc::now()),
                    Some(Literal::String(s)) => parse_date(s),
                    Some(Literal::Number(ms)) => Utc.timestamp_millis_opt(*ms as i64).single(),
                    Some(_) => None,
                };
                date.map(|d| Literal::Date(format_date(&d)))
                    .ok_or_else(|| LiteralError {
                        position: start,
                        message: format!("invalid date argument to {}", name),
                    })
            }
            "ObjectId" => match arg {
                Some(Literal::String(id)) => Ok(Literal::String(id.clone())),
                _ => Err(LiteralError {
                    position: start,
                    message: "ObjectId expects a string".to_string(),
                }),
            },
            _ => match arg {
                Some(Literal::Number(n)) => Ok(Literal::Number(*n)),
                Some(Literal::String(s)) => s.trim().parse::<f64>().map(Literal::Number).map_err(|_| {
                    LiteralError {
                        position: start,
                        message: format!("{} expects a number", name),
                    }
                }),
                _ => Err(LiteralError {
                    position: start,
                    message: format!("{} expects a number", name),
                }),
            },
        }
    }
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS` and plain `YYYY-MM-DD` (UTC).
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mongo_shell_pipeline() {
        let text = r#"[
            { $match: { $expr: { $lt: ['$currentQuantity', '$minimumStockLevel'] } } },
            { "$sort": { currentQuantity: 1, }, },
        ]"#;
        let literal = parse_literal(text).unwrap();
        let stages = literal.as_array().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].as_object().unwrap()[0].0, "$match");
        assert_eq!(
            stages[1].get("$sort").unwrap().get("currentQuantity"),
            Some(&Literal::Number(1.0))
        );
    }

    #[test]
    fn test_parse_regex_and_constructors() {
        let literal = parse_literal(
            "{ name: /^acme\\/west/i, since: new Date('2024-03-01'), id: ObjectId(\"abc\") }",
        )
        .unwrap();
        assert_eq!(
            literal.get("name"),
            Some(&Literal::Regex {
                pattern: "^acme/west".to_string(),
                flags: "i".to_string()
            })
        );
        assert_eq!(
            literal.get("since"),
            Some(&Literal::Date("2024-03-01T00:00:00.000Z".to_string()))
        );
        assert_eq!(literal.get("id"), Some(&Literal::String("abc".to_string())));
    }

    #[test]
    fn test_rejects_arbitrary_code() {
        for text in [
            "[{ $match: process.exit(1) }]",
            "(() => db.products.drop())()",
            "{ a: require('fs') }",
            "[{ $match: {} }] + 1",
        ] {
            assert!(parse_literal(text).is_err(), "accepted: {}", text);
        }
    }

    #[test]
    fn test_numbers_and_comments() {
        let literal = parse_literal("// top five\n[ -1.5, 2e3, +4 /* inline */ ]").unwrap();
        assert_eq!(
            literal,
            Literal::Array(vec![
                Literal::Number(-1.5),
                Literal::Number(2000.0),
                Literal::Number(4.0)
            ])
        );
    }

    #[test]
    fn test_to_json_keeps_integers() {
        let literal = parse_literal("{ qty: 5, price: 9.5, tags: ['a'] }").unwrap();
        assert_eq!(
            literal.to_json().unwrap(),
            serde_json::json!({ "qty": 5, "price": 9.5, "tags": ["a"] })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let ok = format!("{}1{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert!(parse_literal(&ok).is_ok());

        let deep = format!("{}1{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        let err = parse_literal(&deep).unwrap_err();
        assert!(err.message.contains("nesting"));

        let runaway = "[{ a: ".repeat(10_000);
        assert!(parse_literal(&runaway).is_err());
        let constructors = "ISODate(".repeat(10_000);
        assert!(parse_literal(&constructors).is_err());
    }

    #[test]
    fn test_nesting_depth_skips_strings() {
        assert_eq!(nesting_depth("[{ $match: { name: '[[[' } }]"), 3);
        assert_eq!(nesting_depth("db.products.find({ a: \"x\\\"]]\" })"), 2);
        assert_eq!(nesting_depth("SELECT * FROM products"), 0);
    }

    #[test]
    fn test_unterminated_input() {
        assert!(parse_literal("[{ $match: { name: 'x' }").is_err());
        assert!(parse_literal("{ name: 'x }").is_err());
    }
}
