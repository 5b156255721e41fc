//! Line protocol codec for control messages
//!
//! Encodes and decodes the text wire format shared by both peers:
//!
//! ```text
//! <name>[,<tag>=<value>]* <field>=<value>[,<field>=<value>]* [<unix-nanos>]
//! ```
//!
//! One record per line. A single bus payload may carry several records
//! separated by newlines.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Record name must not be empty")]
    EmptyName,

    #[error("Record '{0}' has no fields")]
    NoFields(String),

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidKey {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Field '{0}' is not a finite number")]
    NonFiniteFloat(String),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Payload contains no records")]
    Empty,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

impl FieldValue {
    /// Borrow the value as a string slice if it is a string field
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn write_wire(&self, out: &mut String) {
        match self {
            FieldValue::Float(v) => out.push_str(&v.to_string()),
            FieldValue::Integer(v) => {
                out.push_str(&v.to_string());
                out.push('i');
            }
            FieldValue::UInteger(v) => {
                out.push_str(&v.to_string());
                out.push('u');
            }
            FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
            FieldValue::String(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }
}

/// Plain rendering, without wire quoting or type suffixes
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::UInteger(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInteger(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

/// A generic line protocol record
///
/// Tags and fields are keyed maps, so duplicate keys overwrite and the
/// encoded tag order is always sorted by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    time: SystemTime,
}

impl Record {
    /// Build a validated record
    pub fn new(
        name: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: SystemTime,
    ) -> CodecResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CodecError::EmptyName);
        }
        check_text("name", &name)?;
        if name.starts_with('#') {
            return Err(CodecError::InvalidKey {
                kind: "name",
                value: name,
                reason: "starts a comment line",
            });
        }
        for (key, value) in &tags {
            check_key("tag key", key)?;
            check_key("tag value", value)?;
        }
        if fields.is_empty() {
            return Err(CodecError::NoFields(name));
        }
        for (key, value) in &fields {
            check_key("field key", key)?;
            if let FieldValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(CodecError::NonFiniteFloat(key.clone()));
                }
            }
        }
        Ok(Self {
            name,
            tags,
            fields,
            time,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn time(&self) -> SystemTime {
        self.time
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Insert or overwrite a tag
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> CodecResult<()> {
        let key = key.into();
        let value = value.into();
        check_key("tag key", &key)?;
        check_key("tag value", &value)?;
        self.tags.insert(key, value);
        Ok(())
    }

    pub fn remove_tag(&mut self, key: &str) -> Option<String> {
        self.tags.remove(key)
    }

    /// Render a single record as one wire line (without trailing newline)
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(64);
        escape_into(&mut out, &self.name, &[',', ' ']);
        for (key, value) in &self.tags {
            out.push(',');
            escape_into(&mut out, key, &[',', '=', ' ']);
            out.push('=');
            escape_into(&mut out, value, &[',', '=', ' ']);
        }
        out.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            escape_into(&mut out, key, &[',', '=', ' ']);
            out.push('=');
            value.write_wire(&mut out);
        }
        out.push(' ');
        out.push_str(&to_unix_nanos(self.time).to_string());
        out
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn check_text(kind: &'static str, value: &str) -> CodecResult<()> {
    if value.contains(|c: char| c == '\n' || c == '\r') {
        return Err(CodecError::InvalidKey {
            kind,
            value: value.to_string(),
            reason: "contains a line break",
        });
    }
    Ok(())
}

fn check_key(kind: &'static str, value: &str) -> CodecResult<()> {
    if value.is_empty() {
        return Err(CodecError::InvalidKey {
            kind,
            value: String::new(),
            reason: "must not be empty",
        });
    }
    check_text(kind, value)
}

/// Backslash is escaped in every token
fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn to_unix_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => i64::try_from(e.duration().as_nanos()).map_or(i64::MIN, |n| -n),
    }
}

fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// Encode one record as a newline-terminated payload
pub fn encode(record: &Record) -> Bytes {
    encode_batch(std::slice::from_ref(record))
}

/// Encode several records into one payload, one line each
pub fn encode_batch(records: &[Record]) -> Bytes {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    Bytes::from(out)
}

/// Decode every record in a payload
///
/// Blank lines and `#` comment lines are skipped. A payload without any
/// record is an error.
pub fn decode(buf: &[u8]) -> CodecResult<Vec<Record>> {
    let text = std::str::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8)?;
    let mut parser = Parser::new(text);
    let mut records = Vec::new();

    while let Some(record) = parser.next_record()? {
        records.push(record);
    }

    if records.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(records)
}

/// Stop set for an unquoted token
#[derive(Clone, Copy)]
enum Token {
    Name,
    Key,
    TagValue,
    FieldValue,
    Timestamp,
}

impl Token {
    fn stops(self, c: char) -> bool {
        match self {
            Token::Name => matches!(c, ',' | ' ' | '\n'),
            Token::Key => matches!(c, '=' | ',' | ' ' | '\n'),
            Token::TagValue | Token::FieldValue => matches!(c, ',' | ' ' | '\n'),
            Token::Timestamp => matches!(c, ' ' | '\n' | '\r'),
        }
    }

    fn escapable(self, c: char) -> bool {
        match self {
            Token::Name => matches!(c, ',' | ' ' | '\\'),
            Token::Key | Token::TagValue => matches!(c, ',' | '=' | ' ' | '\\'),
            Token::FieldValue | Token::Timestamp => false,
        }
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> CodecError {
        CodecError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn skip_blank_lines(&mut self) {
        loop {
            match self.chars.peek() {
                Some('\n') => {
                    self.chars.next();
                    self.line += 1;
                }
                Some(' ') | Some('\t') | Some('\r') => {
                    self.chars.next();
                }
                Some('#') => {
                    while let Some(c) = self.chars.next() {
                        if c == '\n' {
                            self.line += 1;
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn token(&mut self, kind: Token) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if kind.stops(c) {
                break;
            }
            self.chars.next();
            if c == '\\' {
                if let Some(&next) = self.chars.peek() {
                    if kind.escapable(next) {
                        self.chars.next();
                        out.push(next);
                        continue;
                    }
                }
            }
            out.push(c);
        }
        out
    }

    fn expect(&mut self, expected: char, context: &str) -> CodecResult<()> {
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}' {}, found '{}'", expected, context, c))),
            None => Err(self.error(format!("expected '{}' {}, found end of input", expected, context))),
        }
    }

    fn quoted(&mut self) -> CodecResult<String> {
        self.expect('"', "to open string field")?;
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.peek() {
                    Some(&c) if c == '"' || c == '\\' => {
                        self.chars.next();
                        out.push(c);
                    }
                    _ => out.push('\\'),
                },
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    out.push(c);
                }
                None => return Err(self.error("unterminated string field")),
            }
        }
    }

    fn field_value(&mut self, key: &str) -> CodecResult<FieldValue> {
        if self.chars.peek() == Some(&'"') {
            return Ok(FieldValue::String(self.quoted()?));
        }
        let raw = self.token(Token::FieldValue);
        let raw = raw.trim_end_matches('\r');
        if raw.is_empty() {
            return Err(self.error(format!("missing value for field '{}'", key)));
        }
        let parsed = match raw {
            "t" | "T" | "true" | "True" | "TRUE" => Some(FieldValue::Boolean(true)),
            "f" | "F" | "false" | "False" | "FALSE" => Some(FieldValue::Boolean(false)),
            _ => {
                if let Some(digits) = raw.strip_suffix('i') {
                    digits.parse::<i64>().ok().map(FieldValue::Integer)
                } else if let Some(digits) = raw.strip_suffix('u') {
                    digits.parse::<u64>().ok().map(FieldValue::UInteger)
                } else {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(FieldValue::Float)
                }
            }
        };
        parsed.ok_or_else(|| self.error(format!("invalid value '{}' for field '{}'", raw, key)))
    }

    fn next_record(&mut self) -> CodecResult<Option<Record>> {
        self.skip_blank_lines();
        if self.chars.peek().is_none() {
            return Ok(None);
        }

        let name = self.token(Token::Name);
        if name.is_empty() {
            return Err(self.error("missing record name"));
        }

        let mut tags = BTreeMap::new();
        while self.chars.peek() == Some(&',') {
            self.chars.next();
            let key = self.token(Token::Key);
            self.expect('=', "after tag key")?;
            let value = self.token(Token::TagValue);
            if key.is_empty() || value.is_empty() {
                return Err(self.error("empty tag key or value"));
            }
            tags.insert(key, value);
        }

        self.expect(' ', "before field set")?;

        let mut fields = BTreeMap::new();
        loop {
            let key = self.token(Token::Key);
            if key.is_empty() {
                return Err(self.error("empty field key"));
            }
            self.expect('=', "after field key")?;
            let value = self.field_value(&key)?;
            fields.insert(key, value);
            if self.chars.peek() == Some(&',') {
                self.chars.next();
            } else {
                break;
            }
        }

        let mut time = None;
        if self.chars.peek() == Some(&' ') {
            self.chars.next();
            let raw = self.token(Token::Timestamp);
            if !raw.is_empty() {
                let nanos = raw
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("invalid timestamp '{}'", raw)))?;
                time = Some(from_unix_nanos(nanos));
            }
        }

        while matches!(self.chars.peek(), Some(' ') | Some('\t') | Some('\r')) {
            self.chars.next();
        }
        match self.chars.next() {
            None => {}
            Some('\n') => self.line += 1,
            Some(c) => return Err(self.error(format!("unexpected '{}' after record", c))),
        }

        let line = self.line;
        Record::new(name, tags, fields, time.unwrap_or_else(SystemTime::now))
            .map(Some)
            .map_err(|e| CodecError::Syntax {
                line,
                message: e.to_string(),
            })
    }
}
