// SPDX-License-Identifier: Apache-2.0

//! Value tree for the agent configuration syntax.
//!
//! The format is indent-insensitive and brace-delimited: `key value` entries,
//! `name { ... }` sections, `#` comments, backslash-continued lines, single-
//! or double-quoted values. A key that appears more than once in a section is
//! promoted to a list, preserving order of appearance.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error reading {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("line {0}: unterminated quote")]
    UnterminatedQuote(usize),

    #[error("line {0}: unexpected '{1}'")]
    Unexpected(usize, char),

    #[error("line {0}: unbalanced closing brace")]
    UnbalancedClose(usize),

    #[error("unclosed section '{0}'")]
    UnclosedSection(String),

    #[error("include depth exceeded at {0}")]
    IncludeDepth(PathBuf),
}

pub type Result<T> = std::result::Result<T, ParseError>;

const MAX_INCLUDE_DEPTH: usize = 16;

/// A configuration value: a scalar string, a list produced by repeating a
/// key, or a nested section.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    List(Vec<Value>),
    Section(Section),
}

impl Value {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_section(&self) -> Option<&Section> {
        match self {
            Value::Section(s) => Some(s),
            _ => None,
        }
    }
}

/// An ordered list of key/value entries. Insertion order is preserved;
/// inserting an existing key promotes the entry to a `Value::List`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    entries: Vec<(String, Value)>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        for (k, v) in self.entries.iter_mut() {
            if k == key {
                match v {
                    Value::List(items) => items.push(value),
                    other => {
                        let prev = std::mem::replace(other, Value::List(Vec::new()));
                        *other = Value::List(vec![prev, value]);
                    }
                }
                return;
            }
        }
        self.entries.push((key.to_string(), value));
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Single scalar for `key`; the last occurrence wins when repeated.
    pub fn scalar(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Scalar(s) => Some(s),
            Value::List(items) => items.iter().rev().find_map(|v| v.as_scalar()),
            Value::Section(_) => None,
        }
    }

    /// All scalar occurrences of `key`, in order.
    pub fn scalars(&self, key: &str) -> Vec<&str> {
        match self.get(key) {
            Some(Value::Scalar(s)) => vec![s],
            Some(Value::List(items)) => items.iter().filter_map(|v| v.as_scalar()).collect(),
            _ => Vec::new(),
        }
    }

    /// All section occurrences of `key`, in order.
    pub fn sections(&self, key: &str) -> Vec<&Section> {
        match self.get(key) {
            Some(Value::Section(s)) => vec![s],
            Some(Value::List(items)) => items.iter().filter_map(|v| v.as_section()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the section back into configuration syntax. Parsing the result
    /// yields a tree equal to this one.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        self.write_entries(&mut out, 0);
        out
    }

    fn write_entries(&self, out: &mut String, depth: usize) {
        for (key, value) in &self.entries {
            Self::write_value(out, key, value, depth);
        }
    }

    fn write_value(out: &mut String, key: &str, value: &Value, depth: usize) {
        let pad = "  ".repeat(depth);
        match value {
            Value::Scalar(s) => {
                let _ = writeln!(out, "{}{} {}", pad, key, quote_if_needed(s));
            }
            Value::List(items) => {
                for item in items {
                    Self::write_value(out, key, item, depth);
                }
            }
            Value::Section(section) => {
                let _ = writeln!(out, "{}{} {{", pad, key);
                section.write_entries(out, depth + 1);
                let _ = writeln!(out, "{}}}", pad);
            }
        }
    }
}

fn quote_if_needed(s: &str) -> String {
    if s.is_empty()
        || s.contains(|c: char| {
            c.is_whitespace() || matches!(c, '{' | '}' | '#' | '"' | '\'' | '\\')
        })
    {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    Newline,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn next_token(&mut self) -> Result<Option<(Token, usize)>> {
        loop {
            let c = match self.chars.peek() {
                Some(c) => *c,
                None => return Ok(None),
            };
            match c {
                '\n' => {
                    self.chars.next();
                    self.line += 1;
                    return Ok(Some((Token::Newline, self.line - 1)));
                }
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '#' => {
                    // comment runs to end of line
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            self.line += 1;
                            return Ok(Some((Token::Newline, self.line - 1)));
                        }
                    }
                    return Ok(None);
                }
                '\\' => {
                    // line continuation: swallow the backslash and the newline
                    self.chars.next();
                    match self.chars.peek() {
                        Some('\n') => {
                            self.chars.next();
                            self.line += 1;
                        }
                        Some('\r') => {
                            self.chars.next();
                            if self.chars.peek() == Some(&'\n') {
                                self.chars.next();
                                self.line += 1;
                            }
                        }
                        _ => return Err(ParseError::Unexpected(self.line, '\\')),
                    }
                }
                '{' => {
                    self.chars.next();
                    return Ok(Some((Token::Open, self.line)));
                }
                '}' => {
                    self.chars.next();
                    return Ok(Some((Token::Close, self.line)));
                }
                '"' | '\'' => {
                    let quote = c;
                    self.chars.next();
                    let mut word = String::new();
                    loop {
                        match self.chars.next() {
                            Some('\\') if quote == '"' => match self.chars.next() {
                                Some(esc) => word.push(esc),
                                None => return Err(ParseError::UnterminatedQuote(self.line)),
                            },
                            Some(c) if c == quote => break,
                            Some('\n') | None => {
                                return Err(ParseError::UnterminatedQuote(self.line))
                            }
                            Some(c) => word.push(c),
                        }
                    }
                    return Ok(Some((Token::Word(word), self.line)));
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_whitespace() || c == '{' || c == '}' || c == '#' {
                            break;
                        }
                        word.push(c);
                        self.chars.next();
                    }
                    return Ok(Some((Token::Word(word), self.line)));
                }
            }
        }
    }

    fn tokens(mut self) -> Result<Vec<(Token, usize)>> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            out.push(tok);
        }
        Ok(out)
    }
}

/// Parse configuration text into a value tree. `include` directives are not
/// resolved here; use [`parse_file`] for that.
pub fn parse_str(input: &str) -> Result<Section> {
    let tokens = Lexer::new(input).tokens()?;
    let mut pos = 0;
    let root = parse_section(&tokens, &mut pos, None)?;
    Ok(root)
}

fn parse_section(
    tokens: &[(Token, usize)],
    pos: &mut usize,
    open_key: Option<&str>,
) -> Result<Section> {
    let mut section = Section::new();

    while *pos < tokens.len() {
        match &tokens[*pos] {
            (Token::Newline, _) => {
                *pos += 1;
            }
            (Token::Close, line) => {
                if open_key.is_none() {
                    return Err(ParseError::UnbalancedClose(*line));
                }
                *pos += 1;
                return Ok(section);
            }
            (Token::Open, line) => return Err(ParseError::Unexpected(*line, '{')),
            (Token::Word(key), _) => {
                let key = key.clone();
                *pos += 1;
                // skip newlines between a key and its opening brace
                let mut peek = *pos;
                while peek < tokens.len() && matches!(tokens[peek].0, Token::Newline) {
                    peek += 1;
                }
                if peek < tokens.len() && matches!(tokens[peek].0, Token::Open) {
                    *pos = peek + 1;
                    let nested = parse_section(tokens, pos, Some(&key))?;
                    section.insert(&key, Value::Section(nested));
                } else {
                    // scalar entry: value is all words up to the newline/brace
                    let mut parts: Vec<String> = Vec::new();
                    while *pos < tokens.len() {
                        match &tokens[*pos] {
                            (Token::Word(w), _) => {
                                parts.push(w.clone());
                                *pos += 1;
                            }
                            _ => break,
                        }
                    }
                    section.insert(&key, Value::Scalar(parts.join(" ")));
                }
            }
        }
    }

    if let Some(key) = open_key {
        return Err(ParseError::UnclosedSection(key.to_string()));
    }
    Ok(section)
}

/// Parse a configuration file, recursively splicing `include <path>` entries
/// in place. Relative include paths resolve against the including file.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Section> {
    parse_file_depth(path.as_ref(), 0)
}

fn parse_file_depth(path: &Path, depth: usize) -> Result<Section> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ParseError::IncludeDepth(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|e| ParseError::Io(path.to_path_buf(), e))?;
    let parsed = parse_str(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_includes(parsed, base, depth)
}

fn resolve_includes(section: Section, base: &Path, depth: usize) -> Result<Section> {
    let mut out = Section::new();
    for (key, value) in section.entries {
        if key == "include" {
            for target in scalar_occurrences(&value) {
                let mut target_path = PathBuf::from(&target);
                if target_path.is_relative() {
                    target_path = base.join(target_path);
                }
                let included = parse_file_depth(&target_path, depth + 1)?;
                for (k, v) in included.entries {
                    out.insert(&k, v);
                }
            }
        } else {
            out.insert(&key, resolve_value(value, base, depth)?);
        }
    }
    Ok(out)
}

fn resolve_value(value: Value, base: &Path, depth: usize) -> Result<Value> {
    Ok(match value {
        Value::Section(s) => Value::Section(resolve_includes(s, base, depth)?),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| resolve_value(v, base, depth))
                .collect::<Result<Vec<_>>>()?,
        ),
        scalar => scalar,
    })
}

fn scalar_occurrences(value: &Value) -> Vec<String> {
    match value {
        Value::Scalar(s) => vec![s.clone()],
        Value::List(items) => items
            .iter()
            .filter_map(|v| v.as_scalar().map(str::to_string))
            .collect(),
        Value::Section(_) => Vec::new(),
    }
}
