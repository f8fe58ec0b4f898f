//! The default CPS text parser.
//!
//! Produces a plain AST ([`ParsedDocument`]); materialization into a
//! [`crate::DocumentStore`] happens in the loader, which is also where
//! `@import` references get resolved. A production tokenizer can replace
//! this module by producing `ParsedDocument` values itself.

use std::fmt;
use std::sync::Once;

use cps_selector::{CompoundSelector, SelectorKind, SimpleSelector};
use log::warn;

/// A parsed rule-source document.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone)]
pub enum ParsedItem {
    Rule {
        selectors: Vec<CompoundSelector>,
        declarations: Vec<ParsedDeclaration>,
        line: u32,
    },
    Import {
        name: String,
        line: u32,
    },
    Comment {
        text: String,
        line: u32,
    },
}

/// A `name: formula;` declaration, with any comment that preceded it.
#[derive(Debug, Clone)]
pub struct ParsedDeclaration {
    pub name: String,
    pub formula_source: String,
    pub comment: Option<String>,
    pub line: u32,
}

/// A parse failure, with the source name attached.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub source_name: String,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.source_name, self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

static DICTIONARY_WARNING: Once = Once::new();

/// Parse a rule-source document.
pub fn parse_document(text: &str, source_name: &str) -> Result<ParsedDocument, ParseError> {
    let mut scanner = Scanner::new(text, source_name);
    let items = scanner.items(true)?;
    Ok(ParsedDocument { items })
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    source_name: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(text: &str, source_name: &'a str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            source_name,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            source_name: self.source_name.to_string(),
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn at_comment(&self) -> bool {
        self.peek() == Some('/') && self.peek_at(1) == Some('*')
    }

    fn comment(&mut self) -> Result<String, ParseError> {
        self.bump();
        self.bump();
        let mut text = String::new();
        loop {
            match self.peek() {
                Some('*') if self.peek_at(1) == Some('/') => {
                    self.bump();
                    self.bump();
                    return Ok(text.trim().to_string());
                }
                Some(_) => text.push(self.bump().expect("peeked")),
                None => return Err(self.error("unterminated comment")),
            }
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            Err(self.error("expected an identifier"))
        } else {
            Ok(name)
        }
    }

    fn quoted_string(&mut self) -> Result<String, ParseError> {
        let quote = self.bump().expect("caller checked");
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(text),
                Some('\\') => match self.bump() {
                    Some(c) => text.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => text.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected `{want}`, found `{c}`"))),
            None => Err(self.error(format!("expected `{want}`, found end of input"))),
        }
    }

    /// Parse items until end of input (`top_level`) or a closing `}`.
    fn items(&mut self, top_level: bool) -> Result<Vec<ParsedItem>, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => {
                    if top_level {
                        return Ok(items);
                    }
                    return Err(self.error("unexpected end of input, expected `}`"));
                }
                Some('}') if !top_level => {
                    self.bump();
                    return Ok(items);
                }
                Some('/') if self.at_comment() => {
                    let line = self.line;
                    let text = self.comment()?;
                    items.push(ParsedItem::Comment { text, line });
                }
                Some('@') => {
                    self.bump();
                    let line = self.line;
                    let name = self.ident()?;
                    match name.as_str() {
                        "import" => {
                            self.skip_whitespace();
                            match self.peek() {
                                Some('"') | Some('\'') => {}
                                _ => return Err(self.error("@import requires a quoted name")),
                            }
                            let target = self.quoted_string()?;
                            self.skip_whitespace();
                            self.expect(';')?;
                            items.push(ParsedItem::Import { name: target, line });
                        }
                        "dictionary" => {
                            DICTIONARY_WARNING.call_once(|| {
                                warn!(
                                    "@dictionary blocks are deprecated; their contents are \
                                     flattened into the enclosing document"
                                );
                            });
                            self.skip_whitespace();
                            self.expect('{')?;
                            items.extend(self.items(false)?);
                        }
                        other => {
                            return Err(self.error(format!("unknown at-rule `@{other}`")));
                        }
                    }
                }
                Some(_) => items.push(self.rule()?),
            }
        }
    }

    fn rule(&mut self) -> Result<ParsedItem, ParseError> {
        let line = self.line;
        let selectors = self.selector_list()?;
        let declarations = self.declarations()?;
        Ok(ParsedItem::Rule {
            selectors,
            declarations,
            line,
        })
    }

    fn selector_list(&mut self) -> Result<Vec<CompoundSelector>, ParseError> {
        let mut selectors = vec![self.compound_selector()?];
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                    self.skip_whitespace();
                    selectors.push(self.compound_selector()?);
                }
                Some('{') => {
                    self.bump();
                    return Ok(selectors);
                }
                Some(_) => {
                    return Err(self.error(
                        "whitespace between selectors: combinators are not supported",
                    ));
                }
                None => return Err(self.error("unexpected end of input in selector list")),
            }
        }
    }

    /// One compound selector: simple selectors chained without whitespace.
    fn compound_selector(&mut self) -> Result<CompoundSelector, ParseError> {
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                Some('*') => {
                    self.bump();
                    parts.push(SimpleSelector::universal());
                }
                Some('#') => {
                    self.bump();
                    let name = self.ident()?;
                    parts.push(SimpleSelector::new(SelectorKind::Id, name, None));
                }
                Some('.') => {
                    self.bump();
                    let name = self.ident()?;
                    parts.push(SimpleSelector::new(SelectorKind::Class, name, None));
                }
                Some(':') => {
                    self.bump();
                    if self.peek() == Some(':') {
                        self.bump();
                        let name = self.ident()?;
                        parts.push(SimpleSelector::new(SelectorKind::PseudoElement, name, None));
                    } else {
                        let name = self.ident()?;
                        let value = if self.peek() == Some('(') {
                            self.bump();
                            let value = self.number()?;
                            self.expect(')')?;
                            Some(value)
                        } else {
                            None
                        };
                        parts.push(SimpleSelector::new(SelectorKind::PseudoClass, name, value));
                    }
                }
                Some(c) if c.is_alphanumeric() || c == '_' => {
                    let name = self.ident()?;
                    parts.push(SimpleSelector::new(SelectorKind::Type, name, None));
                }
                _ => break,
            }
        }
        if parts.is_empty() {
            return Err(self.error("expected a selector"));
        }
        Ok(CompoundSelector::new(parts))
    }

    fn number(&mut self) -> Result<f64, ParseError> {
        let mut buf = String::new();
        if self.peek() == Some('-') {
            buf.push('-');
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            buf.push(self.bump().expect("peeked"));
        }
        buf.parse()
            .map_err(|_| self.error(format!("malformed number `{buf}`")))
    }

    /// The body of a rule: declarations until `}`. Comments are attached to
    /// the declaration they precede.
    fn declarations(&mut self) -> Result<Vec<ParsedDeclaration>, ParseError> {
        let mut declarations = Vec::new();
        let mut pending_comment: Option<String> = None;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    return Ok(declarations);
                }
                Some('/') if self.at_comment() => {
                    pending_comment = Some(self.comment()?);
                }
                Some(_) => {
                    let line = self.line;
                    let name = self.ident()?;
                    self.skip_whitespace();
                    self.expect(':')?;
                    let formula_source = self.formula_text()?;
                    declarations.push(ParsedDeclaration {
                        name,
                        formula_source,
                        comment: pending_comment.take(),
                        line,
                    });
                }
                None => return Err(self.error("unexpected end of input in rule body")),
            }
        }
    }

    /// Raw formula text up to the terminating `;`, quote-aware so string
    /// literals may contain `;`.
    fn formula_text(&mut self) -> Result<String, ParseError> {
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(';') => {
                    self.bump();
                    return Ok(text.trim().to_string());
                }
                Some('}') | None => {
                    return Err(self.error("declaration is missing a terminating `;`"));
                }
                Some('"') | Some('\'') => {
                    let quote = self.peek().expect("peeked");
                    let body = self.quoted_string()?;
                    text.push(quote);
                    for c in body.chars() {
                        if c == quote || c == '\\' {
                            text.push('\\');
                        }
                        text.push(c);
                    }
                    text.push(quote);
                }
                Some(_) => text.push(self.bump().expect("peeked")),
            }
        }
    }
}
