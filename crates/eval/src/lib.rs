//! Kiln path queries: a JSONPath subset used by field selectors, config paths
//! and health rules.
//!
//! Accepted forms: `spec.foo`, `.spec.foo`, `$.spec.foo`, `{.spec.foo}`,
//! `spec['dotted.key']`, `spec.items[0]` and
//! `status.conditions[?(@.type=="Ready")].status`.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use kiln_core::{Json, PathQuery, QueryError};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Filter { path: SmallVec<[String; 2]>, negate: bool, literal: String },
}

/// A compiled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    src: String,
    segs: SmallVec<[Segment; 6]>,
}

impl Path {
    pub fn compile(src: &str) -> Result<Self, QueryError> {
        let body = normalize(src);
        let segs = Parser { src, s: body, pos: 0 }.segments()?;
        Ok(Self { src: src.to_string(), segs })
    }

    pub fn as_str(&self) -> &str { &self.src }

    pub fn resolve<'a>(&self, doc: &'a Json) -> Result<&'a Json, QueryError> {
        let mut cur = doc;
        for seg in self.segs.iter() {
            let next = match seg {
                Segment::Key(k) => cur.as_object().and_then(|m| m.get(k)),
                Segment::Index(i) => cur.as_array().and_then(|a| a.get(*i)),
                Segment::Filter { path, negate, literal } => cur.as_array().and_then(|arr| {
                    arr.iter().find(|el| {
                        let got = walk_keys(el, path).and_then(scalar_string);
                        match (got, *negate) {
                            (Some(s), false) => &s == literal,
                            (Some(s), true) => &s != literal,
                            (None, true) => true,
                            (None, false) => false,
                        }
                    })
                }),
            };
            cur = next.ok_or_else(|| QueryError::NotFound { path: self.src.clone() })?;
        }
        Ok(cur)
    }
}

fn walk_keys<'a>(doc: &'a Json, keys: &[String]) -> Option<&'a Json> {
    keys.iter().try_fold(doc, |cur, k| cur.as_object()?.get(k))
}

/// String rendering used for comparisons: strings verbatim, numbers and
/// booleans via `to_string`; `None` for null, arrays and objects.
pub fn scalar_string(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Strip the optional `{...}`, `$` and leading `.` wrappers.
fn normalize(jp: &str) -> &str {
    let mut s = jp.trim();
    if let Some(inner) = s.strip_prefix('{').and_then(|x| x.strip_suffix('}')) {
        s = inner.trim();
    }
    if let Some(rest) = s.strip_prefix('$') {
        s = rest;
    }
    s.strip_prefix('.').unwrap_or(s)
}

struct Parser<'a> {
    src: &'a str,
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: impl Into<String>) -> QueryError {
        QueryError::Syntax { path: self.src.to_string(), reason: reason.into() }
    }

    fn peek(&self) -> Option<char> { self.s[self.pos..].chars().next() }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, tok: &str) -> bool {
        if self.s[self.pos..].starts_with(tok) {
            self.pos += tok.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &str) -> Result<(), QueryError> {
        if self.eat(tok) { Ok(()) } else { Err(self.err(format!("expected '{}' at {}", tok, self.pos))) }
    }

    fn segments(mut self) -> Result<SmallVec<[Segment; 6]>, QueryError> {
        let mut out = SmallVec::new();
        if self.s.is_empty() {
            return Err(self.err("empty path"));
        }
        // first segment may be a bare key or a bracket
        if self.peek() != Some('[') {
            out.push(Segment::Key(self.key()?));
        }
        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.bump();
                    out.push(Segment::Key(self.key()?));
                }
                '[' => out.push(self.bracket()?),
                other => return Err(self.err(format!("unexpected '{}' at {}", other, self.pos))),
            }
        }
        Ok(out)
    }

    fn key(&mut self) -> Result<String, QueryError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '.' || c == '[' {
                break;
            }
            if matches!(c, '*' | ']' | '(' | ')' | '?' | '@') {
                return Err(self.err(format!("unsupported character '{}' in key", c)));
            }
            self.bump();
        }
        if self.pos == start {
            return Err(self.err(format!("empty key at {}", start)));
        }
        Ok(self.s[start..self.pos].to_string())
    }

    fn bracket(&mut self) -> Result<Segment, QueryError> {
        self.expect("[")?;
        let seg = match self.peek() {
            Some(q @ ('\'' | '"')) => Segment::Key(self.quoted(q)?),
            Some('?') => self.filter()?,
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    self.bump();
                }
                let idx = self.s[start..self.pos].parse().map_err(|_| self.err("index out of range"))?;
                Segment::Index(idx)
            }
            _ => return Err(self.err(format!("unsupported subscript at {}", self.pos))),
        };
        self.expect("]")?;
        Ok(seg)
    }

    fn quoted(&mut self, q: char) -> Result<String, QueryError> {
        self.bump();
        let start = self.pos;
        while let Some(c) = self.bump() {
            if c == q {
                return Ok(self.s[start..self.pos - 1].to_string());
            }
        }
        Err(self.err("unterminated quote"))
    }

    fn filter(&mut self) -> Result<Segment, QueryError> {
        self.expect("?(@")?;
        let mut path: SmallVec<[String; 2]> = SmallVec::new();
        while self.eat(".") {
            let start = self.pos;
            while self.peek().map(|c| c.is_alphanumeric() || c == '_' || c == '-').unwrap_or(false) {
                self.bump();
            }
            if self.pos == start {
                return Err(self.err("empty key in filter"));
            }
            path.push(self.s[start..self.pos].to_string());
        }
        if path.is_empty() {
            return Err(self.err("filter needs a field"));
        }
        self.skip_ws();
        let negate = if self.eat("==") {
            false
        } else if self.eat("!=") {
            true
        } else {
            return Err(self.err("filter supports only == and !="));
        };
        self.skip_ws();
        let literal = match self.peek() {
            Some(q @ ('\'' | '"')) => self.quoted(q)?,
            _ => {
                let start = self.pos;
                while self.peek().map(|c| c != ')').unwrap_or(false) {
                    self.bump();
                }
                self.s[start..self.pos].trim().to_string()
            }
        };
        self.skip_ws();
        self.expect(")")?;
        Ok(Segment::Filter { path, negate, literal })
    }

    fn skip_ws(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.bump();
        }
    }
}

/// [`PathQuery`] over compiled paths, memoised per path string.
#[derive(Default)]
pub struct JsonPath {
    cache: Mutex<FxHashMap<String, Arc<Path>>>,
}

impl JsonPath {
    pub fn new() -> Self { Self::default() }

    fn compiled(&self, path: &str) -> Result<Arc<Path>, QueryError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(p) = cache.get(path) {
                return Ok(Arc::clone(p));
            }
        }
        let p = Arc::new(Path::compile(path)?);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_string(), Arc::clone(&p));
        }
        tracing::trace!(path, "path compiled");
        Ok(p)
    }
}

impl PathQuery for JsonPath {
    fn query(&self, doc: &Json, path: &str) -> Result<Json, QueryError> {
        self.compiled(path)?.resolve(doc).cloned()
    }
}
