//! Filter expressions for `list` and `walk` operations.
//!
//! Syntax:
//!
//! ```text
//! filter    := selector ("," selector)*
//! selector  := fieldpath [op value]
//! fieldpath := component ("." component)*
//! component := [A-Za-z0-9_]+ | quoted
//! op        := "==" | "!=" | "~="
//! value     := quoted | bare text up to the next ","
//! ```
//!
//! Selectors in one filter string must all match; separate filter strings
//! passed to [`Filter::parse_all`] are alternatives. A selector without an
//! operator matches when the field is present. Label keys containing dots or
//! slashes must be quoted: `labels."containerd.io/gc.root"`.

use crate::error::{Error, Result};
use regex::Regex;

/// Resolves a field path against an object
pub trait Adaptor {
    /// Value of the field, or `None` when the object has no such field
    fn field(&self, fieldpath: &[String]) -> Option<String>;
}

impl<F> Adaptor for F
where
    F: Fn(&[String]) -> Option<String>,
{
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        self(fieldpath)
    }
}

/// Resolve the remainder of a `labels.<key>` field path against a label map.
///
/// Unquoted keys containing dots arrive split into several components and
/// are joined back together.
pub fn label_field(labels: &std::collections::BTreeMap<String, String>, rest: &[String]) -> Option<String> {
    if rest.is_empty() {
        return None;
    }
    labels.get(&rest.join(".")).cloned()
}

#[derive(Debug, Clone)]
enum Operator {
    Present,
    Equal(String),
    NotEqual(String),
    Matches(Regex),
}

#[derive(Debug, Clone)]
struct Selector {
    fieldpath: Vec<String>,
    op: Operator,
}

impl Selector {
    fn matches(&self, adaptor: &dyn Adaptor) -> bool {
        let Some(value) = adaptor.field(&self.fieldpath) else {
            return false;
        };
        match &self.op {
            Operator::Present => true,
            Operator::Equal(v) => &value == v,
            Operator::NotEqual(v) => &value != v,
            Operator::Matches(re) => re.is_match(&value),
        }
    }
}

/// Parsed filter: any conjunction matching is a match
#[derive(Debug, Clone, Default)]
pub struct Filter {
    any_of: Vec<Vec<Selector>>,
}

impl Filter {
    /// Filter matching everything
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    /// Parse a single filter string
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self {
            any_of: vec![Parser::new(s).parse()?],
        })
    }

    /// Parse several filter strings; the result matches when any matches.
    /// Empty strings are ignored and no filters match everything.
    pub fn parse_all<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        let mut any_of = Vec::new();
        for f in filters {
            let f = f.as_ref();
            if f.trim().is_empty() {
                continue;
            }
            any_of.push(Parser::new(f).parse()?);
        }
        Ok(Self { any_of })
    }

    /// Evaluate against an object
    pub fn matches(&self, adaptor: &dyn Adaptor) -> bool {
        self.any_of.is_empty()
            || self
                .any_of
                .iter()
                .any(|all| all.iter().all(|s| s.matches(adaptor)))
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::invalid_argument(format!(
            "filter {:?}: {msg} at position {}",
            self.input, self.pos
        ))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn parse(mut self) -> Result<Vec<Selector>> {
        let mut selectors = Vec::new();
        loop {
            selectors.push(self.selector()?);
            self.skip_ws();
            match self.peek() {
                None => return Ok(selectors),
                Some(',') => self.pos += 1,
                Some(_) => return Err(self.error("expected ','")),
            }
        }
    }

    fn selector(&mut self) -> Result<Selector> {
        let fieldpath = self.fieldpath()?;
        self.skip_ws();

        let op = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some(c @ ('=' | '!' | '~')), Some('=')) => {
                self.pos += 2;
                c
            }
            (None | Some(','), _) => {
                return Ok(Selector {
                    fieldpath,
                    op: Operator::Present,
                });
            }
            _ => return Err(self.error("expected operator")),
        };

        self.skip_ws();
        let value = self.value()?;
        let op = match op {
            '=' => Operator::Equal(value),
            '!' => Operator::NotEqual(value),
            _ => Operator::Matches(
                Regex::new(&value).map_err(|e| self.error(&format!("bad regex: {e}")))?,
            ),
        };
        Ok(Selector { fieldpath, op })
    }

    fn fieldpath(&mut self) -> Result<Vec<String>> {
        let mut path = Vec::new();
        loop {
            self.skip_ws();
            let component = match self.peek() {
                Some('"') => self.quoted()?,
                Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                    let start = self.pos;
                    while self
                        .peek()
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        self.pos += 1;
                    }
                    self.chars[start..self.pos].iter().collect()
                }
                _ => return Err(self.error("expected field")),
            };
            path.push(component);
            if self.peek() == Some('.') {
                self.pos += 1;
            } else {
                return Ok(path);
            }
        }
    }

    fn value(&mut self) -> Result<String> {
        if self.peek() == Some('"') {
            return self.quoted();
        }
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ',') {
            self.pos += 1;
        }
        let value: String = self.chars[start..self.pos].iter().collect();
        let value = value.trim_end().to_string();
        if value.is_empty() {
            return Err(self.error("expected value"));
        }
        Ok(value)
    }

    fn quoted(&mut self) -> Result<String> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted string")),
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => out.push(c),
                        None => return Err(self.error("unterminated escape")),
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Obj {
        name: String,
        labels: BTreeMap<String, String>,
    }

    impl Adaptor for Obj {
        fn field(&self, fieldpath: &[String]) -> Option<String> {
            match fieldpath.first().map(String::as_str) {
                Some("name") => Some(self.name.clone()),
                Some("labels") => self.labels.get(&fieldpath[1..].join(".")).cloned(),
                _ => None,
            }
        }
    }

    fn obj() -> Obj {
        Obj {
            name: "image-1".into(),
            labels: [
                ("foo".to_string(), "bar".to_string()),
                ("containerd.io/gc.root".to_string(), "yes".to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_equal_and_not_equal() {
        let o = obj();
        assert!(Filter::parse("name==image-1").unwrap().matches(&o));
        assert!(!Filter::parse("name!=image-1").unwrap().matches(&o));
        assert!(Filter::parse("labels.foo==bar,name==image-1").unwrap().matches(&o));
        assert!(!Filter::parse("labels.foo==bar,name==other").unwrap().matches(&o));
    }

    #[test]
    fn test_presence_and_quoting() {
        let o = obj();
        assert!(Filter::parse(r#"labels."containerd.io/gc.root""#).unwrap().matches(&o));
        assert!(!Filter::parse("labels.missing").unwrap().matches(&o));
        assert!(Filter::parse(r#"labels.foo=="bar""#).unwrap().matches(&o));
    }

    #[test]
    fn test_regex() {
        let o = obj();
        assert!(Filter::parse("name~=^image-[0-9]+$").unwrap().matches(&o));
        assert!(!Filter::parse("name~=^other").unwrap().matches(&o));
        assert!(Filter::parse("name~=[").is_err());
    }

    #[test]
    fn test_parse_all_is_disjunction() {
        let o = obj();
        let f = Filter::parse_all(&["name==nope", "labels.foo==bar"]).unwrap();
        assert!(f.matches(&o));
        assert!(Filter::parse_all::<&str>(&[]).unwrap().matches(&o));
        assert!(Filter::parse_all(&[""]).unwrap().matches(&o));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("name==").is_err());
        assert!(Filter::parse("name=value").is_err());
        assert!(Filter::parse(r#"labels."open"#).is_err());
    }
}
