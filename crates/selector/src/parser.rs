//! Label selector expressions.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | "all()" | "global()" | "has(" key ")"
//!          | key ( "==" str | "!=" str | "in" set | "not in" set
//!                | "contains" str | "starts with" str | "ends with" str )
//! set     := "{" [ str ( "," str )* ] "}"
//! ```
//!
//! An empty (or all-whitespace) expression selects everything.

use pip_core::Labels;

use crate::SelectorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    /// Matches resources outside any namespace. Only meaningful as a namespace selector;
    /// against a label set it behaves like `all()`.
    Global,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Contains(String, String),
    StartsWith(String, String),
    EndsWith(String, String),
    Not(Box<Selector>),
    And(Vec<Selector>),
    Or(Vec<Selector>),
}

impl Selector {
    pub fn parse(expression: &str) -> Result<Selector, SelectorError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() { return Ok(Selector::All); }
        let mut p = Parser { expression, tokens, pos: 0 };
        let sel = p.expr()?;
        if let Some((at, tok)) = p.tokens.get(p.pos) {
            return Err(SelectorError::new(expression, *at, format!("unexpected {}", tok.describe())));
        }
        Ok(sel)
    }

    pub fn is_global(&self) -> bool { matches!(self, Selector::Global) }

    pub fn evaluate(&self, labels: &Labels) -> bool {
        match self {
            Selector::All | Selector::Global => true,
            Selector::Has(k) => labels.contains_key(k),
            Selector::Eq(k, v) => labels.get(k) == Some(v),
            Selector::Ne(k, v) => labels.get(k) != Some(v),
            Selector::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Selector::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
            Selector::Contains(k, s) => labels.get(k).map(|v| v.contains(s.as_str())).unwrap_or(false),
            Selector::StartsWith(k, s) => labels.get(k).map(|v| v.starts_with(s.as_str())).unwrap_or(false),
            Selector::EndsWith(k, s) => labels.get(k).map(|v| v.ends_with(s.as_str())).unwrap_or(false),
            Selector::Not(inner) => !inner.evaluate(labels),
            Selector::And(all) => all.iter().all(|s| s.evaluate(labels)),
            Selector::Or(any) => any.iter().any(|s| s.evaluate(labels)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{}'", s),
            Token::Str(s) => format!("string '{}'", s),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::LBrace => "'{'".into(),
            Token::RBrace => "'}'".into(),
            Token::Comma => "','".into(),
            Token::Bang => "'!'".into(),
            Token::AndAnd => "'&&'".into(),
            Token::OrOr => "'||'".into(),
            Token::EqEq => "'=='".into(),
            Token::NotEq => "'!='".into(),
        }
    }
}

fn is_ident_char(c: char) -> bool { c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/') }

fn tokenize(expression: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let mut out = Vec::new();
    let chars: Vec<(usize, char)> = expression.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (at, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => { i += 1; }
            '(' => { out.push((at, Token::LParen)); i += 1; }
            ')' => { out.push((at, Token::RParen)); i += 1; }
            '{' => { out.push((at, Token::LBrace)); i += 1; }
            '}' => { out.push((at, Token::RBrace)); i += 1; }
            ',' => { out.push((at, Token::Comma)); i += 1; }
            '&' if next == Some('&') => { out.push((at, Token::AndAnd)); i += 2; }
            '|' if next == Some('|') => { out.push((at, Token::OrOr)); i += 2; }
            '=' if next == Some('=') => { out.push((at, Token::EqEq)); i += 2; }
            '!' if next == Some('=') => { out.push((at, Token::NotEq)); i += 2; }
            '!' => { out.push((at, Token::Bang)); i += 1; }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, ch)) if *ch == quote => { i += 1; break; }
                        Some((_, ch)) => { s.push(*ch); i += 1; }
                        None => return Err(SelectorError::new(expression, at, "unterminated string")),
                    }
                }
                out.push((at, Token::Str(s)));
            }
            c if is_ident_char(c) => {
                let mut s = String::new();
                while let Some((_, ch)) = chars.get(i) {
                    if !is_ident_char(*ch) { break; }
                    s.push(*ch);
                    i += 1;
                }
                out.push((at, Token::Ident(s)));
            }
            other => return Err(SelectorError::new(expression, at, format!("unexpected character '{}'", other))),
        }
    }
    Ok(out)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos).map(|(_, t)| t) }
    fn peek_at(&self, n: usize) -> Option<&Token> { self.tokens.get(self.pos + n).map(|(_, t)| t) }

    fn offset(&self) -> usize { self.tokens.get(self.pos).map(|(at, _)| *at).unwrap_or(self.expression.len()) }

    fn err(&self, msg: impl Into<String>) -> SelectorError { SelectorError::new(self.expression, self.offset(), msg) }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if t.is_some() { self.pos += 1; }
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), SelectorError> {
        match self.peek() {
            Some(t) if *t == want => { self.pos += 1; Ok(()) }
            Some(t) => Err(self.err(format!("expected {}, found {}", want.describe(), t.describe()))),
            None => Err(self.err(format!("expected {}, found end of input", want.describe()))),
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), SelectorError> {
        match self.peek() {
            Some(Token::Ident(s)) if s == kw => { self.pos += 1; Ok(()) }
            _ => Err(self.err(format!("expected '{}'", kw))),
        }
    }

    fn string(&mut self) -> Result<String, SelectorError> {
        match self.bump() {
            Some(Token::Str(s)) => Ok(s),
            Some(t) => { self.pos -= 1; Err(self.err(format!("expected string, found {}", t.describe()))) }
            None => Err(self.err("expected string, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Selector, SelectorError> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Selector::Or(terms) })
    }

    fn and(&mut self) -> Result<Selector, SelectorError> {
        let mut terms = vec![self.unary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Selector::And(terms) })
    }

    fn unary(&mut self) -> Result<Selector, SelectorError> {
        if self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            return Ok(Selector::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Selector, SelectorError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if self.peek_at(1) == Some(&Token::LParen) => {
                self.pos += 2;
                let sel = match name.as_str() {
                    "all" => Selector::All,
                    "global" => Selector::Global,
                    "has" => match self.bump() {
                        Some(Token::Ident(k)) => Selector::Has(k),
                        _ => { self.pos -= 1; return Err(self.err("expected label key in has()")); }
                    },
                    other => { self.pos -= 2; return Err(self.err(format!("unknown function '{}'", other))); }
                };
                self.expect(Token::RParen)?;
                Ok(sel)
            }
            Some(Token::Ident(key)) => {
                self.pos += 1;
                self.comparison(key)
            }
            Some(t) => Err(self.err(format!("unexpected {}", t.describe()))),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn comparison(&mut self, key: String) -> Result<Selector, SelectorError> {
        match self.peek().cloned() {
            Some(Token::EqEq) => { self.pos += 1; Ok(Selector::Eq(key, self.string()?)) }
            Some(Token::NotEq) => { self.pos += 1; Ok(Selector::Ne(key, self.string()?)) }
            Some(Token::Ident(op)) => {
                self.pos += 1;
                match op.as_str() {
                    "in" => Ok(Selector::In(key, self.set()?)),
                    "not" => { self.expect_keyword("in")?; Ok(Selector::NotIn(key, self.set()?)) }
                    "contains" => Ok(Selector::Contains(key, self.string()?)),
                    "starts" => { self.expect_keyword("with")?; Ok(Selector::StartsWith(key, self.string()?)) }
                    "ends" => { self.expect_keyword("with")?; Ok(Selector::EndsWith(key, self.string()?)) }
                    other => { self.pos -= 1; Err(self.err(format!("unknown operator '{}'", other))) }
                }
            }
            Some(t) => Err(self.err(format!("expected operator after '{}', found {}", key, t.describe()))),
            None => Err(self.err(format!("expected operator after '{}'", key))),
        }
    }

    fn set(&mut self) -> Result<Vec<String>, SelectorError> {
        self.expect(Token::LBrace)?;
        let mut out = Vec::new();
        if self.peek() == Some(&Token::RBrace) { self.pos += 1; return Ok(out); }
        loop {
            out.push(self.string()?);
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => break,
                _ => { self.pos -= 1; return Err(self.err("expected ',' or '}' in set")); }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels { pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }

    #[test]
    fn parses_basic_forms() {
        assert_eq!(Selector::parse("").unwrap(), Selector::All);
        assert_eq!(Selector::parse("all()").unwrap(), Selector::All);
        assert_eq!(Selector::parse("global()").unwrap(), Selector::Global);
        assert_eq!(Selector::parse("has(app)").unwrap(), Selector::Has("app".into()));
        assert_eq!(Selector::parse("color == 'red'").unwrap(), Selector::Eq("color".into(), "red".into()));
        assert_eq!(
            Selector::parse("tier in {\"a\", 'b'}").unwrap(),
            Selector::In("tier".into(), vec!["a".into(), "b".into()])
        );
        assert_eq!(Selector::parse("k not in {}").unwrap(), Selector::NotIn("k".into(), vec![]));
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let s = Selector::parse("a == '1' || b == '2' && !has(c)").unwrap();
        match s {
            Selector::Or(terms) => {
                assert_eq!(terms.len(), 2);
                assert!(matches!(terms[1], Selector::And(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn evaluates_against_labels() {
        let l = labels(&[("app", "web-frontend"), ("projectcalico.org/namespace", "ns1")]);
        let ok = [
            "app == 'web-frontend'",
            "app != 'db'",
            "missing != 'x'",
            "app starts with 'web'",
            "app ends with 'end'",
            "app contains 'front'",
            "app in {'db', 'web-frontend'}",
            "missing not in {'x'}",
            "has(projectcalico.org/namespace) && !has(missing)",
            "(app == 'db' || app == 'web-frontend')",
        ];
        for e in ok {
            assert!(Selector::parse(e).unwrap().evaluate(&l), "{} should match", e);
        }
        let no = ["app == 'db'", "app not in {'web-frontend'}", "has(missing)", "!all()", "missing in {'x'}"];
        for e in no {
            assert!(!Selector::parse(e).unwrap().evaluate(&l), "{} should not match", e);
        }
    }

    #[test]
    fn rejects_malformed() {
        for e in ["app ==", "app = 'x'", "(app == 'x'", "app == 'x' extra", "has()", "foo(bar)", "app in {'a' 'b'}", "app == 'unterminated", "app ~ 'x'"] {
            let err = Selector::parse(e).expect_err(e);
            assert_eq!(err.expression, e);
        }
    }
}
