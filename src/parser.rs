//! Tokenizer and parser for the rasa dialect.
//!
//! The tokenizer is a `logos` state machine; keywords come out as plain
//! identifiers and are recognized by the parser, which keeps the token enum
//! small and the keyword set in one place. The parser is a recursive descent
//! over a buffered token list with one token of lookahead (two for
//! command-style calls). Newlines are significant: they terminate statements
//! the way `;` does.

use logos::Logos;
use num_bigint::BigInt;
use std::fmt;

use crate::ast::{BinOp, Node, Target, WhenArm};
use crate::error::{Diagnostic, Error, Source, SyntaxError};

pub type Span = logos::Span;

/// Every word the parser claims for itself. Plain identifiers may not
/// collide with these.
const KEYWORDS: &[&str] = &[
    "def", "end", "if", "elsif", "else", "unless", "while", "case", "when",
    "then", "do", "class", "true", "false", "nil", "self", "return", "raise",
];

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

//===----------------------------------------------------------------------===//
// Utils
//===----------------------------------------------------------------------===//

/// Unescapes a string literal body. Handles \n, \t, \r, \0, \\ and the two
/// quote styles; an unknown escape keeps the backslash.
fn unescape_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('0') => result.push('\0'),
                Some('\\') => result.push('\\'),
                Some('\'') => result.push('\''),
                Some('"') => result.push('"'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

//===----------------------------------------------------------------------===//
// Token
//===----------------------------------------------------------------------===//

#[derive(Logos, Debug, PartialEq, Clone)]
pub enum Token {
    // Horizontal whitespace and comments are skipped; newlines are not.
    #[regex(r"[ \t\r]+", logos::skip)]
    #[regex(r"#[^\n]*", logos::skip)]
    #[token("\n")]
    Newline,
    #[token(";")]
    Semi,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,

    #[token("<=>")]
    Spaceship,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("=>")]
    FatArrow,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,

    // Digit runs always parse; negative literals fold in the parser.
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<BigInt>().unwrap())]
    Int(BigInt),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    #[regex(r"'([^'\\\n]|\\.)*'", |lex| {
        let s = lex.slice();
        unescape_string(&s[1..s.len() - 1])
    })]
    Str(String),

    // A quote that runs to end of line without closing. Kept below the
    // proper string rules so it only matches when they cannot.
    #[regex(r#""([^"\\\n]|\\.)*"#, priority = 0, callback = |lex| lex.slice().to_owned())]
    #[regex(r"'([^'\\\n]|\\.)*", priority = 0, callback = |lex| lex.slice().to_owned())]
    UnterminatedStr(String),

    // Identifiers may end in `?` (`empty?`, `is_a?`). Keywords lex as
    // identifiers and are picked apart by the parser.
    #[regex(r"[a-z_][a-zA-Z0-9_]*\??", |lex| lex.slice().to_owned())]
    Ident(String),

    #[regex(r"[A-Z][a-zA-Z0-9_]*", |lex| lex.slice().to_owned())]
    UpperIdent(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Newline => write!(f, "newline"),
            Token::Semi => write!(f, ";"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Spaceship => write!(f, "<=>"),
            Token::EqEq => write!(f, "=="),
            Token::BangEq => write!(f, "!="),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::FatArrow => write!(f, "=>"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Assign => write!(f, "="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Bang => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Int(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::UnterminatedStr(s) => write!(f, "{}", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::UpperIdent(s) => write!(f, "{}", s),
        }
    }
}

/// A token plus the byte range it was lexed from.
#[derive(Debug, PartialEq, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

//===----------------------------------------------------------------------===//
// Parser
//===----------------------------------------------------------------------===//

#[derive(Debug)]
pub struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
    source: String,
    file: Source,
}

impl Parser {
    /// Parses a complete program into its statement list.
    pub fn parse(source: &str, file: Source) -> Result<Vec<Node>, Diagnostic> {
        let mut parser = Self::tokenize(source, file)?;
        let body = parser.parse_statements(&[])?;
        match parser.peek() {
            None => Ok(body),
            Some(st) => {
                let (token, span) = (st.token.clone(), st.span.clone());
                Err(parser.err_unexpected(&token, span, "a statement"))
            }
        }
    }

    fn tokenize(source: &str, file: Source) -> Result<Self, Diagnostic> {
        let mut lexer = Token::lexer(source);
        let mut tokens: Vec<SpannedToken> = Vec::new();

        while let Some(result) = lexer.next() {
            let span = lexer.span();
            match result {
                Ok(Token::UnterminatedStr(_)) => {
                    return Err(Diagnostic::new(
                        Error::SyntaxError(SyntaxError::UnterminatedString),
                        span,
                        source.to_string(),
                        file,
                    )
                    .with_note("add a closing quote to terminate the string"));
                }
                Ok(token) => tokens.push(SpannedToken { token, span }),
                Err(()) => {
                    let char = source[span.clone()].chars().next().unwrap_or('?');
                    return Err(Diagnostic::new(
                        Error::SyntaxError(SyntaxError::InvalidCharacter { char }),
                        span,
                        source.to_string(),
                        file,
                    ));
                }
            }
        }

        Ok(Parser { tokens, position: 0, source: source.to_string(), file })
    }

    //===------------------------------------------------------------------===//
    // Token plumbing
    //===------------------------------------------------------------------===//

    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.position)
    }

    fn peek_second(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.position + 1)
    }

    fn advance(&mut self) -> Result<SpannedToken, Diagnostic> {
        match self.tokens.get(self.position) {
            Some(st) => {
                self.position += 1;
                Ok(st.clone())
            }
            None => Err(self.err_eof("more input")),
        }
    }

    /// The span of the most recently consumed token.
    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.position.saturating_sub(1))
            .map(|st| st.span.clone())
            .unwrap_or(0..0)
    }

    fn last_span(&self) -> Span {
        self.tokens.last().map(|st| st.span.clone()).unwrap_or_else(|| {
            let end = self.source.len();
            end..end
        })
    }

    fn err_eof(&self, expected: &str) -> Diagnostic {
        Diagnostic::new(
            Error::SyntaxError(SyntaxError::UnexpectedEof {
                expected: expected.to_string(),
            }),
            self.last_span(),
            self.source.clone(),
            self.file.clone(),
        )
    }

    fn err_unexpected(&self, token: &Token, span: Span, expected: &str) -> Diagnostic {
        Diagnostic::new(
            Error::SyntaxError(SyntaxError::UnexpectedToken {
                found: token.to_string(),
                expected: expected.to_string(),
            }),
            span,
            self.source.clone(),
            self.file.clone(),
        )
    }

    fn diagnostic(&self, error: Error, span: Span) -> Diagnostic {
        Diagnostic::new(error, span, self.source.clone(), self.file.clone())
    }

    fn at_token(&self, token: &Token) -> bool {
        self.peek().map(|st| &st.token == token).unwrap_or(false)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at_token(token) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<Span, Diagnostic> {
        match self.peek() {
            Some(st) if st.token == token => {
                let span = st.span.clone();
                self.position += 1;
                Ok(span)
            }
            Some(st) => {
                let (found, span) = (st.token.clone(), st.span.clone());
                Err(self.err_unexpected(&found, span, expected))
            }
            None => Err(self.err_eof(expected)),
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(SpannedToken { token: Token::Ident(s), .. }) if s == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<Span, Diagnostic> {
        if self.at_kw(kw) {
            let span = self.peek().unwrap().span.clone();
            self.position += 1;
            Ok(span)
        } else {
            match self.peek() {
                Some(st) => {
                    let (found, span) = (st.token.clone(), st.span.clone());
                    Err(self.err_unexpected(&found, span, &format!("`{}`", kw)))
                }
                None => Err(self.err_eof(&format!("`{}`", kw))),
            }
        }
    }

    fn at_any_kw(&self, kws: &[&str]) -> bool {
        kws.iter().any(|kw| self.at_kw(kw))
    }

    fn at_terminator(&self) -> bool {
        matches!(
            self.peek(),
            Some(SpannedToken { token: Token::Newline | Token::Semi, .. })
        )
    }

    fn skip_terminators(&mut self) {
        while self.at_terminator() {
            self.position += 1;
        }
    }

    //===------------------------------------------------------------------===//
    // Statements
    //===------------------------------------------------------------------===//

    /// Parses statements until one of the `stop` keywords or end of input.
    /// The stop keyword is left for the caller to consume.
    fn parse_statements(&mut self, stop: &[&str]) -> Result<Vec<Node>, Diagnostic> {
        let mut body = Vec::new();
        loop {
            self.skip_terminators();
            if self.peek().is_none() || self.at_any_kw(stop) {
                break;
            }
            body.push(self.parse_statement()?);
            match self.peek() {
                None => break,
                Some(st) if matches!(st.token, Token::Newline | Token::Semi) => {}
                Some(_) if self.at_any_kw(stop) => break,
                Some(st) => {
                    let (found, span) = (st.token.clone(), st.span.clone());
                    return Err(self.err_unexpected(&found, span, "a newline or `;`"));
                }
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Node, Diagnostic> {
        if self.at_kw("def") {
            return self.parse_def();
        }
        if self.at_kw("class") {
            return self.parse_class();
        }

        let stmt = if self.at_kw("return") {
            let kw_span = self.advance()?.span;
            let value = if self.peek().is_none()
                || self.at_terminator()
                || self.at_any_kw(&["end", "else", "elsif", "when", "if", "unless"])
            {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            };
            let end = value
                .as_ref()
                .map(|v| v.span().end)
                .unwrap_or(kw_span.end);
            Node::Return { span: kw_span.start..end, value }
        } else if self.at_kw("raise") {
            let kw_span = self.advance()?.span;
            let st = match self.peek() {
                Some(st) => st.clone(),
                None => return Err(self.err_eof("a string literal")),
            };
            match st.token {
                Token::Str(message) => {
                    self.position += 1;
                    Node::Raise { span: kw_span.start..st.span.end, message }
                }
                found => {
                    return Err(self.err_unexpected(&found, st.span, "a string literal"))
                }
            }
        } else if self.at_command_call() {
            self.parse_command_call()?
        } else {
            self.parse_expression()?
        };

        // Statement modifiers: `EXPR if COND`, `EXPR unless COND`.
        if self.at_kw("if") || self.at_kw("unless") {
            let unless = self.at_kw("unless");
            self.position += 1;
            let cond = self.parse_expression()?;
            return Ok(wrap_modifier(stmt, cond, unless));
        }

        Ok(stmt)
    }

    /// True when the next two tokens read as a paren-less call:
    /// `put_as_number 3 + 2`. Only bareword heads qualify, and only when
    /// the following token can begin an argument expression — parentheses,
    /// brackets and minus signs stay binary/grouping to keep `x - 1` a
    /// subtraction.
    fn at_command_call(&self) -> bool {
        match self.peek() {
            Some(SpannedToken { token: Token::Ident(name), .. })
                if !is_keyword(name) => {}
            _ => return false,
        }
        match self.peek_second() {
            Some(SpannedToken { token, .. }) => match token {
                Token::Int(_) | Token::Str(_) | Token::UpperIdent(_) => true,
                Token::Ident(name) => {
                    !is_keyword(name)
                        || matches!(name.as_str(), "true" | "false" | "nil" | "self")
                }
                _ => false,
            },
            None => false,
        }
    }

    fn parse_command_call(&mut self) -> Result<Node, Diagnostic> {
        let head = self.advance()?;
        let name = match head.token {
            Token::Ident(name) => name,
            _ => unreachable!("checked by at_command_call"),
        };
        let mut args = vec![self.parse_expression()?];
        while self.eat(&Token::Comma) {
            args.push(self.parse_expression()?);
        }
        let end = args.last().map(|a| a.span().end).unwrap_or(head.span.end);
        Ok(Node::Call {
            span: head.span.start..end,
            recv: None,
            name,
            args,
        })
    }

    fn parse_def(&mut self) -> Result<Node, Diagnostic> {
        let def_span = self.expect_kw("def")?;
        let name = self.parse_method_name()?;

        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            if !self.eat(&Token::RParen) {
                loop {
                    let st = self.advance()?;
                    match st.token {
                        Token::Ident(param) if !is_keyword(&param) => {
                            params.push(param)
                        }
                        found => {
                            return Err(self.err_unexpected(
                                &found,
                                st.span,
                                "a parameter name",
                            ))
                        }
                    }
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(Token::RParen, "`)`")?;
            }
        }

        let body = self.parse_statements(&["end"])?;
        let end_span = self.expect_kw("end")?;
        Ok(Node::Def { span: def_span.start..end_span.end, name, params, body })
    }

    /// A method name in `def` position: an identifier or one of the
    /// operator names the prelude and the built-in classes define.
    fn parse_method_name(&mut self) -> Result<String, Diagnostic> {
        let st = self.advance()?;
        match st.token {
            Token::Ident(name) if !is_keyword(&name) => Ok(name),
            Token::Lt => Ok("<".to_string()),
            Token::Gt => Ok(">".to_string()),
            Token::LtEq => Ok("<=".to_string()),
            Token::GtEq => Ok(">=".to_string()),
            Token::Spaceship => Ok("<=>".to_string()),
            Token::LBracket => {
                self.expect(Token::RBracket, "`]`")?;
                if self.eat(&Token::Assign) {
                    Ok("[]=".to_string())
                } else {
                    Ok("[]".to_string())
                }
            }
            found => Err(self.err_unexpected(&found, st.span, "a method name")),
        }
    }

    fn parse_class(&mut self) -> Result<Node, Diagnostic> {
        let class_span = self.expect_kw("class")?;
        let st = self.advance()?;
        let name = match st.token {
            Token::UpperIdent(name) => name,
            found => {
                return Err(self.err_unexpected(&found, st.span, "a class name"))
            }
        };

        let mut body = Vec::new();
        loop {
            self.skip_terminators();
            if self.at_kw("end") {
                break;
            }
            if self.at_kw("class") {
                let span = self.peek().unwrap().span.clone();
                return Err(self.diagnostic(
                    Error::CompileError(crate::error::CompileError::NestedClass),
                    span,
                ));
            }
            if self.at_kw("def") {
                body.push(self.parse_def()?);
                continue;
            }
            match self.peek() {
                Some(st) => {
                    let span = st.span.clone();
                    return Err(self.diagnostic(
                        Error::CompileError(
                            crate::error::CompileError::ClassBodyNotADefinition,
                        ),
                        span,
                    ));
                }
                None => return Err(self.err_eof("`end`")),
            }
        }
        let end_span = self.expect_kw("end")?;
        Ok(Node::Class { span: class_span.start..end_span.end, name, body })
    }

    //===------------------------------------------------------------------===//
    // Expressions
    //===------------------------------------------------------------------===//

    fn parse_expression(&mut self) -> Result<Node, Diagnostic> {
        self.parse_assignment()
    }

    /// Assignment is right-associative and the loosest binding level.
    fn parse_assignment(&mut self) -> Result<Node, Diagnostic> {
        let expr = self.parse_equality()?;
        if self.eat(&Token::Assign) {
            let target = self.to_target(expr)?;
            let value = self.parse_assignment()?;
            let span = target.span().start..value.span().end;
            return Ok(Node::Assign {
                span,
                target: Box::new(target),
                value: Box::new(value),
            });
        }
        Ok(expr)
    }

    fn to_target(&self, expr: Node) -> Result<Target, Diagnostic> {
        match expr {
            Node::Ident { span, name } => Ok(Target::Local { span, name }),
            Node::Const { span, name } => Ok(Target::Const { span, name }),
            Node::Call { span, recv: Some(recv), name, mut args }
                if name == "[]" && args.len() == 1 =>
            {
                Ok(Target::Index { span, recv: *recv, index: args.remove(0) })
            }
            other => Err(self.diagnostic(
                Error::CompileError(crate::error::CompileError::InvalidAssignmentTarget),
                other.span().clone(),
            )),
        }
    }

    fn parse_equality(&mut self) -> Result<Node, Diagnostic> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek().map(|st| &st.token) {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::BangEq) => BinOp::Ne,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Node, Diagnostic> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek().map(|st| &st.token) {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::LtEq) => BinOp::Le,
                Some(Token::GtEq) => BinOp::Ge,
                Some(Token::Spaceship) => BinOp::Cmp,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Node, Diagnostic> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|st| &st.token) {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, Diagnostic> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|st| &st.token) {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.position += 1;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, Diagnostic> {
        if self.at_token(&Token::Bang) {
            let bang_span = self.advance()?.span;
            let expr = self.parse_unary()?;
            let span = bang_span.start..expr.span().end;
            return Ok(Node::Not { span, expr: Box::new(expr) });
        }
        if self.at_token(&Token::Minus) {
            let minus_span = self.advance()?.span;
            let expr = self.parse_unary()?;
            let span = minus_span.start..expr.span().end;
            // Negative literals fold here; everything else negates at
            // run time as `0 - x`.
            if let Node::Int { value, .. } = expr {
                return Ok(Node::Int { span, value: -value });
            }
            return Ok(Node::Neg { span, expr: Box::new(expr) });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, Diagnostic> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let st = self.advance()?;
                let name = match st.token {
                    Token::Ident(name) if !is_keyword(&name) => name,
                    found => {
                        return Err(self.err_unexpected(
                            &found,
                            st.span,
                            "a method name",
                        ))
                    }
                };
                let args = if self.at_token(&Token::LParen) {
                    self.parse_paren_args()?
                } else {
                    Vec::new()
                };
                let span = expr.span().start..self.prev_span().end;
                expr = Node::Call {
                    span,
                    recv: Some(Box::new(expr)),
                    name,
                    args,
                };
            } else if self.at_token(&Token::LBracket) {
                self.position += 1;
                let index = self.parse_expression()?;
                let close = self.expect(Token::RBracket, "`]`")?;
                let span = expr.span().start..close.end;
                expr = Node::Call {
                    span,
                    recv: Some(Box::new(expr)),
                    name: "[]".to_string(),
                    args: vec![index],
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_paren_args(&mut self) -> Result<Vec<Node>, Diagnostic> {
        self.expect(Token::LParen, "`(`")?;
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "`)`")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Node, Diagnostic> {
        let st = match self.peek() {
            Some(st) => st.clone(),
            None => return Err(self.err_eof("an expression")),
        };

        match st.token {
            Token::Int(value) => {
                self.position += 1;
                Ok(Node::Int { span: st.span, value })
            }
            Token::Str(value) => {
                self.position += 1;
                Ok(Node::Str { span: st.span, value })
            }
            Token::UpperIdent(name) => {
                self.position += 1;
                Ok(Node::Const { span: st.span, name })
            }
            Token::Ident(ref name) => match name.as_str() {
                "true" => {
                    self.position += 1;
                    Ok(Node::True { span: st.span })
                }
                "false" => {
                    self.position += 1;
                    Ok(Node::False { span: st.span })
                }
                "nil" => {
                    self.position += 1;
                    Ok(Node::Nil { span: st.span })
                }
                "self" => {
                    self.position += 1;
                    Ok(Node::SelfRef { span: st.span })
                }
                "if" => self.parse_if(false),
                "unless" => self.parse_if(true),
                "while" => self.parse_while(),
                "case" => self.parse_case(),
                _ if is_keyword(&name) => {
                    Err(self.err_unexpected(&st.token, st.span, "an expression"))
                }
                _ => {
                    let name = name.clone();
                    self.position += 1;
                    if self.at_token(&Token::LParen) {
                        let args = self.parse_paren_args()?;
                        let span = st.span.start..self.prev_span().end;
                        Ok(Node::Call { span, recv: None, name, args })
                    } else {
                        Ok(Node::Ident { span: st.span, name })
                    }
                }
            },
            Token::LParen => {
                self.position += 1;
                let expr = self.parse_expression()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(expr)
            }
            Token::LBracket => self.parse_array_literal(),
            Token::LBrace => self.parse_hash_literal(),
            found => Err(self.err_unexpected(&found, st.span, "an expression")),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Node, Diagnostic> {
        let open = self.expect(Token::LBracket, "`[`")?;
        let mut elements = Vec::new();
        if !self.at_token(&Token::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let close = self.expect(Token::RBracket, "`]`")?;
        Ok(Node::ArrayLit { span: open.start..close.end, elements })
    }

    fn parse_hash_literal(&mut self) -> Result<Node, Diagnostic> {
        let open = self.expect(Token::LBrace, "`{`")?;
        let mut pairs = Vec::new();
        if !self.at_token(&Token::RBrace) {
            loop {
                let key = self.parse_expression()?;
                self.expect(Token::FatArrow, "`=>`")?;
                let value = self.parse_expression()?;
                pairs.push((key, value));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        let close = self.expect(Token::RBrace, "`}`")?;
        Ok(Node::HashLit { span: open.start..close.end, pairs })
    }

    fn parse_if(&mut self, unless: bool) -> Result<Node, Diagnostic> {
        let kw_span = self.advance()?.span;
        let cond = self.parse_expression()?;
        self.eat_kw("then");
        let first = self.parse_statements(&["elsif", "else", "end"])?;
        if unless && self.at_kw("elsif") {
            let st = self.peek().unwrap();
            let (found, span) = (st.token.clone(), st.span.clone());
            return Err(self.err_unexpected(&found, span, "`else` or `end`"));
        }
        let rest = self.parse_if_tail()?;
        let (then_body, else_body) =
            if unless { (rest, first) } else { (first, rest) };
        Ok(Node::If {
            span: kw_span.start..self.prev_span().end,
            cond: Box::new(cond),
            then_body,
            else_body,
        })
    }

    /// The `elsif`/`else`/`end` tail of a conditional, consumed through its
    /// closing `end`. Returns the else-branch statements.
    fn parse_if_tail(&mut self) -> Result<Vec<Node>, Diagnostic> {
        if self.at_kw("elsif") {
            let kw_span = self.advance()?.span;
            let cond = self.parse_expression()?;
            self.eat_kw("then");
            let then_body = self.parse_statements(&["elsif", "else", "end"])?;
            let else_body = self.parse_if_tail()?;
            return Ok(vec![Node::If {
                span: kw_span.start..self.prev_span().end,
                cond: Box::new(cond),
                then_body,
                else_body,
            }]);
        }
        if self.eat_kw("else") {
            let body = self.parse_statements(&["end"])?;
            self.expect_kw("end")?;
            return Ok(body);
        }
        self.expect_kw("end")?;
        Ok(Vec::new())
    }

    fn parse_while(&mut self) -> Result<Node, Diagnostic> {
        let kw_span = self.advance()?.span;
        let cond = self.parse_expression()?;
        self.eat_kw("do");
        let body = self.parse_statements(&["end"])?;
        let end_span = self.expect_kw("end")?;
        Ok(Node::While {
            span: kw_span.start..end_span.end,
            cond: Box::new(cond),
            body,
        })
    }

    fn parse_case(&mut self) -> Result<Node, Diagnostic> {
        let kw_span = self.advance()?.span;
        let subject = self.parse_expression()?;
        let mut whens = Vec::new();
        let mut else_body = Vec::new();

        loop {
            self.skip_terminators();
            if self.at_kw("when") {
                let when_span = self.advance()?.span;
                let mut patterns = vec![self.parse_expression()?];
                while self.eat(&Token::Comma) {
                    patterns.push(self.parse_expression()?);
                }
                self.eat_kw("then");
                let body = self.parse_statements(&["when", "else", "end"])?;
                whens.push(WhenArm {
                    span: when_span.start..self.prev_span().end,
                    patterns,
                    body,
                });
            } else if self.eat_kw("else") {
                else_body = self.parse_statements(&["end"])?;
                self.expect_kw("end")?;
                break;
            } else if self.eat_kw("end") {
                break;
            } else {
                match self.peek() {
                    Some(st) => {
                        let (found, span) = (st.token.clone(), st.span.clone());
                        return Err(self.err_unexpected(
                            &found,
                            span,
                            "`when`, `else` or `end`",
                        ));
                    }
                    None => return Err(self.err_eof("`end`")),
                }
            }
        }

        Ok(Node::Case {
            span: kw_span.start..self.prev_span().end,
            subject: Box::new(subject),
            whens,
            else_body,
        })
    }
}

fn binary(op: BinOp, lhs: Node, rhs: Node) -> Node {
    let span = lhs.span().start..rhs.span().end;
    Node::Binary { span, op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

/// Applies a statement modifier. The conditional wraps an assignment's
/// right-hand side rather than the assignment, so `x = 100 if false` binds
/// nil.
fn wrap_modifier(stmt: Node, cond: Node, unless: bool) -> Node {
    let conditional = |value: Node| {
        let span = value.span().clone();
        let (then_body, else_body) =
            if unless { (Vec::new(), vec![value]) } else { (vec![value], Vec::new()) };
        Node::If { span, cond: Box::new(cond), then_body, else_body }
    };

    match stmt {
        Node::Assign { span, target, value } => Node::Assign {
            span,
            target,
            value: Box::new(conditional(*value)),
        },
        other => conditional(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Node;

    fn parse(source: &str) -> Vec<Node> {
        Parser::parse(source, Source::Inline).unwrap()
    }

    fn parse_err(source: &str) -> Diagnostic {
        Parser::parse(source, Source::Inline).unwrap_err()
    }

    #[test]
    fn precedence_ladder() {
        let ast = parse("1 + 2 * 3 == 7");
        let Node::Binary { op: BinOp::Eq, lhs, .. } = &ast[0] else {
            panic!("expected ==, got {:?}", ast[0]);
        };
        let Node::Binary { op: BinOp::Add, rhs, .. } = lhs.as_ref() else {
            panic!("expected +, got {:?}", lhs);
        };
        assert!(matches!(rhs.as_ref(), Node::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn negative_literals_fold() {
        let ast = parse("x = -10");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        assert!(value.is_int_literal(-10));
    }

    #[test]
    fn unary_minus_on_expressions() {
        let ast = parse("y = -x");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        assert!(matches!(value.as_ref(), Node::Neg { .. }));
    }

    #[test]
    fn command_call_takes_full_expression() {
        let ast = parse("put_as_number 3 + 2");
        let Node::Call { recv: None, name, args, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "put_as_number");
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0], Node::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn bare_minus_stays_binary() {
        let ast = parse("x - 1");
        assert!(matches!(ast[0], Node::Binary { op: BinOp::Sub, .. }));
    }

    #[test]
    fn index_read_and_write() {
        let ast = parse("x[1] = x[0]");
        let Node::Assign { target, value, .. } = &ast[0] else { panic!() };
        assert!(matches!(target.as_ref(), Target::Index { .. }));
        assert!(
            matches!(value.as_ref(), Node::Call { name, recv: Some(_), .. } if name == "[]")
        );
    }

    #[test]
    fn method_call_without_parens() {
        let ast = parse("x.size");
        let Node::Call { recv: Some(_), name, args, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "size");
        assert!(args.is_empty());
    }

    #[test]
    fn if_elsif_else_nests() {
        let ast = parse("if a then 1 elsif b then 2 else 3 end");
        let Node::If { else_body, .. } = &ast[0] else { panic!() };
        assert_eq!(else_body.len(), 1);
        let Node::If { else_body: inner_else, .. } = &else_body[0] else { panic!() };
        assert_eq!(inner_else.len(), 1);
    }

    #[test]
    fn unless_swaps_branches() {
        let ast = parse("unless a then 1 else 2 end");
        let Node::If { then_body, else_body, .. } = &ast[0] else { panic!() };
        assert!(then_body[0].is_int_literal(2));
        assert!(else_body[0].is_int_literal(1));
    }

    #[test]
    fn assignment_modifier_wraps_rhs() {
        let ast = parse("x = 100 if false");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        let Node::If { then_body, else_body, .. } = value.as_ref() else {
            panic!("modifier should wrap the right-hand side")
        };
        assert!(then_body[0].is_int_literal(100));
        assert!(else_body.is_empty());
    }

    #[test]
    fn statement_modifier_wraps_statement() {
        let ast = parse("put_as_number 1 unless done");
        let Node::If { then_body, else_body, .. } = &ast[0] else { panic!() };
        assert!(then_body.is_empty());
        assert!(matches!(else_body[0], Node::Call { .. }));
    }

    #[test]
    fn def_with_operator_names() {
        let ast = parse("def <(other)\n  1\nend");
        let Node::Def { name, params, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "<");
        assert_eq!(params, &["other".to_string()]);

        let ast = parse("def []=(i, v)\n  v\nend");
        let Node::Def { name, params, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "[]=");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn one_line_method() {
        let ast = parse("def f(n) if n < 2 then 1 else f(n-1)+f(n-2) end end");
        let Node::Def { body, .. } = &ast[0] else { panic!() };
        assert_eq!(body.len(), 1);
        assert!(matches!(body[0], Node::If { .. }));
    }

    #[test]
    fn class_reopening_collects_defs() {
        let ast = parse("class Array\n  def first\n    self[0]\n  end\nend");
        let Node::Class { name, body, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "Array");
        assert_eq!(body.len(), 1);
        assert!(matches!(body[0], Node::Def { .. }));
    }

    #[test]
    fn nested_class_is_rejected() {
        let err = parse_err("class Array\n  class Hash\n  end\nend");
        assert!(matches!(
            err.error,
            Error::CompileError(crate::error::CompileError::NestedClass)
        ));
    }

    #[test]
    fn class_body_must_be_defs() {
        let err = parse_err("class Array\n  x = 1\nend");
        assert!(matches!(
            err.error,
            Error::CompileError(crate::error::CompileError::ClassBodyNotADefinition)
        ));
    }

    #[test]
    fn hash_literal_pairs() {
        let ast = parse("x = {1 => 42, 12 => 4}");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        let Node::HashLit { pairs, .. } = value.as_ref() else { panic!() };
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn array_literal_elements() {
        let ast = parse("x = [1, 2, 3]");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        let Node::ArrayLit { elements, .. } = value.as_ref() else { panic!() };
        assert_eq!(elements.len(), 3);
    }

    #[test]
    fn empty_collections() {
        assert!(matches!(
            &parse("x = []")[0],
            Node::Assign { .. }
        ));
        let ast = parse("x = {}");
        let Node::Assign { value, .. } = &ast[0] else { panic!() };
        assert!(matches!(value.as_ref(), Node::HashLit { pairs, .. } if pairs.is_empty()));
    }

    #[test]
    fn case_with_multiple_patterns() {
        let ast = parse("case x\nwhen 1, 2 then 'a'\nwhen 3\n  'b'\nelse\n  'c'\nend");
        let Node::Case { whens, else_body, .. } = &ast[0] else { panic!() };
        assert_eq!(whens.len(), 2);
        assert_eq!(whens[0].patterns.len(), 2);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn raise_takes_a_string() {
        let ast = parse("raise \"boom\"");
        let Node::Raise { message, .. } = &ast[0] else { panic!() };
        assert_eq!(message, "boom");
    }

    #[test]
    fn return_with_and_without_value() {
        let ast = parse("def f\n  return 1\nend\ndef g\n  return\nend");
        let Node::Def { body, .. } = &ast[0] else { panic!() };
        assert!(matches!(&body[0], Node::Return { value: Some(_), .. }));
        let Node::Def { body, .. } = &ast[1] else { panic!() };
        assert!(matches!(&body[0], Node::Return { value: None, .. }));
    }

    #[test]
    fn semicolons_separate_statements() {
        let ast = parse("x = 1; y = 2; put_as_number x + y");
        assert_eq!(ast.len(), 3);
    }

    #[test]
    fn comments_are_skipped() {
        let ast = parse("x = 1 # the answer\nput_as_number x");
        assert_eq!(ast.len(), 2);
    }

    #[test]
    fn unterminated_string_is_reported() {
        let err = parse_err("x = 'oops");
        assert!(matches!(
            err.error,
            Error::SyntaxError(SyntaxError::UnterminatedString)
        ));
    }

    #[test]
    fn missing_end_is_reported() {
        let err = parse_err("if x then 1");
        assert!(matches!(err.error, Error::SyntaxError(SyntaxError::UnexpectedEof { .. })));
    }

    #[test]
    fn spaceship_operator_parses() {
        let ast = parse("a <=> b");
        assert!(matches!(ast[0], Node::Binary { op: BinOp::Cmp, .. }));
    }

    #[test]
    fn question_mark_identifiers() {
        let ast = parse("x.empty?");
        let Node::Call { name, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "empty?");
    }

    #[test]
    fn is_a_parses_as_call() {
        let ast = parse("x.is_a?(Array)");
        let Node::Call { name, args, .. } = &ast[0] else { panic!() };
        assert_eq!(name, "is_a?");
        assert!(matches!(&args[0], Node::Const { name, .. } if name == "Array"));
    }
}
