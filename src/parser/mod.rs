// Recursive descent parser for the definition language
//
// Declarations are applied to the registry as they parse; the registry
// snapshots its state around `load`, so a failed parse commits nothing.

pub mod ast;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Error, ParseError};
use crate::eval::{self, Scope};
use crate::lexer::token::{Token, TokenKind};
use crate::lexer::Lexer;
use crate::registry::{ConstValue, TypeRegistry};
use crate::span::{offset_to_line_col, Span};
use crate::types::{ArrayLen, Field, PtrTarget, Type, TypeKind, TypeRef};
use ast::{BinOp, Expr, ExprKind, UnaryOp};

/// Parse a standalone expression from text
pub(crate) fn parse_expr_text(text: &str) -> Result<Expr, Error> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut ts = TokenStream::new(text, tokens);
    let expr = ts.parse_expr()?;
    if !ts.at_eof() {
        return Err(ts.expected("end of expression"));
    }
    Ok(expr)
}

/// Token cursor with the shared peek/expect/eat helpers and the
/// expression grammar. The declaration parser wraps this together
/// with a registry.
pub(crate) struct TokenStream<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> TokenStream<'a> {
    pub fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_ahead(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or_else(Span::dummy)
    }

    fn advance(&mut self) -> Token {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, Span::dummy()));
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &TokenKind) -> Result<Token, Error> {
        if self.check(expected) {
            Ok(self.advance())
        } else {
            Err(self.expected_kind(&format!("{}", expected)))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), Error> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                let span = self.peek_span();
                self.advance();
                Ok((name, span))
            }
            _ => Err(self.expected_kind("identifier")),
        }
    }

    fn err(&self, span: Span, message: impl Into<String>) -> Error {
        Error::parse_at(self.source, span, message)
    }

    fn expected(&self, what: &str) -> Error {
        self.expected_kind(what)
    }

    fn expected_kind(&self, expected: &str) -> Error {
        let (line, col) = offset_to_line_col(self.source, self.peek_span().start);
        Error::Parse(ParseError::expected(
            format!("unexpected token {}", self.peek()),
            expected.to_string(),
            line,
            col,
        ))
    }

    // ========== Expression parsing ==========

    pub fn parse_expr(&mut self) -> Result<Expr, Error> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, Error> {
        let expr = self.parse_logical_or()?;

        if self.eat(&TokenKind::Question) {
            let then_expr = self.parse_expr()?;
            self.expect(&TokenKind::Colon)?;
            let else_expr = self.parse_expr()?;
            Ok(Expr {
                span: expr.span.merge(else_expr.span),
                kind: ExprKind::Ternary {
                    cond: Box::new(expr),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
            })
        } else {
            Ok(expr)
        }
    }

    /// Helper: parse left-associative binary operators.
    /// Calls `next_fn` for operands, `map_op` to convert the current
    /// token to a BinOp.
    fn parse_binary_op(
        &mut self,
        mut next_fn: impl FnMut(&mut Self) -> Result<Expr, Error>,
        map_op: impl Fn(&TokenKind) -> Option<BinOp>,
    ) -> Result<Expr, Error> {
        let mut lhs = next_fn(self)?;
        while let Some(op) = map_op(self.peek()) {
            self.advance();
            let rhs = next_fn(self)?;
            lhs = Expr {
                span: lhs.span.merge(rhs.span),
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }
        Ok(lhs)
    }

    fn parse_logical_or(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_logical_and, |tok| match tok {
            TokenKind::PipePipe => Some(BinOp::LogOr),
            _ => None,
        })
    }

    fn parse_logical_and(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_bitwise_or, |tok| match tok {
            TokenKind::AmpAmp => Some(BinOp::LogAnd),
            _ => None,
        })
    }

    fn parse_bitwise_or(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_bitwise_xor, |tok| match tok {
            TokenKind::Pipe => Some(BinOp::BitOr),
            _ => None,
        })
    }

    fn parse_bitwise_xor(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_bitwise_and, |tok| match tok {
            TokenKind::Caret => Some(BinOp::BitXor),
            _ => None,
        })
    }

    fn parse_bitwise_and(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_equality, |tok| match tok {
            TokenKind::Ampersand => Some(BinOp::BitAnd),
            _ => None,
        })
    }

    fn parse_equality(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_comparison, |tok| match tok {
            TokenKind::EqEq => Some(BinOp::Eq),
            TokenKind::BangEq => Some(BinOp::Ne),
            _ => None,
        })
    }

    fn parse_comparison(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_shift, |tok| match tok {
            TokenKind::Less => Some(BinOp::Lt),
            TokenKind::LessEq => Some(BinOp::Le),
            TokenKind::Greater => Some(BinOp::Gt),
            TokenKind::GreaterEq => Some(BinOp::Ge),
            _ => None,
        })
    }

    fn parse_shift(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_additive, |tok| match tok {
            TokenKind::LShift => Some(BinOp::Shl),
            TokenKind::RShift => Some(BinOp::Shr),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_multiplicative, |tok| match tok {
            TokenKind::Plus => Some(BinOp::Add),
            TokenKind::Minus => Some(BinOp::Sub),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, Error> {
        self.parse_binary_op(Self::parse_unary, |tok| match tok {
            TokenKind::Star => Some(BinOp::Mul),
            TokenKind::Slash => Some(BinOp::Div),
            TokenKind::Percent => Some(BinOp::Mod),
            _ => None,
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        let start = self.peek_span();
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Plus => {
                // Unary plus is a no-op
                self.advance();
                return self.parse_unary();
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let expr = self.parse_unary()?;
                Ok(Expr {
                    span: start.merge(expr.span),
                    kind: ExprKind::Unary {
                        op,
                        expr: Box::new(expr),
                    },
                })
            }
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        let span = self.peek_span();
        match self.peek().clone() {
            TokenKind::IntLiteral(val) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::IntLiteral(val),
                    span,
                })
            }
            TokenKind::CharLiteral(val) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::CharLiteral(val),
                    span,
                })
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::ColonColon) {
                    let (member, end) = self.expect_ident()?;
                    Ok(Expr {
                        kind: ExprKind::ScopedIdent(name, member),
                        span: span.merge(end),
                    })
                } else {
                    Ok(Expr {
                        kind: ExprKind::Ident(name),
                        span,
                    })
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            _ => Err(self.expected("expression")),
        }
    }
}

/// Where a struct/union production appears, which decides who owns the
/// trailing names and registration
#[derive(Clone, Copy, PartialEq)]
enum StructCtx {
    /// `struct X { ... } Y;` at the top level: register every name
    TopLevel,
    /// `typedef struct X { ... } alias;`: register the tag name; the
    /// typedef owns the declarators
    Typedef,
    /// Inline field type: register nothing
    Member,
}

pub(crate) struct Parser<'a> {
    ts: TokenStream<'a>,
    reg: &'a mut TypeRegistry,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, tokens: Vec<Token>, reg: &'a mut TypeRegistry) -> Self {
        Self {
            ts: TokenStream::new(source, tokens),
            reg,
        }
    }

    /// Parse every declaration, applying each to the registry
    pub fn parse(mut self) -> Result<(), Error> {
        while !self.ts.at_eof() {
            if self.ts.eat(&TokenKind::Semicolon) {
                continue;
            }
            match self.ts.peek().clone() {
                TokenKind::Define { name, body } => {
                    self.ts.advance();
                    self.handle_define(name, body)?;
                }
                TokenKind::KwTypedef => self.parse_typedef()?,
                TokenKind::KwStruct | TokenKind::KwUnion => {
                    self.parse_struct_or_union(StructCtx::TopLevel)?;
                }
                TokenKind::KwEnum => self.parse_enum(false)?,
                TokenKind::KwFlag => self.parse_enum(true)?,
                _ => return Err(self.ts.expected("declaration")),
            }
        }
        Ok(())
    }

    // ========== Preprocessor constants ==========

    /// `#define NAME BODY`: a string literal becomes a string
    /// constant; a type expression becomes a typedef (the one place a
    /// bare `[]` suffix is legal); anything else must evaluate to an
    /// integer constant.
    fn handle_define(&mut self, name: String, mut body: Vec<Token>) -> Result<(), Error> {
        // Tolerate C headers that end the value with a semicolon
        while matches!(body.last().map(|t| &t.kind), Some(TokenKind::Semicolon)) {
            body.pop();
        }
        if body.is_empty() {
            return Err(self.ts.err(
                self.ts.peek_span(),
                format!("#define {} has no value", name),
            ));
        }

        if body.len() == 1 {
            if let TokenKind::StringLiteral(s) = &body[0].kind {
                self.reg.add_constant(&name, ConstValue::Str(s.clone()));
                return Ok(());
            }
        }

        // A body that starts with a known type name is a type alias
        if let TokenKind::Ident(first) = &body[0].kind {
            if self.reg.contains_type(first) {
                let mut sub = Parser {
                    ts: TokenStream::new(self.ts.source, with_eof(body.clone())),
                    reg: &mut *self.reg,
                };
                if let Ok(ty) = sub.parse_define_type() {
                    self.reg.add_named_type(&name, ty)?;
                    debug!(name = name.as_str(), "registered #define type alias");
                    return Ok(());
                }
            }
        }

        let mut ts = TokenStream::new(self.ts.source, with_eof(body));
        let expr = ts.parse_expr()?;
        if !ts.at_eof() {
            return Err(ts.expected("end of #define value"));
        }
        let value = eval::eval(&expr, &Scope::new(self.reg))?;
        self.reg.add_constant(&name, ConstValue::Int(value));
        debug!(name = name.as_str(), value = %value, "registered constant");
        Ok(())
    }

    /// The type-expression form of a `#define` body: a (multiword)
    /// type name with optional `*` and array suffixes, consuming the
    /// whole body.
    fn parse_define_type(&mut self) -> Result<TypeRef, Error> {
        let base = self.parse_type_specifier(StructCtx::Member)?;
        let mut ty = if self.ts.eat(&TokenKind::Star) {
            pointer_to(self.reg, base)
        } else {
            base
        };
        ty = self.parse_array_suffixes(ty, true)?;
        if !self.ts.at_eof() {
            return Err(self.ts.expected("end of #define value"));
        }
        if matches!(ty.kind, TypeKind::Forward { .. }) {
            return Err(Error::UnknownType(ty.name.clone()));
        }
        Ok(ty)
    }

    // ========== typedef ==========

    fn parse_typedef(&mut self) -> Result<(), Error> {
        self.ts.expect(&TokenKind::KwTypedef)?;
        let base = self.parse_type_specifier(StructCtx::Typedef)?;

        loop {
            let (name, ty) = self.parse_declarator(base.clone(), true)?;
            self.reg.add_named_type(&name, ty)?;
            debug!(name = name.as_str(), "registered typedef");
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.ts.expect(&TokenKind::Semicolon)?;
        Ok(())
    }

    // ========== Type specifiers ==========

    /// A type use: `struct`/`union` (definition or reference), an
    /// `enum`/`flag` reference, or a possibly multiword type name.
    fn parse_type_specifier(&mut self, ctx: StructCtx) -> Result<TypeRef, Error> {
        match self.ts.peek() {
            TokenKind::KwStruct | TokenKind::KwUnion => self.parse_struct_or_union(ctx),
            TokenKind::KwEnum | TokenKind::KwFlag => {
                // Only references are valid here: `enum Color value;`
                self.ts.advance();
                let (name, span) = self.ts.expect_ident()?;
                if self.ts.check(&TokenKind::LBrace) {
                    return Err(self
                        .ts
                        .err(span, "enum definitions are only allowed at the top level"));
                }
                self.reg.resolve(&name)
            }
            TokenKind::Ident(_) => self.parse_named_type(),
            _ => Err(self.ts.expected("type name")),
        }
    }

    /// Resolve a (possibly multiword) type name like
    /// `unsigned long long`, greedily extending while the longer name
    /// is known.
    fn parse_named_type(&mut self) -> Result<TypeRef, Error> {
        let (first, span) = self.ts.expect_ident()?;
        let mut joined = first.clone();
        while let TokenKind::Ident(next) = self.ts.peek() {
            let longer = format!("{} {}", joined, next);
            if self.reg.contains_type(&longer) {
                joined = longer;
                self.ts.advance();
            } else {
                break;
            }
        }

        if self.reg.contains_type(&joined) {
            return self.reg.resolve(&joined);
        }

        // `signed`/`unsigned` prefix on an integer type name
        if matches!(first.as_str(), "signed" | "unsigned") {
            if let TokenKind::Ident(base_name) = self.ts.peek().clone() {
                if let Ok(base) = self.reg.resolve(&base_name) {
                    if let TypeKind::Int { bits, .. } = &base.kind {
                        self.ts.advance();
                        let signed = first == "signed";
                        return Ok(Type::int(
                            format!("{} {}", first, base_name),
                            *bits,
                            signed,
                            base.alignment,
                        ));
                    }
                }
            }
        }

        let (line, col) = offset_to_line_col(self.ts.source, span.start);
        Err(Error::UnknownType(format!(
            "`{}` at {}:{}",
            joined, line, col
        )))
    }

    // ========== struct / union ==========

    fn parse_struct_or_union(&mut self, ctx: StructCtx) -> Result<TypeRef, Error> {
        let kw = self.ts.advance();
        let is_union = matches!(kw.kind, TokenKind::KwUnion);
        self.skip_attrs();

        let mut names: Vec<String> = Vec::new();
        if let TokenKind::Ident(_) = self.ts.peek() {
            names.push(self.ts.expect_ident()?.0);
        }
        self.skip_attrs();

        if !self.ts.check(&TokenKind::LBrace) {
            // No body: a forward declaration or a type reference
            let name = match names.first() {
                Some(name) => name.clone(),
                None => return Err(self.ts.expected("'{' or name")),
            };
            if self.reg.contains_type(&name) {
                return self.reg.resolve(&name);
            }
            let fwd = Type::forward(&name, is_union);
            if ctx == StructCtx::TopLevel && self.ts.check(&TokenKind::Semicolon) {
                self.reg.add_named_type(&name, fwd.clone())?;
                debug!(name = name.as_str(), "registered forward declaration");
            }
            return Ok(fwd);
        }

        self.ts.expect(&TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.ts.check(&TokenKind::RBrace) {
            if self.ts.eat(&TokenKind::Semicolon) {
                continue;
            }
            self.parse_field_into(&mut fields)?;
        }
        self.ts.expect(&TokenKind::RBrace)?;
        self.skip_attrs();

        if ctx == StructCtx::TopLevel {
            while let TokenKind::Ident(_) = self.ts.peek() {
                names.push(self.ts.expect_ident()?.0);
                if !self.ts.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let (name, anonymous) = match names.first() {
            Some(name) => (name.clone(), false),
            None => (self.reg.anonymous_name(), true),
        };
        if ctx == StructCtx::TopLevel && anonymous {
            return Err(self.ts.err(kw.span, "struct has no name"));
        }

        let ty = Type::structure(name, fields, is_union, anonymous)?;
        if ctx != StructCtx::Member {
            for n in &names {
                self.reg.add_named_type(n, ty.clone())?;
                debug!(name = n.as_str(), union = is_union, "registered structure");
            }
        }
        Ok(ty)
    }

    /// One field declaration, possibly with several comma-separated
    /// declarators, appended to `fields`
    fn parse_field_into(&mut self, fields: &mut Vec<Field>) -> Result<(), Error> {
        self.skip_attrs();
        let base = self.parse_type_specifier(StructCtx::Member)?;

        // Inline struct/union without a declarator: anonymous members
        // promote their fields, named ones sit under their type name
        if self.ts.check(&TokenKind::Semicolon) {
            if let Some(st) = base.as_struct() {
                let field = if st.anonymous {
                    Field::anonymous(base.clone())
                } else {
                    Field::new(base.name.clone(), base.clone())
                };
                fields.push(field);
                self.ts.expect(&TokenKind::Semicolon)?;
                return Ok(());
            }
            return Err(self.ts.expected("field name"));
        }

        loop {
            let (name, ty) = self.parse_declarator(base.clone(), false)?;
            let bits = if self.ts.eat(&TokenKind::Colon) {
                let span = self.ts.peek_span();
                let expr = self.ts.parse_expr()?;
                let value = eval::eval(&expr, &Scope::new(self.reg))?;
                if !(1..=64).contains(&value) {
                    return Err(self
                        .ts
                        .err(span, format!("bitfield width {} is out of range", value)));
                }
                Some(value as u32)
            } else {
                None
            };
            fields.push(Field {
                name: Some(name),
                ty,
                bits,
                offset: None,
            });
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.skip_attrs();
        self.ts.expect(&TokenKind::Semicolon)?;
        Ok(())
    }

    /// `'*'? NAME ('[' ... ']')*` over a base type
    fn parse_declarator(
        &mut self,
        base: TypeRef,
        allow_empty_brackets: bool,
    ) -> Result<(String, TypeRef), Error> {
        let is_pointer = self.ts.eat(&TokenKind::Star);
        let (name, _) = self.ts.expect_ident()?;

        let mut ty = if is_pointer {
            pointer_to(self.reg, base)
        } else {
            base
        };
        ty = self.parse_array_suffixes(ty, allow_empty_brackets)?;

        if matches!(ty.kind, TypeKind::Forward { .. }) {
            return Err(Error::UnknownType(format!(
                "`{}` used by value before its definition (field `{}`)",
                ty.name, name
            )));
        }
        Ok((name, ty))
    }

    /// Array suffixes, outermost first in the source: `x[2][3]` is two
    /// arrays of three elements
    fn parse_array_suffixes(
        &mut self,
        base: TypeRef,
        allow_empty_brackets: bool,
    ) -> Result<TypeRef, Error> {
        let mut lens: Vec<ArrayLen> = Vec::new();
        while self.ts.eat(&TokenKind::LBracket) {
            let span = self.ts.peek_span();
            if self.ts.check(&TokenKind::RBracket) {
                if !allow_empty_brackets {
                    return Err(self
                        .ts
                        .err(span, "an array needs a length here; use [NULL] for sentinel-terminated"));
                }
                lens.push(ArrayLen::Sentinel);
            } else if matches!(self.ts.peek(), TokenKind::Ident(n) if n == "NULL" || n == "none")
                && matches!(self.ts.peek_ahead(1), TokenKind::RBracket)
            {
                self.ts.advance();
                lens.push(ArrayLen::Sentinel);
            } else {
                let expr = self.ts.parse_expr()?;
                // Constant lengths fold now; anything referencing
                // sibling fields is evaluated at read time
                match eval::eval(&expr, &Scope::new(self.reg)) {
                    Ok(n) if n < 0 => {
                        return Err(self.ts.err(span, format!("negative array length {}", n)));
                    }
                    Ok(n) => lens.push(ArrayLen::Fixed(n as u64)),
                    Err(_) => lens.push(ArrayLen::Expr(expr)),
                }
            }
            self.ts.expect(&TokenKind::RBracket)?;
        }

        if lens.len() > 1 && lens.iter().any(|l| matches!(l, ArrayLen::Sentinel)) {
            return Err(self.ts.err(
                self.ts.peek_span(),
                "sentinel arrays cannot be multi-dimensional",
            ));
        }

        let mut ty = base;
        for len in lens.into_iter().rev() {
            ty = Type::array(ty, len)?;
        }
        Ok(ty)
    }

    // ========== enum / flag ==========

    fn parse_enum(&mut self, is_flag: bool) -> Result<(), Error> {
        self.ts.advance();
        self.skip_attrs();

        let mut names: Vec<String> = Vec::new();
        if let TokenKind::Ident(_) = self.ts.peek() {
            names.push(self.ts.expect_ident()?.0);
        }

        let base = if self.ts.eat(&TokenKind::Colon) {
            self.parse_named_type()?
        } else {
            self.reg.resolve("uint32")?
        };

        self.ts.expect(&TokenKind::LBrace)?;
        let mut members: Vec<(String, i128)> = Vec::new();
        let mut locals: FxHashMap<String, i128> = FxHashMap::default();
        let mut next_value: i128 = if is_flag { 1 } else { 0 };

        while !self.ts.check(&TokenKind::RBrace) {
            let (member, _) = self.ts.expect_ident()?;
            let value = if self.ts.eat(&TokenKind::Eq) {
                let expr = self.ts.parse_expr()?;
                eval::eval(&expr, &Scope::with_locals(self.reg, &locals))?
            } else {
                next_value
            };

            next_value = if is_flag && value > 0 {
                // Continue at the next power of two above the high bit
                1i128
                    .checked_shl(128 - value.leading_zeros())
                    .unwrap_or(value + 1)
            } else if is_flag && value == 0 {
                1
            } else {
                value + 1
            };

            locals.insert(member.clone(), value);
            members.push((member, value));
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.ts.expect(&TokenKind::RBrace)?;

        while let TokenKind::Ident(_) = self.ts.peek() {
            names.push(self.ts.expect_ident()?.0);
            if !self.ts.eat(&TokenKind::Comma) {
                break;
            }
        }

        if names.is_empty() {
            // Anonymous enums contribute their members as constants
            for (member, value) in &members {
                self.reg.add_constant(member, ConstValue::Int(*value));
            }
            debug!(members = members.len(), "registered anonymous enum constants");
            return Ok(());
        }

        let ty = Type::enumeration(names[0].clone(), base, members, is_flag)?;
        for n in &names {
            self.reg.add_named_type(n, ty.clone())?;
        }
        self.reg.register_enum_members(&ty);
        debug!(name = names[0].as_str(), flag = is_flag, "registered enum");
        Ok(())
    }

    // ========== attribute tolerance ==========

    /// Skip `__attribute__((...))` and `__packed__` markers
    fn skip_attrs(&mut self) {
        loop {
            match self.ts.peek() {
                TokenKind::Ident(name) if name == "__attribute__" => {
                    self.ts.advance();
                    if self.ts.eat(&TokenKind::LParen) {
                        let mut depth = 1;
                        while depth > 0 && !self.ts.at_eof() {
                            match self.ts.advance().kind {
                                TokenKind::LParen => depth += 1,
                                TokenKind::RParen => depth -= 1,
                                _ => {}
                            }
                        }
                    }
                    tracing::warn!("ignoring __attribute__ annotation");
                }
                TokenKind::Ident(name) if name == "__packed__" || name == "__packed" => {
                    self.ts.advance();
                    tracing::warn!("ignoring __packed__ annotation");
                }
                _ => return,
            }
        }
    }
}

fn pointer_to(reg: &TypeRegistry, base: TypeRef) -> TypeRef {
    let target = match &base.kind {
        // Pointers to not-yet-defined structures resolve by name at
        // dereference time
        TypeKind::Forward { .. } => PtrTarget::Named(base.name.clone()),
        _ => PtrTarget::Resolved(base),
    };
    Type::pointer(target, reg.pointer_size())
}

fn with_eof(mut tokens: Vec<Token>) -> Vec<Token> {
    let span = tokens.last().map(|t| t.span).unwrap_or_else(Span::dummy);
    tokens.push(Token::new(TokenKind::Eof, span));
    tokens
}
