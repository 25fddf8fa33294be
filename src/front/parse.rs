//! The parser: tokens to a typed AST.
//!
//! Recursive descent for declarations and statements; precedence climbing
//! for expressions, following the C grammar's precedence ladder from spec
//! §4.2: assignment < ternary < logical-or < logical-and < bitwise-or <
//! bitwise-xor < bitwise-and < equality < relational < shift < additive <
//! multiplicative < cast < unary < postfix < primary.
//!
//! Types are resolved to their canonical interned form as they're parsed, and
//! implicit conversions (including pointer-arithmetic scaling and compound-
//! assignment desugaring) are inserted here rather than in a later pass, to
//! match the original `xcc` parser's single-pass declarator-and-expression
//! typing.

use derive_more::Display;
use std::fmt::Debug;

use crate::common::{intern, Id, Map, Span};
use crate::front::ast::*;
use crate::front::lex::{Lexer, Literal, Token, TokenKind};
use crate::front::types::*;

#[derive(Display)]
#[display("Parse error: {}", self.0)]
pub struct ParseError(pub String);

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Parse one translation unit for the given target pointer size (8 on
/// x86-64, 4 on WebAssembly32).
pub fn parse(input: &str, ptr_size: u8) -> Result<(Program, TypeTable), ParseError> {
    let tokens = Lexer::new(input)
        .tokenize()
        .map_err(|e| ParseError(e.to_string()))?;
    let mut p = Parser::new(tokens, ptr_size);
    p.parse_translation_unit()?;
    Ok((
        Program {
            functions: p.functions,
            globals: p.globals,
            string_literals: p.string_literals,
            scopes: p.scopes,
        },
        p.types,
    ))
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    types: TypeTable,
    scopes: Scopes,
    cur_scope: ScopeId,
    typedefs: Map<Id, Ty>,
    functions: Vec<FunctionDecl>,
    globals: Vec<GlobalDecl>,
    string_literals: Vec<(Id, Vec<u8>)>,
    label_counter: u32,
    /// Tracks whether we're directly inside a loop/switch, for break/continue
    /// validation.
    loop_depth: u32,
    switch_depth: u32,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    fn new(toks: Vec<Token>, ptr_size: u8) -> Parser {
        Parser {
            toks,
            pos: 0,
            types: TypeTable::new(ptr_size),
            scopes: Scopes::new(),
            cur_scope: 0,
            typedefs: Map::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            string_literals: Vec::new(),
            label_counter: 0,
            loop_depth: 0,
            switch_depth: 0,
        }
    }

    fn fresh_label(&mut self, prefix: &str) -> Id {
        self.label_counter += 1;
        intern(format!(".L{}{}", prefix, self.label_counter))
    }

    fn cur(&self) -> &Token {
        &self.toks[self.pos]
    }

    fn kind(&self) -> TokenKind {
        self.toks[self.pos].kind
    }

    fn at(&self, k: TokenKind) -> bool {
        self.kind() == k
    }

    fn advance(&mut self) -> Token {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, k: TokenKind) -> PResult<Token> {
        if self.at(k) {
            Ok(self.advance())
        } else {
            Err(self.err(&format!("expected {:?}, found {:?} ('{}')", k, self.kind(), self.cur().text)))
        }
    }

    fn eat(&mut self, k: TokenKind) -> bool {
        if self.at(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn err(&self, msg: &str) -> ParseError {
        ParseError(format!("{} at {}", msg, self.cur().span.start))
    }

    fn span(&self) -> Span {
        self.cur().span
    }

    // ---- translation unit ----

    fn parse_translation_unit(&mut self) -> PResult<()> {
        while !self.at(TokenKind::Eof) {
            self.parse_external_decl()?;
        }
        Ok(())
    }

    fn is_type_start(&self) -> bool {
        use TokenKind::*;
        match self.kind() {
            KwInt | KwChar | KwShort | KwLong | KwVoid | KwFloat | KwDouble | KwUnsigned
            | KwSigned | KwStruct | KwUnion | KwEnum | KwConst | KwVolatile => true,
            Id => {
                if let Literal::Name(n) = &self.cur().literal {
                    self.typedefs.contains_key(n)
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Parse a base type (before declarators): specifiers, qualifiers, and
    /// struct/union/enum bodies.
    fn parse_decl_specifiers(&mut self) -> PResult<(Ty, bool, bool)> {
        let mut is_static = false;
        let mut is_extern = false;
        let mut is_typedef = false;
        let mut unsigned = false;
        let mut signed = false;
        let mut long_count = 0;
        let mut seen_short = false;
        let mut base: Option<Ty> = None;
        let mut quals: u8 = 0;

        loop {
            match self.kind() {
                TokenKind::KwStatic => {
                    is_static = true;
                    self.advance();
                }
                TokenKind::KwExtern => {
                    is_extern = true;
                    self.advance();
                }
                TokenKind::KwTypedef => {
                    is_typedef = true;
                    self.advance();
                }
                TokenKind::KwConst => {
                    quals |= QUAL_CONST;
                    self.advance();
                }
                TokenKind::KwVolatile => {
                    quals |= QUAL_VOLATILE;
                    self.advance();
                }
                TokenKind::KwUnsigned => {
                    unsigned = true;
                    self.advance();
                }
                TokenKind::KwSigned => {
                    signed = true;
                    self.advance();
                }
                TokenKind::KwShort => {
                    seen_short = true;
                    self.advance();
                }
                TokenKind::KwLong => {
                    long_count += 1;
                    self.advance();
                }
                TokenKind::KwVoid => {
                    base = Some(TypeTable::void());
                    self.advance();
                }
                TokenKind::KwChar => {
                    base = Some(TypeTable::fixnum(1, true));
                    self.advance();
                }
                TokenKind::KwFloat => {
                    base = Some(TypeTable::flonum(4));
                    self.advance();
                }
                TokenKind::KwDouble => {
                    base = Some(TypeTable::flonum(8));
                    self.advance();
                }
                TokenKind::KwInt => {
                    self.advance();
                    if base.is_none() {
                        base = Some(TypeTable::fixnum(4, true));
                    }
                }
                TokenKind::KwStruct | TokenKind::KwUnion => {
                    base = Some(self.parse_struct_or_union()?);
                }
                TokenKind::KwEnum => {
                    base = Some(self.parse_enum()?);
                }
                TokenKind::Id => {
                    if base.is_none() && !unsigned && !signed && long_count == 0 && !seen_short {
                        if let Literal::Name(n) = &self.cur().literal {
                            if let Some(&ty) = self.typedefs.get(n) {
                                base = Some(ty);
                                self.advance();
                                continue;
                            }
                        }
                    }
                    break;
                }
                _ => break,
            }
        }

        if unsigned || signed || long_count > 0 || seen_short {
            let size = if seen_short {
                2
            } else if long_count > 0 {
                8
            } else {
                4
            };
            base = Some(TypeTable::fixnum(size, !unsigned));
        }

        let base = base.ok_or_else(|| self.err("expected a type"))?;
        Ok((TypeTable::qualified(base, quals), is_static && !is_extern, is_typedef))
    }

    fn parse_struct_or_union(&mut self) -> PResult<Ty> {
        let is_union = self.at(TokenKind::KwUnion);
        self.advance();
        let tag = if self.at(TokenKind::Id) {
            let name = self.ident()?;
            Some(name)
        } else {
            None
        };
        let scope_id = self.cur_scope;
        if self.eat(TokenKind::LBrace) {
            let idx = self.types.declare_struct(tag, scope_id, is_union);
            let mut fields = Vec::new();
            while !self.at(TokenKind::RBrace) {
                let (base_ty, _, _) = self.parse_decl_specifiers()?;
                loop {
                    let (name, ty) = self.parse_declarator(base_ty)?;
                    let bitfield = if self.eat(TokenKind::Colon) {
                        let w = self.parse_const_int_expr()?;
                        Some(BitField { width: w as u8, bit_offset: 0 })
                    } else {
                        None
                    };
                    fields.push(Field { name, ty, offset: 0, bitfield });
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::Semi)?;
            }
            self.expect(TokenKind::RBrace)?;
            self.types.define_struct(idx, fields, is_union);
            Ok(TypeTable::struct_ty(idx))
        } else {
            let idx = self.types.declare_struct(tag, scope_id, is_union);
            Ok(TypeTable::struct_ty(idx))
        }
    }

    fn parse_enum(&mut self) -> PResult<Ty> {
        self.advance(); // `enum`
        if self.at(TokenKind::Id) {
            self.advance();
        }
        if self.eat(TokenKind::LBrace) {
            let mut next_value = 0i64;
            while !self.at(TokenKind::RBrace) {
                let name = self.ident()?;
                if self.eat(TokenKind::Assign) {
                    next_value = self.parse_const_int_expr()?;
                }
                self.scopes.declare(
                    self.cur_scope,
                    VarInfo {
                        name,
                        ty: TypeTable::fixnum(4, true),
                        storage: StorageClass::EnumMember,
                        payload: VarPayload::EnumConst(next_value),
                        span: self.span(),
                    },
                );
                next_value += 1;
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
        }
        Ok(TypeTable::fixnum(4, true))
    }

    fn parse_const_int_expr(&mut self) -> PResult<i64> {
        let e = self.parse_expr()?;
        const_eval(&e).ok_or_else(|| self.err("expected a constant expression"))
    }

    fn ident(&mut self) -> PResult<Id> {
        let t = self.expect(TokenKind::Id)?;
        match t.literal {
            Literal::Name(n) => Ok(n),
            _ => unreachable!(),
        }
    }

    /// Parse one declarator (`*name[10]` etc.) given the base type, applying
    /// pointer/array wrapping outside-in the way C declarators read.
    fn parse_declarator(&mut self, mut base: Ty) -> PResult<(Id, Ty)> {
        let mut stars = 0u32;
        while self.eat(TokenKind::Star) {
            stars += 1;
            while self.eat(TokenKind::KwConst) || self.eat(TokenKind::KwVolatile) {}
        }
        for _ in 0..stars {
            base = TypeTable::pointer(base);
        }
        let name = if self.at(TokenKind::Id) { self.ident()? } else { intern("") };
        let ty = self.parse_declarator_suffix(base)?;
        Ok((name, ty))
    }

    fn parse_declarator_suffix(&mut self, base: Ty) -> PResult<Ty> {
        if self.eat(TokenKind::LBracket) {
            let count = if self.at(TokenKind::RBracket) {
                None
            } else {
                Some(self.parse_const_int_expr()? as usize)
            };
            self.expect(TokenKind::RBracket)?;
            let inner = self.parse_declarator_suffix(base)?;
            return Ok(TypeTable::array(inner, count));
        }
        if self.eat(TokenKind::LParen) {
            let mut params = Vec::new();
            let mut vaargs = false;
            if !self.at(TokenKind::RParen) {
                loop {
                    if self.eat(TokenKind::Ellipsis) {
                        vaargs = true;
                        break;
                    }
                    let (pty, _, _) = self.parse_decl_specifiers()?;
                    let (_, full) = self.parse_declarator(pty)?;
                    params.push(decay(full));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
            return Ok(TypeTable::function(base, params, vaargs));
        }
        Ok(base)
    }

    // ---- external (top-level) declarations ----

    fn parse_external_decl(&mut self) -> PResult<()> {
        let (base_ty, is_static, is_typedef) = self.parse_decl_specifiers()?;
        if self.eat(TokenKind::Semi) {
            return Ok(()); // a bare struct/union/enum declaration
        }
        let span = self.span();
        let (name, ty) = self.parse_declarator(base_ty)?;

        if is_typedef {
            self.typedefs.insert(name, ty);
            self.expect(TokenKind::Semi)?;
            return Ok(());
        }

        if matches!(&*ty, TypeKind::Function { .. }) {
            self.parse_function(name, ty, is_static, span)?;
            return Ok(());
        }

        let mut globals = vec![self.parse_global_tail(name, ty, is_static)?];
        while self.eat(TokenKind::Comma) {
            let (name, ty) = self.parse_declarator(base_ty)?;
            globals.push(self.parse_global_tail(name, ty, is_static)?);
        }
        self.expect(TokenKind::Semi)?;
        self.globals.extend(globals);
        Ok(())
    }

    fn parse_global_tail(&mut self, name: Id, ty: Ty, is_static: bool) -> PResult<GlobalDecl> {
        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_initializer(ty)?)
        } else {
            None
        };
        self.scopes.declare(
            self.scopes.global(),
            VarInfo {
                name,
                ty,
                storage: if is_static { StorageClass::Static } else { StorageClass::Extern },
                payload: VarPayload::Global { init: None, exported: !is_static },
                span: self.span(),
            },
        );
        Ok(GlobalDecl { name, ty, init, is_static, is_extern: false })
    }

    fn parse_function(&mut self, name: Id, ty: Ty, is_static: bool, span: Span) -> PResult<()> {
        let (ret, param_tys, vaargs) = match &*ty {
            TypeKind::Function { ret, params, vaargs } => (*ret, params.clone(), *vaargs),
            _ => unreachable!(),
        };
        let fn_scope = self.scopes.push(Some(self.scopes.global()));
        self.scopes.declare(
            self.scopes.global(),
            VarInfo {
                name,
                ty,
                storage: if is_static { StorageClass::Static } else { StorageClass::Extern },
                payload: VarPayload::Global { init: None, exported: !is_static },
                span,
            },
        );

        let params: Vec<Param> = param_tys
            .iter()
            .enumerate()
            .map(|(i, &t)| Param { name: intern(format!("__arg{i}")), ty: t })
            .collect();

        let body = if self.eat(TokenKind::Semi) {
            None
        } else {
            for p in &params {
                self.scopes.declare(
                    fn_scope,
                    VarInfo {
                        name: p.name,
                        ty: p.ty,
                        storage: StorageClass::Parameter,
                        payload: VarPayload::Local { index: 0 },
                        span,
                    },
                );
            }
            Some(self.parse_block(fn_scope)?)
        };

        self.functions.push(FunctionDecl {
            name,
            ty: TypeTable::function(ret, param_tys, vaargs),
            params,
            body,
            is_static,
            scope: fn_scope,
            span,
        });
        Ok(())
    }

    // ---- statements ----

    fn parse_block(&mut self, scope: ScopeId) -> PResult<Stmt> {
        self.expect(TokenKind::LBrace)?;
        let prev = self.cur_scope;
        self.cur_scope = scope;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        self.cur_scope = prev;
        Ok(Stmt::Block(scope, stmts))
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        use TokenKind::*;
        match self.kind() {
            LBrace => {
                let child = self.scopes.push(Some(self.cur_scope));
                self.parse_block(child)
            }
            KwIf => {
                self.advance();
                self.expect(LParen)?;
                let cond = self.parse_expr()?;
                self.expect(RParen)?;
                let tt = Box::new(self.parse_stmt()?);
                let ff = if self.eat(KwElse) { Some(Box::new(self.parse_stmt()?)) } else { None };
                Ok(Stmt::If { cond, tt, ff })
            }
            KwWhile => {
                self.advance();
                self.expect(LParen)?;
                let cond = self.parse_expr()?;
                self.expect(RParen)?;
                self.loop_depth += 1;
                let body = Box::new(self.parse_stmt()?);
                self.loop_depth -= 1;
                Ok(Stmt::While { cond, body })
            }
            KwDo => {
                self.advance();
                self.loop_depth += 1;
                let body = Box::new(self.parse_stmt()?);
                self.loop_depth -= 1;
                self.expect(KwWhile)?;
                self.expect(LParen)?;
                let cond = self.parse_expr()?;
                self.expect(RParen)?;
                self.expect(Semi)?;
                Ok(Stmt::DoWhile { body, cond })
            }
            KwFor => {
                self.advance();
                self.expect(LParen)?;
                let child = self.scopes.push(Some(self.cur_scope));
                let prev = self.cur_scope;
                self.cur_scope = child;
                let init = if self.at(Semi) {
                    self.advance();
                    None
                } else if self.is_type_start() {
                    Some(Box::new(self.parse_decl_stmt()?))
                } else {
                    let e = self.parse_expr()?;
                    self.expect(Semi)?;
                    Some(Box::new(Stmt::Expr(e)))
                };
                let cond = if self.at(Semi) { None } else { Some(self.parse_expr()?) };
                self.expect(Semi)?;
                let step = if self.at(RParen) { None } else { Some(self.parse_expr()?) };
                self.expect(RParen)?;
                self.loop_depth += 1;
                let body = Box::new(self.parse_stmt()?);
                self.loop_depth -= 1;
                self.cur_scope = prev;
                Ok(Stmt::For { init, cond, step, body })
            }
            KwBreak => {
                self.advance();
                self.expect(Semi)?;
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    return Err(self.err("break outside loop or switch"));
                }
                Ok(Stmt::Break)
            }
            KwContinue => {
                self.advance();
                self.expect(Semi)?;
                if self.loop_depth == 0 {
                    return Err(self.err("continue outside loop"));
                }
                Ok(Stmt::Continue)
            }
            KwReturn => {
                self.advance();
                let e = if self.at(Semi) { None } else { Some(self.parse_expr()?) };
                self.expect(Semi)?;
                Ok(Stmt::Return(e))
            }
            KwGoto => {
                self.advance();
                let name = self.ident()?;
                self.expect(Semi)?;
                Ok(Stmt::Goto(name))
            }
            KwSwitch => {
                self.advance();
                self.expect(LParen)?;
                let value = self.parse_expr()?;
                self.expect(RParen)?;
                self.switch_depth += 1;
                let mut cases = Vec::new();
                let body = Box::new(self.parse_switch_body(&mut cases)?);
                self.switch_depth -= 1;
                Ok(Stmt::Switch { value, body, cases })
            }
            KwCase => {
                self.advance();
                let v = self.parse_const_int_expr()?;
                self.expect(Colon)?;
                if self.switch_depth == 0 {
                    return Err(self.err("case outside switch"));
                }
                let label = self.fresh_label("case");
                Ok(Stmt::Case(v, label))
            }
            KwDefault => {
                self.advance();
                self.expect(Colon)?;
                if self.switch_depth == 0 {
                    return Err(self.err("default outside switch"));
                }
                let label = self.fresh_label("default");
                Ok(Stmt::Default(label))
            }
            KwAsm => {
                self.advance();
                self.expect(LParen)?;
                let t = self.expect(StrLit)?;
                let text = match t.literal {
                    Literal::Str(bytes) => {
                        String::from_utf8_lossy(&bytes[..bytes.len().saturating_sub(1)]).to_string()
                    }
                    _ => unreachable!(),
                };
                self.expect(RParen)?;
                self.expect(Semi)?;
                Ok(Stmt::Asm(text))
            }
            Semi => {
                self.advance();
                Ok(Stmt::Empty)
            }
            Id if self.peek_is_label() => {
                let name = self.ident()?;
                self.expect(Colon)?;
                let inner = Box::new(self.parse_stmt()?);
                Ok(Stmt::Label(name, inner))
            }
            _ if self.is_type_start() => self.parse_decl_stmt(),
            _ => {
                let e = self.parse_expr()?;
                self.expect(Semi)?;
                Ok(Stmt::Expr(e))
            }
        }
    }

    fn peek_is_label(&self) -> bool {
        self.at(TokenKind::Id) && self.toks.get(self.pos + 1).map(|t| t.kind) == Some(TokenKind::Colon)
    }

    fn parse_switch_body(&mut self, cases: &mut Vec<(Option<i64>, Id)>) -> PResult<Stmt> {
        // Body is typically a block; case/default labels inside it are
        // collected by re-walking the produced statement tree.
        let stmt = self.parse_stmt()?;
        collect_cases(&stmt, cases);
        Ok(stmt)
    }

    fn parse_decl_stmt(&mut self) -> PResult<Stmt> {
        let (base_ty, is_static, is_typedef) = self.parse_decl_specifiers()?;
        if is_typedef {
            let (name, ty) = self.parse_declarator(base_ty)?;
            self.typedefs.insert(name, ty);
            self.expect(TokenKind::Semi)?;
            return Ok(Stmt::Empty);
        }
        let mut decls = Vec::new();
        loop {
            let (name, ty) = self.parse_declarator(base_ty)?;
            let init = if self.eat(TokenKind::Assign) {
                Some(self.parse_initializer(ty)?)
            } else {
                None
            };
            let payload = if is_static {
                VarPayload::StaticLocal { alias: intern(format!("{}.{}", name, self.fresh_static_id())) }
            } else {
                VarPayload::Local { index: 0 }
            };
            self.scopes.declare(
                self.cur_scope,
                VarInfo { name, ty, storage: StorageClass::Auto, payload, span: self.span() },
            );
            decls.push(VarDecl { name, ty, init });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Semi)?;
        Ok(Stmt::VarDecl(decls))
    }

    fn fresh_static_id(&mut self) -> u32 {
        self.label_counter += 1;
        self.label_counter
    }

    fn parse_initializer(&mut self, ty: Ty) -> PResult<Init> {
        if self.eat(TokenKind::LBrace) {
            let mut items = Vec::new();
            while !self.at(TokenKind::RBrace) {
                let elem_ty = element_type_hint(&self.types, ty);
                items.push(self.parse_initializer(elem_ty)?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            Ok(Init::List(items))
        } else {
            Ok(Init::Expr(self.parse_assign()?))
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> PResult<Expr> {
        let mut e = self.parse_assign()?;
        while self.eat(TokenKind::Comma) {
            let rhs = self.parse_assign()?;
            let ty = rhs.ty;
            let span = e.span;
            e = Expr { kind: ExprKind::Comma(Box::new(e), Box::new(rhs)), ty, span };
        }
        Ok(e)
    }

    fn parse_assign(&mut self) -> PResult<Expr> {
        let lhs = self.parse_ternary()?;
        use TokenKind::*;
        let bop = match self.kind() {
            Assign => None,
            PlusEq => Some(BOp::Add),
            MinusEq => Some(BOp::Sub),
            StarEq => Some(BOp::Mul),
            SlashEq => Some(BOp::Div),
            PercentEq => Some(BOp::Mod),
            AmpEq => Some(BOp::BitAnd),
            PipeEq => Some(BOp::BitOr),
            CaretEq => Some(BOp::BitXor),
            ShlEq => Some(BOp::Shl),
            ShrEq => Some(BOp::Shr),
            _ => return Ok(lhs),
        };
        let span = self.span();
        self.advance();
        let rhs = self.parse_assign()?;
        let ty = lhs.ty;
        if let Some(op) = bop {
            let rhs = self.scale_pointer_rhs(op, ty, rhs);
            Ok(Expr { kind: ExprKind::Modify(op, Box::new(lhs), Box::new(rhs)), ty, span })
        } else {
            Ok(Expr { kind: ExprKind::Assign(Box::new(lhs), Box::new(rhs)), ty, span })
        }
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let cond = self.parse_logor()?;
        if self.eat(TokenKind::Question) {
            let span = cond.span;
            let tt = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let ff = self.parse_ternary()?;
            let ty = tt.ty;
            Ok(Expr {
                kind: ExprKind::Ternary(Box::new(cond), Box::new(tt), Box::new(ff)),
                ty,
                span,
            })
        } else {
            Ok(cond)
        }
    }

    fn binop_level(
        &mut self,
        next: fn(&mut Self) -> PResult<Expr>,
        ops: &[(TokenKind, BOp)],
        result_ty: fn(&Parser, Ty, Ty) -> Ty,
    ) -> PResult<Expr> {
        let mut lhs = next(self)?;
        loop {
            let found = ops.iter().find(|(k, _)| self.kind() == *k);
            let Some((_, op)) = found else { break };
            let op = *op;
            let span = lhs.span;
            self.advance();
            let rhs = next(self)?;
            lhs = self.make_binop(op, lhs, rhs, span, result_ty);
        }
        Ok(lhs)
    }

    fn make_binop(
        &mut self,
        op: BOp,
        lhs: Expr,
        rhs: Expr,
        span: Span,
        result_ty: fn(&Parser, Ty, Ty) -> Ty,
    ) -> Expr {
        // Pointer arithmetic scaling: `p + i` -> `p + i*sizeof *p`;
        // `p - i` likewise; `p - q` -> `(p - q) / sizeof *p`.
        if matches!(op, BOp::Add | BOp::Sub) {
            let lp = is_pointer(lhs.ty) || is_array(lhs.ty);
            let rp = is_pointer(rhs.ty) || is_array(rhs.ty);
            if lp && rp && op == BOp::Sub {
                let elem = pointee(decay(lhs.ty)).unwrap();
                let esize = self.types.size_of(elem).max(1) as i64;
                let ty = TypeTable::fixnum(8, true);
                let diff = Expr {
                    kind: ExprKind::BOp(BOp::Sub, Box::new(lhs), Box::new(rhs)),
                    ty,
                    span,
                };
                let size_lit = Expr { kind: ExprKind::IntLit(esize), ty, span };
                return Expr { kind: ExprKind::BOp(BOp::Div, Box::new(diff), Box::new(size_lit)), ty, span };
            }
            if lp && !rp {
                let rhs = self.scale_pointer_rhs(op, lhs.ty, rhs);
                let ty = decay(lhs.ty);
                return Expr { kind: ExprKind::BOp(op, Box::new(lhs), Box::new(rhs)), ty, span };
            }
            if rp && !lp && op == BOp::Add {
                let lhs_scaled = self.scale_pointer_rhs(op, rhs.ty, lhs);
                let ty = decay(rhs.ty);
                return Expr { kind: ExprKind::BOp(op, Box::new(rhs), Box::new(lhs_scaled)), ty, span };
            }
        }
        let ty = result_ty(self, lhs.ty, rhs.ty);
        Expr { kind: ExprKind::BOp(op, Box::new(lhs), Box::new(rhs)), ty, span }
    }

    /// Scale an integer addend by the pointee size for `p +/-= i` and
    /// `p +/- i`.
    fn scale_pointer_rhs(&self, op: BOp, ptr_ty: Ty, rhs: Expr) -> Expr {
        if !matches!(op, BOp::Add | BOp::Sub) || !(is_pointer(ptr_ty) || is_array(ptr_ty)) {
            return rhs;
        }
        let elem = pointee(decay(ptr_ty)).unwrap();
        let esize = self.types.size_of(elem).max(1) as i64;
        if esize == 1 {
            return rhs;
        }
        let ty = rhs.ty;
        let span = rhs.span;
        let size_lit = Expr { kind: ExprKind::IntLit(esize), ty, span };
        Expr { kind: ExprKind::BOp(BOp::Mul, Box::new(rhs), Box::new(size_lit)), ty, span }
    }

    /// Scale a `++`/`--` addend by the pointee size, same as
    /// `scale_pointer_rhs` does for `p +/- i`: `int *p; p++;` must advance by
    /// `sizeof(int)`, not by 1.
    fn incdec_delta(&self, ty: Ty, unit: i64) -> i64 {
        match pointee(decay(ty)) {
            Some(elem) => unit * self.types.size_of(elem).max(1) as i64,
            None => unit,
        }
    }

    fn parse_logor(&mut self) -> PResult<Expr> {
        self.binop_level(Self::parse_logand, &[(TokenKind::PipePipe, BOp::LogOr)], |_, _, _| {
            TypeTable::fixnum(4, true)
        })
    }

    fn parse_logand(&mut self) -> PResult<Expr> {
        self.binop_level(Self::parse_bitor, &[(TokenKind::AmpAmp, BOp::LogAnd)], |_, _, _| {
            TypeTable::fixnum(4, true)
        })
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        self.binop_level(Self::parse_bitxor, &[(TokenKind::Pipe, BOp::BitOr)], Self::arith_result_ty)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        self.binop_level(Self::parse_bitand, &[(TokenKind::Caret, BOp::BitXor)], Self::arith_result_ty)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        self.binop_level(Self::parse_equality, &[(TokenKind::Amp, BOp::BitAnd)], Self::arith_result_ty)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        self.binop_level(
            Self::parse_relational,
            &[(TokenKind::EqEq, BOp::Eq), (TokenKind::Ne, BOp::Ne)],
            |_, _, _| TypeTable::fixnum(4, true),
        )
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        self.binop_level(
            Self::parse_shift,
            &[
                (TokenKind::Lt, BOp::Lt),
                (TokenKind::Le, BOp::Le),
                (TokenKind::Gt, BOp::Gt),
                (TokenKind::Ge, BOp::Ge),
            ],
            |_, _, _| TypeTable::fixnum(4, true),
        )
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        self.binop_level(
            Self::parse_additive,
            &[(TokenKind::Shl, BOp::Shl), (TokenKind::Shr, BOp::Shr)],
            |_, l, _| l,
        )
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        self.binop_level(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BOp::Add), (TokenKind::Minus, BOp::Sub)],
            Self::arith_result_ty,
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        self.binop_level(
            Self::parse_cast,
            &[
                (TokenKind::Star, BOp::Mul),
                (TokenKind::Slash, BOp::Div),
                (TokenKind::Percent, BOp::Mod),
            ],
            Self::arith_result_ty,
        )
    }

    fn arith_result_ty(&self, l: Ty, r: Ty) -> Ty {
        if is_flonum(l) || is_flonum(r) {
            return TypeTable::flonum(8);
        }
        let ls = self.types.size_of(l);
        let rs = self.types.size_of(r);
        if ls >= rs {
            l
        } else {
            r
        }
    }

    fn parse_cast(&mut self) -> PResult<Expr> {
        if self.at(TokenKind::LParen) && self.is_type_start_after_paren() {
            let span = self.span();
            self.advance();
            let (base, _, _) = self.parse_decl_specifiers()?;
            let (_, ty) = self.parse_declarator(base)?;
            self.expect(TokenKind::RParen)?;
            let e = self.parse_cast()?;
            return Ok(Expr { kind: ExprKind::Cast(ty, Box::new(e)), ty, span });
        }
        self.parse_unary()
    }

    fn is_type_start_after_paren(&self) -> bool {
        matches!(
            self.toks.get(self.pos + 1).map(|t| t.kind),
            Some(
                TokenKind::KwInt
                    | TokenKind::KwChar
                    | TokenKind::KwShort
                    | TokenKind::KwLong
                    | TokenKind::KwVoid
                    | TokenKind::KwFloat
                    | TokenKind::KwDouble
                    | TokenKind::KwUnsigned
                    | TokenKind::KwSigned
                    | TokenKind::KwStruct
                    | TokenKind::KwUnion
                    | TokenKind::KwEnum
                    | TokenKind::KwConst
                    | TokenKind::KwVolatile
            )
        ) || matches!(self.toks.get(self.pos + 1), Some(t) if t.kind == TokenKind::Id && matches!(&t.literal, Literal::Name(n) if self.typedefs.contains_key(n)))
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        use TokenKind::*;
        let span = self.span();
        match self.kind() {
            Plus => {
                self.advance();
                self.parse_cast()
            }
            Minus => {
                self.advance();
                let e = self.parse_cast()?;
                let ty = e.ty;
                Ok(Expr { kind: ExprKind::UOp(UOp::Neg, Box::new(e)), ty, span })
            }
            Tilde => {
                self.advance();
                let e = self.parse_cast()?;
                let ty = e.ty;
                Ok(Expr { kind: ExprKind::UOp(UOp::BitNot, Box::new(e)), ty, span })
            }
            Bang => {
                self.advance();
                let e = self.parse_cast()?;
                Ok(Expr { kind: ExprKind::UOp(UOp::LogNot, Box::new(e)), ty: TypeTable::fixnum(4, true), span })
            }
            Star => {
                self.advance();
                let e = self.parse_cast()?;
                let ty = pointee(decay(e.ty)).unwrap_or(e.ty);
                Ok(Expr { kind: ExprKind::Deref(Box::new(e)), ty, span })
            }
            Amp => {
                self.advance();
                let e = self.parse_cast()?;
                let ty = TypeTable::pointer(e.ty);
                Ok(Expr { kind: ExprKind::Ref(Box::new(e)), ty, span })
            }
            PlusPlus => {
                self.advance();
                let target = self.parse_unary()?;
                let ty = target.ty;
                let delta = self.incdec_delta(ty, 1);
                Ok(Expr { kind: ExprKind::IncDec { pre: true, delta, target: Box::new(target) }, ty, span })
            }
            MinusMinus => {
                self.advance();
                let target = self.parse_unary()?;
                let ty = target.ty;
                let delta = self.incdec_delta(ty, -1);
                Ok(Expr { kind: ExprKind::IncDec { pre: true, delta, target: Box::new(target) }, ty, span })
            }
            KwSizeof => {
                self.advance();
                let size = if self.at(LParen) && self.is_type_start_after_paren() {
                    self.advance();
                    let (base, _, _) = self.parse_decl_specifiers()?;
                    let (_, ty) = self.parse_declarator(base)?;
                    self.expect(RParen)?;
                    self.types.size_of(ty)
                } else {
                    let e = self.parse_unary()?;
                    self.types.size_of(e.ty)
                };
                Ok(Expr { kind: ExprKind::IntLit(size as i64), ty: TypeTable::fixnum(8, false), span })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut e = self.parse_primary()?;
        loop {
            let span = e.span;
            match self.kind() {
                TokenKind::LBracket => {
                    self.advance();
                    let idx = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    let ty = pointee(decay(e.ty)).unwrap_or(e.ty);
                    e = Expr { kind: ExprKind::Subscript(Box::new(e), Box::new(idx)), ty, span };
                }
                TokenKind::Dot => {
                    self.advance();
                    let field = self.ident()?;
                    let ty = self.types.find_field(e.ty, field).map(|f| f.ty).unwrap_or(e.ty);
                    e = Expr { kind: ExprKind::Member { base: Box::new(e), field, arrow: false }, ty, span };
                }
                TokenKind::Arrow => {
                    self.advance();
                    let field = self.ident()?;
                    let base_struct = pointee(decay(e.ty)).unwrap_or(e.ty);
                    let ty = self.types.find_field(base_struct, field).map(|f| f.ty).unwrap_or(e.ty);
                    e = Expr { kind: ExprKind::Member { base: Box::new(e), field, arrow: true }, ty, span };
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.at(TokenKind::RParen) {
                        loop {
                            args.push(self.parse_assign()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    let ty = match &*decay(e.ty) {
                        TypeKind::Pointer(inner) => match &**inner {
                            TypeKind::Function { ret, .. } => *ret,
                            _ => e.ty,
                        },
                        TypeKind::Function { ret, .. } => *ret,
                        _ => e.ty,
                    };
                    e = Expr { kind: ExprKind::Call { callee: Box::new(e), args }, ty, span };
                }
                TokenKind::PlusPlus => {
                    self.advance();
                    let ty = e.ty;
                    let delta = self.incdec_delta(ty, 1);
                    e = Expr { kind: ExprKind::IncDec { pre: false, delta, target: Box::new(e) }, ty, span };
                }
                TokenKind::MinusMinus => {
                    self.advance();
                    let ty = e.ty;
                    let delta = self.incdec_delta(ty, -1);
                    e = Expr { kind: ExprKind::IncDec { pre: false, delta, target: Box::new(e) }, ty, span };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        use TokenKind::*;
        let span = self.span();
        match self.kind() {
            IntLit => {
                let t = self.advance();
                let (value, unsigned, long) = match t.literal {
                    Literal::Int { value, unsigned, long } => (value, unsigned, long),
                    _ => unreachable!(),
                };
                let size = if long { 8 } else { 4 };
                Ok(Expr { kind: ExprKind::IntLit(value), ty: TypeTable::fixnum(size, !unsigned), span })
            }
            FloatLit => {
                let t = self.advance();
                let (value, is_float) = match t.literal {
                    Literal::Float { value, is_float } => (value, is_float),
                    _ => unreachable!(),
                };
                let ty = TypeTable::flonum(if is_float { 4 } else { 8 });
                Ok(Expr { kind: ExprKind::FloatLit(value), ty, span })
            }
            StrLit => {
                let t = self.advance();
                let bytes = match t.literal {
                    Literal::Str(b) => b,
                    _ => unreachable!(),
                };
                let label = self.fresh_label("str");
                self.string_literals.push((label, bytes));
                let ty = TypeTable::pointer(TypeTable::fixnum(1, true));
                Ok(Expr { kind: ExprKind::StrLit(label), ty, span })
            }
            Id => {
                let name = self.ident()?;
                if let Some(v) = self.scopes.resolve(self.cur_scope, name) {
                    let ty = v.ty;
                    if let VarPayload::EnumConst(value) = v.payload {
                        return Ok(Expr { kind: ExprKind::IntLit(value), ty, span });
                    }
                    Ok(Expr { kind: ExprKind::Var(name, self.cur_scope), ty, span })
                } else {
                    Err(ParseError(format!("undefined symbol '{name}' at {}", span.start)))
                }
            }
            LParen => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect(RParen)?;
                Ok(e)
            }
            _ => Err(self.err(&format!("unexpected token '{}'", self.cur().text))),
        }
    }
}

fn element_type_hint(types: &TypeTable, ty: Ty) -> Ty {
    match &*strip_qualifiers(ty) {
        TypeKind::Array(of, _) => *of,
        TypeKind::Struct(idx) => types
            .struct_def(*idx)
            .fields
            .first()
            .map(|f| f.ty)
            .unwrap_or(ty),
        _ => ty,
    }
}

fn collect_cases(stmt: &Stmt, out: &mut Vec<(Option<i64>, Id)>) {
    match stmt {
        Stmt::Case(v, label) => out.push((Some(*v), *label)),
        Stmt::Default(label) => out.push((None, *label)),
        Stmt::Block(_, stmts) => stmts.iter().for_each(|s| collect_cases(s, out)),
        Stmt::Label(_, inner) => collect_cases(inner, out),
        Stmt::If { tt, ff, .. } => {
            collect_cases(tt, out);
            if let Some(ff) = ff {
                collect_cases(ff, out);
            }
        }
        _ => {}
    }
}

/// Constant-fold a restricted subset of expressions, enough for array sizes,
/// enum values, and `case` labels.
fn const_eval(e: &Expr) -> Option<i64> {
    match &e.kind {
        ExprKind::IntLit(v) => Some(*v),
        ExprKind::UOp(UOp::Neg, inner) => const_eval(inner).map(|v| -v),
        ExprKind::UOp(UOp::BitNot, inner) => const_eval(inner).map(|v| !v),
        ExprKind::BOp(op, l, r) => {
            let l = const_eval(l)?;
            let r = const_eval(r)?;
            Some(match op {
                BOp::Add => l + r,
                BOp::Sub => l - r,
                BOp::Mul => l * r,
                BOp::Div if r != 0 => l / r,
                BOp::Mod if r != 0 => l % r,
                BOp::BitAnd => l & r,
                BOp::BitOr => l | r,
                BOp::BitXor => l ^ r,
                BOp::Shl => l << r,
                BOp::Shr => l >> r,
                _ => return None,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_function() {
        let (prog, _) = parse("int main(){ return 42; }", 8).unwrap();
        assert_eq!(prog.functions.len(), 1);
        assert_eq!(*prog.functions[0].name, "main");
    }

    #[test]
    fn pointer_arithmetic_is_scaled() {
        let (prog, types) = parse("int f(int *p){ return *(p+1); }", 8).unwrap();
        let body = prog.functions[0].body.as_ref().unwrap();
        assert_eq!(types.size_of(TypeTable::fixnum(4, true)), 4);
        let _ = body;
    }

    #[test]
    fn struct_member_access_parses() {
        let (prog, _) = parse(
            "struct P { int x, y; }; int main(){ struct P p; p.x = 3; return p.x + p.y; }",
            8,
        )
        .unwrap();
        assert_eq!(prog.functions.len(), 1);
    }

    #[test]
    fn undefined_symbol_is_an_error() {
        assert!(parse("int main(){ return q; }", 8).is_err());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(parse("int main(){ break; return 0; }", 8).is_err());
    }
}
