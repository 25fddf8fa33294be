//! AST → IR: walks each function body, emitting three-address ops over a
//! per-function pool of virtual registers organised into basic blocks.

use derive_more::Display;

use crate::common::{intern, Id, Map};
use crate::front::ast::*;
use crate::front::types::*;
use crate::middle::tir::{self, vreg_flags, BBId, Callee, Cond, Op, VReg, VRegId};

#[derive(Display, Debug)]
#[display("IR error: {}", self.0)]
pub struct IrError(pub String);

pub fn build_program(program: &Program, types: &TypeTable) -> Result<tir::Program, IrError> {
    let mut globals = Vec::new();
    for g in &program.globals {
        globals.push(build_global(g, types));
    }
    for (label, bytes) in &program.string_literals {
        globals.push(tir::GlobalData {
            name: *label,
            size: bytes.len() as u32,
            align: 1,
            init: vec![(0, bytes.clone())],
            exported: false,
        });
    }
    let mut functions = Vec::new();
    for f in &program.functions {
        if let Some(body) = &f.body {
            functions.push(Builder::new(types, &program.scopes).build(f, body)?);
        }
    }
    Ok(tir::Program { functions, globals })
}

fn build_global(g: &GlobalDecl, types: &TypeTable) -> tir::GlobalData {
    let size = types.size_of(g.ty);
    let init = g
        .init
        .as_ref()
        .map(|init| {
            crate::front::lower::flatten_init(types, g.ty, init)
                .into_iter()
                .filter_map(|leaf| encode_const(types, leaf.ty, &leaf.expr).map(|b| (leaf.offset, b)))
                .collect()
        })
        .unwrap_or_default();
    tir::GlobalData { name: g.name, size, align: types.align_of(g.ty), init, exported: !g.is_static }
}

/// Encode a constant initializer expression to its little-endian byte
/// representation. Non-constant initializers (which the original only
/// permits for `static`-duration aggregates with constant sub-expressions)
/// fall back to zero bytes; a real implementation would reject them in
/// `front::lower` before reaching here.
fn encode_const(types: &TypeTable, ty: Ty, e: &Expr) -> Option<Vec<u8>> {
    let size = types.size_of(ty) as usize;
    match &e.kind {
        ExprKind::IntLit(v) => Some(v.to_le_bytes()[..size.min(8)].to_vec()),
        ExprKind::FloatLit(v) => {
            if size == 4 {
                Some((*v as f32).to_le_bytes().to_vec())
            } else {
                Some(v.to_le_bytes().to_vec())
            }
        }
        _ => Some(vec![0; size]),
    }
}

struct SwitchCtx {
    value: VRegId,
    end: BBId,
    cases: Vec<(Option<i64>, BBId)>,
}

struct Builder<'a> {
    types: &'a TypeTable,
    scopes: &'a Scopes,
    vregs: Vec<VReg>,
    blocks: tir::BBContainer,
    cur: BBId,
    /// Scalar locals kept directly in a vreg (never had their address taken).
    reg_locals: Map<Id, VRegId>,
    /// Addressable locals (structs/arrays, or scalars with `&x` taken):
    /// frame offset from the frame base.
    frame_locals: Map<Id, (i32, Ty)>,
    frame_size: u32,
    break_targets: Vec<BBId>,
    continue_targets: Vec<BBId>,
    switch_stack: Vec<SwitchCtx>,
    labels: Map<Id, BBId>,
    /// The single block every `return` jumps to. Left empty by the builder;
    /// the x86-64 emitter recognises a jump to this block as "emit the
    /// epilogue and `ret`" rather than a real branch.
    exit: BBId,
}

type BResult<T> = Result<T, IrError>;

impl<'a> Builder<'a> {
    fn new(types: &'a TypeTable, scopes: &'a Scopes) -> Builder<'a> {
        Builder {
            types,
            scopes,
            vregs: Vec::new(),
            blocks: tir::BBContainer::new(),
            cur: 0,
            reg_locals: Map::new(),
            frame_locals: Map::new(),
            frame_size: 0,
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
            switch_stack: Vec::new(),
            labels: Map::new(),
            exit: 0,
        }
    }

    fn new_vreg(&mut self, ty: Ty) -> VRegId {
        let id = self.vregs.len() as VRegId;
        let flags = if is_flonum(ty) { vreg_flags::FLONUM } else { 0 }
            | if !is_signed(ty) { vreg_flags::UNSIGNED } else { 0 };
        self.vregs.push(VReg {
            id,
            size: self.types.size_of(ty).min(8) as u8,
            align: self.types.align_of(ty).min(8) as u8,
            flags,
            phys: None,
            const_value: None,
            frame_offset: None,
            param_index: None,
        });
        id
    }

    fn new_const(&mut self, ty: Ty, value: i64) -> VRegId {
        let id = self.new_vreg(ty);
        self.vregs[id as usize].flags |= vreg_flags::CONST;
        self.vregs[id as usize].const_value = Some(value);
        id
    }

    fn alloc_frame(&mut self, size: u32, align: u32) -> i32 {
        self.frame_size = round_up(self.frame_size + size, align.max(1));
        -(self.frame_size as i32)
    }

    fn new_block(&mut self) -> BBId {
        self.blocks.push()
    }

    fn emit(&mut self, op: Op) {
        self.blocks.get_mut(self.cur).ops.push(op);
    }

    fn seal_with(&mut self, op: Op, next: BBId) {
        self.emit(op);
        self.cur = next;
    }

    fn build(mut self, f: &FunctionDecl, body: &Stmt) -> BResult<tir::Function> {
        let (ret, param_tys, _vaargs) = match &*f.ty {
            TypeKind::Function { ret, params, vaargs } => (*ret, params.clone(), *vaargs),
            _ => return Err(IrError(format!("'{}' is not a function type", f.name))),
        };

        self.cur = self.new_block();
        let entry = self.cur;
        self.exit = self.new_block();

        let mut param_vregs = Vec::new();
        for (i, (p, ty)) in f.params.iter().zip(param_tys.iter()).enumerate() {
            let vid = self.new_vreg(*ty);
            self.vregs[vid as usize].flags |= vreg_flags::PARAM;
            self.vregs[vid as usize].param_index = Some(i as u32);
            self.reg_locals.insert(p.name, vid);
            param_vregs.push(vid);
        }
        let _ = ret;

        self.collect_labels(body);
        self.lower_stmt(f.scope, body)?;

        Ok(tir::Function {
            name: f.name,
            ty: f.ty,
            params: param_vregs,
            vregs: self.vregs,
            blocks: self.blocks,
            entry,
            exit: self.exit,
            frame_size: self.frame_size,
            used_int_regs: crate::common::Set::new(),
            used_float_regs: crate::common::Set::new(),
        })
    }

    fn collect_labels(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Label(name, inner) => {
                let bb = self.new_block();
                self.labels.insert(*name, bb);
                self.collect_labels(inner);
            }
            Stmt::Block(_, stmts) => stmts.iter().for_each(|s| self.collect_labels(s)),
            Stmt::If { tt, ff, .. } => {
                self.collect_labels(tt);
                if let Some(ff) = ff {
                    self.collect_labels(ff);
                }
            }
            Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
                self.collect_labels(body)
            }
            Stmt::Switch { body, .. } => self.collect_labels(body),
            _ => {}
        }
    }

    // ---- statements ----

    fn lower_stmt(&mut self, scope: ScopeId, stmt: &Stmt) -> BResult<()> {
        match stmt {
            Stmt::Empty | Stmt::Case(..) | Stmt::Default(..) => Ok(()),
            Stmt::Expr(e) => {
                self.lower_expr(scope, e)?;
                Ok(())
            }
            Stmt::Block(inner_scope, stmts) => {
                for s in stmts {
                    self.lower_stmt(*inner_scope, s)?;
                }
                Ok(())
            }
            Stmt::VarDecl(decls) => {
                for d in decls {
                    self.declare_local(scope, d)?;
                }
                Ok(())
            }
            Stmt::If { cond, tt, ff } => self.lower_if(scope, cond, tt, ff.as_deref()),
            Stmt::While { cond, body } => self.lower_while(scope, cond, body),
            Stmt::DoWhile { body, cond } => self.lower_do_while(scope, body, cond),
            Stmt::For { init, cond, step, body } => self.lower_for(scope, init, cond, step, body),
            Stmt::Break => {
                let target = *self
                    .break_targets
                    .last()
                    .ok_or_else(|| IrError("break with no enclosing loop/switch".into()))?;
                let dead = self.new_block();
                self.seal_with(Op::Jump(target), dead);
                Ok(())
            }
            Stmt::Continue => {
                let target = *self
                    .continue_targets
                    .last()
                    .ok_or_else(|| IrError("continue with no enclosing loop".into()))?;
                let dead = self.new_block();
                self.seal_with(Op::Jump(target), dead);
                Ok(())
            }
            Stmt::Return(e) => {
                if let Some(e) = e {
                    let v = self.lower_expr(scope, e)?;
                    self.emit(Op::Result { src: v.expect("return value") });
                }
                let dead = self.new_block();
                self.seal_with(Op::Jump(self.exit), dead);
                Ok(())
            }
            Stmt::Goto(name) => {
                let target = *self
                    .labels
                    .get(name)
                    .ok_or_else(|| IrError(format!("goto to undefined label '{name}'")))?;
                let dead = self.new_block();
                self.seal_with(Op::Jump(target), dead);
                Ok(())
            }
            Stmt::Label(name, inner) => {
                let bb = self.labels[name];
                self.seal_with(Op::Jump(bb), bb);
                self.lower_stmt(scope, inner)
            }
            Stmt::Switch { value, body, cases } => self.lower_switch(scope, value, body, cases),
            Stmt::Asm(text) => {
                self.emit(Op::Asm(text.clone()));
                Ok(())
            }
        }
    }

    fn declare_local(&mut self, scope: ScopeId, d: &VarDecl) -> BResult<()> {
        let addressable = is_struct(d.ty) || is_array(d.ty);
        if addressable {
            let off = self.alloc_frame(self.types.size_of(d.ty), self.types.align_of(d.ty));
            self.frame_locals.insert(d.name, (off, d.ty));
            if let Some(init) = &d.init {
                for leaf in crate::front::lower::flatten_init(self.types, d.ty, init) {
                    let v = self.lower_expr(scope, &leaf.expr)?.expect("scalar initializer");
                    let addr = self.new_vreg(TypeTable::pointer(leaf.ty));
                    self.emit(Op::Bofs { dst: addr, frame_offset: off + leaf.offset as i32 });
                    self.emit(Op::Store { addr, src: v, size: self.types.size_of(leaf.ty).min(8) as u8 });
                }
            }
        } else {
            let v = match &d.init {
                Some(Init::Expr(e)) => self.lower_expr(scope, e)?.expect("scalar initializer"),
                Some(Init::List(items)) => {
                    let first = items.first().ok_or_else(|| IrError("empty initializer".into()))?;
                    match first {
                        Init::Expr(e) => self.lower_expr(scope, e)?.expect("scalar initializer"),
                        Init::List(_) => return Err(IrError("nested list initializer on a scalar".into())),
                    }
                }
                None => self.new_const(d.ty, 0),
            };
            self.reg_locals.insert(d.name, v);
        }
        Ok(())
    }

    fn lower_if(&mut self, scope: ScopeId, cond: &Expr, tt: &Stmt, ff: Option<&Stmt>) -> BResult<()> {
        let tt_bb = self.new_block();
        let join = self.new_block();
        let ff_bb = if ff.is_some() { self.new_block() } else { join };
        self.lower_cond_jump(scope, cond, tt_bb, ff_bb)?;
        self.cur = tt_bb;
        self.lower_stmt(scope, tt)?;
        self.emit(Op::Jump(join));
        if let Some(ff) = ff {
            self.cur = ff_bb;
            self.lower_stmt(scope, ff)?;
            self.emit(Op::Jump(join));
        }
        self.cur = join;
        Ok(())
    }

    fn lower_while(&mut self, scope: ScopeId, cond: &Expr, body: &Stmt) -> BResult<()> {
        let head = self.new_block();
        let body_bb = self.new_block();
        let end = self.new_block();
        self.emit(Op::Jump(head));
        self.cur = head;
        self.lower_cond_jump(scope, cond, body_bb, end)?;
        self.cur = body_bb;
        self.break_targets.push(end);
        self.continue_targets.push(head);
        self.lower_stmt(scope, body)?;
        self.break_targets.pop();
        self.continue_targets.pop();
        self.emit(Op::Jump(head));
        self.cur = end;
        Ok(())
    }

    fn lower_do_while(&mut self, scope: ScopeId, body: &Stmt, cond: &Expr) -> BResult<()> {
        let body_bb = self.new_block();
        let test = self.new_block();
        let end = self.new_block();
        self.emit(Op::Jump(body_bb));
        self.cur = body_bb;
        self.break_targets.push(end);
        self.continue_targets.push(test);
        self.lower_stmt(scope, body)?;
        self.break_targets.pop();
        self.continue_targets.pop();
        self.emit(Op::Jump(test));
        self.cur = test;
        self.lower_cond_jump(scope, cond, body_bb, end)?;
        self.cur = end;
        Ok(())
    }

    fn lower_for(
        &mut self,
        scope: ScopeId,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        step: &Option<Expr>,
        body: &Stmt,
    ) -> BResult<()> {
        if let Some(init) = init {
            self.lower_stmt(scope, init)?;
        }
        let head = self.new_block();
        let body_bb = self.new_block();
        let step_bb = self.new_block();
        let end = self.new_block();
        self.emit(Op::Jump(head));
        self.cur = head;
        match cond {
            Some(c) => self.lower_cond_jump(scope, c, body_bb, end)?,
            None => self.emit(Op::Jump(body_bb)),
        }
        self.cur = body_bb;
        self.break_targets.push(end);
        self.continue_targets.push(step_bb);
        self.lower_stmt(scope, body)?;
        self.break_targets.pop();
        self.continue_targets.pop();
        self.emit(Op::Jump(step_bb));
        self.cur = step_bb;
        if let Some(step) = step {
            self.lower_expr(scope, step)?;
        }
        self.emit(Op::Jump(head));
        self.cur = end;
        Ok(())
    }

    fn lower_switch(
        &mut self,
        scope: ScopeId,
        value: &Expr,
        body: &Stmt,
        cases: &[(Option<i64>, Id)],
    ) -> BResult<()> {
        let v = self.lower_expr(scope, value)?.expect("switch value");
        let end = self.new_block();
        let mut resolved = Vec::new();
        for (val, label) in cases {
            resolved.push((*val, self.labels[label]));
        }
        let default = resolved.iter().find(|(v, _)| v.is_none()).map(|(_, b)| *b).unwrap_or(end);
        let dispatch: Vec<_> = resolved.iter().filter(|(v, _)| v.is_some()).cloned().collect();
        // A chain of compare-and-jump; no jump table is built.
        for (val, target) in &dispatch {
            let next = self.new_block();
            let c = self.new_const(TypeTable::fixnum(4, true), val.unwrap());
            self.emit(Op::Cmp { cond: Cond::Eq, dst: None, lhs: v, rhs: c });
            self.emit(Op::CJump { cond: Cond::Eq, tt: *target, ff: next });
            self.cur = next;
        }
        self.emit(Op::Jump(default));
        self.break_targets.push(end);
        self.switch_stack.push(SwitchCtx { value: v, end, cases: resolved });
        // body's own statements run in whichever block its Case/Default/Label
        // markers already reassigned `self.cur` to, via lower_stmt's Label
        // handling for ordinary labels; case/default BBs were pre-created in
        // collect_labels only for `goto` targets, so walk the block directly
        // using the per-statement BB map built just above.
        self.lower_switch_body(scope, body, &dispatch, default)?;
        self.switch_stack.pop();
        self.emit(Op::Jump(end));
        self.cur = end;
        Ok(())
    }

    fn lower_switch_body(
        &mut self,
        scope: ScopeId,
        stmt: &Stmt,
        dispatch: &[(Option<i64>, BBId)],
        default: BBId,
    ) -> BResult<()> {
        match stmt {
            Stmt::Block(inner, stmts) => {
                for s in stmts {
                    self.lower_switch_body(*inner, s, dispatch, default)?;
                }
                Ok(())
            }
            Stmt::Case(val, _label) => {
                let target = dispatch.iter().find(|(v, _)| *v == Some(*val)).map(|(_, b)| *b).unwrap();
                self.emit(Op::Jump(target));
                self.cur = target;
                Ok(())
            }
            Stmt::Default(_label) => {
                self.emit(Op::Jump(default));
                self.cur = default;
                Ok(())
            }
            other => self.lower_stmt(scope, other),
        }
    }

    /// Lower `cond` so it branches directly to `tt`/`ff` without
    /// materialising an intermediate boolean.
    fn lower_cond_jump(&mut self, scope: ScopeId, cond: &Expr, tt: BBId, ff: BBId) -> BResult<()> {
        match &cond.kind {
            ExprKind::BOp(BOp::LogAnd, l, r) => {
                let mid = self.new_block();
                self.lower_cond_jump(scope, l, mid, ff)?;
                self.cur = mid;
                self.lower_cond_jump(scope, r, tt, ff)
            }
            ExprKind::BOp(BOp::LogOr, l, r) => {
                let mid = self.new_block();
                self.lower_cond_jump(scope, l, tt, mid)?;
                self.cur = mid;
                self.lower_cond_jump(scope, r, tt, ff)
            }
            ExprKind::UOp(UOp::LogNot, inner) => self.lower_cond_jump(scope, inner, ff, tt),
            ExprKind::BOp(op, l, r) if Cond::is_comparison(*op) => {
                let lv = self.lower_expr(scope, l)?.expect("comparison operand");
                let rv = self.lower_expr(scope, r)?.expect("comparison operand");
                let unsigned = !is_signed(l.ty) || !is_signed(r.ty);
                let cond_code = Cond::from_bop(*op, unsigned).unwrap();
                let folded = self.fold_cond(cond_code, lv, rv);
                self.emit(Op::Cmp { cond: folded, dst: None, lhs: lv, rhs: rv });
                self.emit(Op::CJump { cond: folded, tt, ff });
                Ok(())
            }
            _ => {
                let v = self.lower_expr(scope, cond)?.expect("condition value");
                let zero = self.new_const(TypeTable::fixnum(4, true), 0);
                self.emit(Op::Cmp { cond: Cond::Ne, dst: None, lhs: v, rhs: zero });
                self.emit(Op::CJump { cond: Cond::Ne, tt, ff });
                Ok(())
            }
        }
    }

    fn fold_cond(&self, cond: Cond, l: VRegId, r: VRegId) -> Cond {
        let lv = &self.vregs[l as usize];
        let rv = &self.vregs[r as usize];
        if let (Some(a), Some(b)) = (lv.const_value, rv.const_value) {
            let taken = match cond {
                Cond::Eq => a == b,
                Cond::Ne => a != b,
                Cond::Lt => a < b,
                Cond::Le => a <= b,
                Cond::Gt => a > b,
                Cond::Ge => a >= b,
                Cond::LtU => (a as u64) < (b as u64),
                Cond::LeU => (a as u64) <= (b as u64),
                Cond::GtU => (a as u64) > (b as u64),
                Cond::GeU => (a as u64) >= (b as u64),
                Cond::Any | Cond::None_ => return cond,
            };
            return if taken { Cond::Any } else { Cond::None_ };
        }
        cond
    }

    // ---- expressions ----

    /// Evaluate `e`, returning its vreg, or `None` for a `void`-typed result
    /// (a bare function call with no use, e.g.).
    fn lower_expr(&mut self, scope: ScopeId, e: &Expr) -> BResult<Option<VRegId>> {
        match &e.kind {
            ExprKind::IntLit(v) => Ok(Some(self.new_const(e.ty, *v))),
            ExprKind::FloatLit(v) => {
                let id = self.new_vreg(e.ty);
                self.vregs[id as usize].const_value = Some(v.to_bits() as i64);
                self.vregs[id as usize].flags |= vreg_flags::CONST;
                Ok(Some(id))
            }
            ExprKind::StrLit(label) => {
                let dst = self.new_vreg(e.ty);
                self.emit(Op::Iofs { dst, symbol: *label, exported: false });
                Ok(Some(dst))
            }
            ExprKind::Var(name, var_scope) => {
                if let Some(&v) = self.reg_locals.get(name) {
                    return Ok(Some(v));
                }
                if let Some(&(off, ty)) = self.frame_locals.get(name) {
                    let dst = self.new_vreg(TypeTable::pointer(ty));
                    self.emit(Op::Bofs { dst, frame_offset: off });
                    if is_array(ty) || is_struct(ty) {
                        return Ok(Some(dst)); // decays to its own address
                    }
                    let val = self.new_vreg(ty);
                    self.emit(Op::Load { dst: val, addr: dst, size: self.types.size_of(ty).min(8) as u8 });
                    return Ok(Some(val));
                }
                let info = self
                    .scopes
                    .resolve(*var_scope, *name)
                    .ok_or_else(|| IrError(format!("unresolved variable '{name}' reached the IR builder")))?;
                let exported = matches!(info.storage, StorageClass::Extern);
                let addr = self.new_vreg(TypeTable::pointer(info.ty));
                self.emit(Op::Iofs { dst: addr, symbol: *name, exported });
                if is_array(info.ty) || is_struct(info.ty) {
                    return Ok(Some(addr));
                }
                let val = self.new_vreg(info.ty);
                self.emit(Op::Load { dst: val, addr, size: self.types.size_of(info.ty).min(8) as u8 });
                Ok(Some(val))
            }
            ExprKind::BOp(BOp::LogAnd | BOp::LogOr, ..) => {
                // Materialise a boolean from short-circuit evaluation: two
                // predecessor moves into a shared result vreg merging at a
                // join block.
                let tt = self.new_block();
                let ff = self.new_block();
                let join = self.new_block();
                self.lower_cond_jump(scope, e, tt, ff)?;
                let result = self.new_vreg(TypeTable::fixnum(4, true));
                self.cur = tt;
                let one = self.new_const(TypeTable::fixnum(4, true), 1);
                self.emit(Op::Mov { dst: result, src: one });
                self.emit(Op::Jump(join));
                self.cur = ff;
                let zero = self.new_const(TypeTable::fixnum(4, true), 0);
                self.emit(Op::Mov { dst: result, src: zero });
                self.emit(Op::Jump(join));
                self.cur = join;
                Ok(Some(result))
            }
            ExprKind::BOp(op, l, r) if Cond::is_comparison(*op) => {
                let lv = self.lower_expr(scope, l)?.expect("comparison operand");
                let rv = self.lower_expr(scope, r)?.expect("comparison operand");
                let unsigned = !is_signed(l.ty) || !is_signed(r.ty);
                let folded = self.fold_cond(Cond::from_bop(*op, unsigned).unwrap(), lv, rv);
                let dst = self.new_vreg(e.ty);
                self.emit(Op::Cmp { cond: folded, dst: Some(dst), lhs: lv, rhs: rv });
                Ok(Some(dst))
            }
            ExprKind::BOp(op, l, r) => {
                let lv = self.lower_expr(scope, l)?.expect("binop operand");
                let rv = self.lower_expr(scope, r)?.expect("binop operand");
                let dst = self.new_vreg(e.ty);
                self.emit(Op::Bin { op: *op, dst, lhs: lv, rhs: rv });
                Ok(Some(dst))
            }
            ExprKind::UOp(op, inner) => {
                let v = self.lower_expr(scope, inner)?.expect("unop operand");
                let dst = self.new_vreg(e.ty);
                self.emit(Op::Un { op: *op, dst, src: v });
                Ok(Some(dst))
            }
            ExprKind::IncDec { pre, delta, target } => {
                let addr = self.lower_lvalue(scope, target)?;
                let old = self.load_lvalue(target.ty, &addr)?;
                let delta_v = self.new_const(target.ty, *delta);
                let new = self.new_vreg(target.ty);
                self.emit(Op::Bin { op: BOp::Add, dst: new, lhs: old, rhs: delta_v });
                self.store_lvalue(target.ty, &addr, new)?;
                Ok(Some(if *pre { new } else { old }))
            }
            ExprKind::Assign(lhs, rhs) => {
                let rv = self.lower_expr(scope, rhs)?.expect("assignment value");
                self.lower_assign(scope, lhs, rv)?;
                Ok(Some(rv))
            }
            ExprKind::Modify(op, lhs, rhs) => {
                let addr = self.lower_lvalue(scope, lhs)?;
                let old = self.load_lvalue(lhs.ty, &addr)?;
                let rv = self.lower_expr(scope, rhs)?.expect("modify operand");
                let new = self.new_vreg(lhs.ty);
                self.emit(Op::Bin { op: *op, dst: new, lhs: old, rhs: rv });
                self.store_lvalue(lhs.ty, &addr, new)?;
                Ok(Some(new))
            }
            ExprKind::Ternary(cond, tt, ff) => {
                let tt_bb = self.new_block();
                let ff_bb = self.new_block();
                let join = self.new_block();
                self.lower_cond_jump(scope, cond, tt_bb, ff_bb)?;
                let result = self.new_vreg(e.ty);
                self.cur = tt_bb;
                let tv = self.lower_expr(scope, tt)?.expect("ternary branch");
                self.emit(Op::Mov { dst: result, src: tv });
                self.emit(Op::Jump(join));
                self.cur = ff_bb;
                let fv = self.lower_expr(scope, ff)?.expect("ternary branch");
                self.emit(Op::Mov { dst: result, src: fv });
                self.emit(Op::Jump(join));
                self.cur = join;
                Ok(Some(result))
            }
            ExprKind::Cast(ty, inner) => {
                let v = self.lower_expr(scope, inner)?.expect("cast operand");
                if self.types.size_of(*ty) == self.types.size_of(inner.ty)
                    && is_flonum(*ty) == is_flonum(inner.ty)
                {
                    return Ok(Some(v));
                }
                let dst = self.new_vreg(*ty);
                self.emit(Op::Cast { dst, src: v });
                Ok(Some(dst))
            }
            ExprKind::Ref(inner) => {
                let addr = self.lower_lvalue(scope, inner)?;
                if matches!(addr, LValue::Bitfield { .. }) {
                    return Err(IrError("cannot take the address of a bit-field".into()));
                }
                let a = addr.addr_vreg();
                self.vregs[a as usize].flags |= vreg_flags::REF_TAKEN;
                Ok(Some(a))
            }
            ExprKind::Deref(inner) => {
                let v = self.lower_expr(scope, inner)?.expect("deref operand");
                let dst = self.new_vreg(e.ty);
                self.emit(Op::Load { dst, addr: v, size: self.types.size_of(e.ty).min(8) as u8 });
                Ok(Some(dst))
            }
            ExprKind::Member { .. } | ExprKind::Subscript(..) => {
                let addr = self.lower_lvalue(scope, e)?;
                Ok(Some(self.load_lvalue(e.ty, &addr)?))
            }
            ExprKind::Call { callee, args } => self.lower_call(scope, e.ty, callee, args),
            ExprKind::CompoundLiteral { ty, init } => {
                let off = self.alloc_frame(self.types.size_of(*ty), self.types.align_of(*ty));
                for leaf in init.iter().flat_map(|i| crate::front::lower::flatten_init(self.types, *ty, i)) {
                    let v = self.lower_expr(scope, &leaf.expr)?.expect("compound literal element");
                    let addr = self.new_vreg(TypeTable::pointer(leaf.ty));
                    self.emit(Op::Bofs { dst: addr, frame_offset: off + leaf.offset as i32 });
                    self.emit(Op::Store { addr, src: v, size: self.types.size_of(leaf.ty).min(8) as u8 });
                }
                let dst = self.new_vreg(TypeTable::pointer(*ty));
                self.emit(Op::Bofs { dst, frame_offset: off });
                Ok(Some(dst))
            }
            ExprKind::Comma(l, r) => {
                self.lower_expr(scope, l)?;
                self.lower_expr(scope, r)
            }
            ExprKind::Block(stmts, tail) => {
                for s in stmts {
                    self.lower_stmt(scope, s)?;
                }
                self.lower_expr(scope, tail)
            }
        }
    }

    /// Arguments that might clobber calling-convention scratch registers get
    /// hoisted into a temporary before the call sequence starts, so
    /// left-to-right evaluation order doesn't depend on
    /// the order the backend happens to emit pusharg/call in.
    fn needs_temp(e: &Expr) -> bool {
        matches!(
            e.kind,
            ExprKind::Ternary(..)
                | ExprKind::Call { .. }
                | ExprKind::BOp(BOp::LogAnd | BOp::LogOr, ..)
                | ExprKind::BOp(BOp::Mul | BOp::Div, ..)
                | ExprKind::CompoundLiteral { .. }
                | ExprKind::IncDec { .. }
                | ExprKind::Block(..)
        )
    }

    fn lower_call(&mut self, scope: ScopeId, ret_ty: Ty, callee: &Expr, args: &[Expr]) -> BResult<Option<VRegId>> {
        let mut arg_vals = Vec::with_capacity(args.len());
        for a in args {
            if Self::needs_temp(a) {
                let v = self.lower_expr(scope, a)?.expect("call argument");
                let off = self.alloc_frame(self.types.size_of(a.ty).max(8), 8);
                let addr = self.new_vreg(TypeTable::pointer(a.ty));
                self.emit(Op::Bofs { dst: addr, frame_offset: off });
                self.emit(Op::Store { addr, src: v, size: self.types.size_of(a.ty).min(8) as u8 });
                let reloaded = self.new_vreg(a.ty);
                self.emit(Op::Load { dst: reloaded, addr, size: self.types.size_of(a.ty).min(8) as u8 });
                arg_vals.push(reloaded);
            } else {
                arg_vals.push(self.lower_expr(scope, a)?.expect("call argument"));
            }
        }

        let mut stack_bytes = 0u32;
        let mut int_idx = 0usize;
        let mut float_idx = 0usize;
        for &v in &arg_vals {
            let is_float = self.vregs[v as usize].is_flonum();
            let size = self.vregs[v as usize].size as u32;
            let class_idx = if is_float { float_idx } else { int_idx };
            match crate::middle::callconv::classify_arg(is_float, class_idx, &mut stack_bytes, size) {
                crate::middle::callconv::ArgSlot::IntReg(_) => int_idx += 1,
                crate::middle::callconv::ArgSlot::FloatReg(_) => float_idx += 1,
                crate::middle::callconv::ArgSlot::Stack(_) => {}
            }
        }

        self.emit(Op::Precall { stack_arg_bytes: stack_bytes });
        for (i, &v) in arg_vals.iter().enumerate() {
            self.emit(Op::PushArg { index: i as u32, src: v });
        }

        let target = match &callee.kind {
            ExprKind::Var(name, _) if self.scopes.resolve(scope, *name).map(|i| is_function(i.ty)).unwrap_or(false) => {
                Callee::Direct(*name)
            }
            _ => Callee::Indirect(self.lower_expr(scope, callee)?.expect("callee")),
        };

        let dst = if matches!(&*ret_ty, TypeKind::Void) { None } else { Some(self.new_vreg(ret_ty)) };
        self.emit(Op::Call {
            dst,
            callee: target,
            n_args: arg_vals.len() as u32,
            n_reg_args: (int_idx + float_idx) as u32,
            vaarg_start: None,
        });
        Ok(dst)
    }

    // ---- lvalues ----

    fn lower_lvalue(&mut self, scope: ScopeId, e: &Expr) -> BResult<LValue> {
        match &e.kind {
            ExprKind::Var(name, _) if self.reg_locals.contains_key(name) => Ok(LValue::Reg(self.reg_locals[name])),
            ExprKind::Var(name, _) if self.frame_locals.contains_key(name) => {
                let (off, _) = self.frame_locals[name];
                let addr = self.new_vreg(TypeTable::pointer(e.ty));
                self.emit(Op::Bofs { dst: addr, frame_offset: off });
                Ok(LValue::Addr(addr))
            }
            ExprKind::Var(name, var_scope) => {
                let info = self
                    .scopes
                    .resolve(*var_scope, *name)
                    .ok_or_else(|| IrError(format!("unresolved variable '{name}'")))?;
                let exported = matches!(info.storage, StorageClass::Extern);
                let addr = self.new_vreg(TypeTable::pointer(info.ty));
                self.emit(Op::Iofs { dst: addr, symbol: *name, exported });
                Ok(LValue::Addr(addr))
            }
            ExprKind::Deref(inner) => {
                let v = self.lower_expr(scope, inner)?.expect("deref target");
                Ok(LValue::Addr(v))
            }
            ExprKind::Member { base, field, arrow } => {
                let base_addr = if *arrow {
                    self.lower_expr(scope, base)?.expect("member base")
                } else {
                    self.lvalue_addr(scope, base)?
                };
                let struct_ty = if *arrow { pointee(decay(base.ty)).unwrap_or(base.ty) } else { base.ty };
                let f = self
                    .types
                    .find_field(struct_ty, *field)
                    .ok_or_else(|| IrError(format!("no field '{field}' in this struct")))?;
                let addr = self.new_vreg(TypeTable::pointer(f.ty));
                let off = self.new_const(TypeTable::fixnum(8, true), f.offset as i64);
                self.emit(Op::Bin { op: BOp::Add, dst: addr, lhs: base_addr, rhs: off });
                if let Some(bf) = f.bitfield {
                    return Ok(LValue::Bitfield { addr, storage_ty: f.ty, bit_offset: bf.bit_offset, width: bf.width });
                }
                Ok(LValue::Addr(addr))
            }
            ExprKind::Subscript(base, idx) => {
                let base_v = self.lower_expr(scope, base)?.expect("subscript base");
                let idx_v = self.lower_expr(scope, idx)?.expect("subscript index");
                let esize = self.types.size_of(e.ty).max(1) as i64;
                let scaled = if esize == 1 {
                    idx_v
                } else {
                    let size_lit = self.new_const(TypeTable::fixnum(8, true), esize);
                    let s = self.new_vreg(TypeTable::fixnum(8, true));
                    self.emit(Op::Bin { op: BOp::Mul, dst: s, lhs: idx_v, rhs: size_lit });
                    s
                };
                let addr = self.new_vreg(TypeTable::pointer(e.ty));
                self.emit(Op::Bin { op: BOp::Add, dst: addr, lhs: base_v, rhs: scaled });
                Ok(LValue::Addr(addr))
            }
            _ => Err(IrError("expression is not an lvalue".into())),
        }
    }

    fn lvalue_addr(&mut self, scope: ScopeId, e: &Expr) -> BResult<VRegId> {
        let lv = self.lower_lvalue(scope, e)?;
        Ok(lv.addr_vreg())
    }

    fn load_lvalue(&mut self, ty: Ty, lv: &LValue) -> BResult<VRegId> {
        match lv {
            LValue::Reg(v) => Ok(*v),
            LValue::Addr(addr) => {
                let dst = self.new_vreg(ty);
                self.emit(Op::Load { dst, addr: *addr, size: self.types.size_of(ty).min(8) as u8 });
                Ok(dst)
            }
            LValue::Bitfield { addr, storage_ty, bit_offset, width } => {
                let (storage_ty, bit_offset, width) = (*storage_ty, *bit_offset, *width);
                let storage_size = self.types.size_of(storage_ty).min(8) as u8;
                let total_bits = storage_size as i64 * 8;
                let raw = self.new_vreg(storage_ty);
                self.emit(Op::Load { dst: raw, addr: *addr, size: storage_size });

                // Extract by shifting the field's high bit to the storage
                // type's sign bit and back: this both isolates the field and
                // sign-extends it when the storage type is signed, since
                // `Shr` on a signed vreg lowers to an arithmetic shift.
                let lshift_amt = total_bits - bit_offset as i64 - width as i64;
                let shifted = if lshift_amt > 0 {
                    let amt = self.new_const(storage_ty, lshift_amt);
                    let d = self.new_vreg(storage_ty);
                    self.emit(Op::Bin { op: BOp::Shl, dst: d, lhs: raw, rhs: amt });
                    d
                } else {
                    raw
                };
                let rshift_amt = total_bits - width as i64;
                let extracted = if rshift_amt > 0 {
                    let amt = self.new_const(storage_ty, rshift_amt);
                    let d = self.new_vreg(storage_ty);
                    self.emit(Op::Bin { op: BOp::Shr, dst: d, lhs: shifted, rhs: amt });
                    d
                } else {
                    shifted
                };
                if storage_ty == ty {
                    Ok(extracted)
                } else {
                    let dst = self.new_vreg(ty);
                    self.emit(Op::Cast { dst, src: extracted });
                    Ok(dst)
                }
            }
        }
    }

    fn store_lvalue(&mut self, ty: Ty, lv: &LValue, value: VRegId) -> BResult<()> {
        match lv {
            LValue::Reg(v) => {
                self.emit(Op::Mov { dst: *v, src: value });
            }
            LValue::Addr(addr) => {
                self.emit(Op::Store { addr: *addr, src: value, size: self.types.size_of(ty).min(8) as u8 });
            }
            LValue::Bitfield { addr, storage_ty, bit_offset, width } => {
                let (storage_ty, bit_offset, width) = (*storage_ty, *bit_offset, *width);
                let storage_size = self.types.size_of(storage_ty).min(8) as u8;
                let raw = self.new_vreg(storage_ty);
                self.emit(Op::Load { dst: raw, addr: *addr, size: storage_size });

                let field_mask_val: i64 = if width >= 64 { -1 } else { (1i64 << width) - 1 };
                let clear_const = self.new_const(storage_ty, !(field_mask_val << bit_offset));
                let cleared = self.new_vreg(storage_ty);
                self.emit(Op::Bin { op: BOp::BitAnd, dst: cleared, lhs: raw, rhs: clear_const });

                let narrowed = if storage_ty == ty {
                    value
                } else {
                    let d = self.new_vreg(storage_ty);
                    self.emit(Op::Cast { dst: d, src: value });
                    d
                };
                let field_mask = self.new_const(storage_ty, field_mask_val);
                let masked = self.new_vreg(storage_ty);
                self.emit(Op::Bin { op: BOp::BitAnd, dst: masked, lhs: narrowed, rhs: field_mask });
                let shifted = if bit_offset > 0 {
                    let amt = self.new_const(storage_ty, bit_offset as i64);
                    let d = self.new_vreg(storage_ty);
                    self.emit(Op::Bin { op: BOp::Shl, dst: d, lhs: masked, rhs: amt });
                    d
                } else {
                    masked
                };
                let combined = self.new_vreg(storage_ty);
                self.emit(Op::Bin { op: BOp::BitOr, dst: combined, lhs: cleared, rhs: shifted });
                self.emit(Op::Store { addr: *addr, src: combined, size: storage_size });
            }
        }
        Ok(())
    }

    /// Assignment. Scalars kept in a register get a `mov`; anything else
    /// (including struct assignment, lowered to a `memcpy` call) computes an
    /// address and stores.
    fn lower_assign(&mut self, scope: ScopeId, lhs: &Expr, rv: VRegId) -> BResult<()> {
        if is_struct(lhs.ty) {
            let dst_addr = self.lvalue_addr(scope, lhs)?;
            let size = self.new_const(TypeTable::fixnum(8, true), self.types.size_of(lhs.ty) as i64);
            self.emit(Op::Precall { stack_arg_bytes: 0 });
            self.emit(Op::PushArg { index: 0, src: dst_addr });
            self.emit(Op::PushArg { index: 1, src: rv });
            self.emit(Op::PushArg { index: 2, src: size });
            self.emit(Op::Call {
                dst: None,
                callee: Callee::Direct(intern("memcpy")),
                n_args: 3,
                n_reg_args: 3,
                vaarg_start: None,
            });
            return Ok(());
        }
        let addr = self.lower_lvalue(scope, lhs)?;
        self.store_lvalue(lhs.ty, &addr, rv)
    }
}

enum LValue {
    /// A scalar local kept entirely in a vreg: assignment is a `mov`.
    Reg(VRegId),
    /// A computed address: assignment is a `store`.
    Addr(VRegId),
    /// A bit-field member: `addr` points at the start of the storage unit;
    /// reads/writes go through mask-and-shift rather than a plain load/store.
    Bitfield { addr: VRegId, storage_ty: Ty, bit_offset: u8, width: u8 },
}

impl LValue {
    fn addr_vreg(&self) -> VRegId {
        match self {
            LValue::Addr(a) => *a,
            LValue::Reg(v) => *v,
            LValue::Bitfield { addr, .. } => *addr,
        }
    }
}

fn is_function(ty: Ty) -> bool {
    matches!(&*strip_qualifiers(ty), TypeKind::Function { .. })
}

fn round_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align.max(1) * align.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lower(src: &str) -> tir::Program {
        let (program, types) = crate::front::parse(src, 8).expect("parse");
        build_program(&program, &types).expect("build IR")
    }

    fn all_ops(f: &tir::Function) -> Vec<&Op> {
        f.blocks.iter().flat_map(|bb| bb.ops.iter()).collect()
    }

    #[test]
    fn short_circuit_and_materializes_through_a_join_block() {
        let ir = lower("int f(int a, int b){ return a && b; }");
        let f = &ir.functions[0];
        assert!(f.blocks.len() >= 3, "expected separate true/false/join blocks");
        let ops = all_ops(f);
        let movs_of_bool_consts = ops
            .iter()
            .filter(|op| matches!(op, Op::Mov { .. }))
            .count();
        assert!(movs_of_bool_consts >= 2, "expected a 0/1 materializing mov in each predecessor");
    }

    #[test]
    fn short_circuit_or_never_evaluates_via_a_bitwise_op() {
        let ir = lower("int f(int a, int b){ return a || b; }");
        let f = &ir.functions[0];
        let ops = all_ops(f);
        assert!(
            !ops.iter().any(|op| matches!(op, Op::Bin { op: BOp::BitOr, .. })),
            "|| must short-circuit via branches, not collapse to a bitwise or"
        );
        assert!(f.blocks.len() >= 3);
    }

    #[test]
    fn ternary_merges_both_arms_into_one_result_vreg() {
        let ir = lower("int f(int a){ return a ? 1 : 2; }");
        let f = &ir.functions[0];
        let ops = all_ops(f);
        let dsts: std::collections::HashSet<VRegId> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Mov { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect();
        assert!(dsts.len() <= 2, "both ternary arms should move into the same result vreg, not separate ones");
        assert!(f.blocks.len() >= 3, "expected true/false/join blocks");
    }

    #[test]
    fn bitfield_read_extracts_with_shift_and_write_preserves_neighboring_bits() {
        let ir = lower(
            "struct s { unsigned a : 3; unsigned b : 5; };
             int f(struct s *p){ p->b = 7; return p->a; }",
        );
        let f = &ir.functions[0];
        let ops = all_ops(f);
        assert!(
            ops.iter().any(|op| matches!(op, Op::Bin { op: BOp::Shr, .. })),
            "reading a bitfield must shift the storage unit to isolate the field"
        );
        assert!(
            ops.iter().any(|op| matches!(op, Op::Bin { op: BOp::BitAnd, .. })),
            "writing a bitfield must mask out the field's own bits before merging the new value"
        );
        assert!(
            ops.iter().any(|op| matches!(op, Op::Bin { op: BOp::BitOr, .. })),
            "writing a bitfield must or the shifted new value back into the storage unit"
        );
    }
}
