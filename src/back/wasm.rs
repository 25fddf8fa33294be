//! The WebAssembly backend: walks the AST directly (it does not go through
//! [`crate::middle::tir`]) and emits a binary `.wasm` module. Scalar
//! functions only: aggregates, address-of, and pointer arithmetic are out of
//! scope for this target, since the only consumer is a handful of exported
//! scalar functions.
//!
//! Locals are keyed by name alone rather than by `(name, scope)`: two
//! sibling blocks declaring a same-named local would collide. The front end
//! doesn't currently exercise that case for functions targeted at this
//! backend, but a real implementation would key on `ScopeId` too.

use crate::back::leb128::{with_length_prefix, write_s, write_u};
use crate::common::{Id, Map};
use crate::front::ast::*;
use crate::front::types::*;

const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

const SEC_TYPE: u8 = 1;
const SEC_FUNCTION: u8 = 3;
const SEC_GLOBAL: u8 = 6;
const SEC_EXPORT: u8 = 7;
const SEC_CODE: u8 = 10;

const VAL_I32: u8 = 0x7f;
const VAL_I64: u8 = 0x7e;
const VAL_F32: u8 = 0x7d;
const VAL_F64: u8 = 0x7c;

#[derive(Debug, Clone)]
pub struct WasmError(pub String);

impl std::fmt::Display for WasmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wasm emit error: {}", self.0)
    }
}

/// Emits a complete binary module for every function and global in
/// `program`, exporting each one the front-end marked non-static.
pub fn emit_module(program: &Program) -> Result<Vec<u8>, WasmError> {
    let mut type_entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new(); // (params, results)
    let mut type_index: Vec<u32> = Vec::new();
    let mut func_indices: Map<Id, u32> = Map::new();

    for (i, f) in program.functions.iter().enumerate() {
        func_indices.insert(f.name, i as u32);
        let TypeKind::Function { ret, params, .. } = &*f.ty else {
            return Err(WasmError(format!("'{}' is not a function type", f.name)));
        };
        let param_vals: Vec<u8> = params.iter().map(|t| valtype(*t)).collect::<Result<_, _>>()?;
        let result_vals: Vec<u8> = if matches!(&*strip_qualifiers(*ret), TypeKind::Void) {
            vec![]
        } else {
            vec![valtype(*ret)?]
        };
        let idx = intern_type(&mut type_entries, param_vals, result_vals);
        type_index.push(idx);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION);

    write_section(&mut out, SEC_TYPE, &encode_type_section(&type_entries));
    write_section(&mut out, SEC_FUNCTION, &encode_function_section(&type_index));

    let mut global_indices: Map<Id, u32> = Map::new();
    for (i, g) in program.globals.iter().enumerate() {
        global_indices.insert(g.name, i as u32);
    }
    if !program.globals.is_empty() {
        write_section(&mut out, SEC_GLOBAL, &encode_global_section(program)?);
    }
    write_section(&mut out, SEC_EXPORT, &encode_export_section(program, &func_indices, &global_indices));

    let mut code_bodies = Vec::new();
    for f in &program.functions {
        let body = f.body.as_ref().ok_or_else(|| WasmError(format!("'{}' has no body", f.name)))?;
        let mut emitter = FuncEmitter::new(&func_indices, &global_indices, f)?;
        emitter.emit_stmt(body)?;
        emitter.bytes.push(0x0b); // end
        code_bodies.push(emitter.finish());
    }
    write_section(&mut out, SEC_CODE, &encode_code_section(&code_bodies));

    Ok(out)
}

fn write_section(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    out.push(id);
    out.extend(with_length_prefix(payload));
}

fn intern_type(entries: &mut Vec<(Vec<u8>, Vec<u8>)>, params: Vec<u8>, results: Vec<u8>) -> u32 {
    if let Some(i) = entries.iter().position(|(p, r)| *p == params && *r == results) {
        return i as u32;
    }
    entries.push((params, results));
    (entries.len() - 1) as u32
}

fn valtype(ty: Ty) -> Result<u8, WasmError> {
    let ty = strip_qualifiers(ty);
    Ok(match &*ty {
        TypeKind::Fixnum { size, .. } if *size <= 4 => VAL_I32,
        TypeKind::Fixnum { .. } => VAL_I64,
        TypeKind::Flonum { size } if *size == 4 => VAL_F32,
        TypeKind::Flonum { .. } => VAL_F64,
        TypeKind::Pointer(_) => VAL_I32,
        other => return Err(WasmError(format!("{other:?} has no scalar wasm representation"))),
    })
}

fn is_wide(ty: Ty) -> bool {
    matches!(valtype(ty), Ok(VAL_I64))
}

fn encode_type_section(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    write_u(&mut body, entries.len() as u64);
    for (params, results) in entries {
        body.push(0x60); // func type tag
        write_u(&mut body, params.len() as u64);
        body.extend(params);
        write_u(&mut body, results.len() as u64);
        body.extend(results);
    }
    body
}

fn encode_function_section(type_index: &[u32]) -> Vec<u8> {
    let mut body = Vec::new();
    write_u(&mut body, type_index.len() as u64);
    for &i in type_index {
        write_u(&mut body, i as u64);
    }
    body
}

fn encode_global_section(program: &Program) -> Result<Vec<u8>, WasmError> {
    let mut body = Vec::new();
    write_u(&mut body, program.globals.len() as u64);
    for g in &program.globals {
        let vt = valtype(g.ty)?;
        body.push(vt);
        body.push(0x01); // mutable
        let init_value = g.init.as_ref().and_then(const_int).unwrap_or(0);
        match vt {
            VAL_I64 => {
                body.push(0x42); // i64.const
                write_s(&mut body, init_value);
            }
            _ => {
                body.push(0x41); // i32.const
                write_s(&mut body, init_value);
            }
        }
        body.push(0x0b); // end
    }
    Ok(body)
}

fn const_int(init: &Init) -> Option<i64> {
    match init {
        Init::Expr(e) => match &e.kind {
            ExprKind::IntLit(v) => Some(*v),
            _ => None,
        },
        Init::List(_) => None,
    }
}

fn encode_export_section(program: &Program, funcs: &Map<Id, u32>, globals: &Map<Id, u32>) -> Vec<u8> {
    let mut entries: Vec<(String, u8, u32)> = Vec::new();
    for f in &program.functions {
        if !f.is_static {
            entries.push((f.name.to_string(), 0x00, funcs[&f.name]));
        }
    }
    for g in &program.globals {
        if !g.is_static {
            entries.push((g.name.to_string(), 0x03, globals[&g.name]));
        }
    }
    let mut body = Vec::new();
    write_u(&mut body, entries.len() as u64);
    for (name, kind, idx) in entries {
        write_u(&mut body, name.len() as u64);
        body.extend(name.as_bytes());
        body.push(kind);
        write_u(&mut body, idx as u64);
    }
    body
}

fn encode_code_section(bodies: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    write_u(&mut out, bodies.len() as u64);
    for b in bodies {
        out.extend(with_length_prefix(b));
    }
    out
}

struct FuncEmitter<'a> {
    funcs: &'a Map<Id, u32>,
    globals: &'a Map<Id, u32>,
    locals: Map<Id, (u32, u8)>, // index, valtype
    bytes: Vec<u8>,
    local_decls: Vec<u8>,
    break_depth: Vec<u32>,
    continue_depth: Vec<u32>,
    depth: u32,
}

impl<'a> FuncEmitter<'a> {
    fn new(
        funcs: &'a Map<Id, u32>,
        globals: &'a Map<Id, u32>,
        f: &FunctionDecl,
    ) -> Result<FuncEmitter<'a>, WasmError> {
        let mut locals = Map::new();
        let mut next = 0u32;
        let mut decl_types = Vec::new();
        for p in &f.params {
            let vt = valtype(p.ty)?;
            locals.insert(p.name, (next, vt));
            next += 1;
            decl_types.push(vt);
        }
        let n_params = decl_types.len();
        if let Some(body) = &f.body {
            collect_locals(body, &mut locals, &mut next, &mut decl_types)?;
        }

        let mut local_decls = Vec::new();
        let runs = run_length(&decl_types[n_params..]);
        write_u(&mut local_decls, runs.len() as u64);
        for (count, vt) in runs {
            write_u(&mut local_decls, count as u64);
            local_decls.push(vt);
        }

        Ok(FuncEmitter {
            funcs,
            globals,
            locals,
            bytes: Vec::new(),
            local_decls,
            break_depth: Vec::new(),
            continue_depth: Vec::new(),
            depth: 0,
        })
    }

    fn finish(self) -> Vec<u8> {
        let mut out = self.local_decls;
        out.extend(self.bytes);
        with_length_prefix(&out)
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), WasmError> {
        match stmt {
            Stmt::Block(_scope, stmts) => {
                for s in stmts {
                    self.emit_stmt(s)?;
                }
            }
            Stmt::Expr(e) => {
                self.emit_expr(e)?;
                if !matches!(&*strip_qualifiers(e.ty), TypeKind::Void) {
                    self.bytes.push(0x1a); // drop
                }
            }
            Stmt::Return(Some(e)) => {
                self.emit_expr(e)?;
                self.bytes.push(0x0f); // return
            }
            Stmt::Return(None) => {
                self.bytes.push(0x0f);
            }
            Stmt::VarDecl(decls) => {
                for decl in decls {
                    if let Some(Init::Expr(e)) = &decl.init {
                        self.emit_expr(e)?;
                        self.local_set(decl.name)?;
                    }
                }
            }
            Stmt::If { cond, tt, ff } => {
                self.emit_expr(cond)?;
                self.bytes.push(0x04); // if
                self.bytes.push(0x40); // empty blocktype
                self.depth += 1;
                self.emit_stmt(tt)?;
                if let Some(e) = ff {
                    self.bytes.push(0x05); // else
                    self.emit_stmt(e)?;
                }
                self.bytes.push(0x0b); // end
                self.depth -= 1;
            }
            Stmt::While { cond, body } => self.emit_loop(Some(cond), body)?,
            Stmt::DoWhile { body, cond } => self.emit_do_while(body, cond)?,
            Stmt::For { init, cond, step, body } => {
                if let Some(i) = init {
                    self.emit_stmt(i)?;
                }
                self.emit_for_loop(cond.as_ref(), step.as_ref(), body)?;
            }
            Stmt::Break => {
                let d = *self.break_depth.last().ok_or_else(|| WasmError("break outside loop".into()))?;
                self.bytes.push(0x0c); // br
                write_u(&mut self.bytes, (self.depth - d) as u64);
            }
            Stmt::Continue => {
                let d = *self.continue_depth.last().ok_or_else(|| WasmError("continue outside loop".into()))?;
                self.bytes.push(0x0c);
                write_u(&mut self.bytes, (self.depth - d) as u64);
            }
            Stmt::Empty | Stmt::Label(..) | Stmt::Goto(_) | Stmt::Case(..) | Stmt::Default(_) => {}
            Stmt::Switch { .. } => return Err(WasmError("switch is not supported in the wasm backend".into())),
            Stmt::Asm(_) => return Err(WasmError("inline asm is not supported in the wasm backend".into())),
        }
        Ok(())
    }

    /// `while (cond) body`: a `loop` that tests up front and branches out.
    fn emit_loop(&mut self, cond: Option<&Expr>, body: &Stmt) -> Result<(), WasmError> {
        self.bytes.push(0x03); // loop
        self.bytes.push(0x40);
        self.depth += 1;
        self.break_depth.push(self.depth);
        self.continue_depth.push(self.depth);

        if let Some(c) = cond {
            self.emit_expr(c)?;
            self.bytes.push(0x45); // i32.eqz
            self.bytes.push(0x0d); // br_if out of the loop
            write_u(&mut self.bytes, 0u64);
        }
        self.emit_stmt(body)?;
        self.bytes.push(0x0c); // br back to loop head
        write_u(&mut self.bytes, 0u64);
        self.bytes.push(0x0b); // end

        self.break_depth.pop();
        self.continue_depth.pop();
        self.depth -= 1;
        Ok(())
    }

    /// `do body while (cond)`: runs the body once unconditionally, then
    /// loops while the condition holds.
    fn emit_do_while(&mut self, body: &Stmt, cond: &Expr) -> Result<(), WasmError> {
        self.bytes.push(0x03); // loop
        self.bytes.push(0x40);
        self.depth += 1;
        self.break_depth.push(self.depth);
        self.continue_depth.push(self.depth);

        self.emit_stmt(body)?;
        self.emit_expr(cond)?;
        self.bytes.push(0x0d); // br_if back to loop head
        write_u(&mut self.bytes, 0u64);
        self.bytes.push(0x0b); // end

        self.break_depth.pop();
        self.continue_depth.pop();
        self.depth -= 1;
        Ok(())
    }

    fn emit_for_loop(&mut self, cond: Option<&Expr>, step: Option<&Expr>, body: &Stmt) -> Result<(), WasmError> {
        self.bytes.push(0x03);
        self.bytes.push(0x40);
        self.depth += 1;
        self.break_depth.push(self.depth);
        self.continue_depth.push(self.depth);

        if let Some(c) = cond {
            self.emit_expr(c)?;
            self.bytes.push(0x45);
            self.bytes.push(0x0d);
            write_u(&mut self.bytes, 0u64);
        }
        self.emit_stmt(body)?;
        if let Some(s) = step {
            self.emit_expr(s)?;
            if !matches!(&*strip_qualifiers(s.ty), TypeKind::Void) {
                self.bytes.push(0x1a);
            }
        }
        self.bytes.push(0x0c); // br back to loop head
        write_u(&mut self.bytes, 0u64);
        self.bytes.push(0x0b);

        self.break_depth.pop();
        self.continue_depth.pop();
        self.depth -= 1;
        Ok(())
    }

    fn local_set(&mut self, name: Id) -> Result<(), WasmError> {
        let (idx, _) = *self.locals.get(&name).ok_or_else(|| WasmError(format!("undeclared local '{name}'")))?;
        self.bytes.push(0x21); // local.set
        write_u(&mut self.bytes, idx as u64);
        Ok(())
    }

    fn emit_expr(&mut self, e: &Expr) -> Result<(), WasmError> {
        let is_i64 = is_wide(e.ty);
        match &e.kind {
            ExprKind::IntLit(v) => {
                self.bytes.push(if is_i64 { 0x42 } else { 0x41 });
                write_s(&mut self.bytes, *v);
            }
            ExprKind::FloatLit(v) => {
                if matches!(&*strip_qualifiers(e.ty), TypeKind::Flonum { size: 4 }) {
                    self.bytes.push(0x43);
                    self.bytes.extend_from_slice(&(*v as f32).to_le_bytes());
                } else {
                    self.bytes.push(0x44);
                    self.bytes.extend_from_slice(&v.to_le_bytes());
                }
            }
            ExprKind::Var(name, _scope) => {
                if let Some(&(idx, _)) = self.locals.get(name) {
                    self.bytes.push(0x20); // local.get
                    write_u(&mut self.bytes, idx as u64);
                } else if let Some(&idx) = self.globals.get(name) {
                    self.bytes.push(0x23); // global.get
                    write_u(&mut self.bytes, idx as u64);
                } else {
                    return Err(WasmError(format!("'{name}' is not bound")));
                }
            }
            ExprKind::BOp(op, lhs, rhs) => {
                let wide = is_wide(lhs.ty);
                let unsigned = !is_signed(lhs.ty) || !is_signed(rhs.ty);
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.bytes.push(bop_code(*op, wide, unsigned)?);
            }
            ExprKind::UOp(UOp::Neg, inner) => {
                self.bytes.push(if is_i64 { 0x42 } else { 0x41 });
                write_s(&mut self.bytes, 0);
                self.emit_expr(inner)?;
                self.bytes.push(if is_i64 { 0x7d } else { 0x6b });
            }
            ExprKind::UOp(UOp::LogNot, inner) => {
                self.emit_expr(inner)?;
                self.bytes.push(0x45); // i32.eqz
            }
            ExprKind::UOp(UOp::BitNot, inner) => {
                self.emit_expr(inner)?;
                self.bytes.push(if is_i64 { 0x42 } else { 0x41 });
                write_s(&mut self.bytes, -1);
                self.bytes.push(if is_i64 { 0x85 } else { 0x73 }); // xor
            }
            ExprKind::Assign(lhs, rhs) => {
                self.emit_expr(rhs)?;
                let idx = self.assign_target(lhs)?;
                self.bytes.push(0x22); // local.tee, leaves value on the stack
                write_u(&mut self.bytes, idx as u64);
            }
            ExprKind::Ternary(c, t, f) => {
                self.emit_expr(c)?;
                self.bytes.push(0x04);
                self.bytes.push(valtype(e.ty)?);
                self.emit_expr(t)?;
                self.bytes.push(0x05);
                self.emit_expr(f)?;
                self.bytes.push(0x0b);
            }
            ExprKind::Call { callee, args } => {
                let ExprKind::Var(name, _) = &callee.kind else {
                    return Err(WasmError("indirect calls are not supported in the wasm backend".into()));
                };
                for a in args {
                    self.emit_expr(a)?;
                }
                let idx = *self.funcs.get(name).ok_or_else(|| WasmError(format!("unknown function '{name}'")))?;
                self.bytes.push(0x10); // call
                write_u(&mut self.bytes, idx as u64);
            }
            ExprKind::Comma(a, b) => {
                self.emit_expr(a)?;
                if !matches!(&*strip_qualifiers(a.ty), TypeKind::Void) {
                    self.bytes.push(0x1a);
                }
                self.emit_expr(b)?;
            }
            ExprKind::Cast(to, inner) => {
                self.emit_expr(inner)?;
                self.emit_conversion(inner.ty, *to)?;
            }
            other => return Err(WasmError(format!("{other:?} has no wasm lowering"))),
        }
        Ok(())
    }

    fn assign_target(&self, lhs: &Expr) -> Result<u32, WasmError> {
        match &lhs.kind {
            ExprKind::Var(name, _) => self
                .locals
                .get(name)
                .map(|(i, _)| *i)
                .ok_or_else(|| WasmError(format!("'{name}' is not an assignable local in the wasm backend"))),
            _ => Err(WasmError("only simple local assignment is supported in the wasm backend".into())),
        }
    }

    fn emit_conversion(&mut self, from: Ty, to: Ty) -> Result<(), WasmError> {
        let from_v = valtype(from)?;
        let to_v = valtype(to)?;
        if from_v == to_v {
            return Ok(());
        }
        let op = match (from_v, to_v) {
            (VAL_I32, VAL_I64) => 0xac, // i64.extend_i32_s
            (VAL_I64, VAL_I32) => 0xa7, // i32.wrap_i64
            (VAL_I32, VAL_F64) => 0xb7, // f64.convert_i32_s
            (VAL_F64, VAL_I32) => 0xaa, // i32.trunc_f64_s
            (VAL_F32, VAL_F64) => 0xbb, // f64.promote_f32
            (VAL_F64, VAL_F32) => 0xb6, // f32.demote_f64
            _ => return Err(WasmError("unsupported wasm value conversion".into())),
        };
        self.bytes.push(op);
        Ok(())
    }
}

/// `unsigned` only matters for the ops with distinct `_s`/`_u` encodings
/// (compare, div, mod, shr); it's ignored everywhere else, the same way
/// `x86-64`'s `Cond::LtU`-style variants only exist for those operations.
fn bop_code(op: BOp, is_i64: bool, unsigned: bool) -> Result<u8, WasmError> {
    Ok(match (op, is_i64) {
        (BOp::Add, false) => 0x6a,
        (BOp::Add, true) => 0x7c,
        (BOp::Sub, false) => 0x6b,
        (BOp::Sub, true) => 0x7d,
        (BOp::Mul, false) => 0x6c,
        (BOp::Mul, true) => 0x7e,
        (BOp::Div, false) => if unsigned { 0x6e } else { 0x6d },
        (BOp::Div, true) => if unsigned { 0x80 } else { 0x7f },
        (BOp::Mod, false) => if unsigned { 0x70 } else { 0x6f },
        (BOp::Mod, true) => if unsigned { 0x82 } else { 0x81 },
        (BOp::BitAnd, false) => 0x71,
        (BOp::BitAnd, true) => 0x83,
        (BOp::BitOr, false) => 0x72,
        (BOp::BitOr, true) => 0x84,
        (BOp::BitXor, false) => 0x73,
        (BOp::BitXor, true) => 0x85,
        (BOp::Shl, false) => 0x74,
        (BOp::Shl, true) => 0x86,
        (BOp::Shr, false) => if unsigned { 0x76 } else { 0x75 },
        (BOp::Shr, true) => if unsigned { 0x88 } else { 0x87 },
        (BOp::Eq, false) => 0x46,
        (BOp::Eq, true) => 0x51,
        (BOp::Ne, false) => 0x47,
        (BOp::Ne, true) => 0x52,
        (BOp::Lt, false) => if unsigned { 0x49 } else { 0x48 },
        (BOp::Lt, true) => if unsigned { 0x54 } else { 0x53 },
        (BOp::Le, false) => if unsigned { 0x4d } else { 0x4c },
        (BOp::Le, true) => if unsigned { 0x58 } else { 0x57 },
        (BOp::Gt, false) => if unsigned { 0x4b } else { 0x4a },
        (BOp::Gt, true) => if unsigned { 0x56 } else { 0x55 },
        (BOp::Ge, false) => if unsigned { 0x4f } else { 0x4e },
        (BOp::Ge, true) => if unsigned { 0x5a } else { 0x59 },
        (BOp::LogAnd, _) | (BOp::LogOr, _) => {
            return Err(WasmError("short-circuit operators must be lowered before wasm emission".into()))
        }
    })
}

fn run_length(vts: &[u8]) -> Vec<(u32, u8)> {
    let mut runs = Vec::new();
    for &vt in vts {
        match runs.last_mut() {
            Some((count, last)) if *last == vt => *count += 1,
            _ => runs.push((1, vt)),
        }
    }
    runs
}

fn collect_locals(
    stmt: &Stmt,
    locals: &mut Map<Id, (u32, u8)>,
    next: &mut u32,
    decl_types: &mut Vec<u8>,
) -> Result<(), WasmError> {
    match stmt {
        Stmt::Block(_scope, stmts) => {
            for s in stmts {
                collect_locals(s, locals, next, decl_types)?;
            }
        }
        Stmt::VarDecl(decls) => {
            for decl in decls {
                let vt = valtype(decl.ty)?;
                locals.insert(decl.name, (*next, vt));
                *next += 1;
                decl_types.push(vt);
            }
        }
        Stmt::If { tt, ff, .. } => {
            collect_locals(tt, locals, next, decl_types)?;
            if let Some(e) = ff {
                collect_locals(e, locals, next, decl_types)?;
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => collect_locals(body, locals, next, decl_types)?,
        Stmt::For { init, body, .. } => {
            if let Some(i) = init {
                collect_locals(i, locals, next, decl_types)?;
            }
            collect_locals(body, locals, next, decl_types)?;
        }
        Stmt::Label(_, inner) => collect_locals(inner, locals, next, decl_types)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_length_merges_adjacent_equal_types() {
        assert_eq!(run_length(&[VAL_I32, VAL_I32, VAL_F64]), vec![(2, VAL_I32), (1, VAL_F64)]);
    }

    #[test]
    fn header_matches_wasm_magic_and_version() {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION);
        assert_eq!(out, vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]);
    }
}
