//! AST-level validation and desugaring that runs between parsing and IR
//! building.
//!
//! The parser already rewrites pointer arithmetic and compound assignment as
//! it builds expressions, since those only need the operand types in hand.
//! What's left for this pass needs the *whole* function body at once: goto
//! targets must resolve somewhere in the same function, switch cases must be
//! distinct, and nested initializer trees need flattening against the
//! target's layout before the IR builder can emit stores for them.

use crate::common::{Diagnostics, ErrorKind, Span};
use crate::front::ast::*;
use crate::front::types::*;

/// One leaf of a flattened initializer: the byte offset from the start of
/// the object being initialized, and the expression to store there.
#[derive(Debug, Clone)]
pub struct FlatInit {
    pub offset: u32,
    pub ty: Ty,
    pub expr: Expr,
}

/// Validate every function body in `program`: goto targets resolve within
/// the same function, and switch statements don't repeat a case value.
/// Errors are recoverable: all functions are checked even after the first
/// failure.
pub fn lower(program: &Program) -> Diagnostics {
    let mut diags = Diagnostics::new();
    for f in &program.functions {
        let Some(body) = &f.body else { continue };
        let mut labels = Vec::new();
        collect_labels(body, &mut labels);
        let mut gotos = Vec::new();
        collect_gotos(body, &mut gotos);
        for (name, span) in gotos {
            if !labels.contains(&name) {
                diags.report(
                    ErrorKind::Semantic,
                    span,
                    format!("goto targets undefined label '{name}' in function '{}'", f.name),
                );
            }
        }
        check_switch_cases(body, &mut diags);
    }
    diags
}

fn collect_labels(stmt: &Stmt, out: &mut Vec<crate::common::Id>) {
    match stmt {
        Stmt::Label(name, inner) => {
            out.push(*name);
            collect_labels(inner, out);
        }
        Stmt::Block(_, stmts) => stmts.iter().for_each(|s| collect_labels(s, out)),
        Stmt::If { tt, ff, .. } => {
            collect_labels(tt, out);
            if let Some(ff) = ff {
                collect_labels(ff, out);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            collect_labels(body, out)
        }
        Stmt::Switch { body, .. } => collect_labels(body, out),
        _ => {}
    }
}

fn collect_gotos(stmt: &Stmt, out: &mut Vec<(crate::common::Id, Span)>) {
    match stmt {
        Stmt::Goto(name) => out.push((*name, Span::dummy())),
        Stmt::Label(_, inner) => collect_gotos(inner, out),
        Stmt::Block(_, stmts) => stmts.iter().for_each(|s| collect_gotos(s, out)),
        Stmt::If { tt, ff, .. } => {
            collect_gotos(tt, out);
            if let Some(ff) = ff {
                collect_gotos(ff, out);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            collect_gotos(body, out)
        }
        Stmt::Switch { body, .. } => collect_gotos(body, out),
        _ => {}
    }
}

fn check_switch_cases(stmt: &Stmt, diags: &mut Diagnostics) {
    match stmt {
        Stmt::Switch { cases, .. } => {
            let mut seen_default = false;
            let mut seen_values: Vec<i64> = Vec::new();
            for (value, _) in cases {
                match value {
                    None if seen_default => {
                        diags.report(ErrorKind::Semantic, Span::dummy(), "duplicate default label in switch");
                    }
                    None => seen_default = true,
                    Some(v) if seen_values.contains(v) => {
                        diags.report(
                            ErrorKind::Semantic,
                            Span::dummy(),
                            format!("duplicate case value {v} in switch"),
                        );
                    }
                    Some(v) => seen_values.push(*v),
                }
            }
        }
        Stmt::Block(_, stmts) => stmts.iter().for_each(|s| check_switch_cases(s, diags)),
        Stmt::If { tt, ff, .. } => {
            check_switch_cases(tt, diags);
            if let Some(ff) = ff {
                check_switch_cases(ff, diags);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } | Stmt::For { body, .. } => {
            check_switch_cases(body, diags)
        }
        Stmt::Label(_, inner) => check_switch_cases(inner, diags),
        _ => {}
    }
}

/// Flatten a (possibly nested) initializer tree into a list of leaf stores,
/// following `ty`'s layout the same way [`TypeTable::define_struct`] computed
/// it. A scalar initializer for an aggregate type flattens to a single leaf
/// at offset 0; a `{ ... }` list recurses field-by-field or element-by-
/// element.
pub fn flatten_init(types: &TypeTable, ty: Ty, init: &Init) -> Vec<FlatInit> {
    let mut out = Vec::new();
    flatten_into(types, ty, init, 0, &mut out);
    out
}

fn flatten_into(types: &TypeTable, ty: Ty, init: &Init, base: u32, out: &mut Vec<FlatInit>) {
    match init {
        Init::Expr(e) => out.push(FlatInit { offset: base, ty, expr: e.clone() }),
        Init::List(items) => match &*strip_qualifiers(ty) {
            TypeKind::Array(elem, _) => {
                let esize = types.size_of(*elem);
                for (i, item) in items.iter().enumerate() {
                    flatten_into(types, *elem, item, base + i as u32 * esize, out);
                }
            }
            TypeKind::Struct(idx) => {
                let def = types.struct_def(*idx);
                for (item, field) in items.iter().zip(def.fields.iter()) {
                    flatten_into(types, field.ty, item, base + field.offset, out);
                }
            }
            _ => {
                if let Some(first) = items.first() {
                    flatten_into(types, ty, first, base, out);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    #[test]
    fn goto_to_missing_label_is_reported() {
        let (prog, _) = parse("int main(){ goto nope; return 0; }", 8).unwrap();
        let diags = lower(&prog);
        assert!(diags.has_errors());
    }

    #[test]
    fn goto_to_present_label_is_clean() {
        let (prog, _) = parse("int main(){ goto done; done: return 0; }", 8).unwrap();
        let diags = lower(&prog);
        assert!(!diags.has_errors());
    }

    #[test]
    fn flattens_array_initializer() {
        let types = TypeTable::new(8);
        let elem = TypeTable::fixnum(4, true);
        let arr = TypeTable::array(elem, Some(3));
        let init = Init::List(vec![
            Init::Expr(Expr { kind: ExprKind::IntLit(1), ty: elem, span: crate::common::Span::dummy() }),
            Init::Expr(Expr { kind: ExprKind::IntLit(2), ty: elem, span: crate::common::Span::dummy() }),
        ]);
        let flat = flatten_init(&types, arr, &init);
        assert_eq!(flat[0].offset, 0);
        assert_eq!(flat[1].offset, 4);
    }
}
