//! The x86-64 backend: turns a register-allocated [`tir::Program`] into
//! AT&T-syntax assembly text.
//!
//! # Design decisions
//!
//! Unlike a from-scratch codegen pass, register allocation has already run
//! by the time a [`tir::Function`] reaches this module: every non-spilled
//! vreg carries a `phys` index into [`crate::middle::callconv::INT_REG_NAMES`]
//! or `FLOAT_REG_NAMES`, and every spilled vreg carries a `frame_offset`.
//! Emission is therefore a direct, mostly one-IR-op-to-one-or-two-instruction
//! translation rather than a second allocation pass.
//!
//! # Stack frame
//!
//! ```txt
//!   High addresses
//!   +-------------------------+
//!   | Incoming stack args     |
//!   +-------------------------+
//!   | Return address          |
//!   +-------------------------+
//!   | Saved rbp                | <- rbp
//!   +-------------------------+
//!   | Spill slots / locals     |
//!   +-------------------------+
//!   | Saved callee-saved regs  |
//!   +-------------------------+
//!   | Outgoing stack args      | <- rsp
//!   Low addresses
//! ```
//!
//! # Block layout vs. block creation order
//!
//! [`tir::BBContainer`] numbers blocks in the order the IR builder created
//! them, which is not necessarily a valid straight-line layout: a `Jump`
//! to a block created earlier is still a real branch. [`layout_order`]
//! computes an actual depth-first layout and the emitter only elides a
//! `jmp` when its target is the very next block in *that* order, with the
//! function's `exit` block always placed last so falling off the final
//! block reaches the epilogue.

use std::fmt::Write as _;

use crate::middle::callconv::{FLOAT_REG_NAMES, INT_REG_NAMES};
use crate::middle::tir::{self, BBId, Callee, Cond, Op, VRegId};

/// Renders an entire program to a single assembly-text buffer.
pub fn emit_program(program: &tir::Program, target: &str) -> String {
    let apple = target.contains("apple") || target.contains("darwin");
    let mut e = Emitter::new(apple);
    e.emit_data(program);
    e.emit_text(program);
    e.out
}

fn mangle(apple: bool, name: &str) -> String {
    if apple {
        format!("_{name}")
    } else {
        name.to_string()
    }
}

struct Emitter {
    apple: bool,
    out: String,
}

impl Emitter {
    fn new(apple: bool) -> Emitter {
        Emitter { apple, out: String::new() }
    }

    fn emit_data(&mut self, program: &tir::Program) {
        if program.globals.is_empty() {
            return;
        }
        writeln!(self.out, "\t.data").unwrap();
        for g in &program.globals {
            let label = mangle(self.apple, &g.name.to_string());
            if g.exported {
                writeln!(self.out, "\t.globl {label}").unwrap();
            }
            writeln!(self.out, "\t.align {}", g.align.max(1)).unwrap();
            if g.init.is_empty() {
                writeln!(self.out, "\t.comm {label},{},{}", g.size, g.align.max(1)).unwrap();
                continue;
            }
            writeln!(self.out, "{label}:").unwrap();
            let mut pos = 0u32;
            for (offset, bytes) in &g.init {
                if *offset > pos {
                    writeln!(self.out, "\t.zero {}", offset - pos).unwrap();
                }
                write!(self.out, "\t.byte ").unwrap();
                let rendered: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                writeln!(self.out, "{}", rendered.join(",")).unwrap();
                pos = offset + bytes.len() as u32;
            }
            if pos < g.size {
                writeln!(self.out, "\t.zero {}", g.size - pos).unwrap();
            }
        }
    }

    fn emit_text(&mut self, program: &tir::Program) {
        writeln!(self.out, "\t.text").unwrap();
        for f in &program.functions {
            self.emit_function(f);
        }
    }

    fn emit_function(&mut self, f: &tir::Function) {
        let label = mangle(self.apple, &f.name.to_string());
        writeln!(self.out, "\t.globl {label}").unwrap();
        writeln!(self.out, "{label}:").unwrap();

        writeln!(self.out, "\tpushq %rbp").unwrap();
        writeln!(self.out, "\tmovq %rsp, %rbp").unwrap();
        let frame = round_up(f.frame_size, 16);
        if frame > 0 {
            writeln!(self.out, "\tsubq ${frame}, %rsp").unwrap();
        }
        for &r in &f.used_int_regs {
            if crate::middle::callconv::CALLEE_SAVED_INT.contains(&r) {
                writeln!(self.out, "\tpushq %{}", INT_REG_NAMES[r as usize]).unwrap();
            }
        }

        let order = layout_order(f);
        for (i, &bb_id) in order.iter().enumerate() {
            if bb_id == f.exit {
                continue; // emitted once, after the body, below
            }
            writeln!(self.out, "{}:", block_label(&label, bb_id)).unwrap();
            let next = order.get(i + 1).copied();
            let ops = &f.blocks.get(bb_id).ops;
            for (j, op) in ops.iter().enumerate() {
                let is_last = j + 1 == ops.len();
                self.emit_op(f, &label, op, if is_last { next } else { None });
            }
        }

        writeln!(self.out, "{}:", block_label(&label, f.exit)).unwrap();
        for &r in f.used_int_regs.iter().rev() {
            if crate::middle::callconv::CALLEE_SAVED_INT.contains(&r) {
                writeln!(self.out, "\tpopq %{}", INT_REG_NAMES[r as usize]).unwrap();
            }
        }
        writeln!(self.out, "\tmovq %rbp, %rsp").unwrap();
        writeln!(self.out, "\tpopq %rbp").unwrap();
        writeln!(self.out, "\tret").unwrap();
    }

    fn emit_op(&mut self, f: &tir::Function, fname: &str, op: &Op, fallthrough: Option<BBId>) {
        match op {
            Op::Mov { dst, src } => {
                writeln!(self.out, "\tmov{} {}, {}", suffix(f, *src), self.opnd(f, *src), self.opnd(f, *dst)).unwrap();
            }
            Op::Load { dst, addr, size } => {
                writeln!(self.out, "\tmov{} ({}), {}", suffix_of(*size), self.reg(f, *addr), self.opnd(f, *dst)).unwrap();
            }
            Op::Store { addr, src, size } => {
                writeln!(self.out, "\tmov{} {}, ({})", suffix_of(*size), self.opnd(f, *src), self.reg(f, *addr)).unwrap();
            }
            Op::Bin { op, dst, lhs, rhs } => self.emit_bin(f, *op, *dst, *lhs, *rhs),
            Op::Un { op, dst, src } => self.emit_un(f, *op, *dst, *src),
            Op::Cmp { cond, dst, lhs, rhs } => self.emit_cmp(f, *cond, *dst, *lhs, *rhs),
            Op::CJump { cond, tt, ff } => self.emit_cjump(fname, *cond, *tt, *ff, fallthrough),
            Op::Jump(target) => {
                if Some(*target) != fallthrough {
                    writeln!(self.out, "\tjmp {}", block_label(fname, *target)).unwrap();
                }
            }
            Op::TableJump { index, targets, default } => self.emit_table_jump(f, fname, *index, targets, *default),
            Op::Bofs { dst, frame_offset } => {
                writeln!(self.out, "\tleaq {}(%rbp), {}", frame_offset, self.reg(f, *dst)).unwrap();
            }
            Op::Iofs { dst, symbol, .. } => {
                writeln!(self.out, "\tleaq {}(%rip), {}", mangle(self.apple, &symbol.to_string()), self.reg(f, *dst)).unwrap();
            }
            Op::Sofs { dst, offset } => {
                writeln!(self.out, "\tleaq {}(%rsp), {}", offset, self.reg(f, *dst)).unwrap();
            }
            Op::Precall { stack_arg_bytes } => {
                if *stack_arg_bytes > 0 {
                    writeln!(self.out, "\tsubq ${}, %rsp", round_up(*stack_arg_bytes, 16)).unwrap();
                }
            }
            Op::PushArg { index: _, src } => {
                // Register-class args were already assigned their target
                // register by the builder's vreg hints; stack args would
                // be stored via an explicit Store into the outgoing area.
                let _ = src;
            }
            Op::Call { dst, callee, .. } => {
                match callee {
                    Callee::Direct(name) => writeln!(self.out, "\tcall {}", mangle(self.apple, &name.to_string())).unwrap(),
                    Callee::Indirect(v) => writeln!(self.out, "\tcall *{}", self.reg(f, *v)).unwrap(),
                };
                if let Some(d) = dst {
                    let reg = if f.vreg(*d).is_flonum() { "%xmm0" } else { "%rax" };
                    writeln!(self.out, "\tmov{} {}, {}", suffix(f, *d), reg, self.opnd(f, *d)).unwrap();
                }
            }
            Op::Result { src } => {
                let reg = if f.vreg(*src).is_flonum() { "%xmm0" } else { "%rax" };
                writeln!(self.out, "\tmov{} {}, {reg}", suffix(f, *src), self.opnd(f, *src)).unwrap();
            }
            Op::Cast { dst, src } => self.emit_cast(f, *dst, *src),
            Op::SubSp { bytes } => {
                writeln!(self.out, "\tsubq ${}, %rsp", round_up(*bytes, 16)).unwrap();
            }
            Op::LoadSpilled { dst, slot } => {
                writeln!(self.out, "\tmov{} {}, {}", suffix(f, *slot), self.opnd(f, *slot), self.opnd(f, *dst)).unwrap();
            }
            Op::StoreSpilled { slot, src } => {
                writeln!(self.out, "\tmov{} {}, {}", suffix(f, *src), self.opnd(f, *src), self.opnd(f, *slot)).unwrap();
            }
            Op::Asm(text) => {
                writeln!(self.out, "\t{text}").unwrap();
            }
        }
    }

    fn emit_bin(&mut self, f: &tir::Function, bop: crate::front::ast::BOp, dst: VRegId, lhs: VRegId, rhs: VRegId) {
        use crate::front::ast::BOp::*;
        if f.vreg(dst).is_flonum() {
            let op = match bop {
                Add => "adds", Sub => "subs", Mul => "muls", Div => "divs",
                _ => "adds",
            };
            let sd = if f.vreg(dst).size == 4 { "s" } else { "d" };
            writeln!(self.out, "\tmov{sd} {}, {}", self.opnd(f, lhs), self.opnd(f, dst)).unwrap();
            writeln!(self.out, "\t{op}{sd} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap();
            return;
        }
        writeln!(self.out, "\tmov{} {}, {}", suffix(f, dst), self.opnd(f, lhs), self.opnd(f, dst)).unwrap();
        let s = suffix(f, dst);
        match bop {
            Add => { writeln!(self.out, "\tadd{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            Sub => { writeln!(self.out, "\tsub{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            Mul => { writeln!(self.out, "\timul{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            Div | Mod => {
                writeln!(self.out, "\tmovq {}, %rax", self.opnd(f, dst)).unwrap();
                if f.vreg(dst).is_unsigned() {
                    writeln!(self.out, "\txorq %rdx, %rdx").unwrap();
                    writeln!(self.out, "\tdivq {}", self.opnd(f, rhs)).unwrap();
                } else {
                    writeln!(self.out, "\tcqto").unwrap();
                    writeln!(self.out, "\tidivq {}", self.opnd(f, rhs)).unwrap();
                }
                let reg = if bop == Div { "%rax" } else { "%rdx" };
                writeln!(self.out, "\tmovq {reg}, {}", self.opnd(f, dst)).unwrap();
            }
            BitAnd => { writeln!(self.out, "\tand{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            BitOr => { writeln!(self.out, "\tor{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            BitXor => { writeln!(self.out, "\txor{s} {}, {}", self.opnd(f, rhs), self.opnd(f, dst)).unwrap(); }
            Shl => { writeln!(self.out, "\tmovq {}, %rcx", self.opnd(f, rhs)).unwrap(); writeln!(self.out, "\tsal{s} %cl, {}", self.opnd(f, dst)).unwrap(); }
            Shr => {
                let mnemonic = if f.vreg(dst).is_unsigned() { "shr" } else { "sar" };
                writeln!(self.out, "\tmovq {}, %rcx", self.opnd(f, rhs)).unwrap();
                writeln!(self.out, "\t{mnemonic}{s} %cl, {}", self.opnd(f, dst)).unwrap();
            }
            _ => {}
        }
    }

    fn emit_un(&mut self, f: &tir::Function, uop: crate::front::ast::UOp, dst: VRegId, src: VRegId) {
        use crate::front::ast::UOp::*;
        writeln!(self.out, "\tmov{} {}, {}", suffix(f, dst), self.opnd(f, src), self.opnd(f, dst)).unwrap();
        match uop {
            Neg => { writeln!(self.out, "\tneg{} {}", suffix(f, dst), self.opnd(f, dst)).unwrap(); }
            BitNot => { writeln!(self.out, "\tnot{} {}", suffix(f, dst), self.opnd(f, dst)).unwrap(); }
            LogNot => {
                writeln!(self.out, "\tcmp{} $0, {}", suffix(f, dst), self.opnd(f, dst)).unwrap();
                writeln!(self.out, "\tsete %al").unwrap();
                writeln!(self.out, "\tmovzbl %al, {}", self.opnd(f, dst)).unwrap();
            }
        }
    }

    fn emit_cmp(&mut self, f: &tir::Function, cond: Cond, dst: Option<VRegId>, lhs: VRegId, rhs: VRegId) {
        writeln!(self.out, "\tcmp{} {}, {}", suffix(f, lhs), self.opnd(f, rhs), self.opnd(f, lhs)).unwrap();
        if let Some(d) = dst {
            if let Some(set) = setcc(cond) {
                writeln!(self.out, "\t{set} %al").unwrap();
                writeln!(self.out, "\tmovzbl %al, {}", self.opnd(f, d)).unwrap();
            }
        }
    }

    fn emit_cjump(&mut self, fname: &str, cond: Cond, tt: BBId, ff: BBId, fallthrough: Option<BBId>) {
        match cond {
            Cond::Any => {
                if Some(tt) != fallthrough {
                    writeln!(self.out, "\tjmp {}", block_label(fname, tt)).unwrap();
                }
            }
            Cond::None_ => {
                if Some(ff) != fallthrough {
                    writeln!(self.out, "\tjmp {}", block_label(fname, ff)).unwrap();
                }
            }
            _ => {
                let jcc = jcc_for(cond);
                if Some(tt) == fallthrough {
                    writeln!(self.out, "\t{} {}", jcc_for(cond.negate()), block_label(fname, ff)).unwrap();
                } else {
                    writeln!(self.out, "\t{jcc} {}", block_label(fname, tt)).unwrap();
                    if Some(ff) != fallthrough {
                        writeln!(self.out, "\tjmp {}", block_label(fname, ff)).unwrap();
                    }
                }
            }
        }
    }

    fn emit_table_jump(&mut self, f: &tir::Function, fname: &str, index: VRegId, targets: &[BBId], default: BBId) {
        for (i, t) in targets.iter().enumerate() {
            writeln!(self.out, "\tcmpq ${i}, {}", self.opnd(f, index)).unwrap();
            writeln!(self.out, "\tje {}", block_label(fname, *t)).unwrap();
        }
        writeln!(self.out, "\tjmp {}", block_label(fname, default)).unwrap();
    }

    fn emit_cast(&mut self, f: &tir::Function, dst: VRegId, src: VRegId) {
        let dst_float = f.vreg(dst).is_flonum();
        let src_float = f.vreg(src).is_flonum();
        match (src_float, dst_float) {
            (false, true) => { writeln!(self.out, "\tcvtsi2sdq {}, {}", self.opnd(f, src), self.opnd(f, dst)).unwrap(); }
            (true, false) => { writeln!(self.out, "\tcvttsd2siq {}, {}", self.opnd(f, src), self.opnd(f, dst)).unwrap(); }
            _ => { writeln!(self.out, "\tmov{} {}, {}", suffix(f, src), self.opnd(f, src), self.opnd(f, dst)).unwrap(); }
        }
    }

    fn reg(&self, f: &tir::Function, v: VRegId) -> String {
        let vr = f.vreg(v);
        match vr.phys {
            Some(p) if vr.is_flonum() => format!("%{}", FLOAT_REG_NAMES[p as usize]),
            Some(p) => format!("%{}", INT_REG_NAMES[p as usize]),
            None => self.opnd(f, v),
        }
    }

    /// Renders the operand for `v`: a physical register, a frame-relative
    /// spill slot, or (for a folded constant) an immediate.
    fn opnd(&self, f: &tir::Function, v: VRegId) -> String {
        let vr = f.vreg(v);
        if let Some(c) = vr.const_value {
            return format!("${c}");
        }
        match vr.phys {
            Some(p) if vr.is_flonum() => format!("%{}", FLOAT_REG_NAMES[p as usize]),
            Some(p) => format!("%{}", INT_REG_NAMES[p as usize]),
            None => format!("{}(%rbp)", vr.frame_offset.unwrap_or(0)),
        }
    }

}

fn round_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}

fn block_label(fname: &str, id: BBId) -> String {
    format!(".L{fname}_{id}")
}

fn suffix(f: &tir::Function, v: VRegId) -> &'static str {
    suffix_of(f.vreg(v).size)
}

fn suffix_of(size: u8) -> &'static str {
    match size {
        1 => "b",
        2 => "w",
        4 => "l",
        _ => "q",
    }
}

fn setcc(cond: Cond) -> Option<&'static str> {
    Some(match cond {
        Cond::Eq => "sete",
        Cond::Ne => "setne",
        Cond::Lt => "setl",
        Cond::Le => "setle",
        Cond::Gt => "setg",
        Cond::Ge => "setge",
        Cond::LtU => "setb",
        Cond::LeU => "setbe",
        Cond::GtU => "seta",
        Cond::GeU => "setae",
        Cond::Any | Cond::None_ => return None,
    })
}

fn jcc_for(cond: Cond) -> &'static str {
    match cond {
        Cond::Eq => "je",
        Cond::Ne => "jne",
        Cond::Lt => "jl",
        Cond::Le => "jle",
        Cond::Gt => "jg",
        Cond::Ge => "jge",
        Cond::LtU => "jb",
        Cond::LeU => "jbe",
        Cond::GtU => "ja",
        Cond::GeU => "jae",
        Cond::Any => "jmp",
        Cond::None_ => "",
    }
}

/// A depth-first layout that keeps fallthrough edges adjacent where possible,
/// with `exit` always placed last.
fn layout_order(f: &tir::Function) -> Vec<BBId> {
    let n = f.blocks.len();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stack = vec![f.entry];
    while let Some(id) = stack.pop() {
        if id == f.exit || visited[id as usize] {
            continue;
        }
        visited[id as usize] = true;
        order.push(id);
        let mut succs = f.blocks.successors(id);
        succs.reverse();
        for s in succs {
            if s != f.exit && !visited[s as usize] {
                stack.push(s);
            }
        }
    }
    for id in 0..n as BBId {
        if id != f.exit && !visited[id as usize] {
            order.push(id);
        }
    }
    order.push(f.exit);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_apple_targets_with_leading_underscore() {
        assert_eq!(mangle(true, "main"), "_main");
        assert_eq!(mangle(false, "main"), "main");
    }

    #[test]
    fn suffix_matches_operand_width() {
        assert_eq!(suffix_of(1), "b");
        assert_eq!(suffix_of(8), "q");
    }
}
