//! Linear-scan register allocation over separately-tracked integer and
//! floating physical pools, grounded directly in the live-
//! interval bookkeeping and farthest-end spill heuristic of
//! `examples/original_source/src/cc/backend/regalloc.c`.

use crate::common::{Map, Set};
use crate::front::ast::BOp;
use crate::middle::callconv;
use crate::middle::tir::{vreg_flags, BBId, Function, Op, VRegId};

/// Physical registers a live interval must not receive, as a bitmask (there
/// are never more than 32 registers in either class, so a `u32` suffices).
pub type ForbidSet = u32;

#[derive(Debug, Clone, Copy)]
struct Interval {
    vreg: VRegId,
    start: u32,
    end: u32,
    forbid: ForbidSet,
    /// Never a spill candidate (spill-fixup's own temporaries).
    no_spill: bool,
}

/// Allocates physical registers for every vreg in `f`, inserting spill code
/// as needed, and iterating until no new spill is introduced: a monotone
/// fixpoint, once a vreg is spilled it stays spilled.
pub fn allocate(f: &mut Function) {
    loop {
        compute_liveness(f);
        let positions = instruction_positions(f);
        let forbids = compute_forbids(f, &positions);

        let mut int_intervals = Vec::new();
        let mut float_intervals = Vec::new();
        for v in &f.vregs {
            if v.is_const() || v.is_spilled() {
                continue;
            }
            let Some(&(start, end)) = positions.get(&v.id) else { continue };
            let start = if v.flags & vreg_flags::PARAM != 0 { 0 } else { start };
            let forbid = forbids.get(&v.id).copied().unwrap_or(0);
            let iv = Interval { vreg: v.id, start, end, forbid, no_spill: v.is_no_spill() };
            if v.is_flonum() {
                float_intervals.push(iv);
            } else {
                int_intervals.push(iv);
            }
        }

        let (int_assigned, int_spilled) = linear_scan(int_intervals, callconv::INT_REG_NAMES.len() as u8);
        let (float_assigned, float_spilled) = linear_scan(float_intervals, callconv::FLOAT_REG_NAMES.len() as u8);

        for (&v, &reg) in int_assigned.iter().chain(float_assigned.iter()) {
            f.vreg_mut(v).phys = Some(reg);
        }
        if int_assigned.keys().any(|v| !f.vreg(*v).is_flonum()) {
            f.used_int_regs.extend(int_assigned.values().copied());
        }
        f.used_float_regs.extend(float_assigned.values().copied());

        let newly_spilled: Vec<VRegId> = int_spilled.into_iter().chain(float_spilled).collect();
        if newly_spilled.is_empty() {
            break;
        }
        for v in &newly_spilled {
            let offset = reserve_frame_slot(f, *v);
            let vr = f.vreg_mut(*v);
            vr.flags |= vreg_flags::SPILLED;
            vr.phys = None;
            vr.frame_offset = Some(offset);
        }
        insert_spill_fixups(f, &newly_spilled);
    }
}

fn reserve_frame_slot(f: &mut Function, v: VRegId) -> i32 {
    let vr = f.vreg(v);
    let size = vr.size.max(1) as u32;
    let align = vr.align.max(1) as u32;
    f.frame_size = round_up(f.frame_size + size, align);
    -(f.frame_size as i32)
}

fn round_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}

/// Backward dataflow fixpoint over the CFG: `live_out[b] = ∪ live_in[succ]`,
/// `live_in[b] = use[b] ∪ (live_out[b] − def[b])`.
fn compute_liveness(f: &mut Function) {
    let n = f.blocks.len();
    let mut use_set: Vec<Set<VRegId>> = vec![Set::new(); n];
    let mut def_set: Vec<Set<VRegId>> = vec![Set::new(); n];
    for bb in f.blocks.iter() {
        let mut defined = Set::new();
        for op in &bb.ops {
            for v in op.operands() {
                if !defined.contains(&v) {
                    use_set[bb.id as usize].insert(v);
                }
            }
            if let Some(d) = op.dst() {
                defined.insert(d);
                def_set[bb.id as usize].insert(d);
            }
        }
    }
    loop {
        let mut changed = false;
        for id in (0..n as BBId).rev() {
            let succs = f.blocks.successors(id);
            let mut out = Set::new();
            for s in succs {
                out.extend(f.blocks.get(s).live_in.iter().copied());
            }
            let mut inn = use_set[id as usize].clone();
            for v in &out {
                if !def_set[id as usize].contains(v) {
                    inn.insert(*v);
                }
            }
            let bb = f.blocks.get_mut(id);
            if bb.live_out != out {
                bb.live_out = out;
                changed = true;
            }
            if bb.live_in != inn {
                bb.live_in = inn;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Assigns each instruction a position in program order (blocks visited in
/// arena order), and returns each vreg's [start, end] span widened by the
/// live-in/live-out of every block it spans.
fn instruction_positions(f: &Function) -> Map<VRegId, (u32, u32)> {
    let mut bounds: Map<VRegId, (u32, u32)> = Map::new();
    let mut extend = |bounds: &mut Map<VRegId, (u32, u32)>, v: VRegId, pos: u32| {
        bounds
            .entry(v)
            .and_modify(|(s, e)| {
                *s = (*s).min(pos);
                *e = (*e).max(pos);
            })
            .or_insert((pos, pos));
    };

    let mut pos = 0u32;
    let mut block_range: Map<BBId, (u32, u32)> = Map::new();
    for bb in f.blocks.iter() {
        let start = pos;
        for op in &bb.ops {
            for v in op.operands() {
                extend(&mut bounds, v, pos);
            }
            if let Some(d) = op.dst() {
                extend(&mut bounds, d, pos);
            }
            pos += 1;
        }
        block_range.insert(bb.id, (start, pos.saturating_sub(1).max(start)));
    }
    for bb in f.blocks.iter() {
        let (s, e) = block_range[&bb.id];
        for v in &bb.live_in {
            extend(&mut bounds, *v, s);
        }
        for v in &bb.live_out {
            extend(&mut bounds, *v, e);
        }
    }
    bounds
}

/// Forbid sets: `call` forbids every caller-saved register over its
/// position; `pusharg(i)` forbids the register that argument slot `i` maps
/// to; `div`/`mod`/`shl`/`shr` forbid the scratch registers their emitted
/// instructions hardcode (`rax`/`rdx` for `idiv`, `rcx` for shift-by-`%cl`).
fn compute_forbids(f: &Function, positions: &Map<VRegId, (u32, u32)>) -> Map<VRegId, ForbidSet> {
    let mut forbid: Map<VRegId, ForbidSet> = Map::new();
    let caller_saved_int: u32 = callconv::CALLER_SAVED_INT.iter().fold(0, |m, &r| m | (1 << r));
    let caller_saved_float: u32 = callconv::CALLER_SAVED_FLOAT.iter().fold(0, |m, &r| m | (1 << r));

    let mut pos = 0u32;
    for bb in f.blocks.iter() {
        for op in &bb.ops {
            match op {
                Op::Call { .. } => {
                    for (&v, &(s, e)) in positions.iter() {
                        if s <= pos && pos <= e {
                            let is_float = f.vreg(v).is_flonum();
                            let mask = if is_float { caller_saved_float } else { caller_saved_int };
                            *forbid.entry(v).or_insert(0) |= mask;
                        }
                    }
                }
                Op::PushArg { index, .. } => {
                    if let Some(&reg) = callconv::INT_ARG_REGS.get(*index as usize) {
                        for (&v, &(s, e)) in positions.iter() {
                            if s <= pos && pos <= e && !f.vreg(v).is_flonum() {
                                *forbid.entry(v).or_insert(0) |= 1 << reg;
                            }
                        }
                    }
                }
                Op::Bin { op: bop @ (BOp::Div | BOp::Mod | BOp::Shl | BOp::Shr), .. } => {
                    let mask: u32 = match bop {
                        BOp::Div | BOp::Mod => (1 << callconv::RAX) | (1 << callconv::RDX),
                        _ => 1 << callconv::RCX,
                    };
                    for (&v, &(s, e)) in positions.iter() {
                        if s <= pos && pos <= e && !f.vreg(v).is_flonum() {
                            *forbid.entry(v).or_insert(0) |= mask;
                        }
                    }
                }
                _ => {}
            }
            pos += 1;
        }
    }
    forbid
}

/// Sort by start, tie-broken by longer-interval-first; expire, then assign a
/// free register outside the forbid set, preferring the parameter-hinted
/// register; otherwise evict the active interval with the farthest end if it
/// outlives the new one, else spill the new one. A `no_spill` interval is
/// never the one spilled: it forces an eviction instead, since it has no
/// home to spill to.
fn linear_scan(mut intervals: Vec<Interval>, num_regs: u8) -> (Map<VRegId, u8>, Set<VRegId>) {
    intervals.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut active: Vec<(VRegId, u32, u8, bool)> = Vec::new(); // (vreg, end, phys, no_spill)
    let mut free_mask: u32 = if num_regs >= 32 { u32::MAX } else { (1u32 << num_regs) - 1 };
    let mut assigned: Map<VRegId, u8> = Map::new();
    let mut spilled: Set<VRegId> = Set::new();

    for iv in intervals {
        active.retain(|&(_, end, reg, _)| {
            if end < iv.start {
                free_mask |= 1 << reg;
                false
            } else {
                true
            }
        });

        let avail = free_mask & !iv.forbid;
        if avail != 0 {
            let reg = avail.trailing_zeros() as u8;
            free_mask &= !(1 << reg);
            assigned.insert(iv.vreg, reg);
            active.push((iv.vreg, iv.end, reg, iv.no_spill));
            continue;
        }

        let worst = active
            .iter()
            .copied()
            .filter(|&(_, _, reg, ns)| iv.forbid & (1 << reg) == 0 && (!iv.no_spill || !ns))
            .max_by_key(|&(_, end, _, _)| end);

        match worst {
            Some((worst_v, worst_end, worst_reg, _)) if iv.no_spill || worst_end > iv.end => {
                assigned.remove(&worst_v);
                spilled.insert(worst_v);
                active.retain(|&(v, _, _, _)| v != worst_v);
                assigned.insert(iv.vreg, worst_reg);
                active.push((iv.vreg, iv.end, worst_reg, iv.no_spill));
            }
            _ => {
                spilled.insert(iv.vreg);
            }
        }
    }
    (assigned, spilled)
}

/// Rewrites every op referencing a newly spilled vreg: a `load-spilled` into
/// a fresh [`vreg_flags::NO_SPILL`] temporary before any read, the op itself
/// retargeted at that temporary, and a `store-spilled` back to the spilled
/// vreg's frame slot after any write.
fn insert_spill_fixups(f: &mut Function, spilled: &[VRegId]) {
    let spilled_set: Set<VRegId> = spilled.iter().copied().collect();
    for bi in 0..f.blocks.len() as BBId {
        let mut ops = std::mem::take(&mut f.blocks.get_mut(bi).ops);
        let mut out = Vec::with_capacity(ops.len());
        for mut op in ops.drain(..) {
            let reads: Set<VRegId> = op.operands().into_iter().filter(|v| spilled_set.contains(v)).collect();
            let dst = op.dst();
            let writes_spilled = dst.map(|d| spilled_set.contains(&d)).unwrap_or(false);

            let mut temps: Map<VRegId, VRegId> = Map::new();
            for &r in &reads {
                temps.insert(r, f.spawn_temp(r));
            }
            if writes_spilled {
                let d = dst.unwrap();
                temps.entry(d).or_insert_with(|| f.spawn_temp(d));
            }

            for &r in &reads {
                out.push(Op::LoadSpilled { dst: temps[&r], slot: r });
            }
            for (&orig, &tmp) in &temps {
                op.rewrite(orig, tmp);
            }
            if writes_spilled {
                let d = dst.unwrap();
                let tmp = temps[&d];
                out.push(op);
                out.push(Op::StoreSpilled { slot: d, src: tmp });
            } else {
                out.push(op);
            }
        }
        f.blocks.get_mut(bi).ops = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// More simultaneously-live locals than there are integer registers, so
    /// `allocate` is forced to spill at least one of them.
    fn many_locals_source() -> String {
        let decls: Vec<String> = (0..24).map(|i| format!("a{i}={i}")).collect();
        let sum: Vec<String> = (0..24).map(|i| format!("a{i}")).collect();
        format!("int f(){{ int {}; return {}; }}", decls.join(","), sum.join("+"))
    }

    #[test]
    fn spill_fixup_mints_a_fresh_temp_for_each_reload_and_store() {
        let src = many_locals_source();
        let (program, types) = crate::front::parse(&src, 8).expect("parse");
        let mut ir = crate::middle::build_program(&program, &types).expect("build IR");
        let f = &mut ir.functions[0];
        allocate(f);

        assert!(f.vregs.iter().any(|v| v.is_spilled()), "expected register pressure to force a spill");

        for bb in f.blocks.iter() {
            for op in &bb.ops {
                match op {
                    Op::LoadSpilled { dst, slot } => {
                        assert_ne!(dst, slot, "reload must target a fresh temp, not the spilled vreg itself");
                    }
                    Op::StoreSpilled { slot, src } => {
                        assert_ne!(slot, src, "store-back must come from a fresh temp, not the spilled vreg itself");
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn spilled_locals_never_assemble_to_a_memory_to_memory_move() {
        let src = many_locals_source();
        let (program, types) = crate::front::parse(&src, 8).expect("parse");
        let mut ir = crate::middle::build_program(&program, &types).expect("build IR");
        for f in ir.functions.iter_mut() {
            allocate(f);
        }
        let text = crate::back::emit_program(&ir, "x86_64-unknown-linux-gnu");
        for line in text.lines() {
            let Some(args) = line.trim().splitn(2, char::is_whitespace).nth(1) else { continue };
            let mem_operands = args.split(',').filter(|p| p.contains("(%rbp)")).count();
            assert!(mem_operands < 2, "memory-to-memory move in emitted assembly: {line}");
        }
    }

    #[test]
    fn no_spill_temporaries_are_never_themselves_spilled() {
        let src = many_locals_source();
        let (program, types) = crate::front::parse(&src, 8).expect("parse");
        let mut ir = crate::middle::build_program(&program, &types).expect("build IR");
        let f = &mut ir.functions[0];
        allocate(f);
        assert!(f.vregs.iter().filter(|v| v.is_no_spill()).all(|v| !v.is_spilled()));
    }
}
