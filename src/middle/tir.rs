//! The three-address IR: virtual registers, basic blocks, and the ops that
//! connect them.

use crate::common::{Id, Set};
use crate::front::ast::{BOp, UOp};
use crate::front::types::Ty;

pub type VRegId = u32;
pub type BBId = u32;

pub mod vreg_flags {
    pub const FLONUM: u16 = 1 << 0;
    pub const UNSIGNED: u16 = 1 << 1;
    pub const CONST: u16 = 1 << 2;
    pub const PARAM: u16 = 1 << 3;
    pub const SPILLED: u16 = 1 << 4;
    pub const REF_TAKEN: u16 = 1 << 5;
    /// Produced by spill-fixup itself; must never be re-spilled (the
    /// allocator's monotone-spill invariant would otherwise loop forever).
    pub const NO_SPILL: u16 = 1 << 6;
}

/// A value produced or consumed by IR. Carries its own size/alignment rather
/// than a [`Ty`] handle, since by this stage only the physical representation
/// (flonum-or-not, signedness, width) matters.
#[derive(Debug, Clone)]
pub struct VReg {
    pub id: VRegId,
    pub size: u8,
    pub align: u8,
    pub flags: u16,
    /// Physical register index once allocated, into
    /// [`crate::middle::callconv::INT_REG_NAMES`] or `FLOAT_REG_NAMES`
    /// depending on `flags & FLONUM`.
    pub phys: Option<u8>,
    pub const_value: Option<i64>,
    /// Populated once the register allocator decides this vreg spills
    /// (invariant I5: a spilled vreg always has a frame offset).
    pub frame_offset: Option<i32>,
    /// Which parameter-register index this vreg is pinned to at function
    /// entry, if any.
    pub param_index: Option<u32>,
}

impl VReg {
    pub fn is_flonum(&self) -> bool {
        self.flags & vreg_flags::FLONUM != 0
    }
    pub fn is_const(&self) -> bool {
        self.flags & vreg_flags::CONST != 0
    }
    pub fn is_spilled(&self) -> bool {
        self.flags & vreg_flags::SPILLED != 0
    }
    pub fn is_unsigned(&self) -> bool {
        self.flags & vreg_flags::UNSIGNED != 0
    }
    pub fn is_no_spill(&self) -> bool {
        self.flags & vreg_flags::NO_SPILL != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned counterparts of `Lt`/`Le`/`Gt`/`Ge`, picked when either
    /// comparison operand's vreg carries `vreg_flags::UNSIGNED`; the original
    /// sources pick the branch mnemonic off the operand type the same way.
    LtU,
    LeU,
    GtU,
    GeU,
    /// Constant-folded comparison that always takes the branch.
    Any,
    /// Constant-folded comparison that never takes the branch.
    None_,
}

impl Cond {
    pub fn is_comparison(op: BOp) -> bool {
        matches!(op, BOp::Eq | BOp::Ne | BOp::Lt | BOp::Le | BOp::Gt | BOp::Ge)
    }

    pub fn from_bop(op: BOp, unsigned: bool) -> Option<Cond> {
        Some(match (op, unsigned) {
            (BOp::Eq, _) => Cond::Eq,
            (BOp::Ne, _) => Cond::Ne,
            (BOp::Lt, false) => Cond::Lt,
            (BOp::Lt, true) => Cond::LtU,
            (BOp::Le, false) => Cond::Le,
            (BOp::Le, true) => Cond::LeU,
            (BOp::Gt, false) => Cond::Gt,
            (BOp::Gt, true) => Cond::GtU,
            (BOp::Ge, false) => Cond::Ge,
            (BOp::Ge, true) => Cond::GeU,
            _ => return None,
        })
    }

    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
            Cond::LtU => Cond::GeU,
            Cond::LeU => Cond::GtU,
            Cond::GtU => Cond::LeU,
            Cond::GeU => Cond::LtU,
            Cond::Any => Cond::None_,
            Cond::None_ => Cond::Any,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Callee {
    Direct(Id),
    Indirect(VRegId),
}

/// One three-address operation. References at most one destination vreg and
/// up to two operand vregs.
#[derive(Debug, Clone)]
pub enum Op {
    Load { dst: VRegId, addr: VRegId, size: u8 },
    Store { addr: VRegId, src: VRegId, size: u8 },
    Mov { dst: VRegId, src: VRegId },
    Bin { op: BOp, dst: VRegId, lhs: VRegId, rhs: VRegId },
    Un { op: UOp, dst: VRegId, src: VRegId },
    /// Compares `lhs`/`rhs`. If `dst` is `Some`, materialises a 0/1 result;
    /// otherwise the condition is consumed by the next `CJump` in the block.
    Cmp { cond: Cond, dst: Option<VRegId>, lhs: VRegId, rhs: VRegId },
    CJump { cond: Cond, tt: BBId, ff: BBId },
    Jump(BBId),
    TableJump { index: VRegId, targets: Vec<BBId>, default: BBId },
    /// Address of a stack slot at `frame_offset` bytes from the frame base.
    Bofs { dst: VRegId, frame_offset: i32 },
    /// Address of a module-level symbol.
    Iofs { dst: VRegId, symbol: Id, exported: bool },
    /// Address relative to the current stack pointer (used for outgoing
    /// stack arguments before `precall`'s frame is finalised).
    Sofs { dst: VRegId, offset: i32 },
    Precall { stack_arg_bytes: u32 },
    PushArg { index: u32, src: VRegId },
    Call {
        dst: Option<VRegId>,
        callee: Callee,
        n_args: u32,
        n_reg_args: u32,
        vaarg_start: Option<u32>,
    },
    /// Moves `src` into the ABI return register, right before control
    /// reaches the function's exit block.
    Result { src: VRegId },
    Cast { dst: VRegId, src: VRegId },
    SubSp { bytes: u32 },
    LoadSpilled { dst: VRegId, slot: VRegId },
    StoreSpilled { slot: VRegId, src: VRegId },
    Asm(String),
}

impl Op {
    /// The destination vreg this op writes, if any (used by liveness and by
    /// invariant I4 "a constant vreg is never a store destination").
    pub fn dst(&self) -> Option<VRegId> {
        match self {
            Op::Load { dst, .. }
            | Op::Mov { dst, .. }
            | Op::Bin { dst, .. }
            | Op::Un { dst, .. }
            | Op::Bofs { dst, .. }
            | Op::Iofs { dst, .. }
            | Op::Sofs { dst, .. }
            | Op::Cast { dst, .. }
            | Op::LoadSpilled { dst, .. } => Some(*dst),
            Op::Cmp { dst, .. } => *dst,
            Op::Call { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Every vreg this op reads or writes, for liveness and forbid-set
    /// construction.
    pub fn operands(&self) -> Vec<VRegId> {
        match self {
            Op::Load { addr, .. } => vec![*addr],
            Op::Store { addr, src, .. } => vec![*addr, *src],
            Op::Mov { src, .. } => vec![*src],
            Op::Bin { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Un { src, .. } => vec![*src],
            Op::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::TableJump { index, .. } => vec![*index],
            Op::PushArg { src, .. } => vec![*src],
            Op::Cast { src, .. } => vec![*src],
            Op::Result { src } => vec![*src],
            Op::StoreSpilled { slot, src } => vec![*slot, *src],
            Op::LoadSpilled { slot, .. } => vec![*slot],
            Op::Call { callee: Callee::Indirect(v), .. } => vec![*v],
            _ => vec![],
        }
    }

    /// Replaces every occurrence of `old` in this op's operand or destination
    /// fields with `new`. Used by spill-fixup to redirect an op at a freshly
    /// spawned temporary standing in for a spilled vreg.
    pub fn rewrite(&mut self, old: VRegId, new: VRegId) {
        let swap = |v: &mut VRegId| {
            if *v == old {
                *v = new;
            }
        };
        match self {
            Op::Load { dst, addr, .. } => {
                swap(dst);
                swap(addr);
            }
            Op::Store { addr, src, .. } => {
                swap(addr);
                swap(src);
            }
            Op::Mov { dst, src } => {
                swap(dst);
                swap(src);
            }
            Op::Bin { dst, lhs, rhs, .. } => {
                swap(dst);
                swap(lhs);
                swap(rhs);
            }
            Op::Un { dst, src, .. } => {
                swap(dst);
                swap(src);
            }
            Op::Cmp { dst, lhs, rhs, .. } => {
                if let Some(d) = dst {
                    swap(d);
                }
                swap(lhs);
                swap(rhs);
            }
            Op::TableJump { index, .. } => swap(index),
            Op::Bofs { dst, .. } => swap(dst),
            Op::Iofs { dst, .. } => swap(dst),
            Op::Sofs { dst, .. } => swap(dst),
            Op::PushArg { src, .. } => swap(src),
            Op::Call { dst, callee, .. } => {
                if let Some(d) = dst {
                    swap(d);
                }
                if let Callee::Indirect(v) = callee {
                    swap(v);
                }
            }
            Op::Result { src } => swap(src),
            Op::Cast { dst, src } => {
                swap(dst);
                swap(src);
            }
            Op::LoadSpilled { dst, slot } => {
                swap(dst);
                swap(slot);
            }
            Op::StoreSpilled { slot, src } => {
                swap(slot);
                swap(src);
            }
            Op::CJump { .. } | Op::Jump(_) | Op::Precall { .. } | Op::SubSp { .. } | Op::Asm(_) => {}
        }
    }
}

#[derive(Debug, Default)]
pub struct BasicBlock {
    pub id: BBId,
    pub ops: Vec<Op>,
    pub live_in: Set<VRegId>,
    pub live_out: Set<VRegId>,
}

/// Owns every basic block in a function as an arena addressed by index, per
/// the "Graph ownership" design note: jump targets hold `BBId`s, not borrowed
/// references, so the allocator can rewrite ops freely.
#[derive(Debug, Default)]
pub struct BBContainer {
    blocks: Vec<BasicBlock>,
}

impl BBContainer {
    pub fn new() -> BBContainer {
        BBContainer::default()
    }

    pub fn push(&mut self) -> BBId {
        let id = self.blocks.len() as BBId;
        self.blocks.push(BasicBlock { id, ..Default::default() });
        id
    }

    pub fn get(&self, id: BBId) -> &BasicBlock {
        &self.blocks[id as usize]
    }

    pub fn get_mut(&mut self, id: BBId) -> &mut BasicBlock {
        &mut self.blocks[id as usize]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.blocks.iter_mut()
    }

    /// Successors of a block, derived from its terminating op.
    pub fn successors(&self, id: BBId) -> Vec<BBId> {
        match self.get(id).ops.last() {
            Some(Op::Jump(t)) => vec![*t],
            Some(Op::CJump { tt, ff, .. }) => vec![*tt, *ff],
            Some(Op::TableJump { targets, default, .. }) => {
                let mut v = targets.clone();
                v.push(*default);
                v
            }
            _ => vec![],
        }
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: Id,
    pub ty: Ty,
    pub params: Vec<VRegId>,
    pub vregs: Vec<VReg>,
    pub blocks: BBContainer,
    pub entry: BBId,
    /// The block every `return` jumps to. Always empty of ops; the emitter
    /// recognises reaching it as "run the epilogue and `ret`" rather than a
    /// real jump target.
    pub exit: BBId,
    /// Grows as the allocator reserves slots for spills and address-taken
    /// locals; finalised once spill iteration converges.
    pub frame_size: u32,
    /// Physical registers the allocator actually assigned somewhere in this
    /// function, for the emitter's callee-saved prologue/epilogue.
    pub used_int_regs: Set<u8>,
    pub used_float_regs: Set<u8>,
}

impl Function {
    pub fn vreg(&self, id: VRegId) -> &VReg {
        &self.vregs[id as usize]
    }

    pub fn vreg_mut(&mut self, id: VRegId) -> &mut VReg {
        &mut self.vregs[id as usize]
    }

    /// Spawns a fresh vreg with the same size/align/flonum/unsigned
    /// character as `like`, flagged [`vreg_flags::NO_SPILL`] so the allocator
    /// never picks it back up as a spill candidate. Used by spill-fixup to
    /// stand in for a spilled vreg across the one op that reads or writes it.
    pub fn spawn_temp(&mut self, like: VRegId) -> VRegId {
        let src = self.vreg(like);
        let flags = (src.flags & (vreg_flags::FLONUM | vreg_flags::UNSIGNED)) | vreg_flags::NO_SPILL;
        let id = self.vregs.len() as VRegId;
        self.vregs.push(VReg {
            id,
            size: src.size,
            align: src.align,
            flags,
            phys: None,
            const_value: None,
            frame_offset: None,
            param_index: None,
        });
        id
    }
}

/// A global's initial contents: a list of (byte-offset, bytes) leaves, as
/// produced by [`crate::front::lower::flatten_init`] and encoded to bytes by
/// the builder. Empty when the global is zero-initialised (goes in `.bss`).
#[derive(Debug)]
pub struct GlobalData {
    pub name: Id,
    pub size: u32,
    pub align: u32,
    pub init: Vec<(u32, Vec<u8>)>,
    pub exported: bool,
}

#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalData>,
}
