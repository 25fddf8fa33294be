//! Calling-convention tables: which physical register an argument index maps
//! to, and which registers a call clobbers. Shared by the IR builder (for
//! `pusharg` placement) and the register allocator (for forbid sets), per
//! the "Calling-convention data" design note.
//!
//! Modeled on the x86-64 System V ABI, the only target this compiler's
//! native backend emits for (the WebAssembly path bypasses IR entirely and
//! doesn't consult this table).

/// Physical integer registers, in allocator preference order. Index into
/// this table is the "physical index" stored on a [`crate::middle::tir::VReg`].
/// `rsp`/`rbp` are reserved for the frame and never allocated.
pub const INT_REG_NAMES: [&str; 14] = [
    "rax", "rdi", "rsi", "rdx", "rcx", "r8", "r9", "r10", "r11", "rbx", "r12", "r13", "r14", "r15",
];

pub const FLOAT_REG_NAMES: [&str; 8] =
    ["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"];

/// Integer argument registers in ABI order (System V): rdi, rsi, rdx, rcx,
/// r8, r9. Indices into [`INT_REG_NAMES`].
pub const INT_ARG_REGS: [u8; 6] = [1, 2, 3, 4, 5, 6];

/// Floating-point argument registers: xmm0..xmm7.
pub const FLOAT_ARG_REGS: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Caller-saved integer registers: clobbered across any `call`.
pub const CALLER_SAVED_INT: [u8; 9] = [0, 1, 2, 3, 4, 5, 6, 7, 8];

/// Callee-saved integer registers: the prologue/epilogue save-restore list.
pub const CALLEE_SAVED_INT: [u8; 5] = [9, 10, 11, 12, 13];

/// All floating registers are caller-saved under System V.
pub const CALLER_SAVED_FLOAT: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Register used to return an integer/pointer result.
pub const INT_RETURN_REG: u8 = 0; // rax

/// Register used to return a floating result.
pub const FLOAT_RETURN_REG: u8 = 0; // xmm0

/// Physical indices of `rax`/`rdx`/`rcx`, the registers `idiv`/shift-by-`%cl`
/// hardcode as scratch rather than taking an allocated operand. The register
/// allocator forbids these across the instructions that use them this way,
/// the same as it forbids caller-saved registers across a `call`.
pub const RAX: u8 = 0;
pub const RDX: u8 = 3;
pub const RCX: u8 = 4;

/// Where one argument lands, by its position among same-class arguments
/// already assigned (not its raw position in the argument list — a `float`
/// third argument after two ints still takes `xmm0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    IntReg(u8),
    FloatReg(u8),
    Stack(u32), // byte offset from the start of the stack argument area
}

/// Classify one argument's class-relative index into its ABI slot. `stack_off`
/// is advanced by the caller for each argument spilled to the stack.
pub fn classify_arg(is_float: bool, class_index: usize, stack_off: &mut u32, size: u32) -> ArgSlot {
    if is_float {
        if let Some(&r) = FLOAT_ARG_REGS.get(class_index) {
            return ArgSlot::FloatReg(r);
        }
    } else if let Some(&r) = INT_ARG_REGS.get(class_index) {
        return ArgSlot::IntReg(r);
    }
    let aligned = round_up(*stack_off, size.max(8));
    *stack_off = aligned + size.max(8);
    ArgSlot::Stack(aligned)
}

fn round_up(v: u32, align: u32) -> u32 {
    (v + align - 1) / align * align
}
