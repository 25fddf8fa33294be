//! The back-end of the compiler: x86-64 text emission, LEB128, and the
//! WebAssembly binary emitter.

pub mod asm;
pub mod leb128;
pub mod wasm;

pub use asm::emit_program;
pub use wasm::emit_module;
