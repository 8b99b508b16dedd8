//! Bytecode compiler for Lantern script.
//!
//! Transforms the resolved tree into a linked-ready script image.
//!
//! # Module Structure
//!
//! - `bytecode`: opcode set, fixup kinds, instruction decoding
//! - `image`: the compiled-unit artifact and instruction emitter
//! - `layout`: struct member layout and type sizing
//! - `codegen`: code generation from the resolved tree
//!   - `codegen::scope`: symbol table and stack-frame allocation

pub mod bytecode;
pub mod codegen;
pub mod image;
pub mod layout;

pub use bytecode::{Decoded, FixupKind, OpCode, decode};
pub use codegen::Compiler;
pub use image::{Export, ExportKind, Fixup, ScriptImage};
