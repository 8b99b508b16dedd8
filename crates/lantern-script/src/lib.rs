// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Lantern Engine Developers

//! # lantern-script
//!
//! The bytecode compiler for the Lantern scripting language.
//!
//! ## Overview
//!
//! This crate takes a parsed, name- and type-resolved script and produces a
//! [`ScriptImage`]: a linear bytecode stream for the engine's stack VM,
//! together with the relocation tables that let the linker bind it against
//! globals, string literals, other compiled scripts, and engine-implemented
//! import functions. It provides:
//!
//! - Symbol and scope management with struct member namespaces
//! - Stack-frame allocation with exact reserve/release bookkeeping
//! - Control-flow compilation with relative, back-patched jumps
//! - Reference-count bookkeeping around managed pointers
//! - Call compilation with forward references and default arguments
//! - Import/export tables and a string-literal blob
//!
//! Parsing, type checking, and execution live elsewhere; the compiler
//! consumes an [`ast::Unit`] and is deterministic: the same input always
//! produces a byte-identical image.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lantern_script::{Compiler, ast};
//!
//! let unit: ast::Unit = front_end_output();
//! let image = Compiler::new().compile(&unit)?;
//! linker.add_unit(image);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod compiler;

pub use compiler::bytecode::{DecodeError, Decoded, FixupKind, OpCode, decode};
pub use compiler::codegen::Compiler;
pub use compiler::image::{Export, ExportKind, Fixup, ScriptImage};

use thiserror::Error;

/// Options affecting code generation.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Interleave source-line marker instructions on every line change.
    pub emit_line_numbers: bool,
    /// Export every compiled function automatically. Exported globals are
    /// always exported regardless.
    pub auto_export: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            emit_line_numbers: false,
            auto_export: true,
        }
    }
}

/// Errors produced while compiling a unit.
///
/// The first error aborts the unit; there is no partial image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A name is already bound in the active scope or namespace.
    #[error("line {line}: '{name}' is already defined")]
    Redeclared {
        /// The conflicting name.
        name: String,
        /// Line of the later declaration.
        line: u32,
    },
    /// A name was not found in any visible scope.
    #[error("line {line}: undefined symbol '{name}'")]
    Undeclared {
        /// The unresolved name.
        name: String,
        /// Line of the reference.
        line: u32,
    },
    /// A write to a protected or write-protected member, or to a readonly
    /// attribute, from outside its permitted context.
    #[error("line {line}: '{name}' cannot be modified from here")]
    AccessViolation {
        /// The refused member.
        name: String,
        /// Line of the access.
        line: u32,
    },
    /// A call supplied too many arguments, or omitted one with no default.
    #[error("line {line}: wrong number of arguments to '{name}'")]
    WrongArgumentCount {
        /// The callee.
        name: String,
        /// Line of the call.
        line: u32,
    },
    /// A function was called but never defined by the end of the unit.
    #[error("function '{name}' is called but never defined")]
    UnresolvedFunction {
        /// The missing function.
        name: String,
    },
    /// Offset arithmetic or fixup bookkeeping went inconsistent. Always a
    /// compiler bug, never a script error.
    #[error("internal compiler error: {0}")]
    Internal(String),
}
