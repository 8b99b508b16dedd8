//! Symbol table and stack-frame allocation.
//!
//! Scopes form a stack; scope zero holds the unit's globals and never
//! closes. Each function resets the frame allocator, then every local
//! declaration claims bytes above the frame base while the declaring scope
//! records how much it owns. Closing a scope reports exactly the bytes
//! declared since it opened, plus the frame offsets of its managed locals
//! in declaration order, so the caller can emit cleanup.
//!
//! Symbols stay addressable until their own nesting level closes; a jump
//! out of a nested scope never removes table entries.

use rustc_hash::FxHashMap;

use crate::CompileError;
use crate::ast::Type;

/// Where a symbol lives and what it is.
#[derive(Debug, Clone)]
pub enum SymbolKind {
    /// A local variable at a byte offset above the frame base.
    Local {
        /// Frame-relative byte offset.
        offset: i32,
    },
    /// A parameter at a byte offset below the frame base.
    Param {
        /// Frame-relative byte offset (negative).
        offset: i32,
    },
    /// A global variable owned by this unit.
    Global {
        /// Byte offset into the global data blob.
        offset: u32,
    },
    /// An imported global variable.
    ImportVar {
        /// Import table slot.
        slot: u32,
    },
    /// A function, defined in this unit or imported.
    Function {
        /// Index into the compiler's function registry.
        func: usize,
    },
    /// A struct type name; the layout lives in the struct index.
    StructType,
    /// An enum constant folded to its value.
    EnumConst {
        /// Constant value.
        value: i32,
    },
}

/// A named symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Kind and storage.
    pub kind: SymbolKind,
    /// Declared type. Functions carry their return type here; the full
    /// signature lives in the registry.
    pub ty: Type,
}

/// Cleanup data returned by [`SymbolTable::close_scope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeExit {
    /// Frame bytes declared in the scope, to be released.
    pub bytes: u32,
    /// Frame offsets of the scope's managed locals, declaration order.
    pub managed: Vec<u32>,
}

#[derive(Debug, Default)]
struct Scope {
    symbols: FxHashMap<String, Symbol>,
    bytes: u32,
    managed: Vec<u32>,
}

/// The scope stack and frame allocator for one compilation.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    frame_size: u32,
}

impl SymbolTable {
    /// Creates a table holding only the global scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            frame_size: 0,
        }
    }

    /// Current nesting depth; zero is the global scope.
    pub fn depth(&self) -> usize {
        self.scopes.len() - 1
    }

    /// Bytes currently allocated on the frame.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Starts a fresh frame at function entry.
    pub fn reset_frame(&mut self) {
        self.frame_size = 0;
    }

    /// Opens a nested scope.
    pub fn open_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Closes the innermost scope, reporting what it owned.
    pub fn close_scope(&mut self) -> Result<ScopeExit, CompileError> {
        if self.scopes.len() <= 1 {
            return Err(CompileError::Internal(
                "close of the global scope".into(),
            ));
        }
        let scope = self.scopes.pop().expect("scope stack is non-empty");
        self.frame_size -= scope.bytes;
        Ok(ScopeExit {
            bytes: scope.bytes,
            managed: scope.managed,
        })
    }

    /// Declares a symbol in the innermost scope.
    pub fn declare(&mut self, symbol: Symbol, line: u32) -> Result<(), CompileError> {
        let scope = self.scopes.last_mut().expect("scope stack is non-empty");
        if scope.symbols.contains_key(&symbol.name) {
            return Err(CompileError::Redeclared {
                name: symbol.name,
                line,
            });
        }
        scope.symbols.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    /// Declares a local, claiming `size` frame bytes, and returns its offset.
    pub fn alloc_local(
        &mut self,
        name: &str,
        ty: Type,
        size: u32,
        line: u32,
    ) -> Result<i32, CompileError> {
        let offset = self.frame_size as i32;
        let managed = ty.is_managed();
        self.declare(
            Symbol {
                name: name.to_owned(),
                kind: SymbolKind::Local { offset },
                ty,
            },
            line,
        )?;
        let scope = self.scopes.last_mut().expect("scope stack is non-empty");
        scope.bytes += size;
        if managed {
            scope.managed.push(offset as u32);
        }
        self.frame_size += size;
        Ok(offset)
    }

    /// Claims anonymous frame bytes (compiler temporaries).
    pub fn alloc_temp(&mut self, size: u32) -> i32 {
        let offset = self.frame_size as i32;
        let scope = self.scopes.last_mut().expect("scope stack is non-empty");
        scope.bytes += size;
        self.frame_size += size;
        offset
    }

    /// Declares a parameter at a caller-assigned negative offset.
    pub fn declare_param(
        &mut self,
        name: &str,
        ty: Type,
        offset: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        self.declare(
            Symbol {
                name: name.to_owned(),
                kind: SymbolKind::Param { offset },
                ty,
            },
            line,
        )
    }

    /// Finds a symbol, searching innermost scope outward to the globals.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.symbols.get(name))
    }

    /// Finds a symbol in the function scopes only, skipping the globals.
    pub fn lookup_above_global(&self, name: &str) -> Option<&Symbol> {
        self.scopes[1..]
            .iter()
            .rev()
            .find_map(|scope| scope.symbols.get(name))
    }

    /// Finds a symbol in the global scope only.
    pub fn lookup_global(&self, name: &str) -> Option<&Symbol> {
        self.scopes[0].symbols.get(name)
    }

    /// Frame offsets of every managed local allocated at or above
    /// `frame_mark`, in declaration order. Used for cleanup on jumps that
    /// leave several scopes at once.
    pub fn managed_since(&self, frame_mark: u32) -> Vec<u32> {
        let mut offsets = Vec::new();
        for scope in &self.scopes[1..] {
            for &offset in &scope.managed {
                if offset >= frame_mark {
                    offsets.push(offset);
                }
            }
        }
        offsets
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
