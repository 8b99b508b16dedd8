//! Code generation from the resolved tree to a script image.
//!
//! One [`Compiler`] is one compilation: it owns the symbol table, the
//! growing image, and the function registry, and nothing is shared between
//! units. Compilation is a single pass with back-patching: declarations are
//! registered first so that calls may reference functions defined later in
//! the unit; each call site emitted before its target is known gets a
//! placeholder operand and is rewritten in place once the target function
//! finishes compiling.

mod expressions;
mod scope;
mod statements;


pub use scope::{ScopeExit, Symbol, SymbolKind, SymbolTable};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::{FunctionDef, FunctionSig, Item, Literal, Type, Unit};
use crate::compiler::bytecode::{FixupKind, OpCode};
use crate::compiler::image::{ExportKind, ScriptImage};
use crate::compiler::layout::{StructIndex, WORD, qualify};
use crate::{CompileError, CompileOptions};

/// How a callable is reached from this unit.
#[derive(Debug)]
enum FuncKind {
    /// Defined in this unit.
    Script(FuncState),
    /// Resolved against another unit's exports at link time.
    Import {
        /// Import table slot.
        slot: u32,
    },
}

/// Definition state of a same-unit function.
#[derive(Debug)]
enum FuncState {
    /// Not compiled yet; call sites emitted so far hold placeholders.
    Pending {
        /// Operand cells awaiting the entry offset.
        call_sites: Vec<u32>,
    },
    /// Compiled; the entry cell offset is final.
    Defined {
        /// Entry cell offset.
        entry: u32,
    },
}

/// A registered callable: every function the unit defines, imports, or
/// synthesizes for attribute access.
#[derive(Debug)]
struct FuncEntry {
    /// Registry name; member functions are qualified (`Type::member`).
    name: String,
    /// Signature used for argument checking and default synthesis.
    sig: FunctionSig,
    /// How calls reach it.
    kind: FuncKind,
}

/// A loop or switch being compiled, for `break`/`continue` resolution.
#[derive(Debug)]
pub(crate) struct LoopCtx {
    kind: LoopKind,
    /// Frame size at body entry. Jumps out release only bytes above this.
    frame_mark: u32,
    break_patches: Vec<u32>,
    continue_patches: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    /// `while`, `do`-`while`, `for`: takes both `break` and `continue`.
    Loop,
    /// `switch`: takes `break`; `continue` passes through to the loop.
    Switch,
}

/// Compiles one resolved unit into a [`ScriptImage`].
pub struct Compiler {
    opts: CompileOptions,
    pub(crate) image: ScriptImage,
    pub(crate) syms: SymbolTable,
    pub(crate) structs: StructIndex,
    funcs: Vec<FuncEntry>,
    func_slots: FxHashMap<String, usize>,

    // Per-function state
    pub(crate) current_struct: Option<String>,
    pub(crate) current_static: bool,
    pub(crate) ret_ty: Type,
    pub(crate) loops: Vec<LoopCtx>,
    pub(crate) cur_line: u32,
    last_marked_line: u32,
}

impl Compiler {
    /// Creates a compiler with default options.
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    /// Creates a compiler with explicit options.
    pub fn with_options(opts: CompileOptions) -> Self {
        Self {
            opts,
            image: ScriptImage::new(),
            syms: SymbolTable::new(),
            structs: StructIndex::new(),
            funcs: Vec::new(),
            func_slots: FxHashMap::default(),
            current_struct: None,
            current_static: false,
            ret_ty: Type::Void,
            loops: Vec::new(),
            cur_line: 0,
            last_marked_line: 0,
        }
    }

    /// Compiles a unit into its image.
    ///
    /// The first error aborts compilation; no partial image is produced.
    pub fn compile(&mut self, unit: &Unit) -> Result<ScriptImage, CompileError> {
        debug!(unit = %unit.name, items = unit.items.len(), "compiling unit");

        self.declare_items(unit)?;
        for item in &unit.items {
            if let Item::Function(def) = item {
                self.compile_function(def)?;
            }
        }
        self.finish()?;

        debug!(
            unit = %unit.name,
            code = self.image.code.len(),
            fixups = self.image.fixups.len(),
            imports = self.image.imports.len(),
            exports = self.image.exports.len(),
            "unit assembled"
        );
        Ok(std::mem::take(&mut self.image))
    }

    // ========================================================================
    // Declaration pass
    // ========================================================================

    /// Registers every top-level declaration before any code is emitted, so
    /// forward references inside function bodies resolve.
    fn declare_items(&mut self, unit: &Unit) -> Result<(), CompileError> {
        for item in &unit.items {
            match item {
                Item::GlobalVar(var) => {
                    self.cur_line = var.line;
                    let size = self.structs.type_size(&var.ty, var.line)?;
                    let offset = self.image.alloc_global(size);
                    if let Some(init) = &var.init {
                        self.write_global_init(offset, size, init)?;
                    }
                    self.syms.declare(
                        Symbol {
                            name: var.name.clone(),
                            kind: SymbolKind::Global { offset },
                            ty: var.ty.clone(),
                        },
                        var.line,
                    )?;
                    if var.exported {
                        self.image.add_export(&var.name, ExportKind::Data, offset);
                    }
                }
                Item::ImportVar(var) => {
                    self.cur_line = var.line;
                    let slot = self.image.find_or_add_import(&var.name);
                    self.syms.declare(
                        Symbol {
                            name: var.name.clone(),
                            kind: SymbolKind::ImportVar { slot },
                            ty: var.ty.clone(),
                        },
                        var.line,
                    )?;
                }
                Item::ImportFunction(import) => {
                    self.cur_line = import.line;
                    let slot = self.image.find_or_add_import(&import.sig.name);
                    self.register_function(
                        import.sig.clone(),
                        FuncKind::Import { slot },
                        import.line,
                    )?;
                }
                Item::Enum(decl) => {
                    self.cur_line = decl.line;
                    let mut next = 0i32;
                    for (name, explicit) in &decl.variants {
                        let value = explicit.unwrap_or(next);
                        next = value.wrapping_add(1);
                        self.syms.declare(
                            Symbol {
                                name: name.clone(),
                                kind: SymbolKind::EnumConst { value },
                                ty: Type::Int,
                            },
                            decl.line,
                        )?;
                    }
                }
                Item::Struct(decl) => {
                    self.cur_line = decl.line;
                    self.structs.define(decl)?;
                    self.syms.declare(
                        Symbol {
                            name: decl.name.clone(),
                            kind: SymbolKind::StructType,
                            ty: Type::Struct(decl.name.clone()),
                        },
                        decl.line,
                    )?;
                }
                Item::Function(def) => {
                    self.cur_line = def.line;
                    if let Some(owner) = &def.struct_name {
                        if self.structs.get(owner).is_none() {
                            return Err(CompileError::Undeclared {
                                name: owner.clone(),
                                line: def.line,
                            });
                        }
                    }
                    let mut sig = def.sig.clone();
                    sig.name = self.qualified_name(def);
                    self.register_function(
                        sig,
                        FuncKind::Script(FuncState::Pending {
                            call_sites: Vec::new(),
                        }),
                        def.line,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Writes a scalar initializer into the global data blob.
    fn write_global_init(
        &mut self,
        offset: u32,
        size: u32,
        init: &Literal,
    ) -> Result<(), CompileError> {
        match (init, size) {
            (Literal::Int(v), 1) => self.image.write_global_u8(offset, *v as u8),
            (Literal::Int(v), 2) => self.image.write_global_i16(offset, *v as i16),
            (Literal::Int(v), 4) => self.image.write_global_i32(offset, *v),
            (Literal::Float(v), 4) => {
                self.image.write_global_i32(offset, v.to_bits() as i32)
            }
            (Literal::Bool(v), 4) => self.image.write_global_i32(offset, *v as i32),
            (Literal::Null, _) => {}
            _ => {
                return Err(CompileError::Internal(format!(
                    "initializer {init:?} does not fit a {size}-byte global"
                )));
            }
        }
        Ok(())
    }

    /// Registers a callable. Plain names also become global symbols;
    /// qualified member names are reached through their struct.
    fn register_function(
        &mut self,
        sig: FunctionSig,
        kind: FuncKind,
        line: u32,
    ) -> Result<usize, CompileError> {
        let name = sig.name.clone();
        if self.func_slots.contains_key(&name) {
            return Err(CompileError::Redeclared { name, line });
        }
        let index = self.funcs.len();
        let ret = sig.ret.clone();
        self.funcs.push(FuncEntry {
            name: name.clone(),
            sig,
            kind,
        });
        self.func_slots.insert(name.clone(), index);
        if !name.contains("::") {
            self.syms.declare(
                Symbol {
                    name,
                    kind: SymbolKind::Function { func: index },
                    ty: ret,
                },
                line,
            )?;
        }
        Ok(index)
    }

    // ========================================================================
    // Function compilation
    // ========================================================================

    fn qualified_name(&self, def: &FunctionDef) -> String {
        match &def.struct_name {
            Some(owner) => qualify(owner, &def.sig.name),
            None => def.sig.name.clone(),
        }
    }

    fn compile_function(&mut self, def: &FunctionDef) -> Result<(), CompileError> {
        let name = self.qualified_name(def);
        debug!(function = %name, "compiling function");

        self.cur_line = def.line;
        self.last_marked_line = 0;
        self.current_struct = def.struct_name.clone();
        self.current_static = def.is_static;
        self.ret_ty = def.sig.ret.clone();
        self.syms.reset_frame();
        self.syms.open_scope();

        // Arguments are pushed left to right, so the first parameter sits
        // deepest below the frame base.
        let count = def.sig.params.len() as i32;
        for (i, param) in def.sig.params.iter().enumerate() {
            let offset = -(WORD as i32) * (count - i as i32);
            self.syms
                .declare_param(&param.name, param.ty.clone(), offset, def.line)?;
        }

        let entry = self.image.here();
        self.mark_line(def.line);
        self.compile_block(&def.body)?;

        // Implicit return for control paths that fall off the end.
        if self.ret_ty != Type::Void {
            self.image.emit1(OpCode::PushInt, 0);
        }
        self.image.emit(OpCode::Ret);

        let exit = self.syms.close_scope()?;
        if exit.bytes != 0 {
            return Err(CompileError::Internal(format!(
                "function scope of '{name}' still owns {} frame bytes",
                exit.bytes
            )));
        }
        if !self.loops.is_empty() {
            return Err(CompileError::Internal(format!(
                "loop context leaked out of '{name}'"
            )));
        }

        self.define_function(&name, entry)?;
        if self.opts.auto_export {
            self.image.add_export(&name, ExportKind::Function, entry);
        }
        self.current_struct = None;
        self.current_static = false;
        self.ret_ty = Type::Void;
        Ok(())
    }

    /// Marks a function as compiled and patches every call emitted while it
    /// was still pending.
    fn define_function(&mut self, name: &str, entry: u32) -> Result<(), CompileError> {
        let index = *self
            .func_slots
            .get(name)
            .ok_or_else(|| CompileError::Internal(format!("'{name}' was never registered")))?;
        let FuncKind::Script(state) = &mut self.funcs[index].kind else {
            return Err(CompileError::Internal(format!(
                "import '{name}' compiled as a script function"
            )));
        };
        let FuncState::Pending { call_sites } = state else {
            return Err(CompileError::Internal(format!("'{name}' compiled twice")));
        };
        let pending = std::mem::take(call_sites);
        *state = FuncState::Defined { entry };
        for cell in pending {
            self.image.patch(cell, entry as i32)?;
        }
        Ok(())
    }

    /// End-of-unit check: every referenced same-unit function must exist.
    fn finish(&self) -> Result<(), CompileError> {
        for func in &self.funcs {
            if let FuncKind::Script(FuncState::Pending { call_sites }) = &func.kind {
                if !call_sites.is_empty() {
                    return Err(CompileError::UnresolvedFunction {
                        name: func.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Registry access used by the call-site compiler
    // ========================================================================

    /// Looks up a registered callable by (possibly qualified) name.
    pub(crate) fn lookup_function(&self, name: &str) -> Result<usize, CompileError> {
        self.func_slots
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::Undeclared {
                name: name.to_owned(),
                line: self.cur_line,
            })
    }

    /// Whether a callable with this exact name is registered.
    pub(crate) fn has_function(&self, name: &str) -> bool {
        self.func_slots.contains_key(name)
    }

    /// Signature of a registered callable.
    pub(crate) fn function_sig(&self, index: usize) -> &FunctionSig {
        &self.funcs[index].sig
    }

    /// Registry name of a callable, for diagnostics.
    pub(crate) fn function_name(&self, index: usize) -> &str {
        &self.funcs[index].name
    }

    /// Registers an accessor that is not defined in this unit as an import.
    /// Accessor names referenced by several sites share one slot.
    pub(crate) fn register_accessor_import(
        &mut self,
        sig: FunctionSig,
    ) -> Result<usize, CompileError> {
        let slot = self.image.find_or_add_import(&sig.name);
        self.register_function(sig, FuncKind::Import { slot }, self.cur_line)
    }

    /// Emits a call to a registered callable with `argc` arguments already
    /// pushed. Records the matching fixup, and a pending patch when the
    /// target is a forward reference.
    pub(crate) fn emit_call(&mut self, index: usize, argc: u32) -> Result<(), CompileError> {
        enum Target {
            Import(u32),
            Entry(u32),
            Forward,
        }
        let target = match &self.funcs[index].kind {
            FuncKind::Import { slot } => Target::Import(*slot),
            FuncKind::Script(FuncState::Defined { entry }) => Target::Entry(*entry),
            FuncKind::Script(FuncState::Pending { .. }) => Target::Forward,
        };
        match target {
            Target::Import(slot) => {
                let at = self
                    .image
                    .emit2(OpCode::CallImport, slot as i32, argc as i32);
                self.image.add_fixup(at + 1, FixupKind::Import);
            }
            Target::Entry(entry) => {
                let at = self.image.emit2(OpCode::Call, entry as i32, argc as i32);
                self.image.add_fixup(at + 1, FixupKind::Code);
            }
            Target::Forward => {
                let at = self.image.emit2(OpCode::Call, 0, argc as i32);
                self.image.add_fixup(at + 1, FixupKind::Code);
                if let FuncKind::Script(FuncState::Pending { call_sites }) =
                    &mut self.funcs[index].kind
                {
                    call_sites.push(at + 1);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Emission helpers
    // ========================================================================

    /// Emits a forward jump with a placeholder and returns its operand cell.
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> u32 {
        self.image.emit1(op, 0) + 1
    }

    /// Patches a forward jump to land on the next emitted instruction.
    pub(crate) fn patch_jump_here(&mut self, operand_cell: u32) -> Result<(), CompileError> {
        let target = self.image.here();
        self.patch_jump_to(operand_cell, target)
    }

    /// Patches a jump operand to a known cell target. Jump operands are
    /// relative to the cell after the operand and never enter the fixup
    /// table.
    pub(crate) fn patch_jump_to(
        &mut self,
        operand_cell: u32,
        target: u32,
    ) -> Result<(), CompileError> {
        let rel = target as i32 - (operand_cell as i32 + 1);
        self.image.patch(operand_cell, rel)
    }

    /// Emits a backward jump to an already-known target.
    pub(crate) fn emit_jump_back(&mut self, op: OpCode, target: u32) {
        let rel = target as i32 - (self.image.here() as i32 + 2);
        self.image.emit1(op, rel);
    }

    /// Tracks the current source line and, when enabled, interleaves a line
    /// marker instruction on every line change.
    pub(crate) fn mark_line(&mut self, line: u32) {
        if line == 0 {
            return;
        }
        self.cur_line = line;
        if self.opts.emit_line_numbers && line != self.last_marked_line {
            self.image.emit1(OpCode::LineNum, line as i32);
            self.last_marked_line = line;
        }
    }

    // ========================================================================
    // Loop context plumbing
    // ========================================================================

    pub(crate) fn push_loop(&mut self) {
        self.loops.push(LoopCtx {
            kind: LoopKind::Loop,
            frame_mark: self.syms.frame_size(),
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
        });
    }

    pub(crate) fn push_switch(&mut self) {
        self.loops.push(LoopCtx {
            kind: LoopKind::Switch,
            frame_mark: self.syms.frame_size(),
            break_patches: Vec::new(),
            continue_patches: Vec::new(),
        });
    }

    pub(crate) fn pop_loop(&mut self) -> Result<LoopCtx, CompileError> {
        self.loops
            .pop()
            .ok_or_else(|| CompileError::Internal("loop context stack underflow".into()))
    }

    /// Records a `break` jump against the innermost loop or switch.
    pub(crate) fn record_break(&mut self, cell: u32) -> Result<(), CompileError> {
        match self.loops.last_mut() {
            Some(ctx) => {
                ctx.break_patches.push(cell);
                Ok(())
            }
            None => Err(CompileError::Internal(
                "break outside of a loop or switch".into(),
            )),
        }
    }

    /// Records a `continue` jump against the innermost loop, skipping
    /// switches.
    pub(crate) fn record_continue(&mut self, cell: u32) -> Result<(), CompileError> {
        match self
            .loops
            .iter_mut()
            .rev()
            .find(|ctx| ctx.kind == LoopKind::Loop)
        {
            Some(ctx) => {
                ctx.continue_patches.push(cell);
                Ok(())
            }
            None => Err(CompileError::Internal("continue outside of a loop".into())),
        }
    }

    /// Frame mark of the context a `break` targets.
    pub(crate) fn break_mark(&self) -> Result<u32, CompileError> {
        self.loops
            .last()
            .map(|ctx| ctx.frame_mark)
            .ok_or_else(|| CompileError::Internal("break outside of a loop or switch".into()))
    }

    /// Frame mark of the context a `continue` targets.
    pub(crate) fn continue_mark(&self) -> Result<u32, CompileError> {
        self.loops
            .iter()
            .rev()
            .find(|ctx| ctx.kind == LoopKind::Loop)
            .map(|ctx| ctx.frame_mark)
            .ok_or_else(|| CompileError::Internal("continue outside of a loop".into()))
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}
