//! The compiled-unit artifact.
//!
//! A [`ScriptImage`] is everything the rest of the toolchain sees of a
//! compiled script: the code array, the fixup table, the import and export
//! tables, the string blob, and the global data blob. The image doubles as
//! the instruction emitter while compilation is in progress; the compiler
//! owns it exclusively and hands it out once compilation succeeds.

use rustc_hash::FxHashMap;

use crate::CompileError;
use crate::compiler::bytecode::{FixupKind, OpCode};

/// A recorded relocation: the cell holding the operand, and what it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Cell offset of the operand word inside the code array.
    pub offset: u32,
    /// What the operand refers to.
    pub kind: FixupKind,
}

/// What an export's address points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExportKind {
    /// A code cell offset (a function entry point).
    Function = 1,
    /// A byte offset into the global data blob.
    Data = 2,
}

/// A symbol this unit exposes to other units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Exported name; member functions use their qualified name.
    pub name: String,
    /// Address space the offset lives in.
    pub kind: ExportKind,
    /// Offset inside that address space.
    pub offset: u32,
}

impl Export {
    /// The packed on-disk address: kind tag in the top byte, offset below.
    pub fn packed_address(&self) -> u32 {
        ((self.kind as u32) << 24) | (self.offset & 0x00ff_ffff)
    }
}

/// A compiled script unit.
#[derive(Debug, Default)]
pub struct ScriptImage {
    /// Global variable storage, with scalar initializers already written.
    pub global_data: Vec<u8>,
    /// The code array: opcode and operand cells.
    pub code: Vec<i32>,
    /// String literals, each NUL-terminated, in emission order.
    pub strings: Vec<u8>,
    /// Relocations, in emission order.
    pub fixups: Vec<Fixup>,
    /// External names this unit references. Slots are stable once assigned.
    pub imports: Vec<String>,
    /// Symbols this unit exposes.
    pub exports: Vec<Export>,

    import_slots: FxHashMap<String, u32>,
}

impl ScriptImage {
    /// Creates an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell offset the next instruction will be emitted at.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Appends an operand-less instruction and returns its cell offset.
    pub fn emit(&mut self, op: OpCode) -> u32 {
        debug_assert_eq!(op.operand_count(), 0);
        let at = self.here();
        self.code.push(op as i32);
        at
    }

    /// Appends a one-operand instruction and returns its cell offset.
    pub fn emit1(&mut self, op: OpCode, operand: i32) -> u32 {
        debug_assert_eq!(op.operand_count(), 1);
        let at = self.here();
        self.code.push(op as i32);
        self.code.push(operand);
        at
    }

    /// Appends a two-operand instruction and returns its cell offset.
    pub fn emit2(&mut self, op: OpCode, a: i32, b: i32) -> u32 {
        debug_assert_eq!(op.operand_count(), 2);
        let at = self.here();
        self.code.push(op as i32);
        self.code.push(a);
        self.code.push(b);
        at
    }

    /// Rewrites an already-emitted cell. Used for jump back-patching and
    /// forward-call resolution.
    pub fn patch(&mut self, cell: u32, value: i32) -> Result<(), CompileError> {
        match self.code.get_mut(cell as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(CompileError::Internal(format!(
                "patch of cell {cell} beyond code end {}",
                self.code.len()
            ))),
        }
    }

    /// Records a relocation for the operand at `cell`.
    pub fn add_fixup(&mut self, cell: u32, kind: FixupKind) {
        self.fixups.push(Fixup { offset: cell, kind });
    }

    /// Appends a literal to the string blob and returns its byte offset.
    ///
    /// Identical literals each get their own entry; the blob is a log of
    /// emission order, not a deduplicated pool.
    pub fn add_string(&mut self, text: &str) -> u32 {
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(text.as_bytes());
        self.strings.push(0);
        offset
    }

    /// Returns the import slot for `name`, adding it on first use.
    pub fn find_or_add_import(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.import_slots.get(name) {
            return slot;
        }
        let slot = self.imports.len() as u32;
        self.imports.push(name.to_owned());
        self.import_slots.insert(name.to_owned(), slot);
        slot
    }

    /// Records an export.
    pub fn add_export(&mut self, name: &str, kind: ExportKind, offset: u32) {
        self.exports.push(Export {
            name: name.to_owned(),
            kind,
            offset,
        });
    }

    /// Reserves `size` zeroed bytes of global data, returning the offset.
    pub fn alloc_global(&mut self, size: u32) -> u32 {
        let offset = self.global_data.len() as u32;
        self.global_data.resize(self.global_data.len() + size as usize, 0);
        offset
    }

    /// Writes a word initializer into global data, little-endian.
    pub fn write_global_i32(&mut self, offset: u32, value: i32) {
        let at = offset as usize;
        self.global_data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a 16-bit initializer into global data, little-endian.
    pub fn write_global_i16(&mut self, offset: u32, value: i16) {
        let at = offset as usize;
        self.global_data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a byte initializer into global data.
    pub fn write_global_u8(&mut self, offset: u32, value: u8) {
        self.global_data[offset as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_returns_instruction_offsets() {
        let mut image = ScriptImage::new();
        assert_eq!(image.emit1(OpCode::PushInt, 5), 0);
        assert_eq!(image.emit(OpCode::Pop), 2);
        assert_eq!(image.emit2(OpCode::Call, 0, 1), 3);
        assert_eq!(image.here(), 6);
    }

    #[test]
    fn patch_rewrites_cells() {
        let mut image = ScriptImage::new();
        let at = image.emit1(OpCode::Jump, 0);
        image.patch(at + 1, 17).unwrap();
        assert_eq!(image.code[at as usize + 1], 17);
    }

    #[test]
    fn patch_out_of_range_is_internal_error() {
        let mut image = ScriptImage::new();
        assert!(matches!(
            image.patch(3, 0),
            Err(CompileError::Internal(_))
        ));
    }

    #[test]
    fn strings_are_nul_terminated_and_never_deduplicated() {
        let mut image = ScriptImage::new();
        let a = image.add_string("hi");
        let b = image.add_string("hi");
        assert_eq!(a, 0);
        assert_eq!(b, 3);
        assert_eq!(image.strings, b"hi\0hi\0");
    }

    #[test]
    fn imports_collapse_duplicates() {
        let mut image = ScriptImage::new();
        assert_eq!(image.find_or_add_import("Display"), 0);
        assert_eq!(image.find_or_add_import("GetTime"), 1);
        assert_eq!(image.find_or_add_import("Display"), 0);
        assert_eq!(image.imports, vec!["Display", "GetTime"]);
    }

    #[test]
    fn export_address_packs_kind_and_offset() {
        let export = Export {
            name: "Foo".into(),
            kind: ExportKind::Function,
            offset: 0x1234,
        };
        assert_eq!(export.packed_address(), 0x0100_1234);
        let data = Export {
            name: "bar".into(),
            kind: ExportKind::Data,
            offset: 8,
        };
        assert_eq!(data.packed_address(), 0x0200_0008);
    }

    #[test]
    fn global_data_initializers() {
        let mut image = ScriptImage::new();
        let a = image.alloc_global(4);
        let b = image.alloc_global(1);
        image.write_global_i32(a, 15);
        image.write_global_u8(b, b'x');
        assert_eq!(image.global_data, vec![15, 0, 0, 0, b'x']);
    }
}
