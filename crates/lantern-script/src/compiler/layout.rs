//! Struct layout and type sizing.
//!
//! `extends` is field-layout composition: a derived struct's member table is
//! the base struct's table with the derived members appended, base offsets
//! inherited verbatim. There is no dynamic dispatch and no runtime type tag.
//! Structs are packed; members narrower than a word keep their natural width
//! inside aggregates, while locals always occupy whole words.

use rustc_hash::FxHashMap;

use crate::CompileError;
use crate::ast::{FunctionSig, MemberDecl, StructDecl, Type, Visibility};

/// Bytes in a VM word.
pub const WORD: u32 = 4;

/// One member of a laid-out struct.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    /// Member name.
    pub name: String,
    /// The struct the member was declared in. Accessor and method names are
    /// qualified with this, and visibility checks run against it.
    pub owner: String,
    /// Visibility.
    pub vis: Visibility,
    /// What the member is.
    pub kind: MemberKind,
}

/// Member payload.
#[derive(Debug, Clone)]
pub enum MemberKind {
    /// A data field at a fixed byte offset.
    Field {
        /// Byte offset from the start of the struct.
        offset: u32,
        /// Field type.
        ty: Type,
    },
    /// An attribute, accessed through synthesized getter/setter calls.
    Attribute {
        /// Value type.
        ty: Type,
        /// Whether the accessors take an index argument.
        indexed: bool,
        /// Whether there is no setter.
        readonly: bool,
        /// Whether access goes through the type name.
        is_static: bool,
    },
    /// A member function.
    Method {
        /// Signature with the bare member name.
        sig: FunctionSig,
        /// Whether the method is called without an instance.
        is_static: bool,
    },
}

/// A fully laid-out struct.
#[derive(Debug, Clone)]
pub struct StructLayout {
    /// Struct name.
    pub name: String,
    /// Base struct name, if any.
    pub base: Option<String>,
    /// Whether instances are managed.
    pub managed: bool,
    /// Total size of the data fields in bytes.
    pub size: u32,
    /// Flattened member table: inherited members first, offsets verbatim.
    pub members: Vec<MemberInfo>,
}

impl StructLayout {
    /// Looks up a member by name.
    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// All struct layouts of a unit, built during the declaration pass.
#[derive(Debug, Default)]
pub struct StructIndex {
    layouts: Vec<StructLayout>,
    by_name: FxHashMap<String, usize>,
}

impl StructIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lays out a struct declaration and registers it.
    ///
    /// The base struct must already be registered; member names must be
    /// unique across the whole composed table.
    pub fn define(&mut self, decl: &StructDecl) -> Result<(), CompileError> {
        if self.by_name.contains_key(&decl.name) {
            return Err(CompileError::Redeclared {
                name: decl.name.clone(),
                line: decl.line,
            });
        }

        let (mut members, mut size) = match &decl.extends {
            Some(base) => {
                let base_layout =
                    self.get(base).ok_or_else(|| CompileError::Undeclared {
                        name: base.clone(),
                        line: decl.line,
                    })?;
                (base_layout.members.clone(), base_layout.size)
            }
            None => (Vec::new(), 0),
        };

        for member in &decl.members {
            let (name, vis, kind) = match member {
                MemberDecl::Field { name, ty, vis } => {
                    let field = MemberKind::Field {
                        offset: size,
                        ty: ty.clone(),
                    };
                    size += self.type_size(ty, decl.line)?;
                    (name, *vis, field)
                }
                MemberDecl::Attribute {
                    name,
                    ty,
                    indexed,
                    readonly,
                    is_static,
                    vis,
                } => (
                    name,
                    *vis,
                    MemberKind::Attribute {
                        ty: ty.clone(),
                        indexed: *indexed,
                        readonly: *readonly,
                        is_static: *is_static,
                    },
                ),
                MemberDecl::Method { sig, is_static, vis } => (
                    &sig.name,
                    *vis,
                    MemberKind::Method {
                        sig: sig.clone(),
                        is_static: *is_static,
                    },
                ),
            };
            if members.iter().any(|m| &m.name == name) {
                return Err(CompileError::Redeclared {
                    name: name.clone(),
                    line: decl.line,
                });
            }
            members.push(MemberInfo {
                name: name.clone(),
                owner: decl.name.clone(),
                vis,
                kind,
            });
        }

        self.by_name.insert(decl.name.clone(), self.layouts.len());
        self.layouts.push(StructLayout {
            name: decl.name.clone(),
            base: decl.extends.clone(),
            managed: decl.managed,
            size,
            members,
        });
        Ok(())
    }

    /// Looks up a struct layout by name.
    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.by_name.get(name).map(|&i| &self.layouts[i])
    }

    /// Whether `derived` is `candidate` or extends it, directly or not.
    pub fn is_same_or_derived(&self, derived: &str, candidate: &str) -> bool {
        let mut current = Some(derived);
        while let Some(name) = current {
            if name == candidate {
                return true;
            }
            current = self.get(name).and_then(|l| l.base.as_deref());
        }
        false
    }

    /// Size of a value of `ty` inside an aggregate or the global data blob.
    pub fn type_size(&self, ty: &Type, line: u32) -> Result<u32, CompileError> {
        Ok(match ty {
            Type::Char => 1,
            Type::Short => 2,
            Type::Int | Type::Float | Type::Bool | Type::String => WORD,
            Type::Pointer(_) | Type::DynArray(_) => WORD,
            Type::Struct(name) => {
                self.get(name)
                    .ok_or_else(|| CompileError::Undeclared {
                        name: name.clone(),
                        line,
                    })?
                    .size
            }
            Type::Array { elem, extents } => {
                let count: u32 = extents.iter().product();
                self.type_size(elem, line)? * count
            }
            Type::Void | Type::Null => {
                return Err(CompileError::Internal(format!(
                    "type {ty:?} has no storage size"
                )));
            }
        })
    }

    /// Size of a local of `ty`: the aggregate size rounded up to whole words.
    pub fn local_size(&self, ty: &Type, line: u32) -> Result<u32, CompileError> {
        let size = self.type_size(ty, line)?;
        Ok(size.div_ceil(WORD) * WORD)
    }
}

/// Width of a single memory access of `ty`, for load/store selection.
pub fn value_width(ty: &Type) -> u32 {
    match ty {
        Type::Char => 1,
        Type::Short => 2,
        _ => WORD,
    }
}

/// Qualified name of a member function, `Struct::member`.
pub fn qualify(struct_name: &str, member: &str) -> String {
    format!("{struct_name}::{member}")
}

/// Name of the synthesized getter for an attribute.
pub fn getter_name(owner: &str, attr: &str, indexed: bool) -> String {
    if indexed {
        qualify(owner, &format!("geti_{attr}"))
    } else {
        qualify(owner, &format!("get_{attr}"))
    }
}

/// Name of the synthesized setter for an attribute.
pub fn setter_name(owner: &str, attr: &str, indexed: bool) -> String {
    if indexed {
        qualify(owner, &format!("seti_{attr}"))
    } else {
        qualify(owner, &format!("set_{attr}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: Type) -> MemberDecl {
        MemberDecl::Field {
            name: name.into(),
            ty,
            vis: Visibility::Public,
        }
    }

    fn decl(name: &str, extends: Option<&str>, members: Vec<MemberDecl>) -> StructDecl {
        StructDecl {
            name: name.into(),
            extends: extends.map(Into::into),
            managed: false,
            members,
            line: 1,
        }
    }

    #[test]
    fn packed_field_offsets() {
        let mut index = StructIndex::new();
        index
            .define(&decl(
                "Pixel",
                None,
                vec![
                    field("r", Type::Char),
                    field("g", Type::Char),
                    field("value", Type::Int),
                ],
            ))
            .unwrap();
        let layout = index.get("Pixel").unwrap();
        assert_eq!(layout.size, 6);
        let offsets: Vec<u32> = layout
            .members
            .iter()
            .map(|m| match m.kind {
                MemberKind::Field { offset, .. } => offset,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn extends_prefixes_base_members() {
        let mut index = StructIndex::new();
        index
            .define(&decl("Base", None, vec![field("a", Type::Int)]))
            .unwrap();
        index
            .define(&decl("Derived", Some("Base"), vec![field("b", Type::Int)]))
            .unwrap();
        let layout = index.get("Derived").unwrap();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.members[0].name, "a");
        assert_eq!(layout.members[0].owner, "Base");
        assert!(matches!(
            layout.members[1].kind,
            MemberKind::Field { offset: 4, .. }
        ));
        assert!(index.is_same_or_derived("Derived", "Base"));
        assert!(!index.is_same_or_derived("Base", "Derived"));
    }

    #[test]
    fn duplicate_member_across_extends_is_redeclaration() {
        let mut index = StructIndex::new();
        index
            .define(&decl("Base", None, vec![field("a", Type::Int)]))
            .unwrap();
        let bad = decl("Derived", Some("Base"), vec![field("a", Type::Int)]);
        assert!(matches!(
            index.define(&bad),
            Err(CompileError::Redeclared { .. })
        ));
    }

    #[test]
    fn unknown_base_is_undeclared() {
        let mut index = StructIndex::new();
        let bad = decl("Derived", Some("Missing"), vec![]);
        assert!(matches!(
            index.define(&bad),
            Err(CompileError::Undeclared { .. })
        ));
    }

    #[test]
    fn array_and_local_sizes() {
        let index = StructIndex::new();
        let grid = Type::Array {
            elem: Box::new(Type::Short),
            extents: vec![3, 5],
        };
        assert_eq!(index.type_size(&grid, 1).unwrap(), 30);
        assert_eq!(index.local_size(&grid, 1).unwrap(), 32);
        assert_eq!(index.local_size(&Type::Char, 1).unwrap(), 4);
    }

    #[test]
    fn accessor_names() {
        assert_eq!(getter_name("Button", "Text", false), "Button::get_Text");
        assert_eq!(setter_name("Button", "Text", false), "Button::set_Text");
        assert_eq!(getter_name("Grid", "Cell", true), "Grid::geti_Cell");
        assert_eq!(setter_name("Grid", "Cell", true), "Grid::seti_Cell");
    }
}
