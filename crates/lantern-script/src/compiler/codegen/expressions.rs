//! Expression compilation.
//!
//! Values are computed onto the VM stack. Anything addressable compiles
//! through a [`Place`]: either a memory place, whose address is folded onto
//! the stack out of a base address plus field offsets and index arithmetic
//! (re-dereferencing at every managed pointer boundary), or an attribute,
//! which never touches memory directly and is rewritten into synthesized
//! getter/setter calls.
//!
//! Managed values follow an ownership discipline: `new` expressions and
//! calls returning managed values leave a handle whose reference the store
//! consumes, while plain loads do not own a reference, so storing them emits
//! an increment. Assignment into a managed slot always decrements the old
//! value first.

use crate::CompileError;
use crate::ast::{BinOp, Expr, FunctionSig, Literal, Param, Type, UnOp, Visibility};
use crate::compiler::bytecode::{FixupKind, OpCode};
use crate::compiler::codegen::{Compiler, SymbolKind};
use crate::compiler::layout::{
    MemberInfo, MemberKind, WORD, getter_name, qualify, setter_name, value_width,
};

/// Write-guard carried by member places for visibility enforcement.
#[derive(Debug, Clone)]
pub(crate) struct MemberGuard {
    name: String,
    owner: String,
    vis: Visibility,
}

/// A resolved attribute access, compiled to accessor calls on demand.
#[derive(Debug, Clone)]
pub(crate) struct AttrRef {
    owner: String,
    name: String,
    ty: Type,
    indexed: bool,
    readonly: bool,
    is_static: bool,
    vis: Visibility,
    /// Receiver expression; `None` for static attributes.
    base: Option<Expr>,
    /// Index expressions for indexed attributes.
    indices: Vec<Expr>,
}

/// An addressable location.
#[derive(Debug, Clone)]
pub(crate) enum Place {
    /// The address is on the stack; reads and writes go through memory.
    Memory {
        ty: Type,
        width: u32,
        guard: Option<MemberGuard>,
    },
    /// Accessor-mediated; nothing has been emitted yet.
    Attribute(AttrRef),
}

/// How an identifier resolves at the current point.
enum IdentRes {
    Frame { offset: i32, ty: Type },
    Member(MemberInfo),
    Global { offset: u32, ty: Type },
    ImportVar { slot: u32, ty: Type },
    EnumConst(i32),
    Function(usize),
    StructType,
}

impl Compiler {
    // ========================================================================
    // Values
    // ========================================================================

    /// Compiles an expression, leaving its value on the stack, and returns
    /// its type. `Void` means nothing was left on the stack.
    pub(crate) fn compile_expr(&mut self, expr: &Expr) -> Result<Type, CompileError> {
        match expr {
            Expr::Literal(lit) => self.compile_literal(lit),
            Expr::Ident(name) => self.compile_ident_value(name),
            Expr::This => Err(CompileError::Internal(
                "the current instance cannot be used as a plain value".into(),
            )),
            Expr::Unary { op, operand } => self.compile_unary(*op, operand),
            Expr::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs),
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => self.compile_ternary(cond, then.as_deref(), otherwise),
            Expr::Field { .. } | Expr::Index { .. } => {
                let place = self.compile_place(expr)?;
                self.read_place(place)
            }
            Expr::Call { callee, args } => self.compile_call(callee, args),
            Expr::NewObject { struct_name } => self.compile_new_object(struct_name),
            Expr::NewArray { elem, count } => {
                self.compile_expr(count)?;
                let size = self.structs.type_size(elem, self.cur_line)?;
                self.image.emit1(OpCode::NewArray, size as i32);
                Ok(Type::DynArray(Box::new(elem.clone())))
            }
        }
    }

    /// Whether the expression's result already owns a reference that a
    /// store will consume.
    pub(crate) fn owns_reference(expr: &Expr, ty: &Type) -> bool {
        match expr {
            Expr::NewObject { .. } | Expr::NewArray { .. } => true,
            Expr::Call { .. } => ty.is_managed(),
            _ => false,
        }
    }

    /// Emits the increment for storing a borrowed managed value.
    pub(crate) fn emit_store_addref(&mut self, target_ty: &Type, value: &Expr, value_ty: &Type) {
        if target_ty.is_managed()
            && !matches!(value_ty, Type::Null)
            && !Self::owns_reference(value, value_ty)
        {
            self.image.emit(OpCode::AddRef);
        }
    }

    pub(crate) fn compile_literal(&mut self, lit: &Literal) -> Result<Type, CompileError> {
        Ok(match lit {
            Literal::Int(v) => {
                self.image.emit1(OpCode::PushInt, *v);
                Type::Int
            }
            Literal::Float(v) => {
                self.image.emit1(OpCode::PushFloat, v.to_bits() as i32);
                Type::Float
            }
            Literal::Bool(v) => {
                self.image.emit1(OpCode::PushInt, *v as i32);
                Type::Bool
            }
            Literal::String(text) => {
                let offset = self.image.add_string(text);
                let at = self.image.emit1(OpCode::PushString, offset as i32);
                self.image.add_fixup(at + 1, FixupKind::StringTable);
                Type::String
            }
            Literal::Null => {
                self.image.emit1(OpCode::PushInt, 0);
                Type::Null
            }
        })
    }

    fn compile_ident_value(&mut self, name: &str) -> Result<Type, CompileError> {
        match self.resolve_ident(name)? {
            IdentRes::Frame { offset, ty } => {
                self.check_scalar(&ty, name)?;
                self.image.emit1(OpCode::LocalAddr, offset);
                self.image.emit(OpCode::Load);
                Ok(ty)
            }
            IdentRes::Member(member) => match &member.kind {
                MemberKind::Field { offset, ty } => {
                    let ty = ty.clone();
                    self.check_scalar(&ty, name)?;
                    self.emit_this_field_addr(*offset)?;
                    self.emit_load(value_width(&ty));
                    Ok(ty)
                }
                MemberKind::Attribute { .. } => {
                    let attr = self.attr_ref(&member, Some(Expr::This), Vec::new())?;
                    self.read_attribute(&attr)
                }
                MemberKind::Method { .. } => Err(CompileError::Internal(format!(
                    "method '{name}' used as a value"
                ))),
            },
            IdentRes::Global { offset, ty } => {
                self.check_scalar(&ty, name)?;
                let at = self.image.emit1(OpCode::GlobalAddr, offset as i32);
                self.image.add_fixup(at + 1, FixupKind::GlobalData);
                self.emit_load(value_width(&ty));
                Ok(ty)
            }
            IdentRes::ImportVar { slot, ty } => {
                self.check_scalar(&ty, name)?;
                let at = self.image.emit1(OpCode::ImportAddr, slot as i32);
                self.image.add_fixup(at + 1, FixupKind::Import);
                self.emit_load(value_width(&ty));
                Ok(ty)
            }
            IdentRes::EnumConst(value) => {
                self.image.emit1(OpCode::PushInt, value);
                Ok(Type::Int)
            }
            IdentRes::Function(_) | IdentRes::StructType => Err(CompileError::Internal(
                format!("'{name}' is not a value"),
            )),
        }
    }

    fn compile_unary(&mut self, op: UnOp, operand: &Expr) -> Result<Type, CompileError> {
        let ty = self.compile_expr(operand)?;
        Ok(match op {
            UnOp::Neg => {
                if matches!(ty, Type::Float) {
                    self.image.emit(OpCode::FNeg);
                } else {
                    self.image.emit(OpCode::Neg);
                }
                ty
            }
            UnOp::Not => {
                self.image.emit(OpCode::Not);
                Type::Int
            }
            UnOp::BitNot => {
                self.image.emit(OpCode::BitNot);
                Type::Int
            }
        })
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Type, CompileError> {
        let lty = self.compile_expr(lhs)?;
        self.compile_expr(rhs)?;
        let float = matches!(lty, Type::Float);
        self.image.emit(binary_opcode(op, float)?);
        Ok(match op {
            BinOp::Eq
            | BinOp::Ne
            | BinOp::Lt
            | BinOp::Le
            | BinOp::Gt
            | BinOp::Ge
            | BinOp::And
            | BinOp::Or => Type::Int,
            _ => lty,
        })
    }

    fn compile_ternary(
        &mut self,
        cond: &Expr,
        then: Option<&Expr>,
        otherwise: &Expr,
    ) -> Result<Type, CompileError> {
        match then {
            Some(then) => {
                self.compile_expr(cond)?;
                let skip_then = self.emit_jump(OpCode::JumpZero);
                let ty = self.compile_expr(then)?;
                let skip_else = self.emit_jump(OpCode::Jump);
                self.patch_jump_here(skip_then)?;
                self.compile_expr(otherwise)?;
                self.patch_jump_here(skip_else)?;
                Ok(ty)
            }
            None => {
                // Coalescing form: keep the condition value when non-zero.
                let ty = self.compile_expr(cond)?;
                self.image.emit(OpCode::Dup);
                let keep = self.emit_jump(OpCode::JumpNotZero);
                self.image.emit(OpCode::Pop);
                self.compile_expr(otherwise)?;
                self.patch_jump_here(keep)?;
                Ok(ty)
            }
        }
    }

    fn compile_new_object(&mut self, struct_name: &str) -> Result<Type, CompileError> {
        let layout = self
            .structs
            .get(struct_name)
            .ok_or_else(|| CompileError::Undeclared {
                name: struct_name.to_owned(),
                line: self.cur_line,
            })?;
        if !layout.managed {
            return Err(CompileError::Internal(format!(
                "'new' applied to unmanaged struct '{struct_name}'"
            )));
        }
        let size = layout.size;
        self.image.emit1(OpCode::NewObject, size as i32);
        Ok(Type::Pointer(struct_name.to_owned()))
    }

    // ========================================================================
    // Places: the struct/array address resolver
    // ========================================================================

    /// Resolves an addressable expression. For memory places the address is
    /// on the stack afterwards; attribute places emit nothing yet.
    pub(crate) fn compile_place(&mut self, expr: &Expr) -> Result<Place, CompileError> {
        match expr {
            Expr::Ident(name) => self.ident_place(name),
            Expr::This => {
                self.require_instance_context()?;
                let owner = self.current_struct.clone().expect("instance context");
                self.image.emit(OpCode::PushThis);
                Ok(Place::Memory {
                    ty: Type::Struct(owner),
                    width: WORD,
                    guard: None,
                })
            }
            Expr::Field { base, name } => self.field_place(base, name),
            Expr::Index { base, indices } => self.index_place(base, indices),
            _ => Err(CompileError::Internal(
                "expression is not an addressable place".into(),
            )),
        }
    }

    /// Reads a place as a value.
    pub(crate) fn read_place(&mut self, place: Place) -> Result<Type, CompileError> {
        match place {
            Place::Memory { ty, width, .. } => {
                if matches!(ty, Type::Struct(_) | Type::Array { .. }) {
                    return Err(CompileError::Internal(
                        "aggregate read without a member or index".into(),
                    ));
                }
                self.emit_load(width);
                Ok(ty)
            }
            Place::Attribute(attr) => self.read_attribute(&attr),
        }
    }

    fn ident_place(&mut self, name: &str) -> Result<Place, CompileError> {
        match self.resolve_ident(name)? {
            IdentRes::Frame { offset, ty } => {
                self.image.emit1(OpCode::LocalAddr, offset);
                Ok(Place::Memory {
                    ty,
                    width: WORD,
                    guard: None,
                })
            }
            IdentRes::Member(member) => match &member.kind {
                MemberKind::Field { offset, ty } => {
                    let guard = Some(MemberGuard {
                        name: member.name.clone(),
                        owner: member.owner.clone(),
                        vis: member.vis,
                    });
                    let ty = ty.clone();
                    self.emit_this_field_addr(*offset)?;
                    Ok(Place::Memory {
                        width: value_width(&ty),
                        ty,
                        guard,
                    })
                }
                MemberKind::Attribute { .. } => {
                    let attr = self.attr_ref(&member, Some(Expr::This), Vec::new())?;
                    Ok(Place::Attribute(attr))
                }
                MemberKind::Method { .. } => Err(CompileError::Internal(format!(
                    "method '{name}' used as a place"
                ))),
            },
            IdentRes::Global { offset, ty } => {
                let at = self.image.emit1(OpCode::GlobalAddr, offset as i32);
                self.image.add_fixup(at + 1, FixupKind::GlobalData);
                Ok(Place::Memory {
                    width: value_width(&ty),
                    ty,
                    guard: None,
                })
            }
            IdentRes::ImportVar { slot, ty } => {
                let at = self.image.emit1(OpCode::ImportAddr, slot as i32);
                self.image.add_fixup(at + 1, FixupKind::Import);
                Ok(Place::Memory {
                    width: value_width(&ty),
                    ty,
                    guard: None,
                })
            }
            IdentRes::EnumConst(_) | IdentRes::Function(_) | IdentRes::StructType => Err(
                CompileError::Internal(format!("'{name}' is not assignable")),
            ),
        }
    }

    fn field_place(&mut self, base: &Expr, name: &str) -> Result<Place, CompileError> {
        // Static members are reached through the type name.
        if let Expr::Ident(type_name) = base {
            if self.is_struct_type(type_name) {
                let member = self.find_member(type_name, name)?;
                self.check_protected(&member)?;
                return match &member.kind {
                    MemberKind::Attribute { is_static: true, .. } => {
                        Ok(Place::Attribute(self.attr_ref(&member, None, Vec::new())?))
                    }
                    MemberKind::Attribute { .. } => Err(CompileError::Internal(format!(
                        "instance attribute '{name}' accessed through the type name"
                    ))),
                    MemberKind::Field { .. } => Err(CompileError::Internal(format!(
                        "field '{name}' accessed through the type name"
                    ))),
                    MemberKind::Method { .. } => Err(CompileError::Internal(format!(
                        "method '{name}' used as a place"
                    ))),
                };
            }
        }

        let owner = self.receiver_struct_of(base)?;
        let member = self.find_member(&owner, name)?;
        self.check_protected(&member)?;
        match &member.kind {
            MemberKind::Field { offset, ty } => {
                let ty = ty.clone();
                let offset = *offset;
                self.push_receiver(base)?;
                if offset != 0 {
                    self.image.emit1(OpCode::PushInt, offset as i32);
                    self.image.emit(OpCode::Add);
                }
                Ok(Place::Memory {
                    width: value_width(&ty),
                    ty,
                    guard: Some(MemberGuard {
                        name: member.name.clone(),
                        owner: member.owner.clone(),
                        vis: member.vis,
                    }),
                })
            }
            MemberKind::Attribute { .. } => {
                let attr = self.attr_ref(&member, Some(base.clone()), Vec::new())?;
                Ok(Place::Attribute(attr))
            }
            MemberKind::Method { .. } => Err(CompileError::Internal(format!(
                "method '{name}' used as a place"
            ))),
        }
    }

    fn index_place(&mut self, base: &Expr, indices: &[Expr]) -> Result<Place, CompileError> {
        // `obj.Attr[i]` over an indexed attribute routes the index into the
        // accessor call instead of address arithmetic.
        if let Some(mut attr) = self.indexed_attr_target(base)? {
            if indices.len() != 1 {
                return Err(CompileError::Internal(format!(
                    "indexed attribute '{}' takes exactly one index",
                    attr.name
                )));
            }
            attr.indices = indices.to_vec();
            return Ok(Place::Attribute(attr));
        }

        // Get the array storage: static arrays are addressed in place,
        // dynamic arrays hold a handle that is checked and dereferenced.
        let (array_ty, guard) = match base {
            Expr::Call { .. } | Expr::NewArray { .. } => {
                let ty = self.compile_expr(base)?;
                match ty {
                    Type::DynArray(_) => {
                        self.image.emit(OpCode::CheckNull);
                        self.image.emit(OpCode::Deref);
                        (ty, None)
                    }
                    _ => {
                        return Err(CompileError::Internal(
                            "indexed expression is not an array".into(),
                        ));
                    }
                }
            }
            _ => match self.compile_place(base)? {
                Place::Memory {
                    ty: ty @ Type::Array { .. },
                    guard,
                    ..
                } => (ty, guard),
                Place::Memory {
                    ty: ty @ Type::DynArray(_),
                    guard,
                    ..
                } => {
                    self.image.emit(OpCode::Load);
                    self.image.emit(OpCode::CheckNull);
                    self.image.emit(OpCode::Deref);
                    (ty, guard)
                }
                Place::Attribute(attr) => {
                    let ty = self.read_attribute(&attr)?;
                    if !matches!(ty, Type::DynArray(_)) {
                        return Err(CompileError::Internal(
                            "indexed attribute value is not an array".into(),
                        ));
                    }
                    self.image.emit(OpCode::CheckNull);
                    self.image.emit(OpCode::Deref);
                    (ty, None)
                }
                Place::Memory { .. } => {
                    return Err(CompileError::Internal(
                        "indexed expression is not an array".into(),
                    ));
                }
            },
        };

        match array_ty {
            Type::Array { elem, extents } => {
                if indices.len() != extents.len() {
                    return Err(CompileError::Internal(format!(
                        "array expects {} indices, got {}",
                        extents.len(),
                        indices.len()
                    )));
                }
                // Row-major: fold each dimension into the accumulator before
                // adding the next index.
                for (dim, index) in indices.iter().enumerate() {
                    if dim > 0 {
                        self.image.emit1(OpCode::PushInt, extents[dim] as i32);
                        self.image.emit(OpCode::Mul);
                    }
                    self.compile_expr(index)?;
                    self.image.emit1(OpCode::CheckBounds, extents[dim] as i32);
                    if dim > 0 {
                        self.image.emit(OpCode::Add);
                    }
                }
                let size = self.structs.type_size(&elem, self.cur_line)?;
                if size != 1 {
                    self.image.emit1(OpCode::PushInt, size as i32);
                    self.image.emit(OpCode::Mul);
                }
                self.image.emit(OpCode::Add);
                Ok(Place::Memory {
                    width: value_width(&elem),
                    ty: *elem,
                    guard,
                })
            }
            Type::DynArray(elem) => {
                if indices.len() != 1 {
                    return Err(CompileError::Internal(
                        "dynamic arrays take exactly one index".into(),
                    ));
                }
                self.compile_expr(&indices[0])?;
                let size = self.structs.type_size(&elem, self.cur_line)?;
                if size != 1 {
                    self.image.emit1(OpCode::PushInt, size as i32);
                    self.image.emit(OpCode::Mul);
                }
                self.image.emit(OpCode::Add);
                Ok(Place::Memory {
                    width: value_width(&elem),
                    ty: *elem,
                    guard: None,
                })
            }
            _ => unreachable!("array storage checked above"),
        }
    }

    /// Pushes the payload address of a member-access receiver and returns
    /// the struct it belongs to. Managed receivers are null-checked and
    /// dereferenced; struct values are addressed in place.
    fn push_receiver(&mut self, base: &Expr) -> Result<String, CompileError> {
        match base {
            Expr::This => {
                self.require_instance_context()?;
                self.image.emit(OpCode::PushThis);
                Ok(self.current_struct.clone().expect("instance context"))
            }
            Expr::Call { .. } | Expr::NewObject { .. } => {
                let ty = self.compile_expr(base)?;
                match ty {
                    Type::Pointer(name) => {
                        self.image.emit(OpCode::CheckNull);
                        self.image.emit(OpCode::Deref);
                        Ok(name)
                    }
                    _ => Err(CompileError::Internal(
                        "member access through a non-struct value".into(),
                    )),
                }
            }
            _ => match self.compile_place(base)? {
                Place::Memory {
                    ty: Type::Struct(name),
                    ..
                } => Ok(name),
                Place::Memory {
                    ty: Type::Pointer(name),
                    ..
                } => {
                    self.image.emit(OpCode::Load);
                    self.image.emit(OpCode::CheckNull);
                    self.image.emit(OpCode::Deref);
                    Ok(name)
                }
                Place::Attribute(attr) => match self.read_attribute(&attr)? {
                    Type::Pointer(name) => {
                        self.image.emit(OpCode::CheckNull);
                        self.image.emit(OpCode::Deref);
                        Ok(name)
                    }
                    _ => Err(CompileError::Internal(
                        "member access through a non-struct attribute".into(),
                    )),
                },
                Place::Memory { .. } => Err(CompileError::Internal(
                    "member access through a non-struct value".into(),
                )),
            },
        }
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Compiles plain or compound assignment into a place.
    pub(crate) fn compile_assign(
        &mut self,
        target: &Expr,
        op: Option<BinOp>,
        value: &Expr,
    ) -> Result<(), CompileError> {
        match self.compile_place(target)? {
            Place::Memory { ty, width, guard } => {
                self.check_write_guard(&guard)?;
                if matches!(ty, Type::Struct(_) | Type::Array { .. }) {
                    return Err(CompileError::Internal(
                        "aggregates cannot be assigned as a whole".into(),
                    ));
                }
                match op {
                    Some(op) => {
                        self.image.emit(OpCode::Dup);
                        self.emit_load(width);
                        self.compile_expr(value)?;
                        let float = matches!(ty, Type::Float);
                        self.image.emit(binary_opcode(op, float)?);
                        self.emit_store(width);
                    }
                    None => {
                        // Old value out, new value in, in that order.
                        if ty.is_managed() {
                            self.image.emit(OpCode::DecRefAt);
                        }
                        let vty = self.compile_expr(value)?;
                        self.emit_store_addref(&ty, value, &vty);
                        self.emit_store(width);
                    }
                }
                Ok(())
            }
            Place::Attribute(attr) => self.write_attribute(&attr, op, value),
        }
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    fn attr_ref(
        &self,
        member: &MemberInfo,
        base: Option<Expr>,
        indices: Vec<Expr>,
    ) -> Result<AttrRef, CompileError> {
        self.check_protected(member)?;
        let MemberKind::Attribute {
            ty,
            indexed,
            readonly,
            is_static,
        } = &member.kind
        else {
            return Err(CompileError::Internal(format!(
                "'{}' is not an attribute",
                member.name
            )));
        };
        if !*is_static && base.is_none() {
            return Err(CompileError::Internal(format!(
                "instance attribute '{}' needs a receiver",
                member.name
            )));
        }
        Ok(AttrRef {
            owner: member.owner.clone(),
            name: member.name.clone(),
            ty: ty.clone(),
            indexed: *indexed,
            readonly: *readonly,
            is_static: *is_static,
            vis: member.vis,
            base: if *is_static { None } else { base },
            indices,
        })
    }

    /// Detects `obj.Attr` bases that resolve to an indexed attribute, so the
    /// enclosing index expression becomes the accessor's argument.
    fn indexed_attr_target(&self, base: &Expr) -> Result<Option<AttrRef>, CompileError> {
        let Expr::Field { base: inner, name } = base else {
            return Ok(None);
        };
        if let Expr::Ident(type_name) = inner.as_ref() {
            if self.is_struct_type(type_name) {
                let member = self.find_member(type_name, name)?;
                if matches!(member.kind, MemberKind::Attribute { indexed: true, .. }) {
                    return Ok(Some(self.attr_ref(&member, None, Vec::new())?));
                }
                return Ok(None);
            }
        }
        let Ok(base_ty) = self.static_type_of(inner) else {
            return Ok(None);
        };
        let Some(owner) = struct_name_of(&base_ty) else {
            return Ok(None);
        };
        let member = self.find_member(&owner, name)?;
        if matches!(member.kind, MemberKind::Attribute { indexed: true, .. }) {
            return Ok(Some(self.attr_ref(
                &member,
                Some((**inner).clone()),
                Vec::new(),
            )?));
        }
        Ok(None)
    }

    fn read_attribute(&mut self, attr: &AttrRef) -> Result<Type, CompileError> {
        self.check_attr_indices(attr)?;
        let indices = attr.indices.clone();
        for index in &indices {
            self.compile_expr(index)?;
        }
        if !attr.is_static {
            let base = attr.base.clone().ok_or_else(|| {
                CompileError::Internal(format!("attribute '{}' lost its receiver", attr.name))
            })?;
            self.push_receiver(&base)?;
            self.image.emit(OpCode::SetThis);
        }
        let getter = self.resolve_accessor(attr, true)?;
        self.emit_call(getter, indices.len() as u32)?;
        Ok(attr.ty.clone())
    }

    fn write_attribute(
        &mut self,
        attr: &AttrRef,
        op: Option<BinOp>,
        value: &Expr,
    ) -> Result<(), CompileError> {
        if attr.readonly {
            return Err(CompileError::AccessViolation {
                name: attr.name.clone(),
                line: self.cur_line,
            });
        }
        if attr.vis == Visibility::WriteProtected && !self.inside_struct(&attr.owner) {
            return Err(CompileError::AccessViolation {
                name: attr.name.clone(),
                line: self.cur_line,
            });
        }
        self.check_attr_indices(attr)?;

        match op {
            None => {
                let indices = attr.indices.clone();
                for index in &indices {
                    self.compile_expr(index)?;
                }
                self.compile_expr(value)?;
                self.emit_attr_receiver(attr)?;
                let setter = self.resolve_accessor(attr, false)?;
                self.emit_call(setter, attr.indices.len() as u32 + 1)
            }
            Some(op) => {
                // Getter, operator, setter.
                let float = matches!(attr.ty, Type::Float);
                if attr.indexed {
                    let index = attr.indices[0].clone();
                    self.compile_expr(&index)?;
                    self.emit_attr_receiver(attr)?;
                    let getter = self.resolve_accessor(attr, true)?;
                    self.emit_call(getter, 1)?;
                    self.compile_expr(value)?;
                    self.image.emit(binary_opcode(op, float)?);
                    self.compile_expr(&index)?;
                    self.image.emit(OpCode::Swap);
                    self.emit_attr_receiver(attr)?;
                    let setter = self.resolve_accessor(attr, false)?;
                    self.emit_call(setter, 2)
                } else if attr.is_static {
                    let getter = self.resolve_accessor(attr, true)?;
                    self.emit_call(getter, 0)?;
                    self.compile_expr(value)?;
                    self.image.emit(binary_opcode(op, float)?);
                    let setter = self.resolve_accessor(attr, false)?;
                    self.emit_call(setter, 1)
                } else {
                    let base = attr.base.clone().ok_or_else(|| {
                        CompileError::Internal(format!(
                            "attribute '{}' lost its receiver",
                            attr.name
                        ))
                    })?;
                    self.push_receiver(&base)?;
                    self.image.emit(OpCode::Dup);
                    self.image.emit(OpCode::SetThis);
                    let getter = self.resolve_accessor(attr, true)?;
                    self.emit_call(getter, 0)?;
                    self.compile_expr(value)?;
                    self.image.emit(binary_opcode(op, float)?);
                    self.image.emit(OpCode::Swap);
                    self.image.emit(OpCode::SetThis);
                    let setter = self.resolve_accessor(attr, false)?;
                    self.emit_call(setter, 1)
                }
            }
        }
    }

    fn check_attr_indices(&self, attr: &AttrRef) -> Result<(), CompileError> {
        let expected = if attr.indexed { 1 } else { 0 };
        if attr.indices.len() != expected {
            return Err(CompileError::Internal(format!(
                "attribute '{}' used with {} indices, expected {expected}",
                attr.name,
                attr.indices.len()
            )));
        }
        Ok(())
    }

    fn emit_attr_receiver(&mut self, attr: &AttrRef) -> Result<(), CompileError> {
        if attr.is_static {
            return Ok(());
        }
        let base = attr.base.clone().ok_or_else(|| {
            CompileError::Internal(format!("attribute '{}' lost its receiver", attr.name))
        })?;
        self.push_receiver(&base)?;
        self.image.emit(OpCode::SetThis);
        Ok(())
    }

    /// Resolves an accessor to a registered function; accessors not defined
    /// in this unit become imports on first use.
    fn resolve_accessor(&mut self, attr: &AttrRef, getter: bool) -> Result<usize, CompileError> {
        let name = if getter {
            getter_name(&attr.owner, &attr.name, attr.indexed)
        } else {
            setter_name(&attr.owner, &attr.name, attr.indexed)
        };
        if self.has_function(&name) {
            return self.lookup_function(&name);
        }
        let mut params = Vec::new();
        if attr.indexed {
            params.push(Param {
                name: "index".into(),
                ty: Type::Int,
                default: None,
            });
        }
        if !getter {
            params.push(Param {
                name: "value".into(),
                ty: attr.ty.clone(),
                default: None,
            });
        }
        let sig = FunctionSig {
            name,
            ret: if getter { attr.ty.clone() } else { Type::Void },
            params,
        };
        self.register_accessor_import(sig)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Type, CompileError> {
        enum Receiver<'a> {
            None,
            This,
            Base(&'a Expr),
        }

        let (index, receiver) = match callee {
            Expr::Ident(name) => match self.resolve_ident(name)? {
                IdentRes::Member(member) => {
                    let MemberKind::Method { is_static, .. } = &member.kind else {
                        return Err(CompileError::Internal(format!(
                            "member '{name}' is not callable"
                        )));
                    };
                    let qualified = qualify(&member.owner, name);
                    let index = self.lookup_function(&qualified)?;
                    let receiver = if *is_static {
                        Receiver::None
                    } else {
                        Receiver::This
                    };
                    (index, receiver)
                }
                IdentRes::Function(index) => (index, Receiver::None),
                _ => {
                    return Err(CompileError::Internal(format!(
                        "'{name}' is not a function"
                    )));
                }
            },
            Expr::Field { base, name } => {
                let type_name_path = matches!(
                    base.as_ref(),
                    Expr::Ident(type_name) if self.is_struct_type(type_name)
                );
                if type_name_path {
                    let Expr::Ident(type_name) = base.as_ref() else {
                        unreachable!("matched above");
                    };
                    let member = self.find_member(type_name, name)?;
                    self.check_protected(&member)?;
                    let MemberKind::Method { is_static, .. } = &member.kind else {
                        return Err(CompileError::Internal(format!(
                            "member '{name}' is not callable"
                        )));
                    };
                    if !is_static {
                        return Err(CompileError::Internal(format!(
                            "instance method '{name}' called through the type name"
                        )));
                    }
                    let index = self.lookup_function(&qualify(&member.owner, name))?;
                    (index, Receiver::None)
                } else {
                    let base_ty = self.static_type_of(base)?;
                    let owner = struct_name_of(&base_ty).ok_or_else(|| {
                        CompileError::Internal(
                            "method call through a non-struct value".into(),
                        )
                    })?;
                    let member = self.find_member(&owner, name)?;
                    self.check_protected(&member)?;
                    let MemberKind::Method { is_static, .. } = &member.kind else {
                        return Err(CompileError::Internal(format!(
                            "member '{name}' is not callable"
                        )));
                    };
                    if *is_static {
                        return Err(CompileError::Internal(format!(
                            "static method '{name}' called through an instance"
                        )));
                    }
                    let index = self.lookup_function(&qualify(&member.owner, name))?;
                    (index, Receiver::Base(base))
                }
            }
            _ => {
                return Err(CompileError::Internal(
                    "expression is not callable".into(),
                ));
            }
        };

        let sig = self.function_sig(index).clone();
        let fname = self.function_name(index).to_owned();
        let argc = self.push_args(&fname, &sig, args)?;

        match receiver {
            Receiver::None => {}
            Receiver::This => {
                self.require_instance_context()?;
                self.image.emit(OpCode::PushThis);
                self.image.emit(OpCode::SetThis);
            }
            Receiver::Base(base) => {
                self.push_receiver(base)?;
                self.image.emit(OpCode::SetThis);
            }
        }
        self.emit_call(index, argc)?;
        Ok(sig.ret)
    }

    /// Pushes provided arguments left to right and synthesizes trailing
    /// defaults; returns the full argument count.
    fn push_args(
        &mut self,
        fname: &str,
        sig: &FunctionSig,
        args: &[Expr],
    ) -> Result<u32, CompileError> {
        if args.len() > sig.params.len() {
            return Err(CompileError::WrongArgumentCount {
                name: fname.to_owned(),
                line: self.cur_line,
            });
        }
        for arg in args {
            self.compile_expr(arg)?;
        }
        for param in &sig.params[args.len()..] {
            let Some(default) = &param.default else {
                return Err(CompileError::WrongArgumentCount {
                    name: fname.to_owned(),
                    line: self.cur_line,
                });
            };
            self.compile_literal(default)?;
        }
        Ok(sig.params.len() as u32)
    }

    // ========================================================================
    // Static typing of expressions (no emission)
    // ========================================================================

    /// The static type of an expression, derived without emitting code.
    /// Used where resolution must happen before evaluation order allows
    /// compiling the expression itself.
    pub(crate) fn static_type_of(&self, expr: &Expr) -> Result<Type, CompileError> {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Int(_) => Type::Int,
                Literal::Float(_) => Type::Float,
                Literal::Bool(_) => Type::Bool,
                Literal::String(_) => Type::String,
                Literal::Null => Type::Null,
            }),
            Expr::Ident(name) => match self.resolve_ident(name)? {
                IdentRes::Frame { ty, .. }
                | IdentRes::Global { ty, .. }
                | IdentRes::ImportVar { ty, .. } => Ok(ty),
                IdentRes::Member(member) => member_value_type(&member),
                IdentRes::EnumConst(_) => Ok(Type::Int),
                IdentRes::Function(_) | IdentRes::StructType => Err(
                    CompileError::Internal(format!("'{name}' is not a value")),
                ),
            },
            Expr::This => {
                let owner = self.current_struct.clone().ok_or_else(|| {
                    CompileError::Internal("no instance context outside a member function".into())
                })?;
                Ok(Type::Pointer(owner))
            }
            Expr::Unary { op, operand } => match op {
                UnOp::Neg => self.static_type_of(operand),
                UnOp::Not | UnOp::BitNot => Ok(Type::Int),
            },
            Expr::Binary { op, lhs, .. } => match op {
                BinOp::Eq
                | BinOp::Ne
                | BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::And
                | BinOp::Or => Ok(Type::Int),
                _ => self.static_type_of(lhs),
            },
            Expr::Ternary {
                cond,
                then,
                otherwise: _,
            } => match then {
                Some(then) => self.static_type_of(then),
                None => self.static_type_of(cond),
            },
            Expr::Field { base, name } => {
                let member = self.field_member(base, name)?;
                member_value_type(&member)
            }
            Expr::Index { base, indices } => {
                if let Expr::Field { base: inner, name } = base.as_ref() {
                    let member = self.field_member(inner, name)?;
                    if let MemberKind::Attribute { indexed: true, ty, .. } = &member.kind {
                        return Ok(ty.clone());
                    }
                }
                match self.static_type_of(base)? {
                    Type::Array { elem, extents } => {
                        if indices.len() == extents.len() {
                            Ok(*elem)
                        } else {
                            Err(CompileError::Internal(
                                "partial array indexing has no value type".into(),
                            ))
                        }
                    }
                    Type::DynArray(elem) => Ok(*elem),
                    _ => Err(CompileError::Internal(
                        "indexed expression is not an array".into(),
                    )),
                }
            }
            Expr::Call { callee, .. } => match callee.as_ref() {
                Expr::Ident(name) => match self.resolve_ident(name)? {
                    IdentRes::Member(member) => match &member.kind {
                        MemberKind::Method { sig, .. } => Ok(sig.ret.clone()),
                        _ => Err(CompileError::Internal(format!(
                            "member '{name}' is not callable"
                        ))),
                    },
                    IdentRes::Function(index) => Ok(self.function_sig(index).ret.clone()),
                    _ => Err(CompileError::Internal(format!(
                        "'{name}' is not a function"
                    ))),
                },
                Expr::Field { base, name } => {
                    let member = self.field_member(base, name)?;
                    match &member.kind {
                        MemberKind::Method { sig, .. } => Ok(sig.ret.clone()),
                        _ => Err(CompileError::Internal(format!(
                            "member '{name}' is not callable"
                        ))),
                    }
                }
                _ => Err(CompileError::Internal("expression is not callable".into())),
            },
            Expr::NewObject { struct_name } => Ok(Type::Pointer(struct_name.clone())),
            Expr::NewArray { elem, .. } => Ok(Type::DynArray(Box::new(elem.clone()))),
        }
    }

    /// Struct a member-access receiver belongs to, without emission.
    fn receiver_struct_of(&self, base: &Expr) -> Result<String, CompileError> {
        let ty = self.static_type_of(base)?;
        struct_name_of(&ty).ok_or_else(|| {
            CompileError::Internal("member access through a non-struct value".into())
        })
    }

    /// Member reached by `base.name`, without emission.
    fn field_member(&self, base: &Expr, name: &str) -> Result<MemberInfo, CompileError> {
        if let Expr::Ident(type_name) = base {
            if self.is_struct_type(type_name) {
                return self.find_member(type_name, name);
            }
        }
        let base_ty = self.static_type_of(base)?;
        let owner = struct_name_of(&base_ty).ok_or_else(|| {
            CompileError::Internal("member access through a non-struct value".into())
        })?;
        self.find_member(&owner, name)
    }

    // ========================================================================
    // Resolution helpers
    // ========================================================================

    /// Resolves a name: function scopes first, then the member namespace of
    /// the current struct, then the globals.
    fn resolve_ident(&self, name: &str) -> Result<IdentRes, CompileError> {
        if let Some(symbol) = self.syms.lookup_above_global(name) {
            return match &symbol.kind {
                SymbolKind::Local { offset } | SymbolKind::Param { offset } => {
                    Ok(IdentRes::Frame {
                        offset: *offset,
                        ty: symbol.ty.clone(),
                    })
                }
                _ => Err(CompileError::Internal(format!(
                    "unexpected symbol kind for '{name}' in a function scope"
                ))),
            };
        }
        if let Some(owner) = &self.current_struct {
            if let Some(member) = self.structs.get(owner).and_then(|l| l.member(name)) {
                return Ok(IdentRes::Member(member.clone()));
            }
        }
        match self.syms.lookup_global(name) {
            Some(symbol) => match &symbol.kind {
                SymbolKind::Global { offset } => Ok(IdentRes::Global {
                    offset: *offset,
                    ty: symbol.ty.clone(),
                }),
                SymbolKind::ImportVar { slot } => Ok(IdentRes::ImportVar {
                    slot: *slot,
                    ty: symbol.ty.clone(),
                }),
                SymbolKind::EnumConst { value } => Ok(IdentRes::EnumConst(*value)),
                SymbolKind::Function { func } => Ok(IdentRes::Function(*func)),
                SymbolKind::StructType => Ok(IdentRes::StructType),
                SymbolKind::Local { .. } | SymbolKind::Param { .. } => {
                    Err(CompileError::Internal(format!(
                        "frame symbol '{name}' found in the global scope"
                    )))
                }
            },
            None => Err(CompileError::Undeclared {
                name: name.to_owned(),
                line: self.cur_line,
            }),
        }
    }

    pub(crate) fn find_member(
        &self,
        struct_name: &str,
        member: &str,
    ) -> Result<MemberInfo, CompileError> {
        let layout = self
            .structs
            .get(struct_name)
            .ok_or_else(|| CompileError::Undeclared {
                name: struct_name.to_owned(),
                line: self.cur_line,
            })?;
        layout
            .member(member)
            .cloned()
            .ok_or_else(|| CompileError::Undeclared {
                name: qualify(struct_name, member),
                line: self.cur_line,
            })
    }

    fn is_struct_type(&self, name: &str) -> bool {
        self.syms.lookup_above_global(name).is_none()
            && matches!(
                self.syms.lookup_global(name).map(|s| &s.kind),
                Some(SymbolKind::StructType)
            )
    }

    fn inside_struct(&self, owner: &str) -> bool {
        self.current_struct
            .as_ref()
            .is_some_and(|current| self.structs.is_same_or_derived(current, owner))
    }

    fn check_protected(&self, member: &MemberInfo) -> Result<(), CompileError> {
        if member.vis == Visibility::Protected && !self.inside_struct(&member.owner) {
            return Err(CompileError::AccessViolation {
                name: member.name.clone(),
                line: self.cur_line,
            });
        }
        Ok(())
    }

    fn check_write_guard(&self, guard: &Option<MemberGuard>) -> Result<(), CompileError> {
        if let Some(guard) = guard {
            let writable = match guard.vis {
                Visibility::Public => true,
                Visibility::Protected | Visibility::WriteProtected => {
                    self.inside_struct(&guard.owner)
                }
            };
            if !writable {
                return Err(CompileError::AccessViolation {
                    name: guard.name.clone(),
                    line: self.cur_line,
                });
            }
        }
        Ok(())
    }

    fn require_instance_context(&self) -> Result<(), CompileError> {
        if self.current_struct.is_none() || self.current_static {
            return Err(CompileError::Internal(
                "instance member used without an instance context".into(),
            ));
        }
        Ok(())
    }

    /// Address of a field of the current instance.
    fn emit_this_field_addr(&mut self, offset: u32) -> Result<(), CompileError> {
        self.require_instance_context()?;
        self.image.emit(OpCode::PushThis);
        if offset != 0 {
            self.image.emit1(OpCode::PushInt, offset as i32);
            self.image.emit(OpCode::Add);
        }
        Ok(())
    }

    fn check_scalar(&self, ty: &Type, name: &str) -> Result<(), CompileError> {
        if matches!(ty, Type::Struct(_) | Type::Array { .. }) {
            return Err(CompileError::Internal(format!(
                "aggregate '{name}' used as a plain value"
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Width-sensitive memory access
    // ========================================================================

    pub(crate) fn emit_load(&mut self, width: u32) {
        match width {
            1 => self.image.emit(OpCode::LoadByte),
            2 => self.image.emit(OpCode::LoadShort),
            _ => self.image.emit(OpCode::Load),
        };
    }

    pub(crate) fn emit_store(&mut self, width: u32) {
        match width {
            1 => self.image.emit(OpCode::StoreByte),
            2 => self.image.emit(OpCode::StoreShort),
            _ => self.image.emit(OpCode::Store),
        };
    }
}

/// Value type of a member when read.
fn member_value_type(member: &MemberInfo) -> Result<Type, CompileError> {
    match &member.kind {
        MemberKind::Field { ty, .. } => Ok(ty.clone()),
        MemberKind::Attribute { ty, .. } => Ok(ty.clone()),
        MemberKind::Method { .. } => Err(CompileError::Internal(format!(
            "method '{}' used as a value",
            member.name
        ))),
    }
}

/// Struct behind a value usable as a member-access receiver.
fn struct_name_of(ty: &Type) -> Option<String> {
    match ty {
        Type::Struct(name) | Type::Pointer(name) => Some(name.clone()),
        _ => None,
    }
}

/// Maps an operator and operand class to its opcode.
fn binary_opcode(op: BinOp, float: bool) -> Result<OpCode, CompileError> {
    if float {
        return Ok(match op {
            BinOp::Add => OpCode::FAdd,
            BinOp::Sub => OpCode::FSub,
            BinOp::Mul => OpCode::FMul,
            BinOp::Div => OpCode::FDiv,
            BinOp::Eq => OpCode::FEq,
            BinOp::Ne => OpCode::FNe,
            BinOp::Lt => OpCode::FLt,
            BinOp::Le => OpCode::FLe,
            BinOp::Gt => OpCode::FGt,
            BinOp::Ge => OpCode::FGe,
            _ => {
                return Err(CompileError::Internal(format!(
                    "operator {op:?} is not defined on float"
                )));
            }
        });
    }
    Ok(match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::Mod => OpCode::Mod,
        BinOp::BitAnd => OpCode::BitAnd,
        BinOp::BitOr => OpCode::BitOr,
        BinOp::BitXor => OpCode::BitXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        BinOp::Eq => OpCode::Eq,
        BinOp::Ne => OpCode::Ne,
        BinOp::Lt => OpCode::Lt,
        BinOp::Le => OpCode::Le,
        BinOp::Gt => OpCode::Gt,
        BinOp::Ge => OpCode::Ge,
        BinOp::And => OpCode::And,
        BinOp::Or => OpCode::Or,
    })
}
