//! Statement compilation.
//!
//! Control flow compiles to relative jumps patched in place; no fixups are
//! recorded for them. Loops and switches stack a context carrying the
//! pending `break`/`continue` patch lists and the frame mark that jump
//! cleanup unwinds to. Jumping out of nested scopes releases only the bytes
//! of scopes inside the loop body; the loop-carried scope (a `for`
//! initializer, a switch selector temporary) is released once, at the single
//! cleanup point every exit path funnels through.

use crate::ast::{Expr, Literal, Stmt, StmtKind, SwitchCase, Type};
use crate::compiler::bytecode::OpCode;
use crate::compiler::codegen::Compiler;
use crate::compiler::layout::WORD;
use crate::CompileError;

impl Compiler {
    /// Compiles a statement list in a fresh scope and closes it again,
    /// emitting the scope's managed decrements and frame release.
    pub(crate) fn compile_block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        self.syms.open_scope();
        self.compile_stmt_run(stmts)?;
        self.leave_scope()
    }

    /// Compiles statements, batching runs of consecutive declarations under
    /// a single frame reservation.
    fn compile_stmt_run(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        let mut i = 0;
        while i < stmts.len() {
            if matches!(stmts[i].kind, StmtKind::VarDecl { .. }) {
                let mut j = i;
                while j < stmts.len() && matches!(stmts[j].kind, StmtKind::VarDecl { .. }) {
                    j += 1;
                }
                self.compile_decl_run(&stmts[i..j])?;
                i = j;
            } else {
                self.compile_stmt(&stmts[i])?;
                i += 1;
            }
        }
        Ok(())
    }

    /// Compiles one or more contiguous local declarations: one reservation
    /// covering the whole run, then each initializer store in order.
    fn compile_decl_run(&mut self, decls: &[Stmt]) -> Result<(), CompileError> {
        self.mark_line(decls[0].line);

        let mut total = 0u32;
        for stmt in decls {
            let StmtKind::VarDecl { ty, .. } = &stmt.kind else {
                return Err(CompileError::Internal(
                    "declaration run contains a non-declaration".into(),
                ));
            };
            total += self.structs.local_size(ty, stmt.line)?;
        }
        if total > 0 {
            self.image.emit1(OpCode::Reserve, total as i32);
        }

        for stmt in decls {
            let StmtKind::VarDecl { name, ty, init } = &stmt.kind else {
                unreachable!("checked above");
            };
            self.mark_line(stmt.line);
            let size = self.structs.local_size(ty, stmt.line)?;
            let offset = self.syms.alloc_local(name, ty.clone(), size, stmt.line)?;
            if let Some(init) = init {
                // The slot is zero-filled by the reservation, so there is no
                // old managed value to drop here.
                self.image.emit1(OpCode::LocalAddr, offset);
                let vty = self.compile_expr(init)?;
                self.emit_store_addref(ty, init, &vty);
                self.image.emit(OpCode::Store);
            }
        }
        Ok(())
    }

    /// Closes the innermost scope: managed locals are decremented in
    /// declaration order, then the scope's bytes are released.
    pub(crate) fn leave_scope(&mut self) -> Result<(), CompileError> {
        let exit = self.syms.close_scope()?;
        for offset in &exit.managed {
            self.image.emit1(OpCode::DecRefLocal, *offset as i32);
        }
        if exit.bytes > 0 {
            self.image.emit1(OpCode::Release, exit.bytes as i32);
        }
        Ok(())
    }

    /// Emits cleanup for a jump that leaves every scope above `frame_mark`
    /// without closing them: the symbols stay addressable, only the runtime
    /// state is unwound.
    fn emit_unwind_to(&mut self, frame_mark: u32) {
        for offset in self.syms.managed_since(frame_mark) {
            self.image.emit1(OpCode::DecRefLocal, offset as i32);
        }
        let bytes = self.syms.frame_size() - frame_mark;
        if bytes > 0 {
            self.image.emit1(OpCode::Release, bytes as i32);
        }
    }

    pub(crate) fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.mark_line(stmt.line);
        match &stmt.kind {
            StmtKind::Block(stmts) => self.compile_block(stmts),
            StmtKind::VarDecl { .. } => self.compile_decl_run(std::slice::from_ref(stmt)),
            StmtKind::Expr(expr) => {
                let ty = self.compile_expr(expr)?;
                if ty != Type::Void {
                    if ty.is_managed() && Self::owns_reference(expr, &ty) {
                        self.image.emit(OpCode::DecRef);
                    } else {
                        self.image.emit(OpCode::Pop);
                    }
                }
                Ok(())
            }
            StmtKind::Assign { target, op, value } => self.compile_assign(target, *op, value),
            StmtKind::Increment(target) => self.compile_incdec(target, true),
            StmtKind::Decrement(target) => self.compile_incdec(target, false),
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => self.compile_if(cond, then, otherwise.as_deref()),
            StmtKind::While { cond, body } => self.compile_while(cond, body),
            StmtKind::DoWhile { body, cond } => self.compile_do_while(body, cond),
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => self.compile_for(init.as_deref(), cond.as_ref(), update.as_deref(), body),
            StmtKind::Switch { selector, cases } => self.compile_switch(selector, cases),
            StmtKind::Break => self.compile_break(),
            StmtKind::Continue => self.compile_continue(),
            StmtKind::Return(expr) => self.compile_return(expr.as_ref()),
        }
    }

    fn compile_incdec(&mut self, target: &Expr, up: bool) -> Result<(), CompileError> {
        let one = if matches!(self.static_type_of(target)?, Type::Float) {
            Literal::Float(1.0)
        } else {
            Literal::Int(1)
        };
        let op = if up {
            crate::ast::BinOp::Add
        } else {
            crate::ast::BinOp::Sub
        };
        self.compile_assign(target, Some(op), &Expr::Literal(one))
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &Stmt,
        otherwise: Option<&Stmt>,
    ) -> Result<(), CompileError> {
        self.compile_expr(cond)?;
        let skip_then = self.emit_jump(OpCode::JumpZero);
        self.compile_stmt(then)?;
        match otherwise {
            Some(otherwise) => {
                let skip_else = self.emit_jump(OpCode::Jump);
                self.patch_jump_here(skip_then)?;
                self.compile_stmt(otherwise)?;
                self.patch_jump_here(skip_else)
            }
            None => self.patch_jump_here(skip_then),
        }
    }

    fn compile_while(&mut self, cond: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let retest = self.image.here();
        self.compile_expr(cond)?;
        let exit_jump = self.emit_jump(OpCode::JumpZero);

        self.push_loop();
        self.compile_stmt(body)?;
        let ctx = self.pop_loop()?;

        self.emit_jump_back(OpCode::Jump, retest);
        self.patch_jump_here(exit_jump)?;
        for cell in ctx.continue_patches {
            self.patch_jump_to(cell, retest)?;
        }
        for cell in ctx.break_patches {
            self.patch_jump_here(cell)?;
        }
        Ok(())
    }

    fn compile_do_while(&mut self, body: &Stmt, cond: &Expr) -> Result<(), CompileError> {
        let start = self.image.here();
        self.push_loop();
        self.compile_stmt(body)?;
        let ctx = self.pop_loop()?;

        // `continue` re-tests the condition.
        for cell in ctx.continue_patches {
            self.patch_jump_here(cell)?;
        }
        self.compile_expr(cond)?;
        self.emit_jump_back(OpCode::JumpNotZero, start);
        for cell in ctx.break_patches {
            self.patch_jump_here(cell)?;
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        update: Option<&Stmt>,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        // The initializer's scope is carried by the loop itself: `break`
        // never releases it, and its symbols outlive every iteration.
        self.syms.open_scope();
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let retest = self.image.here();
        let exit_jump = match cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit_jump(OpCode::JumpZero))
            }
            None => None,
        };

        self.push_loop();
        self.compile_stmt(body)?;
        let ctx = self.pop_loop()?;

        // `continue` lands on the iterator clause, not the re-test.
        let iterator = self.image.here();
        if let Some(update) = update {
            self.compile_stmt(update)?;
        }
        self.emit_jump_back(OpCode::Jump, retest);

        if let Some(cell) = exit_jump {
            self.patch_jump_here(cell)?;
        }
        for cell in ctx.break_patches {
            self.patch_jump_here(cell)?;
        }
        let continue_target = if update.is_some() { iterator } else { retest };
        for cell in ctx.continue_patches {
            self.patch_jump_to(cell, continue_target)?;
        }

        self.leave_scope()
    }

    fn compile_switch(
        &mut self,
        selector: &Expr,
        cases: &[SwitchCase],
    ) -> Result<(), CompileError> {
        // The selector is evaluated once into a hidden frame temporary and
        // re-loaded for each comparison.
        self.syms.open_scope();
        let temp = self.syms.alloc_temp(WORD);
        self.image.emit1(OpCode::Reserve, WORD as i32);
        self.image.emit1(OpCode::LocalAddr, temp);
        let selector_ty = self.compile_expr(selector)?;
        self.image.emit(OpCode::Store);
        let compare = if matches!(selector_ty, Type::Float) {
            OpCode::FEq
        } else {
            OpCode::Eq
        };

        self.push_switch();

        let mut case_jumps = Vec::new();
        let mut default_case = None;
        for (index, case) in cases.iter().enumerate() {
            match &case.label {
                Some(label) => {
                    self.mark_line(case.line);
                    self.image.emit1(OpCode::LocalAddr, temp);
                    self.image.emit(OpCode::Load);
                    self.compile_expr(label)?;
                    self.image.emit(compare);
                    case_jumps.push((index, self.emit_jump(OpCode::JumpNotZero)));
                }
                None => {
                    if default_case.is_some() {
                        return Err(CompileError::Internal(
                            "switch has two default clauses".into(),
                        ));
                    }
                    default_case = Some(index);
                }
            }
        }
        let miss_jump = self.emit_jump(OpCode::Jump);

        // Clause bodies are contiguous; a clause without a break simply runs
        // into the next clause's code.
        let mut body_starts = vec![0u32; cases.len()];
        for (index, case) in cases.iter().enumerate() {
            body_starts[index] = self.image.here();
            self.syms.open_scope();
            self.compile_stmt_run(&case.body)?;
            self.leave_scope()?;
        }

        for (index, cell) in case_jumps {
            self.patch_jump_to(cell, body_starts[index])?;
        }
        match default_case {
            Some(index) => self.patch_jump_to(miss_jump, body_starts[index])?,
            None => self.patch_jump_here(miss_jump)?,
        }

        let ctx = self.pop_loop()?;
        for cell in ctx.break_patches {
            self.patch_jump_here(cell)?;
        }
        if !ctx.continue_patches.is_empty() {
            return Err(CompileError::Internal(
                "continue recorded against a switch".into(),
            ));
        }

        // Every exit path funnels through the selector release.
        self.leave_scope()
    }

    fn compile_break(&mut self) -> Result<(), CompileError> {
        let mark = self.break_mark()?;
        self.emit_unwind_to(mark);
        let cell = self.emit_jump(OpCode::Jump);
        self.record_break(cell)
    }

    fn compile_continue(&mut self) -> Result<(), CompileError> {
        let mark = self.continue_mark()?;
        self.emit_unwind_to(mark);
        let cell = self.emit_jump(OpCode::Jump);
        self.record_continue(cell)
    }

    fn compile_return(&mut self, expr: Option<&Expr>) -> Result<(), CompileError> {
        match expr {
            Some(expr) => {
                self.compile_expr(expr)?;
            }
            None => {
                if self.ret_ty != Type::Void {
                    self.image.emit1(OpCode::PushInt, 0);
                }
            }
        }
        // Every managed local of the function gets its decrement, then the
        // whole frame is released in one instruction.
        self.emit_unwind_to(0);
        self.image.emit(OpCode::Ret);
        Ok(())
    }
}
