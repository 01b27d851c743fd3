//! Lowering the typed AST into SSA IL.
//!
//! Per function we keep a block-local map from source variable names to
//! their current IL value.  Reads walk predecessors on demand; merge points
//! get PHIs, and loop headers get placeholder PHIs that are patched once the
//! back edge is complete (the block is "sealed").  PHIs whose incomings all
//! agree collapse into a `copy`, so no trivial PHI survives in the output.
//!
//! Locals that must live in memory (arrays, and anything whose address is
//! taken) are not rewritten into SSA values; they keep their frame slot and
//! are accessed through `load_var` / `store_var`.
//!
//! Short-circuit `&&`/`||` lower to a branch plus a PHI over the constant
//! and the right-hand side; the right-hand side is never evaluated on the
//! short-circuit path.

use log::trace;

use crate::common::{id, Id, Map, Set};
use crate::diag::CompileError;
use crate::front::ast::{
    self, BinOp, CastKind, CmpOp, Expr, ExprKind, LValue, LogicalOp, MapLayout, Stmt,
    Storage, Ty, ZpMode,
};
use crate::middle::il::{
    BasicBlock, BlockId, Function, Global, Instruction, LocalDecl, Module, Phi,
    Terminator, ValueId,
};

/// Lower a typed module to IL.
pub fn lower(module: &ast::Module) -> Result<Module, Vec<CompileError>> {
    let mut cx = ModuleCx::new(module);
    let mut functions = Vec::new();
    for func in &module.functions {
        match FuncCx::new(&mut cx, func).run() {
            Ok(f) => functions.push(f),
            Err(e) => cx.errors.push(e),
        }
    }
    if !cx.errors.is_empty() {
        return Err(cx.errors);
    }

    let globals: Map<Id, Global> = module
        .globals
        .iter()
        .filter(|g| g.storage != Storage::Const)
        .map(|g| {
            (
                g.name,
                Global {
                    name: g.name,
                    ty: g.ty.clone(),
                    storage: g.storage,
                    init: g.init.clone(),
                },
            )
        })
        .collect();

    Module::new(
        module.name,
        globals,
        module.maps.clone(),
        cx.strings,
        functions,
    )
}

/// Module-wide lowering state.
struct ModuleCx<'a> {
    ast: &'a ast::Module,
    /// Folded values of `const`-storage globals.
    consts: Map<Id, (u16, Ty)>,
    /// Interned string literals: text -> label.
    string_labels: Map<String, Id>,
    strings: Vec<(Id, Vec<u8>)>,
    errors: Vec<CompileError>,
}

impl<'a> ModuleCx<'a> {
    fn new(ast: &'a ast::Module) -> ModuleCx<'a> {
        let mut consts = Map::new();
        for g in &ast.globals {
            if g.storage == Storage::Const {
                if let Some(ast::Init::Scalar(v)) = &g.init {
                    consts.insert(g.name, (*v, g.ty.clone()));
                }
            }
        }
        ModuleCx {
            ast,
            consts,
            string_labels: Map::new(),
            strings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn intern_string(&mut self, text: &str) -> Id {
        if let Some(label) = self.string_labels.get(text) {
            return *label;
        }
        let label = id(format!("str{}", self.strings.len()));
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.strings.push((label, bytes));
        self.string_labels.insert(text.to_owned(), label);
        label
    }

    fn map_decl(&self, name: Id) -> Option<&ast::MapDecl> {
        self.ast.maps.iter().find(|m| m.name == name)
    }

    fn func_decl(&self, name: Id) -> Option<&ast::FuncDecl> {
        self.ast.functions.iter().find(|f| f.name == name)
    }

    fn global_decl(&self, name: Id) -> Option<&ast::GlobalDecl> {
        self.ast.globals.iter().find(|g| g.name == name)
    }
}

/// Per-function lowering state.
struct FuncCx<'a, 'm> {
    mcx: &'a mut ModuleCx<'m>,
    decl: &'a ast::FuncDecl,
    f: Function,
    /// Current definition of each SSA variable, per block.
    defs: Vec<Map<Id, ValueId>>,
    sealed: Vec<bool>,
    /// Placeholder PHIs of unsealed blocks: variable -> phi dst.
    incomplete: Vec<Map<Id, ValueId>>,
    cur: BlockId,
    terminated: bool,
    depth: u32,
    counter: u32,
    /// (continue target, break target) of enclosing loops.
    loop_stack: Vec<(BlockId, BlockId)>,
    /// Types of params and locals in scope.
    var_ty: Map<Id, Ty>,
    /// Names that live in memory rather than SSA form.
    mem_vars: Set<Id>,
}

impl<'a, 'm> FuncCx<'a, 'm> {
    fn new(mcx: &'a mut ModuleCx<'m>, decl: &'a ast::FuncDecl) -> FuncCx<'a, 'm> {
        let f = Function {
            name: decl.name,
            params: decl.params.iter().map(|p| (p.name, p.ty.clone())).collect(),
            ret: decl.ret.clone(),
            recursive: decl.recursive,
            isr: decl.isr,
            blocks: Vec::new(),
            locals: Vec::new(),
            value_types: Vec::new(),
            value_origins: Vec::new(),
            block_depth: Vec::new(),
        };
        FuncCx {
            mcx,
            decl,
            f,
            defs: Vec::new(),
            sealed: Vec::new(),
            incomplete: Vec::new(),
            cur: BlockId(0),
            terminated: false,
            depth: 0,
            counter: 0,
            loop_stack: Vec::new(),
            var_ty: Map::new(),
            mem_vars: Set::new(),
        }
    }

    fn run(mut self) -> Result<Function, CompileError> {
        // Names whose address is taken anywhere in the body must stay in
        // memory; SSA renaming would detach them from their slot.
        let mut taken = Set::new();
        for stmt in &self.decl.body {
            collect_addr_taken(stmt, &mut taken);
        }

        let entry = self.new_block(id("entry"));
        self.seal(entry)?;
        self.switch_to(entry);

        for param in &self.decl.params {
            self.var_ty.insert(param.name, param.ty.clone());
            if taken.contains(&param.name) {
                self.mem_vars.insert(param.name);
            } else {
                // The caller wrote the argument into our slot; pick it up as
                // the entry definition.
                let v = self.new_value(param.ty.clone(), Some(param.name));
                self.emit(Instruction::LoadVar {
                    dst: v,
                    name: param.name,
                });
                self.write_var(param.name, entry, v);
            }
        }
        for name in taken {
            self.mem_vars.insert(name);
        }

        let body: &'a [Stmt] = self.decl.body.as_slice();
        self.lower_body(body)?;

        if !self.terminated {
            if self.decl.ret.is_none() {
                self.set_term(Terminator::Return(None));
            } else {
                return Err(CompileError::internal(format!(
                    "{}: control reaches the end of a non-void function",
                    self.decl.name
                )));
            }
        }
        prune_unreachable(&mut self.f);
        trace!(
            "lowered {}: {} blocks, {} values",
            self.f.name,
            self.f.blocks.len(),
            self.f.value_types.len()
        );
        Ok(self.f)
    }

    // ---- block and value plumbing ----

    fn new_value(&mut self, ty: Ty, origin: Option<Id>) -> ValueId {
        let v = ValueId(self.f.value_types.len() as u32);
        self.f.value_types.push(ty);
        self.f.value_origins.push(origin);
        v
    }

    fn new_block(&mut self, label: Id) -> BlockId {
        let b = BlockId(self.f.blocks.len() as u32);
        self.f.blocks.push(BasicBlock {
            label,
            phis: Vec::new(),
            instructions: Vec::new(),
            // Placeholder; every path through the lowerer overwrites it via
            // set_term before the function is returned.
            terminator: Terminator::Return(None),
            preds: Vec::new(),
        });
        self.f.block_depth.push(self.depth);
        self.defs.push(Map::new());
        self.sealed.push(false);
        self.incomplete.push(Map::new());
        b
    }

    fn switch_to(&mut self, b: BlockId) {
        self.cur = b;
        self.terminated = false;
    }

    fn emit(&mut self, inst: Instruction) {
        debug_assert!(!self.terminated);
        self.f.blocks[self.cur.index()].instructions.push(inst);
    }

    fn set_term(&mut self, term: Terminator) {
        if self.terminated {
            return;
        }
        for succ in term.successors() {
            self.f.blocks[succ.index()].preds.push(self.cur);
        }
        self.f.blocks[self.cur.index()].terminator = term;
        self.terminated = true;
    }

    // ---- SSA bookkeeping (sealed-block construction) ----

    fn write_var(&mut self, name: Id, block: BlockId, value: ValueId) {
        self.defs[block.index()].insert(name, value);
    }

    fn read_var(&mut self, name: Id, block: BlockId) -> Result<ValueId, CompileError> {
        if let Some(v) = self.defs[block.index()].get(&name) {
            return Ok(*v);
        }
        self.read_var_recursive(name, block)
    }

    fn read_var_recursive(
        &mut self,
        name: Id,
        block: BlockId,
    ) -> Result<ValueId, CompileError> {
        let ty = self.var_ty.get(&name).cloned().ok_or_else(|| {
            CompileError::internal(format!("{}: read of unknown variable {name}", self.f.name))
        })?;
        let value = if !self.sealed[block.index()] {
            // Loop header still waiting for its back edge: placeholder PHI.
            let phi = self.new_phi(block, name, ty);
            self.incomplete[block.index()].insert(name, phi);
            phi
        } else if self.f.blocks[block.index()].preds.len() == 1 {
            let pred = self.f.blocks[block.index()].preds[0];
            self.read_var(name, pred)?
        } else if self.f.blocks[block.index()].preds.is_empty() {
            return Err(CompileError::internal(format!(
                "{}: {name} is undefined at {}",
                self.f.name,
                self.f.blocks[block.index()].label
            )));
        } else {
            let phi = self.new_phi(block, name, ty);
            // Record before filling operands so a cycle through a back edge
            // resolves to the PHI itself.
            self.write_var(name, block, phi);
            self.add_phi_operands(name, phi, block)?
        };
        self.write_var(name, block, value);
        Ok(value)
    }

    fn new_phi(&mut self, block: BlockId, name: Id, ty: Ty) -> ValueId {
        let dst = self.new_value(ty.clone(), Some(name));
        self.f.blocks[block.index()].phis.push(Phi {
            dst,
            ty,
            incoming: Vec::new(),
        });
        dst
    }

    fn add_phi_operands(
        &mut self,
        name: Id,
        phi_dst: ValueId,
        block: BlockId,
    ) -> Result<ValueId, CompileError> {
        let preds = self.f.blocks[block.index()].preds.clone();
        let mut incoming = Vec::with_capacity(preds.len());
        for pred in preds {
            let v = self.read_var(name, pred)?;
            incoming.push((pred, v));
        }
        let phi = self.f.blocks[block.index()]
            .phis
            .iter_mut()
            .find(|p| p.dst == phi_dst)
            .ok_or_else(|| {
                CompileError::internal(format!("{}: lost PHI {phi_dst}", self.f.name))
            })?;
        phi.incoming = incoming;
        Ok(self.collapse_trivial_phi(block, phi_dst)?)
    }

    /// A PHI whose incomings all agree (ignoring self-references) is not a
    /// merge at all; turn it into a `copy` so its value id stays valid.
    fn collapse_trivial_phi(
        &mut self,
        block: BlockId,
        phi_dst: ValueId,
    ) -> Result<ValueId, CompileError> {
        let blk = &self.f.blocks[block.index()];
        let phi = blk.phis.iter().find(|p| p.dst == phi_dst).unwrap();
        let mut unique = None;
        for (_, v) in &phi.incoming {
            if *v == phi_dst {
                continue;
            }
            match unique {
                None => unique = Some(*v),
                Some(u) if u == *v => {}
                Some(_) => return Ok(phi_dst), // a real merge
            }
        }
        let src = unique.ok_or_else(|| {
            CompileError::internal(format!(
                "{}: PHI {phi_dst} references only itself",
                self.f.name
            ))
        })?;
        let blk = &mut self.f.blocks[block.index()];
        blk.phis.retain(|p| p.dst != phi_dst);
        blk.instructions
            .insert(0, Instruction::Copy { dst: phi_dst, src });
        Ok(phi_dst)
    }

    fn seal(&mut self, block: BlockId) -> Result<(), CompileError> {
        debug_assert!(!self.sealed[block.index()]);
        let pending = std::mem::take(&mut self.incomplete[block.index()]);
        for (name, phi) in pending {
            self.add_phi_operands(name, phi, block)?;
        }
        self.sealed[block.index()] = true;
        Ok(())
    }

    /// Bind `value` as the new version of variable `name`, claiming it when
    /// it has no origin yet and renaming through a `copy` otherwise.
    fn assign_var(&mut self, name: Id, value: ValueId) {
        let slot = &mut self.f.value_origins[value.0 as usize];
        let value = if slot.is_none() {
            *slot = Some(name);
            value
        } else {
            let ty = self.f.value_types[value.0 as usize].clone();
            let dst = self.new_value(ty, Some(name));
            self.emit(Instruction::Copy { dst, src: value });
            dst
        };
        self.write_var(name, self.cur, value);
    }

    // ---- statements ----

    fn lower_stmts(&mut self, stmts: &[&'a Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            if self.terminated {
                break; // unreachable code after return/break/continue
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_body(&mut self, stmts: &'a [Stmt]) -> Result<(), CompileError> {
        let list: Vec<&Stmt> = stmts.iter().collect();
        self.lower_stmts(&list)
    }

    fn lower_stmt(&mut self, stmt: &'a Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let {
                name, ty, zp, init, ..
            } => self.lower_let(*name, ty, *zp, init.as_ref()),
            Stmt::Assign { target, value } => self.lower_assign(target, value),
            Stmt::Expr(expr) => match &expr.kind {
                ExprKind::Call { callee, args } => {
                    self.lower_call(*callee, args, expr, false).map(|_| ())
                }
                ExprKind::CallIndirect { target, sig, args } => self
                    .lower_call_indirect(target, sig, args, expr, false)
                    .map(|_| ()),
                _ => self.lower_expr(expr).map(|_| ()),
            },
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body),
            Stmt::While { cond, body } => self.lower_while(cond, body),
            Stmt::For {
                var,
                from,
                to,
                body,
            } => self.lower_for(*var, from, to, body),
            Stmt::Match {
                scrutinee,
                arms,
                default,
            } => self.lower_match(scrutinee, arms, default),
            Stmt::Break => {
                let (_, break_to) = *self.loop_stack.last().ok_or_else(|| {
                    CompileError::internal(format!("{}: break outside a loop", self.f.name))
                })?;
                self.set_term(Terminator::Jump(break_to));
                Ok(())
            }
            Stmt::Continue => {
                let (continue_to, _) = *self.loop_stack.last().ok_or_else(|| {
                    CompileError::internal(format!("{}: continue outside a loop", self.f.name))
                })?;
                self.set_term(Terminator::Jump(continue_to));
                Ok(())
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(e) => Some(self.lower_expr(e)?),
                    None => None,
                };
                self.set_term(Terminator::Return(value));
                Ok(())
            }
            Stmt::Poke { addr, value } => {
                let addr = self.lower_expr(addr)?;
                let src = self.lower_expr(value)?;
                self.emit(Instruction::StoreMem { addr, src });
                Ok(())
            }
        }
    }

    fn lower_let(
        &mut self,
        name: Id,
        ty: &Ty,
        zp: ZpMode,
        init: Option<&'a Expr>,
    ) -> Result<(), CompileError> {
        let is_array = matches!(ty, Ty::Array(..));
        let in_memory = is_array || self.mem_vars.contains(&name);
        if self.f.local(name).is_none() {
            self.f.locals.push(LocalDecl {
                name,
                ty: ty.clone(),
                zp,
                in_memory,
            });
        }
        self.var_ty.insert(name, ty.clone());
        if in_memory {
            if is_array {
                return Ok(()); // arrays have no scalar initializer
            }
            let v = match init {
                Some(e) => self.lower_expr(e)?,
                None => self.emit_const(ty.clone(), 0),
            };
            self.emit(Instruction::StoreVar { name, src: v });
        } else {
            // Uninitialized scalars are defined to start at zero; this also
            // guarantees every SSA read has a reaching definition.
            let v = match init {
                Some(e) => self.lower_expr(e)?,
                None => self.emit_const(ty.clone(), 0),
            };
            self.assign_var(name, v);
        }
        Ok(())
    }

    fn lower_assign(&mut self, target: &'a LValue, value: &'a Expr) -> Result<(), CompileError> {
        match target {
            LValue::Var(name) => {
                let src = self.lower_expr(value)?;
                if self.is_memory_name(*name) {
                    self.emit(Instruction::StoreVar { name: *name, src });
                } else {
                    self.assign_var(*name, src);
                }
                Ok(())
            }
            LValue::Map(map, loc) => {
                let decl = self
                    .mcx
                    .map_decl(*map)
                    .ok_or(CompileError::UnknownMap { map: *map, loc: *loc })?;
                if !matches!(decl.layout, MapLayout::Simple { .. }) {
                    return Err(CompileError::UnknownField {
                        map: *map,
                        field: *map,
                        loc: *loc,
                    });
                }
                let src = self.lower_expr(value)?;
                self.emit(Instruction::MapStoreField {
                    map: *map,
                    field: *map,
                    src,
                });
                Ok(())
            }
            LValue::MapField { map, field, loc } => {
                self.check_map_field(*map, *field, *loc)?;
                let src = self.lower_expr(value)?;
                self.emit(Instruction::MapStoreField {
                    map: *map,
                    field: *field,
                    src,
                });
                Ok(())
            }
            LValue::MapIndex { map, index, loc } => {
                self.check_map_range(*map, *loc)?;
                let index = self.lower_expr(index)?;
                let src = self.lower_expr(value)?;
                self.emit(Instruction::MapStoreRange {
                    map: *map,
                    index,
                    src,
                });
                Ok(())
            }
            LValue::Index { name, index } => {
                let addr = self.lower_element_addr(*name, index)?;
                let src = self.lower_expr(value)?;
                self.emit(Instruction::StoreMem { addr, src });
                Ok(())
            }
            LValue::Deref { addr, .. } => {
                let addr = self.lower_expr(addr)?;
                let src = self.lower_expr(value)?;
                self.emit(Instruction::StoreMem { addr, src });
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        cond: &'a Expr,
        then_body: &'a [Stmt],
        else_body: &'a [Stmt],
    ) -> Result<(), CompileError> {
        let guard = self.lower_expr(cond)?;
        let n = self.counter + 1;
        self.counter = n;
        let then_b = self.new_block(id(format!("then{n}")));

        if else_body.is_empty() {
            let merge = self.new_block(id(format!("endif{n}")));
            self.set_term(Terminator::Branch {
                guard,
                tt: then_b,
                ff: merge,
            });
            self.switch_to(then_b);
            self.seal(then_b)?;
            self.lower_body(then_body)?;
            self.set_term(Terminator::Jump(merge));
            self.switch_to(merge);
            self.seal(merge)?;
            return Ok(());
        }

        let else_b = self.new_block(id(format!("else{n}")));
        self.set_term(Terminator::Branch {
            guard,
            tt: then_b,
            ff: else_b,
        });

        self.switch_to(then_b);
        self.seal(then_b)?;
        self.lower_body(then_body)?;
        let then_end = self.cur;
        let then_done = self.terminated;

        self.switch_to(else_b);
        self.seal(else_b)?;
        self.lower_body(else_body)?;
        let else_end = self.cur;
        let else_done = self.terminated;

        if then_done && else_done {
            // Both arms left; whatever follows is unreachable.
            self.terminated = true;
            return Ok(());
        }
        let merge = self.new_block(id(format!("endif{n}")));
        if !then_done {
            self.switch_to(then_end);
            self.set_term(Terminator::Jump(merge));
        }
        if !else_done {
            self.switch_to(else_end);
            self.set_term(Terminator::Jump(merge));
        }
        self.switch_to(merge);
        self.seal(merge)?;
        Ok(())
    }

    fn lower_while(&mut self, cond: &'a Expr, body: &'a [Stmt]) -> Result<(), CompileError> {
        let n = self.counter + 1;
        self.counter = n;
        self.depth += 1;
        let header = self.new_block(id(format!("while{n}")));
        let body_b = self.new_block(id(format!("body{n}")));
        self.depth -= 1;
        let exit = self.new_block(id(format!("endwhile{n}")));

        self.set_term(Terminator::Jump(header));
        self.switch_to(header);
        self.depth += 1;
        let guard = self.lower_expr(cond)?;
        self.set_term(Terminator::Branch {
            guard,
            tt: body_b,
            ff: exit,
        });

        self.switch_to(body_b);
        self.seal(body_b)?;
        self.loop_stack.push((header, exit));
        self.lower_body(body)?;
        self.loop_stack.pop();
        self.set_term(Terminator::Jump(header));
        self.depth -= 1;

        self.seal(header)?;
        self.switch_to(exit);
        self.seal(exit)?;
        Ok(())
    }

    fn lower_for(
        &mut self,
        var: Id,
        from: &'a Expr,
        to: &'a Expr,
        body: &'a [Stmt],
    ) -> Result<(), CompileError> {
        let ty = from.ty.clone();
        if self.f.local(var).is_none() {
            self.f.locals.push(LocalDecl {
                name: var,
                ty: ty.clone(),
                zp: ZpMode::None,
                in_memory: false,
            });
        }
        self.var_ty.insert(var, ty.clone());
        let start = self.lower_expr(from)?;
        self.assign_var(var, start);

        let n = self.counter + 1;
        self.counter = n;
        self.depth += 1;
        let header = self.new_block(id(format!("for{n}")));
        let body_b = self.new_block(id(format!("forbody{n}")));
        let step = self.new_block(id(format!("forstep{n}")));
        self.depth -= 1;
        let exit = self.new_block(id(format!("endfor{n}")));

        self.set_term(Terminator::Jump(header));
        self.switch_to(header);
        self.depth += 1;
        let i = self.read_var(var, header)?;
        let limit = self.lower_expr(to)?;
        let guard = self.new_value(Ty::I1, None);
        self.emit(Instruction::Cmp {
            op: CmpOp::Lt,
            dst: guard,
            lhs: i,
            rhs: limit,
        });
        self.set_term(Terminator::Branch {
            guard,
            tt: body_b,
            ff: exit,
        });

        self.switch_to(body_b);
        self.seal(body_b)?;
        self.loop_stack.push((step, exit));
        self.lower_body(body)?;
        self.loop_stack.pop();
        self.set_term(Terminator::Jump(step));

        self.switch_to(step);
        self.seal(step)?;
        if self.f.blocks[step.index()].preds.is_empty() {
            // The body always leaves the loop; the step block is dead and
            // pruning will drop it.
            self.terminated = true;
        } else {
            let i = self.read_var(var, step)?;
            let one = self.emit_const(ty.clone(), 1);
            let next = self.new_value(ty, None);
            self.emit(Instruction::Arith {
                op: BinOp::Add,
                dst: next,
                lhs: i,
                rhs: one,
            });
            self.assign_var(var, next);
            self.set_term(Terminator::Jump(header));
        }
        self.depth -= 1;

        self.seal(header)?;
        self.switch_to(exit);
        self.seal(exit)?;
        Ok(())
    }

    fn lower_match(
        &mut self,
        scrutinee: &'a Expr,
        arms: &'a [(u16, Vec<Stmt>)],
        default: &'a [Stmt],
    ) -> Result<(), CompileError> {
        let value = self.lower_expr(scrutinee)?;
        let value_ty = scrutinee.ty.clone();
        let n = self.counter + 1;
        self.counter = n;

        // Test chain: each arm gets a compare-and-branch; a failed compare
        // falls to the next test, the final one to the default body.
        let mut ends: Vec<BlockId> = Vec::new();
        for (i, (case, body)) in arms.iter().enumerate() {
            let case_v = self.emit_const(value_ty.clone(), *case);
            let guard = self.new_value(Ty::I1, None);
            self.emit(Instruction::Cmp {
                op: CmpOp::Eq,
                dst: guard,
                lhs: value,
                rhs: case_v,
            });
            let arm_b = self.new_block(id(format!("case{n}_{i}")));
            let next_b = self.new_block(id(format!("test{n}_{i}")));
            self.set_term(Terminator::Branch {
                guard,
                tt: arm_b,
                ff: next_b,
            });
            self.switch_to(arm_b);
            self.seal(arm_b)?;
            self.lower_body(body)?;
            if !self.terminated {
                ends.push(self.cur);
                self.terminated = true;
            }
            self.switch_to(next_b);
            self.seal(next_b)?;
        }
        self.lower_body(default)?;
        if !self.terminated {
            ends.push(self.cur);
            self.terminated = true;
        }

        if ends.is_empty() {
            return Ok(()); // every arm returned or broke
        }
        let merge = self.new_block(id(format!("endmatch{n}")));
        for end in ends {
            self.switch_to(end);
            self.set_term(Terminator::Jump(merge));
        }
        self.switch_to(merge);
        self.seal(merge)?;
        Ok(())
    }

    // ---- expressions ----

    fn lower_expr(&mut self, expr: &'a Expr) -> Result<ValueId, CompileError> {
        match &expr.kind {
            ExprKind::Const(v) => Ok(self.emit_const(expr.ty.clone(), *v)),
            ExprKind::Var(name) => self.lower_var_read(*name, expr),
            ExprKind::Map(map) => {
                let decl = self.mcx.map_decl(*map).ok_or(CompileError::UnknownMap {
                    map: *map,
                    loc: expr.loc,
                })?;
                if !matches!(decl.layout, MapLayout::Simple { .. }) {
                    return Err(CompileError::UnknownField {
                        map: *map,
                        field: *map,
                        loc: expr.loc,
                    });
                }
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::MapLoadField {
                    dst,
                    map: *map,
                    field: *map,
                });
                Ok(dst)
            }
            ExprKind::MapField { map, field } => {
                self.check_map_field(*map, *field, expr.loc)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::MapLoadField {
                    dst,
                    map: *map,
                    field: *field,
                });
                Ok(dst)
            }
            ExprKind::MapIndex { map, index } => {
                self.check_map_range(*map, expr.loc)?;
                let index = self.lower_expr(index)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::MapLoadRange {
                    dst,
                    map: *map,
                    index,
                });
                Ok(dst)
            }
            ExprKind::Index { name, index } => {
                let addr = self.lower_element_addr(*name, index)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::LoadMem {
                    dst,
                    addr,
                    ty: expr.ty.clone(),
                });
                Ok(dst)
            }
            ExprKind::Unary { op, operand } => {
                let src = self.lower_expr(operand)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::Unary { op: *op, dst, src });
                Ok(dst)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::Arith {
                    op: *op,
                    dst,
                    lhs,
                    rhs,
                });
                Ok(dst)
            }
            ExprKind::Compare { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                let dst = self.new_value(Ty::I1, None);
                self.emit(Instruction::Cmp {
                    op: *op,
                    dst,
                    lhs,
                    rhs,
                });
                Ok(dst)
            }
            ExprKind::Logical { op, lhs, rhs } => self.lower_logical(*op, lhs, rhs),
            ExprKind::Cast { kind, operand } => {
                let src = self.lower_expr(operand)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::Cast {
                    kind: *kind,
                    dst,
                    src,
                });
                Ok(dst)
            }
            ExprKind::Call { callee, args } => {
                let dst = self.lower_call(*callee, args, expr, true)?;
                dst.ok_or_else(|| {
                    CompileError::internal(format!(
                        "{}: void call to {callee} in expression position",
                        self.f.name
                    ))
                })
            }
            ExprKind::CallIndirect { target, sig, args } => {
                let dst = self.lower_call_indirect(target, sig, args, expr, true)?;
                dst.ok_or_else(|| {
                    CompileError::internal(format!(
                        "{}: void indirect call in expression position",
                        self.f.name
                    ))
                })
            }
            ExprKind::AddrOf(name) => {
                let dst = self.new_value(Ty::Ptr, None);
                self.emit(Instruction::AddrOf { dst, name: *name });
                Ok(dst)
            }
            ExprKind::Len(name) => {
                let len = self.array_len(*name)?;
                Ok(self.emit_const(Ty::U16, len))
            }
            ExprKind::Peek(addr) => {
                let addr = self.lower_expr(addr)?;
                let dst = self.new_value(Ty::U8, None);
                self.emit(Instruction::LoadMem {
                    dst,
                    addr,
                    ty: Ty::U8,
                });
                Ok(dst)
            }
            ExprKind::Deref(addr) => {
                let addr = self.lower_expr(addr)?;
                let dst = self.new_value(expr.ty.clone(), None);
                self.emit(Instruction::LoadMem {
                    dst,
                    addr,
                    ty: expr.ty.clone(),
                });
                Ok(dst)
            }
            ExprKind::Str(text) => {
                let label = self.mcx.intern_string(text);
                let dst = self.new_value(Ty::Ptr, None);
                self.emit(Instruction::AddrOf { dst, name: label });
                Ok(dst)
            }
        }
    }

    fn lower_var_read(&mut self, name: Id, expr: &Expr) -> Result<ValueId, CompileError> {
        // Const globals fold to their value.
        if let Some((value, ty)) = self.mcx.consts.get(&name).cloned() {
            return Ok(self.emit_const(ty, value));
        }
        if self.is_memory_name(name) {
            let dst = self.new_value(expr.ty.clone(), None);
            self.emit(Instruction::LoadVar { dst, name });
            return Ok(dst);
        }
        self.read_var(name, self.cur)
    }

    /// `a && b` / `a || b` with the mandatory short circuit: `b` is only
    /// evaluated when `a` does not decide the result.
    fn lower_logical(
        &mut self,
        op: LogicalOp,
        lhs: &'a Expr,
        rhs: &'a Expr,
    ) -> Result<ValueId, CompileError> {
        let lhs_v = self.lower_expr(lhs)?;
        let short = match op {
            LogicalOp::And => self.emit_const(Ty::I1, 0),
            LogicalOp::Or => self.emit_const(Ty::I1, 1),
        };
        let n = self.counter + 1;
        self.counter = n;
        let stem = match op {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
        };
        let rhs_b = self.new_block(id(format!("{stem}{n}")));
        let merge = self.new_block(id(format!("{stem}end{n}")));
        let lhs_end = self.cur;
        match op {
            LogicalOp::And => self.set_term(Terminator::Branch {
                guard: lhs_v,
                tt: rhs_b,
                ff: merge,
            }),
            LogicalOp::Or => self.set_term(Terminator::Branch {
                guard: lhs_v,
                tt: merge,
                ff: rhs_b,
            }),
        }

        self.switch_to(rhs_b);
        self.seal(rhs_b)?;
        let rhs_v = self.lower_expr(rhs)?;
        let rhs_end = self.cur;
        self.set_term(Terminator::Jump(merge));

        self.switch_to(merge);
        self.seal(merge)?;
        let dst = self.new_value(Ty::I1, None);
        self.f.blocks[merge.index()].phis.push(Phi {
            dst,
            ty: Ty::I1,
            incoming: vec![(lhs_end, short), (rhs_end, rhs_v)],
        });
        Ok(dst)
    }

    fn lower_call(
        &mut self,
        callee: Id,
        args: &'a [Expr],
        expr: &Expr,
        want_result: bool,
    ) -> Result<Option<ValueId>, CompileError> {
        let decl = self.mcx.func_decl(callee).ok_or_else(|| {
            CompileError::internal(format!("{}: call to unknown function {callee}", self.f.name))
        })?;
        let returns = decl.ret.is_some();
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.lower_expr(arg)?);
        }
        let dst = (returns && want_result).then(|| self.new_value(expr.ty.clone(), None));
        self.emit(Instruction::Call {
            dst,
            callee,
            args: arg_values,
            loc: expr.loc,
        });
        Ok(dst)
    }

    fn lower_call_indirect(
        &mut self,
        target: &'a Expr,
        sig: &ast::Signature,
        args: &'a [Expr],
        expr: &Expr,
        want_result: bool,
    ) -> Result<Option<ValueId>, CompileError> {
        let target_v = self.lower_expr(target)?;
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.lower_expr(arg)?);
        }
        let dst =
            (sig.ret.is_some() && want_result).then(|| self.new_value(expr.ty.clone(), None));
        self.emit(Instruction::CallIndirect {
            dst,
            target: target_v,
            sig: sig.clone(),
            args: arg_values,
            loc: expr.loc,
        });
        Ok(dst)
    }

    /// Address of `name[index]`: the base address plus the scaled index, in
    /// 16-bit arithmetic.
    fn lower_element_addr(
        &mut self,
        name: Id,
        index: &'a Expr,
    ) -> Result<ValueId, CompileError> {
        let elem_size = self.element_size(name)?;
        let base = self.new_value(Ty::Ptr, None);
        self.emit(Instruction::AddrOf { dst: base, name });
        let idx = self.lower_expr(index)?;
        let idx16 = if index.ty.is_byte() {
            let wide = self.new_value(Ty::U16, None);
            self.emit(Instruction::Cast {
                kind: CastKind::Zext,
                dst: wide,
                src: idx,
            });
            wide
        } else {
            idx
        };
        let offset = if elem_size == 2 {
            let one = self.emit_const(Ty::U16, 1);
            let scaled = self.new_value(Ty::U16, None);
            self.emit(Instruction::Arith {
                op: BinOp::Shl,
                dst: scaled,
                lhs: idx16,
                rhs: one,
            });
            scaled
        } else {
            idx16
        };
        let addr = self.new_value(Ty::Ptr, None);
        self.emit(Instruction::Arith {
            op: BinOp::Add,
            dst: addr,
            lhs: base,
            rhs: offset,
        });
        Ok(addr)
    }

    // ---- helpers ----

    fn emit_const(&mut self, ty: Ty, value: u16) -> ValueId {
        let dst = self.new_value(ty.clone(), None);
        self.emit(Instruction::Const { dst, ty, value });
        dst
    }

    fn is_memory_name(&self, name: Id) -> bool {
        self.mem_vars.contains(&name)
            || (!self.var_ty.contains_key(&name) && self.mcx.global_decl(name).is_some())
    }

    fn check_map_field(
        &self,
        map: Id,
        field: Id,
        loc: crate::diag::SourceLoc,
    ) -> Result<(), CompileError> {
        let decl = self
            .mcx
            .map_decl(map)
            .ok_or(CompileError::UnknownMap { map, loc })?;
        decl.field(field)
            .map(|_| ())
            .ok_or(CompileError::UnknownField { map, field, loc })
    }

    fn check_map_range(
        &self,
        map: Id,
        loc: crate::diag::SourceLoc,
    ) -> Result<(), CompileError> {
        let decl = self
            .mcx
            .map_decl(map)
            .ok_or(CompileError::UnknownMap { map, loc })?;
        decl.range()
            .map(|_| ())
            .ok_or(CompileError::UnknownField {
                map,
                field: map,
                loc,
            })
    }

    fn element_size(&self, name: Id) -> Result<u16, CompileError> {
        if let Some(ty) = self.var_ty.get(&name) {
            if let Ty::Array(elem, _) = ty {
                return Ok(elem.size_bytes());
            }
        }
        if let Some(g) = self.mcx.global_decl(name) {
            if let Ty::Array(elem, _) = &g.ty {
                return Ok(elem.size_bytes());
            }
        }
        Err(CompileError::internal(format!(
            "{}: {name} is not an array",
            self.f.name
        )))
    }

    fn array_len(&self, name: Id) -> Result<u16, CompileError> {
        if let Some(Ty::Array(_, n)) = self.var_ty.get(&name) {
            return Ok(*n);
        }
        if let Some(g) = self.mcx.global_decl(name) {
            if let Ty::Array(_, n) = &g.ty {
                return Ok(*n);
            }
        }
        Err(CompileError::internal(format!(
            "{}: len of non-array {name}",
            self.f.name
        )))
    }
}

/// Drop blocks unreachable from the entry and renumber the rest.  The
/// structured lowering only produces such blocks in corner cases (a loop
/// step whose body never falls through), but they would violate the
/// every-block-has-a-predecessor invariant if left in.
fn prune_unreachable(f: &mut Function) {
    let n = f.blocks.len();
    let mut reachable = vec![false; n];
    let mut stack = vec![0usize];
    while let Some(b) = stack.pop() {
        if reachable[b] {
            continue;
        }
        reachable[b] = true;
        for succ in f.blocks[b].terminator.successors() {
            stack.push(succ.index());
        }
    }
    if reachable.iter().all(|r| *r) {
        return;
    }

    let mut remap: Vec<Option<BlockId>> = vec![None; n];
    let mut next = 0u32;
    for (i, live) in reachable.iter().enumerate() {
        if *live {
            remap[i] = Some(BlockId(next));
            next += 1;
        }
    }
    let map = |b: BlockId| remap[b.index()].expect("edge from a live block to a dead one");

    let mut blocks = Vec::with_capacity(next as usize);
    let mut depths = Vec::with_capacity(next as usize);
    for (i, mut block) in std::mem::take(&mut f.blocks).into_iter().enumerate() {
        if !reachable[i] {
            continue;
        }
        block.preds.retain(|p| reachable[p.index()]);
        for p in &mut block.preds {
            *p = map(*p);
        }
        for phi in &mut block.phis {
            phi.incoming.retain(|(p, _)| reachable[p.index()]);
            for (p, _) in &mut phi.incoming {
                *p = map(*p);
            }
        }
        block.terminator = match block.terminator {
            Terminator::Jump(b) => Terminator::Jump(map(b)),
            Terminator::Branch { guard, tt, ff } => Terminator::Branch {
                guard,
                tt: map(tt),
                ff: map(ff),
            },
            t @ Terminator::Return(_) => t,
        };
        blocks.push(block);
        depths.push(f.block_depth[i]);
    }
    f.blocks = blocks;
    f.block_depth = depths;
}

/// Collect names whose address is taken anywhere in a statement.
fn collect_addr_taken(stmt: &Stmt, out: &mut Set<Id>) {
    fn walk_expr(expr: &Expr, out: &mut Set<Id>) {
        match &expr.kind {
            ExprKind::AddrOf(name) => {
                out.insert(*name);
            }
            ExprKind::Unary { operand, .. } | ExprKind::Cast { operand, .. } => {
                walk_expr(operand, out)
            }
            ExprKind::Binary { lhs, rhs, .. }
            | ExprKind::Compare { lhs, rhs, .. }
            | ExprKind::Logical { lhs, rhs, .. } => {
                walk_expr(lhs, out);
                walk_expr(rhs, out);
            }
            ExprKind::MapIndex { index, .. } | ExprKind::Index { index, .. } => {
                walk_expr(index, out)
            }
            ExprKind::Peek(e) | ExprKind::Deref(e) => walk_expr(e, out),
            ExprKind::Call { args, .. } => args.iter().for_each(|a| walk_expr(a, out)),
            ExprKind::CallIndirect { target, args, .. } => {
                walk_expr(target, out);
                args.iter().for_each(|a| walk_expr(a, out));
            }
            ExprKind::Const(_)
            | ExprKind::Var(_)
            | ExprKind::Map(_)
            | ExprKind::MapField { .. }
            | ExprKind::Len(_)
            | ExprKind::Str(_) => {}
        }
    }
    fn walk_lvalue(lv: &LValue, out: &mut Set<Id>) {
        match lv {
            LValue::MapIndex { index, .. } | LValue::Index { index, .. } => {
                walk_expr(index, out)
            }
            LValue::Deref { addr, .. } => walk_expr(addr, out),
            LValue::Var(_) | LValue::Map(..) | LValue::MapField { .. } => {}
        }
    }
    match stmt {
        Stmt::Let { init, .. } => {
            if let Some(e) = init {
                walk_expr(e, out);
            }
        }
        Stmt::Assign { target, value } => {
            walk_lvalue(target, out);
            walk_expr(value, out);
        }
        Stmt::Expr(e) => walk_expr(e, out),
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            walk_expr(cond, out);
            then_body.iter().for_each(|s| collect_addr_taken(s, out));
            else_body.iter().for_each(|s| collect_addr_taken(s, out));
        }
        Stmt::While { cond, body } => {
            walk_expr(cond, out);
            body.iter().for_each(|s| collect_addr_taken(s, out));
        }
        Stmt::For { from, to, body, .. } => {
            walk_expr(from, out);
            walk_expr(to, out);
            body.iter().for_each(|s| collect_addr_taken(s, out));
        }
        Stmt::Match {
            scrutinee,
            arms,
            default,
        } => {
            walk_expr(scrutinee, out);
            for (_, body) in arms {
                body.iter().for_each(|s| collect_addr_taken(s, out));
            }
            default.iter().for_each(|s| collect_addr_taken(s, out));
        }
        Stmt::Return(Some(e)) => walk_expr(e, out),
        Stmt::Poke { addr, value } => {
            walk_expr(addr, out);
            walk_expr(value, out);
        }
        Stmt::Break | Stmt::Continue | Stmt::Return(None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::front::ast::{FuncDecl, Param};

    fn func(name: &str, params: Vec<(&str, Ty)>, ret: Option<Ty>, body: Vec<Stmt>) -> FuncDecl {
        FuncDecl {
            name: id(name),
            params: params
                .into_iter()
                .map(|(n, ty)| Param { name: id(n), ty })
                .collect(),
            ret,
            recursive: false,
            isr: false,
            body,
            loc: SourceLoc::synthetic(),
        }
    }

    fn module(functions: Vec<FuncDecl>) -> ast::Module {
        ast::Module {
            name: id("test"),
            globals: vec![],
            maps: vec![],
            functions,
        }
    }

    #[test]
    fn empty_function_is_a_single_return() {
        let il = lower(&module(vec![func("nop", vec![], None, vec![])])).unwrap();
        let f = il.function(id("nop")).unwrap();
        assert_eq!(f.blocks.len(), 1);
        assert!(f.blocks[0].instructions.is_empty());
        assert!(matches!(f.blocks[0].terminator, Terminator::Return(None)));
        il.validate().unwrap();
    }

    #[test]
    fn if_else_merges_through_a_phi() {
        // if (c) x = 10 else x = 20; return x
        let body = vec![
            Stmt::local(id("x"), Ty::U8, Expr::byte(0)),
            Stmt::If {
                cond: Expr::var(id("c"), Ty::I1),
                then_body: vec![Stmt::assign_var(id("x"), Expr::byte(10))],
                else_body: vec![Stmt::assign_var(id("x"), Expr::byte(20))],
            },
            Stmt::Return(Some(Expr::var(id("x"), Ty::U8))),
        ];
        let il = lower(&module(vec![func(
            "pick",
            vec![("c", Ty::I1)],
            Some(Ty::U8),
            body,
        )]))
        .unwrap();
        il.validate().unwrap();
        let f = il.function(id("pick")).unwrap();

        assert!(matches!(
            f.blocks[0].terminator,
            Terminator::Branch { .. }
        ));
        let merge = f
            .blocks
            .iter()
            .find(|b| !b.phis.is_empty())
            .expect("a merge block with a PHI");
        assert_eq!(merge.phis.len(), 1);
        let phi = &merge.phis[0];
        assert_eq!(phi.incoming.len(), 2);
        // The merged value flows into the return.
        assert!(f
            .blocks
            .iter()
            .any(|b| matches!(b.terminator, Terminator::Return(Some(v)) if v == phi.dst)));
        // Both incoming values are the materialized constants.
        let consts = f.const_values();
        let mut incoming: Vec<u16> = phi
            .incoming
            .iter()
            .map(|(_, v)| consts[v])
            .collect();
        incoming.sort();
        assert_eq!(incoming, vec![10, 20]);
    }

    #[test]
    fn same_value_on_both_paths_needs_no_phi() {
        let body = vec![
            Stmt::local(id("x"), Ty::U8, Expr::byte(5)),
            Stmt::If {
                cond: Expr::var(id("c"), Ty::I1),
                then_body: vec![],
                else_body: vec![],
            },
            Stmt::Return(Some(Expr::var(id("x"), Ty::U8))),
        ];
        let il = lower(&module(vec![func(
            "steady",
            vec![("c", Ty::I1)],
            Some(Ty::U8),
            body,
        )]))
        .unwrap();
        il.validate().unwrap();
        let f = il.function(id("steady")).unwrap();
        assert!(f.blocks.iter().all(|b| b.phis.is_empty()));
    }

    #[test]
    fn while_loop_places_header_phi() {
        // i = 0; while (i < 10) i = i + 1; return i
        let body = vec![
            Stmt::local(id("i"), Ty::U8, Expr::byte(0)),
            Stmt::While {
                cond: Expr::compare(
                    CmpOp::Lt,
                    Expr::var(id("i"), Ty::U8),
                    Expr::byte(10),
                ),
                body: vec![Stmt::assign_var(
                    id("i"),
                    Expr::binary(BinOp::Add, Expr::var(id("i"), Ty::U8), Expr::byte(1)),
                )],
            },
            Stmt::Return(Some(Expr::var(id("i"), Ty::U8))),
        ];
        let il = lower(&module(vec![func("count", vec![], Some(Ty::U8), body)])).unwrap();
        il.validate().unwrap();
        let f = il.function(id("count")).unwrap();
        let header = f
            .blocks
            .iter()
            .find(|b| !b.phis.is_empty())
            .expect("loop header PHI");
        assert_eq!(header.phis[0].incoming.len(), 2);
    }

    #[test]
    fn short_circuit_keeps_rhs_off_the_false_path() {
        // if (a && byte_to_bool(peek($D011))) r = 1
        let cond = Expr::logical(
            LogicalOp::And,
            Expr::var(id("a"), Ty::I1),
            Expr::cast(CastKind::ByteToBool, Expr::peek(Expr::word(0xD011))),
        );
        let body = vec![
            Stmt::local(id("r"), Ty::U8, Expr::byte(0)),
            Stmt::If {
                cond,
                then_body: vec![Stmt::assign_var(id("r"), Expr::byte(1))],
                else_body: vec![],
            },
            Stmt::Return(Some(Expr::var(id("r"), Ty::U8))),
        ];
        let il = lower(&module(vec![func(
            "guarded",
            vec![("a", Ty::I1)],
            Some(Ty::U8),
            body,
        )]))
        .unwrap();
        il.validate().unwrap();
        let f = il.function(id("guarded")).unwrap();

        // The hardware read must sit in a block the false path skips: the
        // entry branches around the block containing the LoadMem.
        let load_block = f
            .blocks
            .iter()
            .enumerate()
            .find(|(_, b)| {
                b.instructions
                    .iter()
                    .any(|i| matches!(i, Instruction::LoadMem { .. }))
            })
            .map(|(i, _)| BlockId(i as u32))
            .expect("peek lowered to load_mem");
        assert_ne!(load_block, f.entry());
        match &f.blocks[0].terminator {
            Terminator::Branch { tt, ff, .. } => {
                assert_eq!(*tt, load_block);
                assert_ne!(*ff, load_block);
            }
            t => panic!("entry should branch, has {t}"),
        }
        // The merge PHI selects between the short-circuit constant and the
        // right-hand side.
        let merge = f
            .blocks
            .iter()
            .find(|b| b.phis.iter().any(|p| p.ty == Ty::I1))
            .expect("short-circuit merge PHI");
        assert_eq!(merge.phis[0].incoming.len(), 2);
    }

    #[test]
    fn for_loop_with_unconditional_break_prunes_dead_step() {
        let body = vec![
            Stmt::For {
                var: id("i"),
                from: Expr::byte(0),
                to: Expr::byte(10),
                body: vec![Stmt::Break],
            },
            Stmt::Return(None),
        ];
        let il = lower(&module(vec![func("once", vec![], None, body)])).unwrap();
        il.validate().unwrap();
    }

    #[test]
    fn match_lowers_to_a_test_chain() {
        let body = vec![
            Stmt::local(id("r"), Ty::U8, Expr::byte(0)),
            Stmt::Match {
                scrutinee: Expr::var(id("v"), Ty::U8),
                arms: vec![
                    (1, vec![Stmt::assign_var(id("r"), Expr::byte(10))]),
                    (2, vec![Stmt::assign_var(id("r"), Expr::byte(20))]),
                ],
                default: vec![Stmt::assign_var(id("r"), Expr::byte(30))],
            },
            Stmt::Return(Some(Expr::var(id("r"), Ty::U8))),
        ];
        let il = lower(&module(vec![func(
            "classify",
            vec![("v", Ty::U8)],
            Some(Ty::U8),
            body,
        )]))
        .unwrap();
        il.validate().unwrap();
        let f = il.function(id("classify")).unwrap();
        let branches = f
            .blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::Branch { .. }))
            .count();
        assert_eq!(branches, 2);
        let merge = f.blocks.iter().find(|b| !b.phis.is_empty()).unwrap();
        assert_eq!(merge.phis[0].incoming.len(), 3);
    }

    #[test]
    fn address_taken_locals_stay_in_memory() {
        // let x: u8 = 1; poke(addr_of(x), 2); return x
        let body = vec![
            Stmt::local(id("x"), Ty::U8, Expr::byte(1)),
            Stmt::Poke {
                addr: Expr::addr_of(id("x")),
                value: Expr::byte(2),
            },
            Stmt::Return(Some(Expr::var(id("x"), Ty::U8))),
        ];
        let il = lower(&module(vec![func("aliased", vec![], Some(Ty::U8), body)])).unwrap();
        il.validate().unwrap();
        let f = il.function(id("aliased")).unwrap();
        assert!(f.local(id("x")).unwrap().in_memory);
        // The final read goes through memory, not an SSA version.
        assert!(f.blocks[0]
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::LoadVar { .. })));
    }

    #[test]
    fn string_literals_deduplicate() {
        let body = vec![
            Stmt::local(id("p"), Ty::Ptr, Expr::str_lit("hello")),
            Stmt::local(id("q"), Ty::Ptr, Expr::str_lit("hello")),
            Stmt::Return(None),
        ];
        let il = lower(&module(vec![func("greet", vec![], None, body)])).unwrap();
        assert_eq!(il.strings.len(), 1);
        assert_eq!(il.strings[0].1, b"hello\0".to_vec());
    }
}
