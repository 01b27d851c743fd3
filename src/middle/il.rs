//! The SSA-form intermediate language.
//!
//! An [Module] is the whole-program unit after import linking: globals,
//! `@map` declarations, deduplicated string literals, and one [Function] per
//! source function.  Functions own basic blocks; blocks own PHIs, ordinary
//! instructions and exactly one terminator.  Every instruction defines at
//! most one value, and each value is defined exactly once (SSA).
//!
//! `validate` checks the structural invariants (single definition, dominated
//! uses, PHI lists matching predecessor sets) and is used by the test suite
//! and by the driver in debug builds.

use std::fmt::{self, Display};

use crate::common::{Id, Map};
use crate::diag::{CompileError, SourceLoc};
use crate::front::ast::{
    BinOp, CastKind, CmpOp, Init, MapDecl, Signature, Storage, Ty, UnOp, ZpMode,
};

/// An SSA value, unique within its function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, derive_more::Display, Hash)]
#[display("%{_0}")]
pub struct ValueId(pub u32);

/// A basic block, indexed within its function.  Block 0 is the entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, derive_more::Display, Hash)]
#[display("b{_0}")]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: Id,
    pub ty: Ty,
    pub storage: Storage,
    pub init: Option<Init>,
}

/// A declared local variable of a function.
#[derive(Clone, Debug)]
pub struct LocalDecl {
    pub name: Id,
    pub ty: Ty,
    pub zp: ZpMode,
    /// True when the local must live in memory: arrays, and scalars whose
    /// address is taken.  Memory locals are accessed with `load_var` /
    /// `store_var` instead of being rewritten into SSA values.
    pub in_memory: bool,
}

/// The instruction set.  Arithmetic is typed by its operands; byte and word
/// variants share opcodes.
#[derive(Clone, Debug)]
pub enum Instruction {
    /// Materialize a compile-time constant.
    Const { dst: ValueId, ty: Ty, value: u16 },
    /// SSA rename, typically introduced when a trivial PHI collapses.
    Copy { dst: ValueId, src: ValueId },
    /// Load a named global or memory-resident local.
    LoadVar { dst: ValueId, name: Id },
    StoreVar { name: Id, src: ValueId },
    /// Read a `@map` struct field; the address resolves at compile time.
    MapLoadField { dst: ValueId, map: Id, field: Id },
    MapStoreField { map: Id, field: Id, src: ValueId },
    /// Read an element of a `@map` range.
    MapLoadRange { dst: ValueId, map: Id, index: ValueId },
    MapStoreRange { map: Id, index: ValueId, src: ValueId },
    /// Load from a computed 16-bit address.
    LoadMem { dst: ValueId, addr: ValueId, ty: Ty },
    StoreMem { addr: ValueId, src: ValueId },
    /// The 16-bit address of a named variable or function.
    AddrOf { dst: ValueId, name: Id },
    Arith {
        op: BinOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    },
    Unary { op: UnOp, dst: ValueId, src: ValueId },
    Cmp {
        op: CmpOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cast {
        kind: CastKind,
        dst: ValueId,
        src: ValueId,
    },
    /// Direct call by name.  `dst` is `None` for void callees or discarded
    /// results.
    Call {
        dst: Option<ValueId>,
        callee: Id,
        args: Vec<ValueId>,
        loc: SourceLoc,
    },
    /// Call through a 16-bit function address.
    CallIndirect {
        dst: Option<ValueId>,
        target: ValueId,
        sig: Signature,
        args: Vec<ValueId>,
        loc: SourceLoc,
    },
}

impl Instruction {
    /// The value this instruction defines, if any.
    pub fn dst(&self) -> Option<ValueId> {
        use Instruction::*;

        match self {
            Const { dst, .. }
            | Copy { dst, .. }
            | LoadVar { dst, .. }
            | MapLoadField { dst, .. }
            | MapLoadRange { dst, .. }
            | LoadMem { dst, .. }
            | AddrOf { dst, .. }
            | Arith { dst, .. }
            | Unary { dst, .. }
            | Cmp { dst, .. }
            | Cast { dst, .. } => Some(*dst),
            Call { dst, .. } | CallIndirect { dst, .. } => *dst,
            StoreVar { .. }
            | MapStoreField { .. }
            | MapStoreRange { .. }
            | StoreMem { .. } => None,
        }
    }

    /// Visit every value this instruction uses.
    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        use Instruction::*;

        match self {
            Const { .. } | LoadVar { .. } | MapLoadField { .. } | AddrOf { .. } => {}
            Copy { src, .. }
            | StoreVar { src, .. }
            | MapStoreField { src, .. }
            | Unary { src, .. }
            | Cast { src, .. } => f(*src),
            MapLoadRange { index, .. } => f(*index),
            MapStoreRange { index, src, .. } => {
                f(*index);
                f(*src);
            }
            LoadMem { addr, .. } => f(*addr),
            StoreMem { addr, src } => {
                f(*addr);
                f(*src);
            }
            Arith { lhs, rhs, .. } | Cmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Call { args, .. } => args.iter().for_each(|a| f(*a)),
            CallIndirect { target, args, .. } => {
                f(*target);
                args.iter().for_each(|a| f(*a));
            }
        }
    }
}

/// Block terminators; the only control flow in the IL.
#[derive(Clone, Debug)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        guard: ValueId,
        tt: BlockId,
        ff: BlockId,
    },
    Return(Option<ValueId>),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch { tt, ff, .. } => vec![*tt, *ff],
            Terminator::Return(_) => vec![],
        }
    }

    pub fn for_each_use(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Terminator::Branch { guard, .. } => f(*guard),
            Terminator::Return(Some(v)) => f(*v),
            _ => {}
        }
    }
}

/// A head-of-block PHI.  Its incoming list covers exactly the block's
/// predecessors.
#[derive(Clone, Debug)]
pub struct Phi {
    pub dst: ValueId,
    pub ty: Ty,
    pub incoming: Vec<(BlockId, ValueId)>,
}

#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub label: Id,
    pub phis: Vec<Phi>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    /// Cached predecessor list, kept in sync by the IL generator.
    pub preds: Vec<BlockId>,
}

/// An IL function.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Id,
    pub params: Vec<(Id, Ty)>,
    pub ret: Option<Ty>,
    /// The source-level recursion opt-in (cycle membership is what the call
    /// graph derives; this is the declared flag).
    pub recursive: bool,
    pub isr: bool,
    pub blocks: Vec<BasicBlock>,
    pub locals: Vec<LocalDecl>,
    /// Type of each [ValueId].
    pub value_types: Vec<Ty>,
    /// Which source variable a value is a version of, if any.  Versions of
    /// the same variable share that variable's frame slot; unnamed values
    /// get compiler temporaries.
    pub value_origins: Vec<Option<Id>>,
    /// Loop nesting depth of each block, for allocation scoring.
    pub block_depth: Vec<u32>,
}

impl Function {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn ty(&self, v: ValueId) -> &Ty {
        &self.value_types[v.0 as usize]
    }

    pub fn origin(&self, v: ValueId) -> Option<Id> {
        self.value_origins[v.0 as usize]
    }

    pub fn block(&self, b: BlockId) -> &BasicBlock {
        &self.blocks[b.index()]
    }

    pub fn local(&self, name: Id) -> Option<&LocalDecl> {
        self.locals.iter().find(|l| l.name == name)
    }

    /// Values defined by `const` instructions, for compile-time operand
    /// folding in the backend.
    pub fn const_values(&self) -> Map<ValueId, u16> {
        let mut consts = Map::new();
        for block in &self.blocks {
            for inst in &block.instructions {
                if let Instruction::Const { dst, value, .. } = inst {
                    consts.insert(*dst, *value);
                }
            }
        }
        consts
    }

    /// Check SSA form: single definitions, dominated uses, and PHI incoming
    /// lists equal to predecessor sets.
    pub fn validate(&self) -> Result<(), CompileError> {
        let n = self.blocks.len();
        if n == 0 {
            return Err(CompileError::internal(format!(
                "{}: function has no blocks",
                self.name
            )));
        }

        // Definition sites: (block, position); PHIs are position 0.
        let mut def_site: Vec<Option<(usize, usize)>> = vec![None; self.value_types.len()];
        let mut define = |v: ValueId, site: (usize, usize)| -> Result<(), CompileError> {
            let slot = def_site
                .get_mut(v.0 as usize)
                .ok_or_else(|| CompileError::internal(format!("{}: unknown {v}", self.name)))?;
            if slot.is_some() {
                return Err(CompileError::internal(format!(
                    "{}: {v} defined more than once",
                    self.name
                )));
            }
            *slot = Some(site);
            Ok(())
        };
        for (bi, block) in self.blocks.iter().enumerate() {
            for phi in &block.phis {
                define(phi.dst, (bi, 0))?;
            }
            for (ii, inst) in block.instructions.iter().enumerate() {
                if let Some(dst) = inst.dst() {
                    define(dst, (bi, ii + 1))?;
                }
            }
        }

        // Predecessor caches must match the actual edges.
        let mut derived_preds: Vec<Vec<BlockId>> = vec![vec![]; n];
        for (bi, block) in self.blocks.iter().enumerate() {
            for succ in block.terminator.successors() {
                if succ.index() >= n {
                    return Err(CompileError::internal(format!(
                        "{}: branch to nonexistent {succ}",
                        self.name
                    )));
                }
                derived_preds[succ.index()].push(BlockId(bi as u32));
            }
        }
        for (bi, block) in self.blocks.iter().enumerate() {
            let mut cached = block.preds.clone();
            let mut derived = derived_preds[bi].clone();
            cached.sort();
            derived.sort();
            if cached != derived {
                return Err(CompileError::internal(format!(
                    "{}: stale predecessor cache on {}",
                    self.name, block.label
                )));
            }
            if bi != 0 && derived.is_empty() {
                return Err(CompileError::internal(format!(
                    "{}: unreachable block {}",
                    self.name, block.label
                )));
            }
        }

        let dom = self.dominators();
        let dominates = |a: usize, b: usize| dom[b][a];

        // A use at (block, pos) must be dominated by its definition.
        let check_use = |v: ValueId, block: usize, pos: usize| -> Result<(), CompileError> {
            let (db, dp) = def_site[v.0 as usize].ok_or_else(|| {
                CompileError::internal(format!("{}: use of undefined {v}", self.name))
            })?;
            let ok = if db == block { dp < pos } else { dominates(db, block) };
            if !ok {
                return Err(CompileError::internal(format!(
                    "{}: use of {v} not dominated by its definition",
                    self.name
                )));
            }
            Ok(())
        };

        for (bi, block) in self.blocks.iter().enumerate() {
            for phi in &block.phis {
                let mut labels: Vec<BlockId> =
                    phi.incoming.iter().map(|(b, _)| *b).collect();
                let mut preds = block.preds.clone();
                labels.sort();
                preds.sort();
                if labels != preds {
                    return Err(CompileError::internal(format!(
                        "{}: PHI {} does not cover the predecessors of {}",
                        self.name, phi.dst, block.label
                    )));
                }
                // Incoming values must dominate the end of their predecessor.
                for (pred, value) in &phi.incoming {
                    let (db, _) = def_site[value.0 as usize].ok_or_else(|| {
                        CompileError::internal(format!(
                            "{}: PHI incoming {value} is undefined",
                            self.name
                        ))
                    })?;
                    if db != pred.index() && !dominates(db, pred.index()) {
                        return Err(CompileError::internal(format!(
                            "{}: PHI incoming {value} does not dominate the end of {pred}",
                            self.name
                        )));
                    }
                }
            }
            for (ii, inst) in block.instructions.iter().enumerate() {
                let mut result = Ok(());
                inst.for_each_use(|v| {
                    if result.is_ok() {
                        result = check_use(v, bi, ii + 1);
                    }
                });
                result?;
            }
            let mut result = Ok(());
            block
                .terminator
                .for_each_use(|v| {
                    if result.is_ok() {
                        result = check_use(v, bi, usize::MAX);
                    }
                });
            result?;
        }
        Ok(())
    }

    /// Dominator sets by iteration: `dom[b][a]` is true when `a` dominates
    /// `b`.  Functions are small enough that the quadratic representation is
    /// fine.
    fn dominators(&self) -> Vec<Vec<bool>> {
        let n = self.blocks.len();
        let mut dom = vec![vec![true; n]; n];
        dom[0] = vec![false; n];
        dom[0][0] = true;

        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..n {
                let mut new: Option<Vec<bool>> = None;
                for pred in &self.blocks[b].preds {
                    let p = &dom[pred.index()];
                    new = Some(match new {
                        None => p.clone(),
                        Some(acc) => acc
                            .iter()
                            .zip(p.iter())
                            .map(|(x, y)| *x && *y)
                            .collect(),
                    });
                }
                let mut new = new.unwrap_or_else(|| vec![false; n]);
                new[b] = true;
                if new != dom[b] {
                    dom[b] = new;
                    changed = true;
                }
            }
        }
        dom
    }
}

/// The whole-program IL module.
#[derive(Clone, Debug)]
pub struct Module {
    pub name: Id,
    pub globals: Map<Id, Global>,
    pub maps: Map<Id, MapDecl>,
    /// Deduplicated string literals: label, null-terminated bytes.
    pub strings: Vec<(Id, Vec<u8>)>,
    /// Functions in source declaration order.
    pub functions: Vec<Function>,
}

impl Module {
    /// Assemble a module, checking the `@map` address-space invariants: no
    /// two declarations overlap and none extends past `$FFFF`.
    pub fn new(
        name: Id,
        globals: Map<Id, Global>,
        maps: Vec<MapDecl>,
        strings: Vec<(Id, Vec<u8>)>,
        functions: Vec<Function>,
    ) -> Result<Module, Vec<CompileError>> {
        let mut errors = Vec::new();
        let mut spans: Vec<(u32, u32, Id)> = Vec::new();
        for decl in &maps {
            let (start, end) = decl.extent();
            if end > 0x1_0000 {
                errors.push(CompileError::MapOutOfRange { map: decl.name });
                continue;
            }
            for (ostart, oend, oname) in &spans {
                if start < *oend && *ostart < end {
                    errors.push(CompileError::MapOverlap {
                        first: *oname,
                        second: decl.name,
                    });
                }
            }
            spans.push((start, end, decl.name));
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Module {
            name,
            globals,
            maps: maps.into_iter().map(|m| (m.name, m)).collect(),
            strings,
            functions,
        })
    }

    pub fn function(&self, name: Id) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Validate every function; see [Function::validate].
    pub fn validate(&self) -> Result<(), CompileError> {
        for func in &self.functions {
            func.validate()?;
        }
        Ok(())
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;

        match self {
            Const { dst, ty, value } => write!(f, "{dst} = const {ty} {value}"),
            Copy { dst, src } => write!(f, "{dst} = copy {src}"),
            LoadVar { dst, name } => write!(f, "{dst} = load_var {name}"),
            StoreVar { name, src } => write!(f, "store_var {name}, {src}"),
            MapLoadField { dst, map, field } => {
                write!(f, "{dst} = map_load_field {map}, {field}")
            }
            MapStoreField { map, field, src } => {
                write!(f, "map_store_field {map}, {field}, {src}")
            }
            MapLoadRange { dst, map, index } => {
                write!(f, "{dst} = map_load_range {map}, {index}")
            }
            MapStoreRange { map, index, src } => {
                write!(f, "map_store_range {map}, {index}, {src}")
            }
            LoadMem { dst, addr, ty } => write!(f, "{dst} = load_mem {addr}, {ty}"),
            StoreMem { addr, src } => write!(f, "store_mem {addr}, {src}"),
            AddrOf { dst, name } => write!(f, "{dst} = addr_of {name}"),
            Arith { op, dst, lhs, rhs } => write!(f, "{dst} = {op} {lhs}, {rhs}"),
            Unary { op, dst, src } => write!(f, "{dst} = {op} {src}"),
            Cmp { op, dst, lhs, rhs } => write!(f, "{dst} = {op} {lhs}, {rhs}"),
            Cast { kind, dst, src } => write!(f, "{dst} = {kind} {src}"),
            Call {
                dst, callee, args, ..
            } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = ")?;
                }
                write!(f, "call {callee}")?;
                for arg in args {
                    write!(f, ", {arg}")?;
                }
                Ok(())
            }
            CallIndirect {
                dst, target, args, ..
            } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = ")?;
                }
                write!(f, "call_indirect {target}")?;
                for arg in args {
                    write!(f, ", {arg}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(b) => write!(f, "br {b}"),
            Terminator::Branch { guard, tt, ff } => {
                write!(f, "br_if {guard}, {tt}, {ff}")
            }
            Terminator::Return(None) => write!(f, "return"),
            Terminator::Return(Some(v)) => write!(f, "return {v}"),
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, (name, ty)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {ty}")?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.ret {
            write!(f, " -> {ret}")?;
        }
        if self.recursive {
            write!(f, " recursive")?;
        }
        if self.isr {
            write!(f, " isr")?;
        }
        writeln!(f, " {{")?;
        for (bi, block) in self.blocks.iter().enumerate() {
            writeln!(f, "{} (b{bi}):", block.label)?;
            for phi in &block.phis {
                write!(f, "    {} = phi {}", phi.dst, phi.ty)?;
                for (pred, value) in &phi.incoming {
                    write!(f, ", [{pred}: {value}]")?;
                }
                writeln!(f)?;
            }
            for inst in &block.instructions {
                writeln!(f, "    {inst}")?;
            }
            writeln!(f, "    {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for global in self.globals.values() {
            writeln!(f, "global {} : {} ({})", global.name, global.ty, global.storage)?;
        }
        for map in self.maps.values() {
            let (start, end) = map.extent();
            writeln!(f, "@map {} [${start:04X}..${end:04X})", map.name)?;
        }
        for (label, bytes) in &self.strings {
            writeln!(f, "data {label}: {} bytes", bytes.len())?;
        }
        for func in &self.functions {
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}
