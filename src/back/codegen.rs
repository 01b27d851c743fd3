//! Lowering SSA IL to 6502 ASM-IL.
//!
//! The 6502 gives us three 8-bit registers, so nearly every value lives in
//! memory: each SSA value has a *home* (its frame or zero-page slot from the
//! allocators) and is written through to it as soon as it is defined.  The
//! per-register tracker only memoizes what A, X and Y currently hold so a
//! reload can be skipped; it never makes a register the sole owner of a
//! live value.  That discipline is what keeps the location table consistent
//! with the emitted code; the alternative, guessing that operands are
//! still in registers, is the classic way a 6502 backend goes wrong.
//!
//! PHIs have no instruction.  Every predecessor copies its incoming values
//! into the PHI homes immediately before its terminator, as one parallel
//! copy; cycles are broken through the platform scratch cells.  The
//! successor then simply finds each PHI's value in its home.
//!
//! # Calling convention
//!
//! - Arguments are written by the caller directly into the callee's
//!   statically allocated parameter slots.  A caller of a static function
//!   can never be the callee itself, or the program would have needed the
//!   recursion flag.
//! - Byte results return in A; word results in A (low) / X (high).
//! - The callee preserves nothing; callers assume A, X and Y are gone.
//! - Recursive callees get a software-stack frame: the call site drops the
//!   stack pointer by the callee's frame size, writes arguments
//!   sp-relative, and restores the pointer after the call.
//! - Indirect calls write arguments into the parameter slots of *every*
//!   possible target (the address-taken functions of matching signature;
//!   each owns its frame exclusively), then go through the emitted
//!   `__jmpto` shim, since `JSR` has no indirect mode.
//!
//! Interrupt entry functions save and restore A, X and Y around their body
//! and return with `RTI`.

use log::trace;

use crate::back::asm::{
    self, Addr, DataItem, Inst,
    Mnemonic::{self, *},
    Operand, Symbol,
};
use crate::common::{id, Id, Map, Set};
use crate::diag::CompileError;
use crate::front::ast::{BinOp, CastKind, CmpOp, Init, Signature, Storage, Ty, UnOp};
use crate::middle::callgraph::CallGraph;
use crate::middle::frame::{FrameMap, FunctionFrame, Location, Slot, SlotKind};
use crate::middle::il::{self, BlockId, Instruction, Terminator, ValueId};
use crate::middle::zeropage::ZpMap;
use crate::platform::Platform;

/// Translate a whole module.  Deterministic for fixed inputs.
pub fn lower(
    il_mod: &il::Module,
    graph: &CallGraph,
    frames: &FrameMap,
    zp: &ZpMap,
    platform: &Platform,
) -> Result<asm::Module, Vec<CompileError>> {
    let mut shared = Shared {
        externs: Set::new(),
        jmpto: false,
    };
    let mut functions = Vec::new();
    let mut errors = Vec::new();
    for func in &il_mod.functions {
        let Some(frame) = frames.frame(func.name) else {
            errors.push(CompileError::internal(format!(
                "no frame allocated for {}",
                func.name
            )));
            continue;
        };
        let lowerer = FnLower {
            il: il_mod,
            func,
            graph,
            frames,
            frame,
            zp,
            platform,
            consts: func.const_values(),
            shared: &mut shared,
            out: Vec::new(),
            cur: Vec::new(),
            regs: Regs::default(),
            labels: 0,
            sp_bias: 0,
        };
        match lowerer.run() {
            Ok(f) => functions.push(f),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    if shared.jmpto {
        // JSR cannot go through a pointer; this shim jumps through the
        // scratch cells so the callee's RTS returns to the real caller.
        let name = id("__jmpto");
        functions.push(asm::Function {
            name,
            blocks: vec![asm::Block {
                label: name,
                insts: vec![Inst::op(
                    Jmp,
                    Operand::Ind(Addr::Num(platform.scratch_cells()[0] as u16)),
                )],
            }],
        });
    }

    let mut module = asm::Module {
        functions,
        data: Vec::new(),
        symbols: Map::new(),
    };

    for func in &il_mod.functions {
        module.symbols.insert(func.name, Symbol::Function);
    }
    if shared.jmpto {
        module.symbols.insert(id("__jmpto"), Symbol::Function);
    }
    for helper in &shared.externs {
        module.symbols.insert(*helper, Symbol::Extern);
    }

    for global in il_mod.globals.values() {
        match global.storage {
            Storage::Ram => {
                module.data.push(DataItem::Reserve {
                    label: global.name,
                    size: global.ty.size_bytes(),
                });
                module.symbols.insert(global.name, Symbol::Data);
            }
            Storage::Data => {
                module.data.push(match &global.init {
                    Some(init) => DataItem::Bytes {
                        label: global.name,
                        bytes: init_bytes(init, &global.ty),
                    },
                    None => DataItem::Reserve {
                        label: global.name,
                        size: global.ty.size_bytes(),
                    },
                });
                module.symbols.insert(global.name, Symbol::Data);
            }
            Storage::Zp => {
                if let Some(addr) = zp.global(global.name) {
                    module.symbols.insert(global.name, Symbol::ZeroPage(addr));
                }
            }
            // Const globals fold away during IL generation.
            Storage::Const => {}
        }
    }
    for (label, bytes) in &il_mod.strings {
        module.data.push(DataItem::Bytes {
            label: *label,
            bytes: bytes.clone(),
        });
        module.symbols.insert(*label, Symbol::Data);
    }

    // Frame-region and zero-page assignments of named slots, for the
    // emitter's listing.
    for func in &il_mod.functions {
        let frame = &frames.frames[&func.name];
        for slot in &frame.slots {
            if slot.kind == SlotKind::Temp {
                continue;
            }
            let sym = match slot.location {
                Some(Location::ZeroPage(a)) => Symbol::ZeroPage(a),
                Some(Location::Frame(a)) => Symbol::Frame(a),
                _ => continue,
            };
            module
                .symbols
                .insert(id(format!("{}.{}", func.name, slot.name)), sym);
        }
    }

    Ok(module)
}

fn init_bytes(init: &Init, ty: &Ty) -> Vec<u8> {
    match init {
        Init::Scalar(v) => {
            if ty.size_bytes() == 1 {
                vec![*v as u8]
            } else {
                vec![*v as u8, (*v >> 8) as u8]
            }
        }
        Init::Bytes(b) => b.clone(),
    }
}

/// Module-wide lowering side state.
struct Shared {
    externs: Set<Id>,
    jmpto: bool,
}

/// A resolved storage location, byte-addressable.
#[derive(Clone, PartialEq, Eq, Debug)]
enum Loc {
    Zp(u8),
    Abs(u16),
    Sym(Id, u16),
    /// Offset into the current software-stack frame.
    SpRel(u16),
}

/// What a register is known to hold.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegVal {
    /// The low byte of a value.
    Lo(ValueId),
    /// The high byte of a value.
    Hi(ValueId),
    Imm(u8),
}

#[derive(Clone, Copy, Default, Debug)]
struct Regs {
    a: Option<RegVal>,
    x: Option<RegVal>,
    y: Option<RegVal>,
}

struct FnLower<'a> {
    il: &'a il::Module,
    func: &'a il::Function,
    graph: &'a CallGraph,
    frames: &'a FrameMap,
    frame: &'a FunctionFrame,
    zp: &'a ZpMap,
    platform: &'a Platform,
    consts: Map<ValueId, u16>,
    shared: &'a mut Shared,
    out: Vec<asm::Block>,
    cur: Vec<Inst>,
    regs: Regs,
    labels: u32,
    /// Extra displacement of the current function's own sp-relative slots
    /// while the stack pointer is temporarily lowered around a recursive
    /// call.
    sp_bias: u16,
}

impl<'a> FnLower<'a> {
    fn run(mut self) -> Result<asm::Function, CompileError> {
        let func = self.func;
        for (bi, block) in func.blocks.iter().enumerate() {
            let bid = BlockId(bi as u32);
            self.cur = Vec::new();
            self.regs = Regs::default();
            if bi == 0 && func.isr {
                // An interrupt arrives mid-flight; nothing may leak.
                self.implied(Pha);
                self.implied(Txa);
                self.implied(Pha);
                self.implied(Tya);
                self.implied(Pha);
                self.regs = Regs::default();
            }
            for inst in &block.instructions {
                self.lower_inst(inst)?;
            }
            self.lower_term(bid, &block.terminator)?;
            let label = self.block_label(bid);
            let insts = std::mem::take(&mut self.cur);
            self.out.push(asm::Block { label, insts });
        }
        trace!("lowered {} to {} asm blocks", self.func.name, self.out.len());
        Ok(asm::Function {
            name: self.func.name,
            blocks: self.out,
        })
    }

    // ---- emission primitives ----

    fn emit(&mut self, inst: Inst) {
        self.cur.push(inst);
    }

    fn op(&mut self, mn: Mnemonic, operand: Operand) {
        self.emit(Inst::op(mn, operand));
    }

    fn vop(&mut self, mn: Mnemonic, operand: Operand) {
        self.emit(Inst::volatile(mn, operand));
    }

    fn implied(&mut self, mn: Mnemonic) {
        self.emit(Inst::implied(mn));
    }

    fn local_label(&mut self) -> Id {
        self.labels += 1;
        id(format!("{}__l{}", self.func.name, self.labels))
    }

    fn block_label(&self, b: BlockId) -> Id {
        if b.index() == 0 {
            self.func.name
        } else {
            id(format!("{}_{}", self.func.name, self.func.block(b).label))
        }
    }

    // ---- location resolution ----

    fn sp_cell(&self) -> Result<u8, CompileError> {
        self.frames.software_sp.ok_or_else(|| {
            CompileError::internal(format!(
                "{}: software stack used without a stack pointer cell",
                self.func.name
            ))
        })
    }

    fn slot_loc(&self, slot: &Slot) -> Result<Loc, CompileError> {
        match slot.location {
            Some(Location::ZeroPage(a)) => Ok(Loc::Zp(a)),
            Some(Location::Frame(a)) => Ok(Loc::Abs(a)),
            Some(Location::SpRelative(o)) => Ok(Loc::SpRel(o)),
            None => Err(CompileError::internal(format!(
                "{}: slot {} has no location",
                self.func.name, slot.name
            ))),
        }
    }

    fn value_loc(&self, v: ValueId) -> Result<Loc, CompileError> {
        let slot = self.frame.slot_for_value(v).ok_or_else(|| {
            CompileError::internal(format!("{}: no home for {v}", self.func.name))
        })?;
        self.slot_loc(slot)
    }

    fn name_loc(&self, name: Id) -> Result<Loc, CompileError> {
        if let Some(slot) = self.frame.slot_for_name(name) {
            return self.slot_loc(slot);
        }
        if let Some(addr) = self.zp.global(name) {
            return Ok(Loc::Zp(addr));
        }
        if self.il.globals.contains_key(&name)
            || self.il.strings.iter().any(|(l, _)| *l == name)
        {
            return Ok(Loc::Sym(name, 0));
        }
        Err(CompileError::internal(format!(
            "{}: unknown variable {name}",
            self.func.name
        )))
    }

    /// The operand addressing byte `k` of a location.  Emits the `LDY`
    /// needed by sp-relative access.
    fn byte_operand(&mut self, loc: &Loc, k: u16) -> Result<Operand, CompileError> {
        Ok(match loc {
            Loc::Zp(a) => Operand::Zp(a.wrapping_add(k as u8)),
            Loc::Abs(a) => Operand::Abs(Addr::Num(a.wrapping_add(k))),
            Loc::Sym(s, o) => {
                let off = o + k;
                if off == 0 {
                    Operand::Abs(Addr::Sym(*s))
                } else {
                    Operand::Abs(Addr::SymOff(*s, off))
                }
            }
            Loc::SpRel(off) => {
                let y = off + k + self.sp_bias;
                if y > 0xFF {
                    return Err(CompileError::internal(format!(
                        "{}: software frame offset {y} exceeds one page",
                        self.func.name
                    )));
                }
                self.load_y_imm(y as u8);
                Operand::IndY(self.sp_cell()?)
            }
        })
    }

    // ---- register loads and stores ----

    fn load_y_imm(&mut self, n: u8) {
        if self.regs.y == Some(RegVal::Imm(n)) {
            return;
        }
        self.op(Ldy, Operand::Imm(n));
        self.regs.y = Some(RegVal::Imm(n));
    }

    fn load_a_imm(&mut self, n: u8) {
        if self.regs.a == Some(RegVal::Imm(n)) {
            return;
        }
        self.op(Lda, Operand::Imm(n));
        self.regs.a = Some(RegVal::Imm(n));
    }

    fn const_byte(&self, v: ValueId, k: u16) -> Option<u8> {
        self.consts.get(&v).map(|c| (*c >> (8 * k)) as u8)
    }

    /// Bring byte `k` of `v` into A.  Returns true when an actual load was
    /// emitted (callers that branch on flags care).
    fn load_a_value(&mut self, v: ValueId, k: u16) -> Result<bool, CompileError> {
        let want = if k == 0 { RegVal::Lo(v) } else { RegVal::Hi(v) };
        if self.regs.a == Some(want) {
            return Ok(false);
        }
        if let Some(b) = self.const_byte(v, k) {
            let had = self.regs.a == Some(RegVal::Imm(b));
            self.load_a_imm(b);
            return Ok(!had);
        }
        let loc = self.value_loc(v)?;
        let opnd = self.byte_operand(&loc, k)?;
        self.op(Lda, opnd);
        self.regs.a = Some(want);
        Ok(true)
    }

    /// Write A into byte `k` of `v`'s home.
    fn store_a_value(&mut self, v: ValueId, k: u16) -> Result<(), CompileError> {
        let loc = self.value_loc(v)?;
        let opnd = self.byte_operand(&loc, k)?;
        self.op(Sta, opnd);
        let want = if k == 0 { RegVal::Lo(v) } else { RegVal::Hi(v) };
        if !matches!(self.regs.a, Some(RegVal::Imm(_))) {
            self.regs.a = Some(want);
        }
        Ok(())
    }

    /// Bring byte `k` of `v` into X, possibly through A.
    fn load_x_value(&mut self, v: ValueId, k: u16) -> Result<(), CompileError> {
        let want = if k == 0 { RegVal::Lo(v) } else { RegVal::Hi(v) };
        if self.regs.x == Some(want) {
            return Ok(());
        }
        if let Some(b) = self.const_byte(v, k) {
            if self.regs.x != Some(RegVal::Imm(b)) {
                self.op(Ldx, Operand::Imm(b));
                self.regs.x = Some(RegVal::Imm(b));
            }
            return Ok(());
        }
        let loc = self.value_loc(v)?;
        match loc {
            Loc::SpRel(_) => {
                // LDX has no (zp),Y mode; go through A.
                self.load_a_value(v, k)?;
                self.implied(Tax);
                self.regs.x = self.regs.a;
            }
            _ => {
                let opnd = self.byte_operand(&loc, k)?;
                self.op(Ldx, opnd);
                self.regs.x = Some(want);
            }
        }
        Ok(())
    }

    /// The memory (or immediate) operand for the second input of an ALU
    /// instruction.
    fn mem_operand(&mut self, v: ValueId, k: u16) -> Result<Operand, CompileError> {
        if let Some(b) = self.const_byte(v, k) {
            return Ok(Operand::Imm(b));
        }
        let loc = self.value_loc(v)?;
        self.byte_operand(&loc, k)
    }

    fn ty_size(&self, v: ValueId) -> u16 {
        self.func.ty(v).size_bytes()
    }

    // ---- instruction lowering ----

    fn lower_inst(&mut self, inst: &Instruction) -> Result<(), CompileError> {
        match inst {
            Instruction::Const { dst, ty, value } => {
                self.load_a_imm(*value as u8);
                self.store_a_value(*dst, 0)?;
                if ty.size_bytes() == 2 {
                    self.load_a_imm((*value >> 8) as u8);
                    self.store_a_value(*dst, 1)?;
                }
                Ok(())
            }
            Instruction::Copy { dst, src } => {
                for k in 0..self.ty_size(*dst) {
                    self.load_a_value(*src, k)?;
                    self.store_a_value(*dst, k)?;
                }
                Ok(())
            }
            Instruction::LoadVar { dst, name } => {
                let loc = self.name_loc(*name)?;
                for k in 0..self.ty_size(*dst) {
                    let opnd = self.byte_operand(&loc, k)?;
                    self.op(Lda, opnd);
                    self.regs.a = None;
                    self.store_a_value(*dst, k)?;
                }
                Ok(())
            }
            Instruction::StoreVar { name, src } => {
                let loc = self.name_loc(*name)?;
                for k in 0..self.ty_size(*src) {
                    self.load_a_value(*src, k)?;
                    let opnd = self.byte_operand(&loc, k)?;
                    self.op(Sta, opnd);
                }
                Ok(())
            }
            Instruction::MapLoadField { dst, map, field } => {
                let (addr, ty) = self.map_field(*map, *field)?;
                for k in 0..ty.size_bytes() {
                    self.vop(Lda, abs_or_zp(addr + k));
                    self.regs.a = None;
                    self.store_a_value(*dst, k)?;
                }
                Ok(())
            }
            Instruction::MapStoreField { map, field, src } => {
                let (addr, ty) = self.map_field(*map, *field)?;
                for k in 0..ty.size_bytes() {
                    self.load_a_value(*src, k)?;
                    self.vop(Sta, abs_or_zp(addr + k));
                }
                Ok(())
            }
            Instruction::MapLoadRange { dst, map, index } => {
                self.lower_map_range(*map, *index, MapDir::Load(*dst))
            }
            Instruction::MapStoreRange { map, index, src } => {
                self.lower_map_range(*map, *index, MapDir::Store(*src))
            }
            Instruction::LoadMem { dst, addr, ty } => {
                self.lower_raw_mem(*addr, ty.size_bytes(), MapDir::Load(*dst))
            }
            Instruction::StoreMem { addr, src } => {
                let size = self.ty_size(*src);
                self.lower_raw_mem(*addr, size, MapDir::Store(*src))
            }
            Instruction::AddrOf { dst, name } => self.lower_addr_of(*dst, *name),
            Instruction::Arith { op, dst, lhs, rhs } => {
                self.lower_arith(*op, *dst, *lhs, *rhs)
            }
            Instruction::Unary { op, dst, src } => self.lower_unary(*op, *dst, *src),
            Instruction::Cmp { op, dst, lhs, rhs } => self.lower_cmp(*op, *dst, *lhs, *rhs),
            Instruction::Cast { kind, dst, src } => self.lower_cast(*kind, *dst, *src),
            Instruction::Call {
                dst, callee, args, ..
            } => self.lower_call(*dst, *callee, args),
            Instruction::CallIndirect {
                dst,
                target,
                sig,
                args,
                ..
            } => self.lower_call_indirect(*dst, *target, sig, args),
        }
    }

    fn map_field(&self, map: Id, field: Id) -> Result<(u16, Ty), CompileError> {
        let decl = self.il.maps.get(&map).ok_or_else(|| {
            CompileError::internal(format!("{}: unknown @map {map}", self.func.name))
        })?;
        decl.field(field).ok_or_else(|| {
            CompileError::internal(format!(
                "{}: @map {map} has no field {field}",
                self.func.name
            ))
        })
    }

    fn lower_map_range(
        &mut self,
        map: Id,
        index: ValueId,
        dir: MapDir,
    ) -> Result<(), CompileError> {
        let decl = self.il.maps.get(&map).ok_or_else(|| {
            CompileError::internal(format!("{}: unknown @map {map}", self.func.name))
        })?;
        let (base, _len, elem) = decl.range().ok_or_else(|| {
            CompileError::internal(format!("{}: @map {map} is not a range", self.func.name))
        })?;
        let esize = elem.size_bytes();

        if let Some(c) = self.consts.get(&index) {
            let addr = base + c * esize;
            return self.fixed_map_access(addr, esize, dir);
        }

        if self.ty_size(index) == 1 && esize == 1 {
            // Byte index over byte elements: absolute,X addressing.
            self.load_x_value(index, 0)?;
            match dir {
                MapDir::Load(dst) => {
                    self.vop(Lda, Operand::AbsX(Addr::Num(base)));
                    self.regs.a = None;
                    self.store_a_value(dst, 0)?;
                }
                MapDir::Store(src) => {
                    self.load_a_value(src, 0)?;
                    self.vop(Sta, Operand::AbsX(Addr::Num(base)));
                }
            }
            return Ok(());
        }

        // Everything else goes through a pointer in the scratch cells:
        // scale the index to a 16-bit byte offset, add the base.
        let [s0, s1, ..] = self.platform.scratch_cells();
        let wide_index = self.ty_size(index) == 2;
        if esize == 2 {
            self.load_a_value(index, 0)?;
            self.op(Asl, Operand::Acc);
            self.op(Sta, Operand::Zp(s0));
            if wide_index {
                self.load_a_value(index, 1)?;
            } else {
                self.op(Lda, Operand::Imm(0));
            }
            self.op(Rol, Operand::Acc);
            self.op(Sta, Operand::Zp(s1));
            self.regs.a = None;
            self.implied(Clc);
            self.op(Lda, Operand::Zp(s0));
            self.op(Adc, Operand::Imm(base as u8));
            self.op(Sta, Operand::Zp(s0));
            self.op(Lda, Operand::Zp(s1));
            self.op(Adc, Operand::Imm((base >> 8) as u8));
            self.op(Sta, Operand::Zp(s1));
        } else {
            self.implied(Clc);
            self.load_a_value(index, 0)?;
            self.op(Adc, Operand::Imm(base as u8));
            self.op(Sta, Operand::Zp(s0));
            if wide_index {
                self.load_a_value(index, 1)?;
            } else {
                self.op(Lda, Operand::Imm(0));
            }
            self.op(Adc, Operand::Imm((base >> 8) as u8));
            self.op(Sta, Operand::Zp(s1));
        }
        self.regs.a = None;
        for k in 0..esize {
            match dir {
                MapDir::Load(dst) => {
                    self.load_y_imm(k as u8);
                    self.vop(Lda, Operand::IndY(s0));
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
                MapDir::Store(src) => {
                    // A first: loading it may itself need Y.
                    self.load_a_value(src, k)?;
                    self.load_y_imm(k as u8);
                    self.vop(Sta, Operand::IndY(s0));
                }
            }
        }
        Ok(())
    }

    fn fixed_map_access(
        &mut self,
        addr: u16,
        size: u16,
        dir: MapDir,
    ) -> Result<(), CompileError> {
        for k in 0..size {
            match dir {
                MapDir::Load(dst) => {
                    self.vop(Lda, abs_or_zp(addr + k));
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
                MapDir::Store(src) => {
                    self.load_a_value(src, k)?;
                    self.vop(Sta, abs_or_zp(addr + k));
                }
            }
        }
        Ok(())
    }

    /// `load_mem`/`store_mem`: through the address value's own zero-page
    /// home when it has one (that is what pointers are promoted for),
    /// otherwise through the scratch pointer.
    fn lower_raw_mem(
        &mut self,
        addr: ValueId,
        size: u16,
        dir: MapDir,
    ) -> Result<(), CompileError> {
        if let Some(c) = self.consts.get(&addr).copied() {
            return self.fixed_map_access(c, size, dir);
        }
        let ptr_zp = match self.value_loc(addr)? {
            Loc::Zp(z) => z,
            _ => {
                let [s0, s1, ..] = self.platform.scratch_cells();
                self.load_a_value(addr, 0)?;
                self.op(Sta, Operand::Zp(s0));
                self.load_a_value(addr, 1)?;
                self.op(Sta, Operand::Zp(s1));
                s0
            }
        };
        for k in 0..size {
            match dir {
                MapDir::Load(dst) => {
                    self.load_y_imm(k as u8);
                    self.vop(Lda, Operand::IndY(ptr_zp));
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
                MapDir::Store(src) => {
                    // A first: loading it may itself need Y.
                    self.load_a_value(src, k)?;
                    self.load_y_imm(k as u8);
                    self.vop(Sta, Operand::IndY(ptr_zp));
                }
            }
        }
        Ok(())
    }

    fn lower_addr_of(&mut self, dst: ValueId, name: Id) -> Result<(), CompileError> {
        // Functions, globals and string labels resolve at assembly time.
        if self.il.function(name).is_some()
            || self.il.globals.contains_key(&name)
            || self.il.strings.iter().any(|(l, _)| *l == name)
        {
            if let Some(z) = self.zp.global(name) {
                self.load_a_imm(z);
                self.store_a_value(dst, 0)?;
                self.load_a_imm(0);
                self.store_a_value(dst, 1)?;
                return Ok(());
            }
            self.op(Lda, Operand::ImmLo(name));
            self.regs.a = None;
            self.store_a_value(dst, 0)?;
            self.op(Lda, Operand::ImmHi(name));
            self.regs.a = None;
            self.store_a_value(dst, 1)?;
            return Ok(());
        }
        // A named slot of this function.
        let slot = self.frame.slot_for_name(name).ok_or_else(|| {
            CompileError::internal(format!("{}: addr_of unknown {name}", self.func.name))
        })?;
        match self.slot_loc(slot)? {
            Loc::Zp(a) => {
                self.load_a_imm(a);
                self.store_a_value(dst, 0)?;
                self.load_a_imm(0);
                self.store_a_value(dst, 1)?;
            }
            Loc::Abs(a) => {
                self.load_a_imm(a as u8);
                self.store_a_value(dst, 0)?;
                self.load_a_imm((a >> 8) as u8);
                self.store_a_value(dst, 1)?;
            }
            Loc::SpRel(off) => {
                let sp = self.sp_cell()?;
                let off = off + self.sp_bias;
                self.implied(Clc);
                self.op(Lda, Operand::Zp(sp));
                self.op(Adc, Operand::Imm(off as u8));
                self.regs.a = None;
                self.store_a_value(dst, 0)?;
                self.op(Lda, Operand::Zp(sp + 1));
                self.op(Adc, Operand::Imm((off >> 8) as u8));
                self.regs.a = None;
                self.store_a_value(dst, 1)?;
            }
            Loc::Sym(..) => unreachable!("slots never resolve to symbols"),
        }
        Ok(())
    }

    fn lower_arith(
        &mut self,
        op: BinOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(), CompileError> {
        let size = self.ty_size(dst);
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let commutative = !matches!(op, BinOp::Sub);
                let (l, r) = if commutative
                    && size == 1
                    && self.regs.a == Some(RegVal::Lo(rhs))
                {
                    (rhs, lhs)
                } else {
                    (lhs, rhs)
                };
                let mn = match op {
                    BinOp::Add => Adc,
                    BinOp::Sub => Sbc,
                    BinOp::And => And,
                    BinOp::Or => Ora,
                    BinOp::Xor => Eor,
                    _ => unreachable!(),
                };
                for k in 0..size {
                    self.load_a_value(l, k)?;
                    if k == 0 {
                        match op {
                            BinOp::Add => self.implied(Clc),
                            BinOp::Sub => self.implied(Sec),
                            _ => {}
                        }
                    }
                    let opnd = self.mem_operand(r, k)?;
                    self.op(mn, opnd);
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
                Ok(())
            }
            BinOp::Shl | BinOp::Shr => self.lower_shift(op, dst, lhs, rhs),
            BinOp::Mul | BinOp::Div | BinOp::Mod => self.lower_helper_call(op, dst, lhs, rhs),
        }
    }

    fn lower_shift(
        &mut self,
        op: BinOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(), CompileError> {
        let size = self.ty_size(dst);
        let left = op == BinOp::Shl;
        if let Some(n) = self.consts.get(&rhs).copied() {
            let n = n.min(8 * size) as usize;
            if size == 1 {
                self.load_a_value(lhs, 0)?;
                for _ in 0..n {
                    self.op(if left { Asl } else { Lsr }, Operand::Acc);
                }
                self.regs.a = None;
                self.store_a_value(dst, 0)?;
            } else {
                let [s0, s1, ..] = self.platform.scratch_cells();
                self.load_a_value(lhs, 0)?;
                self.op(Sta, Operand::Zp(s0));
                self.load_a_value(lhs, 1)?;
                self.op(Sta, Operand::Zp(s1));
                for _ in 0..n {
                    if left {
                        self.op(Asl, Operand::Zp(s0));
                        self.op(Rol, Operand::Zp(s1));
                    } else {
                        self.op(Lsr, Operand::Zp(s1));
                        self.op(Ror, Operand::Zp(s0));
                    }
                }
                self.op(Lda, Operand::Zp(s0));
                self.regs.a = None;
                self.store_a_value(dst, 0)?;
                self.op(Lda, Operand::Zp(s1));
                self.regs.a = None;
                self.store_a_value(dst, 1)?;
            }
            return Ok(());
        }

        // Variable count: loop on X over the low count byte.
        let done = self.local_label();
        let again = self.local_label();
        if size == 1 {
            self.load_x_value(rhs, 0)?;
            self.load_a_value(lhs, 0)?;
            self.op(Cpx, Operand::Imm(0));
            self.op(Beq, Operand::Label(done));
            self.emit(Inst::Label(again));
            self.op(if left { Asl } else { Lsr }, Operand::Acc);
            self.implied(Dex);
            self.op(Bne, Operand::Label(again));
            self.emit(Inst::Label(done));
            self.regs = Regs::default();
            self.store_a_value(dst, 0)?;
        } else {
            let [s0, s1, ..] = self.platform.scratch_cells();
            self.load_a_value(lhs, 0)?;
            self.op(Sta, Operand::Zp(s0));
            self.load_a_value(lhs, 1)?;
            self.op(Sta, Operand::Zp(s1));
            self.load_x_value(rhs, 0)?;
            self.op(Cpx, Operand::Imm(0));
            self.op(Beq, Operand::Label(done));
            self.emit(Inst::Label(again));
            if left {
                self.op(Asl, Operand::Zp(s0));
                self.op(Rol, Operand::Zp(s1));
            } else {
                self.op(Lsr, Operand::Zp(s1));
                self.op(Ror, Operand::Zp(s0));
            }
            self.implied(Dex);
            self.op(Bne, Operand::Label(again));
            self.emit(Inst::Label(done));
            self.regs = Regs::default();
            self.op(Lda, Operand::Zp(s0));
            self.store_a_value(dst, 0)?;
            self.op(Lda, Operand::Zp(s1));
            self.regs.a = None;
            self.store_a_value(dst, 1)?;
        }
        Ok(())
    }

    /// `mul`/`div`/`mod` go to the runtime library: operands in the scratch
    /// cells, byte result in A, word result in A (low) / X (high).
    fn lower_helper_call(
        &mut self,
        op: BinOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(), CompileError> {
        let size = self.ty_size(dst);
        let scratch = self.platform.scratch_cells();
        for k in 0..size {
            self.load_a_value(lhs, k)?;
            self.op(Sta, Operand::Zp(scratch[k as usize]));
        }
        for k in 0..size {
            self.load_a_value(rhs, k)?;
            self.op(Sta, Operand::Zp(scratch[(size + k) as usize]));
        }
        let stem = match op {
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Mod => "mod",
            _ => unreachable!(),
        };
        let helper = id(format!("__{stem}{}", size * 8));
        self.shared.externs.insert(helper);
        self.op(Jsr, Operand::Label(helper));
        self.regs = Regs::default();
        self.regs.a = None;
        self.store_a_value(dst, 0)?;
        if size == 2 {
            self.store_x_value(dst, 1)?;
        }
        Ok(())
    }

    /// Write X into byte `k` of `v`'s home (STX lacks some addressing
    /// modes, so sp-relative homes go through A).
    fn store_x_value(&mut self, v: ValueId, k: u16) -> Result<(), CompileError> {
        let loc = self.value_loc(v)?;
        match loc {
            Loc::SpRel(_) => {
                self.implied(Txa);
                self.regs.a = self.regs.x;
                self.store_a_value(v, k)?;
            }
            _ => {
                let opnd = self.byte_operand(&loc, k)?;
                self.op(Stx, opnd);
            }
        }
        Ok(())
    }

    fn lower_unary(&mut self, op: UnOp, dst: ValueId, src: ValueId) -> Result<(), CompileError> {
        let size = self.ty_size(dst);
        match op {
            UnOp::Neg => {
                self.implied(Sec);
                for k in 0..size {
                    self.load_a_imm(0);
                    let opnd = self.mem_operand(src, k)?;
                    self.op(Sbc, opnd);
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
            }
            UnOp::Not => {
                for k in 0..size {
                    self.load_a_value(src, k)?;
                    self.op(Eor, Operand::Imm(0xFF));
                    self.regs.a = None;
                    self.store_a_value(dst, k)?;
                }
            }
        }
        Ok(())
    }

    fn lower_cmp(
        &mut self,
        op: CmpOp,
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
    ) -> Result<(), CompileError> {
        let size = self.ty_size(lhs);

        if size == 2 && matches!(op, CmpOp::Eq | CmpOp::Ne) {
            // Compare both bytes; the first mismatch decides.
            let flip = self.local_label();
            let join = self.local_label();
            self.load_a_value(lhs, 0)?;
            let r0 = self.mem_operand(rhs, 0)?;
            self.op(Cmp, r0);
            self.op(Bne, Operand::Label(flip));
            self.load_a_value(lhs, 1)?;
            let r1 = self.mem_operand(rhs, 1)?;
            self.op(Cmp, r1);
            self.op(Bne, Operand::Label(flip));
            self.op(Lda, Operand::Imm((op == CmpOp::Eq) as u8));
            self.op(Jmp, Operand::Label(join));
            self.emit(Inst::Label(flip));
            self.op(Lda, Operand::Imm((op == CmpOp::Ne) as u8));
            self.emit(Inst::Label(join));
            self.regs.a = None;
            self.store_a_value(dst, 0)?;
            return Ok(());
        }

        // Unsigned compare: carry ends up set when the register operand is
        // greater or equal.  `le`/`gt` swap operands instead of chaining
        // extra branches.
        let (a, b, branch) = match op {
            CmpOp::Eq => (lhs, rhs, Beq),
            CmpOp::Ne => (lhs, rhs, Bne),
            CmpOp::Lt => (lhs, rhs, Bcc),
            CmpOp::Ge => (lhs, rhs, Bcs),
            CmpOp::Le => (rhs, lhs, Bcs),
            CmpOp::Gt => (rhs, lhs, Bcc),
        };
        let t = self.local_label();
        let e = self.local_label();
        if size == 1 {
            self.load_a_value(a, 0)?;
            let opnd = self.mem_operand(b, 0)?;
            self.op(Cmp, opnd);
        } else {
            // 16-bit ordering: CMP low, SBC high; carry holds a >= b.
            self.load_a_value(a, 0)?;
            let b0 = self.mem_operand(b, 0)?;
            self.op(Cmp, b0);
            self.load_a_value(a, 1)?;
            let b1 = self.mem_operand(b, 1)?;
            self.op(Sbc, b1);
            self.regs.a = None;
        }
        self.op(branch, Operand::Label(t));
        self.op(Lda, Operand::Imm(0));
        self.op(Jmp, Operand::Label(e));
        self.emit(Inst::Label(t));
        self.op(Lda, Operand::Imm(1));
        self.emit(Inst::Label(e));
        self.regs.a = None;
        self.store_a_value(dst, 0)?;
        Ok(())
    }

    fn lower_cast(
        &mut self,
        kind: CastKind,
        dst: ValueId,
        src: ValueId,
    ) -> Result<(), CompileError> {
        match kind {
            CastKind::Zext => {
                self.load_a_value(src, 0)?;
                self.store_a_value(dst, 0)?;
                self.load_a_imm(0);
                self.store_a_value(dst, 1)?;
            }
            CastKind::Truncate | CastKind::BoolToByte => {
                self.load_a_value(src, 0)?;
                self.store_a_value(dst, 0)?;
            }
            CastKind::ByteToBool => {
                let z = self.local_label();
                self.load_a_value(src, 0)?;
                self.op(Beq, Operand::Label(z));
                self.op(Lda, Operand::Imm(1));
                self.emit(Inst::Label(z));
                self.regs.a = None;
                self.store_a_value(dst, 0)?;
            }
        }
        Ok(())
    }

    // ---- calls ----

    fn lower_call(
        &mut self,
        dst: Option<ValueId>,
        callee: Id,
        args: &[ValueId],
    ) -> Result<(), CompileError> {
        let callee_frame = self.frames.frame(callee).ok_or_else(|| {
            CompileError::internal(format!("{}: call to unframed {callee}", self.func.name))
        })?;

        if !callee_frame.recursive {
            let params: Vec<(Loc, u16)> = callee_frame
                .param_slots()
                .map(|s| self.slot_loc(s).map(|l| (l, s.size)))
                .collect::<Result<_, _>>()?;
            for (arg, (loc, size)) in args.iter().zip(params) {
                for k in 0..size {
                    self.load_a_value(*arg, k)?;
                    let opnd = self.byte_operand(&loc, k)?;
                    self.op(Sta, opnd);
                }
            }
            self.op(Jsr, Operand::Label(callee));
            self.regs = Regs::default();
            self.store_result(dst)?;
            return Ok(());
        }

        // Recursive callee: open its software frame around the JSR.
        let fsize = callee_frame.size;
        let param_offsets: Vec<(u16, u16)> = callee_frame
            .param_slots()
            .map(|s| match s.location {
                Some(Location::SpRelative(off)) => Ok((off, s.size)),
                _ => Err(CompileError::internal(format!(
                    "{}: recursive param slot not sp-relative",
                    callee
                ))),
            })
            .collect::<Result<_, _>>()?;
        let sp = self.sp_cell()?;

        self.adjust_sp(-(fsize as i32), sp)?;
        let saved_bias = self.sp_bias;
        self.sp_bias = saved_bias + fsize;
        for (arg, (off, size)) in args.iter().zip(param_offsets) {
            for k in 0..size {
                self.load_a_value(*arg, k)?;
                let y = off + k;
                if y > 0xFF {
                    return Err(CompileError::internal(format!(
                        "{callee}: software frame exceeds one page"
                    )));
                }
                self.load_y_imm(y as u8);
                self.op(Sta, Operand::IndY(sp));
            }
        }
        self.op(Jsr, Operand::Label(callee));
        self.regs = Regs::default();
        // The result lands before the stack pointer comes back up; the
        // caller's own sp-relative homes are still displaced.
        self.store_result(dst)?;
        self.sp_bias = saved_bias;
        self.adjust_sp(fsize as i32, sp)?;
        Ok(())
    }

    fn lower_call_indirect(
        &mut self,
        dst: Option<ValueId>,
        target: ValueId,
        sig: &Signature,
        args: &[ValueId],
    ) -> Result<(), CompileError> {
        // Every address-taken function of matching signature might be the
        // one; arguments go to all of them.
        let targets: Vec<Id> = self
            .graph
            .address_taken
            .iter()
            .copied()
            .filter(|t| {
                self.il.function(*t).map(|f| {
                    f.params.iter().map(|(_, ty)| ty.clone()).collect::<Vec<_>>() == sig.params
                        && f.ret == sig.ret
                }) == Some(true)
            })
            .collect();

        let mut max_recursive: u16 = 0;
        let mut recursive_params: Option<Vec<(u16, u16)>> = None;
        for t in &targets {
            let frame = self.frames.frame(*t).ok_or_else(|| {
                CompileError::internal(format!("{}: unframed indirect target {t}", self.func.name))
            })?;
            if frame.recursive {
                max_recursive = max_recursive.max(frame.size);
                if recursive_params.is_none() {
                    recursive_params = Some(
                        frame
                            .param_slots()
                            .map(|s| match s.location {
                                Some(Location::SpRelative(off)) => Ok((off, s.size)),
                                _ => Err(CompileError::internal(format!(
                                    "{t}: recursive param slot not sp-relative"
                                ))),
                            })
                            .collect::<Result<_, _>>()?,
                    );
                }
            } else {
                let params: Vec<(Loc, u16)> = frame
                    .param_slots()
                    .map(|s| self.slot_loc(s).map(|l| (l, s.size)))
                    .collect::<Result<_, _>>()?;
                for (arg, (loc, size)) in args.iter().zip(params) {
                    for k in 0..size {
                        self.load_a_value(*arg, k)?;
                        let opnd = self.byte_operand(&loc, k)?;
                        self.op(Sta, opnd);
                    }
                }
            }
        }

        let saved_bias = self.sp_bias;
        if max_recursive > 0 {
            let sp = self.sp_cell()?;
            self.adjust_sp(-(max_recursive as i32), sp)?;
            self.sp_bias = saved_bias + max_recursive;
            if let Some(params) = recursive_params.clone() {
                for (arg, (off, size)) in args.iter().zip(params) {
                    for k in 0..size {
                        self.load_a_value(*arg, k)?;
                        let y = off + k;
                        if y > 0xFF {
                            return Err(CompileError::internal(format!(
                                "{}: software frame exceeds one page",
                                self.func.name
                            )));
                        }
                        self.load_y_imm(y as u8);
                        self.op(Sta, Operand::IndY(sp));
                    }
                }
            }
        }

        // Target address into the scratch pointer, then through the shim.
        let [s0, s1, ..] = self.platform.scratch_cells();
        self.load_a_value(target, 0)?;
        self.op(Sta, Operand::Zp(s0));
        self.load_a_value(target, 1)?;
        self.op(Sta, Operand::Zp(s1));
        self.shared.jmpto = true;
        self.op(Jsr, Operand::Label(id("__jmpto")));
        self.regs = Regs::default();
        self.store_result(dst)?;
        if max_recursive > 0 {
            let sp = self.sp_cell()?;
            self.sp_bias = saved_bias;
            self.adjust_sp(max_recursive as i32, sp)?;
        }
        Ok(())
    }

    fn store_result(&mut self, dst: Option<ValueId>) -> Result<(), CompileError> {
        let Some(dst) = dst else { return Ok(()) };
        self.regs.a = None;
        self.store_a_value(dst, 0)?;
        if self.ty_size(dst) == 2 {
            self.store_x_value(dst, 1)?;
        }
        Ok(())
    }

    fn adjust_sp(&mut self, delta: i32, sp: u8) -> Result<(), CompileError> {
        let mag = delta.unsigned_abs() as u16;
        if delta < 0 {
            self.implied(Sec);
            self.op(Lda, Operand::Zp(sp));
            self.op(Sbc, Operand::Imm(mag as u8));
            self.op(Sta, Operand::Zp(sp));
            self.op(Lda, Operand::Zp(sp + 1));
            self.op(Sbc, Operand::Imm((mag >> 8) as u8));
            self.op(Sta, Operand::Zp(sp + 1));
        } else {
            self.implied(Clc);
            self.op(Lda, Operand::Zp(sp));
            self.op(Adc, Operand::Imm(mag as u8));
            self.op(Sta, Operand::Zp(sp));
            self.op(Lda, Operand::Zp(sp + 1));
            self.op(Adc, Operand::Imm((mag >> 8) as u8));
            self.op(Sta, Operand::Zp(sp + 1));
        }
        self.regs.a = None;
        Ok(())
    }

    // ---- terminators and PHI copies ----

    fn lower_term(&mut self, bid: BlockId, term: &Terminator) -> Result<(), CompileError> {
        match term {
            Terminator::Jump(b) => {
                self.phi_copies(bid, *b)?;
                let label = self.block_label(*b);
                self.op(Jmp, Operand::Label(label));
                Ok(())
            }
            Terminator::Branch { guard, tt, ff } => {
                let tt_phis = !self.func.block(*tt).phis.is_empty();
                let ff_phis = !self.func.block(*ff).phis.is_empty();
                if tt_phis && ff_phis {
                    return Err(CompileError::internal(format!(
                        "{}: conditional edge with PHIs on both sides",
                        self.func.name
                    )));
                }
                if tt_phis {
                    self.phi_copies(bid, *tt)?;
                } else if ff_phis {
                    self.phi_copies(bid, *ff)?;
                }
                let loaded = self.load_a_value(*guard, 0)?;
                if !loaded {
                    // A already holds the guard but the flags may not
                    // reflect it.
                    self.op(Cmp, Operand::Imm(0));
                }
                let tt_label = self.block_label(*tt);
                let ff_label = self.block_label(*ff);
                self.op(Bne, Operand::Label(tt_label));
                self.op(Jmp, Operand::Label(ff_label));
                Ok(())
            }
            Terminator::Return(value) => {
                if self.func.isr {
                    if value.is_some() {
                        return Err(CompileError::internal(format!(
                            "{}: interrupt handlers cannot return values",
                            self.func.name
                        )));
                    }
                    self.implied(Pla);
                    self.implied(Tay);
                    self.implied(Pla);
                    self.implied(Tax);
                    self.implied(Pla);
                    self.implied(Rti);
                    return Ok(());
                }
                if let Some(v) = value {
                    if self.ty_size(*v) == 2 {
                        self.load_a_value(*v, 1)?;
                        self.implied(Tax);
                        self.regs.x = self.regs.a;
                    }
                    self.load_a_value(*v, 0)?;
                }
                self.implied(Rts);
                Ok(())
            }
        }
    }

    /// Copy this predecessor's incoming values into the successor's PHI
    /// homes, as a parallel copy.
    fn phi_copies(&mut self, pred: BlockId, succ: BlockId) -> Result<(), CompileError> {
        let mut copies: Vec<(Loc, Loc, u16)> = Vec::new();
        for phi in &self.func.block(succ).phis {
            let (_, incoming) = phi
                .incoming
                .iter()
                .find(|(p, _)| *p == pred)
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "{}: PHI {} lacks an incoming for {pred}",
                        self.func.name, phi.dst
                    ))
                })?;
            let src = self.value_loc(*incoming)?;
            let dst = self.value_loc(phi.dst)?;
            if src != dst {
                copies.push((src, dst, phi.ty.size_bytes()));
            }
        }

        while !copies.is_empty() {
            let free = copies.iter().position(|(_, dst, dsz)| {
                !copies
                    .iter()
                    .any(|(osrc, odst, osz)| odst != dst && locs_overlap(dst, *dsz, osrc, *osz))
            });
            match free {
                Some(i) => {
                    let (src, dst, size) = copies.remove(i);
                    self.emit_move(&src, &dst, size)?;
                }
                None => {
                    // A copy cycle (e.g. two PHIs swapping); break it
                    // through the scratch cells.
                    let (src, dst, size) = copies.remove(0);
                    let scratch = Loc::Zp(self.platform.scratch_cells()[0]);
                    self.emit_move(&src, &scratch, size)?;
                    for c in &mut copies {
                        if c.0 == src {
                            c.0 = scratch.clone();
                        }
                    }
                    copies.push((scratch, dst, size));
                }
            }
        }
        Ok(())
    }

    fn emit_move(&mut self, src: &Loc, dst: &Loc, size: u16) -> Result<(), CompileError> {
        for k in 0..size {
            let s = self.byte_operand(src, k)?;
            self.op(Lda, s);
            let d = self.byte_operand(dst, k)?;
            self.op(Sta, d);
            self.regs.a = None;
        }
        Ok(())
    }
}

/// Access direction for the shared map/memory paths.
#[derive(Clone, Copy)]
enum MapDir {
    Load(ValueId),
    Store(ValueId),
}

fn abs_or_zp(addr: u16) -> Operand {
    if addr < 0x100 {
        Operand::Zp(addr as u8)
    } else {
        Operand::Abs(Addr::Num(addr))
    }
}

/// Do two located byte ranges share any byte?  Used by the parallel-copy
/// scheduler; distinct address spaces never overlap.
fn locs_overlap(a: &Loc, asz: u16, b: &Loc, bsz: u16) -> bool {
    let (astart, bstart) = match (a, b) {
        (Loc::Zp(x), Loc::Zp(y)) => (*x as u32, *y as u32),
        (Loc::Abs(x), Loc::Abs(y)) => (*x as u32, *y as u32),
        (Loc::SpRel(x), Loc::SpRel(y)) => (*x as u32, *y as u32),
        (Loc::Sym(sx, ox), Loc::Sym(sy, oy)) if sx == sy => (*ox as u32, *oy as u32),
        _ => return false,
    };
    astart < bstart + bsz as u32 && bstart < astart + asz as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SourceLoc;
    use crate::front::ast::{
        self, Expr, LValue, MapDecl, MapLayout, Param, Stmt,
    };
    use crate::middle::lower as ir_lower;
    use crate::middle::{callgraph, frame, zeropage};

    fn func(name: &str, params: Vec<(&str, Ty)>, ret: Option<Ty>, body: Vec<Stmt>) -> ast::FuncDecl {
        ast::FuncDecl {
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

    fn compile(maps: Vec<MapDecl>, funcs: Vec<ast::FuncDecl>) -> asm::Module {
        let ast = ast::Module {
            name: id("test"),
            globals: vec![],
            maps,
            functions: funcs,
        };
        let platform = Platform::c64();
        let il = ir_lower::lower(&ast).unwrap();
        il.validate().unwrap();
        let (graph, _) = callgraph::analyze(&il, &platform).unwrap();
        let (mut frames, _) = frame::allocate(&il, &graph, &platform).unwrap();
        let (zp, _) = zeropage::allocate(&il, &graph, &mut frames, &platform).unwrap();
        lower(&il, &graph, &frames, &zp, &platform).unwrap()
    }

    fn function<'m>(m: &'m asm::Module, name: &str) -> &'m asm::Function {
        m.functions.iter().find(|f| f.name == id(name)).unwrap()
    }

    fn ops(block: &asm::Block) -> Vec<(Mnemonic, Operand)> {
        block
            .insts
            .iter()
            .filter_map(|i| match i {
                Inst::Op { mn, operand, .. } => Some((*mn, operand.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_function_is_a_bare_rts() {
        let m = compile(vec![], vec![func("nop", vec![], None, vec![])]);
        let f = function(&m, "nop");
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(ops(&f.blocks[0]), vec![(Rts, Operand::Implied)]);
    }

    #[test]
    fn simple_map_store_is_one_direct_sta() {
        // border = 5, with @map border at $D020
        let maps = vec![MapDecl {
            name: id("border"),
            layout: MapLayout::Simple {
                addr: 0xD020,
                ty: Ty::U8,
            },
            loc: SourceLoc::synthetic(),
        }];
        let body = vec![
            Stmt::Assign {
                target: LValue::Map(id("border"), SourceLoc::synthetic()),
                value: Expr::byte(5),
            },
            Stmt::Return(None),
        ];
        let m = compile(maps, vec![func("main", vec![], None, body)]);
        let f = function(&m, "main");
        let all = ops(&f.blocks[0]);
        // The hardware store is a single absolute STA, no indirection and
        // no call anywhere near it.
        assert!(all.contains(&(Lda, Operand::Imm(5))));
        assert!(all.contains(&(Sta, Operand::Abs(Addr::Num(0xD020)))));
        assert!(all.iter().all(|(mn, op)| {
            *mn != Jsr && !matches!(op, Operand::IndY(_))
        }));
        // And it is flagged volatile for the cleanup pass.
        assert!(f.blocks[0].insts.iter().any(|i| matches!(
            i,
            Inst::Op {
                mn: Sta,
                operand: Operand::Abs(Addr::Num(0xD020)),
                volatile: true
            }
        )));
    }

    #[test]
    fn if_else_merge_reads_the_shared_home() {
        // if (c) x = 10 else x = 20; return x: both arms store straight
        // into the PHI's home (the variable's slot), so the merge block is
        // just a load and the return.
        let body = vec![
            Stmt::local(id("x"), Ty::U8, Expr::byte(0)),
            Stmt::If {
                cond: Expr::var(id("c"), Ty::I1),
                then_body: vec![Stmt::assign_var(id("x"), Expr::byte(10))],
                else_body: vec![Stmt::assign_var(id("x"), Expr::byte(20))],
            },
            Stmt::Return(Some(Expr::var(id("x"), Ty::U8))),
        ];
        let m = compile(
            vec![],
            vec![func("pick", vec![("c", Ty::I1)], Some(Ty::U8), body)],
        );
        let f = function(&m, "pick");

        let then_block = f
            .blocks
            .iter()
            .find(|b| ops(b).contains(&(Lda, Operand::Imm(10))))
            .expect("then arm");
        let then_ops = ops(then_block);
        // LDA #10, a store to x's home, and the jump to the merge; no stub
        // zero loads.
        assert!(then_ops.iter().any(|(mn, op)| *mn == Sta
            && matches!(op, Operand::Abs(Addr::Num(_)))));
        assert_eq!(then_ops.last().unwrap().0, Jmp);
        assert!(!then_ops.contains(&(Lda, Operand::Imm(0))));

        // The merge block loads the merged value and returns it in A.
        let merge = f.blocks.last().unwrap();
        let merge_ops = ops(merge);
        assert!(matches!(
            merge_ops.as_slice(),
            [(Lda, Operand::Abs(_)), (Rts, Operand::Implied)]
        ));
    }

    #[test]
    fn arguments_land_in_the_callee_slots_before_jsr() {
        let body = vec![
            Stmt::Expr(Expr::call(id("poke_border"), vec![Expr::byte(7)], Ty::U8)),
            Stmt::Return(None),
        ];
        let callee_body = vec![Stmt::Return(None)];
        let m = compile(
            vec![],
            vec![
                func("main", vec![], None, body),
                func("poke_border", vec![("v", Ty::U8)], None, callee_body),
            ],
        );
        let f = function(&m, "main");
        let all = ops(&f.blocks[0]);
        let jsr_at = all
            .iter()
            .position(|(mn, op)| *mn == Jsr && *op == Operand::Label(id("poke_border")))
            .expect("JSR to the callee");
        // Some STA to an absolute frame address happens before the JSR.
        assert!(all[..jsr_at]
            .iter()
            .any(|(mn, op)| *mn == Sta && matches!(op, Operand::Abs(Addr::Num(_)))));
    }

    #[test]
    fn byte_results_return_in_a() {
        let body = vec![Stmt::Return(Some(Expr::var(id("v"), Ty::U8)))];
        let m = compile(
            vec![],
            vec![func("echo", vec![("v", Ty::U8)], Some(Ty::U8), body)],
        );
        let f = function(&m, "echo");
        let all = ops(&f.blocks[0]);
        // The last two steps are a load of the value and RTS.
        assert_eq!(all.last().unwrap().0, Rts);
        assert!(all.iter().any(|(mn, _)| *mn == Lda));
    }

    #[test]
    fn recursive_calls_adjust_the_software_stack() {
        let fact = ast::FuncDecl {
            name: id("fact"),
            params: vec![Param {
                name: id("n"),
                ty: Ty::U8,
            }],
            ret: Some(Ty::U8),
            recursive: true,
            isr: false,
            body: vec![Stmt::If {
                cond: Expr::compare(CmpOp::Eq, Expr::var(id("n"), Ty::U8), Expr::byte(0)),
                then_body: vec![Stmt::Return(Some(Expr::byte(1)))],
                else_body: vec![Stmt::Return(Some(Expr::binary(
                    BinOp::Mul,
                    Expr::var(id("n"), Ty::U8),
                    Expr::call(
                        id("fact"),
                        vec![Expr::binary(
                            BinOp::Sub,
                            Expr::var(id("n"), Ty::U8),
                            Expr::byte(1),
                        )],
                        Ty::U8,
                    ),
                )))],
            }],
            loc: SourceLoc::synthetic(),
        };
        let main = func(
            "main",
            vec![],
            None,
            vec![
                Stmt::Expr(Expr::call(id("fact"), vec![Expr::byte(5)], Ty::U8)),
                Stmt::Return(None),
            ],
        );
        let m = compile(vec![], vec![main, fact]);

        // The call site drops the stack pointer (SEC/SBC on the sp cell),
        // stores the argument through (sp),Y, and restores it after.
        let f = function(&m, "main");
        let all: Vec<(Mnemonic, Operand)> = f.blocks.iter().flat_map(|b| ops(b)).collect();
        let sbc_at = all
            .iter()
            .position(|(mn, op)| *mn == Sbc && matches!(op, Operand::Imm(_)))
            .expect("stack pointer decrement");
        let jsr_at = all
            .iter()
            .position(|(mn, op)| *mn == Jsr && *op == Operand::Label(id("fact")))
            .expect("JSR fact");
        let adc_at = all
            .iter()
            .position(|(mn, op)| *mn == Adc && matches!(op, Operand::Imm(_)))
            .expect("stack pointer increment");
        assert!(sbc_at < jsr_at && jsr_at < adc_at);
        assert!(all[..jsr_at]
            .iter()
            .any(|(mn, op)| *mn == Sta && matches!(op, Operand::IndY(_))));

        // The multiply goes to the runtime helper.
        assert!(m.symbols.get(&id("__mul8")) == Some(&Symbol::Extern));
    }

    #[test]
    fn indirect_calls_go_through_the_shim() {
        let sig = Signature {
            params: vec![],
            ret: None,
        };
        let body = vec![
            Stmt::local(id("p"), Ty::Ptr, Expr::addr_of(id("task"))),
            Stmt::Expr(Expr::call_indirect(
                Expr::var(id("p"), Ty::Ptr),
                sig,
                vec![],
            )),
            Stmt::Return(None),
        ];
        let m = compile(
            vec![],
            vec![
                func("main", vec![], None, body),
                func("task", vec![], None, vec![Stmt::Return(None)]),
            ],
        );
        let f = function(&m, "main");
        let all = ops(&f.blocks[0]);
        let platform = Platform::c64();
        let s0 = platform.scratch_cells()[0];
        assert!(all.contains(&(Sta, Operand::Zp(s0))));
        assert!(all.contains(&(Jsr, Operand::Label(id("__jmpto")))));
        // The shim itself is an indirect JMP through the scratch pointer.
        let shim = function(&m, "__jmpto");
        assert_eq!(
            ops(&shim.blocks[0]),
            vec![(Jmp, Operand::Ind(Addr::Num(s0 as u16)))]
        );
    }

    #[test]
    fn interrupt_handlers_save_registers_and_rti() {
        let mut isr = func("handler", vec![], None, vec![Stmt::Return(None)]);
        isr.isr = true;
        let m = compile(vec![], vec![func("main", vec![], None, vec![]), isr]);
        let f = function(&m, "handler");
        let all = ops(&f.blocks[0]);
        assert_eq!(all[0].0, Pha);
        assert_eq!(all.last().unwrap().0, Rti);
        assert!(all.iter().filter(|(mn, _)| *mn == Pha).count() == 3);
        assert!(all.iter().filter(|(mn, _)| *mn == Pla).count() == 3);
    }

    #[test]
    fn word_addition_carries_into_the_high_byte() {
        let body = vec![
            Stmt::local(id("a"), Ty::U16, Expr::word(0x1234)),
            Stmt::local(id("b"), Ty::U16, Expr::word(0x0101)),
            Stmt::Return(Some(Expr::binary(
                BinOp::Add,
                Expr::var(id("a"), Ty::U16),
                Expr::var(id("b"), Ty::U16),
            ))),
        ];
        let m = compile(vec![], vec![func("sum", vec![], Some(Ty::U16), body)]);
        let f = function(&m, "sum");
        let all = ops(&f.blocks[0]);
        // One CLC, two ADCs (low then high), and the word return loads
        // X (high) before A (low).
        assert_eq!(all.iter().filter(|(mn, _)| *mn == Clc).count(), 1);
        assert_eq!(all.iter().filter(|(mn, _)| *mn == Adc).count(), 2);
        assert!(all.iter().any(|(mn, _)| *mn == Tax));
    }

    #[test]
    fn lowering_is_deterministic() {
        let build = || {
            let m = compile(
                vec![],
                vec![func(
                    "main",
                    vec![],
                    None,
                    vec![
                        Stmt::local(id("x"), Ty::U8, Expr::byte(3)),
                        Stmt::Return(None),
                    ],
                )],
            );
            m.to_string()
        };
        assert_eq!(build(), build());
    }
}
