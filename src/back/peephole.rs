//! Peephole cleanup and dead-store elimination on ASM-IL.
//!
//! The write-through lowering deliberately over-stores; this pass takes the
//! redundancy back out:
//!
//! - loads of a value the accumulator is already known to hold
//!   (`STA x ; LDA x`, repeated `LDA #imm`),
//! - stores that write a byte back to the cell it was just read from,
//! - `CLC`/`SEC` when the carry is already in the wanted state,
//! - stores to cells that are never read again (cross-block liveness).
//!
//! Volatile instructions (every `@map`, `peek`/`poke` and computed-address
//! access) are never removed, never forwarded across, and treated as
//! clobbering all tracked state.  A VIC register is not RAM.
//!
//! The pass is idempotent: dropped instructions were exact no-ops, so the
//! tracked state after a drop equals the state with the instruction kept,
//! and a second run finds nothing new.

use log::debug;

use crate::back::asm::{Addr, Block, Function, Inst, Mnemonic, Module, Operand};
use crate::common::{Id, Map, Set};

/// Run the cleanup over a whole module.
pub fn optimize(mut module: Module) -> Module {
    for func in &mut module.functions {
        for block in &mut func.blocks {
            forward_block(block);
        }
        eliminate_dead_stores(func);
    }
    module
}

/// An addressable byte cell the pass can reason about.  Indexed and
/// indirect operands touch unpredictable cells and are handled as
/// wildcards.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Cell {
    Zp(u8),
    Abs(u16),
    Sym(Id, u16),
}

fn cell_of(operand: &Operand) -> Option<Cell> {
    match operand {
        Operand::Zp(a) => Some(Cell::Zp(*a)),
        Operand::Abs(Addr::Num(a)) => Some(Cell::Abs(*a)),
        Operand::Abs(Addr::Sym(s)) => Some(Cell::Sym(*s, 0)),
        Operand::Abs(Addr::SymOff(s, o)) => Some(Cell::Sym(*s, *o)),
        _ => None,
    }
}

fn touches_memory(operand: &Operand) -> bool {
    matches!(
        operand,
        Operand::Zp(_)
            | Operand::ZpX(_)
            | Operand::ZpY(_)
            | Operand::Abs(_)
            | Operand::AbsX(_)
            | Operand::AbsY(_)
            | Operand::IndY(_)
            | Operand::Ind(_)
    )
}

/// What the accumulator is known to hold.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AVal {
    Unknown,
    Imm(u8),
}

fn sets_nz(mn: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        mn,
        Lda | Ldx | Ldy | Adc | Sbc | And | Ora | Eor | Cmp | Cpx | Cpy | Asl | Lsr
            | Rol | Ror | Inc | Dec | Inx | Iny | Dex | Dey | Tax | Tay | Txa | Tya
            | Pla | Bit
    )
}

fn clobbers_carry(mn: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(mn, Adc | Sbc | Cmp | Cpx | Cpy | Asl | Lsr | Rol | Ror | Pla)
}

fn writes_a(mn: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(mn, Lda | Adc | Sbc | And | Ora | Eor | Txa | Tya | Pla)
}

/// Would dropping a flag-setting instruction at `pos` change a later
/// branch?  Scans forward until something re-establishes N/Z or control
/// leaves the straight line.
fn nz_flags_consumed(insts: &[Inst], pos: usize) -> bool {
    use Mnemonic::*;
    for inst in &insts[pos + 1..] {
        match inst {
            Inst::Comment(_) => continue,
            // A join point; someone may branch in expecting fresh flags.
            Inst::Label(_) => return true,
            Inst::Op { mn, .. } => {
                if matches!(mn, Beq | Bne | Bmi | Bpl) {
                    return true;
                }
                if sets_nz(*mn) {
                    return false;
                }
                if matches!(mn, Jmp | Jsr | Rts | Rti) {
                    return false;
                }
            }
        }
    }
    false
}

/// Forwarding within one block: drop loads of known accumulator contents,
/// stores of a byte back into its own cell, and settled CLC/SEC.
fn forward_block(block: &mut Block) {
    use Mnemonic::*;

    let insts = std::mem::take(&mut block.insts);
    let mut out: Vec<Inst> = Vec::with_capacity(insts.len());
    let mut a = AVal::Unknown;
    // Cells currently known to hold a copy of A.
    let mut mirrors: Set<Cell> = Set::new();
    let mut carry: Option<bool> = None;

    for (i, inst) in insts.iter().enumerate() {
        match inst {
            Inst::Comment(_) => {
                out.push(inst.clone());
                continue;
            }
            Inst::Label(_) => {
                // Control can arrive from elsewhere; forget everything.
                a = AVal::Unknown;
                mirrors.clear();
                carry = None;
                out.push(inst.clone());
                continue;
            }
            Inst::Op {
                mn,
                operand,
                volatile,
            } => {
                let mn = *mn;
                if *volatile {
                    // Hardware access: keep it, trust nothing afterwards.
                    if writes_a(mn) {
                        a = AVal::Unknown;
                    }
                    mirrors.clear();
                    if clobbers_carry(mn) {
                        carry = None;
                    }
                    out.push(inst.clone());
                    continue;
                }
                match mn {
                    Lda => {
                        let redundant = match operand {
                            Operand::Imm(v) => a == AVal::Imm(*v),
                            _ => cell_of(operand)
                                .map(|c| mirrors.contains(&c))
                                .unwrap_or(false),
                        };
                        if redundant && !nz_flags_consumed(&insts, i) {
                            continue;
                        }
                        match operand {
                            Operand::Imm(v) => {
                                a = AVal::Imm(*v);
                                mirrors.clear();
                            }
                            _ => {
                                a = AVal::Unknown;
                                mirrors.clear();
                                if let Some(c) = cell_of(operand) {
                                    mirrors.insert(c);
                                }
                            }
                        }
                        out.push(inst.clone());
                    }
                    Sta => {
                        match cell_of(operand) {
                            Some(c) => {
                                if mirrors.contains(&c) {
                                    // The cell already holds A.
                                    continue;
                                }
                                mirrors.insert(c);
                            }
                            None => {
                                // Indexed store to an unknown cell; any
                                // mirror may have been overwritten.
                                mirrors.clear();
                            }
                        }
                        out.push(inst.clone());
                    }
                    Clc => {
                        if carry == Some(false) {
                            continue;
                        }
                        carry = Some(false);
                        out.push(inst.clone());
                    }
                    Sec => {
                        if carry == Some(true) {
                            continue;
                        }
                        carry = Some(true);
                        out.push(inst.clone());
                    }
                    Jsr => {
                        a = AVal::Unknown;
                        mirrors.clear();
                        carry = None;
                        out.push(inst.clone());
                    }
                    _ => {
                        if writes_a(mn) {
                            a = AVal::Unknown;
                            mirrors.clear();
                        }
                        if mn.writes_memory() {
                            match cell_of(operand) {
                                Some(c) => {
                                    mirrors.remove(&c);
                                }
                                None => mirrors.clear(),
                            }
                        }
                        if clobbers_carry(mn) {
                            carry = None;
                        }
                        out.push(inst.clone());
                    }
                }
            }
        }
    }
    block.insts = out;
}

/// Liveness over cells; `all` is the wildcard for indexed and indirect
/// reads, `syms`/`zps` keep the data section and the zero page alive past
/// function exit (globals outlive us, and so do the stack pointer and
/// other functions' zero-page residents).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
struct Live {
    all: bool,
    syms: bool,
    zps: bool,
    cells: Set<Cell>,
}

impl Live {
    fn exit() -> Live {
        Live {
            all: false,
            syms: true,
            zps: true,
            cells: Set::new(),
        }
    }

    fn contains(&self, c: &Cell) -> bool {
        self.all
            || (self.syms && matches!(c, Cell::Sym(..)))
            || (self.zps && matches!(c, Cell::Zp(_)))
            || self.cells.contains(c)
    }

    fn union(&mut self, other: &Live) {
        self.all |= other.all;
        self.syms |= other.syms;
        self.zps |= other.zps;
        for c in &other.cells {
            self.cells.insert(*c);
        }
    }
}

/// One backward step over an instruction.  When `remove` is set, dead
/// plain stores are dropped and the return value says whether to keep the
/// instruction.
fn live_step(inst: &Inst, live: &mut Live) -> bool {
    use Mnemonic::*;
    let Inst::Op {
        mn,
        operand,
        volatile,
    } = inst
    else {
        return true;
    };
    let mn = *mn;

    if mn == Jsr {
        // The callee reads its argument slots and whatever else it likes.
        live.all = true;
        return true;
    }
    if *volatile {
        // Hardware accesses stay, and an indirect one may read anything.
        if mn.reads_memory() && touches_memory(operand) {
            match cell_of(operand) {
                Some(c) => {
                    live.cells.insert(c);
                }
                None => live.all = true,
            }
        }
        return true;
    }

    let is_plain_store = matches!(mn, Sta | Stx | Sty);
    if is_plain_store {
        match cell_of(operand) {
            Some(c) => {
                if !live.contains(&c) {
                    return false; // dead store
                }
                live.cells.remove(&c);
                return true;
            }
            None => {
                // Unknown target; cannot prove anything dead.
                return true;
            }
        }
    }

    if mn.reads_memory() && touches_memory(operand) {
        match cell_of(operand) {
            Some(c) => {
                live.cells.insert(c);
            }
            None => live.all = true,
        }
    }
    true
}

fn eliminate_dead_stores(func: &mut Function) {
    // Successor edges: every label a block's branches and jumps mention
    // that names another block of this function.
    let block_index: Map<Id, usize> = func
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.label, i))
        .collect();
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|b| {
            let mut out = Vec::new();
            for inst in &b.insts {
                if let Inst::Op {
                    mn,
                    operand: Operand::Label(l),
                    ..
                } = inst
                {
                    if (mn.is_branch() || *mn == Mnemonic::Jmp) && block_index.contains_key(l)
                    {
                        out.push(block_index[l]);
                    }
                }
            }
            out
        })
        .collect();

    // Backward fixpoint on block live-in sets.
    let n = func.blocks.len();
    let mut live_in: Vec<Live> = vec![Live::default(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..n).rev() {
            let mut live = block_live_out(b, &successors, &live_in);
            for inst in func.blocks[b].insts.iter().rev() {
                live_step(inst, &mut live);
            }
            if live != live_in[b] {
                live_in[b] = live;
                changed = true;
            }
        }
    }

    // Removal pass with the converged live-outs.
    let mut removed = 0usize;
    for b in 0..n {
        let mut live = block_live_out(b, &successors, &live_in);
        let insts = std::mem::take(&mut func.blocks[b].insts);
        let mut kept: Vec<Inst> = Vec::with_capacity(insts.len());
        for inst in insts.into_iter().rev() {
            if live_step(&inst, &mut live) {
                kept.push(inst);
            } else {
                removed += 1;
            }
        }
        kept.reverse();
        func.blocks[b].insts = kept;
    }
    if removed > 0 {
        debug!("{}: removed {removed} dead stores", func.name);
    }
}

fn block_live_out(b: usize, successors: &[Vec<usize>], live_in: &[Live]) -> Live {
    let succs = &successors[b];
    if succs.is_empty() {
        return Live::exit();
    }
    let mut live = Live::default();
    for s in succs {
        live.union(&live_in[*s]);
    }
    live
}
