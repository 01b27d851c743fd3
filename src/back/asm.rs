//! The 6502 abstract assembly (ASM-IL).
//!
//! This is the penultimate representation: real 6502 mnemonics with
//! symbolic operands.  Labels are unresolved (the external emitter turns
//! them into addresses), but addressing modes are already decided: a
//! zero-page operand is distinct from an absolute one so the emitter never
//! has to guess.
//!
//! # Design decisions
//!
//! - Blocks keep their IL structure: one [Block] per IL basic block, with a
//!   mangled `function_label` name.  The first block of a function carries
//!   the function's own name so `JSR name` lands on it.
//! - Comparison lowering needs branches *within* a block; those use
//!   [Inst::Label] pseudo-entries rather than extra blocks, mirroring how
//!   hand-written 6502 code uses local labels.
//! - Accesses to `@map` addresses, `peek`/`poke` and computed-address loads
//!   and stores are flagged volatile.  The peephole pass must neither elide
//!   nor forward across them; a VIC register read is not a RAM read.
//! - The data section carries initialized byte runs and uninitialized
//!   reserves; the symbol table distinguishes functions, data labels,
//!   zero-page residents, frame addresses and externs (runtime helpers),
//!   so the emitter can pick addressing modes and emit imports.

use std::fmt::{self, Display};

use crate::common::{Id, Map};

/// 6502 mnemonics used by the lowering.
#[derive(Clone, Copy, PartialEq, Eq, Debug, derive_more::Display)]
#[allow(missing_docs)]
pub enum Mnemonic {
    #[display("LDA")]
    Lda,
    #[display("LDX")]
    Ldx,
    #[display("LDY")]
    Ldy,
    #[display("STA")]
    Sta,
    #[display("STX")]
    Stx,
    #[display("STY")]
    Sty,
    #[display("TAX")]
    Tax,
    #[display("TAY")]
    Tay,
    #[display("TXA")]
    Txa,
    #[display("TYA")]
    Tya,
    #[display("ADC")]
    Adc,
    #[display("SBC")]
    Sbc,
    #[display("AND")]
    And,
    #[display("ORA")]
    Ora,
    #[display("EOR")]
    Eor,
    #[display("CMP")]
    Cmp,
    #[display("CPX")]
    Cpx,
    #[display("CPY")]
    Cpy,
    #[display("ASL")]
    Asl,
    #[display("LSR")]
    Lsr,
    #[display("ROL")]
    Rol,
    #[display("ROR")]
    Ror,
    #[display("INC")]
    Inc,
    #[display("DEC")]
    Dec,
    #[display("INX")]
    Inx,
    #[display("INY")]
    Iny,
    #[display("DEX")]
    Dex,
    #[display("DEY")]
    Dey,
    #[display("CLC")]
    Clc,
    #[display("SEC")]
    Sec,
    #[display("PHA")]
    Pha,
    #[display("PLA")]
    Pla,
    #[display("JMP")]
    Jmp,
    #[display("JSR")]
    Jsr,
    #[display("RTS")]
    Rts,
    #[display("RTI")]
    Rti,
    #[display("BEQ")]
    Beq,
    #[display("BNE")]
    Bne,
    #[display("BCC")]
    Bcc,
    #[display("BCS")]
    Bcs,
    #[display("BMI")]
    Bmi,
    #[display("BPL")]
    Bpl,
    #[display("BIT")]
    Bit,
    #[display("NOP")]
    Nop,
}

impl Mnemonic {
    /// Does the instruction read the memory its operand names?
    pub fn reads_memory(self) -> bool {
        use Mnemonic::*;
        matches!(
            self,
            Lda | Ldx | Ldy | Adc | Sbc | And | Ora | Eor | Cmp | Cpx | Cpy | Bit
                | Asl | Lsr | Rol | Ror | Inc | Dec
        )
    }

    /// Does the instruction write the memory its operand names?
    pub fn writes_memory(self) -> bool {
        use Mnemonic::*;
        matches!(self, Sta | Stx | Sty | Asl | Lsr | Rol | Ror | Inc | Dec)
    }

    pub fn is_branch(self) -> bool {
        use Mnemonic::*;
        matches!(self, Beq | Bne | Bcc | Bcs | Bmi | Bpl)
    }
}

/// A symbolic or numeric address.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Addr {
    Num(u16),
    Sym(Id),
    /// A symbol plus a byte offset (the high half of a word, a struct
    /// field).
    SymOff(Id, u16),
}

impl Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Num(a) => write!(f, "${a:04X}"),
            Addr::Sym(s) => write!(f, "{s}"),
            Addr::SymOff(s, o) => write!(f, "{s}+{o}"),
        }
    }
}

/// Operands cover the addressing modes the lowering emits.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    Implied,
    /// Accumulator mode for the shift family (`ASL A`).
    Acc,
    Imm(u8),
    /// `#<sym`, the low byte of a symbol's address.
    ImmLo(Id),
    /// `#>sym`, the high byte of a symbol's address.
    ImmHi(Id),
    Zp(u8),
    ZpX(u8),
    ZpY(u8),
    Abs(Addr),
    AbsX(Addr),
    AbsY(Addr),
    /// `(zp),Y`: indirect through a zero-page pointer, indexed.
    IndY(u8),
    /// `(abs)`; only used by `JMP`.
    Ind(Addr),
    /// A branch or jump target: a block label or function symbol.
    Label(Id),
}

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Implied => Ok(()),
            Operand::Acc => write!(f, "A"),
            Operand::Imm(v) => write!(f, "#${v:02X}"),
            Operand::ImmLo(s) => write!(f, "#<{s}"),
            Operand::ImmHi(s) => write!(f, "#>{s}"),
            Operand::Zp(a) => write!(f, "${a:02X}"),
            Operand::ZpX(a) => write!(f, "${a:02X},X"),
            Operand::ZpY(a) => write!(f, "${a:02X},Y"),
            Operand::Abs(a) => write!(f, "{a}"),
            Operand::AbsX(a) => write!(f, "{a},X"),
            Operand::AbsY(a) => write!(f, "{a},Y"),
            Operand::IndY(a) => write!(f, "(${a:02X}),Y"),
            Operand::Ind(a) => write!(f, "({a})"),
            Operand::Label(l) => write!(f, "{l}"),
        }
    }
}

/// One ASM-IL entry: an instruction, a local label, or a comment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Inst {
    Op {
        mn: Mnemonic,
        operand: Operand,
        /// Never elided or forwarded across by the peephole pass.
        volatile: bool,
    },
    /// A local label used by intra-block branching (comparisons, variable
    /// shifts).
    Label(Id),
    /// In-line comments in the output for debugging.
    Comment(String),
}

impl Inst {
    pub fn op(mn: Mnemonic, operand: Operand) -> Inst {
        Inst::Op {
            mn,
            operand,
            volatile: false,
        }
    }

    pub fn volatile(mn: Mnemonic, operand: Operand) -> Inst {
        Inst::Op {
            mn,
            operand,
            volatile: true,
        }
    }

    pub fn implied(mn: Mnemonic) -> Inst {
        Inst::Op {
            mn,
            operand: Operand::Implied,
            volatile: false,
        }
    }
}

impl Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Op { mn, operand, .. } => match operand {
                Operand::Implied => write!(f, "    {mn}"),
                _ => write!(f, "    {mn} {operand}"),
            },
            Inst::Label(l) => write!(f, "{l}:"),
            Inst::Comment(s) => write!(f, "    ; {s}"),
        }
    }
}

/// A lowered basic block.
#[derive(Clone, Debug)]
pub struct Block {
    pub label: Id,
    pub insts: Vec<Inst>,
}

/// A lowered function.  The first block's label is the function's name.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Id,
    pub blocks: Vec<Block>,
}

/// Data-section entries.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DataItem {
    /// Initialized bytes (string literals, `data` globals, tables).
    Bytes { label: Id, bytes: Vec<u8> },
    /// Uninitialized reservation (`ram` globals).
    Reserve { label: Id, size: u16 },
}

/// What a symbol names.
#[derive(Clone, Copy, PartialEq, Eq, Debug, derive_more::Display)]
pub enum Symbol {
    /// A function entry label.
    #[display("function")]
    Function,
    /// A data-section label.
    #[display("data")]
    Data,
    /// A zero-page resident at this address.
    #[display("zp ${_0:02X}")]
    ZeroPage(u8),
    /// A frame-region resident at this address.
    #[display("frame ${_0:04X}")]
    Frame(u16),
    /// Provided by the runtime library, not this module.
    #[display("extern")]
    Extern,
}

/// The lowered module handed to the assembly emitter.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub data: Vec<DataItem>,
    pub symbols: Map<Id, Symbol>,
}

impl Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, sym) in &self.symbols {
            writeln!(f, "; sym {name} = {sym}")?;
        }
        for func in &self.functions {
            writeln!(f)?;
            for block in &func.blocks {
                writeln!(f, "{}:", block.label)?;
                for inst in &block.insts {
                    writeln!(f, "{inst}")?;
                }
            }
        }
        if !self.data.is_empty() {
            writeln!(f)?;
            for item in &self.data {
                match item {
                    DataItem::Bytes { label, bytes } => {
                        write!(f, "{label}: .byte ")?;
                        for (i, b) in bytes.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "${b:02X}")?;
                        }
                        writeln!(f)?;
                    }
                    DataItem::Reserve { label, size } => {
                        writeln!(f, "{label}: .res {size}")?;
                    }
                }
            }
        }
        Ok(())
    }
}
