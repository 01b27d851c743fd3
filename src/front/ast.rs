//! The typed, fully-resolved AST the compiler core consumes.
//!
//! Lexing, parsing, name resolution and type checking are external
//! collaborators.  By the time a module reaches the core, every expression
//! carries its resolved type, every identifier binds to exactly one
//! declaration, and every `@map` declaration carries a computed address
//! layout.  The constructors on [Expr] exist for the stage-dump binary and
//! the test suite, which build programs directly in this representation.

use derive_more::Display;

use crate::common::Id;
use crate::diag::SourceLoc;

/// Value types.
///
/// `ptr` is a 16-bit address, bit-identical to `u16` but allocated
/// differently (the zero-page allocator favors pointers, since
/// indirect-indexed addressing requires them there).  Arrays are never
/// SSA values; they live in globals or frame slots.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Ty {
    #[display("i1")]
    I1,
    #[display("u8")]
    U8,
    #[display("u16")]
    U16,
    #[display("ptr")]
    Ptr,
    #[display("[{_0}; {_1}]")]
    Array(Box<Ty>, u16),
}

impl Ty {
    /// Storage size in bytes.  Booleans occupy a full byte at runtime.
    pub fn size_bytes(&self) -> u16 {
        match self {
            Ty::I1 | Ty::U8 => 1,
            Ty::U16 | Ty::Ptr => 2,
            Ty::Array(elem, n) => elem.size_bytes() * n,
        }
    }

    /// True for the two-byte scalar types.
    pub fn is_word(&self) -> bool {
        matches!(self, Ty::U16 | Ty::Ptr)
    }

    pub fn is_byte(&self) -> bool {
        matches!(self, Ty::I1 | Ty::U8)
    }

    pub fn array(elem: Ty, n: u16) -> Ty {
        Ty::Array(Box::new(elem), n)
    }
}

/// A whole source module after import linking.
#[derive(Debug)]
pub struct Module {
    pub name: Id,
    pub globals: Vec<GlobalDecl>,
    pub maps: Vec<MapDecl>,
    pub functions: Vec<FuncDecl>,
}

/// Storage classes for globals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Storage {
    /// Uninitialized RAM, reserved by the emitter.
    #[display("ram")]
    Ram,
    /// Initialized bytes in the data section.
    #[display("data")]
    Data,
    /// A compile-time constant; reads fold away, no storage is emitted.
    #[display("const")]
    Const,
    /// Lives in the zero page; placement is a `required` request.
    #[display("zp")]
    Zp,
}

/// A global initializer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Init {
    Scalar(u16),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
pub struct GlobalDecl {
    pub name: Id,
    pub ty: Ty,
    pub storage: Storage,
    pub init: Option<Init>,
}

/// A memory-mapped declaration: a name bound to fixed hardware addresses.
#[derive(Clone, Debug)]
pub struct MapDecl {
    pub name: Id,
    pub layout: MapLayout,
    pub loc: SourceLoc,
}

#[derive(Clone, Debug)]
pub enum MapLayout {
    /// A single address holding one primitive.
    Simple { addr: u16, ty: Ty },
    /// A contiguous run of `len` elements starting at `base`, accessed by
    /// index.
    Range { base: u16, len: u16, elem: Ty },
    /// Fields packed from `base`; each field's address follows from the
    /// sizes of the fields before it.
    Struct { base: u16, fields: Vec<MapField> },
    /// Fields at individually declared addresses; gaps are allowed.
    Explicit { fields: Vec<(Id, u16, Ty)> },
}

#[derive(Clone, Debug)]
pub struct MapField {
    pub name: Id,
    pub ty: Ty,
}

impl MapDecl {
    /// The half-open address span `[start, end)` this declaration covers.
    /// The end is a `u32` so a layout touching `$FFFF` has a representable
    /// extent.
    pub fn extent(&self) -> (u32, u32) {
        match &self.layout {
            MapLayout::Simple { addr, ty } => {
                (*addr as u32, *addr as u32 + ty.size_bytes() as u32)
            }
            MapLayout::Range { base, len, elem } => (
                *base as u32,
                *base as u32 + *len as u32 * elem.size_bytes() as u32,
            ),
            MapLayout::Struct { base, fields } => {
                let size: u32 = fields.iter().map(|f| f.ty.size_bytes() as u32).sum();
                (*base as u32, *base as u32 + size)
            }
            MapLayout::Explicit { fields } => {
                let start = fields.iter().map(|(_, a, _)| *a as u32).min().unwrap_or(0);
                let end = fields
                    .iter()
                    .map(|(_, a, ty)| *a as u32 + ty.size_bytes() as u32)
                    .max()
                    .unwrap_or(0);
                (start, end)
            }
        }
    }

    /// Resolve a field access to its absolute address and type.  For a
    /// [MapLayout::Simple] declaration the map's own name doubles as the
    /// field name, so `border` and `border.border` denote the same byte.
    pub fn field(&self, field: Id) -> Option<(u16, Ty)> {
        match &self.layout {
            MapLayout::Simple { addr, ty } => {
                (field == self.name).then(|| (*addr, ty.clone()))
            }
            MapLayout::Range { .. } => None,
            MapLayout::Struct { base, fields } => {
                let mut offset = 0u16;
                for f in fields {
                    if f.name == field {
                        return Some((base.wrapping_add(offset), f.ty.clone()));
                    }
                    offset += f.ty.size_bytes();
                }
                None
            }
            MapLayout::Explicit { fields } => fields
                .iter()
                .find(|(name, _, _)| *name == field)
                .map(|(_, addr, ty)| (*addr, ty.clone())),
        }
    }

    /// The (base, element count, element type) of an indexable declaration.
    pub fn range(&self) -> Option<(u16, u16, Ty)> {
        match &self.layout {
            MapLayout::Range { base, len, elem } => Some((*base, *len, elem.clone())),
            _ => None,
        }
    }
}

/// Zero-page placement directives on locals and parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum ZpMode {
    #[display("none")]
    None,
    #[display("forbidden")]
    Forbidden,
    #[display("preferred")]
    Preferred,
    #[display("required")]
    Required,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: Id,
    pub ty: Ty,
}

/// A function signature, as used to match `call_indirect` targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
}

#[derive(Debug)]
pub struct FuncDecl {
    pub name: Id,
    pub params: Vec<Param>,
    /// `None` is a void function.
    pub ret: Option<Ty>,
    /// The source-level recursion opt-in.
    pub recursive: bool,
    /// True for interrupt handler entry points.
    pub isr: bool,
    pub body: Vec<Stmt>,
    pub loc: SourceLoc,
}

impl FuncDecl {
    pub fn signature(&self) -> Signature {
        Signature {
            params: self.params.iter().map(|p| p.ty.clone()).collect(),
            ret: self.ret.clone(),
        }
    }
}

#[derive(Debug)]
pub enum Stmt {
    Let {
        name: Id,
        ty: Ty,
        zp: ZpMode,
        init: Option<Expr>,
        loc: SourceLoc,
    },
    Assign {
        target: LValue,
        value: Expr,
    },
    /// An expression evaluated for its effects (typically a call).
    Expr(Expr),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// `for var in from..to`: half-open, step 1; `var` is an implicit local
    /// of the bound type.
    For {
        var: Id,
        from: Expr,
        to: Expr,
        body: Vec<Stmt>,
    },
    /// Dispatch on compile-time constant arms, with a default body.
    Match {
        scrutinee: Expr,
        arms: Vec<(u16, Vec<Stmt>)>,
        default: Vec<Stmt>,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    /// `poke(addr, value)`, the canonical raw byte store.
    Poke { addr: Expr, value: Expr },
}

#[derive(Debug)]
pub enum LValue {
    /// A named local, parameter, or global.
    Var(Id),
    /// A whole simple `@map` declaration.
    Map(Id, SourceLoc),
    MapField {
        map: Id,
        field: Id,
        loc: SourceLoc,
    },
    MapIndex {
        map: Id,
        index: Box<Expr>,
        loc: SourceLoc,
    },
    /// An element of a named array.
    Index { name: Id, index: Box<Expr> },
    /// A store through a computed address, at the given type.
    Deref { addr: Box<Expr>, ty: Ty },
}

/// A typed expression.
#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    pub loc: SourceLoc,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    Const(u16),
    Var(Id),
    /// A whole simple `@map` declaration.
    Map(Id),
    MapField { map: Id, field: Id },
    MapIndex { map: Id, index: Box<Expr> },
    /// An element of a named array.
    Index { name: Id, index: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Compare { op: CmpOp, lhs: Box<Expr>, rhs: Box<Expr> },
    /// Short-circuiting `&&` / `||`.
    Logical { op: LogicalOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Cast { kind: CastKind, operand: Box<Expr> },
    Call { callee: Id, args: Vec<Expr> },
    CallIndirect {
        target: Box<Expr>,
        sig: Signature,
        args: Vec<Expr>,
    },
    /// The address of a named variable or function.
    AddrOf(Id),
    /// Element count of a named array; a compile-time constant.
    Len(Id),
    /// `peek(addr)`, the canonical raw byte load.
    Peek(Box<Expr>),
    /// A load through a computed address, at this expression's type.
    Deref(Box<Expr>),
    /// A string literal; evaluates to a pointer to null-terminated bytes in
    /// the data section.
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum BinOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("mod")]
    Mod,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum UnOp {
    #[display("neg")]
    Neg,
    #[display("not")]
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum CmpOp {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum LogicalOp {
    #[display("and")]
    And,
    #[display("or")]
    Or,
}

/// Explicit type conversions; the language has no implicit widening.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum CastKind {
    #[display("zext")]
    Zext,
    #[display("truncate")]
    Truncate,
    #[display("bool_to_byte")]
    BoolToByte,
    #[display("byte_to_bool")]
    ByteToBool,
}

impl Expr {
    fn new(kind: ExprKind, ty: Ty) -> Expr {
        Expr {
            kind,
            ty,
            loc: SourceLoc::synthetic(),
        }
    }

    pub fn at(mut self, loc: SourceLoc) -> Expr {
        self.loc = loc;
        self
    }

    pub fn byte(v: u8) -> Expr {
        Expr::new(ExprKind::Const(v as u16), Ty::U8)
    }

    pub fn word(v: u16) -> Expr {
        Expr::new(ExprKind::Const(v), Ty::U16)
    }

    pub fn truth(v: bool) -> Expr {
        Expr::new(ExprKind::Const(v as u16), Ty::I1)
    }

    pub fn var(name: Id, ty: Ty) -> Expr {
        Expr::new(ExprKind::Var(name), ty)
    }

    pub fn map(name: Id, ty: Ty) -> Expr {
        Expr::new(ExprKind::Map(name), ty)
    }

    pub fn map_field(map: Id, field: Id, ty: Ty) -> Expr {
        Expr::new(ExprKind::MapField { map, field }, ty)
    }

    pub fn map_index(map: Id, index: Expr, elem: Ty) -> Expr {
        Expr::new(
            ExprKind::MapIndex {
                map,
                index: Box::new(index),
            },
            elem,
        )
    }

    pub fn index(name: Id, index: Expr, elem: Ty) -> Expr {
        Expr::new(
            ExprKind::Index {
                name,
                index: Box::new(index),
            },
            elem,
        )
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        let ty = operand.ty.clone();
        Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let ty = lhs.ty.clone();
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::new(
            ExprKind::Compare {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Ty::I1,
        )
    }

    pub fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::new(
            ExprKind::Logical {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Ty::I1,
        )
    }

    pub fn cast(kind: CastKind, operand: Expr) -> Expr {
        let ty = match kind {
            CastKind::Zext => Ty::U16,
            CastKind::Truncate | CastKind::BoolToByte => Ty::U8,
            CastKind::ByteToBool => Ty::I1,
        };
        Expr::new(
            ExprKind::Cast {
                kind,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn call(callee: Id, args: Vec<Expr>, ret: Ty) -> Expr {
        Expr::new(ExprKind::Call { callee, args }, ret)
    }

    pub fn call_indirect(target: Expr, sig: Signature, args: Vec<Expr>) -> Expr {
        let ret = sig.ret.clone().unwrap_or(Ty::U8);
        Expr::new(
            ExprKind::CallIndirect {
                target: Box::new(target),
                sig,
                args,
            },
            ret,
        )
    }

    pub fn addr_of(name: Id) -> Expr {
        Expr::new(ExprKind::AddrOf(name), Ty::Ptr)
    }

    pub fn len(name: Id) -> Expr {
        Expr::new(ExprKind::Len(name), Ty::U16)
    }

    pub fn peek(addr: Expr) -> Expr {
        Expr::new(ExprKind::Peek(Box::new(addr)), Ty::U8)
    }

    pub fn deref(addr: Expr, ty: Ty) -> Expr {
        Expr::new(ExprKind::Deref(Box::new(addr)), ty)
    }

    pub fn str_lit(text: impl Into<String>) -> Expr {
        Expr::new(ExprKind::Str(text.into()), Ty::Ptr)
    }
}

impl Stmt {
    /// A `let` with no directive and an initializer.
    pub fn local(name: Id, ty: Ty, init: Expr) -> Stmt {
        Stmt::Let {
            name,
            ty,
            zp: ZpMode::None,
            init: Some(init),
            loc: SourceLoc::synthetic(),
        }
    }

    pub fn assign_var(name: Id, value: Expr) -> Stmt {
        Stmt::Assign {
            target: LValue::Var(name),
            value,
        }
    }
}
