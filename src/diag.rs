//! Diagnostics: fatal errors and accumulating warnings.
//!
//! Every stage either produces its full output or a list of errors; warnings
//! ride along with successful output.  Formatting for the user is the
//! driver's job, so these types only carry the data and a `Display`.

use std::fmt::{self, Display};

use crate::common::Id;

/// A line/column position in the original source, carried over from the AST.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, derive_more::Display)]
#[display("{line}:{col}")]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(line: u32, col: u32) -> SourceLoc {
        SourceLoc { line, col }
    }

    /// Position for nodes synthesized by the compiler itself.
    pub fn synthetic() -> SourceLoc {
        SourceLoc { line: 0, col: 0 }
    }
}

/// A call site that participates in a recursion cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub caller: Id,
    pub callee: Id,
    pub loc: SourceLoc,
}

/// Fatal compilation errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// A call-graph cycle contains a function without the recursion opt-in.
    IllegalRecursion {
        /// The members of the cycle, in a deterministic order.
        cycle: Vec<Id>,
        /// Every call site forming the cycle.
        sites: Vec<CallSite>,
    },
    /// A `zp required` slot could not be placed in the zero page.
    ZpRequiredUnsatisfiable {
        func: Option<Id>,
        slot: Id,
        /// Current residents of the pool: (owner, slot, address, size).
        residents: Vec<(Option<Id>, Id, u8, u16)>,
    },
    /// Coalesced frames exceed the platform's frame region.
    FrameOverflow { needed: u32, capacity: u32 },
    /// Two `@map` declarations share an address.
    MapOverlap { first: Id, second: Id },
    /// A `@map` layout extends past the end of the address space.
    MapOutOfRange { map: Id },
    /// An access names a `@map` declaration that does not exist.
    UnknownMap { map: Id, loc: SourceLoc },
    /// An access names a field its `@map` declaration does not have.
    UnknownField { map: Id, field: Id, loc: SourceLoc },
    /// A broken invariant inside the compiler itself.
    Internal { what: String },
}

impl CompileError {
    pub fn internal(what: impl Into<String>) -> CompileError {
        CompileError::Internal { what: what.into() }
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CompileError::*;

        match self {
            IllegalRecursion { cycle, sites } => {
                write!(f, "illegal recursion: cycle ")?;
                for (i, func) in cycle.iter().enumerate() {
                    if i > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{func}")?;
                }
                if let Some(first) = cycle.first() {
                    write!(f, " -> {first}")?;
                }
                write!(f, "; mark every member as recursive. Call sites:")?;
                for site in sites {
                    write!(
                        f,
                        " {} calls {} at {};",
                        site.caller, site.callee, site.loc
                    )?;
                }
                Ok(())
            }
            ZpRequiredUnsatisfiable {
                func,
                slot,
                residents,
            } => {
                match func {
                    Some(func) => write!(
                        f,
                        "zero page full: required slot '{slot}' of {func} cannot be placed"
                    )?,
                    None => write!(
                        f,
                        "zero page full: required global '{slot}' cannot be placed"
                    )?,
                }
                write!(f, "; current residents:")?;
                for (owner, name, addr, size) in residents {
                    match owner {
                        Some(owner) => {
                            write!(f, " {owner}.{name} at ${addr:02X} ({size}b);")?
                        }
                        None => write!(f, " {name} at ${addr:02X} ({size}b);")?,
                    }
                }
                Ok(())
            }
            FrameOverflow { needed, capacity } => write!(
                f,
                "frame region overflow: {needed} bytes of frames, {capacity} available"
            ),
            MapOverlap { first, second } => write!(
                f,
                "@map declarations '{first}' and '{second}' overlap in address space"
            ),
            MapOutOfRange { map } => {
                write!(f, "@map declaration '{map}' extends past $FFFF")
            }
            UnknownMap { map, loc } => write!(f, "{loc}: unknown @map '{map}'"),
            UnknownField { map, field, loc } => {
                write!(f, "{loc}: @map '{map}' has no field '{field}'")
            }
            Internal { what } => write!(f, "internal invariant violation: {what}"),
        }
    }
}

/// Non-fatal findings, accumulated across stages and returned with output.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Warning {
    /// A `zp preferred` slot fell back to the frame region.
    #[display("preferred zero-page slot '{slot}' of {func} stays in the frame region")]
    ZpPreferredFallback { func: Id, slot: Id },
    /// A call chain approaches the 256-byte hardware stack.
    #[display("call chain through {func} is {depth} calls deep")]
    DeepCallChain { func: Id, depth: u32 },
    /// A single function frame is unusually large.
    #[display("frame of {func} is {size} bytes")]
    LargeFrame { func: Id, size: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    #[test]
    fn recursion_message_names_cycle_and_sites() {
        let err = CompileError::IllegalRecursion {
            cycle: vec![id("ping"), id("pong")],
            sites: vec![
                CallSite {
                    caller: id("ping"),
                    callee: id("pong"),
                    loc: SourceLoc::new(3, 5),
                },
                CallSite {
                    caller: id("pong"),
                    callee: id("ping"),
                    loc: SourceLoc::new(9, 5),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("ping -> pong -> ping"));
        assert!(text.contains("ping calls pong at 3:5"));
        assert!(text.contains("pong calls ping at 9:5"));
    }

    #[test]
    fn zp_message_names_residents() {
        let err = CompileError::ZpRequiredUnsatisfiable {
            func: Some(id("isr")),
            slot: id("ptr"),
            residents: vec![(None, id("cursor"), 0x02, 2)],
        };
        let text = err.to_string();
        assert!(text.contains("required slot 'ptr' of isr"));
        assert!(text.contains("cursor at $02 (2b)"));
    }
}
