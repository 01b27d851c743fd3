//! This is the compiler core as a library.  See the `src/bin` directory
//! for the executable program using this library.
//!
//! The pipeline runs in five stages, each pure and deterministic: the
//! typed AST lowers to SSA IL, the call graph classifies recursion and
//! thread contexts, the frame allocator assigns every function's storage
//! to fixed addresses (coalescing functions that can never be live
//! together), the zero-page allocator promotes the hottest slots, and the
//! backend lowers the IL to 6502 assembly with symbolic operands.  An
//! optional peephole pass cleans up the result.

pub mod common;
pub mod diag;
pub mod platform;

pub mod back;
pub mod front;
pub mod middle;

use diag::{CompileError, Warning};
use platform::Platform;

/// Everything the pipeline produces for one module.
#[derive(Debug)]
pub struct CompileOutput {
    pub il: middle::il::Module,
    pub call_graph: middle::callgraph::CallGraph,
    pub frame_map: middle::frame::FrameMap,
    pub zp_map: middle::zeropage::ZpMap,
    pub asm: back::asm::Module,
    pub warnings: Vec<Warning>,
}

/// Run the whole pipeline.  The first stage that fails stops the run and
/// returns its errors; warnings from all completed stages accumulate.
pub fn compile(
    ast: &front::ast::Module,
    platform: &Platform,
    optimize: bool,
) -> Result<CompileOutput, Vec<CompileError>> {
    let il = middle::lower::lower(ast)?;
    if cfg!(debug_assertions) {
        il.validate().map_err(|e| vec![e])?;
    }
    let (call_graph, mut warnings) = middle::callgraph::analyze(&il, platform)?;
    let (mut frame_map, frame_warnings) = middle::frame::allocate(&il, &call_graph, platform)?;
    warnings.extend(frame_warnings);
    let (zp_map, zp_warnings) =
        middle::zeropage::allocate(&il, &call_graph, &mut frame_map, platform)?;
    warnings.extend(zp_warnings);
    let mut asm = back::codegen::lower(&il, &call_graph, &frame_map, &zp_map, platform)?;
    if optimize {
        asm = back::peephole::optimize(asm);
    }
    Ok(CompileOutput {
        il,
        call_graph,
        frame_map,
        zp_map,
        asm,
        warnings,
    })
}
