//! Zero-page allocation.
//!
//! The zero page is the only memory the 6502 can address with a one-byte
//! operand, and the only place indirect-indexed addressing can read a
//! pointer from.  This pass scores every frame slot, sorts the requests by
//! (directive rank, score) and hands out pool bytes first-fit.  Multi-byte
//! slots get consecutive bytes; a 16-bit pointer split across a gap would
//! be useless to `(zp),Y` addressing.
//!
//! Slots of recursive frames are never promoted: each activation needs its
//! own storage, and the zero page is shared by all of them.

use log::debug;

use crate::common::{Id, Map};
use crate::diag::{CompileError, Warning};
use crate::front::ast::{Storage, Ty, ZpMode};
use crate::middle::callgraph::{CallGraph, ThreadContext};
use crate::middle::frame::{FrameMap, Location};
use crate::middle::il::Module;
use crate::platform::Platform;

/// A successful zero-page placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Owning function; `None` for globals.
    pub func: Option<Id>,
    pub slot: Id,
    pub addr: u8,
    pub size: u16,
}

/// The zero-page assignment.  Frame slots are also updated in place in the
/// [FrameMap]; globals are only recorded here.
#[derive(Clone, Debug, Default)]
pub struct ZpMap {
    pub placements: Vec<Placement>,
    pub globals: Map<Id, u8>,
}

impl ZpMap {
    pub fn global(&self, name: Id) -> Option<u8> {
        self.globals.get(&name).copied()
    }
}

impl std::fmt::Display for ZpMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for p in &self.placements {
            match p.func {
                Some(func) => {
                    writeln!(f, "${:02X} ({}b) {}.{}", p.addr, p.size, func, p.slot)?
                }
                None => writeln!(f, "${:02X} ({}b) {}", p.addr, p.size, p.slot)?,
            }
        }
        Ok(())
    }
}

struct Request {
    func: Option<Id>,
    slot: Id,
    size: u16,
    rank: ZpMode,
    score: u64,
    recursive: bool,
}

pub fn allocate(
    il: &Module,
    graph: &CallGraph,
    frames: &mut FrameMap,
    platform: &Platform,
) -> Result<(ZpMap, Vec<Warning>), Vec<CompileError>> {
    let mut requests: Vec<Request> = Vec::new();

    // Globals with `zp` storage are module-scope `required` requests.
    for global in il.globals.values() {
        if global.storage == Storage::Zp {
            requests.push(Request {
                func: None,
                slot: global.name,
                size: global.ty.size_bytes(),
                rank: ZpMode::Required,
                score: u64::MAX,
                recursive: false,
            });
        }
    }

    for func in &il.functions {
        let frame = &frames.frames[&func.name];
        let isr_path = matches!(
            graph.context(func.name),
            ThreadContext::Isr | ThreadContext::Both
        );
        for slot in &frame.slots {
            if slot.zp == ZpMode::Forbidden {
                continue;
            }
            let score = score(&slot.ty, slot.access_count, slot.loop_depth, isr_path);
            if slot.zp == ZpMode::None && score < platform.zp_score_threshold {
                continue;
            }
            requests.push(Request {
                func: Some(func.name),
                slot: slot.name,
                size: slot.size,
                rank: slot.zp,
                score,
                recursive: frame.recursive,
            });
        }
    }

    // Directive rank first, then score, then names for a stable order.
    requests.sort_by(|a, b| {
        b.rank
            .cmp(&a.rank)
            .then(b.score.cmp(&a.score))
            .then(a.func.cmp(&b.func))
            .then(a.slot.cmp(&b.slot))
    });

    let mut pool = Pool::new(platform, frames.software_sp);
    let mut map = ZpMap::default();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    for req in requests {
        let placed = if req.recursive {
            None
        } else {
            pool.place(req.size)
        };
        match placed {
            Some(addr) => {
                debug!(
                    "zp: {}{} -> ${addr:02X} ({} bytes)",
                    req.func.map(|f| format!("{f}.")).unwrap_or_default(),
                    req.slot,
                    req.size
                );
                map.placements.push(Placement {
                    func: req.func,
                    slot: req.slot,
                    addr,
                    size: req.size,
                });
                match req.func {
                    Some(func) => {
                        if let Some(slot) = frames
                            .frames
                            .get_mut(&func)
                            .and_then(|f| f.slots.iter_mut().find(|s| s.name == req.slot))
                        {
                            slot.location = Some(Location::ZeroPage(addr));
                        }
                    }
                    None => {
                        map.globals.insert(req.slot, addr);
                    }
                }
            }
            None => match req.rank {
                ZpMode::Required => {
                    let residents = map
                        .placements
                        .iter()
                        .map(|p| (p.func, p.slot, p.addr, p.size))
                        .collect();
                    errors.push(CompileError::ZpRequiredUnsatisfiable {
                        func: req.func,
                        slot: req.slot,
                        residents,
                    });
                }
                ZpMode::Preferred => {
                    if let Some(func) = req.func {
                        warnings.push(Warning::ZpPreferredFallback {
                            func,
                            slot: req.slot,
                        });
                    }
                }
                ZpMode::None | ZpMode::Forbidden => {}
            },
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok((map, warnings))
}

/// Priority of a slot.  Pointers first (indirect addressing needs them in
/// the zero page), then bytes (every access gets one byte and one cycle
/// cheaper), then words.  Loop depth weighs an access ten-fold per level,
/// and anything on an interrupt path is doubled.
fn score(ty: &Ty, accesses: u32, depth: u32, isr_path: bool) -> u64 {
    let weight: u64 = match ty {
        Ty::Ptr => 8,
        Ty::U8 | Ty::I1 => 4,
        Ty::U16 => 2,
        Ty::Array(..) => 1,
    };
    let depth_factor = 10u64.pow(depth.min(3));
    let base = weight * accesses as u64 * depth_factor;
    if isr_path {
        base * 2
    } else {
        base
    }
}

/// First-fit allocator over the platform pool.
struct Pool {
    start: u8,
    free: Vec<bool>,
}

impl Pool {
    fn new(platform: &Platform, software_sp: Option<u8>) -> Pool {
        let start = platform.zp_pool.start;
        let len = (platform.zp_pool.end - start) as usize;
        let mut free = vec![true; len];
        if let Some(sp) = software_sp {
            // The software stack pointer word was claimed by the frame
            // allocator.
            for b in sp..sp + 2 {
                if let Some(i) = (b as usize).checked_sub(start as usize) {
                    if i < free.len() {
                        free[i] = false;
                    }
                }
            }
        }
        Pool { start, free }
    }

    /// The lowest run of `size` consecutive free bytes, if any.
    fn place(&mut self, size: u16) -> Option<u8> {
        let size = size as usize;
        if size == 0 || size > self.free.len() {
            return None;
        }
        for i in 0..=self.free.len() - size {
            if self.free[i..i + size].iter().all(|f| *f) {
                for b in &mut self.free[i..i + size] {
                    *b = false;
                }
                return Some(self.start + i as u8);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;
    use crate::front::ast::{self, Expr, Stmt};
    use crate::middle::{callgraph, frame, lower};

    fn let_with(name: &str, ty: Ty, zp: ZpMode) -> Stmt {
        Stmt::Let {
            name: id(name),
            ty,
            zp,
            init: Some(Expr::byte(0)),
            loc: crate::diag::SourceLoc::synthetic(),
        }
    }

    fn run(
        funcs: Vec<ast::FuncDecl>,
        platform: &Platform,
    ) -> Result<(FrameMap, ZpMap, Vec<Warning>), Vec<CompileError>> {
        let ast = ast::Module {
            name: id("test"),
            globals: vec![],
            maps: vec![],
            functions: funcs,
        };
        let il = lower::lower(&ast).unwrap();
        let (graph, _) = callgraph::analyze(&il, platform)?;
        let (mut frames, _) = frame::allocate(&il, &graph, platform)?;
        let (zp, warnings) = allocate(&il, &graph, &mut frames, platform)?;
        Ok((frames, zp, warnings))
    }

    fn one_func(body: Vec<Stmt>) -> Vec<ast::FuncDecl> {
        vec![ast::FuncDecl {
            name: id("main"),
            params: vec![],
            ret: None,
            recursive: false,
            isr: false,
            body,
            loc: crate::diag::SourceLoc::synthetic(),
        }]
    }

    #[test]
    fn required_byte_fits_a_one_byte_pool() {
        let mut platform = Platform::c64();
        platform.zp_pool = 0x02..0x03;
        let (frames, zp, _) = run(
            one_func(vec![let_with("hot", Ty::U8, ZpMode::Required)]),
            &platform,
        )
        .unwrap();
        assert_eq!(zp.placements.len(), 1);
        assert_eq!(zp.placements[0].addr, 0x02);
        let slot = frames.frames[&id("main")].slot_for_name(id("hot")).unwrap();
        assert_eq!(slot.location, Some(Location::ZeroPage(0x02)));
    }

    #[test]
    fn required_byte_fails_an_empty_pool() {
        let mut platform = Platform::c64();
        platform.zp_pool = 0x02..0x02;
        let err = run(
            one_func(vec![let_with("hot", Ty::U8, ZpMode::Required)]),
            &platform,
        )
        .unwrap_err();
        match &err[0] {
            CompileError::ZpRequiredUnsatisfiable { slot, .. } => {
                assert_eq!(*slot, id("hot"));
            }
            e => panic!("expected ZpRequiredUnsatisfiable, got {e}"),
        }
    }

    #[test]
    fn preferred_falls_back_with_a_warning() {
        let mut platform = Platform::c64();
        platform.zp_pool = 0x02..0x03;
        let (frames, _, warnings) = run(
            one_func(vec![
                let_with("first", Ty::U8, ZpMode::Required),
                let_with("second", Ty::U8, ZpMode::Preferred),
            ]),
            &platform,
        )
        .unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, Warning::ZpPreferredFallback { slot, .. } if *slot == id("second"))));
        let slot = frames.frames[&id("main")]
            .slot_for_name(id("second"))
            .unwrap();
        assert!(matches!(slot.location, Some(Location::Frame(_))));
    }

    #[test]
    fn words_get_consecutive_bytes() {
        let (_, zp, _) = run(
            one_func(vec![let_with("p", Ty::Ptr, ZpMode::Required)]),
            &Platform::c64(),
        )
        .unwrap();
        let p = zp
            .placements
            .iter()
            .find(|p| p.slot == id("p"))
            .unwrap();
        assert_eq!(p.size, 2);
        // First-fit from the front of the pool.
        assert_eq!(p.addr, 0x02);
    }

    #[test]
    fn placements_never_overlap() {
        let (_, zp, _) = run(
            one_func(vec![
                let_with("a", Ty::Ptr, ZpMode::Required),
                let_with("b", Ty::U8, ZpMode::Required),
                let_with("c", Ty::U16, ZpMode::Preferred),
            ]),
            &Platform::c64(),
        )
        .unwrap();
        let mut used = std::collections::BTreeSet::new();
        for p in &zp.placements {
            for b in p.addr..p.addr + p.size as u8 {
                assert!(used.insert(b), "byte ${b:02X} assigned twice");
            }
        }
    }

    #[test]
    fn forbidden_slots_stay_out() {
        let (frames, zp, _) = run(
            one_func(vec![let_with("cold", Ty::U8, ZpMode::Forbidden)]),
            &Platform::c64(),
        )
        .unwrap();
        assert!(zp.placements.is_empty());
        let slot = frames.frames[&id("main")]
            .slot_for_name(id("cold"))
            .unwrap();
        assert!(matches!(slot.location, Some(Location::Frame(_))));
    }

    #[test]
    fn zp_globals_are_required_requests() {
        let ast = ast::Module {
            name: id("test"),
            globals: vec![ast::GlobalDecl {
                name: id("cursor"),
                ty: Ty::Ptr,
                storage: Storage::Zp,
                init: None,
            }],
            maps: vec![],
            functions: vec![ast::FuncDecl {
                name: id("main"),
                params: vec![],
                ret: None,
                recursive: false,
                isr: false,
                body: vec![],
                loc: crate::diag::SourceLoc::synthetic(),
            }],
        };
        let platform = Platform::c64();
        let il = lower::lower(&ast).unwrap();
        let (graph, _) = callgraph::analyze(&il, &platform).unwrap();
        let (mut frames, _) = frame::allocate(&il, &graph, &platform).unwrap();
        let (zp, _) = allocate(&il, &graph, &mut frames, &platform).unwrap();
        assert_eq!(zp.global(id("cursor")), Some(0x02));
    }
}
