//! Static frame allocation.
//!
//! Every non-recursive function gets its locals, parameters and compiler
//! temporaries placed at fixed addresses in the platform's frame region.
//! Functions that can never be live at the same time (no caller/callee
//! path between them, same thread context, neither recursive) are joined
//! into coalescing groups that share one chunk of the region.  Joining is
//! greedy in decreasing frame-size order; optimal coalescing is a graph
//! coloring problem and not worth the trouble here.
//!
//! Recursive functions instead get stack-pointer-relative offsets in a
//! software stack frame.  The software stack pointer lives in a fixed
//! zero-page word claimed from the front of the pool.

use derive_more::Display;
use log::debug;

use crate::common::{id, Id, Map};
use crate::diag::{CompileError, Warning};
use crate::front::ast::{Ty, ZpMode};
use crate::middle::callgraph::{CallGraph, ThreadContext};
use crate::middle::il::{Function, Instruction, Module, ValueId};
use crate::platform::Platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SlotKind {
    #[display("param")]
    Param,
    #[display("local")]
    Local,
    #[display("temp")]
    Temp,
}

/// Where a slot ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Location {
    #[display("zp ${_0:02X}")]
    ZeroPage(u8),
    #[display("${_0:04X}")]
    Frame(u16),
    #[display("sp+{_0}")]
    SpRelative(u16),
}

/// One unit of frame allocation.
#[derive(Clone, Debug)]
pub struct Slot {
    pub name: Id,
    pub kind: SlotKind,
    pub ty: Ty,
    pub size: u16,
    pub zp: ZpMode,
    /// Uses weighted later by loop depth; raw count here.
    pub access_count: u32,
    /// Deepest loop nesting among this slot's accesses.
    pub loop_depth: u32,
    /// `None` until the allocators have run.
    pub location: Option<Location>,
}

/// A function's allocated frame.
#[derive(Clone, Debug)]
pub struct FunctionFrame {
    pub func: Id,
    pub recursive: bool,
    pub context: ThreadContext,
    /// Index into [FrameMap::groups]; recursive frames are not grouped.
    pub group: Option<usize>,
    /// Base address in the frame region; meaningless for recursive frames.
    pub base: u16,
    pub size: u16,
    pub slots: Vec<Slot>,
    named: Map<Id, usize>,
    values: Map<u32, usize>,
}

impl FunctionFrame {
    pub fn slot_for_name(&self, name: Id) -> Option<&Slot> {
        self.named.get(&name).map(|i| &self.slots[*i])
    }

    pub fn slot_for_value(&self, v: ValueId) -> Option<&Slot> {
        self.values.get(&v.0).map(|i| &self.slots[*i])
    }

    /// The parameter slots, in calling-convention order.
    pub fn param_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|s| s.kind == SlotKind::Param)
    }
}

/// The whole-program frame assignment.
#[derive(Clone, Debug)]
pub struct FrameMap {
    pub frames: Map<Id, FunctionFrame>,
    /// Static coalescing groups, in placement order.
    pub groups: Vec<Vec<Id>>,
    /// Zero-page address of the software stack pointer word, when any
    /// recursive function exists.
    pub software_sp: Option<u8>,
}

impl FrameMap {
    pub fn frame(&self, func: Id) -> Option<&FunctionFrame> {
        self.frames.get(&func)
    }
}

impl std::fmt::Display for FrameMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(sp) = self.software_sp {
            writeln!(f, "software sp at ${sp:02X}/${:02X}", sp + 1)?;
        }
        for frame in self.frames.values() {
            if frame.recursive {
                writeln!(f, "{} (recursive, {} bytes):", frame.func, frame.size)?;
            } else {
                writeln!(
                    f,
                    "{} (group {}, base ${:04X}, {} bytes):",
                    frame.func,
                    frame.group.unwrap_or(0),
                    frame.base,
                    frame.size
                )?;
            }
            for slot in &frame.slots {
                write!(f, "    {} {} : {}", slot.kind, slot.name, slot.ty)?;
                match slot.location {
                    Some(loc) => writeln!(f, " @ {loc}")?,
                    None => writeln!(f, " @ ?")?,
                }
            }
        }
        Ok(())
    }
}

pub fn allocate(
    il: &Module,
    graph: &CallGraph,
    platform: &Platform,
) -> Result<(FrameMap, Vec<Warning>), Vec<CompileError>> {
    let mut warnings = Vec::new();
    let mut frames: Map<Id, FunctionFrame> = Map::new();
    let any_recursive = il
        .functions
        .iter()
        .any(|f| f.recursive || graph.is_recursive(f.name));

    for func in &il.functions {
        let recursive = func.recursive || graph.is_recursive(func.name);
        let frame = build_frame(func, recursive, graph.context(func.name));
        if frame.size > platform.large_frame_warning {
            warnings.push(Warning::LargeFrame {
                func: func.name,
                size: frame.size,
            });
        }
        frames.insert(func.name, frame);
    }

    // Greedy coalescing over the static frames, biggest first so the large
    // frames anchor the groups.
    let mut order: Vec<Id> = il
        .functions
        .iter()
        .map(|f| f.name)
        .filter(|n| !frames[n].recursive)
        .collect();
    let decl_index: Map<Id, usize> = il
        .functions
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name, i))
        .collect();
    order.sort_by(|a, b| {
        frames[b]
            .size
            .cmp(&frames[a].size)
            .then(decl_index[a].cmp(&decl_index[b]))
    });

    let mut groups: Vec<Vec<Id>> = Vec::new();
    for name in order {
        let found = groups.iter_mut().find(|members| {
            members
                .iter()
                .all(|other| compatible(graph, &frames, name, *other))
        });
        match found {
            Some(members) => {
                debug!("coalescing {name} into group of {}", members[0]);
                members.push(name);
            }
            None => groups.push(vec![name]),
        }
    }

    // Lay groups out consecutively and fix up slot addresses.
    let mut base = platform.frame_region.start;
    let mut total: u32 = 0;
    for (gi, members) in groups.iter().enumerate() {
        let group_size = members.iter().map(|m| frames[m].size).max().unwrap_or(0);
        total += group_size as u32;
        for member in members {
            let frame = frames.get_mut(member).unwrap();
            frame.group = Some(gi);
            frame.base = base;
            let mut offset = 0u16;
            for slot in &mut frame.slots {
                slot.location = Some(Location::Frame(base + offset));
                offset += slot.size;
            }
        }
        base = base.saturating_add(group_size);
    }
    if total > platform.frame_capacity() {
        return Err(vec![CompileError::FrameOverflow {
            needed: total,
            capacity: platform.frame_capacity(),
        }]);
    }

    // Recursive frames: sp-relative layout, no group.
    for frame in frames.values_mut() {
        if !frame.recursive {
            continue;
        }
        let mut offset = 0u16;
        for slot in &mut frame.slots {
            slot.location = Some(Location::SpRelative(offset));
            offset += slot.size;
        }
    }

    let software_sp = any_recursive.then_some(platform.zp_pool.start);
    debug!(
        "frame region: {} groups, {total} of {} bytes",
        groups.len(),
        platform.frame_capacity()
    );
    Ok((
        FrameMap {
            frames,
            groups,
            software_sp,
        },
        warnings,
    ))
}

/// Two static frames may share memory only when their functions can never
/// be live simultaneously.
fn compatible(graph: &CallGraph, frames: &Map<Id, FunctionFrame>, f: Id, g: Id) -> bool {
    let (ff, gf) = (&frames[&f], &frames[&g]);
    if ff.recursive || gf.recursive {
        return false;
    }
    // Indirect call targets keep their frames to themselves: an indirect
    // call writes arguments into every possible target's parameter slots,
    // which must not alias anything else.
    if graph.address_taken.contains(&f) || graph.address_taken.contains(&g) {
        return false;
    }
    // An interrupt can preempt main code at any point, so the contexts must
    // agree exactly.
    if ff.context != gf.context || ff.context == ThreadContext::Both {
        return false;
    }
    !graph.is_transitive_caller(f, g) && !graph.is_transitive_caller(g, f)
}

/// Collect a function's slots: parameters, declared locals, then one
/// temporary per unnamed SSA value.  Values that are versions of a named
/// variable share that variable's slot.
fn build_frame(func: &Function, recursive: bool, context: ThreadContext) -> FunctionFrame {
    let mut slots: Vec<Slot> = Vec::new();
    let mut named: Map<Id, usize> = Map::new();
    let mut values: Map<u32, usize> = Map::new();

    for (name, ty) in &func.params {
        named.insert(*name, slots.len());
        slots.push(Slot {
            name: *name,
            kind: SlotKind::Param,
            ty: ty.clone(),
            size: ty.size_bytes(),
            zp: ZpMode::None,
            access_count: 0,
            loop_depth: 0,
            location: None,
        });
    }
    for local in &func.locals {
        if named.contains_key(&local.name) {
            continue;
        }
        named.insert(local.name, slots.len());
        slots.push(Slot {
            name: local.name,
            kind: SlotKind::Local,
            ty: local.ty.clone(),
            size: local.ty.size_bytes(),
            zp: local.zp,
            access_count: 0,
            loop_depth: 0,
            location: None,
        });
    }
    for (i, ty) in func.value_types.iter().enumerate() {
        let v = ValueId(i as u32);
        match func.origin(v) {
            Some(name) => {
                // A version of a named variable; its home is that slot.
                if let Some(slot) = named.get(&name) {
                    values.insert(v.0, *slot);
                }
            }
            None => {
                let slot = slots.len();
                values.insert(v.0, slot);
                slots.push(Slot {
                    name: id(format!("t{i}")),
                    kind: SlotKind::Temp,
                    ty: ty.clone(),
                    size: ty.size_bytes(),
                    zp: ZpMode::None,
                    access_count: 0,
                    loop_depth: 0,
                    location: None,
                });
            }
        }
    }

    // Access statistics for the zero-page scoring.
    fn bump(slots: &mut [Slot], idx: usize, depth: u32) {
        let slot = &mut slots[idx];
        slot.access_count += 1;
        slot.loop_depth = slot.loop_depth.max(depth);
    }
    fn touch(slots: &mut [Slot], values: &Map<u32, usize>, v: ValueId, depth: u32) {
        if let Some(idx) = values.get(&v.0).copied() {
            bump(slots, idx, depth);
        }
    }
    for (bi, block) in func.blocks.iter().enumerate() {
        let depth = func.block_depth[bi];
        for phi in &block.phis {
            touch(&mut slots, &values, phi.dst, depth);
            for (_, v) in &phi.incoming {
                touch(&mut slots, &values, *v, depth);
            }
        }
        for inst in &block.instructions {
            if let Some(dst) = inst.dst() {
                touch(&mut slots, &values, dst, depth);
            }
            inst.for_each_use(|v| touch(&mut slots, &values, v, depth));
            match inst {
                Instruction::LoadVar { name, .. }
                | Instruction::StoreVar { name, .. }
                | Instruction::AddrOf { name, .. } => {
                    if let Some(idx) = named.get(name).copied() {
                        bump(&mut slots, idx, depth);
                    }
                }
                _ => {}
            }
        }
        block
            .terminator
            .for_each_use(|v| touch(&mut slots, &values, v, depth));
    }

    let size = slots.iter().map(|s| s.size).sum();
    FunctionFrame {
        func: func.name,
        recursive,
        context,
        group: None,
        base: 0,
        size,
        slots,
        named,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::ast::{self, Expr, Stmt};
    use crate::middle::{callgraph, lower};

    fn call_stmt(callee: &str) -> Stmt {
        Stmt::Expr(Expr::call(id(callee), vec![], Ty::U8))
    }

    fn func(name: &str, recursive: bool, isr: bool, body: Vec<Stmt>) -> ast::FuncDecl {
        ast::FuncDecl {
            name: id(name),
            params: vec![],
            ret: None,
            recursive,
            isr,
            body,
            loc: crate::diag::SourceLoc::synthetic(),
        }
    }

    fn scratch_body() -> Vec<Stmt> {
        // A four-byte frame: one array local, nothing else.
        vec![Stmt::Let {
            name: id("buf"),
            ty: Ty::array(Ty::U8, 4),
            zp: ZpMode::None,
            init: None,
            loc: crate::diag::SourceLoc::synthetic(),
        }]
    }

    fn allocate_module(funcs: Vec<ast::FuncDecl>) -> Result<FrameMap, Vec<CompileError>> {
        let ast = ast::Module {
            name: id("test"),
            globals: vec![],
            maps: vec![],
            functions: funcs,
        };
        let il = lower::lower(&ast).unwrap();
        let platform = Platform::c64();
        let (graph, _) = callgraph::analyze(&il, &platform)?;
        allocate(&il, &graph, &platform).map(|(m, _)| m)
    }

    #[test]
    fn siblings_coalesce_and_their_caller_does_not() {
        let map = allocate_module(vec![
            func(
                "main",
                false,
                false,
                vec![call_stmt("init"), call_stmt("update"), call_stmt("render")],
            ),
            func("init", false, false, scratch_body()),
            func("update", false, false, scratch_body()),
            func("render", false, false, scratch_body()),
        ])
        .unwrap();

        let g = |n: &str| map.frames[&id(n)].group.unwrap();
        assert_eq!(g("init"), g("update"));
        assert_eq!(g("init"), g("render"));
        assert_ne!(g("main"), g("init"));
        // Sharing means one four-byte region, not three.
        let group = &map.groups[g("init")];
        assert_eq!(group.len(), 3);
        let bases: Vec<u16> = group.iter().map(|m| map.frames[m].base).collect();
        assert!(bases.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn caller_and_callee_never_share() {
        let map = allocate_module(vec![
            func("a", false, false, {
                let mut body = scratch_body();
                body.push(call_stmt("b"));
                body
            }),
            func("b", false, false, scratch_body()),
        ])
        .unwrap();
        assert_ne!(
            map.frames[&id("a")].group.unwrap(),
            map.frames[&id("b")].group.unwrap()
        );
        // Regions must not overlap.
        let (a, b) = (&map.frames[&id("a")], &map.frames[&id("b")]);
        let a_end = a.base + a.size;
        let b_end = b.base + b.size;
        assert!(a_end <= b.base || b_end <= a.base);
    }

    #[test]
    fn isr_and_main_never_share() {
        let map = allocate_module(vec![
            func("main", false, false, vec![call_stmt("tick")]),
            func("tick", false, false, scratch_body()),
            func("handler", false, true, scratch_body()),
        ])
        .unwrap();
        assert_ne!(
            map.frames[&id("tick")].group.unwrap(),
            map.frames[&id("handler")].group.unwrap()
        );
    }

    #[test]
    fn recursive_frames_are_sp_relative() {
        let fact_body = vec![
            Stmt::Expr(Expr::call(id("fact"), vec![], Ty::U8)),
            Stmt::Return(None),
        ];
        let map = allocate_module(vec![
            func("main", false, false, vec![call_stmt("fact")]),
            {
                let mut f = func("fact", true, false, fact_body);
                f.body.insert(
                    0,
                    Stmt::Let {
                        name: id("n"),
                        ty: Ty::U8,
                        zp: ZpMode::None,
                        init: Some(Expr::byte(0)),
                        loc: crate::diag::SourceLoc::synthetic(),
                    },
                );
                f
            },
        ])
        .unwrap();
        let fact = &map.frames[&id("fact")];
        assert!(fact.recursive);
        assert!(fact.group.is_none());
        assert!(fact
            .slots
            .iter()
            .all(|s| matches!(s.location, Some(Location::SpRelative(_)))));
        assert!(map.software_sp.is_some());
    }

    #[test]
    fn every_slot_gets_a_location() {
        let map = allocate_module(vec![
            func("main", false, false, vec![call_stmt("leaf")]),
            func("leaf", false, false, scratch_body()),
        ])
        .unwrap();
        for frame in map.frames.values() {
            for slot in &frame.slots {
                assert!(slot.location.is_some(), "{}.{}", frame.func, slot.name);
            }
        }
    }

    #[test]
    fn frame_region_overflow_is_fatal() {
        let err = allocate_module(vec![func(
            "main",
            false,
            false,
            vec![Stmt::Let {
                name: id("big"),
                ty: Ty::array(Ty::U8, 600),
                zp: ZpMode::None,
                init: None,
                loc: crate::diag::SourceLoc::synthetic(),
            }],
        )])
        .unwrap_err();
        assert!(matches!(err[0], CompileError::FrameOverflow { .. }));
    }

    #[test]
    fn allocation_is_deterministic() {
        let build = || {
            allocate_module(vec![
                func(
                    "main",
                    false,
                    false,
                    vec![call_stmt("init"), call_stmt("update")],
                ),
                func("init", false, false, scratch_body()),
                func("update", false, false, scratch_body()),
            ])
            .unwrap()
        };
        assert_eq!(format!("{:?}", build()), format!("{:?}", build()));
    }
}
