//! Whole-program call graph: recursion detection and thread contexts.
//!
//! Direct calls contribute their edge outright.  An indirect call is
//! over-approximated by its signature: any function whose address is taken
//! anywhere in the program and whose signature matches is a possible
//! target.  Tarjan's SCC algorithm finds cycles; a cycle containing a
//! function without the source-level recursion opt-in is a fatal error that
//! names the whole cycle and the call sites forming it.

use derive_more::Display;
use log::debug;

use crate::common::{id, Id, Map, Set};
use crate::diag::{CallSite, CompileError, SourceLoc, Warning};
use crate::front::ast::Signature;
use crate::middle::il::{Function, Instruction, Module};
use crate::platform::Platform;

/// Which execution context can reach a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ThreadContext {
    #[display("main")]
    Main,
    #[display("isr")]
    Isr,
    #[display("both")]
    Both,
}

/// The analyzed call graph.
#[derive(Clone, Debug)]
pub struct CallGraph {
    /// Direct and indirect callees of each function.
    pub callees: Map<Id, Set<Id>>,
    pub callers: Map<Id, Set<Id>>,
    /// Everything that can be on the stack below `f`, i.e. all functions
    /// from which `f` is reachable through calls.
    pub transitive_callers: Map<Id, Set<Id>>,
    /// Members of call cycles (including self-loops).
    pub recursive: Set<Id>,
    pub contexts: Map<Id, ThreadContext>,
    /// Worst-case call-stack depth of each non-recursive function, in calls
    /// from an entry point.
    pub depth: Map<Id, u32>,
    /// Functions whose address is taken; the possible targets of indirect
    /// calls.
    pub address_taken: Set<Id>,
    /// The program's main entry, if any.
    pub main: Option<Id>,
}

impl CallGraph {
    /// True when `caller` can be live on the stack while `f` executes.
    pub fn is_transitive_caller(&self, caller: Id, f: Id) -> bool {
        self.transitive_callers
            .get(&f)
            .map(|s| s.contains(&caller))
            .unwrap_or(false)
    }

    pub fn context(&self, f: Id) -> ThreadContext {
        self.contexts.get(&f).copied().unwrap_or(ThreadContext::Main)
    }

    pub fn is_recursive(&self, f: Id) -> bool {
        self.recursive.contains(&f)
    }
}

impl std::fmt::Display for CallGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, callees) in &self.callees {
            write!(f, "{name} [{}", self.context(*name))?;
            if self.recursive.contains(name) {
                write!(f, ", recursive")?;
            }
            if let Some(d) = self.depth.get(name) {
                write!(f, ", depth {d}")?;
            }
            write!(f, "] ->")?;
            if callees.is_empty() {
                write!(f, " (leaf)")?;
            }
            for callee in callees {
                write!(f, " {callee}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub fn analyze(
    il: &Module,
    platform: &Platform,
) -> Result<(CallGraph, Vec<Warning>), Vec<CompileError>> {
    let names: Vec<Id> = il.functions.iter().map(|f| f.name).collect();
    let sigs: Map<Id, Signature> = il
        .functions
        .iter()
        .map(|f| {
            (
                f.name,
                Signature {
                    params: f.params.iter().map(|(_, ty)| ty.clone()).collect(),
                    ret: f.ret.clone(),
                },
            )
        })
        .collect();

    // Functions whose address is taken anywhere; candidates for indirect
    // call targets.
    let mut address_taken: Set<Id> = Set::new();
    for func in &il.functions {
        for_each_instruction(func, |inst| {
            if let Instruction::AddrOf { name, .. } = inst {
                if sigs.contains_key(name) {
                    address_taken.insert(*name);
                }
            }
        });
    }

    let mut callees: Map<Id, Set<Id>> = names.iter().map(|n| (*n, Set::new())).collect();
    let mut callers: Map<Id, Set<Id>> = names.iter().map(|n| (*n, Set::new())).collect();
    let mut sites: Map<(Id, Id), Vec<SourceLoc>> = Map::new();
    let mut errors = Vec::new();

    for func in &il.functions {
        for_each_instruction(func, |inst| match inst {
            Instruction::Call { callee, loc, .. } => {
                if !sigs.contains_key(callee) {
                    errors.push(CompileError::internal(format!(
                        "{}: call to unknown function {callee}",
                        func.name
                    )));
                    return;
                }
                callees.get_mut(&func.name).unwrap().insert(*callee);
                callers.get_mut(callee).unwrap().insert(func.name);
                sites.entry((func.name, *callee)).or_default().push(*loc);
            }
            Instruction::CallIndirect { sig, loc, .. } => {
                for target in &address_taken {
                    if sigs[target] == *sig {
                        callees.get_mut(&func.name).unwrap().insert(*target);
                        callers.get_mut(target).unwrap().insert(func.name);
                        sites.entry((func.name, *target)).or_default().push(*loc);
                    }
                }
            }
            _ => {}
        });
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    // Cycle detection.
    let sccs = tarjan(&names, &callees);
    let declared: Map<Id, bool> = il.functions.iter().map(|f| (f.name, f.recursive)).collect();
    let mut recursive: Set<Id> = Set::new();
    for scc in &sccs {
        let cyclic = scc.len() > 1
            || (scc.len() == 1 && callees[&scc[0]].contains(&scc[0]));
        if !cyclic {
            continue;
        }
        for member in scc {
            recursive.insert(*member);
        }
        if scc.iter().any(|m| !declared[m]) {
            // Name the whole cycle and every call site forming it.
            let members: Set<Id> = scc.iter().copied().collect();
            let mut cycle_sites = Vec::new();
            for caller in scc {
                for callee in &callees[caller] {
                    if !members.contains(callee) {
                        continue;
                    }
                    for loc in sites.get(&(*caller, *callee)).into_iter().flatten() {
                        cycle_sites.push(CallSite {
                            caller: *caller,
                            callee: *callee,
                            loc: *loc,
                        });
                    }
                }
            }
            errors.push(CompileError::IllegalRecursion {
                cycle: scc.clone(),
                sites: cycle_sites,
            });
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    // Entry points: `main` when present (otherwise the first function), plus
    // every interrupt handler.
    let main = names
        .iter()
        .copied()
        .find(|n| *n == id("main"))
        .or_else(|| names.first().copied());
    let isr_entries: Vec<Id> = il
        .functions
        .iter()
        .filter(|f| f.isr)
        .map(|f| f.name)
        .collect();

    let mut contexts: Map<Id, ThreadContext> = Map::new();
    if let Some(main) = main {
        for f in reachable_from(main, &callees) {
            contexts.insert(f, ThreadContext::Main);
        }
    }
    for isr in &isr_entries {
        for f in reachable_from(*isr, &callees) {
            contexts
                .entry(f)
                .and_modify(|c| {
                    if *c == ThreadContext::Main {
                        *c = ThreadContext::Both;
                    }
                })
                .or_insert(ThreadContext::Isr);
        }
    }
    for name in &names {
        contexts.entry(*name).or_insert(ThreadContext::Main);
    }

    // Transitive callers, per function.
    let mut transitive_callers: Map<Id, Set<Id>> = Map::new();
    for name in &names {
        transitive_callers.insert(*name, reachable_from_excl(*name, &callers));
    }

    // Call-depth bound over the non-recursive subgraph (a DAG once the
    // recursion check passed).
    let mut depth: Map<Id, u32> = Map::new();
    let mut warnings = Vec::new();
    for name in &names {
        if recursive.contains(name) {
            continue;
        }
        let d = call_depth(*name, &callers, &recursive, &mut depth);
        if d > platform.call_depth_warning {
            warnings.push(Warning::DeepCallChain { func: *name, depth: d });
        }
    }

    debug!(
        "call graph: {} functions, {} recursive, {} isr entries",
        names.len(),
        recursive.len(),
        isr_entries.len()
    );

    Ok((
        CallGraph {
            callees,
            callers,
            transitive_callers,
            recursive,
            contexts,
            depth,
            address_taken,
            main,
        },
        warnings,
    ))
}

fn for_each_instruction(func: &Function, mut f: impl FnMut(&Instruction)) {
    for block in &func.blocks {
        for inst in &block.instructions {
            f(inst);
        }
    }
}

/// Everything reachable from `start` over `edges`, including `start`.
fn reachable_from(start: Id, edges: &Map<Id, Set<Id>>) -> Set<Id> {
    let mut seen = Set::new();
    let mut stack = vec![start];
    while let Some(f) = stack.pop() {
        if !seen.insert(f) {
            continue;
        }
        for next in edges.get(&f).into_iter().flatten() {
            stack.push(*next);
        }
    }
    seen
}

/// Everything reachable from `start` over `edges`, excluding `start` itself
/// unless a cycle brings it back.
fn reachable_from_excl(start: Id, edges: &Map<Id, Set<Id>>) -> Set<Id> {
    let mut seen = Set::new();
    let mut stack: Vec<Id> = edges.get(&start).into_iter().flatten().copied().collect();
    while let Some(f) = stack.pop() {
        if !seen.insert(f) {
            continue;
        }
        for next in edges.get(&f).into_iter().flatten() {
            stack.push(*next);
        }
    }
    seen
}

/// Longest caller chain above `f`, memoized.  Recursive callers are skipped;
/// their depth is unbounded and diagnosed separately.
fn call_depth(
    f: Id,
    callers: &Map<Id, Set<Id>>,
    recursive: &Set<Id>,
    memo: &mut Map<Id, u32>,
) -> u32 {
    if let Some(d) = memo.get(&f) {
        return *d;
    }
    // Mark before recursing; the graph is acyclic for non-recursive
    // functions, so this only guards against diagnostics-order surprises.
    memo.insert(f, 0);
    let mut best = 0;
    for caller in callers.get(&f).into_iter().flatten() {
        if recursive.contains(caller) {
            continue;
        }
        best = best.max(call_depth(*caller, callers, recursive, memo) + 1);
    }
    memo.insert(f, best);
    best
}

/// Tarjan's strongly connected components, in a deterministic order.
fn tarjan(names: &[Id], edges: &Map<Id, Set<Id>>) -> Vec<Vec<Id>> {
    struct State<'a> {
        edges: &'a Map<Id, Set<Id>>,
        index: Map<Id, u32>,
        lowlink: Map<Id, u32>,
        on_stack: Set<Id>,
        stack: Vec<Id>,
        next: u32,
        out: Vec<Vec<Id>>,
    }

    fn strongconnect(v: Id, st: &mut State) {
        st.index.insert(v, st.next);
        st.lowlink.insert(v, st.next);
        st.next += 1;
        st.stack.push(v);
        st.on_stack.insert(v);

        let succs: Vec<Id> = st.edges.get(&v).into_iter().flatten().copied().collect();
        for w in succs {
            if !st.index.contains_key(&w) {
                strongconnect(w, st);
                let low = st.lowlink[&v].min(st.lowlink[&w]);
                st.lowlink.insert(v, low);
            } else if st.on_stack.contains(&w) {
                let low = st.lowlink[&v].min(st.index[&w]);
                st.lowlink.insert(v, low);
            }
        }

        if st.lowlink[&v] == st.index[&v] {
            let mut scc = Vec::new();
            loop {
                let w = st.stack.pop().unwrap();
                st.on_stack.remove(&w);
                scc.push(w);
                if w == v {
                    break;
                }
            }
            scc.sort();
            st.out.push(scc);
        }
    }

    let mut st = State {
        edges,
        index: Map::new(),
        lowlink: Map::new(),
        on_stack: Set::new(),
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for name in names {
        if !st.index.contains_key(name) {
            strongconnect(*name, &mut st);
        }
    }
    st.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::ast::{self, Expr, Stmt, Ty};
    use crate::middle::lower;

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

    fn analyze_module(funcs: Vec<ast::FuncDecl>) -> Result<CallGraph, Vec<CompileError>> {
        let ast = ast::Module {
            name: id("test"),
            globals: vec![],
            maps: vec![],
            functions: funcs,
        };
        let il = lower::lower(&ast).unwrap();
        analyze(&il, &Platform::c64()).map(|(g, _)| g)
    }

    #[test]
    fn unflagged_self_call_is_rejected() {
        let err = analyze_module(vec![
            func("main", false, false, vec![call_stmt("spin")]),
            func("spin", false, false, vec![call_stmt("spin")]),
        ])
        .unwrap_err();
        match &err[0] {
            CompileError::IllegalRecursion { cycle, sites } => {
                assert_eq!(cycle, &vec![id("spin")]);
                assert_eq!(sites.len(), 1);
                assert_eq!(sites[0].caller, id("spin"));
                assert_eq!(sites[0].callee, id("spin"));
            }
            e => panic!("expected IllegalRecursion, got {e}"),
        }
    }

    #[test]
    fn flagged_self_call_is_recursive() {
        let g = analyze_module(vec![
            func("main", false, false, vec![call_stmt("spin")]),
            func("spin", true, false, vec![call_stmt("spin")]),
        ])
        .unwrap();
        assert!(g.is_recursive(id("spin")));
        assert!(!g.is_recursive(id("main")));
    }

    #[test]
    fn mutual_recursion_names_the_whole_cycle() {
        let err = analyze_module(vec![
            func("main", false, false, vec![call_stmt("ping")]),
            func("ping", true, false, vec![call_stmt("pong")]),
            func("pong", false, false, vec![call_stmt("ping")]),
        ])
        .unwrap_err();
        match &err[0] {
            CompileError::IllegalRecursion { cycle, sites } => {
                assert_eq!(cycle, &vec![id("ping"), id("pong")]);
                assert_eq!(sites.len(), 2);
            }
            e => panic!("expected IllegalRecursion, got {e}"),
        }
    }

    #[test]
    fn contexts_split_main_and_isr() {
        let g = analyze_module(vec![
            func("main", false, false, vec![call_stmt("work")]),
            func("work", false, false, vec![]),
            func("handler", false, true, vec![call_stmt("shared")]),
            func("shared", false, false, vec![]),
        ])
        .unwrap();
        assert_eq!(g.context(id("work")), ThreadContext::Main);
        assert_eq!(g.context(id("handler")), ThreadContext::Isr);
        assert_eq!(g.context(id("shared")), ThreadContext::Isr);
        assert_eq!(g.context(id("main")), ThreadContext::Main);
    }

    #[test]
    fn shared_helpers_are_both_contexts() {
        let g = analyze_module(vec![
            func("main", false, false, vec![call_stmt("shared")]),
            func("handler", false, true, vec![call_stmt("shared")]),
            func("shared", false, false, vec![]),
        ])
        .unwrap();
        assert_eq!(g.context(id("shared")), ThreadContext::Both);
    }

    #[test]
    fn transitive_callers_cross_levels() {
        let g = analyze_module(vec![
            func("main", false, false, vec![call_stmt("a")]),
            func("a", false, false, vec![call_stmt("b")]),
            func("b", false, false, vec![]),
        ])
        .unwrap();
        assert!(g.is_transitive_caller(id("main"), id("b")));
        assert!(g.is_transitive_caller(id("a"), id("b")));
        assert!(!g.is_transitive_caller(id("b"), id("a")));
        assert_eq!(g.depth[&id("b")], 2);
    }

    #[test]
    fn indirect_calls_use_signature_matching() {
        // main takes the address of `red` and calls through it; `blue` has
        // the same signature and is also address-taken, so both are targets.
        let sig = ast::Signature {
            params: vec![],
            ret: None,
        };
        let body = vec![
            Stmt::local(id("p"), Ty::Ptr, Expr::addr_of(id("red"))),
            Stmt::local(id("q"), Ty::Ptr, Expr::addr_of(id("blue"))),
            Stmt::Expr(Expr::call_indirect(
                Expr::var(id("p"), Ty::Ptr),
                sig,
                vec![],
            )),
        ];
        let g = analyze_module(vec![
            func("main", false, false, body),
            func("red", false, false, vec![]),
            func("blue", false, false, vec![]),
        ])
        .unwrap();
        assert!(g.callees[&id("main")].contains(&id("red")));
        assert!(g.callees[&id("main")].contains(&id("blue")));
    }
}
