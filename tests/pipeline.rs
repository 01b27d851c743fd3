//! End-to-end scenarios over the public pipeline API.

use blend65::back::asm::{self, Addr, Inst, Mnemonic, Operand};
use blend65::back::peephole;
use blend65::common::id;
use blend65::diag::{CompileError, SourceLoc};
use blend65::front::ast::*;
use blend65::platform::Platform;
use blend65::{compile, CompileOutput};

fn func(name: &str, params: Vec<(&str, Ty)>, ret: Option<Ty>, body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
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

fn module(maps: Vec<MapDecl>, functions: Vec<FuncDecl>) -> Module {
    Module {
        name: id("test"),
        globals: vec![],
        maps,
        functions,
    }
}

fn build(maps: Vec<MapDecl>, functions: Vec<FuncDecl>) -> CompileOutput {
    compile(&module(maps, functions), &Platform::c64(), true).unwrap()
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

fn asm_function<'m>(m: &'m asm::Module, name: &str) -> &'m asm::Function {
    m.functions.iter().find(|f| f.name == id(name)).unwrap()
}

fn four_byte_frame() -> Vec<Stmt> {
    vec![
        Stmt::Let {
            name: id("buf"),
            ty: Ty::array(Ty::U8, 4),
            zp: ZpMode::None,
            init: None,
            loc: SourceLoc::synthetic(),
        },
        Stmt::Return(None),
    ]
}

fn call_stmt(name: &str) -> Stmt {
    Stmt::Expr(Expr::call(id(name), vec![], Ty::U8))
}

// Scenario A: siblings coalesce, their caller does not, and the footprint
// is one frame rather than three.
#[test]
fn scenario_a_coalescing_saves_memory() {
    let out = build(
        vec![],
        vec![
            func(
                "main",
                vec![],
                None,
                vec![call_stmt("init"), call_stmt("update"), call_stmt("render")],
            ),
            func("init", vec![], None, four_byte_frame()),
            func("update", vec![], None, four_byte_frame()),
            func("render", vec![], None, four_byte_frame()),
        ],
    );
    let frames = &out.frame_map;
    let group = |n: &str| frames.frames[&id(n)].group.unwrap();
    assert_eq!(group("init"), group("update"));
    assert_eq!(group("update"), group("render"));
    assert_ne!(group("main"), group("init"));

    // Shared memory: all three at the same base, so the total static
    // footprint is main's frame plus four bytes, not twelve.
    let bases: Vec<u16> = ["init", "update", "render"]
        .iter()
        .map(|n| frames.frames[&id(*n)].base)
        .collect();
    assert!(bases.windows(2).all(|w| w[0] == w[1]));
    let total: u16 = frames
        .groups
        .iter()
        .map(|members| {
            members
                .iter()
                .map(|m| frames.frames[m].size)
                .max()
                .unwrap_or(0)
        })
        .sum();
    let main_size = frames.frames[&id("main")].size;
    assert_eq!(total, main_size + 4);
}

// Scenario B: a caller and its callee never share memory.
#[test]
fn scenario_b_caller_callee_never_coalesce() {
    let out = build(
        vec![],
        vec![
            func("a", vec![], None, {
                let mut b = four_byte_frame();
                b.insert(0, call_stmt("b"));
                b
            }),
            func("b", vec![], None, four_byte_frame()),
        ],
    );
    let a = &out.frame_map.frames[&id("a")];
    let b = &out.frame_map.frames[&id("b")];
    assert_ne!(a.group, b.group);
    assert!(a.base + a.size <= b.base || b.base + b.size <= a.base);
}

// Scenario C: an interrupt handler never shares memory with main code,
// even without any call relation.
#[test]
fn scenario_c_isr_and_main_never_coalesce() {
    let mut handler = func("handler", vec![], None, four_byte_frame());
    handler.isr = true;
    let out = build(
        vec![],
        vec![
            func("main", vec![], None, vec![call_stmt("tick")]),
            func("tick", vec![], None, four_byte_frame()),
            handler,
        ],
    );
    assert_ne!(
        out.frame_map.frames[&id("tick")].group,
        out.frame_map.frames[&id("handler")].group
    );
}

// Scenario D: a recursive function gets a software-stack frame and the
// call site brackets the JSR with stack-pointer adjustment.
#[test]
fn scenario_d_recursion_uses_the_software_stack() {
    let n = || Expr::var(id("n"), Ty::U8);
    let mut fact = func(
        "fact",
        vec![("n", Ty::U8)],
        Some(Ty::U8),
        vec![Stmt::If {
            cond: Expr::compare(CmpOp::Eq, n(), Expr::byte(0)),
            then_body: vec![Stmt::Return(Some(Expr::byte(1)))],
            else_body: vec![Stmt::Return(Some(Expr::binary(
                BinOp::Mul,
                n(),
                Expr::call(
                    id("fact"),
                    vec![Expr::binary(BinOp::Sub, n(), Expr::byte(1))],
                    Ty::U8,
                ),
            )))],
        }],
    );
    fact.recursive = true;
    let out = build(
        vec![],
        vec![
            func(
                "main",
                vec![],
                None,
                vec![
                    Stmt::Expr(Expr::call(id("fact"), vec![Expr::byte(5)], Ty::U8)),
                    Stmt::Return(None),
                ],
            ),
            fact,
        ],
    );

    let fact_frame = &out.frame_map.frames[&id("fact")];
    assert!(fact_frame.recursive);
    assert!(fact_frame.group.is_none());
    assert!(out.frame_map.software_sp.is_some());

    let main_ops: Vec<(Mnemonic, Operand)> = asm_function(&out.asm, "main")
        .blocks
        .iter()
        .flat_map(|b| ops(b))
        .collect();
    let jsr = main_ops
        .iter()
        .position(|(mn, op)| *mn == Mnemonic::Jsr && *op == Operand::Label(id("fact")))
        .unwrap();
    let dec = main_ops
        .iter()
        .position(|(mn, _)| *mn == Mnemonic::Sbc)
        .unwrap();
    let inc = main_ops
        .iter()
        .position(|(mn, _)| *mn == Mnemonic::Adc)
        .unwrap();
    assert!(dec < jsr && jsr < inc);
}

// Scenario E: the if/else PHI resolves to stores into the merge home in
// the predecessors, with no placeholder zero loads in the diamond.
#[test]
fn scenario_e_phi_through_if_else() {
    let out = build(
        vec![],
        vec![func(
            "pick",
            vec![("c", Ty::I1)],
            Some(Ty::U8),
            vec![
                Stmt::local(id("x"), Ty::U8, Expr::byte(0)),
                Stmt::If {
                    cond: Expr::var(id("c"), Ty::I1),
                    then_body: vec![Stmt::assign_var(id("x"), Expr::byte(10))],
                    else_body: vec![Stmt::assign_var(id("x"), Expr::byte(20))],
                },
                Stmt::Return(Some(Expr::var(id("x"), Ty::U8))),
            ],
        )],
    );
    let f = asm_function(&out.asm, "pick");

    let arm = |imm: u8| {
        f.blocks
            .iter()
            .find(|b| ops(b).contains(&(Mnemonic::Lda, Operand::Imm(imm))))
            .unwrap()
    };
    let then_ops = ops(arm(10));
    let else_ops = ops(arm(20));
    let merge_ops = ops(f.blocks.last().unwrap());

    // Each arm: load the constant, store it into the merge home, jump.
    for arm_ops in [&then_ops, &else_ops] {
        assert!(arm_ops
            .iter()
            .any(|(mn, op)| *mn == Mnemonic::Sta && matches!(op, Operand::Abs(_))));
        assert_eq!(arm_ops.last().unwrap().0, Mnemonic::Jmp);
        assert!(!arm_ops.contains(&(Mnemonic::Lda, Operand::Imm(0))));
    }
    // Both arms store to the same home, and the merge reads it back.
    let store_of = |arm_ops: &[(Mnemonic, Operand)]| {
        arm_ops
            .iter()
            .find(|(mn, _)| *mn == Mnemonic::Sta)
            .unwrap()
            .1
            .clone()
    };
    let home = store_of(&then_ops);
    assert_eq!(home, store_of(&else_ops));
    assert_eq!(merge_ops[0], (Mnemonic::Lda, home));
    assert_eq!(merge_ops.last().unwrap().0, Mnemonic::Rts);
}

// Scenario F: a simple @map store is exactly a load and one absolute
// store, nothing else.
#[test]
fn scenario_f_map_store_is_zero_overhead() {
    let border = MapDecl {
        name: id("border"),
        layout: MapLayout::Simple {
            addr: 0xD020,
            ty: Ty::U8,
        },
        loc: SourceLoc::synthetic(),
    };
    let out = build(
        vec![border],
        vec![func(
            "main",
            vec![],
            None,
            vec![
                Stmt::Assign {
                    target: LValue::Map(id("border"), SourceLoc::synthetic()),
                    value: Expr::byte(5),
                },
                Stmt::Return(None),
            ],
        )],
    );
    let f = asm_function(&out.asm, "main");
    assert_eq!(
        ops(&f.blocks[0]),
        vec![
            (Mnemonic::Lda, Operand::Imm(5)),
            (Mnemonic::Sta, Operand::Abs(Addr::Num(0xD020))),
            (Mnemonic::Rts, Operand::Implied),
        ]
    );
}

#[test]
fn empty_function_lowers_to_rts() {
    let out = build(vec![], vec![func("nop", vec![], None, vec![])]);
    let f = asm_function(&out.asm, "nop");
    assert_eq!(ops(&f.blocks[0]), vec![(Mnemonic::Rts, Operand::Implied)]);
}

#[test]
fn map_touching_the_last_byte_is_accepted() {
    let tail = MapDecl {
        name: id("tail"),
        layout: MapLayout::Explicit {
            fields: vec![(id("last"), 0xFFFF, Ty::U8)],
        },
        loc: SourceLoc::synthetic(),
    };
    build(vec![tail], vec![func("main", vec![], None, vec![])]);
}

#[test]
fn map_overrunning_the_address_space_is_rejected() {
    let tail = MapDecl {
        name: id("tail"),
        layout: MapLayout::Explicit {
            fields: vec![(id("last"), 0xFFFF, Ty::U16)],
        },
        loc: SourceLoc::synthetic(),
    };
    let err = compile(
        &module(vec![tail], vec![func("main", vec![], None, vec![])]),
        &Platform::c64(),
        false,
    )
    .unwrap_err();
    assert!(matches!(err[0], CompileError::MapOutOfRange { .. }));
}

#[test]
fn overlapping_maps_are_rejected() {
    let a = MapDecl {
        name: id("vic"),
        layout: MapLayout::Range {
            base: 0xD000,
            len: 47,
            elem: Ty::U8,
        },
        loc: SourceLoc::synthetic(),
    };
    let b = MapDecl {
        name: id("sprite0"),
        layout: MapLayout::Simple {
            addr: 0xD015,
            ty: Ty::U8,
        },
        loc: SourceLoc::synthetic(),
    };
    let err = compile(
        &module(vec![a, b], vec![func("main", vec![], None, vec![])]),
        &Platform::c64(),
        false,
    )
    .unwrap_err();
    match &err[0] {
        CompileError::MapOverlap { first, second } => {
            assert_eq!(*first, id("vic"));
            assert_eq!(*second, id("sprite0"));
        }
        e => panic!("expected MapOverlap, got {e}"),
    }
}

#[test]
fn unflagged_self_recursion_names_the_call_site() {
    let spin = func(
        "spin",
        vec![],
        None,
        vec![Stmt::Expr(
            Expr::call(id("spin"), vec![], Ty::U8).at(SourceLoc::new(4, 9)),
        )],
    );
    let err = compile(
        &module(vec![], vec![func("main", vec![], None, vec![call_stmt("spin")]), spin]),
        &Platform::c64(),
        false,
    )
    .unwrap_err();
    let text = err[0].to_string();
    assert!(text.contains("spin"));
    assert!(text.contains("4:9"));
}

#[test]
fn peephole_is_idempotent_on_real_output() {
    let out = build(
        vec![],
        vec![func(
            "main",
            vec![],
            Some(Ty::U8),
            vec![
                Stmt::local(id("a"), Ty::U8, Expr::byte(1)),
                Stmt::local(id("b"), Ty::U8, Expr::byte(2)),
                Stmt::Return(Some(Expr::binary(
                    BinOp::Add,
                    Expr::var(id("a"), Ty::U8),
                    Expr::var(id("b"), Ty::U8),
                ))),
            ],
        )],
    );
    let again = peephole::optimize(out.asm.clone());
    assert_eq!(out.asm.to_string(), again.to_string());
}

#[test]
fn compilation_is_deterministic() {
    let build_text = || {
        let out = build(
            vec![],
            vec![
                func(
                    "main",
                    vec![],
                    None,
                    vec![call_stmt("init"), call_stmt("render")],
                ),
                func("init", vec![], None, four_byte_frame()),
                func("render", vec![], None, four_byte_frame()),
            ],
        );
        format!("{}\n{}\n{}", out.asm, out.frame_map, out.zp_map)
    };
    assert_eq!(build_text(), build_text());
}

#[test]
fn warnings_accumulate_for_large_frames() {
    let out = build(
        vec![],
        vec![func(
            "main",
            vec![],
            None,
            vec![
                Stmt::Let {
                    name: id("big"),
                    ty: Ty::array(Ty::U8, 100),
                    zp: ZpMode::None,
                    init: None,
                    loc: SourceLoc::synthetic(),
                },
                Stmt::Return(None),
            ],
        )],
    );
    assert!(out
        .warnings
        .iter()
        .any(|w| matches!(w, blend65::diag::Warning::LargeFrame { .. })));
}
