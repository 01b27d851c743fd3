//! the stage-dump binary.  the frontend is an external collaborator, so
//! this tool compiles one of several built-in sample programs (constructed
//! through the typed AST API) and prints the requested stage.
//!
//! run with `--help` for more info.

use blend65::{
    common::id,
    diag::SourceLoc,
    front::ast::*,
    platform::Platform,
};

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the sample program to compile
    #[arg(value_enum, default_value_t = Sample::Raster)]
    sample: Sample,
    /// the output stage
    #[arg(value_enum, short, long, default_value_t = Output::Asm)]
    out: Output,
    /// turn on the peephole cleanup pass
    #[arg(short = 'O', default_value_t = false)]
    optimize: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Sample {
    /// store to a memory-mapped VIC register
    Raster,
    /// three sibling tasks that share one coalesced frame
    Tasks,
    /// a counting loop with a header PHI
    Count,
    /// recursive factorial on the software stack
    Factorial,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the SSA IL
    Il,
    /// the call graph with contexts and depths
    Callgraph,
    /// the frame map after coalescing
    Frames,
    /// the zero-page placements
    Zp,
    /// the resulting 6502 assembly
    Asm,
}

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

fn module(name: &str, maps: Vec<MapDecl>, functions: Vec<FuncDecl>) -> Module {
    Module {
        name: id(name),
        globals: vec![],
        maps,
        functions,
    }
}

/// `@map border at $D020; for i in 0..16 { border = i }`
fn raster() -> Module {
    let border = MapDecl {
        name: id("border"),
        layout: MapLayout::Simple {
            addr: 0xD020,
            ty: Ty::U8,
        },
        loc: SourceLoc::synthetic(),
    };
    let body = vec![
        Stmt::For {
            var: id("i"),
            from: Expr::byte(0),
            to: Expr::byte(16),
            body: vec![Stmt::Assign {
                target: LValue::Map(id("border"), SourceLoc::synthetic()),
                value: Expr::var(id("i"), Ty::U8),
            }],
        },
        Stmt::Return(None),
    ];
    module("raster", vec![border], vec![func("main", vec![], None, body)])
}

/// Three sibling tasks called in sequence; their frames coalesce.
fn tasks() -> Module {
    let task = |name: &str| {
        func(
            name,
            vec![],
            None,
            vec![
                Stmt::Let {
                    name: id("scratch"),
                    ty: Ty::array(Ty::U8, 4),
                    zp: ZpMode::None,
                    init: None,
                    loc: SourceLoc::synthetic(),
                },
                Stmt::Assign {
                    target: LValue::Index {
                        name: id("scratch"),
                        index: Box::new(Expr::byte(0)),
                    },
                    value: Expr::byte(1),
                },
                Stmt::Return(None),
            ],
        )
    };
    let main = func(
        "main",
        vec![],
        None,
        vec![
            Stmt::Expr(Expr::call(id("init"), vec![], Ty::U8)),
            Stmt::Expr(Expr::call(id("update"), vec![], Ty::U8)),
            Stmt::Expr(Expr::call(id("render"), vec![], Ty::U8)),
            Stmt::Return(None),
        ],
    );
    module(
        "tasks",
        vec![],
        vec![main, task("init"), task("update"), task("render")],
    )
}

/// `i = 0; while (i < 10) i = i + 1; return i`
fn count() -> Module {
    let body = vec![
        Stmt::local(id("i"), Ty::U8, Expr::byte(0)),
        Stmt::While {
            cond: Expr::compare(CmpOp::Lt, Expr::var(id("i"), Ty::U8), Expr::byte(10)),
            body: vec![Stmt::assign_var(
                id("i"),
                Expr::binary(BinOp::Add, Expr::var(id("i"), Ty::U8), Expr::byte(1)),
            )],
        },
        Stmt::Return(Some(Expr::var(id("i"), Ty::U8))),
    ];
    module("count", vec![], vec![func("main", vec![], Some(Ty::U8), body)])
}

/// Classic factorial with the explicit recursion opt-in.
fn factorial() -> Module {
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
    let main = func(
        "main",
        vec![],
        None,
        vec![
            Stmt::Expr(Expr::call(id("fact"), vec![Expr::byte(5)], Ty::U8)),
            Stmt::Return(None),
        ],
    );
    module("factorial", vec![], vec![main, fact])
}

fn main() {
    use Output::*;
    env_logger::init();
    let args = Args::parse();

    let module = match args.sample {
        Sample::Raster => raster(),
        Sample::Tasks => tasks(),
        Sample::Count => count(),
        Sample::Factorial => factorial(),
    };

    match blend65::compile(&module, &Platform::c64(), args.optimize) {
        Ok(output) => {
            for warning in &output.warnings {
                eprintln!("warning: {warning}");
            }
            match args.out {
                Il => println!("{}", output.il),
                Callgraph => println!("{}", output.call_graph),
                Frames => println!("{}", output.frame_map),
                Zp => println!("{}", output.zp_map),
                Asm => println!("{}", output.asm),
            }
        }
        Err(errors) => {
            for error in errors {
                eprintln!("error: {error}");
            }
            std::process::exit(1);
        }
    }
}
