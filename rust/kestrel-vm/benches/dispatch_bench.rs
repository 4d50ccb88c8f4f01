//! Criterion benchmarks for the instruction dispatcher.
//!
//! Measures a tight counted loop, and the same loop calling a function each
//! iteration so argument binding and instance setup are on the hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kestrel_core::image::opcode::Opcode;
use kestrel_core::image::{Image, ImageBuilder, ParamDecl};
use kestrel_core::{Value, VarType};
use kestrel_vm::{Vm, VmConfig};
use std::rc::Rc;

const V: VarType = VarType::Variant;

/// `Function Main(n): For i = 1 To n: s = s + <body>: Next: Main = s`, where
/// the body is `i` or `Twice(i)`.
fn summing_loop(call: bool) -> Image {
    let mut b = ImageBuilder::new("bench");
    b.procedure("Main", vec![ParamDecl::new("n", VarType::Long)], V, true);
    let (top, done) = (b.new_label(), b.new_label());
    b.stmnt(1).find("s", VarType::Long).const_int(0).op(Opcode::Set);
    b.stmnt(2)
        .find("i", VarType::Long)
        .const_int(1)
        .op2(Opcode::Param, 1, 0)
        .const_int(1)
        .op(Opcode::InitFor);
    b.bind(top).jump(Opcode::TestFor, done);
    b.stmnt(3).find("s", VarType::Long).find("s", VarType::Long);
    if call {
        b.op(Opcode::ArgC)
            .find("i", VarType::Long)
            .op(Opcode::ArgV)
            .find_args("Twice", V);
    } else {
        b.find("i", VarType::Long);
    }
    b.op(Opcode::Plus).op(Opcode::Set);
    b.stmnt(4).op(Opcode::Next).jump(Opcode::Jump, top);
    b.bind(done);
    b.stmnt(5).find("Main", V).find("s", V).op(Opcode::Set);
    b.op(Opcode::Leave);

    b.procedure("Twice", vec![ParamDecl::new("x", VarType::Long).by_val()], VarType::Long, true);
    b.stmnt(10)
        .find("Twice", V)
        .op2(Opcode::Param, 1, 0)
        .const_int(2)
        .op(Opcode::Mul)
        .op(Opcode::Set);
    b.op(Opcode::Leave);
    b.finish().expect("image assembles")
}

fn bench_loop(c: &mut Criterion, name: &str, call: bool) {
    let image = Rc::new(summing_loop(call));
    let mut group = c.benchmark_group(name);

    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut vm = Vm::new(Rc::clone(&image), VmConfig::default());
                let _ = vm.call_values(black_box("Main"), [Value::Long(size)]);
            });
        });
    }

    group.finish();
}

fn bench_counted_loop(c: &mut Criterion) {
    bench_loop(c, "counted_loop", false);
}

fn bench_call_per_iteration(c: &mut Criterion) {
    bench_loop(c, "call_per_iteration", true);
}

criterion_group!(benches, bench_counted_loop, bench_call_per_iteration);
criterion_main!(benches);
