use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, Criterion};
use jdbc_tracing::bytecode::opcodes::*;
use jdbc_tracing::classfile::{ClassFile, CodeAttribute, ACC_PUBLIC, ACC_SUPER};
use jdbc_tracing::config::CallbackLocator;
use jdbc_tracing::hierarchy::MethodSignature;
use jdbc_tracing::Rewriter;

const METHODS: usize = 32;

/// A connection-like class with `METHODS` small void methods and a constructor.
fn build_driver_class() -> (Vec<u8>, BTreeMap<MethodSignature, String>) {
    let mut class =
        ClassFile::new(ACC_PUBLIC | ACC_SUPER, "bench/Conn", Some("java/lang/Object"), &["java/sql/Connection"]).unwrap();
    let init = class.constant_pool.methodref("java/lang/Object", "<init>", "()V").unwrap();
    let [hi, lo] = init.to_be_bytes();
    class
        .add_method(ACC_PUBLIC, "<init>", "()V", Some(CodeAttribute::new(1, 1, vec![ALOAD_0, INVOKESPECIAL, hi, lo, RETURN])))
        .unwrap();

    let mut marks = BTreeMap::new();
    marks.insert(MethodSignature::new("<init>", "()V"), "bench/Conn".to_string());
    for i in 0..METHODS {
        let name = format!("call{i}");
        // iload_1; ifeq +4; return; return
        let code = vec![ILOAD_0 + 1, IFEQ, 0, 4, RETURN, RETURN];
        class.add_method(ACC_PUBLIC, &name, "(I)V", Some(CodeAttribute::new(1, 2, code))).unwrap();
        marks.insert(MethodSignature::new(name, "(I)V"), "java/sql/Connection".to_string());
    }
    (class.to_bytes().unwrap(), marks)
}

fn bench_rewrite(c: &mut Criterion) {
    let (bytes, marks) = build_driver_class();
    let locator = CallbackLocator::default();

    c.bench_function("classfile_parse_driver", |b| {
        b.iter(|| {
            let _ = ClassFile::parse(&bytes).unwrap();
        })
    });

    c.bench_function("rewrite_driver_class", |b| {
        b.iter(|| {
            let mut class = ClassFile::parse(&bytes).unwrap();
            Rewriter::new(&locator).rewrite_class(&mut class, &marks).unwrap();
            let _ = class.to_bytes().unwrap();
        })
    });
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);
