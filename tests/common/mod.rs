//! Hand-built class files shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;

use jdbc_tracing::bytecode::opcodes::*;
use jdbc_tracing::classfile::{
    ClassFile, CodeAttribute, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ACC_SUPER,
};
use jdbc_tracing::families::*;
use jdbc_tracing::hierarchy::{ClassDescriptor, Hierarchy, OBJECT};

pub const RESULT_SET: &str = "java/sql/ResultSet";

/// Builder over `ClassFile` that keeps test bodies short.
pub struct ClassBuilder {
    pub class: ClassFile,
    super_name: String,
}

impl ClassBuilder {
    pub fn class(name: &str, super_name: &str, interfaces: &[&str]) -> Self {
        let class = ClassFile::new(ACC_PUBLIC | ACC_SUPER, name, Some(super_name), interfaces).unwrap();
        Self { class, super_name: super_name.to_string() }
    }

    pub fn abstract_class(name: &str, super_name: &str, interfaces: &[&str]) -> Self {
        let class =
            ClassFile::new(ACC_PUBLIC | ACC_SUPER | ACC_ABSTRACT, name, Some(super_name), interfaces).unwrap();
        Self { class, super_name: super_name.to_string() }
    }

    pub fn interface(name: &str, interfaces: &[&str]) -> Self {
        let class =
            ClassFile::new(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT, name, Some(OBJECT), interfaces).unwrap();
        Self { class, super_name: OBJECT.to_string() }
    }

    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> Self {
        self.class.add_method(ACC_PUBLIC | ACC_ABSTRACT, name, descriptor, None).unwrap();
        self
    }

    pub fn method(mut self, access: u16, name: &str, descriptor: &str, code: CodeAttribute) -> Self {
        self.class.add_method(access, name, descriptor, Some(code)).unwrap();
        self
    }

    /// `aload_0; invokespecial super.<init>()V; return`
    pub fn default_constructor(mut self) -> Self {
        let init = self.class.constant_pool.methodref(&self.super_name, "<init>", "()V").unwrap();
        let [hi, lo] = init.to_be_bytes();
        let code = CodeAttribute::new(1, 1, vec![ALOAD_0, INVOKESPECIAL, hi, lo, RETURN]);
        self.method(ACC_PUBLIC, "<init>", "()V", code)
    }

    /// A public method whose body just returns the default value of its
    /// return type.
    pub fn trivial_method(self, name: &str, descriptor: &str) -> Self {
        let ret = &descriptor[descriptor.find(')').unwrap() + 1..];
        let body = match ret {
            "V" => vec![RETURN],
            "J" => vec![0x09, LRETURN],
            "D" => vec![0x0e, DRETURN],
            "F" => vec![0x0b, FRETURN],
            "I" | "Z" | "B" | "C" | "S" => vec![ICONST_0, IRETURN],
            _ => vec![ACONST_NULL, ARETURN],
        };
        let params: u16 = jdbc_tracing::descriptor::MethodType::parse(descriptor).unwrap().param_slots();
        let code = CodeAttribute::new(2, params + 1, body);
        self.method(ACC_PUBLIC, name, descriptor, code)
    }

    pub fn build(self) -> ClassFile {
        self.class
    }

    pub fn bytes(self) -> Vec<u8> {
        self.class.to_bytes().unwrap()
    }

    pub fn descriptor(&self) -> ClassDescriptor {
        ClassDescriptor::from_class_file(&self.class).unwrap()
    }
}

pub fn object_stub() -> ClassFile {
    let mut object = ClassFile::new(ACC_PUBLIC | ACC_SUPER, OBJECT, None, &[]).unwrap();
    object.add_method(ACC_PUBLIC, "<init>", "()V", Some(CodeAttribute::new(0, 1, vec![RETURN]))).unwrap();
    object
        .add_method(ACC_PUBLIC, "toString", "()Ljava/lang/String;", Some(CodeAttribute::new(1, 1, vec![ACONST_NULL, ARETURN])))
        .unwrap();
    object.add_method(ACC_PUBLIC, "hashCode", "()I", Some(CodeAttribute::new(1, 1, vec![ICONST_0, IRETURN]))).unwrap();
    object
}

/// The platform types of the six families, trimmed to a few methods each.
pub fn jdbc_stub_classes() -> Vec<ClassFile> {
    vec![
        object_stub(),
        ClassBuilder::interface(DATA_SOURCE, &[])
            .abstract_method("getConnection", "()Ljava/sql/Connection;")
            .abstract_method("getConnection", "(Ljava/lang/String;Ljava/lang/String;)Ljava/sql/Connection;")
            .build(),
        ClassBuilder::interface(XA_DATA_SOURCE, &[])
            .abstract_method("getXAConnection", "()Ljavax/sql/XAConnection;")
            .build(),
        ClassBuilder::interface(CONNECTION, &[])
            .abstract_method("createStatement", "()Ljava/sql/Statement;")
            .abstract_method("prepareStatement", "(Ljava/lang/String;)Ljava/sql/PreparedStatement;")
            .abstract_method("close", "()V")
            .build(),
        ClassBuilder::interface(STATEMENT, &[])
            .abstract_method("executeQuery", "(Ljava/lang/String;)Ljava/sql/ResultSet;")
            .abstract_method("close", "()V")
            .build(),
        ClassBuilder::interface(PREPARED_STATEMENT, &[STATEMENT])
            .abstract_method("executeQuery", "()Ljava/sql/ResultSet;")
            .abstract_method("setDouble", "(ID)V")
            .build(),
        ClassBuilder::interface(CALLABLE_STATEMENT, &[PREPARED_STATEMENT])
            .abstract_method("getDouble", "(I)D")
            .build(),
        ClassBuilder::interface(POOLED_CONNECTION, &[])
            .abstract_method("getConnection", "()Ljava/sql/Connection;")
            .abstract_method("close", "()V")
            .build(),
        ClassBuilder::interface(XA_CONNECTION, &[POOLED_CONNECTION])
            .abstract_method("getXAResource", "()Ljavax/transaction/xa/XAResource;")
            .build(),
        ClassBuilder::interface(INVOCATION_HANDLER, &[])
            .abstract_method(
                "invoke",
                "(Ljava/lang/Object;Ljava/lang/reflect/Method;[Ljava/lang/Object;)Ljava/lang/Object;",
            )
            .build(),
        ClassBuilder::interface(XA_RESOURCE, &[])
            .abstract_method("commit", "(Ljavax/transaction/xa/Xid;Z)V")
            .build(),
    ]
}

/// Stub source keyed by type name.
pub fn jdbc_stubs() -> HashMap<String, Vec<u8>> {
    jdbc_stub_classes()
        .into_iter()
        .map(|c| (c.name().unwrap().to_string(), c.to_bytes().unwrap()))
        .collect()
}

/// Hierarchy holding the platform stubs as library classes.
pub fn library_hierarchy() -> Hierarchy {
    let mut hierarchy = Hierarchy::new();
    for class in jdbc_stub_classes() {
        hierarchy.add_library(ClassDescriptor::from_class_file(&class).unwrap()).unwrap();
    }
    hierarchy
}

pub fn add_app(hierarchy: &mut Hierarchy, builder: &ClassBuilder) {
    hierarchy.add(builder.descriptor()).unwrap();
}

pub fn module_name(class: &ClassFile) -> String {
    format!("{}.class", class.name().unwrap())
}
