use jdbc_tracing::bytecode::opcodes::{ALOAD, DLOAD, ILOAD, LLOAD};
use jdbc_tracing::descriptor::{FieldType, MethodType};

#[test]
fn parses_method_descriptors() {
    let ty = MethodType::parse("(IJLjava/lang/String;[[DZ)Ljava/sql/ResultSet;").unwrap();
    assert_eq!(
        ty.params,
        vec![
            FieldType::Int,
            FieldType::Long,
            FieldType::Object("java/lang/String".into()),
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Double)))),
            FieldType::Boolean,
        ]
    );
    assert_eq!(ty.ret, Some(FieldType::Object("java/sql/ResultSet".into())));
    assert_eq!(ty.param_slots(), 1 + 2 + 1 + 1 + 1);
    assert!(!ty.is_void());
    assert_eq!(ty.to_string(), "(IJLjava/lang/String;[[DZ)Ljava/sql/ResultSet;");
}

#[test]
fn void_return() {
    let ty = MethodType::parse("()V").unwrap();
    assert!(ty.params.is_empty());
    assert!(ty.is_void());
    assert_eq!(MethodType::new(vec![FieldType::Double], None).to_string(), "(D)V");
}

#[test]
fn rejects_malformed_descriptors() {
    for bad in ["", "I", "(I", "(Q)V", "(Ljava/lang/String)V", "(L;)V", "()", "()VV", "(I)[", "()L;"] {
        assert!(MethodType::parse(bad).is_err(), "{bad} should not parse");
    }
    assert!(FieldType::parse("II").is_err());
    assert!(FieldType::parse("V").is_err());
}

#[test]
fn slot_and_opcode_properties() {
    assert_eq!(FieldType::Long.slots(), 2);
    assert_eq!(FieldType::Double.slots(), 2);
    assert_eq!(FieldType::Object("a/B".into()).slots(), 1);

    assert_eq!(FieldType::Boolean.load_opcode(), ILOAD);
    assert_eq!(FieldType::Long.load_opcode(), LLOAD);
    assert_eq!(FieldType::Double.load_opcode(), DLOAD);
    assert_eq!(FieldType::parse("[I").unwrap().load_opcode(), ALOAD);
}

#[test]
fn boxing_targets() {
    assert_eq!(FieldType::Double.boxing(), Some(("java/lang/Double", "(D)Ljava/lang/Double;")));
    assert_eq!(FieldType::Char.boxing(), Some(("java/lang/Character", "(C)Ljava/lang/Character;")));
    assert_eq!(FieldType::Object("java/lang/Double".into()).boxing(), None);
    assert!(FieldType::Boolean.is_primitive());
    assert!(!FieldType::parse("[Z").unwrap().is_primitive());
}

#[test]
fn class_names_for_constant_pool() {
    assert_eq!(FieldType::parse("Ljava/lang/Object;").unwrap().class_name().as_deref(), Some("java/lang/Object"));
    assert_eq!(FieldType::parse("[Ljava/lang/Object;").unwrap().class_name().as_deref(), Some("[Ljava/lang/Object;"));
    assert_eq!(FieldType::Int.class_name(), None);
}
