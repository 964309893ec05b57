#![no_main]
use arbitrary::Arbitrary;
use binquery::compile_filter_program;
use binquery::qualifier::{FieldQualifier, FilterOperation};
use binquery::store::script::Script;
use bson::Bson;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Flag(bool),
}

impl From<Value> for Bson {
    fn from(v: Value) -> Self {
        match v {
            Value::Int(i) => Bson::Int64(i),
            Value::Float(f) => Bson::Double(f),
            Value::Text(s) => Bson::String(s),
            Value::Flag(b) => Bson::Boolean(b),
        }
    }
}

#[derive(Debug, Arbitrary)]
struct Input {
    field: String,
    op: u8,
    low: Value,
    high: Value,
    actual: Value,
}

const OPS: [FilterOperation; 9] = [
    FilterOperation::Eq,
    FilterOperation::NotEq,
    FilterOperation::Gt,
    FilterOperation::GtEq,
    FilterOperation::Lt,
    FilterOperation::LtEq,
    FilterOperation::Between,
    FilterOperation::StartWith,
    FilterOperation::EndsWith,
];

fuzz_target!(|input: Input| {
    let op = OPS[usize::from(input.op) % OPS.len()];
    let high = (op == FilterOperation::Between).then(|| Bson::from(input.high));
    let Ok(q) = FieldQualifier::new(input.field.clone(), op, input.low, high) else { return };
    // Whatever the compiler accepts must parse and evaluate without panicking
    if let Ok(Some(program)) = compile_filter_program([&q]) {
        let script = Script::parse(program.as_str()).expect("compiled program must parse");
        let mut bins = bson::Document::new();
        bins.insert(input.field, Bson::from(input.actual));
        let _ = script.selects(&bins);
    }
});
