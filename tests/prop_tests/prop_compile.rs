use binquery::compile_filter_program;
use binquery::qualifier::{FieldQualifier, FilterOperation};
use binquery::store::script::Script;
use bson::{Bson, doc};
use proptest::prelude::*;

fn config() -> ProptestConfig {
    ProptestConfig {
        failure_persistence: Some(Box::new(
            proptest::test_runner::FileFailurePersistence::WithSource("proptest-regressions"),
        )),
        cases: 128,
        ..ProptestConfig::default()
    }
}

fn selects(q: &FieldQualifier, bins: &bson::Document) -> Option<bool> {
    let program = compile_filter_program([q]).ok()??;
    let script = Script::parse(program.as_str()).unwrap();
    Some(script.selects(bins).unwrap_or(false))
}

fn int_op() -> impl Strategy<Value = FilterOperation> {
    prop_oneof![
        Just(FilterOperation::Eq),
        Just(FilterOperation::NotEq),
        Just(FilterOperation::Gt),
        Just(FilterOperation::GtEq),
        Just(FilterOperation::Lt),
        Just(FilterOperation::LtEq),
    ]
}

fn str_op() -> impl Strategy<Value = FilterOperation> {
    prop_oneof![
        Just(FilterOperation::Eq),
        Just(FilterOperation::NotEq),
        Just(FilterOperation::Lt),
        Just(FilterOperation::GtEq),
        Just(FilterOperation::StartWith),
        Just(FilterOperation::EndsWith),
    ]
}

fn text() -> impl Strategy<Value = String> {
    "[a-c' ]{0,4}"
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn compilation_is_deterministic(
        fields in proptest::collection::vec(("[a-z][a-z0-9_]{0,6}", int_op(), any::<i64>()), 0..6)
    ) {
        let quals: Vec<FieldQualifier> = fields
            .iter()
            .map(|(f, op, v)| FieldQualifier::new(f.clone(), *op, *v, None).unwrap())
            .filter(|q| compile_filter_program([q]).is_ok())
            .collect();
        let a = compile_filter_program(&quals).unwrap();
        let b = compile_filter_program(&quals).unwrap();
        prop_assert_eq!(a.as_ref().map(|p| p.as_str()), b.as_ref().map(|p| p.as_str()));
        prop_assert_eq!(a.is_none(), quals.is_empty());
    }

    #[test]
    fn eq_selects_exactly_the_equal_value(v in any::<i64>(), other in any::<i64>(), s in text()) {
        let q = FieldQualifier::new("f", FilterOperation::Eq, v, None).unwrap();
        prop_assert_eq!(selects(&q, &doc! {"f": v}), Some(true));
        prop_assert_eq!(selects(&q, &doc! {"f": other}), Some(other == v));

        let qs = FieldQualifier::new("f", FilterOperation::Eq, s.clone(), None).unwrap();
        prop_assert_eq!(selects(&qs, &doc! {"f": s.clone()}), Some(true));
        prop_assert_eq!(selects(&qs, &doc! {"f": format!("{s}x")}), Some(false));
    }

    #[test]
    fn between_respects_both_bounds(lo in -50_i64..50, span in 0_i64..20, x in -80_i64..80) {
        let hi = lo + span;
        let q = FieldQualifier::new("age", FilterOperation::Between, lo, Some(Bson::Int64(hi))).unwrap();
        prop_assert_eq!(selects(&q, &doc! {"age": x}), Some(lo <= x && x <= hi));
    }

    #[test]
    fn program_agrees_with_client_side_match_on_ints(
        op in int_op(),
        v in -5_i64..5,
        actual in proptest::option::of(-5_i64..5),
    ) {
        let q = FieldQualifier::new("n", op, v, None).unwrap();
        let bins = actual.map_or_else(bson::Document::new, |a| doc! {"n": a});
        prop_assert_eq!(selects(&q, &bins), Some(q.matches(&bins)));
    }

    #[test]
    fn program_agrees_with_client_side_match_on_strings(
        op in str_op(),
        v in text(),
        actual in proptest::option::of(text()),
    ) {
        let q = FieldQualifier::new("name", op, v, None).unwrap();
        let bins = actual.map_or_else(bson::Document::new, |a| doc! {"name": a});
        prop_assert_eq!(selects(&q, &bins), Some(q.matches(&bins)));
    }
}

#[test]
fn eq_at_integer_extremes() {
    for (v, neighbour) in [(i64::MIN, i64::MIN + 1), (i64::MAX, i64::MAX - 1)] {
        let q = FieldQualifier::new("f", FilterOperation::Eq, v, None).unwrap();
        assert_eq!(selects(&q, &doc! {"f": v}), Some(true));
        assert_eq!(selects(&q, &doc! {"f": neighbour}), Some(false));
        assert!(!q.matches(&doc! {"f": neighbour}));
    }
}
