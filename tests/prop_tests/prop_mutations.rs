use binquery::store::memory::MemoryStore;
use binquery::{Bin, QueryEngine, Qualifier, Statement};
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: Some(Box::new(
            proptest::test_runner::FileFailurePersistence::WithSource("proptest-regressions"),
        )),
        cases: 24,
        ..ProptestConfig::default()
    })]

    #[test]
    fn write_never_exceeds_read(
        colors in proptest::collection::vec(0_u8..3, 0..30),
        every in 1_usize..5,
        delete in any::<bool>(),
    ) {
        let store = Arc::new(MemoryStore::new(&["n1"]).with_namespace("test"));
        let engine = QueryEngine::connect(store.clone()).unwrap();
        for (i, c) in colors.iter().enumerate() {
            engine.insert("test", Some("s"), format!("k{i}"), &[Bin::new("c", i64::from(*c))]).unwrap();
        }
        let expected = colors.iter().filter(|c| **c == 1).count();

        let seen = Arc::new(AtomicUsize::new(0));
        let touched = Arc::new(AtomicUsize::new(0));
        let (seen_h, touched_h) = (Arc::clone(&seen), Arc::clone(&touched));
        store.set_write_hook(move |s, key| {
            if seen_h.fetch_add(1, Ordering::SeqCst) % every == 0 && s.touch(key).is_ok() {
                touched_h.fetch_add(1, Ordering::SeqCst);
            }
        });

        let stmt = Statement::new("test", Some("s"));
        let quals = [Qualifier::eq("c", 1).unwrap()];
        let report = if delete {
            engine.delete(&stmt, &quals).unwrap()
        } else {
            engine.update(&stmt, &[Bin::new("seen", true)], &quals).unwrap()
        };
        store.clear_write_hook();

        prop_assert!(report.write <= report.read);
        prop_assert_eq!(report.read, expected as u64);
        if delete {
            // deletes are unguarded, a concurrent touch does not stop them
            prop_assert_eq!(report.write, report.read);
        } else {
            prop_assert_eq!(report.write + touched.load(Ordering::SeqCst) as u64, report.read);
        }
    }
}
