//! Property-based tests for the quantified VM invariants: the push/pop
//! ledger, table round-trips, and pool slot accounting.

use proptest::prelude::*;

use ferrule::{Table, Value, Vm};

/// Generate a sequence of stack operations: `true` pushes, `false` pops.
fn arb_ops() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..64)
}

fn arb_key() -> impl Strategy<Value = i64> {
    -8i64..8i64
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Stack size always equals pushes minus pops (pops on an empty
    /// stack are absorbed).
    #[test]
    fn push_pop_ledger(ops in arb_ops()) {
        let mut vm = Vm::new();
        let mut expected: usize = 0;
        for (i, op) in ops.iter().enumerate() {
            if *op {
                vm.push(Value::Integer(i as i64)).unwrap();
                expected += 1;
            } else {
                vm.pop();
                expected = expected.saturating_sub(1);
            }
            prop_assert_eq!(vm.stack_size(), expected);
        }
    }

    /// Pushing then popping yields an equal value.
    #[test]
    fn push_pop_round_trips(n in any::<i64>(), f in any::<f64>(), s in "[a-z]{0,12}") {
        let mut vm = Vm::new();
        for value in [Value::Integer(n), Value::Number(f), Value::str(&s), Value::Boolean(true)] {
            vm.push(value.clone()).unwrap();
            let back = vm.pop();
            if let (Value::Number(a), Value::Number(b)) = (&value, &back) {
                // NaN never compares equal to itself; compare bits.
                prop_assert_eq!(a.to_bits(), b.to_bits());
            } else {
                prop_assert_eq!(back, value);
            }
        }
    }

    /// A table behaves like a map under any interleaving of writes:
    /// reads return the last non-nil write, nil writes delete.
    #[test]
    fn table_matches_model(writes in prop::collection::vec((arb_key(), prop::option::of(-100i64..100i64)), 0..48)) {
        let mut table = Table::new();
        let mut model = std::collections::BTreeMap::new();

        for (key, value) in &writes {
            match value {
                Some(v) => {
                    table.set(Value::Integer(*key), Value::Integer(*v));
                    model.insert(*key, *v);
                }
                None => {
                    table.set(Value::Integer(*key), Value::Nil);
                    model.remove(key);
                }
            }
        }

        prop_assert_eq!(table.num_entries(), model.len());
        for key in -8i64..8 {
            let got = table.get(&Value::Integer(key));
            match model.get(&key) {
                Some(v) => prop_assert_eq!(got, Value::Integer(*v)),
                None => prop_assert_eq!(got, Value::Nil),
            }
        }
    }

    /// An allocation followed by k extra copies needs exactly k+1 drops
    /// before its pool slot frees and is reused.
    #[test]
    fn object_slot_accounting(k in 0usize..8) {
        let mut vm = Vm::new();
        let baseline = vm.live_objects();

        let original = vm.alloc_table();
        let copies: Vec<Value> = (0..k).map(|_| original.clone()).collect();
        prop_assert_eq!(vm.live_objects(), baseline + 1);

        for copy in copies {
            drop(copy);
            prop_assert_eq!(vm.live_objects(), baseline + 1);
        }
        drop(original);
        prop_assert_eq!(vm.live_objects(), baseline);

        // The freed slot is reusable: a fresh allocation does not grow
        // the live count past the previous peak.
        let _next = vm.alloc_table();
        prop_assert_eq!(vm.live_objects(), baseline + 1);
    }
}
