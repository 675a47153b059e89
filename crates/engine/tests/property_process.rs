// Property-based tests: template processing agrees with direct evaluation.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::sync::Arc;

use proptest::prelude::*;
use formcalc_engine::format::format_general;
use formcalc_engine::store::MemoryStore;
use formcalc_engine::{FormData, ProcessContext, ShortcodeEngine};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_256() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

fn arb_number() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => (0u32..1000).prop_map(|n| n.to_string()),
        1 => (0u32..100, 1u32..100).prop_map(|(a, b)| format!("{}.{}", a, b)),
    ]
}

/// Shortcode-free arithmetic: operators, grouping, unary minus, functions.
fn arb_expr() -> impl Strategy<Value = String> {
    arb_number().prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), prop::sample::select(vec!["+", "-", "*", "/"]), inner.clone())
                .prop_map(|(l, op, r)| format!("{} {} {}", l, op, r)),
            inner.clone().prop_map(|e| format!("({})", e)),
            inner.clone().prop_map(|e| format!("-{}", e)),
            (inner.clone(), inner).prop_map(|(a, b)| format!("max({}, {})", a, b)),
        ]
    })
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(config_256())]

    #[test]
    fn process_matches_direct_evaluation(text in arb_expr()) {
        let rt = runtime();
        let engine = ShortcodeEngine::builder_for(Arc::new(MemoryStore::new())).build();
        let ctx = ProcessContext::new("prop", FormData::new());

        let out = rt.block_on(engine.process(&text, &ctx));
        match engine.evaluate(&text) {
            Ok(n) => {
                prop_assert!(out.success, "{} failed: {:?}", text, out.error);
                prop_assert_eq!(out.result, Some(format_general(n)));
            }
            Err(e) => {
                prop_assert!(!out.success, "{} should fail", text);
                prop_assert_eq!(out.error, Some(e.to_string()));
            }
        }
    }

    #[test]
    fn numeric_field_equals_literal(x in -5000i64..5000, k in 1u32..500) {
        let rt = runtime();
        let engine = ShortcodeEngine::builder_for(Arc::new(MemoryStore::new())).build();
        let ctx = ProcessContext::new("prop", FormData::new().with("x", x));

        let out = rt.block_on(engine.process("[field:x] * 3 + k", &ctx.clone()));
        // `k` is not a shortcode, so the rendered text is not arithmetic.
        prop_assert_eq!(out.result, Some(format!("{} * 3 + k", x)));

        let template = format!("[field:x] * 3 + {}", k);
        let out = rt.block_on(engine.process(&template, &ctx));
        let expected = engine.evaluate(&format!("{} * 3 + {}", x, k)).map(format_general).ok();
        prop_assert_eq!(out.result, expected);
    }
}
