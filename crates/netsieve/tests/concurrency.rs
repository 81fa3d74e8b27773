use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use netsieve::{DecisionEngine, RequestDescriptor, ResourceType, Rule, RuleStore, Verdict};
use url::Url;

/// Two generations of rules that both cover `target.test`, with disjoint ids
fn old_set() -> Vec<Rule> {
    vec![
        Rule::block(1, "||target.test^"),
        Rule::block(2, "||target.test/ads/*").with_priority(5),
        Rule::allow(3, "||target.test/ok/*").with_priority(10),
    ]
}

fn new_set() -> Vec<Rule> {
    vec![
        Rule::redirect(101, "||target.test^", "https://sink.test/empty"),
        Rule::block(102, "||target.test/ads/*").with_priority(5),
        Rule::allow(103, "||target.test/ok/*").with_priority(10),
    ]
}

#[test]
fn decisions_never_see_a_half_applied_update() {
    let store = Arc::new(RuleStore::with_rules(old_set()).unwrap());
    let engine = DecisionEngine::new(Arc::clone(&store));
    let done = AtomicBool::new(false);

    let urls = [
        "https://target.test/ads/banner.js",
        "https://cdn.target.test/lib.js",
        "https://target.test/ok/app.js",
    ];

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200 {
                let rules = if i % 2 == 0 { new_set() } else { old_set() };
                store.replace_all(rules).unwrap();
            }
            done.store(true, Ordering::Release);
        });

        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    for url in urls {
                        let descriptor =
                            RequestDescriptor::new(Url::parse(url).unwrap(), ResourceType::Script);
                        let evaluation = engine.evaluate(&descriptor);

                        assert!(!evaluation.matched.is_empty(), "{} matched nothing", url);
                        let from_old = evaluation.matched.iter().all(|id| *id < 100);
                        let from_new = evaluation.matched.iter().all(|id| *id > 100);
                        assert!(
                            from_old || from_new,
                            "mixed rule sets for {}: {:?}",
                            url,
                            evaluation.matched
                        );

                        let verdict = engine.decide(&descriptor);
                        if !url.contains("/ok/") {
                            assert_ne!(verdict, Verdict::Allow, "{} allowed by omission", url);
                        }
                    }
                }
            });
        }
    });

    assert_eq!(store.generation(), 201);
    assert_eq!(store.rules(), old_set());
}

#[test]
fn store_and_engine_are_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<RuleStore>();
    assert_send_sync::<DecisionEngine>();
}
