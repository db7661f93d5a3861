//! Coordinator concurrency: many foreground threads requesting rejits
//! and notifying parameters concurrently, verified against the single
//! dedicated worker thread invariant (spec §5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use profiler_il::rule::{AssemblyIdentity, Target, VersionWindow, Wrapper, WrapperAction};
use profiler_il::{FunctionId, MethodReplacement, MethodToken, ModuleId};
use profiler_rejit::{RejitHandler, RejitHost};

struct CountingHost {
    calls: Mutex<u32>,
}

impl RejitHost for CountingHost {
    type FunctionControl = u32;

    fn resolve_rule_methods(&self, _module: ModuleId, _rule: &MethodReplacement) -> Vec<MethodToken> {
        Vec::new()
    }

    fn request_rejit(&self, _modules: &[ModuleId], methods: &[MethodToken]) -> u32 {
        *self.calls.lock().unwrap() += 1;
        methods.len() as u32
    }

    fn enumerate_inliners(&self, _module: ModuleId, _method: MethodToken) -> Vec<(ModuleId, MethodToken)> {
        Vec::new()
    }
}

fn rule() -> MethodReplacement {
    MethodReplacement {
        integration_name: "Concurrency".into(),
        target: Target {
            assembly_name: "A".into(),
            type_name: "T".into(),
            method_name: "M".into(),
            version_window: VersionWindow::default(),
            signature_types: vec![],
        },
        wrapper: Wrapper {
            assembly: AssemblyIdentity { name: "W".into(), version: Default::default(), locale: None, public_key_token: None },
            type_name: "Wt".into(),
            method_name: "M".into(),
            action: WrapperAction::ReplaceTargetMethod,
            signature: Vec::new(),
        },
    }
}

#[test]
fn concurrent_rejit_requests_all_land_in_the_registry() {
    let host = Arc::new(CountingHost { calls: Mutex::new(0) });
    let rewritten: Arc<Mutex<Vec<(ModuleId, MethodToken)>>> = Arc::new(Mutex::new(Vec::new()));
    let rewritten_clone = rewritten.clone();
    let handler = RejitHandler::new(host, move |module, method| {
        rewritten_clone.lock().unwrap().push((module.module_id, method.method_token));
    });

    let threads: Vec<_> = (0..16)
        .map(|i| {
            let handler = handler.clone();
            std::thread::spawn(move || {
                let module = ModuleId(i % 4);
                let token = MethodToken(0x0600_0000 + i as u32);
                handler.enqueue_for_rejit(vec![module], vec![token]).unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    // Drain: enqueue a rule-based scan too, to exercise that path
    // alongside direct rejit requests from other threads.
    let future = handler.enqueue_process_module(vec![ModuleId(0)], Arc::new(vec![rule()])).unwrap();
    assert_eq!(future.wait(), Some(0)); // CountingHost.resolve_rule_methods is empty.

    let mut seen: HashMap<ModuleId, Vec<MethodToken>> = HashMap::new();
    for i in 0..16u32 {
        let module = ModuleId(i as u64 % 4);
        let token = MethodToken(0x0600_0000 + i);
        // Poll: the worker may still be draining.
        for _ in 0..10_000 {
            if handler.has_module_and_method(module, token) {
                break;
            }
            std::thread::yield_now();
        }
        assert!(handler.has_module_and_method(module, token), "missing {module:?}/{token:?}");
        seen.entry(module).or_default().push(token);
    }

    handler.shutdown();
}
