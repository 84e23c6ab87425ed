//! End-to-end tests: handles and contexts over the in-process engine.

use crate::abi::{Compiled, CompiledRuleset, Engine, EngineContext, ObfuscatorConfig, RawObject, RawRulesetInfo, RawRunResult, ReturnCode};
use crate::{Error, Handle, Limits, RunError, RunOutcome};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use test_case::test_case;

// --- Fixtures ----------------------------------------------------------------

const UA_ADDRESS: &str = "server.request.headers.no_cookies";

fn input(address: &str, key_path: &[&str]) -> Value {
    match key_path {
        [] => json!({"address": address}),
        _ => json!({"address": address, "key_path": key_path}),
    }
}

/// The Arachni scanner rule over `inputs`.
fn arachni_rule(inputs: Vec<Value>, actions: &[&str]) -> Value {
    let mut rule = json!({
        "id": "ua0-600-12x",
        "name": "Arachni",
        "tags": {"type": "security_scanner", "category": "attack_attempt"},
        "conditions": [{
            "operator": "match_regex",
            "parameters": {"inputs": inputs, "regex": "^Arachni"}
        }],
        "transformers": []
    });
    if !actions.is_empty() {
        rule["on_match"] = json!(actions);
    }
    json!({"version": "2.1", "rules": [rule]})
}

fn user_agent_rule() -> Value {
    arachni_rule(vec![input(UA_ADDRESS, &["user-agent"])], &[])
}

fn headers(user_agent: &str) -> [(&'static str, Value); 1] {
    [(UA_ADDRESS, json!({"user-agent": user_agent}))]
}

fn handle(rules: &Value) -> Handle {
    Handle::new(rules, "", "").unwrap()
}

// --- Handle ------------------------------------------------------------------

#[test]
fn health_and_version() {
    let supported = cfg!(all(any(target_os = "linux", target_os = "macos"), any(target_arch = "x86_64", target_arch = "aarch64")))
        && std::env::var(crate::DISABLED_ENV).map_or(true, |flag| matches!(flag.trim(), "" | "0" | "false"));
    match crate::health() {
        Ok(()) => assert!(supported),
        Err(err) => {
            assert!(!supported);
            assert!(matches!(err, Error::Unsupported(_)), "{err:?}");
        }
    }
    assert!(crate::regex!(r"^[0-9]+\.[0-9]+\.[0-9]+").is_match(crate::version()));
}

#[test]
fn valid_rule_set_loads() {
    let handle = handle(&user_agent_rule());
    assert_eq!(handle.addresses(), vec![UA_ADDRESS]);
    assert_eq!(handle.ruleset_info().failed, 0);
}

#[test]
fn rule_set_without_rules_is_rejected() {
    let rules = json!({
        "version": "2.1",
        "events": [{
            "id": "ua0-600-12x",
            "name": "Arachni",
            "tags": {"type": "security_scanner"},
            "conditions": [{
                "operation": "match_regex",
                "parameters": {"inputs": [{"address": UA_ADDRESS}], "regex": "^Arachni"}
            }],
            "transformers": []
        }]
    });
    let err = Handle::new(&rules, "", "").unwrap_err();
    assert!(matches!(err, Error::Compile(_)), "{err:?}");
}

#[test]
fn addresses_keep_declaration_order() {
    let inputs = vec![
        input("my.first.input", &[]),
        input("my.second.input", &[]),
        input("my.third.input", &[]),
        input("my.indexed.input", &["indexed"]),
        input("my.second.input", &["again"]),
    ];
    let handle = handle(&arachni_rule(inputs, &[]));
    assert_eq!(handle.addresses(), vec!["my.first.input", "my.second.input", "my.third.input", "my.indexed.input"]);
}

#[test]
fn ruleset_diagnostics() {
    let missing = |id: &str, key: &str| {
        let mut rule = json!({
            "id": id,
            "name": "Unicode Full/Half Width Abuse Attack Attempt",
            "tags": {"type": "http_protocol_violation"},
            "conditions": [],
            "transformers": []
        });
        rule.as_object_mut().unwrap().remove(key);
        rule
    };
    let rules = json!({
        "version": "2.1",
        "metadata": {"rules_version": "1.2.7"},
        "rules": [
            {
                "id": "valid-rule",
                "name": "Unicode Full/Half Width Abuse Attack Attempt",
                "tags": {"type": "http_protocol_violation"},
                "conditions": [{
                    "parameters": {"inputs": [{"address": "server.request.uri.raw"}], "regex": r"\%u[fF]{2}[0-9a-fA-F]{2}"},
                    "operator": "match_regex"
                }],
                "transformers": []
            },
            missing("missing-tags-1", "tags"),
            missing("missing-tags-2", "tags"),
            missing("missing-name", "name"),
        ]
    });

    let info = handle(&rules).ruleset_info();
    assert_eq!((info.loaded, info.failed), (1, 3));
    assert_eq!(info.version.as_deref(), Some("1.2.7"));
    let expected: BTreeMap<String, Vec<String>> = [
        ("missing key 'tags'".to_string(), vec!["missing-tags-1".to_string(), "missing-tags-2".to_string()]),
        ("missing key 'name'".to_string(), vec!["missing-name".to_string()]),
    ]
    .into();
    assert_eq!(info.errors, expected);
}

// --- Runs --------------------------------------------------------------------

#[test]
fn matching() {
    let handle = handle(&arachni_rule(vec![input("my.input", &[])], &[]));
    assert_eq!(handle.addresses(), vec!["my.input"]);
    let ctx = handle.new_context().unwrap();

    // Value does not match.
    let outcome = ctx.run([("my.input", "go client")], Duration::from_secs(1)).unwrap();
    assert!(!outcome.is_match());
    assert!(outcome.actions.is_empty());
    // Address not used by any rule.
    let outcome = ctx.run([("server.request.uri.raw", "something")], Duration::from_secs(1)).unwrap();
    assert!(!outcome.is_match());
    // No budget.
    assert_eq!(ctx.run([("my.input", "Arachni")], Duration::ZERO), Err(RunError::Timeout));

    let outcome = ctx.run([("my.input", "Arachni")], Duration::from_secs(1)).unwrap();
    assert!(outcome.is_match());
    assert!(outcome.actions.is_empty());
    let events = outcome.events().unwrap();
    assert_eq!(events[0]["rule"]["id"], "ua0-600-12x");
    assert_eq!(
        events[0]["rule_matches"][0]["parameters"][0],
        json!({"address": "my.input", "key_path": [], "value": "Arachni", "highlight": ["Arachni"]})
    );

    // A rule matches once per context.
    let outcome = ctx.run([("my.input", "Arachni")], Duration::from_secs(1)).unwrap();
    assert!(!outcome.is_match());

    let nothing: Vec<(String, Value)> = Vec::new();
    assert_eq!(ctx.run(nothing, Duration::from_secs(1)), Ok(RunOutcome::default()));
    let empty: BTreeMap<String, Value> = BTreeMap::new();
    assert_eq!(ctx.run(empty, Duration::from_secs(1)), Ok(RunOutcome::default()));

    ctx.close();
    handle.close();
    assert!(handle.new_context().is_none());
}

#[test_case(&["block"] ; "single")]
#[test_case(&["action 1", "action 2", "action 3"] ; "multiple actions")]
fn actions(expected: &[&str]) {
    let handle = handle(&arachni_rule(vec![input("my.input", &[])], expected));
    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", "Arachni")], Duration::from_secs(1)).unwrap();
    assert!(outcome.is_match());
    assert_eq!(outcome.actions, expected);
}

#[test]
fn inputs_are_clipped_by_handle_limits() {
    let limits = Limits::new(Limits::DEFAULT_MAX_DEPTH, 7, Limits::DEFAULT_MAX_CONTAINER_SIZE);
    let rules = arachni_rule(vec![input("my.input", &[])], &[]);
    let handle = Handle::with_engine(&crate::BuiltinEngine, &rules, ObfuscatorConfig::default(), limits).unwrap();
    assert_eq!(handle.limits(), limits);

    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", "Arachni scanner")], Duration::from_secs(1)).unwrap();
    assert_eq!(outcome.events().unwrap()[0]["rule_matches"][0]["parameters"][0]["value"], "Arachni");
}

/// Map entries in the given order, repeats included.
struct Pairs(Vec<(&'static str, &'static str)>);

impl Serialize for Pairs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().copied())
    }
}

fn matched_value(outcome: &RunOutcome) -> Value {
    outcome.events().unwrap()[0]["rule_matches"][0]["parameters"][0]["value"].clone()
}

#[test_case(&[("q", "Arachni"), ("q", "benign")] ; "first repeat matches")]
#[test_case(&[("q", "benign"), ("q", "Arachni")] ; "last repeat matches")]
fn repeated_keys_are_all_inspected(pairs: &[(&'static str, &'static str)]) {
    let handle = handle(&arachni_rule(vec![input("my.input", &["q"])], &[]));
    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", Pairs(pairs.to_vec()))], Duration::from_secs(1)).unwrap();
    assert!(outcome.is_match());
    assert_eq!(matched_value(&outcome), "Arachni");
}

#[test]
fn repeated_addresses_are_all_inspected() {
    let handle = handle(&arachni_rule(vec![input("my.input", &[])], &[]));
    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", "Arachni"), ("my.input", "benign")], Duration::from_secs(1)).unwrap();
    assert_eq!(matched_value(&outcome), "Arachni");
}

#[test_case(&[("session1", "Arachni"), ("session2", "benign")] ; "first key matches")]
#[test_case(&[("session1", "benign"), ("session2", "Arachni")] ; "second key matches")]
fn keys_colliding_after_clipping_are_all_inspected(pairs: &[(&'static str, &'static str)]) {
    let limits = Limits::new(Limits::DEFAULT_MAX_DEPTH, 7, Limits::DEFAULT_MAX_CONTAINER_SIZE);
    let rules = arachni_rule(vec![input("my.input", &["session"])], &[]);
    let handle = Handle::with_engine(&crate::BuiltinEngine, &rules, ObfuscatorConfig::default(), limits).unwrap();
    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", Pairs(pairs.to_vec()))], Duration::from_secs(1)).unwrap();
    assert_eq!(matched_value(&outcome), "Arachni");
}

// --- Encoded inputs ----------------------------------------------------------

fn run_on_my_input<T: Serialize>(value: T) {
    let handle = handle(&arachni_rule(vec![input("my.input", &[])], &[]));
    let ctx = handle.new_context().unwrap();
    let outcome = ctx.run([("my.input", value)], Duration::from_secs(1));
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[test_case(json!("hello, waf") ; "string")]
#[test_case(json!("") ; "empty string")]
#[test_case(json!(1234) ; "positive int")]
#[test_case(json!(-1234) ; "negative int")]
#[test_case(json!(u64::MAX) ; "wide unsigned int")]
#[test_case(json!(true) ; "bool")]
#[test_case(json!(33.62345) ; "float")]
#[test_case(json!(null) ; "null")]
#[test_case(json!([]) ; "empty array")]
#[test_case(json!({}) ; "empty map")]
#[test_case(json!(["a", 1, null, [true, {"k": "v"}]]) ; "mixed array")]
#[test_case(json!({"": "empty key", "k": null, "n": {"m": [1.5, "x"]}}) ; "nested map")]
#[test_case(json!([[[[[[[[[[[[[[[[[[[[[[["deep"]]]]]]]]]]]]]]]]]]]]]]]) ; "past max depth")]
#[test_case(json!("x".repeat(Limits::DEFAULT_MAX_STRING_SIZE + 1)) ; "long string")]
#[test_case(json!(vec![0; Limits::DEFAULT_MAX_CONTAINER_SIZE + 1]) ; "large array")]
fn encoded_values_run_cleanly(value: Value) {
    run_on_my_input(value);
}

#[test]
fn typed_values_run_cleanly() {
    #[derive(Serialize)]
    struct Request<'a> {
        path: &'a str,
        port: u16,
        referer: Option<&'a str>,
        tags: BTreeMap<&'a str, f32>,
    }

    #[derive(Serialize)]
    enum Method {
        Get,
        Custom(String),
    }

    run_on_my_input(Request { path: "/", port: 443, referer: None, tags: BTreeMap::from([("weight", 0.5)]) });
    run_on_my_input(Method::Get);
    run_on_my_input(Method::Custom("PURGE".into()));
    run_on_my_input(crate::Bytes(b"\x00raw"));
    run_on_my_input(('c', -1_i8, u128::MAX));
    run_on_my_input(None::<i32>);
    run_on_my_input(f64::NAN);
    run_on_my_input(());
}

#[test]
fn use_after_close() {
    let handle = handle(&user_agent_rule());
    let ctx = handle.new_context().unwrap();

    handle.close();
    assert!(handle.addresses().is_empty());
    assert_eq!(handle.ruleset_info(), crate::RulesetInfo::default());
    assert!(handle.new_context().is_none());

    // The open context still holds the rules.
    assert!(ctx.run(headers("Arachni"), Duration::from_secs(1)).unwrap().is_match());

    ctx.close();
    ctx.close();
    assert_eq!(ctx.run(headers("Arachni"), Duration::from_secs(1)), Ok(RunOutcome::default()));
}

// --- Concurrency -------------------------------------------------------------

const USERS: usize = 8;
const RUNS: usize = 200;
const BENIGN_AGENTS: [&str; 3] = ["Foo", "Bar", "Datadog"];

#[test]
fn shared_context() {
    let handle = handle(&user_agent_rule());
    let ctx = handle.new_context().unwrap();
    let start = Barrier::new(USERS);

    thread::scope(|s| {
        for _ in 0..USERS {
            s.spawn(|| {
                start.wait();
                for c in 0..RUNS {
                    // Benign agents keep the rule from being exhausted.
                    let outcome = ctx.run(headers(BENIGN_AGENTS[c % BENIGN_AGENTS.len()]), Duration::from_secs(60)).unwrap();
                    assert!(!outcome.is_match(), "run {c}: {:?}", outcome.events());
                }
            });
        }
    });

    assert!(ctx.run(headers("Arachni"), Duration::from_secs(1)).unwrap().is_match());
    assert_eq!(ctx.metrics().runs, (USERS * RUNS + 1) as u64);
}

#[test]
fn context_per_worker() {
    let handle = handle(&user_agent_rule());
    let start = Barrier::new(USERS);

    thread::scope(|s| {
        for _ in 0..USERS {
            s.spawn(|| {
                start.wait();
                let ctx = handle.new_context().unwrap();
                for c in 0..RUNS {
                    let outcome = ctx.run(headers(BENIGN_AGENTS[c % BENIGN_AGENTS.len()]), Duration::from_secs(60));
                    assert!(!outcome.unwrap().is_match());
                }
                let outcome = ctx.run(headers("Arachni"), Duration::from_secs(1)).unwrap();
                assert!(outcome.is_match());
                assert!(outcome.actions.is_empty());
            });
        }
    });
}

// --- Metrics -----------------------------------------------------------------

fn uri_rule() -> Value {
    json!({
        "version": "2.1",
        "rules": [{
            "id": "valid-rule",
            "name": "Unicode Full/Half Width Abuse Attack Attempt",
            "tags": {"type": "http_protocol_violation"},
            "conditions": [{
                "parameters": {"inputs": [{"address": "server.request.uri.raw"}], "regex": r"\%u[fF]{2}[0-9a-fA-F]{2}"},
                "operator": "match_regex"
            }]
        }]
    })
}

#[test]
fn run_duration() {
    let handle = handle(&uri_rule());
    let ctx = handle.new_context().unwrap();

    let start = Instant::now();
    let outcome = ctx.run([("server.request.uri.raw", r"\%uff00")], Duration::from_secs(1)).unwrap();
    let elapsed = u64::try_from(start.elapsed().as_nanos()).unwrap();
    assert!(outcome.is_match());

    let (overall, internal) = ctx.total_runtime();
    assert!(internal > 0);
    assert!(overall >= internal);
    assert!(overall <= elapsed);
    assert!(outcome.metrics.total >= outcome.metrics.encode);
}

#[test]
fn timeouts_are_counted() {
    let handle = handle(&uri_rule());
    let ctx = handle.new_context().unwrap();

    for i in 1..=10 {
        assert_eq!(ctx.run([("server.request.uri.raw", r"\%uff00")], Duration::from_nanos(1)), Err(RunError::Timeout));
        assert_eq!(ctx.total_timeouts(), i);
    }
    assert_eq!(ctx.metrics().runs, 0);
    // Timed-out runs leave the rule available.
    assert!(ctx.run([("server.request.uri.raw", r"\%uff00")], Duration::from_secs(1)).unwrap().is_match());
}

// --- Obfuscation -------------------------------------------------------------

#[test_case("key", "", false ; "key")]
#[test_case("", "sensitive", false ; "value")]
#[test_case("", "", true ; "off")]
fn obfuscator(key_regex: &str, value_regex: &str, visible: bool) {
    let rules = arachni_rule(vec![input("my.addr", &["key"])], &[]);
    let handle = Handle::new(&rules, key_regex, value_regex).unwrap();
    assert_eq!(handle.obfuscator(), &ObfuscatorConfig::new(key_regex, value_regex));
    let ctx = handle.new_context().unwrap();

    let outcome = ctx.run([("my.addr", json!({"key": "Arachni-sensitive-Arachni"}))], Duration::from_secs(1)).unwrap();
    assert!(outcome.is_match());
    assert!(outcome.actions.is_empty());
    let payload = String::from_utf8(outcome.matches).unwrap();
    assert_eq!(payload.contains("sensitive"), visible, "{payload}");
}

// --- Engine failures ---------------------------------------------------------

/// Compiles anything into a rule set that reads `addresses` and whose contexts panic.
struct Stub {
    addresses: Vec<String>,
}

struct StubRuleset {
    addresses: Vec<String>,
}

struct Panicking;

impl Engine for Stub {
    fn version(&self) -> &str {
        "stub"
    }

    fn init(&self, _ruleset: &RawObject<'_>, _obfuscator: &ObfuscatorConfig) -> Result<Compiled, ReturnCode> {
        let ruleset = Arc::new(StubRuleset { addresses: self.addresses.clone() });
        Ok(Compiled { ruleset, info: RawRulesetInfo::default() })
    }
}

impl CompiledRuleset for StubRuleset {
    fn required_addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    fn context_init(self: Arc<Self>) -> Box<dyn EngineContext> {
        Box::new(Panicking)
    }
}

impl EngineContext for Panicking {
    fn run(&mut self, _data: &RawObject<'_>, _timeout: Duration) -> Result<RawRunResult, ReturnCode> {
        panic!("engine fault")
    }
}

#[test]
fn rule_set_without_addresses_is_unusable() {
    let engine = Stub { addresses: Vec::new() };
    let err = Handle::with_engine(&engine, &json!({}), ObfuscatorConfig::default(), Limits::default()).unwrap_err();
    assert_eq!(err, Error::Run(RunError::EmptyRuleAddresses));
    assert_eq!(err.to_string(), "empty rule addresses");
}

#[test]
fn engine_panic_is_an_internal_error() {
    let engine = Stub { addresses: vec!["my.input".into(), "my.input".into()] };
    let handle = Handle::with_engine(&engine, &json!({}), ObfuscatorConfig::default(), Limits::default()).unwrap();
    assert_eq!(handle.addresses(), vec!["my.input"]);

    let ctx = handle.new_context().unwrap();
    assert_eq!(ctx.run([("my.input", "x")], Duration::from_secs(1)), Err(RunError::Internal));
    // The context survives the fault.
    assert_eq!(ctx.run([("my.input", "x")], Duration::from_secs(1)), Err(RunError::Internal));
    assert_eq!(ctx.total_timeouts(), 0);
}
