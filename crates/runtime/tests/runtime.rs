//! Compiler cache, capabilities and the operational endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bazaar_runtime::config::RuntimeConfig;
use bazaar_runtime::models::FragmentKind;
use bazaar_runtime::plugin::{FragmentState, InvocationError};
use bazaar_runtime::script::ExecError;
use bazaar_test_utils::{TestFragment, TestStack, test_plugin};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

async fn get_text(stack: &TestStack, uri: &str) -> (StatusCode, String) {
    let response = stack
        .app()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn unchanged_body_reuses_the_compiled_unit() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("shop"));
    let id = stack.add(TestFragment::script(plugin, "calc", "fn(x) { return x + 1; }"));
    let compiler = stack.state.runtime().compiler();
    let load = || async {
        stack
            .state
            .runtime()
            .registry()
            .get_live_fragment(plugin, FragmentKind::Script, "calc")
            .await
            .unwrap()
            .unwrap()
    };

    let fragment = load().await;
    assert_eq!(compiler.state_of(&fragment), FragmentState::Enabled);
    let first = compiler.compile(&fragment).unwrap();
    let second = compiler.compile(&load().await).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(compiler.state_of(&fragment), FragmentState::Compiled);

    stack.registry.set_fragment_body(id, "fn(x) { return x + 2; }");
    let edited = load().await;
    assert_eq!(compiler.state_of(&edited), FragmentState::Invalidated);
    let third = compiler.compile(&edited).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));

    let out = stack
        .state
        .runtime()
        .invoke_script("shop", "calc", json!(1))
        .await
        .unwrap();
    assert_eq!(out, json!(3));
}

#[tokio::test]
async fn broken_fragments_stay_broken_until_edited() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("shop"));
    let id = stack.add(TestFragment::script(plugin, "calc", "fn(x) { return x +; }"));
    stack.add(TestFragment::script(plugin, "fine", "fn() { return 1; }"));

    let runtime = stack.state.runtime();
    let err = runtime.invoke_script("shop", "calc", json!(1)).await.unwrap_err();
    let InvocationError::Compile(compile) = err else {
        panic!("expected a compile error, got {err}");
    };
    assert_eq!(compile.diagnostic.line, 1);
    assert_eq!(compile.fragment, "calc");

    let check = runtime.check_plugin("shop").await.unwrap().unwrap();
    assert_eq!(check.broken(), 1);
    let calc = check.fragments.iter().find(|f| f.name == "calc").unwrap();
    assert_eq!(calc.state, FragmentState::Broken);
    assert!(runtime.invoke_script("shop", "fine", json!(null)).await.is_ok());

    stack.registry.set_fragment_body(id, "fn(x) { return x * 3; }");
    assert_eq!(
        runtime.invoke_script("shop", "calc", json!(2)).await.unwrap(),
        json!(6)
    );
}

#[tokio::test]
async fn unknown_identifiers_fail_compilation() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("shop"));
    stack.add(TestFragment::script(plugin, "env", "fn() { return process.env; }"));
    stack.add(TestFragment::script(plugin, "fs", r#"fn() { return fs.read("/etc/passwd"); }"#));

    let runtime = stack.state.runtime();
    for name in ["env", "fs"] {
        let err = runtime.invoke_script("shop", name, json!(null)).await.unwrap_err();
        assert!(matches!(err, InvocationError::Compile(_)), "{name}: {err}");
    }
}

#[tokio::test]
async fn missing_scripts_are_not_found() {
    let stack = TestStack::new();
    let err = stack
        .state
        .runtime()
        .invoke_script("nope", "calc", json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, InvocationError::NotFound(_)));
}

#[tokio::test]
async fn plugin_documents_are_namespaced() {
    let stack = TestStack::new();
    let a = stack.install(test_plugin("a"));
    let b = stack.install(test_plugin("b"));
    let writer = r#"fn(doc) { return db.insert("notes", doc); }"#;
    let counter = r#"fn() { return db.count("notes"); }"#;
    stack.add(TestFragment::script(a, "write", writer));
    stack.add(TestFragment::script(a, "count", counter));
    stack.add(TestFragment::script(b, "count", counter));

    let runtime = stack.state.runtime();
    runtime.invoke_script("a", "write", json!({ "text": "hi" })).await.unwrap();
    assert_eq!(runtime.invoke_script("a", "count", json!(null)).await.unwrap(), json!(1));
    assert_eq!(runtime.invoke_script("b", "count", json!(null)).await.unwrap(), json!(0));
    assert_eq!(stack.documents(b, "notes").len(), 0);
}

#[tokio::test]
async fn outbound_http_respects_the_allowlist() {
    let stack = TestStack::with_config(RuntimeConfig {
        http_allowed_hosts: vec!["api.example.com".into()],
        ..RuntimeConfig::default()
    });
    let plugin = stack.install(test_plugin("shop"));
    stack.add(TestFragment::script(plugin, "call", "fn(url) { return http.get(url); }"));

    let runtime = stack.state.runtime();
    let ok = runtime
        .invoke_script("shop", "call", json!("https://api.example.com/rates"))
        .await
        .unwrap();
    assert_eq!(ok["status"], 200);
    assert_eq!(stack.http.sent().len(), 1);

    let err = runtime
        .invoke_script("shop", "call", json!("https://evil.example.net/"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InvocationError::Execution(ExecError::Capability(_))
    ));
    assert_eq!(stack.http.sent().len(), 1);
}

#[tokio::test]
async fn navigation_lists_live_plugins_by_weight() {
    let stack = TestStack::new();
    stack.install(test_plugin("reports").with_navigation("Reports", "/plugins/reports", 5));
    stack.install(
        test_plugin("emails")
            .with_navigation("Subscribers", "/plugins/emails/list", 1)
            .with_navigation("Campaigns", "/plugins/emails/campaigns", 1),
    );
    stack.install(test_plugin("hidden").disabled().with_navigation("Hidden", "/x", 0));

    let (status, body) = get_text(&stack, "/navigation").await;
    assert_eq!(status, StatusCode::OK);
    let items: serde_json::Value = serde_json::from_str(&body).unwrap();
    let titles: Vec<&str> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, ["Campaigns", "Subscribers", "Reports"]);
}

#[tokio::test]
async fn metrics_expose_failures_and_cache_activity() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("shop"));
    stack.add(TestFragment::listener(plugin, "boom", "cart.viewed", r#"fn() { throw "x"; }"#));
    stack.state.events().dispatch("cart.viewed", json!({})).await;

    let (status, text) = get_text(&stack, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains(r#"plugin_failures_total{kind="listener",cause="thrown"} 1"#));
    assert!(text.contains("plugin_compile_cache_misses_total 1"));
}

#[tokio::test]
async fn health_without_database_is_healthy() {
    let stack = TestStack::new();
    let (status, body) = get_text(&stack, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body, json!({ "status": "healthy", "postgres": null }));
}
