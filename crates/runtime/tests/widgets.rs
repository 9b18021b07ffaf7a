//! Widget mount and the layout endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bazaar_runtime::report::{FailureCause, FailureKind};
use bazaar_runtime::widget::{WidgetBody, WidgetResolution};
use bazaar_test_utils::{TestFragment, TestStack, drain, test_plugin};
use http_body_util::BodyExt;
use serde_json::{Map, Value, json};
use tower::ServiceExt;

async fn get_json(stack: &TestStack, uri: &str) -> (StatusCode, Value) {
    let response = stack
        .app()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn syntax_error_renders_placeholder_while_other_widgets_render() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    let mut failures = stack.failures();

    stack.add(
        TestFragment::widget(plugin, "broken_banner", r#"fn(config) { return "<p>"  "#)
            .in_slot("sidebar")
            .with_priority(1),
    );
    stack.add(
        TestFragment::widget(
            plugin,
            "greeting",
            r#"fn(config, data) { return "<p>Hello " + data.name + "</p>"; }"#,
        )
        .in_slot("sidebar")
        .with_priority(2),
    );
    stack.add(
        TestFragment::widget(plugin, "footer_links", r#"fn() { return ["a", "b"]; }"#)
            .in_slot("footer"),
    );

    let sidebar = stack
        .state
        .widgets()
        .render_slot("sidebar", json!({ "name": "Ada" }))
        .await;
    assert_eq!(sidebar.len(), 2);
    assert!(sidebar[0].placeholder);
    assert_eq!(sidebar[0].name, "broken_banner");
    assert!(!sidebar[1].placeholder);
    assert_eq!(sidebar[1].body, WidgetBody::Html("<p>Hello Ada</p>".into()));

    let footer = stack.state.widgets().render_slot("footer", Value::Null).await;
    assert_eq!(footer.len(), 1);
    assert_eq!(footer[0].body, WidgetBody::Component(json!(["a", "b"])));

    let reports = drain(&mut failures);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, FailureKind::WidgetRender);
    assert_eq!(reports[0].cause, FailureCause::Compile);
}

#[tokio::test]
async fn resolve_distinguishes_component_placeholder_and_missing() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    stack.add(TestFragment::widget(plugin, "ok", r#"fn() { return "x"; }"#));
    stack.add(TestFragment::widget(plugin, "bad", "fn( {"));

    let mount = stack.state.widgets();
    assert!(matches!(mount.resolve("ok").await, WidgetResolution::Component(_)));
    assert!(matches!(mount.resolve("bad").await, WidgetResolution::Placeholder(_)));
    assert!(matches!(mount.resolve("missing").await, WidgetResolution::NotFound));
}

#[tokio::test]
async fn disabling_a_widget_removes_it_on_next_lookup() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    let banner = stack.add(
        TestFragment::widget(plugin, "banner", r#"fn() { return "<b>Sale</b>"; }"#)
            .in_slot("sidebar")
            .with_priority(1),
    );
    stack.add(
        TestFragment::widget(plugin, "greeting", r#"fn() { return "<p>Hi</p>"; }"#)
            .in_slot("sidebar")
            .with_priority(2),
    );

    let mount = stack.state.widgets();
    assert!(matches!(mount.resolve("banner").await, WidgetResolution::Component(_)));
    assert_eq!(mount.render_slot("sidebar", Value::Null).await.len(), 2);

    stack.registry.set_fragment_enabled(banner, false);
    assert!(matches!(mount.resolve("banner").await, WidgetResolution::NotFound));
    let sidebar = mount.render_slot("sidebar", Value::Null).await;
    assert_eq!(sidebar.len(), 1);
    assert_eq!(sidebar[0].name, "greeting");

    stack.registry.set_fragment_enabled(banner, true);
    assert_eq!(mount.render_slot("sidebar", Value::Null).await.len(), 2);

    stack.registry.set_plugin_enabled(plugin, false);
    assert!(matches!(mount.resolve("banner").await, WidgetResolution::NotFound));
    assert!(mount.render_slot("sidebar", Value::Null).await.is_empty());
}

#[tokio::test]
async fn config_is_defaults_merged_with_overrides() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    stack.add(
        TestFragment::widget(plugin, "promo", "fn(config, data) { return config; }")
            .with_default_config(json!({ "title": "Sale", "color": "red" })),
    );

    let WidgetResolution::Component(factory) = stack.state.widgets().resolve("promo").await else {
        panic!("promo should compile");
    };

    let mut overrides = Map::new();
    overrides.insert("color".into(), json!("blue"));
    let rendered = factory.instantiate(overrides, Value::Null).await;
    assert_eq!(
        rendered.body,
        WidgetBody::Component(json!({ "title": "Sale", "color": "blue" }))
    );

    // The factory is reusable.
    let again = factory.instantiate(Map::new(), Value::Null).await;
    assert_eq!(
        again.body,
        WidgetBody::Component(json!({ "title": "Sale", "color": "red" }))
    );
}

#[tokio::test]
async fn html_output_is_sanitized() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    stack.add(TestFragment::widget(
        plugin,
        "sneaky",
        r#"fn() { return "<b>hi</b><script>steal()</script>"; }"#,
    ));

    let rendered = stack
        .state
        .widgets()
        .render("sneaky", Map::new(), Value::Null)
        .await
        .unwrap();
    assert_eq!(rendered.body, WidgetBody::Html("<b>hi</b>".into()));
}

#[tokio::test]
async fn throwing_widget_renders_placeholder() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    let mut failures = stack.failures();
    stack.add(TestFragment::widget(plugin, "angry", r#"fn() { throw "nope"; }"#));

    let rendered = stack
        .state
        .widgets()
        .render("angry", Map::new(), Value::Null)
        .await
        .unwrap();
    assert!(rendered.placeholder);
    assert_eq!(drain(&mut failures)[0].cause, FailureCause::Thrown);
}

#[tokio::test]
async fn lowest_priority_provider_wins_a_name() {
    let stack = TestStack::new();
    let a = stack.install(test_plugin("a"));
    let b = stack.install(test_plugin("b"));
    stack.add(TestFragment::widget(a, "cart", r#"fn() { return "from a"; }"#).with_priority(5));
    stack.add(TestFragment::widget(b, "cart", r#"fn() { return "from b"; }"#).with_priority(1));

    let rendered = stack
        .state
        .widgets()
        .render("cart", Map::new(), Value::Null)
        .await
        .unwrap();
    assert_eq!(rendered.plugin_id, Some(b));
}

#[tokio::test]
async fn http_endpoints_render_widgets_and_slots() {
    let stack = TestStack::new();
    let plugin = stack.install(test_plugin("storefront"));
    stack.add(
        TestFragment::widget(plugin, "hello", r#"fn(c, d) { return c.greeting + " " + d.name; }"#)
            .with_default_config(json!({ "greeting": "Hi" }))
            .in_slot("header"),
    );

    let config = urlencoding::encode(r#"{"greeting":"Hey"}"#);
    let data = urlencoding::encode(r#"{"name":"Ada"}"#);
    let (status, body) =
        get_json(&stack, &format!("/widgets/hello?config={config}&data={data}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["body"], json!({ "type": "html", "content": "Hey Ada" }));
    assert_eq!(body["placeholder"], false);

    let (status, body) = get_json(&stack, &format!("/slots/header?data={data}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["body"]["content"], "Hi Ada");

    let (status, _) = get_json(&stack, "/widgets/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&stack, "/widgets/hello?config=%5B1%5D").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
