// End-to-end: a rhai script drives editors, the pipeline and interception.
use std::fs;
use std::sync::Arc;
use std::thread;

use scalpel::editor::{ImmediateDispatcher, QueuedDispatcher, Visibility, WidgetKind};
use scalpel::http::{EditorContext, EditorMode, HttpMessage, HttpService, MessageKind, ToolSource};
use scalpel::intercept::InterceptHandler;
use scalpel::pipeline::TransformPipeline;
use scalpel::provider::EditorProvider;
use scalpel::registry::EditorRegistry;
use scalpel::script::{RhaiEngine, ScriptExecutor};
use tempfile::TempDir;

const SCRIPT: &str = r#"
// decode a base64 body for editing
fn request_edit_in_b64(msg) {
    if msg.body == "" { return (); }
    to_text(b64decode(msg.body))
}

fn request_edit_out_b64(msg, text) {
    msg.body = b64encode(text);
    msg
}

// query string, url-decoded
fn request_edit_in_query(msg, service, tab) {
    let i = msg.path.index_of("?");
    if i < 0 { return (); }
    urldecode(msg.path.sub_string(i + 1))
}

// always fails
fn request_edit_in_broken(msg) {
    throw "broken on purpose";
}

fn request_edit_out_broken(msg, text) {
    throw "still broken";
}

// readable, but sending always fails
fn request_edit_in_fragile(msg) {
    msg.method
}

fn request_edit_out_fragile(msg, text) {
    throw "cannot encode";
}

fn response_edit_in(msg) {
    `${msg.status} ${msg.reason}`
}

fn request(msg, service) {
    msg.headers.push(#{ name: "X-Scalpel", value: service.host });
    msg
}
"#;

const POST: &[u8] =
    b"POST /login?user=a%20b HTTP/1.1\r\nHost: example.com\r\nContent-Length: 8\r\n\r\naGVsbG8=";

struct Fixture {
    _dir: TempDir,
    provider: Arc<EditorProvider>,
    service: HttpService,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("edit.rhai");
    fs::write(&path, SCRIPT).unwrap();

    let provider = Arc::new(EditorProvider::new(
        ScriptExecutor::new(),
        EditorRegistry::new(),
        Arc::new(ImmediateDispatcher),
        WidgetKind::Raw,
    ));
    provider.reload(Box::new(RhaiEngine::from_file(&path).unwrap()));

    Fixture {
        _dir: dir,
        provider,
        service: HttpService::new("example.com", 443, true),
    }
}

fn repeater() -> EditorContext {
    EditorContext::new(ToolSource::Repeater, EditorMode::Default)
}

#[test]
fn catalog_from_script() {
    let f = fixture();
    let catalog = f.provider.executor().catalog();
    let requests: Vec<_> = catalog
        .channels_for(MessageKind::Request)
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(requests, vec!["b64", "broken", "fragile", "query"]);

    let response = catalog.get(MessageKind::Response, "").unwrap();
    assert!(response.has_inbound());
    assert!(!response.editable());
}

#[test]
fn refresh_is_fail_open_per_channel() {
    let f = fixture();
    let tabs = f.provider.create_request_editor(repeater());
    let visible = tabs.refresh(&HttpMessage::request(POST), &f.service);

    let labels: Vec<_> = visible.iter().map(|s| s.label().to_string()).collect();
    assert_eq!(labels, vec!["b64", "fragile", "query"]);
    assert_eq!(visible[0].content(), b"hello");
    assert_eq!(visible[1].content(), b"POST");
    assert_eq!(visible[2].content(), b"user=a b");
    assert_eq!(tabs.slot("broken").unwrap().visibility(), Visibility::Disabled);
}

#[test]
fn edit_then_apply() {
    let f = fixture();
    let tabs = f.provider.create_request_editor(repeater());
    let original = HttpMessage::request(POST);
    tabs.refresh(&original, &f.service);

    let pipeline = TransformPipeline::new(f.provider.executor().clone());
    assert_eq!(pipeline.apply(&tabs, &original, &f.service), original);

    tabs.slot("b64").unwrap().user_edit(b"bye".to_vec());
    let out = pipeline.apply(&tabs, &original, &f.service);
    let parsed = out.parse().unwrap();
    assert_eq!(parsed.body, b"Ynll");
    assert_eq!(parsed.header("content-length"), Some("4"));

    // refreshing with the new message resets the edit
    tabs.refresh(&out, &f.service);
    assert!(!tabs.is_modified());
    assert_eq!(tabs.slot("b64").unwrap().content(), b"bye");
}

#[test]
fn broken_outbound_passes_through() {
    let f = fixture();
    let tabs = f.provider.create_request_editor(repeater());
    let original = HttpMessage::request(POST);
    tabs.refresh(&original, &f.service);

    tabs.slot("fragile").unwrap().user_edit(b"PUT".to_vec());
    assert!(tabs.select("fragile"));
    assert_eq!(tabs.authoritative_slot().unwrap().label(), "fragile");

    let pipeline = TransformPipeline::new(f.provider.executor().clone());
    assert_eq!(pipeline.apply(&tabs, &original, &f.service).as_bytes(), POST);
}

#[test]
fn response_tab_is_read_only() {
    let f = fixture();
    let tabs = f
        .provider
        .create_response_editor(EditorContext::new(ToolSource::Proxy, EditorMode::ReadOnly));
    let visible = tabs.refresh(
        &HttpMessage::response(&b"HTTP/1.1 404 Not Found\r\n\r\n"[..]),
        &f.service,
    );
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].label(), "0");
    assert_eq!(visible[0].content(), b"404 Not Found");
    assert!(!visible[0].user_edit(b"nope".to_vec()));
}

#[test]
fn interception_uses_displayed_editor() {
    let f = fixture();
    let handler = InterceptHandler::new(
        f.provider.executor().clone(),
        f.provider.registry().clone(),
    );
    let tabs = f.provider.create_request_editor(repeater());
    let original = HttpMessage::request(POST);
    tabs.refresh(&original, &f.service);
    tabs.set_displayed(true);
    tabs.slot("b64").unwrap().user_edit(b"edited".to_vec());

    let out = handler.handle_request_to_be_sent(&original, &f.service, &ToolSource::Repeater);
    let parsed = out.message.parse().unwrap();
    assert_eq!(parsed.body, b"ZWRpdGVk");
    assert_eq!(parsed.header("x-scalpel"), Some("example.com"));
    assert!(out.annotation.unwrap().starts_with("scalpel:"));

    // closing the editor removes it from correlation
    drop(tabs);
    assert!(f.provider.registry().is_empty());
    let out = handler.handle_request_to_be_sent(&original, &f.service, &ToolSource::Repeater);
    assert_eq!(out.annotation, None);
    assert_eq!(out.message.parse().unwrap().body, b"aGVsbG8=");
}

#[test]
fn disabled_script_passes_everything_through() {
    let f = fixture();
    f.provider.executor().disable();
    let tabs = f.provider.create_request_editor(repeater());
    assert!(tabs.refresh(&HttpMessage::request(POST), &f.service).is_empty());

    let handler = InterceptHandler::new(
        f.provider.executor().clone(),
        f.provider.registry().clone(),
    );
    let original = HttpMessage::request(POST);
    let out = handler.handle_request_to_be_sent(&original, &f.service, &ToolSource::Proxy);
    assert_eq!(out.message, original);
}

#[test]
fn editors_work_from_many_threads() {
    let f = fixture();
    let (dispatcher, mut ui) = QueuedDispatcher::new();
    let provider = Arc::new(EditorProvider::new(
        f.provider.executor().clone(),
        EditorRegistry::new(),
        Arc::new(dispatcher),
        WidgetKind::Hex,
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let provider = provider.clone();
            let service = f.service.clone();
            thread::spawn(move || {
                let tabs = provider.create_request_editor(repeater());
                for _ in 0..5 {
                    let visible = tabs.refresh(&HttpMessage::request(POST), &service);
                    assert_eq!(visible.len(), 3);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(ui.drain() > 0);
}
