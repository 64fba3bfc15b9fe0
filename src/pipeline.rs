//! Turning edited tab content back into a message.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    catalog::Direction,
    editor::TabSet,
    error::CallbackSite,
    http::{HttpMessage, HttpService},
    script::ScriptExecutor,
};

/// Result of [`TransformPipeline::transform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub message: HttpMessage,
    /// The slot whose content produced `message`, if any transformation happened.
    pub slot: Option<Uuid>,
}

impl Transformed {
    fn unchanged(message: &HttpMessage) -> Self {
        Self {
            message: message.clone(),
            slot: None,
        }
    }
}

/// Produces the outgoing message from the authoritative slot of a [`TabSet`].
///
/// Never fails: when nothing is dirty, the outbound callback declines, or it errors, the
/// original message goes out byte for byte.
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    executor: Arc<ScriptExecutor>,
}

impl TransformPipeline {
    pub fn new(executor: Arc<ScriptExecutor>) -> Self {
        Self { executor }
    }

    pub fn apply(&self, tabs: &TabSet, message: &HttpMessage, service: &HttpService) -> HttpMessage {
        self.transform(tabs, message, service).message
    }

    pub fn transform(
        &self,
        tabs: &TabSet,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Transformed {
        if message.kind() != tabs.kind() {
            warn!(
                tabs = %tabs.id(),
                expected = %tabs.kind(),
                got = %message.kind(),
                "message kind does not match editor, passing through"
            );
            return Transformed::unchanged(message);
        }

        // 1) pick the slot whose edits count
        let Some(slot) = tabs.authoritative_slot() else {
            debug!(tabs = %tabs.id(), "no modified tab, passing through");
            return Transformed::unchanged(message);
        };

        // 2) let the script rebuild the message from it
        let channel = slot.channel();
        let content = slot.content();
        match self
            .executor
            .invoke_outbound(channel, &channel.name, message, service, &content)
        {
            Ok(Some(new_message)) => {
                debug!(
                    tabs = %tabs.id(),
                    label = slot.label(),
                    before = message.as_bytes().len(),
                    after = new_message.as_bytes().len(),
                    "applied tab edits"
                );
                Transformed {
                    message: new_message,
                    slot: Some(slot.id()),
                }
            }
            Ok(None) => Transformed::unchanged(message),
            Err(e) => {
                let site = CallbackSite {
                    kind: tabs.kind(),
                    direction: Direction::Outbound,
                    channel: channel.name.clone(),
                };
                error!(
                    kind = %site.kind,
                    channel = %site.channel,
                    direction = %site.direction,
                    callback = channel.outbound.as_deref().unwrap_or_default(),
                    error = %e,
                    "{site} failed, sending original message"
                );
                Transformed::unchanged(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        editor::{ImmediateDispatcher, WidgetKind},
        http::{EditorContext, EditorMode, MessageKind, ToolSource},
        script::tests::FakeEngine,
    };

    const GET: &[u8] = b"GET /x HTTP/1.1\r\nHost: example.com\r\n\r\n";

    fn service() -> HttpService {
        HttpService::new("example.com", 80, false)
    }

    fn setup(engine: FakeEngine) -> (Arc<TabSet>, TransformPipeline) {
        let executor = ScriptExecutor::with_engine(Box::new(engine));
        let tabs = TabSet::new(
            MessageKind::Request,
            EditorContext::new(ToolSource::Repeater, EditorMode::Default),
            WidgetKind::Raw,
            executor.clone(),
            Arc::new(ImmediateDispatcher),
        );
        tabs.refresh(&HttpMessage::request(GET), &service());
        (tabs, TransformPipeline::new(executor))
    }

    fn abc() -> FakeEngine {
        let mut engine = FakeEngine::new(&[
            "request_edit_in_a",
            "request_edit_out_a",
            "request_edit_in_b",
            "request_edit_out_b",
            "request_edit_in_c",
            "request_edit_out_c",
        ]);
        for name in ["a", "b", "c"] {
            engine = engine
                .inbound(&format!("request_edit_in_{name}"), Some(name.as_bytes()))
                .outbound(
                    &format!("request_edit_out_{name}"),
                    Some(HttpMessage::request(format!("GET /{name} HTTP/1.1\r\n\r\n"))),
                );
        }
        engine
    }

    #[test]
    fn test_first_dirty_in_order_wins() {
        let (tabs, pipeline) = setup(abc());
        tabs.slot("b").unwrap().user_edit(b"B".to_vec());
        tabs.slot("c").unwrap().user_edit(b"C".to_vec());

        let out = pipeline.transform(&tabs, &HttpMessage::request(GET), &service());
        assert_eq!(out.message.as_bytes(), b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(out.slot, Some(tabs.slot("b").unwrap().id()));
    }

    #[test]
    fn test_nothing_dirty_passes_through() {
        let engine = abc();
        let calls = engine.calls.clone();
        let (tabs, pipeline) = setup(engine);
        calls.lock().unwrap().clear();

        let original = HttpMessage::request(GET);
        assert_eq!(pipeline.apply(&tabs, &original, &service()), original);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outbound_failure_passes_through() {
        let (tabs, pipeline) = setup(abc().failing("request_edit_out_a"));
        tabs.slot("a").unwrap().user_edit(b"A".to_vec());

        let original = HttpMessage::request(GET);
        let out = pipeline.apply(&tabs, &original, &service());
        assert_eq!(out.as_bytes(), original.as_bytes());
    }

    #[test]
    fn test_outbound_none_keeps_original() {
        let engine = FakeEngine::new(&["request_edit_in", "request_edit_out"])
            .inbound("request_edit_in", Some(b"x"))
            .outbound("request_edit_out", None);
        let (tabs, pipeline) = setup(engine);
        tabs.slot("0").unwrap().user_edit(b"y".to_vec());

        let out = pipeline.transform(&tabs, &HttpMessage::request(GET), &service());
        assert_eq!(out.message.as_bytes(), GET);
        assert_eq!(out.slot, None);
    }

    #[test]
    fn test_wrong_kind_passes_through() {
        let (tabs, pipeline) = setup(abc());
        tabs.slot("a").unwrap().user_edit(b"A".to_vec());
        let response = HttpMessage::response(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        assert_eq!(pipeline.apply(&tabs, &response, &service()), response);
    }
}
