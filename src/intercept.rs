//! Host-facing entry points for live traffic.
//!
//! For every request the host is about to send, the displayed request editor of the sending
//! tool gets a chance to apply its unsaved edits, then the script's `request` hook runs. Each
//! response goes through the `response` hook. Nothing here can fail: every error is logged and
//! the message goes on unchanged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::{
    http::{HttpMessage, HttpService, MessageKind, ToolSource},
    pipeline::TransformPipeline,
    registry::EditorRegistry,
    script::ScriptExecutor,
};

/// Prefix of the annotation put on requests rewritten by an editor.
pub const ANNOTATION_PREFIX: &str = "scalpel:";
/// Annotation put on responses to requests that carried [`ANNOTATION_PREFIX`].
pub const RESPONSE_ANNOTATION: &str = "scalpeled";

/// What the host should send on, and how to tag it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intercepted {
    pub message: HttpMessage,
    pub annotation: Option<String>,
}

pub fn is_scalpel_annotation(annotation: Option<&str>) -> bool {
    annotation.is_some_and(|a| a.starts_with(ANNOTATION_PREFIX))
}

#[derive(Debug, Clone)]
pub struct InterceptHandler {
    executor: Arc<ScriptExecutor>,
    registry: Arc<EditorRegistry>,
    pipeline: TransformPipeline,
}

impl InterceptHandler {
    pub fn new(executor: Arc<ScriptExecutor>, registry: Arc<EditorRegistry>) -> Self {
        let pipeline = TransformPipeline::new(executor.clone());
        Self {
            executor,
            registry,
            pipeline,
        }
    }

    pub fn handle_request_to_be_sent(
        &self,
        message: &HttpMessage,
        service: &HttpService,
        tool: &ToolSource,
    ) -> Intercepted {
        let mut annotation = None;

        // 1) unsaved edits of the editor the request was sent from
        let mut current = message.clone();
        if let Some(tabs) = self.registry.find_displayed(MessageKind::Request, tool) {
            let transformed = self.pipeline.transform(&tabs, message, service);
            if let Some(slot) = transformed.slot {
                debug!(tabs = %tabs.id(), %slot, ?tool, "request rewritten by displayed editor");
                annotation = Some(format!("{ANNOTATION_PREFIX}{slot}"));
            }
            current = transformed.message;
        }

        // 2) whole-message hook
        Intercepted {
            message: self.run_hook(MessageKind::Request, current, service),
            annotation,
        }
    }

    /// `request_annotation` is the annotation the matching request was sent with.
    pub fn handle_response_received(
        &self,
        message: &HttpMessage,
        service: &HttpService,
        request_annotation: Option<&str>,
    ) -> Intercepted {
        let annotation =
            is_scalpel_annotation(request_annotation).then(|| RESPONSE_ANNOTATION.to_string());
        Intercepted {
            message: self.run_hook(MessageKind::Response, message.clone(), service),
            annotation,
        }
    }

    fn run_hook(&self, kind: MessageKind, message: HttpMessage, service: &HttpService) -> HttpMessage {
        match self.executor.invoke_hook(kind, &message, service) {
            Ok(Some(new_message)) => new_message,
            Ok(None) => message,
            Err(e) => {
                error!(kind = %kind, callback = kind.as_str(), error = %e, "intercept hook failed, forwarding original");
                message
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        editor::{ImmediateDispatcher, WidgetKind},
        error::ScriptError,
        http::{EditorContext, EditorMode},
        provider::EditorProvider,
        script::{ScriptEngine, tests::FakeEngine},
    };

    const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

    fn service() -> HttpService {
        HttpService::new("example.com", 80, false)
    }

    /// FakeEngine plus a request hook that tags the path.
    struct HookEngine {
        inner: FakeEngine,
        fail: bool,
    }

    impl ScriptEngine for HookEngine {
        fn callbacks(&self) -> Vec<String> {
            self.inner.callbacks()
        }

        fn invoke_inbound(
            &mut self,
            callback: &str,
            tab: &str,
            message: &HttpMessage,
            service: &HttpService,
        ) -> Result<Option<Vec<u8>>, ScriptError> {
            self.inner.invoke_inbound(callback, tab, message, service)
        }

        fn invoke_outbound(
            &mut self,
            callback: &str,
            tab: &str,
            message: &HttpMessage,
            service: &HttpService,
            content: &[u8],
        ) -> Result<Option<HttpMessage>, ScriptError> {
            self.inner.invoke_outbound(callback, tab, message, service, content)
        }

        fn invoke_hook(
            &mut self,
            kind: MessageKind,
            message: &HttpMessage,
            _service: &HttpService,
        ) -> Result<Option<HttpMessage>, ScriptError> {
            if self.fail {
                return Err(ScriptError::CallbackFailed {
                    callback: kind.as_str().into(),
                    reason: "boom".into(),
                });
            }
            let mut raw = message.as_bytes().to_vec();
            raw.extend_from_slice(b"hooked");
            Ok(Some(HttpMessage::new(kind, raw)))
        }
    }

    fn setup(fail: bool) -> (EditorProvider, InterceptHandler) {
        let inner = FakeEngine::new(&["request_edit_in", "request_edit_out"])
            .inbound("request_edit_in", Some(b"content"))
            .outbound(
                "request_edit_out",
                Some(HttpMessage::request(&b"POST /edited HTTP/1.1\r\n\r\n"[..])),
            );
        let executor = ScriptExecutor::with_engine(Box::new(HookEngine { inner, fail }));
        let registry = EditorRegistry::new();
        let provider = EditorProvider::new(
            executor.clone(),
            registry.clone(),
            Arc::new(ImmediateDispatcher),
            WidgetKind::Raw,
        );
        (provider, InterceptHandler::new(executor, registry))
    }

    #[test]
    fn test_displayed_editor_is_applied_then_hook() {
        let (provider, handler) = setup(false);
        let tabs = provider.create_request_editor(EditorContext::new(ToolSource::Repeater, EditorMode::Default));
        tabs.refresh(&HttpMessage::request(GET), &service());
        tabs.set_displayed(true);
        let slot = tabs.slot("0").unwrap();
        slot.user_edit(b"changed".to_vec());

        let out = handler.handle_request_to_be_sent(&HttpMessage::request(GET), &service(), &ToolSource::Repeater);
        assert_eq!(out.message.as_bytes(), b"POST /edited HTTP/1.1\r\n\r\nhooked");
        assert_eq!(out.annotation, Some(format!("scalpel:{}", slot.id())));

        // another tool only gets the hook
        let out = handler.handle_request_to_be_sent(&HttpMessage::request(GET), &service(), &ToolSource::Proxy);
        assert!(out.message.as_bytes().starts_with(GET));
        assert_eq!(out.annotation, None);
    }

    #[test]
    fn test_hidden_editor_is_ignored() {
        let (provider, handler) = setup(false);
        let tabs = provider.create_request_editor(EditorContext::new(ToolSource::Repeater, EditorMode::Default));
        tabs.refresh(&HttpMessage::request(GET), &service());
        tabs.slot("0").unwrap().user_edit(b"changed".to_vec());

        let out = handler.handle_request_to_be_sent(&HttpMessage::request(GET), &service(), &ToolSource::Repeater);
        assert_eq!(out.annotation, None);
    }

    #[test]
    fn test_hook_failure_forwards_original() {
        let (_provider, handler) = setup(true);
        let msg = HttpMessage::response(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        let out = handler.handle_response_received(&msg, &service(), Some("scalpel:abc"));
        assert_eq!(out.message, msg);
        assert_eq!(out.annotation.as_deref(), Some(RESPONSE_ANNOTATION));

        let out = handler.handle_response_received(&msg, &service(), Some("Default"));
        assert_eq!(out.annotation, None);
    }
}
