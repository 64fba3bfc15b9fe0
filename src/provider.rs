//! Creates the editors the host asks for and keeps them in step with the script.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::info;

use crate::{
    catalog::CallbackCatalog,
    editor::{TabSet, UiDispatcher, WidgetKind},
    http::{EditorContext, MessageKind, ToolSource},
    registry::EditorRegistry,
    script::{ScriptEngine, ScriptExecutor},
};

/// Factory for request and response editors.
///
/// Every editor it creates is registered for traffic correlation and rebuilt when the script
/// is reloaded. The provider tracks editors weakly; the host decides when they go away.
pub struct EditorProvider {
    executor: Arc<ScriptExecutor>,
    registry: Arc<EditorRegistry>,
    ui: Arc<dyn UiDispatcher>,
    widgets: WidgetKind,
    editors: Mutex<Vec<Weak<TabSet>>>,
}

impl EditorProvider {
    pub fn new(
        executor: Arc<ScriptExecutor>,
        registry: Arc<EditorRegistry>,
        ui: Arc<dyn UiDispatcher>,
        widgets: WidgetKind,
    ) -> Self {
        Self {
            executor,
            registry,
            ui,
            widgets,
            editors: Mutex::new(Vec::new()),
        }
    }

    pub fn executor(&self) -> &Arc<ScriptExecutor> {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<EditorRegistry> {
        &self.registry
    }

    pub fn create_request_editor(&self, context: EditorContext) -> Arc<TabSet> {
        self.create(MessageKind::Request, context)
    }

    pub fn create_response_editor(&self, context: EditorContext) -> Arc<TabSet> {
        self.create(MessageKind::Response, context)
    }

    pub fn create(&self, kind: MessageKind, context: EditorContext) -> Arc<TabSet> {
        let tabs = TabSet::new(
            kind,
            context,
            self.widgets,
            self.executor.clone(),
            self.ui.clone(),
        );
        tabs.attach(self.registry.register(&tabs));

        let mut editors = self.editors.lock().unwrap_or_else(PoisonError::into_inner);
        editors.retain(|w| w.strong_count() > 0);
        editors.push(Arc::downgrade(&tabs));
        tabs
    }

    /// Swap in `engine` and rebuild every live editor.
    pub fn reload(&self, engine: Box<dyn ScriptEngine>) -> Arc<CallbackCatalog> {
        let catalog = self.executor.load(engine);
        self.reset_editors();
        catalog
    }

    /// Rebuild every live editor from the current catalog. Returns how many were rebuilt.
    pub fn reset_editors(&self) -> usize {
        let live: Vec<Arc<TabSet>> = {
            let mut editors = self.editors.lock().unwrap_or_else(PoisonError::into_inner);
            editors.retain(|w| w.strong_count() > 0);
            editors.iter().filter_map(Weak::upgrade).collect()
        };
        for tabs in &live {
            tabs.reload();
        }
        info!(editors = live.len(), "reset editors");
        live.len()
    }

    /// The request editor currently displayed in `tool`, if any.
    pub fn displayed_request_editor(&self, tool: &ToolSource) -> Option<Arc<TabSet>> {
        self.registry.find_displayed(MessageKind::Request, tool)
    }
}

impl std::fmt::Debug for EditorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorProvider")
            .field("executor", &self.executor)
            .field("widgets", &self.widgets)
            .field("registered", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        editor::ImmediateDispatcher,
        http::{EditorMode, HttpMessage, HttpService},
        script::tests::FakeEngine,
    };

    const GET: &[u8] = b"GET / HTTP/1.1\r\n\r\n";

    fn provider(engine: FakeEngine) -> EditorProvider {
        EditorProvider::new(
            ScriptExecutor::with_engine(Box::new(engine)),
            EditorRegistry::new(),
            Arc::new(ImmediateDispatcher),
            WidgetKind::Raw,
        )
    }

    fn ctx(tool: ToolSource) -> EditorContext {
        EditorContext::new(tool, EditorMode::Default)
    }

    #[test]
    fn test_creates_and_registers() {
        let p = provider(FakeEngine::new(&["request_edit_in", "response_edit_in"]));
        let req = p.create_request_editor(ctx(ToolSource::Repeater));
        let res = p.create_response_editor(ctx(ToolSource::Repeater));
        assert_eq!(req.kind(), MessageKind::Request);
        assert_eq!(res.kind(), MessageKind::Response);
        assert_eq!(p.registry().len(), 2);

        req.set_displayed(true);
        assert_eq!(p.displayed_request_editor(&ToolSource::Repeater).unwrap().id(), req.id());

        drop(req);
        assert_eq!(p.registry().len(), 1);
    }

    #[test]
    fn test_reload_rebuilds_live_editors() {
        let p = provider(FakeEngine::new(&["request_edit_in_a"]).inbound("request_edit_in_a", Some(b"a")));
        let tabs = p.create_request_editor(ctx(ToolSource::Proxy));
        let gone = p.create_request_editor(ctx(ToolSource::Proxy));
        drop(gone);

        let svc = HttpService::new("example.com", 80, false);
        assert_eq!(tabs.refresh(&HttpMessage::request(GET), &svc).len(), 1);

        let catalog = p.reload(Box::new(
            FakeEngine::new(&["request_edit_in_b", "request_edit_in_c"])
                .inbound("request_edit_in_b", Some(b"b"))
                .inbound("request_edit_in_c", Some(b"c")),
        ));
        assert_eq!(catalog.channels().len(), 2);

        let labels: Vec<_> = tabs.visible_slots().iter().map(|s| s.label().to_string()).collect();
        assert_eq!(labels, vec!["b", "c"]);
        assert_eq!(p.reset_editors(), 1);
    }
}
