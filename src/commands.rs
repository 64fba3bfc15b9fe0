//! What the command line subcommands do, kept out of `main` so it can be tested.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::{
    catalog::CallbackCatalog,
    editor::{ImmediateDispatcher, TabSet, WidgetKind},
    http::{EditorContext, EditorMode, HttpMessage, HttpService, MessageKind, ToolSource},
    pipeline::TransformPipeline,
    provider::EditorProvider,
    registry::EditorRegistry,
    script::{RhaiEngine, ScriptExecutor},
};

/// One visible tab as printed by `edit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabView {
    pub label: String,
    pub channel: String,
    pub editable: bool,
    pub content: String,
}

/// A provider with the script at `script` loaded.
pub fn load_provider(script: &Path, widgets: WidgetKind) -> Result<Arc<EditorProvider>> {
    let engine = RhaiEngine::from_file(script)
        .with_context(|| format!("loading script {}", script.display()))?;
    let provider = EditorProvider::new(
        ScriptExecutor::new(),
        EditorRegistry::new(),
        Arc::new(ImmediateDispatcher),
        widgets,
    );
    provider.reload(Box::new(engine));
    Ok(Arc::new(provider))
}

/// Read a message from `path`. The service comes from `service` or the `Host` header.
pub fn read_message(
    path: &Path,
    kind: MessageKind,
    service: Option<&str>,
) -> Result<(HttpMessage, HttpService)> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let message = HttpMessage::new(kind, raw);
    let service = match service {
        Some(url) => HttpService::from_url(url)?,
        None => message
            .service_from_host_header()
            .unwrap_or_else(|| HttpService::new("localhost", 80, false)),
    };
    Ok((message, service))
}

pub fn channels(script: &Path) -> Result<Arc<CallbackCatalog>> {
    let provider = load_provider(script, WidgetKind::Raw)?;
    Ok(provider.executor().catalog())
}

/// Human readable or JSON listing of a catalog.
pub fn render_channels(catalog: &CallbackCatalog, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(catalog)?);
    }
    let mut out = String::new();
    for kind in MessageKind::ALL {
        for (position, channel) in catalog.channels_for(kind).enumerate() {
            let mode = match (channel.has_inbound(), channel.has_outbound()) {
                (true, true) => "read/write",
                (true, false) => "read-only",
                (false, _) => "inert",
            };
            out.push_str(&format!("{kind}\t{}\t{mode}\n", channel.label(position)));
        }
    }
    if out.is_empty() {
        out.push_str("no editor callbacks found\n");
    }
    Ok(out)
}

fn open_editor(provider: &EditorProvider, kind: MessageKind) -> Arc<TabSet> {
    provider.create(kind, EditorContext::new(ToolSource::Extensions, EditorMode::Default))
}

/// Run every inbound callback of `script` on `message`.
pub fn edit(
    script: &Path,
    message: &HttpMessage,
    service: &HttpService,
    widgets: WidgetKind,
) -> Result<Vec<TabView>> {
    let provider = load_provider(script, widgets)?;
    let tabs = open_editor(&provider, message.kind());
    let views = tabs
        .refresh(message, service)
        .iter()
        .map(|slot| TabView {
            label: slot.label().to_string(),
            channel: slot.channel().name.clone(),
            editable: slot.editable(),
            content: widgets.render(&slot.content()),
        })
        .collect();
    Ok(views)
}

/// Put `content` into tab `label` as if typed by the user and build the outgoing message.
pub fn apply(
    script: &Path,
    message: &HttpMessage,
    service: &HttpService,
    label: &str,
    content: &str,
    widgets: WidgetKind,
) -> Result<HttpMessage> {
    let provider = load_provider(script, widgets)?;
    let tabs = open_editor(&provider, message.kind());
    tabs.refresh(message, service);

    let Some(slot) = tabs.visible_slots().into_iter().find(|s| s.label() == label) else {
        let visible: Vec<String> = tabs.visible_slots().iter().map(|s| s.label().to_string()).collect();
        bail!("no visible tab `{label}` for this message (visible: {})", visible.join(", "));
    };
    if !slot.editable() {
        bail!("tab `{label}` is read-only");
    }

    let bytes = widgets.parse_edit(content).map_err(anyhow::Error::msg)?;
    slot.user_edit(bytes);
    tabs.select(label);

    let pipeline = TransformPipeline::new(provider.executor().clone());
    Ok(pipeline.apply(&tabs, message, service))
}
