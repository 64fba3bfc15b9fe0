use std::{collections::HashMap, fs, path::{Path, PathBuf}};

use rhai::{AST, Array, Blob, CallFnOptions, Dynamic, Engine, Map, Scope};
use tracing::{debug, info, warn};

use crate::{
    catalog::{CallbackName, callback_prefix},
    error::{HttpError, ScriptError},
    http::{HttpMessage, HttpService, MessageKind},
    script::{ScriptEngine, helpers},
};

/// Name of the optional filter callback. `match` is a reserved word in rhai.
pub const MATCH_CALLBACK: &str = "matches";

/// A [Rhai](https://rhai.rs) script providing editor callbacks.
///
/// Every function whose name follows the `<kind>_edit_<in|out>[_<channel>]` convention becomes
/// part of an editor tab. Callbacks receive up to four arguments and only get as many as they
/// declare:
///
/// | Callback            | Arguments                         | Returns                           |
/// |---------------------|-----------------------------------|-----------------------------------|
/// | `*_edit_in*`        | `msg, service, tab`               | string / blob, or `()` to hide    |
/// | `*_edit_out*`       | `msg, text, service, tab`         | message map / string / blob / `()`|
/// | `request`/`response`| `msg, service`                    | message map / string / blob / `()`|
/// | `matches`           | `flow, event`                     | `true` to let the callback run    |
///
/// `msg` is a map with `kind`, `raw` (blob), `headers` (array of `#{name, value}`), `body`
/// (string when the body is UTF-8, blob otherwise) plus `method`/`path`/`version` for requests
/// and `version`/`status`/`reason` for responses.
///
/// ---
///
/// # Example: decode a base64 parameter
///
/// ```rhai
/// fn request_edit_in_b64(msg) {
///     b64decode(msg.body)
/// }
///
/// fn request_edit_out_b64(msg, text) {
///     msg.body = b64encode(text);
///     msg
/// }
/// ```
///
/// # Example: only edit traffic to one host
///
/// ```rhai
/// fn matches(flow, event) {
///     flow.host == "api.example.com"
/// }
/// ```
///
/// Returning a map rebuilds the message from its fields (and fixes `Content-Length`); a map
/// whose `raw` blob was replaced is used verbatim instead.
pub struct RhaiEngine {
    engine: Engine,
    ast: AST,
    source: String,
    /// function name -> declared parameter count
    functions: HashMap<String, usize>,
}

impl RhaiEngine {
    /// Compile the script at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ScriptError> {
        let script = fs::read_to_string(path)?;
        Self::from_source(&path.display().to_string(), &script)
    }

    /// Compile `script`, run its top level once and index its functions.
    pub fn from_source(source: &str, script: &str) -> Result<Self, ScriptError> {
        let engine = Self::build_engine();
        let ast = engine.compile(script).map_err(|e| ScriptError::Compile {
            path: source.to_string(),
            reason: e.to_string(),
        })?;

        // top-level statements are treated as script initialisation
        engine.run_ast(&ast).map_err(|e| ScriptError::Compile {
            path: source.to_string(),
            reason: e.to_string(),
        })?;

        let mut functions = HashMap::new();
        for f in ast.iter_functions() {
            let arity = f.params.len();
            functions
                .entry(f.name.to_string())
                .and_modify(|a: &mut usize| *a = (*a).max(arity))
                .or_insert(arity);
        }

        info!(source, functions = functions.len(), "compiled script");
        Ok(Self {
            engine,
            ast,
            source: source.to_string(),
            functions,
        })
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.source)
    }

    fn build_engine() -> Engine {
        let mut engine = Engine::new();
        engine.on_print(|s| info!(target: "script", "{s}"));
        engine.on_debug(|s, src, pos| debug!(target: "script", source = ?src, position = %pos, "{s}"));
        helpers::register(&mut engine);
        engine
    }

    fn has(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Call `name` with as many of `args` as the function declares.
    fn call(&self, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, ScriptError> {
        let arity = *self
            .functions
            .get(name)
            .ok_or_else(|| ScriptError::CallbackNotFound {
                callback: name.to_string(),
            })?;
        let args: Vec<Dynamic> = args.into_iter().take(arity).collect();

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let mut scope = Scope::new();
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, name, args)
            .map_err(|e| ScriptError::CallbackFailed {
                callback: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Ask the script's `matches` filter whether `event` should run. No filter means yes.
    fn filter(
        &self,
        kind: MessageKind,
        service: &HttpService,
        event: &str,
    ) -> Result<bool, ScriptError> {
        if !self.has(MATCH_CALLBACK) {
            return Ok(true);
        }
        let mut flow = Map::new();
        flow.insert("host".into(), Dynamic::from(service.host.clone()));
        flow.insert("port".into(), Dynamic::from(i64::from(service.port)));
        flow.insert("scheme".into(), Dynamic::from(service.scheme().to_string()));
        flow.insert("kind".into(), Dynamic::from(kind.as_str().to_string()));

        let verdict = self.call(
            MATCH_CALLBACK,
            vec![Dynamic::from_map(flow), Dynamic::from(event.to_string())],
        )?;
        let matched = verdict.as_bool().unwrap_or(false);
        debug!(event, host = %service.host, matched, "match filter");
        Ok(matched)
    }

    fn event_for(callback: &str) -> String {
        CallbackName::parse(callback)
            .map(|c| callback_prefix(c.kind, c.direction))
            .unwrap_or_else(|| callback.to_string())
    }
}

impl ScriptEngine for RhaiEngine {
    fn callbacks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    fn invoke_inbound(
        &mut self,
        callback: &str,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Result<Option<Vec<u8>>, ScriptError> {
        if !self.filter(message.kind(), service, &Self::event_for(callback))? {
            return Ok(None);
        }
        let value = self.call(
            callback,
            vec![
                message_to_dynamic(message),
                service_to_dynamic(service),
                Dynamic::from(tab.to_string()),
            ],
        )?;
        dynamic_to_bytes(callback, value)
    }

    fn invoke_outbound(
        &mut self,
        callback: &str,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
        content: &[u8],
    ) -> Result<Option<HttpMessage>, ScriptError> {
        if !self.filter(message.kind(), service, &Self::event_for(callback))? {
            return Ok(None);
        }
        let text = match std::str::from_utf8(content) {
            Ok(text) => Dynamic::from(text.to_string()),
            Err(_) => Dynamic::from_blob(content.to_vec()),
        };
        let value = self.call(
            callback,
            vec![
                message_to_dynamic(message),
                text,
                service_to_dynamic(service),
                Dynamic::from(tab.to_string()),
            ],
        )?;
        dynamic_to_message(callback, value, message)
    }

    fn invoke_hook(
        &mut self,
        kind: MessageKind,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Result<Option<HttpMessage>, ScriptError> {
        let name = kind.as_str();
        if !self.has(name) || !self.filter(kind, service, name)? {
            return Ok(None);
        }
        let value = self.call(
            name,
            vec![message_to_dynamic(message), service_to_dynamic(service)],
        )?;
        dynamic_to_message(name, value, message)
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}

fn service_to_dynamic(service: &HttpService) -> Dynamic {
    let mut map = Map::new();
    map.insert("host".into(), Dynamic::from(service.host.clone()));
    map.insert("port".into(), Dynamic::from(i64::from(service.port)));
    map.insert("secure".into(), Dynamic::from(service.secure));
    map.insert("scheme".into(), Dynamic::from(service.scheme().to_string()));
    Dynamic::from_map(map)
}

fn body_to_dynamic(body: &[u8]) -> Dynamic {
    match std::str::from_utf8(body) {
        Ok(text) => Dynamic::from(text.to_string()),
        Err(_) => Dynamic::from_blob(body.to_vec()),
    }
}

fn message_to_dynamic(message: &HttpMessage) -> Dynamic {
    let mut map = Map::new();
    map.insert("kind".into(), Dynamic::from(message.kind().as_str().to_string()));
    map.insert("raw".into(), Dynamic::from_blob(message.as_bytes().to_vec()));

    // unparseable messages still expose `raw`
    if let Ok(parsed) = message.parse() {
        let (a, b, c) = parsed.start_parts();
        match message.kind() {
            MessageKind::Request => {
                map.insert("method".into(), Dynamic::from(a));
                map.insert("path".into(), Dynamic::from(b));
                map.insert("version".into(), Dynamic::from(c));
            }
            MessageKind::Response => {
                map.insert("version".into(), Dynamic::from(a));
                map.insert("status".into(), Dynamic::from(b.parse::<i64>().unwrap_or(0)));
                map.insert("reason".into(), Dynamic::from(c));
            }
        }

        let headers: Array = parsed
            .headers
            .iter()
            .map(|(name, value)| {
                let mut header = Map::new();
                header.insert("name".into(), Dynamic::from(name.clone()));
                header.insert("value".into(), Dynamic::from(value.clone()));
                Dynamic::from_map(header)
            })
            .collect();
        map.insert("headers".into(), Dynamic::from_array(headers));
        map.insert("body".into(), body_to_dynamic(&parsed.body));
    }

    Dynamic::from_map(map)
}

fn dynamic_to_bytes(callback: &str, value: Dynamic) -> Result<Option<Vec<u8>>, ScriptError> {
    if value.is_unit() {
        return Ok(None);
    }
    if value.is_blob() {
        return Ok(value.try_cast::<Blob>());
    }
    if value.is_string() {
        return Ok(value.into_string().ok().map(String::into_bytes));
    }
    Err(ScriptError::UnsupportedReturn {
        callback: callback.to_string(),
        type_name: value.type_name().to_string(),
    })
}

fn dynamic_to_message(
    callback: &str,
    value: Dynamic,
    original: &HttpMessage,
) -> Result<Option<HttpMessage>, ScriptError> {
    if value.is_map() {
        let Some(map) = value.try_cast::<Map>() else {
            return Ok(None);
        };
        return map_to_message(callback, map, original).map(Some);
    }
    Ok(dynamic_to_bytes(callback, value)?.map(|raw| HttpMessage::new(original.kind(), raw)))
}

fn string_field(map: &Map, key: &str) -> Option<String> {
    map.get(key).and_then(|v| {
        if v.is_string() {
            v.clone().into_string().ok()
        } else if v.is_int() {
            v.as_int().ok().map(|i| i.to_string())
        } else {
            None
        }
    })
}

fn map_to_message(callback: &str, map: Map, original: &HttpMessage) -> Result<HttpMessage, ScriptError> {
    let kind = original.kind();

    // a replaced raw blob wins over the individual fields
    if let Some(raw) = map.get("raw").and_then(|v| v.clone().try_cast::<Blob>()) {
        if raw.as_slice() != original.as_bytes() {
            return Ok(HttpMessage::new(kind, raw));
        }
    }

    let invalid = |source: HttpError| ScriptError::InvalidMessage {
        callback: callback.to_string(),
        source,
    };
    let parsed = original.parse().map_err(invalid)?;
    let (a, b, c) = parsed.start_parts();

    let start_line = match kind {
        MessageKind::Request => format!(
            "{} {} {}",
            string_field(&map, "method").unwrap_or(a),
            string_field(&map, "path").unwrap_or(b),
            string_field(&map, "version").unwrap_or(c),
        ),
        MessageKind::Response => format!(
            "{} {} {}",
            string_field(&map, "version").unwrap_or(a),
            string_field(&map, "status").unwrap_or(b),
            string_field(&map, "reason").unwrap_or(c),
        ),
    };

    let headers = match map.get("headers") {
        Some(value) => {
            let Some(array) = value.clone().try_cast::<Array>() else {
                return Err(invalid(HttpError::Malformed("`headers` must be an array".into())));
            };
            array
                .into_iter()
                .map(|header| header_from_dynamic(header).ok_or_else(|| {
                    invalid(HttpError::Malformed(
                        "each header must be #{name, value} or [name, value]".into(),
                    ))
                }))
                .collect::<Result<Vec<_>, _>>()?
        }
        None => parsed.headers.clone(),
    };

    let body = match map.get("body") {
        Some(v) if v.is_blob() => v.clone().try_cast::<Blob>().unwrap_or_default(),
        Some(v) if v.is_string() => v.clone().into_string().map(String::into_bytes).unwrap_or_default(),
        Some(v) if v.is_unit() => Vec::new(),
        Some(v) => {
            warn!(callback, type_name = v.type_name(), "ignoring non-text body");
            parsed.body.clone()
        }
        None => parsed.body.clone(),
    };

    Ok(HttpMessage::from_parts(kind, &start_line, &headers, &body))
}

fn header_from_dynamic(value: Dynamic) -> Option<(String, String)> {
    if value.is_map() {
        let map = value.try_cast::<Map>()?;
        return Some((string_field(&map, "name")?, string_field(&map, "value")?));
    }
    let pair = value.try_cast::<Array>()?;
    match pair.as_slice() {
        [name, value] => Some((
            name.clone().into_string().ok()?,
            value.clone().into_string().ok()?,
        )),
        _ => None,
    }
}
