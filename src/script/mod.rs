//! Access to the user's script.
//!
//! The embedded interpreter is not reentrant, so every call into it goes through
//! [`ScriptExecutor`], which owns the single engine instance behind one process-wide lock.
//! Callers on the UI thread and on network worker threads block until the lock is free.
//! There is no timeout: a callback that never returns blocks its caller indefinitely.

pub mod helpers;
pub mod rhai_engine;

use std::sync::{
    Arc, Mutex, PoisonError, RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tracing::{debug, info, trace};

use crate::{
    catalog::{CallbackCatalog, Channel, Direction},
    error::ScriptError,
    http::{HttpMessage, HttpService, MessageKind},
};

pub use rhai_engine::RhaiEngine;

/// The narrow interface the editor core needs from a scripting engine.
///
/// Implementations are only ever called with the executor's lock held, one call at a time.
pub trait ScriptEngine: Send {
    /// Names of every callable the current script exposes.
    fn callbacks(&self) -> Vec<String>;

    /// Produce editor content for `message`. `Ok(None)` hides the tab for this message.
    fn invoke_inbound(
        &mut self,
        callback: &str,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Result<Option<Vec<u8>>, ScriptError>;

    /// Produce a new message from edited `content`. `Ok(None)` keeps the original message.
    fn invoke_outbound(
        &mut self,
        callback: &str,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
        content: &[u8],
    ) -> Result<Option<HttpMessage>, ScriptError>;

    /// Whole-message interception hook run on live traffic. Engines without hooks pass through.
    fn invoke_hook(
        &mut self,
        _kind: MessageKind,
        _message: &HttpMessage,
        _service: &HttpService,
    ) -> Result<Option<HttpMessage>, ScriptError> {
        Ok(None)
    }

    fn describe(&self) -> String {
        "script engine".to_string()
    }
}

/// Owns the engine and serializes every invocation.
pub struct ScriptExecutor {
    /// The global invocation lock.
    engine: Mutex<Option<Box<dyn ScriptEngine>>>,
    catalog: RwLock<Arc<CallbackCatalog>>,
    enabled: AtomicBool,
    generation: AtomicU64,
}

impl ScriptExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: Mutex::new(None),
            catalog: RwLock::new(Arc::new(CallbackCatalog::default())),
            enabled: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        })
    }

    pub fn with_engine(engine: Box<dyn ScriptEngine>) -> Arc<Self> {
        let me = Self::new();
        me.load(engine);
        me
    }

    /// Swap in a freshly loaded engine and recompute the catalog.
    ///
    /// Waits for any in-flight callback to finish first. Returns the new catalog.
    pub fn load(&self, engine: Box<dyn ScriptEngine>) -> Arc<CallbackCatalog> {
        let mut guard = self.lock_engine();
        let names = engine.callbacks();
        let catalog = Arc::new(CallbackCatalog::from_names(&names));
        info!(
            engine = %engine.describe(),
            callbacks = names.len(),
            channels = catalog.channels().len(),
            "script loaded"
        );
        *guard = Some(engine);
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        catalog
    }

    /// Drop the current engine. Every later invocation fails with `EngineUnavailable`.
    pub fn unload(&self) {
        let mut guard = self.lock_engine();
        *guard = None;
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(CallbackCatalog::default());
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("script unloaded");
    }

    /// Catalog of the currently loaded script. Readable from any thread without the engine lock.
    pub fn catalog(&self) -> Arc<CallbackCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bumped on every load/unload; editors compare it to know when to rebuild.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// While disabled every invocation is a no-op and traffic passes through untouched.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn invoke_inbound(
        &self,
        channel: &Channel,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Result<Option<Vec<u8>>, ScriptError> {
        let Some(callback) = channel.callback(Direction::Inbound) else {
            return Ok(None);
        };
        self.run(callback, |engine| {
            engine.invoke_inbound(callback, tab, message, service)
        })
    }

    pub fn invoke_outbound(
        &self,
        channel: &Channel,
        tab: &str,
        message: &HttpMessage,
        service: &HttpService,
        content: &[u8],
    ) -> Result<Option<HttpMessage>, ScriptError> {
        let Some(callback) = channel.callback(Direction::Outbound) else {
            return Ok(None);
        };
        self.run(callback, |engine| {
            engine.invoke_outbound(callback, tab, message, service, content)
        })
    }

    pub fn invoke_hook(
        &self,
        kind: MessageKind,
        message: &HttpMessage,
        service: &HttpService,
    ) -> Result<Option<HttpMessage>, ScriptError> {
        self.run(kind.as_str(), |engine| engine.invoke_hook(kind, message, service))
    }

    /// Run `f` against the engine with the invocation lock held.
    fn run<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut dyn ScriptEngine) -> Result<Option<T>, ScriptError>,
    ) -> Result<Option<T>, ScriptError> {
        if !self.is_enabled() {
            trace!(callback = name, "script disabled, skipping");
            return Ok(None);
        }

        // logged before blocking so a hung callback shows up in traces
        trace!(callback = name, "awaiting engine lock");
        let mut guard = self.lock_engine();
        let engine = guard.as_mut().ok_or(ScriptError::EngineUnavailable)?;

        let result = f(&mut **engine);
        debug!(callback = name, ok = result.is_ok(), "callback finished");
        result
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn ScriptEngine>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ScriptExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExecutor")
            .field("enabled", &self.is_enabled())
            .field("generation", &self.generation())
            .field("channels", &self.catalog().channels().len())
            .finish()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Scriptable in-memory engine used across the crate's tests.
    #[derive(Default, Clone)]
    pub struct FakeEngine {
        pub names: Vec<String>,
        /// callback -> content returned by inbound calls (`None` = no effect)
        pub inbound: HashMap<String, Option<Vec<u8>>>,
        /// callback -> message returned by outbound calls
        pub outbound: HashMap<String, Option<HttpMessage>>,
        /// callbacks that fail when invoked
        pub failing: Vec<String>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeEngine {
        pub fn new(names: &[&str]) -> Self {
            Self {
                names: names.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        pub fn inbound(mut self, callback: &str, content: Option<&[u8]>) -> Self {
            self.inbound.insert(callback.to_string(), content.map(|c| c.to_vec()));
            self
        }

        pub fn outbound(mut self, callback: &str, message: Option<HttpMessage>) -> Self {
            self.outbound.insert(callback.to_string(), message);
            self
        }

        pub fn failing(mut self, callback: &str) -> Self {
            self.failing.push(callback.to_string());
            self
        }

        fn check(&self, callback: &str) -> Result<(), ScriptError> {
            self.calls.lock().unwrap().push(callback.to_string());
            if self.failing.iter().any(|f| f == callback) {
                return Err(ScriptError::CallbackFailed {
                    callback: callback.to_string(),
                    reason: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    impl ScriptEngine for FakeEngine {
        fn callbacks(&self) -> Vec<String> {
            self.names.clone()
        }

        fn invoke_inbound(
            &mut self,
            callback: &str,
            _tab: &str,
            _message: &HttpMessage,
            _service: &HttpService,
        ) -> Result<Option<Vec<u8>>, ScriptError> {
            self.check(callback)?;
            Ok(self.inbound.get(callback).cloned().flatten())
        }

        fn invoke_outbound(
            &mut self,
            callback: &str,
            _tab: &str,
            _message: &HttpMessage,
            _service: &HttpService,
            _content: &[u8],
        ) -> Result<Option<HttpMessage>, ScriptError> {
            self.check(callback)?;
            Ok(self.outbound.get(callback).cloned().flatten())
        }
    }

    /// Records the enter/exit time of every call and fails if two calls overlap.
    struct RecordingEngine {
        spans: Arc<Mutex<Vec<(Instant, Instant)>>>,
        busy: Arc<AtomicBool>,
    }

    impl RecordingEngine {
        fn record(&self) {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "engine entered twice");
            let enter = Instant::now();
            thread::sleep(Duration::from_millis(15));
            let exit = Instant::now();
            self.busy.store(false, Ordering::SeqCst);
            self.spans.lock().unwrap().push((enter, exit));
        }
    }

    impl ScriptEngine for RecordingEngine {
        fn callbacks(&self) -> Vec<String> {
            vec!["request_edit_in".into(), "request_edit_out".into()]
        }

        fn invoke_inbound(
            &mut self,
            _callback: &str,
            _tab: &str,
            _message: &HttpMessage,
            _service: &HttpService,
        ) -> Result<Option<Vec<u8>>, ScriptError> {
            self.record();
            Ok(Some(b"x".to_vec()))
        }

        fn invoke_outbound(
            &mut self,
            _callback: &str,
            _tab: &str,
            message: &HttpMessage,
            _service: &HttpService,
            _content: &[u8],
        ) -> Result<Option<HttpMessage>, ScriptError> {
            self.record();
            Ok(Some(message.clone()))
        }
    }

    fn service() -> HttpService {
        HttpService::new("example.com", 80, false)
    }

    #[test]
    fn test_invocations_never_overlap() {
        let spans = Arc::new(Mutex::new(Vec::new()));
        let executor = ScriptExecutor::with_engine(Box::new(RecordingEngine {
            spans: spans.clone(),
            busy: Arc::new(AtomicBool::new(false)),
        }));
        let channel = executor.catalog().get(MessageKind::Request, "").unwrap().clone();

        let mut handles = Vec::new();
        for i in 0..4 {
            let executor = executor.clone();
            let channel = channel.clone();
            handles.push(thread::spawn(move || {
                let msg = HttpMessage::request(&b"GET / HTTP/1.1\r\n\r\n"[..]);
                for _ in 0..3 {
                    if i % 2 == 0 {
                        executor.invoke_inbound(&channel, "0", &msg, &service()).unwrap();
                    } else {
                        executor
                            .invoke_outbound(&channel, "0", &msg, &service(), b"x")
                            .unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut spans = spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 12);
        spans.sort_by_key(|(enter, _)| *enter);
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "callback executions overlapped");
        }
    }

    #[test]
    fn test_no_engine_is_an_error() {
        let executor = ScriptExecutor::new();
        let catalog = CallbackCatalog::from_names(["request_edit_in"]);
        let channel = catalog.get(MessageKind::Request, "").unwrap();
        let msg = HttpMessage::request(&b"GET / HTTP/1.1\r\n\r\n"[..]);
        let err = executor
            .invoke_inbound(channel, "0", &msg, &service())
            .unwrap_err();
        assert!(matches!(err, ScriptError::EngineUnavailable));
    }

    #[test]
    fn test_disabled_is_a_no_op() {
        let engine = FakeEngine::new(&["request_edit_in"]).inbound("request_edit_in", Some(b"hi"));
        let calls = engine.calls.clone();
        let executor = ScriptExecutor::with_engine(Box::new(engine));
        let channel = executor.catalog().get(MessageKind::Request, "").unwrap().clone();
        let msg = HttpMessage::request(&b"GET / HTTP/1.1\r\n\r\n"[..]);

        executor.disable();
        assert_eq!(executor.invoke_inbound(&channel, "0", &msg, &service()).unwrap(), None);
        assert!(calls.lock().unwrap().is_empty());

        executor.enable();
        assert_eq!(
            executor.invoke_inbound(&channel, "0", &msg, &service()).unwrap(),
            Some(b"hi".to_vec())
        );
    }

    #[test]
    fn test_load_bumps_generation_and_catalog() {
        let executor = ScriptExecutor::new();
        assert_eq!(executor.generation(), 0);
        assert!(executor.catalog().is_empty());

        executor.load(Box::new(FakeEngine::new(&["response_edit_in_json"])));
        assert_eq!(executor.generation(), 1);
        assert!(executor.catalog().get(MessageKind::Response, "json").is_some());

        executor.unload();
        assert_eq!(executor.generation(), 2);
        assert!(executor.catalog().is_empty());
    }
}
