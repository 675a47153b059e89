//! Public entry point: template processing and cache/invalidation controls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::definition_cache::{DefinitionCache, DEFAULT_DEFINITION_TTL};
use crate::definitions::{FieldValue, FormData};
use crate::error::{EngineError, EngineResult};
use crate::exec_log::{ExecutionLog, ExecutionSink, DEFAULT_QUEUE_CAPACITY};
use crate::expr::{evaluate, evaluate_with_timeout, is_arithmetic, looks_like_expression, EvalLimits};
use crate::format::{format_general, NumberLocale};
use crate::resolver::{ResolveContext, Resolver, ResolverConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_DEPTH};
use crate::session::SessionStore;
use crate::shortcode::{closure, extract_ordered, substitute};
use crate::store::{FormulaStore, LookupStore, ReferenceTableReader};
use crate::tracker::DependencyTracker;

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub batch_size: usize,
    pub max_depth: usize,
    /// Level bound for the field-dependency closure.
    pub closure_depth: usize,
    pub limits: EvalLimits,
    pub definition_ttl: Duration,
    pub locale: NumberLocale,
    /// Any failed token fails the whole `process` call.
    pub strict_mode: bool,
    pub log_queue_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            closure_depth: closure::DEFAULT_CLOSURE_DEPTH,
            limits: EvalLimits::default(),
            definition_ttl: DEFAULT_DEFINITION_TTL,
            locale: NumberLocale::default(),
            strict_mode: false,
            log_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    pub session_id: String,
    pub form_data: FormData,
}

impl ProcessContext {
    pub fn new(session_id: &str, form_data: FormData) -> Self {
        Self {
            session_id: session_id.to_string(),
            form_data,
        }
    }
}

/// Result of [`ShortcodeEngine::process`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Direct shortcodes of the template as `kind:name`, first occurrence order.
    pub dependencies: Vec<String>,
    /// Template shortcodes decided in this call.
    pub processed_count: usize,
    pub execution_time_ms: u64,
    pub max_depth_exceeded: bool,
}

impl ProcessOutcome {
    fn failed(error: &EngineError, dependencies: Vec<String>, start: Instant) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            dependencies,
            processed_count: 0,
            execution_time_ms: start.elapsed().as_millis() as u64,
            max_depth_exceeded: false,
        }
    }
}

pub struct EngineBuilder {
    formulas: Arc<dyn FormulaStore>,
    lookups: Arc<dyn LookupStore>,
    tables: Arc<dyn ReferenceTableReader>,
    options: EngineOptions,
    sink: Option<Arc<dyn ExecutionSink>>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn execution_log(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the engine. With a sink configured this must run inside a tokio
    /// runtime; otherwise execution records are discarded.
    pub fn build(self) -> ShortcodeEngine {
        let options = self.options;
        let log = match self.sink {
            Some(sink) => ExecutionLog::spawn(sink, options.log_queue_capacity),
            None => ExecutionLog::disabled(),
        };
        ShortcodeEngine {
            definitions: DefinitionCache::new(self.formulas, self.lookups, self.tables, options.definition_ttl),
            sessions: SessionStore::new(),
            tracker: DependencyTracker::new(),
            log,
            config: ResolverConfig {
                batch_size: options.batch_size,
                max_depth: options.max_depth,
                limits: options.limits,
                locale: options.locale,
            },
            options,
        }
    }
}

pub struct ShortcodeEngine {
    definitions: DefinitionCache,
    sessions: SessionStore,
    tracker: DependencyTracker,
    log: ExecutionLog,
    config: ResolverConfig,
    options: EngineOptions,
}

impl ShortcodeEngine {
    pub fn builder(
        formulas: Arc<dyn FormulaStore>,
        lookups: Arc<dyn LookupStore>,
        tables: Arc<dyn ReferenceTableReader>,
    ) -> EngineBuilder {
        EngineBuilder {
            formulas,
            lookups,
            tables,
            options: EngineOptions::default(),
            sink: None,
        }
    }

    /// Builder over one backend that serves every definition kind.
    pub fn builder_for<S>(store: Arc<S>) -> EngineBuilder
    where
        S: FormulaStore + LookupStore + ReferenceTableReader + 'static,
    {
        Self::builder(store.clone(), store.clone(), store)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Resolve every shortcode in `text` for the session and render the result.
    ///
    /// Token failures become inline `[Error: ...]` markers unless strict mode
    /// is on. When the rendered text is pure arithmetic it is evaluated.
    pub async fn process(&self, text: &str, ctx: &ProcessContext) -> ProcessOutcome {
        let start = Instant::now();
        let seeds = extract_ordered(text);
        let dependencies: Vec<String> = seeds.iter().map(ToString::to_string).collect();

        if ctx.session_id.trim().is_empty() {
            let err = EngineError::InvalidContext("session id is empty".to_string());
            return ProcessOutcome::failed(&err, dependencies, start);
        }
        let session_id = ctx.session_id.as_str();

        // The call's form data is the whole truth: fields it no longer
        // carries are dropped, and both kinds of change invalidate.
        let stale: Vec<String> = self
            .sessions
            .fields(session_id)
            .iter()
            .filter(|(name, _)| ctx.form_data.get(name).is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.remove_field(session_id, name);
        }
        for (name, value) in ctx.form_data.iter() {
            self.set_field(session_id, name, value.clone());
        }

        let resolver = Resolver {
            definitions: &self.definitions,
            sessions: &self.sessions,
            tracker: &self.tracker,
            log: &self.log,
            config: &self.config,
        };
        let resolve_ctx = ResolveContext {
            session_id,
            fields: &ctx.form_data,
        };
        let resolution = resolver.resolve(&seeds, &resolve_ctx).await;
        tracing::info!(session = session_id, "{}", resolution.report.log_line());

        let processed_count = seeds.iter().filter(|s| resolution.get(s).is_some()).count();
        let max_depth_exceeded = resolution.report.max_depth_exceeded;

        if self.options.strict_mode {
            if let Some(Err(err)) = seeds.iter().filter_map(|s| resolution.get(s)).find(|r| r.is_err()) {
                return ProcessOutcome {
                    processed_count,
                    max_depth_exceeded,
                    ..ProcessOutcome::failed(err, dependencies, start)
                };
            }
        }

        let rendered = substitute(text, |code| match resolution.get(code) {
            Some(Ok(value)) => value.display.clone(),
            Some(Err(err)) => err.marker(),
            None => format!("[{}]", code),
        });

        let evaluable = is_arithmetic(&rendered) || (seeds.is_empty() && looks_like_expression(&rendered));
        let rendered = if evaluable {
            evaluate_with_timeout(&rendered, &self.config.limits)
                .await
                .map(format_general)
        } else {
            Ok(rendered)
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;
        match rendered {
            Ok(result) => ProcessOutcome {
                success: true,
                result: Some(result),
                error: None,
                dependencies,
                processed_count,
                execution_time_ms,
                max_depth_exceeded,
            },
            Err(err) => ProcessOutcome {
                processed_count,
                max_depth_exceeded,
                ..ProcessOutcome::failed(&err, dependencies, start)
            },
        }
    }

    /// Direct evaluator access with the engine's limits.
    pub fn evaluate(&self, text: &str) -> EngineResult<f64> {
        evaluate(text, &self.config.limits)
    }

    /// Every form field `text` needs, following calc and lookup definitions.
    pub async fn extract_field_dependencies(&self, text: &str) -> Vec<String> {
        closure::extract_field_dependencies(text, &self.definitions, self.options.closure_depth).await
    }

    /// Store a field value. A changed value queues every dependent
    /// calculation; the newly queued names are returned.
    pub fn set_field(&self, session_id: &str, name: &str, value: impl Into<FieldValue>) -> Vec<String> {
        if !self.sessions.write_field(session_id, name, value.into()) {
            return Vec::new();
        }
        self.field_changed(session_id, name)
    }

    /// Forget a field; dependents are queued as for a changed value.
    pub fn remove_field(&self, session_id: &str, name: &str) -> Vec<String> {
        if !self.sessions.remove_field(session_id, name) {
            return Vec::new();
        }
        self.field_changed(session_id, name)
    }

    fn field_changed(&self, session_id: &str, name: &str) -> Vec<String> {
        let mut queued = self.tracker.on_field_changed(session_id, name);
        for target in override_targets(name) {
            queued.extend(self.tracker.on_calculation_changed(session_id, &target));
        }
        queued
    }

    pub fn register_dependencies<F, C>(&self, name: &str, fields: F, calculations: C)
    where
        F: IntoIterator,
        F::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        self.tracker.register(name, fields, calculations);
    }

    pub fn needs_recalculation(&self, session_id: &str, name: &str) -> bool {
        self.tracker.needs_recalculation(session_id, name)
    }

    pub fn mark_current(&self, session_id: &str, name: &str) -> bool {
        self.tracker.mark_current(session_id, name)
    }

    /// Calculations queued for recomputation in a session.
    pub fn pending_recalculations(&self, session_id: &str) -> Vec<String> {
        self.tracker.pending(session_id)
    }

    /// Session-scoped: drop that session's computed values and its
    /// invalidation queue. Global: also every definition.
    pub fn clear_cache(&self, session_id: Option<&str>) {
        self.sessions.clear_cached(session_id);
        match session_id {
            Some(id) => self.tracker.clear_session(id),
            None => {
                self.tracker.clear_all_sessions();
                self.definitions.clear();
            }
        }
        tracing::info!(session = ?session_id, "caches cleared");
    }

    pub fn end_session(&self, session_id: &str) -> bool {
        self.tracker.clear_session(session_id);
        self.sessions.end_session(session_id)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn tracker(&self) -> &DependencyTracker {
        &self.tracker
    }

    pub fn definitions(&self) -> &DefinitionCache {
        &self.definitions
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Flush queued execution records and stop the log worker.
    pub async fn shutdown(&self) {
        self.log.close().await;
    }
}

/// Calculation names an `override_<name>` field stands in for.
fn override_targets(field: &str) -> Vec<String> {
    let lowered = field.trim().to_lowercase();
    let Some(target) = lowered
        .strip_prefix("override_")
        .or_else(|| lowered.strip_prefix("override-"))
    else {
        return Vec::new();
    };
    let mut names = vec![
        target.to_string(),
        target.replace('_', " "),
        target.replace('_', "-"),
        target.replace('-', " "),
    ];
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::Formula;
    use crate::store::MemoryStore;

    fn engine(store: MemoryStore) -> ShortcodeEngine {
        ShortcodeEngine::builder_for(Arc::new(store)).build()
    }

    fn ctx(fields: FormData) -> ProcessContext {
        ProcessContext::new("s1", fields)
    }

    #[tokio::test]
    async fn test_process_plain_text() {
        let e = engine(MemoryStore::new());
        let out = e.process("Hello world", &ctx(FormData::new())).await;
        assert!(out.success);
        assert_eq!(out.result.as_deref(), Some("Hello world"));
        assert!(out.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_process_template_with_text() {
        let e = engine(MemoryStore::new().with_formula(Formula::new("area", "[field:w] * [field:h]")));
        let fields = FormData::new().with("w", 4).with("h", 5);
        let out = e.process("Area: [calc:area] m2", &ctx(fields)).await;
        assert_eq!(out.result.as_deref(), Some("Area: 20 m2"));
        assert_eq!(out.dependencies, vec!["calc:area".to_string()]);
        assert_eq!(out.processed_count, 1);
    }

    #[tokio::test]
    async fn test_empty_session_rejected() {
        let e = engine(MemoryStore::new());
        let out = e.process("1+1", &ProcessContext::new("  ", FormData::new())).await;
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("Invalid context: session id is empty"));
    }

    #[tokio::test]
    async fn test_unsafe_raw_input_rejected() {
        let e = engine(MemoryStore::new());
        let out = e.process("2+__proto__", &ctx(FormData::new())).await;
        assert!(!out.success);
        assert!(out.error.unwrap_or_default().starts_with("Unsafe expression"));
    }

    #[test]
    fn test_set_field_reports_queued() {
        let e = engine(MemoryStore::new());
        e.register_dependencies("energy_need", ["square_meters"], Vec::<String>::new());
        assert!(e.set_field("s1", "square_meters", 80).contains(&"energy_need".to_string()));
        e.mark_current("s1", "energy_need");
        assert!(e.set_field("s1", "square_meters", 80).is_empty());
        assert!(e.set_field("s1", "square_meters", 120).contains(&"energy_need".to_string()));
        assert!(e.needs_recalculation("s1", "energy_need"));
    }

    #[tokio::test]
    async fn test_override_invalidates_dependents() {
        let e = engine(
            MemoryStore::new()
                .with_formula(Formula::new("base", "10"))
                .with_formula(Formula::new("double", "[calc:base] * 2")),
        );
        let out = e.process("[calc:double]", &ctx(FormData::new())).await;
        assert_eq!(out.result.as_deref(), Some("20"));

        let out = e
            .process("[calc:double]", &ctx(FormData::new().with("override_base", "50")))
            .await;
        assert_eq!(out.result.as_deref(), Some("100"));
    }

    #[tokio::test]
    async fn test_clear_cache_scoped() {
        let e = engine(MemoryStore::new().with_formula(Formula::new("a", "1")));
        e.process("[calc:a]", &ctx(FormData::new())).await;
        e.process("[calc:a]", &ProcessContext::new("s2", FormData::new())).await;

        e.clear_cache(Some("s1"));
        assert_eq!(e.sessions().cached_count("s1"), 0);
        assert_eq!(e.sessions().cached_count("s2"), 1);

        e.clear_cache(None);
        assert_eq!(e.sessions().cached_count("s2"), 0);
    }

    #[test]
    fn test_override_targets() {
        assert_eq!(override_targets("override_net_price"), vec!["net price", "net-price", "net_price"]);
        assert!(override_targets("price").is_empty());
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = ProcessOutcome {
            success: true,
            result: Some("7".into()),
            error: None,
            dependencies: vec!["calc:total".into()],
            processed_count: 1,
            execution_time_ms: 0,
            max_depth_exceeded: false,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["processedCount"], 1);
        assert_eq!(json["executionTimeMs"], 0);
        assert!(json.get("error").is_none());
    }
}
