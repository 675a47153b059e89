//! Iterative, depth-bounded token resolution.
//!
//! One resolution pass drains a frontier of tokens in fixed-size batches.
//! Each round expands up to `batch_size` tokens concurrently; any token a
//! definition references is deferred to a later round, so cross-round order
//! is the only ordering guarantee. A token whose text still has undecided
//! references waits in `pending` and is finished as soon as they settle.
//!
//! Field tokens are leaves read from the call's form data. They are decided
//! the moment they are discovered and never occupy a batch slot.
//!
//! Cycles are detected across every token kind: a token that would wait on
//! a pending chain leading back to itself fails with `CircularDependency`,
//! and everything waiting on it inherits that error.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::definition_cache::DefinitionCache;
use crate::definitions::{hyphenate, Action, FieldValue, FormData};
use crate::error::{EngineError, EngineResult};
use crate::exec_log::{ExecutionLog, ExecutionRecord};
use crate::expr::{evaluate_with_timeout, EvalLimits};
use crate::format::{format_localized, NumberLocale};
use crate::lookup::{select_action, select_legacy, Selection};
use crate::session::{ProcessedValue, ResolvedValue, SessionStore};
use crate::shortcode::{extract_ordered, sole_shortcode, substitute, Shortcode};
use crate::tracker::DependencyTracker;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Errors kept in a report are truncated to this many.
const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub batch_size: usize,
    /// Dependency hops allowed below the seeds. The seed round itself is
    /// not counted, so a pass runs at most `max_depth + 1` rounds.
    pub max_depth: usize,
    pub limits: EvalLimits,
    /// Formatting for lookup formula results.
    pub locale: NumberLocale,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            limits: EvalLimits::default(),
            locale: NumberLocale::default(),
        }
    }
}

/// Session and field snapshot a pass resolves against.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub session_id: &'a str,
    pub fields: &'a FormData,
}

/// A token that failed during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenError {
    pub token: String,
    pub error: String,
}

/// Summary of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionReport {
    pub duration_ms: u64,
    pub rounds: usize,
    /// Tokens decided in this pass, fields included.
    pub tokens_decided: usize,
    pub cache_hits: usize,
    /// Formula and lookup evaluations actually performed.
    pub evaluated: usize,
    pub cycles: usize,
    /// Round budget ran out with tokens still unresolved.
    pub max_depth_exceeded: bool,
    /// Failed tokens (truncated to the first 100).
    pub errors: Vec<TokenError>,
}

impl ResolutionReport {
    pub fn summary(&self) -> String {
        format!(
            "{} tokens in {}ms, rounds={}, hits={}, evaluated={}, cycles={}, depth_exceeded={}",
            self.tokens_decided,
            self.duration_ms,
            self.rounds,
            self.cache_hits,
            self.evaluated,
            self.cycles,
            self.max_depth_exceeded,
        )
    }

    /// Format: `[resolve] 3ms  5 tokens  rounds=2  hits=1  cycles=0  errors=0`
    pub fn log_line(&self) -> String {
        let mut line = format!(
            "[resolve] {:>4}ms  {} tokens  rounds={}  hits={}  cycles={}  errors={}",
            self.duration_ms,
            self.tokens_decided,
            self.rounds,
            self.cache_hits,
            self.cycles,
            self.errors.len(),
        );
        if self.max_depth_exceeded {
            line.push_str("  depth-exceeded");
        }
        line
    }
}

/// Outcome of a pass: every decided token and the report.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub values: FxHashMap<Shortcode, EngineResult<ResolvedValue>>,
    pub report: ResolutionReport,
}

impl Resolution {
    pub fn get(&self, token: &Shortcode) -> Option<&EngineResult<ResolvedValue>> {
        self.values.get(token)
    }
}

// ============================================================================
// Pass state
// ============================================================================

/// How a deferred token is finished once its references are decided.
#[derive(Debug, Clone)]
enum Finish {
    Calc {
        unit: Option<String>,
    },
    LookupFormula {
        unit: Option<String>,
        selection: Selection,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    raw_text: String,
    deps: Vec<Shortcode>,
    finish: Finish,
}

/// Side effects of a decided token, applied at the round boundary.
struct Produced {
    token: Shortcode,
    entry: Option<ProcessedValue>,
    calculation: Option<(f64, Option<String>)>,
    record: Option<ExecutionRecord>,
    /// Cache hit re-syncing the calculation map; logged only on change.
    refresh: bool,
}

enum Expansion {
    Decided {
        result: EngineResult<ResolvedValue>,
        produced: Option<Produced>,
        cache_hit: bool,
    },
    Deferred(Pending),
}

#[derive(Default)]
struct Pass {
    done: FxHashMap<Shortcode, EngineResult<ResolvedValue>>,
    pending: FxHashMap<Shortcode, Pending>,
    queue: VecDeque<Shortcode>,
    known: FxHashSet<Shortcode>,
    produced: Vec<Produced>,
    report: ResolutionReport,
}

impl Pass {
    fn enqueue(&mut self, token: Shortcode, fields: &FormData) {
        if !self.known.insert(token.clone()) {
            return;
        }
        match &token {
            Shortcode::Field(name) => {
                let value = resolve_field(name, fields);
                self.decide(token, value);
            }
            Shortcode::Calc(_) | Shortcode::Lookup(_) => self.queue.push_back(token),
        }
    }

    fn decide(&mut self, token: Shortcode, result: EngineResult<ResolvedValue>) {
        if let Err(e) = &result {
            if self.report.errors.len() < MAX_REPORTED_ERRORS {
                self.report.errors.push(TokenError {
                    token: token.to_string(),
                    error: e.to_string(),
                });
            }
        }
        self.done.insert(token, result);
    }

    /// Pending chain from `from` that ends at `target`, if any.
    fn waits_on(&self, from: &Shortcode, target: &Shortcode) -> Option<Vec<Shortcode>> {
        if !self.pending.contains_key(from) {
            return None;
        }
        let mut parents: FxHashMap<Shortcode, Shortcode> = FxHashMap::default();
        let mut visited: FxHashSet<Shortcode> = FxHashSet::default();
        let mut stack = vec![from.clone()];
        visited.insert(from.clone());

        while let Some(node) = stack.pop() {
            let Some(pending) = self.pending.get(&node) else {
                continue;
            };
            for dep in &pending.deps {
                if dep == target {
                    let mut path = vec![node.clone()];
                    let mut cursor = node.clone();
                    while let Some(parent) = parents.get(&cursor) {
                        path.push(parent.clone());
                        cursor = parent.clone();
                    }
                    path.reverse();
                    path.push(target.clone());
                    return Some(path);
                }
                if self.pending.contains_key(dep) && visited.insert(dep.clone()) {
                    parents.insert(dep.clone(), node.clone());
                    stack.push(dep.clone());
                }
            }
        }
        None
    }
}

fn resolve_field(name: &str, fields: &FormData) -> EngineResult<ResolvedValue> {
    let value = fields
        .get(name)
        .filter(|v| !v.is_missing())
        .ok_or_else(|| EngineError::MissingField(name.to_string()))?;
    Ok(ResolvedValue {
        display: value.as_text().unwrap_or_default(),
        numeric: value.as_number(),
        unit: None,
    })
}

/// `override_<name>` in plain, underscored, or hyphenated spelling.
fn find_override(name: &str, fields: &FormData) -> Option<String> {
    let underscored: String = name
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect();
    let hyphenated = hyphenate(name);
    [
        format!("override_{}", name),
        format!("override_{}", underscored),
        format!("override_{}", hyphenated),
        format!("override-{}", hyphenated),
    ]
    .iter()
    .find_map(|key| fields.get(key).and_then(FieldValue::as_text))
}

fn chain_text(chain: &[Shortcode]) -> String {
    chain.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" → ")
}

// ============================================================================
// Resolver
// ============================================================================

/// Borrowed view over the engine's shared services for one pass.
pub struct Resolver<'a> {
    pub definitions: &'a DefinitionCache,
    pub sessions: &'a SessionStore,
    pub tracker: &'a DependencyTracker,
    pub log: &'a ExecutionLog,
    pub config: &'a ResolverConfig,
}

impl<'a> Resolver<'a> {
    pub async fn resolve(&self, seeds: &[Shortcode], ctx: &ResolveContext<'_>) -> Resolution {
        let start = Instant::now();
        let mut pass = Pass::default();
        for seed in seeds {
            pass.enqueue(seed.clone(), ctx.fields);
        }

        while !pass.queue.is_empty() && pass.report.rounds <= self.config.max_depth {
            pass.report.rounds += 1;
            let take = self.config.batch_size.max(1).min(pass.queue.len());
            let batch: Vec<Shortcode> = pass.queue.drain(..take).collect();

            let expansions = join_all(batch.iter().map(|token| self.expand(token, ctx))).await;
            for (token, expansion) in batch.into_iter().zip(expansions) {
                self.apply(&mut pass, token, expansion, ctx);
            }
            self.settle(&mut pass, ctx).await;
            self.write_back(&mut pass, ctx);

            tracing::debug!(
                round = pass.report.rounds,
                queued = pass.queue.len(),
                pending = pass.pending.len(),
                "resolution round complete"
            );
        }

        if !pass.queue.is_empty() || !pass.pending.is_empty() {
            self.exhaust(&mut pass, ctx).await;
        }

        pass.report.tokens_decided = pass.done.len();
        pass.report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!("{}", pass.report.log_line());

        Resolution {
            values: pass.done,
            report: pass.report,
        }
    }

    /// Round budget spent: everything undecided fails softly.
    async fn exhaust(&self, pass: &mut Pass, ctx: &ResolveContext<'_>) {
        let err = EngineError::MaxDepthExceeded {
            depth: self.config.max_depth,
        };
        pass.report.max_depth_exceeded = true;
        tracing::warn!(
            session = ctx.session_id,
            unresolved = pass.queue.len() + pass.pending.len(),
            max_depth = self.config.max_depth,
            "resolution stopped at max depth"
        );

        let leftovers: Vec<Shortcode> = pass.queue.drain(..).collect();
        for token in leftovers {
            pass.decide(token, Err(err.clone()));
        }
        self.settle(pass, ctx).await;

        let mut stuck: Vec<Shortcode> = pass.pending.keys().cloned().collect();
        stuck.sort();
        for token in stuck {
            pass.pending.remove(&token);
            pass.decide(token, Err(err.clone()));
        }
        self.write_back(pass, ctx);
    }

    fn apply(&self, pass: &mut Pass, token: Shortcode, expansion: Expansion, ctx: &ResolveContext<'_>) {
        match expansion {
            Expansion::Decided {
                result,
                produced,
                cache_hit,
            } => {
                if cache_hit {
                    pass.report.cache_hits += 1;
                }
                if let Some(produced) = produced {
                    pass.produced.push(produced);
                }
                pass.decide(token, result);
            }
            Expansion::Deferred(pending) => {
                let cycle = pending.deps.iter().find_map(|dep| {
                    if *dep == token {
                        return Some(vec![token.clone(), token.clone()]);
                    }
                    pass.waits_on(dep, &token).map(|path| {
                        let mut chain = vec![token.clone()];
                        chain.extend(path);
                        chain
                    })
                });

                if let Some(chain) = cycle {
                    let err = EngineError::CircularDependency {
                        chain: chain_text(&chain),
                    };
                    tracing::warn!(token = %token, error = %err, "circular reference");
                    pass.report.cycles += 1;
                    if let Finish::LookupFormula { selection, .. } = &pending.finish {
                        let record = lookup_record(ctx.session_id, token.name(), Some(selection), Err(&err));
                        pass.produced.push(Produced {
                            token: token.clone(),
                            entry: None,
                            calculation: None,
                            record: Some(record),
                            refresh: false,
                        });
                    }
                    pass.decide(token, Err(err));
                    return;
                }

                for dep in &pending.deps {
                    pass.enqueue(dep.clone(), ctx.fields);
                }
                pass.pending.insert(token, pending);
            }
        }
    }

    /// Finish every pending token whose references are all decided, until
    /// nothing else becomes ready.
    async fn settle(&self, pass: &mut Pass, ctx: &ResolveContext<'_>) {
        loop {
            let mut ready: Vec<Shortcode> = pass
                .pending
                .iter()
                .filter(|(_, p)| p.deps.iter().all(|d| pass.done.contains_key(d)))
                .map(|(t, _)| t.clone())
                .collect();
            if ready.is_empty() {
                return;
            }
            ready.sort();

            let mut jobs = Vec::with_capacity(ready.len());
            for token in ready {
                let Some(pending) = pass.pending.remove(&token) else {
                    continue;
                };
                let inputs = substitute_inputs(&pending, &pass.done);
                jobs.push((token, pending, inputs));
            }

            let finished = join_all(
                jobs.iter()
                    .map(|(token, pending, inputs)| self.finish(token, pending, inputs, ctx)),
            )
            .await;

            for ((token, _, inputs), (result, produced)) in jobs.into_iter().zip(finished) {
                if inputs.is_ok() {
                    pass.report.evaluated += 1;
                }
                pass.produced.push(produced);
                pass.decide(token, result);
            }
        }
    }

    async fn finish(
        &self,
        token: &Shortcode,
        pending: &Pending,
        inputs: &EngineResult<String>,
        ctx: &ResolveContext<'_>,
    ) -> (EngineResult<ResolvedValue>, Produced) {
        let result = match inputs {
            Ok(text) => evaluate_with_timeout(text, &self.config.limits)
                .await
                .map(|n| match &pending.finish {
                    Finish::Calc { unit } => ResolvedValue::number(n, unit.clone()),
                    Finish::LookupFormula { unit, .. } => ResolvedValue {
                        display: format_localized(n, self.config.locale, unit.as_deref()),
                        numeric: Some(n),
                        unit: unit.clone(),
                    },
                }),
            Err(e) => Err(e.clone()),
        };

        let entry = match (&result, inputs) {
            (Ok(value), Ok(text)) => Some(ProcessedValue {
                token: token.clone(),
                kind: token.kind(),
                raw_text: pending.raw_text.clone(),
                processed_text: text.clone(),
                dependencies: pending.deps.clone(),
                value: value.clone(),
                timestamp: Utc::now(),
            }),
            _ => None,
        };
        let calculation = match (&pending.finish, &result) {
            (Finish::Calc { unit }, Ok(value)) => value.numeric.map(|n| (n, unit.clone())),
            _ => None,
        };
        let record = match &pending.finish {
            Finish::LookupFormula { selection, .. } => Some(lookup_record(
                ctx.session_id,
                token.name(),
                Some(selection),
                result.as_ref(),
            )),
            Finish::Calc { .. } => None,
        };

        let produced = Produced {
            token: token.clone(),
            entry,
            calculation,
            record,
            refresh: false,
        };
        (result, produced)
    }

    /// Apply this round's side effects: session cache, calculation values,
    /// invalidation of dependents on change, execution records.
    fn write_back(&self, pass: &mut Pass, ctx: &ResolveContext<'_>) {
        let session = ctx.session_id;
        for produced in pass.produced.drain(..) {
            let name = produced.token.name().to_string();
            let succeeded = produced.entry.is_some() || produced.calculation.is_some();

            let mut changed = false;
            if let Some(entry) = produced.entry {
                let previous = self.sessions.processed(session, &produced.token);
                changed |= previous.map_or(true, |p| p.value != entry.value);
                self.sessions.store_processed(session, entry);
            }
            if let Some((value, unit)) = produced.calculation {
                let stored = self.sessions.store_calculation(session, &name, value, unit.clone());
                changed |= stored;
                if stored || !produced.refresh {
                    self.log.submit(ExecutionRecord::Calculation {
                        session_id: session.to_string(),
                        name: name.clone(),
                        value,
                        unit,
                        timestamp: Utc::now(),
                    });
                }
            }
            if let Some(record) = produced.record {
                self.log.submit(record);
            }

            if changed {
                self.tracker.on_calculation_changed(session, &name);
            }
            if succeeded {
                self.tracker.mark_current(session, &name);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------------

    async fn expand(&self, token: &Shortcode, ctx: &ResolveContext<'_>) -> Expansion {
        match token {
            Shortcode::Field(name) => Expansion::Decided {
                result: resolve_field(name, ctx.fields),
                produced: None,
                cache_hit: false,
            },
            Shortcode::Calc(name) => self.expand_calc(token, name, ctx).await,
            Shortcode::Lookup(name) => self.expand_lookup(token, name, ctx).await,
        }
    }

    fn cached(&self, token: &Shortcode, ctx: &ResolveContext<'_>) -> Option<Expansion> {
        if self.tracker.needs_recalculation(ctx.session_id, token.name()) {
            return None;
        }
        let entry = self.sessions.processed(ctx.session_id, token)?;
        tracing::debug!(token = %token, "cache hit");
        // A calc hit restores the session value an override may have replaced.
        let produced = match (token, entry.value.numeric) {
            (Shortcode::Calc(_), Some(n)) => Some(Produced {
                token: token.clone(),
                entry: None,
                calculation: Some((n, entry.value.unit.clone())),
                record: None,
                refresh: true,
            }),
            _ => None,
        };
        Some(Expansion::Decided {
            result: Ok(entry.value),
            produced,
            cache_hit: true,
        })
    }

    async fn expand_calc(&self, token: &Shortcode, name: &str, ctx: &ResolveContext<'_>) -> Expansion {
        if let Some(raw) = find_override(name, ctx.fields) {
            let value = ResolvedValue::text(raw);
            let produced = Produced {
                token: token.clone(),
                entry: None,
                calculation: value.numeric.map(|n| (n, None)),
                record: None,
                refresh: false,
            };
            return Expansion::Decided {
                result: Ok(value),
                produced: Some(produced),
                cache_hit: false,
            };
        }

        if let Some(hit) = self.cached(token, ctx) {
            return hit;
        }

        let formula = match self.definitions.formula(name).await {
            Ok(Some(formula)) => formula,
            Ok(None) => return decided(Err(EngineError::FormulaNotFound(name.to_string()))),
            Err(e) => return decided(Err(e.into())),
        };
        self.tracker.discover(name, &formula.formula_text);

        Expansion::Deferred(Pending {
            deps: extract_ordered(&formula.formula_text),
            raw_text: formula.formula_text,
            finish: Finish::Calc { unit: formula.unit },
        })
    }

    async fn expand_lookup(&self, token: &Shortcode, name: &str, ctx: &ResolveContext<'_>) -> Expansion {
        if let Some(hit) = self.cached(token, ctx) {
            return hit;
        }

        let lookup = match self.definitions.lookup(name).await {
            Ok(Some(lookup)) => lookup,
            Ok(None) => return self.expand_legacy(token, name, ctx).await,
            Err(e) => {
                self.tracker.mark_any_field(name);
                let err: EngineError = e.into();
                return self.lookup_decided(token, None, Err(err), ctx);
            }
        };
        self.tracker.discover_lookup(name, &lookup);

        let selection = match select_action(&lookup, ctx.fields) {
            Ok(selection) => selection,
            Err(e) => return self.lookup_decided(token, None, Err(e), ctx),
        };
        tracing::debug!(
            lookup = name,
            rule = ?selection.matched_rule,
            action = selection.action.kind_name(),
            "lookup rule selected"
        );

        match &selection.action {
            Action::Value { value } => {
                let result = Ok(ResolvedValue::text(value.as_text().unwrap_or_default()));
                self.lookup_decided(token, Some(&selection), result, ctx)
            }
            Action::Error { message } => {
                let result = Err(EngineError::LookupAction(message.clone()));
                self.lookup_decided(token, Some(&selection), result, ctx)
            }
            Action::Lookup {
                table,
                key_field,
                value_field,
                key_column,
            } => {
                let column = key_column.as_deref().unwrap_or(key_field);
                let result = self.fetch_reference(table, key_field, column, value_field, ctx).await;
                self.lookup_decided(token, Some(&selection), result, ctx)
            }
            Action::Formula { formula } => {
                let unit = self.formula_unit(formula).await;
                Expansion::Deferred(Pending {
                    raw_text: formula.clone(),
                    deps: extract_ordered(formula),
                    finish: Finish::LookupFormula {
                        unit,
                        selection: selection.clone(),
                    },
                })
            }
        }
    }

    async fn expand_legacy(&self, token: &Shortcode, name: &str, ctx: &ResolveContext<'_>) -> Expansion {
        let result = match self.definitions.legacy_table(name).await {
            Ok(Some(table)) => {
                self.tracker.discover_legacy(name, &table);
                select_legacy(&table, ctx.fields)
                    .map(ResolvedValue::text)
                    .ok_or_else(|| EngineError::NoRuleMatched(name.to_string()))
            }
            Ok(None) => Err(EngineError::LookupNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        };

        let entry = result.as_ref().ok().map(|value| ProcessedValue {
            token: token.clone(),
            kind: token.kind(),
            raw_text: value.display.clone(),
            processed_text: value.display.clone(),
            dependencies: Vec::new(),
            value: value.clone(),
            timestamp: Utc::now(),
        });
        let mut record = lookup_record(ctx.session_id, name, None, result.as_ref());
        if let ExecutionRecord::Lookup { action, used_default, .. } = &mut record {
            *action = Some("legacy".to_string());
            *used_default = false;
        }
        Expansion::Decided {
            produced: Some(Produced {
                token: token.clone(),
                entry,
                calculation: None,
                record: Some(record),
                refresh: false,
            }),
            result,
            cache_hit: false,
        }
    }

    async fn fetch_reference(
        &self,
        table: &str,
        key_field: &str,
        key_column: &str,
        value_field: &str,
        ctx: &ResolveContext<'_>,
    ) -> EngineResult<ResolvedValue> {
        let key = ctx
            .fields
            .text(key_field)
            .ok_or_else(|| EngineError::MissingField(key_field.to_string()))?;
        let not_found = || EngineError::ReferenceRowNotFound {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key: key.clone(),
        };
        let row = self
            .definitions
            .fetch_row(table, key_column, &key)
            .await?
            .ok_or_else(not_found)?;
        let value = row
            .get(value_field)
            .and_then(FieldValue::as_text)
            .ok_or_else(not_found)?;
        Ok(ResolvedValue::text(value))
    }

    /// Unit of the referenced formula when the text is exactly one calc token.
    async fn formula_unit(&self, formula: &str) -> Option<String> {
        let Some(Shortcode::Calc(name)) = sole_shortcode(formula) else {
            return None;
        };
        match self.definitions.formula(&name).await {
            Ok(found) => found.and_then(|f| f.unit),
            Err(e) => {
                tracing::debug!(calc = %name, error = %e, "unit lookup failed");
                None
            }
        }
    }

    fn lookup_decided(
        &self,
        token: &Shortcode,
        selection: Option<&Selection>,
        result: EngineResult<ResolvedValue>,
        ctx: &ResolveContext<'_>,
    ) -> Expansion {
        let entry = result.as_ref().ok().map(|value| ProcessedValue {
            token: token.clone(),
            kind: token.kind(),
            raw_text: value.display.clone(),
            processed_text: value.display.clone(),
            dependencies: Vec::new(),
            value: value.clone(),
            timestamp: Utc::now(),
        });
        let record = lookup_record(ctx.session_id, token.name(), selection, result.as_ref());
        Expansion::Decided {
            produced: Some(Produced {
                token: token.clone(),
                entry,
                calculation: None,
                record: Some(record),
                refresh: false,
            }),
            result,
            cache_hit: false,
        }
    }
}

fn decided(result: EngineResult<ResolvedValue>) -> Expansion {
    Expansion::Decided {
        result,
        produced: None,
        cache_hit: false,
    }
}

/// Substituted formula text, or the first failed reference's error.
fn substitute_inputs(
    pending: &Pending,
    done: &FxHashMap<Shortcode, EngineResult<ResolvedValue>>,
) -> EngineResult<String> {
    for dep in &pending.deps {
        if let Some(Err(e)) = done.get(dep) {
            return Err(e.clone());
        }
    }
    Ok(substitute(&pending.raw_text, |code| match done.get(code) {
        Some(Ok(value)) => value.formula_text(),
        _ => code.to_string(),
    }))
}

fn lookup_record(
    session_id: &str,
    lookup: &str,
    selection: Option<&Selection>,
    result: Result<&ResolvedValue, &EngineError>,
) -> ExecutionRecord {
    ExecutionRecord::Lookup {
        session_id: session_id.to_string(),
        lookup: lookup.to_string(),
        matched_rule: selection.and_then(|s| s.matched_rule),
        used_default: selection.is_some_and(Selection::used_default),
        action: selection.map(|s| s.action.kind_name().to_string()),
        success: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        timestamp: Utc::now(),
    }
}
