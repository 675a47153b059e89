// fcalc - headless harness for the formcalc shortcode engine

mod defs;
mod exit_codes;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use formcalc_config::EngineSettings;
use formcalc_engine::exec_log::MemorySink;
use formcalc_engine::expr::functions::ALL_FUNCTIONS;
use formcalc_engine::expr::{evaluate, EvalLimits};
use formcalc_engine::format::{format_general, NumberLocale};
use formcalc_engine::shortcode::{extract_ordered, Shortcode};
use formcalc_engine::store::MemoryStore;
use formcalc_engine::{EngineError, EngineOptions, FieldValue, FormData, ProcessContext, ShortcodeEngine};

use exit_codes::{
    engine_exit_code, engine_hint, EXIT_CHECK_CYCLES, EXIT_ERROR, EXIT_IO, EXIT_SETTINGS, EXIT_SUCCESS,
    EXIT_USAGE,
};

#[derive(Parser)]
#[command(name = "fcalc")]
#[command(about = "Resolve [field:], [calc:] and [lookup:] shortcodes against a definitions file")]
#[command(version)]
struct Cli {
    /// Settings file (default: ~/.config/formcalc/settings.json)
    #[arg(long, global = true, env = "FORMCALC_SETTINGS", value_name = "FILE")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a plain arithmetic expression
    #[command(after_help = "\
Examples:
  fcalc eval '(10 * 3) / 4'
  fcalc eval 'round(2 / 3, 2) + max(1, 5)'")]
    Eval {
        /// Expression (numbers, + - * / ( ) and allow-listed functions)
        expression: String,
    },

    /// Resolve a template against definitions and field values
    #[command(after_help = "\
Examples:
  fcalc process '[calc:total]' --defs defs.toml -F a=3 -F b=4
  fcalc process 'Heating: [lookup:heating]' --defs defs.json -F valitse=oil --json")]
    Process {
        /// Template text containing shortcodes
        template: String,

        /// Definitions file (.toml or .json)
        #[arg(long, value_name = "FILE")]
        defs: PathBuf,

        /// Field value as NAME=VALUE. Repeatable.
        #[arg(long = "field", short = 'F', value_name = "NAME=VALUE")]
        fields: Vec<String>,

        /// Session identifier
        #[arg(long, default_value = "cli")]
        session: String,

        /// Fail the call when any shortcode fails
        #[arg(long)]
        strict: bool,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,

        /// Print execution records to stderr as JSON lines
        #[arg(long)]
        records: bool,
    },

    /// List the form fields a template depends on, following definitions
    Deps {
        template: String,

        #[arg(long, value_name = "FILE")]
        defs: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Check definitions for circular calculations and dangling references
    Check {
        #[arg(long, value_name = "FILE")]
        defs: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// List the functions the evaluator accepts
    ListFunctions,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = load_settings(cli.settings.as_deref()).and_then(|settings| match cli.command {
        Commands::Eval { expression } => cmd_eval(&settings, &expression),
        Commands::Process {
            template,
            defs,
            fields,
            session,
            strict,
            json,
            records,
        } => cmd_process(&settings, &template, &defs, &fields, &session, strict, json, records),
        Commands::Deps { template, defs, json } => cmd_deps(&settings, &template, &defs, json),
        Commands::Check { defs, json } => cmd_check(&settings, &defs, json),
        Commands::ListFunctions => cmd_list_functions(),
    });

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { code: EXIT_IO, message: msg.into(), hint: None }
    }

    /// Exit code already reported on stdout; nothing more to print.
    pub fn silent(code: u8) -> Self {
        Self { code, message: String::new(), hint: None }
    }

    pub fn engine(err: &EngineError) -> Self {
        Self {
            code: engine_exit_code(err),
            message: err.to_string(),
            hint: engine_hint(err),
        }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// Shared setup
// ============================================================================

fn load_settings(path: Option<&Path>) -> Result<EngineSettings, CliError> {
    let Some(path) = path else {
        return Ok(EngineSettings::load());
    };
    EngineSettings::load_from(path).map_err(|e| match e {
        formcalc_config::SettingsError::Io(_) => CliError::io(e.to_string()),
        formcalc_config::SettingsError::Parse(_) => CliError {
            code: EXIT_SETTINGS,
            message: e.to_string(),
            hint: Some(format!("see {}", EngineSettings::config_path_display())),
        },
    })
}

fn eval_limits(settings: &EngineSettings) -> EvalLimits {
    EvalLimits {
        max_length: settings.max_length,
        max_nesting: settings.max_nesting,
        max_magnitude: settings.max_magnitude,
        timeout: Duration::from_millis(settings.timeout_ms),
    }
}

fn engine_options(settings: &EngineSettings, strict: bool) -> Result<EngineOptions, CliError> {
    let locale = NumberLocale::from_tag(&settings.locale).ok_or_else(|| {
        CliError::args(format!("unknown locale '{}'", settings.locale)).with_hint("use \"fi\" or \"en\"")
    })?;
    Ok(EngineOptions {
        batch_size: settings.batch_size,
        max_depth: settings.max_depth,
        closure_depth: settings.closure_depth,
        limits: eval_limits(settings),
        definition_ttl: Duration::from_secs(settings.definition_ttl_secs),
        locale,
        strict_mode: settings.strict_mode || strict,
        log_queue_capacity: settings.execution_log_capacity,
    })
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::io(format!("cannot start async runtime: {}", e)))
}

/// Parse repeated `NAME=VALUE` flags.
fn parse_fields(raw: &[String]) -> Result<FormData, CliError> {
    let mut data = FormData::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| CliError::args(format!("invalid --field '{}'", item)).with_hint("use NAME=VALUE"))?;
        if name.trim().is_empty() {
            return Err(CliError::args(format!("invalid --field '{}': empty name", item)));
        }
        data.insert(name.trim(), FieldValue::from(value));
    }
    Ok(data)
}

fn write_line(out: &mut impl Write, line: &str) -> Result<(), CliError> {
    writeln!(out, "{}", line).map_err(|e| CliError::io(e.to_string()))
}

// ============================================================================
// eval
// ============================================================================

fn cmd_eval(settings: &EngineSettings, expression: &str) -> Result<(), CliError> {
    let value = evaluate(expression, &eval_limits(settings)).map_err(|e| CliError::engine(&e))?;
    write_line(&mut io::stdout().lock(), &format_general(value))
}

// ============================================================================
// process
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn cmd_process(
    settings: &EngineSettings,
    template: &str,
    defs: &Path,
    fields: &[String],
    session: &str,
    strict: bool,
    json: bool,
    records: bool,
) -> Result<(), CliError> {
    let options = engine_options(settings, strict)?;
    let form_data = parse_fields(fields)?;
    let store = Arc::new(defs::load_definitions(defs)?.into_store());
    let rt = runtime()?;

    let (outcome, logged) = rt.block_on(async {
        let sink = Arc::new(MemorySink::new());
        let mut builder = ShortcodeEngine::builder_for(store).options(options);
        if records && settings.execution_log_enabled {
            builder = builder.execution_log(sink.clone());
        }
        let engine = builder.build();
        let outcome = engine.process(template, &ProcessContext::new(session, form_data)).await;
        engine.shutdown().await;
        (outcome, sink.records())
    });

    for record in &logged {
        if let Ok(line) = serde_json::to_string(record) {
            eprintln!("{}", line);
        }
    }

    let mut out = io::stdout().lock();
    if json {
        let text = serde_json::to_string_pretty(&outcome).map_err(|e| CliError::io(e.to_string()))?;
        write_line(&mut out, &text)?;
        return if outcome.success { Ok(()) } else { Err(CliError::silent(EXIT_ERROR)) };
    }

    match (outcome.success, outcome.result) {
        (true, Some(result)) => {
            write_line(&mut out, &result)?;
            if outcome.max_depth_exceeded {
                tracing::warn!(max_depth = settings.max_depth, "some shortcodes exceeded the resolution depth");
            }
            Ok(())
        }
        _ => Err(CliError {
            code: EXIT_ERROR,
            message: outcome.error.unwrap_or_else(|| "processing failed".to_string()),
            hint: None,
        }),
    }
}

// ============================================================================
// deps
// ============================================================================

fn cmd_deps(settings: &EngineSettings, template: &str, defs: &Path, json: bool) -> Result<(), CliError> {
    let options = engine_options(settings, false)?;
    let store = Arc::new(defs::load_definitions(defs)?.into_store());
    let rt = runtime()?;
    let fields = rt.block_on(async {
        let engine = ShortcodeEngine::builder_for(store).options(options).build();
        engine.extract_field_dependencies(template).await
    });

    let mut out = io::stdout().lock();
    if json {
        let text = serde_json::to_string(&fields).map_err(|e| CliError::io(e.to_string()))?;
        return write_line(&mut out, &text);
    }
    for field in fields {
        write_line(&mut out, &field)?;
    }
    Ok(())
}

// ============================================================================
// check
// ============================================================================

fn cmd_check(settings: &EngineSettings, defs: &Path, json: bool) -> Result<(), CliError> {
    let options = engine_options(settings, false)?;
    let set = defs::load_definitions(defs)?;
    let formula_names: Vec<String> = set.formulas.iter().map(|f| f.name.clone()).collect();
    let lookup_names: Vec<String> = set.lookups.iter().map(|l| l.name.clone()).collect();
    let legacy_names: Vec<String> = set.legacy_tables.iter().map(|t| t.name.clone()).collect();
    let references: Vec<(String, Vec<Shortcode>)> = set
        .formulas
        .iter()
        .map(|f| (f.name.clone(), extract_ordered(&f.formula_text)))
        .collect();
    let store = Arc::new(set.into_store());
    let rt = runtime()?;

    let (cycles, closing, missing) = rt.block_on(async {
        let engine = ShortcodeEngine::builder_for(store).options(options).build();
        let mut missing: Vec<(String, String)> = Vec::new();
        let mut closing: Vec<(String, Vec<String>)> = Vec::new();

        for (name, refs) in &references {
            let calcs: Vec<&str> = refs
                .iter()
                .filter_map(|code| match code {
                    Shortcode::Calc(calc) => Some(calc.as_str()),
                    _ => None,
                })
                .collect();
            if let Some(path) = engine.tracker().would_create_cycle(name, &calcs) {
                closing.push((name.clone(), path));
            }
            if let Ok(Some(formula)) = engine.definitions().formula(name).await {
                engine.tracker().discover(name, &formula.formula_text);
            }
            for code in refs {
                let known = match code {
                    Shortcode::Field(_) => true,
                    Shortcode::Calc(calc) => matches!(engine.definitions().formula(calc).await, Ok(Some(_))),
                    Shortcode::Lookup(lookup) => {
                        matches!(engine.definitions().lookup(lookup).await, Ok(Some(_)))
                            || matches!(engine.definitions().legacy_table(lookup).await, Ok(Some(_)))
                    }
                };
                if !known {
                    missing.push((code.to_string(), name.clone()));
                }
            }
        }
        for name in &lookup_names {
            match engine.definitions().lookup(name).await {
                Ok(Some(lookup)) => {
                    engine.tracker().discover_lookup(name, &lookup);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(lookup = %name, error = %e, "lookup not loaded"),
            }
        }
        (engine.tracker().find_cycle_groups(), closing, missing)
    });

    let mut out = io::stdout().lock();
    if json {
        let missing_json: Vec<serde_json::Value> = missing
            .iter()
            .map(|(token, by)| serde_json::json!({ "token": token, "referencedBy": by }))
            .collect();
        let closing_json: Vec<serde_json::Value> = closing
            .iter()
            .map(|(name, path)| serde_json::json!({ "definition": name, "path": path }))
            .collect();
        let report = serde_json::json!({
            "formulas": formula_names.len(),
            "lookups": lookup_names.len(),
            "legacyTables": legacy_names.len(),
            "cycles": cycles,
            "closedBy": closing_json,
            "missing": missing_json,
        });
        let text = serde_json::to_string_pretty(&report).map_err(|e| CliError::io(e.to_string()))?;
        write_line(&mut out, &text)?;
    } else {
        write_line(
            &mut out,
            &format!(
                "formulas: {}  lookups: {}  legacy tables: {}",
                formula_names.len(),
                lookup_names.len(),
                legacy_names.len()
            ),
        )?;
        for group in &cycles {
            write_line(&mut out, &format!("cycle: {}", group.join(" → ")))?;
        }
        for (name, path) in &closing {
            write_line(&mut out, &format!("loop: {} (closed by {})", path.join(" → "), name))?;
        }
        for (token, by) in &missing {
            write_line(&mut out, &format!("missing: {} (referenced by {})", token, by))?;
        }
    }

    if cycles.is_empty() {
        Ok(())
    } else {
        Err(CliError::silent(EXIT_CHECK_CYCLES))
    }
}

// ============================================================================
// list-functions
// ============================================================================

fn cmd_list_functions() -> Result<(), CliError> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();

    for function in ALL_FUNCTIONS {
        write_line(&mut handle, function.signature())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let data = parse_fields(&["a=3".to_string(), "Name = x=y".to_string()]).unwrap();
        assert_eq!(data.text("a").as_deref(), Some("3"));
        assert_eq!(data.text("name").as_deref(), Some(" x=y"));
        assert_eq!(parse_fields(&["novalue".to_string()]).unwrap_err().code, EXIT_USAGE);
    }

    #[test]
    fn test_options_from_settings() {
        let settings = EngineSettings {
            locale: "en".to_string(),
            timeout_ms: 50,
            ..EngineSettings::default()
        };
        let options = engine_options(&settings, true).unwrap();
        assert_eq!(options.locale, NumberLocale::En);
        assert_eq!(options.limits.timeout, Duration::from_millis(50));
        assert!(options.strict_mode);

        let bad = EngineSettings {
            locale: "xx".to_string(),
            ..EngineSettings::default()
        };
        assert_eq!(engine_options(&bad, false).unwrap_err().code, EXIT_USAGE);
    }
}
