// Definitions file loading (.toml or .json, chosen by extension)

use std::path::Path;

use formcalc_engine::store::DefinitionSet;

use crate::exit_codes::{EXIT_DEFS_PARSE, EXIT_IO};
use crate::CliError;

pub fn load_definitions(path: &Path) -> Result<DefinitionSet, CliError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CliError {
        code: EXIT_IO,
        message: format!("cannot read {}: {}", path.display(), e),
        hint: None,
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let parsed = match ext.as_str() {
        "toml" => toml::from_str::<DefinitionSet>(&contents).map_err(|e| e.to_string()),
        "json" => serde_json::from_str::<DefinitionSet>(&contents).map_err(|e| e.to_string()),
        _ => {
            return Err(CliError {
                code: EXIT_DEFS_PARSE,
                message: format!("unsupported definitions format: {}", path.display()),
                hint: Some("use a .toml or .json file".to_string()),
            })
        }
    };

    let set = parsed.map_err(|e| CliError {
        code: EXIT_DEFS_PARSE,
        message: format!("invalid definitions in {}: {}", path.display(), e),
        hint: None,
    })?;
    tracing::debug!(
        formulas = set.formulas.len(),
        lookups = set.lookups.len(),
        "definitions loaded"
    );
    Ok(set)
}
