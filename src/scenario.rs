use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::schema::Scenario;

/// Reads a scenario document. `.json` files go through the JSON parser, anything
/// else through YAML; parse errors carry the line and column.
pub fn load_and_validate_scenario(path: &Path) -> Result<Scenario> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let scenario = if is_json {
        parse_json(path, &contents)?
    } else {
        parse_yaml(path, &contents)?
    };

    scenario
        .validate()
        .with_context(|| format!("scenario validation failed for {}", path.display()))?;
    Ok(scenario)
}

fn parse_yaml(path: &Path, contents: &str) -> Result<Scenario> {
    serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!(
            "failed to parse yaml in {} at {}: {}",
            path.display(),
            location,
            error
        )
    })
}

fn parse_json(path: &Path, contents: &str) -> Result<Scenario> {
    serde_json::from_str(contents).map_err(|error| {
        anyhow!(
            "failed to parse json in {} at line {}, column {}: {}",
            path.display(),
            error.line(),
            error.column(),
            error
        )
    })
}

/// Directory name for a scenario's segments: spaces become `_`, then any
/// character outside `[A-Za-z0-9_.-]` becomes `_`.
pub fn derive_namespace(title: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars = UNSAFE
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("namespace pattern is valid"));
    let underscored = title.trim().replace(' ', "_");
    let namespace = unsafe_chars.replace_all(&underscored, "_").into_owned();
    if namespace.is_empty() || namespace.chars().all(|ch| ch == '.') {
        "scenario".to_owned()
    } else {
        namespace
    }
}

/// A namespace names one directory directly under the output root.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.trim().is_empty() {
        bail!("namespace cannot be empty");
    }
    if namespace.contains(['/', '\\']) || namespace == "." || namespace == ".." {
        bail!("namespace '{namespace}' must be a single directory name");
    }
    if namespace.chars().any(char::is_control) {
        bail!("namespace '{namespace}' contains control characters");
    }
    Ok(())
}

/// Hex sha256 of the scenario's canonical JSON form.
pub fn scenario_fingerprint(scenario: &Scenario) -> Result<String> {
    let canonical =
        serde_json::to_vec(scenario).context("failed to serialize scenario for fingerprint")?;
    let digest = Sha256::digest(&canonical);
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}
