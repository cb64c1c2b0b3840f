//! Loading scenario definitions from YAML.

use anyhow::{Context, Result, bail};
use chaos_core::Scenario;
use std::path::{Path, PathBuf};

const EXTENSIONS: &[&str] = &["yaml", "yml"];

pub fn load(path: &Path) -> Result<Scenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    let scenario = parse(&content).with_context(|| format!("loading scenario {}", path.display()))?;
    Ok(scenario)
}

pub fn parse(content: &str) -> Result<Scenario> {
    let scenario: Scenario = serde_yaml_ng::from_str(content).context("parsing YAML")?;
    scenario.validate()?;
    Ok(scenario)
}

/// Resolve `name` to a scenario file: the name as a path, then
/// `<dir>/<name>`, `<dir>/<name>.yaml` and `<dir>/<name>.yml` for each
/// search directory in order.
pub fn find(name: &str, search_paths: &[PathBuf]) -> Result<PathBuf> {
    let direct = Path::new(name);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }
    for dir in search_paths {
        let mut candidates = vec![dir.join(name)];
        candidates.extend(EXTENSIONS.iter().map(|ext| dir.join(format!("{name}.{ext}"))));
        if let Some(found) = candidates.into_iter().find(|c| c.is_file()) {
            return Ok(found);
        }
    }
    let searched: Vec<String> = search_paths.iter().map(|p| p.display().to_string()).collect();
    bail!("scenario {name:?} not found in {searched:?}")
}
