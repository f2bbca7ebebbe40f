//! Config generator collaborator: renders per-service YAML into `configs/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};

use crate::config::{Config, ServiceConfig};

pub trait ConfigGenerator: Send + Sync {
    /// Render configs into `out_dir`; returns the file written per service.
    fn generate(&self, cfg: &Config, out_dir: &Path) -> Result<BTreeMap<String, PathBuf>>;
}

/// Replaces `{{ key }}` placeholders in each service's `config_template`.
///
/// Known keys are `name`, `network`, `port`, `repo` and `state_dir`, plus the
/// service's own `env` entries.
#[derive(Debug, Clone)]
pub struct TemplateConfigGenerator {
    state_dir: PathBuf,
}

impl TemplateConfigGenerator {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn values(&self, cfg: &Config, svc: &ServiceConfig) -> BTreeMap<String, String> {
        let mut values = svc.env.clone();
        values.insert("name".to_string(), svc.name.clone());
        values.insert("network".to_string(), cfg.network().to_string());
        values.insert("repo".to_string(), svc.repo.display().to_string());
        values.insert("state_dir".to_string(), self.state_dir.display().to_string());
        if let Some(port) = svc.port {
            values.insert("port".to_string(), port.to_string());
        }
        values
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("valid placeholder regex")
    })
}

/// Substitute every placeholder, failing on the first unknown key.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut unknown = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match values.get(key) {
            Some(value) => value.clone(),
            None => {
                unknown.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    if let Some(key) = unknown {
        bail!("unknown template placeholder '{key}'");
    }
    Ok(rendered.into_owned())
}

impl ConfigGenerator for TemplateConfigGenerator {
    fn generate(&self, cfg: &Config, out_dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;

        let mut written = BTreeMap::new();
        for svc in &cfg.services {
            let Some(template_path) = svc.config_template.as_ref() else {
                continue;
            };
            let template = fs::read_to_string(template_path)
                .with_context(|| format!("failed to read template {}", template_path.display()))?;
            let rendered = render(&template, &self.values(cfg, svc))
                .with_context(|| format!("failed to render config for {}", svc.name))?;

            let out = out_dir.join(format!("{}.yaml", svc.name));
            fs::write(&out, rendered)
                .with_context(|| format!("failed to write {}", out.display()))?;
            tracing::debug!(name = %svc.name, path = %out.display(), "rendered config");
            written.insert(svc.name.clone(), out);
        }
        Ok(written)
    }
}
