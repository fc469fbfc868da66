//! Build templates.
//!
//! A template is a property list describing one build. Templates may include
//! other templates; later keys override earlier ones.
//!
//! ```text
//! TemplateFormat       "1.0"
//! IncludeTemplates     [path, ...]
//! SourcePath           path
//! ApplyUpdates         bool
//! AdditionalPackages   [path, ...]
//! OutputPath           path, may contain %VARIABLES%
//! VolumeName           string, may contain %VARIABLES%
//! VolumeSize           integer GB
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use dmgsmith_shared::errors::BuildError;
use plist::{Dictionary, Value};
use regex::{Captures, Regex};
use thiserror::Error;

use crate::constants::media;

pub const TEMPLATE_FORMAT: &str = "1.0";

static KEY_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(?P<key>[A-Z][A-Z_0-9]*)%").expect("valid regex"));

#[derive(Debug, Error)]
pub enum TemplateError {
    /// A template includes itself, directly or through other templates.
    #[error("{} included recursively", .0.display())]
    RecursiveInclude(PathBuf),

    #[error("Couldn't read dictionary from plist at {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    #[error("Invalid value for {key}: expected {expected}")]
    InvalidValue { key: String, expected: &'static str },

    #[error("Package '{0}' not found")]
    PackageNotFound(String),

    #[error("Couldn't write dictionary to plist at {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

impl From<TemplateError> for BuildError {
    fn from(err: TemplateError) -> Self {
        BuildError::Template(err.to_string())
    }
}

// ============================================================================
// TEMPLATE
// ============================================================================

#[derive(Clone, Debug)]
pub struct Template {
    pub source_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub apply_updates: bool,
    pub additional_packages: Vec<PathBuf>,
    pub volume_name: String,
    /// Output image size in GB. Computed from the packages when unset.
    pub volume_size: Option<u64>,
    loaded: HashSet<PathBuf>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            source_path: None,
            output_path: None,
            apply_updates: false,
            additional_packages: Vec::new(),
            volume_name: media::DEFAULT_VOLUME_NAME.to_string(),
            volume_size: None,
            loaded: HashSet::new(),
        }
    }
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` into this template, following includes.
    pub fn load(&mut self, path: &Path) -> Result<(), TemplateError> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if !self.loaded.insert(key) {
            return Err(TemplateError::RecursiveInclude(path.to_path_buf()));
        }

        let dict: Dictionary = plist::from_file(path).map_err(|e| TemplateError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if let Some(format) = dict.get("TemplateFormat").and_then(Value::as_string)
            && format != TEMPLATE_FORMAT
        {
            tracing::warn!("Unknown format version {}", format);
        }

        for (key, value) in dict.iter() {
            match key.as_str() {
                "IncludeTemplates" => {
                    for include in string_array(key, value)? {
                        tracing::info!("Including template {}", include);
                        self.load(&expand_tilde(&include))?;
                    }
                }
                "SourcePath" => {
                    let source = string_value(key, value)?;
                    tracing::info!("Setting source path to '{}'", source);
                    self.source_path = Some(resolve_path(&source));
                }
                "ApplyUpdates" => {
                    let apply = value.as_boolean().ok_or(TemplateError::InvalidValue {
                        key: key.clone(),
                        expected: "boolean",
                    })?;
                    tracing::info!("Setting apply updates to '{}'", apply);
                    self.apply_updates = apply;
                }
                "AdditionalPackages" => {
                    for package in string_array(key, value)? {
                        self.add_package(&package)?;
                    }
                }
                "OutputPath" => {
                    let output = string_value(key, value)?;
                    tracing::info!("Setting output path to '{}'", output);
                    self.output_path = Some(absolute(&expand_tilde(&output)));
                }
                "VolumeName" => {
                    let name = string_value(key, value)?;
                    tracing::info!("Setting volume name to '{}'", name);
                    self.volume_name = name;
                }
                "VolumeSize" => {
                    let size = value.as_unsigned_integer().ok_or(TemplateError::InvalidValue {
                        key: key.clone(),
                        expected: "integer",
                    })?;
                    tracing::info!("Setting volume size to '{}'", size);
                    self.volume_size = Some(size);
                }
                "TemplateFormat" => {}
                other => tracing::warn!("Unknown key '{}' in template", other),
            }
        }

        Ok(())
    }

    /// Add a package, resolving `~` and symlinks. Duplicates are skipped.
    pub fn add_package(&mut self, package: &str) -> Result<(), TemplateError> {
        let path = std::fs::canonicalize(expand_tilde(package))
            .map_err(|_| TemplateError::PackageNotFound(package.to_string()))?;
        if self.additional_packages.contains(&path) {
            tracing::info!("Skipping duplicate package '{}'", path.display());
        } else {
            tracing::info!("Adding '{}' to additional packages", path.display());
            self.additional_packages.push(path);
        }
        Ok(())
    }

    /// Substitute `%KEY%` references in the volume name and output path.
    ///
    /// `DATE` (yyMMdd) and `TIME` (HHmmss) are always defined. Undefined keys
    /// are left in place.
    pub fn resolve_variables(&mut self, variables: &HashMap<String, String>) {
        let now = chrono::Local::now();
        let mut variables = variables.clone();
        variables.insert("DATE".to_string(), now.format("%y%m%d").to_string());
        variables.insert("TIME".to_string(), now.format("%H%M%S").to_string());

        self.volume_name = substitute(&self.volume_name, &variables);
        if let Some(output) = &self.output_path {
            let resolved = substitute(&output.to_string_lossy(), &variables);
            self.output_path = Some(PathBuf::from(resolved));
        }
    }

    /// Write the template as an XML property list.
    pub fn save(&self, path: &Path) -> Result<(), TemplateError> {
        let mut dict = Dictionary::new();
        dict.insert("TemplateFormat".into(), Value::String(TEMPLATE_FORMAT.into()));
        dict.insert(
            "AdditionalPackages".into(),
            Value::Array(
                self.additional_packages
                    .iter()
                    .map(|p| Value::String(p.display().to_string()))
                    .collect(),
            ),
        );
        dict.insert("ApplyUpdates".into(), Value::Boolean(self.apply_updates));
        dict.insert("VolumeName".into(), Value::String(self.volume_name.clone()));
        if let Some(source) = &self.source_path {
            dict.insert("SourcePath".into(), Value::String(source.display().to_string()));
        }
        if let Some(output) = &self.output_path {
            dict.insert("OutputPath".into(), Value::String(output.display().to_string()));
        }
        if let Some(size) = self.volume_size {
            dict.insert("VolumeSize".into(), Value::Integer(size.into()));
        }

        Value::Dictionary(dict)
            .to_file_xml(path)
            .map_err(|e| TemplateError::Write {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }
}

fn substitute(text: &str, variables: &HashMap<String, String>) -> String {
    KEY_REF
        .replace_all(text, |caps: &Captures| {
            let key = &caps["key"];
            match variables.get(key) {
                Some(value) => value.clone(),
                None => {
                    tracing::warn!("Template references undefined variable: %{}%", key);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn string_value(key: &str, value: &Value) -> Result<String, TemplateError> {
    value
        .as_string()
        .map(str::to_string)
        .ok_or(TemplateError::InvalidValue {
            key: key.to_string(),
            expected: "string",
        })
}

fn string_array(key: &str, value: &Value) -> Result<Vec<String>, TemplateError> {
    let invalid = || TemplateError::InvalidValue {
        key: key.to_string(),
        expected: "array of strings",
    };
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_string().map(str::to_string).ok_or_else(invalid))
        .collect()
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match ::dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

fn resolve_path(path: &str) -> PathBuf {
    let expanded = expand_tilde(path);
    std::fs::canonicalize(&expanded).unwrap_or(expanded)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
