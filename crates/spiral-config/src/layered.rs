//! Layered configuration for robustness runs.
//!
//! A TOML base layer is overlaid by a JSON run layer (usually written by a
//! sweep launcher). Sections are pulled out as typed values, so each crate
//! owns its own schema.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Which layer produced a configuration change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigLayer {
    Base,
    Run,
}

/// A single key changed while applying a layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDiffEvent {
    pub layer: ConfigLayer,
    /// Dotted path of the key, e.g. `attack.learning_rate`.
    pub path: String,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

/// Locations of the configuration layers, merged base → run.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Discovers layers from `SPIRAL_ROBUST_CONFIG_{ROOT,BASE,RUN}`. Missing
    /// files are skipped.
    pub fn discover() -> Self {
        let root = std::env::var("SPIRAL_ROBUST_CONFIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_root());

        let base = std::env::var("SPIRAL_ROBUST_CONFIG_BASE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(root.join("robust.toml")))
            .and_then(existing_path);

        let run = std::env::var("SPIRAL_ROBUST_CONFIG_RUN")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(root.join("run.json")))
            .and_then(existing_path);

        ConfigLayering { base, run }
    }

    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }
}

fn existing_path(path: PathBuf) -> Option<PathBuf> {
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

fn default_root() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".spiraltorch").join("robust"),
        None => PathBuf::from("."),
    }
}

/// Merged view over all configuration layers.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
    events: Vec<ConfigDiffEvent>,
}

impl LayeredConfig {
    /// Loads and merges the configured layers.
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        let mut events = Vec::new();

        if let Some(path) = layering.base.as_ref() {
            if let Some(layer) = load_toml(path)? {
                apply_layer(&mut value, &layer, ConfigLayer::Base, &mut events);
            }
        }
        if let Some(path) = layering.run.as_ref() {
            if let Some(layer) = load_json(path)? {
                apply_layer(&mut value, &layer, ConfigLayer::Run, &mut events);
            }
        }

        Ok(LayeredConfig {
            layering,
            value,
            events,
        })
    }

    /// Builds a layered view from in-memory TOML and JSON documents.
    pub fn from_documents(
        base_toml: Option<&str>,
        run_json: Option<&str>,
    ) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        let mut events = Vec::new();
        let inline = PathBuf::from("<inline>");
        if let Some(text) = base_toml {
            let layer = parse_toml(text, &inline)?;
            apply_layer(&mut value, &layer, ConfigLayer::Base, &mut events);
        }
        if let Some(text) = run_json {
            let layer = parse_json(text, &inline)?;
            apply_layer(&mut value, &layer, ConfigLayer::Run, &mut events);
        }
        Ok(LayeredConfig {
            layering: ConfigLayering::default(),
            value,
            events,
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    /// Keys changed by each layer, in application order.
    pub fn events(&self) -> &[ConfigDiffEvent] {
        &self.events
    }

    /// Deserialises the section found at `path`, or `None` when absent.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let mut node = &self.value;
        for key in path {
            match node {
                Value::Object(map) => match map.get(*key) {
                    Some(value) => node = value,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        serde_json::from_value(node.clone()).map(Some)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn read(path: &Path) -> Result<Option<String>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|source| LayeredConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_toml(text: &str, path: &Path) -> Result<Value, LayeredConfigError> {
    let value: toml::Value = toml::from_str(text).map_err(|source| LayeredConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_value(value).map_err(|source| LayeredConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_json(text: &str, path: &Path) -> Result<Value, LayeredConfigError> {
    serde_json::from_str(text).map_err(|source| LayeredConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn load_toml(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    match read(path)? {
        Some(text) => parse_toml(&text, path).map(Some),
        None => Ok(None),
    }
}

fn load_json(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    match read(path)? {
        Some(text) => parse_json(&text, path).map(Some),
        None => Ok(None),
    }
}

fn apply_layer(
    dest: &mut Value,
    layer: &Value,
    kind: ConfigLayer,
    events: &mut Vec<ConfigDiffEvent>,
) {
    let before = dest.clone();
    merge(dest, layer);
    diff(&before, dest, &mut Vec::new(), kind, events);
}

fn merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest_slot, src_value) => {
            *dest_slot = src_value.clone();
        }
    }
}

fn diff(
    before: &Value,
    after: &Value,
    path: &mut Vec<String>,
    layer: ConfigLayer,
    out: &mut Vec<ConfigDiffEvent>,
) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            let mut keys: Vec<&String> = before_map.keys().chain(after_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                let before_child = before_map.get(key).unwrap_or(&Value::Null);
                let after_child = after_map.get(key).unwrap_or(&Value::Null);
                diff(before_child, after_child, path, layer, out);
                path.pop();
            }
        }
        _ => {
            let non_null = |value: &Value| (!value.is_null()).then(|| value.clone());
            out.push(ConfigDiffEvent {
                layer,
                path: path.join("."),
                previous: non_null(before),
                current: non_null(after),
            });
        }
    }
}
