//! Layered configuration: defaults, `config.json`, then environment

use super::schema::Config;
use super::validate::validate_config;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE: &str = "config.json";
const PATH_PREFIX: &str = "AGENT_MESH__";

/// Shorthand variables and the config path each one sets
const ALIASES: &[(&str, &str)] = &[
    ("AGENT_MESH_LOG_LEVEL", "logging.level"),
    ("AGENT_MESH_LOG_DIR", "logging.dir"),
    ("AGENT_MESH_MAX_RECEIVES", "bus.governor.max_concurrent_receives"),
];

/// Reads and writes `config.json` in a config directory
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at `~/.agent-mesh`
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .map(|home| home.join(".agent-mesh"))
            .unwrap_or_else(|| PathBuf::from(".agent-mesh"));
        Self { config_dir }
    }

    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            config_dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load and validate using the process environment
    ///
    /// Precedence (lowest to highest): defaults, `config.json`, alias
    /// variables, `AGENT_MESH__SECTION__KEY` path variables.
    pub fn load(&self) -> crate::Result<Config> {
        self.load_with_env(std::env::vars())
    }

    /// Same as [`ConfigLoader::load`] with an explicit variable set
    pub fn load_with_env<I>(&self, vars: I) -> crate::Result<Config>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut layered = serde_json::to_value(Config::default())?;

        let path = self.config_path();
        if path.exists() {
            let file: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
            deep_merge(&mut layered, file);
            debug!(path = %path.display(), "Merged config file");
        }

        for (target, value) in env_overrides(vars) {
            insert_at(&mut layered, &target, value);
        }

        let config: Config = serde_json::from_value(layered)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Write `config` as pretty JSON, creating the directory if needed
    pub fn save(&self, config: &Config) -> crate::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(self.config_path(), serde_json::to_string_pretty(config)?)?;
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Objects merge key by key; any other overlay value replaces the base
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Environment values, in application order: aliases first, then path
/// variables so the latter win
fn env_overrides<I>(vars: I) -> Vec<(Vec<String>, Value)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut aliases = Vec::new();
    let mut paths = Vec::new();

    for (key, raw) in vars {
        if let Some(suffix) = key.strip_prefix(PATH_PREFIX) {
            let target: Vec<String> = suffix
                .split("__")
                .filter(|segment| !segment.is_empty())
                .map(str::to_ascii_lowercase)
                .collect();
            if !target.is_empty() {
                paths.push((target, env_value(&raw)));
            }
        } else if let Some((_, dotted)) = ALIASES.iter().find(|(alias, _)| *alias == key) {
            let target = dotted.split('.').map(String::from).collect();
            aliases.push((target, env_value(&raw)));
        }
    }

    aliases.extend(paths);
    aliases
}

/// JSON if it parses, otherwise a plain string
fn env_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| match raw.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    })
}

/// Set `value` at `target`, replacing non-object intermediates
fn insert_at(root: &mut Value, target: &[String], value: Value) {
    let Some((leaf, parents)) = target.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for key in parents {
        let Some(map) = object_mut(node) else {
            return;
        };
        node = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(map) = object_mut(node) {
        map.insert(leaf.clone(), value);
    }
}

fn object_mut(node: &mut Value) -> Option<&mut Map<String, Value>> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut()
}
