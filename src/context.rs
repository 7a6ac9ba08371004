use crate::config::SourceFormat;
use crate::selector::{self, lookup, Scope, SelectorCase};
use crate::value::{Value, ValueError};
use chrono::Utc;
use log::warn;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::BTreeMap;
use std::path::MAIN_SEPARATOR;
use thiserror::Error;

/// Root carrying generator identity, fixed when the context is created.
pub const METADATA_ROOT: &str = "Freight";

/// Root bound to the element being iterated, present on views only.
pub const CURRENT_ROOT: &str = "Current";

/// Root holding the process environment.
pub const ENV_ROOT: &str = "Env";

/// Root holding a few facts about the host.
pub const OS_ROOT: &str = "OS";

const RESERVED_ROOTS: [&str; 4] = [METADATA_ROOT, CURRENT_ROOT, ENV_ROOT, OS_ROOT];

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("root field name '{0}' is reserved")]
    ReservedRoot(String),
    #[error("root field name must not be empty")]
    EmptyRoot,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid data: {0}")]
    Value(#[from] ValueError),
    #[error("global context must be a mapping with a 'Freight' mapping in it")]
    InvalidGlobal,
}

/// Returns true if `name` collides with a reserved root, ignoring case.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_ROOTS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn name_matches(root: &str, name: &str, case: SelectorCase) -> bool {
    match case {
        SelectorCase::Sensitive => root == name,
        SelectorCase::Insensitive => root.eq_ignore_ascii_case(name),
    }
}

/// Parsed global source: extension fields for the metadata root plus any
/// other top-level roots it declares.
#[derive(Debug, Default, Clone)]
pub struct GlobalSource {
    pub extensions: BTreeMap<String, Value>,
    pub roots: BTreeMap<String, Value>,
}

impl GlobalSource {
    pub fn from_yaml(data: &[u8]) -> Result<Self, ContextError> {
        let raw: serde_yaml::Value = serde_yaml::from_slice(data)?;
        let mut fields = match Value::try_from(raw)? {
            Value::Mapping(map) => map,
            _ => return Err(ContextError::InvalidGlobal),
        };
        let extensions = match fields.remove(METADATA_ROOT) {
            Some(Value::Mapping(map)) => map,
            _ => return Err(ContextError::InvalidGlobal),
        };
        let mut roots = BTreeMap::new();
        for (name, value) in fields {
            if is_reserved(&name) {
                warn!("global context root '{}' is reserved, skipping", name);
                continue;
            }
            roots.insert(name, value);
        }
        Ok(Self { extensions, roots })
    }
}

/// The shared data root handed to templates.
#[derive(Debug, Clone)]
pub struct Context {
    metadata: Value,
    system: BTreeMap<String, Value>,
    roots: BTreeMap<String, Value>,
    case: SelectorCase,
}

impl Context {
    pub fn new(case: SelectorCase) -> Self {
        Self::with_extensions(case, BTreeMap::new())
    }

    /// Creates a context seeded from a global source.
    pub fn with_global(case: SelectorCase, global: GlobalSource) -> Result<Self, ContextError> {
        let mut context = Self::with_extensions(case, global.extensions);
        for (name, value) in global.roots {
            context.insert_root(&name, value)?;
        }
        Ok(context)
    }

    fn with_extensions(case: SelectorCase, extensions: BTreeMap<String, Value>) -> Self {
        let mut metadata = extensions;
        for (key, value) in [
            ("GeneratorVersion", Value::from(crate::version_string())),
            ("ContextCreatedAt", Value::from(Utc::now())),
        ] {
            if metadata.insert(key.to_string(), value).is_some() {
                warn!("{}.{} cannot be overridden by the global context", METADATA_ROOT, key);
            }
        }
        Self {
            metadata: Value::Mapping(metadata),
            system: BTreeMap::new(),
            roots: BTreeMap::new(),
            case,
        }
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// Binds `value` under the root `name`. Loading the same root twice merges
    /// mappings and replaces anything else.
    pub fn insert_root(&mut self, name: &str, value: Value) -> Result<(), ContextError> {
        if name.is_empty() {
            return Err(ContextError::EmptyRoot);
        }
        if is_reserved(name) {
            return Err(ContextError::ReservedRoot(name.to_string()));
        }
        match self.roots.get_mut(name) {
            Some(existing) => existing.merge(value),
            None => {
                self.roots.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn load(&mut self, name: &str, format: SourceFormat, data: &[u8]) -> Result<(), ContextError> {
        match format {
            SourceFormat::Json => self.load_json(name, data),
            SourceFormat::Yaml => self.load_yaml(name, data),
        }
    }

    pub fn load_json(&mut self, name: &str, data: &[u8]) -> Result<(), ContextError> {
        let raw: serde_json::Value = serde_json::from_slice(data)?;
        self.insert_root(name, Value::from(raw))
    }

    pub fn load_yaml(&mut self, name: &str, data: &[u8]) -> Result<(), ContextError> {
        let raw: serde_yaml::Value = serde_yaml::from_slice(data)?;
        self.insert_root(name, Value::try_from(raw)?)
    }

    /// Exposes the process environment under `Env`. Variables whose name or
    /// value is not valid unicode are left out.
    pub fn load_env_vars(&mut self) {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, Value::String(v.into_string().ok()?))))
            .collect::<BTreeMap<_, _>>();
        self.system.insert(ENV_ROOT.to_string(), Value::Mapping(vars));
    }

    /// Exposes host facts under `OS`.
    pub fn load_os_vars(&mut self) {
        let path_string = |p: std::io::Result<std::path::PathBuf>| {
            p.map(|p| p.display().to_string()).unwrap_or_default()
        };
        let vars = BTreeMap::from([
            ("PathSeparator".to_string(), Value::from(MAIN_SEPARATOR.to_string())),
            (
                "PathListSeparator".to_string(),
                Value::from(if cfg!(windows) { ";" } else { ":" }),
            ),
            ("WorkDir".to_string(), Value::from(path_string(std::env::current_dir()))),
            ("Hostname".to_string(), Value::from(hostname())),
            ("Executable".to_string(), Value::from(path_string(std::env::current_exe()))),
            ("Arch".to_string(), Value::from(std::env::consts::ARCH)),
            ("OS".to_string(), Value::from(std::env::consts::OS)),
            ("Family".to_string(), Value::from(std::env::consts::FAMILY)),
        ]);
        self.system.insert(OS_ROOT.to_string(), Value::Mapping(vars));
    }

    /// A view with no `Current` binding.
    pub fn root_view(&self) -> ContextView<'_> {
        ContextView {
            context: self,
            current: None,
        }
    }

    /// A view with `Current` bound to element `idx` of the collection at
    /// `collection`. Anything that is not an in-range sequence element leaves
    /// `Current` unset.
    pub fn view_at(&self, collection: &str, idx: usize) -> ContextView<'_> {
        let current = selector::resolve(self, collection)
            .and_then(Value::as_sequence)
            .and_then(|items| items.get(idx));
        ContextView {
            context: self,
            current,
        }
    }

    /// A view with `Current` bound to the whole collection at `collection`.
    pub fn view_of(&self, collection: &str) -> ContextView<'_> {
        let current = selector::resolve(self, collection).filter(|v| v.as_sequence().is_some());
        ContextView {
            context: self,
            current,
        }
    }

    fn serialize_with<S: Serializer>(
        &self,
        current: Option<&Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (name, value) in &self.roots {
            map.serialize_entry(name, value)?;
        }
        for (name, value) in &self.system {
            map.serialize_entry(name, value)?;
        }
        map.serialize_entry(METADATA_ROOT, &self.metadata)?;
        if let Some(current) = current {
            map.serialize_entry(CURRENT_ROOT, current)?;
        }
        map.end()
    }
}

impl Scope for Context {
    fn root(&self, name: &str) -> Option<&Value> {
        if name_matches(METADATA_ROOT, name, self.case) {
            return Some(&self.metadata);
        }
        lookup(&self.system, name, self.case).or_else(|| lookup(&self.roots, name, self.case))
    }

    fn selector_case(&self) -> SelectorCase {
        self.case
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.serialize_with(None, serializer)
    }
}

/// A cheap projection of a [`Context`] with `Current` bound to one value.
/// The shared context is never mutated.
#[derive(Debug, Clone, Copy)]
pub struct ContextView<'a> {
    context: &'a Context,
    current: Option<&'a Value>,
}

impl<'a> ContextView<'a> {
    pub fn current(&self) -> Option<&'a Value> {
        self.current
    }
}

impl Scope for ContextView<'_> {
    fn root(&self, name: &str) -> Option<&Value> {
        if name_matches(CURRENT_ROOT, name, self.context.case) {
            return self.current;
        }
        self.context.root(name)
    }

    fn selector_case(&self) -> SelectorCase {
        self.context.case
    }
}

impl Serialize for ContextView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.context.serialize_with(self.current, serializer)
    }
}

/// Best effort: `HOSTNAME`, then `COMPUTERNAME`, then `/etc/hostname`.
/// Empty when none of them is available.
fn hostname() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
