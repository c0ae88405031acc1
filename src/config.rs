//! Instrumentation settings.
//!
//! Options use the same comma separated `key=value` form as a JVM agent
//! option string, so a build front end can forward them unchanged:
//!
//! ```text
//! holder=acme/trace/Tracer,field=INSTANCE,default=acme/trace/LogTracer
//! ```

use thiserror::Error;

use crate::families::{self, Family};
use crate::hierarchy::OBJECT;

pub const DEFAULT_CALLBACK_INTERFACE: &str = "jdbctracing/api/TracingCallback";
pub const DEFAULT_CALLBACK_FIELD: &str = "instance";
pub const DEFAULT_CALLBACK_IMPL: &str = "jdbctracing/tracers/DefaultTracingCallback";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("option '{0}' is not of the form key=value")]
    MalformedOption(String),
    #[error("unknown option key '{0}'")]
    UnknownKey(String),
    #[error("option '{0}' has an empty value")]
    EmptyValue(String),
}

/// Where rewritten call sites find the active callback.
///
/// Every piece of advice starts with `getstatic holder.field`, typed as
/// `callback_interface`. The holder module is augmented with that field and a
/// static initializer that instantiates `default_impl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackLocator {
    pub holder: String,
    pub field: String,
    pub callback_interface: String,
    pub default_impl: String,
}

impl Default for CallbackLocator {
    fn default() -> Self {
        Self {
            holder: DEFAULT_CALLBACK_INTERFACE.to_string(),
            field: DEFAULT_CALLBACK_FIELD.to_string(),
            callback_interface: DEFAULT_CALLBACK_INTERFACE.to_string(),
            default_impl: DEFAULT_CALLBACK_IMPL.to_string(),
        }
    }
}

impl CallbackLocator {
    /// Field descriptor of the holder field, e.g. `Ljdbctracing/api/TracingCallback;`.
    pub fn field_descriptor(&self) -> String {
        format!("L{};", self.callback_interface)
    }

    /// Module name of the holder class.
    pub fn holder_module(&self) -> String {
        format!("{}.class", self.holder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    pub locator: CallbackLocator,
    pub families: Vec<Family>,
    pub root: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            locator: CallbackLocator::default(),
            families: families::default_families(),
            root: OBJECT.to_string(),
        }
    }
}

impl InstrumentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value` pairs separated by commas. Keys: `holder`, `field`,
    /// `callback`, `default`. Setting `callback` without `holder` keeps the
    /// holder on the callback interface.
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut holder = None;
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedOption(option.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                return Err(ConfigError::EmptyValue(key.to_string()));
            }
            let value = value.replace('.', "/");
            match key {
                "holder" => holder = Some(value),
                "field" => config.locator.field = value,
                "callback" => config.locator.callback_interface = value,
                "default" => config.locator.default_impl = value,
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        config.locator.holder = holder.unwrap_or_else(|| config.locator.callback_interface.clone());
        Ok(config)
    }

    pub fn with_locator(mut self, locator: CallbackLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_families(mut self, families: Vec<Family>) -> Self {
        self.families = families;
        self
    }

    pub fn closure_seeds(&self) -> Vec<String> {
        families::closure_seeds(&self.families, &self.root)
    }
}
