//! Declarative start parameters for in-process units.
//!
//! A unit author lists the parameters its payload accepts; the per-unit CLI
//! turns the list into options and hands the parsed values to the payload
//! through [`crate::signals::RunContext::params`].
use std::{collections::BTreeMap, fmt};

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Integer,
    Flag,
}

/// A parsed (or default) parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Flag(bool),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::Integer(_) => ParamKind::Integer,
            ParamValue::Flag(_) => ParamKind::Flag,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(value) => write!(f, "{value}"),
            ParamValue::Integer(value) => write!(f, "{value}"),
            ParamValue::Flag(value) => write!(f, "{value}"),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    /// Parameters without a default must be supplied on `start`.
    pub default: Option<ParamValue>,
    pub help: Option<String>,
}

/// Ordered list of parameters a payload accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text parameter.
    pub fn text(mut self, name: &str, default: Option<&str>) -> Self {
        self.specs.push(ParamSpec {
            name: name.to_string(),
            kind: ParamKind::Text,
            default: default.map(|value| ParamValue::Text(value.to_string())),
            help: None,
        });
        self
    }

    /// Adds an integer parameter.
    pub fn integer(mut self, name: &str, default: Option<i64>) -> Self {
        self.specs.push(ParamSpec {
            name: name.to_string(),
            kind: ParamKind::Integer,
            default: default.map(ParamValue::Integer),
            help: None,
        });
        self
    }

    /// Adds a boolean parameter; passing the option flips the default.
    pub fn flag(mut self, name: &str, default: bool) -> Self {
        self.specs.push(ParamSpec {
            name: name.to_string(),
            kind: ParamKind::Flag,
            default: Some(ParamValue::Flag(default)),
            help: None,
        });
        self
    }

    /// Attaches help text to the most recently added parameter.
    pub fn help(mut self, text: &str) -> Self {
        if let Some(last) = self.specs.last_mut() {
            last.help = Some(text.to_string());
        }
        self
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Values every parameter takes when nothing is supplied.
    pub fn defaults(&self) -> Params {
        let mut params = Params::default();
        for spec in &self.specs {
            if let Some(value) = &spec.default {
                params.insert(&spec.name, value.clone());
            }
        }
        params
    }
}

/// Parameter bag passed through to a payload untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, ParamValue>,
}

impl Params {
    pub fn insert(&mut self, name: &str, value: ParamValue) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Text(value)) => Some(value),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Flag(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
