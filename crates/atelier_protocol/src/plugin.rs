//! Declarative plugin method signatures and configuration options
//!
//! Workers report these when a plugin is loaded. The host uses them to
//! validate calls and configuration changes before anything crosses the
//! process boundary; they never describe how a method executes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

/// JSON type expected for a method parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    #[serde(other)]
    Any,
}

impl ParamType {
    /// Whether `value` is acceptable for this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
            ParamType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
            ParamType::Any => "any",
        }
    }
}

/// One parameter of a [`PluginMethod`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MethodParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Declarative signature of a plugin method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PluginMethod {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<MethodParameter>,
    #[serde(default = "default_return_type")]
    pub return_type: String,
    #[serde(default)]
    pub is_async: bool,
}

fn default_return_type() -> String {
    "any".to_string()
}

impl PluginMethod {
    /// Check `params` against this signature and fill in declared defaults.
    ///
    /// `params` must be an object (or null for no arguments). Parameters that
    /// are not declared pass through untouched.
    pub fn bind(&self, params: &Value) -> Result<Value, String> {
        let mut args = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(format!(
                    "method `{}` expects an object of named parameters, got {}",
                    self.name,
                    json_kind(other)
                ))
            }
        };

        for param in &self.parameters {
            match args.get(&param.name) {
                Some(value) if !value.is_null() => {
                    if !param.param_type.accepts(value) {
                        return Err(format!(
                            "parameter `{}` of `{}` expects {}, got {}",
                            param.name,
                            self.name,
                            param.param_type.as_str(),
                            json_kind(value)
                        ));
                    }
                }
                _ => {
                    if let Some(default) = &param.default {
                        args.insert(param.name.clone(), default.clone());
                    } else if param.required {
                        return Err(format!(
                            "missing required parameter `{}` for `{}`",
                            param.name, self.name
                        ));
                    }
                }
            }
        }

        Ok(Value::Object(args))
    }
}

/// Kind of value a configuration option holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    String,
    Number,
    Integer,
    Boolean,
    Select,
    #[default]
    #[serde(other)]
    Any,
}

/// One choice of a `select` option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConfigChoice {
    pub value: Value,
    pub label: String,
}

/// Constraints checked before a configuration value is accepted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ValidationRule {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

/// A configurable setting exposed by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PluginConfigOption {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub option_type: ConfigType,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ConfigChoice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRule>,
}

impl PluginConfigOption {
    /// Check a candidate value against the option's type, choices and rule
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let rule = self.validation.clone().unwrap_or_default();

        if value.is_null() {
            return if rule.required {
                Err(format!("`{}` is required", self.key))
            } else {
                Ok(())
            };
        }

        let type_ok = match self.option_type {
            ConfigType::String => value.is_string(),
            ConfigType::Number => value.is_number(),
            ConfigType::Integer => value.is_i64() || value.is_u64(),
            ConfigType::Boolean => value.is_boolean(),
            ConfigType::Select | ConfigType::Any => true,
        };
        if !type_ok {
            return Err(format!(
                "`{}` cannot hold {}",
                self.key,
                json_kind(value)
            ));
        }

        if let Some(options) = &self.options {
            if !options.iter().any(|choice| &choice.value == value) {
                return Err(format!("`{}` is not one of the allowed choices", self.key));
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(min) = rule.min {
                if number < min {
                    return Err(format!("`{}` must be at least {}", self.key, min));
                }
            }
            if let Some(max) = rule.max {
                if number > max {
                    return Err(format!("`{}` must be at most {}", self.key, max));
                }
            }
        }

        if let Some(text) = value.as_str() {
            let len = text.chars().count();
            if let Some(min_length) = rule.min_length {
                if len < min_length {
                    return Err(format!(
                        "`{}` must be at least {} characters",
                        self.key, min_length
                    ));
                }
            }
            if let Some(max_length) = rule.max_length {
                if len > max_length {
                    return Err(format!(
                        "`{}` must be at most {} characters",
                        self.key, max_length
                    ));
                }
            }
        }

        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
