//! Argument binding against a command's schema
//!
//! Raw tokens bind either by name (`name=value`, where `name` is a declared
//! parameter) or by position, filling the parameters not bound by name in
//! declaration order.

use super::descriptor::{ArgSpec, ArgType};
use mimir_core::{is_sha256_hex, ArgList, ArgValue, MimirError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn ipv4_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]?\d)$",
        )
        .expect("ipv4 pattern compiles")
    })
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://[^\s/$.?#].[^\s]*$").expect("url pattern compiles")
    })
}

fn evidence_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^E[1-9][0-9]*$").expect("evidence id pattern compiles")
    })
}

/// Arguments after binding, in schema order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundArgs {
    values: ArgList,
}

impl BoundArgs {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(ArgValue::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(ArgValue::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(ArgValue::as_bool)
    }

    /// Text argument the schema guarantees; `Argument` if missing
    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .ok_or_else(|| MimirError::Argument(format!("missing argument <{}>", name)))
    }

    pub fn as_list(&self) -> &ArgList {
        &self.values
    }

    pub fn into_list(self) -> ArgList {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn bind_args(specs: &[ArgSpec], raw: &[String]) -> Result<BoundArgs> {
    let mut named: BTreeMap<&str, &str> = BTreeMap::new();
    let mut positional: Vec<&str> = Vec::new();

    for token in raw {
        match token.split_once('=') {
            Some((name, value)) if specs.iter().any(|s| s.name == name) => {
                if named.insert(name, value).is_some() {
                    return Err(MimirError::Argument(format!(
                        "argument <{}> given more than once",
                        name
                    )));
                }
            }
            _ => positional.push(token.as_str()),
        }
    }

    let open: Vec<&ArgSpec> = specs
        .iter()
        .filter(|s| !named.contains_key(s.name.as_str()))
        .collect();
    if positional.len() > open.len() {
        return Err(MimirError::Argument(format!(
            "expected at most {} argument(s), got {}",
            specs.len(),
            raw.len()
        )));
    }

    let mut supplied: BTreeMap<&str, &str> = named;
    for (spec, value) in open.iter().zip(positional) {
        supplied.insert(spec.name.as_str(), value);
    }

    let mut values = ArgList::new();
    for spec in specs {
        match supplied.get(spec.name.as_str()) {
            Some(raw_value) => {
                values.insert(spec.name.clone(), parse_value(spec, raw_value)?);
            }
            None => match &spec.default {
                Some(default) => {
                    values.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(MimirError::Argument(format!(
                        "missing required argument <{}>",
                        spec.name
                    )));
                }
                None => {}
            },
        }
    }

    Ok(BoundArgs { values })
}

fn parse_value(spec: &ArgSpec, raw: &str) -> Result<ArgValue> {
    let invalid = || {
        MimirError::Argument(format!(
            "<{}> expects {}, got {:?}",
            spec.name, spec.ty, raw
        ))
    };

    match spec.ty {
        ArgType::String => Ok(ArgValue::Text(raw.to_string())),
        ArgType::Path => {
            if raw.trim().is_empty() {
                return Err(invalid());
            }
            Ok(ArgValue::Text(raw.to_string()))
        }
        ArgType::Integer => raw
            .parse::<i64>()
            .map(ArgValue::Integer)
            .map_err(|_| invalid()),
        ArgType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(ArgValue::Bool(true)),
            "false" | "no" | "off" | "0" => Ok(ArgValue::Bool(false)),
            _ => Err(invalid()),
        },
        ArgType::EvidenceId if evidence_id_pattern().is_match(raw) => {
            Ok(ArgValue::Text(raw.to_string()))
        }
        ArgType::Ipv4 if ipv4_pattern().is_match(raw) => Ok(ArgValue::Text(raw.to_string())),
        ArgType::Url if url_pattern().is_match(raw) => Ok(ArgValue::Text(raw.to_string())),
        ArgType::Sha256 if is_sha256_hex(&raw.to_ascii_lowercase()) => {
            Ok(ArgValue::Text(raw.to_ascii_lowercase()))
        }
        ArgType::EvidenceId | ArgType::Ipv4 | ArgType::Url | ArgType::Sha256 => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    fn schema() -> Vec<ArgSpec> {
        vec![
            ArgSpec::required("evidence", ArgType::EvidenceId),
            ArgSpec::optional("limit", ArgType::Integer).with_default(ArgValue::Integer(10)),
            ArgSpec::optional("note", ArgType::String),
        ]
    }

    #[test]
    fn test_positional_and_defaults() {
        let bound = bind_args(&schema(), &raw(&["E1"])).unwrap();
        assert_eq!(bound.str("evidence"), Some("E1"));
        assert_eq!(bound.i64("limit"), Some(10));
        assert!(bound.get("note").is_none());
    }

    #[test]
    fn test_named_binding_frees_positions() {
        let bound = bind_args(&schema(), &raw(&["limit=3", "E2", "seen twice"])).unwrap();
        assert_eq!(bound.str("evidence"), Some("E2"));
        assert_eq!(bound.i64("limit"), Some(3));
        assert_eq!(bound.str("note"), Some("seen twice"));
    }

    #[test]
    fn test_bound_args_follow_schema_order() {
        let bound = bind_args(&schema(), &raw(&["note=late", "limit=3", "E4"])).unwrap();
        let names: Vec<&str> = bound.as_list().names().collect();
        assert_eq!(names, vec!["evidence", "limit", "note"]);
    }

    #[test]
    fn test_arity_type_and_missing() {
        assert!(matches!(
            bind_args(&schema(), &raw(&[])),
            Err(MimirError::Argument(_))
        ));
        assert!(matches!(
            bind_args(&schema(), &raw(&["E1", "2", "n", "extra"])),
            Err(MimirError::Argument(_))
        ));
        assert!(matches!(
            bind_args(&schema(), &raw(&["E1", "ten"])),
            Err(MimirError::Argument(_))
        ));
        assert!(matches!(
            bind_args(&schema(), &raw(&["evidence=E1", "evidence=E2"])),
            Err(MimirError::Argument(_))
        ));
        assert!(bind_args(&schema(), &raw(&["X1"])).is_err());
    }

    #[test]
    fn test_network_types() {
        let specs = vec![
            ArgSpec::required("ip", ArgType::Ipv4),
            ArgSpec::optional("url", ArgType::Url),
        ];
        assert!(bind_args(&specs, &raw(&["8.8.8.8"])).is_ok());
        assert!(bind_args(&specs, &raw(&["256.1.1.1"])).is_err());
        assert!(bind_args(&specs, &raw(&["10.0.0"])).is_err());

        // '=' inside a value that is not a parameter name binds positionally
        let bound =
            bind_args(&specs, &raw(&["1.2.3.4", "https://example.com/a?b=c"])).unwrap();
        assert_eq!(bound.str("url"), Some("https://example.com/a?b=c"));
        assert!(bind_args(&specs, &raw(&["1.2.3.4", "ftp://example.com"])).is_err());
    }

    #[test]
    fn test_sha256_is_normalised() {
        let specs = vec![ArgSpec::required("hash", ArgType::Sha256)];
        let upper = "B413F47D13EE2FE6C845B2EE141AF81DE858DF4EC549A58B7970BB96645BC8D2";
        let bound = bind_args(&specs, &raw(&[upper])).unwrap();
        assert_eq!(bound.str("hash"), Some(upper.to_ascii_lowercase().as_str()));
        assert!(bind_args(&specs, &raw(&["abc"])).is_err());
    }
}
