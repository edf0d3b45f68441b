//! Expression evaluation against the per-request environment
//!
//! Configuration fields that may depend on the requesting machine are
//! declared as [`Expression`]s. An expression is parsed once at startup and
//! evaluated for every round against an [`Environment`] built from the
//! request and the backend registry.
//!
//! Syntax (as it appears in YAML):
//!
//! - `null` evaluates to [`Value::Null`]
//! - a scalar is a string constant, which may embed `${path}` references;
//!   `$${` stands for a literal `${`
//! - a string that is exactly one reference takes the referenced value as is,
//!   so `${req.ips}` is a list
//! - a sequence is a list, every element must evaluate to a string
//! - a mapping is a string map, every value must evaluate to a string
//!
//! An absent value (`null`, or an unset optional machine field) is the zero
//! value of whatever is asked for: interpolated it is `""`, and as a list
//! element or map value it is left out.

use crate::error::EvalError;
use serde::{Deserialize, Deserializer};
use shared::MachineInfo;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    String(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    String,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Null => "null",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Map => "map",
        })
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Null becomes the empty string; anything but a string is an error
    pub fn into_string(self) -> Result<String, EvalError> {
        match self {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s),
            other => Err(mismatch(ValueKind::String, &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>, EvalError> {
        match self {
            Value::Null => Ok(Vec::new()),
            Value::List(l) => Ok(l),
            other => Err(mismatch(ValueKind::List, &other)),
        }
    }

    pub fn into_map(self) -> Result<BTreeMap<String, String>, EvalError> {
        match self {
            Value::Null => Ok(BTreeMap::new()),
            Value::Map(m) => Ok(m),
            other => Err(mismatch(ValueKind::Map, &other)),
        }
    }
}

fn mismatch(expected: ValueKind, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

enum Scope {
    Node(BTreeMap<String, Scope>),
    Leaf(Value),
}

/// Read-only variables visible to expressions during one round
pub struct Environment {
    root: BTreeMap<String, Scope>,
}

impl Environment {
    /// Bind `req.*` from the machine identity and `backend.x509.*` from the
    /// registered backend names.
    pub fn for_request<'a>(
        machine: &MachineInfo,
        peer: Option<IpAddr>,
        x509_backends: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let opt = |v: &Option<String>| match v {
            Some(s) => Value::String(s.clone()),
            None => Value::Null,
        };

        let mut req = BTreeMap::new();
        req.insert("fqdn".into(), leaf(Value::String(machine.fqdn.clone())));
        req.insert("ips".into(), leaf(Value::List(machine.ips.clone())));
        req.insert("host".into(), leaf(opt(&machine.host)));
        req.insert("domain".into(), leaf(opt(&machine.domain)));
        req.insert("cluster".into(), leaf(opt(&machine.cluster)));
        req.insert("node_type".into(), leaf(opt(&machine.node_type)));
        req.insert("id".into(), leaf(opt(&machine.id)));
        req.insert("provider".into(), leaf(opt(&machine.provider)));
        req.insert("region".into(), leaf(opt(&machine.region)));
        req.insert("city".into(), leaf(opt(&machine.city)));
        req.insert("country".into(), leaf(opt(&machine.country)));
        req.insert("geo".into(), leaf(opt(&machine.geo)));
        req.insert("extra".into(), leaf(Value::Map(machine.extra.clone())));
        req.insert(
            "request_ip".into(),
            leaf(match peer {
                Some(ip) => Value::String(ip.to_string()),
                None => Value::Null,
            }),
        );

        let x509 = x509_backends
            .into_iter()
            .map(|name| (name.to_string(), leaf(Value::String(name.to_string()))))
            .collect();
        let mut backend = BTreeMap::new();
        backend.insert("x509".to_string(), Scope::Node(x509));

        let mut root = BTreeMap::new();
        root.insert("req".to_string(), Scope::Node(req));
        root.insert("backend".to_string(), Scope::Node(backend));
        Self { root }
    }

    pub fn lookup(&self, path: &[String]) -> Result<Value, EvalError> {
        let unknown = || EvalError::UnknownReference(path.join("."));

        let mut children = &self.root;
        for (i, segment) in path.iter().enumerate() {
            match children.get(segment).ok_or_else(unknown)? {
                Scope::Node(next) => children = next,
                Scope::Leaf(value) => {
                    return match (&path[i + 1..], value) {
                        ([], v) => Ok(v.clone()),
                        ([key], Value::Map(m)) => m
                            .get(key)
                            .map(|s| Value::String(s.clone()))
                            .ok_or_else(unknown),
                        _ => Err(unknown()),
                    };
                }
            }
        }

        // A scope of string leaves reads as a map, e.g. `${backend.x509}`
        let mut map = BTreeMap::new();
        for (name, scope) in children {
            match scope {
                Scope::Leaf(Value::String(s)) => {
                    map.insert(name.clone(), s.clone());
                }
                _ => return Err(unknown()),
            }
        }
        Ok(Value::Map(map))
    }
}

fn leaf(value: Value) -> Scope {
    Scope::Leaf(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Literal(String),
    Ref(Vec<String>),
}

/// A configured value, constant or referring into the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Expression {
    #[default]
    Null,
    Text(Vec<Part>),
    List(Vec<Expression>),
    Map(BTreeMap<String, Expression>),
}

impl Expression {
    pub fn constant(s: impl Into<String>) -> Self {
        Expression::Text(vec![Part::Literal(s.into())])
    }

    /// Parse a string, resolving `${...}` references
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = s;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("$${") {
                literal.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| format!("unterminated reference in '{}'", s))?;
                let path = parse_path(&after[..end])
                    .ok_or_else(|| format!("invalid reference '${{{}}}'", &after[..end]))?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Ref(path));
                rest = &after[end + 1..];
            } else {
                literal.push('$');
                rest = &tail[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() || parts.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Expression::Text(parts))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Expression::Null)
    }

    pub fn evaluate(&self, env: &Environment) -> Result<Value, EvalError> {
        match self {
            Expression::Null => Ok(Value::Null),
            Expression::Text(parts) => match parts.as_slice() {
                [Part::Ref(path)] => env.lookup(path),
                parts => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            Part::Literal(s) => out.push_str(s),
                            Part::Ref(path) => out.push_str(&env.lookup(path)?.into_string()?),
                        }
                    }
                    Ok(Value::String(out))
                }
            },
            Expression::List(items) => items
                .iter()
                .filter_map(|item| match item.evaluate(env) {
                    Ok(Value::String(s)) => Some(Ok(s)),
                    Ok(Value::Null) => None,
                    Ok(other) => Some(Err(mismatch(ValueKind::String, &other))),
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expression::Map(entries) => entries
                .iter()
                .filter_map(|(k, v)| match v.evaluate(env) {
                    Ok(Value::String(s)) => Some(Ok((k.clone(), s))),
                    Ok(Value::Null) => None,
                    Ok(other) => Some(Err(mismatch(ValueKind::String, &other))),
                    Err(e) => Some(Err(e)),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
        }
    }

    pub fn eval_string(&self, env: &Environment) -> Result<String, EvalError> {
        self.evaluate(env)?.into_string()
    }

    pub fn eval_list(&self, env: &Environment) -> Result<Vec<String>, EvalError> {
        self.evaluate(env)?.into_list()
    }

    pub fn eval_map(&self, env: &Environment) -> Result<BTreeMap<String, String>, EvalError> {
        self.evaluate(env)?.into_map()
    }

    fn from_yaml(value: serde_yaml::Value) -> Result<Self, String> {
        use serde_yaml::Value as Yaml;

        match value {
            Yaml::Null => Ok(Expression::Null),
            Yaml::Bool(b) => Ok(Expression::constant(b.to_string())),
            Yaml::Number(n) => Ok(Expression::constant(n.to_string())),
            Yaml::String(s) => Expression::parse(&s),
            Yaml::Sequence(items) => items
                .into_iter()
                .map(Expression::from_yaml)
                .collect::<Result<Vec<_>, _>>()
                .map(Expression::List),
            Yaml::Mapping(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    Yaml::String(k) => Ok((k, Expression::from_yaml(v)?)),
                    other => Err(format!("map keys must be strings, got {:?}", other)),
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Expression::Map),
            Yaml::Tagged(tagged) => Err(format!("unsupported tag {}", tagged.tag)),
        }
    }
}

fn parse_path(s: &str) -> Option<Vec<String>> {
    let path: Vec<String> = s.trim().split('.').map(str::to_string).collect();
    let valid = path.iter().all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    });
    valid.then_some(path)
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        Expression::from_yaml(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> MachineInfo {
        let mut m = MachineInfo {
            ips: vec!["10.0.0.7".into(), "fd00::7".into()],
            fqdn: "web-1.dc1.example.com".into(),
            host: Some("web-1".into()),
            domain: Some("dc1.example.com".into()),
            ..Default::default()
        };
        m.extra.insert("rack".into(), "r12".into());
        m
    }

    fn env() -> Environment {
        Environment::for_request(
            &machine(),
            Some("192.0.2.1".parse().unwrap()),
            ["ca1", "ca2"],
        )
    }

    fn expr(yaml: &str) -> Expression {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn constants_evaluate_to_themselves() {
        assert_eq!(
            expr("svc.example.com").evaluate(&env()).unwrap(),
            Value::String("svc.example.com".into())
        );
        assert_eq!(expr("443").eval_string(&env()).unwrap(), "443");
        assert_eq!(
            expr("[a, b]").eval_list(&env()).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn whole_reference_keeps_type() {
        assert_eq!(
            expr("${req.ips}").eval_list(&env()).unwrap(),
            vec!["10.0.0.7".to_string(), "fd00::7".to_string()]
        );
        assert_eq!(
            expr("${req.request_ip}").eval_string(&env()).unwrap(),
            "192.0.2.1"
        );
        assert_eq!(
            expr("${backend.x509.ca2}").eval_string(&env()).unwrap(),
            "ca2"
        );
    }

    #[test]
    fn interpolation_builds_strings() {
        assert_eq!(
            expr("${req.host}.svc.${req.domain}")
                .eval_string(&env())
                .unwrap(),
            "web-1.svc.dc1.example.com"
        );
        assert_eq!(
            expr("rack-${req.extra.rack}").eval_string(&env()).unwrap(),
            "rack-r12"
        );
        assert_eq!(
            expr("'cost: $$5 $${literal}'").eval_string(&env()).unwrap(),
            "cost: $$5 ${literal}"
        );
    }

    #[test]
    fn mismatched_type_is_an_error() {
        let err = expr("${req.ips}").eval_string(&env()).unwrap_err();
        assert!(matches!(
            err,
            EvalError::TypeMismatch {
                expected: ValueKind::String,
                found: ValueKind::List
            }
        ));

        let err = expr("ips=${req.ips}").eval_string(&env()).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));

        let err = expr("[a, '${req.ips}']").eval_list(&env()).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));

        let err = expr("svc").eval_list(&env()).unwrap_err();
        assert!(matches!(
            err,
            EvalError::TypeMismatch {
                expected: ValueKind::List,
                found: ValueKind::String
            }
        ));
    }

    #[test]
    fn null_yields_zero_values() {
        let null = Expression::default();
        assert_eq!(null.eval_string(&env()).unwrap(), "");
        assert!(null.eval_list(&env()).unwrap().is_empty());
        assert!(null.eval_map(&env()).unwrap().is_empty());

        // absent optional machine fields behave the same way
        assert_eq!(expr("${req.cluster}").eval_string(&env()).unwrap(), "");
        assert!(expr("${req.cluster}").eval_list(&env()).unwrap().is_empty());
    }

    #[test]
    fn absent_elements_are_left_out() {
        assert_eq!(
            expr("[svc.example.com, '${req.cluster}', '${req.fqdn}']")
                .eval_list(&env())
                .unwrap(),
            vec!["svc.example.com".to_string(), "web-1.dc1.example.com".to_string()]
        );
        assert_eq!(
            expr("{zone: '${req.cluster}', rack: '${req.extra.rack}'}")
                .eval_map(&env())
                .unwrap()
                .into_iter()
                .collect::<Vec<_>>(),
            vec![("rack".to_string(), "r12".to_string())]
        );
        assert_eq!(
            expr("'node-${req.cluster}'").eval_string(&env()).unwrap(),
            "node-"
        );
    }

    #[test]
    fn unknown_references_fail() {
        for e in ["${req.nope}", "${nope}", "${req.fqdn.x}", "${req.extra.missing}"] {
            assert!(
                matches!(
                    expr(e).evaluate(&env()),
                    Err(EvalError::UnknownReference(_))
                ),
                "{} should be unknown",
                e
            );
        }
    }

    #[test]
    fn scopes_read_as_maps() {
        let map = expr("${backend.x509}").eval_map(&env()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["ca1"], "ca1");

        let extra = expr("${req.extra}").eval_map(&env()).unwrap();
        assert_eq!(extra["rack"], "r12");

        assert!(expr("${req}").evaluate(&env()).is_err());
    }

    #[test]
    fn maps_evaluate_entries() {
        let map = expr("{zone: '${req.domain}', fixed: x}")
            .eval_map(&env())
            .unwrap();
        assert_eq!(map["zone"], "dc1.example.com");
        assert_eq!(map["fixed"], "x");
    }

    #[test]
    fn malformed_references_are_rejected_at_parse() {
        assert!(Expression::parse("${req.fqdn").is_err());
        assert!(Expression::parse("${}").is_err());
        assert!(Expression::parse("${req..fqdn}").is_err());
        assert!(serde_yaml::from_str::<Expression>("'${a b}'").is_err());
    }

    #[test]
    fn empty_string_is_a_constant() {
        assert_eq!(Expression::parse("").unwrap(), Expression::constant(""));
        assert_eq!(expr("''").eval_string(&env()).unwrap(), "");
    }
}
