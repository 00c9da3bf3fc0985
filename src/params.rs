//! Typed task parameters and their validation rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type alias for format-check predicates.
type FormatPredicate = Arc<dyn Fn(&ParamValue) -> bool + Send + Sync>;

/// Type alias for lazily computed inclusion sets.
type ComputedSet = Arc<dyn Fn() -> Vec<ParamValue> + Send + Sync>;

/// A typed parameter value supplied when starting a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl ParamValue {
    /// The kind this value belongs to.
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::String(_) => ParamKind::String,
            Self::Integer(_) => ParamKind::Integer,
            Self::Decimal(_) => ParamKind::Decimal,
            Self::Boolean(_) => ParamKind::Boolean,
            Self::Date(_) => ParamKind::Date,
            Self::DateTime(_) => ParamKind::DateTime,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{v}"),
        }
    }
}

/// The declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
}

/// The parameter mapping for one run, serialized onto the run record.
///
/// Ordered so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(pub BTreeMap<String, ParamValue>);

impl Params {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, replacing any previous value.
    pub fn set(mut self, name: &str, value: ParamValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }
}

/// A membership constraint, evaluated lazily at validation time.
#[derive(Clone)]
pub enum Inclusion {
    /// A fixed list of allowed values.
    FixedSet(Vec<ParamValue>),
    /// An integer range; either bound may be open.
    Range { min: Option<i64>, max: Option<i64> },
    /// A set computed when validation runs.
    Computed(ComputedSet),
}

impl fmt::Debug for Inclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedSet(values) => f.debug_tuple("FixedSet").field(values).finish(),
            Self::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Computed(_) => f.debug_tuple("Computed").field(&"<fn>").finish(),
        }
    }
}

/// A validation rule attached to one parameter.
#[derive(Clone)]
pub enum Rule {
    /// The parameter must be supplied.
    Presence,
    /// The value must satisfy a predicate.
    Format(FormatPredicate),
    /// The value must be a member of an inclusion set.
    Inclusion(Inclusion),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence => write!(f, "Presence"),
            Self::Format(_) => write!(f, "Format(<fn>)"),
            Self::Inclusion(i) => f.debug_tuple("Inclusion").field(i).finish(),
        }
    }
}

/// Declaration of one parameter a task accepts.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub rules: Vec<Rule>,
    /// Applied when the parameter is absent and not required.
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// Declare a parameter of the given kind with no rules.
    pub fn new(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            rules: Vec::new(),
            default: None,
        }
    }

    /// Require the parameter to be present.
    pub fn required(mut self) -> Self {
        self.rules.push(Rule::Presence);
        self
    }

    /// Attach a format predicate.
    pub fn format(mut self, check: impl Fn(&ParamValue) -> bool + Send + Sync + 'static) -> Self {
        self.rules.push(Rule::Format(Arc::new(check)));
        self
    }

    /// Restrict the value to a fixed set.
    pub fn inclusion(mut self, values: Vec<ParamValue>) -> Self {
        self.rules.push(Rule::Inclusion(Inclusion::FixedSet(values)));
        self
    }

    /// Restrict an integer value to a range.
    pub fn range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.rules.push(Rule::Inclusion(Inclusion::Range { min, max }));
        self
    }

    /// Restrict the value to a set computed at validation time.
    pub fn computed_inclusion(
        mut self,
        f: impl Fn() -> Vec<ParamValue> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Rule::Inclusion(Inclusion::Computed(Arc::new(f))));
        self
    }

    /// Set a default value used when the parameter is absent.
    pub fn default_value(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Aggregated validation failures, reported per field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid parameters: {}", .errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect::<Vec<_>>().join("; "))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

/// Validate `params` against `specs`, applying defaults for absent
/// optional parameters.
///
/// Returns the effective parameter set (with defaults filled in) or the
/// full list of field errors. A run is never created from an invalid set.
pub fn validate(specs: &[ParamSpec], params: &Params) -> Result<Params, ValidationError> {
    let mut errors = Vec::new();
    let mut effective = params.clone();

    for spec in specs {
        let value = match params.get(spec.name) {
            Some(v) => {
                if v.kind() != spec.kind {
                    errors.push(FieldError {
                        field: spec.name.to_string(),
                        message: format!("expected {:?} value, got {:?}", spec.kind, v.kind()),
                    });
                    continue;
                }
                Some(v)
            }
            None => {
                if let Some(default) = &spec.default {
                    effective.0.insert(spec.name.to_string(), default.clone());
                }
                None
            }
        };

        for rule in &spec.rules {
            match rule {
                Rule::Presence => {
                    if value.is_none() && spec.default.is_none() {
                        errors.push(FieldError {
                            field: spec.name.to_string(),
                            message: "is required".to_string(),
                        });
                    }
                }
                Rule::Format(check) => {
                    if let Some(v) = value {
                        if !check(v) {
                            errors.push(FieldError {
                                field: spec.name.to_string(),
                                message: "has invalid format".to_string(),
                            });
                        }
                    }
                }
                Rule::Inclusion(inclusion) => {
                    if let Some(v) = value {
                        if !included(inclusion, v) {
                            errors.push(FieldError {
                                field: spec.name.to_string(),
                                message: format!("{v} is not an allowed value"),
                            });
                        }
                    }
                }
            }
        }
    }

    // Unknown names are rejected rather than silently carried along.
    for name in params.0.keys() {
        if !specs.iter().any(|s| s.name == name.as_str()) {
            errors.push(FieldError {
                field: name.clone(),
                message: "is not a declared parameter".to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(effective)
    } else {
        Err(ValidationError { errors })
    }
}

fn included(inclusion: &Inclusion, value: &ParamValue) -> bool {
    match inclusion {
        Inclusion::FixedSet(values) => values.contains(value),
        Inclusion::Range { min, max } => match value {
            ParamValue::Integer(n) => {
                min.map_or(true, |m| *n >= m) && max.map_or(true, |m| *n <= m)
            }
            // A range over a non-integer value can never match.
            _ => false,
        },
        Inclusion::Computed(f) => f().contains(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_rule() {
        let specs = vec![ParamSpec::new("ids", ParamKind::String).required()];

        let err = validate(&specs, &Params::new()).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].field, "ids");

        let ok = Params::new().set("ids", ParamValue::String("1,2".into()));
        assert!(validate(&specs, &ok).is_ok());
    }

    #[test]
    fn test_default_satisfies_presence() {
        let specs = vec![ParamSpec::new("content", ParamKind::String)
            .required()
            .default_value(ParamValue::String("default content".into()))];

        let effective = validate(&specs, &Params::new()).unwrap();
        assert_eq!(
            effective.get("content"),
            Some(&ParamValue::String("default content".into()))
        );
    }

    #[test]
    fn test_kind_mismatch() {
        let specs = vec![ParamSpec::new("limit", ParamKind::Integer)];
        let params = Params::new().set("limit", ParamValue::String("ten".into()));

        let err = validate(&specs, &params).unwrap_err();
        assert!(err.errors[0].message.contains("expected"));
    }

    #[test]
    fn test_fixed_set_inclusion() {
        let specs = vec![ParamSpec::new("tier", ParamKind::Integer).inclusion(vec![
            ParamValue::Integer(100),
            ParamValue::Integer(200),
            ParamValue::Integer(300),
        ])];

        let ok = Params::new().set("tier", ParamValue::Integer(200));
        assert!(validate(&specs, &ok).is_ok());

        let bad = Params::new().set("tier", ParamValue::Integer(150));
        assert!(validate(&specs, &bad).is_err());
    }

    #[test]
    fn test_range_inclusion() {
        let specs = vec![ParamSpec::new("n", ParamKind::Integer).range(Some(100), Some(120))];

        assert!(validate(&specs, &Params::new().set("n", ParamValue::Integer(110))).is_ok());
        assert!(validate(&specs, &Params::new().set("n", ParamValue::Integer(121))).is_err());

        // Unbounded upper end.
        let open = vec![ParamSpec::new("n", ParamKind::Integer).range(Some(100), None)];
        assert!(validate(&open, &Params::new().set("n", ParamValue::Integer(9999))).is_ok());
    }

    #[test]
    fn test_computed_inclusion() {
        let specs = vec![ParamSpec::new("n", ParamKind::Integer)
            .computed_inclusion(|| (100..=300).step_by(100).map(ParamValue::Integer).collect())];

        assert!(validate(&specs, &Params::new().set("n", ParamValue::Integer(300))).is_ok());
        assert!(validate(&specs, &Params::new().set("n", ParamValue::Integer(400))).is_err());
    }

    #[test]
    fn test_format_predicate() {
        let specs = vec![ParamSpec::new("ids", ParamKind::String).format(|v| match v {
            ParamValue::String(s) => s.split(',').all(|p| p.trim().parse::<i64>().is_ok()),
            _ => false,
        })];

        assert!(
            validate(&specs, &Params::new().set("ids", ParamValue::String("1, 2,3".into())))
                .is_ok()
        );
        assert!(
            validate(&specs, &Params::new().set("ids", ParamValue::String("1,x".into()))).is_err()
        );
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let specs = vec![ParamSpec::new("known", ParamKind::String)];
        let params = Params::new().set("mystery", ParamValue::Boolean(true));

        let err = validate(&specs, &params).unwrap_err();
        assert_eq!(err.errors[0].field, "mystery");
    }

    #[test]
    fn test_errors_aggregate_across_fields() {
        let specs = vec![
            ParamSpec::new("a", ParamKind::String).required(),
            ParamSpec::new("b", ParamKind::Integer).range(Some(0), Some(10)),
        ];
        let params = Params::new().set("b", ParamValue::Integer(99));

        let err = validate(&specs, &params).unwrap_err();
        assert_eq!(err.errors.len(), 2);
    }
}
