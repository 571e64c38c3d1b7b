//! Label-selector matching
//!
//! Set-based label selector semantics over `matchLabels` and
//! `matchExpressions`. A missing or empty selector matches nothing so that a
//! group never silently absorbs every claim in its namespace. Malformed
//! selectors are rejected with [`Error::InvalidSelector`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

// =============================================================================
// Requirements
// =============================================================================

/// Selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl std::str::FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            other => Err(Error::InvalidSelector(format!("unknown operator {:?}", other))),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operator::In => write!(f, "In"),
            Operator::NotIn => write!(f, "NotIn"),
            Operator::Exists => write!(f, "Exists"),
            Operator::DoesNotExist => write!(f, "DoesNotExist"),
        }
    }
}

/// One requirement on a single label key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    fn new(key: &str, operator: Operator, values: BTreeSet<String>) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::InvalidSelector("empty label key".into()));
        }
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(Error::InvalidSelector(format!(
                    "{} on key {} requires at least one value",
                    operator, key
                )));
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(Error::InvalidSelector(format!(
                    "{} on key {} must not carry values",
                    operator, key
                )));
            }
            _ => {}
        }
        Ok(Self {
            key: key.to_string(),
            operator,
            values,
        })
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

// =============================================================================
// Selector
// =============================================================================

/// A validated label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Validate and compile a `LabelSelector`
    pub fn parse(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();

        if let Some(labels) = &selector.match_labels {
            for (key, value) in labels {
                requirements.push(Requirement::new(
                    key,
                    Operator::In,
                    BTreeSet::from([value.clone()]),
                )?);
            }
        }

        if let Some(expressions) = &selector.match_expressions {
            for expr in expressions {
                let operator: Operator = expr.operator.parse()?;
                let values = expr.values.clone().unwrap_or_default().into_iter().collect();
                requirements.push(Requirement::new(&expr.key, operator, values)?);
            }
        }

        let selector = Self { requirements };
        selector.check_satisfiable()?;
        Ok(selector)
    }

    /// Reject selectors whose requirements on one key contradict each other
    fn check_satisfiable(&self) -> Result<()> {
        let mut by_key: BTreeMap<&str, Vec<&Requirement>> = BTreeMap::new();
        for req in &self.requirements {
            by_key.entry(req.key.as_str()).or_default().push(req);
        }

        for (key, reqs) in by_key {
            let mut allowed: Option<BTreeSet<&String>> = None;
            let mut excluded = BTreeSet::new();
            let mut must_exist = false;
            let mut must_not_exist = false;

            for req in reqs {
                match req.operator {
                    Operator::In => {
                        must_exist = true;
                        let values: BTreeSet<&String> = req.values.iter().collect();
                        allowed = Some(match allowed {
                            Some(current) => current.intersection(&values).copied().collect(),
                            None => values,
                        });
                    }
                    Operator::NotIn => excluded.extend(req.values.iter()),
                    Operator::Exists => must_exist = true,
                    Operator::DoesNotExist => must_not_exist = true,
                }
            }

            if must_exist && must_not_exist {
                return Err(Error::InvalidSelector(format!(
                    "key {} is required both to exist and not to exist",
                    key
                )));
            }
            if let Some(allowed) = allowed {
                if allowed.iter().all(|v| excluded.contains(*v)) {
                    return Err(Error::InvalidSelector(format!(
                        "no value of key {} can satisfy the selector",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// True when every requirement holds; an empty selector matches nothing
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.is_empty() && self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Decide whether `labels` satisfy `selector`
pub fn matches(labels: &BTreeMap<String, String>, selector: Option<&LabelSelector>) -> Result<bool> {
    match selector {
        Some(selector) => Ok(Selector::parse(selector)?.matches(labels)),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    fn selector(
        match_labels: &[(&str, &str)],
        match_expressions: Vec<LabelSelectorRequirement>,
    ) -> LabelSelector {
        LabelSelector {
            match_labels: if match_labels.is_empty() {
                None
            } else {
                Some(labels(match_labels))
            },
            match_expressions: if match_expressions.is_empty() {
                None
            } else {
                Some(match_expressions)
            },
        }
    }

    #[test]
    fn test_nil_and_empty_selector_match_nothing() {
        let l = labels(&[("app", "x")]);
        assert!(!matches(&l, None).unwrap());
        assert!(!matches(&l, Some(&LabelSelector::default())).unwrap());
        assert!(!matches(&BTreeMap::new(), Some(&LabelSelector::default())).unwrap());
    }

    #[test]
    fn test_match_labels() {
        let sel = selector(&[("app", "x")], vec![]);
        assert!(matches(&labels(&[("app", "x"), ("tier", "db")]), Some(&sel)).unwrap());
        assert!(!matches(&labels(&[("app", "y")]), Some(&sel)).unwrap());
        assert!(!matches(&BTreeMap::new(), Some(&sel)).unwrap());
    }

    #[test]
    fn test_set_based_expressions() {
        let sel = selector(
            &[],
            vec![
                expr("env", "In", &["prod", "staging"]),
                expr("tier", "NotIn", &["cache"]),
                expr("app", "Exists", &[]),
                expr("legacy", "DoesNotExist", &[]),
            ],
        );
        let sel = Selector::parse(&sel).unwrap();
        assert!(sel.matches(&labels(&[("env", "prod"), ("app", "db")])));
        assert!(sel.matches(&labels(&[("env", "staging"), ("app", "db"), ("tier", "disk")])));
        assert!(!sel.matches(&labels(&[("env", "dev"), ("app", "db")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("app", "db"), ("tier", "cache")])));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("app", "db"), ("legacy", "1")])));
    }

    #[test]
    fn test_invalid_operator() {
        let sel = selector(&[], vec![expr("app", "Like", &["x"])]);
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));
    }

    #[test]
    fn test_values_arity() {
        let sel = selector(&[], vec![expr("app", "In", &[])]);
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));

        let sel = selector(&[], vec![expr("app", "Exists", &["x"])]);
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));
    }

    #[test]
    fn test_conflicting_requirements() {
        let sel = selector(&[("app", "x")], vec![expr("app", "NotIn", &["x"])]);
        assert_matches!(matches(&BTreeMap::new(), Some(&sel)), Err(Error::InvalidSelector(_)));

        let sel = selector(&[("app", "x")], vec![expr("app", "DoesNotExist", &[])]);
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));

        let sel = selector(
            &[],
            vec![expr("app", "In", &["x"]), expr("app", "In", &["y"])],
        );
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));

        let sel = selector(
            &[],
            vec![expr("app", "Exists", &[]), expr("app", "DoesNotExist", &[])],
        );
        assert_matches!(Selector::parse(&sel), Err(Error::InvalidSelector(_)));
    }

    #[test]
    fn test_overlapping_requirements_are_valid() {
        let sel = selector(
            &[("app", "x")],
            vec![expr("app", "In", &["x", "y"]), expr("app", "NotIn", &["y"])],
        );
        let sel = Selector::parse(&sel).unwrap();
        assert!(sel.matches(&labels(&[("app", "x")])));
        assert!(!sel.matches(&labels(&[("app", "y")])));
    }
}
