//! Equality-based label selectors, as accepted by the Kubernetes API's
//! `labelSelector` parameter.

use crate::{Error, Result};
use std::{collections::BTreeMap, fmt, str::FromStr};

pub type Map = BTreeMap<String, String>;

/// Selects objects by label. An empty selector selects everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Expression>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: Operator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operator {
    Equals(String),
    NotEquals(String),
    Exists,
    DoesNotExist,
}

// === impl Selector ===

impl Selector {
    pub fn matches(&self, labels: Option<&Map>) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(Expression::from_str)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, expr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match &expr.operator {
                Operator::Equals(v) => write!(f, "{}={}", expr.key, v)?,
                Operator::NotEquals(v) => write!(f, "{}!={}", expr.key, v)?,
                Operator::Exists => f.write_str(&expr.key)?,
                Operator::DoesNotExist => write!(f, "!{}", expr.key)?,
            }
        }
        Ok(())
    }
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: Option<&Map>) -> bool {
        let value = labels.and_then(|l| l.get(&self.key));
        match &self.operator {
            Operator::Equals(v) => value == Some(v),
            Operator::NotEquals(v) => value != Some(v),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl FromStr for Expression {
    type Err = Error;

    fn from_str(term: &str) -> Result<Self> {
        let (key, operator) = if let Some(key) = term.strip_prefix('!') {
            (key, Operator::DoesNotExist)
        } else if let Some((key, value)) = term.split_once("!=") {
            (key, Operator::NotEquals(value.trim().to_string()))
        } else if let Some((key, value)) = term.split_once("==") {
            (key, Operator::Equals(value.trim().to_string()))
        } else if let Some((key, value)) = term.split_once('=') {
            (key, Operator::Equals(value.trim().to_string()))
        } else {
            (term, Operator::Exists)
        };

        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(Error::invalid("label selector", format!("{term:?}")));
        }
        Ok(Self {
            key: key.to_string(),
            operator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn test_matches() {
        let labels = btreemap! {
            "app".to_string() => "web".to_string(),
            "tier".to_string() => "frontend".to_string(),
        };

        for (selector, matches, msg) in [
            ("", true, "empty match"),
            ("app=web", true, "exact label match"),
            ("app==web", true, "double-equals match"),
            ("app=web,tier=frontend", true, "all terms match"),
            ("app=web,tier=backend", false, "one term mismatches"),
            ("app!=db", true, "not-equals match"),
            ("app!=web", false, "not-equals mismatch"),
            ("tier", true, "exists"),
            ("!canary", true, "does not exist"),
            ("!app", false, "exists but must not"),
        ] {
            let selector = selector.parse::<Selector>().unwrap();
            assert_eq!(selector.matches(Some(&labels)), matches, "{msg}");
        }
    }

    #[test]
    fn unlabeled_objects() {
        let selector = "!canary".parse::<Selector>().unwrap();
        assert!(selector.matches(None));
        let selector = "app=web".parse::<Selector>().unwrap();
        assert!(!selector.matches(None));
    }

    #[test]
    fn rejects_malformed_terms() {
        assert!("=web".parse::<Selector>().is_err());
        assert!("my app=web".parse::<Selector>().is_err());
        assert!("!".parse::<Selector>().is_err());
    }

    #[test]
    fn displays_canonically() {
        let selector = "app == web, !canary,tier".parse::<Selector>().unwrap();
        assert_eq!(selector.to_string(), "app=web,!canary,tier");
    }
}
