use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Map of string keys and values that can be used to organize
/// and categorize (scope and select) objects.
///
/// Keys are kept sorted, so the string form is a stable
/// identity for a label set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self {
        Labels(BTreeMap::new())
    }

    pub fn insert(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Labels {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let pairs = self
            .0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        write!(f, "{}", pairs.join(","))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Labels {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Labels(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// A label query over a set of resources.
/// The result of matchLabels and matchExpressions are ANDed.
/// An empty label selector matches all objects.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    /// A map of {key,value} pairs.
    /// A single {key,value} in the matchLabels map is equivalent
    /// to an element of matchExpressions, whose key field is "key",
    /// the operator is "In", and the values array contains only "value".
    pub match_labels: BTreeMap<String, String>,
    /// A list of label selector requirements.
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to.
    pub key: String,
    /// Represents a key's relationship to a set of values.
    pub operator: SelectorOperator,
    /// An array of string values.
    /// If the operator is In or NotIn, the values array must be non-empty.
    /// If the operator is Exists or DoesNotExist, the values array must be empty.
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    #[serde(skip)]
    Equals,
    #[serde(skip)]
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Requirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In | SelectorOperator::Equals => {
                value.map_or(false, |v| self.values.contains(v))
            },
            SelectorOperator::NotIn | SelectorOperator::NotEquals => {
                value.map_or(true, |v| !self.values.contains(v))
            },
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let values = self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            SelectorOperator::Equals => write!(f, "{}={}", self.key, values),
            SelectorOperator::NotEquals => write!(f, "{}!={}", self.key, values),
            SelectorOperator::In => write!(f, "{} in ({})", self.key, values),
            SelectorOperator::NotIn => write!(f, "{} notin ({})", self.key, values),
            SelectorOperator::Exists => write!(f, "{}", self.key),
            SelectorOperator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A compiled label selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Matches no objects at all.
    Nothing,
    /// All requirements must hold. No requirements matches everything.
    Requirements(Vec<Requirement>),
}

impl Default for Selector {
    fn default() -> Self {
        Selector::everything()
    }
}

impl Selector {
    pub fn everything() -> Self {
        Selector::Requirements(vec![])
    }

    pub fn nothing() -> Self {
        Selector::Nothing
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        match self {
            Selector::Nothing => false,
            Selector::Requirements(requirements) => requirements.iter().all(|r| r.matches(labels)),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selector::Requirements(r) if r.is_empty())
    }

    /// Convert an API label selector. A missing selector selects nothing.
    pub fn from_label_selector(selector: Option<&LabelSelector>) -> Result<Self> {
        let selector = match selector {
            Some(selector) => selector,
            None => return Ok(Selector::Nothing),
        };
        let mut requirements = Vec::new();
        for (key, value) in &selector.match_labels {
            requirements.push(Requirement {
                key: key.to_owned(),
                operator: SelectorOperator::Equals,
                values: BTreeSet::from([value.to_owned()]),
            });
        }
        for expr in &selector.match_expressions {
            match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if expr.values.is_empty() => {
                    return Err(anyhow!(
                        "values must be non-empty for operator {:?} on key {}",
                        expr.operator,
                        expr.key
                    ));
                },
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !expr.values.is_empty() =>
                {
                    return Err(anyhow!(
                        "values must be empty for operator {:?} on key {}",
                        expr.operator,
                        expr.key
                    ));
                },
                _ => {},
            }
            requirements.push(Requirement {
                key: expr.key.to_owned(),
                operator: expr.operator,
                values: expr.values.iter().cloned().collect(),
            });
        }
        requirements.sort();
        Ok(Selector::Requirements(requirements))
    }

    /// Parse the textual selector form, e.g. `app=web,tier!=cache,env in (a,b),!legacy`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(text)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(term)?);
        }
        requirements.sort();
        Ok(Selector::Requirements(requirements))
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Nothing => write!(f, "<none>"),
            Selector::Requirements(requirements) => {
                let terms = requirements
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>();
                write!(f, "{}", terms.join(","))
            },
        }
    }
}

fn split_terms(text: &str) -> Result<Vec<String>> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            },
            ')' => {
                if depth == 0 {
                    return Err(anyhow!("unbalanced parenthesis in selector {}", text));
                }
                depth -= 1;
                current.push(c);
            },
            ',' if depth == 0 => terms.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(anyhow!("unbalanced parenthesis in selector {}", text));
    }
    terms.push(current);
    Ok(terms)
}

fn parse_set(key: &str, rest: &str) -> Result<BTreeSet<String>> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| anyhow!("expected value set for key {}", key))?;
    let values = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>();
    if values.is_empty() {
        return Err(anyhow!("empty value set for key {}", key));
    }
    Ok(values)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(anyhow!("invalid label key {:?}", key));
    }
    Ok(())
}

fn parse_requirement(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        validate_key(key)?;
        return Ok(Requirement {
            key: key.to_string(),
            operator: SelectorOperator::DoesNotExist,
            values: BTreeSet::new(),
        });
    }
    if let Some((key, value)) = term.split_once("!=") {
        let key = key.trim();
        validate_key(key)?;
        return Ok(Requirement {
            key: key.to_string(),
            operator: SelectorOperator::NotEquals,
            values: BTreeSet::from([value.trim().to_string()]),
        });
    }
    if let Some((key, value)) = term.split_once('=') {
        let key = key.trim();
        validate_key(key)?;
        let value = value.strip_prefix('=').unwrap_or(value);
        return Ok(Requirement {
            key: key.to_string(),
            operator: SelectorOperator::Equals,
            values: BTreeSet::from([value.trim().to_string()]),
        });
    }
    let mut parts = term.splitn(2, char::is_whitespace);
    let key = parts.next().unwrap_or_default().trim();
    validate_key(key)?;
    match parts.next().map(str::trim) {
        None => Ok(Requirement {
            key: key.to_string(),
            operator: SelectorOperator::Exists,
            values: BTreeSet::new(),
        }),
        Some(rest) => {
            if let Some(set) = rest.strip_prefix("notin") {
                Ok(Requirement {
                    key: key.to_string(),
                    operator: SelectorOperator::NotIn,
                    values: parse_set(key, set)?,
                })
            } else if let Some(set) = rest.strip_prefix("in") {
                Ok(Requirement {
                    key: key.to_string(),
                    operator: SelectorOperator::In,
                    values: parse_set(key, set)?,
                })
            } else {
                Err(anyhow!("unknown selector operator in {:?}", term))
            }
        },
    }
}
