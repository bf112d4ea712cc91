use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    /// Any operator string the engine does not know. Never satisfied.
    #[serde(other)]
    Unknown,
}

impl Operator {
    /// Compare an observed price against a threshold.
    ///
    /// `==` and `!=` compare the raw floating-point values; no tolerance is applied.
    #[allow(clippy::float_cmp)]
    pub fn apply(self, price: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => price > threshold,
            Self::Lt => price < threshold,
            Self::Gte => price >= threshold,
            Self::Lte => price <= threshold,
            Self::Eq => price == threshold,
            Self::Ne => price != threshold,
            Self::Unknown => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Unknown => "?",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            ">=" => Ok(Self::Gte),
            "<=" => Ok(Self::Lte),
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            other => Err(format!("unknown operator '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// A single comparison rule: `price(symbol) <operator> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    pub id: String,
    #[serde(deserialize_with = "symbol_ref")]
    pub symbol: String,
    pub operator: Operator,
    #[serde(rename = "value", alias = "threshold")]
    pub threshold: f64,
}

/// The symbol picker stores either the bare symbol or the selected catalog entry.
#[derive(Deserialize)]
#[serde(untagged)]
enum SymbolRef {
    Plain(String),
    Entry { symbol: String },
}

fn symbol_ref<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match SymbolRef::deserialize(deserializer)? {
        SymbolRef::Plain(symbol) => symbol,
        SymbolRef::Entry { symbol } => symbol,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub logic: Logic,
    #[serde(rename = "conditions", alias = "children", default)]
    pub children: Vec<ConditionNode>,
}

/// Condition tree as produced by the strategy editor.
///
/// Trees are immutable from the engine's point of view: an edit in the editor
/// produces a new tree which replaces the old one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConditionNode {
    #[serde(rename = "condition")]
    Leaf(Leaf),
    Group(Group),
}

impl ConditionNode {
    pub fn leaf(
        id: impl Into<String>,
        symbol: impl Into<String>,
        operator: Operator,
        threshold: f64,
    ) -> Self {
        Self::Leaf(Leaf {
            id: id.into(),
            symbol: symbol.into(),
            operator,
            threshold,
        })
    }

    pub fn group(id: impl Into<String>, logic: Logic, children: Vec<ConditionNode>) -> Self {
        Self::Group(Group {
            id: id.into(),
            logic,
            children,
        })
    }

    pub fn and(id: impl Into<String>, children: Vec<ConditionNode>) -> Self {
        Self::group(id, Logic::And, children)
    }

    pub fn or(id: impl Into<String>, children: Vec<ConditionNode>) -> Self {
        Self::group(id, Logic::Or, children)
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Leaf(leaf) => &leaf.id,
            Self::Group(group) => &group.id,
        }
    }

    /// Number of direct children (zero for a leaf).
    pub fn rule_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Group(group) => group.children.len(),
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
