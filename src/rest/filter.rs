//! Query filters with nested relation inclusion.
//!
//! Filters are only built and serialized here; the backend evaluates them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query filter sent as the `filter` query parameter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Include>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_where(mut self, condition: Value) -> Self {
        self.where_ = Some(condition);
        self
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.include = Some(include);
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Relation inclusion, nestable to any depth through `scope`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Include {
    /// Bare relation name.
    Relation(String),
    /// Relation with a nested filter applied to the related records.
    Scoped {
        relation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<Box<Filter>>,
    },
    /// Several sibling inclusions.
    Many(Vec<Include>),
}

impl Include {
    pub fn relation(name: impl Into<String>) -> Self {
        Self::Scoped {
            relation: name.into(),
            scope: None,
        }
    }

    /// Includes `relation` and, inside it, `nested`.
    pub fn nested(name: impl Into<String>, nested: Include) -> Self {
        Self::Scoped {
            relation: name.into(),
            scope: Some(Box::new(Filter::new().with_include(nested))),
        }
    }

    pub fn scoped(name: impl Into<String>, scope: Filter) -> Self {
        Self::Scoped {
            relation: name.into(),
            scope: Some(Box::new(scope)),
        }
    }

    /// Inclusion chain `a -> b -> c` for `path = ["a", "b", "c"]`.
    pub fn path<I, S>(path: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: DoubleEndedIterator,
        S: Into<String>,
    {
        path.into_iter().rev().fold(None, |inner, name| {
            Some(match inner {
                Some(inner) => Self::nested(name, inner),
                None => Self::relation(name),
            })
        })
    }
}
