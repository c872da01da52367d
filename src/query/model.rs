//! Abstract query representation.
//!
//! Every clause shape is a variant of a closed enum so each rewrite or
//! classification is one exhaustive `match`.

use serde::{Deserialize, Serialize};

/// Direction of one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One sort key (parameter + direction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub param: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(param: impl Into<String>) -> Self {
        Self { param: param.into(), direction: SortDirection::Ascending }
    }

    pub fn descending(param: impl Into<String>) -> Self {
        Self { param: param.into(), direction: SortDirection::Descending }
    }
}

/// Comparison prefix on a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    StartsAfter,
    EndsBefore,
    Approx,
}

impl Operator {
    /// Two-letter wire prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Ge => "ge",
            Operator::Le => "le",
            Operator::StartsAfter => "sa",
            Operator::EndsBefore => "eb",
            Operator::Approx => "ap",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Some(match prefix {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "ge" => Operator::Ge,
            "le" => Operator::Le,
            "sa" => Operator::StartsAfter,
            "eb" => Operator::EndsBefore,
            "ap" => Operator::Approx,
            _ => return None,
        })
    }
}

/// A filter clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    /// `name[:modifier]=[op]v1,v2` — values are OR-ed.
    Param {
        name: String,
        modifier: Option<String>,
        operator: Operator,
        values: Vec<String>,
    },
    /// Concrete id-set produced by distributed resolution.
    IdSet { param: String, ids: Vec<String> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Shorthand for a single-valued equality parameter.
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Param {
            name: name.into(),
            modifier: None,
            operator: Operator::Eq,
            values: vec![value.into()],
        }
    }

    /// Parameter names this clause constrains, in order of appearance.
    pub fn param_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Param { name, .. } => out.push(name),
            Filter::IdSet { param, .. } => out.push(param),
            Filter::And(items) | Filter::Or(items) => {
                for item in items {
                    item.collect_names(out);
                }
            }
            Filter::Not(inner) => inner.collect_names(out),
        }
    }

    /// Number of leaf clauses.
    pub fn leaf_count(&self) -> usize {
        match self {
            Filter::Param { .. } | Filter::IdSet { .. } => 1,
            Filter::And(items) | Filter::Or(items) => items.iter().map(Filter::leaf_count).sum(),
            Filter::Not(inner) => inner.leaf_count(),
        }
    }
}

/// One hop of a forward chain: the reference parameter and, optionally, the
/// type it must point at (`subject:Patient`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainLink {
    pub param: String,
    pub target_type: Option<String>,
}

/// Filter on an attribute of a referenced entity: `subject:Patient.name=Smith`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardChain {
    pub links: Vec<ChainLink>,
    pub leaf: Filter,
}

/// Filter by entities that reference this one: `_has:Observation:patient:code=1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReverseChain {
    pub source_type: String,
    pub reference_param: String,
    pub leaf: Filter,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Chain {
    Forward(ForwardChain),
    Reverse(ReverseChain),
}

impl Chain {
    /// Number of nested forward links (reverse chains count as one).
    pub fn depth(&self) -> usize {
        match self {
            Chain::Forward(chain) => chain.links.len(),
            Chain::Reverse(_) => 1,
        }
    }
}

/// `_include=Source:param[:Target]` or `_revinclude=Source:param[:Target]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Include {
    pub reverse: bool,
    pub source_type: String,
    pub param: String,
    pub target_type: Option<String>,
    pub iterate: bool,
}

/// An already-parsed search request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractQuery {
    /// `None` means a system-wide search.
    pub resource_type: Option<String>,
    pub filters: Vec<Filter>,
    pub sort: Vec<SortKey>,
    pub page_size: usize,
    pub chains: Vec<Chain>,
    pub includes: Vec<Include>,
}

impl AbstractQuery {
    pub fn new(resource_type: Option<&str>, page_size: usize) -> Self {
        Self {
            resource_type: resource_type.map(str::to_string),
            filters: Vec::new(),
            sort: Vec::new(),
            page_size,
            chains: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_chain(mut self, chain: Chain) -> Self {
        self.chains.push(chain);
        self
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.includes.push(include);
        self
    }

    /// Deepest forward chain in the query.
    pub fn max_chain_depth(&self) -> usize {
        self.chains.iter().map(Chain::depth).max().unwrap_or(0)
    }

    /// Top-level parameter names the backend must support to evaluate the query.
    pub fn required_params(&self) -> Vec<String> {
        let mut params: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !name.starts_with('_') && !params.iter().any(|p| p == name) {
                params.push(name.to_string());
            }
        };
        for filter in &self.filters {
            for name in filter.param_names() {
                push(name);
            }
        }
        for key in &self.sort {
            push(&key.param);
        }
        for chain in &self.chains {
            if let Chain::Forward(forward) = chain {
                if let Some(first) = forward.links.first() {
                    push(&first.param);
                }
            }
        }
        params
    }
}
