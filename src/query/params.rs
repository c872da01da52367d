//! Conversion between `AbstractQuery` and the key/value parameter form used
//! on the wire.
//!
//! Outbound serialization is total: every `Filter` variant has an explicit
//! mapping. Shapes the plain parameter grammar cannot express (an `Or` across
//! different parameters, a negated range) fall back to a `_filter`
//! expression.

use crate::error::QueryError;
use crate::query::model::{
    AbstractQuery, Chain, ChainLink, Filter, ForwardChain, Include, Operator, ReverseChain,
    SortDirection, SortKey,
};

/// Parameter carrying the distributed continuation token.
pub const CONTINUATION_PARAM: &str = "_continuation";
/// Parameter carrying a backend's own page token.
pub const PAGE_TOKEN_PARAM: &str = "_page_token";
pub const COUNT_PARAM: &str = "_count";

/// An inbound request split into the query and the continuation token, if any.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub query: AbstractQuery,
    pub continuation: Option<String>,
}

/// Parse inbound key/value parameters.
pub fn parse_params(
    resource_type: Option<&str>,
    params: &[(String, String)],
    default_page_size: usize,
) -> Result<ParsedRequest, QueryError> {
    let mut query = AbstractQuery::new(resource_type, default_page_size);
    let mut continuation = None;

    for (key, value) in params {
        let (base, modifier) = split_modifier(key);
        match base {
            COUNT_PARAM => {
                query.page_size = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| invalid(key, "expected a positive integer"))?;
            }
            "_sort" => {
                for item in value.split(',').filter(|s| !s.is_empty()) {
                    query.sort.push(match item.strip_prefix('-') {
                        Some(param) => SortKey::descending(param),
                        None => SortKey::ascending(item),
                    });
                }
            }
            "_include" | "_revinclude" => {
                query.includes.push(parse_include(key, value, base == "_revinclude", modifier)?);
            }
            CONTINUATION_PARAM => continuation = Some(value.clone()),
            "_filter" => return Err(invalid(key, "_filter expressions are not accepted inbound")),
            _ if key.starts_with("_has:") => {
                query.chains.push(Chain::Reverse(parse_reverse_chain(key, value)?));
            }
            _ if key.contains('.') => {
                query.chains.push(Chain::Forward(parse_forward_chain(key, value)?));
            }
            _ => query.filters.push(parse_filter(key, value)?),
        }
    }

    Ok(ParsedRequest { query, continuation })
}

fn invalid(param: &str, reason: &str) -> QueryError {
    QueryError::InvalidParameter {
        param: param.to_string(),
        reason: reason.to_string(),
    }
}

fn split_modifier(key: &str) -> (&str, Option<&str>) {
    match key.split_once(':') {
        Some((base, modifier)) if !base.starts_with("_has") => (base, Some(modifier)),
        _ => (key, None),
    }
}

fn split_prefix(value: &str) -> (Operator, &str) {
    if value.len() > 2 && value.is_char_boundary(2) {
        let (prefix, rest) = value.split_at(2);
        let numeric = rest
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-')
            .unwrap_or(false);
        if numeric {
            if let Some(op) = Operator::from_prefix(prefix) {
                return (op, rest);
            }
        }
    }
    (Operator::Eq, value)
}

fn parse_filter(key: &str, value: &str) -> Result<Filter, QueryError> {
    let (name, modifier) = split_modifier(key);
    if name.is_empty() {
        return Err(invalid(key, "empty parameter name"));
    }
    if value.is_empty() {
        return Err(invalid(key, "empty value"));
    }

    let parsed: Vec<(Operator, &str)> = value.split(',').map(split_prefix).collect();
    let operator = parsed[0].0;
    let param = |operator: Operator, values: Vec<String>| Filter::Param {
        name: name.to_string(),
        modifier: modifier.map(str::to_string),
        operator,
        values,
    };

    if parsed.iter().all(|(op, _)| *op == operator) {
        Ok(param(operator, parsed.iter().map(|(_, v)| v.to_string()).collect()))
    } else {
        Ok(Filter::Or(
            parsed
                .into_iter()
                .map(|(op, v)| param(op, vec![v.to_string()]))
                .collect(),
        ))
    }
}

fn parse_forward_chain(key: &str, value: &str) -> Result<ForwardChain, QueryError> {
    let segments: Vec<&str> = key.split('.').collect();
    let (leaf_key, link_segments) = segments
        .split_last()
        .ok_or_else(|| invalid(key, "empty chain"))?;

    let mut links = Vec::with_capacity(link_segments.len());
    for segment in link_segments {
        let (param, target_type) = match segment.split_once(':') {
            Some((param, ty)) => (param, Some(ty.to_string())),
            None => (*segment, None),
        };
        if param.is_empty() {
            return Err(invalid(key, "empty chain segment"));
        }
        links.push(ChainLink { param: param.to_string(), target_type });
    }

    Ok(ForwardChain {
        links,
        leaf: parse_filter(leaf_key, value)?,
    })
}

fn parse_reverse_chain(key: &str, value: &str) -> Result<ReverseChain, QueryError> {
    let mut parts = key.splitn(4, ':');
    parts.next();
    let source_type = parts.next().filter(|s| !s.is_empty());
    let reference_param = parts.next().filter(|s| !s.is_empty());
    let leaf_key = parts.next().filter(|s| !s.is_empty());

    match (source_type, reference_param, leaf_key) {
        (Some(_), Some(_), Some(leaf)) if leaf.starts_with("_has:") => {
            Err(invalid(key, "nested _has is not supported"))
        }
        (Some(source_type), Some(reference_param), Some(leaf)) => Ok(ReverseChain {
            source_type: source_type.to_string(),
            reference_param: reference_param.to_string(),
            leaf: parse_filter(leaf, value)?,
        }),
        _ => Err(invalid(key, "expected _has:Type:reference:param")),
    }
}

fn parse_include(
    key: &str,
    value: &str,
    reverse: bool,
    modifier: Option<&str>,
) -> Result<Include, QueryError> {
    let iterate = match modifier {
        None => false,
        Some("iterate") | Some("recurse") => true,
        Some(_) => return Err(invalid(key, "unknown include modifier")),
    };
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(source), Some(param), target, None) if !source.is_empty() && !param.is_empty() => {
            Ok(Include {
                reverse,
                source_type: source.to_string(),
                param: param.to_string(),
                target_type: target.map(str::to_string),
                iterate,
            })
        }
        _ => Err(invalid(key, "expected Source:param[:Target]")),
    }
}

/// Serialize a query back into wire parameters. Page size and page token are
/// attached by the backend client.
pub fn to_wire_params(query: &AbstractQuery) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for filter in &query.filters {
        write_filter(filter, "", &mut out);
    }

    for chain in &query.chains {
        match chain {
            Chain::Forward(forward) => {
                let prefix = forward
                    .links
                    .iter()
                    .map(|link| match &link.target_type {
                        Some(ty) => format!("{}:{}.", link.param, ty),
                        None => format!("{}.", link.param),
                    })
                    .collect::<String>();
                write_filter(&forward.leaf, &prefix, &mut out);
            }
            Chain::Reverse(reverse) => {
                let prefix = format!("_has:{}:{}:", reverse.source_type, reverse.reference_param);
                write_filter(&reverse.leaf, &prefix, &mut out);
            }
        }
    }

    if !query.sort.is_empty() {
        let sort = query
            .sort
            .iter()
            .map(|key| match key.direction {
                SortDirection::Ascending => key.param.clone(),
                SortDirection::Descending => format!("-{}", key.param),
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push(("_sort".to_string(), sort));
    }

    for include in &query.includes {
        out.push(include_param(include));
    }

    out
}

/// Wire form of one include clause.
pub fn include_param(include: &Include) -> (String, String) {
    let mut key = if include.reverse { "_revinclude" } else { "_include" }.to_string();
    if include.iterate {
        key.push_str(":iterate");
    }
    let value = match &include.target_type {
        Some(target) => format!("{}:{}:{}", include.source_type, include.param, target),
        None => format!("{}:{}", include.source_type, include.param),
    };
    (key, value)
}

fn write_filter(filter: &Filter, prefix: &str, out: &mut Vec<(String, String)>) {
    match filter {
        Filter::Param { name, modifier, operator, values } => {
            out.push((param_key(prefix, name, modifier.as_deref()), join_values(*operator, values)));
        }
        Filter::IdSet { param, ids } => {
            out.push((format!("{}{}", prefix, param), ids.join(",")));
        }
        Filter::And(items) => {
            for item in items {
                write_filter(item, prefix, out);
            }
        }
        Filter::Or(items) => match merge_disjunction(items) {
            Some((key, value)) => out.push((format!("{}{}", prefix, key), value)),
            None => out.push(("_filter".to_string(), filter_expression(filter, prefix))),
        },
        Filter::Not(inner) => match inner.as_ref() {
            Filter::Param { name, modifier: None, operator: Operator::Eq, values } => {
                out.push((param_key(prefix, name, Some("not")), values.join(",")));
            }
            _ => out.push(("_filter".to_string(), filter_expression(filter, prefix))),
        },
    }
}

fn param_key(prefix: &str, name: &str, modifier: Option<&str>) -> String {
    match modifier {
        Some(modifier) => format!("{}{}:{}", prefix, name, modifier),
        None => format!("{}{}", prefix, name),
    }
}

fn join_values(operator: Operator, values: &[String]) -> String {
    values
        .iter()
        .map(|v| match operator {
            Operator::Eq => v.clone(),
            op => format!("{}{}", op.prefix(), v),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// An `Or` whose members all constrain the same parameter becomes one
/// comma-separated parameter.
fn merge_disjunction(items: &[Filter]) -> Option<(String, String)> {
    let mut key: Option<String> = None;
    let mut values = Vec::new();

    for item in items {
        let (item_key, item_value) = match item {
            Filter::Param { name, modifier, operator, values } => {
                (param_key("", name, modifier.as_deref()), join_values(*operator, values))
            }
            Filter::IdSet { param, ids } => (param.clone(), ids.join(",")),
            _ => return None,
        };
        match &key {
            Some(existing) if *existing != item_key => return None,
            Some(_) => {}
            None => key = Some(item_key),
        }
        values.push(item_value);
    }

    key.map(|k| (k, values.join(",")))
}

/// Render a filter in `_filter` expression syntax.
pub fn filter_expression(filter: &Filter, prefix: &str) -> String {
    match filter {
        Filter::Param { name, modifier, operator, values } => {
            let path = param_key(prefix, name, modifier.as_deref());
            disjunction(values.iter().map(|v| format!("{} {} {}", path, operator.prefix(), quote(v))))
        }
        Filter::IdSet { param, ids } => {
            let path = format!("{}{}", prefix, param);
            disjunction(ids.iter().map(|id| format!("{} eq {}", path, quote(id))))
        }
        Filter::And(items) => format!(
            "({})",
            items
                .iter()
                .map(|i| filter_expression(i, prefix))
                .collect::<Vec<_>>()
                .join(" and ")
        ),
        Filter::Or(items) => format!(
            "({})",
            items
                .iter()
                .map(|i| filter_expression(i, prefix))
                .collect::<Vec<_>>()
                .join(" or ")
        ),
        Filter::Not(inner) => format!("not ({})", filter_expression(inner, prefix)),
    }
}

fn disjunction(terms: impl Iterator<Item = String>) -> String {
    let terms: Vec<String> = terms.collect();
    if terms.len() == 1 {
        terms.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", terms.join(" or "))
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Stable key for a (resource type, query) pair, independent of parameter order.
pub fn normalized_key(resource_type: Option<&str>, query: &AbstractQuery) -> String {
    let mut params = to_wire_params(query);
    params.sort();
    let body = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", resource_type.unwrap_or("*"), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_basic_params() {
        let parsed = parse_params(
            Some("Patient"),
            &pairs(&[
                ("name", "Smith,Jones"),
                ("birthdate", "ge1990-01-01"),
                ("_sort", "-birthdate,name"),
                ("_count", "5"),
                ("_continuation", "abc"),
            ]),
            20,
        )
        .unwrap();

        let query = parsed.query;
        assert_eq!(query.page_size, 5);
        assert_eq!(parsed.continuation.as_deref(), Some("abc"));
        assert_eq!(
            query.sort,
            vec![SortKey::descending("birthdate"), SortKey::ascending("name")]
        );
        assert_eq!(
            query.filters[1],
            Filter::Param {
                name: "birthdate".into(),
                modifier: None,
                operator: Operator::Ge,
                values: vec!["1990-01-01".into()],
            }
        );
    }

    #[test]
    fn test_parse_chains_and_includes() {
        let parsed = parse_params(
            Some("Observation"),
            &pairs(&[
                ("subject:Patient.organization:Organization.name", "Acme"),
                ("_has:Provenance:target:agent", "Practitioner/1"),
                ("_include", "Observation:subject:Patient"),
                ("_revinclude:iterate", "Provenance:target"),
            ]),
            20,
        )
        .unwrap();

        let query = parsed.query;
        assert_eq!(query.max_chain_depth(), 2);
        match &query.chains[1] {
            Chain::Reverse(rev) => {
                assert_eq!(rev.source_type, "Provenance");
                assert_eq!(rev.reference_param, "target");
                assert_eq!(rev.leaf, Filter::eq("agent", "Practitioner/1"));
            }
            other => panic!("unexpected chain {:?}", other),
        }
        assert!(!query.includes[0].reverse);
        assert_eq!(query.includes[0].target_type.as_deref(), Some("Patient"));
        assert!(query.includes[1].reverse && query.includes[1].iterate);
    }

    #[test]
    fn test_parse_rejects_bad_params() {
        assert!(parse_params(None, &pairs(&[("_count", "zero")]), 20).is_err());
        assert!(parse_params(None, &pairs(&[("_include", "Observation")]), 20).is_err());
        assert!(parse_params(None, &pairs(&[("_has:Observation", "x")]), 20).is_err());
        assert!(parse_params(None, &pairs(&[("name", "")]), 20).is_err());
    }

    #[test]
    fn test_wire_round_trip_of_parsed_params() {
        let input = pairs(&[
            ("name:exact", "Smith"),
            ("subject:Patient.name", "Jones"),
            ("_has:Observation:patient:code", "1234"),
            ("_sort", "-date"),
            ("_include", "Observation:subject"),
        ]);
        let parsed = parse_params(Some("Observation"), &input, 20).unwrap();
        assert_eq!(to_wire_params(&parsed.query), input);
    }

    #[test]
    fn test_rewritten_id_set_serializes_as_plain_param() {
        let query = AbstractQuery::new(Some("Observation"), 10).with_filter(Filter::IdSet {
            param: "subject".into(),
            ids: vec!["Patient/1".into(), "Patient/7".into()],
        });
        assert_eq!(
            to_wire_params(&query),
            pairs(&[("subject", "Patient/1,Patient/7")])
        );
    }

    #[test]
    fn test_boolean_composition_mapping() {
        let same_param = Filter::Or(vec![Filter::eq("code", "a"), Filter::eq("code", "b")]);
        let mixed = Filter::Or(vec![Filter::eq("code", "a"), Filter::eq("status", "final")]);
        let negated = Filter::Not(Box::new(Filter::eq("status", "cancelled")));

        let query = AbstractQuery::new(Some("Observation"), 10)
            .with_filter(same_param)
            .with_filter(mixed)
            .with_filter(negated);

        assert_eq!(
            to_wire_params(&query),
            pairs(&[
                ("code", "a,b"),
                ("_filter", "(code eq \"a\" or status eq \"final\")"),
                ("status:not", "cancelled"),
            ])
        );
    }

    #[test]
    fn test_normalized_key_ignores_order() {
        let a = AbstractQuery::new(Some("Patient"), 10)
            .with_filter(Filter::eq("name", "x"))
            .with_filter(Filter::eq("gender", "f"));
        let b = AbstractQuery::new(Some("Patient"), 10)
            .with_filter(Filter::eq("gender", "f"))
            .with_filter(Filter::eq("name", "x"));
        assert_eq!(normalized_key(Some("Patient"), &a), normalized_key(Some("Patient"), &b));
    }
}
