//! Distributed chain resolution.
//!
//! Forward `subject:Patient.organization:Organization.name=Acme` on
//! Observation resolves innermost first:
//! ```text
//! Organization?name=Acme                      → Organization/o1, o2
//! Patient?organization=Organization/o1,o2     → Patient/p1 (batched)
//! Observation?subject=Patient/p1              (IdSet on the main query)
//! ```
//! Reverse `_has:Observation:patient:code=1234` on Patient:
//! ```text
//! Observation?code=1234 → patient references → Patient?_id=...
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{BrokerError, BrokerResult, QueryError};
use crate::observability::metrics;
use crate::query::params::normalized_key;
use crate::query::{AbstractQuery, Chain, Filter, ForwardChain, ReverseChain};
use crate::resolution::{reference_values, split_reference, ResolutionScope, Resolver};

/// Reject chain shapes distributed resolution cannot handle, before any
/// backend call.
pub fn check_distributed_chains(query: &AbstractQuery) -> Result<(), QueryError> {
    for chain in &query.chains {
        match chain {
            Chain::Forward(forward) => {
                if forward.links.is_empty() {
                    return Err(QueryError::UnsupportedResolution("empty forward chain".into()));
                }
                if let Some(link) = forward.links.iter().find(|l| l.target_type.is_none()) {
                    return Err(QueryError::UnsupportedResolution(format!(
                        "chain link '{}' must name its target type for distributed resolution",
                        link.param
                    )));
                }
            }
            Chain::Reverse(_) => {
                if query.resource_type.is_none() {
                    return Err(QueryError::UnsupportedResolution(
                        "reverse chains need a resource type".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

impl Resolver {
    /// Rewrite every chain into an `IdSet` filter. `None` means some chain
    /// matched nothing, so the query cannot match anything either.
    pub async fn resolve_chains(
        &self,
        scope: &ResolutionScope<'_>,
        query: &AbstractQuery,
    ) -> BrokerResult<Option<AbstractQuery>> {
        if query.chains.is_empty() {
            return Ok(Some(query.clone()));
        }
        check_distributed_chains(query)?;
        self.within_phase(scope, "chain", self.rewrite_chains(scope, query)).await
    }

    async fn rewrite_chains(
        &self,
        scope: &ResolutionScope<'_>,
        query: &AbstractQuery,
    ) -> BrokerResult<Option<AbstractQuery>> {
        let mut rewritten = query.clone();
        rewritten.chains.clear();

        for chain in &query.chains {
            let filter = match chain {
                Chain::Forward(forward) => self.resolve_forward(scope, forward).await?,
                Chain::Reverse(reverse) => {
                    // Checked above.
                    let target = query.resource_type.as_deref().unwrap_or_default();
                    self.resolve_reverse(scope, target, reverse).await?
                }
            };
            match filter {
                Some(filter) => rewritten.filters.push(filter),
                None => {
                    tracing::debug!("Chain resolved to no ids");
                    return Ok(None);
                }
            }
        }
        Ok(Some(rewritten))
    }

    async fn resolve_forward(
        &self,
        scope: &ResolutionScope<'_>,
        chain: &ForwardChain,
    ) -> BrokerResult<Option<Filter>> {
        let last = chain.links.len().saturating_sub(1);

        let innermost = AbstractQuery::new(Some(link_target(chain, last)?), scope.page_size)
            .with_filter(chain.leaf.clone());
        let mut refs: Vec<String> = self.collect_references(scope, &innermost).await?.to_vec();

        for i in (0..last).rev() {
            if refs.is_empty() {
                return Ok(None);
            }
            let resource_type = link_target(chain, i)?;
            let param = &chain.links[i + 1].param;
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for batch in refs.chunks(scope.config.batch_size.max(1)) {
                let step = AbstractQuery::new(Some(resource_type), scope.page_size)
                    .with_filter(Filter::IdSet {
                        param: param.clone(),
                        ids: batch.to_vec(),
                    });
                for reference in self.collect_references(scope, &step).await?.iter() {
                    if seen.insert(reference.clone()) {
                        next.push(reference.clone());
                    }
                }
                if next.len() > scope.config.max_reference_ids {
                    return Err(super::too_many(scope));
                }
            }
            refs = next;
        }

        if refs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Filter::IdSet {
            param: chain.links[0].param.clone(),
            ids: refs,
        }))
    }

    async fn resolve_reverse(
        &self,
        scope: &ResolutionScope<'_>,
        target_type: &str,
        chain: &ReverseChain,
    ) -> BrokerResult<Option<Filter>> {
        let source = AbstractQuery::new(Some(chain.source_type.as_str()), scope.page_size)
            .with_filter(chain.leaf.clone());
        let key = format!(
            "{}#{}->{}",
            normalized_key(Some(chain.source_type.as_str()), &source),
            chain.reference_param,
            target_type
        );

        let ids = match self.cache.get(&key) {
            Some(hit) => {
                metrics::record_resolution("reverse_chain", true);
                hit
            }
            None => {
                metrics::record_resolution("reverse_chain", false);
                let collected = self.collect(scope, &source).await?;
                let mut seen = HashSet::new();
                let mut ids = Vec::new();
                for entry in &collected.entries {
                    for reference in reference_values(&entry.resource, &chain.reference_param) {
                        match split_reference(&reference) {
                            Some((ty, id)) if ty == target_type && seen.insert(id.to_string()) => {
                                ids.push(id.to_string());
                            }
                            _ => {}
                        }
                    }
                }
                if ids.len() > scope.config.max_reference_ids {
                    return Err(super::too_many(scope));
                }
                if collected.complete {
                    self.cache.insert(key, ids)
                } else {
                    Arc::new(ids)
                }
            }
        };

        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(Filter::IdSet {
            param: "_id".to_string(),
            ids: ids.to_vec(),
        }))
    }
}

fn link_target(chain: &ForwardChain, i: usize) -> BrokerResult<&str> {
    let link = chain
        .links
        .get(i)
        .ok_or_else(|| QueryError::UnsupportedResolution("empty forward chain".into()))?;
    link.target_type.as_deref().ok_or_else(|| {
        BrokerError::Invalid(QueryError::UnsupportedResolution(format!(
            "chain link '{}' has no target type",
            link.param
        )))
    })
}
