//! Distributed include resolution.
//!
//! Runs after the page is merged. `_include=S:p[:T]` fetches the entities
//! that page entries of type S reference through p; `_revinclude=S:p[:T]`
//! fetches entities of type S whose p references a page entry. Ids are
//! fetched across all backends in `batch_size` groups.

use std::collections::{BTreeMap, HashSet};

use crate::backend::SearchEntry;
use crate::error::{BrokerError, BrokerResult};
use crate::observability::metrics;
use crate::query::{AbstractQuery, Filter, Include};
use crate::resolution::{reference_values, split_reference, ResolutionScope, Resolver};

/// Bound on `:iterate` rounds.
const MAX_ITERATIONS: usize = 3;

impl Resolver {
    pub async fn resolve_includes(
        &self,
        scope: &ResolutionScope<'_>,
        includes: &[Include],
        entries: &[SearchEntry],
    ) -> BrokerResult<Vec<SearchEntry>> {
        if includes.is_empty() || entries.is_empty() {
            return Ok(Vec::new());
        }
        metrics::record_resolution("include", false);
        self.within_phase(scope, "include", self.expand_includes(scope, includes, entries))
            .await
    }

    async fn expand_includes(
        &self,
        scope: &ResolutionScope<'_>,
        includes: &[Include],
        entries: &[SearchEntry],
    ) -> BrokerResult<Vec<SearchEntry>> {
        let mut known: HashSet<String> = entries.iter().map(SearchEntry::reference).collect();
        let mut included = Vec::new();
        let mut frontier: Vec<SearchEntry> = entries.to_vec();

        for round in 0..MAX_ITERATIONS {
            let mut found = Vec::new();
            for include in includes.iter().filter(|i| round == 0 || i.iterate) {
                for entry in self.include_once(scope, include, &frontier).await? {
                    if known.insert(entry.reference()) {
                        found.push(entry);
                    }
                }
            }
            if included.len() + found.len() > scope.config.max_reference_ids {
                return Err(super::too_many(scope));
            }
            if found.is_empty() {
                break;
            }
            tracing::debug!(round, found = found.len(), "Included entities resolved");
            included.extend(found.iter().cloned());
            frontier = found;
        }
        Ok(included)
    }

    async fn include_once(
        &self,
        scope: &ResolutionScope<'_>,
        include: &Include,
        sources: &[SearchEntry],
    ) -> BrokerResult<Vec<SearchEntry>> {
        let batch_size = scope.config.batch_size.max(1);
        let mut fetched = Vec::new();

        if include.reverse {
            let refs: Vec<String> = sources
                .iter()
                .filter(|s| include.target_type.as_deref().map_or(true, |t| s.resource_type == t))
                .map(SearchEntry::reference)
                .collect();
            for batch in refs.chunks(batch_size) {
                let query = AbstractQuery::new(Some(include.source_type.as_str()), scope.page_size)
                    .with_filter(Filter::IdSet {
                        param: include.param.clone(),
                        ids: batch.to_vec(),
                    });
                fetched.extend(self.collect(scope, &query).await?.entries);
            }
            return Ok(fetched);
        }

        let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for source in sources.iter().filter(|s| s.resource_type == include.source_type) {
            for reference in reference_values(&source.resource, &include.param) {
                let Some((ty, id)) = split_reference(&reference) else { continue };
                if include.target_type.as_deref().map_or(true, |t| t == ty) {
                    let ids = by_type.entry(ty.to_string()).or_default();
                    if !ids.iter().any(|existing| existing == id) {
                        ids.push(id.to_string());
                    }
                }
            }
        }

        let total: usize = by_type.values().map(Vec::len).sum();
        if total > scope.config.max_reference_ids {
            return Err(BrokerError::TooCostly(format!(
                "include references {} ids, limit {}",
                total, scope.config.max_reference_ids
            )));
        }

        for (resource_type, ids) in &by_type {
            for batch in ids.chunks(batch_size) {
                let query = AbstractQuery::new(Some(resource_type.as_str()), scope.page_size)
                    .with_filter(Filter::IdSet {
                        param: "_id".to_string(),
                        ids: batch.to_vec(),
                    });
                fetched.extend(self.collect(scope, &query).await?.entries);
            }
        }
        Ok(fetched)
    }
}
