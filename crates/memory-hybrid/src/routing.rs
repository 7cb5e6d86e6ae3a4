//! Routing table: which backend(s) a query is dispatched to.
//!
//! Evaluated in order, first match wins:
//!
//! | Query shape                                   | Route                     |
//! |-----------------------------------------------|---------------------------|
//! | declared kind                                 | as declared               |
//! | exact key or key prefix, nothing to embed     | structured                |
//! | text or vector, no structured constraints     | semantic                  |
//! | text or vector plus structured constraints    | hybrid (combine strategy) |
//! | anything else                                 | structured                |
//!
//! A namespace on its own is a scope, not a constraint: a namespaced semantic
//! query stays on the vector index, which filters by namespace during traversal.

use hybridmem_protocols::{Backend, CombineStrategy, MemoryError, Query, QueryKind, Route};

pub fn route(query: &Query, default_combine: CombineStrategy) -> Result<Route, MemoryError> {
    let combine = query.combine.unwrap_or(default_combine);
    let semantic = query.semantic.is_some();
    let filter = &query.structured;

    match query.kind {
        Some(QueryKind::Exact) => {
            if filter.key.is_none() {
                return Err(MemoryError::validation(
                    Backend::Router,
                    "route",
                    "exact query needs a key",
                ));
            }
            Ok(Route::Structured)
        }
        Some(QueryKind::Prefix) => {
            if filter.key_prefix.is_none() {
                return Err(MemoryError::validation(
                    Backend::Router,
                    "route",
                    "prefix query needs a key prefix",
                ));
            }
            Ok(Route::Structured)
        }
        Some(QueryKind::Semantic) | Some(QueryKind::Hybrid) if !semantic => Err(MemoryError::validation(
            Backend::Router,
            "route",
            "semantic and hybrid queries need text or a vector",
        )),
        Some(QueryKind::Semantic) => Ok(Route::Semantic),
        Some(QueryKind::Hybrid) => Ok(Route::Hybrid(combine)),
        None if filter.has_key_selector() && !semantic => Ok(Route::Structured),
        None if semantic && !filter.has_constraints() => Ok(Route::Semantic),
        None if semantic => Ok(Route::Hybrid(combine)),
        None => Ok(Route::Structured),
    }
}
