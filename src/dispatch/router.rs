//! # Query Router
//!
//! Maps an incoming query plus workload hint to a concrete dispatch queue.
//! An explicit, recognized hint selects the matching live Worker when one
//! exists, otherwise the Lead; anything else defaults to Medium.

use std::sync::Arc;

use super::query::{DispatchQuery, SubmitRequest, WorkloadClass};
use super::queue::DispatchQueue;

/// Build a routable query from a submission, classifying it by hint.
///
/// Cache-class queries pick up their stable cache key here, so repeated
/// identical submissions can be served by a dedicated Cache queue.
pub fn build_query(request: SubmitRequest, hint: Option<&str>) -> DispatchQuery {
    DispatchQuery::new(request, WorkloadClass::from_hint(hint))
}

/// Resolve the queue a query of `class` should land on under `lead`.
pub async fn route(lead: &Arc<DispatchQueue>, class: WorkloadClass) -> Arc<DispatchQueue> {
    match lead.worker_queue(class).await {
        Some(worker) => worker,
        None => lead.clone(),
    }
}
