//! Per-element cache of built control flows
//!
//! Flows are cached per syntax node. Each node keeps a small append-only
//! list of entries, one per (policy, options, generation) combination that
//! was requested for it. A build also registers views for every nested
//! block, so later requests for those blocks are answered without a second
//! walk.
//!
//! A request carries the caller's current modification generation. The
//! first request for a newer generation evicts every entry built for an
//! older one. A build that finishes after its generation went stale is
//! returned but not stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, debug_span, trace};
use tree_sitter::Node;

use super::builder::build_flow;
use super::cancel::Cancellation;
use super::flow::ControlFlow;
use super::options::FlowOptions;
use super::policy::FlowPolicy;
use crate::errors::Result;
use crate::syntax::SyntaxRef;

/// Monotonic counter callers bump whenever the underlying source changes.
#[derive(Debug, Default)]
pub struct ModificationCounter {
    value: AtomicU64,
}

impl ModificationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Mark every cached flow stale. Returns the new generation.
    pub fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug)]
struct CacheEntry {
    policy: &'static str,
    options: FlowOptions,
    generation: u64,
    flow: ControlFlow,
}

impl CacheEntry {
    fn answers(&self, policy: &str, options: FlowOptions, generation: u64) -> bool {
        self.policy == policy && self.options == options && self.generation == generation
    }
}

type EntryList = Arc<boxcar::Vec<CacheEntry>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub nodes: usize,
}

/// Thread-safe source of control flows.
///
/// Safe to share between threads; two threads missing on the same node
/// may both build, and the second result is dropped in favor of the first.
#[derive(Default)]
pub struct FlowFactory {
    cache: DashMap<SyntaxRef, EntryList>,
    latest_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FlowFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached flow of `node`, building it on a miss.
    pub fn get_control_flow(
        &self,
        node: Node<'_>,
        source: &[u8],
        policy: &dyn FlowPolicy,
        options: FlowOptions,
        generation: u64,
        cancellation: &Cancellation,
    ) -> Result<ControlFlow> {
        let key = SyntaxRef::of(node);
        let _span = debug_span!("flow_lookup", node = %key, generation).entered();
        if let Some(flow) = self.cached(&key, policy, options, generation) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(node = %key, "Control flow cache hit");
            return Ok(flow);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let flow = build_flow(node, source, policy, options, cancellation)?;
        let flow = self.store(key, policy.key(), options, generation, flow);
        let mut registered = 0;
        for view in flow.sub_ranges() {
            self.store(view.root(), policy.key(), options, generation, view);
            registered += 1;
        }
        debug!(node = %key, generation, sub_ranges = registered, "Cached control flow");
        Ok(flow)
    }

    /// Look up a flow without building.
    ///
    /// A request without constant folding may be answered by a folded
    /// flow in which folding never triggered: the two are identical.
    pub fn cached(
        &self,
        node: &SyntaxRef,
        policy: &dyn FlowPolicy,
        options: FlowOptions,
        generation: u64,
    ) -> Option<ControlFlow> {
        self.observe_generation(generation);
        let entries = Arc::clone(self.cache.get(node)?.value());
        let policy = policy.key();
        let mut equivalent = None;
        for (_, entry) in entries.iter() {
            if entry.answers(policy, options, generation) {
                return Some(entry.flow.clone());
            }
            if !options.fold_constant_conditions
                && entry.answers(policy, options.with_folding(true), generation)
                && !entry.flow.constant_condition_occurred()
            {
                equivalent = Some(entry.flow.clone());
            }
        }
        equivalent
    }

    /// Evict everything older than `generation` the first time it is seen.
    fn observe_generation(&self, generation: u64) {
        let previous = self.latest_generation.fetch_max(generation, Ordering::AcqRel);
        if generation <= previous {
            return;
        }
        let before = self.cache.len();
        self.cache
            .retain(|_, entries| entries.iter().any(|(_, e)| e.generation >= generation));
        debug!(
            generation,
            evicted = before.saturating_sub(self.cache.len()),
            "Evicted stale control flows"
        );
    }

    fn store(
        &self,
        node: SyntaxRef,
        policy: &'static str,
        options: FlowOptions,
        generation: u64,
        flow: ControlFlow,
    ) -> ControlFlow {
        self.observe_generation(generation);
        if generation < self.latest_generation.load(Ordering::Acquire) {
            trace!(node = %node, generation, "Not caching a stale build");
            return flow;
        }
        let entries = {
            let mut slot = self
                .cache
                .entry(node)
                .or_insert_with(|| Arc::new(boxcar::Vec::new()));
            let stale = slot.count() > 0 && slot.iter().all(|(_, e)| e.generation < generation);
            if stale {
                *slot = Arc::new(boxcar::Vec::new());
            }
            Arc::clone(slot.value())
        };
        if let Some((_, existing)) = entries
            .iter()
            .find(|(_, e)| e.answers(policy, options, generation))
        {
            return existing.flow.clone();
        }
        entries.push(CacheEntry {
            policy,
            options,
            generation,
            flow: flow.clone(),
        });
        flow
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            nodes: self.cache.len(),
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}
