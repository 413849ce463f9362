//! Range-query manager: one scan surface over any engine.
//!
//! Ordered engines serve range and prefix queries through their native
//! scan primitives; unordered engines fall back to a snapshot iterator
//! plus filter and sort. When a deadline is set, ordered engines take
//! the cursor path too — the native scan materializes the whole match
//! set and could never stop partway. Prefix queries without a native
//! primitive compute the exclusive upper bound by incrementing the last
//! non-`0xFF` byte of the prefix (an all-`0xFF` prefix simply has no
//! upper bound).
//!
//! Options cover `limit`, `offset`, `reverse`, `keys_only`,
//! `count_only`, and a soft `timeout` — on expiry the partial result is
//! returned with the `timed_out` flag set rather than an error.
//! Pagination: `next_start_key` is the last emitted key and `has_more`
//! says whether anything matched beyond the returned page; feed the key
//! back as an exclusive lower bound to continue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::engine::{EngineError, KeyRange, KvPair, StorageEngine, prefix_upper_bound};

/// Scan options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum pairs returned; 0 = unlimited.
    pub limit: usize,
    /// Matching pairs skipped before the first returned one.
    pub offset: usize,
    /// Emit in descending key order.
    pub reverse: bool,
    /// Strip values from the result pairs.
    pub keys_only: bool,
    /// Return only the match count; `pairs` stays empty.
    pub count_only: bool,
    /// Soft deadline; expiry returns the partial result flagged.
    pub timeout: Option<Duration>,
}

/// Result of a range or prefix query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// The returned page (empty for `count_only`).
    pub pairs: Vec<KvPair>,
    /// Matches counted (all matches for `count_only`, else page size).
    pub count: u64,
    /// Last emitted key — the resume cursor for the next page.
    pub next_start_key: Option<Vec<u8>>,
    /// Whether matches remained beyond this page.
    pub has_more: bool,
    /// The soft deadline expired and the result is partial.
    pub timed_out: bool,
}

/// Uniform scan manager over a shared engine handle.
pub struct RangeQueryManager {
    engine: Arc<dyn StorageEngine>,
}

impl RangeQueryManager {
    /// Wraps an engine.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    /// Runs a range query with the given options.
    pub fn range_query(
        &self,
        range: &KeyRange,
        options: &QueryOptions,
    ) -> Result<QueryResult, EngineError> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let ordered = self.engine.ordered();

        // Gather the ordered match set. The native scan is only usable
        // without a deadline: it returns all-or-nothing, so a timeout
        // could never yield the partial result the contract promises.
        let mut matches: Vec<KvPair> = if ordered && deadline.is_none() {
            self.engine.range_scan(range, 0)?
        } else {
            // Deadline-checked cursor: filter linearly, stopping with
            // whatever was gathered once the deadline passes.
            let mut collected = Vec::new();
            for (index, pair) in self.engine.iter()?.enumerate() {
                if index % 256 == 0 {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            timed_out = true;
                            break;
                        }
                    }
                }
                if ordered {
                    // Ascending cursor: past the upper bound nothing
                    // further can match.
                    if let Some(end) = &range.end {
                        match pair.key.as_slice().cmp(end.as_slice()) {
                            std::cmp::Ordering::Greater => break,
                            std::cmp::Ordering::Equal if !range.end_inclusive => break,
                            _ => {}
                        }
                    }
                }
                if range.contains(&pair.key) {
                    collected.push(pair);
                }
            }
            if !ordered {
                collected.sort_by(|a, b| a.key.cmp(&b.key));
            }
            collected
        };

        let total_matches = matches.len() as u64;
        if options.count_only {
            return Ok(QueryResult {
                pairs: Vec::new(),
                count: total_matches,
                next_start_key: None,
                has_more: false,
                timed_out,
            });
        }

        if options.reverse {
            matches.reverse();
        }

        let skipped = options.offset.min(matches.len());
        let remaining = matches.len() - skipped;
        let take = if options.limit == 0 {
            remaining
        } else {
            options.limit.min(remaining)
        };
        let has_more = remaining > take;
        let mut page: Vec<KvPair> = matches.into_iter().skip(skipped).take(take).collect();
        let next_start_key = page.last().map(|pair| pair.key.clone());

        if options.keys_only {
            for pair in &mut page {
                pair.value.clear();
            }
        }

        trace!(
            matched = total_matches,
            returned = page.len(),
            has_more,
            timed_out,
            "range query served"
        );
        Ok(QueryResult {
            count: page.len() as u64,
            pairs: page,
            next_start_key,
            has_more,
            timed_out,
        })
    }

    /// Runs a prefix query with the given options.
    pub fn prefix_query(
        &self,
        prefix: &[u8],
        options: &QueryOptions,
    ) -> Result<QueryResult, EngineError> {
        let range = KeyRange {
            start: Some(prefix.to_vec()),
            end: prefix_upper_bound(prefix),
            start_inclusive: true,
            end_inclusive: false,
        };
        if self.engine.ordered() || options.timeout.is_some() {
            // The range path also owns the deadline-checked cursor, so a
            // timed prefix query gets partial-result semantics too.
            return self.range_query(&range, options);
        }
        // Unordered engines filter by literal prefix instead of paying
        // the range bound at all.
        let mut matches = self.engine.prefix_scan(prefix)?;
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        self.paginate_prefiltered(matches, options)
    }

    fn paginate_prefiltered(
        &self,
        mut matches: Vec<KvPair>,
        options: &QueryOptions,
    ) -> Result<QueryResult, EngineError> {
        let total = matches.len() as u64;
        if options.count_only {
            return Ok(QueryResult {
                count: total,
                ..QueryResult::default()
            });
        }
        if options.reverse {
            matches.reverse();
        }
        let skipped = options.offset.min(matches.len());
        let remaining = matches.len() - skipped;
        let take = if options.limit == 0 {
            remaining
        } else {
            options.limit.min(remaining)
        };
        let has_more = remaining > take;
        let mut page: Vec<KvPair> = matches.into_iter().skip(skipped).take(take).collect();
        let next_start_key = page.last().map(|pair| pair.key.clone());
        if options.keys_only {
            for pair in &mut page {
                pair.value.clear();
            }
        }
        Ok(QueryResult {
            count: page.len() as u64,
            pairs: page,
            next_start_key,
            has_more,
            timed_out: false,
        })
    }
}
