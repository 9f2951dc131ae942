#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use cx_ast::{ActiveSet, SyntaxError, parse_infix};
use cx_codec::{EncodeError, decode, encode};
use thiserror::Error;

/// Supplier of write-once encoded conditions over the record-id space
/// `[0, max_record_id)`. Implementations take `&self` throughout and must
/// tolerate concurrent reads; independent scans may probe the same source.
pub trait ConditionSource {
    /// Encoded condition bytes for `record_id`, or `None` when the record
    /// has no stored condition.
    fn encoded_condition(&self, record_id: u32) -> Option<&[u8]>;

    /// Exclusive upper bound of the record-id space.
    fn max_record_id(&self) -> u32;
}

/// Forward-only cursor over the records whose stored condition evaluates
/// true against the active set. Matches come out in strictly increasing
/// record-id order; the cursor never rewinds.
#[derive(Debug)]
pub struct MatchScan<'a, S: ConditionSource> {
    source: &'a S,
    active: &'a ActiveSet,
    last: Option<u32>,
    exhausted: bool,
}

impl<'a, S: ConditionSource> MatchScan<'a, S> {
    #[must_use]
    pub fn new(source: &'a S, active: &'a ActiveSet) -> Self {
        Self {
            source,
            active,
            last: None,
            exhausted: false,
        }
    }

    /// First matching record id at or after `target`, clamped so that ids
    /// at or below the last returned match are never revisited. Records
    /// with no stored condition are skipped; so are records whose bytes
    /// fail to decode — one corrupt record must not abort the whole scan.
    pub fn advance(&mut self, target: u32) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        let floor = self.last.map_or(0, |last| last.saturating_add(1));
        for id in target.max(floor)..self.source.max_record_id() {
            let Some(bytes) = self.source.encoded_condition(id) else {
                continue;
            };
            let node = match decode(bytes) {
                Ok(node) => node,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(
                        record_id = id,
                        error = %_err,
                        "skipping record with undecodable condition"
                    );
                    continue;
                }
            };
            if node.evaluate(self.active) {
                self.last = Some(id);
                return Some(id);
            }
        }
        self.exhausted = true;
        None
    }

    /// `advance` past the last returned match.
    pub fn next_match(&mut self) -> Option<u32> {
        let target = self.last.map_or(0, |last| last.saturating_add(1));
        self.advance(target)
    }

    /// Upper bound on remaining work. The condition bytes are opaque to
    /// any secondary index, so this is a linear scan: worst case, the
    /// whole record-id space.
    #[must_use]
    pub fn cost(&self) -> u64 {
        u64::from(self.source.max_record_id())
    }
}

impl<S: ConditionSource> Iterator for MatchScan<'_, S> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.next_match()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// In-memory per-field condition store: the write path parses the canonical
/// infix surface syntax and persists the binary encoding; a parse or
/// capacity failure fails the write and stores nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldStore {
    conditions: BTreeMap<u32, Vec<u8>>,
    max_record_id: u32,
}

impl FieldStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record_id: u32, expression: &str) -> Result<(), StoreError> {
        let node = parse_infix(expression)?;
        let bytes = encode(&node)?;
        self.conditions.insert(record_id, bytes);
        self.grow_record_space(record_id);
        Ok(())
    }

    /// Stores bytes verbatim, bypassing the parser. Lets callers persist
    /// pre-encoded conditions and lets tests plant corrupt records.
    pub fn insert_raw(&mut self, record_id: u32, bytes: Vec<u8>) {
        self.conditions.insert(record_id, bytes);
        self.grow_record_space(record_id);
    }

    /// Widens the record-id space to cover records that carry no
    /// condition of their own. Never shrinks it.
    pub fn reserve_record_space(&mut self, max_record_id: u32) {
        self.max_record_id = self.max_record_id.max(max_record_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn grow_record_space(&mut self, record_id: u32) {
        self.max_record_id = self.max_record_id.max(record_id.saturating_add(1));
    }
}

impl ConditionSource for FieldStore {
    fn encoded_condition(&self, record_id: u32) -> Option<&[u8]> {
        self.conditions.get(&record_id).map(Vec::as_slice)
    }

    fn max_record_id(&self) -> u32 {
        self.max_record_id
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("missing field name")]
    MissingField,
}

/// Query surface consumed from the host: a field naming the per-record
/// condition store plus the comma-separated active identifiers. Equality
/// and hashing follow the field and identifier set, so equal queries can
/// share cached results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionQuery {
    field: String,
    active: ActiveSet,
}

impl ConditionQuery {
    pub fn new(field: impl Into<String>, active_csv: &str) -> Result<Self, QueryError> {
        let field = field.into();
        if field.trim().is_empty() {
            return Err(QueryError::MissingField);
        }
        Ok(Self {
            field,
            active: ActiveSet::from_csv(active_csv),
        })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    #[must_use]
    pub fn scan<'a, S: ConditionSource>(&'a self, source: &'a S) -> MatchScan<'a, S> {
        MatchScan::new(source, &self.active)
    }
}

impl Hash for ConditionQuery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.field.hash(state);
        let mut ids: Vec<&str> = self.active.iter().collect();
        ids.sort_unstable();
        ids.hash(state);
    }
}
