#![forbid(unsafe_code)]

//! Per-record boolean condition expressions for retrieval engines.
//!
//! Records declare a condition over named flags (`A AND (B OR NOT C)`);
//! queries supply the set of flags that are currently true and scan for
//! the records whose condition holds.

pub use cx_ast::{ActiveSet, MAX_DEPTH, Node, SyntaxError, parse_infix, parse_prefix};
pub use cx_codec::{DecodeError, EncodeError, decode, encode, evaluate};
pub use cx_scan::{
    ConditionQuery, ConditionSource, FieldStore, MatchScan, QueryError, StoreError,
};
