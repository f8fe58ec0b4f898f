//! The computed-style cache: per-node cascade assembly, formula resolution
//! with dependency tracking, recursion detection, and debounced
//! invalidation.
//!
//! Resolution order for `get(key)`:
//! 1. `this` — the owning node, unshadowable;
//! 2. the key's winning rule formula, evaluated with every external read
//!    recorded as a dependency and the result passed through the node's
//!    validator;
//! 3. the node's whitelisted attribute surface;
//! 4. a key error.

pub mod dict;
pub mod error;
pub mod matching;
pub mod node;

pub use dict::{DictId, StyleChange, StyleContext, StyleDict, StyleSystem};
pub use error::StyleError;
pub use matching::{CompiledMatcher, MatchEngine, MatchedRule, ReferenceMatcher};
pub use node::{BasicNode, BasicTree, NodeTree, PropertySubscription, StyleableNode};
