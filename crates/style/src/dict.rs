//! The computed-style cache.
//!
//! One [`StyleSystem`] owns every per-node [`StyleDict`], the ref-counted
//! dependency-subscription table and the pending-notification state. All
//! operations are synchronous; re-entrant use is guarded by assertions, not
//! locks.

use std::collections::{HashMap, HashSet};
use std::fmt;

use cps_document::{
    Delivery, DocumentStore, ElementId, EvalContext, EvalError, EventKind, Formula, NodeId,
    SlotId, Value,
};
use log::debug;
use slab::Slab;

use crate::error::StyleError;
use crate::matching::MatchEngine;
use crate::node::{NodeTree, PropertySubscription};

/// Identifier of a [`StyleDict`] inside the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DictId(usize);

impl fmt::Display for DictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Everything resolution needs besides the system itself.
pub struct StyleContext<'a> {
    pub doc: &'a mut DocumentStore,
    pub engine: &'a mut dyn MatchEngine,
    pub tree: &'a dyn NodeTree,
    /// The rule collection nodes are matched against.
    pub sheet: ElementId,
}

/// One coalesced change notification, produced by [`StyleSystem::flush`].
#[derive(Debug, Clone, PartialEq)]
pub struct StyleChange {
    pub node: NodeId,
    /// The accumulated set of changed keys, sorted.
    pub keys: Vec<String>,
}

/// Canonical subscription id: the external signal a cache entry can depend
/// on, derived from `(item identity, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SubKey {
    /// A whitelisted attribute of a tree node.
    NodeProp(NodeId, String),
    /// A resolved key of a style dict.
    DictKey(DictId, String),
}

/// Shared, ref-counted subscription entry.
struct SubEntry {
    refcount: u32,
    /// Cache entries depending on this signal.
    dependents: Vec<(DictId, String)>,
    /// Tree-side handle, for `NodeProp` subscriptions.
    handle: Option<PropertySubscription>,
}

#[derive(Clone)]
enum CacheEntry {
    Value(Value),
    /// Errors are cached too, so a broken formula is not re-run on every
    /// lookup. Recursion errors never end up here.
    Error(StyleError),
}

/// One slot of the assembled cascade: index 0 is the node's own property
/// dict, higher indices are matched rules, most specific first.
#[derive(Clone, PartialEq, Eq)]
struct RuleSlot {
    dict: ElementId,
    rule: Option<ElementId>,
}

/// Per-node computed style state.
pub struct StyleDict {
    node: NodeId,
    /// Assembled cascade, `None` until (re)built. Assembly is expensive and
    /// separated from indexing, which is cheap.
    rules: Option<Vec<RuleSlot>>,
    /// Key -> winning rule index (lowest index defining the key).
    index: HashMap<String, usize>,
    cache: HashMap<String, CacheEntry>,
    /// Outgoing dependency edges per cached key.
    deps: HashMap<String, Vec<SubKey>>,
    /// Keys currently being resolved, for recursion detection.
    resolving: Vec<String>,
    resolving_set: HashSet<String>,
    /// Keys currently being invalidated, for re-entrancy assertions.
    invalidating: HashSet<String>,
    /// Document subscription slots, one per rule slot.
    slots: Vec<SlotId>,
}

impl StyleDict {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            rules: None,
            index: HashMap::new(),
            cache: HashMap::new(),
            deps: HashMap::new(),
            resolving: Vec::new(),
            resolving_set: HashSet::new(),
            invalidating: HashSet::new(),
            slots: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

const DICT_EVENTS: u8 =
    EventKind::Add.mask() | EventKind::Update.mask() | EventKind::Delete.mask();

/// Owns every style dict and the dependency graph between them.
#[derive(Default)]
pub struct StyleSystem {
    dicts: Slab<StyleDict>,
    by_node: HashMap<NodeId, DictId>,
    subs: HashMap<SubKey, SubEntry>,
    /// Document slot -> (dict, rule index) routing for drained deliveries.
    doc_slots: HashMap<SlotId, (DictId, usize)>,
    /// Debounced notification state: one pending key set per dict,
    /// re-armed (not re-queued) by triggers within the same batch.
    pending: HashMap<DictId, HashSet<String>>,
}

impl StyleSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dict for a node, if one has been created.
    pub fn dict_id(&self, node: NodeId) -> Option<DictId> {
        self.by_node.get(&node).copied()
    }

    /// Every node currently holding a style dict.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.by_node.keys().copied().collect()
    }

    fn ensure_dict(&mut self, node: NodeId) -> DictId {
        if let Some(&dict) = self.by_node.get(&node) {
            return dict;
        }
        let dict = DictId(self.dicts.insert(StyleDict::new(node)));
        self.by_node.insert(node, dict);
        debug!("created style dict {dict} for node {node}");
        dict
    }

    /// Resolve a property for a node. Values and non-recursion errors are
    /// cached; see the crate docs for the full resolution order.
    pub fn get(
        &mut self,
        cx: &mut StyleContext<'_>,
        node: NodeId,
        key: &str,
    ) -> Result<Value, StyleError> {
        let dict = self.ensure_dict(node);
        self.ensure_rules(cx, dict);

        let state = &self.dicts[dict.0];
        assert!(
            !state.invalidating.contains(key),
            "read of key `{key}` while its invalidation is in progress"
        );
        if let Some(entry) = state.cache.get(key) {
            return match entry {
                CacheEntry::Value(value) => Ok(value.clone()),
                CacheEntry::Error(error) => Err(error.clone()),
            };
        }
        if state.resolving_set.contains(key) {
            return Err(StyleError::Recursion {
                key: key.to_string(),
            });
        }

        {
            let state = &mut self.dicts[dict.0];
            state.resolving.push(key.to_string());
            state.resolving_set.insert(key.to_string());
        }
        let mut deps = Vec::new();
        let result = self.resolve(cx, dict, node, key, &mut deps);
        {
            // Popped on every exit path; resolve() itself never early-returns
            // around this.
            let state = &mut self.dicts[dict.0];
            let popped = state.resolving.pop();
            debug_assert_eq!(popped.as_deref(), Some(key));
            state.resolving_set.remove(key);
        }

        match &result {
            Err(error) if error.is_recursion() => {
                // An artifact of the current call stack, not of the key.
            }
            Ok(value) => {
                self.install_deps(cx.tree, dict, key, deps);
                self.dicts[dict.0]
                    .cache
                    .insert(key.to_string(), CacheEntry::Value(value.clone()));
            }
            Err(error) => {
                self.install_deps(cx.tree, dict, key, deps);
                self.dicts[dict.0]
                    .cache
                    .insert(key.to_string(), CacheEntry::Error(error.clone()));
            }
        }
        result
    }

    /// Like `get`, but returns `default` for any lookup failure. Invariant
    /// violations still panic.
    pub fn get_or(
        &mut self,
        cx: &mut StyleContext<'_>,
        node: NodeId,
        key: &str,
        default: Value,
    ) -> Value {
        self.get(cx, node, key).unwrap_or(default)
    }

    fn resolve(
        &mut self,
        cx: &mut StyleContext<'_>,
        dict: DictId,
        node: NodeId,
        key: &str,
        deps: &mut Vec<SubKey>,
    ) -> Result<Value, StyleError> {
        // 1. `this` is the owning node and cannot be shadowed by any rule.
        if key == "this" {
            return Ok(Value::Node(node));
        }

        // 2. A winner in the index: evaluate its formula.
        if let Some(winner) = self.dicts[dict.0].index.get(key).copied() {
            let slot_dict = self.dicts[dict.0].rules.as_ref().expect("rules assembled")[winner].dict;
            let formula = cx
                .doc
                .dict_get(slot_dict, key)
                .unwrap_or_else(|| {
                    panic!("index names `{key}` at rule {winner} but the dict lacks it")
                })
                .value()
                .formula()
                .clone();
            let value = self.evaluate(cx, dict, node, key, &formula, deps)?;
            return cx
                .tree
                .node(node)
                .validate(key, value)
                .map_err(|message| StyleError::key(key, vec![message]));
        }

        // 3. Fall back to the node's whitelisted capability surface.
        let node_ref = cx.tree.node(node);
        if node_ref.cps_has(key) {
            deps.push(SubKey::NodeProp(node, key.to_string()));
            return Ok(node_ref.cps_get(key).expect("cps_has was true"));
        }

        // 4. Nothing defines the key.
        Err(StyleError::key(
            key,
            vec![format!("key not found on {}", node_ref.particulars())],
        ))
    }

    fn evaluate(
        &mut self,
        cx: &mut StyleContext<'_>,
        dict: DictId,
        node: NodeId,
        key: &str,
        formula: &Formula,
        deps: &mut Vec<SubKey>,
    ) -> Result<Value, StyleError> {
        let mut evaluator = Evaluator {
            system: self,
            cx,
            node,
            dict,
            deps,
        };
        formula.eval(&mut evaluator).map_err(|error| match error {
            // Recursion passes through untouched; everything else collapses
            // into this key's error chain.
            EvalError::Read(inner) if inner.is_recursion() => inner,
            EvalError::Read(StyleError::Key {
                key: inner_key,
                chain,
            }) => {
                let mut messages = vec![format!("while reading `{inner_key}`")];
                messages.extend(chain);
                StyleError::key(key, messages)
            }
            EvalError::Read(inner) => StyleError::key(key, vec![inner.to_string()]),
            EvalError::Type(message) => StyleError::key(key, vec![message]),
        })
    }

    // ------------------------------------------------------------------
    // Cascade assembly and indexing
    // ------------------------------------------------------------------

    fn ensure_rules(&mut self, cx: &mut StyleContext<'_>, dict: DictId) {
        if self.dicts[dict.0].rules.is_some() {
            return;
        }
        let node = self.dicts[dict.0].node;
        let slots = self.assemble(cx, node);
        self.install_rules(cx.doc, dict, slots);
    }

    /// Build the cascade list: the node's own properties first, then the
    /// engine's matches in cascade order.
    fn assemble(&mut self, cx: &mut StyleContext<'_>, node: NodeId) -> Vec<RuleSlot> {
        let own = cx.tree.node(node).own_properties();
        let mut slots = vec![RuleSlot {
            dict: own,
            rule: None,
        }];
        for matched in cx.engine.matching_rules(cx.doc, cx.sheet, cx.tree, node) {
            slots.push(RuleSlot {
                dict: cx.doc.rule_dict(matched.rule),
                rule: Some(matched.rule),
            });
        }
        slots
    }

    /// Subscribe to every slot's dict and build the key-to-winner index.
    fn install_rules(&mut self, doc: &mut DocumentStore, dict: DictId, slots: Vec<RuleSlot>) {
        let mut index = HashMap::new();
        for (position, slot) in slots.iter().enumerate() {
            let doc_slot = doc.subscribe(slot.dict, DICT_EVENTS);
            self.doc_slots.insert(doc_slot, (dict, position));
            self.dicts[dict.0].slots.push(doc_slot);
            for property in doc.dict_properties(slot.dict) {
                index.entry(property.name().to_string()).or_insert(position);
            }
        }
        let state = &mut self.dicts[dict.0];
        state.index = index;
        state.rules = Some(slots);
    }

    fn teardown_rules(&mut self, doc: &mut DocumentStore, dict: DictId) {
        let slots = std::mem::take(&mut self.dicts[dict.0].slots);
        for slot in slots {
            doc.unsubscribe(slot);
            self.doc_slots.remove(&slot);
        }
        let state = &mut self.dicts[dict.0];
        state.rules = None;
        state.index.clear();
    }

    /// Cheap refresh: drop the assembled rule list and rebuild (and fully
    /// reindex) lazily on next access. Every cached key is invalidated.
    pub fn invalidate_rules(
        &mut self,
        doc: &mut DocumentStore,
        tree: &dyn NodeTree,
        node: NodeId,
    ) {
        let Some(&dict) = self.by_node.get(&node) else {
            return;
        };
        self.invalidate_all_keys(tree, dict);
        self.teardown_rules(doc, dict);
    }

    /// Eager refresh: re-fetch the matching rules and only tear down and
    /// rebuild when rule identity actually changed.
    pub fn check_rules(&mut self, cx: &mut StyleContext<'_>, node: NodeId) {
        let Some(&dict) = self.by_node.get(&node) else {
            return;
        };
        if self.dicts[dict.0].rules.is_none() {
            return;
        }
        let fresh = self.assemble(cx, node);
        if self.dicts[dict.0].rules.as_ref() == Some(&fresh) {
            return;
        }
        debug!("rule set changed for {dict}, rebuilding index");
        self.invalidate_all_keys(cx.tree, dict);
        self.teardown_rules(cx.doc, dict);
        self.install_rules(cx.doc, dict, fresh);
    }

    fn invalidate_all_keys(&mut self, tree: &dyn NodeTree, dict: DictId) {
        let keys: Vec<String> = self.dicts[dict.0].cache.keys().cloned().collect();
        for key in keys {
            self.invalidate_key(tree, dict, &key);
        }
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Remove a cache entry, tear down its now-unused dependency
    /// subscriptions, notify dependants recursively, and arm the pending
    /// change notification. Non-re-entrant per key.
    fn invalidate_key(&mut self, tree: &dyn NodeTree, dict: DictId, key: &str) {
        let Some(state) = self.dicts.get_mut(dict.0) else {
            return;
        };
        assert!(
            !state.invalidating.contains(key),
            "re-entrant invalidation of key `{key}`"
        );
        state.invalidating.insert(key.to_string());
        state.cache.remove(key);
        self.release_deps(tree, dict, key);
        self.pending
            .entry(dict)
            .or_default()
            .insert(key.to_string());

        let signal = SubKey::DictKey(dict, key.to_string());
        let dependents: Vec<(DictId, String)> = self
            .subs
            .get(&signal)
            .map(|entry| entry.dependents.clone())
            .unwrap_or_default();
        for (dependent_dict, dependent_key) in dependents {
            self.invalidate_key(tree, dependent_dict, &dependent_key);
        }

        self.dicts[dict.0].invalidating.remove(key);
    }

    fn install_deps(&mut self, tree: &dyn NodeTree, dict: DictId, key: &str, deps: Vec<SubKey>) {
        let mut installed: Vec<SubKey> = Vec::new();
        for sub in deps {
            if installed.contains(&sub) {
                continue;
            }
            let entry = self.subs.entry(sub.clone()).or_insert_with(|| SubEntry {
                refcount: 0,
                dependents: Vec::new(),
                handle: None,
            });
            entry.refcount += 1;
            entry.dependents.push((dict, key.to_string()));
            if entry.handle.is_none() {
                if let SubKey::NodeProp(node, node_key) = &sub {
                    entry.handle = Some(tree.on_property_change(*node, node_key));
                }
            }
            installed.push(sub);
        }
        self.dicts[dict.0].deps.insert(key.to_string(), installed);
    }

    fn release_deps(&mut self, tree: &dyn NodeTree, dict: DictId, key: &str) {
        let deps = self.dicts[dict.0].deps.remove(key).unwrap_or_default();
        for sub in deps {
            let entry = self
                .subs
                .get_mut(&sub)
                .expect("released dependency has no subscription entry");
            entry.refcount -= 1;
            entry
                .dependents
                .retain(|(d, k)| !(*d == dict && k == key));
            if entry.refcount == 0 {
                let entry = self.subs.remove(&sub).expect("entry present");
                if let (SubKey::NodeProp(node, _), Some(handle)) = (&sub, entry.handle) {
                    tree.off_property_change(*node, handle);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Change intake
    // ------------------------------------------------------------------

    /// A whitelisted node attribute changed; invalidate everything that read
    /// it.
    pub fn node_property_changed(&mut self, tree: &dyn NodeTree, node: NodeId, key: &str) {
        let signal = SubKey::NodeProp(node, key.to_string());
        let dependents: Vec<(DictId, String)> = self
            .subs
            .get(&signal)
            .map(|entry| entry.dependents.clone())
            .unwrap_or_default();
        for (dict, dependent_key) in dependents {
            self.invalidate_key(tree, dict, &dependent_key);
        }
    }

    /// Route a drained document delivery into the key-to-winner index.
    /// Returns whether the delivery belonged to this system.
    pub fn handle_delivery(
        &mut self,
        doc: &mut DocumentStore,
        tree: &dyn NodeTree,
        delivery: &Delivery,
    ) -> bool {
        let Some(&(dict, position)) = self.doc_slots.get(&delivery.slot) else {
            return false;
        };
        let keys: Vec<String> = delivery.event.keys.iter().cloned().collect();
        for key in keys {
            match delivery.event.kind {
                EventKind::Add => self.key_defined(doc, tree, dict, position, &key),
                EventKind::Update => {
                    if self.dicts[dict.0].index.get(&key) == Some(&position) {
                        self.invalidate_key(tree, dict, &key);
                    }
                }
                EventKind::Delete => self.key_retracted(doc, tree, dict, position, &key),
                _ => {}
            }
        }
        true
    }

    /// A rule dict newly defines `key`.
    fn key_defined(
        &mut self,
        _doc: &mut DocumentStore,
        tree: &dyn NodeTree,
        dict: DictId,
        position: usize,
        key: &str,
    ) {
        match self.dicts[dict.0].index.get(key).copied() {
            None => {
                self.dicts[dict.0].index.insert(key.to_string(), position);
                self.invalidate_key(tree, dict, key);
            }
            Some(winner) if position < winner => {
                self.dicts[dict.0].index.insert(key.to_string(), position);
                self.invalidate_key(tree, dict, key);
            }
            Some(winner) if position == winner => {
                panic!(
                    "key `{key}` defined twice at winning rule index {winner} \
                     without an intervening removal"
                );
            }
            Some(_) => {
                // A lower-precedence definition; the winner is unaffected.
            }
        }
    }

    /// The winning rule dict retracted `key`; find the next winner.
    fn key_retracted(
        &mut self,
        doc: &mut DocumentStore,
        tree: &dyn NodeTree,
        dict: DictId,
        position: usize,
        key: &str,
    ) {
        if self.dicts[dict.0].index.get(key) != Some(&position) {
            return;
        }
        let slots = self.dicts[dict.0].rules.clone().expect("rules assembled");
        let next = slots
            .iter()
            .enumerate()
            .skip(position)
            .find(|(_, slot)| doc.dict_has(slot.dict, key))
            .map(|(i, _)| i);
        match next {
            Some(winner) => {
                self.dicts[dict.0].index.insert(key.to_string(), winner);
            }
            None => {
                self.dicts[dict.0].index.remove(key);
            }
        }
        self.invalidate_key(tree, dict, key);
    }

    // ------------------------------------------------------------------
    // Lifecycle and notification
    // ------------------------------------------------------------------

    /// The node left the tree: release every subscription and drop its dict.
    pub fn node_removed(&mut self, doc: &mut DocumentStore, tree: &dyn NodeTree, node: NodeId) {
        let Some(dict) = self.by_node.remove(&node) else {
            return;
        };
        self.invalidate_all_keys(tree, dict);
        self.teardown_rules(doc, dict);
        self.pending.remove(&dict);
        self.dicts.remove(dict.0);
        debug!("destroyed style dict {dict} for node {node}");
    }

    /// Fire the coalesced change notifications accumulated since the last
    /// flush. Call at the end of a batch of edits.
    pub fn flush(&mut self) -> Vec<StyleChange> {
        let pending = std::mem::take(&mut self.pending);
        let mut changes: Vec<StyleChange> = pending
            .into_iter()
            .filter_map(|(dict, keys)| {
                let state = self.dicts.get(dict.0)?;
                let mut keys: Vec<String> = keys.into_iter().collect();
                keys.sort();
                Some(StyleChange {
                    node: state.node,
                    keys,
                })
            })
            .collect();
        changes.sort_by_key(|change| change.node);
        changes
    }

    #[cfg(test)]
    fn cached(&self, node: NodeId, key: &str) -> bool {
        self.by_node
            .get(&node)
            .and_then(|dict| self.dicts.get(dict.0))
            .is_some_and(|state| state.cache.contains_key(key))
    }
}

/// Evaluation context wired into the cache: reads resolve through the same
/// dict and are recorded as dependency edges.
struct Evaluator<'a, 'x> {
    system: &'a mut StyleSystem,
    cx: &'a mut StyleContext<'x>,
    node: NodeId,
    dict: DictId,
    deps: &'a mut Vec<SubKey>,
}

impl EvalContext for Evaluator<'_, '_> {
    type Error = StyleError;

    fn read(&mut self, key: &str) -> Result<Value, StyleError> {
        self.deps.push(SubKey::DictKey(self.dict, key.to_string()));
        self.system.get(self.cx, self.node, key)
    }
}
