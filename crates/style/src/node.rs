//! The capability contract consumed from the styleable-node tree, plus a
//! minimal in-memory implementation used by hosts and tests.
//!
//! The tree itself is external; the style system only sees node identities,
//! a whitelisted attribute surface, per-node validation, and property-change
//! subscription handles.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use cps_document::{ElementId, NodeId, Value};

/// Opaque handle for a property-change subscription on the node tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySubscription(pub u64);

/// What the style system needs from one styleable node.
pub trait StyleableNode {
    fn id(&self) -> NodeId;

    /// The node's own property dict in the document store. Always present:
    /// it is cascade index 0.
    fn own_properties(&self) -> ElementId;

    /// Whitelisted generic attribute access. Returns `None` for keys outside
    /// the whitelist.
    fn cps_get(&self, key: &str) -> Option<Value>;

    fn cps_has(&self, key: &str) -> bool {
        self.cps_get(key).is_some()
    }

    /// Validate (and possibly coerce) a resolved value for this node.
    fn validate(&self, key: &str, value: Value) -> Result<Value, String> {
        let _ = key;
        Ok(value)
    }

    /// Human-readable path of the node, for diagnostics.
    fn particulars(&self) -> String;
}

/// Node lookup plus subscription management for the whole tree.
pub trait NodeTree {
    fn node(&self, id: NodeId) -> &dyn StyleableNode;

    /// Register interest in changes of `(node, key)`.
    fn on_property_change(&self, node: NodeId, key: &str) -> PropertySubscription;

    /// Release a subscription handle obtained from `on_property_change`.
    fn off_property_change(&self, node: NodeId, subscription: PropertySubscription);
}

/// A plain in-memory styleable node: type/id/class identity, an attribute
/// map as the whitelisted surface, and an own-property dict.
pub struct BasicNode {
    id: NodeId,
    type_name: String,
    ident: Option<String>,
    classes: Vec<String>,
    /// Position among siblings, exposed as the `i` attribute.
    index: usize,
    attributes: HashMap<String, Value>,
    own_properties: ElementId,
    validators: HashMap<String, fn(Value) -> Result<Value, String>>,
}

impl BasicNode {
    pub fn new(id: NodeId, type_name: impl Into<String>, own_properties: ElementId) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            ident: None,
            classes: Vec::new(),
            index: 0,
            attributes: HashMap::new(),
            own_properties,
            validators: HashMap::new(),
        }
    }

    pub fn with_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = Some(ident.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Install a validator for one key.
    pub fn with_validator(
        mut self,
        key: impl Into<String>,
        validator: fn(Value) -> Result<Value, String>,
    ) -> Self {
        self.validators.insert(key.into(), validator);
        self
    }

    /// Change an attribute after construction. The caller is responsible for
    /// telling the style system via `node_property_changed`.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Change the sibling index after construction; same caveat as
    /// `set_attribute`.
    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

impl StyleableNode for BasicNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn own_properties(&self) -> ElementId {
        self.own_properties
    }

    fn cps_get(&self, key: &str) -> Option<Value> {
        match key {
            "type" => Some(Value::Str(self.type_name.clone())),
            "id" => self.ident.clone().map(Value::Str),
            "class" => Some(Value::Str(self.classes.join(" "))),
            "i" => Some(Value::Number(self.index as f64)),
            _ => self.attributes.get(key).cloned(),
        }
    }

    fn validate(&self, key: &str, value: Value) -> Result<Value, String> {
        match self.validators.get(key) {
            Some(validator) => validator(value),
            None => Ok(value),
        }
    }

    fn particulars(&self) -> String {
        let mut out = self.type_name.clone();
        if let Some(ident) = &self.ident {
            out.push('#');
            out.push_str(ident);
        }
        for class in &self.classes {
            out.push('.');
            out.push_str(class);
        }
        out
    }
}

/// A flat collection of [`BasicNode`]s with subscription bookkeeping.
#[derive(Default)]
pub struct BasicTree {
    nodes: HashMap<NodeId, BasicNode>,
    next_handle: Cell<u64>,
    /// Live subscriptions: handle -> (node, key).
    subscriptions: RefCell<HashMap<u64, (NodeId, String)>>,
}

impl BasicTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: BasicNode) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BasicNode {
        self.nodes.get_mut(&id).expect("unknown node")
    }

    /// Keys currently watched on a node, for tests asserting teardown.
    pub fn watched_keys(&self, id: NodeId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subscriptions
            .borrow()
            .values()
            .filter(|(n, _)| *n == id)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl NodeTree for BasicTree {
    fn node(&self, id: NodeId) -> &dyn StyleableNode {
        self.nodes.get(&id).expect("unknown node")
    }

    fn on_property_change(&self, node: NodeId, key: &str) -> PropertySubscription {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        self.subscriptions
            .borrow_mut()
            .insert(handle, (node, key.to_string()));
        PropertySubscription(handle)
    }

    fn off_property_change(&self, node: NodeId, subscription: PropertySubscription) {
        let removed = self.subscriptions.borrow_mut().remove(&subscription.0);
        assert!(
            removed.is_some_and(|(n, _)| n == node),
            "release of property subscription {subscription:?} which was never taken"
        );
    }
}
