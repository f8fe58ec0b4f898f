//! CPS: a cascading property language and its resolution engine for trees
//! of styleable nodes.
//!
//! The [`Controller`] is the cascade orchestrator: it owns the document
//! store, the rule source loader and the style system, wires drained
//! document events to loader dirty flags and cache invalidation, and
//! exposes the computed-style surface hosts consume.

use anyhow::Context as _;
use log::info;

pub use cps_document::{
    DocumentStore, ElementId, Formula, NodeId, ParseError, Property, PropertyValue, Value,
    parse_document, parse_formula,
};
pub use cps_loader::{Commission, CommissionId, FsStore, LoadError, RuleController, SourceStore};
pub use cps_selector::{CompoundSelector, SelectorKind, SimpleSelector, Specificity};
pub use cps_style::{
    BasicNode, BasicTree, MatchEngine, MatchedRule, NodeTree, ReferenceMatcher, StyleChange,
    StyleContext, StyleError, StyleSystem, StyleableNode,
};

use cps_document::{Delivery, EventKind, SlotId};

/// Owns one style dict per node and keeps the whole pipeline coherent:
/// text sources -> document model -> cascade -> computed values.
pub struct Controller<S: SourceStore> {
    doc: DocumentStore,
    rules: RuleController<S>,
    styles: StyleSystem,
    engine: Box<dyn MatchEngine>,
    /// The rule collection nodes are currently matched against.
    sheet: ElementId,
    sheet_slot: Option<SlotId>,
}

impl<S: SourceStore> Controller<S> {
    pub fn new(source: S, engine: Box<dyn MatchEngine>) -> Self {
        let mut doc = DocumentStore::new();
        let sheet = doc.new_collection(None, 0);
        Self {
            doc,
            rules: RuleController::new(source, ".cps"),
            styles: StyleSystem::new(),
            engine,
            sheet,
            sheet_slot: None,
        }
    }

    /// The document store, for direct edits. Call [`Controller::flush`] (or
    /// any computed read) afterwards to apply the consequences.
    pub fn doc(&mut self) -> &mut DocumentStore {
        &mut self.doc
    }

    pub fn sheet(&self) -> ElementId {
        self.sheet
    }

    /// Load a rule document and make it the active sheet.
    pub fn use_rules(&mut self, tree: &dyn NodeTree, name: &str) -> Result<ElementId, LoadError> {
        let sheet = self.rules.get_rule(&mut self.doc, name)?;
        if let Some(slot) = self.sheet_slot.take() {
            self.doc.unsubscribe(slot);
        }
        self.sheet = sheet;
        self.sheet_slot = Some(self.doc.subscribe(
            sheet,
            EventKind::StructuralChange.mask() | EventKind::SelectorChange.mask(),
        ));
        info!("using rule document `{name}` as the active sheet");
        self.refresh_dicts(tree);
        self.pump(tree);
        Ok(sheet)
    }

    /// Re-read the active rule sources from the backing store.
    pub fn reload_rules(&mut self, tree: &dyn NodeTree, name: &str) -> Result<ElementId, LoadError> {
        let collection = self.rules.reload_rule(&mut self.doc, name)?;
        self.pump(tree);
        Ok(collection)
    }

    /// Resolve a computed property for a node.
    pub fn computed(
        &mut self,
        tree: &dyn NodeTree,
        node: NodeId,
        key: &str,
    ) -> Result<Value, StyleError> {
        self.pump(tree);
        let mut cx = StyleContext {
            doc: &mut self.doc,
            engine: &mut *self.engine,
            tree,
            sheet: self.sheet,
        };
        self.styles.get(&mut cx, node, key)
    }

    /// Resolve with a fallback for lookup failures.
    pub fn computed_or(
        &mut self,
        tree: &dyn NodeTree,
        node: NodeId,
        key: &str,
        default: Value,
    ) -> Value {
        self.computed(tree, node, key).unwrap_or(default)
    }

    /// A whitelisted node attribute changed outside the document model.
    pub fn node_property_changed(&mut self, tree: &dyn NodeTree, node: NodeId, key: &str) {
        self.styles.node_property_changed(tree, node, key);
    }

    /// The node left the tree; its dict and subscriptions go with it.
    pub fn node_removed(&mut self, tree: &dyn NodeTree, node: NodeId) {
        self.styles.node_removed(&mut self.doc, tree, node);
    }

    /// Apply pending document deliveries and fire the coalesced change
    /// notifications. Call at the end of a batch of edits.
    pub fn flush(&mut self, tree: &dyn NodeTree) -> Vec<StyleChange> {
        self.pump(tree);
        self.styles.flush()
    }

    /// Persist every dirty rule document.
    pub fn save_changed_rules(&mut self) -> anyhow::Result<Vec<String>> {
        self.rules
            .save_changed_rules(&self.doc)
            .context("saving changed rule documents")
    }

    pub fn save_rule_if_changed(&mut self, name: &str) -> Result<bool, LoadError> {
        self.rules.save_rule_if_changed(&self.doc, name)
    }

    pub fn available_rules(&self) -> Result<Vec<String>, LoadError> {
        self.rules.get_available_rules()
    }

    /// Drain document deliveries and route them: loader dirty flags, style
    /// index corrections, and rule-set refresh on sheet structure changes.
    fn pump(&mut self, tree: &dyn NodeTree) {
        loop {
            let deliveries = self.doc.take_deliveries();
            if deliveries.is_empty() {
                return;
            }
            let mut needs_refresh = false;
            for delivery in &deliveries {
                if self.sheet_slot == Some(delivery.slot) {
                    needs_refresh = true;
                    continue;
                }
                self.route(tree, delivery);
            }
            if needs_refresh {
                self.refresh_dicts(tree);
            }
        }
    }

    fn route(&mut self, tree: &dyn NodeTree, delivery: &Delivery) {
        if self.rules.handle_delivery(delivery) {
            return;
        }
        self.styles.handle_delivery(&mut self.doc, tree, delivery);
    }

    fn refresh_dicts(&mut self, tree: &dyn NodeTree) {
        for node in self.styles.nodes() {
            let mut cx = StyleContext {
                doc: &mut self.doc,
                engine: &mut *self.engine,
                tree,
                sheet: self.sheet,
            };
            self.styles.check_rules(&mut cx, node);
        }
    }
}
