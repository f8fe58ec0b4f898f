//! The matching-engine seam.
//!
//! The production engine (bloom-filter accelerated tree matching) lives
//! outside this workspace; the style system consumes it through
//! [`MatchEngine`]. [`ReferenceMatcher`] is a naive walking implementation
//! used by tests and small hosts.

use std::collections::HashMap;
use std::rc::Rc;

use cps_document::{DocumentStore, ElementId, NodeId, Value};
use cps_selector::{CompoundSelector, SelectorKind, Specificity};

use crate::node::NodeTree;

/// A selector compiled against a matching engine.
pub type CompiledMatcher = Rc<dyn Fn(&dyn NodeTree, NodeId) -> bool>;

/// One matched rule, as handed back by the engine. The position in the
/// returned list is authoritative for cascade order.
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub rule: ElementId,
    /// Human-readable explanation of why the rule matched.
    pub trace: Option<String>,
}

/// External selector-matching engine contract.
pub trait MatchEngine {
    /// Compile a compound selector into a matcher. Implementations memoize
    /// by the selector's canonical form, so repeated calls are cheap.
    fn compile(&mut self, selector: &CompoundSelector) -> CompiledMatcher;

    /// All rules in `sheet` matching `node`, in cascade order: most-specific
    /// first, with later-declared rules winning specificity ties.
    fn matching_rules(
        &mut self,
        doc: &mut DocumentStore,
        sheet: ElementId,
        tree: &dyn NodeTree,
        node: NodeId,
    ) -> Vec<MatchedRule>;
}

/// Straightforward walk-everything reference engine.
#[derive(Default)]
pub struct ReferenceMatcher {
    compiled: HashMap<String, CompiledMatcher>,
}

impl ReferenceMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchEngine for ReferenceMatcher {
    fn compile(&mut self, selector: &CompoundSelector) -> CompiledMatcher {
        let key = selector.canonical_key();
        if let Some(matcher) = self.compiled.get(&key) {
            return matcher.clone();
        }
        let matcher: CompiledMatcher = if selector.is_valid() {
            let parts: Vec<_> = selector.parts().to_vec();
            Rc::new(move |tree, node| {
                let node = tree.node(node);
                parts.iter().all(|part| match part.kind() {
                    SelectorKind::Universal => true,
                    SelectorKind::Type => {
                        node.cps_get("type").as_ref().and_then(Value::as_str)
                            == Some(part.name())
                    }
                    SelectorKind::Id => {
                        node.cps_get("id").as_ref().and_then(Value::as_str)
                            == Some(part.name())
                    }
                    SelectorKind::Class => node
                        .cps_get("class")
                        .as_ref()
                        .and_then(Value::as_str)
                        .is_some_and(|classes| {
                            classes.split_whitespace().any(|c| c == part.name())
                        }),
                    SelectorKind::PseudoClass => {
                        part.name() == "i"
                            && node.cps_get("i").and_then(|v| v.as_number())
                                == part.value()
                    }
                    // No pseudo-element tree to match against.
                    SelectorKind::PseudoElement => false,
                })
            })
        } else {
            // Invalid selectors never match; they stay inspectable on the rule.
            Rc::new(|_, _| false)
        };
        self.compiled.insert(key, matcher.clone());
        matcher
    }

    fn matching_rules(
        &mut self,
        doc: &mut DocumentStore,
        sheet: ElementId,
        tree: &dyn NodeTree,
        node: NodeId,
    ) -> Vec<MatchedRule> {
        let pairs = doc.rule_pairs(sheet);
        let mut matched: Vec<(Specificity, usize, MatchedRule)> = Vec::new();
        for (position, (selectors, rule)) in pairs.into_iter().enumerate() {
            // The most specific matching selector of the list counts.
            let mut best: Option<(Specificity, String)> = None;
            for selector in &selectors {
                if (self.compile(selector))(tree, node) {
                    let specificity = selector.specificity();
                    if best.as_ref().is_none_or(|(s, _)| specificity > *s) {
                        best = Some((specificity, selector.to_string()));
                    }
                }
            }
            if let Some((specificity, trace)) = best {
                matched.push((
                    specificity,
                    position,
                    MatchedRule {
                        rule,
                        trace: Some(trace),
                    },
                ));
            }
        }
        // Most-specific first; later-declared wins ties.
        matched.sort_by(|(sa, pa, _), (sb, pb, _)| sb.cmp(sa).then(pb.cmp(pa)));
        matched.into_iter().map(|(_, _, rule)| rule).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BasicNode, BasicTree};
    use cps_document::{Property, PropertyValue};
    use cps_selector::SimpleSelector;

    fn compound(parts: Vec<SimpleSelector>) -> CompoundSelector {
        CompoundSelector::new(parts)
    }

    fn class(name: &str) -> SimpleSelector {
        SimpleSelector::new(SelectorKind::Class, name, None)
    }

    fn sheet_with(doc: &mut DocumentStore, rules: Vec<Vec<CompoundSelector>>) -> ElementId {
        let sheet = doc.new_collection(None, 0);
        for selectors in rules {
            let rule = doc.new_rule(selectors);
            doc.dict_set(
                doc.rule_dict(rule),
                Property::new("x", PropertyValue::parsed("1")),
            );
            doc.splice(sheet, doc.collection_items(sheet).len(), 0, vec![rule])
                .unwrap();
        }
        sheet
    }

    #[test]
    fn cascade_order_is_specificity_then_source_order() {
        let mut doc = DocumentStore::new();
        let mut tree = BasicTree::new();
        let dict = doc.new_dict();
        let node = tree.insert(
            BasicNode::new(NodeId::new(1), "box", dict)
                .with_ident("top")
                .with_class("a"),
        );

        let sheet = sheet_with(
            &mut doc,
            vec![
                vec![compound(vec![class("a")])],
                vec![compound(vec![SimpleSelector::new(
                    SelectorKind::Id,
                    "top",
                    None,
                )])],
                vec![compound(vec![class("a")])],
            ],
        );

        let mut engine = ReferenceMatcher::new();
        let matched = engine.matching_rules(&mut doc, sheet, &tree, node);
        let rules = doc.rules(sheet);
        assert_eq!(matched.len(), 3);
        // The id rule is most specific; of the two class rules the
        // later-declared one comes first.
        assert_eq!(matched[0].rule, rules[1]);
        assert_eq!(matched[1].rule, rules[2]);
        assert_eq!(matched[2].rule, rules[0]);
    }

    #[test]
    fn index_pseudo_class_matches_position() {
        let mut doc = DocumentStore::new();
        let mut tree = BasicTree::new();
        let dict = doc.new_dict();
        let node = tree.insert(BasicNode::new(NodeId::new(1), "item", dict).with_index(2));

        let mut engine = ReferenceMatcher::new();
        let hit = compound(vec![SimpleSelector::new(
            SelectorKind::PseudoClass,
            "i",
            Some(2.0),
        )]);
        let miss = compound(vec![SimpleSelector::new(
            SelectorKind::PseudoClass,
            "i",
            Some(3.0),
        )]);
        assert!((engine.compile(&hit))(&tree, node));
        assert!(!(engine.compile(&miss))(&tree, node));
    }

    #[test]
    fn compilation_is_memoized_by_canonical_form() {
        let mut engine = ReferenceMatcher::new();
        let a = compound(vec![class("a"), class("b")]);
        let b = compound(vec![class("b"), class("a")]);
        let ma = engine.compile(&a);
        let mb = engine.compile(&b);
        assert!(Rc::ptr_eq(&ma, &mb));
    }

    #[test]
    fn invalid_selectors_never_match() {
        let mut doc = DocumentStore::new();
        let mut tree = BasicTree::new();
        let dict = doc.new_dict();
        let node = tree.insert(BasicNode::new(NodeId::new(1), "box", dict));
        let bad = compound(vec![
            SimpleSelector::new(SelectorKind::Type, "box", None),
            SimpleSelector::universal(),
        ]);
        let mut engine = ReferenceMatcher::new();
        assert!(!(engine.compile(&bad))(&tree, node));
    }
}
