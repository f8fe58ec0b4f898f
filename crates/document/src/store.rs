//! The element store: collections, rules, property dicts and comments held
//! in one arena, with parent links for upward event forwarding.

use std::collections::HashSet;
use std::fmt;

use cps_selector::{CompoundSelector, format_selector_list};
use slab::Slab;
use smallvec::SmallVec;

use crate::ElementId;
use crate::event::{Delivery, DocEvent, EventKind, Registry, SlotId};
use crate::formula::Formula;

/// Raw formula text plus its parse state.
///
/// A `PropertyValue` is initialized exactly once, after the surrounding
/// document has been parsed. Re-initialization or evaluation while
/// uninitialized/invalid is a logic error and panics.
#[derive(Debug, Clone)]
pub struct PropertyValue {
    source: String,
    state: FormulaState,
}

#[derive(Debug, Clone)]
enum FormulaState {
    Uninit,
    Parsed(Formula),
    Invalid(String),
}

impl PropertyValue {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: FormulaState::Uninit,
        }
    }

    /// Shorthand: construct and initialize from the formula parser.
    pub fn parsed(source: impl Into<String>) -> Self {
        let mut value = Self::new(source);
        value.initialize(crate::formula::parse_formula(&value.source));
        value
    }

    /// Install the parse result. Panics if called twice.
    pub fn initialize(&mut self, parsed: Result<Formula, String>) {
        assert!(
            matches!(self.state, FormulaState::Uninit),
            "property value `{}` initialized twice",
            self.source
        );
        self.state = match parsed {
            Ok(formula) => FormulaState::Parsed(formula),
            Err(message) => FormulaState::Invalid(message),
        };
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, FormulaState::Uninit)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.state, FormulaState::Invalid(_))
    }

    pub fn message(&self) -> Option<&str> {
        match &self.state {
            FormulaState::Invalid(message) => Some(message),
            _ => None,
        }
    }

    /// The parsed formula. Panics when uninitialized or invalid.
    pub fn formula(&self) -> &Formula {
        match &self.state {
            FormulaState::Parsed(formula) => formula,
            FormulaState::Uninit => {
                panic!("property value `{}` used before initialization", self.source)
            }
            FormulaState::Invalid(message) => {
                panic!("use of invalid property value `{}`: {message}", self.source)
            }
        }
    }
}

/// An immutable `(name, value)` pair, optionally annotated with a comment
/// that serialization hoists to precede the declaration.
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    value: PropertyValue,
    comment: Option<String>,
}

impl Property {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

type Parents = SmallVec<[ElementId; 1]>;

struct CollectionData {
    items: Vec<ElementId>,
    parents: Parents,
    /// Source document name, when this collection was loaded from one.
    source: Option<String>,
    line_no: u32,
    invalid: Option<String>,
    /// Cached flattened rule list; cleared on structural change.
    rules_view: Option<Vec<ElementId>>,
}

struct RuleData {
    selectors: Vec<CompoundSelector>,
    dict: ElementId,
    parents: Parents,
    invalid: Option<String>,
}

struct DictData {
    entries: Vec<Property>,
    parents: Parents,
}

struct CommentData {
    text: String,
    parents: Parents,
}

enum Element {
    Collection(CollectionData),
    Rule(RuleData),
    Dict(DictData),
    Comment(CommentData),
}

impl Element {
    fn parents(&self) -> &Parents {
        match self {
            Element::Collection(c) => &c.parents,
            Element::Rule(r) => &r.parents,
            Element::Dict(d) => &d.parents,
            Element::Comment(c) => &c.parents,
        }
    }

    fn parents_mut(&mut self) -> &mut Parents {
        match self {
            Element::Collection(c) => &mut c.parents,
            Element::Rule(r) => &mut r.parents,
            Element::Dict(d) => &mut d.parents,
            Element::Comment(c) => &mut c.parents,
        }
    }
}

/// A rejected `splice`.
#[derive(Debug)]
pub enum SpliceError {
    OutOfBounds {
        start: usize,
        delete_count: usize,
        len: usize,
    },
    /// The insertion is a rule without a valid selector list.
    InvalidRule { element: ElementId, message: String },
    /// The insertion is a collection marked invalid.
    InvalidCollection { element: ElementId, message: String },
    /// The insertion kind cannot live in a collection.
    BadInsert { element: ElementId },
    /// Inserting the element would make the collection its own descendant.
    Cycle { element: ElementId },
}

impl fmt::Display for SpliceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpliceError::OutOfBounds {
                start,
                delete_count,
                len,
            } => write!(
                f,
                "splice range {start}..{} out of bounds for length {len}",
                start + delete_count
            ),
            SpliceError::InvalidRule { element, message } => {
                write!(f, "cannot insert invalid rule {element}: {message}")
            }
            SpliceError::InvalidCollection { element, message } => {
                write!(f, "cannot insert invalid collection {element}: {message}")
            }
            SpliceError::BadInsert { element } => {
                write!(f, "element {element} cannot be inserted into a collection")
            }
            SpliceError::Cycle { element } => {
                write!(f, "inserting {element} would create a collection cycle")
            }
        }
    }
}

impl std::error::Error for SpliceError {}

/// Whether a selector list makes its rule usable: non-empty, every compound
/// valid.
pub fn selector_list_is_valid(selectors: &[CompoundSelector]) -> bool {
    !selectors.is_empty() && selectors.iter().all(CompoundSelector::is_valid)
}

fn selector_list_message(selectors: &[CompoundSelector]) -> Option<String> {
    if selectors.is_empty() {
        return Some("rule has an empty selector list".to_string());
    }
    selectors
        .iter()
        .find(|s| !s.is_valid())
        .map(|s| s.message().unwrap_or("invalid selector").to_string())
}

/// Arena of document elements plus the event registry.
#[derive(Default)]
pub struct DocumentStore {
    elements: Slab<Element>,
    registry: Registry,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub fn new_collection(&mut self, source: Option<&str>, line_no: u32) -> ElementId {
        ElementId(self.elements.insert(Element::Collection(CollectionData {
            items: Vec::new(),
            parents: SmallVec::new(),
            source: source.map(str::to_string),
            line_no,
            invalid: None,
            rules_view: None,
        })))
    }

    /// Create a rule together with its (empty) property dict.
    pub fn new_rule(&mut self, selectors: Vec<CompoundSelector>) -> ElementId {
        let invalid = selector_list_message(&selectors);
        let dict = ElementId(self.elements.insert(Element::Dict(DictData {
            entries: Vec::new(),
            parents: SmallVec::new(),
        })));
        let rule = ElementId(self.elements.insert(Element::Rule(RuleData {
            selectors,
            dict,
            parents: SmallVec::new(),
            invalid,
        })));
        self.elements[dict.0].parents_mut().push(rule);
        rule
    }

    pub fn new_comment(&mut self, text: impl Into<String>) -> ElementId {
        ElementId(self.elements.insert(Element::Comment(CommentData {
            text: text.into(),
            parents: SmallVec::new(),
        })))
    }

    /// A free-standing property dict, e.g. a node's own property set.
    pub fn new_dict(&mut self) -> ElementId {
        ElementId(self.elements.insert(Element::Dict(DictData {
            entries: Vec::new(),
            parents: SmallVec::new(),
        })))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn contains(&self, el: ElementId) -> bool {
        self.elements.contains(el.0)
    }

    pub fn is_collection(&self, el: ElementId) -> bool {
        matches!(self.elements.get(el.0), Some(Element::Collection(_)))
    }

    pub fn is_rule(&self, el: ElementId) -> bool {
        matches!(self.elements.get(el.0), Some(Element::Rule(_)))
    }

    pub fn is_comment(&self, el: ElementId) -> bool {
        matches!(self.elements.get(el.0), Some(Element::Comment(_)))
    }

    fn collection(&self, el: ElementId) -> &CollectionData {
        match self.elements.get(el.0) {
            Some(Element::Collection(c)) => c,
            _ => panic!("element {el} is not a collection"),
        }
    }

    fn collection_mut(&mut self, el: ElementId) -> &mut CollectionData {
        match self.elements.get_mut(el.0) {
            Some(Element::Collection(c)) => c,
            _ => panic!("element {el} is not a collection"),
        }
    }

    fn rule(&self, el: ElementId) -> &RuleData {
        match self.elements.get(el.0) {
            Some(Element::Rule(r)) => r,
            _ => panic!("element {el} is not a rule"),
        }
    }

    fn dict(&self, el: ElementId) -> &DictData {
        match self.elements.get(el.0) {
            Some(Element::Dict(d)) => d,
            _ => panic!("element {el} is not a property dict"),
        }
    }

    fn dict_mut(&mut self, el: ElementId) -> &mut DictData {
        match self.elements.get_mut(el.0) {
            Some(Element::Dict(d)) => d,
            _ => panic!("element {el} is not a property dict"),
        }
    }

    pub fn collection_items(&self, col: ElementId) -> &[ElementId] {
        &self.collection(col).items
    }

    pub fn collection_source(&self, col: ElementId) -> Option<&str> {
        self.collection(col).source.as_deref()
    }

    pub fn collection_line(&self, col: ElementId) -> u32 {
        self.collection(col).line_no
    }

    pub fn collection_is_valid(&self, col: ElementId) -> bool {
        self.collection(col).invalid.is_none()
    }

    pub fn rule_selectors(&self, rule: ElementId) -> &[CompoundSelector] {
        &self.rule(rule).selectors
    }

    pub fn rule_dict(&self, rule: ElementId) -> ElementId {
        self.rule(rule).dict
    }

    pub fn rule_is_valid(&self, rule: ElementId) -> bool {
        self.rule(rule).invalid.is_none()
    }

    pub fn rule_message(&self, rule: ElementId) -> Option<&str> {
        self.rule(rule).invalid.as_deref()
    }

    pub fn comment_text(&self, comment: ElementId) -> &str {
        match self.elements.get(comment.0) {
            Some(Element::Comment(c)) => &c.text,
            _ => panic!("element {comment} is not a comment"),
        }
    }

    // ------------------------------------------------------------------
    // Property dict operations
    // ------------------------------------------------------------------

    pub fn dict_get(&self, dict: ElementId, name: &str) -> Option<&Property> {
        self.dict(dict).entries.iter().find(|p| p.name() == name)
    }

    pub fn dict_has(&self, dict: ElementId, name: &str) -> bool {
        self.dict_get(dict, name).is_some()
    }

    pub fn dict_properties(&self, dict: ElementId) -> &[Property] {
        &self.dict(dict).entries
    }

    pub fn dict_len(&self, dict: ElementId) -> usize {
        self.dict(dict).entries.len()
    }

    /// Insert or replace a property; replacement keeps the ordinal position.
    pub fn dict_set(&mut self, dict: ElementId, property: Property) {
        let name = property.name().to_string();
        let data = self.dict_mut(dict);
        let kind = match data.entries.iter_mut().find(|p| p.name() == name) {
            Some(slot) => {
                *slot = property;
                EventKind::Update
            }
            None => {
                data.entries.push(property);
                EventKind::Add
            }
        };
        self.emit_upward(dict, DocEvent::keyed(kind, dict, &name));
    }

    /// Retract a property by name; returns whether it existed.
    pub fn dict_remove(&mut self, dict: ElementId, name: &str) -> bool {
        let data = self.dict_mut(dict);
        let before = data.entries.len();
        data.entries.retain(|p| p.name() != name);
        let removed = data.entries.len() != before;
        if removed {
            self.emit_upward(dict, DocEvent::keyed(EventKind::Delete, dict, name));
        }
        removed
    }

    // ------------------------------------------------------------------
    // Rule operations
    // ------------------------------------------------------------------

    /// Re-target a rule at a new selector list: the only identity-preserving
    /// rule mutation.
    pub fn retarget_rule(&mut self, rule: ElementId, selectors: Vec<CompoundSelector>) {
        let invalid = selector_list_message(&selectors);
        match self.elements.get_mut(rule.0) {
            Some(Element::Rule(data)) => {
                data.selectors = selectors;
                data.invalid = invalid;
            }
            _ => panic!("element {rule} is not a rule"),
        }
        self.emit_upward(rule, DocEvent::structural(EventKind::SelectorChange, rule));
        self.emit_upward(rule, DocEvent::structural(EventKind::Update, rule));
    }

    // ------------------------------------------------------------------
    // Collection operations
    // ------------------------------------------------------------------

    /// The single mutation primitive: remove `delete_count` items at `start`
    /// and insert `insertions` there. Insertions are validated before any
    /// mutation happens; the batched event set (`Delete`, `Add`,
    /// `StructuralChange`, `Update` as applicable) is emitted exactly once
    /// per call.
    pub fn splice(
        &mut self,
        col: ElementId,
        start: usize,
        delete_count: usize,
        insertions: Vec<ElementId>,
    ) -> Result<(), SpliceError> {
        let len = self.collection(col).items.len();
        if start > len || start + delete_count > len {
            return Err(SpliceError::OutOfBounds {
                start,
                delete_count,
                len,
            });
        }
        for &el in &insertions {
            match self.elements.get(el.0) {
                Some(Element::Rule(rule)) => {
                    if let Some(message) = &rule.invalid {
                        return Err(SpliceError::InvalidRule {
                            element: el,
                            message: message.clone(),
                        });
                    }
                }
                Some(Element::Collection(data)) => {
                    if let Some(message) = &data.invalid {
                        return Err(SpliceError::InvalidCollection {
                            element: el,
                            message: message.clone(),
                        });
                    }
                    if el == col || self.reaches(el, col) {
                        return Err(SpliceError::Cycle { element: el });
                    }
                }
                Some(Element::Comment(_)) => {}
                _ => return Err(SpliceError::BadInsert { element: el }),
            }
        }

        let inserted = !insertions.is_empty();
        let removed: Vec<ElementId> = {
            let data = self.collection_mut(col);
            data.items
                .splice(start..start + delete_count, insertions.iter().copied())
                .collect()
        };
        for &el in &insertions {
            self.elements[el.0].parents_mut().push(col);
        }
        for &el in &removed {
            self.unlink(el, col);
        }

        if removed.is_empty() && !inserted {
            return Ok(());
        }
        if !removed.is_empty() {
            let mut event = DocEvent::structural(EventKind::Delete, col);
            event.elements.extend(removed.iter().copied());
            self.emit_upward(col, event);
        }
        if inserted {
            let mut event = DocEvent::structural(EventKind::Add, col);
            event.elements.extend(insertions);
            self.emit_upward(col, event);
        }
        self.emit_upward(col, DocEvent::structural(EventKind::StructuralChange, col));
        self.emit_upward(col, DocEvent::structural(EventKind::Update, col));
        Ok(())
    }

    /// Clear and reconstruct a collection in place, preserving its identity
    /// for existing subscribers. Used to hot-swap a reloaded document.
    pub fn reset(
        &mut self,
        col: ElementId,
        items: Vec<ElementId>,
        source: Option<&str>,
        line_no: u32,
    ) -> Result<(), SpliceError> {
        let len = self.collection(col).items.len();
        self.splice(col, 0, len, items)?;
        let data = self.collection_mut(col);
        data.source = source.map(str::to_string);
        data.line_no = line_no;
        Ok(())
    }

    /// Append parsed items without edit validation. Loader-side
    /// materialization uses this so documents containing invalid rules stay
    /// representable and inspectable.
    pub fn append_unchecked(&mut self, col: ElementId, el: ElementId) {
        self.collection_mut(col).items.push(el);
        self.elements[el.0].parents_mut().push(col);
        self.collection_mut(col).rules_view = None;
    }

    /// `reset` without insertion validation, for loader materialization.
    /// Emits the same batched event set as `splice`.
    pub fn reset_unchecked(
        &mut self,
        col: ElementId,
        items: Vec<ElementId>,
        source: Option<&str>,
        line_no: u32,
    ) {
        let old = std::mem::take(&mut self.collection_mut(col).items);
        for &el in &items {
            self.elements[el.0].parents_mut().push(col);
        }
        self.collection_mut(col).items = items.clone();
        for &el in &old {
            self.unlink(el, col);
        }
        {
            let data = self.collection_mut(col);
            data.source = source.map(str::to_string);
            data.line_no = line_no;
            data.rules_view = None;
        }
        if !old.is_empty() {
            let mut event = DocEvent::structural(EventKind::Delete, col);
            event.elements.extend(old);
            self.emit_upward(col, event);
        }
        if !self.collection(col).items.is_empty() {
            let mut event = DocEvent::structural(EventKind::Add, col);
            event.elements.extend(items);
            self.emit_upward(col, event);
        }
        self.emit_upward(col, DocEvent::structural(EventKind::StructuralChange, col));
        self.emit_upward(col, DocEvent::structural(EventKind::Update, col));
    }

    /// The flattened view: every rule in this collection or any transitively
    /// nested collection, in document order, paired with its selector list
    /// by [`DocumentStore::rule_pairs`]. Cached until a structural change.
    pub fn rules(&mut self, col: ElementId) -> Vec<ElementId> {
        if let Some(view) = &self.collection(col).rules_view {
            return view.clone();
        }
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.flatten_rules(col, &mut out, &mut seen);
        self.collection_mut(col).rules_view = Some(out.clone());
        out
    }

    fn flatten_rules(
        &self,
        col: ElementId,
        out: &mut Vec<ElementId>,
        seen: &mut HashSet<ElementId>,
    ) {
        if !seen.insert(col) {
            return;
        }
        for &item in &self.collection(col).items {
            match &self.elements[item.0] {
                Element::Rule(_) => out.push(item),
                Element::Collection(_) => self.flatten_rules(item, out, seen),
                _ => {}
            }
        }
    }

    /// Flattened `(selector list, rule)` pairs.
    pub fn rule_pairs(&mut self, col: ElementId) -> Vec<(Vec<CompoundSelector>, ElementId)> {
        self.rules(col)
            .into_iter()
            .map(|rule| (self.rule(rule).selectors.clone(), rule))
            .collect()
    }

    /// Destroy an element and any children left without a parent.
    pub fn destroy(&mut self, el: ElementId) {
        let children: Vec<ElementId> = match &self.elements[el.0] {
            Element::Collection(c) => c.items.clone(),
            Element::Rule(r) => vec![r.dict],
            _ => Vec::new(),
        };
        for child in children {
            if !self.elements.contains(child.0) {
                continue;
            }
            let parents = self.elements[child.0].parents_mut();
            parents.retain(|&mut p| p != el);
            if parents.is_empty() {
                self.destroy(child);
            }
        }
        self.registry.retire_target(el);
        self.elements.remove(el.0);
    }

    fn unlink(&mut self, el: ElementId, parent: ElementId) {
        let parents = self.elements[el.0].parents_mut();
        // Remove a single occurrence so an element spliced out and back in
        // within one call keeps its remaining link.
        if let Some(pos) = parents.iter().position(|&p| p == parent) {
            parents.remove(pos);
        }
        if parents.is_empty() {
            self.destroy(el);
        }
    }

    /// Is `to` reachable from `from` through collection items?
    fn reaches(&self, from: ElementId, to: ElementId) -> bool {
        if let Some(Element::Collection(data)) = self.elements.get(from.0) {
            for &item in &data.items {
                if item == to || self.reaches(item, to) {
                    return true;
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe(&mut self, target: ElementId, mask: u8) -> SlotId {
        assert!(self.contains(target), "subscribe to missing element {target}");
        self.registry.subscribe(target, mask)
    }

    pub fn unsubscribe(&mut self, slot: SlotId) {
        self.registry.unsubscribe(slot);
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.registry.take()
    }

    fn emit_upward(&mut self, origin: ElementId, event: DocEvent) {
        let mut visited: HashSet<ElementId> = HashSet::new();
        let mut stack = vec![origin];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if event.kind == EventKind::StructuralChange {
                if let Some(Element::Collection(data)) = self.elements.get_mut(id.0) {
                    data.rules_view = None;
                }
            }
            self.registry.emit(id, &event);
            if let Some(element) = self.elements.get(id.0) {
                stack.extend(element.parents().iter().copied());
            }
        }
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Render a collection back to rule source text.
    pub fn to_cps_text(&self, col: ElementId) -> String {
        let mut out = String::new();
        self.write_collection(col, self.collection(col).source.as_deref(), &mut out);
        out
    }

    fn write_collection(&self, col: ElementId, source: Option<&str>, out: &mut String) {
        for &item in &self.collection(col).items {
            match &self.elements[item.0] {
                Element::Comment(c) => {
                    out.push_str("/* ");
                    out.push_str(&c.text);
                    out.push_str(" */\n");
                }
                Element::Rule(rule) => {
                    out.push_str(&format_selector_list(&rule.selectors));
                    out.push_str(" {\n");
                    for property in &self.dict(rule.dict).entries {
                        if let Some(comment) = property.comment() {
                            out.push_str("    /* ");
                            out.push_str(comment);
                            out.push_str(" */\n");
                        }
                        out.push_str("    ");
                        out.push_str(property.name());
                        out.push_str(": ");
                        out.push_str(property.value().source());
                        out.push_str(";\n");
                    }
                    out.push_str("}\n");
                }
                Element::Collection(nested) => {
                    // An imported document keeps its identity; anything else
                    // is written inline.
                    match (&nested.source, source) {
                        (Some(name), parent) if parent != Some(name.as_str()) => {
                            out.push_str("@import \"");
                            out.push_str(name);
                            out.push_str("\";\n");
                        }
                        _ => self.write_collection(item, source, out),
                    }
                }
                Element::Dict(_) => {}
            }
        }
    }
}
