//! Rule source loading: the [`RuleController`] reads named rule documents
//! from a backing store, parses them into the document model, caches the
//! result per name, and writes edits back.
//!
//! Loads are stamped with a monotonically increasing commission id at
//! request time; a result completing after a newer commission has written
//! the cache is discarded instead of clobbering fresher data. This is a
//! best-effort ordering mitigation, not a total-order guarantee.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use cps_document::{
    ALL_EVENTS, Delivery, DocumentStore, ElementId, ParseError, ParsedItem, Property,
    PropertyValue, parse_document, parse_formula,
};
use log::debug;

/// Monotonically increasing load ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommissionId(u64);

/// An in-flight load: the deferred half of `get_rule`. Complete it with
/// [`RuleController::complete_load`].
#[derive(Debug)]
pub struct Commission {
    id: CommissionId,
    name: String,
}

impl Commission {
    pub fn id(&self) -> CommissionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A loader failure.
#[derive(Debug)]
pub enum LoadError {
    Io { name: String, error: io::Error },
    Parse(ParseError),
    /// A source imported itself, directly or transitively. Carries the
    /// import chain ending in the repeated name.
    ImportCycle { chain: Vec<String> },
    NeverLoaded { name: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io { name, error } => write!(f, "cannot read rule source `{name}`: {error}"),
            LoadError::Parse(e) => write!(f, "{e}"),
            LoadError::ImportCycle { chain } => {
                write!(f, "recursive import: {}", chain.join(" -> "))
            }
            LoadError::NeverLoaded { name } => {
                write!(f, "rule source `{name}` was never loaded")
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io { error, .. } => Some(error),
            LoadError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ParseError> for LoadError {
    fn from(e: ParseError) -> Self {
        LoadError::Parse(e)
    }
}

/// The backing store rule documents live in.
pub trait SourceStore {
    fn read(&self, name: &str) -> io::Result<String>;
    fn write(&mut self, name: &str, text: &str) -> io::Result<()>;
    /// All stored source names, relative to the store root.
    fn list(&self) -> io::Result<Vec<String>>;
}

/// Filesystem-backed source store rooted at a directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &relative, out)?;
            } else {
                out.push(relative);
            }
        }
        Ok(())
    }
}

impl SourceStore for FsStore {
    fn read(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(name))
    }

    fn write(&mut self, name: &str, text: &str) -> io::Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        self.collect(&self.root, "", &mut out)?;
        Ok(out)
    }
}

struct RuleRecord {
    collection: ElementId,
    dirty: bool,
    cached: bool,
    commission: CommissionId,
    slot: usize,
}

/// Loads, caches and persists named rule documents.
pub struct RuleController<S: SourceStore> {
    source: S,
    suffix: String,
    records: HashMap<String, RuleRecord>,
    slots: HashMap<usize, String>,
    next_commission: u64,
}

impl<S: SourceStore> RuleController<S> {
    pub fn new(source: S, suffix: impl Into<String>) -> Self {
        Self {
            source,
            suffix: suffix.into(),
            records: HashMap::new(),
            slots: HashMap::new(),
            next_commission: 0,
        }
    }

    /// The cached collection for a loaded source, if any.
    pub fn collection(&self, name: &str) -> Option<ElementId> {
        self.records.get(name).map(|r| r.collection)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.records.get(name).is_some_and(|r| r.dirty)
    }

    /// Blocking load: returns the cached collection or reads, parses and
    /// installs it.
    pub fn get_rule(&mut self, doc: &mut DocumentStore, name: &str) -> Result<ElementId, LoadError> {
        let mut history = Vec::new();
        self.load_with_history(doc, name, &mut history)
    }

    /// Start a load and take its ticket. The deferred counterpart of
    /// `get_rule`; pair with [`RuleController::complete_load`].
    pub fn begin_load(&mut self, name: &str) -> Commission {
        let id = CommissionId(self.next_commission);
        self.next_commission += 1;
        Commission {
            id,
            name: name.to_string(),
        }
    }

    /// Install the result of a load, unless a newer commission already wrote
    /// the cache entry. Ties favor the request that set the current entry.
    pub fn complete_load(
        &mut self,
        doc: &mut DocumentStore,
        commission: Commission,
        text: io::Result<String>,
    ) -> Result<ElementId, LoadError> {
        let mut history = vec![commission.name.clone()];
        self.complete_with_history(doc, commission, text, &mut history)
    }

    fn load_with_history(
        &mut self,
        doc: &mut DocumentStore,
        name: &str,
        history: &mut Vec<String>,
    ) -> Result<ElementId, LoadError> {
        if history.iter().any(|n| n == name) {
            let mut chain = history.clone();
            chain.push(name.to_string());
            return Err(LoadError::ImportCycle { chain });
        }
        if let Some(record) = self.records.get(name) {
            if record.cached {
                return Ok(record.collection);
            }
        }
        history.push(name.to_string());
        let commission = self.begin_load(name);
        let text = self.source.read(name);
        let result = self.complete_with_history(doc, commission, text, history);
        history.pop();
        result
    }

    fn complete_with_history(
        &mut self,
        doc: &mut DocumentStore,
        commission: Commission,
        text: io::Result<String>,
        history: &mut Vec<String>,
    ) -> Result<ElementId, LoadError> {
        let name = commission.name.clone();
        if let Some(record) = self.records.get(&name) {
            if record.cached && record.commission >= commission.id {
                debug!(
                    "discarding stale load of `{name}` (commission {:?} superseded by {:?})",
                    commission.id, record.commission
                );
                return Ok(record.collection);
            }
        }
        let text = text.map_err(|error| LoadError::Io {
            name: name.clone(),
            error,
        })?;
        let items = self.materialize(doc, &text, &name, history)?;

        if let Some(record) = self.records.get_mut(&name) {
            // Reload in place: same collection identity, new contents. The
            // update subscription is re-established afterwards so the swap
            // itself does not mark the record dirty.
            let collection = record.collection;
            let slot = record.slot;
            doc.unsubscribe(slot);
            self.slots.remove(&slot);
            doc.reset_unchecked(collection, items, Some(&name), 0);
            let slot = doc.subscribe(collection, ALL_EVENTS);
            let record = self.records.get_mut(&name).expect("record exists");
            record.cached = true;
            record.dirty = false;
            record.commission = commission.id;
            record.slot = slot;
            self.slots.insert(slot, name);
            Ok(collection)
        } else {
            let collection = doc.new_collection(Some(&name), 0);
            for item in items {
                doc.append_unchecked(collection, item);
            }
            let slot = doc.subscribe(collection, ALL_EVENTS);
            self.records.insert(
                name.clone(),
                RuleRecord {
                    collection,
                    dirty: false,
                    cached: true,
                    commission: commission.id,
                    slot,
                },
            );
            self.slots.insert(slot, name);
            Ok(collection)
        }
    }

    /// Build document elements from parsed items, resolving imports.
    fn materialize(
        &mut self,
        doc: &mut DocumentStore,
        text: &str,
        name: &str,
        history: &mut Vec<String>,
    ) -> Result<Vec<ElementId>, LoadError> {
        let parsed = parse_document(text, name)?;
        let mut items = Vec::with_capacity(parsed.items.len());
        for item in parsed.items {
            match item {
                ParsedItem::Comment { text, .. } => items.push(doc.new_comment(text)),
                ParsedItem::Rule {
                    selectors,
                    declarations,
                    ..
                } => {
                    let rule = doc.new_rule(selectors);
                    let dict = doc.rule_dict(rule);
                    for declaration in declarations {
                        let mut value = PropertyValue::new(declaration.formula_source);
                        value.initialize(parse_formula(value.source()));
                        let mut property = Property::new(declaration.name, value);
                        if let Some(comment) = declaration.comment {
                            property = property.with_comment(comment);
                        }
                        doc.dict_set(dict, property);
                    }
                    items.push(rule);
                }
                ParsedItem::Import { name: target, .. } => {
                    let imported = self.load_with_history(doc, &target, history)?;
                    items.push(imported);
                }
            }
        }
        Ok(items)
    }

    /// Re-read a previously loaded source and swap the cached collection's
    /// contents in place. Fails if the source was never loaded.
    pub fn reload_rule(
        &mut self,
        doc: &mut DocumentStore,
        name: &str,
    ) -> Result<ElementId, LoadError> {
        let Some(record) = self.records.get_mut(name) else {
            return Err(LoadError::NeverLoaded {
                name: name.to_string(),
            });
        };
        record.cached = false;
        let commission = self.begin_load(name);
        let text = self.source.read(name);
        let mut history = vec![name.to_string()];
        self.complete_with_history(doc, commission, text, &mut history)
    }

    /// Write raw text for a source name straight to the backing store.
    pub fn write(&mut self, name: &str, text: &str) -> Result<(), LoadError> {
        self.source.write(name, text).map_err(|error| LoadError::Io {
            name: name.to_string(),
            error,
        })
    }

    /// Serialize the cached collection back to the store, but only when its
    /// dirty flag is set.
    pub fn save_rule_if_changed(
        &mut self,
        doc: &DocumentStore,
        name: &str,
    ) -> Result<bool, LoadError> {
        let Some(record) = self.records.get_mut(name) else {
            return Err(LoadError::NeverLoaded {
                name: name.to_string(),
            });
        };
        if !record.dirty {
            return Ok(false);
        }
        let text = doc.to_cps_text(record.collection);
        self.source.write(name, &text).map_err(|error| LoadError::Io {
            name: name.to_string(),
            error,
        })?;
        let record = self.records.get_mut(name).expect("record exists");
        record.dirty = false;
        Ok(true)
    }

    /// Save every dirty document. Returns the names written.
    pub fn save_changed_rules(&mut self, doc: &DocumentStore) -> Result<Vec<String>, LoadError> {
        let names: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.dirty)
            .map(|(n, _)| n.clone())
            .collect();
        let mut written = Vec::new();
        for name in names {
            if self.save_rule_if_changed(doc, &name)? {
                written.push(name);
            }
        }
        Ok(written)
    }

    /// All rule-source names under the configured root, filtered by suffix.
    pub fn get_available_rules(&self) -> Result<Vec<String>, LoadError> {
        let mut names: Vec<String> = self
            .source
            .list()
            .map_err(|error| LoadError::Io {
                name: "<root>".to_string(),
                error,
            })?
            .into_iter()
            .filter(|n| n.ends_with(&self.suffix))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Route a drained document delivery. Returns whether the delivery was
    /// for one of this controller's subscriptions; if so, the source is now
    /// marked dirty.
    pub fn handle_delivery(&mut self, delivery: &Delivery) -> bool {
        let Some(name) = self.slots.get(&delivery.slot) else {
            return false;
        };
        if let Some(record) = self.records.get_mut(name) {
            record.dirty = true;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct MemStore {
        files: Map<String, String>,
        writes: Vec<String>,
    }

    impl MemStore {
        fn with(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
                writes: Vec::new(),
            }
        }
    }

    impl SourceStore for MemStore {
        fn read(&self, name: &str) -> io::Result<String> {
            self.files
                .get(name)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
        }

        fn write(&mut self, name: &str, text: &str) -> io::Result<()> {
            self.files.insert(name.to_string(), text.to_string());
            self.writes.push(name.to_string());
            Ok(())
        }

        fn list(&self) -> io::Result<Vec<String>> {
            Ok(self.files.keys().cloned().collect())
        }
    }

    fn controller(files: &[(&str, &str)]) -> RuleController<MemStore> {
        RuleController::new(MemStore::with(files), ".cps")
    }

    #[test]
    fn load_parses_and_caches() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[("main.cps", ".a { x: 1; }")]);

        let col = rules.get_rule(&mut doc, "main.cps").unwrap();
        assert_eq!(doc.rules(col).len(), 1);
        let again = rules.get_rule(&mut doc, "main.cps").unwrap();
        assert_eq!(col, again);
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[]);
        assert!(matches!(
            rules.get_rule(&mut doc, "nope.cps"),
            Err(LoadError::Io { .. })
        ));
    }

    #[test]
    fn imports_nest_and_share_the_cached_collection() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[
            ("main.cps", "@import \"base.cps\";\n.a { x: 1; }"),
            ("base.cps", ".base { y: 2; }"),
        ]);

        let main = rules.get_rule(&mut doc, "main.cps").unwrap();
        assert_eq!(doc.rules(main).len(), 2);

        let base = rules.get_rule(&mut doc, "base.cps").unwrap();
        assert_eq!(doc.collection_items(main)[0], base);
    }

    #[test]
    fn import_cycles_fail_with_the_chain() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[
            ("a.cps", "@import \"b.cps\";"),
            ("b.cps", "@import \"a.cps\";"),
        ]);
        match rules.get_rule(&mut doc, "a.cps") {
            Err(LoadError::ImportCycle { chain }) => {
                assert_eq!(chain, vec!["a.cps", "b.cps", "a.cps"]);
            }
            other => panic!("expected import cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_import_fails() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[("a.cps", "@import \"a.cps\";")]);
        match rules.get_rule(&mut doc, "a.cps") {
            Err(LoadError::ImportCycle { chain }) => {
                assert_eq!(chain, vec!["a.cps", "a.cps"]);
            }
            other => panic!("expected import cycle, got {other:?}"),
        }
    }

    #[test]
    fn reload_requires_a_prior_load_and_keeps_identity() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[("main.cps", ".a { x: 1; }")]);
        assert!(matches!(
            rules.reload_rule(&mut doc, "main.cps"),
            Err(LoadError::NeverLoaded { .. })
        ));

        let col = rules.get_rule(&mut doc, "main.cps").unwrap();
        rules.source.files.insert(
            "main.cps".to_string(),
            ".a { x: 2; }\n.b { y: 3; }".to_string(),
        );
        let reloaded = rules.reload_rule(&mut doc, "main.cps").unwrap();
        assert_eq!(col, reloaded);
        assert_eq!(doc.rules(col).len(), 2);
        assert!(!rules.is_dirty("main.cps"));
    }

    #[test]
    fn stale_commission_does_not_clobber_newer_result() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[]);

        let slow = rules.begin_load("main.cps");
        let fast = rules.begin_load("main.cps");

        let col = rules
            .complete_load(&mut doc, fast, Ok(".fast { x: 1; }".to_string()))
            .unwrap();
        let after = rules
            .complete_load(&mut doc, slow, Ok(".slow { x: 1; }".to_string()))
            .unwrap();

        assert_eq!(col, after);
        let text = doc.to_cps_text(col);
        assert!(text.contains(".fast"), "stale result must be discarded: {text}");
    }

    #[test]
    fn edits_mark_dirty_and_save_writes_once() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[("main.cps", ".a { x: 1; }")]);
        let col = rules.get_rule(&mut doc, "main.cps").unwrap();

        // A freshly loaded document is clean.
        for d in doc.take_deliveries() {
            rules.handle_delivery(&d);
        }
        assert!(!rules.is_dirty("main.cps"));
        assert!(!rules.save_rule_if_changed(&doc, "main.cps").unwrap());

        let rule = doc.rules(col)[0];
        doc.dict_set(
            doc.rule_dict(rule),
            Property::new("x", PropertyValue::parsed("2")),
        );
        for d in doc.take_deliveries() {
            rules.handle_delivery(&d);
        }
        assert!(rules.is_dirty("main.cps"));

        assert!(rules.save_rule_if_changed(&doc, "main.cps").unwrap());
        assert!(!rules.is_dirty("main.cps"));
        assert_eq!(rules.source.writes, vec!["main.cps"]);
        assert!(rules.source.files["main.cps"].contains("x: 2;"));
    }

    #[test]
    fn save_changed_rules_covers_every_dirty_document() {
        let mut doc = DocumentStore::new();
        let mut rules = controller(&[("a.cps", ".a { x: 1; }"), ("b.cps", ".b { y: 1; }")]);
        let a = rules.get_rule(&mut doc, "a.cps").unwrap();
        let _ = rules.get_rule(&mut doc, "b.cps").unwrap();
        let _ = doc.take_deliveries();

        let rule = doc.rules(a)[0];
        doc.dict_set(
            doc.rule_dict(rule),
            Property::new("x", PropertyValue::parsed("9")),
        );
        for d in doc.take_deliveries() {
            rules.handle_delivery(&d);
        }

        let written = rules.save_changed_rules(&doc).unwrap();
        assert_eq!(written, vec!["a.cps"]);
    }

    #[test]
    fn available_rules_filter_by_suffix() {
        let rules = controller(&[
            ("a.cps", ""),
            ("sub/b.cps", ""),
            ("notes.txt", ""),
        ]);
        assert_eq!(
            rules.get_available_rules().unwrap(),
            vec!["a.cps", "sub/b.cps"]
        );
    }

    #[test]
    fn round_trip_serialization_reparses_equivalently() {
        let mut doc = DocumentStore::new();
        let text = "/* top */\n.a, div#x {\n    /* note */\n    width: parent-width / 2;\n    label: \"hi\";\n}\n";
        let mut rules = controller(&[("main.cps", text)]);
        let col = rules.get_rule(&mut doc, "main.cps").unwrap();

        let serialized = doc.to_cps_text(col);
        let mut rules2 = controller(&[("main.cps", serialized.as_str())]);
        let mut doc2 = DocumentStore::new();
        let col2 = rules2.get_rule(&mut doc2, "main.cps").unwrap();

        let pairs1 = doc.rule_pairs(col);
        let pairs2 = doc2.rule_pairs(col2);
        assert_eq!(pairs1.len(), pairs2.len());
        for ((sels1, rule1), (sels2, rule2)) in pairs1.iter().zip(pairs2.iter()) {
            let s1: Vec<String> = sels1.iter().map(ToString::to_string).collect();
            let s2: Vec<String> = sels2.iter().map(ToString::to_string).collect();
            assert_eq!(s1, s2);
            let d1 = doc.dict_properties(doc.rule_dict(*rule1));
            let d2 = doc2.dict_properties(doc2.rule_dict(*rule2));
            assert_eq!(d1.len(), d2.len());
            for (p1, p2) in d1.iter().zip(d2.iter()) {
                assert_eq!(p1.name(), p2.name());
                assert_eq!(p1.value().source(), p2.value().source());
            }
        }
    }
}
