//! End-to-end pipeline tests: rule sources on disk, loaded and cascaded
//! onto a small node tree.

use std::path::Path;

use cps::{
    BasicNode, BasicTree, Controller, FsStore, LoadError, NodeId, NodeTree, Property,
    PropertyValue, ReferenceMatcher, StyleError, Value,
};
use tempfile::TempDir;

fn write(root: &Path, name: &str, text: &str) {
    std::fs::write(root.join(name), text).unwrap();
}

fn controller(root: &Path) -> Controller<FsStore> {
    Controller::new(FsStore::new(root), Box::new(ReferenceMatcher::new()))
}

/// Two panels, one with an id; each gets its own property dict.
fn tree(controller: &mut Controller<FsStore>) -> (BasicTree, NodeId, NodeId) {
    let mut tree = BasicTree::new();
    let own1 = controller.doc().new_dict();
    let own2 = controller.doc().new_dict();
    let first = tree.insert(
        BasicNode::new(NodeId::new(1), "panel", own1)
            .with_class("box")
            .with_ident("top"),
    );
    let second = tree.insert(BasicNode::new(NodeId::new(2), "panel", own2).with_class("box"));
    (tree, first, second)
}

#[test]
fn cascade_specificity_and_formulas() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "main.cps",
        "* { margin: 4; }\n\
         .box { width: 80; height: width / 2; }\n\
         #top { width: 100; }\n",
    );

    let mut ctl = controller(dir.path());
    let (tree, first, second) = tree(&mut ctl);
    ctl.use_rules(&tree, "main.cps").unwrap();

    // The id rule wins width for the first node; the class rule for the
    // second; the height formula reads through the cascaded width.
    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(100.0));
    assert_eq!(ctl.computed(&tree, first, "height").unwrap(), Value::Number(50.0));
    assert_eq!(ctl.computed(&tree, second, "width").unwrap(), Value::Number(80.0));
    assert_eq!(ctl.computed(&tree, second, "height").unwrap(), Value::Number(40.0));
    assert_eq!(ctl.computed(&tree, first, "margin").unwrap(), Value::Number(4.0));

    // `this` is the node itself, whatever the rules say.
    assert_eq!(ctl.computed(&tree, first, "this").unwrap(), Value::Node(first));
}

#[test]
fn own_properties_shadow_rules_and_changes_notify() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "main.cps",
        ".box { width: 80; height: width / 2; }\n",
    );

    let mut ctl = controller(dir.path());
    let (tree, first, second) = tree(&mut ctl);
    ctl.use_rules(&tree, "main.cps").unwrap();
    assert_eq!(ctl.computed(&tree, second, "height").unwrap(), Value::Number(40.0));

    // Give the second node an own width; it outranks every rule.
    let own = tree.node(second).own_properties();
    ctl.doc()
        .dict_set(own, Property::new("width", PropertyValue::parsed("60")));

    let changes = ctl.flush(&tree);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].node, second);
    assert_eq!(changes[0].keys, vec!["height", "width"]);

    assert_eq!(ctl.computed(&tree, second, "width").unwrap(), Value::Number(60.0));
    assert_eq!(ctl.computed(&tree, second, "height").unwrap(), Value::Number(30.0));
    // The first node is untouched.
    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(80.0));
}

#[test]
fn recursion_is_an_error_not_a_hang() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", ".box { pad: pad + 1; }\n");

    let mut ctl = controller(dir.path());
    let (tree, first, _) = tree(&mut ctl);
    ctl.use_rules(&tree, "main.cps").unwrap();

    match ctl.computed(&tree, first, "pad") {
        Err(StyleError::Recursion { key }) => assert_eq!(key, "pad"),
        other => panic!("expected recursion error, got {other:?}"),
    }
    assert_eq!(
        ctl.computed_or(&tree, first, "pad", Value::Number(0.0)),
        Value::Number(0.0)
    );
}

#[test]
fn missing_keys_fall_back_to_the_supplied_default() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", ".box { width: 80; }\n");

    let mut ctl = controller(dir.path());
    let (tree, first, _) = tree(&mut ctl);
    ctl.use_rules(&tree, "main.cps").unwrap();

    assert!(ctl.computed(&tree, first, "nope").is_err());
    assert_eq!(
        ctl.computed_or(&tree, first, "nope", Value::Str("fallback".to_string())),
        Value::Str("fallback".to_string())
    );
}

#[test]
fn edits_dirty_the_document_and_save_writes_it_back() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", ".box { width: 80; }\n");

    let mut ctl = controller(dir.path());
    let (tree, first, _) = tree(&mut ctl);
    let sheet = ctl.use_rules(&tree, "main.cps").unwrap();
    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(80.0));

    let rule = ctl.doc().rules(sheet)[0];
    let dict = ctl.doc().rule_dict(rule);
    ctl.doc()
        .dict_set(dict, Property::new("width", PropertyValue::parsed("90")));

    let changes = ctl.flush(&tree);
    assert!(changes.iter().any(|c| c.keys.contains(&"width".to_string())));
    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(90.0));

    let written = ctl.save_changed_rules().unwrap();
    assert_eq!(written, vec!["main.cps"]);
    let text = std::fs::read_to_string(dir.path().join("main.cps")).unwrap();
    assert!(text.contains("width: 90;"), "{text}");

    // Nothing left to save.
    assert!(ctl.save_changed_rules().unwrap().is_empty());
}

#[test]
fn reload_swaps_contents_and_recomputes() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", ".box { width: 80; }\n");

    let mut ctl = controller(dir.path());
    let (tree, first, _) = tree(&mut ctl);
    ctl.use_rules(&tree, "main.cps").unwrap();
    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(80.0));

    write(dir.path(), "main.cps", ".box { width: 120; depth: 7; }\n");
    ctl.reload_rules(&tree, "main.cps").unwrap();

    assert_eq!(ctl.computed(&tree, first, "width").unwrap(), Value::Number(120.0));
    assert_eq!(ctl.computed(&tree, first, "depth").unwrap(), Value::Number(7.0));
}

#[test]
fn imports_cascade_and_cycles_fail() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "main.cps",
        "@import \"base.cps\";\n.box { width: base-width + 10; }\n",
    );
    write(dir.path(), "base.cps", ".box { base-width: 50; }\n");

    let mut ctl = controller(dir.path());
    let (tree1, first, _) = tree(&mut ctl);
    ctl.use_rules(&tree1, "main.cps").unwrap();
    assert_eq!(ctl.computed(&tree1, first, "width").unwrap(), Value::Number(60.0));

    write(dir.path(), "a.cps", "@import \"b.cps\";\n");
    write(dir.path(), "b.cps", "@import \"a.cps\";\n");
    let mut ctl2 = controller(dir.path());
    let (tree2, _, _) = tree(&mut ctl2);
    match ctl2.use_rules(&tree2, "a.cps") {
        Err(LoadError::ImportCycle { chain }) => {
            assert_eq!(chain, vec!["a.cps", "b.cps", "a.cps"]);
        }
        other => panic!("expected an import cycle, got {other:?}"),
    }
}

#[test]
fn available_rules_are_listed_relative_to_the_root() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", "");
    std::fs::create_dir_all(dir.path().join("themes")).unwrap();
    write(dir.path(), "themes/dark.cps", "");
    write(dir.path(), "README.md", "not a rule source");

    let ctl = controller(dir.path());
    assert_eq!(
        ctl.available_rules().unwrap(),
        vec!["main.cps", "themes/dark.cps"]
    );
}

#[test]
fn node_attribute_changes_invalidate_dependents() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "main.cps", ".box { label: \"n=\" + i; }\n");

    let mut ctl = controller(dir.path());
    let mut tree = BasicTree::new();
    let own = ctl.doc().new_dict();
    let node = tree.insert(
        BasicNode::new(NodeId::new(1), "panel", own)
            .with_class("box")
            .with_index(2),
    );
    ctl.use_rules(&tree, "main.cps").unwrap();
    assert_eq!(
        ctl.computed(&tree, node, "label").unwrap(),
        Value::Str("n=2".to_string())
    );

    tree.node_mut(node).set_index(5);
    ctl.node_property_changed(&tree, node, "i");
    let changes = ctl.flush(&tree);
    assert!(changes.iter().any(|c| c.node == node));
    assert_eq!(
        ctl.computed(&tree, node, "label").unwrap(),
        Value::Str("n=5".to_string())
    );
}
