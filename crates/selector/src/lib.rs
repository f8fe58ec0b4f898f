//! Selector data model for CPS rules.
//!
//! Selectors are immutable once constructed: validity is computed at
//! construction time and recorded on the value rather than thrown, so trees
//! of partially-invalid input stay representable and inspectable.

use std::fmt;
use std::ops::Add;

use once_cell::unsync::OnceCell;

/// The kind of a single selector term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorKind {
    Universal,
    Type,
    Id,
    Class,
    PseudoClass,
    PseudoElement,
}

/// Selector weight as an `(ids, classes, types)` triple.
///
/// Comparison is lexicographic over the three counts, which is exactly the
/// cascade precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Specificity {
    pub ids: u32,
    pub classes: u32,
    pub types: u32,
}

impl Specificity {
    pub const fn new(ids: u32, classes: u32, types: u32) -> Self {
        Self {
            ids,
            classes,
            types,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0, 0)
    }
}

impl Add for Specificity {
    type Output = Specificity;

    fn add(self, other: Specificity) -> Specificity {
        Specificity::new(
            self.ids + other.ids,
            self.classes + other.classes,
            self.types + other.types,
        )
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ids
            .cmp(&other.ids)
            .then(self.classes.cmp(&other.classes))
            .then(self.types.cmp(&other.types))
    }
}

/// A single selector term such as `div`, `#id`, `.class`, `:i(3)` or
/// `::marker`.
#[derive(Debug, Clone)]
pub struct SimpleSelector {
    kind: SelectorKind,
    name: String,
    value: Option<f64>,
    invalid: Option<String>,
    /// Set for the universal selector a compound selector prepends itself;
    /// suppressed from serialization.
    implicit: bool,
}

impl SimpleSelector {
    /// Construct and validate a simple selector. Validity is computed here
    /// once and never mutated afterwards.
    pub fn new(kind: SelectorKind, name: impl Into<String>, value: Option<f64>) -> Self {
        let name = name.into();
        let invalid = Self::check(kind, &name, value);
        Self {
            kind,
            name,
            value,
            invalid,
            implicit: false,
        }
    }

    /// The universal selector `*`.
    pub fn universal() -> Self {
        Self::new(SelectorKind::Universal, "*", None)
    }

    fn implicit_universal() -> Self {
        let mut sel = Self::universal();
        sel.implicit = true;
        sel
    }

    fn check(kind: SelectorKind, name: &str, value: Option<f64>) -> Option<String> {
        if kind != SelectorKind::Universal && name.is_empty() {
            return Some("selector name must not be empty".to_string());
        }
        match kind {
            SelectorKind::PseudoClass => {
                if name == "i" {
                    match value {
                        Some(v) if v.is_finite() => None,
                        Some(_) => {
                            Some(":i() requires a finite numeric argument".to_string())
                        }
                        None => Some(":i() requires a numeric argument".to_string()),
                    }
                } else {
                    None
                }
            }
            _ if value.is_some() => Some(format!(
                "selector `{name}` does not take an argument"
            )),
            _ => None,
        }
    }

    pub fn kind(&self) -> SelectorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }

    /// Diagnostic message when the selector is invalid.
    pub fn message(&self) -> Option<&str> {
        self.invalid.as_deref()
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn specificity(&self) -> Specificity {
        match self.kind {
            SelectorKind::Id => Specificity::new(1, 0, 0),
            SelectorKind::Class | SelectorKind::PseudoClass => Specificity::new(0, 1, 0),
            SelectorKind::Type | SelectorKind::PseudoElement => Specificity::new(0, 0, 1),
            SelectorKind::Universal => Specificity::zero(),
        }
    }

    /// Serialize without suppressing an implicit universal. Used for the
    /// canonical key handed to external matching engines.
    fn write_explicit(&self, out: &mut impl fmt::Write) -> fmt::Result {
        match self.kind {
            SelectorKind::Universal => out.write_str("*"),
            SelectorKind::Type => out.write_str(&self.name),
            SelectorKind::Id => write!(out, "#{}", self.name),
            SelectorKind::Class => write!(out, ".{}", self.name),
            SelectorKind::PseudoClass => match self.value {
                Some(v) => write!(out, ":{}({})", self.name, format_number(v)),
                None => write!(out, ":{}", self.name),
            },
            SelectorKind::PseudoElement => write!(out, "::{}", self.name),
        }
    }
}

impl fmt::Display for SimpleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.implicit {
            return Ok(());
        }
        self.write_explicit(f)
    }
}

/// An ordered, non-empty chain of simple selectors with no combinator,
/// e.g. `div.header#top:i(2)`.
#[derive(Debug, Clone)]
pub struct CompoundSelector {
    parts: Vec<SimpleSelector>,
    invalid: Option<String>,
    /// Memoized normalization order (indices into `parts`).
    normalized: OnceCell<Vec<usize>>,
}

impl CompoundSelector {
    /// Build a compound selector from its parts, applying the structural
    /// invariants:
    ///
    /// 1. if the first part is not a type or universal selector, an implicit
    ///    universal is prepended;
    /// 2. at most one type/universal selector may appear, and only first.
    ///
    /// Violations mark the compound invalid with a diagnostic message rather
    /// than failing; an empty part list is a programmer error and panics.
    pub fn new(parts: Vec<SimpleSelector>) -> Self {
        assert!(
            !parts.is_empty(),
            "a compound selector requires at least one simple selector"
        );
        let mut parts = parts;
        if !matches!(
            parts[0].kind(),
            SelectorKind::Type | SelectorKind::Universal
        ) {
            parts.insert(0, SimpleSelector::implicit_universal());
        }

        let mut invalid = None;
        let named = parts
            .iter()
            .filter(|p| matches!(p.kind(), SelectorKind::Type | SelectorKind::Universal))
            .count();
        if named > 1 {
            invalid = Some(
                "at most one type or universal selector is allowed in a compound selector"
                    .to_string(),
            );
        } else if parts.iter().skip(1).any(|p| {
            matches!(p.kind(), SelectorKind::Type | SelectorKind::Universal)
        }) {
            invalid = Some(
                "a type or universal selector must be the first term of a compound selector"
                    .to_string(),
            );
        }
        if invalid.is_none() {
            if let Some(bad) = parts.iter().find(|p| !p.is_valid()) {
                invalid = bad.message().map(str::to_string);
            }
        }

        Self {
            parts,
            invalid,
            normalized: OnceCell::new(),
        }
    }

    pub fn parts(&self) -> &[SimpleSelector] {
        &self.parts
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }

    pub fn message(&self) -> Option<&str> {
        self.invalid.as_deref()
    }

    /// Element-wise sum of the member specificities.
    pub fn specificity(&self) -> Specificity {
        self.parts
            .iter()
            .fold(Specificity::zero(), |acc, p| acc + p.specificity())
    }

    /// The members in canonical order: type/universal, then ids, then
    /// pseudo-classes and pseudo-elements, then classes; ties broken
    /// lexicographically by name. The order is memoized and idempotent.
    pub fn normalized(&self) -> Vec<&SimpleSelector> {
        let order = self.normalized.get_or_init(|| {
            let mut indices: Vec<usize> = (0..self.parts.len()).collect();
            indices.sort_by(|&a, &b| {
                let (pa, pb) = (&self.parts[a], &self.parts[b]);
                precedence(pa.kind())
                    .cmp(&precedence(pb.kind()))
                    .then_with(|| pa.name().cmp(pb.name()))
            });
            indices
        });
        order.iter().map(|&i| &self.parts[i]).collect()
    }

    /// Canonical textual key for external engines: the normalized members
    /// serialized with the implicit universal made explicit.
    pub fn canonical_key(&self) -> String {
        let mut out = String::new();
        for part in self.normalized() {
            part.write_explicit(&mut out).expect("writing to String");
        }
        out
    }
}

impl fmt::Display for CompoundSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Render a selector list the way it appears in rule source text.
pub fn format_selector_list(selectors: &[CompoundSelector]) -> String {
    selectors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn precedence(kind: SelectorKind) -> u8 {
    match kind {
        SelectorKind::Type | SelectorKind::Universal => 0,
        SelectorKind::Id => 1,
        SelectorKind::PseudoClass | SelectorKind::PseudoElement => 2,
        SelectorKind::Class => 3,
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> SimpleSelector {
        SimpleSelector::new(SelectorKind::Class, name, None)
    }

    fn ty(name: &str) -> SimpleSelector {
        SimpleSelector::new(SelectorKind::Type, name, None)
    }

    #[test]
    fn simple_specificities() {
        assert_eq!(
            SimpleSelector::new(SelectorKind::Id, "x", None).specificity(),
            Specificity::new(1, 0, 0)
        );
        assert_eq!(class("x").specificity(), Specificity::new(0, 1, 0));
        assert_eq!(
            SimpleSelector::new(SelectorKind::PseudoClass, "hover", None).specificity(),
            Specificity::new(0, 1, 0)
        );
        assert_eq!(ty("div").specificity(), Specificity::new(0, 0, 1));
        assert_eq!(
            SimpleSelector::new(SelectorKind::PseudoElement, "marker", None).specificity(),
            Specificity::new(0, 0, 1)
        );
        assert_eq!(SimpleSelector::universal().specificity(), Specificity::zero());
    }

    #[test]
    fn index_pseudo_class_requires_finite_number() {
        assert!(SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(3.0)).is_valid());
        assert!(!SimpleSelector::new(SelectorKind::PseudoClass, "i", None).is_valid());
        assert!(
            !SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(f64::NAN)).is_valid()
        );
        assert!(
            !SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(f64::INFINITY))
                .is_valid()
        );
    }

    #[test]
    fn compound_specificity_is_member_sum() {
        let sel = CompoundSelector::new(vec![
            ty("div"),
            SimpleSelector::new(SelectorKind::Id, "top", None),
            class("a"),
            class("b"),
        ]);
        assert_eq!(sel.specificity(), Specificity::new(1, 2, 1));
    }

    #[test]
    fn specificity_order_is_cascade_order() {
        assert!(Specificity::new(1, 0, 0) > Specificity::new(0, 9, 9));
        assert!(Specificity::new(0, 1, 0) > Specificity::new(0, 0, 9));
        assert!(Specificity::new(0, 1, 1) > Specificity::new(0, 1, 0));
    }

    #[test]
    fn implicit_universal_is_prepended_and_suppressed() {
        let sel = CompoundSelector::new(vec![class("a")]);
        assert!(sel.is_valid());
        assert_eq!(sel.parts().len(), 2);
        assert!(sel.parts()[0].is_implicit());
        assert_eq!(sel.to_string(), ".a");
        assert_eq!(sel.canonical_key(), "*.a");
    }

    #[test]
    fn type_selector_after_position_zero_is_invalid() {
        let sel = CompoundSelector::new(vec![class("a"), ty("div")]);
        assert!(!sel.is_valid());
        assert!(!sel.message().unwrap().is_empty());
    }

    #[test]
    fn two_type_selectors_are_invalid() {
        let sel = CompoundSelector::new(vec![ty("div"), ty("span")]);
        assert!(!sel.is_valid());
        let sel = CompoundSelector::new(vec![ty("div"), SimpleSelector::universal()]);
        assert!(!sel.is_valid());
    }

    #[test]
    fn invalid_member_invalidates_compound() {
        let sel = CompoundSelector::new(vec![
            ty("div"),
            SimpleSelector::new(SelectorKind::PseudoClass, "i", None),
        ]);
        assert!(!sel.is_valid());
    }

    #[test]
    #[should_panic(expected = "at least one simple selector")]
    fn empty_compound_panics() {
        let _ = CompoundSelector::new(Vec::new());
    }

    #[test]
    fn normalization_is_idempotent() {
        let sel = CompoundSelector::new(vec![
            ty("div"),
            class("zz"),
            SimpleSelector::new(SelectorKind::Id, "top", None),
            class("aa"),
            SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(1.0)),
        ]);
        let first: Vec<String> = sel.normalized().iter().map(ToString::to_string).collect();
        let second: Vec<String> = sel.normalized().iter().map(ToString::to_string).collect();
        assert_eq!(first, second);

        // Rebuilding from the normalized order must be a fixed point.
        let renorm = CompoundSelector::new(
            sel.normalized().into_iter().cloned().collect::<Vec<_>>(),
        );
        let third: Vec<String> = renorm
            .normalized()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(first, third);
    }

    #[test]
    fn canonical_key_orders_by_precedence_then_name() {
        let sel = CompoundSelector::new(vec![
            ty("div"),
            class("b"),
            class("a"),
            SimpleSelector::new(SelectorKind::Id, "x", None),
            SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(2.0)),
        ]);
        assert_eq!(sel.canonical_key(), "div#x:i(2).a.b");
    }

    #[test]
    fn display_round_trips_terms() {
        let sel = CompoundSelector::new(vec![
            ty("div"),
            class("a"),
            SimpleSelector::new(SelectorKind::PseudoClass, "i", Some(3.0)),
            SimpleSelector::new(SelectorKind::PseudoElement, "marker", None),
        ]);
        assert_eq!(sel.to_string(), "div.a:i(3)::marker");
    }
}
