//! Dotted path addressing.
//!
//! A path is a string of `.`-separated segments (`"a.b.c"`). The empty path
//! addresses the root. A `$` starts a selector suffix (`"a.b$keys"`) that
//! asks for a derived view instead of the raw value; `$` is never allowed in
//! a structural segment.

use std::fmt;

/// Separator between structural segments.
pub const SEPARATOR: char = '.';

/// Marker introducing a selector suffix.
pub const SELECTOR_MARK: char = '$';

/// Derived views that can be requested with a `$` suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Child key list.
    Keys,
    /// Type tag.
    Type,
    /// Child count.
    Size,
    /// Exact-path metadata record.
    Meta,
    /// Recursive subscription marker.
    Deep,
    /// Whole-store change feed; only meaningful on the root (`$save`).
    Save,
}

impl Selector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keys" => Some(Selector::Keys),
            "type" => Some(Selector::Type),
            "size" => Some(Selector::Size),
            "meta" => Some(Selector::Meta),
            "deep" => Some(Selector::Deep),
            "save" => Some(Selector::Save),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Selector::Keys => "keys",
            Selector::Type => "type",
            Selector::Size => "size",
            Selector::Meta => "meta",
            Selector::Deep => "deep",
            Selector::Save => "save",
        }
    }

    /// Append this selector to a structural path.
    pub fn on(&self, key: &str) -> String {
        format!("{}{}{}", key, SELECTOR_MARK, self.as_str())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SELECTOR_MARK, self.as_str())
    }
}

/// Split a path into its structural part and the raw selector suffix.
pub fn split(path: &str) -> (&str, Option<&str>) {
    match path.split_once(SELECTOR_MARK) {
        Some((key, selector)) => (key, Some(selector)),
        None => (path, None),
    }
}

/// Structural part of a path, selector stripped.
pub fn base(path: &str) -> &str {
    split(path).0
}

/// Structural segments of a key; the root has none.
pub fn segments(key: &str) -> Vec<&str> {
    if key.is_empty() {
        Vec::new()
    } else {
        key.split(SEPARATOR).collect()
    }
}

/// Number of structural segments.
pub fn depth(key: &str) -> usize {
    if key.is_empty() {
        0
    } else {
        key.split(SEPARATOR).count()
    }
}

/// Whether `path` can be the target of a write or delete: non-empty, no
/// selector mark, no empty segment.
pub fn is_writable(path: &str) -> bool {
    !path.is_empty()
        && !path.contains(SELECTOR_MARK)
        && path.split(SEPARATOR).all(|segment| !segment.is_empty())
}

/// Join a child segment onto a key (the root joins to the bare child).
pub fn join(key: &str, child: &str) -> String {
    if key.is_empty() {
        child.to_string()
    } else {
        format!("{}{}{}", key, SEPARATOR, child)
    }
}

/// Parent key, `None` for top-level keys and the root.
pub fn parent(key: &str) -> Option<&str> {
    key.rsplit_once(SEPARATOR).map(|(parent, _)| parent)
}

/// Segment-aware prefix test: `"a"` contains `"a"` and `"a.b"` but not
/// `"ab"`. The root contains everything.
pub fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    if ancestor.is_empty() || ancestor == path {
        return true;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == SEPARATOR as u8
}

/// Strict version of [`is_ancestor_or_self`].
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor != path && is_ancestor_or_self(ancestor, path)
}

/// Either path contains the other.
pub fn is_related(a: &str, b: &str) -> bool {
    is_ancestor_or_self(a, b) || is_ancestor_or_self(b, a)
}

/// Path of `path` relative to `root`; `path` must be inside `root`.
pub fn relative<'a>(root: &str, path: &'a str) -> &'a str {
    if root.is_empty() {
        path
    } else {
        path.get(root.len() + 1..).unwrap_or("")
    }
}

/// One or more paths, as accepted by the subscription calls.
///
/// Strings are split on whitespace and commas, so `"a, b.c d"` names three
/// paths. Empty entries are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathList(Vec<String>);

impl PathList {
    fn push_split(&mut self, raw: &str) {
        self.0.extend(
            raw.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|p| !p.is_empty())
                .map(str::to_string),
        );
    }

    fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = PathList::default();
        for item in items {
            list.push_split(item.as_ref());
        }
        list
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for PathList {
    fn from(raw: &str) -> Self {
        PathList::from_items([raw])
    }
}

impl From<String> for PathList {
    fn from(raw: String) -> Self {
        PathList::from_items([raw])
    }
}

impl From<&String> for PathList {
    fn from(raw: &String) -> Self {
        PathList::from_items([raw])
    }
}

impl From<Vec<String>> for PathList {
    fn from(items: Vec<String>) -> Self {
        PathList::from_items(items)
    }
}

impl From<Vec<&str>> for PathList {
    fn from(items: Vec<&str>) -> Self {
        PathList::from_items(items)
    }
}

impl From<&[&str]> for PathList {
    fn from(items: &[&str]) -> Self {
        PathList::from_items(items)
    }
}

impl<const N: usize> From<[&str; N]> for PathList {
    fn from(items: [&str; N]) -> Self {
        PathList::from_items(items)
    }
}
