//! Projection of decoded records onto a list of field paths
//!
//! A projection expression is a comma-separated list of document paths such as
//! `Artist, metadata[0].Age, #tst[4].#n`. Each path is a sequence of segments,
//! each either a bare attribute name or `name[index]`.
//!
//! Alias tokens (`#name`) are resolved through the expression attribute map
//! supplied with the table. When no map is supplied, reserved words and names
//! that are not plain identifiers are aliased automatically so the expression
//! can be sent to a scan request as-is.
//!
//! Applying a projection is a pure function of `(record, paths)`: paths are
//! put in canonical order before they are applied, so the order in which they
//! were written never changes the result.

use crate::error::{DynamoError, Result};
use crate::reserved::is_reserved;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Message for an expression attribute map that is not a JSON object
pub const INVALID_ALIAS_JSON: &str =
    "Invalid JSON format. The expression attributes should contain a valid JSON format.";

/// One path segment: an attribute name with an optional list index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    pub name: String,
    pub index: Option<usize>,
}

impl Segment {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }

    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index: Some(index),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.name, index),
            None => f.write_str(&self.name),
        }
    }
}

/// A document path
pub type Path = Vec<Segment>;

/// What to do when an intermediate map of a nested path is missing from the
/// source record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingParent {
    /// Leave an empty map: `metadata.inner` on `{}` gives `{"metadata": {}}`
    #[default]
    EmptyMap,
    /// Descend anyway and write a null leaf: `{"metadata": {"inner": null}}`
    NullLeaf,
}

/// A parsed, validated projection
#[derive(Debug, Clone)]
pub struct Projection {
    paths: Vec<Path>,
    expression: String,
    attribute_names: BTreeMap<String, String>,
    missing_parent: MissingParent,
}

impl Projection {
    /// Parse a projection expression and its optional expression attribute map
    /// (a JSON object string mapping `#alias` to attribute name).
    ///
    /// With a map, the expression and the map are forwarded to the store
    /// verbatim. Without one, aliases are generated where needed.
    pub fn parse(expression: &str, expression_attributes: Option<&str>) -> Result<Self> {
        let raw = parse_expression(expression)?;

        let supplied = expression_attributes
            .map(str::trim)
            .filter(|json| !json.is_empty());

        let (mut paths, expression, attribute_names) = match supplied {
            Some(json) => {
                let aliases = parse_alias_map(json)?;
                let paths = resolve_aliases(&raw, &aliases)?;
                (paths, expression.trim().to_string(), aliases)
            }
            None => auto_alias(&raw)?,
        };

        paths.sort();
        paths.dedup();
        validate_paths(&paths)?;

        Ok(Self {
            paths,
            expression,
            attribute_names,
            missing_parent: MissingParent::default(),
        })
    }

    /// Choose the missing-parent policy used by [`Projection::apply`]
    pub fn with_missing_parent(mut self, policy: MissingParent) -> Self {
        self.missing_parent = policy;
        self
    }

    /// Resolved paths in canonical order
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Expression to send with a scan request
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Alias map to send with a scan request, if any alias is in play
    pub fn attribute_names(&self) -> Option<&BTreeMap<String, String>> {
        if self.attribute_names.is_empty() {
            None
        } else {
            Some(&self.attribute_names)
        }
    }

    pub fn missing_parent(&self) -> MissingParent {
        self.missing_parent
    }

    /// Reduce a decoded record to the projected paths
    pub fn apply(&self, record: &Value) -> Value {
        apply(record, &self.paths, self.missing_parent)
    }
}

/// Reduce `record` to `paths`.
///
/// - a missing leaf is written as null
/// - an indexed leaf always creates its list, appending only elements that exist
/// - an indexed parent creates a one-element list of maps and descends only when
///   the source list has that index
/// - a missing non-indexed parent follows `policy`
pub fn apply(record: &Value, paths: &[Path], policy: MissingParent) -> Value {
    let mut ordered: Vec<&Path> = paths.iter().collect();
    ordered.sort();
    ordered.dedup();

    let mut output = Map::new();
    for path in ordered {
        project_path(Some(record), path, &mut output, policy);
    }
    Value::Object(output)
}

fn project_path(
    source: Option<&Value>,
    path: &[Segment],
    output: &mut Map<String, Value>,
    policy: MissingParent,
) {
    let Some((segment, rest)) = path.split_first() else {
        return;
    };
    let child = source.and_then(|s| s.get(segment.name.as_str()));

    match (segment.index, rest.is_empty()) {
        (None, true) => {
            output.insert(segment.name.clone(), child.cloned().unwrap_or(Value::Null));
        }
        (Some(index), true) => {
            if let Some(list) = ensure_array(output, &segment.name) {
                if let Some(element) = child.and_then(|c| c.get(index)) {
                    list.push(element.clone());
                }
            }
        }
        (None, false) => {
            let descend = match (child.filter(|c| c.is_object()), policy) {
                (Some(present), _) => Some(Some(present)),
                (None, MissingParent::NullLeaf) => Some(None),
                (None, MissingParent::EmptyMap) => None,
            };
            if let Some(nested) = ensure_object(output, &segment.name) {
                if let Some(next) = descend {
                    project_path(next, rest, nested, policy);
                }
            }
        }
        (Some(index), false) => {
            let element = child
                .and_then(|c| c.get(index))
                .filter(|e| e.is_object());
            if let Some(list) = ensure_array(output, &segment.name) {
                if list.is_empty() {
                    list.push(Value::Object(Map::new()));
                }
                if let (Some(element), Some(Value::Object(nested))) = (element, list.first_mut()) {
                    project_path(Some(element), rest, nested, policy);
                }
            }
        }
    }
}

// null counts as absent, so a container replaces it
fn ensure_array<'a>(output: &'a mut Map<String, Value>, name: &str) -> Option<&'a mut Vec<Value>> {
    let slot = output.entry(name.to_string()).or_insert(Value::Null);
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
}

fn ensure_object<'a>(
    output: &'a mut Map<String, Value>,
    name: &str,
) -> Option<&'a mut Map<String, Value>> {
    let slot = output.entry(name.to_string()).or_insert(Value::Null);
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
}

/// Parse a path of real attribute names (`a.b[1].c`), without alias handling
pub fn parse_path(text: &str) -> Result<Path> {
    let raw = parse_term(text.trim(), text)?;
    Ok(raw
        .into_iter()
        .map(|segment| Segment {
            name: segment.token,
            index: segment.index,
        })
        .collect())
}

/// Render a path back to expression syntax
pub fn render_path(path: &[Segment]) -> String {
    path.iter()
        .map(Segment::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

struct RawSegment {
    token: String,
    index: Option<usize>,
}

fn parse_expression(expression: &str) -> Result<Vec<Vec<RawSegment>>> {
    if expression.trim().is_empty() {
        return Err(DynamoError::config("projection expression is empty"));
    }
    expression
        .split(',')
        .map(|term| parse_term(term.trim(), expression))
        .collect()
}

fn parse_term(term: &str, expression: &str) -> Result<Vec<RawSegment>> {
    if term.is_empty() {
        return Err(DynamoError::config(format!(
            "projection '{expression}' contains an empty path"
        )));
    }
    term.split('.')
        .map(|segment| parse_segment(segment.trim(), term))
        .collect()
}

fn parse_segment(text: &str, term: &str) -> Result<RawSegment> {
    let malformed = || DynamoError::config(format!("malformed projection path '{term}'"));

    let (name, index) = match text.split_once('[') {
        None => (text, None),
        Some((name, rest)) => {
            let digits = rest.strip_suffix(']').ok_or_else(malformed)?;
            let index = digits.trim().parse::<usize>().map_err(|_| malformed())?;
            (name.trim(), Some(index))
        }
    };

    if name.is_empty() || name.contains(']') || name.contains(char::is_whitespace) {
        return Err(malformed());
    }

    Ok(RawSegment {
        token: name.to_string(),
        index,
    })
}

fn parse_alias_map(json: &str) -> Result<BTreeMap<String, String>> {
    let value: Value =
        serde_json::from_str(json).map_err(|_| DynamoError::config(INVALID_ALIAS_JSON))?;
    let Value::Object(entries) = value else {
        return Err(DynamoError::config(INVALID_ALIAS_JSON));
    };

    let mut aliases = BTreeMap::new();
    for (alias, name) in entries {
        if !alias.starts_with('#') || alias.len() < 2 {
            return Err(DynamoError::config(format!(
                "expression attribute '{alias}' must start with '#'"
            )));
        }
        let Value::String(name) = name else {
            return Err(DynamoError::config(format!(
                "expression attribute '{alias}' must map to an attribute name"
            )));
        };
        aliases.insert(alias, name);
    }
    Ok(aliases)
}

fn resolve_aliases(
    raw: &[Vec<RawSegment>],
    aliases: &BTreeMap<String, String>,
) -> Result<Vec<Path>> {
    let mut used = HashSet::new();
    let mut paths = Vec::with_capacity(raw.len());

    for raw_path in raw {
        let mut path = Vec::with_capacity(raw_path.len());
        for segment in raw_path {
            let name = if segment.token.starts_with('#') {
                let name = aliases.get(&segment.token).ok_or_else(|| {
                    DynamoError::config(format!(
                        "alias '{}' is not defined in the expression attributes",
                        segment.token
                    ))
                })?;
                used.insert(segment.token.as_str());
                name.clone()
            } else {
                segment.token.clone()
            };
            path.push(Segment {
                name,
                index: segment.index,
            });
        }
        paths.push(path);
    }

    if let Some(unused) = aliases.keys().find(|alias| !used.contains(alias.as_str())) {
        return Err(DynamoError::config(format!(
            "alias '{unused}' is defined in the expression attributes but not used in the projection"
        )));
    }

    Ok(paths)
}

type Aliased = (Vec<Path>, String, BTreeMap<String, String>);

fn auto_alias(raw: &[Vec<RawSegment>]) -> Result<Aliased> {
    let mut by_name: BTreeMap<String, String> = BTreeMap::new();
    let mut by_token: BTreeMap<String, String> = BTreeMap::new();
    let mut paths = Vec::with_capacity(raw.len());
    let mut terms = Vec::with_capacity(raw.len());

    for raw_path in raw {
        let mut path = Vec::with_capacity(raw_path.len());
        let mut parts = Vec::with_capacity(raw_path.len());
        for segment in raw_path {
            if segment.token.starts_with('#') {
                return Err(DynamoError::config(format!(
                    "alias '{}' is not defined, no expression attributes were provided",
                    segment.token
                )));
            }
            let rendered = if needs_alias(&segment.token) {
                alias_for(&segment.token, &mut by_name, &mut by_token)
            } else {
                segment.token.clone()
            };
            parts.push(match segment.index {
                Some(index) => format!("{rendered}[{index}]"),
                None => rendered,
            });
            path.push(Segment {
                name: segment.token.clone(),
                index: segment.index,
            });
        }
        terms.push(parts.join("."));
        paths.push(path);
    }

    Ok((paths, terms.join(","), by_token))
}

fn needs_alias(name: &str) -> bool {
    is_reserved(name) || !is_identifier(name)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn alias_for(
    name: &str,
    by_name: &mut BTreeMap<String, String>,
    by_token: &mut BTreeMap<String, String>,
) -> String {
    if let Some(token) = by_name.get(name) {
        return token.clone();
    }

    let base: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let mut token = format!("#{base}");
    let mut suffix = 1;
    while by_token.contains_key(&token) {
        suffix += 1;
        token = format!("#{base}{suffix}");
    }

    by_name.insert(name.to_string(), token.clone());
    by_token.insert(token.clone(), name.to_string());
    token
}

// expects sorted, deduplicated paths
fn validate_paths(paths: &[Path]) -> Result<()> {
    for (i, a) in paths.iter().enumerate() {
        for b in &paths[i + 1..] {
            check_pair(a, b)?;
        }
    }
    Ok(())
}

fn check_pair(a: &[Segment], b: &[Segment]) -> Result<()> {
    for (depth, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if x == y {
            continue;
        }
        if x.name != y.name {
            return Ok(());
        }
        let both_indexed_leaves = x.index.is_some()
            && y.index.is_some()
            && depth + 1 == a.len()
            && depth + 1 == b.len();
        if both_indexed_leaves {
            return Ok(());
        }
        return Err(DynamoError::config(format!(
            "projection paths '{}' and '{}' select conflicting parts of '{}'",
            render_path(a),
            render_path(b),
            x.name
        )));
    }

    Err(DynamoError::config(format!(
        "projection paths '{}' and '{}' overlap",
        render_path(a),
        render_path(b)
    )))
}
