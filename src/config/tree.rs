//! The hierarchical configuration tree.
//!
//! A tree is loaded from YAML. Mappings that carry a `sample_type` key are
//! sample specifications, strings written as `${...}` are expressions, other
//! mappings are internal nodes and everything else is a plain leaf.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr::Evaluator;
use crate::value::Value;

/// The kinds of sample specification the resolver understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    /// `sample_space` is returned unchanged.
    SingleValue,
    /// One element of the `sample_space` list.
    Categorical,
    /// A float in `[lo, hi]`, with optional `step` and `log` flags.
    Float,
    /// An integer in the inclusive interval `[lo, hi]`.
    Range,
}

/// A leaf sample specification `{sample_type, sample_space, default}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Name of the sampling kind, checked at resolution time.
    pub sample_type: String,
    /// Shape depends on the kind.
    #[serde(default = "null_value")]
    pub sample_space: Value,
    /// Value used when no sampler is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn null_value() -> Value {
    Value::Null
}

impl SampleSpec {
    /// Parses `sample_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedSampleKind`] for an unknown kind.
    pub fn kind(&self, path: &str) -> Result<SampleKind> {
        match self.sample_type.as_str() {
            "single_value" => Ok(SampleKind::SingleValue),
            "categorical" => Ok(SampleKind::Categorical),
            "float" => Ok(SampleKind::Float),
            "range" => Ok(SampleKind::Range),
            other => Err(Error::UnsupportedSampleKind {
                path: path.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// A node of the configuration tree.
#[derive(Clone, Debug, PartialEq)]
pub enum ParameterNode {
    /// A plain value, returned verbatim.
    Leaf(Value),
    /// A sample specification, resolved once per trial.
    Sample(SampleSpec),
    /// An expression over other resolved parameters.
    Expr(String),
    /// An internal mapping.
    Node(BTreeMap<String, ParameterNode>),
}

/// Splits a `/`-separated path into its non-empty segments.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Canonical form of a path: segments joined by `/`, no leading or trailing separator.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Body of a `${...}` leaf. `${expr}`, `${eval:expr}` and `${py:expr}` are
/// the same expression.
fn expression_body(s: &str) -> Option<&str> {
    let body = s.trim().strip_prefix("${")?.strip_suffix('}')?.trim_start();
    let code = ["eval:", "py:"]
        .iter()
        .find_map(|prefix| body.strip_prefix(prefix))
        .unwrap_or(body);
    Some(code.trim())
}

impl ParameterNode {
    fn from_yaml(value: serde_yaml::Value, path: &str) -> Result<Self> {
        match value {
            serde_yaml::Value::Mapping(map) => {
                if map.contains_key("sample_type") {
                    let spec: SampleSpec = serde_yaml::from_value(serde_yaml::Value::Mapping(map))
                        .map_err(|e| Error::InvalidSampleSpace {
                            path: path.to_string(),
                            reason: e.to_string(),
                        })?;
                    return Ok(ParameterNode::Sample(spec));
                }
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    let key = match key {
                        serde_yaml::Value::String(s) => s,
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        _ => {
                            return Err(Error::InvalidConfig(format!(
                                "non-scalar key under '{path}'"
                            )))
                        }
                    };
                    let child = ParameterNode::from_yaml(child, &join(path, &key))?;
                    children.insert(key, child);
                }
                Ok(ParameterNode::Node(children))
            }
            serde_yaml::Value::String(s) => Ok(match expression_body(&s) {
                Some(body) => ParameterNode::Expr(body.to_string()),
                None => ParameterNode::Leaf(Value::Str(s)),
            }),
            serde_yaml::Value::Tagged(tagged) => ParameterNode::from_yaml(tagged.value, path),
            other => serde_yaml::from_value(other)
                .map(ParameterNode::Leaf)
                .map_err(|e| Error::InvalidConfig(format!("'{path}': {e}"))),
        }
    }

    fn to_yaml(&self) -> Result<serde_yaml::Value> {
        match self {
            ParameterNode::Leaf(v) => yaml_of(v),
            ParameterNode::Sample(spec) => yaml_of(spec),
            ParameterNode::Expr(body) => Ok(serde_yaml::Value::String(format!("${{{body}}}"))),
            ParameterNode::Node(children) => {
                let mut map = serde_yaml::Mapping::new();
                for (k, child) in children {
                    map.insert(serde_yaml::Value::String(k.clone()), child.to_yaml()?);
                }
                Ok(serde_yaml::Value::Mapping(map))
            }
        }
    }
}

fn yaml_of<T: Serialize>(value: &T) -> Result<serde_yaml::Value> {
    serde_yaml::to_value(value).map_err(|e| Error::InvalidConfig(e.to_string()))
}

/// The root of a configuration tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterTree {
    root: BTreeMap<String, ParameterNode>,
}

impl ParameterTree {
    /// Parses a tree from YAML text. An empty document is an empty tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the text is not a YAML mapping.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        match value {
            serde_yaml::Value::Null => Ok(Self::default()),
            value @ serde_yaml::Value::Mapping(_) => match ParameterNode::from_yaml(value, "")? {
                ParameterNode::Node(root) => Ok(Self { root }),
                _ => Err(Error::InvalidConfig(
                    "the configuration root cannot be a sample specification".into(),
                )),
            },
            _ => Err(Error::InvalidConfig(
                "the configuration root must be a mapping".into(),
            )),
        }
    }

    /// Loads a tree from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`Error::InvalidConfig`] if it cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            Error::InvalidConfig(msg) => Error::InvalidConfig(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Builds the layered tree of an executable: `<exe>.yaml`, then
    /// `<exe>.tune.yaml`, then the optional override file. Missing
    /// executable and study files count as empty layers.
    ///
    /// # Errors
    ///
    /// Fails if a present layer cannot be parsed or the override file is missing.
    pub fn layered(dir: impl AsRef<Path>, exe: &str, overrides: Option<&Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut tree = Self::default();
        for name in [format!("{exe}.yaml"), format!("{exe}.tune.yaml")] {
            let path = dir.join(name);
            if path.is_file() {
                tree.merge(Self::load(&path)?);
            }
        }
        if let Some(path) = overrides {
            tree.merge(Self::load(path)?);
        }
        Ok(tree)
    }

    /// Deep-merges `other` into `self`; values from `other` win by path.
    pub fn merge(&mut self, other: ParameterTree) {
        merge_maps(&mut self.root, other.root);
    }

    /// Writes the tree as YAML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(&self.to_yaml()?)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        fs::write(path, text)?;
        Ok(())
    }

    /// The tree as a YAML value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a leaf cannot be represented.
    pub fn to_yaml(&self) -> Result<serde_yaml::Value> {
        ParameterNode::Node(self.root.clone()).to_yaml()
    }

    /// Deserializes the whole tree into a settings type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the tree does not fit `T`.
    pub fn settings<T: DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(self.to_yaml()?).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Looks up the node at `path`. The empty path is not a node.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ParameterNode> {
        let mut parts = segments(path);
        let mut node = self.root.get(parts.next()?)?;
        for part in parts {
            match node {
                ParameterNode::Node(children) => node = children.get(part)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Replaces the node at `path` with a leaf, creating intermediate mappings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if an intermediate segment is not a
    /// mapping, or [`Error::UnknownPath`] for an empty path.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let parts: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = parts.split_last() else {
            return Err(Error::UnknownPath(path.to_string()));
        };
        let mut map = &mut self.root;
        for (depth, part) in parents.iter().enumerate() {
            let entry = map
                .entry((*part).to_string())
                .or_insert_with(|| ParameterNode::Node(BTreeMap::new()));
            match entry {
                ParameterNode::Node(children) => map = children,
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "'{}' is not a mapping",
                        parents[..=depth].join("/")
                    )))
                }
            }
        }
        map.insert((*last).to_string(), ParameterNode::Leaf(value));
        Ok(())
    }

    /// Every node path in tree order, with the node.
    #[must_use]
    pub fn walk(&self) -> Vec<(String, &ParameterNode)> {
        fn visit<'a>(
            prefix: &str,
            map: &'a BTreeMap<String, ParameterNode>,
            out: &mut Vec<(String, &'a ParameterNode)>,
        ) {
            for (key, node) in map {
                let path = join(prefix, key);
                if let ParameterNode::Node(children) = node {
                    visit(&path, children, out);
                } else {
                    out.push((path, node));
                }
            }
        }
        let mut out = Vec::new();
        visit("", &self.root, &mut out);
        out
    }

    /// The paths that must be resolved to fix a trial's parameter set, in an
    /// order where every expression follows what it references: leaves
    /// referenced by expressions, then sample specifications, then
    /// expressions in dependency order. `reserved` top-level keys are skipped.
    #[must_use]
    pub fn resolution_order(&self, reserved: &[&str]) -> Vec<String> {
        let is_reserved = |p: &str| segments(p).next().is_some_and(|head| reserved.contains(&head));
        let nodes: Vec<(String, &ParameterNode)> =
            self.walk().into_iter().filter(|(p, _)| !is_reserved(p)).collect();

        let mut order: Vec<String> = Vec::new();
        let mut pending: Vec<(String, Vec<String>)> = Vec::new();
        for (path, node) in &nodes {
            match node {
                ParameterNode::Sample(_) => order.push(path.clone()),
                ParameterNode::Expr(body) => {
                    pending.push((path.clone(), Evaluator::references(body).unwrap_or_default()));
                }
                _ => {}
            }
        }

        let mut leaves: Vec<String> = Vec::new();
        for (_, refs) in &pending {
            for r in refs {
                if matches!(self.get(r), Some(ParameterNode::Leaf(_))) && !leaves.contains(r) {
                    leaves.push(r.clone());
                }
            }
        }
        leaves.extend(order);
        let mut order = leaves;

        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|(path, refs)| {
                let ready = refs.iter().all(|r| {
                    order.contains(r) || !pending_contains(&nodes, r)
                });
                if ready {
                    order.push(path.clone());
                }
                !ready
            });
            if pending.len() == before {
                order.extend(pending.drain(..).map(|(p, _)| p));
            }
        }
        order
    }
}

fn pending_contains(nodes: &[(String, &ParameterNode)], path: &str) -> bool {
    nodes
        .iter()
        .any(|(p, n)| p == path && matches!(n, ParameterNode::Expr(_)))
}

fn merge_maps(base: &mut BTreeMap<String, ParameterNode>, overlay: BTreeMap<String, ParameterNode>) {
    for (key, node) in overlay {
        match (base.get_mut(&key), node) {
            (Some(ParameterNode::Node(existing)), ParameterNode::Node(incoming)) => {
                merge_maps(existing, incoming);
            }
            (_, node) => {
                base.insert(key, node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r#"
model:
  width: 128
  depth:
    sample_type: range
    sample_space: [2, 5]
    default: 3
optim:
  total_steps: 1000
  warmup: "${0.1 * optim.total_steps}"
"#;

    #[test]
    fn classifies_nodes() {
        let tree = ParameterTree::from_yaml_str(TREE).unwrap();
        assert_eq!(tree.get("model/width"), Some(&ParameterNode::Leaf(Value::Int(128))));
        assert!(matches!(tree.get("model/depth"), Some(ParameterNode::Sample(_))));
        assert_eq!(
            tree.get("optim/warmup"),
            Some(&ParameterNode::Expr("0.1 * optim.total_steps".into()))
        );
        assert!(matches!(tree.get("model"), Some(ParameterNode::Node(_))));
        assert!(tree.get("model/width/x").is_none());
    }

    #[test]
    fn expression_prefixes_are_aliases() {
        let tree = ParameterTree::from_yaml_str(
            "a: \"${py: 2 * b}\"\nc: \"${eval:b + 1}\"\nd: \"${ py:b }\"\ne: \"$py{b}\"\n",
        )
        .unwrap();
        assert_eq!(tree.get("a"), Some(&ParameterNode::Expr("2 * b".into())));
        assert_eq!(tree.get("c"), Some(&ParameterNode::Expr("b + 1".into())));
        assert_eq!(tree.get("d"), Some(&ParameterNode::Expr("b".into())));
        assert_eq!(
            tree.get("e"),
            Some(&ParameterNode::Leaf(Value::Str("$py{b}".into())))
        );
    }

    #[test]
    fn later_layers_win() {
        let mut tree = ParameterTree::from_yaml_str(TREE).unwrap();
        tree.merge(ParameterTree::from_yaml_str("model:\n  width: 256\n").unwrap());
        assert_eq!(tree.get("model/width"), Some(&ParameterNode::Leaf(Value::Int(256))));
        assert!(matches!(tree.get("model/depth"), Some(ParameterNode::Sample(_))));
    }

    #[test]
    fn set_creates_intermediate_nodes() {
        let mut tree = ParameterTree::default();
        tree.set("a/b/c", Value::Bool(true)).unwrap();
        assert_eq!(tree.get("a/b/c"), Some(&ParameterNode::Leaf(Value::Bool(true))));
        assert!(tree.set("a/b/c/d", Value::Null).is_err());
    }

    #[test]
    fn expressions_follow_their_references() {
        let tree = ParameterTree::from_yaml_str(TREE).unwrap();
        let order = tree.resolution_order(&[]);
        assert_eq!(order, vec!["optim/total_steps", "model/depth", "optim/warmup"]);
    }

    #[test]
    fn save_then_load_is_identical() {
        let tree = ParameterTree::from_yaml_str(TREE).unwrap();
        let path = std::env::temp_dir().join(format!("hpd_tree_{}.yaml", std::process::id()));
        tree.save(&path).unwrap();
        let loaded = ParameterTree::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(tree, loaded);
    }
}
