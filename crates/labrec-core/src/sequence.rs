//! Procedure sequences: nested parameter sweeps expanded into one parameter
//! map per procedure step.
//!
//! A sequence is a tree of `name: value` nodes. Every root-to-leaf path is one
//! step template; list values along a path are expanded into their cartesian
//! product, with the first list-valued parameter as the outermost loop. Each
//! resulting map is what a producer passes to `begin_record`.

use crate::value::{CellValue, ValueMap};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

const LEVEL_SEPARATOR: &str = ": ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceValue {
    List(Vec<CellValue>),
    Scalar(CellValue),
}

impl SequenceValue {
    /// Casts a plaintext value: numbers become floats, `[a, b]` becomes a list,
    /// anything else stays text.
    pub fn typecast(input: &str) -> Self {
        let trimmed = input.trim();
        if let Some(inner) = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let items = inner
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(typecast_scalar)
                .collect();
            return SequenceValue::List(items);
        }
        SequenceValue::Scalar(typecast_scalar(trimmed))
    }

    fn render(&self) -> String {
        match self {
            SequenceValue::Scalar(value) => value.to_string(),
            SequenceValue::List(values) => {
                let items = values.iter().map(ToString::to_string).collect::<Vec<_>>();
                format!("[{}]", items.join(", "))
            }
        }
    }
}

fn typecast_scalar(input: &str) -> CellValue {
    match input.parse::<f64>() {
        Ok(value) => CellValue::Float(value),
        Err(_) => CellValue::Text(input.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceNode {
    pub name: String,
    pub value: SequenceValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SequenceNode>,
}

impl SequenceNode {
    pub fn new(name: impl Into<String>, value: SequenceValue) -> Self {
        Self {
            name: name.into(),
            value,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: SequenceNode) -> Self {
        self.children.push(child);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSequence {
    #[serde(default)]
    pub nodes: Vec<SequenceNode>,
}

impl ProcedureSequence {
    pub fn new(nodes: Vec<SequenceNode>) -> Self {
        Self { nodes }
    }

    /// Expands the tree into one parameter map per procedure step, in
    /// execution order. An empty sequence is a single standalone run.
    pub fn steps(&self) -> Vec<ValueMap> {
        let mut templates = Vec::new();
        collect_paths(&self.nodes, &mut Vec::new(), &mut templates);

        let mut steps = Vec::new();
        for template in templates {
            let mut combos: Vec<ValueMap> = vec![ValueMap::new()];
            for (name, value) in template {
                combos = match value {
                    SequenceValue::Scalar(scalar) => combos
                        .into_iter()
                        .map(|mut combo| {
                            combo.insert(name.clone(), scalar.clone());
                            combo
                        })
                        .collect(),
                    SequenceValue::List(values) => {
                        let name = &name;
                        combos
                            .into_iter()
                            .flat_map(|combo| {
                                values.iter().map(move |value| {
                                    let mut combo = combo.clone();
                                    combo.insert(name.clone(), value.clone());
                                    combo
                                })
                            })
                            .collect()
                    }
                };
            }
            steps.extend(combos);
        }
        steps
    }

    /// Readable form: one `index: name: value` line per node, indented with a
    /// tab per tree level.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        write_nodes(&self.nodes, 0, &mut out);
        out
    }

    pub fn parse_text(input: &str) -> Result<Self, SequenceError> {
        let mut roots: Vec<SequenceNode> = Vec::new();
        // Path of child positions from a root to the most recent node.
        let mut path: Vec<usize> = Vec::new();

        for (line_no, raw_line) in input.lines().enumerate() {
            if raw_line.trim().is_empty() {
                continue;
            }
            let line = line_no + 1;
            let depth = raw_line.chars().take_while(|ch| *ch == '\t').count();
            if depth > path.len() {
                return Err(SequenceError::Parse {
                    line,
                    reason: format!(
                        "indented {depth} levels but the previous node is at level {}",
                        path.len().saturating_sub(1)
                    ),
                });
            }
            let mut parts = raw_line.trim().splitn(3, ':');
            let _position = parts.next();
            let name = parts.next().map(str::trim).unwrap_or_default();
            let value = parts
                .next()
                .map(str::trim)
                .ok_or_else(|| SequenceError::Parse {
                    line,
                    reason: "expected 'index: name: value'".to_string(),
                })?;
            if name.is_empty() {
                return Err(SequenceError::Parse {
                    line,
                    reason: "parameter name is empty".to_string(),
                });
            }

            path.truncate(depth);
            let node = SequenceNode::new(name, SequenceValue::typecast(value));
            let siblings = children_at(&mut roots, &path);
            siblings.push(node);
            path.push(siblings.len() - 1);
        }

        Ok(Self { nodes: roots })
    }
}

fn children_at<'a>(roots: &'a mut Vec<SequenceNode>, path: &[usize]) -> &'a mut Vec<SequenceNode> {
    let mut siblings = roots;
    for position in path {
        siblings = &mut siblings[*position].children;
    }
    siblings
}

fn collect_paths(
    nodes: &[SequenceNode],
    path: &mut Vec<(String, SequenceValue)>,
    out: &mut Vec<Vec<(String, SequenceValue)>>,
) {
    if nodes.is_empty() {
        out.push(path.clone());
        return;
    }
    for node in nodes {
        let previous = path.iter().position(|(name, _)| *name == node.name);
        match previous {
            Some(position) => {
                let replaced = std::mem::replace(&mut path[position].1, node.value.clone());
                collect_paths(&node.children, path, out);
                path[position].1 = replaced;
            }
            None => {
                path.push((node.name.clone(), node.value.clone()));
                collect_paths(&node.children, path, out);
                path.pop();
            }
        }
    }
}

fn write_nodes(nodes: &[SequenceNode], depth: usize, out: &mut String) {
    for (position, node) in nodes.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}{position}{LEVEL_SEPARATOR}{}{LEVEL_SEPARATOR}{}",
            "\t".repeat(depth),
            node.name,
            node.value.render()
        );
        write_nodes(&node.children, depth + 1, out);
    }
}
