//! Append-only fact base filled by the analyzer and consulted by the
//! rewrite passes.
//!
//! Absence is always "unknown", never "false": a query that finds no
//! fact means the pass must decline, not that the property fails.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;

use crate::tree::{NodeId, Value};

/// Stable identity of one fact, referenced by rewrite records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactId(pub u32);

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Identity of one scope. Scope 0 is always the module scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

pub const MODULE_SCOPE: ScopeId = ScopeId(0);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What a fact is about: a named binding in a scope, or a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactSubject {
    Binding { scope: ScopeId, name: String },
    Node(NodeId),
}

impl fmt::Display for FactSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactSubject::Binding { scope, name } => write!(f, "{}:{}", scope, name),
            FactSubject::Node(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactKind {
    /// The binding is assigned exactly once, to this value.
    ConstantValue(Value),
    /// Evaluating the node has no observable side effects.
    Pure,
    /// Every value the binding takes lies in this inclusive range.
    RangeBounds { lo: i64, hi: i64 },
    /// The binding's value always has this type.
    TypeKnown(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub id: FactId,
    pub subject: FactSubject,
    pub kind: FactKind,
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FactKind::ConstantValue(v) => write!(f, "{}: {} is constant {}", self.id, self.subject, v),
            FactKind::Pure => write!(f, "{}: {} is pure", self.id, self.subject),
            FactKind::RangeBounds { lo, hi } => {
                write!(f, "{}: {} in [{}, {}]", self.id, self.subject, lo, hi)
            }
            FactKind::TypeKnown(t) => write!(f, "{}: {} has type {}", self.id, self.subject, t),
        }
    }
}

#[derive(Debug, Default)]
pub struct FactBase {
    facts: Vec<Fact>,
    by_binding: HashMap<(ScopeId, String), SmallVec<[FactId; 4]>>,
    by_node: HashMap<NodeId, SmallVec<[FactId; 4]>>,
}

impl FactBase {
    pub fn new() -> FactBase {
        FactBase::default()
    }

    /// Record a fact, deduplicating exact repeats.
    pub fn add(&mut self, subject: FactSubject, kind: FactKind) -> FactId {
        let existing = match &subject {
            FactSubject::Binding { scope, name } => {
                self.by_binding.get(&(*scope, name.clone()))
            }
            FactSubject::Node(id) => self.by_node.get(id),
        };
        if let Some(ids) = existing {
            for &id in ids {
                if self.facts[id.0 as usize].kind == kind {
                    return id;
                }
            }
        }
        let id = FactId(self.facts.len() as u32);
        match &subject {
            FactSubject::Binding { scope, name } => {
                self.by_binding
                    .entry((*scope, name.clone()))
                    .or_default()
                    .push(id);
            }
            FactSubject::Node(node) => {
                self.by_node.entry(*node).or_default().push(id);
            }
        }
        self.facts.push(Fact { id, subject, kind });
        id
    }

    pub fn get(&self, id: FactId) -> &Fact {
        &self.facts[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter()
    }

    fn binding_facts(&self, scope: ScopeId, name: &str) -> &[FactId] {
        self.by_binding
            .get(&(scope, name.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn constant_of(&self, scope: ScopeId, name: &str) -> Option<(FactId, &Value)> {
        self.binding_facts(scope, name).iter().find_map(|&id| {
            match &self.facts[id.0 as usize].kind {
                FactKind::ConstantValue(v) => Some((id, v)),
                _ => None,
            }
        })
    }

    pub fn range_of(&self, scope: ScopeId, name: &str) -> Option<(FactId, i64, i64)> {
        self.binding_facts(scope, name).iter().find_map(|&id| {
            match &self.facts[id.0 as usize].kind {
                FactKind::RangeBounds { lo, hi } => Some((id, *lo, *hi)),
                _ => None,
            }
        })
    }

    pub fn type_of(&self, scope: ScopeId, name: &str) -> Option<(FactId, &'static str)> {
        self.binding_facts(scope, name).iter().find_map(|&id| {
            match &self.facts[id.0 as usize].kind {
                FactKind::TypeKnown(t) => Some((id, *t)),
                FactKind::ConstantValue(v) => Some((id, v.type_name())),
                _ => None,
            }
        })
    }

    /// The purity fact on a node, if the analyzer proved one.
    pub fn pure_fact(&self, node: NodeId) -> Option<FactId> {
        self.by_node.get(&node).and_then(|ids| {
            ids.iter()
                .find(|&&id| matches!(self.facts[id.0 as usize].kind, FactKind::Pure))
                .copied()
        })
    }
}
