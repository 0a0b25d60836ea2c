//! Continuous query model: a SELECT over a single named graph block whose
//! triple patterns are matched one after the other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::Node;
use crate::overlay::coordinate::{semantic_element, Constraints, Interval};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermPattern {
    Variable(String),
    Constant(Node),
}

impl TermPattern {
    pub fn variable(name: impl Into<String>) -> Self {
        TermPattern::Variable(name.into())
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self {
            TermPattern::Variable(name) => Some(name),
            TermPattern::Constant(_) => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Node> {
        match self {
            TermPattern::Variable(_) => None,
            TermPattern::Constant(node) => Some(node),
        }
    }

    /// Replace a bound variable by its value.
    pub fn substitute(&self, values: &BTreeMap<String, Node>) -> Self {
        match self {
            TermPattern::Variable(name) => values
                .get(name)
                .map_or_else(|| self.clone(), |node| TermPattern::Constant(node.clone())),
            TermPattern::Constant(_) => self.clone(),
        }
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermPattern::Variable(name) => write!(f, "?{}", name),
            TermPattern::Constant(node) => write!(f, "{}", node),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: TermPattern,
    pub predicate: TermPattern,
    pub object: TermPattern,
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// One quadruple pattern: a triple pattern together with its graph pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomicQuery {
    pub graph: TermPattern,
    pub subject: TermPattern,
    pub predicate: TermPattern,
    pub object: TermPattern,
}

impl AtomicQuery {
    pub fn new(
        graph: TermPattern,
        subject: TermPattern,
        predicate: TermPattern,
        object: TermPattern,
    ) -> Self {
        Self { graph, subject, predicate, object }
    }

    /// Components in coordinate order: graph, subject, predicate, object.
    pub fn components(&self) -> [&TermPattern; 4] {
        [&self.graph, &self.subject, &self.predicate, &self.object]
    }

    /// Variable names in order of first appearance.
    pub fn vars(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for name in self.components().iter().filter_map(|t| t.as_variable()) {
            if !vars.contains(&name) {
                vars.push(name);
            }
        }
        vars
    }

    /// Anycast constraints reaching every zone that may hold a matching fact.
    pub fn constraints(&self) -> Constraints {
        Constraints::new(
            self.components()
                .iter()
                .map(|term| term.as_constant().map(|node| Interval::exact(semantic_element(node))))
                .collect(),
        )
    }
}

impl fmt::Display for AtomicQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {} {})", self.graph, self.subject, self.predicate, self.object)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub result_vars: Vec<String>,
    pub graph: TermPattern,
    pub patterns: Vec<TriplePattern>,
}

impl ContinuousQuery {
    pub fn atomic_queries(&self) -> Vec<AtomicQuery> {
        self.patterns
            .iter()
            .map(|p| {
                AtomicQuery::new(
                    self.graph.clone(),
                    p.subject.clone(),
                    p.predicate.clone(),
                    p.object.clone(),
                )
            })
            .collect()
    }

    /// Drop the first pattern and replace bound variables everywhere else.
    /// Result variables are kept as declared.
    pub fn without_first_pattern(&self, values: &BTreeMap<String, Node>) -> Self {
        let patterns = self
            .patterns
            .iter()
            .skip(1)
            .map(|p| TriplePattern {
                subject: p.subject.substitute(values),
                predicate: p.predicate.substitute(values),
                object: p.object.substitute(values),
            })
            .collect();
        Self {
            result_vars: self.result_vars.clone(),
            graph: self.graph.substitute(values),
            patterns,
        }
    }
}

impl fmt::Display for ContinuousQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars: Vec<String> = self.result_vars.iter().map(|v| format!("?{}", v)).collect();
        let patterns: Vec<String> = self.patterns.iter().map(ToString::to_string).collect();
        write!(
            f,
            "SELECT {} WHERE {{ GRAPH {} {{ {} }} }}",
            vars.join(" "),
            self.graph,
            patterns.join(" . ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_only_on_constants() {
        let query = AtomicQuery::new(
            TermPattern::variable("g"),
            TermPattern::Constant(Node::iri("http://ex.org/s")),
            TermPattern::variable("p"),
            TermPattern::variable("g"),
        );
        let constraints = query.constraints();
        assert!(constraints.interval(0).is_none());
        assert!(constraints.interval(1).is_some());
        assert_eq!(query.vars(), vec!["g", "p"]);
    }
}
