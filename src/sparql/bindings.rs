//! RDF terms, bindings and result sets.
//!
//! A [`Bindings`] value is the result set of a SELECT-style query: a set of
//! solutions, each mapping variable names to RDF terms. Set semantics are what
//! the diffing algorithm relies on: two successive result sets are compared
//! with plain set difference over whole solutions, and two solutions are equal
//! iff they bind the same variables to terms that compare equal as RDF terms.
//!
//! Result sets serialize to and from the SPARQL 1.1 Query Results JSON format
//! (`head.vars` + `results.bindings`, term objects with `type` / `value` /
//! `datatype` / `xml:lang`).

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// A single RDF term as it appears in a query solution.
///
/// Literal equality is lexical: value, optional datatype IRI and optional
/// language tag must all match. Simple literals carry no datatype, matching
/// the SPARQL results JSON convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "TermObject", into = "TermObject")]
pub enum RdfTerm {
    /// An IRI reference.
    Iri(String),
    /// A literal with optional datatype IRI and optional language tag.
    Literal {
        value: String,
        datatype: Option<String>,
        language: Option<String>,
    },
    /// A blank node identified by its scoped label.
    Bnode(String),
}

impl RdfTerm {
    /// Convenience constructor for an IRI term.
    pub fn iri(value: &str) -> Self {
        RdfTerm::Iri(value.to_string())
    }

    /// Convenience constructor for a simple (untyped) literal.
    pub fn literal(value: &str) -> Self {
        RdfTerm::Literal { value: value.to_string(), datatype: None, language: None }
    }

    /// Convenience constructor for a typed literal.
    pub fn typed_literal(value: &str, datatype: &str) -> Self {
        RdfTerm::Literal {
            value: value.to_string(),
            datatype: Some(datatype.to_string()),
            language: None,
        }
    }
}

/// SPARQL results JSON term object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TermObject {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    datatype: Option<String>,
    #[serde(rename = "xml:lang", skip_serializing_if = "Option::is_none")]
    language: Option<String>,
}

impl TryFrom<TermObject> for RdfTerm {
    type Error = String;

    fn try_from(obj: TermObject) -> Result<Self, Self::Error> {
        match obj.kind.as_str() {
            "uri" => Ok(RdfTerm::Iri(obj.value)),
            "literal" | "typed-literal" => Ok(RdfTerm::Literal {
                value: obj.value,
                datatype: obj.datatype,
                language: obj.language,
            }),
            "bnode" => Ok(RdfTerm::Bnode(obj.value)),
            other => Err(format!("unknown term type: {}", other)),
        }
    }
}

impl From<RdfTerm> for TermObject {
    fn from(term: RdfTerm) -> Self {
        match term {
            RdfTerm::Iri(value) => {
                TermObject { kind: "uri".to_string(), value, datatype: None, language: None }
            }
            RdfTerm::Literal { value, datatype, language } => {
                TermObject { kind: "literal".to_string(), value, datatype, language }
            }
            RdfTerm::Bnode(value) => {
                TermObject { kind: "bnode".to_string(), value, datatype: None, language: None }
            }
        }
    }
}

/// One query solution: an ordered map from variable name to bound term.
///
/// The ordering makes equal bindings hash equally regardless of insertion
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(BTreeMap<String, RdfTerm>);

impl Binding {
    pub fn new() -> Self {
        Binding(BTreeMap::new())
    }

    /// Binds `variable` to `term`, replacing any previous binding.
    pub fn bind(mut self, variable: &str, term: RdfTerm) -> Self {
        self.0.insert(variable.to_string(), term);
        self
    }

    pub fn get(&self, variable: &str) -> Option<&RdfTerm> {
        self.0.get(variable)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RdfTerm)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A result set: the variable head plus a set of solutions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ResultsDocument", into = "ResultsDocument")]
pub struct Bindings {
    vars: Vec<String>,
    solutions: HashSet<Binding>,
}

impl Bindings {
    /// Creates an empty result set with the given variable head.
    pub fn new(vars: Vec<String>) -> Self {
        Bindings { vars, solutions: HashSet::new() }
    }

    /// Creates an empty result set with an empty head.
    pub fn empty() -> Self {
        Bindings::default()
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    /// Inserts a solution. Duplicates collapse.
    pub fn insert(&mut self, binding: Binding) {
        self.solutions.insert(binding);
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    pub fn contains(&self, binding: &Binding) -> bool {
        self.solutions.contains(binding)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.solutions.iter()
    }

    /// Set difference over whole solutions: the bindings present in `self`
    /// but not in `other`. The head of the receiver is kept.
    pub fn difference(&self, other: &Bindings) -> Bindings {
        Bindings {
            vars: self.vars.clone(),
            solutions: self.solutions.difference(&other.solutions).cloned().collect(),
        }
    }
}

impl FromIterator<Binding> for Bindings {
    fn from_iter<T: IntoIterator<Item = Binding>>(iter: T) -> Self {
        let solutions: HashSet<Binding> = iter.into_iter().collect();
        let mut vars: Vec<String> = solutions
            .iter()
            .flat_map(|b| b.variables().map(|v| v.to_string()))
            .collect();
        vars.sort();
        vars.dedup();
        Bindings { vars, solutions }
    }
}

/// SPARQL 1.1 Query Results JSON document shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResultsDocument {
    head: Head,
    results: SolutionList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Head {
    #[serde(default)]
    vars: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SolutionList {
    #[serde(default)]
    bindings: Vec<Binding>,
}

impl From<ResultsDocument> for Bindings {
    fn from(doc: ResultsDocument) -> Self {
        Bindings { vars: doc.head.vars, solutions: doc.results.bindings.into_iter().collect() }
    }
}

impl From<Bindings> for ResultsDocument {
    fn from(bindings: Bindings) -> Self {
        // Sorted output keeps the wire representation deterministic.
        let mut rows: Vec<Binding> = bindings.solutions.into_iter().collect();
        rows.sort();
        ResultsDocument {
            head: Head { vars: bindings.vars },
            results: SolutionList { bindings: rows },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution(var: &str, iri: &str) -> Binding {
        Binding::new().bind(var, RdfTerm::iri(iri))
    }

    #[test]
    fn test_term_equality_is_lexical() {
        let a = RdfTerm::typed_literal("1", "http://www.w3.org/2001/XMLSchema#integer");
        let b = RdfTerm::typed_literal("1", "http://www.w3.org/2001/XMLSchema#decimal");
        let c = RdfTerm::literal("1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_language_tag_distinguishes_literals() {
        let plain = RdfTerm::literal("chat");
        let tagged = RdfTerm::Literal {
            value: "chat".to_string(),
            datatype: None,
            language: Some("fr".to_string()),
        };
        assert_ne!(plain, tagged);
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut set = Bindings::new(vec!["x".to_string()]);
        set.insert(solution("x", "urn:a"));
        set.insert(solution("x", "urn:a"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_difference() {
        let mut before = Bindings::new(vec!["x".to_string()]);
        before.insert(solution("x", "urn:a"));
        before.insert(solution("x", "urn:b"));

        let mut after = Bindings::new(vec!["x".to_string()]);
        after.insert(solution("x", "urn:b"));
        after.insert(solution("x", "urn:c"));

        let added = after.difference(&before);
        let removed = before.difference(&after);

        assert_eq!(added.len(), 1);
        assert!(added.contains(&solution("x", "urn:c")));
        assert_eq!(removed.len(), 1);
        assert!(removed.contains(&solution("x", "urn:a")));
    }

    #[test]
    fn test_binding_order_does_not_matter() {
        let a = Binding::new().bind("x", RdfTerm::iri("urn:a")).bind("y", RdfTerm::literal("1"));
        let b = Binding::new().bind("y", RdfTerm::literal("1")).bind("x", RdfTerm::iri("urn:a"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_results_json_roundtrip() {
        let json = r#"{
            "head": { "vars": ["x", "v"] },
            "results": { "bindings": [
                { "x": { "type": "uri", "value": "urn:a" },
                  "v": { "type": "literal", "value": "1",
                         "datatype": "http://www.w3.org/2001/XMLSchema#integer" } },
                { "x": { "type": "bnode", "value": "b0" },
                  "v": { "type": "literal", "value": "hi", "xml:lang": "en" } }
            ] }
        }"#;

        let bindings: Bindings = serde_json::from_str(json).unwrap();
        assert_eq!(bindings.vars(), ["x", "v"]);
        assert_eq!(bindings.len(), 2);

        let out = serde_json::to_value(&bindings).unwrap();
        assert_eq!(out["head"]["vars"], serde_json::json!(["x", "v"]));
        assert_eq!(out["results"]["bindings"].as_array().unwrap().len(), 2);
    }
}
