// src/wiring.rs
//
// =============================================================================
// REPX-LAB: DEPENDENCY WIRER
// =============================================================================
//
// Turns a consumer's dependency list into its input-satisfaction table.
//
// - Implicit dependency (bare producer): every name that is both an output
//   of the producer and a declared input of the consumer becomes a mapping.
// - Explicit dependency (producer, output, input): both names must exist.
// - Inputs left unmet after the dependency list may be filled from an
//   external table (run literals, hard upstream runs, fan-out job inputs).
// - Finally every declared input must have exactly one mapping.

use crate::core::InputMapping;
use crate::error::{quoted, BuildError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// 1. DEPENDENCY EXPRESSIONS
// ============================================================================

/// One entry of a dependency list, by producer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepExpr {
    Producer(String),
    Triple {
        producer: String,
        output: String,
        input: String,
    },
}

impl DepExpr {
    pub fn producer(&self) -> &str {
        match self {
            DepExpr::Producer(p) => p,
            DepExpr::Triple { producer, .. } => producer,
        }
    }

    /// `"name"`, `[name, output, input]` or `{from, output, input}`.
    pub fn from_json(subject: &str, v: &Value) -> Result<DepExpr> {
        let bad = || {
            BuildError::definition(
                subject,
                format!("invalid dependency {v} (expected a name or [producer, output, input])"),
            )
        };
        match v {
            Value::String(s) => Ok(DepExpr::Producer(s.clone())),
            Value::Array(items) => match items.as_slice() {
                [Value::String(p)] => Ok(DepExpr::Producer(p.clone())),
                [Value::String(p), Value::String(o), Value::String(i)] => Ok(DepExpr::Triple {
                    producer: p.clone(),
                    output: o.clone(),
                    input: i.clone(),
                }),
                _ => Err(bad()),
            },
            Value::Object(map) => {
                let field = |k: &str| map.get(k).and_then(Value::as_str).map(str::to_string);
                match (field("from"), field("output"), field("input")) {
                    (Some(producer), Some(output), Some(input)) if map.len() == 3 => Ok(DepExpr::Triple {
                        producer,
                        output,
                        input,
                    }),
                    _ => Err(bad()),
                }
            }
            _ => Err(bad()),
        }
    }
}

// ============================================================================
// 2. LINKS (resolved producers)
// ============================================================================

/// A producer as seen by the wirer: how to refer to it and what it offers.
#[derive(Debug, Clone)]
pub struct Producer<'a> {
    /// For messages, e.g. `stage 'square'` or `step 'align'`.
    pub label: String,
    pub source: crate::core::InputSource,
    pub outputs: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum Link<'a> {
    Implicit(Producer<'a>),
    Explicit {
        producer: Producer<'a>,
        output: String,
        input: String,
    },
}

/// Candidate mappings for inputs that dependency wiring leaves unmet.
#[derive(Debug, Clone, Default)]
pub struct ExternalInputs {
    entries: BTreeMap<String, Vec<InputMapping>>,
}

impl ExternalInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mapping: InputMapping) {
        self.entries
            .entry(mapping.target_input.clone())
            .or_default()
            .push(mapping);
    }

    pub fn candidates(&self, input: &str) -> &[InputMapping] {
        self.entries.get(input).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<InputMapping> for ExternalInputs {
    fn from_iter<I: IntoIterator<Item = InputMapping>>(iter: I) -> Self {
        let mut ext = ExternalInputs::new();
        for m in iter {
            ext.add(m);
        }
        ext
    }
}

// ============================================================================
// 3. THE WIRER
// ============================================================================

/// Accumulates candidate mappings for one consumer.
pub struct Wiring<'a> {
    subject: String,
    inputs: &'a BTreeMap<String, Value>,
    candidates: BTreeMap<String, Vec<InputMapping>>,
}

impl<'a> Wiring<'a> {
    pub fn new(subject: impl Into<String>, inputs: &'a BTreeMap<String, Value>) -> Self {
        Self {
            subject: subject.into(),
            inputs,
            candidates: BTreeMap::new(),
        }
    }

    pub fn link(&mut self, link: &Link<'_>) -> Result<()> {
        match link {
            Link::Implicit(producer) => {
                let mut matched = 0;
                for name in producer.outputs.keys() {
                    if self.inputs.contains_key(name) {
                        self.push(InputMapping::new(producer.source.clone(), Some(name.clone()), name));
                        matched += 1;
                    }
                }
                if matched == 0 {
                    log::warn!(
                        "{}: dependency on {} provides none of its inputs",
                        self.subject,
                        producer.label
                    );
                }
                Ok(())
            }
            Link::Explicit {
                producer,
                output,
                input,
            } => {
                if !producer.outputs.contains_key(output) {
                    return Err(BuildError::wiring(
                        &self.subject,
                        format!(
                            "{} has no output '{}' (outputs: {})",
                            producer.label,
                            output,
                            quoted(producer.outputs.keys())
                        ),
                    ));
                }
                if !self.inputs.contains_key(input) {
                    return Err(BuildError::wiring(
                        &self.subject,
                        format!(
                            "no declared input '{}' to receive {} output '{}' (inputs: {})",
                            input,
                            producer.label,
                            output,
                            quoted(self.inputs.keys())
                        ),
                    ));
                }
                self.push(InputMapping::new(producer.source.clone(), Some(output.clone()), input));
                Ok(())
            }
        }
    }

    /// Declared inputs with no candidate yet.
    pub fn unmet(&self) -> Vec<String> {
        self.inputs
            .keys()
            .filter(|name| self.candidates.get(*name).map_or(true, Vec::is_empty))
            .cloned()
            .collect()
    }

    /// Offers every external candidate for each still-unmet input.
    pub fn fill_from(&mut self, external: &ExternalInputs) {
        for name in self.unmet() {
            for m in external.candidates(&name) {
                self.push(m.clone());
            }
        }
    }

    pub fn push(&mut self, mapping: InputMapping) {
        self.candidates
            .entry(mapping.target_input.clone())
            .or_default()
            .push(mapping);
    }

    /// Checks the exactly-one rule and returns the mappings by input name.
    pub fn finish(self) -> Result<Vec<InputMapping>> {
        let ambiguous: Vec<String> = self
            .candidates
            .iter()
            .filter(|(_, c)| c.len() > 1)
            .map(|(name, c)| {
                let sources: Vec<String> = c.iter().map(InputMapping::describe).collect();
                format!("'{}' <- [{}]", name, sources.join("; "))
            })
            .collect();
        if !ambiguous.is_empty() {
            return Err(BuildError::wiring(
                &self.subject,
                format!("ambiguous input mapping(s): {}", ambiguous.join(", ")),
            ));
        }

        let unmet = self.unmet();
        if !unmet.is_empty() {
            return Err(BuildError::wiring(
                &self.subject,
                format!("unmet input(s) {}", quoted(&unmet)),
            ));
        }

        Ok(self
            .candidates
            .into_values()
            .filter_map(|mut c| c.pop())
            .collect())
    }
}

/// Full pipeline wiring of one consumer: dependency links, then the
/// external table for whatever is still unmet, then the exactly-one check.
/// Runs even with an empty link list.
pub fn wire(
    subject: &str,
    inputs: &BTreeMap<String, Value>,
    links: &[Link<'_>],
    external: &ExternalInputs,
) -> Result<Vec<InputMapping>> {
    let mut wiring = Wiring::new(subject, inputs);
    for link in links {
        wiring.link(link)?;
    }
    wiring.fill_from(external);
    wiring.finish()
}
