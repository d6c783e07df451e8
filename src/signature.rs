//! Schema propagation and canonical operator signatures.
//!
//! Two collaborator interfaces of the update phase live here:
//!
//! - [`infer_schemas`] annotates every operator of a DAG with input and
//!   output schemas, starting from the source catalog and propagating toward
//!   the sinks (the type-inference collaborator).
//! - [`SignatureInference`] derives a canonical logical signature per
//!   operator; signature-based merger rules compare these instead of raw
//!   operator trees. [`CanonicalSignatureInference`] is the deterministic
//!   implementation shipped with the crate: it builds sink-to-source
//!   canonical strings in which commutative inputs are sorted, so two
//!   semantically identical plans produce identical signatures regardless of
//!   construction order.
//!
//! A signature that cannot be derived is an explicit [`SignatureError`];
//! the update phase rejects the batch rather than degrade to another rule.

use crate::catalog::SourceCatalog;
use crate::error::{SignatureError, UpdateError};
use crate::operator::{OperatorDag, OperatorId, OperatorKind};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical logical signature of one operator (sink-to-source form).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuerySignature(String);

impl QuerySignature {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Map of per-operator signatures for one DAG.
pub type SignatureMap = BTreeMap<OperatorId, QuerySignature>;

/// The signature-inference collaborator consumed by the merger.
pub trait SignatureInference: Send + Sync {
    /// Derive one signature per live operator.
    ///
    /// # Errors
    ///
    /// Implementations must report incomplete signatures as an error rather
    /// than returning a partial map.
    fn infer(&self, dag: &OperatorDag) -> Result<SignatureMap, SignatureError>;
}

/// Deterministic canonical-string signature inference.
#[derive(Clone, Copy, Debug, Default)]
pub struct CanonicalSignatureInference;

impl SignatureInference for CanonicalSignatureInference {
    fn infer(&self, dag: &OperatorDag) -> Result<SignatureMap, SignatureError> {
        dag.validate().map_err(SignatureError)?;
        let mut signatures = SignatureMap::new();
        for id in dag.topo_order() {
            let node = dag
                .get(id)
                .ok_or_else(|| SignatureError(format!("missing operator {id}")))?;
            let live_upstream = node
                .upstream()
                .iter()
                .filter(|up| {
                    dag.get(**up)
                        .is_some_and(|n| n.state != crate::operator::OperatorState::Removed)
                })
                .count();
            let mut inputs: Vec<&str> = node
                .upstream()
                .iter()
                .filter_map(|up| signatures.get(up).map(QuerySignature::as_str))
                .collect();
            if inputs.len() != live_upstream {
                return Err(SignatureError(format!(
                    "upstream signature missing below {id}"
                )));
            }
            // Commutative inputs are sorted so construction order is erased.
            inputs.sort_unstable();
            let joined = inputs.join(",");
            let sig = match &node.kind {
                OperatorKind::Source { logical_source } => format!("source({logical_source})"),
                OperatorKind::Filter { predicate } => format!("filter({predicate})|{joined}"),
                OperatorKind::Map { expr } => format!("map({expr})|{joined}"),
                OperatorKind::Projection { fields } => {
                    if fields.is_empty() {
                        format!("project(*)|{joined}")
                    } else {
                        format!("project({})|{joined}", fields.join(","))
                    }
                }
                OperatorKind::Union => format!("union[{joined}]"),
                OperatorKind::Join {
                    left_key,
                    right_key,
                } => format!("join({left_key}={right_key})[{joined}]"),
                OperatorKind::Sink { .. } => format!("sink|{joined}"),
            };
            signatures.insert(id, QuerySignature(sig));
        }
        Ok(signatures)
    }
}

/// Propagate schemas from the source catalog to the sinks, annotating every
/// operator's input and output schema in place.
///
/// # Errors
///
/// Fails with [`UpdateError::UnknownSource`] for unregistered logical
/// sources and [`UpdateError::SchemaMismatch`] when an operator references
/// missing fields or union inputs do not unify.
pub fn infer_schemas(dag: &mut OperatorDag, sources: &SourceCatalog) -> Result<(), UpdateError> {
    for id in dag.topo_order() {
        let upstream: Vec<OperatorId> = dag
            .get(id)
            .map(|n| n.upstream().iter().copied().collect())
            .unwrap_or_default();
        let upstream_outputs: Vec<Schema> = upstream
            .iter()
            .filter_map(|up| dag.get(*up).map(|n| n.output_schema.clone()))
            .collect();
        let node = dag.get(id).expect("operator from topo order");
        let input = upstream_outputs.first().cloned().unwrap_or_default();
        let mismatch = |detail: String| UpdateError::SchemaMismatch {
            operator: id,
            detail,
        };
        let output = match &node.kind {
            OperatorKind::Source { logical_source } => sources
                .schema_of(logical_source)
                .cloned()
                .ok_or_else(|| UpdateError::UnknownSource(logical_source.clone()))?,
            OperatorKind::Filter { predicate } => {
                if input.field(predicate.field()).is_none() {
                    return Err(mismatch(format!("unknown field '{}'", predicate.field())));
                }
                input.clone()
            }
            OperatorKind::Map { expr } => {
                let source_field = input
                    .field(&expr.input_field)
                    .ok_or_else(|| mismatch(format!("unknown field '{}'", expr.input_field)))?;
                let ty = source_field.ty;
                if input.field(&expr.output_field).is_some() {
                    input.clone()
                } else {
                    input.clone().with_field(expr.output_field.clone(), ty)
                }
            }
            OperatorKind::Projection { fields } => {
                if fields.is_empty() {
                    input.clone()
                } else {
                    input
                        .project(fields)
                        .ok_or_else(|| mismatch("projected field missing".to_string()))?
                }
            }
            OperatorKind::Union => {
                for other in &upstream_outputs[1..] {
                    if !other.unifies_with(&input) || !input.unifies_with(other) {
                        return Err(mismatch("union inputs do not unify".to_string()));
                    }
                }
                input.clone()
            }
            OperatorKind::Join {
                left_key,
                right_key,
            } => {
                let right = upstream_outputs
                    .get(1)
                    .ok_or_else(|| mismatch("join needs two inputs".to_string()))?;
                if input.field(left_key).is_none() {
                    return Err(mismatch(format!("unknown left key '{left_key}'")));
                }
                if right.field(right_key).is_none() {
                    return Err(mismatch(format!("unknown right key '{right_key}'")));
                }
                let mut joined = input.clone();
                for field in right.fields() {
                    if joined.field(&field.name).is_none() {
                        joined = joined.with_field(field.name.clone(), field.ty);
                    }
                }
                joined
            }
            OperatorKind::Sink { .. } => input.clone(),
        };
        let node = dag.get_mut(id).expect("operator from topo order");
        node.input_schema = input;
        node.output_schema = output;
    }
    Ok(())
}
