//! Record schemas carried on operator inputs and outputs.
//!
//! Schemas are small ordered field lists. The update phase annotates every
//! operator with an input and output schema (see
//! [`infer_schemas`](crate::signature::infer_schemas)); adjacent operators
//! must *unify* -- the upstream output must carry every field the downstream
//! input expects, with matching types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive field types understood by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Text,
}

/// A named, typed field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

/// An ordered list of fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// The empty schema (sources before inference, sinks after erasure).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style field append.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
        });
        self
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True if `self` (an upstream output) satisfies `downstream_input`:
    /// every downstream field exists here with the same type. An empty
    /// downstream input unifies with anything.
    #[must_use]
    pub fn unifies_with(&self, downstream_input: &Schema) -> bool {
        downstream_input
            .fields
            .iter()
            .all(|need| self.field(&need.name).is_some_and(|have| have.ty == need.ty))
    }

    /// Restrict the schema to the named fields, in the given order.
    ///
    /// Returns `None` if any name is missing.
    #[must_use]
    pub fn project(&self, names: &[String]) -> Option<Schema> {
        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            fields.push(self.field(name)?.clone());
        }
        Some(Schema { fields })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{:?}", field.name, field.ty)?;
        }
        write!(f, "]")
    }
}
