//! Member-path resolution against the schema.
//!
//! `x.Author` resolves directly against the element type (or a base type).
//! `x.Shelf.Geo.Lat` walks composite properties down to the leaf; the
//! condition then lands on the top-level `Shelf` property and carries a
//! transient `Address { Geo: Geo { Lat: .. } }` instead of a scalar.

use crate::error::{QueryError, Result};
use crate::expr::MemberPath;
use crate::schema::{MemberReference, PropertyType, Schema};
use crate::value::{CompositeValue, Value};
use tracing::trace;

/// One composite hop: the property name and the object type it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub property: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The path touches a property marked `ignore`; no condition is produced.
    Ignored,
    /// A property declared on the element type or one of its bases.
    Direct { property: String, ty: PropertyType },
    /// A field reached through one or more composite properties.
    Nested {
        property: String,
        holder: Vec<Hop>,
        leaf: String,
        ty: PropertyType,
    },
}

impl Resolved {
    /// The element-type property that receives the condition.
    pub fn property(&self) -> Option<&str> {
        match self {
            Resolved::Ignored => None,
            Resolved::Direct { property, .. } | Resolved::Nested { property, .. } => Some(property),
        }
    }

    /// Type of the member that was actually named (the leaf).
    pub fn leaf_type(&self) -> Option<&PropertyType> {
        match self {
            Resolved::Ignored => None,
            Resolved::Direct { ty, .. } | Resolved::Nested { ty, .. } => Some(ty),
        }
    }

    /// Shapes `value` for storage on [`Resolved::property`]: unchanged for a
    /// direct property, wrapped in the holder composites for a nested one.
    pub fn materialize(&self, value: Value) -> Value {
        match self {
            Resolved::Nested { holder, leaf, .. } => {
                let Some((top, below)) = holder.split_first() else {
                    return value;
                };
                let mut root = CompositeValue::new(top.type_name.clone());
                let mut cursor = &mut root;
                for hop in below {
                    cursor = cursor.nested_mut(&hop.property, &hop.type_name);
                }
                cursor.set(leaf.clone(), value);
                Value::Composite(root)
            }
            _ => value,
        }
    }
}

pub struct PropertyResolver<'s> {
    schema: &'s Schema,
    element: String,
}

impl<'s> PropertyResolver<'s> {
    pub fn new(schema: &'s Schema, element: impl Into<String>) -> Self {
        Self {
            schema,
            element: element.into(),
        }
    }

    /// Resolves a parameter-rooted member chain. The root itself is not
    /// checked here; callers only pass paths rooted at the query parameter.
    pub fn resolve(&self, path: &MemberPath) -> Result<Resolved> {
        let (first, rest) = path
            .segments
            .split_first()
            .ok_or_else(|| QueryError::unsupported(format!("`{}` is the query parameter, not a member", path)))?;

        let (_, top) = self.schema.find_property(&self.element, first).ok_or_else(|| {
            QueryError::unresolved(path.to_string(), format!("`{}` has no property `{}`", self.element, first))
        })?;
        if top.ignore {
            return Ok(Resolved::Ignored);
        }
        if rest.is_empty() {
            return Ok(Resolved::Direct {
                property: top.name.clone(),
                ty: top.ty.clone(),
            });
        }

        let mut holder = Vec::with_capacity(rest.len());
        let mut current = top;
        for segment in rest {
            let type_name = current.ty.object_name().ok_or_else(|| {
                QueryError::unresolved(path.to_string(), format!("`{}` is not a composite property", current.name))
            })?;
            holder.push(Hop {
                property: current.name.clone(),
                type_name: type_name.to_string(),
            });
            let (_, next) = self.schema.find_property(type_name, segment).ok_or_else(|| {
                QueryError::unresolved(path.to_string(), format!("`{}` has no property `{}`", type_name, segment))
            })?;
            if next.ignore {
                return Ok(Resolved::Ignored);
            }
            current = next;
        }

        trace!(path = %path, holder = ?holder, "resolved nested member");
        Ok(Resolved::Nested {
            property: top.name.clone(),
            holder,
            leaf: current.name.clone(),
            ty: current.ty.clone(),
        })
    }

    /// Resolves an ordering key. Only direct properties can be sorted on;
    /// an ignored property yields `None`.
    pub fn member_reference(&self, path: &MemberPath) -> Result<Option<MemberReference>> {
        let [name] = path.segments.as_slice() else {
            return Err(QueryError::unsupported(format!(
                "ordering key `{}` must be a direct property of `{}`",
                path, self.element
            )));
        };
        let (declaring, prop) = self.schema.find_property(&self.element, name).ok_or_else(|| {
            QueryError::unresolved(path.to_string(), format!("`{}` has no property `{}`", self.element, name))
        })?;
        if prop.ignore {
            return Ok(None);
        }
        Ok(Some(MemberReference {
            declaring_type: declaring.reference(),
            property_name: prop.name.clone(),
            display_name: prop.display_name.clone(),
        }))
    }
}
