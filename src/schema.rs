//! Entity metadata: the load-time stand-in for reflection.
//!
//! Every queryable type is described by a [`TypeDef`] listing its properties,
//! together with the overrides a backend may care about (display names,
//! uniqueness, ignore markers).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// The declared type of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Bool,
    Int,
    Float,
    String,
    DateTime,
    /// An enumeration, by name. Enums are compared as scalars.
    Enum(String),
    /// A structured type declared elsewhere in the schema.
    Object(String),
    /// A collection of elements.
    List(Box<PropertyType>),
}

impl PropertyType {
    /// True for structured types that decompose into a nested bucket.
    pub fn is_composite(&self) -> bool {
        matches!(self, PropertyType::Object(_))
    }

    pub fn object_name(&self) -> Option<&str> {
        match self {
            PropertyType::Object(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PropertyType,
    /// Name the backend should use instead of `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unique: bool,
    /// Ignored properties never produce conditions.
    #[serde(default)]
    pub ignore: bool,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
            display_name: None,
            unique: false,
            ignore: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignore = true;
        self
    }

    pub fn renamed(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn effective_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Base type whose properties are inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
}

impl TypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            base: None,
            properties: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn renamed(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn effective_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// A lightweight reference suitable for embedding in the AST.
    pub fn reference(&self) -> TypeRef {
        TypeRef {
            type_name: self.name.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Names a type, applying the display-name override first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub type_name: String,
    pub display_name: Option<String>,
}

impl TypeRef {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.type_name)
    }
}

/// A property together with the type that declares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberReference {
    pub declaring_type: TypeRef,
    pub property_name: String,
    pub display_name: Option<String>,
}

impl MemberReference {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.property_name)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_type.name(), self.name())
    }
}

/// The metadata table handed to the compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    types: BTreeMap<String, TypeDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, def: TypeDef) -> Self {
        self.insert(def);
        self
    }

    pub fn insert(&mut self, def: TypeDef) {
        self.types.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Finds `property` on `type_name` or any of its base types. Returns the
    /// declaring type alongside the property.
    pub fn find_property(&self, type_name: &str, property: &str) -> Option<(&TypeDef, &PropertyDef)> {
        let mut current = self.get(type_name);
        let mut seen = HashSet::new();
        while let Some(def) = current {
            if !seen.insert(def.name.as_str()) {
                break;
            }
            if let Some(prop) = def.properties.iter().find(|p| p.name == property) {
                return Some((def, prop));
            }
            current = def.base.as_deref().and_then(|b| self.get(b));
        }
        None
    }

    /// All properties visible on `type_name`, base-type properties first.
    pub fn properties_of(&self, type_name: &str) -> Vec<(&TypeDef, &PropertyDef)> {
        let mut chain = Vec::new();
        let mut current = self.get(type_name);
        let mut seen = HashSet::new();
        while let Some(def) = current {
            if !seen.insert(def.name.as_str()) {
                break;
            }
            chain.push(def);
            current = def.base.as_deref().and_then(|b| self.get(b));
        }
        chain
            .into_iter()
            .rev()
            .flat_map(|def| def.properties.iter().map(move |p| (def, p)))
            .collect()
    }

    /// True if `candidate` is `type_name` itself or one of its base types.
    pub fn is_same_or_base(&self, type_name: &str, candidate: &str) -> bool {
        let mut current = self.get(type_name);
        let mut seen = HashSet::new();
        while let Some(def) = current {
            if def.name == candidate {
                return true;
            }
            if !seen.insert(def.name.as_str()) {
                break;
            }
            current = def.base.as_deref().and_then(|b| self.get(b));
        }
        false
    }

    /// Checks that every referenced object and base type is declared.
    pub fn validate(&self) -> Result<(), String> {
        for def in self.types.values() {
            if let Some(base) = &def.base {
                if !self.types.contains_key(base) {
                    return Err(format!("type `{}` has unknown base `{}`", def.name, base));
                }
            }
            for prop in &def.properties {
                let mut ty = &prop.ty;
                while let PropertyType::List(inner) = ty {
                    ty = inner;
                }
                if let PropertyType::Object(name) = ty {
                    if !self.types.contains_key(name) {
                        return Err(format!(
                            "property `{}.{}` refers to unknown type `{}`",
                            def.name, prop.name, name
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
