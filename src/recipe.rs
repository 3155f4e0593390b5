//! Recipes, type tags and typed values
//!
//! A recipe is the ordered, typed field list negotiated once per RTDE session.
//! Recipes are read from a YAML recipe file keyed by channel (`rco` for the
//! controller outputs, `rci` for the controller inputs by default).

use crate::{Result, URError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Wire type of a recipe field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TypeTag {
    Bool,
    Uint8,
    Uint32,
    Uint64,
    Int32,
    Double,
    Vector3d,
    Vector6d,
    Vector6int32,
    String,
}

impl TypeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Bool => "BOOL",
            TypeTag::Uint8 => "UINT8",
            TypeTag::Uint32 => "UINT32",
            TypeTag::Uint64 => "UINT64",
            TypeTag::Int32 => "INT32",
            TypeTag::Double => "DOUBLE",
            TypeTag::Vector3d => "VECTOR3D",
            TypeTag::Vector6d => "VECTOR6D",
            TypeTag::Vector6int32 => "VECTOR6INT32",
            TypeTag::String => "STRING",
        }
    }

    /// Bytes occupied in a data package, `None` for types that cannot be carried
    pub fn wire_size(self) -> Option<usize> {
        match self {
            TypeTag::Bool | TypeTag::Uint8 => Some(1),
            TypeTag::Uint32 | TypeTag::Int32 => Some(4),
            TypeTag::Uint64 | TypeTag::Double => Some(8),
            TypeTag::Vector3d => Some(24),
            TypeTag::Vector6d => Some(48),
            TypeTag::Vector6int32 => Some(24),
            TypeTag::String => None,
        }
    }

    /// Zero value of this type
    pub fn default_value(self) -> Value {
        match self {
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Uint8 => Value::Uint8(0),
            TypeTag::Uint32 => Value::Uint32(0),
            TypeTag::Uint64 => Value::Uint64(0),
            TypeTag::Int32 => Value::Int32(0),
            TypeTag::Double => Value::Double(0.0),
            TypeTag::Vector3d => Value::Vector3d([0.0; 3]),
            TypeTag::Vector6d => Value::Vector6d([0.0; 6]),
            TypeTag::Vector6int32 => Value::Vector6int32([0; 6]),
            TypeTag::String => Value::String(String::new()),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TypeTag {
    type Err = URError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BOOL" => Ok(TypeTag::Bool),
            "UINT8" => Ok(TypeTag::Uint8),
            "UINT32" => Ok(TypeTag::Uint32),
            "UINT64" => Ok(TypeTag::Uint64),
            "INT32" => Ok(TypeTag::Int32),
            "DOUBLE" => Ok(TypeTag::Double),
            "VECTOR3D" => Ok(TypeTag::Vector3d),
            "VECTOR6D" => Ok(TypeTag::Vector6d),
            "VECTOR6INT32" => Ok(TypeTag::Vector6int32),
            "STRING" => Ok(TypeTag::String),
            other => Err(URError::Config(format!("Unknown type tag: {}", other))),
        }
    }
}

/// Decoded value of one recipe field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Uint8(u8),
    Uint32(u32),
    Uint64(u64),
    Int32(i32),
    Double(f64),
    Vector3d([f64; 3]),
    Vector6d([f64; 6]),
    Vector6int32([i32; 6]),
    String(String),
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Bool(_) => TypeTag::Bool,
            Value::Uint8(_) => TypeTag::Uint8,
            Value::Uint32(_) => TypeTag::Uint32,
            Value::Uint64(_) => TypeTag::Uint64,
            Value::Int32(_) => TypeTag::Int32,
            Value::Double(_) => TypeTag::Double,
            Value::Vector3d(_) => TypeTag::Vector3d,
            Value::Vector6d(_) => TypeTag::Vector6d,
            Value::Vector6int32(_) => TypeTag::Vector6int32,
            Value::String(_) => TypeTag::String,
        }
    }

    /// Integer view of the scalar integer types, used by the bit register views
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Bool(b) => Some(b as u64),
            Value::Uint8(v) => Some(v as u64),
            Value::Uint32(v) => Some(v as u64),
            Value::Uint64(v) => Some(v),
            Value::Int32(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            Value::Int32(v) => Some(v as f64),
            Value::Uint8(v) => Some(v as f64),
            Value::Uint32(v) => Some(v as f64),
            Value::Uint64(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }
}

/// One `(name, type)` entry of a recipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TypeTag,
}

impl FieldSpec {
    pub fn new(name: &str, kind: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Ordered, typed field list with a name lookup table built once
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Recipe {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
}

impl Recipe {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(fields.len());
        for (slot, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(URError::Config(format!("Recipe field {} has an empty name", slot)));
            }
            if index.insert(field.name.clone(), slot).is_some() {
                return Err(URError::Config(format!("Duplicate recipe field: {}", field.name)));
            }
        }
        Ok(Self { fields, index })
    }

    /// Convenience constructor from `(name, type)` pairs
    pub fn from_pairs(pairs: &[(&str, TypeTag)]) -> Result<Self> {
        Self::new(pairs.iter().map(|(name, kind)| FieldSpec::new(name, *kind)).collect())
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn type_of(&self, name: &str) -> Option<TypeTag> {
        self.slot(name).map(|slot| self.fields[slot].kind)
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn types(&self) -> Vec<TypeTag> {
        self.fields.iter().map(|f| f.kind).collect()
    }

    /// Zero values aligned with the field order
    pub fn default_values(&self) -> Vec<Value> {
        self.fields.iter().map(|f| f.kind.default_value()).collect()
    }
}

/// What to do when a required field is missing from the recipe file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    Reject,
    #[default]
    Extend,
}

/// Recipe definition file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeFile {
    pub recipes: BTreeMap<String, Vec<FieldSpec>>,
}

impl RecipeFile {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| URError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let file: RecipeFile = serde_yaml::from_str(contents)?;
        for (key, fields) in &file.recipes {
            Recipe::new(fields.clone())
                .map_err(|e| URError::Config(format!("Recipe '{}': {}", key, e)))?;
        }
        Ok(file)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Build the recipe stored under `key`
    pub fn recipe(&self, key: &str) -> Result<Recipe> {
        let fields = self
            .recipes
            .get(key)
            .ok_or_else(|| URError::Config(format!("Recipe '{}' not found in recipe file", key)))?;
        Recipe::new(fields.clone())
    }

    /// Make sure every field in `required` exists under `key`.
    ///
    /// Returns true if the file was extended. Existing fields are never retyped;
    /// a conflicting type is a configuration error under either policy.
    pub fn require(&mut self, key: &str, required: &[FieldSpec], policy: MissingFieldPolicy) -> Result<bool> {
        let fields = self.recipes.entry(key.to_string()).or_default();
        let mut extended = false;

        for wanted in required {
            match fields.iter().find(|f| f.name == wanted.name) {
                Some(existing) if existing.kind == wanted.kind => {}
                Some(existing) => {
                    return Err(URError::Config(format!(
                        "Recipe '{}' declares {} as {}, but {} is required",
                        key, existing.name, existing.kind, wanted.kind
                    )));
                }
                None => match policy {
                    MissingFieldPolicy::Reject => {
                        return Err(URError::Config(format!(
                            "Recipe '{}' is missing required field {}",
                            key, wanted.name
                        )));
                    }
                    MissingFieldPolicy::Extend => {
                        info!(recipe = key, field = %wanted.name, kind = %wanted.kind, "Extending recipe");
                        fields.push(wanted.clone());
                        extended = true;
                    }
                },
            }
        }
        Ok(extended)
    }

    /// Load `path`, apply [`RecipeFile::require`] and write the file back if it changed
    pub fn require_on_disk<P: AsRef<Path>>(
        path: P,
        key: &str,
        required: &[FieldSpec],
        policy: MissingFieldPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut file = Self::load_from_path(path)?;
        if file.require(key, required, policy)? {
            if let Err(e) = file.save(path) {
                warn!("Failed to write extended recipe file {}: {}", path.display(), e);
                return Err(e);
            }
        }
        Ok(file)
    }
}
