//! Attribute field types, values, and layer schemas.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Largest integral `f64` that still maps one-to-one onto an `i64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Storage type of an attribute field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Real,
    /// Free text.
    Text,
}

impl FieldType {
    /// The narrowest type that holds values of both `self` and `other`
    /// without loss: text absorbs everything, real absorbs integer.
    #[must_use]
    pub const fn widen(self, other: Self) -> Self {
        match (self, other) {
            (Self::Text, _) | (_, Self::Text) => Self::Text,
            (Self::Real, _) | (_, Self::Real) => Self::Real,
            (Self::Integer, Self::Integer) => Self::Integer,
        }
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    /// Missing value (SQL `NULL`).
    #[default]
    Null,
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Real(f64),
    /// Text value.
    Text(String),
}

impl FieldValue {
    /// Whether this is [`FieldValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The type this value naturally belongs to, `None` for null.
    #[must_use]
    pub const fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Integer(_) => Some(FieldType::Integer),
            Self::Real(_) => Some(FieldType::Real),
            Self::Text(_) => Some(FieldType::Text),
        }
    }

    /// Numeric view of the value. Numeric text is parsed; null and
    /// non-numeric text yield `None`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Text view of the value, only for [`FieldValue::Text`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to `target`, or `None` when it cannot be
    /// represented without loss. Null converts to null.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn coerce(&self, target: FieldType) -> Option<Self> {
        match (self, target) {
            (Self::Null, _) => Some(Self::Null),
            (Self::Integer(i), FieldType::Integer) => Some(Self::Integer(*i)),
            (Self::Integer(i), FieldType::Real) => Some(Self::Real(*i as f64)),
            (Self::Real(r), FieldType::Integer) => {
                (r.is_finite() && r.fract() == 0.0 && r.abs() < MAX_SAFE_INTEGER)
                    .then(|| Self::Integer(*r as i64))
            }
            (Self::Real(r), FieldType::Real) => Some(Self::Real(*r)),
            (Self::Text(s), FieldType::Integer) => s.trim().parse().ok().map(Self::Integer),
            (Self::Text(s), FieldType::Real) => s.trim().parse().ok().map(Self::Real),
            (Self::Text(s), FieldType::Text) => Some(Self::Text(s.clone())),
            (Self::Integer(_) | Self::Real(_), FieldType::Text) => {
                Some(Self::Text(self.to_string()))
            }
        }
    }

    /// SQL-style equality: numbers compare by value regardless of storage
    /// type, text compares exactly, and null equals nothing.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => false,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Text(_), _) | (_, Self::Text(_)) => false,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
        }
    }

    /// Converts a `GeoJSON` property value.
    ///
    /// Booleans become `0`/`1`; arrays and objects are kept as their JSON
    /// text.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Real))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Self::Text(other.to_string())
            }
        }
    }

    /// Converts to a `GeoJSON` property value. Non-finite reals become null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Renders numbers without a trailing `.0` when integral, so block and
/// building numbers read the same whether stored as integer or real.
impl std::fmt::Display for FieldValue {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) if r.is_finite() && r.fract() == 0.0 && r.abs() < MAX_SAFE_INTEGER => {
                write!(f, "{}", *r as i64)
            }
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A named, typed attribute field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, case-sensitive.
    pub name: String,
    /// Storage type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDef {
    /// Creates a field definition.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered set of field definitions with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerSchema {
    fields: Vec<FieldDef>,
}

impl LayerSchema {
    /// Creates a schema, keeping the first definition of any repeated name.
    #[must_use]
    pub fn new(fields: impl IntoIterator<Item = FieldDef>) -> Self {
        let mut schema = Self::default();
        for field in fields {
            schema.push(field);
        }
        schema
    }

    /// Infers a schema from attribute rows.
    ///
    /// The first non-null value fixes a field's type. Integers widen to
    /// real when a later value is fractional, and any text value makes the
    /// field text. Fields that are null everywhere become text.
    #[must_use]
    pub fn infer<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a std::collections::BTreeMap<String, FieldValue>>,
    {
        let mut order: Vec<String> = Vec::new();
        let mut types: std::collections::BTreeMap<String, Option<FieldType>> =
            std::collections::BTreeMap::new();

        for row in rows {
            for (name, value) in row {
                let slot = types.entry(name.clone()).or_insert_with(|| {
                    order.push(name.clone());
                    None
                });
                *slot = match (*slot, value.field_type()) {
                    (current, None) => current,
                    (None, seen) => seen,
                    (Some(current), Some(seen)) => Some(current.widen(seen)),
                };
            }
        }

        Self::new(order.into_iter().map(|name| {
            let field_type = types
                .get(&name)
                .copied()
                .flatten()
                .unwrap_or(FieldType::Text);
            FieldDef::new(name, field_type)
        }))
    }

    /// Field definitions in order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether a field with `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Appends a field. Returns `false` (and changes nothing) when a field
    /// with the same name already exists.
    pub fn push(&mut self, field: FieldDef) -> bool {
        if self.contains(&field.name) {
            return false;
        }
        self.fields.push(field);
        true
    }

    /// Adds `field`, or widens the type of an existing field with the same
    /// name so it also holds `field`'s values. Returns whether the schema
    /// changed.
    pub fn widen(&mut self, field: FieldDef) -> bool {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => {
                let widened = existing.field_type.widen(field.field_type);
                let changed = widened != existing.field_type;
                existing.field_type = widened;
                changed
            }
            None => {
                self.fields.push(field);
                true
            }
        }
    }

    /// Adds `field`, replacing the type of an existing field with the same
    /// name.
    pub fn upsert(&mut self, field: FieldDef) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == field.name) {
            existing.field_type = field.field_type;
        } else {
            self.fields.push(field);
        }
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
