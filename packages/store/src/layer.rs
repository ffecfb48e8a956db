//! In-memory representation of a stored layer.
//!
//! A [`Layer`] owns its schema, spatial reference, and features. All
//! mutations go through methods that keep features consistent with the
//! schema, mirroring what a feature-class store enforces on write.

use muni_merge_layer_models::{Feature, FieldDef, FieldValue, GeometryKind, LayerSchema};

use crate::StoreError;

/// Counts produced by [`Layer::append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSummary {
    /// Features that satisfied the predicate and were written.
    pub admitted: u64,
    /// Features the predicate dropped.
    pub rejected: u64,
}

/// Feature ids matched by an attribute query.
///
/// A selection borrows nothing from its layer; dropping it clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    layer: String,
    fids: Vec<u64>,
}

impl Selection {
    /// Name of the layer the selection was made on.
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Selected feature ids in layer order.
    #[must_use]
    pub fn fids(&self) -> &[u64] {
        &self.fids
    }

    /// Number of selected features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fids.len()
    }

    /// Whether nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }
}

/// One row returned by [`Layer::read`]: the feature id plus the requested
/// field values in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Feature id.
    pub fid: u64,
    /// Values of the requested fields.
    pub values: Vec<FieldValue>,
}

/// A named, single-kind layer of features.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    name: String,
    kind: GeometryKind,
    schema: LayerSchema,
    spatial_ref: Option<serde_json::Value>,
    features: Vec<Feature>,
    /// `None` once the largest id is taken.
    next_fid: Option<u64>,
}

impl Layer {
    /// Creates an empty layer.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: GeometryKind,
        schema: LayerSchema,
        spatial_ref: Option<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            schema,
            spatial_ref,
            features: Vec::new(),
            next_fid: Some(1),
        }
    }

    /// Creates a layer holding `features` as-is (ids are kept).
    #[must_use]
    pub fn with_features(
        name: impl Into<String>,
        kind: GeometryKind,
        schema: LayerSchema,
        spatial_ref: Option<serde_json::Value>,
        features: Vec<Feature>,
    ) -> Self {
        let next_fid = features
            .iter()
            .map(|f| f.fid)
            .max()
            .map_or(Some(1), |max| max.checked_add(1));
        Self {
            name: name.into(),
            kind,
            schema,
            spatial_ref,
            features,
            next_fid,
        }
    }

    /// Layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Geometry family of the layer.
    #[must_use]
    pub const fn kind(&self) -> GeometryKind {
        self.kind
    }

    /// Attribute schema.
    #[must_use]
    pub const fn schema(&self) -> &LayerSchema {
        &self.schema
    }

    /// Spatial reference as stored (a `GeoJSON` `crs` member).
    #[must_use]
    pub const fn spatial_ref(&self) -> Option<&serde_json::Value> {
        self.spatial_ref.as_ref()
    }

    /// Human-readable spatial reference identifier, if any.
    #[must_use]
    pub fn spatial_ref_name(&self) -> Option<String> {
        self.spatial_ref.as_ref().and_then(spatial_ref_name)
    }

    /// All features in id order.
    #[must_use]
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Mutable access to every feature, for in-place attribute rewrites.
    ///
    /// Callers must only write fields present in the schema.
    pub fn features_mut(&mut self) -> &mut [Feature] {
        &mut self.features
    }

    /// Looks up a feature by id.
    #[must_use]
    pub fn feature(&self, fid: u64) -> Option<&Feature> {
        self.features.iter().find(|f| f.fid == fid)
    }

    /// Features whose ids are part of `selection`.
    pub fn selected<'a>(&'a self, selection: &'a Selection) -> impl Iterator<Item = &'a Feature> {
        self.features
            .iter()
            .filter(move |f| selection.fids.contains(&f.fid))
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the layer holds no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Adds a field to the schema, or widens an existing field of the same
    /// name (integer to real, anything to text) so it holds both types.
    /// Existing features read a new field as null; values of a widened
    /// field are converted. Returns whether the schema changed.
    pub fn widen_field(&mut self, field: FieldDef) -> bool {
        let name = field.name.clone();
        if !self.schema.widen(field) {
            return false;
        }
        let Some(field_type) = self.schema.field(&name).map(|f| f.field_type) else {
            return false;
        };
        for feature in &mut self.features {
            let value = feature.get(&name);
            if !value.is_null() {
                let widened = value.coerce(field_type).unwrap_or_default();
                feature.set(&name, widened);
            }
        }
        true
    }

    /// Appends the features of another layer that satisfy `predicate`.
    ///
    /// Attributes are mapped test-and-skip: each field of this layer takes
    /// the source value when present and convertible to the field type,
    /// otherwise null. Source fields unknown to this layer are ignored.
    /// `predicate` sees the mapped feature, so it judges the values that
    /// are actually written. New feature ids are assigned sequentially.
    ///
    /// The append is atomic: if any admitted feature has a geometry of the
    /// wrong kind nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GeometryMismatch`] when an admitted feature's
    /// geometry does not match this layer's kind, or
    /// [`StoreError::FidExhausted`] when no feature id is left.
    pub fn append<P>(
        &mut self,
        source: &[Feature],
        predicate: P,
    ) -> Result<AppendSummary, StoreError>
    where
        P: Fn(&Feature) -> bool,
    {
        let mut summary = AppendSummary::default();
        let mut staged = Vec::new();

        for feature in source {
            let mut mapped = Feature::new(feature.fid, feature.geometry.clone());
            for field in self.schema.fields() {
                let value = feature
                    .get(&field.name)
                    .coerce(field.field_type)
                    .unwrap_or_default();
                mapped.attributes.insert(field.name.clone(), value);
            }

            if !predicate(&mapped) {
                summary.rejected += 1;
                continue;
            }

            if let Some(geometry) = &mapped.geometry {
                let found = GeometryKind::of(geometry);
                if found != Some(self.kind) {
                    return Err(StoreError::GeometryMismatch {
                        layer: self.name.clone(),
                        fid: feature.fid,
                        expected: self.kind,
                        found: found
                            .map_or_else(|| "GeometryCollection".to_string(), |k| k.to_string()),
                    });
                }
            }

            staged.push(mapped);
            summary.admitted += 1;
        }

        if !staged.is_empty() {
            let exhausted = || StoreError::FidExhausted {
                layer: self.name.clone(),
            };
            let first = self.next_fid.ok_or_else(exhausted)?;
            let last = first
                .checked_add(staged.len() as u64 - 1)
                .ok_or_else(exhausted)?;
            for (fid, mut feature) in (first..=last).zip(staged) {
                feature.fid = fid;
                self.features.push(feature);
            }
            self.next_fid = last.checked_add(1);
        }

        Ok(summary)
    }

    /// Reads the requested fields of every feature.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FieldNotFound`] if a requested field is not in
    /// the schema.
    pub fn read(&self, fields: &[&str]) -> Result<Vec<Row>, StoreError> {
        for field in fields {
            self.require_field(field)?;
        }

        Ok(self
            .features
            .iter()
            .map(|feature| Row {
                fid: feature.fid,
                values: fields.iter().map(|f| feature.get(f).clone()).collect(),
            })
            .collect())
    }

    /// Writes `value` into `field` of feature `fid`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the field or feature does not exist or the
    /// value does not fit the field type.
    pub fn update_field(
        &mut self,
        fid: u64,
        field: &str,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        let def = self.require_field(field)?;
        let coerced = value
            .coerce(def.field_type)
            .ok_or_else(|| StoreError::TypeMismatch {
                layer: self.name.clone(),
                field: field.to_string(),
                field_type: def.field_type,
                value: value.to_string(),
            })?;

        let layer = self.name.clone();
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.fid == fid)
            .ok_or(StoreError::FeatureNotFound { layer, fid })?;
        feature.set(field, coerced);
        Ok(())
    }

    /// Selects the features whose `field` equals `value` (SQL equality;
    /// null matches nothing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FieldNotFound`] if the field is not in the
    /// schema.
    pub fn select_by_attribute(
        &self,
        field: &str,
        value: &FieldValue,
    ) -> Result<Selection, StoreError> {
        self.require_field(field)?;
        Ok(Selection {
            layer: self.name.clone(),
            fids: self
                .features
                .iter()
                .filter(|f| f.get(field).equals(value))
                .map(|f| f.fid)
                .collect(),
        })
    }

    fn require_field(&self, field: &str) -> Result<FieldDef, StoreError> {
        self.schema
            .field(field)
            .cloned()
            .ok_or_else(|| StoreError::FieldNotFound {
                layer: self.name.clone(),
                field: field.to_string(),
            })
    }
}

/// Extracts an identifier from a `crs` member: either a bare string or the
/// `properties.name` of a named CRS object.
#[must_use]
pub fn spatial_ref_name(crs: &serde_json::Value) -> Option<String> {
    match crs {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(obj) => obj
            .get("properties")
            .and_then(|p| p.get("name"))
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}
