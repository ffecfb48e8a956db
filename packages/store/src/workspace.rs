//! Scratch workspace for transient layers such as spatial-join results.
//!
//! Scratch layers are never persisted. Each one is registered in the
//! [`MemoryWorkspace`] for as long as its [`ScratchLayer`] guard lives, and
//! is released when the guard drops, whichever way the owning scope exits.

use std::collections::BTreeSet;

use crate::StoreError;
use crate::layer::Layer;

/// Registry of live scratch layer names.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    live: BTreeSet<String>,
    created: u64,
}

impl MemoryWorkspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `layer` as a scratch layer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LayerExists`] if a scratch layer with the same
    /// name is still alive.
    pub fn scratch(&mut self, layer: Layer) -> Result<ScratchLayer<'_>, StoreError> {
        if !self.live.insert(layer.name().to_string()) {
            return Err(StoreError::LayerExists(layer.name().to_string()));
        }
        self.created += 1;
        log::trace!("Created scratch layer {}", layer.name());
        Ok(ScratchLayer {
            workspace: self,
            layer,
        })
    }

    /// Number of scratch layers currently alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no scratch layer is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Whether a scratch layer named `name` is alive.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.live.contains(name)
    }

    /// Total scratch layers created over the workspace's lifetime.
    #[must_use]
    pub const fn created(&self) -> u64 {
        self.created
    }
}

/// A live scratch layer. Deleted from its workspace on drop.
#[derive(Debug)]
pub struct ScratchLayer<'w> {
    workspace: &'w mut MemoryWorkspace,
    layer: Layer,
}

impl ScratchLayer<'_> {
    /// The scratch layer's contents.
    #[must_use]
    pub const fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Mutable access to the scratch layer's contents.
    pub const fn layer_mut(&mut self) -> &mut Layer {
        &mut self.layer
    }
}

impl Drop for ScratchLayer<'_> {
    fn drop(&mut self) {
        if self.workspace.live.remove(self.layer.name()) {
            log::trace!("Deleted scratch layer {}", self.layer.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muni_merge_layer_models::{GeometryKind, LayerSchema};

    fn layer(name: &str) -> Layer {
        Layer::new(name, GeometryKind::Point, LayerSchema::default(), None)
    }

    #[test]
    fn guard_releases_layer_on_drop() {
        let mut workspace = MemoryWorkspace::new();
        {
            let scratch = workspace.scratch(layer("sj_Springfield_block7")).unwrap();
            assert_eq!(scratch.layer().name(), "sj_Springfield_block7");
        }
        assert!(workspace.is_empty());
        assert_eq!(workspace.created(), 1);
    }

    #[test]
    fn guard_releases_layer_on_early_return() {
        fn fails(workspace: &mut MemoryWorkspace) -> Result<(), StoreError> {
            let _scratch = workspace.scratch(layer("sj_x_block1"))?;
            Err(StoreError::LayerNotFound("x_buildings".to_string()))
        }

        let mut workspace = MemoryWorkspace::new();
        assert!(fails(&mut workspace).is_err());
        assert!(!workspace.contains("sj_x_block1"));
        assert!(workspace.scratch(layer("sj_x_block1")).is_ok());
    }
}
