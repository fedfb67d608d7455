use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result, Stage, StageContext};

/// Shape parameters shared by every layer's key/value tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheGeometry {
    pub num_layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            num_layers: 34,
            kv_heads: 4,
            head_dim: 256,
        }
    }
}

impl CacheGeometry {
    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.kv_heads == 0 || self.head_dim == 0 {
            return Err(EngineError::config(format!(
                "cache geometry must be non-zero (layers={}, kv_heads={}, head_dim={})",
                self.num_layers, self.kv_heads, self.head_dim
            )));
        }
        Ok(())
    }
}

/// Key/value pair for a single layer, shaped `[batch=1, kv_heads, positions, head_dim]`.
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub key: Tensor,
    pub value: Tensor,
}

impl LayerKv {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        let (key_batch, key_heads, key_seq, key_dim) = dims4(&key, "key")?;
        let (val_batch, val_heads, val_seq, val_dim) = dims4(&value, "value")?;
        ensure_cache(
            key_batch == val_batch,
            format!("batch mismatch between key ({key_batch}) and value ({val_batch})"),
        )?;
        ensure_cache(
            key_heads == val_heads,
            format!("heads mismatch between key ({key_heads}) and value ({val_heads})"),
        )?;
        ensure_cache(
            key_seq == val_seq,
            format!("sequence mismatch between key ({key_seq}) and value ({val_seq})"),
        )?;
        ensure_cache(
            key_dim == val_dim,
            format!("head dim mismatch between key ({key_dim}) and value ({val_dim})"),
        )?;
        Ok(Self { key, value })
    }

    /// Zero-position tensors so the transformer always receives well-typed inputs.
    fn empty(geometry: &CacheGeometry, dtype: DType, device: &Device) -> Result<Self> {
        let shape = (1, geometry.kv_heads, 0, geometry.head_dim);
        let key = Tensor::zeros(shape, dtype, device).at_stage(Stage::Cache)?;
        let value = Tensor::zeros(shape, dtype, device).at_stage(Stage::Cache)?;
        Ok(Self { key, value })
    }

    pub fn positions(&self) -> usize {
        self.key.dims().get(2).copied().unwrap_or(0)
    }

    fn storage_bytes(&self) -> usize {
        tensor_bytes(&self.key) + tensor_bytes(&self.value)
    }
}

/// Per-layer key/value state for one request.
///
/// Each step the transformer receives every layer's tensors and returns replacements that already
/// cover all positions seen so far; [`CacheStore::update`] swaps them in without concatenating.
#[derive(Debug, Clone)]
pub struct CacheStore {
    geometry: CacheGeometry,
    dtype: DType,
    device: Device,
    layers: Vec<LayerKv>,
}

impl CacheStore {
    /// Create a store with every layer in the empty state.
    pub fn new(geometry: CacheGeometry, dtype: DType, device: &Device) -> Result<Self> {
        let mut store = Self {
            geometry,
            dtype,
            device: device.clone(),
            layers: Vec::new(),
        };
        store.reset(geometry.num_layers, geometry.kv_heads, geometry.head_dim)?;
        Ok(store)
    }

    /// Drop all cached positions and re-shape every layer to `[1, kv_heads, 0, head_dim]`.
    pub fn reset(&mut self, num_layers: usize, kv_heads: usize, head_dim: usize) -> Result<()> {
        let geometry = CacheGeometry {
            num_layers,
            kv_heads,
            head_dim,
        };
        geometry.validate()?;
        let layers = (0..num_layers)
            .map(|_| LayerKv::empty(&geometry, self.dtype, &self.device))
            .collect::<Result<Vec<_>>>()?;
        self.geometry = geometry;
        self.layers = layers;
        Ok(())
    }

    /// Replace the tensors stored for `layer_idx`.
    ///
    /// The replacement must match the configured geometry and may not cover fewer positions than
    /// the tensors it replaces.
    pub fn update(&mut self, layer_idx: usize, key: Tensor, value: Tensor) -> Result<()> {
        let num_layers = self.layers.len();
        let entry = LayerKv::new(key, value)?;
        let (batch, heads, positions, head_dim) = dims4(&entry.key, "key")?;
        ensure_cache(
            layer_idx < num_layers,
            format!("layer index {layer_idx} out of range for {num_layers} layers"),
        )?;
        ensure_cache(batch == 1, format!("layer {layer_idx} batch {batch} != 1"))?;
        ensure_cache(
            heads == self.geometry.kv_heads,
            format!(
                "layer {layer_idx} heads {heads} do not match cache heads {}",
                self.geometry.kv_heads
            ),
        )?;
        ensure_cache(
            head_dim == self.geometry.head_dim,
            format!(
                "layer {layer_idx} head dim {head_dim} does not match cache head dim {}",
                self.geometry.head_dim
            ),
        )?;
        let previous = self.layers[layer_idx].positions();
        ensure_cache(
            positions >= previous,
            format!("cache positions decreased for layer {layer_idx}: {positions} < {previous}"),
        )?;
        self.layers[layer_idx] = entry;
        Ok(())
    }

    /// Replace every layer from a transformer step, in layer order.
    pub fn update_all(&mut self, present: Vec<LayerKv>) -> Result<()> {
        ensure_cache(
            present.len() == self.layers.len(),
            format!(
                "transformer returned {} cache layers, expected {}",
                present.len(),
                self.layers.len()
            ),
        )?;
        for (idx, LayerKv { key, value }) in present.into_iter().enumerate() {
            self.update(idx, key, value)?;
        }
        Ok(())
    }

    /// Number of positions held by every layer.
    ///
    /// Fails when layers disagree, which can only happen mid-update or after a misbehaving
    /// transformer returned ragged tensors.
    pub fn positions(&self) -> Result<usize> {
        let mut lengths = self.layers.iter().map(LayerKv::positions);
        let first = lengths.next().unwrap_or(0);
        if let Some((idx, len)) = lengths
            .enumerate()
            .find(|(_, len)| *len != first)
            .map(|(idx, len)| (idx + 1, len))
        {
            return Err(EngineError::invariant(
                Stage::Cache,
                format!(
                    "cache is not rectangular: layer 0 has {first} positions, layer {idx} has {len}"
                ),
            ));
        }
        Ok(first)
    }

    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    pub fn get(&self, layer_idx: usize) -> Option<&LayerKv> {
        self.layers.get(layer_idx)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn geometry(&self) -> CacheGeometry {
        self.geometry
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Bytes held by all key/value tensors.
    pub fn storage_bytes(&self) -> usize {
        self.layers.iter().map(LayerKv::storage_bytes).sum()
    }
}

fn dims4(tensor: &Tensor, what: &str) -> Result<(usize, usize, usize, usize)> {
    tensor.dims4().map_err(|_| {
        EngineError::invariant(
            Stage::Cache,
            format!(
                "expected {what} tensor with rank 4 [batch, heads, seq, dim], got shape {:?}",
                tensor.dims()
            ),
        )
    })
}

fn ensure_cache(condition: bool, message: String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::invariant(Stage::Cache, message))
    }
}

fn tensor_bytes(tensor: &Tensor) -> usize {
    tensor.elem_count() * tensor.dtype().size_in_bytes()
}
