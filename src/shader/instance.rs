use crate::arena::Handle;
use crate::backend::BindingSetHandle;
use crate::resources::{TextureBinding, UniformAllocation};

/// Handle to a shader instance. Stale after release.
pub type InstanceId = Handle<InstanceState>;

/// Per-instance binding state of a shader.
#[derive(Debug)]
pub struct InstanceState {
    /// Region of the shader's uniform buffer owned by this instance.
    pub(crate) allocation: UniformAllocation,
    /// One binding set per frame in flight.
    pub(crate) sets: Vec<BindingSetHandle>,
    /// Whether each frame's set already points at `allocation`. The region
    /// and sets are fixed for the instance's lifetime, so one write per frame
    /// slot is enough.
    pub(crate) ubo_written: Vec<bool>,
    /// Texture last written to each sampler slot, per frame.
    pub(crate) samplers_written: Vec<Vec<Option<TextureBinding>>>,
    /// Textures currently assigned to the instance's sampler slots.
    pub(crate) textures: Vec<Option<TextureBinding>>,
}

impl InstanceState {
    pub(crate) fn new(
        allocation: UniformAllocation,
        sets: Vec<BindingSetHandle>,
        sampler_count: usize,
    ) -> Self {
        let frames = sets.len();
        Self {
            allocation,
            sets,
            ubo_written: vec![false; frames],
            samplers_written: vec![vec![None; sampler_count]; frames],
            textures: vec![None; sampler_count],
        }
    }

    pub fn allocation(&self) -> UniformAllocation {
        self.allocation
    }

    pub fn offset(&self) -> u64 {
        self.allocation.offset
    }

    pub fn binding_set(&self, frame_slot: usize) -> Option<BindingSetHandle> {
        self.sets.get(frame_slot).copied()
    }

    pub fn texture(&self, slot: usize) -> Option<TextureBinding> {
        self.textures.get(slot).copied().flatten()
    }

    /// Whether the uniform buffer descriptor of `frame_slot` is up to date.
    pub fn ubo_current(&self, frame_slot: usize) -> bool {
        self.ubo_written.get(frame_slot).copied().unwrap_or(false)
    }
}
