//! Null backend for testing and headless development.
//!
//! Performs no GPU work. Buffers are plain byte vectors that can be read back,
//! recorded commands are kept in a log, and individual creation calls can be
//! made to fail so error paths can be exercised without a device.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Creation calls that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    ShaderStage,
    BindingLayout,
    Pipeline,
    UniformBuffer,
    Texture,
    BindingSet,
}

/// Command recorded by [`NullBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindPipeline(PipelineHandle),
    BindSet {
        pipeline: PipelineHandle,
        scope: ShaderScope,
        set: BindingSetHandle,
    },
    PushConstants {
        pipeline: PipelineHandle,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
}

struct NullBindingSet {
    layout: u64,
    frame_slot: usize,
    writes: HashMap<BindingSlot, BindingResource>,
}

/// Live object counts, used to verify that teardown releases everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullBackendStats {
    pub shader_modules: usize,
    pub binding_layouts: usize,
    pub binding_sets: usize,
    pub pipelines: usize,
    pub buffers: usize,
    pub textures: usize,
}

/// Backend that records instead of rendering.
pub struct NullBackend {
    frames_in_flight: usize,
    frame_slot: usize,
    frame_index: u64,
    in_frame: bool,
    min_uniform_alignment: u64,

    shader_modules: HashMap<u64, ShaderStage>,
    layouts: HashMap<u64, Vec<BindingLayoutEntry>>,
    sets: HashMap<u64, NullBindingSet>,
    pipelines: HashMap<u64, PipelineDescriptor>,
    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureDescriptor>,
    next_id: u64,

    commands: Vec<RecordedCommand>,
    binding_writes: usize,
    wait_idle_calls: usize,
    /// Calls of each kind that still succeed before the injected failure.
    failures: HashMap<FailurePoint, usize>,
}

impl NullBackend {
    pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

    pub fn new() -> Self {
        Self::with_frames_in_flight(Self::DEFAULT_FRAMES_IN_FLIGHT)
    }

    pub fn with_frames_in_flight(frames_in_flight: usize) -> Self {
        log::debug!("NullBackend: created with {frames_in_flight} frames in flight");
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame_slot: 0,
            frame_index: 0,
            in_frame: false,
            min_uniform_alignment: 256,
            shader_modules: HashMap::new(),
            layouts: HashMap::new(),
            sets: HashMap::new(),
            pipelines: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            next_id: 1,
            commands: Vec::new(),
            binding_writes: 0,
            wait_idle_calls: 0,
            failures: HashMap::new(),
        }
    }

    /// Override the reported uniform offset alignment.
    pub fn with_uniform_alignment(mut self, alignment: u64) -> Self {
        self.min_uniform_alignment = alignment;
        self
    }

    /// Make every subsequent call of the given kind fail until cleared.
    pub fn inject_failure(&mut self, point: FailurePoint) {
        self.failures.insert(point, 0);
    }

    /// Let `successes` more calls of the given kind through, then fail every
    /// later one until cleared.
    pub fn inject_failure_after(&mut self, point: FailurePoint, successes: usize) {
        self.failures.insert(point, successes);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Number of frames begun so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Read back `len` bytes of a buffer.
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: usize) -> Option<&[u8]> {
        let data = self.buffers.get(&buffer.0)?;
        let start = offset as usize;
        data.get(start..start.checked_add(len)?)
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer.0).map(|data| data.len() as u64)
    }

    /// Resource last written to `slot` of a binding set.
    pub fn binding(&self, set: BindingSetHandle, slot: BindingSlot) -> Option<BindingResource> {
        self.sets.get(&set.0)?.writes.get(&slot).copied()
    }

    /// Frame slot a binding set was allocated for.
    pub fn binding_set_frame(&self, set: BindingSetHandle) -> Option<usize> {
        self.sets.get(&set.0).map(|s| s.frame_slot)
    }

    pub fn pipeline_descriptor(&self, pipeline: PipelineHandle) -> Option<&PipelineDescriptor> {
        self.pipelines.get(&pipeline.0)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Total number of descriptor writes performed.
    pub fn binding_write_count(&self) -> usize {
        self.binding_writes
    }

    pub fn wait_idle_count(&self) -> usize {
        self.wait_idle_calls
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Number of draw commands in the log.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Draw { .. }))
            .count()
    }

    pub fn stats(&self) -> NullBackendStats {
        NullBackendStats {
            shader_modules: self.shader_modules.len(),
            binding_layouts: self.layouts.len(),
            binding_sets: self.sets.len(),
            pipelines: self.pipelines.len(),
            buffers: self.buffers.len(),
            textures: self.textures.len(),
        }
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check(&mut self, point: FailurePoint) -> BackendResult<()> {
        match self.failures.get_mut(&point) {
            None => return Ok(()),
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                return Ok(());
            }
            Some(_) => {}
        }
        log::trace!("NullBackend: injected failure at {point:?}");
        Err(match point {
            FailurePoint::ShaderStage => BackendError::ShaderCreationFailed("injected".into()),
            FailurePoint::BindingLayout => BackendError::LayoutCreationFailed("injected".into()),
            FailurePoint::Pipeline => BackendError::PipelineCreationFailed("injected".into()),
            FailurePoint::UniformBuffer => BackendError::BufferCreationFailed("injected".into()),
            FailurePoint::Texture => BackendError::TextureCreationFailed("injected".into()),
            FailurePoint::BindingSet => BackendError::BindingSetAllocationFailed("injected".into()),
        })
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for NullBackend {
    fn name(&self) -> &'static str {
        "Null Backend"
    }

    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn min_uniform_alignment(&self) -> u64 {
        self.min_uniform_alignment
    }

    fn begin_frame(&mut self) -> BackendResult<usize> {
        if self.in_frame {
            log::warn!("NullBackend: begin_frame called twice without end_frame");
        }
        if self.frame_index > 0 {
            self.frame_slot = (self.frame_slot + 1) % self.frames_in_flight;
        }
        self.frame_index += 1;
        self.in_frame = true;
        log::trace!(
            "NullBackend: begin frame {} (slot {})",
            self.frame_index,
            self.frame_slot
        );
        Ok(self.frame_slot)
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.in_frame = false;
        Ok(())
    }

    fn current_frame_slot(&self) -> usize {
        self.frame_slot
    }

    fn create_shader_stage(
        &mut self,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> BackendResult<ShaderModuleHandle> {
        self.check(FailurePoint::ShaderStage)?;
        if bytecode.is_empty() {
            return Err(BackendError::ShaderCreationFailed(format!(
                "empty {} bytecode",
                stage.short_name()
            )));
        }
        let id = self.next_handle();
        log::trace!(
            "NullBackend: creating {:?} stage ({} bytes)",
            stage,
            bytecode.len()
        );
        self.shader_modules.insert(id, stage);
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_stage(&mut self, module: ShaderModuleHandle) {
        self.shader_modules.remove(&module.0);
    }

    fn create_binding_layout(
        &mut self,
        scope: ShaderScope,
        entries: &[BindingLayoutEntry],
    ) -> BackendResult<BindingLayoutHandle> {
        self.check(FailurePoint::BindingLayout)?;
        let id = self.next_handle();
        log::trace!(
            "NullBackend: creating {:?} binding layout with {} entries",
            scope,
            entries.len()
        );
        self.layouts.insert(id, entries.to_vec());
        Ok(BindingLayoutHandle(id))
    }

    fn destroy_binding_layout(&mut self, layout: BindingLayoutHandle) {
        self.layouts.remove(&layout.0);
    }

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        self.check(FailurePoint::Pipeline)?;
        for (_, module) in &desc.stages {
            if !self.shader_modules.contains_key(&module.0) {
                return Err(BackendError::InvalidHandle("shader module"));
            }
        }
        for layout in &desc.binding_layouts {
            if !self.layouts.contains_key(&layout.0) {
                return Err(BackendError::InvalidHandle("binding layout"));
            }
        }
        let id = self.next_handle();
        log::trace!("NullBackend: creating pipeline {:?}", desc.label);
        self.pipelines.insert(id, desc.clone());
        Ok(PipelineHandle(id))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn create_uniform_buffer(&mut self, size: u64) -> BackendResult<BufferHandle> {
        self.check(FailurePoint::UniformBuffer)?;
        let id = self.next_handle();
        log::trace!("NullBackend: creating uniform buffer (size: {size})");
        self.buffers.insert(id, vec![0; size as usize]);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let storage = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer"))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > storage.len() {
            return Err(BackendError::OutOfBounds {
                offset,
                size: data.len() as u64,
            });
        }
        storage[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        pixels: &[u8],
    ) -> BackendResult<TextureHandle> {
        self.check(FailurePoint::Texture)?;
        if pixels.len() != desc.data_size() {
            return Err(BackendError::TextureCreationFailed(format!(
                "expected {} bytes of pixel data, got {}",
                desc.data_size(),
                pixels.len()
            )));
        }
        let id = self.next_handle();
        log::trace!(
            "NullBackend: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn allocate_binding_set(
        &mut self,
        layout: BindingLayoutHandle,
        frame_slot: usize,
    ) -> BackendResult<BindingSetHandle> {
        self.check(FailurePoint::BindingSet)?;
        if !self.layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle("binding layout"));
        }
        let id = self.next_handle();
        self.sets.insert(
            id,
            NullBindingSet {
                layout: layout.0,
                frame_slot,
                writes: HashMap::new(),
            },
        );
        Ok(BindingSetHandle(id))
    }

    fn free_binding_set(&mut self, set: BindingSetHandle) {
        self.sets.remove(&set.0);
    }

    fn write_binding(
        &mut self,
        set: BindingSetHandle,
        slot: BindingSlot,
        resource: BindingResource,
    ) -> BackendResult<()> {
        let entry = self
            .sets
            .get_mut(&set.0)
            .ok_or(BackendError::InvalidHandle("binding set"))?;
        let entries = self
            .layouts
            .get(&entry.layout)
            .ok_or(BackendError::InvalidHandle("binding layout"))?;
        let declared = entries
            .iter()
            .find(|e| e.binding == slot.binding && slot.array_element < e.count);
        if declared.is_none() {
            return Err(BackendError::BindingSetAllocationFailed(format!(
                "binding {} element {} not declared in layout",
                slot.binding, slot.array_element
            )));
        }
        entry.writes.insert(slot, resource);
        self.binding_writes += 1;
        Ok(())
    }

    fn bind_binding_set(&mut self, pipeline: PipelineHandle, scope: ShaderScope, set: BindingSetHandle) {
        self.commands.push(RecordedCommand::BindSet {
            pipeline,
            scope,
            set,
        });
    }

    fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.commands.push(RecordedCommand::BindPipeline(pipeline));
    }

    fn push_constants(&mut self, pipeline: PipelineHandle, offset: u32, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants {
            pipeline,
            offset,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.wait_idle_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_slots_cycle() {
        let mut backend = NullBackend::with_frames_in_flight(3);
        let slots: Vec<usize> = (0..5)
            .map(|_| {
                let slot = backend.begin_frame().unwrap();
                backend.end_frame().unwrap();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn buffer_write_and_read_back() {
        let mut backend = NullBackend::new();
        let buffer = backend.create_uniform_buffer(16).unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer, 4, 4), Some(&[1u8, 2, 3, 4][..]));
        assert!(matches!(
            backend.write_buffer(buffer, 14, &[0; 4]),
            Err(BackendError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn injected_failure() {
        let mut backend = NullBackend::new();
        backend.inject_failure(FailurePoint::UniformBuffer);
        assert!(backend.create_uniform_buffer(16).is_err());
        backend.clear_failures();
        assert!(backend.create_uniform_buffer(16).is_ok());
    }

    #[test]
    fn write_binding_checks_layout() {
        let mut backend = NullBackend::new();
        let layout = backend
            .create_binding_layout(
                ShaderScope::Global,
                &[
                    BindingLayoutEntry::uniform_buffer(0),
                    BindingLayoutEntry::samplers(1, 2),
                ],
            )
            .unwrap();
        let set = backend.allocate_binding_set(layout, 0).unwrap();
        let texture = backend
            .create_texture(&TextureDescriptor::new_2d(1, 1), &[0; 4])
            .unwrap();
        backend
            .write_binding(set, BindingSlot::new(1, 1), BindingResource::Texture(texture))
            .unwrap();
        assert!(backend
            .write_binding(set, BindingSlot::new(1, 2), BindingResource::Texture(texture))
            .is_err());
        assert_eq!(backend.binding_write_count(), 1);
    }
}
