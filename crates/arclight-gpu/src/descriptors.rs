//! Descriptor set management.
//!
//! A [`DescriptorSet`] collects bindings in order (binding index equals
//! insertion position) until its layout is finalized, either explicitly or
//! when a [`DescriptorPool`] allocates it. The set refers to the buffers and
//! images it binds by handle only; keep them alive while the set is in use.

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::{ImageView, Sampler};
use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// The resource kinds a binding can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    CombinedImageSampler,
}

impl DescriptorKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    pub fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }

    /// Layout an image must be in when read through this kind of binding.
    pub fn image_layout(self) -> vk::ImageLayout {
        match self {
            Self::StorageImage => vk::ImageLayout::GENERAL,
            _ => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

/// Pool size entry for `count` descriptors of `kind`.
pub fn pool_size(kind: DescriptorKind, count: u32) -> vk::DescriptorPoolSize {
    vk::DescriptorPoolSize {
        ty: kind.descriptor_type(),
        descriptor_count: count,
    }
}

#[derive(Debug, Clone, Copy)]
enum BindingResource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

/// Ordered bindings plus the resource each one points at.
#[derive(Debug, Default)]
struct BindingTable {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    resources: Vec<BindingResource>,
    sealed: bool,
}

impl BindingTable {
    fn check_kind(kind: DescriptorKind, resource: &BindingResource) -> Result<()> {
        let matches = match resource {
            BindingResource::Buffer(_) => kind.is_buffer(),
            BindingResource::Image(info) => {
                !kind.is_buffer()
                    && (kind != DescriptorKind::CombinedImageSampler
                        || info.sampler != vk::Sampler::null())
            }
        };
        if matches {
            Ok(())
        } else {
            Err(GpuError::InvalidConfig(format!(
                "{kind:?} binding cannot hold this resource"
            )))
        }
    }

    fn push(
        &mut self,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
        resource: BindingResource,
    ) -> Result<u32> {
        if self.sealed {
            return Err(GpuError::InvalidState(
                "cannot add bindings after the layout is finalized".to_string(),
            ));
        }
        Self::check_kind(kind, &resource)?;
        let index = self.bindings.len() as u32;
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(index)
                .descriptor_type(kind.descriptor_type())
                .descriptor_count(1)
                .stage_flags(stages),
        );
        self.resources.push(resource);
        Ok(index)
    }

    fn replace(&mut self, index: u32, kind: DescriptorKind, resource: BindingResource) -> Result<()> {
        let binding = self.bindings.get(index as usize).ok_or_else(|| {
            GpuError::InvalidConfig(format!(
                "binding {index} does not exist ({} bindings)",
                self.bindings.len()
            ))
        })?;
        if binding.descriptor_type != kind.descriptor_type() {
            return Err(GpuError::InvalidConfig(format!(
                "binding {index} is {:?}, not {:?}",
                binding.descriptor_type,
                kind.descriptor_type()
            )));
        }
        Self::check_kind(kind, &resource)?;
        self.resources[index as usize] = resource;
        Ok(())
    }

    fn write(&self, set: vk::DescriptorSet, index: usize) -> vk::WriteDescriptorSet<'_> {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(index as u32)
            .descriptor_type(self.bindings[index].descriptor_type);
        match &self.resources[index] {
            BindingResource::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
            BindingResource::Image(info) => write.image_info(std::slice::from_ref(info)),
        }
    }
}

/// A set of resource bindings consumed by shaders.
pub struct DescriptorSet {
    device: Arc<Device>,
    table: BindingTable,
    layout: vk::DescriptorSetLayout,
    handle: SetSlot,
}

impl DescriptorSet {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            table: BindingTable::default(),
            layout: vk::DescriptorSetLayout::null(),
            handle: Arc::new(Mutex::new(vk::DescriptorSet::null())),
        }
    }

    /// Append a buffer binding and return its index.
    pub fn bind_buffer<T: Pod>(
        &mut self,
        buffer: &Buffer<T>,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
    ) -> Result<u32> {
        self.table
            .push(kind, stages, BindingResource::Buffer(buffer.descriptor_info()))
    }

    /// Append an image binding and return its index. Combined image samplers
    /// need a sampler.
    pub fn bind_image(
        &mut self,
        view: &ImageView,
        kind: DescriptorKind,
        stages: vk::ShaderStageFlags,
        sampler: Option<&Sampler>,
    ) -> Result<u32> {
        self.table
            .push(kind, stages, BindingResource::Image(image_info(view, kind, sampler)))
    }

    /// Compile the layout. No bindings can be added afterwards; calling this
    /// again has no effect.
    pub fn finalize_layout(&mut self) -> Result<()> {
        if self.table.sealed {
            return Ok(());
        }
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.table.bindings);
        // SAFETY: the bindings slice outlives the call.
        let layout = unsafe {
            self.device
                .handle()
                .create_descriptor_set_layout(&create_info, None)
        }?;
        debug!(
            "Created descriptor set layout {layout:?} with {} bindings",
            self.table.bindings.len()
        );
        self.layout = layout;
        self.table.sealed = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.table.sealed
    }

    /// The compiled layout.
    pub fn layout(&self) -> Result<vk::DescriptorSetLayout> {
        if self.table.sealed {
            Ok(self.layout)
        } else {
            Err(GpuError::InvalidState(
                "descriptor set layout is not finalized".to_string(),
            ))
        }
    }

    /// Native set handle; null until a pool allocates the set and again
    /// once the pool frees it.
    pub fn handle(&self) -> vk::DescriptorSet {
        *self.handle.lock()
    }

    pub fn is_allocated(&self) -> bool {
        self.handle() != vk::DescriptorSet::null()
    }

    pub fn binding_count(&self) -> usize {
        self.table.bindings.len()
    }

    fn require_allocated(&self) -> Result<()> {
        if self.is_allocated() {
            Ok(())
        } else {
            Err(GpuError::InvalidState(
                "descriptor set has not been allocated".to_string(),
            ))
        }
    }

    /// Write every binding into the allocated set.
    pub fn update(&self) -> Result<()> {
        self.require_allocated()?;
        let handle = self.handle();
        let writes: Vec<_> = (0..self.table.bindings.len())
            .map(|i| self.table.write(handle, i))
            .collect();
        // SAFETY: the set is allocated and the referenced resources are alive.
        unsafe { self.device.handle().update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    fn update_one(&self, index: u32) {
        if self.is_allocated() {
            let write = self.table.write(self.handle(), index as usize);
            // SAFETY: the set is allocated and not in use by pending commands.
            unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
        }
    }

    /// Point an existing buffer binding at another buffer.
    pub fn replace_buffer<T: Pod>(
        &mut self,
        index: u32,
        buffer: &Buffer<T>,
        kind: DescriptorKind,
    ) -> Result<()> {
        self.table
            .replace(index, kind, BindingResource::Buffer(buffer.descriptor_info()))?;
        self.update_one(index);
        Ok(())
    }

    /// Point an existing image binding at another view.
    pub fn replace_image(
        &mut self,
        index: u32,
        view: &ImageView,
        kind: DescriptorKind,
        sampler: Option<&Sampler>,
    ) -> Result<()> {
        self.table
            .replace(index, kind, BindingResource::Image(image_info(view, kind, sampler)))?;
        self.update_one(index);
        Ok(())
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if self.layout != vk::DescriptorSetLayout::null() {
            // SAFETY: pipelines copy what they need from the layout at creation.
            unsafe {
                self.device
                    .handle()
                    .destroy_descriptor_set_layout(self.layout, None);
            }
        }
    }
}

fn image_info(
    view: &ImageView,
    kind: DescriptorKind,
    sampler: Option<&Sampler>,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo {
        sampler: sampler.map_or(vk::Sampler::null(), Sampler::handle),
        image_view: view.handle(),
        image_layout: kind.image_layout(),
    }
}

/// A set's native handle, shared with the pool that allocated it so that
/// freeing from the pool side is visible on the set.
type SetSlot = Arc<Mutex<vk::DescriptorSet>>;

/// Live sets of a pool, capped at its maximum.
#[derive(Debug)]
struct SetRoster {
    max_sets: u32,
    sets: Vec<SetSlot>,
}

impl SetRoster {
    fn ensure_capacity(&self) -> Result<()> {
        if self.sets.len() >= self.max_sets as usize {
            Err(GpuError::DescriptorPoolExhausted {
                max_sets: self.max_sets,
            })
        } else {
            Ok(())
        }
    }

    fn push(&mut self, slot: SetSlot) -> Result<usize> {
        self.ensure_capacity()?;
        self.sets.push(slot);
        Ok(self.sets.len() - 1)
    }

    /// Drop the set at `index` from the roster, null its slot and return the
    /// handle that still has to be freed.
    fn remove(&mut self, index: usize) -> Result<vk::DescriptorSet> {
        if index >= self.sets.len() {
            return Err(GpuError::InvalidConfig(format!(
                "descriptor set {index} not in pool ({} live)",
                self.sets.len()
            )));
        }
        Ok(take_handle(&self.sets.remove(index)))
    }

    fn remove_all(&mut self) -> Vec<vk::DescriptorSet> {
        self.sets.drain(..).map(|slot| take_handle(&slot)).collect()
    }
}

fn take_handle(slot: &SetSlot) -> vk::DescriptorSet {
    std::mem::replace(&mut *slot.lock(), vk::DescriptorSet::null())
}

/// Storage from which descriptor sets are allocated.
pub struct DescriptorPool {
    device: Arc<Device>,
    handle: vk::DescriptorPool,
    roster: SetRoster,
}

impl DescriptorPool {
    /// Create a pool holding at most `max_sets` sets.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        if max_sets == 0 || pool_sizes.is_empty() {
            return Err(GpuError::InvalidConfig(
                "descriptor pool needs sets and pool sizes".to_string(),
            ));
        }
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        // SAFETY: the create info is fully initialized.
        let handle = unsafe { device.handle().create_descriptor_pool(&create_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            roster: SetRoster {
                max_sets,
                sets: Vec::new(),
            },
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.roster.max_sets
    }

    /// Number of live sets.
    pub fn len(&self) -> usize {
        self.roster.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.sets.is_empty()
    }

    /// Finalize `set`'s layout if needed, allocate it, write its bindings and
    /// return its position in the pool.
    pub fn allocate_set(&mut self, set: &mut DescriptorSet) -> Result<usize> {
        self.roster.ensure_capacity()?;
        if set.is_allocated() {
            return Err(GpuError::InvalidState(
                "descriptor set is already allocated".to_string(),
            ));
        }
        set.finalize_layout()?;

        let layouts = [set.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        // SAFETY: the pool and layout are alive.
        let handle = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info) }?
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidState("no descriptor set returned".to_string()))?;

        *set.handle.lock() = handle;
        let index = self.roster.push(Arc::clone(&set.handle))?;
        set.update()?;
        Ok(index)
    }

    /// Free the set at `index`; later sets shift down by one. The freed
    /// [`DescriptorSet`] reads as unallocated and can be allocated again.
    pub fn remove_set(&mut self, index: usize) -> Result<()> {
        let set = self.roster.remove(index)?;
        // SAFETY: the set came from this pool and is no longer in use.
        unsafe { self.device.handle().free_descriptor_sets(self.handle, &[set]) }?;
        Ok(())
    }

    /// Free every set allocated from the pool.
    pub fn remove_all_sets(&mut self) -> Result<()> {
        if self.roster.sets.is_empty() {
            return Ok(());
        }
        let sets = self.roster.remove_all();
        // SAFETY: every set came from this pool and none is in use.
        unsafe { self.device.handle().free_descriptor_sets(self.handle, &sets) }?;
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if let Err(e) = self.remove_all_sets() {
            warn!("Failed to free descriptor sets: {e}");
        }
        // SAFETY: the pool is owned exclusively.
        unsafe { self.device.handle().destroy_descriptor_pool(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer_resource() -> BindingResource {
        BindingResource::Buffer(vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: 64,
        })
    }

    #[test]
    fn binding_index_is_insertion_order() {
        let mut table = BindingTable::default();
        let stages = vk::ShaderStageFlags::COMPUTE;
        assert_eq!(table.push(DescriptorKind::StorageBuffer, stages, buffer_resource()).unwrap(), 0);
        assert_eq!(table.push(DescriptorKind::UniformBuffer, stages, buffer_resource()).unwrap(), 1);
        assert_eq!(table.bindings[1].binding, 1);
        assert_eq!(
            table.bindings[1].descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER
        );
    }

    #[test]
    fn sealed_table_rejects_bindings() {
        let mut table = BindingTable::default();
        let stages = vk::ShaderStageFlags::COMPUTE;
        table.push(DescriptorKind::StorageBuffer, stages, buffer_resource()).unwrap();
        table.sealed = true;
        assert!(matches!(
            table.push(DescriptorKind::StorageBuffer, stages, buffer_resource()),
            Err(GpuError::InvalidState(_))
        ));
        // Replacing an existing binding stays allowed.
        assert!(table
            .replace(0, DescriptorKind::StorageBuffer, buffer_resource())
            .is_ok());
    }

    #[test]
    fn kinds_must_match_resources() {
        let mut table = BindingTable::default();
        let stages = vk::ShaderStageFlags::FRAGMENT;
        assert!(table
            .push(DescriptorKind::StorageImage, stages, buffer_resource())
            .is_err());

        let unsampled = BindingResource::Image(vk::DescriptorImageInfo::default());
        assert!(table
            .push(DescriptorKind::CombinedImageSampler, stages, unsampled)
            .is_err());
        assert!(table
            .push(DescriptorKind::StorageImage, stages, unsampled)
            .is_ok());

        assert!(table
            .replace(0, DescriptorKind::SampledImage, unsampled)
            .is_err());
        assert!(table
            .replace(5, DescriptorKind::StorageImage, unsampled)
            .is_err());
    }

    fn slot(raw: u64) -> SetSlot {
        Arc::new(Mutex::new(vk::DescriptorSet::from_raw(raw)))
    }

    #[test]
    fn roster_enforces_the_set_cap() {
        let mut roster = SetRoster {
            max_sets: 2,
            sets: Vec::new(),
        };
        assert_eq!(roster.push(slot(1)).unwrap(), 0);
        assert_eq!(roster.push(slot(2)).unwrap(), 1);
        assert!(matches!(
            roster.push(slot(3)),
            Err(GpuError::DescriptorPoolExhausted { max_sets: 2 })
        ));

        roster.remove(0).unwrap();
        assert!(roster.ensure_capacity().is_ok());
        assert!(roster.remove(3).is_err());
    }

    #[test]
    fn removed_slots_read_as_unallocated() {
        let mut roster = SetRoster {
            max_sets: 1,
            sets: Vec::new(),
        };
        let first = slot(11);
        roster.push(Arc::clone(&first)).unwrap();

        assert_eq!(roster.remove(0).unwrap(), vk::DescriptorSet::from_raw(11));
        assert_eq!(*first.lock(), vk::DescriptorSet::null());

        // The freed place can be taken again, and clearing the pool nulls it too.
        let second = slot(12);
        roster.push(Arc::clone(&second)).unwrap();
        assert_eq!(roster.remove_all(), vec![vk::DescriptorSet::from_raw(12)]);
        assert_eq!(*second.lock(), vk::DescriptorSet::null());
        assert!(roster.sets.is_empty());
    }
}
