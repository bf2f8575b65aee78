//! Device construction and the resource factory.
//!
//! [`ContextBuilder`] configures instance-level state (application name,
//! validation). [`Context::create_device`] picks the physical device and
//! turns the context into a [`Device`], which is the factory every other
//! object in this crate is created through and freed through.

use std::collections::HashSet;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::buffer::{memory_location_for, Buffer, BufferDescription};
use crate::capabilities::GpuCapabilities;
use crate::command::{CommandQueue, CommandQueueDescription, QueueKind};
use crate::deferred::DeferredQueue;
use crate::descriptors::ResourceGroup;
use crate::error::{GpuError, Result};
use crate::instance::{create_debug_messenger, create_instance, select_physical_device};
use crate::memory::MemoryPool;
use crate::pipeline::{ComputePipelineState, PipelineState, PipelineStateDescription};
use crate::sampler::{Sampler, SamplerDescription};
use crate::shader::{spirv_from_bytes, Function, Library};
use crate::surface::SurfaceContext;
use crate::swapchain::{Layer, LayerDescription};
use crate::texture::{aspect_for_format, Texture, TextureDescription};

type DebugMessenger = (ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT);

/// Builder for instance-level state.
pub struct ContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "vfx".to_string(),
            enable_validation: default_validation_toggle(),
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name reported to the driver.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Force validation layers on or off, overriding the `VFX_VALIDATION`
    /// environment variable and the build-profile default.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Load Vulkan and create the instance, with a debug messenger when
    /// validation is enabled.
    pub fn build(self) -> Result<Context> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance =
            unsafe { create_instance(&entry, &self.app_name, self.enable_validation)? };

        let debug = if self.enable_validation {
            match unsafe { create_debug_messenger(&entry, &instance) } {
                Ok(pair) => Some(pair),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Context {
            entry,
            instance,
            debug,
        })
    }
}

/// Validation defaults to the `VFX_VALIDATION` environment variable and
/// falls back to the build profile when unset.
fn default_validation_toggle() -> bool {
    match std::env::var("VFX_VALIDATION") {
        Ok(value) => parse_validation_toggle(&value),
        Err(_) => cfg!(debug_assertions),
    }
}

/// "0", "false", "off", and empty disable validation; anything else enables.
fn parse_validation_toggle(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off"
    )
}

/// Instance-level creation state, consumed by [`Context::create_device`].
pub struct Context {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
}

impl Context {
    /// Select a physical device and build the [`Device`] around it.
    ///
    /// The context is consumed either way; on failure the instance is
    /// destroyed before the error is returned.
    pub fn create_device(self) -> Result<Device> {
        let result = self.build_device();
        if result.is_err() {
            unsafe { self.destroy_handles() };
        }
        result
    }

    /// Tear the instance down without creating a device.
    pub fn destroy(self) {
        unsafe { self.destroy_handles() };
    }

    fn build_device(&self) -> Result<Device> {
        let physical_device = unsafe { select_physical_device(&self.instance)? };

        let capabilities = unsafe { GpuCapabilities::query(&self.instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let families = unsafe { find_queue_families(&self.instance, physical_device)? };

        let (device, graphics_queue, compute_queue, transfer_queue) =
            unsafe { create_logical_device(&self.instance, physical_device, &families)? };
        let device = Arc::new(device);

        let memory =
            match unsafe { MemoryPool::new(&self.instance, device.clone(), physical_device) } {
                Ok(pool) => pool,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        Ok(Device {
            entry: self.entry.clone(),
            instance: self.instance.clone(),
            debug: self.debug.clone(),
            physical_device,
            device,
            capabilities,
            memory: Mutex::new(memory),
            graphics_queue_family: families.graphics,
            compute_queue_family: families.compute,
            transfer_queue_family: families.transfer,
            graphics_queue,
            compute_queue,
            transfer_queue,
            frame: AtomicU64::new(0),
            reclaim: Mutex::new(DeferredQueue::new(
                CommandQueueDescription::default().ring_size,
            )),
        })
    }

    unsafe fn destroy_handles(&self) {
        if let Some((loader, messenger)) = &self.debug {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

/// The resource factory.
///
/// Every buffer, texture, sampler, library, pipeline, resource group, queue,
/// and layer is made by a `Device` and given back to it with the matching
/// `free_*` call (or parked with `retire_*` while frames may still reference
/// it). No resource may outlive the device that made it.
///
/// Creation is all-or-nothing: a failed `make_*` call leaves nothing behind
/// and the error propagates to the caller unchanged.
pub struct Device {
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    memory: Mutex<MemoryPool>,

    graphics_queue_family: u32,
    compute_queue_family: u32,
    transfer_queue_family: u32,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,

    frame: AtomicU64,
    reclaim: Mutex<DeferredQueue<RetiredResource>>,
}

/// A resource parked until its retirement window closes.
enum RetiredResource {
    Buffer(Buffer),
    Texture(Texture),
}

impl Device {
    /// Get the raw Vulkan device handle.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the capabilities queried at device selection.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the compute queue family index.
    pub fn compute_queue_family(&self) -> u32 {
        self.compute_queue_family
    }

    /// Get the transfer queue family index.
    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Frame number as of the last [`Device::advance_frame`].
    pub fn frame_number(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Number of live allocations, for leak checks in tests.
    pub fn live_allocations(&self) -> usize {
        self.memory.lock().live_allocations()
    }

    pub(crate) fn memory_pool(&self) -> MutexGuard<'_, MemoryPool> {
        self.memory.lock()
    }

    // Factory ------------------------------------------------------------

    /// Create a buffer. Residency follows usage: transfer destinations that
    /// are never read back live in device-local memory, everything else is
    /// host-visible and persistently mapped.
    pub fn make_buffer(&self, desc: &BufferDescription) -> Result<Buffer> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState(
                "Buffer size must be non-zero".to_string(),
            ));
        }

        let location = memory_location_for(desc.usage);
        let (handle, memory) =
            self.memory_pool()
                .create_buffer(desc.size, desc.usage.to_vk(), location, desc.label)?;

        Ok(Buffer {
            handle,
            memory,
            size: desc.size,
            usage: desc.usage,
        })
    }

    /// Destroy a buffer and release its memory.
    pub fn free_buffer(&self, buffer: Buffer) -> Result<()> {
        self.memory_pool().free_buffer(buffer.handle, buffer.memory)
    }

    /// Create a 2D texture in device-local memory, with its default view.
    pub fn make_texture(&self, desc: &TextureDescription) -> Result<Texture> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::InvalidState(
                "Texture extent must be non-zero".to_string(),
            ));
        }
        if desc.mip_levels == 0 {
            return Err(GpuError::InvalidState(
                "Texture needs at least one mip level".to_string(),
            ));
        }
        let limit = self.capabilities.max_image_dimension_2d;
        if desc.width > limit || desc.height > limit {
            return Err(GpuError::InvalidState(format!(
                "Texture extent {}x{} exceeds the device limit of {limit}",
                desc.width, desc.height
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, memory) = self.memory_pool().create_image(&image_info, desc.label)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_for_format(desc.format))
                    .base_mip_level(0)
                    .level_count(desc.mip_levels)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                if let Err(free_err) = self.memory_pool().free_image(image, memory) {
                    tracing::warn!("Failed to release image after view failure: {free_err}");
                }
                return Err(e.into());
            }
        };

        Ok(Texture {
            image,
            view,
            memory: Some(memory),
            format: desc.format,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            usage: desc.usage,
            mip_levels: desc.mip_levels,
        })
    }

    /// Destroy a texture, its view, and (for owned textures) its memory.
    pub fn free_texture(&self, texture: Texture) -> Result<()> {
        unsafe { self.device.destroy_image_view(texture.view, None) };
        match texture.memory {
            Some(memory) => self.memory_pool().free_image(texture.image, memory),
            // Swapchain images are owned by their swapchain.
            None => Ok(()),
        }
    }

    /// Create an immutable sampler.
    pub fn make_sampler(&self, desc: &SamplerDescription) -> Result<Sampler> {
        let info = desc.to_vk(self.capabilities.max_sampler_anisotropy);
        let handle = unsafe { self.device.create_sampler(&info, None)? };
        Ok(Sampler { handle })
    }

    /// Destroy a sampler.
    pub fn free_sampler(&self, sampler: Sampler) {
        unsafe { self.device.destroy_sampler(sampler.handle, None) };
    }

    /// Build a shader library from SPIR-V words, reflecting every entry
    /// point. The library frees its module when the last [`Arc`] drops.
    pub fn make_library(&self, code: &[u32]) -> Result<Arc<Library>> {
        unsafe { Library::new(self.device.clone(), code) }.map(Arc::new)
    }

    /// Build a shader library from raw SPIR-V bytes, validating alignment
    /// and magic before reflection.
    pub fn make_library_from_bytes(&self, bytes: &[u8]) -> Result<Arc<Library>> {
        let code = spirv_from_bytes(bytes)?;
        self.make_library(&code)
    }

    /// Build a graphics pipeline from reflected shader stages.
    pub fn make_pipeline_state(&self, desc: &PipelineStateDescription) -> Result<PipelineState> {
        unsafe { PipelineState::new(&self.device, &self.capabilities, desc) }
    }

    /// Destroy a graphics pipeline and its layouts.
    pub fn free_pipeline_state(&self, pipeline: PipelineState) {
        unsafe { pipeline.destroy(&self.device) };
    }

    /// Build a compute pipeline around a single compute entry point, with
    /// the same reflection-derived layout handling as the graphics path.
    pub fn make_compute_pipeline_state(&self, function: &Function) -> Result<ComputePipelineState> {
        unsafe { ComputePipelineState::new(&self.device, &self.capabilities, function) }
    }

    /// Destroy a compute pipeline and its layouts.
    pub fn free_compute_pipeline_state(&self, pipeline: ComputePipelineState) {
        unsafe { pipeline.destroy(&self.device) };
    }

    /// Create a command queue with its ring of reusable command buffers.
    pub fn make_command_queue(&self, desc: &CommandQueueDescription) -> Result<CommandQueue> {
        let (family, queue) = match desc.kind {
            QueueKind::Graphics => (self.graphics_queue_family, self.graphics_queue),
            QueueKind::Compute => (self.compute_queue_family, self.compute_queue),
            QueueKind::Transfer => (self.transfer_queue_family, self.transfer_queue),
        };

        // Retired resources must outlive anything the deepest ring can
        // still have in flight.
        {
            let mut reclaim = self.reclaim.lock();
            if desc.ring_size > reclaim.frames_in_flight() {
                reclaim.set_frames_in_flight(desc.ring_size);
            }
        }

        unsafe { CommandQueue::new(self.device.clone(), queue, family, desc) }
    }

    /// Drain and destroy a command queue.
    pub fn free_command_queue(&self, queue: CommandQueue) -> Result<()> {
        unsafe { queue.destroy() }
    }

    /// Allocate a resource group against one of a graphics pipeline's set
    /// layouts.
    pub fn make_resource_group(
        &self,
        pipeline: &PipelineState,
        set_index: u32,
    ) -> Result<ResourceGroup> {
        let set_layout = set_layout_at(&pipeline.set_layouts, set_index)?;
        unsafe { ResourceGroup::new(self.device.clone(), &pipeline.plan, set_layout, set_index) }
    }

    /// Allocate a resource group against one of a compute pipeline's set
    /// layouts.
    pub fn make_compute_resource_group(
        &self,
        pipeline: &ComputePipelineState,
        set_index: u32,
    ) -> Result<ResourceGroup> {
        let set_layout = set_layout_at(&pipeline.set_layouts, set_index)?;
        unsafe { ResourceGroup::new(self.device.clone(), &pipeline.plan, set_layout, set_index) }
    }

    /// Destroy a resource group and the pool that owns its set.
    pub fn free_resource_group(&self, group: ResourceGroup) {
        unsafe { group.destroy() };
    }

    /// Create a presentation layer on a window.
    pub fn make_layer<W>(&self, window: &W, desc: &LayerDescription) -> Result<Layer>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let surface = unsafe {
            SurfaceContext::from_window(
                &self.entry,
                &self.instance,
                &self.device,
                self.physical_device,
                window,
            )?
        };

        match surface.supports_family(self.graphics_queue_family) {
            Ok(true) => {}
            Ok(false) => {
                unsafe { surface.destroy() };
                return Err(GpuError::SurfaceCreation(
                    "Graphics queue family cannot present to this surface".to_string(),
                ));
            }
            Err(e) => {
                unsafe { surface.destroy() };
                return Err(e);
            }
        }

        unsafe { Layer::new(self.device.clone(), surface, desc) }
    }

    /// Destroy a layer, waiting for the device to go idle first so no
    /// in-flight frame still references its images.
    pub fn free_layer(&self, mut layer: Layer) -> Result<()> {
        self.wait_idle()?;
        unsafe { layer.destroy() };
        Ok(())
    }

    // Frame pacing -------------------------------------------------------

    /// Park a buffer until every frame that may reference it has retired,
    /// then destroy it during a later [`Device::advance_frame`].
    pub fn retire_buffer(&self, buffer: Buffer) {
        let frame = self.frame.load(Ordering::Relaxed);
        self.reclaim
            .lock()
            .retire(RetiredResource::Buffer(buffer), frame);
    }

    /// Park a texture until every frame that may reference it has retired.
    pub fn retire_texture(&self, texture: Texture) {
        let frame = self.frame.load(Ordering::Relaxed);
        self.reclaim
            .lock()
            .retire(RetiredResource::Texture(texture), frame);
    }

    /// Advance the frame counter and destroy retired resources whose
    /// waiting window has closed. Returns the new frame number.
    ///
    /// Call once per frame, before recording.
    pub fn advance_frame(&self) -> u64 {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) + 1;

        let matured = self.reclaim.lock().drain_completed(frame);
        for resource in matured {
            if let Err(e) = self.free_retired(resource) {
                tracing::warn!("Deferred reclaim failed: {e}");
            }
        }

        frame
    }

    fn free_retired(&self, resource: RetiredResource) -> Result<()> {
        match resource {
            RetiredResource::Buffer(buffer) => self.free_buffer(buffer),
            RetiredResource::Texture(texture) => self.free_texture(texture),
        }
    }

    /// Wait for the device to go idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Everything still parked is safe to free after the idle wait.
            let parked = self.reclaim.lock().flush();
            for resource in parked {
                if let Err(e) = self.free_retired(resource) {
                    tracing::warn!("Failed to reclaim resource at shutdown: {e}");
                }
            }

            // Shutdown frees all VkDeviceMemory before the device goes away.
            self.memory.lock().shutdown();

            self.device.destroy_device(None);

            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn set_layout_at(
    set_layouts: &[vk::DescriptorSetLayout],
    set_index: u32,
) -> Result<vk::DescriptorSetLayout> {
    set_layouts
        .get(set_index as usize)
        .copied()
        .ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Pipeline uses {} descriptor sets, set {} does not exist",
                set_layouts.len(),
                set_index
            ))
        })
}

/// Queue family indices chosen for the device.
struct QueueFamilies {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Query queue families and pick graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies> {
    let properties = instance.get_physical_device_queue_family_properties(physical_device);
    pick_queue_families(&properties)
}

/// Prefer dedicated compute and transfer families, falling back along
/// transfer -> compute -> graphics. Graphics is required.
fn pick_queue_families(properties: &[vk::QueueFamilyProperties]) -> Result<QueueFamilies> {
    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in properties.iter().enumerate() {
        let i = i as u32;

        // Dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);

    Ok(QueueFamilies {
        graphics,
        compute,
        transfer,
    })
}

/// Device extensions beyond core 1.3.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device and retrieve one queue per chosen family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
    let mut unique_families = HashSet::new();
    unique_families.insert(families.graphics);
    unique_families.insert(families.compute);
    unique_families.insert(families.transfer);

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let graphics_queue = device.get_device_queue(families.graphics, 0);
    let compute_queue = device.get_device_queue(families.compute, 0);
    let transfer_queue = device.get_device_queue(families.transfer, 0);

    Ok((device, graphics_queue, compute_queue, transfer_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn validation_toggle_parses_common_spellings() {
        assert!(!parse_validation_toggle("0"));
        assert!(!parse_validation_toggle("false"));
        assert!(!parse_validation_toggle("OFF"));
        assert!(!parse_validation_toggle("  off  "));
        assert!(!parse_validation_toggle(""));

        assert!(parse_validation_toggle("1"));
        assert!(parse_validation_toggle("true"));
        assert!(parse_validation_toggle("on"));
        assert!(parse_validation_toggle("verbose"));
    }

    #[test]
    fn single_family_serves_all_roles() {
        let properties = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];

        let families = pick_queue_families(&properties).unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.compute, 0);
        assert_eq!(families.transfer, 0);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let properties = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];

        let families = pick_queue_families(&properties).unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.compute, 1);
        assert_eq!(families.transfer, 2);
    }

    #[test]
    fn transfer_falls_back_to_the_compute_family() {
        let properties = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];

        let families = pick_queue_families(&properties).unwrap();
        assert_eq!(families.compute, 1);
        assert_eq!(families.transfer, 1);
    }

    #[test]
    fn missing_graphics_family_is_an_error() {
        let properties = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        assert!(matches!(
            pick_queue_families(&properties),
            Err(GpuError::NoSuitableDevice)
        ));
    }

    #[test]
    fn set_layout_lookup_validates_the_index() {
        let layouts = [vk::DescriptorSetLayout::null(); 2];
        assert!(set_layout_at(&layouts, 1).is_ok());

        let err = set_layout_at(&layouts, 5).unwrap_err();
        assert!(err.to_string().contains("set 5 does not exist"));
    }
}
