//! Command queues and ring-buffered command recording.
//!
//! A [`CommandQueue`] owns a fixed ring of reusable [`CommandBuffer`]s, each
//! paired with a fence and a submit semaphore. Acquiring a command buffer
//! blocks until any ring entry has finished on the GPU, so the CPU can run at
//! most `ring_size` frames ahead without a spin loop anywhere.
//!
//! Barriers are not recorded one by one. They accumulate in a batch on the
//! command buffer and [`CommandBuffer::flush_barriers`] records them as a
//! single `vkCmdPipelineBarrier2` call.

use std::sync::Arc;

use ash::vk;

use crate::buffer::Buffer;
use crate::descriptors::ResourceGroup;
use crate::error::{GpuError, Result};
use crate::pipeline::{ComputePipelineState, PipelineState};
use crate::swapchain::{Drawable, Layer};
use crate::sync;

/// Which hardware queue a command queue records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// Parameters for [`crate::Device::make_command_queue`].
#[derive(Debug, Clone, Copy)]
pub struct CommandQueueDescription {
    pub kind: QueueKind,
    /// Ring length, the number of submissions that can be in flight at once.
    pub ring_size: usize,
}

impl Default for CommandQueueDescription {
    fn default() -> Self {
        Self {
            kind: QueueKind::Graphics,
            ring_size: 3,
        }
    }
}

/// An execution-ready memory barrier between pipeline stages.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl Default for MemoryBarrier {
    fn default() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }
}

/// A barrier over a buffer range.
#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl Default for BufferBarrier {
    fn default() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }
}

/// A layout transition plus memory barrier over a whole image.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl Default for ImageBarrier {
    fn default() -> Self {
        Self {
            image: vk::Image::null(),
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            src_access: vk::AccessFlags2::empty(),
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }
}

// The vk barrier structs carry a lifetime only for p_next, which the batch
// never uses, so 'static variants are storable.
#[derive(Default)]
struct BarrierBatch {
    memory: Vec<vk::MemoryBarrier2<'static>>,
    buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
    images: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    fn push_memory(&mut self, barrier: &MemoryBarrier) {
        self.memory.push(
            vk::MemoryBarrier2::default()
                .src_stage_mask(barrier.src_stage)
                .src_access_mask(barrier.src_access)
                .dst_stage_mask(barrier.dst_stage)
                .dst_access_mask(barrier.dst_access),
        );
    }

    fn push_buffer(&mut self, barrier: &BufferBarrier) {
        self.buffers.push(
            vk::BufferMemoryBarrier2::default()
                .buffer(barrier.buffer)
                .offset(barrier.offset)
                .size(barrier.size)
                .src_stage_mask(barrier.src_stage)
                .src_access_mask(barrier.src_access)
                .dst_stage_mask(barrier.dst_stage)
                .dst_access_mask(barrier.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
        );
    }

    fn push_image(&mut self, barrier: &ImageBarrier) {
        self.images.push(
            vk::ImageMemoryBarrier2::default()
                .image(barrier.image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(barrier.aspect)
                        .base_mip_level(0)
                        .level_count(vk::REMAINING_MIP_LEVELS)
                        .base_array_layer(0)
                        .layer_count(vk::REMAINING_ARRAY_LAYERS),
                )
                .old_layout(barrier.old_layout)
                .new_layout(barrier.new_layout)
                .src_stage_mask(barrier.src_stage)
                .src_access_mask(barrier.src_access)
                .dst_stage_mask(barrier.dst_stage)
                .dst_access_mask(barrier.dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
        );
    }

    fn len(&self) -> usize {
        self.memory.len() + self.buffers.len() + self.images.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self) {
        self.memory.clear();
        self.buffers.clear();
        self.images.clear();
    }

    /// Record the whole batch as one `vkCmdPipelineBarrier2` and clear it.
    ///
    /// # Safety
    /// The command buffer must be recording.
    unsafe fn record(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }

        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images);
        device.cmd_pipeline_barrier2(cmd, &dependency);

        self.clear();
    }
}

/// A color target for [`CommandBuffer::begin_rendering`].
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment {
    pub view: vk::ImageView,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_color: [f32; 4],
}

impl ColorAttachment {
    /// Clear to a color at load, keep the result.
    pub fn clear(view: vk::ImageView, clear_color: [f32; 4]) -> Self {
        Self {
            view,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_color,
        }
    }
}

/// A depth target for [`CommandBuffer::begin_rendering`].
#[derive(Debug, Clone, Copy)]
pub struct DepthAttachment {
    pub view: vk::ImageView,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_depth: f32,
}

impl DepthAttachment {
    pub fn clear(view: vk::ImageView, clear_depth: f32) -> Self {
        Self {
            view,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear_depth,
        }
    }
}

/// A dynamic rendering pass over a set of attachments.
#[derive(Debug, Clone)]
pub struct RenderingInfo<'a> {
    pub render_area: vk::Rect2D,
    pub color_attachments: &'a [ColorAttachment],
    pub depth_attachment: Option<DepthAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Idle,
    Recording,
    Submitted,
}

#[derive(Clone)]
struct Binding {
    bind_point: vk::PipelineBindPoint,
    layout: vk::PipelineLayout,
    push_ranges: Vec<vk::PushConstantRange>,
}

/// A queue with its command buffer ring.
///
/// Queues are single-threaded: recording and submission happen from one
/// thread at a time, which the `&mut` receivers enforce.
pub struct CommandQueue {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    family: u32,
    kind: QueueKind,
    pool: vk::CommandPool,
    ring: Vec<CommandBuffer>,
}

impl CommandQueue {
    /// Build the ring: one pool, `ring_size` command buffers, each with a
    /// signaled fence so the first acquires return immediately.
    ///
    /// # Safety
    /// The device, queue, and family must be valid and match.
    pub(crate) unsafe fn new(
        device: Arc<ash::Device>,
        queue: vk::Queue,
        family: u32,
        desc: &CommandQueueDescription,
    ) -> Result<Self> {
        if desc.ring_size == 0 {
            return Err(GpuError::InvalidState(
                "Command queue ring size must be at least 1".to_string(),
            ));
        }

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = device.create_command_pool(&pool_info, None)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(desc.ring_size as u32);
        let handles = match device.allocate_command_buffers(&alloc_info) {
            Ok(handles) => handles,
            Err(e) => {
                device.destroy_command_pool(pool, None);
                return Err(e.into());
            }
        };

        let mut ring: Vec<CommandBuffer> = Vec::with_capacity(handles.len());
        let mut build_entry = |handle| -> Result<CommandBuffer> {
            let fence = sync::create_fence(&device, true)?;
            let submit_semaphore = match sync::create_semaphore(&device) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    unsafe { device.destroy_fence(fence, None) };
                    return Err(e);
                }
            };
            Ok(CommandBuffer {
                device: Arc::clone(&device),
                queue,
                handle,
                fence,
                submit_semaphore,
                semaphore_pending: false,
                state: RecordState::Idle,
                bound: None,
                barriers: BarrierBatch::default(),
                color_scratch: Vec::new(),
            })
        };

        for handle in handles {
            match build_entry(handle) {
                Ok(entry) => ring.push(entry),
                Err(e) => {
                    for cb in &ring {
                        CommandBuffer::destroy(cb, &device);
                    }
                    device.destroy_command_pool(pool, None);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            device,
            queue,
            family,
            kind: desc.kind,
            pool,
            ring,
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn handle(&self) -> vk::Queue {
        self.queue
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    /// Acquire a command buffer from the ring and begin recording it.
    ///
    /// Blocks until some ring entry has retired on the GPU. With every entry
    /// in flight this is the frame pacing point: the call sleeps on the
    /// fences rather than polling them.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn make_command_buffer(&mut self) -> Result<&mut CommandBuffer> {
        let fences: Vec<vk::Fence> = self.ring.iter().map(|cb| cb.fence).collect();
        unsafe { self.device.wait_for_fences(&fences, false, u64::MAX)? };

        let mut ready = None;
        for (index, cb) in self.ring.iter().enumerate() {
            if unsafe { self.device.get_fence_status(cb.fence)? } {
                ready = Some(index);
                break;
            }
        }
        let index = ready.ok_or_else(|| {
            GpuError::InvalidState("No command buffer ready after fence wait".to_string())
        })?;

        let cb = &mut self.ring[index];
        cb.begin()?;
        Ok(cb)
    }

    /// Record and run a throwaway command buffer, blocking until the queue
    /// drains. For uploads and other setup work, not per-frame recording.
    pub fn submit_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self.device.allocate_command_buffers(&alloc_info)?[0];

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info)?;
            record(&self.device, cmd);
            self.device.end_command_buffer(cmd)?;

            let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
            let submit = vk::SubmitInfo2::default()
                .command_buffer_infos(std::slice::from_ref(&cmd_info));
            let result = self
                .device
                .queue_submit2(self.queue, &[submit], vk::Fence::null())
                .and_then(|()| self.device.queue_wait_idle(self.queue));

            self.device.free_command_buffers(self.pool, &[cmd]);
            result?;
        }

        Ok(())
    }

    /// Block until every submission on this queue has retired.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    /// Destroy the ring and pool.
    ///
    /// # Safety
    /// The device must be valid; the queue is drained first.
    pub(crate) unsafe fn destroy(&self) -> Result<()> {
        self.device.queue_wait_idle(self.queue)?;
        for cb in &self.ring {
            CommandBuffer::destroy(cb, &self.device);
        }
        self.device.destroy_command_pool(self.pool, None);
        Ok(())
    }
}

/// One reusable ring entry.
///
/// The lifecycle is acquire (begins recording), record, [`submit`], then
/// optionally [`present`] and [`wait_until_completed`]. The entry returns to
/// the ring once its fence signals.
///
/// [`submit`]: CommandBuffer::submit
/// [`present`]: CommandBuffer::present
pub struct CommandBuffer {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    submit_semaphore: vk::Semaphore,
    // True while the submit semaphore is signaled with no wait queued for
    // it. Binary semaphores cannot be reset from the host, so a stranded one
    // is replaced before the next submit.
    semaphore_pending: bool,
    state: RecordState,
    bound: Option<Binding>,
    barriers: BarrierBatch,
    color_scratch: Vec<vk::RenderingAttachmentInfo<'static>>,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Barriers batched and not yet recorded.
    pub fn pending_barriers(&self) -> usize {
        self.barriers.len()
    }

    fn begin(&mut self) -> Result<()> {
        // The pool allows per-buffer reset, so beginning implicitly resets
        // the previous recording.
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.handle, &begin_info)? };

        self.state = RecordState::Recording;
        self.bound = None;
        self.barriers.clear();
        Ok(())
    }

    /// End recording and hand the buffer to the GPU. Signals the submit
    /// semaphore for a following [`CommandBuffer::present`] and arms the
    /// ring fence.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&mut self) -> Result<()> {
        if self.state != RecordState::Recording {
            return Err(GpuError::InvalidState(
                "Command buffer is not recording".to_string(),
            ));
        }

        if !self.barriers.is_empty() {
            tracing::warn!(
                pending = self.barriers.len(),
                "Submitting with unflushed barriers, recording them at the end"
            );
            unsafe { self.barriers.record(&self.device, self.handle) };
        }

        unsafe {
            self.device.end_command_buffer(self.handle)?;

            if self.semaphore_pending {
                // Signaled by an earlier submit that was never presented.
                self.device.destroy_semaphore(self.submit_semaphore, None);
                self.submit_semaphore = sync::create_semaphore(&self.device)?;
                self.semaphore_pending = false;
            }

            // Reset here rather than in begin so an acquired-but-abandoned
            // buffer keeps its fence signaled and stays acquirable.
            sync::reset_fence(&self.device, self.fence)?;

            let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(self.handle);
            let signal_info = vk::SemaphoreSubmitInfo::default()
                .semaphore(self.submit_semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
            let submit = vk::SubmitInfo2::default()
                .command_buffer_infos(std::slice::from_ref(&cmd_info))
                .signal_semaphore_infos(std::slice::from_ref(&signal_info));

            self.device.queue_submit2(self.queue, &[submit], self.fence)?;
        }

        self.state = RecordState::Submitted;
        self.semaphore_pending = true;
        self.bound = None;
        Ok(())
    }

    /// Queue the drawable for presentation after this buffer's work.
    ///
    /// Consumes the drawable; a frame's drawable is presented exactly once.
    /// Returns `Ok(true)` when the swapchain no longer matches the surface
    /// and the layer needs a rebuild.
    pub fn present(&mut self, layer: &mut Layer, drawable: Drawable) -> Result<bool> {
        if self.state != RecordState::Submitted {
            return Err(GpuError::InvalidState(
                "Present requires a submitted command buffer".to_string(),
            ));
        }

        let needs_rebuild = layer.present_drawable(self.queue, drawable, self.submit_semaphore)?;
        self.semaphore_pending = false;
        Ok(needs_rebuild)
    }

    /// Block until this buffer's last submission retires. A buffer that was
    /// never submitted returns immediately.
    pub fn wait_until_completed(&self) -> Result<()> {
        if self.state != RecordState::Submitted {
            return Ok(());
        }
        sync::wait_for_fence(&self.device, self.fence, u64::MAX)
    }

    // Recording ----------------------------------------------------------

    /// Bind a graphics pipeline. Later draws, resource groups, and push
    /// constants use its layout.
    pub fn set_pipeline_state(&mut self, pipeline: &PipelineState) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device.cmd_bind_pipeline(
                self.handle,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
        }
        self.bound = Some(Binding {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout: pipeline.layout,
            push_ranges: pipeline.plan.push_constant_ranges.clone(),
        });
    }

    /// Bind a compute pipeline.
    pub fn set_compute_pipeline_state(&mut self, pipeline: &ComputePipelineState) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device.cmd_bind_pipeline(
                self.handle,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline,
            );
        }
        self.bound = Some(Binding {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout: pipeline.layout,
            push_ranges: pipeline.plan.push_constant_ranges.clone(),
        });
    }

    /// Bind a resource group at its set index under the current pipeline.
    pub fn set_resource_group(&mut self, group: &ResourceGroup) -> Result<()> {
        let binding = self.require_binding()?;
        let sets = [group.handle()];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.handle,
                binding.bind_point,
                binding.layout,
                group.set_index(),
                &sets,
                &[],
            );
        }
        Ok(())
    }

    /// Upload push constants to every stage whose declared range overlaps
    /// the written bytes. The write is recorded in segments split at range
    /// edges, so a stage with a smaller block receives its declared window
    /// and never the tail beyond it.
    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let binding = self.require_binding()?;
        if binding.push_ranges.is_empty() {
            return Err(GpuError::InvalidState(
                "Current pipeline declares no push constants".to_string(),
            ));
        }

        let start = u64::from(offset);
        let segments = push_segments(&binding.push_ranges, start, start + data.len() as u64)?;

        let layout = binding.layout;
        for segment in segments {
            let lo = (segment.start - start) as usize;
            let hi = (segment.end - start) as usize;
            unsafe {
                self.device.cmd_push_constants(
                    self.handle,
                    layout,
                    segment.stages,
                    segment.start as u32,
                    &data[lo..hi],
                );
            }
        }
        Ok(())
    }

    fn require_binding(&self) -> Result<&Binding> {
        debug_assert_eq!(self.state, RecordState::Recording);
        self.bound.as_ref().ok_or_else(|| {
            GpuError::InvalidState("No pipeline bound on this command buffer".to_string())
        })
    }

    /// Queue a global memory barrier. Recorded at the next flush.
    pub fn memory_barrier(&mut self, barrier: &MemoryBarrier) {
        debug_assert_eq!(self.state, RecordState::Recording);
        self.barriers.push_memory(barrier);
    }

    /// Queue a buffer barrier. Recorded at the next flush.
    pub fn buffer_barrier(&mut self, barrier: &BufferBarrier) {
        debug_assert_eq!(self.state, RecordState::Recording);
        self.barriers.push_buffer(barrier);
    }

    /// Queue an image barrier. Recorded at the next flush.
    pub fn image_barrier(&mut self, barrier: &ImageBarrier) {
        debug_assert_eq!(self.state, RecordState::Recording);
        self.barriers.push_image(barrier);
    }

    /// Record every queued barrier as one dependency and clear the batch.
    pub fn flush_barriers(&mut self) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe { self.barriers.record(&self.device, self.handle) };
    }

    /// Start a dynamic rendering pass.
    pub fn begin_rendering(&mut self, info: &RenderingInfo) {
        debug_assert_eq!(self.state, RecordState::Recording);

        self.color_scratch.clear();
        for attachment in info.color_attachments {
            self.color_scratch.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(attachment.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(attachment.load_op)
                    .store_op(attachment.store_op)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: attachment.clear_color,
                        },
                    }),
            );
        }

        let mut rendering = vk::RenderingInfo::default()
            .render_area(info.render_area)
            .layer_count(1)
            .color_attachments(&self.color_scratch);

        let depth_info;
        if let Some(depth) = &info.depth_attachment {
            depth_info = vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(depth.load_op)
                .store_op(depth.store_op)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: depth.clear_depth,
                        stencil: 0,
                    },
                });
            rendering = rendering.depth_attachment(&depth_info);
        }

        unsafe { self.device.cmd_begin_rendering(self.handle, &rendering) };
    }

    /// End the current dynamic rendering pass.
    pub fn end_rendering(&mut self) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe { self.device.cmd_end_rendering(self.handle) };
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe { self.device.cmd_set_viewport(self.handle, 0, &[viewport]) };
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe { self.device.cmd_set_scissor(self.handle, 0, &[scissor]) };
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Buffer) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.handle, binding, &[buffer.handle], &[0]);
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.handle, buffer.handle, 0, index_type);
        }
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device.cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        debug_assert_eq!(self.state, RecordState::Recording);
        unsafe {
            self.device
                .cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z);
        }
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_fence(self.fence, None);
        device.destroy_semaphore(self.submit_semaphore, None);
    }
}

struct PushSegment {
    start: u64,
    end: u64,
    stages: vk::ShaderStageFlags,
}

/// Split a push-constant write at declared range edges.
///
/// A recorded update must name every stage whose range overlaps any written
/// byte, while each named stage's range must cover the whole update. Inside
/// one segment the overlapping set is constant, so one update per segment
/// satisfies both. Bytes outside every range are an error.
fn push_segments(
    ranges: &[vk::PushConstantRange],
    start: u64,
    end: u64,
) -> Result<Vec<PushSegment>> {
    let mut edges = vec![start, end];
    for range in ranges {
        let lo = u64::from(range.offset);
        let hi = lo + u64::from(range.size);
        for edge in [lo, hi] {
            if edge > start && edge < end {
                edges.push(edge);
            }
        }
    }
    edges.sort_unstable();
    edges.dedup();

    let mut segments = Vec::with_capacity(edges.len() - 1);
    for pair in edges.windows(2) {
        let (seg_start, seg_end) = (pair[0], pair[1]);
        let stages = ranges
            .iter()
            .filter(|range| {
                u64::from(range.offset) <= seg_start
                    && seg_end <= u64::from(range.offset) + u64::from(range.size)
            })
            .fold(vk::ShaderStageFlags::empty(), |acc, range| {
                acc | range.stage_flags
            });
        if stages.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "No push constant range of the current pipeline covers bytes {seg_start}..{seg_end}"
            )));
        }
        segments.push(PushSegment {
            start: seg_start,
            end: seg_end,
            stages,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_accumulates_all_barrier_kinds() {
        let mut batch = BarrierBatch::default();
        assert!(batch.is_empty());

        batch.push_memory(&MemoryBarrier::default());
        batch.push_buffer(&BufferBarrier::default());
        batch.push_image(&ImageBarrier::default());
        batch.push_image(&ImageBarrier::default());

        assert_eq!(batch.len(), 4);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn image_barrier_covers_whole_subresource() {
        let mut batch = BarrierBatch::default();
        batch.push_image(&ImageBarrier {
            aspect: vk::ImageAspectFlags::DEPTH,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ..ImageBarrier::default()
        });

        let raw = &batch.images[0];
        assert_eq!(raw.subresource_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(raw.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(raw.subresource_range.layer_count, vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(raw.new_layout, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn ownership_transfer_is_not_implied() {
        let mut batch = BarrierBatch::default();
        batch.push_buffer(&BufferBarrier::default());
        batch.push_image(&ImageBarrier::default());

        // Zeroed defaults would mean a transfer to queue family 0.
        assert_eq!(batch.buffers[0].src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(batch.buffers[0].dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(batch.images[0].src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(batch.images[0].dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn default_queue_is_a_triple_ring_on_graphics() {
        let desc = CommandQueueDescription::default();
        assert_eq!(desc.kind, QueueKind::Graphics);
        assert_eq!(desc.ring_size, 3);
    }

    #[test]
    fn unequal_stage_blocks_split_the_push() {
        let ranges = [
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 128,
            },
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: 64,
            },
        ];

        let segments = push_segments(&ranges, 0, 128).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].end, 64);
        assert_eq!(
            segments[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(segments[1].start, 64);
        assert_eq!(segments[1].end, 128);
        assert_eq!(segments[1].stages, vk::ShaderStageFlags::VERTEX);

        // A write inside the shared window reaches both stages in one update.
        let segments = push_segments(&ranges, 0, 64).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(
            segments[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn matching_blocks_push_in_one_update() {
        let ranges = [
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 64,
            },
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: 64,
            },
        ];

        let segments = push_segments(&ranges, 0, 64).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].end, 64);
        assert_eq!(
            segments[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn pushes_past_every_range_are_rejected() {
        let ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: 64,
        }];

        assert!(push_segments(&ranges, 0, 64).is_ok());
        // Bytes 64..96 fall outside the only declared range.
        assert!(push_segments(&ranges, 32, 96).is_err());
    }
}
