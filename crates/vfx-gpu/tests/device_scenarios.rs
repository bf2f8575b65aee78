//! Scenarios that need a live Vulkan device.
//!
//! These are ignored by default so the suite passes on machines without a
//! GPU; run them with `cargo test -- --ignored` where drivers are available.

use vfx_gpu::{
    BufferDescription, BufferUsage, CommandQueueDescription, ContextBuilder, Device,
    SamplerDescription, TextureDescription, TextureUsage,
};

fn create_device() -> Device {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    ContextBuilder::new()
        .app_name("vfx-test")
        .validation(true)
        .build()
        .expect("Vulkan instance creation failed")
        .create_device()
        .expect("No usable Vulkan device")
}

#[test]
#[ignore = "Requires GPU hardware"]
fn capabilities_report_required_features() {
    let device = create_device();
    let caps = device.capabilities();

    assert!(caps.supports_dynamic_rendering);
    assert!(caps.supports_synchronization2);
    assert!(caps.supports_swapchain);
    assert!(caps.max_push_constant_size >= 128);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn buffer_update_round_trips_through_the_mapping() {
    let device = create_device();

    let buffer = device
        .make_buffer(&BufferDescription::new(64, BufferUsage::VERTEX))
        .unwrap();

    let pattern: Vec<u8> = (0..64).map(|i| i as u8).collect();
    buffer.update(&device, &pattern, 0).unwrap();

    let ptr = buffer.mapped_ptr(&device).unwrap();
    let readback = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert_eq!(readback, &pattern[..]);

    device.free_buffer(buffer).unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn device_local_buffers_reject_mapping() {
    let device = create_device();

    let buffer = device
        .make_buffer(&BufferDescription::new(
            256,
            BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
        ))
        .unwrap();

    assert!(buffer.mapped_ptr(&device).is_err());
    assert!(buffer.update(&device, &[0u8; 16], 0).is_err());

    device.free_buffer(buffer).unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn out_of_range_updates_are_rejected() {
    let device = create_device();

    let buffer = device
        .make_buffer(&BufferDescription::new(32, BufferUsage::UNIFORM))
        .unwrap();

    assert!(buffer.update(&device, &[0u8; 16], 24).is_err());
    assert!(buffer.update(&device, &[0u8; 16], 16).is_ok());

    device.free_buffer(buffer).unwrap();
}

// Cycling more submissions than the ring holds forces acquisition to wait
// for retired fences and reuse slots.
#[test]
#[ignore = "Requires GPU hardware"]
fn command_ring_recycles_after_capacity_submissions() {
    let device = create_device();
    let desc = CommandQueueDescription::default();
    let mut queue = device.make_command_queue(&desc).unwrap();

    for _ in 0..desc.ring_size * 2 + 1 {
        let cb = queue.make_command_buffer().unwrap();
        cb.submit().unwrap();
    }

    queue.wait_idle().unwrap();
    device.free_command_queue(queue).unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn wait_until_completed_blocks_out_a_submission() {
    let device = create_device();
    let mut queue = device
        .make_command_queue(&CommandQueueDescription::default())
        .unwrap();

    let cb = queue.make_command_buffer().unwrap();
    cb.submit().unwrap();
    cb.wait_until_completed().unwrap();

    device.free_command_queue(queue).unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn texture_upload_completes_and_frees_its_staging() {
    let device = create_device();
    let queue = device
        .make_command_queue(&CommandQueueDescription::default())
        .unwrap();
    let baseline = device.live_allocations();

    let texture = device
        .make_texture(&TextureDescription::new(
            4,
            4,
            ash::vk::Format::R8G8B8A8_UNORM,
            TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
        ))
        .unwrap();
    assert_eq!(device.live_allocations(), baseline + 1);

    let texels = vec![0xa5u8; 4 * 4 * 4];
    texture.update(&device, &queue, &texels).unwrap();

    // The staging buffer must be gone once the blocking upload returns.
    assert_eq!(device.live_allocations(), baseline + 1);

    // Failed uploads must not strand a staging allocation either.
    assert!(texture.update(&device, &queue, &texels[..8]).is_err());
    assert_eq!(device.live_allocations(), baseline + 1);

    device.free_texture(texture).unwrap();
    assert_eq!(device.live_allocations(), baseline);

    device.free_command_queue(queue).unwrap();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn textures_beyond_the_device_limit_are_rejected() {
    let device = create_device();
    let limit = device.capabilities().max_image_dimension_2d;

    let result = device.make_texture(&TextureDescription::new(
        limit + 1,
        1,
        ash::vk::Format::R8G8B8A8_UNORM,
        TextureUsage::SAMPLED,
    ));
    assert!(result.is_err());
}

#[test]
#[ignore = "Requires GPU hardware"]
fn retired_buffers_reclaim_once_the_window_closes() {
    let device = create_device();
    let baseline = device.live_allocations();

    let buffer = device
        .make_buffer(&BufferDescription::new(128, BufferUsage::UNIFORM))
        .unwrap();
    device.retire_buffer(buffer);

    // Still parked while frames could reference it.
    assert_eq!(device.live_allocations(), baseline + 1);

    for _ in 0..8 {
        device.advance_frame();
    }
    assert_eq!(device.live_allocations(), baseline);
}

#[test]
#[ignore = "Requires GPU hardware"]
fn samplers_create_and_free() {
    let device = create_device();

    let trilinear = device.make_sampler(&SamplerDescription::default()).unwrap();
    let nearest = device.make_sampler(&SamplerDescription::nearest()).unwrap();

    device.free_sampler(trilinear);
    device.free_sampler(nearest);
}
