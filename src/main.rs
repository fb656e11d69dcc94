use anyhow::Result;
use flora_memory::{
    AllocationFlags, AllocationRequest, AllocationStrategy, AllocatorDesc, DeviceBackend,
    MemoryAllocator, MemoryUsage, MockBackend, MockBackendDesc,
};
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Drives the allocator through a few frames of made-up renderer traffic on
/// the mock device and logs what it ends up holding.
fn simulate(allocator: &MemoryAllocator, frames: usize) -> Result<()> {
    let mut meshes = Vec::new();
    for i in 0..64u64 {
        let name = format!("mesh {}", i);
        let request = AllocationRequest::new(&name, 4096 + i * 1024, MemoryUsage::GpuOnly)
            .with_alignment(256);
        meshes.push(allocator.allocate(&request)?);
    }

    let staging = allocator.allocate(
        &AllocationRequest::new("staging", 2 * MIB, MemoryUsage::CpuToGpu)
            .with_flags(AllocationFlags::MAPPED),
    )?;
    staging.write_floats(0, &[0.0, 1.0, 2.0, 3.0])?;
    staging.flush(0, 16)?;

    let shadow_map =
        AllocationRequest::new("shadow map", 48 * MIB, MemoryUsage::GpuOnly).with_priority(1.0);
    log::info!("'{}' is {:?}", shadow_map.debug_name, allocator.route_for(&shadow_map));
    let shadow_map = allocator.allocate(&shadow_map)?;

    for frame in 0..frames {
        let released = allocator.begin_frame();
        log::debug!("Frame {} reclaimed {} transient allocations", frame, released.count);

        let uniforms = allocator.allocate(&AllocationRequest::new(
            "frame uniforms",
            16 * 1024,
            MemoryUsage::FrameTransient,
        ))?;
        uniforms.write_pod(0, &(frame as u32))?;

        // every other mesh is streamed out
        if frame == frames / 2 {
            for mesh in meshes.iter().skip(1).step_by(2) {
                allocator.free(mesh);
            }
        }
    }

    let report = allocator.defragment();
    log::info!(
        "Defragmentation released {} blocks and planned {} moves",
        report.released.count,
        report.plans.iter().map(|p| p.moves.len()).sum::<usize>()
    );

    let statistics = allocator.statistics();
    println!("{}", statistics.to_table());

    for mesh in meshes.iter().step_by(2) {
        allocator.free(mesh);
    }
    allocator.free(&staging);
    allocator.free(&shadow_map);
    Ok(())
}

pub fn main() -> Result<()> {
    env_logger::init();

    let backend: Arc<dyn DeviceBackend> = Arc::new(MockBackend::new(MockBackendDesc::discrete()));
    let allocator = MemoryAllocator::new(
        backend,
        AllocatorDesc {
            strategy: AllocationStrategy::BestFit,
            frames_in_flight: 3,
            frame_block_size: MIB,
            budget_refresh_interval: Duration::from_millis(100),
            ..Default::default()
        },
    )?;

    simulate(&allocator, 8)
}
