//! wgpu compute warp kernel
//!
//! Device, queue, shader module and both pipelines are acquired once in
//! [`GpuKernel::new`] and released when the kernel is dropped. Each warp call
//! uploads one plane, dispatches 16x16 workgroups and reads the result back.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::TransformKernel;
use crate::error::{RegistrationError, Result};
use crate::transform::Transform;

const WARP_SHADER: &str = include_str!("warp.wgsl");
const AFFINE_ENTRY: &str = "warp_affine";
const PERSPECTIVE_ENTRY: &str = "warp_perspective";

/// Shader parameters, must match the WGSL `Params` struct (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WarpParams {
    width: u32,
    height: u32,
    _padding: [u32; 2],
    rows: [[f32; 4]; 3],
}

impl WarpParams {
    fn new(width: usize, height: usize, sampling: &Transform) -> Self {
        let c = sampling.coefficients().map(|v| v as f32);
        Self {
            width: width as u32,
            height: height as u32,
            _padding: [0; 2],
            rows: [
                [c[0], c[1], c[2], 0.0],
                [c[3], c[4], c[5], 0.0],
                [c[6], c[7], c[8], 0.0],
            ],
        }
    }
}

/// Owned accelerator context with the two resampling pipelines
pub struct GpuKernel {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    affine: wgpu::ComputePipeline,
    perspective: wgpu::ComputePipeline,
    adapter_name: String,
}

impl GpuKernel {
    /// Acquire a device and compile the kernels, either the packaged ones or
    /// those in `kernel_source`.
    pub fn new(kernel_source: Option<&Path>) -> Result<Self> {
        let source = match kernel_source {
            Some(path) => std::fs::read_to_string(path).map_err(|e| RegistrationError::io(path, e))?,
            None => WARP_SHADER.to_string(),
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| RegistrationError::Accelerator(format!("no suitable GPU adapter: {}", e)))?;

        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
            .map_err(|e| RegistrationError::Accelerator(format!("failed to create device: {}", e)))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("warp_shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("warp_bind_group_layout"),
            entries: &[
                // Params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Source plane
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Destination plane
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("warp_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let affine = make_pipeline(AFFINE_ENTRY);
        let perspective = make_pipeline(PERSPECTIVE_ENTRY);

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RegistrationError::Accelerator(format!("warp kernels failed to compile: {}", err)));
        }

        info!("GPU warp kernels ready on {}", adapter_name);

        Ok(Self {
            device,
            queue,
            bind_group_layout,
            affine,
            perspective,
            adapter_name,
        })
    }
}

impl TransformKernel for GpuKernel {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn warp_plane(
        &self,
        input: &[f32],
        width: usize,
        height: usize,
        sampling: &Transform,
    ) -> Result<Vec<f32>> {
        let pixels = width * height;
        if pixels == 0 {
            return Ok(Vec::new());
        }
        if input.len() != pixels {
            return Err(RegistrationError::Accelerator(format!(
                "plane has {} samples, expected {}",
                input.len(),
                pixels
            )));
        }

        let pipeline = match sampling {
            Transform::Affine(_) => &self.affine,
            Transform::Perspective(_) => &self.perspective,
        };

        let device = &self.device;
        let output_size = (pixels * std::mem::size_of::<f32>()) as u64;
        check_plane_size(&device.limits(), output_size)?;

        // Anything wgpu rejects from here on must come back as an error, not
        // through the uncaptured-error handler.
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let result = self.dispatch(pipeline, input, width, height, sampling, output_size);
        let oom = pollster::block_on(device.pop_error_scope());
        let validation = pollster::block_on(device.pop_error_scope());

        if let Some(err) = validation.or(oom) {
            return Err(RegistrationError::Accelerator(format!("warp dispatch rejected: {}", err)));
        }
        result
    }
}

impl GpuKernel {
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        input: &[f32],
        width: usize,
        height: usize,
        sampling: &Transform,
        output_size: u64,
    ) -> Result<Vec<f32>> {
        let device = &self.device;
        let params = WarpParams::new(width, height, sampling);

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("warp_params_buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let input_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("warp_input_buffer"),
            contents: bytemuck::cast_slice(input),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("warp_output_buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("warp_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("warp_encoder"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("warp_pass"),
                timestamp_writes: None,
            });

            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);

            // Dispatch workgroups (16x16 threads per group)
            let workgroups_x = (width as u32).div_ceil(16);
            let workgroups_y = (height as u32).div_ceil(16);
            pass.dispatch_workgroups(workgroups_x, workgroups_y, 1);
        }

        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("warp_staging_buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        // Wait for GPU and read back results
        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| RegistrationError::Accelerator(format!("device poll failed: {}", e)))?;
        receiver
            .recv()
            .map_err(|e| RegistrationError::Accelerator(format!("readback channel closed: {}", e)))?
            .map_err(|e| RegistrationError::Accelerator(format!("readback failed: {}", e)))?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(result)
    }
}

/// Planes larger than one storage binding cannot be dispatched in one pass
fn check_plane_size(limits: &wgpu::Limits, bytes: u64) -> Result<()> {
    let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    if bytes > max {
        return Err(RegistrationError::Accelerator(format!(
            "plane of {} bytes exceeds the device buffer limit of {} bytes",
            bytes, max
        )));
    }
    Ok(())
}

impl Drop for GpuKernel {
    fn drop(&mut self) {
        debug!("Releasing GPU warp context on {}", self.adapter_name);
        self.device.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Affine, Homography};
    use crate::warp::CpuKernel;

    fn test_gpu() -> Option<GpuKernel> {
        match GpuKernel::new(None) {
            Ok(kernel) => Some(kernel),
            Err(e) => {
                eprintln!("GPU unavailable (expected on headless systems): {}", e);
                None
            }
        }
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<WarpParams>(), 64);
    }

    #[test]
    fn test_oversized_plane_rejected() {
        let limits = wgpu::Limits::default();
        let max = u64::from(limits.max_storage_buffer_binding_size);
        assert!(check_plane_size(&limits, max).is_ok());
        // 36 Mpx of f32 is past the default 128 MiB binding limit
        assert!(matches!(
            check_plane_size(&limits, 36_000_000 * 4),
            Err(RegistrationError::Accelerator(_))
        ));
    }

    #[test]
    fn test_identity_matches_input() {
        let Some(kernel) = test_gpu() else {
            return;
        };
        let input: Vec<f32> = (0..37 * 21).map(|i| (i % 255) as f32).collect();
        let out = kernel.warp_plane(&input, 37, 21, &Transform::identity()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_matches_cpu_kernel() {
        let Some(kernel) = test_gpu() else {
            return;
        };
        let (w, h) = (64, 48);
        let input: Vec<f32> = (0..w * h).map(|i| ((i * 7919) % 251) as f32).collect();

        let transforms = [
            Transform::Affine(Affine::new([0.97, 0.03, 2.25, -0.02, 1.01, -1.5])),
            Transform::Perspective(Homography::from_params([1.02, 0.01, -3.0, 0.0, 0.99, 2.0, 1e-4, -5e-5])),
        ];

        for t in &transforms {
            let gpu = kernel.warp_plane(&input, w, h, t).unwrap();
            let cpu = CpuKernel.warp_plane(&input, w, h, t).unwrap();
            let mismatched = gpu
                .iter()
                .zip(&cpu)
                .filter(|(a, b)| (*a - *b).abs() > 0.5)
                .count();
            // f32 coordinates may flip a handful of border pixels in or out
            assert!(mismatched <= w + h, "{} pixels differ", mismatched);
        }
    }
}
