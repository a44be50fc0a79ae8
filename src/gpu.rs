//! GPU compute context for the twin-path probe
//!
//! The drift harness runs every model on two compute paths built from the
//! same weights. The GPU path routes layer matmuls through [`GpuCompute`];
//! when no GPU backend is available the same call sites fall back to the
//! in-crate CPU kernel, which is exactly the degraded mode the telemetry
//! report distinguishes with `webgpu_init_ok = false`.
//!
//! The actual device backend (wgpu compute shader) is compiled in behind the
//! `gpu` cargo feature. Without it, requesting [`ComputeBackend::Gpu`] fails
//! with [`DerivaError::GpuInit`] and `Auto` selects the CPU.

use crate::error::{DerivaError, Result};

/// Compute backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeBackend {
    /// GPU compute via the wgpu backend
    Gpu,
    /// CPU compute (fallback)
    Cpu,
    /// Auto-select best available backend
    #[default]
    Auto,
}

/// Compute context with automatic CPU fallback
#[derive(Debug)]
pub struct GpuCompute {
    backend: ComputeBackend,
    #[cfg(feature = "gpu")]
    ctx: Option<wgpu_backend::GpuContext>,
}

impl GpuCompute {
    /// Create a compute context with auto-detected backend.
    ///
    /// # Errors
    ///
    /// Never fails in practice: `Auto` always has the CPU to fall back on.
    pub fn auto() -> Result<Self> {
        Self::new(ComputeBackend::Auto)
    }

    /// Create a compute context with the given backend.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::GpuInit` when `Gpu` is requested but no adapter
    /// is available or the `gpu` feature is not compiled in.
    #[cfg(feature = "gpu")]
    pub fn new(backend: ComputeBackend) -> Result<Self> {
        match backend {
            ComputeBackend::Gpu => match wgpu_backend::GpuContext::new() {
                Ok(ctx) => Ok(Self {
                    backend: ComputeBackend::Gpu,
                    ctx: Some(ctx),
                }),
                Err(reason) => Err(DerivaError::GpuInit(reason)),
            },
            ComputeBackend::Cpu => Ok(Self {
                backend: ComputeBackend::Cpu,
                ctx: None,
            }),
            ComputeBackend::Auto => match wgpu_backend::GpuContext::new() {
                Ok(ctx) => Ok(Self {
                    backend: ComputeBackend::Gpu,
                    ctx: Some(ctx),
                }),
                Err(_) => Ok(Self {
                    backend: ComputeBackend::Cpu,
                    ctx: None,
                }),
            },
        }
    }

    /// Create a compute context with the given backend.
    ///
    /// # Errors
    ///
    /// Returns `DerivaError::GpuInit` when `Gpu` is requested but no adapter
    /// is available or the `gpu` feature is not compiled in.
    #[cfg(not(feature = "gpu"))]
    pub fn new(backend: ComputeBackend) -> Result<Self> {
        match backend {
            ComputeBackend::Gpu => Err(DerivaError::GpuInit(
                "GPU backend not compiled in (enable the `gpu` feature)".to_string(),
            )),
            ComputeBackend::Cpu | ComputeBackend::Auto => Ok(Self {
                backend: ComputeBackend::Cpu,
            }),
        }
    }

    /// Whether the GPU backend is active
    #[must_use]
    pub fn is_gpu(&self) -> bool {
        #[cfg(feature = "gpu")]
        {
            self.backend == ComputeBackend::Gpu && self.ctx.is_some()
        }
        #[cfg(not(feature = "gpu"))]
        {
            false
        }
    }

    /// Active backend
    #[must_use]
    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    /// Matrix multiplication `C = A @ B` with A `[m, k]`, B `[k, n]`, both
    /// flat row-major.
    ///
    /// # Errors
    ///
    /// Returns an error when input lengths do not match the given dimensions
    /// or the device computation fails.
    pub fn matmul(&mut self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        if a.len() != m * k {
            return Err(DerivaError::Engine(format!(
                "matmul: A has {} elements, expected m*k = {}",
                a.len(),
                m * k
            )));
        }
        if b.len() != k * n {
            return Err(DerivaError::Engine(format!(
                "matmul: B has {} elements, expected k*n = {}",
                b.len(),
                k * n
            )));
        }

        #[cfg(feature = "gpu")]
        if let Some(ctx) = &self.ctx {
            return ctx.matmul(a, b, m, k, n).map_err(DerivaError::Engine);
        }

        Ok(cpu_matmul(a, b, m, k, n))
    }
}

/// CPU fallback matmul
fn cpu_matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = sum;
        }
    }
    c
}

#[cfg(feature = "gpu")]
mod wgpu_backend {
    //! Minimal wgpu compute backend: one matmul pipeline, blocking readback.

    use std::sync::mpsc;

    use wgpu::util::DeviceExt;

    const MATMUL_WGSL: &str = r"
struct Dims {
    m: u32,
    k: u32,
    n: u32,
    pad: u32,
}

@group(0) @binding(0) var<uniform> dims: Dims;
@group(0) @binding(1) var<storage, read> a: array<f32>;
@group(0) @binding(2) var<storage, read> b: array<f32>;
@group(0) @binding(3) var<storage, read_write> c: array<f32>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let row = gid.y;
    let col = gid.x;
    if (row >= dims.m || col >= dims.n) {
        return;
    }
    var sum = 0.0;
    for (var p = 0u; p < dims.k; p = p + 1u) {
        sum = sum + a[row * dims.k + p] * b[p * dims.n + col];
    }
    c[row * dims.n + col] = sum;
}
";

    pub struct GpuContext {
        device: wgpu::Device,
        queue: wgpu::Queue,
        pipeline: wgpu::ComputePipeline,
    }

    impl GpuContext {
        pub fn new() -> Result<Self, String> {
            let instance = wgpu::Instance::default();
            let adapter = pollster::block_on(
                instance.request_adapter(&wgpu::RequestAdapterOptions::default()),
            )
            .ok_or_else(|| "no compatible GPU adapter".to_string())?;
            let (device, queue) = pollster::block_on(
                adapter.request_device(&wgpu::DeviceDescriptor::default(), None),
            )
            .map_err(|e| e.to_string())?;

            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("deriva-matmul"),
                source: wgpu::ShaderSource::Wgsl(MATMUL_WGSL.into()),
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("deriva-matmul"),
                layout: None,
                module: &shader,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            Ok(Self {
                device,
                queue,
                pipeline,
            })
        }

        pub fn matmul(
            &self,
            a: &[f32],
            b: &[f32],
            m: usize,
            k: usize,
            n: usize,
        ) -> Result<Vec<f32>, String> {
            let dims: [u32; 4] = [m as u32, k as u32, n as u32, 0];
            let out_bytes = (m * n * std::mem::size_of::<f32>()) as u64;

            let dims_buf = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("dims"),
                    contents: bytemuck::cast_slice(&dims),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let a_buf = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("a"),
                    contents: bytemuck::cast_slice(a),
                    usage: wgpu::BufferUsages::STORAGE,
                });
            let b_buf = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("b"),
                    contents: bytemuck::cast_slice(b),
                    usage: wgpu::BufferUsages::STORAGE,
                });
            let c_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("c"),
                size: out_bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging"),
                size: out_bytes,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("matmul"),
                layout: &self.pipeline.get_bind_group_layout(0),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: dims_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: a_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: b_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: c_buf.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("matmul"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups((n as u32).div_ceil(8), (m as u32).div_ceil(8), 1);
            }
            encoder.copy_buffer_to_buffer(&c_buf, 0, &staging, 0, out_bytes);
            self.queue.submit(Some(encoder.finish()));

            let slice = staging.slice(..);
            let (tx, rx) = mpsc::channel();
            slice.map_async(wgpu::MapMode::Read, move |res| {
                let _ = tx.send(res);
            });
            self.device.poll(wgpu::Maintain::Wait);
            rx.recv()
                .map_err(|_| "map_async callback dropped".to_string())?
                .map_err(|e| e.to_string())?;

            let out = bytemuck::cast_slice::<u8, f32>(&slice.get_mapped_range()).to_vec();
            staging.unmap();
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_never_fails() {
        let compute = GpuCompute::auto().unwrap();
        // Auto always yields a usable context, GPU or not
        let _ = compute.backend();
    }

    #[test]
    fn test_cpu_matmul_identity() {
        let mut compute = GpuCompute::new(ComputeBackend::Cpu).unwrap();
        let a = vec![1.0, 0.0, 0.0, 1.0];
        let b = vec![3.0, 4.0];
        let c = compute.matmul(&a, &b, 2, 2, 1).unwrap();
        assert_eq!(c, vec![3.0, 4.0]);
    }

    #[test]
    fn test_cpu_matmul_2x3_3x2() {
        let mut compute = GpuCompute::new(ComputeBackend::Cpu).unwrap();
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let c = compute.matmul(&a, &b, 2, 3, 2).unwrap();
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_dimension_validation() {
        let mut compute = GpuCompute::new(ComputeBackend::Cpu).unwrap();
        let err = compute.matmul(&[1.0, 2.0], &[1.0], 2, 2, 1).unwrap_err();
        assert!(err.to_string().contains("expected m*k"));
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_request_fails_without_feature() {
        let err = GpuCompute::new(ComputeBackend::Gpu).unwrap_err();
        assert!(matches!(err, DerivaError::GpuInit(_)));
    }
}
