//! Graphics device abstraction for the cellgrid renderer.
//!
//! The renderer core is written once against [`GraphicsDevice`]; every
//! concrete graphics API (wgpu, the CPU reference rasterizer, the test mock)
//! implements it.
//!
//! # Overview
//!
//! - [`GraphicsDevice`] - object-safe trait covering buffers, fences,
//!   textures, programs, fixed-function state and frame submission
//! - [`FeatureSet`] - immutable capability snapshot queried once per device
//! - [`BlendConfig`] - API-neutral blend function/equation
//! - `MockDevice` / `MockProbe` - call-recording device (requires `mock` feature)
//!
//! # Example
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # {
//! use cellgrid_gpu::{BufferDesc, BufferUsage, GraphicsDevice, MockDevice};
//!
//! let (mut device, probe) = MockDevice::new();
//! let buffer = device
//!     .create_buffer(&BufferDesc::new("instances", 1024, BufferUsage::INSTANCE))
//!     .unwrap();
//! device.write_buffer(buffer, 0, &[0u8; 64]).unwrap();
//!
//! assert_eq!(probe.count_buffer_writes(), 1);
//! # }
//! ```
//!
//! # Ownership
//!
//! Device methods take `&mut self`: a device is owned by exactly one renderer
//! on one thread. Resources are plain `Copy` handles, so nothing borrows from
//! the device and no lifetimes leak into renderer types.

pub mod blend;
pub mod device;
pub mod error;
pub mod features;
#[cfg(feature = "mock")]
pub mod mock;

pub use blend::*;
pub use device::*;
pub use error::*;
pub use features::*;
#[cfg(feature = "mock")]
pub use mock::*;
