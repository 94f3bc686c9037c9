//! inkflow - interactive GPU fluid visualizer.
//!
//! A stable-fluids style solver rendered entirely through full-screen
//! fragment passes over half-float render targets: splat injection,
//! vorticity confinement, Jacobi pressure projection and semi-Lagrangian
//! advection, composited with bloom, sunrays and dithering. The window
//! and input layer in `main.rs` is a thin adapter; everything simulation
//! and rendering lives in the library so a test harness can drive it
//! headlessly.

pub mod blit;
pub mod config;
pub mod gpu;
pub mod pointer;
pub mod render;
pub mod shader;
pub mod sim;
pub mod texture;

pub use blit::Blit;
pub use config::Config;
pub use gpu::GpuContext;
pub use render::RenderTarget;
pub use shader::Passes;
pub use sim::{Splat, SimulationState};
