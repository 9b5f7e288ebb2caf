//! Port layer - CPU-specific implementations
//!
//! The hardware abstraction consumed by the kernel: interrupt state control,
//! the context-switch primitive, the tick source, and the halt path. The
//! trap trampoline itself comes from the runtime crate; the port only hooks
//! the machine timer interrupt.

#[cfg(target_arch = "riscv32")]
pub mod riscv32;

#[cfg(target_arch = "riscv32")]
pub use riscv32::*;

// Stub implementations for non-RISC-V targets (for host testing)
#[cfg(not(target_arch = "riscv32"))]
pub mod stub;

#[cfg(not(target_arch = "riscv32"))]
pub use stub::*;
