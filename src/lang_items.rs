//! Language items and defmt glue for the RISC-V target

// Panic handler for the bare-metal target. Host builds (tests) link std's.
#[cfg(all(target_arch = "riscv32", not(test)))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    crate::port::panic_halt()
}

// Defmt timestamp: the kernel tick counter.
#[cfg(all(feature = "defmt", target_arch = "riscv32"))]
defmt::timestamp!("{=u32}", crate::kernel::ticks());
