#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

//! Boot orchestration: physical-mode bring-up, the MMU flip, and the
//! virtual-mode continuation.
//!
//! Each phase stamps a short tag on the UART (`IMPL`, `UART:OK`, `KERN:OK`,
//! `MMU:START`, the in-assembly stage digits, `VIRT:V1`). When bring-up
//! dies silently, that trail is the whole post-mortem.

#[cfg(target_os = "none")]
core::arch::global_asm!(include_str!("boot.s"));

#[cfg(target_os = "none")]
use icarus::arch::aarch64::{cpu, exceptions, mmu};
#[cfg(target_os = "none")]
use icarus::config;
#[cfg(target_os = "none")]
use icarus::drivers::uart;
#[cfg(target_os = "none")]
use icarus::mm::frames::FRAMES;
#[cfg(target_os = "none")]
use icarus::arch::aarch64::mmu::{KernelLayout, Vmm};
#[cfg(target_os = "none")]
use icarus::println;

#[cfg(target_os = "none")]
unsafe extern "C" {
    static __kernel_end: u8;
}

/// Rust entry point, called from boot.s on core 0 with the stack set and
/// .bss cleared. Runs entirely in physical addressing.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn _start_rust() -> ! {
    uart::puts("IMPL\n");
    uart::WRITER.lock().init();
    uart::puts("UART:OK\n");

    exceptions::init();

    // Frames come from the RAM left after the image.
    // SAFETY: Linker symbol; only its address is taken.
    let kernel_end = unsafe { core::ptr::addr_of!(__kernel_end) } as usize;
    FRAMES.lock().init(kernel_end, config::RAM_BASE + config::RAM_SIZE);

    let layout = KernelLayout::from_linker(mmu::enable_entry(), vm_continuation as usize);

    let mut frames = FRAMES.lock();
    let Some(mut vmm) = Vmm::new(&mut *frames) else {
        uart::puts("no frames for translation roots\n");
        cpu::halt();
    };

    let report = vmm.install_sections(&layout, &mut *frames);
    drop(frames);

    println!(
        "KERN:OK ({} regions installed, {} skipped)",
        report.installed, report.skipped
    );
    vmm.regions.dump();

    let audit = vmm.audit();
    if audit.mismatched != 0 {
        println!(
            "[vm] audit: {}/{} regions disagree with the live tables",
            audit.mismatched, audit.checked
        );
    }

    // One-shot: either this hands the machine to vm_continuation with
    // translation on, or it refuses and we park with the reason.
    // SAFETY: Interrupts are masked and the identity mappings the sequence
    // needs were just installed and audited.
    match unsafe { mmu::enable(&vmm, &layout, vm_continuation) } {
        Err(error) => {
            println!("[vm] enable refused: {:?}", error);
            cpu::halt()
        }
        Ok(never) => match never {},
    }
}

/// First code to run with the MMU on, entered from the enable region via
/// its identity mapping. Proves the UART's high-half alias answers, then
/// publishes it as the console base and resumes boot.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
unsafe extern "C" fn vm_continuation() -> ! {
    if !uart::probe(config::UART_VIRT_BASE) {
        // Still on the physical base; say which alias went dark and park.
        uart::puts("VIRT:FAIL ");
        uart::puthex64(config::UART_VIRT_BASE as u64);
        uart::puts("\n");
        cpu::halt();
    }

    uart::rebase_to_virtual();
    uart::puts("\nVIRT:V1\n");

    kernel_virtual()
}

/// Post-transition boot: report the machine state and idle.
#[cfg(target_os = "none")]
fn kernel_virtual() -> ! {
    use icarus::arch::aarch64::mmu::enable::state;

    println!();
    println!("icarus {} on qemu-virt", env!("CARGO_PKG_VERSION"));
    println!(
        "[boot] EL{}, SP {:#x}, console via {:#x}",
        cpu::current_el(),
        cpu::read_sp(),
        uart::base()
    );
    println!(
        "[boot] SCTLR {:#x} (M={}), TCR {:#x}, MAIR {:#x}",
        state::sctlr(),
        state::mmu_enabled() as u32,
        state::tcr(),
        state::mair()
    );
    println!(
        "[boot] TTBR0 {:#x}, TTBR1 {:#x}",
        state::ttbr0(),
        state::ttbr1()
    );

    // Virtual execution is confirmed; interrupts may come back.
    // SAFETY: Vectors were installed and verified before the enable.
    unsafe { cpu::unmask_interrupts() };

    println!("[boot] bring-up complete; idling");
    cpu::halt()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::fmt::Write;

    // The raw path: the writer lock may be held by whoever panicked.
    struct RawConsole;
    impl Write for RawConsole {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            uart::puts(s);
            Ok(())
        }
    }

    let _ = writeln!(RawConsole, "\n!!! KERNEL PANIC !!!");
    let _ = writeln!(RawConsole, "{}", info);
    cpu::halt()
}

/// The kernel image only means something on the target; host builds of
/// this binary exist so `cargo test`/`cargo build` work everywhere.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("icarus is a bare-metal kernel; build for aarch64-unknown-none and boot it in QEMU");
}
