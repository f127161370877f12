//! Ember kernel binary.
//!
//! The Multiboot stub (assembly, shipped with the bootloader image) sets
//! up the GDT, the IDT and the initial identity paging, then jumps to
//! `kernel_main` with interrupts disabled. The IRQ vector table is wired
//! by the interrupt layer: vector 32 calls `timer::timer_interrupt`, the
//! storage vector calls `drivers::ahci::irq_handler`.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use ember_kernel::{
        arch, drivers, mm, println, sched::scheduler::with_scheduler, serial,
    };

    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        serial::init();
        ember_kernel::logger::init();
        println!("Ember v{}", env!("CARGO_PKG_VERSION"));

        // Switch onto the kernel's own page directory (identity window,
        // MMIO window space) and bring up the heap inside it.
        {
            let space = mm::paging::kernel_space().lock();
            // SAFETY: The kernel address space identity-maps the low
            // 512 MiB where the kernel, its stack and the heap live.
            unsafe {
                arch::x86::load_page_directory(space.directory_phys());
            }
        }
        // SAFETY: Called once, with the heap region mapped and unused.
        unsafe {
            mm::heap::init();
        }

        drivers::dma::init();
        match drivers::ahci::init() {
            Ok(()) => {}
            Err(err) => println!("[BOOT] no usable AHCI controller: {}", err),
        }

        with_scheduler(|s| s.init()).expect("scheduler init");
        println!("[BOOT] scheduler running; enabling interrupts");
        arch::x86::enable_interrupts();

        // The boot context doubles as the idle task from here on.
        loop {
            arch::halt();
            with_scheduler(|s| s.reap(None));
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the hosted build exists for
    // `cargo test` against the library.
}
