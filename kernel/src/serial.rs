//! Serial console backend for the kernel print macros.
//!
//! On bare metal this drives COM1 directly through port I/O; the hosted
//! build (unit tests) forwards to stdout so test output stays readable.

use core::fmt;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod uart {
    use core::fmt;

    use spin::Mutex;

    const COM1: u16 = 0x3F8;

    /// A 16550-compatible UART addressed through I/O ports.
    pub struct SerialPort {
        base: u16,
    }

    impl SerialPort {
        pub const fn new(base: u16) -> Self {
            Self { base }
        }

        /// Program 115200 8N1 with FIFOs enabled.
        pub fn init(&mut self) {
            // SAFETY: All writes target the UART's own register window; the
            // port base is a standard COM1 address owned by this driver.
            unsafe {
                x86::io::outb(self.base + 1, 0x00); // disable interrupts
                x86::io::outb(self.base + 3, 0x80); // DLAB on
                x86::io::outb(self.base, 0x01); // divisor = 1 (115200 baud)
                x86::io::outb(self.base + 1, 0x00);
                x86::io::outb(self.base + 3, 0x03); // 8N1, DLAB off
                x86::io::outb(self.base + 2, 0xC7); // FIFO on, clear, 14-byte threshold
                x86::io::outb(self.base + 4, 0x0B); // DTR + RTS + OUT2
            }
        }

        fn write_byte(&mut self, byte: u8) {
            // SAFETY: Reading LSR and writing THR are side-effect-free
            // beyond transmitting the byte; the port belongs to this driver.
            unsafe {
                while x86::io::inb(self.base + 5) & 0x20 == 0 {
                    core::hint::spin_loop();
                }
                x86::io::outb(self.base, byte);
            }
        }
    }

    impl fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                self.write_byte(byte);
            }
            Ok(())
        }
    }

    pub static PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));
}

/// Initialize the console. Must run before the first `println!`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    uart::PORT.lock().init();
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn init() {}

#[doc(hidden)]
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let _ = uart::PORT.lock().write_fmt(args);
}

#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}

#[doc(hidden)]
#[cfg(all(not(target_arch = "x86"), target_os = "none"))]
pub fn _print(_args: fmt::Arguments) {}
