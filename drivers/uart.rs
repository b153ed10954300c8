//! PL011 UART console
//!
//! The one-byte console primitive behind [`ByteSink`]. The core only
//! ever calls `putc`/`getc`; modem control, FIFOs and baud setup are
//! out of scope. Host builds keep the type but drop the hardware
//! access so the logger still has something to bind to.

use crate::config::UART_BASE;
use crate::utils::console::ByteSink;

/// A memory-mapped PL011.
pub struct Pl011 {
    base: u64,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        use tock_registers::interfaces::{Readable, Writeable};
        use tock_registers::register_structs;
        use tock_registers::registers::{ReadOnly, ReadWrite};

        register_structs! {
            Pl011Regs {
                (0x00 => dr: ReadWrite<u32>),
                (0x04 => _reserved0),
                (0x18 => fr: ReadOnly<u32>),
                (0x1c => _reserved1),
                (0x38 => imsc: ReadWrite<u32>),
                (0x3c => _reserved2),
                (0x44 => icr: ReadWrite<u32>),
                (0x48 => @END),
            }
        }

        /// Flag register bits.
        mod fr {
            /// Receive FIFO empty.
            pub const RXFE: u32 = 1 << 4;
            /// Transmit FIFO full.
            pub const TXFF: u32 = 1 << 5;
        }

        impl Pl011 {
            fn regs(&self) -> &'static Pl011Regs {
                unsafe { &*(self.base as usize as *const Pl011Regs) }
            }

            /// Unmask the receive interrupt.
            pub fn enable_rx_irq(&self) {
                self.regs().imsc.set(1 << 4);
            }

            /// Acknowledge pending UART interrupts.
            pub fn clear_irq(&self) {
                self.regs().icr.set(0x7ff);
            }
        }

        impl ByteSink for Pl011 {
            fn putc(&self, byte: u8) {
                while self.regs().fr.get() & fr::TXFF != 0 {
                    core::hint::spin_loop();
                }
                self.regs().dr.set(byte as u32);
            }

            fn getc(&self) -> Option<u8> {
                if self.regs().fr.get() & fr::RXFE != 0 {
                    None
                } else {
                    Some(self.regs().dr.get() as u8)
                }
            }
        }
    } else {
        impl Pl011 {
            /// Unmask the receive interrupt (host stand-in).
            pub fn enable_rx_irq(&self) {}

            /// Acknowledge pending UART interrupts (host stand-in).
            pub fn clear_irq(&self) {}
        }

        impl ByteSink for Pl011 {
            fn putc(&self, _byte: u8) {}

            fn getc(&self) -> Option<u8> {
                None
            }
        }
    }
}

impl Pl011 {
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

/// The boot console.
pub static CONSOLE: Pl011 = Pl011::new(UART_BASE);

/// Write one byte to the boot console (hypercall and panic paths).
pub fn console_putc(byte: u8) {
    CONSOLE.putc(byte);
}

/// UART IRQ body: acknowledge and let readers poll the data register.
pub fn rx_ready() {
    CONSOLE.clear_irq();
}
