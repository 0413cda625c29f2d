use tracing::trace;

use kestrel_cpu::{IoPorts, OpSize};

/// A device behind a range of I/O ports.
pub trait IoDevice {
    fn io_read(&mut self, port: u16, size: OpSize) -> u32;
    fn io_write(&mut self, port: u16, size: OpSize, value: u32);
    fn reset(&mut self) {}
}

struct Registration {
    first: u16,
    last: u16,
    device: Box<dyn IoDevice>,
}

/// The port-I/O bus: devices claim inclusive port ranges; unclaimed ports
/// float high like an open ISA bus.
#[derive(Default)]
pub struct IoBus {
    registrations: Vec<Registration>,
}

impl IoBus {
    pub fn register(&mut self, first: u16, last: u16, device: Box<dyn IoDevice>) {
        assert!(first <= last);
        self.registrations.push(Registration {
            first,
            last,
            device,
        });
    }

    pub(crate) fn reset_all(&mut self) {
        for registration in &mut self.registrations {
            registration.device.reset();
        }
    }

    fn device_for(&mut self, port: u16) -> Option<&mut Box<dyn IoDevice>> {
        self.registrations
            .iter_mut()
            .find(|r| (r.first..=r.last).contains(&port))
            .map(|r| &mut r.device)
    }
}

impl IoPorts for IoBus {
    fn io_read(&mut self, port: u16, size: OpSize) -> u32 {
        match self.device_for(port) {
            Some(device) => device.io_read(port, size),
            None => {
                trace!(target: "kestrel_machine", port, "read from unclaimed port");
                size.mask()
            }
        }
    }

    fn io_write(&mut self, port: u16, size: OpSize, value: u32) {
        match self.device_for(port) {
            Some(device) => device.io_write(port, size, value),
            None => {
                trace!(target: "kestrel_machine", port, value, "write to unclaimed port");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch(u32);

    impl IoDevice for Latch {
        fn io_read(&mut self, _port: u16, _size: OpSize) -> u32 {
            self.0
        }
        fn io_write(&mut self, _port: u16, _size: OpSize, value: u32) {
            self.0 = value;
        }
    }

    #[test]
    fn routes_by_port_range() {
        let mut bus = IoBus::default();
        bus.register(0x60, 0x64, Box::new(Latch(0)));

        bus.io_write(0x60, OpSize::Byte, 0xAB);
        assert_eq!(bus.io_read(0x64, OpSize::Byte), 0xAB);
        assert_eq!(bus.io_read(0x70, OpSize::Byte), 0xFF, "open bus floats high");
        assert_eq!(bus.io_read(0x70, OpSize::Word), 0xFFFF);
    }
}
