//! The machine owner: one [`Machine`] holds the CPU, the port-I/O bus, the
//! PIC seam and the host command queue, and drives the cooperative main
//! loop one instruction at a time.

mod io;

use std::collections::VecDeque;

use tracing::debug;

use kestrel_cpu::{Cpu, CpuConfig, Env, InterruptLine, LogicalAddress, RunState};
use kestrel_mem::PhysicalMemoryError;

pub use io::{IoBus, IoDevice};

/// Host commands, drained at instruction boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnterDebugger,
    ExitDebugger,
    HardReboot,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Triple fault (or equivalent unrecoverable cascade).
    Shutdown,
    /// VKILL in an autotest configuration.
    AutotestExit { code: i32 },
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub memory_size: u64,
    pub for_autotest: bool,
    pub entry: LogicalAddress,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let cpu = CpuConfig::default();
        Self {
            memory_size: cpu.memory_size,
            for_autotest: cpu.for_autotest,
            entry: cpu.entry,
        }
    }
}

/// A PIC that never raises. Stands in until the host wires a real one.
struct NoPic;

impl InterruptLine for NoPic {
    fn has_pending_irq(&mut self) -> bool {
        false
    }

    fn acknowledge_irq(&mut self) -> Option<u8> {
        None
    }
}

pub struct Machine {
    cpu: Cpu,
    io: IoBus,
    pic: Box<dyn InterruptLine>,
    commands: VecDeque<Command>,
    debugger_active: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, PhysicalMemoryError> {
        let cpu = Cpu::new(CpuConfig {
            memory_size: config.memory_size,
            for_autotest: config.for_autotest,
            entry: config.entry,
        })?;
        Ok(Self {
            cpu,
            io: IoBus::default(),
            pic: Box::new(NoPic),
            commands: VecDeque::new(),
            debugger_active: false,
        })
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn io_bus_mut(&mut self) -> &mut IoBus {
        &mut self.io
    }

    pub fn set_pic(&mut self, pic: Box<dyn InterruptLine>) {
        self.pic = pic;
    }

    /// Whether a debugger was requested via [`Command::EnterDebugger`]. The
    /// debugger itself lives outside the core; this is just the latch it
    /// polls.
    pub fn debugger_active(&self) -> bool {
        self.debugger_active
    }

    pub fn queue_command(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    fn drain_commands(&mut self) -> bool {
        let mut rebooted = false;
        while let Some(command) = self.commands.pop_front() {
            match command {
                Command::EnterDebugger => self.debugger_active = true,
                Command::ExitDebugger => self.debugger_active = false,
                Command::HardReboot => {
                    debug!(target: "kestrel_machine", "hard reboot");
                    self.io.reset_all();
                    self.cpu.reset();
                    rebooted = true;
                }
            }
        }
        rebooted
    }

    fn service_pending_irq(&mut self) {
        if !self.cpu.interrupt_window_open() {
            return;
        }
        if !self.pic.has_pending_irq() {
            return;
        }
        if let Some(vector) = self.pic.acknowledge_irq() {
            self.cpu.deliver_external_interrupt(vector);
        }
    }

    /// One main-loop iteration: drain commands, run one instruction (or
    /// poll the halted CPU), then service the IRQ line.
    pub fn step(&mut self) -> Option<ExitReason> {
        if !self.commands.is_empty() && self.drain_commands() {
            return None;
        }

        match self.cpu.run_state() {
            RunState::Alive => {
                let mut env = Env {
                    io: &mut self.io,
                    irq: &mut *self.pic,
                };
                self.cpu.step(&mut env);
            }
            RunState::Halted => {
                // Nothing to execute until the PIC asserts.
                if self.cpu.get_if() {
                    self.service_pending_irq();
                }
                return None;
            }
            RunState::Shutdown => return Some(ExitReason::Shutdown),
            RunState::Dead { exit_code } => {
                return Some(ExitReason::AutotestExit { code: exit_code })
            }
        }

        match self.cpu.run_state() {
            RunState::Shutdown => Some(ExitReason::Shutdown),
            RunState::Dead { exit_code } => Some(ExitReason::AutotestExit { code: exit_code }),
            _ => {
                self.service_pending_irq();
                None
            }
        }
    }

    /// Run until shutdown or autotest exit. Halted phases spin through the
    /// PIC poll with a yield so a host thread is not pegged.
    pub fn run(&mut self) -> ExitReason {
        loop {
            if let Some(reason) = self.step() {
                return reason;
            }
            if self.cpu.is_halted() {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hard_reboot_resets_cpu() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        machine.cpu_mut().set_eax(0xDEAD_BEEF);
        machine.queue_command(Command::HardReboot);
        machine.step();
        assert_eq!(machine.cpu().eax(), 0);
        assert_eq!(machine.cpu().eip(), 0xFFF0);
    }

    #[test]
    fn debugger_latch_follows_commands() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        machine.queue_command(Command::EnterDebugger);
        machine.step();
        assert!(machine.debugger_active());
        machine.queue_command(Command::ExitDebugger);
        machine.step();
        assert!(!machine.debugger_active());
    }
}
