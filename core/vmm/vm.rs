//! Virtual machine management
//!
//! A [`Vm`] bundles everything one guest owns: its Stage-2 table tree,
//! its virtual GIC, one virtual timer per vCPU, and the host tasks that
//! carry its vCPUs. The guest physical layout is declared up front and
//! drives both Stage-2 construction and fault classification.

use crate::arch::arm64::interrupt::vgic::Vgic;
use crate::arch::arm64::mmu::stage2::Stage2Tables;
use crate::arch::arm64::timer::vtimer::VTimerState;
use crate::config::{
    GICC_BASE, GICD_BASE, GICV_BASE, GIC_FRAME_SIZE, GUEST_RAM_IPA, GUEST_RAM_SIZE, MAX_VCPUS,
    MAX_VMS, UART_BASE,
};
use crate::core::mm::{Ipa, PhysAddr, Pmm};
use crate::core::sync::SpinLock;
use crate::{Error, Result};
use heapless::Vec;

/// Classification of a guest physical address, in fault-dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpaClass {
    /// Distributor window: fully emulated.
    Distributor { offset: u64 },
    /// CPU-interface window: rebased onto the hardware GICV frame.
    CpuInterface { offset: u64 },
    /// Guest RAM.
    Ram,
    /// A declared pass-through device window.
    Passthrough,
    /// Outside every declared window.
    Outside,
}

/// Declared guest physical memory map.
#[derive(Debug, Clone)]
pub struct GuestLayout {
    pub ram_ipa: Ipa,
    pub ram_pa: PhysAddr,
    pub ram_size: u64,
    /// Device windows the guest may touch directly.
    pub passthrough: Vec<(Ipa, u64), 4>,
}

impl GuestLayout {
    /// The reference layout: RAM identity-mapped at its host location,
    /// UART passed through.
    pub fn default_layout() -> Self {
        let mut passthrough = Vec::new();
        let _ = passthrough.push((UART_BASE, 0x1000));
        Self {
            ram_ipa: GUEST_RAM_IPA,
            ram_pa: GUEST_RAM_IPA,
            ram_size: GUEST_RAM_SIZE,
            passthrough,
        }
    }

    /// Classify an IPA for the Stage-2 fault dispatcher.
    pub fn classify(&self, ipa: Ipa) -> IpaClass {
        if (GICD_BASE..GICD_BASE + GIC_FRAME_SIZE).contains(&ipa) {
            return IpaClass::Distributor {
                offset: ipa - GICD_BASE,
            };
        }
        if (GICC_BASE..GICC_BASE + GIC_FRAME_SIZE).contains(&ipa) {
            return IpaClass::CpuInterface {
                offset: ipa - GICC_BASE,
            };
        }
        if (self.ram_ipa..self.ram_ipa + self.ram_size).contains(&ipa) {
            return IpaClass::Ram;
        }
        if self
            .passthrough
            .iter()
            .any(|&(base, size)| (base..base + size).contains(&ipa))
        {
            return IpaClass::Passthrough;
        }
        IpaClass::Outside
    }
}

/// VM lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Built, vCPUs not yet started.
    Init,
    Running,
    /// Shut down or killed by a strict fault policy.
    Dead,
}

/// One guest.
pub struct Vm {
    pub id: u8,
    pub name: heapless::String<32>,
    pub state: VmState,
    pub layout: GuestLayout,
    pub stage2: Stage2Tables,
    pub vgic: Vgic,
    pub vtimers: [VTimerState; MAX_VCPUS],
    /// Task-pool indices of this VM's vCPU host tasks.
    pub vcpu_tasks: Vec<u16, MAX_VCPUS>,
}

impl Vm {
    /// Build a VM: allocate and pre-populate its Stage-2 tree per the
    /// layout, then publish the tables.
    pub fn build(pmm: &Pmm, id: u8, name: &str, layout: GuestLayout) -> Result<Self> {
        let mut stage2 = Stage2Tables::new(pmm, id as u16 + 1)?;

        stage2.map_ram_region(pmm, layout.ram_ipa, layout.ram_pa, layout.ram_size)?;
        for &(base, size) in layout.passthrough.iter() {
            stage2.map_device_region(pmm, base, base, size)?;
        }
        // The CPU-interface frame backs onto the hardware virtual
        // interface, but with no access rights: every touch traps and
        // is emulated with the rebase applied.
        stage2.map_trapped_region(pmm, GICC_BASE, GICV_BASE, GIC_FRAME_SIZE)?;
        stage2.finalize();

        let mut vm_name = heapless::String::new();
        let _ = vm_name.push_str(name);

        log::info!(
            "vm {}: '{}' ram {:#x}+{:#x}",
            id,
            name,
            layout.ram_ipa,
            layout.ram_size
        );

        Ok(Self {
            id,
            name: vm_name,
            state: VmState::Init,
            layout,
            stage2,
            vgic: Vgic::new(),
            vtimers: [VTimerState::new(); MAX_VCPUS],
            vcpu_tasks: Vec::new(),
        })
    }

    /// Register a host task as this VM's next vCPU; returns its vCPU
    /// index.
    pub fn add_vcpu_task(&mut self, task_idx: u16) -> Result<usize> {
        let vcpu = self.vcpu_tasks.len();
        self.vcpu_tasks.push(task_idx).map_err(|_| Error::NoSpace)?;
        Ok(vcpu)
    }

    /// Translate a guest RAM address to a host pointer, bounded to the
    /// page containing it. Used by the image loader.
    pub fn ipa_to_hva(&self, ipa: Ipa) -> Option<*mut u8> {
        let (pa, attr) = self.stage2.walk(ipa)?;
        if attr.is_device() {
            return None;
        }
        Some(pa as usize as *mut u8)
    }

    /// Kill the VM; its vCPU tasks stop being scheduled.
    pub fn mark_dead(&mut self) {
        self.state = VmState::Dead;
        log::warn!("vm {}: marked dead", self.id);
    }
}

/// The VM registry.
pub struct VmTable {
    slots: [Option<Vm>; MAX_VMS],
}

impl VmTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_VMS],
        }
    }

    pub fn insert(&mut self, vm: Vm) -> Result<u8> {
        let id = vm.id;
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(Error::InvalidArgument)?;
        if slot.is_some() {
            return Err(Error::InvalidArgument);
        }
        *slot = Some(vm);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Vm> {
        self.slots.get_mut(id as usize)?.as_mut()
    }

    pub fn remove(&mut self, id: u8) -> Option<Vm> {
        self.slots.get_mut(id as usize)?.take()
    }
}

impl Default for VmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global VM registry, published at boot.
pub static VMS: SpinLock<VmTable> = SpinLock::new(VmTable::new());

/// Run `f` against a registered VM.
pub fn with_vm<R>(id: u8, f: impl FnOnce(&mut Vm) -> R) -> Option<R> {
    let mut table = VMS.lock();
    table.get_mut(id).map(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::utils::align_up;
    use crate::utils::bitmap::Bitmap;

    fn host_pmm(pages: usize) -> &'static Pmm {
        let buf: std::vec::Vec<u8> = vec![0u8; (pages + 1) * PAGE_SIZE];
        let start = align_up(buf.as_ptr() as u64, PAGE_SIZE as u64);
        std::mem::forget(buf);

        let storage = Box::leak(Box::new(vec![0u64; pages.div_ceil(64)]));
        let pmm = Box::leak(Box::new(Pmm::new()));
        pmm.init(
            start,
            pages as u64 * PAGE_SIZE as u64,
            Bitmap::from_slice(storage.as_mut_slice()),
        )
        .unwrap();
        pmm
    }

    fn small_layout(pmm: &Pmm) -> GuestLayout {
        GuestLayout {
            ram_ipa: 0x4000_0000,
            ram_pa: pmm.start_addr(),
            ram_size: 4 * PAGE_SIZE as u64,
            passthrough: Vec::new(),
        }
    }

    #[test]
    fn classification_follows_dispatch_order() {
        let layout = GuestLayout::default_layout();
        assert_eq!(
            layout.classify(GICD_BASE + 0x100),
            IpaClass::Distributor { offset: 0x100 }
        );
        assert_eq!(
            layout.classify(GICC_BASE + 0x10),
            IpaClass::CpuInterface { offset: 0x10 }
        );
        assert_eq!(layout.classify(GUEST_RAM_IPA + 0x1000), IpaClass::Ram);
        assert_eq!(layout.classify(UART_BASE + 4), IpaClass::Passthrough);
        assert_eq!(layout.classify(0x1_2000_0000), IpaClass::Outside);
    }

    #[test]
    fn build_populates_ram_and_gicc_windows() {
        let pmm = host_pmm(32);
        let layout = small_layout(pmm);
        let vm = Vm::build(pmm, 0, "testguest", layout).unwrap();

        // RAM window resolves and is writable normal memory.
        let (pa, attr) = vm.stage2.walk(0x4000_0000).unwrap();
        assert_eq!(pa, pmm.start_addr());
        assert!(attr.writable());

        // GICC window is rebased onto GICV and access-less.
        let (pa, attr) = vm.stage2.walk(GICC_BASE).unwrap();
        assert_eq!(pa, GICV_BASE);
        assert!(!attr.readable() && !attr.writable());

        // Distributor frame stays unmapped.
        assert!(vm.stage2.walk(GICD_BASE).is_none());
    }

    #[test]
    fn ipa_to_hva_rejects_device_windows() {
        let pmm = host_pmm(32);
        let layout = small_layout(pmm);
        let vm = Vm::build(pmm, 1, "g", layout).unwrap();

        assert!(vm.ipa_to_hva(0x4000_0000).is_some());
        assert!(vm.ipa_to_hva(GICC_BASE).is_none());
        assert!(vm.ipa_to_hva(0x9999_0000).is_none());
    }

    #[test]
    fn vcpu_roster_is_bounded() {
        let pmm = host_pmm(32);
        let mut vm = Vm::build(pmm, 2, "g2", small_layout(pmm)).unwrap();
        for i in 0..MAX_VCPUS {
            assert_eq!(vm.add_vcpu_task(10 + i as u16).unwrap(), i);
        }
        assert_eq!(vm.add_vcpu_task(99).unwrap_err(), Error::NoSpace);
    }
}
