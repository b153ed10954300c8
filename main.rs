//! Duovisor boot path
//!
//! CPU 0 enters at `_start`, sets up the boot stack, clears .bss and
//! runs `primary_main`: console, allocators, Stage-1 MMU, GIC,
//! scheduler, timer, then secondary release and the idle loop.
//! Secondaries arrive through the PSCI start-CPU primitive with their
//! stack in x0 and join the same scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use duovisor::config::{
    GUEST_DTB_IPA, GUEST_KERNEL_IPA, GUEST_INITRD_IPA, MAX_CPUS, RAM_SIZE, RAM_START,
    TASK_STACK_SIZE,
};
use duovisor::core::mm::{HEAP, PMM};
use duovisor::core::sched;
use duovisor::core::vmm::loader::{self, GuestImageSource, GuestManifest};
use duovisor::core::vmm::vm::{GuestLayout, Vm, VMS};
use duovisor::core::vmm::vcpu;
use duovisor::utils::bitmap::Bitmap;
use duovisor::{arch, drivers, Error, Result};

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
    .section .text.entry
    .global _start
    _start:
        mrs x1, mpidr_el1
        and x1, x1, #0xff
        cbnz x1, 2f

        ldr x2, =__stack_end
        mov sp, x2

        ldr x2, =__bss_start
        ldr x3, =__bss_end
    1:  cmp x2, x3
        b.hs 3f
        str xzr, [x2], #8
        b 1b
    3:  bl primary_main
        b .

        // Secondary: PSCI hands our stack top through the context
        // argument in x0.
    2:  mov sp, x0
        bl secondary_main
        b .
    "#
);

/// One page-aligned translation table.
#[repr(C, align(4096))]
struct TablePage([u64; 512]);

static mut BOOT_L0: TablePage = TablePage([0; 512]);
static mut BOOT_L1: TablePage = TablePage([0; 512]);

/// One bit per page of managed RAM.
static mut PMM_BITMAP: [u64; (RAM_SIZE as usize / duovisor::config::PAGE_SIZE).div_ceil(64)] =
    [0; (RAM_SIZE as usize / duovisor::config::PAGE_SIZE).div_ceil(64)];

static SECONDARY_STACKS: arch::arm64::smp::SecondaryStacks =
    arch::arm64::smp::SecondaryStacks::new();

/// Boot CPU entry, after the assembly stub.
#[no_mangle]
pub extern "C" fn primary_main() -> ! {
    duovisor::utils::log::init(&drivers::uart::CONSOLE);
    log::info!("duovisor {} booting", duovisor::VERSION);

    init_memory().expect("memory bring-up failed");
    init_translation();

    arch::arm64::interrupt::vectors::install();
    arch::arm64::interrupt::gic::init_distributor();
    arch::arm64::interrupt::gic::init_cpu_interface();
    arch::arm64::interrupt::gic::gich_enable();

    sched::scheduler::init_cpu(0).expect("scheduler bring-up failed");
    arch::arm64::timer::start_tick(0);

    if let Err(err) = start_demo_guest() {
        log::warn!("no guest started: {:?}", err);
    }

    let started = arch::arm64::smp::bring_up_secondaries(
        &arch::arm64::smp::PsciCpuBoot,
        secondary_entry_addr(),
        &SECONDARY_STACKS,
    );
    log::info!("smp: {} secondary cpu(s) released", started);

    arch::cpu::irq::enable();
    sched::scheduler::idle_loop()
}

/// Secondary CPU entry, after the assembly stub.
#[no_mangle]
pub extern "C" fn secondary_main() -> ! {
    let cpu = arch::cpu::cpu_id();
    arch::arm64::smp::mark_online(cpu);

    arch::arm64::interrupt::vectors::install();
    arch::arm64::interrupt::gic::init_cpu_interface();
    arch::arm64::interrupt::gic::gich_enable();

    sched::scheduler::init_cpu(cpu).expect("secondary scheduler bring-up failed");
    arch::arm64::timer::start_tick(cpu);

    log::info!("cpu {} online", cpu);
    arch::cpu::irq::enable();
    sched::scheduler::idle_loop()
}

#[cfg(target_os = "none")]
fn secondary_entry_addr() -> u64 {
    extern "C" {
        fn _start();
    }
    _start as usize as u64
}

#[cfg(not(target_os = "none"))]
fn secondary_entry_addr() -> u64 {
    0
}

/// Hand all RAM above the image to the PMM and protect what the boot
/// path already occupies.
fn init_memory() -> Result<()> {
    let bitmap = unsafe {
        Bitmap::new(
            core::ptr::addr_of_mut!(PMM_BITMAP) as *mut u64,
            RAM_SIZE as usize / duovisor::config::PAGE_SIZE,
        )
    };
    PMM.init(RAM_START, RAM_SIZE, bitmap)?;
    PMM.mark_allocated(RAM_START, image_end());
    Ok(())
}

#[cfg(target_os = "none")]
fn image_end() -> u64 {
    extern "C" {
        static __image_end: u8;
    }
    unsafe { &__image_end as *const u8 as u64 }
}

#[cfg(not(target_os = "none"))]
fn image_end() -> u64 {
    RAM_START
}

/// Build and install the Stage-1 boot map.
fn init_translation() {
    let (l0, l1) = unsafe {
        (
            &mut (*core::ptr::addr_of_mut!(BOOT_L0)).0,
            &mut (*core::ptr::addr_of_mut!(BOOT_L1)).0,
        )
    };
    let mut tables = arch::arm64::mmu::stage1::BootTables::new(l0, l1);
    tables.build();
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        #[cfg(feature = "hv")]
        arch::arm64::mmu::stage1::install_el2(&tables);
        #[cfg(not(feature = "hv"))]
        arch::arm64::mmu::stage1::install_el1(&tables);
    }
    log::info!("mmu: stage-1 boot map live");
}

/// Storage stand-in until a block device is attached: every open
/// reports the volume as missing.
struct NoStorage;

impl GuestImageSource for NoStorage {
    fn open(&mut self, _path: &str) -> Result<loader::Fd> {
        Err(Error::NotMounted)
    }

    fn read(&mut self, _fd: loader::Fd, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotMounted)
    }

    fn seek(&mut self, _fd: loader::Fd, _off: i64, _whence: loader::Whence) -> Result<u64> {
        Err(Error::NotMounted)
    }

    fn close(&mut self, _fd: loader::Fd) {}
}

/// Build the reference guest, load its images, and queue its vCPUs.
fn start_demo_guest() -> Result<()> {
    let manifest = GuestManifest {
        name: "guest0",
        kernel_path: "guest0/Image",
        dtb_path: Some("guest0/virt.dtb"),
        initrd_path: Some("guest0/initrd.img"),
        bin_loadaddr: GUEST_KERNEL_IPA,
        dtb_loadaddr: GUEST_DTB_IPA,
        fs_loadaddr: GUEST_INITRD_IPA,
        smp_num: 1,
        needs_dtb: true,
        needs_initrd: false,
    };

    let vm = Vm::build(&PMM, 0, manifest.name, GuestLayout::default_layout())?;
    VMS.lock().insert(vm)?;

    let load_result = VMS
        .lock()
        .get_mut(0)
        .map(|vm| loader::load_guest(&mut NoStorage, &HEAP, vm, &manifest))
        .unwrap_or(Err(Error::NotFound));
    if let Err(err) = load_result {
        // A guest without a kernel image cannot run.
        VMS.lock().remove(0);
        return Err(err);
    }

    for vcpu_id in 0..manifest.smp_num {
        let stack = HEAP.alloc(TASK_STACK_SIZE, 16)?;
        let stack_top = stack.as_ptr() as u64 + TASK_STACK_SIZE as u64;
        let idx = unsafe {
            vcpu::create_vcpu_task(
                0,
                manifest.bin_loadaddr,
                manifest.dtb_loadaddr,
                stack_top,
                vcpu_id % MAX_CPUS,
            )?
        };
        sched::scheduler::queue_on(idx, vcpu_id % MAX_CPUS);
    }
    log::info!("guest0 ready with {} vcpu(s)", manifest.smp_num);
    Ok(())
}

/// Host-side build of the boot binary only checks that the pieces
/// link; the real entry points are bare-metal.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("duovisor {} is a bare-metal image; run the test suite instead", duovisor::VERSION);
}
