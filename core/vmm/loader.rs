//! Guest image loading
//!
//! Places a guest's kernel image, device tree and initrd at their
//! configured intermediate-physical addresses. Storage is consumed
//! through [`GuestImageSource`], the byte-range interface the
//! filesystem layer provides; the loader itself never knows what a
//! FAT is. A failed kernel load is fatal for the guest; missing DTB or
//! initrd only warns.

use crate::config::PAGE_SIZE;
use crate::core::mm::{Ipa, KernelHeap};
use crate::core::vmm::vm::Vm;
use crate::{Error, Result};

/// Opaque file handle from the storage layer.
pub type Fd = usize;

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// The byte-range storage interface the loader consumes.
pub trait GuestImageSource {
    fn open(&mut self, path: &str) -> Result<Fd>;
    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize>;
    fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64>;
    fn close(&mut self, fd: Fd);
}

/// A parsed guest description. How this is stored on disk is someone
/// else's problem; the core receives it ready-made.
#[derive(Debug, Clone)]
pub struct GuestManifest<'a> {
    pub name: &'a str,
    pub kernel_path: &'a str,
    pub dtb_path: Option<&'a str>,
    pub initrd_path: Option<&'a str>,
    /// IPA for the kernel image.
    pub bin_loadaddr: Ipa,
    /// IPA for the device tree.
    pub dtb_loadaddr: Ipa,
    /// IPA for the initrd.
    pub fs_loadaddr: Ipa,
    /// vCPUs to create.
    pub smp_num: usize,
    pub needs_dtb: bool,
    pub needs_initrd: bool,
}

/// Load every image the manifest names into the VM's memory.
pub fn load_guest(
    fs: &mut dyn GuestImageSource,
    heap: &KernelHeap,
    vm: &Vm,
    manifest: &GuestManifest<'_>,
) -> Result<()> {
    let loaded = load_file(fs, heap, vm, manifest.kernel_path, manifest.bin_loadaddr)?;
    log::info!(
        "loader: '{}' kernel {} bytes at {:#x}",
        manifest.name,
        loaded,
        manifest.bin_loadaddr
    );

    if manifest.needs_dtb {
        if let Some(path) = manifest.dtb_path {
            match load_file(fs, heap, vm, path, manifest.dtb_loadaddr) {
                Ok(n) => log::info!("loader: dtb {} bytes at {:#x}", n, manifest.dtb_loadaddr),
                Err(err) => log::warn!("loader: dtb '{}' skipped: {:?}", path, err),
            }
        }
    }
    if manifest.needs_initrd {
        if let Some(path) = manifest.initrd_path {
            match load_file(fs, heap, vm, path, manifest.fs_loadaddr) {
                Ok(n) => log::info!("loader: initrd {} bytes at {:#x}", n, manifest.fs_loadaddr),
                Err(err) => log::warn!("loader: initrd '{}' skipped: {:?}", path, err),
            }
        }
    }
    Ok(())
}

/// Stream one file through a page-sized bounce buffer into guest
/// memory at `ipa`. Returns the byte count.
fn load_file(
    fs: &mut dyn GuestImageSource,
    heap: &KernelHeap,
    vm: &Vm,
    path: &str,
    ipa: Ipa,
) -> Result<u64> {
    let fd = fs.open(path)?;
    let buf = heap.alloc(PAGE_SIZE, PAGE_SIZE)?;
    let buf_slice = unsafe { core::slice::from_raw_parts_mut(buf.as_ptr(), PAGE_SIZE) };

    let mut total = 0u64;
    let result = loop {
        let n = match fs.read(fd, buf_slice) {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(err) => break Err(err),
        };
        if let Err(err) = copy_to_guest(vm, ipa + total, &buf_slice[..n]) {
            break Err(err);
        }
        total += n as u64;
    };

    heap.free(buf)?;
    fs.close(fd);
    result
}

/// Copy bytes into guest RAM, page by page through the Stage-2 walk.
fn copy_to_guest(vm: &Vm, ipa: Ipa, data: &[u8]) -> Result<()> {
    let mut off = 0usize;
    while off < data.len() {
        let cur_ipa = ipa + off as u64;
        let hva = vm.ipa_to_hva(cur_ipa).ok_or(Error::GuestFault)?;
        let page_left = PAGE_SIZE - (cur_ipa as usize & (PAGE_SIZE - 1));
        let chunk = page_left.min(data.len() - off);
        unsafe {
            core::ptr::copy_nonoverlapping(data[off..].as_ptr(), hva, chunk);
        }
        off += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mm::Pmm;
    use crate::core::vmm::vm::GuestLayout;
    use crate::utils::align_up;
    use crate::utils::bitmap::Bitmap;
    use std::collections::HashMap;

    struct MockFs {
        files: HashMap<String, Vec<u8>>,
        open: HashMap<Fd, (String, usize)>,
        next_fd: Fd,
    }

    impl MockFs {
        fn new(files: &[(&str, Vec<u8>)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(name, data)| (name.to_string(), data.clone()))
                    .collect(),
                open: HashMap::new(),
                next_fd: 3,
            }
        }
    }

    impl GuestImageSource for MockFs {
        fn open(&mut self, path: &str) -> Result<Fd> {
            if !self.files.contains_key(path) {
                return Err(Error::NotFound);
            }
            let fd = self.next_fd;
            self.next_fd += 1;
            self.open.insert(fd, (path.to_string(), 0));
            Ok(fd)
        }

        fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
            let (path, pos) = self.open.get_mut(&fd).ok_or(Error::InvalidArgument)?;
            let data = &self.files[path.as_str()];
            let n = buf.len().min(data.len() - *pos);
            buf[..n].copy_from_slice(&data[*pos..*pos + n]);
            *pos += n;
            Ok(n)
        }

        fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
            let (path, pos) = self.open.get_mut(&fd).ok_or(Error::InvalidArgument)?;
            let len = self.files[path.as_str()].len() as i64;
            let new = match whence {
                Whence::Set => offset,
                Whence::Cur => *pos as i64 + offset,
                Whence::End => len + offset,
            };
            if new < 0 || new > len {
                return Err(Error::InvalidArgument);
            }
            *pos = new as usize;
            Ok(new as u64)
        }

        fn close(&mut self, fd: Fd) {
            self.open.remove(&fd);
        }
    }

    struct Fixture {
        pmm: &'static Pmm,
        heap: &'static KernelHeap,
        vm: Vm,
    }

    fn fixture(ram_pages: usize) -> Fixture {
        let pages = ram_pages + 32;
        let buf: Vec<u8> = vec![0u8; (pages + 1) * PAGE_SIZE];
        let start = align_up(buf.as_ptr() as u64, PAGE_SIZE as u64);
        std::mem::forget(buf);

        let storage = Box::leak(Box::new(vec![0u64; pages.div_ceil(64)]));
        let pmm: &'static Pmm = Box::leak(Box::new(Pmm::new()));
        pmm.init(
            start,
            pages as u64 * PAGE_SIZE as u64,
            Bitmap::from_slice(storage.as_mut_slice()),
        )
        .unwrap();

        // Reserve the guest RAM window up front so table/heap pages
        // never land inside it.
        let ram_pa = pmm.alloc_pages(ram_pages).unwrap();

        let layout = GuestLayout {
            ram_ipa: 0x4000_0000,
            ram_pa,
            ram_size: ram_pages as u64 * PAGE_SIZE as u64,
            passthrough: heapless::Vec::new(),
        };
        let vm = Vm::build(pmm, 0, "loadvm", layout).unwrap();
        let heap: &'static KernelHeap = Box::leak(Box::new(KernelHeap::new(pmm)));
        Fixture { pmm, heap, vm }
    }

    fn guest_byte(fx: &Fixture, ipa: Ipa) -> u8 {
        unsafe { *fx.vm.ipa_to_hva(ipa).unwrap() }
    }

    #[test]
    fn kernel_image_lands_at_its_load_address() {
        let fx = fixture(8);
        let image: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        let mut fs = MockFs::new(&[("guest/kernel.bin", image.clone())]);

        let manifest = GuestManifest {
            name: "linux",
            kernel_path: "guest/kernel.bin",
            dtb_path: None,
            initrd_path: None,
            bin_loadaddr: 0x4000_2000,
            dtb_loadaddr: 0,
            fs_loadaddr: 0,
            smp_num: 1,
            needs_dtb: false,
            needs_initrd: false,
        };
        load_guest(&mut fs, fx.heap, &fx.vm, &manifest).unwrap();

        // Spot-check both ends, crossing page boundaries.
        assert_eq!(guest_byte(&fx, 0x4000_2000), image[0]);
        assert_eq!(guest_byte(&fx, 0x4000_2000 + 4096), image[4096]);
        assert_eq!(
            guest_byte(&fx, 0x4000_2000 + 8999),
            image[8999]
        );

        // The bounce buffer went back to the heap.
        assert_eq!(fx.heap.pages_held(), 0);
        let _ = fx.pmm;
    }

    #[test]
    fn missing_kernel_is_fatal_missing_dtb_is_not() {
        let fx = fixture(4);
        let mut fs = MockFs::new(&[("k.bin", vec![0xaa; 64])]);

        let mut manifest = GuestManifest {
            name: "g",
            kernel_path: "absent.bin",
            dtb_path: Some("absent.dtb"),
            initrd_path: None,
            bin_loadaddr: 0x4000_0000,
            dtb_loadaddr: 0x4000_1000,
            fs_loadaddr: 0,
            smp_num: 1,
            needs_dtb: true,
            needs_initrd: false,
        };
        assert_eq!(
            load_guest(&mut fs, fx.heap, &fx.vm, &manifest).unwrap_err(),
            Error::NotFound
        );

        manifest.kernel_path = "k.bin";
        load_guest(&mut fs, fx.heap, &fx.vm, &manifest).unwrap();
        assert_eq!(guest_byte(&fx, 0x4000_0000), 0xaa);
    }

    #[test]
    fn load_outside_guest_ram_fails() {
        let fx = fixture(2);
        let mut fs = MockFs::new(&[("k.bin", vec![1u8; 3 * PAGE_SIZE])]);

        let manifest = GuestManifest {
            name: "g",
            kernel_path: "k.bin",
            dtb_path: None,
            initrd_path: None,
            // Two pages of RAM, three pages of image.
            bin_loadaddr: 0x4000_0000,
            dtb_loadaddr: 0,
            fs_loadaddr: 0,
            smp_num: 1,
            needs_dtb: false,
            needs_initrd: false,
        };
        assert_eq!(
            load_guest(&mut fs, fx.heap, &fx.vm, &manifest).unwrap_err(),
            Error::GuestFault
        );
        assert_eq!(fx.heap.pages_held(), 0, "bounce buffer freed on error");
    }

    #[test]
    fn seek_interface_round_trips() {
        let mut fs = MockFs::new(&[("f", (0..100u8).collect())]);
        let fd = fs.open("f").unwrap();
        assert_eq!(fs.seek(fd, 10, Whence::Set).unwrap(), 10);
        assert_eq!(fs.seek(fd, 5, Whence::Cur).unwrap(), 15);
        assert_eq!(fs.seek(fd, -1, Whence::End).unwrap(), 99);
        let mut byte = [0u8; 1];
        fs.read(fd, &mut byte).unwrap();
        assert_eq!(byte[0], 99);
        fs.close(fd);
    }
}
