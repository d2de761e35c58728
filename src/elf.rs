//! Format of an ELF executable file.

use bitflags::bitflags;

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464c_457f;

pub const ELF_CLASS64: u8 = 2;
pub const ELF_DATA_LE: u8 = 1;
pub const ELF_TYPE_EXEC: u16 = 2;
pub const ELF_MACHINE_X86_64: u16 = 0x3e;

pub const ELF_HDR_SIZE: usize = 64;
pub const PROG_HDR_SIZE: usize = 56;

/// File header.
#[derive(Default, Clone)]
#[repr(C)]
pub struct ElfHdr {
    pub magic: u32,
    pub elf: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

impl ElfHdr {
    pub fn parse(buf: &[u8; ELF_HDR_SIZE]) -> Self {
        let mut elf = [0u8; 12];
        elf.copy_from_slice(&buf[4..16]);
        Self {
            magic: u32_at(buf, 0),
            elf,
            typ: u16_at(buf, 16),
            machine: u16_at(buf, 18),
            version: u32_at(buf, 20),
            entry: u64_at(buf, 24),
            phoff: u64_at(buf, 32),
            shoff: u64_at(buf, 40),
            flags: u32_at(buf, 48),
            ehsize: u16_at(buf, 52),
            phentsize: u16_at(buf, 54),
            phnum: u16_at(buf, 56),
            shentsize: u16_at(buf, 58),
            shnum: u16_at(buf, 60),
            shstrndx: u16_at(buf, 62),
        }
    }

    /// A loadable 64-bit little-endian x86-64 executable.
    pub fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
            && self.elf[0] == ELF_CLASS64
            && self.elf[1] == ELF_DATA_LE
            && self.elf[2] == 1
            && self.typ == ELF_TYPE_EXEC
            && self.machine == ELF_MACHINE_X86_64
            && self.version == 1
            && self.phentsize == PROG_HDR_SIZE as u16
            && self.phnum <= 1024
    }
}

/// Program section header.
#[derive(Default, Clone)]
#[repr(C)]
pub struct ProgHdr {
    pub typ: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgHdr {
    pub fn parse(buf: &[u8; PROG_HDR_SIZE]) -> Self {
        Self {
            typ: u32_at(buf, 0),
            flags: u32_at(buf, 4),
            off: u64_at(buf, 8),
            vaddr: u64_at(buf, 16),
            paddr: u64_at(buf, 24),
            filesz: u64_at(buf, 32),
            memsz: u64_at(buf, 40),
            align: u64_at(buf, 48),
        }
    }
}

/// Values for ProgHdr type.
pub const ELF_PROG_LOAD: u32 = 1;
pub const ELF_PROG_DYNAMIC: u32 = 2;
pub const ELF_PROG_INTERP: u32 = 3;
pub const ELF_PROG_SHLIB: u32 = 5;

bitflags! {
    pub struct ElfProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let image = testing::build_exec(0x400000, 0x400000, b"code", 0, false);
        let mut hdr_buf = [0u8; ELF_HDR_SIZE];
        hdr_buf.copy_from_slice(&image[..ELF_HDR_SIZE]);
        let hdr = ElfHdr::parse(&hdr_buf);
        assert!(hdr.is_valid());
        assert_eq!(hdr.entry, 0x400000);
        assert_eq!(hdr.phnum, 1);

        let mut ph_buf = [0u8; PROG_HDR_SIZE];
        ph_buf.copy_from_slice(&image[ELF_HDR_SIZE..ELF_HDR_SIZE + PROG_HDR_SIZE]);
        let ph = ProgHdr::parse(&ph_buf);
        assert_eq!(ph.typ, ELF_PROG_LOAD);
        assert_eq!(ph.filesz, 4);
        assert_eq!(ph.vaddr % crate::param::PGSIZE as u64, ph.off % crate::param::PGSIZE as u64);
    }

    #[test]
    fn garbage_is_invalid() {
        let hdr = ElfHdr::parse(&[0u8; ELF_HDR_SIZE]);
        assert!(!hdr.is_valid());
    }
}
