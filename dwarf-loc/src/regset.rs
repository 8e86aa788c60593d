use crate::{config::ByteOrder, ExpressionError};

/// A run of registers stored back to back in an OS register buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMapEntry {
    /// Number of consecutive slots.
    pub count: usize,
    /// Cache number of the register in the first slot, or `None` for padding.
    pub first: Option<u16>,
    /// Size of each slot in bytes. Zero means the size of the register.
    pub slot_size: usize,
}

impl RegisterMapEntry {
    /// `count` registers starting at `first`, each in a `slot_size` byte slot.
    pub const fn registers(count: usize, first: u16, slot_size: usize) -> Self {
        Self {
            count,
            first: Some(first),
            slot_size,
        }
    }

    /// `slot_size` bytes that hold no register.
    pub const fn skip(slot_size: usize) -> Self {
        Self {
            count: 1,
            first: None,
            slot_size,
        }
    }
}

/// The layout of a register buffer as the OS hands it out, e.g. from `PTRACE_GETREGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSet {
    /// Name for diagnostics.
    pub name: &'static str,
    /// The slots in buffer order.
    pub map: &'static [RegisterMapEntry],
    /// Size of the whole buffer, including any trailing padding.
    pub size: usize,
    /// Sizes of the registers in the cache, indexed by cache number.
    pub register_sizes: &'static [usize],
}

/// Cache numbers of the amd64 registers. They are the DWARF numbers of the registers.
pub mod amd64 {
    pub const RAX: u16 = 0;
    pub const RDX: u16 = 1;
    pub const RCX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSI: u16 = 4;
    pub const RDI: u16 = 5;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const R8: u16 = 8;
    pub const R9: u16 = 9;
    pub const R10: u16 = 10;
    pub const R11: u16 = 11;
    pub const R12: u16 = 12;
    pub const R13: u16 = 13;
    pub const R14: u16 = 14;
    pub const R15: u16 = 15;
    /// The return address column, which holds the PC.
    pub const RIP: u16 = 16;
    pub const EFLAGS: u16 = 49;
    pub const ES: u16 = 50;
    pub const CS: u16 = 51;
    pub const SS: u16 = 52;
    pub const DS: u16 = 53;
    pub const FS: u16 = 54;
    pub const GS: u16 = 55;
    pub const FS_BASE: u16 = 58;
    pub const GS_BASE: u16 = 59;
}

/// Cache numbers of the aarch64 registers. Apart from `CPSR` they are the DWARF numbers.
pub mod aarch64 {
    pub const X0: u16 = 0;
    pub const SP: u16 = 31;
    pub const PC: u16 = 32;
    pub const CPSR: u16 = 33;
}

const fn amd64_register_sizes() -> [usize; 60] {
    let mut sizes = [0; 60];
    let mut register = 0;
    while register <= amd64::RIP as usize {
        sizes[register] = 8;
        register += 1;
    }
    let mut register = amd64::EFLAGS as usize;
    while register <= amd64::GS as usize {
        sizes[register] = 4;
        register += 1;
    }
    sizes[amd64::FS_BASE as usize] = 8;
    sizes[amd64::GS_BASE as usize] = 8;
    sizes
}

static AMD64_REGISTER_SIZES: [usize; 60] = amd64_register_sizes();

/// `struct user_regs_struct` of x86_64 Linux.
pub static AMD64_LINUX_GREGSET: RegisterSet = RegisterSet {
    name: "amd64 Linux general registers",
    map: &[
        RegisterMapEntry::registers(1, amd64::R15, 8),
        RegisterMapEntry::registers(1, amd64::R14, 8),
        RegisterMapEntry::registers(1, amd64::R13, 8),
        RegisterMapEntry::registers(1, amd64::R12, 8),
        RegisterMapEntry::registers(1, amd64::RBP, 8),
        RegisterMapEntry::registers(1, amd64::RBX, 8),
        RegisterMapEntry::registers(1, amd64::R11, 8),
        RegisterMapEntry::registers(1, amd64::R10, 8),
        RegisterMapEntry::registers(1, amd64::R9, 8),
        RegisterMapEntry::registers(1, amd64::R8, 8),
        RegisterMapEntry::registers(1, amd64::RAX, 8),
        RegisterMapEntry::registers(1, amd64::RCX, 8),
        RegisterMapEntry::registers(1, amd64::RDX, 8),
        RegisterMapEntry::registers(2, amd64::RSI, 8),
        // orig_rax
        RegisterMapEntry::skip(8),
        RegisterMapEntry::registers(1, amd64::RIP, 8),
        RegisterMapEntry::registers(1, amd64::CS, 8),
        RegisterMapEntry::registers(1, amd64::EFLAGS, 8),
        RegisterMapEntry::registers(1, amd64::RSP, 8),
        RegisterMapEntry::registers(1, amd64::SS, 8),
        RegisterMapEntry::registers(2, amd64::FS_BASE, 8),
        RegisterMapEntry::registers(1, amd64::DS, 8),
        RegisterMapEntry::registers(1, amd64::ES, 8),
        RegisterMapEntry::registers(2, amd64::FS, 8),
    ],
    size: 27 * 8,
    register_sizes: &AMD64_REGISTER_SIZES,
};

static AARCH64_REGISTER_SIZES: [usize; 34] = {
    let mut sizes = [8; 34];
    sizes[aarch64::CPSR as usize] = 4;
    sizes
};

/// `struct user_pt_regs` of aarch64 Linux.
pub static AARCH64_LINUX_GREGSET: RegisterSet = RegisterSet {
    name: "aarch64 Linux general registers",
    map: &[
        RegisterMapEntry::registers(31, aarch64::X0, 8),
        RegisterMapEntry::registers(1, aarch64::SP, 8),
        RegisterMapEntry::registers(1, aarch64::PC, 8),
        RegisterMapEntry::registers(1, aarch64::CPSR, 4),
    ],
    size: 34 * 8,
    register_sizes: &AARCH64_REGISTER_SIZES,
};

impl RegisterSet {
    /// Every slot as (register, offset, size), in buffer order.
    pub fn slots(&self) -> impl Iterator<Item = (Option<u16>, usize, usize)> + '_ {
        let mut offset = 0;
        self.map.iter().flat_map(move |entry| {
            (0..entry.count).map(move |i| {
                let register = entry.first.map(|first| first + i as u16);
                (register, entry.slot_size)
            })
        })
        .map(move |(register, slot_size)| {
            let size = match (slot_size, register) {
                (0, Some(register)) => self.register_sizes.get(usize::from(register)).copied().unwrap_or(0),
                _ => slot_size,
            };
            let slot = (register, offset, size);
            offset += size;
            slot
        })
    }

    /// Offset and size of the slot that holds `register`.
    pub fn slot_of(&self, register: u16) -> Option<(usize, usize)> {
        self.slots()
            .find(|(slot_register, _, _)| *slot_register == Some(register))
            .map(|(_, offset, size)| (offset, size))
    }
}

/// Whether the cache knows the value of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterStatus {
    /// Nothing was supplied yet.
    #[default]
    Unknown,
    /// The value is known.
    Valid,
    /// The value cannot be obtained, e.g. it was not collected.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedRegister {
    bytes: Vec<u8>,
    status: RegisterStatus,
}

/// Register values of one thread, indexed by cache number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCache {
    byte_order: ByteOrder,
    registers: Vec<CachedRegister>,
}

/// Copy an unsigned integer of `source.len()` bytes into `dest`, truncating or zero extending.
fn copy_integer(dest: &mut [u8], source: &[u8], byte_order: ByteOrder) {
    dest.fill(0);
    let len = dest.len().min(source.len());
    match byte_order {
        ByteOrder::Little => dest[..len].copy_from_slice(&source[..len]),
        ByteOrder::Big => {
            let dest_start = dest.len() - len;
            dest[dest_start..].copy_from_slice(&source[source.len() - len..]);
        }
    }
}

impl RegisterCache {
    /// A cache for registers of the given sizes, all unknown.
    pub fn new(register_sizes: &[usize], byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            registers: register_sizes
                .iter()
                .map(|size| CachedRegister {
                    bytes: vec![0; *size],
                    status: RegisterStatus::Unknown,
                })
                .collect(),
        }
    }

    /// A cache for the registers of `regset`.
    pub fn for_regset(regset: &RegisterSet, byte_order: ByteOrder) -> Self {
        Self::new(regset.register_sizes, byte_order)
    }

    fn register(&self, register: u16) -> Result<&CachedRegister, ExpressionError> {
        self.registers
            .get(usize::from(register))
            .filter(|cached| !cached.bytes.is_empty())
            .ok_or_else(|| ExpressionError::Other(format!("Invalid register number {register}")))
    }

    fn register_mut(&mut self, register: u16) -> Result<&mut CachedRegister, ExpressionError> {
        self.registers
            .get_mut(usize::from(register))
            .filter(|cached| !cached.bytes.is_empty())
            .ok_or_else(|| ExpressionError::Other(format!("Invalid register number {register}")))
    }

    /// The status of `register`.
    pub fn status(&self, register: u16) -> Result<RegisterStatus, ExpressionError> {
        Ok(self.register(register)?.status)
    }

    /// The raw bytes of `register`, in target byte order.
    pub fn read(&self, register: u16) -> Result<&[u8], ExpressionError> {
        let cached = self.register(register)?;
        match cached.status {
            RegisterStatus::Valid => Ok(&cached.bytes),
            RegisterStatus::Unavailable => Err(ExpressionError::NotAvailable(format!(
                "register {register} is not available"
            ))),
            RegisterStatus::Unknown => Err(ExpressionError::Other(format!(
                "register {register} has not been fetched"
            ))),
        }
    }

    /// Store the value of `register`, or mark it unavailable with `None`.
    pub fn supply(&mut self, register: u16, value: Option<&[u8]>) -> Result<(), ExpressionError> {
        let byte_order = self.byte_order;
        let cached = self.register_mut(register)?;
        match value {
            Some(value) => {
                copy_integer(&mut cached.bytes, value, byte_order);
                cached.status = RegisterStatus::Valid;
            }
            None => {
                cached.bytes.fill(0);
                cached.status = RegisterStatus::Unavailable;
            }
        }
        Ok(())
    }

    /// Copy registers out of an OS buffer laid out as `regset`.
    ///
    /// With `register` set only that register is transferred, otherwise all of them.
    /// Without a buffer the registers are marked unavailable.
    pub fn supply_regset(
        &mut self,
        regset: &RegisterSet,
        register: Option<u16>,
        buffer: Option<&[u8]>,
    ) -> Result<(), ExpressionError> {
        let size = buffer.map_or(regset.size, |buffer| buffer.len().min(regset.size));
        for (slot_register, offset, slot_size) in regset.slots() {
            if offset + slot_size > size {
                break;
            }
            let Some(slot_register) = slot_register else {
                continue;
            };
            if register.is_some_and(|register| register != slot_register) {
                continue;
            }
            tracing::trace!("{}: supply register {slot_register} from offset {offset}", regset.name);
            self.supply(slot_register, buffer.map(|buffer| &buffer[offset..offset + slot_size]))?;
            if register.is_some() {
                break;
            }
        }
        Ok(())
    }

    /// Copy registers into an OS buffer laid out as `regset`.
    ///
    /// With `register` set only that register is transferred, otherwise all of them.
    /// Padding in the buffer is left alone.
    pub fn collect_regset(
        &self,
        regset: &RegisterSet,
        register: Option<u16>,
        buffer: &mut [u8],
    ) -> Result<(), ExpressionError> {
        let size = buffer.len().min(regset.size);
        for (slot_register, offset, slot_size) in regset.slots() {
            if offset + slot_size > size {
                break;
            }
            let Some(slot_register) = slot_register else {
                continue;
            };
            if register.is_some_and(|register| register != slot_register) {
                continue;
            }
            let cached = self.register(slot_register)?;
            copy_integer(&mut buffer[offset..offset + slot_size], &cached.bytes, self.byte_order);
            if register.is_some() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn amd64_buffer() -> Vec<u8> {
        (0..27u64).flat_map(|slot| (0x1000 + slot).to_le_bytes()).collect()
    }

    #[test_case(&AMD64_LINUX_GREGSET, 27; "amd64")]
    #[test_case(&AARCH64_LINUX_GREGSET, 34; "aarch64")]
    fn slots_fit_the_buffer(regset: &RegisterSet, slots: usize) {
        let end = regset.slots().map(|(_, offset, size)| offset + size).max().unwrap();
        assert!(end <= regset.size);
        assert_eq!(regset.slots().count(), slots);
    }

    #[test]
    fn amd64_layout() {
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::R15), Some((0, 8)));
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::RAX), Some((80, 8)));
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::RDI), Some((112, 8)));
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::RIP), Some((128, 8)));
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::RSP), Some((152, 8)));
        assert_eq!(AMD64_LINUX_GREGSET.slot_of(amd64::GS), Some((208, 8)));
    }

    #[test]
    fn aarch64_layout() {
        assert_eq!(AARCH64_LINUX_GREGSET.slot_of(30), Some((240, 8)));
        assert_eq!(AARCH64_LINUX_GREGSET.slot_of(aarch64::SP), Some((248, 8)));
        assert_eq!(AARCH64_LINUX_GREGSET.slot_of(aarch64::PC), Some((256, 8)));
        assert_eq!(AARCH64_LINUX_GREGSET.slot_of(aarch64::CPSR), Some((264, 4)));
    }

    #[test]
    fn supply_all_registers() {
        let mut cache = RegisterCache::for_regset(&AMD64_LINUX_GREGSET, ByteOrder::Little);
        cache.supply_regset(&AMD64_LINUX_GREGSET, None, Some(&amd64_buffer())).unwrap();

        assert_eq!(cache.read(amd64::R15).unwrap(), &0x1000u64.to_le_bytes());
        assert_eq!(cache.read(amd64::RIP).unwrap(), &0x1010u64.to_le_bytes());
        // Segment registers are narrower than their slots.
        assert_eq!(cache.read(amd64::CS).unwrap(), &0x1011u32.to_le_bytes());
        // Registers outside the set stay unknown.
        assert_eq!(cache.status(17).unwrap_err().to_string(), "Invalid register number 17");
    }

    #[test]
    fn supply_one_register() {
        let mut cache = RegisterCache::for_regset(&AMD64_LINUX_GREGSET, ByteOrder::Little);
        cache
            .supply_regset(&AMD64_LINUX_GREGSET, Some(amd64::RSP), Some(&amd64_buffer()))
            .unwrap();
        assert_eq!(cache.read(amd64::RSP).unwrap(), &0x1013u64.to_le_bytes());
        assert_eq!(cache.status(amd64::RAX).unwrap(), RegisterStatus::Unknown);
    }

    #[test]
    fn missing_buffer_marks_unavailable() {
        let mut cache = RegisterCache::for_regset(&AARCH64_LINUX_GREGSET, ByteOrder::Little);
        cache.supply_regset(&AARCH64_LINUX_GREGSET, None, None).unwrap();
        assert_eq!(cache.status(aarch64::PC).unwrap(), RegisterStatus::Unavailable);
        assert!(cache.read(aarch64::PC).unwrap_err().is_not_available());
    }

    #[test]
    fn short_buffer_supplies_what_fits() {
        let mut cache = RegisterCache::for_regset(&AARCH64_LINUX_GREGSET, ByteOrder::Little);
        let buffer = vec![0xab; 252];
        cache.supply_regset(&AARCH64_LINUX_GREGSET, None, Some(&buffer)).unwrap();
        assert_eq!(cache.status(30).unwrap(), RegisterStatus::Valid);
        assert_eq!(cache.status(aarch64::SP).unwrap(), RegisterStatus::Unknown);
    }

    #[test]
    fn collect_round_trips_and_keeps_padding() {
        let mut cache = RegisterCache::for_regset(&AARCH64_LINUX_GREGSET, ByteOrder::Little);
        for register in 0..=aarch64::PC {
            cache.supply(register, Some(&u64::from(register).to_le_bytes())).unwrap();
        }
        cache.supply(aarch64::CPSR, Some(&[0x45, 0x23, 0x01, 0x80])).unwrap();

        let mut buffer = vec![0xee; AARCH64_LINUX_GREGSET.size];
        cache.collect_regset(&AARCH64_LINUX_GREGSET, None, &mut buffer).unwrap();
        assert_eq!(&buffer[8..16], &1u64.to_le_bytes());
        assert_eq!(&buffer[256..264], &32u64.to_le_bytes());
        assert_eq!(&buffer[264..272], &[0x45, 0x23, 0x01, 0x80, 0xee, 0xee, 0xee, 0xee]);
    }

    #[test]
    fn collect_one_widens_into_its_slot() {
        let mut cache = RegisterCache::for_regset(&AMD64_LINUX_GREGSET, ByteOrder::Big);
        cache.supply(amd64::EFLAGS, Some(&[0, 0, 0x02, 0x46])).unwrap();
        let mut buffer = vec![0xff; AMD64_LINUX_GREGSET.size];
        cache
            .collect_regset(&AMD64_LINUX_GREGSET, Some(amd64::EFLAGS), &mut buffer)
            .unwrap();
        assert_eq!(&buffer[144..152], &[0, 0, 0, 0, 0, 0, 0x02, 0x46]);
        assert_eq!(&buffer[136..144], &[0xff; 8]);
    }
}
