//! Memory-domain tags shared by every allocator variant.
//!
//! A domain is one coherent address space: the host CPU, a particular GPU,
//! and so on. Two endpoints in the same domain exchange payloads without a
//! copy; everything else goes through at most one lazy copy per destination
//! domain.

/// Allocation strategy stored in the allocator header.
#[derive(strum_macros::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Strategy {
    /// Fixed-stride ring of slots; the only strategy implemented today.
    Ring = 0,
}

impl TryFrom<u32> for Strategy {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        match v {
            0 => Ok(Strategy::Ring),
            other => Err(other),
        }
    }
}

/// Device class stored in the allocator header. Combined with the device
/// ordinal it identifies a memory domain.
#[derive(strum_macros::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Cpu = 0,
    Cuda = 1,
    /// Host-backed stand-in for an accelerator: separate address space,
    /// allocation granularity, and explicit DMA-style copies, but usable on
    /// machines without a GPU. The cross-domain machinery treats it exactly
    /// like a real device.
    Emulated = 2,
}

impl TryFrom<u32> for DeviceType {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        match v {
            0 => Ok(DeviceType::Cpu),
            1 => Ok(DeviceType::Cuda),
            2 => Ok(DeviceType::Emulated),
            other => Err(other),
        }
    }
}

/// Opaque 32-bit equality key for a memory domain:
/// `(device_type << 16) | device_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(u32);

impl DomainId {
    pub const CPU: DomainId = DomainId(0);

    pub fn new(device_type: DeviceType, device_number: u16) -> Self {
        DomainId((device_type as u32) << 16 | device_number as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        DomainId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn device_type(self) -> Result<DeviceType, u32> {
        DeviceType::try_from(self.0 >> 16)
    }

    pub fn device_number(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn is_cpu(self) -> bool {
        self.0 >> 16 == DeviceType::Cpu as u32
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.device_type() {
            Ok(ty) => write!(f, "{}#{}", ty, self.device_number()),
            Err(raw) => write!(f, "unknown({raw})#{}", self.device_number()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_round_trips() {
        let d = DomainId::new(DeviceType::Cuda, 3);
        assert_eq!(d.raw(), 1 << 16 | 3);
        assert_eq!(d.device_type(), Ok(DeviceType::Cuda));
        assert_eq!(d.device_number(), 3);
        assert!(!d.is_cpu());
        assert!(DomainId::CPU.is_cpu());
    }

    #[test]
    fn cpu_zero_is_the_cpu_domain() {
        assert_eq!(DomainId::new(DeviceType::Cpu, 0), DomainId::CPU);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(DeviceType::try_from(9), Err(9));
        assert_eq!(Strategy::try_from(1), Err(1));
    }
}
