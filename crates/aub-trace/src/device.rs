//! Device profiles: which generation a PCI device id belongs to and what that implies for the
//! trace format.

/// Capabilities of one GPU model that the trace format depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub pci_id: u32,
    pub name: &'static str,
    /// Hardware generation.
    pub ver: u32,
    /// Device code written into memtrace version records.
    pub simulator_id: u32,
}

impl DeviceInfo {
    /// Execlist submission and the memtrace dialect start with generation 8.
    #[inline]
    pub fn uses_execlists(&self) -> bool {
        self.ver >= 8
    }

    /// Generation 11 replaced the four-write submit port with a submission queue.
    #[inline]
    pub fn uses_elsq(&self) -> bool {
        self.ver >= 11
    }

    #[inline]
    pub fn addr_bits(&self) -> u32 {
        if self.ver >= 8 {
            48
        } else {
            32
        }
    }
}

/// Resolves a PCI device id to a profile.
pub trait DeviceLookup {
    fn lookup(&self, pci_id: u32) -> Option<DeviceInfo>;
}

impl<F> DeviceLookup for F
where
    F: Fn(u32) -> Option<DeviceInfo>,
{
    fn lookup(&self, pci_id: u32) -> Option<DeviceInfo> {
        self(pci_id)
    }
}

const KNOWN_DEVICES: &[DeviceInfo] = &[
    DeviceInfo {
        pci_id: 0x0166,
        name: "Intel(R) Ivybridge Mobile GT2",
        ver: 7,
        simulator_id: 7,
    },
    DeviceInfo {
        pci_id: 0x1616,
        name: "Intel(R) Broadwell GT2",
        ver: 8,
        simulator_id: 11,
    },
    DeviceInfo {
        pci_id: 0x1912,
        name: "Intel(R) Skylake GT2",
        ver: 9,
        simulator_id: 12,
    },
    DeviceInfo {
        pci_id: 0x5912,
        name: "Intel(R) Kabylake GT2",
        ver: 9,
        simulator_id: 16,
    },
    DeviceInfo {
        pci_id: 0x3e92,
        name: "Intel(R) Coffeelake GT2",
        ver: 9,
        simulator_id: 24,
    },
    DeviceInfo {
        pci_id: 0x5a52,
        name: "Intel(R) Cannonlake GT2",
        ver: 10,
        simulator_id: 15,
    },
    DeviceInfo {
        pci_id: 0x8a52,
        name: "Intel(R) Icelake GT2",
        ver: 11,
        simulator_id: 19,
    },
    DeviceInfo {
        pci_id: 0x9a49,
        name: "Intel(R) Tigerlake GT2",
        ver: 12,
        simulator_id: 22,
    },
];

/// Built-in table of device profiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownDevices;

impl KnownDevices {
    pub fn all() -> &'static [DeviceInfo] {
        KNOWN_DEVICES
    }
}

impl DeviceLookup for KnownDevices {
    fn lookup(&self, pci_id: u32) -> Option<DeviceInfo> {
        KNOWN_DEVICES.iter().find(|d| d.pci_id == pci_id).copied()
    }
}

/// Parse the `PCI-ID=<n>` tag at the start of `text`.
///
/// The number follows C `%i` conventions (`0x` hex, leading `0` octal, otherwise decimal).
/// Returns the id and the number of bytes consumed.
pub fn parse_pci_id_tag(text: &[u8]) -> Option<(u32, usize)> {
    const TAG: &[u8] = b"PCI-ID=";
    let rest = text.strip_prefix(TAG)?;

    let (radix, skip) = if rest.len() > 2 && (rest.starts_with(b"0x") || rest.starts_with(b"0X")) {
        (16, 2)
    } else if rest.len() > 1 && rest[0] == b'0' {
        (8, 1)
    } else {
        (10, 0)
    };

    let digits = rest[skip..]
        .iter()
        .take_while(|b| (**b as char).is_digit(radix))
        .count();
    if digits == 0 {
        // A lone "0" is still a number.
        return (rest.first() == Some(&b'0')).then_some((0, TAG.len() + 1));
    }

    let number = std::str::from_utf8(&rest[skip..skip + digits]).ok()?;
    let value = u32::from_str_radix(number, radix).ok()?;
    Some((value, TAG.len() + skip + digits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_drives_capabilities() {
        let ivb = KnownDevices.lookup(0x0166).unwrap();
        assert!(!ivb.uses_execlists());
        assert_eq!(ivb.addr_bits(), 32);

        let skl = KnownDevices.lookup(0x1912).unwrap();
        assert!(skl.uses_execlists());
        assert!(!skl.uses_elsq());
        assert_eq!(skl.addr_bits(), 48);

        let icl = KnownDevices.lookup(0x8a52).unwrap();
        assert!(icl.uses_elsq());

        assert_eq!(KnownDevices.lookup(0xffff), None);
    }

    #[test]
    fn closures_are_lookups() {
        let only_skl = |id: u32| (id == 0x1234).then(|| KnownDevices.lookup(0x1912).unwrap());
        assert_eq!(only_skl.lookup(0x1234).map(|d| d.ver), Some(9));
        assert_eq!(only_skl.lookup(0x1912), None);
    }

    #[test]
    fn pci_id_tag_follows_c_integer_rules() {
        assert_eq!(parse_pci_id_tag(b"PCI-ID=0x1912 app"), Some((0x1912, 13)));
        assert_eq!(parse_pci_id_tag(b"PCI-ID=0X5A52"), Some((0x5a52, 13)));
        assert_eq!(parse_pci_id_tag(b"PCI-ID=358"), Some((358, 10)));
        assert_eq!(parse_pci_id_tag(b"PCI-ID=0166"), Some((0o166, 11)));
        assert_eq!(parse_pci_id_tag(b"PCI-ID=0"), Some((0, 8)));
        assert_eq!(parse_pci_id_tag(b"PCI-ID=zz"), None);
        assert_eq!(parse_pci_id_tag(b"app PCI-ID=1"), None);
    }
}
