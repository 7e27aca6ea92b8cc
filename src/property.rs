// src/property.rs
//
// Property identifiers for get_property()/set_property().

use std::fmt;

/// Instance and object properties.
///
/// Instance properties ignore the handle they are queried with; object
/// properties need one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    // ═══════════════════════════════════════════
    // Instance
    // ═══════════════════════════════════════════
    SampleRate,
    Buffer,
    Channels,
    /// Instance flags (`StateFlags` bits)
    StateFlags,
    ActiveVoices,
    FreeVoices,
    TotalVoices,
    /// Percent of real time, smoothed
    CpuLoadAvg,
    CpuLoadMax,
    /// Microseconds per processing call, smoothed
    CpuTimeAvg,
    CpuTimeMax,
    Instructions,
    ExportAll,

    // ═══════════════════════════════════════════
    // Offline renderer
    // ═══════════════════════════════════════════
    OfflineBuffer,
    /// 16:16 fixed point
    SilenceLevel,
    SilenceWindow,
    SilenceGrace,

    // ═══════════════════════════════════════════
    // Objects
    // ═══════════════════════════════════════════
    /// Application-defined object flags
    Flags,
    RefCount,
    Looped,
}

impl Property {
    pub const ALL: [Property; 20] = [
        Property::SampleRate,
        Property::Buffer,
        Property::Channels,
        Property::StateFlags,
        Property::ActiveVoices,
        Property::FreeVoices,
        Property::TotalVoices,
        Property::CpuLoadAvg,
        Property::CpuLoadMax,
        Property::CpuTimeAvg,
        Property::CpuTimeMax,
        Property::Instructions,
        Property::ExportAll,
        Property::OfflineBuffer,
        Property::SilenceLevel,
        Property::SilenceWindow,
        Property::SilenceGrace,
        Property::Flags,
        Property::RefCount,
        Property::Looped,
    ];

    /// Stable numeric id used by the C ABI.
    pub fn id(self) -> i32 {
        match self {
            Property::SampleRate => 0x100,
            Property::Buffer => 0x101,
            Property::Channels => 0x102,
            Property::StateFlags => 0x103,
            Property::ActiveVoices => 0x104,
            Property::FreeVoices => 0x105,
            Property::TotalVoices => 0x106,
            Property::CpuLoadAvg => 0x107,
            Property::CpuLoadMax => 0x108,
            Property::CpuTimeAvg => 0x109,
            Property::CpuTimeMax => 0x10a,
            Property::Instructions => 0x10b,
            Property::ExportAll => 0x10c,
            Property::OfflineBuffer => 0x200,
            Property::SilenceLevel => 0x201,
            Property::SilenceWindow => 0x202,
            Property::SilenceGrace => 0x203,
            Property::Flags => 0x300,
            Property::RefCount => 0x301,
            Property::Looped => 0x302,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.id() == id)
    }

    /// Whether the property belongs to a handle rather than the instance.
    pub fn is_object(self) -> bool {
        matches!(self, Property::Flags | Property::RefCount | Property::Looped)
    }

    /// Whether `set_property` accepts it at all.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Property::StateFlags
                | Property::ExportAll
                | Property::OfflineBuffer
                | Property::SilenceLevel
                | Property::SilenceWindow
                | Property::SilenceGrace
                | Property::Flags
                | Property::Looped
        )
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_round_trip() {
        for p in Property::ALL {
            assert_eq!(Property::from_id(p.id()), Some(p));
        }
        let mut ids: Vec<i32> = Property::ALL.iter().map(|p| p.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), Property::ALL.len());
        assert_eq!(Property::from_id(0), None);
    }

    #[test]
    fn test_read_only_properties() {
        assert!(!Property::SampleRate.is_writable());
        assert!(!Property::RefCount.is_writable());
        assert!(Property::Looped.is_writable());
        assert!(Property::Looped.is_object());
    }
}
