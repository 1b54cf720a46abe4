use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Locale mask of a root chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocaleFlags(pub u32);

const LOCALE_NAMES: &[(&str, u32)] = &[
    ("enUS", 0x2),
    ("koKR", 0x4),
    ("frFR", 0x10),
    ("deDE", 0x20),
    ("zhCN", 0x40),
    ("esES", 0x80),
    ("zhTW", 0x100),
    ("enGB", 0x200),
    ("enCN", 0x400),
    ("enTW", 0x800),
    ("esMX", 0x1000),
    ("ruRU", 0x2000),
    ("ptBR", 0x4000),
    ("itIT", 0x8000),
    ("ptPT", 0x10000),
];

impl LocaleFlags {
    pub const NONE:    LocaleFlags = LocaleFlags(0);
    pub const EN_US:   LocaleFlags = LocaleFlags(0x2);
    pub const KO_KR:   LocaleFlags = LocaleFlags(0x4);
    pub const FR_FR:   LocaleFlags = LocaleFlags(0x10);
    pub const DE_DE:   LocaleFlags = LocaleFlags(0x20);
    pub const ZH_CN:   LocaleFlags = LocaleFlags(0x40);
    pub const ES_ES:   LocaleFlags = LocaleFlags(0x80);
    pub const ZH_TW:   LocaleFlags = LocaleFlags(0x100);
    pub const EN_GB:   LocaleFlags = LocaleFlags(0x200);
    pub const EN_CN:   LocaleFlags = LocaleFlags(0x400);
    pub const EN_TW:   LocaleFlags = LocaleFlags(0x800);
    pub const ES_MX:   LocaleFlags = LocaleFlags(0x1000);
    pub const RU_RU:   LocaleFlags = LocaleFlags(0x2000);
    pub const PT_BR:   LocaleFlags = LocaleFlags(0x4000);
    pub const IT_IT:   LocaleFlags = LocaleFlags(0x8000);
    pub const PT_PT:   LocaleFlags = LocaleFlags(0x10000);
    /// Every locale the game ships; the locale mask of the global chunk.
    pub const ALL_WOW: LocaleFlags = LocaleFlags(
        0x2 | 0x4 | 0x10 | 0x20 | 0x40 | 0x80 | 0x100 | 0x200 | 0x1000 | 0x2000 | 0x4000 | 0x8000 | 0x10000,
    );
    pub const ALL:     LocaleFlags = LocaleFlags(u32::MAX);

    /// True when every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: LocaleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "All" | "all" => return Some(Self::ALL),
            "All_WoW" | "all_wow" => return Some(Self::ALL_WOW),
            "None" | "none" => return Some(Self::NONE),
            _ => {}
        }
        LOCALE_NAMES.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| LocaleFlags(*v))
    }
}

impl fmt::Display for LocaleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ALL => return f.write_str("All"),
            Self::ALL_WOW => return f.write_str("All_WoW"),
            Self::NONE => return f.write_str("None"),
            _ => {}
        }
        let names: Vec<&str> = LOCALE_NAMES.iter()
            .filter(|(_, v)| self.0 & v != 0)
            .map(|(n, _)| *n)
            .collect();
        if names.is_empty() {
            write!(f, "0x{:08x}", self.0)
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

impl fmt::Debug for LocaleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocaleFlags({self})")
    }
}

impl TryFrom<String> for LocaleFlags {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.split('|')
            .map(|part| LocaleFlags::from_name(part.trim()).ok_or_else(|| format!("unknown locale {part:?}")))
            .try_fold(LocaleFlags::NONE, |acc, l| l.map(|l| acc | l))
    }
}

impl From<LocaleFlags> for String {
    fn from(l: LocaleFlags) -> String {
        l.to_string()
    }
}

impl BitOr for LocaleFlags {
    type Output = LocaleFlags;
    fn bitor(self, rhs: Self) -> Self { LocaleFlags(self.0 | rhs.0) }
}

impl BitOrAssign for LocaleFlags {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl BitAnd for LocaleFlags {
    type Output = LocaleFlags;
    fn bitand(self, rhs: Self) -> Self { LocaleFlags(self.0 & rhs.0) }
}

/// Content mask of a root chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentFlags(pub u32);

impl ContentFlags {
    pub const NONE:           ContentFlags = ContentFlags(0);
    pub const LOW_VIOLENCE:   ContentFlags = ContentFlags(0x80);
    pub const NO_NAMES:       ContentFlags = ContentFlags(0x1000_0000);
    pub const BUNDLE:         ContentFlags = ContentFlags(0x4000_0000);
    pub const NO_COMPRESSION: ContentFlags = ContentFlags(0x8000_0000);

    #[inline]
    pub fn contains(self, other: ContentFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContentFlags {
    type Output = ContentFlags;
    fn bitor(self, rhs: Self) -> Self { ContentFlags(self.0 | rhs.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_wow_value() {
        assert_eq!(LocaleFlags::ALL_WOW.0, 0x1F3F6);
        assert!(LocaleFlags::ALL_WOW.contains(LocaleFlags::EN_US));
        assert!(!LocaleFlags::ALL_WOW.contains(LocaleFlags::EN_CN));
    }

    #[test]
    fn names_round_trip() {
        let l = LocaleFlags::try_from("enUS|deDE".to_string()).unwrap();
        assert_eq!(l, LocaleFlags::EN_US | LocaleFlags::DE_DE);
        assert_eq!(String::from(l), "enUS|deDE");
        assert!(LocaleFlags::try_from("xxYY".to_string()).is_err());
    }
}
