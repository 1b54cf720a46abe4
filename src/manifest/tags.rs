use std::io::{BufRead, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Bit per manifest entry, MSB first within each byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMask {
    bits: Vec<bool>,
}

impl TagMask {
    pub fn new(len: usize) -> Self {
        Self { bits: vec![false; len] }
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let bits = (0..len)
            .map(|i| bytes.get(i / 8).is_some_and(|b| b & (0x80 >> (i % 8)) != 0))
            .collect();
        Self { bits }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, _) in self.bits.iter().enumerate().filter(|(_, b)| **b) {
            out[i / 8] |= 0x80 >> (i % 8);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    pub fn set(&mut self, i: usize, value: bool) {
        if let Some(b) = self.bits.get_mut(i) {
            *b = value;
        }
    }

    pub fn insert(&mut self, i: usize, value: bool) {
        self.bits.insert(i.min(self.bits.len()), value);
    }

    pub fn remove(&mut self, i: usize) {
        if i < self.bits.len() {
            self.bits.remove(i);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}

/// A named tag with its type and entry mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name:     String,
    pub tag_type: u16,
    pub mask:     TagMask,
}

impl Tag {
    pub(crate) fn read<R: BufRead>(r: &mut R, entries: usize) -> Result<Self> {
        let name = read_cstring(r)?;
        let tag_type = r.read_u16::<BigEndian>()?;
        let mut bytes = vec![0u8; entries.div_ceil(8)];
        r.read_exact(&mut bytes)?;
        Ok(Self { name, tag_type, mask: TagMask::from_bytes(&bytes, entries) })
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(self.name.as_bytes())?;
        w.write_u8(0)?;
        w.write_u16::<BigEndian>(self.tag_type)?;
        w.write_all(&self.mask.to_bytes())?;
        Ok(())
    }
}

pub(crate) fn read_cstring<R: BufRead>(r: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    r.read_until(0, &mut buf)?;
    if buf.pop() != Some(0) {
        return Err(Error::corrupt("manifest", "unterminated string"));
    }
    String::from_utf8(buf).map_err(|e| Error::corrupt("manifest", e.to_string()))
}

pub(crate) fn read_u40<R: Read>(r: &mut R) -> Result<u64> {
    let hi = r.read_u8()? as u64;
    let lo = r.read_u32::<BigEndian>()? as u64;
    Ok(hi << 32 | lo)
}

pub(crate) fn write_u40<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_u8((v >> 32) as u8)?;
    w.write_u32::<BigEndian>(v as u32)?;
    Ok(())
}
