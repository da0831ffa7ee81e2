// Bit-level packing for bitfield runs
//
// Consecutive bitfields whose storage type has the same width and
// endianness share one storage unit. Little-endian storage fills from
// the least significant bit upward, big-endian from the most
// significant bit downward. A storage-type change, a width overflow or
// a non-bitfield field ends the run.

use crate::cursor::{Reader, Writer};
use crate::error::Error;
use crate::types::Endian;

/// Decode an unsigned integer from raw bytes
pub(crate) fn uint_from_bytes(bytes: &[u8], endian: Endian) -> u128 {
    let mut v: u128 = 0;
    match endian {
        Endian::Little => {
            for &b in bytes.iter().rev() {
                v = (v << 8) | b as u128;
            }
        }
        Endian::Big => {
            for &b in bytes {
                v = (v << 8) | b as u128;
            }
        }
    }
    v
}

/// Encode the low `size` bytes of an unsigned integer
pub(crate) fn uint_to_bytes(v: u128, size: usize, endian: Endian) -> Vec<u8> {
    let le = v.to_le_bytes();
    match endian {
        Endian::Little => le[..size].to_vec(),
        Endian::Big => {
            let mut out = le[..size].to_vec();
            out.reverse();
            out
        }
    }
}

fn mask(bits: u32) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

/// Reads bitfield runs. The storage unit is consumed from the cursor
/// eagerly when a run starts, so the cursor is already past the unit
/// while its bits are being handed out.
pub(crate) struct BitReader {
    key: Option<(u32, Endian)>,
    buffer: u128,
    remaining: u32,
}

impl BitReader {
    pub fn new() -> Self {
        Self {
            key: None,
            buffer: 0,
            remaining: 0,
        }
    }

    /// End the current run. The next bitfield starts a fresh unit.
    pub fn reset(&mut self) {
        self.key = None;
        self.buffer = 0;
        self.remaining = 0;
    }

    pub fn read(
        &mut self,
        cur: &mut Reader<'_>,
        storage_bits: u32,
        endian: Endian,
        bits: u32,
    ) -> Result<u128, Error> {
        debug_assert!(bits > 0 && bits <= storage_bits);
        if self.key != Some((storage_bits, endian)) || self.remaining < bits {
            let unit = cur.read_bytes((storage_bits / 8) as usize)?;
            self.buffer = uint_from_bytes(&unit, endian);
            self.remaining = storage_bits;
            self.key = Some((storage_bits, endian));
        }

        let v = match endian {
            Endian::Little => {
                let v = self.buffer & mask(bits);
                self.buffer >>= bits;
                v
            }
            Endian::Big => (self.buffer >> (self.remaining - bits)) & mask(bits),
        };
        self.remaining -= bits;
        Ok(v)
    }
}

/// Writes bitfield runs, flushing a full storage unit at a time
pub(crate) struct BitWriter {
    key: Option<(u32, Endian)>,
    buffer: u128,
    used: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            key: None,
            buffer: 0,
            used: 0,
        }
    }

    pub fn write(
        &mut self,
        w: &mut Writer,
        storage_bits: u32,
        endian: Endian,
        value: u128,
        bits: u32,
    ) {
        debug_assert!(bits > 0 && bits <= storage_bits);
        if self.key != Some((storage_bits, endian)) || self.used + bits > storage_bits {
            self.flush(w);
        }
        if self.key.is_none() {
            self.key = Some((storage_bits, endian));
            self.buffer = 0;
            self.used = 0;
        }

        let value = value & mask(bits);
        match endian {
            Endian::Little => self.buffer |= value << self.used,
            Endian::Big => self.buffer |= value << (storage_bits - self.used - bits),
        }
        self.used += bits;
        if self.used == storage_bits {
            self.flush(w);
        }
    }

    /// Emit the current storage unit, if any
    pub fn flush(&mut self, w: &mut Writer) {
        if let Some((storage_bits, endian)) = self.key.take() {
            w.write_bytes(&uint_to_bytes(self.buffer, (storage_bits / 8) as usize, endian));
            self.buffer = 0;
            self.used = 0;
        }
    }
}
