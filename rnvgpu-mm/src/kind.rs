// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Surface-kind bookkeeping.
//!
//! The kind byte in a leaf entry tells the memory system how a surface is
//! laid out and whether it carries compression state. Only the handful of
//! kinds the mapping path has to reason about are modeled here: each
//! compressible kind names the uncompressed kind it degrades to when the
//! chosen page size cannot carry compression or when the tag pool is dry.

/// Linear (pitch) layout, uncompressed.
pub const KIND_PITCH: u8 = 0x00;

/// 16-bit depth, uncompressed.
pub const KIND_Z16: u8 = 0x01;

/// 16-bit depth, 2-bit compression.
pub const KIND_Z16_2C: u8 = 0x04;

/// 32-bit color, uncompressed.
pub const KIND_C32: u8 = 0xC8;

/// 32-bit color, 2-bit compression with reduced-aliasing layout.
pub const KIND_C32_2CRA: u8 = 0xDB;

/// Generic 16Bx2 block-linear layout, uncompressed.
pub const KIND_GENERIC_16BX2: u8 = 0xFE;

/// Kind attributes consumed by the mapping path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindAttr {
    /// Whether this kind carries compression tags.
    pub compressible: bool,
    /// The uncompressed kind to fall back to. Equals the kind itself for
    /// kinds that are already uncompressed.
    pub fallback: u8,
}

/// Attributes for a kind byte. Unknown kinds are treated as uncompressed.
pub fn attr(kind: u8) -> KindAttr {
    match kind {
        KIND_Z16_2C => KindAttr {
            compressible: true,
            fallback: KIND_Z16,
        },
        KIND_C32_2CRA => KindAttr {
            compressible: true,
            fallback: KIND_C32,
        },
        _ => KindAttr {
            compressible: false,
            fallback: kind,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressible_kinds() {
        assert!(attr(KIND_C32_2CRA).compressible);
        assert_eq!(attr(KIND_C32_2CRA).fallback, KIND_C32);
        assert!(attr(KIND_Z16_2C).compressible);
        assert_eq!(attr(KIND_Z16_2C).fallback, KIND_Z16);
    }

    #[test]
    fn test_uncompressed_kinds() {
        for kind in [KIND_PITCH, KIND_Z16, KIND_C32, KIND_GENERIC_16BX2] {
            let a = attr(kind);
            assert!(!a.compressible);
            assert_eq!(a.fallback, kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        let a = attr(0x42);
        assert!(!a.compressible);
        assert_eq!(a.fallback, 0x42);
    }
}
