//! The initial byte and argument of every CBOR item.

/// CBOR major types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Major {
    Unsigned = 0,
    Negative = 1,
    Bytes = 2,
    Text = 3,
    Array = 4,
    Map = 5,
    Tag = 6,
    Simple = 7,
}

impl Major {
    pub(crate) fn of(initial: u8) -> Self {
        match initial >> 5 {
            0 => Major::Unsigned,
            1 => Major::Negative,
            2 => Major::Bytes,
            3 => Major::Text,
            4 => Major::Array,
            5 => Major::Map,
            6 => Major::Tag,
            _ => Major::Simple,
        }
    }
}

/// Low five bits announcing an indefinite length (or a break).
pub(crate) const INDEFINITE: u8 = 31;

/// Bytes of argument following the initial byte, for the given low bits.
/// `None` for inline arguments and for the reserved or indefinite forms.
pub(crate) fn argument_width(info: u8) -> Option<usize> {
    match info {
        24 => Some(1),
        25 => Some(2),
        26 => Some(4),
        27 => Some(8),
        _ => None,
    }
}

/// Smallest argument that needs `width` bytes. Anything lower has a
/// shorter head and is not canonical.
pub(crate) fn width_floor(width: usize) -> u64 {
    match width {
        1 => 24,
        2 => 0x100,
        4 => 0x1_0000,
        _ => 0x1_0000_0000,
    }
}

/// Appends the shortest head for `major` with argument `arg`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_head(out: &mut Vec<u8>, major: Major, arg: u64) {
    let high = (major as u8) << 5;
    match arg {
        0..=23 => out.push(high | arg as u8),
        24..=0xff => out.extend_from_slice(&[high | 24, arg as u8]),
        0x100..=0xffff => {
            out.push(high | 25);
            out.extend_from_slice(&(arg as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(high | 26);
            out.extend_from_slice(&(arg as u32).to_be_bytes());
        }
        _ => {
            out.push(high | 27);
            out.extend_from_slice(&arg.to_be_bytes());
        }
    }
}
