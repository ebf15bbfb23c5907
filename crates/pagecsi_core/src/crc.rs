//! CRC32C algebra.
//!
//! Page checksums are CRC32C (Castagnoli) values as produced by the
//! [`crc32c`] crate. Besides plain computation this module provides the
//! operations needed to update a page checksum when only part of the page
//! changes:
//!
//! | Operation | Result |
//! |-----------|--------|
//! | `combine(crc(A), crc(B), len(B))` | `crc(A ++ B)` |
//! | `split1(crc(A ++ B), crc(B), len(B))` | `crc(A)` |
//! | `split2(crc(A ++ B), crc(A), len(B))` | `crc(B)` |
//! | `extend_with_zero(crc(A), n)` | `crc(A ++ [0; n])` |
//!
//! All of them work on polynomials modulo the CRC32C generator in the
//! reflected bit order used by the checksum itself. Appending `n` bytes to a
//! message multiplies its register by `x^(8n)`, so combining and splitting
//! reduce to multiplying by `x^(8n)` or by its inverse.

/// Size of a page in bytes. One tag covers one page.
pub const PAGE_SIZE: usize = 4096;

/// [`PAGE_SIZE`] as a `u64`, for offset arithmetic.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// CRC32C generator polynomial, reflected.
const POLY: u32 = 0x82f6_3b78;

/// The polynomial `1` in reflected representation.
const ONE: u32 = 0x8000_0000;

/// Computes the CRC32C of `data`.
#[inline]
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continues `crc` over `data`, giving the CRC32C of the concatenation.
#[inline]
#[must_use]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Multiplies two polynomials modulo the generator.
const fn mult_mod_p(a: u32, mut b: u32) -> u32 {
    let mut m = ONE;
    let mut p = 0u32;
    loop {
        if a & m != 0 {
            p ^= b;
            if a & (m - 1) == 0 {
                break;
            }
        }
        m >>= 1;
        if m == 0 {
            break;
        }
        b = if b & 1 != 0 { (b >> 1) ^ POLY } else { b >> 1 };
    }
    p
}

/// Divides a polynomial by `x` modulo the generator.
///
/// Undoes one register shift: the generator's top bit tells whether the
/// forward shift reduced by the polynomial.
const fn shift_back(r: u32) -> u32 {
    if r & ONE != 0 {
        ((r ^ POLY) << 1) | 1
    } else {
        r << 1
    }
}

/// Raises `base` to the power `exp` modulo the generator.
const fn pow_mod_p(mut base: u32, mut exp: u64) -> u32 {
    let mut result = ONE;
    while exp != 0 {
        if exp & 1 != 0 {
            result = mult_mod_p(result, base);
        }
        base = mult_mod_p(base, base);
        exp >>= 1;
    }
    result
}

/// `x^8`: the effect of appending one zero byte.
const X8: u32 = ONE >> 8;

/// `x^-8`: the effect of removing one trailing byte.
const X8_INV: u32 = {
    let mut r = ONE;
    let mut i = 0;
    while i < 8 {
        r = shift_back(r);
        i += 1;
    }
    r
};

/// Multiplies `crc` by `x^(8 * len)`.
#[inline]
fn shift_bytes(crc: u32, len: u64) -> u32 {
    mult_mod_p(pow_mod_p(X8, len), crc)
}

/// Multiplies `crc` by `x^(-8 * len)`.
#[inline]
fn unshift_bytes(crc: u32, len: u64) -> u32 {
    mult_mod_p(pow_mod_p(X8_INV, len), crc)
}

/// Returns the CRC32C of `A ++ B` given `crc(A)`, `crc(B)` and `len(B)`.
#[must_use]
pub fn combine(crc1: u32, crc2: u32, len2: usize) -> u32 {
    if len2 == 0 {
        return crc1;
    }
    shift_bytes(crc1, len2 as u64) ^ crc2
}

/// Returns `crc(A)` given `crc(A ++ B)`, `crc(B)` and `len(B)`.
#[must_use]
pub fn split1(crc_total: u32, crc2: u32, len2: usize) -> u32 {
    if len2 == 0 {
        return crc_total;
    }
    unshift_bytes(crc_total ^ crc2, len2 as u64)
}

/// Returns `crc(B)` given `crc(A ++ B)`, `crc(A)` and `len(B)`.
#[must_use]
pub fn split2(crc_total: u32, crc1: u32, len2: usize) -> u32 {
    if len2 == 0 {
        return 0;
    }
    crc_total ^ shift_bytes(crc1, len2 as u64)
}

/// Returns the CRC32C of `A ++ [0; n]` given `crc(A)`.
#[must_use]
pub fn extend_with_zero(crc: u32, n: usize) -> u32 {
    if n == 0 {
        return crc;
    }
    shift_bytes(crc ^ u32::MAX, n as u64) ^ u32::MAX
}

/// Returns the CRC32C of a page of zeros.
#[must_use]
pub fn crc_zero_page() -> u32 {
    extend_with_zero(0, PAGE_SIZE)
}

/// Computes one CRC32C per page-sized chunk of `data` into `out`.
///
/// The final chunk may be short. `out` must hold at least
/// `data.len().div_ceil(PAGE_SIZE)` entries.
pub fn calc_pages(data: &[u8], out: &mut [u32]) {
    for (tag, chunk) in out.iter_mut().zip(data.chunks(PAGE_SIZE)) {
        *tag = crc32c(chunk);
    }
}

/// Returns the number of pages needed to hold `len` bytes.
#[inline]
#[must_use]
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE_U64)
}
