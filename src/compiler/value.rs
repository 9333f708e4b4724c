//! The tagged runtime value encoding.
//!
//! Every run-time value is a single integer whose low two bits say what it
//! is: `00` special, `01` integer, `10` array address, `11` hash address.
//! Wrapping shifts the payload left by two and ors in the tag; unwrapping
//! divides by four, which floors on the machine and is therefore exact for
//! every tag on negative payloads too.

use num_bigint::BigInt;

pub const TAG_SPECIAL: i64 = 0;
pub const TAG_INT: i64 = 1;
pub const TAG_ARRAY: i64 = 2;
pub const TAG_HASH: i64 = 3;

// Wrapped special constants: payload << 2 with tag 00.
pub const FALSE: i64 = 0;
/// Strictly internal: "no receiver" and "unset hash slot". User code never
/// observes it.
pub const NONE: i64 = 4;
pub const TRUE: i64 = 8;
pub const NIL: i64 = 16;

// Class codes. The payload's low nibble is 8 + the instance tag, which is
// what makes `is_a?` a tag subtraction.
pub const CLASS_SPECIAL: i64 = 32;
pub const CLASS_INT: i64 = 36;
pub const CLASS_ARRAY: i64 = 40;
pub const CLASS_HASH: i64 = 44;

// Reserved heap addresses.
pub const NONE_ADDR: i64 = 0;
pub const TMP: i64 = 1;
pub const HEAP_COUNT: i64 = 2;

/// Fixed bucket count of the hash table's head array.
pub const HASH_BUCKETS: i64 = 11;

/// Wraps an integer payload as a runtime INT value.
pub fn wrap_int(n: &BigInt) -> BigInt {
    n * 4 + TAG_INT
}

/// Wraps a code point as a runtime INT value; character literals are just
/// integers.
pub fn wrap_char(c: char) -> BigInt {
    BigInt::from(c as u32) * 4 + TAG_INT
}

/// The classes whose instances exist at run time. Dispatch arms are laid
/// out in tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassId {
    Integer,
    Array,
    Hash,
}

impl ClassId {
    /// The wrapped class-code constant this class evaluates to in source.
    pub fn code(&self) -> i64 {
        match self {
            ClassId::Integer => CLASS_INT,
            ClassId::Array => CLASS_ARRAY,
            ClassId::Hash => CLASS_HASH,
        }
    }

    /// The tag its instances carry.
    pub fn tag(&self) -> i64 {
        match self {
            ClassId::Integer => TAG_INT,
            ClassId::Array => TAG_ARRAY,
            ClassId::Hash => TAG_HASH,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClassId::Integer => "Integer",
            ClassId::Array => "Array",
            ClassId::Hash => "Hash",
        }
    }

    /// Resolves a constant read against the built-in class names.
    pub fn from_name(name: &str) -> Option<ClassId> {
        match name {
            "Integer" => Some(ClassId::Integer),
            "Array" => Some(ClassId::Array),
            "Hash" => Some(ClassId::Hash),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_payload_and_tag() {
        for n in [-1000i64, -1, 0, 1, 42, 1 << 40] {
            let wrapped = wrap_int(&BigInt::from(n));
            // Flooring division by four recovers the payload for any sign.
            let payload = num_integer::Integer::div_floor(&wrapped, &BigInt::from(4));
            let tag = num_integer::Integer::mod_floor(&wrapped, &BigInt::from(4));
            assert_eq!(payload, BigInt::from(n));
            assert_eq!(tag, BigInt::from(TAG_INT));
        }
    }

    #[test]
    fn special_constants_have_special_tag() {
        for v in [FALSE, NONE, TRUE, NIL, CLASS_SPECIAL, CLASS_INT, CLASS_ARRAY, CLASS_HASH] {
            assert_eq!(v % 4, TAG_SPECIAL);
        }
    }

    #[test]
    fn class_codes_encode_instance_tags() {
        for class in [ClassId::Integer, ClassId::Array, ClassId::Hash] {
            // is_a? computes tag - (payload - 8) and expects zero.
            assert_eq!(class.code() / 4 - 8, class.tag());
        }
        assert_eq!(CLASS_SPECIAL / 4 - 8, TAG_SPECIAL);
    }

    #[test]
    fn char_literals_are_code_points() {
        assert_eq!(wrap_char(','), BigInt::from((',' as u32) * 4 + 1));
    }
}
