use super::decode::{Error, Session};
use super::value::{Tag, Value};

pub const POSITIVE_BIGNUM: u64 = 2;
pub const NEGATIVE_BIGNUM: u64 = 3;
pub const STRING_REF: u64 = 25;
pub const SHAREABLE: u64 = 28;
pub const SHARED_REF: u64 = 29;
pub const STRING_REF_NAMESPACE: u64 = 256;
pub const SELF_DESCRIBE: u64 = 55799;

pub(crate) type DefaultHandler = fn(&mut Session, Tag) -> Result<Value, Error>;

// Well-known tags handled when no hook intervenes.  The structural tags
// (25/28/29/256/55799) act around payload decoding and are matched by the
// dispatcher itself, not through this table.
static DEFAULT_HANDLERS: &[(u64, DefaultHandler)] = &[
    (POSITIVE_BIGNUM, bignum),
    (NEGATIVE_BIGNUM, bignum),
];

pub(crate) fn default_handler(tag: u64) -> Option<DefaultHandler> {
    DEFAULT_HANDLERS
        .iter()
        .find(|(number, _)| *number == tag)
        .map(|(_, handler)| *handler)
}

fn bignum(_session: &mut Session, tag: Tag) -> Result<Value, Error> {
    let magnitude = match &tag.value {
        Value::Bytes(bytes) => magnitude_from_be(bytes),
        Value::Shared(cell) => match &*cell.borrow() {
            Value::Bytes(bytes) => magnitude_from_be(bytes),
            _ => return Err(Error::InvalidTagPayload(tag.tag)),
        },
        _ => return Err(Error::InvalidTagPayload(tag.tag)),
    };
    match magnitude {
        Some(n) if tag.tag == NEGATIVE_BIGNUM => Ok(Value::Integer(-1 - n)),
        Some(n) => Ok(Value::Integer(n)),
        // Magnitudes beyond i128 stay tagged
        None => Ok(Value::Tag(Box::new(tag))),
    }
}

fn magnitude_from_be(bytes: &[u8]) -> Option<i128> {
    let mut n: i128 = 0;
    for &byte in bytes.iter().skip_while(|b| **b == 0) {
        n = n.checked_mul(256)?.checked_add(byte as i128)?;
    }
    Some(n)
}
