use super::tags;
use super::value::{Cell, Simple, Tag, Value};
use knot_io as io;
use knot_io::{Fill, Readahead, Source};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::trace;

/// Default readahead buffer size for streaming reads.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Default bound on decode nesting.
pub const DEFAULT_MAX_DEPTH: usize = 512;

// Incremental read granularity for strings, so a forged length cannot force
// a huge upfront allocation
const STRING_CHUNK_SIZE: usize = 65536;

// Preallocation cap for containers, for the same reason
const PREALLOC_LIMIT: usize = 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] io::Error),

    #[error("invalid minor-type value {0}")]
    InvalidMinorValue(u8),

    #[error("indefinite length not allowed here")]
    IndefiniteLength,

    #[error("length {0} exceeds addressable memory")]
    LengthOverflow(u64),

    #[error("major type {0} chunk inside indefinite length string")]
    InvalidChunk(u8),

    #[error("break marker outside indefinite length item")]
    UnexpectedBreak,

    #[error("invalid simple value {0}")]
    InvalidSimple(u8),

    #[error("error decoding text string")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("maximum recursion depth exceeded")]
    MaxRecursion,

    #[error("shared reference {0} not found")]
    SharedRefNotFound(usize),

    #[error("shared value {0} has not been initialized")]
    SharedRefUninitialized(usize),

    #[error("string reference outside of namespace")]
    StringRefOutsideNamespace,

    #[error("string reference {0} not found")]
    StringRefNotFound(usize),

    #[error("reference index is not an unsigned integer")]
    InvalidRefIndex,

    #[error("invalid payload for tag {0}")]
    InvalidTagPayload(u64),

    #[error("hook error: {0}")]
    Hook(Box<dyn std::error::Error + Send + Sync>),
}

/// How invalid UTF-8 in text strings is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrErrors {
    /// Fail the decode
    #[default]
    Strict,
    /// Substitute U+FFFD
    Replace,
    /// Drop invalid sequences
    Ignore,
}

/// Called with every tag that has no structural meaning; `Ok(None)` means
/// "not handled" and falls through to the built-in defaults.
///
/// Hooks stay installed while they run, so one that re-enters the decoder
/// through [`Session::decode_from_bytes`] is dispatched for nested tags too.
pub type TagHook = Rc<dyn Fn(&mut Session, &Tag) -> Result<Option<Value>, Error>>;

/// Called with every finished map; the return value replaces the map.
pub type ObjectHook = Rc<dyn Fn(&mut Session, Vec<(Value, Value)>) -> Result<Value, Error>>;

pub struct Options {
    pub tag_hook: Option<TagHook>,
    pub object_hook: Option<ObjectHook>,
    /// Decode containers in frozen form; forced on for map keys and tag
    /// payloads regardless
    pub immutable: bool,
    pub max_depth: usize,
    pub str_errors: StrErrors,
    /// Readahead capacity for streaming sessions; 0 reads straight from the
    /// source
    pub read_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tag_hook: None,
            object_hook: None,
            immutable: false,
            max_depth: DEFAULT_MAX_DEPTH,
            str_errors: StrErrors::default(),
            read_size: DEFAULT_READ_SIZE,
        }
    }
}

/// Per-decode state: the reference tables, hook slots and depth budget.
///
/// Hooks receive the session and may re-enter the decoder through
/// [`Session::decode_from_bytes`] or claim a pending share slot with
/// [`Session::set_shareable`].
pub struct Session {
    tag_hook: Option<TagHook>,
    object_hook: Option<ObjectHook>,
    immutable: bool,
    max_depth: usize,
    str_errors: StrErrors,
    depth: usize,
    share_index: Option<usize>,
    shareables: Vec<Option<Cell>>,
    stringrefs: Option<Vec<Value>>,
}

impl Session {
    fn new(options: Options) -> Self {
        Self {
            tag_hook: options.tag_hook,
            object_hook: options.object_hook,
            immutable: options.immutable,
            max_depth: options.max_depth,
            str_errors: options.str_errors,
            depth: 0,
            share_index: None,
            shareables: Vec::new(),
            stringrefs: None,
        }
    }

    /// Whether containers currently decode in frozen form.
    pub fn immutable(&self) -> bool {
        self.immutable
    }

    /// Claim the pending share slot, if any, registering `value` as its
    /// target.  Returns the shared handle, or the value unchanged when no
    /// marker is pending.
    pub fn set_shareable(&mut self, value: Value) -> Value {
        match self.share_index.take() {
            Some(index) => self.store_shareable(index, value),
            None => value,
        }
    }

    /// Decode one item from an in-memory buffer inside this session, sharing
    /// its reference tables and depth budget.  Intended for tag hooks that
    /// need to decode an embedded byte string.
    pub fn decode_from_bytes(&mut self, data: &[u8]) -> Result<Value, Error> {
        let mut reader = data;
        value_item(&mut reader, self)
    }

    fn store_shareable(&mut self, index: usize, value: Value) -> Value {
        let cell = Rc::new(RefCell::new(value));
        self.shareables[index] = Some(cell.clone());
        Value::Shared(cell)
    }

    // Strings earn a namespace entry only when a reference would be shorter
    // than repeating them (entry count determines the reference width)
    fn record_string(&mut self, value: &Value, length: usize) {
        let Some(namespace) = self.stringrefs.as_mut() else {
            return;
        };
        let eligible = match namespace.len() as u64 {
            ..24 => length >= 3,
            ..256 => length >= 4,
            ..65536 => length >= 5,
            ..4294967296 => length >= 6,
            _ => length >= 11,
        };
        if eligible {
            namespace.push(value.clone());
        }
    }

    fn run_object_hook(&mut self, pairs: Vec<(Value, Value)>) -> Result<Value, Error> {
        match self.object_hook.clone() {
            Some(hook) => hook.as_ref()(self, pairs),
            None => Ok(Value::Map(pairs)),
        }
    }

    fn reset(&mut self) {
        self.depth = 0;
        self.share_index = None;
        self.shareables.clear();
        self.stringrefs = None;
    }
}

/// A decoding session over a byte source.
///
/// One decoder owns one reader and one [`Session`]; `decode` may be called
/// repeatedly to read successive top-level items from the same stream, with
/// the reference tables cleared in between.
pub struct Decoder<F> {
    reader: F,
    session: Session,
}

impl<'a> Decoder<&'a [u8]> {
    /// One-shot decoding from an in-memory buffer, without readahead.
    pub fn from_slice(data: &'a [u8], options: Options) -> Self {
        Self {
            reader: data,
            session: Session::new(options),
        }
    }
}

impl<S: Source> Decoder<Readahead<S>> {
    /// Streaming decoding with a readahead buffer of `options.read_size`
    /// bytes batching reads against the source.
    pub fn new(source: S, options: Options) -> Self {
        let read_size = options.read_size;
        Self {
            reader: Readahead::new(source, read_size),
            session: Session::new(options),
        }
    }
}

impl<F: Fill> Decoder<F> {
    /// Decode the next item from the stream.
    pub fn decode(&mut self) -> Result<Value, Error> {
        let result = value_item(&mut self.reader, &mut self.session);
        self.session.reset();
        result
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Decode a single item from a byte slice with default options.
pub fn parse(data: &[u8]) -> Result<Value, Error> {
    Decoder::from_slice(data, Options::default()).decode()
}

enum Item {
    Value(Value),
    Break,
}

fn item<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Item, Error> {
    let [initial] = reader.fill_array()?;
    if session.depth == session.max_depth {
        return Err(Error::MaxRecursion);
    }
    session.depth += 1;
    let result = dispatch(reader, session, initial >> 5, initial & 0x1f);
    session.depth -= 1;
    result
}

fn dispatch<F: Fill>(
    reader: &mut F,
    session: &mut Session,
    major: u8,
    minor: u8,
) -> Result<Item, Error> {
    match major {
        0 => {
            let v = definite_length(reader, minor)?;
            Ok(Item::Value(Value::Integer(v as i128)))
        }
        1 => {
            let v = definite_length(reader, minor)?;
            Ok(Item::Value(Value::Integer(-1 - v as i128)))
        }
        2 => byte_string(reader, session, minor).map(Item::Value),
        3 => text_string(reader, session, minor).map(Item::Value),
        4 => array(reader, session, minor).map(Item::Value),
        5 => map(reader, session, minor).map(Item::Value),
        6 => {
            let number = definite_length(reader, minor)?;
            tagged(reader, session, number).map(Item::Value)
        }
        7 => simple_or_float(reader, minor),
        _ => unreachable!(),
    }
}

fn value_item<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    match item(reader, session)? {
        Item::Value(value) => Ok(value),
        Item::Break => Err(Error::UnexpectedBreak),
    }
}

// Keys and tag payloads decode in frozen form so that containers used as
// keys cannot be mutated afterwards
fn immutable_item<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Item, Error> {
    let saved = session.immutable;
    session.immutable = true;
    let result = item(reader, session);
    session.immutable = saved;
    result
}

fn immutable_value<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    match immutable_item(reader, session)? {
        Item::Value(value) => Ok(value),
        Item::Break => Err(Error::UnexpectedBreak),
    }
}

fn length<F: Fill>(reader: &mut F, minor: u8) -> Result<Option<u64>, Error> {
    match minor {
        ..24 => Ok(Some(minor as u64)),
        24 => Ok(Some(reader.fill_array::<1>()?[0] as u64)),
        25 => Ok(Some(u16::from_be_bytes(reader.fill_array()?) as u64)),
        26 => Ok(Some(u32::from_be_bytes(reader.fill_array()?) as u64)),
        27 => Ok(Some(u64::from_be_bytes(reader.fill_array()?))),
        31 => Ok(None),
        _ => Err(Error::InvalidMinorValue(minor)),
    }
}

fn definite_length<F: Fill>(reader: &mut F, minor: u8) -> Result<u64, Error> {
    length(reader, minor)?.ok_or(Error::IndefiniteLength)
}

fn item_count<F: Fill>(reader: &mut F, minor: u8) -> Result<Option<usize>, Error> {
    length(reader, minor)?.map(usize_length).transpose()
}

fn usize_length(len: u64) -> Result<usize, Error> {
    usize::try_from(len).map_err(|_| Error::LengthOverflow(len))
}

fn read_into<F: Fill>(reader: &mut F, buf: &mut Vec<u8>, mut remaining: usize) -> Result<(), Error> {
    while remaining > 0 {
        let n = remaining.min(STRING_CHUNK_SIZE);
        let start = buf.len();
        buf.resize(start + n, 0);
        reader.fill(&mut buf[start..])?;
        remaining -= n;
    }
    Ok(())
}

fn byte_string<F: Fill>(reader: &mut F, session: &mut Session, minor: u8) -> Result<Value, Error> {
    let mut buf = Vec::new();
    match length(reader, minor)? {
        Some(len) => read_into(reader, &mut buf, usize_length(len)?)?,
        None => {
            // Definite-length chunks of the same major type until the break
            loop {
                let [initial] = reader.fill_array()?;
                match (initial >> 5, initial & 0x1f) {
                    (7, 31) => break,
                    (2, chunk_minor) => {
                        let n = usize_length(definite_length(reader, chunk_minor)?)?;
                        read_into(reader, &mut buf, n)?;
                    }
                    (major, _) => return Err(Error::InvalidChunk(major)),
                }
            }
        }
    }
    let len = buf.len();
    let value = Value::Bytes(buf);
    session.record_string(&value, len);
    Ok(value)
}

fn text_string<F: Fill>(reader: &mut F, session: &mut Session, minor: u8) -> Result<Value, Error> {
    let decoded = match length(reader, minor)? {
        Some(len) => {
            let mut buf = Vec::new();
            read_into(reader, &mut buf, usize_length(len)?)?;
            decode_text(buf, session.str_errors)?
        }
        None => {
            // Each chunk must be valid text on its own
            let mut out = String::new();
            loop {
                let [initial] = reader.fill_array()?;
                match (initial >> 5, initial & 0x1f) {
                    (7, 31) => break,
                    (3, chunk_minor) => {
                        let n = usize_length(definite_length(reader, chunk_minor)?)?;
                        let mut chunk = Vec::new();
                        read_into(reader, &mut chunk, n)?;
                        out.push_str(&decode_text(chunk, session.str_errors)?);
                    }
                    (major, _) => return Err(Error::InvalidChunk(major)),
                }
            }
            out
        }
    };
    let len = decoded.len();
    let value = Value::Text(decoded);
    session.record_string(&value, len);
    Ok(value)
}

fn decode_text(bytes: Vec<u8>, mode: StrErrors) -> Result<String, Error> {
    match mode {
        StrErrors::Strict => {
            String::from_utf8(bytes).map_err(|e| Error::Utf8(e.utf8_error()))
        }
        StrErrors::Replace => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        StrErrors::Ignore => {
            let mut out = String::new();
            let mut input = bytes.as_slice();
            loop {
                match std::str::from_utf8(input) {
                    Ok(valid) => {
                        out.push_str(valid);
                        break Ok(out);
                    }
                    Err(e) => {
                        let (valid, rest) = input.split_at(e.valid_up_to());
                        out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                        match e.error_len() {
                            Some(n) => input = &rest[n..],
                            None => break Ok(out),
                        }
                    }
                }
            }
        }
    }
}

fn array<F: Fill>(reader: &mut F, session: &mut Session, minor: u8) -> Result<Value, Error> {
    let count = item_count(reader, minor)?;
    match session.share_index.take() {
        // A pending marker must see the container before its contents
        // decode, so that a back-reference inside resolves to this array
        Some(index) if !session.immutable => {
            let items = Vec::with_capacity(count.unwrap_or(0).min(PREALLOC_LIMIT));
            let cell = Rc::new(RefCell::new(Value::Array(items)));
            session.shareables[index] = Some(cell.clone());
            array_into_cell(reader, session, count, &cell)?;
            Ok(Value::Shared(cell))
        }
        pending => {
            let mut items = Vec::with_capacity(count.unwrap_or(0).min(PREALLOC_LIMIT));
            match count {
                Some(n) => {
                    for _ in 0..n {
                        items.push(value_item(reader, session)?);
                    }
                }
                None => loop {
                    match item(reader, session)? {
                        Item::Break => break,
                        Item::Value(value) => items.push(value),
                    }
                },
            }
            let value = Value::Array(items);
            Ok(match pending {
                Some(index) => session.store_shareable(index, value),
                None => value,
            })
        }
    }
}

fn array_into_cell<F: Fill>(
    reader: &mut F,
    session: &mut Session,
    count: Option<usize>,
    cell: &Cell,
) -> Result<(), Error> {
    let push = |cell: &Cell, value| {
        if let Value::Array(items) = &mut *cell.borrow_mut() {
            items.push(value);
        }
    };
    match count {
        Some(n) => {
            for _ in 0..n {
                let value = value_item(reader, session)?;
                push(cell, value);
            }
        }
        None => loop {
            match item(reader, session)? {
                Item::Break => break,
                Item::Value(value) => push(cell, value),
            }
        },
    }
    Ok(())
}

fn map<F: Fill>(reader: &mut F, session: &mut Session, minor: u8) -> Result<Value, Error> {
    let count = item_count(reader, minor)?;
    match session.share_index.take() {
        Some(index) if !session.immutable => {
            let cell = Rc::new(RefCell::new(Value::Map(Vec::new())));
            session.shareables[index] = Some(cell.clone());
            map_into_cell(reader, session, count, &cell)?;
            if session.object_hook.is_some() {
                // Update the placeholder in place so back-references
                // observe the hook's replacement
                let pairs = match std::mem::replace(&mut *cell.borrow_mut(), Value::Null) {
                    Value::Map(pairs) => pairs,
                    _ => Vec::new(),
                };
                let replacement = session.run_object_hook(pairs)?;
                *cell.borrow_mut() = replacement;
            }
            Ok(Value::Shared(cell))
        }
        pending => {
            let mut pairs = Vec::new();
            match count {
                Some(n) => {
                    for _ in 0..n {
                        let key = immutable_value(reader, session)?;
                        let value = value_item(reader, session)?;
                        insert_entry(&mut pairs, key, value);
                    }
                }
                None => loop {
                    match immutable_item(reader, session)? {
                        Item::Break => break,
                        Item::Value(key) => {
                            // A break here would leave the key unpaired
                            let value = value_item(reader, session)?;
                            insert_entry(&mut pairs, key, value);
                        }
                    }
                },
            }
            let value = session.run_object_hook(pairs)?;
            Ok(match pending {
                Some(index) => session.store_shareable(index, value),
                None => value,
            })
        }
    }
}

fn map_into_cell<F: Fill>(
    reader: &mut F,
    session: &mut Session,
    count: Option<usize>,
    cell: &Cell,
) -> Result<(), Error> {
    // The key may be a back-reference to this very map, and comparing it
    // re-borrows the cell, so the duplicate scan runs under a shared borrow
    let insert = |cell: &Cell, key: Value, value: Value| {
        let position = match &*cell.borrow() {
            Value::Map(pairs) => pairs.iter().position(|(k, _)| *k == key),
            _ => None,
        };
        if let Value::Map(pairs) = &mut *cell.borrow_mut() {
            match position {
                Some(i) => pairs[i].1 = value,
                None => pairs.push((key, value)),
            }
        }
    };
    match count {
        Some(n) => {
            for _ in 0..n {
                let key = immutable_value(reader, session)?;
                let value = value_item(reader, session)?;
                insert(cell, key, value);
            }
        }
        None => loop {
            match immutable_item(reader, session)? {
                Item::Break => break,
                Item::Value(key) => {
                    let value = value_item(reader, session)?;
                    insert(cell, key, value);
                }
            }
        },
    }
    Ok(())
}

// Last write wins for duplicate keys
fn insert_entry(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if let Some(entry) = pairs.iter_mut().find(|(k, _)| *k == key) {
        entry.1 = value;
    } else {
        pairs.push((key, value));
    }
}

fn tagged<F: Fill>(reader: &mut F, session: &mut Session, number: u64) -> Result<Value, Error> {
    match number {
        tags::STRING_REF => string_ref(reader, session),
        tags::SHAREABLE => shareable(reader, session),
        tags::SHARED_REF => shared_ref(reader, session),
        tags::STRING_REF_NAMESPACE => string_ref_namespace(reader, session),
        tags::SELF_DESCRIBE => value_item(reader, session),
        _ => tagged_value(reader, session, number),
    }
}

fn tagged_value<F: Fill>(reader: &mut F, session: &mut Session, number: u64) -> Result<Value, Error> {
    // A tag that will survive as a tagged value claims a pending share slot
    // before its payload decodes, so cycles through custom tags reconstruct
    if session.tag_hook.is_none() && tags::default_handler(number).is_none() {
        if let Some(index) = session.share_index.take() {
            let cell = Rc::new(RefCell::new(Value::Tag(Box::new(Tag::new(
                number,
                Value::Null,
            )))));
            session.shareables[index] = Some(cell.clone());
            let payload = immutable_value(reader, session)?;
            if let Value::Tag(tag) = &mut *cell.borrow_mut() {
                tag.value = payload;
            }
            return Ok(Value::Shared(cell));
        }
    }

    let payload = immutable_value(reader, session)?;
    let tag = Tag::new(number, payload);

    if let Some(hook) = session.tag_hook.clone() {
        if let Some(replacement) = hook.as_ref()(session, &tag)? {
            return Ok(replacement);
        }
    }

    match tags::default_handler(number) {
        Some(handler) => handler(session, tag),
        None => {
            trace!(tag = number, "no handler for tag, returning tagged value");
            Ok(Value::Tag(Box::new(tag)))
        }
    }
}

fn shareable<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    let outer = session.share_index.replace(session.shareables.len());
    session.shareables.push(None);
    // If the payload did not claim the slot itself, register the final value
    let result = value_item(reader, session).map(|value| session.set_shareable(value));
    session.share_index = outer;
    result
}

fn shared_ref<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    let index = reference_index(reader, session)?;
    match session.shareables.get(index) {
        Some(Some(cell)) => Ok(Value::Shared(cell.clone())),
        Some(None) => Err(Error::SharedRefUninitialized(index)),
        None => Err(Error::SharedRefNotFound(index)),
    }
}

fn string_ref<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    let index = reference_index(reader, session)?;
    let namespace = session
        .stringrefs
        .as_ref()
        .ok_or(Error::StringRefOutsideNamespace)?;
    namespace
        .get(index)
        .cloned()
        .ok_or(Error::StringRefNotFound(index))
}

fn string_ref_namespace<F: Fill>(reader: &mut F, session: &mut Session) -> Result<Value, Error> {
    // Scopes nest without inheriting entries from the enclosing one
    let outer = session.stringrefs.replace(Vec::new());
    let result = value_item(reader, session);
    session.stringrefs = outer;
    result
}

fn reference_index<F: Fill>(reader: &mut F, session: &mut Session) -> Result<usize, Error> {
    value_item(reader, session)?
        .as_index()
        .ok_or(Error::InvalidRefIndex)
}

fn simple_or_float<F: Fill>(reader: &mut F, minor: u8) -> Result<Item, Error> {
    let value = match minor {
        ..20 => Value::Simple(Simple(minor)),
        20 => Value::Bool(false),
        21 => Value::Bool(true),
        22 => Value::Null,
        23 => Value::Undefined,
        24 => {
            let [v] = reader.fill_array()?;
            if v < 32 {
                return Err(Error::InvalidSimple(v));
            }
            Value::Simple(Simple(v))
        }
        25 => Value::Float(half::f16::from_be_bytes(reader.fill_array()?).into()),
        26 => Value::Float(f32::from_be_bytes(reader.fill_array()?).into()),
        27 => Value::Float(f64::from_be_bytes(reader.fill_array()?)),
        31 => return Ok(Item::Break),
        _ => return Err(Error::InvalidMinorValue(minor)),
    };
    Ok(Item::Value(value))
}
