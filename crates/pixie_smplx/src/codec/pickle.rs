//! Reader for the Python pickle format (protocols 0 to 5).
//!
//! Only data is reconstructed, no Python code runs: ``REDUCE``, ``NEWOBJ`` and
//! ``BUILD`` produce [`Value::Object`] nodes naming the callable, its arguments
//! and the state. Interpreting those (numpy arrays, dtypes) is the job of
//! [`crate::codec::numpy`].
use log::debug;
use std::collections::HashMap;
use thiserror::Error;

/// Opcodes of the pickle virtual machine
#[allow(dead_code)]
pub(crate) mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    // protocol 2
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    // protocol 3
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    // protocol 4
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    // protocol 5
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

pub const HIGHEST_PROTOCOL: u8 = 5;
/// Nesting limit, also catches self-referencing containers
const MAX_DEPTH: usize = 512;
/// Resolved values may be at most this many times larger than the stream
const MAX_EXPANSION: usize = 64;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("unexpected end of pickle stream at byte {0}")]
    UnexpectedEof(usize),
    #[error("unsupported opcode 0x{opcode:02x} at byte {pos}")]
    UnsupportedOpcode { opcode: u8, pos: usize },
    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("{what} is not supported (byte {pos})")]
    Unsupported { what: &'static str, pos: usize },
    #[error("pickle stack underflow at byte {0}")]
    StackUnderflow(usize),
    #[error("no MARK on the stack at byte {0}")]
    MissingMark(usize),
    #[error("memo key {0} is not defined")]
    MissingMemo(u32),
    #[error("legacy string at byte {0} is not ASCII")]
    NonAsciiString(usize),
    #[error("invalid UTF-8 string at byte {0}")]
    InvalidUtf8(usize),
    #[error("malformed literal `{literal}` at byte {pos}")]
    BadLiteral { literal: String, pos: usize },
    #[error("integer at byte {0} does not fit in 64 bits")]
    IntegerOverflow(usize),
    #[error("expected {expected} at byte {pos}")]
    UnexpectedValue { expected: &'static str, pos: usize },
    #[error("structure nested deeper than {MAX_DEPTH} levels or self-referencing")]
    TooDeep,
    #[error("memo references expand to more than {0} values")]
    TooLarge(usize),
}

/// How legacy (Python 2) ``str`` payloads are decoded. Mirrors the
/// ``encoding`` argument of ``pickle.load``.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringEncoding {
    /// Payloads must be ASCII, which is what Python 3 does by default
    Ascii,
    /// Every byte maps to the code point of the same value
    Latin1,
}

/// A decoded pickle value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Keys keep their insertion order
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Reference to a module attribute, usually a class or a function
    Global { module: String, name: String },
    /// Result of calling ``callable(*args)`` and then applying ``state``
    Object {
        callable: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
    /// Reference into the memo. Only exists while decoding, [`loads`] never
    /// returns it.
    MemoRef(u32),
}

impl Value {
    /// Python-ish name of the variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Global { .. } => "global",
            Value::Object { .. } => "object",
            Value::MemoRef(_) => "memo reference",
        }
    }

    /// True for a global named ``module.name``
    pub fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Value::Global { module: m, name: n } if m == module && n == name)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Decodes a complete pickle stream.
/// # Errors
/// Will return an error if the stream is malformed, truncated, or uses
/// features that need Python to evaluate (persistent ids, extension
/// registry, out-of-band buffers), or if a legacy string cannot be decoded
/// with ``encoding``
pub fn loads(data: &[u8], encoding: StringEncoding) -> Result<Value, PickleError> {
    let mut machine = Unpickler::new(data, encoding);
    let top = machine.run()?;
    let budget = data.len().saturating_mul(MAX_EXPANSION).max(1 << 16);
    Resolver::new(&machine.memo, budget).resolve(&top, 0)
}

/// A value under construction with the number of containers nested in it.
/// Every value the machine can still mutate is a slot on the stack or in the
/// memo, so checking depth there bounds every tree it builds.
#[derive(Clone, Debug)]
struct Slot {
    value: Value,
    depth: usize,
}

impl Slot {
    fn leaf(value: Value) -> Self {
        Self { value, depth: 0 }
    }

    /// Accounts for a child of ``child_depth`` moved into this container
    fn nest(&mut self, child_depth: usize) -> Result<(), PickleError> {
        self.depth = self.depth.max(child_depth + 1);
        if self.depth > MAX_DEPTH {
            return Err(PickleError::TooDeep);
        }
        Ok(())
    }
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    encoding: StringEncoding,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Slot>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8], encoding: StringEncoding) -> Self {
        Self {
            data,
            pos: 0,
            encoding,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run(&mut self) -> Result<Value, PickleError> {
        loop {
            let at = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let proto = self.read_u8()?;
                    if proto > HIGHEST_PROTOCOL {
                        return Err(PickleError::UnsupportedProtocol(proto));
                    }
                    debug!("pickle protocol {proto}");
                }
                op::FRAME => {
                    self.read_bytes(8)?;
                }
                op::STOP => return self.pop().map(|slot| slot.value),

                // stack manipulation
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(at))?;
                    self.stack.push(top);
                }

                // scalars
                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),
                op::INT => {
                    let line = self.read_line_str()?;
                    let value = match line.as_str() {
                        "01" => Value::Bool(true),
                        "00" => Value::Bool(false),
                        _ => Value::Int(parse_int_literal(&line, at)?),
                    };
                    self.push(value);
                }
                op::LONG => {
                    let line = self.read_line_str()?;
                    let trimmed = line.strip_suffix('L').unwrap_or(&line);
                    self.push(Value::Int(parse_int_literal(trimmed, at)?));
                }
                op::BININT => {
                    let v = i32::from_le_bytes(self.read_array()?);
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT1 => {
                    let v = self.read_u8()?;
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.read_array()?);
                    self.push(Value::Int(i64::from(v)));
                }
                op::LONG1 => {
                    let n = usize::from(self.read_u8()?);
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Int(decode_long(bytes, at)?));
                }
                op::LONG4 => {
                    let n = self.read_len_i32(at)?;
                    let bytes = self.read_bytes(n)?;
                    self.push(Value::Int(decode_long(bytes, at)?));
                }
                op::FLOAT => {
                    let line = self.read_line_str()?;
                    let v = line.trim().parse::<f64>().map_err(|_| PickleError::BadLiteral { literal: line.clone(), pos: at })?;
                    self.push(Value::Float(v));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.read_array()?);
                    self.push(Value::Float(v));
                }

                // strings and bytes
                op::STRING => {
                    let line = self.read_line()?;
                    let raw = unescape_string_literal(line, at)?;
                    let value = self.legacy_string(&raw, at)?;
                    self.push(value);
                }
                op::BINSTRING => {
                    let n = self.read_len_i32(at)?;
                    let raw = self.read_bytes(n)?;
                    let value = self.legacy_string(raw, at)?;
                    self.push(value);
                }
                op::SHORT_BINSTRING => {
                    let n = usize::from(self.read_u8()?);
                    let raw = self.read_bytes(n)?;
                    let value = self.legacy_string(raw, at)?;
                    self.push(value);
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    self.push(Value::Str(decode_raw_unicode_escape(line, at)?));
                }
                op::BINUNICODE => {
                    let n = self.read_len_u32()?;
                    let s = self.read_utf8(n, at)?;
                    self.push(Value::Str(s));
                }
                op::SHORT_BINUNICODE => {
                    let n = usize::from(self.read_u8()?);
                    let s = self.read_utf8(n, at)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let n = self.read_len_u64(at)?;
                    let s = self.read_utf8(n, at)?;
                    self.push(Value::Str(s));
                }
                op::BINBYTES => {
                    let n = self.read_len_u32()?;
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::SHORT_BINBYTES => {
                    let n = usize::from(self.read_u8()?);
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let n = self.read_len_u64(at)?;
                    let b = self.read_bytes(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }

                // containers
                op::EMPTY_LIST => self.push_container(Value::List(Vec::new()), 0)?,
                op::EMPTY_TUPLE => self.push_container(Value::Tuple(Vec::new()), 0)?,
                op::EMPTY_DICT => self.push_container(Value::Dict(Vec::new()), 0)?,
                op::EMPTY_SET => self.push_container(Value::Set(Vec::new()), 0)?,
                op::LIST => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_container(Value::List(items), depth)?;
                }
                op::TUPLE => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_container(Value::Tuple(items), depth)?;
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = usize::from(opcode - op::TUPLE1 + 1);
                    let floor = self.marks.last().copied().unwrap_or(0);
                    if self.stack.len() < floor + n {
                        return Err(PickleError::StackUnderflow(at));
                    }
                    let (items, depth) = unzip_slots(self.stack.split_off(self.stack.len() - n));
                    self.push_container(Value::Tuple(items), depth)?;
                }
                op::DICT => {
                    let (items, depth) = self.pop_mark()?;
                    let pairs = into_pairs(items, at)?;
                    self.push_container(Value::Dict(pairs), depth)?;
                }
                op::FROZENSET => {
                    let (items, depth) = self.pop_mark()?;
                    self.push_container(Value::Set(items), depth)?;
                }
                op::APPEND => {
                    let item = self.pop()?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::List(items) => items.push(item.value),
                        _ => return Err(PickleError::UnexpectedValue { expected: "list for APPEND", pos: at }),
                    }
                    target.nest(item.depth)?;
                }
                op::APPENDS => {
                    let (new_items, depth) = self.pop_mark()?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::List(items) => items.extend(new_items),
                        _ => return Err(PickleError::UnexpectedValue { expected: "list for APPENDS", pos: at }),
                    }
                    target.nest(depth)?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::Dict(pairs) => pairs.push((key.value, value.value)),
                        _ => return Err(PickleError::UnexpectedValue { expected: "dict for SETITEM", pos: at }),
                    }
                    target.nest(key.depth.max(value.depth))?;
                }
                op::SETITEMS => {
                    let (items, depth) = self.pop_mark()?;
                    let new_pairs = into_pairs(items, at)?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::Dict(pairs) => pairs.extend(new_pairs),
                        _ => return Err(PickleError::UnexpectedValue { expected: "dict for SETITEMS", pos: at }),
                    }
                    target.nest(depth)?;
                }
                op::ADDITEMS => {
                    let (new_items, depth) = self.pop_mark()?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::Set(items) => items.extend(new_items),
                        _ => return Err(PickleError::UnexpectedValue { expected: "set for ADDITEMS", pos: at }),
                    }
                    target.nest(depth)?;
                }

                // objects
                op::GLOBAL => {
                    let module = self.read_line_str()?;
                    let name = self.read_line_str()?;
                    self.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    let (module, name) = match (self.resolve_str(&module.value), self.resolve_str(&name.value)) {
                        (Some(module), Some(name)) => (module, name),
                        _ => return Err(PickleError::UnexpectedValue { expected: "str module and name for STACK_GLOBAL", pos: at }),
                    };
                    self.push(Value::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.push_object(callable, args)?;
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    self.push_object(cls, args)?;
                }
                op::OBJ => {
                    let (mut items, depth) = self.pop_mark()?;
                    if items.is_empty() {
                        return Err(PickleError::StackUnderflow(at));
                    }
                    let cls = Slot { value: items.remove(0), depth };
                    self.push_object(cls, Slot { value: Value::Tuple(items), depth: depth + 1 })?;
                }
                op::INST => {
                    let module = self.read_line_str()?;
                    let name = self.read_line_str()?;
                    let (args, depth) = self.pop_mark()?;
                    let args = Slot { value: Value::Tuple(args), depth: depth + 1 };
                    self.push_object(Slot::leaf(Value::Global { module, name }), args)?;
                }
                op::BUILD => {
                    let new_state = self.pop()?;
                    let target = self.top_target(at)?;
                    match &mut target.value {
                        Value::Object { state, .. } => *state = Some(Box::new(new_state.value)),
                        _ => return Err(PickleError::UnexpectedValue { expected: "object for BUILD", pos: at }),
                    }
                    target.nest(new_state.depth)?;
                }

                // memo
                op::PUT => {
                    let line = self.read_line_str()?;
                    let id = parse_memo_key(&line, at)?;
                    self.memoize(id, at)?;
                }
                op::BINPUT => {
                    let id = u32::from(self.read_u8()?);
                    self.memoize(id, at)?;
                }
                op::LONG_BINPUT => {
                    let id = u32::from_le_bytes(self.read_array()?);
                    self.memoize(id, at)?;
                }
                op::MEMOIZE => {
                    let id = u32::try_from(self.memo.len()).map_err(|_| PickleError::IntegerOverflow(at))?;
                    self.memoize(id, at)?;
                }
                op::GET => {
                    let line = self.read_line_str()?;
                    let id = parse_memo_key(&line, at)?;
                    self.push_memo_ref(id)?;
                }
                op::BINGET => {
                    let id = u32::from(self.read_u8()?);
                    self.push_memo_ref(id)?;
                }
                op::LONG_BINGET => {
                    let id = u32::from_le_bytes(self.read_array()?);
                    self.push_memo_ref(id)?;
                }

                op::PERSID | op::BINPERSID => return Err(PickleError::Unsupported { what: "persistent ids", pos: at }),
                op::EXT1 | op::EXT2 | op::EXT4 => return Err(PickleError::Unsupported { what: "the extension registry", pos: at }),
                op::NEXT_BUFFER | op::READONLY_BUFFER => return Err(PickleError::Unsupported { what: "out-of-band buffers", pos: at }),
                _ => return Err(PickleError::UnsupportedOpcode { opcode, pos: at }),
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        let b = *self.data.get(self.pos).ok_or(PickleError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len()).ok_or(PickleError::UnexpectedEof(self.data.len()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_len_i32(&mut self, at: usize) -> Result<usize, PickleError> {
        let n = i32::from_le_bytes(self.read_array()?);
        usize::try_from(n).map_err(|_| PickleError::BadLiteral { literal: n.to_string(), pos: at })
    }

    fn read_len_u32(&mut self) -> Result<usize, PickleError> {
        Ok(u32::from_le_bytes(self.read_array()?) as usize)
    }

    fn read_len_u64(&mut self, at: usize) -> Result<usize, PickleError> {
        let n = u64::from_le_bytes(self.read_array()?);
        usize::try_from(n).map_err(|_| PickleError::IntegerOverflow(at))
    }

    /// A line without its trailing newline
    fn read_line(&mut self) -> Result<&'a [u8], PickleError> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == b'\n').ok_or(PickleError::UnexpectedEof(self.data.len()))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn read_line_str(&mut self) -> Result<String, PickleError> {
        let at = self.pos;
        let line = self.read_line()?;
        std::str::from_utf8(line).map(str::to_string).map_err(|_| PickleError::InvalidUtf8(at))
    }

    fn read_utf8(&mut self, n: usize, at: usize) -> Result<String, PickleError> {
        let bytes = self.read_bytes(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PickleError::InvalidUtf8(at))
    }

    fn legacy_string(&self, raw: &[u8], at: usize) -> Result<Value, PickleError> {
        match self.encoding {
            StringEncoding::Ascii if raw.is_ascii() => Ok(Value::Str(raw.iter().map(|&b| char::from(b)).collect())),
            StringEncoding::Ascii => Err(PickleError::NonAsciiString(at)),
            StringEncoding::Latin1 => Ok(Value::Str(raw.iter().map(|&b| char::from(b)).collect())),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot::leaf(value));
    }

    /// Pushes a container whose deepest item has ``items_depth``
    fn push_container(&mut self, value: Value, items_depth: usize) -> Result<(), PickleError> {
        let mut slot = Slot::leaf(value);
        slot.nest(items_depth)?;
        self.stack.push(slot);
        Ok(())
    }

    fn pop(&mut self) -> Result<Slot, PickleError> {
        if self.marks.last().is_some_and(|&m| m >= self.stack.len()) {
            return Err(PickleError::StackUnderflow(self.pos));
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(self.pos))
    }

    /// Items above the last mark and the depth of the deepest one
    fn pop_mark(&mut self) -> Result<(Vec<Value>, usize), PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(self.pos))?;
        Ok(unzip_slots(self.stack.split_off(mark)))
    }

    fn push_object(&mut self, callable: Slot, args: Slot) -> Result<(), PickleError> {
        let object = Value::Object {
            callable: Box::new(callable.value),
            args: Box::new(args.value),
            state: None,
        };
        self.push_container(object, callable.depth.max(args.depth))
    }

    /// Moves the top of the stack into the memo and leaves a reference in its
    /// place, so later in-place updates are seen by every reference
    fn memoize(&mut self, id: u32, at: usize) -> Result<(), PickleError> {
        let top = self.stack.last_mut().ok_or(PickleError::StackUnderflow(at))?;
        let slot = std::mem::replace(top, Slot::leaf(Value::MemoRef(id)));
        // a re-put of an already memoized value aliases the same entry
        if slot.value == Value::MemoRef(id) {
            return Ok(());
        }
        self.memo.insert(id, slot);
        Ok(())
    }

    fn push_memo_ref(&mut self, id: u32) -> Result<(), PickleError> {
        if !self.memo.contains_key(&id) {
            return Err(PickleError::MissingMemo(id));
        }
        self.push(Value::MemoRef(id));
        Ok(())
    }

    /// The value at the top of the stack, following memo references, for the
    /// opcodes that mutate it in place
    fn top_target(&mut self, at: usize) -> Result<&mut Slot, PickleError> {
        let memo_id = match self.stack.last().map(|slot| &slot.value) {
            None => return Err(PickleError::StackUnderflow(at)),
            Some(Value::MemoRef(id)) => Some(*id),
            Some(_) => None,
        };
        let Some(mut id) = memo_id else {
            return self.stack.last_mut().ok_or(PickleError::StackUnderflow(at));
        };
        for _ in 0..MAX_DEPTH {
            let next = match self.memo.get(&id).map(|slot| &slot.value) {
                Some(Value::MemoRef(next)) => Some(*next),
                Some(_) => None,
                None => return Err(PickleError::MissingMemo(id)),
            };
            match next {
                Some(next) => id = next,
                None => return self.memo.get_mut(&id).ok_or(PickleError::MissingMemo(id)),
            }
        }
        Err(PickleError::TooDeep)
    }

    fn resolve_str<'b>(&'b self, mut value: &'b Value) -> Option<String> {
        for _ in 0..MAX_DEPTH {
            match value {
                Value::Str(s) => return Some(s.clone()),
                Value::MemoRef(id) => value = &self.memo.get(id)?.value,
                _ => return None,
            }
        }
        None
    }
}

fn unzip_slots(slots: Vec<Slot>) -> (Vec<Value>, usize) {
    let depth = slots.iter().map(|slot| slot.depth).max().unwrap_or(0);
    (slots.into_iter().map(|slot| slot.value).collect(), depth)
}

fn into_pairs(items: Vec<Value>, at: usize) -> Result<Vec<(Value, Value)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::UnexpectedValue { expected: "an even number of dict items", pos: at });
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(pairs)
}

fn parse_int_literal(literal: &str, at: usize) -> Result<i64, PickleError> {
    let trimmed = literal.trim();
    trimmed.parse::<i64>().map_err(|e| match e.kind() {
        std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => PickleError::IntegerOverflow(at),
        _ => PickleError::BadLiteral { literal: trimmed.to_string(), pos: at },
    })
}

fn parse_memo_key(literal: &str, at: usize) -> Result<u32, PickleError> {
    literal
        .trim()
        .parse::<u32>()
        .map_err(|_| PickleError::BadLiteral { literal: literal.to_string(), pos: at })
}

/// Little-endian two's complement integer of arbitrary length
fn decode_long(bytes: &[u8], at: usize) -> Result<i64, PickleError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        // wider encodings are fine as long as the extra bytes are pure sign extension
        let sign = if bytes[7] & 0x80 == 0 { 0x00 } else { 0xff };
        if bytes[8..].iter().any(|&b| b != sign) {
            return Err(PickleError::IntegerOverflow(at));
        }
        return decode_long(&bytes[..8], at);
    }
    let fill = if bytes[bytes.len() - 1] & 0x80 == 0 { 0x00 } else { 0xff };
    let mut buf = [fill; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

/// Decodes the quoted, escaped payload of a protocol 0 ``STRING`` opcode
fn unescape_string_literal(line: &[u8], at: usize) -> Result<Vec<u8>, PickleError> {
    let bad = || PickleError::BadLiteral {
        literal: String::from_utf8_lossy(line).into_owned(),
        pos: at,
    };
    let quote = *line.first().ok_or_else(bad)?;
    if line.len() < 2 || !(quote == b'\'' || quote == b'"') || line[line.len() - 1] != quote {
        return Err(bad());
    }
    let body = &line[1..line.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let esc = *body.get(i).ok_or_else(bad)?;
        i += 1;
        match esc {
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hex = body.get(i..i + 2).ok_or_else(bad)?;
                let s = std::str::from_utf8(hex).map_err(|_| bad())?;
                out.push(u8::from_str_radix(s, 16).map_err(|_| bad())?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                for _ in 0..2 {
                    match body.get(i) {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                out.push(u8::try_from(value & 0xff).map_err(|_| bad())?);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// ``raw-unicode-escape``: bytes map to code points, except ``\uXXXX`` and
/// ``\UXXXXXXXX``
fn decode_raw_unicode_escape(line: &[u8], at: usize) -> Result<String, PickleError> {
    let bad = || PickleError::BadLiteral {
        literal: String::from_utf8_lossy(line).into_owned(),
        pos: at,
    };
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 {
            out.push(char::from(b));
            i += 1;
            continue;
        }
        let hex = line.get(i + 2..i + 2 + width).ok_or_else(bad)?;
        let s = std::str::from_utf8(hex).map_err(|_| bad())?;
        let code = u32::from_str_radix(s, 16).map_err(|_| bad())?;
        out.push(char::from_u32(code).ok_or_else(bad)?);
        i += 2 + width;
    }
    Ok(out)
}

/// Replaces memo references with the values they point to and folds the few
/// builtins that only rebuild plain data. Every node and every byte of string
/// data it produces is charged to a budget, so memo entries referencing each
/// other many times over cannot blow up.
struct Resolver<'m> {
    memo: &'m HashMap<u32, Slot>,
    limit: usize,
    budget: usize,
}

impl<'m> Resolver<'m> {
    fn new(memo: &'m HashMap<u32, Slot>, limit: usize) -> Self {
        Self { memo, limit, budget: limit }
    }

    fn charge(&mut self, cost: usize) -> Result<(), PickleError> {
        self.budget = self.budget.checked_sub(cost).ok_or(PickleError::TooLarge(self.limit))?;
        Ok(())
    }

    fn resolve_all(&mut self, items: &[Value], depth: usize) -> Result<Vec<Value>, PickleError> {
        items.iter().map(|v| self.resolve(v, depth)).collect()
    }

    fn resolve(&mut self, value: &Value, depth: usize) -> Result<Value, PickleError> {
        if depth > MAX_DEPTH {
            return Err(PickleError::TooDeep);
        }
        let next = depth + 1;
        let cost = match value {
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
            _ => 0,
        };
        self.charge(cost + 1)?;
        Ok(match value {
            Value::MemoRef(id) => {
                let memo = self.memo;
                let inner = memo.get(id).ok_or(PickleError::MissingMemo(*id))?;
                self.resolve(&inner.value, next)?
            }
            Value::List(items) => Value::List(self.resolve_all(items, next)?),
            Value::Tuple(items) => Value::Tuple(self.resolve_all(items, next)?),
            Value::Set(items) => Value::Set(self.resolve_all(items, next)?),
            Value::Dict(pairs) => Value::Dict(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((self.resolve(k, next)?, self.resolve(v, next)?)))
                    .collect::<Result<Vec<_>, PickleError>>()?,
            ),
            Value::Object { callable, args, state } => {
                let callable = self.resolve(callable, next)?;
                let args = self.resolve(args, next)?;
                let state = state.as_deref().map(|s| self.resolve(s, next)).transpose()?;
                fold_builtin(callable, args, state)
            }
            other => other.clone(),
        })
    }
}

fn fold_builtin(callable: Value, args: Value, state: Option<Value>) -> Value {
    if state.is_none() {
        if let Value::Tuple(items) = &args {
            // protocol 2 stores bytes as _codecs.encode(text, "latin1")
            if callable.is_global("_codecs", "encode") {
                if let [Value::Str(text), Value::Str(enc)] = items.as_slice() {
                    let is_latin1 = matches!(enc.to_ascii_lowercase().as_str(), "latin1" | "latin-1" | "iso-8859-1");
                    if is_latin1 {
                        if let Ok(bytes) = text.chars().map(|c| u8::try_from(u32::from(c))).collect::<Result<Vec<u8>, _>>() {
                            return Value::Bytes(bytes);
                        }
                    }
                }
            }
            let is_builtin = |name: &str| ["builtins", "__builtin__"].iter().any(|m| callable.is_global(m, name));
            if is_builtin("bytes") && items.is_empty() {
                return Value::Bytes(Vec::new());
            }
            if is_builtin("set") || is_builtin("frozenset") {
                match items.as_slice() {
                    [] => return Value::Set(Vec::new()),
                    [Value::List(elems)] => return Value::Set(elems.clone()),
                    _ => {}
                }
            }
        }
    }
    Value::Object {
        callable: Box::new(callable),
        args: Box::new(args),
        state: state.map(Box::new),
    }
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;

    fn dict_get<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
        match value {
            Value::Dict(pairs) => pairs.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v),
            _ => None,
        }
    }

    #[test]
    fn protocol0_dict() {
        // pickle.dumps({'a': 1, 'b': [1.5, 'x']}, 0) as written by Python 3
        let data = b"(dp0\nVa\np1\nI1\nsVb\np2\n(lp3\nF1.5\naVx\np4\nas.";
        let value = loads(data, StringEncoding::Ascii).unwrap();
        assert_eq!(dict_get(&value, "a"), Some(&Value::Int(1)));
        assert_eq!(
            dict_get(&value, "b"),
            Some(&Value::List(vec![Value::Float(1.5), Value::Str("x".to_string())]))
        );
    }

    #[test]
    fn memo_sees_later_mutation() {
        // a list is memoized while empty, filled afterwards and then fetched
        // again through BINGET: l = [7]; {'x': l, 'y': l}
        let data = [
            op::PROTO, 2, op::EMPTY_DICT, op::MARK,
            op::SHORT_BINUNICODE, 1, b'x', op::EMPTY_LIST, op::BINPUT, 0, op::BININT1, 7, op::APPEND,
            op::SHORT_BINUNICODE, 1, b'y', op::BINGET, 0,
            op::SETITEMS, op::STOP,
        ];
        let value = loads(&data, StringEncoding::Ascii).unwrap();
        let expected = Value::List(vec![Value::Int(7)]);
        assert_eq!(dict_get(&value, "x"), Some(&expected));
        assert_eq!(dict_get(&value, "y"), Some(&expected));
    }

    #[test]
    fn build_through_memo_reference() {
        // the object is memoized before its state is applied
        let data = [
            op::PROTO, 2,
            op::GLOBAL, b'm', b'\n', b'C', b'\n', op::EMPTY_TUPLE, op::REDUCE, op::BINPUT, 3,
            op::BININT1, 5, op::BUILD,
            op::POP, op::BINGET, 3, op::STOP,
        ];
        let value = loads(&data, StringEncoding::Ascii).unwrap();
        match value {
            Value::Object { callable, state, .. } => {
                assert!(callable.is_global("m", "C"));
                assert_eq!(state.as_deref(), Some(&Value::Int(5)));
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn legacy_strings_need_latin1_when_not_ascii() {
        let data = [op::PROTO, 2, op::SHORT_BINSTRING, 2, 0xe9, b'a', op::STOP];
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::NonAsciiString(_))));
        assert_eq!(loads(&data, StringEncoding::Latin1).unwrap(), Value::Str("\u{e9}a".to_string()));
    }

    #[test]
    fn protocol0_escaped_string() {
        let data = b"S'a\\x00\\'b\\n'\np0\n.";
        let value = loads(data, StringEncoding::Latin1).unwrap();
        assert_eq!(value, Value::Str("a\u{0}'b\n".to_string()));
    }

    #[test]
    fn long_integers() {
        let data = [op::LONG1, 2, 0x00, 0x80, op::STOP];
        assert_eq!(loads(&data, StringEncoding::Ascii).unwrap(), Value::Int(-32768));
        let data = [op::LONG1, 9, 1, 0, 0, 0, 0, 0, 0, 0, 0, op::STOP];
        assert_eq!(loads(&data, StringEncoding::Ascii).unwrap(), Value::Int(1));
        let data = [op::LONG1, 9, 0, 0, 0, 0, 0, 0, 0, 0, 1, op::STOP];
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::IntegerOverflow(_))));
        let data = b"L-12L\n.";
        assert_eq!(loads(data, StringEncoding::Ascii).unwrap(), Value::Int(-12));
    }

    #[test]
    fn codecs_encode_becomes_bytes() {
        let data = [
            op::PROTO, 2,
            op::GLOBAL, b'_', b'c', b'o', b'd', b'e', b'c', b's', b'\n', b'e', b'n', b'c', b'o', b'd', b'e', b'\n',
            op::SHORT_BINUNICODE, 3, 0xc3, 0xbf, b'A',
            op::SHORT_BINUNICODE, 6, b'l', b'a', b't', b'i', b'n', b'1',
            op::TUPLE2, op::REDUCE, op::STOP,
        ];
        assert_eq!(loads(&data, StringEncoding::Ascii).unwrap(), Value::Bytes(vec![0xff, b'A']));
    }

    #[test]
    fn builtin_set() {
        let data = [
            op::PROTO, 2,
            op::GLOBAL, b'_', b'_', b'b', b'u', b'i', b'l', b't', b'i', b'n', b'_', b'_', b'\n', b's', b'e', b't', b'\n',
            op::EMPTY_LIST, op::BININT1, 1, op::APPEND, op::TUPLE1, op::REDUCE, op::STOP,
        ];
        assert_eq!(loads(&data, StringEncoding::Ascii).unwrap(), Value::Set(vec![Value::Int(1)]));
    }

    #[test]
    fn deep_nesting_fails_while_decoding() {
        // [[[...]]] 200000 levels deep
        let depth = 200_000;
        let mut data = vec![op::EMPTY_LIST; depth];
        data.extend(std::iter::repeat(op::APPEND).take(depth - 1));
        data.push(op::STOP);
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::TooDeep)));

        let mut data = vec![op::EMPTY_LIST; 100];
        data.extend(std::iter::repeat(op::APPEND).take(99));
        data.push(op::STOP);
        assert!(loads(&data, StringEncoding::Ascii).is_ok());
    }

    #[test]
    fn deep_tuples_fail_while_decoding() {
        let mut data = vec![op::NONE];
        data.extend(std::iter::repeat(op::TUPLE1).take(100_000));
        data.push(op::STOP);
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::TooDeep)));
    }

    #[test]
    fn self_referencing_list() {
        // l = []; l.append(l)
        let data = [op::EMPTY_LIST, op::BINPUT, 0, op::BINGET, 0, op::APPEND, op::STOP];
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::TooDeep)));
    }

    #[test]
    fn shared_memo_entries_cannot_explode() {
        // l0 = []; l1 = [l0, l0]; l2 = [l1, l1]; ... which expands to 2**40 lists
        let mut data = vec![op::PROTO, 2, op::EMPTY_LIST, op::BINPUT, 0];
        for id in 1..=40u8 {
            data.extend([op::EMPTY_LIST, op::MARK, op::BINGET, id - 1, op::BINGET, id - 1, op::APPENDS, op::BINPUT, id]);
        }
        data.push(op::STOP);
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::TooLarge(_))));
    }

    #[test]
    fn shared_memo_entries_within_budget() {
        // l0 = [1]; {'a': l0, 'b': l0}
        let data = [
            op::PROTO, 2, op::EMPTY_DICT, op::MARK,
            op::SHORT_BINUNICODE, 1, b'a', op::EMPTY_LIST, op::BINPUT, 0, op::BININT1, 1, op::APPEND,
            op::SHORT_BINUNICODE, 1, b'b', op::BINGET, 0,
            op::SETITEMS, op::STOP,
        ];
        let value = loads(&data, StringEncoding::Ascii).unwrap();
        assert_eq!(dict_get(&value, "a"), dict_get(&value, "b"));
    }

    #[test]
    fn memo_alias_cycle() {
        // memo 0 and 1 end up pointing at each other
        let data = [
            op::PROTO, 4,
            op::SHORT_BINUNICODE, 1, b'm', op::BINPUT, 0, op::BINPUT, 1, op::BINPUT, 0,
            op::DUP, op::STACK_GLOBAL, op::STOP,
        ];
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::UnexpectedValue { .. })));
    }

    #[test]
    fn tuple_cannot_reach_below_mark() {
        let data = [op::NONE, op::MARK, op::TUPLE1, op::STOP];
        assert!(matches!(loads(&data, StringEncoding::Ascii), Err(PickleError::StackUnderflow(_))));
    }

    #[test]
    fn truncated_and_unknown() {
        assert!(matches!(loads(&[op::PROTO, 2, op::BININT], StringEncoding::Ascii), Err(PickleError::UnexpectedEof(_))));
        assert!(matches!(loads(&[0xff], StringEncoding::Ascii), Err(PickleError::UnsupportedOpcode { opcode: 0xff, .. })));
        assert!(matches!(loads(&[op::PROTO, 9], StringEncoding::Ascii), Err(PickleError::UnsupportedProtocol(9))));
        assert!(matches!(loads(b"Pfoo\n.", StringEncoding::Ascii), Err(PickleError::Unsupported { .. })));
        assert!(matches!(loads(&[op::STOP], StringEncoding::Ascii), Err(PickleError::StackUnderflow(_))));
    }
}
