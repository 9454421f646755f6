use super::pickle::op;

const PROTOCOL: u8 = 3;

/// Emits pickle opcodes into a byte buffer. Only the subset needed to write
/// dicts of numpy arrays is covered and nothing is memoized.
pub struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    /// Starts a protocol 3 stream, readable by any Python 3
    pub fn new() -> Self {
        Self {
            buf: vec![op::PROTO, PROTOCOL],
        }
    }
    /// Terminates the stream and hands back the bytes
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(op::STOP);
        self.buf
    }

    pub fn mark(&mut self) {
        self.buf.push(op::MARK);
    }
    pub fn empty_dict(&mut self) {
        self.buf.push(op::EMPTY_DICT);
    }
    /// Adds the key/value pairs pushed since the last mark to the dict below it
    pub fn set_items(&mut self) {
        self.buf.push(op::SETITEMS);
    }
    pub fn none(&mut self) {
        self.buf.push(op::NONE);
    }
    pub fn bool(&mut self, value: bool) {
        self.buf.push(if value { op::NEWTRUE } else { op::NEWFALSE });
    }
    /// Smallest integer encoding, like CPython's ``save_long``
    pub fn int(&mut self, value: i64) {
        if let Ok(small) = u8::try_from(value) {
            self.buf.extend([op::BININT1, small]);
        } else if let Ok(medium) = u16::try_from(value) {
            self.buf.push(op::BININT2);
            self.buf.extend(medium.to_le_bytes());
        } else if let Ok(word) = i32::try_from(value) {
            self.buf.push(op::BININT);
            self.buf.extend(word.to_le_bytes());
        } else {
            self.buf.extend([op::LONG1, 8]);
            self.buf.extend(value.to_le_bytes());
        }
    }
    pub fn unicode(&mut self, text: &str) {
        self.buf.push(op::BINUNICODE);
        self.push_len(text.len());
        self.buf.extend(text.as_bytes());
    }
    pub fn bytes(&mut self, data: &[u8]) {
        if let Ok(short) = u8::try_from(data.len()) {
            self.buf.extend([op::SHORT_BINBYTES, short]);
        } else {
            self.buf.push(op::BINBYTES);
            self.push_len(data.len());
        }
        self.buf.extend(data);
    }
    pub fn global(&mut self, module: &str, name: &str) {
        self.buf.push(op::GLOBAL);
        self.buf.extend(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend(name.as_bytes());
        self.buf.push(b'\n');
    }
    /// Packs the top ``len`` items (0 to 3) into a tuple
    pub fn tuple(&mut self, len: usize) {
        match len {
            0 => self.buf.push(op::EMPTY_TUPLE),
            1 => self.buf.push(op::TUPLE1),
            2 => self.buf.push(op::TUPLE2),
            _ => self.buf.push(op::TUPLE3),
        }
    }
    /// Packs everything since the last mark into a tuple
    pub fn tuple_from_mark(&mut self) {
        self.buf.push(op::TUPLE);
    }
    pub fn reduce(&mut self) {
        self.buf.push(op::REDUCE);
    }
    pub fn build(&mut self) {
        self.buf.push(op::BUILD);
    }

    fn push_len(&mut self, len: usize) {
        // payloads here are a few kilobytes at most
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        self.buf.extend(len.to_le_bytes());
    }
}

impl Default for PickleWriter {
    fn default() -> Self {
        Self::new()
    }
}
