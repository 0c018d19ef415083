//! HPACK header compression (RFC 7541), as used for HTTP/2 header blocks.
//!
//! The [`Decoder`] consumes header block fragments and appends decoded
//! fields to a reusable list; the [`Encoder`] emits block bytes for a
//! header list. Each is owned by a single stream's reader or writer and
//! carries no locking.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::OnceLock;

use bytes::Bytes;
use log::debug;

mod huffman;

/// A decoded header field: a name and a value.
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    /// The field name, lowercase for received blocks.
    pub name: Bytes,
    /// The field value.
    pub value: Bytes,
}

impl Header {
    /// Creates a header field.
    pub fn new<N: Into<Bytes>, V: Into<Bytes>>(name: N, value: V) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The table size of this entry: name length plus value length plus a
    /// fixed 32-byte overhead (RFC 7541 §4.1).
    pub fn hpack_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// The static table of RFC 7541 Appendix A, indices 1 through 61.
const STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// First static-table index for each distinct name, 0-based.
fn name_to_first_index() -> &'static HashMap<&'static [u8], usize> {
    static MAP: OnceLock<HashMap<&'static [u8], usize>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut map = HashMap::with_capacity(STATIC_TABLE.len());
        for (i, &(name, _)) in STATIC_TABLE.iter().enumerate() {
            map.entry(name).or_insert(i);
        }
        map
    })
}

const PREFIX_4_BITS: u8 = 0x0f;
const PREFIX_5_BITS: u8 = 0x1f;
const PREFIX_6_BITS: u8 = 0x3f;
const PREFIX_7_BITS: u8 = 0x7f;

/// Decodes HPACK header blocks.
///
/// The dynamic table is kept as a deque with the newest entry at index
/// zero, matching the index order the wire format addresses entries in.
pub struct Decoder {
    header_list: Vec<Header>,
    dynamic_table: VecDeque<Header>,
    dynamic_table_byte_count: usize,
    /// Effective limit, lowered and raised by size-update instructions.
    max_dynamic_table_byte_count: usize,
    /// Upper bound from the connection's settings; size updates above
    /// this are a protocol error.
    settings_max_dynamic_table_byte_count: usize,
}

impl Decoder {
    /// Creates a decoder whose dynamic table may grow to `settings_max`
    /// bytes.
    pub fn new(settings_max: usize) -> Decoder {
        Decoder {
            header_list: Vec::new(),
            dynamic_table: VecDeque::new(),
            dynamic_table_byte_count: 0,
            max_dynamic_table_byte_count: settings_max,
            settings_max_dynamic_table_byte_count: settings_max,
        }
    }

    /// Decodes one header block fragment, appending fields to the
    /// reusable header list.
    pub fn read(&mut self, source: &[u8]) -> crate::Result<()> {
        let mut buf = Buf { src: source, pos: 0 };
        while !buf.is_empty() {
            let b = buf.read_byte()?;
            if b & 0x80 == 0x80 {
                // 1xxxxxxx: indexed header field.
                let index = buf.read_int(b, PREFIX_7_BITS)?;
                if index == 0 {
                    return Err(protocol_error("index == 0"));
                }
                self.read_indexed_header(index - 1)?;
            } else if b == 0x40 {
                // 01000000: literal with incremental indexing, new name.
                let name = self.read_name(&mut buf)?;
                let value = buf.read_byte_string()?;
                self.insert_into_dynamic_table(Header { name, value });
            } else if b & 0x40 == 0x40 {
                // 01xxxxxx: literal with incremental indexing, indexed name.
                let index = buf.read_int(b, PREFIX_6_BITS)?;
                let name = self.header_name(index - 1)?;
                let value = buf.read_byte_string()?;
                self.insert_into_dynamic_table(Header { name, value });
            } else if b & 0x20 == 0x20 {
                // 001xxxxx: dynamic table size update.
                let new_max = buf.read_int(b, PREFIX_5_BITS)?;
                if new_max > self.settings_max_dynamic_table_byte_count {
                    return Err(protocol_error(format!(
                        "invalid dynamic table size update: {}",
                        new_max
                    )));
                }
                debug!("dynamic table size update: {}", new_max);
                self.max_dynamic_table_byte_count = new_max;
                self.evict_to_fit(0);
            } else if b == 0x10 || b == 0 {
                // 00010000 | 00000000: literal without (or never) indexing,
                // new name.
                let name = self.read_name(&mut buf)?;
                let value = buf.read_byte_string()?;
                self.header_list.push(Header { name, value });
            } else {
                // 000xxxxx: literal without (or never) indexing, indexed
                // name.
                let index = buf.read_int(b, PREFIX_4_BITS)?;
                let name = self.header_name(index - 1)?;
                let value = buf.read_byte_string()?;
                self.header_list.push(Header { name, value });
            }
        }
        Ok(())
    }

    /// Returns the decoded fields and clears the reusable list.
    pub fn get_and_reset_header_list(&mut self) -> Vec<Header> {
        std::mem::take(&mut self.header_list)
    }

    /// Total byte size of the dynamic table's entries.
    pub fn dynamic_table_byte_count(&self) -> usize {
        self.dynamic_table_byte_count
    }

    /// Number of entries in the dynamic table.
    pub fn dynamic_table_len(&self) -> usize {
        self.dynamic_table.len()
    }

    fn read_indexed_header(&mut self, index: usize) -> crate::Result<()> {
        if index < STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index];
            self.header_list.push(Header::new(name, value));
            return Ok(());
        }
        match self.dynamic_table.get(index - STATIC_TABLE.len()) {
            Some(entry) => {
                self.header_list.push(entry.clone());
                Ok(())
            }
            None => Err(protocol_error(format!("header index too large: {}", index + 1))),
        }
    }

    fn header_name(&self, index: usize) -> crate::Result<Bytes> {
        if index < STATIC_TABLE.len() {
            return Ok(Bytes::from_static(STATIC_TABLE[index].0));
        }
        match self.dynamic_table.get(index - STATIC_TABLE.len()) {
            Some(entry) => Ok(entry.name.clone()),
            None => Err(protocol_error(format!("header index too large: {}", index + 1))),
        }
    }

    fn read_name(&self, buf: &mut Buf<'_>) -> crate::Result<Bytes> {
        let name = buf.read_byte_string()?;
        if name.iter().any(u8::is_ascii_uppercase) {
            return Err(protocol_error(format!(
                "mixed case name: {}",
                String::from_utf8_lossy(&name)
            )));
        }
        Ok(name)
    }

    /// Inserts a decoded entry, appending it to the header list too.
    fn insert_into_dynamic_table(&mut self, header: Header) {
        self.header_list.push(header.clone());
        let size = header.hpack_size();
        if size > self.max_dynamic_table_byte_count {
            // The entry alone exceeds the table: clear everything and
            // drop the entry (RFC 7541 §4.4).
            self.dynamic_table.clear();
            self.dynamic_table_byte_count = 0;
            return;
        }
        self.evict_to_fit(size);
        self.dynamic_table_byte_count += size;
        self.dynamic_table.push_front(header);
    }

    /// Evicts oldest entries until `incoming` more bytes fit.
    fn evict_to_fit(&mut self, incoming: usize) {
        while self.dynamic_table_byte_count + incoming > self.max_dynamic_table_byte_count {
            match self.dynamic_table.pop_back() {
                Some(evicted) => self.dynamic_table_byte_count -= evicted.hpack_size(),
                None => return,
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("hpack::Decoder")
            .field("dynamic_table_len", &self.dynamic_table.len())
            .field("dynamic_table_byte_count", &self.dynamic_table_byte_count)
            .field("max", &self.max_dynamic_table_byte_count)
            .finish()
    }
}

struct Buf<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Buf<'_> {
    fn is_empty(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn read_byte(&mut self) -> crate::Result<u8> {
        match self.src.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(protocol_error("truncated header block")),
        }
    }

    /// Reads an integer whose low bits start in `first_byte` under
    /// `prefix_mask`, continuing into 7-bit groups as needed.
    fn read_int(&mut self, first_byte: u8, prefix_mask: u8) -> crate::Result<usize> {
        let prefix = (first_byte & prefix_mask) as usize;
        if prefix < prefix_mask as usize {
            return Ok(prefix);
        }

        let mut result = prefix_mask as usize;
        let mut shift = 0u32;
        loop {
            let b = self.read_byte()?;
            if shift > 28 {
                return Err(protocol_error("integer representation too long"));
            }
            result += ((b & 0x7f) as usize) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Reads a length-prefixed string, Huffman-decoding when flagged.
    fn read_byte_string(&mut self) -> crate::Result<Bytes> {
        let first_byte = self.read_byte()?;
        let huffman = first_byte & 0x80 == 0x80;
        let length = self.read_int(first_byte, PREFIX_7_BITS)?;

        if self.pos + length > self.src.len() {
            return Err(protocol_error("truncated string literal"));
        }
        let raw = &self.src[self.pos..self.pos + length];
        self.pos += length;

        if huffman {
            match huffman::decode(raw) {
                Ok(decoded) => Ok(Bytes::from(decoded)),
                Err(_) => Err(protocol_error("invalid huffman sequence")),
            }
        } else {
            Ok(Bytes::copy_from_slice(raw))
        }
    }
}

/// Encodes header lists into HPACK blocks.
///
/// Names matching a static-table entry are written with an indexed name;
/// everything else is a literal without indexing. Values are never
/// Huffman-coded and the dynamic table is never populated, so blocks are
/// stateless and safe to interleave with any peer table size.
#[derive(Debug, Default)]
pub struct Encoder {
    _priv: (),
}

impl Encoder {
    /// Creates an encoder.
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Appends the block bytes for `headers` to `out`.
    pub fn write_headers(&mut self, headers: &[Header], out: &mut Vec<u8>) {
        for header in headers {
            let name = lowercase(&header.name);
            match name_to_first_index().get(name.as_ref()) {
                Some(&index) => {
                    // Literal without indexing, indexed name.
                    write_int(out, index + 1, PREFIX_4_BITS, 0x00);
                    write_byte_string(out, &header.value);
                }
                None => {
                    // Literal without indexing, new name.
                    out.push(0x00);
                    write_byte_string(out, &name);
                    write_byte_string(out, &header.value);
                }
            }
        }
    }
}

fn lowercase(name: &Bytes) -> Bytes {
    if name.iter().any(u8::is_ascii_uppercase) {
        Bytes::from(name.to_ascii_lowercase())
    } else {
        name.clone()
    }
}

fn write_int(out: &mut Vec<u8>, mut value: usize, prefix_mask: u8, bits: u8) {
    if value < prefix_mask as usize {
        out.push(bits | value as u8);
        return;
    }
    out.push(bits | prefix_mask);
    value -= prefix_mask as usize;
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn write_byte_string(out: &mut Vec<u8>, data: &[u8]) {
    write_int(out, data.len(), PREFIX_7_BITS, 0x00);
    out.extend_from_slice(data);
}

fn protocol_error<M: Into<String>>(message: M) -> crate::Error {
    crate::Error::new_protocol(io::Error::new(io::ErrorKind::InvalidData, message.into()))
}
