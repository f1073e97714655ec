//! Lua 5.1 binary chunk serialization (dump) and deserialization (undump).
//!
//! The layout matches the reference loader byte for byte: 12-byte header,
//! then one recursive function block. All integers are little-endian; the
//! header's endianness byte says so.

use crate::opcode::Instruction;
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};
use lunac_core::string::{StringId, StringInterner};

// Lua 5.1 binary header constants
const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x51;
const LUAC_FORMAT: u8 = 0;
const LUAC_LITTLE_ENDIAN: u8 = 1;
const INT_SIZE: u8 = 4;
const INSTRUCTION_SIZE: u8 = 4;
const NUMBER_SIZE: u8 = 8;
const NUMBER_IS_INTEGRAL: u8 = 0;

// Constant type tags
const LUA_TNIL: u8 = 0;
const LUA_TBOOLEAN: u8 = 1;
const LUA_TNUMBER: u8 = 3;
const LUA_TSTRING: u8 = 4;

// is_vararg flag (VARARG_ISVARARG)
const VARARG_FLAG: u8 = 2;

/// Emitter options.
///
/// `size_t_width` is the width of string-length fields. The reference
/// implementation uses the host's `size_t`; 4 is the portable default,
/// 8 matches 64-bit builds of the reference loader.
#[derive(Clone, Copy, Debug)]
pub struct DumpConfig {
    pub size_t_width: u8,
    /// Drop debug information (line table, locals, upvalue names).
    pub strip: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            size_t_width: 4,
            strip: false,
        }
    }
}

// ─── Dumper ─────────────────────────────────────────────────────────────

/// Serialize a prototype tree into a Lua 5.1 binary chunk.
pub fn dump(proto: &Proto, strings: &StringInterner) -> Vec<u8> {
    dump_with(proto, strings, &DumpConfig::default())
}

/// Serialize with explicit options.
pub fn dump_with(proto: &Proto, strings: &StringInterner, config: &DumpConfig) -> Vec<u8> {
    let mut out = Vec::new();
    write_header(&mut out, config);
    write_function(&mut out, proto, strings, config, true);
    out
}

fn write_header(out: &mut Vec<u8>, config: &DumpConfig) {
    out.extend_from_slice(LUA_SIGNATURE);
    out.push(LUAC_VERSION);
    out.push(LUAC_FORMAT);
    out.push(LUAC_LITTLE_ENDIAN);
    out.push(INT_SIZE);
    out.push(config.size_t_width);
    out.push(INSTRUCTION_SIZE);
    out.push(NUMBER_SIZE);
    out.push(NUMBER_IS_INTEGRAL);
}

fn write_int(out: &mut Vec<u8>, n: i32) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn write_size(out: &mut Vec<u8>, n: u64, config: &DumpConfig) {
    if config.size_t_width == 8 {
        out.extend_from_slice(&n.to_le_bytes());
    } else {
        out.extend_from_slice(&(n as u32).to_le_bytes());
    }
}

/// Strings carry a length that includes a trailing NUL, then the bytes,
/// then the NUL. An absent string is length 0 with no bytes.
fn write_string(out: &mut Vec<u8>, s: Option<&[u8]>, config: &DumpConfig) {
    match s {
        None => write_size(out, 0, config),
        Some(bytes) => {
            write_size(out, bytes.len() as u64 + 1, config);
            out.extend_from_slice(bytes);
            out.push(0);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    proto: &Proto,
    strings: &StringInterner,
    config: &DumpConfig,
    is_root: bool,
) {
    // Source name: only the root carries one; children inherit it.
    if is_root && !config.strip {
        write_string(out, proto.source.map(|sid| strings.get(sid)), config);
    } else {
        write_string(out, None, config);
    }

    write_int(out, proto.line_defined as i32);
    write_int(out, proto.last_line_defined as i32);

    out.push(proto.upvalues.len() as u8);
    out.push(proto.num_params);
    out.push(if proto.is_vararg { VARARG_FLAG } else { 0 });
    out.push(proto.max_stack_size);

    // Code
    write_int(out, proto.code.len() as i32);
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    // Constants
    write_int(out, proto.constants.len() as i32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(LUA_TNIL),
            Constant::Boolean(b) => {
                out.push(LUA_TBOOLEAN);
                out.push(*b as u8);
            }
            Constant::Number(n) => {
                out.push(LUA_TNUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Str(sid) => {
                out.push(LUA_TSTRING);
                write_string(out, Some(strings.get(*sid)), config);
            }
        }
    }

    // Nested prototypes
    write_int(out, proto.protos.len() as i32);
    for child in &proto.protos {
        write_function(out, child, strings, config, false);
    }

    // Debug info
    if config.strip {
        write_int(out, 0); // line info
        write_int(out, 0); // locals
        write_int(out, 0); // upvalue names
    } else {
        write_int(out, proto.lines.len() as i32);
        for &line in &proto.lines {
            write_int(out, line as i32);
        }

        write_int(out, proto.local_vars.len() as i32);
        for lv in &proto.local_vars {
            write_string(out, Some(strings.get(lv.name)), config);
            write_int(out, lv.start_pc as i32);
            write_int(out, lv.end_pc as i32);
        }

        write_int(out, proto.upvalues.len() as i32);
        for uv in &proto.upvalues {
            write_string(out, Some(strings.get(uv.name)), config);
        }
    }
}

// ─── Undumper ───────────────────────────────────────────────────────────

/// Error type for malformed binary chunks.
#[derive(Clone, Debug)]
pub struct ChunkError {
    pub message: String,
}

impl std::fmt::Display for ChunkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ChunkError {}

fn chunk_error(msg: impl Into<String>) -> ChunkError {
    ChunkError {
        message: msg.into(),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    size_t_width: u8,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader {
            data,
            pos: 0,
            size_t_width: 4,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Validate a count field against the bytes actually left, so a
    /// hostile chunk cannot demand absurd allocations.
    fn read_count(&mut self, elem_size: usize) -> Result<usize, ChunkError> {
        let n = self.read_int()?;
        if n < 0 || (n as usize).saturating_mul(elem_size) > self.remaining() {
            return Err(chunk_error("truncated binary chunk"));
        }
        Ok(n as usize)
    }

    fn read_byte(&mut self) -> Result<u8, ChunkError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| chunk_error("truncated binary chunk"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + n > self.data.len() {
            return Err(chunk_error("truncated binary chunk"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, ChunkError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_int(&mut self) -> Result<i32, ChunkError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_f64(&mut self) -> Result<f64, ChunkError> {
        let b = self.read_bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_size(&mut self) -> Result<u64, ChunkError> {
        if self.size_t_width == 8 {
            let b = self.read_bytes(8)?;
            Ok(u64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ]))
        } else {
            Ok(self.read_u32()? as u64)
        }
    }

    fn read_string(
        &mut self,
        strings: &mut StringInterner,
    ) -> Result<Option<StringId>, ChunkError> {
        let size = self.read_size()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(size as usize)?;
        // Drop the trailing NUL
        Ok(Some(strings.intern(&bytes[..bytes.len() - 1])))
    }
}

/// Deserialize a Lua 5.1 binary chunk into a prototype tree.
pub fn undump(data: &[u8], strings: &mut StringInterner) -> Result<Proto, ChunkError> {
    let mut reader = Reader::new(data);
    verify_header(&mut reader)?;
    read_function(&mut reader, strings)
}

fn verify_header(reader: &mut Reader) -> Result<(), ChunkError> {
    if reader.read_bytes(4)? != LUA_SIGNATURE {
        return Err(chunk_error("not a binary chunk"));
    }
    if reader.read_byte()? != LUAC_VERSION {
        return Err(chunk_error("version mismatch"));
    }
    if reader.read_byte()? != LUAC_FORMAT {
        return Err(chunk_error("format mismatch"));
    }
    if reader.read_byte()? != LUAC_LITTLE_ENDIAN {
        return Err(chunk_error("endianness mismatch"));
    }
    if reader.read_byte()? != INT_SIZE {
        return Err(chunk_error("int size mismatch"));
    }
    let size_t = reader.read_byte()?;
    if size_t != 4 && size_t != 8 {
        return Err(chunk_error("unsupported size_t width"));
    }
    reader.size_t_width = size_t;
    if reader.read_byte()? != INSTRUCTION_SIZE {
        return Err(chunk_error("instruction size mismatch"));
    }
    if reader.read_byte()? != NUMBER_SIZE {
        return Err(chunk_error("number size mismatch"));
    }
    if reader.read_byte()? != NUMBER_IS_INTEGRAL {
        return Err(chunk_error("number format mismatch"));
    }
    Ok(())
}

fn read_function(reader: &mut Reader, strings: &mut StringInterner) -> Result<Proto, ChunkError> {
    let mut proto = Proto::new();

    proto.source = reader.read_string(strings)?;
    proto.line_defined = reader.read_int()? as u32;
    proto.last_line_defined = reader.read_int()? as u32;

    let num_upvalues = reader.read_byte()? as usize;
    proto.num_params = reader.read_byte()?;
    proto.is_vararg = reader.read_byte()? & VARARG_FLAG != 0;
    proto.max_stack_size = reader.read_byte()?;

    let code_size = reader.read_count(4)?;
    proto.code = Vec::with_capacity(code_size);
    for _ in 0..code_size {
        proto.code.push(Instruction(reader.read_u32()?));
    }

    let const_size = reader.read_count(1)?;
    proto.constants = Vec::with_capacity(const_size);
    for _ in 0..const_size {
        let tag = reader.read_byte()?;
        let k = match tag {
            LUA_TNIL => Constant::Nil,
            LUA_TBOOLEAN => Constant::Boolean(reader.read_byte()? != 0),
            LUA_TNUMBER => Constant::Number(reader.read_f64()?),
            LUA_TSTRING => {
                let sid = reader
                    .read_string(strings)?
                    .ok_or_else(|| chunk_error("empty string constant"))?;
                Constant::Str(sid)
            }
            other => return Err(chunk_error(format!("unknown constant type: {other}"))),
        };
        proto.constants.push(k);
    }

    let proto_size = reader.read_count(1)?;
    proto.protos = Vec::with_capacity(proto_size);
    for _ in 0..proto_size {
        proto.protos.push(read_function(reader, strings)?);
    }

    // Debug info — line table
    let line_size = reader.read_count(4)?;
    proto.lines = Vec::with_capacity(line_size);
    for _ in 0..line_size {
        proto.lines.push(reader.read_int()? as u32);
    }

    // Locals
    let local_size = reader.read_count(1)?;
    proto.local_vars = Vec::with_capacity(local_size);
    for _ in 0..local_size {
        let name = reader
            .read_string(strings)?
            .ok_or_else(|| chunk_error("local variable without a name"))?;
        let start_pc = reader.read_int()? as u32;
        let end_pc = reader.read_int()? as u32;
        proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }

    // Upvalue names. The chunk only records count + debug names; the
    // binding descriptors live in the parent's CLOSURE pseudo-instructions.
    let upval_name_size = reader.read_count(1)?;
    let empty = strings.intern(b"");
    let mut names = Vec::with_capacity(upval_name_size);
    for _ in 0..upval_name_size {
        names.push(reader.read_string(strings)?.unwrap_or(empty));
    }
    for i in 0..num_upvalues {
        proto.upvalues.push(UpvalDesc {
            name: names.get(i).copied().unwrap_or(empty),
            in_stack: false,
            index: 0,
        });
    }

    Ok(proto)
}
