//! Framing for the PostgreSQL v3 wire protocol.
//!
//! Frontend messages are appended to a caller-owned `Vec<u8>` so several
//! can be pipelined in one write. Backend bodies are decoded with bounds
//! checks; a short or malformed body is a protocol error, never a panic.

use crate::error::{PgError, PgResult};
use crate::protocol::PROTOCOL_VERSION;

// ─── Encoding (Frontend → Server) ─────────────────────────────

/// Start a tagged message; returns the offset of its length field.
fn begin(buf: &mut Vec<u8>, tag: u8) -> usize {
    buf.push(tag);
    let len_pos = buf.len();
    buf.extend_from_slice(&[0; 4]);
    len_pos
}

/// Patch the length field once the body is written. The length counts
/// itself but not the tag byte.
fn finish(buf: &mut [u8], len_pos: usize) {
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// StartupMessage: untagged, `Int32 len, Int32 version, {name, value}*, \0`.
pub fn encode_startup(buf: &mut Vec<u8>, user: &str, database: &str, params: &[(&str, &str)]) {
    let len_pos = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    put_cstring(buf, "user");
    put_cstring(buf, user);
    put_cstring(buf, "database");
    put_cstring(buf, database);
    for (name, value) in params {
        put_cstring(buf, name);
        put_cstring(buf, value);
    }
    buf.push(0);
    finish(buf, len_pos);
}

/// PasswordMessage carrying a cleartext password.
pub fn encode_password(buf: &mut Vec<u8>, password: &str) {
    let len_pos = begin(buf, b'p');
    put_cstring(buf, password);
    finish(buf, len_pos);
}

pub fn encode_sasl_initial(buf: &mut Vec<u8>, mechanism: &str, data: &[u8]) {
    let len_pos = begin(buf, b'p');
    put_cstring(buf, mechanism);
    buf.extend_from_slice(&(data.len() as i32).to_be_bytes());
    buf.extend_from_slice(data);
    finish(buf, len_pos);
}

pub fn encode_sasl_response(buf: &mut Vec<u8>, data: &[u8]) {
    let len_pos = begin(buf, b'p');
    buf.extend_from_slice(data);
    finish(buf, len_pos);
}

/// Simple Query ('Q'). May hold several `;`-separated statements.
pub fn encode_query(buf: &mut Vec<u8>, sql: &str) {
    let len_pos = begin(buf, b'Q');
    put_cstring(buf, sql);
    finish(buf, len_pos);
}

/// Parse ('P') into the unnamed statement, letting the server infer
/// parameter types.
pub fn encode_parse(buf: &mut Vec<u8>, sql: &str) {
    let len_pos = begin(buf, b'P');
    put_cstring(buf, "");
    put_cstring(buf, sql);
    buf.extend_from_slice(&0i16.to_be_bytes());
    finish(buf, len_pos);
}

/// Bind ('B') the unnamed statement to the unnamed portal. Parameters and
/// results all use the text format; `None` binds SQL NULL.
pub fn encode_bind(buf: &mut Vec<u8>, params: &[Option<&str>]) {
    let len_pos = begin(buf, b'B');
    put_cstring(buf, "");
    put_cstring(buf, "");
    buf.extend_from_slice(&0i16.to_be_bytes());
    buf.extend_from_slice(&(params.len() as i16).to_be_bytes());
    for param in params {
        match param {
            Some(value) => {
                buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
            None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    buf.extend_from_slice(&0i16.to_be_bytes());
    finish(buf, len_pos);
}

/// Execute ('E') the unnamed portal with no row limit.
pub fn encode_execute(buf: &mut Vec<u8>) {
    let len_pos = begin(buf, b'E');
    put_cstring(buf, "");
    buf.extend_from_slice(&0i32.to_be_bytes());
    finish(buf, len_pos);
}

pub fn encode_sync(buf: &mut Vec<u8>) {
    let len_pos = begin(buf, b'S');
    finish(buf, len_pos);
}

pub fn encode_terminate(buf: &mut Vec<u8>) {
    let len_pos = begin(buf, b'X');
    finish(buf, len_pos);
}

// ─── Decoding (Server → Frontend) ─────────────────────────────

fn short(what: &str) -> PgError {
    PgError::Protocol(format!("truncated {}", what))
}

pub fn read_i32(body: &[u8], offset: usize) -> PgResult<i32> {
    body.get(offset..offset + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| short("Int32"))
}

pub fn read_i16(body: &[u8], offset: usize) -> PgResult<i16> {
    body.get(offset..offset + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| short("Int16"))
}

/// Read a C string at `offset`. Returns the string and the bytes consumed
/// including the terminator.
pub fn read_cstring(body: &[u8], offset: usize) -> PgResult<(&str, usize)> {
    let rest = body.get(offset..).ok_or_else(|| short("string"))?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("unterminated string".to_string()))?;
    let s = std::str::from_utf8(&rest[..end])
        .map_err(|_| PgError::Protocol("invalid UTF-8 in string".to_string()))?;
    Ok((s, end + 1))
}

/// Length of the body that follows a 5-byte header (tag + Int32 length).
pub fn body_len(header: &[u8; 5]) -> PgResult<usize> {
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 4 {
        return Err(PgError::Protocol(format!("invalid message length {}", len)));
    }
    let body = len as usize - 4;
    if body > crate::protocol::MAX_MESSAGE_SIZE {
        return Err(PgError::Protocol(format!("message of {} bytes is too large", body)));
    }
    Ok(body)
}

/// Fields of an ErrorResponse or NoticeResponse, as (code, value) pairs.
pub fn parse_error_fields(body: &[u8]) -> PgResult<Vec<(u8, String)>> {
    let mut fields = Vec::new();
    let mut pos = 0;
    while let Some(&field_type) = body.get(pos) {
        pos += 1;
        if field_type == 0 {
            break;
        }
        let (value, consumed) = read_cstring(body, pos)?;
        fields.push((field_type, value.to_string()));
        pos += consumed;
    }
    Ok(fields)
}

/// Build a [`PgError::Server`] from an ErrorResponse body.
pub fn parse_error(body: &[u8]) -> PgError {
    let fields = match parse_error_fields(body) {
        Ok(fields) => fields,
        Err(err) => return err,
    };
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();
    for (field_type, value) in fields {
        match field_type {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    PgError::Server {
        severity,
        code,
        message,
    }
}

/// Columns of a DataRow in text format. `None` is SQL NULL.
pub fn parse_data_row(body: &[u8]) -> PgResult<Vec<Option<String>>> {
    let count = read_i16(body, 0)?;
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    let mut pos = 2;
    for _ in 0..count {
        let len = read_i32(body, pos)?;
        pos += 4;
        if len < 0 {
            columns.push(None);
            continue;
        }
        let len = len as usize;
        let raw = body.get(pos..pos + len).ok_or_else(|| short("column"))?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| PgError::Protocol("column is not valid UTF-8".to_string()))?;
        columns.push(Some(text.to_string()));
        pos += len;
    }
    Ok(columns)
}

/// Rows affected according to a CommandComplete tag such as `INSERT 0 1`.
pub fn parse_command_tag(body: &[u8]) -> PgResult<u64> {
    let (tag, _) = read_cstring(body, 0)?;
    Ok(tag
        .rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0))
}

/// Mechanism names listed in an AuthenticationSASL body, after the
/// Int32 auth type.
pub fn parse_sasl_mechanisms(body: &[u8]) -> PgResult<Vec<String>> {
    let mut mechanisms = Vec::new();
    let mut pos = 4;
    loop {
        let (name, consumed) = read_cstring(body, pos)?;
        if name.is_empty() {
            break;
        }
        mechanisms.push(name.to_string());
        pos += consumed;
    }
    Ok(mechanisms)
}
