//! Fixed protocol constants. The RPC catalogue itself (the hundreds of
//! per-call procedure wrappers) is explicitly out of scope (spec.md §1) and
//! assumed generated elsewhere; the handful of procedure numbers below
//! belong to the Authenticator, which spec.md places in scope.

/// Program number of the core remote-management protocol.
pub const PROGRAM: u32 = 0x2000_8086;
pub const PROTOCOL_VERSION: u32 = 1;

pub const PROC_AUTH_LIST: u32 = 66;
pub const PROC_AUTH_SASL_INIT: u32 = 67;
pub const PROC_AUTH_SASL_START: u32 = 68;
pub const PROC_AUTH_SASL_STEP: u32 = 69;
pub const PROC_AUTH_POLKIT: u32 = 70;

/// Encode a length-prefixed (u32 big-endian) byte string, the minimal
/// marshalling the Authenticator needs for mechanism names and challenges.
/// This is not a general XDR implementation: it exists only because the
/// Authenticator's payloads are, unlike the rest of the RPC catalogue, in
/// scope for this crate.
pub fn encode_opaque(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    let padding = (4 - bytes.len() % 4) % 4;
    buf.extend(std::iter::repeat(0u8).take(padding));
}

pub fn decode_opaque(buf: &[u8], offset: &mut usize) -> crate::error::Result<Vec<u8>> {
    use crate::error::Error;
    if buf.len() < *offset + 4 {
        return Err(Error::protocol("truncated auth payload (length)"));
    }
    let len = u32::from_be_bytes(buf[*offset..*offset + 4].try_into().unwrap()) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return Err(Error::protocol("truncated auth payload (body)"));
    }
    let bytes = buf[*offset..*offset + len].to_vec();
    *offset += len;
    *offset += (4 - len % 4) % 4;
    Ok(bytes)
}

pub fn encode_u32_list(strings: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(strings.len() as u32).to_be_bytes());
    for s in strings {
        encode_opaque(&mut buf, s.as_bytes());
    }
    buf
}

pub fn decode_string_list(buf: &[u8]) -> crate::error::Result<Vec<String>> {
    use crate::error::Error;
    if buf.len() < 4 {
        return Err(Error::protocol("truncated mechanism list"));
    }
    let count = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    let mut offset = 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = decode_opaque(buf, &mut offset)?;
        out.push(String::from_utf8(raw).map_err(|_| Error::protocol("mechanism name is not utf-8"))?);
    }
    Ok(out)
}
