//! Binary encoding of stored recordings
//!
//! Layout (little-endian):
//!
//! ```text
//! magic[4] version:u16 stored_at_ms:u64 status:u16
//! header_count:u16 { name_len:u16 name value_len:u16 value }*
//! body_len:u32 body
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

use crate::message::Response;
use crate::{GenproxyError, Result};

/// Magic bytes at the start of every stored recording
pub const RECORDING_MAGIC: [u8; 4] = *b"GPRX";

/// Current encoding version
pub const RECORDING_VERSION: u16 = 1;

/// Encode a response and its capture time
///
/// # Errors
///
/// Returns `DataTooLarge` if a header or the body exceeds its length field
pub fn encode_recording(response: &Response, stored_at: SystemTime) -> Result<Vec<u8>> {
    check_len(response.headers.len(), u16::MAX as usize)?;
    check_len(response.body.len(), u32::MAX as usize)?;
    for (name, value) in &response.headers {
        check_len(name.as_str().len(), u16::MAX as usize)?;
        check_len(value.as_bytes().len(), u16::MAX as usize)?;
    }

    let stored_at_ms = stored_at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);

    let mut data = Vec::with_capacity(64 + response.body.len());
    data.extend_from_slice(&RECORDING_MAGIC);
    data.extend_from_slice(&RECORDING_VERSION.to_le_bytes());
    data.extend_from_slice(&stored_at_ms.to_le_bytes());
    data.extend_from_slice(&response.status.as_u16().to_le_bytes());

    data.extend_from_slice(&(response.headers.len() as u16).to_le_bytes());
    for (name, value) in &response.headers {
        data.extend_from_slice(&(name.as_str().len() as u16).to_le_bytes());
        data.extend_from_slice(name.as_str().as_bytes());
        data.extend_from_slice(&(value.as_bytes().len() as u16).to_le_bytes());
        data.extend_from_slice(value.as_bytes());
    }

    data.extend_from_slice(&(response.body.len() as u32).to_le_bytes());
    data.extend_from_slice(&response.body);

    Ok(data)
}

fn check_len(size: usize, limit: usize) -> Result<()> {
    if size > limit {
        return Err(GenproxyError::DataTooLarge { size, limit });
    }
    Ok(())
}

/// Decode a stored recording
///
/// # Errors
///
/// Returns `InvalidFormat` on bad magic, unknown version, truncation or
/// invalid header/status values
pub fn decode_recording(data: &[u8]) -> Result<(Response, SystemTime)> {
    let mut reader = Reader { data, offset: 0 };

    if reader.take(4, "magic")? != RECORDING_MAGIC {
        return Err(GenproxyError::InvalidFormat("Invalid magic bytes".to_string()));
    }

    let version = reader.u16("version")?;
    if version != RECORDING_VERSION {
        return Err(GenproxyError::InvalidFormat(format!(
            "Unsupported version: {version}, expected {RECORDING_VERSION}"
        )));
    }

    let stored_at = UNIX_EPOCH + Duration::from_millis(reader.u64("timestamp")?);

    let status = reader.u16("status")?;
    let status = StatusCode::from_u16(status)
        .map_err(|_| GenproxyError::InvalidFormat(format!("Invalid status code {status}")))?;

    let header_count = reader.u16("headers count")?;
    let mut headers = HeaderMap::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name_len = reader.u16("header name length")? as usize;
        let name = HeaderName::from_bytes(reader.take(name_len, "header name")?)
            .map_err(|e| GenproxyError::InvalidFormat(format!("Invalid header name: {e}")))?;

        let value_len = reader.u16("header value length")? as usize;
        let value = HeaderValue::from_bytes(reader.take(value_len, "header value")?)
            .map_err(|e| GenproxyError::InvalidFormat(format!("Invalid header value: {e}")))?;

        headers.append(name, value);
    }

    let body_len = reader.u32("body length")? as usize;
    let body = Bytes::copy_from_slice(reader.take(body_len, "body")?);

    if reader.offset != data.len() {
        return Err(GenproxyError::InvalidFormat(format!(
            "{} trailing bytes",
            data.len() - reader.offset
        )));
    }

    Ok((
        Response {
            status,
            headers,
            body,
        },
        stored_at,
    ))
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| GenproxyError::InvalidFormat(format!("Missing {what}")))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Response {
        Response::new(StatusCode::OK, "Hello")
            .with_header(
                HeaderName::from_static("content-type"),
                HeaderValue::from_static("text/plain"),
            )
            .with_header(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("a=1"),
            )
            .with_header(
                HeaderName::from_static("set-cookie"),
                HeaderValue::from_static("b=2"),
            )
    }

    #[test]
    fn test_decode_preserves_multi_valued_headers() {
        let at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let data = encode_recording(&sample_response(), at).unwrap();

        let (response, stored_at) = decode_recording(&data).unwrap();

        assert_eq!(response, sample_response());
        assert_eq!(stored_at, at);
        let cookies: Vec<_> = response.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_decode_known_layout() {
        let mut data = Vec::new();
        data.extend_from_slice(b"GPRX");
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());

        // Status: 404
        data.extend_from_slice(&404u16.to_le_bytes());

        // Headers: 1 header
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(b"content-type");
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(b"text/plain");

        // Body: "gone" (4 bytes)
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(b"gone");

        let (response, stored_at) = decode_recording(&data).unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.headers["content-type"], "text/plain");
        assert_eq!(response.body, "gone");
        assert_eq!(stored_at, UNIX_EPOCH);
    }

    #[test]
    fn test_empty_body_is_preserved() {
        let response = Response::new(StatusCode::NO_CONTENT, Bytes::new());
        let (decoded, _) = decode_recording(&encode_recording(&response, SystemTime::now()).unwrap()).unwrap();

        assert_eq!(decoded.status, StatusCode::NO_CONTENT);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut data = encode_recording(&sample_response(), SystemTime::now()).unwrap();
        data[0] = b'X';
        assert!(matches!(
            decode_recording(&data),
            Err(GenproxyError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_unknown_version() {
        let mut data = encode_recording(&sample_response(), SystemTime::now()).unwrap();
        data[4..6].copy_from_slice(&9u16.to_le_bytes());
        assert!(decode_recording(&data).is_err());
    }

    #[test]
    fn test_truncated() {
        let data = encode_recording(&sample_response(), SystemTime::now()).unwrap();
        for len in [0, 3, 10, data.len() - 1] {
            assert!(decode_recording(&data[..len]).is_err(), "length {len}");
        }
    }

    #[test]
    fn test_oversized_header_rejected() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let response = Response::new(StatusCode::OK, "").with_header(
            HeaderName::from_static("x-long"),
            HeaderValue::from_str(&long).unwrap(),
        );
        assert!(matches!(
            encode_recording(&response, SystemTime::now()),
            Err(GenproxyError::DataTooLarge { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = encode_recording(&sample_response(), SystemTime::now()).unwrap();
        data.push(0);
        assert!(decode_recording(&data).is_err());
    }
}
