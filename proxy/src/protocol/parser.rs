//! Message parser for PostgreSQL wire protocol messages
//!
//! Turns [`RawMessage`] frames into the typed views in
//! [`message`](super::message). Every length is checked before it is read, so
//! a truncated or hostile frame yields a protocol error rather than a panic.

use bytes::{Buf, Bytes};

use super::codec::{RawMessage, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, SSL_REQUEST_CODE};
use super::message::{
    AuthenticationRequest, BackendMessage, ErrorFields, FrontendMessage, SaslInitialResponse, StartupMessage,
    StartupPacket, TransactionStatus,
};
use crate::error::{GatewayError, Result};

/// Parse a startup-phase packet
pub fn parse_startup(raw: &RawMessage) -> Result<StartupPacket> {
    if raw.tag().is_some() {
        return Err(GatewayError::Protocol("expected a startup packet".to_string()));
    }

    let mut buf = raw.body();
    let code = get_i32(&mut buf)?;
    match code {
        SSL_REQUEST_CODE => Ok(StartupPacket::SslRequest),
        GSSENC_REQUEST_CODE => Ok(StartupPacket::GssEncRequest),
        CANCEL_REQUEST_CODE => {
            let process_id = get_i32(&mut buf)?;
            let secret_key = get_i32(&mut buf)?;
            Ok(StartupPacket::CancelRequest { process_id, secret_key })
        }
        version => {
            let major = version >> 16;
            if major != 3 {
                return Err(GatewayError::Protocol(format!(
                    "unsupported frontend protocol {}.{}",
                    major,
                    version & 0xFFFF
                )));
            }

            let mut options = Vec::new();
            loop {
                let name = read_cstring(&mut buf)?;
                // Empty name terminates the option list
                if name.is_empty() {
                    break;
                }
                let value = read_cstring(&mut buf)?;
                options.push((name, value));
            }

            Ok(StartupPacket::Startup(StartupMessage {
                protocol_version: version,
                options,
            }))
        }
    }
}

/// Parse a regular frontend message
pub fn parse_frontend_message(raw: &RawMessage) -> Result<FrontendMessage> {
    let tag = raw
        .tag()
        .ok_or_else(|| GatewayError::Protocol("unexpected startup packet".to_string()))?;
    let mut buf = raw.body();

    match tag {
        b'p' => Ok(FrontendMessage::AuthenticationResponse(Bytes::copy_from_slice(buf))),
        b'Q' => Ok(FrontendMessage::Query(read_cstring(&mut buf)?)),
        b'X' => Ok(FrontendMessage::Terminate),
        other => Ok(FrontendMessage::Other(other)),
    }
}

/// Parse a backend message
pub fn parse_backend_message(raw: &RawMessage) -> Result<BackendMessage> {
    let tag = raw
        .tag()
        .ok_or_else(|| GatewayError::Protocol("untyped backend message".to_string()))?;
    let mut buf = raw.body();

    match tag {
        b'R' => Ok(BackendMessage::Authentication(parse_authentication(&mut buf)?)),
        b'E' => Ok(BackendMessage::ErrorResponse(parse_error_fields(&mut buf)?)),
        b'Z' => {
            let byte = get_u8(&mut buf)?;
            let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
                GatewayError::Protocol(format!("invalid transaction status '{}'", byte.escape_ascii()))
            })?;
            Ok(BackendMessage::ReadyForQuery(status))
        }
        b'S' => {
            let name = read_cstring(&mut buf)?;
            let value = read_cstring(&mut buf)?;
            Ok(BackendMessage::ParameterStatus { name, value })
        }
        b'K' => {
            let process_id = get_i32(&mut buf)?;
            let secret_key = get_i32(&mut buf)?;
            Ok(BackendMessage::BackendKeyData { process_id, secret_key })
        }
        other => Ok(BackendMessage::Other(other)),
    }
}

/// Parse a PasswordMessage, returning the password without its terminator
pub fn parse_password_message(raw: &RawMessage) -> Result<Bytes> {
    expect_tag(raw, b'p', "PasswordMessage")?;
    let body = raw.body();
    match body.split_last() {
        Some((0, password)) => Ok(Bytes::copy_from_slice(password)),
        _ => Err(GatewayError::Protocol("password message is not NUL-terminated".to_string())),
    }
}

/// Parse a SASLInitialResponse
pub fn parse_sasl_initial_response(raw: &RawMessage) -> Result<SaslInitialResponse> {
    expect_tag(raw, b'p', "SASLInitialResponse")?;
    let mut buf = raw.body();
    let mechanism = read_cstring(&mut buf)?;
    let len = get_i32(&mut buf)?;

    // -1 means no initial data
    let data = if len < 0 {
        Bytes::new()
    } else {
        let len = len as usize;
        if buf.remaining() < len {
            return Err(GatewayError::Protocol("truncated SASLInitialResponse".to_string()));
        }
        Bytes::copy_from_slice(&buf[..len])
    };

    Ok(SaslInitialResponse { mechanism, data })
}

/// Parse a SASLResponse
pub fn parse_sasl_response(raw: &RawMessage) -> Result<Bytes> {
    expect_tag(raw, b'p', "SASLResponse")?;
    Ok(Bytes::copy_from_slice(raw.body()))
}

fn parse_authentication(buf: &mut &[u8]) -> Result<AuthenticationRequest> {
    let code = get_i32(buf)?;
    let request = match code {
        0 => AuthenticationRequest::Ok,
        3 => AuthenticationRequest::CleartextPassword,
        5 => {
            if buf.remaining() < 4 {
                return Err(GatewayError::Protocol("truncated MD5 salt".to_string()));
            }
            let mut salt = [0u8; 4];
            buf.copy_to_slice(&mut salt);
            AuthenticationRequest::Md5Password { salt }
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let mechanism = read_cstring(buf)?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationRequest::Sasl { mechanisms }
        }
        11 => AuthenticationRequest::SaslContinue {
            data: Bytes::copy_from_slice(*buf),
        },
        12 => AuthenticationRequest::SaslFinal {
            data: Bytes::copy_from_slice(*buf),
        },
        other => AuthenticationRequest::Unsupported(other),
    };
    Ok(request)
}

fn parse_error_fields(buf: &mut &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    loop {
        let field_type = get_u8(buf)?;
        if field_type == 0 {
            break;
        }
        let value = read_cstring(buf)?;
        match field_type {
            b'S' => fields.severity = Some(value),
            b'V' => fields.severity_non_localized = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

fn expect_tag(raw: &RawMessage, tag: u8, name: &str) -> Result<()> {
    match raw.tag() {
        Some(found) if found == tag => Ok(()),
        Some(found) => Err(GatewayError::Protocol(format!(
            "expected {}, received message type '{}'",
            name,
            found.escape_ascii()
        ))),
        None => Err(GatewayError::Protocol(format!("expected {}, received a startup packet", name))),
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(GatewayError::Protocol("unexpected end of message".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(GatewayError::Protocol("unexpected end of message".to_string()));
    }
    Ok(buf.get_i32())
}

/// Read a NUL-terminated string
fn read_cstring(buf: &mut &[u8]) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| GatewayError::Protocol("unterminated string".to_string()))?;
    let value = String::from_utf8(buf[..end].to_vec())
        .map_err(|e| GatewayError::Protocol(format!("Invalid UTF-8: {}", e)))?;
    buf.advance(end + 1);
    Ok(value)
}
