//! Message formatter for PostgreSQL wire protocol messages
//!
//! Builds the frames the gateway originates itself: authentication requests
//! and errors towards the client, and startup, password and SASL messages
//! towards the upstream server.

use bytes::{BufMut, BytesMut};

use super::codec::{RawMessage, SSL_REQUEST_CODE};
use super::message::{AuthenticationRequest, ErrorFields, StartupMessage, TransactionStatus};

/// Format an ErrorResponse
pub fn error_response(fields: &ErrorFields) -> RawMessage {
    write_message_with_type(b'E', |buf| {
        let entries = [
            (b'S', &fields.severity),
            (b'V', &fields.severity_non_localized),
            (b'C', &fields.code),
            (b'M', &fields.message),
        ];
        for (field_type, value) in entries {
            if let Some(value) = value {
                buf.put_u8(field_type);
                write_string(buf, value);
            }
        }
        buf.put_u8(0);
    })
}

/// Format a FATAL ErrorResponse
pub fn fatal_error(code: &str, message: &str) -> RawMessage {
    error_response(&ErrorFields::fatal(code, message))
}

/// Format an AuthenticationRequest
pub fn authentication_request(request: &AuthenticationRequest) -> RawMessage {
    write_message_with_type(b'R', |buf| {
        buf.put_i32(request.code());
        match request {
            AuthenticationRequest::Md5Password { salt } => buf.put_slice(salt),
            AuthenticationRequest::Sasl { mechanisms } => {
                for mechanism in mechanisms {
                    write_string(buf, mechanism);
                }
                buf.put_u8(0);
            }
            AuthenticationRequest::SaslContinue { data } | AuthenticationRequest::SaslFinal { data } => {
                buf.put_slice(data);
            }
            AuthenticationRequest::Ok
            | AuthenticationRequest::CleartextPassword
            | AuthenticationRequest::Unsupported(_) => {}
        }
    })
}

/// Format a ReadyForQuery
pub fn ready_for_query(status: TransactionStatus) -> RawMessage {
    write_message_with_type(b'Z', |buf| buf.put_u8(status.to_byte()))
}

/// Format a PasswordMessage
pub fn password_message(password: &[u8]) -> RawMessage {
    write_message_with_type(b'p', |buf| {
        buf.put_slice(password);
        buf.put_u8(0);
    })
}

/// Format a SASLInitialResponse
pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> RawMessage {
    write_message_with_type(b'p', |buf| {
        write_string(buf, mechanism);
        buf.put_i32(data.len() as i32);
        buf.put_slice(data);
    })
}

/// Format a SASLResponse
pub fn sasl_response(data: &[u8]) -> RawMessage {
    RawMessage::new(b'p', data)
}

/// Format a Terminate
pub fn terminate() -> RawMessage {
    RawMessage::new(b'X', &[])
}

/// Format a startup message
pub fn startup_message(startup: &StartupMessage) -> RawMessage {
    let mut body = BytesMut::new();
    body.put_i32(startup.protocol_version);
    for (name, value) in &startup.options {
        write_string(&mut body, name);
        write_string(&mut body, value);
    }
    body.put_u8(0);
    RawMessage::untagged(&body)
}

/// Format an SSLRequest
pub fn ssl_request() -> RawMessage {
    RawMessage::untagged(&SSL_REQUEST_CODE.to_be_bytes())
}

fn write_message_with_type<F>(tag: u8, write_body: F) -> RawMessage
where
    F: FnOnce(&mut BytesMut),
{
    let mut body = BytesMut::new();
    write_body(&mut body);
    RawMessage::new(tag, &body)
}

fn write_string(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}
