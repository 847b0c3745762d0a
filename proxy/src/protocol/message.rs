//! Message types for the PostgreSQL wire protocol
//!
//! Typed views of the messages the gateway inspects or originates. Anything
//! else is relayed as a [`RawMessage`](super::codec::RawMessage) and only its
//! type byte is looked at.

use bytes::Bytes;

/// Startup packet with protocol version and options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    /// Requested protocol version
    pub protocol_version: i32,

    /// Options in the order the client sent them
    pub options: Vec<(String, String)>,
}

impl StartupMessage {
    /// Create a protocol 3.0 startup message
    pub fn new(options: Vec<(String, String)>) -> Self {
        Self {
            protocol_version: super::codec::PROTOCOL_VERSION_3,
            options,
        }
    }

    /// Look up an option by name
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The `user` option
    pub fn user(&self) -> Option<&str> {
        self.option("user")
    }

    /// The `database` option
    pub fn database(&self) -> Option<&str> {
        self.option("database")
    }

    /// Copy of this message with `user` replaced and every other option kept
    pub fn with_user(&self, user: &str) -> Self {
        let mut options = Vec::with_capacity(self.options.len() + 1);
        options.push(("user".to_string(), user.to_string()));
        options.extend(self.options.iter().filter(|(key, _)| key != "user").cloned());

        Self {
            protocol_version: self.protocol_version,
            options,
        }
    }
}

/// First packet(s) a client can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupPacket {
    /// Regular startup message
    Startup(StartupMessage),

    /// Request to upgrade to TLS
    SslRequest,

    /// Request to upgrade to GSSAPI encryption
    GssEncRequest,

    /// Request to cancel a running query on another connection
    CancelRequest {
        /// Backend process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },
}

/// Authentication request types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    /// Authentication successful
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for MD5 authentication
        salt: [u8; 4],
    },

    /// SASL authentication required
    Sasl {
        /// SASL authentication mechanisms
        mechanisms: Vec<String>,
    },

    /// SASL continuation
    SaslContinue {
        /// SASL data
        data: Bytes,
    },

    /// SASL final message
    SaslFinal {
        /// SASL data
        data: Bytes,
    },

    /// Any method the gateway does not handle (Kerberos, GSS, SSPI, ...)
    Unsupported(i32),
}

impl AuthenticationRequest {
    /// Method code carried in the message
    pub fn code(&self) -> i32 {
        match self {
            AuthenticationRequest::Ok => 0,
            AuthenticationRequest::CleartextPassword => 3,
            AuthenticationRequest::Md5Password { .. } => 5,
            AuthenticationRequest::Sasl { .. } => 10,
            AuthenticationRequest::SaslContinue { .. } => 11,
            AuthenticationRequest::SaslFinal { .. } => 12,
            AuthenticationRequest::Unsupported(code) => *code,
        }
    }
}

/// SASLInitialResponse payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslInitialResponse {
    /// Selected mechanism
    pub mechanism: String,

    /// Mechanism-specific data, empty when the client sent none
    pub data: Bytes,
}

/// Frontend (client) message types the gateway distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// 'p': password, SASLInitialResponse or SASLResponse depending on context
    AuthenticationResponse(Bytes),

    /// 'Q': simple query
    Query(String),

    /// 'X': termination
    Terminate,

    /// Any other message type
    Other(u8),
}

impl FrontendMessage {
    /// Short description for logging; never includes credentials
    pub fn summary(&self) -> String {
        match self {
            FrontendMessage::AuthenticationResponse(data) => {
                format!("AuthenticationResponse({} bytes, redacted)", data.len())
            }
            FrontendMessage::Query(query) => format!("Query({:?})", query),
            FrontendMessage::Terminate => "Terminate".to_string(),
            FrontendMessage::Other(tag) => format!("Message('{}')", tag.escape_ascii()),
        }
    }
}

/// Backend (server) message types the gateway distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// 'R': authentication request
    Authentication(AuthenticationRequest),

    /// 'E': error response
    ErrorResponse(ErrorFields),

    /// 'Z': ready for query
    ReadyForQuery(TransactionStatus),

    /// 'S': parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// 'K': backend key data
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Any other message type
    Other(u8),
}

impl BackendMessage {
    /// Short description for logging; never includes SASL payloads
    pub fn summary(&self) -> String {
        match self {
            BackendMessage::Authentication(request) => match request {
                AuthenticationRequest::SaslContinue { data } | AuthenticationRequest::SaslFinal { data } => {
                    format!("Authentication(code {}, {} bytes)", request.code(), data.len())
                }
                other => format!("Authentication({:?})", other),
            },
            BackendMessage::ErrorResponse(fields) => format!(
                "ErrorResponse({} {}: {})",
                fields.severity.as_deref().unwrap_or("?"),
                fields.code.as_deref().unwrap_or("?"),
                fields.message.as_deref().unwrap_or("")
            ),
            BackendMessage::ReadyForQuery(status) => format!("ReadyForQuery({:?})", status),
            BackendMessage::ParameterStatus { name, value } => format!("ParameterStatus({}={})", name, value),
            BackendMessage::BackendKeyData { process_id, .. } => format!("BackendKeyData(pid {})", process_id),
            BackendMessage::Other(tag) => format!("Message('{}')", tag.escape_ascii()),
        }
    }
}

/// Transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction)
    Idle,

    /// In a transaction block
    InTransaction,

    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Convert from a byte to a transaction status
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    /// Convert to a byte
    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Fields of an ErrorResponse the gateway reads or writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (localized)
    pub severity: Option<String>,

    /// Severity (non-localized)
    pub severity_non_localized: Option<String>,

    /// SQLSTATE code
    pub code: Option<String>,

    /// Primary message
    pub message: Option<String>,
}

impl ErrorFields {
    /// A FATAL error with the given SQLSTATE and message
    pub fn fatal(code: &str, message: &str) -> Self {
        Self {
            severity: Some("FATAL".to_string()),
            severity_non_localized: Some("FATAL".to_string()),
            code: Some(code.to_string()),
            message: Some(message.to_string()),
        }
    }
}
