use crate::message::Address;

/// Snapshot of an SMTP envelope, handed to the "before accepted" hooks
#[derive(Debug, Clone, PartialEq)]
pub struct SmtpSessionInfo {
    pub from: Option<Address>,
    /// Accepted recipients so far, plus the one under consideration
    pub to: Vec<Address>,
    pub remote_addr: String,
}

/// A hook's verdict on a sender or recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpResponse {
    /// Leave the decision to the address policy
    Defer,
    /// Accept, overriding the address policy
    Allow,
    /// Refuse with the given reply code and text
    Deny { code: u16, message: String },
}

impl SmtpResponse {
    pub fn deny(code: u16, message: impl Into<String>) -> Self {
        SmtpResponse::Deny {
            code,
            message: message.into(),
        }
    }

    /// Reply line sent to the client on `Deny`
    pub fn reply(&self) -> Option<String> {
        match self {
            SmtpResponse::Deny { code, message } => Some(format!("{:03} {}", code, message)),
            _ => None,
        }
    }
}
