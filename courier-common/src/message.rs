//! The outbound message model shared by every stage of the pipeline.
//!
//! A [`Message`] is what callers hand to the service, what the transport turns
//! into a wire message, and what the failure spool persists. It is plain data:
//! every field survives a serialize/deserialize round trip unchanged.

use std::collections::BTreeMap;

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};

use crate::ValidationError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Sender mailbox; the transport substitutes its default when unset
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    #[must_use]
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    #[must_use]
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Every envelope recipient: `to`, then `cc`, then `bcc`.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }

    pub fn has_body(&self) -> bool {
        self.html.as_deref().is_some_and(|b| !b.is_empty())
            || self.text.as_deref().is_some_and(|b| !b.is_empty())
    }

    /// Check everything except the body.
    ///
    /// Templated sends call this before the body exists; the body is produced
    /// later by the renderer.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate_envelope(&self) -> Result<(), ValidationError> {
        if self.to.is_empty() {
            return Err(ValidationError::NoRecipients);
        }

        if self.subject.trim().is_empty() {
            return Err(ValidationError::EmptySubject);
        }

        for address in &self.to {
            check_address("to", address)?;
        }
        for address in &self.cc {
            check_address("cc", address)?;
        }
        for address in &self.bcc {
            check_address("bcc", address)?;
        }
        if let Some(from) = &self.from {
            check_address("from", from)?;
        }
        if let Some(reply_to) = &self.reply_to {
            check_address("reply-to", reply_to)?;
        }

        if let Some(name) = self.headers.keys().find(|name| !is_header_name(name)) {
            return Err(ValidationError::InvalidHeader(name.clone()));
        }

        Ok(())
    }

    /// Full validation: at least one recipient, a subject, and a body.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_envelope()?;

        if !self.has_body() {
            return Err(ValidationError::NoBody);
        }

        Ok(())
    }
}

fn check_address(field: &'static str, address: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidAddress {
        field,
        address: address.to_string(),
    };

    let parsed = mailparse::addrparse(address).map_err(|_| invalid())?;
    match parsed.iter().collect::<Vec<_>>().as_slice() {
        [MailAddr::Single(info)] if is_plausible_mailbox(&info.addr) => Ok(()),
        _ => Err(invalid()),
    }
}

fn is_plausible_mailbox(addr: &str) -> bool {
    addr.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && !domain.is_empty() && !domain.contains('@')
    })
}

/// RFC 5322 field names: printable ASCII without the colon.
fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}
