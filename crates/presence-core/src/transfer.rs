//! File transfer offers.
//!
//! Two transfer methods share a common record:
//! - [`OobTransfer`] - out-of-band, retrieved by fetching a URL
//! - [`Socks5Transfer`] - in-band, retrieved through a SOCKS5 bytestream
//!
//! Offers are assembled field by field while the stanza is parsed, so every
//! field starts out unset. An offer is only retrievable once
//! [`Transfer::validate`] confirms that each required field of its variant
//! has been filled in.

use std::fmt;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Common record
// ============================================================================

/// Fields shared by every transfer method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferInfo {
    /// File name (SOCKS5) or resource URL (OOB)
    pub filename: Option<String>,

    /// Announced size in bytes
    pub filesize: Option<u64>,

    /// Requester, i.e. the local endpoint
    pub identity: Option<String>,

    /// Offerer, i.e. the remote endpoint
    pub other: Option<String>,
}

impl TransferInfo {
    /// Creates a record seeded with the endpoint names.
    pub fn between(identity: impl Into<String>, other: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            other: Some(other.into()),
            ..Self::default()
        }
    }

    fn collect_missing(&self, missing: &mut Vec<&'static str>) {
        if self.filename.is_none() {
            missing.push("filename");
        }
        if self.filesize.is_none() {
            missing.push("filesize");
        }
        if self.identity.is_none() {
            missing.push("identity");
        }
        if self.other.is_none() {
            missing.push("other");
        }
    }
}

/// Out-of-band transfer: the file is fetched from `info.filename` as a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OobTransfer {
    pub info: TransferInfo,

    /// Present when the offer came as an IQ request, absent for the
    /// message-extension form. Only IQ offers get a success/failure reply.
    pub iq_id: Option<String>,
}

/// A SOCKS5 proxy candidate offered by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHost {
    pub host: String,
    pub port: u16,
    pub jid: String,
}

/// In-band transfer through one of the offered SOCKS5 stream hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Socks5Transfer {
    pub info: TransferInfo,

    /// Bytestream session id
    pub sid: Option<String>,

    /// Id of the IQ request carrying the offer
    pub iq_id: Option<String>,

    /// Candidates, tried in listed order
    pub streamhosts: Vec<StreamHost>,
}

// ============================================================================
// Transfer
// ============================================================================

/// Transfer method discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Oob,
    Socks5,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oob => write!(f, "OOB"),
            Self::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

/// A file transfer offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Oob(OobTransfer),
    Socks5(Socks5Transfer),
}

impl Transfer {
    pub fn kind(&self) -> TransferKind {
        match self {
            Self::Oob(_) => TransferKind::Oob,
            Self::Socks5(_) => TransferKind::Socks5,
        }
    }

    pub fn info(&self) -> &TransferInfo {
        match self {
            Self::Oob(t) => &t.info,
            Self::Socks5(t) => &t.info,
        }
    }

    pub fn info_mut(&mut self) -> &mut TransferInfo {
        match self {
            Self::Oob(t) => &mut t.info,
            Self::Socks5(t) => &mut t.info,
        }
    }

    /// Id of the IQ request the offer arrived in, if any.
    pub fn iq_id(&self) -> Option<&str> {
        match self {
            Self::Oob(t) => t.iq_id.as_deref(),
            Self::Socks5(t) => t.iq_id.as_deref(),
        }
    }

    /// Names of the required fields that are still unset.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        self.info().collect_missing(&mut missing);
        if let Self::Socks5(t) = self {
            if t.sid.is_none() {
                missing.push("sid");
            }
            if t.iq_id.is_none() {
                missing.push("iq_id");
            }
            if t.streamhosts.is_empty() {
                missing.push("streamhosts");
            }
        }
        missing
    }

    /// Checks that every required field of this variant is set.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::IncompleteTransfer` listing the unset fields.
    pub fn validate(&self) -> DomainResult<()> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DomainError::IncompleteTransfer {
                kind: self.kind(),
                missing: missing.join(", "),
            })
        }
    }

    /// Name under which the file is stored in the download directory.
    ///
    /// Only the final path component is kept (query and fragment are dropped
    /// from OOB URLs first).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFileName` when no usable name remains.
    pub fn local_file_name(&self) -> DomainResult<String> {
        let raw = self.info().filename.as_deref().unwrap_or_default();
        let path = match self {
            Self::Oob(_) => raw.split(['?', '#']).next().unwrap_or_default(),
            Self::Socks5(_) => raw,
        };
        base_name(path).ok_or_else(|| DomainError::InvalidFileName {
            name: raw.to_string(),
        })
    }
}

/// Final component of a `/`- or `\`-separated path.
fn base_name(path: &str) -> Option<String> {
    let name = path.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        _ => Some(name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_socks5() -> Socks5Transfer {
        Socks5Transfer {
            info: TransferInfo {
                filename: Some("notes.txt".into()),
                filesize: Some(12),
                identity: Some("me".into()),
                other: Some("you".into()),
            },
            sid: Some("s1".into()),
            iq_id: Some("iq1".into()),
            streamhosts: vec![StreamHost {
                host: "127.0.0.1".into(),
                port: 7777,
                jid: "proxy".into(),
            }],
        }
    }

    #[test]
    fn test_complete_socks5_validates() {
        let transfer = Transfer::Socks5(complete_socks5());
        assert!(transfer.validate().is_ok());
        assert_eq!(transfer.kind(), TransferKind::Socks5);
        assert_eq!(transfer.iq_id(), Some("iq1"));
    }

    #[test]
    fn test_incomplete_socks5_lists_missing_fields() {
        let mut inner = complete_socks5();
        inner.sid = None;
        inner.info.filesize = None;
        inner.streamhosts.clear();

        let transfer = Transfer::Socks5(inner);
        assert_eq!(
            transfer.missing_fields(),
            vec!["filesize", "sid", "streamhosts"]
        );
        match transfer.validate() {
            Err(DomainError::IncompleteTransfer { kind, missing }) => {
                assert_eq!(kind, TransferKind::Socks5);
                assert_eq!(missing, "filesize, sid, streamhosts");
            }
            other => panic!("Expected IncompleteTransfer, got {other:?}"),
        }
    }

    #[test]
    fn test_oob_iq_id_is_optional() {
        let mut info = TransferInfo::between("me", "you");
        info.filename = Some("http://host/file.bin".into());
        info.filesize = Some(3);
        let transfer = Transfer::Oob(OobTransfer { info, iq_id: None });
        assert!(transfer.validate().is_ok());
        assert_eq!(transfer.iq_id(), None);
    }

    #[test]
    fn test_local_file_name_keeps_last_component() {
        let mut socks = complete_socks5();
        socks.info.filename = Some("../../etc/passwd".into());
        assert_eq!(
            Transfer::Socks5(socks).local_file_name(),
            Ok("passwd".to_string())
        );

        let mut info = TransferInfo::between("me", "you");
        info.filename = Some("http://host/dir/report.pdf?token=abc#page".into());
        let oob = Transfer::Oob(OobTransfer { info, iq_id: None });
        assert_eq!(oob.local_file_name(), Ok("report.pdf".to_string()));
    }

    #[test]
    fn test_local_file_name_rejects_directories() {
        for name in ["", "dir/", "..", "a/.", "http://host/"] {
            let mut socks = complete_socks5();
            socks.info.filename = Some(name.into());
            assert!(
                Transfer::Socks5(socks).local_file_name().is_err(),
                "{name:?} should be rejected"
            );
        }
    }
}
