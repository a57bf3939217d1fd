//! TLS-aware transcript recorder (C2): wraps an existing TLS engine and
//! exposes an append-only record stream tagged by sender, type, and reveal
//! policy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordType {
    Handshake,
    ApplicationData,
    Alert,
    ChangeCipherSpec,
}

/// One TLS record on the wire, decrypted. For TLS1.3 application-data
/// records the trailing content-type byte has already been stripped from
/// `plaintext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordContext {
    pub sender: Sender,
    pub record_type: RecordType,
    pub plaintext: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub iv_or_nonce: Vec<u8>,
    pub sequence_number: u64,
}

/// How a record's plaintext is disclosed to the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RevealDescriptor {
    /// Reveal the full plaintext of this record.
    Complete,
    /// Reveal only positions where `redacted_plaintext[i] != REDACTION_BYTE`.
    Zk { redacted_plaintext: Vec<u8> },
    /// Reveal an OPRF nullifier in place of a byte range.
    Toprf {
        nullifier: Vec<u8>,
        responses: Vec<Vec<u8>>,
        mask: Vec<u8>,
        data_location: std::ops::Range<usize>,
        plaintext: Vec<u8>,
    },
    /// Record stays fully hidden.
    Absent,
}

/// How request bytes get partitioned into revealable vs unrevealable groups
/// as they're written to the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteRedactionMode {
    /// TLS1.3: force a key update at each redaction boundary so redacted
    /// partitions are sealed under keys never shared with the verifier.
    KeyUpdate,
    /// Send the full request under one key, then mark a `Zk` reveal
    /// descriptor for the client-side records.
    Zk,
}

impl WriteRedactionMode {
    /// TLS1.2 has no traffic key update; the mode is always forced to `Zk`
    /// regardless of caller preference (see DESIGN.md Open Question 3).
    pub fn for_tls_version(preferred: WriteRedactionMode, version: TlsVersion) -> WriteRedactionMode {
        match version {
            TlsVersion::V1_2 => WriteRedactionMode::Zk,
            TlsVersion::V1_3 => preferred,
        }
    }
}

/// An append-only, wire-ordered sequence of TLS records, each eventually
/// paired with a reveal descriptor once C6 has planned redactions.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    records: Vec<RecordContext>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record in wire order. Never removes or reorders.
    pub fn push(&mut self, record: RecordContext) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[RecordContext] {
        &self.records
    }

    pub fn client_records(&self) -> impl Iterator<Item = &RecordContext> {
        self.records.iter().filter(|r| r.sender == Sender::Client)
    }

    pub fn server_records(&self) -> impl Iterator<Item = &RecordContext> {
        self.records.iter().filter(|r| r.sender == Sender::Server)
    }

    /// Index of the first application-data record, if any -- handshake
    /// records before it must always be revealed (§4.C7 step 6).
    pub fn first_application_data_index(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.record_type == RecordType::ApplicationData)
    }
}

/// Redact headers in place by name, matching the proxy's at-rest censoring
/// discipline: values are replaced with an equal-length run of `X`s rather
/// than removed, so byte-length-sensitive callers see a stable shape.
pub fn censor_headers(headers: &mut [(String, String)], names_to_censor: &[String]) {
    for (name, value) in headers.iter_mut() {
        if names_to_censor.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            *value = "X".repeat(value.len());
        }
    }
}
