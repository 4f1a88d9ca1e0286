//! Forensic decode reports.
//!
//! The debug walk never fails fast: whatever can be read is recorded, and
//! failures are captured with the byte offset where decoding stopped
//! making sense. Used to inspect corrupted records pulled from storage.

use crate::error::Error;
use crate::typetag::TypeTag;
use crate::value::Value;

/// Where and why a decode step failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeFailure {
    pub offset: usize,
    pub message: String,
}

/// Outcome of walking one header entry and its value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldReport {
    /// Literal field name, or the resolved global property name.
    pub name: Option<String>,
    /// Set when the header carried a negated global property id.
    pub global_id: Option<u32>,
    pub tag: Option<TypeTag>,
    /// Offset of the value bytes, when the entry points at any.
    pub value_offset: Option<usize>,
    pub value: Option<Value>,
    pub failure: Option<DecodeFailure>,
}

impl FieldReport {
    pub fn fail(&mut self, offset: usize, err: &Error) {
        self.failure = Some(DecodeFailure {
            offset,
            message: err.to_string(),
        });
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodeReport {
    pub version: Option<u8>,
    pub class_name: Option<String>,
    pub fields: Vec<FieldReport>,
    /// A failure outside any single field (truncated header, unknown
    /// version). Ends the walk.
    pub failure: Option<DecodeFailure>,
}

impl DecodeReport {
    pub fn fail(&mut self, offset: usize, err: &Error) {
        self.failure = Some(DecodeFailure {
            offset,
            message: err.to_string(),
        });
    }

    /// True when every header entry decoded cleanly end to end.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none() && self.fields.iter().all(|f| f.failure.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_only_without_failures() {
        let mut report = DecodeReport::default();
        assert!(report.is_clean());
        report.fields.push(FieldReport {
            name: Some("ok".into()),
            ..FieldReport::default()
        });
        assert!(report.is_clean());
        let mut bad = FieldReport::default();
        bad.fail(7, &Error::UnknownVersion(9));
        report.fields.push(bad);
        assert!(!report.is_clean());
        assert_eq!(report.fields[1].failure.as_ref().unwrap().offset, 7);
    }
}
