//! Normalized identity records and their validation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::columns::{ColumnMapping, FieldName};
use crate::error::{KycError, KycResult};
use crate::spreadsheet::{RawRow, RawSheet};

/// Which identifier a batch verifies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IdentifierKind {
    /// Permanent Account Number.
    #[default]
    Pan,
    /// Aadhaar number.
    Aadhaar,
}

impl IdentifierKind {
    /// Column holding the identifier.
    #[must_use]
    pub const fn field(self) -> FieldName {
        match self {
            Self::Pan => FieldName::PanNumber,
            Self::Aadhaar => FieldName::AadhaarNumber,
        }
    }

    /// Fields a header must carry for this kind of batch.
    #[must_use]
    pub const fn required_fields(self) -> [FieldName; 2] {
        [self.field(), FieldName::Name]
    }

    /// Canonical form of a raw identifier cell.
    #[must_use]
    pub fn normalize(self, raw: &str) -> String {
        match self {
            Self::Pan => raw.trim().to_ascii_uppercase(),
            Self::Aadhaar => raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect(),
        }
    }

    /// Whether a normalized identifier has the expected shape.
    #[must_use]
    pub fn is_well_formed(self, identifier: &str) -> bool {
        let bytes = identifier.as_bytes();
        match self {
            // AAAAA9999A
            Self::Pan => {
                bytes.len() == 10
                    && bytes[..5].iter().all(u8::is_ascii_uppercase)
                    && bytes[5..9].iter().all(u8::is_ascii_digit)
                    && bytes[9].is_ascii_uppercase()
            }
            Self::Aadhaar => bytes.len() == 12 && bytes.iter().all(u8::is_ascii_digit),
        }
    }
}

/// One spreadsheet row after column mapping and validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// 1-based spreadsheet row number.
    pub row_number: usize,
    /// Kind of `identifier_primary`.
    pub identifier_kind: IdentifierKind,
    /// PAN or Aadhaar, normalized.
    pub identifier_primary: String,
    /// Holder name.
    pub name: String,
    /// Date of birth as it appeared in the sheet.
    pub date_of_birth: Option<String>,
    /// Reason sent to the provider.
    pub reason: Option<String>,
}

impl NormalizedRecord {
    /// Builds a record from a row, or explains why the row must be skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Validation`] when a required value is blank, the
    /// identifier is malformed, or the date of birth cannot be parsed.
    pub fn from_row(
        sheet: &RawSheet,
        row: &RawRow,
        mapping: &ColumnMapping,
        kind: IdentifierKind,
    ) -> KycResult<Self> {
        let value = |field: FieldName| {
            mapping
                .column(field)
                .and_then(|column| sheet.cell(row, column))
        };

        let identifier = value(kind.field())
            .ok_or_else(|| KycError::Validation(format!("missing {}", kind.field())))?;
        let identifier_primary = kind.normalize(identifier);
        if !kind.is_well_formed(&identifier_primary) {
            return Err(KycError::Validation(format!("malformed {}", kind.field())));
        }

        let name = value(FieldName::Name)
            .ok_or_else(|| KycError::Validation(format!("missing {}", FieldName::Name)))?
            .to_string();

        let date_of_birth = value(FieldName::DateOfBirth).map(str::to_string);
        if let Some(dob) = &date_of_birth {
            provider_date_of_birth(dob)?;
        }

        Ok(Self {
            row_number: row.row_number,
            identifier_kind: kind,
            identifier_primary,
            name,
            date_of_birth,
            reason: value(FieldName::Reason).map(str::to_string),
        })
    }

    /// Date of birth in the provider's `dd/mm/yyyy` format.
    ///
    /// # Errors
    ///
    /// See [`provider_date_of_birth`].
    pub fn formatted_date_of_birth(&self) -> KycResult<Option<String>> {
        self.date_of_birth
            .as_deref()
            .map(provider_date_of_birth)
            .transpose()
    }
}

/// Converts `yyyy-mm-dd` into the provider's `dd/mm/yyyy` wire format.
///
/// Input already in `dd/mm/yyyy` is accepted as is.
///
/// # Errors
///
/// Returns [`KycError::Validation`] for anything else.
pub fn provider_date_of_birth(raw: &str) -> KycResult<String> {
    let raw = raw.trim();
    // Spreadsheet exports sometimes carry a midnight time component.
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .map(|date| date.format("%d/%m/%Y").to_string())
        .map_err(|_| KycError::Validation(format!("unparseable date of birth: {raw:?}")))
}
