//! Resolves arbitrary spreadsheet header text into canonical fields.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Canonical field identifiers a spreadsheet column can map to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldName {
    /// Permanent Account Number.
    PanNumber,
    /// Aadhaar number.
    AadhaarNumber,
    /// Name of the holder.
    Name,
    /// Date of birth, raw cell text.
    DateOfBirth,
    /// Free-text reason passed to the provider.
    Reason,
}

impl FieldName {
    /// Header spellings accepted for this field, in priority order.
    #[must_use]
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::PanNumber => &[
                "panNumber",
                "PAN No",
                "PAN",
                "pan",
                "PAN No.",
                "PAN Number",
                "pan_number",
                "Pan Number",
                "Pan No",
            ],
            Self::AadhaarNumber => &[
                "aadhaarNumber",
                "Aadhaar No",
                "Aadhaar",
                "aadhaar",
                "Aadhaar No.",
                "Aadhaar Number",
                "aadhaar_number",
                "UID",
            ],
            Self::Name => &[
                "name",
                "Name",
                "NAME",
                "Full Name",
                "fullName",
                "Name as per PAN",
                "name_as_per_pan",
            ],
            Self::DateOfBirth => &[
                "dateOfBirth",
                "DOB",
                "dob",
                "Date of Birth",
                "date_of_birth",
                "Birth Date",
            ],
            Self::Reason => &["reason", "Reason", "Purpose", "purpose"],
        }
    }

    /// Returns the first alias, in priority order, present in `header`.
    #[must_use]
    pub fn resolve<'a>(self, header: &HashSet<&'a str>) -> Option<&'a str> {
        self.aliases()
            .iter()
            .find_map(|alias| header.get(*alias).copied())
    }
}

/// Result of mapping a header row against a set of required fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    /// Canonical field to the header text that carries it.
    pub mapping: BTreeMap<FieldName, String>,
    /// Required fields with no matching column, in the order requested.
    pub missing: Vec<FieldName>,
}

impl ColumnMapping {
    /// Whether every required field was found.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Header text mapped to `field`, if any.
    #[must_use]
    pub fn column(&self, field: FieldName) -> Option<&str> {
        self.mapping.get(&field).map(String::as_str)
    }

    /// Adds optional fields to the mapping when the header carries them.
    ///
    /// Absent optional fields are not reported as missing.
    pub fn resolve_optional<'a, I>(&mut self, header: I, optional: &[FieldName])
    where
        I: IntoIterator<Item = &'a str>,
    {
        let header: HashSet<&str> = header.into_iter().collect();
        for field in optional {
            if let Some(column) = field.resolve(&header) {
                self.mapping.insert(*field, column.to_string());
            }
        }
    }
}

/// Maps `required` fields onto the columns of `header`.
///
/// Each field takes the first of its aliases present in the header.
/// Matching is exact and case-sensitive.
pub fn map_columns<'a, I>(header: I, required: &[FieldName]) -> ColumnMapping
where
    I: IntoIterator<Item = &'a str>,
{
    let header: HashSet<&str> = header.into_iter().collect();
    let mut result = ColumnMapping::default();
    for field in required {
        match field.resolve(&header) {
            Some(column) => {
                result.mapping.insert(*field, column.to_string());
            }
            None => result.missing.push(*field),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_resolves_common_headers() {
        let mapping = map_columns(["PAN No", "Name"], &[FieldName::PanNumber, FieldName::Name]);
        assert_eq!(mapping.column(FieldName::PanNumber), Some("PAN No"));
        assert_eq!(mapping.column(FieldName::Name), Some("Name"));
        assert!(mapping.missing.is_empty());
        assert!(mapping.is_complete());
    }

    #[test]
    fn test_reports_missing_field() {
        let mapping = map_columns(["Foo"], &[FieldName::PanNumber]);
        assert_eq!(mapping.missing, vec![FieldName::PanNumber]);
        assert!(mapping.mapping.is_empty());
    }

    #[test]
    fn test_priority_order_wins() {
        // "PAN" is declared before "pan" and "PAN Number".
        let mapping = map_columns(["PAN Number", "pan", "PAN"], &[FieldName::PanNumber]);
        assert_eq!(mapping.column(FieldName::PanNumber), Some("PAN"));
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let mapping = map_columns(["pAn"], &[FieldName::PanNumber]);
        assert_eq!(mapping.missing, vec![FieldName::PanNumber]);
    }

    #[test]
    fn test_deterministic_for_same_header() {
        let header = ["DOB", "Full Name", "Aadhaar Number", "Reason"];
        let required = [FieldName::AadhaarNumber, FieldName::Name];
        assert_eq!(map_columns(header, &required), map_columns(header, &required));
    }

    #[test]
    fn test_optional_fields_are_not_missing() {
        let header = ["panNumber", "name", "Date of Birth"];
        let mut mapping = map_columns(header, &[FieldName::PanNumber, FieldName::Name]);
        mapping.resolve_optional(header, &[FieldName::DateOfBirth, FieldName::Reason]);
        assert_eq!(mapping.column(FieldName::DateOfBirth), Some("Date of Birth"));
        assert_eq!(mapping.column(FieldName::Reason), None);
        assert!(mapping.is_complete());
    }

    #[test]
    fn test_field_name_strings() {
        assert_eq!(FieldName::PanNumber.to_string(), "pan_number");
        assert_eq!(FieldName::from_str("date_of_birth").unwrap(), FieldName::DateOfBirth);
    }
}
