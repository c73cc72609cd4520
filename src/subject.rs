//! Enrolled subject identities.
//!
//! The recognition service only knows subjects by an opaque name. easyID
//! registers every subject under its canonical string
//! `"Last, First (IdNumber) [Grade]"`, so the name that comes back in a match
//! can be parsed into a [`SubjectIdentity`] again.

use std::fmt;
use std::str::FromStr;

use crate::error::SubjectError;

/// School grade, 0 (kindergarten) through 12, with 13 reserved for staff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Grade(u8);

impl Grade {
    pub const STAFF: Grade = Grade(13);
    pub const MAX: u8 = 13;

    pub fn new(value: u8) -> Result<Self, SubjectError> {
        if value > Self::MAX {
            return Err(SubjectError::InvalidGrade(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_staff(self) -> bool {
        self == Self::STAFF
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_staff() {
            f.write_str("T")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Grade {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("t") {
            return Ok(Self::STAFF);
        }
        let value: u8 = trimmed
            .parse()
            .map_err(|_| SubjectError::InvalidGrade(s.to_string()))?;
        Self::new(value).map_err(|_| SubjectError::InvalidGrade(s.to_string()))
    }
}

/// A validated subject. Ordering is by last name, then first name, then id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectIdentity {
    last_name: String,
    first_name: String,
    id_number: String,
    grade: Grade,
}

impl SubjectIdentity {
    pub fn new(
        last_name: impl Into<String>,
        first_name: impl Into<String>,
        id_number: impl Into<String>,
        grade: Grade,
    ) -> Result<Self, SubjectError> {
        let last_name = last_name.into().trim().to_string();
        let first_name = first_name.into().trim().to_string();
        let id_number = id_number.into().trim().to_string();

        if last_name.is_empty() {
            return Err(SubjectError::EmptyName { field: "last name" });
        }
        if first_name.is_empty() {
            return Err(SubjectError::EmptyName {
                field: "first name",
            });
        }
        if last_name.contains(',') {
            return Err(SubjectError::CommaInLastName(last_name));
        }
        if id_number.is_empty() || !id_number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SubjectError::InvalidIdNumber(id_number));
        }

        Ok(Self {
            last_name,
            first_name,
            id_number,
            grade,
        })
    }

    /// Parse the canonical `"Last, First (IdNumber) [Grade]"` form.
    ///
    /// Fields are peeled off from the right so first names may contain
    /// parentheses or brackets.
    pub fn parse(input: &str) -> Result<Self, SubjectError> {
        let body = input
            .trim()
            .strip_suffix(']')
            .ok_or_else(|| SubjectError::malformed(input, "missing closing ']'"))?;
        let (rest, grade) = body
            .rsplit_once(" [")
            .ok_or_else(|| SubjectError::malformed(input, "missing grade"))?;
        let rest = rest
            .strip_suffix(')')
            .ok_or_else(|| SubjectError::malformed(input, "missing closing ')'"))?;
        let (names, id_number) = rest
            .rsplit_once(" (")
            .ok_or_else(|| SubjectError::malformed(input, "missing id number"))?;
        let (last_name, first_name) = names
            .split_once(", ")
            .ok_or_else(|| SubjectError::malformed(input, "missing ', ' between names"))?;

        let grade: Grade = grade.parse()?;
        Self::new(last_name, first_name, id_number, grade)
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn id_number(&self) -> &str {
        &self.id_number
    }

    pub fn grade(&self) -> Grade {
        self.grade
    }
}

impl fmt::Display for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {} ({}) [{}]",
            self.last_name, self.first_name, self.id_number, self.grade
        )
    }
}

impl FromStr for SubjectIdentity {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(value: u8) -> Grade {
        Grade::new(value).unwrap()
    }

    #[test]
    fn formats_canonical_string() {
        let subject = SubjectIdentity::new("Doe", "Jane", "00042", grade(7)).unwrap();
        assert_eq!(subject.to_string(), "Doe, Jane (00042) [7]");

        let staff = SubjectIdentity::new("Smith", "Al", "9", Grade::STAFF).unwrap();
        assert_eq!(staff.to_string(), "Smith, Al (9) [T]");
    }

    #[test]
    fn canonical_string_round_trips_for_every_grade() {
        for value in 0..=Grade::MAX {
            let subject = SubjectIdentity::new("O'Neil", "Mary Ann", "000123", grade(value))
                .unwrap();
            let parsed = SubjectIdentity::parse(&subject.to_string()).unwrap();
            assert_eq!(parsed, subject);
        }
    }

    #[test]
    fn staff_grade_parses_from_t() {
        let parsed = SubjectIdentity::parse("Smith, Al (9) [T]").unwrap();
        assert_eq!(parsed.grade(), Grade::STAFF);
        assert_eq!(parsed.grade().value(), 13);
    }

    #[test]
    fn leading_zeros_in_id_are_preserved() {
        let parsed = SubjectIdentity::parse("Doe, Jane (000042) [3]").unwrap();
        assert_eq!(parsed.id_number(), "000042");
    }

    #[test]
    fn first_name_may_contain_parentheses() {
        let parsed = SubjectIdentity::parse("Doe, Jane (JJ) (12) [4]").unwrap();
        assert_eq!(parsed.first_name(), "Jane (JJ)");
        assert_eq!(parsed.id_number(), "12");
    }

    #[test]
    fn rejects_non_numeric_id() {
        let err = SubjectIdentity::parse("Doe, Jane (A12) [4]").unwrap_err();
        assert_eq!(err, SubjectError::InvalidIdNumber("A12".into()));
    }

    #[test]
    fn rejects_grade_out_of_range() {
        let err = SubjectIdentity::parse("Doe, Jane (12) [14]").unwrap_err();
        assert_eq!(err, SubjectError::InvalidGrade("14".into()));
        assert!(Grade::new(14).is_err());
    }

    #[test]
    fn rejects_malformed_strings() {
        for input in [
            "",
            "Jane Doe",
            "Doe, Jane (12)",
            "Doe, Jane [4]",
            "Doe Jane (12) [4]",
            ", Jane (12) [4]",
        ] {
            assert!(SubjectIdentity::parse(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn orders_by_last_then_first_name() {
        let a = SubjectIdentity::new("Adams", "Zed", "1", grade(1)).unwrap();
        let b = SubjectIdentity::new("Baker", "Amy", "2", grade(1)).unwrap();
        let c = SubjectIdentity::new("Baker", "Ben", "0", grade(1)).unwrap();
        let mut all = vec![c.clone(), a.clone(), b.clone()];
        all.sort();
        assert_eq!(all, vec![a, b, c]);
    }
}
