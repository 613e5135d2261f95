//! Per-equipment booking requirements: the typed questions a user must
//! answer before a reservation can be confirmed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The kinds of answer a requirement can demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementKind {
    Text,
    Integer,
    Number,
    /// Temperature in celsius.
    Temperature,
    /// Spin speed in rpm.
    SpinSpeed,
}

impl RequirementKind {
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Self::Temperature => Some("celsius"),
            Self::SpinSpeed => Some("rpm"),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Text)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "whole number",
            Self::Number => "number",
            Self::Temperature => "temperature in celsius",
            Self::SpinSpeed => "spin speed in rpm",
        }
    }
}

/// One clause of an allowed-value spec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AllowedValue {
    Exactly(f64),
    Between(f64, f64),
    AtLeast(f64),
}

impl AllowedValue {
    fn matches(&self, value: f64) -> bool {
        match *self {
            AllowedValue::Exactly(v) => v == value,
            AllowedValue::Between(lo, hi) => value >= lo && value <= hi,
            AllowedValue::AtLeast(lo) => value >= lo,
        }
    }
}

/// Admin-authored restriction on the values an answer may take. Parsed from
/// a spec string: `all` (or empty) matches everything, otherwise a
/// comma-separated mix of numbers (`10, 20`), ranges (`10-40`) and open
/// ranges (`30+`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllowedValues {
    clauses: Vec<AllowedValue>,
}

impl AllowedValues {
    /// Matches every value.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(spec: &str) -> Result<Self, String> {
        let spec = spec.trim().to_lowercase();
        if spec.is_empty() || spec == "all" {
            return Ok(Self::any());
        }

        let mut clauses = Vec::new();
        for token in spec.split(',') {
            let token: String = token.chars().filter(|c| !c.is_whitespace()).collect();
            if token.is_empty() {
                continue;
            }
            clauses.push(parse_clause(&token).ok_or_else(|| {
                format!(
                    "Cannot understand the range of values in '{spec}'. You should either \
                     provide a comma-separated list of numbers (e.g. '10, 20, 30, 40'), or \
                     ranges of numbers (e.g. '10-40') or use '+' to indicate all numbers \
                     greater than a value (e.g. '30+'), or use 'all' to indicate matching \
                     all values."
                )
            })?);
        }

        Ok(Self { clauses })
    }

    pub fn is_unbounded(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn is_valid(&self, value: f64) -> bool {
        self.is_unbounded() || self.clauses.iter().any(|c| c.matches(value))
    }

    /// Render the spec back out, optionally suffixing each number with a unit.
    pub fn describe(&self, unit: Option<&str>) -> Option<String> {
        if self.is_unbounded() {
            return None;
        }
        let fmt = |v: f64| match unit {
            Some(u) => format!("{v} {u}"),
            None => format!("{v}"),
        };
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| match *c {
                AllowedValue::Exactly(v) => fmt(v),
                AllowedValue::Between(lo, hi) => format!("{} - {}", fmt(lo), fmt(hi)),
                AllowedValue::AtLeast(lo) => match unit {
                    Some(u) => format!("{lo}+ {u}"),
                    None => format!("{lo}+"),
                },
            })
            .collect();
        Some(parts.join(", "))
    }

    /// Help text shown next to the input box.
    pub fn help(&self, unit: Option<&str>) -> String {
        match self.describe(None) {
            Some(values) => match unit {
                Some(u) => format!("value in units of {u}, allowed values are [ {values} ]"),
                None => format!("allowed values are [ {values} ]"),
            },
            None => "type here...".to_string(),
        }
    }
}

/// Parse a single spec token: `N`, `N-M` or `N+`. Whitespace already removed.
fn parse_clause(token: &str) -> Option<AllowedValue> {
    if let Some(prefix) = token.strip_suffix('+') {
        return prefix.parse::<f64>().ok().map(AllowedValue::AtLeast);
    }
    if let Ok(v) = token.parse::<f64>() {
        return Some(AllowedValue::Exactly(v));
    }
    // A range: split at a '-' that follows a digit or '.', so negative
    // bounds like "-10--5" parse correctly.
    let bytes = token.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b'-' && (bytes[i - 1].is_ascii_digit() || bytes[i - 1] == b'.') {
            let lo: f64 = token[..i].parse().ok()?;
            let hi: f64 = token[i + 1..].parse().ok()?;
            return Some(if lo == hi {
                AllowedValue::Exactly(lo)
            } else if lo < hi {
                AllowedValue::Between(lo, hi)
            } else {
                AllowedValue::Between(hi, lo)
            });
        }
    }
    None
}

/// A named, typed question the booking user must answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub kind: RequirementKind,
    pub allowed: AllowedValues,
    pub help: Option<String>,
}

impl Requirement {
    pub fn new(name: impl Into<String>, kind: RequirementKind, allowed: AllowedValues) -> Self {
        Self {
            name: name.into(),
            kind,
            allowed,
            help: None,
        }
    }

    /// Validate one user-supplied answer, returning the canonical value.
    pub fn check(&self, raw: &str) -> Result<String, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(format!("You must supply a value for '{}'", self.name));
        }
        if !self.kind.is_numeric() {
            return Ok(raw.to_string());
        }

        let mut value = raw.to_string();
        if let Some(unit) = self.kind.unit() {
            value = value.replace(unit, "");
        }
        let value = value.trim();

        let number: f64 = value.parse().map_err(|_| {
            format!(
                "'{raw}' is not a valid {} for '{}'",
                self.kind.describe(),
                self.name
            )
        })?;

        if self.kind == RequirementKind::Integer && number.fract() != 0.0 {
            return Err(format!(
                "'{raw}' is not a whole number, which '{}' requires",
                self.name
            ));
        }

        if !self.allowed.is_valid(number) {
            return Err(format!(
                "'{raw}' is not an allowed value for '{}' ({})",
                self.name,
                self.allowed.help(self.kind.unit())
            ));
        }

        Ok(value.to_string())
    }
}

/// A user's validated answer to one requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementValue {
    pub name: String,
    pub value: String,
}

/// The ordered questionnaire attached to a piece of equipment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequirementSet {
    pub introduction: Option<String>,
    /// When set, confirmed bookings additionally require an administrator's
    /// authorization before they count.
    pub needs_authorization: bool,
    pub fields: Vec<Requirement>,
}

impl RequirementSet {
    /// Add a requirement, or update it in place if the name already exists.
    pub fn set(&mut self, requirement: Requirement) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == requirement.name) {
            *existing = requirement;
        } else {
            self.fields.push(requirement);
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|f| f.name != name);
        self.fields.len() != before
    }

    pub fn move_up(&mut self, name: &str) {
        if let Some(pos) = self.fields.iter().position(|f| f.name == name)
            && pos > 0
        {
            self.fields.swap(pos, pos - 1);
        }
    }

    pub fn move_down(&mut self, name: &str) {
        if let Some(pos) = self.fields.iter().position(|f| f.name == name)
            && pos + 1 < self.fields.len()
        {
            self.fields.swap(pos, pos + 1);
        }
    }

    /// Validate the full set of answers. Every requirement must be answered
    /// and every answer must pass its spec; all failures are collected so the
    /// user can fix the whole form in one round trip.
    pub fn validate_answers(
        &self,
        answers: &HashMap<String, String>,
    ) -> Result<Vec<RequirementValue>, Vec<String>> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut errors = Vec::new();

        for field in &self.fields {
            match answers.get(&field.name) {
                None => errors.push(format!("You must supply a value for '{}'", field.name)),
                Some(raw) => match field.check(raw) {
                    Ok(value) => values.push(RequirementValue {
                        name: field.name.clone(),
                        value,
                    }),
                    Err(e) => errors.push(e),
                },
            }
        }

        if errors.is_empty() { Ok(values) } else { Err(errors) }
    }
}
