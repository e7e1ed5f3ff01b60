use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

use crate::{Error, Result};

#[allow(non_camel_case_types)]
enum QuantityUnits {
    None,
    k,
    M,
    G,
    T,
    P,
    E,
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
}

impl QuantityUnits {
    fn new(unit: Option<&str>) -> Option<Self> {
        Some(match unit {
            None => Self::None,
            Some("k") => Self::k,
            Some("M") => Self::M,
            Some("G") => Self::G,
            Some("T") => Self::T,
            Some("P") => Self::P,
            Some("E") => Self::E,
            Some("Ki") => Self::Ki,
            Some("Mi") => Self::Mi,
            Some("Gi") => Self::Gi,
            Some("Ti") => Self::Ti,
            Some("Pi") => Self::Pi,
            Some("Ei") => Self::Ei,
            Some(_) => return None,
        })
    }

    fn multiplier(&self) -> u128 {
        match self {
            Self::None => 1,
            Self::k => 1_000,
            Self::M => 1_000_000,
            Self::G => 1_000_000_000,
            Self::T => 1_000_000_000_000,
            Self::P => 1_000_000_000_000_000,
            Self::E => 1_000_000_000_000_000_000,
            Self::Ki => 1 << 10,
            Self::Mi => 1 << 20,
            Self::Gi => 1 << 30,
            Self::Ti => 1 << 40,
            Self::Pi => 1 << 50,
            Self::Ei => 1 << 60,
        }
    }
}

/// Byte values of storage and memory quantities
pub trait QuantityParser {
    /// Fractional values are rounded up, matching how the apiserver canonicalises them.
    ///
    /// # Errors
    ///
    /// `InvalidQuantity` for unknown units, negative or malformed numbers and overflow
    fn to_bytes(&self) -> Result<u128>;
}

impl QuantityParser for Quantity {
    fn to_bytes(&self) -> Result<u128> {
        static REGEX: OnceLock<Regex> = OnceLock::new();
        let invalid = || Error::InvalidQuantity(self.0.clone());
        let captures = REGEX
            .get_or_init(|| {
                Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([[:alpha:]]{1,2})?$").expect("quantity regex is valid")
            })
            .captures(self.0.trim())
            .ok_or_else(invalid)?;

        let multiplier = QuantityUnits::new(captures.get(2).map(|m| m.as_str()))
            .ok_or_else(invalid)?
            .multiplier();

        let number = &captures[1];
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = whole.parse().map_err(|_| invalid())?;
        let mut bytes = whole.checked_mul(multiplier).ok_or_else(invalid)?;
        if !fraction.is_empty() {
            let scale = 10u128
                .checked_pow(fraction.len() as u32)
                .ok_or_else(invalid)?;
            let fraction: u128 = fraction.parse().map_err(|_| invalid())?;
            let scaled = fraction.checked_mul(multiplier).ok_or_else(invalid)?;
            bytes += scaled.div_ceil(scale);
        }
        Ok(bytes)
    }
}
