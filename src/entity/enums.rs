//! Enum-like entities identified by a small integer code
//!
//! Priorities and statuses are never fetched or cached. Two values are equal
//! when their codes are equal, and the remote may send either the code or
//! the name.

use crate::error::{NitrateError, NitrateResult};
use serde_json::Value;
use std::fmt;

/// A value drawn from a fixed `(code, name)` table
pub trait CodedEnum: Sized + Copy + Eq {
    /// Class name used in error messages
    const CLASS: &'static str;
    /// Every valid code with its name
    const NAMES: &'static [(i64, &'static str)];

    #[doc(hidden)]
    fn from_code_unchecked(code: i64) -> Self;

    fn code(&self) -> i64;

    fn from_code(code: i64) -> NitrateResult<Self> {
        if Self::NAMES.iter().any(|(c, _)| *c == code) {
            Ok(Self::from_code_unchecked(code))
        } else {
            Err(NitrateError::usage(format!(
                "Invalid {} code: {}",
                Self::CLASS,
                code
            )))
        }
    }

    /// Parse a name, case-insensitively
    fn from_name(name: &str) -> NitrateResult<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(c, _)| Self::from_code_unchecked(*c))
            .ok_or_else(|| NitrateError::usage(format!("Invalid {} name: {}", Self::CLASS, name)))
    }

    fn name(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(c, _)| *c == self.code())
            .map(|(_, n)| *n)
            .unwrap_or("UNKNOWN")
    }

    /// Decode a field value holding either the code or the name
    fn from_value(value: &Value) -> NitrateResult<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(code) => Self::from_code(code),
                None => Err(NitrateError::usage(format!(
                    "Invalid {} code: {}",
                    Self::CLASS,
                    n
                ))),
            },
            Value::String(s) => Self::from_name(s),
            other => Err(NitrateError::usage(format!(
                "Cannot read {} from {}",
                Self::CLASS,
                other
            ))),
        }
    }

    /// Encode as the wire value
    fn to_value(&self) -> Value {
        Value::from(self.code())
    }
}

macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident { $($code:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(i64);

        impl CodedEnum for $name {
            const CLASS: &'static str = stringify!($name);
            const NAMES: &'static [(i64, &'static str)] = &[$(($code, $label)),+];

            fn from_code_unchecked(code: i64) -> Self {
                Self(code)
            }

            fn code(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", CodedEnum::name(self))
            }
        }
    };
}

coded_enum!(
    /// Test case priority
    Priority {
        1 => "P1",
        2 => "P2",
        3 => "P3",
        4 => "P4",
        5 => "P5",
    }
);

coded_enum!(
    /// Test case review status
    CaseStatus {
        1 => "PROPOSED",
        2 => "CONFIRMED",
        3 => "DISABLED",
        4 => "NEED_UPDATE",
    }
);

coded_enum!(
    /// Test run status
    RunStatus {
        0 => "RUNNING",
        1 => "FINISHED",
    }
);

coded_enum!(
    /// Test plan status
    PlanStatus {
        0 => "DISABLED",
        1 => "ENABLED",
    }
);

coded_enum!(
    /// Result of a single case run
    CaseRunStatus {
        1 => "IDLE",
        2 => "PASSED",
        3 => "FAILED",
        4 => "RUNNING",
        5 => "PAUSED",
        6 => "BLOCKED",
        7 => "ERROR",
        8 => "WAIVED",
    }
);
