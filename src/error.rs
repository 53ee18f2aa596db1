use crate::types::Mpt;
use std::fmt;

#[derive(Debug)]
pub enum FlowBreakError {
    InvalidConfiguration(String),
    ContentOverflow { part: usize, amount: Mpt },
    InconsistentBreakRequest(String),
    EmptyFlowSet,
    Io(std::io::Error),
}

impl fmt::Display for FlowBreakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowBreakError::InvalidConfiguration(message) => {
                write!(f, "invalid configuration: {}", message)
            }
            FlowBreakError::ContentOverflow { part, amount } => {
                write!(
                    f,
                    "content overflows part {} by {}mpt and the overflow policy is error",
                    part,
                    amount.to_milli()
                )
            }
            FlowBreakError::InconsistentBreakRequest(message) => {
                write!(f, "inconsistent break request: {}", message)
            }
            FlowBreakError::EmptyFlowSet => write!(f, "no flows provided to break"),
            FlowBreakError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for FlowBreakError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlowBreakError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FlowBreakError {
    fn from(value: std::io::Error) -> Self {
        FlowBreakError::Io(value)
    }
}
