use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one test case or one group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Verdict {
    #[default]
    OK,
    WA,
    TLE,
    MLE,
    OLE,
    RE,
    PE,
    PARTIAL,
    SKIP,
    FAIL,
    JE,
    /// Not judged yet; only appears in intermediate saves.
    PENDING,
}

impl Verdict {
    /// Verdicts that earn nothing and block dependent groups.
    pub fn is_zero(self) -> bool {
        !matches!(self, Verdict::OK | Verdict::PARTIAL | Verdict::PENDING)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::OK => "OK",
            Verdict::WA => "WA",
            Verdict::TLE => "TLE",
            Verdict::MLE => "MLE",
            Verdict::OLE => "OLE",
            Verdict::RE => "RE",
            Verdict::PE => "PE",
            Verdict::PARTIAL => "PARTIAL",
            Verdict::SKIP => "SKIP",
            Verdict::FAIL => "FAIL",
            Verdict::JE => "JE",
            Verdict::PENDING => "PENDING",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
