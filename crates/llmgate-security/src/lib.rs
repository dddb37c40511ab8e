pub mod injection;
pub mod pii;

pub use injection::{scan as scan_injection, InjectionCategory, InjectionScanResult, MatchedPattern};
pub use pii::{scan as scan_pii, PiiFinding, PiiKind, PiiScanOutcome};
