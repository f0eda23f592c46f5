use crate::sandbox::RawOutcome;
use serde::{Deserialize, Serialize};

/// Abort raised by the stack-protector check (`__stack_chk_fail`).
pub const SIGABRT: i32 = 6;
/// Bus error from an unaligned or otherwise invalid return address.
pub const SIGBUS: i32 = 7;
/// Memory fault reached without the canary check firing.
pub const SIGSEGV: i32 = 11;

/// Severity of a category on the `Safe < CanaryDetected < Bypassed` axis.
pub const SEV_SAFE: u8 = 0;
pub const SEV_DETECTED: u8 = 1;
pub const SEV_BYPASSED: u8 = 2;

/// Semantic category of one candidate execution.
///
/// Collapsing raw exit/signal data into these six buckets gives the search
/// engine a total-order proxy over `Safe < CanaryDetected < Bypassed` while
/// quarantining noise (`AppError`, `OtherFault`, `Inconclusive`) so it never
/// silently corrupts a binary search.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Normal exit with code 0.
    Safe,
    /// The canary check fired: SIGABRT, or exit status 134.
    CanaryDetected,
    /// Memory fault with no prior abort: SIGSEGV/SIGBUS, or statuses 139/135.
    Bypassed,
    /// The candidate was killed at the timeout.
    Inconclusive,
    /// Non-zero exit without a fault signal (bad arguments, usage errors).
    AppError,
    /// Terminated by some other signal (illegal instruction, FPE, ...).
    OtherFault,
}

impl Category {
    /// Position on the severity axis, or `None` for the quarantined noise
    /// categories that must never steer the search.
    pub fn severity(&self) -> Option<u8> {
        match self {
            Category::Safe => Some(SEV_SAFE),
            Category::CanaryDetected => Some(SEV_DETECTED),
            Category::Bypassed => Some(SEV_BYPASSED),
            Category::Inconclusive | Category::AppError | Category::OtherFault => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Safe => "SAFE",
            Category::CanaryDetected => "CANARY_DETECTED",
            Category::Bypassed => "BYPASSED",
            Category::Inconclusive => "INCONCLUSIVE",
            Category::AppError => "APP_ERROR",
            Category::OtherFault => "OTHER_FAULT",
        }
    }
}

/// Maps a raw termination outcome to its semantic category.
///
/// Pure function of the outcome record; captured output is deliberately
/// ignored because it is unreliable under memory-corruption crashes.
pub fn classify(outcome: &RawOutcome) -> Category {
    if outcome.timed_out {
        return Category::Inconclusive;
    }
    if let Some(signal) = outcome.termination_signal() {
        return match signal {
            SIGABRT => Category::CanaryDetected,
            SIGSEGV | SIGBUS => Category::Bypassed,
            _ => Category::OtherFault,
        };
    }
    match outcome.exit_code {
        Some(0) => Category::Safe,
        Some(_) => Category::AppError,
        // Exited without a code or a signal; nothing to conclude from it.
        None => Category::Inconclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outcome(exit_code: Option<i32>, signal: Option<i32>, timed_out: bool) -> RawOutcome {
        RawOutcome {
            exit_code,
            signal,
            timed_out,
            elapsed: Duration::from_millis(5),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    #[test]
    fn clean_exit_is_safe() {
        assert_eq!(classify(&outcome(Some(0), None, false)), Category::Safe);
    }

    #[test]
    fn abort_means_the_canary_fired() {
        assert_eq!(
            classify(&outcome(None, Some(SIGABRT), false)),
            Category::CanaryDetected
        );
        // Shell convention: exit status 134 = 128 + SIGABRT.
        assert_eq!(
            classify(&outcome(Some(134), None, false)),
            Category::CanaryDetected
        );
    }

    #[test]
    fn memory_faults_are_bypasses() {
        assert_eq!(
            classify(&outcome(None, Some(SIGSEGV), false)),
            Category::Bypassed
        );
        assert_eq!(
            classify(&outcome(None, Some(SIGBUS), false)),
            Category::Bypassed
        );
        assert_eq!(
            classify(&outcome(Some(139), None, false)),
            Category::Bypassed
        );
        assert_eq!(
            classify(&outcome(Some(135), None, false)),
            Category::Bypassed
        );
    }

    #[test]
    fn timeout_is_inconclusive() {
        assert_eq!(
            classify(&outcome(None, None, true)),
            Category::Inconclusive
        );
    }

    #[test]
    fn plain_nonzero_exit_is_an_app_error() {
        assert_eq!(classify(&outcome(Some(1), None, false)), Category::AppError);
        assert_eq!(
            classify(&outcome(Some(127), None, false)),
            Category::AppError
        );
    }

    #[test]
    fn unexpected_signals_are_other_faults() {
        // SIGILL
        assert_eq!(
            classify(&outcome(None, Some(4), false)),
            Category::OtherFault
        );
    }

    #[test]
    fn severity_orders_the_meaningful_categories() {
        assert!(Category::Safe.severity() < Category::CanaryDetected.severity());
        assert!(Category::CanaryDetected.severity() < Category::Bypassed.severity());
        assert_eq!(Category::Inconclusive.severity(), None);
        assert_eq!(Category::AppError.severity(), None);
        assert_eq!(Category::OtherFault.severity(), None);
    }
}
