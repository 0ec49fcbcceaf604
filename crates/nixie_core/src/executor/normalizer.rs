//! Result normalizer.
//!
//! The only place raw backend outcomes (exit codes, stderr text, spawn
//! errors, native library errors, timeouts) become an `ExecutionResult`.
//! Whatever comes in, the result satisfies `success == error.is_none()`
//! and every error carries an explanation.

use super::native::NativeError;
use nixie_shared::result::{Backend, ErrorKind, ExecutionError, ExecutionResult};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Max bytes of output kept per stream
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Everything an adapter can hand over.
#[derive(Debug)]
pub enum RawOutcome {
    /// The tool ran to completion (or was killed by a signal: `code == None`)
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    SpawnFailed {
        program: String,
        error: std::io::Error,
    },
    TimedOut {
        after: Duration,
        pid: Option<u32>,
        partial_output: String,
    },
    Native(Result<String, NativeError>),
    /// Refused before anything ran
    Refused(ExecutionError),
}

struct StderrPattern {
    regex: Regex,
    kind: ErrorKind,
    explanation: &'static str,
}

// (pattern, kind, explanation). First match wins.
const STDERR_TABLE: &[(&str, ErrorKind, &str)] = &[
    (
        r"attribute '[^']*' missing|does not provide attribute|selector '[^']*' matches no derivations",
        ErrorKind::PackageNotFound,
        "That package isn't in nixpkgs. Check the spelling, or search for it first.",
    ),
    (
        r"(?:package|attribute) '[^']*' (?:was )?not found|flake '[^']*' does not exist",
        ErrorKind::PackageNotFound,
        "That package couldn't be found. Check the spelling, or search for it first.",
    ),
    (
        r"permission denied|operation not permitted|must be (?:run as )?root|eacces",
        ErrorKind::PermissionDenied,
        "This change needs administrator rights. Run it again with sudo.",
    ),
    (
        r"collision between",
        ErrorKind::ConflictingState,
        "Two packages want to install the same file. Remove one of them first.",
    ),
    (
        r"(?:could not|unable to) (?:acquire|get) (?:the )?lock|waiting for (?:the big garbage collector )?lock|database is (?:locked|busy)|is locked|already in use",
        ErrorKind::ConflictingState,
        "Another Nix operation is running right now. Wait for it to finish and try again.",
    ),
    (
        r"generation \d+ does not exist",
        ErrorKind::MalformedInput,
        "There is no generation with that number. List generations to see which exist.",
    ),
    (
        r"syntax error|undefined variable|the option `?[^ ]*`? does not exist|value is .* while .* was expected",
        ErrorKind::MalformedInput,
        "The system configuration has an error, so nothing was changed. The details point at the line.",
    ),
    (
        r"no space left on device",
        ErrorKind::Unknown,
        "The disk is full. Free some space (try 'collect garbage') and run it again.",
    ),
    (
        r"unable to download|could not resolve host|network is unreachable|ssl (?:connect )?error",
        ErrorKind::Unknown,
        "Couldn't reach the package servers. Check the network connection.",
    ),
    (
        r"builder for '[^']*' failed",
        ErrorKind::Unknown,
        "A package failed to build. The build log below has the details.",
    ),
];

fn stderr_patterns() -> &'static [StderrPattern] {
    static PATTERNS: OnceLock<Vec<StderrPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        STDERR_TABLE
            .iter()
            .filter_map(|(pattern, kind, explanation)| {
                match Regex::new(&format!("(?i){}", pattern)) {
                    Ok(regex) => Some(StderrPattern {
                        regex,
                        kind: *kind,
                        explanation: *explanation,
                    }),
                    Err(e) => {
                        warn!("Skipping bad stderr pattern {}: {}", pattern, e);
                        None
                    }
                }
            })
            .collect()
    })
}

/// Map tool stderr to an ErrorKind and explanation via the pattern table.
pub fn classify_stderr(stderr: &str) -> Option<(ErrorKind, &'static str)> {
    stderr_patterns()
        .iter()
        .find(|p| p.regex.is_match(stderr))
        .map(|p| (p.kind, p.explanation))
}

pub fn normalize(outcome: RawOutcome, backend: Backend, duration: Duration) -> ExecutionResult {
    let secs = duration.as_secs_f64();
    let result = match outcome {
        RawOutcome::Exited {
            code: Some(0),
            stdout,
            ..
        } => ExecutionResult::ok(truncate(stdout), secs, backend),

        RawOutcome::Exited {
            code,
            stdout,
            stderr,
        } => {
            let error = classify_exit(code, &stderr);
            ExecutionResult::failed(error, truncate(stdout), secs, backend)
        }

        RawOutcome::SpawnFailed { program, error } => {
            let kind = match error.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::BackendUnavailable,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Unknown,
            };
            let mut err =
                ExecutionError::new(kind, format!("failed to start {}: {}", program, error));
            if kind == ErrorKind::BackendUnavailable {
                err = err.with_explanation(format!(
                    "The '{}' tool isn't installed or isn't on PATH.",
                    program
                ));
            }
            ExecutionResult::failed(err, "", secs, backend)
        }

        RawOutcome::TimedOut {
            after,
            pid,
            partial_output,
        } => {
            let detail = match pid {
                Some(pid) => format!("killed process {} after {}s", pid, after.as_secs()),
                None => format!("cancelled after {}s", after.as_secs()),
            };
            ExecutionResult::failed(
                ExecutionError::new(ErrorKind::Timeout, detail),
                truncate(partial_output),
                secs,
                backend,
            )
        }

        RawOutcome::Native(Ok(output)) => ExecutionResult::ok(truncate(output), secs, backend),

        RawOutcome::Native(Err(e)) => {
            ExecutionResult::failed(translate_native(&e), "", secs, backend)
        }

        RawOutcome::Refused(error) => ExecutionResult::failed(error, "", secs, backend),
    };

    if let Some(err) = &result.error {
        if err.kind == ErrorKind::Unknown {
            warn!(backend = %backend, detail = %err.detail, "Unclassified execution error");
        }
    }
    result
}

fn classify_exit(code: Option<i32>, stderr: &str) -> ExecutionError {
    let detail = match code {
        Some(c) => format!("exit code {}: {}", c, last_lines(stderr, 20)),
        None => format!("terminated by signal: {}", last_lines(stderr, 20)),
    };

    if let Some((kind, explanation)) = classify_stderr(stderr) {
        return ExecutionError::new(kind, detail).with_explanation(explanation);
    }
    match code {
        Some(127) => ExecutionError::new(ErrorKind::BackendUnavailable, detail),
        Some(126) => ExecutionError::new(ErrorKind::PermissionDenied, detail),
        _ => ExecutionError::new(ErrorKind::Unknown, detail),
    }
}

/// Foreign error type -> taxonomy. Nothing native escapes the adapter.
pub fn translate_native(error: &NativeError) -> ExecutionError {
    let detail = error.to_string();
    match error {
        NativeError::MissingGeneration(n) => {
            ExecutionError::new(ErrorKind::MalformedInput, detail).with_explanation(format!(
                "There is no generation {}. List generations to see which exist.",
                n
            ))
        }
        NativeError::InvalidArgument(_) => ExecutionError::new(ErrorKind::MalformedInput, detail),
        NativeError::Busy(_) => ExecutionError::new(ErrorKind::ConflictingState, detail),
        NativeError::Unsupported(_) => ExecutionError::new(ErrorKind::BackendUnavailable, detail),
        NativeError::Io(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ExecutionError::new(ErrorKind::PermissionDenied, detail)
            }
            std::io::ErrorKind::NotFound => {
                ExecutionError::new(ErrorKind::BackendUnavailable, detail)
                    .with_explanation("The system profile disappeared while working on it.")
            }
            _ => ExecutionError::new(ErrorKind::Unknown, detail),
        },
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n[output truncated]");
    }
    s
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.trim().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32, stderr: &str) -> ExecutionResult {
        normalize(
            RawOutcome::Exited {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
            Backend::Fallback,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_success() {
        let r = exited(0, "warning: something harmless");
        assert!(r.success);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_stderr_table() {
        let cases = [
            ("error: attribute 'fierfox' missing", ErrorKind::PackageNotFound),
            (
                "error: selector 'nixos.nope' matches no derivations",
                ErrorKind::PackageNotFound,
            ),
            (
                "error: opening lock file '/nix/var/nix/db/big-lock': Permission denied",
                ErrorKind::PermissionDenied,
            ),
            (
                "error: collision between '/nix/store/a/bin/x' and '/nix/store/b/bin/x'",
                ErrorKind::ConflictingState,
            ),
            ("error: could not acquire lock on profile", ErrorKind::ConflictingState),
            ("error: syntax error, unexpected '}'", ErrorKind::MalformedInput),
            ("error: undefined variable 'pkgz'", ErrorKind::MalformedInput),
            ("error: No space left on device", ErrorKind::Unknown),
        ];
        for (stderr, kind) in cases {
            let r = exited(1, stderr);
            assert_eq!(r.error_kind(), Some(kind), "{}", stderr);
            assert!(r.is_consistent());
        }
    }

    #[test]
    fn test_exit_code_fallbacks() {
        assert_eq!(exited(127, "").error_kind(), Some(ErrorKind::BackendUnavailable));
        assert_eq!(exited(126, "").error_kind(), Some(ErrorKind::PermissionDenied));
        assert_eq!(exited(3, "weird").error_kind(), Some(ErrorKind::Unknown));
    }

    #[test]
    fn test_spawn_not_found() {
        let r = normalize(
            RawOutcome::SpawnFailed {
                program: "nix-env".to_string(),
                error: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
            Backend::Fallback,
            Duration::ZERO,
        );
        assert_eq!(r.error_kind(), Some(ErrorKind::BackendUnavailable));
        assert!(r.error.unwrap().explanation.contains("nix-env"));
    }

    #[test]
    fn test_timeout_is_incomplete() {
        let r = normalize(
            RawOutcome::TimedOut {
                after: Duration::from_secs(30),
                pid: Some(4242),
                partial_output: "building...".to_string(),
            },
            Backend::Fallback,
            Duration::from_secs(30),
        );
        assert_eq!(r.error_kind(), Some(ErrorKind::Timeout));
        assert!(r.incomplete);
        assert!(r.error.as_ref().unwrap().detail.contains("4242"));
        assert_eq!(r.output, "building...");
    }

    #[test]
    fn test_native_errors_translated() {
        let r = normalize(
            RawOutcome::Native(Err(NativeError::MissingGeneration(99))),
            Backend::Native,
            Duration::ZERO,
        );
        let err = r.error.unwrap();
        assert_eq!(err.kind, ErrorKind::MalformedInput);
        assert!(err.explanation.contains("99"));

        let r = normalize(
            RawOutcome::Native(Err(NativeError::Busy("profile lock".into()))),
            Backend::Native,
            Duration::ZERO,
        );
        assert_eq!(r.error_kind(), Some(ErrorKind::ConflictingState));
    }

    #[test]
    fn test_missing_generation_same_kind_on_both_backends() {
        let fallback = exited(1, "error: generation 99 does not exist");
        let native = normalize(
            RawOutcome::Native(Err(NativeError::MissingGeneration(99))),
            Backend::Native,
            Duration::ZERO,
        );
        assert_eq!(fallback.error_kind(), Some(ErrorKind::MalformedInput));
        assert_eq!(fallback.error_kind(), native.error_kind());
        assert!(fallback.error.unwrap().explanation.contains("List generations"));
    }

    #[test]
    fn test_output_truncated() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 10);
        let r = normalize(RawOutcome::Native(Ok(big)), Backend::Native, Duration::ZERO);
        assert!(r.output.len() < MAX_OUTPUT_BYTES + 32);
        assert!(r.output.ends_with("[output truncated]"));
    }
}
