//! Pure learning state: no IO, no channels.
//!
//! The worker owns one `LearnerState` and feeds it observations in order.

use crate::recognizer::normalize;
use chrono::{DateTime, Local, Timelike, Utc};
use nixie_shared::config::LearnerConfig;
use nixie_shared::preferences::{
    AliasCandidate, Candidates, LearnedPreferences, PreferencesFile, SequenceCandidate,
};
use nixie_shared::result::{Backend, ErrorKind};
use std::collections::BTreeMap;
use tracing::{debug, info};

const ARTICLES: &[&str] = &["the", "a", "an"];

/// Solutions remembered per error signature
const MAX_SOLUTIONS: usize = 5;

/// One request outcome, as the pipeline reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub input_text: String,
    /// Label of what ran ("install firefox"); None when nothing ran
    pub executed_command: Option<String>,
    pub success: bool,
    pub error: Option<ErrorKind>,
    /// Key for error-recovery memory, set on failures
    pub signature: Option<String>,
    pub duration: f64,
    pub backend_used: Option<Backend>,
    pub at: DateTime<Utc>,
    /// Local hour of day
    pub hour: u8,
}

impl Observation {
    pub fn new(
        input_text: impl Into<String>,
        executed_command: Option<String>,
        success: bool,
        error: Option<ErrorKind>,
    ) -> Self {
        Self {
            input_text: input_text.into(),
            executed_command,
            success,
            error,
            signature: None,
            duration: 0.0,
            backend_used: None,
            at: Utc::now(),
            hour: Local::now().hour() as u8,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_timing(mut self, duration: f64, backend_used: Option<Backend>) -> Self {
        self.duration = duration;
        self.backend_used = backend_used;
        self
    }

    pub fn at_hour(mut self, hour: u8) -> Self {
        self.hour = hour % 24;
        self
    }

    /// A failure the user may correct by rephrasing: nothing was understood,
    /// or the tool rejected the name.
    fn alias_eligible(&self) -> bool {
        !self.success
            && (self.executed_command.is_none()
                || matches!(
                    self.error,
                    Some(ErrorKind::PackageNotFound) | Some(ErrorKind::MalformedInput)
                ))
    }
}

/// Where alias learning stands after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasState {
    /// Nothing pending, or a failure waiting for the next outcome
    AwaitingOutcome,
    CorrectionDetected { from: String, to: String },
    CandidateTracked { from: String, to: String, count: u32 },
    Promoted { from: String, to: String },
}

#[derive(Debug, Clone)]
struct PendingFailure {
    tokens: Vec<String>,
    signature: Option<String>,
    alias_eligible: bool,
}

#[derive(Debug, Clone)]
pub struct LearnerState {
    prefs: LearnedPreferences,
    alias_candidates: BTreeMap<(String, String), u32>,
    sequence_counts: BTreeMap<(String, String), u32>,
    pending_failure: Option<PendingFailure>,
    last_command: Option<String>,
    alias_state: AliasState,
    alias_threshold: u32,
    sequence_threshold: u32,
}

impl LearnerState {
    pub fn new(config: &LearnerConfig) -> Self {
        Self {
            prefs: LearnedPreferences::default(),
            alias_candidates: BTreeMap::new(),
            sequence_counts: BTreeMap::new(),
            pending_failure: None,
            last_command: None,
            alias_state: AliasState::AwaitingOutcome,
            alias_threshold: config.alias_threshold.max(1),
            sequence_threshold: config.sequence_threshold.max(1),
        }
    }

    pub fn preferences(&self) -> &LearnedPreferences {
        &self.prefs
    }

    pub fn alias_state(&self) -> &AliasState {
        &self.alias_state
    }

    pub fn alias_candidate_count(&self, from: &str, to: &str) -> u32 {
        self.alias_candidates
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Drop everything learned, keeping thresholds
    pub fn reset(&mut self) {
        self.prefs = LearnedPreferences::default();
        self.alias_candidates.clear();
        self.sequence_counts.clear();
        self.pending_failure = None;
        self.last_command = None;
        self.alias_state = AliasState::AwaitingOutcome;
    }

    pub fn observe(&mut self, obs: &Observation) -> &AliasState {
        if let Some(command) = &obs.executed_command {
            *self.prefs.command_frequency.entry(command.clone()).or_insert(0) += 1;
        }
        self.prefs.active_hours.insert(obs.hour);
        *self.prefs.hour_histogram.entry(obs.hour).or_insert(0) += 1;

        if obs.success {
            let pending = self.pending_failure.take();
            self.alias_state = match &pending {
                Some(failure) if failure.alias_eligible => {
                    self.track_correction(&failure.tokens, &tokens_of(&obs.input_text))
                }
                _ => AliasState::AwaitingOutcome,
            };
            if let Some(command) = &obs.executed_command {
                if let Some(signature) = pending.and_then(|f| f.signature) {
                    self.remember_solution(signature, command);
                }
                self.track_sequence(command);
            }
        } else {
            // sequences only pair a command with the one right before it
            self.last_command = None;
            self.pending_failure = Some(PendingFailure {
                tokens: tokens_of(&obs.input_text),
                signature: obs.signature.clone(),
                alias_eligible: obs.alias_eligible(),
            });
            self.alias_state = AliasState::AwaitingOutcome;
        }

        &self.alias_state
    }

    fn track_correction(&mut self, failed: &[String], succeeded: &[String]) -> AliasState {
        match single_substitution(failed, succeeded) {
            Some((from, to)) => self.advance(AliasState::CorrectionDetected { from, to }),
            None => AliasState::AwaitingOutcome,
        }
    }

    fn advance(&mut self, state: AliasState) -> AliasState {
        let AliasState::CorrectionDetected { from, to } = state else {
            return state;
        };
        if self.prefs.aliases.get(&from) == Some(&to) {
            return AliasState::Promoted { from, to };
        }

        let key = (from.clone(), to.clone());
        let count = {
            let entry = self.alias_candidates.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < self.alias_threshold {
            debug!("Alias candidate '{}' -> '{}' seen {} times", from, to, count);
            return AliasState::CandidateTracked { from, to, count };
        }

        self.alias_candidates.remove(&key);
        info!("Learned alias '{}' -> '{}'", from, to);
        self.prefs.aliases.insert(from.clone(), to.clone());
        AliasState::Promoted { from, to }
    }

    fn track_sequence(&mut self, command: &str) {
        if let Some(previous) = self.last_command.replace(command.to_string()) {
            if previous == command {
                return;
            }
            let key = (previous, command.to_string());
            let count = {
                let entry = self.sequence_counts.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let pair = vec![key.0.clone(), key.1.clone()];
            if count >= self.sequence_threshold && !self.prefs.sequences.contains(&pair) {
                info!("Learned command sequence: {} -> {}", key.0, key.1);
                self.sequence_counts.remove(&key);
                self.prefs.sequences.push(pair);
            }
        }
    }

    fn remember_solution(&mut self, signature: String, command: &str) {
        let solutions = self.prefs.error_solutions.entry(signature.clone()).or_default();
        solutions.retain(|s| s != command);
        solutions.push(command.to_string());
        if solutions.len() > MAX_SOLUTIONS {
            solutions.remove(0);
        }
        info!("Learned error recovery: {} -> {}", signature, command);
    }

    // =========================================================================
    // Persistence records
    // =========================================================================

    pub fn to_file(&self) -> PreferencesFile {
        let candidates = Candidates {
            aliases: self
                .alias_candidates
                .iter()
                .map(|((from, to), count)| AliasCandidate {
                    from: from.clone(),
                    to: to.clone(),
                    count: *count,
                })
                .collect(),
            sequences: self
                .sequence_counts
                .iter()
                .map(|((first, next), count)| SequenceCandidate {
                    first: first.clone(),
                    next: next.clone(),
                    count: *count,
                })
                .collect(),
        };
        PreferencesFile::new(self.prefs.clone(), candidates)
    }

    pub fn restore(&mut self, file: PreferencesFile) {
        self.prefs = file.preferences;
        self.alias_candidates = file
            .candidates
            .aliases
            .into_iter()
            .map(|c| ((c.from, c.to), c.count))
            .collect();
        self.sequence_counts = file
            .candidates
            .sequences
            .into_iter()
            .map(|c| ((c.first, c.next), c.count))
            .collect();
    }
}

fn tokens_of(text: &str) -> Vec<String> {
    normalize(text).split_whitespace().map(str::to_string).collect()
}

/// The one (failed, succeeded) token pair when the two inputs differ in
/// exactly one position. Articles never become aliases.
fn single_substitution(failed: &[String], succeeded: &[String]) -> Option<(String, String)> {
    if failed.len() != succeeded.len() {
        return None;
    }
    let mut diffs = failed.iter().zip(succeeded).filter(|(f, s)| f != s);
    let (from, to) = diffs.next()?;
    if diffs.next().is_some() || ARTICLES.contains(&from.as_str()) {
        return None;
    }
    Some((from.clone(), to.clone()))
}
