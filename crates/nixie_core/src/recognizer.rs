//! Deterministic intent recognizer.
//!
//! An ordered table of regex rules over normalized text. No model, no
//! network: the same text and alias table always give the same Intent.
//!
//! Confidence:
//!   - a rule matched: 0.4 + 0.6 * coverage, where coverage is the share of
//!     tokens inside the match or known filler words
//!   - nothing matched: 0.4 * best keyword overlap, so unmatched input never
//!     reaches the default threshold
//!
//! Ranking among matching rules: tokens inside the match (specificity),
//! then covered tokens, then declaration order.

use nixie_shared::error::{NixieError, Result};
use nixie_shared::intent::{param, Intent, IntentAction};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Longest request accepted
pub const MAX_INPUT_LEN: usize = 500;

/// Words that carry no meaning for matching
const FILLER: &[&str] = &[
    "please", "can", "could", "would", "you", "i", "want", "to", "need", "me", "for", "the", "a",
    "an", "my", "now", "hey", "nixie", "just", "kindly", "do", "will", "us", "let", "some",
];

/// Words that can never be a package name
const RESERVED: &[&str] = &[
    "all",
    "old",
    "garbage",
    "generation",
    "generations",
    "everything",
    "snippet",
    "package",
    "packages",
    "some",
    "system",
    "please",
    "up",
];

const CONTRACTIONS: &[(&str, &str)] = &[
    ("what's", "what is"),
    ("that's", "that is"),
    ("it's", "it is"),
    ("don't", "do not"),
    ("doesn't", "does not"),
    ("can't", "cannot"),
    ("won't", "will not"),
    ("isn't", "is not"),
    ("i'm", "i am"),
    ("i'd", "i would"),
    ("i've", "i have"),
    ("let's", "let us"),
];

const REMOVE_PATTERN: &str =
    r"\b(?:remove|uninstall|delete) (?:(?:the|a|an|package) )?(?P<p>[a-z0-9][a-z0-9._+-]*)\b";

const INSTALL_PATTERN: &str =
    r"\b(?:install|add|get|setup|set up) (?:(?:the|a|an|package) )?(?P<p>[a-z0-9][a-z0-9._+-]*)\b";

struct RuleDef {
    action: IntentAction,
    patterns: &'static [&'static str],
    keywords: &'static [&'static str],
    /// Parameter filled from the `p` capture group
    param: Option<&'static str>,
}

// Declaration order is the final tiebreak.
fn rule_defs() -> Vec<RuleDef> {
    vec![
        RuleDef {
            action: IntentAction::SwitchGeneration,
            patterns: &[
                r"\b(?:switch|go|roll|revert)(?: back)? to generation (?:number )?(?P<p>\d+)\b",
                r"\bactivate generation (?P<p>\d+)\b",
            ],
            keywords: &["switch", "generation", "roll", "revert", "activate"],
            param: Some(param::GENERATION),
        },
        RuleDef {
            action: IntentAction::ListGenerations,
            patterns: &[
                r"\b(?:list|show)(?: (?:me|my|all|the))* (?:system )?generations\b",
                r"\bwhat generations\b",
            ],
            keywords: &["list", "show", "generations"],
            param: None,
        },
        RuleDef {
            action: IntentAction::PruneGenerations,
            patterns: &[
                r"\b(?:remove|delete|prune|clear|wipe)(?: (?:all|the|my))* old (?:system )?generations\b",
                r"\bprune generations\b",
            ],
            keywords: &["remove", "delete", "prune", "old", "generations"],
            param: None,
        },
        RuleDef {
            action: IntentAction::CollectGarbageAll,
            patterns: &[
                r"\b(?:collect|remove|delete|clean)(?: up)? all (?:the )?garbage\b",
                r"\b(?:garbage collect|gc) everything\b",
                r"\bdeep clean\b",
            ],
            keywords: &["collect", "garbage", "all", "gc", "everything", "deep"],
            param: None,
        },
        RuleDef {
            action: IntentAction::CollectGarbage,
            patterns: &[
                r"\b(?:collect|remove|clean)(?: up)?(?: the)? garbage\b",
                r"\bgarbage collect(?:ion)?\b",
                r"\brun (?:the )?(?:gc|garbage collector)\b",
                r"\bfree (?:up )?(?:some )?(?:disk )?space\b",
            ],
            keywords: &["collect", "garbage", "gc", "free", "space"],
            param: None,
        },
        RuleDef {
            action: IntentAction::CleanUp,
            patterns: &[r"\bclean ?up(?: (?:the|my))?(?: system)?\b", r"\btidy up\b"],
            keywords: &["clean", "cleanup", "tidy"],
            param: None,
        },
        RuleDef {
            action: IntentAction::ForceRemove,
            patterns: &[r"\bforce(?:fully)? (?:remove|delete) (?P<p>/nix/store/\S+|\S+)"],
            keywords: &["force", "forcefully", "remove", "delete"],
            param: Some(param::STORE_PATH),
        },
        RuleDef {
            action: IntentAction::Remove,
            patterns: &[
                REMOVE_PATTERN,
                r"\bget rid of (?:(?:the|a|an) )?(?P<p>[a-z0-9][a-z0-9._+-]*)\b",
            ],
            keywords: &["remove", "uninstall", "delete"],
            param: Some(param::PACKAGE),
        },
        RuleDef {
            action: IntentAction::Install,
            patterns: &[INSTALL_PATTERN],
            keywords: &["install", "add", "get", "setup"],
            param: Some(param::PACKAGE),
        },
        RuleDef {
            action: IntentAction::Search,
            patterns: &[
                r"\b(?:search|find|look)(?: for)?(?: (?:a|an|the))?(?: package)?(?: (?:called|named))? (?P<p>[a-z0-9][a-z0-9 ._+-]*)$",
            ],
            keywords: &["search", "find", "look"],
            param: Some(param::QUERY),
        },
        RuleDef {
            action: IntentAction::ListInstalled,
            patterns: &[
                r"\b(?:list|show)(?: (?:me|my|all|the))* (?:installed )?packages\b",
                r"\bwhat is installed\b",
                r"\bwhat do i have installed\b",
            ],
            keywords: &["list", "show", "installed", "packages"],
            param: None,
        },
        RuleDef {
            action: IntentAction::Update,
            patterns: &[r"\b(?:update|upgrade)(?: (?:my|the))?(?: (?:system|everything|nixos))?\b"],
            keywords: &["update", "upgrade", "system"],
            param: None,
        },
        RuleDef {
            action: IntentAction::Rebuild,
            patterns: &[
                r"\brebuild(?: (?:my|the))?(?: (?:system|config|configuration))?\b",
                r"\bapply (?:my |the )?(?:config|configuration|changes)\b",
            ],
            keywords: &["rebuild", "apply", "config", "configuration"],
            param: None,
        },
        RuleDef {
            action: IntentAction::Rollback,
            patterns: &[
                r"\b(?:roll ?back|undo|revert)(?: (?:the|my))?(?: (?:last|previous))?(?: (?:change|update|generation|system))?\b",
                r"\bgo back to (?:the )?(?:last|previous) generation\b",
            ],
            keywords: &["rollback", "roll", "back", "undo", "revert"],
            param: None,
        },
        RuleDef {
            action: IntentAction::ApplySnippet,
            patterns: &[r"\b(?:apply|enable|use) (?:the )?snippet (?P<p>[a-z0-9][a-z0-9._-]*)\b"],
            keywords: &["apply", "enable", "snippet"],
            param: Some(param::SNIPPET),
        },
        RuleDef {
            action: IntentAction::Help,
            patterns: &[r"\bhelp\b", r"\bwhat can you do\b"],
            keywords: &["help"],
            param: None,
        },
    ]
}

struct Rule {
    action: IntentAction,
    patterns: Vec<Regex>,
    keywords: &'static [&'static str],
    param: Option<&'static str>,
}

/// A rule hit on one input
#[derive(Debug, Clone)]
struct Candidate {
    index: usize,
    covered: usize,
    specificity: usize,
    param: Option<String>,
}

pub struct Recognizer {
    rules: Vec<Rule>,
    min_confidence: f64,
}

impl Recognizer {
    pub fn new(min_confidence: f64) -> Result<Self> {
        let mut rules = Vec::new();
        for def in rule_defs() {
            let patterns = def
                .patterns
                .iter()
                .map(|p| Regex::new(p).map_err(|e| NixieError::Pattern(format!("{}: {}", p, e))))
                .collect::<Result<Vec<_>>>()?;
            rules.push(Rule {
                action: def.action,
                patterns,
                keywords: def.keywords,
                param: def.param,
            });
        }
        Ok(Self {
            rules,
            min_confidence: min_confidence.clamp(0.0, 1.0),
        })
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Resolve text to an Intent, rewriting learned aliases first.
    ///
    /// Only structurally broken input (control characters, over-long text)
    /// is an error; anything else resolves, possibly to `unknown`.
    pub fn resolve(&self, text: &str, aliases: &BTreeMap<String, String>) -> Result<Intent> {
        validate_structure(text)?;

        let normalized = normalize(text);
        let rewritten = apply_aliases(&normalized, aliases);
        let tokens: Vec<&str> = rewritten.split_whitespace().collect();

        let mut intent = if tokens.is_empty() {
            Intent::unknown(text, 0.0)
        } else {
            self.match_rules(text, &rewritten, &tokens)
        };
        if rewritten != normalized {
            intent.rewritten = Some(rewritten);
        }

        debug!(
            action = %intent.action,
            confidence = intent.confidence,
            "resolved '{}'",
            text
        );
        Ok(intent)
    }

    fn match_rules(&self, raw: &str, text: &str, tokens: &[&str]) -> Intent {
        let total = tokens.len();
        let mut best: Option<Candidate> = None;

        for (index, rule) in self.rules.iter().enumerate() {
            let Some(candidate) = rule_candidate(index, rule, text, tokens) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => outranks(&candidate, b),
            };
            if better {
                best = Some(candidate);
            }
        }

        match best {
            Some(candidate) => {
                let coverage = candidate.covered as f64 / total as f64;
                let confidence = 0.4 + 0.6 * coverage;
                let rule = &self.rules[candidate.index];
                if confidence < self.min_confidence {
                    return Intent::unknown(raw, confidence);
                }
                let mut intent = Intent::new(rule.action, confidence, raw);
                if let (Some(key), Some(value)) = (rule.param, candidate.param) {
                    intent = intent.with_param(key, value.trim());
                }
                intent
            }
            None => Intent::unknown(raw, self.partial_score(tokens)),
        }
    }

    /// Best keyword overlap across all rules, scaled below 0.4
    fn partial_score(&self, tokens: &[&str]) -> f64 {
        let best_overlap = self
            .rules
            .iter()
            .map(|rule| tokens.iter().filter(|t| rule.keywords.contains(t)).count())
            .max()
            .unwrap_or(0);
        0.4 * best_overlap as f64 / tokens.len() as f64
    }
}

/// Strictly better only, so an earlier rule keeps a tie.
fn outranks(candidate: &Candidate, current: &Candidate) -> bool {
    (candidate.specificity, candidate.covered) > (current.specificity, current.covered)
}

fn rule_candidate(index: usize, rule: &Rule, text: &str, tokens: &[&str]) -> Option<Candidate> {
    let mut best: Option<Candidate> = None;

    for pattern in &rule.patterns {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let param = caps.name("p").map(|m| m.as_str().to_string());
        if rule.param == Some(param::PACKAGE) {
            if let Some(p) = &param {
                if RESERVED.contains(&p.as_str()) {
                    continue;
                }
            }
        }

        let specificity = whole.as_str().split_whitespace().count();
        let before = text[..whole.start()].split_whitespace();
        let after = text[whole.end()..].split_whitespace();
        let filler = before.chain(after).filter(|t| FILLER.contains(t)).count();
        let covered = (specificity + filler).min(tokens.len());

        let candidate = Candidate {
            index,
            covered,
            specificity,
            param,
        };
        let better = match &best {
            None => true,
            Some(b) => outranks(&candidate, b),
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

fn validate_structure(text: &str) -> Result<()> {
    if text.chars().count() > MAX_INPUT_LEN {
        return Err(NixieError::MalformedInput(format!(
            "request is longer than {} characters",
            MAX_INPUT_LEN
        )));
    }
    if let Some(c) = text
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(NixieError::MalformedInput(format!(
            "request contains control character U+{:04X}",
            c as u32
        )));
    }
    Ok(())
}

/// Lowercase, expand contractions, strip trailing punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let lower = text.to_lowercase().replace('\u{2019}', "'");
    let mut tokens = Vec::new();
    for raw in lower.split_whitespace() {
        let token = raw.trim_end_matches(['.', '!', '?', ',', ';', ':']);
        let token = token.trim_matches(['"', '\'', '(', ')']);
        if token.is_empty() {
            continue;
        }
        match CONTRACTIONS.iter().find(|(short, _)| *short == token) {
            Some((_, long)) => tokens.push((*long).to_string()),
            None => tokens.push(token.to_string()),
        }
    }
    tokens.join(" ")
}

/// Replace aliased tokens, following alias chains to their end.
pub fn apply_aliases(text: &str, aliases: &BTreeMap<String, String>) -> String {
    if aliases.is_empty() {
        return text.to_string();
    }
    text.split_whitespace()
        .map(|token| resolve_alias(token, aliases))
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve_alias<'a>(token: &'a str, aliases: &'a BTreeMap<String, String>) -> &'a str {
    let mut current = token;
    let mut seen = HashSet::new();
    while let Some(next) = aliases.get(current) {
        if !seen.insert(current) {
            // cycle: stop at the first repeated word
            break;
        }
        current = next.as_str();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognizer() -> Recognizer {
        Recognizer::new(0.5).unwrap()
    }

    fn resolve(text: &str) -> Intent {
        recognizer().resolve(text, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_install() {
        let intent = resolve("install firefox");
        assert_eq!(intent.action, IntentAction::Install);
        assert_eq!(intent.param(param::PACKAGE), Some("firefox"));
        assert!(intent.confidence >= 0.8);
    }

    #[test]
    fn test_install_with_filler() {
        let intent = resolve("Could you please install Firefox for me?");
        assert_eq!(intent.action, IntentAction::Install);
        assert_eq!(intent.param(param::PACKAGE), Some("firefox"));
        assert!((intent.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_beats_remove() {
        let intent = resolve("remove all old generations");
        assert_eq!(intent.action, IntentAction::PruneGenerations);
        assert!(intent.parameters.is_empty());
    }

    #[test]
    fn test_specificity_ranks_before_coverage() {
        let hit = |index, covered, specificity| Candidate {
            index,
            covered,
            specificity,
            param: None,
        };
        // wider match wins even when a narrower one sits among more filler
        assert!(outranks(&hit(1, 4, 4), &hit(0, 5, 2)));
        assert!(!outranks(&hit(1, 5, 2), &hit(0, 4, 4)));
        // same specificity: coverage decides
        assert!(outranks(&hit(1, 4, 3), &hit(0, 3, 3)));
        // full tie keeps the earlier rule
        assert!(!outranks(&hit(1, 3, 3), &hit(0, 3, 3)));

        let intent = resolve("please clean up the garbage");
        assert_eq!(intent.action, IntentAction::CollectGarbage);
    }

    #[test]
    fn test_gc_variants() {
        assert_eq!(resolve("collect garbage").action, IntentAction::CollectGarbage);
        assert_eq!(resolve("collect all garbage").action, IntentAction::CollectGarbageAll);
        assert_eq!(resolve("clean up").action, IntentAction::CleanUp);
        assert_eq!(resolve("clean up the garbage").action, IntentAction::CollectGarbage);
    }

    #[test]
    fn test_generations() {
        let intent = resolve("roll back to generation 42");
        assert_eq!(intent.action, IntentAction::SwitchGeneration);
        assert_eq!(intent.param(param::GENERATION), Some("42"));
        assert_eq!(resolve("roll back").action, IntentAction::Rollback);
        assert_eq!(resolve("undo the last change").action, IntentAction::Rollback);
        assert_eq!(resolve("list generations").action, IntentAction::ListGenerations);
    }

    #[test]
    fn test_search_multiword() {
        let intent = resolve("search for markdown editor");
        assert_eq!(intent.action, IntentAction::Search);
        assert_eq!(intent.param(param::QUERY), Some("markdown editor"));
    }

    #[test]
    fn test_contractions() {
        assert_eq!(normalize("What's  installed?"), "what is installed");
        assert_eq!(resolve("what's installed").action, IntentAction::ListInstalled);
    }

    #[test]
    fn test_force_remove_store_path() {
        let intent = resolve("force remove /nix/store/abc123-hello-2.12");
        assert_eq!(intent.action, IntentAction::ForceRemove);
        assert_eq!(
            intent.param(param::STORE_PATH),
            Some("/nix/store/abc123-hello-2.12")
        );
    }

    #[test]
    fn test_unmatched_is_unknown_with_zero() {
        let intent = resolve("grab firefox");
        assert_eq!(intent.action, IntentAction::Unknown);
        assert_eq!(intent.confidence, 0.0);
        assert!(intent.parameters.is_empty());
    }

    #[test]
    fn test_partial_overlap_below_threshold() {
        // keywords present but no rule shape
        let intent = resolve("firefox install please");
        assert_eq!(intent.action, IntentAction::Unknown);
        assert!(intent.confidence > 0.0 && intent.confidence < 0.4);
    }

    #[test]
    fn test_low_coverage_gated() {
        let intent = resolve(
            "yesterday cousin told odd story about how he wanted install firefox quickly before lunch break ended",
        );
        assert_eq!(intent.action, IntentAction::Unknown);
        assert!(intent.confidence < 0.5);
        assert!(intent.confidence > 0.4);
    }

    #[test]
    fn test_empty_input() {
        let intent = resolve("   ");
        assert_eq!(intent.action, IntentAction::Unknown);
        assert_eq!(intent.confidence, 0.0);
    }

    #[test]
    fn test_structural_errors() {
        let r = recognizer();
        assert!(matches!(
            r.resolve("install \u{0}firefox", &BTreeMap::new()),
            Err(NixieError::MalformedInput(_))
        ));
        let long = "install ".repeat(100);
        assert!(matches!(
            r.resolve(&long, &BTreeMap::new()),
            Err(NixieError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_alias_rewrite() {
        let mut aliases = BTreeMap::new();
        aliases.insert("grab".to_string(), "install".to_string());
        let intent = recognizer().resolve("grab vscode", &aliases).unwrap();
        assert_eq!(intent.action, IntentAction::Install);
        assert_eq!(intent.param(param::PACKAGE), Some("vscode"));
        assert_eq!(intent.rewritten.as_deref(), Some("install vscode"));
        assert_eq!(intent.raw_text, "grab vscode");
    }

    #[test]
    fn test_alias_chain_and_cycle() {
        let mut aliases = BTreeMap::new();
        aliases.insert("yoink".to_string(), "grab".to_string());
        aliases.insert("grab".to_string(), "install".to_string());
        assert_eq!(apply_aliases("yoink vim", &aliases), "install vim");

        aliases.insert("install".to_string(), "yoink".to_string());
        // terminates
        let out = apply_aliases("yoink vim", &aliases);
        assert!(out.ends_with(" vim"));
    }

    #[test]
    fn test_reserved_words_not_packages() {
        assert_ne!(resolve("remove all").action, IntentAction::Remove);
        assert_ne!(resolve("install everything").action, IntentAction::Install);
    }
}
